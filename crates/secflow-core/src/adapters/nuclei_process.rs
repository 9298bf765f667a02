use std::path::PathBuf;
use std::sync::Arc;

use crate::adapters::nuclei::{NucleiSource, nuclei_scan_request};
use crate::adapters::process_utils::run_and_collect_stdout;
use crate::adapters::tool::{AdapterRequest, AdapterResult};
use crate::execution::ProcessExecutor;

pub struct ProcessNucleiSource {
    executor: Arc<dyn ProcessExecutor>,
    binary: PathBuf,
}

impl ProcessNucleiSource {
    pub fn new(executor: Arc<dyn ProcessExecutor>, binary: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            binary: binary.into(),
        }
    }
}

impl NucleiSource for ProcessNucleiSource {
    fn scan(&self, request: &AdapterRequest) -> AdapterResult<String> {
        let mut spawn = nuclei_scan_request(request);
        spawn.command.program = self.binary.clone();
        // No update checks mid-scan.
        spawn.command = spawn.command.arg("-duc");
        run_and_collect_stdout(self.executor.as_ref(), spawn, &request.cancellation)
    }
}
