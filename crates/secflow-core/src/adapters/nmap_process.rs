use std::path::PathBuf;
use std::sync::Arc;

use crate::adapters::nmap::{NmapSource, nmap_scan_request};
use crate::adapters::process_utils::run_and_collect_stdout;
use crate::adapters::tool::{AdapterRequest, AdapterResult};
use crate::execution::ProcessExecutor;

pub struct ProcessNmapSource {
    executor: Arc<dyn ProcessExecutor>,
    binary: PathBuf,
}

impl ProcessNmapSource {
    pub fn new(executor: Arc<dyn ProcessExecutor>, binary: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            binary: binary.into(),
        }
    }
}

impl NmapSource for ProcessNmapSource {
    fn scan(&self, request: &AdapterRequest) -> AdapterResult<String> {
        let mut spawn = nmap_scan_request(request);
        spawn.command.program = self.binary.clone();
        run_and_collect_stdout(self.executor.as_ref(), spawn, &request.cancellation)
    }
}
