use std::path::PathBuf;
use std::sync::Arc;

use crate::adapters::nikto::{NIKTO_ACCEPTED_EXIT_CODES, NiktoSource, nikto_scan_request};
use crate::adapters::process_utils::run_and_collect;
use crate::adapters::tool::{AdapterRequest, AdapterResult};
use crate::execution::ProcessExecutor;

pub struct ProcessNiktoSource {
    executor: Arc<dyn ProcessExecutor>,
    binary: PathBuf,
}

impl ProcessNiktoSource {
    pub fn new(executor: Arc<dyn ProcessExecutor>, binary: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            binary: binary.into(),
        }
    }
}

impl NiktoSource for ProcessNiktoSource {
    fn scan(&self, request: &AdapterRequest) -> AdapterResult<String> {
        let mut spawn = nikto_scan_request(request);
        spawn.command.program = self.binary.clone();
        run_and_collect(
            self.executor.as_ref(),
            spawn,
            &request.cancellation,
            NIKTO_ACCEPTED_EXIT_CODES,
        )
    }
}
