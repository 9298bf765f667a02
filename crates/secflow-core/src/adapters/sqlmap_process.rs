use std::path::PathBuf;
use std::sync::Arc;

use crate::adapters::process_utils::run_and_collect_stdout;
use crate::adapters::sqlmap::{SqlmapSource, sqlmap_request};
use crate::adapters::tool::{AdapterRequest, AdapterResult};
use crate::execution::ProcessExecutor;

pub struct ProcessSqlmapSource {
    executor: Arc<dyn ProcessExecutor>,
    binary: PathBuf,
}

impl ProcessSqlmapSource {
    pub fn new(executor: Arc<dyn ProcessExecutor>, binary: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            binary: binary.into(),
        }
    }
}

impl SqlmapSource for ProcessSqlmapSource {
    fn run(&self, request: &AdapterRequest) -> AdapterResult<String> {
        let mut spawn = sqlmap_request(request);
        spawn.command.program = self.binary.clone();
        run_and_collect_stdout(self.executor.as_ref(), spawn, &request.cancellation)
    }
}
