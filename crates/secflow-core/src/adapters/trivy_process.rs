use std::path::PathBuf;
use std::sync::Arc;

use crate::adapters::process_utils::run_and_collect_stdout;
use crate::adapters::tool::{AdapterRequest, AdapterResult};
use crate::adapters::trivy::{TrivySource, trivy_image_request};
use crate::execution::ProcessExecutor;

pub struct ProcessTrivySource {
    executor: Arc<dyn ProcessExecutor>,
    binary: PathBuf,
}

impl ProcessTrivySource {
    pub fn new(executor: Arc<dyn ProcessExecutor>, binary: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            binary: binary.into(),
        }
    }
}

impl TrivySource for ProcessTrivySource {
    fn scan_image(&self, request: &AdapterRequest) -> AdapterResult<String> {
        let mut spawn = trivy_image_request(request);
        spawn.command.program = self.binary.clone();
        run_and_collect_stdout(self.executor.as_ref(), spawn, &request.cancellation)
    }
}
