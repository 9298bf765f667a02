use std::time::Duration;

use crate::adapters::tool::AdapterResult;
use crate::execution::{
    ProcessExecutor, ProcessExitStatus, ProcessOutput, ProcessSpawnRequest,
    ProcessTerminationMode, spawn_validated,
};
use crate::models::{CoreError, CoreErrorKind};
use crate::orchestration::TaskCancellationToken;

const TERMINATE_WAIT: Duration = Duration::from_secs(2);

/// Runs a tool process to completion on the current blocking thread and returns stdout.
///
/// Must be called from a thread with a tokio runtime context, such as
/// `spawn_blocking`; without one the call fails with `Internal`.
///
/// Exit codes outside `accepted_exit_codes` are failures. Cancellation sends
/// SIGTERM to the process group and escalates to SIGKILL if it lingers.
pub(crate) fn run_and_collect(
    executor: &dyn ProcessExecutor,
    request: ProcessSpawnRequest,
    cancellation: &TaskCancellationToken,
    accepted_exit_codes: &[i32],
) -> AdapterResult<String> {
    let attribution = request.attribute(CoreError::new(CoreErrorKind::Internal, ""));
    let attribute = |kind: CoreErrorKind, message: String| CoreError {
        kind,
        message,
        ..attribution.clone()
    };

    if cancellation.is_cancelled() {
        return Err(attribute(
            CoreErrorKind::Cancelled,
            "adapter call was cancelled before the process started".to_string(),
        ));
    }

    let handle = tokio::runtime::Handle::try_current().map_err(|error| {
        attribute(
            CoreErrorKind::Internal,
            format!("tool processes must run on a tokio blocking thread: {error}"),
        )
    })?;
    let process = spawn_validated(executor, request)?;

    let output: ProcessOutput = handle.block_on(async {
        let mut wait = process.wait();
        tokio::select! {
            output = &mut wait => output,
            _ = cancellation.cancelled() => {
                let _ = process.terminate(ProcessTerminationMode::Graceful {
                    grace_period: TERMINATE_WAIT,
                });
                if tokio::time::timeout(TERMINATE_WAIT, &mut wait).await.is_err() {
                    let _ = process.terminate(ProcessTerminationMode::Immediate);
                }
                Err(attribute(
                    CoreErrorKind::Cancelled,
                    "tool process was terminated after cancellation".to_string(),
                ))
            }
        }
    })?;

    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    match output.status {
        ProcessExitStatus::ExitCode(code) if accepted_exit_codes.contains(&code) => {
            if code != 0 {
                tracing::debug!(
                    adapter = attribution.adapter.as_deref().unwrap_or_default(),
                    exit_code = code,
                    "tool exited with accepted non-zero status"
                );
            }
            String::from_utf8(output.stdout).map_err(|error| {
                attribute(
                    CoreErrorKind::ParseFailure,
                    format!("process stdout is not valid UTF-8: {error}"),
                )
            })
        }
        ProcessExitStatus::ExitCode(code) => Err(attribute(
            CoreErrorKind::ProcessFailure,
            format!("process exited with code {code}: {}", stderr.trim()),
        )),
        ProcessExitStatus::Terminated => Err(attribute(
            CoreErrorKind::ProcessFailure,
            "process was terminated by signal".to_string(),
        )),
    }
}

pub(crate) fn run_and_collect_stdout(
    executor: &dyn ProcessExecutor,
    request: ProcessSpawnRequest,
    cancellation: &TaskCancellationToken,
) -> AdapterResult<String> {
    run_and_collect(executor, request, cancellation, &[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{CommandSpec, TokioProcessExecutor};

    #[test]
    fn run_without_a_runtime_is_an_internal_error() {
        let request = ProcessSpawnRequest::new("nmap", CommandSpec::new("/bin/true"));

        let error = run_and_collect_stdout(
            &TokioProcessExecutor,
            request,
            &TaskCancellationToken::new(),
        )
        .unwrap_err();

        assert_eq!(error.kind, CoreErrorKind::Internal);
        assert_eq!(error.adapter.as_deref(), Some("nmap"));
    }
}
