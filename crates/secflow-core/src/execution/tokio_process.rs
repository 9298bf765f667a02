use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use tokio::io::AsyncReadExt;

use crate::execution::{
    ExecutionResult, ProcessExecutor, ProcessExitStatus, ProcessOutput, ProcessSpawnRequest,
    ProcessTerminationMode, ProcessWaitFuture, RunningProcess,
};
use crate::models::{CoreError, CoreErrorKind, TaskId, WorkflowId};

const OUTPUT_READ_DEADLINE: Duration = Duration::from_millis(250);

#[derive(Clone, Copy, Debug, Default)]
pub struct TokioProcessExecutor;

impl ProcessExecutor for TokioProcessExecutor {
    fn spawn(&self, request: ProcessSpawnRequest) -> ExecutionResult<Box<dyn RunningProcess>> {
        let mut cmd = tokio::process::Command::new(&request.command.program);
        cmd.args(&request.command.args);

        for (key, value) in &request.command.env {
            cmd.env(key, value);
        }

        if let Some(dir) = &request.command.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let attribution = Attribution {
            adapter: request.adapter.clone(),
            workflow: request.workflow,
            task: request.task.clone(),
        };

        let child = cmd.spawn().map_err(|error| {
            let kind = if error.kind() == std::io::ErrorKind::NotFound {
                CoreErrorKind::NotInstalled
            } else {
                CoreErrorKind::ProcessFailure
            };
            attribution.error(
                kind,
                format!(
                    "failed to spawn '{}': {error}",
                    request.command.program.display()
                ),
            )
        })?;

        let pid = child.id();
        tracing::debug!(
            adapter = %request.adapter,
            pid = ?pid,
            program = %request.command.program.display(),
            "spawned tool process"
        );

        Ok(Box::new(TokioRunningProcess {
            child: Mutex::new(Some(child)),
            pid,
            started_at: SystemTime::now(),
            timeout: request.timeout,
            attribution,
        }))
    }
}

#[derive(Clone, Debug)]
struct Attribution {
    adapter: String,
    workflow: Option<WorkflowId>,
    task: Option<TaskId>,
}

impl Attribution {
    fn error(&self, kind: CoreErrorKind, message: String) -> CoreError {
        CoreError {
            workflow: self.workflow,
            task: self.task.clone(),
            adapter: Some(self.adapter.clone()),
            kind,
            message,
        }
    }
}

struct TokioRunningProcess {
    child: Mutex<Option<tokio::process::Child>>,
    pid: Option<u32>,
    started_at: SystemTime,
    timeout: Option<Duration>,
    attribution: Attribution,
}

impl RunningProcess for TokioRunningProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn terminate(&self, mode: ProcessTerminationMode) -> ExecutionResult<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        signal_process_group(pid, mode).map_err(|message| {
            self.attribution
                .error(CoreErrorKind::ProcessFailure, message)
        })
    }

    fn wait(&self) -> ProcessWaitFuture {
        let child = self
            .child
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        let timeout = self.timeout;
        let started_at = self.started_at;
        let attribution = self.attribution.clone();
        let pid = self.pid;

        Box::pin(async move {
            let mut child = child.ok_or_else(|| {
                attribution.error(
                    CoreErrorKind::ProcessFailure,
                    "child process already consumed".to_string(),
                )
            })?;

            let stdout_reader = {
                let stdout = child.stdout.take();
                tokio::spawn(async move {
                    let mut buffer = Vec::new();
                    if let Some(mut handle) = stdout {
                        let _ = handle.read_to_end(&mut buffer).await;
                    }
                    buffer
                })
            };
            let stderr_reader = {
                let stderr = child.stderr.take();
                tokio::spawn(async move {
                    let mut buffer = Vec::new();
                    if let Some(mut handle) = stderr {
                        let _ = handle.read_to_end(&mut buffer).await;
                    }
                    buffer
                })
            };

            let wait_err = |error: std::io::Error| {
                attribution.error(
                    CoreErrorKind::ProcessFailure,
                    format!("failed to wait for process: {error}"),
                )
            };

            // Output is collected after exit within a bounded window; grandchildren
            // may keep the pipes open indefinitely.
            let status = if let Some(timeout_duration) = timeout {
                match tokio::time::timeout(timeout_duration, child.wait()).await {
                    Ok(result) => result.map_err(wait_err)?,
                    Err(_) => {
                        if let Some(pid) = pid {
                            let _ = signal_process_group(pid, ProcessTerminationMode::Immediate);
                        }
                        let _ = child.start_kill();
                        let _ = tokio::time::timeout(Duration::from_secs(1), child.wait()).await;
                        stdout_reader.abort();
                        stderr_reader.abort();
                        return Err(attribution.error(
                            CoreErrorKind::Timeout,
                            format!(
                                "process timed out after {}ms",
                                timeout_duration.as_millis()
                            ),
                        ));
                    }
                }
            } else {
                child.wait().await.map_err(wait_err)?
            };

            let stdout = match tokio::time::timeout(OUTPUT_READ_DEADLINE, stdout_reader).await {
                Ok(Ok(buffer)) => buffer,
                _ => Vec::new(),
            };
            let stderr = match tokio::time::timeout(OUTPUT_READ_DEADLINE, stderr_reader).await {
                Ok(Ok(buffer)) => buffer,
                _ => Vec::new(),
            };

            let status = match status.code() {
                Some(code) => ProcessExitStatus::ExitCode(code),
                None => ProcessExitStatus::Terminated,
            };

            Ok(ProcessOutput {
                status,
                stdout,
                stderr,
                started_at,
                finished_at: SystemTime::now(),
            })
        })
    }
}

#[cfg(unix)]
fn signal_process_group(pid: u32, mode: ProcessTerminationMode) -> Result<(), String> {
    let signal = match mode {
        ProcessTerminationMode::Immediate => libc::SIGKILL,
        ProcessTerminationMode::Graceful { .. } => libc::SIGTERM,
    };

    let pgid = -(pid as libc::pid_t);
    let result = unsafe { libc::kill(pgid, signal) };

    if result != 0 {
        let os_error = std::io::Error::last_os_error();
        if os_error.raw_os_error() != Some(libc::ESRCH) {
            return Err(format!(
                "failed to send signal {signal} to process group {pid}: {os_error}"
            ));
        }
    }

    Ok(())
}

#[cfg(not(unix))]
fn signal_process_group(_pid: u32, _mode: ProcessTerminationMode) -> Result<(), String> {
    Ok(())
}
