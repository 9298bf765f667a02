#![cfg(unix)]

use std::time::Duration;

use secflow_core::execution::{
    CommandSpec, ProcessExitStatus, ProcessSpawnRequest, ProcessTerminationMode,
    TokioProcessExecutor, spawn_validated,
};
use secflow_core::models::{CoreErrorKind, TaskId, WorkflowId};

fn echo_request() -> ProcessSpawnRequest {
    ProcessSpawnRequest::new("nmap", CommandSpec::new("/bin/echo").arg("hello"))
}

fn sleep_request() -> ProcessSpawnRequest {
    ProcessSpawnRequest::new("nikto", CommandSpec::new("/bin/sleep").arg("30"))
        .workflow(WorkflowId(4))
        .task(TaskId::new("web"))
}

#[tokio::test]
async fn spawns_echo_and_captures_stdout() {
    let executor = TokioProcessExecutor;
    let handle = spawn_validated(&executor, echo_request()).expect("spawn should succeed");

    assert!(handle.pid().is_some());

    let output = handle.wait().await.expect("wait should succeed");
    assert_eq!(output.status, ProcessExitStatus::ExitCode(0));
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
    assert!(output.started_at <= output.finished_at);
}

#[tokio::test]
async fn nonzero_exit_is_reported_not_raised() {
    let executor = TokioProcessExecutor;
    let request = ProcessSpawnRequest::new("sqlmap", CommandSpec::new("/usr/bin/false"));

    let handle = spawn_validated(&executor, request).expect("spawn should succeed");
    let output = handle.wait().await.expect("wait should succeed");

    assert_eq!(output.status, ProcessExitStatus::ExitCode(1));
}

#[tokio::test]
async fn timeout_kills_process_and_attributes_the_task() {
    let executor = TokioProcessExecutor;
    let request = sleep_request().timeout(Duration::from_millis(100));

    let handle = spawn_validated(&executor, request).expect("spawn should succeed");
    let error = handle.wait().await.expect_err("should time out");

    assert_eq!(error.kind, CoreErrorKind::Timeout);
    assert_eq!(error.adapter.as_deref(), Some("nikto"));
    assert_eq!(error.workflow, Some(WorkflowId(4)));
    assert_eq!(error.task, Some(TaskId::new("web")));
}

#[tokio::test]
async fn immediate_terminate_kills_process() {
    let executor = TokioProcessExecutor;
    let handle = spawn_validated(&executor, sleep_request()).expect("spawn should succeed");

    handle
        .terminate(ProcessTerminationMode::Immediate)
        .expect("terminate should succeed");

    let output = handle.wait().await.expect("wait should succeed");
    assert_eq!(output.status, ProcessExitStatus::Terminated);
}

#[tokio::test]
async fn graceful_terminate_sends_sigterm() {
    let executor = TokioProcessExecutor;
    let handle = spawn_validated(&executor, sleep_request()).expect("spawn should succeed");

    handle
        .terminate(ProcessTerminationMode::Graceful {
            grace_period: Duration::from_secs(5),
        })
        .expect("terminate should succeed");

    let output = handle.wait().await.expect("wait should succeed");
    assert_eq!(output.status, ProcessExitStatus::Terminated);
}

#[tokio::test]
async fn missing_binary_is_not_installed() {
    let executor = TokioProcessExecutor;
    let request = ProcessSpawnRequest::new("trivy", CommandSpec::new("/nonexistent/trivy"));

    let error = match spawn_validated(&executor, request) {
        Err(error) => error,
        Ok(_) => panic!("expected spawn to fail for a missing binary"),
    };

    assert_eq!(error.kind, CoreErrorKind::NotInstalled);
    assert_eq!(error.adapter.as_deref(), Some("trivy"));
}

#[tokio::test]
async fn empty_arguments_are_rejected_before_spawn() {
    let executor = TokioProcessExecutor;
    let request = ProcessSpawnRequest::new("nmap", CommandSpec::new("/bin/echo").arg(""));

    let error = match spawn_validated(&executor, request) {
        Err(error) => error,
        Ok(_) => panic!("expected validation to reject an empty argument"),
    };
    assert_eq!(error.kind, CoreErrorKind::InvalidInput);
}

#[tokio::test]
async fn env_vars_are_passed_to_child() {
    let executor = TokioProcessExecutor;
    let request = ProcessSpawnRequest::new(
        "nuclei",
        CommandSpec::new("/usr/bin/env").env("SECFLOW_TEST_VAR", "test_value_42"),
    );

    let handle = spawn_validated(&executor, request).expect("spawn should succeed");
    let output = handle.wait().await.expect("wait should succeed");

    assert_eq!(output.status, ProcessExitStatus::ExitCode(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("SECFLOW_TEST_VAR=test_value_42"),
        "expected env var in output, got: {stdout}"
    );
}
