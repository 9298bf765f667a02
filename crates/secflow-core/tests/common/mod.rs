#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use secflow_core::adapters::{AdapterRequest, AdapterResult, ToolAdapter};
use secflow_core::models::{
    AdapterDescriptor, CoreError, CoreErrorKind, Finding, Severity, TaskId, ToolCategory,
    ToolResult, ToolStatus,
};
use secflow_core::registry::AdapterRegistry;

#[derive(Clone, Debug)]
pub enum Behavior {
    Succeed(Vec<Finding>),
    Fail,
    /// Returns a failed result that still carries findings.
    PartialFailure(Vec<Finding>),
    Panic,
    /// Sleeps for the duration, ignoring cancellation.
    Sleep(Duration),
    /// Runs until the request's cancellation token fires.
    UntilCancelled,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CallEvent {
    Started(TaskId),
    Finished(TaskId),
}

/// Test adapter whose outcome is scripted per task id. Unscripted tasks
/// succeed after a short pause.
pub struct ScriptedAdapter {
    descriptor: AdapterDescriptor,
    behaviors: Mutex<HashMap<TaskId, Behavior>>,
    events: Mutex<Vec<CallEvent>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    pause: Duration,
}

impl ScriptedAdapter {
    pub fn named(name: &'static str) -> Self {
        Self::with_descriptor(AdapterDescriptor {
            name,
            display_name: name,
            category: ToolCategory::Custom,
            options: &[],
            default_timeout: None,
            functional: true,
        })
    }

    pub fn with_descriptor(descriptor: AdapterDescriptor) -> Self {
        Self {
            descriptor,
            behaviors: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            pause: Duration::from_millis(20),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.descriptor.default_timeout = Some(timeout);
        self
    }

    pub fn pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub fn script(self, task: &str, behavior: Behavior) -> Self {
        self.behaviors
            .lock()
            .unwrap()
            .insert(TaskId::new(task), behavior);
        self
    }

    pub fn events(&self) -> Vec<CallEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn invoked(&self, task: &str) -> bool {
        self.events()
            .iter()
            .any(|event| *event == CallEvent::Started(TaskId::new(task)))
    }

    pub fn invocation_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, CallEvent::Started(_)))
            .count()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn position(&self, event: &CallEvent) -> Option<usize> {
        self.events().iter().position(|candidate| candidate == event)
    }

    /// True when `task` finished before `later` started.
    pub fn finished_before_started(&self, task: &str, later: &str) -> bool {
        match (
            self.position(&CallEvent::Finished(TaskId::new(task))),
            self.position(&CallEvent::Started(TaskId::new(later))),
        ) {
            (Some(finished), Some(started)) => finished < started,
            _ => false,
        }
    }

    /// True when both tasks were in flight at the same time.
    pub fn overlapped(&self, first: &str, second: &str) -> bool {
        let started_first = self.position(&CallEvent::Started(TaskId::new(first)));
        let started_second = self.position(&CallEvent::Started(TaskId::new(second)));
        let finished_first = self.position(&CallEvent::Finished(TaskId::new(first)));
        let finished_second = self.position(&CallEvent::Finished(TaskId::new(second)));
        match (started_first, started_second, finished_first, finished_second) {
            (Some(sf), Some(ss), Some(ff), Some(fs)) => sf < fs && ss < ff,
            _ => false,
        }
    }

    fn record(&self, event: CallEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl ToolAdapter for ScriptedAdapter {
    fn descriptor(&self) -> &AdapterDescriptor {
        &self.descriptor
    }

    fn execute(&self, request: AdapterRequest) -> AdapterResult<ToolResult> {
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&request.task)
            .cloned()
            .unwrap_or(Behavior::Succeed(Vec::new()));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.record(CallEvent::Started(request.task.clone()));

        let outcome = match behavior {
            Behavior::Succeed(findings) => {
                std::thread::sleep(self.pause);
                Ok(ToolResult::completed(
                    self.descriptor.name,
                    format!("scanned {}", request.target),
                    findings,
                ))
            }
            Behavior::Fail => {
                std::thread::sleep(self.pause);
                Err(CoreError::new(CoreErrorKind::ProcessFailure, "scripted failure")
                    .with_adapter(self.descriptor.name))
            }
            Behavior::PartialFailure(findings) => {
                std::thread::sleep(self.pause);
                let mut result = ToolResult::completed(self.descriptor.name, String::new(), findings);
                result.status = ToolStatus::Failed;
                result.error = Some("tool exited with status 2".to_string());
                Ok(result)
            }
            Behavior::Panic => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                self.record(CallEvent::Finished(request.task.clone()));
                panic!("scripted panic");
            }
            Behavior::Sleep(duration) => {
                std::thread::sleep(duration);
                Ok(ToolResult::completed(self.descriptor.name, String::new(), Vec::new()))
            }
            Behavior::UntilCancelled => {
                let deadline = Instant::now() + Duration::from_secs(10);
                while !request.cancellation.is_cancelled() && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(CoreError::new(CoreErrorKind::Cancelled, "stopped on request")
                    .with_adapter(self.descriptor.name))
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.record(CallEvent::Finished(request.task.clone()));
        outcome
    }
}

pub fn finding(title: &str, severity: Severity) -> Finding {
    Finding::new(title, severity, "example.com")
}

pub fn registry_with(adapters: Vec<Arc<ScriptedAdapter>>) -> AdapterRegistry {
    let mut builder = AdapterRegistry::builder();
    for adapter in adapters {
        let name = adapter.descriptor().name;
        builder.register(name, adapter).unwrap();
    }
    builder.build()
}
