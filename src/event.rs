use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Mutex;

/// Typed lifecycle events. `Queued`, `Registered` and `InitError` are emitted
/// by the supervisor; the rest originate from maintainer policies. The base
/// maintainer interprets `Init`, `Ended` and `Failed` to advance its state
/// machine, everything else is informational.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Queued,
    Registered,
    Init,
    Ended,
    Failed,
    InitError,
    SubmissionError,
    Info(String),
}

impl EventKind {
    pub fn code(&self) -> &str {
        match self {
            EventKind::Queued => "JOB_QUEUED",
            EventKind::Registered => "JOB_REGISTERED",
            EventKind::Init => "JOB_INIT",
            EventKind::Ended => "JOB_ENDED",
            EventKind::Failed => "JOB_FAILED",
            EventKind::InitError => "JOB_INIT_ERROR",
            EventKind::SubmissionError => "JOB_SUBMISSION_ERROR",
            EventKind::Info(code) => code,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job_id: String,
    pub kind: EventKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(job_id: impl Into<String>, kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Receives drained events and log lines for persistence or streaming.
/// The supervisor forwards each drained batch exactly once.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn events(&self, events: Vec<JobEvent>);
    async fn logs(&self, job_id: &str, lines: Vec<String>);
}

/// Default sink for the daemon: forwards everything to `tracing`.
#[derive(Debug, Default)]
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn events(&self, events: Vec<JobEvent>) {
        for event in events {
            tracing::info!(
                job = %event.job_id,
                code = %event.kind.code(),
                "{}",
                event.message
            );
        }
    }

    async fn logs(&self, job_id: &str, lines: Vec<String>) {
        for line in lines {
            tracing::debug!(job = %job_id, "{line}");
        }
    }
}

/// Recording sink for tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<JobEvent>>,
    logs: Mutex<Vec<(String, String)>>,
}

impl MemorySink {
    pub fn recorded_events(&self) -> Vec<JobEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn recorded_logs(&self) -> Vec<(String, String)> {
        self.logs.lock().unwrap().clone()
    }

    pub fn codes_for(&self, job_id: &str) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.job_id == job_id)
            .map(|e| e.kind.code().to_string())
            .collect()
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn events(&self, events: Vec<JobEvent>) {
        self.events.lock().unwrap().extend(events);
    }

    async fn logs(&self, job_id: &str, lines: Vec<String>) {
        let mut logs = self.logs.lock().unwrap();
        for line in lines {
            logs.push((job_id.to_string(), line));
        }
    }
}
