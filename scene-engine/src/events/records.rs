// Execution Records
// Structured, fire-and-forget log records emitted by every engine component

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution records
pub type RecordSender = mpsc::UnboundedSender<LogRecord>;

/// Receiver for execution records
pub type RecordReceiver = mpsc::UnboundedReceiver<LogRecord>;

/// Create a new record channel
pub fn record_channel() -> (RecordSender, RecordReceiver) {
    mpsc::unbounded_channel()
}

/// What a record is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// Condition registered, triggered or removed
    Condition,
    /// Scene phase transition
    Phase,
    /// Scene settlement
    Scene,
    /// Scenario settlement
    Scenario,
    /// Orchestrated unit settlement
    Unit,
    /// Whole scenario execution run
    Execution,
    /// Transport control change
    Simulation,
}

/// Outcome carried by a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordResult {
    Started,
    Success,
    Failure,
    Skipped,
    Stopped,
    Info,
}

/// A structured execution record
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub kind: RecordKind,
    /// Scene, unit or condition name
    pub name: String,
    /// Slash-separated location, e.g. `scene/dock/post_conditions`
    pub path: String,
    pub result: RecordResult,
    pub timestamp: DateTime<Utc>,
    pub duration: Option<Duration>,
    pub message: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl LogRecord {
    pub fn new(
        kind: RecordKind,
        name: impl Into<String>,
        path: impl Into<String>,
        result: RecordResult,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            path: path.into(),
            result,
            timestamp: Utc::now(),
            duration: None,
            message: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Mirror the record into `tracing`
    pub fn trace(&self) {
        let duration_ms = self.duration.map(|d| d.as_millis() as u64);
        let message = self.message.as_deref().unwrap_or("");

        match self.result {
            RecordResult::Failure => tracing::warn!(
                kind = ?self.kind,
                name = %self.name,
                path = %self.path,
                duration_ms,
                "{}",
                message
            ),
            RecordResult::Success | RecordResult::Stopped | RecordResult::Skipped => {
                tracing::info!(
                    kind = ?self.kind,
                    name = %self.name,
                    path = %self.path,
                    result = ?self.result,
                    duration_ms,
                    "{}",
                    message
                )
            }
            RecordResult::Started | RecordResult::Info => tracing::debug!(
                kind = ?self.kind,
                name = %self.name,
                path = %self.path,
                result = ?self.result,
                "{}",
                message
            ),
        }
    }
}

/// Helper trait for emitting records, ignoring a closed receiver
pub trait RecordSink {
    fn send_record(&self, record: LogRecord);

    /// Trace the record and forward it to the sink
    fn emit(&self, record: LogRecord) {
        record.trace();
        self.send_record(record);
    }
}

impl RecordSink for RecordSender {
    fn send_record(&self, record: LogRecord) {
        let _ = self.send(record);
    }
}

impl RecordSink for Option<RecordSender> {
    fn send_record(&self, record: LogRecord) {
        if let Some(sender) = self {
            let _ = sender.send(record);
        }
    }
}
