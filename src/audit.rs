//! Append-only audit logger and event bus (spec.md §4.10, §6 "Event bus
//! contract").
//!
//! Grounded in the teacher's `causal_chain::CausalChain` (`LogBuffer`'s
//! newline-delimited JSON log habit) and its `CausalChainEventSink` trait
//! (pluggable observer notified on append) for the `EventBus` abstraction
//! here. Structured logging throughout uses `tracing`, matching the
//! teacher's own use of `tracing::{info,warn,error}` rather than `println!`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// Topics named in spec.md §4.10.
pub const TOPIC_PLANS: &str = "llmos.plans";
pub const TOPIC_ACTIONS: &str = "llmos.actions";
pub const TOPIC_SECURITY: &str = "llmos.security";
pub const TOPIC_INTENT: &str = "llmos.intent";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub topic: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Pluggable observer notified on every audit append, mirroring the
/// teacher's `CausalChainEventSink::on_action_appended`.
pub trait EventBus: Send + Sync {
    fn emit(&self, event: &AuditEvent);
}

/// Default bus: no external subscribers.
pub struct NullEventBus;

impl EventBus for NullEventBus {
    fn emit(&self, _event: &AuditEvent) {}
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, topic: &str, payload: serde_json::Value);
}

/// Cap on the in-memory recent-events buffer so a long-running daemon's
/// audit trail doesn't grow without bound; the file sink is the durable
/// record, this buffer is only for `recorded()` inspection.
const RECENT_EVENTS_CAPACITY: usize = 1024;

struct RecentEvents {
    entries: Vec<AuditEvent>,
    capacity: usize,
}

impl RecentEvents {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    fn push(&mut self, event: AuditEvent) {
        if self.entries.len() >= self.capacity {
            self.entries.remove(0);
        }
        self.entries.push(event);
    }
}

/// Append-only NDJSON audit log with an attached `EventBus` for live
/// subscribers (spec.md §6 "Event bus contract": `emit(topic, event) -> void`).
pub struct AuditLogger {
    file: Option<Mutex<std::fs::File>>,
    bus: Box<dyn EventBus>,
    buffer: Mutex<RecentEvents>,
}

impl AuditLogger {
    pub fn new(path: Option<PathBuf>, bus: Box<dyn EventBus>) -> std::io::Result<Self> {
        let file = match path {
            Some(p) => Some(Mutex::new(
                std::fs::OpenOptions::new().create(true).append(true).open(p)?,
            )),
            None => None,
        };
        Ok(Self {
            file,
            bus,
            buffer: Mutex::new(RecentEvents::new(RECENT_EVENTS_CAPACITY)),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            file: None,
            bus: Box::new(NullEventBus),
            buffer: Mutex::new(RecentEvents::new(RECENT_EVENTS_CAPACITY)),
        }
    }

    /// The most recent buffered events (bounded by `RECENT_EVENTS_CAPACITY`),
    /// for tests that assert on an audit trail without touching the
    /// filesystem.
    pub fn recorded(&self) -> Vec<AuditEvent> {
        self.buffer.lock().unwrap().entries.clone()
    }
}

#[async_trait]
impl AuditSink for AuditLogger {
    async fn record(&self, topic: &str, payload: serde_json::Value) {
        let event = AuditEvent {
            topic: topic.to_string(),
            timestamp: Utc::now(),
            payload,
        };

        tracing::info!(topic = %event.topic, payload = %event.payload, "audit event");

        if let Some(file) = &self.file {
            let mut guard = file.lock().unwrap();
            if let Ok(line) = serde_json::to_string(&event) {
                let _ = writeln!(guard, "{}", line);
            }
        }

        self.buffer.lock().unwrap().push(event.clone());
        self.bus.emit(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recent_events_buffer_is_bounded() {
        let logger = AuditLogger::in_memory();
        for i in 0..RECENT_EVENTS_CAPACITY + 10 {
            logger.record(TOPIC_ACTIONS, serde_json::json!({"i": i})).await;
        }
        let recorded = logger.recorded();
        assert_eq!(recorded.len(), RECENT_EVENTS_CAPACITY);
        assert_eq!(recorded[0].payload["i"], serde_json::json!(10));
    }

    #[tokio::test]
    async fn record_is_retrievable_in_memory() {
        let logger = AuditLogger::in_memory();
        logger
            .record(TOPIC_ACTIONS, serde_json::json!({"action_id": "a1", "status": "completed"}))
            .await;
        let recorded = logger.recorded();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].topic, TOPIC_ACTIONS);
    }

    #[tokio::test]
    async fn writes_ndjson_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.ndjson");
        let logger = AuditLogger::new(Some(path.clone()), Box::new(NullEventBus)).unwrap();
        logger.record(TOPIC_SECURITY, serde_json::json!({"verdict": "reject"})).await;
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("llmos.security"));
    }
}
