//! Structured engine events. Emission never blocks: a full sink drops the event with a warning.

use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone, Debug, Serialize)]
pub struct EngineEvent {
    pub call_id: Uuid,
    pub trace_id: Uuid,
    pub sequence_no: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub event_type: String,
    pub payload: Value,
}

/// Per-call handle; clones share the sequence counter.
#[derive(Clone)]
pub struct EventEmitter {
    call_id: Uuid,
    trace_id: Uuid,
    sequence_no: Arc<AtomicU64>,
    sink: Option<mpsc::Sender<EngineEvent>>,
}

impl EventEmitter {
    pub fn new(call_id: Uuid, sink: mpsc::Sender<EngineEvent>) -> Self {
        Self {
            call_id,
            trace_id: Uuid::new_v4(),
            sequence_no: Arc::new(AtomicU64::new(0)),
            sink: Some(sink),
        }
    }

    /// An emitter that only counts; used where nobody listens.
    pub fn disabled(call_id: Uuid) -> Self {
        Self {
            call_id,
            trace_id: Uuid::new_v4(),
            sequence_no: Arc::new(AtomicU64::new(0)),
            sink: None,
        }
    }

    pub fn call_id(&self) -> Uuid {
        self.call_id
    }

    pub fn emit(&self, event_type: &str, payload: Value) {
        let sequence_no = self.sequence_no.fetch_add(1, Ordering::Relaxed);
        let Some(sink) = &self.sink else {
            return;
        };
        let event = EngineEvent {
            call_id: self.call_id,
            trace_id: self.trace_id,
            sequence_no,
            timestamp: OffsetDateTime::now_utc(),
            event_type: event_type.to_string(),
            payload,
        };
        match sink.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(e)) => {
                warn!(call_id=%self.call_id, event_type=%e.event_type, "event sink full; dropping event")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(call_id=%self.call_id, "event sink closed")
            }
        }
    }
}

/// Default sink: write every event to the log as JSON.
pub async fn log_events(mut events: mpsc::Receiver<EngineEvent>) {
    while let Some(event) = events.recv().await {
        match serde_json::to_string(&event) {
            Ok(json) => info!(target: "turn_engine::events", "{json}"),
            Err(e) => warn!(error=%e, "failed to serialize engine event"),
        }
    }
}
