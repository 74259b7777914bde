use crate::config::EngineConfig;
use crate::events::EngineEvent;
use crate::functions::{FunctionExecutor, FunctionRegistry};
use crate::resilience::{ResilientGenerator, ResilientSynthesizer, ResilientTranscriber};
use crate::twilio_types::TwilioConnectPayload;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Engine-assigned turn identifier, unique within a call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TurnId(pub u64);

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "detail")]
pub enum CallEndReason {
    Hangup,
    Transfer,
    Error(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Active,
    Ended(CallEndReason),
}

/// One active conversation.
#[derive(Clone, Debug, Serialize)]
pub struct Call {
    pub call_id: Uuid,
    pub tenant_id: String,
    pub region: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub state: CallState,
}

impl Call {
    pub fn new(tenant_id: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            call_id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            region: region.into(),
            created_at: OffsetDateTime::now_utc(),
            state: CallState::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == CallState::Active
    }

    /// Ending is sticky: the first reason wins.
    pub fn end(&mut self, reason: CallEndReason) {
        if self.is_active() {
            self.state = CallState::Ended(reason);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Agent,
}

/// One user-or-agent speaking interval. Timestamps are milliseconds on the call clock.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub turn_id: TurnId,
    pub speaker: Speaker,
    pub started_at_ms: u64,
    pub ended_at_ms: Option<u64>,
    pub content: String,
    /// Word prefix of `content` actually rendered as audio.
    pub delivered_content: String,
    pub interrupted: bool,
}

impl Turn {
    pub fn open(turn_id: TurnId, speaker: Speaker, started_at_ms: u64) -> Self {
        Self {
            turn_id,
            speaker,
            started_at_ms,
            ended_at_ms: None,
            content: String::new(),
            delivered_content: String::new(),
            interrupted: false,
        }
    }

    /// Close the turn with its full content delivered.
    pub fn close(mut self, ended_at_ms: u64, content: impl Into<String>) -> Self {
        let content = content.into();
        self.delivered_content = content.clone();
        self.content = content;
        self.ended_at_ms = Some(ended_at_ms);
        self
    }

    pub fn is_open(&self) -> bool {
        self.ended_at_ms.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WordTimestamp {
    pub word: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub confidence: f32,
}

/// A partial or final transcript. `turn_id` is the transcriber's utterance id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub turn_id: u64,
    pub sequence_no: u64,
    pub text: String,
    pub is_final: bool,
    #[serde(default)]
    pub word_timestamps: Vec<WordTimestamp>,
    pub confidence: f32,
}

impl TranscriptEvent {
    pub fn partial(turn_id: u64, sequence_no: u64, text: impl Into<String>) -> Self {
        Self {
            turn_id,
            sequence_no,
            text: text.into(),
            is_final: false,
            word_timestamps: vec![],
            confidence: 0.0,
        }
    }

    pub fn final_result(
        turn_id: u64,
        sequence_no: u64,
        text: impl Into<String>,
        confidence: f32,
    ) -> Self {
        Self {
            turn_id,
            sequence_no,
            text: text.into(),
            is_final: true,
            word_timestamps: vec![],
            confidence,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VadEvent {
    SpeechStart,
    SpeechEnd,
}

/// Named durable summary field in conversation context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextSlot {
    pub name: String,
    pub value: String,
    pub updated_at_turn: Option<TurnId>,
    pub stale: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionCallStatus {
    Pending,
    Validated,
    Rejected,
    Executed,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub call_id: Uuid,
    pub name: String,
    /// Raw JSON text as proposed by the model; may be malformed.
    pub arguments: String,
    pub tool_call_id: String,
    pub status: FunctionCallStatus,
}

impl FunctionCall {
    pub fn proposed(
        call_id: Uuid,
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            call_id,
            name: name.into(),
            arguments: arguments.into(),
            tool_call_id: tool_call_id.into(),
            status: FunctionCallStatus::Pending,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCallRef {
    pub tool_call_id: String,
    pub status: FunctionCallStatus,
}

/// Generation output bounded by terminal punctuation; the unit handed to synthesis.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentenceChunk {
    pub turn_id: TurnId,
    pub index: usize,
    pub text: String,
    /// Set when the text depends on a function call's result.
    pub function_call: Option<FunctionCallRef>,
}

impl SentenceChunk {
    /// Text that depends on a call which has not run successfully must never be spoken.
    pub fn is_speakable(&self) -> bool {
        match &self.function_call {
            None => true,
            Some(r) => !matches!(
                r.status,
                FunctionCallStatus::Pending | FunctionCallStatus::Rejected
            ),
        }
    }
}

/// A word beginning inside an audio frame, `offset_ms` from the start of its chunk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordMark {
    pub word: String,
    pub offset_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioFrame {
    pub sequence_no: u64,
    pub payload: Vec<u8>,
    pub duration_ms: u64,
    pub words: Vec<WordMark>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveredWord {
    pub word: String,
    pub chunk_index: usize,
    pub offset_ms: u64,
    pub delivered_at_ms: u64,
}

/// Process-wide state shared by all calls: pooled provider clients and configuration.
pub struct AppState {
    pub config: Arc<EngineConfig>,
    pub transcriber: Arc<ResilientTranscriber>,
    pub generator: Arc<ResilientGenerator>,
    pub synthesizer: Arc<ResilientSynthesizer>,
    pub functions: Arc<FunctionRegistry>,
    pub executor: Arc<dyn FunctionExecutor>,
    pub events: mpsc::Sender<EngineEvent>,
    // call sid => twilio connect meta
    pub streams: Arc<Mutex<HashMap<String, TwilioConnectPayload>>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_end_is_sticky() {
        let mut call = Call::new("acme", "us-east");
        assert!(call.is_active());
        call.end(CallEndReason::Hangup);
        call.end(CallEndReason::Transfer);
        assert_eq!(call.state, CallState::Ended(CallEndReason::Hangup));
    }

    #[test]
    fn chunks_tied_to_unexecuted_calls_are_not_speakable() {
        let mut chunk = SentenceChunk {
            turn_id: TurnId(2),
            index: 0,
            text: "Your order shipped.".into(),
            function_call: Some(FunctionCallRef {
                tool_call_id: "call_1".into(),
                status: FunctionCallStatus::Pending,
            }),
        };
        assert!(!chunk.is_speakable());
        chunk.function_call.as_mut().unwrap().status = FunctionCallStatus::Rejected;
        assert!(!chunk.is_speakable());
        chunk.function_call.as_mut().unwrap().status = FunctionCallStatus::Executed;
        assert!(chunk.is_speakable());
        chunk.function_call = None;
        assert!(chunk.is_speakable());
    }
}
