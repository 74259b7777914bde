//! In-process providers driven by scripts, for exercising a call end to end without any network.

use crate::error::{ProviderError, TransportError};
use crate::functions::{FunctionExecutor, FunctionSpec};
use crate::providers::{
    GenerationItem, GenerationRequest, Generator, OutboundTransport, ProviderStream, Synthesizer,
    Transcriber, TranscriberSession,
};
use crate::types::{AudioFrame, TranscriptEvent, VadEvent, WordMark};

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;

const SCRIPTED: &str = "scripted";

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The far side of one scripted transcription stream.
pub struct ScriptedStream {
    pub events: mpsc::Sender<Result<TranscriptEvent, ProviderError>>,
    pub vad: mpsc::Sender<VadEvent>,
    pub audio: mpsc::Receiver<Vec<u8>>,
}

#[derive(Default)]
pub struct ScriptedTranscriber {
    sessions: Mutex<VecDeque<TranscriberSession>>,
}

impl ScriptedTranscriber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a stream for the next `start`; the caller drives it through the returned handle.
    pub fn push_session(&self) -> ScriptedStream {
        let (audio_tx, audio) = mpsc::channel(256);
        let (events, events_rx) = mpsc::channel(64);
        let (vad, vad_rx) = mpsc::channel(64);
        lock(&self.sessions).push_back(TranscriberSession {
            audio: audio_tx,
            events: events_rx,
            voice_activity: Some(vad_rx),
        });
        ScriptedStream { events, vad, audio }
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    fn name(&self) -> &str {
        SCRIPTED
    }

    async fn start(&self) -> Result<TranscriberSession, ProviderError> {
        lock(&self.sessions)
            .pop_front()
            .ok_or_else(|| ProviderError::Unavailable {
                provider: SCRIPTED.to_string(),
                status: 503,
            })
    }
}

#[derive(Clone, Debug)]
pub enum ScriptStep {
    Token(String),
    Sentence(String),
    Call {
        tool_call_id: String,
        name: String,
        arguments: String,
    },
    Error(ProviderError),
    Delay(Duration),
}

impl ScriptStep {
    pub fn tokens(tokens: &[&str]) -> Vec<ScriptStep> {
        tokens.iter().map(|t| ScriptStep::Token(t.to_string())).collect()
    }
}

/// Plays one queued script per `start`, recording every request it was given.
#[derive(Default)]
pub struct ScriptedGenerator {
    scripts: Mutex<VecDeque<Vec<ScriptStep>>>,
    start_errors: Mutex<VecDeque<ProviderError>>,
    requests: Mutex<Vec<GenerationRequest>>,
    starts: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_script(&self, steps: Vec<ScriptStep>) {
        lock(&self.scripts).push_back(steps);
    }

    /// Make the next `start` fail before any script is consumed.
    pub fn push_start_error(&self, e: ProviderError) {
        lock(&self.start_errors).push_back(e);
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        lock(&self.requests).clone()
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn name(&self) -> &str {
        SCRIPTED
    }

    async fn start(
        &self,
        request: &GenerationRequest,
    ) -> Result<ProviderStream<GenerationItem>, ProviderError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = lock(&self.start_errors).pop_front() {
            return Err(e);
        }
        lock(&self.requests).push(request.clone());
        let script = lock(&self.scripts)
            .pop_front()
            .ok_or_else(|| ProviderError::BadRequest {
                provider: SCRIPTED.to_string(),
                message: "no script left".to_string(),
            })?;
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for step in script {
                let item = match step {
                    ScriptStep::Delay(d) => {
                        sleep(d).await;
                        continue;
                    }
                    ScriptStep::Token(t) => Ok(GenerationItem::Token(t)),
                    ScriptStep::Sentence(s) => Ok(GenerationItem::Sentence(s)),
                    ScriptStep::Call {
                        tool_call_id,
                        name,
                        arguments,
                    } => Ok(GenerationItem::FunctionCallProposal {
                        tool_call_id,
                        name,
                        arguments,
                    }),
                    ScriptStep::Error(e) => Err(e),
                };
                if tx.send(item).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

/// Renders one frame per word, each `frame_ms` long and marked with its word.
pub struct ScriptedSynthesizer {
    frame_ms: u64,
    texts: Mutex<Vec<String>>,
}

impl Default for ScriptedSynthesizer {
    fn default() -> Self {
        Self {
            frame_ms: 100,
            texts: Mutex::new(vec![]),
        }
    }
}

impl ScriptedSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn texts(&self) -> Vec<String> {
        lock(&self.texts).clone()
    }
}

#[async_trait]
impl Synthesizer for ScriptedSynthesizer {
    fn name(&self) -> &str {
        SCRIPTED
    }

    async fn start(
        &self,
        text: &str,
        _voice_id: &str,
    ) -> Result<ProviderStream<AudioFrame>, ProviderError> {
        lock(&self.texts).push(text.to_string());
        let frames: Vec<AudioFrame> = text
            .split_whitespace()
            .enumerate()
            .map(|(i, word)| AudioFrame {
                sequence_no: i as u64,
                // 8kHz mu-law silence
                payload: vec![0xff; (self.frame_ms * 8) as usize],
                duration_ms: self.frame_ms,
                words: vec![WordMark {
                    word: word.to_string(),
                    offset_ms: i as u64 * self.frame_ms,
                }],
            })
            .collect();
        let (tx, rx) = mpsc::channel(frames.len().max(1));
        for frame in frames {
            if tx.try_send(Ok(frame)).is_err() {
                break;
            }
        }
        Ok(rx)
    }
}

/// Outbound transport that keeps every frame. A paced transport takes each frame's duration to
/// accept it, like a real-time playout.
#[derive(Default)]
pub struct RecordingTransport {
    paced: bool,
    frames: Mutex<Vec<AudioFrame>>,
    clears: AtomicUsize,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paced() -> Self {
        Self {
            paced: true,
            ..Default::default()
        }
    }

    pub fn frames(&self) -> Vec<AudioFrame> {
        lock(&self.frames).clone()
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OutboundTransport for RecordingTransport {
    async fn send(&self, frame: &AudioFrame) -> Result<(), TransportError> {
        if self.paced {
            sleep(Duration::from_millis(frame.duration_ms)).await;
        }
        lock(&self.frames).push(frame.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), TransportError> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Answers every call with the same value and remembers which functions ran.
pub struct RecordingExecutor {
    result: Value,
    calls: Mutex<Vec<String>>,
}

impl RecordingExecutor {
    pub fn new(result: Value) -> Self {
        Self {
            result,
            calls: Mutex::new(vec![]),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl FunctionExecutor for RecordingExecutor {
    async fn execute(&self, spec: &FunctionSpec, _arguments: &Map<String, Value>) -> Result<Value, ProviderError> {
        lock(&self.calls).push(spec.name.clone());
        Ok(self.result.clone())
    }
}
