//! Turns sentence chunks into outbound audio for one agent turn and keeps the record of which
//! words actually left the engine.

use crate::error::EngineError;
use crate::events::EventEmitter;
use crate::providers::{next_or_idle, OutboundTransport};
use crate::resilience::ResilientSynthesizer;
use crate::session::PipelineEvent;
use crate::types::{DeliveredWord, SentenceChunk, TurnId};

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct SynthesisAck {
    pub delivered_words: Vec<DeliveredWord>,
    pub acknowledged: bool,
}

pub struct SynthesisHandle {
    pub turn_id: TurnId,
    cancel: CancellationToken,
    delivered: watch::Receiver<Vec<DeliveredWord>>,
    task: Option<JoinHandle<()>>,
}

impl SynthesisHandle {
    pub fn delivered_words(&self) -> Vec<DeliveredWord> {
        self.delivered.borrow().clone()
    }

    /// Stop playback and flush the transport. Idempotent.
    pub async fn cancel(&mut self, budget: Duration) -> SynthesisAck {
        self.cancel.cancel();
        let acknowledged = match self.task.take() {
            Some(mut task) => match timeout(budget, &mut task).await {
                Ok(_) => true,
                Err(_) => {
                    warn!(turn_id=%self.turn_id, "synthesis did not acknowledge cancel in budget");
                    false
                }
            },
            None => true,
        };
        SynthesisAck {
            delivered_words: self.delivered_words(),
            acknowledged,
        }
    }
}

#[derive(Clone)]
pub struct SynthesisPipeline {
    synthesizer: Arc<ResilientSynthesizer>,
    transport: Arc<dyn OutboundTransport>,
    voice_id: String,
    idle_timeout: Duration,
    emitter: EventEmitter,
    clock: Instant,
}

impl SynthesisPipeline {
    pub fn new(
        synthesizer: Arc<ResilientSynthesizer>,
        transport: Arc<dyn OutboundTransport>,
        voice_id: impl Into<String>,
        idle_timeout: Duration,
        emitter: EventEmitter,
        clock: Instant,
    ) -> Self {
        Self {
            synthesizer,
            transport,
            voice_id: voice_id.into(),
            idle_timeout,
            emitter,
            clock,
        }
    }

    /// Speak every chunk received on `chunks`, in order, until the sender closes.
    pub fn spawn(
        &self,
        turn_id: TurnId,
        chunks: mpsc::Receiver<SentenceChunk>,
        inbox: mpsc::Sender<PipelineEvent>,
    ) -> SynthesisHandle {
        let cancel = CancellationToken::new();
        let (delivered_tx, delivered) = watch::channel(vec![]);
        let task = SpeakTask {
            pipeline: self.clone(),
            turn_id,
            cancel: cancel.clone(),
            delivered: delivered_tx,
            inbox,
            first_audio_sent: false,
            frames_sent: 0,
        };
        let task = tokio::spawn(task.run(chunks));
        SynthesisHandle {
            turn_id,
            cancel,
            delivered,
            task: Some(task),
        }
    }
}

struct SpeakTask {
    pipeline: SynthesisPipeline,
    turn_id: TurnId,
    cancel: CancellationToken,
    delivered: watch::Sender<Vec<DeliveredWord>>,
    inbox: mpsc::Sender<PipelineEvent>,
    first_audio_sent: bool,
    frames_sent: u64,
}

impl SpeakTask {
    fn now_ms(&self) -> u64 {
        self.pipeline.clock.elapsed().as_millis() as u64
    }

    async fn run(mut self, mut chunks: mpsc::Receiver<SentenceChunk>) {
        let result = self.speak(&mut chunks).await;
        if self.cancel.is_cancelled() {
            if let Err(e) = self.pipeline.transport.clear().await {
                warn!(turn_id=%self.turn_id, error=%e, "failed to clear outbound audio");
            }
            debug!(turn_id=%self.turn_id, frames=%self.frames_sent, "synthesis cancelled");
            self.pipeline.emitter.emit(
                "synthesis.cancelled",
                json!({ "turn_id": self.turn_id, "words": self.delivered.borrow().len() }),
            );
            return;
        }
        if let Err(e) = &result {
            warn!(turn_id=%self.turn_id, error=%e, "synthesis failed");
        }
        self.pipeline.emitter.emit(
            "synthesis.finished",
            json!({ "turn_id": self.turn_id, "frames": self.frames_sent, "ok": result.is_ok() }),
        );
        let event = PipelineEvent::SynthesisFinished {
            turn_id: self.turn_id,
            result,
        };
        if self.inbox.send(event).await.is_err() {
            debug!(turn_id=%self.turn_id, "session gone before synthesis report");
        }
    }

    async fn speak(&mut self, chunks: &mut mpsc::Receiver<SentenceChunk>) -> Result<(), EngineError> {
        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                chunk = chunks.recv() => chunk,
            };
            let Some(chunk) = chunk else {
                return Ok(());
            };
            if !chunk.is_speakable() {
                warn!(turn_id=%self.turn_id, index=%chunk.index, "refusing chunk tied to an unexecuted function call");
                self.pipeline.emitter.emit(
                    "synthesis.refused",
                    json!({ "turn_id": self.turn_id, "index": chunk.index }),
                );
                continue;
            }
            self.speak_chunk(&chunk).await?;
            if self.cancel.is_cancelled() {
                return Ok(());
            }
        }
    }

    async fn speak_chunk(&mut self, chunk: &SentenceChunk) -> Result<(), EngineError> {
        let synthesizer = &self.pipeline.synthesizer;
        let mut frames = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(()),
            res = synthesizer.start(&chunk.text, &self.pipeline.voice_id) => res?,
        };
        let mut marked = 0;
        let mut elapsed_ms = 0;
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                frame = next_or_idle(&mut frames, self.pipeline.idle_timeout, "synthesizer") => frame,
            };
            let frame = match frame {
                None => break,
                Some(frame) => frame?,
            };
            let transport = &self.pipeline.transport;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                res = transport.send(&frame) => res?,
            }
            self.frames_sent += 1;
            elapsed_ms += frame.duration_ms;
            let now = self.now_ms();
            if !self.first_audio_sent {
                self.first_audio_sent = true;
                let event = PipelineEvent::FirstAudio {
                    turn_id: self.turn_id,
                    at_ms: now,
                };
                if self.inbox.send(event).await.is_err() {
                    debug!(turn_id=%self.turn_id, "session gone");
                }
            }
            if !frame.words.is_empty() {
                marked += frame.words.len();
                self.delivered.send_modify(|words| {
                    words.extend(frame.words.iter().map(|m| DeliveredWord {
                        word: m.word.clone(),
                        chunk_index: chunk.index,
                        offset_ms: m.offset_ms,
                        delivered_at_ms: now,
                    }))
                });
            }
        }
        // words the synthesizer never marked count once the whole chunk is out
        let unmarked: Vec<&str> = chunk.text.split_whitespace().skip(marked).collect();
        if !unmarked.is_empty() {
            let now = self.now_ms();
            self.delivered.send_modify(|words| {
                words.extend(unmarked.iter().map(|w| DeliveredWord {
                    word: w.to_string(),
                    chunk_index: chunk.index,
                    offset_ms: elapsed_ms,
                    delivered_at_ms: now,
                }))
            });
        }
        Ok(())
    }
}
