//! One call, end to end.
//!
//! The session task owns the turn controller and the context store. Inputs (caller audio, voice
//! activity, transcripts, timers and reports from the pipelines) are multiplexed through one
//! loop, so no state is ever shared with the pipeline tasks.

use crate::config::EngineConfig;
use crate::consts::PENDING_ACTION_SLOT;
use crate::context::ContextStore;
use crate::error::{ContextError, EngineError, ProviderError};
use crate::events::EventEmitter;
use crate::functions::{FunctionExecutor, FunctionRegistry};
use crate::generation::{GenerationHandle, GenerationPipeline, RoundReport};
use crate::interruption::{InterruptionCoordinator, InterruptionReport};
use crate::providers::{GenerationRequest, OutboundTransport, ProviderStream};
use crate::resilience::{ResilientGenerator, ResilientSynthesizer, ResilientTranscriber};
use crate::synthesis::{SynthesisHandle, SynthesisPipeline};
use crate::turn::{Command, Transition, TurnController, TurnControllerConfig, TurnState};
use crate::types::{
    Call, CallEndReason, ContextSlot, SentenceChunk, Speaker, TranscriptEvent, Turn, TurnId,
    VadEvent,
};

use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

const INBOX_BUFFER: usize = 64;
const CHUNK_BUFFER: usize = 32;
const TRANSCRIBER_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Reports sent back to the session by the pipeline tasks.
#[derive(Debug)]
pub enum PipelineEvent {
    GenerationFinished(RoundReport),
    FirstAudio { turn_id: TurnId, at_ms: u64 },
    SynthesisFinished {
        turn_id: TurnId,
        result: Result<(), EngineError>,
    },
}

/// Provider clients and the outbound path a call runs against.
#[derive(Clone)]
pub struct SessionDeps {
    pub transcriber: Arc<ResilientTranscriber>,
    pub generator: Arc<ResilientGenerator>,
    pub synthesizer: Arc<ResilientSynthesizer>,
    pub functions: Arc<FunctionRegistry>,
    pub executor: Arc<dyn FunctionExecutor>,
    pub transport: Arc<dyn OutboundTransport>,
}

#[derive(Debug, Serialize)]
pub struct CallSummary {
    pub call: Call,
    pub turns: Vec<Turn>,
    pub slots: Vec<ContextSlot>,
    pub interruptions: usize,
    pub function_calls: usize,
    pub errors: usize,
}

/// The agent turn currently being produced.
struct AgentTurn {
    turn_id: TurnId,
    started_at_ms: u64,
    user_ended_at_ms: u64,
    round: usize,
    /// Speakable text of every finished round.
    text: String,
    next_chunk_index: usize,
    chunks: Option<mpsc::Sender<SentenceChunk>>,
    generation: Option<GenerationHandle>,
    synthesis: Option<SynthesisHandle>,
    interruption: Option<InterruptionReport>,
    pending_action: Option<String>,
    first_audio: bool,
}

impl AgentTurn {
    /// Speakable text of finished rounds plus what the round in flight had generated.
    fn generated_text(&self) -> String {
        let in_flight = self
            .interruption
            .as_ref()
            .map(|r| r.generated_text.trim())
            .unwrap_or_default();
        match (self.text.is_empty(), in_flight.is_empty()) {
            (_, true) => self.text.clone(),
            (true, false) => in_flight.to_string(),
            (false, false) => format!("{} {in_flight}", self.text),
        }
    }
}

enum Wake {
    Pipeline(Option<PipelineEvent>),
    Vad(Option<VadEvent>, bool),
    Transcript(Option<Result<TranscriptEvent, ProviderError>>),
    Timer,
    RestartTranscriber,
    Audio(Option<Vec<u8>>),
}

async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

pub struct CallSession {
    call: Call,
    config: Arc<EngineConfig>,
    controller: TurnController,
    last_state: TurnState,
    context: ContextStore,
    transcriber: Arc<ResilientTranscriber>,
    functions: Arc<FunctionRegistry>,
    generation: GenerationPipeline,
    synthesis: SynthesisPipeline,
    interruption: InterruptionCoordinator,
    emitter: EventEmitter,
    clock: Instant,
    timers: BTreeSet<u64>,
    agent: Option<AgentTurn>,
    inbox_tx: mpsc::Sender<PipelineEvent>,
    inbox_rx: mpsc::Receiver<PipelineEvent>,
    stt_audio: Option<mpsc::Sender<Vec<u8>>>,
    stt_events: Option<ProviderStream<TranscriptEvent>>,
    stt_vad: Option<mpsc::Receiver<VadEvent>>,
    stt_retry_at: Option<Instant>,
    external_vad: bool,
    interruptions: usize,
    function_calls: usize,
    errors: usize,
}

impl CallSession {
    pub fn new(call: Call, config: Arc<EngineConfig>, deps: SessionDeps, emitter: EventEmitter) -> Self {
        let clock = Instant::now();
        let idle = Duration::from_millis(config.providers.stream_idle_timeout_ms);
        let generation = GenerationPipeline::new(
            deps.generator,
            deps.functions.clone(),
            deps.executor,
            idle,
            Duration::from_millis(config.generation.function_timeout_ms),
            emitter.clone(),
        );
        let synthesis = SynthesisPipeline::new(
            deps.synthesizer,
            deps.transport,
            config.agent.voice_id.clone(),
            idle,
            emitter.clone(),
            clock,
        );
        let interruption = InterruptionCoordinator::new(
            Duration::from_millis(config.interruption.cancel_budget_ms),
            emitter.clone(),
        );
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_BUFFER);
        Self {
            call,
            controller: TurnController::new(TurnControllerConfig::from(config.as_ref())),
            last_state: TurnState::Idle,
            context: ContextStore::new(config.agent.system_instruction.clone(), &config.context),
            transcriber: deps.transcriber,
            functions: deps.functions,
            generation,
            synthesis,
            interruption,
            emitter,
            clock,
            timers: BTreeSet::new(),
            agent: None,
            inbox_tx,
            inbox_rx,
            stt_audio: None,
            stt_events: None,
            stt_vad: None,
            stt_retry_at: None,
            external_vad: false,
            interruptions: 0,
            function_calls: 0,
            errors: 0,
            config,
        }
    }

    fn now_ms(&self) -> u64 {
        self.clock.elapsed().as_millis() as u64
    }

    /// Run the call until the caller's audio ends or a fatal error. `vad`, when given, replaces
    /// any voice activity the transcriber reports.
    pub async fn run(
        mut self,
        mut audio: mpsc::Receiver<Vec<u8>>,
        mut vad: Option<mpsc::Receiver<VadEvent>>,
    ) -> CallSummary {
        let call_id = self.call.call_id;
        self.external_vad = vad.is_some();
        info!(call_id=%call_id, tenant=%self.call.tenant_id, "call started");
        self.emitter.emit(
            "call.started",
            json!({ "tenant_id": self.call.tenant_id, "region": self.call.region }),
        );
        self.start_transcriber().await;

        while self.call.is_active() {
            let timer = self
                .timers
                .first()
                .map(|at| self.clock + Duration::from_millis(*at));
            let wake = tokio::select! {
                biased;
                ev = self.inbox_rx.recv() => Wake::Pipeline(ev),
                ev = recv_opt(&mut vad) => Wake::Vad(ev, true),
                ev = recv_opt(&mut self.stt_vad) => Wake::Vad(ev, false),
                ev = recv_opt(&mut self.stt_events) => Wake::Transcript(ev),
                _ = sleep_until_opt(timer) => Wake::Timer,
                _ = sleep_until_opt(self.stt_retry_at) => Wake::RestartTranscriber,
                frame = audio.recv() => Wake::Audio(frame),
            };
            let res = match wake {
                Wake::Pipeline(Some(ev)) => self.on_pipeline_event(ev).await,
                Wake::Pipeline(None) => Ok(()),
                Wake::Vad(Some(ev), _) => self.on_vad(ev).await,
                Wake::Vad(None, true) => {
                    debug!(call_id=%call_id, "voice activity source closed");
                    vad = None;
                    Ok(())
                }
                Wake::Vad(None, false) => {
                    self.stt_vad = None;
                    Ok(())
                }
                Wake::Transcript(Some(Ok(ev))) => self.on_transcript(ev).await,
                Wake::Transcript(Some(Err(e))) => self.transcriber_failed(&e.to_string()).await,
                Wake::Transcript(None) => self.transcriber_failed("transcription stream ended").await,
                Wake::Timer => self.on_timer().await,
                Wake::RestartTranscriber => {
                    self.start_transcriber().await;
                    Ok(())
                }
                Wake::Audio(Some(frame)) => {
                    self.forward_audio(frame);
                    Ok(())
                }
                Wake::Audio(None) => self.hangup().await,
            };
            if let Err(e) = res {
                error!(call_id=%call_id, error=%e, "fatal call error");
                self.errors += 1;
                self.abandon_agent_turn().await;
                self.call.end(CallEndReason::Error(e.to_string()));
            }
        }
        self.finish()
    }

    fn finish(mut self) -> CallSummary {
        // closes the transcription stream
        self.stt_audio = None;
        let summary = CallSummary {
            turns: self.context.turns().cloned().collect(),
            slots: self.context.slots(),
            interruptions: self.interruptions,
            function_calls: self.function_calls,
            errors: self.errors,
            call: self.call,
        };
        info!(call_id=%summary.call.call_id, turns=%summary.turns.len(), "call ended");
        self.emitter.emit(
            "call.ended",
            json!({
                "state": summary.call.state,
                "turns": summary.turns.len(),
                "interruptions": summary.interruptions,
                "errors": summary.errors,
            }),
        );
        summary
    }

    async fn start_transcriber(&mut self) {
        self.stt_retry_at = None;
        match self.transcriber.start().await {
            Ok(session) => {
                debug!(call_id=%self.call.call_id, "transcription stream open");
                self.stt_audio = Some(session.audio);
                self.stt_events = Some(session.events);
                self.stt_vad = if self.external_vad {
                    None
                } else {
                    session.voice_activity
                };
            }
            Err(e) => {
                warn!(call_id=%self.call.call_id, error=%e, "failed to start transcription");
                self.errors += 1;
                self.emitter.emit(
                    "error",
                    json!({ "stage": "transcription", "message": e.to_string() }),
                );
                self.stt_retry_at = Some(Instant::now() + TRANSCRIBER_RESTART_DELAY);
            }
        }
    }

    async fn transcriber_failed(&mut self, message: &str) -> Result<(), EngineError> {
        warn!(call_id=%self.call.call_id, error=%message, "transcription stream lost");
        self.stt_audio = None;
        self.stt_events = None;
        self.stt_vad = None;
        self.stt_retry_at = Some(Instant::now() + TRANSCRIBER_RESTART_DELAY);
        let t = self.controller.on_transcriber_error(message, self.now_ms());
        self.apply(t).await
    }

    fn forward_audio(&mut self, frame: Vec<u8>) {
        let Some(tx) = &self.stt_audio else {
            return;
        };
        match tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(call_id=%self.call.call_id, "transcriber backlogged; dropping audio frame")
            }
            Err(mpsc::error::TrySendError::Closed(_)) => self.stt_audio = None,
        }
    }

    async fn on_vad(&mut self, ev: VadEvent) -> Result<(), EngineError> {
        let now = self.now_ms();
        self.emitter.emit("vad", json!({ "event": ev, "at_ms": now }));
        let t = match ev {
            VadEvent::SpeechStart => self.controller.on_vad_speech_start(now),
            VadEvent::SpeechEnd => self.controller.on_vad_speech_end(now),
        };
        self.apply(t).await
    }

    async fn on_transcript(&mut self, ev: TranscriptEvent) -> Result<(), EngineError> {
        let now = self.now_ms();
        self.emitter.emit(
            "transcript",
            json!({
                "utterance": ev.turn_id,
                "sequence_no": ev.sequence_no,
                "text": ev.text,
                "is_final": ev.is_final,
                "confidence": ev.confidence,
            }),
        );
        let t = self.controller.on_transcript(&ev, now);
        self.apply(t).await
    }

    async fn on_timer(&mut self) -> Result<(), EngineError> {
        let now = self.now_ms();
        while self.timers.first().map(|at| *at <= now).unwrap_or(false) {
            self.timers.pop_first();
        }
        let t = self.controller.on_tick(now);
        self.apply(t).await
    }

    async fn hangup(&mut self) -> Result<(), EngineError> {
        info!(call_id=%self.call.call_id, "caller audio ended");
        if let Some(agent_turn_id) = self.agent.as_ref().map(|a| a.turn_id) {
            self.execute(Command::CancelPipelines { agent_turn_id }).await?;
            self.execute(Command::ReconcileContext { agent_turn_id }).await?;
        }
        self.call.end(CallEndReason::Hangup);
        Ok(())
    }

    /// Stop whatever is in flight without touching context.
    async fn abandon_agent_turn(&mut self) {
        if let Some(mut agent) = self.agent.take() {
            self.interruption
                .interrupt(agent.turn_id, agent.generation.as_mut(), agent.synthesis.as_mut())
                .await;
        }
    }

    async fn apply(&mut self, transition: Transition) -> Result<(), EngineError> {
        if transition.state != self.last_state {
            debug!(call_id=%self.call.call_id, from=?self.last_state, to=?transition.state, "turn state");
            self.emitter.emit(
                "turn.state",
                json!({ "from": self.last_state, "to": transition.state, "at_ms": self.now_ms() }),
            );
            self.last_state = transition.state;
        }
        for command in transition.commands {
            self.execute(command).await?;
        }
        Ok(())
    }

    /// Context errors other than an invariant violation cost the turn, not the call.
    fn check_context(&mut self, res: Result<(), ContextError>) -> Result<(), EngineError> {
        match res {
            Ok(()) => Ok(()),
            Err(e @ ContextError::InvariantViolation(_)) => Err(e.into()),
            Err(e) => {
                warn!(call_id=%self.call.call_id, error=%e, "context update rejected");
                self.errors += 1;
                Ok(())
            }
        }
    }

    async fn execute(&mut self, command: Command) -> Result<(), EngineError> {
        let now = self.now_ms();
        match command {
            Command::StartGeneration {
                user_turn,
                agent_turn_id,
            } => {
                self.emitter.emit(
                    "turn.user",
                    json!({ "turn_id": user_turn.turn_id, "content": user_turn.content }),
                );
                let user_ended_at_ms = user_turn.ended_at_ms.unwrap_or(now);
                let res = self.context.append(user_turn);
                self.check_context(res)?;
                let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_BUFFER);
                let synthesis = self.synthesis.spawn(agent_turn_id, chunk_rx, self.inbox_tx.clone());
                self.agent = Some(AgentTurn {
                    turn_id: agent_turn_id,
                    started_at_ms: now,
                    user_ended_at_ms,
                    round: 0,
                    text: String::new(),
                    next_chunk_index: 0,
                    chunks: Some(chunk_tx),
                    generation: None,
                    synthesis: Some(synthesis),
                    interruption: None,
                    pending_action: None,
                    first_audio: false,
                });
                self.start_round(0);
            }
            Command::CommitUserTurn { turn } => {
                self.emitter.emit(
                    "turn.user",
                    json!({ "turn_id": turn.turn_id, "content": turn.content }),
                );
                let res = self.context.append(turn);
                self.check_context(res)?;
            }
            Command::CancelPipelines { agent_turn_id } => {
                if let Some(agent) = self.agent.as_mut().filter(|a| a.turn_id == agent_turn_id) {
                    agent.chunks = None;
                    let report = self
                        .interruption
                        .interrupt(agent_turn_id, agent.generation.as_mut(), agent.synthesis.as_mut())
                        .await;
                    agent.interruption = Some(report);
                    self.interruptions += 1;
                }
            }
            Command::ReconcileContext { agent_turn_id } => {
                let Some(agent) = self.take_agent(agent_turn_id) else {
                    return Ok(());
                };
                let delivered = agent
                    .interruption
                    .as_ref()
                    .map(InterruptionReport::delivered_text)
                    .unwrap_or_default();
                let turn = Turn::open(agent_turn_id, Speaker::Agent, agent.started_at_ms)
                    .close(now, agent.generated_text());
                let res = self.context.append(turn);
                self.check_context(res)?;
                let res = self.context.reconcile_after_interruption(agent_turn_id, &delivered);
                self.check_context(res)?;
                self.emitter.emit(
                    "turn.agent",
                    json!({ "turn_id": agent_turn_id, "content": delivered, "interrupted": true }),
                );
                self.record_pending_action(&agent);
            }
            Command::CommitAgentTurn { agent_turn_id } => {
                let Some(agent) = self.take_agent(agent_turn_id) else {
                    return Ok(());
                };
                let turn = Turn::open(agent_turn_id, Speaker::Agent, agent.started_at_ms)
                    .close(now, agent.text.clone());
                self.emitter.emit(
                    "turn.agent",
                    json!({ "turn_id": agent_turn_id, "content": turn.content, "interrupted": false }),
                );
                let res = self.context.append(turn);
                self.check_context(res)?;
                self.record_pending_action(&agent);
            }
            Command::ScheduleEndpointCheck { at_ms } => {
                self.timers.insert(at_ms);
            }
            Command::ReportError { stage, message } => {
                warn!(call_id=%self.call.call_id, ?stage, error=%message, "turn error");
                self.errors += 1;
                self.emitter
                    .emit("error", json!({ "stage": stage, "message": message }));
            }
        }
        Ok(())
    }

    fn take_agent(&mut self, turn_id: TurnId) -> Option<AgentTurn> {
        if self.agent.as_ref().map(|a| a.turn_id) == Some(turn_id) {
            self.agent.take()
        } else {
            debug!(turn_id=%turn_id, "no such agent turn in flight");
            None
        }
    }

    fn record_pending_action(&mut self, agent: &AgentTurn) {
        if let Some(action) = &agent.pending_action {
            self.context
                .set_slot(PENDING_ACTION_SLOT, action.clone(), Some(agent.turn_id));
        }
    }

    fn start_round(&mut self, round: usize) {
        let request = GenerationRequest {
            snapshot: self.context.snapshot(),
            functions: self.functions.specs().to_vec(),
            sampling: self.config.sampling.selected(),
        };
        let Some(agent) = self.agent.as_mut() else {
            return;
        };
        let Some(chunks) = agent.chunks.clone() else {
            return;
        };
        agent.round = round;
        agent.generation = Some(self.generation.spawn_round(
            agent.turn_id,
            round,
            request,
            chunks,
            agent.next_chunk_index,
            self.inbox_tx.clone(),
        ));
    }

    async fn on_pipeline_event(&mut self, ev: PipelineEvent) -> Result<(), EngineError> {
        let now = self.now_ms();
        match ev {
            PipelineEvent::GenerationFinished(report) => self.on_round_finished(report).await,
            PipelineEvent::FirstAudio { turn_id, at_ms } => {
                let Some(agent) = self.agent.as_mut().filter(|a| a.turn_id == turn_id) else {
                    return Ok(());
                };
                if !agent.first_audio {
                    agent.first_audio = true;
                    let latency_ms = at_ms.saturating_sub(agent.user_ended_at_ms);
                    debug!(turn_id=%turn_id, latency_ms=%latency_ms, "first audio out");
                    self.emitter.emit(
                        "latency.first_audio",
                        json!({ "turn_id": turn_id, "latency_ms": latency_ms }),
                    );
                }
                let t = self.controller.on_first_audio(turn_id, now);
                self.apply(t).await
            }
            PipelineEvent::SynthesisFinished { turn_id, result } => {
                let t = match result {
                    Ok(()) => self.controller.on_synthesis_complete(turn_id, now),
                    Err(e) => self.controller.on_synthesis_error(turn_id, &e.to_string(), now),
                };
                self.apply(t).await
            }
        }
    }

    async fn on_round_finished(&mut self, report: RoundReport) -> Result<(), EngineError> {
        let now = self.now_ms();
        let Some(agent) = self
            .agent
            .as_mut()
            .filter(|a| a.turn_id == report.turn_id && a.round == report.round)
        else {
            debug!(turn_id=%report.turn_id, round=%report.round, "stale generation report ignored");
            return Ok(());
        };
        agent.generation = None;
        let text = report.spoken_text.trim();
        if !text.is_empty() {
            if !agent.text.is_empty() {
                agent.text.push(' ');
            }
            agent.text.push_str(text);
        }
        agent.next_chunk_index = report.next_chunk_index;
        if report.pending_action.is_some() {
            agent.pending_action = report.pending_action;
        }
        let (turn_id, round) = (agent.turn_id, agent.round);
        let had_calls = !report.function_calls.is_empty();
        for record in report.function_calls {
            self.function_calls += 1;
            let res = self.context.record_function_call(record);
            self.check_context(res)?;
        }
        if let Some(e) = report.error {
            let t = self.controller.on_generation_error(turn_id, &e.to_string(), now);
            return self.apply(t).await;
        }
        if had_calls {
            if round + 1 < self.config.generation.max_tool_rounds {
                debug!(turn_id=%turn_id, round=%(round + 1), "continuing with function results");
                self.start_round(round + 1);
                return Ok(());
            }
            warn!(turn_id=%turn_id, "function call round limit reached");
        }
        if let Some(agent) = self.agent.as_mut() {
            // closing the chunk channel lets synthesis drain and finish
            agent.chunks = None;
        }
        let t = self.controller.on_generation_complete(turn_id, now);
        self.apply(t).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::FunctionRegistry;
    use crate::providers::{Generator, Synthesizer, Transcriber};
    use crate::scripted::{
        RecordingExecutor, RecordingTransport, ScriptStep, ScriptedGenerator, ScriptedSynthesizer,
        ScriptedTranscriber,
    };
    use crate::types::CallState;

    struct Harness {
        transcriber: Arc<ScriptedTranscriber>,
        generator: Arc<ScriptedGenerator>,
        transport: Arc<RecordingTransport>,
        deps: SessionDeps,
    }

    fn harness() -> Harness {
        let config = EngineConfig::default();
        let transcriber = Arc::new(ScriptedTranscriber::new());
        let generator = Arc::new(ScriptedGenerator::new());
        let transport = Arc::new(RecordingTransport::new());
        let deps = SessionDeps {
            transcriber: Arc::new(ResilientTranscriber::new(
                "transcriber",
                vec![("scripted".into(), transcriber.clone() as Arc<dyn Transcriber>)],
                &config.providers,
            )),
            generator: Arc::new(ResilientGenerator::new(
                "generator",
                vec![("scripted".into(), generator.clone() as Arc<dyn Generator>)],
                &config.providers,
            )),
            synthesizer: Arc::new(ResilientSynthesizer::new(
                "synthesizer",
                vec![(
                    "scripted".into(),
                    Arc::new(ScriptedSynthesizer::new()) as Arc<dyn Synthesizer>,
                )],
                &config.providers,
            )),
            functions: Arc::new(FunctionRegistry::default()),
            executor: Arc::new(RecordingExecutor::new(json!({}))),
            transport: transport.clone(),
        };
        Harness {
            transcriber,
            generator,
            transport,
            deps,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transcript_without_vad_gets_an_answer() {
        let h = harness();
        let stream = h.transcriber.push_session();
        h.generator.push_script(ScriptStep::tokens(&["Hello there."]));
        let session = CallSession::new(
            Call::new("acme", "us-east"),
            Arc::new(EngineConfig::default()),
            h.deps.clone(),
            EventEmitter::disabled(uuid::Uuid::new_v4()),
        );
        let (audio_tx, audio_rx) = mpsc::channel(8);
        let call = tokio::spawn(session.run(audio_rx, None));

        stream
            .events
            .send(Ok(TranscriptEvent::final_result(1, 1, "hi", 0.9)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        drop(audio_tx);
        let summary = call.await.unwrap();

        assert_eq!(summary.call.state, CallState::Ended(CallEndReason::Hangup));
        let turns: Vec<(TurnId, &str)> = summary
            .turns
            .iter()
            .map(|t| (t.turn_id, t.content.as_str()))
            .collect();
        assert_eq!(turns, vec![(TurnId(1), "hi"), (TurnId(2), "Hello there.")]);
        assert_eq!(h.transport.frames().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn generation_failure_is_reported_and_call_continues() {
        let h = harness();
        let stream = h.transcriber.push_session();
        h.generator.push_start_error(ProviderError::PolicyViolation {
            provider: "scripted".into(),
            message: "blocked".into(),
        });
        h.generator.push_script(ScriptStep::tokens(&["Second try."]));
        let session = CallSession::new(
            Call::new("acme", "us-east"),
            Arc::new(EngineConfig::default()),
            h.deps.clone(),
            EventEmitter::disabled(uuid::Uuid::new_v4()),
        );
        let (audio_tx, audio_rx) = mpsc::channel(8);
        let call = tokio::spawn(session.run(audio_rx, None));

        stream
            .events
            .send(Ok(TranscriptEvent::final_result(1, 1, "first", 0.9)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        stream
            .events
            .send(Ok(TranscriptEvent::final_result(2, 1, "again", 0.9)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        drop(audio_tx);
        let summary = call.await.unwrap();

        assert_eq!(summary.errors, 1);
        let contents: Vec<&str> = summary.turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "", "again", "Second try."]);
        assert!(!summary.turns[1].interrupted);
    }

    #[tokio::test(start_paused = true)]
    async fn hangup_mid_turn_keeps_only_delivered_words() {
        let h = harness();
        let transport = Arc::new(RecordingTransport::paced());
        let deps = SessionDeps {
            transport: transport.clone(),
            ..h.deps.clone()
        };
        let stream = h.transcriber.push_session();
        h.generator
            .push_script(ScriptStep::tokens(&["One two three four five six."]));
        let session = CallSession::new(
            Call::new("acme", "us-east"),
            Arc::new(EngineConfig::default()),
            deps,
            EventEmitter::disabled(uuid::Uuid::new_v4()),
        );
        let (audio_tx, audio_rx) = mpsc::channel(8);
        let call = tokio::spawn(session.run(audio_rx, None));

        stream
            .events
            .send(Ok(TranscriptEvent::final_result(1, 1, "count", 0.9)))
            .await
            .unwrap();
        // 700ms endpoint, then two 100ms word frames
        tokio::time::sleep(Duration::from_millis(950)).await;
        drop(audio_tx);
        let summary = call.await.unwrap();

        let agent = &summary.turns[1];
        assert_eq!(agent.content, "One two");
        assert!(agent.interrupted);
        assert_eq!(summary.interruptions, 1);
        assert_eq!(transport.clears(), 1);
    }
}
