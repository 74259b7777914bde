//! Drives the generator for one agent turn, one round at a time.
//!
//! A round streams tokens, cuts them into sentence chunks for synthesis as soon as each boundary
//! is seen, and validates and executes any function calls the model proposes. The session starts
//! a further round when a round ends with function calls.

use crate::context::FunctionRecord;
use crate::error::ProviderError;
use crate::events::EventEmitter;
use crate::functions::{failure_result, rejection_result, FunctionExecutor, FunctionRegistry};
use crate::providers::{next_or_idle, GenerationItem, GenerationRequest};
use crate::resilience::ResilientGenerator;
use crate::sentence::SentenceBuffer;
use crate::session::PipelineEvent;
use crate::types::{FunctionCall, FunctionCallRef, FunctionCallStatus, SentenceChunk, TurnId};

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// What one generation round produced.
#[derive(Debug)]
pub struct RoundReport {
    pub turn_id: TurnId,
    pub round: usize,
    pub text: String,
    /// Text of the chunks released as speakable; excludes sentences held back by a rejected call.
    pub spoken_text: String,
    pub function_calls: Vec<FunctionRecord>,
    /// Name of the last function that executed successfully.
    pub pending_action: Option<String>,
    pub next_chunk_index: usize,
    pub error: Option<ProviderError>,
}

#[derive(Debug)]
pub struct GenerationAck {
    pub generated_text: String,
    pub acknowledged: bool,
}

pub struct GenerationHandle {
    pub turn_id: TurnId,
    pub round: usize,
    cancel: CancellationToken,
    text: watch::Receiver<String>,
    task: Option<JoinHandle<()>>,
}

impl GenerationHandle {
    /// Text generated so far in this round.
    pub fn generated_text(&self) -> String {
        self.text.borrow().clone()
    }

    /// Stop the round. Idempotent; waits at most `budget` for the task to acknowledge.
    pub async fn cancel(&mut self, budget: Duration) -> GenerationAck {
        self.cancel.cancel();
        let acknowledged = match self.task.take() {
            Some(mut task) => match timeout(budget, &mut task).await {
                Ok(_) => true,
                Err(_) => {
                    warn!(turn_id=%self.turn_id, "generation did not acknowledge cancel in budget");
                    false
                }
            },
            None => true,
        };
        GenerationAck {
            generated_text: self.generated_text(),
            acknowledged,
        }
    }
}

#[derive(Clone)]
pub struct GenerationPipeline {
    generator: Arc<ResilientGenerator>,
    functions: Arc<FunctionRegistry>,
    executor: Arc<dyn FunctionExecutor>,
    idle_timeout: Duration,
    function_timeout: Duration,
    emitter: EventEmitter,
}

impl GenerationPipeline {
    pub fn new(
        generator: Arc<ResilientGenerator>,
        functions: Arc<FunctionRegistry>,
        executor: Arc<dyn FunctionExecutor>,
        idle_timeout: Duration,
        function_timeout: Duration,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            generator,
            functions,
            executor,
            idle_timeout,
            function_timeout,
            emitter,
        }
    }

    /// Spawn one round. Chunks are numbered from `first_chunk_index`; the report goes to `inbox`
    /// unless the round is cancelled.
    pub fn spawn_round(
        &self,
        turn_id: TurnId,
        round: usize,
        request: GenerationRequest,
        chunks: mpsc::Sender<SentenceChunk>,
        first_chunk_index: usize,
        inbox: mpsc::Sender<PipelineEvent>,
    ) -> GenerationHandle {
        let cancel = CancellationToken::new();
        let (text_tx, text) = watch::channel(String::new());
        let task = RoundTask {
            pipeline: self.clone(),
            turn_id,
            round,
            request,
            chunks,
            cancel: cancel.clone(),
            text_tx,
        };
        self.emitter.emit(
            "generation.started",
            json!({ "turn_id": turn_id, "round": round }),
        );
        let task = tokio::spawn(task.run(first_chunk_index, inbox));
        GenerationHandle {
            turn_id,
            round,
            cancel,
            text,
            task: Some(task),
        }
    }
}

struct RoundTask {
    pipeline: GenerationPipeline,
    turn_id: TurnId,
    round: usize,
    request: GenerationRequest,
    chunks: mpsc::Sender<SentenceChunk>,
    cancel: CancellationToken,
    text_tx: watch::Sender<String>,
}

impl RoundTask {
    async fn run(self, first_chunk_index: usize, inbox: mpsc::Sender<PipelineEvent>) {
        let report = self.generate(first_chunk_index).await;
        if self.cancel.is_cancelled() {
            debug!(turn_id=%self.turn_id, round=%self.round, "generation round cancelled");
            self.pipeline.emitter.emit(
                "generation.cancelled",
                json!({ "turn_id": self.turn_id, "round": self.round }),
            );
            return;
        }
        self.pipeline.emitter.emit(
            "generation.finished",
            json!({
                "turn_id": self.turn_id,
                "round": self.round,
                "chunks": report.next_chunk_index - first_chunk_index,
                "function_calls": report.function_calls.len(),
                "error": report.error.as_ref().map(|e| e.kind()),
            }),
        );
        if inbox.send(PipelineEvent::GenerationFinished(report)).await.is_err() {
            debug!(turn_id=%self.turn_id, "session gone before generation report");
        }
    }

    fn append_text(&self, report: &mut RoundReport, text: &str, separate: bool) {
        if separate && !report.text.is_empty() && !report.text.ends_with(char::is_whitespace) {
            report.text.push(' ');
        }
        report.text.push_str(text);
        self.text_tx.send_replace(report.text.clone());
    }

    fn note_spoken(report: &mut RoundReport, chunk: &SentenceChunk) {
        if !chunk.is_speakable() {
            return;
        }
        if !report.spoken_text.is_empty() {
            report.spoken_text.push(' ');
        }
        report.spoken_text.push_str(chunk.text.trim());
    }

    /// Forward a chunk downstream unless cancelled; false means stop the round.
    async fn send_chunk(&self, chunk: SentenceChunk) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            res = self.chunks.send(chunk) => res.is_ok(),
        }
    }

    /// Chunks produced after a function call proposal wait for that call's outcome.
    async fn emit(
        &self,
        text: String,
        proposals: &[FunctionCall],
        deferred: &mut Vec<SentenceChunk>,
        report: &mut RoundReport,
    ) -> bool {
        let chunk = SentenceChunk {
            turn_id: self.turn_id,
            index: report.next_chunk_index,
            text,
            function_call: proposals.last().map(|c| FunctionCallRef {
                tool_call_id: c.tool_call_id.clone(),
                status: FunctionCallStatus::Pending,
            }),
        };
        report.next_chunk_index += 1;
        if chunk.function_call.is_some() {
            deferred.push(chunk);
            return true;
        }
        Self::note_spoken(report, &chunk);
        self.send_chunk(chunk).await
    }

    async fn generate(&self, first_chunk_index: usize) -> RoundReport {
        let mut report = RoundReport {
            turn_id: self.turn_id,
            round: self.round,
            text: String::new(),
            spoken_text: String::new(),
            function_calls: vec![],
            pending_action: None,
            next_chunk_index: first_chunk_index,
            error: None,
        };
        let generator = &self.pipeline.generator;
        let mut stream = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return report,
            res = generator.start(&self.request) => match res {
                Ok(stream) => stream,
                Err(e) => {
                    report.error = Some(e);
                    return report;
                }
            },
        };

        let mut sentences = SentenceBuffer::new();
        let mut proposals: Vec<FunctionCall> = vec![];
        let mut deferred: Vec<SentenceChunk> = vec![];
        loop {
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return report,
                item = next_or_idle(&mut stream, self.pipeline.idle_timeout, "generator") => item,
            };
            match item {
                None => break,
                Some(Err(e)) => {
                    warn!(turn_id=%self.turn_id, error=%e, "generation stream failed");
                    report.error = Some(e);
                    return report;
                }
                Some(Ok(GenerationItem::Token(token))) => {
                    self.append_text(&mut report, &token, false);
                    for s in sentences.push(&token) {
                        if !self.emit(s, &proposals, &mut deferred, &mut report).await {
                            return report;
                        }
                    }
                }
                Some(Ok(GenerationItem::Sentence(sentence))) => {
                    self.append_text(&mut report, &sentence, true);
                    let pending = sentences.finish().into_iter().chain(Some(sentence));
                    for s in pending {
                        if !self.emit(s, &proposals, &mut deferred, &mut report).await {
                            return report;
                        }
                    }
                }
                Some(Ok(GenerationItem::FunctionCallProposal {
                    tool_call_id,
                    name,
                    arguments,
                })) => {
                    if let Some(s) = sentences.finish() {
                        if !self.emit(s, &proposals, &mut deferred, &mut report).await {
                            return report;
                        }
                    }
                    debug!(turn_id=%self.turn_id, function=%name, "function call proposed");
                    proposals.push(FunctionCall::proposed(
                        Uuid::new_v4(),
                        tool_call_id,
                        name,
                        arguments,
                    ));
                }
            }
        }
        if let Some(s) = sentences.finish() {
            if !self.emit(s, &proposals, &mut deferred, &mut report).await {
                return report;
            }
        }

        for call in proposals {
            let Some(record) = self.resolve(call).await else {
                return report;
            };
            if record.call.status == FunctionCallStatus::Executed {
                report.pending_action = Some(record.call.name.clone());
            }
            report.function_calls.push(record);
        }

        for mut chunk in deferred {
            if let Some(r) = chunk.function_call.as_mut() {
                r.status = report
                    .function_calls
                    .iter()
                    .find(|rec| rec.call.tool_call_id == r.tool_call_id)
                    .map(|rec| rec.call.status)
                    .unwrap_or(FunctionCallStatus::Rejected);
            }
            Self::note_spoken(&mut report, &chunk);
            if !self.send_chunk(chunk).await {
                return report;
            }
        }
        report
    }

    /// Validate, then execute. Rejected calls never reach the executor. `None` when cancelled.
    async fn resolve(&self, mut call: FunctionCall) -> Option<FunctionRecord> {
        let emitter = &self.pipeline.emitter;
        let args = match self.pipeline.functions.validate(&call.name, &call.arguments) {
            Ok(args) => args,
            Err(e) => {
                warn!(function=%call.name, error=%e, "function call rejected");
                call.status = FunctionCallStatus::Rejected;
                emitter.emit(
                    "function_call.rejected",
                    json!({ "turn_id": self.turn_id, "name": call.name, "tool_call_id": call.tool_call_id, "reason": e.kind() }),
                );
                return Some(FunctionRecord::new(call, Some(rejection_result(&e))));
            }
        };
        call.status = FunctionCallStatus::Validated;
        let spec = self.pipeline.functions.get(&call.name)?.clone();
        let executed = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            res = timeout(self.pipeline.function_timeout, self.pipeline.executor.execute(&spec, &args)) => res,
        };
        let result = match executed {
            Ok(Ok(value)) => {
                call.status = FunctionCallStatus::Executed;
                value
            }
            Ok(Err(e)) => {
                warn!(function=%call.name, error=%e, "function call failed");
                call.status = FunctionCallStatus::Failed;
                failure_result(e.kind(), &e.to_string())
            }
            Err(_) => {
                warn!(function=%call.name, "function call timed out");
                call.status = FunctionCallStatus::Failed;
                failure_result("timeout", "function did not answer in time")
            }
        };
        emitter.emit(
            "function_call.completed",
            json!({ "turn_id": self.turn_id, "name": call.name, "tool_call_id": call.tool_call_id, "status": call.status }),
        );
        Some(FunctionRecord::new(call, Some(result)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, ProvidersConfig, SamplingConfig};
    use crate::context::ContextStore;
    use crate::providers::Generator;
    use crate::scripted::{RecordingExecutor, ScriptStep, ScriptedGenerator};

    fn pipeline(
        generator: Arc<ScriptedGenerator>,
        executor: Arc<RecordingExecutor>,
    ) -> GenerationPipeline {
        let config = EngineConfig::from_toml(
            r#"
            [[functions]]
            name = "get_order_status"
            endpoint = "http://localhost/orders"
            [[functions.parameters]]
            name = "order_id"
            type = "string"
            required = true
            "#,
        )
        .unwrap();
        let resilient = Arc::new(ResilientGenerator::new(
            "generator",
            vec![("scripted".to_string(), generator as Arc<dyn Generator>)],
            &ProvidersConfig::default(),
        ));
        GenerationPipeline::new(
            resilient,
            Arc::new(FunctionRegistry::from_config(&config.functions)),
            executor,
            Duration::from_secs(5),
            Duration::from_secs(1),
            EventEmitter::disabled(Uuid::new_v4()),
        )
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            snapshot: ContextStore::new("system", &Default::default()).snapshot(),
            functions: vec![],
            sampling: SamplingConfig::default().selected(),
        }
    }

    async fn finished(inbox: &mut mpsc::Receiver<PipelineEvent>) -> RoundReport {
        match inbox.recv().await {
            Some(PipelineEvent::GenerationFinished(report)) => report,
            _ => panic!("expected a generation report"),
        }
    }

    #[tokio::test]
    async fn chunks_flow_at_sentence_boundaries() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_script(ScriptStep::tokens(&["I can ", "help with that.", " Anything ", "else?"]));
        let p = pipeline(generator, Arc::new(RecordingExecutor::new(json!({}))));
        let (chunk_tx, mut chunk_rx) = mpsc::channel(8);
        let (inbox_tx, mut inbox) = mpsc::channel(8);
        let _handle = p.spawn_round(TurnId(2), 0, request(), chunk_tx, 0, inbox_tx);

        let first = chunk_rx.recv().await.unwrap();
        assert_eq!(first.text, "I can help with that.");
        assert_eq!(first.index, 0);
        let second = chunk_rx.recv().await.unwrap();
        assert_eq!((second.index, second.text.as_str()), (1, "Anything else?"));

        let report = finished(&mut inbox).await;
        assert_eq!(report.text, "I can help with that. Anything else?");
        assert_eq!(report.spoken_text, report.text);
        assert_eq!(report.next_chunk_index, 2);
        assert!(report.error.is_none());
    }

    #[tokio::test]
    async fn rejected_calls_are_never_executed() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_script(vec![
            ScriptStep::Call {
                tool_call_id: "call_1".into(),
                name: "get_order_status".into(),
                arguments: r#"{"order_id": 123}"#.into(),
            },
            ScriptStep::Token("It has shipped. ".into()),
        ]);
        let executor = Arc::new(RecordingExecutor::new(json!({"status": "shipped"})));
        let p = pipeline(generator, executor.clone());
        let (chunk_tx, mut chunk_rx) = mpsc::channel(8);
        let (inbox_tx, mut inbox) = mpsc::channel(8);
        let _handle = p.spawn_round(TurnId(2), 0, request(), chunk_tx, 0, inbox_tx);

        let report = finished(&mut inbox).await;
        assert_eq!(report.function_calls.len(), 1);
        let record = &report.function_calls[0];
        assert_eq!(record.call.status, FunctionCallStatus::Rejected);
        assert_eq!(
            record.result.as_ref().unwrap()["error"]["kind"],
            "type_mismatch"
        );
        assert!(executor.calls().is_empty());
        assert!(report.pending_action.is_none());
        assert_eq!(report.text, "It has shipped. ");
        assert_eq!(report.spoken_text, "");

        // the dependent sentence is released, marked unspeakable
        let chunk = chunk_rx.recv().await.unwrap();
        assert!(!chunk.is_speakable());
    }

    #[tokio::test]
    async fn validated_calls_execute() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_script(vec![ScriptStep::Call {
            tool_call_id: "call_1".into(),
            name: "get_order_status".into(),
            arguments: r#"{"order_id": "123"}"#.into(),
        }]);
        let executor = Arc::new(RecordingExecutor::new(json!({"status": "shipped"})));
        let p = pipeline(generator, executor.clone());
        let (chunk_tx, _chunk_rx) = mpsc::channel(8);
        let (inbox_tx, mut inbox) = mpsc::channel(8);
        let _handle = p.spawn_round(TurnId(2), 0, request(), chunk_tx, 0, inbox_tx);

        let report = finished(&mut inbox).await;
        assert_eq!(report.function_calls[0].call.status, FunctionCallStatus::Executed);
        assert_eq!(report.pending_action.as_deref(), Some("get_order_status"));
        assert_eq!(executor.calls(), vec!["get_order_status".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent_and_silences_the_round() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator.push_script(vec![
            ScriptStep::Token("Your order ".into()),
            ScriptStep::Delay(Duration::from_millis(500)),
            ScriptStep::Token("will arrive. ".into()),
        ]);
        let p = pipeline(generator, Arc::new(RecordingExecutor::new(json!({}))));
        let (chunk_tx, mut chunk_rx) = mpsc::channel(8);
        let (inbox_tx, mut inbox) = mpsc::channel(8);
        let mut handle = p.spawn_round(TurnId(2), 0, request(), chunk_tx, 0, inbox_tx);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let ack = handle.cancel(Duration::from_millis(100)).await;
        assert!(ack.acknowledged);
        assert_eq!(ack.generated_text, "Your order ");
        let again = handle.cancel(Duration::from_millis(100)).await;
        assert!(again.acknowledged);

        assert!(chunk_rx.recv().await.is_none());
        assert!(inbox.recv().await.is_none());
    }
}
