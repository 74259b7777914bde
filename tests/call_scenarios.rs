use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use turn_engine::config::{EngineConfig, ParameterConfig};
use turn_engine::context::ContextEntry;
use turn_engine::events::{EngineEvent, EventEmitter};
use turn_engine::functions::{FunctionRegistry, FunctionSpec, ParamType};
use turn_engine::providers::{Generator, Synthesizer, Transcriber};
use turn_engine::resilience::{ResilientGenerator, ResilientSynthesizer, ResilientTranscriber};
use turn_engine::scripted::{
    RecordingExecutor, RecordingTransport, ScriptStep, ScriptedGenerator, ScriptedStream,
    ScriptedSynthesizer, ScriptedTranscriber,
};
use turn_engine::session::{CallSession, CallSummary, SessionDeps};
use turn_engine::types::{Call, FunctionCallStatus, TranscriptEvent, VadEvent};
use uuid::Uuid;

struct Rig {
    stream: ScriptedStream,
    generator: Arc<ScriptedGenerator>,
    synthesizer: Arc<ScriptedSynthesizer>,
    executor: Arc<RecordingExecutor>,
    transport: Arc<RecordingTransport>,
    audio: mpsc::Sender<Vec<u8>>,
    events: mpsc::Receiver<EngineEvent>,
    call: JoinHandle<CallSummary>,
}

impl Rig {
    fn start(transport: RecordingTransport, functions: FunctionRegistry, scripts: Vec<Vec<ScriptStep>>) -> Rig {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let config = Arc::new(EngineConfig::default());
        let transcriber = Arc::new(ScriptedTranscriber::new());
        let stream = transcriber.push_session();
        let generator = Arc::new(ScriptedGenerator::new());
        for script in scripts {
            generator.push_script(script);
        }
        let synthesizer = Arc::new(ScriptedSynthesizer::new());
        let executor = Arc::new(RecordingExecutor::new(json!({"status": "shipped"})));
        let transport = Arc::new(transport);
        let deps = SessionDeps {
            transcriber: Arc::new(ResilientTranscriber::new(
                "transcriber",
                vec![("scripted".into(), transcriber as Arc<dyn Transcriber>)],
                &config.providers,
            )),
            generator: Arc::new(ResilientGenerator::new(
                "generator",
                vec![("scripted".into(), generator.clone() as Arc<dyn Generator>)],
                &config.providers,
            )),
            synthesizer: Arc::new(ResilientSynthesizer::new(
                "synthesizer",
                vec![("scripted".into(), synthesizer.clone() as Arc<dyn Synthesizer>)],
                &config.providers,
            )),
            functions: Arc::new(functions),
            executor: executor.clone(),
            transport: transport.clone(),
        };
        let (events_tx, events) = mpsc::channel(4_096);
        let call = Call::new("acme", "us-east");
        let emitter = EventEmitter::new(call.call_id, events_tx);
        let session = CallSession::new(call, config, deps, emitter);
        let (audio, audio_rx) = mpsc::channel(8);
        let call = tokio::spawn(session.run(audio_rx, None));
        Rig {
            stream,
            generator,
            synthesizer,
            executor,
            transport,
            audio,
            events,
            call,
        }
    }

    async fn vad(&self, ev: VadEvent) {
        self.stream.vad.send(ev).await.unwrap();
    }

    async fn transcript(&self, ev: TranscriptEvent) {
        self.stream.events.send(Ok(ev)).await.unwrap();
    }

    /// Hang up and collect the summary plus every event emitted.
    async fn hang_up(mut self) -> (CallSummary, Vec<EngineEvent>) {
        drop(self.audio);
        let summary = self.call.await.unwrap();
        let mut events = vec![];
        while let Ok(ev) = self.events.try_recv() {
            events.push(ev);
        }
        (summary, events)
    }
}

fn payloads<'a>(events: &'a [EngineEvent], event_type: &str) -> Vec<&'a Value> {
    events
        .iter()
        .filter(|e| e.event_type == event_type)
        .map(|e| &e.payload)
        .collect()
}

fn order_functions() -> FunctionRegistry {
    FunctionRegistry::new(vec![FunctionSpec {
        name: "get_order_status".into(),
        description: "Look up the shipping status of an order".into(),
        endpoint: None,
        parameters: vec![ParameterConfig {
            name: "order_id".into(),
            param_type: ParamType::String,
            description: "Order number".into(),
            required: true,
            enum_values: None,
        }],
    }])
}

#[tokio::test(start_paused = true)]
async fn first_audio_follows_endpoint_quickly() {
    let rig = Rig::start(
        RecordingTransport::new(),
        FunctionRegistry::default(),
        vec![ScriptStep::tokens(&["Your order ", "shipped yesterday. ", "Anything else?"])],
    );

    rig.vad(VadEvent::SpeechStart).await;
    rig.transcript(TranscriptEvent::final_result(1, 1, "where is my order", 0.95))
        .await;
    sleep(Duration::from_millis(1_000)).await;
    rig.vad(VadEvent::SpeechEnd).await;
    sleep(Duration::from_secs(3)).await;
    let (summary, events) = rig.hang_up().await;

    let speech_end_ms = payloads(&events, "vad")
        .iter()
        .filter(|p| p["event"] == "speech_end")
        .map(|p| p["at_ms"].as_u64().unwrap())
        .last()
        .unwrap();
    let user_ended_ms = summary.turns[0].ended_at_ms.unwrap();
    assert_eq!(user_ended_ms - speech_end_ms, 700);

    let latency = payloads(&events, "latency.first_audio");
    assert_eq!(latency.len(), 1);
    assert!(latency[0]["latency_ms"].as_u64().unwrap() <= 250);

    assert_eq!(summary.turns[1].content, "Your order shipped yesterday. Anything else?");
    assert!(!summary.turns[1].interrupted);
}

#[tokio::test(start_paused = true)]
async fn barge_in_keeps_only_what_was_heard() {
    let rig = Rig::start(
        RecordingTransport::paced(),
        FunctionRegistry::default(),
        vec![
            ScriptStep::tokens(&["Your order will arrive on Tuesday. ", "It ships by ground."]),
            ScriptStep::tokens(&["Sure, go ahead."]),
        ],
    );

    rig.vad(VadEvent::SpeechStart).await;
    rig.transcript(TranscriptEvent::final_result(1, 1, "where is my order", 0.95))
        .await;
    sleep(Duration::from_millis(1_000)).await;
    rig.vad(VadEvent::SpeechEnd).await;
    // endpoint at +700ms, then one 100ms frame per word; "on" finishes at +1200ms
    sleep(Duration::from_millis(1_250)).await;
    rig.vad(VadEvent::SpeechStart).await;
    rig.transcript(TranscriptEvent::partial(2, 1, "wait actually")).await;
    sleep(Duration::from_millis(500)).await;
    rig.vad(VadEvent::SpeechEnd).await;
    sleep(Duration::from_secs(3)).await;
    let transport = rig.transport.clone();
    let (summary, events) = rig.hang_up().await;

    let agent = &summary.turns[1];
    assert_eq!(agent.content, "Your order will arrive on");
    assert_eq!(agent.delivered_content, "Your order will arrive on");
    assert!(agent.interrupted);
    assert_eq!(summary.turns[2].content, "wait actually");
    assert_eq!(summary.turns[3].content, "Sure, go ahead.");
    assert_eq!(summary.interruptions, 1);
    assert_eq!(transport.clears(), 1);
    assert_eq!(payloads(&events, "turn.interrupted").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn rejected_call_is_reported_back_and_never_executed() {
    let rig = Rig::start(
        RecordingTransport::new(),
        order_functions(),
        vec![
            vec![ScriptStep::Call {
                tool_call_id: "call_1".into(),
                name: "get_order_status".into(),
                arguments: r#"{"order_id": 123}"#.into(),
            }],
            ScriptStep::tokens(&["Could you read me the order number again?"]),
        ],
    );

    rig.transcript(TranscriptEvent::final_result(1, 1, "check order one two three", 0.9))
        .await;
    sleep(Duration::from_secs(3)).await;
    let generator = rig.generator.clone();
    let executor = rig.executor.clone();
    let (summary, events) = rig.hang_up().await;

    assert!(executor.calls().is_empty());
    let requests = generator.requests();
    assert_eq!(requests.len(), 2);
    let record = requests[1]
        .snapshot
        .entries
        .iter()
        .find_map(|e| match e {
            ContextEntry::Function(r) => Some(r),
            _ => None,
        })
        .unwrap();
    assert_eq!(record.call.status, FunctionCallStatus::Rejected);
    assert_eq!(record.result.as_ref().unwrap()["error"]["kind"], "type_mismatch");

    assert_eq!(summary.function_calls, 1);
    assert_eq!(summary.turns[1].content, "Could you read me the order number again?");
    assert_eq!(payloads(&events, "function_call.rejected").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn text_held_back_by_a_rejected_call_is_never_remembered() {
    let rig = Rig::start(
        RecordingTransport::new(),
        order_functions(),
        vec![
            vec![
                ScriptStep::Call {
                    tool_call_id: "call_1".into(),
                    name: "get_order_status".into(),
                    arguments: r#"{"order_id": 123}"#.into(),
                },
                ScriptStep::Token("It has shipped. ".into()),
            ],
            ScriptStep::tokens(&["Could you repeat the number?"]),
        ],
    );

    rig.transcript(TranscriptEvent::final_result(1, 1, "where is order one two three", 0.9))
        .await;
    sleep(Duration::from_secs(3)).await;
    let synthesizer = rig.synthesizer.clone();
    let (summary, events) = rig.hang_up().await;

    assert_eq!(synthesizer.texts(), vec!["Could you repeat the number?".to_string()]);
    let agent = &summary.turns[1];
    assert_eq!(agent.content, "Could you repeat the number?");
    assert_eq!(agent.delivered_content, "Could you repeat the number?");
    assert!(!agent.interrupted);
    assert_eq!(payloads(&events, "synthesis.refused").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn validated_call_runs_before_the_answer() {
    let rig = Rig::start(
        RecordingTransport::new(),
        order_functions(),
        vec![
            vec![ScriptStep::Call {
                tool_call_id: "call_1".into(),
                name: "get_order_status".into(),
                arguments: r#"{"order_id": "A123"}"#.into(),
            }],
            ScriptStep::tokens(&["It shipped this morning."]),
        ],
    );

    rig.transcript(TranscriptEvent::final_result(1, 1, "status of order A123", 0.9))
        .await;
    sleep(Duration::from_secs(3)).await;
    let generator = rig.generator.clone();
    let executor = rig.executor.clone();
    let (summary, _) = rig.hang_up().await;

    assert_eq!(executor.calls(), vec!["get_order_status".to_string()]);
    let requests = generator.requests();
    let executed = requests[1].snapshot.entries.iter().any(|e| {
        matches!(e, ContextEntry::Function(r)
            if r.call.status == FunctionCallStatus::Executed
                && r.result == Some(json!({"status": "shipped"})))
    });
    assert!(executed);
    assert_eq!(summary.turns[1].content, "It shipped this morning.");
}

#[tokio::test(start_paused = true)]
async fn short_blips_do_not_interrupt() {
    let rig = Rig::start(
        RecordingTransport::paced(),
        FunctionRegistry::default(),
        vec![ScriptStep::tokens(&[
            "One two three four five six seven eight nine ten.",
        ])],
    );

    // no VAD for the first turn: the transcript alone opens it and endpoints at +700ms
    rig.transcript(TranscriptEvent::final_result(1, 1, "count to ten", 0.9))
        .await;
    sleep(Duration::from_millis(800)).await;
    rig.vad(VadEvent::SpeechStart).await;
    rig.transcript(TranscriptEvent::partial(2, 1, "uh")).await;
    sleep(Duration::from_millis(100)).await;
    rig.vad(VadEvent::SpeechEnd).await;
    sleep(Duration::from_millis(100)).await;
    rig.vad(VadEvent::SpeechStart).await;
    rig.transcript(TranscriptEvent::partial(3, 1, "hmm")).await;
    sleep(Duration::from_millis(100)).await;
    rig.vad(VadEvent::SpeechEnd).await;
    sleep(Duration::from_millis(150)).await;
    // a two-word utterance at 1250ms does interrupt
    rig.vad(VadEvent::SpeechStart).await;
    rig.transcript(TranscriptEvent::partial(4, 1, "hold on")).await;
    sleep(Duration::from_millis(100)).await;
    let (summary, events) = rig.hang_up().await;

    assert_eq!(summary.interruptions, 1);
    assert_eq!(payloads(&events, "turn.interrupted").len(), 1);
    // blips never became turns; the "hold on" turn is still open at hangup
    assert_eq!(summary.turns.len(), 2);
    let agent = &summary.turns[1];
    assert!(agent.interrupted);
    assert_eq!(agent.content, "One two three four five");
}

#[tokio::test(start_paused = true)]
async fn transcriber_outage_is_survived() {
    let rig = Rig::start(
        RecordingTransport::new(),
        FunctionRegistry::default(),
        vec![],
    );

    rig.stream
        .events
        .send(Err(turn_engine::error::ProviderError::Connection {
            provider: "scripted".into(),
            message: "reset".into(),
        }))
        .await
        .unwrap();
    // the restart finds no session queued and keeps retrying
    sleep(Duration::from_secs(5)).await;
    let (summary, events) = rig.hang_up().await;

    assert!(summary.errors >= 2);
    assert!(summary.call.state != turn_engine::types::CallState::Active);
    assert!(payloads(&events, "error")
        .iter()
        .any(|p| p["stage"] == "transcription"));
}
