use turn_engine::config::{EngineConfig, Secrets};
use turn_engine::deepgram::{DeepgramSpeaker, DeepgramTranscriber};
use turn_engine::error::ConfigError;
use turn_engine::events::log_events;
use turn_engine::functions::{FunctionRegistry, WebhookExecutor};
use turn_engine::handlers;
use turn_engine::openai::OpenAIGenerator;
use turn_engine::providers::{Generator, Synthesizer, Transcriber};
use turn_engine::resilience::Resilient;
use turn_engine::types::AppState;

use axum::{
    routing::{get, post},
    Router,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;

fn unknown_provider(capability: &str, name: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: format!("providers.{capability}"),
        message: format!("unknown provider '{name}'"),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let config = EngineConfig::load(None)?;

    let level = LevelFilter::from_str(&config.server.log_level).unwrap_or(LevelFilter::DEBUG);
    let subscriber = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_file(true)
                .with_line_number(true),
        )
        .with(tracing_subscriber::filter::Targets::new().with_targets([
            ("hyper", LevelFilter::OFF),
            ("turn_engine", level),
        ]));
    tracing::subscriber::set_global_default(subscriber)?;

    let secrets = Secrets::from_env()?;
    let http_client = reqwest::Client::new();
    let providers = &config.providers;

    let mut transcribers: Vec<(String, Arc<dyn Transcriber>)> = vec![];
    for name in &providers.transcriber {
        let provider: Arc<dyn Transcriber> = match name.as_str() {
            "deepgram" => Arc::new(DeepgramTranscriber::new(
                secrets.deepgram_api_key.clone(),
                providers.deepgram.clone(),
            )),
            other => return Err(unknown_provider("transcriber", other).into()),
        };
        transcribers.push((name.clone(), provider));
    }
    let mut generators: Vec<(String, Arc<dyn Generator>)> = vec![];
    for name in &providers.generator {
        let provider: Arc<dyn Generator> = match name.as_str() {
            "openai" => Arc::new(OpenAIGenerator::new(
                http_client.clone(),
                secrets.openai_api_key.clone(),
                providers.openai.clone(),
            )),
            other => return Err(unknown_provider("generator", other).into()),
        };
        generators.push((name.clone(), provider));
    }
    let mut synthesizers: Vec<(String, Arc<dyn Synthesizer>)> = vec![];
    for name in &providers.synthesizer {
        let provider: Arc<dyn Synthesizer> = match name.as_str() {
            "deepgram" => Arc::new(DeepgramSpeaker::new(
                http_client.clone(),
                secrets.deepgram_api_key.clone(),
                providers.deepgram.clone(),
            )),
            other => return Err(unknown_provider("synthesizer", other).into()),
        };
        synthesizers.push((name.clone(), provider));
    }

    let (events, events_rx) = mpsc::channel(config.events.buffer);
    tokio::spawn(log_events(events_rx));

    let bind = SocketAddr::from_str(&config.server.bind).map_err(|e| ConfigError::InvalidValue {
        field: "server.bind".to_string(),
        message: e.to_string(),
    })?;
    let app_state = Arc::new(AppState {
        transcriber: Arc::new(Resilient::new("transcriber", transcribers, providers)),
        generator: Arc::new(Resilient::new("generator", generators, providers)),
        synthesizer: Arc::new(Resilient::new("synthesizer", synthesizers, providers)),
        functions: Arc::new(FunctionRegistry::from_config(&config.functions)),
        executor: Arc::new(WebhookExecutor::new(http_client)),
        events,
        streams: Arc::new(Mutex::new(HashMap::new())),
        config: Arc::new(config),
    });

    let app = Router::new()
        .route("/connect", get(handlers::ws_handler))
        .route("/twilio/twiml/start", post(handlers::twiml_start_connect))
        .route("/", get(|| async { "Hello, World!" }))
        .with_state(app_state);

    info!(bind=%bind, "turn engine listening");
    axum::Server::bind(&bind)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}
