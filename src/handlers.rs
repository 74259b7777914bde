use crate::error::{handle_error, EngineError, Result, TransportError};
use crate::tasks::run_call;
use crate::twilio_types::{
    Connect, ConnectTarget, Response, Say, StartMeta, Stream, StreamEvent, Track,
    TwilioConnectPayload, Verb,
};
use crate::types::AppState;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Host, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
};
use futures_util::stream::{SplitStream, StreamExt};
use std::sync::{Arc, PoisonError};
use tracing::{debug, error, trace, warn};

/// Read frames until Twilio's `start` event, which names the stream and the call. Only `connected`
/// may come before it.
async fn await_stream_start(
    twilio_stream: &mut SplitStream<WebSocket>,
) -> Result<StartMeta> {
    while let Some(msg) = twilio_stream.next().await {
        let Message::Text(json) = msg.map_err(|e| TransportError::Send(e.to_string()))? else {
            return Err(EngineError::App("expected a text frame before the stream started"));
        };
        match serde_json::from_str::<StreamEvent>(&json)? {
            StreamEvent::Connected { protocol, version } => {
                trace!(%protocol, %version, "twilio media stream connected");
            }
            StreamEvent::Start { start, .. } => return Ok(start),
            other => {
                warn!(event=?other, "media stream event before start");
                return Err(EngineError::App("media stream did not begin with a start event"));
            }
        }
    }
    Err(EngineError::App("media stream closed before it started"))
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| socket_handler(socket, app_state))
}

async fn socket_handler(socket: WebSocket, app_state: Arc<AppState>) {
    let (twilio_sink, mut twilio_stream) = socket.split();
    let start_meta = match await_stream_start(&mut twilio_stream).await {
        Ok(start_meta) => start_meta,
        Err(e) => {
            handle_error(e).await;
            return;
        }
    };
    debug!(meta=?start_meta, "twilio media stream started");

    if let Err(e) = run_call(twilio_stream, twilio_sink, start_meta, app_state).await {
        handle_error(e).await;
    }
}

/// Answer Twilio's voice webhook: greet the caller, then connect the call to our media stream.
pub async fn twiml_start_connect(
    Host(host): Host,
    State(app_state): State<Arc<AppState>>,
    body: String,
) -> impl IntoResponse {
    trace!(body=%body, "start request body");
    let payload = match serde_urlencoded::from_str::<TwilioConnectPayload>(&body) {
        Ok(payload) => payload,
        Err(e) => {
            error!(error=%e, "failed to deserialize Twilio connect payload");
            return (
                StatusCode::BAD_REQUEST,
                HeaderMap::new(),
                "Bad request".to_string(),
            );
        }
    };
    debug!(call_sid=%payload.call_sid, direction=?payload.direction, "incoming call");
    app_state
        .streams
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(payload.call_sid.clone(), payload);

    let twiml = start_connect_twiml(&app_state.config.server.greeting, &host);
    trace!("twiml: '{}'", twiml);

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/xml"),
    );
    (StatusCode::OK, headers, twiml)
}

fn start_connect_twiml(greeting: &str, host: &str) -> String {
    let greet = (!greeting.is_empty()).then(|| {
        Verb::Say(Say {
            text: greeting.to_string(),
            ..Default::default()
        })
    });
    let connect = Verb::Connect(Connect {
        target: ConnectTarget::Stream(Stream {
            url: format!("wss://{host}/connect"),
            track: Some(Track::Inbound),
        }),
    });
    Response {
        verbs: greet.into_iter().chain([connect]).collect(),
    }
    .render()
}
