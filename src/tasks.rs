use crate::error::{EngineError, Result, TransportError};
use crate::events::EventEmitter;
use crate::providers::OutboundTransport;
use crate::session::{CallSession, SessionDeps};
use crate::twilio_types::{OutboundMedia, StartMeta, StreamEvent, TwilioOutbound};
use crate::types::{AppState, AudioFrame, Call};
use crate::utils::{b64_decode_to_buf, b64_encode};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{
    sink::SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

const AUDIO_BUFFER: usize = 256;
const OUTBOUND_BUFFER: usize = 64;
/// How far ahead of real time audio may be handed to Twilio.
const PLAYOUT_LOOKAHEAD: Duration = Duration::from_millis(200);

/// Task that forwards caller-side audio from the Twilio media stream to the call session.
pub async fn stream_twilio_audio(
    mut twilio_stream: SplitStream<WebSocket>,
    audio: mpsc::Sender<Vec<u8>>,
) -> Result<()> {
    loop {
        match twilio_stream.next().await {
            Some(msg) => match msg {
                Ok(Message::Text(json)) => match serde_json::from_str(&json) {
                    Ok(message) => match message {
                        StreamEvent::Media { media, .. } => {
                            let mut chunk = Vec::new();
                            if let Err(e) = b64_decode_to_buf(media.payload, &mut chunk) {
                                warn!(error=%e, "failed to decode Twilio media payload");
                                continue;
                            }
                            if audio.send(chunk).await.is_err() {
                                debug!("call session gone; stop reading Twilio audio");
                                break Ok(());
                            }
                        }
                        StreamEvent::Stop { sequence_number } => {
                            debug!("Got stop message {sequence_number}");
                            break Ok(());
                        }
                        StreamEvent::Dtmf { dtmf, .. } => {
                            debug!(digit=%dtmf.digit, "ignoring dtmf");
                        }
                        _ => {
                            break Err(EngineError::App(
                                "We should not be getting Connected or Start messages now!",
                            ));
                        }
                    },
                    Err(e) => {
                        error!(error=%e, "failed to parse Twilio text message");
                        break Err(e.into());
                    }
                },
                Ok(Message::Ping(_)) => (),
                Ok(Message::Close(_)) => {
                    info!("twilio closed the stream");
                    break Ok(());
                }
                Ok(m) => {
                    warn!(message=?m, "unsupported message type from Twilio");
                    continue;
                }
                Err(e) => {
                    error!(error=%e, "failed to receive message from Twilio");
                    break Err(EngineError::Transport(TransportError::Send(e.to_string())));
                }
            },
            None => {
                info!("end of twilio stream");
                break Ok(());
            }
        }
    }
}

/// Single writer for the Twilio websocket; everything outbound funnels through here.
pub async fn send_twilio_ws_messages(
    mut twilio_outbound_stream: mpsc::Receiver<TwilioOutbound>,
    mut twilio_ws_sink: SplitSink<WebSocket, Message>,
) -> Result<()> {
    while let Some(twilio_outbound) = twilio_outbound_stream.recv().await {
        let json = serde_json::to_string(&twilio_outbound).map_err(|e| {
            error!(error=%e, "failed to serialize Twilio outbound");
            e
        })?;
        twilio_ws_sink.send(Message::Text(json)).await.map_err(|e| {
            error!(error=%e, "failed to send message to Twilio");
            TransportError::Send(e.to_string())
        })?;
    }
    Ok(())
}

/// Outbound audio as Twilio media messages, paced to real time so that a clear only has a short
/// buffer to discard.
pub struct TwilioTransport {
    stream_sid: String,
    outbound: mpsc::Sender<TwilioOutbound>,
    /// When the audio handed over so far finishes playing.
    playout_end: Mutex<Option<Instant>>,
}

impl TwilioTransport {
    pub fn new(stream_sid: impl Into<String>, outbound: mpsc::Sender<TwilioOutbound>) -> Self {
        Self {
            stream_sid: stream_sid.into(),
            outbound,
            playout_end: Mutex::new(None),
        }
    }

    async fn push(&self, message: TwilioOutbound) -> Result<(), TransportError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl OutboundTransport for TwilioTransport {
    async fn send(&self, frame: &AudioFrame) -> Result<(), TransportError> {
        let send_at = {
            let mut playout_end = self.playout_end.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            let starts = playout_end.filter(|end| *end > now).unwrap_or(now);
            *playout_end = Some(starts + Duration::from_millis(frame.duration_ms));
            starts.checked_sub(PLAYOUT_LOOKAHEAD).unwrap_or(now)
        };
        sleep_until(send_at).await;
        self.push(TwilioOutbound::Media {
            media: OutboundMedia {
                payload: b64_encode(&frame.payload),
            },
            stream_sid: self.stream_sid.clone(),
        })
        .await
    }

    async fn clear(&self) -> Result<(), TransportError> {
        *self.playout_end.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.push(TwilioOutbound::Clear {
            stream_sid: self.stream_sid.clone(),
        })
        .await
    }
}

/// Run one phone call: caller audio in, agent audio out, until Twilio stops the stream.
pub async fn run_call(
    twilio_stream: SplitStream<WebSocket>,
    twilio_sink: SplitSink<WebSocket, Message>,
    start_meta: StartMeta,
    app_state: Arc<AppState>,
) -> Result<()> {
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
    let (audio_tx, audio_rx) = mpsc::channel(AUDIO_BUFFER);
    let sender = tokio::spawn(send_twilio_ws_messages(outbound_rx, twilio_sink));

    let config = app_state.config.clone();
    let call = Call::new(config.agent.tenant_id.clone(), config.agent.region.clone());
    info!(call_id=%call.call_id, call_sid=%start_meta.call_sid, stream_sid=%start_meta.stream_sid, "starting call");
    let emitter = EventEmitter::new(call.call_id, app_state.events.clone());
    let deps = SessionDeps {
        transcriber: app_state.transcriber.clone(),
        generator: app_state.generator.clone(),
        synthesizer: app_state.synthesizer.clone(),
        functions: app_state.functions.clone(),
        executor: app_state.executor.clone(),
        transport: Arc::new(TwilioTransport::new(start_meta.stream_sid.clone(), outbound_tx)),
    };
    let session = CallSession::new(call, config, deps, emitter);

    // the session hangs up when the audio sender drops, error or not
    let (streamed, summary) = tokio::join!(
        stream_twilio_audio(twilio_stream, audio_tx),
        session.run(audio_rx, None),
    );
    if let Err(e) = &streamed {
        warn!(error=%e, "twilio audio stream ended with an error");
    }
    match serde_json::to_string(&summary) {
        Ok(json) => info!(call_id=%summary.call.call_id, summary=%json, "call summary"),
        Err(e) => warn!(error=%e, "failed to serialize call summary"),
    }

    // remove connect payload from app state cache
    let removed = app_state
        .streams
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&start_meta.call_sid);
    match removed {
        Some(payload) => {
            info!(call_sid=%payload.call_sid, from=%payload.from, to=%payload.to, country=?payload.from_country, "call finished")
        }
        None => debug!(call_sid=%start_meta.call_sid, "no connect payload cached for call"),
    }

    match sender.await {
        Ok(res) => res?,
        Err(e) => error!(error=%e, "twilio sender task failed"),
    }
    streamed
}
