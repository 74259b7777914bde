//! Deepgram clients: live transcription over a websocket and speech synthesis over HTTP.

use crate::config::DeepgramConfig;
use crate::deepgram_types::{CloseStream, StreamMessage};
use crate::error::ProviderError;
use crate::providers::{ProviderStream, Synthesizer, Transcriber, TranscriberSession};
use crate::types::{AudioFrame, TranscriptEvent, VadEvent, WordMark, WordTimestamp};

use async_trait::async_trait;
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde_json::json;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest, Message},
};
use tracing::{debug, error, trace, warn};

const DEEPGRAM: &str = "deepgram";
const UTTERANCE_END_MS: u32 = 1_000;

fn secs_to_ms(secs: f32) -> u64 {
    (secs.max(0.0) * 1_000.0).round() as u64
}

fn from_tungstenite(e: tungstenite::Error) -> ProviderError {
    match e {
        tungstenite::Error::Http(resp) => {
            ProviderError::from_status(DEEPGRAM, resp.status().as_u16(), "websocket handshake")
        }
        e => ProviderError::Connection {
            provider: DEEPGRAM.to_string(),
            message: e.to_string(),
        },
    }
}

/// Numbers Deepgram results into utterances. An utterance closes on `speech_final` or
/// `UtteranceEnd`; sequence numbers restart with each utterance.
#[derive(Debug)]
struct TranscriptMapper {
    utterance: u64,
    sequence_no: u64,
    heard: bool,
}

impl Default for TranscriptMapper {
    fn default() -> Self {
        Self {
            utterance: 1,
            sequence_no: 0,
            heard: false,
        }
    }
}

impl TranscriptMapper {
    fn close_utterance(&mut self) {
        if self.heard {
            self.utterance += 1;
            self.sequence_no = 0;
            self.heard = false;
        }
    }

    fn map(&mut self, msg: StreamMessage) -> (Option<TranscriptEvent>, Option<VadEvent>) {
        match msg {
            StreamMessage::Results(r) => {
                let Some(alt) = r.best() else {
                    return (None, None);
                };
                self.sequence_no += 1;
                let ev = TranscriptEvent {
                    turn_id: self.utterance,
                    sequence_no: self.sequence_no,
                    text: alt.transcript.clone(),
                    is_final: r.is_final,
                    word_timestamps: alt
                        .words
                        .iter()
                        .map(|w| WordTimestamp {
                            word: w.word.clone(),
                            start_ms: secs_to_ms(w.start),
                            end_ms: secs_to_ms(w.end),
                            confidence: w.confidence,
                        })
                        .collect(),
                    confidence: alt.confidence,
                };
                if !ev.is_empty() {
                    self.heard = true;
                }
                let speech_final = r.is_final && r.speech_final.unwrap_or(false);
                if speech_final {
                    self.close_utterance();
                }
                (Some(ev), speech_final.then_some(VadEvent::SpeechEnd))
            }
            StreamMessage::SpeechStarted(_) => (None, Some(VadEvent::SpeechStart)),
            StreamMessage::UtteranceEnd(_) => {
                self.close_utterance();
                (None, Some(VadEvent::SpeechEnd))
            }
            StreamMessage::Metadata(m) => {
                debug!(request_id=%m.request_id, "deepgram stream metadata");
                (None, None)
            }
        }
    }
}

pub struct DeepgramTranscriber {
    api_key: String,
    config: DeepgramConfig,
}

impl DeepgramTranscriber {
    pub fn new(api_key: impl Into<String>, config: DeepgramConfig) -> Self {
        Self {
            api_key: api_key.into(),
            config,
        }
    }

    fn listen_url(&self) -> Result<String, ProviderError> {
        let query = serde_urlencoded::to_string([
            ("encoding", self.config.encoding.clone()),
            ("sample_rate", self.config.sample_rate.to_string()),
            ("interim_results", "true".to_string()),
            ("vad_events", "true".to_string()),
            ("utterance_end_ms", UTTERANCE_END_MS.to_string()),
            ("punctuate", "true".to_string()),
        ])
        .map_err(|e| ProviderError::BadRequest {
            provider: DEEPGRAM.to_string(),
            message: e.to_string(),
        })?;
        Ok(format!("{}?{query}", self.config.listen_url))
    }
}

#[async_trait]
impl Transcriber for DeepgramTranscriber {
    fn name(&self) -> &str {
        DEEPGRAM
    }

    async fn start(&self) -> Result<TranscriberSession, ProviderError> {
        trace!("Connecting to DG");
        let bad_request = |message: String| ProviderError::BadRequest {
            provider: DEEPGRAM.to_string(),
            message,
        };
        let mut rq = self
            .listen_url()?
            .into_client_request()
            .map_err(|e| bad_request(e.to_string()))?;
        rq.headers_mut().insert(
            http::header::AUTHORIZATION,
            http::header::HeaderValue::from_str(&format!("Token {}", self.api_key))
                .map_err(|e| bad_request(e.to_string()))?,
        );
        let (ws_stream, _) = connect_async(rq).await.map_err(from_tungstenite)?;
        debug!("opened connection to Deepgram");
        let (mut dg_sink, mut dg_stream) = ws_stream.split();

        let (audio, mut audio_rx) = mpsc::channel::<Vec<u8>>(256);
        let (events_tx, events) = mpsc::channel(64);
        let (vad_tx, vad) = mpsc::channel(16);

        tokio::spawn(async move {
            while let Some(chunk) = audio_rx.recv().await {
                if let Err(e) = dg_sink.send(Message::Binary(chunk)).await {
                    warn!(error=%e, "failed to send audio to Deepgram");
                    return;
                }
            }
            match serde_json::to_string(&CloseStream::default()) {
                Ok(close) => {
                    if let Err(e) = dg_sink.send(Message::Text(close)).await {
                        debug!(error=%e, "failed to close Deepgram stream");
                    }
                }
                Err(e) => error!(error=%e, "failed to serialize CloseStream"),
            }
        });

        tokio::spawn(async move {
            let mut mapper = TranscriptMapper::default();
            while let Some(msg) = dg_stream.next().await {
                match msg {
                    Ok(Message::Text(json)) => match serde_json::from_str::<StreamMessage>(&json) {
                        Ok(message) => {
                            let (transcript, activity) = mapper.map(message);
                            if let Some(t) = transcript {
                                if events_tx.send(Ok(t)).await.is_err() {
                                    break;
                                }
                            }
                            if let Some(v) = activity {
                                let _ = vad_tx.send(v).await;
                            }
                        }
                        Err(e) => debug!(error=%e, "skipping unrecognised Deepgram message"),
                    },
                    Ok(Message::Close(frame)) => {
                        debug!(frame=?frame, "deepgram closed the stream");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error=%e, "failed to handle DG message");
                        let _ = events_tx.send(Err(from_tungstenite(e))).await;
                        break;
                    }
                }
            }
        });

        Ok(TranscriberSession {
            audio,
            events,
            voice_activity: Some(vad),
        })
    }
}

/// Cuts a raw audio byte stream into fixed-length frames and places estimated word marks.
#[derive(Debug)]
struct FrameSlicer {
    frame_bytes: usize,
    frame_ms: u64,
    buf: Vec<u8>,
    sequence_no: u64,
    marks: VecDeque<WordMark>,
}

impl FrameSlicer {
    fn new(text: &str, config: &DeepgramConfig) -> Self {
        // 8-bit mu-law: one byte per sample
        let frame_bytes = (config.sample_rate as u64 * config.frame_ms / 1_000).max(1) as usize;
        let ms_per_word = 60_000 / config.words_per_minute.max(1) as u64;
        let marks = text
            .split_whitespace()
            .enumerate()
            .map(|(i, w)| WordMark {
                word: w.to_string(),
                offset_ms: i as u64 * ms_per_word,
            })
            .collect();
        Self {
            frame_bytes,
            frame_ms: config.frame_ms.max(1),
            buf: Vec::with_capacity(frame_bytes),
            sequence_no: 0,
            marks,
        }
    }

    fn push(&mut self, bytes: &[u8]) -> Vec<AudioFrame> {
        self.buf.extend_from_slice(bytes);
        let mut frames = vec![];
        while self.buf.len() >= self.frame_bytes {
            let rest = self.buf.split_off(self.frame_bytes);
            let payload = std::mem::replace(&mut self.buf, rest);
            frames.push(self.frame(payload));
        }
        frames
    }

    fn finish(&mut self) -> Option<AudioFrame> {
        if self.buf.is_empty() {
            return None;
        }
        let payload = std::mem::take(&mut self.buf);
        Some(self.frame(payload))
    }

    fn frame(&mut self, payload: Vec<u8>) -> AudioFrame {
        let start_ms = self.sequence_no * self.frame_ms;
        let duration_ms = payload.len() as u64 * self.frame_ms / self.frame_bytes as u64;
        let mut words = vec![];
        while let Some(mark) = self.marks.front() {
            if mark.offset_ms >= start_ms + duration_ms {
                break;
            }
            words.extend(self.marks.pop_front());
        }
        let frame = AudioFrame {
            sequence_no: self.sequence_no,
            payload,
            duration_ms,
            words,
        };
        self.sequence_no += 1;
        frame
    }
}

pub struct DeepgramSpeaker {
    http_client: reqwest::Client,
    api_key: String,
    config: DeepgramConfig,
}

impl DeepgramSpeaker {
    pub fn new(http_client: reqwest::Client, api_key: impl Into<String>, config: DeepgramConfig) -> Self {
        Self {
            http_client,
            api_key: api_key.into(),
            config,
        }
    }
}

#[async_trait]
impl Synthesizer for DeepgramSpeaker {
    fn name(&self) -> &str {
        DEEPGRAM
    }

    async fn start(
        &self,
        text: &str,
        voice_id: &str,
    ) -> Result<ProviderStream<AudioFrame>, ProviderError> {
        let sample_rate = self.config.sample_rate.to_string();
        let resp = self
            .http_client
            .post(&self.config.speak_url)
            .query(&[
                ("model", voice_id),
                ("encoding", self.config.encoding.as_str()),
                ("sample_rate", sample_rate.as_str()),
                ("container", "none"),
            ])
            .header(reqwest::header::AUTHORIZATION, format!("Token {}", self.api_key))
            .json(&json!({ "text": text }))
            .send()
            .await
            .map_err(|e| {
                error!(error=%e, "failed to send request to Deepgram speak");
                ProviderError::from_reqwest(DEEPGRAM, &e)
            })?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(DEEPGRAM, status.as_u16(), &body));
        }

        let mut slicer = FrameSlicer::new(text, &self.config);
        let (tx, rx) = mpsc::channel(32);
        let mut body = resp.bytes_stream();
        tokio::spawn(async move {
            while let Some(chunk) = body.next().await {
                let frames = match chunk {
                    Ok(bytes) => slicer.push(&bytes),
                    Err(e) => {
                        let _ = tx.send(Err(ProviderError::from_reqwest(DEEPGRAM, &e))).await;
                        return;
                    }
                };
                for frame in frames {
                    if tx.send(Ok(frame)).await.is_err() {
                        return;
                    }
                }
            }
            if let Some(frame) = slicer.finish() {
                let _ = tx.send(Ok(frame)).await;
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results(text: &str, is_final: bool, speech_final: bool) -> StreamMessage {
        serde_json::from_value(json!({
            "type": "Results",
            "channel_index": [0, 1],
            "duration": 1.0,
            "start": 0.0,
            "is_final": is_final,
            "speech_final": speech_final,
            "channel": {"alternatives": [{"transcript": text, "confidence": 0.9, "words": []}]}
        }))
        .unwrap()
    }

    #[test]
    fn utterances_advance_on_speech_final() {
        let mut m = TranscriptMapper::default();
        let (a, _) = m.map(results("where is", false, false));
        let (b, vad) = m.map(results("where is my order", true, true));
        let (c, _) = m.map(results("thanks", false, false));
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
        assert_eq!((a.turn_id, a.sequence_no), (1, 1));
        assert_eq!((b.turn_id, b.sequence_no), (1, 2));
        assert_eq!(vad, Some(VadEvent::SpeechEnd));
        assert_eq!((c.turn_id, c.sequence_no), (2, 1));
    }

    #[test]
    fn silent_utterance_end_does_not_advance() {
        let mut m = TranscriptMapper::default();
        let end: StreamMessage =
            serde_json::from_value(json!({"type": "UtteranceEnd", "last_word_end": 1.0})).unwrap();
        assert_eq!(m.map(end).1, Some(VadEvent::SpeechEnd));
        let (ev, _) = m.map(results("hello", true, false));
        assert_eq!(ev.unwrap().turn_id, 1);
    }

    #[test]
    fn slicer_cuts_fixed_frames_and_marks_words() {
        let config = DeepgramConfig {
            words_per_minute: 600, // 100ms per word
            ..Default::default()
        };
        let mut s = FrameSlicer::new("one two three", &config);
        let frames = s.push(&[0u8; 1_000]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload.len(), 800);
        assert_eq!(frames[0].duration_ms, 100);
        assert_eq!(frames[0].words.len(), 1);
        let last = s.finish().unwrap();
        assert_eq!(last.duration_ms, 25);
        // "two" starts at 100ms, inside the short tail frame
        assert_eq!(last.words[0].word, "two");
        assert!(s.finish().is_none());
    }
}
