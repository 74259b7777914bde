use serde::{Deserialize, Serialize};

/// Messages on a Deepgram live transcription socket.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type")]
pub enum StreamMessage {
    Results(StreamingResponse),
    Metadata(Metadata),
    SpeechStarted(SpeechStarted),
    UtteranceEnd(UtteranceEnd),
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StreamingResponse {
    pub channel_index: (u16, u16),
    pub duration: f32,
    pub start: f32,
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speech_final: Option<bool>,
    pub channel: Channel,
}

impl StreamingResponse {
    pub fn best(&self) -> Option<&Alternative> {
        self.channel.alternatives.first()
    }
}

#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Debug)]
pub struct Channel {
    pub alternatives: Vec<Alternative>,
}

#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Debug)]
pub struct Alternative {
    pub transcript: String,
    pub confidence: f32,
    #[serde(default)]
    pub words: Vec<Word>,
}

#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Debug)]
pub struct Word {
    pub word: String,
    pub start: f32,
    pub end: f32,
    pub confidence: f32,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Metadata {
    pub request_id: String,
    #[serde(default)]
    pub duration: f32,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SpeechStarted {
    pub timestamp: f32,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct UtteranceEnd {
    pub last_word_end: f32,
}

/// Sent to ask Deepgram to flush and close the stream.
#[derive(Serialize, Debug)]
pub struct CloseStream {
    #[serde(rename = "type")]
    pub message_type: &'static str,
}

impl Default for CloseStream {
    fn default() -> Self {
        Self {
            message_type: "CloseStream",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_results() {
        let raw = r#"{
            "type": "Results",
            "channel_index": [0, 1],
            "duration": 1.2,
            "start": 0.5,
            "is_final": true,
            "speech_final": true,
            "channel": {"alternatives": [{
                "transcript": "where is my order",
                "confidence": 0.97,
                "words": [{"word": "where", "start": 0.5, "end": 0.7, "confidence": 0.99}]
            }]}
        }"#;
        let StreamMessage::Results(r) = serde_json::from_str(raw).unwrap() else {
            panic!("expected results");
        };
        assert_eq!(r.best().unwrap().transcript, "where is my order");
        assert_eq!(r.speech_final, Some(true));
    }

    #[test]
    fn parses_vad_messages() {
        let started: StreamMessage =
            serde_json::from_str(r#"{"type": "SpeechStarted", "channel": [0], "timestamp": 2.1}"#)
                .unwrap();
        assert!(matches!(started, StreamMessage::SpeechStarted(_)));
        let ended: StreamMessage = serde_json::from_str(
            r#"{"type": "UtteranceEnd", "channel": [0, 1], "last_word_end": 3.4}"#,
        )
        .unwrap();
        assert!(matches!(ended, StreamMessage::UtteranceEnd(_)));
    }
}
