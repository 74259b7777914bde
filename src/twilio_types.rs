//! Twilio wire formats: TwiML for the voice webhook, JSON frames on the media stream socket and
//! the form-encoded call webhook body.

mod twiml {
    use xmlserde::xml_serde_enum;
    use xmlserde_derives::XmlSerialize;

    const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

    #[derive(PartialEq, Eq, XmlSerialize)]
    #[xmlserde(root = b"Response")]
    pub struct Response {
        #[xmlserde(ty = "untag")]
        pub verbs: Vec<Verb>,
    }

    impl Response {
        /// Serialized document, XML declaration included.
        pub fn render(self) -> String {
            format!("{XML_DECLARATION}{}", xmlserde::xml_serialize(self))
        }
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub enum Verb {
        #[xmlserde(name = b"Say")]
        Say(Say),
        #[xmlserde(name = b"Connect")]
        Connect(Connect),
    }

    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct Say {
        #[xmlserde(ty = "text")]
        pub text: String,
        #[xmlserde(name = b"voice", ty = "attr")]
        pub voice: Option<String>,
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub struct Connect {
        #[xmlserde(ty = "untag")]
        pub target: ConnectTarget,
    }

    #[derive(PartialEq, Eq, XmlSerialize)]
    pub enum ConnectTarget {
        #[xmlserde(name = b"Stream")]
        Stream(Stream),
    }

    /// Bidirectional media stream; Twilio only forks the inbound track to us.
    #[derive(PartialEq, Eq, XmlSerialize, Default)]
    pub struct Stream {
        #[xmlserde(name = b"url", ty = "attr")]
        pub url: String,
        #[xmlserde(name = b"track", ty = "attr")]
        pub track: Option<Track>,
    }

    xml_serde_enum! {
        #[derive(PartialEq, Eq, Debug)]
        Track {
            Inbound => "inbound_track",
            Outbound => "outbound_track",
            Both => "both_tracks",
        }
    }
}
pub use twiml::*;

mod ws {
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;

    /// Frames Twilio sends on the media stream.
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "lowercase", tag = "event")]
    pub enum StreamEvent {
        Connected {
            protocol: String,
            version: String,
        },
        #[serde(rename_all = "camelCase")]
        Start {
            sequence_number: String,
            start: StartMeta,
        },
        #[serde(rename_all = "camelCase")]
        Media {
            sequence_number: String,
            media: InboundMedia,
        },
        #[serde(rename_all = "camelCase")]
        Stop { sequence_number: String },
        Dtmf { dtmf: Dtmf },
    }

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct StartMeta {
        pub stream_sid: String,
        pub call_sid: String,
        #[serde(default)]
        pub tracks: Vec<String>,
        #[serde(default)]
        pub custom_parameters: HashMap<String, String>,
        pub media_format: MediaFormat,
    }

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub struct MediaFormat {
        pub encoding: String,
        pub sample_rate: u32,
        pub channels: u16,
    }

    #[derive(Deserialize, Debug)]
    pub struct InboundMedia {
        /// Base64 mu-law audio.
        pub payload: String,
        #[serde(default)]
        pub chunk: Option<String>,
    }

    #[derive(Deserialize, Debug)]
    pub struct Dtmf {
        pub digit: String,
    }

    /// Frames we send back to Twilio.
    #[derive(Serialize, Clone, Debug)]
    #[serde(rename_all = "lowercase", tag = "event")]
    pub enum TwilioOutbound {
        #[serde(rename_all = "camelCase")]
        Media {
            stream_sid: String,
            media: OutboundMedia,
        },
        #[serde(rename_all = "camelCase")]
        Clear { stream_sid: String },
    }

    #[derive(Serialize, Clone, Debug)]
    pub struct OutboundMedia {
        pub payload: String,
    }
}
pub use ws::*;

mod webhook {
    use serde::Deserialize;

    #[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
    #[serde(rename_all = "kebab-case")]
    pub enum CallDirection {
        Inbound,
        OutboundApi,
        OutboundDial,
    }

    /// The voice webhook body. Only the fields we log are kept; the rest are ignored.
    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "PascalCase")]
    pub struct TwilioConnectPayload {
        pub account_sid: String,
        pub call_sid: String,
        pub direction: CallDirection,
        pub from: String,
        pub to: String,
        pub from_country: Option<String>,
    }
}
pub use webhook::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_twiml_renders() {
        let twiml = Response {
            verbs: vec![
                Verb::Say(Say {
                    text: "Hi.".to_string(),
                    ..Default::default()
                }),
                Verb::Connect(Connect {
                    target: ConnectTarget::Stream(Stream {
                        url: "wss://example.com/connect".to_string(),
                        track: Some(Track::Inbound),
                    }),
                }),
            ],
        }
        .render();
        assert!(twiml.starts_with(r#"<?xml version="1.0" encoding="UTF-8"?><Response>"#));
        assert!(twiml.contains("<Say>Hi.</Say>"));
        assert!(twiml.contains(r#"url="wss://example.com/connect""#));
        assert!(twiml.contains(r#"track="inbound_track""#));
    }

    #[test]
    fn stream_events_parse() {
        let media = r#"{"event":"media","sequenceNumber":"3","streamSid":"MZ1",
            "media":{"track":"inbound","chunk":"2","timestamp":"5","payload":"//8="}}"#;
        let StreamEvent::Media { media, .. } = serde_json::from_str(media).unwrap() else {
            panic!("expected media");
        };
        assert_eq!(media.payload, "//8=");

        let start = r#"{"event":"start","sequenceNumber":"1","streamSid":"MZ1","start":{
            "streamSid":"MZ1","accountSid":"AC1","callSid":"CA1","tracks":["inbound"],
            "customParameters":{},"mediaFormat":{"encoding":"audio/x-mulaw","sampleRate":8000,"channels":1}}}"#;
        let StreamEvent::Start { start, .. } = serde_json::from_str(start).unwrap() else {
            panic!("expected start");
        };
        assert_eq!(start.call_sid, "CA1");
        assert_eq!(start.media_format.sample_rate, 8000);
    }

    #[test]
    fn clear_serializes_with_stream_sid() {
        let json = serde_json::to_value(TwilioOutbound::Clear {
            stream_sid: "MZ1".to_string(),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"event": "clear", "streamSid": "MZ1"}));
    }

    #[test]
    fn webhook_body_parses() {
        let body = "AccountSid=AC1&ApiVersion=2010-04-01&CallSid=CA1&CallStatus=ringing\
            &Direction=inbound&From=%2B15550100&To=%2B15550199&FromCountry=US";
        let payload: TwilioConnectPayload = serde_urlencoded::from_str(body).unwrap();
        assert_eq!(payload.call_sid, "CA1");
        assert_eq!(payload.direction, CallDirection::Inbound);
        assert_eq!(payload.from, "+15550100");
    }
}
