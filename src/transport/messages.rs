use serde::{Deserialize, Serialize};

use crate::audio::codec;

/// Message sent to the voice service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// One captured frame, base64 PCM16
    Audio { data: String },
    Ping,
    Command { command: ControlCommand },
}

impl ClientMessage {
    pub fn audio(samples: &[f32]) -> Self {
        ClientMessage::Audio {
            data: codec::encode_frame(samples),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Audio { .. } => "audio",
            ClientMessage::Ping => "ping",
            ClientMessage::Command { .. } => "command",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
    /// Ask the service to re-establish its upstream connection
    Reconnect,
    /// Ask for a fresh `status` message
    Status,
}

/// Synthesized speech chunk.
///
/// The service also sends `timestamp`, `format`, `channels` and `bitDepth`;
/// they are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundAudio {
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(default = "default_preserve_quality")]
    pub preserve_quality: bool,
}

fn default_preserve_quality() -> bool {
    true
}

/// Message received from the voice service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Audio(InboundAudio),
    Status {
        status: String,
        #[serde(rename = "connectionStatus", default)]
        connection_status: Option<String>,
    },
    Error {
        message: String,
    },
    Pong,
    ReconnectResult {
        success: bool,
    },
    /// Any `type` this client does not know
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Parse one text frame
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_messages_serialize() {
        let audio = serde_json::to_value(ClientMessage::Audio {
            data: "AAA=".to_string(),
        })
        .unwrap();
        assert_eq!(audio, json!({"type": "audio", "data": "AAA="}));

        let ping = serde_json::to_value(ClientMessage::Ping).unwrap();
        assert_eq!(ping, json!({"type": "ping"}));

        let command = serde_json::to_value(ClientMessage::Command {
            command: ControlCommand::Reconnect,
        })
        .unwrap();
        assert_eq!(command, json!({"type": "command", "command": "reconnect"}));
    }

    #[test]
    fn test_inbound_audio_with_extras() {
        let text = r#"{"type":"audio","data":"AAA=","sampleRate":24000,"timestamp":1.5,
            "preserveQuality":false,"format":"int16","channels":1,"bitDepth":16}"#;
        match ServerMessage::parse(text).unwrap() {
            ServerMessage::Audio(audio) => {
                assert_eq!(audio.sample_rate, Some(24000));
                assert!(!audio.preserve_quality);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_inbound_audio_defaults() {
        match ServerMessage::parse(r#"{"type":"audio","data":""}"#).unwrap() {
            ServerMessage::Audio(audio) => {
                assert_eq!(audio.sample_rate, None);
                assert!(audio.preserve_quality);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_status_and_results() {
        let status =
            ServerMessage::parse(r#"{"type":"status","status":"active","connectionStatus":"connected"}"#)
                .unwrap();
        assert_eq!(
            status,
            ServerMessage::Status {
                status: "active".to_string(),
                connection_status: Some("connected".to_string()),
            }
        );

        assert_eq!(
            ServerMessage::parse(r#"{"type":"reconnect_result","success":false}"#).unwrap(),
            ServerMessage::ReconnectResult { success: false }
        );
        assert_eq!(
            ServerMessage::parse(r#"{"type":"pong"}"#).unwrap(),
            ServerMessage::Pong
        );
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        assert_eq!(
            ServerMessage::parse(r#"{"type":"transcript","text":"hi"}"#).unwrap(),
            ServerMessage::Unknown
        );
        assert!(ServerMessage::parse("not json").is_err());
    }
}
