//! Wire protocol for the live backend
//!
//! The backend speaks Socket.IO v4 over a WebSocket. Each WebSocket text
//! frame is one Engine.IO packet; Engine.IO `message` packets carry one
//! Socket.IO packet. Only the default namespace and text packets are used.
//!
//! On top of the framing, this module defines the named events and their
//! JSON payloads.

use crate::error::{LiveError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Engine.IO handshake sent by the server right after the WebSocket opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_payload: Option<u64>,
}

/// Engine.IO packet (one per WebSocket text frame).
#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(OpenHandshake),
    Close,
    Ping,
    Pong,
    Message(SocketPacket),
    Noop,
}

/// Socket.IO packet carried inside an Engine.IO message.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect(Option<Value>),
    Disconnect,
    Event {
        id: Option<u64>,
        name: String,
        args: Vec<Value>,
    },
    Ack {
        id: u64,
        args: Vec<Value>,
    },
    ConnectError(Value),
}

impl EnginePacket {
    /// Encode to the text frame representation.
    pub fn encode(&self) -> Result<String> {
        Ok(match self {
            EnginePacket::Open(handshake) => format!("0{}", serde_json::to_string(handshake)?),
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping => "2".to_string(),
            EnginePacket::Pong => "3".to_string(),
            EnginePacket::Message(packet) => format!("4{}", packet.encode()?),
            EnginePacket::Noop => "6".to_string(),
        })
    }

    /// Decode a text frame.
    pub fn decode(frame: &str) -> Result<Self> {
        let mut chars = frame.chars();
        let kind = chars
            .next()
            .ok_or_else(|| LiveError::Protocol("empty engine packet".to_string()))?;
        let rest = chars.as_str();

        match kind {
            '0' => Ok(EnginePacket::Open(serde_json::from_str(rest)?)),
            '1' => Ok(EnginePacket::Close),
            // "2probe" is only used during transport upgrades
            '2' => Ok(EnginePacket::Ping),
            '3' => Ok(EnginePacket::Pong),
            '4' => Ok(EnginePacket::Message(SocketPacket::decode(rest)?)),
            '6' => Ok(EnginePacket::Noop),
            other => Err(LiveError::Protocol(format!(
                "unsupported engine packet type {:?}",
                other
            ))),
        }
    }
}

impl SocketPacket {
    /// Build an event packet with a single JSON argument.
    pub fn event(name: &str, data: Value, id: Option<u64>) -> Self {
        SocketPacket::Event {
            id,
            name: name.to_string(),
            args: vec![data],
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(match self {
            SocketPacket::Connect(None) => "0".to_string(),
            SocketPacket::Connect(Some(auth)) => format!("0{}", serde_json::to_string(auth)?),
            SocketPacket::Disconnect => "1".to_string(),
            SocketPacket::Event { id, name, args } => {
                let mut array = Vec::with_capacity(args.len() + 1);
                array.push(Value::String(name.clone()));
                array.extend(args.iter().cloned());
                let body = serde_json::to_string(&array)?;
                match id {
                    Some(id) => format!("2{}{}", id, body),
                    None => format!("2{}", body),
                }
            }
            SocketPacket::Ack { id, args } => format!("3{}{}", id, serde_json::to_string(args)?),
            SocketPacket::ConnectError(data) => format!("4{}", serde_json::to_string(data)?),
        })
    }

    pub fn decode(input: &str) -> Result<Self> {
        let mut chars = input.chars();
        let kind = chars
            .next()
            .ok_or_else(|| LiveError::Protocol("empty socket packet".to_string()))?;
        let mut rest = chars.as_str();

        // Skip a namespace prefix such as "/admin," - only "/" is served here.
        if rest.starts_with('/') {
            rest = match rest.find(',') {
                Some(idx) => &rest[idx + 1..],
                None => "",
            };
        }

        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        let id = if digits > 0 {
            Some(
                rest[..digits]
                    .parse::<u64>()
                    .map_err(|e| LiveError::Protocol(format!("bad packet id: {}", e)))?,
            )
        } else {
            None
        };
        let body = &rest[digits..];

        match kind {
            '0' => {
                if body.is_empty() {
                    Ok(SocketPacket::Connect(None))
                } else {
                    Ok(SocketPacket::Connect(Some(serde_json::from_str(body)?)))
                }
            }
            '1' => Ok(SocketPacket::Disconnect),
            '2' => {
                let mut array: Vec<Value> = serde_json::from_str(body)?;
                if array.is_empty() {
                    return Err(LiveError::Protocol("event without a name".to_string()));
                }
                let name = match array.remove(0) {
                    Value::String(name) => name,
                    other => {
                        return Err(LiveError::Protocol(format!(
                            "event name must be a string, got {}",
                            other
                        )))
                    }
                };
                Ok(SocketPacket::Event { id, name, args: array })
            }
            '3' => {
                let id = id.ok_or_else(|| LiveError::Protocol("ack without id".to_string()))?;
                let args: Vec<Value> = if body.is_empty() {
                    Vec::new()
                } else {
                    serde_json::from_str(body)?
                };
                Ok(SocketPacket::Ack { id, args })
            }
            '4' => Ok(SocketPacket::ConnectError(if body.is_empty() {
                Value::Null
            } else {
                serde_json::from_str(body)?
            })),
            '5' | '6' => Err(LiveError::Protocol(
                "binary socket packets are not supported".to_string(),
            )),
            other => Err(LiveError::Protocol(format!(
                "unsupported socket packet type {:?}",
                other
            ))),
        }
    }
}

/// Events the client emits. Every payload is tagged with the session id.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StartLiveSession,
    StopLiveSession,
    CheckSessionStatus,
    SendText { text: String },
    SendMessageWithImages { text: String, images: Vec<String> },
    SendAudio { audio: String },
    SendCameraFrame { frame: String },
    GenerationCompleted(GenerationCompleted),
}

/// Result of a tool call, echoed back with the call's correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationCompleted {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: Value,
    pub function_call_id: String,
    pub user_request: String,
}

impl ClientEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::StartLiveSession => "start_live_session",
            ClientEvent::StopLiveSession => "stop_live_session",
            ClientEvent::CheckSessionStatus => "check_session_status",
            ClientEvent::SendText { .. } => "send_text_message",
            ClientEvent::SendMessageWithImages { .. } => "send_message_with_images",
            ClientEvent::SendAudio { .. } => "send_audio",
            ClientEvent::SendCameraFrame { .. } => "send_camera_frame",
            ClientEvent::GenerationCompleted(_) => "generation_completed",
        }
    }

    /// JSON payload for the given session.
    pub fn payload(&self, session_id: &str) -> Value {
        match self {
            ClientEvent::StartLiveSession
            | ClientEvent::StopLiveSession
            | ClientEvent::CheckSessionStatus => json!({ "session_id": session_id }),
            ClientEvent::SendText { text } => json!({ "session_id": session_id, "text": text }),
            ClientEvent::SendMessageWithImages { text, images } => json!({
                "session_id": session_id,
                "text": text,
                "images": images,
            }),
            ClientEvent::SendAudio { audio } => json!({ "session_id": session_id, "audio": audio }),
            ClientEvent::SendCameraFrame { frame } => {
                json!({ "session_id": session_id, "frame": frame })
            }
            ClientEvent::GenerationCompleted(done) => json!({
                "session_id": session_id,
                "type": done.kind,
                "id": done.id,
                "function_call_id": done.function_call_id,
                "user_request": done.user_request,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AudioResponse {
    pub audio: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct SessionStarted {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionError {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub code: Option<i64>,
}

/// Tool call requested by the model through the backend.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GenerationRequest {
    #[serde(default)]
    pub text: String,
    pub function_name: String,
    #[serde(default)]
    pub function_args: Value,
    pub function_call_id: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct SessionEndedReconnect {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub can_resume: bool,
}

/// Acknowledgement of `check_session_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct StatusAck {
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub starting: bool,
}

/// Events the server emits.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    AudioResponse(AudioResponse),
    TextResponse { text: String },
    SessionStarted(SessionStarted),
    SessionEnded,
    SessionStopped,
    SessionError(SessionError),
    GenerationRequest(GenerationRequest),
    SessionEndedReconnect(SessionEndedReconnect),
    Unknown { name: String, data: Value },
}

impl ServerEvent {
    /// Parse a named event and its first argument.
    pub fn from_event(name: &str, data: Value) -> Result<Self> {
        let data = if data.is_null() { json!({}) } else { data };
        Ok(match name {
            "audio_response" => ServerEvent::AudioResponse(serde_json::from_value(data)?),
            "text_response" => ServerEvent::TextResponse {
                text: data
                    .get("text")
                    .and_then(|t| t.as_str())
                    .unwrap_or_default()
                    .to_string(),
            },
            "live_session_started" => ServerEvent::SessionStarted(serde_json::from_value(data)?),
            "live_session_ended" => ServerEvent::SessionEnded,
            "live_session_stopped" => ServerEvent::SessionStopped,
            "live_session_error" => ServerEvent::SessionError(serde_json::from_value(data)?),
            "voice_generation_request" => {
                ServerEvent::GenerationRequest(serde_json::from_value(data)?)
            }
            "session_ended_reconnect" => {
                ServerEvent::SessionEndedReconnect(serde_json::from_value(data)?)
            }
            other => ServerEvent::Unknown {
                name: other.to_string(),
                data,
            },
        })
    }

    pub fn name(&self) -> &str {
        match self {
            ServerEvent::AudioResponse(_) => "audio_response",
            ServerEvent::TextResponse { .. } => "text_response",
            ServerEvent::SessionStarted(_) => "live_session_started",
            ServerEvent::SessionEnded => "live_session_ended",
            ServerEvent::SessionStopped => "live_session_stopped",
            ServerEvent::SessionError(_) => "live_session_error",
            ServerEvent::GenerationRequest(_) => "voice_generation_request",
            ServerEvent::SessionEndedReconnect(_) => "session_ended_reconnect",
            ServerEvent::Unknown { name, .. } => name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_open_handshake() {
        let frame = r#"0{"sid":"abc","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#;
        match EnginePacket::decode(frame).unwrap() {
            EnginePacket::Open(open) => {
                assert_eq!(open.sid, "abc");
                assert_eq!(open.ping_interval, 25000);
                assert_eq!(open.ping_timeout, 20000);
                assert_eq!(open.max_payload, Some(1_000_000));
            }
            other => panic!("Unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn test_ping_pong_and_close() {
        assert_eq!(EnginePacket::decode("2").unwrap(), EnginePacket::Ping);
        assert_eq!(EnginePacket::decode("2probe").unwrap(), EnginePacket::Ping);
        assert_eq!(EnginePacket::decode("1").unwrap(), EnginePacket::Close);
        assert_eq!(EnginePacket::Pong.encode().unwrap(), "3");
    }

    #[test]
    fn test_connect_packets() {
        let connect = EnginePacket::Message(SocketPacket::Connect(None));
        assert_eq!(connect.encode().unwrap(), "40");

        match EnginePacket::decode(r#"40{"sid":"xyz"}"#).unwrap() {
            EnginePacket::Message(SocketPacket::Connect(Some(data))) => {
                assert_eq!(data["sid"], "xyz");
            }
            other => panic!("Unexpected packet: {:?}", other),
        }
        assert_eq!(
            EnginePacket::decode("41").unwrap(),
            EnginePacket::Message(SocketPacket::Disconnect)
        );
    }

    #[test]
    fn test_event_encoding() {
        let packet = SocketPacket::event("send_text_message", json!({"text": "hi"}), None);
        assert_eq!(
            EnginePacket::Message(packet).encode().unwrap(),
            r#"42["send_text_message",{"text":"hi"}]"#
        );

        let with_ack = SocketPacket::event("check_session_status", json!({}), Some(7));
        assert_eq!(with_ack.encode().unwrap(), r#"27["check_session_status",{}]"#);
    }

    #[test]
    fn test_event_decoding_with_namespace_and_id() {
        match SocketPacket::decode(r#"2/chat,12["audio_response",{"audio":"AAA="}]"#).unwrap() {
            SocketPacket::Event { id, name, args } => {
                assert_eq!(id, Some(12));
                assert_eq!(name, "audio_response");
                assert_eq!(args[0]["audio"], "AAA=");
            }
            other => panic!("Unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn test_ack_decoding() {
        match EnginePacket::decode(r#"433[{"active":true}]"#).unwrap() {
            EnginePacket::Message(SocketPacket::Ack { id, args }) => {
                assert_eq!(id, 3);
                let ack: StatusAck = serde_json::from_value(args[0].clone()).unwrap();
                assert!(ack.active);
                assert!(!ack.starting);
            }
            other => panic!("Unexpected packet: {:?}", other),
        }
        assert!(SocketPacket::decode(r#"3[{}]"#).is_err());
    }

    #[test]
    fn test_malformed_packets() {
        assert!(EnginePacket::decode("").is_err());
        assert!(EnginePacket::decode("9").is_err());
        assert!(SocketPacket::decode("2[]").is_err());
        assert!(SocketPacket::decode("2[42]").is_err());
        assert!(SocketPacket::decode(r#"51-["x",{"_placeholder":true,"num":0}]"#).is_err());
    }

    #[test]
    fn test_client_payloads_carry_session_id() {
        let event = ClientEvent::SendCameraFrame { frame: "Zm9v".to_string() };
        assert_eq!(event.name(), "send_camera_frame");
        let payload = event.payload("session-1");
        assert_eq!(payload["session_id"], "session-1");
        assert_eq!(payload["frame"], "Zm9v");

        let done = ClientEvent::GenerationCompleted(GenerationCompleted {
            kind: "image".to_string(),
            id: json!(4),
            function_call_id: "call-42".to_string(),
            user_request: "draw a cat".to_string(),
        });
        let payload = done.payload("session-1");
        assert_eq!(payload["type"], "image");
        assert_eq!(payload["function_call_id"], "call-42");
    }

    #[test]
    fn test_server_event_parsing() {
        let event = ServerEvent::from_event(
            "voice_generation_request",
            json!({
                "text": "Generating...",
                "function_name": "generate_image",
                "function_args": {"prompt": "a cat"},
                "function_call_id": "call-42"
            }),
        )
        .unwrap();
        match event {
            ServerEvent::GenerationRequest(req) => {
                assert_eq!(req.function_call_id, "call-42");
                assert_eq!(req.function_args["prompt"], "a cat");
            }
            other => panic!("Unexpected event: {:?}", other),
        }

        assert_eq!(
            ServerEvent::from_event("live_session_ended", Value::Null).unwrap(),
            ServerEvent::SessionEnded
        );
        match ServerEvent::from_event("live_session_error", json!({"error": "boom", "code": 1011}))
            .unwrap()
        {
            ServerEvent::SessionError(err) => {
                assert_eq!(err.error, "boom");
                assert_eq!(err.code, Some(1011));
            }
            other => panic!("Unexpected event: {:?}", other),
        }
        assert!(matches!(
            ServerEvent::from_event("something_else", json!({"x": 1})).unwrap(),
            ServerEvent::Unknown { .. }
        ));
    }
}
