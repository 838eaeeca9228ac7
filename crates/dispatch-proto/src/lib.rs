//! Socket protocol spoken between beach-dispatch instances and remote agents.
//! Kept in its own crate so agents can depend on the envelopes without pulling
//! in the server runtime.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Per-socket routing identifier. Minted when a socket is accepted and valid
/// only for that socket's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionToken(Uuid);

impl ConnectionToken {
    pub fn mint() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ConnectionToken {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Correlates one dispatch request with the results streamed back for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn mint() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for BatchId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Messages sent from an agent to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Claim the slot of whichever user issued `pairing_code`.
    #[serde(rename_all = "camelCase")]
    Register {
        device_id: String,
        #[serde(alias = "connectionCode")]
        pairing_code: String,
    },
    CommandResult(CommandResultMessage),
    SystemInformation(SystemInformationMessage),
    Ping,
}

/// One command's outcome. Fields are deliberately loose: the dispatcher owns
/// validation so that a bad index is dropped there instead of failing the
/// whole frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResultMessage {
    #[serde(alias = "commandId")]
    pub batch_id: BatchId,
    #[serde(default)]
    pub index: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
}

/// Free-form telemetry snapshot reported by an agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInformationMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Messages sent from the server to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Connected { connection_token: ConnectionToken },
    Registered { success: bool },
    #[serde(rename_all = "camelCase")]
    Execute {
        batch_id: BatchId,
        commands: Vec<String>,
    },
    Error { message: String },
    Pong,
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

/// Envelope carried on the fleet-wide fanout topic. Every instance sees every
/// envelope; only the one holding `connection_token` forwards `payload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanoutEnvelope {
    pub connection_token: ConnectionToken,
    pub payload: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn connected_uses_camel_case_token() {
        let token = ConnectionToken::mint();
        let value = serde_json::to_value(ServerMessage::Connected {
            connection_token: token,
        })
        .unwrap();
        assert_eq!(value["type"], "connected");
        assert_eq!(value["connectionToken"], token.to_string());
    }

    #[test]
    fn register_accepts_legacy_connection_code() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "register",
            "deviceId": "dev-1",
            "connectionCode": "abc123",
        }))
        .unwrap();
        match msg {
            ClientMessage::Register {
                device_id,
                pairing_code,
            } => {
                assert_eq!(device_id, "dev-1");
                assert_eq!(pairing_code, "abc123");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn command_result_keeps_non_numeric_index() {
        let batch = BatchId::mint();
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "command_result",
            "commandId": batch.to_string(),
            "index": "one",
            "output": "hi",
        }))
        .unwrap();
        let ClientMessage::CommandResult(result) = msg else {
            panic!("expected command_result");
        };
        assert_eq!(result.batch_id, batch);
        assert_eq!(result.index, json!("one"));
        assert_eq!(result.success, None);
    }

    #[test]
    fn system_information_collects_extra_fields() {
        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "system_information",
            "deviceId": "dev-1",
            "hostname": "box",
            "cpus": 8,
        }))
        .unwrap();
        let ClientMessage::SystemInformation(info) = msg else {
            panic!("expected system_information");
        };
        assert_eq!(info.device_id.as_deref(), Some("dev-1"));
        assert_eq!(info.fields["hostname"], "box");
        assert_eq!(info.fields["cpus"], 8);
        assert!(!info.fields.contains_key("type"));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let parsed = serde_json::from_str::<ClientMessage>(r#"{"type":"reboot"}"#);
        assert!(parsed.is_err());
    }
}
