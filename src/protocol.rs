//! Wire protocol for `/ws/relay` — one JSON object per WebSocket text frame,
//! tagged by `type`. `ClientFrame` is what the server accepts; `ServerFrame`
//! is what it emits. Unknown `type` values or missing fields are surfaced as
//! serde errors at the call site and translated into an `error` frame by the
//! router, never a closed connection.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    Heartbeat,
    RegisterPairing {
        #[serde(rename = "pairingCode")]
        pairing_code: String,
        #[serde(rename = "publicKey")]
        public_key: String,
        #[serde(rename = "deviceName")]
        device_name: Option<String>,
    },
    ClaimPairing {
        #[serde(rename = "pairingCode")]
        pairing_code: String,
        #[serde(rename = "publicKey")]
        public_key: String,
    },
    RevokePairing {
        #[serde(rename = "targetDeviceId")]
        target_device_id: String,
    },
    Relay {
        to: String,
        payload: String,
        seq: i64,
    },
    ControlRequest {
        #[serde(rename = "targetDesktopId")]
        target_desktop_id: String,
    },
    ControlAck {
        to: String,
        accepted: bool,
    },
    ControlRevoked {
        to: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    Pong,
    PairingAccepted {
        #[serde(rename = "publicKey")]
        public_key: String,
        #[serde(rename = "deviceId")]
        device_id: String,
        #[serde(rename = "deviceName")]
        device_name: Option<String>,
    },
    PairingRevoked {
        #[serde(rename = "deviceId")]
        device_id: String,
    },
    Relay {
        from: String,
        payload: String,
        seq: i64,
    },
    DeviceOnline {
        #[serde(rename = "deviceId")]
        device_id: String,
    },
    DeviceOffline {
        #[serde(rename = "deviceId")]
        device_id: String,
    },
    DeviceList {
        devices: Vec<DeviceSummary>,
    },
    ControlRequest {
        from: String,
        #[serde(rename = "deviceName")]
        device_name: Option<String>,
    },
    ControlAck {
        from: String,
        accepted: bool,
    },
    ControlRevoked {
        from: String,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSummary {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "deviceName")]
    pub device_name: Option<String>,
    pub online: bool,
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        ServerFrame::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","message":"internal serialization error"}"#.to_string()
        })
    }
}

/// One JSON object exchanged *inside* the E2EE envelope between a paired
/// desktop and mobile, once the opaque `relay` payload has been decrypted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InnerFrame {
    Command {
        id: String,
        channel: String,
        args: serde_json::Value,
    },
    Response {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Event {
        channel: String,
        data: serde_json::Value,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_relay_parses_expected_fields() {
        let raw = r#"{"type":"relay","to":"dev-2","payload":"YWJj","seq":4}"#;
        let frame: ClientFrame = serde_json::from_str(raw).unwrap();
        match frame {
            ClientFrame::Relay { to, payload, seq } => {
                assert_eq!(to, "dev-2");
                assert_eq!(payload, "YWJj");
                assert_eq!(seq, 4);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn client_frame_unknown_type_fails_to_parse() {
        let raw = r#"{"type":"teleport"}"#;
        let result: Result<ClientFrame, _> = serde_json::from_str(raw);
        assert!(result.is_err());
    }

    #[test]
    fn server_frame_serializes_with_kebab_case_tag() {
        let frame = ServerFrame::PairingRevoked {
            device_id: "abc".into(),
        };
        let json = frame.to_json();
        assert!(json.contains(r#""type":"pairing-revoked""#));
        assert!(json.contains(r#""deviceId":"abc""#));
    }

    #[test]
    fn inner_frame_command_round_trips() {
        let cmd = InnerFrame::Command {
            id: "req-1".into(),
            channel: "session:list".into(),
            args: serde_json::json!({}),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        let back: InnerFrame = serde_json::from_str(&json).unwrap();
        match back {
            InnerFrame::Command { id, channel, .. } => {
                assert_eq!(id, "req-1");
                assert_eq!(channel, "session:list");
            }
            _ => panic!("wrong variant"),
        }
    }
}
