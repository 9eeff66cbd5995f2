//! QR payload encode/decode for the desktop pairing offer.
//!
//! The mobile's camera-scan UI is out of scope (SPEC_FULL.md S1); this
//! module only produces/consumes the JSON payload and a terminal-renderable
//! QR surface, grounded on the daemon's existing `clawd token qr` use of the
//! `qrcode` crate.

use qrcode::render::unicode;
use qrcode::QrCode;
use serde::{Deserialize, Serialize};

/// QR content: `{s, t, p, k, d}` = server URL, token, pairing code, desktop
/// public key (hex), desktop device id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QrPayload {
    pub s: String,
    pub t: String,
    pub p: String,
    pub k: String,
    pub d: String,
}

pub fn encode_json(payload: &QrPayload) -> anyhow::Result<String> {
    Ok(serde_json::to_string(payload)?)
}

pub fn decode_json(raw: &str) -> anyhow::Result<QrPayload> {
    Ok(serde_json::from_str(raw)?)
}

/// Renders the payload as a terminal-friendly QR code (two pixels per
/// character cell) for the `pair` CLI subcommand.
pub fn render_terminal(payload: &QrPayload) -> anyhow::Result<String> {
    let json = encode_json(payload)?;
    let code = QrCode::new(json.as_bytes())?;
    let image = code
        .render::<unicode::Dense1x2>()
        .quiet_zone(true)
        .build();
    Ok(image)
}

/// Best-effort LAN server URL for a desktop whose `config.server_url` points
/// at a loopback/placeholder address — lets the QR be scannable by a phone
/// on the same network without manual configuration.
pub fn resolve_lan_server_url(configured: &str, port: u16) -> String {
    if !configured.contains("0.0.0.0") && !configured.is_empty() {
        return configured.to_string();
    }
    match local_ip_address::local_ip() {
        Ok(ip) => format!("http://{ip}:{port}"),
        Err(_) => configured.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trips() {
        let payload = QrPayload {
            s: "https://relay.example.com".into(),
            t: "token-abc".into(),
            p: "000111222333".into(),
            k: "04aabbcc".into(),
            d: "desktop-deviceid".into(),
        };
        let json = encode_json(&payload).unwrap();
        let back = decode_json(&json).unwrap();
        assert_eq!(payload, back);
    }

    #[test]
    fn decode_rejects_malformed_json() {
        assert!(decode_json("not json").is_err());
    }

    #[test]
    fn render_terminal_produces_nonempty_output() {
        let payload = QrPayload {
            s: "https://relay.example.com".into(),
            t: "t".into(),
            p: "p".into(),
            k: "k".into(),
            d: "d".into(),
        };
        let rendered = render_terminal(&payload).unwrap();
        assert!(!rendered.is_empty());
    }
}
