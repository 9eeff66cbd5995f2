//! Endpoint-side relay connection: connect, reconnect with backoff,
//! heartbeat, encrypted send/receive, and durable session persistence.
//!
//! Grounded on the daemon's own outbound relay loop (connect_async +
//! tokio::select! over inbound/outbound/broadcast tasks, exponential
//! backoff reconnect) generalized from a single always-plaintext-fallback
//! client into a symmetric desktop/mobile peer that requires E2EE for every
//! `relay` frame.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::EndpointConfig;
use crate::crypto::{CryptoError, Session as CryptoSession};
use crate::protocol::{ClientFrame, ServerFrame};
use crate::storage::Storage;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_CAP: Duration = Duration::from_secs(30);
const PERSIST_EVERY_N_SENDS: u64 = 5;

/// Events surfaced to the application layer (RemoteControlFSM, CommandProxy,
/// PairingFlow) as the relay connection runs.
#[derive(Debug, Clone)]
pub enum EndpointEvent {
    Decrypted { from: String, plaintext: Vec<u8> },
    PairingAccepted { device_id: String, public_key: String, device_name: Option<String> },
    DeviceOnline { device_id: String },
    DeviceOffline { device_id: String },
    PairingRevoked { device_id: String },
    ControlRequest { from: String, device_name: Option<String> },
    ControlAck { from: String, accepted: bool },
    ControlRevoked { from: String },
    ReauthRequired { peer: String },
    ServerError { message: String },
}

pub struct RelayClient {
    config: EndpointConfig,
    storage: Storage,
    device_id: String,
    device_type: &'static str,
    sessions: Arc<Mutex<HashMap<String, CryptoSession>>>,
    send_counts: Arc<Mutex<HashMap<String, u64>>>,
    out_tx: mpsc::UnboundedSender<ClientFrame>,
    out_rx: Mutex<Option<mpsc::UnboundedReceiver<ClientFrame>>>,
    events_tx: mpsc::UnboundedSender<EndpointEvent>,
    shutting_down: AtomicBool,
}

impl RelayClient {
    pub fn new(
        config: EndpointConfig,
        storage: Storage,
        device_id: String,
        device_type: &'static str,
    ) -> (Self, mpsc::UnboundedReceiver<EndpointEvent>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                storage,
                device_id,
                device_type,
                sessions: Arc::new(Mutex::new(HashMap::new())),
                send_counts: Arc::new(Mutex::new(HashMap::new())),
                out_tx,
                out_rx: Mutex::new(Some(out_rx)),
                events_tx,
                shutting_down: AtomicBool::new(false),
            },
            events_rx,
        )
    }

    /// Intentional disconnect: persists every session's current counters
    /// (so a later restart resumes from an up-to-date replay window), then
    /// marks the client so `run()`'s reconnect loop exits on its next
    /// decision point instead of retrying. Does not forcibly close an
    /// in-flight connection — the live inbound/outbound tasks wind down
    /// naturally and `run()` returns once they do.
    pub async fn disconnect(&self) -> anyhow::Result<()> {
        self.shutting_down.store(true, Ordering::SeqCst);
        let sessions = self.sessions.lock().await;
        for (peer_device_id, session) in sessions.iter() {
            self.storage.save_session(peer_device_id, session).await?;
        }
        Ok(())
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<ClientFrame> {
        self.out_tx.clone()
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub async fn has_session(&self, peer_device_id: &str) -> bool {
        self.sessions.lock().await.contains_key(peer_device_id)
    }

    /// Installs a freshly derived session for `peer_device_id`, persisting
    /// it immediately (called by PairingFlow right after a handshake).
    pub async fn install_session(&self, peer_device_id: &str, session: CryptoSession) -> anyhow::Result<()> {
        self.storage.save_session(peer_device_id, &session).await?;
        self.sessions
            .lock()
            .await
            .insert(peer_device_id.to_string(), session);
        Ok(())
    }

    /// Encrypts and sends `plaintext` to `to`. Fails with `NoSession` (as a
    /// plain error string) if no E2EE session exists for that peer yet.
    pub async fn send_encrypted(&self, to: &str, plaintext: &[u8]) -> anyhow::Result<()> {
        let (payload, seq) = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions
                .get_mut(to)
                .ok_or_else(|| anyhow::anyhow!("NoSession: no E2EE session for {to}"))?;
            session.encrypt(plaintext)?
        };

        self.out_tx.send(ClientFrame::Relay {
            to: to.to_string(),
            payload,
            seq: seq as i64,
        })?;

        let mut counts = self.send_counts.lock().await;
        let count = counts.entry(to.to_string()).or_insert(0);
        *count += 1;
        if *count % PERSIST_EVERY_N_SENDS == 0 {
            let sessions = self.sessions.lock().await;
            if let Some(session) = sessions.get(to) {
                self.storage.save_session(to, session).await?;
            }
        }
        Ok(())
    }

    /// Runs the connect/reconnect loop forever. Never returns under normal
    /// operation; returns only if the connection is intentionally torn down
    /// (not currently exposed, since both desktop and mobile processes run
    /// for their whole lifetime).
    ///
    /// Takes `Arc<Self>` rather than consuming the client so that callers can
    /// keep a clone around to drive `sender`/`install_session`/`send_encrypted`
    /// (pairing handshakes, command-proxy responses) while this loop runs in
    /// the background.
    pub async fn run(self: Arc<Self>) {
        let mut out_rx = self.out_rx.lock().await.take().expect("run() called once");
        let mut attempt: u32 = 0;

        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                info!("relay: intentional disconnect — not reconnecting");
                return;
            }

            let ws_url = to_ws_url(
                &self.config.server_url,
                self.device_type,
                &self.device_id,
                &self.config.token,
                &self.config.device_name,
            );
            info!(url = %ws_url, "relay: connecting");

            let connect = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&ws_url)).await;
            match connect {
                Ok(Ok((stream, _))) => {
                    info!("relay: connected");
                    attempt = 0;
                    let (mut sink, mut source) = stream.split();

                    let heartbeat_tx = self.out_tx.clone();
                    let heartbeat = tokio::spawn(async move {
                        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
                        loop {
                            interval.tick().await;
                            if heartbeat_tx.send(ClientFrame::Heartbeat).is_err() {
                                break;
                            }
                        }
                    });

                    tokio::select! {
                        _ = self.handle_inbound(&mut source) => {
                            warn!("relay: inbound stream closed");
                        }
                        _ = forward_outbound(&mut out_rx, &mut sink) => {
                            warn!("relay: outbound channel closed");
                        }
                    }
                    heartbeat.abort();
                }
                Ok(Err(e)) => warn!("relay: connect failed: {e:#}"),
                Err(_) => warn!("relay: connect timed out after {:?}", CONNECT_TIMEOUT),
            }

            let delay = backoff_delay(attempt);
            attempt += 1;
            info!("relay: reconnecting in {delay:?}");
            tokio::time::sleep(delay).await;
        }
    }

    async fn handle_inbound(
        &self,
        source: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
    ) {
        while let Some(msg) = source.next().await {
            let text = match msg {
                Ok(Message::Text(t)) => t,
                Ok(Message::Close(_)) | Err(_) => break,
                _ => continue,
            };

            let frame: ServerFrame = match serde_json::from_str(&text) {
                Ok(f) => f,
                Err(e) => {
                    warn!("relay: unparseable server frame: {e}");
                    continue;
                }
            };

            self.dispatch_inbound(frame).await;
        }
    }

    async fn dispatch_inbound(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::Pong => debug!("relay: pong"),
            ServerFrame::PairingAccepted { public_key, device_id, device_name } => {
                let _ = self.events_tx.send(EndpointEvent::PairingAccepted {
                    device_id,
                    public_key,
                    device_name,
                });
            }
            ServerFrame::PairingRevoked { device_id } => {
                self.sessions.lock().await.remove(&device_id);
                let _ = self.storage.delete_session(&device_id).await;
                let _ = self.events_tx.send(EndpointEvent::PairingRevoked { device_id });
            }
            ServerFrame::Relay { from, payload, seq } => {
                let result = {
                    let mut sessions = self.sessions.lock().await;
                    match sessions.get_mut(&from) {
                        Some(session) => session.decrypt(&payload, seq),
                        None => {
                            warn!(peer = %from, "relay: received frame with no session — dropping");
                            return;
                        }
                    }
                };

                match result {
                    Ok(plaintext) => {
                        let _ = self.events_tx.send(EndpointEvent::Decrypted { from, plaintext });
                    }
                    Err(CryptoError::AuthFailed) | Err(CryptoError::ReplayRejected { .. }) => {
                        warn!(peer = %from, "relay: decrypt failed — dropping session, re-pair required");
                        self.sessions.lock().await.remove(&from);
                        let _ = self.storage.delete_session(&from).await;
                        let _ = self.events_tx.send(EndpointEvent::ReauthRequired { peer: from });
                    }
                    Err(e) => warn!(peer = %from, "relay: decrypt error: {e}"),
                }
            }
            ServerFrame::DeviceOnline { device_id } => {
                let _ = self.events_tx.send(EndpointEvent::DeviceOnline { device_id });
            }
            ServerFrame::DeviceOffline { device_id } => {
                let _ = self.events_tx.send(EndpointEvent::DeviceOffline { device_id });
            }
            ServerFrame::DeviceList { .. } => {
                // Surfaced to the mobile UI layer directly; no FSM action needed here.
            }
            ServerFrame::ControlRequest { from, device_name } => {
                let _ = self.events_tx.send(EndpointEvent::ControlRequest { from, device_name });
            }
            ServerFrame::ControlAck { from, accepted } => {
                let _ = self.events_tx.send(EndpointEvent::ControlAck { from, accepted });
            }
            ServerFrame::ControlRevoked { from } => {
                let _ = self.events_tx.send(EndpointEvent::ControlRevoked { from });
            }
            ServerFrame::Error { message } => {
                warn!("relay: server error: {message}");
                let _ = self.events_tx.send(EndpointEvent::ServerError { message });
            }
        }
    }
}

async fn forward_outbound(
    rx: &mut mpsc::UnboundedReceiver<ClientFrame>,
    sink: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
) {
    while let Some(frame) = rx.recv().await {
        let json = match serde_json::to_string(&ClientFrameWire::from(frame)) {
            Ok(j) => j,
            Err(e) => {
                warn!("relay: failed to serialize outbound frame: {e}");
                continue;
            }
        };
        if sink.send(Message::Text(json)).await.is_err() {
            break;
        }
    }
}

/// `ClientFrame` only derives `Deserialize` (it's the server's input type);
/// wrap it for the one direction the endpoint needs — serializing its own
/// outbound frames — without adding a `Serialize` impl the server never uses.
#[derive(serde::Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ClientFrameWire {
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

impl From<ClientFrame> for ClientFrameWire {
    fn from(frame: ClientFrame) -> Self {
        match frame {
            ClientFrame::Heartbeat => ClientFrameWire::Heartbeat,
            ClientFrame::RegisterPairing { pairing_code, public_key, device_name } => {
                ClientFrameWire::RegisterPairing { pairing_code, public_key, device_name }
            }
            ClientFrame::ClaimPairing { pairing_code, public_key } => {
                ClientFrameWire::ClaimPairing { pairing_code, public_key }
            }
            ClientFrame::RevokePairing { target_device_id } => {
                ClientFrameWire::RevokePairing { target_device_id }
            }
            ClientFrame::Relay { to, payload, seq } => ClientFrameWire::Relay { to, payload, seq },
            ClientFrame::ControlRequest { target_desktop_id } => {
                ClientFrameWire::ControlRequest { target_desktop_id }
            }
            ClientFrame::ControlAck { to, accepted } => ClientFrameWire::ControlAck { to, accepted },
            ClientFrame::ControlRevoked { to } => ClientFrameWire::ControlRevoked { to },
        }
    }
}

fn to_ws_url(server_url: &str, device_type: &str, device_id: &str, token: &str, device_name: &str) -> String {
    let ws_base = server_url
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    format!(
        "{ws_base}/ws/relay?token={}&deviceType={}&deviceId={}&deviceName={}",
        urlencode(token),
        device_type,
        urlencode(device_id),
        urlencode(device_name),
    )
}

fn urlencode(s: &str) -> String {
    // The only characters these values ever contain are URL-safe except
    // spaces and a handful of reserved characters in device names.
    s.chars()
        .map(|c| match c {
            ' ' => "%20".to_string(),
            '&' => "%26".to_string(),
            '#' => "%23".to_string(),
            '?' => "%3F".to_string(),
            _ => c.to_string(),
        })
        .collect()
}

fn backoff_delay(attempt: u32) -> Duration {
    let secs = 2u64.saturating_pow(attempt).min(RECONNECT_CAP.as_secs());
    Duration::from_secs(secs.max(1))
}

#[cfg(test)]
impl RelayClient {
    pub(crate) async fn sessions_for_test(&self) -> HashMap<String, CryptoSession> {
        self.sessions.lock().await.clone()
    }
}
