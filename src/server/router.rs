//! Central frame dispatcher. One `handle_frame` call per inbound message;
//! touches the shared registries under a fixed lock order — registry,
//! then pairing store, then pairing graph — so no operation can deadlock
//! against another.

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::protocol::{ClientFrame, DeviceSummary, ServerFrame};
use crate::server::pairing_graph::PairingGraph;
use crate::server::pairing_store::{ConsumeError, PairingStore};
use crate::server::registry::{ConnectionHandle, DeviceRegistry};

pub struct ServerState {
    pub registry: Mutex<DeviceRegistry>,
    pub pairing_store: Mutex<PairingStore>,
    pub pairing_graph: Mutex<PairingGraph>,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(DeviceRegistry::new()),
            pairing_store: Mutex::new(PairingStore::new()),
            pairing_graph: Mutex::new(PairingGraph::new()),
        }
    }

    /// Background sweep task for expired pairing offers. Intended to be
    /// spawned once and run for the process lifetime.
    pub async fn run_pairing_sweep(&self) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            self.pairing_store.lock().await.sweep();
        }
    }

    /// Called once a connection is admitted and attached to the registry.
    /// Notifies existing peers that this device is now online, and — for a
    /// mobile — sends the initial device list.
    pub async fn on_attach(&self, handle: &ConnectionHandle, role: DeviceRole) {
        let peers = self
            .pairing_graph
            .lock()
            .await
            .peers_of(&handle.user_id, &handle.device_id);

        let registry = self.registry.lock().await;
        for peer_id in &peers {
            if let Some(peer) = registry.get(peer_id) {
                peer.send(ServerFrame::DeviceOnline {
                    device_id: handle.device_id.clone(),
                });
            }
        }

        if role == DeviceRole::Mobile {
            let graph = self.pairing_graph.lock().await;
            let desktops = graph.desktops_for_user(&handle.user_id);
            drop(graph);
            let devices = desktops
                .into_iter()
                .map(|device_id| {
                    let online = registry.is_online(&device_id);
                    DeviceSummary {
                        device_id,
                        device_name: None,
                        online,
                    }
                })
                .collect();
            handle.send(ServerFrame::DeviceList { devices });
        }
    }

    /// Called once a connection's read loop exits, after it has been
    /// detached from the registry (race-guarded by generation).
    pub async fn on_detach(&self, user_id: &str, device_id: &str) {
        let peers = self.pairing_graph.lock().await.peers_of(user_id, device_id);
        let registry = self.registry.lock().await;
        for peer_id in &peers {
            if let Some(peer) = registry.get(peer_id) {
                peer.send(ServerFrame::DeviceOffline {
                    device_id: device_id.to_string(),
                });
            }
        }
    }

    pub async fn handle_frame(&self, sender: &ConnectionHandle, role: DeviceRole, frame: ClientFrame) {
        match frame {
            ClientFrame::Heartbeat => {
                sender.send(ServerFrame::Pong);
            }

            ClientFrame::RegisterPairing {
                pairing_code,
                public_key,
                device_name,
            } => {
                if role != DeviceRole::Desktop {
                    sender.send(ServerFrame::error("only a desktop may register a pairing offer"));
                    return;
                }
                self.pairing_store.lock().await.register(
                    pairing_code,
                    sender.user_id.clone(),
                    sender.device_id.clone(),
                    public_key,
                    device_name,
                );
            }

            ClientFrame::ClaimPairing {
                pairing_code,
                public_key,
            } => {
                if role != DeviceRole::Mobile {
                    sender.send(ServerFrame::error("only a mobile may claim a pairing offer"));
                    return;
                }
                self.handle_claim(sender, pairing_code, public_key).await;
            }

            ClientFrame::RevokePairing { target_device_id } => {
                let linked = self
                    .pairing_graph
                    .lock()
                    .await
                    .are_linked(&sender.device_id, &target_device_id);
                if !linked {
                    sender.send(ServerFrame::error("not paired with that device"));
                    return;
                }
                self.pairing_graph
                    .lock()
                    .await
                    .unlink(&sender.device_id, &target_device_id);

                let registry = self.registry.lock().await;
                if let Some(target) = registry.get(&target_device_id) {
                    target.send(ServerFrame::PairingRevoked {
                        device_id: sender.device_id.clone(),
                    });
                }
            }

            ClientFrame::Relay { to, payload, seq } => {
                if !self.pairing_graph.lock().await.are_linked(&sender.device_id, &to) {
                    sender.send(ServerFrame::error("not paired with that device"));
                    return;
                }
                let registry = self.registry.lock().await;
                match registry.get(&to) {
                    Some(target) => target.send(ServerFrame::Relay {
                        from: sender.device_id.clone(),
                        payload,
                        seq,
                    }),
                    None => sender.send(ServerFrame::error("target device is offline")),
                }
            }

            ClientFrame::ControlRequest { target_desktop_id } => {
                if role != DeviceRole::Mobile {
                    sender.send(ServerFrame::error("only a mobile may request control"));
                    return;
                }
                if !self
                    .pairing_graph
                    .lock()
                    .await
                    .are_linked(&sender.device_id, &target_desktop_id)
                {
                    sender.send(ServerFrame::error("not paired with that device"));
                    return;
                }
                let registry = self.registry.lock().await;
                match registry.get(&target_desktop_id) {
                    Some(target) => target.send(ServerFrame::ControlRequest {
                        from: sender.device_id.clone(),
                        device_name: sender.device_name.clone(),
                    }),
                    None => sender.send(ServerFrame::error("target device is offline")),
                }
            }

            ClientFrame::ControlAck { to, accepted } => {
                let registry = self.registry.lock().await;
                match registry.get(&to) {
                    Some(target) => target.send(ServerFrame::ControlAck {
                        from: sender.device_id.clone(),
                        accepted,
                    }),
                    None => sender.send(ServerFrame::error("target device is offline")),
                }
            }

            ClientFrame::ControlRevoked { to } => {
                let registry = self.registry.lock().await;
                match registry.get(&to) {
                    Some(target) => target.send(ServerFrame::ControlRevoked {
                        from: sender.device_id.clone(),
                    }),
                    None => sender.send(ServerFrame::error("target device is offline")),
                }
            }
        }
    }

    async fn handle_claim(&self, sender: &ConnectionHandle, pairing_code: String, mobile_public_key: String) {
        let offer = {
            let mut store = self.pairing_store.lock().await;
            store.consume_owned_by(&pairing_code, &sender.user_id)
        };

        let offer = match offer {
            Ok(offer) => offer,
            Err(ConsumeError::NotFound) => {
                sender.send(ServerFrame::error("expired"));
                return;
            }
            Err(ConsumeError::WrongUser) => {
                // Privacy: the offer is left in place for its rightful owner,
                // and we never reveal that the code belongs to another account.
                warn!("claim-pairing attempted across account boundary");
                sender.send(ServerFrame::error("expired"));
                return;
            }
        };

        self.pairing_graph.lock().await.link(
            sender.user_id.clone(),
            offer.desktop_device_id.clone(),
            sender.device_id.clone(),
        );

        sender.send(ServerFrame::PairingAccepted {
            public_key: offer.desktop_public_key.clone(),
            device_id: offer.desktop_device_id.clone(),
            device_name: offer.desktop_display_name.clone(),
        });

        let registry = self.registry.lock().await;
        if let Some(desktop) = registry.get(&offer.desktop_device_id) {
            desktop.send(ServerFrame::PairingAccepted {
                public_key: mobile_public_key,
                device_id: sender.device_id.clone(),
                device_name: sender.device_name.clone(),
            });
        } else {
            debug!(desktop = %offer.desktop_device_id, "claimed pairing but desktop is offline");
        }
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    Desktop,
    Mobile,
}

impl std::str::FromStr for DeviceRole {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "desktop" => Ok(DeviceRole::Desktop),
            "mobile" => Ok(DeviceRole::Mobile),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::registry::Outbound;
    use tokio::sync::mpsc;

    async fn attach(
        state: &ServerState,
        user: &str,
        device: &str,
        name: Option<&str>,
    ) -> (ConnectionHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let outcome = state.registry.lock().await.attach(
            user.to_string(),
            device.to_string(),
            name.map(|s| s.to_string()),
            tx,
        );
        (outcome.handle, rx)
    }

    fn recv_frame(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> ServerFrame {
        match rx.try_recv().expect("expected a queued outbound message") {
            Outbound::Frame(frame) => frame,
            Outbound::Close(reason) => panic!("expected a frame, got close({reason})"),
        }
    }

    #[tokio::test]
    async fn register_then_claim_notifies_both_sides() {
        let state = ServerState::new();
        let (desktop, mut desktop_rx) = attach(&state, "user-1", "desktop-1", Some("Desk")).await;
        let (mobile, mut mobile_rx) = attach(&state, "user-1", "mobile-1", Some("Phone")).await;

        state
            .handle_frame(
                &desktop,
                DeviceRole::Desktop,
                ClientFrame::RegisterPairing {
                    pairing_code: "000111".into(),
                    public_key: "desktop-pub".into(),
                    device_name: Some("Desk".into()),
                },
            )
            .await;

        state
            .handle_frame(
                &mobile,
                DeviceRole::Mobile,
                ClientFrame::ClaimPairing {
                    pairing_code: "000111".into(),
                    public_key: "mobile-pub".into(),
                },
            )
            .await;

        let to_mobile = recv_frame(&mut mobile_rx);
        match to_mobile {
            ServerFrame::PairingAccepted { device_id, public_key, .. } => {
                assert_eq!(device_id, "desktop-1");
                assert_eq!(public_key, "desktop-pub");
            }
            _ => panic!("expected pairing-accepted"),
        }

        let to_desktop = recv_frame(&mut desktop_rx);
        match to_desktop {
            ServerFrame::PairingAccepted { device_id, public_key, .. } => {
                assert_eq!(device_id, "mobile-1");
                assert_eq!(public_key, "mobile-pub");
            }
            _ => panic!("expected pairing-accepted"),
        }

        assert!(state.pairing_graph.lock().await.are_linked("desktop-1", "mobile-1"));
    }

    #[tokio::test]
    async fn claim_across_accounts_is_rejected_but_leaves_the_offer_for_its_owner() {
        let state = ServerState::new();
        let (desktop, _rx1) = attach(&state, "user-a", "desktop-1", None).await;
        let (intruder, mut intruder_rx) = attach(&state, "user-b", "mobile-intruder", None).await;
        let (mobile, mut mobile_rx) = attach(&state, "user-a", "mobile-1", None).await;

        state
            .handle_frame(
                &desktop,
                DeviceRole::Desktop,
                ClientFrame::RegisterPairing {
                    pairing_code: "000222".into(),
                    public_key: "desktop-pub".into(),
                    device_name: None,
                },
            )
            .await;

        state
            .handle_frame(
                &intruder,
                DeviceRole::Mobile,
                ClientFrame::ClaimPairing {
                    pairing_code: "000222".into(),
                    public_key: "intruder-pub".into(),
                },
            )
            .await;

        match recv_frame(&mut intruder_rx) {
            ServerFrame::Error { message } => assert_eq!(message, "expired"),
            _ => panic!("expected error"),
        }
        assert!(!state.pairing_graph.lock().await.are_linked("desktop-1", "mobile-intruder"));

        // The rightful owner can still claim the same code afterwards.
        state
            .handle_frame(
                &mobile,
                DeviceRole::Mobile,
                ClientFrame::ClaimPairing {
                    pairing_code: "000222".into(),
                    public_key: "mobile-pub".into(),
                },
            )
            .await;

        match recv_frame(&mut mobile_rx) {
            ServerFrame::PairingAccepted { device_id, .. } => assert_eq!(device_id, "desktop-1"),
            _ => panic!("expected pairing-accepted"),
        }
        assert!(state.pairing_graph.lock().await.are_linked("desktop-1", "mobile-1"));
    }

    #[tokio::test]
    async fn relay_without_pairing_returns_error() {
        let state = ServerState::new();
        let (mobile, mut mobile_rx) = attach(&state, "user-1", "mobile-1", None).await;
        let (_desktop, _rx) = attach(&state, "user-1", "desktop-1", None).await;

        state
            .handle_frame(
                &mobile,
                DeviceRole::Mobile,
                ClientFrame::Relay {
                    to: "desktop-1".into(),
                    payload: "abc".into(),
                    seq: 0,
                },
            )
            .await;

        match recv_frame(&mut mobile_rx) {
            ServerFrame::Error { message } => assert_eq!(message, "not paired with that device"),
            _ => panic!("expected error"),
        }
    }

    #[tokio::test]
    async fn relay_after_pairing_forwards_to_target() {
        let state = ServerState::new();
        let (desktop, mut desktop_rx) = attach(&state, "user-1", "desktop-1", None).await;
        let (mobile, _rx) = attach(&state, "user-1", "mobile-1", None).await;
        state
            .pairing_graph
            .lock()
            .await
            .link("user-1".into(), "desktop-1".into(), "mobile-1".into());

        state
            .handle_frame(
                &mobile,
                DeviceRole::Mobile,
                ClientFrame::Relay {
                    to: "desktop-1".into(),
                    payload: "encrypted-blob".into(),
                    seq: 7,
                },
            )
            .await;

        match recv_frame(&mut desktop_rx) {
            ServerFrame::Relay { from, payload, seq } => {
                assert_eq!(from, "mobile-1");
                assert_eq!(payload, "encrypted-blob");
                assert_eq!(seq, 7);
            }
            _ => panic!("expected relay"),
        }
        let _ = desktop;
    }

    #[tokio::test]
    async fn revoke_pairing_severs_graph_and_notifies_target() {
        let state = ServerState::new();
        let (desktop, _rx1) = attach(&state, "user-1", "desktop-1", None).await;
        let (mobile, mut mobile_rx) = attach(&state, "user-1", "mobile-1", None).await;
        state
            .pairing_graph
            .lock()
            .await
            .link("user-1".into(), "desktop-1".into(), "mobile-1".into());

        state
            .handle_frame(
                &desktop,
                DeviceRole::Desktop,
                ClientFrame::RevokePairing {
                    target_device_id: "mobile-1".into(),
                },
            )
            .await;

        assert!(!state.pairing_graph.lock().await.are_linked("desktop-1", "mobile-1"));
        match recv_frame(&mut mobile_rx) {
            ServerFrame::PairingRevoked { device_id } => assert_eq!(device_id, "desktop-1"),
            _ => panic!("expected pairing-revoked"),
        }
    }
}
