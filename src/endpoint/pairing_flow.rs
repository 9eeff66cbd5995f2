//! Desktop-side offer generation and mobile-side claim, meeting in the
//! middle at a shared derived session once the server's `pairing-accepted`
//! frame confirms both public keys.

use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::crypto::{derive_session, generate_keypair, KeyPair};
use crate::endpoint::qr::QrPayload;
use crate::endpoint::relay_client::RelayClient;
use crate::protocol::ClientFrame;

struct PendingOffer {
    keypair: KeyPair,
    pairing_code: String,
}

struct PendingClaim {
    session: crate::crypto::Session,
}

/// Coordinates the pairing handshake for one endpoint process. A desktop
/// holds at most one outstanding offer at a time; a mobile holds at most one
/// outstanding claim at a time (one QR scan in flight).
#[derive(Default)]
pub struct PairingFlow {
    pending_offer: Mutex<Option<PendingOffer>>,
    pending_claims: Mutex<HashMap<String, PendingClaim>>,
}

impl PairingFlow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Desktop side: generates a keypair and pairing code, emits
    /// `register-pairing`, and returns the QR payload for the mobile to
    /// scan. Replaces any previously pending (unclaimed) offer.
    pub async fn desktop_create_offer(
        &self,
        relay: &RelayClient,
        server_url: String,
        token: String,
        desktop_device_id: String,
        desktop_device_name: Option<String>,
    ) -> anyhow::Result<QrPayload> {
        let keypair = generate_keypair();
        let pairing_code = Uuid::new_v4().to_string().replace('-', "");

        relay.sender().send(ClientFrame::RegisterPairing {
            pairing_code: pairing_code.clone(),
            public_key: keypair.public_hex.clone(),
            device_name: desktop_device_name,
        })?;

        let payload = QrPayload {
            s: server_url,
            t: token,
            p: pairing_code.clone(),
            k: keypair.public_hex.clone(),
            d: desktop_device_id,
        };

        *self.pending_offer.lock().await = Some(PendingOffer { keypair, pairing_code });
        Ok(payload)
    }

    /// Desktop side: called when a `pairing-accepted` event names the mobile
    /// that just claimed the outstanding offer. Derives the shared session
    /// and installs it on the relay client.
    pub async fn desktop_on_pairing_accepted(
        &self,
        relay: &RelayClient,
        mobile_device_id: &str,
        mobile_public_key: &str,
    ) -> anyhow::Result<()> {
        let offer = self
            .pending_offer
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("pairing-accepted received with no pending offer"))?;

        let session = derive_session(&offer.keypair, mobile_public_key, &offer.pairing_code)?;
        relay.install_session(mobile_device_id, session).await?;
        info!(peer = %mobile_device_id, "pairing: desktop session established");
        Ok(())
    }

    /// Mobile side: generates a keypair, pre-derives the session from the QR
    /// payload so an early-arriving `relay` frame can be decrypted before
    /// the confirming `pairing-accepted` lands, and emits `claim-pairing`.
    pub async fn mobile_claim(&self, relay: &RelayClient, qr: &QrPayload) -> anyhow::Result<()> {
        let keypair = generate_keypair();
        let session = derive_session(&keypair, &qr.k, &qr.p)?;

        self.pending_claims
            .lock()
            .await
            .insert(qr.d.clone(), PendingClaim { session });

        relay.sender().send(ClientFrame::ClaimPairing {
            pairing_code: qr.p.clone(),
            public_key: keypair.public_hex.clone(),
        })?;
        Ok(())
    }

    /// Mobile side: called when `pairing-accepted` confirms the desktop
    /// device id matches a pre-derived pending claim. Commits it as the
    /// active session.
    pub async fn mobile_on_pairing_accepted(
        &self,
        relay: &RelayClient,
        desktop_device_id: &str,
    ) -> anyhow::Result<()> {
        let pending = self
            .pending_claims
            .lock()
            .await
            .remove(desktop_device_id)
            .ok_or_else(|| anyhow::anyhow!("pairing-accepted for unknown desktop {desktop_device_id}"))?;

        relay.install_session(desktop_device_id, pending.session).await?;
        info!(peer = %desktop_device_id, "pairing: mobile session established");
        Ok(())
    }
}
