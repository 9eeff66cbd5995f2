//! Short-lived table of pairing offers registered by a desktop, consumed
//! exactly once by the mobile that claims them.

use std::collections::HashMap;
use std::time::{Duration, Instant};

const OFFER_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct PairingOffer {
    pub user_id: String,
    pub desktop_device_id: String,
    pub desktop_public_key: String,
    pub desktop_display_name: Option<String>,
    created_at: Instant,
}

#[derive(Default)]
pub struct PairingStore {
    offers: HashMap<String, PairingOffer>,
}

pub enum ConsumeError {
    /// No such code, or it had already expired and was swept away.
    NotFound,
    /// The code exists but belongs to a different user's account. Left in
    /// place so the legitimate owner can still claim it later (§4.8).
    WrongUser,
}

impl PairingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        pairing_code: String,
        user_id: String,
        desktop_device_id: String,
        desktop_public_key: String,
        desktop_display_name: Option<String>,
    ) {
        self.offers.insert(
            pairing_code,
            PairingOffer {
                user_id,
                desktop_device_id,
                desktop_public_key,
                desktop_display_name,
                created_at: Instant::now(),
            },
        );
    }

    /// Atomically removes and returns the offer for `pairing_code`, provided
    /// it exists and has not exceeded the TTL. An expired offer is removed
    /// here too, even though it's also reachable from `sweep`.
    pub fn consume(&mut self, pairing_code: &str) -> Result<PairingOffer, ConsumeError> {
        match self.offers.remove(pairing_code) {
            Some(offer) if offer.created_at.elapsed() <= OFFER_TTL => Ok(offer),
            _ => Err(ConsumeError::NotFound),
        }
    }

    /// Like `consume`, but only removes the offer if it belongs to
    /// `user_id`. A claim from a different account sees `WrongUser` and
    /// leaves the offer in place — it must not learn that the code exists
    /// under someone else's account, but the rightful owner must still be
    /// able to claim it afterwards.
    pub fn consume_owned_by(
        &mut self,
        pairing_code: &str,
        user_id: &str,
    ) -> Result<PairingOffer, ConsumeError> {
        match self.offers.get(pairing_code) {
            None => Err(ConsumeError::NotFound),
            Some(offer) if offer.created_at.elapsed() > OFFER_TTL => {
                self.offers.remove(pairing_code);
                Err(ConsumeError::NotFound)
            }
            Some(offer) if offer.user_id != user_id => Err(ConsumeError::WrongUser),
            Some(_) => Ok(self.offers.remove(pairing_code).expect("just matched")),
        }
    }

    /// Removes all offers older than the TTL. Call periodically (every 60s).
    pub fn sweep(&mut self) {
        self.offers.retain(|_, offer| offer.created_at.elapsed() <= OFFER_TTL);
    }

    pub fn len(&self) -> usize {
        self.offers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_consume_returns_offer_and_removes_it() {
        let mut store = PairingStore::new();
        store.register(
            "code-1".into(),
            "user-1".into(),
            "desktop-1".into(),
            "pub-1".into(),
            Some("My Desktop".into()),
        );
        let offer = store.consume("code-1").ok().unwrap();
        assert_eq!(offer.user_id, "user-1");
        assert!(store.consume("code-1").is_err());
    }

    #[test]
    fn consume_unknown_code_fails() {
        let mut store = PairingStore::new();
        assert!(store.consume("missing").is_err());
    }

    #[test]
    fn consume_owned_by_wrong_user_leaves_offer_for_rightful_owner() {
        let mut store = PairingStore::new();
        store.register(
            "code-1".into(),
            "user-1".into(),
            "desktop-1".into(),
            "pub-1".into(),
            None,
        );
        assert!(matches!(
            store.consume_owned_by("code-1", "user-2"),
            Err(ConsumeError::WrongUser)
        ));
        let offer = store.consume_owned_by("code-1", "user-1").ok().unwrap();
        assert_eq!(offer.desktop_device_id, "desktop-1");
    }

    #[test]
    fn sweep_removes_nothing_within_ttl() {
        let mut store = PairingStore::new();
        store.register("code-1".into(), "u".into(), "d".into(), "p".into(), None);
        store.sweep();
        assert_eq!(store.len(), 1);
    }
}
