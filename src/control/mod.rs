//! Desktop-local remote-control state machine: local / remote / unlocking,
//! guarded by an E2EE session with the controller and an optional grace
//! delay before the lock actually takes effect.

use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlState {
    Local,
    Remote { peer_device_id: String, peer_name: Option<String> },
    Unlocking { peer_device_id: String, peer_name: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    /// Send `control-ack { accepted: true }` to the requester.
    AcceptRequest,
    /// Send `control-ack { accepted: false }` to the requester.
    RejectRequest,
    /// Send `control-revoked` to the current controller and return to local.
    RevokeToLocal,
    /// No state change and no wire action (e.g. a wrong unlock guess).
    None,
}

pub struct ControlPolicy {
    pub allow_remote_control: bool,
    pub unlock_secret: String,
    pub auto_lock_timeout_ms: u64,
}

/// Owns the current state. All transitions run on the desktop's single
/// event loop, so a `Mutex` here is about interior mutability convenience,
/// not cross-task contention.
pub struct RemoteControlFsm {
    state: Mutex<ControlState>,
    policy: ControlPolicy,
    /// Peer whose accepted `control-request` is waiting out `auto_lock_timeout_ms`
    /// before actually entering `Remote`. Cleared by `force_local` so a peer that
    /// goes offline during the grace window never locks the desktop on a timer
    /// that fires after the fact.
    pending_grace: Mutex<Option<String>>,
}

impl RemoteControlFsm {
    pub fn new(policy: ControlPolicy) -> Self {
        Self {
            state: Mutex::new(ControlState::Local),
            policy,
            pending_grace: Mutex::new(None),
        }
    }

    pub async fn is_locked(&self) -> bool {
        !matches!(*self.state.lock().await, ControlState::Local)
    }

    pub async fn current(&self) -> ControlState {
        self.state.lock().await.clone()
    }

    /// A `control-request` arrived from `peer_device_id`. Returns the wire
    /// action the caller should take; if accepted and there is no grace
    /// delay, the state has already flipped to `Remote` by the time this
    /// returns. With a nonzero `auto_lock_timeout_ms`, the caller is
    /// expected to call `enter_remote_after_grace` once the timer elapses.
    pub async fn on_control_request(
        &self,
        peer_device_id: String,
        peer_name: Option<String>,
        has_session_with_peer: bool,
    ) -> ControlAction {
        let mut state = self.state.lock().await;
        if !matches!(*state, ControlState::Local) || !self.policy.allow_remote_control || !has_session_with_peer {
            return ControlAction::RejectRequest;
        }

        if self.policy.auto_lock_timeout_ms == 0 {
            *state = ControlState::Remote {
                peer_device_id: peer_device_id.clone(),
                peer_name,
            };
            info!(peer = %peer_device_id, "control: entered remote state");
        } else {
            // The caller schedules `enter_remote_after_grace` separately;
            // the ack is sent immediately either way.
            *self.pending_grace.lock().await = Some(peer_device_id);
        }
        ControlAction::AcceptRequest
    }

    /// Called by the caller after the configured grace delay has elapsed,
    /// only when `on_control_request` returned `AcceptRequest` with a
    /// nonzero timeout. A no-op if `force_local` cancelled the grace period
    /// for this peer in the meantime (peer went offline, pair revoked, etc).
    pub async fn enter_remote_after_grace(&self, peer_device_id: String, peer_name: Option<String>) {
        let mut pending = self.pending_grace.lock().await;
        if pending.as_deref() != Some(peer_device_id.as_str()) {
            return;
        }
        *pending = None;
        drop(pending);

        let mut state = self.state.lock().await;
        if matches!(*state, ControlState::Local) {
            *state = ControlState::Remote { peer_device_id, peer_name };
        }
    }

    pub fn grace_delay(&self) -> Duration {
        Duration::from_millis(self.policy.auto_lock_timeout_ms)
    }

    /// The local user entered `secret` to try to regain control.
    pub async fn try_unlock(&self, secret: &str) -> ControlAction {
        let mut state = self.state.lock().await;
        let (peer_device_id, peer_name) = match &*state {
            ControlState::Remote { peer_device_id, peer_name } => (peer_device_id.clone(), peer_name.clone()),
            ControlState::Unlocking { peer_device_id, peer_name } => (peer_device_id.clone(), peer_name.clone()),
            ControlState::Local => return ControlAction::None,
        };

        if secret == self.policy.unlock_secret {
            *state = ControlState::Local;
            info!(peer = %peer_device_id, "control: unlocked back to local");
            ControlAction::RevokeToLocal
        } else {
            *state = ControlState::Unlocking { peer_device_id, peer_name };
            ControlAction::None
        }
    }

    /// The controlling peer went offline, the pair was revoked, or the
    /// relay connection dropped — force back to local regardless of state.
    pub async fn force_local(&self, peer_device_id: &str) {
        let mut pending = self.pending_grace.lock().await;
        if pending.as_deref() == Some(peer_device_id) {
            *pending = None;
        }
        drop(pending);

        let mut state = self.state.lock().await;
        let matches_peer = match &*state {
            ControlState::Remote { peer_device_id: p, .. } | ControlState::Unlocking { peer_device_id: p, .. } => {
                p == peer_device_id
            }
            ControlState::Local => false,
        };
        if matches_peer {
            *state = ControlState::Local;
            info!(peer = %peer_device_id, "control: forced back to local");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(allow: bool, secret: &str, timeout_ms: u64) -> ControlPolicy {
        ControlPolicy {
            allow_remote_control: allow,
            unlock_secret: secret.to_string(),
            auto_lock_timeout_ms: timeout_ms,
        }
    }

    #[tokio::test]
    async fn control_request_accepted_immediately_without_grace() {
        let fsm = RemoteControlFsm::new(policy(true, "666666", 0));
        let action = fsm.on_control_request("mobile-1".into(), None, true).await;
        assert_eq!(action, ControlAction::AcceptRequest);
        assert!(fsm.is_locked().await);
    }

    #[tokio::test]
    async fn control_request_rejected_when_policy_disallows() {
        let fsm = RemoteControlFsm::new(policy(false, "666666", 0));
        let action = fsm.on_control_request("mobile-1".into(), None, true).await;
        assert_eq!(action, ControlAction::RejectRequest);
        assert!(!fsm.is_locked().await);
    }

    #[tokio::test]
    async fn control_request_rejected_without_session() {
        let fsm = RemoteControlFsm::new(policy(true, "666666", 0));
        let action = fsm.on_control_request("mobile-1".into(), None, false).await;
        assert_eq!(action, ControlAction::RejectRequest);
    }

    #[tokio::test]
    async fn second_control_request_while_remote_is_rejected() {
        let fsm = RemoteControlFsm::new(policy(true, "666666", 0));
        fsm.on_control_request("mobile-1".into(), None, true).await;
        let second = fsm.on_control_request("mobile-2".into(), None, true).await;
        assert_eq!(second, ControlAction::RejectRequest);
    }

    #[tokio::test]
    async fn correct_unlock_secret_returns_to_local_and_revokes() {
        let fsm = RemoteControlFsm::new(policy(true, "666666", 0));
        fsm.on_control_request("mobile-1".into(), None, true).await;
        let action = fsm.try_unlock("666666").await;
        assert_eq!(action, ControlAction::RevokeToLocal);
        assert!(!fsm.is_locked().await);
    }

    #[tokio::test]
    async fn wrong_unlock_secret_enters_unlocking_without_revoking() {
        let fsm = RemoteControlFsm::new(policy(true, "666666", 0));
        fsm.on_control_request("mobile-1".into(), None, true).await;
        let action = fsm.try_unlock("000000").await;
        assert_eq!(action, ControlAction::None);
        assert!(matches!(fsm.current().await, ControlState::Unlocking { .. }));
        assert!(fsm.is_locked().await);
    }

    #[tokio::test]
    async fn force_local_only_applies_if_peer_matches() {
        let fsm = RemoteControlFsm::new(policy(true, "666666", 0));
        fsm.on_control_request("mobile-1".into(), None, true).await;
        fsm.force_local("mobile-2").await;
        assert!(fsm.is_locked().await);
        fsm.force_local("mobile-1").await;
        assert!(!fsm.is_locked().await);
    }

    #[tokio::test]
    async fn grace_delay_defers_entering_remote() {
        let fsm = RemoteControlFsm::new(policy(true, "666666", 500));
        let action = fsm.on_control_request("mobile-1".into(), None, true).await;
        assert_eq!(action, ControlAction::AcceptRequest);
        // Not yet entered remote — caller hasn't invoked enter_remote_after_grace.
        assert!(!fsm.is_locked().await);
        fsm.enter_remote_after_grace("mobile-1".into(), None).await;
        assert!(fsm.is_locked().await);
    }

    #[tokio::test]
    async fn force_local_during_grace_window_cancels_the_pending_lock() {
        let fsm = RemoteControlFsm::new(policy(true, "666666", 500));
        fsm.on_control_request("mobile-1".into(), None, true).await;
        // The peer drops before the grace timer fires (e.g. it went offline).
        fsm.force_local("mobile-1").await;
        // The timer still fires later, but the grace window was cancelled.
        fsm.enter_remote_after_grace("mobile-1".into(), None).await;
        assert!(!fsm.is_locked().await);
    }
}
