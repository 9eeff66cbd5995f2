//! In-memory table of currently-attached device connections.
//!
//! At most one live connection may exist per `deviceId` at a time. Attaching
//! a second connection for the same id displaces (closes) the first. Each
//! attachment is tagged with a monotonic generation so a detach racing
//! against a displacement never removes the wrong entry.

use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::protocol::ServerFrame;

/// What a connection's writer task does with one queued item: forward a
/// frame, or close the socket (used to displace a superseded connection).
pub enum Outbound {
    Frame(ServerFrame),
    Close(String),
}

/// A connected device's outbound channel plus the bookkeeping needed to
/// forward `ServerFrame`s to it without interleaving writes.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub user_id: String,
    pub device_id: String,
    pub device_name: Option<String>,
    sender: mpsc::UnboundedSender<Outbound>,
    generation: u64,
}

impl ConnectionHandle {
    pub fn send(&self, frame: ServerFrame) {
        // The receiver only disappears once the connection's writer task has
        // exited, at which point there's nothing useful to do with the error.
        let _ = self.sender.send(Outbound::Frame(frame));
    }

    /// Tells this connection's writer task to send a WebSocket close frame
    /// carrying `reason` and then stop. Used to displace a connection whose
    /// device id has just been re-attached by a newer connection.
    pub fn close(&self, reason: impl Into<String>) {
        let _ = self.sender.send(Outbound::Close(reason.into()));
    }
}

struct Entry {
    handle: ConnectionHandle,
}

#[derive(Default)]
pub struct DeviceRegistry {
    entries: HashMap<String, Entry>,
    next_generation: u64,
}

/// Outcome of `attach`: whether a prior connection for the same device id
/// was displaced, and the handle that should be told to close.
pub struct AttachOutcome {
    pub handle: ConnectionHandle,
    pub displaced: Option<ConnectionHandle>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new connection for `device_id`, displacing any existing
    /// one. Returns the new handle (with its generation stamped in) and, if
    /// applicable, the handle that was displaced — the caller is responsible
    /// for closing it with a "replaced" reason.
    pub fn attach(
        &mut self,
        user_id: String,
        device_id: String,
        device_name: Option<String>,
        sender: mpsc::UnboundedSender<Outbound>,
    ) -> AttachOutcome {
        let generation = self.next_generation;
        self.next_generation += 1;

        let handle = ConnectionHandle {
            user_id,
            device_id: device_id.clone(),
            device_name,
            sender,
            generation,
        };

        let displaced = self
            .entries
            .insert(device_id, Entry { handle: handle.clone() })
            .map(|old| old.handle);

        AttachOutcome { handle, displaced }
    }

    /// Removes the entry for `device_id` only if it is still the connection
    /// identified by `generation` — guards against a detach for a connection
    /// that was already displaced and replaced by a newer one. Returns
    /// whether the device is now actually offline (i.e. the device id has no
    /// entry left), so the caller can tell a genuine disconnect from a
    /// no-op raced by displacement.
    pub fn detach(&mut self, device_id: &str, generation: u64) -> bool {
        if let Some(entry) = self.entries.get(device_id) {
            if entry.handle.generation == generation {
                self.entries.remove(device_id);
            }
        }
        !self.entries.contains_key(device_id)
    }

    pub fn get(&self, device_id: &str) -> Option<ConnectionHandle> {
        self.entries.get(device_id).map(|e| e.handle.clone())
    }

    pub fn is_online(&self, device_id: &str) -> bool {
        self.entries.contains_key(device_id)
    }

    pub fn connection_count(&self) -> usize {
        self.entries.len()
    }
}

impl ConnectionHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle_pair() -> (mpsc::UnboundedSender<Outbound>, mpsc::UnboundedReceiver<Outbound>) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn attach_then_get_returns_handle() {
        let mut registry = DeviceRegistry::new();
        let (tx, _rx) = handle_pair();
        let outcome = registry.attach("user-1".into(), "dev-1".into(), None, tx);
        assert!(outcome.displaced.is_none());
        assert!(registry.get("dev-1").is_some());
        assert!(registry.is_online("dev-1"));
    }

    #[test]
    fn second_attach_for_same_device_displaces_first() {
        let mut registry = DeviceRegistry::new();
        let (tx1, _rx1) = handle_pair();
        let (tx2, _rx2) = handle_pair();

        let first = registry.attach("user-1".into(), "dev-1".into(), None, tx1);
        let second = registry.attach("user-1".into(), "dev-1".into(), None, tx2);

        assert!(second.displaced.is_some());
        assert_eq!(second.displaced.unwrap().generation(), first.handle.generation());
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn detach_with_stale_generation_does_not_remove_newer_entry() {
        let mut registry = DeviceRegistry::new();
        let (tx1, _rx1) = handle_pair();
        let (tx2, _rx2) = handle_pair();

        let first = registry.attach("user-1".into(), "dev-1".into(), None, tx1);
        registry.attach("user-1".into(), "dev-1".into(), None, tx2);

        // The first connection's cleanup task races in after displacement —
        // it must not remove the second connection's entry, and must report
        // the device as still online.
        let now_offline = registry.detach("dev-1", first.handle.generation());
        assert!(!now_offline);
        assert!(registry.is_online("dev-1"));
    }

    #[test]
    fn detach_with_current_generation_removes_entry() {
        let mut registry = DeviceRegistry::new();
        let (tx, _rx) = handle_pair();
        let outcome = registry.attach("user-1".into(), "dev-1".into(), None, tx);
        let now_offline = registry.detach("dev-1", outcome.handle.generation());
        assert!(now_offline);
        assert!(!registry.is_online("dev-1"));
    }
}
