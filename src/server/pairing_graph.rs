//! In-memory record of which desktop/mobile device pairs belong together
//! under a user account. Rebuilt purely from observed `claim-pairing`
//! events; used only to decide whether a `relay`/`control-*` frame may be
//! forwarded, never as the source of truth for the E2EE key material
//! (that lives solely on the endpoints).

#[derive(Debug, Clone)]
struct Relation {
    user_id: String,
    desktop_id: String,
    mobile_id: String,
}

#[derive(Default)]
pub struct PairingGraph {
    relations: Vec<Relation>,
}

impl PairingGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Links `desktop_id` and `mobile_id` under `user_id`, replacing any
    /// existing relation between the same two device ids.
    pub fn link(&mut self, user_id: String, desktop_id: String, mobile_id: String) {
        self.relations
            .retain(|r| !(r.desktop_id == desktop_id && r.mobile_id == mobile_id));
        self.relations.push(Relation {
            user_id,
            desktop_id,
            mobile_id,
        });
    }

    /// Removes any relation involving both of these device ids, in either
    /// role assignment.
    pub fn unlink(&mut self, device_a: &str, device_b: &str) {
        self.relations.retain(|r| {
            let pair_matches = (r.desktop_id == device_a && r.mobile_id == device_b)
                || (r.desktop_id == device_b && r.mobile_id == device_a);
            !pair_matches
        });
    }

    pub fn are_linked(&self, a: &str, b: &str) -> bool {
        self.relations.iter().any(|r| {
            (r.desktop_id == a && r.mobile_id == b) || (r.desktop_id == b && r.mobile_id == a)
        })
    }

    /// All device ids paired with `device_id` under `user_id`.
    pub fn peers_of(&self, user_id: &str, device_id: &str) -> Vec<String> {
        self.relations
            .iter()
            .filter(|r| r.user_id == user_id)
            .filter_map(|r| {
                if r.desktop_id == device_id {
                    Some(r.mobile_id.clone())
                } else if r.mobile_id == device_id {
                    Some(r.desktop_id.clone())
                } else {
                    None
                }
            })
            .collect()
    }

    /// Every desktop device id ever paired under this user.
    pub fn desktops_for_user(&self, user_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .relations
            .iter()
            .filter(|r| r.user_id == user_id)
            .map(|r| r.desktop_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}
