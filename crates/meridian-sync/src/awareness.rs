//! Presence of the connections in a sync session.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use meridian_shared::{PeerPresence, UserIdentity};
use tokio::sync::watch;
use tracing::debug;

pub struct AwarenessTracker {
    state: Mutex<State>,
    peers: watch::Sender<Vec<PeerPresence>>,
}

#[derive(Default)]
struct State {
    local_connection: Option<String>,
    local_identity: Option<UserIdentity>,
    remote: BTreeMap<String, UserIdentity>,
}

impl Default for AwarenessTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AwarenessTracker {
    pub fn new() -> Self {
        let (peers, _) = watch::channel(Vec::new());
        Self {
            state: Mutex::new(State::default()),
            peers,
        }
    }

    /// Fires with the full list on every change.
    pub fn subscribe(&self) -> watch::Receiver<Vec<PeerPresence>> {
        self.peers.subscribe()
    }

    pub fn local_identity(&self) -> Option<UserIdentity> {
        self.state().local_identity.clone()
    }

    pub fn local_connection(&self) -> Option<String> {
        self.state().local_connection.clone()
    }

    /// The transport connection currently representing this user. Changes on
    /// every reconnect.
    pub fn set_local_connection(&self, connection_id: Option<String>) {
        self.update(|state| state.local_connection = connection_id);
    }

    pub fn set_local_identity(&self, identity: UserIdentity) {
        self.update(|state| state.local_identity = Some(identity));
    }

    /// Presence announced by a remote connection; `None` means it left.
    pub fn apply_remote(&self, connection_id: &str, identity: Option<UserIdentity>) {
        self.update(|state| match identity {
            Some(identity) => {
                state.remote.insert(connection_id.to_string(), identity);
            }
            None => {
                state.remote.remove(connection_id);
            }
        });
    }

    pub fn remove_peer(&self, connection_id: &str) {
        self.apply_remote(connection_id, None);
    }

    /// Replace the whole remote set, for services that report it at once.
    pub fn replace_remote(&self, others: impl IntoIterator<Item = (String, UserIdentity)>) {
        let remote = others.into_iter().collect();
        self.update(|state| state.remote = remote);
    }

    pub fn clear_remote(&self) {
        self.update(|state| state.remote.clear());
    }

    /// Self first, then the others, one entry per connection id.
    pub fn peers(&self) -> Vec<PeerPresence> {
        compute(&self.state())
    }

    fn update(&self, f: impl FnOnce(&mut State)) {
        let peers = {
            let mut state = self.state();
            f(&mut state);
            compute(&state)
        };
        let changed = self.peers.send_if_modified(|current| {
            if *current == peers {
                return false;
            }
            *current = peers;
            true
        });
        if changed {
            debug!(peers = self.peers.borrow().len(), "awareness changed");
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn compute(state: &State) -> Vec<PeerPresence> {
    let local = state.local_connection.as_deref();
    let mut seen = HashSet::new();
    let mut peers = Vec::new();

    if let (Some(connection_id), Some(identity)) = (local, &state.local_identity) {
        seen.insert(connection_id.to_string());
        peers.push(PeerPresence {
            identity: identity.clone(),
            connection_id: connection_id.to_string(),
            is_current_user: true,
        });
    }

    for (connection_id, identity) in &state.remote {
        if !seen.insert(connection_id.clone()) {
            continue;
        }
        peers.push(PeerPresence {
            identity: identity.clone(),
            connection_id: connection_id.clone(),
            is_current_user: Some(connection_id.as_str()) == local,
        });
    }

    peers
}
