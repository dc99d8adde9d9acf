//! Session registry: live connections grouped into per-user channels.
//!
//! Each user with at least one live connection owns a channel (a broadcast
//! sender) plus the set of connection handles subscribed to it. The
//! membership set is the single source of truth for reachability — there is
//! no separately maintained online map to fall out of sync with actual
//! connection state. All state is in-memory; on restart every user is
//! offline until they reconnect.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::config::CHANNEL_CAPACITY;
use crate::events::ServerEvent;

pub type ConnId = u64;

struct UserChannel {
    tx: broadcast::Sender<ServerEvent>,
    members: HashSet<ConnId>,
}

struct RegistryInner {
    channels: HashMap<String, UserChannel>,
    next_conn_id: ConnId,
}

/// Handle returned by [`SessionRegistry::join`].
pub struct Joined {
    pub conn_id: ConnId,
    pub rx: broadcast::Receiver<ServerEvent>,
    /// True when this connection took the user from unreachable to reachable.
    pub now_reachable: bool,
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                channels: HashMap::new(),
                next_conn_id: 0,
            })),
        }
    }

    /// Add a connection to `user_id`'s channel, allocating a fresh handle.
    pub fn join(&self, user_id: &str) -> Joined {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let conn_id = inner.next_conn_id;
        inner.next_conn_id += 1;

        let channel = inner
            .channels
            .entry(user_id.to_string())
            .or_insert_with(|| UserChannel {
                tx: broadcast::channel(CHANNEL_CAPACITY).0,
                members: HashSet::new(),
            });
        let now_reachable = channel.members.is_empty();
        channel.members.insert(conn_id);
        Joined {
            conn_id,
            rx: channel.tx.subscribe(),
            now_reachable,
        }
    }

    /// Remove a connection from `user_id`'s channel. Safe to call with an
    /// unknown user or handle. Returns true when the user's membership
    /// became empty, i.e. the user just became unreachable.
    pub fn leave(&self, user_id: &str, conn_id: ConnId) -> bool {
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        let Some(channel) = inner.channels.get_mut(user_id) else {
            return false;
        };
        if !channel.members.remove(&conn_id) {
            return false;
        }
        if channel.members.is_empty() {
            inner.channels.remove(user_id);
            true
        } else {
            false
        }
    }

    /// Whether `user_id` currently has at least one live connection.
    pub fn is_reachable(&self, user_id: &str) -> bool {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner
            .channels
            .get(user_id)
            .is_some_and(|channel| !channel.members.is_empty())
    }

    /// Emit an event to every live connection in `user_id`'s channel.
    /// A no-op when the user is unreachable; returns connections reached.
    pub fn emit_to_user(&self, user_id: &str, event: ServerEvent) -> usize {
        let inner = self.inner.lock().expect("registry lock poisoned");
        match inner.channels.get(user_id) {
            Some(channel) => channel.tx.send(event).unwrap_or(0),
            None => 0,
        }
    }

    /// Total live connections across all users.
    pub fn connection_count(&self) -> usize {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.channels.values().map(|c| c.members.len()).sum()
    }

    /// Users with at least one live connection.
    pub fn online_user_count(&self) -> usize {
        let inner = self.inner.lock().expect("registry lock poisoned");
        inner.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reachability_follows_membership() {
        let registry = SessionRegistry::new();
        assert!(!registry.is_reachable("alice"));

        let joined = registry.join("alice");
        assert!(joined.now_reachable);
        assert!(registry.is_reachable("alice"));

        assert!(registry.leave("alice", joined.conn_id));
        assert!(!registry.is_reachable("alice"));
    }

    #[test]
    fn multi_device_leave_is_not_a_transition() {
        let registry = SessionRegistry::new();
        let first = registry.join("alice");
        let second = registry.join("alice");
        assert!(first.now_reachable);
        assert!(!second.now_reachable);

        // One device dropping does not make the user unreachable
        assert!(!registry.leave("alice", first.conn_id));
        assert!(registry.is_reachable("alice"));

        // The last one does
        assert!(registry.leave("alice", second.conn_id));
        assert!(!registry.is_reachable("alice"));
    }

    #[test]
    fn leave_unknown_handle_is_noop() {
        let registry = SessionRegistry::new();
        assert!(!registry.leave("ghost", 99));

        let joined = registry.join("alice");
        assert!(!registry.leave("alice", joined.conn_id + 1));
        assert!(registry.is_reachable("alice"));
    }

    #[test]
    fn emit_reaches_every_connection() {
        let registry = SessionRegistry::new();
        let mut first = registry.join("alice");
        let mut second = registry.join("alice");

        let event = ServerEvent::UserTyping {
            user_id: "bob".to_string(),
            is_typing: true,
        };
        assert_eq!(registry.emit_to_user("alice", event), 2);
        assert!(first.rx.try_recv().is_ok());
        assert!(second.rx.try_recv().is_ok());
    }

    #[test]
    fn emit_to_unreachable_user_is_noop() {
        let registry = SessionRegistry::new();
        let event = ServerEvent::UserTyping {
            user_id: "bob".to_string(),
            is_typing: false,
        };
        assert_eq!(registry.emit_to_user("nobody", event), 0);
    }
}
