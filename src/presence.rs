//! Presence broadcasting on connect/disconnect.
//!
//! Presence is a function of reachability, not of individual connections:
//! the offline transition fires only when a user's last connection drops,
//! so a multi-device user closing one tab never flickers offline for their
//! friends. Durable presence writes are fire-and-forget; a storage failure
//! is logged and never blocks the connection.

use crate::events::{now_millis, ServerEvent};
use crate::registry::SessionRegistry;
use crate::state::SharedState;
use crate::{clog, logging};

/// Handle a new connection for `user_id`. The durable online flag is
/// refreshed on every connect; the friend fan-out fires only when this
/// connection made the user reachable.
pub async fn connected(
    state: &SharedState,
    registry: &SessionRegistry,
    user_id: &str,
    now_reachable: bool,
) {
    {
        let st = state.lock().await;
        if let Err(e) = st.storage.set_online(user_id, true, None) {
            clog!("presence: online write failed for {}: {e}", logging::user_id(user_id));
        }
    }
    if now_reachable {
        fan_out(state, registry, user_id, true).await;
    }
}

/// Handle a dropped connection for `user_id`. Both the durable offline
/// write and the friend fan-out are gated on the user actually becoming
/// unreachable; while other devices remain connected nothing changes.
pub async fn disconnected(
    state: &SharedState,
    registry: &SessionRegistry,
    user_id: &str,
    now_unreachable: bool,
) {
    if !now_unreachable {
        return;
    }
    {
        let st = state.lock().await;
        if let Err(e) = st.storage.set_online(user_id, false, Some(now_millis())) {
            clog!("presence: offline write failed for {}: {e}", logging::user_id(user_id));
        }
    }
    fan_out(state, registry, user_id, false).await;
}

/// Emit `friend_status_update` to every friend's channel. A no-op for
/// friends without live connections.
async fn fan_out(state: &SharedState, registry: &SessionRegistry, user_id: &str, is_online: bool) {
    let friends = {
        let st = state.lock().await;
        match st.storage.list_friends(user_id) {
            Ok(friends) => friends,
            Err(e) => {
                clog!(
                    "presence: friend list lookup failed for {}: {e}",
                    logging::user_id(user_id)
                );
                return;
            }
        }
    };

    let timestamp = now_millis();
    let mut reached = 0;
    for friend in &friends {
        reached += registry.emit_to_user(
            friend,
            ServerEvent::FriendStatusUpdate {
                friend_id: user_id.to_string(),
                is_online,
                timestamp,
            },
        );
    }
    clog!(
        "presence: {} is {} ({} friend connection(s) notified)",
        logging::user_id(user_id),
        if is_online { "online" } else { "offline" },
        reached
    );
}
