//! Ephemeral signal routing: typing indicators and friend-request notices.
//!
//! Nothing here is persisted or queued. A signal whose target has no live
//! connection is simply lost; that is the intended semantics for transient
//! notifications.

use crate::events::{now_millis, ServerEvent};
use crate::registry::SessionRegistry;
use crate::state::SharedState;
use crate::{clog, logging};

/// Relay a typing start/stop indicator. Friendship-gated: a non-friend
/// target never sees the indicator (dropped silently, logged).
pub async fn typing(
    state: &SharedState,
    registry: &SessionRegistry,
    from: &str,
    receiver_id: &str,
    is_typing: bool,
) {
    if receiver_id.is_empty() {
        return;
    }
    let friends = {
        let st = state.lock().await;
        st.storage.are_friends(from, receiver_id).unwrap_or(false)
    };
    if !friends {
        clog!(
            "signal: typing from {} to non-friend {} dropped",
            logging::user_id(from),
            logging::user_id(receiver_id)
        );
        return;
    }
    registry.emit_to_user(
        receiver_id,
        ServerEvent::UserTyping {
            user_id: from.to_string(),
            is_typing,
        },
    );
}

/// Relay a friend-request notice. No friendship precondition — the
/// relationship does not exist yet.
pub fn friend_request(registry: &SessionRegistry, from: &str, receiver_id: &str, request_id: &str) {
    if receiver_id.is_empty() {
        return;
    }
    let reached = registry.emit_to_user(
        receiver_id,
        ServerEvent::FriendRequestReceived {
            request_id: request_id.to_string(),
            sender_id: from.to_string(),
            timestamp: now_millis(),
        },
    );
    clog!(
        "signal: friend request {} -> {} ({} connection(s))",
        logging::user_id(from),
        logging::user_id(receiver_id),
        reached
    );
}
