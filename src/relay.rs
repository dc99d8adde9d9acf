//! Message relay: the live-or-queued delivery decision.
//!
//! Every inbound send runs the same pipeline: validate, authorize against
//! the friendship relation, emit to the receiver's channel, re-check
//! reachability and queue to the offline mailbox if the receiver had no
//! live connection, then acknowledge the sender. The acknowledgment always
//! goes back to the originating connection — on failure it is a
//! `message_error` carrying the original message UUID so the client can
//! correlate.
//!
//! The emit and the reachability re-check are not atomic with respect to a
//! concurrent disconnect; a receiver dropping in that gap loses the live
//! copy without a queued one. Clients resend on timeout and deduplicate by
//! message UUID, so the combined live+queued path is at-least-once.

use crate::events::{now_millis, ServerEvent};
use crate::registry::SessionRegistry;
use crate::state::SharedState;
use crate::storage::QueuedMessageRow;
use crate::{clog, logging};

/// Process `send_message` from `sender_id`. Returns the events to write
/// back to the originating connection.
pub async fn handle_send(
    state: &SharedState,
    registry: &SessionRegistry,
    sender_id: &str,
    receiver_id: &str,
    message_uuid: &str,
    message: &str,
    message_type: &str,
    client_timestamp: Option<u64>,
) -> Vec<ServerEvent> {
    let correlate = |error: &str| {
        vec![ServerEvent::MessageError {
            error: error.to_string(),
            message_uuid: message_uuid.to_string(),
        }]
    };

    if receiver_id.is_empty() {
        return correlate("missing required field: receiverId");
    }
    if message_uuid.is_empty() {
        return correlate("missing required field: messageUuid");
    }
    if message.is_empty() {
        return correlate("missing required field: message");
    }

    let friends = {
        let st = state.lock().await;
        match st.storage.are_friends(sender_id, receiver_id) {
            Ok(friends) => friends,
            Err(e) => {
                clog!("relay: friendship lookup failed for {}: {e}", logging::user_id(sender_id));
                return correlate("internal error");
            }
        }
    };
    if !friends {
        clog!(
            "relay: rejected {} -> {} (not friends)",
            logging::user_id(sender_id),
            logging::user_id(receiver_id)
        );
        return correlate("receiver is not a friend");
    }

    let timestamp = client_timestamp.unwrap_or_else(now_millis);
    let payload = ServerEvent::NewMessage {
        message_uuid: message_uuid.to_string(),
        sender_id: sender_id.to_string(),
        receiver_id: receiver_id.to_string(),
        message: message.to_string(),
        message_type: message_type.to_string(),
        timestamp,
        status: "sent".to_string(),
    };

    // Emit unconditionally; a no-op when the channel is empty. The explicit
    // reachability re-check below is what decides queuing, since channel
    // emission has no failure signal for an empty channel.
    registry.emit_to_user(receiver_id, payload);

    if registry.is_reachable(receiver_id) {
        clog!(
            "relay: delivered {} {} -> {}",
            logging::msg_id(message_uuid),
            logging::user_id(sender_id),
            logging::user_id(receiver_id)
        );
    } else {
        let row = QueuedMessageRow {
            message_uuid: message_uuid.to_string(),
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            body: message.to_string(),
            message_type: message_type.to_string(),
            client_timestamp: timestamp,
            created_at: now_millis(),
        };
        let stored = {
            let st = state.lock().await;
            st.storage.queue_message(&row)
        };
        if let Err(e) = stored {
            // Losing a queued message silently would break the offline
            // guarantee, so this failure goes back to the sender.
            clog!(
                "relay: mailbox store failed for {}: {e}",
                logging::msg_id(message_uuid)
            );
            return correlate("failed to queue message for offline delivery");
        }
        clog!(
            "relay: queued {} {} -> {} (offline)",
            logging::msg_id(message_uuid),
            logging::user_id(sender_id),
            logging::user_id(receiver_id)
        );
    }

    vec![ServerEvent::MessageSent {
        message_uuid: message_uuid.to_string(),
        status: "sent".to_string(),
        timestamp: now_millis(),
    }]
}

/// Forward a delivered/read status change to the original sender's channel.
/// Ephemeral: dropped when the sender is unreachable.
pub fn handle_status_update(
    registry: &SessionRegistry,
    updated_by: &str,
    message_uuid: &str,
    status: &str,
    original_sender: &str,
) {
    let reached = registry.emit_to_user(
        original_sender,
        ServerEvent::MessageStatusUpdate {
            message_uuid: message_uuid.to_string(),
            status: status.to_string(),
            updated_by: updated_by.to_string(),
        },
    );
    if reached == 0 {
        clog!(
            "relay: status update {} dropped, {} unreachable",
            logging::msg_id(message_uuid),
            logging::user_id(original_sender)
        );
    }
}

/// Drain `user_id`'s offline mailbox into their channel, oldest first, then
/// delete the drained rows. Runs on every connect, after the connection has
/// joined the registry. Delete failures are logged, not fatal: a redelivery
/// on the next connect is suppressed client-side by message UUID.
pub async fn deliver_queued(state: &SharedState, registry: &SessionRegistry, user_id: &str) {
    let st = state.lock().await;
    let queued = match st.storage.drain_queued(user_id) {
        Ok(queued) => queued,
        Err(e) => {
            clog!("mailbox: drain failed for {}: {e}", logging::user_id(user_id));
            return;
        }
    };
    if queued.is_empty() {
        return;
    }

    let mut delivered = Vec::with_capacity(queued.len());
    for row in queued {
        registry.emit_to_user(
            user_id,
            ServerEvent::NewMessage {
                message_uuid: row.message_uuid.clone(),
                sender_id: row.sender_id,
                receiver_id: row.receiver_id,
                message: row.body,
                message_type: row.message_type,
                timestamp: row.client_timestamp,
                status: "delivered".to_string(),
            },
        );
        delivered.push(row.message_uuid);
    }

    match st.storage.delete_queued(&delivered) {
        Ok(n) => clog!(
            "mailbox: delivered {n} queued message(s) to {}",
            logging::user_id(user_id)
        ),
        Err(e) => clog!(
            "mailbox: delete after drain failed for {}: {e}",
            logging::user_id(user_id)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionRegistry;
    use crate::state::shared;
    use crate::storage::Storage;

    #[tokio::test]
    async fn mailbox_store_failure_is_surfaced_to_sender() {
        let storage = Storage::open_in_memory().unwrap();
        storage.add_friendship("alice", "bob", 1000).unwrap();
        storage.drop_mailbox_table().unwrap();
        let state = shared(storage);
        let registry = SessionRegistry::new();

        // bob has no live connection, so the send must hit the mailbox; with
        // the mailbox broken the sender gets a correlated error, not an ack
        let replies =
            handle_send(&state, &registry, "alice", "bob", "m1", "hi", "text", None).await;
        match replies.as_slice() {
            [ServerEvent::MessageError {
                error,
                message_uuid,
            }] => {
                assert_eq!(message_uuid, "m1");
                assert_eq!(error, "failed to queue message for offline delivery");
            }
            other => panic!("expected message_error, got {other:?}"),
        }
    }
}
