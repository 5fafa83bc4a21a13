//! Per-message handling for client text frames.

use loopwatch_core::{ClientMessage, ServerMessage};
use tokio::time::Instant;

use crate::registry::{ConnectionId, ConnectionRegistry};

/// Apply one client text frame to the registry and produce the reply.
///
/// Malformed input yields a single `error` reply and leaves the registry
/// untouched. Every frame gets exactly one reply.
pub fn handle_text(
    registry: &ConnectionRegistry,
    id: ConnectionId,
    text: &str,
    now: Instant,
) -> ServerMessage {
    let msg = match ClientMessage::parse(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(conn_id = %id, error = %e, "ws: malformed client message");
            return e.into();
        }
    };

    match msg {
        ClientMessage::Subscribe { project_ids } => match registry.subscribe(id, &project_ids) {
            Some(all) => {
                tracing::debug!(conn_id = %id, projects = ?all, "ws: subscribed");
                ServerMessage::Subscribed { project_ids: all }
            }
            None => ServerMessage::error("connection is closed"),
        },
        ClientMessage::Unsubscribe { project_ids } => match registry.unsubscribe(id, &project_ids) {
            Some(removed) => {
                tracing::debug!(conn_id = %id, projects = ?removed, "ws: unsubscribed");
                ServerMessage::Unsubscribed { project_ids: removed }
            }
            None => ServerMessage::error("connection is closed"),
        },
        ClientMessage::Ping => {
            registry.mark_alive(id, now);
            ServerMessage::Pong
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionHandle;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn setup() -> (ConnectionRegistry, ConnectionId, mpsc::Receiver<crate::registry::Outbound>) {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = mpsc::channel(8);
        let id = registry.connect(ConnectionHandle::new(tx, CancellationToken::new()), Instant::now());
        (registry, id, rx)
    }

    fn strings(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn subscribe_replies_with_full_list() {
        let (registry, id, _rx) = setup();
        handle_text(&registry, id, r#"{"type":"subscribe","projectIds":["b"]}"#, Instant::now());
        let reply = handle_text(&registry, id, r#"{"type":"subscribe","projectIds":["a"]}"#, Instant::now());
        assert_eq!(
            reply,
            ServerMessage::Subscribed {
                project_ids: strings(&["a", "b"])
            }
        );
    }

    #[test]
    fn unsubscribe_echoes_request() {
        let (registry, id, _rx) = setup();
        handle_text(&registry, id, r#"{"type":"subscribe","projectIds":["a","b"]}"#, Instant::now());
        let reply = handle_text(&registry, id, r#"{"type":"unsubscribe","projectIds":["a","zzz"]}"#, Instant::now());
        assert_eq!(
            reply,
            ServerMessage::Unsubscribed {
                project_ids: strings(&["a", "zzz"])
            }
        );
        assert_eq!(registry.subscriptions(id), Some(strings(&["b"])));
    }

    #[test]
    fn malformed_subscribe_leaves_state_untouched() {
        let (registry, id, _rx) = setup();
        handle_text(&registry, id, r#"{"type":"subscribe","projectIds":["keep"]}"#, Instant::now());

        let reply = handle_text(&registry, id, r#"{"type":"subscribe","projectIds":"oops"}"#, Instant::now());
        assert!(matches!(reply, ServerMessage::Error { .. }), "{reply:?}");
        assert_eq!(registry.subscriptions(id), Some(strings(&["keep"])));
    }

    #[test]
    fn bad_json_and_unknown_type_get_error_replies() {
        let (registry, id, _rx) = setup();
        for text in ["{nope", r#"{"type":"teleport"}"#, r#"[1,2]"#] {
            let reply = handle_text(&registry, id, text, Instant::now());
            assert!(matches!(reply, ServerMessage::Error { .. }), "{text} -> {reply:?}");
        }
        assert!(registry.contains(id));
    }

    #[test]
    fn ping_refreshes_liveness() {
        let (registry, id, _rx) = setup();
        let t0 = Instant::now();
        registry.sweep(t0, std::time::Duration::from_secs(30));
        assert_eq!(registry.is_alive(id), Some(false));

        let reply = handle_text(&registry, id, r#"{"type":"ping"}"#, t0);
        assert_eq!(reply, ServerMessage::Pong);
        assert_eq!(registry.is_alive(id), Some(true));
    }

    #[test]
    fn messages_after_disconnect_get_error() {
        let (registry, id, _rx) = setup();
        registry.disconnect(id);
        let reply = handle_text(&registry, id, r#"{"type":"subscribe","projectIds":["a"]}"#, Instant::now());
        assert_eq!(reply, ServerMessage::error("connection is closed"));
    }
}
