use super::*;
use crate::auth::StaticToken;
use crate::test_helpers::{MockTransport, message, message_json};
use futures_util::StreamExt;
use serde_json::json;
use std::sync::atomic::AtomicUsize;
use tokio::time::{Duration, timeout};

struct NoToken;

impl TokenProvider for NoToken {
    fn bearer_token(&self) -> Option<String> {
        None
    }
}

fn session_with(mock: &Arc<MockTransport>) -> SocketSession {
    SocketSession::new(mock.clone(), Arc::new(StaticToken::new("stored-token")))
}

async fn connected(mock: &Arc<MockTransport>) -> SocketSession {
    let session = session_with(mock);
    session.connect(None).await.expect("connect");
    session
}

fn counter() -> (Arc<AtomicUsize>, impl Fn(Message) + Send + Sync + 'static) {
    let hits = Arc::new(AtomicUsize::new(0));
    let cb = {
        let hits = Arc::clone(&hits);
        move |_: Message| {
            hits.fetch_add(1, Ordering::SeqCst);
        }
    };
    (hits, cb)
}

async fn wait_for_status(rx: &mut watch::Receiver<ConnectionStatus>, want: ConnectionStatus) {
    timeout(Duration::from_millis(500), rx.wait_for(|s| *s == want))
        .await
        .expect("status change timed out")
        .expect("status sender dropped");
}

// =============================================================================
// CONNECT / DISCONNECT
// =============================================================================

#[tokio::test]
async fn connect_pulls_token_from_provider_and_subscribes_presence() {
    let mock = MockTransport::new();
    let session = session_with(&mock);
    assert_eq!(session.status(), ConnectionStatus::Disconnected);

    session.connect(None).await.expect("connect");

    assert_eq!(mock.activations(), vec!["stored-token".to_owned()]);
    assert_eq!(session.status(), ConnectionStatus::Connected);
    assert_eq!(session.subscriptions(), vec!["/user/queue/presence".to_owned()]);
}

#[tokio::test]
async fn connect_prefers_explicit_token() {
    let mock = MockTransport::new();
    let session = session_with(&mock);
    session.connect(Some("fresh")).await.expect("connect");
    assert_eq!(mock.activations(), vec!["fresh".to_owned()]);
}

#[tokio::test]
async fn connect_without_any_token_fails() {
    let mock = MockTransport::new();
    let session = SocketSession::new(mock.clone(), Arc::new(NoToken));

    let err = session.connect(None).await.unwrap_err();
    assert!(matches!(err, SessionError::MissingToken));
    assert!(mock.activations().is_empty());
    assert_eq!(session.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn connect_when_connected_is_noop() {
    let mock = MockTransport::new();
    let session = connected(&mock).await;
    session.connect(None).await.expect("second connect");
    assert_eq!(mock.activations().len(), 1);
    assert_eq!(mock.live_subscriptions("/user/queue/presence"), 1);
}

#[tokio::test]
async fn handshake_failure_is_surfaced_to_caller() {
    let mock = MockTransport::new();
    mock.fail_handshake("invalid token");
    let session = session_with(&mock);

    let err = session.connect(None).await.unwrap_err();
    match err {
        SessionError::Transport(TransportError::Handshake { message }) => assert_eq!(message, "invalid token"),
        other => panic!("expected handshake error, got {other:?}"),
    }
    assert_eq!(session.status(), ConnectionStatus::Disconnected);
    assert!(session.subscriptions().is_empty());

    // A manual retry can succeed.
    session.connect(None).await.expect("retry");
    assert_eq!(session.status(), ConnectionStatus::Connected);
}

#[tokio::test]
async fn link_changes_are_mirrored_into_status() {
    let mock = MockTransport::new();
    let session = connected(&mock).await;
    let mut status = session.watch_status();

    mock.set_link(LinkState::Down);
    wait_for_status(&mut status, ConnectionStatus::Disconnected).await;

    mock.set_link(LinkState::Connecting);
    wait_for_status(&mut status, ConnectionStatus::Connecting).await;

    mock.set_link(LinkState::Up);
    wait_for_status(&mut status, ConnectionStatus::Connected).await;
}

#[tokio::test]
async fn disconnect_releases_everything_and_silences_late_frames() {
    let mock = MockTransport::new();
    let session = connected(&mock).await;
    let (hits, cb) = counter();
    session.subscribe_with(&Destination::ConversationMessages("c1".into()), cb);
    let mut typing = session.subscribe_to_conversation_typing("c1");
    assert_eq!(session.subscriptions().len(), 3);

    session.disconnect().await;

    assert!(session.subscriptions().is_empty());
    assert_eq!(mock.live_total(), 0);
    assert_eq!(mock.deactivations(), 1);
    assert_eq!(session.status(), ConnectionStatus::Disconnected);

    let body = message_json(&message("m1", "c1", "2024-01-01T00:00:00Z")).to_string();
    assert!(mock.deliver_stale("/topic/conversation/c1", &body) > 0);
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    let ended = timeout(Duration::from_millis(200), typing.recv()).await.expect("stream should end");
    assert!(ended.is_none());
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let mock = MockTransport::new();
    let session = session_with(&mock);
    session.disconnect().await;
    session.disconnect().await;
    assert_eq!(session.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn reconnect_after_disconnect_resubscribes_presence() {
    let mock = MockTransport::new();
    let session = connected(&mock).await;
    session.disconnect().await;
    session.connect(None).await.expect("reconnect");
    assert_eq!(session.subscriptions(), vec!["/user/queue/presence".to_owned()]);
    assert_eq!(mock.live_subscriptions("/user/queue/presence"), 1);
}

#[tokio::test]
async fn connect_while_transport_retries_waits_for_link_and_keeps_one_presence_listener() {
    let mock = MockTransport::new();
    let session = connected(&mock).await;
    let mut status = session.watch_status();
    mock.set_link(LinkState::Down);
    wait_for_status(&mut status, ConnectionStatus::Disconnected).await;

    mock.keep_retrying();
    let retry = tokio::spawn({
        let session = session.clone();
        async move { session.connect(None).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!retry.is_finished(), "connect resolved before the link came back");
    assert_ne!(session.status(), ConnectionStatus::Connected);

    mock.set_link(LinkState::Up);
    timeout(Duration::from_millis(500), retry)
        .await
        .expect("connect timed out")
        .expect("connect task panicked")
        .expect("connect");
    assert_eq!(session.status(), ConnectionStatus::Connected);
    assert_eq!(mock.live_subscriptions("/user/queue/presence"), 1);

    let mut presence = session.presence_events();
    mock.deliver_json("/user/queue/presence", &json!({"username": "alice", "online": true}));
    timeout(Duration::from_millis(200), presence.recv())
        .await
        .expect("presence timed out")
        .expect("presence open");
    assert!(presence.try_recv().is_err(), "one frame produced more than one event");
}

// =============================================================================
// SUBSCRIPTIONS
// =============================================================================

#[tokio::test]
async fn repeated_subscribe_shares_one_transport_subscription() {
    let mock = MockTransport::new();
    let session = connected(&mock).await;
    let dest = Destination::ConversationMessages("c1".into());
    let (first_hits, first_cb) = counter();
    let (second_hits, second_cb) = counter();

    let first = session.subscribe_with(&dest, first_cb);
    let second = session.subscribe_with(&dest, second_cb);

    assert_eq!(first, second);
    assert_eq!(mock.live_subscriptions("/topic/conversation/c1"), 1);

    let body = message_json(&message("m1", "c1", "2024-01-01T00:00:00Z")).to_string();
    assert_eq!(mock.deliver("/topic/conversation/c1", &body), 1);
    assert_eq!(first_hits.load(Ordering::SeqCst), 1);
    assert_eq!(second_hits.load(Ordering::SeqCst), 1);

    // One release tears the destination down for every caller.
    first.unsubscribe();
    assert_eq!(mock.live_subscriptions("/topic/conversation/c1"), 0);
    assert!(!session.subscriptions().contains(&"/topic/conversation/c1".to_owned()));

    mock.deliver_stale("/topic/conversation/c1", &body);
    assert_eq!(first_hits.load(Ordering::SeqCst), 1);
    assert_eq!(second_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stale_handle_does_not_release_newer_subscription() {
    let mock = MockTransport::new();
    let session = connected(&mock).await;
    let dest = Destination::ConversationTyping("c1".into());

    let old = session.subscribe_with(&dest, |_: TypingEvent| {});
    old.unsubscribe();
    let new = session.subscribe_with(&dest, |_: TypingEvent| {});
    assert_ne!(old, new);

    old.unsubscribe();
    assert_eq!(mock.live_subscriptions("/topic/conversation/c1/typing"), 1);

    new.unsubscribe();
    assert_eq!(mock.live_subscriptions("/topic/conversation/c1/typing"), 0);
}

#[tokio::test]
async fn unsubscribe_by_destination_releases_entry() {
    let mock = MockTransport::new();
    let session = connected(&mock).await;
    let dest = Destination::ConversationRead("c1".into());
    let _sub = session.subscribe_to_conversation_read("c1");

    session.unsubscribe(&dest);
    assert_eq!(mock.live_subscriptions("/topic/conversation/c1/read"), 0);
    // Unknown destinations are ignored.
    session.unsubscribe(&dest);
}

#[tokio::test]
async fn malformed_frame_is_dropped_and_delivery_continues() {
    let mock = MockTransport::new();
    let session = connected(&mock).await;
    let mut messages = session.subscribe_to_conversation_messages("c1");

    mock.deliver("/topic/conversation/c1", "not json");
    mock.deliver_json("/topic/conversation/c1", &json!({"id": "m1"}));
    let good = message("m2", "c1", "2024-01-01T00:00:00Z");
    mock.deliver_json("/topic/conversation/c1", &message_json(&good));

    let received = timeout(Duration::from_millis(200), messages.next())
        .await
        .expect("delivery timed out")
        .expect("stream open");
    assert_eq!(received, good);
}

#[tokio::test]
async fn history_queue_parses_tagged_payload() {
    let mock = MockTransport::new();
    let session = connected(&mock).await;
    let mut history = session.subscribe_to_user_messages();

    mock.deliver_json("/user/queue/conversation-history", &json!({"type": "OTHER"}));
    mock.deliver_json(
        "/user/queue/conversation-history",
        &json!({"type": "HISTORY", "conversationId": "c1", "messages": []}),
    );

    let UserQueueEvent::History(reply) = timeout(Duration::from_millis(200), history.recv())
        .await
        .expect("delivery timed out")
        .expect("stream open");
    assert_eq!(reply.conversation_id, "c1");
}

#[tokio::test]
async fn presence_frames_reach_broadcast_receivers() {
    let mock = MockTransport::new();
    let session = connected(&mock).await;
    let mut presence = session.presence_events();

    mock.deliver_json("/user/queue/presence", &json!({"username": "alice", "online": true}));

    let event = timeout(Duration::from_millis(200), presence.recv())
        .await
        .expect("presence timed out")
        .expect("presence open");
    assert_eq!(event, PresenceEvent { username: "alice".into(), online: true });
}

// =============================================================================
// PUBLISH
// =============================================================================

#[tokio::test]
async fn vocabulary_helpers_publish_wire_payloads() {
    let mock = MockTransport::new();
    let session = connected(&mock).await;

    session.join_conversation("c1").expect("join");
    session
        .send_message("c1", &MessageContent::from("hello"), MessageKind::Text)
        .expect("send");
    session.set_typing("c1", true).expect("typing");
    session.mark_as_read("c1").expect("read");

    assert_eq!(
        mock.published(),
        vec![
            ("/app/chat.join".to_owned(), json!({"conversationId": "c1"})),
            ("/app/chat.send".to_owned(), json!({"conversationId": "c1", "content": "hello", "type": "text"})),
            ("/app/chat.typing".to_owned(), json!({"conversationId": "c1", "typing": true})),
            ("/app/chat.read".to_owned(), json!({"conversationId": "c1"})),
        ]
    );
}

#[tokio::test]
async fn publish_while_disconnected_is_dropped() {
    let mock = MockTransport::new();
    let session = session_with(&mock);

    let err = session.mark_as_read("c1").unwrap_err();
    assert!(matches!(err, SessionError::NotConnected));
    assert!(mock.published().is_empty());
}
