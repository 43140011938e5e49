use super::*;
use crate::auth::StaticToken;
use crate::test_helpers::{conversation, message};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::timeout;

struct NoToken;

impl TokenProvider for NoToken {
    fn bearer_token(&self) -> Option<String> {
        None
    }
}

fn ok_envelope(data: serde_json::Value) -> String {
    serde_json::json!({ "success": true, "message": "ok", "data": data }).to_string()
}

/// Serve exactly one HTTP response and hand back the raw request head.
async fn serve_once(status: u16, body: String) -> (String, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut buf = vec![0u8; 16 * 1024];
        let mut read = 0;
        loop {
            let n = socket.read(&mut buf[read..]).await.expect("read");
            read += n;
            if n == 0 || request_complete(&buf[..read]) {
                break;
            }
        }
        let request = String::from_utf8_lossy(&buf[..read]).to_string();
        let response = format!(
            "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        socket.write_all(response.as_bytes()).await.expect("write");
        let _ = tx.send(request);
    });
    (format!("http://{addr}/api"), rx)
}

/// Head received and, when announced, the whole body too.
fn request_complete(raw: &[u8]) -> bool {
    let text = String::from_utf8_lossy(raw);
    let Some(head_end) = text.find("\r\n\r\n") else { return false };
    let length = text[..head_end]
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length").then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);
    raw.len() >= head_end + 4 + length
}

fn api(base: &str) -> HttpChatApi {
    HttpChatApi::with_base_url(base, Arc::new(StaticToken::new("tok"))).expect("client")
}

// =============================================================================
// PARSING
// =============================================================================

#[test]
fn envelope_yields_data() {
    let json = ok_envelope(serde_json::json!([conversation("c1", "bob")]));
    let list: Vec<Conversation> = parse_envelope(&json).expect("parse");
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].counterpart_name, "bob");
}

#[test]
fn envelope_failure_carries_message() {
    let json = r#"{"success":false,"message":"not a participant"}"#;
    let err = parse_envelope::<Conversation>(json).unwrap_err();
    assert!(matches!(err, ApiError::Envelope { message: Some(ref m) } if m == "not a participant"));
    assert_eq!(err.to_string(), "API rejected request: not a participant");
}

#[test]
fn envelope_without_data_is_parse_error() {
    let err = parse_envelope::<Vec<Conversation>>(r#"{"success":true}"#).unwrap_err();
    assert!(matches!(err, ApiError::Parse(_)));
}

#[test]
fn garbage_is_parse_error() {
    assert!(matches!(parse_envelope::<Conversation>("<html>"), Err(ApiError::Parse(_))));
}

#[test]
fn paged_body_reports_more_until_last() {
    let body: PageBody = serde_json::from_value(serde_json::json!({
        "content": [message("m1", "c1", "2024-01-01T00:00:00Z")],
        "last": false,
    }))
    .expect("page");
    let page = body.into_page(20);
    assert_eq!(page.messages.len(), 1);
    assert!(page.has_more);
}

#[test]
fn short_list_is_last_page() {
    let full: PageBody = serde_json::from_value(serde_json::json!([
        message("m1", "c1", "2024-01-01T00:00:00Z"),
        message("m2", "c1", "2024-01-01T00:00:01Z"),
    ]))
    .expect("list");
    assert!(full.into_page(2).has_more);

    let short: PageBody =
        serde_json::from_value(serde_json::json!([message("m1", "c1", "2024-01-01T00:00:00Z")])).expect("list");
    assert!(!short.into_page(2).has_more);
}

#[test]
fn retryable_statuses() {
    assert!(ApiError::Status { status: 503, body: String::new() }.retryable());
    assert!(ApiError::Status { status: 429, body: String::new() }.retryable());
    assert!(!ApiError::Status { status: 404, body: String::new() }.retryable());
    assert!(!ApiError::MissingToken.retryable());
    assert!(ApiError::Status { status: 401, body: String::new() }.is_unauthorized());
}

// =============================================================================
// HTTP
// =============================================================================

#[tokio::test]
async fn conversations_presents_bearer_and_unwraps() {
    let (base, request) = serve_once(200, ok_envelope(serde_json::json!([conversation("c1", "bob")]))).await;

    let list = api(&base).conversations().await.expect("conversations");
    assert_eq!(list[0].id, "c1");

    let head = timeout(Duration::from_secs(2), request).await.expect("timed out").expect("request");
    assert!(head.starts_with("GET /api/conversations HTTP/1.1"), "{head}");
    assert!(head.to_ascii_lowercase().contains("authorization: bearer tok"), "{head}");
}

#[tokio::test]
async fn create_conversation_posts_user_id() {
    let (base, request) = serve_once(200, ok_envelope(serde_json::json!(conversation("c7", "carol")))).await;

    let conv = api(&base).create_conversation("u-carol").await.expect("create");
    assert_eq!(conv.id, "c7");

    let head = timeout(Duration::from_secs(2), request).await.expect("timed out").expect("request");
    assert!(head.starts_with("POST /api/conversations HTTP/1.1"), "{head}");
    assert!(head.contains(r#"{"userId":"u-carol"}"#), "{head}");
}

#[tokio::test]
async fn messages_sends_page_query() {
    let (base, request) = serve_once(
        200,
        ok_envelope(serde_json::json!({ "content": [message("m1", "c1", "2024-01-01T00:00:00Z")], "last": true })),
    )
    .await;

    let page = api(&base).messages("c1", 2, 50).await.expect("messages");
    assert_eq!(page.messages[0].id, "m1");
    assert!(!page.has_more);

    let head = timeout(Duration::from_secs(2), request).await.expect("timed out").expect("request");
    assert!(head.starts_with("GET /api/conversations/c1/messages?page=2&size=50 HTTP/1.1"), "{head}");
}

#[tokio::test]
async fn error_status_keeps_body() {
    let (base, _request) = serve_once(403, r#"{"success":false}"#.to_owned()).await;

    let err = api(&base).conversation("c1").await.unwrap_err();
    assert!(matches!(err, ApiError::Status { status: 403, ref body } if body.contains("success")));
}

#[tokio::test]
async fn missing_token_fails_before_sending() {
    let api = HttpChatApi::with_base_url("http://127.0.0.1:9", Arc::new(NoToken)).expect("client");
    assert!(matches!(api.conversations().await, Err(ApiError::MissingToken)));
}
