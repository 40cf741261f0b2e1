//! Integration tests for the Telegram notifier.
//!
//! Each test spins up a fake Bot API on a random port with a scripted list of
//! response statuses and points a real `TelegramNotifier` at it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::post,
};
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use automation_hub::channels::{Notifier, RetryPolicy, TelegramNotifier};
use automation_hub::error::NotifyError;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const BOT_TOKEN: &str = "123:abc";

#[derive(Clone, Default)]
struct FakeBotApi {
    script: Arc<Mutex<VecDeque<StatusCode>>>,
    requests: Arc<Mutex<Vec<(String, Value)>>>,
}

impl FakeBotApi {
    fn requests(&self) -> Vec<(String, Value)> {
        self.requests.lock().unwrap().clone()
    }
}

async fn send_message(
    State(api): State<FakeBotApi>,
    Path(bot): Path<String>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    api.requests.lock().unwrap().push((bot, body));
    let status = api
        .script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or(StatusCode::OK);

    if status.is_success() {
        (status, Json(json!({"ok": true, "result": {}})))
    } else {
        (
            status,
            Json(json!({"ok": false, "description": "scripted failure"})),
        )
    }
}

/// Start the fake API and build a notifier with millisecond backoff.
async fn start_api(script: &[StatusCode]) -> (TelegramNotifier, FakeBotApi) {
    let api = FakeBotApi::default();
    api.script.lock().unwrap().extend(script.iter().copied());

    let app = Router::new()
        .route("/{bot}/sendMessage", post(send_message))
        .with_state(api.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let notifier = TelegramNotifier::new(SecretString::from(BOT_TOKEN.to_string()))
        .with_api_base(format!("http://{addr}"))
        .with_retry(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
        });

    (notifier, api)
}

#[tokio::test]
async fn delivers_markdown_on_first_attempt() {
    let (notifier, api) = start_api(&[]).await;

    timeout(TEST_TIMEOUT, notifier.notify("42", "code: `482913`"))
        .await
        .unwrap()
        .unwrap();

    let requests = api.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, format!("bot{BOT_TOKEN}"));
    assert_eq!(requests[0].1["chat_id"], 42);
    assert_eq!(requests[0].1["text"], "code: `482913`");
    assert_eq!(requests[0].1["parse_mode"], "Markdown");
}

#[tokio::test]
async fn negative_chat_ids_are_accepted() {
    let (notifier, api) = start_api(&[]).await;

    timeout(TEST_TIMEOUT, notifier.notify("-1001234567890", "hi"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(api.requests()[0].1["chat_id"], -1001234567890i64);
}

#[tokio::test]
async fn retries_server_errors_then_succeeds() {
    let (notifier, api) = start_api(&[StatusCode::INTERNAL_SERVER_ERROR]).await;

    timeout(TEST_TIMEOUT, notifier.notify("42", "hello"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(api.requests().len(), 2);
}

#[tokio::test]
async fn retries_rate_limiting() {
    let (notifier, api) = start_api(&[StatusCode::TOO_MANY_REQUESTS]).await;

    timeout(TEST_TIMEOUT, notifier.notify("42", "hello"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(api.requests().len(), 2);
}

#[tokio::test]
async fn markdown_rejection_falls_back_to_plain_text() {
    let (notifier, api) = start_api(&[StatusCode::BAD_REQUEST]).await;

    timeout(TEST_TIMEOUT, notifier.notify("42", "unbalanced *markdown"))
        .await
        .unwrap()
        .unwrap();

    let requests = api.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].1["parse_mode"], "Markdown");
    assert!(requests[1].1.get("parse_mode").is_none());
    assert_eq!(requests[1].1["text"], "unbalanced *markdown");
}

#[tokio::test]
async fn permanent_rejection_is_not_retried() {
    let (notifier, api) = start_api(&[StatusCode::FORBIDDEN]).await;

    let err = timeout(TEST_TIMEOUT, notifier.notify("42", "hello"))
        .await
        .unwrap()
        .unwrap_err();

    assert!(matches!(err, NotifyError::Rejected { status: 403, .. }));
    assert_eq!(api.requests().len(), 1);
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    let (notifier, api) = start_api(&[
        StatusCode::BAD_GATEWAY,
        StatusCode::BAD_GATEWAY,
        StatusCode::BAD_GATEWAY,
        StatusCode::BAD_GATEWAY,
    ])
    .await;

    let err = timeout(TEST_TIMEOUT, notifier.notify("42", "hello"))
        .await
        .unwrap()
        .unwrap_err();

    assert!(matches!(err, NotifyError::RetriesExhausted { attempts: 3, .. }));
    assert_eq!(api.requests().len(), 3);
    // The token never leaks into error text.
    assert!(!err.to_string().contains(BOT_TOKEN));
}

#[tokio::test]
async fn invalid_chat_id_never_reaches_the_api() {
    let (notifier, api) = start_api(&[]).await;

    let err = timeout(TEST_TIMEOUT, notifier.notify("not-a-number", "hello"))
        .await
        .unwrap()
        .unwrap_err();

    assert!(matches!(err, NotifyError::InvalidDestination { .. }));
    assert!(api.requests().is_empty());
}

#[tokio::test]
async fn long_messages_are_split_into_chunks() {
    let (notifier, api) = start_api(&[]).await;
    let line = "x".repeat(99);
    let text = std::iter::repeat_n(line.as_str(), 60)
        .collect::<Vec<_>>()
        .join("\n");

    timeout(TEST_TIMEOUT, notifier.notify("42", &text))
        .await
        .unwrap()
        .unwrap();

    let requests = api.requests();
    assert_eq!(requests.len(), 2);
    for (_, body) in &requests {
        assert!(body["text"].as_str().unwrap().chars().count() <= 4096);
    }
}

#[tokio::test]
async fn unreachable_api_is_a_transport_failure() {
    // Bind and drop to get a port nothing listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let notifier = TelegramNotifier::new(SecretString::from(BOT_TOKEN.to_string()))
        .with_api_base(format!("http://{addr}"))
        .with_retry(RetryPolicy::none());

    let err = timeout(TEST_TIMEOUT, notifier.notify("42", "hello"))
        .await
        .unwrap()
        .unwrap_err();

    match err {
        NotifyError::RetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 1);
            assert!(matches!(*last, NotifyError::Transport { .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}
