use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::io;
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

use productive_me::actions::MemoryActionExecutor;
use productive_me::app::app_router;
use productive_me::auth::create_jwt_token;
use productive_me::config::AppConfig;
use productive_me::consumer::FrameDecoder;
use productive_me::context::MemoryContextSource;
use productive_me::frame::{ContextRecord, FrameEnvelope, StreamFrame};
use productive_me::middleware::tracing::ColoredFields;
use productive_me::state::AppState;

const SECRET: &str = "test-secret";

fn record(id: &str, title: &str, minutes_ago: i64) -> ContextRecord {
    ContextRecord {
        id: id.to_string(),
        title: title.to_string(),
        priority: Some("medium".to_string()),
        stage: Some("todo".to_string()),
        created_at: Utc::now() - Duration::minutes(minutes_ago),
    }
}

fn test_state() -> (AppState, Arc<MemoryActionExecutor>) {
    let context = Arc::new(MemoryContextSource::new());
    context.insert("user-1", record("t1", "Write report", 10));
    context.insert("user-1", record("t2", "Call dentist", 5));
    let actions = Arc::new(MemoryActionExecutor::new());
    let state = AppState::new(AppConfig::local(SECRET), context, actions.clone());
    (state, actions)
}

fn app() -> Router {
    app_router(test_state().0)
}

fn bearer(user: &str) -> String {
    format!("Bearer {}", create_jwt_token(user, SECRET).unwrap())
}

fn post(uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
}

async fn read_frames(body: Body) -> Vec<FrameEnvelope> {
    let bytes = to_bytes(body, usize::MAX).await.unwrap();
    let mut decoder = FrameDecoder::new();
    let mut frames = decoder.push(&bytes);
    frames.extend(decoder.finish());
    assert_eq!(decoder.skipped(), 0);
    frames
}

async fn read_json(body: Body) -> Value {
    let bytes = to_bytes(body, usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_anonymous_copilot_stream_has_empty_context() {
    let body = json!({ "prompt": "Plan my day", "seq": 3 });
    let response = app()
        .oneshot(post("/api/ai/copilot").body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/json; charset=utf-8"
    );
    assert!(response.headers().contains_key("x-stream-id"));

    let frames = read_frames(response.into_body()).await;
    assert!(frames.iter().all(|f| f.seq == Some(3)));
    assert_eq!(frames.first().map(|f| &f.frame), Some(&StreamFrame::start()));
    assert_eq!(frames[1].frame, StreamFrame::context(Vec::new()));
    assert_eq!(frames.last().map(|f| &f.frame), Some(&StreamFrame::end()));
}

#[tokio::test]
async fn test_authenticated_copilot_stream_includes_recent_tasks() {
    let body = json!({ "prompt": "Plan my day" });
    let response = app()
        .oneshot(
            post("/api/ai/copilot")
                .header(header::AUTHORIZATION, bearer("user-1"))
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let frames: Vec<StreamFrame> = read_frames(response.into_body())
        .await
        .into_iter()
        .map(|f| f.frame)
        .collect();

    match &frames[1] {
        StreamFrame::Context { context } => {
            let ids: Vec<&str> = context.iter().map(|r| r.id.as_str()).collect();
            assert_eq!(ids, vec!["t2", "t1"]);
        }
        other => panic!("expected context, got {other:?}"),
    }
    let last_draft = frames
        .iter()
        .filter_map(|f| match f {
            StreamFrame::Draft { draft } => Some(draft.clone()),
            _ => None,
        })
        .last()
        .unwrap();
    assert!(last_draft.contains("Write report"));
    assert!(frames
        .iter()
        .any(|f| matches!(f, StreamFrame::ProposedActions { proposed_actions } if !proposed_actions.is_empty())));
}

#[tokio::test]
async fn test_access_token_cookie_is_accepted() {
    let token = create_jwt_token("user-1", SECRET).unwrap();
    let body = json!({ "prompt": "hi" });
    let response = app()
        .oneshot(
            post("/api/ai/copilot")
                .header(header::COOKIE, format!("sb-access-token={token}"))
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    let frames = read_frames(response.into_body()).await;
    match &frames[1].frame {
        StreamFrame::Context { context } => assert_eq!(context.len(), 2),
        other => panic!("expected context, got {other:?}"),
    }
}

#[tokio::test]
async fn test_invalid_token_is_treated_as_anonymous() {
    let body = json!({ "prompt": "hi" });
    let response = app()
        .oneshot(
            post("/api/ai/copilot")
                .header(header::AUTHORIZATION, "Bearer not-a-jwt")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let frames = read_frames(response.into_body()).await;
    assert_eq!(frames[1].frame, StreamFrame::context(Vec::new()));
}

#[tokio::test]
async fn test_client_stream_id_is_echoed() {
    let body = json!({ "prompt": "hi", "streamId": "panel-42" });
    let response = app()
        .oneshot(post("/api/ai/copilot").body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();
    assert_eq!(response.headers()["x-stream-id"], "panel-42");
}

#[tokio::test]
async fn test_malformed_copilot_body_is_rejected() {
    let response = app()
        .oneshot(
            post("/api/ai/copilot")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = read_json(response.into_body()).await;
    assert!(body["error"].as_str().unwrap().starts_with("invalid request body"));
}

#[tokio::test]
async fn test_actions_require_identity() {
    let body = json!({ "action": "createTask", "input": { "title": "Gym" } });
    let response = app()
        .oneshot(post("/api/ai/actions").body(Body::from(body.to_string())).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(read_json(response.into_body()).await, json!({ "error": "Unauthorized" }));
}

#[tokio::test]
async fn test_unknown_action_is_a_bad_request() {
    let body = json!({ "action": "launchRocket", "input": {} });
    let response = app()
        .oneshot(
            post("/api/ai/actions")
                .header(header::AUTHORIZATION, bearer("user-1"))
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_json(response.into_body()).await, json!({ "error": "Unknown action" }));
}

#[tokio::test]
async fn test_invalid_action_input_is_a_bad_request() {
    let body = json!({ "action": "analyzeBudget", "input": { "month": "June" } });
    let response = app()
        .oneshot(
            post("/api/ai/actions")
                .header(header::AUTHORIZATION, bearer("user-1"))
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = read_json(response.into_body()).await;
    assert!(body["error"].as_str().unwrap().contains("YYYY-MM"));
}

#[tokio::test]
async fn test_confirmed_proposed_action_creates_task_for_caller() {
    let (state, actions) = test_state();
    let body = json!({ "action": "createTask", "input": { "title": "Plan my day" } });
    let response = app_router(state)
        .oneshot(
            post("/api/ai/actions")
                .header(header::AUTHORIZATION, bearer("user-1"))
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response.into_body()).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["task"]["title"], "Plan my day");
    assert_eq!(body["task"]["priority"], "medium");

    let tasks = actions.rows("tasks");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0]["user_id"], "user-1");
}

#[tokio::test]
async fn test_mcp_manifest() {
    let response = app()
        .oneshot(Request::builder().uri("/api/mcp").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response.into_body()).await;
    assert_eq!(body["name"], "productive-me-mcp");
    assert_eq!(body["version"], "1.0.0");
    assert_eq!(body["endpoints"]["actions"]["input"]["properties"]["action"]["enum"][0], "createTask");
}

#[tokio::test]
async fn test_cancel_stream_requires_an_id() {
    let response = app()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/ai/cancel-stream")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cancel_stream_checks_owner() {
    let (state, _) = test_state();
    let stream = state
        .streams
        .register_stream("s-1".to_string(), Some("user-1".to_string()));
    let router = app_router(state.clone());

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/ai/cancel-stream?stream_id=s-1")
                .header(header::AUTHORIZATION, bearer("user-2"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(!stream.token.is_cancelled());

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/ai/cancel-stream?stream_id=s-1")
                .header(header::AUTHORIZATION, bearer("user-1"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(stream.token.is_cancelled());
    assert!(!state.streams.is_active("s-1"));
}

#[tokio::test]
async fn test_cancel_unknown_stream_is_not_an_error() {
    let response = app()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/ai/cancel-stream?stream_id=missing")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"Stream not found");
}

#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_copilot_stream_logs_carry_stream_fields() {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .fmt_fields(ColoredFields)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let body = json!({ "prompt": "hi", "seq": 5, "streamId": "panel-7" });
    let response = app()
        .oneshot(
            post("/api/ai/copilot")
                .header(header::AUTHORIZATION, bearer("user-1"))
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    read_frames(response.into_body()).await;

    for _ in 0..10 {
        if logs.text().contains("copilot stream released") {
            break;
        }
        tokio::task::yield_now().await;
    }

    let output = logs.text();
    let released = output
        .lines()
        .find(|line| line.contains("copilot stream released"))
        .unwrap();
    assert!(released.contains("stream_id=panel-7"));
    assert!(released.contains("user_id=user-1"));
    assert!(released.contains("seq=5"));
}
