//! End-to-end exercises of the admission pipeline and budget accounting
//! through the real axum router, in the style of the example pack's
//! `tower::ServiceExt::oneshot`-driven integration tests.

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use gw_server::config::GatewayConfig;
use gw_server::state::AppState;
use gw_server::router;
use gw_observability::LogFormat;
use serde_json::{json, Value};
use tower::ServiceExt;

async fn test_state(max_workers: usize, cli_command: &str) -> (AppState, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = GatewayConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        state_dir: dir.path().to_path_buf(),
        max_workers,
        max_queue_depth: 8,
        monitor_interval_ms: 10,
        upstream_base_url: "https://example.invalid".to_string(),
        upstream_api_key: "unused".to_string(),
        cli_command: cli_command.to_string(),
        log_format: LogFormat::Compact,
        default_monthly_quota_usd: None,
        drain_deadline: Duration::from_secs(1),
    };
    let state = AppState::bootstrap(config).await.unwrap();
    (state, dir)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

#[tokio::test]
async fn missing_key_is_rejected_before_any_work_happens() {
    let (state, _dir) = test_state(2, "sh").await;
    let app = router(state.clone());

    let response = app
        .oneshot(
            Request::post("/v1/chat/completions")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"model": "sonnet", "messages": [{"role":"user","content":"hi"}]}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(state.pool.active_count(), 0);
}

#[tokio::test]
async fn unknown_key_is_auth_invalid() {
    let (state, _dir) = test_state(2, "sh").await;
    let app = router(state);

    let response = app
        .oneshot(
            Request::post("/v1/chat/completions")
                .header("authorization", "Bearer cc_nonexistent")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"model": "sonnet", "messages": [{"role":"user","content":"hi"}]}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn revoked_key_fails_admission_immediately() {
    let (state, _dir) = test_state(2, "sh").await;
    let key = state.auth.create_key("proj-a".to_string(), 60).await.unwrap();
    state.auth.revoke(&key.key).await.unwrap();
    let app = router(state);

    let response = app
        .oneshot(
            Request::get("/v1/capabilities")
                .header("authorization", format!("Bearer {}", key.key))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn blocked_tool_is_denied_without_consuming_a_slot_or_budget() {
    let (state, _dir) = test_state(2, "sh").await;
    let key = state.auth.create_key("proj-a".to_string(), 60).await.unwrap();
    state.budget.set_quota("proj-a", Some(10.0)).await.unwrap();
    let app = router(state.clone());

    // Default (Free) preset blocks Bash.
    let response = app
        .oneshot(
            Request::post("/v1/task")
                .header("authorization", format!("Bearer {}", key.key))
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "description": "do a thing",
                        "allow_tools": ["Bash"],
                        "timeout_seconds": 30,
                        "max_cost_usd": 0.01
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["type"], "permission_denied");
    assert_eq!(body["field"], "Bash");
    assert_eq!(state.pool.active_count(), 0);
    assert_eq!(state.budget.outstanding_count().await, 0);
}

#[tokio::test]
async fn child_failure_refunds_the_reservation_and_commits_nothing() {
    // `sh` run with the literal string prompt as its script; a nonzero exit
    // simulates the child process contract's `ChildExit` failure path.
    let (state, _dir) = test_state(2, "false").await;
    let key = state.auth.create_key("proj-a".to_string(), 60).await.unwrap();
    state.budget.set_quota("proj-a", Some(0.10)).await.unwrap();
    let app = router(state.clone());

    let response = app
        .oneshot(
            Request::post("/v1/chat/completions")
                .header("authorization", format!("Bearer {}", key.key))
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"model": "sonnet", "messages": [{"role":"user","content":"hi"}]}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(state.budget.outstanding_count().await, 0);
    let usage = state.budget.usage("proj-a", &current_period()).await.unwrap();
    assert_eq!(usage.total_cost_usd, 0.0);
}

#[tokio::test]
async fn successful_cli_completion_commits_usage_against_the_project() {
    let (state, _dir) = test_state(2, "sh").await;
    let key = state.auth.create_key("proj-a".to_string(), 60).await.unwrap();
    state.budget.set_quota("proj-a", Some(10.0)).await.unwrap();
    let app = router(state.clone());

    // `chat_completions` renders each message as `role: content` before
    // writing it to the child's prompt file; a leading newline in the
    // content keeps the rendered `role:` prefix on its own (harmlessly
    // failing) line so the real script starts clean on the next one.
    let script = "\necho '{\"type\":\"result\",\"text\":\"hi there\",\"usage\":{\"input_tokens\":5,\"output_tokens\":7},\"model\":\"sonnet\"}'";
    let response = app
        .oneshot(
            Request::post("/v1/chat/completions")
                .header("authorization", format!("Bearer {}", key.key))
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"model": "sonnet", "messages": [{"role":"user","content": script}]}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["text"], "hi there");
    assert_eq!(state.budget.outstanding_count().await, 0);
    let usage = state.budget.usage("proj-a", &current_period()).await.unwrap();
    assert_eq!(usage.request_count, 1);
    assert!(usage.total_cost_usd > 0.0);
}

#[tokio::test]
async fn agentic_cost_cap_trip_returns_402_with_partial_execution_log() {
    let (state, _dir) = test_state(2, "sh").await;
    let key = state.auth.create_key("proj-a".to_string(), 60).await.unwrap();
    state.budget.set_quota("proj-a", Some(10.0)).await.unwrap();
    let app = router(state.clone());

    // A `thinking` event alone is large enough to blow the tiny max_cost_usd
    // cap; the child then sleeps so the cancel lands before it would
    // otherwise emit its `result` line.
    let big_thought = "x".repeat(4000);
    let script = format!(
        "echo '{{\"type\":\"thinking\",\"text\":\"{big_thought}\"}}' && sleep 2 && echo '{{\"type\":\"result\",\"text\":\"done\",\"usage\":{{\"input_tokens\":1,\"output_tokens\":1}},\"model\":\"sonnet\"}}'"
    );

    let response = app
        .oneshot(
            Request::post("/v1/task")
                .header("authorization", format!("Bearer {}", key.key))
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "description": script,
                        "allow_tools": [],
                        "timeout_seconds": 10,
                        "max_cost_usd": 0.0001
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    let body = body_json(response).await;
    assert_eq!(body["state"], "cost_exceeded");
    assert!(body["execution_log"]
        .as_array()
        .unwrap()
        .iter()
        .any(|e| e["event"] == "thinking"));
    assert_eq!(state.budget.outstanding_count().await, 0);
}

#[tokio::test]
async fn batch_runs_items_concurrently_and_preserves_result_order() {
    // Each item sleeps 150ms before replying. With max_workers=4 and 4
    // items, a truly sequential implementation would take >= 600ms; a
    // concurrent one (bounded by the pool, not the handler) finishes in
    // roughly one item's worth of wall-clock time.
    let (state, _dir) = test_state(4, "sh").await;
    let key = state.auth.create_key("proj-a".to_string(), 60).await.unwrap();
    let app = router(state.clone());

    let script = |label: &str| {
        format!(
            "sleep 0.15 && echo '{{\"type\":\"result\",\"text\":\"{label}\",\"usage\":{{\"input_tokens\":1,\"output_tokens\":1}},\"model\":\"sonnet\"}}'"
        )
    };

    let started = tokio::time::Instant::now();
    let response = app
        .oneshot(
            Request::post("/v1/batch")
                .header("authorization", format!("Bearer {}", key.key))
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "model": "sonnet",
                        "prompts": [script("a"), script("b"), script("c"), script("d")]
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(elapsed < Duration::from_millis(500), "batch items did not run concurrently: {elapsed:?}");

    let body = body_json(response).await;
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 4);
    for (i, expected) in ["a", "b", "c", "d"].iter().enumerate() {
        assert_eq!(results[i]["index"], i);
        assert_eq!(results[i]["text"], *expected);
    }
}

#[tokio::test]
async fn health_and_ready_reflect_pool_and_lifecycle_state() {
    let (state, _dir) = test_state(3, "sh").await;
    let app = router(state.clone());

    let not_ready = app
        .clone()
        .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(not_ready.status(), StatusCode::SERVICE_UNAVAILABLE);

    state.mark_ready();

    let ready = app
        .clone()
        .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(ready.status(), StatusCode::OK);

    let health = app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    let body = body_json(health).await;
    assert_eq!(body["worker_pool"]["max_workers"], 3);
    assert_eq!(body["draining"], false);
}

#[tokio::test]
async fn capabilities_lists_the_seeded_registry() {
    let (state, _dir) = test_state(1, "sh").await;
    let key = state.auth.create_key("proj-a".to_string(), 60).await.unwrap();
    let app = router(state);

    let response = app
        .oneshot(
            Request::get("/v1/capabilities")
                .header("authorization", format!("Bearer {}", key.key))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["agents"].as_array().unwrap().iter().any(|a| a == "general-purpose"));
    assert!(body["skills"].as_array().unwrap().iter().any(|s| s == "web-search"));
}

fn current_period() -> String {
    let now = chrono::Utc::now();
    format!("{:04}-{:02}", chrono::Datelike::year(&now), chrono::Datelike::month(&now))
}
