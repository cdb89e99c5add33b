//! HTTP handlers. Each handler runs its own endpoint-specific admission
//! stages (permission check, budget reservation) after the shared
//! identify/validate/rate-limit gate has already run as middleware.
//!
//! Every handler is a thin public wrapper around a private `..._inner`
//! function that returns `Result<_, GatewayError>`. The wrapper's `?`
//! converts to `ApiError` at the one place axum actually needs it, so the
//! body logic never has to think about the response-wrapping newtype.

use std::time::Duration;

use axum::extract::{Extension, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use gw_budget::ReservationHandle;
use gw_permissions::Preset;
use gw_providers::ChatMessage as DirectChatMessage;
use gw_types::{GatewayError, TaskErrorKind, TaskState, UsageSource};
use gw_wire::{
    AgenticTaskRequest, AgenticTaskResponse, BatchItemResult, BatchRequest, BatchResponse,
    CapabilitiesResponse, ChatCompletionRequest, ChatCompletionResponse, HealthResponse,
    ProcessRequest, ProcessResponse, UsageQueryResponse, WorkerPoolStatus,
};

use crate::error::ApiError;
use crate::middleware::Identity;
use crate::state::AppState;

fn current_period() -> String {
    let now = chrono::Utc::now();
    format!("{:04}-{:02}", chrono::Datelike::year(&now), chrono::Datelike::month(&now))
}

pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<ChatCompletionRequest>,
) -> Result<Json<ChatCompletionResponse>, ApiError> {
    Ok(Json(chat_completions_inner(&state, &identity, body).await?))
}

async fn chat_completions_inner(
    state: &AppState,
    identity: &Identity,
    body: ChatCompletionRequest,
) -> Result<ChatCompletionResponse, GatewayError> {
    let rate = gw_pricing::rate_for_alias(body.model);
    let prompt_chars: usize = body.messages.iter().map(|m| m.content.len()).sum();
    let estimate = gw_pricing::estimate_cost(rate, prompt_chars, body.max_tokens);

    let handle = state
        .budget
        .reserve(&identity.project_id, estimate)
        .await
        .map_err(|_| GatewayError::BudgetExceeded)?;

    let prompt = render_prompt(&body.messages);
    let submit = gw_pool::SubmitRequest {
        prompt,
        model_alias: model_alias_str(body.model).to_string(),
        allowed_tools: None,
        working_directory: None,
        request_id: gw_observability::new_request_id(),
        timeout: Duration::from_secs(120),
    };

    let outcome = match run_via_pool(state, submit).await {
        Ok(outcome) => outcome,
        Err(err) => {
            let _ = state.budget.refund(handle).await;
            return Err(err);
        }
    };

    finish_direct_or_cli(state, handle, outcome, rate, UsageSource::Cli).await
}

pub async fn process(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<ProcessRequest>,
) -> Result<Json<ProcessResponse>, ApiError> {
    Ok(Json(process_inner(&state, &identity, body).await?))
}

async fn process_inner(
    state: &AppState,
    identity: &Identity,
    body: ProcessRequest,
) -> Result<ProcessResponse, GatewayError> {
    let rate = gw_pricing::rate_for_model_name(&body.model_name);
    let estimate = gw_pricing::estimate_cost(rate, body.user_message.len(), body.max_tokens);
    let handle = state
        .budget
        .reserve(&identity.project_id, estimate)
        .await
        .map_err(|_| GatewayError::BudgetExceeded)?;

    let result: Result<(String, gw_types::Usage, Option<String>), GatewayError> = if body.use_cli {
        let submit = gw_pool::SubmitRequest {
            prompt: body.user_message.clone(),
            model_alias: body.model_name.clone(),
            allowed_tools: None,
            working_directory: None,
            request_id: gw_observability::new_request_id(),
            timeout: Duration::from_secs(120),
        };
        match run_via_pool(state, submit).await {
            Ok(outcome) => {
                let text = outcome.text.clone().unwrap_or_default();
                let usage = outcome.usage.unwrap_or_default();
                Ok((text, usage, outcome.error.map(|e| e.message)))
            }
            Err(err) => Err(err),
        }
    } else {
        let model = gw_types::ModelAlias::parse(&body.model_name).unwrap_or(gw_types::ModelAlias::Sonnet);
        state
            .direct_provider
            .complete(
                vec![DirectChatMessage {
                    role: "user".to_string(),
                    content: body.user_message.clone(),
                }],
                model,
                body.max_tokens,
                None,
            )
            .await
            .map(|c| (c.text, c.usage, None))
            .map_err(|err| GatewayError::UpstreamError { message: err.to_string() })
    };

    let (text, usage, error) = match result {
        Ok(triple) => triple,
        Err(err) => {
            let _ = state.budget.refund(handle).await;
            return Err(err);
        }
    };

    if let Some(message) = error {
        let _ = state.budget.refund(handle).await;
        return Err(GatewayError::UpstreamError { message });
    }

    let cost_usd = gw_pricing::price_usage(rate, usage);
    let source = if body.use_cli { UsageSource::Cli } else { UsageSource::Direct };
    state
        .budget
        .record(handle, cost_usd, usage.input_tokens, usage.output_tokens, &body.model_name, source)
        .await
        .map_err(|_| GatewayError::Internal)?;

    Ok(ProcessResponse {
        text,
        model: body.model_name,
        usage,
        cost_usd,
        path: if body.use_cli { "cli" } else { "direct" },
    })
}

pub async fn task(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<AgenticTaskRequest>,
) -> Result<Response, ApiError> {
    let response = task_inner(&state, &identity, body).await?;
    // A cost-cap trip surfaces as 402 (spec's per-task budget exhaustion
    // status) but, unlike every other GatewayError, still carries whatever
    // execution_log/artifacts/result_text accumulated before the cut —
    // callers need that partial record, not just an error body.
    if response.state == "cost_exceeded" {
        let status = StatusCode::from_u16(GatewayError::CostExceeded.status_code())
            .unwrap_or(StatusCode::PAYMENT_REQUIRED);
        Ok((status, Json(response)).into_response())
    } else {
        Ok(Json(response).into_response())
    }
}

async fn task_inner(
    state: &AppState,
    identity: &Identity,
    body: AgenticTaskRequest,
) -> Result<AgenticTaskResponse, GatewayError> {
    let profile = state
        .permissions
        .get_or_preset(&identity.api_key, Preset::Free)
        .await
        .map_err(|_| GatewayError::Internal)?;

    gw_orchestrator::validate_permissions(&body, &profile, &state.registry)?;
    let working_directory = gw_orchestrator::resolve_working_directory(body.working_directory.as_deref(), &profile)?;

    let rate = gw_pricing::rate_for_alias(gw_types::ModelAlias::Sonnet);
    let estimate = gw_pricing::estimate_cost(rate, body.description.len(), None).min(body.max_cost_usd);
    let handle = state
        .budget
        .reserve(&identity.project_id, estimate)
        .await
        .map_err(|_| GatewayError::BudgetExceeded)?;

    let request_id = gw_observability::new_request_id();
    let outcome = state
        .orchestrator
        .execute(
            request_id,
            body.description.clone(),
            body.allow_tools.clone(),
            working_directory,
            Duration::from_secs(body.timeout_seconds),
            body.max_cost_usd,
        )
        .await;

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => {
            let _ = state.budget.refund(handle).await;
            return Err(err);
        }
    };

    match outcome.usage {
        Some(usage) => {
            let _ = state
                .budget
                .record(handle, outcome.cost_usd, usage.input_tokens, usage.output_tokens, "sonnet", UsageSource::Agentic)
                .await;
        }
        None => {
            let _ = state.budget.refund(handle).await;
        }
    }

    state.audit.record(
        Some(outcome.task_id.to_string()),
        gw_observability::key_prefix(&identity.api_key),
        "agentic_task",
        serde_json::json!({"state": format!("{:?}", outcome.state)}).to_string(),
    );

    let state_label = if outcome.error == Some(TaskErrorKind::CostExceeded) {
        "cost_exceeded"
    } else {
        match outcome.state {
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Timeout => "timeout",
            TaskState::Cancelled => "cancelled",
            TaskState::Pending | TaskState::Running => "running",
        }
    };

    Ok(AgenticTaskResponse {
        task_id: outcome.task_id.to_string(),
        state: state_label.to_string(),
        result_text: outcome.result_text,
        execution_log: outcome.execution_log,
        artifacts: outcome.artifacts,
        usage: outcome.usage,
        cost_usd: outcome.cost_usd,
    })
}

pub async fn batch(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, ApiError> {
    let rate = gw_pricing::rate_for_alias(body.model);

    // One reservation per element: a single shared reservation would let one
    // element's over-estimate starve budget headroom the others never used.
    // Reservations happen up front, in order, so quota rejections are
    // deterministic regardless of how the pool later schedules the survivors.
    let mut pending = Vec::with_capacity(body.prompts.len());
    let mut results: Vec<Option<BatchItemResult>> = Vec::with_capacity(body.prompts.len());
    for (index, prompt) in body.prompts.iter().enumerate() {
        let estimate = gw_pricing::estimate_cost(rate, prompt.len(), None);
        match state.budget.reserve(&identity.project_id, estimate).await {
            Ok(handle) => {
                results.push(None);
                pending.push((index, handle, prompt.clone()));
            }
            Err(_) => {
                results.push(Some(BatchItemResult {
                    index,
                    state: "failed".to_string(),
                    text: None,
                    error: Some((&GatewayError::BudgetExceeded).into()),
                }));
            }
        }
    }

    // Every reserved item is submitted to the pool concurrently; the pool's
    // own capacity check (not this handler) is what bounds actual parallelism
    // to `max_workers` — excess submissions simply queue.
    let futures = pending.into_iter().map(|(index, handle, prompt)| {
        let submit = gw_pool::SubmitRequest {
            prompt,
            model_alias: model_alias_str(body.model).to_string(),
            allowed_tools: None,
            working_directory: None,
            request_id: gw_observability::new_request_id(),
            timeout: Duration::from_secs(120),
        };
        run_batch_item(&state, handle, submit, rate, index)
    });

    for item in futures::future::join_all(futures).await {
        results[item.index] = Some(item);
    }

    Ok(Json(BatchResponse {
        results: results.into_iter().map(|r| r.expect("every index filled")).collect(),
    }))
}

async fn run_batch_item(
    state: &AppState,
    handle: ReservationHandle,
    submit: gw_pool::SubmitRequest,
    rate: gw_pricing::Rate,
    index: usize,
) -> BatchItemResult {
    let outcome = match run_via_pool(state, submit).await {
        Ok(outcome) => outcome,
        Err(err) => {
            let _ = state.budget.refund(handle).await;
            return BatchItemResult {
                index,
                state: "failed".to_string(),
                text: None,
                error: Some((&err).into()),
            };
        }
    };

    match finish_direct_or_cli(state, handle, outcome, rate, UsageSource::Cli).await {
        Ok(response) => BatchItemResult {
            index,
            state: "completed".to_string(),
            text: Some(response.text),
            error: None,
        },
        Err(err) => BatchItemResult {
            index,
            state: "failed".to_string(),
            text: None,
            error: Some((&err).into()),
        },
    }
}

#[derive(serde::Deserialize)]
pub struct UsageQuery {
    pub project_id: String,
    pub period: Option<String>,
}

pub async fn usage(
    State(state): State<AppState>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<UsageQueryResponse>, ApiError> {
    let period = query.period.unwrap_or_else(current_period);
    let aggregate = state
        .budget
        .usage(&query.project_id, &period)
        .await
        .map_err(|_| ApiError(GatewayError::Internal))?;
    Ok(Json(UsageQueryResponse {
        project_id: query.project_id,
        period,
        total_input_tokens: aggregate.total_input_tokens,
        total_output_tokens: aggregate.total_output_tokens,
        total_cost_usd: aggregate.total_cost_usd,
        request_count: aggregate.request_count,
    }))
}

pub async fn capabilities(State(state): State<AppState>) -> Json<CapabilitiesResponse> {
    Json(CapabilitiesResponse {
        agents: state.registry.agents().iter().map(|a| a.name.clone()).collect(),
        skills: state.registry.skills().iter().map(|s| s.name.clone()).collect(),
    })
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        worker_pool: WorkerPoolStatus {
            active: state.pool.active_count(),
            queued: state.pool.queued_count(),
            max_workers: state.pool.max_workers(),
        },
        budget_store: "ok",
        auth_store: "ok",
        cache: "ok",
        uptime_s: state.uptime_seconds(),
        draining: state.is_draining(),
    })
}

pub async fn ready(State(state): State<AppState>) -> axum::http::StatusCode {
    if state.is_ready() {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn run_via_pool(state: &AppState, submit: gw_pool::SubmitRequest) -> Result<gw_types::TaskOutcome, GatewayError> {
    let timeout = submit.timeout;
    let task_id = state.pool.submit(submit)?;
    state.pool.get_result(task_id, timeout + Duration::from_secs(2)).await
}

async fn finish_direct_or_cli(
    state: &AppState,
    handle: ReservationHandle,
    outcome: gw_types::TaskOutcome,
    rate: gw_pricing::Rate,
    source: UsageSource,
) -> Result<ChatCompletionResponse, GatewayError> {
    match outcome.state {
        TaskState::Completed => {
            let usage = outcome.usage.unwrap_or_default();
            let cost_usd = gw_pricing::price_usage(rate, usage);
            let model = "sonnet".to_string();
            state
                .budget
                .record(handle, cost_usd, usage.input_tokens, usage.output_tokens, &model, source)
                .await
                .map_err(|_| GatewayError::Internal)?;
            Ok(ChatCompletionResponse {
                text: outcome.text.unwrap_or_default(),
                model,
                usage,
                cost_usd,
            })
        }
        _ => {
            let _ = state.budget.refund(handle).await;
            Err(outcome_error(outcome))
        }
    }
}

fn outcome_error(outcome: gw_types::TaskOutcome) -> GatewayError {
    match outcome.error {
        Some(err) => match err.kind {
            gw_types::TaskErrorKind::Timeout => GatewayError::Timeout,
            gw_types::TaskErrorKind::Cancelled => GatewayError::Internal,
            gw_types::TaskErrorKind::OutputMalformed => GatewayError::OutputMalformed,
            gw_types::TaskErrorKind::ChildExit => GatewayError::ChildExit { code: err.exit_code.unwrap_or(-1) },
            gw_types::TaskErrorKind::CostExceeded => GatewayError::CostExceeded,
        },
        None => GatewayError::Internal,
    }
}

fn render_prompt(messages: &[gw_wire::ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

fn model_alias_str(alias: gw_types::ModelAlias) -> &'static str {
    alias.as_str()
}
