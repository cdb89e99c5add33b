//! C8 streaming gateway. One WebSocket session processes client frames
//! strictly sequentially: the read loop only awaits the next frame after
//! the previous one's subprocess has finished, so there is no separate
//! concurrency guard to write — the loop shape already enforces it.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, State};
use axum::response::IntoResponse;
use gw_pool::ChildEvent;
use gw_types::{GatewayError, TaskState, UsageSource};
use gw_wire::{ClientFrame, ServerFrame};
use tokio::sync::mpsc;

use crate::middleware::Identity;
use crate::state::AppState;

/// WebSocket close code 1001 ("Going Away") per RFC 6455, used when the
/// server — not the client — is ending the session.
const GOING_AWAY: u16 = 1001;

pub async fn stream(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_session(socket, state, identity))
}

async fn run_session(mut socket: WebSocket, state: AppState, identity: Identity) {
    let mut shutdown = state.shutdown.subscribe();

    loop {
        // A session idling between chats is the one window a shutdown needs
        // to interrupt directly — an in-flight chat already ends through
        // `pool.drain()` finishing its subprocess normally.
        let message = tokio::select! {
            biased;
            _ = shutdown.recv() => {
                let _ = socket
                    .send(WsMessage::Close(Some(CloseFrame {
                        code: GOING_AWAY,
                        reason: "service draining".into(),
                    })))
                    .await;
                break;
            }
            message = socket.recv() => message,
        };

        let message = match message {
            Some(Ok(message)) => message,
            Some(Err(_)) | None => break,
        };

        let text = match message {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Binary(_) => continue,
        };

        let frame: ClientFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(_) => {
                let error = send_error(&mut socket, GatewayError::InvalidRequest { field: "frame".to_string() }).await;
                if error.is_err() {
                    break;
                }
                continue;
            }
        };

        if handle_chat_frame(&mut socket, &state, &identity, frame).await.is_err() {
            break;
        }
    }
}

async fn handle_chat_frame(
    socket: &mut WebSocket,
    state: &AppState,
    identity: &Identity,
    frame: ClientFrame,
) -> Result<(), axum::Error> {
    let ClientFrame::Chat { model, messages, .. } = frame;

    let rate = gw_pricing::rate_for_alias(model);
    let prompt_chars: usize = messages.iter().map(|m| m.content.len()).sum();
    let estimate = gw_pricing::estimate_cost(rate, prompt_chars, None);

    let handle = match state.budget.reserve(&identity.project_id, estimate).await {
        Ok(handle) => handle,
        Err(_) => return send_error(socket, GatewayError::BudgetExceeded).await,
    };

    let prompt = messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n");

    let submit = gw_pool::SubmitRequest {
        prompt,
        model_alias: model.as_str().to_string(),
        allowed_tools: None,
        working_directory: None,
        request_id: gw_observability::new_request_id(),
        timeout: Duration::from_secs(120),
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<ChildEvent>();
    let task_id = match state.pool.submit_with_events(submit, tx) {
        Ok(id) => id,
        Err(err) => {
            let _ = state.budget.refund(handle).await;
            return send_error(socket, err).await;
        }
    };

    // Raced rather than a plain `while let` over `rx`: a client can disconnect
    // while the child is still thinking between tokens, and the only way to
    // notice that promptly (vs. on the next attempted send) is to keep polling
    // the socket for a close/error concurrently with forwarding events.
    loop {
        tokio::select! {
            biased;
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => {
                        let _ = state.pool.cancel(task_id);
                        let _ = state.budget.refund(handle).await;
                        return Ok(());
                    }
                    _ => {}
                }
            }
            event = rx.recv() => {
                match event {
                    Some(ChildEvent::Token { content }) => {
                        if let Err(err) = socket.send(WsMessage::Text(frame_json(&ServerFrame::Token { content }).into())).await {
                            let _ = state.pool.cancel(task_id);
                            let _ = state.budget.refund(handle).await;
                            return Err(err);
                        }
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        }
    }

    let outcome = match state.pool.get_result(task_id, Duration::from_secs(122)).await {
        Ok(outcome) => outcome,
        Err(err) => {
            let _ = state.budget.refund(handle).await;
            return send_error(socket, err).await;
        }
    };

    if outcome.state != TaskState::Completed {
        let _ = state.budget.refund(handle).await;
        let err = match outcome.error.map(|e| e.kind) {
            Some(gw_types::TaskErrorKind::Timeout) => GatewayError::Timeout,
            Some(gw_types::TaskErrorKind::OutputMalformed) => GatewayError::OutputMalformed,
            Some(gw_types::TaskErrorKind::ChildExit) => GatewayError::ChildExit { code: -1 },
            Some(gw_types::TaskErrorKind::CostExceeded) => GatewayError::CostExceeded,
            _ => GatewayError::Internal,
        };
        return send_error(socket, err).await;
    }

    let usage = outcome.usage.unwrap_or_default();
    let cost_usd = gw_pricing::price_usage(rate, usage);
    let _ = state
        .budget
        .record(handle, cost_usd, usage.input_tokens, usage.output_tokens, model.as_str(), UsageSource::Cli)
        .await;

    socket
        .send(WsMessage::Text(
            frame_json(&ServerFrame::Done {
                usage,
                cost_usd,
                model: model.as_str().to_string(),
            })
            .into(),
        ))
        .await
}

async fn send_error(socket: &mut WebSocket, err: GatewayError) -> Result<(), axum::Error> {
    let body: gw_types::ErrorBody = (&err).into();
    socket.send(WsMessage::Text(frame_json(&ServerFrame::Error { error: body }).into())).await
}

fn frame_json(frame: &ServerFrame) -> String {
    serde_json::to_string(frame).unwrap_or_else(|_| "{\"type\":\"error\"}".to_string())
}
