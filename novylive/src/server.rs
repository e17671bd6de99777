//! HTTP surface: state query/update endpoints, callback invocation
//! endpoints, and the live socket upgrade.
//!
//! The router carries a [`Runtime`] as shared state and can be merged into
//! a larger application router (page routes, static assets) before serving.

use std::collections::BTreeMap;

use anyhow::{Context as _, Result};
use axum::Router;
use axum::body::{Bytes, to_bytes};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Form, FromRequest, Json, Path, Request, State};
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;

use crate::callbacks::EventParams;
use crate::context::{RequestContext, now_millis};
use crate::error::RuntimeError;
use crate::live::OutboundFrame;
use crate::live::protocol::{ClientMsg, ServerMsg};
use crate::runtime::Runtime;
use crate::store::NotifierSnapshot;

const PARAMS_BODY_LIMIT: usize = 64 * 1024;

/// All runtime endpoints under their conventional paths. Callback
/// invocation answers exactly GET, POST, PUT and DELETE; anything else
/// gets a 405 without touching the handler.
pub fn router(runtime: Runtime) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/state/{id}", get(state_query).post(state_update))
        .route(
            "/api/callbacks/{id}",
            get(invoke_callback)
                .post(invoke_callback)
                .put(invoke_callback)
                .delete(invoke_callback),
        )
        .route("/live", get(live_upgrade))
        .with_state(runtime)
}

/// Binds `addr` and serves `app` until the process is stopped.
pub async fn serve(addr: &str, app: Router) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    log::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

async fn health(State(runtime): State<Runtime>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "connections": runtime.hub().connection_count(),
        "callbacks": runtime.callbacks().len(),
        "notifiers": runtime.store().notifier_count(),
    }))
}

async fn state_query(State(runtime): State<Runtime>, Path(id): Path<String>) -> Response {
    let request = RequestContext::new();
    log::debug!("state query for {id} (request {})", request.id());
    state_response(runtime.store().notifier_state(&id))
}

async fn state_update(
    State(runtime): State<Runtime>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let request = RequestContext::new();
    let raw: Value = match serde_json::from_slice(&body) {
        Ok(raw) => raw,
        Err(err) => {
            return state_error(StatusCode::BAD_REQUEST, &format!("invalid JSON body: {err}"));
        }
    };
    let Some(value) = raw.get("value").cloned() else {
        return state_error(StatusCode::BAD_REQUEST, "missing \"value\" field");
    };
    log::debug!("state update for {id} (request {})", request.id());
    state_response(runtime.store().set_notifier_value(&id, value))
}

fn state_response(result: Result<NotifierSnapshot, RuntimeError>) -> Response {
    match result {
        Ok(state) => Json(json!({ "success": true, "state": state })).into_response(),
        Err(err) => state_error(error_status(&err), &err.to_string()),
    }
}

fn state_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "success": false, "error": message }))).into_response()
}

async fn invoke_callback(
    State(runtime): State<Runtime>,
    Path(id): Path<String>,
    request: Request,
) -> Response {
    let ctx = RequestContext::new();
    let params = match extract_params(request).await {
        Ok(params) => params,
        Err(message) => return callback_error(StatusCode::BAD_REQUEST, &message),
    };
    match runtime.callbacks().invoke(&id, params, &ctx) {
        Ok(()) => Json(json!({ "status": "success" })).into_response(),
        Err(err) => callback_error(error_status(&err), &err.to_string()),
    }
}

fn callback_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "status": "error", "error": message }))).into_response()
}

fn error_status(err: &RuntimeError) -> StatusCode {
    if err.is_not_found() {
        StatusCode::NOT_FOUND
    } else if matches!(err, RuntimeError::HandlerPanicked { .. }) {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::BAD_REQUEST
    }
}

/// Callback bodies may be JSON or form-encoded; GET and HEAD carry their
/// parameters in the query string. A bodyless request means no parameters.
async fn extract_params(request: Request) -> Result<EventParams, String> {
    let reads_query = request.method() == Method::GET || request.method() == Method::HEAD;
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    if !reads_query && content_type.starts_with("application/json") {
        return match Json::<Value>::from_request(request, &()).await {
            Ok(Json(raw)) => EventParams::from_json_object(raw).map_err(|err| err.to_string()),
            Err(err) => Err(format!("invalid JSON body: {err}")),
        };
    }
    if reads_query || content_type.starts_with("application/x-www-form-urlencoded") {
        return match Form::<BTreeMap<String, String>>::from_request(request, &()).await {
            Ok(Form(fields)) => Ok(EventParams::from_form_fields(fields)),
            Err(err) => Err(format!("invalid form body: {err}")),
        };
    }
    match to_bytes(request.into_body(), PARAMS_BODY_LIMIT).await {
        Ok(body) if body.is_empty() => Ok(EventParams::empty()),
        Ok(_) => Err(format!("unsupported content type: {content_type:?}")),
        Err(err) => Err(format!("failed to read body: {err}")),
    }
}

async fn live_upgrade(State(runtime): State<Runtime>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_live_socket(runtime, socket))
}

/// Per-connection socket loops. The writer task drains the hub-side
/// outbound queue; the read loop feeds client messages back into the hub
/// and keeps the heartbeat informed.
async fn handle_live_socket(runtime: Runtime, socket: WebSocket) {
    let hub = runtime.hub().clone();
    let (id, mut outbound) = hub.register_connection();
    let (mut writer, mut reader) = socket.split();

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let message = match frame {
                OutboundFrame::Text(text) => Message::Text(text.into()),
                OutboundFrame::Ping => Message::Ping(Bytes::new()),
            };
            if writer.send(message).await.is_err() {
                break;
            }
        }
        let _ = writer.send(Message::Close(None)).await;
    });

    hub.send_to(
        &id,
        &ServerMsg::Connected {
            id: id.clone(),
            timestamp: now_millis(),
        },
    );
    hub.mark_open(&id);
    log::info!("live connection {id} open");

    while let Some(message) = reader.next().await {
        match message {
            Ok(Message::Text(text)) => {
                hub.mark_seen(&id);
                match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(msg) => hub.handle_client_msg(&id, msg),
                    Err(err) => log::debug!("ignoring malformed frame from {id}: {err}"),
                }
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_)) => hub.mark_seen(&id),
            Ok(Message::Close(_)) => break,
            Err(err) => {
                log::debug!("read error on live connection {id}: {err}");
                break;
            }
        }
    }

    hub.disconnect(&id);
    let _ = writer_task.await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_errors_map_to_404() {
        assert_eq!(
            error_status(&RuntimeError::UnknownNotifier("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_status(&RuntimeError::UnknownCallback("x".into())),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn panics_map_to_500_and_bad_input_to_400() {
        let panicked = RuntimeError::HandlerPanicked {
            callback_id: "cb".into(),
            widget_id: "w".into(),
            event_kind: "press".into(),
            message: "boom".into(),
        };
        assert_eq!(error_status(&panicked), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            error_status(&RuntimeError::MalformedPayload("bad".into())),
            StatusCode::BAD_REQUEST
        );
    }
}
