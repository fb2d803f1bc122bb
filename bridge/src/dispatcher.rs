//! HTTP front end of the engine server.
//!
//! `GET /` serves the registry description. `POST /` runs one command.
//! Resolution problems (missing or unknown `cmd`) answer 200 with an
//! `error` body while execution failures answer 400 with `error` and
//! `traceback`; existing callers depend on that split.

use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::descriptor::RegistryDescription;
use crate::errors::MethodError;
use crate::protocol::{
    error_body, execution_error_body, is_json_content_type, unknown_command_message, RpcRequest,
    MISSING_COMMAND_MESSAGE,
};
use crate::registry::MethodRegistry;

#[derive(Clone)]
struct ServerState {
    registry: Arc<MethodRegistry>,
    job_lock: Arc<Mutex<()>>,
}

pub fn router(registry: Arc<MethodRegistry>) -> Router {
    let state = ServerState {
        registry,
        job_lock: Arc::new(Mutex::new(())),
    };
    Router::new()
        .route("/", get(list_methods).post(run_method))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

/// Serves `registry` on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<MethodRegistry>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, methods = registry.method_names().count(), "engine server listening");
    axum::serve(listener, router(registry))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!(%addr, "engine server stopped");
    Ok(())
}

/// Binds the loopback interface only; the server is never reachable from
/// other machines.
pub async fn bind_local(port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], port))).await
}

async fn list_methods(State(state): State<ServerState>) -> Json<RegistryDescription> {
    Json(state.registry.describe_all())
}

async fn run_method(
    State(state): State<ServerState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if !is_json_content_type(content_type) {
        warn!(content_type, "rejecting request with non-JSON content type");
        return StatusCode::BAD_REQUEST.into_response();
    }

    let fields = match serde_json::from_slice(&body) {
        Ok(Value::Object(fields)) => fields,
        Ok(other) => {
            return request_failure(MethodError::type_error(format!(
                "request body must be a JSON object, not {}",
                json_type_name(&other)
            )))
        }
        Err(err) => return request_failure(MethodError::from(err)),
    };
    if !fields.contains_key("cmd") {
        return (StatusCode::OK, Json(error_body(MISSING_COMMAND_MESSAGE))).into_response();
    }
    let request: RpcRequest = match serde_json::from_value(Value::Object(fields)) {
        Ok(request) => request,
        Err(err) => return request_failure(MethodError::type_error(err.to_string())),
    };

    let request_id = Uuid::new_v4();
    let span = info_span!("rpc", %request_id, cmd = %request.cmd);
    dispatch(state, request).instrument(span).await
}

async fn dispatch(state: ServerState, request: RpcRequest) -> Response {
    let RpcRequest { cmd, args, kwargs } = request;
    let outcome = {
        let _job = state.job_lock.lock().await;
        state.registry.invoke(&cmd, args, kwargs).await
    };
    match outcome {
        None => {
            warn!("no registered method");
            (StatusCode::OK, Json(error_body(&unknown_command_message(&cmd)))).into_response()
        }
        Some(Ok(result)) => {
            info!("method completed");
            (StatusCode::OK, Json(Value::Object(result))).into_response()
        }
        Some(Err(err)) => {
            let traceback = format_traceback(&format!("server method `{cmd}`"), &err);
            error!(error = %err, kind = err.kind(), %traceback, "method raised");
            let body = execution_error_body(&err.to_string(), &traceback);
            (StatusCode::BAD_REQUEST, Json(body)).into_response()
        }
    }
}

fn request_failure(err: MethodError) -> Response {
    let traceback = format_traceback("request decoding", &err);
    error!(error = %err, %traceback, "malformed request");
    let body = execution_error_body(&err.to_string(), &traceback);
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

/// Renders `err` and its source chain as traceback text ending with a
/// `<Kind>: <message>` line.
pub fn format_traceback(location: &str, err: &MethodError) -> String {
    let mut lines = vec![
        "Traceback (most recent call last):".to_string(),
        format!("  in {location}"),
    ];
    let mut source = err.source();
    while let Some(cause) = source {
        lines.push(format!("  caused by: {cause}"));
        source = cause.source();
    }
    lines.push(format!("{}: {err}", err.kind()));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn traceback_ends_with_kind_and_message() {
        let err = MethodError::value("bad input");
        let traceback = format_traceback("server method `m`", &err);
        assert!(traceback.starts_with("Traceback (most recent call last):"));
        assert!(traceback.contains("server method `m`"));
        assert!(traceback.ends_with("ValueError: bad input"));
    }

    #[test]
    fn traceback_lists_sources() {
        let inner = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let err = MethodError::Other(anyhow::Error::new(inner).context("writing output"));
        let traceback = format_traceback("server method `m`", &err);
        assert!(traceback.contains("caused by: denied"));
        assert!(traceback.ends_with("RuntimeError: writing output: denied"));
    }
}
