//! HTTP control API for sandbox management.
//!
//! Every `/api/v1/*` route requires an API key (`X-API-Key` or
//! `Authorization: Bearer`). Success responses wrap their payload in
//! `{"data": ...}`; failures use `{"error": {"code", "message"}}`.

use anyhow::Result;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::aggregator;
use crate::api_keys::ApiKeyStore;
use crate::exec;
use crate::lifecycle::SandboxController;
use crate::spec::SandboxSpec;

type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, hyper::Error>;

fn full<T: Into<bytes::Bytes>>(chunk: T) -> BoxBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Shared state for the HTTP server.
pub struct AppState {
    pub controller: SandboxController,
    pub keys: ApiKeyStore,
}

fn error_code(status: StatusCode) -> &'static str {
    match status.as_u16() {
        400 => "BadRequest",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "NotFound",
        409 => "Conflict",
        422 => "UnprocessableEntity",
        500 => "InternalServerError",
        _ => "Error",
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<BoxBody> {
    let body = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(full(body))
        .unwrap()
}

fn data_response<T: Serialize>(status: StatusCode, data: &T) -> Response<BoxBody> {
    json_response(status, &serde_json::json!({ "data": data }))
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response<BoxBody> {
    json_response(
        status,
        &serde_json::json!({
            "error": { "code": error_code(status), "message": message.into() }
        }),
    )
}

/// Pull a single query parameter out of the request URI.
fn query_param(req: &Request<Incoming>, key: &str) -> Option<String> {
    req.uri().query()?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key && !v.is_empty()).then(|| v.to_string())
    })
}

/// Extract the presented API token from either auth header.
fn bearer_token(req: &Request<Incoming>) -> Option<String> {
    if let Some(value) = req.headers().get("x-api-key") {
        let token = value.to_str().ok()?.trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    let value = req.headers().get("authorization")?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    (scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty())
        .then(|| token.trim().to_string())
}

fn authenticate(req: &Request<Incoming>, keys: &ApiKeyStore) -> Result<(), Response<BoxBody>> {
    let Some(token) = bearer_token(req) else {
        return Err(error_response(StatusCode::UNAUTHORIZED, "Missing API key"));
    };
    keys.verify(&token)
        .map(|_| ())
        .map_err(|err| error_response(StatusCode::UNAUTHORIZED, err.to_string()))
}

async fn read_json_body(req: Request<Incoming>) -> Result<serde_json::Value, Response<BoxBody>> {
    let bytes = req
        .collect()
        .await
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "Failed to read body"))?
        .to_bytes();
    serde_json::from_slice(&bytes)
        .map_err(|err| error_response(StatusCode::BAD_REQUEST, format!("Invalid JSON: {}", err)))
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let namespace = query_param(&req, "namespace");

    // Root and health are the only unauthenticated routes.
    let response = match (&method, segments.as_slice()) {
        (&Method::GET, []) => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "message": "K7 Sandbox API",
                "version": env!("CARGO_PKG_VERSION"),
            }),
        ),
        (&Method::GET, ["health"]) => {
            json_response(StatusCode::OK, &serde_json::json!({"status": "healthy"}))
        }
        (_, ["api", "v1", rest @ ..]) => {
            if let Err(response) = authenticate(&req, &state.keys) {
                return Ok(response);
            }
            match (&method, rest) {
                (&Method::POST, ["sandboxes"]) => handle_create(req, state).await,
                (&Method::GET, ["sandboxes", "metrics"]) => {
                    handle_metrics(state, namespace.as_deref()).await
                }
                (&Method::GET, ["sandboxes"]) => handle_list(state, namespace.as_deref()).await,
                (&Method::GET, ["sandboxes", name]) => {
                    handle_get(state, name, namespace.as_deref()).await
                }
                (&Method::DELETE, ["sandboxes"]) => {
                    handle_delete_all(state, namespace.as_deref()).await
                }
                (&Method::DELETE, ["sandboxes", name]) => {
                    handle_delete(state, name, namespace.as_deref()).await
                }
                (&Method::POST, ["sandboxes", name, "exec"]) => {
                    let name = name.to_string();
                    handle_exec(req, state, &name, namespace.as_deref()).await
                }
                _ => error_response(StatusCode::NOT_FOUND, "Not found"),
            }
        }
        _ => error_response(StatusCode::NOT_FOUND, "Not found"),
    };

    Ok(response)
}

async fn handle_create(req: Request<Incoming>, state: Arc<AppState>) -> Response<BoxBody> {
    let body = match read_json_body(req).await {
        Ok(body) => body,
        Err(response) => return response,
    };
    let spec = match SandboxSpec::from_json_lenient(&body) {
        Ok(spec) => spec,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, err.to_string()),
    };

    let result = state.controller.create_sandbox(&spec, None).await;
    if !result.success {
        let status = if result.error.contains("already exists") {
            StatusCode::CONFLICT
        } else {
            StatusCode::BAD_REQUEST
        };
        return error_response(status, result.error);
    }

    let location = format!(
        "/api/v1/sandboxes/{}?namespace={}",
        spec.name, spec.namespace
    );
    let body = serde_json::json!({
        "data": {
            "name": spec.name,
            "namespace": spec.namespace,
            "image": spec.image,
        }
    });
    Response::builder()
        .status(StatusCode::CREATED)
        .header("Content-Type", "application/json")
        .header("Location", location)
        .body(full(body.to_string()))
        .unwrap()
}

async fn handle_list(state: Arc<AppState>, namespace: Option<&str>) -> Response<BoxBody> {
    let sandboxes = aggregator::list_sandboxes(state.controller.gateway(), namespace).await;
    data_response(StatusCode::OK, &sandboxes)
}

async fn handle_metrics(state: Arc<AppState>, namespace: Option<&str>) -> Response<BoxBody> {
    let metrics = aggregator::get_metrics(state.controller.gateway(), namespace).await;
    data_response(StatusCode::OK, &metrics)
}

async fn handle_get(
    state: Arc<AppState>,
    name: &str,
    namespace: Option<&str>,
) -> Response<BoxBody> {
    let namespace = namespace.unwrap_or("default");
    let sandboxes = aggregator::list_sandboxes(state.controller.gateway(), Some(namespace)).await;
    match sandboxes.into_iter().find(|s| s.name == name) {
        Some(info) => data_response(StatusCode::OK, &info),
        None => error_response(
            StatusCode::NOT_FOUND,
            format!("Sandbox {} not found in namespace {}", name, namespace),
        ),
    }
}

async fn handle_delete(
    state: Arc<AppState>,
    name: &str,
    namespace: Option<&str>,
) -> Response<BoxBody> {
    let namespace = namespace.unwrap_or("default");
    let result = state.controller.delete_sandbox(name, namespace).await;
    if result.success {
        data_response(StatusCode::OK, &serde_json::json!({"message": result.message}))
    } else {
        error_response(StatusCode::BAD_REQUEST, result.error)
    }
}

async fn handle_delete_all(state: Arc<AppState>, namespace: Option<&str>) -> Response<BoxBody> {
    let namespace = namespace.unwrap_or("default");
    let result = state.controller.delete_all_sandboxes(namespace).await;
    if result.success {
        data_response(
            StatusCode::OK,
            &serde_json::json!({"message": result.message, "results": result.data}),
        )
    } else {
        error_response(StatusCode::BAD_REQUEST, result.error)
    }
}

async fn handle_exec(
    req: Request<Incoming>,
    state: Arc<AppState>,
    name: &str,
    namespace: Option<&str>,
) -> Response<BoxBody> {
    let body = match read_json_body(req).await {
        Ok(body) => body,
        Err(response) => return response,
    };
    let command = body
        .get("command")
        .and_then(|value| value.as_str())
        .unwrap_or_default();
    if command.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Command is required");
    }

    let namespace = namespace.unwrap_or("default");
    let result = exec::exec_command(state.controller.gateway(), name, command, namespace).await;
    data_response(StatusCode::OK, &result)
}

/// Run the HTTP API server until the process is stopped.
pub async fn run_server(addr: SocketAddr, state: AppState) -> Result<()> {
    let state = Arc::new(state);
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "k7 API server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let state = state.clone();
                handle_request(req, state)
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                error!(?err, "error serving connection");
            }
        });
    }
}
