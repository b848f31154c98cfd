use axum::{
    Router,
    extract::Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::control::ControlFile;
use crate::core::{GlidePathError, evaluate, optimize};

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct EvaluatePayload {
    #[serde(flatten)]
    control: ControlFile,
    with_gradient: bool,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = Router::new()
        .route("/api/evaluate", post(evaluate_handler))
        .route("/api/optimize", post(optimize_handler))
        .fallback(not_found_handler);

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "glide-path HTTP API listening");

    axum::serve(listener, app).await
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn evaluate_handler(Json(payload): Json<EvaluatePayload>) -> Response {
    let (config, path) = match payload
        .control
        .build_config()
        .and_then(|config| Ok((config, payload.control.initial_path()?)))
    {
        Ok(parts) => parts,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    let with_gradient = payload.with_gradient;
    run_blocking(move || evaluate(&config, &path, with_gradient)).await
}

async fn optimize_handler(Json(control): Json<ControlFile>) -> Response {
    let (config, path) = match control
        .build_config()
        .and_then(|config| Ok((config, control.initial_path()?)))
    {
        Ok(parts) => parts,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };
    run_blocking(move || optimize(&config, &path)).await
}

/// Runs numerical work off the async executor and maps its outcome to a response.
async fn run_blocking<T, F>(work: F) -> Response
where
    T: Serialize + Send + 'static,
    F: FnOnce() -> Result<T, GlidePathError> + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(Ok(body)) => json_response(StatusCode::OK, body),
        Ok(Err(err)) => error_response(status_for(&err), &err.to_string()),
        Err(join) => {
            error!(%join, "worker task failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

fn status_for(err: &GlidePathError) -> StatusCode {
    match err {
        GlidePathError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}
