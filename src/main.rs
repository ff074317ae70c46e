use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        DefaultBodyLimit, Multipart, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{self, CorsLayer},
    trace::TraceLayer,
};

mod config;
mod extract;
mod models;

use config::Config;
use extract::Mode;
use models::{ConvertResponse, ErrorResponse};

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

static UNSAFE_FILENAME_CHARS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9_.-]").unwrap());

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    client: reqwest::Client,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    tracing::debug!(?config, "loaded configuration");

    let client = extract::build_client(&config).context("failed to build HTTP client")?;
    let addr = SocketAddr::new(config.host, config.port);
    let state = AppState {
        config: Arc::new(config),
        client,
    };

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    let max_upload_bytes = state.config.max_upload_bytes;

    Router::new()
        .route("/health", get(health))
        .route(
            "/api/convert",
            post(convert_endpoint).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods(cors::Any)
                .allow_headers(cors::Any),
        )
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutting down");
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Convert endpoint ─────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
enum ConvertError {
    #[error("No file part in the request")]
    MissingFilePart,
    #[error("No selected file")]
    NoSelectedFile,
    #[error("Uploaded file is too large")]
    PayloadTooLarge,
    #[error("Failed to extract data from the image. The API might have returned an empty response or an error.")]
    ExtractionFailed,
    #[error("An unexpected error occurred")]
    Unexpected,
}

impl ConvertError {
    fn status(&self) -> StatusCode {
        match self {
            ConvertError::MissingFilePart | ConvertError::NoSelectedFile => StatusCode::BAD_REQUEST,
            ConvertError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ConvertError::ExtractionFailed | ConvertError::Unexpected => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ConvertError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

fn handle_panic(_err: Box<dyn Any + Send + 'static>) -> Response {
    tracing::error!("handler panicked");
    ConvertError::Unexpected.into_response()
}

struct Upload {
    filename: String,
    mime_type: String,
    bytes: axum::body::Bytes,
}

async fn convert_endpoint(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<ConvertResponse>, ConvertError> {
    let mut multipart = multipart.map_err(|rejection| {
        tracing::debug!(%rejection, "request is not multipart");
        ConvertError::MissingFilePart
    })?;

    let mut upload: Option<Upload> = None;
    let mut detect_table: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(multipart_error)?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" if upload.is_none() => {
                // A part without a filename is a plain form value, not a file.
                let Some(filename) = field.file_name().map(str::to_string) else {
                    continue;
                };
                let mime_type = field
                    .content_type()
                    .unwrap_or(DEFAULT_MIME_TYPE)
                    .to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(multipart_error)?;
                upload = Some(Upload {
                    filename,
                    mime_type,
                    bytes,
                });
            }
            "detectTable" if detect_table.is_none() => {
                let value = field
                    .text()
                    .await
                    .map_err(multipart_error)?;
                detect_table = Some(value);
            }
            _ => {}
        }
    }

    let upload = upload.ok_or(ConvertError::MissingFilePart)?;
    if upload.filename.is_empty() {
        return Err(ConvertError::NoSelectedFile);
    }

    let mode = Mode::from_form_value(detect_table.as_deref());
    tracing::info!(
        filename = %sanitize_filename(&upload.filename),
        mime_type = %upload.mime_type,
        size = upload.bytes.len(),
        ?mode,
        "converting upload"
    );

    match extract::extract_data(
        &state.client,
        &state.config,
        &upload.bytes,
        &upload.mime_type,
        mode,
    )
    .await
    {
        Some(data) => Ok(Json(ConvertResponse { data })),
        None => Err(ConvertError::ExtractionFailed),
    }
}

/// Malformed or truncated bodies are client input errors.
fn multipart_error(e: MultipartError) -> ConvertError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        tracing::warn!(error = %e, "upload exceeds body limit");
        ConvertError::PayloadTooLarge
    } else {
        tracing::warn!(error = %e, "failed to read multipart body");
        ConvertError::MissingFilePart
    }
}

/// Reduces a caller-supplied filename to a safe ASCII token for log output.
fn sanitize_filename(name: &str) -> String {
    let ascii: String = name
        .chars()
        .filter(char::is_ascii)
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();
    let joined = ascii.split_whitespace().collect::<Vec<_>>().join("_");
    UNSAFE_FILENAME_CHARS_RE
        .replace_all(&joined, "")
        .trim_matches(|c: char| c == '.' || c == '_')
        .to_string()
}
