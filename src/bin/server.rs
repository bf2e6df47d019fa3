#![forbid(unsafe_code)]

//! HTTP front end for the conversion service.
//!
//! Submissions answer immediately with a job id; clients poll the status
//! route until the artifact is ready and then fetch it from `/downloads`.

use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Form, Json, Router,
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path as AxumPath, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use clap::Parser;
use mediaconv::config::{RuntimeOverrides, resolve_runtime_settings};
use mediaconv::error::ConvertError;
use mediaconv::identifier::JobIdentifier;
use mediaconv::invoker::ToolConverter;
use mediaconv::profile::Profile;
use mediaconv::service::{ArtifactDownload, ConversionService};
use mediaconv::status::StatusPayload;
use mediaconv::store::{InMemoryJobStore, JobStore};
use serde::{Deserialize, Serialize};
use tokio::{fs::File, signal};
use tokio_util::io::ReaderStream;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

/// Serves conversion jobs over HTTP.
#[derive(Parser, Debug)]
#[command(name = "mediaconv-server", version, about)]
struct ServerArgs {
    /// Directory holding finished artifacts.
    #[arg(long)]
    downloads_dir: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Seconds between the first download of a file and its deletion.
    #[arg(long)]
    cleanup_delay_secs: Option<u64>,

    /// `.env` file with `MEDIACONV_*` settings.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl ServerArgs {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            downloads_dir: self.downloads_dir,
            host: self.host,
            port: self.port,
            cleanup_delay_secs: self.cleanup_delay_secs,
            env_path: self.env_file,
        }
    }
}

#[derive(Clone)]
struct AppState {
    service: Arc<ConversionService>,
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    url: String,
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    filename: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    id: String,
    status_url: String,
}

impl SubmitResponse {
    fn new(profile: Profile, id: &JobIdentifier) -> Self {
        Self {
            id: id.to_string(),
            status_url: status_url(profile, id),
        }
    }
}

fn status_url(profile: Profile, id: &JobIdentifier) -> String {
    format!("/api/jobs/{}/{id}", profile.slug())
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<ConvertError> for ApiError {
    fn from(err: ConvertError) -> Self {
        let status = match &err {
            ConvertError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ConvertError::NotFound(_) => StatusCode::NOT_FOUND,
            ConvertError::ArtifactMissing => StatusCode::CONFLICT,
            ConvertError::InvocationFailure { .. } | ConvertError::Io { .. } => {
                error!(error = %err, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = ServerArgs::parse();
    let settings =
        resolve_runtime_settings(args.into_overrides()).context("resolving runtime settings")?;

    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let converter = Arc::new(ToolConverter::new(&settings));
    let service = ConversionService::new(&settings, store, converter)
        .with_context(|| format!("preparing {}", settings.downloads_dir.display()))?;
    let service = Arc::new(service);
    let _sweeper = service.spawn_retention_sweeper();

    let host: IpAddr = settings
        .host
        .parse()
        .with_context(|| format!("invalid listen host '{}'", settings.host))?;
    let addr = SocketAddr::new(host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(
        %addr,
        downloads = %settings.downloads_dir.display(),
        cleanup_delay_secs = settings.cleanup_delay.as_secs(),
        "conversion server listening"
    );

    axum::serve(listener, router(AppState { service }))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running conversion server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/jobs/{profile}", post(submit_job))
        .route("/api/jobs/{profile}/{id}", get(job_status))
        .route(
            "/api/uploads/{profile}",
            post(submit_upload).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/downloads/{file}", get(download_artifact))
        .route("/{profile}", post(submit_form))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to install Ctrl+C handler");
    }
}

async fn submit_job(
    State(state): State<AppState>,
    AxumPath(profile): AxumPath<String>,
    Json(request): Json<SubmitRequest>,
) -> ApiResult<Json<SubmitResponse>> {
    let profile = Profile::parse(&profile)?;
    let id = state.service.submit(profile, &request.url)?;
    Ok(Json(SubmitResponse::new(profile, &id)))
}

/// Plain HTML form variant of [`submit_job`]: redirects to the status URL.
async fn submit_form(
    State(state): State<AppState>,
    AxumPath(profile): AxumPath<String>,
    Form(request): Form<SubmitRequest>,
) -> ApiResult<Redirect> {
    let profile = Profile::parse(&profile)?;
    let id = state.service.submit(profile, &request.url)?;
    Ok(Redirect::to(&status_url(profile, &id)))
}

async fn submit_upload(
    State(state): State<AppState>,
    AxumPath(profile): AxumPath<String>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> ApiResult<Json<SubmitResponse>> {
    let profile = Profile::parse(&profile)?;
    let service = state.service.clone();
    let id = tokio::task::spawn_blocking(move || {
        service.submit_upload(profile, &query.filename, &body)
    })
    .await
    .map_err(|err| ApiError::internal(format!("upload task failed: {err}")))??;
    Ok(Json(SubmitResponse::new(profile, &id)))
}

async fn job_status(
    State(state): State<AppState>,
    AxumPath((profile, id)): AxumPath<(String, String)>,
) -> ApiResult<Json<StatusPayload>> {
    let profile = Profile::parse(&profile)?;
    let id = JobIdentifier::parse(&id)?;
    Ok(Json(state.service.poll(profile, &id)))
}

async fn download_artifact(
    State(state): State<AppState>,
    AxumPath(file): AxumPath<String>,
) -> ApiResult<Response> {
    let download = state.service.download_by_file_name(&file)?;
    stream_file(download).await
}

async fn stream_file(download: ArtifactDownload) -> ApiResult<Response> {
    let file = File::open(&download.path)
        .await
        .map_err(|_| ConvertError::NotFound("file not found or already deleted".into()))?;
    let size = file
        .metadata()
        .await
        .map_err(|err| ApiError::internal(format!("reading file metadata: {err}")))?
        .len();

    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(download.content_type.as_ref()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    if let Ok(value) = HeaderValue::from_str(&content_disposition(&download.filename)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}

/// `attachment` header with an ASCII `filename` for old clients and the
/// full UTF-8 name as an RFC 5987 `filename*`.
fn content_disposition(filename: &str) -> String {
    let (stem, extension) = filename.rsplit_once('.').unwrap_or((filename, ""));
    let ascii: String = stem
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    let ascii = if ascii.is_empty() { "download" } else { &ascii };
    let fallback = if extension.is_empty() {
        ascii.to_string()
    } else {
        format!("{ascii}.{extension}")
    };
    let encoded: String = url::form_urlencoded::byte_serialize(filename.as_bytes()).collect();
    format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}
