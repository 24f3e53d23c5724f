//! Defines the Axum API routes and handlers.

use crate::file_manager::FileManager;
use crate::host::PlotterHost;
use crate::queue::DEFAULT_LIST_LIMIT;
use crate::web::middleware::{api_key_middleware, rate_limit_middleware};
use crate::web::rate_limiter::RateLimiter;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use plotq_shared::api_models::{HealthResponse, JobResponse, JobSubmitResponse, ListJobsQuery, MessageResponse};
use plotq_shared::config::Config;
use plotq_shared::{DeviceStatus, JobError, JobParameters};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Room left in the request body limit for the form fields around the file.
const FORM_OVERHEAD_BYTES: usize = 64 * 1024;

pub struct AppStateInner {
    pub host: Arc<PlotterHost>,
    pub files: FileManager,
    pub api_key: Option<String>,
    pub max_queue_size: usize,
    pub max_upload_bytes: usize,
    pub rate_limiter: Option<RateLimiter>,
}

pub type AppState = Arc<AppStateInner>;

impl AppStateInner {
    pub fn from_config(host: Arc<PlotterHost>, config: &Config) -> Self {
        let rate_limiter = config.api.rate_limit_enabled.then(|| {
            RateLimiter::new(
                config.api.rate_limit_requests,
                Duration::from_secs(config.api.rate_limit_window_secs),
            )
        });
        Self {
            files: host.queue().files().clone(),
            host,
            api_key: config.api.api_key.clone(),
            max_queue_size: config.queue.max_queue_size,
            max_upload_bytes: config.queue.max_file_size_bytes(),
            rate_limiter,
        }
    }
}

pub fn json_error(message: &str, status: StatusCode) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Handler error carrying the status code it maps to.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        let status = match &err {
            JobError::NotFound(_) => StatusCode::NOT_FOUND,
            JobError::InvalidState(_) => StatusCode::BAD_REQUEST,
            JobError::DeviceBusy => StatusCode::CONFLICT,
            JobError::QueueFull(_) => StatusCode::TOO_MANY_REQUESTS,
            JobError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            JobError::Storage(_) | JobError::DeviceFailure(_) => {
                tracing::error!("Request failed: {}", err);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = match err {
            JobError::Unsupported(operation) => format!("{} not implemented", capitalize(&operation)),
            other => other.to_string(),
        };
        Self::new(status, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        json_error(&self.message, self.status)
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Creates the Axum router with every endpoint nested under `prefix`.
pub fn create_router(state: AppState, prefix: &str) -> Router {
    let protected = Router::new()
        .route("/jobs", post(submit_job).get(list_jobs))
        .route("/jobs/{id}", get(get_job).delete(delete_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/plotter/status", get(plotter_status))
        .route("/plotter/pause", post(pause_plotter))
        .route("/plotter/resume", post(resume_plotter))
        .route("/plotter/cancel", post(cancel_plotter))
        .route_layer(middleware::from_fn_with_state(state.clone(), api_key_middleware));

    let api = Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(DefaultBodyLimit::max(state.max_upload_bytes + FORM_OVERHEAD_BYTES))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit_middleware))
        .with_state(state);

    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        api
    } else {
        Router::new().nest(prefix, api)
    }
}

#[derive(Default)]
struct SubmitForm {
    file: Option<(String, Vec<u8>)>,
    parameters: JobParameters,
}

fn parse_field<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ApiError> {
    value
        .trim()
        .parse()
        .map_err(|_| ApiError::bad_request(format!("invalid value for {name}: {value:?}")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ApiError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        _ => Err(ApiError::bad_request(format!("invalid value for {name}: {value:?}"))),
    }
}

async fn read_form(mut multipart: Multipart) -> Result<SubmitForm, ApiError> {
    let mut form = SubmitForm::default();
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return Err(ApiError::new(e.status(), e.body_text())),
        };
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let filename = field.file_name().unwrap_or_default().to_string();
            let bytes = field.bytes().await.map_err(|e| ApiError::new(e.status(), e.body_text()))?;
            form.file = Some((filename, bytes.to_vec()));
            continue;
        }
        let value = field.text().await.map_err(|e| ApiError::new(e.status(), e.body_text()))?;
        let params = &mut form.parameters;
        match name.as_str() {
            "layers" => params.layers = Some(value).filter(|l| !l.trim().is_empty()),
            "speed" => params.speed = parse_field(&name, &value)?,
            "pen_up_delay" => params.pen_up_delay = parse_field(&name, &value)?,
            "pen_down_delay" => params.pen_down_delay = parse_field(&name, &value)?,
            "preview" => params.preview = parse_bool(&name, &value)?,
            "timeout" => params.timeout = parse_field(&name, &value)?,
            other => tracing::debug!("Ignoring unknown form field {:?}", other),
        }
    }
    Ok(form)
}

async fn submit_job(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<JobSubmitResponse>, ApiError> {
    let form = read_form(multipart).await?;
    let Some((filename, content)) = form.file else {
        return Err(ApiError::bad_request("missing file field"));
    };
    if !filename.to_ascii_lowercase().ends_with(".svg") {
        return Err(ApiError::bad_request("Only SVG files are supported"));
    }
    if content.len() > state.max_upload_bytes {
        return Err(ApiError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("File too large. Max size: {} bytes", state.max_upload_bytes),
        ));
    }
    form.parameters
        .validate()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    // early out before writing the file; the admission check in the host is the binding one
    if state.host.queue().queue_size().await? >= state.max_queue_size {
        return Err(JobError::QueueFull(state.max_queue_size).into());
    }

    let path = state.files.save_upload(&filename, &content).await.map_err(|e| match e {
        crate::file_manager::FileManagerError::InvalidName(_) => ApiError::bad_request(e.to_string()),
        crate::file_manager::FileManagerError::Io(_) => {
            tracing::error!("Saving upload failed: {}", e);
            ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    })?;
    let stored_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or(filename);

    let submitted = state
        .host
        .submit_bounded(&stored_name, path.clone(), form.parameters, state.max_queue_size)
        .await;
    let (job, position) = match submitted {
        Ok(submitted) => submitted,
        Err(e) => {
            state.files.remove_file(&path).await;
            return Err(e.into());
        }
    };
    Ok(Json(JobSubmitResponse {
        job_id: job.id,
        status: job.status,
        created_at: job.created_at,
        position,
    }))
}

async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<Vec<JobResponse>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    let jobs = state.host.jobs(query.status, limit).await?;
    Ok(Json(
        jobs.into_iter()
            .map(|(job, position)| JobResponse::from_job(job, position))
            .collect(),
    ))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<JobResponse>, ApiError> {
    let (job, position) = state.host.job(&id).await?;
    Ok(Json(JobResponse::from_job(job, position)))
}

async fn delete_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<MessageResponse>, ApiError> {
    state.host.delete_job(&id).await?;
    Ok(Json(MessageResponse::new(format!("Job {id} deleted"))))
}

async fn cancel_job(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<MessageResponse>, ApiError> {
    state.host.cancel_job(&id).await?;
    Ok(Json(MessageResponse::new(format!("Job {id} cancelled"))))
}

async fn plotter_status(State(state): State<AppState>) -> Json<DeviceStatus> {
    Json(state.host.device_status())
}

async fn pause_plotter(State(state): State<AppState>) -> Result<Json<MessageResponse>, ApiError> {
    state.host.pause()?;
    Ok(Json(MessageResponse::new("Plotter paused")))
}

async fn resume_plotter(State(state): State<AppState>) -> Result<Json<MessageResponse>, ApiError> {
    state.host.resume()?;
    Ok(Json(MessageResponse::new("Plotter resumed")))
}

async fn cancel_plotter(State(state): State<AppState>) -> Result<Json<MessageResponse>, ApiError> {
    let job = state.host.cancel_current().await?;
    Ok(Json(MessageResponse::new(format!("Job {} cancelled", job.id))))
}

async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    Ok(Json(state.host.health().await?))
}
