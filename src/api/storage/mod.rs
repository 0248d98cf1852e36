use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;

use crate::api::errors::ApiError;
use crate::core::state::AppState;
use crate::progress::session::{normalize_exam_code, SessionSnapshot};
use crate::schemas::storage::{
    BatchPresignRequest, BatchPresignResponse, BatchPresignedUrl, PresignRequest, PresignResponse,
    PushEventRequest, PushEventResponse,
};
use crate::services::storage;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/sse/connect", get(connect_sse))
        .route("/sse/events/:exam_code", post(push_event))
        .route("/active-processes", get(active_processes))
        .route("/active-processes/:exam_code", delete(stop_process))
        .route("/progress/:exam_code", get(process_progress))
        .route("/presigned-url", post(create_presigned_url))
        .route("/presigned-urls/batch", post(create_batch_presigned_urls))
        .route("/presigned-url/attendance", get(attendance_upload_url))
        .route("/attendance/download-url", get(attendance_download_url))
}

fn default_exam_name() -> String {
    "Unknown".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectQuery {
    exam_code: String,
    #[serde(default = "default_exam_name")]
    exam_name: String,
    #[serde(default)]
    total: u32,
}

async fn connect_sse(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
) -> impl IntoResponse {
    tracing::info!(exam_code = %query.exam_code, total = query.total, "SSE connect");

    let rx = state.broadcaster().connect(&query.exam_code, &query.exam_name, query.total).await;
    let keep_alive = Duration::from_secs(state.settings().progress().sse_keep_alive_seconds);

    let stream = ReceiverStream::new(rx).filter_map(|message| async move {
        Event::default()
            .event(message.event.as_str())
            .json_data(&message.data)
            .ok()
            .map(Ok::<_, Infallible>)
    });

    let sse = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(keep_alive).text("keep-alive"));

    // Reverse proxies must not buffer the event stream.
    ([("cache-control", "no-cache"), ("x-accel-buffering", "no")], sse)
}

async fn push_event(
    State(state): State<AppState>,
    Path(exam_code): Path<String>,
    Json(payload): Json<PushEventRequest>,
) -> Result<Json<PushEventResponse>, ApiError> {
    if payload.event.trim().is_empty() {
        return Err(ApiError::BadRequest("event name must not be empty".to_string()));
    }

    let delivered = state.broadcaster().send(&exam_code, &payload.event, payload.data);
    Ok(Json(PushEventResponse { delivered }))
}

async fn active_processes(State(state): State<AppState>) -> Json<Vec<SessionSnapshot>> {
    Json(state.broadcaster().active_sessions().await)
}

async fn process_progress(
    State(state): State<AppState>,
    Path(exam_code): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    match state.broadcaster().session(&exam_code).await {
        Some(snapshot) => Ok(Json(snapshot)),
        None => Err(ApiError::NotFound(format!("No active session for {exam_code}"))),
    }
}

async fn stop_process(State(state): State<AppState>, Path(exam_code): Path<String>) -> StatusCode {
    state.broadcaster().remove(&exam_code).await;
    StatusCode::OK
}

async fn create_presigned_url(
    State(state): State<AppState>,
    Json(payload): Json<PresignRequest>,
) -> Result<Json<PresignResponse>, ApiError> {
    let storage_service = state
        .storage()
        .ok_or_else(|| ApiError::ServiceUnavailable("S3 storage not configured".to_string()))?;

    let Some(ext) = storage::image_extension(&payload.content_type) else {
        return Err(ApiError::BadRequest("Only PNG/JPG/JPEG allowed".to_string()));
    };

    let exam_code = normalize_exam_code(&payload.exam_code);
    let key = storage::upload_key(&exam_code, payload.student_id, payload.index, ext);
    let url = storage_service
        .presign_put(&key, canonical_image_type(&payload.content_type), presign_expiry(&state))
        .await
        .map_err(|err| ApiError::internal(err, "Failed to presign upload URL"))?;

    Ok(Json(PresignResponse {
        exam_code,
        student_id: payload.student_id,
        total_index: payload.total_index,
        index: payload.index,
        url,
    }))
}

async fn create_batch_presigned_urls(
    State(state): State<AppState>,
    Json(payload): Json<BatchPresignRequest>,
) -> Result<Json<BatchPresignResponse>, ApiError> {
    let storage_service = state
        .storage()
        .ok_or_else(|| ApiError::ServiceUnavailable("S3 storage not configured".to_string()))?;

    let exam_code = normalize_exam_code(&payload.exam_code);
    let mut urls = Vec::with_capacity(payload.images.len());

    for image in &payload.images {
        if storage::image_extension(&image.content_type).is_none() {
            return Err(ApiError::BadRequest(format!(
                "Unsupported content type for {}: {}",
                image.filename, image.content_type
            )));
        }

        let key = storage::header_key(&exam_code, &image.filename);
        let url = storage_service
            .presign_put(&key, canonical_image_type(&image.content_type), presign_expiry(&state))
            .await
            .map_err(|err| ApiError::internal(err, "Failed to presign upload URL"))?;

        urls.push(BatchPresignedUrl { index: image.index, filename: image.filename.clone(), url });
    }

    Ok(Json(BatchPresignResponse { exam_code, urls }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttendanceUploadQuery {
    exam_code: String,
    content_type: String,
}

async fn attendance_upload_url(
    State(state): State<AppState>,
    Query(query): Query<AttendanceUploadQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let storage_service = state
        .storage()
        .ok_or_else(|| ApiError::ServiceUnavailable("S3 storage not configured".to_string()))?;

    if !matches!(
        query.content_type.as_str(),
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            | "application/vnd.ms-excel"
    ) {
        return Err(ApiError::BadRequest("Only XLSX attendance files allowed".to_string()));
    }

    let exam_code = normalize_exam_code(&query.exam_code);
    let key = storage::attendance_key(&exam_code);
    let url = storage_service
        .presign_put(&key, &query.content_type, presign_expiry(&state))
        .await
        .map_err(|err| ApiError::internal(err, "Failed to presign attendance upload"))?;

    Ok(Json(json!({ "url": url })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttendanceDownloadQuery {
    exam_code: String,
}

async fn attendance_download_url(
    State(state): State<AppState>,
    Query(query): Query<AttendanceDownloadQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let storage_service = state
        .storage()
        .ok_or_else(|| ApiError::ServiceUnavailable("S3 storage not configured".to_string()))?;

    let exam_code = normalize_exam_code(&query.exam_code);
    let key = storage::attendance_key(&exam_code);
    let url = storage_service
        .presign_get(&key, presign_expiry(&state))
        .await
        .map_err(|err| ApiError::internal(err, "Failed to presign attendance download"))?;

    Ok(Json(json!({ "url": url })))
}

fn presign_expiry(state: &AppState) -> Duration {
    Duration::from_secs(state.settings().progress().presigned_url_expire_minutes * 60)
}

fn canonical_image_type(content_type: &str) -> &str {
    if content_type == "image/jpg" {
        "image/jpeg"
    } else {
        content_type
    }
}
