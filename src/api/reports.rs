use std::collections::HashMap;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};

use crate::core::state::AppState;
use crate::progress::session::normalize_exam_code;
use crate::progress::unknown_images::decoded_filename;
use crate::services::storage;

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/unknown-images/:exam_code", get(unknown_images).delete(clear_unknown_images))
}

/// Merges the in-memory cache with a live listing of the exam's
/// unattributed bucket in S3, deduplicated by decoded filename. The S3
/// listing comes last so freshly signed URLs win over cached ones.
async fn unknown_images(
    State(state): State<AppState>,
    Path(exam_code): Path<String>,
) -> Json<Vec<String>> {
    let code = normalize_exam_code(&exam_code);
    let memory_urls = state.unknown_images().get(&code);

    let mut s3_urls = Vec::new();
    if let Some(storage_service) = state.storage() {
        let expiry =
            Duration::from_secs(state.settings().progress().presigned_url_expire_minutes * 60);
        match storage_service.list_keys(&storage::unknown_id_prefix(&code)).await {
            Ok(keys) => {
                for key in keys {
                    match storage_service.presign_get(&key, expiry).await {
                        Ok(url) => s3_urls.push(url),
                        Err(err) => {
                            tracing::warn!(error = %err, key, "Failed to presign unknown image");
                        }
                    }
                }
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    exam_code = %code,
                    "Failed to list unknown images from S3"
                );
            }
        }
    }

    let mut order = Vec::new();
    let mut by_filename: HashMap<String, String> = HashMap::new();
    for url in memory_urls.into_iter().chain(s3_urls) {
        if let Some(filename) = decoded_filename(&url) {
            if !by_filename.contains_key(&filename) {
                order.push(filename.clone());
            }
            by_filename.insert(filename, url);
        }
    }

    let result: Vec<String> =
        order.iter().filter_map(|filename| by_filename.get(filename).cloned()).collect();

    tracing::info!(exam_code = %code, count = result.len(), "Returning unknown images");
    Json(result)
}

/// Dropping the bucket just means the client has reconciled these images
/// by other means; it is safe at any time.
async fn clear_unknown_images(
    State(state): State<AppState>,
    Path(exam_code): Path<String>,
) -> StatusCode {
    state.unknown_images().clear(&exam_code);
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use tower::ServiceExt;

    use crate::test_support;

    #[tokio::test]
    async fn unknown_images_round_trip_through_cache() {
        let ctx = test_support::setup_test_context().await;
        ctx.state
            .unknown_images()
            .save("ABC123", &["https://host/header/ABC123/unknown_id/x.jpg?sig=1".to_string()]);

        let response = ctx
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/reports/unknown-images/abc123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let json = test_support::read_json(response).await;
        let urls = json.as_array().expect("url list");
        assert_eq!(urls.len(), 1);
        assert!(urls[0].as_str().unwrap().contains("x.jpg"));
    }

    #[tokio::test]
    async fn clearing_unknown_images_empties_the_bucket() {
        let ctx = test_support::setup_test_context().await;
        ctx.state
            .unknown_images()
            .save("ABC123", &["https://host/header/ABC123/unknown_id/x.jpg".to_string()]);

        let response = ctx
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::DELETE)
                    .uri("/api/v1/reports/unknown-images/ABC123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        assert!(ctx.state.unknown_images().get("ABC123").is_empty());
    }
}
