use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PresignRequest {
    pub(crate) exam_code: String,
    pub(crate) student_id: i64,
    pub(crate) total_index: u32,
    pub(crate) index: u32,
    pub(crate) content_type: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PresignResponse {
    pub(crate) exam_code: String,
    pub(crate) student_id: i64,
    pub(crate) total_index: u32,
    pub(crate) index: u32,
    pub(crate) url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BatchPresignRequest {
    pub(crate) exam_code: String,
    pub(crate) images: Vec<BatchImageInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BatchImageInfo {
    pub(crate) index: u32,
    pub(crate) content_type: String,
    pub(crate) filename: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BatchPresignResponse {
    pub(crate) exam_code: String,
    pub(crate) urls: Vec<BatchPresignedUrl>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BatchPresignedUrl {
    pub(crate) index: u32,
    pub(crate) filename: String,
    pub(crate) url: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PushEventRequest {
    pub(crate) event: String,
    #[serde(default)]
    pub(crate) data: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub(crate) struct PushEventResponse {
    pub(crate) delivered: usize,
}
