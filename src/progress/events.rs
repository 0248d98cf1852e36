use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Sentinel identity assigned by the recognition worker when it cannot
/// attribute an answer sheet to a student.
pub(crate) const UNKNOWN_STUDENT_ID: &str = "unknown_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueEventKind {
    StudentIdRecognition,
    QuestionRecognition,
    AttendanceUpload,
    Error,
    Unknown,
}

impl QueueEventKind {
    pub(crate) fn parse(value: &str) -> Self {
        match value {
            "STUDENT_ID_RECOGNITION" => QueueEventKind::StudentIdRecognition,
            "QUESTION_RECOGNITION" => QueueEventKind::QuestionRecognition,
            "ATTENDANCE_UPLOAD" => QueueEventKind::AttendanceUpload,
            "ERROR" => QueueEventKind::Error,
            _ => QueueEventKind::Unknown,
        }
    }
}

/// Kind tag of a queue message. The producer historically used both
/// `event_type` and `eventType`; messages predating the tag entirely are
/// student-id recognition events.
pub(crate) fn event_kind_label(raw: &Value) -> &str {
    raw.get("event_type")
        .and_then(Value::as_str)
        .or_else(|| raw.get("eventType").and_then(Value::as_str))
        .unwrap_or("STUDENT_ID_RECOGNITION")
}

/// Typed view of a recognition-progress message. Unknown fields are ignored
/// for forward compatibility; `total` and `presignedUrls` tolerate the
/// loosely-typed payloads older workers emit.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct RecognitionEvent {
    #[serde(rename = "examCode", alias = "exam_code", default)]
    pub(crate) exam_code: Option<String>,
    #[serde(rename = "studentId", alias = "student_id", default)]
    pub(crate) student_id: Option<String>,
    #[serde(rename = "filename", alias = "fileName", default)]
    pub(crate) filename: Option<String>,
    #[serde(default, deserialize_with = "lenient_total")]
    pub(crate) total: Option<u32>,
    #[serde(default)]
    pub(crate) status: Option<String>,
    #[serde(rename = "presignedUrls", default, deserialize_with = "lenient_urls")]
    pub(crate) presigned_urls: Option<Vec<String>>,
}

fn lenient_total<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(coerce_total))
}

/// Workers report `total` as a JSON number or a numeric string; anything
/// unparseable or non-positive counts as "not provided".
pub(crate) fn coerce_total(value: &Value) -> Option<u32> {
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }?;

    if parsed.is_finite() && parsed >= 1.0 {
        Some(parsed as u32)
    } else {
        None
    }
}

fn lenient_urls<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    let urls = value.as_ref().and_then(Value::as_array).map(|items| {
        items.iter().filter_map(|item| item.as_str().map(str::to_string)).collect::<Vec<_>>()
    });
    Ok(urls.filter(|urls| !urls.is_empty()))
}

/// One named event pushed to stream subscribers. Derived per message,
/// never persisted.
#[derive(Debug, Clone)]
pub(crate) struct ProgressEvent {
    pub(crate) event: String,
    pub(crate) data: Value,
}

impl ProgressEvent {
    pub(crate) fn new(event: impl Into<String>, data: Value) -> Self {
        Self { event: event.into(), data }
    }
}
