use std::time::Duration;

use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::Client;

use crate::core::config::Settings;

/// S3 key for one uploaded answer-sheet page.
pub(crate) fn upload_key(exam_code: &str, student_id: i64, index: u32, ext: &str) -> String {
    format!("uploads/{exam_code}/{student_id}/{index}.{ext}")
}

/// S3 key for a header image uploaded before any student is known.
pub(crate) fn header_key(exam_code: &str, filename: &str) -> String {
    format!("header/{exam_code}/{filename}")
}

/// S3 key for an image the recognition worker filed under the
/// unattributed bucket.
pub(crate) fn unknown_id_key(exam_code: &str, filename: &str) -> String {
    format!("header/{exam_code}/unknown_id/{filename}")
}

pub(crate) fn unknown_id_prefix(exam_code: &str) -> String {
    format!("header/{exam_code}/unknown_id/")
}

pub(crate) fn attendance_key(exam_code: &str) -> String {
    format!("attendance/{exam_code}.xlsx")
}

/// Maps an allowed image content type to the canonical file extension.
/// `image/jpg` is tolerated and normalized to jpg.
pub(crate) fn image_extension(content_type: &str) -> Option<&'static str> {
    match content_type {
        "image/png" => Some("png"),
        "image/jpeg" | "image/jpg" => Some("jpg"),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub(crate) struct StorageService {
    client: Client,
    bucket: String,
}

impl StorageService {
    pub(crate) async fn from_settings(settings: &Settings) -> anyhow::Result<Option<Self>> {
        if settings.s3().access_key.is_empty() || settings.s3().secret_key.is_empty() {
            return Ok(None);
        }

        let creds = Credentials::new(
            settings.s3().access_key.clone(),
            settings.s3().secret_key.clone(),
            None,
            None,
            "gradi-static",
        );

        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(settings.s3().region.clone()))
            .credentials_provider(creds);

        if let Some(endpoint) = settings.s3().endpoint.clone() {
            loader = loader.endpoint_url(endpoint);
        }

        let config = loader.load().await;
        let client = Client::new(&config);

        Ok(Some(Self { client, bucket: settings.s3().bucket.clone() }))
    }

    pub(crate) async fn presign_put(
        &self,
        key: &str,
        content_type: &str,
        expires_in: Duration,
    ) -> anyhow::Result<String> {
        let presigned = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .presigned(PresigningConfig::expires_in(expires_in)?)
            .await?;

        Ok(presigned.uri().to_string())
    }

    pub(crate) async fn presign_get(
        &self,
        key: &str,
        expires_in: Duration,
    ) -> anyhow::Result<String> {
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(PresigningConfig::expires_in(expires_in)?)
            .await?;

        Ok(presigned.uri().to_string())
    }

    pub(crate) async fn list_keys(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let output =
            self.client.list_objects_v2().bucket(&self.bucket).prefix(prefix).send().await?;

        Ok(output.contents().iter().filter_map(|object| object.key().map(str::to_string)).collect())
    }
}
