//! Generated-image storage in a GCS bucket.
//!
//! Uploads go through the GCS JSON API with a bearer token; the returned URL
//! is the bucket's public HTTPS form, which the browser loads directly
//! instead of receiving megabytes of base64 over the WebSocket.

use chrono::Utc;
use uuid::Uuid;

use crate::errors::ImageError;
use crate::genai::TokenProvider;

const GCS_UPLOAD_BASE: &str = "https://storage.googleapis.com/upload/storage/v1/b";
const GCS_PUBLIC_BASE: &str = "https://storage.googleapis.com";

/// Uploads PNGs into a configured bucket.
#[derive(Clone)]
pub struct GcsUploader {
    http: reqwest::Client,
    tokens: TokenProvider,
    bucket: String,
}

impl GcsUploader {
    pub fn new(http: reqwest::Client, tokens: TokenProvider, bucket: String) -> Self {
        Self {
            http,
            tokens,
            bucket,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Upload one PNG and return its public URL.
    pub async fn upload_png(
        &self,
        bytes: Vec<u8>,
        prompt: &str,
        index: usize,
    ) -> Result<String, ImageError> {
        let object = object_name(prompt, index);
        let token = self
            .tokens
            .bearer_token()
            .await
            .map_err(|e| ImageError::Upload(e.to_string()))?;

        let url = format!(
            "{GCS_UPLOAD_BASE}/{bucket}/o?uploadType=media&name={object}",
            bucket = self.bucket,
        );
        let resp = self
            .http
            .post(&url)
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "image/png")
            .body(bytes)
            .send()
            .await
            .map_err(|e| ImageError::Upload(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ImageError::Upload(format!("HTTP {status}: {body}")));
        }

        Ok(format!(
            "{GCS_PUBLIC_BASE}/{bucket}/{object}",
            bucket = self.bucket,
        ))
    }
}

/// Unique object name: timestamp, a sanitized slice of the prompt, the scene
/// index, and a short random suffix.
fn object_name(prompt: &str, index: usize) -> String {
    let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
    let unique = Uuid::new_v4().simple().to_string()[..8].to_string();
    let safe_prompt = sanitize_prompt(prompt);
    format!("generated_images/{timestamp}_{safe_prompt}_{index}_{unique}.png")
}

/// First 30 characters of the prompt, keeping only filename-safe characters,
/// spaces collapsed to underscores.
fn sanitize_prompt(prompt: &str) -> String {
    prompt
        .chars()
        .take(30)
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect::<String>()
        .trim_end()
        .replace(' ', "_")
}
