//! REST client for Google's generative APIs.
//!
//! Two transports, matching the deployment modes:
//! - **Gemini API** (`generativelanguage.googleapis.com`) authenticated with
//!   an API key (the local-development path).
//! - **Vertex AI** (`{location}-aiplatform.googleapis.com`) authenticated
//!   with an OAuth bearer token (the Cloud Run path). Imagen prediction is
//!   Vertex-only.
//!
//! Text generation uses the `streamGenerateContent` SSE endpoint; each
//! `data:` line is a JSON `GenerateContentResponse` whose text parts are
//! forwarded as deltas and accumulated into the full response.

pub mod auth;

pub use auth::TokenProvider;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::GoogleSettings;
use crate::errors::GenAiError;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

enum AuthMode {
    ApiKey(String),
    Bearer,
}

/// Shared, cloneable client for Gemini text generation and Imagen
/// prediction.
#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    tokens: TokenProvider,
    api_key: Option<String>,
    use_vertex: bool,
    project_id: Option<String>,
    location: String,
}

// ── Request / response wire types ────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictRequest {
    instances: Vec<PredictInstance>,
    parameters: PredictParameters,
}

#[derive(Debug, Serialize)]
struct PredictInstance {
    prompt: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PredictParameters {
    sample_count: u32,
    aspect_ratio: String,
    negative_prompt: String,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

/// One generated image from the Imagen predict endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    #[serde(default)]
    pub bytes_base64_encoded: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    models: Vec<serde_json::Value>,
}

/// Parameters for one Imagen prediction call.
#[derive(Debug, Clone)]
pub struct ImageRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub aspect_ratio: String,
    pub sample_count: u32,
}

impl GeminiClient {
    pub fn new(google: &GoogleSettings) -> Self {
        let http = reqwest::Client::new();
        let tokens = TokenProvider::new(http.clone(), google.access_token.clone());
        Self {
            http,
            tokens,
            api_key: google.api_key.clone(),
            use_vertex: google.use_vertex,
            project_id: google.project_id.clone(),
            location: google.location.clone(),
        }
    }

    /// The underlying HTTP client, shared with collaborators (e.g. the GCS
    /// uploader) so connection pools are reused.
    pub fn http(&self) -> reqwest::Client {
        self.http.clone()
    }

    /// The token source, shared with collaborators that need bearer auth.
    pub fn token_provider(&self) -> TokenProvider {
        self.tokens.clone()
    }

    fn vertex_model_url(&self, model: &str, method: &str) -> Result<String, GenAiError> {
        let project = self
            .project_id
            .as_deref()
            .ok_or(GenAiError::MissingProject)?;
        Ok(format!(
            "https://{loc}-aiplatform.googleapis.com/v1/projects/{project}/locations/{loc}/publishers/google/models/{model}:{method}",
            loc = self.location,
        ))
    }

    fn text_route(&self, model: &str) -> Result<(String, AuthMode), GenAiError> {
        match (&self.api_key, self.use_vertex) {
            (Some(key), false) => Ok((
                format!("{GEMINI_API_BASE}/models/{model}:streamGenerateContent?alt=sse"),
                AuthMode::ApiKey(key.clone()),
            )),
            _ if self.project_id.is_some() => Ok((
                format!(
                    "{}?alt=sse",
                    self.vertex_model_url(model, "streamGenerateContent")?
                ),
                AuthMode::Bearer,
            )),
            (Some(key), true) => {
                // Vertex requested but no project configured; fall back to
                // the API key rather than failing the turn.
                Ok((
                    format!("{GEMINI_API_BASE}/models/{model}:streamGenerateContent?alt=sse"),
                    AuthMode::ApiKey(key.clone()),
                ))
            }
            (None, _) => Err(GenAiError::MissingCredentials),
        }
    }

    async fn authorize(
        &self,
        req: reqwest::RequestBuilder,
        mode: &AuthMode,
    ) -> Result<reqwest::RequestBuilder, GenAiError> {
        Ok(match mode {
            AuthMode::ApiKey(key) => req.header("x-goog-api-key", key),
            AuthMode::Bearer => req.bearer_auth(self.tokens.bearer_token().await?),
        })
    }

    /// Stream a text generation. Each text delta is sent through `deltas` as
    /// it arrives (a dropped receiver is tolerated); the return value is the
    /// fully accumulated response text.
    pub async fn stream_generate(
        &self,
        model: &str,
        system_instruction: &str,
        user_text: &str,
        deltas: mpsc::Sender<String>,
    ) -> Result<String, GenAiError> {
        let (url, auth) = self.text_route(model)?;
        let body = GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: Some(user_text.to_string()),
                }],
            }],
            system_instruction: Some(Content {
                role: None,
                parts: vec![Part {
                    text: Some(system_instruction.to_string()),
                }],
            }),
        };

        let req = self.http.post(&url).json(&body);
        let mut resp = self
            .authorize(req, &auth)
            .await?
            .send()
            .await
            .map_err(|source| GenAiError::Transport {
                service: "Gemini",
                source,
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(GenAiError::ApiStatus {
                service: "Gemini",
                status,
                body,
            });
        }

        let mut accumulated = String::new();
        let mut buffer: Vec<u8> = Vec::new();
        let mut events = 0usize;

        loop {
            let chunk = resp.chunk().await.map_err(|source| GenAiError::Transport {
                service: "Gemini",
                source,
            })?;
            let Some(chunk) = chunk else { break };
            buffer.extend_from_slice(&chunk);

            for payload in drain_sse_data(&mut buffer) {
                events += 1;
                for delta in extract_text_deltas(&payload) {
                    accumulated.push_str(&delta);
                    // Receiver may have gone away (client disconnected);
                    // keep accumulating regardless.
                    let _ = deltas.send(delta).await;
                }
            }
        }

        debug!(events, chars = accumulated.len(), "Gemini stream finished");
        Ok(accumulated)
    }

    /// Generate images via the Vertex AI Imagen predict endpoint.
    pub async fn predict_images(
        &self,
        model: &str,
        request: &ImageRequest,
    ) -> Result<Vec<Prediction>, GenAiError> {
        let url = self.vertex_model_url(model, "predict")?;
        let body = PredictRequest {
            instances: vec![PredictInstance {
                prompt: request.prompt.clone(),
            }],
            parameters: PredictParameters {
                sample_count: request.sample_count,
                aspect_ratio: request.aspect_ratio.clone(),
                negative_prompt: request.negative_prompt.clone(),
            },
        };

        let req = self.http.post(&url).json(&body);
        let resp = self
            .authorize(req, &AuthMode::Bearer)
            .await?
            .send()
            .await
            .map_err(|source| GenAiError::Transport {
                service: "Imagen",
                source,
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(GenAiError::ApiStatus {
                service: "Imagen",
                status,
                body,
            });
        }

        let parsed: PredictResponse =
            resp.json().await.map_err(|source| GenAiError::Transport {
                service: "Imagen",
                source,
            })?;
        Ok(parsed.predictions)
    }

    /// Count the models visible to the configured API key. Used by the
    /// connectivity check only.
    pub async fn count_models(&self) -> Result<usize, GenAiError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or(GenAiError::MissingCredentials)?;
        let resp = self
            .http
            .get(format!("{GEMINI_API_BASE}/models"))
            .header("x-goog-api-key", key)
            .send()
            .await
            .map_err(|source| GenAiError::Transport {
                service: "Gemini",
                source,
            })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(GenAiError::ApiStatus {
                service: "Gemini",
                status,
                body,
            });
        }

        let list: ModelList = resp.json().await.map_err(|source| GenAiError::Transport {
            service: "Gemini",
            source,
        })?;
        Ok(list.models.len())
    }
}

// ── SSE parsing ──────────────────────────────────────────────────────

/// Pull complete `data:` payloads out of `buffer`, leaving any trailing
/// partial line in place. Lines are only decoded once a `\n` arrives, so a
/// chunk boundary can never split a UTF-8 character mid-decode.
fn drain_sse_data(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut payloads = Vec::new();
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&line);
        let line = line.trim_end_matches(['\n', '\r']);
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.trim_start();
            if !data.is_empty() {
                payloads.push(data.to_string());
            }
        }
    }
    payloads
}

/// Text deltas inside one streamed `GenerateContentResponse`. Malformed
/// events are skipped; the stream carries occasional metadata-only frames.
fn extract_text_deltas(payload: &str) -> Vec<String> {
    let Ok(event) = serde_json::from_str::<GenerateContentResponse>(payload) else {
        return Vec::new();
    };
    event
        .candidates
        .into_iter()
        .filter_map(|c| c.content)
        .flat_map(|content| content.parts)
        .filter_map(|part| part.text)
        .filter(|text| !text.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GoogleSettings;

    fn client(google: GoogleSettings) -> GeminiClient {
        GeminiClient::new(&google)
    }

    #[test]
    fn text_route_prefers_api_key() {
        let c = client(GoogleSettings {
            api_key: Some("k".into()),
            ..Default::default()
        });
        let (url, mode) = c.text_route("gemini-2.5-flash").unwrap();
        assert!(url.starts_with(GEMINI_API_BASE));
        assert!(url.contains("gemini-2.5-flash:streamGenerateContent"));
        assert!(url.ends_with("alt=sse"));
        assert!(matches!(mode, AuthMode::ApiKey(_)));
    }

    #[test]
    fn text_route_uses_vertex_when_enabled() {
        let c = client(GoogleSettings {
            api_key: Some("k".into()),
            use_vertex: true,
            project_id: Some("demo-project".into()),
            ..Default::default()
        });
        let (url, mode) = c.text_route("gemini-2.5-flash").unwrap();
        assert!(url.contains("us-central1-aiplatform.googleapis.com"));
        assert!(url.contains("/projects/demo-project/"));
        assert!(matches!(mode, AuthMode::Bearer));
    }

    #[test]
    fn text_route_vertex_without_project_falls_back_to_key() {
        let c = client(GoogleSettings {
            api_key: Some("k".into()),
            use_vertex: true,
            ..Default::default()
        });
        let (url, mode) = c.text_route("gemini-2.5-flash").unwrap();
        assert!(url.starts_with(GEMINI_API_BASE));
        assert!(matches!(mode, AuthMode::ApiKey(_)));
    }

    #[test]
    fn text_route_without_credentials_errors() {
        let c = client(GoogleSettings::default());
        assert!(matches!(
            c.text_route("gemini-2.5-flash"),
            Err(GenAiError::MissingCredentials)
        ));
    }

    #[test]
    fn predict_url_requires_project() {
        let c = client(GoogleSettings::default());
        assert!(matches!(
            c.vertex_model_url("imagegeneration@006", "predict"),
            Err(GenAiError::MissingProject)
        ));
    }

    #[test]
    fn drain_sse_data_extracts_complete_lines_only() {
        let mut buffer = b"data: {\"a\":1}\n\ndata: {\"b\":".to_vec();
        let payloads = drain_sse_data(&mut buffer);
        assert_eq!(payloads, vec![r#"{"a":1}"#]);
        // The partial line stays buffered
        assert_eq!(buffer, b"data: {\"b\":");

        buffer.extend_from_slice(b"2}\n");
        let payloads = drain_sse_data(&mut buffer);
        assert_eq!(payloads, vec![r#"{"b":2}"#]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn drain_sse_data_handles_crlf_and_blank_lines() {
        let mut buffer = b"data: {\"x\":1}\r\n\r\n".to_vec();
        let payloads = drain_sse_data(&mut buffer);
        assert_eq!(payloads, vec![r#"{"x":1}"#]);
    }

    #[test]
    fn extract_text_deltas_reads_candidate_parts() {
        let payload = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Once "},{"text":"upon"}]}}]}"#;
        assert_eq!(extract_text_deltas(payload), vec!["Once ", "upon"]);
    }

    #[test]
    fn extract_text_deltas_skips_metadata_frames() {
        assert!(extract_text_deltas(r#"{"usageMetadata":{"totalTokenCount":12}}"#).is_empty());
        assert!(extract_text_deltas("not json").is_empty());
    }

    #[test]
    fn predict_request_serializes_camel_case() {
        let req = PredictRequest {
            instances: vec![PredictInstance {
                prompt: "a robot".into(),
            }],
            parameters: PredictParameters {
                sample_count: 1,
                aspect_ratio: "16:9".into(),
                negative_prompt: "blurry".into(),
            },
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""sampleCount":1"#));
        assert!(json.contains(r#""aspectRatio":"16:9""#));
        assert!(json.contains(r#""negativePrompt":"blurry""#));
    }

    #[test]
    fn predict_response_deserializes() {
        let json = r#"{"predictions":[{"bytesBase64Encoded":"aGVsbG8=","mimeType":"image/png"}]}"#;
        let resp: PredictResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.predictions.len(), 1);
        assert_eq!(
            resp.predictions[0].bytes_base64_encoded.as_deref(),
            Some("aGVsbG8=")
        );
    }
}
