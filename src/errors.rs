//! Typed error hierarchy for the StoryGen gateway.
//!
//! Three top-level enums cover the three subsystems:
//! - `GenAiError` — transport and auth failures talking to the model APIs
//! - `StoryError` — story agent failures (streaming, parsing)
//! - `ImageError` — image agent and bucket-upload failures

use thiserror::Error;

/// Errors from the generative API client (Gemini, Imagen, metadata server).
#[derive(Debug, Error)]
pub enum GenAiError {
    #[error("{service} returned HTTP {status}: {body}")]
    ApiStatus {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("Request to {service} failed: {source}")]
    Transport {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("No Gemini credentials configured: set GOOGLE_API_KEY or enable Vertex AI")]
    MissingCredentials,

    #[error("Vertex AI requires a Google Cloud project id")]
    MissingProject,

    #[error("Failed to obtain an access token: {0}")]
    Auth(String),
}

/// Errors from a single story generation.
#[derive(Debug, Error)]
pub enum StoryError {
    #[error("Story model returned an empty response")]
    EmptyResponse,

    #[error("Story model returned invalid JSON ({source}); response began: {snippet}")]
    InvalidStoryJson {
        #[source]
        source: serde_json::Error,
        snippet: String,
    },

    #[error("Story generation task failed: {0}")]
    TaskFailed(String),

    #[error(transparent)]
    GenAi(#[from] GenAiError),
}

/// Errors from a single scene illustration.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Image generation is not configured (set GOOGLE_CLOUD_PROJECT_ID)")]
    NotConfigured,

    #[error("Imagen returned no images")]
    NoImages,

    #[error("Bucket upload failed: {0}")]
    Upload(String),

    #[error(transparent)]
    GenAi(#[from] GenAiError),
}

/// Errors from loading the layered configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file at {path}: {source}")]
    Parse {
        path: std::path::PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
