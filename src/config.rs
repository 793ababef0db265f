//! Layered configuration for the StoryGen gateway.
//!
//! Settings resolve in three layers, later layers winning:
//! 1. Built-in defaults
//! 2. An optional `storygen.toml` in the working directory
//! 3. Environment variables (a `.env` file is loaded by `main` via dotenvy)
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! port = 8000
//! frontend_url = "http://localhost:3000"
//!
//! [models]
//! story_model = "gemini-2.5-flash"
//! image_model = "imagegeneration@006"
//! ```
//!
//! Google credentials are environment-only, matching the Cloud Run deployment
//! surface: `GOOGLE_API_KEY`, `GOOGLE_GENAI_USE_VERTEXAI`,
//! `GOOGLE_CLOUD_PROJECT` / `GOOGLE_CLOUD_PROJECT_ID`, `GENMEDIA_BUCKET`,
//! `GOOGLE_CLOUD_LOCATION`, `GOOGLE_ACCESS_TOKEN`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::ConfigError;

pub const CONFIG_FILE: &str = "storygen.toml";

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Listen port (Cloud Run injects `PORT`)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Production frontend origin, added to the CORS allow list
    #[serde(default = "default_frontend_url")]
    pub frontend_url: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: default_port(),
            frontend_url: default_frontend_url(),
        }
    }
}

/// Model selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "default_story_model")]
    pub story_model: String,
    #[serde(default = "default_image_model")]
    pub image_model: String,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            story_model: default_story_model(),
            image_model: default_image_model(),
        }
    }
}

fn default_port() -> u16 {
    8000
}

fn default_frontend_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_story_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_image_model() -> String {
    "imagegeneration@006".to_string()
}

fn default_location() -> String {
    "us-central1".to_string()
}

/// Google Cloud credentials and addressing, resolved from the environment.
#[derive(Debug, Clone)]
pub struct GoogleSettings {
    /// Gemini API key (`GOOGLE_API_KEY`)
    pub api_key: Option<String>,
    /// Route Gemini calls through Vertex AI (`GOOGLE_GENAI_USE_VERTEXAI`)
    pub use_vertex: bool,
    /// `GOOGLE_CLOUD_PROJECT` wins over `GOOGLE_CLOUD_PROJECT_ID`
    pub project_id: Option<String>,
    /// Vertex AI region (`GOOGLE_CLOUD_LOCATION`)
    pub location: String,
    /// GCS bucket for generated images (`GENMEDIA_BUCKET`)
    pub bucket: Option<String>,
    /// Static bearer token override (`GOOGLE_ACCESS_TOKEN`); otherwise the
    /// metadata server is consulted
    pub access_token: Option<String>,
}

impl Default for GoogleSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            use_vertex: false,
            project_id: None,
            location: default_location(),
            bucket: None,
            access_token: None,
        }
    }
}

/// Fully resolved application configuration.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub server: ServerSettings,
    pub models: ModelSettings,
    pub google: GoogleSettings,
}

/// On-disk shape of `storygen.toml`.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    server: Option<ServerSettings>,
    #[serde(default)]
    models: Option<ModelSettings>,
}

impl AppConfig {
    /// Load configuration: defaults, then `storygen.toml` (if present in
    /// `dir`), then the process environment.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(&dir.join(CONFIG_FILE))?;
        config.apply_env_with(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let mut config = AppConfig::default();

        if path.exists() {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            let file: FileConfig =
                toml::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path.clone(),
                    source,
                })?;
            if let Some(server) = file.server {
                config.server = server;
            }
            if let Some(models) = file.models {
                config.models = models;
            }
        }

        Ok(config)
    }

    /// Overlay environment variables via an injectable lookup (tests pass a
    /// map; production passes `std::env::var`).
    pub fn apply_env_with(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(port) = get("PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(url) = get("FRONTEND_URL") {
            self.server.frontend_url = url;
        }
        if let Some(model) = get("STORY_MODEL") {
            self.models.story_model = model;
        }
        if let Some(model) = get("IMAGE_MODEL") {
            self.models.image_model = model;
        }

        self.google.api_key = get("GOOGLE_API_KEY").filter(|v| !v.is_empty());
        self.google.use_vertex = get("GOOGLE_GENAI_USE_VERTEXAI")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1"))
            .unwrap_or(false);
        self.google.project_id = get("GOOGLE_CLOUD_PROJECT")
            .or_else(|| get("GOOGLE_CLOUD_PROJECT_ID"))
            .filter(|v| !v.is_empty());
        if let Some(location) = get("GOOGLE_CLOUD_LOCATION").filter(|v| !v.is_empty()) {
            self.google.location = location;
        }
        self.google.bucket = get("GENMEDIA_BUCKET").filter(|v| !v.is_empty());
        self.google.access_token = get("GOOGLE_ACCESS_TOKEN").filter(|v| !v.is_empty());
    }

    /// Whether scene illustration can run at all. Story generation works
    /// without a project id; images do not.
    pub fn images_enabled(&self) -> bool {
        self.google.project_id.is_some()
    }
}
