//! The two generation agents and the trait seams the gateway drives them
//! through.
//!
//! `StoryGenerator` and `ImageGenerator` exist so the WebSocket session loop
//! can be exercised against scripted fakes; the real implementations wrap
//! the Gemini and Imagen REST APIs.

pub mod image;
pub mod story;

pub use image::ImageAgent;
pub use story::StoryAgent;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::{ImageError, StoryError};
use crate::story::{Scene, StoryData};

/// Produces a structured story from a keyword string, pushing raw text
/// deltas through `deltas` while the model streams.
#[async_trait]
pub trait StoryGenerator: Send + Sync {
    async fn generate(
        &self,
        keywords: &str,
        deltas: mpsc::Sender<String>,
    ) -> Result<StoryData, StoryError>;
}

/// Illustrates a single scene, given the story-wide character guide.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn illustrate(
        &self,
        scene: &Scene,
        characters: &[(String, String)],
    ) -> Result<Vec<GeneratedImage>, ImageError>;
}

/// One generated illustration, ready to relay to the client.
#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub format: String,
    pub base64: Option<String>,
    pub gcs_url: Option<String>,
    pub stored_in_bucket: bool,
    /// Set when a configured bucket upload failed and the image degraded to
    /// base64-only delivery.
    pub bucket_error: Option<String>,
}
