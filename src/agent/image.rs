//! Image agent — turns scene descriptions into consistent cartoon
//! illustrations via Imagen.
//!
//! Character appearance lives in the story's character guide, not in the
//! scene description, so every prompt re-states the full guide. The style
//! prefix is identical for every image; consistency across the four panels
//! depends on it.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::warn;

use crate::agent::{GeneratedImage, ImageGenerator};
use crate::errors::ImageError;
use crate::genai::{GeminiClient, ImageRequest};
use crate::storage::GcsUploader;
use crate::story::Scene;

/// Applied verbatim to every prompt. Changing this between scenes breaks
/// visual consistency.
const LOCKED_STYLE: &str = "Children's book cartoon illustration with bright vibrant colors, \
     simple shapes, friendly characters, clean compositions, \
     appropriate for all ages, consistent character design and proportions";

const CONSISTENCY_NOTE: &str = "IMPORTANT: Use the character reference guide to ensure characters \
     look EXACTLY the same in every scene. Maintain consistent art style throughout all images.";

const NEGATIVE_PROMPT: &str =
    "photorealistic, realistic, blurry, low quality, watermark, text overlay";

const ASPECT_RATIO: &str = "16:9";

/// Imagen-backed [`ImageGenerator`] with optional bucket offload.
#[derive(Clone)]
pub struct ImageAgent {
    client: GeminiClient,
    uploader: Option<GcsUploader>,
    model: String,
}

impl ImageAgent {
    pub fn new(client: GeminiClient, uploader: Option<GcsUploader>, model: String) -> Self {
        Self {
            client,
            uploader,
            model,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

/// Compose the full Imagen prompt for one scene: locked style, the scene's
/// action/setting, then the character reference guide.
pub fn build_prompt(description: &str, characters: &[(String, String)]) -> String {
    let description = description.trim();
    let description = if description.is_empty() {
        "a cheerful scene"
    } else {
        description
    };

    let mut scene_parts = vec![format!("Scene: {description}")];
    if !characters.is_empty() {
        let guide = characters
            .iter()
            .map(|(name, desc)| format!("{name} is {desc}"))
            .collect::<Vec<_>>()
            .join("; ");
        scene_parts.push(format!("Character reference guide: {guide}"));
    }

    format!("{LOCKED_STYLE} {}. {CONSISTENCY_NOTE}", scene_parts.join(" "))
}

#[async_trait]
impl ImageGenerator for ImageAgent {
    async fn illustrate(
        &self,
        scene: &Scene,
        characters: &[(String, String)],
    ) -> Result<Vec<GeneratedImage>, ImageError> {
        let prompt = build_prompt(&scene.description, characters);
        let request = ImageRequest {
            prompt: prompt.clone(),
            negative_prompt: NEGATIVE_PROMPT.to_string(),
            aspect_ratio: ASPECT_RATIO.to_string(),
            sample_count: 1,
        };

        let predictions = self.client.predict_images(&self.model, &request).await?;
        if predictions.is_empty() {
            return Err(ImageError::NoImages);
        }

        let mut images = Vec::with_capacity(predictions.len());
        for (i, prediction) in predictions.into_iter().enumerate() {
            let Some(encoded) = prediction.bytes_base64_encoded else {
                continue;
            };
            images.push(self.store_image(encoded, &prompt, i).await);
        }

        if images.is_empty() {
            return Err(ImageError::NoImages);
        }
        Ok(images)
    }
}

impl ImageAgent {
    /// Push one image into the bucket when configured; base64 always rides
    /// along as the browser-side fallback.
    async fn store_image(&self, encoded: String, prompt: &str, index: usize) -> GeneratedImage {
        let mut image = GeneratedImage {
            format: "png".to_string(),
            base64: Some(encoded),
            gcs_url: None,
            stored_in_bucket: false,
            bucket_error: None,
        };

        let Some(uploader) = &self.uploader else {
            return image;
        };

        let bytes = match BASE64.decode(image.base64.as_deref().unwrap_or_default()) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Imagen returned undecodable base64; skipping upload");
                image.bucket_error = Some(format!("invalid base64 from model: {e}"));
                return image;
            }
        };

        match uploader.upload_png(bytes, prompt, index).await {
            Ok(url) => {
                image.gcs_url = Some(url);
                image.stored_in_bucket = true;
            }
            Err(e) => {
                warn!(bucket = uploader.bucket(), error = %e, "Bucket upload failed; falling back to base64");
                image.bucket_error = Some(e.to_string());
            }
        }
        image
    }
}
