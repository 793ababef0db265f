//! Story agent — streams a structured four-scene story out of Gemini.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

use crate::agent::StoryGenerator;
use crate::errors::StoryError;
use crate::genai::GeminiClient;
use crate::story::{StoryData, parse_story_response};

/// System instruction for the story model. The JSON contract here is load
/// bearing: `main_characters` descriptions feed the image prompts, and scene
/// `description` must stay free of character appearance so the two don't
/// fight in the image model.
pub const STORY_INSTRUCTION: &str = r#"You are a creative assistant for a children's storybook app. Your purpose is to generate a short, charming story based on user-provided keywords.

**Story Requirements:**
- **Structure:** The story must have exactly 4 scenes, following a classic narrative arc:
    1. **The Setup:** Introduce the main character(s) and the setting.
    2. **The Inciting Incident:** A key event that kicks off the main plot.
    3. **The Climax:** The peak of the action or turning point.
    4. **The Resolution:** The conclusion where the story wraps up.
- **Length:** The total story should be between 100 and 200 words.
- **Tone:** The language must be simple, engaging, and suitable for all audiences.
- **Keywords:** Seamlessly and naturally integrate the user's keywords into the story.

**Output Format:**
- You MUST always respond with a single, valid JSON object. Do not include any other text or formatting before or after the JSON.
- The JSON must follow this exact structure:
  {
    "story": "The complete story text, combining the text from all four scenes.",
    "main_characters": [
      {
        "name": "Character Name",
        "description": "A VERY detailed visual description of the character. Focus on specific physical traits, clothing, colors, textures, and size. This will be used to generate images, so be specific."
      }
    ],
    "scenes": [
      {
        "index": 1,
        "title": "The Setup",
        "description": "A description of the scene's ACTION and SETTING. DO NOT describe the characters' appearance here. Focus on what is happening and where.",
        "text": "The story text for this specific scene."
      }
    ]
  }

**Key Instructions:**
1. Extract a maximum of 1-2 main characters from the user's prompt; their descriptions must be extremely detailed and visual.
2. Scene descriptions must focus ONLY on the action and the setting; character appearance belongs in main_characters alone.
3. Provide all 4 scenes with indices 1 through 4 and ensure your entire response is a single, valid JSON object."#;

/// Gemini-backed [`StoryGenerator`].
#[derive(Clone)]
pub struct StoryAgent {
    client: GeminiClient,
    model: String,
}

impl StoryAgent {
    pub fn new(client: GeminiClient, model: String) -> Self {
        Self { client, model }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl StoryGenerator for StoryAgent {
    async fn generate(
        &self,
        keywords: &str,
        deltas: mpsc::Sender<String>,
    ) -> Result<StoryData, StoryError> {
        let user_text = format!("Keywords: {keywords}");
        let raw = self
            .client
            .stream_generate(&self.model, STORY_INSTRUCTION, &user_text, deltas)
            .await?;

        if raw.trim().is_empty() {
            return Err(StoryError::EmptyResponse);
        }

        let story = parse_story_response(&raw)?;
        info!(
            scenes = story.scenes.len(),
            characters = story.main_characters.len(),
            chars = raw.len(),
            "Story generated"
        );
        Ok(story)
    }
}
