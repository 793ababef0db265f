//! Structured story data and response parsing.
//!
//! The story model is instructed to answer with a single JSON object:
//! `story` (flat text), `main_characters` (visual descriptions used to keep
//! illustrations consistent), and `scenes` (four narrative beats). Models
//! wrap JSON in markdown fences or chat around it often enough that parsing
//! strips fences first and falls back to brace-counting extraction.

pub mod splitter;

use serde::{Deserialize, Serialize};

use crate::errors::StoryError;

/// A story as returned by the story model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoryData {
    /// The complete story text, all scenes combined.
    #[serde(default)]
    pub story: String,
    #[serde(default)]
    pub main_characters: Vec<Character>,
    #[serde(default)]
    pub scenes: Vec<Scene>,
}

/// A main character with the detailed visual description fed to the image
/// model for cross-scene consistency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Character {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// One narrative beat: title, action/setting description (for the image
/// prompt, deliberately free of character appearance), and story text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    #[serde(default = "default_scene_index")]
    pub index: u32,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub text: String,
}

fn default_scene_index() -> u32 {
    1
}

impl StoryData {
    /// Character name → visual description pairs, in story order. Entries
    /// missing either field are dropped.
    pub fn character_guide(&self) -> Vec<(String, String)> {
        self.main_characters
            .iter()
            .filter(|c| !c.name.is_empty() && !c.description.is_empty())
            .map(|c| (c.name.clone(), c.description.clone()))
            .collect()
    }

    /// Rebuild the story text with the `[SCENE N]` markers the frame layout
    /// expects. Falls back to the flat `story` field when the model returned
    /// no scenes.
    pub fn with_scene_markers(&self) -> String {
        if self.scenes.is_empty() {
            return self.story.clone();
        }
        let mut text = String::new();
        for scene in &self.scenes {
            text.push_str(&format!("[SCENE {}]\n{}\n\n", scene.index, scene.text));
        }
        text.trim_end().to_string()
    }
}

/// Parse the raw model response into [`StoryData`].
///
/// Strips ```` ```json ```` fences, then tries the text as-is, then falls
/// back to extracting the outermost brace-balanced object.
pub fn parse_story_response(raw: &str) -> Result<StoryData, StoryError> {
    let cleaned = strip_code_fences(raw);

    let parse_err = match serde_json::from_str::<StoryData>(cleaned) {
        Ok(story) => return Ok(story),
        Err(e) => e,
    };

    if let Some(object) = extract_json_object(cleaned) {
        if let Ok(story) = serde_json::from_str::<StoryData>(&object) {
            return Ok(story);
        }
    }

    Err(StoryError::InvalidStoryJson {
        source: parse_err,
        snippet: snippet(cleaned, 200),
    })
}

/// Remove a leading ```` ```json ```` (or bare ```` ``` ````) fence and a
/// trailing ```` ``` ````, if present.
fn strip_code_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```json") {
        text = rest;
    } else if let Some(rest) = text.strip_prefix("```") {
        text = rest;
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }
    text.trim()
}

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object.
fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut end = start;

    for (i, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}

/// First `max` characters of `text`, for error messages.
fn snippet(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}
