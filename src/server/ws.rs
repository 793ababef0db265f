//! WebSocket session loop and the two-agent story turn.
//!
//! One connection per user id, strictly sequential: a `generate_story`
//! request runs the full story → images workflow to completion (or error)
//! before the next client message is read. There is no cross-connection
//! state; a reconnecting client simply starts a fresh turn.

use async_trait::async_trait;
use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use super::{AppState, SharedState};
use crate::agent::ImageGenerator;
use crate::protocol::{ClientMessage, ImagePayload, ServerMessage, story_delivery};
use crate::story::StoryData;

/// Forward every Nth streaming delta to the client as a partial chunk.
const DELTA_FORWARD_EVERY: usize = 3;

/// The only data-model invariant: at most four image slots per story.
pub const MAX_IMAGE_SLOTS: usize = 4;

/// Pause between scene illustrations to stay under Imagen rate limits.
pub const IMAGE_PACING: Duration = Duration::from_secs(2);

// ── Event sink ───────────────────────────────────────────────────────

/// The client went away mid-turn; abandon the rest of the workflow.
#[derive(Debug)]
pub(crate) struct SinkClosed;

/// Where turn events go. The production implementation is the WebSocket
/// itself; tests substitute a recording sink.
#[async_trait]
pub(crate) trait EventSink: Send {
    async fn emit(&mut self, msg: &ServerMessage) -> Result<(), SinkClosed>;
}

#[async_trait]
impl EventSink for WebSocket {
    async fn emit(&mut self, msg: &ServerMessage) -> Result<(), SinkClosed> {
        let json = match serde_json::to_string(msg) {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "Failed to serialize server message");
                return Ok(());
            }
        };
        self.send(Message::Text(json.into()))
            .await
            .map_err(|_| SinkClosed)
    }
}

// ── Connection handling ──────────────────────────────────────────────

pub async fn ws_handler(
    Path(user_id): Path<String>,
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, user_id, state))
}

async fn handle_socket(mut socket: WebSocket, user_id: String, state: SharedState) {
    info!(%user_id, "Client connected");

    let connected = ServerMessage::Connected {
        message: "Connected to StoryGen backend".to_string(),
    };
    if socket.emit(&connected).await.is_err() {
        return;
    }

    while let Some(incoming) = socket.recv().await {
        let message = match incoming {
            Ok(message) => message,
            Err(e) => {
                warn!(%user_id, error = %e, "WebSocket transport error");
                break;
            }
        };

        match message {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(ClientMessage::GenerateStory { data }) => {
                    info!(%user_id, keywords = %data, "Story generation requested");
                    let processing = ServerMessage::Processing {
                        message: "Generating story and images...".to_string(),
                    };
                    if socket.emit(&processing).await.is_err() {
                        break;
                    }
                    if run_story_turn(&mut socket, &state, &data).await.is_err() {
                        break;
                    }
                }
                Ok(ClientMessage::Ping) => {
                    if socket.emit(&ServerMessage::Pong).await.is_err() {
                        break;
                    }
                }
                Err(_) => {
                    warn!(%user_id, "Unknown or malformed client message");
                }
            },
            Message::Close(_) => break,
            // Ping/pong control frames are answered by the transport.
            _ => {}
        }
    }

    info!(%user_id, "Client disconnected");
}

// ── The two-agent turn ───────────────────────────────────────────────

/// Run one full generation turn: stream the story, deliver it with scene
/// markers, illustrate up to four scenes, then signal completion.
///
/// A story failure reports `error` and ends the turn early (no
/// `turn_complete`); an image failure degrades that slot to a placeholder
/// and the turn continues.
pub(crate) async fn run_story_turn<S: EventSink>(
    sink: &mut S,
    state: &AppState,
    keywords: &str,
) -> Result<(), SinkClosed> {
    let Some(story) = stream_story(sink, state, keywords).await? else {
        return Ok(());
    };

    let story_text = story.with_scene_markers();
    for message in story_delivery(&story_text) {
        sink.emit(&message).await?;
    }
    info!(chars = story_text.len(), "Sent story text with scene markers");

    match &state.image_agent {
        Some(agent) if !story.scenes.is_empty() => {
            illustrate_scenes(sink, agent.as_ref(), &story, state.image_pacing).await?;
        }
        Some(_) => warn!("No scenes in story data; skipping image generation"),
        None => warn!("Image agent unavailable; skipping image generation"),
    }

    sink.emit(&ServerMessage::TurnComplete {
        turn_complete: true,
    })
    .await
}

/// Drive the story agent, forwarding every [`DELTA_FORWARD_EVERY`]th delta
/// as a partial chunk. Returns `None` after reporting a generation error.
async fn stream_story<S: EventSink>(
    sink: &mut S,
    state: &AppState,
    keywords: &str,
) -> Result<Option<StoryData>, SinkClosed> {
    let (tx, mut rx) = mpsc::channel::<String>(32);
    let agent = Arc::clone(&state.story_agent);
    let keywords_owned = keywords.to_string();
    let task = tokio::spawn(async move { agent.generate(&keywords_owned, tx).await });

    let mut deltas = 0usize;
    while let Some(delta) = rx.recv().await {
        deltas += 1;
        if deltas % DELTA_FORWARD_EVERY == 0 {
            let chunk = ServerMessage::StoryChunk {
                data: delta,
                partial: true,
            };
            if sink.emit(&chunk).await.is_err() {
                task.abort();
                return Err(SinkClosed);
            }
        }
    }

    let result = task.await.unwrap_or_else(|e| {
        Err(crate::errors::StoryError::TaskFailed(e.to_string()))
    });

    match result {
        Ok(story) => Ok(Some(story)),
        Err(e) => {
            error!(error = %e, "Story generation failed");
            sink.emit(&ServerMessage::Error {
                message: format!("Story generation failed: {e}"),
            })
            .await?;
            Ok(None)
        }
    }
}

/// Illustrate up to [`MAX_IMAGE_SLOTS`] scenes in order, relaying a
/// `tool_call` before each one and degrading failures to placeholders.
async fn illustrate_scenes<S: EventSink>(
    sink: &mut S,
    agent: &dyn ImageGenerator,
    story: &StoryData,
    pacing: Duration,
) -> Result<(), SinkClosed> {
    let characters = story.character_guide();
    info!(
        characters = characters.len(),
        scenes = story.scenes.len().min(MAX_IMAGE_SLOTS),
        "Starting image generation"
    );

    let scenes = &story.scenes[..story.scenes.len().min(MAX_IMAGE_SLOTS)];
    for (i, scene) in scenes.iter().enumerate() {
        let slot = scene.index.max(1) as usize - 1;

        sink.emit(&ServerMessage::ToolCall {
            name: "generate_image".to_string(),
            args: json!({ "index": scene.index, "title": scene.title }),
        })
        .await?;

        match agent.illustrate(scene, &characters).await {
            Ok(images) => {
                for image in images {
                    let payload = ImagePayload {
                        index: slot,
                        scene_title: scene.title.clone(),
                        format: image.format,
                        stored_in_bucket: image.stored_in_bucket,
                        gcs_url: image.gcs_url,
                        base64: image.base64,
                        error: None,
                        placeholder: None,
                    };
                    sink.emit(&ServerMessage::ImageGenerated { data: payload })
                        .await?;
                }
                info!(scene = slot + 1, "Sent image to client");
            }
            Err(e) => {
                error!(scene = slot + 1, error = %e, "Image generation failed");
                let payload = ImagePayload::placeholder(
                    slot,
                    &scene.title,
                    format!("Image generation failed: {e}"),
                );
                sink.emit(&ServerMessage::ImageGenerated { data: payload })
                    .await?;
            }
        }

        if i + 1 < scenes.len() {
            tokio::time::sleep(pacing).await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{GeneratedImage, StoryGenerator};
    use crate::errors::{ImageError, StoryError};
    use crate::story::Scene;
    use std::sync::Mutex;

    // ── Test doubles ─────────────────────────────────────────────────

    /// Records every emitted message; optionally fails after N emits.
    struct RecordingSink {
        messages: Vec<ServerMessage>,
        fail_after: Option<usize>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                messages: Vec::new(),
                fail_after: None,
            }
        }
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn emit(&mut self, msg: &ServerMessage) -> Result<(), SinkClosed> {
            if let Some(limit) = self.fail_after {
                if self.messages.len() >= limit {
                    return Err(SinkClosed);
                }
            }
            self.messages.push(msg.clone());
            Ok(())
        }
    }

    /// Emits scripted deltas, then resolves to a story or an error.
    struct ScriptedStoryAgent {
        deltas: Vec<String>,
        result: Mutex<Option<Result<StoryData, StoryError>>>,
    }

    impl ScriptedStoryAgent {
        fn ok(deltas: &[&str], story: StoryData) -> Self {
            Self {
                deltas: deltas.iter().map(|s| s.to_string()).collect(),
                result: Mutex::new(Some(Ok(story))),
            }
        }

        fn failing(error: StoryError) -> Self {
            Self {
                deltas: Vec::new(),
                result: Mutex::new(Some(Err(error))),
            }
        }
    }

    #[async_trait]
    impl StoryGenerator for ScriptedStoryAgent {
        async fn generate(
            &self,
            _keywords: &str,
            deltas: mpsc::Sender<String>,
        ) -> Result<StoryData, StoryError> {
            for delta in &self.deltas {
                let _ = deltas.send(delta.clone()).await;
            }
            self.result
                .lock()
                .unwrap()
                .take()
                .expect("generate called once")
        }
    }

    /// Succeeds or fails per scene, in call order.
    struct ScriptedImageAgent {
        outcomes: Mutex<Vec<Result<Vec<GeneratedImage>, ImageError>>>,
    }

    impl ScriptedImageAgent {
        fn new(outcomes: Vec<Result<Vec<GeneratedImage>, ImageError>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
            }
        }
    }

    #[async_trait]
    impl ImageGenerator for ScriptedImageAgent {
        async fn illustrate(
            &self,
            _scene: &Scene,
            _characters: &[(String, String)],
        ) -> Result<Vec<GeneratedImage>, ImageError> {
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                panic!("illustrate called more times than scripted");
            }
            outcomes.remove(0)
        }
    }

    fn bucket_image(url: &str) -> GeneratedImage {
        GeneratedImage {
            format: "png".to_string(),
            base64: Some("aGVsbG8=".to_string()),
            gcs_url: Some(url.to_string()),
            stored_in_bucket: true,
            bucket_error: None,
        }
    }

    fn four_scene_story() -> StoryData {
        let scenes = (1..=4)
            .map(|i| Scene {
                index: i,
                title: format!("Scene {i}"),
                description: format!("Action {i}"),
                text: format!("Text {i}."),
            })
            .collect();
        StoryData {
            story: "flat".to_string(),
            main_characters: vec![],
            scenes,
        }
    }

    fn state(
        story: ScriptedStoryAgent,
        images: Option<ScriptedImageAgent>,
    ) -> AppState {
        AppState {
            story_agent: Arc::new(story),
            image_agent: images.map(|a| Arc::new(a) as Arc<dyn ImageGenerator>),
            image_pacing: Duration::ZERO,
        }
    }

    fn type_tags(messages: &[ServerMessage]) -> Vec<&'static str> {
        messages
            .iter()
            .map(|m| match m {
                ServerMessage::Connected { .. } => "connected",
                ServerMessage::Processing { .. } => "processing",
                ServerMessage::StoryChunk { .. } => "story_chunk",
                ServerMessage::StoryComplete { .. } => "story_complete",
                ServerMessage::ToolCall { .. } => "tool_call",
                ServerMessage::ImageGenerated { .. } => "image_generated",
                ServerMessage::TurnComplete { .. } => "turn_complete",
                ServerMessage::Error { .. } => "error",
                ServerMessage::Pong => "pong",
            })
            .collect()
    }

    // ── Tests ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn full_turn_delivers_story_images_and_completion() {
        let story = four_scene_story();
        let images = ScriptedImageAgent::new(vec![
            Ok(vec![bucket_image("https://storage.googleapis.com/b/1.png")]),
            Ok(vec![bucket_image("https://storage.googleapis.com/b/2.png")]),
            Ok(vec![bucket_image("https://storage.googleapis.com/b/3.png")]),
            Ok(vec![bucket_image("https://storage.googleapis.com/b/4.png")]),
        ]);
        let state = state(ScriptedStoryAgent::ok(&[], story), Some(images));
        let mut sink = RecordingSink::new();

        run_story_turn(&mut sink, &state, "a dragon").await.unwrap();

        assert_eq!(
            type_tags(&sink.messages),
            vec![
                "story_complete",
                "tool_call",
                "image_generated",
                "tool_call",
                "image_generated",
                "tool_call",
                "image_generated",
                "tool_call",
                "image_generated",
                "turn_complete",
            ]
        );

        match &sink.messages[0] {
            ServerMessage::StoryComplete { data } => {
                assert!(data.starts_with("[SCENE 1]\nText 1."));
                assert!(data.contains("[SCENE 4]\nText 4."));
            }
            other => panic!("Expected StoryComplete, got {other:?}"),
        }
        match &sink.messages[2] {
            ServerMessage::ImageGenerated { data } => {
                assert_eq!(data.index, 0);
                assert_eq!(data.scene_title, "Scene 1");
                assert!(data.stored_in_bucket);
            }
            other => panic!("Expected ImageGenerated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn story_failure_reports_error_without_turn_complete() {
        let state = state(
            ScriptedStoryAgent::failing(StoryError::EmptyResponse),
            None,
        );
        let mut sink = RecordingSink::new();

        run_story_turn(&mut sink, &state, "a dragon").await.unwrap();

        assert_eq!(type_tags(&sink.messages), vec!["error"]);
        match &sink.messages[0] {
            ServerMessage::Error { message } => {
                assert!(message.starts_with("Story generation failed:"));
            }
            other => panic!("Expected Error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn image_failure_degrades_to_placeholder_and_turn_completes() {
        let story = StoryData {
            scenes: four_scene_story().scenes.into_iter().take(2).collect(),
            ..Default::default()
        };
        let images = ScriptedImageAgent::new(vec![
            Err(ImageError::NoImages),
            Ok(vec![bucket_image("https://storage.googleapis.com/b/2.png")]),
        ]);
        let state = state(ScriptedStoryAgent::ok(&[], story), Some(images));
        let mut sink = RecordingSink::new();

        run_story_turn(&mut sink, &state, "a dragon").await.unwrap();

        let tags = type_tags(&sink.messages);
        assert_eq!(*tags.last().unwrap(), "turn_complete");

        let placeholders: Vec<_> = sink
            .messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::ImageGenerated { data } if data.placeholder == Some(true) => {
                    Some(data)
                }
                _ => None,
            })
            .collect();
        assert_eq!(placeholders.len(), 1);
        assert_eq!(placeholders[0].index, 0);
        assert!(placeholders[0].error.as_deref().unwrap().contains("no images"));
    }

    #[tokio::test]
    async fn every_third_delta_is_forwarded_as_partial_chunk() {
        let deltas = ["d1", "d2", "d3", "d4", "d5", "d6", "d7"];
        let state = state(ScriptedStoryAgent::ok(&deltas, four_scene_story()), None);
        let mut sink = RecordingSink::new();

        run_story_turn(&mut sink, &state, "a dragon").await.unwrap();

        let partials: Vec<_> = sink
            .messages
            .iter()
            .filter_map(|m| match m {
                ServerMessage::StoryChunk { data, partial: true } => Some(data.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(partials, vec!["d3", "d6"]);
    }

    #[tokio::test]
    async fn at_most_four_scenes_are_illustrated() {
        let mut story = four_scene_story();
        story.scenes.push(Scene {
            index: 5,
            title: "Scene 5".to_string(),
            description: "Extra".to_string(),
            text: "Extra.".to_string(),
        });
        let images = ScriptedImageAgent::new(vec![
            Ok(vec![bucket_image("u1")]),
            Ok(vec![bucket_image("u2")]),
            Ok(vec![bucket_image("u3")]),
            Ok(vec![bucket_image("u4")]),
            // A fifth call would panic the scripted agent
        ]);
        let state = state(ScriptedStoryAgent::ok(&[], story), Some(images));
        let mut sink = RecordingSink::new();

        run_story_turn(&mut sink, &state, "a dragon").await.unwrap();

        let tool_calls = type_tags(&sink.messages)
            .iter()
            .filter(|t| **t == "tool_call")
            .count();
        assert_eq!(tool_calls, MAX_IMAGE_SLOTS);
    }

    #[tokio::test]
    async fn missing_image_agent_still_completes_turn() {
        let state = state(ScriptedStoryAgent::ok(&[], four_scene_story()), None);
        let mut sink = RecordingSink::new();

        run_story_turn(&mut sink, &state, "a dragon").await.unwrap();

        assert_eq!(
            type_tags(&sink.messages),
            vec!["story_complete", "turn_complete"]
        );
    }

    #[tokio::test]
    async fn large_story_is_chunked_before_completion_marker() {
        let mut story = four_scene_story();
        story.scenes[0].text = "long ".repeat(600); // pushes past 2000 bytes
        let state = state(ScriptedStoryAgent::ok(&[], story), None);
        let mut sink = RecordingSink::new();

        run_story_turn(&mut sink, &state, "a dragon").await.unwrap();

        let tags = type_tags(&sink.messages);
        assert!(tags.iter().filter(|t| **t == "story_chunk").count() >= 2);
        // The empty completion marker follows the chunks
        let complete = sink
            .messages
            .iter()
            .find_map(|m| match m {
                ServerMessage::StoryComplete { data } => Some(data.clone()),
                _ => None,
            })
            .unwrap();
        assert!(complete.is_empty());
    }

    #[tokio::test]
    async fn closed_sink_aborts_the_turn() {
        let state = state(ScriptedStoryAgent::ok(&[], four_scene_story()), None);
        let mut sink = RecordingSink::new();
        sink.fail_after = Some(0);

        assert!(run_story_turn(&mut sink, &state, "a dragon").await.is_err());
        assert!(sink.messages.is_empty());
    }

    #[tokio::test]
    async fn tool_call_carries_scene_metadata() {
        let story = StoryData {
            scenes: vec![Scene {
                index: 1,
                title: "The Setup".to_string(),
                description: "A robot in the rain".to_string(),
                text: "Text.".to_string(),
            }],
            ..Default::default()
        };
        let images = ScriptedImageAgent::new(vec![Ok(vec![bucket_image("u")])]);
        let state = state(ScriptedStoryAgent::ok(&[], story), Some(images));
        let mut sink = RecordingSink::new();

        run_story_turn(&mut sink, &state, "a dragon").await.unwrap();

        let tool_call = sink
            .messages
            .iter()
            .find_map(|m| match m {
                ServerMessage::ToolCall { name, args } => Some((name.clone(), args.clone())),
                _ => None,
            })
            .unwrap();
        assert_eq!(tool_call.0, "generate_image");
        assert_eq!(tool_call.1["title"], "The Setup");
        assert_eq!(tool_call.1["index"], 1);
    }
}
