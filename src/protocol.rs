//! Wire protocol for the `/ws/{user_id}` endpoint.
//!
//! Every frame is a JSON object with a `type` discriminator. The message set
//! and field names are fixed; browser clients dispatch on them directly.
//!
//! ## Message Flow
//!
//! | Direction        | Types                                                   |
//! |------------------|---------------------------------------------------------|
//! | client → server  | `generate_story`, `ping`                                |
//! | server → client  | `connected`, `processing`, `story_chunk`, `story_complete`, `tool_call`, `image_generated`, `turn_complete`, `error`, `pong` |
//!
//! Stories larger than [`STORY_CHUNK_SIZE`] bytes are re-sent as successive
//! `story_chunk` frames (`partial: true` for all but the last) followed by an
//! empty `story_complete`; smaller stories arrive as a single
//! `story_complete` carrying the full text.

use serde::{Deserialize, Serialize};

/// Ceiling for a single `story_chunk` payload, in bytes. Keeps individual
/// frames comfortably under WebSocket proxy message limits.
pub const STORY_CHUNK_SIZE: usize = 2000;

// ── Client → server ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Kick off a generation turn; `data` is the keyword string.
    GenerateStory {
        #[serde(default)]
        data: String,
    },
    /// Keepalive; answered with `pong`.
    Ping,
}

// ── Server → client ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        message: String,
    },
    Processing {
        message: String,
    },
    StoryChunk {
        data: String,
        partial: bool,
    },
    StoryComplete {
        data: String,
    },
    /// Relayed once per scene before the image model is invoked.
    ToolCall {
        name: String,
        args: serde_json::Value,
    },
    ImageGenerated {
        data: ImagePayload,
    },
    TurnComplete {
        turn_complete: bool,
    },
    Error {
        message: String,
    },
    Pong,
}

/// One image slot, keyed by 0-based scene index. Carries either a GCS URL,
/// inline base64, or an error placeholder for the degraded tile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagePayload {
    pub index: usize,
    pub scene_title: String,
    pub format: String,
    pub stored_in_bucket: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcs_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<bool>,
}

impl ImagePayload {
    /// The degraded tile sent when a scene's illustration fails.
    pub fn placeholder(index: usize, scene_title: &str, error: String) -> Self {
        Self {
            index,
            scene_title: scene_title.to_string(),
            format: "png".to_string(),
            stored_in_bucket: false,
            gcs_url: None,
            base64: None,
            error: Some(error),
            placeholder: Some(true),
        }
    }
}

// ── Chunking ─────────────────────────────────────────────────────────

/// Split `text` into pieces of at most `max_bytes` bytes, never splitting a
/// UTF-8 code point. Concatenating the pieces reproduces the input exactly.
pub fn chunk_utf8(text: &str, max_bytes: usize) -> Vec<&str> {
    debug_assert!(max_bytes >= 4, "max_bytes must fit any single code point");
    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.len() > max_bytes {
        let mut end = max_bytes;
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        let (head, tail) = rest.split_at(end);
        chunks.push(head);
        rest = tail;
    }
    chunks.push(rest);
    chunks
}

/// The exact frame sequence that delivers a finished story to the client.
pub fn story_delivery(story_text: &str) -> Vec<ServerMessage> {
    if story_text.len() <= STORY_CHUNK_SIZE {
        return vec![ServerMessage::StoryComplete {
            data: story_text.to_string(),
        }];
    }

    let chunks = chunk_utf8(story_text, STORY_CHUNK_SIZE);
    let last = chunks.len() - 1;
    let mut messages: Vec<ServerMessage> = chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| ServerMessage::StoryChunk {
            data: chunk.to_string(),
            partial: i != last,
        })
        .collect();
    // Content already went out in chunks; the completion marker is empty.
    messages.push(ServerMessage::StoryComplete {
        data: String::new(),
    });
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_generate_story_deserializes() {
        let json = r#"{"type": "generate_story", "data": "a friendly dragon"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::GenerateStory { data } => assert_eq!(data, "a friendly dragon"),
            _ => panic!("Expected GenerateStory"),
        }
    }

    #[test]
    fn client_ping_deserializes() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type": "ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }

    #[test]
    fn unknown_client_type_is_an_error() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type": "reboot"}"#).is_err());
    }

    #[test]
    fn server_message_tags_match_wire_format() {
        let cases = [
            (
                serde_json::to_string(&ServerMessage::Connected {
                    message: "hi".into(),
                })
                .unwrap(),
                r#""type":"connected""#,
            ),
            (
                serde_json::to_string(&ServerMessage::StoryChunk {
                    data: "x".into(),
                    partial: true,
                })
                .unwrap(),
                r#""type":"story_chunk""#,
            ),
            (
                serde_json::to_string(&ServerMessage::TurnComplete {
                    turn_complete: true,
                })
                .unwrap(),
                r#""type":"turn_complete""#,
            ),
            (
                serde_json::to_string(&ServerMessage::Pong).unwrap(),
                r#""type":"pong""#,
            ),
        ];
        for (json, tag) in cases {
            assert!(json.contains(tag), "{json} should contain {tag}");
        }
    }

    #[test]
    fn turn_complete_carries_flag_field() {
        let json = serde_json::to_string(&ServerMessage::TurnComplete {
            turn_complete: true,
        })
        .unwrap();
        assert!(json.contains(r#""turn_complete":true"#));
    }

    #[test]
    fn image_payload_omits_absent_fields() {
        let payload = ImagePayload {
            index: 2,
            scene_title: "The Climax".to_string(),
            format: "png".to_string(),
            stored_in_bucket: true,
            gcs_url: Some("https://storage.googleapis.com/b/o.png".to_string()),
            base64: None,
            error: None,
            placeholder: None,
        };
        let json = serde_json::to_string(&ServerMessage::ImageGenerated { data: payload }).unwrap();
        assert!(json.contains(r#""type":"image_generated""#));
        assert!(json.contains(r#""gcs_url""#));
        assert!(!json.contains(r#""base64""#));
        assert!(!json.contains(r#""placeholder""#));
    }

    #[test]
    fn placeholder_payload_marks_the_slot() {
        let payload = ImagePayload::placeholder(1, "The Setup", "Imagen quota".to_string());
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains(r#""placeholder":true"#));
        assert!(json.contains(r#""index":1"#));
        assert!(json.contains("Imagen quota"));
    }

    #[test]
    fn chunk_utf8_respects_ceiling_and_roundtrips() {
        let text = "abcdefghij".repeat(50); // 500 bytes
        let chunks = chunk_utf8(&text, 128);
        assert!(chunks.iter().all(|c| c.len() <= 128));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn chunk_utf8_never_splits_a_code_point() {
        // Each '🐉' is 4 bytes; a 10-byte ceiling lands mid-character.
        let text = "🐉🐉🐉🐉🐉";
        let chunks = chunk_utf8(text, 10);
        assert_eq!(chunks, vec!["🐉🐉", "🐉🐉", "🐉"]);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn chunk_utf8_small_input_is_single_chunk() {
        assert_eq!(chunk_utf8("short", 2000), vec!["short"]);
        assert_eq!(chunk_utf8("", 2000), vec![""]);
    }

    #[test]
    fn story_delivery_small_story_is_one_complete_frame() {
        let messages = story_delivery("a short story");
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            ServerMessage::StoryComplete { data } => assert_eq!(data, "a short story"),
            other => panic!("Expected StoryComplete, got {other:?}"),
        }
    }

    #[test]
    fn story_delivery_large_story_chunks_then_empty_complete() {
        let text = "word ".repeat(1000); // 5000 bytes
        let messages = story_delivery(&text);

        let (chunks, tail) = messages.split_at(messages.len() - 1);
        assert_eq!(chunks.len(), 3);
        let mut rebuilt = String::new();
        for (i, msg) in chunks.iter().enumerate() {
            match msg {
                ServerMessage::StoryChunk { data, partial } => {
                    assert_eq!(*partial, i != chunks.len() - 1);
                    rebuilt.push_str(data);
                }
                other => panic!("Expected StoryChunk, got {other:?}"),
            }
        }
        assert_eq!(rebuilt, text);
        match &tail[0] {
            ServerMessage::StoryComplete { data } => assert!(data.is_empty()),
            other => panic!("Expected StoryComplete, got {other:?}"),
        }
    }
}
