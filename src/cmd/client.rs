//! Terminal client — `storygen client`.
//!
//! Connects to a running gateway, requests a story, and renders the
//! streamed turn: status updates on a spinner, the finished story as four
//! framed panels, and received images saved to disk or printed as URLs.
//!
//! A dropped connection is retried on a fixed 3-second timer (no backoff,
//! no jitter); each reconnect starts a fresh turn, since the gateway keeps
//! no per-user state across sockets.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use console::style;
use futures_util::{SinkExt, StreamExt};
use indicatif::ProgressBar;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use uuid::Uuid;

use storygen::protocol::{ClientMessage, ImagePayload, ServerMessage};
use storygen::story::splitter::split_into_frames;

const RECONNECT_DELAY: Duration = Duration::from_secs(3);
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Why a session ended without completing the turn.
enum SessionEnd {
    /// Transport dropped; eligible for reconnect.
    Dropped(String),
    /// Unrecoverable; surface to the user.
    Fatal(anyhow::Error),
}

pub async fn cmd_client(
    url: &str,
    keywords: &str,
    save_images: Option<&Path>,
    max_reconnects: u32,
) -> Result<()> {
    let user_id = Uuid::new_v4().simple().to_string()[..8].to_string();
    let ws_url = ws_endpoint(url, &user_id);
    println!(
        "Connecting to {} as user {}",
        style(&ws_url).dim(),
        style(&user_id).bold()
    );

    let mut attempts = 0u32;
    loop {
        match run_session(&ws_url, keywords, save_images).await {
            Ok(()) => return Ok(()),
            Err(SessionEnd::Dropped(reason)) if attempts < max_reconnects => {
                attempts += 1;
                println!(
                    "{} {reason}; reconnecting in {}s ({attempts}/{max_reconnects})",
                    style("connection lost:").yellow(),
                    RECONNECT_DELAY.as_secs()
                );
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
            Err(SessionEnd::Dropped(reason)) => {
                return Err(anyhow!(
                    "gave up after {max_reconnects} reconnect attempts: {reason}"
                ));
            }
            Err(SessionEnd::Fatal(e)) => return Err(e),
        }
    }
}

/// `ws://host:port` + `/ws/{user_id}`.
fn ws_endpoint(base_url: &str, user_id: &str) -> String {
    format!("{}/ws/{user_id}", base_url.trim_end_matches('/'))
}

/// One connection's lifetime: request a story, consume events until
/// `turn_complete` (Ok), drop (Dropped), or server error (Fatal).
async fn run_session(
    ws_url: &str,
    keywords: &str,
    save_images: Option<&Path>,
) -> Result<(), SessionEnd> {
    let (ws_stream, _) = connect_async(ws_url)
        .await
        .map_err(|e| SessionEnd::Dropped(format!("connect failed: {e}")))?;
    let (mut write, mut read) = ws_stream.split();

    let request = serde_json::to_string(&ClientMessage::GenerateStory {
        data: keywords.to_string(),
    })
    .expect("client message serializes");
    write
        .send(Message::text(request))
        .await
        .map_err(|e| SessionEnd::Dropped(format!("send failed: {e}")))?;

    let spinner = ProgressBar::new_spinner();
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message("Waiting for the gateway...");

    let mut chunks: Vec<(String, bool)> = Vec::new();
    let mut final_text = String::new();
    let mut image_count = 0usize;

    loop {
        let incoming = tokio::time::timeout(IDLE_TIMEOUT, read.next()).await;
        let incoming = match incoming {
            Ok(incoming) => incoming,
            Err(_) => {
                spinner.finish_and_clear();
                return Err(SessionEnd::Fatal(anyhow!(
                    "no message from the gateway for {}s",
                    IDLE_TIMEOUT.as_secs()
                )));
            }
        };

        let message = match incoming {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<ServerMessage>(text.as_str()) {
                    Ok(message) => message,
                    Err(_) => continue, // tolerate unknown frames
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                spinner.finish_and_clear();
                return Err(SessionEnd::Dropped("server closed the connection".into()));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                spinner.finish_and_clear();
                return Err(SessionEnd::Dropped(e.to_string()));
            }
        };

        match message {
            ServerMessage::Connected { message } | ServerMessage::Processing { message } => {
                spinner.set_message(message);
            }
            ServerMessage::StoryChunk { data, partial } => {
                chunks.push((data, partial));
                spinner.set_message(format!("Streaming story... {} chunks", chunks.len()));
            }
            ServerMessage::StoryComplete { data } => {
                final_text = if data.is_empty() {
                    assemble_final_text(&chunks)
                } else {
                    data
                };
                spinner.set_message("Story received; waiting for illustrations...");
            }
            ServerMessage::ToolCall { name, args } => {
                let title = args["title"].as_str().unwrap_or("scene");
                spinner.set_message(format!("{name}: {title}"));
            }
            ServerMessage::ImageGenerated { data } => {
                image_count += 1;
                report_image(&spinner, &data, save_images)
                    .map_err(SessionEnd::Fatal)?;
            }
            ServerMessage::TurnComplete { .. } => {
                spinner.finish_and_clear();
                render_panels(&final_text);
                println!(
                    "{} {} image slot(s) received",
                    style("done:").green().bold(),
                    image_count
                );
                return Ok(());
            }
            ServerMessage::Error { message } => {
                spinner.finish_and_clear();
                return Err(SessionEnd::Fatal(anyhow!("server error: {message}")));
            }
            ServerMessage::Pong => {}
        }
    }
}

/// The authoritative story text. Large stories are re-sent in chunks after
/// the raw streaming deltas; the re-send starts with the first scene marker,
/// so everything from the last chunk opening with `[SCENE 1]` onwards is the
/// real text. Best effort: markerless fallback stories just concatenate
/// everything.
fn assemble_final_text(chunks: &[(String, bool)]) -> String {
    let start = chunks
        .iter()
        .rposition(|(data, _)| data.trim_start().starts_with("[SCENE 1]"))
        .unwrap_or(0);
    chunks[start..].iter().map(|(data, _)| data.as_str()).collect()
}

fn report_image(
    spinner: &ProgressBar,
    payload: &ImagePayload,
    save_images: Option<&Path>,
) -> Result<()> {
    let scene_number = payload.index + 1;

    if payload.placeholder == Some(true) {
        spinner.println(format!(
            "{} scene {scene_number} ({}): {}",
            style("image failed:").red(),
            payload.scene_title,
            payload.error.as_deref().unwrap_or("unknown error")
        ));
        return Ok(());
    }

    if let Some(url) = &payload.gcs_url {
        spinner.println(format!(
            "{} scene {scene_number}: {url}",
            style("image:").green()
        ));
    }

    if let (Some(encoded), Some(dir)) = (&payload.base64, save_images) {
        let bytes = BASE64
            .decode(encoded)
            .context("image payload carried invalid base64")?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join(format!("scene_{scene_number}.{}", payload.format));
        std::fs::write(&path, bytes)
            .with_context(|| format!("failed to write {}", path.display()))?;
        spinner.println(format!(
            "{} scene {scene_number} saved to {}",
            style("image:").green(),
            path.display()
        ));
    } else if payload.gcs_url.is_none() && payload.base64.is_some() {
        spinner.println(format!(
            "{} scene {scene_number}: inline image received (pass --save-images to keep it)",
            style("image:").green()
        ));
    }

    Ok(())
}

/// Lay the story out as four framed panels.
fn render_panels(story_text: &str) {
    let width = terminal_size::terminal_size()
        .map(|(w, _)| w.0 as usize)
        .unwrap_or(80)
        .clamp(40, 100);

    println!();
    for (i, frame) in split_into_frames(story_text).iter().enumerate() {
        println!(
            "{}",
            style(format!("── Scene {} ──", i + 1)).cyan().bold()
        );
        if frame.is_empty() {
            println!("{}", style("(empty)").dim());
        } else {
            println!("{}", textwrap::fill(frame, width.saturating_sub(2)));
        }
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_endpoint_joins_cleanly() {
        assert_eq!(
            ws_endpoint("ws://localhost:8000", "abc123"),
            "ws://localhost:8000/ws/abc123"
        );
        assert_eq!(
            ws_endpoint("wss://example.run.app/", "abc123"),
            "wss://example.run.app/ws/abc123"
        );
    }

    #[test]
    fn final_text_prefers_resent_marker_chunks() {
        let chunks = vec![
            ("{\"story\": \"raw delta".to_string(), true),
            (" fragment\"}".to_string(), true),
            ("[SCENE 1]\nOnce upon".to_string(), true),
            (" a time.".to_string(), false),
        ];
        assert_eq!(assemble_final_text(&chunks), "[SCENE 1]\nOnce upon a time.");
    }

    #[test]
    fn final_text_without_markers_concatenates_everything() {
        let chunks = vec![
            ("part one ".to_string(), true),
            ("part two".to_string(), false),
        ];
        assert_eq!(assemble_final_text(&chunks), "part one part two");
    }

    #[test]
    fn final_text_of_no_chunks_is_empty() {
        assert_eq!(assemble_final_text(&[]), "");
    }
}
