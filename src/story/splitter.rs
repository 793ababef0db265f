//! Frame splitter — divides story text into the four scene panels.
//!
//! Best-effort text layout with three fallback tiers: `[SCENE N]` markers,
//! blank-line paragraphs, then sentences. There is no correctness guarantee;
//! the output is cosmetic panel text, and pathological input simply produces
//! lopsided panels.

use regex::Regex;
use std::sync::OnceLock;

/// Number of panels in the story layout.
pub const FRAME_COUNT: usize = 4;

fn scene_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\[SCENE\s*(\d+)\]").expect("valid scene marker regex"))
}

/// Split `text` into exactly [`FRAME_COUNT`] panels.
///
/// Tier 1 honors explicit `[SCENE N]` markers; tier 2 groups blank-line
/// paragraphs evenly; tier 3 groups sentences evenly. Missing pieces leave
/// trailing panels empty.
pub fn split_into_frames(text: &str) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return vec![String::new(); FRAME_COUNT];
    }

    if let Some(frames) = split_by_markers(text) {
        return frames;
    }

    let paragraphs: Vec<&str> = text
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if paragraphs.len() > 1 {
        return group_evenly(&paragraphs, "\n\n");
    }

    let sentences = split_sentences(text);
    group_evenly(&sentences, " ")
}

/// Tier 1: assign the text following each `[SCENE N]` marker to panel N-1.
/// Returns `None` when no marker is present.
fn split_by_markers(text: &str) -> Option<Vec<String>> {
    let re = scene_marker();
    let mut matches = re.captures_iter(text).peekable();
    matches.peek()?;

    let mut frames = vec![String::new(); FRAME_COUNT];
    let mut fallthrough = 0usize; // next panel for out-of-range indices

    let spans: Vec<(usize, usize, usize)> = re
        .captures_iter(text)
        .map(|cap| {
            let whole = cap.get(0).expect("match has a full span");
            let index: usize = cap[1].parse().unwrap_or(0);
            (whole.start(), whole.end(), index)
        })
        .collect();

    for (i, &(_, body_start, index)) in spans.iter().enumerate() {
        let body_end = spans.get(i + 1).map(|&(s, _, _)| s).unwrap_or(text.len());
        let body = text[body_start..body_end].trim();

        let panel = if (1..=FRAME_COUNT).contains(&index) {
            index - 1
        } else {
            fallthrough.min(FRAME_COUNT - 1)
        };
        fallthrough = (panel + 1).min(FRAME_COUNT - 1);

        if !frames[panel].is_empty() {
            frames[panel].push_str("\n\n");
        }
        frames[panel].push_str(body);
    }

    Some(frames)
}

/// Tier 3 tokenizer: split on sentence terminators, keeping the terminator
/// with its sentence.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut iter = text.char_indices().peekable();

    while let Some((i, ch)) = iter.next() {
        if matches!(ch, '.' | '!' | '?') {
            // Consume any run of terminators ("?!", "...")
            let mut end = i + ch.len_utf8();
            while let Some(&(j, next)) = iter.peek() {
                if matches!(next, '.' | '!' | '?') {
                    end = j + next.len_utf8();
                    iter.next();
                } else {
                    break;
                }
            }
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                sentences.push(sentence);
            }
            start = end;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}

/// Distribute `pieces` over [`FRAME_COUNT`] panels as evenly as possible,
/// earlier panels taking the remainder. Fewer pieces than panels leaves
/// trailing panels empty.
fn group_evenly(pieces: &[&str], joiner: &str) -> Vec<String> {
    let mut frames = vec![String::new(); FRAME_COUNT];
    if pieces.is_empty() {
        return frames;
    }

    let base = pieces.len() / FRAME_COUNT;
    let extra = pieces.len() % FRAME_COUNT;
    let mut cursor = 0;

    for (panel, frame) in frames.iter_mut().enumerate() {
        let take = base + usize::from(panel < extra);
        if take == 0 {
            continue;
        }
        *frame = pieces[cursor..cursor + take].join(joiner);
        cursor += take;
    }
    frames
}
