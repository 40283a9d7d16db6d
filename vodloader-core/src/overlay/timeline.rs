use serde::Serialize;

use super::layout::OverlayLayout;
use super::messages::PreparedMessage;
use super::style::{is_valid_color, EffectiveOverlayConfig};
use super::template::sanitize_text;

const VISIBILITY_EPSILON: f64 = 1e-9;

/// One text row of the overlay, top to bottom.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedLine {
    /// Set only on the first row of a message shown in full.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_color: Option<String>,
    pub text: String,
}

/// Everything the surface needs to draw one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FrameLayout {
    pub lines: Vec<RenderedLine>,
}

impl FrameLayout {
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[derive(Debug, Clone)]
struct TimelineEntry {
    offset: f64,
    author: String,
    color: Option<String>,
    lines: Vec<String>,
}

/// Pre-wrapped chat transcript that answers "what is on screen at `t`".
#[derive(Debug, Clone)]
pub struct ChatTimeline {
    entries: Vec<TimelineEntry>,
    message_duration: f64,
    max_lines: usize,
}

impl ChatTimeline {
    /// `messages` must come from [`super::prepare_messages`], i.e. sorted by
    /// offset.
    pub fn new(
        messages: &[PreparedMessage<'_>],
        config: &EffectiveOverlayConfig,
        layout: &OverlayLayout,
    ) -> Self {
        let entries = messages
            .iter()
            .map(|prepared| {
                let author = sanitize_text(&prepared.message.author, 64);
                let text = sanitize_text(&prepared.message.text, config.max_message_chars);
                let prefix = author.chars().count() + 2;
                let first_width = layout.chars_per_line.saturating_sub(prefix);
                TimelineEntry {
                    offset: prepared.offset,
                    lines: wrap_words(&text, first_width, layout.chars_per_line),
                    color: prepared
                        .message
                        .color
                        .as_deref()
                        .filter(|color| is_valid_color(color))
                        .map(str::to_string),
                    author,
                }
            })
            .collect();
        Self {
            entries,
            message_duration: config.message_duration_seconds,
            max_lines: layout.max_lines,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Messages posted at or before `t` and younger than the message
    /// duration, newest at the bottom. A message that does not fit shows its
    /// trailing rows only, without the author.
    pub fn layout_at(&self, t: f64) -> FrameLayout {
        let upper = self.entries.partition_point(|entry| entry.offset <= t);
        let mut blocks: Vec<Vec<RenderedLine>> = Vec::new();
        let mut used = 0usize;
        for entry in self.entries[..upper].iter().rev() {
            if t - entry.offset > self.message_duration + VISIBILITY_EPSILON {
                break;
            }
            let available = self.max_lines.saturating_sub(used);
            if available == 0 {
                break;
            }
            let truncated = entry.lines.len() > available;
            let shown = &entry.lines[entry.lines.len() - entry.lines.len().min(available)..];
            let block: Vec<RenderedLine> = shown
                .iter()
                .enumerate()
                .map(|(index, text)| {
                    let with_author = !truncated && index == 0;
                    RenderedLine {
                        author: with_author.then(|| entry.author.clone()),
                        author_color: if with_author { entry.color.clone() } else { None },
                        text: text.clone(),
                    }
                })
                .collect();
            used += block.len();
            blocks.push(block);
        }
        FrameLayout {
            lines: blocks.into_iter().rev().flatten().collect(),
        }
    }
}

/// Greedy word wrap in character cells. The first row is `first_width`
/// wide to leave room for the author prefix; a word longer than its row
/// gets a row of its own.
pub fn wrap_words(text: &str, first_width: usize, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_len = 0usize;
    let mut first = true;

    for word in text.split_whitespace() {
        let word_len = word.chars().count();
        let available = if first { first_width } else { width };
        if word_len > available {
            if !current.is_empty() {
                lines.push(current.join(" "));
                current.clear();
                current_len = 0;
            }
            lines.push(word.to_string());
            first = false;
            continue;
        }
        let candidate = if current.is_empty() {
            word_len
        } else {
            current_len + 1 + word_len
        };
        if candidate <= available {
            current.push(word);
            current_len = candidate;
        } else {
            if !current.is_empty() {
                lines.push(current.join(" "));
            }
            current = vec![word];
            current_len = word_len;
            first = false;
        }
    }
    if !current.is_empty() {
        lines.push(current.join(" "));
    }
    if lines.is_empty() {
        lines.push(String::new());
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverlaySection;
    use crate::models::{Channel, ChatMessage};
    use crate::overlay::messages::prepare_messages;
    use crate::overlay::style::apply_channel_config;
    use chrono::{Duration, TimeZone, Utc};

    fn message(id: &str, author: &str, text: &str, offset_ms: i64) -> ChatMessage {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        ChatMessage {
            id: id.to_string(),
            channel_id: "1".into(),
            author: author.into(),
            text: text.into(),
            color: Some("#00ff00".into()),
            badges: Vec::new(),
            moderator: false,
            subscriber: false,
            first_message: false,
            timestamp: start + Duration::milliseconds(offset_ms),
        }
    }

    fn timeline(messages: &[ChatMessage], max_lines: usize) -> ChatTimeline {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let config = apply_channel_config(&Channel::new("1", "c"), &OverlaySection::default());
        let mut layout = OverlayLayout::compute(&config, 1920, 1080);
        layout.max_lines = max_lines;
        let prepared = prepare_messages(messages, start, 3_600.0);
        ChatTimeline::new(&prepared, &config, &layout)
    }

    #[test]
    fn wraps_on_word_boundaries() {
        assert_eq!(
            wrap_words("the quick brown fox jumps", 5, 10),
            vec!["the", "quick", "brown fox", "jumps"]
        );
        assert_eq!(wrap_words("   ", 5, 10), vec![""]);
        assert_eq!(
            wrap_words("hi supercalifragilistic ok", 10, 10),
            vec!["hi", "supercalifragilistic", "ok"]
        );
    }

    #[test]
    fn message_visible_for_exactly_its_duration() {
        let messages = vec![message("1", "alice", "hello", 5_000)];
        let timeline = timeline(&messages, 10);
        assert!(timeline.layout_at(4.9).is_empty());
        for t in [5.0, 20.0, 35.0] {
            let layout = timeline.layout_at(t);
            assert_eq!(layout.lines.len(), 1, "at {t}");
            assert_eq!(layout.lines[0].author.as_deref(), Some("alice"));
            assert_eq!(layout.lines[0].text, "hello");
        }
        assert!(timeline.layout_at(35.1).is_empty());
    }

    #[test]
    fn newest_message_is_at_the_bottom() {
        let messages = vec![
            message("1", "alice", "first", 1_000),
            message("2", "bob", "second", 2_000),
        ];
        let layout = timeline(&messages, 10).layout_at(3.0);
        let authors: Vec<_> = layout.lines.iter().map(|l| l.author.clone()).collect();
        assert_eq!(authors, vec![Some("alice".into()), Some("bob".into())]);
    }

    #[test]
    fn truncated_message_shows_tail_without_author() {
        let long = "one two three four five six seven eight nine ten eleven twelve thirteen";
        let messages = vec![
            message("1", "alice", long, 1_000),
            message("2", "bob", "latest", 2_000),
        ];
        let timeline = timeline(&messages, 3);
        let layout = timeline.layout_at(2.5);
        assert_eq!(layout.lines.len(), 3);
        assert_eq!(layout.lines[2].author.as_deref(), Some("bob"));
        assert!(layout.lines[..2].iter().all(|line| line.author.is_none()));
        assert!(layout.lines[1].text.ends_with("thirteen"));
    }

    #[test]
    fn invalid_author_colors_are_dropped() {
        let mut bad = message("1", "alice", "hi", 0);
        bad.color = Some("url(evil)".into());
        let layout = timeline(&[bad], 5).layout_at(1.0);
        assert_eq!(layout.lines[0].author_color, None);
    }
}
