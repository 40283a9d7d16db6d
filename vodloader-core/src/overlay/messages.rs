use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::models::ChatMessage;

/// A chat message placed on the video timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedMessage<'a> {
    /// Seconds since the start of the video.
    pub offset: f64,
    pub message: &'a ChatMessage,
}

/// Converts absolute timestamps into video offsets, drops everything outside
/// `[0, duration]` and sorts ascending by offset. Messages sharing a
/// platform id are kept once.
pub fn prepare_messages<'a>(
    messages: &'a [ChatMessage],
    video_start: DateTime<Utc>,
    duration: f64,
) -> Vec<PreparedMessage<'a>> {
    let mut seen = HashSet::new();
    let mut prepared: Vec<PreparedMessage<'a>> = messages
        .iter()
        .filter_map(|message| {
            let micros = (message.timestamp - video_start).num_microseconds()?;
            let offset = micros as f64 / 1_000_000.0;
            (0.0..=duration).contains(&offset).then_some(PreparedMessage { offset, message })
        })
        .collect();
    prepared.sort_by(|a, b| {
        a.offset
            .total_cmp(&b.offset)
            .then_with(|| a.message.id.cmp(&b.message.id))
    });
    prepared.retain(|entry| seen.insert(entry.message.id.as_str()));
    debug!(
        total = messages.len(),
        kept = prepared.len(),
        "prepared chat messages"
    );
    prepared
}
