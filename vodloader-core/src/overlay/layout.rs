use serde::Serialize;
use tracing::info;

use super::style::{EffectiveOverlayConfig, OverlayPosition};

/// Placement of the overlay inside the video plus the text box inside the
/// overlay. All values are in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OverlayLayout {
    pub video_width: u32,
    pub video_height: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub padding: u32,
    pub content_width: u32,
    pub content_height: u32,
    pub line_height: f64,
    pub char_width: f64,
    pub max_lines: usize,
    pub chars_per_line: usize,
}

impl OverlayLayout {
    pub fn compute(config: &EffectiveOverlayConfig, video_width: u32, video_height: u32) -> Self {
        let padding = config.padding;
        let max_width = video_width.saturating_sub(padding).max(1);
        let max_height = video_height.saturating_sub(padding).max(1);

        let mut width = config.overlay_width;
        if width > max_width {
            info!(requested = width, width = max_width, "shrinking overlay width to fit video");
            width = max_width;
        }
        let mut height = match config.overlay_height {
            Some(height) => height,
            None => (video_height / 2).min(max_height),
        };
        if height > max_height {
            info!(requested = height, height = max_height, "shrinking overlay height to fit video");
            height = max_height;
        }
        // floors never push the overlay past the frame
        let width = width.max(config.min_width).min(video_width.max(1));
        let height = height.max(config.min_height).min(video_height.max(1));

        let (x, y) = position_coordinates(
            config.position,
            video_width,
            video_height,
            width,
            height,
            padding,
        );

        let content_width = width.saturating_sub(padding * 2).max(1);
        let content_height = height.saturating_sub(padding * 2).max(1);
        let line_height = config.line_height().max(1.0);
        let char_width = config.char_width().max(1.0);
        let max_lines = ((f64::from(content_height) / line_height).floor() as usize).max(1);
        let chars_per_line = ((f64::from(content_width) / char_width).floor() as usize).max(1);

        Self {
            video_width,
            video_height,
            x,
            y,
            width,
            height,
            padding,
            content_width,
            content_height,
            line_height,
            char_width,
            max_lines,
            chars_per_line,
        }
    }

    pub fn fits_in_video(&self) -> bool {
        self.x + self.width <= self.video_width && self.y + self.height <= self.video_height
    }
}

fn position_coordinates(
    position: OverlayPosition,
    video_width: u32,
    video_height: u32,
    width: u32,
    height: u32,
    padding: u32,
) -> (u32, u32) {
    let (vw, vh, w, h, p) = (
        i64::from(video_width),
        i64::from(video_height),
        i64::from(width),
        i64::from(height),
        i64::from(padding),
    );
    let right = vw - w - p;
    let bottom = vh - h - p;
    let middle_x = (vw - w) / 2;
    let middle_y = (vh - h) / 2;
    let (x, y) = match position {
        OverlayPosition::TopLeft => (p, p),
        OverlayPosition::TopRight => (right, p),
        OverlayPosition::BottomLeft => (p, bottom),
        OverlayPosition::BottomRight => (right, bottom),
        OverlayPosition::Left => (p, middle_y),
        OverlayPosition::Right => (right, middle_y),
        OverlayPosition::Center => (middle_x, middle_y),
        OverlayPosition::TopCenter => (middle_x, p),
        OverlayPosition::BottomCenter => (middle_x, bottom),
    };
    let x = x.clamp(0, (vw - w).max(0));
    let y = y.clamp(0, (vh - h).max(0));
    (x as u32, y as u32)
}
