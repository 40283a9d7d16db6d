use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use tracing::warn;

use crate::config::OverlaySection;
use crate::models::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverlayPosition {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
    Left,
    Right,
    Center,
    TopCenter,
    BottomCenter,
}

impl OverlayPosition {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverlayPosition::TopLeft => "top-left",
            OverlayPosition::TopRight => "top-right",
            OverlayPosition::BottomLeft => "bottom-left",
            OverlayPosition::BottomRight => "bottom-right",
            OverlayPosition::Left => "left",
            OverlayPosition::Right => "right",
            OverlayPosition::Center => "center",
            OverlayPosition::TopCenter => "top-center",
            OverlayPosition::BottomCenter => "bottom-center",
        }
    }
}

impl Default for OverlayPosition {
    fn default() -> Self {
        OverlayPosition::TopLeft
    }
}

impl fmt::Display for OverlayPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverlayPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "top-left" => Ok(OverlayPosition::TopLeft),
            "top-right" => Ok(OverlayPosition::TopRight),
            "bottom-left" => Ok(OverlayPosition::BottomLeft),
            "bottom-right" => Ok(OverlayPosition::BottomRight),
            "left" => Ok(OverlayPosition::Left),
            "right" => Ok(OverlayPosition::Right),
            "center" => Ok(OverlayPosition::Center),
            "top-center" | "top" => Ok(OverlayPosition::TopCenter),
            "bottom-center" | "bottom" => Ok(OverlayPosition::BottomCenter),
            other => Err(format!("unknown overlay position '{other}'")),
        }
    }
}

const NAMED_COLORS: [&str; 18] = [
    "white", "black", "red", "green", "blue", "yellow", "orange", "purple", "pink", "gray",
    "grey", "cyan", "magenta", "lime", "navy", "teal", "silver", "transparent",
];

/// Accepts `#rgb`, `#rrggbb` and a small set of CSS colour names.
pub fn is_valid_color(value: &str) -> bool {
    let value = value.trim();
    if let Some(hex) = value.strip_prefix('#') {
        return matches!(hex.len(), 3 | 6) && hex.chars().all(|c| c.is_ascii_hexdigit());
    }
    NAMED_COLORS.contains(&value.to_ascii_lowercase().as_str())
}

const FONT_WEIGHTS: [&str; 13] = [
    "normal", "bold", "bolder", "lighter", "100", "200", "300", "400", "500", "600", "700",
    "800", "900",
];
const FONT_STYLES: [&str; 3] = ["normal", "italic", "oblique"];

pub const FONT_SIZE_RANGE: (u32, u32) = (8, 96);
pub const MESSAGE_DURATION_RANGE: (f64, f64) = (1.0, 300.0);

/// Style snapshot a render job is started with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectiveOverlayConfig {
    pub font_family: String,
    pub font_size: u32,
    pub font_style: String,
    pub font_weight: String,
    pub text_color: String,
    pub text_shadow_color: String,
    pub text_shadow_size: u32,
    pub overlay_width: u32,
    pub overlay_height: Option<u32>,
    pub position: OverlayPosition,
    pub padding: u32,
    pub message_duration_seconds: f64,
    pub frame_rate: Option<f64>,
    pub char_width_ratio: f64,
    pub line_height_ratio: f64,
    pub min_width: u32,
    pub min_height: u32,
    pub max_message_chars: usize,
}

impl EffectiveOverlayConfig {
    pub fn line_height(&self) -> f64 {
        f64::from(self.font_size) * self.line_height_ratio
    }

    pub fn char_width(&self) -> f64 {
        f64::from(self.font_size) * self.char_width_ratio
    }
}

/// Merges the channel's style bag over the configured defaults. Values that
/// do not validate are dropped with a warning.
pub fn apply_channel_config(channel: &Channel, defaults: &OverlaySection) -> EffectiveOverlayConfig {
    let style = &channel.overlay;
    let login = channel.login.as_str();

    let fallback_position = defaults.position.parse::<OverlayPosition>().unwrap_or_else(|err: String| {
        warn!(error = %err, "invalid default overlay position; using top-left");
        OverlayPosition::default()
    });
    let position = match style.position.as_deref() {
        None => fallback_position,
        Some(raw) => raw.parse::<OverlayPosition>().unwrap_or_else(|err: String| {
            warn!(channel = login, error = %err, "ignoring channel overlay position");
            fallback_position
        }),
    };

    let color = |field: &str, value: Option<&String>, default: &str| -> String {
        match value {
            Some(raw) if is_valid_color(raw) => raw.trim().to_string(),
            Some(raw) => {
                warn!(channel = login, field, value = %raw, "ignoring invalid colour");
                default.to_string()
            }
            None => default.to_string(),
        }
    };
    let keyword = |field: &str, value: Option<&String>, allowed: &[&str], default: &str| -> String {
        match value {
            Some(raw) if allowed.contains(&raw.trim().to_ascii_lowercase().as_str()) => {
                raw.trim().to_ascii_lowercase()
            }
            Some(raw) => {
                warn!(channel = login, field, value = %raw, "ignoring invalid font keyword");
                default.to_string()
            }
            None => default.to_string(),
        }
    };

    let font_size = match style.font_size {
        Some(size) if (FONT_SIZE_RANGE.0..=FONT_SIZE_RANGE.1).contains(&size) => size,
        Some(size) => {
            warn!(channel = login, size, "font size out of range; using default");
            defaults.font_size
        }
        None => defaults.font_size,
    };
    let message_duration_seconds = match style.message_duration_seconds {
        Some(seconds)
            if (MESSAGE_DURATION_RANGE.0..=MESSAGE_DURATION_RANGE.1).contains(&seconds) =>
        {
            seconds
        }
        Some(seconds) => {
            warn!(channel = login, seconds, "message duration out of range; using default");
            defaults.message_duration_seconds
        }
        None => defaults.message_duration_seconds,
    };
    let font_family = style
        .font_family
        .as_deref()
        .map(str::trim)
        .filter(|family| !family.is_empty())
        .unwrap_or(&defaults.font_family)
        .to_string();

    EffectiveOverlayConfig {
        font_family,
        font_size,
        font_style: keyword("font_style", style.font_style.as_ref(), &FONT_STYLES[..], &defaults.font_style),
        font_weight: keyword(
            "font_weight",
            style.font_weight.as_ref(),
            &FONT_WEIGHTS[..],
            &defaults.font_weight,
        ),
        text_color: color("text_color", style.text_color.as_ref(), &defaults.text_color),
        text_shadow_color: color(
            "text_shadow_color",
            style.text_shadow_color.as_ref(),
            &defaults.text_shadow_color,
        ),
        text_shadow_size: style.text_shadow_size.unwrap_or(defaults.text_shadow_size).min(20),
        overlay_width: style.overlay_width.unwrap_or(defaults.overlay_width).max(1),
        overlay_height: style.overlay_height.or(defaults.overlay_height),
        position,
        padding: style.padding.unwrap_or(defaults.padding),
        message_duration_seconds,
        frame_rate: defaults.frame_rate.filter(|fps| *fps > 0.0),
        char_width_ratio: defaults.char_width_ratio.max(0.1),
        line_height_ratio: defaults.line_height_ratio.max(0.5),
        min_width: defaults.min_width,
        min_height: defaults.min_height,
        max_message_chars: defaults.max_message_chars.max(4),
    }
}
