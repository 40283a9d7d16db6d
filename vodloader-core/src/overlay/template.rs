use serde::Serialize;

use super::layout::OverlayLayout;
use super::style::{is_valid_color, EffectiveOverlayConfig};
use super::timeline::FrameLayout;

const TEMPLATE: &str = include_str!("../../templates/overlay.html");
const VARS_MARKER: &str = "/*__OVERLAY_VARS__*/";
const SETTINGS_MARKER: &str = "/*__OVERLAY_SETTINGS__*/";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PageSettings {
    width: u32,
    height: u32,
    max_lines: usize,
    message_duration: f64,
}

/// Removes NUL bytes and truncates to `max_chars` characters, ending a
/// truncated text with `...`.
pub fn sanitize_text(text: &str, max_chars: usize) -> String {
    let cleaned: String = text
        .chars()
        .filter(|c| *c != '\0')
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();
    if cleaned.chars().count() <= max_chars {
        return cleaned;
    }
    let keep = max_chars.saturating_sub(3);
    let mut truncated: String = cleaned.chars().take(keep).collect();
    truncated.push_str("...");
    truncated
}

/// Keeps only characters that are safe inside a quoted CSS font name.
fn css_font_family(family: &str) -> String {
    let cleaned: String = family
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        "monospace".to_string()
    } else {
        format!("'{cleaned}', monospace")
    }
}

fn css_color(value: &str, fallback: &str) -> String {
    if is_valid_color(value) {
        value.trim().to_string()
    } else {
        fallback.to_string()
    }
}

/// JSON safe to embed in an inline `<script>`.
pub fn script_json<T: Serialize>(value: &T) -> serde_json::Result<String> {
    Ok(serde_json::to_string(value)?
        .replace("</", "<\\/")
        .replace('\u{2028}', "\\u2028")
        .replace('\u{2029}', "\\u2029"))
}

/// The page loaded into the rendering surface, parameterized with the job's
/// style and geometry.
pub fn render_document(
    config: &EffectiveOverlayConfig,
    layout: &OverlayLayout,
) -> serde_json::Result<String> {
    let vars = [
        ("--chat-font-family", css_font_family(&config.font_family)),
        ("--chat-font-size", format!("{}px", config.font_size)),
        ("--chat-font-style", config.font_style.clone()),
        ("--chat-font-weight", config.font_weight.clone()),
        ("--chat-text-color", css_color(&config.text_color, "#ffffff")),
        (
            "--chat-text-shadow-color",
            css_color(&config.text_shadow_color, "#000000"),
        ),
        (
            "--chat-text-shadow-size",
            format!("{}px", config.text_shadow_size),
        ),
        ("--chat-overlay-width", format!("{}px", layout.width)),
        ("--chat-overlay-height", format!("{}px", layout.height)),
        ("--chat-padding", format!("{}px", layout.padding)),
        ("--chat-line-height", format!("{:.2}px", layout.line_height)),
    ];
    let css: String = vars
        .iter()
        .map(|(name, value)| format!("    {name}: {value};\n"))
        .collect();
    let settings = script_json(&PageSettings {
        width: layout.width,
        height: layout.height,
        max_lines: layout.max_lines,
        message_duration: config.message_duration_seconds,
    })?;
    Ok(TEMPLATE
        .replace(VARS_MARKER, css.trim_end())
        .replace(SETTINGS_MARKER, &settings))
}

/// Script expression that draws `frame` on a loaded page.
pub fn render_call(frame: &FrameLayout) -> serde_json::Result<String> {
    Ok(format!("window.renderFrame({})", script_json(frame)?))
}
