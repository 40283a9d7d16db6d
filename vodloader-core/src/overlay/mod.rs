//! Chat overlay: style resolution, layout, the per-frame chat timeline and
//! the lazy raster sequence fed to the compositor.

mod layout;
mod messages;
mod renderer;
mod style;
mod template;
mod timeline;

use thiserror::Error;

use crate::browser::BrowserError;
use crate::error::{Classify, FailureClass};

pub use layout::OverlayLayout;
pub use messages::{prepare_messages, PreparedMessage};
pub use renderer::{
    total_frames, ChatOverlayRenderer, OverlayFrames, RasterPool, RenderSurface, SurfaceProvider,
};
pub use style::{apply_channel_config, is_valid_color, EffectiveOverlayConfig, OverlayPosition};
pub use template::{render_call, render_document, sanitize_text};
pub use timeline::{wrap_words, ChatTimeline, FrameLayout, RenderedLine};

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error(transparent)]
    Browser(#[from] BrowserError),
    #[error("render surface error: {0}")]
    Surface(String),
    #[error("raster error: {0}")]
    Raster(#[from] image::ImageError),
    #[error("failed to serialize overlay data: {0}")]
    Template(#[from] serde_json::Error),
    #[error("raster task failed: {0}")]
    Task(String),
}

impl OverlayError {
    /// Errors that end the whole job instead of a single frame.
    pub fn is_fatal(&self) -> bool {
        matches!(self.class(), FailureClass::ResourceExceeded)
            || matches!(self, OverlayError::Browser(BrowserError::Closed))
    }
}

impl Classify for OverlayError {
    fn class(&self) -> FailureClass {
        match self {
            OverlayError::Browser(err) => err.class(),
            _ => FailureClass::CompositionFailure,
        }
    }
}

pub type OverlayResult<T> = Result<T, OverlayError>;
