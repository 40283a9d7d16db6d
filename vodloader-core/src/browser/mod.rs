mod automation;
mod error;
mod metrics;

pub use automation::{BrowserSurface, OverlayBrowser, SharedBrowser};
pub use error::{BrowserError, BrowserResult};
pub use metrics::BrowserMetrics;
