pub mod ads;
pub mod browser;
pub mod capture;
pub mod compositor;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod models;
pub mod overlay;
pub mod platform;
pub mod postprocess;
pub mod probe;
pub mod process;
pub mod queue;
mod sqlite;
pub mod store;
pub mod supervisor;

pub use ads::{AdDetector, AdError, AdRemoval, DetectionReport, MainProperties, VideoSegment};
pub use browser::{BrowserError, BrowserMetrics, OverlayBrowser, SharedBrowser};
pub use capture::{
    CaptureContext, CaptureError, CaptureHandle, CaptureReport, CaptureSession, CaptureSettings,
    CaptureState,
};
pub use compositor::{
    ComposeJob, CompositorError, FrameSource, NoOverlay, OverlayFrame, StreamingCompositor,
};
pub use config::{
    load_vodloader_config, AdDetectionSection, BrowserSection, CaptureSection, EncoderSection,
    OverlaySection, PathsSection, QueueSection, StoreBackend, StoreSection, VodloaderConfig,
};
pub use error::{Classify, ConfigError, FailureClass, Result};
pub use fetcher::{Chunk, ChunkReader, FetchError, HttpFetcher, StreamFetcher, StreamlinkFetcher};
pub use models::{
    BroadcastSession, Category, Channel, ChatMessage, MetadataUpdate, OverlayStyle, RecordedPart,
};
pub use overlay::{apply_channel_config, ChatOverlayRenderer, EffectiveOverlayConfig};
pub use platform::{
    FixedStreamInfo, LiveStreamInfo, LogUploadSink, PlatformClient, Quality, UploadSink,
};
pub use postprocess::{
    recover_pending, PostProcessError, PostProcessWorkers, PostProcessor, ProcessKind,
    ProcessOutcome,
};
pub use queue::{PostProcessQueue, QueueEntry, QueueError, QueueFilter, QueueStatus, QueueStore};
pub use store::{open_store, CaptureStore, MemoryCaptureStore, SqliteCaptureStore, StoreError};
pub use supervisor::{ChannelSupervisor, NotificationOutcome};
