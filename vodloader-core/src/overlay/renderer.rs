use std::io::Cursor;
use std::sync::Arc;

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageOutputFormat, RgbaImage};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::compositor::{FrameSource, OverlayFrame};
use crate::probe::VideoInfo;

use super::layout::OverlayLayout;
use super::messages::PreparedMessage;
use super::style::EffectiveOverlayConfig;
use super::template::render_document;
use super::timeline::{ChatTimeline, FrameLayout};
use super::{OverlayError, OverlayResult};

/// A loaded overlay page that can rasterize one frame layout at a time.
#[async_trait::async_trait]
pub trait RenderSurface: Send {
    /// PNG with a transparent background.
    async fn render(&mut self, frame: &FrameLayout) -> OverlayResult<Vec<u8>>;
    async fn close(self: Box<Self>) -> OverlayResult<()>;
}

#[async_trait::async_trait]
pub trait SurfaceProvider: Send + Sync {
    async fn open_surface(
        &self,
        document: &str,
        width: u32,
        height: u32,
    ) -> OverlayResult<Box<dyn RenderSurface>>;
}

/// Bounded pool for CPU-bound raster work.
#[derive(Debug, Clone)]
pub struct RasterPool {
    permits: Arc<Semaphore>,
}

impl Default for RasterPool {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self::new(workers)
    }
}

impl RasterPool {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub async fn run<F, R>(&self, job: F) -> OverlayResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|err| OverlayError::Task(err.to_string()))?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|err| OverlayError::Task(err.to_string()))
    }

    pub async fn blank_png(&self, width: u32, height: u32) -> OverlayResult<Vec<u8>> {
        self.run(move || encode_png(DynamicImage::ImageRgba8(RgbaImage::new(width, height))))
            .await?
    }

    /// Resizes `png` to `width`x`height` when the surface returned a
    /// different size.
    pub async fn normalize(&self, png: Vec<u8>, width: u32, height: u32) -> OverlayResult<Vec<u8>> {
        self.run(move || -> OverlayResult<Vec<u8>> {
            let dimensions = image::io::Reader::with_format(Cursor::new(&png), ImageFormat::Png)
                .into_dimensions()?;
            if dimensions == (width, height) {
                return Ok(png);
            }
            debug!(?dimensions, width, height, "resizing overlay raster");
            let decoded = image::load_from_memory_with_format(&png, ImageFormat::Png)?;
            encode_png(decoded.resize_exact(width, height, FilterType::Triangle))
        })
        .await?
    }
}

fn encode_png(image: DynamicImage) -> OverlayResult<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageOutputFormat::Png)?;
    Ok(buffer.into_inner())
}

/// Number of overlay frames for `duration` seconds at `fps`.
pub fn total_frames(duration: f64, fps: f64) -> u64 {
    if duration <= 0.0 || fps <= 0.0 || !duration.is_finite() || !fps.is_finite() {
        return 0;
    }
    (duration * fps).floor() as u64
}

/// Renders a chat transcript into overlay frames for one recording.
#[derive(Debug, Clone)]
pub struct ChatOverlayRenderer {
    config: EffectiveOverlayConfig,
    layout: OverlayLayout,
    timeline: ChatTimeline,
    pool: RasterPool,
}

impl ChatOverlayRenderer {
    pub fn new(
        config: EffectiveOverlayConfig,
        video: &VideoInfo,
        messages: &[PreparedMessage<'_>],
    ) -> Self {
        let layout = OverlayLayout::compute(&config, video.width, video.height);
        let timeline = ChatTimeline::new(messages, &config, &layout);
        info!(
            messages = timeline.len(),
            x = layout.x,
            y = layout.y,
            width = layout.width,
            height = layout.height,
            max_lines = layout.max_lines,
            "chat overlay prepared"
        );
        Self {
            config,
            layout,
            timeline,
            pool: RasterPool::default(),
        }
    }

    pub fn with_pool(mut self, pool: RasterPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn layout(&self) -> &OverlayLayout {
        &self.layout
    }

    pub fn timeline(&self) -> &ChatTimeline {
        &self.timeline
    }

    pub fn document(&self) -> OverlayResult<String> {
        Ok(render_document(&self.config, &self.layout)?)
    }

    /// Lazy frame sequence over `[0, floor(duration * fps))`. An empty
    /// transcript yields no frames and opens no surface.
    pub async fn frames(
        self,
        provider: &dyn SurfaceProvider,
        duration: f64,
        fps: f64,
    ) -> OverlayResult<OverlayFrames> {
        let total = if self.timeline.is_empty() {
            0
        } else {
            total_frames(duration, fps)
        };
        let surface = if total > 0 {
            let document = self.document()?;
            Some(
                provider
                    .open_surface(&document, self.layout.width, self.layout.height)
                    .await?,
            )
        } else {
            None
        };
        info!(total_frames = total, fps, "starting overlay frame sequence");
        Ok(OverlayFrames {
            timeline: self.timeline,
            surface,
            pool: self.pool,
            width: self.layout.width,
            height: self.layout.height,
            fps,
            total,
            next_index: 0,
            last: None,
            blank: None,
            rendered: 0,
            failures: 0,
        })
    }
}

/// Forward-only frame sequence. Consecutive identical layouts reuse the
/// previous raster; frames with nothing visible share one blank raster.
pub struct OverlayFrames {
    timeline: ChatTimeline,
    surface: Option<Box<dyn RenderSurface>>,
    pool: RasterPool,
    width: u32,
    height: u32,
    fps: f64,
    total: u64,
    next_index: u64,
    last: Option<(FrameLayout, Arc<Vec<u8>>)>,
    blank: Option<Arc<Vec<u8>>>,
    rendered: u64,
    failures: u64,
}

impl std::fmt::Debug for OverlayFrames {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayFrames")
            .field("total", &self.total)
            .field("next_index", &self.next_index)
            .field("rendered", &self.rendered)
            .field("failures", &self.failures)
            .finish()
    }
}

impl OverlayFrames {
    pub fn rendered(&self) -> u64 {
        self.rendered
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    async fn blank(&mut self) -> OverlayResult<Arc<Vec<u8>>> {
        if let Some(blank) = &self.blank {
            return Ok(blank.clone());
        }
        let blank = Arc::new(self.pool.blank_png(self.width, self.height).await?);
        self.blank = Some(blank.clone());
        Ok(blank)
    }

    async fn raster_for(&mut self, index: u64, layout: FrameLayout) -> OverlayResult<Arc<Vec<u8>>> {
        if layout.is_empty() {
            return self.blank().await;
        }
        if let Some((previous, png)) = &self.last {
            if *previous == layout {
                return Ok(png.clone());
            }
        }
        let Some(surface) = self.surface.as_mut() else {
            return self.blank().await;
        };
        let rendered = match surface.render(&layout).await {
            Ok(png) => self.pool.normalize(png, self.width, self.height).await,
            Err(err) => Err(err),
        };
        match rendered {
            Ok(png) => {
                self.rendered += 1;
                let png = Arc::new(png);
                self.last = Some((layout, png.clone()));
                Ok(png)
            }
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                self.failures += 1;
                warn!(frame = index, error = %err, "overlay frame render failed; reusing previous frame");
                match &self.last {
                    Some((_, png)) => Ok(png.clone()),
                    None => self.blank().await,
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl FrameSource for OverlayFrames {
    fn total_frames(&self) -> u64 {
        self.total
    }

    fn frame_rate(&self) -> f64 {
        self.fps
    }

    async fn next_frame(&mut self) -> OverlayResult<Option<OverlayFrame>> {
        if self.next_index >= self.total {
            self.close().await;
            return Ok(None);
        }
        let index = self.next_index;
        self.next_index += 1;
        let timestamp = index as f64 / self.fps;
        let layout = self.timeline.layout_at(timestamp);
        let png = match self.raster_for(index, layout).await {
            Ok(png) => png,
            Err(err) => {
                self.close().await;
                return Err(err);
            }
        };

        let step = (self.total / 10).max(1);
        if index > 0 && index % step == 0 {
            info!(
                frame = index,
                total = self.total,
                progress = format!("{:.0}%", index as f64 * 100.0 / self.total as f64),
                rendered = self.rendered,
                failures = self.failures,
                "overlay progress"
            );
        }
        Ok(Some(OverlayFrame {
            index,
            timestamp,
            png,
        }))
    }

    async fn close(&mut self) {
        if let Some(surface) = self.surface.take() {
            if let Err(err) = surface.close().await {
                warn!(error = %err, "failed to close overlay surface");
            }
        }
    }
}
