use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::cdp::browser_protocol::performance::EnableParams as PerformanceEnableParams;
use chromiumoxide::error::CdpError;
use chromiumoxide::handler::viewport::Viewport as ChromiumViewport;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::BrowserSection;
use crate::overlay::{
    render_call, FrameLayout, OverlayResult, RenderSurface, SurfaceProvider,
};

use super::error::{BrowserError, BrowserResult};
use super::metrics::BrowserMetrics;

const HEAP_METRIC: &str = "JSHeapTotalSize";

/// Flags that keep page output identical between runs.
const DETERMINISM_ARGS: [&str; 12] = [
    "--disable-gpu",
    "--hide-scrollbars",
    "--mute-audio",
    "--font-render-hinting=none",
    "--force-color-profile=srgb",
    "--disable-background-timer-throttling",
    "--disable-renderer-backgrounding",
    "--disable-backgrounding-occluded-windows",
    "--run-all-compositor-stages-before-draw",
    "--disable-extensions",
    "--no-first-run",
    "--password-store=basic",
];

async fn bounded<T, F>(operation: &'static str, limit: Duration, future: F) -> BrowserResult<T>
where
    F: Future<Output = Result<T, CdpError>>,
{
    match timeout(limit, future).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(BrowserError::Timeout {
            operation,
            timeout: limit,
        }),
    }
}

fn lock_metrics(metrics: &Mutex<BrowserMetrics>) -> std::sync::MutexGuard<'_, BrowserMetrics> {
    metrics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One headless Chromium process shared by the overlay jobs of a worker
/// pool. Every job gets its own page.
#[derive(Debug)]
pub struct OverlayBrowser {
    browser: Browser,
    handler_task: Option<JoinHandle<()>>,
    config: Arc<BrowserSection>,
    metrics: Arc<Mutex<BrowserMetrics>>,
}

impl OverlayBrowser {
    pub async fn launch(config: &BrowserSection) -> BrowserResult<Self> {
        let chromium_config = build_chromium_config(config)?;
        info!(
            executable = ?config.executable_path,
            memory_limit_mb = config.memory_limit_mb,
            "launching headless chromium"
        );
        let (browser, mut handler) = Browser::launch(chromium_config)
            .await
            .map_err(|err| BrowserError::Launch(err.to_string()))?;

        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "chromium handler reported error");
                }
            }
        });

        Ok(Self {
            browser,
            handler_task: Some(handler_task),
            config: Arc::new(config.clone()),
            metrics: Arc::new(Mutex::new(BrowserMetrics::default())),
        })
    }

    pub fn metrics(&self) -> BrowserMetrics {
        lock_metrics(&self.metrics).clone()
    }

    pub fn config(&self) -> &BrowserSection {
        &self.config
    }

    /// False once the CDP connection is gone.
    pub fn is_alive(&self) -> bool {
        self.handler_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Opens a page sized `width`x`height`, loads `document` into it and
    /// checks the memory ceiling once before the first frame.
    pub async fn open_page(
        &self,
        document: &str,
        width: u32,
        height: u32,
    ) -> BrowserResult<BrowserSurface> {
        if !self.is_alive() {
            return Err(BrowserError::Closed);
        }
        let page = bounded(
            "new page",
            self.config.page_timeout(),
            self.browser.new_page("about:blank"),
        )
        .await?;
        lock_metrics(&self.metrics).record_page_open();

        let mut surface = BrowserSurface {
            page: Some(page),
            width,
            height,
            frames: 0,
            config: Arc::clone(&self.config),
            metrics: Arc::clone(&self.metrics),
        };
        if let Err(err) = surface.prepare(document).await {
            surface.shutdown().await;
            return Err(err);
        }
        debug!(width, height, "overlay page ready");
        Ok(surface)
    }

    pub async fn shutdown(mut self) -> BrowserResult<()> {
        let metrics = self.metrics();
        info!(
            pages = metrics.pages_opened,
            frames = metrics.frames_rendered,
            failures = metrics.render_failures,
            peak_memory_mb = metrics.peak_memory_mb,
            "shutting down chromium"
        );
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "failed to close browser gracefully");
        }
        if let Err(err) = self.browser.wait().await {
            warn!(error = %err, "failed to reap browser process");
        }
        if let Some(handle) = self.handler_task.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "browser handler join error");
            }
        }
        Ok(())
    }
}

impl Drop for OverlayBrowser {
    fn drop(&mut self) {
        if let Some(handle) = &self.handler_task {
            if !handle.is_finished() {
                warn!("OverlayBrowser dropped without explicit shutdown");
            }
        }
    }
}

#[async_trait::async_trait]
impl SurfaceProvider for OverlayBrowser {
    async fn open_surface(
        &self,
        document: &str,
        width: u32,
        height: u32,
    ) -> OverlayResult<Box<dyn RenderSurface>> {
        Ok(Box::new(self.open_page(document, width, height).await?))
    }
}

/// Launches Chromium on first use and shares it between overlay jobs. A
/// browser whose connection dropped is relaunched on the next request.
#[derive(Debug)]
pub struct SharedBrowser {
    config: BrowserSection,
    browser: AsyncMutex<Option<OverlayBrowser>>,
}

impl SharedBrowser {
    pub fn new(config: BrowserSection) -> Self {
        Self {
            config,
            browser: AsyncMutex::new(None),
        }
    }

    pub async fn metrics(&self) -> Option<BrowserMetrics> {
        self.browser.lock().await.as_ref().map(OverlayBrowser::metrics)
    }

    pub async fn shutdown(&self) -> BrowserResult<()> {
        match self.browser.lock().await.take() {
            Some(browser) => browser.shutdown().await,
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl SurfaceProvider for SharedBrowser {
    async fn open_surface(
        &self,
        document: &str,
        width: u32,
        height: u32,
    ) -> OverlayResult<Box<dyn RenderSurface>> {
        let mut guard = self.browser.lock().await;
        if guard.as_ref().is_some_and(|browser| !browser.is_alive()) {
            if let Some(stale) = guard.take() {
                warn!("chromium connection lost; relaunching");
                if let Err(err) = stale.shutdown().await {
                    debug!(error = %err, "stale browser shutdown failed");
                }
            }
        }
        let browser = match guard.take() {
            Some(browser) => browser,
            None => OverlayBrowser::launch(&self.config).await?,
        };
        let browser = guard.insert(browser);
        Ok(Box::new(browser.open_page(document, width, height).await?))
    }
}

fn build_chromium_config(config: &BrowserSection) -> BrowserResult<ChromiumConfig> {
    let mut builder = ChromiumConfig::builder()
        .viewport(ChromiumViewport {
            width: 1280,
            height: 720,
            device_scale_factor: Some(1.0),
            emulating_mobile: false,
            is_landscape: true,
            has_touch: false,
        })
        .request_timeout(config.operation_timeout());
    if let Some(path) = &config.executable_path {
        builder = builder.chrome_executable(path);
    }
    if !config.sandbox {
        builder = builder.no_sandbox();
    }
    let mut args: Vec<String> = DETERMINISM_ARGS.iter().map(|arg| arg.to_string()).collect();
    args.extend(config.extra_args.iter().cloned());
    builder.args(args).build().map_err(BrowserError::Configuration)
}

/// A single overlay page. Closed explicitly through
/// [`RenderSurface::close`].
#[derive(Debug)]
pub struct BrowserSurface {
    page: Option<Page>,
    width: u32,
    height: u32,
    frames: u64,
    config: Arc<BrowserSection>,
    metrics: Arc<Mutex<BrowserMetrics>>,
}

impl BrowserSurface {
    fn page(&self) -> BrowserResult<&Page> {
        self.page.as_ref().ok_or(BrowserError::Closed)
    }

    async fn prepare(&mut self, document: &str) -> BrowserResult<()> {
        let limit = self.config.page_timeout();
        let page = self.page()?;
        bounded(
            "viewport override",
            limit,
            page.execute(SetDeviceMetricsOverrideParams::new(
                i64::from(self.width),
                i64::from(self.height),
                1.0,
                false,
            )),
        )
        .await?;
        bounded(
            "performance domain",
            limit,
            page.execute(PerformanceEnableParams::default()),
        )
        .await?;
        bounded("set content", limit, async {
            page.set_content(document).await.map(|_| ())
        })
        .await?;
        bounded("font loading", limit, page.evaluate("window.overlayReady")).await?;
        self.check_memory().await
    }

    /// Aborts with [`BrowserError::ResourceExceeded`] when the page's JS heap
    /// is above the configured ceiling.
    async fn check_memory(&self) -> BrowserResult<()> {
        let page = self.page()?;
        let metrics = bounded("metrics", self.config.operation_timeout(), page.metrics()).await?;
        let Some(heap) = metrics.iter().find(|metric| metric.name == HEAP_METRIC) else {
            debug!("heap metric unavailable");
            return Ok(());
        };
        let used_mb = (heap.value.max(0.0) / (1024.0 * 1024.0)).ceil() as u64;
        let limit_mb = self.config.memory_limit_mb;
        let within_limit = used_mb <= limit_mb;
        lock_metrics(&self.metrics).record_memory(used_mb, within_limit);
        if !within_limit {
            warn!(used_mb, limit_mb, "browser memory ceiling exceeded");
            return Err(BrowserError::ResourceExceeded { used_mb, limit_mb });
        }
        debug!(used_mb, limit_mb, "browser memory check");
        Ok(())
    }

    async fn draw(&mut self, frame: &FrameLayout) -> BrowserResult<Vec<u8>> {
        let limit = self.config.operation_timeout();
        let call = render_call(frame).map_err(|err| BrowserError::Script(err.to_string()))?;
        let page = self.page()?;
        bounded("frame render", limit, page.evaluate(call)).await?;
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .omit_background(true)
            .build();
        let png = bounded("screenshot", limit, page.screenshot(params)).await?;

        self.frames += 1;
        let interval = self.config.memory_check_interval_frames.max(1);
        if self.frames % interval == 0 {
            self.check_memory().await?;
        }
        Ok(png)
    }

    async fn shutdown(&mut self) {
        let Some(page) = self.page.take() else {
            return;
        };
        if let Err(err) = page.close().await {
            warn!(error = %err, "failed to close overlay page");
        }
        lock_metrics(&self.metrics).record_page_close();
    }
}

impl Drop for BrowserSurface {
    fn drop(&mut self) {
        if self.page.is_some() {
            warn!("BrowserSurface dropped without closing its page");
        }
    }
}

#[async_trait::async_trait]
impl RenderSurface for BrowserSurface {
    async fn render(&mut self, frame: &FrameLayout) -> OverlayResult<Vec<u8>> {
        let result = self.draw(frame).await;
        lock_metrics(&self.metrics).record_frame(result.is_ok());
        Ok(result?)
    }

    async fn close(mut self: Box<Self>) -> OverlayResult<()> {
        self.shutdown().await;
        Ok(())
    }
}
