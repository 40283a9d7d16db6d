use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use vodloader_core::ads::{AdDetector, AdError, DetectionReport};
use vodloader_core::capture::{CaptureContext, CaptureError, CaptureReport, CaptureSession, CaptureSettings};
use vodloader_core::config::{load_vodloader_config, VodloaderConfig};
use vodloader_core::error::{Classify, ConfigError};
use vodloader_core::fetcher::StreamlinkFetcher;
use vodloader_core::models::{Category, Channel};
use vodloader_core::overlay::{apply_channel_config, EffectiveOverlayConfig};
use vodloader_core::platform::{FixedStreamInfo, LogUploadSink};
use vodloader_core::postprocess::{recover_pending, PostProcessError, PostProcessWorkers, PostProcessor};
use vodloader_core::queue::{PostProcessQueue, QueueEntry, QueueError, QueueFilter, QueueStatus, QueueStore};
use vodloader_core::store::{open_store, CaptureStore, ChannelFilter, StoreError};
use vodloader_core::supervisor::{ChannelSupervisor, NotificationOutcome};
use vodloader_core::SharedBrowser;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),
    #[error("ad detection error: {0}")]
    Ads(#[from] AdError),
    #[error("post-process error: {0}")]
    PostProcess(#[from] PostProcessError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("unknown channel: {0}")]
    UnknownChannel(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Live-stream capture and VOD post-processing", long_about = None)]
pub struct Cli {
    /// Path to vodloader.toml
    #[arg(long, default_value = "configs/vodloader.toml")]
    pub config: PathBuf,
    /// Overrides paths.data_dir
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Runs the post-process workers and reads channel notifications from
    /// stdin until Ctrl-C
    Run(RunArgs),
    /// Records one channel now, until the stream ends or Ctrl-C
    Record(RecordArgs),
    /// Post-process queue operations
    #[command(subcommand)]
    Queue(QueueCommands),
    /// Ad segment analysis
    #[command(subcommand)]
    Ads(AdsCommands),
    /// Channel registry
    #[command(subcommand)]
    Channel(ChannelCommands),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Overrides queue.workers
    #[arg(long)]
    pub workers: Option<usize>,
}

#[derive(Args, Debug)]
pub struct RecordArgs {
    pub channel_id: String,
    #[arg(long)]
    pub quality: Option<String>,
    /// Session title recorded with the broadcast
    #[arg(long)]
    pub title: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum QueueCommands {
    /// Lists queue entries
    Show(QueueShowArgs),
    /// Requeues interrupted and failed entries
    Recover(QueueRecoverArgs),
    /// Writes a gzip-compressed SQL dump of the queue
    Backup(QueueBackupArgs),
}

#[derive(Args, Debug)]
pub struct QueueShowArgs {
    /// queued, processing, done or failed
    #[arg(long)]
    pub status: Option<String>,
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Args, Debug)]
pub struct QueueRecoverArgs {
    /// Also requeue failures marked as needing an operator
    #[arg(long, default_value_t = false)]
    pub all: bool,
}

#[derive(Args, Debug)]
pub struct QueueBackupArgs {
    pub output: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum AdsCommands {
    /// Prints content and ad segments of a recording
    Detect(AdsDetectArgs),
}

#[derive(Args, Debug)]
pub struct AdsDetectArgs {
    pub input: PathBuf,
}

#[derive(Subcommand, Debug)]
pub enum ChannelCommands {
    /// Registers or updates a channel
    Add(ChannelAddArgs),
    /// Lists registered channels
    List,
    /// Prints the effective overlay configuration of a channel
    Config(ChannelConfigArgs),
}

#[derive(Args, Debug)]
pub struct ChannelAddArgs {
    pub channel_id: String,
    pub login: String,
    #[arg(long)]
    pub display_name: Option<String>,
    #[arg(long)]
    pub quality: Option<String>,
    #[arg(long, default_value_t = false)]
    pub inactive: bool,
    #[arg(long)]
    pub position: Option<String>,
    #[arg(long)]
    pub font_size: Option<u32>,
}

#[derive(Args, Debug)]
pub struct ChannelConfigArgs {
    pub channel_id: String,
}

pub async fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Run(args) => {
            let summary = context.serve(args).await?;
            render(&summary, cli.format)?;
        }
        Commands::Record(args) => {
            let report = context.record(args).await?;
            render(&RecordSummary(report), cli.format)?;
        }
        Commands::Queue(QueueCommands::Show(args)) => {
            let list = context.queue_show(args)?;
            render(&list, cli.format)?;
        }
        Commands::Queue(QueueCommands::Recover(args)) => {
            let result = context.queue_recover(args)?;
            render(&result, cli.format)?;
        }
        Commands::Queue(QueueCommands::Backup(args)) => {
            context.queue.store().export_backup(&args.output)?;
            render(
                &Message(format!("queue backup written to {}", args.output.display())),
                cli.format,
            )?;
        }
        Commands::Ads(AdsCommands::Detect(args)) => {
            let report = context.ads_detect(&args.input).await?;
            render(&report, cli.format)?;
        }
        Commands::Channel(ChannelCommands::Add(args)) => {
            let channel = context.channel_add(args)?;
            render(&ChannelList { rows: vec![channel] }, cli.format)?;
        }
        Commands::Channel(ChannelCommands::List) => {
            let rows = context.store.list_channels(&ChannelFilter::default())?;
            render(&ChannelList { rows }, cli.format)?;
        }
        Commands::Channel(ChannelCommands::Config(args)) => {
            let config = context.channel_config(&args.channel_id)?;
            render(&config, cli.format)?;
        }
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

struct AppContext {
    config: VodloaderConfig,
    store: Arc<dyn CaptureStore>,
    queue: PostProcessQueue,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("store", &self.store)
            .field("queue", &self.queue)
            .finish()
    }
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let mut config = load_vodloader_config(&cli.config)?;
        if let Some(data_dir) = &cli.data_dir {
            rebase_data_dir(&mut config, data_dir);
        }
        let store = open_store(&config.store)?;
        let queue_store = QueueStore::new(&config.queue.path)?;
        queue_store.initialize()?;
        Ok(Self {
            config,
            store,
            queue: PostProcessQueue::new(queue_store),
        })
    }

    fn capture_context(&self, platform: Arc<FixedStreamInfo>) -> Arc<CaptureContext> {
        let capture = &self.config.capture;
        Arc::new(CaptureContext {
            store: self.store.clone(),
            platform,
            fetcher: Arc::new(StreamlinkFetcher::new(
                &self.config.paths.streamlink,
                capture.stream_url_template.clone(),
                capture.chunk_size,
            )),
            queue: self.queue.clone(),
            settings: CaptureSettings::from_config(&self.config.paths, capture),
        })
    }

    fn post_processor(&self, browser: Arc<SharedBrowser>) -> PostProcessor {
        PostProcessor::new(
            &self.config,
            self.store.clone(),
            self.queue.clone(),
            browser,
            Arc::new(LogUploadSink),
        )
    }

    /// Startup recovery, then workers plus a line-oriented notification feed
    /// (`online <id>`, `offline <id>`, `title <id> <text>`) until Ctrl-C or
    /// end of input.
    async fn serve(&self, args: &RunArgs) -> Result<ServeSummary> {
        let recovery = recover_pending(self.store.as_ref(), &self.queue)?;
        let browser = Arc::new(SharedBrowser::new(self.config.browser.clone()));
        let processor = Arc::new(self.post_processor(browser.clone()));
        let workers = PostProcessWorkers::spawn(
            processor,
            args.workers.unwrap_or(self.config.queue.workers),
            self.config.queue.poll_interval(),
        );
        let supervisor =
            ChannelSupervisor::new(self.capture_context(Arc::new(FixedStreamInfo::new(None))));
        info!(
            workers = workers.len(),
            requeued = recovery.requeued,
            enqueued = recovery.enqueued,
            "vodloader running"
        );

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut notifications = 0usize;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received; shutting down");
                    break;
                }
                line = lines.next_line() => match line? {
                    Some(line) => {
                        if dispatch(&supervisor, &line).await {
                            notifications += 1;
                        }
                    }
                    None => {
                        info!("notification feed closed; waiting for Ctrl-C");
                        tokio::signal::ctrl_c().await?;
                        break;
                    }
                },
            }
        }

        let captures = supervisor.shutdown().await;
        workers.shutdown().await;
        let metrics = browser.metrics().await.unwrap_or_default();
        if let Err(err) = browser.shutdown().await {
            warn!(error = %err, "browser shutdown failed");
        }
        Ok(ServeSummary {
            requeued: recovery.requeued,
            enqueued: recovery.enqueued,
            notifications,
            captures: captures.len(),
            browser: metrics,
        })
    }

    async fn record(&self, args: &RecordArgs) -> Result<CaptureReport> {
        let channel = self
            .store
            .get_channel(&args.channel_id)?
            .ok_or_else(|| AppError::UnknownChannel(args.channel_id.clone()))?;
        let ctx = self.capture_context(Arc::new(FixedStreamInfo::new(args.title.clone())));
        let handle = CaptureSession::start(ctx, channel, args.quality.clone());
        let stop = handle.stop_token();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received; finalizing current part");
                stop.cancel();
            }
        });
        let report = handle.join().await;
        interrupt.abort();
        Ok(report?)
    }

    fn queue_show(&self, args: &QueueShowArgs) -> Result<QueueList> {
        let status = args
            .status
            .as_deref()
            .map(str::parse::<QueueStatus>)
            .transpose()?;
        let rows = self.queue.store().list(&QueueFilter {
            status,
            limit: Some(args.limit),
        })?;
        Ok(QueueList { rows })
    }

    fn queue_recover(&self, args: &QueueRecoverArgs) -> Result<RecoverResult> {
        let requeued = if args.all {
            self.queue.store().recover_all()?
        } else {
            self.queue.store().recover()?
        };
        Ok(RecoverResult {
            requeued,
            all: args.all,
        })
    }

    async fn ads_detect(&self, input: &Path) -> Result<AdsReport> {
        let detector = AdDetector::new(
            &self.config.paths,
            &self.config.ad_detection,
            &self.config.encoder,
        );
        let report = detector.detect(input).await?;
        Ok(AdsReport {
            input: input.to_path_buf(),
            ad_seconds: report.ad_seconds(),
            content_ranges: report.content_ranges(),
            report,
        })
    }

    fn channel_add(&self, args: &ChannelAddArgs) -> Result<Channel> {
        let mut channel = self
            .store
            .get_channel(&args.channel_id)?
            .unwrap_or_else(|| Channel::new(&args.channel_id, &args.login));
        channel.login = args.login.clone();
        channel.active = !args.inactive;
        if args.display_name.is_some() {
            channel.display_name = args.display_name.clone();
        }
        if let Some(quality) = &args.quality {
            quality
                .parse::<vodloader_core::platform::Quality>()
                .map_err(|err| AppError::InvalidArgument(err.to_string()))?;
            channel.quality = Some(quality.clone());
        }
        if args.position.is_some() {
            channel.overlay.position = args.position.clone();
        }
        if args.font_size.is_some() {
            channel.overlay.font_size = args.font_size;
        }
        self.store.save_channel(&channel)?;
        Ok(channel)
    }

    fn channel_config(&self, channel_id: &str) -> Result<ChannelConfig> {
        let channel = self
            .store
            .get_channel(channel_id)?
            .ok_or_else(|| AppError::UnknownChannel(channel_id.to_string()))?;
        Ok(ChannelConfig {
            channel_id: channel.id.clone(),
            effective: apply_channel_config(&channel, &self.config.overlay),
        })
    }
}

fn rebase_data_dir(config: &mut VodloaderConfig, data_dir: &Path) {
    let old = config.paths.data_dir.clone();
    let rebase = |path: &mut PathBuf| {
        if let Ok(relative) = path.strip_prefix(&old) {
            *path = data_dir.join(relative);
        }
    };
    rebase(&mut config.store.path);
    rebase(&mut config.queue.path);
    config.paths.data_dir = data_dir.to_path_buf();
}

/// Applies one notification line. Returns false for lines that were not
/// understood or failed.
async fn dispatch(supervisor: &ChannelSupervisor, line: &str) -> bool {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return false;
    }
    let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    let outcome = match verb {
        "online" => supervisor.on_online(rest).await,
        "offline" => Ok(supervisor.on_offline(rest).await),
        "title" | "category" => {
            let (channel_id, value) = rest.split_once(' ').unwrap_or((rest, ""));
            let value = value.trim().to_string();
            let (title, category) = if verb == "title" {
                (Some(value), None)
            } else {
                (None, Some(Category { id: None, name: value }))
            };
            supervisor.on_metadata_update(channel_id, title, category).await
        }
        other => {
            warn!(verb = other, "unknown notification");
            return false;
        }
    };
    match outcome {
        Ok(outcome) => {
            info!(notification = verb, outcome = ?outcome_label(&outcome), "notification handled");
            true
        }
        Err(err) => {
            warn!(notification = verb, class = %err.class(), error = %err, "notification failed");
            false
        }
    }
}

fn outcome_label(outcome: &NotificationOutcome) -> &'static str {
    match outcome {
        NotificationOutcome::Started => "started",
        NotificationOutcome::AlreadyRecording => "already_recording",
        NotificationOutcome::Stopped(_) => "stopped",
        NotificationOutcome::NotRecording => "not_recording",
        NotificationOutcome::MetadataRecorded { .. } => "metadata_recorded",
        NotificationOutcome::UnknownChannel => "unknown_channel",
        NotificationOutcome::InactiveChannel => "inactive_channel",
    }
}

#[derive(Debug, Serialize)]
pub struct ServeSummary {
    pub requeued: usize,
    pub enqueued: usize,
    pub notifications: usize,
    pub captures: usize,
    pub browser: vodloader_core::BrowserMetrics,
}

impl DisplayFallback for ServeSummary {
    fn display(&self) -> String {
        format!(
            "recovered: {} requeued, {} enqueued\nnotifications: {}\ncaptures stopped: {}\noverlay frames: {} rendered, {} failed",
            self.requeued,
            self.enqueued,
            self.notifications,
            self.captures,
            self.browser.frames_rendered,
            self.browser.render_failures
        )
    }
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct RecordSummary(pub CaptureReport);

impl DisplayFallback for RecordSummary {
    fn display(&self) -> String {
        let report = &self.0;
        let mut lines = vec![format!(
            "channel {} | state={} | parts={} | bytes={}",
            report.channel_id,
            report.final_state,
            report.parts.len(),
            report.total_bytes()
        )];
        if let Some(reason) = &report.abort_reason {
            lines.push(format!("reason: {reason:?}"));
        }
        for part in &report.parts {
            lines.push(format!(
                "  #{:02} {} ({} bytes, {:.1}s){}",
                part.part_number,
                part.path.display(),
                part.bytes,
                part.elapsed.as_secs_f64(),
                if part.finalized { "" } else { " not finalized" }
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct QueueList {
    pub rows: Vec<QueueEntry>,
}

impl DisplayFallback for QueueList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "queue empty".to_string();
        }
        let mut lines = Vec::new();
        for entry in &self.rows {
            let mut line = format!(
                "#{id} part={part} channel={channel} status={status} attempts={attempts}",
                id = entry.id,
                part = entry.part_id,
                channel = entry.channel_id,
                status = entry.status,
                attempts = entry.attempts,
            );
            if let Some(reason) = &entry.failure_reason {
                let retry = if entry.retryable { "" } else { " [needs operator]" };
                line.push_str(&format!(" reason=\"{reason}\"{retry}"));
            }
            if let Some(output) = &entry.output_path {
                line.push_str(&format!(" output={}", output.display()));
            }
            lines.push(line);
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct RecoverResult {
    pub requeued: usize,
    pub all: bool,
}

impl DisplayFallback for RecoverResult {
    fn display(&self) -> String {
        format!("{} entries requeued", self.requeued)
    }
}

#[derive(Debug, Serialize)]
pub struct AdsReport {
    pub input: PathBuf,
    pub ad_seconds: f64,
    pub content_ranges: Vec<(f64, f64)>,
    pub report: DetectionReport,
}

impl DisplayFallback for AdsReport {
    fn display(&self) -> String {
        let main = &self.report.main;
        let mut lines = vec![
            format!("input: {}", self.input.display()),
            format!("main: {}x{} @ {} fps", main.width, main.height, main.fps),
            format!(
                "segments: {} ({} content, {} ads, {:.1}s of ads)",
                self.report.segments.len(),
                self.report.content.len(),
                self.report.ads.len(),
                self.ad_seconds
            ),
        ];
        for segment in &self.report.ads {
            lines.push(format!(
                "  ad {:.2}-{:.2} {}x{} @ {:.2} fps",
                segment.start, segment.end, segment.width, segment.height, segment.fps
            ));
        }
        lines
            .push("content: ".to_string() + &self
                .content_ranges
                .iter()
                .map(|(start, end)| format!("{start:.2}-{end:.2}"))
                .collect::<Vec<_>>()
                .join(", "));
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ChannelList {
    pub rows: Vec<Channel>,
}

impl DisplayFallback for ChannelList {
    fn display(&self) -> String {
        if self.rows.is_empty() {
            return "no channels registered".to_string();
        }
        self.rows
            .iter()
            .map(|channel| {
                format!(
                    "{} | {} | {} | quality={}",
                    channel.id,
                    channel.name(),
                    if channel.active { "active" } else { "inactive" },
                    channel.quality.as_deref().unwrap_or("-")
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ChannelConfig {
    pub channel_id: String,
    pub effective: EffectiveOverlayConfig,
}

impl DisplayFallback for ChannelConfig {
    fn display(&self) -> String {
        let config = &self.effective;
        format!(
            "channel {}\n  font: {} {}px {} {}\n  colors: text={} shadow={} ({}px)\n  box: {}x{} at {} (padding {})\n  message duration: {}s",
            self.channel_id,
            config.font_family,
            config.font_size,
            config.font_style,
            config.font_weight,
            config.text_color,
            config.text_shadow_color,
            config.text_shadow_size,
            config.overlay_width,
            config
                .overlay_height
                .map(|h| h.to_string())
                .unwrap_or_else(|| "auto".to_string()),
            config.position,
            config.padding,
            config.message_duration_seconds
        )
    }
}

#[derive(Debug, Serialize)]
#[serde(transparent)]
pub struct Message(pub String);

impl DisplayFallback for Message {
    fn display(&self) -> String {
        self.0.clone()
    }
}
