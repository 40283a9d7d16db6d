use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

/// Root of `vodloader.toml`. Every section falls back to its defaults, so a
/// partial file (or an empty one) is a valid configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct VodloaderConfig {
    pub paths: PathsSection,
    pub store: StoreSection,
    pub capture: CaptureSection,
    pub ad_detection: AdDetectionSection,
    pub overlay: OverlaySection,
    pub encoder: EncoderSection,
    pub browser: BrowserSection,
    pub queue: QueueSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub download_dir: PathBuf,
    pub data_dir: PathBuf,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub streamlink: PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            data_dir: PathBuf::from("data"),
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            streamlink: PathBuf::from("streamlink"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub backend: StoreBackend,
    pub path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            path: PathBuf::from("data/vodloader.sqlite"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureSection {
    pub quality: String,
    pub chunk_size: usize,
    pub cutoff_seconds: u64,
    /// `{login}` and `{quality}` are substituted per channel.
    pub stream_url_template: String,
    pub metadata_retry_attempts: u32,
    pub metadata_retry_base_ms: u64,
    pub metadata_retry_max_ms: u64,
    pub read_retry_attempts: u32,
    pub read_retry_delay_ms: u64,
    pub stop_grace_seconds: u64,
}

impl CaptureSection {
    pub fn cutoff(&self) -> Duration {
        Duration::from_secs(self.cutoff_seconds.max(1))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_seconds)
    }
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            quality: "best".to_string(),
            chunk_size: 8192,
            cutoff_seconds: 6 * 60 * 60,
            stream_url_template: "https://www.twitch.tv/{login}".to_string(),
            metadata_retry_attempts: 5,
            metadata_retry_base_ms: 2_000,
            metadata_retry_max_ms: 30_000,
            read_retry_attempts: 5,
            read_retry_delay_ms: 1_000,
            stop_grace_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdDetectionSection {
    pub enabled: bool,
    pub fps_tolerance: f64,
    pub min_segment_seconds: f64,
    pub batch_size: usize,
    pub probe_timeout_seconds: u64,
}

impl Default for AdDetectionSection {
    fn default() -> Self {
        Self {
            enabled: true,
            fps_tolerance: 2.0,
            min_segment_seconds: 1.0,
            batch_size: 20,
            probe_timeout_seconds: 1_800,
        }
    }
}

/// Default overlay style. Channels override individual fields through their
/// own style bag, see [`crate::overlay::apply_channel_config`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OverlaySection {
    pub font_family: String,
    pub font_size: u32,
    pub font_style: String,
    pub font_weight: String,
    pub text_color: String,
    pub text_shadow_color: String,
    pub text_shadow_size: u32,
    pub overlay_width: u32,
    /// Half of the video height when unset.
    pub overlay_height: Option<u32>,
    pub position: String,
    pub padding: u32,
    pub message_duration_seconds: f64,
    /// Overlay frame rate; the recording's own rate when unset.
    pub frame_rate: Option<f64>,
    pub char_width_ratio: f64,
    pub line_height_ratio: f64,
    pub min_width: u32,
    pub min_height: u32,
    pub max_message_chars: usize,
}

impl Default for OverlaySection {
    fn default() -> Self {
        Self {
            font_family: "Inter".to_string(),
            font_size: 24,
            font_style: "normal".to_string(),
            font_weight: "normal".to_string(),
            text_color: "#ffffff".to_string(),
            text_shadow_color: "#000000".to_string(),
            text_shadow_size: 2,
            overlay_width: 320,
            overlay_height: None,
            position: "top-left".to_string(),
            padding: 20,
            message_duration_seconds: 30.0,
            frame_rate: None,
            char_width_ratio: 0.6,
            line_height_ratio: 1.2,
            min_width: 200,
            min_height: 100,
            max_message_chars: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EncoderSection {
    pub video_codec: String,
    pub preset: String,
    pub crf: u32,
    pub pix_fmt: String,
    pub timeout_base_seconds: u64,
    pub timeout_realtime_factor: f64,
    pub terminate_grace_seconds: u64,
}

impl EncoderSection {
    /// Upper bound for one encoder run over `media_seconds` of input.
    pub fn timeout_for(&self, media_seconds: f64) -> Duration {
        let scaled = (media_seconds.max(0.0) * self.timeout_realtime_factor.max(0.0)).ceil();
        Duration::from_secs(self.timeout_base_seconds) + Duration::from_secs(scaled as u64)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_seconds)
    }
}

impl Default for EncoderSection {
    fn default() -> Self {
        Self {
            video_codec: "libx264".to_string(),
            preset: "medium".to_string(),
            crf: 18,
            pix_fmt: "yuv420p".to_string(),
            timeout_base_seconds: 600,
            timeout_realtime_factor: 4.0,
            terminate_grace_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrowserSection {
    pub executable_path: Option<PathBuf>,
    pub sandbox: bool,
    pub memory_limit_mb: u64,
    pub page_timeout_seconds: u64,
    pub operation_timeout_seconds: u64,
    pub memory_check_interval_frames: u64,
    pub extra_args: Vec<String>,
}

impl BrowserSection {
    pub fn page_timeout(&self) -> Duration {
        Duration::from_secs(self.page_timeout_seconds.max(1))
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_seconds.max(1))
    }
}

impl Default for BrowserSection {
    fn default() -> Self {
        Self {
            executable_path: None,
            sandbox: false,
            memory_limit_mb: 2_048,
            page_timeout_seconds: 30,
            operation_timeout_seconds: 60,
            memory_check_interval_frames: 300,
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub path: PathBuf,
    pub workers: usize,
    pub poll_interval_ms: u64,
}

impl QueueSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/queue.sqlite"),
            workers: 1,
            poll_interval_ms: 1_000,
        }
    }
}

pub fn load_vodloader_config<P: AsRef<Path>>(path: P) -> Result<VodloaderConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/vodloader.toml");
        let config = load_vodloader_config(path).expect("config should parse");
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.capture.quality, "best");
        assert_eq!(config.capture.cutoff(), Duration::from_secs(21_600));
        assert_eq!(config.ad_detection.batch_size, 20);
        assert_eq!(config.overlay.position, "top-left");
        assert_eq!(config.browser.memory_limit_mb, 2_048);
    }

    #[test]
    fn partial_config_uses_defaults() {
        let config: VodloaderConfig = toml::from_str(
            "[store]\nbackend = \"memory\"\n\n[capture]\ncutoff_seconds = 60\n",
        )
        .unwrap();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.capture.cutoff_seconds, 60);
        assert_eq!(config.capture.chunk_size, 8192);
        assert!((config.ad_detection.fps_tolerance - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.queue.workers, 1);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = load_vodloader_config("/nonexistent/vodloader.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/vodloader.toml"));
    }

    #[test]
    fn encoder_timeout_scales_with_media_length() {
        let encoder = EncoderSection::default();
        assert_eq!(encoder.timeout_for(0.0), Duration::from_secs(600));
        assert_eq!(encoder.timeout_for(100.0), Duration::from_secs(1_000));
    }
}
