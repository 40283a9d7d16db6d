//! Byte sources for live and on-demand streams.

use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info};
use url::Url;

use crate::error::{Classify, FailureClass};
use crate::models::Channel;
use crate::platform::Quality;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("stream read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("upstream error: {0}")]
    Upstream(String),
    #[error("invalid stream url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl Classify for FetchError {
    fn class(&self) -> FailureClass {
        match self {
            FetchError::Io(_) | FetchError::Upstream(_) => FailureClass::TransientIo,
            FetchError::Spawn { .. } | FetchError::InvalidUrl { .. } => FailureClass::Internal,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        FetchError::Upstream(error.to_string())
    }
}

pub type FetchResult<T> = Result<T, FetchError>;

/// One read from the stream. `media_duration` is set by fetchers that know
/// how much playback time the bytes carry.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub data: Vec<u8>,
    pub media_duration: Option<Duration>,
}

impl Chunk {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            media_duration: None,
        }
    }
}

#[async_trait::async_trait]
pub trait ChunkReader: Send {
    /// `Ok(None)` once the upstream has ended.
    async fn next_chunk(&mut self) -> FetchResult<Option<Chunk>>;
}

#[async_trait::async_trait]
pub trait StreamFetcher: Send + Sync {
    async fn open(&self, channel: &Channel, quality: &Quality)
        -> FetchResult<Box<dyn ChunkReader>>;
}

fn expand_template(template: &str, channel: &Channel, quality: &Quality) -> String {
    template
        .replace("{login}", &channel.login)
        .replace("{id}", &channel.id)
        .replace("{quality}", quality.as_str())
}

/// Pipes `streamlink --stdout` for the channel's page URL.
#[derive(Debug, Clone)]
pub struct StreamlinkFetcher {
    program: PathBuf,
    url_template: String,
    chunk_size: usize,
}

impl StreamlinkFetcher {
    pub fn new(program: impl Into<PathBuf>, url_template: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            program: program.into(),
            url_template: url_template.into(),
            chunk_size: chunk_size.max(1),
        }
    }
}

#[async_trait::async_trait]
impl StreamFetcher for StreamlinkFetcher {
    async fn open(
        &self,
        channel: &Channel,
        quality: &Quality,
    ) -> FetchResult<Box<dyn ChunkReader>> {
        let url = expand_template(&self.url_template, channel, quality);
        info!(channel = %channel.login, %url, %quality, "opening streamlink");
        let mut child = Command::new(&self.program)
            .arg("--stdout")
            .arg(&url)
            .arg(quality.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| FetchError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FetchError::Upstream("streamlink stdout unavailable".into()))?;
        Ok(Box::new(ProcessReader {
            child,
            stdout,
            buffer: vec![0; self.chunk_size],
        }))
    }
}

struct ProcessReader {
    child: Child,
    stdout: ChildStdout,
    buffer: Vec<u8>,
}

#[async_trait::async_trait]
impl ChunkReader for ProcessReader {
    async fn next_chunk(&mut self) -> FetchResult<Option<Chunk>> {
        let read = self.stdout.read(&mut self.buffer).await?;
        if read == 0 {
            let status = self.child.wait().await?;
            debug!(?status, "stream process exited");
            return Ok(None);
        }
        Ok(Some(Chunk::new(self.buffer[..read].to_vec())))
    }
}

/// Streams an HTTP(S) body, or a local file through a `file://` URL.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    url_template: String,
    chunk_size: usize,
}

impl HttpFetcher {
    pub fn new(url_template: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            url_template: url_template.into(),
            chunk_size: chunk_size.max(1),
        }
    }
}

type BodyStream = Pin<Box<dyn Stream<Item = reqwest::Result<Vec<u8>>> + Send>>;

enum HttpReader {
    /// Network frames are regrouped into `chunk_size` pieces; only the last
    /// chunk of the body may be shorter.
    Remote {
        body: BodyStream,
        pending: Vec<u8>,
        chunk_size: usize,
    },
    Local { file: File, buffer: Vec<u8> },
}

impl HttpReader {
    fn remote(body: BodyStream, chunk_size: usize) -> Self {
        HttpReader::Remote {
            body,
            pending: Vec::with_capacity(chunk_size),
            chunk_size: chunk_size.max(1),
        }
    }
}

#[async_trait::async_trait]
impl StreamFetcher for HttpFetcher {
    async fn open(
        &self,
        channel: &Channel,
        quality: &Quality,
    ) -> FetchResult<Box<dyn ChunkReader>> {
        let url = expand_template(&self.url_template, channel, quality);
        let parsed = Url::parse(&url).map_err(|err| FetchError::InvalidUrl {
            url: url.clone(),
            reason: err.to_string(),
        })?;
        if parsed.scheme() == "file" {
            let path = parsed.to_file_path().map_err(|_| FetchError::InvalidUrl {
                url: url.clone(),
                reason: "invalid file url".into(),
            })?;
            let file = File::open(&path).await?;
            return Ok(Box::new(HttpReader::Local {
                file,
                buffer: vec![0; self.chunk_size],
            }));
        }
        info!(channel = %channel.login, %url, "opening http stream");
        let response = self.client.get(parsed).send().await?.error_for_status()?;
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()));
        Ok(Box::new(HttpReader::remote(Box::pin(stream), self.chunk_size)))
    }
}

#[async_trait::async_trait]
impl ChunkReader for HttpReader {
    async fn next_chunk(&mut self) -> FetchResult<Option<Chunk>> {
        match self {
            HttpReader::Remote {
                body,
                pending,
                chunk_size,
            } => {
                while pending.len() < *chunk_size {
                    match body.next().await {
                        Some(Ok(data)) => pending.extend_from_slice(&data),
                        Some(Err(err)) => return Err(err.into()),
                        None if pending.is_empty() => return Ok(None),
                        None => return Ok(Some(Chunk::new(std::mem::take(pending)))),
                    }
                }
                let rest = pending.split_off(*chunk_size);
                Ok(Some(Chunk::new(std::mem::replace(pending, rest))))
            }
            HttpReader::Local { file, buffer } => {
                let read = file.read(buffer).await?;
                if read == 0 {
                    return Ok(None);
                }
                Ok(Some(Chunk::new(buffer[..read].to_vec())))
            }
        }
    }
}
