//! Seam to the chunked HTTP download engine
//!
//! The engine itself lives outside this crate. The core hands it a
//! [`StartRequest`] built from the settings, drives it through the
//! [`Transport`] controls and receives its lifecycle through an [`EventSink`].

use crate::error::Result;
use crate::model::{Credentials, DownloadFile, FileId};
use crate::telemetry::ChunkProgress;
use async_trait::async_trait;
use rivulet_config::{ProxySettings, Settings};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Configuration handed to the transport for one download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    pub chunk_count: usize,
    /// Bytes per second, `None` for unlimited
    pub max_speed: Option<u64>,
    pub merge_max_speed: Option<u64>,
    pub use_parallel_download: bool,
    pub max_memory_buffer_bytes: u64,
    pub temp_directory: PathBuf,
    pub max_restart_without_clear_temp_file: u32,
    pub proxy: ProxySettings,
}

impl TransportConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            chunk_count: settings.max_connections.max(1),
            max_speed: settings.speed_limit.and_then(|l| l.bytes_per_second()),
            merge_max_speed: settings.merge_speed_limit.and_then(|l| l.bytes_per_second()),
            use_parallel_download: settings.use_parallel_download,
            max_memory_buffer_bytes: settings.max_memory_buffer_bytes,
            temp_directory: settings.temp_directory(),
            max_restart_without_clear_temp_file: settings.max_restart_without_clear_temp_file,
            proxy: settings.proxy.clone(),
        }
    }
}

/// Everything the transport needs to start (or continue) a download
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub file_id: FileId,
    pub url: String,
    pub referer: Option<String>,
    pub page_address: Option<String>,
    pub credentials: Option<Credentials>,
    pub destination: PathBuf,
    /// Package stored at the last pause, passed back verbatim
    pub package: Option<String>,
    pub config: TransportConfig,
}

impl StartRequest {
    pub fn for_file(file: &DownloadFile, config: TransportConfig) -> Self {
        Self {
            file_id: file.id,
            url: file.url.clone(),
            referer: file.referer.clone(),
            page_address: file.page_address.clone(),
            credentials: file.credentials.clone(),
            destination: file.full_path(),
            package: file.download_package.clone(),
            config,
        }
    }
}

/// Aggregate progress sample of a file
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    pub received: u64,
    pub total: Option<u64>,
    /// Instantaneous speed in bytes per second
    pub speed: f64,
    /// Average speed in bytes per second
    pub average_speed: f64,
}

/// Why a chunk was restarted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartReason {
    SizeMismatch,
    TempFileCorrupted,
    Other(String),
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartReason::SizeMismatch => write!(f, "received size does not match the chunk size"),
            RestartReason::TempFileCorrupted => write!(f, "temporary chunk file is corrupted"),
            RestartReason::Other(reason) => write!(f, "{}", reason),
        }
    }
}

/// How a transport run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishOutcome {
    Success,
    Cancelled,
    Failed(String),
}

/// Lifecycle events emitted by the transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Started,
    Progress(ProgressSample),
    ChunkProgress(ChunkProgress),
    MergeStarted,
    MergeProgress { percent: f64 },
    ChunkRestarted { chunk_id: String, reason: RestartReason },
    Finished(FinishOutcome),
}

pub(crate) enum PumpMessage {
    Event(FileId, TransportEvent),
    Barrier(oneshot::Sender<()>),
}

/// Channel through which a transport reports events back to the core
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<PumpMessage>,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<PumpMessage>) -> Self {
        Self { tx }
    }

    /// Returns false once the core has shut down
    pub fn emit(&self, file_id: FileId, event: TransportEvent) -> bool {
        self.tx.send(PumpMessage::Event(file_id, event)).is_ok()
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink").finish_non_exhaustive()
    }
}

/// Controls of the download engine
///
/// `start`, `resume` and `cancel` are requests: they return as soon as the
/// engine accepted them and the outcome arrives through the [`EventSink`].
/// A cancelled run must end with `Finished(Cancelled)`.
#[async_trait]
pub trait Transport: Send + Sync {
    fn start(&self, request: StartRequest, events: EventSink) -> Result<()>;

    /// Pause the live run and return its resumable package
    async fn pause(&self, file_id: FileId) -> Result<Option<String>>;

    /// Continue a paused live run without re-negotiating range support
    fn resume(&self, file_id: FileId) -> Result<()>;

    fn cancel(&self, file_id: FileId) -> Result<()>;

    /// Check whether the server supports resuming; aborted when `cancel` fires
    async fn probe_resume_support(&self, _url: &str, _cancel: CancellationToken) -> Result<bool> {
        Ok(false)
    }
}

/// One chunk inside a [`DownloadPackage`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageChunk {
    pub chunk_id: String,
    pub start: u64,
    pub end: u64,
    pub received: u64,
    pub total: u64,
    pub is_completed: bool,
}

impl PackageChunk {
    pub fn progress(&self) -> ChunkProgress {
        ChunkProgress {
            chunk_id: self.chunk_id.clone(),
            received: self.received,
            total: self.total,
            is_completed: self.is_completed,
        }
    }
}

/// Resumable download package
///
/// Format transports may use for the blob returned from [`Transport::pause`].
/// The state machine stores the blob verbatim and only reads it back to show
/// the chunk table of a paused file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadPackage {
    pub url: String,
    pub file_name: String,
    pub total_size: Option<u64>,
    pub supports_range: bool,
    pub chunks: Vec<PackageChunk>,
}

impl DownloadPackage {
    pub fn to_blob(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| crate::error::DownloadError::storage(format!("package encode: {}", e)))
    }

    pub fn from_blob(blob: &str) -> Result<Self> {
        serde_json::from_str(blob)
            .map_err(|e| crate::error::DownloadError::storage(format!("package decode: {}", e)))
    }

    pub fn received(&self) -> u64 {
        self.chunks.iter().map(|c| c.received).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rivulet_config::{SpeedLimit, SpeedUnit};

    #[test]
    fn test_config_from_settings() {
        let settings = Settings::new()
            .with_max_connections(4)
            .with_speed_limit(SpeedLimit::new(100.0, SpeedUnit::KB))
            .with_temporary_file_location("/var/tmp/chunks");
        let config = TransportConfig::from_settings(&settings);

        assert_eq!(config.chunk_count, 4);
        assert_eq!(config.max_speed, Some(102_400));
        assert_eq!(config.merge_max_speed, None);
        assert_eq!(config.temp_directory, PathBuf::from("/var/tmp/chunks"));
        assert_eq!(config.max_restart_without_clear_temp_file, 3);
    }

    #[test]
    fn test_paused_package_reload_keeps_chunks() {
        let package = DownloadPackage {
            url: "http://example.com/video.mp4".to_string(),
            file_name: "video.mp4".to_string(),
            total_size: Some(300),
            supports_range: true,
            chunks: vec![
                PackageChunk {
                    chunk_id: "0".to_string(),
                    start: 0,
                    end: 149,
                    received: 150,
                    total: 150,
                    is_completed: true,
                },
                PackageChunk {
                    chunk_id: "1".to_string(),
                    start: 150,
                    end: 299,
                    received: 42,
                    total: 150,
                    is_completed: false,
                },
            ],
        };

        let reloaded = DownloadPackage::from_blob(&package.to_blob().unwrap()).unwrap();
        let original: Vec<ChunkProgress> = package.chunks.iter().map(|c| c.progress()).collect();
        let restored: Vec<ChunkProgress> = reloaded.chunks.iter().map(|c| c.progress()).collect();
        assert_eq!(original, restored);
        assert_eq!(reloaded.received(), 192);
    }

    #[test]
    fn test_restart_reason_text() {
        assert_eq!(
            RestartReason::TempFileCorrupted.to_string(),
            "temporary chunk file is corrupted"
        );
    }
}
