//! Download orchestration core
//!
//! Owns the life of every download file above the transport: per-file status
//! transitions, chunk telemetry, duplicate-link policy, queue scheduling with
//! concurrency and retry limits, time-of-day schedules and the completion
//! hooks that run once a file finishes.
//!
//! Byte transfer, persistence, notifications and OS actions are collaborators
//! behind the traits in [`transport`], [`store`] and [`system`].

pub mod download;
pub mod duplicate;
pub mod error;
mod finish;
pub mod hooks;
pub mod model;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod system;
pub mod telemetry;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use download::{AddOutcome, DownloadService, DownloadServiceBuilder, FileEvent, NewDownload};
pub use duplicate::DuplicateResolution;
pub use error::{DownloadError, ErrorKind, Result};
pub use hooks::{
    CompletionHookRegistry, FinishedFile, HookOutcome, HookReport, HookResult, PauseCallback,
    SubscriptionId,
};
pub use model::{
    Credentials, DaysOfWeek, DownloadFile, DownloadQueue, DownloadStatus, FileId, QueueId,
    TimeOfDay, TurnOffComputerMode,
};
pub use schedule::{ScheduleHandle, ScheduleManager, ScheduleReport};
pub use scheduler::{QueueEvent, QueueScheduler, QueueSnapshot, StopReason, DEFAULT_QUEUE_TITLE};
pub use store::{FileStore, JsonStore, MemoryStore};
pub use system::{
    Clock, DiskSpace, Fs2DiskSpace, LoggingSystemActions, Notifier, SoundKind, SystemActions,
    SystemClock, TracingNotifier,
};
pub use telemetry::{ChunkProgress, ChunkState, ChunkView, TransferSnapshot};
pub use transport::{
    DownloadPackage, EventSink, FinishOutcome, PackageChunk, ProgressSample, RestartReason,
    StartRequest, Transport, TransportConfig, TransportEvent,
};
