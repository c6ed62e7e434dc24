//! Rivulet - download manager orchestration
//!
//! Re-exports the settings and orchestration crates and offers a one-call
//! logging setup for hosts that do not install their own subscriber.

pub use rivulet_config as config;
pub use rivulet_core as core;

pub use rivulet_config::{DuplicateAction, Settings, SoundSettings};
pub use rivulet_core::{
    AddOutcome, CompletionHookRegistry, DownloadError, DownloadFile, DownloadQueue,
    DownloadService, DownloadStatus, FileEvent, FileId, NewDownload, QueueEvent, QueueId,
    QueueScheduler, ScheduleHandle, ScheduleManager, StopReason, Transport,
};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

/// Environment variable read by [`init_logging`]
pub const LOG_ENV: &str = "RIVULET_LOG";

static LOGGING: OnceCell<bool> = OnceCell::new();

/// Install a global fmt subscriber filtered by `RIVULET_LOG`
///
/// Falls back to `default_directive` when the variable is unset or invalid.
/// Returns false when another subscriber was already installed. Later calls
/// return the first result.
pub fn init_logging(default_directive: &str) -> bool {
    *LOGGING.get_or_init(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV)
            .unwrap_or_else(|_| EnvFilter::new(default_directive));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
            .is_ok()
    })
}

/// Scheduler over a restored service, with its default queue in place
///
/// Restores files and queues from the service's store, then creates the
/// default queue when none exists.
pub async fn open(
    service: DownloadService,
    system: std::sync::Arc<dyn rivulet_core::SystemActions>,
) -> rivulet_core::Result<QueueScheduler> {
    let restored = service.restore().await?;
    let scheduler = QueueScheduler::new(service, system);
    let queues = scheduler.restore().await?;
    let default = scheduler.ensure_default_queue();
    tracing::info!(
        "restored {} files and {} queues, default queue {}",
        restored,
        queues,
        default
    );
    Ok(scheduler)
}
