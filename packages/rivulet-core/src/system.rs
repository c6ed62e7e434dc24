//! Collaborators outside the core: notifications, power actions, disk space
//! and the clock used by the schedule evaluator.

use crate::error::DownloadError;
use crate::model::{DownloadFile, FileId, TurnOffComputerMode};
use chrono::NaiveDateTime;
use rivulet_config::SoundSettings;
use std::io;
use std::path::Path;

/// Notification sounds the core may request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SoundKind {
    DownloadComplete,
    DownloadStopped,
    DownloadFailed,
    QueueStarted,
    QueueStopped,
    QueueFinished,
}

impl SoundKind {
    pub fn is_enabled(&self, sounds: &SoundSettings) -> bool {
        match self {
            SoundKind::DownloadComplete => sounds.download_complete,
            SoundKind::DownloadStopped => sounds.download_stopped,
            SoundKind::DownloadFailed => sounds.download_failed,
            SoundKind::QueueStarted => sounds.queue_started,
            SoundKind::QueueStopped => sounds.queue_stopped,
            SoundKind::QueueFinished => sounds.queue_finished,
        }
    }
}

/// User-facing notifications
///
/// Implementations decide how to present these; the core only decides when.
pub trait Notifier: Send + Sync {
    fn play_sound(&self, kind: SoundKind);

    /// Completion dialog for a file finished outside a queue
    fn show_completion(&self, file: &DownloadFile);

    /// Errors of all completion hooks of one finished file, reported once
    fn report_hook_errors(&self, file_id: FileId, errors: &[String]);

    fn warn(&self, file_id: FileId, message: &str);

    fn start_refused(&self, file_id: FileId, error: &DownloadError);
}

/// Notifier that only writes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn play_sound(&self, kind: SoundKind) {
        tracing::debug!("sound requested: {:?}", kind);
    }

    fn show_completion(&self, file: &DownloadFile) {
        tracing::info!("download {} completed: {}", file.id, file.full_path().display());
    }

    fn report_hook_errors(&self, file_id: FileId, errors: &[String]) {
        for error in errors {
            tracing::warn!("completion hook of file {} failed: {}", file_id, error);
        }
    }

    fn warn(&self, file_id: FileId, message: &str) {
        tracing::warn!("file {}: {}", file_id, message);
    }

    fn start_refused(&self, file_id: FileId, error: &DownloadError) {
        tracing::warn!("start of file {} refused: {}", file_id, error);
    }
}

/// End-of-queue actions on the host
pub trait SystemActions: Send + Sync {
    fn turn_off_computer(&self, mode: TurnOffComputerMode);
    fn exit_program(&self);
}

/// Logs the requested action instead of performing it
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSystemActions;

impl SystemActions for LoggingSystemActions {
    fn turn_off_computer(&self, mode: TurnOffComputerMode) {
        tracing::info!("turn off computer requested: {}", mode.label());
    }

    fn exit_program(&self) {
        tracing::info!("exit program requested");
    }
}

/// Free space lookup for the start check
pub trait DiskSpace: Send + Sync {
    fn available_space(&self, path: &Path) -> io::Result<u64>;
}

/// Free space of the volume holding `path`, via `fs2`
#[derive(Debug, Default, Clone, Copy)]
pub struct Fs2DiskSpace;

impl DiskSpace for Fs2DiskSpace {
    fn available_space(&self, path: &Path) -> io::Result<u64> {
        // The save directory may not exist yet
        let mut probe = path;
        while !probe.exists() {
            match probe.parent() {
                Some(parent) => probe = parent,
                None => break,
            }
        }
        fs2::available_space(probe)
    }
}

/// Local wall-clock time source
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sound_gating() {
        let mut sounds = SoundSettings::default();
        assert!(SoundKind::QueueStopped.is_enabled(&sounds));
        sounds.queue_stopped = false;
        assert!(!SoundKind::QueueStopped.is_enabled(&sounds));
        assert!(!SoundKind::DownloadFailed.is_enabled(&SoundSettings::muted()));
    }

    #[test]
    fn test_fs2_disk_space_walks_up_to_existing_dir() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("not").join("created").join("yet");
        let available = Fs2DiskSpace.available_space(&missing).unwrap();
        assert!(available > 0);
    }
}
