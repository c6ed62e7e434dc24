//! Download file and queue records

use chrono::{DateTime, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Stable identifier of a download file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier of a download queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueId(pub u64);

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a download file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DownloadStatus {
    #[default]
    None,
    Downloading,
    Paused,
    Stopping,
    Stopped,
    Error,
    Completed,
    Merging,
}

impl DownloadStatus {
    /// Completed, Error or Stopped
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Completed | DownloadStatus::Error | DownloadStatus::Stopped
        )
    }

    /// The transport is working on the file (Merging is a sub-state of Downloading)
    pub fn is_transferring(&self) -> bool {
        matches!(self, DownloadStatus::Downloading | DownloadStatus::Merging)
    }

    /// A start request is accepted from this status
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            DownloadStatus::None | DownloadStatus::Stopped | DownloadStatus::Error
        )
    }

    /// A stop request has something to cancel
    pub fn can_stop(&self) -> bool {
        matches!(
            self,
            DownloadStatus::Downloading | DownloadStatus::Merging | DownloadStatus::Paused
        )
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Credentials sent with the transport request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// One requested download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadFile {
    pub id: FileId,
    pub url: String,
    #[serde(default)]
    pub referer: Option<String>,
    #[serde(default)]
    pub page_address: Option<String>,
    #[serde(default)]
    pub credentials: Option<Credentials>,

    pub save_location: PathBuf,
    pub file_name: String,
    #[serde(default)]
    pub category_id: Option<u64>,

    #[serde(default)]
    pub download_queue_id: Option<QueueId>,
    #[serde(default)]
    pub download_queue_priority: Option<i64>,

    #[serde(default)]
    pub size: Option<u64>,
    /// The server does not announce a size; skips the free-space check
    #[serde(default)]
    pub is_size_unknown: bool,
    #[serde(default)]
    pub downloaded_size: u64,
    #[serde(default)]
    pub download_progress: f64,
    #[serde(default)]
    pub transfer_rate: f64,
    #[serde(default)]
    pub time_left: Option<Duration>,
    #[serde(default)]
    pub elapsed_time: Duration,
    /// Opaque resumable package produced by the transport
    #[serde(default)]
    pub download_package: Option<String>,

    #[serde(default)]
    pub status: DownloadStatus,
    #[serde(default)]
    pub last_try_date: Option<DateTime<Utc>>,
    pub date_added: DateTime<Utc>,
    #[serde(default)]
    pub count_of_error: u32,
}

impl DownloadFile {
    pub fn new(
        id: FileId,
        url: impl Into<String>,
        save_location: impl Into<PathBuf>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            id,
            url: url.into(),
            referer: None,
            page_address: None,
            credentials: None,
            save_location: save_location.into(),
            file_name: file_name.into(),
            category_id: None,
            download_queue_id: None,
            download_queue_priority: None,
            size: None,
            is_size_unknown: false,
            downloaded_size: 0,
            download_progress: 0.0,
            transfer_rate: 0.0,
            time_left: None,
            elapsed_time: Duration::ZERO,
            download_package: None,
            status: DownloadStatus::None,
            last_try_date: None,
            date_added: Utc::now(),
            count_of_error: 0,
        }
    }

    /// Destination path of the finished file
    pub fn full_path(&self) -> PathBuf {
        self.save_location.join(&self.file_name)
    }

    /// Queue id and priority are always set together
    pub fn assign_queue(&mut self, queue: QueueId, priority: i64) {
        self.download_queue_id = Some(queue);
        self.download_queue_priority = Some(priority);
    }

    pub fn detach_queue(&mut self) {
        self.download_queue_id = None;
        self.download_queue_priority = None;
    }

    pub fn is_in_queue(&self, queue: QueueId) -> bool {
        self.download_queue_id == Some(queue)
    }

    /// Clear everything a fresh download would recompute
    pub fn reset_progress(&mut self) {
        self.downloaded_size = 0;
        self.download_progress = 0.0;
        self.transfer_rate = 0.0;
        self.time_left = None;
        self.elapsed_time = Duration::ZERO;
        self.download_package = None;
        self.count_of_error = 0;
    }
}

/// Hour and minute of a schedule rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeOfDay {
    pub hour: u32,
    pub minute: u32,
}

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Self {
        Self { hour, minute }
    }
}

/// Day-of-week bitset, bit 0 is Sunday
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DaysOfWeek(u8);

impl DaysOfWeek {
    pub const NONE: DaysOfWeek = DaysOfWeek(0);
    pub const ALL: DaysOfWeek = DaysOfWeek(0b0111_1111);

    pub fn from_days(days: &[Weekday]) -> Self {
        days.iter().fold(Self::NONE, |set, day| set.with(*day))
    }

    pub fn with(self, day: Weekday) -> Self {
        DaysOfWeek(self.0 | Self::bit(day))
    }

    pub fn contains(&self, day: Weekday) -> bool {
        self.0 & Self::bit(day) != 0
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    fn bit(day: Weekday) -> u8 {
        1 << day.num_days_from_sunday()
    }
}

/// How the computer is turned off after a queue finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TurnOffComputerMode {
    #[default]
    Shutdown,
    Sleep,
    Hibernate,
}

impl TurnOffComputerMode {
    pub const ALL: [TurnOffComputerMode; 3] = [
        TurnOffComputerMode::Shutdown,
        TurnOffComputerMode::Sleep,
        TurnOffComputerMode::Hibernate,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            TurnOffComputerMode::Shutdown => "Shut down",
            TurnOffComputerMode::Sleep => "Sleep",
            TurnOffComputerMode::Hibernate => "Hibernate",
        }
    }
}

/// A named, independently schedulable bucket of files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadQueue {
    pub id: QueueId,
    pub title: String,
    pub download_count_at_same_time: usize,
    #[serde(default)]
    pub retry_on_download_failed: bool,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub include_paused_files: bool,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub is_last_choice: bool,

    #[serde(default)]
    pub start_download_schedule: Option<TimeOfDay>,
    #[serde(default)]
    pub stop_download_schedule: Option<TimeOfDay>,
    #[serde(default)]
    pub is_daily: bool,
    #[serde(default)]
    pub just_for_date: Option<NaiveDate>,
    #[serde(default)]
    pub days_of_week: DaysOfWeek,

    #[serde(default)]
    pub show_alarm_when_done: bool,
    #[serde(default)]
    pub exit_program_when_done: bool,
    #[serde(default)]
    pub turn_off_computer_when_done: bool,
    #[serde(default)]
    pub turn_off_computer_mode: TurnOffComputerMode,
}

impl DownloadQueue {
    pub fn new(id: QueueId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            download_count_at_same_time: 1,
            retry_on_download_failed: false,
            retry_count: 0,
            include_paused_files: false,
            is_default: false,
            is_last_choice: false,
            start_download_schedule: None,
            stop_download_schedule: None,
            is_daily: false,
            just_for_date: None,
            days_of_week: DaysOfWeek::NONE,
            show_alarm_when_done: false,
            exit_program_when_done: false,
            turn_off_computer_when_done: false,
            turn_off_computer_mode: TurnOffComputerMode::default(),
        }
    }

    /// Retry guard: files that failed too often are no longer picked up
    pub fn allows_attempt(&self, count_of_error: u32) -> bool {
        !self.retry_on_download_failed || count_of_error < self.retry_count
    }
}
