//! Settings model with defaults, builder, env and JSON loading

use crate::error::{ConfigError, Result};
use crate::network::{ProxySettings, SpeedLimit, SpeedUnit};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// What to do when a newly submitted URL already has a download record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateAction {
    /// Ask the user first; never a final action
    #[default]
    LetUserChoose,
    DuplicateWithNumber,
    OverwriteExisting,
    ShowCompleteDialogOrResume,
}

impl DuplicateAction {
    fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().replace('-', "_").as_str() {
            "let_user_choose" => Some(Self::LetUserChoose),
            "duplicate_with_number" => Some(Self::DuplicateWithNumber),
            "overwrite_existing" => Some(Self::OverwriteExisting),
            "show_complete_dialog_or_resume" => Some(Self::ShowCompleteDialogOrResume),
            _ => None,
        }
    }
}

/// Which notification sounds are enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoundSettings {
    #[serde(default = "default_true")]
    pub download_complete: bool,
    #[serde(default = "default_true")]
    pub download_stopped: bool,
    #[serde(default = "default_true")]
    pub download_failed: bool,
    #[serde(default = "default_true")]
    pub queue_started: bool,
    #[serde(default = "default_true")]
    pub queue_stopped: bool,
    #[serde(default = "default_true")]
    pub queue_finished: bool,
}

impl Default for SoundSettings {
    fn default() -> Self {
        Self {
            download_complete: true,
            download_stopped: true,
            download_failed: true,
            queue_started: true,
            queue_stopped: true,
            queue_finished: true,
        }
    }
}

impl SoundSettings {
    pub fn muted() -> Self {
        Self {
            download_complete: false,
            download_stopped: false,
            download_failed: false,
            queue_started: false,
            queue_stopped: false,
            queue_finished: false,
        }
    }
}

/// Download settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Number of chunks (connections) per file
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Global transfer speed cap, `None` when disabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_limit: Option<SpeedLimit>,

    /// Speed cap applied while chunk files are merged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_speed_limit: Option<SpeedLimit>,

    #[serde(default)]
    pub proxy: ProxySettings,

    #[serde(default)]
    pub duplicate_action: DuplicateAction,

    /// Default for new queues: whether paused files are picked up by the queue
    #[serde(default)]
    pub include_paused_files: bool,

    /// Download chunks in parallel instead of one after another
    #[serde(default = "default_true")]
    pub use_parallel_download: bool,

    /// Upper bound of in-memory buffering per file, in bytes
    #[serde(default = "default_max_memory_buffer")]
    pub max_memory_buffer_bytes: u64,

    /// Directory for chunk temp files; the system temp dir when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temporary_file_location: Option<PathBuf>,

    /// How often a chunk may restart before its temp file is discarded
    #[serde(default = "default_max_restart")]
    pub max_restart_without_clear_temp_file: u32,

    #[serde(default)]
    pub sounds: SoundSettings,

    /// Show the completion dialog for files finished outside a queue
    #[serde(default = "default_true")]
    pub show_complete_dialog: bool,

    /// Interval of the schedule evaluator in seconds
    #[serde(default = "default_schedule_interval")]
    pub schedule_interval_secs: u64,

    /// How long a blocking stop waits for the transport to confirm
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> usize {
    8
}

fn default_max_memory_buffer() -> u64 {
    64 * 1024 * 1024
}

fn default_max_restart() -> u32 {
    3
}

fn default_schedule_interval() -> u64 {
    5
}

fn default_stop_timeout() -> u64 {
    30
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            speed_limit: None,
            merge_speed_limit: None,
            proxy: ProxySettings::default(),
            duplicate_action: DuplicateAction::default(),
            include_paused_files: false,
            use_parallel_download: true,
            max_memory_buffer_bytes: default_max_memory_buffer(),
            temporary_file_location: None,
            max_restart_without_clear_temp_file: default_max_restart(),
            sounds: SoundSettings::default(),
            show_complete_dialog: true,
            schedule_interval_secs: default_schedule_interval(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

impl Settings {
    /// Create settings with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_connections(mut self, connections: usize) -> Self {
        self.max_connections = connections;
        self
    }

    pub fn with_speed_limit(mut self, limit: SpeedLimit) -> Self {
        self.speed_limit = Some(limit);
        self
    }

    pub fn with_merge_speed_limit(mut self, limit: SpeedLimit) -> Self {
        self.merge_speed_limit = Some(limit);
        self
    }

    pub fn with_proxy(mut self, proxy: ProxySettings) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn with_duplicate_action(mut self, action: DuplicateAction) -> Self {
        self.duplicate_action = action;
        self
    }

    pub fn with_include_paused_files(mut self, include: bool) -> Self {
        self.include_paused_files = include;
        self
    }

    pub fn with_temporary_file_location(mut self, path: impl Into<PathBuf>) -> Self {
        self.temporary_file_location = Some(path.into());
        self
    }

    pub fn with_sounds(mut self, sounds: SoundSettings) -> Self {
        self.sounds = sounds;
        self
    }

    pub fn with_show_complete_dialog(mut self, show: bool) -> Self {
        self.show_complete_dialog = show;
        self
    }

    pub fn with_schedule_interval(mut self, seconds: u64) -> Self {
        self.schedule_interval_secs = seconds;
        self
    }

    pub fn with_stop_timeout(mut self, seconds: u64) -> Self {
        self.stop_timeout_secs = seconds;
        self
    }

    /// Temp directory for chunk files
    pub fn temp_directory(&self) -> PathBuf {
        self.temporary_file_location
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Reject values the transport cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(ConfigError::invalid(
                "max_connections",
                "at least one connection is required",
            ));
        }
        if self.schedule_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "schedule_interval_secs",
                "interval must be positive",
            ));
        }
        for (field, limit) in [
            ("speed_limit", self.speed_limit),
            ("merge_speed_limit", self.merge_speed_limit),
        ] {
            if let Some(limit) = limit {
                if !limit.value.is_finite() || limit.value < 0.0 {
                    return Err(ConfigError::invalid(field, "speed must be a positive number"));
                }
            }
        }
        Ok(())
    }

    /// Load settings from environment variables on top of the defaults
    ///
    /// Supported environment variables:
    /// - RIVULET_MAX_CONNECTIONS: number (default: 8)
    /// - RIVULET_SPEED_LIMIT_KB: global speed cap in KB/s
    /// - RIVULET_DUPLICATE_ACTION: let_user_choose | duplicate_with_number |
    ///   overwrite_existing | show_complete_dialog_or_resume
    /// - RIVULET_INCLUDE_PAUSED_FILES: true/false
    /// - RIVULET_TEMP_DIR: chunk temp directory
    /// - RIVULET_SCHEDULE_INTERVAL: seconds (default: 5)
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Ok(connections) = std::env::var("RIVULET_MAX_CONNECTIONS") {
            if let Ok(connections) = connections.parse() {
                settings.max_connections = connections;
            }
        }

        if let Ok(limit) = std::env::var("RIVULET_SPEED_LIMIT_KB") {
            if let Ok(value) = limit.parse() {
                settings.speed_limit = Some(SpeedLimit::new(value, SpeedUnit::KB));
            }
        }

        if let Ok(action) = std::env::var("RIVULET_DUPLICATE_ACTION") {
            match DuplicateAction::parse(&action) {
                Some(action) => settings.duplicate_action = action,
                None => tracing::warn!(
                    "Unknown RIVULET_DUPLICATE_ACTION: {}, using default",
                    action
                ),
            }
        }

        if let Ok(include) = std::env::var("RIVULET_INCLUDE_PAUSED_FILES") {
            if let Ok(include) = include.parse() {
                settings.include_paused_files = include;
            }
        }

        if let Ok(dir) = std::env::var("RIVULET_TEMP_DIR") {
            settings.temporary_file_location = Some(PathBuf::from(dir));
        }

        if let Ok(interval) = std::env::var("RIVULET_SCHEDULE_INTERVAL") {
            if let Ok(interval) = interval.parse() {
                settings.schedule_interval_secs = interval;
            }
        }

        settings
    }

    /// Load settings from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize settings to JSON string
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Read settings from a file, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let settings = Self::from_json(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
