//! Settings consumed by the download orchestration core
//!
//! Everything the core reads from the settings collaborator lives here:
//! connection count, speed limits, proxy, duplicate-link policy, paused-file
//! defaults, sound toggles and the temp directory handed to the transport.

mod error;
mod network;
mod settings;

pub use error::{ConfigError, Result};
pub use network::{CustomProxy, ProxyKind, ProxySettings, SpeedLimit, SpeedUnit};
pub use settings::{DuplicateAction, Settings, SoundSettings};
