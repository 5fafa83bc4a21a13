//! Shared vocabulary for the loopwatch change-notification pipeline.
//!
//! Everything here is synchronous and I/O-free apart from reading a config
//! file: path classification, the JSON wire protocol, configuration and the
//! project directory seam. The async machinery lives in `loopwatch-daemon`.

pub mod classify;
pub mod config;
pub mod project;
pub mod protocol;
pub mod types;

pub use classify::{classify, classify_relative, normalize_path, relative_path};
pub use config::{Config, ConfigError, DebounceConfig, HeartbeatConfig, ServerConfig};
pub use project::{ProjectDirectory, ProjectEntry, StaticProjects};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use types::{ChangeEvent, ChangeKind, FileType};
