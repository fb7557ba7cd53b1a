//! Configuration loading
//!
//! Defaults, project YAML, local YAML and `AUTOLAB_*` environment variables
//! are merged with figment and validated before use.

pub mod loader;

pub use loader::{ConfigError, ConfigLoader};
