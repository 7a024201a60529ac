//! tilescale-core: shared types and configuration for tilescale.
//!
//! Holds the pieces every other crate agrees on: the metric sample the
//! controller consumes, the validated scaling policy, replica health, and
//! the `tilescale.toml` parser.

pub mod config;
pub mod duration;
pub mod error;
pub mod types;

pub use config::{STACK_ENV_PREFIX, TilescaleConfig};
pub use duration::parse_duration;
pub use error::{ConfigError, ConfigResult};
pub use types::*;
