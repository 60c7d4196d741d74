//! Layered feed configuration:
//! 1. Defaults (from code)
//! 2. Config file (feed.toml)
//! 3. Environment variables (FEED_* prefix)
//!
//! ```no_run
//! use codex_feed_stream::config::ConfigLoader;
//!
//! let config = ConfigLoader::load_default().expect("Failed to load config");
//! let options = config.to_options().expect("feed url missing");
//! ```
pub mod error;
pub mod loader;

pub use error::{ConfigError, Result};
pub use loader::{ConfigLoader, FeedConfig};
