use crate::backoff::BackoffConfig;
use crate::config::error::{ConfigError, Result};
use crate::decoder::Selector;
use crate::persistent_iterator::PersistentStreamOptions;
use crate::transport::RequestOptions;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Everything needed to tail one feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Feed request, repeated on every reconnect
    pub request: RequestOptions,

    /// Path of the items inside the response body (`*`, `results.*`, `` for NDJSON)
    pub selector: String,

    /// Reconnect when the server ends the feed cleanly
    pub indefinite: bool,

    /// Recycle a connection this long after its first data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_reconnect_after_ms: Option<u64>,

    /// Callbacks in flight at once; 1 means serial
    pub concurrency: usize,

    pub backoff: BackoffConfig,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            request: RequestOptions::default(),
            selector: "*".to_string(),
            indefinite: false,
            force_reconnect_after_ms: None,
            concurrency: 1,
            backoff: BackoffConfig::default(),
        }
    }
}

impl FeedConfig {
    /// Checks everything but the request URL, which callers often supply later.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.concurrency == 0 {
            problems.push("concurrency must be at least 1".to_string());
        }
        if let Err(err) = Selector::parse(&self.selector) {
            problems.push(format!("selector: {err}"));
        }
        if self.backoff.multiplier < 1.0 {
            problems.push(format!(
                "backoff.multiplier must be >= 1.0, got {}",
                self.backoff.multiplier
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter_factor) {
            problems.push(format!(
                "backoff.jitter_factor must be within 0.0..=1.0, got {}",
                self.backoff.jitter_factor
            ));
        }
        if self.backoff.initial_delay_ms > self.backoff.max_delay_ms {
            problems.push("backoff.initial_delay_ms exceeds backoff.max_delay_ms".to_string());
        }
        if self.force_reconnect_after_ms == Some(0) {
            problems.push("force_reconnect_after_ms must be positive".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationError(problems.join("; ")))
        }
    }

    /// Iterator options for this feed. Fails when no URL is configured.
    pub fn to_options(&self) -> Result<PersistentStreamOptions> {
        self.validate()?;
        if self.request.url.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "request.url must be set".to_string(),
            ));
        }
        Ok(PersistentStreamOptions {
            request: self.request.clone(),
            selector: self.selector.clone(),
            indefinite: self.indefinite,
            force_reconnect_after: self.force_reconnect_after_ms.map(Duration::from_millis),
            backoff: self.backoff.clone(),
        })
    }
}

/// Configuration loader with layered merging support
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Load configuration with layered merging:
    /// 1. Start with defaults (from Default implementations)
    /// 2. Merge config file if provided
    /// 3. Override with environment variables (FEED_ prefix)
    pub fn load(&self) -> Result<FeedConfig> {
        let mut builder = Config::builder();

        let defaults_json = serde_json::to_string(&FeedConfig::default())?;
        builder = builder.add_source(File::from_str(&defaults_json, config::FileFormat::Json));

        if let Some(ref path) = self.config_path {
            if path.exists() {
                builder = builder.add_source(File::from(path.as_ref()));
            } else {
                return Err(ConfigError::FileNotFound(path.clone()));
            }
        }

        // Double underscore nests: FEED_BACKOFF__MAX_RETRIES=5
        builder = builder.add_source(
            Environment::with_prefix("FEED")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let feed_config: FeedConfig = builder.build()?.try_deserialize()?;
        feed_config.validate()?;
        tracing::debug!(
            file = ?self.config_path,
            url = %feed_config.request.url,
            "feed configuration loaded"
        );
        Ok(feed_config)
    }

    /// Locate the default config file in standard locations:
    /// 1. Current directory: ./feed.toml
    /// 2. XDG config: ~/.config/feed/config.toml
    /// 3. Home directory: ~/.feed.toml
    pub fn find_config_file() -> Option<PathBuf> {
        let cwd_config = PathBuf::from("./feed.toml");
        if cwd_config.exists() {
            return Some(cwd_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let xdg_config = config_dir.join("feed").join("config.toml");
            if xdg_config.exists() {
                return Some(xdg_config);
            }
        }

        if let Some(home_dir) = dirs::home_dir() {
            let home_config = home_dir.join(".feed.toml");
            if home_config.exists() {
                return Some(home_config);
            }
        }

        None
    }

    /// Load configuration from default locations
    pub fn load_default() -> Result<FeedConfig> {
        let loader = match Self::find_config_file() {
            Some(config_path) => ConfigLoader::new().with_file(config_path),
            None => ConfigLoader::new(),
        };
        loader.load()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
