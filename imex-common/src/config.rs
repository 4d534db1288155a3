//! Configuration loading for IMEX workers
//!
//! Options are plain structs passed into component constructors; nothing is
//! read from process-wide state after startup. Config files are TOML and
//! resolved in priority order:
//! 1. Command-line argument (highest priority)
//! 2. `IMEX_CONFIG_DIR` environment variable (directory containing
//!    `<module>.toml`)
//! 3. Per-user config directory (`<config dir>/imex/<module>.toml`)
//! 4. Compiled defaults (fallback)

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::info;

use crate::error::{Error, Result};

/// Options for a [`crate::Producer`] publishing to one exchange.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProducerOptions {
    /// Exchange publishes are sent to
    pub exchange_name: String,
    /// Routing key used when the caller does not supply one
    pub routing_key: String,
    /// Maximum number of confirm-wait attempts before escalating fatally
    pub max_confirm_attempts: u32,
    /// How long one confirm-wait attempt blocks before retrying
    pub confirm_timeout_ms: u64,
    /// Maximum publish attempts for a single message
    pub max_publish_attempts: u32,
    /// Delay between publish attempts
    pub publish_retry_delay_ms: u64,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self {
            exchange_name: String::new(),
            routing_key: String::new(),
            max_confirm_attempts: 3,
            confirm_timeout_ms: 5000,
            max_publish_attempts: 3,
            publish_retry_delay_ms: 200,
        }
    }
}

impl ProducerOptions {
    /// Verify the options that have no usable default are populated.
    pub fn verify_populated(&self) -> Result<()> {
        if self.exchange_name.trim().is_empty() {
            return Err(Error::Config("producer exchange_name is empty".into()));
        }
        Ok(())
    }
}

/// Options for one queue consumer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerOptions {
    /// Queue to consume from
    pub queue_name: String,
    /// Maximum unacknowledged deliveries outstanding at once
    pub prefetch_count: usize,
    /// Whether the delivery in progress is requeued when the stage faults
    /// fatally (a fresh worker will see the message again)
    pub requeue_on_fatal: bool,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            queue_name: String::new(),
            prefetch_count: 1,
            requeue_on_fatal: false,
        }
    }
}

impl ConsumerOptions {
    pub fn verify_populated(&self) -> Result<()> {
        if self.queue_name.trim().is_empty() {
            return Err(Error::Config("consumer queue_name is empty".into()));
        }
        Ok(())
    }
}

/// Resolve the config file path for a module, if any exists.
pub fn resolve_config_path(module: &str, cli_arg: Option<&Path>) -> Option<PathBuf> {
    // Priority 1: command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: environment variable pointing at a config directory
    if let Ok(dir) = std::env::var("IMEX_CONFIG_DIR") {
        return Some(PathBuf::from(dir).join(format!("{module}.toml")));
    }

    // Priority 3: per-user config directory
    dirs::config_dir().map(|d| d.join("imex").join(format!("{module}.toml")))
}

/// Load a module's options, falling back to compiled defaults when no
/// config file is present.
pub fn load_options<T>(module: &str, cli_arg: Option<&Path>) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    match resolve_config_path(module, cli_arg) {
        Some(path) if path.exists() => {
            let raw = std::fs::read_to_string(&path)?;
            let options = toml::from_str(&raw)
                .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
            info!("Loaded configuration from {}", path.display());
            Ok(options)
        }
        Some(path) => {
            info!(
                "No config file at {}, using compiled defaults",
                path.display()
            );
            Ok(T::default())
        }
        None => {
            info!("No config directory available, using compiled defaults");
            Ok(T::default())
        }
    }
}
