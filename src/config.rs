//! Configuration loading and management

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::tap::{key_code_for_name, KeyCode};

/// Default hold delay in milliseconds
const DEFAULT_HOLD_DELAY_MS: u64 = 250;

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the designated key (e.g. "space")
    pub key: String,

    /// Virtual key code of the designated key
    pub key_code: KeyCode,

    /// How long the designated key must stay down to count as a hold
    pub hold_delay: Duration,

    /// Path to the Unix domain socket for IPC
    pub socket_path: PathBuf,

    /// Directory for runtime data
    pub data_dir: PathBuf,
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        let home = std::env::var("HOME").context("HOME is not set")?;
        let data_dir = PathBuf::from(&home)
            .join(".local")
            .join("share")
            .join("holdkey");

        let socket_path = match std::env::var("HOLDKEY_SOCKET") {
            Ok(path) => PathBuf::from(path),
            Err(_) => data_dir.join("daemon.sock"),
        };

        let key = std::env::var("HOLDKEY_KEY").unwrap_or_else(|_| "space".to_string());
        let key_code = match key_code_for_name(&key) {
            Some(code) => code,
            None => bail!("unknown designated key name: {key:?}"),
        };

        let hold_delay_ms = match std::env::var("HOLDKEY_HOLD_DELAY_MS") {
            Ok(raw) => raw
                .parse::<u64>()
                .context("HOLDKEY_HOLD_DELAY_MS must be an integer")?,
            Err(_) => DEFAULT_HOLD_DELAY_MS,
        };

        Ok(Self {
            key,
            key_code,
            hold_delay: Duration::from_millis(hold_delay_ms),
            socket_path,
            data_dir,
        })
    }

    /// Ensure data directory exists
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tap::SPACE;

    // Defaults and overrides share one test so the env mutations don't
    // race between parallel test threads.
    #[test]
    fn test_config_load() {
        std::env::remove_var("HOLDKEY_KEY");
        std::env::remove_var("HOLDKEY_HOLD_DELAY_MS");

        let config = Config::load().unwrap();
        assert_eq!(config.key, "space");
        assert_eq!(config.key_code, SPACE);
        assert_eq!(config.hold_delay, Duration::from_millis(250));
        assert!(config.socket_path.to_string_lossy().contains("holdkey"));

        std::env::set_var("HOLDKEY_KEY", "q");
        std::env::set_var("HOLDKEY_HOLD_DELAY_MS", "400");
        let config = Config::load().unwrap();
        assert_eq!(config.key, "q");
        assert_eq!(config.key_code, 12);
        assert_eq!(config.hold_delay, Duration::from_millis(400));

        std::env::set_var("HOLDKEY_KEY", "not-a-key");
        assert!(Config::load().is_err());

        std::env::remove_var("HOLDKEY_KEY");
        std::env::remove_var("HOLDKEY_HOLD_DELAY_MS");
    }
}
