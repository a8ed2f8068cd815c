//! Worker configuration.
//!
//! Everything a run needs from its environment is carried by an explicit
//! [`WorkerConfig`] value that is handed to the [`crate::volume::VolumeSet`]
//! and the [`crate::orchestrator::Orchestrator`] at construction. There is no
//! process-wide configuration state.
//!
//! ```yaml
//! tmp_root: /var/lib/magikworker/tmp
//! poll_timeout_ms: 50
//! remove_container: true
//! ```

use crate::constants::{
    CHUNK_SIZE, DATA_VOLUME, POLL_TIMEOUT, STOP_RETRY_INTERVAL, STOP_STATUS_RETRIES,
    TEMP_VOLUME_MOUNT_PREFIX,
};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration shared by every run executed by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Host directory under which temporary volumes are created.
    pub tmp_root: PathBuf,
    /// Container-side prefix for temporary volume mounts.
    pub mount_prefix: String,
    /// Container-side path of the task data volume.
    pub data_volume: String,
    /// Readiness poll timeout in milliseconds.
    pub poll_timeout_ms: u64,
    /// Maximum bytes moved per connector step.
    pub chunk_size: usize,
    /// Status reloads attempted after a stop request timed out.
    pub stop_retries: u32,
    /// Delay between those status reloads, in milliseconds.
    pub stop_retry_interval_ms: u64,
    /// Remove containers after tasks that do not say otherwise.
    pub remove_container: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tmp_root: std::env::temp_dir(),
            mount_prefix: TEMP_VOLUME_MOUNT_PREFIX.to_string(),
            data_volume: DATA_VOLUME.to_string(),
            poll_timeout_ms: POLL_TIMEOUT.as_millis() as u64,
            chunk_size: CHUNK_SIZE,
            stop_retries: STOP_STATUS_RETRIES,
            stop_retry_interval_ms: STOP_RETRY_INTERVAL.as_millis() as u64,
            remove_container: false,
        }
    }
}

impl WorkerConfig {
    /// Parses a configuration from YAML and validates it.
    pub fn from_yaml(s: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a configuration from JSON and validates it.
    pub fn from_json(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the host root for temporary volumes.
    #[must_use]
    pub fn with_tmp_root(mut self, tmp_root: impl Into<PathBuf>) -> Self {
        self.tmp_root = tmp_root.into();
        self
    }

    /// Sets the container-side mount prefix for temporary volumes.
    #[must_use]
    pub fn with_mount_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.mount_prefix = prefix.into();
        self
    }

    /// Sets the container path of the task data volume.
    #[must_use]
    pub fn with_data_volume(mut self, path: impl Into<String>) -> Self {
        self.data_volume = path.into();
        self
    }

    /// Sets the readiness poll timeout.
    #[must_use]
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the per-step transfer ceiling.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Sets the stop retry budget.
    #[must_use]
    pub fn with_stop_retries(mut self, retries: u32, interval: Duration) -> Self {
        self.stop_retries = retries;
        self.stop_retry_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Enables or disables container removal after each run.
    #[must_use]
    pub fn with_remove_container(mut self, remove: bool) -> Self {
        self.remove_container = remove;
        self
    }

    /// Returns the readiness poll timeout.
    #[must_use]
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Returns the delay between status reloads after a stop timeout.
    #[must_use]
    pub fn stop_retry_interval(&self) -> Duration {
        Duration::from_millis(self.stop_retry_interval_ms)
    }

    /// Checks the configuration for values that would break a run.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size must be non-zero".into()));
        }
        if self.poll_timeout_ms > i32::MAX as u64 {
            return Err(Error::InvalidConfig(format!(
                "poll_timeout_ms {} exceeds {}",
                self.poll_timeout_ms,
                i32::MAX
            )));
        }
        for (name, value) in [
            ("mount_prefix", &self.mount_prefix),
            ("data_volume", &self.data_volume),
        ] {
            if !Path::new(value).is_absolute() {
                return Err(Error::InvalidConfig(format!(
                    "{name} must be an absolute container path, got '{value}'"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_constants() {
        let config = WorkerConfig::default();
        assert_eq!(config.poll_timeout(), POLL_TIMEOUT);
        assert_eq!(config.chunk_size, CHUNK_SIZE);
        assert_eq!(config.data_volume, DATA_VOLUME);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_partial_override() {
        let config = WorkerConfig::from_yaml("tmp_root: /srv/tmp\npoll_timeout_ms: 25\n").unwrap();
        assert_eq!(config.tmp_root, PathBuf::from("/srv/tmp"));
        assert_eq!(config.poll_timeout(), Duration::from_millis(25));
        assert_eq!(config.mount_prefix, TEMP_VOLUME_MOUNT_PREFIX);
    }

    #[test]
    fn test_rejects_relative_mount_prefix() {
        let result = WorkerConfig::from_json(r#"{"mount_prefix": "mnt/work"}"#);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_zero_chunk_size() {
        let config = WorkerConfig::default().with_chunk_size(0);
        assert!(config.validate().is_err());
    }
}
