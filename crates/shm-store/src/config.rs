use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Startup configuration for an [`ObjectStore`](crate::ObjectStore).
///
/// Loadable from TOML; missing keys take their defaults:
///
/// ```toml
/// primary_capacity = 1073741824
/// primary_dir = "/dev/shm"
/// fallback_dir = "/var/tmp/shmstore"
/// fallback_capacity = 8589934592
/// max_allocation = 268435456
/// mutable_timeout_ms = 10000
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Size of the primary shared region in bytes.
    pub primary_capacity: u64,
    /// Directory to create the primary region's file in. Anonymous shared
    /// memory when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_dir: Option<PathBuf>,
    /// Directory for disk-backed fallback allocations. Fallback is disabled
    /// when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_dir: Option<PathBuf>,
    /// Ceiling on live fallback bytes.
    pub fallback_capacity: u64,
    /// Largest single allocation. Defaults to the primary capacity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_allocation: Option<u64>,
    /// Default bound on mutable-object waits, in milliseconds.
    pub mutable_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            primary_capacity: 64 * 1024 * 1024, // 64 MiB
            primary_dir: None,
            fallback_dir: None,
            fallback_capacity: 0,
            max_allocation: None,
            mutable_timeout_ms: 10_000,
        }
    }
}

impl StoreConfig {
    /// Anonymous primary region of `capacity` bytes, no fallback.
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            primary_capacity: capacity,
            ..Default::default()
        }
    }

    /// Enable fallback allocations in `dir`, up to `capacity` bytes.
    pub fn with_fallback(mut self, dir: impl Into<PathBuf>, capacity: u64) -> Self {
        self.fallback_dir = Some(dir.into());
        self.fallback_capacity = capacity;
        self
    }

    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> StoreResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| StoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn from_file(path: &Path) -> StoreResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> StoreResult<String> {
        toml::to_string_pretty(self).map_err(|e| StoreError::Config(e.to_string()))
    }

    /// Reject configurations the store cannot start with.
    pub fn validate(&self) -> StoreResult<()> {
        if self.primary_capacity == 0 {
            return Err(StoreError::Config("primary_capacity must be non-zero".into()));
        }
        if self.max_allocation == Some(0) {
            return Err(StoreError::Config("max_allocation must be non-zero".into()));
        }
        if self.fallback_capacity > 0 && self.fallback_dir.is_none() {
            return Err(StoreError::Config(
                "fallback_capacity is set but fallback_dir is not".into(),
            ));
        }
        to_usize("primary_capacity", self.primary_capacity)?;
        to_usize("fallback_capacity", self.fallback_capacity)?;
        Ok(())
    }

    /// Primary capacity in bytes.
    pub fn primary_bytes(&self) -> StoreResult<usize> {
        to_usize("primary_capacity", self.primary_capacity)
    }

    /// Fallback ceiling in bytes.
    pub fn fallback_bytes(&self) -> StoreResult<usize> {
        to_usize("fallback_capacity", self.fallback_capacity)
    }

    /// Effective maximum single allocation in bytes.
    pub fn max_allocation_bytes(&self) -> StoreResult<usize> {
        to_usize(
            "max_allocation",
            self.max_allocation.unwrap_or(self.primary_capacity),
        )
    }

    /// Default mutable-object wait bound.
    pub fn mutable_timeout(&self) -> Duration {
        Duration::from_millis(self.mutable_timeout_ms)
    }
}

fn to_usize(field: &str, value: u64) -> StoreResult<usize> {
    usize::try_from(value)
        .map_err(|_| StoreError::Config(format!("{field} = {value} does not fit this platform")))
}
