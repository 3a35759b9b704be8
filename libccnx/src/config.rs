use crate::error::ConfigError;
use ron::ser::PrettyConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_SEGMENT_SIZE: usize = 4096;
pub const DEFAULT_SEGMENT_COUNT: usize = 24;
pub const DEFAULT_PUMP_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_WORKER_NAME: &str = "ccnx-transport";

/// Options for the interest sent for a content name, and for the fetch stream that reassembles its segments. These are
/// handed to the fetch backend unchanged.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterestOptions {
    /// Accept stale content from caches.
    pub allow_stale: bool,
    /// Maximum number of name components that may follow the requested prefix.
    pub max_suffix_components: u32,
    /// Number of segments the fetch library may buffer ahead of the reader.
    pub max_buffers: u32,
    /// Assume every content segment has the same size.
    pub assume_fixed: bool,
}

impl Default for InterestOptions {
    fn default() -> Self {
        Self { allow_stale: false, max_suffix_components: 1, max_buffers: 4, assume_fixed: false }
    }
}

/// Configuration for a fetch transport and the streams it produces.
///
/// Typically built in code via [`FetchConfig::default`], or loaded from a RON file:
///
/// ```text
/// (
///     segment_size: 8192,
///     segment_count: 16,
///     pump_timeout_ms: 500,
///     interest: (allow_stale: true),
/// )
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Size of each segment of the buffering pipe, and of each chunk the background copier moves into it.
    pub segment_size: usize,
    /// Number of segments in the buffering pipe.
    pub segment_count: usize,
    /// Upper bound on a single iteration of the fetch library's processing loop.
    pub pump_timeout_ms: u64,
    pub interest: InterestOptions,
    /// Name given to the transport's worker thread.
    pub worker_name: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            segment_size: DEFAULT_SEGMENT_SIZE,
            segment_count: DEFAULT_SEGMENT_COUNT,
            pump_timeout_ms: DEFAULT_PUMP_TIMEOUT_MS,
            interest: InterestOptions::default(),
            worker_name: DEFAULT_WORKER_NAME.to_string(),
        }
    }
}

impl FetchConfig {
    pub fn pump_timeout(&self) -> Duration {
        Duration::from_millis(self.pump_timeout_ms)
    }

    /// The pipe capacity, in bytes.
    pub fn buffer_capacity(&self) -> usize {
        self.segment_size.saturating_mul(self.segment_count)
    }

    /// Resolves caller-supplied pipe geometry. A zero value selects the configured default for that parameter.
    pub fn resolve_segments(&self, segment_size: usize, segment_count: usize) -> (usize, usize) {
        let size = if segment_size == 0 { self.segment_size } else { segment_size };
        let count = if segment_count == 0 { self.segment_count } else { segment_count };
        (size, count)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.segment_size == 0 || self.segment_count == 0 {
            return Err(ConfigError::Invalid("segment size and segment count must both be non-zero".into()));
        }
        if self.pump_timeout_ms == 0 {
            return Err(ConfigError::Invalid("the pump timeout must be non-zero".into()));
        }
        Ok(())
    }

    /// Loads and validates a configuration from a RON file. Missing fields take their default values.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let val = fs::read_to_string(path)?;
        let config: FetchConfig = ron::de::from_str(&val)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let pretty = PrettyConfig::new().compact_arrays(true);
        let val = ron::ser::to_string_pretty(self, pretty)?;
        fs::write(path, val)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults() {
        let config = FetchConfig::default();
        assert_eq!(config.buffer_capacity(), 4096 * 24);
        assert_eq!(config.pump_timeout(), Duration::from_secs(1));
        assert_eq!(config.interest.max_buffers, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_geometry_selects_defaults() {
        let config = FetchConfig::default();
        assert_eq!(config.resolve_segments(0, 0), (4096, 24));
        assert_eq!(config.resolve_segments(512, 0), (512, 24));
        assert_eq!(config.resolve_segments(0, 2), (4096, 2));
    }

    #[test]
    fn invalid_geometry_is_rejected() {
        let config = FetchConfig { segment_count: 0, ..FetchConfig::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("ccnx.ron");
        let mut config = FetchConfig { segment_size: 1024, pump_timeout_ms: 250, ..FetchConfig::default() };
        config.interest.allow_stale = true;
        config.save(&path).expect("Failed to save config");
        let loaded = FetchConfig::load(&path).expect("Failed to load config");
        assert_eq!(loaded, config);
    }

    #[test]
    fn partial_files_fill_in_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("partial.ron");
        fs::write(&path, "(segment_count: 8, interest: (allow_stale: true))").unwrap();
        let loaded = FetchConfig::load(&path).expect("Failed to load config");
        assert_eq!(loaded.segment_count, 8);
        assert_eq!(loaded.segment_size, DEFAULT_SEGMENT_SIZE);
        assert!(loaded.interest.allow_stale);
        assert_eq!(loaded.interest.max_suffix_components, 1);
    }

    #[test]
    fn garbage_files_fail_to_parse() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("bad.ron");
        fs::write(&path, "segment_count = 8").unwrap();
        assert!(matches!(FetchConfig::load(&path), Err(ConfigError::Parse(_))));
    }
}
