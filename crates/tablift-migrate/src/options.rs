//! Migration run options

use std::time::Duration;

use serde::{Deserialize, Deserializer};
use tokio_util::sync::CancellationToken;

use crate::coerce::NullMarkers;

/// Configuration options for a migration run.
///
/// Deserializes from the `[migrate]` table of the configuration file; any
/// missing key keeps its default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MigrateOptions {
    /// Maximum number of files loaded concurrently
    pub max_parallel_loads: usize,
    /// Upper bound for each phase (`phase_timeout_secs`, 0 = no timeout)
    #[serde(
        rename = "phase_timeout_secs",
        deserialize_with = "deserialize_timeout_secs"
    )]
    pub phase_timeout: Option<Duration>,
    /// Row errors kept per file before they are summarized
    pub max_row_errors: usize,
    /// Cell texts loaded as NULL
    pub null_markers: NullMarkers,
    /// Aborts the current phase when cancelled
    #[serde(skip)]
    pub cancellation: Option<CancellationToken>,
}

impl MigrateOptions {
    /// Create new migrate options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum number of concurrent file loads
    pub fn with_max_parallel_loads(mut self, max: usize) -> Self {
        self.max_parallel_loads = max.max(1);
        self
    }

    /// Bound every phase by `timeout`
    pub fn with_phase_timeout(mut self, timeout: Duration) -> Self {
        self.phase_timeout = Some(timeout);
        self
    }

    /// Replace the null marker set
    pub fn with_null_markers(mut self, markers: NullMarkers) -> Self {
        self.null_markers = markers;
        self
    }

    /// Set how many row errors are kept per file
    pub fn with_max_row_errors(mut self, max: usize) -> Self {
        self.max_row_errors = max;
        self
    }

    /// Attach a cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

impl Default for MigrateOptions {
    fn default() -> Self {
        Self {
            max_parallel_loads: 4,
            phase_timeout: None,
            max_row_errors: 100,
            null_markers: NullMarkers::default(),
            cancellation: None,
        }
    }
}

fn deserialize_timeout_secs<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = u64::deserialize(deserializer)?;
    Ok((secs > 0).then(|| Duration::from_secs(secs)))
}
