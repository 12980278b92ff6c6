//! Transfer settings, stored as a JSON file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::consumer::OvershootPolicy;
use crate::{DEFAULT_CHUNK_SIZE, TransferError};

const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransferConfig {
    /// Upper bound on chunk payload size; 0 means [`DEFAULT_CHUNK_SIZE`].
    pub chunk_size: usize,

    /// How consumers treat bytes beyond an asset's declared size.
    pub overshoot: OvershootPolicy,

    /// Period of progress notifications, in milliseconds; 0 means 500.
    pub progress_interval_ms: u64,

    /// Re-hash each completed partial file against its content key.
    pub verify_on_complete: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overshoot: OvershootPolicy::Tolerate,
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
            verify_on_complete: false,
        }
    }
}

impl TransferConfig {
    /// Loads settings from `path`, falling back to defaults when the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self, TransferError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no transfer config, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content)
            .map_err(|e| TransferError::Config(format!("{}: {e}", path.display())))
    }

    /// Writes settings to `path` as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), TransferError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| TransferError::Config(e.to_string()))?;
        std::fs::write(path, json)?;
        tracing::debug!(path = %path.display(), "transfer config saved");
        Ok(())
    }

    pub fn chunk_size(&self) -> usize {
        if self.chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            self.chunk_size
        }
    }

    /// Reporting period for [`ProgressTracker::from_config`](crate::ProgressTracker::from_config).
    pub fn progress_interval(&self) -> Duration {
        match self.progress_interval_ms {
            0 => Duration::from_millis(DEFAULT_PROGRESS_INTERVAL_MS),
            ms => Duration::from_millis(ms),
        }
    }
}
