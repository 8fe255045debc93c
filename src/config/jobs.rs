//! Cron job settings loaded from TOML.
//!
//! ```toml
//! [[job]]
//! name = "nightly-cleanup"
//! schedule = "0 0 2 * * *"
//! ```

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;

/// Top-level TOML wrapper.
#[derive(Debug, Default, Deserialize)]
pub struct JobsFile {
    #[serde(default, rename = "job")]
    pub jobs: Vec<JobSettings>,
}

/// One scheduled job as configured.
#[derive(Debug, Clone, Deserialize)]
pub struct JobSettings {
    pub name: String,
    /// Cron expression with a leading seconds field.
    pub schedule: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl JobsFile {
    /// Load job settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read jobs file {}: {e}", path.display()))
        })?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("bad jobs file {}: {e}", path.display())))
    }

    /// Parse job settings from TOML text.
    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Jobs with `enabled = true`.
    pub fn enabled(&self) -> impl Iterator<Item = &JobSettings> {
        self.jobs.iter().filter(|job| job.enabled)
    }
}
