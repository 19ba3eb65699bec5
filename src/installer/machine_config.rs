//! Per-machine record of installed prerequisites

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Persisted machine state read and written by the prerequisites step
pub trait MachineConfig: Send + Sync {
    fn load_installed_prereq_ids(&self) -> Result<BTreeSet<String>>;

    /// Add ids to the installed set
    fn save_installed_prereq_ids(&self, ids: &BTreeSet<String>) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MachineConfigFile {
    #[serde(default)]
    installed_prereq_ids: BTreeSet<String>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

/// [`MachineConfig`] stored as JSON
#[derive(Debug, Clone)]
pub struct JsonMachineConfig {
    path: PathBuf,
}

impl JsonMachineConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// ~/.config/buildpatch/machine_config.json
    pub fn default_path() -> Result<PathBuf> {
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("buildpatch")
            .join("machine_config.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<MachineConfigFile> {
        if !self.path.exists() {
            return Ok(MachineConfigFile::default());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {:?}", self.path))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", self.path))
    }
}

impl MachineConfig for JsonMachineConfig {
    fn load_installed_prereq_ids(&self) -> Result<BTreeSet<String>> {
        Ok(self.read()?.installed_prereq_ids)
    }

    fn save_installed_prereq_ids(&self, ids: &BTreeSet<String>) -> Result<()> {
        let mut file = self.read()?;
        file.installed_prereq_ids.extend(ids.iter().cloned());
        file.updated_at = Some(Utc::now());

        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;

        // Write beside the target and rename so a crash never leaves half a file
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in {:?}", dir))?;
        let content = serde_json::to_string_pretty(&file).context("Failed to serialize machine config")?;
        tmp.write_all(content.as_bytes())?;
        tmp.persist(&self.path)
            .with_context(|| format!("Failed to write {:?}", self.path))?;

        debug!("Recorded prerequisites {:?} in {:?}", ids, self.path);
        Ok(())
    }
}
