//! Installer configuration
//!
//! [`InstallerConfiguration`] is provided by the host for one install.
//! [`BuildPatchSettings`] holds the tunables, stored in
//! ~/.config/buildpatch/settings.json and clamped to sane ranges on use.

use super::eviction::RuntimeRequirementPriority;
use super::statistics::HealthThresholds;
use crate::manifest::BuildManifest;
use crate::paths::{INSTALL_STAGING_DIR, PATCH_DATA_DIR};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Staging folder used when the host does not choose one
pub const DEFAULT_STAGING_DIR_NAME: &str = ".buildpatch";

/// How thoroughly installed files are checked after construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VerifyMode {
    /// SHA1 every tagged file
    ShaVerifyAllFiles,
    /// SHA1 only the files this run constructed
    ShaVerifyTouchedFiles,
    /// Check sizes of every tagged file
    FileSizeCheckAllFiles,
    /// Check sizes of the files this run constructed
    #[default]
    FileSizeCheckTouchedFiles,
}

impl VerifyMode {
    pub fn uses_sha(self) -> bool {
        matches!(self, VerifyMode::ShaVerifyAllFiles | VerifyMode::ShaVerifyTouchedFiles)
    }

    pub fn touched_only(self) -> bool {
        matches!(self, VerifyMode::ShaVerifyTouchedFiles | VerifyMode::FileSizeCheckTouchedFiles)
    }
}

/// Tunables for the install pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildPatchSettings {
    /// Attempts at moving one staged file into place
    pub num_file_move_retries: u32,

    /// Whole-install attempts before giving up
    pub num_installer_retries: u32,

    /// Window used for the reported download speed, seconds
    pub download_speed_average_time: f32,

    /// Capacity of the store shared by the cloud and chunkdb sources.
    /// Defaults to the sum of their prefetch maximums.
    pub cloud_chunk_store_memory_size: Option<usize>,

    /// Capacity of the install source's store.
    /// Defaults to the install batch maximum.
    pub install_chunk_store_memory_size: Option<usize>,

    pub chunkdb_prefetch_minimum: usize,
    pub chunkdb_prefetch_maximum: usize,

    /// Seconds between attempts at reopening lost chunkdb files
    pub chunkdb_open_retry_time: f32,

    pub install_batch_fetch_minimum: usize,
    pub install_batch_fetch_maximum: usize,

    pub cloud_prefetch_minimum: usize,
    pub cloud_prefetch_maximum: usize,

    /// Concurrent chunk downloads
    pub num_simultaneous_downloads: usize,

    /// Retries per chunk before failing the install. Negative retries forever.
    pub max_retry_count: i32,

    /// Delay before each retry, seconds. The last entry repeats.
    pub retry_delay_times: Vec<f32>,

    pub health_thresholds: HealthThresholds,

    /// Seconds without data while every request is retrying before we call
    /// the connection lost
    pub disconnected_delay: f32,

    /// Lower bound for aborting a download suspected of a stalled TCP
    /// connection, seconds
    pub tcp_zero_window_minimum_seconds: f32,

    /// How chunks injected at runtime take part in eviction
    pub runtime_requirement_priority: RuntimeRequirementPriority,
}

impl Default for BuildPatchSettings {
    fn default() -> Self {
        Self {
            num_file_move_retries: 5,
            num_installer_retries: 5,
            download_speed_average_time: 10.0,
            cloud_chunk_store_memory_size: None,
            install_chunk_store_memory_size: None,
            chunkdb_prefetch_minimum: 10,
            chunkdb_prefetch_maximum: 300,
            chunkdb_open_retry_time: 5.0,
            install_batch_fetch_minimum: 10,
            install_batch_fetch_maximum: 300,
            cloud_prefetch_minimum: 10,
            cloud_prefetch_maximum: 300,
            num_simultaneous_downloads: 8,
            max_retry_count: 6,
            retry_delay_times: default_retry_delay_times(),
            health_thresholds: HealthThresholds::default(),
            disconnected_delay: 5.0,
            tcp_zero_window_minimum_seconds: 20.0,
            runtime_requirement_priority: RuntimeRequirementPriority::default(),
        }
    }
}

fn default_retry_delay_times() -> Vec<f32> {
    vec![0.5, 1.0, 1.0, 3.0, 3.0, 10.0, 10.0, 20.0, 20.0, 30.0]
}

impl BuildPatchSettings {
    /// Get the config directory path (~/.config/buildpatch)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("buildpatch");
        Ok(config_dir)
    }

    fn settings_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("settings.json"))
    }

    /// Load settings from the user config dir, or defaults if absent or broken
    pub fn load() -> Self {
        match Self::settings_path().and_then(|path| Self::load_from(&path)) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!("Could not load settings: {}. Using defaults.", e);
                Self::default()
            }
        }
    }

    /// Load settings from a specific file. A missing file gives defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        let settings: Self =
            serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))?;
        Ok(settings)
    }

    /// Save settings to the user config dir
    pub fn save(&self) -> Result<()> {
        let path = Self::settings_path()?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {:?}", parent))?;
        }
        let content = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(path, content).with_context(|| format!("Failed to write {:?}", path))?;
        Ok(())
    }

    /// Copy with every value forced into its supported range
    pub fn clamped(&self) -> Self {
        let mut s = self.clone();
        s.num_file_move_retries = s.num_file_move_retries.clamp(1, 50);
        s.num_installer_retries = s.num_installer_retries.clamp(1, 50);
        s.download_speed_average_time = clamp_f32(s.download_speed_average_time, 1.0, 30.0, 10.0);

        s.chunkdb_prefetch_minimum = s.chunkdb_prefetch_minimum.clamp(1, 1000);
        s.chunkdb_prefetch_maximum = s.chunkdb_prefetch_maximum.clamp(s.chunkdb_prefetch_minimum, 1000);
        s.chunkdb_open_retry_time = clamp_f32(s.chunkdb_open_retry_time, 0.5, 60.0, 5.0);

        s.install_batch_fetch_minimum = s.install_batch_fetch_minimum.clamp(1, 1000);
        s.install_batch_fetch_maximum = s
            .install_batch_fetch_maximum
            .clamp(s.install_batch_fetch_minimum, 1000);

        s.cloud_prefetch_minimum = s.cloud_prefetch_minimum.clamp(1, 1000);
        s.cloud_prefetch_maximum = s.cloud_prefetch_maximum.clamp(s.cloud_prefetch_minimum, 1000);

        s.num_simultaneous_downloads = s.num_simultaneous_downloads.clamp(1, 100);
        s.max_retry_count = s.max_retry_count.clamp(-1, 1000);

        // Any non-positive entry means the table was not understood
        if s.retry_delay_times.is_empty() || s.retry_delay_times.iter().any(|t| t.is_nan() || *t <= 0.0) {
            s.retry_delay_times = default_retry_delay_times();
        } else {
            for t in &mut s.retry_delay_times {
                *t = t.clamp(0.5, 300.0);
            }
        }

        s.disconnected_delay = clamp_f32(s.disconnected_delay, 1.0, 30.0, 5.0);
        s.tcp_zero_window_minimum_seconds = clamp_f32(s.tcp_zero_window_minimum_seconds, 1.0, 300.0, 20.0);
        s
    }

    /// Store capacity for the cloud and chunkdb sources
    pub fn cloud_store_size(&self) -> usize {
        self.cloud_chunk_store_memory_size
            .unwrap_or(self.cloud_prefetch_maximum + self.chunkdb_prefetch_maximum)
            .clamp(32, 2048)
    }

    /// Store capacity for the install source
    pub fn install_store_size(&self) -> usize {
        self.install_chunk_store_memory_size
            .unwrap_or(self.install_batch_fetch_maximum)
            .clamp(32, 2048)
    }

    pub fn retry_delay(&self, retry: usize) -> Duration {
        let idx = retry.min(self.retry_delay_times.len().saturating_sub(1));
        let secs = self.retry_delay_times.get(idx).copied().unwrap_or(0.5);
        Duration::from_secs_f32(secs)
    }

    pub fn download_speed_window(&self) -> Duration {
        Duration::from_secs_f32(self.download_speed_average_time)
    }
}

fn clamp_f32(value: f32, min: f32, max: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value.clamp(min, max)
    } else {
        fallback
    }
}

/// Everything the host tells the installer about one install
#[derive(Debug, Clone)]
pub struct InstallerConfiguration {
    /// Build currently installed, if any
    pub current_manifest: Option<Arc<BuildManifest>>,

    /// Build to install
    pub install_manifest: Arc<BuildManifest>,

    pub install_directory: PathBuf,

    /// Scratch area for chunk overflow and constructed files.
    /// Defaults to a hidden folder in the install directory.
    pub staging_directory: Option<PathBuf>,

    /// Where user-edited files go before being replaced
    pub backup_directory: Option<PathBuf>,

    /// HTTP(S) URLs or local directories holding ChunksV3
    pub cloud_directories: Vec<String>,

    pub chunk_database_files: Vec<PathBuf>,

    /// Tags selecting which files to install. Empty selects every tag.
    pub install_tags: BTreeSet<String>,

    pub verify_mode: VerifyMode,

    /// Verify everything and reinstall prerequisites
    pub is_repair: bool,

    /// Construct into staging only, leaving the install directory untouched
    pub stage_only: bool,

    /// Run the build's prerequisite installer when it names one
    pub run_required_prereqs: bool,

    /// Machine config file. Defaults to the user config dir.
    pub machine_config_path: Option<PathBuf>,

    pub settings: BuildPatchSettings,
}

impl InstallerConfiguration {
    pub fn new(install_manifest: Arc<BuildManifest>, install_directory: impl Into<PathBuf>) -> Self {
        Self {
            current_manifest: None,
            install_manifest,
            install_directory: install_directory.into(),
            staging_directory: None,
            backup_directory: None,
            cloud_directories: Vec::new(),
            chunk_database_files: Vec::new(),
            install_tags: BTreeSet::new(),
            verify_mode: VerifyMode::default(),
            is_repair: false,
            stage_only: false,
            run_required_prereqs: false,
            machine_config_path: None,
            settings: BuildPatchSettings::default(),
        }
    }

    pub fn staging_directory(&self) -> PathBuf {
        self.staging_directory
            .clone()
            .unwrap_or_else(|| self.install_directory.join(DEFAULT_STAGING_DIR_NAME))
    }

    /// Disk overflow chunk store location
    pub fn data_staging_directory(&self) -> PathBuf {
        self.staging_directory().join(PATCH_DATA_DIR)
    }

    /// Where files are constructed before being moved into place
    pub fn install_staging_directory(&self) -> PathBuf {
        self.staging_directory().join(INSTALL_STAGING_DIR)
    }

    /// Tags actually used: every manifest tag when none were given, and
    /// always the empty tag
    pub fn resolved_install_tags(&self) -> BTreeSet<String> {
        let mut tags = if self.install_tags.is_empty() {
            self.install_manifest.file_tag_list()
        } else {
            self.install_tags.clone()
        };
        tags.insert(String::new());
        tags
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.install_directory.as_os_str().is_empty() {
            return Err(ConfigError::MissingInstallDirectory);
        }

        let known = self.install_manifest.file_tag_list();
        let unknown: Vec<String> = self
            .install_tags
            .iter()
            .filter(|t| !t.is_empty() && !known.contains(*t))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(ConfigError::InvalidInstallTags(unknown));
        }

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Install directory is required")]
    MissingInstallDirectory,

    #[error("Install tags not present in the build: {0:?}")]
    InvalidInstallTags(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestData;
    use tempfile::TempDir;

    fn manifest() -> Arc<BuildManifest> {
        Arc::new(BuildManifest::new(ManifestData::default()).unwrap())
    }

    #[test]
    fn test_clamping() {
        let settings = BuildPatchSettings {
            num_file_move_retries: 0,
            num_installer_retries: 500,
            cloud_prefetch_minimum: 50,
            cloud_prefetch_maximum: 10,
            max_retry_count: -20,
            retry_delay_times: vec![0.1, 1000.0],
            download_speed_average_time: f32::NAN,
            ..Default::default()
        }
        .clamped();

        assert_eq!(settings.num_file_move_retries, 1);
        assert_eq!(settings.num_installer_retries, 50);
        assert_eq!(settings.cloud_prefetch_maximum, 50);
        assert_eq!(settings.max_retry_count, -1);
        assert_eq!(settings.retry_delay_times, vec![0.5, 300.0]);
        assert_eq!(settings.download_speed_average_time, 10.0);
    }

    #[test]
    fn test_bad_retry_table_falls_back() {
        let settings = BuildPatchSettings {
            retry_delay_times: vec![1.0, 0.0],
            ..Default::default()
        }
        .clamped();
        assert_eq!(settings.retry_delay_times, default_retry_delay_times());
        assert_eq!(settings.retry_delay(0), Duration::from_secs_f32(0.5));
        assert_eq!(settings.retry_delay(100), Duration::from_secs_f32(30.0));
    }

    #[test]
    fn test_store_sizes() {
        let settings = BuildPatchSettings::default();
        assert_eq!(settings.cloud_store_size(), 600);
        assert_eq!(settings.install_store_size(), 300);

        let small = BuildPatchSettings {
            install_chunk_store_memory_size: Some(1),
            ..Default::default()
        };
        assert_eq!(small.install_store_size(), 32);
    }

    #[test]
    fn test_settings_file_round_trip() -> Result<()> {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("settings.json");
        assert_eq!(BuildPatchSettings::load_from(&path)?, BuildPatchSettings::default());

        let settings = BuildPatchSettings {
            num_simultaneous_downloads: 3,
            ..Default::default()
        };
        settings.save_to(&path)?;
        assert_eq!(BuildPatchSettings::load_from(&path)?.num_simultaneous_downloads, 3);

        // Partial files keep defaults for what they leave out
        std::fs::write(&path, r#"{ "max_retry_count": 2 }"#)?;
        let partial = BuildPatchSettings::load_from(&path)?;
        assert_eq!(partial.max_retry_count, 2);
        assert_eq!(partial.num_installer_retries, 5);
        Ok(())
    }

    #[test]
    fn test_validate() {
        let mut config = InstallerConfiguration::new(manifest(), "/games/app");
        assert!(config.validate().is_ok());

        config.install_tags.insert(String::new());
        assert!(config.validate().is_ok());

        config.install_tags.insert("missing".into());
        assert!(matches!(config.validate(), Err(ConfigError::InvalidInstallTags(_))));
    }

    #[test]
    fn test_directories() {
        let config = InstallerConfiguration::new(manifest(), "/games/app");
        assert_eq!(config.staging_directory(), PathBuf::from("/games/app/.buildpatch"));
        assert_eq!(
            config.install_staging_directory(),
            PathBuf::from("/games/app/.buildpatch/Install")
        );
        assert!(config.resolved_install_tags().contains(""));
    }
}
