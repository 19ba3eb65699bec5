//! Runs the build's prerequisite installer
//!
//! Skipped when the machine config already records every prerequisite id
//! of the build, unless the run is a repair.

use super::analytics::InstallerAnalytics;
use super::error::{codes, InstallError, InstallerError};
use super::machine_config::MachineConfig;
use super::progress::{BuildPatchProgress, BuildPatchState};
use crate::file_system::FileSystem;
use crate::manifest::BuildManifest;
use crate::paths::{join_manifest_path, to_native_path};
use crate::platform::Platform;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Placeholder in prerequisite paths and arguments for the install directory
pub const ROOT_DIRECTORY_VARIABLE: &str = "$[RootDirectory]";

pub struct PrerequisitesInstaller {
    manifest: Arc<BuildManifest>,
    install_directory: PathBuf,
    force: bool,
    fs: Arc<dyn FileSystem>,
    platform: Arc<dyn Platform>,
    machine_config: Arc<dyn MachineConfig>,
    error: Arc<InstallerError>,
    analytics: Arc<InstallerAnalytics>,
    progress: Arc<BuildPatchProgress>,
}

impl PrerequisitesInstaller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        manifest: Arc<BuildManifest>,
        install_directory: PathBuf,
        force: bool,
        fs: Arc<dyn FileSystem>,
        platform: Arc<dyn Platform>,
        machine_config: Arc<dyn MachineConfig>,
        error: Arc<InstallerError>,
        analytics: Arc<InstallerAnalytics>,
        progress: Arc<BuildPatchProgress>,
    ) -> Self {
        Self {
            manifest,
            install_directory,
            force,
            fs,
            platform,
            machine_config,
            error,
            analytics,
            progress,
        }
    }

    fn root_directory(&self) -> String {
        let mut root = self.install_directory.to_string_lossy().into_owned();
        if !root.ends_with(std::path::MAIN_SEPARATOR) {
            root.push(std::path::MAIN_SEPARATOR);
        }
        root
    }

    /// Executable path with the root directory substituted
    pub fn executable_path(&self) -> PathBuf {
        let raw = self.manifest.prereq_path();
        if raw.contains(ROOT_DIRECTORY_VARIABLE) {
            PathBuf::from(to_native_path(&raw.replace(ROOT_DIRECTORY_VARIABLE, &self.root_directory())))
        } else {
            join_manifest_path(&self.install_directory, raw)
        }
    }

    pub fn arguments(&self) -> String {
        self.manifest
            .prereq_args()
            .replace(ROOT_DIRECTORY_VARIABLE, &self.root_directory())
    }

    fn already_installed(&self) -> bool {
        let wanted: BTreeSet<String> = self.manifest.prereq_ids().iter().cloned().collect();
        if wanted.is_empty() {
            return false;
        }
        match self.machine_config.load_installed_prereq_ids() {
            Ok(installed) => wanted.is_subset(&installed),
            Err(e) => {
                warn!("Could not read installed prerequisites: {:#}", e);
                false
            }
        }
    }

    fn fail(&self, exe: &Path, reason: &str, code: &str, return_code: i32) {
        self.analytics.record_prereq_installation_error(
            self.manifest.app_name(),
            self.manifest.version_string(),
            &exe.to_string_lossy(),
            reason,
            return_code,
        );
        self.error.set_error_with_text(
            InstallError::PrerequisiteError,
            code,
            Some(format!("{}: {}", self.manifest.prereq_name(), reason)),
        );
    }

    /// Install prerequisites if the build has any. Returns false on failure.
    pub fn run(&self) -> bool {
        if self.manifest.prereq_path().is_empty() {
            return true;
        }
        if !self.force && self.already_installed() {
            info!("Prerequisites for {} already installed", self.manifest.app_name());
            self.progress.set_state_progress(BuildPatchState::PrerequisitesInstall, 1.0);
            return true;
        }

        let exe = self.executable_path();
        if !self.fs.file_exists(&exe) {
            warn!("Prerequisite installer {} not found", exe.display());
            self.fail(&exe, "Installer file missing", codes::PREREQ_MISSING_FILE, 0);
            return false;
        }

        info!("Running prerequisite installer {}", exe.display());
        match self.platform.exec_elevated_process(&exe, &self.arguments()) {
            Err(e) => {
                warn!("Could not start {}: {}", exe.display(), e);
                self.fail(
                    &exe,
                    "Failed to start installer",
                    codes::PREREQ_LAUNCH_FAILED,
                    e.raw_os_error().unwrap_or(0),
                );
                false
            }
            Ok(0) => {
                let ids: BTreeSet<String> = self.manifest.prereq_ids().iter().cloned().collect();
                if !ids.is_empty() {
                    if let Err(e) = self.machine_config.save_installed_prereq_ids(&ids) {
                        warn!("Could not record installed prerequisites: {:#}", e);
                    }
                }
                self.progress.set_state_progress(BuildPatchState::PrerequisitesInstall, 1.0);
                true
            }
            Ok(return_code) => {
                warn!("Prerequisite installer exited with {}", return_code);
                self.fail(
                    &exe,
                    "Installer returned an error",
                    &format!("{:08X}", return_code as u32),
                    return_code,
                );
                false
            }
        }
    }
}
