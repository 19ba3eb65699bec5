//! Build installer
//!
//! [`BuildPatchInstaller`] drives one install, patch or repair on its own
//! thread. Each attempt plans the files to construct, runs the chunk sources
//! next to the file constructor, moves staged files into the install
//! directory, applies attributes and verifies the result. Retryable failures
//! and verification failures start another attempt, limited to the files
//! that turned out corrupt.

pub mod analytics;
pub mod attribution;
pub mod build_stats;
pub mod config;
pub mod constructor;
pub mod control;
pub mod disk_store;
pub mod error;
pub mod eviction;
pub mod machine_config;
pub mod memory_store;
pub mod message_pump;
pub mod prerequisites;
pub mod progress;
pub mod reference_tracker;
pub mod sources;
pub mod statistics;
pub mod verifier;

pub use analytics::{AnalyticsProvider, InstallerAnalytics, TracingAnalytics};
pub use build_stats::BuildInstallStats;
pub use config::{BuildPatchSettings, ConfigError, InstallerConfiguration, VerifyMode};
pub use error::{InstallError, InstallerError};
pub use message_pump::{ChunkSourceEvent, ChunkSourceEventType, MessageHandler, MessagePump};
pub use progress::{BuildPatchProgress, BuildPatchState};
pub use statistics::{DownloadHealth, InstallerStatistics};

use anyhow::{bail, Context, Result};
use attribution::FileAttribution;
use build_stats::PhaseTimer;
use constructor::{ConstructionPlan, ConstructionResult, FileConstructor};
use control::{ControlRegistry, Controllable, ScopedControllable};
use disk_store::DiskChunkStore;
use error::codes;
use eviction::EvictionPolicy;
use machine_config::{JsonMachineConfig, MachineConfig};
use memory_store::MemoryChunkStore;
use prerequisites::PrerequisitesInstaller;
use reference_tracker::ChunkReferenceTracker;
use sources::{
    ChainedChunkSource, ChunkDbChunkSource, ChunkDbSourceConfig, ChunkSource, CloudChunkSource, CloudSourceConfig,
    InstallChunkSource, InstallSourceConfig, SourceContext,
};
use verifier::Verifier;

use crate::downloaders::{DownloadService, HttpDownloadService};
use crate::file_system::{DiskFileSystem, FileSystem};
use crate::hash::hash_reader;
use crate::manifest::{BuildManifest, ChunkId, FileManifest};
use crate::paths::{exceeds_max_path, join_manifest_path, MOVE_MARKER_FILE, RESUME_DATA_FILE};
use crate::platform::{Platform, SystemPlatform};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Delay between attempts to move a staged file into place
const MOVE_RETRY_DELAY: Duration = Duration::from_millis(500);

fn current_rss_kb() -> Option<u64> {
    let status = fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if line.starts_with("VmRSS:") {
            return line
                .split_whitespace()
                .nth(1)
                .and_then(|v| v.parse::<u64>().ok());
        }
    }
    None
}

fn log_phase_metrics(phase: &str, started: Instant) {
    let elapsed_ms = started.elapsed().as_millis();
    let rss_kb = current_rss_kb().unwrap_or(0);
    info!(
        "Phase done: phase='{}' elapsed_ms={} rss_kb={}",
        phase, elapsed_ms, rss_kb
    );
}

/// Host capabilities the installer works through
#[derive(Clone)]
pub struct InstallerServices {
    pub fs: Arc<dyn FileSystem>,
    pub platform: Arc<dyn Platform>,
    pub downloads: Arc<dyn DownloadService>,
    pub analytics: Arc<dyn AnalyticsProvider>,
    /// Defaults to a JSON file at the configured machine config path
    pub machine_config: Option<Arc<dyn MachineConfig>>,
}

impl InstallerServices {
    /// Local disk, real processes and HTTP downloads
    pub fn system() -> Result<Self> {
        Ok(Self {
            fs: Arc::new(DiskFileSystem::new()),
            platform: Arc::new(SystemPlatform::new()),
            downloads: Arc::new(HttpDownloadService::new()?),
            analytics: Arc::new(TracingAnalytics),
            machine_config: None,
        })
    }
}

/// Called once with the outcome and the build that was installed
pub type CompleteCallback = Box<dyn FnOnce(bool, Arc<BuildManifest>) + Send>;

#[derive(Default)]
struct RunState {
    is_running: bool,
    is_inited: bool,
    success: bool,
    paused: bool,
    pause_started: Option<Instant>,
    paused_time: Duration,
}

#[derive(Default)]
struct PhaseTimers {
    initialize: PhaseTimer,
    construct: PhaseTimer,
    moving: PhaseTimer,
    attributes: PhaseTimer,
    verify: PhaseTimer,
    clean_up: PhaseTimer,
    prereq: PhaseTimer,
}

/// Working set of the installer thread, carried across attempts
struct RunData {
    tagged_files: BTreeSet<String>,
    files_to_construct: BTreeSet<String>,
    /// Files moved into the install directory by this run
    files_installed: HashSet<String>,
    first_iteration: bool,
    timers: PhaseTimers,
}

impl RunData {
    fn new() -> Self {
        Self {
            tagged_files: BTreeSet::new(),
            files_to_construct: BTreeSet::new(),
            files_installed: HashSet::new(),
            first_iteration: true,
            timers: PhaseTimers::default(),
        }
    }
}

struct Shared {
    config: InstallerConfiguration,
    install_tags: BTreeSet<String>,
    fs: Arc<dyn FileSystem>,
    platform: Arc<dyn Platform>,
    downloads: Arc<dyn DownloadService>,
    machine_config: Arc<dyn MachineConfig>,
    error: Arc<InstallerError>,
    progress: Arc<BuildPatchProgress>,
    stats: Arc<InstallerStatistics>,
    analytics: Arc<InstallerAnalytics>,
    pump: Arc<MessagePump>,
    controls: ControlRegistry,
    handlers: Mutex<Vec<Arc<dyn MessageHandler>>>,
    report: Mutex<BuildInstallStats>,
    state: Mutex<RunState>,
    /// Cancel or shutdown requested by the host. Survives error resets.
    stop_request: Mutex<Option<InstallError>>,
    complete: Mutex<Option<CompleteCallback>>,
}

/// Installs one build on a background thread
pub struct BuildPatchInstaller {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl BuildPatchInstaller {
    pub fn new(mut config: InstallerConfiguration, services: InstallerServices) -> Self {
        config.settings = config.settings.clamped();
        let install_tags = config.resolved_install_tags();
        let machine_config = services.machine_config.clone().unwrap_or_else(|| {
            let path = config
                .machine_config_path
                .clone()
                .or_else(|| JsonMachineConfig::default_path().ok())
                .unwrap_or_else(|| config.staging_directory().join("machine_config.json"));
            Arc::new(JsonMachineConfig::new(path))
        });

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let error = Arc::new(InstallerError::new());
            let weak = weak.clone();
            // Any latched error stops every running component
            error.register_for_errors(Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.controls.abort_all();
                }
            }));
            Shared {
                config,
                install_tags,
                fs: services.fs,
                platform: services.platform,
                downloads: services.downloads,
                machine_config,
                error,
                progress: Arc::new(BuildPatchProgress::new()),
                stats: Arc::new(InstallerStatistics::new()),
                analytics: Arc::new(InstallerAnalytics::new(services.analytics)),
                pump: Arc::new(MessagePump::new()),
                controls: ControlRegistry::new(),
                handlers: Mutex::new(Vec::new()),
                report: Mutex::new(BuildInstallStats::default()),
                state: Mutex::new(RunState::default()),
                stop_request: Mutex::new(None),
                complete: Mutex::new(None),
            }
        });

        Self {
            shared,
            thread: Mutex::new(None),
        }
    }

    /// Set the callback run when the installer finishes
    pub fn on_complete(self, callback: impl FnOnce(bool, Arc<BuildManifest>) + Send + 'static) -> Self {
        *self.shared.complete.lock().unwrap() = Some(Box::new(callback));
        self
    }

    /// Start the installer thread
    pub fn start(&self) -> Result<()> {
        let mut thread = self.thread.lock().unwrap();
        if thread.is_some() {
            bail!("Installer already started");
        }
        self.shared.state.lock().unwrap().is_running = true;
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("buildpatch-installer".into())
            .spawn(move || shared.run())
            .context("Failed to spawn installer thread")?;
        *thread = Some(handle);
        Ok(())
    }

    /// Block until the installer thread has finished. Returns the outcome.
    pub fn wait(&self) -> bool {
        if let Some(handle) = self.thread.lock().unwrap().take() {
            if handle.join().is_err() {
                error!("Installer thread panicked");
            }
        }
        self.shared.state.lock().unwrap().success
    }

    pub fn is_complete(&self) -> bool {
        let state = self.shared.state.lock().unwrap();
        !state.is_running && state.is_inited
    }

    pub fn is_canceled(&self) -> bool {
        self.shared.error.error_type() == InstallError::UserCanceled
    }

    pub fn is_paused(&self) -> bool {
        self.shared.state.lock().unwrap().paused
    }

    /// Whether running again could continue from what this run staged
    pub fn is_resumable(&self) -> bool {
        if self.shared.error.error_type() == InstallError::PathLengthExceeded {
            return false;
        }
        !self.shared.state.lock().unwrap().success
    }

    /// Failed for a reason other than the user cancelling
    pub fn has_error(&self) -> bool {
        if self.shared.error.error_type() == InstallError::UserCanceled {
            return false;
        }
        !self.shared.state.lock().unwrap().success
    }

    pub fn error_type(&self) -> InstallError {
        self.shared.error.error_type()
    }

    pub fn error_code(&self) -> String {
        self.shared.error.error_code()
    }

    pub fn error_text(&self) -> String {
        self.shared.error.error_text()
    }

    pub fn state(&self) -> BuildPatchState {
        self.shared.progress.state()
    }

    pub fn status_text(&self) -> String {
        self.shared.progress.state().to_string()
    }

    /// Overall progress in 0..1, or negative while the state is indeterminate
    pub fn update_progress(&self) -> f32 {
        self.shared.progress.progress()
    }

    pub fn progress_no_marquee(&self) -> f32 {
        self.shared.progress.progress_no_marquee()
    }

    pub fn build_statistics(&self) -> BuildInstallStats {
        self.shared.report.lock().unwrap().clone()
    }

    pub fn download_health(&self) -> DownloadHealth {
        self.shared.stats.download_health()
    }

    /// Bytes per second over the configured averaging window
    pub fn download_speed(&self) -> f64 {
        self.shared
            .stats
            .download_speed(self.shared.config.settings.download_speed_window())
    }

    pub fn initial_download_size(&self) -> u64 {
        self.shared.stats.required_download_size()
    }

    pub fn total_downloaded(&self) -> u64 {
        self.shared.stats.bytes_downloaded()
    }

    /// Stop the install. Nothing is retried afterwards.
    pub fn cancel_install(&self) {
        self.shared.request_stop(InstallError::UserCanceled, codes::USER_REQUESTED);
    }

    /// Pause or resume. Cannot pause once an error has been raised.
    /// Returns whether the installer is now paused.
    pub fn toggle_pause_install(&self) -> bool {
        self.shared.toggle_pause()
    }

    pub fn register_message_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.shared.handlers.lock().unwrap().push(handler);
    }

    pub fn unregister_message_handler(&self, handler: &Arc<dyn MessageHandler>) {
        let target = Arc::as_ptr(handler) as *const ();
        self.shared
            .handlers
            .lock()
            .unwrap()
            .retain(|h| Arc::as_ptr(h) as *const () != target);
    }

    /// Deliver queued events to the registered handlers. Call from the host's tick.
    pub fn pump_messages(&self) -> usize {
        let handlers = self.shared.handlers.lock().unwrap().clone();
        self.shared.pump.pump(&handlers)
    }

    /// Stop as the application shuts down and wait for the thread to exit
    pub fn pre_exit(&self) {
        self.shared
            .request_stop(InstallError::ApplicationClosing, codes::APPLICATION_CLOSED);
        self.wait();
    }
}

impl Drop for BuildPatchInstaller {
    fn drop(&mut self) {
        if self.thread.lock().unwrap().is_none() {
            return;
        }
        if self.shared.state.lock().unwrap().is_running {
            self.pre_exit();
        } else {
            self.wait();
        }
    }
}

impl Shared {
    fn manifest(&self) -> &Arc<BuildManifest> {
        &self.config.install_manifest
    }

    fn is_stop_requested(&self) -> bool {
        self.stop_request.lock().unwrap().is_some()
    }

    fn request_stop(&self, kind: InstallError, code: &str) {
        *self.stop_request.lock().unwrap() = Some(kind);
        self.error.set_error(kind, code);
        if self.state.lock().unwrap().paused {
            self.toggle_pause();
        }
        self.controls.abort_all();
    }

    fn toggle_pause(&self) -> bool {
        let paused = {
            let mut state = self.state.lock().unwrap();
            let should_pause = !state.paused && !self.error.has_error();
            if should_pause == state.paused {
                return state.paused;
            }
            state.paused = should_pause;
            if should_pause {
                state.pause_started = Some(Instant::now());
            } else if let Some(started) = state.pause_started.take() {
                state.paused_time += started.elapsed();
            }
            should_pause
        };
        info!("Installer {}", if paused { "paused" } else { "resumed" });
        self.controls.set_paused(paused);
        Controllable::set_paused(self.progress.as_ref(), paused);
        paused
    }

    fn run(self: &Arc<Self>) {
        let started = Instant::now();
        let manifest = self.manifest().clone();
        info!(
            "Installing {} {} into {}",
            manifest.app_name(),
            manifest.version_string(),
            self.config.install_directory.display()
        );

        let mut data = RunData::new();
        data.timers.initialize.start();
        let mut success = self.initialize();
        self.state.lock().unwrap().is_inited = true;

        if success {
            success = self.install_with_retries(&mut data);
        }
        data.timers.initialize.stop();

        let install_prereqs = self.config.run_required_prereqs && !manifest.prereq_path().is_empty();
        if success && install_prereqs {
            let prereq_start = Instant::now();
            data.timers.prereq.start();
            success = self.run_prerequisites();
            data.timers.prereq.stop();
            log_phase_metrics("Prerequisites", prereq_start);
        }
        if success {
            self.progress.set_state_progress(BuildPatchState::PrerequisitesInstall, 1.0);
            self.progress.set_state_progress(BuildPatchState::Completed, 1.0);
        }

        self.finish_report(&data, started, success);
        {
            let mut state = self.state.lock().unwrap();
            state.success = success;
            state.is_running = false;
        }
        if success {
            info!("Installation of {} {} complete", manifest.app_name(), manifest.version_string());
        } else {
            warn!(
                "Installation failed: {} ({}) {}",
                self.error.error_type(),
                self.error.error_code(),
                self.error.error_text()
            );
        }

        if let Some(callback) = self.complete.lock().unwrap().take() {
            callback(success, manifest);
        }
    }

    fn initialize(&self) -> bool {
        let manifest = self.manifest();
        {
            let mut report = self.report.lock().unwrap();
            report.app_name = manifest.app_name().to_string();
            report.app_patch_version = manifest.version_string().to_string();
            report.app_installed_version = self
                .config
                .current_manifest
                .as_ref()
                .map(|m| m.version_string().to_string())
                .unwrap_or_default();
            report.cloud_directory = self.config.cloud_directories.first().cloned().unwrap_or_default();
            report.num_files_in_build = manifest.num_files();
        }

        if let Err(e) = self.config.validate() {
            let code = match e {
                ConfigError::MissingInstallDirectory => codes::INIT_MISSING_INSTALL_DIRECTORY,
                ConfigError::InvalidInstallTags(_) => codes::INIT_INVALID_INSTALL_TAGS,
            };
            self.error
                .set_error_with_text(InstallError::InitializationError, code, Some(e.to_string()));
            return false;
        }
        if self.complete.lock().unwrap().is_none() {
            self.error
                .set_error(InstallError::InitializationError, codes::INIT_MISSING_COMPLETE_CALLBACK);
            return false;
        }
        if let Err(e) = self.fs.make_dirs(&self.config.install_directory) {
            self.error.set_error_with_text(
                InstallError::InitializationError,
                codes::INIT_MISSING_INSTALL_DIRECTORY,
                Some(format!("Could not create {}: {}", self.config.install_directory.display(), e)),
            );
            return false;
        }
        let staging = self.config.staging_directory();
        if let Err(e) = self.fs.make_dirs(&staging) {
            self.error.set_error_with_text(
                InstallError::InitializationError,
                codes::INIT_MISSING_STAGE_DIRECTORY,
                Some(format!("Could not create {}: {}", staging.display(), e)),
            );
            return false;
        }
        true
    }

    fn install_with_retries(&self, data: &mut RunData) -> bool {
        let settings = &self.config.settings;
        let mut corrupt_files: Vec<String> = Vec::new();
        let mut retries_left = settings.num_installer_retries;
        let mut attempts = 0u32;
        let mut success = false;
        let mut can_retry = true;

        while !success && can_retry {
            attempts += 1;
            self.progress.set_state_progress(BuildPatchState::Queued, 1.0);
            let mut install_ok = self.run_installation(data, &corrupt_files);
            data.timers.initialize.stop();

            let has_prereqs = self.config.run_required_prereqs && !self.manifest().prereq_path().is_empty();
            self.progress.set_state_progress(
                BuildPatchState::PrerequisitesInstall,
                if has_prereqs { 0.0 } else { 1.0 },
            );
            if install_ok {
                self.progress.set_state_progress(BuildPatchState::Downloading, 1.0);
                self.progress.set_state_progress(BuildPatchState::Installing, 1.0);
            }

            install_ok = install_ok && self.run_backup_and_move(data);
            self.progress.set_state_progress(BuildPatchState::Initializing, 1.0);
            install_ok = install_ok && self.run_file_attributes(data, self.config.is_repair);

            corrupt_files.clear();
            success = install_ok && self.run_verification(data, &mut corrupt_files);

            let cleanup_start = Instant::now();
            data.timers.clean_up.start();
            self.progress.set_state_progress(BuildPatchState::CleanUp, 0.0);
            if install_ok {
                self.clean_up_staging();
            }
            self.progress.set_state_progress(BuildPatchState::CleanUp, 1.0);
            data.timers.clean_up.stop();
            log_phase_metrics("Cleanup", cleanup_start);

            retries_left = retries_left.saturating_sub(1);
            can_retry = retries_left > 0
                && !self.error.is_cancelled()
                && self.error.can_retry()
                && !self.is_stop_requested();
            if success || can_retry {
                let marker = self.config.install_directory.join(MOVE_MARKER_FILE);
                if let Err(e) = self.fs.delete_file(&marker) {
                    warn!("Could not delete {}: {}", marker.display(), e);
                }
            }
            data.first_iteration = false;

            let mut report = self.report.lock().unwrap();
            report.num_install_retries = attempts - 1;
            report.final_progress = self.progress.progress_no_marquee();
            if !success && can_retry {
                let kind = self.error.error_type();
                let code = self.error.error_code();
                warn!("Install attempt failed with {} ({}), retrying", kind, code);
                report.retry_failure_types.push(kind);
                report.retry_error_codes.push(code);
                self.controls.reset_abort();
            }
        }
        success
    }

    fn check_for_externally_installed_files(&self) -> bool {
        let install_dir = &self.config.install_directory;
        if self.fs.file_exists(&install_dir.join(MOVE_MARKER_FILE)) {
            return true;
        }
        if self.config.current_manifest.is_some() {
            return false;
        }
        let manifest = self.manifest();
        manifest.build_file_list().iter().any(|filename| {
            self.fs.file_size(&join_manifest_path(install_dir, filename)) == Some(manifest.file_size(filename))
        })
    }

    fn run_installation(&self, data: &mut RunData, corrupt_files: &[String]) -> bool {
        info!("Starting installation pass");
        let manifest = self.manifest().clone();
        let settings = &self.config.settings;
        let data_staging = self.config.data_staging_directory();
        let install_staging = self.config.install_staging_directory();
        for dir in [&data_staging, &install_staging] {
            if let Err(e) = self.fs.make_dirs(dir) {
                warn!("Could not create {}: {}", dir.display(), e);
            }
        }

        self.error.reset();
        if let Some(kind) = *self.stop_request.lock().unwrap() {
            self.error.set_error(kind, "01");
        }
        self.progress.reset();
        self.progress.set_state_progress(BuildPatchState::Queued, 1.0);
        self.progress.set_state_progress(BuildPatchState::Initializing, 0.01);
        self.progress.set_state_progress(BuildPatchState::CleanUp, 0.0);

        data.tagged_files = manifest.tagged_file_list(&self.install_tags);

        if corrupt_files.is_empty() && self.check_for_externally_installed_files() {
            info!("Build files already present, skipping to verification");
            self.progress.set_state_weight(BuildPatchState::Downloading, 0.0);
            self.progress.set_state_weight(BuildPatchState::Installing, 0.0);
            self.progress.set_state_weight(BuildPatchState::MovingToInstall, 0.0);
            self.progress.set_state_weight(BuildPatchState::SettingAttributes, 0.2);
            self.progress.set_state_weight(BuildPatchState::BuildVerification, 1.0);
            for state in [
                BuildPatchState::Initializing,
                BuildPatchState::Resuming,
                BuildPatchState::Downloading,
                BuildPatchState::Installing,
                BuildPatchState::MovingToInstall,
            ] {
                self.progress.set_state_progress(state, 1.0);
            }
            return true;
        }

        data.files_to_construct = if corrupt_files.is_empty() {
            let outdated = manifest.outdated_files(
                self.config.current_manifest.as_deref(),
                &self.config.install_directory,
                self.fs.as_ref(),
            );
            outdated.intersection(&data.tagged_files).cloned().collect()
        } else {
            corrupt_files.iter().cloned().collect()
        };
        info!(
            "{} of {} files need constructing",
            data.files_to_construct.len(),
            manifest.num_files()
        );
        {
            let mut report = self.report.lock().unwrap();
            report.num_files_outdated = data.files_to_construct.len();
        }

        if let Some(long) = data
            .files_to_construct
            .iter()
            .find(|f| exceeds_max_path(&install_staging, f))
        {
            self.error.set_error_with_text(
                InstallError::PathLengthExceeded,
                codes::PATH_LENGTH_STAGING_DIRECTORY,
                Some(format!("Path too long: {}", join_manifest_path(&install_staging, long).display())),
            );
            return false;
        }

        let trust_staged = self.check_resume_data(&install_staging);
        let plan = ConstructionPlan::new(
            &manifest,
            self.fs.as_ref(),
            &install_staging,
            &data.files_to_construct,
            trust_staged,
        );
        let tracker = Arc::new(ChunkReferenceTracker::from_references(plan.references(&manifest)));
        let referenced = tracker.referenced_chunks();

        let overflow = Arc::new(DiskChunkStore::new(self.fs.clone(), &data_staging, self.stats.clone()));
        let store = |size: usize| {
            Arc::new(MemoryChunkStore::new(
                size,
                EvictionPolicy::new(tracker.clone(), settings.runtime_requirement_priority),
                Some(overflow.clone()),
                self.stats.clone(),
            ))
        };
        let context = |store: Arc<MemoryChunkStore>| SourceContext {
            tracker: tracker.clone(),
            store,
            error: self.error.clone(),
            stats: self.stats.clone(),
            analytics: self.analytics.clone(),
        };
        let install_context = context(store(settings.install_store_size()));
        let cloud_context = context(store(settings.cloud_store_size()));

        let chunkdb = Arc::new(ChunkDbChunkSource::new(
            ChunkDbSourceConfig {
                chunk_database_files: self.config.chunk_database_files.clone(),
                prefetch_minimum: settings.chunkdb_prefetch_minimum,
                prefetch_maximum: settings.chunkdb_prefetch_maximum,
                open_retry_time: Duration::from_secs_f32(settings.chunkdb_open_retry_time),
            },
            self.fs.clone(),
            self.platform.clone(),
            self.pump.clone(),
            cloud_context.clone(),
        ));
        let chunkdb_available = chunkdb.available_chunks();

        let install = self.config.current_manifest.as_ref().map(|current| {
            Arc::new(InstallChunkSource::new(
                InstallSourceConfig {
                    install_directory: self.config.install_directory.clone(),
                    batch_fetch_minimum: settings.install_batch_fetch_minimum,
                    batch_fetch_maximum: settings.install_batch_fetch_maximum,
                },
                self.fs.clone(),
                current,
                manifest.clone(),
                &chunkdb_available,
                install_context,
            ))
        });
        let install_available = install.as_ref().map(|s| s.available_chunks()).unwrap_or_default();

        let initial: HashSet<ChunkId> = referenced
            .iter()
            .filter(|id| !install_available.contains(id) && !chunkdb_available.contains(id))
            .copied()
            .collect();
        let cloud = Arc::new(CloudChunkSource::new(
            CloudSourceConfig::new(self.config.cloud_directories.clone(), settings),
            manifest.clone(),
            self.downloads.clone(),
            self.progress.clone(),
            initial.clone(),
            cloud_context,
        ));

        // Chunks the local sources lose fall through to the cloud
        let mut chain: Vec<Arc<dyn ChunkSource>> = vec![chunkdb.clone()];
        if let Some(install) = &install {
            chain.push(install.clone());
        }
        chain.push(cloud.clone());
        let chain = Arc::new(ChainedChunkSource::new(chain, self.error.clone()));

        let constructor = Arc::new(FileConstructor::new(
            install_staging.clone(),
            manifest.clone(),
            self.fs.clone(),
            chain,
            tracker.clone(),
            self.error.clone(),
            self.stats.clone(),
            self.analytics.clone(),
            self.progress.clone(),
        ));

        let _chunkdb_control = ScopedControllable::new(&self.controls, chunkdb.clone());
        let _install_control = install
            .as_ref()
            .map(|s| ScopedControllable::new(&self.controls, s.clone()));
        let _cloud_control = ScopedControllable::new(&self.controls, cloud.clone());
        let _constructor_control = ScopedControllable::new(&self.controls, constructor.clone());

        {
            let mut report = self.report.lock().unwrap();
            report.num_chunks_required = referenced.len();
            report.chunks_queued_for_download = initial.len();
            report.chunks_locally_available = tracker.count_referenced(&install_available);
            report.chunks_in_chunk_dbs = tracker.count_referenced(&chunkdb_available);
        }
        info!(
            "Chunks: {} required, {} to download, {} recyclable, {} in chunkdbs",
            referenced.len(),
            initial.len(),
            install_available.len(),
            chunkdb_available.len()
        );

        let has_files = !data.files_to_construct.is_empty();
        self.progress.set_state_weight(BuildPatchState::Downloading, 0.0);
        self.progress
            .set_state_weight(BuildPatchState::Installing, if has_files { 1.0 } else { 0.0 });
        self.progress
            .set_state_weight(BuildPatchState::MovingToInstall, if has_files { 0.05 } else { 0.0 });
        let attributes_weight = match (manifest.has_file_attributes(), self.config.is_repair) {
            (false, _) => 0.0,
            (true, true) => 1.0 / 50.0,
            (true, false) => 1.0 / 20.0,
        };
        self.progress
            .set_state_weight(BuildPatchState::SettingAttributes, attributes_weight);
        let verify_weight = if self.config.verify_mode.uses_sha() { 1.1 / 9.0 } else { 0.3 / 9.0 };
        self.progress
            .set_state_weight(BuildPatchState::BuildVerification, verify_weight);
        if self.config.is_repair {
            self.progress.set_state_progress(BuildPatchState::Downloading, 1.0);
            self.progress.set_state_progress(BuildPatchState::Installing, 1.0);
            self.progress.set_state_progress(BuildPatchState::MovingToInstall, 1.0);
        }
        self.progress
            .set_state_progress(BuildPatchState::Initializing, if has_files { 1.0 } else { 0.0 });
        self.progress.set_state_progress(BuildPatchState::Resuming, 1.0);
        data.timers.initialize.stop();

        self.write_resume_data(&install_staging);

        let construct_start = Instant::now();
        data.timers.construct.start();
        let result = std::thread::scope(|scope| {
            scope.spawn(|| chunkdb.run());
            if let Some(install) = &install {
                scope.spawn(|| install.run());
            }
            scope.spawn(|| cloud.run());
            let constructing = scope.spawn(|| constructor.run(&plan));
            let result = match constructing.join() {
                Ok(result) => result,
                Err(_) => {
                    self.error.set_error_with_text(
                        InstallError::FileConstructionFail,
                        codes::CONSTRUCTION_UNKNOWN_FAIL,
                        Some("File constructor panicked".into()),
                    );
                    ConstructionResult::default()
                }
            };
            // Sources stop by themselves once nothing is referenced; make sure
            chunkdb.abort();
            if let Some(install) = &install {
                install.abort();
            }
            cloud.abort();
            result
        });
        data.timers.construct.stop();
        log_phase_metrics("Construction", construct_start);

        overflow.clear();
        info!(
            "Constructed {} files, {} failed",
            result.constructed.len(),
            result.failed.len()
        );
        {
            let mut report = self.report.lock().unwrap();
            report.absorb(&self.stats);
            report.final_download_speed = self.stats.download_speed(settings.download_speed_window());
        }
        !self.error.has_error()
    }

    /// Whether the staging install directory holds files of this build
    fn check_resume_data(&self, install_staging: &Path) -> bool {
        let path = install_staging.join(RESUME_DATA_FILE);
        let mut previous = String::new();
        let read = self
            .fs
            .open_read(&path)
            .and_then(|mut reader| reader.read_to_string(&mut previous));
        match read {
            Ok(_) if previous.trim() == self.resume_id() => {
                info!("Resuming staged install of {}", self.resume_id());
                true
            }
            Ok(_) => {
                debug!("Staged data belongs to {}, not resuming", previous.trim());
                false
            }
            Err(_) => false,
        }
    }

    fn write_resume_data(&self, install_staging: &Path) {
        let path = install_staging.join(RESUME_DATA_FILE);
        let written = self
            .fs
            .create_write(&path)
            .and_then(|mut writer| writer.write_all(self.resume_id().as_bytes()));
        if let Err(e) = written {
            warn!("Could not write {}: {}", path.display(), e);
        }
    }

    fn resume_id(&self) -> String {
        let manifest = self.manifest();
        format!("{} {}", manifest.app_name(), manifest.version_string())
    }

    fn run_backup_and_move(&self, data: &mut RunData) -> bool {
        if self.config.stage_only {
            self.progress.set_state_progress(BuildPatchState::MovingToInstall, 1.0);
            return true;
        }
        if self.error.has_error() {
            return false;
        }

        let move_start = Instant::now();
        data.timers.moving.start();
        let manifest = self.manifest().clone();
        let install_dir = &self.config.install_directory;
        let install_staging = self.config.install_staging_directory();

        let mut files_to_remove: BTreeSet<String> = self
            .config
            .current_manifest
            .as_ref()
            .map(|current| manifest.removable_files(current).into_iter().collect())
            .unwrap_or_default();
        let build_files = manifest.build_file_list();
        files_to_remove.extend(build_files.iter().filter(|f| !data.tagged_files.contains(*f)).cloned());
        self.report.lock().unwrap().num_files_to_remove = files_to_remove.len();
        if !files_to_remove.is_empty() {
            info!("Removing {} files no longer installed", files_to_remove.len());
        }
        for filename in &files_to_remove {
            self.backup_file_if_necessary(data, filename, false);
            let path = join_manifest_path(install_dir, filename);
            if let Err(e) = self.fs.delete_file(&path) {
                warn!("Could not remove {}: {}", path.display(), e);
            }
        }

        let mut ok = true;
        let mut marker_written = false;
        let total = build_files.len().max(1) as f32;
        for (index, filename) in build_files.iter().enumerate() {
            if !ok || self.error.has_error() {
                break;
            }
            let source = join_manifest_path(&install_staging, filename);
            if self.fs.file_exists(&source) {
                if !marker_written {
                    self.write_move_marker();
                    marker_written = true;
                    if self.progress.state_weight(BuildPatchState::MovingToInstall) <= 0.0 {
                        self.progress.set_state_weight(BuildPatchState::MovingToInstall, 0.1);
                    }
                }
                let dest = join_manifest_path(install_dir, filename);
                self.backup_file_if_necessary(data, filename, false);
                if let Err(e) = self.fs.delete_file(&dest) {
                    debug!("Could not delete {} before moving: {}", dest.display(), e);
                }
                ok = self.move_with_retries(filename, &source, &dest);
                if ok {
                    data.files_installed.insert(filename.clone());
                } else {
                    self.error.set_error_with_text(
                        InstallError::MoveFileToInstall,
                        codes::MOVE_STAGE_TO_INSTALL,
                        Some(format!("Could not move {} into place", filename)),
                    );
                }
            }
            self.progress
                .set_state_progress(BuildPatchState::MovingToInstall, (index + 1) as f32 / total);
        }

        self.fs.remove_empty_directories(install_dir);
        ok = ok && !self.error.has_error();
        if ok {
            self.progress.set_state_progress(BuildPatchState::MovingToInstall, 1.0);
        }
        data.timers.moving.stop();
        log_phase_metrics("Moving", move_start);
        ok
    }

    fn write_move_marker(&self) {
        let marker = self.config.install_directory.join(MOVE_MARKER_FILE);
        if let Err(e) = self.fs.create_write(&marker) {
            warn!("Could not write {}: {}", marker.display(), e);
        }
    }

    /// Move a staged file into place, retrying and finally falling back to a copy
    fn move_with_retries(&self, filename: &str, source: &Path, dest: &Path) -> bool {
        let mut retries_left = self.config.settings.num_file_move_retries;
        let mut result = self.fs.move_file(source, dest);
        loop {
            let e = match result {
                Ok(()) => return true,
                Err(e) => e,
            };
            if retries_left == 0 {
                error!("Failed to move {} into place: {}", filename, e);
                return false;
            }
            retries_left -= 1;
            warn!("Failed to move {}: {}, retrying", filename, e);
            self.analytics
                .record_construction_error(filename, e.raw_os_error().unwrap_or(0), "Failed To Move");

            match self.fs.copy_file(source, dest) {
                Ok(()) => {
                    if let Err(e) = self.fs.delete_file(source) {
                        debug!("Could not delete staged {}: {}", source.display(), e);
                    }
                    return true;
                }
                Err(e) => debug!("Copy fallback for {} failed: {}", filename, e),
            }
            self.platform.sleep(MOVE_RETRY_DELAY);
            result = self.fs.move_file(source, dest);
        }
    }

    /// Move a user-edited installed file to the backup directory before it
    /// gets replaced or removed
    fn backup_file_if_necessary(&self, data: &RunData, filename: &str, found_by_verification: bool) -> bool {
        let Some(backup_dir) = &self.config.backup_directory else {
            return true;
        };
        let installed = join_manifest_path(&self.config.install_directory, filename);
        let backup = join_manifest_path(backup_dir, filename);
        if !self.fs.file_exists(&installed)
            || self.fs.file_exists(&backup)
            || data.files_installed.contains(filename)
        {
            return true;
        }

        // Corrupt files are always kept. Otherwise a file counts as edited
        // when it matches neither the old nor the new build.
        let user_edited = found_by_verification || {
            let old = self
                .config
                .current_manifest
                .as_ref()
                .and_then(|c| c.file_manifest(filename));
            let new = self.manifest().file_manifest(filename);
            let installed_size = self.fs.file_size(&installed);
            let size_matches = |file: Option<&FileManifest>| file.is_some_and(|f| Some(f.file_size()) == installed_size);
            if !size_matches(old) && !size_matches(new) {
                true
            } else {
                match self.fs.open_read(&installed).and_then(hash_reader) {
                    Ok(hash) => {
                        old.map_or(true, |f| f.file_hash != hash) && new.map_or(true, |f| f.file_hash != hash)
                    }
                    Err(e) => {
                        warn!("Could not hash {}: {}", installed.display(), e);
                        false
                    }
                }
            }
        };
        if !user_edited {
            return true;
        }

        info!("Backing up modified file {}", filename);
        match self.fs.move_file(&installed, &backup) {
            Ok(()) => true,
            Err(e) => {
                warn!("Could not back up {}: {}", installed.display(), e);
                false
            }
        }
    }

    fn build_directory(&self) -> PathBuf {
        if self.config.stage_only {
            self.config.install_staging_directory()
        } else {
            self.config.install_directory.clone()
        }
    }

    fn run_file_attributes(&self, data: &mut RunData, force: bool) -> bool {
        let attributes_start = Instant::now();
        data.timers.attributes.start();
        let attribution = Arc::new(FileAttribution::new(
            self.manifest().clone(),
            self.config.current_manifest.clone(),
            self.build_directory(),
            data.files_to_construct.iter().cloned().collect(),
            force,
            self.fs.clone(),
            self.progress.clone(),
        ));
        let _control = ScopedControllable::new(&self.controls, attribution.clone());
        if !attribution.apply(&data.tagged_files) {
            debug!("Attribution stopped early");
        }
        self.progress.set_state_progress(BuildPatchState::SettingAttributes, 1.0);
        data.timers.attributes.stop();
        log_phase_metrics("Attributes", attributes_start);
        // Attribute failures are logged, never fatal
        true
    }

    fn run_verification(&self, data: &mut RunData, corrupt_files: &mut Vec<String>) -> bool {
        let verify_start = Instant::now();
        data.timers.verify.start();
        self.progress.set_state_progress(BuildPatchState::BuildVerification, 0.0);

        let mode = if self.config.is_repair && data.first_iteration {
            VerifyMode::ShaVerifyAllFiles
        } else {
            self.config.verify_mode
        };
        let verifier = Arc::new(Verifier::new(
            self.manifest().clone(),
            self.build_directory(),
            mode,
            data.files_to_construct.iter().cloned().collect(),
            self.fs.clone(),
            self.progress.clone(),
        ));
        let result = {
            let _control = ScopedControllable::new(&self.controls, verifier.clone());
            verifier.verify(&data.tagged_files)
        };
        *corrupt_files = result.corrupt.clone();
        let ok = result.is_ok();
        if !ok {
            self.error.set_error_with_text(
                InstallError::BuildVerifyFail,
                codes::VERIFY_FINAL_CHECK,
                Some(format!("{} file(s) failed verification", result.corrupt.len())),
            );
        }
        self.progress.set_state_progress(BuildPatchState::BuildVerification, 1.0);

        if !self.error.is_cancelled() {
            let install_staging = self.config.install_staging_directory();
            for filename in corrupt_files.iter() {
                self.backup_file_if_necessary(data, filename, true);
                if !self.config.stage_only {
                    let path = join_manifest_path(&self.config.install_directory, filename);
                    if let Err(e) = self.fs.delete_file(&path) {
                        warn!("Could not delete corrupt {}: {}", path.display(), e);
                    }
                }
                if let Err(e) = self.fs.delete_file(&join_manifest_path(&install_staging, filename)) {
                    debug!("Could not delete staged {}: {}", filename, e);
                }
            }
        }
        data.timers.verify.stop();
        log_phase_metrics("Verification", verify_start);
        ok
    }

    fn clean_up_staging(&self) {
        if self.config.stage_only {
            self.remove_directory(&self.config.data_staging_directory());
            let resume = self.config.install_staging_directory().join(RESUME_DATA_FILE);
            if let Err(e) = self.fs.delete_file(&resume) {
                warn!("Could not delete {}: {}", resume.display(), e);
            }
        } else {
            self.remove_directory(&self.config.staging_directory());
        }
    }

    fn remove_directory(&self, path: &Path) {
        match self.fs.delete_directory(path) {
            Ok(()) => debug!("Removed {}", path.display()),
            Err(e) => warn!("Could not remove {}: {}", path.display(), e),
        }
    }

    fn run_prerequisites(&self) -> bool {
        let directory = self.build_directory();
        PrerequisitesInstaller::new(
            self.manifest().clone(),
            directory,
            self.config.is_repair,
            self.fs.clone(),
            self.platform.clone(),
            self.machine_config.clone(),
            self.error.clone(),
            self.analytics.clone(),
            self.progress.clone(),
        )
        .run()
    }

    fn finish_report(&self, data: &RunData, started: Instant, success: bool) {
        let paused = {
            let state = self.state.lock().unwrap();
            state.paused_time + state.pause_started.map(|s| s.elapsed()).unwrap_or_default()
        };
        let timers = &data.timers;
        let mut report = self.report.lock().unwrap();
        report.absorb(&self.stats);
        report.initialize_time = timers.initialize.seconds();
        report.construct_time = timers.construct.seconds();
        report.move_from_stage_time = timers.moving.seconds();
        report.file_attributes_time = timers.attributes.seconds();
        report.verify_time = timers.verify.seconds();
        report.clean_up_time = timers.clean_up.seconds();
        report.prereq_time = timers.prereq.seconds();
        report.process_execute_time = started.elapsed().as_secs_f64();
        report.process_paused_time = paused.as_secs_f64();
        report.process_active_time = (report.process_execute_time - report.process_paused_time).max(0.0);
        report.process_success = success;
        report.failure_type = self.error.error_type();
        report.error_code = self.error.error_code();
        report.failure_reason_text = if success { String::new() } else { self.error.error_text() };
        report.final_progress = self.progress.progress_no_marquee();
        report.log();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_system::testing::TestFileSystem;
    use crate::installer::analytics::tests::RecordingAnalytics;
    use crate::manifest::testing::TestBuild;
    use crate::paths::chunk_location;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Serialize every chunk of `build` below a local cloud root
    fn publish(build: &TestBuild, manifest: &BuildManifest, root: &Path) {
        for chunk in manifest.data_list() {
            let info = manifest.chunk_info(&chunk).unwrap();
            let path = PathBuf::from(chunk_location(&root.to_string_lossy(), info));
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            let bytes = build.chunk_data(&chunk).serialize(false).unwrap();
            std::fs::write(path, bytes).unwrap();
        }
    }

    struct Fixture {
        tmp: TempDir,
        analytics: Arc<RecordingAnalytics>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                tmp: TempDir::new().unwrap(),
                analytics: Arc::new(RecordingAnalytics::default()),
            }
        }

        fn install_dir(&self) -> PathBuf {
            self.tmp.path().join("install")
        }

        fn cloud(&self) -> PathBuf {
            self.tmp.path().join("cloud")
        }

        fn config(&self, build: &TestBuild) -> InstallerConfiguration {
            let manifest = Arc::new(build.build());
            publish(build, &manifest, &self.cloud());
            let mut config = InstallerConfiguration::new(manifest, self.install_dir());
            config.cloud_directories = vec![self.cloud().to_string_lossy().into_owned()];
            config.machine_config_path = Some(self.tmp.path().join("machine.json"));
            config.settings.num_installer_retries = 2;
            config
        }

        fn run(&self, config: InstallerConfiguration) -> (bool, BuildPatchInstaller) {
            self.run_on(config, Arc::new(DiskFileSystem::new()))
        }

        fn run_on(&self, config: InstallerConfiguration, fs: Arc<dyn FileSystem>) -> (bool, BuildPatchInstaller) {
            let services = InstallerServices {
                fs,
                platform: Arc::new(SystemPlatform::new()),
                downloads: Arc::new(HttpDownloadService::new().unwrap()),
                analytics: self.analytics.clone(),
                machine_config: None,
            };
            let completions = Arc::new(AtomicUsize::new(0));
            let installer = BuildPatchInstaller::new(config, services).on_complete({
                let completions = completions.clone();
                move |_, _| {
                    completions.fetch_add(1, Ordering::SeqCst);
                }
            });
            installer.start().unwrap();
            let success = installer.wait();
            assert_eq!(completions.load(Ordering::SeqCst), 1);
            (success, installer)
        }
    }

    fn build(version: &str) -> TestBuild {
        let mut build = TestBuild::new(version)
            .chunk(1, 64)
            .chunk(2, 64)
            .chunk(3, 64)
            .file("bin/game", &[(1, 0, 64)])
            .file("data/base.pak", &[(2, 0, 64)])
            .file("data/extra.pak", &[(3, 0, 64)]);
        build.file_mut("data/extra.pak").install_tags = vec!["extra".into()];
        build
    }

    #[test]
    fn test_fresh_install_moves_everything_into_place() {
        let fixture = Fixture::new();
        let build = build("1.0");
        let (success, installer) = fixture.run(fixture.config(&build));

        assert!(success);
        assert!(installer.is_complete());
        assert!(!installer.has_error());
        assert_eq!(installer.error_code(), "OK");
        for file in &build.files {
            let data = std::fs::read(fixture.install_dir().join(&file.filename)).unwrap();
            assert_eq!(data, build.contents(&file.filename));
        }
        // Staging and the move marker are gone
        assert!(!fixture.install_dir().join(config::DEFAULT_STAGING_DIR_NAME).exists());
        assert!(!fixture.install_dir().join(MOVE_MARKER_FILE).exists());

        let stats = installer.build_statistics();
        assert!(stats.process_success);
        assert_eq!(stats.num_files_outdated, 3);
        assert_eq!(stats.num_chunks_downloaded, 3);
        assert_eq!(stats.num_install_retries, 0);
    }

    #[test]
    fn test_deselected_tag_removes_files() {
        let fixture = Fixture::new();
        let build = build("1.0");
        let (success, _) = fixture.run(fixture.config(&build));
        assert!(success);

        let mut config = fixture.config(&build);
        config.current_manifest = Some(config.install_manifest.clone());
        config.install_tags = BTreeSet::from([String::new()]);
        let (success, installer) = fixture.run(config);

        assert!(success);
        assert!(fixture.install_dir().join("data/base.pak").exists());
        assert!(!fixture.install_dir().join("data/extra.pak").exists());
        assert_eq!(installer.build_statistics().num_files_to_remove, 1);
        assert_eq!(installer.build_statistics().num_chunks_downloaded, 0);
    }

    #[test]
    fn test_invalid_tag_fails_initialization() {
        let fixture = Fixture::new();
        let mut config = fixture.config(&build("1.0"));
        config.install_tags = BTreeSet::from(["missing".to_string()]);
        let (success, installer) = fixture.run(config);

        assert!(!success);
        assert_eq!(installer.error_type(), InstallError::InitializationError);
        assert_eq!(installer.error_code(), "IZ01");
        assert!(installer.is_complete());
        assert!(!fixture.install_dir().join("bin/game").exists());
    }

    #[test]
    fn test_patch_backs_up_user_edits() {
        let fixture = Fixture::new();
        let old = build("1.0");
        let (success, _) = fixture.run(fixture.config(&old));
        assert!(success);
        std::fs::write(fixture.install_dir().join("data/base.pak"), b"my own edits").unwrap();

        // 2.0 changes base.pak
        let new = TestBuild::new("2.0")
            .chunk(1, 64)
            .chunk(4, 32)
            .chunk(3, 64)
            .file("bin/game", &[(1, 0, 64)])
            .file("data/base.pak", &[(4, 0, 32)])
            .file("data/extra.pak", &[(3, 0, 64)]);
        let mut config = fixture.config(&new);
        config.current_manifest = Some(Arc::new(old.build()));
        config.backup_directory = Some(fixture.tmp.path().join("backup"));
        let (success, installer) = fixture.run(config);

        assert!(success);
        assert_eq!(
            std::fs::read(fixture.tmp.path().join("backup/data/base.pak")).unwrap(),
            b"my own edits"
        );
        assert_eq!(
            std::fs::read(fixture.install_dir().join("data/base.pak")).unwrap(),
            new.contents("data/base.pak")
        );
        // Unchanged files are neither rebuilt nor backed up
        assert!(!fixture.tmp.path().join("backup/bin/game").exists());
        assert_eq!(installer.build_statistics().num_files_outdated, 1);
        assert_eq!(installer.build_statistics().num_chunks_downloaded, 1);
    }

    #[test]
    fn test_stage_only_leaves_install_directory_alone() {
        let fixture = Fixture::new();
        let build = build("1.0");
        let mut config = fixture.config(&build);
        config.stage_only = true;
        let staging = config.install_staging_directory();
        let (success, _) = fixture.run(config);

        assert!(success);
        assert!(!fixture.install_dir().join("bin/game").exists());
        assert_eq!(std::fs::read(staging.join("bin/game")).unwrap(), build.contents("bin/game"));
        assert!(!staging.join(RESUME_DATA_FILE).exists());
    }

    #[test]
    fn test_move_marker_skips_construction() {
        let fixture = Fixture::new();
        let build = build("1.0");
        let (success, _) = fixture.run(fixture.config(&build));
        assert!(success);
        std::fs::write(fixture.install_dir().join(MOVE_MARKER_FILE), b"").unwrap();

        let mut config = fixture.config(&build);
        config.verify_mode = VerifyMode::ShaVerifyAllFiles;
        let (success, installer) = fixture.run(config);
        assert!(success);
        assert_eq!(installer.build_statistics().num_files_outdated, 0);
        assert!(!fixture.install_dir().join(MOVE_MARKER_FILE).exists());
    }

    #[test]
    fn test_missing_cloud_data_is_not_retried() {
        let fixture = Fixture::new();
        let build = build("1.0");
        let mut config = fixture.config(&build);
        std::fs::remove_dir_all(fixture.cloud()).unwrap();
        config.settings.max_retry_count = 1;
        config.settings.retry_delay_times = vec![0.5];
        let (success, installer) = fixture.run(config);

        assert!(!success);
        assert_eq!(installer.error_code(), "DL01");
        assert!(installer.is_resumable());
        assert!(installer.build_statistics().retry_failure_types.is_empty());
        assert!(!fixture.analytics.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_clean_up_goes_through_file_system() {
        let fixture = Fixture::new();
        let build = build("1.0");
        let config = fixture.config(&build);
        let staging = config.staging_directory();
        std::fs::create_dir_all(fixture.install_dir().join("leftover/empty")).unwrap();

        let fs = Arc::new(TestFileSystem::new());
        let (success, _) = fixture.run_on(config, fs.clone());

        assert!(success);
        assert!(fs.deleted_directories.lock().unwrap().contains(&staging));
        assert!(!staging.exists());
        assert!(!fixture.install_dir().join("leftover").exists());
        assert!(fixture.install_dir().join("bin/game").exists());
    }
}
