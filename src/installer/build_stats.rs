//! End of run report
//!
//! [`BuildInstallStats`] is filled in by the installer as it goes and logged
//! as `Build Stat:` lines once the run is over.

use super::error::InstallError;
use super::statistics::{DownloadHealth, InstallerStatistics};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::info;

/// Accumulating stopwatch for one installer phase
#[derive(Debug, Default, Clone, Copy)]
pub struct PhaseTimer {
    total: Duration,
    started: Option<Instant>,
}

impl PhaseTimer {
    pub fn start(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    pub fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            self.total += started.elapsed();
        }
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    /// Seconds accumulated, including a lap still running
    pub fn seconds(&self) -> f64 {
        let running = self.started.map(|s| s.elapsed()).unwrap_or_default();
        (self.total + running).as_secs_f64()
    }
}

/// Statistics for one installer run
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildInstallStats {
    pub app_name: String,
    pub app_installed_version: String,
    pub app_patch_version: String,
    pub cloud_directory: String,
    pub num_files_in_build: usize,
    pub num_files_outdated: usize,
    pub num_files_to_remove: usize,
    pub num_chunks_required: usize,
    pub chunks_queued_for_download: usize,
    pub chunks_locally_available: usize,
    pub chunks_in_chunk_dbs: usize,
    pub num_chunks_downloaded: u64,
    pub num_chunks_recycled: u64,
    pub num_chunks_read_from_chunk_dbs: u64,
    pub num_failed_downloads: u64,
    pub num_bad_downloads: u64,
    pub num_aborted_downloads: u64,
    pub num_recycle_failures: u64,
    pub num_chunk_db_failures: u64,
    pub num_chunks_store_booted: u64,
    pub num_drive_store_chunk_loads: u64,
    pub num_drive_store_load_failures: u64,
    pub total_downloaded_data: u64,
    pub required_download_size: u64,
    pub average_download_speed: f64,
    pub final_download_speed: f64,
    pub theoretical_download_time: f64,
    pub initialize_time: f64,
    pub construct_time: f64,
    pub move_from_stage_time: f64,
    pub file_attributes_time: f64,
    pub verify_time: f64,
    pub clean_up_time: f64,
    pub prereq_time: f64,
    pub process_paused_time: f64,
    pub process_active_time: f64,
    pub process_execute_time: f64,
    pub process_success: bool,
    pub failure_type: InstallError,
    pub error_code: String,
    pub failure_reason_text: String,
    pub num_install_retries: u32,
    pub retry_failure_types: Vec<InstallError>,
    pub retry_error_codes: Vec<String>,
    pub final_progress: f32,
    pub overall_request_success_rate: f32,
    /// Seconds spent at each download health, indexed like [`DownloadHealth::ALL`]
    pub health_times: [f32; 5],
}

impl BuildInstallStats {
    /// Copy the live counters into the report
    pub fn absorb(&mut self, stats: &InstallerStatistics) {
        self.num_chunks_downloaded = stats.num_downloaded();
        self.num_chunks_recycled = stats.num_recycled();
        self.num_chunks_read_from_chunk_dbs = stats.num_chunkdb_loads();
        self.num_failed_downloads = stats.num_failed_downloads();
        self.num_bad_downloads = stats.num_bad_downloads();
        self.num_aborted_downloads = stats.num_aborted_downloads();
        self.num_recycle_failures = stats.num_recycle_failures();
        self.num_chunk_db_failures = stats.num_chunkdb_failures();
        self.num_chunks_store_booted = stats.num_booted();
        self.num_drive_store_chunk_loads = stats.num_cache_loads();
        self.num_drive_store_load_failures = stats.num_cache_load_failures();
        self.total_downloaded_data = stats.bytes_downloaded();
        self.required_download_size = stats.required_download_size();
        self.average_download_speed = stats.average_download_speed();
        self.theoretical_download_time = if self.average_download_speed > 0.0 {
            self.total_downloaded_data as f64 / self.average_download_speed
        } else {
            0.0
        };
        self.overall_request_success_rate = stats.success_rate();
        self.health_times = stats.health_times();
    }

    pub fn log(&self) {
        info!("Build Stat: AppName: {}", self.app_name);
        info!("Build Stat: AppInstalledVersion: {}", self.app_installed_version);
        info!("Build Stat: AppPatchVersion: {}", self.app_patch_version);
        info!("Build Stat: CloudDirectory: {}", self.cloud_directory);
        info!("Build Stat: NumFilesInBuild: {}", self.num_files_in_build);
        info!("Build Stat: NumFilesOutdated: {}", self.num_files_outdated);
        info!("Build Stat: NumFilesToRemove: {}", self.num_files_to_remove);
        info!("Build Stat: NumChunksRequired: {}", self.num_chunks_required);
        info!("Build Stat: ChunksQueuedForDownload: {}", self.chunks_queued_for_download);
        info!("Build Stat: ChunksLocallyAvailable: {}", self.chunks_locally_available);
        info!("Build Stat: ChunksInChunkDbs: {}", self.chunks_in_chunk_dbs);
        info!("Build Stat: NumChunksDownloaded: {}", self.num_chunks_downloaded);
        info!("Build Stat: NumChunksRecycled: {}", self.num_chunks_recycled);
        info!("Build Stat: NumChunksReadFromChunkDbs: {}", self.num_chunks_read_from_chunk_dbs);
        info!("Build Stat: NumFailedDownloads: {}", self.num_failed_downloads);
        info!("Build Stat: NumBadDownloads: {}", self.num_bad_downloads);
        info!("Build Stat: NumAbortedDownloads: {}", self.num_aborted_downloads);
        info!("Build Stat: NumRecycleFailures: {}", self.num_recycle_failures);
        info!("Build Stat: NumChunkDbFailures: {}", self.num_chunk_db_failures);
        info!("Build Stat: NumChunksStoreBooted: {}", self.num_chunks_store_booted);
        info!("Build Stat: NumDriveStoreChunkLoads: {}", self.num_drive_store_chunk_loads);
        info!("Build Stat: NumDriveStoreLoadFailures: {}", self.num_drive_store_load_failures);
        info!("Build Stat: TotalDownloadedData: {}", self.total_downloaded_data);
        info!("Build Stat: RequiredDownloadSize: {}", self.required_download_size);
        info!("Build Stat: AverageDownloadSpeed: {:.2} B/s", self.average_download_speed);
        info!("Build Stat: FinalDownloadSpeed: {:.2} B/s", self.final_download_speed);
        info!("Build Stat: TheoreticalDownloadTime: {:.3}s", self.theoretical_download_time);
        info!("Build Stat: InitializeTime: {:.3}s", self.initialize_time);
        info!("Build Stat: ConstructTime: {:.3}s", self.construct_time);
        info!("Build Stat: MoveFromStageTime: {:.3}s", self.move_from_stage_time);
        info!("Build Stat: FileAttributesTime: {:.3}s", self.file_attributes_time);
        info!("Build Stat: VerifyTime: {:.3}s", self.verify_time);
        info!("Build Stat: CleanUpTime: {:.3}s", self.clean_up_time);
        info!("Build Stat: PrereqTime: {:.3}s", self.prereq_time);
        info!("Build Stat: ProcessPausedTime: {:.3}s", self.process_paused_time);
        info!("Build Stat: ProcessActiveTime: {:.3}s", self.process_active_time);
        info!("Build Stat: ProcessExecuteTime: {:.3}s", self.process_execute_time);
        info!("Build Stat: ProcessSuccess: {}", self.process_success);
        info!("Build Stat: FailureType: {}", self.failure_type);
        info!("Build Stat: ErrorCode: {}", self.error_code);
        info!("Build Stat: FailureReasonText: {}", self.failure_reason_text);
        info!("Build Stat: NumInstallRetries: {}", self.num_install_retries);
        for (attempt, (kind, code)) in self
            .retry_failure_types
            .iter()
            .zip(&self.retry_error_codes)
            .enumerate()
        {
            info!("Build Stat: RetryFailureType {}: {} ({})", attempt, kind, code);
        }
        info!("Build Stat: FinalProgress: {:.3}", self.final_progress);
        info!("Build Stat: OverallRequestSuccessRate: {:.3}", self.overall_request_success_rate);
        for health in DownloadHealth::ALL {
            info!(
                "Build Stat: {}HealthTime: {:.3}s",
                health,
                self.health_times[health.index()]
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_timer_accumulates_laps() {
        let mut timer = PhaseTimer::default();
        assert_eq!(timer.seconds(), 0.0);

        timer.start();
        std::thread::sleep(Duration::from_millis(20));
        timer.stop();
        let first = timer.seconds();
        assert!(first >= 0.02);
        assert!(!timer.is_running());

        // Stopped timers do not advance
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(timer.seconds(), first);

        timer.start();
        timer.start();
        std::thread::sleep(Duration::from_millis(10));
        timer.stop();
        assert!(timer.seconds() >= first + 0.01);
    }

    #[test]
    fn test_absorb_counters() {
        let stats = InstallerStatistics::new();
        let start = Instant::now();
        stats.on_download_success(1000, start, start + Duration::from_secs(2));
        stats.on_download_failed("http://cdn/a");
        stats.on_chunk_recycled();

        let mut report = BuildInstallStats::default();
        report.absorb(&stats);
        assert_eq!(report.num_chunks_downloaded, 1);
        assert_eq!(report.num_failed_downloads, 1);
        assert_eq!(report.num_chunks_recycled, 1);
        assert_eq!(report.total_downloaded_data, 1000);
        assert!((report.overall_request_success_rate - 0.5).abs() < f32::EPSILON);
    }
}
