//! Numeric statistics gathered while an install runs
//!
//! Counters are plain atomics; download timings and health durations live
//! behind one mutex since they are updated together.

use crate::manifest::ChunkId;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Rolling classification of download success
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum DownloadHealth {
    Disconnected,
    Poor,
    OK,
    Good,
    Excellent,
}

impl DownloadHealth {
    pub const ALL: [DownloadHealth; 5] = [
        DownloadHealth::Disconnected,
        DownloadHealth::Poor,
        DownloadHealth::OK,
        DownloadHealth::Good,
        DownloadHealth::Excellent,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Map a 0..1 success rate to a health value.
    ///
    /// `thresholds` holds the minimum rate for OK, Good and Excellent.
    pub fn from_success_rate(rate: f32, thresholds: &HealthThresholds) -> Self {
        if rate >= thresholds.excellent {
            DownloadHealth::Excellent
        } else if rate >= thresholds.good {
            DownloadHealth::Good
        } else if rate >= thresholds.ok {
            DownloadHealth::OK
        } else {
            DownloadHealth::Poor
        }
    }
}

impl fmt::Display for DownloadHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Success rate boundaries for [`DownloadHealth`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, serde::Deserialize)]
pub struct HealthThresholds {
    pub ok: f32,
    pub good: f32,
    pub excellent: f32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            ok: 0.90,
            good: 0.99,
            excellent: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DownloadRecord {
    start: Instant,
    end: Instant,
    bytes: u64,
}

#[derive(Debug)]
struct TimedState {
    records: VecDeque<DownloadRecord>,
    /// Every completed download, used for the run average
    all_time: Duration,
    all_bytes: u64,
    last_merged_end: Option<Instant>,
    health: DownloadHealth,
    health_since: Instant,
    health_times: [Duration; 5],
}

impl Default for TimedState {
    fn default() -> Self {
        Self {
            records: VecDeque::new(),
            all_time: Duration::ZERO,
            all_bytes: 0,
            last_merged_end: None,
            health: DownloadHealth::Excellent,
            health_since: Instant::now(),
            health_times: [Duration::ZERO; 5],
        }
    }
}

/// Oldest record kept for windowed speed queries
const MAX_RECORD_AGE: Duration = Duration::from_secs(60);

/// Aggregated counters for one installer run
#[derive(Debug, Default)]
pub struct InstallerStatistics {
    downloads_ok: AtomicU64,
    downloads_failed: AtomicU64,
    downloads_corrupt: AtomicU64,
    downloads_aborted: AtomicU64,
    bytes_downloaded: AtomicU64,
    chunks_recycled: AtomicU64,
    recycle_failures: AtomicU64,
    chunkdb_loads: AtomicU64,
    chunkdb_failures: AtomicU64,
    store_booted: AtomicU64,
    store_cleaned: AtomicU64,
    cache_loads: AtomicU64,
    cache_load_failures: AtomicU64,
    cache_saves: AtomicU64,
    cache_save_failures: AtomicU64,
    bytes_constructed: AtomicU64,
    files_constructed: AtomicU64,
    required_download_size: AtomicU64,
    timed: Mutex<TimedState>,
}

impl InstallerStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_download_success(&self, bytes: u64, start: Instant, end: Instant) {
        self.downloads_ok.fetch_add(1, Ordering::Relaxed);
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);

        let mut timed = self.timed.lock().unwrap();
        // Overlapping downloads only count their union towards elapsed time
        let effective_start = match timed.last_merged_end {
            Some(last) if last > start => last,
            _ => start,
        };
        if end > effective_start {
            timed.all_time += end - effective_start;
        }
        timed.last_merged_end = Some(timed.last_merged_end.map_or(end, |last| last.max(end)));
        timed.all_bytes += bytes;

        timed.records.push_back(DownloadRecord { start, end, bytes });
        while let Some(front) = timed.records.front() {
            if end.duration_since(front.end) > MAX_RECORD_AGE {
                timed.records.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn on_download_failed(&self, url: &str) {
        debug!("Download failed: {}", url);
        self.downloads_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_download_corrupt(&self, id: &ChunkId) {
        debug!("Downloaded chunk {} was corrupt", id);
        self.downloads_corrupt.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_download_aborted(&self, url: &str) {
        debug!("Download aborted: {}", url);
        self.downloads_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_chunk_recycled(&self) {
        self.chunks_recycled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_recycle_failed(&self, id: &ChunkId) {
        debug!("Failed to recycle chunk {}", id);
        self.recycle_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_chunkdb_load(&self) {
        self.chunkdb_loads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_chunkdb_failed(&self, id: &ChunkId) {
        debug!("Failed to load chunk {} from chunkdb", id);
        self.chunkdb_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A referenced chunk was pushed out of memory
    pub fn on_chunk_booted(&self, id: &ChunkId) {
        debug!("Booted chunk {}", id);
        self.store_booted.fetch_add(1, Ordering::Relaxed);
    }

    /// An unreferenced chunk was dropped from memory
    pub fn on_chunk_cleaned(&self) {
        self.store_cleaned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_cache_load(&self, ok: bool) {
        if ok {
            self.cache_loads.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_load_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn on_cache_save(&self, ok: bool) {
        if ok {
            self.cache_saves.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_save_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn on_file_constructed(&self, bytes: u64) {
        self.files_constructed.fetch_add(1, Ordering::Relaxed);
        self.bytes_constructed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn on_bytes_constructed(&self, bytes: u64) {
        self.bytes_constructed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn set_required_download_size(&self, bytes: u64) {
        self.required_download_size.store(bytes, Ordering::Relaxed);
    }

    pub fn required_download_size(&self) -> u64 {
        self.required_download_size.load(Ordering::Relaxed)
    }

    pub fn num_downloaded(&self) -> u64 {
        self.downloads_ok.load(Ordering::Relaxed)
    }

    pub fn num_failed_downloads(&self) -> u64 {
        self.downloads_failed.load(Ordering::Relaxed)
    }

    pub fn num_bad_downloads(&self) -> u64 {
        self.downloads_corrupt.load(Ordering::Relaxed)
    }

    pub fn num_aborted_downloads(&self) -> u64 {
        self.downloads_aborted.load(Ordering::Relaxed)
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded.load(Ordering::Relaxed)
    }

    pub fn num_recycled(&self) -> u64 {
        self.chunks_recycled.load(Ordering::Relaxed)
    }

    pub fn num_recycle_failures(&self) -> u64 {
        self.recycle_failures.load(Ordering::Relaxed)
    }

    pub fn num_chunkdb_loads(&self) -> u64 {
        self.chunkdb_loads.load(Ordering::Relaxed)
    }

    pub fn num_chunkdb_failures(&self) -> u64 {
        self.chunkdb_failures.load(Ordering::Relaxed)
    }

    pub fn num_booted(&self) -> u64 {
        self.store_booted.load(Ordering::Relaxed)
    }

    pub fn num_cleaned(&self) -> u64 {
        self.store_cleaned.load(Ordering::Relaxed)
    }

    pub fn num_cache_loads(&self) -> u64 {
        self.cache_loads.load(Ordering::Relaxed)
    }

    pub fn num_cache_load_failures(&self) -> u64 {
        self.cache_load_failures.load(Ordering::Relaxed)
    }

    pub fn num_cache_saves(&self) -> u64 {
        self.cache_saves.load(Ordering::Relaxed)
    }

    pub fn num_cache_save_failures(&self) -> u64 {
        self.cache_save_failures.load(Ordering::Relaxed)
    }

    pub fn bytes_constructed(&self) -> u64 {
        self.bytes_constructed.load(Ordering::Relaxed)
    }

    pub fn files_constructed(&self) -> u64 {
        self.files_constructed.load(Ordering::Relaxed)
    }

    /// Bytes per second over the last `window`, counting only time when
    /// at least one download was in flight
    pub fn download_speed(&self, window: Duration) -> f64 {
        let timed = self.timed.lock().unwrap();
        let now = Instant::now();
        let cutoff = now.checked_sub(window).unwrap_or(now);

        let mut spans: Vec<(Instant, Instant, u64)> = timed
            .records
            .iter()
            .filter(|r| r.end >= cutoff)
            .map(|r| (r.start.max(cutoff), r.end, r.bytes))
            .collect();
        if spans.is_empty() {
            return 0.0;
        }
        spans.sort_by_key(|s| s.0);

        let mut active = Duration::ZERO;
        let mut bytes = 0u64;
        let mut merged_end: Option<Instant> = None;
        for (start, end, size) in spans {
            bytes += size;
            let effective_start = match merged_end {
                Some(last) if last > start => last,
                _ => start,
            };
            if end > effective_start {
                active += end - effective_start;
            }
            merged_end = Some(merged_end.map_or(end, |last| last.max(end)));
        }

        let secs = active.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        bytes as f64 / secs
    }

    /// Bytes per second across the whole run
    pub fn average_download_speed(&self) -> f64 {
        let timed = self.timed.lock().unwrap();
        let secs = timed.all_time.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        timed.all_bytes as f64 / secs
    }

    /// Ratio of successful requests to all finished requests
    pub fn success_rate(&self) -> f32 {
        let ok = self.num_downloaded();
        let total = ok + self.num_failed_downloads() + self.num_bad_downloads() + self.num_aborted_downloads();
        if total == 0 {
            return 1.0;
        }
        ok as f32 / total as f32
    }

    pub fn on_health_changed(&self, health: DownloadHealth) {
        let mut timed = self.timed.lock().unwrap();
        if timed.health == health {
            return;
        }
        let now = Instant::now();
        let elapsed = now.duration_since(timed.health_since);
        let index = timed.health.index();
        timed.health_times[index] += elapsed;
        timed.health = health;
        timed.health_since = now;
    }

    pub fn download_health(&self) -> DownloadHealth {
        self.timed.lock().unwrap().health
    }

    /// Seconds spent at each health value, indexed by [`DownloadHealth::index`]
    pub fn health_times(&self) -> [f32; 5] {
        let timed = self.timed.lock().unwrap();
        let mut times = timed.health_times;
        times[timed.health.index()] += timed.health_since.elapsed();
        times.map(|d| d.as_secs_f32())
    }
}
