//! Downloads chunks from cloud roots
//!
//! The worker keeps up to `num_simultaneous_downloads` requests in flight,
//! fed first by chunks the constructor is blocked on and then by prefetch in
//! consumption order. Failed requests are retried after a delay taken from
//! the retry table, moving to the next cloud root each time. A chunk that
//! fails more than `max_retry_count` times fails the install.
//!
//! Successful download times feed a running mean and deviation; a request
//! running longer than `max(floor, mean + 4σ)` is assumed stuck on a stalled
//! TCP window and is cancelled and retried.

use super::{batch_size, ChunkSource, SourceContext, UnavailableChunksCallback, UnavailableNotifier, WAIT_INTERVAL};
use crate::chunk::ChunkData;
use crate::downloaders::{truncate_url, DownloadFailure, DownloadResponse, DownloadService, RequestId};
use crate::installer::config::BuildPatchSettings;
use crate::installer::control::{ControlFlags, Controllable};
use crate::installer::error::{codes, InstallError};
use crate::installer::memory_store::ChunkStore;
use crate::installer::progress::{BuildPatchProgress, BuildPatchState};
use crate::installer::statistics::{DownloadHealth, HealthThresholds};
use crate::manifest::{BuildManifest, ChunkId};
use crate::paths::chunk_location;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long the worker waits for responses per iteration
const TICK: Duration = Duration::from_millis(20);

/// Successful downloads needed before stall detection kicks in
const MIN_TIMING_SAMPLES: u64 = 10;

/// Recent outcomes used for the success rate
const SUCCESS_RATE_WINDOW: usize = 64;

/// Standard deviations above the mean before a download counts as stalled
const STALL_SIGMA: f64 = 4.0;

#[derive(Debug, Clone)]
pub struct CloudSourceConfig {
    pub cloud_roots: Vec<String>,
    pub num_simultaneous_downloads: usize,
    /// Negative retries forever
    pub max_retry_count: i32,
    pub retry_delays: Vec<Duration>,
    pub prefetch_minimum: usize,
    pub prefetch_maximum: usize,
    pub health_thresholds: HealthThresholds,
    pub disconnected_delay: Duration,
    pub tcp_zero_window_minimum: Duration,
}

impl CloudSourceConfig {
    pub fn new(cloud_roots: Vec<String>, settings: &BuildPatchSettings) -> Self {
        Self {
            cloud_roots,
            num_simultaneous_downloads: settings.num_simultaneous_downloads,
            max_retry_count: settings.max_retry_count,
            retry_delays: (0..settings.retry_delay_times.len())
                .map(|i| settings.retry_delay(i))
                .collect(),
            prefetch_minimum: settings.cloud_prefetch_minimum,
            prefetch_maximum: settings.cloud_prefetch_maximum,
            health_thresholds: settings.health_thresholds,
            disconnected_delay: Duration::from_secs_f32(settings.disconnected_delay),
            tcp_zero_window_minimum: Duration::from_secs_f32(settings.tcp_zero_window_minimum_seconds),
        }
    }

    /// Delay before retry number `retry` (1-based); the last entry repeats
    fn retry_delay(&self, retry: u32) -> Duration {
        let index = (retry.max(1) as usize - 1).min(self.retry_delays.len().saturating_sub(1));
        self.retry_delays.get(index).copied().unwrap_or(Duration::from_millis(500))
    }
}

/// Requests from `get` waiting for the worker
#[derive(Default)]
struct RequestQueue {
    /// Chunks this source fetches when they are next needed
    responsible: HashSet<ChunkId>,
    /// Chunks a caller is blocked on
    priority: VecDeque<ChunkId>,
    started: bool,
}

pub struct CloudChunkSource {
    config: CloudSourceConfig,
    manifest: Arc<BuildManifest>,
    downloads: Arc<dyn DownloadService>,
    progress: Arc<BuildPatchProgress>,
    context: SourceContext,
    queue: Mutex<RequestQueue>,
    unavailable: UnavailableNotifier,
    control: ControlFlags,
}

impl CloudChunkSource {
    /// `initial` is the set of chunks no other source will provide
    pub fn new(
        config: CloudSourceConfig,
        manifest: Arc<BuildManifest>,
        downloads: Arc<dyn DownloadService>,
        progress: Arc<BuildPatchProgress>,
        initial: HashSet<ChunkId>,
        context: SourceContext,
    ) -> Self {
        context
            .stats
            .set_required_download_size(manifest.data_size_of(&initial));
        info!(
            "Cloud source: {} chunks to download from {} root(s)",
            initial.len(),
            config.cloud_roots.len()
        );
        Self {
            config,
            manifest,
            downloads,
            progress,
            context,
            queue: Mutex::new(RequestQueue {
                responsible: initial,
                ..Default::default()
            }),
            unavailable: UnavailableNotifier::default(),
            control: ControlFlags::new(),
        }
    }

    fn should_stop(&self) -> bool {
        self.control.is_aborted() || self.context.error.has_error() || self.context.tracker.is_empty()
    }

    fn is_responsible(&self, id: &ChunkId) -> bool {
        self.queue.lock().unwrap().responsible.contains(id)
    }

    /// Take on chunks we were not planning to download
    fn adopt(&self, ids: &HashSet<ChunkId>) {
        if ids.is_empty() {
            return;
        }
        let added: HashSet<ChunkId> = {
            let mut queue = self.queue.lock().unwrap();
            ids.iter().filter(|id| queue.responsible.insert(**id)).copied().collect()
        };
        if added.is_empty() {
            return;
        }
        debug!("Cloud source adopting {} runtime requirements", added.len());
        self.context.tracker.mark_runtime_requirements(&added);
        let stats = &self.context.stats;
        stats.set_required_download_size(stats.required_download_size() + self.manifest.data_size_of(&added));
    }

    /// Download worker. Returns once aborted, on error, or when construction
    /// no longer needs anything.
    pub fn run(&self) {
        debug!("Cloud source worker started");
        let (reply, responses) = mpsc::channel();
        let mut worker = DownloadLoop::new(self, reply);

        while !self.should_stop() {
            match responses.recv_timeout(TICK) {
                Ok(response) => worker.on_response(response),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            while let Ok(response) = responses.try_recv() {
                if self.context.error.has_error() {
                    break;
                }
                worker.on_response(response);
            }
            if self.should_stop() {
                break;
            }

            worker.abort_stalled();
            worker.update_health();
            if !self.control.is_paused() {
                worker.queue_requested();
                worker.dispatch();
            }
            self.update_progress();
        }

        worker.cancel_all();
        debug!("Cloud source worker finished");
    }

    fn update_progress(&self) {
        let required = self.context.stats.required_download_size();
        if required > 0 {
            let done = self.context.stats.bytes_downloaded() as f64 / required as f64;
            self.progress
                .set_state_progress(BuildPatchState::Downloading, done.min(1.0) as f32);
        }
    }
}

/// Bookkeeping for one tracked chunk
struct TaskInfo {
    url: String,
    retry_count: u32,
    root_index: usize,
    request: Option<RequestId>,
    /// When the current request was dispatched
    started: Instant,
    /// Earliest time the next attempt may go out
    ready_at: Option<Instant>,
}

/// Welford running mean and variance of download seconds
#[derive(Debug, Default)]
struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    fn add(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    fn std_dev(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / (self.count - 1) as f64).sqrt()
        }
    }
}

/// State owned by the worker thread
struct DownloadLoop<'a> {
    source: &'a CloudChunkSource,
    reply: Sender<DownloadResponse>,
    tasks: HashMap<ChunkId, TaskInfo>,
    in_flight: HashMap<RequestId, ChunkId>,
    /// Tracked chunks awaiting their first request, in dispatch order
    pending: VecDeque<ChunkId>,
    timing: RunningStats,
    outcomes: VecDeque<bool>,
    health: DownloadHealth,
    last_success: Instant,
}

impl<'a> DownloadLoop<'a> {
    fn new(source: &'a CloudChunkSource, reply: Sender<DownloadResponse>) -> Self {
        source.context.stats.on_health_changed(DownloadHealth::Excellent);
        Self {
            source,
            reply,
            tasks: HashMap::new(),
            in_flight: HashMap::new(),
            pending: VecDeque::new(),
            timing: RunningStats::default(),
            outcomes: VecDeque::new(),
            health: DownloadHealth::Excellent,
            last_success: Instant::now(),
        }
    }

    fn record_outcome(&mut self, success: bool) {
        self.outcomes.push_back(success);
        while self.outcomes.len() > SUCCESS_RATE_WINDOW {
            self.outcomes.pop_front();
        }
    }

    fn decode(&self, id: &ChunkId, bytes: &[u8]) -> Result<ChunkData, String> {
        let chunk = ChunkData::deserialize_expected(bytes, *id).map_err(|e| e.to_string())?;
        match self.source.manifest.chunk_sha_hash(id) {
            Some(expected) if !expected.is_zero() && expected != chunk.sha_hash() => {
                Err(format!("SHA mismatch for chunk {}", id))
            }
            _ => Ok(chunk),
        }
    }

    fn on_response(&mut self, response: DownloadResponse) {
        let Some(id) = self.in_flight.remove(&response.request_id) else {
            return;
        };
        let Some(started) = self.tasks.get(&id).map(|t| t.started) else {
            return;
        };
        let source = self.source;
        let context = &source.context;

        let failure = match response.result {
            Ok(bytes) => match self.decode(&id, &bytes) {
                Ok(chunk) => {
                    context
                        .stats
                        .on_download_success(bytes.len() as u64, started, Instant::now());
                    self.timing.add(response.elapsed.as_secs_f64());
                    self.record_outcome(true);
                    self.last_success = Instant::now();
                    self.tasks.remove(&id);
                    context.store.put(chunk);
                    return;
                }
                Err(reason) => {
                    warn!("Corrupt chunk from {}: {}", truncate_url(&response.url), reason);
                    context.stats.on_download_corrupt(&id);
                    DownloadFailure {
                        status: None,
                        message: reason,
                    }
                }
            },
            Err(failure) => {
                debug!("Download failed {}: {}", truncate_url(&response.url), failure);
                context.stats.on_download_failed(&response.url);
                failure
            }
        };
        context
            .analytics
            .record_chunk_download_error(&response.url, failure.status, &failure.message);
        self.retry(id);
    }

    /// Schedule another attempt, or fail the install once retries run out
    fn retry(&mut self, id: ChunkId) {
        self.record_outcome(false);
        let source = self.source;
        let config = &source.config;
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        task.retry_count += 1;
        task.request = None;
        if config.max_retry_count >= 0 && task.retry_count > config.max_retry_count as u32 {
            error!("Chunk {} failed after {} attempts, giving up", id, task.retry_count);
            source
                .context
                .error
                .set_error(InstallError::DownloadError, codes::DOWNLOAD_RETRIES_EXCEEDED);
            return;
        }
        task.root_index = (task.root_index + 1) % config.cloud_roots.len().max(1);
        task.ready_at = Some(Instant::now() + config.retry_delay(task.retry_count));
    }

    fn abort_stalled(&mut self) {
        if self.timing.count < MIN_TIMING_SAMPLES {
            return;
        }
        let source = self.source;
        let mean = self.timing.mean;
        let std_dev = self.timing.std_dev();
        let floor = source.config.tcp_zero_window_minimum.as_secs_f64();
        let threshold = floor.max(mean + STALL_SIGMA * std_dev);

        let now = Instant::now();
        let stalled: Vec<(RequestId, ChunkId, f64)> = self
            .in_flight
            .iter()
            .filter_map(|(request, id)| {
                let elapsed = now.duration_since(self.tasks.get(id)?.started).as_secs_f64();
                (elapsed > threshold).then_some((*request, *id, elapsed))
            })
            .collect();

        for (request, id, elapsed) in stalled {
            source.downloads.cancel_request(request);
            self.in_flight.remove(&request);
            let url = self.tasks.get(&id).map(|t| t.url.clone()).unwrap_or_default();
            warn!(
                "Aborting stalled download {} after {:.1}s (threshold {:.1}s)",
                truncate_url(&url),
                elapsed,
                threshold
            );
            let context = &source.context;
            context.stats.on_download_aborted(&url);
            context
                .analytics
                .record_chunk_download_aborted(&url, elapsed, mean, std_dev, threshold);
            self.retry(id);
        }
    }

    fn update_health(&mut self) {
        let source = self.source;
        let config = &source.config;
        let all_retrying = !self.tasks.is_empty() && self.tasks.values().all(|t| t.retry_count > 0);
        let health = if all_retrying && self.last_success.elapsed() > config.disconnected_delay {
            DownloadHealth::Disconnected
        } else {
            let rate = if self.outcomes.is_empty() {
                1.0
            } else {
                self.outcomes.iter().filter(|ok| **ok).count() as f32 / self.outcomes.len() as f32
            };
            DownloadHealth::from_success_rate(rate, &config.health_thresholds)
        };
        if health != self.health {
            info!("Download health changed to {}", health);
            self.health = health;
            source.context.stats.on_health_changed(health);
        }
    }

    fn track(&mut self, id: ChunkId, front: bool) {
        if self.tasks.contains_key(&id) || self.source.context.store.contains(&id) {
            return;
        }
        self.tasks.insert(
            id,
            TaskInfo {
                url: String::new(),
                retry_count: 0,
                root_index: 0,
                request: None,
                started: Instant::now(),
                ready_at: None,
            },
        );
        if front {
            self.pending.push_front(id);
        } else {
            self.pending.push_back(id);
        }
    }

    /// Pull blocked requests and prefetch candidates into the pending list
    fn queue_requested(&mut self) {
        let (priority, started) = {
            let mut queue = self.source.queue.lock().unwrap();
            (queue.priority.drain(..).collect::<Vec<_>>(), queue.started)
        };
        for id in priority.into_iter().rev() {
            self.track(id, true);
        }
        if !started {
            return;
        }

        let source = self.source;
        let store = &source.context.store;
        let free = store.slack().saturating_sub(self.tasks.len());
        let Some(count) = batch_size(free, source.config.prefetch_minimum, source.config.prefetch_maximum) else {
            return;
        };
        let tasks = &self.tasks;
        let upcoming = source.context.tracker.next_references(count, |id| {
            !tasks.contains_key(id) && source.is_responsible(id) && !store.contains(id)
        });
        for id in upcoming {
            self.track(id, false);
        }
    }

    fn dispatch(&mut self) {
        let max = self.source.config.num_simultaneous_downloads.max(1);
        let now = Instant::now();

        // Due retries go first, oldest deadline first
        let mut due: Vec<(Instant, ChunkId)> = self
            .tasks
            .iter()
            .filter(|(_, t)| t.request.is_none())
            .filter_map(|(id, t)| t.ready_at.filter(|at| *at <= now).map(|at| (at, *id)))
            .collect();
        due.sort();
        let mut order: VecDeque<ChunkId> = due.into_iter().map(|(_, id)| id).collect();

        while self.in_flight.len() < max {
            let id = match order.pop_front().or_else(|| self.pending.pop_front()) {
                Some(id) => id,
                None => break,
            };
            if self.source.context.error.has_error() {
                return;
            }
            self.request(id);
        }
    }

    fn request(&mut self, id: ChunkId) {
        let source = self.source;
        let Some(info) = source.manifest.chunk_info(&id) else {
            warn!("No chunk info for {}, cannot download it", id);
            self.tasks.remove(&id);
            source.unavailable.notify([id].into_iter().collect());
            return;
        };
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        let Some(root) = source.config.cloud_roots.get(task.root_index) else {
            error!("Chunk {} must be downloaded but no cloud directories are configured", id);
            source.context.error.set_error_with_text(
                InstallError::DownloadError,
                codes::DOWNLOAD_RETRIES_EXCEEDED,
                Some("No cloud directories were configured.".to_string()),
            );
            return;
        };
        task.url = chunk_location(root, info);
        task.started = Instant::now();
        task.ready_at = None;
        let request = source.downloads.request_file(&task.url, self.reply.clone());
        task.request = Some(request);
        self.in_flight.insert(request, id);
    }

    fn cancel_all(&mut self) {
        for request in self.in_flight.keys() {
            self.source.downloads.cancel_request(*request);
        }
        self.in_flight.clear();
    }
}

impl ChunkSource for CloudChunkSource {
    fn get(&self, id: &ChunkId, visit: &mut dyn FnMut(&ChunkData)) -> bool {
        let store = &self.context.store;
        if store.get(id, visit) {
            return true;
        }
        if self.manifest.chunk_info(id).is_none() {
            return false;
        }
        self.adopt(&[*id].into_iter().collect());
        {
            let mut queue = self.queue.lock().unwrap();
            queue.started = true;
            if !queue.priority.contains(id) {
                queue.priority.push_back(*id);
            }
        }
        loop {
            if self.control.is_aborted() || self.context.error.has_error() {
                return false;
            }
            if store.wait_for(id, WAIT_INTERVAL) && store.get(id, visit) {
                return true;
            }
        }
    }

    fn add_runtime_requirements(&self, ids: HashSet<ChunkId>) -> HashSet<ChunkId> {
        let (known, unknown): (HashSet<ChunkId>, HashSet<ChunkId>) =
            ids.into_iter().partition(|id| self.manifest.chunk_info(id).is_some());
        self.adopt(&known);
        unknown
    }

    fn set_unavailable_chunks_callback(&self, callback: UnavailableChunksCallback) {
        self.unavailable.set(callback);
    }

    fn available_chunks(&self) -> HashSet<ChunkId> {
        self.manifest.data_list().into_iter().collect()
    }
}

impl Controllable for CloudChunkSource {
    fn set_paused(&self, paused: bool) {
        self.control.set_paused(paused);
    }

    fn abort(&self) {
        self.control.abort();
    }
}
