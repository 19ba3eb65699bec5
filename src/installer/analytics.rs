//! Analytics events raised by the installer
//!
//! Events go to an injected [`AnalyticsProvider`]. Each error type is capped
//! per run so a failing CDN cannot flood the sink.

use crate::manifest::ChunkId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Sink for analytics events
pub trait AnalyticsProvider: Send + Sync {
    fn record_event(&self, name: &str, attributes: &[(&str, String)]);
}

/// Provider that writes events to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAnalytics;

impl AnalyticsProvider for TracingAnalytics {
    fn record_event(&self, name: &str, attributes: &[(&str, String)]) {
        let rendered: Vec<String> = attributes.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        info!("Analytics: {} {}", name, rendered.join(" "));
    }
}

/// Maximum events of one kind sent per run
const MAX_EVENTS_PER_TYPE: usize = 20;

/// Installer-specific wrapper around an [`AnalyticsProvider`]
pub struct InstallerAnalytics {
    provider: Arc<dyn AnalyticsProvider>,
    counts: Mutex<HashMap<&'static str, usize>>,
}

impl InstallerAnalytics {
    pub fn new(provider: Arc<dyn AnalyticsProvider>) -> Self {
        Self {
            provider,
            counts: Mutex::new(HashMap::new()),
        }
    }

    fn record_capped(&self, name: &'static str, attributes: &[(&str, String)]) {
        {
            let mut counts = self.counts.lock().unwrap();
            let count = counts.entry(name).or_insert(0);
            if *count >= MAX_EVENTS_PER_TYPE {
                return;
            }
            *count += 1;
        }
        self.provider.record_event(name, attributes);
    }

    pub fn record_chunk_download_error(&self, url: &str, status: Option<u16>, error: &str) {
        self.record_capped(
            "Patcher.Error.Download",
            &[
                ("ChunkURL", url.to_string()),
                ("ResponseCode", status.map(|s| s.to_string()).unwrap_or_else(|| "-1".into())),
                ("ErrorString", error.to_string()),
            ],
        );
    }

    pub fn record_chunk_download_aborted(&self, url: &str, seconds: f64, mean: f64, std_dev: f64, threshold: f64) {
        self.record_capped(
            "Patcher.Warning.ChunkAborted",
            &[
                ("ChunkURL", url.to_string()),
                ("DownloadTime", format!("{:.3}", seconds)),
                ("MeanTime", format!("{:.3}", mean)),
                ("StdDevTime", format!("{:.3}", std_dev)),
                ("AbortThreshold", format!("{:.3}", threshold)),
            ],
        );
    }

    pub fn record_chunk_cache_error(&self, id: &ChunkId, filename: &str, os_error: i32, system: &str, reason: &str) {
        self.record_capped(
            "Patcher.Error.Cache",
            &[
                ("ChunkGuid", id.to_string()),
                ("Filename", filename.to_string()),
                ("LastError", os_error.to_string()),
                ("SystemName", system.to_string()),
                ("ErrorString", reason.to_string()),
            ],
        );
    }

    pub fn record_construction_error(&self, filename: &str, os_error: i32, reason: &str) {
        self.record_capped(
            "Patcher.Error.Construction",
            &[
                ("Filename", filename.to_string()),
                ("LastError", os_error.to_string()),
                ("ErrorString", reason.to_string()),
            ],
        );
    }

    pub fn record_prereq_installation_error(&self, app_name: &str, version: &str, filename: &str, reason: &str, code: i32) {
        self.record_capped(
            "Patcher.Error.Prerequisites",
            &[
                ("AppName", app_name.to_string()),
                ("CurrentBuild", version.to_string()),
                ("PrereqFilename", filename.to_string()),
                ("ErrorString", reason.to_string()),
                ("ReturnCode", code.to_string()),
            ],
        );
    }

    pub fn provider(&self) -> &Arc<dyn AnalyticsProvider> {
        &self.provider
    }
}
