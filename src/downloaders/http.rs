//! HTTP and local-file download service with stall detection

use super::{DownloadFailure, DownloadResponse, DownloadService, RequestId};
use crate::paths::is_http_location;

use anyhow::{Context, Result};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Connection timeout: time to establish TCP connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Read timeout: maximum time to wait for data between chunks
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Overall request timeout for a single chunk request.
///
/// Chunks are small; the cloud source aborts slow transfers well before this.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Stall detection: fail if the body produces no bytes for this long
const STALL_TIMEOUT: Duration = Duration::from_secs(90);

/// Worker threads for the download runtime
const RUNTIME_THREADS: usize = 4;

/// Abort handles of requests that have neither finished nor been cancelled.
/// A task that finds its own entry gone was cancelled.
type RequestTable = HashMap<RequestId, AbortHandle>;

/// [`DownloadService`] backed by reqwest on a private tokio runtime
pub struct HttpDownloadService {
    runtime: tokio::runtime::Runtime,
    client: reqwest::Client,
    next_id: AtomicU64,
    requests: Arc<Mutex<RequestTable>>,
}

impl HttpDownloadService {
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(RUNTIME_THREADS)
            .thread_name("download-service")
            .enable_all()
            .build()
            .context("Failed to create download runtime")?;

        let client = reqwest::Client::builder()
            .user_agent(concat!("buildpatch/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            runtime,
            client,
            next_id: AtomicU64::new(1),
            requests: Arc::new(Mutex::new(RequestTable::new())),
        })
    }
}

impl DownloadService for HttpDownloadService {
    fn request_file(&self, url: &str, reply: Sender<DownloadResponse>) -> RequestId {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let client = self.client.clone();
        let requests = self.requests.clone();
        let url = url.to_string();

        // Held across the spawn so the handle is in place before the task can finish
        let mut table = self.requests.lock().unwrap();
        let task = self.runtime.spawn(async move {
            let started = Instant::now();
            let result = fetch(&client, &url).await;

            let cancelled = requests.lock().unwrap().remove(&request_id).is_none();
            if cancelled {
                debug!("Dropping response for cancelled request {}", request_id);
                return;
            }

            // The receiver going away just means nobody wants the data anymore
            let _ = reply.send(DownloadResponse {
                request_id,
                url,
                result,
                elapsed: started.elapsed(),
            });
        });
        table.insert(request_id, task.abort_handle());
        request_id
    }

    fn cancel_request(&self, request_id: RequestId) {
        if let Some(handle) = self.requests.lock().unwrap().remove(&request_id) {
            handle.abort();
        }
    }
}

impl HttpDownloadService {
    /// Requests that have neither finished nor been cancelled
    pub fn in_flight(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

/// Fetch one location in full
async fn fetch(client: &reqwest::Client, location: &str) -> Result<Vec<u8>, DownloadFailure> {
    if !is_http_location(location) {
        return tokio::fs::read(location).await.map_err(|e| DownloadFailure {
            status: None,
            message: format!("Failed to read {}: {}", location, e),
        });
    }

    let response = client.get(location).send().await.map_err(|e| DownloadFailure {
        status: None,
        message: format!("Connection failed: {}", e),
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(DownloadFailure {
            status: Some(status.as_u16()),
            message: truncate_error(&body),
        });
    }

    let mut data = Vec::with_capacity(response.content_length().unwrap_or(0) as usize);
    let mut stream = response.bytes_stream();
    loop {
        let next = match tokio::time::timeout(STALL_TIMEOUT, stream.next()).await {
            Ok(next) => next,
            Err(_) => {
                warn!("Download stalled - no data for {:?}", STALL_TIMEOUT);
                return Err(DownloadFailure {
                    status: Some(status.as_u16()),
                    message: format!("Stalled: no data for {}s", STALL_TIMEOUT.as_secs()),
                });
            }
        };
        match next {
            Some(Ok(bytes)) => data.extend_from_slice(&bytes),
            Some(Err(e)) => {
                return Err(DownloadFailure {
                    status: Some(status.as_u16()),
                    message: format!("Failed to read body: {}", e),
                })
            }
            None => break,
        }
    }

    Ok(data)
}

/// Truncate error body for display
fn truncate_error(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() > 100 {
        let cut = (0..=97).rev().find(|i| trimmed.is_char_boundary(*i)).unwrap_or(0);
        format!("{}...", &trimmed[..cut])
    } else if trimmed.is_empty() {
        "No details".to_string()
    } else {
        trimmed.to_string()
    }
}
