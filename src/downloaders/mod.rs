//! Download service used by the cloud chunk source
//!
//! Requests are fire-and-forget: the caller hands over a reply channel and
//! later receives one [`DownloadResponse`] per request that was not cancelled.
//! Cloud roots may be HTTP(S) URLs or local directories.

mod http;

pub use http::HttpDownloadService;

use std::fmt;
use std::sync::mpsc::Sender;
use std::time::Duration;

/// Identifies one request made to a [`DownloadService`]
pub type RequestId = u64;

/// Why a request produced no data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadFailure {
    /// HTTP status, when the server answered
    pub status: Option<u16>,
    pub message: String,
}

impl fmt::Display for DownloadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "HTTP {} - {}", status, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Outcome of a single request
#[derive(Debug)]
pub struct DownloadResponse {
    pub request_id: RequestId,
    pub url: String,
    pub result: Result<Vec<u8>, DownloadFailure>,
    /// Wall time from dispatch to completion
    pub elapsed: Duration,
}

/// Fetches whole files by URL or path
pub trait DownloadService: Send + Sync {
    /// Start fetching `url`; the outcome is sent on `reply`
    fn request_file(&self, url: &str, reply: Sender<DownloadResponse>) -> RequestId;

    /// Abandon a request. No response is sent for it afterwards.
    fn cancel_request(&self, request_id: RequestId);
}

/// Truncate URL for log messages
pub fn truncate_url(url: &str) -> String {
    if url.len() > 80 {
        let cut = (0..=77).rev().find(|i| url.is_char_boundary(*i)).unwrap_or(0);
        format!("{}...", &url[..cut])
    } else {
        url.to_string()
    }
}
