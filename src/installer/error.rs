//! Installer error latch
//!
//! The first error set during a run wins. Every component polls
//! [`InstallerError::has_error`] and unwinds once it is set; the orchestrator
//! decides whether the attempt is retried.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use tracing::{error, info};

/// Installer failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InstallError {
    #[default]
    NoError,
    DownloadError,
    FileConstructionFail,
    MoveFileToInstall,
    BuildVerifyFail,
    ApplicationClosing,
    ApplicationError,
    UserCanceled,
    PrerequisiteError,
    InitializationError,
    PathLengthExceeded,
    OutOfDiskSpace,
}

impl InstallError {
    /// Two letter prefix of the error code
    pub fn prefix(&self) -> &'static str {
        match self {
            InstallError::NoError => "OK",
            InstallError::DownloadError => "DL",
            InstallError::FileConstructionFail => "FC",
            InstallError::MoveFileToInstall => "MF",
            InstallError::BuildVerifyFail => "BV",
            InstallError::ApplicationClosing => "SD",
            InstallError::ApplicationError => "FA",
            InstallError::UserCanceled => "UC",
            InstallError::PrerequisiteError => "PQ",
            InstallError::InitializationError => "IZ",
            InstallError::PathLengthExceeded => "PL",
            InstallError::OutOfDiskSpace => "DS",
        }
    }

    /// Generic user facing message
    pub fn default_text(&self) -> &'static str {
        match self {
            InstallError::NoError => "The operation was successful.",
            InstallError::DownloadError => "Could not download patch data. Please try again later.",
            InstallError::FileConstructionFail => {
                "A file corruption has occurred. Please try again."
            }
            InstallError::MoveFileToInstall => {
                "A file access error has occurred. Please check your running processes."
            }
            InstallError::BuildVerifyFail => "The installation failed verification. Please try again.",
            InstallError::ApplicationClosing => "The application is closing.",
            InstallError::ApplicationError => "Patching service could not start. Please try again.",
            InstallError::UserCanceled => "The installation was cancelled.",
            InstallError::PrerequisiteError => "The necessary prerequisites have failed to install.",
            InstallError::InitializationError => {
                "The installer failed to initialize. Please contact support."
            }
            InstallError::PathLengthExceeded => {
                "Could not create a file because its path is too long. Please choose a shorter install location."
            }
            InstallError::OutOfDiskSpace => {
                "There is not enough space on the destination drive. Please free up space and try again."
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstallError::NoError => "NoError",
            InstallError::DownloadError => "DownloadError",
            InstallError::FileConstructionFail => "FileConstructionFail",
            InstallError::MoveFileToInstall => "MoveFileToInstall",
            InstallError::BuildVerifyFail => "BuildVerifyFail",
            InstallError::ApplicationClosing => "ApplicationClosing",
            InstallError::ApplicationError => "ApplicationError",
            InstallError::UserCanceled => "UserCanceled",
            InstallError::PrerequisiteError => "PrerequisiteError",
            InstallError::InitializationError => "InitializationError",
            InstallError::PathLengthExceeded => "PathLengthExceeded",
            InstallError::OutOfDiskSpace => "OutOfDiskSpace",
        }
    }
}

impl fmt::Display for InstallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-codes appended to the error prefix
pub mod codes {
    pub const DOWNLOAD_RETRIES_EXCEEDED: &str = "01";

    pub const CONSTRUCTION_UNKNOWN_FAIL: &str = "01";
    pub const CONSTRUCTION_FILE_CREATE_FAIL: &str = "02";
    pub const CONSTRUCTION_MISSING_CHUNK_DATA: &str = "03";
    pub const CONSTRUCTION_MISSING_FILE_INFO: &str = "04";
    pub const CONSTRUCTION_OUTBOUND_CORRUPT: &str = "05";
    pub const CONSTRUCTION_OUTBOUND_DATA_ERROR: &str = "06";

    pub const MOVE_STAGE_TO_INSTALL: &str = "01";

    pub const VERIFY_FINAL_CHECK: &str = "01";

    pub const APPLICATION_CLOSED: &str = "01";

    pub const USER_REQUESTED: &str = "01";

    pub const PREREQ_LAUNCH_FAILED: &str = "01";
    pub const PREREQ_MISSING_FILE: &str = "02";

    pub const INIT_INVALID_INSTALL_TAGS: &str = "01";
    pub const INIT_MISSING_COMPLETE_CALLBACK: &str = "02";
    pub const INIT_MISSING_INSTALL_DIRECTORY: &str = "03";
    pub const INIT_MISSING_STAGE_DIRECTORY: &str = "04";

    pub const PATH_LENGTH_STAGING_DIRECTORY: &str = "01";

    pub const DISK_SPACE_DURING_INSTALLATION: &str = "01";
    pub const DISK_SPACE_WRITE_FAILED: &str = "02";
}

/// Callback fired once when an error is first latched
pub type ErrorCallback = Box<dyn Fn() + Send + Sync>;

#[derive(Debug, Default)]
struct ErrorState {
    kind: InstallError,
    code: String,
    text: Option<String>,
}

/// First-error-wins latch shared by every component of a run
#[derive(Default)]
pub struct InstallerError {
    state: Mutex<ErrorState>,
    callbacks: Mutex<Vec<ErrorCallback>>,
}

impl InstallerError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch an error with the generic text for its kind
    pub fn set_error(&self, kind: InstallError, code: &str) {
        self.set_error_with_text(kind, code, None);
    }

    /// Latch an error. Ignored if an error is already set.
    pub fn set_error_with_text(&self, kind: InstallError, code: &str, text: Option<String>) {
        if kind == InstallError::NoError {
            return;
        }
        {
            let mut state = self.state.lock().unwrap();
            if state.kind != InstallError::NoError {
                return;
            }
            state.kind = kind;
            state.code = code.to_string();
            state.text = text;
        }

        if kind.is_cancellation() {
            info!("Installer stopping: {}{}{}", kind, kind.prefix(), code);
        } else {
            error!("Installer error: {} ({}{})", kind, kind.prefix(), code);
        }

        for callback in self.callbacks.lock().unwrap().iter() {
            callback();
        }
    }

    pub fn has_error(&self) -> bool {
        self.state.lock().unwrap().kind != InstallError::NoError
    }

    /// Whether the run stopped because of cancellation or shutdown
    pub fn is_cancelled(&self) -> bool {
        self.state.lock().unwrap().kind.is_cancellation()
    }

    /// Whether the whole install attempt may be retried
    pub fn can_retry(&self) -> bool {
        !matches!(
            self.state.lock().unwrap().kind,
            InstallError::InitializationError
                | InstallError::PathLengthExceeded
                | InstallError::OutOfDiskSpace
                | InstallError::DownloadError
                | InstallError::MoveFileToInstall
                | InstallError::UserCanceled
                | InstallError::ApplicationClosing
        )
    }

    pub fn error_type(&self) -> InstallError {
        self.state.lock().unwrap().kind
    }

    /// Prefix plus sub-code, e.g. `DL01`
    pub fn error_code(&self) -> String {
        let state = self.state.lock().unwrap();
        format!("{}{}", state.kind.prefix(), state.code)
    }

    pub fn error_text(&self) -> String {
        let state = self.state.lock().unwrap();
        state
            .text
            .clone()
            .unwrap_or_else(|| state.kind.default_text().to_string())
    }

    /// Clear the latch for a new attempt. Registered callbacks stay.
    pub fn reset(&self) {
        *self.state.lock().unwrap() = ErrorState::default();
    }

    /// Register a callback fired when the next error is latched
    pub fn register_for_errors(&self, callback: ErrorCallback) {
        self.callbacks.lock().unwrap().push(callback);
    }
}

impl InstallError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, InstallError::UserCanceled | InstallError::ApplicationClosing)
    }
}
