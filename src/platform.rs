//! Operating system capability: sleeping, error codes and elevated process launch

use std::io;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Abstract OS operations the installer needs
pub trait Platform: Send + Sync {
    fn sleep(&self, duration: Duration);

    /// Last OS error code of the calling thread
    fn last_error(&self) -> i32;

    /// Enable or disable OS dialogs that block on failed media access
    fn set_os_error_dialogs(&self, enabled: bool);

    /// Run an executable with elevated rights and wait for its exit code
    fn exec_elevated_process(&self, exe: &Path, args: &str) -> io::Result<i32>;
}

/// [`Platform`] for the machine we are running on
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPlatform;

impl SystemPlatform {
    pub fn new() -> Self {
        Self
    }
}

/// Helper used to gain root on Linux desktops
const ELEVATION_HELPER: &str = "pkexec";

impl Platform for SystemPlatform {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn last_error(&self) -> i32 {
        io::Error::last_os_error().raw_os_error().unwrap_or(0)
    }

    fn set_os_error_dialogs(&self, enabled: bool) {
        // Unix never raises media dialogs, nothing to toggle
        debug!("OS error dialogs {}", if enabled { "enabled" } else { "disabled" });
    }

    fn exec_elevated_process(&self, exe: &Path, args: &str) -> io::Result<i32> {
        let mut command = match elevation_helper() {
            Some(helper) => {
                let mut cmd = Command::new(helper);
                cmd.arg(exe);
                cmd
            }
            None => Command::new(exe),
        };
        command.args(args.split_whitespace());

        info!("Launching {} {}", exe.display(), args);
        let status = command.status()?;
        match status.code() {
            Some(code) => Ok(code),
            None => {
                warn!("{} terminated by signal", exe.display());
                Ok(-1)
            }
        }
    }
}

#[cfg(unix)]
fn elevation_helper() -> Option<std::path::PathBuf> {
    // SAFETY: geteuid has no preconditions
    let is_root = unsafe { libc::geteuid() } == 0;
    if is_root {
        return None;
    }
    which::which(ELEVATION_HELPER).ok()
}

#[cfg(not(unix))]
fn elevation_helper() -> Option<std::path::PathBuf> {
    let _ = ELEVATION_HELPER;
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_exec_reports_exit_code() {
        // Skip elevation paths on machines that would prompt
        if elevation_helper().is_some() {
            return;
        }
        let platform = SystemPlatform::new();
        let code = platform
            .exec_elevated_process(Path::new("/bin/sh"), "-c exit")
            .unwrap();
        assert_eq!(code, 0);
    }

    #[test]
    fn test_exec_missing_binary_fails() {
        let platform = SystemPlatform::new();
        if elevation_helper().is_some() {
            return;
        }
        assert!(platform
            .exec_elevated_process(Path::new("/no/such/installer"), "")
            .is_err());
    }
}
