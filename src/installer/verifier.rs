//! Build verification
//!
//! Checks installed files against the manifest, by size or by SHA1,
//! either for every tagged file or only the ones this run touched.
//! Files are checked in parallel; the result lists every file that failed.

use super::config::VerifyMode;
use super::control::{ControlFlags, Controllable};
use super::progress::{BuildPatchProgress, BuildPatchState};
use crate::file_system::FileSystem;
use crate::hash::hash_reader;
use crate::manifest::BuildManifest;
use crate::paths::join_manifest_path;
use rayon::prelude::*;
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Outcome of one verification pass
#[derive(Debug, Default, Clone)]
pub struct VerifyResult {
    /// Files that are missing or do not match, sorted
    pub corrupt: Vec<String>,
    pub checked: usize,
    /// The pass was aborted before every file was checked
    pub aborted: bool,
}

impl VerifyResult {
    pub fn is_ok(&self) -> bool {
        self.corrupt.is_empty() && !self.aborted
    }
}

pub struct Verifier {
    manifest: Arc<BuildManifest>,
    directory: PathBuf,
    mode: VerifyMode,
    touched: HashSet<String>,
    fs: Arc<dyn FileSystem>,
    progress: Arc<BuildPatchProgress>,
    control: ControlFlags,
}

impl Verifier {
    pub fn new(
        manifest: Arc<BuildManifest>,
        directory: PathBuf,
        mode: VerifyMode,
        touched: HashSet<String>,
        fs: Arc<dyn FileSystem>,
        progress: Arc<BuildPatchProgress>,
    ) -> Self {
        Self {
            manifest,
            directory,
            mode,
            touched,
            fs,
            progress,
            control: ControlFlags::new(),
        }
    }

    pub fn verify(&self, files: &BTreeSet<String>) -> VerifyResult {
        let to_check: Vec<&String> = files
            .iter()
            .filter(|f| !self.mode.touched_only() || self.touched.contains(*f))
            .collect();
        let total_bytes = self.manifest.files_size(to_check.iter().copied()).max(1);
        info!("Verifying {} files ({:?})", to_check.len(), self.mode);

        let done_bytes = AtomicU64::new(0);
        let checked = AtomicUsize::new(0);
        let corrupt: Mutex<Vec<String>> = Mutex::new(Vec::new());

        to_check.par_iter().for_each(|filename| {
            self.control.wait_while_paused();
            if self.control.is_aborted() {
                return;
            }
            if !self.check_file(filename) {
                corrupt.lock().unwrap().push((*filename).clone());
            }
            checked.fetch_add(1, Ordering::Relaxed);
            let done = done_bytes.fetch_add(self.manifest.file_size(filename), Ordering::Relaxed)
                + self.manifest.file_size(filename);
            self.progress
                .set_state_progress(BuildPatchState::BuildVerification, (done as f64 / total_bytes as f64) as f32);
        });

        let mut corrupt = corrupt.into_inner().unwrap();
        corrupt.sort();
        let checked = checked.load(Ordering::Relaxed);
        let aborted = checked < to_check.len();
        if corrupt.is_empty() {
            debug!("Verification passed for {} files", checked);
        } else {
            warn!("Verification found {} bad file(s)", corrupt.len());
        }
        VerifyResult {
            corrupt,
            checked,
            aborted,
        }
    }

    fn check_file(&self, filename: &str) -> bool {
        let Some(file) = self.manifest.file_manifest(filename) else {
            return false;
        };
        let path = join_manifest_path(&self.directory, filename);
        if self.fs.file_size(&path) != Some(file.file_size()) {
            debug!("{} is missing or has the wrong size", filename);
            return false;
        }
        if !self.mode.uses_sha() {
            return true;
        }
        match self.fs.open_read(&path).and_then(hash_reader) {
            Ok(hash) if hash == file.file_hash => true,
            Ok(_) => {
                debug!("{} has the wrong hash", filename);
                false
            }
            Err(e) => {
                warn!("Could not read {}: {}", path.display(), e);
                false
            }
        }
    }
}

impl Controllable for Verifier {
    fn set_paused(&self, paused: bool) {
        self.control.set_paused(paused);
    }

    fn abort(&self) {
        self.control.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_system::DiskFileSystem;
    use crate::manifest::testing::TestBuild;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<BuildManifest>, BTreeSet<String>) {
        let tmp = TempDir::new().unwrap();
        let build = TestBuild::new("1.0")
            .chunk(1, 64)
            .file("a.bin", &[(1, 0, 16)])
            .file("b.bin", &[(1, 16, 16)])
            .file("c.bin", &[(1, 32, 32)]);
        for file in &build.files {
            std::fs::write(tmp.path().join(&file.filename), build.contents(&file.filename)).unwrap();
        }
        let manifest = Arc::new(build.build());
        let files = manifest.build_file_list().into_iter().collect();
        (tmp, manifest, files)
    }

    fn verifier(manifest: &Arc<BuildManifest>, tmp: &TempDir, mode: VerifyMode, touched: &[&str]) -> Verifier {
        Verifier::new(
            manifest.clone(),
            tmp.path().to_path_buf(),
            mode,
            touched.iter().map(|s| s.to_string()).collect(),
            Arc::new(DiskFileSystem::new()),
            Arc::new(BuildPatchProgress::new()),
        )
    }

    /// Same size, different content
    fn scramble(tmp: &TempDir, name: &str) {
        let path = tmp.path().join(name);
        let mut data = std::fs::read(&path).unwrap();
        data[0] ^= 0xFF;
        std::fs::write(path, data).unwrap();
    }

    #[test]
    fn test_sha_catches_content_changes() {
        let (tmp, manifest, files) = setup();
        scramble(&tmp, "b.bin");
        std::fs::remove_file(tmp.path().join("c.bin")).unwrap();

        let result = verifier(&manifest, &tmp, VerifyMode::ShaVerifyAllFiles, &[]).verify(&files);
        assert_eq!(result.corrupt, vec!["b.bin".to_string(), "c.bin".to_string()]);
        assert_eq!(result.checked, 3);
        assert!(!result.aborted);
    }

    #[test]
    fn test_size_mode_only_sees_size() {
        let (tmp, manifest, files) = setup();
        scramble(&tmp, "b.bin");
        std::fs::write(tmp.path().join("a.bin"), b"short").unwrap();

        let result = verifier(&manifest, &tmp, VerifyMode::FileSizeCheckAllFiles, &[]).verify(&files);
        assert_eq!(result.corrupt, vec!["a.bin".to_string()]);
    }

    #[test]
    fn test_touched_only_modes() {
        let (tmp, manifest, files) = setup();
        scramble(&tmp, "b.bin");
        scramble(&tmp, "c.bin");

        let result = verifier(&manifest, &tmp, VerifyMode::ShaVerifyTouchedFiles, &["c.bin"]).verify(&files);
        assert_eq!(result.corrupt, vec!["c.bin".to_string()]);
        assert_eq!(result.checked, 1);
    }

    #[test]
    fn test_abort_reports_incomplete() {
        let (tmp, manifest, files) = setup();
        let verifier = verifier(&manifest, &tmp, VerifyMode::ShaVerifyAllFiles, &[]);
        verifier.abort();
        let result = verifier.verify(&files);
        assert!(result.aborted);
        assert!(!result.is_ok());
    }
}
