//! Applies manifest file attributes to installed files
//!
//! Only attributes that differ from what is on disk are changed, so running
//! attribution twice is a no-op the second time. A read-only file has its
//! flag cleared before anything else is touched and set again last.

use super::control::{ControlFlags, Controllable};
use super::progress::{BuildPatchProgress, BuildPatchState};
use crate::file_system::{FileAttributes, FileSystem};
use crate::manifest::BuildManifest;
use crate::paths::join_manifest_path;
use std::collections::{BTreeSet, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct FileAttribution {
    manifest: Arc<BuildManifest>,
    current: Option<Arc<BuildManifest>>,
    directory: PathBuf,
    touched: HashSet<String>,
    force: bool,
    fs: Arc<dyn FileSystem>,
    progress: Arc<BuildPatchProgress>,
    control: ControlFlags,
}

impl FileAttribution {
    /// `directory` is where the build lives: the install directory, or
    /// staging when nothing gets moved
    pub fn new(
        manifest: Arc<BuildManifest>,
        current: Option<Arc<BuildManifest>>,
        directory: PathBuf,
        touched: HashSet<String>,
        force: bool,
        fs: Arc<dyn FileSystem>,
        progress: Arc<BuildPatchProgress>,
    ) -> Self {
        Self {
            manifest,
            current,
            directory,
            touched,
            force,
            fs,
            progress,
            control: ControlFlags::new(),
        }
    }

    /// Whether a file's attributes may need work
    fn needs_attributes(&self, filename: &str) -> bool {
        if self.force || self.touched.contains(filename) {
            return true;
        }
        let wanted = self.manifest.file_manifest(filename).map(|f| f.attributes());
        let previous = self
            .current
            .as_ref()
            .and_then(|c| c.file_manifest(filename))
            .map(|f| f.attributes());
        wanted != previous
    }

    /// Apply attributes to `files`. Returns false if aborted part way.
    pub fn apply(&self, files: &BTreeSet<String>) -> bool {
        let total = files.len().max(1) as f32;
        for (done, filename) in files.iter().enumerate() {
            self.control.wait_while_paused();
            if self.control.is_aborted() {
                return false;
            }
            if self.needs_attributes(filename) {
                if let Some(file) = self.manifest.file_manifest(filename) {
                    let path = join_manifest_path(&self.directory, filename);
                    if let Err(e) = self.apply_file(&path, file.attributes()) {
                        warn!("Could not set attributes on {}: {}", path.display(), e);
                    }
                }
            }
            self.progress
                .set_state_progress(BuildPatchState::SettingAttributes, (done + 1) as f32 / total);
        }
        true
    }

    fn apply_file(&self, path: &Path, wanted: FileAttributes) -> io::Result<()> {
        if !self.fs.file_exists(path) {
            return Ok(());
        }
        let actual = self.fs.attributes(path)?;
        let compress = self.fs.supports_compression() && actual.compressed != wanted.compressed;
        let executable = actual.executable != wanted.executable;
        if !compress && !executable && actual.read_only == wanted.read_only {
            return Ok(());
        }
        debug!("Setting attributes on {}: {:?}", path.display(), wanted);

        let mut read_only = actual.read_only;
        if read_only {
            self.fs.set_read_only(path, false)?;
            read_only = false;
        }
        if compress {
            self.fs.set_compressed(path, wanted.compressed)?;
        }
        if executable {
            self.fs.set_executable(path, wanted.executable)?;
        }
        if read_only != wanted.read_only {
            self.fs.set_read_only(path, wanted.read_only)?;
        }
        Ok(())
    }
}

impl Controllable for FileAttribution {
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
    use crate::file_system::testing::TestFileSystem;
    use crate::manifest::testing::TestBuild;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn build() -> TestBuild {
        let mut build = TestBuild::new("1.0")
            .chunk(1, 32)
            .file("ro.txt", &[(1, 0, 8)])
            .file("run.sh", &[(1, 8, 8)])
            .file("packed.dat", &[(1, 16, 8)])
            .file("plain.txt", &[(1, 24, 8)]);
        build.file_mut("ro.txt").is_read_only = true;
        build.file_mut("run.sh").is_unix_executable = true;
        build.file_mut("packed.dat").is_compressed = true;
        build
    }

    fn setup() -> (TempDir, Arc<BuildManifest>, Arc<TestFileSystem>, BTreeSet<String>) {
        let tmp = TempDir::new().unwrap();
        let build = build();
        for file in &build.files {
            std::fs::write(tmp.path().join(&file.filename), build.contents(&file.filename)).unwrap();
        }
        let manifest = Arc::new(build.build());
        let files = manifest.build_file_list().into_iter().collect();
        (tmp, manifest, Arc::new(TestFileSystem::new()), files)
    }

    fn attribution(
        manifest: &Arc<BuildManifest>,
        current: Option<Arc<BuildManifest>>,
        dir: &Path,
        fs: &Arc<TestFileSystem>,
        force: bool,
    ) -> FileAttribution {
        FileAttribution::new(
            manifest.clone(),
            current,
            dir.to_path_buf(),
            HashSet::new(),
            force,
            fs.clone(),
            Arc::new(BuildPatchProgress::new()),
        )
    }

    #[test]
    fn test_second_pass_changes_nothing() {
        let (tmp, manifest, fs, files) = setup();

        assert!(attribution(&manifest, None, tmp.path(), &fs, true).apply(&files));
        assert_eq!(fs.attribute_sets.load(Ordering::SeqCst), 3);
        let ro = fs.attributes(&tmp.path().join("ro.txt")).unwrap();
        assert!(ro.read_only);
        assert!(fs.attributes(&tmp.path().join("run.sh")).unwrap().executable);
        assert!(fs.attributes(&tmp.path().join("packed.dat")).unwrap().compressed);

        fs.attribute_sets.store(0, Ordering::SeqCst);
        assert!(attribution(&manifest, None, tmp.path(), &fs, true).apply(&files));
        assert_eq!(fs.attribute_sets.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_read_only_cleared_first_and_restored_last() {
        let (tmp, mut manifest, fs, files) = setup();
        assert!(attribution(&manifest, None, tmp.path(), &fs, true).apply(&files));

        // ro.txt becomes read-only and executable
        let mut build = build();
        build.file_mut("ro.txt").is_unix_executable = true;
        manifest = Arc::new(build.build());
        fs.attribute_sets.store(0, Ordering::SeqCst);
        assert!(attribution(&manifest, None, tmp.path(), &fs, true).apply(&files));

        let ro = fs.attributes(&tmp.path().join("ro.txt")).unwrap();
        assert!(ro.read_only && ro.executable);
        assert_eq!(fs.attribute_sets.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_unchanged_untouched_files_are_skipped() {
        let (tmp, manifest, fs, files) = setup();
        let current = Arc::new(build().build());
        assert!(attribution(&manifest, Some(current), tmp.path(), &fs, false).apply(&files));
        assert_eq!(fs.attribute_sets.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_abort_stops_early() {
        let (tmp, manifest, fs, files) = setup();
        let attribution = attribution(&manifest, None, tmp.path(), &fs, true);
        attribution.abort();
        assert!(!attribution.apply(&files));
        assert_eq!(fs.attribute_sets.load(Ordering::SeqCst), 0);
    }
}
