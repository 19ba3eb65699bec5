//! File construction
//!
//! Files are written into the staging install directory part by part, in
//! manifest order, pulling each chunk from the chained source and releasing
//! the reference right after its data has been copied. The running SHA1 of
//! every file is compared with the manifest once the last part is written.
//!
//! Staged files left behind by an interrupted run are picked up again when
//! they belong to the same build: complete files with the right hash are
//! kept as they are, partial files continue from their last whole part.

use super::analytics::InstallerAnalytics;
use super::control::{ControlFlags, Controllable};
use super::error::{codes, InstallError, InstallerError};
use super::progress::{BuildPatchProgress, BuildPatchState};
use super::reference_tracker::ChunkReferenceTracker;
use super::sources::ChunkSource;
use super::statistics::InstallerStatistics;
use crate::file_system::{is_out_of_space, FileSystem};
use crate::hash::{hash_reader, ShaHash};
use crate::manifest::{BuildManifest, ChunkId};
use crate::paths::join_manifest_path;
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where construction of one file starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile {
    pub filename: String,
    /// Index of the first part still to write
    pub first_part: usize,
    /// Bytes already present in the staged file
    pub resume_offset: u64,
}

/// The files one construction pass writes, in order
#[derive(Debug, Clone, Default)]
pub struct ConstructionPlan {
    pub files: Vec<PlannedFile>,
    /// Staged files that were already complete and correct
    pub already_staged: Vec<String>,
}

impl ConstructionPlan {
    /// Plan construction of `files` into `staging_dir`.
    ///
    /// With `trust_staged`, files staged by an earlier run of the same build
    /// are kept or resumed instead of being rebuilt.
    pub fn new<'a>(
        manifest: &BuildManifest,
        fs: &dyn FileSystem,
        staging_dir: &Path,
        files: impl IntoIterator<Item = &'a String>,
        trust_staged: bool,
    ) -> Self {
        let mut plan = Self::default();
        for filename in files {
            let Some(file) = manifest.file_manifest(filename) else {
                plan.files.push(PlannedFile {
                    filename: filename.clone(),
                    first_part: 0,
                    resume_offset: 0,
                });
                continue;
            };
            let path = join_manifest_path(staging_dir, filename);
            let staged = if trust_staged { fs.file_size(&path) } else { None };

            let (first_part, resume_offset) = match staged {
                Some(size) if size == file.file_size() => {
                    let intact = fs
                        .open_read(&path)
                        .and_then(hash_reader)
                        .is_ok_and(|hash| hash == file.file_hash);
                    if intact {
                        debug!("Keeping staged file {}", filename);
                        plan.already_staged.push(filename.clone());
                        continue;
                    }
                    (0, 0)
                }
                Some(size) if size < file.file_size() => file
                    .parts_with_offsets()
                    .enumerate()
                    .take_while(|(_, (offset, part))| offset + part.size as u64 <= size)
                    .last()
                    .map(|(index, (offset, part))| (index + 1, offset + part.size as u64))
                    .unwrap_or((0, 0)),
                _ => (0, 0),
            };
            if resume_offset > 0 {
                debug!("Resuming {} at {} bytes", filename, resume_offset);
            }
            plan.files.push(PlannedFile {
                filename: filename.clone(),
                first_part,
                resume_offset,
            });
        }
        plan
    }

    /// Chunk references in the order construction consumes them
    pub fn references(&self, manifest: &BuildManifest) -> Vec<ChunkId> {
        self.files
            .iter()
            .filter_map(|planned| {
                manifest
                    .file_manifest(&planned.filename)
                    .map(|file| file.chunk_parts[planned.first_part.min(file.chunk_parts.len())..].iter().map(|p| p.guid))
            })
            .flatten()
            .collect()
    }

    pub fn referenced_chunks(&self, manifest: &BuildManifest) -> HashSet<ChunkId> {
        self.references(manifest).into_iter().collect()
    }

    /// Bytes left to write
    pub fn remaining_bytes(&self, manifest: &BuildManifest) -> u64 {
        self.files
            .iter()
            .map(|planned| manifest.file_size(&planned.filename).saturating_sub(planned.resume_offset))
            .sum()
    }
}

/// Outcome of one construction pass
#[derive(Debug, Default, Clone)]
pub struct ConstructionResult {
    /// Files now complete in staging, including ones kept from a prior run
    pub constructed: Vec<String>,
    /// Files whose output did not match the manifest hash
    pub failed: Vec<String>,
}

pub struct FileConstructor {
    staging_dir: PathBuf,
    manifest: Arc<BuildManifest>,
    fs: Arc<dyn FileSystem>,
    source: Arc<dyn ChunkSource>,
    tracker: Arc<ChunkReferenceTracker>,
    error: Arc<InstallerError>,
    stats: Arc<InstallerStatistics>,
    analytics: Arc<InstallerAnalytics>,
    progress: Arc<BuildPatchProgress>,
    control: ControlFlags,
}

/// Why a file could not be finished
enum FileFailure {
    /// Stop the pass, the error latch says why
    Fatal,
    /// Written but wrong, carry on with the next file
    Corrupt,
}

impl FileConstructor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        staging_dir: PathBuf,
        manifest: Arc<BuildManifest>,
        fs: Arc<dyn FileSystem>,
        source: Arc<dyn ChunkSource>,
        tracker: Arc<ChunkReferenceTracker>,
        error: Arc<InstallerError>,
        stats: Arc<InstallerStatistics>,
        analytics: Arc<InstallerAnalytics>,
        progress: Arc<BuildPatchProgress>,
    ) -> Self {
        Self {
            staging_dir,
            manifest,
            fs,
            source,
            tracker,
            error,
            stats,
            analytics,
            progress,
            control: ControlFlags::new(),
        }
    }

    fn should_stop(&self) -> bool {
        self.control.is_aborted() || self.error.has_error()
    }

    /// Build every planned file. Stops at the first fatal error; hash
    /// mismatches are collected and reported once the pass is over.
    pub fn run(&self, plan: &ConstructionPlan) -> ConstructionResult {
        let mut result = ConstructionResult {
            constructed: plan.already_staged.clone(),
            failed: Vec::new(),
        };
        let total = plan.remaining_bytes(&self.manifest).max(1);
        let mut written = 0u64;
        info!("Constructing {} files ({} bytes)", plan.files.len(), total);

        for planned in &plan.files {
            self.control.wait_while_paused();
            if self.should_stop() {
                break;
            }
            match self.construct_file(planned, &mut written, total) {
                Ok(()) => result.constructed.push(planned.filename.clone()),
                Err(FileFailure::Corrupt) => result.failed.push(planned.filename.clone()),
                Err(FileFailure::Fatal) => break,
            }
        }

        if !result.failed.is_empty() {
            warn!("{} file(s) failed construction", result.failed.len());
            self.error
                .set_error(InstallError::FileConstructionFail, codes::CONSTRUCTION_OUTBOUND_CORRUPT);
        }
        result
    }

    fn construct_file(&self, planned: &PlannedFile, written: &mut u64, total: u64) -> Result<(), FileFailure> {
        let Some(file) = self.manifest.file_manifest(&planned.filename) else {
            warn!("No file info for {}", planned.filename);
            self.error
                .set_error(InstallError::FileConstructionFail, codes::CONSTRUCTION_MISSING_FILE_INFO);
            return Err(FileFailure::Fatal);
        };
        let path = join_manifest_path(&self.staging_dir, &file.filename);
        let needed = file.file_size().saturating_sub(planned.resume_offset);

        if let Some(free) = self.fs.available_space(&self.staging_dir) {
            if free < needed {
                self.error.set_error_with_text(
                    InstallError::OutOfDiskSpace,
                    codes::DISK_SPACE_DURING_INSTALLATION,
                    Some(format!(
                        "Not enough space to construct {}: {} bytes needed, {} available.",
                        file.filename, needed, free
                    )),
                );
                return Err(FileFailure::Fatal);
            }
        }

        let mut hasher = Sha1::new();
        let writer = match self.open_output(&path, planned.resume_offset, &mut hasher) {
            Ok(writer) => writer,
            Err(e) => {
                warn!("Could not create {}: {}", path.display(), e);
                self.analytics
                    .record_construction_error(&file.filename, e.raw_os_error().unwrap_or(0), "Could not create file");
                let (kind, code) = if is_out_of_space(&e) {
                    (InstallError::OutOfDiskSpace, codes::DISK_SPACE_WRITE_FAILED)
                } else {
                    (InstallError::FileConstructionFail, codes::CONSTRUCTION_FILE_CREATE_FAIL)
                };
                self.error.set_error(kind, code);
                return Err(FileFailure::Fatal);
            }
        };
        let mut writer = BufWriter::new(writer);

        for (_, part) in file.parts_with_offsets().skip(planned.first_part) {
            self.control.wait_while_paused();
            if self.should_stop() {
                return Err(FileFailure::Fatal);
            }

            let mut write_result: io::Result<()> = Ok(());
            let found = self.source.get(&part.guid, &mut |chunk| {
                let start = part.offset as usize;
                let end = start + part.size as usize;
                write_result = match chunk.data().get(start..end) {
                    Some(bytes) => {
                        hasher.update(bytes);
                        writer.write_all(bytes)
                    }
                    None => Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("chunk {} holds {} bytes, part needs {}..{}", chunk.id(), chunk.len(), start, end),
                    )),
                };
            });

            if !found {
                if !self.should_stop() {
                    warn!("Chunk {} for {} could not be found", part.guid, file.filename);
                    self.analytics
                        .record_construction_error(&file.filename, 0, "Missing chunk data");
                    self.error
                        .set_error(InstallError::FileConstructionFail, codes::CONSTRUCTION_MISSING_CHUNK_DATA);
                }
                return Err(FileFailure::Fatal);
            }
            if let Err(e) = write_result {
                self.fail_write(&file.filename, &e);
                return Err(FileFailure::Fatal);
            }

            self.tracker.pop_reference(&part.guid);
            self.stats.on_bytes_constructed(part.size as u64);
            *written += part.size as u64;
            self.progress
                .set_state_progress(BuildPatchState::Installing, (*written as f64 / total as f64).min(1.0) as f32);
        }

        if let Err(e) = writer.flush() {
            self.fail_write(&file.filename, &e);
            return Err(FileFailure::Fatal);
        }
        drop(writer);

        if ShaHash::from_hasher(hasher) != file.file_hash {
            warn!("Constructed {} does not match its manifest hash", file.filename);
            self.analytics
                .record_construction_error(&file.filename, 0, "Serialised Verify Fail");
            if let Err(e) = self.fs.delete_file(&path) {
                debug!("Could not delete corrupt {}: {}", path.display(), e);
            }
            return Err(FileFailure::Corrupt);
        }

        self.stats.on_file_constructed(file.file_size());
        Ok(())
    }

    /// Create the output file, or reopen a partial one and hash what it holds
    fn open_output(&self, path: &Path, resume_offset: u64, hasher: &mut Sha1) -> io::Result<Box<dyn crate::file_system::WriteSeek>> {
        if resume_offset == 0 {
            return self.fs.create_write(path);
        }
        let mut prefix = self.fs.open_read(path)?.take(resume_offset);
        io::copy(&mut prefix, hasher)?;
        let mut writer = self.fs.open_write(path)?;
        writer.seek(SeekFrom::Start(resume_offset))?;
        Ok(writer)
    }

    fn fail_write(&self, filename: &str, e: &io::Error) {
        warn!("Writing {} failed: {}", filename, e);
        self.analytics
            .record_construction_error(filename, e.raw_os_error().unwrap_or(0), "Write failed");
        let (kind, code) = if is_out_of_space(e) {
            (InstallError::OutOfDiskSpace, codes::DISK_SPACE_WRITE_FAILED)
        } else {
            (InstallError::FileConstructionFail, codes::CONSTRUCTION_OUTBOUND_DATA_ERROR)
        };
        self.error.set_error(kind, code);
    }
}

impl Controllable for FileConstructor {
    fn set_paused(&self, paused: bool) {
        self.control.set_paused(paused);
    }

    fn abort(&self) {
        self.control.abort();
    }
}
