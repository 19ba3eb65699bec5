//! File system capability used by every installer component
//!
//! Components never call `std::fs` directly for build data; they go through
//! [`FileSystem`] so tests can substitute an in-memory or counting variant.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Readable, seekable file handle
pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

/// Writable, seekable file handle
pub trait WriteSeek: Write + Seek + Send {}
impl<T: Write + Seek + Send> WriteSeek for T {}

/// Attribute bits the installer manages on build files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileAttributes {
    pub read_only: bool,
    pub executable: bool,
    pub compressed: bool,
}

/// Abstract file IO
pub trait FileSystem: Send + Sync {
    /// Open an existing file for reading
    fn open_read(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>>;

    /// Create (or truncate) a file for writing, creating parent directories
    fn create_write(&self, path: &Path) -> io::Result<Box<dyn WriteSeek>>;

    /// Open an existing file for writing without truncating it
    fn open_write(&self, path: &Path) -> io::Result<Box<dyn WriteSeek>>;

    /// Size of a file, `None` if it does not exist
    fn file_size(&self, path: &Path) -> Option<u64>;

    fn file_exists(&self, path: &Path) -> bool;

    fn delete_file(&self, path: &Path) -> io::Result<()>;

    /// Move a file, replacing any existing destination
    fn move_file(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn copy_file(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn make_dirs(&self, path: &Path) -> io::Result<()>;

    /// Delete a directory and everything below it. A missing directory is fine.
    fn delete_directory(&self, path: &Path) -> io::Result<()>;

    /// Remove empty directories below `root`, leaving `root` itself.
    /// Returns how many were removed.
    fn remove_empty_directories(&self, root: &Path) -> usize;

    fn attributes(&self, path: &Path) -> io::Result<FileAttributes>;

    fn set_read_only(&self, path: &Path, read_only: bool) -> io::Result<()>;

    fn set_executable(&self, path: &Path, executable: bool) -> io::Result<()>;

    fn set_compressed(&self, path: &Path, compressed: bool) -> io::Result<()>;

    /// Whether the compressed attribute means anything on this file system
    fn supports_compression(&self) -> bool;

    /// Free bytes on the volume holding `path`, if known
    fn available_space(&self, path: &Path) -> Option<u64>;
}

/// [`FileSystem`] backed by the local disk
#[derive(Debug, Default, Clone, Copy)]
pub struct DiskFileSystem;

impl DiskFileSystem {
    pub fn new() -> Self {
        Self
    }
}

fn ensure_parent(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

impl FileSystem for DiskFileSystem {
    fn open_read(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>> {
        Ok(Box::new(File::open(path)?))
    }

    fn create_write(&self, path: &Path) -> io::Result<Box<dyn WriteSeek>> {
        ensure_parent(path)?;
        Ok(Box::new(File::create(path)?))
    }

    fn open_write(&self, path: &Path) -> io::Result<Box<dyn WriteSeek>> {
        Ok(Box::new(OpenOptions::new().write(true).open(path)?))
    }

    fn file_size(&self, path: &Path) -> Option<u64> {
        fs::metadata(path).ok().filter(|m| m.is_file()).map(|m| m.len())
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn delete_file(&self, path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                // Read-only files refuse deletion on some platforms
                if let Ok(meta) = fs::metadata(path) {
                    let mut perms = meta.permissions();
                    if perms.readonly() {
                        #[allow(clippy::permissions_set_readonly_false)]
                        perms.set_readonly(false);
                        fs::set_permissions(path, perms)?;
                        return fs::remove_file(path);
                    }
                }
                Err(e)
            }
        }
    }

    fn move_file(&self, from: &Path, to: &Path) -> io::Result<()> {
        ensure_parent(to)?;
        fs::rename(from, to)
    }

    fn copy_file(&self, from: &Path, to: &Path) -> io::Result<()> {
        ensure_parent(to)?;
        reflink_copy::reflink_or_copy(from, to).map(|_| ())
    }

    fn make_dirs(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn delete_directory(&self, path: &Path) -> io::Result<()> {
        match fs::remove_dir_all(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn remove_empty_directories(&self, root: &Path) -> usize {
        let mut removed = 0;
        for entry in WalkDir::new(root)
            .min_depth(1)
            .contents_first(true)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            // Non-empty directories refuse removal
            if entry.file_type().is_dir() && fs::remove_dir(entry.path()).is_ok() {
                debug!("Removed empty directory {}", entry.path().display());
                removed += 1;
            }
        }
        removed
    }

    fn attributes(&self, path: &Path) -> io::Result<FileAttributes> {
        let meta = fs::metadata(path)?;
        Ok(FileAttributes {
            read_only: meta.permissions().readonly(),
            executable: is_executable(&meta),
            compressed: false,
        })
    }

    fn set_read_only(&self, path: &Path, read_only: bool) -> io::Result<()> {
        let mut perms = fs::metadata(path)?.permissions();
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(read_only);
        fs::set_permissions(path, perms)
    }

    fn set_executable(&self, path: &Path, executable: bool) -> io::Result<()> {
        set_executable_bits(path, executable)
    }

    fn set_compressed(&self, path: &Path, compressed: bool) -> io::Result<()> {
        debug!(
            "Compression attribute not supported here, ignoring {} for {}",
            compressed,
            path.display()
        );
        Ok(())
    }

    fn supports_compression(&self) -> bool {
        false
    }

    fn available_space(&self, path: &Path) -> Option<u64> {
        let target = existing_ancestor(path)?;
        let target = target.canonicalize().unwrap_or(target);
        let disks = sysinfo::Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    }
}

/// Walk up until we find a path that exists
fn existing_ancestor(path: &Path) -> Option<PathBuf> {
    let mut current = Some(path);
    while let Some(candidate) = current {
        if candidate.exists() {
            return Some(candidate.to_path_buf());
        }
        current = candidate.parent();
    }
    None
}

#[cfg(unix)]
fn is_executable(meta: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &fs::Metadata) -> bool {
    false
}

#[cfg(unix)]
fn set_executable_bits(path: &Path, executable: bool) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    let mode = perms.mode();
    let new_mode = if executable { mode | 0o111 } else { mode & !0o111 };
    perms.set_mode(new_mode);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn set_executable_bits(_path: &Path, _executable: bool) -> io::Result<()> {
    Ok(())
}

/// Whether an IO error means the disk is full
pub fn is_out_of_space(error: &io::Error) -> bool {
    error.raw_os_error() == Some(libc::ENOSPC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::SeekFrom;
    use tempfile::TempDir;

    #[test]
    fn test_create_write_makes_parents() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let fs = DiskFileSystem::new();
        let path = tmp.path().join("a/b/c.bin");

        let mut writer = fs.create_write(&path)?;
        writer.write_all(b"hello")?;
        drop(writer);

        assert_eq!(fs.file_size(&path), Some(5));
        assert!(fs.file_exists(&path));
        Ok(())
    }

    #[test]
    fn test_open_write_keeps_contents() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let fs = DiskFileSystem::new();
        let path = tmp.path().join("file.bin");
        fs::write(&path, b"0123456789")?;

        let mut writer = fs.open_write(&path)?;
        writer.seek(SeekFrom::Start(5))?;
        writer.write_all(b"abc")?;
        drop(writer);

        assert_eq!(fs::read(&path)?, b"01234abc89");
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_executable_and_read_only_attributes() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let fs = DiskFileSystem::new();
        let path = tmp.path().join("tool");
        fs::write(&path, b"#!/bin/sh")?;

        fs.set_executable(&path, true)?;
        assert!(fs.attributes(&path)?.executable);

        fs.set_read_only(&path, true)?;
        assert!(fs.attributes(&path)?.read_only);

        // Deleting still works on read-only files
        fs.delete_file(&path)?;
        assert!(!fs.file_exists(&path));
        Ok(())
    }

    #[test]
    fn test_directory_removal() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let fs = DiskFileSystem::new();
        fs::create_dir_all(tmp.path().join("a/b/c"))?;
        fs::create_dir_all(tmp.path().join("d"))?;
        fs::write(tmp.path().join("d/file"), b"x")?;

        assert_eq!(fs.remove_empty_directories(tmp.path()), 3);
        assert!(!tmp.path().join("a").exists());
        assert!(tmp.path().join("d/file").exists());
        assert!(tmp.path().exists());

        fs.delete_directory(&tmp.path().join("d"))?;
        assert!(!tmp.path().join("d").exists());
        fs.delete_directory(&tmp.path().join("d"))?;
        Ok(())
    }

    #[test]
    fn test_delete_missing_file_is_ok() {
        let fs = DiskFileSystem::new();
        assert!(fs.delete_file(Path::new("/definitely/not/here.bin")).is_ok());
    }
}

/// Instrumented file system for component tests
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashSet;
    use std::io::SeekFrom;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Disk-backed [`FileSystem`] that can pretend its media went away,
    /// emulates the compressed attribute and records deletions
    #[derive(Default)]
    pub(crate) struct TestFileSystem {
        inner: DiskFileSystem,
        pub offline: Arc<AtomicBool>,
        pub refuse_deletes: AtomicBool,
        pub deleted_directories: Mutex<Vec<PathBuf>>,
        pub attribute_sets: AtomicUsize,
        pub free_space: Mutex<Option<u64>>,
        compressed: Mutex<HashSet<PathBuf>>,
    }

    impl TestFileSystem {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::SeqCst);
        }

        fn check_deletable(&self, path: &Path) -> io::Result<()> {
            if self.refuse_deletes.load(Ordering::SeqCst) {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("{} is locked", path.display()),
                ));
            }
            Ok(())
        }

        fn check_online(&self) -> io::Result<()> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "media removed"));
            }
            Ok(())
        }
    }

    /// Reader that fails while its file system is offline
    struct MediaReader {
        inner: Box<dyn ReadSeek>,
        offline: Arc<AtomicBool>,
    }

    impl Read for MediaReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "media removed"));
            }
            self.inner.read(buf)
        }
    }

    impl Seek for MediaReader {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    impl FileSystem for TestFileSystem {
        fn open_read(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>> {
            self.check_online()?;
            Ok(Box::new(MediaReader {
                inner: self.inner.open_read(path)?,
                offline: self.offline.clone(),
            }))
        }

        fn create_write(&self, path: &Path) -> io::Result<Box<dyn WriteSeek>> {
            self.inner.create_write(path)
        }

        fn open_write(&self, path: &Path) -> io::Result<Box<dyn WriteSeek>> {
            self.inner.open_write(path)
        }

        fn file_size(&self, path: &Path) -> Option<u64> {
            self.inner.file_size(path)
        }

        fn file_exists(&self, path: &Path) -> bool {
            self.inner.file_exists(path)
        }

        fn delete_file(&self, path: &Path) -> io::Result<()> {
            self.check_deletable(path)?;
            self.compressed.lock().unwrap().remove(path);
            self.inner.delete_file(path)
        }

        fn move_file(&self, from: &Path, to: &Path) -> io::Result<()> {
            self.inner.move_file(from, to)
        }

        fn copy_file(&self, from: &Path, to: &Path) -> io::Result<()> {
            self.inner.copy_file(from, to)
        }

        fn make_dirs(&self, path: &Path) -> io::Result<()> {
            self.inner.make_dirs(path)
        }

        fn delete_directory(&self, path: &Path) -> io::Result<()> {
            self.check_deletable(path)?;
            self.deleted_directories.lock().unwrap().push(path.to_path_buf());
            self.inner.delete_directory(path)
        }

        fn remove_empty_directories(&self, root: &Path) -> usize {
            self.inner.remove_empty_directories(root)
        }

        fn attributes(&self, path: &Path) -> io::Result<FileAttributes> {
            let mut attributes = self.inner.attributes(path)?;
            attributes.compressed = self.compressed.lock().unwrap().contains(path);
            Ok(attributes)
        }

        fn set_read_only(&self, path: &Path, read_only: bool) -> io::Result<()> {
            self.attribute_sets.fetch_add(1, Ordering::SeqCst);
            self.inner.set_read_only(path, read_only)
        }

        fn set_executable(&self, path: &Path, executable: bool) -> io::Result<()> {
            self.attribute_sets.fetch_add(1, Ordering::SeqCst);
            self.inner.set_executable(path, executable)
        }

        fn set_compressed(&self, path: &Path, compressed: bool) -> io::Result<()> {
            self.attribute_sets.fetch_add(1, Ordering::SeqCst);
            let mut set = self.compressed.lock().unwrap();
            if compressed {
                set.insert(path.to_path_buf());
            } else {
                set.remove(path);
            }
            Ok(())
        }

        fn supports_compression(&self) -> bool {
            true
        }

        fn available_space(&self, _path: &Path) -> Option<u64> {
            *self.free_space.lock().unwrap()
        }
    }
}
