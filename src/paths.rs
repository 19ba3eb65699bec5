//! Path handling for manifest paths, cloud chunk locations and staging areas
//!
//! Build manifests store file names with either separator style. This module handles:
//! - Converting `\` to `/` before touching the local filesystem
//! - Building the cloud location of a chunk from its manifest info
//! - The well-known files and folders the installer keeps in its directories

use std::path::{Path, PathBuf};

use crate::manifest::{ChunkId, ChunkInfo};

/// Marker written to the install directory while staged files are being moved in
pub const MOVE_MARKER_FILE: &str = "$movedMarker";

/// Records which build the staged install files belong to
pub const RESUME_DATA_FILE: &str = "$resumeData";

/// Staging subfolder holding disk-overflow chunk data
pub const PATCH_DATA_DIR: &str = "PatchData";

/// Staging subfolder holding constructed files before they are moved
pub const INSTALL_STAGING_DIR: &str = "Install";

/// Versioned subfolder of a cloud root holding chunk files
pub const CHUNKS_FOLDER: &str = "ChunksV3";

/// Longest path we are willing to create
#[cfg(windows)]
pub const MAX_FILEPATH_LENGTH: usize = 260;
#[cfg(not(windows))]
pub const MAX_FILEPATH_LENGTH: usize = 4096;

/// Convert Windows path separators to native ones
/// `Engine\Binaries\game.exe` -> `Engine/Binaries/game.exe`
pub fn to_native_path(path: &str) -> String {
    path.replace('\\', "/")
}

/// Join a base path with a manifest-relative path
pub fn join_manifest_path(base: &Path, relative: &str) -> PathBuf {
    base.join(to_native_path(relative).trim_start_matches('/'))
}

/// Whether the joined path would exceed the platform path limit
pub fn exceeds_max_path(base: &Path, relative: &str) -> bool {
    join_manifest_path(base, relative).as_os_str().len() >= MAX_FILEPATH_LENGTH
}

/// Location of a chunk below a cloud root.
///
/// Works for both URLs and local directories:
/// `<root>/ChunksV3/<group>/<HASH>_<GUID>.chunk`
pub fn chunk_location(cloud_root: &str, info: &ChunkInfo) -> String {
    format!(
        "{}/{}/{:02}/{:016X}_{}.chunk",
        cloud_root.trim_end_matches(['/', '\\']),
        CHUNKS_FOLDER,
        info.group_number,
        info.hash,
        info.guid
    )
}

/// Whether a cloud root or location should be fetched over HTTP
pub fn is_http_location(location: &str) -> bool {
    let lower = location.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// File used by the disk overflow store for a chunk
pub fn overflow_chunk_path(dir: &Path, id: &ChunkId) -> PathBuf {
    dir.join(format!("{}.chunk", id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ShaHash;

    #[test]
    fn test_to_native_path() {
        assert_eq!(to_native_path("Engine\\Binaries\\game.exe"), "Engine/Binaries/game.exe");
        assert_eq!(to_native_path("already/native/path"), "already/native/path");
        assert_eq!(to_native_path("mixed\\path/style"), "mixed/path/style");
    }

    #[test]
    fn test_join_manifest_path() {
        let base = Path::new("/install");
        assert_eq!(
            join_manifest_path(base, "Content\\Paks\\data.pak"),
            PathBuf::from("/install/Content/Paks/data.pak")
        );
        assert_eq!(join_manifest_path(base, "/leading.txt"), PathBuf::from("/install/leading.txt"));
    }

    #[test]
    fn test_chunk_location() {
        let info = ChunkInfo {
            guid: ChunkId::from_u128(0x0123_4567_89AB_CDEF_0011_2233_4455_6677),
            hash: 0xDEAD_BEEF,
            sha_hash: ShaHash::default(),
            group_number: 7,
            window_size: 1024,
            file_size: 100,
        };
        assert_eq!(
            chunk_location("https://cdn.example.com/builds/", &info),
            "https://cdn.example.com/builds/ChunksV3/07/00000000DEADBEEF_0123456789ABCDEF0011223344556677.chunk"
        );
    }

    #[test]
    fn test_is_http_location() {
        assert!(is_http_location("https://cdn.example.com"));
        assert!(is_http_location("HTTP://cdn.example.com"));
        assert!(!is_http_location("/mnt/cloud"));
        assert!(!is_http_location("C:\\cloud"));
    }

    #[test]
    fn test_exceeds_max_path() {
        let long_name = "a".repeat(MAX_FILEPATH_LENGTH);
        assert!(exceeds_max_path(Path::new("/install"), &long_name));
        assert!(!exceeds_max_path(Path::new("/install"), "short.txt"));
    }
}
