//! buildpatch - chunk-based build installer and patcher
//!
//! Builds are described by a manifest of files assembled from content
//! addressed chunks. The installer fetches chunks from a previous install,
//! chunkdb archives or cloud roots and writes the new build next to the old
//! one before moving it into place.

pub mod chunk;
pub mod downloaders;
pub mod file_system;
pub mod hash;
pub mod installer;
pub mod manifest;
pub mod paths;
pub mod platform;
