//! End-to-end installer runs against a cloud root on local disk

use anyhow::Result;
use buildpatch::chunk::chunkdb::package_chunk_data;
use buildpatch::chunk::ChunkData;
use buildpatch::downloaders::{DownloadResponse, DownloadService, HttpDownloadService, RequestId};
use buildpatch::file_system::DiskFileSystem;
use buildpatch::hash::ShaHash;
use buildpatch::installer::{
    BuildPatchInstaller, InstallError, InstallerConfiguration, InstallerServices, TracingAnalytics, VerifyMode,
};
use buildpatch::manifest::{BuildManifest, ChunkId, ChunkInfo, ChunkPart, FileManifest, ManifestData};
use buildpatch::paths::chunk_location;
use buildpatch::platform::Platform;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Chunks per file; every chunk belongs to exactly one file
const CHUNKS_PER_FILE: usize = 2;
const CHUNK_SIZE: usize = 512;

/// A build published to a local cloud root
struct Published {
    manifest: Arc<BuildManifest>,
    contents: HashMap<String, Vec<u8>>,
    chunk_files: Vec<PathBuf>,
}

fn chunk_payload(n: usize) -> Vec<u8> {
    (0..CHUNK_SIZE).map(|i| (i * 7 + n * 13) as u8).collect()
}

fn publish(cloud: &Path, num_files: usize, extra: Option<(&str, Vec<u8>)>) -> Result<Published> {
    let mut files = Vec::new();
    let mut chunks = Vec::new();
    let mut contents = HashMap::new();
    let mut chunk_files = Vec::new();
    let cloud_root = cloud.to_string_lossy().into_owned();

    let mut add_file = |name: String, payloads: Vec<(ChunkId, Vec<u8>)>| -> Result<()> {
        let mut data = Vec::new();
        let mut parts = Vec::new();
        for (id, payload) in payloads {
            let chunk = ChunkData::new(id, payload.clone());
            let serialized = chunk.serialize(true)?;
            let info = ChunkInfo {
                guid: id,
                hash: chunk.rolling_hash(),
                sha_hash: chunk.sha_hash(),
                group_number: (id.0.as_u128() % 100) as u8,
                window_size: payload.len() as u32,
                file_size: serialized.len() as u64,
            };
            let path = PathBuf::from(chunk_location(&cloud_root, &info));
            std::fs::create_dir_all(path.parent().unwrap())?;
            std::fs::write(&path, serialized)?;
            chunk_files.push(path);
            parts.push(ChunkPart {
                guid: id,
                offset: 0,
                size: payload.len() as u32,
            });
            data.extend_from_slice(&payload);
            chunks.push(info);
        }
        files.push(FileManifest {
            filename: name.clone(),
            file_hash: ShaHash::of(&data),
            chunk_parts: parts,
            install_tags: Vec::new(),
            is_read_only: false,
            is_compressed: false,
            is_unix_executable: false,
        });
        contents.insert(name, data);
        Ok(())
    };

    for f in 0..num_files {
        let payloads = (0..CHUNKS_PER_FILE)
            .map(|c| {
                let n = f * CHUNKS_PER_FILE + c + 1;
                (ChunkId::from_u128(n as u128), chunk_payload(n))
            })
            .collect();
        add_file(format!("data/{:02}/file_{:03}.bin", f % 10, f), payloads)?;
    }
    let mut prereq = None;
    if let Some((name, payload)) = extra {
        add_file(name.to_string(), vec![(ChunkId::from_u128(0xFFFF), payload)])?;
        prereq = Some(name.to_string());
    }

    let manifest = BuildManifest::new(ManifestData {
        app_name: "Game".into(),
        build_version: "1.0".into(),
        prereq_name: prereq.as_ref().map(|_| "Game Redist".to_string()).unwrap_or_default(),
        prereq_path: prereq.unwrap_or_default(),
        prereq_ids: vec!["redist-1".into()],
        files,
        chunks,
        ..Default::default()
    })?;
    Ok(Published {
        manifest: Arc::new(manifest),
        contents,
        chunk_files,
    })
}

/// Delegates to the real service and counts requests
struct CountingDownloads {
    inner: HttpDownloadService,
    requests: AtomicUsize,
}

impl DownloadService for CountingDownloads {
    fn request_file(&self, url: &str, reply: Sender<DownloadResponse>) -> RequestId {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.inner.request_file(url, reply)
    }

    fn cancel_request(&self, request_id: RequestId) {
        self.inner.cancel_request(request_id);
    }
}

/// Never answers
#[derive(Default)]
struct SilentDownloads {
    next: AtomicU64,
}

impl DownloadService for SilentDownloads {
    fn request_file(&self, _url: &str, _reply: Sender<DownloadResponse>) -> RequestId {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    fn cancel_request(&self, _request_id: RequestId) {}
}

/// Records launches instead of running anything
#[derive(Default)]
struct RecordingPlatform {
    launches: Mutex<Vec<PathBuf>>,
}

impl Platform for RecordingPlatform {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn last_error(&self) -> i32 {
        0
    }

    fn set_os_error_dialogs(&self, _enabled: bool) {}

    fn exec_elevated_process(&self, exe: &Path, _args: &str) -> io::Result<i32> {
        self.launches.lock().unwrap().push(exe.to_path_buf());
        Ok(0)
    }
}

struct Env {
    tmp: TempDir,
}

impl Env {
    fn new() -> Self {
        Self {
            tmp: TempDir::new().unwrap(),
        }
    }

    fn cloud(&self) -> PathBuf {
        self.tmp.path().join("cloud")
    }

    fn install_dir(&self) -> PathBuf {
        self.tmp.path().join("install")
    }

    fn config(&self, build: &Published) -> InstallerConfiguration {
        let mut config = InstallerConfiguration::new(build.manifest.clone(), self.install_dir());
        config.cloud_directories = vec![self.cloud().to_string_lossy().into_owned()];
        config.machine_config_path = Some(self.tmp.path().join("machine.json"));
        config.settings.num_installer_retries = 3;
        config
    }

    fn services(&self, downloads: Arc<dyn DownloadService>, platform: Arc<dyn Platform>) -> InstallerServices {
        InstallerServices {
            fs: Arc::new(DiskFileSystem::new()),
            platform,
            downloads,
            analytics: Arc::new(TracingAnalytics),
            machine_config: None,
        }
    }

    fn counting(&self) -> Arc<CountingDownloads> {
        Arc::new(CountingDownloads {
            inner: HttpDownloadService::new().unwrap(),
            requests: AtomicUsize::new(0),
        })
    }

    fn install(&self, config: InstallerConfiguration, downloads: Arc<dyn DownloadService>) -> BuildPatchInstaller {
        let platform = Arc::new(RecordingPlatform::default());
        let installer = BuildPatchInstaller::new(config, self.services(downloads, platform)).on_complete(|_, _| {});
        installer.start().unwrap();
        installer.wait();
        installer
    }

    fn assert_installed(&self, build: &Published) {
        for (name, data) in &build.contents {
            let installed = std::fs::read(self.install_dir().join(name)).unwrap();
            assert_eq!(&installed, data, "{} differs", name);
        }
    }

    fn staged_files(&self, build: &Published, config: &InstallerConfiguration) -> usize {
        let staging = config.install_staging_directory();
        build
            .contents
            .iter()
            .filter(|(name, data)| std::fs::read(staging.join(name)).is_ok_and(|d| &d == *data))
            .count()
    }
}

fn scramble(path: &Path) {
    let mut data = std::fs::read(path).unwrap();
    data[10] ^= 0x5A;
    std::fs::write(path, data).unwrap();
}

#[test]
fn test_repair_rebuilds_only_corrupt_files() -> Result<()> {
    let env = Env::new();
    let build = publish(&env.cloud(), 100, None)?;

    let installer = env.install(env.config(&build), env.counting());
    assert!(!installer.has_error(), "{}", installer.error_code());
    env.assert_installed(&build);
    assert_eq!(installer.build_statistics().num_chunks_downloaded, 200);

    scramble(&env.install_dir().join("data/03/file_013.bin"));
    scramble(&env.install_dir().join("data/07/file_087.bin"));

    let mut config = env.config(&build);
    config.current_manifest = Some(build.manifest.clone());
    config.is_repair = true;
    let downloads = env.counting();
    let installer = env.install(config, downloads.clone());

    assert!(!installer.has_error(), "{}", installer.error_code());
    env.assert_installed(&build);
    let stats = installer.build_statistics();
    assert_eq!(stats.num_install_retries, 1);
    assert_eq!(stats.retry_failure_types, vec![InstallError::BuildVerifyFail]);
    assert_eq!(stats.retry_error_codes, vec!["BV01".to_string()]);
    assert_eq!(stats.num_files_outdated, 2);
    assert_eq!(downloads.requests.load(Ordering::SeqCst), 2 * CHUNKS_PER_FILE);
    Ok(())
}

#[test]
fn test_resume_does_not_refetch_staged_files() -> Result<()> {
    let env = Env::new();
    let build = publish(&env.cloud(), 100, None)?;

    // The last file's data is missing, so the first run fails after staging the rest
    let missing = build.chunk_files.last().unwrap().clone();
    let saved = std::fs::read(&missing)?;
    std::fs::remove_file(&missing)?;
    let mut config = env.config(&build);
    config.settings.max_retry_count = 2;
    let installer = env.install(config.clone(), env.counting());
    assert_eq!(installer.error_code(), "DL01");
    assert!(installer.is_resumable());
    assert!(!env.install_dir().join("data/00/file_000.bin").exists());

    let staged = env.staged_files(&build, &config);
    assert!(staged > 0);

    std::fs::write(&missing, saved)?;
    let downloads = env.counting();
    let installer = env.install(config, downloads.clone());
    assert!(!installer.has_error(), "{}", installer.error_code());
    env.assert_installed(&build);
    assert!(downloads.requests.load(Ordering::SeqCst) <= (100 - staged) * CHUNKS_PER_FILE);
    Ok(())
}

#[test]
fn test_cancel_stops_promptly() -> Result<()> {
    let env = Env::new();
    let build = publish(&env.cloud(), 20, None)?;
    let platform = Arc::new(RecordingPlatform::default());
    let installer = BuildPatchInstaller::new(
        env.config(&build),
        env.services(Arc::new(SilentDownloads::default()), platform),
    )
    .on_complete(|_, _| {});
    installer.start()?;
    std::thread::sleep(Duration::from_millis(300));
    assert!(!installer.is_complete());

    let cancelled_at = Instant::now();
    installer.cancel_install();
    installer.wait();
    assert!(cancelled_at.elapsed() < Duration::from_secs(2));

    assert!(installer.is_complete());
    assert!(installer.is_canceled());
    assert!(!installer.has_error());
    assert_eq!(installer.error_code(), "UC01");
    assert!(installer.build_statistics().retry_failure_types.is_empty());
    Ok(())
}

#[test]
fn test_install_from_chunkdb_only() -> Result<()> {
    let env = Env::new();
    let build = publish(&env.cloud(), 30, None)?;
    let output = env.tmp.path().join("media/build.chunkdb");
    let parts = package_chunk_data(&build.manifest, &env.cloud(), &output, 4 * 1024)?;
    assert!(parts.len() > 1);
    std::fs::remove_dir_all(env.cloud())?;

    let mut config = env.config(&build);
    config.cloud_directories.clear();
    config.chunk_database_files = parts;
    config.verify_mode = VerifyMode::ShaVerifyAllFiles;
    let downloads = env.counting();
    let installer = env.install(config, downloads.clone());

    assert!(!installer.has_error(), "{}", installer.error_code());
    env.assert_installed(&build);
    assert_eq!(downloads.requests.load(Ordering::SeqCst), 0);
    assert_eq!(installer.build_statistics().num_chunks_read_from_chunk_dbs, 60);
    Ok(())
}

#[test]
fn test_prerequisites_run_once() -> Result<()> {
    let env = Env::new();
    let build = publish(&env.cloud(), 3, Some(("Redist/setup.sh", b"#!/bin/sh\nexit 0\n".to_vec())))?;

    let run = |config: InstallerConfiguration| {
        let platform = Arc::new(RecordingPlatform::default());
        let installer = BuildPatchInstaller::new(config, env.services(env.counting(), platform.clone()))
            .on_complete(|_, _| {});
        installer.start().unwrap();
        let success = installer.wait();
        let launches = platform.launches.lock().unwrap().len();
        (success, launches)
    };

    let mut config = env.config(&build);
    config.run_required_prereqs = true;
    let (success, launches) = run(config.clone());
    assert!(success);
    assert_eq!(launches, 1);

    // Already recorded in the machine config
    config.current_manifest = Some(build.manifest.clone());
    let (success, launches) = run(config.clone());
    assert!(success);
    assert_eq!(launches, 0);

    // Repairs run it regardless
    config.is_repair = true;
    let (success, launches) = run(config);
    assert!(success);
    assert_eq!(launches, 1);
    Ok(())
}
