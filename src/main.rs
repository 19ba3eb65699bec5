//! buildpatch - chunk-based build installer and patcher

use anyhow::{bail, Context, Result};
use buildpatch::chunk::chunkdb::package_chunk_data;
use buildpatch::file_system::DiskFileSystem;
use buildpatch::installer::verifier::Verifier;
use buildpatch::installer::{
    BuildPatchInstaller, BuildPatchProgress, BuildPatchSettings, ChunkSourceEvent, ChunkSourceEventType,
    InstallerConfiguration, InstallerServices, MessageHandler, VerifyMode,
};
use buildpatch::manifest::BuildManifest;
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Resolution of the progress bar
const PROGRESS_STEPS: u64 = 1000;

#[derive(Parser)]
#[command(name = "buildpatch")]
#[command(version)]
#[command(about = "Chunk-based build installer and patcher")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum VerifyArg {
    /// SHA1 of every file
    ShaAll,
    /// SHA1 of files written by this run
    ShaTouched,
    /// Size of every file
    SizeAll,
    /// Size of files written by this run
    SizeTouched,
}

impl From<VerifyArg> for VerifyMode {
    fn from(arg: VerifyArg) -> Self {
        match arg {
            VerifyArg::ShaAll => VerifyMode::ShaVerifyAllFiles,
            VerifyArg::ShaTouched => VerifyMode::ShaVerifyTouchedFiles,
            VerifyArg::SizeAll => VerifyMode::FileSizeCheckAllFiles,
            VerifyArg::SizeTouched => VerifyMode::FileSizeCheckTouchedFiles,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Install, patch or repair a build
    Install {
        /// Manifest of the build to install
        manifest: PathBuf,

        /// Installation target directory
        #[arg(short, long)]
        install_dir: PathBuf,

        /// Manifest of the build currently installed, for patching
        #[arg(long)]
        current: Option<PathBuf>,

        /// Cloud root holding ChunksV3 (URL or directory). Repeatable.
        #[arg(long = "cloud")]
        cloud: Vec<String>,

        /// Chunkdb file to read chunks from. Repeatable.
        #[arg(long = "chunkdb")]
        chunkdb: Vec<PathBuf>,

        /// Staging directory (default: hidden folder in the install directory)
        #[arg(long)]
        staging_dir: Option<PathBuf>,

        /// Where modified files are backed up before being replaced
        #[arg(long)]
        backup_dir: Option<PathBuf>,

        /// Install tag to select. Repeatable; none selects everything.
        #[arg(long = "tag")]
        tags: Vec<String>,

        /// Verification performed after installing
        #[arg(long, value_enum, default_value = "size-touched")]
        verify: VerifyArg,

        /// Verify everything and rebuild what is broken
        #[arg(long)]
        repair: bool,

        /// Only construct into staging, leave the install directory alone
        #[arg(long)]
        stage_only: bool,

        /// Run the build's prerequisite installer
        #[arg(long)]
        prereqs: bool,

        /// Settings file (default: settings.json in the user config dir)
        #[arg(long)]
        settings: Option<PathBuf>,
    },

    /// Package a build's chunks into chunkdb files
    PackageChunks {
        /// Manifest of the build
        manifest: PathBuf,

        /// Cloud directory holding the build's ChunksV3
        #[arg(long)]
        cloud_dir: PathBuf,

        /// Output file; extra parts get a numeric suffix
        #[arg(short, long)]
        output: PathBuf,

        /// Maximum size of each part in bytes
        #[arg(long, default_value = "4294967296")]
        max_size: u64,
    },

    /// Show information about a build manifest
    Info {
        /// Manifest of the build
        manifest: PathBuf,
    },

    /// Verify an installed build against its manifest
    Verify {
        /// Manifest of the build
        manifest: PathBuf,

        /// Installation directory
        #[arg(short, long)]
        install_dir: PathBuf,

        /// Compare SHA1 hashes instead of only sizes
        #[arg(long)]
        sha: bool,
    },
}

/// Prints chunk source events above the progress bar
struct ConsoleEvents {
    bar: ProgressBar,
}

impl MessageHandler for ConsoleEvents {
    fn handle_chunk_source_event(&self, event: &ChunkSourceEvent) {
        match event.event {
            ChunkSourceEventType::AccessLost => {
                self.bar.println(format!("Lost access to {}", event.location))
            }
            ChunkSourceEventType::AccessRegained => {
                self.bar.println(format!("Regained access to {}", event.location))
            }
        }
    }
}

fn load_manifest(path: &PathBuf) -> Result<Arc<BuildManifest>> {
    Ok(Arc::new(
        BuildManifest::load(path).with_context(|| format!("Failed to load manifest {}", path.display()))?,
    ))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Only initialize logging if verbose or RUST_LOG is set
    if cli.verbose || std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(if cli.verbose {
                    "buildpatch=debug".parse()?
                } else {
                    "buildpatch=warn".parse()?
                }),
            )
            .init();
    }

    match cli.command {
        Commands::Install {
            manifest,
            install_dir,
            current,
            cloud,
            chunkdb,
            staging_dir,
            backup_dir,
            tags,
            verify,
            repair,
            stage_only,
            prereqs,
            settings,
        } => {
            if cloud.is_empty() && chunkdb.is_empty() {
                bail!("At least one --cloud root or --chunkdb file is required");
            }
            let manifest = load_manifest(&manifest)?;
            let mut config = InstallerConfiguration::new(manifest.clone(), install_dir);
            config.current_manifest = current.as_ref().map(load_manifest).transpose()?;
            config.cloud_directories = cloud;
            config.chunk_database_files = chunkdb;
            config.staging_directory = staging_dir;
            config.backup_directory = backup_dir;
            config.install_tags = tags.into_iter().collect::<BTreeSet<_>>();
            config.verify_mode = verify.into();
            config.is_repair = repair;
            config.stage_only = stage_only;
            config.run_required_prereqs = prereqs;
            config.settings = match settings {
                Some(path) => BuildPatchSettings::load_from(&path)?,
                None => BuildPatchSettings::load(),
            };

            println!("buildpatch - {} {}", manifest.app_name(), manifest.version_string());
            println!("Install directory: {}", config.install_directory.display());
            println!();

            let installer = BuildPatchInstaller::new(config, InstallerServices::system()?).on_complete(
                |success, manifest| {
                    debug!("{} {} finished, success={}", manifest.app_name(), manifest.version_string(), success);
                },
            );

            let bar = ProgressBar::new(PROGRESS_STEPS);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent}% | {msg}")?
                    .progress_chars("=>-"),
            );
            bar.enable_steady_tick(Duration::from_millis(100));
            installer.register_message_handler(Arc::new(ConsoleEvents { bar: bar.clone() }));

            installer.start()?;
            while !installer.is_complete() {
                installer.pump_messages();
                let progress = installer.update_progress();
                if progress >= 0.0 {
                    bar.set_position((progress * PROGRESS_STEPS as f32) as u64);
                }
                bar.set_message(format!(
                    "{} | {:.2} MB/s | {}",
                    installer.status_text(),
                    installer.download_speed() / 1_048_576.0,
                    installer.download_health()
                ));
                std::thread::sleep(Duration::from_millis(100));
            }
            let success = installer.wait();
            installer.pump_messages();
            bar.finish_and_clear();

            let stats = installer.build_statistics();
            println!("=== Installation Summary ===");
            println!("Files:      {} in build, {} constructed, {} removed",
                stats.num_files_in_build, stats.num_files_outdated, stats.num_files_to_remove);
            println!("Chunks:     {} downloaded, {} recycled, {} from chunkdbs",
                stats.num_chunks_downloaded, stats.num_chunks_recycled, stats.num_chunks_read_from_chunk_dbs);
            println!("Downloaded: {:.2} MB at {:.2} MB/s average",
                stats.total_downloaded_data as f64 / 1_048_576.0,
                stats.average_download_speed / 1_048_576.0);
            println!("Retries:    {}", stats.num_install_retries);
            println!("Time:       {:.1}s", stats.process_execute_time);

            if !success {
                if installer.is_canceled() {
                    bail!("Installation canceled");
                }
                bail!("Installation failed: {} ({})", installer.error_text(), installer.error_code());
            }
            println!("\nInstallation complete!");
        }

        Commands::PackageChunks {
            manifest,
            cloud_dir,
            output,
            max_size,
        } => {
            let manifest = load_manifest(&manifest)?;
            let parts = package_chunk_data(&manifest, &cloud_dir, &output, max_size)?;
            for part in &parts {
                println!("{}", part.display());
            }
            eprintln!("\nWrote {} chunkdb file(s)", parts.len());
        }

        Commands::Info { manifest } => {
            let manifest = load_manifest(&manifest)?;
            let files = manifest.build_file_list();

            println!("=== Build Information ===");
            println!("App:           {}", manifest.app_name());
            println!("Version:       {}", manifest.version_string());
            println!("Files:         {}", manifest.num_files());
            println!("Build size:    {} bytes", manifest.build_size());
            println!("Download size: {} bytes", manifest.download_size(&files));
            println!("Chunks:        {}", manifest.data_list().len());
            let tags: Vec<String> = manifest
                .file_tag_list()
                .into_iter()
                .map(|t| if t.is_empty() { "<untagged>".to_string() } else { t })
                .collect();
            println!("Install tags:  {}", tags.join(", "));
            if !manifest.prereq_path().is_empty() {
                println!();
                println!("Prerequisite:  {}", manifest.prereq_name());
                println!("  Path:        {}", manifest.prereq_path());
                println!("  Args:        {}", manifest.prereq_args());
            }
        }

        Commands::Verify {
            manifest,
            install_dir,
            sha,
        } => {
            let manifest = load_manifest(&manifest)?;
            let mode = if sha {
                VerifyMode::ShaVerifyAllFiles
            } else {
                VerifyMode::FileSizeCheckAllFiles
            };
            let files: BTreeSet<String> = manifest.build_file_list().into_iter().collect();
            let verifier = Verifier::new(
                manifest,
                install_dir,
                mode,
                HashSet::new(),
                Arc::new(DiskFileSystem::new()),
                Arc::new(BuildPatchProgress::new()),
            );
            let result = verifier.verify(&files);
            for file in &result.corrupt {
                println!("BAD  {}", file);
            }
            println!("\nChecked {} files, {} bad", result.checked, result.corrupt.len());
            if !result.is_ok() {
                bail!("Verification failed");
            }
        }
    }

    Ok(())
}
