//! Repository context and startup recovery
//!
//! All engine operations run against a [`RepositoryContext`] holding the
//! resolved absolute paths of the repository layout. There is no ambient
//! directory state anywhere in the crate.

use crate::error::{Error, Result};
use crate::types::CommitRecord;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Canonical fast-codec snapshot extension
pub const SNAPSHOT_EXT: &str = "lz4";

/// Canonical binary delta extension
pub const DELTA_EXT: &str = "bsdiff";

/// Canonical layered smart delta extension
pub const SMART_DELTA_EXT: &str = "psd_smart";

/// Canonical optimized snapshot extension
pub const OPTIMIZED_EXT: &str = "zst";

/// Optimized snapshot extension written by older repositories
pub const OPTIMIZED_EXT_LEGACY: &str = "zstd";

/// Legacy archive snapshot extension
pub const ARCHIVE_EXT: &str = "zip";

/// Suffix of in-flight optimizer outputs, renamed away on completion
pub const PARTIAL_SUFFIX: &str = ".part";

// Uniquifies temp file names within the process
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Resolved paths of one repository
#[derive(Debug, Clone)]
pub struct RepositoryContext {
    root: PathBuf,
    head_file: PathBuf,
    config_file: PathBuf,
    snapshots_dir: PathBuf,
    deltas_dir: PathBuf,
    commits_dir: PathBuf,
    objects_dir: PathBuf,
    temp_dir: PathBuf,
    staging_dir: PathBuf,
}

impl RepositoryContext {
    /// Resolve the layout under an existing repository root.
    ///
    /// The initializer collaborator creates the layout; this only resolves
    /// and verifies it.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(Error::config(format!(
                "repository root does not exist: {}",
                root.display()
            )));
        }

        let ctx = Self {
            head_file: root.join("HEAD"),
            config_file: root.join("config"),
            snapshots_dir: root.join("snapshots"),
            deltas_dir: root.join("deltas"),
            commits_dir: root.join("commits"),
            objects_dir: root.join("objects"),
            temp_dir: root.join("temp"),
            staging_dir: root.join("staging"),
            root,
        };

        for dir in [&ctx.snapshots_dir, &ctx.deltas_dir, &ctx.commits_dir, &ctx.temp_dir] {
            if !dir.is_dir() {
                return Err(Error::config(format!(
                    "repository layout incomplete, missing {}",
                    dir.display()
                )));
            }
        }

        Ok(ctx)
    }

    /// Repository root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the configuration document
    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    /// Directory holding full snapshots
    pub fn snapshots_dir(&self) -> &Path {
        &self.snapshots_dir
    }

    /// Directory holding delta artifacts and optimized snapshots
    pub fn deltas_dir(&self) -> &Path {
        &self.deltas_dir
    }

    /// Directory holding commit records
    pub fn commits_dir(&self) -> &Path {
        &self.commits_dir
    }

    /// Legacy objects directory (read-only for the engine)
    pub fn objects_dir(&self) -> &Path {
        &self.objects_dir
    }

    /// Staging collaborator territory
    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    // Artifact path builders

    /// `snapshots/v<N>.lz4`
    pub fn snapshot_path(&self, version: u32) -> PathBuf {
        self.snapshots_dir.join(format!("v{}.{}", version, SNAPSHOT_EXT))
    }

    /// `deltas/v<N>.lz4`, a snapshot migrated by background housekeeping
    pub fn migrated_snapshot_path(&self, version: u32) -> PathBuf {
        self.deltas_dir.join(format!("v{}.{}", version, SNAPSHOT_EXT))
    }

    /// `deltas/v<N>_optimized.zst`
    pub fn optimized_path(&self, version: u32) -> PathBuf {
        self.deltas_dir
            .join(format!("v{}_optimized.{}", version, OPTIMIZED_EXT))
    }

    /// `deltas/v<N>_optimized.zstd` written by older repositories
    pub fn optimized_path_legacy(&self, version: u32) -> PathBuf {
        self.deltas_dir
            .join(format!("v{}_optimized.{}", version, OPTIMIZED_EXT_LEGACY))
    }

    /// `objects/v<N>.zip`
    pub fn legacy_archive_path(&self, version: u32) -> PathBuf {
        self.objects_dir.join(format!("v{}.{}", version, ARCHIVE_EXT))
    }

    /// `deltas/v<N>_from_v<B>.bsdiff`
    pub fn delta_path(&self, version: u32, base: u32) -> PathBuf {
        self.deltas_dir
            .join(format!("v{}_from_v{}.{}", version, base, DELTA_EXT))
    }

    /// `deltas/v<N>_from_v<B>.psd_smart`
    pub fn smart_delta_path(&self, version: u32, base: u32) -> PathBuf {
        self.deltas_dir
            .join(format!("v{}_from_v{}.{}", version, base, SMART_DELTA_EXT))
    }

    /// `objects/deltas/v<N>_from_v<B>.bsdiff` (legacy location)
    pub fn legacy_delta_path(&self, version: u32, base: u32) -> PathBuf {
        self.objects_dir
            .join("deltas")
            .join(format!("v{}_from_v{}.{}", version, base, DELTA_EXT))
    }

    /// `commits/v<N>.json`
    pub fn commit_record_path(&self, version: u32) -> PathBuf {
        self.commits_dir.join(format!("v{}.json", version))
    }

    /// A unique path under `temp/` for one intermediate file
    pub fn temp_path(&self, label: &str, ext: &str) -> PathBuf {
        let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        self.temp_dir
            .join(format!("{}_{}_{}.{}", label, counter, nanos, ext))
    }

    // Commit records and HEAD

    /// Current (largest) version, or 0 when no commits exist
    pub fn current_version(&self) -> Result<u32> {
        let entries = match fs::read_dir(&self.commits_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(Error::io("reading commits directory", e)),
        };

        let mut max_version = 0;
        for entry in entries {
            let entry = entry.map_err(|e| Error::io("reading commits entry", e))?;
            if let Some(version) = parse_record_name(&entry.file_name().to_string_lossy()) {
                max_version = max_version.max(version);
            }
        }
        Ok(max_version)
    }

    /// All committed versions, ascending
    pub fn list_versions(&self) -> Result<Vec<u32>> {
        let entries = match fs::read_dir(&self.commits_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io("reading commits directory", e)),
        };

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io("reading commits entry", e))?;
            if let Some(version) = parse_record_name(&entry.file_name().to_string_lossy()) {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    /// Load the commit record for a version
    pub fn load_commit(&self, version: u32) -> Result<CommitRecord> {
        let path = self.commit_record_path(version);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::CommitNotFound { version })
            }
            Err(e) => return Err(Error::io("reading commit record", e)),
        };
        serde_json::from_str(&text).map_err(|e| Error::CommitRecordWriteFailed {
            version,
            message: format!("malformed record: {}", e),
        })
    }

    /// Persist a commit record as pretty JSON and fsync it
    pub fn save_commit(&self, record: &CommitRecord) -> Result<()> {
        let path = self.commit_record_path(record.version);
        let json = serde_json::to_string_pretty(record).map_err(|e| {
            Error::CommitRecordWriteFailed {
                version: record.version,
                message: e.to_string(),
            }
        })?;

        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()
        };
        write().map_err(|e| Error::CommitRecordWriteFailed {
            version: record.version,
            message: e.to_string(),
        })?;

        tracing::debug!(version = record.version, path = %path.display(), "Saved commit record");
        Ok(())
    }

    /// Current HEAD hash, or empty string when no commits exist
    pub fn head_hash(&self) -> Result<String> {
        match fs::read_to_string(&self.head_file) {
            Ok(text) => Ok(text.trim().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(Error::io("reading HEAD", e)),
        }
    }

    /// Write and fsync HEAD
    pub fn write_head(&self, hash: &str) -> Result<()> {
        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&self.head_file)?;
            file.write_all(hash.as_bytes())?;
            file.sync_all()
        };
        write().map_err(|e| Error::HeadUpdateFailed {
            message: e.to_string(),
        })
    }
}

/// Startup recovery: bring a repository back to a consistent state after
/// an unclean shutdown.
///
/// 1. sweep `temp/`
/// 2. remove in-flight optimizer outputs (`*.part`)
/// 3. garbage-collect artifacts whose version has no commit record
/// 4. repair `HEAD` to the largest version's hash
pub fn recover_on_startup(ctx: &RepositoryContext) -> Result<()> {
    sweep_temp(ctx)?;
    sweep_partial_optimized(ctx)?;

    let max_version = ctx.current_version()?;
    collect_orphaned_artifacts(ctx, max_version)?;
    repair_head(ctx, max_version)?;
    Ok(())
}

fn sweep_temp(ctx: &RepositoryContext) -> Result<()> {
    let entries = match fs::read_dir(&ctx.temp_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::io("reading temp directory", e)),
    };

    for entry in entries {
        let entry = entry.map_err(|e| Error::io("reading temp entry", e))?;
        let path = entry.path();
        let removed = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match removed {
            Ok(()) => tracing::info!(path = %path.display(), "Recovery: removed stale temp file"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Recovery: could not remove temp file"),
        }
    }
    Ok(())
}

fn sweep_partial_optimized(ctx: &RepositoryContext) -> Result<()> {
    let entries = match fs::read_dir(&ctx.deltas_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::io("reading deltas directory", e)),
    };

    for entry in entries {
        let entry = entry.map_err(|e| Error::io("reading deltas entry", e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(PARTIAL_SUFFIX) {
            let path = entry.path();
            match fs::remove_file(&path) {
                Ok(()) => {
                    tracing::info!(path = %path.display(), "Recovery: removed partial optimized file")
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Recovery: could not remove partial file")
                }
            }
        }
    }
    Ok(())
}

/// Delete artifacts orphaned by a crash between artifact write and commit
/// record write
fn collect_orphaned_artifacts(ctx: &RepositoryContext, max_version: u32) -> Result<()> {
    for dir in [&ctx.snapshots_dir, &ctx.deltas_dir] {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(Error::io("scanning for orphaned artifacts", e)),
        };

        for entry in entries {
            let entry = entry.map_err(|e| Error::io("reading artifact entry", e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(version) = parse_artifact_version(&name) else {
                continue;
            };
            if version > max_version {
                let path = entry.path();
                match fs::remove_file(&path) {
                    Ok(()) => tracing::info!(
                        version,
                        path = %path.display(),
                        "Recovery: removed orphaned artifact"
                    ),
                    Err(e) => tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Recovery: could not remove orphaned artifact"
                    ),
                }
            }
        }
    }
    Ok(())
}

fn repair_head(ctx: &RepositoryContext, max_version: u32) -> Result<()> {
    let expected = if max_version == 0 {
        String::new()
    } else {
        ctx.load_commit(max_version)?.hash
    };

    let current = ctx.head_hash()?;
    if current != expected {
        tracing::info!(
            version = max_version,
            old = %current,
            new = %expected,
            "Recovery: repairing HEAD"
        );
        ctx.write_head(&expected)?;
    }
    Ok(())
}

/// Parse `v<N>.json` into a version number
pub fn parse_record_name(name: &str) -> Option<u32> {
    name.strip_prefix('v')?.strip_suffix(".json")?.parse().ok()
}

/// Parse the version of any artifact file name
/// (`v<N>.lz4`, `v<N>_from_v<B>.*`, `v<N>_optimized.*`)
pub fn parse_artifact_version(name: &str) -> Option<u32> {
    let rest = name.strip_prefix('v')?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let tail = &rest[digits.len()..];
    let valid = tail.starts_with('.') || tail.starts_with("_from_v") || tail.starts_with("_optimized.");
    if !valid {
        return None;
    }
    digits.parse().ok()
}
