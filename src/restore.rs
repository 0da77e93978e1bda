//! Restoration planner and executor
//!
//! Given a target version, walks the version chain backward to a full
//! snapshot (or legacy archive), materializes it as a byte-stable archive,
//! then applies patches forward until the target archive is reached.

use crate::archive::{self, TempFileGuard};
use crate::config::Config;
use crate::delta::patch::apply_patch;
use crate::delta::{is_smart_delta, read_smart_envelope};
use crate::error::{Error, Result};
use crate::repo::RepositoryContext;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// An artifact found for one version, in locate precedence order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocatedArtifact {
    /// `snapshots/v<N>.lz4`
    FastSnapshot(PathBuf),

    /// `deltas/v<N>.lz4`, a snapshot migrated by background housekeeping
    MigratedSnapshot(PathBuf),

    /// `deltas/v<N>_optimized.zst` (or legacy `.zstd`)
    OptimizedSnapshot(PathBuf),

    /// `objects/v<N>.zip`
    LegacyArchive(PathBuf),

    /// A binary patch against the previous version
    Patch { path: PathBuf, base: u32 },

    /// A self-contained layered smart delta
    SmartDelta(PathBuf),
}

/// Find the artifact realizing `version`, probing the storage hierarchy in
/// precedence order. Delta artifacts are classified by content because
/// older producers used the patch and smart-delta extensions
/// interchangeably.
pub fn locate_artifact(ctx: &RepositoryContext, version: u32) -> Result<LocatedArtifact> {
    let snapshot = ctx.snapshot_path(version);
    if snapshot.is_file() {
        return Ok(LocatedArtifact::FastSnapshot(snapshot));
    }

    let migrated = ctx.migrated_snapshot_path(version);
    if migrated.is_file() {
        return Ok(LocatedArtifact::MigratedSnapshot(migrated));
    }

    for optimized in [
        ctx.optimized_path(version),
        ctx.optimized_path_legacy(version),
    ] {
        if optimized.is_file() {
            return Ok(LocatedArtifact::OptimizedSnapshot(optimized));
        }
    }

    let legacy = ctx.legacy_archive_path(version);
    if legacy.is_file() {
        return Ok(LocatedArtifact::LegacyArchive(legacy));
    }

    if version > 1 {
        let base = version - 1;
        let candidates = [
            ctx.delta_path(version, base),
            ctx.smart_delta_path(version, base),
            ctx.legacy_delta_path(version, base),
        ];
        for candidate in candidates {
            if candidate.is_file() {
                return Ok(if is_smart_delta(&candidate)? {
                    LocatedArtifact::SmartDelta(candidate)
                } else {
                    LocatedArtifact::Patch {
                        path: candidate,
                        base,
                    }
                });
            }
        }
    }

    Err(Error::ArtifactMissing { version })
}

/// The root of a restoration chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseStep {
    /// A structured-stream snapshot (fast, migrated, or optimized)
    Snapshot(PathBuf),

    /// A legacy archive usable as-is
    LegacyArchive(PathBuf),

    /// A self-contained smart delta holding the whole document
    SmartDelta(PathBuf),
}

/// One forward patch application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchStep {
    /// Version this patch produces
    pub version: u32,

    /// Patch artifact path
    pub path: PathBuf,
}

/// A resolved restoration: one base materialization followed by zero or
/// more patch applications in forward order
#[derive(Debug, Clone)]
pub struct RestorePlan {
    /// Version realized by the base step
    pub base_version: u32,

    /// Chain root
    pub base: BaseStep,

    /// Patches to apply, oldest first
    pub patches: Vec<PatchStep>,
}

impl RestorePlan {
    /// Number of patch applications the plan requires
    pub fn chain_length(&self) -> u32 {
        self.patches.len() as u32
    }
}

/// Walk backward from `target` and produce the restoration plan
pub fn plan_restore(ctx: &RepositoryContext, config: &Config, target: u32) -> Result<RestorePlan> {
    let mut patches = Vec::new();
    let mut version = target;

    loop {
        let located = match locate_artifact(ctx, version) {
            Ok(located) => located,
            Err(Error::ArtifactMissing { .. }) if version != target => {
                return Err(Error::ChainBroken { version });
            }
            Err(e) => return Err(e),
        };

        match located {
            LocatedArtifact::FastSnapshot(path)
            | LocatedArtifact::MigratedSnapshot(path)
            | LocatedArtifact::OptimizedSnapshot(path) => {
                patches.reverse();
                return Ok(RestorePlan {
                    base_version: version,
                    base: BaseStep::Snapshot(path),
                    patches,
                });
            }
            LocatedArtifact::LegacyArchive(path) => {
                patches.reverse();
                return Ok(RestorePlan {
                    base_version: version,
                    base: BaseStep::LegacyArchive(path),
                    patches,
                });
            }
            LocatedArtifact::SmartDelta(path) => {
                patches.reverse();
                return Ok(RestorePlan {
                    base_version: version,
                    base: BaseStep::SmartDelta(path),
                    patches,
                });
            }
            LocatedArtifact::Patch { path, base } => {
                patches.push(PatchStep { version, path });
                if patches.len() as u32 > config.max_chain_length {
                    return Err(Error::ChainBroken { version: base });
                }
                version = base;
            }
        }
    }
}

/// Delta chain length from `version` back to the nearest base artifact
pub fn chain_length(ctx: &RepositoryContext, config: &Config, version: u32) -> Result<u32> {
    if version == 0 {
        return Ok(0);
    }
    Ok(plan_restore(ctx, config, version)?.chain_length())
}

/// Execute a restoration, producing the target version's archive at `dest`
pub fn materialize_version_archive(
    ctx: &RepositoryContext,
    config: &Config,
    version: u32,
    dest: &Path,
) -> Result<()> {
    let plan = plan_restore(ctx, config, version)?;
    tracing::debug!(
        version,
        base_version = plan.base_version,
        patches = plan.patches.len(),
        "Executing restoration plan"
    );

    // Base materialization; lands directly at dest when no patches follow
    let mut current = if plan.patches.is_empty() {
        materialize_base(&plan.base, dest)?;
        None
    } else {
        let guard = TempFileGuard::new(ctx.temp_path(&format!("restore_base_v{}", plan.base_version), "zip"));
        materialize_base(&plan.base, guard.path())?;
        Some(guard)
    };

    // Forward patch applications
    let count = plan.patches.len();
    for (i, step) in plan.patches.iter().enumerate() {
        let source = current
            .as_ref()
            .map(|g| g.path().to_path_buf())
            .unwrap_or_else(|| dest.to_path_buf());

        let base_bytes =
            std::fs::read(&source).map_err(|e| Error::io("reading intermediate archive", e))?;
        let patch_bytes = std::fs::read(&step.path).map_err(|e| Error::PatchFailed {
            version: step.version,
            message: format!("reading patch: {}", e),
        })?;

        let target_bytes = apply_patch(&base_bytes, &patch_bytes, step.version)?;

        let last = i + 1 == count;
        if last {
            std::fs::write(dest, &target_bytes)
                .map_err(|e| Error::io("writing restored archive", e))?;
            current = None;
        } else {
            let guard =
                TempFileGuard::new(ctx.temp_path(&format!("restore_v{}", step.version), "zip"));
            std::fs::write(guard.path(), &target_bytes)
                .map_err(|e| Error::io("writing intermediate archive", e))?;
            current = Some(guard);
        }
    }

    drop(current);
    Ok(())
}

fn materialize_base(base: &BaseStep, dest: &Path) -> Result<()> {
    match base {
        BaseStep::Snapshot(path) => archive::structured_stream_to_archive(path, dest),
        BaseStep::LegacyArchive(path) => archive::copy_file(path, dest).map(|_| ()),
        BaseStep::SmartDelta(path) => {
            let (header, document) = read_smart_envelope(path)?;
            archive::single_entry_archive(&header.file_path, &document, dest)
        }
    }
}

/// Handle to a restored version's archive; the backing temp file is
/// removed when the handle drops
pub struct RestoredArchive {
    guard: TempFileGuard,
}

impl RestoredArchive {
    /// Path of the archive file
    pub fn path(&self) -> &Path {
        self.guard.path()
    }

    /// Visit every entry with a streaming reader
    pub fn for_each_entry(
        &self,
        mut visit: impl FnMut(&str, &mut dyn Read) -> Result<()>,
    ) -> Result<()> {
        let file = File::open(self.path()).map_err(|e| Error::io("opening restored archive", e))?;
        let mut archive = zip::ZipArchive::new(file)?;
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();
            visit(&name, &mut entry)?;
        }
        Ok(())
    }

    /// Write every entry into the working tree root, overwriting existing
    /// files. Entries that would escape the root are rejected.
    pub fn unpack_into(&self, root: &Path) -> Result<()> {
        let file = File::open(self.path()).map_err(|e| Error::io("opening restored archive", e))?;
        let mut archive = zip::ZipArchive::new(file)?;

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            let Some(relative) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
                return Err(Error::archive(format!(
                    "archive entry escapes the working tree: {}",
                    entry.name()
                )));
            };

            let dest = root.join(relative);
            if entry.is_dir() {
                std::fs::create_dir_all(&dest)
                    .map_err(|e| Error::io("creating restored directory", e))?;
                continue;
            }

            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::io("creating restored parent directory", e))?;
            }

            let mut out =
                File::create(&dest).map_err(|e| Error::io("creating restored file", e))?;
            std::io::copy(&mut entry, &mut out)
                .map_err(|e| Error::io("writing restored file", e))?;
        }

        Ok(())
    }
}

/// Restore `version` into a temp archive and return its handle
pub fn restore_version(
    ctx: &RepositoryContext,
    config: &Config,
    version: u32,
) -> Result<RestoredArchive> {
    let guard = TempFileGuard::new(ctx.temp_path(&format!("restore_target_v{}", version), "zip"));
    materialize_version_archive(ctx, config, version, guard.path())?;
    Ok(RestoredArchive { guard })
}

/// Restore `version`'s files into the working tree at `working_root`
pub fn restore_to_version(
    ctx: &RepositoryContext,
    config: &Config,
    version: u32,
    working_root: &Path,
) -> Result<()> {
    let archive = restore_version(ctx, config, version)?;
    archive.unpack_into(working_root)?;
    tracing::info!(version, root = %working_root.display(), "Restored working tree");
    Ok(())
}
