//! Delta writer
//!
//! Produces delta artifacts against the previous version. Both flavors
//! share the same skeleton: materialize the current and base versions as
//! byte-stable archives, then either diff them (binary) or store the new
//! layered document with its change analysis (layered smart).

use crate::archive::{self, TempFileGuard};
use crate::config::Config;
use crate::delta::patch::compute_patch;
use crate::delta::{write_smart_envelope, DeltaFlavor, SmartDeltaHeader};
use crate::error::{Error, Result};
use crate::layers::analyze_layer_changes;
use crate::repo::RepositoryContext;
use crate::restore;
use crate::scan::MetadataScanner;
use crate::types::{
    CompressionInfo, StagedFile, STRATEGY_BINARY_DELTA, STRATEGY_LAYERED_SMART_DELTA,
};
use chrono::Utc;
use std::fs::File;
use std::io::Write;
use std::time::Instant;

/// Write a delta artifact for `version` against `base`.
///
/// A layered-smart request that fails at any analysis step falls back
/// silently to the plain binary flavor.
pub fn write_delta(
    ctx: &RepositoryContext,
    config: &Config,
    scanner: &dyn MetadataScanner,
    files: &[StagedFile],
    version: u32,
    base: u32,
    flavor: &DeltaFlavor,
) -> Result<CompressionInfo> {
    if let DeltaFlavor::LayeredSmart { target } = flavor {
        match write_layered_smart(ctx, config, scanner, files, version, base, target) {
            Ok(info) => return Ok(info),
            Err(e) => {
                tracing::warn!(
                    version,
                    base,
                    target = %target,
                    error = %e,
                    "Layered smart delta failed, falling back to binary delta"
                );
            }
        }
    }

    write_binary_delta(ctx, config, files, version, base)
}

fn write_binary_delta(
    ctx: &RepositoryContext,
    config: &Config,
    files: &[StagedFile],
    version: u32,
    base: u32,
) -> Result<CompressionInfo> {
    let started = Instant::now();
    tracing::debug!(version, base, "Creating binary delta");

    // Current version as an uncompressed archive
    let current_guard = TempFileGuard::new(ctx.temp_path(&format!("current_v{}", version), "zip"));
    archive::pack_staged_files(files, current_guard.path())?;

    // Base version in the same archive form, walking its chain if needed
    let base_guard = TempFileGuard::new(ctx.temp_path(&format!("base_v{}", base), "zip"));
    restore::materialize_version_archive(ctx, config, base, base_guard.path())?;

    let base_bytes = std::fs::read(base_guard.path())
        .map_err(|e| Error::io("reading base archive", e))?;
    let current_bytes = std::fs::read(current_guard.path())
        .map_err(|e| Error::io("reading current archive", e))?;

    let patch = compute_patch(&base_bytes, &current_bytes)?;

    let delta_path = ctx.delta_path(version, base);
    let write = || -> std::io::Result<()> {
        let mut out = File::create(&delta_path)?;
        out.write_all(&patch)?;
        out.sync_all()
    };
    if let Err(e) = write() {
        std::fs::remove_file(&delta_path).ok();
        return Err(Error::io("writing delta artifact", e));
    }

    let original_size: u64 = files.iter().map(|f| f.size).sum();
    let compressed_size = patch.len() as u64;
    let compression_time_ms = started.elapsed().as_secs_f64() * 1000.0;
    let ratio = if original_size > 0 {
        compressed_size as f64 / original_size as f64
    } else {
        1.0
    };

    tracing::debug!(
        version,
        base,
        original_size,
        compressed_size,
        ratio = format!("{:.3}", ratio).as_str(),
        "Binary delta created"
    );

    Ok(CompressionInfo {
        strategy: STRATEGY_BINARY_DELTA.to_string(),
        output_file: delta_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        original_size,
        compressed_size,
        compression_ratio: ratio,
        base_version: Some(base),
        compression_time_ms,
        created_at: Utc::now(),
    })
}

fn write_layered_smart(
    ctx: &RepositoryContext,
    config: &Config,
    scanner: &dyn MetadataScanner,
    files: &[StagedFile],
    version: u32,
    base: u32,
    target: &str,
) -> Result<CompressionInfo> {
    let started = Instant::now();

    let document = files
        .iter()
        .find(|f| f.logical_path == target)
        .ok_or_else(|| Error::MetadataScanFailed {
            path: target.into(),
            message: "layered document not in staged set".to_string(),
        })?;

    tracing::debug!(version, base, target = %target, "Analyzing layered document for smart delta");

    let current_layers = scanner.layer_tree(&document.absolute_path)?;

    // Reconstruct the base version's document and parse its layers
    let base_archive = TempFileGuard::new(ctx.temp_path(&format!("base_v{}", base), "zip"));
    restore::materialize_version_archive(ctx, config, base, base_archive.path())?;

    let base_doc = archive::extract_archive_entry(
        base_archive.path(),
        std::path::Path::new(&document.logical_path),
    )?
    .ok_or_else(|| Error::MetadataScanFailed {
        path: document.logical_path.clone().into(),
        message: format!("document not present in base version v{}", base),
    })?;

    let doc_ext = if document.extension.is_empty() {
        "doc".to_string()
    } else {
        document.extension.clone()
    };
    let base_doc_guard = TempFileGuard::new(ctx.temp_path(&format!("base_doc_v{}", base), &doc_ext));
    std::fs::write(base_doc_guard.path(), &base_doc)
        .map_err(|e| Error::io("writing reconstructed base document", e))?;

    let base_layers = scanner.layer_tree(base_doc_guard.path())?;

    let analysis = analyze_layer_changes(&base_layers, &current_layers);
    tracing::info!(
        version,
        base,
        target = %target,
        summary = %analysis.summary,
        "Layer analysis complete"
    );

    let current_doc = std::fs::read(&document.absolute_path)
        .map_err(|e| Error::io("reading layered document", e))?;

    let header = SmartDeltaHeader {
        file_path: document.logical_path.clone(),
        from_version: base,
        to_version: version,
        original_size: current_doc.len() as u64,
        created_at: Utc::now(),
        layer_analysis: analysis,
    };

    let delta_path = ctx.smart_delta_path(version, base);
    let result = (|| -> Result<()> {
        let mut out =
            File::create(&delta_path).map_err(|e| Error::io("creating smart delta file", e))?;
        write_smart_envelope(&mut out, &header, &current_doc)?;
        out.sync_all()
            .map_err(|e| Error::io("syncing smart delta file", e))
    })();
    if let Err(e) = result {
        std::fs::remove_file(&delta_path).ok();
        return Err(e);
    }

    let compressed_size = std::fs::metadata(&delta_path)
        .map_err(|e| Error::io("reading smart delta size", e))?
        .len();
    let original_size = document.size;
    let compression_time_ms = started.elapsed().as_secs_f64() * 1000.0;
    let ratio = if original_size > 0 {
        compressed_size as f64 / original_size as f64
    } else {
        1.0
    };

    Ok(CompressionInfo {
        strategy: STRATEGY_LAYERED_SMART_DELTA.to_string(),
        output_file: delta_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        original_size,
        compressed_size,
        compression_ratio: ratio,
        base_version: Some(base),
        compression_time_ms,
        created_at: Utc::now(),
    })
}

/// Remove a delta artifact rejected by the post-hoc acceptance rule
pub fn discard_delta(ctx: &RepositoryContext, info: &CompressionInfo) {
    let path = ctx.deltas_dir().join(&info.output_file);
    match std::fs::remove_file(&path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Discarded rejected delta artifact"),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove rejected delta")
        }
    }
}
