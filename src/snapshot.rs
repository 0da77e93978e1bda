//! Full-snapshot writer
//!
//! Drives the structured-stream codec over the staged files to produce
//! `snapshots/v<N>.lz4`.

use crate::config::SNAPSHOT_EXPANSION_LIMIT;
use crate::error::{Error, Result};
use crate::repo::RepositoryContext;
use crate::stream::StructuredStreamWriter;
use crate::types::{CompressionInfo, StagedFile, STRATEGY_FAST_SNAPSHOT};
use chrono::Utc;
use std::fs::File;
use std::time::Instant;

/// Write a full snapshot for `version` and return its compression metrics.
///
/// Unreadable staged files are skipped with a warning; they will appear as
/// deleted when the version is restored. The artifact is validated and
/// fsynced before the result is returned; a failed validation removes it.
pub fn write_snapshot(
    ctx: &RepositoryContext,
    files: &[StagedFile],
    version: u32,
) -> Result<CompressionInfo> {
    let started = Instant::now();
    let output_path = ctx.snapshot_path(version);

    let out = File::create(&output_path).map_err(|e| Error::io("creating snapshot file", e))?;
    let mut writer = StructuredStreamWriter::new(out);

    for file in files {
        let mut source = match File::open(&file.absolute_path) {
            Ok(source) => source,
            Err(e) => {
                tracing::warn!(
                    path = %file.absolute_path.display(),
                    error = %e,
                    "Skipping unreadable file in snapshot"
                );
                continue;
            }
        };

        if let Err(e) = writer.add_file(&file.logical_path, &mut source) {
            tracing::warn!(
                path = %file.absolute_path.display(),
                error = %e,
                "Skipping file after read failure in snapshot"
            );
            continue;
        }
    }

    let original_size = writer.bytes_in();
    let files_written = writer.files_written();
    let out = writer.finish()?;
    out.sync_all()
        .map_err(|e| Error::io("syncing snapshot file", e))?;
    drop(out);

    let compressed_size = std::fs::metadata(&output_path)
        .map_err(|e| Error::io("reading snapshot size", e))?
        .len();

    if original_size == 0 {
        std::fs::remove_file(&output_path).ok();
        return Err(Error::NoData);
    }

    let ratio = compressed_size as f64 / original_size as f64;
    if ratio > SNAPSHOT_EXPANSION_LIMIT {
        std::fs::remove_file(&output_path).ok();
        return Err(Error::CompressionExpanded {
            original: original_size,
            compressed: compressed_size,
        });
    }

    if compressed_size == 0 {
        std::fs::remove_file(&output_path).ok();
        return Err(Error::EmptyOutput { path: output_path });
    }

    let compression_time_ms = started.elapsed().as_secs_f64() * 1000.0;
    tracing::debug!(
        version,
        files = files_written,
        original_size,
        compressed_size,
        ratio = format!("{:.3}", ratio).as_str(),
        time_ms = format!("{:.1}", compression_time_ms).as_str(),
        "Wrote fast snapshot"
    );

    Ok(CompressionInfo {
        strategy: STRATEGY_FAST_SNAPSHOT.to_string(),
        output_file: output_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        original_size,
        compressed_size,
        compression_ratio: ratio,
        base_version: None,
        compression_time_ms,
        created_at: Utc::now(),
    })
}
