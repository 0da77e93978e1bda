//! Version fingerprints and working-tree comparison
//!
//! Produces the `path → sha256` map for any version and compares it with
//! the working tree for status display.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::repo::RepositoryContext;
use crate::restore;
use crate::types::{FileStatus, StatusReport};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

/// Hex SHA-256 of every file materialized at `version`, keyed by logical
/// path. Version 0 (no commits) yields an empty map.
pub fn snapshot_file_hashes(
    ctx: &RepositoryContext,
    config: &Config,
    version: u32,
) -> Result<BTreeMap<String, String>> {
    let mut hashes = BTreeMap::new();
    if version == 0 {
        return Ok(hashes);
    }

    let archive = restore::restore_version(ctx, config, version)?;
    archive.for_each_entry(|name, content| {
        let mut hasher = Sha256::new();
        std::io::copy(content, &mut hasher).map_err(|e| Error::io("hashing entry", e))?;
        hashes.insert(name.to_string(), format!("{:x}", hasher.finalize()));
        Ok(())
    })?;

    Ok(hashes)
}

/// Hex SHA-256 of one working-tree file
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| Error::io(format!("opening {}", path.display()), e))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher).map_err(|e| Error::io("hashing file", e))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hex SHA-256 of an in-memory buffer
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Hex SHA-256 of a reader's remaining content
pub fn hash_reader(reader: &mut dyn Read) -> Result<String> {
    let mut hasher = Sha256::new();
    std::io::copy(reader, &mut hasher).map_err(|e| Error::io("hashing stream", e))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compare the working tree (as a `path → sha256` map) against a version.
///
/// Produces four disjoint sets: modified (in both, hashes differ),
/// untracked (working tree only), deleted (version only), and staged
/// (reserved for the staging collaborator).
pub fn compare_with_version(
    ctx: &RepositoryContext,
    config: &Config,
    version: u32,
    working: &BTreeMap<String, String>,
) -> Result<StatusReport> {
    let committed = snapshot_file_hashes(ctx, config, version)?;

    let mut report = StatusReport::default();

    for (path, current_hash) in working {
        match committed.get(path) {
            Some(committed_hash) if committed_hash != current_hash => {
                report.modified.push(FileStatus {
                    path: path.clone(),
                    status: "modified",
                });
            }
            Some(_) => {}
            None => {
                report.untracked.push(FileStatus {
                    path: path.clone(),
                    status: "untracked",
                });
            }
        }
    }

    for path in committed.keys() {
        if !working.contains_key(path) {
            report.deleted.push(FileStatus {
                path: path.clone(),
                status: "deleted",
            });
        }
    }

    Ok(report)
}
