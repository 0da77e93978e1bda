//! Commit engine
//!
//! Orchestrates the write path: artifact first, then the commit record,
//! then HEAD, so a crash at any point is recoverable on startup.

use crate::config::Config;
use crate::delta::{self, DeltaFlavor};
use crate::error::{Error, Result};
use crate::fingerprint;
use crate::format::{format_millis, format_percent, format_size};
use crate::optimize::OptimizationScheduler;
use crate::repo::{self, RepositoryContext};
use crate::restore;
use crate::scan::{ExtensionScanner, MetadataScanner};
use crate::snapshot;
use crate::strategy::{self, CommitStrategy};
use crate::types::{
    CommitRecord, CompressionInfo, FileMetadata, StagedFile, StatusReport,
    STRATEGY_FAST_SNAPSHOT,
};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

/// The storage engine for one repository
pub struct CommitEngine {
    ctx: RepositoryContext,
    config: Config,
    scanner: Box<dyn MetadataScanner>,
    optimizer: OptimizationScheduler,
}

impl CommitEngine {
    /// Build an engine over an already-resolved repository context
    pub fn new(ctx: RepositoryContext, config: Config, scanner: Box<dyn MetadataScanner>) -> Self {
        let optimizer = OptimizationScheduler::new(Duration::from_secs(config.optimize_delay_secs));
        Self {
            ctx,
            config,
            scanner,
            optimizer,
        }
    }

    /// Open the repository at `root`, load its configuration, run startup
    /// recovery, and attach the default extension scanner
    pub fn open(root: impl Into<std::path::PathBuf>) -> Result<Self> {
        let ctx = RepositoryContext::open(root)?;
        let config = Config::load(ctx.config_file())?;
        repo::recover_on_startup(&ctx)?;
        Ok(Self::new(ctx, config, Box::new(ExtensionScanner)))
    }

    /// The repository context this engine operates on
    pub fn context(&self) -> &RepositoryContext {
        &self.ctx
    }

    /// The effective configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run startup recovery on demand
    pub fn recover(&self) -> Result<()> {
        repo::recover_on_startup(&self.ctx)
    }

    /// Join outstanding background work; call before process exit
    pub fn shutdown(&self) {
        self.optimizer.join_on_shutdown();
    }

    /// Current (largest) committed version, 0 when the history is empty
    pub fn current_version(&self) -> Result<u32> {
        self.ctx.current_version()
    }

    /// Load one commit record
    pub fn get_commit(&self, version: u32) -> Result<CommitRecord> {
        self.ctx.load_commit(version)
    }

    /// All commit records, newest first
    pub fn history(&self) -> Result<Vec<CommitRecord>> {
        let mut records = Vec::new();
        for version in self.ctx.list_versions()?.into_iter().rev() {
            records.push(self.ctx.load_commit(version)?);
        }
        Ok(records)
    }

    /// Delta chain length from `version` back to its base snapshot
    pub fn chain_length(&self, version: u32) -> Result<u32> {
        restore::chain_length(&self.ctx, &self.config, version)
    }

    /// `path → sha256` for every file materialized at `version`
    pub fn snapshot_file_hashes(&self, version: u32) -> Result<BTreeMap<String, String>> {
        fingerprint::snapshot_file_hashes(&self.ctx, &self.config, version)
    }

    /// Compare the working tree's `path → sha256` map against `version`
    pub fn compare_with_version(
        &self,
        version: u32,
        working: &BTreeMap<String, String>,
    ) -> Result<StatusReport> {
        fingerprint::compare_with_version(&self.ctx, &self.config, version, working)
    }

    /// Restore `version`'s files into the working tree
    pub fn restore_to_version(&self, version: u32, working_root: &Path) -> Result<()> {
        restore::restore_to_version(&self.ctx, &self.config, version, working_root)
    }

    /// Create a new commit from the staged file list.
    ///
    /// Durability order: artifact, commit record, HEAD. A delta whose
    /// ratio fails the acceptance rule is discarded and the commit is
    /// stored as a full snapshot instead; the caller is informed through
    /// the returned record's strategy, not an error.
    pub fn create_commit(&self, message: &str, files: &[StagedFile]) -> Result<CommitRecord> {
        let started = Instant::now();

        if files.is_empty() {
            return Err(Error::NoStagedFiles);
        }

        let current_version = self.ctx.current_version()?;
        let new_version = current_version + 1;
        let timestamp = Utc::now();
        let hash = generate_commit_hash(message, files, new_version, timestamp);
        let parent_hash = self.ctx.head_hash()?;

        let metadata = self.scan_metadata(files);

        let chain_length = self.chain_length_for_selector(current_version);
        let chosen = strategy::select_strategy(files, new_version, chain_length, &self.config);
        tracing::debug!(
            version = new_version,
            strategy = chosen.name(),
            chain_length,
            files = files.len(),
            "Selected storage strategy"
        );

        let compression_info = self.write_artifact(&chosen, files, new_version)?;

        let record = CommitRecord {
            hash: hash.clone(),
            message: message.to_string(),
            timestamp,
            author: self.config.author.clone(),
            files_count: files.len() as u32,
            version: new_version,
            metadata,
            parent_hash,
            snapshot_zip: None,
            compression_info: Some(compression_info.clone()),
        };

        self.ctx.save_commit(&record)?;
        self.ctx.write_head(&hash)?;

        if self.config.background_optimize && compression_info.strategy == STRATEGY_FAST_SNAPSHOT {
            self.optimizer.schedule(&self.ctx, new_version);
        }

        let total_ms = started.elapsed().as_secs_f64() * 1000.0;
        let saved = (1.0 - compression_info.compression_ratio) * 100.0;
        tracing::info!(
            version = new_version,
            hash = %hash,
            strategy = %compression_info.strategy,
            original = %format_size(compression_info.original_size),
            stored = %format_size(compression_info.compressed_size),
            saved = %format_percent(saved),
            took = %format_millis(total_ms),
            "Commit created"
        );

        Ok(record)
    }

    /// Chain length feeding the selector. An unreadable chain forces a
    /// fresh snapshot, which re-anchors the history.
    fn chain_length_for_selector(&self, current_version: u32) -> u32 {
        if current_version == 0 {
            return 0;
        }
        match restore::chain_length(&self.ctx, &self.config, current_version) {
            Ok(length) => length,
            Err(e) => {
                tracing::warn!(
                    version = current_version,
                    error = %e,
                    "Could not measure delta chain, forcing snapshot"
                );
                self.config.max_chain_length
            }
        }
    }

    fn scan_metadata(&self, files: &[StagedFile]) -> BTreeMap<String, FileMetadata> {
        let mut metadata = BTreeMap::new();
        for file in files {
            let entry = match self.scanner.scan(file) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(
                        path = %file.absolute_path.display(),
                        error = %e,
                        "Metadata scan failed, recording basic info"
                    );
                    FileMetadata::generic(file, Some(e.to_string()))
                }
            };
            metadata.insert(file.logical_path.clone(), entry);
        }
        metadata
    }

    fn write_artifact(
        &self,
        chosen: &CommitStrategy,
        files: &[StagedFile],
        version: u32,
    ) -> Result<CompressionInfo> {
        let base = match chosen.base_version() {
            None => return snapshot::write_snapshot(&self.ctx, files, version),
            Some(base) => base,
        };

        let flavor = match chosen {
            CommitStrategy::LayeredSmartDelta { target, .. } => DeltaFlavor::LayeredSmart {
                target: target.clone(),
            },
            _ => DeltaFlavor::Binary,
        };

        match delta::write_delta(
            &self.ctx,
            &self.config,
            self.scanner.as_ref(),
            files,
            version,
            base,
            &flavor,
        ) {
            Ok(info)
                if strategy::delta_is_acceptable(
                    info.compressed_size,
                    info.original_size,
                    &self.config,
                ) =>
            {
                Ok(info)
            }
            Ok(info) => {
                tracing::info!(
                    version,
                    ratio = %format_percent(info.compression_ratio * 100.0),
                    threshold = %format_percent(self.config.delta_accept_ratio * 100.0),
                    "Delta ratio above threshold, storing a full snapshot instead"
                );
                delta::writer::discard_delta(&self.ctx, &info);
                snapshot::write_snapshot(&self.ctx, files, version)
            }
            Err(e) => {
                tracing::warn!(
                    version,
                    error = %e,
                    "Delta creation failed, falling back to full snapshot"
                );
                snapshot::write_snapshot(&self.ctx, files, version)
            }
        }
    }
}

/// Derive the 12-hex-digit commit identifier from the message, version,
/// commit time, and each staged file's path, size, and mtime
fn generate_commit_hash(
    message: &str,
    files: &[StagedFile],
    version: u32,
    timestamp: DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(message.as_bytes());
    hasher.update(version.to_string().as_bytes());
    hasher.update(timestamp.to_rfc3339().as_bytes());
    for file in files {
        hasher.update(file.absolute_path.to_string_lossy().as_bytes());
        hasher.update(file.size.to_string().as_bytes());
        hasher.update(file.mod_time.to_rfc3339().as_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..12].to_string()
}
