//! Per-commit storage strategy selection

use crate::config::Config;
use crate::types::StagedFile;

/// How the next commit is stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitStrategy {
    /// Full fast-codec snapshot
    FullSnapshot,

    /// Binary patch against the previous version
    BinaryDelta {
        /// Version the patch is computed against
        base: u32,
    },

    /// Layered smart delta carrying per-layer change analysis
    LayeredSmartDelta {
        /// Version the change analysis is computed against
        base: u32,
        /// Logical path of the layered document driving the analysis
        target: String,
    },
}

impl CommitStrategy {
    /// Base version for delta strategies
    pub fn base_version(&self) -> Option<u32> {
        match self {
            CommitStrategy::FullSnapshot => None,
            CommitStrategy::BinaryDelta { base } => Some(*base),
            CommitStrategy::LayeredSmartDelta { base, .. } => Some(*base),
        }
    }

    /// Strategy name as recorded in commit records
    pub fn name(&self) -> &'static str {
        match self {
            CommitStrategy::FullSnapshot => crate::types::STRATEGY_FAST_SNAPSHOT,
            CommitStrategy::BinaryDelta { .. } => crate::types::STRATEGY_BINARY_DELTA,
            CommitStrategy::LayeredSmartDelta { .. } => {
                crate::types::STRATEGY_LAYERED_SMART_DELTA
            }
        }
    }
}

/// Choose the storage strategy for the next commit.
///
/// Rules evaluated top to bottom, first match wins:
/// 1. the first version is always a full snapshot
/// 2. very large files make binary diffing slower than it is worth
/// 3. a chain at its length cap must be re-anchored with a snapshot
/// 4. large or layered files take the delta path
/// 5. everything else gets a full snapshot
pub fn select_strategy(
    files: &[StagedFile],
    version: u32,
    chain_length: u32,
    config: &Config,
) -> CommitStrategy {
    if version == 1 {
        return CommitStrategy::FullSnapshot;
    }

    if let Some(huge) = files.iter().find(|f| config.forces_snapshot(f.size)) {
        tracing::debug!(
            path = %huge.absolute_path.display(),
            size = huge.size,
            "Very large file staged, taking a fresh snapshot"
        );
        return CommitStrategy::FullSnapshot;
    }

    if chain_length >= config.max_chain_length {
        tracing::debug!(
            chain_length,
            max = config.max_chain_length,
            "Delta chain at length cap, taking a fresh snapshot"
        );
        return CommitStrategy::FullSnapshot;
    }

    let layered = files.iter().find(|f| f.is_layered());
    let large = files.iter().any(|f| config.wants_delta(f.size));

    if layered.is_some() || large {
        let base = version - 1;
        return match layered {
            Some(doc) => CommitStrategy::LayeredSmartDelta {
                base,
                target: doc.logical_path.clone(),
            },
            None => CommitStrategy::BinaryDelta { base },
        };
    }

    CommitStrategy::FullSnapshot
}

/// Post-hoc acceptance rule: a delta whose artifact is nearly as large as
/// the data it encodes is not worth keeping.
pub fn delta_is_acceptable(compressed_size: u64, original_size: u64, config: &Config) -> bool {
    if original_size == 0 {
        return false;
    }
    let ratio = compressed_size as f64 / original_size as f64;
    ratio <= config.delta_accept_ratio
}
