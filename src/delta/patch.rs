//! Binary patch computation and application
//!
//! Thin wrappers around the suffix-sort bsdiff implementation, mapping its
//! I/O errors onto the engine's error kinds.

use crate::error::{Error, Result};
use qbsdiff::{Bsdiff, Bspatch};
use std::io::Cursor;

/// Compute a binary patch that transforms `base` into `target`
pub fn compute_patch(base: &[u8], target: &[u8]) -> Result<Vec<u8>> {
    let mut patch = Vec::new();
    Bsdiff::new(base, target)
        .compare(Cursor::new(&mut patch))
        .map_err(|e| Error::PatchComputeFailed {
            message: e.to_string(),
        })?;
    Ok(patch)
}

/// Apply a binary patch to `base`, yielding the target bytes.
///
/// `version` only labels the error: restoration reports which chain link
/// failed.
pub fn apply_patch(base: &[u8], patch: &[u8], version: u32) -> Result<Vec<u8>> {
    let patcher = Bspatch::new(patch).map_err(|e| Error::PatchFailed {
        version,
        message: format!("malformed patch: {}", e),
    })?;

    let mut target = Vec::with_capacity(patcher.hint_target_size() as usize);
    patcher
        .apply(base, Cursor::new(&mut target))
        .map_err(|e| Error::PatchFailed {
            version,
            message: e.to_string(),
        })?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_roundtrip() {
        let base = b"The quick brown fox jumps over the lazy dog".repeat(100);
        let mut target = base.clone();
        target.extend_from_slice(b" -- and then some new tail content");
        target[10] = b'X';

        let patch = compute_patch(&base, &target).unwrap();
        let restored = apply_patch(&base, &patch, 2).unwrap();
        assert_eq!(restored, target);
    }

    #[test]
    fn test_patch_of_identical_inputs_is_small() {
        let data = vec![7u8; 256 * 1024];
        let patch = compute_patch(&data, &data).unwrap();
        assert!(patch.len() < data.len() / 10);

        let restored = apply_patch(&data, &patch, 1).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn test_patch_from_empty_base() {
        let base = b"";
        let target = b"fresh content".to_vec();
        let patch = compute_patch(base, &target).unwrap();
        let restored = apply_patch(base, &patch, 1).unwrap();
        assert_eq!(restored, target);
    }

    #[test]
    fn test_apply_garbage_patch_fails() {
        let err = apply_patch(b"base", b"definitely not a patch", 9).unwrap_err();
        match err {
            Error::PatchFailed { version, .. } => assert_eq!(version, 9),
            other => panic!("expected PatchFailed, got {:?}", other),
        }
    }
}
