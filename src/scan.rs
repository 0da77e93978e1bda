//! Scanner seam
//!
//! The real file-type scanner (document parsing, layer extraction) is an
//! external collaborator; the engine consumes it through this trait. The
//! built-in [`ExtensionScanner`] classifies by extension only and is enough
//! for repositories without a document parser attached.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::layers::LayerRecord;
use crate::types::{FileMetadata, StagedFile};
use std::path::Path;

/// Supplies per-file metadata and, for layered documents, parsed layer trees
pub trait MetadataScanner: Send + Sync {
    /// Inspect a staged file and produce its commit-record metadata
    fn scan(&self, file: &StagedFile) -> Result<FileMetadata>;

    /// Parse the layer tree of a layered document at `path`.
    ///
    /// `path` is not necessarily the staged file: during smart-delta
    /// analysis the engine reconstructs the base version's document into a
    /// temp file and asks for its layers too.
    fn layer_tree(&self, path: &Path) -> Result<Vec<LayerRecord>>;
}

/// Default scanner: classifies by extension, never parses file internals
#[derive(Debug, Default, Clone)]
pub struct ExtensionScanner;

impl MetadataScanner for ExtensionScanner {
    fn scan(&self, file: &StagedFile) -> Result<FileMetadata> {
        if !file.absolute_path.exists() {
            return Err(Error::MetadataScanFailed {
                path: file.absolute_path.clone(),
                message: "file not found".to_string(),
            });
        }

        let metadata = match file.extension.as_str() {
            "psd" => FileMetadata::LayeredRaster {
                size: file.size,
                last_modified: file.mod_time,
                dimensions: None,
                color_mode: None,
                layer_count: 0,
                layer_names: Vec::new(),
            },
            "ai" | "sketch" => FileMetadata::Vector {
                size: file.size,
                last_modified: file.mod_time,
                dimensions: None,
                artboards: 0,
                objects: 0,
            },
            _ => FileMetadata::generic(file, None),
        };

        Ok(metadata)
    }

    fn layer_tree(&self, path: &Path) -> Result<Vec<LayerRecord>> {
        // Layer parsing belongs to the external scanner; without one
        // attached, smart-delta analysis falls back to a binary delta.
        Err(Error::MetadataScanFailed {
            path: path.to_path_buf(),
            message: "no document parser attached".to_string(),
        })
    }
}

impl ExtensionScanner {
    /// Check whether this scanner would treat the path as a layered document
    pub fn is_layered_path(path: &Path) -> bool {
        path.extension()
            .map(|e| Config::is_layered_extension(&e.to_string_lossy()))
            .unwrap_or(false)
    }
}
