//! Core domain types for dvault

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Strategy name recorded for full snapshots
pub const STRATEGY_FAST_SNAPSHOT: &str = "fast_snapshot";

/// Strategy name recorded for plain binary deltas
pub const STRATEGY_BINARY_DELTA: &str = "binary_delta";

/// Strategy name recorded for layered smart deltas
pub const STRATEGY_LAYERED_SMART_DELTA: &str = "layered_smart_delta";

/// A file handed over by the staging collaborator for the next commit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagedFile {
    /// Absolute path in the working tree
    pub absolute_path: PathBuf,

    /// Logical path recorded in artifacts (relative, forward slashes)
    pub logical_path: String,

    /// File size in bytes at staging time
    pub size: u64,

    /// Last modification time at staging time
    pub mod_time: DateTime<Utc>,

    /// Lowercased extension without the leading dot ("psd", "png", ...)
    pub extension: String,

    /// Coarse type label supplied by the staging collaborator
    pub file_type: String,
}

impl StagedFile {
    /// Build a staged file entry from a working-tree path, reading size and
    /// mtime from the filesystem. Convenience for embedders and tests; the
    /// staging collaborator normally supplies these fields itself.
    pub fn from_path(
        absolute_path: impl Into<PathBuf>,
        logical_path: impl Into<String>,
    ) -> std::io::Result<Self> {
        let absolute_path = absolute_path.into();
        let logical_path = logical_path.into();
        let metadata = std::fs::metadata(&absolute_path)?;
        let mod_time: DateTime<Utc> = metadata.modified()?.into();
        let extension = absolute_path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let file_type = if crate::config::Config::is_layered_extension(&extension) {
            "layered".to_string()
        } else {
            "binary".to_string()
        };

        Ok(Self {
            absolute_path,
            logical_path,
            size: metadata.len(),
            mod_time,
            extension,
            file_type,
        })
    }

    /// Check whether this file is a layered-document format
    pub fn is_layered(&self) -> bool {
        crate::config::Config::is_layered_extension(&self.extension)
    }
}

/// Per-file metadata stored in a commit record.
///
/// Known file categories carry typed fields; anything a newer producer may
/// write that this build does not know about is preserved as an untyped map.
#[derive(Debug, Clone, PartialEq)]
pub enum FileMetadata {
    /// Layered raster documents (Photoshop and friends)
    LayeredRaster {
        size: u64,
        last_modified: DateTime<Utc>,
        dimensions: Option<String>,
        color_mode: Option<String>,
        layer_count: u32,
        layer_names: Vec<String>,
    },

    /// Vector illustration documents
    Vector {
        size: u64,
        last_modified: DateTime<Utc>,
        dimensions: Option<String>,
        artboards: u32,
        objects: u32,
    },

    /// Everything else
    Generic {
        size: u64,
        last_modified: DateTime<Utc>,
        scan_error: Option<String>,
    },

    /// Forward-compatibility fallback: unrecognized metadata passed through
    Other(BTreeMap<String, serde_json::Value>),
}

impl FileMetadata {
    /// Generic metadata for a staged file, optionally carrying the reason a
    /// deeper scan failed
    pub fn generic(file: &StagedFile, scan_error: Option<String>) -> Self {
        FileMetadata::Generic {
            size: file.size,
            last_modified: file.mod_time,
            scan_error,
        }
    }
}

// The on-disk form is a tagged object ("type": "layered_raster" | "vector"
// | "generic"); the fallback variant passes its map through verbatim.
impl Serialize for FileMetadata {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut object = serde_json::Map::new();
        match self {
            FileMetadata::LayeredRaster {
                size,
                last_modified,
                dimensions,
                color_mode,
                layer_count,
                layer_names,
            } => {
                object.insert("type".into(), "layered_raster".into());
                object.insert("size".into(), (*size).into());
                object.insert("last_modified".into(), last_modified.to_rfc3339().into());
                if let Some(dimensions) = dimensions {
                    object.insert("dimensions".into(), dimensions.clone().into());
                }
                if let Some(color_mode) = color_mode {
                    object.insert("color_mode".into(), color_mode.clone().into());
                }
                object.insert("layer_count".into(), (*layer_count).into());
                if !layer_names.is_empty() {
                    object.insert("layer_names".into(), layer_names.clone().into());
                }
            }
            FileMetadata::Vector {
                size,
                last_modified,
                dimensions,
                artboards,
                objects,
            } => {
                object.insert("type".into(), "vector".into());
                object.insert("size".into(), (*size).into());
                object.insert("last_modified".into(), last_modified.to_rfc3339().into());
                if let Some(dimensions) = dimensions {
                    object.insert("dimensions".into(), dimensions.clone().into());
                }
                object.insert("artboards".into(), (*artboards).into());
                object.insert("objects".into(), (*objects).into());
            }
            FileMetadata::Generic {
                size,
                last_modified,
                scan_error,
            } => {
                object.insert("type".into(), "generic".into());
                object.insert("size".into(), (*size).into());
                object.insert("last_modified".into(), last_modified.to_rfc3339().into());
                if let Some(scan_error) = scan_error {
                    object.insert("scan_error".into(), scan_error.clone().into());
                }
            }
            FileMetadata::Other(map) => {
                object.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        serde_json::Value::Object(object).serialize(serializer)
    }
}

// Unknown "type" tags must not fail the whole record, so deserialization
// goes through a Value and falls back to the untyped variant.
impl<'de> Deserialize<'de> for FileMetadata {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        let tag = value.get("type").and_then(|t| t.as_str()).unwrap_or("");

        #[derive(Deserialize)]
        struct LayeredFields {
            size: u64,
            last_modified: DateTime<Utc>,
            dimensions: Option<String>,
            color_mode: Option<String>,
            #[serde(default)]
            layer_count: u32,
            #[serde(default)]
            layer_names: Vec<String>,
        }

        #[derive(Deserialize)]
        struct VectorFields {
            size: u64,
            last_modified: DateTime<Utc>,
            dimensions: Option<String>,
            #[serde(default)]
            artboards: u32,
            #[serde(default)]
            objects: u32,
        }

        #[derive(Deserialize)]
        struct GenericFields {
            size: u64,
            last_modified: DateTime<Utc>,
            scan_error: Option<String>,
        }

        match tag {
            "layered_raster" => {
                let f: LayeredFields =
                    serde_json::from_value(value).map_err(D::Error::custom)?;
                Ok(FileMetadata::LayeredRaster {
                    size: f.size,
                    last_modified: f.last_modified,
                    dimensions: f.dimensions,
                    color_mode: f.color_mode,
                    layer_count: f.layer_count,
                    layer_names: f.layer_names,
                })
            }
            "vector" => {
                let f: VectorFields = serde_json::from_value(value).map_err(D::Error::custom)?;
                Ok(FileMetadata::Vector {
                    size: f.size,
                    last_modified: f.last_modified,
                    dimensions: f.dimensions,
                    artboards: f.artboards,
                    objects: f.objects,
                })
            }
            "generic" => {
                let f: GenericFields = serde_json::from_value(value).map_err(D::Error::custom)?;
                Ok(FileMetadata::Generic {
                    size: f.size,
                    last_modified: f.last_modified,
                    scan_error: f.scan_error,
                })
            }
            _ => {
                let map = match value {
                    serde_json::Value::Object(map) => map.into_iter().collect(),
                    other => {
                        let mut map = BTreeMap::new();
                        map.insert("value".to_string(), other);
                        map
                    }
                };
                Ok(FileMetadata::Other(map))
            }
        }
    }
}

/// Compression operation metrics persisted inside a commit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionInfo {
    /// Storage strategy: "fast_snapshot", "binary_delta",
    /// "layered_smart_delta", or a legacy name
    pub strategy: String,

    /// Artifact file name (relative to its storage directory)
    pub output_file: String,

    /// Sum of input sizes in bytes
    pub original_size: u64,

    /// Artifact size in bytes
    pub compressed_size: u64,

    /// compressed_size / original_size
    pub compression_ratio: f64,

    /// Base version for delta artifacts
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub base_version: Option<u32>,

    /// Wall-clock time the compression took
    pub compression_time_ms: f64,

    /// When the artifact was produced
    pub created_at: DateTime<Utc>,
}

/// A single commit in the linear history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRecord {
    /// 12-hex-digit commit identifier
    pub hash: String,

    /// Commit message
    pub message: String,

    /// Commit time
    pub timestamp: DateTime<Utc>,

    /// Author from configuration
    pub author: String,

    /// Number of files committed
    pub files_count: u32,

    /// Version number (1-based, no gaps)
    pub version: u32,

    /// Per-file metadata, keyed by logical path
    #[serde(default)]
    pub metadata: BTreeMap<String, FileMetadata>,

    /// Hash of the previous commit; empty for version 1
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent_hash: String,

    /// Legacy archive artifact name; only set for archive-format snapshots
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_zip: Option<String>,

    /// Compression metrics; authoritative over `snapshot_zip` when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_info: Option<CompressionInfo>,
}

impl CommitRecord {
    /// Artifact file name for this commit, preferring `compression_info`
    /// and falling back to the legacy `snapshot_zip` field
    pub fn artifact_name(&self) -> Option<&str> {
        if let Some(info) = &self.compression_info {
            return Some(info.output_file.as_str());
        }
        self.snapshot_zip.as_deref()
    }
}

/// Working-tree status of a single path relative to a version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStatus {
    /// Logical path
    pub path: String,

    /// "modified", "untracked", "deleted", or "staged"
    pub status: &'static str,
}

/// Result of comparing the working tree against a version's fingerprints
#[derive(Debug, Clone, Default)]
pub struct StatusReport {
    /// Path in both, content differs
    pub modified: Vec<FileStatus>,

    /// Path only in the working tree
    pub untracked: Vec<FileStatus>,

    /// Path only in the version
    pub deleted: Vec<FileStatus>,

    /// Reserved; populated by the staging collaborator
    pub staged: Vec<FileStatus>,
}
