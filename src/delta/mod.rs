//! Delta artifacts
//!
//! Two delta flavors share one skeleton: a binary patch between the base
//! and current version archives, or a layered smart delta that stores the
//! new document whole and carries a per-layer change analysis. The restore
//! path tells them apart by content, not extension, because older
//! producers used the extensions interchangeably.

pub mod patch;
pub mod writer;

pub use writer::write_delta;

use crate::error::{Error, Result};
use crate::layers::ChangeAnalysis;
use chrono::{DateTime, Utc};
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;

/// Magic first line of a layered smart delta artifact
pub const SMART_DELTA_MAGIC: &str = "LAYERED_SMART_DELTA_V1";

/// Which kind of delta artifact to produce
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaFlavor {
    /// Plain binary patch between version archives
    Binary,

    /// Smart delta for the named layered document
    LayeredSmart {
        /// Logical path of the layered document
        target: String,
    },
}

/// Metadata block at the head of a layered smart delta
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmartDeltaHeader {
    /// Logical path of the stored document
    pub file_path: String,

    /// Version the analysis was computed against
    pub from_version: u32,

    /// Version this artifact realizes
    pub to_version: u32,

    /// Uncompressed document size in bytes
    pub original_size: u64,

    /// When the artifact was produced
    pub created_at: DateTime<Utc>,

    /// Per-layer change analysis
    pub layer_analysis: ChangeAnalysis,
}

/// Check whether a delta artifact is a layered smart delta by sniffing its
/// magic line
pub fn is_smart_delta(path: &Path) -> Result<bool> {
    let mut file = File::open(path)
        .map_err(|e| Error::io(format!("opening delta artifact {}", path.display()), e))?;
    let mut prefix = [0u8; SMART_DELTA_MAGIC.len()];
    match file.read_exact(&mut prefix) {
        Ok(()) => Ok(&prefix == SMART_DELTA_MAGIC.as_bytes()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(Error::io("sniffing delta artifact", e)),
    }
}

/// Write a layered smart delta artifact:
///
/// ```text
/// LAYERED_SMART_DELTA_V1\n
/// METADATA_LENGTH:<len>\n
/// <len bytes of header JSON>
/// \nBINARY_DATA:\n
/// <fast-codec stream of the document bytes>
/// ```
pub fn write_smart_envelope(out: &mut File, header: &SmartDeltaHeader, document: &[u8]) -> Result<()> {
    let metadata = serde_json::to_vec_pretty(header)
        .map_err(|e| Error::stream(format!("encoding smart delta metadata: {}", e)))?;

    out.write_all(SMART_DELTA_MAGIC.as_bytes())
        .and_then(|_| out.write_all(b"\n"))
        .and_then(|_| out.write_all(format!("METADATA_LENGTH:{}\n", metadata.len()).as_bytes()))
        .and_then(|_| out.write_all(&metadata))
        .and_then(|_| out.write_all(b"\nBINARY_DATA:\n"))
        .map_err(|e| Error::io("writing smart delta envelope", e))?;

    let mut encoder = FrameEncoder::new(&mut *out);
    encoder
        .write_all(document)
        .map_err(|e| Error::io("compressing smart delta document", e))?;
    encoder
        .finish()
        .map_err(|e| Error::stream(format!("finishing smart delta stream: {}", e)))?;
    Ok(())
}

/// Parse a layered smart delta artifact into its header and document bytes
pub fn read_smart_envelope(path: &Path) -> Result<(SmartDeltaHeader, Vec<u8>)> {
    let file = File::open(path)
        .map_err(|e| Error::io(format!("opening smart delta {}", path.display()), e))?;
    let mut reader = BufReader::new(file);

    let mut line = String::new();
    reader
        .read_line(&mut line)
        .map_err(|e| Error::io("reading smart delta magic", e))?;
    if line.trim_end() != SMART_DELTA_MAGIC {
        return Err(Error::stream(format!(
            "not a layered smart delta: {}",
            path.display()
        )));
    }

    line.clear();
    reader
        .read_line(&mut line)
        .map_err(|e| Error::io("reading smart delta metadata length", e))?;
    let len: usize = line
        .trim_end()
        .strip_prefix("METADATA_LENGTH:")
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| Error::stream("malformed METADATA_LENGTH line".to_string()))?;

    let mut metadata = vec![0u8; len];
    reader
        .read_exact(&mut metadata)
        .map_err(|e| Error::io("reading smart delta metadata", e))?;
    let header: SmartDeltaHeader = serde_json::from_slice(&metadata)
        .map_err(|e| Error::stream(format!("decoding smart delta metadata: {}", e)))?;

    // Separator: "\nBINARY_DATA:\n"
    let mut separator = String::new();
    reader
        .read_line(&mut separator)
        .map_err(|e| Error::io("reading smart delta separator", e))?;
    if separator.trim().is_empty() {
        separator.clear();
        reader
            .read_line(&mut separator)
            .map_err(|e| Error::io("reading smart delta separator", e))?;
    }
    if separator.trim_end() != "BINARY_DATA:" {
        return Err(Error::stream("missing BINARY_DATA separator".to_string()));
    }

    let mut document = Vec::new();
    FrameDecoder::new(reader)
        .read_to_end(&mut document)
        .map_err(|e| Error::io("decompressing smart delta document", e))?;

    Ok((header, document))
}
