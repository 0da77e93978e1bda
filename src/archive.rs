//! Intermediate archive handling
//!
//! Binary patches are computed between byte-stable archive representations
//! of two versions. This module packs staged files and structured streams
//! into stored (uncompressed) zip archives, reads artifacts through the
//! right decoder, and guards temp files so they disappear on every exit
//! path.

use crate::error::{Error, Result};
use crate::repo::{OPTIMIZED_EXT, OPTIMIZED_EXT_LEGACY, SNAPSHOT_EXT};
use crate::stream::StructuredStreamReader;
use crate::types::StagedFile;
use lz4_flex::frame::FrameDecoder;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Deletes the guarded file on drop unless ownership is taken
#[derive(Debug)]
pub struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    /// Guard a path that is about to be created
    pub fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    /// The guarded path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the file and hand the path back
    pub fn into_path(mut self) -> PathBuf {
        self.armed = false;
        let path = std::mem::take(&mut self.path);
        path
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed && self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove temp file");
            }
        }
    }
}

fn stored_options(size: u64) -> FileOptions {
    FileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .large_file(size >= u32::MAX as u64)
}

/// Pack staged files into a stored zip archive at `dest`.
///
/// Unreadable files are skipped with a warning; the archive is still
/// produced. A skipped file will appear as deleted at restore time.
pub fn pack_staged_files(files: &[StagedFile], dest: &Path) -> Result<()> {
    let out = File::create(dest).map_err(|e| Error::io("creating temp archive", e))?;
    let mut writer = ZipWriter::new(out);

    for file in files {
        let data = match std::fs::read(&file.absolute_path) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(
                    path = %file.absolute_path.display(),
                    error = %e,
                    "Skipping unreadable staged file"
                );
                continue;
            }
        };

        writer.start_file(file.logical_path.as_str(), stored_options(data.len() as u64))?;
        writer
            .write_all(&data)
            .map_err(|e| Error::io(format!("writing archive entry {}", file.logical_path), e))?;
    }

    let mut out = writer.finish()?;
    out.flush().map_err(|e| Error::io("flushing temp archive", e))?;
    Ok(())
}

/// Re-pack a compressed structured stream as a stored zip archive.
///
/// Used to bring snapshot artifacts into the byte-stable form patches are
/// computed against.
pub fn structured_stream_to_archive(src: &Path, dest: &Path) -> Result<()> {
    let decoder = open_artifact_decoder(src)?;
    let mut reader = StructuredStreamReader::new(decoder);

    let out = File::create(dest).map_err(|e| Error::io("creating converted archive", e))?;
    let mut writer = ZipWriter::new(out);

    while let Some(header) = reader.next_record()? {
        writer.start_file(header.path.as_str(), stored_options(header.size))?;
        reader.read_content(&mut writer)?;
    }

    let mut out = writer.finish()?;
    out.flush().map_err(|e| Error::io("flushing converted archive", e))?;
    Ok(())
}

/// Write a single-entry stored zip archive from an in-memory document
pub fn single_entry_archive(logical_path: &str, content: &[u8], dest: &Path) -> Result<()> {
    let out = File::create(dest).map_err(|e| Error::io("creating archive", e))?;
    let mut writer = ZipWriter::new(out);
    writer.start_file(logical_path, stored_options(content.len() as u64))?;
    writer
        .write_all(content)
        .map_err(|e| Error::io("writing archive entry", e))?;
    let mut out = writer.finish()?;
    out.flush().map_err(|e| Error::io("flushing archive", e))?;
    Ok(())
}

/// Open a storage artifact through the decoder its extension calls for.
///
/// `.lz4` gets the fast-codec decoder, `.zst`/`.zstd` the higher-ratio
/// decoder; anything else is returned raw.
pub fn open_artifact_decoder(path: &Path) -> Result<Box<dyn Read>> {
    let file = File::open(path)
        .map_err(|e| Error::io(format!("opening artifact {}", path.display()), e))?;

    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    if ext == SNAPSHOT_EXT {
        Ok(Box::new(FrameDecoder::new(file)))
    } else if ext == OPTIMIZED_EXT || ext == OPTIMIZED_EXT_LEGACY {
        let decoder = zstd::stream::read::Decoder::new(file)
            .map_err(|e| Error::io("creating zstd decoder", e))?;
        Ok(Box::new(decoder))
    } else {
        Ok(Box::new(file))
    }
}

/// Read a single entry out of a stored archive, matching the verbatim
/// logical path first and its final component as a fallback
pub fn extract_archive_entry(archive_path: &Path, logical_path: &Path) -> Result<Option<Vec<u8>>> {
    let logical = logical_path.to_string_lossy();
    let target_name = logical.rsplit(['/', '\\']).next().unwrap_or(&logical);

    let file = File::open(archive_path)
        .map_err(|e| Error::io(format!("opening archive {}", archive_path.display()), e))?;
    let mut archive = zip::ZipArchive::new(file)?;

    let mut found_index = None;
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        let name = entry.name().to_string();
        let entry_base = name.rsplit(['/', '\\']).next().unwrap_or(&name);
        if name == logical || entry_base == target_name {
            found_index = Some(i);
            break;
        }
    }

    match found_index {
        Some(i) => {
            let mut entry = archive.by_index(i)?;
            let mut content = Vec::with_capacity(entry.size() as usize);
            entry
                .read_to_end(&mut content)
                .map_err(|e| Error::io("reading archive entry", e))?;
            Ok(Some(content))
        }
        None => Ok(None),
    }
}

/// Byte copy, used for legacy archive bases
pub fn copy_file(src: &Path, dest: &Path) -> Result<u64> {
    let mut from =
        File::open(src).map_err(|e| Error::io(format!("opening {}", src.display()), e))?;
    let mut to =
        File::create(dest).map_err(|e| Error::io(format!("creating {}", dest.display()), e))?;
    let copied = io::copy(&mut from, &mut to).map_err(|e| Error::io("copying file", e))?;
    to.flush().map_err(|e| Error::io("flushing copy", e))?;
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StructuredStreamWriter;
    use chrono::Utc;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("dvault-archive-tests").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn staged(dir: &Path, name: &str, content: &[u8]) -> StagedFile {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        StagedFile {
            absolute_path: path,
            logical_path: name.to_string(),
            size: content.len() as u64,
            mod_time: Utc::now(),
            extension: String::new(),
            file_type: "binary".to_string(),
        }
    }

    fn read_zip_entries(path: &Path) -> Vec<(String, Vec<u8>)> {
        let file = File::open(path).unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        let mut out = Vec::new();
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).unwrap();
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            out.push((entry.name().to_string(), content));
        }
        out
    }

    #[test]
    fn test_pack_staged_files() {
        let dir = temp_dir("pack");
        let files = vec![staged(&dir, "a.txt", b"alpha"), staged(&dir, "b.bin", b"beta")];
        let dest = dir.join("out.zip");

        pack_staged_files(&files, &dest).unwrap();

        let entries = read_zip_entries(&dest);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], ("a.txt".to_string(), b"alpha".to_vec()));
        assert_eq!(entries[1], ("b.bin".to_string(), b"beta".to_vec()));
    }

    #[test]
    fn test_pack_skips_unreadable_files() {
        let dir = temp_dir("pack-skip");
        let mut files = vec![staged(&dir, "ok.txt", b"fine")];
        files.push(StagedFile {
            absolute_path: dir.join("gone.txt"),
            logical_path: "gone.txt".to_string(),
            size: 4,
            mod_time: Utc::now(),
            extension: "txt".to_string(),
            file_type: "binary".to_string(),
        });
        let dest = dir.join("out.zip");

        pack_staged_files(&files, &dest).unwrap();

        let entries = read_zip_entries(&dest);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "ok.txt");
    }

    #[test]
    fn test_structured_stream_to_archive() {
        let dir = temp_dir("convert");
        let stream_path = dir.join("v1.lz4");
        {
            let file = File::create(&stream_path).unwrap();
            let mut writer = StructuredStreamWriter::new(file);
            writer.add_bytes("x.txt", b"xx").unwrap();
            writer.add_bytes("nested/y.txt", b"yy").unwrap();
            let mut file = writer.finish().unwrap();
            file.flush().unwrap();
        }

        let dest = dir.join("v1.zip");
        structured_stream_to_archive(&stream_path, &dest).unwrap();

        let entries = read_zip_entries(&dest);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], ("x.txt".to_string(), b"xx".to_vec()));
        assert_eq!(entries[1], ("nested/y.txt".to_string(), b"yy".to_vec()));
    }

    #[test]
    fn test_temp_guard_removes_file_on_drop() {
        let dir = temp_dir("guard");
        let path = dir.join("victim.tmp");
        std::fs::write(&path, b"x").unwrap();
        {
            let _guard = TempFileGuard::new(path.clone());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_temp_guard_into_path_keeps_file() {
        let dir = temp_dir("guard-keep");
        let path = dir.join("survivor.tmp");
        std::fs::write(&path, b"x").unwrap();
        let guard = TempFileGuard::new(path.clone());
        let kept = guard.into_path();
        assert!(kept.exists());
        std::fs::remove_file(kept).unwrap();
    }
}
