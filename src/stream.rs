//! Structured-stream codec
//!
//! The multi-file container used by full snapshots. Each file is one
//! record:
//!
//! ```text
//! FILE:<logical-path>:<byte-size>\n
//! <exactly byte-size bytes of content>
//! ```
//!
//! Records are concatenated with no index and no global header, and the
//! whole concatenation rides inside a single fast-block-compressed frame.
//! Logical paths are passed through byte-verbatim; only the first `FILE:`
//! split and the last `:` split are structural, so paths may contain
//! colons.

use crate::error::{Error, Result};
use lz4_flex::frame::FrameEncoder;
use std::io::{self, BufRead, BufReader, Read, Write};

/// Record prefix inside the decompressed stream
const RECORD_PREFIX: &[u8] = b"FILE:";

/// Writes the structured stream through the fast block compressor.
///
/// The sole writer for this format. Each source is buffered fully before
/// its header is emitted so the recorded size is authoritative; the format
/// has no recovery mechanism for a short record.
pub struct StructuredStreamWriter<W: Write> {
    encoder: FrameEncoder<W>,
    bytes_in: u64,
    files_written: u32,
}

impl<W: Write> StructuredStreamWriter<W> {
    /// Create a writer emitting a compressed structured stream into `sink`
    pub fn new(sink: W) -> Self {
        Self {
            encoder: FrameEncoder::new(sink),
            bytes_in: 0,
            files_written: 0,
        }
    }

    /// Append one record, reading the content from `source` to the end
    pub fn add_file(&mut self, logical_path: &str, source: &mut impl Read) -> Result<u64> {
        let mut content = Vec::new();
        source
            .read_to_end(&mut content)
            .map_err(|e| Error::io(format!("reading content for {}", logical_path), e))?;
        self.add_bytes(logical_path, &content)
    }

    /// Append one record from an in-memory buffer
    pub fn add_bytes(&mut self, logical_path: &str, content: &[u8]) -> Result<u64> {
        let header = format!("FILE:{}:{}\n", logical_path, content.len());
        self.encoder
            .write_all(header.as_bytes())
            .map_err(|e| Error::io(format!("writing record header for {}", logical_path), e))?;
        self.encoder
            .write_all(content)
            .map_err(|e| Error::io(format!("writing record content for {}", logical_path), e))?;

        self.bytes_in += content.len() as u64;
        self.files_written += 1;
        Ok(content.len() as u64)
    }

    /// Total uncompressed content bytes written so far (headers excluded)
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    /// Number of records written so far
    pub fn files_written(&self) -> u32 {
        self.files_written
    }

    /// Flush the compressor frame and hand the sink back
    pub fn finish(self) -> Result<W> {
        self.encoder
            .finish()
            .map_err(|e| Error::stream(format!("finishing compressed stream: {}", e)))
    }
}

/// Header of one record in the structured stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    /// Logical path, verbatim
    pub path: String,

    /// Exact content length in bytes
    pub size: u64,
}

/// Reads a structured stream record-at-a-time.
///
/// Owns the decompressor: callers hand in the raw decoded byte source and
/// never see the transport layer. Content not consumed before the next
/// `next_record` call is skipped automatically, which is what single-file
/// extraction relies on.
pub struct StructuredStreamReader<R: Read> {
    inner: BufReader<R>,
    pending: u64,
}

impl<R: Read> StructuredStreamReader<R> {
    /// Wrap an already-decoded byte source
    pub fn new(decoded: R) -> Self {
        Self {
            inner: BufReader::new(decoded),
            pending: 0,
        }
    }

    /// Advance to the next record header, skipping any unconsumed content
    /// of the previous record and any benign bytes that do not form a
    /// `FILE:` header line.
    pub fn next_record(&mut self) -> Result<Option<RecordHeader>> {
        self.skip_pending()?;

        let mut line = Vec::new();
        loop {
            line.clear();
            let read = self
                .inner
                .read_until(b'\n', &mut line)
                .map_err(|e| Error::io("reading record header", e))?;
            if read == 0 {
                return Ok(None); // clean EOF between records
            }

            if line.last() == Some(&b'\n') {
                line.pop();
            }

            if !line.starts_with(RECORD_PREFIX) {
                // Tolerance for benign bytes from older producers
                continue;
            }

            let rest = &line[RECORD_PREFIX.len()..];
            let Some(split_at) = rest.iter().rposition(|&b| b == b':') else {
                continue;
            };
            let (path_bytes, size_bytes) = rest.split_at(split_at);
            let size_text = std::str::from_utf8(&size_bytes[1..]).unwrap_or("");
            let Ok(size) = size_text.parse::<u64>() else {
                continue;
            };
            let path = String::from_utf8_lossy(path_bytes).into_owned();

            self.pending = size;
            return Ok(Some(RecordHeader { path, size }));
        }
    }

    /// Copy the current record's content into `sink`
    pub fn read_content(&mut self, sink: &mut impl Write) -> Result<u64> {
        let expected = self.pending;
        let copied = io::copy(&mut (&mut self.inner).take(expected), sink)
            .map_err(|e| Error::io("reading record content", e))?;
        self.pending = expected - copied;
        if copied != expected {
            return Err(Error::stream(format!(
                "truncated record: expected {} bytes, got {}",
                expected, copied
            )));
        }
        Ok(copied)
    }

    /// Read the current record's content into a buffer
    pub fn read_content_to_vec(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.pending.min(64 * 1024 * 1024) as usize);
        self.read_content(&mut buf)?;
        Ok(buf)
    }

    /// Discard the current record's content without surfacing it
    pub fn skip_content(&mut self) -> Result<()> {
        self.skip_pending()
    }

    fn skip_pending(&mut self) -> Result<()> {
        if self.pending == 0 {
            return Ok(());
        }
        let expected = self.pending;
        let skipped = io::copy(&mut (&mut self.inner).take(expected), &mut io::sink())
            .map_err(|e| Error::io("skipping record content", e))?;
        self.pending = 0;
        if skipped != expected {
            return Err(Error::stream(format!(
                "truncated record while skipping: expected {} bytes, got {}",
                expected, skipped
            )));
        }
        Ok(())
    }

    /// Walk the stream and extract a single file's content.
    ///
    /// Matches the verbatim logical path first and its final component as a
    /// fallback, which is how older producers referenced documents.
    pub fn extract_file(&mut self, logical_path: &str) -> Result<Option<Vec<u8>>> {
        let target_name = base_name(logical_path);
        while let Some(header) = self.next_record()? {
            if header.path == logical_path || base_name(&header.path) == target_name {
                return Ok(Some(self.read_content_to_vec()?));
            }
            self.skip_content()?;
        }
        Ok(None)
    }
}

fn base_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lz4_flex::frame::FrameDecoder;

    fn encode(pairs: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = StructuredStreamWriter::new(Vec::new());
        for (path, content) in pairs {
            writer.add_bytes(path, content).unwrap();
        }
        writer.finish().unwrap()
    }

    fn decode(bytes: &[u8]) -> Vec<(String, Vec<u8>)> {
        let mut reader = StructuredStreamReader::new(FrameDecoder::new(bytes));
        let mut out = Vec::new();
        while let Some(header) = reader.next_record().unwrap() {
            let content = reader.read_content_to_vec().unwrap();
            out.push((header.path, content));
        }
        out
    }

    #[test]
    fn test_roundtrip_preserves_order_and_content() {
        let pairs: &[(&str, &[u8])] = &[
            ("a.txt", b"hello\n"),
            ("art/hero.psd", b"\x00\x01\x02\xff binary"),
            ("b.txt", b"world"),
        ];
        let encoded = encode(pairs);
        let decoded = decode(&encoded);

        assert_eq!(decoded.len(), 3);
        for ((path, content), (got_path, got_content)) in pairs.iter().zip(&decoded) {
            assert_eq!(path, got_path);
            assert_eq!(content, &got_content.as_slice());
        }
    }

    #[test]
    fn test_zero_byte_file_roundtrips() {
        let encoded = encode(&[("empty.bin", b""), ("after.txt", b"x")]);
        let decoded = decode(&encoded);
        assert_eq!(decoded[0], ("empty.bin".to_string(), Vec::new()));
        assert_eq!(decoded[1], ("after.txt".to_string(), b"x".to_vec()));
    }

    #[test]
    fn test_path_with_colon_roundtrips() {
        let encoded = encode(&[("weird:name.bin", b"data")]);
        let decoded = decode(&encoded);
        assert_eq!(decoded[0].0, "weird:name.bin");
        assert_eq!(decoded[0].1, b"data");
    }

    #[test]
    fn test_benign_prefix_bytes_are_skipped() {
        // Simulate an older producer that wrote noise before the first record
        let mut raw = Vec::new();
        {
            let mut encoder = FrameEncoder::new(&mut raw);
            encoder.write_all(b"junk line\n").unwrap();
            encoder.write_all(b"FILE:a.txt:5\nhello").unwrap();
            encoder.finish().unwrap();
        }

        let mut reader = StructuredStreamReader::new(FrameDecoder::new(raw.as_slice()));
        let header = reader.next_record().unwrap().unwrap();
        assert_eq!(header.path, "a.txt");
        assert_eq!(reader.read_content_to_vec().unwrap(), b"hello");
        assert!(reader.next_record().unwrap().is_none());
    }

    #[test]
    fn test_extract_skips_non_matching_records() {
        let encoded = encode(&[
            ("one.bin", &[1u8; 4096]),
            ("two.bin", b"target"),
            ("three.bin", &[3u8; 128]),
        ]);

        let mut reader = StructuredStreamReader::new(FrameDecoder::new(encoded.as_slice()));
        let found = reader.extract_file("two.bin").unwrap().unwrap();
        assert_eq!(found, b"target");
    }

    #[test]
    fn test_extract_matches_base_name() {
        let encoded = encode(&[("designs/hero.psd", b"psd-bytes")]);
        let mut reader = StructuredStreamReader::new(FrameDecoder::new(encoded.as_slice()));
        let found = reader.extract_file("hero.psd").unwrap().unwrap();
        assert_eq!(found, b"psd-bytes");
    }

    #[test]
    fn test_extract_missing_returns_none() {
        let encoded = encode(&[("a.txt", b"a")]);
        let mut reader = StructuredStreamReader::new(FrameDecoder::new(encoded.as_slice()));
        assert!(reader.extract_file("nope.txt").unwrap().is_none());
    }

    #[test]
    fn test_unconsumed_content_is_skipped_on_next_record() {
        let encoded = encode(&[("a.bin", &[9u8; 1000]), ("b.bin", b"bb")]);
        let mut reader = StructuredStreamReader::new(FrameDecoder::new(encoded.as_slice()));

        let first = reader.next_record().unwrap().unwrap();
        assert_eq!(first.path, "a.bin");
        // Content deliberately not consumed
        let second = reader.next_record().unwrap().unwrap();
        assert_eq!(second.path, "b.bin");
        assert_eq!(reader.read_content_to_vec().unwrap(), b"bb");
    }

    #[test]
    fn test_writer_counts() {
        let mut writer = StructuredStreamWriter::new(Vec::new());
        writer.add_bytes("a", b"12345").unwrap();
        writer.add_bytes("b", b"").unwrap();
        assert_eq!(writer.bytes_in(), 5);
        assert_eq!(writer.files_written(), 2);
    }
}
