//! Background snapshot optimization
//!
//! After a fast-snapshot commit the engine may re-encode the artifact
//! under the higher-ratio codec. The optimized copy is purely additive:
//! the primary snapshot is never removed, the locator simply prefers the
//! smaller file when the primary is gone.

use crate::error::{Error, Result};
use crate::repo::{RepositoryContext, PARTIAL_SUFFIX};
use lz4_flex::frame::FrameDecoder;
use parking_lot::Mutex;
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Zstd level for background re-encoding
const OPTIMIZE_ZSTD_LEVEL: i32 = 3;

/// Granularity of the start-delay shutdown poll
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Tracks background optimization tasks and joins them on shutdown.
///
/// Each task writes to a `.part` sibling and renames into place only on
/// success, so an interrupted task never leaves a half-written artifact
/// under the final name; leftover `.part` files are swept by startup
/// recovery.
pub struct OptimizationScheduler {
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    delay: Duration,
}

impl OptimizationScheduler {
    /// Create a scheduler whose tasks start after `delay`
    pub fn new(delay: Duration) -> Self {
        Self {
            handles: Mutex::new(Vec::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
            delay,
        }
    }

    /// Schedule re-encoding of `version`'s snapshot.
    ///
    /// The delay lets the user's interactive operation complete cleanly
    /// before disk bandwidth is spent on housekeeping.
    pub fn schedule(&self, ctx: &RepositoryContext, version: u32) {
        let snapshot = ctx.snapshot_path(version);
        let optimized = ctx.optimized_path(version);
        let shutdown = Arc::clone(&self.shutdown);
        let delay = self.delay;

        let handle = std::thread::spawn(move || {
            let mut waited = Duration::ZERO;
            while waited < delay {
                if shutdown.load(Ordering::Relaxed) {
                    tracing::debug!(version, "Optimization cancelled before start");
                    return;
                }
                let step = SHUTDOWN_POLL.min(delay - waited);
                std::thread::sleep(step);
                waited += step;
            }

            // Past the delay the task runs to completion; shutdown joins it
            match reencode_snapshot(&snapshot, &optimized) {
                Ok(bytes) => {
                    tracing::info!(version, bytes, path = %optimized.display(), "Snapshot optimized")
                }
                Err(e) => {
                    tracing::warn!(version, error = %e, "Background optimization failed")
                }
            }
        });

        self.handles.lock().push(handle);
    }

    /// Number of tasks still outstanding
    pub fn outstanding(&self) -> usize {
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.len()
    }

    /// Signal shutdown and join every outstanding task
    pub fn join_on_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::warn!("Optimization task panicked");
            }
        }
    }
}

impl Drop for OptimizationScheduler {
    fn drop(&mut self) {
        self.join_on_shutdown();
    }
}

/// Decode the fast-codec snapshot and re-encode it under the higher-ratio
/// codec, via a `.part` file renamed into place on success.
fn reencode_snapshot(snapshot: &PathBuf, optimized: &PathBuf) -> Result<u64> {
    let partial = PathBuf::from(format!("{}{}", optimized.display(), PARTIAL_SUFFIX));

    let result = (|| -> Result<u64> {
        let input =
            File::open(snapshot).map_err(|e| Error::io("opening snapshot for optimization", e))?;
        let mut decoder = FrameDecoder::new(input);

        let output =
            File::create(&partial).map_err(|e| Error::io("creating optimized file", e))?;
        let mut encoder = zstd::stream::write::Encoder::new(output, OPTIMIZE_ZSTD_LEVEL)
            .map_err(|e| Error::io("creating zstd encoder", e))?;

        let bytes = std::io::copy(&mut decoder, &mut encoder)
            .map_err(|e| Error::io("re-encoding snapshot", e))?;

        let output = encoder
            .finish()
            .map_err(|e| Error::io("finishing zstd stream", e))?;
        output
            .sync_all()
            .map_err(|e| Error::io("syncing optimized file", e))?;

        std::fs::rename(&partial, optimized)
            .map_err(|e| Error::io("publishing optimized file", e))?;
        Ok(bytes)
    })();

    if result.is_err() {
        std::fs::remove_file(&partial).ok();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{StructuredStreamReader, StructuredStreamWriter};
    use std::io::Write as _;
    use std::path::Path;

    fn repo(name: &str) -> RepositoryContext {
        let dir = std::env::temp_dir().join("dvault-optimize-tests").join(name);
        std::fs::remove_dir_all(&dir).ok();
        for sub in ["snapshots", "deltas", "commits", "temp"] {
            std::fs::create_dir_all(dir.join(sub)).unwrap();
        }
        RepositoryContext::open(&dir).unwrap()
    }

    fn write_snapshot_artifact(path: &Path) {
        let file = File::create(path).unwrap();
        let mut writer = StructuredStreamWriter::new(file);
        writer.add_bytes("a.txt", b"optimize me please").unwrap();
        let mut file = writer.finish().unwrap();
        file.flush().unwrap();
    }

    #[test]
    fn test_reencode_produces_equivalent_stream() {
        let ctx = repo("reencode");
        let snapshot = ctx.snapshot_path(1);
        write_snapshot_artifact(&snapshot);

        let optimized = ctx.optimized_path(1);
        reencode_snapshot(&snapshot, &optimized).unwrap();
        assert!(optimized.exists());

        // The optimized artifact decodes to the same structured stream
        let decoder = crate::archive::open_artifact_decoder(&optimized).unwrap();
        let mut reader = StructuredStreamReader::new(decoder);
        let header = reader.next_record().unwrap().unwrap();
        assert_eq!(header.path, "a.txt");
        assert_eq!(reader.read_content_to_vec().unwrap(), b"optimize me please");
    }

    #[test]
    fn test_scheduler_runs_task() {
        let ctx = repo("sched");
        let snapshot = ctx.snapshot_path(2);
        write_snapshot_artifact(&snapshot);

        let scheduler = OptimizationScheduler::new(Duration::ZERO);
        scheduler.schedule(&ctx, 2);
        scheduler.join_on_shutdown();

        assert!(ctx.optimized_path(2).exists());
        assert_eq!(scheduler.outstanding(), 0);
    }

    #[test]
    fn test_shutdown_before_delay_cancels() {
        let ctx = repo("cancel");
        let snapshot = ctx.snapshot_path(3);
        write_snapshot_artifact(&snapshot);

        let scheduler = OptimizationScheduler::new(Duration::from_secs(30));
        scheduler.schedule(&ctx, 3);
        scheduler.join_on_shutdown();

        // Cancelled before start: no artifact, no partial file
        assert!(!ctx.optimized_path(3).exists());
        let partial = ctx
            .deltas_dir()
            .join(format!("v3_optimized.zst{}", PARTIAL_SUFFIX));
        assert!(!partial.exists());
    }

    #[test]
    fn test_missing_snapshot_leaves_no_partial() {
        let ctx = repo("missing");
        let scheduler = OptimizationScheduler::new(Duration::ZERO);
        scheduler.schedule(&ctx, 9);
        scheduler.join_on_shutdown();

        assert!(!ctx.optimized_path(9).exists());
    }
}
