//! End-to-end engine tests
//!
//! Each test builds a throwaway repository layout, drives the engine
//! through commits, and checks artifacts, records, and restoration.

use dvault::delta::read_smart_envelope;
use dvault::fingerprint;
use dvault::layers::{LayerPosition, LayerRecord};
use dvault::repo::{self, RepositoryContext};
use dvault::scan::MetadataScanner;
use dvault::{CommitEngine, Config, Error, FileMetadata, StagedFile};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Create the repository layout the initializer collaborator would have
/// produced, plus a working directory
fn setup() -> (TempDir, PathBuf, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let repo_root = tmp.path().join(".dvault");
    for sub in ["snapshots", "deltas", "commits", "staging", "temp"] {
        std::fs::create_dir_all(repo_root.join(sub)).unwrap();
    }
    std::fs::write(repo_root.join("HEAD"), b"").unwrap();
    let work = tmp.path().join("work");
    std::fs::create_dir_all(&work).unwrap();
    (tmp, repo_root, work)
}

fn engine_with(repo_root: &Path, config: Config) -> CommitEngine {
    let ctx = RepositoryContext::open(repo_root).unwrap();
    CommitEngine::new(ctx, config, Box::new(dvault::ExtensionScanner))
}

fn stage(work: &Path, name: &str, content: &[u8]) -> StagedFile {
    let path = work.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    StagedFile::from_path(path, name).unwrap()
}

/// Deterministic pseudo-random bytes (no seed reuse across calls)
fn noise(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9e3779b97f4a7c15).wrapping_add(1);
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        out.push((state >> 33) as u8);
    }
    out
}

fn delta_everything() -> Config {
    Config {
        delta_threshold: 0,
        ..Config::default()
    }
}

#[test]
fn first_commit_is_full_snapshot() {
    let (_tmp, repo_root, work) = setup();
    let engine = engine_with(&repo_root, Config::default());

    let files = vec![stage(&work, "a.txt", b"hello\n")];
    let record = engine.create_commit("initial commit", &files).unwrap();

    assert_eq!(record.version, 1);
    assert_eq!(record.parent_hash, "");
    assert_eq!(record.files_count, 1);
    let info = record.compression_info.as_ref().unwrap();
    assert_eq!(info.strategy, "fast_snapshot");
    assert!(repo_root.join("snapshots/v1.lz4").exists());
    assert!(repo_root.join("commits/v1.json").exists());

    // HEAD carries the new commit's hash
    let head = std::fs::read_to_string(repo_root.join("HEAD")).unwrap();
    assert_eq!(head.trim(), record.hash);
    assert_eq!(record.hash.len(), 12);

    let hashes = engine.snapshot_file_hashes(1).unwrap();
    assert_eq!(
        hashes.get("a.txt").map(String::as_str),
        Some("5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03")
    );

    assert_eq!(engine.chain_length(1).unwrap(), 0);
    assert_eq!(engine.current_version().unwrap(), 1);
}

#[test]
fn empty_staging_list_is_rejected() {
    let (_tmp, repo_root, _work) = setup();
    let engine = engine_with(&repo_root, Config::default());
    let err = engine.create_commit("nothing", &[]).unwrap_err();
    assert!(matches!(err, Error::NoStagedFiles));
}

#[test]
fn second_commit_takes_binary_delta_and_restores() {
    let (_tmp, repo_root, work) = setup();
    let engine = engine_with(&repo_root, delta_everything());

    // A file large enough that a localized edit yields a worthwhile patch
    let mut content = b"design data ".repeat(6000);
    let v1 = vec![stage(&work, "a.bin", &content)];
    engine.create_commit("v1", &v1).unwrap();

    content[17] = b'!';
    content.extend_from_slice(b"tail");
    let v2 = vec![stage(&work, "a.bin", &content)];
    let record = engine.create_commit("v2", &v2).unwrap();

    let info = record.compression_info.as_ref().unwrap();
    assert_eq!(info.strategy, "binary_delta");
    assert_eq!(info.base_version, Some(1));
    assert!(repo_root.join("deltas/v2_from_v1.bsdiff").exists());
    assert!(!repo_root.join("snapshots/v2.lz4").exists());

    let hashes = engine.snapshot_file_hashes(2).unwrap();
    assert_eq!(
        hashes.get("a.bin").cloned().unwrap(),
        fingerprint::hash_bytes(&content)
    );
    assert_eq!(engine.chain_length(2).unwrap(), 1);
}

#[test]
fn oversized_file_forces_fresh_snapshot() {
    let (_tmp, repo_root, work) = setup();
    // Scaled-down thresholds: 64 KiB plays the role of the 100 MiB bound
    let config = Config {
        delta_threshold: 16 * 1024,
        snapshot_threshold: 64 * 1024,
        ..Config::default()
    };
    let engine = engine_with(&repo_root, config);

    let small = b"shared notes".repeat(100);
    engine
        .create_commit("v1", &[stage(&work, "notes.bin", &small)])
        .unwrap();

    // Above the snapshot threshold: rule 2 wins over the delta path
    let big = noise(7, 128 * 1024);
    let files = vec![stage(&work, "notes.bin", &small), stage(&work, "big.bin", &big)];
    let record = engine.create_commit("v2 adds big.bin", &files).unwrap();

    let info = record.compression_info.as_ref().unwrap();
    assert_eq!(info.strategy, "fast_snapshot");
    assert!(repo_root.join("snapshots/v2.lz4").exists());
    assert_eq!(engine.chain_length(2).unwrap(), 0);

    // Both files restore with correct content
    let hashes = engine.snapshot_file_hashes(2).unwrap();
    assert_eq!(hashes.len(), 2);
    assert_eq!(hashes["notes.bin"], fingerprint::hash_bytes(&small));
    assert_eq!(hashes["big.bin"], fingerprint::hash_bytes(&big));
}

#[test]
fn chain_is_capped_at_max_length() {
    let (_tmp, repo_root, work) = setup();
    let engine = engine_with(&repo_root, delta_everything());

    let mut content = vec![b'x'; 32 * 1024];
    engine
        .create_commit("v1", &[stage(&work, "doc.bin", &content)])
        .unwrap();

    // v2..v7, each a small edit
    for i in 0u8..6 {
        content[(i as usize + 1) * 100] = i;
        engine
            .create_commit(&format!("edit {}", i + 2), &[stage(&work, "doc.bin", &content)])
            .unwrap();
    }

    for version in 2..=6 {
        let record = engine.get_commit(version).unwrap();
        assert_eq!(
            record.compression_info.as_ref().unwrap().strategy,
            "binary_delta",
            "v{} should be a delta",
            version
        );
        assert_eq!(
            engine.chain_length(version).unwrap(),
            version - 1,
            "chain length of v{}",
            version
        );
    }

    // v7 re-anchors the chain with a fresh snapshot
    let v7 = engine.get_commit(7).unwrap();
    assert_eq!(v7.compression_info.as_ref().unwrap().strategy, "fast_snapshot");
    assert_eq!(engine.chain_length(7).unwrap(), 0);
    assert_eq!(engine.chain_length(6).unwrap(), 5);

    // Every chained version restores to its exact content
    let hashes = engine.snapshot_file_hashes(7).unwrap();
    assert_eq!(hashes["doc.bin"], fingerprint::hash_bytes(&content));
}

#[test]
fn inflated_delta_is_discarded_for_snapshot() {
    let (_tmp, repo_root, work) = setup();
    let engine = engine_with(&repo_root, delta_everything());

    // Two unrelated random payloads: the patch cannot beat the 95% bound
    engine
        .create_commit("v1", &[stage(&work, "art.raw", &noise(1, 64 * 1024))])
        .unwrap();
    let record = engine
        .create_commit("v2", &[stage(&work, "art.raw", &noise(2, 64 * 1024))])
        .unwrap();

    let info = record.compression_info.as_ref().unwrap();
    assert_eq!(info.strategy, "fast_snapshot");
    assert!(!repo_root.join("deltas/v2_from_v1.bsdiff").exists());
    assert!(repo_root.join("snapshots/v2.lz4").exists());
}

// Scanner stub for the layered-document scenario: the document content's
// marker selects which canned layer tree it parses to.
struct StubLayerScanner;

impl MetadataScanner for StubLayerScanner {
    fn scan(&self, file: &StagedFile) -> dvault::Result<FileMetadata> {
        Ok(FileMetadata::generic(file, None))
    }

    fn layer_tree(&self, path: &Path) -> dvault::Result<Vec<LayerRecord>> {
        let content = std::fs::read(path).map_err(|e| dvault::Error::io("reading stub doc", e))?;
        let layer = |id: u32, name: &str, hash: &str, opacity: u8| LayerRecord {
            id,
            name: name.to_string(),
            content_hash: hash.to_string(),
            opacity,
            visible: true,
            blend_mode: "normal".to_string(),
            position: LayerPosition::default(),
        };

        if content.starts_with(b"PSDA") {
            Ok(vec![
                layer(1, "Background", "bg-v1", 255),
                layer(2, "Title", "title-v1", 255),
            ])
        } else if content.starts_with(b"PSDB") {
            Ok(vec![
                layer(1, "Background", "bg-v2", 128),
                layer(3, "Headline", "title-v1", 255),
            ])
        } else {
            Err(dvault::Error::MetadataScanFailed {
                path: path.to_path_buf(),
                message: "unknown stub document".to_string(),
            })
        }
    }
}

#[test]
fn layered_document_commit_carries_change_analysis() {
    let (_tmp, repo_root, work) = setup();
    let ctx = RepositoryContext::open(&repo_root).unwrap();
    let engine = CommitEngine::new(ctx, Config::default(), Box::new(StubLayerScanner));

    let filler = b"layer pixels ".repeat(5000);
    let mut v1_doc = b"PSDA".to_vec();
    v1_doc.extend_from_slice(&filler);
    engine
        .create_commit("v1", &[stage(&work, "hero.psd", &v1_doc)])
        .unwrap();

    let mut v2_doc = b"PSDB".to_vec();
    v2_doc.extend_from_slice(&filler);
    let record = engine
        .create_commit("rename title, fade background", &[stage(&work, "hero.psd", &v2_doc)])
        .unwrap();

    let info = record.compression_info.as_ref().unwrap();
    assert_eq!(info.strategy, "layered_smart_delta");
    assert_eq!(info.base_version, Some(1));

    let artifact = repo_root.join("deltas/v2_from_v1.psd_smart");
    assert!(artifact.exists());

    let (header, document) = read_smart_envelope(&artifact).unwrap();
    assert_eq!(header.file_path, "hero.psd");
    assert_eq!(header.from_version, 1);
    assert_eq!(header.to_version, 2);
    assert_eq!(document, v2_doc);

    let analysis = &header.layer_analysis;
    assert_eq!(analysis.added.len(), 1);
    assert_eq!(analysis.added[0].layer_name, "Headline");
    assert_eq!(analysis.deleted.len(), 1);
    assert_eq!(analysis.deleted[0].layer_name, "Title");
    assert_eq!(analysis.modified.len(), 1);
    let modified = &analysis.modified[0];
    assert_eq!(modified.layer_name, "Background");
    let opacity = modified.property_changes.get("opacity").unwrap();
    assert_eq!(opacity.old, serde_json::json!(255));
    assert_eq!(opacity.new, serde_json::json!(128));

    // The smart delta restores as a full replacement of the document
    let hashes = engine.snapshot_file_hashes(2).unwrap();
    assert_eq!(hashes["hero.psd"], fingerprint::hash_bytes(&v2_doc));
}

#[test]
fn layered_commit_without_parser_falls_back_to_binary_delta() {
    let (_tmp, repo_root, work) = setup();
    // Default ExtensionScanner has no layer parser attached
    let engine = engine_with(&repo_root, Config::default());

    let doc = b"PSD \x01\x02".repeat(10000);
    engine
        .create_commit("v1", &[stage(&work, "hero.psd", &doc)])
        .unwrap();

    let mut edited = doc.clone();
    edited[100] = 0xff;
    let record = engine
        .create_commit("v2", &[stage(&work, "hero.psd", &edited)])
        .unwrap();

    let info = record.compression_info.as_ref().unwrap();
    assert_eq!(info.strategy, "binary_delta");
    assert!(repo_root.join("deltas/v2_from_v1.bsdiff").exists());
    assert!(!repo_root.join("deltas/v2_from_v1.psd_smart").exists());

    let hashes = engine.snapshot_file_hashes(2).unwrap();
    assert_eq!(hashes["hero.psd"], fingerprint::hash_bytes(&edited));
}

#[test]
fn restore_overwrites_working_tree() {
    let (_tmp, repo_root, work) = setup();
    let engine = engine_with(&repo_root, Config::default());

    let files = vec![
        stage(&work, "a.txt", b"version one"),
        stage(&work, "sub/b.txt", b"nested"),
    ];
    engine.create_commit("v1", &files).unwrap();

    // Mutate and pollute the working tree
    std::fs::write(work.join("a.txt"), b"dirty edit").unwrap();
    std::fs::remove_file(work.join("sub/b.txt")).unwrap();

    engine.restore_to_version(1, &work).unwrap();

    assert_eq!(std::fs::read(work.join("a.txt")).unwrap(), b"version one");
    assert_eq!(std::fs::read(work.join("sub/b.txt")).unwrap(), b"nested");

    // Temp area is clean after restoration
    let leftovers: Vec<_> = std::fs::read_dir(repo_root.join("temp")).unwrap().collect();
    assert!(leftovers.is_empty());
}

#[test]
fn status_comparison_produces_disjoint_sets() {
    let (_tmp, repo_root, work) = setup();
    let engine = engine_with(&repo_root, Config::default());

    let files = vec![
        stage(&work, "kept.txt", b"same"),
        stage(&work, "edited.txt", b"before"),
        stage(&work, "removed.txt", b"bye"),
    ];
    engine.create_commit("v1", &files).unwrap();

    // Working tree now: kept unchanged, edited modified, removed deleted,
    // fresh added
    let mut working = BTreeMap::new();
    working.insert("kept.txt".to_string(), fingerprint::hash_bytes(b"same"));
    working.insert("edited.txt".to_string(), fingerprint::hash_bytes(b"after"));
    working.insert("fresh.txt".to_string(), fingerprint::hash_bytes(b"new"));

    let report = engine.compare_with_version(1, &working).unwrap();
    assert_eq!(report.modified.len(), 1);
    assert_eq!(report.modified[0].path, "edited.txt");
    assert_eq!(report.untracked.len(), 1);
    assert_eq!(report.untracked[0].path, "fresh.txt");
    assert_eq!(report.deleted.len(), 1);
    assert_eq!(report.deleted[0].path, "removed.txt");
    assert!(report.staged.is_empty());
}

#[test]
fn fingerprints_of_empty_history_are_empty() {
    let (_tmp, repo_root, _work) = setup();
    let engine = engine_with(&repo_root, Config::default());
    assert!(engine.snapshot_file_hashes(0).unwrap().is_empty());
}

#[test]
fn restoring_missing_version_reports_missing_artifact() {
    let (_tmp, repo_root, work) = setup();
    let engine = engine_with(&repo_root, Config::default());
    let err = engine.restore_to_version(3, &work).unwrap_err();
    assert!(matches!(err, Error::ArtifactMissing { version: 3 }));
}

#[test]
fn broken_chain_is_reported() {
    let (_tmp, repo_root, work) = setup();
    let engine = engine_with(&repo_root, delta_everything());

    let mut content = vec![b'q'; 16 * 1024];
    engine
        .create_commit("v1", &[stage(&work, "f.bin", &content)])
        .unwrap();
    content[5] = b'z';
    engine
        .create_commit("v2", &[stage(&work, "f.bin", &content)])
        .unwrap();

    // Sever the chain
    std::fs::remove_file(repo_root.join("snapshots/v1.lz4")).unwrap();

    let err = engine.snapshot_file_hashes(2).unwrap_err();
    assert!(matches!(err, Error::ChainBroken { version: 1 }));
}

#[test]
fn startup_recovery_repairs_repository() {
    let (_tmp, repo_root, work) = setup();
    let engine = engine_with(&repo_root, Config::default());
    let record = engine
        .create_commit("v1", &[stage(&work, "a.txt", b"content")])
        .unwrap();

    // Simulate a crash: orphaned artifact, stale temp file, partial
    // optimizer output, clobbered HEAD
    std::fs::write(repo_root.join("snapshots/v9.lz4"), b"orphan").unwrap();
    std::fs::write(repo_root.join("temp/stale.zip"), b"junk").unwrap();
    std::fs::write(repo_root.join("deltas/v9_optimized.zst.part"), b"half").unwrap();
    std::fs::write(repo_root.join("HEAD"), b"deadbeef0000").unwrap();

    let ctx = RepositoryContext::open(&repo_root).unwrap();
    repo::recover_on_startup(&ctx).unwrap();

    assert!(!repo_root.join("snapshots/v9.lz4").exists());
    assert!(!repo_root.join("temp/stale.zip").exists());
    assert!(!repo_root.join("deltas/v9_optimized.zst.part").exists());
    let head = std::fs::read_to_string(repo_root.join("HEAD")).unwrap();
    assert_eq!(head.trim(), record.hash);

    // The surviving commit still restores
    let hashes = engine.snapshot_file_hashes(1).unwrap();
    assert_eq!(hashes["a.txt"], fingerprint::hash_bytes(b"content"));
}

#[test]
fn background_optimization_creates_preferred_artifact() {
    let (_tmp, repo_root, work) = setup();
    let config = Config {
        background_optimize: true,
        optimize_delay_secs: 0,
        ..Config::default()
    };
    let engine = engine_with(&repo_root, config);

    let content = b"optimizable content ".repeat(2000);
    engine
        .create_commit("v1", &[stage(&work, "a.bin", &content)])
        .unwrap();

    // Join the background task, then verify the optimized copy
    engine.shutdown();
    assert!(repo_root.join("deltas/v1_optimized.zst").exists());
    // The primary snapshot is never removed
    assert!(repo_root.join("snapshots/v1.lz4").exists());

    // Locate still prefers the primary; removing it falls through to the
    // optimized copy and restoration keeps working
    std::fs::remove_file(repo_root.join("snapshots/v1.lz4")).unwrap();
    let hashes = engine.snapshot_file_hashes(1).unwrap();
    assert_eq!(hashes["a.bin"], fingerprint::hash_bytes(&content));
}

#[test]
fn unreadable_staged_file_is_skipped_and_appears_deleted() {
    let (_tmp, repo_root, work) = setup();
    let engine = engine_with(&repo_root, Config::default());

    let mut files = vec![stage(&work, "good.txt", b"fine")];
    let ghost = stage(&work, "ghost.txt", b"soon gone");
    std::fs::remove_file(&ghost.absolute_path).unwrap();
    files.push(ghost);

    let record = engine.create_commit("v1", &files).unwrap();
    assert_eq!(record.files_count, 2);

    let hashes = engine.snapshot_file_hashes(1).unwrap();
    assert!(hashes.contains_key("good.txt"));
    assert!(!hashes.contains_key("ghost.txt"));
}

#[test]
fn legacy_archive_snapshots_are_readable() {
    let (_tmp, repo_root, _work) = setup();
    let engine = engine_with(&repo_root, Config::default());

    // A v1 snapshot left behind by an archive-format repository
    std::fs::create_dir_all(repo_root.join("objects")).unwrap();
    let zip_path = repo_root.join("objects/v1.zip");
    {
        let file = std::fs::File::create(&zip_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default();
        writer.start_file("old.txt", options).unwrap();
        std::io::Write::write_all(&mut writer, b"from the before times").unwrap();
        writer.finish().unwrap();
    }

    let hashes = engine.snapshot_file_hashes(1).unwrap();
    assert_eq!(
        hashes["old.txt"],
        fingerprint::hash_bytes(b"from the before times")
    );
}

#[test]
fn migrated_snapshot_location_is_probed() {
    let (_tmp, repo_root, work) = setup();
    let engine = engine_with(&repo_root, Config::default());

    engine
        .create_commit("v1", &[stage(&work, "a.txt", b"migrate me")])
        .unwrap();

    // Housekeeping moved the hot artifact out of snapshots/
    std::fs::rename(
        repo_root.join("snapshots/v1.lz4"),
        repo_root.join("deltas/v1.lz4"),
    )
    .unwrap();

    let hashes = engine.snapshot_file_hashes(1).unwrap();
    assert_eq!(hashes["a.txt"], fingerprint::hash_bytes(b"migrate me"));
}

#[test]
fn versions_are_assigned_without_gaps() {
    let (_tmp, repo_root, work) = setup();
    let engine = engine_with(&repo_root, Config::default());

    for i in 1..=3 {
        let record = engine
            .create_commit(
                &format!("commit {}", i),
                &[stage(&work, "f.txt", format!("rev {}", i).as_bytes())],
            )
            .unwrap();
        assert_eq!(record.version, i);
    }

    // parent_hash links the linear history
    let v2 = engine.get_commit(2).unwrap();
    let v1 = engine.get_commit(1).unwrap();
    assert_eq!(v2.parent_hash, v1.hash);

    // History lists newest first
    let history = engine.history().unwrap();
    assert_eq!(
        history.iter().map(|r| r.version).collect::<Vec<_>>(),
        vec![3, 2, 1]
    );
}
