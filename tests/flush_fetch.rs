//! Flush to the parallel file system and fetch back into cache.

mod common;

use common::{pattern, user_file, Cluster};
use oxiscr::index::Index;
use oxiscr::{CopyType, Scr};

/// Write one checkpoint with flush-every-checkpoint and CRC enabled.
fn run_and_flush(cluster: &Cluster, size: usize) {
    cluster.run(CopyType::Xor, move |rank, comm, mut params| {
        params.flush = 1;
        params.crc_on_flush = true;
        let mut scr = Scr::init(Box::new(comm), params).unwrap();
        scr.start_checkpoint().unwrap();
        let path = scr.route_file(&user_file(rank)).unwrap();
        std::fs::write(&path, pattern(rank, size)).unwrap();
        scr.complete_checkpoint(true).unwrap();
    });
}

/// Synchronous flush publishes the summary, the files, the sidecars, the
/// current symlink, and a complete index entry.
#[test]
fn flush_publishes_checkpoint() {
    let cluster = Cluster::new(4, 1);
    run_and_flush(&cluster, 128 * 1024);

    let current = cluster.pfs().join("scr.current");
    let target = std::fs::read_link(&current).expect("current symlink exists");
    let dir = cluster.pfs().join(&target);

    assert!(dir.join("summary.scr").exists(), "summary file missing");
    for rank in 0..4 {
        let file = dir.join(format!("rank_{}.ckpt", rank));
        assert_eq!(std::fs::read(&file).unwrap(), pattern(rank, 128 * 1024));
        assert!(file.with_extension("ckpt.scr").exists(), "sidecar missing");
    }
    // Redundancy artifacts stay in cache.
    assert!(common::files_with_suffix(&dir, ".xor").is_empty());

    let index = Index::read(&cluster.pfs()).unwrap();
    assert_eq!(
        index.checkpoint_id_by_dir(&target.to_string_lossy()),
        Some(1)
    );
    assert_eq!(
        index.most_recent_complete(None).map(|(id, _)| id),
        Some(1)
    );
}

/// Lose every node: restart falls back to fetching from the parallel file
/// system, verifies CRCs, re-encodes redundancy, and the application reads
/// its original bytes.
#[test]
fn fetch_recovers_after_total_cache_loss() {
    let cluster = Cluster::new(4, 1);
    let size = 128 * 1024;
    run_and_flush(&cluster, size);

    cluster.wipe_all_nodes();

    cluster.run(CopyType::Xor, move |rank, comm, mut params| {
        params.flush = 1;
        params.crc_on_flush = true;
        let mut scr = Scr::init(Box::new(comm), params).unwrap();
        assert_eq!(scr.checkpoint_id(), 1, "rank {} did not fetch", rank);
        let path = scr.route_file(&user_file(rank)).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), pattern(rank, size));
    });

    // The fetch re-applied xor protection in cache.
    for node in 0..4 {
        let artifacts = common::files_with_suffix(&cluster.ckpt_dir(node, 1), ".xor");
        assert_eq!(artifacts.len(), 1, "node {} missing re-encoded artifact", node);
    }
}

/// A corrupt file on the parallel file system fails the CRC check during
/// fetch; with no older checkpoint the restart comes up empty.
#[test]
fn fetch_rejects_corrupt_file() {
    let cluster = Cluster::new(4, 1);
    run_and_flush(&cluster, 64 * 1024);

    let target = std::fs::read_link(cluster.pfs().join("scr.current")).unwrap();
    let victim = cluster.pfs().join(&target).join("rank_2.ckpt");
    let mut bytes = std::fs::read(&victim).unwrap();
    bytes[100] ^= 0xff;
    std::fs::write(&victim, bytes).unwrap();

    cluster.wipe_all_nodes();

    cluster.run(CopyType::Xor, |_rank, comm, mut params| {
        params.flush = 1;
        params.crc_on_flush = true;
        let scr = Scr::init(Box::new(comm), params).unwrap();
        assert_eq!(scr.checkpoint_id(), 0, "corrupt checkpoint must not load");
    });
}

/// A legacy (version 4, tab-separated) summary is read, upconverted in
/// memory, and fetched with CRC verification.
#[test]
fn fetch_reads_legacy_v4_summary() {
    let cluster = Cluster::new(4, 1);
    let size = 32 * 1024;

    // Hand-build a legacy checkpoint directory for checkpoint 2.
    let dir = cluster.pfs().join("scr.legacy.job1.2");
    std::fs::create_dir_all(&dir).unwrap();
    let mut rows = String::new();
    for rank in 0..4 {
        let payload = pattern(rank, size);
        let file = dir.join(format!("rank_{}.ckpt", rank));
        std::fs::write(&file, &payload).unwrap();
        let crc = crc32fast::hash(&payload);
        rows.push_str(&format!(
            "{} 1 4 2 1 {} 1 {} /old/run/rank_{}.ckpt 1 {:#x}\n",
            rank,
            size,
            size,
            rank,
            crc
        ));
    }
    let text = format!("Version: 4\nRows: 4\nrank scr ranks ckpt complete exp match size file crc_c crc\n{}", rows);
    std::fs::write(dir.join("scr_summary.txt"), text).unwrap();
    std::os::unix::fs::symlink("scr.legacy.job1.2", cluster.pfs().join("scr.current")).unwrap();

    cluster.run(CopyType::Xor, move |rank, comm, mut params| {
        params.flush = 1;
        params.crc_on_flush = true;
        let mut scr = Scr::init(Box::new(comm), params).unwrap();
        assert_eq!(scr.checkpoint_id(), 2, "rank {} did not fetch legacy", rank);
        let path = scr.route_file(&user_file(rank)).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), pattern(rank, size));
    });
}
