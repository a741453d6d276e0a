//! Asynchronous flush through the transfer daemon, and its interaction
//! with cache capacity.

mod common;

use common::{pattern, user_file, Cluster};
use oxiscr::index::Index;
use oxiscr::{CopyType, Scr};

/// An async flush drains the checkpoint through the transfer file while
/// the application keeps going; when the cache is full and everything
/// evictable is mid-flush, the next start blocks until that flush lands,
/// then takes the slot.
#[test]
fn async_flush_overtaken_by_next_checkpoint() {
    let cluster = Cluster::new(4, 1);
    let size = 2 * 1024 * 1024;

    cluster.run(CopyType::Xor, move |rank, comm, mut params| {
        params.flush = 1;
        params.flush_async = true;
        params.cache_size = 1;
        let mut scr = Scr::init(Box::new(comm), params).unwrap();

        // Checkpoint 10's worth of data; completing it kicks off the
        // async flush.
        scr.start_checkpoint().unwrap();
        let path = scr.route_file(&user_file(rank)).unwrap();
        std::fs::write(&path, pattern(rank, size)).unwrap();
        scr.complete_checkpoint(true).unwrap();

        // The cache holds one checkpoint and it is (or was) flushing;
        // starting the next must wait the flush out and evict it.
        scr.start_checkpoint().unwrap();
        let path = scr.route_file(&user_file(rank)).unwrap();
        std::fs::write(&path, pattern(rank + 100, size)).unwrap();
        scr.complete_checkpoint(true).unwrap();

        scr.finalize().unwrap();
    });

    // Both checkpoints made it to the parallel file system, complete.
    let index = Index::read(&cluster.pfs()).unwrap();
    for id in [1, 2] {
        let found = index.most_recent_complete(Some(id + 1));
        assert_eq!(found.map(|(i, _)| i), Some(id), "checkpoint {} not complete", id);
    }

    // The evicted checkpoint is gone from cache; the latest may remain.
    for node in 0..4 {
        assert!(
            !cluster.ckpt_dir(node, 1).exists(),
            "node {} still caches the evicted checkpoint",
            node
        );
    }

    // Data on the file system matches what each rank wrote.
    let index = Index::read(&cluster.pfs()).unwrap();
    let (_, dir2) = index.most_recent_complete(None).unwrap();
    for rank in 0..4 {
        let file = cluster.pfs().join(&dir2).join(format!("rank_{}.ckpt", rank));
        assert_eq!(std::fs::read(&file).unwrap(), pattern(rank + 100, size));
    }
}

/// Finalize with an async flush still in flight for the current checkpoint
/// cancels it and completes the flush synchronously; nothing is lost.
#[test]
fn finalize_completes_outstanding_flush() {
    let cluster = Cluster::new(2, 2);
    let size = 512 * 1024;

    cluster.run(CopyType::Partner, move |rank, comm, mut params| {
        params.flush = 1;
        params.flush_async = true;
        let mut scr = Scr::init(Box::new(comm), params).unwrap();

        scr.start_checkpoint().unwrap();
        let path = scr.route_file(&user_file(rank)).unwrap();
        std::fs::write(&path, pattern(rank, size)).unwrap();
        scr.complete_checkpoint(true).unwrap();

        scr.finalize().unwrap();
    });

    let current = std::fs::read_link(cluster.pfs().join("scr.current")).unwrap();
    let dir = cluster.pfs().join(&current);
    assert!(dir.join("summary.scr").exists());
    for rank in 0..4 {
        let file = dir.join(format!("rank_{}.ckpt", rank));
        assert_eq!(std::fs::read(&file).unwrap(), pattern(rank, size));
    }
}
