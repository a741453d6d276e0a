//! Cache capacity enforcement and API state guards.

mod common;

use common::{pattern, user_file, Cluster};
use oxiscr::{CopyType, Error, Scr};

fn take_checkpoint(scr: &mut Scr, rank: usize, tag: usize, size: usize) {
    scr.start_checkpoint().unwrap();
    let path = scr.route_file(&user_file(rank)).unwrap();
    std::fs::write(&path, pattern(rank + tag, size)).unwrap();
    scr.complete_checkpoint(true).unwrap();
}

/// With a two-slot cache, the third checkpoint evicts the oldest; the two
/// newest stay readable.
#[test]
fn oldest_checkpoint_is_evicted_at_capacity() {
    let cluster = Cluster::new(2, 1);
    let size = 16 * 1024;

    cluster.run(CopyType::Partner, move |rank, comm, mut params| {
        params.cache_size = 2;
        let mut scr = Scr::init(Box::new(comm), params).unwrap();
        for tag in [10, 20, 30] {
            take_checkpoint(&mut scr, rank, tag, size);
        }
        assert_eq!(scr.checkpoint_id(), 3);
    });

    for node in 0..2 {
        assert!(!cluster.ckpt_dir(node, 1).exists(), "checkpoint 1 not evicted");
        assert!(cluster.ckpt_dir(node, 2).exists(), "checkpoint 2 missing");
        assert!(cluster.ckpt_dir(node, 3).exists(), "checkpoint 3 missing");
    }
}

/// Restart restores the newest cached checkpoint and clears out the rest;
/// cache slots are for what comes next.
#[test]
fn restart_keeps_only_newest_checkpoint() {
    let cluster = Cluster::new(2, 1);
    let size = 16 * 1024;

    cluster.run(CopyType::Partner, move |rank, comm, mut params| {
        params.cache_size = 2;
        let mut scr = Scr::init(Box::new(comm), params).unwrap();
        take_checkpoint(&mut scr, rank, 10, size);
        take_checkpoint(&mut scr, rank, 20, size);
    });

    cluster.run(CopyType::Partner, move |rank, comm, mut params| {
        params.cache_size = 2;
        let mut scr = Scr::init(Box::new(comm), params).unwrap();
        assert_eq!(scr.checkpoint_id(), 2);
        let path = scr.route_file(&user_file(rank)).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), pattern(rank + 20, size));
    });

    for node in 0..2 {
        assert!(!cluster.ckpt_dir(node, 1).exists(), "old checkpoint survived restart");
    }
}

/// The start/complete pairing is strict in both directions.
#[test]
fn api_rejects_unpaired_calls() {
    let cluster = Cluster::new(2, 1);

    cluster.run(CopyType::Partner, |rank, comm, params| {
        let mut scr = Scr::init(Box::new(comm), params).unwrap();

        assert!(matches!(
            scr.complete_checkpoint(true),
            Err(Error::InvalidOperation(_))
        ));

        scr.start_checkpoint().unwrap();
        assert!(matches!(
            scr.start_checkpoint(),
            Err(Error::InvalidOperation(_))
        ));

        let path = scr.route_file(&user_file(rank)).unwrap();
        std::fs::write(&path, b"state").unwrap();
        scr.complete_checkpoint(true).unwrap();

        // Completing again without a new start is rejected.
        assert!(matches!(
            scr.complete_checkpoint(true),
            Err(Error::InvalidOperation(_))
        ));
    });
}

/// A checkpoint budget in the halt file counts down once per checkpoint;
/// when it hits zero the library flushes the final checkpoint and reports
/// the halt instead of letting the job keep computing.
#[test]
fn halt_fires_when_checkpoint_budget_runs_out() {
    let cluster = Cluster::new(2, 1);

    // An operator grants the job two checkpoints.
    for node in 0..2 {
        let halt_dir = cluster.node_dir(node).join("cntl/user/scr.job1");
        std::fs::create_dir_all(&halt_dir).unwrap();
        let mut halt = oxiscr::kvtree::Kvtree::new();
        halt.set_u64("CheckpointsLeft", 2);
        halt.write_file(&halt_dir.join("halt.scrinfo")).unwrap();
    }

    cluster.run(CopyType::Partner, |rank, comm, mut params| {
        params.flush = 1;
        let mut scr = Scr::init(Box::new(comm), params).unwrap();

        scr.start_checkpoint().unwrap();
        let path = scr.route_file(&user_file(rank)).unwrap();
        std::fs::write(&path, pattern(rank, 4096)).unwrap();
        scr.complete_checkpoint(true).unwrap();

        scr.start_checkpoint().unwrap();
        let path = scr.route_file(&user_file(rank)).unwrap();
        std::fs::write(&path, pattern(rank + 1, 4096)).unwrap();
        let result = scr.complete_checkpoint(true);
        assert!(
            matches!(result, Err(Error::Halt(_))),
            "budget exhausted, expected a halt"
        );
    });

    // The final checkpoint was flushed on the way out.
    let current = std::fs::read_link(cluster.pfs().join("scr.current")).unwrap();
    let dir = cluster.pfs().join(&current);
    for rank in 0..2 {
        let file = dir.join(format!("rank_{}.ckpt", rank));
        assert_eq!(std::fs::read(&file).unwrap(), pattern(rank + 1, 4096));
    }
}

/// An invalid checkpoint (the application says its data is bad) is dropped
/// from cache instead of being protected.
#[test]
fn invalid_checkpoint_is_discarded() {
    let cluster = Cluster::new(2, 1);

    cluster.run(CopyType::Partner, |rank, comm, params| {
        let mut scr = Scr::init(Box::new(comm), params).unwrap();
        scr.start_checkpoint().unwrap();
        let path = scr.route_file(&user_file(rank)).unwrap();
        std::fs::write(&path, b"garbage").unwrap();
        let result = scr.complete_checkpoint(false);
        assert!(result.is_err(), "invalid checkpoint must not complete");
    });

    for node in 0..2 {
        assert!(!cluster.ckpt_dir(node, 1).exists());
    }
}
