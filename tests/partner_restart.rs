//! PARTNER redundancy surviving the loss of a whole node.

mod common;

use std::io::Read;

use common::{pattern, user_file, Cluster};
use oxiscr::{CopyType, Scr};

/// 16 ranks over 4 nodes with hop-distance 1. Lose the node hosting ranks
/// 4..=7; their partner copies live one node over on the level ring. On
/// restart the distributor rehomes the copies to the (fresh) node and the
/// re-encode restores full protection; every rank reads its original data.
#[test]
fn partner_survives_single_node_loss() {
    let cluster = Cluster::new(4, 4);
    let size = 256 * 1024;

    cluster.run(CopyType::Partner, |rank, comm, params| {
        let mut scr = Scr::init(Box::new(comm), params).unwrap();
        scr.start_checkpoint().unwrap();
        let path = scr.route_file(&user_file(rank)).unwrap();
        std::fs::write(&path, pattern(rank, size)).unwrap();
        scr.complete_checkpoint(true).unwrap();
    });

    // The node hosting ranks 4..=7 burns down.
    cluster.wipe_node(1);

    cluster.run(CopyType::Partner, |rank, comm, params| {
        let mut scr = Scr::init(Box::new(comm), params).unwrap();
        assert_eq!(scr.checkpoint_id(), 1, "rank {} did not recover", rank);
        let path = scr.route_file(&user_file(rank)).unwrap();
        let mut bytes = Vec::new();
        std::fs::File::open(&path)
            .unwrap()
            .read_to_end(&mut bytes)
            .unwrap();
        assert_eq!(bytes, pattern(rank, size), "rank {} data differs", rank);
    });
}

/// Losing a node plus the node holding its copies defeats PARTNER with
/// hop 1; the restart must come up empty rather than half-recovered.
#[test]
fn partner_cannot_survive_losing_both_copies() {
    let cluster = Cluster::new(4, 2);
    let size = 64 * 1024;

    cluster.run(CopyType::Partner, |rank, comm, params| {
        let mut scr = Scr::init(Box::new(comm), params).unwrap();
        scr.start_checkpoint().unwrap();
        let path = scr.route_file(&user_file(rank)).unwrap();
        std::fs::write(&path, pattern(rank, size)).unwrap();
        scr.complete_checkpoint(true).unwrap();
    });

    // Node 1's data and node 2 (which holds node 1's partner copies) both
    // vanish.
    cluster.wipe_node(1);
    cluster.wipe_node(2);

    cluster.run(CopyType::Partner, |_rank, comm, params| {
        let scr = Scr::init(Box::new(comm), params).unwrap();
        assert_eq!(scr.checkpoint_id(), 0);
    });
}

/// Distribution over an already-balanced cache is a no-op on the bytes:
/// every file keeps its path and contents.
#[test]
fn distribute_in_place_is_a_noop() {
    let cluster = Cluster::new(4, 1);
    let size = 32 * 1024;

    cluster.run(CopyType::Partner, |rank, comm, params| {
        let mut scr = Scr::init(Box::new(comm), params).unwrap();
        scr.start_checkpoint().unwrap();
        let path = scr.route_file(&user_file(rank)).unwrap();
        std::fs::write(&path, pattern(rank, size)).unwrap();
        scr.complete_checkpoint(true).unwrap();
    });

    let before: Vec<_> = (0..4)
        .map(|node| common::files_with_suffix(&cluster.ckpt_dir(node, 1), ".ckpt"))
        .collect();

    cluster.run(CopyType::Partner, |rank, comm, params| {
        let mut scr = Scr::init(Box::new(comm), params).unwrap();
        assert_eq!(scr.checkpoint_id(), 1);
        let path = scr.route_file(&user_file(rank)).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), pattern(rank, size));
    });

    let after: Vec<_> = (0..4)
        .map(|node| common::files_with_suffix(&cluster.ckpt_dir(node, 1), ".ckpt"))
        .collect();
    assert_eq!(before, after, "restart shuffled files it should have left alone");
}
