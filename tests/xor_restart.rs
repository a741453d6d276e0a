//! XOR redundancy round-trips: encode, lose members, rebuild on restart.

mod common;

use std::io::Read;

use common::{pattern, user_file, Cluster};
use oxiscr::kvtree::Kvtree;
use oxiscr::{CopyType, Scr};

const MIB: usize = 1024 * 1024;

/// Write one checkpoint of `sizes[rank]` bytes per rank and leave it in
/// cache (no finalize, as a crashed job would).
fn write_checkpoint(cluster: &Cluster, sizes: &[usize]) {
    let sizes = sizes.to_vec();
    cluster.run(CopyType::Xor, move |rank, comm, params| {
        let mut scr = Scr::init(Box::new(comm), params).unwrap();
        scr.start_checkpoint().unwrap();
        let path = scr.route_file(&user_file(rank)).unwrap();
        std::fs::write(&path, pattern(rank, sizes[rank])).unwrap();
        scr.complete_checkpoint(true).unwrap();
        assert_eq!(scr.checkpoint_id(), 1);
    });
}

/// Restart and check that every rank reads back its original bytes.
fn restart_and_verify(cluster: &Cluster, sizes: &[usize]) {
    let sizes = sizes.to_vec();
    cluster.run(CopyType::Xor, move |rank, comm, params| {
        let mut scr = Scr::init(Box::new(comm), params).unwrap();
        assert_eq!(scr.checkpoint_id(), 1, "rank {} did not recover", rank);
        assert!(scr.have_restart());
        let path = scr.route_file(&user_file(rank)).unwrap();
        let mut bytes = Vec::new();
        std::fs::File::open(&path)
            .unwrap()
            .read_to_end(&mut bytes)
            .unwrap();
        assert_eq!(bytes, pattern(rank, sizes[rank]), "rank {} data differs", rank);
    });
}

/// Two groups of four; lose one member of each group; rebuild restores the
/// lost files byte for byte.
#[test]
fn rebuild_one_member_per_group() {
    let cluster = Cluster::new(8, 1);
    let sizes = vec![MIB; 8];
    write_checkpoint(&cluster, &sizes);

    // Ranks 3 and 7 sit in different xor sets of size 4.
    cluster.wipe_ckpt_files(3, 1);
    cluster.wipe_ckpt_files(7, 1);

    restart_and_verify(&cluster, &sizes);
}

/// The parity artifact's payload is exactly ceil(max_bytes / (set - 1)),
/// and its header names the group.
#[test]
fn artifact_size_matches_chunk_rule() {
    let cluster = Cluster::new(4, 1);
    let sizes = vec![100 * 1024 + 3, 0, 5, 64 * 1024];
    write_checkpoint(&cluster, &sizes);

    let max_bytes = *sizes.iter().max().unwrap() as u64;
    let expect_chunk = (max_bytes + 3 - 1) / 3;

    for node in 0..4 {
        let dir = cluster.ckpt_dir(node, 1);
        let artifacts: Vec<_> = common::files_with_suffix(&dir, ".xor");
        assert_eq!(artifacts.len(), 1, "node {} has one artifact", node);

        let mut file = std::fs::File::open(&artifacts[0]).unwrap();
        let header = Kvtree::read_from(&mut file).unwrap();
        assert_eq!(header.get_u64("CHUNK"), Some(expect_chunk));
        assert_eq!(header.get_u64("CKPT"), Some(1));
        assert_eq!(
            header.get("GROUP").and_then(|g| g.get_u64("RANKS")),
            Some(4)
        );

        let mut payload = Vec::new();
        file.read_to_end(&mut payload).unwrap();
        assert_eq!(payload.len() as u64, expect_chunk);
    }
}

/// Zero-byte and wildly unequal files encode (chunk floor of one byte) and
/// rebuild exactly, including restoring the zero-byte file.
#[test]
fn unequal_and_zero_byte_files_rebuild() {
    let cluster = Cluster::new(4, 1);
    let sizes = vec![0, 3, 200 * 1024 + 17, 64 * 1024];
    write_checkpoint(&cluster, &sizes);

    cluster.wipe_ckpt_files(0, 1);
    restart_and_verify(&cluster, &sizes);

    cluster.wipe_ckpt_files(2, 1);
    restart_and_verify(&cluster, &sizes);
}

/// A crash between the filemap persist and the artifact close leaves a
/// stale entry pointing at a missing artifact; restart treats that member
/// as lost and rebuilds it.
#[test]
fn interrupted_encode_is_rebuilt() {
    let cluster = Cluster::new(4, 1);
    let sizes = vec![256 * 1024; 4];
    write_checkpoint(&cluster, &sizes);

    // Simulate the mid-encode crash on rank 1: the artifact (and the
    // sidecar written after it) vanish, the filemap entry stays.
    let dir = cluster.ckpt_dir(1, 1);
    for artifact in common::files_with_suffix(&dir, ".xor") {
        std::fs::remove_file(&artifact).unwrap();
    }
    for sidecar in common::files_with_suffix(&dir, ".xor.scr") {
        std::fs::remove_file(&sidecar).unwrap();
    }

    restart_and_verify(&cluster, &sizes);
}

/// Losing two members of the same group is beyond xor; restart finds no
/// usable checkpoint and comes up empty instead of wedging.
#[test]
fn two_losses_in_one_group_are_unrecoverable() {
    let cluster = Cluster::new(4, 1);
    let sizes = vec![64 * 1024; 4];
    write_checkpoint(&cluster, &sizes);

    cluster.wipe_ckpt_files(0, 1);
    cluster.wipe_ckpt_files(1, 1);

    cluster.run(CopyType::Xor, |_rank, comm, params| {
        let scr = Scr::init(Box::new(comm), params).unwrap();
        assert_eq!(scr.checkpoint_id(), 0, "unrecoverable checkpoint must not restore");
        assert!(!scr.have_restart());
    });
}
