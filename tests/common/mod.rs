//! Test harness: a simulated cluster where every rank is a thread, every
//! node is a directory, and the parallel file system is a shared directory.
//!
//! Equal hostnames define a node, so a cluster of `nodes x per_node` ranks
//! exercises the same local/level communicator construction as a real job.
//! Wiping a node's directories between runs models losing that node.

use std::path::{Path, PathBuf};
use std::time::Duration;

use oxiscr::{CopyType, LocalComm, Params};

pub struct Cluster {
    dir: tempfile::TempDir,
    pub nodes: usize,
    pub per_node: usize,
}

#[allow(dead_code)]
impl Cluster {
    pub fn new(nodes: usize, per_node: usize) -> Cluster {
        let dir = tempfile::tempdir().expect("create cluster tempdir");
        std::fs::create_dir_all(dir.path().join("pfs")).unwrap();
        for node in 0..nodes {
            std::fs::create_dir_all(dir.path().join(format!("node{}", node)).join("cntl")).unwrap();
            std::fs::create_dir_all(dir.path().join(format!("node{}", node)).join("cache"))
                .unwrap();
        }
        Cluster {
            dir,
            nodes,
            per_node,
        }
    }

    pub fn ranks(&self) -> usize {
        self.nodes * self.per_node
    }

    pub fn node_of(&self, rank: usize) -> usize {
        rank / self.per_node
    }

    pub fn pfs(&self) -> PathBuf {
        self.dir.path().join("pfs")
    }

    pub fn node_dir(&self, node: usize) -> PathBuf {
        self.dir.path().join(format!("node{}", node))
    }

    /// Cache directory of one checkpoint on one node (descriptor 0).
    pub fn ckpt_dir(&self, node: usize, checkpoint_id: u64) -> PathBuf {
        self.node_dir(node)
            .join("cache/user/scr.job1/index.0")
            .join(format!("checkpoint.{}", checkpoint_id))
    }

    /// Parameters for one rank: per-node control and cache bases, a shared
    /// prefix, and buffer/poll settings sized for tests.
    pub fn params(&self, rank: usize, copy_type: CopyType) -> Params {
        let node = self.node_of(rank);
        let mut p = Params::default();
        p.username = Some("user".into());
        p.jobid = Some("job1".into());
        p.hostname = format!("node{}", node);
        p.cntl_base = self.node_dir(node).join("cntl");
        p.cache_base = self.node_dir(node).join("cache");
        p.prefix = self.pfs();
        p.copy_type = copy_type;
        p.hop_distance = 1;
        p.set_size = 4;
        p.cache_size = 2;
        p.flush = 0;
        p.flush_width = 4;
        p.fetch_width = 4;
        p.mpi_buf_size = 64 * 1024;
        p.file_buf_size = 64 * 1024;
        p.poll_interval = Duration::from_millis(25);
        p
    }

    /// Run one job: spawn a thread per rank and hand each its communicator
    /// and base parameters.
    pub fn run<T, F>(&self, copy_type: CopyType, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize, LocalComm, Params) -> T + Send + Sync,
    {
        let comms = LocalComm::world_with_timeout(self.ranks(), Duration::from_secs(60));
        std::thread::scope(|s| {
            let handles: Vec<_> = comms
                .into_iter()
                .enumerate()
                .map(|(rank, comm)| {
                    let f = &f;
                    let params = self.params(rank, copy_type);
                    s.spawn(move || f(rank, comm, params))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("rank thread panicked"))
                .collect()
        })
    }

    /// Lose a node: everything in its control and cache directories.
    pub fn wipe_node(&self, node: usize) {
        for sub in ["cntl", "cache"] {
            let path = self.node_dir(node).join(sub);
            let _ = std::fs::remove_dir_all(&path);
            std::fs::create_dir_all(&path).unwrap();
        }
    }

    /// Lose every node but keep the parallel file system.
    pub fn wipe_all_nodes(&self) {
        for node in 0..self.nodes {
            self.wipe_node(node);
        }
    }

    /// Delete all cached checkpoint files (and sidecars) in one node's
    /// checkpoint directory, leaving control files alone.
    pub fn wipe_ckpt_files(&self, node: usize, checkpoint_id: u64) {
        let dir = self.ckpt_dir(node, checkpoint_id);
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
}

/// Deterministic per-rank payload.
#[allow(dead_code)]
pub fn pattern(rank: usize, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (rank.wrapping_mul(31).wrapping_add(i.wrapping_mul(7)) & 0xff) as u8)
        .collect()
}

/// The user-side file name each rank writes.
#[allow(dead_code)]
pub fn user_file(rank: usize) -> PathBuf {
    PathBuf::from(format!("rank_{}.ckpt", rank))
}

/// Files matching a glob-ish suffix inside a directory.
#[allow(dead_code)]
pub fn files_with_suffix(dir: &Path, suffix: &str) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.to_string_lossy().ends_with(suffix) {
                out.push(path);
            }
        }
    }
    out.sort();
    out
}
