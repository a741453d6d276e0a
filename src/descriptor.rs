//! Checkpoint descriptors and redundancy-group topology.
//!
//! A descriptor says where a checkpoint is cached (base tier, directory)
//! and how it is protected (LOCAL, PARTNER, or XOR with a set size and a
//! partner hop distance). Building a descriptor is collective: it splits a
//! group communicator out of the level communicator, exchanges hostnames
//! with ring neighbours, and disables itself everywhere if any process
//! lacks an off-node partner.

use std::path::{Path, PathBuf};

use crate::comm::{Comm, ReduceOp};
use crate::config::CkptDescConfig;
use crate::error::{Error, Result};
use crate::kvtree::Kvtree;

const KEY_ENABLED: &str = "ENABLED";
const KEY_INDEX: &str = "INDEX";
const KEY_INTERVAL: &str = "INTERVAL";
const KEY_BASE: &str = "BASE";
const KEY_DIRECTORY: &str = "DIRECTORY";
const KEY_TYPE: &str = "TYPE";
const KEY_HOP: &str = "HOP_DISTANCE";
const KEY_SET_SIZE: &str = "SET_SIZE";
const KEY_GROUPS: &str = "GROUPS";
const KEY_GROUP_ID: &str = "GROUP_ID";
const KEY_GROUP_RANK: &str = "GROUP_RANK";
const KEY_GROUP_SIZE: &str = "GROUP_SIZE";

/// Redundancy scheme. The set is closed; encode and rebuild dispatch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyType {
    /// Cache only; no cross-node protection.
    Local,
    /// Full copy on a partner node.
    Partner,
    /// Reduce-scatter parity across a set of nodes.
    Xor,
}

impl CopyType {
    /// Canonical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CopyType::Local => "LOCAL",
            CopyType::Partner => "PARTNER",
            CopyType::Xor => "XOR",
        }
    }

    /// Parse a case-insensitive name.
    pub fn parse(s: &str) -> Option<CopyType> {
        match s.to_ascii_uppercase().as_str() {
            "LOCAL" => Some(CopyType::Local),
            "PARTNER" => Some(CopyType::Partner),
            "XOR" => Some(CopyType::Xor),
            _ => None,
        }
    }
}

/// Everything descriptor construction needs to know about this process.
pub struct TopologyCtx<'a> {
    /// The world communicator.
    pub world: &'a dyn Comm,
    /// The level communicator (same node-local rank across nodes).
    pub level: &'a dyn Comm,
    /// This process's host name.
    pub hostname: &'a str,
    /// Rank in the world communicator.
    pub my_rank_world: usize,
    /// Rank in the level communicator.
    pub my_rank_level: usize,
    /// Processes on this node.
    pub ranks_local: usize,
    /// Processes in the job.
    pub ranks_world: usize,
    /// User owning the cache paths.
    pub username: &'a str,
    /// Job id used in cache paths.
    pub jobid: &'a str,
}

/// A constructed checkpoint descriptor, owning its group communicator.
pub struct Descriptor {
    /// Whether the descriptor may be used. Disabled descriptors keep their
    /// fields for diagnostics but take no checkpoints.
    pub enabled: bool,
    /// Position in the descriptor list.
    pub index: usize,
    /// Applies to checkpoint ids divisible by this interval.
    pub interval: u64,
    /// Cache tier root.
    pub base: PathBuf,
    /// Cache directory for this descriptor:
    /// `<base>/<user>/scr.<jobid>/index.<i>`.
    pub directory: PathBuf,
    /// Redundancy scheme.
    pub copy_type: CopyType,
    /// Node distance to the partner.
    pub hop_distance: usize,
    /// XOR set size.
    pub set_size: usize,
    /// The redundancy group communicator.
    pub comm: Box<dyn Comm>,
    /// Number of groups across the job.
    pub groups: usize,
    /// Group identity: the world rank of the group's rank 0.
    pub group_id: usize,
    /// This process's rank within the group.
    pub group_rank: usize,
    /// Number of processes in the group.
    pub group_size: usize,
    /// Left partner's rank in the group.
    pub lhs_rank: usize,
    /// Left partner's world rank.
    pub lhs_world: usize,
    /// Left partner's host name.
    pub lhs_host: String,
    /// Right partner's rank in the group.
    pub rhs_rank: usize,
    /// Right partner's world rank.
    pub rhs_world: usize,
    /// Right partner's host name.
    pub rhs_host: String,
}

impl Descriptor {
    /// Build a descriptor from configuration. Collective over the world.
    pub fn create(cfg: &CkptDescConfig, index: usize, ctx: &TopologyCtx<'_>) -> Result<Descriptor> {
        // Cross-node redundancy is impossible on a single node.
        let mut copy_type = cfg.copy_type;
        if ctx.ranks_local == ctx.ranks_world && copy_type != CopyType::Local {
            if ctx.my_rank_world == 0 {
                tracing::warn!(
                    index,
                    requested = copy_type.as_str(),
                    "single-node job, forcing copy type to LOCAL"
                );
            }
            copy_type = CopyType::Local;
        }

        let directory = ctx.build_directory(&cfg.base, index);

        let comm: Box<dyn Comm> = match copy_type {
            // A group of one: nobody to talk to.
            CopyType::Local => ctx.world.split(ctx.my_rank_world as i64, 0)?,
            CopyType::Partner => ctx.level.dup()?,
            CopyType::Xor => {
                let rel = ctx.my_rank_level / cfg.hop_distance.max(1);
                let modulo = ctx.my_rank_level % cfg.hop_distance.max(1);
                let split_id =
                    (rel / cfg.set_size.max(1)) * cfg.hop_distance.max(1) + modulo;
                ctx.level.split(split_id as i64, ctx.my_rank_world as i64)?
            }
        };

        let desc = Descriptor {
            enabled: cfg.enabled,
            index,
            interval: cfg.interval,
            base: cfg.base.clone(),
            directory,
            copy_type,
            hop_distance: cfg.hop_distance,
            set_size: cfg.set_size,
            comm,
            groups: 0,
            group_id: 0,
            group_rank: 0,
            group_size: 0,
            lhs_rank: 0,
            lhs_world: 0,
            lhs_host: String::new(),
            rhs_rank: 0,
            rhs_world: 0,
            rhs_host: String::new(),
        };
        desc.finish(ctx)
    }

    /// Rebuild a descriptor from a tree stored in a filemap, reusing the
    /// recorded group id and rank to reconstruct the communicator after a
    /// restart. Collective over the world.
    pub fn create_from_kvtree(tree: &Kvtree, ctx: &TopologyCtx<'_>) -> Result<Descriptor> {
        let missing = |key: &'static str| {
            Error::Corrupt {
                path: PathBuf::from("filemap"),
                reason: format!("descriptor record missing {}", key),
            }
        };
        let copy_type = CopyType::parse(tree.get_val(KEY_TYPE).ok_or_else(|| missing(KEY_TYPE))?)
            .ok_or_else(|| missing(KEY_TYPE))?;
        let group_id = tree.get_u64(KEY_GROUP_ID).ok_or_else(|| missing(KEY_GROUP_ID))?;
        let group_rank = tree
            .get_u64(KEY_GROUP_RANK)
            .ok_or_else(|| missing(KEY_GROUP_RANK))?;

        let comm = ctx.world.split(group_id as i64, group_rank as i64)?;

        let desc = Descriptor {
            enabled: tree.get_u64(KEY_ENABLED).unwrap_or(1) != 0,
            index: tree.get_u64(KEY_INDEX).unwrap_or(0) as usize,
            interval: tree.get_u64(KEY_INTERVAL).unwrap_or(1),
            base: PathBuf::from(tree.get_val(KEY_BASE).ok_or_else(|| missing(KEY_BASE))?),
            directory: PathBuf::from(
                tree.get_val(KEY_DIRECTORY)
                    .ok_or_else(|| missing(KEY_DIRECTORY))?,
            ),
            copy_type,
            hop_distance: tree.get_u64(KEY_HOP).unwrap_or(1) as usize,
            set_size: tree.get_u64(KEY_SET_SIZE).unwrap_or(8) as usize,
            comm,
            groups: tree.get_u64(KEY_GROUPS).unwrap_or(0) as usize,
            group_id: 0,
            group_rank: 0,
            group_size: 0,
            lhs_rank: 0,
            lhs_world: 0,
            lhs_host: String::new(),
            rhs_rank: 0,
            rhs_world: 0,
            rhs_host: String::new(),
        };
        desc.finish(ctx)
    }

    /// Common tail: group identity, partner links, validity. Collective.
    fn finish(mut self, ctx: &TopologyCtx<'_>) -> Result<Descriptor> {
        self.group_rank = self.comm.rank();
        self.group_size = self.comm.size();

        // Group identity is the world rank of the group's rank 0.
        let mut id_buf = if self.group_rank == 0 {
            (ctx.my_rank_world as u64).to_le_bytes().to_vec()
        } else {
            Vec::new()
        };
        self.comm.bcast(0, &mut id_buf)?;
        self.group_id = u64::from_le_bytes(
            id_buf
                .as_slice()
                .try_into()
                .map_err(|_| Error::Comm("bad group id broadcast".into()))?,
        ) as usize;

        self.groups = ctx
            .world
            .allreduce_i64((self.group_rank == 0) as i64, ReduceOp::Sum)?
            as usize;

        match self.copy_type {
            CopyType::Local => {}
            CopyType::Partner => self.set_partners(self.hop_distance as i64, ctx)?,
            CopyType::Xor => self.set_partners(1, ctx)?,
        }

        // Both partners must live on other nodes, or the scheme protects
        // nothing; if anyone fails the check, everyone disables.
        if self.copy_type != CopyType::Local {
            if self.lhs_host.is_empty()
                || self.rhs_host.is_empty()
                || self.lhs_host == ctx.hostname
                || self.rhs_host == ctx.hostname
            {
                tracing::warn!(
                    index = self.index,
                    lhs = %self.lhs_host,
                    rhs = %self.rhs_host,
                    "no off-node partner, disabling descriptor (too few nodes?)"
                );
                self.enabled = false;
            } else {
                tracing::debug!(
                    lhs = %self.lhs_host,
                    lhs_world = self.lhs_world,
                    rhs = %self.rhs_host,
                    rhs_world = self.rhs_world,
                    "partner links established"
                );
            }
        }

        if !ctx.world.alltrue(self.enabled)? {
            self.enabled = false;
        }
        Ok(self)
    }

    /// Find the ring neighbours `dist` apart and learn their hostnames and
    /// world ranks by shifting along the ring in both directions.
    fn set_partners(&mut self, dist: i64, ctx: &TopologyCtx<'_>) -> Result<()> {
        let n = self.group_size as i64;
        let me = self.group_rank as i64;
        let dist = ((dist % n) + n) % n;
        self.lhs_rank = ((me - dist + n) % n) as usize;
        self.rhs_rank = ((me + dist) % n) as usize;

        let comm = self.comm.as_ref();
        let host = ctx.hostname.as_bytes();
        let world = (ctx.my_rank_world as u64).to_le_bytes();

        // Shift hostnames to the right, then to the left.
        let lhs_host = comm.sendrecv(self.rhs_rank, host, self.lhs_rank)?;
        let rhs_host = comm.sendrecv(self.lhs_rank, host, self.rhs_rank)?;
        self.lhs_host = String::from_utf8_lossy(&lhs_host).into_owned();
        self.rhs_host = String::from_utf8_lossy(&rhs_host).into_owned();

        // Same for world ranks.
        let lhs_world = comm.sendrecv(self.rhs_rank, &world, self.lhs_rank)?;
        let rhs_world = comm.sendrecv(self.lhs_rank, &world, self.rhs_rank)?;
        self.lhs_world = u64::from_le_bytes(
            lhs_world
                .as_slice()
                .try_into()
                .map_err(|_| Error::Comm("bad partner rank message".into()))?,
        ) as usize;
        self.rhs_world = u64::from_le_bytes(
            rhs_world
                .as_slice()
                .try_into()
                .map_err(|_| Error::Comm("bad partner rank message".into()))?,
        ) as usize;
        Ok(())
    }

    /// Encode the descriptor for persistence in a filemap.
    pub fn to_kvtree(&self) -> Kvtree {
        let mut tree = Kvtree::new();
        tree.set_u64(KEY_ENABLED, self.enabled as u64);
        tree.set_u64(KEY_INDEX, self.index as u64);
        tree.set_u64(KEY_INTERVAL, self.interval);
        tree.set_val(KEY_BASE, &self.base.to_string_lossy());
        tree.set_val(KEY_DIRECTORY, &self.directory.to_string_lossy());
        tree.set_val(KEY_TYPE, self.copy_type.as_str());
        tree.set_u64(KEY_HOP, self.hop_distance as u64);
        tree.set_u64(KEY_SET_SIZE, self.set_size as u64);
        tree.set_u64(KEY_GROUPS, self.groups as u64);
        tree.set_u64(KEY_GROUP_ID, self.group_id as u64);
        tree.set_u64(KEY_GROUP_RANK, self.group_rank as u64);
        tree.set_u64(KEY_GROUP_SIZE, self.group_size as u64);
        tree
    }

    /// Cache directory for one checkpoint under this descriptor.
    pub fn checkpoint_dir(&self, checkpoint_id: u64) -> PathBuf {
        self.directory.join(format!("checkpoint.{}", checkpoint_id))
    }
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Descriptor")
            .field("enabled", &self.enabled)
            .field("index", &self.index)
            .field("interval", &self.interval)
            .field("copy_type", &self.copy_type)
            .field("group_id", &self.group_id)
            .field("group_rank", &self.group_rank)
            .field("group_size", &self.group_size)
            .finish_non_exhaustive()
    }
}

impl<'a> TopologyCtx<'a> {
    fn build_directory(&self, base: &Path, index: usize) -> PathBuf {
        base.join(self.username)
            .join(format!("scr.{}", self.jobid))
            .join(format!("index.{}", index))
    }
}

/// Pick the descriptor for a checkpoint id: among enabled descriptors whose
/// interval divides the id, the largest interval wins; ties keep the first
/// in list order.
pub fn descriptor_for(checkpoint_id: u64, descs: &[Descriptor]) -> Option<&Descriptor> {
    let mut best: Option<&Descriptor> = None;
    let mut best_interval = 0;
    for d in descs {
        if d.enabled && d.interval > best_interval && checkpoint_id % d.interval == 0 {
            best = Some(d);
            best_interval = d.interval;
        }
    }
    best
}

/// Base directory recorded in a filemap descriptor entry.
pub fn base_from_kvtree(tree: &Kvtree) -> Option<PathBuf> {
    tree.get_val(KEY_BASE).map(PathBuf::from)
}

/// Cache directory recorded in a filemap descriptor entry.
pub fn directory_from_kvtree(tree: &Kvtree) -> Option<PathBuf> {
    tree.get_val(KEY_DIRECTORY).map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::local::LocalComm;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn copy_type_parse() {
        assert_eq!(CopyType::parse("xor"), Some(CopyType::Xor));
        assert_eq!(CopyType::parse("Partner"), Some(CopyType::Partner));
        assert_eq!(CopyType::parse("LOCAL"), Some(CopyType::Local));
        assert_eq!(CopyType::parse("FILE"), None);
    }

    fn dummy_cfg(copy_type: CopyType, interval: u64) -> CkptDescConfig {
        CkptDescConfig {
            enabled: true,
            interval,
            base: PathBuf::from("/tmp/cache"),
            copy_type,
            set_size: 4,
            hop_distance: 1,
        }
    }

    /// Build descriptors on `n` single-rank nodes and return per-rank
    /// results from `check`.
    fn run_topology<T, F>(n: usize, cfg: CkptDescConfig, check: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(usize, Descriptor) -> T + Send + Sync + 'static,
    {
        let comms = LocalComm::world_with_timeout(n, Duration::from_secs(10));
        let cfg = Arc::new(cfg);
        let check = Arc::new(check);
        let handles: Vec<_> = comms
            .into_iter()
            .enumerate()
            .map(|(rank, world)| {
                let cfg = Arc::clone(&cfg);
                let check = Arc::clone(&check);
                std::thread::spawn(move || {
                    // One rank per node: local comm is a singleton, level
                    // comm spans the world.
                    let local = world.split(rank as i64, 0).unwrap();
                    let level = world.split(local.rank() as i64, rank as i64).unwrap();
                    let hostname = format!("node{}", rank);
                    let ctx = TopologyCtx {
                        world: &world,
                        level: level.as_ref(),
                        hostname: &hostname,
                        my_rank_world: rank,
                        my_rank_level: level.rank(),
                        ranks_local: local.size(),
                        ranks_world: world.size(),
                        username: "user",
                        jobid: "job1",
                    };
                    let desc = Descriptor::create(&cfg, 0, &ctx).unwrap();
                    check(rank, desc)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn xor_splits_into_sets_with_ring_partners() {
        let results = run_topology(8, dummy_cfg(CopyType::Xor, 1), |rank, d| {
            (
                rank,
                d.enabled,
                d.group_size,
                d.group_rank,
                d.group_id,
                d.lhs_world,
                d.rhs_world,
            )
        });
        for (rank, enabled, size, group_rank, group_id, lhs, rhs) in results {
            assert!(enabled);
            assert_eq!(size, 4);
            assert_eq!(group_rank, rank % 4);
            assert_eq!(group_id, (rank / 4) * 4);
            let base = (rank / 4) * 4;
            assert_eq!(lhs, base + (rank + 3) % 4);
            assert_eq!(rhs, base + (rank + 1) % 4);
        }
    }

    #[test]
    fn partner_pairs_across_nodes() {
        let results = run_topology(4, dummy_cfg(CopyType::Partner, 1), |rank, d| {
            (rank, d.enabled, d.group_size, d.lhs_world, d.rhs_world, d.lhs_host.clone())
        });
        for (rank, enabled, size, lhs, rhs, lhs_host) in results {
            assert!(enabled);
            assert_eq!(size, 4);
            assert_eq!(lhs, (rank + 3) % 4);
            assert_eq!(rhs, (rank + 1) % 4);
            assert_eq!(lhs_host, format!("node{}", (rank + 3) % 4));
        }
    }

    #[test]
    fn oversized_hop_wraps_around() {
        let results = run_topology(
            4,
            CkptDescConfig {
                hop_distance: 5,
                ..dummy_cfg(CopyType::Partner, 1)
            },
            |rank, d| (rank, d.enabled, d.lhs_world, d.rhs_world),
        );
        // hop 5 over 4 nodes reduces to hop 1.
        for (rank, enabled, lhs, rhs) in results {
            assert!(enabled);
            assert_eq!(lhs, (rank + 3) % 4);
            assert_eq!(rhs, (rank + 1) % 4);
        }
    }

    #[test]
    fn local_descriptor_is_singleton() {
        let results = run_topology(3, dummy_cfg(CopyType::Local, 1), |_, d| {
            (d.enabled, d.group_size, d.groups)
        });
        for (enabled, size, groups) in results {
            assert!(enabled);
            assert_eq!(size, 1);
            assert_eq!(groups, 3);
        }
    }

    #[test]
    fn kvtree_roundtrip_preserves_identity() {
        let results = run_topology(4, dummy_cfg(CopyType::Xor, 2), |_, d| {
            let tree = d.to_kvtree();
            (
                tree.get_u64("GROUP_ID"),
                tree.get_u64("GROUP_RANK"),
                tree.get_val("TYPE").map(str::to_owned),
                tree.get_u64("INTERVAL"),
            )
        });
        for (rank, (gid, grank, ty, interval)) in results.into_iter().enumerate() {
            assert_eq!(gid, Some(((rank / 4) * 4) as u64));
            assert_eq!(grank, Some((rank % 4) as u64));
            assert_eq!(ty.as_deref(), Some("XOR"));
            assert_eq!(interval, Some(2));
        }
    }
}
