//! The engine handle and the application-facing API.
//!
//! [`Scr`] owns the three communicators, the filemap, the descriptor list,
//! configuration, timing statistics, async-flush state, and the halt tree.
//! Every public method is collective over the world communicator. Component
//! modules receive a borrowed [`JobCtx`] view of the handle instead of the
//! handle itself, which keeps the filemap and async state independently
//! mutable while a phase runs.

use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::cache;
use crate::comm::{Comm, ReduceOp};
use crate::config::Params;
use crate::descriptor::{descriptor_for, Descriptor, TopologyCtx};
use crate::distribute;
use crate::error::{Error, Result};
use crate::fetch;
use crate::fileio;
use crate::filemap::FileMap;
use crate::flush::{self, async_flush, mover::Mover, sync, Location};
use crate::halt::{self, HaltMode};
use crate::index::Index;
use crate::kvtree::Kvtree;
use crate::meta::{FileKind, Meta};
use crate::redundancy;

const KEY_NODES: &str = "NODES";

/// Borrowed view of the engine that component functions operate through.
pub(crate) struct JobCtx<'a> {
    pub params: &'a Params,
    pub world: &'a dyn Comm,
    pub local: &'a dyn Comm,
    pub level: &'a dyn Comm,
    pub my_rank_world: usize,
    pub ranks_world: usize,
    pub my_rank_local: usize,
    pub ranks_local: usize,
    pub my_rank_level: usize,
    pub ranks_level: usize,
    pub hostname: &'a str,
    pub username: &'a str,
    pub jobid: &'a str,
    pub cntl_prefix: &'a Path,
    pub map_file: &'a Path,
    pub master_map_file: &'a Path,
    pub halt_file: &'a Path,
    pub flush_file: &'a Path,
    pub transfer_file: &'a Path,
    pub descriptors: &'a [Descriptor],
}

impl<'a> JobCtx<'a> {
    /// View for descriptor construction.
    pub(crate) fn topology(&self) -> TopologyCtx<'a> {
        TopologyCtx {
            world: self.world,
            level: self.level,
            hostname: self.hostname,
            my_rank_world: self.my_rank_world,
            my_rank_level: self.my_rank_level,
            ranks_local: self.ranks_local,
            ranks_world: self.ranks_world,
            username: self.username,
            jobid: self.jobid,
        }
    }
}

/// State of an asynchronous flush in flight.
pub(crate) struct AsyncFlush {
    /// Checkpoint being drained.
    pub checkpoint_id: u64,
    /// Destination directory on the parallel file system.
    pub dir: PathBuf,
    /// The transfer-file entries this rank enqueued.
    pub files: Kvtree,
    /// Number of user files this rank queued.
    #[allow(dead_code)]
    pub num_files: usize,
    /// Job-wide bytes to move.
    pub bytes_total: u64,
    /// When the flush started.
    pub started: Instant,
}

/// The checkpoint/restart engine. One per process; construction is
/// collective and so is every method.
pub struct Scr {
    params: Params,
    world: Box<dyn Comm>,
    local: Box<dyn Comm>,
    level: Box<dyn Comm>,
    my_rank_world: usize,
    ranks_world: usize,
    my_rank_local: usize,
    ranks_local: usize,
    my_rank_level: usize,
    ranks_level: usize,
    hostname: String,
    username: String,
    jobid: String,
    cntl_prefix: PathBuf,
    map_file: PathBuf,
    master_map_file: PathBuf,
    halt_file: PathBuf,
    flush_file: PathBuf,
    transfer_file: PathBuf,
    map: FileMap,
    descriptors: Vec<Descriptor>,
    halt: Kvtree,
    async_state: Option<AsyncFlush>,
    mover: Option<Mover>,
    checkpoint_id: u64,
    in_checkpoint: bool,
    need_checkpoint_count: u64,
    time_checkpoint_start: Instant,
    time_checkpoint_end: Instant,
    checkpoint_cost_secs: f64,
    checkpoint_count: u64,
}

impl Scr {
    fn parts(&mut self) -> (JobCtx<'_>, &mut FileMap, &mut Option<AsyncFlush>, &mut Kvtree) {
        let Scr {
            params,
            world,
            local,
            level,
            my_rank_world,
            ranks_world,
            my_rank_local,
            ranks_local,
            my_rank_level,
            ranks_level,
            hostname,
            username,
            jobid,
            cntl_prefix,
            map_file,
            master_map_file,
            halt_file,
            flush_file,
            transfer_file,
            map,
            descriptors,
            halt,
            async_state,
            ..
        } = self;
        let ctx = JobCtx {
            params,
            world: &**world,
            local: &**local,
            level: &**level,
            my_rank_world: *my_rank_world,
            ranks_world: *ranks_world,
            my_rank_local: *my_rank_local,
            ranks_local: *ranks_local,
            my_rank_level: *my_rank_level,
            ranks_level: *ranks_level,
            hostname,
            username,
            jobid,
            cntl_prefix,
            map_file,
            master_map_file,
            halt_file,
            flush_file,
            transfer_file,
            descriptors,
        };
        (ctx, map, async_state, halt)
    }

    /// Initialize the library: build communicators and descriptors, ready
    /// the cache, and recover the most recent usable checkpoint from
    /// node-local storage (or the parallel file system) after a restart.
    /// Collective.
    pub fn init(world: Box<dyn Comm>, params: Params) -> Result<Scr> {
        let mut params = params;
        if !params.enable {
            return Err(Error::InvalidOperation("library is disabled".into()));
        }
        // A restart pinned to the parallel file system never trusts cache.
        if params.global_restart {
            params.flush_on_restart = true;
            params.fetch = false;
        }

        let username = params
            .username
            .clone()
            .ok_or(Error::MissingParam("SCR_USER_NAME"))?;
        let jobid = params
            .jobid
            .clone()
            .ok_or(Error::MissingParam("SCR_JOB_ID"))?;
        let hostname = params.hostname.clone();

        let my_rank_world = world.rank();
        let ranks_world = world.size();

        // Group ranks into nodes by hostname: the color is the highest
        // world rank sharing our host.
        let hostnames = world.allgather(hostname.as_bytes())?;
        let color = hostnames
            .iter()
            .enumerate()
            .filter(|(_, h)| h.as_slice() == hostname.as_bytes())
            .map(|(i, _)| i)
            .max()
            .expect("own hostname is present");
        let local = world.split(color as i64, my_rank_world as i64)?;
        let my_rank_local = local.rank();
        let ranks_local = local.size();

        // All processes at the same node-local rank form a level.
        let level = world.split(my_rank_local as i64, my_rank_world as i64)?;
        let my_rank_level = level.rank();
        let ranks_level = level.size();

        // Build every configured descriptor, collectively.
        let mut descriptors = Vec::new();
        {
            let tctx = TopologyCtx {
                world: world.as_ref(),
                level: level.as_ref(),
                hostname: &hostname,
                my_rank_world,
                my_rank_level,
                ranks_local,
                ranks_world,
                username: &username,
                jobid: &jobid,
            };
            for (i, cfg) in params.ckpt_descs().iter().enumerate() {
                descriptors.push(Descriptor::create(cfg, i, &tctx)?);
            }
        }
        if !descriptors.iter().any(|d| d.enabled && d.interval == 1) {
            return Err(Error::Fatal(
                "no enabled checkpoint descriptor with interval 1".into(),
            ));
        }

        // Control directory and cache directories are per-node resources.
        let cntl_prefix = params
            .cntl_base
            .join(&username)
            .join(format!("scr.{}", jobid));
        if my_rank_local == 0 {
            fileio::mkdir_p(&cntl_prefix)?;
            for desc in descriptors.iter().filter(|d| d.enabled) {
                fileio::mkdir_p(&desc.directory)?;
            }
        }
        local.barrier()?;

        let halt_file = cntl_prefix.join("halt.scrinfo");
        let flush_file = cntl_prefix.join("flush.scrinfo");
        let nodes_file = cntl_prefix.join("nodes.scrinfo");
        let transfer_file = cntl_prefix.join("transfer.scrinfo");
        let map_file = distribute::filemap_path(&cntl_prefix, my_rank_local);
        let master_map_file = distribute::master_filemap_path(&cntl_prefix);

        // A transfer left over from the previous run is abandoned; the
        // files it was draining are rediscovered through the filemaps.
        if my_rank_local == 0 {
            let _ = std::fs::remove_file(&transfer_file);
        }

        // Record the node count for scavenger tooling.
        let num_nodes = world.allreduce_i64(ranks_level as i64, ReduceOp::Max)?;
        if my_rank_local == 0 {
            let mut nodes = Kvtree::new();
            nodes.set_i64(KEY_NODES, num_nodes);
            nodes.write_file(&nodes_file)?;
        }

        let halt_tree = halt::init_tree(params.halt_seconds);

        world.barrier()?;

        // The transfer daemon runs one per node, next to the node master.
        let mover = if params.flush_async && params.flush_async_mover && my_rank_local == 0 {
            Some(Mover::spawn(
                transfer_file.clone(),
                params.poll_interval,
                params.file_buf_size,
            ))
        } else {
            None
        };

        let mut scr = Scr {
            params,
            world,
            local,
            level,
            my_rank_world,
            ranks_world,
            my_rank_local,
            ranks_local,
            my_rank_level,
            ranks_level,
            hostname,
            username,
            jobid,
            cntl_prefix,
            map_file,
            master_map_file,
            halt_file,
            flush_file,
            transfer_file,
            map: FileMap::new(),
            descriptors,
            halt: halt_tree,
            async_state: None,
            mover: None,
            checkpoint_id: 0,
            in_checkpoint: false,
            need_checkpoint_count: 0,
            time_checkpoint_start: Instant::now(),
            time_checkpoint_end: Instant::now(),
            checkpoint_cost_secs: 0.0,
            checkpoint_count: 0,
        };
        scr.mover = mover;

        // Files may be about to shuffle; no transfer can be allowed to run
        // across that.
        if scr.params.flush_async {
            let (ctx, _map, async_state, _halt) = scr.parts();
            async_flush::stop(&ctx, async_state)?;
        }

        // Honor a standing halt before doing any restart work.
        {
            let (ctx, _map, _async, halt_tree) = scr.parts();
            if let Some(reason) = halt::check_halt(&ctx, halt_tree, HaltMode::TestAndHalt, 0)? {
                return Err(Error::Halt(reason));
            }
        }

        scr.restart()?;

        scr.world.barrier()?;
        scr.time_checkpoint_end = Instant::now();
        Ok(scr)
    }

    /// Recover cached state after a (possible) restart: scatter filemaps,
    /// distribute and rebuild the newest usable checkpoint, and fall back
    /// to fetching from the parallel file system.
    fn restart(&mut self) -> Result<()> {
        {
            let (ctx, map, _async, _halt) = self.parts();
            distribute::scatter_filemaps(&ctx, map)?;
        }

        let mut recovered = false;
        if self.params.distribute {
            recovered = self.restart_distribute()?;
        }

        if recovered {
            self.delete_excess_checkpoints()?;
            let ckpt = self.checkpoint_id;
            let flush_on_restart = self.params.flush_on_restart;
            let (ctx, map, async_state, _halt) = self.parts();
            if flush_on_restart {
                if let Err(e) = sync::flush_files(&ctx, map, async_state, ckpt) {
                    tracing::warn!(error = %e, "flush on restart failed");
                }
            } else if ctx.params.flush > 0 && ckpt % ctx.params.flush == 0 {
                if let Err(e) = sync::flush_files(&ctx, map, async_state, ckpt) {
                    tracing::warn!(error = %e, "flush after restart failed");
                }
            }
        }

        if !recovered || self.params.global_restart {
            let (ctx, map, _async, _halt) = self.parts();
            cache::unlink_all(&ctx, map)?;
            self.checkpoint_id = 0;
            recovered = recovered && !self.params.global_restart;
        }

        if !recovered && self.params.fetch {
            recovered = self.restart_fetch()?;
        }

        if !recovered {
            let (ctx, map, _async, _halt) = self.parts();
            cache::unlink_all(&ctx, map)?;
            self.checkpoint_id = 0;
        }
        Ok(())
    }

    /// Try to distribute and rebuild checkpoints from cache, newest first.
    /// Returns true when one was fully recovered.
    fn restart_distribute(&mut self) -> Result<bool> {
        let start = Instant::now();
        let mut attempted = false;
        loop {
            let (ctx, map, _async, _halt) = self.parts();
            cache::clean_files(&ctx, map)?;

            let latest = map.latest_checkpoint().map(|c| c as i64).unwrap_or(-1);
            let max_id = ctx.world.allreduce_i64(latest, ReduceOp::Max)?;
            if max_id < 0 {
                break;
            }
            let max_id = max_id as u64;
            attempted = true;

            if ctx.my_rank_world == 0 {
                tracing::info!(ckpt = max_id, "attempting to distribute and rebuild");
            }

            let rebuilt = match distribute::distribute_descriptors(&ctx, map, max_id) {
                Ok(desc) => {
                    let result = cache::checkpoint_dir_create(&ctx, &desc, max_id)
                        .and_then(|_| {
                            if let Err(e) = distribute::distribute_files(&ctx, map, &desc, max_id) {
                                tracing::debug!(error = %e, "distribution incomplete");
                            }
                            crate::redundancy::rebuild::rebuild_files(&ctx, map, &desc, max_id)
                        });
                    match result {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::debug!(ckpt = max_id, error = %e, "rebuild failed");
                            false
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(ckpt = max_id, error = %e, "descriptor recovery failed");
                    false
                }
            };

            if rebuilt {
                self.checkpoint_id = max_id;
                let (ctx, _map, _async, _halt) = self.parts();
                flush::location_set(&ctx, max_id, Location::Cache)?;

                // If any node saw this checkpoint land on the parallel file
                // system, everyone records it.
                let in_pfs = flush::location_test(&ctx, max_id, Location::Pfs)?;
                if !ctx.world.alltrue(!in_pfs)? {
                    flush::location_set(&ctx, max_id, Location::Pfs)?;
                }
                flush::location_unset(&ctx, max_id, Location::Flushing)?;

                if ctx.my_rank_world == 0 {
                    let secs = start.elapsed().as_secs_f64();
                    tracing::info!(ckpt = max_id, secs, "scalable restart succeeded");
                }
                return Ok(true);
            }

            // This checkpoint is beyond recovery; drop it and try an older
            // one.
            if self.my_rank_world == 0 {
                tracing::info!(ckpt = max_id, "failed to distribute and rebuild");
            }
            let (ctx, map, _async, _halt) = self.parts();
            cache::checkpoint_delete(&ctx, map, max_id)?;
        }

        if attempted && self.my_rank_world == 0 {
            let secs = start.elapsed().as_secs_f64();
            tracing::info!(secs, "scalable restart failed");
        }
        Ok(false)
    }

    /// After recovery, drop every cached checkpoint older than the one we
    /// restored; cache slots are for the future.
    fn delete_excess_checkpoints(&mut self) -> Result<()> {
        let current = self.checkpoint_id;
        loop {
            let (ctx, map, _async, _halt) = self.parts();
            let num = map.num_checkpoints() as i64;
            if ctx.world.allreduce_i64(num, ReduceOp::Max)? <= 1 {
                break;
            }
            let oldest = map
                .oldest_checkpoint()
                .map(|c| c as i64)
                .unwrap_or(i64::MAX);
            let min_id = ctx.world.allreduce_i64(oldest, ReduceOp::Min)?;
            if min_id == i64::MAX || min_id as u64 == current {
                break;
            }
            cache::checkpoint_delete(&ctx, map, min_id as u64)?;
        }
        Ok(())
    }

    /// Walk the index catalog fetching checkpoints from the parallel file
    /// system until one loads, marking failures as it goes. Returns true
    /// when a checkpoint was fetched.
    fn restart_fetch(&mut self) -> Result<bool> {
        let current_link = self.params.prefix.join(sync::CURRENT_LINK);
        let mut index = if self.my_rank_world == 0 {
            Some(Index::read(&self.params.prefix)?)
        } else {
            None
        };

        let mut older_than: Option<u64> = None;
        loop {
            // Rank 0 picks the next directory to try: the current symlink
            // first, then the newest untried complete entry.
            let mut target = String::new();
            let mut target_id: Option<u64> = None;
            if self.my_rank_world == 0 {
                if let Ok(link) = std::fs::read_link(&current_link) {
                    target = link.to_string_lossy().into_owned();
                    target_id = index
                        .as_ref()
                        .and_then(|ix| ix.checkpoint_id_by_dir(&target));
                } else if let Some((id, dir)) = index
                    .as_ref()
                    .and_then(|ix| ix.most_recent_complete(older_than))
                {
                    target = dir;
                    target_id = Some(id);
                }
                if !target.is_empty() {
                    if let (Some(ix), Some(id)) = (index.as_mut(), target_id) {
                        ix.mark_fetched(id, &target);
                        ix.write(&self.params.prefix)?;
                    }
                }
            }

            let mut has_target = vec![(!target.is_empty()) as u8];
            self.world.bcast(0, &mut has_target)?;
            if has_target[0] == 0 {
                return Ok(false);
            }

            let fetch_dir = self.params.prefix.join(&target);
            let fetched = {
                let (ctx, map, _async, _halt) = self.parts();
                fetch::fetch_files(&ctx, map, &fetch_dir)
            };

            match fetched {
                Ok(id) => {
                    self.checkpoint_id = id;
                    if self.my_rank_world == 0 && std::fs::read_link(&current_link).is_err() {
                        let _ = std::os::unix::fs::symlink(&target, &current_link);
                    }
                    return Ok(true);
                }
                Err(e) => {
                    if self.my_rank_world == 0 {
                        tracing::info!(dir = %fetch_dir.display(), error = %e, "fetch failed");
                        let _ = std::fs::remove_file(&current_link);
                        if let (Some(ix), Some(id)) = (index.as_mut(), target_id) {
                            ix.mark_failed(id, &target);
                            ix.write(&self.params.prefix)?;
                            older_than = Some(id);
                        }
                    }
                    // Without an id the catalog has nothing older to offer.
                    let mut keep_going = vec![0u8];
                    if self.my_rank_world == 0 {
                        keep_going[0] = target_id.is_some() as u8;
                    }
                    self.world.bcast(0, &mut keep_going)?;
                    if keep_going[0] == 0 {
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Ask whether the application should take a checkpoint now, based on
    /// the call-count interval, time since the last checkpoint, the
    /// overhead budget, and halt pressure. Collective.
    pub fn need_checkpoint(&mut self) -> Result<bool> {
        self.need_checkpoint_count += 1;

        let mut flag = false;
        {
            let (ctx, _map, _async, halt_tree) = self.parts();
            if halt::check_halt(&ctx, halt_tree, HaltMode::TestOnly, 0)?.is_some() {
                flag = true;
            }
        }

        if self.my_rank_world == 0 && !flag {
            let p = &self.params;
            if p.checkpoint_interval > 0
                && self.need_checkpoint_count % p.checkpoint_interval == 0
            {
                flag = true;
            }
            if !flag && p.checkpoint_seconds > 0 {
                let since = self.time_checkpoint_end.elapsed().as_secs();
                if since >= p.checkpoint_seconds {
                    flag = true;
                }
            }
            if !flag && p.checkpoint_overhead > 0.0 {
                if self.checkpoint_count == 0 {
                    // No cost estimate yet; take one to learn it.
                    flag = true;
                } else {
                    let avg = self.checkpoint_cost_secs / self.checkpoint_count as f64;
                    let since = self.time_checkpoint_end.elapsed().as_secs_f64();
                    let percent = avg / (since + avg) * 100.0;
                    if percent < p.checkpoint_overhead {
                        flag = true;
                    }
                }
            }
            if !flag
                && p.checkpoint_interval == 0
                && p.checkpoint_seconds == 0
                && p.checkpoint_overhead == 0.0
            {
                flag = true;
            }
        }

        let mut buf = vec![flag as u8];
        self.world.bcast(0, &mut buf)?;
        Ok(buf[0] != 0)
    }

    /// Open a new checkpoint: make room in the cache (waiting on an
    /// in-flight flush if that is the only way), create the checkpoint
    /// directory, and record the descriptor. Collective.
    pub fn start_checkpoint(&mut self) -> Result<()> {
        if self.in_checkpoint {
            return Err(Error::InvalidOperation(
                "complete_checkpoint must be called before start_checkpoint again".into(),
            ));
        }
        self.world.barrier()?;
        self.in_checkpoint = true;
        self.checkpoint_id += 1;
        let ckpt = self.checkpoint_id;
        self.time_checkpoint_start = Instant::now();

        let mut desc_index = None;
        let mut best_interval = 0;
        for (i, d) in self.descriptors.iter().enumerate() {
            if d.enabled && d.interval > best_interval && ckpt % d.interval == 0 {
                best_interval = d.interval;
                desc_index = Some(i);
            }
        }
        let desc_index =
            desc_index.ok_or_else(|| Error::Fatal(format!("no descriptor for checkpoint {}", ckpt)))?;

        let (ctx, map, async_state, _halt) = self.parts();
        let desc = &ctx.descriptors[desc_index];

        if ctx.my_rank_world == 0 {
            tracing::info!(ckpt, base = %desc.base.display(), "starting checkpoint");
        }

        // Count how many cached checkpoints share this descriptor's tier.
        let size = ctx.params.cache_size_for(&desc.base).max(1);
        let cached = map.checkpoints();
        let mut in_base = cached
            .iter()
            .filter(|&&c| cache::base_of(map, c, ctx.my_rank_world).as_deref() == Some(desc.base.as_path()))
            .count();

        // Evict oldest-first, passing over anything mid-flush.
        let mut flushing: Option<u64> = None;
        for &old in &cached {
            if in_base < size {
                break;
            }
            if cache::base_of(map, old, ctx.my_rank_world).as_deref() != Some(desc.base.as_path()) {
                continue;
            }
            if !flush::is_flushing(&ctx, old)? {
                cache::checkpoint_delete(&ctx, map, old)?;
                in_base -= 1;
            } else if flushing.is_none() {
                flushing = Some(old);
            }
        }

        // Only flushing checkpoints are left to evict: wait the oldest one
        // out, then take its slot.
        if in_base >= size {
            if let Some(old) = flushing {
                async_flush::wait(&ctx, map, async_state)?;
                cache::checkpoint_delete(&ctx, map, old)?;
            }
        }

        // Record the descriptor before creating the directory, so even a
        // crash right here leaves a trail for restart.
        map.set_desc(ckpt, ctx.my_rank_world, desc.to_kvtree());
        map.write(ctx.map_file)?;

        cache::checkpoint_dir_create(&ctx, desc, ckpt)?;
        Ok(())
    }

    /// Map an application path to the cache-resident path it should use
    /// for the current checkpoint (or for reading during restart).
    pub fn route_file(&mut self, file: &Path) -> Result<PathBuf> {
        let ckpt = self.checkpoint_id;
        let desc = descriptor_for(ckpt, &self.descriptors)
            .ok_or_else(|| Error::Fatal(format!("no descriptor for checkpoint {}", ckpt)))?;
        let name = file
            .file_name()
            .ok_or_else(|| Error::InvalidOperation(format!("no file name in {}", file.display())))?;
        let routed = desc.checkpoint_dir(ckpt).join(name);

        if self.in_checkpoint {
            self.map.add_file(ckpt, self.my_rank_world, &routed);
            self.map.write(&self.map_file)?;
        } else if std::fs::metadata(&routed).is_err() {
            return Err(Error::InvalidOperation(format!(
                "no cached file to read at {}",
                routed.display()
            )));
        }
        Ok(routed)
    }

    /// Close the current checkpoint: write sidecars with the caller's
    /// verdict, apply redundancy, and schedule any flush. Collective.
    pub fn complete_checkpoint(&mut self, valid: bool) -> Result<()> {
        if !self.in_checkpoint {
            return Err(Error::InvalidOperation(
                "start_checkpoint must be called before complete_checkpoint".into(),
            ));
        }
        let ckpt = self.checkpoint_id;

        let encode_result = {
            let (ctx, map, _async, _halt) = self.parts();

            // Seal every routed file with the application's verdict.
            for file in map.files(ckpt, ctx.my_rank_world) {
                let meta = Meta::new(
                    &file,
                    FileKind::Full,
                    fileio::filesize(&file),
                    ckpt,
                    ctx.my_rank_world,
                    ctx.ranks_world,
                    valid,
                );
                meta.write(&file)?;
            }

            let desc = descriptor_for(ckpt, ctx.descriptors)
                .ok_or_else(|| Error::Fatal(format!("no descriptor for checkpoint {}", ckpt)))?;
            redundancy::copy_files(&ctx, map, desc, ckpt)
        };

        // Record the cost for the overhead heuristic.
        self.time_checkpoint_end = Instant::now();
        let cost = self
            .time_checkpoint_end
            .duration_since(self.time_checkpoint_start)
            .as_secs_f64();
        self.checkpoint_cost_secs += cost;
        self.checkpoint_count += 1;
        if self.my_rank_world == 0 {
            tracing::info!(ckpt, secs = cost, ok = encode_result.is_ok(), "completed checkpoint");
        }

        let rc = match encode_result {
            Ok(_) => {
                {
                    let (ctx, _map, _async, _halt) = self.parts();
                    flush::location_set(&ctx, ckpt, Location::Cache)?;
                }

                // Halting flushes synchronously, so test it before any
                // async flush gets started for this checkpoint.
                let halted = {
                    let (ctx, _map, _async, halt_tree) = self.parts();
                    halt::check_halt(&ctx, halt_tree, HaltMode::TestAndHalt, 1)?
                };
                if let Some(reason) = halted {
                    self.wind_down_for_halt()?;
                    self.in_checkpoint = false;
                    return Err(Error::Halt(reason));
                }

                self.check_flush()?;
                Ok(())
            }
            Err(e) => {
                // A failed encode leaves an unprotected checkpoint; drop it
                // rather than pretend.
                let (ctx, map, _async, _halt) = self.parts();
                cache::checkpoint_delete(&ctx, map, ckpt)?;
                Err(e)
            }
        };

        // Opportunistically advance any async flush still in flight.
        {
            let (ctx, map, async_state, _halt) = self.parts();
            if let Some(active) = async_state.as_ref() {
                let id = active.checkpoint_id;
                let total = active.bytes_total;
                let (done, bytes) = async_flush::test(&ctx, map, async_state, id)?;
                if done {
                    async_flush::complete(&ctx, map, async_state, id)?;
                } else if ctx.my_rank_world == 0 {
                    let percent = if total > 0 {
                        bytes as f64 / total as f64 * 100.0
                    } else {
                        100.0
                    };
                    tracing::info!(ckpt = id, percent = percent as u32, "flush in progress");
                }
            }
        }

        self.world.barrier()?;
        self.in_checkpoint = false;
        rc
    }

    /// Shut the library down: complete or cancel outstanding flushes, make
    /// sure the final checkpoint reaches the parallel file system, and mark
    /// the job finished in the halt file. Collective.
    pub fn finalize(mut self) -> Result<()> {
        let ckpt = self.checkpoint_id;

        // A job that finalizes is done; record that so a scavenged restart
        // does not rerun it.
        if self.my_rank_world == 0 {
            let (ctx, _map, _async, halt_tree) = self.parts();
            halt::record_halt(ctx.halt_file, halt_tree, "SCR_FINALIZE_CALLED")?;
        }

        {
            let (ctx, map, async_state, _halt) = self.parts();
            if let Some(active) = async_state.as_ref() {
                if active.checkpoint_id == ckpt {
                    // About to flush the same checkpoint synchronously.
                    async_flush::stop(&ctx, async_state)?;
                } else {
                    async_flush::wait(&ctx, map, async_state)?;
                }
            }
            if flush::need_flush(&ctx, ckpt)? {
                sync::flush_files(&ctx, map, async_state, ckpt)?;
            }
        }

        if let Some(mover) = self.mover.take() {
            mover.shutdown();
        }
        Ok(())
    }

    /// Flush according to policy: every `flush` checkpoints, async when
    /// configured.
    fn check_flush(&mut self) -> Result<()> {
        let ckpt = self.checkpoint_id;
        if self.params.flush == 0 || ckpt % self.params.flush != 0 {
            return Ok(());
        }
        let use_async = self.params.flush_async;
        let (ctx, map, async_state, _halt) = self.parts();
        if use_async {
            if async_state.is_some() {
                async_flush::wait(&ctx, map, async_state)?;
            }
            async_flush::start(&ctx, map, async_state, ckpt)
        } else {
            sync::flush_files(&ctx, map, async_state, ckpt)
        }
    }

    /// Halt path: park or finish the transfer daemon's work, then flush the
    /// freshly completed checkpoint synchronously.
    fn wind_down_for_halt(&mut self) -> Result<()> {
        let ckpt = self.checkpoint_id;
        let (ctx, map, async_state, _halt) = self.parts();
        if let Some(active) = async_state.as_ref() {
            if active.checkpoint_id == ckpt {
                async_flush::stop(&ctx, async_state)?;
            } else {
                async_flush::wait(&ctx, map, async_state)?;
            }
        }
        if let Err(e) = sync::flush_files(&ctx, map, async_state, ckpt) {
            tracing::warn!(error = %e, "flush before halt failed");
        }
        ctx.world.barrier()?;
        Ok(())
    }

    /// Id of the checkpoint most recently started (or restored).
    pub fn checkpoint_id(&self) -> u64 {
        self.checkpoint_id
    }

    /// True when a restored checkpoint is available to read through
    /// [`Scr::route_file`].
    pub fn have_restart(&self) -> bool {
        self.checkpoint_id > 0 && !self.in_checkpoint
    }

    /// World rank of this process.
    pub fn rank(&self) -> usize {
        self.my_rank_world
    }

    /// Number of processes in the job.
    pub fn ranks(&self) -> usize {
        self.ranks_world
    }
}

impl Drop for Scr {
    fn drop(&mut self) {
        if let Some(mover) = self.mover.take() {
            mover.shutdown();
        }
    }
}
