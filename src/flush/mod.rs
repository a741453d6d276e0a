//! Flush scheduling: where each checkpoint currently lives and when it
//! moves to the parallel file system.
//!
//! The per-node flush file records a set of locations for each checkpoint
//! id. `CACHE`, `PFS`, and `FLUSHING` are independent bits: a checkpoint
//! being drained is both `CACHE` and `FLUSHING`, and one that has landed is
//! `CACHE` and `PFS` until eviction clears `CACHE`. Only the node-local
//! rank 0 writes the file; peers learn the answer over the local
//! communicator.

pub mod async_flush;
pub mod mover;
pub mod sync;

use crate::engine::JobCtx;
use crate::error::Result;
use crate::kvtree::Kvtree;

const KEY_CKPT: &str = "CKPT";
const KEY_LOCATION: &str = "LOCATION";

/// Where a checkpoint's bytes currently are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Resident in node-local cache.
    Cache,
    /// Landed on the parallel file system.
    Pfs,
    /// An asynchronous flush is in flight.
    Flushing,
}

impl Location {
    fn as_str(&self) -> &'static str {
        match self {
            Location::Cache => "CACHE",
            Location::Pfs => "PFS",
            Location::Flushing => "FLUSHING",
        }
    }
}

/// Add `location` for `checkpoint_id` in this node's flush file.
pub(crate) fn location_set(ctx: &JobCtx<'_>, checkpoint_id: u64, location: Location) -> Result<()> {
    if ctx.my_rank_local == 0 {
        let (fd, mut tree) = Kvtree::lock_open_read(ctx.flush_file)?;
        tree.set_kv_int(KEY_CKPT, checkpoint_id)
            .set_kv(KEY_LOCATION, location.as_str());
        tree.write_unlock(ctx.flush_file, fd)?;
    }
    Ok(())
}

/// Remove `location` for `checkpoint_id` in this node's flush file.
pub(crate) fn location_unset(
    ctx: &JobCtx<'_>,
    checkpoint_id: u64,
    location: Location,
) -> Result<()> {
    if ctx.my_rank_local == 0 {
        let (fd, mut tree) = Kvtree::lock_open_read(ctx.flush_file)?;
        if let Some(ckpt) = tree
            .get_mut(KEY_CKPT)
            .and_then(|t| t.get_mut(&checkpoint_id.to_string()))
        {
            ckpt.unset_kv(KEY_LOCATION, location.as_str());
        }
        tree.write_unlock(ctx.flush_file, fd)?;
    }
    Ok(())
}

/// True when this node's flush file lists `location` for `checkpoint_id`.
/// The answer is read by the node master and shared with the whole node.
pub(crate) fn location_test(
    ctx: &JobCtx<'_>,
    checkpoint_id: u64,
    location: Location,
) -> Result<bool> {
    let mut flag = 0u8;
    if ctx.my_rank_local == 0 {
        let tree = Kvtree::read_file_locked(ctx.flush_file)?;
        let set = tree
            .get_kv_int(KEY_CKPT, checkpoint_id)
            .and_then(|t| t.get_kv(KEY_LOCATION, location.as_str()))
            .is_some();
        flag = set as u8;
    }
    let mut buf = vec![flag];
    ctx.local.bcast(0, &mut buf)?;
    Ok(buf[0] != 0)
}

/// Drop every record of `checkpoint_id` from this node's flush file.
pub(crate) fn remove_checkpoint(ctx: &JobCtx<'_>, checkpoint_id: u64) -> Result<()> {
    if ctx.my_rank_local == 0 {
        let (fd, mut tree) = Kvtree::lock_open_read(ctx.flush_file)?;
        tree.unset_kv(KEY_CKPT, &checkpoint_id.to_string());
        tree.write_unlock(ctx.flush_file, fd)?;
    }
    Ok(())
}

/// A checkpoint needs flushing when it is in cache but not yet on the
/// parallel file system.
pub(crate) fn need_flush(ctx: &JobCtx<'_>, checkpoint_id: u64) -> Result<bool> {
    let mut flag = 0u8;
    if ctx.my_rank_local == 0 {
        let tree = Kvtree::read_file_locked(ctx.flush_file)?;
        let ckpt = tree.get_kv_int(KEY_CKPT, checkpoint_id);
        let in_cache = ckpt
            .and_then(|t| t.get_kv(KEY_LOCATION, Location::Cache.as_str()))
            .is_some();
        let in_pfs = ckpt
            .and_then(|t| t.get_kv(KEY_LOCATION, Location::Pfs.as_str()))
            .is_some();
        flag = (in_cache && !in_pfs) as u8;
    }
    let mut buf = vec![flag];
    ctx.local.bcast(0, &mut buf)?;
    Ok(buf[0] != 0)
}

/// True when an asynchronous flush of `checkpoint_id` is in flight on this
/// node.
pub(crate) fn is_flushing(ctx: &JobCtx<'_>, checkpoint_id: u64) -> Result<bool> {
    location_test(ctx, checkpoint_id, Location::Flushing)
}
