//! Cache manager: checkpoint directory lifecycle, file validation, and
//! deletion of whole checkpoints from node-local storage.
//!
//! Directory creation and removal are node-level actions: only the
//! node-local rank 0 touches the directory, bracketed by a barrier on the
//! local communicator so peers never race a half-created or half-removed
//! directory.

use std::path::{Path, PathBuf};

use crate::comm::ReduceOp;
use crate::descriptor::{self, Descriptor};
use crate::engine::JobCtx;
use crate::error::Result;
use crate::fileio;
use crate::filemap::FileMap;
use crate::flush;
use crate::meta::{self, Meta};

/// Create the cache directory for (`desc`, `checkpoint_id`) and wait until
/// it is visible to every process on this node.
pub(crate) fn checkpoint_dir_create(
    ctx: &JobCtx<'_>,
    desc: &Descriptor,
    checkpoint_id: u64,
) -> Result<()> {
    if ctx.my_rank_local == 0 {
        let dir = desc.checkpoint_dir(checkpoint_id);
        tracing::debug!(dir = %dir.display(), "creating checkpoint directory");
        fileio::mkdir_p(&dir)?;
    }
    ctx.local.barrier()?;
    Ok(())
}

/// Remove the cache directory for a checkpoint after every process on this
/// node has stopped using it. `desc_dir` is the descriptor directory the
/// checkpoint lives under, when known.
pub(crate) fn checkpoint_dir_delete(
    ctx: &JobCtx<'_>,
    desc_dir: Option<&Path>,
    checkpoint_id: u64,
) -> Result<()> {
    ctx.local.barrier()?;
    if ctx.my_rank_local == 0 {
        if let Some(prefix) = desc_dir {
            let dir = prefix.join(format!("checkpoint.{}", checkpoint_id));
            tracing::debug!(dir = %dir.display(), "removing checkpoint directory");
            let _ = std::fs::remove_dir(&dir);
        }
    }
    Ok(())
}

/// Delete every file and record of `checkpoint_id` on this process: the
/// files and their sidecars, the cache directory, the flush-file entry, and
/// the filemap entry (persisted).
pub(crate) fn checkpoint_delete(
    ctx: &JobCtx<'_>,
    map: &mut FileMap,
    checkpoint_id: u64,
) -> Result<()> {
    if ctx.my_rank_world == 0 {
        tracing::info!(ckpt = checkpoint_id, "deleting checkpoint from cache");
    }

    for rank in map.ranks_by_checkpoint(checkpoint_id) {
        for file in map.files(checkpoint_id, rank) {
            // Watch for storage rotting under us.
            if ctx.params.crc_on_delete {
                if let Err(e) = fileio::compute_crc(&file) {
                    tracing::warn!(file = %file.display(), error = %e, "crc mismatch before delete, bad drive?");
                }
            }
            let _ = std::fs::remove_file(&file);
            Meta::unlink(&file);
        }
    }

    let desc_dir = map
        .desc(checkpoint_id, ctx.my_rank_world)
        .and_then(descriptor::directory_from_kvtree);
    checkpoint_dir_delete(ctx, desc_dir.as_deref(), checkpoint_id)?;

    flush::remove_checkpoint(ctx, checkpoint_id)?;

    map.remove_checkpoint(checkpoint_id);
    map.write(ctx.map_file)?;
    Ok(())
}

/// Delete every cached checkpoint recorded on this node, then the filemap
/// itself. Checkpoints are deleted newest-first in lockstep across the node
/// so the directory barriers line up.
pub(crate) fn unlink_all(ctx: &JobCtx<'_>, map: &mut FileMap) -> Result<()> {
    loop {
        let num = map.num_checkpoints() as i64;
        let max_num = ctx.local.allreduce_i64(num, ReduceOp::Max)?;
        if max_num == 0 {
            break;
        }
        let ckpt = map.latest_checkpoint().map(|c| c as i64).unwrap_or(-1);
        let max_ckpt = ctx.local.allreduce_i64(ckpt, ReduceOp::Max)?;
        checkpoint_delete(ctx, map, max_ckpt as u64)?;
    }
    let _ = std::fs::remove_file(ctx.map_file);
    Ok(())
}

/// True when this process holds the complete, validated file set recorded
/// for (`ckpt`, `rank`): the expected count is declared and met, and every
/// file passes the sidecar check.
pub(crate) fn have_files(ctx: &JobCtx<'_>, map: &FileMap, ckpt: u64, rank: usize) -> bool {
    if !map.have_rank_by_checkpoint(ckpt, rank) {
        return false;
    }
    let files = map.files(ckpt, rank);
    if map.expected(ckpt, rank) != Some(files.len()) {
        return false;
    }
    files
        .iter()
        .all(|f| meta::have_file(f, ckpt, rank, ctx.ranks_world))
}

/// Drop every (ckpt, rank) set that is unreadable or incomplete: if any one
/// file of a set fails validation the whole set is deleted, because a
/// partial set is useless to the distributor and the rebuilder. Descriptor
/// records survive so topology can still be reconstructed.
pub(crate) fn clean_files(ctx: &JobCtx<'_>, map: &mut FileMap) -> Result<()> {
    let mut keep = FileMap::new();
    for ckpt in map.checkpoints() {
        for rank in map.ranks_by_checkpoint(ckpt) {
            let files = map.files(ckpt, rank);
            let expected = map.expected(ckpt, rank);

            let mut missing = expected != Some(files.len());
            for file in &files {
                if !meta::have_file(file, ckpt, rank, ctx.ranks_world) {
                    tracing::info!(
                        ckpt,
                        rank,
                        file = %file.display(),
                        "file is unreadable or incomplete"
                    );
                    missing = true;
                }
            }

            if let Some(desc) = map.desc(ckpt, rank) {
                keep.set_desc(ckpt, rank, desc.clone());
            }
            if let Some(tag) = map.tag(ckpt, rank, crate::filemap::TAG_PARTNER) {
                keep.set_tag(ckpt, rank, crate::filemap::TAG_PARTNER, tag);
            }

            if missing {
                for file in &files {
                    tracing::info!(ckpt, rank, file = %file.display(), "deleting file");
                    let _ = std::fs::remove_file(file);
                    Meta::unlink(file);
                }
            } else {
                if let Some(n) = expected {
                    keep.set_expected(ckpt, rank, n);
                }
                for file in &files {
                    keep.add_file(ckpt, rank, file);
                }
            }
        }
    }
    *map = keep;
    map.write(ctx.map_file)?;
    Ok(())
}

/// True when every file this node holds for `ckpt` is readable and its
/// sidecar marks it complete. Used as the cheap preflight before a flush.
pub(crate) fn check_files(map: &FileMap, ckpt: u64) -> bool {
    for rank in map.ranks_by_checkpoint(ckpt) {
        for file in map.files(ckpt, rank) {
            if std::fs::metadata(&file).is_err() {
                return false;
            }
            match Meta::read(&file) {
                Ok(m) if m.complete => {}
                _ => return false,
            }
        }
    }
    true
}

/// Base directory of the tier a cached checkpoint lives in, read from the
/// descriptor stored in the filemap.
pub(crate) fn base_of(map: &FileMap, ckpt: u64, rank: usize) -> Option<PathBuf> {
    map.desc(ckpt, rank).and_then(descriptor::base_from_kvtree)
}
