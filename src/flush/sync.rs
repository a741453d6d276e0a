//! Synchronous flush: drain a cached checkpoint to the parallel file
//! system before returning to the caller.
//!
//! Rank 0 creates a timestamped directory under the prefix, then meters the
//! job through it with a sliding window of `flush_width` concurrent
//! writers: each rank waits for a start token, copies its files, and
//! reports its byte count and summary subtree back. The checkpoint becomes
//! observable only after rank 0 publishes the summary file and swings the
//! `scr.current` symlink.

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Local;

use crate::cache;
use crate::engine::{AsyncFlush, JobCtx};
use crate::error::{Error, Result};
use crate::fileio;
use crate::filemap::FileMap;
use crate::flush::{self, async_flush, Location};
use crate::index::Index;
use crate::kvtree::Kvtree;
use crate::meta::{FileKind, Meta};
use crate::summary;

/// Name of the symlink pointing at the newest flushed checkpoint.
pub const CURRENT_LINK: &str = "scr.current";

/// True when `file` should travel to the parallel file system. Redundancy
/// artifacts stay behind; they are rebuilt from scratch on fetch.
pub(crate) fn flushable(file: &Path) -> bool {
    match Meta::read(file) {
        Ok(meta) => meta.kind != FileKind::Xor,
        Err(_) => true,
    }
}

/// Create the destination directory `scr.<timestamp>.<jobid>.<id>` under
/// the prefix, record it in the index, and broadcast its path.
pub(crate) fn flush_dir_create(ctx: &JobCtx<'_>, checkpoint_id: u64) -> Result<PathBuf> {
    let mut path_bytes = Vec::new();
    if ctx.my_rank_world == 0 {
        let timestamp = Local::now().format("%Y-%m-%d_%H:%M:%S");
        let dirname = format!("scr.{}.{}.{}", timestamp, ctx.jobid, checkpoint_id);

        let mut index = Index::read(&ctx.params.prefix)?;
        index.add_dir(checkpoint_id, &dirname);
        index.mark_flushed(checkpoint_id, &dirname);
        index.write(&ctx.params.prefix)?;

        let dir = ctx.params.prefix.join(&dirname);
        match fileio::mkdir_p(&dir) {
            Ok(()) => path_bytes = dir.to_string_lossy().into_owned().into_bytes(),
            Err(e) => {
                tracing::error!(dir = %dir.display(), error = %e, "failed to create flush directory");
            }
        }
    }
    ctx.world.bcast(0, &mut path_bytes)?;
    if path_bytes.is_empty() {
        return Err(Error::CollectiveFailed("flush directory creation"));
    }
    Ok(PathBuf::from(String::from_utf8_lossy(&path_bytes).into_owned()))
}

/// Copy `src` into `dst_dir` along with its sidecar, verifying or
/// recording the CRC32 when enabled. Returns the sidecar as flushed and
/// the bytes written.
pub(crate) fn flush_a_file(
    ctx: &JobCtx<'_>,
    src: &Path,
    dst_dir: &Path,
) -> Result<(Meta, u64)> {
    let mut meta = Meta::read(src)?;

    let (dst, bytes, crc) = fileio::copy_to(src, dst_dir, ctx.params.file_buf_size, ctx.params.crc_on_flush)?;
    tracing::debug!(src = %src.display(), dst = %dst.display(), bytes, "flushed file");

    if let Some(computed) = crc {
        match meta.crc32 {
            Some(expected) if expected != computed => {
                // The cached copy no longer matches what we first wrote.
                meta.complete = false;
                meta.write(src)?;
                return Err(Error::Integrity {
                    path: src.to_owned(),
                    reason: "crc mismatch while flushing".into(),
                });
            }
            Some(_) => {}
            None => {
                meta.crc32 = Some(computed);
                meta.write(src)?;
            }
        }
    }

    // The sidecar travels too, so the directory is self-describing.
    fileio::copy_to(&Meta::path_for(src), dst_dir, ctx.params.file_buf_size, false)?;

    Ok((meta, bytes))
}

/// Flush this rank's files for `checkpoint_id` into `dir`, populating
/// `rank_hash` with the summary subtree (`FILE -> name -> SIZE/CRC/...`).
/// Failures mark the file incomplete in the summary rather than aborting,
/// so rank 0 can see the full picture.
pub(crate) fn flush_files_list(
    ctx: &JobCtx<'_>,
    map: &FileMap,
    rank_hash: &mut Kvtree,
    checkpoint_id: u64,
    dir: &Path,
) -> (bool, u64) {
    let mut ok = true;
    let mut total = 0u64;
    for file in map.files(checkpoint_id, ctx.my_rank_world) {
        if !flushable(&file) {
            continue;
        }
        let base = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file_hash = rank_hash.set_kv(summary::KEY_FILE, &base);
        match flush_a_file(ctx, &file, dir) {
            Ok((meta, bytes)) => {
                file_hash.set_u64(summary::KEY_SIZE, meta.filesize);
                if let Some(crc) = meta.crc32 {
                    file_hash.set_u64(summary::KEY_CRC, crc as u64);
                }
                total += bytes;
            }
            Err(e) => {
                tracing::error!(file = %file.display(), error = %e, "failed to flush file");
                file_hash.set_u64(summary::KEY_COMPLETE, 0);
                ok = false;
            }
        }
    }
    (ok, total)
}

/// Publish the summary file and swing the `scr.current` symlink. Only after
/// both steps is the checkpoint observable on the parallel file system.
pub(crate) fn publish(
    ctx: &JobCtx<'_>,
    dir: &Path,
    checkpoint_id: u64,
    data: &Kvtree,
) -> Result<()> {
    summary::write(&ctx.params.prefix, dir, checkpoint_id, true, ctx.ranks_world, data)?;

    let current = ctx.params.prefix.join(CURRENT_LINK);
    let target = dir.file_name().ok_or_else(|| Error::InvalidOperation(
        "flush directory has no name".into(),
    ))?;
    if current.symlink_metadata().is_ok() {
        std::fs::remove_file(&current)?;
    }
    std::os::unix::fs::symlink(target, &current)?;
    Ok(())
}

/// Gather per-rank summary subtrees at rank 0 through a sliding window of
/// `width` outstanding ranks. Returns the merged data and total bytes at
/// rank 0.
pub(crate) fn gather_window<F>(
    ctx: &JobCtx<'_>,
    width: usize,
    mut local_part: F,
) -> Result<(Kvtree, u64, bool)>
where
    F: FnMut(&mut Kvtree) -> (bool, u64),
{
    let n = ctx.ranks_world;
    let mut data = Kvtree::new();
    let mut ok;
    let mut total;

    if ctx.my_rank_world == 0 {
        let rank_hash = data.set_kv_int(summary::KEY_RANK, 0);
        let (my_ok, my_bytes) = local_part(rank_hash);
        ok = my_ok;
        total = my_bytes;

        let w = width.clamp(1, n.max(2) - 1);
        let mut outstanding: Vec<usize> = Vec::with_capacity(w);
        let mut next = 1;
        while next < n || !outstanding.is_empty() {
            while next < n && outstanding.len() < w {
                ctx.world.send(next, &[1])?;
                outstanding.push(next);
                next += 1;
            }
            let (src, reply) = ctx.world.recv_any(&outstanding)?;
            outstanding.retain(|&r| r != src);
            let bytes = u64::from_le_bytes(
                reply
                    .as_slice()
                    .try_into()
                    .map_err(|_| Error::Comm("bad byte-count reply".into()))?,
            );
            total += bytes;
            let incoming = Kvtree::recv(ctx.world, src)?;
            data.merge(&incoming);
        }
    } else {
        // Wait for our start token before touching the file system.
        ctx.world.recv(0)?;
        let rank_hash = data.set_kv_int(summary::KEY_RANK, ctx.my_rank_world as u64);
        let (my_ok, my_bytes) = local_part(rank_hash);
        ok = my_ok;
        total = my_bytes;
        ctx.world.send(0, &total.to_le_bytes())?;
        data.send(ctx.world, 0)?;
    }

    ok = ctx.world.alltrue(ok)?;
    Ok((data, total, ok))
}

/// Synchronously flush `checkpoint_id` to the parallel file system.
pub(crate) fn flush_files(
    ctx: &JobCtx<'_>,
    map: &mut FileMap,
    async_state: &mut Option<AsyncFlush>,
    checkpoint_id: u64,
) -> Result<()> {
    if ctx.params.flush == 0 {
        return Err(Error::InvalidOperation("flush is disabled".into()));
    }
    if !flush::need_flush(ctx, checkpoint_id)? {
        return Ok(());
    }

    if ctx.my_rank_world == 0 {
        tracing::info!(ckpt = checkpoint_id, "initiating flush");
    }
    ctx.world.barrier()?;
    let start = Instant::now();

    if !ctx.world.alltrue(cache::check_files(map, checkpoint_id))? {
        if ctx.my_rank_world == 0 {
            tracing::error!(ckpt = checkpoint_id, "one or more processes are missing files");
        }
        return Err(Error::CollectiveFailed("flush preflight"));
    }

    // An in-flight async flush owns the transfer machinery; wait it out.
    // It may even be draining this very checkpoint.
    if async_state.is_some() {
        async_flush::wait(ctx, map, async_state)?;
        if !flush::need_flush(ctx, checkpoint_id)? {
            return Ok(());
        }
    }

    let dir = flush_dir_create(ctx, checkpoint_id)?;
    if ctx.my_rank_world == 0 {
        tracing::info!(dir = %dir.display(), "flushing to directory");
    }

    let width = ctx.params.flush_width;
    let (data, total, all_ok) = gather_window(ctx, width, |rank_hash| {
        flush_files_list(ctx, map, rank_hash, checkpoint_id, &dir)
    })?;

    let mut flushed = all_ok;
    if ctx.my_rank_world == 0 && flushed {
        if let Err(e) = publish(ctx, &dir, checkpoint_id, &data) {
            tracing::error!(error = %e, "failed to publish summary");
            flushed = false;
        }
    }
    let mut flag = vec![flushed as u8];
    ctx.world.bcast(0, &mut flag)?;
    let flushed = flag[0] != 0;

    if flushed {
        flush::location_set(ctx, checkpoint_id, Location::Pfs)?;
    }

    if ctx.my_rank_world == 0 {
        let secs = start.elapsed().as_secs_f64();
        let mbs = total as f64 / (1024.0 * 1024.0 * secs.max(1e-9));
        if flushed {
            tracing::info!(ckpt = checkpoint_id, bytes = total, secs, mbs, "flush succeeded");
        } else {
            tracing::error!(ckpt = checkpoint_id, "flush failed");
        }
    }

    if !flushed {
        return Err(Error::CollectiveFailed("flush"));
    }
    Ok(())
}
