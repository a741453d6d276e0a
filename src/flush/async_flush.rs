//! Asynchronous flush: hand the byte movement to a transfer daemon through
//! a lock-guarded transfer file, and track its progress from the library.
//!
//! The contract is the file, not a channel: the library enqueues
//! `FILES.<src> -> {DESTINATION, SIZE, WRITTEN}` entries plus bandwidth and
//! runtime hints, sets `COMMAND=RUN`, and polls `WRITTEN` until every file
//! is fully copied. Completion then follows the synchronous path's summary
//! gather and publication. `FLUSHING` is set in the flush file for exactly
//! the window between start and complete.

use std::time::Instant;

use crate::cache;
use crate::comm::ReduceOp;
use crate::engine::{AsyncFlush, JobCtx};
use crate::error::{Error, Result};
use crate::fileio;
use crate::filemap::FileMap;
use crate::flush::{self, sync, Location};
use crate::kvtree::Kvtree;
use crate::meta::Meta;
use crate::summary;

pub(crate) const KEY_FILES: &str = "FILES";
pub(crate) const KEY_DESTINATION: &str = "DESTINATION";
pub(crate) const KEY_SIZE: &str = "SIZE";
pub(crate) const KEY_WRITTEN: &str = "WRITTEN";
pub(crate) const KEY_BW: &str = "BW";
pub(crate) const KEY_PERCENT: &str = "PERCENT";
pub(crate) const KEY_COMMAND: &str = "COMMAND";
pub(crate) const KEY_STATE: &str = "STATE";
pub(crate) const KEY_FLAG: &str = "FLAG";
pub(crate) const COMMAND_RUN: &str = "RUN";
pub(crate) const COMMAND_STOP: &str = "STOP";
pub(crate) const STATE_RUN: &str = "RUN";
pub(crate) const STATE_STOP: &str = "STOP";
pub(crate) const FLAG_DONE: &str = "DONE";

/// Queue `file` (and its sidecar) for transfer into `dst_dir`, returning
/// the bytes enqueued.
fn enqueue_file(hash: &mut Kvtree, file: &std::path::Path, dst_dir: &std::path::Path) -> u64 {
    let mut bytes = 0;
    for src in [file.to_path_buf(), Meta::path_for(file)] {
        let name = match src.file_name() {
            Some(n) => n.to_string_lossy().into_owned(),
            None => continue,
        };
        let size = fileio::filesize(&src);
        let entry = hash.set_kv(KEY_FILES, &src.to_string_lossy());
        entry.set_val(KEY_DESTINATION, &dst_dir.join(&name).to_string_lossy());
        entry.set_u64(KEY_SIZE, size);
        entry.set_u64(KEY_WRITTEN, 0);
        bytes += size;
    }
    bytes
}

/// True when every queued file in `hash` reports `WRITTEN >= SIZE`. Also
/// sums the bytes written so far.
fn files_complete(hash: &Kvtree) -> (bool, u64) {
    let files = match hash.get(KEY_FILES) {
        Some(f) => f,
        None => return (false, 0),
    };
    let mut complete = true;
    let mut bytes = 0;
    for (_, entry) in files.iter() {
        match (entry.get_u64(KEY_SIZE), entry.get_u64(KEY_WRITTEN)) {
            (Some(size), Some(written)) => {
                if written < size {
                    complete = false;
                }
                bytes += written;
            }
            _ => complete = false,
        }
    }
    (complete, bytes)
}

/// Write `command` into the transfer file. Node-master only.
fn command_set(ctx: &JobCtx<'_>, command: &str) -> Result<()> {
    if ctx.my_rank_local == 0 {
        let (fd, mut tree) = Kvtree::lock_open_read(ctx.transfer_file)?;
        tree.set_val(KEY_COMMAND, command);
        tree.write_unlock(ctx.transfer_file, fd)?;
    }
    Ok(())
}

/// Block until every node's transfer daemon reports `state`.
fn state_wait(ctx: &JobCtx<'_>, state: &str) -> Result<()> {
    loop {
        let mut valid = true;
        if ctx.my_rank_local == 0 {
            let tree = Kvtree::read_file_locked(ctx.transfer_file)?;
            valid = tree.get_kv(KEY_STATE, state).is_some();
        }
        if ctx.world.alltrue(valid)? {
            return Ok(());
        }
        std::thread::sleep(ctx.params.poll_interval);
    }
}

/// Remove every queued file from the transfer file. Node-master only.
fn files_clear_all(ctx: &JobCtx<'_>) -> Result<()> {
    if ctx.my_rank_local == 0 {
        let (fd, mut tree) = Kvtree::lock_open_read(ctx.transfer_file)?;
        tree.unset(KEY_FILES);
        tree.write_unlock(ctx.transfer_file, fd)?;
    }
    Ok(())
}

/// Start an asynchronous flush of `checkpoint_id`.
pub(crate) fn start(
    ctx: &JobCtx<'_>,
    map: &mut FileMap,
    state: &mut Option<AsyncFlush>,
    checkpoint_id: u64,
) -> Result<()> {
    if ctx.params.flush == 0 {
        return Err(Error::InvalidOperation("flush is disabled".into()));
    }
    if !flush::need_flush(ctx, checkpoint_id)? {
        return Ok(());
    }
    if let Some(active) = state.as_ref() {
        return Err(Error::InvalidOperation(format!(
            "async flush of checkpoint {} already in progress",
            active.checkpoint_id
        )));
    }

    if ctx.my_rank_world == 0 {
        tracing::info!(ckpt = checkpoint_id, "initiating async flush");
    }
    ctx.world.barrier()?;

    flush::location_set(ctx, checkpoint_id, Location::Flushing)?;

    if !ctx.world.alltrue(cache::check_files(map, checkpoint_id))? {
        if ctx.my_rank_world == 0 {
            tracing::error!(ckpt = checkpoint_id, "one or more processes are missing files");
        }
        flush::location_unset(ctx, checkpoint_id, Location::Flushing)?;
        return Err(Error::CollectiveFailed("async flush preflight"));
    }

    let dir = match sync::flush_dir_create(ctx, checkpoint_id) {
        Ok(dir) => dir,
        Err(e) => {
            flush::location_unset(ctx, checkpoint_id, Location::Flushing)?;
            return Err(e);
        }
    };
    if ctx.my_rank_world == 0 {
        tracing::info!(dir = %dir.display(), "async flushing to directory");
    }

    // Queue this rank's files.
    let mut files = Kvtree::new();
    let mut my_bytes = 0u64;
    let mut num_files = 0usize;
    for file in map.files(checkpoint_id, ctx.my_rank_world) {
        if sync::flushable(&file) {
            my_bytes += enqueue_file(&mut files, &file, &dir);
            num_files += 1;
        }
    }

    // The node master folds every local queue into the transfer file and
    // arms the daemon.
    let gathered = ctx.local.gather(0, &files.to_bytes())?;
    if let Some(trees) = gathered {
        let (fd, mut transfer) = Kvtree::lock_open_read(ctx.transfer_file)?;
        for bytes in trees {
            let tree = Kvtree::from_bytes(&bytes)
                .map_err(|e| Error::Comm(format!("bad transfer queue message: {}", e)))?;
            transfer.merge(&tree);
        }
        if transfer.get_val(KEY_BW).is_none() && ctx.params.flush_async_bw > 0.0 {
            let bw = ctx.params.flush_async_bw / ctx.ranks_level as f64;
            transfer.set_val(KEY_BW, &format!("{}", bw));
        }
        if transfer.get_val(KEY_PERCENT).is_none() && ctx.params.flush_async_percent > 0.0 {
            transfer.set_val(KEY_PERCENT, &format!("{}", ctx.params.flush_async_percent));
        }
        transfer.set_val(KEY_COMMAND, COMMAND_RUN);
        transfer.unset_kv(KEY_FLAG, FLAG_DONE);
        transfer.write_unlock(ctx.transfer_file, fd)?;
    }

    let total = ctx.world.allreduce_i64(my_bytes as i64, ReduceOp::Sum)? as u64;

    *state = Some(AsyncFlush {
        checkpoint_id,
        dir,
        files,
        num_files,
        bytes_total: total,
        started: Instant::now(),
    });

    ctx.world.barrier()?;
    Ok(())
}

/// Check whether the transfer daemon has finished. Returns completion and
/// job-wide bytes written so far.
pub(crate) fn test(
    ctx: &JobCtx<'_>,
    map: &FileMap,
    state: &Option<AsyncFlush>,
    checkpoint_id: u64,
) -> Result<(bool, u64)> {
    let _ = state;
    if ctx.params.flush == 0 {
        return Err(Error::InvalidOperation("flush is disabled".into()));
    }

    if !ctx.world.alltrue(cache::check_files(map, checkpoint_id))? {
        if ctx.my_rank_world == 0 {
            tracing::error!(ckpt = checkpoint_id, "files went missing during async flush");
        }
        return Err(Error::CollectiveFailed("async flush test"));
    }

    let mut complete = true;
    let mut bytes = 0u64;
    if ctx.my_rank_local == 0 {
        let tree = Kvtree::read_file_locked(ctx.transfer_file)?;
        let (done, written) = files_complete(&tree);
        complete = done;
        bytes = written;
    }
    let total = ctx.world.allreduce_i64(bytes as i64, ReduceOp::Sum)? as u64;
    let all_done = ctx.world.alltrue(complete)?;
    Ok((all_done, total))
}

/// Finish a completed asynchronous flush: gather the summary, publish it,
/// flip the flush-file locations, and release the transfer entries.
pub(crate) fn complete(
    ctx: &JobCtx<'_>,
    map: &mut FileMap,
    state: &mut Option<AsyncFlush>,
    checkpoint_id: u64,
) -> Result<()> {
    let active = state.take().ok_or_else(|| {
        Error::InvalidOperation("no async flush in progress".into())
    })?;

    if !ctx.world.alltrue(cache::check_files(map, checkpoint_id))? {
        if ctx.my_rank_world == 0 {
            tracing::error!(ckpt = checkpoint_id, "files went missing during async flush");
        }
        return Err(Error::CollectiveFailed("async flush complete"));
    }

    // The daemon moved the bytes; each rank only reports sidecar facts.
    let (data, _total, all_ok) = sync::gather_window(ctx, ctx.params.flush_width, |rank_hash| {
        let mut ok = true;
        for file in map.files(checkpoint_id, ctx.my_rank_world) {
            if !sync::flushable(&file) {
                continue;
            }
            let base = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let file_hash = rank_hash.set_kv(summary::KEY_FILE, &base);
            match Meta::read(&file) {
                Ok(meta) => {
                    file_hash.set_u64(summary::KEY_SIZE, meta.filesize);
                    if let Some(crc) = meta.crc32 {
                        file_hash.set_u64(summary::KEY_CRC, crc as u64);
                    }
                }
                Err(_) => {
                    file_hash.set_u64(summary::KEY_COMPLETE, 0);
                    ok = false;
                }
            }
        }
        (ok, 0)
    })?;

    let mut flushed = all_ok;
    if ctx.my_rank_world == 0 && flushed {
        if let Err(e) = sync::publish(ctx, &active.dir, checkpoint_id, &data) {
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
    flush::location_unset(ctx, checkpoint_id, Location::Flushing)?;

    // Retire our entries and park the daemon.
    if ctx.my_rank_local == 0 {
        let (fd, mut transfer) = Kvtree::lock_open_read(ctx.transfer_file)?;
        if let Some(queued) = active.files.get(KEY_FILES) {
            for src in queued.keys() {
                transfer.unset_kv(KEY_FILES, src);
            }
        }
        transfer.set_val(KEY_COMMAND, COMMAND_STOP);
        transfer.write_unlock(ctx.transfer_file, fd)?;
    }

    if ctx.my_rank_world == 0 {
        let secs = active.started.elapsed().as_secs_f64();
        let mbs = active.bytes_total as f64 / (1024.0 * 1024.0 * secs.max(1e-9));
        if flushed {
            tracing::info!(
                ckpt = checkpoint_id,
                bytes = active.bytes_total,
                secs,
                mbs,
                "async flush succeeded"
            );
        } else {
            tracing::error!(ckpt = checkpoint_id, "async flush failed");
        }
    }

    if !flushed {
        return Err(Error::CollectiveFailed("async flush"));
    }
    Ok(())
}

/// Cancel any ongoing asynchronous flush: command the daemons to stop,
/// wait until every node confirms, and clear the queue.
pub(crate) fn stop(ctx: &JobCtx<'_>, state: &mut Option<AsyncFlush>) -> Result<()> {
    if ctx.params.flush == 0 {
        return Err(Error::InvalidOperation("flush is disabled".into()));
    }
    if ctx.my_rank_world == 0 {
        tracing::info!("stopping async flush");
    }

    command_set(ctx, COMMAND_STOP)?;
    state_wait(ctx, STATE_STOP)?;
    files_clear_all(ctx)?;

    if let Some(active) = state.take() {
        flush::location_unset(ctx, active.checkpoint_id, Location::Flushing)?;
    }

    ctx.world.barrier()?;
    Ok(())
}

/// Block until the in-flight asynchronous flush (if any) completes.
pub(crate) fn wait(
    ctx: &JobCtx<'_>,
    map: &mut FileMap,
    state: &mut Option<AsyncFlush>,
) -> Result<()> {
    while let Some(active) = state.as_ref() {
        let id = active.checkpoint_id;
        let bytes_total = active.bytes_total;
        if !flush::is_flushing(ctx, id)? {
            *state = None;
            break;
        }
        let (done, bytes) = test(ctx, map, state, id)?;
        if done {
            complete(ctx, map, state, id)?;
        } else {
            if ctx.my_rank_world == 0 {
                let percent = if bytes_total > 0 {
                    bytes as f64 / bytes_total as f64 * 100.0
                } else {
                    100.0
                };
                tracing::info!(ckpt = id, percent = percent as u32, "flush in progress");
            }
            std::thread::sleep(ctx.params.poll_interval);
        }
    }
    Ok(())
}
