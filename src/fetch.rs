//! Fetch loader: repopulate the cache from a flushed checkpoint on the
//! parallel file system when nothing usable survived in node storage.
//!
//! Rank 0 reads and validates the summary (upconverting legacy text
//! formats), then scatters per-rank file lists through a sliding window of
//! `fetch_width` concurrent readers. Every fetched file is CRC-checked
//! against the summary when enabled, recorded in the filemap before it is
//! created, and re-protected by a fresh redundancy encode once everyone
//! has its data.

use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::cache;
use crate::descriptor;
use crate::engine::JobCtx;
use crate::error::{Error, Result};
use crate::fileio;
use crate::filemap::FileMap;
use crate::flush::{self, Location};
use crate::kvtree::Kvtree;
use crate::meta::{FileKind, Meta};
use crate::redundancy;
use crate::summary;

/// Copy one file named by `meta` from `src_dir` into `dst_dir`, verifying
/// the summary CRC when enabled. A corrupt file is unlinked rather than
/// left to masquerade as a checkpoint.
fn fetch_a_file(ctx: &JobCtx<'_>, src_dir: &Path, meta: &Meta, dst_dir: &Path) -> Result<PathBuf> {
    let src = src_dir.join(&meta.filename);
    let (dst, _bytes, crc) =
        fileio::copy_to(&src, dst_dir, ctx.params.file_buf_size, ctx.params.crc_on_flush)?;

    if let (Some(expected), Some(computed)) = (meta.crc32, crc) {
        if expected != computed {
            let _ = std::fs::remove_file(&dst);
            return Err(Error::Integrity {
                path: src,
                reason: "crc mismatch while fetching".into(),
            });
        }
    }
    Ok(dst)
}

/// Fetch every file in this rank's summary subtree into `ckpt_dir`,
/// recording each in the filemap first. Returns the bytes fetched.
fn fetch_files_list(
    ctx: &JobCtx<'_>,
    map: &mut FileMap,
    list: &Kvtree,
    checkpoint_id: u64,
    fetch_dir: &Path,
    ckpt_dir: &Path,
) -> Result<u64> {
    let mut total = 0u64;
    let mut count = 0usize;

    if let Some(files) = list.get(summary::KEY_FILE) {
        for (name, entry) in files.iter() {
            // Redundancy artifacts in old checkpoint dirs are not user
            // files; pulling one in would collide with the re-encode.
            if entry.get(summary::KEY_NOFETCH).is_some() {
                continue;
            }
            count += 1;

            let newfile = ckpt_dir.join(name);
            map.add_file(checkpoint_id, ctx.my_rank_world, &newfile);
            map.write(ctx.map_file)?;

            let size = entry.get_u64(summary::KEY_SIZE).ok_or_else(|| Error::Corrupt {
                path: fetch_dir.to_owned(),
                reason: format!("summary entry for {} has no size", name),
            })?;
            total += size;

            let complete = entry.get_u64(summary::KEY_COMPLETE).unwrap_or(1) != 0;
            let mut meta = Meta::new(
                &newfile,
                FileKind::Full,
                size,
                checkpoint_id,
                ctx.my_rank_world,
                ctx.ranks_world,
                complete,
            );
            meta.crc32 = entry.get_u64(summary::KEY_CRC).map(|v| v as u32);

            fetch_a_file(ctx, fetch_dir, &meta, ckpt_dir)?;
            meta.write(&newfile)?;
        }
    }

    map.set_expected(checkpoint_id, ctx.my_rank_world, count);
    map.write(ctx.map_file)?;
    Ok(total)
}

/// Fetch the checkpoint in `fetch_dir` into cache. Collective; on success
/// the checkpoint is re-encoded and marked resident in both cache and the
/// parallel file system. Returns the checkpoint id fetched.
pub(crate) fn fetch_files(
    ctx: &JobCtx<'_>,
    map: &mut FileMap,
    fetch_dir: &Path,
) -> Result<u64> {
    let start = Instant::now();

    // Everyone needs the directory rank 0 settled on.
    let mut dir_bytes = if ctx.my_rank_world == 0 {
        fetch_dir.to_string_lossy().into_owned().into_bytes()
    } else {
        Vec::new()
    };
    ctx.world.bcast(0, &mut dir_bytes)?;
    if dir_bytes.is_empty() {
        return Err(Error::CollectiveFailed("fetch"));
    }
    let fetch_dir = PathBuf::from(String::from_utf8_lossy(&dir_bytes).into_owned());

    // Rank 0 reads and validates the summary.
    let mut summary_tree = Kvtree::new();
    let mut checkpoint_id = 0u64;
    let mut read_ok = false;
    if ctx.my_rank_world == 0 {
        tracing::info!(dir = %fetch_dir.display(), "attempting fetch");
        match summary::read(&fetch_dir, ctx.ranks_world) {
            Ok((tree, id)) => {
                summary_tree = tree;
                checkpoint_id = id;
                read_ok = true;
            }
            Err(e) => {
                tracing::error!(dir = %fetch_dir.display(), error = %e, "failed to read summary");
            }
        }
    }
    let mut flag = vec![read_ok as u8];
    ctx.world.bcast(0, &mut flag)?;
    if flag[0] == 0 {
        return Err(Error::CollectiveFailed("fetch summary read"));
    }
    let mut id_bytes = checkpoint_id.to_le_bytes().to_vec();
    ctx.world.bcast(0, &mut id_bytes)?;
    let checkpoint_id = u64::from_le_bytes(id_bytes.as_slice().try_into().unwrap());

    // Clear any stale cache state for this id, then carve a fresh home.
    cache::checkpoint_delete(ctx, map, checkpoint_id)?;

    let desc = descriptor::descriptor_for(checkpoint_id, ctx.descriptors)
        .ok_or_else(|| Error::Fatal(format!("no descriptor for checkpoint {}", checkpoint_id)))?;

    map.set_desc(checkpoint_id, ctx.my_rank_world, desc.to_kvtree());
    map.write(ctx.map_file)?;

    cache::checkpoint_dir_create(ctx, desc, checkpoint_id)?;
    let ckpt_dir = desc.checkpoint_dir(checkpoint_id);

    // Scatter per-rank lists with a bounded number of readers in flight.
    let mut ok = true;
    if ctx.my_rank_world == 0 {
        let my_list = summary::rank_subtree(&summary_tree, checkpoint_id, 0)
            .cloned()
            .unwrap_or_default();
        if let Err(e) = fetch_files_list(ctx, map, &my_list, checkpoint_id, &fetch_dir, &ckpt_dir) {
            tracing::error!(error = %e, "fetch failed");
            ok = false;
        }

        let n = ctx.ranks_world;
        let w = ctx.params.fetch_width.clamp(1, n.max(2) - 1);
        let mut outstanding: Vec<usize> = Vec::with_capacity(w);
        let mut next = 1;
        while next < n || !outstanding.is_empty() {
            while next < n && outstanding.len() < w {
                let list = summary::rank_subtree(&summary_tree, checkpoint_id, next)
                    .cloned()
                    .unwrap_or_default();
                list.send(ctx.world, next)?;
                outstanding.push(next);
                next += 1;
            }
            let (src, _reply) = ctx.world.recv_any(&outstanding)?;
            outstanding.retain(|&r| r != src);
        }
    } else {
        let list = Kvtree::recv(ctx.world, 0)?;
        let mut bytes = 0u64;
        if let Err(e) = fetch_files_list(ctx, map, &list, checkpoint_id, &fetch_dir, &ckpt_dir) {
            tracing::error!(error = %e, "fetch failed");
            ok = false;
        } else {
            bytes = map
                .files(checkpoint_id, ctx.my_rank_world)
                .iter()
                .map(|f| fileio::filesize(f))
                .sum();
        }
        ctx.world.send(0, &bytes.to_le_bytes())?;
    }

    if !ctx.world.alltrue(ok)? {
        // Somebody's copy failed; a partial checkpoint is worse than none.
        cache::checkpoint_delete(ctx, map, checkpoint_id)?;
        if ctx.my_rank_world == 0 {
            tracing::error!(ckpt = checkpoint_id, "one or more processes failed to fetch");
        }
        return Err(Error::CollectiveFailed("fetch"));
    }

    // Freshly fetched data gets fresh redundancy.
    match redundancy::copy_files(ctx, map, desc, checkpoint_id) {
        Ok(_) => {
            flush::location_set(ctx, checkpoint_id, Location::Cache)?;
            flush::location_set(ctx, checkpoint_id, Location::Pfs)?;
            flush::location_unset(ctx, checkpoint_id, Location::Flushing)?;
        }
        Err(e) => {
            cache::checkpoint_delete(ctx, map, checkpoint_id)?;
            return Err(e);
        }
    }

    if ctx.my_rank_world == 0 {
        let secs = start.elapsed().as_secs_f64();
        tracing::info!(ckpt = checkpoint_id, secs, "fetch succeeded");
    }
    Ok(checkpoint_id)
}
