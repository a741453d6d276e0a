//! Rebuild engine: reconstruct a lost group member from the survivors.
//!
//! For XOR, the surviving members form a pipeline that streams the XOR of
//! their data toward the rebuilding rank; after one pass over every chunk
//! the root has byte-identical copies of its original files and its parity
//! artifact. For PARTNER (and LOCAL) the distributor has already rehomed
//! any surviving copies, so rebuilding reduces to re-running the encoder.

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;

use crate::cache;
use crate::comm::ReduceOp;
use crate::descriptor::{CopyType, Descriptor};
use crate::engine::JobCtx;
use crate::error::{Error, Result};
use crate::fileio::{self, FileSet};
use crate::filemap::FileMap;
use crate::kvtree::Kvtree;
use crate::meta::{FileKind, Meta};
use crate::redundancy;
use crate::redundancy::xor::{
    chunk_file_name, KEY_CHUNK, KEY_CURRENT, KEY_FILE, KEY_FILES, KEY_PARTNER,
};

/// Find this rank's parity artifact among its cached files, if present.
pub(crate) fn have_xor_file(map: &FileMap, checkpoint_id: u64, rank: usize) -> Option<PathBuf> {
    map.files(checkpoint_id, rank)
        .into_iter()
        .find(|f| matches!(Meta::read(f), Ok(m) if m.kind == FileKind::Xor))
}

/// The files a `CURRENT` manifest describes, rooted in `dir`, in manifest
/// order (which is the order the encoder laid them into the logical file).
fn manifest_files(current: &Kvtree, dir: &std::path::Path) -> Result<Vec<(PathBuf, Meta)>> {
    let bad = |reason: &str| Error::Comm(format!("bad xor header: {}", reason));
    let num = current.get_u64(KEY_FILES).ok_or_else(|| bad("missing file count"))? as usize;
    let mut out = Vec::with_capacity(num);
    for i in 0..num {
        let meta_tree = current
            .get(KEY_FILE)
            .and_then(|t| t.get(&i.to_string()))
            .ok_or_else(|| bad("missing file entry"))?;
        let meta = Meta::from_kvtree(meta_tree).ok_or_else(|| bad("malformed file entry"))?;
        out.push((dir.join(&meta.filename), meta));
    }
    Ok(out)
}

/// Run the pipelined rebuild of group member `root` for `checkpoint_id`.
/// Every surviving member participates; the root ends up with its files,
/// its parity artifact, and fresh sidecars for all of them.
pub(crate) fn rebuild_xor(
    ctx: &JobCtx<'_>,
    map: &mut FileMap,
    desc: &Descriptor,
    checkpoint_id: u64,
    root: usize,
) -> Result<()> {
    let comm = desc.comm.as_ref();
    let n = desc.group_size;
    let me = desc.group_rank;
    let buf_size = ctx.params.mpi_buf_size.max(1);
    let ckpt_dir = desc.checkpoint_dir(checkpoint_id);

    let mut fd_chunk: File;
    let chunk_file: PathBuf;
    let header: Kvtree;
    let mut files: FileSet;
    let mut root_files: Vec<(PathBuf, Meta)> = Vec::new();

    if me != root {
        // Survivor: open the artifact, learn the layout from its header.
        chunk_file = have_xor_file(map, checkpoint_id, ctx.my_rank_world)
            .ok_or_else(|| Error::Unrecoverable(checkpoint_id))?;
        fd_chunk = File::open(&chunk_file)?;
        header = Kvtree::read_from(&mut fd_chunk).map_err(|e| Error::Corrupt {
            path: chunk_file.clone(),
            reason: format!("unreadable xor header: {}", e),
        })?;

        let current = header
            .get(KEY_CURRENT)
            .ok_or_else(|| Error::Corrupt {
                path: chunk_file.clone(),
                reason: "xor header missing CURRENT".into(),
            })?;
        let listed = manifest_files(current, &ckpt_dir)?;
        files = FileSet::open_read(
            &listed.iter().map(|(p, _)| p.clone()).collect::<Vec<_>>(),
        )?;

        // The member left of the root holds the root's manifest under
        // PARTNER; the member right of the root seeds the root's header.
        if root == desc.lhs_rank {
            header.send(comm, desc.lhs_rank)?;
        }
        if root == desc.rhs_rank {
            current.send(comm, desc.rhs_rank)?;
        }
    } else {
        // Root: reconstruct the header from the neighbours, then recreate
        // every file it names.
        let mut received = Kvtree::recv(comm, desc.rhs_rank)?;
        let current = received.get(KEY_PARTNER).cloned().unwrap_or_default();
        received.unset(KEY_CURRENT);
        received.unset(KEY_PARTNER);
        received.set(KEY_CURRENT, current);

        let partner = Kvtree::recv(comm, desc.lhs_rank)?;
        received.set(KEY_PARTNER, partner);
        header = received;

        let current = header
            .get(KEY_CURRENT)
            .ok_or_else(|| Error::Comm("bad xor header: missing CURRENT".into()))?;
        root_files = manifest_files(current, &ckpt_dir)?;

        chunk_file = ckpt_dir.join(chunk_file_name(desc));

        // Everything goes into the map before anything is created, so a
        // crash mid-rebuild is seen as a stale entry, not silent loss.
        map.add_file(checkpoint_id, ctx.my_rank_world, &chunk_file);
        for (path, _) in &root_files {
            map.add_file(checkpoint_id, ctx.my_rank_world, path);
        }
        map.set_expected(checkpoint_id, ctx.my_rank_world, root_files.len() + 1);
        map.write(ctx.map_file)?;

        fd_chunk = File::create(&chunk_file)?;
        let layout: Vec<(PathBuf, u64)> = root_files
            .iter()
            .map(|(p, m)| (p.clone(), m.filesize))
            .collect();
        files = FileSet::create_write(&layout)?;
        fd_chunk.write_all(&header.to_bytes())?;
    }

    let chunk_size = header.get_u64(KEY_CHUNK).ok_or_else(|| Error::Corrupt {
        path: chunk_file.clone(),
        reason: "xor header missing chunk size".into(),
    })?;

    let mut send_buf = vec![0u8; buf_size];
    let mut recv_buf = vec![0u8; buf_size];

    // Pipelined XOR toward the root. The chunk owned by each member lives
    // in its artifact; every other chunk maps onto its logical files.
    let mut offset = 0u64;
    for chunk_id in 0..n {
        let mut nread = 0u64;
        while nread < chunk_size {
            let count = ((chunk_size - nread) as usize).min(buf_size);
            if me != root {
                if chunk_id != me {
                    files.read_pad(&mut send_buf[..count], offset)?;
                    offset += count as u64;
                } else {
                    fd_chunk.read_exact(&mut send_buf[..count])?;
                }

                // Fold in the upstream block unless we start the pipeline.
                if root != desc.lhs_rank {
                    let incoming = comm.recv(desc.lhs_rank)?;
                    if incoming.len() != count {
                        return Err(Error::Comm("xor pipeline block size mismatch".into()));
                    }
                    for i in 0..count {
                        send_buf[i] ^= incoming[i];
                    }
                }
                comm.send(desc.rhs_rank, &send_buf[..count])?;
            } else {
                let incoming = comm.recv(desc.lhs_rank)?;
                if incoming.len() != count {
                    return Err(Error::Comm("xor pipeline block size mismatch".into()));
                }
                recv_buf[..count].copy_from_slice(&incoming);
                if chunk_id != me {
                    files.write_pad(&recv_buf[..count], offset)?;
                    offset += count as u64;
                } else {
                    fd_chunk.write_all(&recv_buf[..count])?;
                }
            }
            nread += count as u64;
        }
    }

    if me == root {
        fd_chunk.sync_all()?;
        files.sync_all()?;
    }
    drop(fd_chunk);

    if me == root {
        // Sidecars for the reconstructed files come straight from the
        // manifest, CRCs included, so a bad rebuild fails verification.
        for (path, meta) in &root_files {
            meta.write(path)?;
            if ctx.params.crc_on_copy {
                fileio::compute_crc(path)?;
            }
        }

        let meta = Meta::new(
            &chunk_file,
            FileKind::Xor,
            fileio::filesize(&chunk_file),
            checkpoint_id,
            ctx.my_rank_world,
            ctx.ranks_world,
            true,
        );
        meta.write(&chunk_file)?;
        if ctx.params.crc_on_copy {
            fileio::compute_crc(&chunk_file)?;
        }
    }
    Ok(())
}

/// Detect whether this group needs (and can run) an XOR rebuild, and run
/// it. At most one missing member is recoverable; a second loss in the same
/// group fails the whole checkpoint across the job.
pub(crate) fn attempt_rebuild_xor(
    ctx: &JobCtx<'_>,
    map: &mut FileMap,
    desc: &Descriptor,
    checkpoint_id: u64,
) -> Result<()> {
    let comm = desc.comm.as_ref();

    let mut have_mine = cache::have_files(ctx, map, checkpoint_id, ctx.my_rank_world);
    if have_xor_file(map, checkpoint_id, ctx.my_rank_world).is_none() {
        have_mine = false;
    }
    let need_rebuild = !have_mine;

    let total = comm.allreduce_i64(need_rebuild as i64, ReduceOp::Sum)?;
    let set_can_rebuild = total <= 1;
    if !ctx.world.alltrue(set_can_rebuild)? {
        if ctx.my_rank_world == 0 {
            tracing::error!(ckpt = checkpoint_id, "cannot rebuild missing files");
        }
        return Err(Error::Unrecoverable(checkpoint_id));
    }

    let mut rc = Ok(());
    if total > 0 {
        let candidate = if need_rebuild { desc.group_rank as i64 } else { -1 };
        let root = comm.allreduce_i64(candidate, ReduceOp::Max)? as usize;
        if need_rebuild {
            tracing::info!(ckpt = checkpoint_id, "rebuilding files from xor segments");
        }
        rc = rebuild_xor(ctx, map, desc, checkpoint_id, root);
    }

    if !ctx.world.alltrue(rc.is_ok())? {
        if ctx.my_rank_world == 0 {
            tracing::info!(ckpt = checkpoint_id, "one or more processes failed to rebuild");
        }
        return rc.and(Err(Error::Unrecoverable(checkpoint_id)));
    }
    rc
}

/// Restore full redundancy for `checkpoint_id` after a restart: run the
/// XOR rebuild if that is the scheme, verify everyone has their files, and
/// re-encode for LOCAL/PARTNER (whose surviving copies were rehomed by the
/// distributor).
pub(crate) fn rebuild_files(
    ctx: &JobCtx<'_>,
    map: &mut FileMap,
    desc: &Descriptor,
    checkpoint_id: u64,
) -> Result<()> {
    if desc.copy_type == CopyType::Xor {
        attempt_rebuild_xor(ctx, map, desc, checkpoint_id)?;
    }

    let have_mine = cache::have_files(ctx, map, checkpoint_id, ctx.my_rank_world);
    if !ctx.world.alltrue(have_mine)? {
        if ctx.my_rank_world == 0 {
            tracing::info!(ckpt = checkpoint_id, "missing checkpoint files");
        }
        return Err(Error::Unrecoverable(checkpoint_id));
    }

    if matches!(desc.copy_type, CopyType::Local | CopyType::Partner) {
        redundancy::copy_files(ctx, map, desc, checkpoint_id)?;
    }
    Ok(())
}
