//! XOR redundancy: a reduce-scatter over the group ring that leaves each
//! member holding one parity chunk of the group's combined checkpoint data.
//!
//! Each member's files are treated as one logical byte range, padded with
//! zeros up to the group's maximum so unequal sizes XOR correctly. The
//! parity artifact carries a header naming the group, the chunk size, and
//! the file metadata of both this member (`CURRENT`) and its left
//! neighbour (`PARTNER`); the rebuilder leans on that pairing to recover a
//! lost member's header without any surviving copy of it.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use crate::comm::ReduceOp;
use crate::descriptor::Descriptor;
use crate::engine::JobCtx;
use crate::error::{Error, Result};
use crate::fileio::{self, FileSet};
use crate::filemap::FileMap;
use crate::kvtree::Kvtree;
use crate::meta::{FileKind, Meta};

pub(crate) const KEY_RANKS: &str = "RANKS";
pub(crate) const KEY_GROUP: &str = "GROUP";
pub(crate) const KEY_GROUP_RANKS: &str = "RANKS";
pub(crate) const KEY_GROUP_RANK: &str = "RANK";
pub(crate) const KEY_CKPT: &str = "CKPT";
pub(crate) const KEY_CHUNK: &str = "CHUNK";
pub(crate) const KEY_CURRENT: &str = "CURRENT";
pub(crate) const KEY_PARTNER: &str = "PARTNER";
pub(crate) const KEY_RANK: &str = "RANK";
pub(crate) const KEY_FILES: &str = "FILES";
pub(crate) const KEY_FILE: &str = "FILE";

/// Name of the parity artifact for one group member.
pub(crate) fn chunk_file_name(desc: &Descriptor) -> String {
    format!(
        "{}_of_{}_in_{}.xor",
        desc.group_rank + 1,
        desc.group_size,
        desc.group_id
    )
}

/// Record the world-rank map of the group in the artifact header.
fn header_set_ranks(header: &mut Kvtree, ctx: &JobCtx<'_>, desc: &Descriptor) -> Result<()> {
    header.set_u64(KEY_RANKS, ctx.ranks_world as u64);
    let group = header.entry(KEY_GROUP);
    group.set_u64(KEY_GROUP_RANKS, desc.group_size as u64);
    let worlds = desc
        .comm
        .allgather(&(ctx.my_rank_world as u64).to_le_bytes())?;
    for (i, bytes) in worlds.into_iter().enumerate() {
        let world = u64::from_le_bytes(
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| Error::Comm("bad rank map message".into()))?,
        );
        group
            .entry(KEY_GROUP_RANK)
            .set_u64(&i.to_string(), world);
    }
    Ok(())
}

/// Per-member file manifest: world rank, file count, and each file's
/// sidecar keyed by position.
fn current_manifest(
    ctx: &JobCtx<'_>,
    files: &[PathBuf],
) -> Result<(Kvtree, u64)> {
    let mut current = Kvtree::new();
    current.set_u64(KEY_RANK, ctx.my_rank_world as u64);
    current.set_u64(KEY_FILES, files.len() as u64);
    let mut bytes = 0u64;
    let list = current.entry(KEY_FILE);
    for (i, file) in files.iter().enumerate() {
        let meta = Meta::read(file)?;
        bytes += meta.filesize;
        list.set(&i.to_string(), meta.to_kvtree());
    }
    Ok((current, bytes))
}

/// Apply XOR redundancy for `checkpoint_id` across the descriptor's group.
pub(crate) fn copy_xor(
    ctx: &JobCtx<'_>,
    map: &mut FileMap,
    desc: &Descriptor,
    checkpoint_id: u64,
) -> Result<()> {
    let comm = desc.comm.as_ref();
    let n = desc.group_size;
    let me = desc.group_rank;
    let buf_size = ctx.params.mpi_buf_size.max(1);

    // Hold our left neighbour's descriptor for restart topology recovery.
    let lhs_desc = desc
        .to_kvtree()
        .sendrecv(comm, desc.rhs_rank, desc.lhs_rank)?;
    map.set_desc(checkpoint_id, desc.lhs_world, lhs_desc);

    let mut header = Kvtree::new();
    header_set_ranks(&mut header, ctx, desc)?;
    header.set_u64(KEY_CKPT, checkpoint_id);

    let files = map.files(checkpoint_id, ctx.my_rank_world);
    let (current, my_bytes) = current_manifest(ctx, &files)?;

    // Each member also carries its left neighbour's manifest, so any single
    // loss leaves the lost member's manifest alive on its right neighbour.
    let partner = current.sendrecv(comm, desc.rhs_rank, desc.lhs_rank)?;
    header.set(KEY_CURRENT, current);
    header.set(KEY_PARTNER, partner);

    let max_bytes = comm.allreduce_i64(my_bytes as i64, ReduceOp::Max)? as u64;

    // Parity splits the largest member across the other n-1; a floor of one
    // byte keeps the pipeline uniform when everyone wrote nothing.
    let mut chunk_size = max_bytes / (n as u64 - 1);
    if chunk_size * (n as u64 - 1) < max_bytes {
        chunk_size += 1;
    }
    chunk_size = chunk_size.max(1);
    header.set_u64(KEY_CHUNK, chunk_size);

    let ckpt_dir = desc.checkpoint_dir(checkpoint_id);
    let chunk_file = ckpt_dir.join(chunk_file_name(desc));

    // The map must name the artifact before the artifact exists, so a crash
    // in between leaves a stale entry rather than an orphan file.
    map.add_file(checkpoint_id, ctx.my_rank_world, &chunk_file);
    map.write(ctx.map_file)?;

    let mut fd_chunk = File::create(&chunk_file)?;
    fd_chunk.write_all(&header.to_bytes())?;

    let mut set = FileSet::open_read(&files)?;
    let mut send_buf = vec![0u8; buf_size];
    let mut recv_buf: Vec<u8> = Vec::new();

    // Reduce-scatter: on every round each member folds the incoming block
    // into its own and forwards it; after n-1 hops the block that lands is
    // the parity of everyone else's data for our chunk.
    let mut nread = 0u64;
    while nread < chunk_size {
        let count = ((chunk_size - nread) as usize).min(buf_size);
        for chunk_id in (0..n).rev() {
            if chunk_id > 0 {
                let mut rel = (me + n + chunk_id) % n;
                if rel > me {
                    rel -= 1;
                }
                let offset = chunk_size * rel as u64 + nread;
                set.read_pad(&mut send_buf[..count], offset)?;
            } else {
                send_buf[..count].fill(0);
            }

            if chunk_id < n - 1 {
                for i in 0..count {
                    send_buf[i] ^= recv_buf[i];
                }
            }

            if chunk_id > 0 {
                recv_buf = comm.sendrecv(desc.rhs_rank, &send_buf[..count], desc.lhs_rank)?;
                if recv_buf.len() != count {
                    return Err(Error::Comm(format!(
                        "xor pipeline block of {} bytes, expected {}",
                        recv_buf.len(),
                        count
                    )));
                }
            } else {
                fd_chunk.write_all(&send_buf[..count])?;
            }
        }
        nread += count as u64;
    }

    fd_chunk.sync_all()?;
    drop(fd_chunk);

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
    Ok(())
}
