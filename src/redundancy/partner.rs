//! PARTNER redundancy: stream full copies of a rank's files to its right
//! partner, and the generic pairwise file-swap machinery the distributor
//! reuses.
//!
//! Files travel in fixed-size chunks, one message per chunk; a chunk
//! shorter than the buffer marks the end of a file, so a zero-byte file
//! costs exactly one empty message. In `Move` mode the incoming bytes
//! overwrite the outgoing file in place to keep peak cache usage flat, then
//! the file is truncated and renamed to the incoming name.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::comm::Comm;
use crate::descriptor::Descriptor;
use crate::engine::JobCtx;
use crate::error::{Error, Result};
use crate::fileio;
use crate::filemap::{FileMap, TAG_PARTNER};
use crate::kvtree::Kvtree;
use crate::meta::Meta;

/// How [`swap_files`] treats the outgoing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SwapMode {
    /// Both ends keep their file; the receiver gains a copy.
    Copy,
    /// The sender gives its file up; used when rehoming files on restart.
    Move,
}

/// Exchange file names with the partners: tell `rank_send` which file is
/// coming, learn from `rank_recv` what we will receive, and reframe the
/// incoming name into `dir_recv`. Returns the local path the incoming file
/// will land at, when a receive is expected.
pub(crate) fn swap_file_names(
    comm: &dyn Comm,
    file_send: Option<&Path>,
    rank_send: Option<usize>,
    rank_recv: Option<usize>,
    dir_recv: &Path,
) -> Result<Option<PathBuf>> {
    if let (Some(rank), Some(file)) = (rank_send, file_send) {
        comm.send(rank, file.to_string_lossy().as_bytes())?;
    }
    if let Some(rank) = rank_recv {
        let name = comm.recv(rank)?;
        let name = String::from_utf8_lossy(&name).into_owned();
        let base = Path::new(&name)
            .file_name()
            .ok_or_else(|| Error::Comm(format!("partner sent unusable file name {:?}", name)))?;
        Ok(Some(dir_recv.join(base)))
    } else {
        Ok(None)
    }
}

/// Stream `file_send` to `rank_send` while receiving `file_recv` from
/// `rank_recv`, in chunks of the configured message buffer size. Either
/// side may be absent. The receiver verifies size (and CRC32 when enabled)
/// against the sender's sidecar and writes the sidecar next to the new
/// file.
pub(crate) fn swap_files(
    ctx: &JobCtx<'_>,
    mode: SwapMode,
    file_send: Option<&Path>,
    rank_send: Option<usize>,
    file_recv: Option<&Path>,
    rank_recv: Option<usize>,
    comm: &dyn Comm,
) -> Result<()> {
    let have_outgoing = rank_send.is_some() && file_send.is_some();
    let have_incoming = rank_recv.is_some() && file_recv.is_some();
    let buf_size = ctx.params.mpi_buf_size.max(1);
    let crc = ctx.params.crc_on_copy;

    // Any stale completion marker for the incoming file is now a lie.
    if let Some(file) = file_recv.filter(|_| have_incoming) {
        Meta::unlink(file);
    }

    // Hold the outgoing sidecar back until the transfer ends; the CRC may
    // be filled in along the way.
    let mut meta_send = match file_send.filter(|_| have_outgoing) {
        Some(file) => Some(Meta::read(file)?),
        None => None,
    };

    let mut crc_send = crc32fast::Hasher::new();
    let mut crc_recv = crc32fast::Hasher::new();
    let mut send_buf = vec![0u8; buf_size];

    match mode {
        SwapMode::Copy => {
            let mut fd_send = match file_send.filter(|_| have_outgoing) {
                Some(f) => Some(File::open(f)?),
                None => None,
            };
            let mut fd_recv = match file_recv.filter(|_| have_incoming) {
                Some(f) => Some(File::create(f)?),
                None => None,
            };

            let mut sending = have_outgoing;
            let mut receiving = have_incoming;
            while sending || receiving {
                if sending {
                    let n = fd_send.as_mut().unwrap().read(&mut send_buf)?;
                    if crc && n > 0 {
                        crc_send.update(&send_buf[..n]);
                    }
                    comm.send(rank_send.unwrap(), &send_buf[..n])?;
                    if n < buf_size {
                        sending = false;
                    }
                }
                if receiving {
                    let chunk = comm.recv(rank_recv.unwrap())?;
                    if crc && !chunk.is_empty() {
                        crc_recv.update(&chunk);
                    }
                    fd_recv.as_mut().unwrap().write_all(&chunk)?;
                    if chunk.len() < buf_size {
                        receiving = false;
                    }
                }
            }

            if let Some(f) = fd_recv {
                f.sync_all()?;
            }

            // Record the CRC we just computed on the sender's sidecar so
            // later copies can verify against it.
            if crc {
                if let (Some(meta), Some(file)) = (meta_send.as_mut(), file_send) {
                    if meta.crc32.is_none() {
                        meta.crc32 = Some(crc_send.clone().finalize());
                        meta.write(file)?;
                    }
                }
            }
        }
        SwapMode::Move => {
            // One descriptor serves both directions: the incoming bytes
            // overwrite the outgoing file from the front.
            let mut fd = if have_outgoing {
                Some(
                    OpenOptions::new()
                        .read(true)
                        .write(true)
                        .open(file_send.unwrap())?,
                )
            } else if have_incoming {
                Some(File::create(file_recv.unwrap())?)
            } else {
                None
            };
            let filesize_send = file_send
                .filter(|_| have_outgoing)
                .map(fileio::filesize)
                .unwrap_or(0);

            let mut sending = have_outgoing;
            let mut receiving = have_incoming;
            let mut read_pos = 0u64;
            let mut write_pos = 0u64;
            while sending || receiving {
                if sending {
                    let count = ((filesize_send - read_pos) as usize).min(buf_size);
                    let fd = fd.as_mut().unwrap();
                    fd.seek(SeekFrom::Start(read_pos))?;
                    fd.read_exact(&mut send_buf[..count])?;
                    if crc && count > 0 {
                        crc_send.update(&send_buf[..count]);
                    }
                    read_pos += count as u64;
                    comm.send(rank_send.unwrap(), &send_buf[..count])?;
                    if read_pos == filesize_send && count < buf_size {
                        sending = false;
                    }
                }
                if receiving {
                    let chunk = comm.recv(rank_recv.unwrap())?;
                    if crc && !chunk.is_empty() {
                        crc_recv.update(&chunk);
                    }
                    let fd = fd.as_mut().unwrap();
                    fd.seek(SeekFrom::Start(write_pos))?;
                    fd.write_all(&chunk)?;
                    write_pos += chunk.len() as u64;
                    if chunk.len() < buf_size {
                        receiving = false;
                    }
                }
            }

            match (have_outgoing, have_incoming) {
                (true, true) => {
                    // The artifact was consumed; shape what remains into
                    // the incoming file.
                    let fd = fd.take().unwrap();
                    fd.set_len(write_pos)?;
                    fd.sync_all()?;
                    drop(fd);
                    std::fs::rename(file_send.unwrap(), file_recv.unwrap())?;
                    Meta::unlink(file_send.unwrap());
                }
                (true, false) => {
                    drop(fd.take());
                    std::fs::remove_file(file_send.unwrap())?;
                    Meta::unlink(file_send.unwrap());
                }
                (false, true) => {
                    let fd = fd.take().unwrap();
                    fd.sync_all()?;
                }
                (false, false) => {}
            }

            if crc {
                if let Some(meta) = meta_send.as_mut() {
                    if meta.crc32.is_none() {
                        // The file itself is gone; the value rides along in
                        // the sidecar exchange below.
                        meta.crc32 = Some(crc_send.clone().finalize());
                    }
                }
            }
        }
    }

    // Exchange sidecars so the receiver can validate and persist one.
    if let (Some(rank), Some(meta)) = (rank_send, meta_send.as_ref()) {
        meta.to_kvtree().send(comm, rank)?;
    }
    if let (Some(rank), Some(file)) = (rank_recv, file_recv) {
        let tree = Kvtree::recv(comm, rank)?;
        let mut meta_recv = Meta::from_kvtree(&tree).ok_or_else(|| Error::Comm(
            "partner sent malformed sidecar".into(),
        ))?;

        let mut ok = true;
        let wrote = fileio::filesize(file);
        if wrote != meta_recv.filesize {
            tracing::warn!(
                file = %file.display(),
                wrote,
                expected = meta_recv.filesize,
                "received file has wrong size"
            );
            meta_recv.complete = false;
            ok = false;
        }
        if crc {
            if let Some(expected) = meta_recv.crc32 {
                let got = crc_recv.finalize();
                if got != expected {
                    tracing::warn!(file = %file.display(), "crc mismatch on received file");
                    meta_recv.complete = false;
                    ok = false;
                }
            }
        }
        meta_recv.write(file)?;
        if !ok {
            return Err(Error::Integrity {
                path: file.to_owned(),
                reason: "received file failed validation".into(),
            });
        }
    }
    Ok(())
}

/// Apply PARTNER redundancy for `checkpoint_id`: record what the left
/// partner will send, then stream our files to the right partner while
/// receiving the left partner's copies into our cache directory.
pub(crate) fn copy_partner(
    ctx: &JobCtx<'_>,
    map: &mut FileMap,
    desc: &Descriptor,
    checkpoint_id: u64,
) -> Result<()> {
    let comm = desc.comm.as_ref();
    let files = map.files(checkpoint_id, ctx.my_rank_world);

    // How many files will flow each way.
    let send_count = files.len() as i64;
    let reply = comm.sendrecv(desc.rhs_rank, &send_count.to_le_bytes(), desc.lhs_rank)?;
    let recv_count = crate::comm::decode_i64(&reply)? as usize;

    map.set_expected(checkpoint_id, desc.lhs_world, recv_count);
    map.set_tag(checkpoint_id, desc.lhs_world, TAG_PARTNER, &desc.lhs_host);

    // Hold our partner's descriptor so a restart can rebuild its topology
    // from our cache alone.
    let lhs_desc = desc
        .to_kvtree()
        .sendrecv(comm, desc.rhs_rank, desc.lhs_rank)?;
    map.set_desc(checkpoint_id, desc.lhs_world, lhs_desc);
    map.write(ctx.map_file)?;

    let ckpt_dir = desc.checkpoint_dir(checkpoint_id);

    let mut send_left = files.len();
    let mut recv_left = recv_count;
    while send_left > 0 || recv_left > 0 {
        let file = if send_left > 0 {
            let f = &files[files.len() - send_left];
            send_left -= 1;
            Some(f.as_path())
        } else {
            None
        };
        let rank_send = file.map(|_| desc.rhs_rank);
        let rank_recv = if recv_left > 0 {
            recv_left -= 1;
            Some(desc.lhs_rank)
        } else {
            None
        };

        let file_partner = swap_file_names(comm, file, rank_send, rank_recv, &ckpt_dir)?;
        if let Some(partner_file) = file_partner.as_deref() {
            map.add_file(checkpoint_id, desc.lhs_world, partner_file);
            map.write(ctx.map_file)?;
        }

        swap_files(
            ctx,
            SwapMode::Copy,
            file,
            rank_send,
            file_partner.as_deref(),
            rank_recv,
            comm,
        )?;
    }
    Ok(())
}
