//! Restart distribution: after a node-set reshuffle, put every rank's
//! cached files back in the hands of the process that now owns that rank.
//!
//! Works in two stages. First the node master gathers all filemaps left on
//! its node and deals them out to local peers (own data to its owner when
//! the owner landed here, the rest round-robined). Then a global pairwise
//! exchange runs in rounds: every process announces which ranks' files it
//! holds and in which round it could send them, each process picks the
//! earliest offer for its own files, and files move (or rename in place)
//! with at most one partner per process per round.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::cache;
use crate::comm::ReduceOp;
use crate::descriptor::Descriptor;
use crate::engine::JobCtx;
use crate::error::{Error, Result};
use crate::filemap::FileMap;
use crate::kvtree::Kvtree;
use crate::meta::Meta;
use crate::redundancy::partner::{swap_file_names, swap_files, SwapMode};

const KEY_FILEMAP: &str = "Filemap";

/// Per-local-rank filemap file under the control directory.
pub(crate) fn filemap_path(cntl_prefix: &Path, local_rank: usize) -> PathBuf {
    cntl_prefix.join(format!("filemap_{}.scrinfo", local_rank))
}

/// Master index naming every filemap file on this node.
pub(crate) fn master_filemap_path(cntl_prefix: &Path) -> PathBuf {
    cntl_prefix.join("filemap.scrinfo")
}

/// Write the master index for `ranks_local` per-rank filemap files.
pub(crate) fn write_master_index(cntl_prefix: &Path, ranks_local: usize) -> Result<()> {
    let mut tree = Kvtree::new();
    for i in 0..ranks_local {
        tree.set_kv(KEY_FILEMAP, &filemap_path(cntl_prefix, i).to_string_lossy());
    }
    tree.write_file(&master_filemap_path(cntl_prefix))
}

/// Node master reads every filemap named in the master index, merges them,
/// and deals the result out across the node: each local rank first gets its
/// own data, then the remaining ranks' data round-robin. Every process ends
/// by persisting its share to its own filemap file.
pub(crate) fn scatter_filemaps(ctx: &JobCtx<'_>, map: &mut FileMap) -> Result<()> {
    let mut send: BTreeMap<usize, Kvtree> = BTreeMap::new();

    let world_rank_bytes = (ctx.my_rank_world as u64).to_le_bytes();
    let gathered = ctx.local.gather(0, &world_rank_bytes)?;

    if ctx.my_rank_local == 0 {
        let mut all = FileMap::new();
        let master = Kvtree::read_file(ctx.master_map_file)?;
        if let Some(list) = master.get(KEY_FILEMAP) {
            for file in list.keys() {
                let path = Path::new(file);
                match FileMap::read(path) {
                    Ok(m) => all.merge(&m),
                    Err(e) => {
                        tracing::warn!(file, error = %e, "skipping unreadable filemap");
                    }
                }
                let _ = std::fs::remove_file(path);
            }
        }

        if !all.is_empty() {
            all.write(ctx.map_file)?;
        }

        // World rank of each process on this node, indexed by local rank.
        let locals: Vec<usize> = gathered
            .expect("gather root receives all")
            .iter()
            .map(|b| u64::from_le_bytes(b.as_slice().try_into().unwrap()) as usize)
            .collect();

        // Owners first: a process that landed on the node holding its own
        // files gets them directly.
        for (i, &world_rank) in locals.iter().enumerate() {
            if all.have_rank(world_rank) {
                let extracted = all.extract_rank(world_rank);
                send.entry(i).or_default().merge(extracted.as_kvtree());
            }
        }

        // Deal out whatever is left so the coming exchange load-balances.
        for (j, rank) in all.ranks().into_iter().enumerate() {
            let i = j % ctx.ranks_local;
            let extracted = all.extract_rank(rank);
            send.entry(i).or_default().merge(extracted.as_kvtree());
        }

        write_master_index(ctx.cntl_prefix, ctx.ranks_local)?;
    }

    let received = Kvtree::exchange(&send, ctx.local)?;
    if let Some(tree) = received.get(&0) {
        map.merge(&FileMap::from_kvtree(tree.clone()));
    }

    if !map.is_empty() {
        map.write(ctx.map_file)?;
    }
    Ok(())
}

/// Recover this process's checkpoint descriptor for `checkpoint_id` from
/// whichever process's filemap still holds it, and rebuild its topology.
pub(crate) fn distribute_descriptors(
    ctx: &JobCtx<'_>,
    map: &mut FileMap,
    checkpoint_id: u64,
) -> Result<Descriptor> {
    let ranks = map.ranks_by_checkpoint(checkpoint_id);

    let invalid = ranks.iter().any(|&r| r >= ctx.ranks_world);
    if !ctx.world.alltrue(!invalid)? {
        return Err(Error::CollectiveFailed("descriptor distribution"));
    }

    let mut send: BTreeMap<usize, Kvtree> = BTreeMap::new();
    for rank in ranks {
        if let Some(desc) = map.desc(checkpoint_id, rank) {
            send.insert(rank, desc.clone());
        }
    }

    let received = Kvtree::exchange(&send, ctx.world)?;
    if !ctx.world.alltrue(!received.is_empty())? {
        tracing::debug!(
            ckpt = checkpoint_id,
            "cannot find a process that has my checkpoint descriptor"
        );
        return Err(Error::CollectiveFailed("descriptor distribution"));
    }

    // Any copy will do; they all describe the same descriptor.
    let desc_tree = received.into_values().next().expect("nonempty checked");
    map.set_desc(checkpoint_id, ctx.my_rank_world, desc_tree.clone());
    map.write(ctx.map_file)?;

    Descriptor::create_from_kvtree(&desc_tree, &ctx.topology())
}

/// Delete the cached files recorded for (`checkpoint_id`, `rank`) along
/// with their sidecars and the filemap entry.
fn unlink_rank(ctx: &JobCtx<'_>, map: &mut FileMap, checkpoint_id: u64, rank: usize) -> Result<()> {
    let files = map.files(checkpoint_id, rank);
    if !files.is_empty() {
        tracing::debug!(ckpt = checkpoint_id, rank, "dropping unclaimed files");
    }
    for file in files {
        let _ = std::fs::remove_file(&file);
        Meta::unlink(&file);
    }
    map.remove_rank_by_checkpoint(checkpoint_id, rank);
    map.write(ctx.map_file)?;
    Ok(())
}

/// Move every cached file of `checkpoint_id` to the process that owns its
/// rank, in a collision-free round schedule. Files whose owner never asks
/// are deleted. Transfer completion does not imply every process got its
/// files; the rebuild that follows decides that.
pub(crate) fn distribute_files(
    ctx: &JobCtx<'_>,
    map: &mut FileMap,
    desc: &Descriptor,
    checkpoint_id: u64,
) -> Result<()> {
    use crate::descriptor::CopyType;

    cache::clean_files(ctx, map)?;

    let ranks = map.ranks_by_checkpoint(checkpoint_id);
    let nranks = ranks.len();

    let invalid = ranks.iter().any(|&r| r >= ctx.ranks_world);
    if !ctx.world.alltrue(!invalid)? {
        return Err(Error::CollectiveFailed("file distribution"));
    }

    // Rotate the rank list so the first rank >= ours comes first; spreading
    // the round ids this way keeps simultaneous shuffles off one hotspot.
    let start_index = ranks
        .iter()
        .position(|&r| r >= ctx.my_rank_world)
        .unwrap_or(0);
    let have_rank_by_round: Vec<usize> = (0..nranks)
        .map(|round| ranks[(start_index + round) % nranks])
        .collect();
    let mut send_flag_by_round = vec![false; nranks];

    // Announce which round we could send each rank's files in.
    let mut offers: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
    for (round, &rank) in have_rank_by_round.iter().enumerate() {
        if cache::have_files(ctx, map, checkpoint_id, rank) {
            offers.insert(rank, (round as u64).to_le_bytes().to_vec());
        }
    }
    let incoming = ctx.world.exchange(offers)?;

    // Choose the earliest offer for our own files.
    let mut retrieve: Option<(usize, u64)> = None;
    for (src, payload) in &incoming {
        let round = u64::from_le_bytes(
            payload
                .as_slice()
                .try_into()
                .map_err(|_| Error::Comm("bad distribution offer".into()))?,
        );
        if retrieve.map_or(true, |(_, best)| round < best) {
            retrieve = Some((*src, round));
        }
    }

    // Schemes without parity know right now whether recovery is possible.
    let can_get_files = retrieve.is_some();
    if desc.copy_type != CopyType::Xor && !ctx.world.alltrue(can_get_files)? {
        if !can_get_files {
            tracing::debug!(
                ckpt = checkpoint_id,
                "cannot find a process that has my checkpoint files"
            );
        }
        return Err(Error::CollectiveFailed("file distribution"));
    }

    let retrieve_round = retrieve.map(|(_, r)| r as i64).unwrap_or(-1);
    let max_rounds = ctx.world.allreduce_i64(retrieve_round, ReduceOp::Max)?;

    // Tell the chosen sender which round we will claim.
    let mut claims: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
    if let Some((rank, round)) = retrieve {
        claims.insert(rank, round.to_le_bytes().to_vec());
    }
    for (_, payload) in ctx.world.exchange(claims)? {
        let round = u64::from_le_bytes(
            payload
                .as_slice()
                .try_into()
                .map_err(|_| Error::Comm("bad distribution claim".into()))?,
        ) as usize;
        if round < nranks {
            send_flag_by_round[round] = true;
        }
    }

    let ckpt_dir = desc.checkpoint_dir(checkpoint_id);

    for round in 0..=max_rounds.max(-1) {
        let round = round as usize;

        let send_rank = if round < nranks && send_flag_by_round[round] {
            Some(have_rank_by_round[round])
        } else {
            None
        };
        let recv_rank = match retrieve {
            Some((rank, r)) if r as usize == round => Some(rank),
            _ => None,
        };

        if send_rank == Some(ctx.my_rank_world) {
            // Our own files are already on this node; a rename into the new
            // checkpoint directory is all the move that is needed.
            for file in map.files(checkpoint_id, ctx.my_rank_world) {
                let name = file.file_name().map(|n| n.to_owned()).unwrap_or_default();
                let newfile = ckpt_dir.join(&name);
                if newfile == file {
                    continue;
                }
                map.add_file(checkpoint_id, ctx.my_rank_world, &newfile);
                map.write(ctx.map_file)?;
                tracing::debug!(round, from = %file.display(), to = %newfile.display(), "rename");
                std::fs::rename(&file, &newfile)?;
                std::fs::rename(Meta::path_for(&file), Meta::path_for(&newfile))?;
                map.remove_file(checkpoint_id, ctx.my_rank_world, &file);
                map.write(ctx.map_file)?;
            }
            continue;
        }

        // Files scheduled this round that nobody claimed are dead weight.
        if round < nranks && send_rank.is_none() {
            unlink_rank(ctx, map, checkpoint_id, have_rank_by_round[round])?;
        }

        if send_rank.is_none() && recv_rank.is_none() {
            continue;
        }

        // Exchange file counts with this round's partner(s).
        let dst_rank = send_rank;
        let mut send_num = match send_rank {
            Some(dst) => {
                let n = map.num_files(checkpoint_id, dst);
                ctx.world.send(dst, &(n as u64).to_le_bytes())?;
                n
            }
            None => 0,
        };
        let mut recv_num = match recv_rank {
            Some(src) => {
                let reply = ctx.world.recv(src)?;
                let n = u64::from_le_bytes(
                    reply
                        .as_slice()
                        .try_into()
                        .map_err(|_| Error::Comm("bad file count".into()))?,
                ) as usize;
                map.set_expected(checkpoint_id, ctx.my_rank_world, n);
                n
            }
            None => 0,
        };

        let mut cur_send = send_rank.filter(|_| send_num > 0);
        let mut cur_recv = recv_rank.filter(|_| recv_num > 0);

        let files = match dst_rank {
            Some(dst) => map.files(checkpoint_id, dst),
            None => Vec::new(),
        };
        let numfiles = files.len();

        while cur_send.is_some() || cur_recv.is_some() {
            let file = cur_send.map(|_| files[numfiles - send_num].clone());

            let file_partner =
                swap_file_names(ctx.world, file.as_deref(), cur_send, cur_recv, &ckpt_dir)?;
            if let Some(partner) = file_partner.as_deref() {
                map.add_file(checkpoint_id, ctx.my_rank_world, partner);
                map.write(ctx.map_file)?;
            }

            swap_files(
                ctx,
                SwapMode::Move,
                file.as_deref(),
                cur_send,
                file_partner.as_deref(),
                cur_recv,
                ctx.world,
            )?;

            if let (Some(dst), Some(f)) = (dst_rank, file.as_deref()) {
                map.remove_file(checkpoint_id, dst, f);
                map.write(ctx.map_file)?;
            }

            if cur_recv.is_some() {
                recv_num -= 1;
                if recv_num == 0 {
                    cur_recv = None;
                }
            }
            if cur_send.is_some() {
                send_num -= 1;
                if send_num == 0 {
                    cur_send = None;
                }
            }
        }

        // Everything for that rank has left this node.
        if let Some(dst) = dst_rank {
            map.remove_rank_by_checkpoint(checkpoint_id, dst);
            map.write(ctx.map_file)?;
        }
    }

    // Rounds past the last claim hold files nobody will ever ask for.
    let first_unclaimed = (max_rounds + 1).max(0) as usize;
    for round in first_unclaimed..nranks {
        unlink_rank(ctx, map, checkpoint_id, have_rank_by_round[round])?;
    }

    // The unclaimed-rank cleanup may have taken our own descriptor record
    // with it (a rank with nothing to offer never claims its own round).
    // Every (checkpoint, rank) entry carries its descriptor, so put it
    // back; the rebuild that follows relies on the files, but the next
    // restart relies on this record.
    if map.desc(checkpoint_id, ctx.my_rank_world).is_none() {
        map.set_desc(checkpoint_id, ctx.my_rank_world, desc.to_kvtree());
    }

    map.write(ctx.map_file)?;
    cache::clean_files(ctx, map)?;
    Ok(())
}
