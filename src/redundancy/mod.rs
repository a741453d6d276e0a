//! Redundancy encoders: protect a freshly written checkpoint according to
//! its descriptor's scheme before the application resumes computing.

pub(crate) mod partner;
pub(crate) mod rebuild;
pub(crate) mod xor;

use std::time::Instant;

use crate::comm::ReduceOp;
use crate::descriptor::{CopyType, Descriptor};
use crate::engine::JobCtx;
use crate::error::{Error, Result};
use crate::fileio;
use crate::filemap::FileMap;
use crate::meta;

/// Apply the descriptor's redundancy scheme to `checkpoint_id` and record
/// the expected file count. Collective; fails everywhere if any process
/// holds an invalid file or any group fails to encode. Returns the total
/// bytes protected across the job.
pub(crate) fn copy_files(
    ctx: &JobCtx<'_>,
    map: &mut FileMap,
    desc: &Descriptor,
    checkpoint_id: u64,
) -> Result<u64> {
    // Preflight: every local file must already be present and usable, and
    // CRCs are computed up front for schemes that do not fold the
    // computation into their copy loop.
    let mut valid = true;
    let mut my_bytes = 0u64;
    for file in map.files(checkpoint_id, ctx.my_rank_world) {
        if !meta::have_file(&file, checkpoint_id, ctx.my_rank_world, ctx.ranks_world) {
            tracing::debug!(file = %file.display(), "file determined to be invalid");
            valid = false;
        }
        my_bytes += fileio::filesize(&file);
        if ctx.params.crc_on_copy && desc.copy_type != CopyType::Partner {
            fileio::compute_crc(&file)?;
        }
    }

    if !ctx.world.alltrue(valid)? {
        if ctx.my_rank_world == 0 {
            tracing::info!(
                ckpt = checkpoint_id,
                "skipping redundancy, one or more checkpoint files is invalid"
            );
        }
        return Err(Error::CollectiveFailed("redundancy preflight"));
    }

    let start = Instant::now();

    let rc = match desc.copy_type {
        CopyType::Local => Ok(()),
        CopyType::Partner => partner::copy_partner(ctx, map, desc, checkpoint_id),
        CopyType::Xor => xor::copy_xor(ctx, map, desc, checkpoint_id),
    };

    // A rank that wrote zero files still needs its count on record, or a
    // restart cannot tell "nothing written" from "everything lost".
    let num_files = map.num_files(checkpoint_id, ctx.my_rank_world);
    map.set_expected(checkpoint_id, ctx.my_rank_world, num_files);
    map.write(ctx.map_file)?;

    if let Err(e) = &rc {
        tracing::error!(ckpt = checkpoint_id, error = %e, "redundancy encode failed");
    }
    if !ctx.world.alltrue(rc.is_ok())? {
        return rc.and(Err(Error::CollectiveFailed("redundancy encode")));
    }

    let total = ctx.world.allreduce_i64(my_bytes as i64, ReduceOp::Sum)? as u64;
    if ctx.my_rank_world == 0 {
        let secs = start.elapsed().as_secs_f64();
        let mbs = total as f64 / (1024.0 * 1024.0 * secs.max(1e-9));
        tracing::info!(
            ckpt = checkpoint_id,
            scheme = desc.copy_type.as_str(),
            bytes = total,
            secs,
            mbs,
            "applied redundancy"
        );
    }
    Ok(total)
}
