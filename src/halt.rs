//! Halt policy: decide when the job should stop taking checkpoints and
//! exit, driven by a lock-guarded halt file that operators (or the library
//! itself) can edit while the job runs.
//!
//! Conditions: an explicit exit reason, too little time left in the
//! allocation, an exhausted checkpoint budget, or exit-before/exit-after
//! deadlines. Rank 0 evaluates and broadcasts; the caller is responsible
//! for flushing before acting on a halt.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::engine::JobCtx;
use crate::error::Result;
use crate::kvtree::Kvtree;

const KEY_EXIT_REASON: &str = "ExitReason";
const KEY_SECONDS: &str = "HaltSeconds";
const KEY_CHECKPOINTS: &str = "CheckpointsLeft";
const KEY_EXIT_BEFORE: &str = "ExitBefore";
const KEY_EXIT_AFTER: &str = "ExitAfter";

/// Whether a firing condition should be recorded back to the halt file or
/// only reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HaltMode {
    /// Record the halt and expect the caller to wind the job down.
    TestAndHalt,
    /// Only report; used by need-checkpoint to apply halt pressure.
    TestOnly,
}

/// Seed the in-memory halt tree from parameters. File contents override
/// these values at the first sync.
pub(crate) fn init_tree(halt_seconds: u64) -> Kvtree {
    let mut tree = Kvtree::new();
    if halt_seconds > 0 {
        tree.set_u64(KEY_SECONDS, halt_seconds);
    }
    tree
}

/// Reconcile the in-memory halt tree with the halt file under its lock:
/// values in the file win (an operator may have edited it), the checkpoint
/// budget is decremented by `decrement`, and the merged tree is written
/// back.
pub(crate) fn sync_and_decrement(
    halt_file: &std::path::Path,
    halt: &mut Kvtree,
    decrement: u64,
) -> Result<()> {
    let (fd, from_file) = Kvtree::lock_open_read(halt_file)?;
    halt.merge(&from_file);
    for key in [
        KEY_EXIT_REASON,
        KEY_SECONDS,
        KEY_CHECKPOINTS,
        KEY_EXIT_BEFORE,
        KEY_EXIT_AFTER,
    ] {
        if let Some(value) = from_file.get_val(key) {
            let value = value.to_owned();
            halt.set_val(key, &value);
        }
    }
    if decrement > 0 {
        if let Some(left) = halt.get_u64(KEY_CHECKPOINTS) {
            halt.set_u64(KEY_CHECKPOINTS, left.saturating_sub(decrement));
        }
    }
    halt.write_unlock(halt_file, fd)?;
    Ok(())
}

/// Record `reason` as the exit reason and push it to the halt file, so a
/// subsequent run (or scavenger script) sees why the job stopped.
pub(crate) fn record_halt(
    halt_file: &std::path::Path,
    halt: &mut Kvtree,
    reason: &str,
) -> Result<()> {
    halt.set_val(KEY_EXIT_REASON, reason);
    sync_and_decrement(halt_file, halt, 0)
}

fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Evaluate every halt condition on rank 0 and broadcast the verdict. In
/// [`HaltMode::TestAndHalt`] a firing condition is recorded to the halt
/// file. Returns the halt reason when the job should stop.
pub(crate) fn check_halt(
    ctx: &JobCtx<'_>,
    halt: &mut Kvtree,
    mode: HaltMode,
    decrement: u64,
) -> Result<Option<String>> {
    let mut reason: Option<String> = None;

    if ctx.my_rank_world == 0 {
        sync_and_decrement(ctx.halt_file, halt, decrement)?;

        let halt_seconds = halt.get_u64(KEY_SECONDS).unwrap_or(0);
        let now = epoch_now();

        if halt_seconds > 0 {
            if let Some(remaining) = ctx.params.seconds_remaining {
                if remaining <= halt_seconds {
                    tracing::info!(
                        remaining,
                        halt_seconds,
                        "job exiting: reached the time limit"
                    );
                    reason = Some("TIME_LIMIT".into());
                }
            }
        }

        if reason.is_none() {
            if let Some(exit_reason) = halt.get_val(KEY_EXIT_REASON).filter(|r| !r.is_empty()) {
                tracing::info!(reason = exit_reason, "job exiting");
                reason = Some(exit_reason.to_owned());
            }
        }

        if reason.is_none() && halt.get_u64(KEY_CHECKPOINTS) == Some(0) {
            tracing::info!("job exiting: no checkpoints remaining");
            reason = Some("NO_CHECKPOINTS_LEFT".into());
        }

        if reason.is_none() {
            if let Some(before) = halt.get_u64(KEY_EXIT_BEFORE) {
                if now >= before.saturating_sub(halt_seconds) {
                    tracing::info!("job exiting: past the exit-before time");
                    reason = Some("EXIT_BEFORE_TIME".into());
                }
            }
        }

        if reason.is_none() {
            if let Some(after) = halt.get_u64(KEY_EXIT_AFTER) {
                if now >= after {
                    tracing::info!("job exiting: past the exit-after time");
                    reason = Some("EXIT_AFTER_TIME".into());
                }
            }
        }

        if mode == HaltMode::TestAndHalt {
            if let Some(r) = reason.as_deref() {
                record_halt(ctx.halt_file, halt, r)?;
            }
        }
    }

    let mut msg = reason.clone().unwrap_or_default().into_bytes();
    ctx.world.bcast(0, &mut msg)?;
    if msg.is_empty() {
        Ok(None)
    } else {
        Ok(Some(String::from_utf8_lossy(&msg).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_values_override_memory() {
        let dir = tempfile::tempdir().unwrap();
        let halt_file = dir.path().join("halt.scrinfo");

        let mut operator = Kvtree::new();
        operator.set_val(KEY_EXIT_REASON, "DRAIN_NODE");
        operator.write_file(&halt_file).unwrap();

        let mut halt = init_tree(600);
        sync_and_decrement(&halt_file, &mut halt, 0).unwrap();
        assert_eq!(halt.get_val(KEY_EXIT_REASON), Some("DRAIN_NODE"));
        assert_eq!(halt.get_u64(KEY_SECONDS), Some(600));
    }

    #[test]
    fn checkpoint_budget_decrements_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let halt_file = dir.path().join("halt.scrinfo");

        let mut halt = init_tree(0);
        halt.set_u64(KEY_CHECKPOINTS, 2);
        sync_and_decrement(&halt_file, &mut halt, 1).unwrap();
        assert_eq!(halt.get_u64(KEY_CHECKPOINTS), Some(1));
        sync_and_decrement(&halt_file, &mut halt, 1).unwrap();
        assert_eq!(halt.get_u64(KEY_CHECKPOINTS), Some(0));
        // Saturates rather than wrapping.
        sync_and_decrement(&halt_file, &mut halt, 1).unwrap();
        assert_eq!(halt.get_u64(KEY_CHECKPOINTS), Some(0));
    }

    #[test]
    fn record_halt_persists_reason() {
        let dir = tempfile::tempdir().unwrap();
        let halt_file = dir.path().join("halt.scrinfo");

        let mut halt = init_tree(0);
        record_halt(&halt_file, &mut halt, "SCR_FINALIZE_CALLED").unwrap();

        let on_disk = Kvtree::read_file(&halt_file).unwrap();
        assert_eq!(on_disk.get_val(KEY_EXIT_REASON), Some("SCR_FINALIZE_CALLED"));
    }
}
