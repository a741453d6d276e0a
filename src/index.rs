//! The index file: a catalog of checkpoint directories on the parallel
//! file system, kept at the prefix root.
//!
//! Each entry records when a directory was flushed or fetched, whether a
//! fetch from it failed, and whether the checkpoint it holds is complete.
//! Restart walks this catalog newest-first, skipping entries marked failed.

use std::path::{Path, PathBuf};

use chrono::Local;

use crate::error::Result;
use crate::kvtree::Kvtree;

/// Name of the index file under the prefix directory.
pub const INDEX_FILE: &str = "index.scr";

const KEY_CKPT: &str = "CKPT";
const KEY_DIR: &str = "DIR";
const KEY_FLUSHED: &str = "FLUSHED";
const KEY_FETCHED: &str = "FETCHED";
const KEY_FAILED: &str = "FAILED";
const KEY_COMPLETE: &str = "COMPLETE";

/// Catalog of flushed checkpoint directories.
#[derive(Debug, Clone, Default)]
pub struct Index {
    tree: Kvtree,
}

impl Index {
    /// Read the index under `prefix`; missing file reads as empty.
    pub fn read(prefix: &Path) -> Result<Index> {
        Ok(Index {
            tree: Kvtree::read_file(&prefix.join(INDEX_FILE))?,
        })
    }

    /// Atomically persist the index under `prefix`.
    pub fn write(&self, prefix: &Path) -> Result<()> {
        self.tree.write_file(&prefix.join(INDEX_FILE))
    }

    fn entry(&mut self, checkpoint_id: u64, subdir: &str) -> &mut Kvtree {
        self.tree
            .set_kv_int(KEY_CKPT, checkpoint_id)
            .set_kv(KEY_DIR, subdir)
    }

    /// Record a new checkpoint directory.
    pub fn add_dir(&mut self, checkpoint_id: u64, subdir: &str) {
        self.entry(checkpoint_id, subdir);
    }

    /// Stamp the directory as flushed now.
    pub fn mark_flushed(&mut self, checkpoint_id: u64, subdir: &str) {
        let now = timestamp();
        self.entry(checkpoint_id, subdir).set_val(KEY_FLUSHED, &now);
    }

    /// Stamp the directory as fetched now.
    pub fn mark_fetched(&mut self, checkpoint_id: u64, subdir: &str) {
        let now = timestamp();
        self.entry(checkpoint_id, subdir).set_val(KEY_FETCHED, &now);
    }

    /// Record that a fetch from the directory failed; restart skips it.
    pub fn mark_failed(&mut self, checkpoint_id: u64, subdir: &str) {
        self.entry(checkpoint_id, subdir).set_u64(KEY_FAILED, 1);
    }

    /// Record whether the checkpoint in the directory is complete.
    pub fn set_complete(&mut self, checkpoint_id: u64, subdir: &str, complete: bool) {
        self.entry(checkpoint_id, subdir)
            .set_u64(KEY_COMPLETE, complete as u64);
    }

    /// Checkpoint id a directory belongs to.
    pub fn checkpoint_id_by_dir(&self, subdir: &str) -> Option<u64> {
        let ckpts = self.tree.get(KEY_CKPT)?;
        for (id, entry) in ckpts.iter() {
            if entry.get_kv(KEY_DIR, subdir).is_some() {
                return id.parse().ok();
            }
        }
        None
    }

    /// Newest complete, non-failed checkpoint directory older than
    /// `older_than` (or any, when `None`). Returns (id, subdir).
    pub fn most_recent_complete(&self, older_than: Option<u64>) -> Option<(u64, String)> {
        let ckpts = self.tree.get(KEY_CKPT)?;
        let mut ids: Vec<u64> = ckpts.keys().filter_map(|k| k.parse().ok()).collect();
        ids.sort_unstable();
        for id in ids.into_iter().rev() {
            if let Some(limit) = older_than {
                if id >= limit {
                    continue;
                }
            }
            let entry = ckpts.get(&id.to_string())?;
            if let Some(dirs) = entry.get(KEY_DIR) {
                for (name, dir) in dirs.iter() {
                    let complete = dir.get_u64(KEY_COMPLETE) == Some(1);
                    let failed = dir.get_u64(KEY_FAILED) == Some(1);
                    if complete && !failed {
                        return Some((id, name.to_owned()));
                    }
                }
            }
        }
        None
    }
}

/// Path of the index file under `prefix`.
pub fn index_path(prefix: &Path) -> PathBuf {
    prefix.join(INDEX_FILE)
}

fn timestamp() -> String {
    Local::now().format("%Y-%m-%d_%H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = Index::read(dir.path()).unwrap();
        index.add_dir(4, "scr.ts.job.4");
        index.mark_flushed(4, "scr.ts.job.4");
        index.set_complete(4, "scr.ts.job.4", true);
        index.write(dir.path()).unwrap();

        let back = Index::read(dir.path()).unwrap();
        assert_eq!(back.checkpoint_id_by_dir("scr.ts.job.4"), Some(4));
        assert_eq!(
            back.most_recent_complete(None),
            Some((4, "scr.ts.job.4".to_string()))
        );
    }

    #[test]
    fn failed_dirs_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = Index::read(dir.path()).unwrap();
        index.set_complete(2, "old", true);
        index.set_complete(6, "new", true);
        index.mark_failed(6, "new");
        index.write(dir.path()).unwrap();

        let back = Index::read(dir.path()).unwrap();
        assert_eq!(back.most_recent_complete(None), Some((2, "old".to_string())));
    }

    #[test]
    fn older_than_walks_backwards() {
        let mut index = Index::default();
        index.set_complete(2, "a", true);
        index.set_complete(6, "b", true);
        assert_eq!(index.most_recent_complete(None), Some((6, "b".into())));
        assert_eq!(index.most_recent_complete(Some(6)), Some((2, "a".into())));
        assert_eq!(index.most_recent_complete(Some(2)), None);
    }

    #[test]
    fn incomplete_dirs_are_not_candidates() {
        let mut index = Index::default();
        index.set_complete(3, "c", false);
        assert_eq!(index.most_recent_complete(None), None);
    }
}
