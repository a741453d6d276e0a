//! Per-node manifest of cached checkpoint files.
//!
//! The filemap records, for every (checkpoint, rank) pair this node holds
//! data for: the set of cached file paths, the number of files the pair is
//! expected to have, free-form tags (e.g. which host holds the partner
//! copy), and the owning rank's checkpoint descriptor. Every mutation is
//! persisted before the file it describes is created and after the file it
//! described is removed, so a crash leaves at worst a stale entry that the
//! usable-file check rejects on restart.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::kvtree::Kvtree;

const KEY_CKPT: &str = "CKPT";
const KEY_RANK: &str = "RANK";
const KEY_FILES: &str = "FILES";
const KEY_FILE: &str = "FILE";
const KEY_TAG: &str = "TAG";
const KEY_DESC: &str = "DESC";

/// Tag naming the host that holds this rank's partner copy.
pub const TAG_PARTNER: &str = "PARTNER";

/// Per-node manifest mapping (checkpoint, rank) to cached files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileMap {
    tree: Kvtree,
}

impl FileMap {
    /// An empty map.
    pub fn new() -> FileMap {
        FileMap::default()
    }

    /// Read a map from `path`; missing file reads as empty.
    pub fn read(path: &Path) -> Result<FileMap> {
        Ok(FileMap {
            tree: Kvtree::read_file(path)?,
        })
    }

    /// Atomically persist the map to `path`.
    pub fn write(&self, path: &Path) -> Result<()> {
        self.tree.write_file(path)
    }

    /// View the map as a tree (for exchange with other ranks).
    pub fn as_kvtree(&self) -> &Kvtree {
        &self.tree
    }

    /// Wrap a tree received from another rank.
    pub fn from_kvtree(tree: Kvtree) -> FileMap {
        FileMap { tree }
    }

    /// True when no checkpoints are recorded.
    pub fn is_empty(&self) -> bool {
        self.tree.get(KEY_CKPT).map_or(true, |t| t.is_empty())
    }

    fn rank_entry(&self, ckpt: u64, rank: usize) -> Option<&Kvtree> {
        self.tree
            .get_kv_int(KEY_CKPT, ckpt)?
            .get_kv_int(KEY_RANK, rank as u64)
    }

    fn rank_entry_mut(&mut self, ckpt: u64, rank: usize) -> &mut Kvtree {
        self.tree
            .set_kv_int(KEY_CKPT, ckpt)
            .set_kv_int(KEY_RANK, rank as u64)
    }

    /// Record `file` for (`ckpt`, `rank`). Idempotent.
    pub fn add_file(&mut self, ckpt: u64, rank: usize, file: &Path) {
        self.rank_entry_mut(ckpt, rank)
            .set_kv(KEY_FILE, &file.to_string_lossy());
    }

    /// Drop `file` from (`ckpt`, `rank`).
    pub fn remove_file(&mut self, ckpt: u64, rank: usize, file: &Path) {
        let entry = self.rank_entry_mut(ckpt, rank);
        entry.unset_kv(KEY_FILE, &file.to_string_lossy());
    }

    /// Files recorded for (`ckpt`, `rank`) in deterministic order.
    pub fn files(&self, ckpt: u64, rank: usize) -> Vec<PathBuf> {
        self.rank_entry(ckpt, rank)
            .and_then(|e| e.get(KEY_FILE))
            .map(|t| t.keys().map(PathBuf::from).collect())
            .unwrap_or_default()
    }

    /// Number of files recorded for (`ckpt`, `rank`).
    pub fn num_files(&self, ckpt: u64, rank: usize) -> usize {
        self.rank_entry(ckpt, rank)
            .and_then(|e| e.get(KEY_FILE))
            .map_or(0, |t| t.len())
    }

    /// Declare how many files (`ckpt`, `rank`) must hold to be complete.
    pub fn set_expected(&mut self, ckpt: u64, rank: usize, count: usize) {
        self.rank_entry_mut(ckpt, rank)
            .set_u64(KEY_FILES, count as u64);
    }

    /// Expected file count for (`ckpt`, `rank`), if declared.
    pub fn expected(&self, ckpt: u64, rank: usize) -> Option<usize> {
        self.rank_entry(ckpt, rank)?
            .get_u64(KEY_FILES)
            .map(|v| v as usize)
    }

    /// Attach a named tag to (`ckpt`, `rank`).
    pub fn set_tag(&mut self, ckpt: u64, rank: usize, name: &str, value: &str) {
        self.rank_entry_mut(ckpt, rank)
            .entry(KEY_TAG)
            .set_val(name, value);
    }

    /// Read a named tag from (`ckpt`, `rank`).
    pub fn tag(&self, ckpt: u64, rank: usize, name: &str) -> Option<&str> {
        self.rank_entry(ckpt, rank)?.get(KEY_TAG)?.get_val(name)
    }

    /// Store the owning rank's checkpoint descriptor.
    pub fn set_desc(&mut self, ckpt: u64, rank: usize, desc: Kvtree) {
        self.rank_entry_mut(ckpt, rank).set(KEY_DESC, desc);
    }

    /// The stored checkpoint descriptor, if any.
    pub fn desc(&self, ckpt: u64, rank: usize) -> Option<&Kvtree> {
        self.rank_entry(ckpt, rank)?
            .get(KEY_DESC)
            .filter(|t| !t.is_empty())
    }

    /// Checkpoint ids recorded in the map, ascending.
    pub fn checkpoints(&self) -> Vec<u64> {
        self.tree
            .get(KEY_CKPT)
            .map(|t| t.keys().filter_map(|k| k.parse().ok()).collect())
            .unwrap_or_default()
    }

    /// Newest checkpoint id in the map.
    pub fn latest_checkpoint(&self) -> Option<u64> {
        self.checkpoints().into_iter().max()
    }

    /// Oldest checkpoint id in the map.
    pub fn oldest_checkpoint(&self) -> Option<u64> {
        self.checkpoints().into_iter().min()
    }

    /// Number of checkpoints in the map.
    pub fn num_checkpoints(&self) -> usize {
        self.tree.get(KEY_CKPT).map_or(0, |t| t.len())
    }

    /// Ranks recorded for `ckpt`, ascending.
    pub fn ranks_by_checkpoint(&self, ckpt: u64) -> Vec<usize> {
        self.tree
            .get_kv_int(KEY_CKPT, ckpt)
            .and_then(|t| t.get(KEY_RANK))
            .map(|t| t.keys().filter_map(|k| k.parse().ok()).collect())
            .unwrap_or_default()
    }

    /// All ranks recorded anywhere in the map, ascending and deduplicated.
    pub fn ranks(&self) -> Vec<usize> {
        let mut set = BTreeSet::new();
        for ckpt in self.checkpoints() {
            set.extend(self.ranks_by_checkpoint(ckpt));
        }
        set.into_iter().collect()
    }

    /// True when any checkpoint records data for `rank`.
    pub fn have_rank(&self, rank: usize) -> bool {
        self.checkpoints()
            .iter()
            .any(|&c| self.have_rank_by_checkpoint(c, rank))
    }

    /// True when (`ckpt`, `rank`) exists in the map.
    pub fn have_rank_by_checkpoint(&self, ckpt: u64, rank: usize) -> bool {
        self.rank_entry(ckpt, rank).is_some()
    }

    /// Remove everything recorded for (`ckpt`, `rank`).
    pub fn remove_rank_by_checkpoint(&mut self, ckpt: u64, rank: usize) {
        if let Some(ckpt_tree) = self.tree.get_mut(KEY_CKPT).and_then(|t| t.get_mut(&ckpt.to_string())) {
            ckpt_tree.unset_kv(KEY_RANK, &rank.to_string());
        }
        self.prune(ckpt);
    }

    /// Remove a whole checkpoint.
    pub fn remove_checkpoint(&mut self, ckpt: u64) {
        self.tree.unset_kv(KEY_CKPT, &ckpt.to_string());
    }

    /// Move all data for `rank` (every checkpoint) out into a new map.
    pub fn extract_rank(&mut self, rank: usize) -> FileMap {
        let mut out = FileMap::new();
        for ckpt in self.checkpoints() {
            if let Some(entry) = self.rank_entry(ckpt, rank) {
                let entry = entry.clone();
                *out.rank_entry_mut(ckpt, rank) = entry;
                self.remove_rank_by_checkpoint(ckpt, rank);
            }
        }
        out
    }

    /// Fold `other` into this map.
    pub fn merge(&mut self, other: &FileMap) {
        self.tree.merge(&other.tree);
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.tree.clear();
    }

    fn prune(&mut self, ckpt: u64) {
        let empty = self
            .tree
            .get_kv_int(KEY_CKPT, ckpt)
            .map_or(false, |t| t.get(KEY_RANK).map_or(true, |r| r.is_empty()));
        if empty {
            self.remove_checkpoint(ckpt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_list_remove_files() {
        let mut map = FileMap::new();
        map.add_file(1, 0, Path::new("/cache/ckpt.1/a.dat"));
        map.add_file(1, 0, Path::new("/cache/ckpt.1/b.dat"));
        map.add_file(1, 0, Path::new("/cache/ckpt.1/a.dat"));

        assert_eq!(map.num_files(1, 0), 2);
        assert_eq!(
            map.files(1, 0),
            vec![
                PathBuf::from("/cache/ckpt.1/a.dat"),
                PathBuf::from("/cache/ckpt.1/b.dat")
            ]
        );

        map.remove_file(1, 0, Path::new("/cache/ckpt.1/a.dat"));
        assert_eq!(map.num_files(1, 0), 1);
    }

    #[test]
    fn expected_count_and_tags() {
        let mut map = FileMap::new();
        map.set_expected(2, 3, 4);
        map.set_tag(2, 3, TAG_PARTNER, "node7");
        assert_eq!(map.expected(2, 3), Some(4));
        assert_eq!(map.expected(2, 1), None);
        assert_eq!(map.tag(2, 3, TAG_PARTNER), Some("node7"));
    }

    #[test]
    fn checkpoint_ordering() {
        let mut map = FileMap::new();
        for id in [7u64, 2, 11] {
            map.add_file(id, 0, Path::new("/f"));
        }
        assert_eq!(map.checkpoints(), vec![2, 7, 11]);
        assert_eq!(map.latest_checkpoint(), Some(11));
        assert_eq!(map.oldest_checkpoint(), Some(2));
    }

    #[test]
    fn extract_rank_moves_all_checkpoints() {
        let mut map = FileMap::new();
        map.add_file(1, 0, Path::new("/a"));
        map.add_file(1, 5, Path::new("/b"));
        map.add_file(2, 5, Path::new("/c"));

        let extracted = map.extract_rank(5);
        assert_eq!(extracted.files(1, 5), vec![PathBuf::from("/b")]);
        assert_eq!(extracted.files(2, 5), vec![PathBuf::from("/c")]);
        assert!(!map.have_rank(5));
        assert!(map.have_rank(0));
        // Checkpoint 2 only held rank 5, so it is gone from the source.
        assert_eq!(map.checkpoints(), vec![1]);
    }

    #[test]
    fn merge_unions_ranks() {
        let mut a = FileMap::new();
        a.add_file(1, 0, Path::new("/a"));
        let mut b = FileMap::new();
        b.add_file(1, 1, Path::new("/b"));
        a.merge(&b);
        assert_eq!(a.ranks_by_checkpoint(1), vec![0, 1]);
    }

    #[test]
    fn persist_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filemap_0.scrinfo");
        let mut map = FileMap::new();
        map.add_file(3, 1, Path::new("/cache/x"));
        map.set_expected(3, 1, 1);
        map.set_desc(3, 1, {
            let mut d = Kvtree::new();
            d.set_val("TYPE", "XOR");
            d
        });
        map.write(&path).unwrap();

        let back = FileMap::read(&path).unwrap();
        assert_eq!(back, map);
        assert_eq!(back.desc(3, 1).unwrap().get_val("TYPE"), Some("XOR"));
    }
}
