//! Per-file metadata sidecars.
//!
//! Every cached or flushed file has a companion `<file>.scr` record holding
//! the file's identity (checkpoint id, owning rank, job width), its size, a
//! completeness flag, and an optional CRC32. A file counts as present only
//! when its sidecar exists, is marked complete, every identity field matches
//! what the runtime expects, and the measured size equals the recorded size.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::kvtree::Kvtree;

const KEY_FILE: &str = "FILE";
const KEY_TYPE: &str = "TYPE";
const KEY_SIZE: &str = "SIZE";
const KEY_CKPT: &str = "CKPT";
const KEY_RANK: &str = "RANK";
const KEY_RANKS: &str = "RANKS";
const KEY_COMPLETE: &str = "COMPLETE";
const KEY_CRC: &str = "CRC";

const TYPE_FULL: &str = "FULL";
const TYPE_XOR: &str = "XOR";

/// What a cached file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// An application checkpoint file.
    Full,
    /// A redundancy artifact produced by the XOR encoder.
    Xor,
}

impl FileKind {
    fn as_str(&self) -> &'static str {
        match self {
            FileKind::Full => TYPE_FULL,
            FileKind::Xor => TYPE_XOR,
        }
    }

    fn parse(s: &str) -> Option<FileKind> {
        match s {
            TYPE_FULL => Some(FileKind::Full),
            TYPE_XOR => Some(FileKind::Xor),
            _ => None,
        }
    }
}

/// Sidecar metadata record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    /// Base name of the described file.
    pub filename: String,
    /// Full checkpoint file or redundancy artifact.
    pub kind: FileKind,
    /// Expected size in bytes.
    pub filesize: u64,
    /// Checkpoint the file belongs to.
    pub checkpoint_id: u64,
    /// World rank that owns the file.
    pub rank: usize,
    /// Number of ranks in the job that wrote the checkpoint.
    pub ranks: usize,
    /// Whether the file was written out completely.
    pub complete: bool,
    /// CRC32 of the contents, when one has been computed.
    pub crc32: Option<u32>,
}

impl Meta {
    /// Build a record for `file`.
    pub fn new(
        file: &Path,
        kind: FileKind,
        filesize: u64,
        checkpoint_id: u64,
        rank: usize,
        ranks: usize,
        complete: bool,
    ) -> Meta {
        Meta {
            filename: file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            kind,
            filesize,
            checkpoint_id,
            rank,
            ranks,
            complete,
            crc32: None,
        }
    }

    /// Path of the sidecar for `file`.
    pub fn path_for(file: &Path) -> PathBuf {
        let mut name = file.as_os_str().to_owned();
        name.push(".scr");
        PathBuf::from(name)
    }

    /// Read the sidecar for `file`.
    pub fn read(file: &Path) -> Result<Meta> {
        let path = Meta::path_for(file);
        let tree = Kvtree::read_file(&path)?;
        Meta::from_kvtree(&tree).ok_or_else(|| Error::Corrupt {
            path,
            reason: "incomplete sidecar record".into(),
        })
    }

    /// Write the sidecar for `file`.
    pub fn write(&self, file: &Path) -> Result<()> {
        self.to_kvtree().write_file(&Meta::path_for(file))
    }

    /// Remove the sidecar for `file`, ignoring a missing one.
    pub fn unlink(file: &Path) {
        let _ = std::fs::remove_file(Meta::path_for(file));
    }

    /// Encode into a tree for persistence or exchange.
    pub fn to_kvtree(&self) -> Kvtree {
        let mut tree = Kvtree::new();
        tree.set_val(KEY_FILE, &self.filename);
        tree.set_val(KEY_TYPE, self.kind.as_str());
        tree.set_u64(KEY_SIZE, self.filesize);
        tree.set_u64(KEY_CKPT, self.checkpoint_id);
        tree.set_u64(KEY_RANK, self.rank as u64);
        tree.set_u64(KEY_RANKS, self.ranks as u64);
        tree.set_u64(KEY_COMPLETE, self.complete as u64);
        if let Some(crc) = self.crc32 {
            tree.set_u64(KEY_CRC, crc as u64);
        }
        tree
    }

    /// Decode from a tree; `None` if any required field is missing.
    pub fn from_kvtree(tree: &Kvtree) -> Option<Meta> {
        Some(Meta {
            filename: tree.get_val(KEY_FILE)?.to_owned(),
            kind: FileKind::parse(tree.get_val(KEY_TYPE)?)?,
            filesize: tree.get_u64(KEY_SIZE)?,
            checkpoint_id: tree.get_u64(KEY_CKPT)?,
            rank: tree.get_u64(KEY_RANK)? as usize,
            ranks: tree.get_u64(KEY_RANKS)? as usize,
            complete: tree.get_u64(KEY_COMPLETE)? != 0,
            crc32: tree.get_u64(KEY_CRC).map(|v| v as u32),
        })
    }
}

/// Check that `file` exists, is readable, and matches its sidecar for the
/// given identity. This is the gate every consumer runs before trusting a
/// cached file; a stale filemap entry pointing at a missing or mismatched
/// file fails here.
pub fn have_file(file: &Path, checkpoint_id: u64, rank: usize, ranks: usize) -> bool {
    let size = match std::fs::metadata(file) {
        Ok(m) if m.is_file() => m.len(),
        _ => {
            tracing::debug!(file = %file.display(), "file missing or not readable");
            return false;
        }
    };
    let meta = match Meta::read(file) {
        Ok(m) => m,
        Err(_) => {
            tracing::debug!(file = %file.display(), "sidecar missing or unreadable");
            return false;
        }
    };
    if !meta.complete {
        tracing::debug!(file = %file.display(), "file marked incomplete");
        return false;
    }
    if meta.checkpoint_id != checkpoint_id
        || meta.rank != rank
        || meta.ranks != ranks
        || meta.filesize != size
    {
        tracing::debug!(
            file = %file.display(),
            ckpt = checkpoint_id,
            rank,
            "sidecar fields do not match expectations"
        );
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(file: &Path) -> Meta {
        Meta::new(file, FileKind::Full, 11, 3, 2, 8, true)
    }

    #[test]
    fn sidecar_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("rank_2.ckpt");
        std::fs::write(&file, b"hello world").unwrap();

        let mut meta = sample(&file);
        meta.crc32 = Some(0xDEADBEEF);
        meta.write(&file).unwrap();

        let back = Meta::read(&file).unwrap();
        assert_eq!(back, meta);
        assert!(Meta::path_for(&file).exists());
    }

    #[test]
    fn have_file_accepts_matching() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("rank_2.ckpt");
        std::fs::write(&file, b"hello world").unwrap();
        sample(&file).write(&file).unwrap();

        assert!(have_file(&file, 3, 2, 8));
    }

    #[test]
    fn have_file_rejects_size_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("rank_2.ckpt");
        std::fs::write(&file, b"hello world").unwrap();
        sample(&file).write(&file).unwrap();

        std::fs::write(&file, b"truncated").unwrap();
        assert!(!have_file(&file, 3, 2, 8));
    }

    #[test]
    fn have_file_rejects_wrong_identity() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("rank_2.ckpt");
        std::fs::write(&file, b"hello world").unwrap();
        sample(&file).write(&file).unwrap();

        assert!(!have_file(&file, 4, 2, 8));
        assert!(!have_file(&file, 3, 1, 8));
        assert!(!have_file(&file, 3, 2, 16));
    }

    #[test]
    fn have_file_rejects_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("rank_2.ckpt");
        std::fs::write(&file, b"hello world").unwrap();
        let mut meta = sample(&file);
        meta.complete = false;
        meta.write(&file).unwrap();

        assert!(!have_file(&file, 3, 2, 8));
    }

    #[test]
    fn have_file_rejects_missing_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("rank_2.ckpt");
        std::fs::write(&file, b"hello world").unwrap();
        assert!(!have_file(&file, 3, 2, 8));
    }
}
