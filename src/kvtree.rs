//! Ordered key/value tree used for every persistent artifact.
//!
//! Each node is a map from string keys to child trees; a "value" is simply a
//! key whose subtree carries the nested detail (or nothing). All node-local
//! control files (filemap, flush, transfer, halt, nodes), the summary and
//! index files on the parallel file system, and the header of every XOR
//! artifact are serialized trees in the same format.
//!
//! Wire format (little-endian):
//!
//! ```text
//! tree  := count:u32 elem*
//! elem  := key_len:u32 key_bytes tree
//! ```
//!
//! On-disk writes go through a write-new-then-rename pattern so readers only
//! ever observe a fully written snapshot. The transfer and halt files are
//! additionally guarded by an advisory lock because a helper process mutates
//! them concurrently.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::comm::Comm;
use crate::error::{Error, Result};

/// Upper bound on element count and key length accepted by the decoder.
/// Anything larger is treated as corruption rather than an allocation request.
const DECODE_LIMIT: u32 = 1 << 24;

/// Tree key with numeric-aware ordering: keys that parse as integers sort
/// numerically and ahead of non-numeric keys, so iterating ranks or
/// checkpoint ids visits them in numeric order.
#[derive(Clone, PartialEq, Eq)]
pub struct KvKey(String);

impl KvKey {
    fn new(s: &str) -> Self {
        KvKey(s.to_owned())
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn as_int(&self) -> Option<i64> {
        self.0.parse::<i64>().ok()
    }
}

impl Ord for KvKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.as_int(), other.as_int()) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for KvKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for KvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An ordered key tree.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Kvtree {
    children: BTreeMap<KvKey, Kvtree>,
}

impl Kvtree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Kvtree::default()
    }

    /// Number of direct children.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// True if the node has no children.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Look up a direct child.
    pub fn get(&self, key: &str) -> Option<&Kvtree> {
        self.children.get(&KvKey::new(key))
    }

    /// Look up a direct child mutably.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Kvtree> {
        self.children.get_mut(&KvKey::new(key))
    }

    /// Get or insert an empty child under `key`.
    pub fn entry(&mut self, key: &str) -> &mut Kvtree {
        self.children.entry(KvKey::new(key)).or_default()
    }

    /// Replace the child under `key` with `tree`, returning a reference to it.
    pub fn set(&mut self, key: &str, tree: Kvtree) -> &mut Kvtree {
        self.children.insert(KvKey::new(key), tree);
        self.children.get_mut(&KvKey::new(key)).unwrap()
    }

    /// Remove the child under `key`.
    pub fn unset(&mut self, key: &str) {
        self.children.remove(&KvKey::new(key));
    }

    /// Remove all children.
    pub fn clear(&mut self) {
        self.children.clear();
    }

    /// Iterate over direct children in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Kvtree)> {
        self.children.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Keys of the direct children in key order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(|k| k.as_str())
    }

    /// First child key, if any. For a key used as a scalar slot this is the
    /// stored value.
    pub fn first_key(&self) -> Option<&str> {
        self.children.keys().next().map(|k| k.as_str())
    }

    /// Look up the two-level entry `key -> val`.
    pub fn get_kv(&self, key: &str, val: &str) -> Option<&Kvtree> {
        self.get(key).and_then(|t| t.get(val))
    }

    /// Set the two-level entry `key -> val`, creating both levels.
    pub fn set_kv(&mut self, key: &str, val: &str) -> &mut Kvtree {
        self.entry(key).entry(val)
    }

    /// Remove the entry `key -> val`; drops `key` entirely if it becomes empty.
    pub fn unset_kv(&mut self, key: &str, val: &str) {
        let mut empty = false;
        if let Some(t) = self.get_mut(key) {
            t.unset(val);
            empty = t.is_empty();
        }
        if empty {
            self.unset(key);
        }
    }

    /// Replace the scalar value stored under `key`.
    pub fn set_val(&mut self, key: &str, val: &str) -> &mut Kvtree {
        let slot = self.entry(key);
        slot.clear();
        slot.entry(val)
    }

    /// Scalar value stored under `key` (its first child key).
    pub fn get_val(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|t| t.first_key())
    }

    /// Set `key` to the decimal rendering of `v`.
    pub fn set_i64(&mut self, key: &str, v: i64) -> &mut Kvtree {
        self.set_val(key, &v.to_string())
    }

    /// Set `key` to the decimal rendering of `v`.
    pub fn set_u64(&mut self, key: &str, v: u64) -> &mut Kvtree {
        self.set_val(key, &v.to_string())
    }

    /// Parse the scalar under `key` as an i64.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get_val(key).and_then(|s| s.parse().ok())
    }

    /// Parse the scalar under `key` as a u64.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get_val(key).and_then(|s| s.parse().ok())
    }

    /// Look up `key -> id` where `id` is numeric.
    pub fn get_kv_int(&self, key: &str, id: u64) -> Option<&Kvtree> {
        self.get_kv(key, &id.to_string())
    }

    /// Set `key -> id` where `id` is numeric.
    pub fn set_kv_int(&mut self, key: &str, id: u64) -> &mut Kvtree {
        self.entry(key).entry(&id.to_string())
    }

    /// Recursively fold `other` into `self`. Children present in both are
    /// merged; children only in `other` are copied.
    pub fn merge(&mut self, other: &Kvtree) {
        for (k, v) in other.iter() {
            self.entry(k).merge(v);
        }
    }

    // --- wire codec ---

    /// Append the encoded tree to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.children.len() as u32).to_le_bytes());
        for (k, v) in &self.children {
            let key = k.as_str().as_bytes();
            out.extend_from_slice(&(key.len() as u32).to_le_bytes());
            out.extend_from_slice(key);
            v.encode(out);
        }
    }

    /// Encode into a fresh byte vector.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }

    /// Decode a tree from the front of `reader`, consuming exactly the
    /// encoded bytes.
    pub fn read_from<R: Read>(reader: &mut R) -> std::io::Result<Kvtree> {
        let mut count_buf = [0u8; 4];
        reader.read_exact(&mut count_buf)?;
        let count = u32::from_le_bytes(count_buf);
        if count > DECODE_LIMIT {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("element count {} exceeds limit", count),
            ));
        }
        let mut tree = Kvtree::new();
        for _ in 0..count {
            let mut len_buf = [0u8; 4];
            reader.read_exact(&mut len_buf)?;
            let key_len = u32::from_le_bytes(len_buf);
            if key_len > DECODE_LIMIT {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("key length {} exceeds limit", key_len),
                ));
            }
            let mut key = vec![0u8; key_len as usize];
            reader.read_exact(&mut key)?;
            let key = String::from_utf8(key).map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "key is not utf-8")
            })?;
            let child = Kvtree::read_from(reader)?;
            tree.children.insert(KvKey(key), child);
        }
        Ok(tree)
    }

    /// Decode a tree from a byte slice, requiring full consumption.
    pub fn from_bytes(bytes: &[u8]) -> std::io::Result<Kvtree> {
        let mut cursor = bytes;
        let tree = Kvtree::read_from(&mut cursor)?;
        if !cursor.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{} trailing bytes after tree", cursor.len()),
            ));
        }
        Ok(tree)
    }

    // --- file persistence ---

    /// Read a tree from `path`. A missing file reads as an empty tree so
    /// callers can treat first use and restart uniformly.
    pub fn read_file(path: &Path) -> Result<Kvtree> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Kvtree::new()),
            Err(e) => return Err(e.into()),
        };
        Kvtree::from_bytes(&bytes).map_err(|e| Error::Corrupt {
            path: path.to_owned(),
            reason: e.to_string(),
        })
    }

    /// Atomically replace `path` with the encoded tree: write a sibling temp
    /// file, fsync, rename over the target.
    pub fn write_file(&self, path: &Path) -> Result<()> {
        let tmp = tmp_path(path);
        let mut file = File::create(&tmp)?;
        file.write_all(&self.to_bytes())?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Open `path` with an exclusive advisory lock and read the tree,
    /// returning the locked handle. Pair with [`Kvtree::write_unlock`] to
    /// finish the read-modify-write.
    pub fn lock_open_read(path: &Path) -> Result<(File, Kvtree)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.lock_exclusive()?;
        let mut bytes = Vec::new();
        (&file).read_to_end(&mut bytes)?;
        let tree = if bytes.is_empty() {
            Kvtree::new()
        } else {
            match Kvtree::from_bytes(&bytes) {
                Ok(t) => t,
                Err(e) => {
                    let _ = fs2::FileExt::unlock(&file);
                    return Err(Error::Corrupt {
                        path: path.to_owned(),
                        reason: e.to_string(),
                    });
                }
            }
        };
        Ok((file, tree))
    }

    /// Write the tree back through a still-locked handle from
    /// [`Kvtree::lock_open_read`], then release the lock.
    pub fn write_unlock(&self, path: &Path, file: File) -> Result<()> {
        // Rewrite in place while holding the lock; the lock serializes
        // against the helper process, so no reader can observe the truncate.
        use std::io::Seek;
        let mut f = file;
        f.set_len(0)?;
        f.seek(std::io::SeekFrom::Start(0))?;
        f.write_all(&self.to_bytes())?;
        f.sync_all()?;
        fs2::FileExt::unlock(&f).map_err(Error::Io)?;
        let _ = path;
        Ok(())
    }

    // --- exchange over a communicator ---

    /// Send the encoded tree to `dest`.
    pub fn send(&self, comm: &dyn Comm, dest: usize) -> Result<()> {
        comm.send(dest, &self.to_bytes())
    }

    /// Receive a tree from `src`.
    pub fn recv(comm: &dyn Comm, src: usize) -> Result<Kvtree> {
        let bytes = comm.recv(src)?;
        Kvtree::from_bytes(&bytes).map_err(|e| Error::Comm(format!("bad tree message: {}", e)))
    }

    /// Send this tree to `dest` while receiving one from `src`.
    pub fn sendrecv(&self, comm: &dyn Comm, dest: usize, src: usize) -> Result<Kvtree> {
        let bytes = comm.sendrecv(dest, &self.to_bytes(), src)?;
        Kvtree::from_bytes(&bytes).map_err(|e| Error::Comm(format!("bad tree message: {}", e)))
    }

    /// Broadcast a tree from `root`; on return every rank holds root's tree.
    pub fn bcast(tree: &mut Kvtree, root: usize, comm: &dyn Comm) -> Result<()> {
        let mut bytes = if comm.rank() == root {
            tree.to_bytes()
        } else {
            Vec::new()
        };
        comm.bcast(root, &mut bytes)?;
        if comm.rank() != root {
            *tree = Kvtree::from_bytes(&bytes)
                .map_err(|e| Error::Comm(format!("bad tree message: {}", e)))?;
        }
        Ok(())
    }

    /// Sparse all-to-all of trees keyed by destination rank; returns the
    /// trees addressed to this rank keyed by source.
    pub fn exchange(
        send: &std::collections::BTreeMap<usize, Kvtree>,
        comm: &dyn Comm,
    ) -> Result<std::collections::BTreeMap<usize, Kvtree>> {
        let out = send
            .iter()
            .map(|(dest, tree)| (*dest, tree.to_bytes()))
            .collect();
        let incoming = comm.exchange(out)?;
        incoming
            .into_iter()
            .map(|(src, bytes)| {
                Kvtree::from_bytes(&bytes)
                    .map(|t| (src, t))
                    .map_err(|e| Error::Comm(format!("bad tree message: {}", e)))
            })
            .collect()
    }

    /// Read a tree under a shared advisory lock.
    pub fn read_file_locked(path: &Path) -> Result<Kvtree> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Kvtree::new()),
            Err(e) => return Err(e.into()),
        };
        file.lock_shared()?;
        let mut bytes = Vec::new();
        let result = (&file).read_to_end(&mut bytes);
        let _ = fs2::FileExt::unlock(&file);
        result?;
        if bytes.is_empty() {
            return Ok(Kvtree::new());
        }
        Kvtree::from_bytes(&bytes).map_err(|e| Error::Corrupt {
            path: path.to_owned(),
            reason: e.to_string(),
        })
    }
}

impl fmt::Debug for Kvtree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.children.iter().map(|(k, v)| (k.as_str(), v)))
            .finish()
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_owned();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_roundtrip() {
        let mut t = Kvtree::new();
        t.set_val("NAME", "alpha");
        t.set_u64("SIZE", 4096);
        assert_eq!(t.get_val("NAME"), Some("alpha"));
        assert_eq!(t.get_u64("SIZE"), Some(4096));

        let bytes = t.to_bytes();
        let back = Kvtree::from_bytes(&bytes).unwrap();
        assert_eq!(t, back);
    }

    #[test]
    fn numeric_keys_sort_numerically() {
        let mut t = Kvtree::new();
        for id in [10u64, 2, 1, 33] {
            t.set_kv_int("RANK", id);
        }
        let order: Vec<&str> = t.get("RANK").unwrap().keys().collect();
        assert_eq!(order, ["1", "2", "10", "33"]);
    }

    #[test]
    fn merge_is_recursive() {
        let mut a = Kvtree::new();
        a.set_kv_int("CKPT", 1).set_kv_int("RANK", 0);
        let mut b = Kvtree::new();
        b.set_kv_int("CKPT", 1).set_kv_int("RANK", 3);
        b.set_kv_int("CKPT", 2);
        a.merge(&b);
        let ranks: Vec<&str> = a
            .get_kv_int("CKPT", 1)
            .unwrap()
            .get("RANK")
            .unwrap()
            .keys()
            .collect();
        assert_eq!(ranks, ["0", "3"]);
        assert!(a.get_kv_int("CKPT", 2).is_some());
    }

    #[test]
    fn unset_kv_drops_empty_parent() {
        let mut t = Kvtree::new();
        t.set_kv("LOCATION", "CACHE");
        t.unset_kv("LOCATION", "CACHE");
        assert!(t.get("LOCATION").is_none());
    }

    #[test]
    fn file_roundtrip_and_missing_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.scrinfo");

        assert!(Kvtree::read_file(&path).unwrap().is_empty());

        let mut t = Kvtree::new();
        t.set_kv("FILES", "/tmp/ckpt/rank_0.dat");
        t.write_file(&path).unwrap();
        assert_eq!(Kvtree::read_file(&path).unwrap(), t);
    }

    #[test]
    fn corrupt_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.scrinfo");
        std::fs::write(&path, b"\xff\xff\xff\xff").unwrap();
        assert!(matches!(
            Kvtree::read_file(&path),
            Err(Error::Corrupt { .. })
        ));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let t = Kvtree::new();
        let mut bytes = t.to_bytes();
        bytes.push(0);
        assert!(Kvtree::from_bytes(&bytes).is_err());
    }

    #[test]
    fn locked_read_modify_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transfer.scrinfo");

        let (file, mut tree) = Kvtree::lock_open_read(&path).unwrap();
        tree.set_kv("COMMAND", "RUN");
        tree.write_unlock(&path, file).unwrap();

        let back = Kvtree::read_file_locked(&path).unwrap();
        assert_eq!(back.get_val("COMMAND"), Some("RUN"));
    }

    #[test]
    fn header_is_self_delimiting_in_stream() {
        let mut t = Kvtree::new();
        t.set_u64("CHUNK", 7);
        let mut bytes = t.to_bytes();
        bytes.extend_from_slice(b"payload-bytes");

        let mut cursor: &[u8] = &bytes;
        let back = Kvtree::read_from(&mut cursor).unwrap();
        assert_eq!(back.get_u64("CHUNK"), Some(7));
        assert_eq!(cursor, b"payload-bytes");
    }
}
