//! Byte-level file primitives: buffered copy with optional CRC32, and
//! padded reads/writes over the concatenation of a rank's checkpoint files
//! (the "logical file" the XOR encoder and rebuilder operate on).

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::meta::Meta;

/// Size of `path` in bytes, 0 if it cannot be read.
pub fn filesize(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Create `dir` and any missing parents.
pub fn mkdir_p(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    Ok(())
}

/// CRC32 of the whole contents of `path`.
pub fn crc32_file(path: &Path) -> Result<u32> {
    let mut file = File::open(path)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; 1 << 16];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// Compute the CRC32 of `file` and reconcile it with the sidecar: store it
/// when the sidecar has none, verify it when it does. A mismatch marks the
/// file incomplete and returns an integrity error.
pub fn compute_crc(file: &Path) -> Result<()> {
    let mut meta = Meta::read(file)?;
    let crc = crc32_file(file)?;
    match meta.crc32 {
        None => {
            meta.crc32 = Some(crc);
            meta.write(file)?;
            Ok(())
        }
        Some(expected) if expected == crc => Ok(()),
        Some(expected) => {
            meta.complete = false;
            meta.write(file)?;
            Err(Error::Integrity {
                path: file.to_owned(),
                reason: format!("crc32 mismatch (stored {:#x}, computed {:#x})", expected, crc),
            })
        }
    }
}

/// Copy `src` into `dst_dir` keeping its base name, streaming through a
/// buffer of `buf_size` bytes. Returns the destination path, the byte count,
/// and the CRC32 of the copied bytes when `want_crc` is set. The destination
/// is fsynced before returning.
pub fn copy_to(
    src: &Path,
    dst_dir: &Path,
    buf_size: usize,
    want_crc: bool,
) -> Result<(PathBuf, u64, Option<u32>)> {
    let name = src
        .file_name()
        .ok_or_else(|| Error::InvalidOperation(format!("no file name in {}", src.display())))?;
    let dst = dst_dir.join(name);

    let mut reader = File::open(src)?;
    let mut writer = File::create(&dst)?;
    let mut hasher = want_crc.then(crc32fast::Hasher::new);
    let mut buf = vec![0u8; buf_size.max(1)];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        if let Some(h) = hasher.as_mut() {
            h.update(&buf[..n]);
        }
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    writer.sync_all()?;
    Ok((dst, total, hasher.map(|h| h.finalize())))
}

/// A rank's checkpoint files opened together and addressed as one contiguous
/// byte range in list order.
pub struct FileSet {
    files: Vec<(PathBuf, File, u64)>,
}

impl FileSet {
    /// Open every path read-only, recording its current size.
    pub fn open_read(paths: &[PathBuf]) -> Result<FileSet> {
        let mut files = Vec::with_capacity(paths.len());
        for p in paths {
            let f = File::open(p)?;
            let size = f.metadata()?.len();
            files.push((p.clone(), f, size));
        }
        Ok(FileSet { files })
    }

    /// Create every path for writing with a declared final size. Writes past
    /// a file's declared size spill into the next file; the declared sizes
    /// define the logical layout, not the bytes on disk yet.
    pub fn create_write(paths: &[(PathBuf, u64)]) -> Result<FileSet> {
        let mut files = Vec::with_capacity(paths.len());
        for (p, size) in paths {
            let f = File::create(p)?;
            files.push((p.clone(), f, *size));
        }
        Ok(FileSet { files })
    }

    /// Total declared size of the set.
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|(_, _, s)| s).sum()
    }

    /// Read `buf.len()` bytes at logical `offset`, zero-filling any region
    /// past the end of the set. Short files therefore XOR as if padded.
    pub fn read_pad(&mut self, buf: &mut [u8], offset: u64) -> Result<()> {
        buf.fill(0);
        let mut pos = offset;
        let mut filled = 0usize;
        let mut base = 0u64;
        for (path, file, size) in &mut self.files {
            if filled == buf.len() {
                break;
            }
            let end = base + *size;
            if pos < end {
                let in_file = pos - base;
                let avail = (*size - in_file) as usize;
                let want = (buf.len() - filled).min(avail);
                file.seek(SeekFrom::Start(in_file))?;
                read_full(file, &mut buf[filled..filled + want], path)?;
                filled += want;
                pos += want as u64;
            }
            base = end;
        }
        // Anything not filled lies past the last file and stays zero.
        Ok(())
    }

    /// Write `buf` at logical `offset`, dropping any bytes past the end of
    /// the set (the zero padding added on the encode side).
    pub fn write_pad(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        let mut pos = offset;
        let mut consumed = 0usize;
        let mut base = 0u64;
        for (_, file, size) in &mut self.files {
            if consumed == buf.len() {
                break;
            }
            let end = base + *size;
            if pos < end {
                let in_file = pos - base;
                let avail = (*size - in_file) as usize;
                let want = (buf.len() - consumed).min(avail);
                file.seek(SeekFrom::Start(in_file))?;
                file.write_all(&buf[consumed..consumed + want])?;
                consumed += want;
                pos += want as u64;
            }
            base = end;
        }
        Ok(())
    }

    /// fsync every file in the set.
    pub fn sync_all(&self) -> Result<()> {
        for (_, file, _) in &self.files {
            file.sync_all()?;
        }
        Ok(())
    }
}

fn read_full(file: &mut File, buf: &mut [u8], path: &Path) -> Result<()> {
    file.read_exact(buf).map_err(|e| Error::Integrity {
        path: path.to_owned(),
        reason: format!("short read: {}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::FileKind;

    #[test]
    fn copy_preserves_bytes_and_crc() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.dat");
        let dst_dir = dir.path().join("out");
        mkdir_p(&dst_dir).unwrap();
        let payload = vec![7u8; 300_000];
        std::fs::write(&src, &payload).unwrap();

        let (dst, bytes, crc) = copy_to(&src, &dst_dir, 4096, true).unwrap();
        assert_eq!(bytes, payload.len() as u64);
        assert_eq!(std::fs::read(&dst).unwrap(), payload);
        assert_eq!(crc, Some(crc32fast::hash(&payload)));
    }

    #[test]
    fn compute_crc_stores_then_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.dat");
        std::fs::write(&file, b"payload").unwrap();
        Meta::new(&file, FileKind::Full, 7, 1, 0, 1, true)
            .write(&file)
            .unwrap();

        compute_crc(&file).unwrap();
        assert_eq!(
            Meta::read(&file).unwrap().crc32,
            Some(crc32fast::hash(b"payload"))
        );

        // Unchanged contents verify; corrupted contents fail and the file
        // is marked incomplete.
        compute_crc(&file).unwrap();
        std::fs::write(&file, b"payl0ad").unwrap();
        assert!(compute_crc(&file).is_err());
        assert!(!Meta::read(&file).unwrap().complete);
    }

    #[test]
    fn padded_read_crosses_files_and_zero_fills() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"abcd").unwrap();
        std::fs::write(&b, b"XY").unwrap();

        let mut set = FileSet::open_read(&[a, b]).unwrap();
        assert_eq!(set.total_size(), 6);

        let mut buf = [0u8; 8];
        set.read_pad(&mut buf, 2).unwrap();
        assert_eq!(&buf, b"cdXY\0\0\0\0");
    }

    #[test]
    fn padded_write_rebuilds_exact_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let mut set = FileSet::create_write(&[(a.clone(), 4), (b.clone(), 2)]).unwrap();

        set.write_pad(b"abcd", 0).unwrap();
        set.write_pad(b"XY\0\0", 4).unwrap();
        set.sync_all().unwrap();
        drop(set);

        assert_eq!(std::fs::read(&a).unwrap(), b"abcd");
        assert_eq!(std::fs::read(&b).unwrap(), b"XY");
    }

    #[test]
    fn zero_byte_file_reads_as_padding() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("empty");
        std::fs::write(&a, b"").unwrap();
        let mut set = FileSet::open_read(&[a]).unwrap();
        let mut buf = [0xAAu8; 4];
        set.read_pad(&mut buf, 0).unwrap();
        assert_eq!(buf, [0u8; 4]);
    }
}
