//! The transfer daemon: a background thread that drives bytes from cache to
//! the parallel file system under the transfer-file contract.
//!
//! The daemon is deliberately dumb. Each cycle it takes the transfer-file
//! lock, reads the queue, and obeys `COMMAND`: on `RUN` it reports
//! `STATE=RUN` and copies a bounded slice of each unfinished file (updating
//! `WRITTEN`), raising `FLAG DONE` once everything is copied; on `STOP` (or
//! no command) it reports `STATE=STOP` and idles. The library never talks
//! to the thread directly, so an out-of-process mover can replace it
//! without any code change.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender};

use crate::error::Result;
use crate::flush::async_flush::{
    COMMAND_RUN, COMMAND_STOP, FLAG_DONE, KEY_COMMAND, KEY_DESTINATION, KEY_FILES, KEY_FLAG,
    KEY_SIZE, KEY_STATE, KEY_WRITTEN, STATE_RUN, STATE_STOP,
};
use crate::kvtree::Kvtree;

/// Handle to a running transfer daemon thread.
pub struct Mover {
    stop_tx: Sender<()>,
    handle: std::thread::JoinHandle<()>,
}

impl Mover {
    /// Start a daemon over `transfer_file`, copying at most `buf_size`
    /// bytes per file per cycle and sleeping `poll` between idle cycles.
    pub fn spawn(transfer_file: PathBuf, poll: Duration, buf_size: usize) -> Mover {
        let (stop_tx, stop_rx) = bounded(1);
        let handle = std::thread::Builder::new()
            .name("scr-transfer".into())
            .spawn(move || run(transfer_file, poll, buf_size.max(1), stop_rx))
            .expect("failed to spawn transfer thread");
        Mover { stop_tx, handle }
    }

    /// Stop the daemon and wait for it to exit.
    pub fn shutdown(self) {
        let _ = self.stop_tx.send(());
        let _ = self.handle.join();
    }
}

fn run(transfer_file: PathBuf, poll: Duration, buf_size: usize, stop_rx: Receiver<()>) {
    loop {
        let idle = match cycle(&transfer_file, buf_size) {
            Ok(idle) => idle,
            Err(e) => {
                tracing::warn!(error = %e, "transfer cycle failed");
                true
            }
        };
        // Drain continuously while work is pending; only idle cycles sleep.
        let timeout = if idle { poll } else { Duration::from_millis(0) };
        match stop_rx.recv_timeout(timeout) {
            Ok(()) => return,
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// One daemon cycle under the transfer-file lock. Returns true when there
/// was nothing to do.
fn cycle(transfer_file: &Path, buf_size: usize) -> Result<bool> {
    let (fd, mut tree) = Kvtree::lock_open_read(transfer_file)?;

    let running = tree.get_val(KEY_COMMAND) == Some(COMMAND_RUN);
    if !running {
        tree.set_val(KEY_STATE, STATE_STOP);
        tree.write_unlock(transfer_file, fd)?;
        return Ok(true);
    }
    tree.set_val(KEY_STATE, STATE_RUN);

    let mut moved_any = false;
    let mut all_done = true;
    let sources: Vec<String> = tree
        .get(KEY_FILES)
        .map(|f| f.keys().map(str::to_owned).collect())
        .unwrap_or_default();
    for src in sources {
        let entry = tree.get(KEY_FILES).and_then(|f| f.get(&src)).cloned();
        let entry = match entry {
            Some(e) => e,
            None => continue,
        };
        let (size, written, dest) = match (
            entry.get_u64(KEY_SIZE),
            entry.get_u64(KEY_WRITTEN),
            entry.get_val(KEY_DESTINATION),
        ) {
            (Some(s), Some(w), Some(d)) => (s, w, d.to_owned()),
            _ => {
                all_done = false;
                continue;
            }
        };
        if written >= size {
            continue;
        }
        all_done = false;

        match move_slice(Path::new(&src), Path::new(&dest), written, size, buf_size) {
            Ok(moved) => {
                moved_any = true;
                tree.get_mut(KEY_FILES)
                    .and_then(|f| f.get_mut(&src))
                    .expect("entry exists")
                    .set_u64(KEY_WRITTEN, written + moved);
            }
            Err(e) => {
                tracing::warn!(src = %src, error = %e, "transfer of file failed");
            }
        }
    }

    if all_done && tree.get(KEY_FILES).map_or(false, |f| !f.is_empty()) {
        tree.set_kv(KEY_FLAG, FLAG_DONE);
    }

    tree.write_unlock(transfer_file, fd)?;
    Ok(!moved_any)
}

/// Copy up to `buf_size` bytes of `src` starting at `written` into `dest`
/// at the same offset. Returns the bytes moved.
fn move_slice(src: &Path, dest: &Path, written: u64, size: u64, buf_size: usize) -> Result<u64> {
    let want = ((size - written) as usize).min(buf_size);
    let mut buf = vec![0u8; want];

    let mut reader = File::open(src)?;
    reader.seek(SeekFrom::Start(written))?;
    reader.read_exact(&mut buf)?;

    let mut writer = OpenOptions::new().write(true).create(true).open(dest)?;
    writer.seek(SeekFrom::Start(written))?;
    writer.write_all(&buf)?;
    if written + want as u64 >= size {
        writer.sync_all()?;
    }
    Ok(want as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_file(tree: &mut Kvtree, src: &Path, dest: &Path, size: u64) {
        let entry = tree.set_kv(KEY_FILES, &src.to_string_lossy());
        entry.set_val(KEY_DESTINATION, &dest.to_string_lossy());
        entry.set_u64(KEY_SIZE, size);
        entry.set_u64(KEY_WRITTEN, 0);
    }

    #[test]
    fn daemon_moves_queued_files_and_raises_done() {
        let dir = tempfile::tempdir().unwrap();
        let transfer_file = dir.path().join("transfer.scrinfo");
        let src = dir.path().join("src.dat");
        let dest = dir.path().join("dest.dat");
        let payload = vec![42u8; 10_000];
        std::fs::write(&src, &payload).unwrap();

        let mut tree = Kvtree::new();
        queue_file(&mut tree, &src, &dest, payload.len() as u64);
        tree.set_val(KEY_COMMAND, COMMAND_RUN);
        tree.write_file(&transfer_file).unwrap();

        let mover = Mover::spawn(transfer_file.clone(), Duration::from_millis(10), 1024);
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            let tree = Kvtree::read_file_locked(&transfer_file).unwrap();
            if tree.get_kv(KEY_FLAG, FLAG_DONE).is_some() {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "transfer never finished");
            std::thread::sleep(Duration::from_millis(10));
        }
        mover.shutdown();

        assert_eq!(std::fs::read(&dest).unwrap(), payload);
    }

    #[test]
    fn daemon_reports_stop_state_when_idle() {
        let dir = tempfile::tempdir().unwrap();
        let transfer_file = dir.path().join("transfer.scrinfo");

        let mover = Mover::spawn(transfer_file.clone(), Duration::from_millis(10), 1024);
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            let tree = Kvtree::read_file_locked(&transfer_file).unwrap();
            if tree.get_kv(KEY_STATE, STATE_STOP).is_some() {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "daemon never reported stop");
            std::thread::sleep(Duration::from_millis(10));
        }
        mover.shutdown();
    }

    #[test]
    fn stop_command_halts_mid_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let transfer_file = dir.path().join("transfer.scrinfo");
        let src = dir.path().join("src.dat");
        let dest = dir.path().join("dest.dat");
        std::fs::write(&src, vec![1u8; 100_000]).unwrap();

        let mut tree = Kvtree::new();
        queue_file(&mut tree, &src, &dest, 100_000);
        tree.set_val(KEY_COMMAND, COMMAND_STOP);
        tree.write_file(&transfer_file).unwrap();

        let mover = Mover::spawn(transfer_file.clone(), Duration::from_millis(10), 512);
        std::thread::sleep(Duration::from_millis(100));
        mover.shutdown();

        let tree = Kvtree::read_file_locked(&transfer_file).unwrap();
        assert!(tree.get_kv(KEY_STATE, STATE_STOP).is_some());
        let written = tree
            .get(KEY_FILES)
            .unwrap()
            .get(&src.to_string_lossy())
            .unwrap()
            .get_u64(KEY_WRITTEN)
            .unwrap();
        assert_eq!(written, 0, "no bytes move while stopped");
    }
}
