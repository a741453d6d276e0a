//! Message-passing substrate.
//!
//! The core runs bulk-synchronous over a small set of point-to-point and
//! collective operations expressed by the [`Comm`] trait. Messages between a
//! pair of ranks on one communicator are delivered in order; collectives
//! require every member to participate, and concurrent operations on the
//! same communicator are not allowed. The collectives are provided methods
//! layered on `send`/`recv`, so a transport only supplies the point-to-point
//! primitives and `split`.
//!
//! [`local::LocalComm`] is the in-process transport; an MPI-backed
//! implementation would slot in behind the same trait.

pub mod local;

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{Error, Result};

/// Reduction operators for [`Comm::allreduce_i64`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// Logical and over 0/1 values.
    And,
    /// Sum.
    Sum,
    /// Maximum.
    Max,
    /// Minimum.
    Min,
}

impl ReduceOp {
    fn fold(&self, a: i64, b: i64) -> i64 {
        match self {
            ReduceOp::And => ((a != 0) && (b != 0)) as i64,
            ReduceOp::Sum => a + b,
            ReduceOp::Max => a.max(b),
            ReduceOp::Min => a.min(b),
        }
    }
}

/// A communicator: a fixed, ordered group of processes that exchange byte
/// messages.
pub trait Comm: Send {
    /// This process's rank within the communicator.
    fn rank(&self) -> usize;

    /// Number of ranks in the communicator.
    fn size(&self) -> usize;

    /// Send a message to `dest`. Sends are buffered and do not wait for the
    /// receiver.
    fn send(&self, dest: usize, buf: &[u8]) -> Result<()>;

    /// Block until a message from `src` arrives.
    fn recv(&self, src: usize) -> Result<Vec<u8>>;

    /// Take a pending message from `src` without blocking.
    fn try_recv(&self, src: usize) -> Result<Option<Vec<u8>>>;

    /// Partition the communicator: ranks passing the same `color` form a new
    /// communicator, ordered by (`key`, current rank). Collective.
    fn split(&self, color: i64, key: i64) -> Result<Box<dyn Comm>>;

    /// Block until a message arrives from any rank in `srcs`, returning the
    /// source and the message. Transports should override the polling
    /// default with a real wait.
    fn recv_any(&self, srcs: &[usize]) -> Result<(usize, Vec<u8>)> {
        loop {
            for &src in srcs {
                if let Some(msg) = self.try_recv(src)? {
                    return Ok((src, msg));
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Duplicate the communicator. Collective.
    fn dup(&self) -> Result<Box<dyn Comm>> {
        self.split(0, self.rank() as i64)
    }

    /// Paired send to `dest` and receive from `src`. Safe against head-on
    /// exchanges because sends are buffered.
    fn sendrecv(&self, dest: usize, buf: &[u8], src: usize) -> Result<Vec<u8>> {
        self.send(dest, buf)?;
        self.recv(src)
    }

    /// Block until every rank has entered the barrier.
    fn barrier(&self) -> Result<()> {
        if self.size() == 1 {
            return Ok(());
        }
        if self.rank() == 0 {
            for src in 1..self.size() {
                self.recv(src)?;
            }
            for dest in 1..self.size() {
                self.send(dest, &[])?;
            }
        } else {
            self.send(0, &[])?;
            self.recv(0)?;
        }
        Ok(())
    }

    /// Broadcast `buf` from `root`; on return every rank holds root's bytes.
    fn bcast(&self, root: usize, buf: &mut Vec<u8>) -> Result<()> {
        if self.size() == 1 {
            return Ok(());
        }
        if self.rank() == root {
            for dest in 0..self.size() {
                if dest != root {
                    self.send(dest, buf)?;
                }
            }
        } else {
            *buf = self.recv(root)?;
        }
        Ok(())
    }

    /// Gather every rank's bytes at `root`; returns `Some(messages)` ordered
    /// by rank at root, `None` elsewhere.
    fn gather(&self, root: usize, buf: &[u8]) -> Result<Option<Vec<Vec<u8>>>> {
        if self.rank() == root {
            let mut out = vec![Vec::new(); self.size()];
            out[root] = buf.to_vec();
            for src in 0..self.size() {
                if src != root {
                    out[src] = self.recv(src)?;
                }
            }
            Ok(Some(out))
        } else {
            self.send(root, buf)?;
            Ok(None)
        }
    }

    /// Gather at rank 0 then broadcast, so every rank sees all messages.
    fn allgather(&self, buf: &[u8]) -> Result<Vec<Vec<u8>>> {
        let gathered = self.gather(0, buf)?;
        let mut bytes = match gathered {
            Some(msgs) => encode_list(&msgs),
            None => Vec::new(),
        };
        self.bcast(0, &mut bytes)?;
        decode_list(&bytes)
    }

    /// Reduce `value` across all ranks with `op`; every rank gets the result.
    fn allreduce_i64(&self, value: i64, op: ReduceOp) -> Result<i64> {
        let gathered = self.gather(0, &value.to_le_bytes())?;
        let mut bytes = match gathered {
            Some(msgs) => {
                let mut acc = None;
                for msg in msgs {
                    let v = decode_i64(&msg)?;
                    acc = Some(match acc {
                        None => v,
                        Some(a) => op.fold(a, v),
                    });
                }
                acc.unwrap_or(0).to_le_bytes().to_vec()
            }
            None => Vec::new(),
        };
        self.bcast(0, &mut bytes)?;
        decode_i64(&bytes)
    }

    /// True iff `flag` is true on every rank.
    fn alltrue(&self, flag: bool) -> Result<bool> {
        Ok(self.allreduce_i64(flag as i64, ReduceOp::And)? != 0)
    }

    /// Sparse all-to-all: deliver each (destination, payload) pair to its
    /// destination, returning the payloads addressed to this rank keyed by
    /// source. Routed through rank 0.
    fn exchange(&self, msgs: BTreeMap<usize, Vec<u8>>) -> Result<BTreeMap<usize, Vec<u8>>> {
        // Encode this rank's outgoing map.
        let mut out = Vec::new();
        out.extend_from_slice(&(msgs.len() as u32).to_le_bytes());
        for (dest, payload) in &msgs {
            if *dest >= self.size() {
                return Err(Error::Comm(format!(
                    "exchange destination {} out of range for size {}",
                    dest,
                    self.size()
                )));
            }
            out.extend_from_slice(&(*dest as u32).to_le_bytes());
            out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            out.extend_from_slice(payload);
        }

        let gathered = self.gather(0, &out)?;
        if let Some(all) = gathered {
            // Regroup by destination.
            let mut buckets: Vec<Vec<(usize, Vec<u8>)>> = vec![Vec::new(); self.size()];
            for (src, msg) in all.iter().enumerate() {
                let mut cursor = &msg[..];
                let count = take_u32(&mut cursor)? as usize;
                for _ in 0..count {
                    let dest = take_u32(&mut cursor)? as usize;
                    let len = take_u32(&mut cursor)? as usize;
                    let payload = take_bytes(&mut cursor, len)?;
                    buckets[dest].push((src, payload));
                }
            }
            // Deliver each bucket.
            let mut mine = BTreeMap::new();
            for (dest, bucket) in buckets.into_iter().enumerate() {
                if dest == 0 {
                    mine = bucket.into_iter().collect();
                } else {
                    let mut enc = Vec::new();
                    enc.extend_from_slice(&(bucket.len() as u32).to_le_bytes());
                    for (src, payload) in bucket {
                        enc.extend_from_slice(&(src as u32).to_le_bytes());
                        enc.extend_from_slice(&(payload.len() as u32).to_le_bytes());
                        enc.extend_from_slice(&payload);
                    }
                    self.send(dest, &enc)?;
                }
            }
            Ok(mine)
        } else {
            let msg = self.recv(0)?;
            let mut cursor = &msg[..];
            let count = take_u32(&mut cursor)? as usize;
            let mut mine = BTreeMap::new();
            for _ in 0..count {
                let src = take_u32(&mut cursor)? as usize;
                let len = take_u32(&mut cursor)? as usize;
                mine.insert(src, take_bytes(&mut cursor, len)?);
            }
            Ok(mine)
        }
    }
}

/// Decode a little-endian i64 message.
pub fn decode_i64(buf: &[u8]) -> Result<i64> {
    let arr: [u8; 8] = buf
        .try_into()
        .map_err(|_| Error::Comm(format!("expected 8-byte message, got {}", buf.len())))?;
    Ok(i64::from_le_bytes(arr))
}

fn encode_list(msgs: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(msgs.len() as u32).to_le_bytes());
    for msg in msgs {
        out.extend_from_slice(&(msg.len() as u32).to_le_bytes());
        out.extend_from_slice(msg);
    }
    out
}

fn decode_list(bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut cursor = bytes;
    let count = take_u32(&mut cursor)? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let len = take_u32(&mut cursor)? as usize;
        out.push(take_bytes(&mut cursor, len)?);
    }
    Ok(out)
}

fn take_u32(cursor: &mut &[u8]) -> Result<u32> {
    if cursor.len() < 4 {
        return Err(Error::Comm("truncated message".into()));
    }
    let (head, rest) = cursor.split_at(4);
    *cursor = rest;
    Ok(u32::from_le_bytes(head.try_into().unwrap()))
}

fn take_bytes(cursor: &mut &[u8], len: usize) -> Result<Vec<u8>> {
    if cursor.len() < len {
        return Err(Error::Comm("truncated message".into()));
    }
    let (head, rest) = cursor.split_at(len);
    *cursor = rest;
    Ok(head.to_vec())
}
