//! In-process communicator: every rank is a thread, messages travel through
//! per-rank mailboxes on a shared fabric.
//!
//! A mailbox holds one FIFO queue per (communicator id, source rank) pair,
//! so traffic on derived communicators never interleaves with the parent's.
//! `split` allocates fresh communicator ids from the fabric, with the group
//! root assigning memberships, which lets node-local, level, and redundancy
//! group communicators nest arbitrarily deep.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::comm::Comm;
use crate::error::{Error, Result};

/// How long a blocking receive waits before reporting a stuck peer.
const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(120);

struct Mailbox {
    queues: Mutex<HashMap<(u64, usize), VecDeque<Vec<u8>>>>,
    available: Condvar,
}

struct Fabric {
    mailboxes: Vec<Mailbox>,
    next_comm_id: AtomicU64,
    recv_timeout: Duration,
}

/// One rank's endpoint on an in-process communicator.
pub struct LocalComm {
    fabric: Arc<Fabric>,
    comm_id: u64,
    /// World ranks of the members, in communicator order.
    members: Arc<Vec<usize>>,
    my_index: usize,
}

impl LocalComm {
    /// Create a world of `n` ranks; element `i` of the result is rank `i`'s
    /// endpoint and is meant to move onto that rank's thread.
    pub fn world(n: usize) -> Vec<LocalComm> {
        LocalComm::world_with_timeout(n, DEFAULT_RECV_TIMEOUT)
    }

    /// As [`LocalComm::world`] with an explicit receive timeout, useful for
    /// tests that want fast failure on a deadlocked protocol.
    pub fn world_with_timeout(n: usize, recv_timeout: Duration) -> Vec<LocalComm> {
        assert!(n > 0, "world must have at least one rank");
        let fabric = Arc::new(Fabric {
            mailboxes: (0..n)
                .map(|_| Mailbox {
                    queues: Mutex::new(HashMap::new()),
                    available: Condvar::new(),
                })
                .collect(),
            next_comm_id: AtomicU64::new(1),
            recv_timeout,
        });
        let members = Arc::new((0..n).collect::<Vec<_>>());
        (0..n)
            .map(|i| LocalComm {
                fabric: Arc::clone(&fabric),
                comm_id: 0,
                members: Arc::clone(&members),
                my_index: i,
            })
            .collect()
    }

    fn my_world(&self) -> usize {
        self.members[self.my_index]
    }

    fn check_rank(&self, rank: usize) -> Result<()> {
        if rank >= self.members.len() {
            return Err(Error::Comm(format!(
                "rank {} out of range for communicator of size {}",
                rank,
                self.members.len()
            )));
        }
        Ok(())
    }
}

impl Comm for LocalComm {
    fn rank(&self) -> usize {
        self.my_index
    }

    fn size(&self) -> usize {
        self.members.len()
    }

    fn send(&self, dest: usize, buf: &[u8]) -> Result<()> {
        self.check_rank(dest)?;
        let mailbox = &self.fabric.mailboxes[self.members[dest]];
        let mut queues = mailbox.queues.lock();
        queues
            .entry((self.comm_id, self.my_index))
            .or_default()
            .push_back(buf.to_vec());
        mailbox.available.notify_all();
        Ok(())
    }

    fn recv(&self, src: usize) -> Result<Vec<u8>> {
        self.check_rank(src)?;
        let mailbox = &self.fabric.mailboxes[self.my_world()];
        let deadline = Instant::now() + self.fabric.recv_timeout;
        let mut queues = mailbox.queues.lock();
        loop {
            if let Some(msg) = queues
                .get_mut(&(self.comm_id, src))
                .and_then(|q| q.pop_front())
            {
                return Ok(msg);
            }
            if mailbox.available.wait_until(&mut queues, deadline).timed_out() {
                return Err(Error::Comm(format!(
                    "timed out waiting for message from rank {}",
                    src
                )));
            }
        }
    }

    fn try_recv(&self, src: usize) -> Result<Option<Vec<u8>>> {
        self.check_rank(src)?;
        let mailbox = &self.fabric.mailboxes[self.my_world()];
        let mut queues = mailbox.queues.lock();
        Ok(queues
            .get_mut(&(self.comm_id, src))
            .and_then(|q| q.pop_front()))
    }

    fn recv_any(&self, srcs: &[usize]) -> Result<(usize, Vec<u8>)> {
        for &src in srcs {
            self.check_rank(src)?;
        }
        let mailbox = &self.fabric.mailboxes[self.my_world()];
        let deadline = Instant::now() + self.fabric.recv_timeout;
        let mut queues = mailbox.queues.lock();
        loop {
            for &src in srcs {
                if let Some(msg) = queues
                    .get_mut(&(self.comm_id, src))
                    .and_then(|q| q.pop_front())
                {
                    return Ok((src, msg));
                }
            }
            if mailbox.available.wait_until(&mut queues, deadline).timed_out() {
                return Err(Error::Comm(
                    "timed out waiting for message from any source".into(),
                ));
            }
        }
    }

    fn split(&self, color: i64, key: i64) -> Result<Box<dyn Comm>> {
        // Gather (color, key) at the group root, which assigns new
        // communicator ids and memberships.
        let mut msg = Vec::with_capacity(16);
        msg.extend_from_slice(&color.to_le_bytes());
        msg.extend_from_slice(&key.to_le_bytes());
        let gathered = self.gather(0, &msg)?;

        let (new_id, new_members, new_index);
        if let Some(all) = gathered {
            let mut requests = Vec::with_capacity(all.len());
            for (idx, m) in all.iter().enumerate() {
                if m.len() != 16 {
                    return Err(Error::Comm("malformed split request".into()));
                }
                let c = i64::from_le_bytes(m[0..8].try_into().unwrap());
                let k = i64::from_le_bytes(m[8..16].try_into().unwrap());
                requests.push((c, k, idx));
            }

            // Group by color; order each group by (key, rank).
            let mut groups: BTreeMap<i64, Vec<(i64, usize)>> = BTreeMap::new();
            for (c, k, idx) in requests {
                groups.entry(c).or_default().push((k, idx));
            }

            let mut assignment: Vec<Option<(u64, Vec<usize>, usize)>> = vec![None; all.len()];
            for group in groups.values_mut() {
                group.sort();
                let id = self.fabric.next_comm_id.fetch_add(1, Ordering::Relaxed);
                let worlds: Vec<usize> =
                    group.iter().map(|&(_, idx)| self.members[idx]).collect();
                for (pos, &(_, idx)) in group.iter().enumerate() {
                    assignment[idx] = Some((id, worlds.clone(), pos));
                }
            }

            for (idx, slot) in assignment.iter().enumerate() {
                let (id, worlds, pos) = slot.as_ref().expect("every rank is assigned");
                if idx == 0 {
                    continue;
                }
                let mut enc = Vec::new();
                enc.extend_from_slice(&id.to_le_bytes());
                enc.extend_from_slice(&(*pos as u32).to_le_bytes());
                enc.extend_from_slice(&(worlds.len() as u32).to_le_bytes());
                for w in worlds {
                    enc.extend_from_slice(&(*w as u32).to_le_bytes());
                }
                self.send(idx, &enc)?;
            }

            let (id, worlds, pos) = assignment[0].take().expect("rank 0 is assigned");
            new_id = id;
            new_members = worlds;
            new_index = pos;
        } else {
            let enc = self.recv(0)?;
            if enc.len() < 16 {
                return Err(Error::Comm("malformed split reply".into()));
            }
            new_id = u64::from_le_bytes(enc[0..8].try_into().unwrap());
            new_index = u32::from_le_bytes(enc[8..12].try_into().unwrap()) as usize;
            let count = u32::from_le_bytes(enc[12..16].try_into().unwrap()) as usize;
            if enc.len() != 16 + count * 4 {
                return Err(Error::Comm("malformed split reply".into()));
            }
            new_members = (0..count)
                .map(|i| {
                    u32::from_le_bytes(enc[16 + i * 4..20 + i * 4].try_into().unwrap()) as usize
                })
                .collect();
        }

        Ok(Box::new(LocalComm {
            fabric: Arc::clone(&self.fabric),
            comm_id: new_id,
            members: Arc::new(new_members),
            my_index: new_index,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ReduceOp;

    /// Run `f` on `n` rank threads and collect the per-rank results.
    fn run_ranks<T, F>(n: usize, f: F) -> Vec<T>
    where
        T: Send + 'static,
        F: Fn(LocalComm) -> T + Send + Sync + 'static,
    {
        let comms = LocalComm::world_with_timeout(n, Duration::from_secs(10));
        let f = Arc::new(f);
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| {
                let f = Arc::clone(&f);
                std::thread::spawn(move || f(comm))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn point_to_point_ordering() {
        run_ranks(2, |comm| {
            if comm.rank() == 0 {
                comm.send(1, b"first").unwrap();
                comm.send(1, b"second").unwrap();
            } else {
                assert_eq!(comm.recv(0).unwrap(), b"first");
                assert_eq!(comm.recv(0).unwrap(), b"second");
            }
        });
    }

    #[test]
    fn sendrecv_head_on() {
        run_ranks(2, |comm| {
            let peer = 1 - comm.rank();
            let got = comm
                .sendrecv(peer, format!("from {}", comm.rank()).as_bytes(), peer)
                .unwrap();
            assert_eq!(got, format!("from {}", peer).as_bytes());
        });
    }

    #[test]
    fn allreduce_ops() {
        let results = run_ranks(4, |comm| {
            let r = comm.rank() as i64;
            let sum = comm.allreduce_i64(r, ReduceOp::Sum).unwrap();
            let max = comm.allreduce_i64(r, ReduceOp::Max).unwrap();
            let min = comm.allreduce_i64(r, ReduceOp::Min).unwrap();
            let and = comm.allreduce_i64((r != 2) as i64, ReduceOp::And).unwrap();
            (sum, max, min, and)
        });
        for (sum, max, min, and) in results {
            assert_eq!((sum, max, min, and), (6, 3, 0, 0));
        }
    }

    #[test]
    fn bcast_from_nonzero_root() {
        let results = run_ranks(3, |comm| {
            let mut buf = if comm.rank() == 2 {
                b"payload".to_vec()
            } else {
                Vec::new()
            };
            comm.bcast(2, &mut buf).unwrap();
            buf
        });
        for r in results {
            assert_eq!(r, b"payload");
        }
    }

    #[test]
    fn split_forms_ordered_groups() {
        let results = run_ranks(6, |comm| {
            // Even ranks one group, odd ranks another, ordered by rank.
            let color = (comm.rank() % 2) as i64;
            let sub = comm.split(color, comm.rank() as i64).unwrap();
            let sum = sub
                .allreduce_i64(comm.rank() as i64, ReduceOp::Sum)
                .unwrap();
            (comm.rank(), sub.rank(), sub.size(), sum)
        });
        for (world, sub_rank, sub_size, sum) in results {
            assert_eq!(sub_size, 3);
            assert_eq!(sub_rank, world / 2);
            let expect = if world % 2 == 0 { 0 + 2 + 4 } else { 1 + 3 + 5 };
            assert_eq!(sum, expect);
        }
    }

    #[test]
    fn traffic_on_split_comm_does_not_leak() {
        run_ranks(4, |comm| {
            let sub = comm.split((comm.rank() / 2) as i64, comm.rank() as i64).unwrap();
            // Exchange inside each pair on the subcomm while the parent
            // also carries a message; queues must stay separate.
            let peer = 1 - sub.rank();
            sub.send(peer, b"sub").unwrap();
            if comm.rank() == 0 {
                comm.send(3, b"world").unwrap();
            }
            assert_eq!(sub.recv(peer).unwrap(), b"sub");
            if comm.rank() == 3 {
                assert_eq!(comm.recv(0).unwrap(), b"world");
            }
        });
    }

    #[test]
    fn exchange_routes_sparse_messages() {
        let results = run_ranks(4, |comm| {
            // Each rank sends its rank id to rank (rank+1) % 4.
            let dest = (comm.rank() + 1) % 4;
            let mut out = BTreeMap::new();
            out.insert(dest, vec![comm.rank() as u8]);
            comm.exchange(out).unwrap()
        });
        for (rank, got) in results.into_iter().enumerate() {
            let src = (rank + 3) % 4;
            assert_eq!(got.len(), 1);
            assert_eq!(got[&src], vec![src as u8]);
        }
    }

    #[test]
    fn recv_any_returns_some_pending_source() {
        run_ranks(3, |comm| {
            if comm.rank() == 0 {
                let mut seen = Vec::new();
                for _ in 0..2 {
                    let (src, msg) = comm.recv_any(&[1, 2]).unwrap();
                    assert_eq!(msg, vec![src as u8]);
                    seen.push(src);
                }
                seen.sort();
                assert_eq!(seen, vec![1, 2]);
            } else {
                comm.send(0, &[comm.rank() as u8]).unwrap();
            }
        });
    }

    #[test]
    fn recv_times_out_when_no_sender() {
        let comms = LocalComm::world_with_timeout(2, Duration::from_millis(50));
        let mut it = comms.into_iter();
        let c0 = it.next().unwrap();
        assert!(c0.recv(1).is_err());
    }
}
