//! Collective operations over a process group.
//!
//! Engines only need rank/size and two gathers, used at metadata aggregation
//! points. [`SelfComm`] is the group of one; [`ThreadComm`] runs a group inside a
//! single process, one thread per rank. Other runtimes plug in by implementing
//! [`Communicator`].

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};

use crate::{Error, Result};

pub trait Communicator: Send + Sync + fmt::Debug {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Collects one value from every rank. Only `root` receives the values, in rank order;
    /// every other rank gets an empty vector.
    fn gather(&self, value: u64, root: usize) -> Result<Vec<u64>>;

    /// Collects a variable-length block from every rank. `counts` holds every rank's
    /// block length and is only meaningful on `root`, which receives the blocks
    /// concatenated in rank order. Other ranks get an empty vector.
    fn gatherv(&self, data: &[u8], counts: &[u64], root: usize) -> Result<Vec<u8>>;
}

fn check_root(comm: &dyn Communicator, root: usize) -> Result<()> {
    if root >= comm.size() {
        return Err(Error::InvalidArgument(format!(
            "root rank {} outside process group of size {}",
            root,
            comm.size()
        )));
    }
    Ok(())
}

/// Gathers byte blocks of arbitrary length to `root`: lengths first, then the blocks
/// into a receive buffer pre-sized to their sum. Returns the per-rank lengths and the
/// rank-ordered concatenation on `root`, two empty vectors elsewhere.
pub fn gather_bytes(
    comm: &dyn Communicator,
    data: &[u8],
    root: usize,
) -> Result<(Vec<u64>, Vec<u8>)> {
    check_root(comm, root)?;

    let counts = comm.gather(data.len() as u64, root)?;
    let gathered = comm.gatherv(data, &counts, root)?;

    if comm.rank() == root {
        let expected: u64 = counts.iter().sum();
        if gathered.len() as u64 != expected {
            return Err(Error::InvalidState(format!(
                "gathered {} bytes, ranks announced {}",
                gathered.len(),
                expected
            )));
        }
    }

    Ok((counts, gathered))
}

/// Splits a [`gather_bytes`] result back into per-rank blocks.
pub fn split_blocks<'a>(counts: &[u64], gathered: &'a [u8]) -> Result<Vec<&'a [u8]>> {
    let mut blocks = Vec::with_capacity(counts.len());
    let mut position = 0usize;

    for count in counts {
        let end = position + *count as usize;
        let block = gathered.get(position..end).ok_or_else(|| {
            Error::InvalidFormat(format!(
                "block [{}, {}) outside gathered buffer of {} bytes",
                position,
                end,
                gathered.len()
            ))
        })?;
        blocks.push(block);
        position = end;
    }

    Ok(blocks)
}

/// The process group of a single process.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelfComm;

impl Communicator for SelfComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn gather(&self, value: u64, root: usize) -> Result<Vec<u64>> {
        check_root(self, root)?;
        Ok(vec![value])
    }

    fn gatherv(&self, data: &[u8], _counts: &[u64], root: usize) -> Result<Vec<u8>> {
        check_root(self, root)?;
        Ok(data.to_vec())
    }
}

#[derive(Debug, Default)]
struct Round {
    generation: u64,
    arrived: usize,
    slots: Vec<Option<Vec<u8>>>,
    completed: Arc<Vec<Vec<u8>>>,
}

#[derive(Debug)]
struct Group {
    size: usize,
    round: Mutex<Round>,
    cvar: Condvar,
}

/// One rank of an in-process group. Every collective blocks until all ranks of the
/// group have entered it.
#[derive(Debug, Clone)]
pub struct ThreadComm {
    rank: usize,
    group: Arc<Group>,
}

impl ThreadComm {
    /// Creates the `size` ranks of a new group. Hand one to each thread.
    pub fn group(size: usize) -> Vec<ThreadComm> {
        let group = Arc::new(Group {
            size,
            round: Mutex::new(Round {
                slots: vec![None; size],
                ..Round::default()
            }),
            cvar: Condvar::new(),
        });

        (0..size)
            .map(|rank| ThreadComm {
                rank,
                group: group.clone(),
            })
            .collect()
    }

    /// Deposits this rank's block and waits until every rank has done the same.
    fn exchange(&self, block: Vec<u8>) -> Result<Arc<Vec<Vec<u8>>>> {
        let poisoned = |_| Error::InvalidState("process group poisoned".into());

        let mut round = self.group.round.lock().map_err(poisoned)?;
        let generation = round.generation;

        round.slots[self.rank] = Some(block);
        round.arrived += 1;

        if round.arrived == self.group.size {
            let blocks = round
                .slots
                .iter_mut()
                .map(|slot| slot.take().unwrap_or_default())
                .collect();
            round.completed = Arc::new(blocks);
            round.arrived = 0;
            round.generation += 1;
            self.group.cvar.notify_all();
            return Ok(round.completed.clone());
        }

        while round.generation == generation {
            round = self.group.cvar.wait(round).map_err(poisoned)?;
        }

        // The next round cannot complete before this rank joins it, so `completed`
        // still belongs to our generation.
        Ok(round.completed.clone())
    }
}

impl Communicator for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.group.size
    }

    fn gather(&self, value: u64, root: usize) -> Result<Vec<u64>> {
        check_root(self, root)?;
        let blocks = self.exchange(value.to_le_bytes().to_vec())?;

        if self.rank != root {
            return Ok(Vec::new());
        }

        blocks
            .iter()
            .map(|b| {
                let bytes: [u8; 8] = b.as_slice().try_into().map_err(|_| {
                    Error::InvalidState("malformed value in gather".into())
                })?;
                Ok(u64::from_le_bytes(bytes))
            })
            .collect()
    }

    fn gatherv(&self, data: &[u8], counts: &[u64], root: usize) -> Result<Vec<u8>> {
        check_root(self, root)?;
        let blocks = self.exchange(data.to_vec())?;

        if self.rank != root {
            return Ok(Vec::new());
        }

        let total: u64 = counts.iter().sum();
        let mut out = Vec::with_capacity(total as usize);
        for block in blocks.iter() {
            out.extend_from_slice(block);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_comm_gathers_itself() {
        let (counts, bytes) = gather_bytes(&SelfComm, b"abc", 0).unwrap();
        assert_eq!(counts, vec![3]);
        assert_eq!(bytes, b"abc");
        assert!(gather_bytes(&SelfComm, b"abc", 1).is_err());
    }

    #[test]
    fn thread_group_gathers_in_rank_order() {
        let handles: Vec<_> = ThreadComm::group(4)
            .into_iter()
            .map(|comm| {
                std::thread::spawn(move || {
                    // Ranks write blocks of different lengths, in reverse arrival order.
                    std::thread::sleep(std::time::Duration::from_millis(
                        (4 - comm.rank() as u64) * 5,
                    ));
                    let block = vec![comm.rank() as u8; comm.rank() + 1];
                    let first = gather_bytes(&comm, &block, 0).unwrap();
                    let second = gather_bytes(&comm, &block, 3).unwrap();
                    (comm.rank(), first, second)
                })
            })
            .collect();

        for handle in handles {
            let (rank, (counts, bytes), (counts3, bytes3)) = handle.join().unwrap();
            if rank == 0 {
                assert_eq!(counts, vec![1, 2, 3, 4]);
                assert_eq!(bytes, vec![0, 1, 1, 2, 2, 2, 3, 3, 3, 3]);
                let blocks = split_blocks(&counts, &bytes).unwrap();
                assert_eq!(blocks[2], &[2, 2, 2]);
            } else {
                assert!(counts.is_empty());
                assert!(bytes.is_empty());
            }
            if rank == 3 {
                assert_eq!(counts3, vec![1, 2, 3, 4]);
                assert_eq!(bytes3.len(), 10);
            } else {
                assert!(bytes3.is_empty());
            }
        }
    }
}
