//! Exchange between distributed ranks.
//!
//! A rank holds one [`crate::solver::CableSystem`]. Ranks only meet in the
//! collective calls of this trait; node storage is never shared between them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Barrier, Mutex, MutexGuard};

use crate::model::{Partition, SplitKey};

/// Per split key, two quantities to be summed over every copy of the node
/// (`[d, rhs]` during the solve, `[rhs, cm]` during evaluation).
pub type SplitSums = BTreeMap<SplitKey, [f64; 2]>;

/// Collective operations between ranks.
///
/// Every rank must make the same sequence of collective calls
/// (`sum_reduce`, `reduce_split`).
pub trait Transport: Send + Sync + fmt::Debug {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Sum of `local` over all ranks.
    fn sum_reduce(&self, local: usize) -> usize;

    /// Replace each entry of `sums` with its sum over all ranks holding
    /// that key.
    fn reduce_split(&self, sums: &mut SplitSums);

    /// Called after flat states are scattered into a partition.
    fn after_scatter(&self, partition: &mut Partition) {
        let _ = partition;
    }

    /// Called before flat states are gathered from a partition.
    fn before_gather(&self, partition: &mut Partition) {
        let _ = partition;
    }

    /// Called during derivative evaluation once every potential of the
    /// partition is current (algebraic nodes included) and before membrane
    /// currents are computed. Copies potentials into the fields of
    /// mechanisms that need them, such as gap junctions.
    fn transfer_voltages(&self, partition: &mut Partition) {
        let _ = partition;
    }
}

/// A single rank; every collective is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalTransport;

impl Transport for LocalTransport {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn sum_reduce(&self, local: usize) -> usize {
        local
    }

    fn reduce_split(&self, _sums: &mut SplitSums) {}
}

#[derive(Debug)]
struct Group {
    size: usize,
    barrier: Barrier,
    counts: Mutex<Vec<usize>>,
    splits: Mutex<Vec<SplitSums>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// In-process ranks, one per thread, meeting at a barrier.
///
/// Each collective writes the rank's contribution, waits for every rank,
/// reads all contributions in rank order, and waits again so the slots can be
/// reused by the next call.
#[derive(Debug, Clone)]
pub struct SharedTransport {
    rank: usize,
    group: Arc<Group>,
}

impl SharedTransport {
    /// Create `size` connected ranks.
    pub fn group(size: usize) -> Vec<Self> {
        let size = size.max(1);
        let group = Arc::new(Group {
            size,
            barrier: Barrier::new(size),
            counts: Mutex::new(vec![0; size]),
            splits: Mutex::new(vec![SplitSums::new(); size]),
        });
        (0..size)
            .map(|rank| Self {
                rank,
                group: Arc::clone(&group),
            })
            .collect()
    }
}

impl Transport for SharedTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.group.size
    }

    fn sum_reduce(&self, local: usize) -> usize {
        lock(&self.group.counts)[self.rank] = local;
        self.group.barrier.wait();
        let total: usize = lock(&self.group.counts).iter().sum();
        self.group.barrier.wait();
        total
    }

    fn reduce_split(&self, sums: &mut SplitSums) {
        lock(&self.group.splits)[self.rank] = sums.clone();
        self.group.barrier.wait();
        {
            let all = lock(&self.group.splits);
            for (key, total) in sums.iter_mut() {
                *total = [0.0; 2];
                for other in all.iter().filter_map(|s| s.get(key)) {
                    total[0] += other[0];
                    total[1] += other[1];
                }
            }
        }
        self.group.barrier.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_is_identity() {
        let mut sums = SplitSums::new();
        sums.insert(SplitKey(1), [2.0, 3.0]);
        LocalTransport.reduce_split(&mut sums);
        assert_eq!(sums[&SplitKey(1)], [2.0, 3.0]);
        assert_eq!(LocalTransport.sum_reduce(7), 7);
    }

    #[test]
    fn test_shared_reductions() {
        let ranks = SharedTransport::group(3);
        let results: Vec<(usize, SplitSums)> = std::thread::scope(|s| {
            let handles: Vec<_> = ranks
                .iter()
                .map(|t| {
                    s.spawn(move || {
                        let total = t.sum_reduce(t.rank() + 1);
                        let mut sums = SplitSums::new();
                        sums.insert(SplitKey(9), [1.0, t.rank() as f64]);
                        if t.rank() != 1 {
                            sums.insert(SplitKey(4), [10.0, 0.5]);
                        }
                        t.reduce_split(&mut sums);
                        (total, sums)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for (rank, (total, sums)) in results.iter().enumerate() {
            assert_eq!(*total, 6);
            assert_eq!(sums[&SplitKey(9)], [3.0, 3.0]);
            assert_eq!(sums.contains_key(&SplitKey(4)), rank != 1);
            if rank != 1 {
                assert_eq!(sums[&SplitKey(4)], [20.0, 1.0]);
            }
        }
    }
}
