//! Partitioning datasets across workers

use std::fmt;
use std::num::NonZeroUsize;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How a dataset is split across workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Sharding {
    /// Every worker holds everything
    #[default]
    None,
    /// Workers hold disjoint example ranges
    Data,
    /// Workers hold disjoint feature ranges
    Model,
}

impl fmt::Display for Sharding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Splits `total` items among `workers` and returns the share of `rank`.
///
/// Ranges are contiguous, disjoint, cover `0..total` and differ in size by at
/// most one.
pub fn shard_range(total: usize, rank: usize, workers: NonZeroUsize) -> Range<usize> {
    let workers = workers.get();
    let base = total / workers;
    let rem = total % workers;

    let start = rank * base + rank.min(rem);
    let extra = usize::from(rank < rem);
    start..start + base + extra
}

/// One worker's position in the group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardSpec {
    rank: usize,
    workers: NonZeroUsize,
}

impl ShardSpec {
    /// Worker `rank` of `workers`
    pub fn new(rank: usize, workers: usize) -> Result<Self> {
        let workers = NonZeroUsize::new(workers)
            .ok_or_else(|| Error::InvalidArgument("worker count must be nonzero".into()))?;
        if rank >= workers.get() {
            return Err(Error::InvalidArgument(format!(
                "rank {rank} out of range for {workers} workers"
            )));
        }
        Ok(Self { rank, workers })
    }

    /// The only worker of a group of one
    pub fn single() -> Self {
        Self { rank: 0, workers: NonZeroUsize::MIN }
    }

    /// This worker's rank
    pub fn rank(self) -> usize {
        self.rank
    }

    /// Group size
    pub fn workers(self) -> usize {
        self.workers.get()
    }

    /// This worker's share of `total`
    #[inline]
    pub fn range(self, total: usize) -> Range<usize> {
        shard_range(total, self.rank, self.workers)
    }
}
