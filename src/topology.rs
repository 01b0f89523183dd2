//! Static description of the participating processes.

use std::cmp::Ordering;

use crate::error::{Error, Result};

/// The fixed set of cooperating processes.
///
/// Absolute process indices are the transport's own numbering. Collective
/// schedules work on group ranks instead: the host is rank 0 and the remaining
/// processes take ranks `1..total` in ascending index order. Data that is
/// ordered by process index is therefore also ordered by group rank once the
/// host's share is put first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessTopology {
    total: usize,
    self_index: usize,
    host_index: usize,
}

impl ProcessTopology {
    /// Create a topology for `total` processes.
    pub fn new(total: usize, self_index: usize, host_index: usize) -> Result<Self> {
        if total == 0 {
            return Err(Error::InvalidTopology("no processes".to_string()));
        }
        if self_index >= total {
            return Err(Error::InvalidTopology(format!(
                "process index {self_index} outside of {total} processes"
            )));
        }
        if host_index >= total {
            return Err(Error::InvalidTopology(format!(
                "host index {host_index} outside of {total} processes"
            )));
        }
        Ok(Self {
            total,
            self_index,
            host_index,
        })
    }

    /// Number of processes.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Absolute index of this process.
    pub fn self_index(&self) -> usize {
        self.self_index
    }

    /// Absolute index of the host process.
    pub fn host_index(&self) -> usize {
        self.host_index
    }

    /// True on the host process.
    pub fn is_host(&self) -> bool {
        self.self_index == self.host_index
    }

    /// Group rank of an absolute process index.
    pub fn rank_of(&self, index: usize) -> usize {
        match index.cmp(&self.host_index) {
            Ordering::Equal => 0,
            Ordering::Less => index + 1,
            Ordering::Greater => index,
        }
    }

    /// Absolute process index of a group rank.
    pub fn absolute_index_of(&self, rank: usize) -> usize {
        match rank {
            0 => self.host_index,
            r if r <= self.host_index => r - 1,
            r => r,
        }
    }

    /// Group rank of this process.
    pub fn rank(&self) -> usize {
        self.rank_of(self.self_index)
    }
}
