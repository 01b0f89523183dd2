//! The hypercube channel schedule shared by all collectives.
//!
//! For `channel = 1, 2, 4, ...` below the group size, the partner of `rank` is
//! `rank ^ channel`. A rank with the channel bit set sends to its partner and
//! leaves the schedule. Otherwise it receives from the partner, if the partner
//! exists, and goes on. Rank 0 ends up with everything after `ceil(log2(size))`
//! channels. Every rank walks the channels in the same order and never sends
//! and receives in the same channel, so the schedule cannot deadlock.

/// One step of the schedule, carrying the partner's group rank.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Receive from the partner and combine.
    Receive(usize),
    /// Send to the partner. Always the last step.
    Send(usize),
}

/// Iterator over the steps of one rank.
#[derive(Clone, Debug)]
pub struct Schedule {
    rank: usize,
    size: usize,
    channel: usize,
    done: bool,
}

impl Schedule {
    /// Schedule of `rank` in a group of `size` ranks.
    pub fn new(rank: usize, size: usize) -> Self {
        debug_assert!(rank < size);
        Self {
            rank,
            size,
            channel: 1,
            done: false,
        }
    }
}

impl Iterator for Schedule {
    type Item = Step;

    fn next(&mut self) -> Option<Step> {
        while !self.done && self.channel < self.size {
            let channel = self.channel;
            self.channel <<= 1;
            let partner = self.rank ^ channel;

            if self.rank & channel != 0 {
                self.done = true;
                return Some(Step::Send(partner));
            }
            if partner < self.size {
                return Some(Step::Receive(partner));
            }
        }
        None
    }
}
