//! Configuration of collection sessions and gathers.

use crate::{
    error::{Error, Result},
    op::HEADER_LEN,
    topology::ProcessTopology,
    transport::Tag,
};

/// Default capacity of the session buffers in bytes.
pub const DEFAULT_CAPACITY: usize = 16 * 1024;

/// Smallest capacity that holds one descriptor and one element of any type.
///
/// A record starts on a 4 byte boundary and its data on a boundary of the
/// element width, so the widest element needs 8 bytes after an 8 byte header
/// slot.
pub const MIN_CAPACITY: usize = 2 * 8;

const _: () = assert!(MIN_CAPACITY >= HEADER_LEN + 8);

/// Settings of a [`CollectionSession`](crate::session::CollectionSession).
///
/// Every process must open its session with the same settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    /// Tag of all session messages.
    pub tag: Tag,
    /// Capacity of each of the two session buffers in bytes.
    pub capacity: usize,
    /// Whether the host's own contributions are combined.
    pub include_host: bool,
}

impl SessionConfig {
    /// Default settings with the given tag.
    pub fn new(tag: Tag) -> Self {
        Self {
            tag,
            capacity: DEFAULT_CAPACITY,
            include_host: true,
        }
    }

    /// Set the buffer capacity.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set whether the host contributes data.
    pub fn include_host(mut self, include_host: bool) -> Self {
        self.include_host = include_host;
        self
    }

    /// Check the settings against the process topology.
    pub fn validate(&self, topology: &ProcessTopology) -> Result<()> {
        if self.capacity < MIN_CAPACITY {
            return Err(Error::BufferTooSmall {
                capacity: self.capacity,
                minimum: MIN_CAPACITY,
            });
        }
        if self.capacity > i32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "capacity {} exceeds the largest message size",
                self.capacity
            )));
        }
        if !self.include_host && topology.total() < 2 {
            return Err(Error::EmptyReductionGroup);
        }
        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Where the local blocks of a gather sit in the gathered array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GatherLayout {
    /// Index of the first local block.
    pub offset: usize,
    /// Number of local blocks, possibly zero.
    pub local_blocks: usize,
    /// Size of one block in bytes.
    pub block_size: usize,
    /// Number of blocks in the gathered array.
    pub total_blocks: usize,
    /// Distance between consecutive blocks in the host destination.
    ///
    /// Values up to `block_size` pack the blocks tightly.
    pub stride: usize,
}

impl GatherLayout {
    /// Tightly packed layout.
    pub fn new(offset: usize, local_blocks: usize, block_size: usize, total_blocks: usize) -> Self {
        Self {
            offset,
            local_blocks,
            block_size,
            total_blocks,
            stride: block_size,
        }
    }

    /// Set the output stride.
    pub fn stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    /// Distance between blocks in the host destination.
    pub fn effective_stride(&self) -> usize {
        self.stride.max(self.block_size)
    }

    /// Bytes the host destination must hold.
    pub fn destination_len(&self) -> usize {
        match self.total_blocks {
            0 => 0,
            n => (n - 1) * self.effective_stride() + self.block_size,
        }
    }

    /// Check that the layout is consistent.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::InvalidConfig("gather block size is zero".to_string()));
        }
        if self.total_blocks > i32::MAX as usize {
            return Err(Error::InvalidConfig(format!(
                "{} gather blocks exceed the header range",
                self.total_blocks
            )));
        }
        if self.local_blocks > 0 && self.offset + self.local_blocks > self.total_blocks {
            return Err(Error::InvalidConfig(format!(
                "local blocks [{}, {}) outside of {} blocks",
                self.offset,
                self.offset + self.local_blocks,
                self.total_blocks
            )));
        }
        Ok(())
    }
}
