//! The message-passing substrate used by the collectives.
//!
//! All process indices passed to a [`Transport`] are absolute indices. The
//! collectives translate group ranks through [`ProcessTopology`].

pub mod local;
#[cfg(feature = "mpi")]
pub mod mpi;

use crate::{error::Result, topology::ProcessTopology};

/// Message tag.
pub type Tag = i32;

/// Blocking point-to-point and collective primitives.
pub trait Transport {
    /// The participating processes.
    fn topology(&self) -> &ProcessTopology;

    /// Send `buf` to process `dest`. Blocks until the transport accepted it.
    fn send(&self, buf: &[u8], dest: usize, tag: Tag) -> Result<()>;

    /// Receive a message from process `source` into `buf`.
    ///
    /// Blocks until a matching message arrived and returns its length. A
    /// message longer than `buf` is an error.
    fn receive(&self, buf: &mut [u8], source: usize, tag: Tag) -> Result<usize>;

    /// Check without blocking whether a message with `tag` is waiting.
    fn probe(&self, tag: Tag) -> Result<bool>;

    /// Broadcast `buf` from process `root` to every process.
    fn broadcast(&self, buf: &mut [u8], root: usize) -> Result<()>;

    /// Block until every process reached the barrier.
    fn barrier(&self) -> Result<()>;

    /// Tear down the whole computation.
    fn abort(&self, code: i32) -> !;
}
