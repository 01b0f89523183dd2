//! Hypercube reductions and gathers for process-parallel codes.
//!
//! A fixed group of processes, one of them the host, combines per-process
//! contributions onto the host:
//!
//! - [`collect::reduce`] combines one contiguous buffer per process,
//! - [`session::CollectionSession`] batches many small, scattered
//!   contributions into bounded messages and writes the combined values
//!   back to where they came from,
//! - [`gather::gather`] concatenates variable-size block ranges.
//!
//! Buffers are described by arrays of [`op::CombineOp`] descriptors. All
//! communication goes through a [`transport::Transport`], either MPI or the
//! in-process [`transport::local::LocalTransport`].
#![cfg_attr(feature = "strict", deny(warnings), deny(unused_crate_dependencies))]
#![warn(missing_docs)]

pub mod collect;
pub mod combine;
pub mod config;
pub mod element;
pub mod error;
pub mod gather;
pub mod hypercube;
pub mod op;
pub mod session;
pub mod tools;
pub mod topology;
pub mod transport;

pub use error::{Error, OrAbort, Result};
