//! Error types for collective operations.
//!
//! Every failure in this crate is fatal to the whole computation. Library
//! routines still return [`Result`] so that the caller decides where the
//! process is torn down; [`OrAbort::or_abort`] implements the usual policy of
//! logging the error and aborting through the transport.

use thiserror::Error;

use crate::op::{ElementType, Operator};
use crate::transport::Transport;

/// Result type for collective operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for collective operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The message-passing substrate reported a failure.
    #[error("transport failure during {context} (code {code})")]
    Transport {
        /// Code reported by the substrate.
        code: i32,
        /// What was being attempted.
        context: String,
    },

    /// A collection buffer cannot hold one descriptor plus one element.
    #[error("collection buffer of {capacity} bytes is below the minimum of {minimum} bytes")]
    BufferTooSmall {
        /// Requested capacity.
        capacity: usize,
        /// Smallest usable capacity.
        minimum: usize,
    },

    /// More distinct destinations than a record header can index.
    #[error("too many destinations registered in one session (limit {limit})")]
    TooManyDestinations {
        /// Maximum number of destinations per batch.
        limit: usize,
    },

    /// A repeat group contains another repeat group.
    #[error("repeat group nested inside another repeat group at descriptor {index}")]
    NestedRepeatGroup {
        /// Position of the nested descriptor.
        index: usize,
    },

    /// A repeat group claims more descriptors than follow it.
    #[error("repeat group at descriptor {index} spans {width} descriptors but only {available} follow")]
    RepeatGroupOverrun {
        /// Position of the repeat group descriptor.
        index: usize,
        /// Number of descriptors the group claims.
        width: usize,
        /// Number of descriptors actually following.
        available: usize,
    },

    /// Two processes packed different descriptors for the same record.
    #[error("blocks had different descriptors at buffer offset {offset}: local {local:#010x}, remote {remote:#010x}")]
    HeaderMismatch {
        /// Byte offset of the record.
        offset: usize,
        /// Local header word.
        local: u32,
        /// Received header word.
        remote: u32,
    },

    /// A gather transfer does not continue the accumulated block range.
    #[error("received data offset mismatch: expected block {expected}, received block {received}")]
    GatherOffsetMismatch {
        /// Next block index the receiver was expecting.
        expected: i64,
        /// Block index carried by the received header.
        received: i64,
    },

    /// The host finished a gather holding a different block range than requested.
    #[error("gather ended with blocks [{start}, {end}) instead of [0, {expected})")]
    GatherIncomplete {
        /// First block held.
        start: i64,
        /// One past the last block held.
        end: i64,
        /// Total number of blocks requested.
        expected: i64,
    },

    /// The operator is not defined for the element type.
    #[error("operation {operator:?} is not defined on {element_type:?} elements")]
    UnsupportedOperation {
        /// Offending operator.
        operator: Operator,
        /// Offending element type.
        element_type: ElementType,
    },

    /// A contribution continued a destination before any was registered.
    #[error("contribution has no destination and none was registered before")]
    MissingDestination,

    /// A buffer is shorter than the data described for it.
    #[error("{context}: {needed} bytes required, {available} available")]
    BufferOverrun {
        /// Which buffer overran.
        context: &'static str,
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        available: usize,
    },

    /// A peer sent a message of unexpected length.
    #[error("received {received} bytes from process {source_index}, expected {expected}")]
    LengthMismatch {
        /// Absolute index of the sender.
        source_index: usize,
        /// Expected length in bytes.
        expected: usize,
        /// Actual length in bytes.
        received: usize,
    },

    /// The process topology is inconsistent.
    #[error("invalid process topology: {0}")]
    InvalidTopology(String),

    /// A header word does not decode to a known operator or element type.
    #[error("unknown descriptor code {0:#06x}")]
    UnknownDescriptor(u16),

    /// A reduction group without any member was requested.
    #[error("reduction group excluding the host has no members")]
    EmptyReductionGroup,

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Stable numeric code of the error, used as the abort code.
    pub fn code(&self) -> i32 {
        match self {
            Error::Transport { .. } => 1,
            Error::BufferTooSmall { .. } => 2,
            Error::TooManyDestinations { .. } => 3,
            Error::NestedRepeatGroup { .. } => 4,
            Error::RepeatGroupOverrun { .. } => 5,
            Error::HeaderMismatch { .. } => 6,
            Error::GatherOffsetMismatch { .. } => 7,
            Error::GatherIncomplete { .. } => 8,
            Error::UnsupportedOperation { .. } => 9,
            Error::MissingDestination => 10,
            Error::BufferOverrun { .. } => 11,
            Error::LengthMismatch { .. } => 12,
            Error::InvalidTopology(_) => 13,
            Error::UnknownDescriptor(_) => 14,
            Error::EmptyReductionGroup => 15,
            Error::InvalidConfig(_) => 16,
        }
    }

    pub(crate) fn transport(code: i32, context: impl Into<String>) -> Self {
        Error::Transport {
            code,
            context: context.into(),
        }
    }
}

/// Apply the fatal-error policy to a result.
pub trait OrAbort<T> {
    /// Return the value, or log the error and abort the whole computation.
    fn or_abort<X: Transport + ?Sized>(self, transport: &X) -> T;
}

impl<T> OrAbort<T> for Result<T> {
    fn or_abort<X: Transport + ?Sized>(self, transport: &X) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                log::error!(
                    "process {}: {} (code {})",
                    transport.topology().self_index(),
                    err,
                    err.code()
                );
                transport.abort(err.code())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{Error, OrAbort, Result};
    use crate::{
        op::{ElementType, Operator},
        transport::local::LocalTransport,
    };

    #[test]
    fn test_codes_are_distinct() {
        let errors = [
            Error::transport(3, "send"),
            Error::BufferTooSmall {
                capacity: 1,
                minimum: 16,
            },
            Error::TooManyDestinations { limit: 128 },
            Error::NestedRepeatGroup { index: 0 },
            Error::RepeatGroupOverrun {
                index: 0,
                width: 2,
                available: 1,
            },
            Error::HeaderMismatch {
                offset: 0,
                local: 0,
                remote: 1,
            },
            Error::GatherOffsetMismatch {
                expected: 0,
                received: 1,
            },
            Error::GatherIncomplete {
                start: 0,
                end: 1,
                expected: 2,
            },
            Error::UnsupportedOperation {
                operator: Operator::LogicalOr,
                element_type: ElementType::F64,
            },
            Error::MissingDestination,
            Error::BufferOverrun {
                context: "combine",
                needed: 8,
                available: 4,
            },
            Error::LengthMismatch {
                source_index: 1,
                expected: 4,
                received: 8,
            },
            Error::InvalidTopology(String::new()),
            Error::UnknownDescriptor(0xffff),
            Error::EmptyReductionGroup,
            Error::InvalidConfig(String::new()),
        ];

        let mut codes = errors.iter().map(Error::code).collect::<Vec<_>>();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(errors.len(), 16);
        assert_eq!(codes, (1..=16).collect::<Vec<_>>());
    }

    #[test]
    #[should_panic(expected = "aborted the computation with code 6")]
    fn test_or_abort_aborts_with_error_code() {
        let group = LocalTransport::group(2, 0).unwrap();
        let result: Result<()> = Err(Error::HeaderMismatch {
            offset: 4,
            local: 1,
            remote: 2,
        });
        result.or_abort(&group[1]);
    }

    #[test]
    fn test_or_abort_passes_values_through() {
        let group = LocalTransport::group(1, 0).unwrap();
        assert_eq!(Ok::<_, Error>(7).or_abort(&group[0]), 7);
    }

    #[test]
    fn test_mismatch_message() {
        let err = Error::HeaderMismatch {
            offset: 12,
            local: 0x10,
            remote: 0x20,
        };
        assert!(err.to_string().starts_with("blocks had different descriptors"));
    }
}
