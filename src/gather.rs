//! Hypercube gather of variable-size block ranges onto the host.
//!
//! Every process holds a contiguous range of blocks of one logical array,
//! possibly empty. Ranges must ascend with the process index. The host copies
//! its own range straight into the destination and announces it to the others
//! with one broadcast, since the other processes forward ranges that step
//! over it. Along the hypercube schedule each process appends what it
//! receives to its own range and forwards the merged range in one transfer:
//!
//! ```text
//! [offset: i32][count: i32][data bytes]
//! ```
//!
//! `offset..offset + count` is the block range covered by the transfer. It
//! may include the host's range, whose blocks are not part of the data. A
//! received range must start exactly where the accumulated range ends, or
//! right after the host's range when the accumulated range ends where it
//! starts.

use std::ops::Range;

use itertools::izip;
use log::{debug, trace};

use crate::{
    config::GatherLayout,
    error::{Error, Result},
    hypercube::{Schedule, Step},
    transport::{Tag, Transport},
};

const GATHER_HEADER_LEN: usize = 8;

fn encode_range(offset: usize, count: usize) -> [u8; GATHER_HEADER_LEN] {
    let mut header = [0u8; GATHER_HEADER_LEN];
    header[..4].copy_from_slice(&(offset as i32).to_ne_bytes());
    header[4..].copy_from_slice(&(count as i32).to_ne_bytes());
    header
}

fn decode_range(bytes: &[u8]) -> Result<(usize, usize)> {
    let offset = i32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let count = i32::from_ne_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    match (usize::try_from(offset), usize::try_from(count)) {
        (Ok(offset), Ok(count)) => Ok((offset, count)),
        _ => Err(Error::GatherOffsetMismatch {
            expected: 0,
            received: offset.min(count) as i64,
        }),
    }
}

/// Blocks of `range` that carry data, that is, outside of the host's range.
fn data_blocks(range: Range<usize>, hole: &Option<Range<usize>>) -> usize {
    let len = range.end.saturating_sub(range.start);
    match hole {
        Some(hole) => {
            let overlap = range.end.min(hole.end).saturating_sub(range.start.max(hole.start));
            len - overlap
        }
        None => len,
    }
}

/// The block range accumulated so far.
struct Accumulated {
    start: Option<usize>,
    end: usize,
    hole: Option<Range<usize>>,
}

impl Accumulated {
    fn new(hole: Option<Range<usize>>) -> Self {
        Self {
            start: None,
            end: 0,
            hole,
        }
    }

    /// The accumulated range on the host, which must start at block 0.
    fn from_start(hole: Option<Range<usize>>) -> Self {
        Self {
            start: Some(0),
            end: 0,
            hole,
        }
    }

    fn expected(&self) -> usize {
        match &self.hole {
            Some(hole) if hole.start == self.end => hole.end,
            _ => self.end,
        }
    }

    fn admit(&mut self, offset: usize, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        if self.start.is_none() {
            self.start = Some(offset);
        } else if offset != self.expected() {
            return Err(Error::GatherOffsetMismatch {
                expected: self.expected() as i64,
                received: offset as i64,
            });
        }
        self.end = offset + count;
        Ok(())
    }

    fn range(&self) -> Range<usize> {
        match self.start {
            Some(start) => start..self.end,
            None => 0..0,
        }
    }
}

/// Parse a received transfer into its block offset, block count and payload.
fn parse_transfer<'m>(
    message: &'m [u8],
    block_size: usize,
    hole: &Option<Range<usize>>,
    source: usize,
) -> Result<(usize, usize, &'m [u8])> {
    if message.len() < GATHER_HEADER_LEN {
        return Err(Error::LengthMismatch {
            source_index: source,
            expected: GATHER_HEADER_LEN,
            received: message.len(),
        });
    }
    let (offset, count) = decode_range(message)?;

    let payload = &message[GATHER_HEADER_LEN..];
    let expected = data_blocks(offset..offset + count, hole) * block_size;
    if payload.len() != expected {
        return Err(Error::LengthMismatch {
            source_index: source,
            expected: GATHER_HEADER_LEN + expected,
            received: message.len(),
        });
    }
    Ok((offset, count, payload))
}

/// Copy contiguous blocks starting at block `offset` into the host destination.
fn place(dest: &mut [u8], layout: &GatherLayout, offset: usize, data: &[u8]) -> Result<()> {
    let block = layout.block_size;
    let stride = layout.effective_stride();
    let count = data.len() / block;
    if offset + count > layout.total_blocks {
        return Err(Error::BufferOverrun {
            context: "gather destination",
            needed: offset + count,
            available: layout.total_blocks,
        });
    }

    if stride == block {
        dest[offset * block..offset * block + data.len()].copy_from_slice(data);
    } else {
        for (chunk, at) in izip!(data.chunks_exact(block), (offset..).map(|i| i * stride)) {
            dest[at..at + block].copy_from_slice(chunk);
        }
    }
    Ok(())
}

/// Copy a received range, which may step over the host's range.
fn place_range(
    dest: &mut [u8],
    layout: &GatherLayout,
    range: Range<usize>,
    hole: &Option<Range<usize>>,
    data: &[u8],
) -> Result<()> {
    match hole {
        Some(hole) if range.start < hole.start && range.end > hole.start => {
            let (low, high) = data.split_at((hole.start - range.start) * layout.block_size);
            place(dest, layout, range.start, low)?;
            place(dest, layout, hole.end, high)
        }
        _ => place(dest, layout, range.start, data),
    }
}

/// Gather the blocks of all processes into `dest` on the host.
///
/// `local` holds this process's `layout.local_blocks` blocks, which are
/// blocks `layout.offset..` of the gathered array. `dest` is only used on
/// the host, where it must hold [`GatherLayout::destination_len`] bytes.
/// With a stride larger than the block size the bytes between blocks are
/// left untouched.
pub fn gather<T: Transport + ?Sized>(
    transport: &T,
    dest: Option<&mut [u8]>,
    local: &[u8],
    layout: &GatherLayout,
    tag: Tag,
) -> Result<()> {
    layout.validate()?;

    let block = layout.block_size;
    let own_len = layout.local_blocks * block;
    if local.len() < own_len {
        return Err(Error::BufferOverrun {
            context: "gather local data",
            needed: own_len,
            available: local.len(),
        });
    }

    let topology = *transport.topology();
    let rank = topology.rank();

    let mut dest = if topology.is_host() {
        let dest = dest.ok_or(Error::MissingDestination)?;
        if dest.len() < layout.destination_len() {
            return Err(Error::BufferOverrun {
                context: "gather destination",
                needed: layout.destination_len(),
                available: dest.len(),
            });
        }
        Some(dest)
    } else {
        None
    };

    // Every process learns which blocks the host keeps to itself.
    let mut host_range = encode_range(layout.offset, layout.local_blocks);
    transport.broadcast(&mut host_range, topology.host_index())?;
    let hole = match decode_range(&host_range)? {
        (_, 0) => None,
        (offset, count) => Some(offset..offset + count),
    };

    let mut outgoing = Vec::new();
    let mut accumulated = match dest.as_deref_mut() {
        Some(dest) => {
            if let Some(hole) = &hole {
                place(dest, layout, hole.start, &local[..own_len])?;
            }
            Accumulated::from_start(hole.clone())
        }
        None => {
            let mut accumulated = Accumulated::new(hole.clone());
            accumulated.admit(layout.offset, layout.local_blocks)?;
            outgoing.extend_from_slice(&[0u8; GATHER_HEADER_LEN]);
            outgoing.extend_from_slice(&local[..own_len]);
            accumulated
        }
    };

    let mut incoming = Vec::new();
    for step in Schedule::new(rank, topology.total()) {
        match step {
            Step::Receive(partner) => {
                let source = topology.absolute_index_of(partner);
                incoming.resize(GATHER_HEADER_LEN + layout.total_blocks * block, 0);
                let len = transport.receive(&mut incoming, source, tag)?;
                let (offset, count, payload) =
                    parse_transfer(&incoming[..len], block, &hole, source)?;
                trace!(
                    "gather: rank {rank} received blocks [{offset}, {}) from {source}",
                    offset + count
                );
                if count == 0 {
                    continue;
                }
                accumulated.admit(offset, count)?;
                match dest.as_deref_mut() {
                    Some(dest) => place_range(dest, layout, offset..offset + count, &hole, payload)?,
                    None => outgoing.extend_from_slice(payload),
                }
            }
            Step::Send(partner) => {
                let range = accumulated.range();
                outgoing[..GATHER_HEADER_LEN]
                    .copy_from_slice(&encode_range(range.start, range.end - range.start));
                transport.send(&outgoing, topology.absolute_index_of(partner), tag)?;
            }
        }
    }

    if topology.is_host() {
        // The received ranges cover everything up to the host's range or beyond it.
        let end = match &hole {
            Some(hole) if accumulated.end == hole.start => hole.end,
            _ => accumulated.end,
        };
        if end != layout.total_blocks {
            return Err(Error::GatherIncomplete {
                start: 0,
                end: end as i64,
                expected: layout.total_blocks as i64,
            });
        }
        debug!(
            "gather: {} blocks of {} bytes from {} processes",
            layout.total_blocks,
            block,
            topology.total()
        );
    }
    Ok(())
}
