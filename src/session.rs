//! Buffered reductions assembled from many small contributions.
//!
//! A [`CollectionSession`] copies contributions into a write buffer as
//! self-describing records:
//!
//! ```text
//! [header: code u16, count u16][padding][count * width data bytes]
//! ```
//!
//! Records start on 4 byte boundaries and their data on a boundary of the
//! element width. The group field of the header holds the index of the
//! destination the data came from. When the buffer is full, or on
//! [`flush`](CollectionSession::flush) and [`close`](CollectionSession::close),
//! the buffers of all processes are combined along the hypercube schedule and
//! the host copies the combined records back into its destinations.
//!
//! All processes must make the same sequence of calls with the same
//! descriptors and the same configuration, so that every buffer fills and
//! flushes at the same points.

use std::ops::Range;

use log::{debug, trace, warn};

use crate::{
    combine::apply,
    config::SessionConfig,
    element::{as_bytes_mut, Element},
    error::{Error, Result},
    hypercube::{Schedule, Step},
    op::{data_len, expand, CombineOp, Operator, GROUP_MAX, HEADER_LEN},
    transport::Transport,
};

/// Maximum number of destinations between two flushes.
pub const MAX_DESTINATIONS: usize = GROUP_MAX as usize + 1;

const RECORD_ALIGN: usize = 4;

fn align_up(offset: usize, align: usize) -> usize {
    offset.div_ceil(align) * align
}

struct Destination<'a> {
    data: &'a mut [u8],
    packed: usize,
    scattered: usize,
}

struct Record {
    offset: usize,
    op: CombineOp,
    data: Range<usize>,
}

/// Walk the records of a packed buffer.
fn records(buf: &[u8]) -> impl Iterator<Item = Result<Record>> + '_ {
    let mut offset = 0;
    let mut failed = false;
    std::iter::from_fn(move || {
        let start = align_up(offset, RECORD_ALIGN);
        if failed || start >= buf.len() {
            return None;
        }
        let record = CombineOp::from_header(&buf[start..]).and_then(|op| {
            let data_start = align_up(start + HEADER_LEN, op.element_type.width());
            let end = data_start + op.byte_len();
            if end > buf.len() {
                return Err(Error::BufferOverrun {
                    context: "session record",
                    needed: end,
                    available: buf.len(),
                });
            }
            Ok(Record {
                offset: start,
                op,
                data: data_start..end,
            })
        });
        match &record {
            Ok(rec) => offset = rec.data.end,
            Err(_) => failed = true,
        }
        Some(record)
    })
}

fn header_word(bytes: &[u8]) -> u32 {
    u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Combine the records of `remote` into `local`, or with `replace` copy them.
///
/// The records of `local` decide the layout. `remote` must carry the same
/// headers at the same offsets and end where `local` ends. A header that
/// differs or is missing is reported before any length difference.
fn merge_records(local: &mut [u8], remote: &[u8], source: usize, replace: bool) -> Result<()> {
    let mut end = 0;
    for record in records(local).collect::<Vec<_>>() {
        let Record { offset, op, data } = record?;
        let header = offset..offset + HEADER_LEN;
        let remote_header = remote.get(header.clone()).map_or(0, header_word);
        if remote.len() < header.end || local[header.clone()] != remote[header.clone()] {
            return Err(Error::HeaderMismatch {
                offset,
                local: header_word(&local[header]),
                remote: remote_header,
            });
        }
        if data.end > remote.len() {
            break;
        }
        end = data.end;
        if replace {
            if op.operator != Operator::NoOp {
                local[data.clone()].copy_from_slice(&remote[data]);
            }
        } else {
            apply(
                op.operator,
                op.element_type,
                &mut local[data.clone()],
                &remote[data],
            )?;
        }
    }

    if end == local.len() && remote.len() > local.len() {
        // The remote side packed more records.
        let offset = align_up(local.len(), RECORD_ALIGN);
        if let Some(header) = remote.get(offset..offset + HEADER_LEN) {
            return Err(Error::HeaderMismatch {
                offset,
                local: 0,
                remote: header_word(header),
            });
        }
    }
    if remote.len() != local.len() {
        return Err(Error::LengthMismatch {
            source_index: source,
            expected: local.len(),
            received: remote.len(),
        });
    }
    Ok(())
}

/// A reduction assembled from many contributions.
///
/// Destinations are borrowed for the lifetime of the session. Each one is
/// read when its contributions are packed and, on the host, overwritten with
/// the combined values when the batch holding them is flushed.
pub struct CollectionSession<'t, 'a, T: Transport + ?Sized> {
    transport: &'t T,
    config: SessionConfig,
    write_buf: Vec<u8>,
    read_buf: Vec<u8>,
    write_offset: usize,
    destinations: Vec<Destination<'a>>,
    batches: usize,
}

impl<'t, 'a, T: Transport + ?Sized> CollectionSession<'t, 'a, T> {
    /// Open a session. Collective: every process opens with the same config.
    pub fn open(transport: &'t T, config: SessionConfig) -> Result<Self> {
        config.validate(transport.topology())?;
        Ok(Self {
            transport,
            config,
            write_buf: vec![0; config.capacity],
            read_buf: vec![0; config.capacity],
            write_offset: 0,
            destinations: Vec::new(),
            batches: 0,
        })
    }

    /// The session settings.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Number of bytes waiting in the write buffer.
    pub fn pending(&self) -> usize {
        self.write_offset
    }

    /// Number of batches exchanged so far.
    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Contribute the data described by `ops`.
    ///
    /// With `Some(dest)` the data is read from the start of `dest`, which
    /// becomes the current destination. With `None` it continues in the
    /// current destination where the previous contribution stopped.
    pub fn contribute(&mut self, dest: Option<&'a mut [u8]>, ops: &[CombineOp]) -> Result<()> {
        let needed = data_len(ops)?;

        match dest {
            Some(data) => {
                if needed > data.len() {
                    return Err(Error::BufferOverrun {
                        context: "session destination",
                        needed,
                        available: data.len(),
                    });
                }
                if self.destinations.len() == MAX_DESTINATIONS {
                    return Err(Error::TooManyDestinations {
                        limit: MAX_DESTINATIONS,
                    });
                }
                self.destinations.push(Destination {
                    data,
                    packed: 0,
                    scattered: 0,
                });
            }
            None => {
                let current = self
                    .destinations
                    .last()
                    .ok_or(Error::MissingDestination)?;
                if current.packed + needed > current.data.len() {
                    return Err(Error::BufferOverrun {
                        context: "session destination",
                        needed: current.packed + needed,
                        available: current.data.len(),
                    });
                }
            }
        }

        for op in expand(ops) {
            self.pack(op?)?;
        }
        Ok(())
    }

    /// Contribute a whole typed slice with a single operator.
    pub fn contribute_elements<E: Element>(
        &mut self,
        data: &'a mut [E],
        operator: Operator,
    ) -> Result<()> {
        let ops = CombineOp::split(operator, E::TYPE, data.len());
        self.contribute(Some(as_bytes_mut(data)), &ops)
    }

    fn pack(&mut self, op: CombineOp) -> Result<()> {
        let width = op.element_type.width();
        let mut remaining = op.count as usize;

        while remaining > 0 {
            let start = align_up(self.write_offset, RECORD_ALIGN);
            let data_start = align_up(start + HEADER_LEN, width);
            let room = self.config.capacity.saturating_sub(data_start) / width;
            if room == 0 {
                self.flush()?;
                continue;
            }

            let count = room.min(remaining);
            let bytes = count * width;
            let index = self
                .destinations
                .len()
                .checked_sub(1)
                .ok_or(Error::MissingDestination)?;
            let dest = &mut self.destinations[index];

            let header = CombineOp::new(op.operator, op.element_type, count as u16)
                .with_group(index as u16)
                .to_header();
            self.write_buf[self.write_offset..start].fill(0);
            self.write_buf[start..start + HEADER_LEN].copy_from_slice(&header);
            self.write_buf[start + HEADER_LEN..data_start].fill(0);
            self.write_buf[data_start..data_start + bytes]
                .copy_from_slice(&dest.data[dest.packed..dest.packed + bytes]);

            dest.packed += bytes;
            self.write_offset = data_start + bytes;
            remaining -= count;
        }
        Ok(())
    }

    fn exchange(&mut self, rank: usize, size: usize, index_of: impl Fn(usize) -> usize) -> Result<()> {
        let len = self.write_offset;
        let tag = self.config.tag;

        for step in Schedule::new(rank, size) {
            match step {
                Step::Send(partner) => {
                    trace!("session: rank {rank} sends {len} bytes to rank {partner}");
                    self.transport
                        .send(&self.write_buf[..len], index_of(partner), tag)?;
                }
                Step::Receive(partner) => {
                    trace!("session: rank {rank} receives from rank {partner}");
                    self.merge_batch(index_of(partner), false)?;
                }
            }
        }
        Ok(())
    }

    /// Receive the batch of `source` and merge it into the write buffer.
    ///
    /// The whole read buffer is offered to the transport, so a batch of a
    /// different length still arrives and its headers can be compared.
    fn merge_batch(&mut self, source: usize, replace: bool) -> Result<()> {
        let len = self.write_offset;
        let received = self
            .transport
            .receive(&mut self.read_buf, source, self.config.tag)?;
        merge_records(
            &mut self.write_buf[..len],
            &self.read_buf[..received],
            source,
            replace,
        )
    }

    fn scatter(&mut self) -> Result<()> {
        for record in records(&self.write_buf[..self.write_offset]) {
            let Record { op, data, .. } = record?;
            let dest = self
                .destinations
                .get_mut(op.group as usize)
                .ok_or(Error::MissingDestination)?;
            let end = dest.scattered + data.len();
            if op.operator != Operator::NoOp {
                dest.data[dest.scattered..end].copy_from_slice(&self.write_buf[data]);
            }
            dest.scattered = end;
        }
        Ok(())
    }

    /// Combine the pending batch and scatter it on the host. Collective.
    ///
    /// The current destination stays registered, so a following contribution
    /// may still continue it with `None`.
    pub fn flush(&mut self) -> Result<()> {
        let len = self.write_offset;
        if len > 0 {
            let topology = *self.transport.topology();

            if self.config.include_host {
                self.exchange(topology.rank(), topology.total(), |rank| {
                    topology.absolute_index_of(rank)
                })?;
            } else if topology.is_host() {
                // The group of other processes ends on its lowest index.
                self.merge_batch(topology.absolute_index_of(1), true)?;
            } else {
                let rank = topology.rank() - 1;
                self.exchange(rank, topology.total() - 1, |rank| {
                    topology.absolute_index_of(rank + 1)
                })?;
                if rank == 0 {
                    self.transport.send(
                        &self.write_buf[..len],
                        topology.host_index(),
                        self.config.tag,
                    )?;
                }
            }

            if topology.is_host() {
                self.scatter()?;
            }
            self.batches += 1;
            debug!(
                "session (tag {}): batch {} of {len} bytes, {} destinations",
                self.config.tag,
                self.batches,
                self.destinations.len()
            );
        }

        self.write_offset = 0;
        if let Some(current) = self.destinations.pop() {
            self.destinations.clear();
            self.destinations.push(Destination {
                scattered: current.packed,
                ..current
            });
        }
        Ok(())
    }

    /// Flush what is pending and end the session. Collective.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }
}

impl<T: Transport + ?Sized> Drop for CollectionSession<'_, '_, T> {
    fn drop(&mut self) {
        if self.write_offset > 0 {
            warn!(
                "session (tag {}) dropped with {} unflushed bytes",
                self.config.tag, self.write_offset
            );
        }
    }
}

#[cfg(test)]
mod test {
    use itertools::Itertools;

    use super::{merge_records, CollectionSession, MAX_DESTINATIONS};
    use crate::{
        config::SessionConfig,
        element::{as_bytes_mut, Element},
        error::{Error, Result},
        op::{CombineOp, ElementType, Operator},
        tools::{random_elements, seeded_rng},
        transport::{local::LocalTransport, Transport},
    };

    const LEN: usize = 1000;

    fn local_values(index: usize) -> Vec<i32> {
        let mut rng = seeded_rng(17 + index);
        random_elements::<i16, _>(LEN, &mut rng)
            .into_iter()
            .map(i32::from)
            .collect()
    }

    fn chunked_sum(total: usize, capacity: usize, chunk: usize) -> Vec<i32> {
        let _ = env_logger::builder().is_test(true).try_init();
        let results = LocalTransport::run(total, 0, |transport| {
            let mut data = local_values(transport.topology().self_index());
            let config = SessionConfig::new(9).capacity(capacity);
            let mut session = CollectionSession::open(&transport, config).unwrap();

            let mut sizes = (0..LEN).step_by(chunk).map(|start| (LEN - start).min(chunk));
            let first = sizes.next().unwrap();
            session
                .contribute(
                    Some(as_bytes_mut(&mut data)),
                    &[CombineOp::add(ElementType::I32, first as u16)],
                )
                .unwrap();
            for size in sizes {
                session
                    .contribute(None, &[CombineOp::add(ElementType::I32, size as u16)])
                    .unwrap();
            }
            session.close().unwrap();
            data
        })
        .unwrap();
        results.into_iter().next().unwrap()
    }

    #[test]
    fn test_chunking_invariance() {
        let total = 5;
        let values = (0..total).map(local_values).collect_vec();
        let expected = (0..LEN)
            .map(|i| values.iter().map(|v| v[i]).sum::<i32>())
            .collect_vec();

        for capacity in [16, 20, 64, 4096] {
            for chunk in [1, 7, 1000] {
                assert_eq!(
                    chunked_sum(total, capacity, chunk),
                    expected,
                    "capacity {capacity}, chunk {chunk}"
                );
            }
        }
    }

    #[test]
    fn test_small_buffer_flushes_automatically() {
        LocalTransport::run(3, 1, |transport| {
            let mut data = vec![1.0f64; 10];
            let config = SessionConfig::new(0).capacity(16);
            let mut session = CollectionSession::open(&transport, config).unwrap();
            session
                .contribute_elements(&mut data, Operator::Add)
                .unwrap();
            // One f64 per 16 byte buffer, the last one is still pending.
            assert_eq!(session.batches(), 9);
            assert_eq!(session.pending(), 16);
            session.close().unwrap();

            if transport.topology().is_host() {
                assert_eq!(data, vec![3.0; 10]);
            }
        })
        .unwrap();
    }

    #[test]
    fn test_multi_destination_scatter() {
        let results = LocalTransport::run(4, 3, |transport| {
            let index = transport.topology().self_index();
            let mut sums = vec![index as i32; 5];
            let mut maxima = vec![index as f64, -(index as f64), 0.5];
            // Two destinations cut from one buffer, with a gap between them.
            let mut shared = vec![index as u32; 10];

            {
                let (low, rest) = shared.split_at_mut(3);
                let high = &mut rest[4..];
                let mut session =
                    CollectionSession::open(&transport, SessionConfig::new(2)).unwrap();
                session
                    .contribute(
                        Some(as_bytes_mut(&mut sums)),
                        &[CombineOp::add(ElementType::I32, 5)],
                    )
                    .unwrap();
                session
                    .contribute(
                        Some(as_bytes_mut(&mut maxima)),
                        &[CombineOp::max(ElementType::F64, 3)],
                    )
                    .unwrap();
                session.contribute_elements(low, Operator::Add).unwrap();
                session.contribute_elements(high, Operator::Max).unwrap();
                session.close().unwrap();
            }
            (index, sums, maxima, shared)
        })
        .unwrap();

        for (index, sums, maxima, shared) in results {
            assert_eq!(&shared[3..7], &[index as u32; 4]);
            if index == 3 {
                assert_eq!(sums, vec![6; 5]);
                assert_eq!(maxima, vec![3.0, 0.0, 0.5]);
                assert_eq!(&shared[..3], &[6; 3]);
                assert_eq!(&shared[7..], &[3; 3]);
            } else {
                assert_eq!(sums, vec![index as i32; 5]);
                assert_eq!(maxima[0], index as f64);
                assert_eq!(&shared[..3], &[index as u32; 3]);
            }
        }
    }

    #[test]
    fn test_interleaved_destinations_and_noop() {
        // A record of i8 counters, a skipped f32 and a u64 flag word, repeated three times.
        let ops = [
            CombineOp::repeat(3, 3),
            CombineOp::add(ElementType::I8, 3),
            CombineOp::noop(ElementType::F32, 1),
            CombineOp::or(ElementType::U64, 1),
        ];
        let record_len = 3 + 4 + 8;

        let results = LocalTransport::run(3, 0, |transport| {
            let index = transport.topology().self_index();
            let mut records = vec![0u8; 3 * record_len];
            for record in records.chunks_exact_mut(record_len) {
                record[0..3].copy_from_slice(&[1, 2, index as u8]);
                (index as f32).store(&mut record[3..7]);
                (1u64 << (8 * index)).store(&mut record[7..15]);
            }
            let mut extra = [index as i64 + 1];

            let config = SessionConfig::new(6).capacity(24);
            let mut session = CollectionSession::open(&transport, config).unwrap();
            session.contribute(Some(&mut records[..]), &ops).unwrap();
            session.contribute_elements(&mut extra, Operator::Max).unwrap();
            session.close().unwrap();
            (records, extra)
        })
        .unwrap();

        let (records, extra) = &results[0];
        for record in records.chunks_exact(record_len) {
            assert_eq!(&record[0..3], &[3, 6, 3]);
            assert_eq!(f32::load(&record[3..7]), 0.0);
            assert_eq!(u64::load(&record[7..15]), 0x010101);
        }
        assert_eq!(extra, &[3]);
    }

    #[test]
    fn test_host_contribution_excluded() {
        let results = LocalTransport::run(4, 2, |transport| {
            let index = transport.topology().self_index();
            let mut data = if transport.topology().is_host() {
                vec![1_000_000i64; 3]
            } else {
                vec![index as i64, 1, -(index as i64)]
            };
            let config = SessionConfig::new(4).capacity(32).include_host(false);
            let mut session = CollectionSession::open(&transport, config).unwrap();
            session.contribute_elements(&mut data, Operator::Add).unwrap();
            session.close().unwrap();
            data
        })
        .unwrap();

        assert_eq!(results[2], vec![4, 3, -4]);
    }

    #[test]
    fn test_repeat_group_matches_literal_sequence() {
        let a = CombineOp::add(ElementType::U32, 2);
        let b = CombineOp::min(ElementType::I16, 1);
        let grouped = [CombineOp::repeat(2, 5), a, b];
        let literal = [a, b].repeat(5);

        let run = |ops: &[CombineOp]| {
            LocalTransport::run(3, 0, |transport| {
                let mut rng = seeded_rng(transport.topology().self_index());
                let mut data: Vec<u8> = random_elements(50, &mut rng);
                let mut session =
                    CollectionSession::open(&transport, SessionConfig::new(1).capacity(40))
                        .unwrap();
                session.contribute(Some(&mut data[..]), ops).unwrap();
                session.close().unwrap();
                data
            })
            .unwrap()
            .swap_remove(0)
        };

        assert_eq!(run(&grouped), run(&literal));
    }

    #[test]
    fn test_mismatched_descriptors_fail() {
        let results = LocalTransport::run(2, 0, |transport| -> Result<()> {
            let operator = if transport.topology().is_host() {
                Operator::Add
            } else {
                Operator::Max
            };
            let mut data = [1i32, 2];
            let mut session = CollectionSession::open(&transport, SessionConfig::new(8))?;
            session.contribute_elements(&mut data, operator)?;
            session.close()
        })
        .unwrap();

        assert!(matches!(results[0], Err(Error::HeaderMismatch { offset: 0, .. })));
        assert!(results[1].is_ok());
    }

    #[test]
    fn test_descriptor_length_differences_fail() {
        let two = vec![CombineOp::add(ElementType::I32, 2)];
        let three = vec![CombineOp::add(ElementType::I32, 3)];
        let extra = vec![
            CombineOp::add(ElementType::I32, 2),
            CombineOp::add(ElementType::I32, 1),
        ];

        for (host_ops, other_ops, offset) in [
            (&two, &three, 0),
            (&three, &two, 0),
            (&two, &extra, 12),
            (&extra, &two, 12),
        ] {
            let results = LocalTransport::run(2, 0, |transport| -> Result<()> {
                let ops = if transport.topology().is_host() {
                    host_ops
                } else {
                    other_ops
                };
                let mut data = [1u8; 16];
                let mut session = CollectionSession::open(&transport, SessionConfig::new(8))?;
                session.contribute(Some(&mut data[..]), ops)?;
                session.close()
            })
            .unwrap();

            match &results[0] {
                Err(Error::HeaderMismatch { offset: at, .. }) => assert_eq!(*at, offset),
                other => panic!("expected a descriptor mismatch at {offset}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_protocol_errors() {
        LocalTransport::run(1, 0, |transport| {
            let mut nested_target = [0u8; 16];
            let mut cells = vec![[0i32; 1]; MAX_DESTINATIONS + 1];

            let mut session = CollectionSession::open(&transport, SessionConfig::new(0)).unwrap();
            assert_eq!(
                session.contribute(None, &[CombineOp::add(ElementType::I32, 1)]),
                Err(Error::MissingDestination)
            );

            assert!(matches!(
                session.contribute(
                    Some(&mut nested_target[..]),
                    &[
                        CombineOp::repeat(1, 2),
                        CombineOp::repeat(1, 2),
                        CombineOp::add(ElementType::I8, 1)
                    ]
                ),
                Err(Error::NestedRepeatGroup { index: 1 })
            ));

            let mut result = Ok(());
            for cell in cells.iter_mut() {
                result = session.contribute_elements(&mut cell[..], Operator::Add);
                if result.is_err() {
                    break;
                }
            }
            assert_eq!(
                result,
                Err(Error::TooManyDestinations {
                    limit: MAX_DESTINATIONS
                })
            );
            session.close().unwrap();
        })
        .unwrap();

        assert_eq!(
            LocalTransport::run(1, 0, |transport| {
                CollectionSession::open(&transport, SessionConfig::new(0).capacity(4)).err()
            })
            .unwrap()[0],
            Some(Error::BufferTooSmall {
                capacity: 4,
                minimum: 16
            })
        );
    }

    #[test]
    fn test_merge_replace_skips_noop() {
        let mut local = vec![0u8; 16];
        let mut remote = vec![0u8; 16];
        let header = CombineOp::noop(ElementType::I32, 1).to_header();
        local[0..4].copy_from_slice(&header);
        remote[0..4].copy_from_slice(&header);
        7i32.store(&mut local[4..8]);
        9i32.store(&mut remote[4..8]);
        let header = CombineOp::add(ElementType::F64, 1).to_header();
        local[8..12].copy_from_slice(&header);
        remote[8..12].copy_from_slice(&header);
        // f64 data would start at 16, past the end of the buffer.
        assert!(merge_records(&mut local, &remote, 1, true).is_err());

        merge_records(&mut local[..8], &remote[..8], 1, true).unwrap();
        assert_eq!(i32::load(&local[4..8]), 7);
    }
}
