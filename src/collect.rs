//! Whole-buffer hypercube reduction to the host.

use log::{debug, trace};

use crate::{
    combine::combine,
    element::{as_bytes_mut, Element},
    error::{Error, Result},
    hypercube::{Schedule, Step},
    op::{data_len, CombineOp, Operator},
    transport::{Tag, Transport},
};

/// Reduce `buffer` over all processes onto the host.
///
/// Every process calls this with the same `ops` and a buffer of the same
/// length. Afterwards the host's buffer holds the combination of all buffers.
/// The other processes are left with partial results that carry no meaning.
pub fn reduce<T: Transport + ?Sized>(
    transport: &T,
    buffer: &mut [u8],
    ops: &[CombineOp],
    tag: Tag,
) -> Result<()> {
    let needed = data_len(ops)?;
    if needed > buffer.len() {
        return Err(Error::BufferOverrun {
            context: "reduce buffer",
            needed,
            available: buffer.len(),
        });
    }

    let topology = *transport.topology();
    let mut incoming = Vec::new();

    for step in Schedule::new(topology.rank(), topology.total()) {
        match step {
            Step::Send(partner) => {
                let dest = topology.absolute_index_of(partner);
                trace!("reduce: {} sends to {dest}", topology.self_index());
                transport.send(buffer, dest, tag)?;
            }
            Step::Receive(partner) => {
                let source = topology.absolute_index_of(partner);
                trace!("reduce: {} receives from {source}", topology.self_index());
                incoming.resize(buffer.len(), 0);
                let received = transport.receive(&mut incoming, source, tag)?;
                if received != buffer.len() {
                    return Err(Error::LengthMismatch {
                        source_index: source,
                        expected: buffer.len(),
                        received,
                    });
                }
                combine(buffer, &incoming, ops)?;
            }
        }
    }

    if topology.is_host() {
        debug!(
            "reduce: {} bytes combined over {} processes",
            buffer.len(),
            topology.total()
        );
    }
    Ok(())
}

/// Reduce onto the host, then broadcast the result to every process.
pub fn reduce_to_all<T: Transport + ?Sized>(
    transport: &T,
    buffer: &mut [u8],
    ops: &[CombineOp],
    tag: Tag,
) -> Result<()> {
    reduce(transport, buffer, ops, tag)?;
    transport.broadcast(buffer, transport.topology().host_index())
}

/// Reduce a typed slice onto the host with a single operator.
pub fn reduce_elements<E: Element, T: Transport + ?Sized>(
    transport: &T,
    data: &mut [E],
    operator: Operator,
    tag: Tag,
) -> Result<()> {
    let ops = CombineOp::split(operator, E::TYPE, data.len());
    reduce(transport, as_bytes_mut(data), &ops, tag)
}
