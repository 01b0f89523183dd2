//! Gather a block-distributed array onto the host.

use hypercollect::{
    config::GatherLayout,
    element::{as_bytes, as_bytes_mut},
    gather::gather,
    tools::block_range,
    transport::{mpi::MpiTransport, Transport},
    OrAbort,
};
use mpi::traits::Communicator;

const TOTAL: usize = 10_000;

pub fn main() {
    env_logger::init();
    let universe = mpi::initialize().unwrap();
    let comm = universe.world();
    let size = comm.size() as usize;
    let rank = comm.rank() as usize;
    let transport = MpiTransport::new(&comm, 0).unwrap();

    // Blocks are pairs of (index, square).
    let (offset, count) = block_range(TOTAL, size, rank);
    let local = (offset..offset + count)
        .flat_map(|i| [i as u64, (i * i) as u64])
        .collect::<Vec<_>>();

    let layout = GatherLayout::new(offset, count, 16, TOTAL);
    let mut result = vec![0u64; 2 * TOTAL];
    let dest = transport
        .topology()
        .is_host()
        .then_some(as_bytes_mut(&mut result));
    gather(&transport, dest, as_bytes(&local), &layout, 31).or_abort(&transport);

    if transport.topology().is_host() {
        for (i, pair) in result.chunks_exact(2).enumerate() {
            assert_eq!(pair, [i as u64, (i * i) as u64]);
        }
        println!("Gathered {TOTAL} blocks from {size} processes.");
    }
}
