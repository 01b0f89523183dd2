//! Sum many scattered contributions through a collection session.

use hypercollect::{
    config::SessionConfig,
    element::as_bytes_mut,
    op::{CombineOp, ElementType, Operator},
    session::CollectionSession,
    transport::{mpi::MpiTransport, Transport},
    OrAbort,
};
use mpi::traits::Communicator;

const CELLS: usize = 64;
const CELL_LEN: usize = 37;

pub fn main() {
    env_logger::init();
    let universe = mpi::initialize().unwrap();
    let comm = universe.world();
    let size = comm.size() as usize;
    let rank = comm.rank() as usize;
    let transport = MpiTransport::new(&comm, 0).unwrap();

    // Each cell holds a running count in f64 and a maximum rank in i32.
    let mut weights = vec![vec![0f64; CELL_LEN]; CELLS];
    let mut owners = vec![vec![0i32; CELL_LEN]; CELLS];
    for (weight, owner) in weights.iter_mut().zip(owners.iter_mut()) {
        weight.fill(rank as f64 + 1.0);
        owner.fill(rank as i32);
    }

    // A small buffer forces many intermediate flushes.
    let config = SessionConfig::new(21).capacity(256);
    let mut session = CollectionSession::open(&transport, config).or_abort(&transport);
    for (weight, owner) in weights.iter_mut().zip(owners.iter_mut()) {
        session
            .contribute_elements(&mut weight[..], Operator::Add)
            .or_abort(&transport);
        session
            .contribute(
                Some(as_bytes_mut(&mut owner[..])),
                &[CombineOp::max(ElementType::I32, CELL_LEN as u16)],
            )
            .or_abort(&transport);
    }
    let batches = session.batches();
    session.close().or_abort(&transport);

    if transport.topology().is_host() {
        let expected = (size * (size + 1) / 2) as f64;
        assert!(weights.iter().flatten().all(|&w| w == expected));
        assert!(owners.iter().flatten().all(|&o| o == size as i32 - 1));
        println!(
            "Session over {size} processes combined {} cells, {batches} batches before close.",
            2 * CELLS
        );
    }
}
