//! Reduce random data over all MPI processes and check the result.

use hypercollect::{
    collect::{reduce_elements, reduce_to_all},
    element::Element,
    op::{CombineOp, ElementType, Operator},
    tools::{random_elements, seeded_rng},
    transport::{mpi::MpiTransport, Transport},
    OrAbort,
};
use mpi::traits::{Communicator, CommunicatorCollectives};

const LEN: usize = 100;

fn local_values(rank: usize) -> Vec<u64> {
    let mut rng = seeded_rng(rank);
    random_elements::<u32, _>(LEN, &mut rng)
        .into_iter()
        .map(u64::from)
        .collect()
}

pub fn main() {
    env_logger::init();
    let universe = mpi::initialize().unwrap();
    let comm = universe.world();
    let size = comm.size() as usize;
    let rank = comm.rank() as usize;
    let transport = MpiTransport::new(&comm, 0).unwrap();

    let mut values = local_values(rank);
    reduce_elements(&transport, &mut values, Operator::Add, 1).or_abort(&transport);

    if transport.topology().is_host() {
        let mut expected = vec![0u64; LEN];
        for other in 0..size {
            for (e, v) in expected.iter_mut().zip(local_values(other)) {
                *e += v;
            }
        }
        assert_eq!(values, expected);
        println!("Sum of {LEN} values over {size} processes is correct.");
    }

    // A maximum and a bitwise OR in one buffer, result on every process.
    let ops = [
        CombineOp::max(ElementType::I32, 1),
        CombineOp::or(ElementType::U32, 1),
    ];
    let mut buffer = [0u8; 8];
    (rank as i32).store(&mut buffer[..4]);
    (1u32 << (rank % 32)).store(&mut buffer[4..]);
    reduce_to_all(&transport, &mut buffer, &ops, 2).or_abort(&transport);

    let expected_bits = (0..size).fold(0u32, |bits, r| bits | (1 << (r % 32)));
    assert_eq!(i32::load(&buffer[..4]), size as i32 - 1);
    assert_eq!(u32::load(&buffer[4..]), expected_bits);

    comm.barrier();
    if rank == 0 {
        println!("Reduction to all processes is correct.");
    }
}
