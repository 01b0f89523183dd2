//! Transport over an MPI communicator.

use ::mpi::traits::{
    Communicator, CommunicatorCollectives, Destination, Equivalence, Root, Source,
};

use crate::{
    error::{Error, Result},
    topology::ProcessTopology,
    transport::{Tag, Transport},
};

/// Transport built on an MPI communicator.
///
/// The MPI rank of a process is its absolute index.
pub struct MpiTransport<'c, C> {
    comm: &'c C,
    topology: ProcessTopology,
}

impl<'c, C: CommunicatorCollectives> MpiTransport<'c, C> {
    /// Wrap `comm`, with the process of rank `host_index` as host.
    pub fn new(comm: &'c C, host_index: usize) -> Result<Self> {
        let topology = ProcessTopology::new(comm.size() as usize, comm.rank() as usize, host_index)?;
        Ok(Self { comm, topology })
    }

    /// The wrapped communicator.
    pub fn comm(&self) -> &C {
        self.comm
    }
}

impl<C: CommunicatorCollectives> Transport for MpiTransport<'_, C> {
    fn topology(&self) -> &ProcessTopology {
        &self.topology
    }

    fn send(&self, buf: &[u8], dest: usize, tag: Tag) -> Result<()> {
        self.comm.process_at_rank(dest as i32).send_with_tag(buf, tag);
        Ok(())
    }

    fn receive(&self, buf: &mut [u8], source: usize, tag: Tag) -> Result<usize> {
        let status = self
            .comm
            .process_at_rank(source as i32)
            .receive_into_with_tag(buf, tag);
        let count = status.count(u8::equivalent_datatype());
        usize::try_from(count)
            .map_err(|_| Error::transport(count, format!("receive from process {source}")))
    }

    fn probe(&self, tag: Tag) -> Result<bool> {
        Ok(self
            .comm
            .any_process()
            .immediate_probe_with_tag(tag)
            .is_some())
    }

    fn broadcast(&self, buf: &mut [u8], root: usize) -> Result<()> {
        self.comm.process_at_rank(root as i32).broadcast_into(buf);
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        self.comm.barrier();
        Ok(())
    }

    fn abort(&self, code: i32) -> ! {
        self.comm.abort(code)
    }
}
