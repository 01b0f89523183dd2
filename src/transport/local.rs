//! In-process transport with one thread per process.
//!
//! Messages travel over `std::sync::mpsc` channels, one inbox per process.
//! Receives match on source and tag like MPI does; messages that arrive
//! before they are asked for wait in a per-process stash.

use std::{
    cell::RefCell,
    collections::VecDeque,
    sync::{
        mpsc::{channel, Receiver, Sender, TryRecvError},
        Arc, Barrier,
    },
    thread,
};

use crate::{
    error::{Error, Result},
    topology::ProcessTopology,
    transport::{Tag, Transport},
};

const BROADCAST_TAG: Tag = Tag::MIN;

struct Envelope {
    source: usize,
    tag: Tag,
    payload: Vec<u8>,
}

/// One process of a local group.
pub struct LocalTransport {
    topology: ProcessTopology,
    /// Senders to the other processes. A process holds no sender to its own
    /// inbox, so a receive fails once every peer has exited.
    outboxes: Vec<Option<Sender<Envelope>>>,
    inbox: Receiver<Envelope>,
    stash: RefCell<VecDeque<Envelope>>,
    barrier: Arc<Barrier>,
}

impl LocalTransport {
    /// Create the handles of a group of `total` processes, in index order.
    pub fn group(total: usize, host_index: usize) -> Result<Vec<Self>> {
        // Validates the arguments once for the whole group.
        ProcessTopology::new(total, 0, host_index)?;

        let (outboxes, inboxes): (Vec<_>, Vec<_>) = (0..total).map(|_| channel()).unzip();
        let barrier = Arc::new(Barrier::new(total));

        inboxes
            .into_iter()
            .enumerate()
            .map(|(index, inbox)| {
                Ok(Self {
                    topology: ProcessTopology::new(total, index, host_index)?,
                    outboxes: outboxes
                        .iter()
                        .enumerate()
                        .map(|(dest, outbox)| (dest != index).then(|| outbox.clone()))
                        .collect(),
                    inbox,
                    stash: RefCell::new(VecDeque::new()),
                    barrier: barrier.clone(),
                })
            })
            .collect()
    }

    /// Run `f` on every process of a group of `total`, one thread each.
    ///
    /// Returns the results in process index order. A panic on any process
    /// is propagated.
    pub fn run<R, F>(total: usize, host_index: usize, f: F) -> Result<Vec<R>>
    where
        R: Send,
        F: Fn(LocalTransport) -> R + Sync,
    {
        let group = Self::group(total, host_index)?;
        let f = &f;
        Ok(thread::scope(|scope| {
            let handles = group
                .into_iter()
                .map(|transport| scope.spawn(move || f(transport)))
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(result) => result,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        }))
    }

    fn take_stashed(&self, source: usize, tag: Tag) -> Option<Envelope> {
        let mut stash = self.stash.borrow_mut();
        let position = stash
            .iter()
            .position(|env| env.tag == tag && env.source == source)?;
        stash.remove(position)
    }

    fn wait_for(&self, source: usize, tag: Tag) -> Result<Envelope> {
        if let Some(envelope) = self.take_stashed(source, tag) {
            return Ok(envelope);
        }
        loop {
            let envelope = self.inbox.recv().map_err(|_| {
                Error::transport(-1, format!("receive from process {source}: group disconnected"))
            })?;
            if envelope.source == source && envelope.tag == tag {
                return Ok(envelope);
            }
            self.stash.borrow_mut().push_back(envelope);
        }
    }
}

impl Transport for LocalTransport {
    fn topology(&self) -> &ProcessTopology {
        &self.topology
    }

    fn send(&self, buf: &[u8], dest: usize, tag: Tag) -> Result<()> {
        let outbox = self
            .outboxes
            .get(dest)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::transport(-2, format!("no channel to process {dest}")))?;
        outbox
            .send(Envelope {
                source: self.topology.self_index(),
                tag,
                payload: buf.to_vec(),
            })
            .map_err(|_| Error::transport(-1, format!("send to process {dest}: inbox closed")))
    }

    fn receive(&self, buf: &mut [u8], source: usize, tag: Tag) -> Result<usize> {
        let envelope = self.wait_for(source, tag)?;
        let len = envelope.payload.len();
        if len > buf.len() {
            return Err(Error::transport(
                -3,
                format!(
                    "receive from process {source}: message of {len} bytes truncated to {}",
                    buf.len()
                ),
            ));
        }
        buf[..len].copy_from_slice(&envelope.payload);
        Ok(len)
    }

    fn probe(&self, tag: Tag) -> Result<bool> {
        loop {
            match self.inbox.try_recv() {
                Ok(envelope) => self.stash.borrow_mut().push_back(envelope),
                // Every peer has exited, only stashed messages remain.
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        Ok(self.stash.borrow().iter().any(|env| env.tag == tag))
    }

    fn broadcast(&self, buf: &mut [u8], root: usize) -> Result<()> {
        if self.topology.self_index() == root {
            for dest in (0..self.topology.total()).filter(|&dest| dest != root) {
                self.send(buf, dest, BROADCAST_TAG)?;
            }
            Ok(())
        } else {
            let len = self.receive(buf, root, BROADCAST_TAG)?;
            if len != buf.len() {
                return Err(Error::LengthMismatch {
                    source_index: root,
                    expected: buf.len(),
                    received: len,
                });
            }
            Ok(())
        }
    }

    fn barrier(&self) -> Result<()> {
        self.barrier.wait();
        Ok(())
    }

    fn abort(&self, code: i32) -> ! {
        panic!(
            "process {} aborted the computation with code {code}",
            self.topology.self_index()
        )
    }
}

#[cfg(test)]
mod test {
    use super::LocalTransport;
    use crate::transport::Transport;

    #[test]
    fn test_ring() {
        let received = LocalTransport::run(4, 0, |transport| {
            let topology = *transport.topology();
            let next = (topology.self_index() + 1) % topology.total();
            let prev = (topology.self_index() + topology.total() - 1) % topology.total();

            transport
                .send(&[topology.self_index() as u8], next, 3)
                .unwrap();
            let mut buf = [0u8; 4];
            let len = transport.receive(&mut buf, prev, 3).unwrap();
            assert_eq!(len, 1);
            buf[0]
        })
        .unwrap();

        assert_eq!(received, vec![3, 0, 1, 2]);
    }

    #[test]
    fn test_tag_matching_out_of_order() {
        LocalTransport::run(2, 0, |transport| {
            if transport.topology().self_index() == 0 {
                transport.send(&[1], 1, 10).unwrap();
                transport.send(&[2], 1, 20).unwrap();
            } else {
                let mut buf = [0u8; 1];
                transport.receive(&mut buf, 0, 20).unwrap();
                assert_eq!(buf[0], 2);
                assert!(transport.probe(10).unwrap());
                transport.receive(&mut buf, 0, 10).unwrap();
                assert_eq!(buf[0], 1);
                assert!(!transport.probe(10).unwrap());
            }
        })
        .unwrap();
    }

    #[test]
    fn test_broadcast_and_barrier() {
        let values = LocalTransport::run(3, 2, |transport| {
            let mut buf = if transport.topology().is_host() {
                [7u8, 8]
            } else {
                [0u8, 0]
            };
            transport.broadcast(&mut buf, 2).unwrap();
            transport.barrier().unwrap();
            buf
        })
        .unwrap();

        assert!(values.iter().all(|buf| *buf == [7, 8]));
    }

    #[test]
    fn test_truncated_receive_fails() {
        LocalTransport::run(2, 0, |transport| {
            if transport.topology().self_index() == 0 {
                transport.send(&[1, 2, 3], 1, 0).unwrap();
            } else {
                let mut buf = [0u8; 2];
                assert!(transport.receive(&mut buf, 0, 0).is_err());
            }
        })
        .unwrap();
    }

    #[test]
    fn test_receive_fails_after_peers_exit() {
        let results = LocalTransport::run(2, 0, |transport| {
            let mut buf = [0u8; 1];
            match transport.topology().self_index() {
                0 => Ok(0),
                _ => transport.receive(&mut buf, 0, 4),
            }
        })
        .unwrap();
        assert!(results[1].is_err());
    }

    #[test]
    #[should_panic(expected = "aborted the computation with code 6")]
    fn test_abort_panics() {
        let group = LocalTransport::group(1, 0).unwrap();
        group[0].abort(6);
    }
}
