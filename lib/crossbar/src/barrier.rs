//! N-node barrier composed from a gather and a release rendezvous.
//!
//! The leader (position 0) waits for every follower's signal, then
//! broadcasts the release; followers signal and wait. Signal descriptors
//! are one-shot, so each round reopens the signalling side.

use crate::noc::NodeId;
use crate::runtime::Runtime;
use crate::shared::IpcResult;
use crate::sync::{SyncMode, Syncid};

pub struct Barrier<'rt> {
    rt: &'rt Runtime,
    nodes: Vec<NodeId>,
    leader: bool,
    gather: Syncid,
    release: Syncid,
}

impl<'rt> Barrier<'rt> {
    /// Builds this node's side of a barrier over `nodes`. Every participant
    /// must call with the same list; the node at position 0 leads.
    pub fn create(rt: &'rt Runtime, nodes: &[NodeId]) -> IpcResult<Barrier<'rt>> {
        let leader = nodes.first().copied() == Some(rt.node());

        let (gather, release) = if leader {
            let gather = rt.sync_create(nodes, SyncMode::AllToOne)?;
            let release = match rt.sync_open(nodes, SyncMode::OneToAll) {
                Ok(release) => release,
                Err(err) => {
                    rt.sync_unlink(gather)?;
                    return Err(err);
                }
            };

            (gather, release)
        } else {
            let gather = rt.sync_open(nodes, SyncMode::AllToOne)?;
            let release = match rt.sync_create(nodes, SyncMode::OneToAll) {
                Ok(release) => release,
                Err(err) => {
                    rt.sync_close(gather)?;
                    return Err(err);
                }
            };

            (gather, release)
        };

        Ok(Barrier {
            rt,
            nodes: nodes.to_vec(),
            leader,
            gather,
            release,
        })
    }

    /// Blocks until every participant has reached the barrier.
    pub fn wait(&mut self) -> IpcResult<()> {
        if self.leader {
            self.rt.sync_wait(self.gather)?;
            self.rt.sync_signal(self.release)?;

            self.rt.sync_close(self.release)?;
            self.release = self.rt.sync_open(&self.nodes, SyncMode::OneToAll)?;
        } else {
            self.rt.sync_signal(self.gather)?;

            self.rt.sync_close(self.gather)?;
            self.gather = self.rt.sync_open(&self.nodes, SyncMode::AllToOne)?;

            self.rt.sync_wait(self.release)?;
        }

        Ok(())
    }

    /// Tears the barrier down.
    pub fn unlink(self) -> IpcResult<()> {
        if self.leader {
            self.rt.sync_unlink(self.gather)?;
            self.rt.sync_close(self.release)?;
        } else {
            self.rt.sync_close(self.gather)?;
            self.rt.sync_unlink(self.release)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Loopback;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_barrier_over_two_rounds() {
        let fabric = Arc::new(Loopback::new());
        let group: Vec<NodeId> = [2usize, 3, 4]
            .iter()
            .map(|&raw| NodeId::new(raw).unwrap())
            .collect();

        let arrivals = Arc::new([AtomicUsize::new(0), AtomicUsize::new(0)]);

        let mut threads = Vec::new();

        for &node in &group {
            let fabric = fabric.clone();
            let group = group.clone();
            let arrivals = arrivals.clone();

            threads.push(thread::spawn(move || {
                let rt =
                    Runtime::setup(Arc::new(fabric.attach(node)), node, None).unwrap();
                let mut barrier = Barrier::create(&rt, &group).unwrap();

                for round in 0..2 {
                    arrivals[round].fetch_add(1, Ordering::SeqCst);
                    barrier.wait().unwrap();

                    // Nobody passes the barrier before everyone arrived.
                    assert_eq!(arrivals[round].load(Ordering::SeqCst), group.len());
                }

                barrier.unlink().unwrap();
                rt.shutdown().unwrap();
            }));
        }

        for thread in threads {
            thread.join().unwrap();
        }
    }
}
