//! Sync connector: N-to-1 and 1-to-N rendezvous over bitmask words.
//!
//! Bit `i` of the rendezvous word is position `i` in the group's node list;
//! the leader sits at position 0. `create` builds the receiving side of a
//! group, `open` the signalling side, with mirrored validation.

use crate::noc::{EndpointPath, NodeId, NODES_NUM};
use crate::resource::{PoolEntry, Resource};
use crate::runtime::Runtime;
use crate::shared::{IpcError, IpcResult};
use crate::transport::{Direction, EndpointId};
use byteorder::{ByteOrder, LittleEndian};

/// Capacity of the per-process sync descriptor table.
pub const SYNC_SLOTS: usize = 64;

pub type Syncid = usize;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SyncMode {
    /// The leader signals; everyone else waits.
    OneToAll,
    /// Everyone signals; the leader waits.
    AllToOne,
}

pub(crate) struct SyncSlot {
    pub(crate) resource: Resource,
    pub(crate) endpoint: EndpointId,
    pub(crate) owner: NodeId,
    wanted: u64,
    word: u64,
    fired: bool,
}

impl Default for SyncSlot {
    fn default() -> SyncSlot {
        SyncSlot {
            resource: Resource::default(),
            endpoint: 0,
            owner: NodeId::ZERO,
            wanted: 0,
            word: 0,
            fired: false,
        }
    }
}

impl PoolEntry for SyncSlot {
    fn resource(&self) -> &Resource {
        &self.resource
    }

    fn resource_mut(&mut self) -> &mut Resource {
        &mut self.resource
    }
}

/// Validates a group list against the caller's expected role and returns
/// the caller's position.
fn validate_group(
    nodes: &[NodeId],
    mode: SyncMode,
    caller: NodeId,
    creating: bool,
) -> IpcResult<usize> {
    if nodes.len() < 2 || nodes.len() > NODES_NUM {
        return Err(IpcError::Inval);
    }

    for (i, a) in nodes.iter().enumerate() {
        for b in &nodes[i + 1..] {
            if a == b {
                return Err(IpcError::Inval);
            }
        }
    }

    let position = nodes.iter().position(|&node| node == caller);

    // The receiving role is the waiter set for OneToAll and the leader for
    // AllToOne; open expects the mirror.
    let leader_expected = girder::choose!(creating => mode == SyncMode::AllToOne,
                                          mode == SyncMode::OneToAll);

    match position {
        Some(0) if leader_expected => Ok(0),
        Some(index) if index > 0 && !leader_expected => Ok(index),
        _ => Err(IpcError::Inval),
    }
}

impl Runtime {
    /// Builds the receiving side of a rendezvous group.
    pub fn sync_create(&self, nodes: &[NodeId], mode: SyncMode) -> IpcResult<Syncid> {
        validate_group(nodes, mode, self.node(), true)?;

        let wanted = match mode {
            // Waiters expect the leader's bit.
            SyncMode::OneToAll => 1u64,
            // The leader expects a bit per signaller.
            SyncMode::AllToOne => ((1u64 << nodes.len()) - 1) & !1u64,
        };

        let mut tables = self.lock_tables();

        let syncid = tables.syncs.alloc().map_err(|_| IpcError::Again)?;

        let endpoint = match self
            .port()
            .open(EndpointPath::sync(self.node()), Direction::Rx)
        {
            Ok(endpoint) => endpoint,
            Err(_) => {
                tables.syncs.release(syncid);
                return Err(IpcError::Again);
            }
        };

        let slot = tables.syncs.get_mut(syncid).expect("allocated sync vanished");

        slot.endpoint = endpoint;
        slot.owner = self.node();
        slot.wanted = wanted;
        slot.resource.set_rdonly();

        Ok(syncid)
    }

    /// Builds the signalling side of a rendezvous group.
    pub fn sync_open(&self, nodes: &[NodeId], mode: SyncMode) -> IpcResult<Syncid> {
        let index = validate_group(nodes, mode, self.node(), false)?;

        let mut tables = self.lock_tables();

        let syncid = tables.syncs.alloc().map_err(|_| IpcError::Again)?;

        let (endpoint, word) = match mode {
            SyncMode::OneToAll => {
                // One write must reach every waiter.
                let ranks: Vec<EndpointPath> =
                    nodes[1..].iter().map(|&node| EndpointPath::sync(node)).collect();

                let endpoint = match self.port().open(ranks[0], Direction::Tx) {
                    Ok(endpoint) => endpoint,
                    Err(_) => {
                        tables.syncs.release(syncid);
                        return Err(IpcError::Again);
                    }
                };

                if self.port().set_rx_ranks(endpoint, &ranks).is_err() {
                    self.port().close(endpoint).expect("sync endpoint close failed");
                    tables.syncs.release(syncid);
                    return Err(IpcError::Again);
                }

                (endpoint, 1u64)
            }
            SyncMode::AllToOne => {
                let endpoint = match self
                    .port()
                    .open(EndpointPath::sync(nodes[0]), Direction::Tx)
                {
                    Ok(endpoint) => endpoint,
                    Err(_) => {
                        tables.syncs.release(syncid);
                        return Err(IpcError::Again);
                    }
                };

                (endpoint, 1u64 << index)
            }
        };

        let slot = tables.syncs.get_mut(syncid).expect("allocated sync vanished");

        slot.endpoint = endpoint;
        slot.owner = self.node();
        slot.word = word;
        slot.resource.set_wronly();

        Ok(syncid)
    }

    /// Blocks until the rendezvous completes.
    pub fn sync_wait(&self, syncid: Syncid) -> IpcResult<()> {
        let (endpoint, wanted) = {
            let mut tables = self.lock_tables();
            let slot = tables.syncs.get_mut(syncid).ok_or(IpcError::Inval)?;

            if slot.owner != self.node() {
                return Err(IpcError::Perm);
            }

            if !slot.resource.is_rdonly() {
                return Err(IpcError::NotSup);
            }

            if slot.resource.is_busy() {
                return Err(IpcError::Again);
            }

            slot.resource.set_busy();

            (slot.endpoint, slot.wanted)
        };

        let result = (|| {
            self.port()
                .set_rx_match(endpoint, !wanted)
                .map_err(|_| IpcError::Again)?;

            let mut word = [0u8; 8];
            self.port()
                .read(endpoint, &mut word)
                .map_err(|_| IpcError::Again)?;

            assert_eq!(
                LittleEndian::read_u64(&word) & wanted,
                wanted,
                "rendezvous completed without the expected bits"
            );

            Ok(())
        })();

        self.lock_tables()
            .syncs
            .get_mut(syncid)
            .expect("busy sync vanished")
            .resource
            .set_notbusy();

        result
    }

    /// Releases the rendezvous. At most one signal per opened descriptor.
    pub fn sync_signal(&self, syncid: Syncid) -> IpcResult<()> {
        let (endpoint, word) = {
            let mut tables = self.lock_tables();
            let slot = tables.syncs.get_mut(syncid).ok_or(IpcError::Inval)?;

            if slot.owner != self.node() {
                return Err(IpcError::Perm);
            }

            if !slot.resource.is_wronly() {
                return Err(IpcError::NotSup);
            }

            if slot.fired {
                return Err(IpcError::Inval);
            }

            slot.fired = true;

            (slot.endpoint, slot.word)
        };

        let mut frame = [0u8; 8];
        LittleEndian::write_u64(&mut frame, word);

        self.port()
            .write(endpoint, &frame)
            .map_err(|_| IpcError::Again)?;

        Ok(())
    }

    /// Closes the signalling side of a group.
    pub fn sync_close(&self, syncid: Syncid) -> IpcResult<()> {
        let mut tables = self.lock_tables();
        let slot = tables.syncs.get(syncid).ok_or(IpcError::Inval)?;

        if slot.owner != self.node() {
            return Err(IpcError::Perm);
        }

        if !slot.resource.is_wronly() {
            return Err(IpcError::NotSup);
        }

        self.port()
            .close(slot.endpoint)
            .expect("sync endpoint close failed");
        tables.syncs.release(syncid);

        Ok(())
    }

    /// Releases the receiving side of a group.
    pub fn sync_unlink(&self, syncid: Syncid) -> IpcResult<()> {
        let mut tables = self.lock_tables();
        let slot = tables.syncs.get(syncid).ok_or(IpcError::Inval)?;

        if slot.owner != self.node() {
            return Err(IpcError::Perm);
        }

        if !slot.resource.is_rdonly() {
            return Err(IpcError::NotSup);
        }

        if slot.resource.is_busy() {
            return Err(IpcError::Again);
        }

        self.port()
            .close(slot.endpoint)
            .expect("sync endpoint close failed");
        tables.syncs.release(syncid);

        Ok(())
    }
}
