//! Portal connector: arbitrary-size bulk transfers.
//!
//! An input portal refuses data from any remote that has not been admitted
//! with `portal_allow`; a writer blocks until the receiver's ready word
//! arrives on its ack channel. Output portals are one-shot: a portal is
//! reopened to transfer again, and one allow admits exactly one transfer.

use crate::noc::{EndpointPath, NodeId};
use crate::resource::{PoolEntry, Resource};
use crate::runtime::Runtime;
use crate::shared::{IpcError, IpcResult};
use crate::transport::{Direction, EndpointId};
use byteorder::{ByteOrder, LittleEndian};
use girder::logging;
use indexmap::IndexMap;
use std::sync::{Arc, Mutex};

/// Upper bound on a single bulk transfer.
pub const PORTAL_MAX: usize = 1024 * 1024;

/// Capacity of the per-process portal descriptor table.
pub const PORTAL_SLOTS: usize = 64;

pub type Prtid = usize;

pub(crate) struct AllowEntry {
    signal: EndpointId,
    signaled: bool,
}

/// Input-side state shared with threads that call `portal_allow` while a
/// read is blocked.
pub(crate) struct InputState {
    allowed: IndexMap<NodeId, AllowEntry>,
    reading: bool,
}

pub(crate) struct PortalSlot {
    pub(crate) resource: Resource,
    pub(crate) endpoint: EndpointId,
    pub(crate) owner: NodeId,
    remote: Option<NodeId>,
    ack: EndpointId,
    input: Option<Arc<Mutex<InputState>>>,
    consumed: bool,
}

impl Default for PortalSlot {
    fn default() -> PortalSlot {
        PortalSlot {
            resource: Resource::default(),
            endpoint: 0,
            owner: NodeId::ZERO,
            remote: None,
            ack: 0,
            input: None,
            consumed: false,
        }
    }
}

impl PoolEntry for PortalSlot {
    fn resource(&self) -> &Resource {
        &self.resource
    }

    fn resource_mut(&mut self) -> &mut Resource {
        &mut self.resource
    }
}

impl Runtime {
    /// Creates an input portal bound to the calling node.
    pub fn portal_create(&self) -> IpcResult<Prtid> {
        let mut tables = self.lock_tables();

        let prtid = tables.portals.alloc().map_err(|_| IpcError::Again)?;

        let endpoint = match self
            .port()
            .open(EndpointPath::portal(self.node()), Direction::Rx)
        {
            Ok(endpoint) => endpoint,
            Err(_) => {
                tables.portals.release(prtid);
                return Err(IpcError::Again);
            }
        };

        let slot = tables
            .portals
            .get_mut(prtid)
            .expect("allocated portal vanished");

        slot.endpoint = endpoint;
        slot.owner = self.node();
        slot.input = Some(Arc::new(Mutex::new(InputState {
            allowed: IndexMap::new(),
            reading: false,
        })));
        slot.resource.set_rdonly();

        Ok(prtid)
    }

    /// Admits `remote` on an input portal. If a read is already pending the
    /// remote's ready word is sent immediately.
    pub fn portal_allow(&self, prtid: Prtid, remote: NodeId) -> IpcResult<()> {
        if remote == self.node() {
            return Err(IpcError::Inval);
        }

        let input = {
            let tables = self.lock_tables();
            let slot = tables.portals.get(prtid).ok_or(IpcError::Inval)?;

            if slot.owner != self.node() {
                return Err(IpcError::Perm);
            }

            if !slot.resource.is_rdonly() {
                return Err(IpcError::NotSup);
            }

            slot.input.clone().expect("input portal without state")
        };

        let signal = self
            .port()
            .open(EndpointPath::portal_ack(remote), Direction::Tx)
            .map_err(|_| IpcError::Again)?;

        let mut state = input.lock().expect("portal state poisoned");

        if state.allowed.contains_key(&remote) {
            self.port()
                .close(signal)
                .expect("ready channel close failed");
            return Err(IpcError::Inval);
        }

        let mut entry = AllowEntry {
            signal,
            signaled: false,
        };

        if state.reading {
            self.send_ready(signal, remote);
            entry.signaled = true;
        }

        state.allowed.insert(remote, entry);

        logging::trace!(self.log, "portal remote allowed"; "prtid" => prtid, "remote" => %remote);

        Ok(())
    }

    /// Opens an output portal bound to `remote` for its lifetime.
    pub fn portal_open(&self, remote: NodeId) -> IpcResult<Prtid> {
        if remote == self.node() {
            return Err(IpcError::Inval);
        }

        let mut tables = self.lock_tables();

        let prtid = tables.portals.alloc().map_err(|_| IpcError::Again)?;

        let endpoint = match self.port().open(EndpointPath::portal(remote), Direction::Tx) {
            Ok(endpoint) => endpoint,
            Err(_) => {
                tables.portals.release(prtid);
                return Err(IpcError::Again);
            }
        };

        let ack = match self
            .port()
            .open(EndpointPath::portal_ack(self.node()), Direction::Rx)
        {
            Ok(ack) => ack,
            Err(_) => {
                self.port()
                    .close(endpoint)
                    .expect("portal endpoint close failed");
                tables.portals.release(prtid);
                return Err(IpcError::Again);
            }
        };

        let slot = tables
            .portals
            .get_mut(prtid)
            .expect("allocated portal vanished");

        slot.endpoint = endpoint;
        slot.owner = self.node();
        slot.remote = Some(remote);
        slot.ack = ack;
        slot.resource.set_wronly();

        Ok(prtid)
    }

    /// Blocks until exactly `buf.len()` bytes arrive from an allow-listed
    /// remote, then retires that remote's allow entry.
    pub fn portal_read(&self, prtid: Prtid, buf: &mut [u8]) -> IpcResult<()> {
        if buf.is_empty() || buf.len() > PORTAL_MAX {
            return Err(IpcError::Inval);
        }

        let (endpoint, input) = {
            let mut tables = self.lock_tables();
            let slot = tables.portals.get_mut(prtid).ok_or(IpcError::Inval)?;

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
            slot.resource.set_async();

            (
                slot.endpoint,
                slot.input.clone().expect("input portal without state"),
            )
        };

        let begun = self.port().async_read_begin(endpoint, buf.len(), 1);

        let op = match begun {
            Ok(op) => op,
            Err(_) => {
                self.settle_portal(prtid);
                return Err(IpcError::Again);
            }
        };

        // Release every admitted writer that has not been signaled yet.
        {
            let mut state = input.lock().expect("portal state poisoned");

            state.reading = true;

            let ready: Vec<(NodeId, EndpointId)> = state
                .allowed
                .iter_mut()
                .filter(|(_, entry)| !entry.signaled)
                .map(|(remote, entry)| {
                    entry.signaled = true;
                    (*remote, entry.signal)
                })
                .collect();

            for (remote, signal) in ready {
                self.send_ready(signal, remote);
            }
        }

        let result = self.port().async_read_wait(op, buf);

        let verdict = {
            let mut state = input.lock().expect("portal state poisoned");

            state.reading = false;

            match &result {
                Ok(completion) => match state.allowed.shift_remove(&completion.from) {
                    Some(entry) => {
                        self.port()
                            .close(entry.signal)
                            .expect("ready channel close failed");
                        Ok(())
                    }
                    None => Err(IpcError::Fault),
                },
                Err(_) => Err(IpcError::Again),
            }
        };

        self.settle_portal(prtid);

        verdict
    }

    /// One-shot bulk write: waits for the receiver's ready word, then
    /// transfers the whole buffer.
    pub fn portal_write(&self, prtid: Prtid, buf: &[u8]) -> IpcResult<()> {
        if buf.is_empty() || buf.len() > PORTAL_MAX {
            return Err(IpcError::Inval);
        }

        let (endpoint, ack, remote) = {
            let mut tables = self.lock_tables();
            let slot = tables.portals.get_mut(prtid).ok_or(IpcError::Inval)?;

            if slot.owner != self.node() {
                return Err(IpcError::Perm);
            }

            if !slot.resource.is_wronly() {
                return Err(IpcError::NotSup);
            }

            if slot.consumed {
                return Err(IpcError::NotSup);
            }

            if slot.resource.is_busy() {
                return Err(IpcError::Again);
            }

            slot.resource.set_busy();

            (
                slot.endpoint,
                slot.ack,
                slot.remote.expect("output portal without a remote"),
            )
        };

        logging::trace!(self.log, "portal write";
                        "prtid" => prtid, "remote" => %remote, "size" => buf.len());

        let result = (|| {
            self.port()
                .set_rx_match(ack, !self.node().bit())
                .map_err(|_| IpcError::Again)?;

            let mut word = [0u8; 8];
            self.port().read(ack, &mut word).map_err(|_| IpcError::Again)?;

            let sent = self
                .port()
                .write(endpoint, buf)
                .map_err(|_| IpcError::Again)?;
            assert_eq!(sent, buf.len(), "short portal write");

            Ok(())
        })();

        {
            let mut tables = self.lock_tables();
            let slot = tables
                .portals
                .get_mut(prtid)
                .expect("busy portal vanished");

            slot.resource.set_notbusy();

            if result.is_ok() {
                slot.consumed = true;
            }
        }

        result
    }

    /// Closes an output portal.
    pub fn portal_close(&self, prtid: Prtid) -> IpcResult<()> {
        let mut tables = self.lock_tables();
        let slot = tables.portals.get(prtid).ok_or(IpcError::Inval)?;

        if slot.owner != self.node() {
            return Err(IpcError::Perm);
        }

        if !slot.resource.is_wronly() {
            return Err(IpcError::NotSup);
        }

        if slot.resource.is_busy() {
            return Err(IpcError::Again);
        }

        let (endpoint, ack) = (slot.endpoint, slot.ack);

        self.port()
            .close(endpoint)
            .expect("portal endpoint close failed");
        self.port().close(ack).expect("ack endpoint close failed");

        tables.portals.release(prtid);

        Ok(())
    }

    /// Releases an input portal and any outstanding allow entries.
    pub fn portal_unlink(&self, prtid: Prtid) -> IpcResult<()> {
        let mut tables = self.lock_tables();
        let slot = tables.portals.get(prtid).ok_or(IpcError::Inval)?;

        if slot.owner != self.node() {
            return Err(IpcError::Perm);
        }

        if !slot.resource.is_rdonly() {
            return Err(IpcError::NotSup);
        }

        if slot.resource.is_busy() {
            return Err(IpcError::Again);
        }

        let endpoint = slot.endpoint;
        let input = slot.input.clone().expect("input portal without state");

        {
            let state = input.lock().expect("portal state poisoned");

            for entry in state.allowed.values() {
                self.port()
                    .close(entry.signal)
                    .expect("ready channel close failed");
            }
        }

        self.port()
            .close(endpoint)
            .expect("portal endpoint close failed");

        tables.portals.release(prtid);

        Ok(())
    }

    fn send_ready(&self, signal: EndpointId, remote: NodeId) {
        let mut word = [0u8; 8];
        LittleEndian::write_u64(&mut word, remote.bit());

        self.port()
            .write(signal, &word)
            .expect("ready signal write failed");
    }

    fn settle_portal(&self, prtid: Prtid) {
        let mut tables = self.lock_tables();
        let slot = tables
            .portals
            .get_mut(prtid)
            .expect("busy portal vanished");

        slot.resource.set_notbusy();
        slot.resource.set_sync();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Loopback;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn runtime(fabric: &Arc<Loopback>, raw: usize) -> Arc<Runtime> {
        let node = NodeId::new(raw).unwrap();

        Arc::new(Runtime::setup(Arc::new(fabric.attach(node)), node, None).unwrap())
    }

    #[test]
    fn test_allow_then_transfer() {
        let fabric = Arc::new(Loopback::new());
        let a = runtime(&fabric, 2);
        let b = runtime(&fabric, 3);

        let prt = a.portal_create().unwrap();
        a.portal_allow(prt, b.node()).unwrap();

        let payload: Vec<u8> = {
            use rand::RngCore;
            let mut payload = vec![0u8; 4096];
            rand::thread_rng().fill_bytes(&mut payload);
            payload
        };

        let expected = payload.clone();
        let writer = {
            let b = b.clone();
            let a_node = a.node();

            thread::spawn(move || {
                let out = b.portal_open(a_node).unwrap();
                b.portal_write(out, &payload).unwrap();

                // One-shot: the next transfer needs a fresh portal.
                assert_eq!(b.portal_write(out, &payload).unwrap_err(), IpcError::NotSup);

                b.portal_close(out).unwrap();
            })
        };

        let mut buf = vec![0u8; 4096];
        a.portal_read(prt, &mut buf).unwrap();
        assert_eq!(buf, expected);

        writer.join().unwrap();

        a.portal_unlink(prt).unwrap();
    }

    #[test]
    fn test_allow_gates_unknown_senders() {
        let fabric = Arc::new(Loopback::new());
        let a = runtime(&fabric, 2);
        let b = runtime(&fabric, 3);
        let c = runtime(&fabric, 4);

        let prt = a.portal_create().unwrap();

        // Only B is admitted; B stays silent for this test.
        a.portal_allow(prt, b.node()).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        let writer = {
            let c = c.clone();
            let a_node = a.node();

            thread::spawn(move || {
                let out = c.portal_open(a_node).unwrap();
                c.portal_write(out, &[0xAB; 256]).unwrap();
                done_tx.send(()).unwrap();
                c.portal_close(out).unwrap();
            })
        };

        let reader = {
            let a = a.clone();

            thread::spawn(move || {
                let mut buf = [0u8; 256];
                a.portal_read(prt, &mut buf).unwrap();
                buf
            })
        };

        // C is not allow-listed: its write must stay blocked.
        assert!(done_rx.recv_timeout(Duration::from_millis(300)).is_err());

        // Admitting C releases the writer and the data lands intact.
        a.portal_allow(prt, c.node()).unwrap();
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("allowed writer still blocked");

        let buf = reader.join().unwrap();
        assert_eq!(&buf[..], &[0xAB; 256][..]);

        writer.join().unwrap();
    }

    #[test]
    fn test_size_bounds() {
        let fabric = Arc::new(Loopback::new());
        let a = runtime(&fabric, 2);
        let b = runtime(&fabric, 3);

        let out = b.portal_open(a.node()).unwrap();

        let oversize = vec![0u8; PORTAL_MAX + 1];
        assert_eq!(b.portal_write(out, &oversize).unwrap_err(), IpcError::Inval);
        assert_eq!(b.portal_write(out, &[]).unwrap_err(), IpcError::Inval);

        let prt = a.portal_create().unwrap();
        let mut buf: [u8; 0] = [];
        assert_eq!(a.portal_read(prt, &mut buf).unwrap_err(), IpcError::Inval);

        b.portal_close(out).unwrap();
        a.portal_unlink(prt).unwrap();
    }

    #[test]
    fn test_direction_and_ownership() {
        let fabric = Arc::new(Loopback::new());
        let a = runtime(&fabric, 2);
        let b = runtime(&fabric, 3);

        let prt = a.portal_create().unwrap();
        let out = b.portal_open(a.node()).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(b.portal_read(out, &mut buf).unwrap_err(), IpcError::NotSup);
        assert_eq!(a.portal_write(prt, &buf).unwrap_err(), IpcError::NotSup);

        assert_eq!(a.portal_close(prt).unwrap_err(), IpcError::NotSup);
        assert_eq!(b.portal_unlink(out).unwrap_err(), IpcError::NotSup);

        // Admitting oneself is meaningless.
        assert_eq!(a.portal_allow(prt, a.node()).unwrap_err(), IpcError::Inval);

        // Duplicate admission of the same remote.
        a.portal_allow(prt, b.node()).unwrap();
        assert_eq!(a.portal_allow(prt, b.node()).unwrap_err(), IpcError::Inval);

        b.portal_close(out).unwrap();
        a.portal_unlink(prt).unwrap();
    }

    #[test]
    fn test_descriptor_counts_restored() {
        let fabric = Arc::new(Loopback::new());
        let a = runtime(&fabric, 2);

        let before = a.descriptor_counts();

        let prt = a.portal_create().unwrap();
        let out = a.portal_open(NodeId::new(3).unwrap()).unwrap();

        a.portal_unlink(prt).unwrap();
        a.portal_close(out).unwrap();

        assert_eq!(a.descriptor_counts(), before);
    }
}
