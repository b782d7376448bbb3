//! Mailbox connector: short fixed-size messages.
//!
//! Every message is exactly [`MSG_SIZE`] bytes; callers pad. A mailbox is
//! either readable (the input side, bound to the creating node) or writable
//! (an output opened by name), never both.

use crate::name::protocol::validate_name;
use crate::noc::{EndpointPath, NodeId};
use crate::resource::{PoolEntry, Resource};
use crate::runtime::Runtime;
use crate::shared::{IpcError, IpcResult};
use crate::transport::{Direction, EndpointId};
use girder::logging;

/// Fixed message size. Every control message in the system is padded to it.
pub const MSG_SIZE: usize = 80;

/// Capacity of the per-process mailbox descriptor table.
pub const MAILBOX_SLOTS: usize = 64;

pub type Mbxid = usize;

pub(crate) struct MailboxSlot {
    pub(crate) resource: Resource,
    pub(crate) endpoint: EndpointId,
    pub(crate) owner: NodeId,
    pub(crate) name: Option<String>,
}

impl Default for MailboxSlot {
    fn default() -> MailboxSlot {
        MailboxSlot {
            resource: Resource::default(),
            endpoint: 0,
            owner: NodeId::ZERO,
            name: None,
        }
    }
}

impl PoolEntry for MailboxSlot {
    fn resource(&self) -> &Resource {
        &self.resource
    }

    fn resource_mut(&mut self) -> &mut Resource {
        &mut self.resource
    }
}

impl Runtime {
    /// Creates the named input mailbox of this process and registers `name`
    /// at the name server.
    pub fn mailbox_create(&self, name: &str) -> IpcResult<Mbxid> {
        validate_name(name)?;

        let mbxid = {
            let mut tables = self.lock_tables();

            let mbxid = tables.mailboxes.alloc().map_err(|_| IpcError::Again)?;

            let endpoint = match self
                .port()
                .open(EndpointPath::mailbox(self.node()), Direction::Rx)
            {
                Ok(endpoint) => endpoint,
                Err(_) => {
                    tables.mailboxes.release(mbxid);
                    return Err(IpcError::Again);
                }
            };

            let slot = tables
                .mailboxes
                .get_mut(mbxid)
                .expect("allocated mailbox vanished");

            slot.endpoint = endpoint;
            slot.owner = self.node();
            slot.name = Some(name.to_string());
            slot.resource.set_rdonly();

            mbxid
        };

        // The link RPC blocks; the descriptor lock must not be held here.
        if self.name_link(self.node(), name).is_err() {
            let mut tables = self.lock_tables();
            let endpoint = tables
                .mailboxes
                .get(mbxid)
                .expect("created mailbox vanished")
                .endpoint;

            self.port()
                .close(endpoint)
                .expect("mailbox endpoint close failed");
            tables.mailboxes.release(mbxid);

            return Err(IpcError::Again);
        }

        logging::debug!(self.log, "mailbox created"; "name" => name, "mbxid" => mbxid);

        Ok(mbxid)
    }

    /// Opens an output mailbox to the node `name` resolves to.
    pub fn mailbox_open(&self, name: &str) -> IpcResult<Mbxid> {
        validate_name(name)?;

        let remote = self.name_lookup(name).map_err(|_| IpcError::Again)?;

        let mut tables = self.lock_tables();

        let mbxid = tables.mailboxes.alloc().map_err(|_| IpcError::Again)?;

        let endpoint = match self.port().open(EndpointPath::mailbox(remote), Direction::Tx) {
            Ok(endpoint) => endpoint,
            Err(_) => {
                tables.mailboxes.release(mbxid);
                return Err(IpcError::Again);
            }
        };

        let slot = tables
            .mailboxes
            .get_mut(mbxid)
            .expect("allocated mailbox vanished");

        slot.endpoint = endpoint;
        slot.owner = self.node();
        slot.resource.set_wronly();

        logging::debug!(self.log, "mailbox opened"; "name" => name, "remote" => %remote, "mbxid" => mbxid);

        Ok(mbxid)
    }

    /// Reads exactly one message. `buf` must be [`MSG_SIZE`] bytes.
    pub fn mailbox_read(&self, mbxid: Mbxid, buf: &mut [u8]) -> IpcResult<()> {
        let endpoint = {
            let mut tables = self.lock_tables();
            let slot = tables.mailboxes.get_mut(mbxid).ok_or(IpcError::Inval)?;

            if slot.owner != self.node() {
                return Err(IpcError::Perm);
            }

            if !slot.resource.is_rdonly() {
                return Err(IpcError::NotSup);
            }

            if buf.len() != MSG_SIZE {
                return Err(IpcError::Inval);
            }

            if slot.resource.is_busy() {
                return Err(IpcError::Again);
            }

            slot.resource.set_busy();
            slot.endpoint
        };

        let result = self.port().read(endpoint, buf);

        self.lock_tables()
            .mailboxes
            .get_mut(mbxid)
            .expect("busy mailbox vanished")
            .resource
            .set_notbusy();

        let count = result.map_err(|_| IpcError::Again)?;
        assert_eq!(count, MSG_SIZE, "short mailbox read");

        Ok(())
    }

    /// Writes exactly one message. `buf` must be [`MSG_SIZE`] bytes.
    pub fn mailbox_write(&self, mbxid: Mbxid, buf: &[u8]) -> IpcResult<()> {
        let endpoint = {
            let mut tables = self.lock_tables();
            let slot = tables.mailboxes.get_mut(mbxid).ok_or(IpcError::Inval)?;

            if slot.owner != self.node() {
                return Err(IpcError::Perm);
            }

            if !slot.resource.is_wronly() {
                return Err(IpcError::NotSup);
            }

            if buf.len() != MSG_SIZE {
                return Err(IpcError::Inval);
            }

            if slot.resource.is_busy() {
                return Err(IpcError::Again);
            }

            slot.resource.set_busy();
            slot.endpoint
        };

        let result = self.port().write(endpoint, buf);

        self.lock_tables()
            .mailboxes
            .get_mut(mbxid)
            .expect("busy mailbox vanished")
            .resource
            .set_notbusy();

        let count = result.map_err(|_| IpcError::Again)?;
        assert_eq!(count, MSG_SIZE, "short mailbox write");

        Ok(())
    }

    /// Closes an output mailbox.
    pub fn mailbox_close(&self, mbxid: Mbxid) -> IpcResult<()> {
        let mut tables = self.lock_tables();
        let slot = tables.mailboxes.get(mbxid).ok_or(IpcError::Inval)?;

        if slot.owner != self.node() {
            return Err(IpcError::Perm);
        }

        if !slot.resource.is_wronly() {
            return Err(IpcError::NotSup);
        }

        if slot.resource.is_busy() {
            return Err(IpcError::Again);
        }

        let endpoint = slot.endpoint;

        self.port()
            .close(endpoint)
            .expect("mailbox endpoint close failed");
        tables.mailboxes.release(mbxid);

        Ok(())
    }

    /// Unlinks an input mailbox: removes its name, then releases the
    /// descriptor.
    pub fn mailbox_unlink(&self, mbxid: Mbxid) -> IpcResult<()> {
        let name = {
            let tables = self.lock_tables();
            let slot = tables.mailboxes.get(mbxid).ok_or(IpcError::Inval)?;

            if slot.owner != self.node() {
                return Err(IpcError::Perm);
            }

            if !slot.resource.is_rdonly() {
                return Err(IpcError::NotSup);
            }

            if slot.resource.is_busy() {
                return Err(IpcError::Again);
            }

            slot.name.clone().expect("input mailbox without a name")
        };

        self.name_unlink(&name).map_err(|_| IpcError::Again)?;

        let mut tables = self.lock_tables();
        let endpoint = tables
            .mailboxes
            .get(mbxid)
            .expect("unlinked mailbox vanished")
            .endpoint;

        self.port()
            .close(endpoint)
            .expect("mailbox endpoint close failed");
        tables.mailboxes.release(mbxid);

        logging::debug!(self.log, "mailbox unlinked"; "name" => name, "mbxid" => mbxid);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::server::NameServer;
    use crate::noc::NAME_SERVER_NODE;
    use crate::transport::{Loopback, Transport};
    use std::sync::Arc;
    use std::thread;

    fn boot_name_server(fabric: &Arc<Loopback>) -> thread::JoinHandle<()> {
        let port: Arc<dyn Transport> = Arc::new(fabric.attach(NAME_SERVER_NODE));
        let server = NameServer::new(port, NAME_SERVER_NODE, None).unwrap();

        thread::spawn(move || server.run())
    }

    fn runtime(fabric: &Arc<Loopback>, raw: usize) -> Runtime {
        let node = NodeId::new(raw).unwrap();

        Runtime::setup(Arc::new(fabric.attach(node)), node, None).unwrap()
    }

    #[test]
    fn test_create_write_read_unlink() {
        let fabric = Arc::new(Loopback::new());
        let server = boot_name_server(&fabric);

        let a = runtime(&fabric, 2);
        let b = runtime(&fabric, 3);

        let before_a = a.descriptor_counts();
        let before_b = b.descriptor_counts();

        let inbox = a.mailbox_create("m").unwrap();
        let outbox = b.mailbox_open("m").unwrap();

        b.mailbox_write(outbox, &[0x01; MSG_SIZE]).unwrap();

        let mut buf = [0u8; MSG_SIZE];
        a.mailbox_read(inbox, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x01; MSG_SIZE][..]);

        a.mailbox_unlink(inbox).unwrap();
        b.mailbox_close(outbox).unwrap();

        assert_eq!(a.descriptor_counts(), before_a);
        assert_eq!(b.descriptor_counts(), before_b);

        a.name_exit().unwrap();
        server.join().unwrap();

        a.shutdown().unwrap();
        b.shutdown().unwrap();
    }

    #[test]
    fn test_message_size_is_enforced() {
        let fabric = Arc::new(Loopback::new());
        let server = boot_name_server(&fabric);

        let a = runtime(&fabric, 2);
        let b = runtime(&fabric, 3);

        let inbox = a.mailbox_create("sized").unwrap();
        let outbox = b.mailbox_open("sized").unwrap();

        let short = [0u8; MSG_SIZE - 1];
        let long = [0u8; MSG_SIZE + 1];

        assert_eq!(b.mailbox_write(outbox, &short).unwrap_err(), IpcError::Inval);
        assert_eq!(b.mailbox_write(outbox, &long).unwrap_err(), IpcError::Inval);

        let mut buf = [0u8; MSG_SIZE - 1];
        assert_eq!(a.mailbox_read(inbox, &mut buf).unwrap_err(), IpcError::Inval);

        a.name_exit().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_direction_misuse() {
        let fabric = Arc::new(Loopback::new());
        let server = boot_name_server(&fabric);

        let a = runtime(&fabric, 2);
        let b = runtime(&fabric, 3);

        let inbox = a.mailbox_create("dir").unwrap();
        let outbox = b.mailbox_open("dir").unwrap();

        let mut buf = [0u8; MSG_SIZE];
        assert_eq!(a.mailbox_write(inbox, &buf).unwrap_err(), IpcError::NotSup);
        assert_eq!(b.mailbox_read(outbox, &mut buf).unwrap_err(), IpcError::NotSup);

        // Close is for outputs, unlink for inputs.
        assert_eq!(a.mailbox_close(inbox).unwrap_err(), IpcError::NotSup);
        assert_eq!(b.mailbox_unlink(outbox).unwrap_err(), IpcError::NotSup);

        a.name_exit().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_bad_names_and_unknown_ids() {
        let fabric = Arc::new(Loopback::new());
        let server = boot_name_server(&fabric);

        let a = runtime(&fabric, 2);

        assert_eq!(a.mailbox_create("").unwrap_err(), IpcError::Inval);

        let too_long = "x".repeat(crate::name::protocol::NAME_MAX);
        assert_eq!(a.mailbox_create(&too_long).unwrap_err(), IpcError::Inval);

        assert_eq!(a.mailbox_open("nosuch").unwrap_err(), IpcError::Again);

        let mut buf = [0u8; MSG_SIZE];
        assert_eq!(a.mailbox_read(99, &mut buf).unwrap_err(), IpcError::Inval);

        a.name_exit().unwrap();
        server.join().unwrap();
    }
}
