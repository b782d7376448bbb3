//! Per-process runtime context.
//!
//! Holds the descriptor tables for every connector family behind one
//! process-wide mutex, the default inbox and inportal, and the name client.
//! The runtime has an explicit lifecycle (`setup` / `shutdown`) and is
//! passed around as a value; there are no module globals.

use crate::mailbox::{MailboxSlot, MAILBOX_SLOTS};
use crate::name::client::NameClient;
use crate::noc::{EndpointPath, NodeId};
use crate::portal::{PortalSlot, Prtid, PORTAL_SLOTS};
use crate::resource::ResourcePool;
use crate::shared::{IpcError, IpcResult};
use crate::sync::{SyncSlot, SYNC_SLOTS};
use crate::transport::{Direction, EndpointId, Transport};
use girder::logging;
use std::sync::{Arc, Mutex, MutexGuard};

pub(crate) struct Tables {
    pub(crate) mailboxes: ResourcePool<MailboxSlot>,
    pub(crate) portals: ResourcePool<PortalSlot>,
    pub(crate) syncs: ResourcePool<SyncSlot>,
}

impl Tables {
    fn new() -> Tables {
        Tables {
            mailboxes: ResourcePool::new(MAILBOX_SLOTS),
            portals: ResourcePool::new(PORTAL_SLOTS),
            syncs: ResourcePool::new(SYNC_SLOTS),
        }
    }
}

pub struct Runtime {
    node: NodeId,
    port: Arc<dyn Transport>,
    pub(crate) tables: Mutex<Tables>,
    name: NameClient,
    inbox: EndpointId,
    stdin_portal: Prtid,
    pub(crate) log: logging::Logger,
}

impl Runtime {
    /// Brings the runtime up on `node`: opens the default inbox and
    /// inportal and connects the name client.
    pub fn setup<'a, L: Into<Option<&'a logging::Logger>>>(
        port: Arc<dyn Transport>,
        node: NodeId,
        log: L,
    ) -> IpcResult<Runtime> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        let inbox = port
            .open(EndpointPath::mailbox(node), Direction::Rx)
            .map_err(|_| IpcError::Again)?;

        let name = NameClient::connect(port.clone(), node, inbox, &log)?;

        let mut runtime = Runtime {
            node,
            port,
            tables: Mutex::new(Tables::new()),
            name,
            inbox,
            stdin_portal: 0,
            log,
        };

        runtime.stdin_portal = runtime.portal_create()?;

        logging::debug!(runtime.log, "runtime up"; "node" => %node);

        Ok(runtime)
    }

    #[inline]
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// The default input portal descriptor of this process.
    #[inline]
    pub fn stdin_portal(&self) -> Prtid {
        self.stdin_portal
    }

    #[inline]
    pub(crate) fn inbox_endpoint(&self) -> EndpointId {
        self.inbox
    }

    #[inline]
    pub(crate) fn port(&self) -> &Arc<dyn Transport> {
        &self.port
    }

    pub(crate) fn lock_tables(&self) -> MutexGuard<Tables> {
        self.tables.lock().expect("descriptor table lock poisoned")
    }

    /// Resolves `name` through the name server.
    pub fn name_lookup(&self, name: &str) -> IpcResult<NodeId> {
        self.name.lookup(name)
    }

    /// Registers `name` for `node` at the name server.
    pub fn name_link(&self, node: NodeId, name: &str) -> IpcResult<()> {
        self.name.link(node, name)
    }

    /// Removes `name` from the name server.
    pub fn name_unlink(&self, name: &str) -> IpcResult<()> {
        self.name.unlink(name)
    }

    /// Asks the name server to shut down once pending requests drain.
    pub fn name_exit(&self) -> IpcResult<()> {
        self.name.exit()
    }

    /// Number of used descriptors per family (mailbox, portal, sync).
    pub fn descriptor_counts(&self) -> (usize, usize, usize) {
        let tables = self.lock_tables();

        (
            tables.mailboxes.active(),
            tables.portals.active(),
            tables.syncs.active(),
        )
    }

    /// Tears the runtime down, releasing the default connectors.
    pub fn shutdown(self) -> IpcResult<()> {
        self.portal_unlink(self.stdin_portal)?;

        self.port
            .close(self.inbox)
            .expect("default inbox close failed");

        self.name.disconnect();

        logging::debug!(self.log, "runtime down"; "node" => %self.node);

        Ok(())
    }
}
