//! Name client. Every process holds one connection to the name server; a
//! mutex serializes one request/response pair at a time over the shared
//! outbox and inbox.

use crate::mailbox::MSG_SIZE;
use crate::name::protocol::{
    validate_name, NameMessage, NAME_EXIT, NAME_LINK, NAME_LOOKUP, NAME_SUCCESS, NAME_UNLINK,
};
use crate::noc::{EndpointPath, NodeId, NAME_SERVER_NODE};
use crate::shared::{IpcError, IpcResult};
use crate::transport::{Direction, EndpointId, Transport};
use girder::logging;
use std::sync::{Arc, Mutex};

pub struct NameClient {
    port: Arc<dyn Transport>,
    node: NodeId,
    server: EndpointId,
    inbox: EndpointId,
    inflight: Mutex<u32>,
    log: logging::Logger,
}

impl NameClient {
    /// Opens the connection to the name server. The server does not need to
    /// be up yet; only the first RPC talks to it.
    pub(crate) fn connect(
        port: Arc<dyn Transport>,
        node: NodeId,
        inbox: EndpointId,
        log: &logging::Logger,
    ) -> IpcResult<NameClient> {
        let server = port
            .open(EndpointPath::mailbox(NAME_SERVER_NODE), Direction::Tx)
            .map_err(|_| IpcError::Again)?;

        Ok(NameClient {
            port,
            node,
            server,
            inbox,
            inflight: Mutex::new(0),
            log: log.new(logging::o!()),
        })
    }

    pub(crate) fn disconnect(&self) {
        self.port
            .close(self.server)
            .expect("name server link close failed");
    }

    /// Runs one request/response pair. The lock is held for the whole pair.
    fn transact(&self, mut msg: NameMessage) -> IpcResult<NameMessage> {
        let mut seq = self.inflight.lock().expect("name client lock poisoned");

        *seq += 1;
        msg.seq = *seq;

        let frame = msg.to_frame()?;
        self.port
            .write(self.server, &frame)
            .map_err(|_| IpcError::Again)?;

        let mut reply = [0u8; MSG_SIZE];
        self.port
            .read(self.inbox, &mut reply)
            .map_err(|_| IpcError::Again)?;

        let reply = NameMessage::from_frame(&reply)?;

        if reply.seq != msg.seq {
            logging::warn!(self.log, "name reply out of sequence";
                           "expected" => msg.seq, "got" => reply.seq);
            return Err(IpcError::Fault);
        }

        Ok(reply)
    }

    /// Resolves `name` to a node number.
    pub fn lookup(&self, name: &str) -> IpcResult<NodeId> {
        validate_name(name)?;

        let reply = self.transact(NameMessage::new(self.node, NAME_LOOKUP, name))?;

        if reply.opcode != NAME_SUCCESS {
            return Err(IpcError::from_errno(reply.node_num));
        }

        NodeId::new(reply.node_num as usize)
    }

    /// Registers `name` for `node`.
    pub fn link(&self, node: NodeId, name: &str) -> IpcResult<()> {
        validate_name(name)?;

        let mut msg = NameMessage::new(self.node, NAME_LINK, name);
        msg.node_num = node.index() as i32;

        let reply = self.transact(msg)?;

        girder::choose!(reply.opcode == NAME_SUCCESS => Ok(()),
                        Err(IpcError::from_errno(reply.node_num)))
    }

    /// Removes `name` from the table.
    pub fn unlink(&self, name: &str) -> IpcResult<()> {
        validate_name(name)?;

        let reply = self.transact(NameMessage::new(self.node, NAME_UNLINK, name))?;

        girder::choose!(reply.opcode == NAME_SUCCESS => Ok(()),
                        Err(IpcError::from_errno(reply.node_num)))
    }

    /// Asks the server to drain and exit.
    pub fn exit(&self) -> IpcResult<()> {
        let reply = self.transact(NameMessage::new(self.node, NAME_EXIT, ""))?;

        girder::choose!(reply.opcode == NAME_SUCCESS => Ok(()),
                        Err(IpcError::from_errno(reply.node_num)))
    }
}
