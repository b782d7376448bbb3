//! Name server core. Single-threaded cooperative loop: read a request,
//! handle it synchronously, reply to the source, loop. Requests are totally
//! ordered by mailbox arrival.

use crate::mailbox::MSG_SIZE;
use crate::name::protocol::{
    validate_name, NameMessage, NAME_EXIT, NAME_FAIL, NAME_LINK, NAME_LOOKUP, NAME_SUCCESS,
    NAME_UNLINK,
};
use crate::noc::{EndpointPath, NodeId, NODES_NUM};
use crate::shared::{IpcError, IpcResult};
use crate::transport::{Direction, EndpointId, Transport};
use girder::logging;
use girder::time::timestamp_secs;
use std::sync::Arc;

/// Installed at boot on the server's own table row.
const BOOT_NAME: &str = "/io0";

/// Built-in alias for the server itself. The server's row already holds
/// `/io0` and a row holds one name, so the alias is resolved out of band.
const SERVER_ALIAS: &str = "/name";

struct NameRow {
    node: NodeId,
    name: String,
}

#[derive(Default)]
struct NameStats {
    nlookups: u64,
    nlinks: u64,
    nunlinks: u64,
}

pub struct NameServer {
    port: Arc<dyn Transport>,
    node: NodeId,
    inbox: EndpointId,
    rows: Vec<NameRow>,
    nregistered: usize,
    stats: NameStats,
    log: logging::Logger,
}

impl NameServer {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        port: Arc<dyn Transport>,
        node: NodeId,
        log: L,
    ) -> IpcResult<NameServer> {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        let inbox = port
            .open(EndpointPath::mailbox(node), Direction::Rx)
            .map_err(|_| IpcError::Again)?;

        let mut rows: Vec<NameRow> = (0..NODES_NUM)
            .map(|raw| NameRow {
                node: NodeId::new(raw).expect("row node out of range"),
                name: String::new(),
            })
            .collect();

        rows[node.index()].name = BOOT_NAME.to_string();

        Ok(NameServer {
            port,
            node,
            inbox,
            rows,
            nregistered: 0,
            stats: NameStats::default(),
            log,
        })
    }

    /// Names currently linked, the boot name excluded.
    pub fn registered(&self) -> usize {
        self.nregistered
    }

    fn occupied_rows(&self) -> usize {
        self.rows.iter().filter(|row| !row.name.is_empty()).count()
    }

    fn lookup(&self, name: &str) -> IpcResult<NodeId> {
        if name == SERVER_ALIAS {
            return Ok(self.node);
        }

        self.rows
            .iter()
            .find(|row| !row.name.is_empty() && row.name == name)
            .map(|row| row.node)
            .ok_or(IpcError::NoEnt)
    }

    fn link(&mut self, node: NodeId, name: &str) -> IpcResult<()> {
        validate_name(name)?;

        if name == BOOT_NAME || name == SERVER_ALIAS {
            return Err(IpcError::Inval);
        }

        if self.rows.iter().any(|row| row.name == name) {
            return Err(IpcError::Inval);
        }

        let row = &mut self.rows[node.index()];

        if !row.name.is_empty() {
            return Err(IpcError::Inval);
        }

        row.name = name.to_string();
        self.nregistered += 1;

        Ok(())
    }

    fn unlink(&mut self, name: &str) -> IpcResult<()> {
        if name == BOOT_NAME || name == SERVER_ALIAS {
            return Err(IpcError::Inval);
        }

        match self
            .rows
            .iter_mut()
            .find(|row| !row.name.is_empty() && row.name == name)
        {
            Some(row) => {
                row.name.clear();
                self.nregistered -= 1;
                Ok(())
            }
            None => Err(IpcError::NoEnt),
        }
    }

    /// Handles one request and produces the reply frame.
    fn handle(&mut self, msg: &NameMessage) -> NameMessage {
        let mut reply = msg.clone();

        let result = match msg.opcode {
            NAME_LOOKUP => {
                self.stats.nlookups += 1;
                self.lookup(&msg.name).map(|node| node.index() as i32)
            }
            NAME_LINK => {
                self.stats.nlinks += 1;
                NodeId::new(msg.node_num as usize)
                    .and_then(|node| self.link(node, &msg.name))
                    .map(|_| msg.node_num)
            }
            NAME_UNLINK => {
                self.stats.nunlinks += 1;
                self.unlink(&msg.name).map(|_| 0)
            }
            _ => Err(IpcError::Inval),
        };

        match result {
            Ok(node_num) => {
                reply.opcode = NAME_SUCCESS;
                reply.node_num = node_num;
            }
            Err(err) => {
                reply.opcode = NAME_FAIL;
                reply.node_num = -err.errno();
            }
        }

        reply
    }

    /// Replies are written to a mailbox opened back to the request's
    /// source; the server never blocks on a client.
    fn reply(&self, to: NodeId, msg: &NameMessage) {
        let frame = msg.to_frame().expect("name reply encoding failed");

        let outbox = self
            .port
            .open(EndpointPath::mailbox(to), Direction::Tx)
            .expect("name reply open failed");
        self.port
            .write(outbox, &frame)
            .expect("name reply write failed");
        self.port.close(outbox).expect("name reply close failed");
    }

    /// Serves requests until an `EXIT` arrives.
    pub fn run(mut self) {
        let started = timestamp_secs();

        logging::info!(self.log, "name server alive"; "node" => %self.node);

        loop {
            let mut frame = [0u8; MSG_SIZE];
            let count = self
                .port
                .read(self.inbox, &mut frame)
                .expect("name server inbox read failed");
            assert_eq!(count, MSG_SIZE, "short name request");

            let msg = match NameMessage::from_frame(&frame) {
                Ok(msg) => msg,
                Err(_) => {
                    logging::warn!(self.log, "dropping malformed name request");
                    continue;
                }
            };

            logging::debug!(self.log, "name request";
                            "opcode" => msg.opcode, "source" => %msg.source, "name" => &msg.name);

            if msg.opcode == NAME_EXIT {
                let mut reply = msg.clone();
                reply.opcode = NAME_SUCCESS;
                self.reply(msg.source, &reply);
                break;
            }

            let reply = self.handle(&msg);
            self.reply(msg.source, &reply);
        }

        self.port
            .close(self.inbox)
            .expect("name server inbox close failed");

        logging::info!(self.log, "name server down";
                       "uptime_secs" => timestamp_secs() - started,
                       "lookups" => self.stats.nlookups,
                       "links" => self.stats.nlinks,
                       "unlinks" => self.stats.nunlinks,
                       "registered" => self.nregistered);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::noc::NAME_SERVER_NODE;
    use crate::runtime::Runtime;
    use crate::transport::Loopback;
    use std::thread;

    fn server(fabric: &Arc<Loopback>) -> NameServer {
        let port: Arc<dyn Transport> = Arc::new(fabric.attach(NAME_SERVER_NODE));

        NameServer::new(port, NAME_SERVER_NODE, None).unwrap()
    }

    fn node(raw: usize) -> NodeId {
        NodeId::new(raw).unwrap()
    }

    #[test]
    fn test_boot_table() {
        let fabric = Arc::new(Loopback::new());
        let server = server(&fabric);

        assert_eq!(server.lookup(BOOT_NAME).unwrap(), NAME_SERVER_NODE);
        assert_eq!(server.lookup(SERVER_ALIAS).unwrap(), NAME_SERVER_NODE);
        assert_eq!(server.registered(), 0);
        assert_eq!(server.occupied_rows(), 1);
    }

    #[test]
    fn test_link_lookup_unlink_laws() {
        let fabric = Arc::new(Loopback::new());
        let mut server = server(&fabric);

        server.link(node(4), "/svc").unwrap();
        assert_eq!(server.lookup("/svc").unwrap(), node(4));

        server.unlink("/svc").unwrap();
        assert_eq!(server.lookup("/svc").unwrap_err(), IpcError::NoEnt);
        assert_eq!(server.unlink("/svc").unwrap_err(), IpcError::NoEnt);
    }

    #[test]
    fn test_links_minus_unlinks_equals_occupancy() {
        let fabric = Arc::new(Loopback::new());
        let mut server = server(&fabric);

        server.link(node(3), "/a").unwrap();
        server.link(node(4), "/b").unwrap();
        server.link(node(5), "/c").unwrap();
        server.unlink("/b").unwrap();

        // Boot row aside, occupancy tracks successful links minus unlinks.
        assert_eq!(server.registered(), 2);
        assert_eq!(server.occupied_rows(), server.registered() + 1);
    }

    #[test]
    fn test_link_rejections() {
        let fabric = Arc::new(Loopback::new());
        let mut server = server(&fabric);

        server.link(node(4), "/svc").unwrap();

        // Names are unique across the table.
        assert_eq!(server.link(node(5), "/svc").unwrap_err(), IpcError::Inval);

        // One name per node row.
        assert_eq!(server.link(node(4), "/other").unwrap_err(), IpcError::Inval);

        // Reserved names never link or unlink.
        assert_eq!(server.link(node(5), BOOT_NAME).unwrap_err(), IpcError::Inval);
        assert_eq!(server.link(node(5), SERVER_ALIAS).unwrap_err(), IpcError::Inval);
        assert_eq!(server.unlink(BOOT_NAME).unwrap_err(), IpcError::Inval);
    }

    #[test]
    fn test_handle_fail_reply_carries_errcode() {
        let fabric = Arc::new(Loopback::new());
        let mut server = server(&fabric);

        let msg = NameMessage::new(node(4), NAME_LOOKUP, "/nosuch");
        let reply = server.handle(&msg);

        assert_eq!(reply.opcode, NAME_FAIL);
        assert_eq!(reply.node_num, -IpcError::NoEnt.errno());
    }

    #[test]
    fn test_rpc_roundtrip() {
        let fabric = Arc::new(Loopback::new());
        let server = server(&fabric);
        let worker = thread::spawn(move || server.run());

        let client_node = node(4);
        let rt =
            Runtime::setup(Arc::new(fabric.attach(client_node)), client_node, None).unwrap();

        rt.name_link(node(6), "/svc").unwrap();
        assert_eq!(rt.name_lookup("/svc").unwrap(), node(6));

        rt.name_unlink("/svc").unwrap();
        assert_eq!(rt.name_lookup("/svc").unwrap_err(), IpcError::NoEnt);

        rt.name_exit().unwrap();
        worker.join().unwrap();

        rt.shutdown().unwrap();
    }
}
