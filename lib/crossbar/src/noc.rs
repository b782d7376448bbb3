//! Logical NoC topology: node numbering, node classes and the per-family
//! tag partitions that keep mailbox, portal and sync traffic from aliasing.

use crate::shared::{IpcError, IpcResult};
use std::fmt;

/// Number of addressable nodes in the NoC.
pub const NODES_NUM: usize = 18;

/// Number of I/O nodes. Nodes `0..IO_NODES_NUM` sit on the I/O fabric, the
/// rest are compute nodes.
pub const IO_NODES_NUM: usize = 2;

/// Node hosting the name server.
pub const NAME_SERVER_NODE: NodeId = NodeId(0);

/// Tags 0 and 1 are reserved by the transport.
pub const RESERVED_TAGS: u16 = 2;

const MAILBOX_TAG_OFF: u16 = RESERVED_TAGS;
const PORTAL_TAG_OFF: u16 = MAILBOX_TAG_OFF + NODES_NUM as u16;
const SYNC_TAG_OFF: u16 = PORTAL_TAG_OFF + NODES_NUM as u16;
const PORTAL_ACK_TAG_OFF: u16 = SYNC_TAG_OFF + NODES_NUM as u16;

/// One addressable processing element.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct NodeId(u16);

impl NodeId {
    pub(crate) const ZERO: NodeId = NodeId(0);

    /// Constructs a node id, rejecting numbers outside `[0, NODES_NUM)`.
    #[inline]
    pub fn new(raw: usize) -> IpcResult<NodeId> {
        if raw >= NODES_NUM {
            return Err(IpcError::Inval);
        }

        Ok(NodeId(raw as u16))
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// True for nodes on the I/O fabric.
    #[inline]
    pub fn is_io(self) -> bool {
        self.index() < IO_NODES_NUM
    }

    /// True for nodes in a compute cluster.
    #[inline]
    pub fn is_compute(self) -> bool {
        !self.is_io()
    }

    /// The rendezvous-word bit assigned to this node.
    #[inline]
    pub fn bit(self) -> u64 {
        1u64 << self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connector families, one per tag partition.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TagFamily {
    Reserved,
    Mailbox,
    Portal,
    Sync,
    PortalAck,
}

/// A per-family integer disambiguating transport paths to the same node.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Tag(u16);

impl Tag {
    #[inline]
    pub fn family(self) -> TagFamily {
        match self.0 {
            t if t < MAILBOX_TAG_OFF => TagFamily::Reserved,
            t if t < PORTAL_TAG_OFF => TagFamily::Mailbox,
            t if t < SYNC_TAG_OFF => TagFamily::Portal,
            t if t < PORTAL_ACK_TAG_OFF => TagFamily::Sync,
            _ => TagFamily::PortalAck,
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One end of a transport channel, identified as `node:tag`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct EndpointPath {
    pub node: NodeId,
    pub tag: Tag,
}

impl EndpointPath {
    /// The mailbox channel of `node`.
    #[inline]
    pub fn mailbox(node: NodeId) -> EndpointPath {
        EndpointPath {
            node,
            tag: Tag(MAILBOX_TAG_OFF + node.0),
        }
    }

    /// The portal data channel of `node`.
    #[inline]
    pub fn portal(node: NodeId) -> EndpointPath {
        EndpointPath {
            node,
            tag: Tag(PORTAL_TAG_OFF + node.0),
        }
    }

    /// The sync channel of `node`.
    #[inline]
    pub fn sync(node: NodeId) -> EndpointPath {
        EndpointPath {
            node,
            tag: Tag(SYNC_TAG_OFF + node.0),
        }
    }

    /// The portal ready-handshake channel of `node`.
    #[inline]
    pub fn portal_ack(node: NodeId) -> EndpointPath {
        EndpointPath {
            node,
            tag: Tag(PORTAL_ACK_TAG_OFF + node.0),
        }
    }

    #[inline]
    pub fn family(&self) -> TagFamily {
        self.tag.family()
    }
}

impl fmt::Display for EndpointPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.tag)
    }
}
