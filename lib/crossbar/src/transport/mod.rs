//! Abstract transport consumed by the connector families.
//!
//! The contract mirrors the raw hardware primitives: endpoints keyed by
//! `(node, tag, direction)`, blocking reads and writes, an N-to-1 bitmask
//! rendezvous register, 1-to-N broadcast writes, and triggered asynchronous
//! receives. Any implementation providing these operations is acceptable;
//! the implementation is picked at startup and never exposed past the
//! connector modules.

pub mod loopback;

pub use loopback::{Loopback, NodePort};

use crate::noc::{EndpointPath, NodeId};
use crate::shared::IpcResult;

/// Opaque endpoint handle. Owned exclusively by one descriptor and closed
/// at descriptor release.
pub type EndpointId = u32;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Direction {
    Rx,
    Tx,
}

/// Per-endpoint counters retrievable with [`Transport::stats`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Stat {
    /// Bytes moved through the endpoint.
    Volume,
    /// Nanoseconds spent blocked on the endpoint.
    Latency,
}

/// In-flight asynchronous receive, produced by [`Transport::async_read_begin`]
/// and consumed by [`Transport::async_read_wait`].
#[derive(Debug)]
pub struct AsyncRead {
    pub(crate) endpoint: EndpointId,
    pub(crate) len: usize,
    pub(crate) trigger: u32,
}

/// Completed receive. The transport reports the delivering node so the
/// portal layer can retire the matching allow entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ReadCompletion {
    pub len: usize,
    pub from: NodeId,
}

pub trait Transport: Send + Sync {
    /// Opens an endpoint on the channel identified by `path`.
    fn open(&self, path: EndpointPath, dir: Direction) -> IpcResult<EndpointId>;

    /// Closes an endpoint.
    fn close(&self, endpoint: EndpointId) -> IpcResult<()>;

    /// Blocking read. Mailbox-family channels transfer whole frames; sync
    /// channels complete per the armed match register and deliver the
    /// accumulated word.
    fn read(&self, endpoint: EndpointId, buf: &mut [u8]) -> IpcResult<usize>;

    /// Blocking write of the whole buffer.
    fn write(&self, endpoint: EndpointId, buf: &[u8]) -> IpcResult<usize>;

    /// Arms the N-to-1 rendezvous register: it is initialized to `mask`,
    /// every received word is OR-ed in, and a blocked read completes once
    /// the register reaches all-ones, that is, once the received bits
    /// cover `!mask`.
    fn set_rx_match(&self, endpoint: EndpointId, mask: u64) -> IpcResult<()>;

    /// Configures the remotes a single write on this endpoint will signal.
    fn set_rx_ranks(&self, endpoint: EndpointId, ranks: &[EndpointPath]) -> IpcResult<()>;

    /// Begins a receive that completes only after `trigger` producers have
    /// delivered a total of `len` bytes.
    fn async_read_begin(
        &self,
        endpoint: EndpointId,
        len: usize,
        trigger: u32,
    ) -> IpcResult<AsyncRead>;

    /// Blocks until the receive completes and copies the data into `buf`.
    fn async_read_wait(&self, op: AsyncRead, buf: &mut [u8]) -> IpcResult<ReadCompletion>;

    /// Reads a per-endpoint statistic.
    fn stats(&self, endpoint: EndpointId, stat: Stat) -> IpcResult<u64>;
}
