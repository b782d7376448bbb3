//! Remote memory client: raw block operations against the servers, and the
//! remote heap layered over them (a process-local remote-address table,
//! the block cache, and a page-fault hook).

use crate::mailbox::{Mbxid, MSG_SIZE};
use crate::noc::NodeId;
use crate::portal::PORTAL_MAX;
use crate::rmem::cache::{BlockCache, CACHE_SLOTS};
use crate::rmem::protocol::{
    server_name, RmemMessage, BLOCK_SHIFT, BLOCK_SIZE, NUM_BLOCKS, RMEM_ACK, RMEM_ALLOC,
    RMEM_EXIT, RMEM_FREE, RMEM_READ, RMEM_SUCCESS, RMEM_WRITE,
};
use crate::runtime::Runtime;
use crate::shared::{IpcError, IpcResult};
use girder::logging;
use std::sync::Mutex;

/// Length of the process-local remote-address table. Entry 0 is reserved so
/// that address zero stays null.
pub const TABLE_LENGTH: usize = 128;

/// A block-granular remote virtual address.
pub type RemoteAddr = u64;

struct ServerLink {
    outbox: Mbxid,
    node: NodeId,
}

pub struct RmemClient<'rt> {
    rt: &'rt Runtime,
    servers: Vec<ServerLink>,
    /// Serializes one transaction at a time; doubles as the round-robin
    /// allocation counter.
    inflight: Mutex<u64>,
    log: logging::Logger,
}

impl<'rt> RmemClient<'rt> {
    /// Resolves and opens the control links to every server instance.
    pub fn connect<'a, L: Into<Option<&'a logging::Logger>>>(
        rt: &'rt Runtime,
        nservers: usize,
        log: L,
    ) -> IpcResult<RmemClient<'rt>> {
        if nservers == 0 {
            return Err(IpcError::Inval);
        }

        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        let mut servers = Vec::with_capacity(nservers);

        for serverid in 0..nservers {
            let name = server_name(serverid);
            let node = rt.name_lookup(&name)?;
            let outbox = rt.mailbox_open(&name)?;

            servers.push(ServerLink { outbox, node });
        }

        Ok(RmemClient {
            rt,
            servers,
            inflight: Mutex::new(0),
            log,
        })
    }

    /// Closes the control links.
    pub fn disconnect(self) -> IpcResult<()> {
        for link in &self.servers {
            self.rt.mailbox_close(link.outbox)?;
        }

        Ok(())
    }

    /// Total block capacity across all servers.
    pub fn total_blocks(&self) -> usize {
        NUM_BLOCKS * self.servers.len()
    }

    fn route(&self, blknum: u64) -> &ServerLink {
        &self.servers[blknum as usize % self.servers.len()]
    }

    fn post(&self, link: &ServerLink, msg: &RmemMessage) -> IpcResult<()> {
        let frame = msg.to_frame()?;

        self.rt.mailbox_write(link.outbox, &frame)
    }

    fn read_reply(&self) -> IpcResult<RmemMessage> {
        let mut frame = [0u8; MSG_SIZE];

        let count = self
            .rt
            .port()
            .read(self.rt.inbox_endpoint(), &mut frame)
            .map_err(|_| IpcError::Again)?;
        assert_eq!(count, MSG_SIZE, "short rmem reply");

        RmemMessage::from_frame(&frame)
    }

    /// Allocates one block, round-robin across the servers.
    pub fn alloc(&self) -> IpcResult<u64> {
        let mut counter = self.inflight.lock().expect("rmem client lock poisoned");

        let link = &self.servers[*counter as usize % self.servers.len()];
        let msg = RmemMessage::new(self.rt.node(), RMEM_ALLOC);

        self.post(link, &msg)?;
        let reply = self.read_reply()?;

        if reply.opcode != RMEM_SUCCESS {
            return Err(IpcError::from_errno(reply.errcode));
        }

        *counter += 1;

        logging::trace!(self.log, "rmem block allocated"; "blknum" => reply.blknum);

        Ok(reply.blknum)
    }

    /// Frees one block.
    pub fn free(&self, blknum: u64) -> IpcResult<()> {
        if blknum as usize >= self.total_blocks() {
            return Err(IpcError::Inval);
        }

        let _guard = self.inflight.lock().expect("rmem client lock poisoned");

        let link = self.route(blknum);
        let mut msg = RmemMessage::new(self.rt.node(), RMEM_FREE);
        msg.blknum = blknum;

        self.post(link, &msg)?;
        let reply = self.read_reply()?;

        girder::choose!(reply.opcode == RMEM_SUCCESS => Ok(()),
                        Err(IpcError::from_errno(reply.errcode)))
    }

    fn validate_transfer(&self, blknum: u64, len: usize) -> IpcResult<()> {
        if blknum as usize >= self.total_blocks() {
            return Err(IpcError::Inval);
        }

        if len == 0 || len % BLOCK_SIZE != 0 || len > PORTAL_MAX {
            return Err(IpcError::Inval);
        }

        Ok(())
    }

    /// Reads `buf.len()` bytes starting at `blknum`, following the server's
    /// transaction ordering: request, ack, portal data, final status.
    pub fn read_block(&self, blknum: u64, buf: &mut [u8]) -> IpcResult<()> {
        self.validate_transfer(blknum, buf.len())?;

        let _guard = self.inflight.lock().expect("rmem client lock poisoned");

        let link = self.route(blknum);
        let mut msg = RmemMessage::new(self.rt.node(), RMEM_READ);
        msg.blknum = blknum;
        msg.size = buf.len() as u32;

        self.post(link, &msg)?;

        let first = self.read_reply()?;
        if first.opcode != RMEM_ACK {
            return Err(IpcError::from_errno(first.errcode));
        }

        self.rt.portal_allow(self.rt.stdin_portal(), link.node)?;
        self.rt.portal_read(self.rt.stdin_portal(), buf)?;

        let status = self.read_reply()?;

        girder::choose!(status.opcode == RMEM_SUCCESS => Ok(()),
                        Err(IpcError::from_errno(status.errcode)))
    }

    /// Writes `buf.len()` bytes starting at `blknum`.
    pub fn write_block(&self, blknum: u64, buf: &[u8]) -> IpcResult<()> {
        self.validate_transfer(blknum, buf.len())?;

        let _guard = self.inflight.lock().expect("rmem client lock poisoned");

        let link = self.route(blknum);
        let mut msg = RmemMessage::new(self.rt.node(), RMEM_WRITE);
        msg.blknum = blknum;
        msg.size = buf.len() as u32;

        self.post(link, &msg)?;

        let first = self.read_reply()?;
        if first.opcode != RMEM_ACK {
            return Err(IpcError::from_errno(first.errcode));
        }

        let portal = self.rt.portal_open(link.node)?;
        self.rt.portal_write(portal, buf)?;
        self.rt.portal_close(portal)?;

        let status = self.read_reply()?;

        girder::choose!(status.opcode == RMEM_SUCCESS => Ok(()),
                        Err(IpcError::from_errno(status.errcode)))
    }

    /// Asks a server instance to drain and exit.
    pub fn shutdown_server(&self, serverid: usize) -> IpcResult<()> {
        let link = self.servers.get(serverid).ok_or(IpcError::Inval)?;

        let _guard = self.inflight.lock().expect("rmem client lock poisoned");

        self.post(link, &RmemMessage::new(self.rt.node(), RMEM_EXIT))?;
        let reply = self.read_reply()?;

        girder::choose!(reply.opcode == RMEM_SUCCESS => Ok(()),
                        Err(IpcError::from_errno(reply.errcode)))
    }
}

/// Remote virtual allocator and page cache front.
///
/// `ralloc` reserves consecutive table entries backed by freshly allocated
/// remote blocks; addresses are entry indices shifted into a virtual range.
/// Reads and writes stay within one block.
pub struct RemoteHeap<'rt> {
    client: RmemClient<'rt>,
    table: Vec<Option<u64>>,
    rbrk: usize,
    cache: BlockCache,
    maps: Vec<Option<RemoteAddr>>,
}

impl<'rt> RemoteHeap<'rt> {
    pub fn new(client: RmemClient<'rt>) -> RemoteHeap<'rt> {
        RemoteHeap {
            client,
            table: vec![None; TABLE_LENGTH],
            rbrk: 1,
            cache: BlockCache::new(),
            maps: vec![None; CACHE_SLOTS],
        }
    }

    fn addr_of(base: usize) -> RemoteAddr {
        (base as u64) << BLOCK_SHIFT
    }

    /// Decomposes a remote address into `(table entry, in-block offset)`.
    fn lookup(&self, addr: RemoteAddr) -> IpcResult<(usize, usize)> {
        if addr == 0 {
            return Err(IpcError::Fault);
        }

        let base = (addr >> BLOCK_SHIFT) as usize;

        if base >= TABLE_LENGTH {
            return Err(IpcError::Inval);
        }

        if self.table[base].is_none() {
            return Err(IpcError::Fault);
        }

        Ok((base, addr as usize & (BLOCK_SIZE - 1)))
    }

    /// Reserves `nblocks` consecutive entries, allocating a remote block
    /// for each.
    pub fn ralloc(&mut self, nblocks: usize) -> IpcResult<RemoteAddr> {
        if nblocks == 0 {
            return Err(IpcError::Inval);
        }

        if self.rbrk + nblocks >= TABLE_LENGTH {
            return Err(IpcError::NoMem);
        }

        let base = self.rbrk;

        for i in 0..nblocks {
            match self.client.alloc() {
                Ok(blknum) => self.table[base + i] = Some(blknum),
                Err(err) => {
                    for entry in &mut self.table[base..base + i] {
                        let blknum = entry.take().expect("allocated entry vanished");
                        let _ = self.client.free(blknum);
                    }

                    return Err(err);
                }
            }
        }

        self.rbrk += nblocks;

        Ok(Self::addr_of(base))
    }

    /// Frees every block from the entry's base up to the current break and
    /// contracts the table.
    pub fn rfree(&mut self, addr: RemoteAddr) -> IpcResult<()> {
        let (base, _) = self.lookup(addr)?;

        if self.rbrk - base < 1 {
            return Err(IpcError::Fault);
        }

        for index in base..self.rbrk {
            if let Some(blknum) = self.table[index].take() {
                self.cache.discard(blknum);
                self.client.free(blknum)?;
            }
        }

        self.rbrk = base;

        Ok(())
    }

    /// Copies `buf.len()` bytes from remote memory. The span must stay
    /// within one block.
    pub fn rread(&mut self, buf: &mut [u8], addr: RemoteAddr) -> IpcResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let (base, offset) = self.lookup(addr)?;

        if offset + buf.len() > BLOCK_SIZE {
            return Err(IpcError::Inval);
        }

        let blknum = self.table[base].expect("mapped entry vanished");
        let slot = self.cache.lookup(blknum, &self.client)?;

        buf.copy_from_slice(&self.cache.page(slot)[offset..offset + buf.len()]);

        Ok(buf.len())
    }

    /// Copies `buf.len()` bytes into remote memory through the cache.
    pub fn rwrite(&mut self, addr: RemoteAddr, buf: &[u8]) -> IpcResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let (base, offset) = self.lookup(addr)?;

        if offset + buf.len() > BLOCK_SIZE {
            return Err(IpcError::Inval);
        }

        let blknum = self.table[base].expect("mapped entry vanished");
        let slot = self.cache.lookup(blknum, &self.client)?;

        self.cache.page_mut(slot)[offset..offset + buf.len()].copy_from_slice(buf);

        Ok(buf.len())
    }

    /// Page-fault hook: resolves the faulting page, pulls its block into
    /// the cache and installs the mapping, displacing whatever previously
    /// mapped the same cache slot.
    pub fn rfault(&mut self, vaddr: RemoteAddr) -> IpcResult<()> {
        let vaddr = vaddr & !((BLOCK_SIZE as u64) - 1);

        let (base, _) = self.lookup(vaddr)?;

        let blknum = self.table[base].expect("mapped entry vanished");
        let slot = self
            .cache
            .lookup(blknum, &self.client)
            .map_err(|_| IpcError::Fault)?;

        self.maps[slot] = Some(vaddr);

        Ok(())
    }

    /// The page currently mapped at a cache slot, if any.
    pub fn mapping(&self, vaddr: RemoteAddr) -> bool {
        self.maps.contains(&Some(vaddr & !((BLOCK_SIZE as u64) - 1)))
    }

    /// Writes dirty cached blocks back to their servers.
    pub fn flush(&mut self) -> IpcResult<()> {
        self.cache.flush(&self.client)
    }

    /// Flushes and releases the connection.
    pub fn shutdown(mut self) -> IpcResult<()> {
        self.flush()?;
        self.client.disconnect()
    }
}
