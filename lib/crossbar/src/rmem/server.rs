//! Remote memory server core.
//!
//! Serves a `NUM_BLOCKS × BLOCK_SIZE` page store. Control messages arrive
//! on the server's named mailbox; bulk data moves over portals. Every data
//! transaction follows the same ordering: acknowledge on the mailbox,
//! transfer on the portal, final status on the mailbox.
//!
//! Several instances partition the block space; block `b` belongs to server
//! `b mod nservers`, and each instance numbers its local blocks
//! contiguously in its store.

use crate::mailbox::{Mbxid, MSG_SIZE};
use crate::noc::NodeId;
use crate::portal::PORTAL_MAX;
use crate::rmem::protocol::{
    server_name, RmemMessage, BLOCK_SIZE, NUM_BLOCKS, RMEM_ACK, RMEM_ALLOC, RMEM_EXIT, RMEM_FAIL,
    RMEM_FREE, RMEM_READ, RMEM_SUCCESS, RMEM_WRITE,
};
use crate::runtime::Runtime;
use crate::shared::{IpcError, IpcResult};
use crate::transport::{Direction, Transport};
use girder::logging;
use girder::time::timestamp_secs;
use std::sync::Arc;

/// Block allocation bitmap: one bit per block, first-clear-bit allocation.
pub(crate) struct Bitmap {
    words: Vec<u64>,
    nbits: usize,
}

impl Bitmap {
    pub(crate) fn new(nbits: usize) -> Bitmap {
        Bitmap {
            words: vec![0; (nbits + 63) / 64],
            nbits,
        }
    }

    pub(crate) fn is_set(&self, bit: usize) -> bool {
        self.words[bit / 64] & (1u64 << (bit % 64)) != 0
    }

    pub(crate) fn set(&mut self, bit: usize) {
        self.words[bit / 64] |= 1u64 << (bit % 64);
    }

    pub(crate) fn clear(&mut self, bit: usize) {
        self.words[bit / 64] &= !(1u64 << (bit % 64));
    }

    /// Marks and returns the first clear bit.
    pub(crate) fn alloc(&mut self) -> Option<usize> {
        for bit in 0..self.nbits {
            if !self.is_set(bit) {
                self.set(bit);
                return Some(bit);
            }
        }

        None
    }
}

#[derive(Default)]
struct RmemStats {
    nallocs: u64,
    nfrees: u64,
    nreads: u64,
    nwrites: u64,
    read: u64,
    written: u64,
}

pub struct RmemServer {
    rt: Runtime,
    serverid: usize,
    nservers: usize,
    inbox: Mbxid,
    store: Vec<u8>,
    blocks: Bitmap,
    stats: RmemStats,
    log: logging::Logger,
}

impl RmemServer {
    /// Brings a server instance up on `node` and registers its name.
    /// The name server must already be reachable.
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        port: Arc<dyn Transport>,
        node: NodeId,
        serverid: usize,
        nservers: usize,
        log: L,
    ) -> IpcResult<RmemServer> {
        if nservers == 0 || serverid >= nservers {
            return Err(IpcError::Inval);
        }

        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        let rt = Runtime::setup(port, node, Some(&log))?;
        let inbox = rt.mailbox_create(&server_name(serverid))?;

        Ok(RmemServer {
            rt,
            serverid,
            nservers,
            inbox,
            store: vec![0u8; NUM_BLOCKS * BLOCK_SIZE],
            blocks: Bitmap::new(NUM_BLOCKS),
            stats: RmemStats::default(),
            log,
        })
    }

    fn global_block(&self, local: usize) -> u64 {
        (local * self.nservers + self.serverid) as u64
    }

    /// Maps a global block number onto this instance's store.
    fn local_block(&self, blknum: u64) -> IpcResult<usize> {
        let blknum = blknum as usize;

        if blknum % self.nservers != self.serverid {
            return Err(IpcError::Inval);
        }

        let local = blknum / self.nservers;

        if local >= NUM_BLOCKS {
            return Err(IpcError::Inval);
        }

        Ok(local)
    }

    /// Validates a transfer: block-aligned size, in range, every covered
    /// block allocated. Returns the store span.
    fn validate_span(&self, blknum: u64, size: u32) -> IpcResult<(usize, usize)> {
        let local = self.local_block(blknum)?;
        let len = size as usize;

        if len == 0 || len % BLOCK_SIZE != 0 || len > PORTAL_MAX {
            return Err(IpcError::Inval);
        }

        let nblocks = len / BLOCK_SIZE;

        if local + nblocks > NUM_BLOCKS {
            return Err(IpcError::Inval);
        }

        for block in local..local + nblocks {
            if !self.blocks.is_set(block) {
                return Err(IpcError::Fault);
            }
        }

        Ok((local * BLOCK_SIZE, len))
    }

    fn handle_alloc(&mut self) -> IpcResult<u64> {
        let local = self.blocks.alloc().ok_or(IpcError::NoMem)?;

        self.stats.nallocs += 1;

        Ok(self.global_block(local))
    }

    fn handle_free(&mut self, blknum: u64) -> IpcResult<()> {
        let local = self.local_block(blknum)?;

        if !self.blocks.is_set(local) {
            return Err(IpcError::Inval);
        }

        self.blocks.clear(local);
        self.stats.nfrees += 1;

        Ok(())
    }

    fn send(&self, to: NodeId, msg: &RmemMessage) {
        let frame = msg.to_frame().expect("rmem reply encoding failed");

        let outbox = self
            .rt
            .port()
            .open(crate::noc::EndpointPath::mailbox(to), Direction::Tx)
            .expect("rmem reply open failed");
        self.rt
            .port()
            .write(outbox, &frame)
            .expect("rmem reply write failed");
        self.rt
            .port()
            .close(outbox)
            .expect("rmem reply close failed");
    }

    fn ack(&self, msg: &RmemMessage) {
        let mut ack = msg.clone();
        ack.opcode = RMEM_ACK;
        ack.errcode = 0;

        self.send(msg.source, &ack);
    }

    fn status(&self, msg: &RmemMessage, result: IpcResult<u64>) {
        let mut reply = msg.clone();

        match result {
            Ok(blknum) => {
                reply.opcode = RMEM_SUCCESS;
                reply.blknum = blknum;
                reply.errcode = 0;
            }
            Err(err) => {
                reply.opcode = RMEM_FAIL;
                reply.errcode = -err.errno();
            }
        }

        self.send(msg.source, &reply);
    }

    /// READ: ack, push the span through an output portal, final status.
    fn handle_read(&mut self, msg: &RmemMessage) {
        logging::debug!(self.log, "rmem read";
                        "source" => %msg.source, "blknum" => msg.blknum, "size" => msg.size);

        let (offset, len) = match self.validate_span(msg.blknum, msg.size) {
            Ok(span) => span,
            Err(err) => return self.status(msg, Err(err)),
        };

        self.ack(msg);

        let portal = self
            .rt
            .portal_open(msg.source)
            .expect("rmem data portal open failed");
        self.rt
            .portal_write(portal, &self.store[offset..offset + len])
            .expect("rmem data portal write failed");
        self.rt
            .portal_close(portal)
            .expect("rmem data portal close failed");

        self.stats.nreads += 1;
        self.stats.read += len as u64;

        self.status(msg, Ok(msg.blknum));
    }

    /// WRITE: ack, pull the span through the input portal, final status.
    fn handle_write(&mut self, msg: &RmemMessage) {
        logging::debug!(self.log, "rmem write";
                        "source" => %msg.source, "blknum" => msg.blknum, "size" => msg.size);

        let (offset, len) = match self.validate_span(msg.blknum, msg.size) {
            Ok(span) => span,
            Err(err) => return self.status(msg, Err(err)),
        };

        self.ack(msg);

        let inportal = self.rt.stdin_portal();

        self.rt
            .portal_allow(inportal, msg.source)
            .expect("rmem data portal allow failed");
        self.rt
            .portal_read(inportal, &mut self.store[offset..offset + len])
            .expect("rmem data portal read failed");

        self.stats.nwrites += 1;
        self.stats.written += len as u64;

        self.status(msg, Ok(msg.blknum));
    }

    /// Serves requests until an `EXIT` arrives. Pending requests complete
    /// before the shutdown.
    pub fn run(mut self) {
        let started = timestamp_secs();

        logging::info!(self.log, "rmem server alive";
                       "node" => %self.rt.node(), "serverid" => self.serverid);

        loop {
            let mut frame = [0u8; MSG_SIZE];
            self.rt
                .mailbox_read(self.inbox, &mut frame)
                .expect("rmem server inbox read failed");

            let msg = match RmemMessage::from_frame(&frame) {
                Ok(msg) => msg,
                Err(_) => {
                    logging::warn!(self.log, "dropping malformed rmem request");
                    continue;
                }
            };

            match msg.opcode {
                RMEM_ALLOC => {
                    let result = self.handle_alloc();
                    self.status(&msg, result);
                }
                RMEM_FREE => {
                    let result = self.handle_free(msg.blknum).map(|_| msg.blknum);
                    self.status(&msg, result);
                }
                RMEM_READ => self.handle_read(&msg),
                RMEM_WRITE => self.handle_write(&msg),
                RMEM_EXIT => {
                    self.status(&msg, Ok(0));
                    break;
                }
                _ => self.status(&msg, Err(IpcError::Inval)),
            }
        }

        logging::info!(self.log, "rmem server down";
                       "uptime_secs" => timestamp_secs() - started,
                       "allocs" => self.stats.nallocs,
                       "frees" => self.stats.nfrees,
                       "nreads" => self.stats.nreads,
                       "read" => self.stats.read,
                       "nwrites" => self.stats.nwrites,
                       "written" => self.stats.written);

        self.rt
            .mailbox_unlink(self.inbox)
            .expect("rmem name unlink failed");
        self.rt.shutdown().expect("rmem runtime shutdown failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap_allocates_distinct_bits() {
        let mut bitmap = Bitmap::new(NUM_BLOCKS);
        let mut seen = Vec::new();

        while let Some(bit) = bitmap.alloc() {
            assert!(!seen.contains(&bit));
            seen.push(bit);
        }

        assert_eq!(seen.len(), NUM_BLOCKS);
    }

    #[test]
    fn test_bitmap_clear_reuses_bit() {
        let mut bitmap = Bitmap::new(8);

        assert_eq!(bitmap.alloc(), Some(0));
        assert_eq!(bitmap.alloc(), Some(1));

        bitmap.clear(0);
        assert_eq!(bitmap.alloc(), Some(0));
    }

    #[test]
    fn test_bitmap_word_boundaries() {
        let mut bitmap = Bitmap::new(130);

        for expected in 0..130 {
            assert_eq!(bitmap.alloc(), Some(expected));
        }

        assert_eq!(bitmap.alloc(), None);

        bitmap.clear(64);
        assert!(!bitmap.is_set(64));
        assert!(bitmap.is_set(63));
        assert!(bitmap.is_set(65));
        assert_eq!(bitmap.alloc(), Some(64));
    }
}
