//! Client-side block cache: a small direct-mapped set of remote blocks,
//! hashed by block number modulo capacity. Eviction writes back dirty
//! entries before the slot is reused.

use crate::rmem::client::RmemClient;
use crate::rmem::protocol::BLOCK_SIZE;
use crate::shared::IpcResult;

/// Cache capacity, in blocks.
pub const CACHE_SLOTS: usize = 8;

struct CacheEntry {
    blknum: Option<u64>,
    dirty: bool,
    data: Vec<u8>,
}

pub struct BlockCache {
    entries: Vec<CacheEntry>,
}

impl BlockCache {
    pub fn new() -> BlockCache {
        BlockCache {
            entries: (0..CACHE_SLOTS)
                .map(|_| CacheEntry {
                    blknum: None,
                    dirty: false,
                    data: vec![0u8; BLOCK_SIZE],
                })
                .collect(),
        }
    }

    fn slot_of(blknum: u64) -> usize {
        blknum as usize % CACHE_SLOTS
    }

    /// Ensures `blknum` is cached and returns its slot, evicting (with
    /// write-back when dirty) whatever occupied it.
    pub fn lookup(&mut self, blknum: u64, client: &RmemClient) -> IpcResult<usize> {
        let slot = Self::slot_of(blknum);

        if self.entries[slot].blknum == Some(blknum) {
            return Ok(slot);
        }

        self.evict(slot, client)?;

        client.read_block(blknum, &mut self.entries[slot].data)?;
        self.entries[slot].blknum = Some(blknum);
        self.entries[slot].dirty = false;

        Ok(slot)
    }

    fn evict(&mut self, slot: usize, client: &RmemClient) -> IpcResult<()> {
        let entry = &mut self.entries[slot];

        if let Some(old) = entry.blknum {
            if entry.dirty {
                client.write_block(old, &entry.data)?;
            }

            entry.blknum = None;
            entry.dirty = false;
        }

        Ok(())
    }

    pub fn page(&self, slot: usize) -> &[u8] {
        &self.entries[slot].data
    }

    /// Mutable view of a cached page; marks the entry dirty.
    pub fn page_mut(&mut self, slot: usize) -> &mut [u8] {
        self.entries[slot].dirty = true;
        &mut self.entries[slot].data
    }

    /// Drops an entry without write-back. Used when its block is freed.
    pub fn discard(&mut self, blknum: u64) {
        let slot = Self::slot_of(blknum);

        if self.entries[slot].blknum == Some(blknum) {
            self.entries[slot].blknum = None;
            self.entries[slot].dirty = false;
        }
    }

    /// Writes every dirty entry back to its server.
    pub fn flush(&mut self, client: &RmemClient) -> IpcResult<()> {
        for entry in &mut self.entries {
            if let Some(blknum) = entry.blknum {
                if entry.dirty {
                    client.write_block(blknum, &entry.data)?;
                    entry.dirty = false;
                }
            }
        }

        Ok(())
    }
}
