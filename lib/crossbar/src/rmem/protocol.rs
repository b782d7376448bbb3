//! Wire format of remote-memory requests and replies.

use crate::mailbox::MSG_SIZE;
use crate::noc::NodeId;
use crate::shared::{Decode, Encode, IpcResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io;

/// Remote memory block size, in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// log2 of [`BLOCK_SIZE`].
pub const BLOCK_SHIFT: u32 = 12;

/// Blocks served per server instance.
pub const NUM_BLOCKS: usize = 32;

pub const RMEM_EXIT: u8 = 0;
pub const RMEM_READ: u8 = 1;
pub const RMEM_WRITE: u8 = 2;
pub const RMEM_ALLOC: u8 = 3;
pub const RMEM_FREE: u8 = 4;
pub const RMEM_ACK: u8 = 5;
pub const RMEM_SUCCESS: u8 = 10;
pub const RMEM_FAIL: u8 = 11;

/// Registered name of a server instance. Server 0 owns the reserved
/// `/rmem` name.
pub fn server_name(serverid: usize) -> String {
    girder::choose!(serverid == 0 => "/rmem".to_string(), format!("/rmem{}", serverid))
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RmemMessage {
    pub source: NodeId,
    pub opcode: u8,
    pub mailbox_port: u8,
    pub portal_port: u8,
    pub blknum: u64,
    pub size: u32,
    pub errcode: i32,
}

impl RmemMessage {
    pub fn new(source: NodeId, opcode: u8) -> RmemMessage {
        RmemMessage {
            source,
            opcode,
            mailbox_port: 0,
            portal_port: 0,
            blknum: 0,
            size: 0,
            errcode: 0,
        }
    }

    /// Encodes into one padded mailbox frame.
    pub fn to_frame(&self) -> IpcResult<[u8; MSG_SIZE]> {
        let mut frame = [0u8; MSG_SIZE];

        {
            let mut cursor = io::Cursor::new(&mut frame[..]);
            self.encode(&mut cursor)?;
        }

        Ok(frame)
    }

    pub fn from_frame(frame: &[u8]) -> IpcResult<RmemMessage> {
        Self::decode(&mut io::Cursor::new(frame))
    }
}

impl Encode for RmemMessage {
    fn encode<W: io::Write>(&self, stream: &mut W) -> IpcResult<()> {
        stream.write_u16::<LittleEndian>(self.source.index() as u16)?;
        stream.write_u8(self.opcode)?;
        stream.write_u8(self.mailbox_port)?;
        stream.write_u8(self.portal_port)?;
        stream.write_all(&[0u8; 3])?;
        stream.write_u64::<LittleEndian>(self.blknum)?;
        stream.write_u32::<LittleEndian>(self.size)?;
        stream.write_i32::<LittleEndian>(self.errcode)?;

        Ok(())
    }
}

impl Decode for RmemMessage {
    fn decode<R: io::Read>(stream: &mut R) -> IpcResult<RmemMessage> {
        let source = stream.read_u16::<LittleEndian>()? as usize;
        let opcode = stream.read_u8()?;
        let mailbox_port = stream.read_u8()?;
        let portal_port = stream.read_u8()?;

        let mut pad = [0u8; 3];
        stream.read_exact(&mut pad)?;

        let blknum = stream.read_u64::<LittleEndian>()?;
        let size = stream.read_u32::<LittleEndian>()?;
        let errcode = stream.read_i32::<LittleEndian>()?;

        Ok(RmemMessage {
            source: crate::noc::NodeId::new(source)?,
            opcode,
            mailbox_port,
            portal_port,
            blknum,
            size,
            errcode,
        })
    }
}
