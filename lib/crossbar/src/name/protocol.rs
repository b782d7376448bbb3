//! Wire format of name-server requests and replies. One fixed-size mailbox
//! frame carries both directions; replies reuse the request struct.

use crate::mailbox::MSG_SIZE;
use crate::noc::NodeId;
use crate::shared::{Decode, Encode, IpcError, IpcResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io;
use std::str;

/// Maximum length of a process name, terminator included.
pub const NAME_MAX: usize = 64;

pub const NAME_EXIT: u8 = 0;
pub const NAME_LOOKUP: u8 = 1;
pub const NAME_LINK: u8 = 2;
pub const NAME_UNLINK: u8 = 3;
pub const NAME_SUCCESS: u8 = 10;
pub const NAME_FAIL: u8 = 11;

/// Checks the connector-facing name rules: non-empty, `NAME_MAX - 1` bytes
/// at most.
pub fn validate_name(name: &str) -> IpcResult<()> {
    if name.is_empty() || name.len() >= NAME_MAX {
        return Err(IpcError::Inval);
    }

    Ok(())
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NameMessage {
    pub source: NodeId,
    pub opcode: u8,
    pub port: u8,
    pub seq: u32,
    pub node_num: i32,
    pub name: String,
}

impl NameMessage {
    pub fn new(source: NodeId, opcode: u8, name: &str) -> NameMessage {
        NameMessage {
            source,
            opcode,
            port: 0,
            seq: 0,
            node_num: 0,
            name: name.to_string(),
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

    pub fn from_frame(frame: &[u8]) -> IpcResult<NameMessage> {
        Self::decode(&mut io::Cursor::new(frame))
    }
}

impl Encode for NameMessage {
    fn encode<W: io::Write>(&self, stream: &mut W) -> IpcResult<()> {
        if self.name.len() >= NAME_MAX {
            return Err(IpcError::Inval);
        }

        stream.write_u16::<LittleEndian>(self.source.index() as u16)?;
        stream.write_u8(self.opcode)?;
        stream.write_u8(self.port)?;
        stream.write_u32::<LittleEndian>(self.seq)?;
        stream.write_i32::<LittleEndian>(self.node_num)?;

        let mut name = [0u8; NAME_MAX];
        name[..self.name.len()].copy_from_slice(self.name.as_bytes());
        stream.write_all(&name)?;

        Ok(())
    }
}

impl Decode for NameMessage {
    fn decode<R: io::Read>(stream: &mut R) -> IpcResult<NameMessage> {
        let source = stream.read_u16::<LittleEndian>()? as usize;
        let opcode = stream.read_u8()?;
        let port = stream.read_u8()?;
        let seq = stream.read_u32::<LittleEndian>()?;
        let node_num = stream.read_i32::<LittleEndian>()?;

        let mut name = [0u8; NAME_MAX];
        stream.read_exact(&mut name)?;

        let end = name.iter().position(|&byte| byte == 0).unwrap_or(NAME_MAX);
        let name = str::from_utf8(&name[..end])
            .map_err(|_| IpcError::Inval)?
            .to_string();

        Ok(NameMessage {
            source: NodeId::new(source)?,
            opcode,
            port,
            seq,
            node_num,
            name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_carries_all_fields() {
        let node = NodeId::new(7).unwrap();
        let mut msg = NameMessage::new(node, NAME_LINK, "/svc");
        msg.seq = 41;
        msg.node_num = 9;

        let frame = msg.to_frame().unwrap();
        assert_eq!(frame.len(), MSG_SIZE);

        let decoded = NameMessage::from_frame(&frame).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_name_rules() {
        assert!(validate_name("/svc").is_ok());
        assert_eq!(validate_name("").unwrap_err(), IpcError::Inval);
        assert_eq!(
            validate_name(&"n".repeat(NAME_MAX)).unwrap_err(),
            IpcError::Inval
        );

        // The longest legal name still fits the frame.
        let name = "n".repeat(NAME_MAX - 1);
        let msg = NameMessage::new(NodeId::new(0).unwrap(), NAME_LOOKUP, &name);
        let decoded = NameMessage::from_frame(&msg.to_frame().unwrap()).unwrap();
        assert_eq!(decoded.name, name);
    }
}
