use std::fmt;
use std::io;

pub type IpcResult<T> = Result<T, IpcError>;

/// Error kinds surfaced by the connector layer and the services. Connectors
/// return these directly; servers translate them into `FAIL` replies with an
/// `errcode` field and clients map the code back.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IpcError {
    /// Malformed argument: bad id, size out of range, bad name.
    Inval,
    /// No such name, or no free descriptor in the pool.
    NoEnt,
    /// Transient resource shortage or transport failure; retryable.
    Again,
    /// Remote memory block table is full.
    NoMem,
    /// Operation attempted by a non-owner.
    Perm,
    /// Operation inconsistent with the descriptor mode.
    NotSup,
    /// Bad remote address or failed page lookup.
    Fault,
}

impl IpcError {
    /// The errno-style code carried in wire `errcode` fields.
    #[inline]
    pub fn errno(self) -> i32 {
        match self {
            IpcError::Inval => 22,
            IpcError::NoEnt => 2,
            IpcError::Again => 11,
            IpcError::NoMem => 12,
            IpcError::Perm => 1,
            IpcError::NotSup => 95,
            IpcError::Fault => 14,
        }
    }

    /// Maps a wire `errcode` back to an error kind. The sign is ignored;
    /// unknown codes collapse to `Fault`.
    #[inline]
    pub fn from_errno(code: i32) -> IpcError {
        match code.abs() {
            22 => IpcError::Inval,
            2 => IpcError::NoEnt,
            11 => IpcError::Again,
            12 => IpcError::NoMem,
            1 => IpcError::Perm,
            95 => IpcError::NotSup,
            _ => IpcError::Fault,
        }
    }
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            IpcError::Inval => "invalid argument",
            IpcError::NoEnt => "no such entry",
            IpcError::Again => "resource temporarily unavailable",
            IpcError::NoMem => "out of remote memory",
            IpcError::Perm => "operation not permitted",
            IpcError::NotSup => "operation not supported",
            IpcError::Fault => "bad address",
        };
        write!(f, "{}", name)
    }
}

impl From<io::Error> for IpcError {
    #[inline]
    fn from(_: io::Error) -> IpcError {
        IpcError::Fault
    }
}

/// Trait for manually encoded wire messages. All control messages are
/// fixed-size; implementors pad their frame to the full message size.
pub trait Encode {
    fn encode<W: io::Write>(&self, stream: &mut W) -> IpcResult<()>;
}

/// Trait for manually decoded wire messages.
pub trait Decode: Sized {
    fn decode<R: io::Read>(stream: &mut R) -> IpcResult<Self>;
}
