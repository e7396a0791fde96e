use num_enum::IntoPrimitive;
use thiserror::Error;

use crate::Handle;

/// Failure kinds surfaced to the peer in an ATT Error Response.
///
/// The discriminant is the one-byte error code put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, IntoPrimitive)]
#[repr(u8)]
pub enum AttError {
    #[error("invalid handle")]
    InvalidHandle = 0x01,
    #[error("invalid pdu")]
    InvalidPdu = 0x04,
    #[error("request not supported")]
    RequestNotSupported = 0x06,
    #[error("invalid offset")]
    InvalidOffset = 0x07,
    #[error("invalid attribute value length")]
    InvalidLength = 0x0D,
    #[error("unlikely error")]
    UnlikelyError = 0x0E,
    #[error("insufficient resources")]
    InsufficientResource = 0x11,
    #[error("image checksum mismatch")]
    ChecksumMismatch = 0x80,
    #[error("operation failed")]
    OperationError = 0x85,
}

impl AttError {
    pub fn code(self) -> u8 {
        self.into()
    }
}

/// A request that failed, with enough context to build the error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("request {opcode:#04x} on handle {handle:#06x} failed: {kind}")]
pub struct RequestError {
    pub opcode: u8,
    pub handle: Handle,
    pub kind: AttError,
}

impl RequestError {
    pub fn new(opcode: u8, handle: Handle, kind: AttError) -> Self {
        Self {
            opcode,
            handle,
            kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty pdu")]
    Empty,
    #[error("pdu for opcode {0:#04x} is truncated")]
    Truncated(u8),
    #[error("malformed pdu for opcode {0:#04x}")]
    Malformed(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("output buffer too small")]
    BufferTooSmall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("too many attributes for the table")]
    TooManyAttributes,
    #[error("handle {0:#06x} is zero, duplicated or out of order")]
    BadHandle(Handle),
    #[error("attribute {0:#06x} exceeds the value capacity")]
    CapacityExceeded(Handle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("staging area is not open")]
    NotOpen,
    #[error("image does not fit the staging area")]
    NoSpace,
    #[error("write at {offset} does not follow the staged bytes")]
    OutOfOrder { offset: u32 },
    #[error("storage medium failure")]
    Medium,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UpgradeError {
    #[error("empty control-point write")]
    Empty,
    #[error("unknown command {0:#04x}")]
    UnknownCommand(u8),
    #[error("command expects {expected} parameter bytes, got {actual}")]
    BadLength { expected: usize, actual: usize },
    #[error("command not valid in the current state")]
    InvalidState,
    #[error("session is owned by another connection")]
    NotOwner,
    #[error("chunk runs past the announced image size")]
    Overrun,
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<UpgradeError> for AttError {
    fn from(err: UpgradeError) -> Self {
        match err {
            UpgradeError::BadLength { .. } | UpgradeError::Overrun => AttError::InvalidLength,
            UpgradeError::ChecksumMismatch => AttError::ChecksumMismatch,
            UpgradeError::Empty
            | UpgradeError::UnknownCommand(_)
            | UpgradeError::InvalidState
            | UpgradeError::NotOwner
            | UpgradeError::Store(_) => AttError::OperationError,
        }
    }
}
