// SPDX-License-Identifier: MIT

//! Common error types.
//!
//! Resolver failures follow the NTSTATUS convention used by the interception
//! layer: every error maps onto one status code, and any status with the
//! error severity bits set is a failure.

use std::fmt;

/// A raw NTSTATUS value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NtStatus(pub u32);

impl NtStatus {
    pub const SUCCESS: NtStatus = NtStatus(0x0000_0000);
    pub const UNSUCCESSFUL: NtStatus = NtStatus(0xC000_0001);
    pub const NOT_IMPLEMENTED: NtStatus = NtStatus(0xC000_0002);
    pub const INVALID_PARAMETER: NtStatus = NtStatus(0xC000_000D);
    pub const BUFFER_TOO_SMALL: NtStatus = NtStatus(0xC000_0023);
    pub const PROCEDURE_NOT_FOUND: NtStatus = NtStatus(0xC000_007A);
    pub const INVALID_IMAGE_FORMAT: NtStatus = NtStatus(0xC000_007B);

    /// Success and informational codes have the top bit clear.
    pub fn is_success(self) -> bool {
        (self.0 as i32) >= 0
    }
}

impl fmt::Debug for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NtStatus({:#010X})", self.0)
    }
}

/// Failure of one of the remote-process memory primitives.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("could not read {len} bytes at {address:#x}")]
    Read { address: u64, len: usize, source: Option<std::io::Error> },

    #[error("could not write {len} bytes at {address:#x}")]
    Write { address: u64, len: usize, source: Option<std::io::Error> },

    #[error("could not change protection of {len} bytes at {address:#x}")]
    Protect { address: u64, len: usize, source: Option<std::io::Error> },

    #[error("short transfer at {address:#x}: {done} of {len} bytes")]
    Short { address: u64, len: usize, done: usize },
}

impl MemoryError {
    pub fn read(address: u64, len: usize) -> Self {
        MemoryError::Read { address, len, source: None }
    }

    pub fn write(address: u64, len: usize) -> Self {
        MemoryError::Write { address, len, source: None }
    }

    pub fn protect(address: u64, len: usize) -> Self {
        MemoryError::Protect { address, len, source: None }
    }
}

/// Errors reported while resolving and patching an interception target.
#[derive(Debug, thiserror::Error)]
pub enum InterceptionError {
    /// The call contract was not met; retrying needs different inputs.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The thunk storage cannot hold the thunk; a larger buffer may succeed.
    #[error("thunk storage too small: {needed} bytes needed, {available} available")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("procedure not found: {0}")]
    ProcedureNotFound(String),

    #[error("invalid image format: {0}")]
    InvalidImageFormat(String),

    /// The target does not have the expected shape, or patching it failed.
    #[error("unsuccessful: {0}")]
    Unsuccessful(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

impl InterceptionError {
    pub fn invalid_parameter(reason: &str) -> Self {
        InterceptionError::InvalidParameter(reason.to_string())
    }

    pub fn unsuccessful(reason: &str) -> Self {
        InterceptionError::Unsuccessful(reason.to_string())
    }

    /// The NTSTATUS the interception layer reports for this error.
    pub fn status(&self) -> NtStatus {
        match self {
            Self::InvalidParameter(_) => NtStatus::INVALID_PARAMETER,
            Self::BufferTooSmall { .. } => NtStatus::BUFFER_TOO_SMALL,
            Self::ProcedureNotFound(_) => NtStatus::PROCEDURE_NOT_FOUND,
            Self::InvalidImageFormat(_) => NtStatus::INVALID_IMAGE_FORMAT,
            Self::Unsuccessful(_) => NtStatus::UNSUCCESSFUL,
            Self::NotImplemented(_) => NtStatus::NOT_IMPLEMENTED,
            Self::Memory(_) => NtStatus::UNSUCCESSFUL,
        }
    }

    /// Only a too-small buffer can succeed on retry with the same target.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::BufferTooSmall { .. })
    }
}

impl From<goblin::error::Error> for InterceptionError {
    fn from(e: goblin::error::Error) -> Self {
        InterceptionError::InvalidImageFormat(e.to_string())
    }
}

impl From<MemoryError> for std::io::Error {
    fn from(e: MemoryError) -> Self {
        let kind = match &e {
            MemoryError::Short { .. } => std::io::ErrorKind::UnexpectedEof,
            _ => std::io::ErrorKind::PermissionDenied,
        };
        std::io::Error::new(kind, e)
    }
}

impl From<InterceptionError> for std::io::Error {
    fn from(e: InterceptionError) -> Self {
        match e {
            InterceptionError::Memory(e) => e.into(),
            InterceptionError::InvalidParameter(_) => std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
            InterceptionError::BufferTooSmall { .. } => std::io::Error::new(std::io::ErrorKind::StorageFull, e),
            InterceptionError::ProcedureNotFound(_) => std::io::Error::new(std::io::ErrorKind::NotFound, e),
            InterceptionError::InvalidImageFormat(_) => std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            InterceptionError::NotImplemented(_) => std::io::Error::new(std::io::ErrorKind::Unsupported, e),
            InterceptionError::Unsuccessful(_) => std::io::Error::other(e),
        }
    }
}
