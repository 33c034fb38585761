// SPDX-License-Identifier: MIT

//! Access to the memory of the process that receives the patches.
//!
//! The resolvers never touch foreign memory directly.  Everything goes
//! through the narrow [`ProcessMemory`] interface, implemented for live
//! Windows processes in [`windows`] and for an in-memory address space in
//! [`simulated`].

pub mod simulated;

#[cfg(target_os = "windows")]
pub mod windows;

use tracing::warn;

use crate::error::MemoryError;

/// Page protection, as understood by the resolvers.
///
/// Values the resolvers do not model are carried through `Other` so that a
/// protection change can always be undone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    NoAccess,
    ReadOnly,
    ReadWrite,
    WriteCopy,
    Execute,
    ExecuteRead,
    ExecuteReadWrite,
    ExecuteWriteCopy,
    Other(u32),
}

impl Protection {
    pub fn is_readable(self) -> bool {
        !matches!(self, Protection::NoAccess | Protection::Execute)
    }

    pub fn is_writable(self) -> bool {
        matches!(
            self,
            Protection::ReadWrite
                | Protection::WriteCopy
                | Protection::ExecuteReadWrite
                | Protection::ExecuteWriteCopy
        )
    }

    pub fn is_executable(self) -> bool {
        matches!(
            self,
            Protection::Execute
                | Protection::ExecuteRead
                | Protection::ExecuteReadWrite
                | Protection::ExecuteWriteCopy
        )
    }

    /// The `PAGE_*` constant for this protection.
    pub fn to_page_flags(self) -> u32 {
        match self {
            Protection::NoAccess => 0x01,
            Protection::ReadOnly => 0x02,
            Protection::ReadWrite => 0x04,
            Protection::WriteCopy => 0x08,
            Protection::Execute => 0x10,
            Protection::ExecuteRead => 0x20,
            Protection::ExecuteReadWrite => 0x40,
            Protection::ExecuteWriteCopy => 0x80,
            Protection::Other(v) => v,
        }
    }

    pub fn from_page_flags(flags: u32) -> Self {
        match flags {
            0x01 => Protection::NoAccess,
            0x02 => Protection::ReadOnly,
            0x04 => Protection::ReadWrite,
            0x08 => Protection::WriteCopy,
            0x10 => Protection::Execute,
            0x20 => Protection::ExecuteRead,
            0x40 => Protection::ExecuteReadWrite,
            0x80 => Protection::ExecuteWriteCopy,
            v => Protection::Other(v),
        }
    }
}

/// Synchronous memory primitives on one process.
///
/// Implementations must be all-or-nothing per call: a failed `write` leaves
/// the destination unchanged as far as the implementation can tell.
pub trait ProcessMemory {
    /// Fill `buf` with the bytes at `address`.
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<(), MemoryError>;

    /// Write `data` at `address`.  The pages must already be writable.
    fn write(&self, address: u64, data: &[u8]) -> Result<(), MemoryError>;

    /// Change the protection of the pages covering the range, returning the
    /// protection the first page had before.  [`ProtectionGuard`] calls this
    /// one page at a time.
    fn protect(&self, address: u64, len: usize, protection: Protection) -> Result<Protection, MemoryError>;

    /// Called after code was written.
    fn flush_instruction_cache(&self, _address: u64, _len: usize) -> Result<(), MemoryError> {
        Ok(())
    }

    /// Read exactly `len` bytes into a new vector.
    fn read_vec(&self, address: u64, len: usize) -> Result<Vec<u8>, MemoryError> {
        let mut buf = vec![0u8; len];
        self.read(address, &mut buf)?;
        Ok(buf)
    }

    fn read_u32(&self, address: u64) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
}

/// Granularity of protection changes.
pub const PAGE_SIZE: u64 = 0x1000;

/// Split a range into the parts that fall on each page.
fn page_spans(address: u64, len: usize) -> impl Iterator<Item = (u64, usize)> {
    let end = address.saturating_add(len.max(1) as u64);
    let mut start = address;
    std::iter::from_fn(move || {
        if start >= end {
            return None;
        }
        let span_end = ((start & !(PAGE_SIZE - 1)).saturating_add(PAGE_SIZE)).min(end);
        let span = (start, (span_end - start) as usize);
        start = span_end;
        Some(span)
    })
}

/// Changes the protection of a range, and puts the old protection of every
/// page back when dropped.
pub struct ProtectionGuard<'p> {
    process: &'p dyn ProcessMemory,
    previous: Vec<(u64, usize, Protection)>,
}

impl<'p> ProtectionGuard<'p> {
    /// Changes the range one page at a time.  If a page refuses the change,
    /// the pages already changed are put back before the error is returned.
    pub fn change(
        process: &'p dyn ProcessMemory,
        address: u64,
        len: usize,
        protection: Protection,
    ) -> Result<Self, MemoryError> {
        let mut guard = ProtectionGuard { process, previous: Vec::new() };
        for (span, span_len) in page_spans(address, len) {
            let previous = process.protect(span, span_len, protection)?;
            guard.previous.push((span, span_len, previous));
        }
        Ok(guard)
    }

    /// Put the old protection back now, reporting the first failure.
    pub fn restore(mut self) -> Result<(), MemoryError> {
        let mut result = Ok(());
        for (address, len, protection) in std::mem::take(&mut self.previous).into_iter().rev() {
            if let Err(e) = self.process.protect(address, len, protection) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}

impl Drop for ProtectionGuard<'_> {
    fn drop(&mut self) {
        // Note: ignoring errors inside the drop.
        for (address, len, protection) in std::mem::take(&mut self.previous).into_iter().rev() {
            if let Err(e) = self.process.protect(address, len, protection) {
                warn!(address, len, error = %e, "could not restore page protection");
            }
        }
    }
}

/// Write into memory that is normally not writable (code, export tables).
///
/// The pages are switched to copy-on-write for the duration of the write,
/// and their protection is always restored, even when the write fails.
pub fn write_protected(process: &dyn ProcessMemory, address: u64, data: &[u8]) -> Result<(), MemoryError> {
    let guard = ProtectionGuard::change(process, address, data.len(), Protection::WriteCopy)?;
    let written = process.write(address, data);
    let restored = guard.restore();
    written?;
    if let Err(e) = restored {
        // The write itself is in place; a stale protection is not a reason to
        // report the patch as failed.
        warn!(address, len = data.len(), error = %e, "protection not restored after write");
    }
    process.flush_instruction_cache(address, data.len())
}

/// Size of the header page read before the rest of an image.
const IMAGE_HEADER_LEN: usize = 0x1000;

/// Read a module, as mapped, out of the process.
///
/// The headers are read first to learn the image size.
pub fn read_image(process: &dyn ProcessMemory, base: u64) -> Result<Vec<u8>, crate::InterceptionError> {
    let header = process.read_vec(base, IMAGE_HEADER_LEN)?;
    let parsed = goblin::pe::header::Header::parse(&header)?;
    let size = parsed
        .optional_header
        .as_ref()
        .map(|o| o.windows_fields.size_of_image as usize)
        .ok_or_else(|| crate::InterceptionError::InvalidImageFormat("no optional header".to_string()))?;
    if size < IMAGE_HEADER_LEN {
        return Ok(header[..size].to_vec());
    }
    let mut image = header;
    image.resize(size, 0);
    process.read(base + IMAGE_HEADER_LEN as u64, &mut image[IMAGE_HEADER_LEN..])?;
    Ok(image)
}
