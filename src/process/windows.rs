// SPDX-License-Identifier: MIT

//! Memory primitives on a live Windows process.
//! The process handle is wrapped in a struct that implements Drop, so every
//! early return closes it.

use std::ffi::c_void;

use tracing::debug;
use windows::Win32::{
    Foundation::{CloseHandle, HANDLE},
    System::{
        Diagnostics::Debug::{FlushInstructionCache, ReadProcessMemory, WriteProcessMemory},
        Memory::{PAGE_PROTECTION_FLAGS, VirtualProtectEx},
        Threading,
    },
};

use crate::error::MemoryError;
use crate::process::{ProcessMemory, Protection};

pub struct RemoteProcess {
    handle: Option<HANDLE>,
    // The pseudo handle of the current process must not be closed.
    owned: bool,
}

impl RemoteProcess {
    /// Open a process with the rights needed to patch it.
    pub fn open(pid: u32) -> Result<Self, windows_result::Error> {
        let access = Threading::PROCESS_VM_READ
            | Threading::PROCESS_VM_WRITE
            | Threading::PROCESS_VM_OPERATION
            | Threading::PROCESS_QUERY_INFORMATION;
        let handle = unsafe { Threading::OpenProcess(access, false, pid)? };
        debug!(pid, "opened process for patching");
        Ok(Self { handle: Some(handle), owned: true })
    }

    /// The calling process.
    pub fn current() -> Self {
        Self { handle: Some(unsafe { Threading::GetCurrentProcess() }), owned: false }
    }

    pub fn handle(&self) -> Option<HANDLE> {
        self.handle
    }

    pub fn close(&mut self) -> Result<(), windows_result::Error> {
        match self.handle.take() {
            Some(h) if self.owned => unsafe { CloseHandle(h) },
            _ => Ok(()),
        }
    }

    fn live_handle(&self, address: u64, len: usize) -> Result<HANDLE, MemoryError> {
        self.handle.ok_or(MemoryError::Short { address, len, done: 0 })
    }
}

impl Drop for RemoteProcess {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn os_error(e: windows_result::Error) -> Option<std::io::Error> {
    Some(e.into())
}

impl ProcessMemory for RemoteProcess {
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let h = self.live_handle(address, buf.len())?;
        let mut done = 0usize;
        unsafe {
            ReadProcessMemory(
                h,
                address as usize as *const c_void,
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                Some(&mut done),
            )
        }
        .map_err(|e| MemoryError::Read { address, len: buf.len(), source: os_error(e) })?;
        if done != buf.len() {
            return Err(MemoryError::Short { address, len: buf.len(), done });
        }
        Ok(())
    }

    fn write(&self, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        let h = self.live_handle(address, data.len())?;
        let mut done = 0usize;
        unsafe {
            WriteProcessMemory(
                h,
                address as usize as *const c_void,
                data.as_ptr() as *const c_void,
                data.len(),
                Some(&mut done),
            )
        }
        .map_err(|e| MemoryError::Write { address, len: data.len(), source: os_error(e) })?;
        if done != data.len() {
            return Err(MemoryError::Short { address, len: data.len(), done });
        }
        Ok(())
    }

    fn protect(&self, address: u64, len: usize, protection: Protection) -> Result<Protection, MemoryError> {
        let h = self.live_handle(address, len)?;
        let mut old = PAGE_PROTECTION_FLAGS::default();
        unsafe {
            VirtualProtectEx(
                h,
                address as usize as *const c_void,
                len,
                PAGE_PROTECTION_FLAGS(protection.to_page_flags()),
                &mut old,
            )
        }
        .map_err(|e| MemoryError::Protect { address, len, source: os_error(e) })?;
        Ok(Protection::from_page_flags(old.0))
    }

    fn flush_instruction_cache(&self, address: u64, len: usize) -> Result<(), MemoryError> {
        let h = self.live_handle(address, len)?;
        unsafe { FlushInstructionCache(h, Some(address as usize as *const c_void), len) }
            .map_err(|e| MemoryError::Write { address, len, source: os_error(e) })
    }
}
