// SPDX-License-Identifier: MIT

//! An in-memory process address space.
//!
//! Useful for running a resolver without a live target: map the module
//! image and the thunk storage, run `setup`, and inspect the resulting bytes
//! and the order in which they were written.  Protections are enforced per
//! page the same way the OS does, so a resolver that forgets to unprotect
//! code fails here too.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Mutex,
};

use crate::error::MemoryError;
use crate::process::{ProcessMemory, Protection, PAGE_SIZE};

/// One write recorded by the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub address: u64,
    pub len: usize,
}

struct Region {
    base: u64,
    bytes: Vec<u8>,
}

impl Region {
    fn end(&self) -> u64 {
        self.base + self.bytes.len() as u64
    }
}

#[derive(Default)]
struct AddressSpace {
    regions: Vec<Region>,
    pages: BTreeMap<u64, Protection>,
    locked_pages: HashSet<u64>,
    journal: Vec<WriteRecord>,
}

impl AddressSpace {
    fn region_for(&self, address: u64, len: usize) -> Option<usize> {
        let end = address.checked_add(len as u64)?;
        self.regions
            .iter()
            .position(|r| address >= r.base && end <= r.end())
    }

    fn pages_of(address: u64, len: usize) -> impl Iterator<Item = u64> {
        let first = address & !(PAGE_SIZE - 1);
        let last = (address + len.max(1) as u64 - 1) & !(PAGE_SIZE - 1);
        (first..=last).step_by(PAGE_SIZE as usize)
    }

    fn all_pages(&self, address: u64, len: usize, check: impl Fn(Protection) -> bool) -> bool {
        Self::pages_of(address, len).all(|p| self.pages.get(&p).map(|v| check(*v)).unwrap_or(false))
    }
}

/// A process made of plain memory regions.
pub struct SimulatedProcess {
    space: Mutex<AddressSpace>,
}

impl Default for SimulatedProcess {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedProcess {
    pub fn new() -> Self {
        SimulatedProcess { space: Mutex::new(AddressSpace::default()) }
    }

    /// Map `bytes` at `base` with the given protection on every page.
    ///
    /// Mapping over an existing region is a bug in the caller.
    pub fn map(&self, base: u64, bytes: &[u8], protection: Protection) {
        let mut space = self.lock();
        if space.region_for(base, 1).is_some() {
            panic!("region already mapped at {base:#x}");
        }
        for page in AddressSpace::pages_of(base, bytes.len()) {
            space.pages.insert(page, protection);
        }
        space.regions.push(Region { base, bytes: bytes.to_vec() });
    }

    /// Map `len` zero bytes.
    pub fn map_zeroed(&self, base: u64, len: usize, protection: Protection) {
        self.map(base, &vec![0u8; len], protection);
    }

    /// Make every later protection change on this page fail.
    pub fn lock_protection(&self, address: u64) {
        self.lock().locked_pages.insert(address & !(PAGE_SIZE - 1));
    }

    pub fn protection_at(&self, address: u64) -> Option<Protection> {
        self.lock().pages.get(&(address & !(PAGE_SIZE - 1))).copied()
    }

    /// Every successful write, in order.
    pub fn journal(&self) -> Vec<WriteRecord> {
        self.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AddressSpace> {
        // A poisoned lock only means another test thread panicked mid-write;
        // the plain data inside is still usable.
        match self.space.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl ProcessMemory for SimulatedProcess {
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let space = self.lock();
        let idx = space
            .region_for(address, buf.len())
            .ok_or_else(|| MemoryError::read(address, buf.len()))?;
        if !space.all_pages(address, buf.len(), Protection::is_readable) {
            return Err(MemoryError::read(address, buf.len()));
        }
        let region = &space.regions[idx];
        let start = (address - region.base) as usize;
        buf.copy_from_slice(&region.bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write(&self, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        let mut space = self.lock();
        let idx = space
            .region_for(address, data.len())
            .ok_or_else(|| MemoryError::write(address, data.len()))?;
        if !space.all_pages(address, data.len(), Protection::is_writable) {
            return Err(MemoryError::write(address, data.len()));
        }
        let region = &mut space.regions[idx];
        let start = (address - region.base) as usize;
        region.bytes[start..start + data.len()].copy_from_slice(data);
        space.journal.push(WriteRecord { address, len: data.len() });
        Ok(())
    }

    fn protect(&self, address: u64, len: usize, protection: Protection) -> Result<Protection, MemoryError> {
        let mut space = self.lock();
        if space.region_for(address, len).is_none() {
            return Err(MemoryError::protect(address, len));
        }
        let pages: Vec<u64> = AddressSpace::pages_of(address, len).collect();
        if pages.iter().any(|p| space.locked_pages.contains(p)) {
            return Err(MemoryError::protect(address, len));
        }
        let previous = space.pages.get(&pages[0]).copied().unwrap_or(Protection::NoAccess);
        for p in pages {
            space.pages.insert(p, protection);
        }
        Ok(previous)
    }
}
