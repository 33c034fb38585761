// SPDX-License-Identifier: MIT

//! Function interception resolvers.
//!
//! A [`ResolverThunk`] redirects one exported function of a module mapped in
//! a target process to an interceptor.  The strategies share one `setup`
//! pipeline: validate the request, resolve the interceptor and the target,
//! then hand over to the strategy, which builds the whole thunk in memory,
//! writes it into the caller's storage and only then redirects the target.
//! Nothing is written before every check has passed.

pub mod eat;
pub mod service;
pub mod sidestep;

use tracing::debug;

use crate::emit::{self, Arch};
use crate::error::InterceptionError;
use crate::image::{ExportEntry, ModuleImage};
use crate::process::ProcessMemory;

pub use service::ServiceVariant;

/// Caller supplied knobs for one resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverConfig {
    pub arch: Arch,
    /// Accept targets already carrying a recognized redirect.
    pub relaxed: bool,
}

impl ResolverConfig {
    pub fn new(arch: Arch) -> Self {
        ResolverConfig { arch, relaxed: false }
    }

    pub fn relaxed(mut self, relaxed: bool) -> Self {
        self.relaxed = relaxed;
        self
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self::new(Arch::native())
    }
}

/// How the target gets redirected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverStrategy {
    /// Rewrite the export address table slot.
    Eat,
    /// Patch a system service stub in place.
    Service(ServiceVariant),
    /// Relocate the function's preamble and jump over it.
    Sidestep,
    /// Like `Sidestep`, but calls from inside the target module skip the
    /// interceptor.
    SmartSidestep,
}

/// Inputs of one `setup` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetupRequest<'a> {
    pub target_module: Option<&'a ModuleImage>,
    pub interceptor_module: Option<&'a ModuleImage>,
    pub target_name: Option<&'a str>,
    pub interceptor_name: Option<&'a str>,
    /// Used as the interceptor when set; no name lookup happens.
    pub interceptor_entry_point: Option<u64>,
    pub thunk_storage: Option<u64>,
    pub storage_bytes: usize,
}

impl<'a> SetupRequest<'a> {
    pub fn new(target_module: &'a ModuleImage, target_name: &'a str) -> Self {
        SetupRequest { target_module: Some(target_module), target_name: Some(target_name), ..Default::default() }
    }

    pub fn interceptor(mut self, module: &'a ModuleImage, name: &'a str) -> Self {
        self.interceptor_module = Some(module);
        self.interceptor_name = Some(name);
        self
    }

    pub fn interceptor_entry_point(mut self, address: u64) -> Self {
        self.interceptor_entry_point = Some(address);
        self
    }

    pub fn storage(mut self, address: u64, len: usize) -> Self {
        self.thunk_storage = Some(address);
        self.storage_bytes = len;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupOutcome {
    pub storage_used: usize,
}

/// What `init` checked and resolved.
#[derive(Debug, Clone, Copy)]
pub struct Validated<'a> {
    pub target_module: &'a ModuleImage,
    pub storage: u64,
    pub storage_bytes: usize,
}

/// Redirection state for one target function.
pub struct ResolverThunk<'p> {
    process: &'p dyn ProcessMemory,
    strategy: ResolverStrategy,
    config: ResolverConfig,
    target: u64,
    interceptor: u64,
    export: Option<ExportEntry>,
}

impl<'p> ResolverThunk<'p> {
    pub fn new(process: &'p dyn ProcessMemory, strategy: ResolverStrategy, config: ResolverConfig) -> Self {
        ResolverThunk { process, strategy, config, target: 0, interceptor: 0, export: None }
    }

    /// Redirect the requested target through the storage.
    pub fn setup(&mut self, request: &SetupRequest<'_>) -> Result<SetupOutcome, InterceptionError> {
        match self.strategy {
            ResolverStrategy::Eat => eat::setup(self, request),
            ResolverStrategy::Service(variant) => service::setup(self, variant, request),
            ResolverStrategy::Sidestep => sidestep::setup(self, false, request),
            ResolverStrategy::SmartSidestep => sidestep::setup(self, true, request),
        }
    }

    /// The shared preamble of every strategy.
    pub fn init<'a>(&mut self, request: &SetupRequest<'a>) -> Result<Validated<'a>, InterceptionError> {
        let storage = request
            .thunk_storage
            .filter(|s| *s != 0)
            .ok_or_else(|| InterceptionError::invalid_parameter("no thunk storage"))?;
        if request.storage_bytes == 0 {
            return Err(InterceptionError::invalid_parameter("empty thunk storage"));
        }
        let module = request
            .target_module
            .ok_or_else(|| InterceptionError::invalid_parameter("no target module"))?;
        let name = request
            .target_name
            .filter(|n| !n.is_empty())
            .ok_or_else(|| InterceptionError::invalid_parameter("no target name"))?;
        if module.arch() != self.config.arch {
            return Err(InterceptionError::InvalidParameter(format!(
                "target module is {:?}, resolver is configured for {:?}",
                module.arch(),
                self.config.arch
            )));
        }

        let needed = self.thunk_size();
        if request.storage_bytes < needed {
            return Err(InterceptionError::BufferTooSmall { needed, available: request.storage_bytes });
        }

        self.interceptor = match request.interceptor_entry_point {
            Some(entry) => entry,
            None => {
                let interceptor_module = request
                    .interceptor_module
                    .ok_or_else(|| InterceptionError::invalid_parameter("no interceptor module"))?;
                let interceptor_name = request
                    .interceptor_name
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| InterceptionError::invalid_parameter("no interceptor name"))?;
                self.resolve_interceptor(interceptor_module, interceptor_name)?
            }
        };
        self.target = self.resolve_target(module, name)?;

        debug!(
            target_name = name,
            target_address = self.target,
            interceptor = self.interceptor,
            "resolved interception"
        );
        Ok(Validated { target_module: module, storage, storage_bytes: request.storage_bytes })
    }

    /// Address of `name` in `module`, remembering its export entry.
    pub fn resolve_target(&mut self, module: &ModuleImage, name: &str) -> Result<u64, InterceptionError> {
        let address = module.proc_address(name)?;
        self.export = module.export(name).cloned();
        Ok(address)
    }

    pub fn resolve_interceptor(&self, module: &ModuleImage, name: &str) -> Result<u64, InterceptionError> {
        module.proc_address(name)
    }

    /// Bytes of storage `setup` needs.
    pub fn thunk_size(&self) -> usize {
        let arch = self.config.arch;
        match self.strategy {
            ResolverStrategy::Eat => self.internal_thunk_size(),
            ResolverStrategy::Service(_) => service::COPY_AREA_LEN + self.internal_thunk_size(),
            ResolverStrategy::Sidestep => sidestep::stub_capacity(arch) + self.internal_thunk_size(),
            ResolverStrategy::SmartSidestep => {
                sidestep::stub_capacity(arch) + self.internal_thunk_size() + emit::smart_stub_size(arch)
            }
        }
    }

    pub fn internal_thunk_size(&self) -> usize {
        emit::internal_thunk_size(self.config.arch)
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    pub fn interceptor(&self) -> u64 {
        self.interceptor
    }

    /// The resolved export, once `resolve_target` ran.
    pub fn export(&self) -> Option<&ExportEntry> {
        self.export.as_ref()
    }

    pub fn strategy(&self) -> ResolverStrategy {
        self.strategy
    }

    pub fn config(&self) -> ResolverConfig {
        self.config
    }

    pub fn process(&self) -> &'p dyn ProcessMemory {
        self.process
    }

    /// Copy a finished thunk into the storage.
    fn write_storage(&self, storage: u64, code: &[u8]) -> Result<(), InterceptionError> {
        self.process.write(storage, code)?;
        self.process.flush_instruction_cache(storage, code.len())?;
        Ok(())
    }
}
