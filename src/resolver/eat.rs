// SPDX-License-Identifier: MIT

//! Redirection through the export address table.
//!
//! The function's code is left alone; only what a lookup of the export
//! returns changes.

use tracing::info;

use crate::emit;
use crate::error::InterceptionError;
use crate::process::write_protected;

use super::{ResolverThunk, SetupOutcome, SetupRequest};

pub(crate) fn setup(resolver: &mut ResolverThunk<'_>, request: &SetupRequest<'_>) -> Result<SetupOutcome, InterceptionError> {
    let arch = resolver.config().arch;
    let validated = resolver.init(request)?;
    let module = validated.target_module;
    let storage = validated.storage;

    let slot_rva = resolver
        .export()
        .map(|e| e.slot_rva)
        .ok_or_else(|| InterceptionError::invalid_parameter("target has no export address table slot"))?;
    let slot = module
        .rva_to_address(slot_rva)
        .ok_or_else(|| InterceptionError::invalid_parameter("export slot outside the image"))?;
    let storage_rva = storage
        .checked_sub(module.base())
        .and_then(|rva| u32::try_from(rva).ok())
        .ok_or_else(|| InterceptionError::invalid_parameter("storage is not addressable as an RVA of the module"))?;

    let thunk = emit::internal_thunk(arch, resolver.target(), resolver.interceptor())?;
    resolver.write_storage(storage, &thunk)?;
    write_protected(resolver.process(), slot, &storage_rva.to_le_bytes())?;

    info!(target_address = resolver.target(), slot, storage, "redirected export");
    Ok(SetupOutcome { storage_used: thunk.len() })
}
