// SPDX-License-Identifier: MIT

//! Redirection of arbitrary functions by relocating their preamble.
//!
//! Storage layout:
//!
//! ```text
//! [relocated preamble, jump back, int3 padding][internal thunk][smart stub]
//! ```
//!
//! The internal thunk treats the relocated preamble as the original
//! function.  The smart variant points the internal thunk at the smart stub,
//! which decides per call whether the interceptor runs.

pub mod preamble;

use tracing::info;

use crate::emit::{self, Arch, INT3};
use crate::error::InterceptionError;
use crate::process::write_protected;

use super::{ResolverThunk, SetupOutcome, SetupRequest};

/// Room for the relocated preamble and the jump back.
pub fn stub_capacity(arch: Arch) -> usize {
    match arch {
        Arch::X86 => 32,
        Arch::X64 => 64,
    }
}

/// Bytes of the target read for relocation.
const PREAMBLE_READ_LEN: usize = 64;

pub(crate) fn setup(
    resolver: &mut ResolverThunk<'_>,
    smart: bool,
    request: &SetupRequest<'_>,
) -> Result<SetupOutcome, InterceptionError> {
    let arch = resolver.config().arch;
    let validated = resolver.init(request)?;
    let module = validated.target_module;
    let target = resolver.target();
    let storage = validated.storage;
    let capacity = stub_capacity(arch);
    let internal_thunk = storage + capacity as u64;
    let smart_stub = internal_thunk + emit::internal_thunk_size(arch) as u64;

    let redirect = emit::jump(arch, target, internal_thunk);
    let code = resolver
        .process()
        .read_vec(target, PREAMBLE_READ_LEN)
        .map_err(|_| InterceptionError::unsuccessful("cannot read the target"))?;
    let relocated = preamble::relocate(arch, target, &code, redirect.len(), storage, capacity)?;

    let mut thunk = relocated.code;
    thunk.resize(capacity, INT3);
    let entry = if smart { smart_stub } else { resolver.interceptor() };
    thunk.extend(emit::internal_thunk(arch, storage, entry)?);
    if smart {
        let range = module.range();
        thunk.extend(emit::smart_stub(arch, range.start, range.end, resolver.interceptor())?);
    }

    // The rest of the overwritten instruction bytes become int3s.
    let mut patch = redirect;
    patch.resize(relocated.covered, INT3);

    resolver.write_storage(storage, &thunk)?;
    write_protected(resolver.process(), target, &patch)?;

    info!(
        target_address = target,
        storage,
        relocated = relocated.covered,
        smart,
        "redirected function preamble"
    );
    Ok(SetupOutcome { storage_used: thunk.len() })
}
