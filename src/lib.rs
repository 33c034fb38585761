//! # sidewinder
//!
//! Function interception and call policy for sandboxed Windows processes.
//!
//! The [`resolver`] module redirects exported functions of a module mapped in
//! a target process to interceptors, and the [`policy`] module decides what
//! an intercepted call is allowed to do.

pub mod emit;
pub mod error;
pub mod image;
pub mod policy;
pub mod process;
pub mod resolver;


pub use emit::Arch;
pub use error::{InterceptionError, MemoryError, NtStatus};
pub use image::{ExportEntry, ModuleImage};
pub use policy::{PolicyError, PolicyProcessor};
pub use process::{ProcessMemory, Protection};
pub use resolver::{ResolverConfig, ResolverStrategy, ResolverThunk, ServiceVariant, SetupOutcome, SetupRequest};
