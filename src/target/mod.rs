//! Target backends: turn a finished kernel program into something runnable.
//!
//! Each backend implements [`Target`] to control how a [`KernelProgram`]
//! becomes concrete kernel source. The lowering pass is backend-agnostic;
//! it hands its finished program to `finalize` together with any pre-bound
//! argument values.

mod c;

pub use c::CTarget;

use std::collections::BTreeMap;

use crate::array::HostData;
use crate::bail_malformed;
use crate::error::Result;
use crate::kernel::KernelProgram;

/// A finished, backend-finalized program: the kernel IR, the emitted
/// target source, and any argument values bound ahead of execution.
#[derive(Debug)]
pub struct BoundProgram {
    pub target: String,
    pub program: KernelProgram,
    pub source: String,
    pub bound_arguments: BTreeMap<String, HostData>,
}

/// Converts an assembled kernel program into a target artifact.
pub trait Target {
    /// The target name (e.g. "c").
    fn name(&self) -> &str;

    /// Render `program` into target kernel source and attach the bound
    /// arguments. Every bound name must refer to a program argument.
    fn finalize(
        &self,
        program: KernelProgram,
        bound_arguments: BTreeMap<String, HostData>,
    ) -> Result<BoundProgram>;
}

/// Create a backend for the given target name.
pub fn create_target(name: &str) -> Option<Box<dyn Target>> {
    match name {
        "c" | "c99" => Some(Box::new(CTarget::new())),
        _ => None,
    }
}

pub(crate) fn check_bound_arguments(
    program: &KernelProgram,
    bound_arguments: &BTreeMap<String, HostData>,
) -> Result<()> {
    for name in bound_arguments.keys() {
        if program.arg(name).is_none() {
            bail_malformed!("bound argument '{}' is not a kernel argument", name);
        }
    }
    Ok(())
}

// ─── Tests ────────────────────────────────────────────────────────
