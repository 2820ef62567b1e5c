//! weft — lowers lazy array expression graphs into kernel programs.
//!
//! An array expression is a DAG of immutable nodes (placeholders, index
//! lambdas, outputs). The lowering pass walks that DAG once per node and
//! assembles an imperative kernel program — named buffers, iteration
//! domains, and ordered, dependency-tagged assignment instructions — which
//! a target backend then renders into kernel source.
//!
//! ```text
//! array graph ──→ lowering pass ──→ KernelProgram ──→ Target ──→ BoundProgram
//!  (array)          (codegen)         (kernel)        (target)
//! ```
//!
//! The usual entry point is [`generate_kernel`]:
//!
//! ```
//! use weft::{generate_kernel, make_placeholder, shape_of, DType, Namespace};
//!
//! let mut ns = Namespace::new();
//! let x = make_placeholder(&mut ns, "x", shape_of(&[10]), DType::Float32)?;
//! let bound = generate_kernel(&x)?;
//! assert!(bound.source.contains("out[out_dim0] = x[out_dim0];"));
//! # Ok::<(), weft::LowerError>(())
//! ```

pub mod array;
pub mod codegen;
pub mod error;
pub mod kernel;
pub mod scalar;
pub mod target;
pub mod transform;

pub use array::{
    add, div, elementwise, make_data_wrapper, make_placeholder, mul, roll, shape_of, sub,
    transpose, Array, ArrayKind, ArrayRef, DType, Extent, HostData, Namespace, NodeId, Shape,
};
pub use codegen::{
    generate_kernel, generate_kernel_with_target, KernelInput, DEFAULT_OUTPUT_NAME,
    MAX_LOWER_DEPTH,
};
pub use error::{LowerError, Result};
pub use kernel::{ArgRole, BufferArg, Instruction, KernelProgram, LoopDomain, NameGenerator};
pub use scalar::{free_names, substitute, BinOp, CmpOp, ReduceOp, ScalarExpr, UnaryOp};
pub use target::{create_target, BoundProgram, CTarget, Target};
pub use transform::{copy_namespace, CopyMapper};
