//! The kernel program: the imperative lowering target.
//!
//! A program is an ordered list of buffer arguments, iteration domains, and
//! assignment instructions. The push methods enforce the program invariants
//! as it is assembled:
//! - buffer names and instruction ids are unique,
//! - an instruction's loop variables come from already-declared domains,
//! - an instruction's dependency ids reference already-present instructions.
//!
//! How a finished program becomes something runnable is a backend concern
//! (see [`crate::target`]).

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use crate::array::{DType, Shape};
use crate::bail_inconsistent;
use crate::error::{LowerError, Result};
use crate::scalar::ScalarExpr;

// ─── Program pieces ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgRole {
    Input,
    Output,
}

/// A named kernel buffer argument.
#[derive(Debug, Clone)]
pub struct BufferArg {
    pub name: String,
    pub shape: Shape,
    pub dtype: DType,
    pub role: ArgRole,
}

/// A rectangular iteration domain: one loop variable per axis, each ranging
/// over `0..extent`.
#[derive(Debug, Clone)]
pub struct LoopDomain {
    pub loop_vars: Vec<String>,
    pub extents: Shape,
}

impl LoopDomain {
    /// Build the domain for iterating a buffer of the given shape.
    pub fn for_shape(loop_vars: Vec<String>, extents: Shape) -> Result<LoopDomain> {
        if loop_vars.len() != extents.len() {
            bail_inconsistent!(
                "domain with {} loop variables over {} extents",
                loop_vars.len(),
                extents.len()
            );
        }
        Ok(LoopDomain { loop_vars, extents })
    }
}

/// One assignment: `target[indices] = rhs`, executed for every point of the
/// loop variables in `within`, after the instructions in `depends_on`.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub id: String,
    pub target: String,
    pub indices: Vec<ScalarExpr>,
    pub rhs: ScalarExpr,
    pub within: BTreeSet<String>,
    pub depends_on: BTreeSet<String>,
}

// ─── Program accumulator ──────────────────────────────────────────

#[derive(Debug, Default)]
pub struct KernelProgram {
    args: Vec<BufferArg>,
    domains: Vec<LoopDomain>,
    instructions: Vec<Instruction>,
}

impl KernelProgram {
    pub fn new() -> KernelProgram {
        KernelProgram::default()
    }

    pub fn args(&self) -> &[BufferArg] {
        &self.args
    }

    pub fn domains(&self) -> &[LoopDomain] {
        &self.domains
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn arg(&self, name: &str) -> Option<&BufferArg> {
        self.args.iter().find(|a| a.name == name)
    }

    /// The domain whose loop-variable set is exactly `within`.
    pub fn domain_for(&self, within: &BTreeSet<String>) -> Option<&LoopDomain> {
        self.domains.iter().find(|d| {
            d.loop_vars.len() == within.len() && d.loop_vars.iter().all(|v| within.contains(v))
        })
    }

    pub fn push_arg(&mut self, arg: BufferArg) -> Result<()> {
        if self.arg(&arg.name).is_some() {
            return Err(LowerError::DuplicateName(arg.name));
        }
        self.args.push(arg);
        Ok(())
    }

    pub fn push_domain(&mut self, domain: LoopDomain) -> Result<()> {
        let known: HashSet<&String> = self.domains.iter().flat_map(|d| &d.loop_vars).collect();
        for var in &domain.loop_vars {
            if known.contains(var) {
                return Err(LowerError::DuplicateName(var.clone()));
            }
        }
        self.domains.push(domain);
        Ok(())
    }

    pub fn push_instruction(&mut self, insn: Instruction) -> Result<()> {
        if self.instructions.iter().any(|i| i.id == insn.id) {
            return Err(LowerError::DuplicateName(insn.id));
        }
        let declared: HashSet<&String> = self.domains.iter().flat_map(|d| &d.loop_vars).collect();
        for var in &insn.within {
            if !declared.contains(var) {
                bail_inconsistent!("instruction '{}' runs under undeclared loop variable '{}'", insn.id, var);
            }
        }
        for dep in &insn.depends_on {
            if !self.instructions.iter().any(|i| &i.id == dep) {
                bail_inconsistent!("instruction '{}' depends on unknown instruction '{}'", insn.id, dep);
            }
        }
        self.instructions.push(insn);
        Ok(())
    }
}

// ─── Display ──────────────────────────────────────────────────────

fn join<T: fmt::Display>(items: impl IntoIterator<Item = T>) -> String {
    items
        .into_iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for KernelProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "kernel {{")?;
        for arg in &self.args {
            let role = match arg.role {
                ArgRole::Input => "in",
                ArgRole::Output => "out",
            };
            writeln!(f, "  arg {} {}: {}[{}]", role, arg.name, arg.dtype, join(&arg.shape))?;
        }
        for domain in &self.domains {
            writeln!(
                f,
                "  domain [{}] over [{}]",
                domain.loop_vars.join(", "),
                join(&domain.extents)
            )?;
        }
        for insn in &self.instructions {
            write!(f, "  insn {}: {}", insn.id, insn.target)?;
            if !insn.indices.is_empty() {
                write!(f, "[{}]", join(&insn.indices))?;
            }
            write!(f, " = {}", insn.rhs)?;
            if !insn.depends_on.is_empty() {
                write!(f, "  after {{{}}}", join(&insn.depends_on))?;
            }
            writeln!(f)?;
        }
        write!(f, "}}")
    }
}

// ─── Name generation ──────────────────────────────────────────────

/// Hands out names that are unique for the lifetime of one lowering pass:
/// the base name if it is still free, otherwise `base_0`, `base_1`, ….
#[derive(Debug, Default)]
pub struct NameGenerator {
    used: HashSet<String>,
}

impl NameGenerator {
    pub fn new() -> NameGenerator {
        NameGenerator::default()
    }

    pub fn with_existing<I, S>(names: I) -> NameGenerator
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        NameGenerator {
            used: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn reserve(&mut self, name: impl Into<String>) {
        self.used.insert(name.into());
    }

    pub fn fresh(&mut self, base: &str) -> String {
        if self.used.insert(base.to_string()) {
            return base.to_string();
        }
        let mut counter = 0u64;
        loop {
            let candidate = format!("{}_{}", base, counter);
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
            counter += 1;
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────
