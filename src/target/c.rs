//! C lowering — renders a kernel program as a self-contained C function.
//!
//! Buffers become pointer parameters (inputs const), symbolic extents
//! become `int64_t` parameters, and each instruction becomes one loop nest
//! over its iteration domain with a row-major flattened store. Instructions
//! are emitted in program order, which already satisfies their recorded
//! dependencies.

use std::collections::{BTreeMap, BTreeSet};

use super::{check_bound_arguments, BoundProgram, Target};
use crate::array::{DType, Extent, HostData};
use crate::bail_inconsistent;
use crate::error::Result;
use crate::kernel::{ArgRole, Instruction, KernelProgram};
use crate::scalar::ScalarExpr;

pub struct CTarget;

impl CTarget {
    pub fn new() -> CTarget {
        CTarget
    }
}

impl Default for CTarget {
    fn default() -> CTarget {
        CTarget::new()
    }
}

impl Target for CTarget {
    fn name(&self) -> &str {
        "c"
    }

    fn finalize(
        &self,
        program: KernelProgram,
        bound_arguments: BTreeMap<String, HostData>,
    ) -> Result<BoundProgram> {
        check_bound_arguments(&program, &bound_arguments)?;
        let source = emit(&program)?;
        Ok(BoundProgram {
            target: self.name().to_string(),
            program,
            source,
            bound_arguments,
        })
    }
}

// ─── Emission ─────────────────────────────────────────────────────

fn c_type(dtype: DType) -> &'static str {
    match dtype {
        DType::Bool => "int8_t",
        DType::Int32 => "int32_t",
        DType::Int64 => "int64_t",
        DType::Float32 => "float",
        DType::Float64 => "double",
    }
}

fn extent_text(extent: &Extent) -> String {
    match extent {
        Extent::Fixed(n) => n.to_string(),
        Extent::Sym(name) => name.clone(),
    }
}

/// Symbolic size names referenced by the program, in sorted order.
fn symbolic_sizes(program: &KernelProgram) -> BTreeSet<String> {
    let mut sizes = BTreeSet::new();
    let shapes = program
        .args()
        .iter()
        .map(|a| &a.shape)
        .chain(program.domains().iter().map(|d| &d.extents));
    for shape in shapes {
        for extent in shape {
            if let Extent::Sym(name) = extent {
                sizes.insert(name.clone());
            }
        }
    }
    sizes
}

fn signature(program: &KernelProgram) -> String {
    let mut params: Vec<String> = program
        .args()
        .iter()
        .map(|arg| match arg.role {
            ArgRole::Input => format!("const {} *restrict {}", c_type(arg.dtype), arg.name),
            ArgRole::Output => format!("{} *restrict {}", c_type(arg.dtype), arg.name),
        })
        .collect();
    params.extend(
        symbolic_sizes(program)
            .into_iter()
            .map(|name| format!("int64_t {}", name)),
    );
    if params.is_empty() {
        "void".to_string()
    } else {
        params.join(", ")
    }
}

/// Row-major flattened access into a buffer argument.
fn flat_access(program: &KernelProgram, array: &str, indices: &[ScalarExpr]) -> Result<String> {
    let arg = match program.arg(array) {
        Some(arg) => arg,
        None => bail_inconsistent!("reference to unknown buffer '{}'", array),
    };
    if indices.is_empty() {
        return Ok(format!("{}[0]", array));
    }
    if indices.len() != arg.shape.len() {
        bail_inconsistent!(
            "'{}' indexed with {} indices, shape has {}",
            array,
            indices.len(),
            arg.shape.len()
        );
    }
    let mut flat = expr_text(program, &indices[0])?;
    for (d, idx) in indices.iter().enumerate().skip(1) {
        flat = format!(
            "({} * {} + {})",
            flat,
            extent_text(&arg.shape[d]),
            expr_text(program, idx)?
        );
    }
    Ok(format!("{}[{}]", array, flat))
}

fn expr_text(program: &KernelProgram, expr: &ScalarExpr) -> Result<String> {
    match expr {
        ScalarExpr::IntConst(v) => Ok(v.to_string()),
        ScalarExpr::FloatConst(v) => Ok(format!("{:?}", v)),
        ScalarExpr::BoolConst(v) => Ok(if *v { "1" } else { "0" }.to_string()),
        ScalarExpr::Var(name) => {
            // A bare reference to a buffer is a scalar deref; anything else
            // is a loop variable or a size parameter.
            if program.arg(name).is_some() {
                Ok(format!("{}[0]", name))
            } else {
                Ok(name.clone())
            }
        }
        ScalarExpr::Subscript { array, indices } => flat_access(program, array, indices),
        ScalarExpr::Unary { op, arg } => Ok(format!("({}{})", op, expr_text(program, arg)?)),
        ScalarExpr::Binary { op, left, right } => Ok(format!(
            "({} {} {})",
            expr_text(program, left)?,
            op,
            expr_text(program, right)?
        )),
        ScalarExpr::Compare { op, left, right } => Ok(format!(
            "({} {} {})",
            expr_text(program, left)?,
            op,
            expr_text(program, right)?
        )),
        ScalarExpr::Select {
            cond,
            then_case,
            else_case,
        } => Ok(format!(
            "({} ? {} : {})",
            expr_text(program, cond)?,
            expr_text(program, then_case)?,
            expr_text(program, else_case)?
        )),
        ScalarExpr::Reduce { var, .. } => {
            bail_inconsistent!("reduction over '{}' survived lowering", var)
        }
    }
}

fn emit_instruction(
    program: &KernelProgram,
    insn: &Instruction,
    lines: &mut Vec<String>,
) -> Result<()> {
    lines.push(format!("  // {}", insn.id));

    let store = format!(
        "{} = {};",
        flat_access(program, &insn.target, &insn.indices)?,
        expr_text(program, &insn.rhs)?
    );

    if insn.within.is_empty() {
        lines.push(format!("  {}", store));
        return Ok(());
    }

    let domain = match program.domain_for(&insn.within) {
        Some(domain) => domain,
        None => bail_inconsistent!("instruction '{}' has no matching domain", insn.id),
    };

    let mut indent = 1;
    for (var, extent) in domain.loop_vars.iter().zip(&domain.extents) {
        lines.push(format!(
            "{}for (int64_t {} = 0; {} < {}; ++{}) {{",
            "  ".repeat(indent),
            var,
            var,
            extent_text(extent),
            var
        ));
        indent += 1;
    }
    lines.push(format!("{}{}", "  ".repeat(indent), store));
    for level in (1..indent).rev() {
        lines.push(format!("{}}}", "  ".repeat(level)));
    }
    Ok(())
}

fn emit(program: &KernelProgram) -> Result<String> {
    let mut lines = vec!["#include <stdint.h>".to_string(), String::new()];
    lines.push(format!("void kernel({}) {{", signature(program)));
    for (i, insn) in program.instructions().iter().enumerate() {
        if i > 0 {
            lines.push(String::new());
        }
        emit_instruction(program, insn, &mut lines)?;
    }
    lines.push("}".to_string());
    Ok(lines.join("\n") + "\n")
}

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{make_placeholder, shape_of, Array, Namespace};
    use crate::codegen::generate_kernel;

    #[test]
    fn test_copy_kernel_source() {
        let mut ns = Namespace::new();
        let x = make_placeholder(&mut ns, "x", shape_of(&[10]), DType::Float32).unwrap();
        drop(ns);

        let bound = generate_kernel(&x).unwrap();
        assert_eq!(bound.target, "c");
        insta::assert_snapshot!(bound.source.trim_end(), @r###"
#include <stdint.h>

void kernel(const float *restrict x, float *restrict out) {
  // out_store
  for (int64_t out_dim0 = 0; out_dim0 < 10; ++out_dim0) {
    out[out_dim0] = x[out_dim0];
  }
}
"###);
    }

    #[test]
    fn test_two_dim_store_flattens_row_major() {
        let mut ns = Namespace::new();
        let x = make_placeholder(&mut ns, "x", shape_of(&[3, 7]), DType::Float64).unwrap();
        let out = Array::output("y", x);
        ns.insert("y", out).unwrap();

        let bound = generate_kernel(ns).unwrap();
        assert!(bound.source.contains("double *restrict y"));
        assert!(bound
            .source
            .contains("y[(y_dim0 * 7 + y_dim1)] = x[(y_dim0 * 7 + y_dim1)];"));
    }

    #[test]
    fn test_symbolic_extent_becomes_parameter() {
        let mut ns = Namespace::new();
        let shape = vec![Extent::Sym("n".to_string())];
        let x = make_placeholder(&mut ns, "x", shape, DType::Float32).unwrap();
        let out = Array::output("y", x);
        ns.insert("y", out).unwrap();

        let bound = generate_kernel(ns).unwrap();
        assert!(bound.source.contains("int64_t n"));
        assert!(bound.source.contains("for (int64_t y_dim0 = 0; y_dim0 < n; ++y_dim0)"));
    }

    #[test]
    fn test_empty_program_has_void_signature() {
        let bound = CTarget::new()
            .finalize(KernelProgram::new(), BTreeMap::new())
            .unwrap();
        assert!(bound.source.contains("void kernel(void) {"));
    }

    #[test]
    fn test_float_constants_keep_decimal_point() {
        let program = KernelProgram::new();
        assert_eq!(
            expr_text(&program, &ScalarExpr::FloatConst(2.0)).unwrap(),
            "2.0"
        );
    }
}
