//! The scalar expression rewriter.
//!
//! Rewrites an index-lambda body into a kernel-ready expression: bare
//! variable and subscript references are resolved through the scope chain,
//! the referenced nodes are lowered (cache-aware), and their generated
//! results are rendered in place. Everything else is rebuilt structurally.
//!
//! Dependencies uncovered while resolving references accumulate in the
//! [`ExprContext`] by set union; the union is idempotent and survives
//! nested rewrites, so an instruction built from the final expression
//! records everything that must precede it.

use std::collections::{BTreeMap, BTreeSet};

use crate::codegen::{LowerState, MAX_LOWER_DEPTH};
use crate::error::{LowerError, Result};
use crate::scalar::ScalarExpr;

/// Per-rewrite state: one fresh instance per independent top-level rewrite.
#[derive(Debug, Default)]
pub(crate) struct ExprContext {
    /// Instruction ids the expression under rewrite depends on.
    pub depends_on: BTreeSet<String>,
    /// Bounds of reduction variables introduced by the rewrite. No rewrite
    /// path populates this yet — reductions are rejected — but an output
    /// assembly checks it stays empty before emitting its instruction.
    pub reduction_bounds: BTreeMap<String, (ScalarExpr, ScalarExpr)>,
}

impl ExprContext {
    pub fn new() -> ExprContext {
        ExprContext::default()
    }
}

impl LowerState {
    /// Recursively rewrite `expr`, resolving references via the walker.
    pub(crate) fn rewrite_expr(
        &mut self,
        expr: &ScalarExpr,
        ctx: &mut ExprContext,
    ) -> Result<ScalarExpr> {
        self.depth += 1;
        if self.depth > MAX_LOWER_DEPTH {
            self.depth -= 1;
            return Err(LowerError::Inconsistent(format!(
                "rewrite depth exceeded {}",
                MAX_LOWER_DEPTH
            )));
        }
        let result = self.rewrite_inner(expr, ctx);
        self.depth -= 1;
        result
    }

    fn rewrite_inner(&mut self, expr: &ScalarExpr, ctx: &mut ExprContext) -> Result<ScalarExpr> {
        match expr {
            ScalarExpr::IntConst(_) | ScalarExpr::FloatConst(_) | ScalarExpr::BoolConst(_) => {
                Ok(expr.clone())
            }

            // A bare reference is a scalar access at the empty index tuple.
            ScalarExpr::Var(name) => {
                let node = self.resolve(name)?;
                let result = self.lower_node(&node)?;
                result.to_expression(&[], ctx)
            }

            // The index expressions are passed through untouched: they are
            // written over the surrounding lambda's positional names and
            // get substituted when the enclosing result is itself accessed.
            ScalarExpr::Subscript { array, indices } => {
                let node = self.resolve(array)?;
                let result = self.lower_node(&node)?;
                result.to_expression(indices, ctx)
            }

            ScalarExpr::Reduce { var, .. } => {
                Err(LowerError::UnsupportedReduction(var.clone()))
            }

            ScalarExpr::Unary { op, arg } => Ok(ScalarExpr::Unary {
                op: *op,
                arg: Box::new(self.rewrite_expr(arg, ctx)?),
            }),
            ScalarExpr::Binary { op, left, right } => Ok(ScalarExpr::Binary {
                op: *op,
                left: Box::new(self.rewrite_expr(left, ctx)?),
                right: Box::new(self.rewrite_expr(right, ctx)?),
            }),
            ScalarExpr::Compare { op, left, right } => Ok(ScalarExpr::Compare {
                op: *op,
                left: Box::new(self.rewrite_expr(left, ctx)?),
                right: Box::new(self.rewrite_expr(right, ctx)?),
            }),
            ScalarExpr::Select {
                cond,
                then_case,
                else_case,
            } => Ok(ScalarExpr::Select {
                cond: Box::new(self.rewrite_expr(cond, ctx)?),
                then_case: Box::new(self.rewrite_expr(then_case, ctx)?),
                else_case: Box::new(self.rewrite_expr(else_case, ctx)?),
            }),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────
