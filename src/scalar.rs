//! Scalar expression trees.
//!
//! A `ScalarExpr` describes one element of an array as a closed-form
//! expression over index variables, named array references, and constants.
//! Index-lambda bodies are written in this language; the lowering pass
//! rewrites them and the kernel backends print them.
//!
//! The reserved names `_0`, `_1`, … stand for the per-dimension index
//! variables of the surrounding array expression and are replaced by
//! concrete indices via [`substitute`].

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

// ─── Expression tree ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ScalarExpr {
    IntConst(i64),
    FloatConst(f64),
    BoolConst(bool),
    /// Reference to a named array (scalar access) or a loop/index variable.
    Var(String),
    /// Subscripted reference to a named array.
    Subscript {
        array: String,
        indices: Vec<ScalarExpr>,
    },
    Unary {
        op: UnaryOp,
        arg: Box<ScalarExpr>,
    },
    Binary {
        op: BinOp,
        left: Box<ScalarExpr>,
        right: Box<ScalarExpr>,
    },
    Compare {
        op: CmpOp,
        left: Box<ScalarExpr>,
        right: Box<ScalarExpr>,
    },
    /// Ternary select: `cond ? then_case : else_case`.
    Select {
        cond: Box<ScalarExpr>,
        then_case: Box<ScalarExpr>,
        else_case: Box<ScalarExpr>,
    },
    /// Reduction of `body` over `var` in `[lower, upper)`. Constructible so
    /// that front ends can build sums and products, but no lowering strategy
    /// exists for it yet: the rewriter rejects it.
    Reduce {
        op: ReduceOp,
        var: String,
        lower: Box<ScalarExpr>,
        upper: Box<ScalarExpr>,
        body: Box<ScalarExpr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Product,
    Max,
    Min,
}

impl ScalarExpr {
    pub fn var(name: impl Into<String>) -> Self {
        ScalarExpr::Var(name.into())
    }

    pub fn subscript(array: impl Into<String>, indices: Vec<ScalarExpr>) -> Self {
        ScalarExpr::Subscript {
            array: array.into(),
            indices,
        }
    }

    pub fn binary(op: BinOp, left: ScalarExpr, right: ScalarExpr) -> Self {
        ScalarExpr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn compare(op: CmpOp, left: ScalarExpr, right: ScalarExpr) -> Self {
        ScalarExpr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// The reserved name of the `d`-th positional index variable.
    pub fn index_var(d: usize) -> String {
        format!("_{}", d)
    }
}

// ─── Substitution ─────────────────────────────────────────────────

/// Structurally replace free occurrences of the mapped variable names.
///
/// Reduction-bound variables shadow the map inside their body. Subscript
/// aggregates are renamed only when mapped to a bare variable; mapping an
/// aggregate to a non-variable expression is not meaningful and the
/// aggregate is left untouched in that case.
pub fn substitute(expr: &ScalarExpr, map: &BTreeMap<String, ScalarExpr>) -> ScalarExpr {
    match expr {
        ScalarExpr::IntConst(_) | ScalarExpr::FloatConst(_) | ScalarExpr::BoolConst(_) => {
            expr.clone()
        }
        ScalarExpr::Var(name) => match map.get(name) {
            Some(replacement) => replacement.clone(),
            None => expr.clone(),
        },
        ScalarExpr::Subscript { array, indices } => {
            let array = match map.get(array) {
                Some(ScalarExpr::Var(new_name)) => new_name.clone(),
                _ => array.clone(),
            };
            ScalarExpr::Subscript {
                array,
                indices: indices.iter().map(|i| substitute(i, map)).collect(),
            }
        }
        ScalarExpr::Unary { op, arg } => ScalarExpr::Unary {
            op: *op,
            arg: Box::new(substitute(arg, map)),
        },
        ScalarExpr::Binary { op, left, right } => ScalarExpr::Binary {
            op: *op,
            left: Box::new(substitute(left, map)),
            right: Box::new(substitute(right, map)),
        },
        ScalarExpr::Compare { op, left, right } => ScalarExpr::Compare {
            op: *op,
            left: Box::new(substitute(left, map)),
            right: Box::new(substitute(right, map)),
        },
        ScalarExpr::Select {
            cond,
            then_case,
            else_case,
        } => ScalarExpr::Select {
            cond: Box::new(substitute(cond, map)),
            then_case: Box::new(substitute(then_case, map)),
            else_case: Box::new(substitute(else_case, map)),
        },
        ScalarExpr::Reduce {
            op,
            var,
            lower,
            upper,
            body,
        } => {
            let body = if map.contains_key(var) {
                let mut inner = map.clone();
                inner.remove(var);
                substitute(body, &inner)
            } else {
                substitute(body, map)
            };
            ScalarExpr::Reduce {
                op: *op,
                var: var.clone(),
                lower: Box::new(substitute(lower, map)),
                upper: Box::new(substitute(upper, map)),
                body: Box::new(body),
            }
        }
    }
}

/// Collect the free variable and aggregate names referenced by `expr`.
pub fn free_names(expr: &ScalarExpr) -> BTreeSet<String> {
    fn walk(expr: &ScalarExpr, out: &mut BTreeSet<String>) {
        match expr {
            ScalarExpr::IntConst(_) | ScalarExpr::FloatConst(_) | ScalarExpr::BoolConst(_) => {}
            ScalarExpr::Var(name) => {
                out.insert(name.clone());
            }
            ScalarExpr::Subscript { array, indices } => {
                out.insert(array.clone());
                for i in indices {
                    walk(i, out);
                }
            }
            ScalarExpr::Unary { arg, .. } => walk(arg, out),
            ScalarExpr::Binary { left, right, .. } | ScalarExpr::Compare { left, right, .. } => {
                walk(left, out);
                walk(right, out);
            }
            ScalarExpr::Select {
                cond,
                then_case,
                else_case,
            } => {
                walk(cond, out);
                walk(then_case, out);
                walk(else_case, out);
            }
            ScalarExpr::Reduce {
                var,
                lower,
                upper,
                body,
                ..
            } => {
                walk(lower, out);
                walk(upper, out);
                let mut inner = BTreeSet::new();
                walk(body, &mut inner);
                inner.remove(var);
                out.extend(inner);
            }
        }
    }
    let mut out = BTreeSet::new();
    walk(expr, &mut out);
    out
}

// ─── Display ──────────────────────────────────────────────────────

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnaryOp::Neg => write!(f, "-"),
            UnaryOp::Not => write!(f, "!"),
        }
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::And => "&&",
            BinOp::Or => "||",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReduceOp::Sum => "sum",
            ReduceOp::Product => "product",
            ReduceOp::Max => "max",
            ReduceOp::Min => "min",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for ScalarExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarExpr::IntConst(v) => write!(f, "{}", v),
            ScalarExpr::FloatConst(v) => write!(f, "{:?}", v),
            ScalarExpr::BoolConst(v) => write!(f, "{}", v),
            ScalarExpr::Var(name) => write!(f, "{}", name),
            ScalarExpr::Subscript { array, indices } => {
                write!(f, "{}[", array)?;
                for (i, idx) in indices.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", idx)?;
                }
                write!(f, "]")
            }
            ScalarExpr::Unary { op, arg } => write!(f, "{}{}", op, arg),
            ScalarExpr::Binary { op, left, right } => write!(f, "({} {} {})", left, op, right),
            ScalarExpr::Compare { op, left, right } => write!(f, "({} {} {})", left, op, right),
            ScalarExpr::Select {
                cond,
                then_case,
                else_case,
            } => write!(f, "({} ? {} : {})", cond, then_case, else_case),
            ScalarExpr::Reduce {
                op,
                var,
                lower,
                upper,
                body,
            } => write!(f, "{}({} in [{}, {}), {})", op, var, lower, upper, body),
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────
