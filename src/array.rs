//! The array expression graph.
//!
//! Arrays are immutable, reference-counted DAG nodes. Structurally identical
//! nodes are still distinct: every node carries an injected [`NodeId`] and
//! all downstream bookkeeping (memoization, copying) is keyed on it, never
//! on structural equality.
//!
//! A [`Namespace`] holds the named nodes of one computation — placeholders,
//! data wrappers, and outputs — with globally unique names in insertion
//! order. Anonymous nodes (index lambdas) are reachable from named ones.
//!
//! Construction helpers at the bottom (`make_placeholder`, elementwise
//! arithmetic, `transpose`, `roll`) build graphs; they emit no kernel code
//! themselves.

use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use indexmap::IndexMap;

use crate::bail_malformed;
use crate::error::{LowerError, Result};
use crate::scalar::{BinOp, ScalarExpr};

// ─── Dtypes and shapes ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Bool,
    Int32,
    Int64,
    Float32,
    Float64,
}

impl DType {
    /// Unify the dtypes of two elementwise operands: the "wider" wins.
    pub fn unify(self, other: DType) -> DType {
        if self.rank() >= other.rank() {
            self
        } else {
            other
        }
    }

    fn rank(self) -> u8 {
        match self {
            DType::Bool => 0,
            DType::Int32 => 1,
            DType::Int64 => 2,
            DType::Float32 => 3,
            DType::Float64 => 4,
        }
    }

    /// Size of one element in bytes.
    pub fn size_bytes(self) -> usize {
        match self {
            DType::Bool => 1,
            DType::Int32 | DType::Float32 => 4,
            DType::Int64 | DType::Float64 => 8,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::Bool => "bool",
            DType::Int32 => "i32",
            DType::Int64 => "i64",
            DType::Float32 => "f32",
            DType::Float64 => "f64",
        };
        write!(f, "{}", s)
    }
}

/// One axis extent: a fixed length or a named symbolic size.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Extent {
    Fixed(u64),
    Sym(String),
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Extent::Fixed(n) => write!(f, "{}", n),
            Extent::Sym(name) => write!(f, "{}", name),
        }
    }
}

pub type Shape = Vec<Extent>;

/// Shorthand for an all-fixed shape.
pub fn shape_of(extents: &[u64]) -> Shape {
    extents.iter().map(|&n| Extent::Fixed(n)).collect()
}

// ─── Nodes ────────────────────────────────────────────────────────

/// Injected node identity. Two nodes compare equal here only if they are
/// the same allocation, regardless of structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    fn fresh() -> NodeId {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        NodeId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Host-side array data backing a [`ArrayKind::DataWrapper`].
#[derive(Debug, Clone, PartialEq)]
pub struct HostData {
    pub dtype: DType,
    pub shape: Vec<u64>,
    pub bytes: Vec<u8>,
}

impl HostData {
    pub fn new(dtype: DType, shape: Vec<u64>, bytes: Vec<u8>) -> Result<HostData> {
        let elements: u64 = shape.iter().product();
        let expected = elements as usize * dtype.size_bytes();
        if bytes.len() != expected {
            bail_malformed!(
                "host data has {} bytes, shape {:?} of {} requires {}",
                bytes.len(),
                shape,
                dtype,
                expected
            );
        }
        Ok(HostData {
            dtype,
            shape,
            bytes,
        })
    }
}

pub type ArrayRef = Rc<Array>;

/// One node of the array expression DAG.
#[derive(Debug)]
pub struct Array {
    id: NodeId,
    kind: ArrayKind,
    shape: Shape,
    dtype: DType,
}

#[derive(Debug)]
pub enum ArrayKind {
    /// Named external input buffer.
    Placeholder { name: String },
    /// Names a node as a computation result; wraps one inner node.
    Output { name: String, inner: ArrayRef },
    /// Array defined by a scalar expression over the index variables
    /// `_0…_{ndim-1}` and named local bindings.
    IndexLambda {
        expr: ScalarExpr,
        bindings: IndexMap<String, ArrayRef>,
    },
    /// Named array backed by concrete host data. Constructible, but the
    /// lowering pass does not support it yet and rejects it loudly.
    DataWrapper { name: String, data: HostData },
}

impl Array {
    pub fn placeholder(name: impl Into<String>, shape: Shape, dtype: DType) -> ArrayRef {
        Rc::new(Array {
            id: NodeId::fresh(),
            kind: ArrayKind::Placeholder { name: name.into() },
            shape,
            dtype,
        })
    }

    pub fn output(name: impl Into<String>, inner: ArrayRef) -> ArrayRef {
        let shape = inner.shape.clone();
        let dtype = inner.dtype;
        Rc::new(Array {
            id: NodeId::fresh(),
            kind: ArrayKind::Output {
                name: name.into(),
                inner,
            },
            shape,
            dtype,
        })
    }

    pub fn index_lambda(
        expr: ScalarExpr,
        shape: Shape,
        dtype: DType,
        bindings: IndexMap<String, ArrayRef>,
    ) -> ArrayRef {
        Rc::new(Array {
            id: NodeId::fresh(),
            kind: ArrayKind::IndexLambda { expr, bindings },
            shape,
            dtype,
        })
    }

    pub fn data_wrapper(name: impl Into<String>, data: HostData) -> ArrayRef {
        let shape = shape_of(&data.shape);
        let dtype = data.dtype;
        Rc::new(Array {
            id: NodeId::fresh(),
            kind: ArrayKind::DataWrapper {
                name: name.into(),
                data,
            },
            shape,
            dtype,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> &ArrayKind {
        &self.kind
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// The node's own name, if its kind carries one.
    pub fn name(&self) -> Option<&str> {
        match &self.kind {
            ArrayKind::Placeholder { name }
            | ArrayKind::Output { name, .. }
            | ArrayKind::DataWrapper { name, .. } => Some(name),
            ArrayKind::IndexLambda { .. } => None,
        }
    }

    /// Short label for diagnostics.
    pub fn describe(&self) -> String {
        match &self.kind {
            ArrayKind::Placeholder { name } => format!("placeholder '{}'", name),
            ArrayKind::Output { name, .. } => format!("output '{}'", name),
            ArrayKind::DataWrapper { name, .. } => format!("data wrapper '{}'", name),
            ArrayKind::IndexLambda { .. } => format!("index lambda #{}", self.id.0),
        }
    }
}

// ─── Namespace ────────────────────────────────────────────────────

/// The named nodes of one computation: append-only, globally unique names,
/// insertion order preserved.
#[derive(Debug, Default)]
pub struct Namespace {
    entries: IndexMap<String, ArrayRef>,
}

impl Namespace {
    pub fn new() -> Namespace {
        Namespace::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, node: ArrayRef) -> Result<()> {
        let name = name.into();
        check_name(&name)?;
        if self.entries.contains_key(&name) {
            return Err(LowerError::DuplicateName(name));
        }
        self.entries.insert(name, node);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ArrayRef> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ArrayRef)> {
        self.entries.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Names must be identifiers, and the positional index names `_0`, `_1`, …
/// are reserved for index-lambda bodies.
fn check_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_head = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    let valid_tail = name.chars().skip(1).all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid_head || !valid_tail {
        bail_malformed!("'{}' is not a valid array name", name);
    }
    if name.starts_with('_') && name[1..].chars().all(|c| c.is_ascii_digit()) && name.len() > 1 {
        bail_malformed!("'{}' collides with the reserved index variable names", name);
    }
    Ok(())
}

// ─── Construction helpers ─────────────────────────────────────────

/// Create a placeholder and register it in the namespace.
pub fn make_placeholder(
    namespace: &mut Namespace,
    name: impl Into<String>,
    shape: Shape,
    dtype: DType,
) -> Result<ArrayRef> {
    let name = name.into();
    let node = Array::placeholder(name.clone(), shape, dtype);
    namespace.insert(name, node.clone())?;
    Ok(node)
}

/// Create a data wrapper and register it in the namespace.
pub fn make_data_wrapper(
    namespace: &mut Namespace,
    name: impl Into<String>,
    data: HostData,
) -> Result<ArrayRef> {
    let name = name.into();
    let node = Array::data_wrapper(name.clone(), data);
    namespace.insert(name, node.clone())?;
    Ok(node)
}

/// Access a binding at the surrounding lambda's positional indices:
/// `b[_0, …, _{ndim-1}]`, or a bare variable reference for rank 0.
fn positional_access(binding: &str, ndim: usize) -> ScalarExpr {
    if ndim == 0 {
        ScalarExpr::var(binding)
    } else {
        ScalarExpr::subscript(
            binding,
            (0..ndim)
                .map(|d| ScalarExpr::var(ScalarExpr::index_var(d)))
                .collect(),
        )
    }
}

/// Elementwise binary operation. Operand shapes must match exactly.
pub fn elementwise(op: BinOp, a: &ArrayRef, b: &ArrayRef) -> Result<ArrayRef> {
    if a.shape() != b.shape() {
        bail_malformed!(
            "elementwise operands have mismatched shapes: {} has {:?}, {} has {:?}",
            a.describe(),
            a.shape(),
            b.describe(),
            b.shape()
        );
    }
    let ndim = a.ndim();
    let expr = ScalarExpr::binary(op, positional_access("_in0", ndim), positional_access("_in1", ndim));
    let mut bindings = IndexMap::new();
    bindings.insert("_in0".to_string(), a.clone());
    bindings.insert("_in1".to_string(), b.clone());
    Ok(Array::index_lambda(
        expr,
        a.shape().clone(),
        a.dtype().unify(b.dtype()),
        bindings,
    ))
}

pub fn add(a: &ArrayRef, b: &ArrayRef) -> Result<ArrayRef> {
    elementwise(BinOp::Add, a, b)
}

pub fn sub(a: &ArrayRef, b: &ArrayRef) -> Result<ArrayRef> {
    elementwise(BinOp::Sub, a, b)
}

pub fn mul(a: &ArrayRef, b: &ArrayRef) -> Result<ArrayRef> {
    elementwise(BinOp::Mul, a, b)
}

pub fn div(a: &ArrayRef, b: &ArrayRef) -> Result<ArrayRef> {
    elementwise(BinOp::Div, a, b)
}

/// Permute the axes of `a`: `axes[d]` is the source axis feeding result
/// axis `d`. With no axes given, reverses them.
pub fn transpose(a: &ArrayRef, axes: Option<&[usize]>) -> Result<ArrayRef> {
    let ndim = a.ndim();
    let axes: Vec<usize> = match axes {
        Some(axes) => axes.to_vec(),
        None => (0..ndim).rev().collect(),
    };
    let mut seen = vec![false; ndim];
    if axes.len() != ndim || !axes.iter().all(|&ax| ax < ndim && !std::mem::replace(&mut seen[ax], true)) {
        bail_malformed!(
            "axes {:?} is not a permutation of 0..{} for {}",
            axes,
            ndim,
            a.describe()
        );
    }

    // Source index k is read from result index d where axes[d] == k.
    let mut source_indices = vec![ScalarExpr::IntConst(0); ndim];
    for (d, &k) in axes.iter().enumerate() {
        source_indices[k] = ScalarExpr::var(ScalarExpr::index_var(d));
    }
    let expr = if ndim == 0 {
        ScalarExpr::var("_in0")
    } else {
        ScalarExpr::subscript("_in0", source_indices)
    };

    let shape: Shape = axes.iter().map(|&k| a.shape()[k].clone()).collect();
    let mut bindings = IndexMap::new();
    bindings.insert("_in0".to_string(), a.clone());
    Ok(Array::index_lambda(expr, shape, a.dtype(), bindings))
}

/// Cyclically shift `a` by `shift` along `axis`, numpy-roll style:
/// `out[i] = a[(i - shift) mod n]`. The axis extent must be fixed.
pub fn roll(a: &ArrayRef, shift: i64, axis: usize) -> Result<ArrayRef> {
    let ndim = a.ndim();
    if axis >= ndim {
        bail_malformed!("roll axis {} out of range for {}", axis, a.describe());
    }
    let n = match &a.shape()[axis] {
        Extent::Fixed(n) => *n,
        Extent::Sym(name) => {
            bail_malformed!(
                "roll requires a fixed extent on axis {}, got symbolic '{}'",
                axis,
                name
            );
        }
    };

    let indices: Vec<ScalarExpr> = (0..ndim)
        .map(|d| {
            let var = ScalarExpr::var(ScalarExpr::index_var(d));
            if d != axis || n == 0 {
                return var;
            }
            let offset = (-shift).rem_euclid(n as i64);
            if offset == 0 {
                var
            } else {
                ScalarExpr::binary(
                    BinOp::Rem,
                    ScalarExpr::binary(BinOp::Add, var, ScalarExpr::IntConst(offset)),
                    ScalarExpr::IntConst(n as i64),
                )
            }
        })
        .collect();

    let expr = ScalarExpr::subscript("_in0", indices);
    let mut bindings = IndexMap::new();
    bindings.insert("_in0".to_string(), a.clone());
    Ok(Array::index_lambda(expr, a.shape().clone(), a.dtype(), bindings))
}

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_ids_are_distinct() {
        let a = Array::placeholder("x", shape_of(&[4]), DType::Float32);
        let b = Array::placeholder("x", shape_of(&[4]), DType::Float32);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_namespace_rejects_duplicate() {
        let mut ns = Namespace::new();
        make_placeholder(&mut ns, "x", shape_of(&[4]), DType::Float32).unwrap();
        let err = make_placeholder(&mut ns, "x", shape_of(&[4]), DType::Float32).unwrap_err();
        assert!(matches!(err, LowerError::DuplicateName(name) if name == "x"));
    }

    #[test]
    fn test_namespace_rejects_reserved_names() {
        let mut ns = Namespace::new();
        assert!(make_placeholder(&mut ns, "_0", shape_of(&[4]), DType::Float32).is_err());
        assert!(make_placeholder(&mut ns, "2x", shape_of(&[4]), DType::Float32).is_err());
        assert!(make_placeholder(&mut ns, "", shape_of(&[4]), DType::Float32).is_err());
        // A plain underscore-prefixed identifier is fine.
        assert!(make_placeholder(&mut ns, "_tmp", shape_of(&[4]), DType::Float32).is_ok());
    }

    #[test]
    fn test_namespace_preserves_insertion_order() {
        let mut ns = Namespace::new();
        make_placeholder(&mut ns, "zz", shape_of(&[1]), DType::Float32).unwrap();
        make_placeholder(&mut ns, "aa", shape_of(&[1]), DType::Float32).unwrap();
        let names: Vec<&String> = ns.names().collect();
        assert_eq!(names, ["zz", "aa"]);
    }

    #[test]
    fn test_dtype_unify() {
        assert_eq!(DType::Int32.unify(DType::Float32), DType::Float32);
        assert_eq!(DType::Float64.unify(DType::Int64), DType::Float64);
        assert_eq!(DType::Bool.unify(DType::Bool), DType::Bool);
    }

    #[test]
    fn test_elementwise_builds_index_lambda() {
        let a = Array::placeholder("a", shape_of(&[5]), DType::Float32);
        let b = Array::placeholder("b", shape_of(&[5]), DType::Float32);
        let sum = add(&a, &b).unwrap();
        assert_eq!(sum.shape(), &shape_of(&[5]));
        match sum.kind() {
            ArrayKind::IndexLambda { expr, bindings } => {
                assert_eq!(format!("{}", expr), "(_in0[_0] + _in1[_0])");
                assert_eq!(bindings.len(), 2);
                assert_eq!(bindings["_in0"].id(), a.id());
                assert_eq!(bindings["_in1"].id(), b.id());
            }
            other => panic!("expected index lambda, got {:?}", other),
        }
    }

    #[test]
    fn test_elementwise_rejects_shape_mismatch() {
        let a = Array::placeholder("a", shape_of(&[5]), DType::Float32);
        let b = Array::placeholder("b", shape_of(&[6]), DType::Float32);
        assert!(add(&a, &b).is_err());
    }

    #[test]
    fn test_transpose_permutes_shape_and_indices() {
        let a = Array::placeholder("a", shape_of(&[2, 3]), DType::Float32);
        let t = transpose(&a, None).unwrap();
        assert_eq!(t.shape(), &shape_of(&[3, 2]));
        match t.kind() {
            ArrayKind::IndexLambda { expr, .. } => {
                assert_eq!(format!("{}", expr), "_in0[_1, _0]");
            }
            other => panic!("expected index lambda, got {:?}", other),
        }
    }

    #[test]
    fn test_transpose_rejects_bad_axes() {
        let a = Array::placeholder("a", shape_of(&[2, 3]), DType::Float32);
        assert!(transpose(&a, Some(&[0, 0])).is_err());
        assert!(transpose(&a, Some(&[0, 2])).is_err());
        assert!(transpose(&a, Some(&[0])).is_err());
    }

    #[test]
    fn test_roll_wraps_index() {
        let a = Array::placeholder("a", shape_of(&[10]), DType::Float32);
        let r = roll(&a, 2, 0).unwrap();
        match r.kind() {
            ArrayKind::IndexLambda { expr, .. } => {
                assert_eq!(format!("{}", expr), "_in0[((_0 + 8) % 10)]");
            }
            other => panic!("expected index lambda, got {:?}", other),
        }
    }

    #[test]
    fn test_roll_zero_shift_is_identity_index() {
        let a = Array::placeholder("a", shape_of(&[10]), DType::Float32);
        let r = roll(&a, 10, 0).unwrap();
        match r.kind() {
            ArrayKind::IndexLambda { expr, .. } => {
                assert_eq!(format!("{}", expr), "_in0[_0]");
            }
            other => panic!("expected index lambda, got {:?}", other),
        }
    }

    #[test]
    fn test_host_data_length_validation() {
        assert!(HostData::new(DType::Float32, vec![2, 2], vec![0; 16]).is_ok());
        assert!(HostData::new(DType::Float32, vec![2, 2], vec![0; 15]).is_err());
        assert!(HostData::new(DType::Int64, vec![3], vec![0; 24]).is_ok());
    }
}
