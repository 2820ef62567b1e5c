//! Lowering: walks the array expression DAG and assembles a kernel program.
//!
//! ```text
//! Namespace / node / name→node mapping
//!   └→ promote_to_outputs     (DAG-preserving copy, Output wrapping)
//!       └→ LowerState         (one per pass)
//!           └→ lower_node     (per-variant dispatch, memoized by NodeId)
//!               └→ rewrite_expr  (scalar rewriter, resolves references)
//!                   └→ lower_node  …
//!       └→ Target::finalize   (kernel program → bound program)
//! ```
//!
//! Every node lowers at most once per pass: the result cache is keyed on
//! node identity, so shared sub-expressions compile once and all consumers
//! observe the same [`GeneratedResult`]. The pass either fully succeeds or
//! aborts on the first error; a partial program is never handed to a
//! backend.

mod rewrite;

pub(crate) use rewrite::ExprContext;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use indexmap::IndexMap;
use log::debug;

use crate::array::{Array, ArrayKind, ArrayRef, DType, Namespace, NodeId, Shape};
use crate::bail_malformed;
use crate::error::{LowerError, Result};
use crate::kernel::{
    ArgRole, BufferArg, Instruction, KernelProgram, LoopDomain, NameGenerator,
};
use crate::scalar::{substitute, ScalarExpr};
use crate::target::{BoundProgram, CTarget, Target};
use crate::transform::CopyMapper;

/// Recursion bound for the walker and rewriter. A graph deeper than this
/// aborts with a diagnostic instead of overflowing the native stack.
pub const MAX_LOWER_DEPTH: usize = 1024;

/// Name a bare node is wrapped under when passed directly to
/// [`generate_kernel`].
pub const DEFAULT_OUTPUT_NAME: &str = "out";

// ─── Generated results ────────────────────────────────────────────

/// The memoized outcome of lowering one node.
#[derive(Debug, Clone)]
pub(crate) enum GeneratedResult {
    /// The node lives in a named kernel buffer.
    Array(ArrayResult),
    /// The node is an inline scalar expression over the positional index
    /// names `_0…_{ndim-1}`; materialization is deferred to consumers.
    Expression(ExpressionResult),
}

#[derive(Debug, Clone)]
pub(crate) struct ArrayResult {
    pub name: String,
    pub shape: Shape,
    pub dtype: DType,
    /// Instruction ids that produce the buffer's contents (empty for
    /// inputs). Merged into the consuming context on access.
    pub depends_on: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct ExpressionResult {
    pub expr: ScalarExpr,
    pub shape: Shape,
    pub dtype: DType,
    /// Dependencies harvested while rewriting the expression's body.
    /// Merged into the consuming context on access.
    pub depends_on: BTreeSet<String>,
}

impl GeneratedResult {
    /// Render this result accessed at `indices`, merging this result's
    /// dependencies into `ctx`. The empty tuple is a scalar access for a
    /// buffer-backed result; an expression result requires exactly one
    /// index per placeholder dimension.
    pub fn to_expression(
        &self,
        indices: &[ScalarExpr],
        ctx: &mut ExprContext,
    ) -> Result<ScalarExpr> {
        match self {
            GeneratedResult::Array(r) => {
                ctx.depends_on.extend(r.depends_on.iter().cloned());
                if indices.is_empty() {
                    Ok(ScalarExpr::var(r.name.clone()))
                } else if indices.len() != r.shape.len() {
                    Err(LowerError::RankMismatch {
                        name: r.name.clone(),
                        expected: r.shape.len(),
                        got: indices.len(),
                    })
                } else {
                    Ok(ScalarExpr::subscript(r.name.clone(), indices.to_vec()))
                }
            }
            GeneratedResult::Expression(r) => {
                ctx.depends_on.extend(r.depends_on.iter().cloned());
                if indices.len() != r.shape.len() {
                    return Err(LowerError::RankMismatch {
                        name: "index lambda expression".to_string(),
                        expected: r.shape.len(),
                        got: indices.len(),
                    });
                }
                let map: BTreeMap<String, ScalarExpr> = indices
                    .iter()
                    .enumerate()
                    .map(|(d, idx)| (ScalarExpr::index_var(d), idx.clone()))
                    .collect();
                Ok(substitute(&r.expr, &map))
            }
        }
    }
}

// ─── Lowering state ───────────────────────────────────────────────

/// Everything threaded through one lowering pass: the namespace view (the
/// global namespace plus a stack of local scopes, innermost last), the
/// in-progress program, the result cache, and the name generators.
pub(crate) struct LowerState {
    namespace: Namespace,
    scopes: Vec<IndexMap<String, ArrayRef>>,
    program: KernelProgram,
    results: HashMap<NodeId, GeneratedResult>,
    in_progress: HashSet<NodeId>,
    name_gen: NameGenerator,
    insn_gen: NameGenerator,
    depth: usize,
}

impl LowerState {
    pub fn new(namespace: Namespace) -> LowerState {
        let name_gen = NameGenerator::with_existing(namespace.names().cloned());
        LowerState {
            namespace,
            scopes: Vec::new(),
            program: KernelProgram::new(),
            results: HashMap::new(),
            in_progress: HashSet::new(),
            name_gen,
            insn_gen: NameGenerator::new(),
            depth: 0,
        }
    }

    /// Look `name` up through the scope chain, innermost first, falling
    /// back to the global namespace.
    pub fn resolve(&self, name: &str) -> Result<ArrayRef> {
        for scope in self.scopes.iter().rev() {
            if let Some(node) = scope.get(name) {
                return Ok(node.clone());
            }
        }
        if let Some(node) = self.namespace.get(name) {
            return Ok(node.clone());
        }
        Err(LowerError::UndefinedName(name.to_string()))
    }

    /// Lower one node, memoized: repeat visits return the cached result.
    pub fn lower_node(&mut self, node: &ArrayRef) -> Result<GeneratedResult> {
        if let Some(result) = self.results.get(&node.id()) {
            return Ok(result.clone());
        }
        if !self.in_progress.insert(node.id()) {
            bail_malformed!("cycle through {}", node.describe());
        }
        self.depth += 1;
        let result = if self.depth > MAX_LOWER_DEPTH {
            Err(LowerError::Inconsistent(format!(
                "lowering depth exceeded {} at {}",
                MAX_LOWER_DEPTH,
                node.describe()
            )))
        } else {
            self.dispatch(node)
        };
        self.depth -= 1;
        self.in_progress.remove(&node.id());
        let result = result?;
        self.results.insert(node.id(), result.clone());
        Ok(result)
    }

    fn dispatch(&mut self, node: &ArrayRef) -> Result<GeneratedResult> {
        debug!("lowering {}", node.describe());
        match node.kind() {
            ArrayKind::Placeholder { name } => self.lower_placeholder(node, name),
            ArrayKind::Output { name, inner } => self.lower_output(node, name, inner),
            ArrayKind::IndexLambda { expr, bindings } => {
                self.lower_index_lambda(node, expr, bindings)
            }
            ArrayKind::DataWrapper { name, .. } => Err(LowerError::UnsupportedNode {
                kind: "data wrapper",
                name: name.clone(),
            }),
        }
    }

    fn lower_placeholder(&mut self, node: &ArrayRef, name: &str) -> Result<GeneratedResult> {
        self.program.push_arg(BufferArg {
            name: name.to_string(),
            shape: node.shape().clone(),
            dtype: node.dtype(),
            role: ArgRole::Input,
        })?;
        Ok(GeneratedResult::Array(ArrayResult {
            name: name.to_string(),
            shape: node.shape().clone(),
            dtype: node.dtype(),
            depends_on: BTreeSet::new(),
        }))
    }

    fn lower_output(
        &mut self,
        node: &ArrayRef,
        name: &str,
        inner: &ArrayRef,
    ) -> Result<GeneratedResult> {
        if node.shape().is_empty() {
            return Err(LowerError::ScalarOutput(name.to_string()));
        }

        let inner_result = self.lower_node(inner)?;

        let loop_vars: Vec<String> = (0..node.ndim())
            .map(|d| self.name_gen.fresh(&format!("{}_dim{}", name, d)))
            .collect();
        let domain = LoopDomain::for_shape(loop_vars.clone(), node.shape().clone())?;
        let indices: Vec<ScalarExpr> = loop_vars
            .iter()
            .map(|v| ScalarExpr::var(v.clone()))
            .collect();

        let mut ctx = ExprContext::new();
        let rhs = inner_result.to_expression(&indices, &mut ctx)?;
        if let Some(var) = ctx.reduction_bounds.keys().next() {
            return Err(LowerError::UnsupportedReduction(var.clone()));
        }

        let insn_id = self.insn_gen.fresh(&format!("{}_store", name));
        self.program.push_arg(BufferArg {
            name: name.to_string(),
            shape: node.shape().clone(),
            dtype: node.dtype(),
            role: ArgRole::Output,
        })?;
        self.program.push_domain(domain)?;
        self.program.push_instruction(Instruction {
            id: insn_id.clone(),
            target: name.to_string(),
            indices,
            rhs,
            within: loop_vars.into_iter().collect(),
            depends_on: ctx.depends_on,
        })?;

        Ok(GeneratedResult::Array(ArrayResult {
            name: name.to_string(),
            shape: node.shape().clone(),
            dtype: node.dtype(),
            depends_on: BTreeSet::from([insn_id]),
        }))
    }

    fn lower_index_lambda(
        &mut self,
        node: &ArrayRef,
        expr: &ScalarExpr,
        bindings: &IndexMap<String, ArrayRef>,
    ) -> Result<GeneratedResult> {
        self.scopes.push(bindings.clone());
        let mut ctx = ExprContext::new();
        let rewritten = self.rewrite_expr(expr, &mut ctx);
        self.scopes.pop();
        let rewritten = rewritten?;

        Ok(GeneratedResult::Expression(ExpressionResult {
            expr: rewritten,
            shape: node.shape().clone(),
            dtype: node.dtype(),
            depends_on: ctx.depends_on,
        }))
    }
}

// ─── Entry point ──────────────────────────────────────────────────

/// What to lower: a prepared namespace, a single result node, or an
/// ordered mapping of result names to nodes.
pub enum KernelInput {
    Namespace(Namespace),
    Node(ArrayRef),
    Mapping(Vec<(String, ArrayRef)>),
}

impl From<Namespace> for KernelInput {
    fn from(ns: Namespace) -> KernelInput {
        KernelInput::Namespace(ns)
    }
}

impl From<ArrayRef> for KernelInput {
    fn from(node: ArrayRef) -> KernelInput {
        KernelInput::Node(node)
    }
}

impl From<&ArrayRef> for KernelInput {
    fn from(node: &ArrayRef) -> KernelInput {
        KernelInput::Node(node.clone())
    }
}

impl From<Vec<(String, ArrayRef)>> for KernelInput {
    fn from(entries: Vec<(String, ArrayRef)>) -> KernelInput {
        KernelInput::Mapping(entries)
    }
}

impl From<IndexMap<String, ArrayRef>> for KernelInput {
    fn from(entries: IndexMap<String, ArrayRef>) -> KernelInput {
        KernelInput::Mapping(entries.into_iter().collect())
    }
}

/// Promote a name→node mapping to a namespace of Output nodes.
///
/// The referenced sub-graphs are deep-copied into the fresh namespace with
/// sharing preserved; each entry is wrapped as an Output over its copy,
/// with the output name made unique against names the copy brought along.
fn promote_to_outputs(entries: Vec<(String, ArrayRef)>) -> Result<Namespace> {
    let mut seen = HashSet::new();
    for (name, _) in &entries {
        if !seen.insert(name.clone()) {
            return Err(LowerError::DuplicateName(name.clone()));
        }
    }

    let mut namespace = Namespace::new();
    let mut mapper = CopyMapper::new();
    let mut copied = Vec::with_capacity(entries.len());
    for (name, node) in &entries {
        copied.push((name.clone(), mapper.copy(&mut namespace, node)?));
    }

    let mut names = NameGenerator::with_existing(namespace.names().cloned());
    for (name, node) in copied {
        let out_name = names.fresh(&name);
        let output = Array::output(out_name.clone(), node);
        namespace.insert(out_name, output)?;
    }
    Ok(namespace)
}

/// Lower `input` with the built-in C backend.
pub fn generate_kernel(input: impl Into<KernelInput>) -> Result<BoundProgram> {
    generate_kernel_with_target(input, &CTarget::new())
}

/// Lower `input` and hand the finished program to `target`.
pub fn generate_kernel_with_target(
    input: impl Into<KernelInput>,
    target: &dyn Target,
) -> Result<BoundProgram> {
    let namespace = match input.into() {
        KernelInput::Namespace(ns) => ns,
        KernelInput::Node(node) => {
            promote_to_outputs(vec![(DEFAULT_OUTPUT_NAME.to_string(), node)])?
        }
        KernelInput::Mapping(entries) => promote_to_outputs(entries)?,
    };

    debug!(
        "lowering {} top-level nodes for target '{}'",
        namespace.len(),
        target.name()
    );

    let mut state = LowerState::new(namespace);
    let roots: Vec<ArrayRef> = state.namespace.iter().map(|(_, node)| node.clone()).collect();
    for node in &roots {
        state.lower_node(node)?;
    }

    let LowerState { program, .. } = state;
    target.finalize(program, BTreeMap::new())
}

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{make_placeholder, shape_of, Extent};
    use crate::scalar::BinOp;

    fn state_with(namespace: Namespace) -> LowerState {
        LowerState::new(namespace)
    }

    #[test]
    fn test_placeholder_lowers_to_input_arg() {
        let mut ns = Namespace::new();
        let x = make_placeholder(&mut ns, "x", shape_of(&[10]), DType::Float32).unwrap();
        let mut state = state_with(ns);

        let result = state.lower_node(&x).unwrap();
        match &result {
            GeneratedResult::Array(r) => {
                assert_eq!(r.name, "x");
                assert!(r.depends_on.is_empty());
            }
            other => panic!("expected array result, got {:?}", other),
        }
        assert_eq!(state.program.args().len(), 1);
        assert_eq!(state.program.args()[0].role, ArgRole::Input);
        assert!(state.program.instructions().is_empty());
    }

    #[test]
    fn test_node_lowers_once() {
        let mut ns = Namespace::new();
        let x = make_placeholder(&mut ns, "x", shape_of(&[10]), DType::Float32).unwrap();
        let mut state = state_with(ns);

        state.lower_node(&x).unwrap();
        state.lower_node(&x).unwrap();
        assert_eq!(state.program.args().len(), 1);
        assert_eq!(state.results.len(), 1);
    }

    #[test]
    fn test_output_emits_domain_matching_shape() {
        let mut ns = Namespace::new();
        let x = make_placeholder(&mut ns, "x", shape_of(&[3, 7]), DType::Float64).unwrap();
        let out = Array::output("y", x);
        ns.insert("y", out.clone()).unwrap();
        let mut state = state_with(ns);

        state.lower_node(&out).unwrap();
        assert_eq!(state.program.domains().len(), 1);
        let domain = &state.program.domains()[0];
        assert_eq!(domain.loop_vars, ["y_dim0", "y_dim1"]);
        assert_eq!(domain.extents, shape_of(&[3, 7]));

        let insn = &state.program.instructions()[0];
        assert_eq!(insn.id, "y_store");
        assert_eq!(insn.target, "y");
        assert_eq!(format!("{}", insn.rhs), "x[y_dim0, y_dim1]");
        assert_eq!(insn.within.len(), 2);
    }

    #[test]
    fn test_scalar_output_fails_fast() {
        let mut ns = Namespace::new();
        let x = make_placeholder(&mut ns, "x", vec![], DType::Float32).unwrap();
        let out = Array::output("y", x);
        ns.insert("y", out.clone()).unwrap();
        let mut state = state_with(ns);

        let err = state.lower_node(&out).unwrap_err();
        assert!(matches!(err, LowerError::ScalarOutput(name) if name == "y"));
    }

    #[test]
    fn test_data_wrapper_fails_fast() {
        use crate::array::{make_data_wrapper, HostData};
        let mut ns = Namespace::new();
        let data = HostData::new(DType::Float32, vec![2], vec![0; 8]).unwrap();
        let w = make_data_wrapper(&mut ns, "w", data).unwrap();
        let mut state = state_with(ns);

        let err = state.lower_node(&w).unwrap_err();
        assert!(matches!(err, LowerError::UnsupportedNode { kind, .. } if kind == "data wrapper"));
    }

    #[test]
    fn test_index_lambda_defers_materialization() {
        let mut ns = Namespace::new();
        let a = make_placeholder(&mut ns, "a", shape_of(&[5]), DType::Float32).unwrap();
        let b = make_placeholder(&mut ns, "b", shape_of(&[5]), DType::Float32).unwrap();
        let sum = crate::array::add(&a, &b).unwrap();
        let mut state = state_with(ns);

        let result = state.lower_node(&sum).unwrap();
        match &result {
            GeneratedResult::Expression(r) => {
                assert_eq!(format!("{}", r.expr), "(a[_0] + b[_0])");
            }
            other => panic!("expected expression result, got {:?}", other),
        }
        // Placeholders became args; nothing was materialized.
        assert_eq!(state.program.args().len(), 2);
        assert!(state.program.instructions().is_empty());
        // The binding scope was popped.
        assert!(state.scopes.is_empty());
    }

    #[test]
    fn test_scope_popped_on_rewrite_failure() {
        let mut ns = Namespace::new();
        let a = make_placeholder(&mut ns, "a", shape_of(&[5]), DType::Float32).unwrap();
        let mut bindings = IndexMap::new();
        bindings.insert("_in0".to_string(), a);
        // Body references a name bound nowhere.
        let bad = Array::index_lambda(
            ScalarExpr::var("nonexistent"),
            shape_of(&[5]),
            DType::Float32,
            bindings,
        );
        let mut state = state_with(ns);

        let err = state.lower_node(&bad).unwrap_err();
        assert!(matches!(err, LowerError::UndefinedName(name) if name == "nonexistent"));
        assert!(state.scopes.is_empty());
    }

    #[test]
    fn test_promote_preserves_sharing() {
        let mut ns = Namespace::new();
        let x = make_placeholder(&mut ns, "x", shape_of(&[4]), DType::Float32).unwrap();
        let twice = crate::array::add(&x, &x).unwrap();
        let square = crate::array::mul(&x, &x).unwrap();

        let promoted = promote_to_outputs(vec![
            ("twice".to_string(), twice),
            ("square".to_string(), square),
        ])
        .unwrap();

        let inner_binding = |name: &str| {
            let out = promoted.get(name).unwrap();
            match out.kind() {
                ArrayKind::Output { inner, .. } => match inner.kind() {
                    ArrayKind::IndexLambda { bindings, .. } => bindings["_in0"].id(),
                    other => panic!("expected index lambda, got {:?}", other),
                },
                other => panic!("expected output, got {:?}", other),
            }
        };
        assert_eq!(inner_binding("twice"), inner_binding("square"));
        // x itself was copied in under its own name.
        assert!(promoted.contains("x"));
        assert_ne!(promoted.get("x").unwrap().id(), x.id());
    }

    #[test]
    fn test_promote_freshens_colliding_output_name() {
        let mut ns = Namespace::new();
        let x = make_placeholder(&mut ns, "x", shape_of(&[4]), DType::Float32).unwrap();
        let promoted = promote_to_outputs(vec![("x".to_string(), x)]).unwrap();

        // The placeholder kept its name; the output got a fresh one.
        assert!(promoted.contains("x"));
        assert!(promoted.contains("x_0"));
        assert!(matches!(
            promoted.get("x_0").unwrap().kind(),
            ArrayKind::Output { .. }
        ));
    }

    #[test]
    fn test_promote_rejects_duplicate_result_names() {
        let mut ns = Namespace::new();
        let x = make_placeholder(&mut ns, "x", shape_of(&[4]), DType::Float32).unwrap();
        let err = promote_to_outputs(vec![
            ("out".to_string(), x.clone()),
            ("out".to_string(), x),
        ])
        .unwrap_err();
        assert!(matches!(err, LowerError::DuplicateName(name) if name == "out"));
    }

    #[test]
    fn test_expression_result_rank_checked() {
        let result = GeneratedResult::Expression(ExpressionResult {
            expr: ScalarExpr::var("_0"),
            shape: shape_of(&[4]),
            dtype: DType::Float32,
            depends_on: BTreeSet::new(),
        });
        let mut ctx = ExprContext::new();
        assert!(result.to_expression(&[], &mut ctx).is_err());
        assert!(result
            .to_expression(&[ScalarExpr::var("i"), ScalarExpr::var("j")], &mut ctx)
            .is_err());
        let ok = result
            .to_expression(&[ScalarExpr::var("i")], &mut ctx)
            .unwrap();
        assert_eq!(format!("{}", ok), "i");
    }

    #[test]
    fn test_array_result_empty_tuple_is_scalar_ref() {
        let result = GeneratedResult::Array(ArrayResult {
            name: "x".to_string(),
            shape: shape_of(&[4]),
            dtype: DType::Float32,
            depends_on: BTreeSet::from(["x_store".to_string()]),
        });
        let mut ctx = ExprContext::new();
        let expr = result.to_expression(&[], &mut ctx).unwrap();
        assert_eq!(format!("{}", expr), "x");
        // Producing instructions propagate to the consumer.
        assert!(ctx.depends_on.contains("x_store"));
    }

    #[test]
    fn test_symbolic_extents_flow_through() {
        let mut ns = Namespace::new();
        let shape = vec![Extent::Sym("n".to_string())];
        let x = make_placeholder(&mut ns, "x", shape.clone(), DType::Float32).unwrap();
        let out = Array::output("y", x);
        ns.insert("y", out.clone()).unwrap();
        let mut state = state_with(ns);

        state.lower_node(&out).unwrap();
        assert_eq!(state.program.domains()[0].extents, shape);
    }

    #[test]
    fn test_elementwise_chain_rewrites_through() {
        let mut ns = Namespace::new();
        let a = make_placeholder(&mut ns, "a", shape_of(&[5]), DType::Float32).unwrap();
        let b = make_placeholder(&mut ns, "b", shape_of(&[5]), DType::Float32).unwrap();
        let c = make_placeholder(&mut ns, "c", shape_of(&[5]), DType::Float32).unwrap();
        let sum = crate::array::add(&a, &b).unwrap();
        let prod = crate::array::elementwise(BinOp::Mul, &sum, &c).unwrap();
        let out = Array::output("y", prod);
        ns.insert("y", out.clone()).unwrap();
        let mut state = state_with(ns);

        state.lower_node(&out).unwrap();
        let insn = &state.program.instructions()[0];
        assert_eq!(format!("{}", insn.rhs), "((a[y_dim0] + b[y_dim0]) * c[y_dim0])");
    }
}
