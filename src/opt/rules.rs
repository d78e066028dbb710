//! Declarative table of simple fixed-arity rewrites.
//!
//! Each rule pairs an exact (opcode, operand count) predicate with a
//! rewrite function. The table is static, ordered, and read-only after
//! initialization; the fusion driver tries it for every node before
//! falling back to the hand-written attention matcher, and the first rule
//! that reports a substitution wins.

use log::debug;
use once_cell::sync::Lazy;

use crate::graph::{BasicBlock, BlockBuilder, Def, NodeId, OpKind};

/// One table entry. The rewrite returns the replacement def for the node's
/// result 0, or `None` to decline; it may splice new nodes into the block
/// (immediately after the matched node) but must not touch any use-list —
/// the driver performs the redirection.
pub struct RewriteRule {
    name: &'static str,
    kind: OpKind,
    num_operands: usize,
    rewrite: fn(&mut BasicBlock, NodeId) -> Option<Def>,
}

impl RewriteRule {
    pub const fn new(
        name: &'static str,
        kind: OpKind,
        num_operands: usize,
        rewrite: fn(&mut BasicBlock, NodeId) -> Option<Def>,
    ) -> Self {
        RewriteRule {
            name,
            kind,
            num_operands,
            rewrite,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Exact opcode and operand-count check.
    pub fn matches(&self, block: &BasicBlock, id: NodeId) -> bool {
        let node = block.node(id);
        node.kind() == self.kind && node.num_operands() == self.num_operands
    }
}

static RULES: Lazy<Vec<RewriteRule>> = Lazy::new(|| {
    vec![
        RewriteRule::new("gemm-bias", OpKind::Add, 2, fold_gemm_bias),
        RewriteRule::new("transpose-pair", OpKind::Transpose, 1, cancel_transpose_pair),
    ]
});

/// Runs the table against one node. Returns the replacement def of the
/// first rule that fires.
pub(crate) fn try_rewrite(block: &mut BasicBlock, id: NodeId) -> Option<Def> {
    for rule in RULES.iter() {
        if !rule.matches(block, id) {
            continue;
        }
        if let Some(replacement) = (rule.rewrite)(block, id) {
            debug!("applied rewrite rule '{}' at node {}", rule.name, id.0);
            return Some(replacement);
        }
    }
    None
}

/// `Add(gemm, constant)` with a single-use, unscaled, two-operand gemm
/// becomes a three-operand gemm carrying the bias.
fn fold_gemm_bias(block: &mut BasicBlock, id: NodeId) -> Option<Def> {
    let (a, b, bias, attrs, ty) = {
        let add = block.node(id);
        let pick = |gemm_def: Def, bias_def: Def| -> Option<(Def, Def)> {
            let gemm_node = block.producer(gemm_def)?;
            let attrs = gemm_node.as_gemm()?;
            if gemm_node.num_operands() != 2 || attrs.alpha != 1.0 || attrs.beta != 1.0 {
                return None;
            }
            // The gemm result must feed only this add, or folding would
            // change what the other consumers see.
            if gemm_node.num_uses() != 1 {
                return None;
            }
            block.producer(bias_def)?.as_constant()?;
            Some((gemm_def, bias_def))
        };
        let (gemm_def, bias_def) = pick(add.operand(0), add.operand(1))
            .or_else(|| pick(add.operand(1), add.operand(0)))?;
        let gemm_node = block.producer(gemm_def)?;
        (
            gemm_node.operand(0),
            gemm_node.operand(1),
            bias_def,
            gemm_node.as_gemm()?.clone(),
            add.result_type(0).clone(),
        )
    };
    let mut builder = BlockBuilder::insert_after(block, id);
    Some(builder.gemm(a, b, Some(bias), attrs, ty))
}

/// `Transpose(Transpose(x))` whose composed permutation is the identity
/// forwards straight to `x`; no new node is created.
fn cancel_transpose_pair(block: &mut BasicBlock, id: NodeId) -> Option<Def> {
    let outer = block.node(id);
    let outer_perm = &outer.as_transpose()?.perm;
    let inner_def = outer.operand(0);
    let inner = block.producer(inner_def)?;
    let inner_perm = &inner.as_transpose()?.perm;
    if inner.num_operands() != 1 || !composes_to_identity(outer_perm, inner_perm) {
        return None;
    }
    let src = inner.operand(0);
    src.is_defined().then_some(src)
}

fn composes_to_identity(outer: &[usize], inner: &[usize]) -> bool {
    outer.len() == inner.len()
        && outer
            .iter()
            .enumerate()
            .all(|(axis, &p)| p < inner.len() && inner[p] == axis)
}
