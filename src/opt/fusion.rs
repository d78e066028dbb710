//! Operator fusion over one basic block.
//!
//! Two layers run in order for every node that still has a use: the
//! declarative table of simple fixed-arity rewrites ([`super::rules`]),
//! then a hand-written matcher that recognizes multi-head self-attention —
//! Q/K/V projections of one shared activation, scaled dot-product with
//! optional additive masking, softmax, weighted sum, and the final
//! head-merging transpose — and splices in a single `Custom` node tagged
//! `"MHA"`.
//!
//! Matching is total: every stage reports failure as `false`/`None` and
//! the block is only mutated after a complete match. Unresolved types are
//! ordinary failures, so the pass degrades gracefully while shape
//! inference is still incomplete.

use log::{debug, trace};

use crate::graph::{BasicBlock, BlockBuilder, Def, NodeId, OpKind};
use crate::opt::{rules, Pass};

/// The attention idiom is matched at fixed rank 4: (batch, heads,
/// sequence, hidden).
const ATTENTION_RANK: usize = 4;

/// The permutation that swaps the heads and sequence axes.
const HEAD_SEQ_SWAP: [usize; 4] = [0, 2, 1, 3];

/// Tag carried by the fused node; its kernel-level meaning is a convention
/// with downstream code generation.
const MHA_TAG: &str = "MHA";

// ============================================================================
// Scalar/shape predicates
// ============================================================================

/// The value of `def` iff it is a constant holding exactly one element.
pub(crate) fn scalar_value(block: &BasicBlock, def: Def) -> Option<f32> {
    let data = block.producer(def)?.as_constant()?;
    if !data.ty().is_scalar() {
        return None;
    }
    data.value_at(0)
}

/// Bit-for-bit scalar comparison.
///
/// Deliberately tolerance-free: the scale and mask-fill constants this pass
/// looks for originate from one canonical formula, so an exact check is
/// both sufficient and the cheapest way to avoid false positives. The
/// known sensitivity is that a constant off by even one ULP after
/// re-serialization will not match.
pub(crate) fn scalar_equals(block: &BasicBlock, def: Def, expected: f32) -> bool {
    scalar_value(block, def).is_some_and(|v| v.to_bits() == expected.to_bits())
}

/// True iff `def` is produced by a single-operand transpose with a fully
/// resolved result type and permutation exactly `[0, 2, 1, 3]`.
fn is_head_seq_swap(block: &BasicBlock, def: Def) -> bool {
    let Some(node) = block.producer(def) else {
        return false;
    };
    let Some(transpose) = node.as_transpose() else {
        return false;
    };
    node.num_operands() == 1
        && node.result_type(def.index()).is_resolved()
        && transpose.perm == HEAD_SEQ_SWAP
}

// ============================================================================
// Match context
// ============================================================================

/// Everything one attention match attempt captures.
///
/// The context is threaded explicitly through the sub-matchers; retry
/// points that try alternative operand orders snapshot it and restore the
/// snapshot before the second attempt, so a failed first attempt leaks no
/// captures into the next one.
#[derive(Debug, Clone)]
pub(crate) struct MatchContext {
    pub(crate) batch: i64,
    pub(crate) heads: i64,
    pub(crate) seq_len: i64,
    pub(crate) hidden_size: i64,
    pub(crate) has_masking: bool,
    pub(crate) mask_value: f32,
    pub(crate) input: Def,
    pub(crate) mask: Def,
    pub(crate) query_weight: Def,
    pub(crate) query_bias: Def,
    pub(crate) key_weight: Def,
    pub(crate) key_bias: Def,
    pub(crate) value_weight: Def,
    pub(crate) value_bias: Def,
}

impl Default for MatchContext {
    fn default() -> Self {
        MatchContext {
            batch: 0,
            heads: 0,
            seq_len: 0,
            hidden_size: 0,
            has_masking: false,
            mask_value: f32::NAN,
            input: Def::undefined(),
            mask: Def::undefined(),
            query_weight: Def::undefined(),
            query_bias: Def::undefined(),
            key_weight: Def::undefined(),
            key_bias: Def::undefined(),
            value_weight: Def::undefined(),
            value_bias: Def::undefined(),
        }
    }
}

// ============================================================================
// Attention matcher
// ============================================================================

pub(crate) struct AttentionMatcher<'b> {
    block: &'b BasicBlock,
    pub(crate) ctx: MatchContext,
}

impl<'b> AttentionMatcher<'b> {
    pub(crate) fn new(block: &'b BasicBlock) -> Self {
        AttentionMatcher {
            block,
            ctx: MatchContext::default(),
        }
    }

    /// Attempts a full match rooted at `root`. On success returns the
    /// captured context; the block is never mutated here.
    pub(crate) fn run(block: &'b BasicBlock, root: NodeId) -> Option<MatchContext> {
        let mut matcher = AttentionMatcher::new(block);
        if !matcher.match_attention(root) {
            return None;
        }
        // Final consistency gate: a structurally plausible match must also
        // be numerically consistent with the shared input.
        let input = matcher.ctx.input;
        let total = block
            .producer(input)?
            .result_type(input.index())
            .num_elements()?;
        let MatchContext {
            batch,
            heads,
            seq_len,
            hidden_size,
            ..
        } = matcher.ctx;
        let sound = batch > 0
            && heads > 0
            && seq_len > 0
            && hidden_size > 0
            && total == batch * seq_len * heads * hidden_size;
        sound.then_some(matcher.ctx)
    }

    /// Root: `Transpose{0,2,1,3}(BatchMatMul(scores, value))` with a fully
    /// resolved rank-4 result whose dims become (batch, heads, seq_len,
    /// hidden_size).
    fn match_attention(&mut self, root: NodeId) -> bool {
        let block = self.block;
        if !is_head_seq_swap(block, Def::new(root, 0)) {
            return false;
        }
        let mixed = block.node(root).operand(0);
        let Some(matmul) = block.producer(mixed) else {
            return false;
        };
        let Some(attrs) = matmul.as_batch_matmul() else {
            return false;
        };
        let dt = matmul.result_type(mixed.index());
        if !dt.is_resolved()
            || attrs.transpose_a
            || attrs.transpose_b
            || matmul.num_operands() != 2
            || dt.rank() != Some(ATTENTION_RANK)
        {
            return false;
        }
        let (Some(batch), Some(heads), Some(seq_len), Some(hidden_size)) =
            (dt.dim(0), dt.dim(1), dt.dim(2), dt.dim(3))
        else {
            return false;
        };
        self.ctx.batch = batch;
        self.ctx.heads = heads;
        self.ctx.seq_len = seq_len;
        self.ctx.hidden_size = hidden_size;

        let scores = matmul.operand(0);
        let value = matmul.operand(1);
        if !self.match_scores(scores) {
            return false;
        }
        let Some((weight, bias)) = self.match_projection(value) else {
            return false;
        };
        self.ctx.value_weight = weight;
        self.ctx.value_bias = bias;
        true
    }

    /// Scores: `softmax(scale·(Q·Kᵗ) [+ mask_term])`, normalizing over the
    /// last axis.
    fn match_scores(&mut self, def: Def) -> bool {
        let block = self.block;
        let Some(node) = block.producer(def) else {
            return false;
        };
        let Some(softmax) = node.as_softmax() else {
            return false;
        };
        if softmax.axis != -1 && softmax.axis != ATTENTION_RANK as i64 - 1 {
            return false;
        }
        let input = node.operand(0);
        let Some(input_node) = block.producer(input) else {
            return false;
        };
        if input_node.kind() == OpKind::Add && input_node.num_operands() == 2 {
            // Masked variant. The flag records that an addition feeds the
            // softmax; it is set before either operand assignment is tried
            // and survives the restore below. Callers only observe it on
            // overall success, so this is not load-bearing — do not move it.
            self.ctx.has_masking = true;
            let lhs = input_node.operand(0);
            let rhs = input_node.operand(1);
            let saved = self.ctx.clone();
            if self.match_scaled_scores(lhs) && self.match_masking(rhs) {
                return true;
            }
            self.ctx = saved;
            return self.match_scaled_scores(rhs) && self.match_masking(lhs);
        }
        self.match_scaled_scores(input)
    }

    /// Scale stage: a multiply whose scalar operand is exactly
    /// `1/sqrt(hidden_size)`. The right operand is tried as the scalar
    /// first; the operands are swapped on failure.
    fn match_scaled_scores(&mut self, def: Def) -> bool {
        let block = self.block;
        let Some(node) = block.producer(def) else {
            return false;
        };
        if node.kind() != OpKind::Mul || node.num_operands() != 2 {
            return false;
        }
        if self.ctx.heads <= 0 {
            return false;
        }
        let scale = 1.0 / (self.ctx.hidden_size as f32).sqrt();
        let (mut lhs, mut rhs) = (node.operand(0), node.operand(1));
        if !scalar_equals(block, rhs, scale) {
            std::mem::swap(&mut lhs, &mut rhs);
        }
        scalar_equals(block, rhs, scale) && self.match_qk_product(lhs)
    }

    /// `BatchMatMul(Q, Kᵗ)`: left not transposed, right transposed; operand
    /// 0 is the query projection, operand 1 the key projection.
    fn match_qk_product(&mut self, def: Def) -> bool {
        let block = self.block;
        let Some(node) = block.producer(def) else {
            return false;
        };
        let Some(attrs) = node.as_batch_matmul() else {
            return false;
        };
        if attrs.transpose_a || !attrs.transpose_b || node.num_operands() != 2 {
            return false;
        }
        let query = node.operand(0);
        let key = node.operand(1);
        let Some((weight, bias)) = self.match_projection(query) else {
            return false;
        };
        self.ctx.query_weight = weight;
        self.ctx.query_bias = bias;
        let Some((weight, bias)) = self.match_projection(key) else {
            return false;
        };
        self.ctx.key_weight = weight;
        self.ctx.key_bias = bias;
        true
    }

    /// Mask term: `fill · (1 − mask)`. For each operand order one side must
    /// be a scalar constant (the fill value) and the other a subtraction
    /// from scalar 1.0 whose right operand is the raw mask.
    fn match_masking(&mut self, def: Def) -> bool {
        let block = self.block;
        let Some(node) = block.producer(def) else {
            return false;
        };
        if node.kind() != OpKind::Mul || node.num_operands() != 2 {
            return false;
        }
        let one_minus = |def: Def| -> Option<Def> {
            let sub = block.producer(def)?;
            if sub.kind() != OpKind::Sub || sub.num_operands() != 2 {
                return None;
            }
            scalar_equals(block, sub.operand(0), 1.0).then(|| sub.operand(1))
        };
        let lhs = node.operand(0);
        let rhs = node.operand(1);
        for (fill, mask_term) in [(lhs, rhs), (rhs, lhs)] {
            if let Some(value) = scalar_value(block, fill) {
                if let Some(mask) = one_minus(mask_term) {
                    self.ctx.mask_value = value;
                    self.ctx.mask = mask;
                    return true;
                }
            }
        }
        false
    }

    /// One affine projection:
    /// `Transpose{0,2,1,3}(Reshape(Gemm(input, weight[, bias])))` with the
    /// gemm left-not-transposed, right-transposed and no folded scaling.
    ///
    /// The first successful call fixes the shared input for the whole
    /// match; every later call compares against it, and a divergence
    /// invalidates the entire match.
    fn match_projection(&mut self, def: Def) -> Option<(Def, Def)> {
        let block = self.block;
        if !is_head_seq_swap(block, def) {
            return None;
        }
        let reshape_def = block.producer(def)?.operand(0);
        let reshape = block.producer(reshape_def)?;
        if reshape.kind() != OpKind::Reshape
            || reshape.num_operands() != 1
            || !reshape.result_type(reshape_def.index()).is_resolved()
        {
            return None;
        }
        let gemm_def = reshape.operand(0);
        let gemm_node = block.producer(gemm_def)?;
        let gemm = gemm_node.as_gemm()?;
        if gemm.transpose_a
            || !gemm.transpose_b
            || gemm.alpha != 1.0
            || gemm.beta != 1.0
            || !matches!(gemm_node.num_operands(), 2 | 3)
        {
            return None;
        }
        let input = gemm_node.operand(0);
        if self.ctx.input.is_defined() && self.ctx.input != input {
            trace!(
                "projection input diverges from the shared activation; \
                 invalidating match"
            );
            self.ctx.input = Def::undefined();
            return None;
        }
        if !self.ctx.input.is_defined() {
            self.ctx.input = input;
        }
        let weight = gemm_node.operand(1);
        block.producer(weight)?.as_constant()?;
        let bias = if gemm_node.num_operands() > 2 {
            let bias = gemm_node.operand(2);
            block.producer(bias)?.as_constant()?;
            bias
        } else {
            Def::undefined()
        };
        Some((weight, bias))
    }
}

// ============================================================================
// Fused-node emission
// ============================================================================

/// Operand list of the fused node: shared input, mask (undefined when
/// unmasked), then (weight, bias) per projection. If the shared input is
/// itself produced by a reshape, that one redundant layer is elided.
fn fused_operands(block: &BasicBlock, ctx: &MatchContext) -> Vec<Def> {
    let mut input = ctx.input;
    if let Some(node) = block.producer(input) {
        if node.kind() == OpKind::Reshape {
            input = node.operand(0);
        }
    }
    vec![
        input,
        ctx.mask,
        ctx.query_weight,
        ctx.query_bias,
        ctx.key_weight,
        ctx.key_bias,
        ctx.value_weight,
        ctx.value_bias,
    ]
}

/// Splices the fused `Custom` node in directly after the matched root,
/// typed like the root's result. Uses are redirected by the caller.
fn emit_fused_attention(block: &mut BasicBlock, root: NodeId, ctx: &MatchContext) -> Def {
    let operands = fused_operands(block, ctx);
    let result = block.node(root).result_type(0).clone();
    let mut builder = BlockBuilder::insert_after(block, root);
    let id = builder.custom(MHA_TAG, operands, 1);
    block.set_result_type(id, 0, result);
    Def::new(id, 0)
}

// ============================================================================
// Pass driver
// ============================================================================

/// Which layers of the pass run.
#[derive(Debug, Clone, Copy)]
pub struct FusionOptions {
    pub simple_rules: bool,
    pub multi_head_attention: bool,
}

impl Default for FusionOptions {
    fn default() -> Self {
        FusionOptions {
            simple_rules: true,
            multi_head_attention: true,
        }
    }
}

/// The fusion pass. One invocation processes one basic block; blocks share
/// no mutable state, so different blocks may be processed in parallel.
#[derive(Debug, Default)]
pub struct Fusion {
    options: FusionOptions,
}

impl Fusion {
    pub fn new(options: FusionOptions) -> Self {
        Fusion { options }
    }

    /// Runs the pass over `block`, returning whether anything changed.
    ///
    /// Iteration walks a snapshot of the incoming order, so nodes spliced
    /// in by a rewrite are never revisited as match roots within the same
    /// invocation.
    pub fn run_on_block(&self, block: &mut BasicBlock) -> bool {
        let mut changed = false;
        let order: Vec<NodeId> = block.order().to_vec();
        for id in order {
            if block.node(id).num_uses() == 0 {
                continue;
            }
            if self.options.simple_rules {
                if let Some(replacement) = rules::try_rewrite(block, id) {
                    block.replace_all_uses(Def::new(id, 0), replacement);
                    changed = true;
                    continue;
                }
            }
            if !self.options.multi_head_attention {
                continue;
            }
            let Some(ctx) = AttentionMatcher::run(block, id) else {
                continue;
            };
            debug!(
                "fused multi-head attention at node {} \
                 (batch={}, heads={}, seq_len={}, hidden_size={})",
                id.0, ctx.batch, ctx.heads, ctx.seq_len, ctx.hidden_size
            );
            if ctx.has_masking {
                debug!("attention mask detected, fill value {}", ctx.mask_value);
            }
            let fused = emit_fused_attention(block, id, &ctx);
            block.replace_all_uses(Def::new(id, 0), fused);
            changed = true;
        }
        changed
    }
}

impl Pass for Fusion {
    fn name(&self) -> &'static str {
        "fusion"
    }

    fn run(&self, block: &mut BasicBlock) -> bool {
        self.run_on_block(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{DType, TensorData, TensorType};

    fn f32s(dims: Vec<i64>) -> TensorType {
        TensorType::ranked(DType::F32, dims)
    }

    fn zeros(dims: Vec<i64>) -> TensorData {
        let count = dims.iter().product::<i64>() as usize;
        TensorData::new(f32s(dims), vec![0.0; count])
    }

    #[test]
    fn test_scalar_value() {
        let mut block = BasicBlock::new();
        let mut b = BlockBuilder::new(&mut block);
        let scalar = b.scalar(0.25);
        let wide = b.constant(zeros(vec![2, 2]));
        let unit = b.constant(TensorData::new(f32s(vec![1, 1]), vec![3.5]));
        let input = b.input(f32s(vec![1]));
        assert_eq!(scalar_value(&block, scalar), Some(0.25));
        assert_eq!(scalar_value(&block, wide), None);
        assert_eq!(scalar_value(&block, unit), Some(3.5));
        assert_eq!(scalar_value(&block, input), None);
        assert_eq!(scalar_value(&block, Def::undefined()), None);
    }

    #[test]
    fn test_scalar_equals_is_bit_exact() {
        let mut block = BasicBlock::new();
        let mut b = BlockBuilder::new(&mut block);
        let exact = 1.0 / 16.0f32.sqrt();
        let off = f32::from_bits(exact.to_bits() + 1);
        let c_exact = b.scalar(exact);
        let c_off = b.scalar(off);
        assert!(scalar_equals(&block, c_exact, exact));
        assert!(!scalar_equals(&block, c_off, exact));
    }

    #[test]
    fn test_head_seq_swap_predicate() {
        let mut block = BasicBlock::new();
        let mut b = BlockBuilder::new(&mut block);
        let x = b.input(f32s(vec![2, 4, 8, 16]));
        let good = b.transpose(x, vec![0, 2, 1, 3], f32s(vec![2, 8, 4, 16]));
        let wrong_perm = b.transpose(x, vec![0, 1, 2, 3], f32s(vec![2, 4, 8, 16]));
        let unresolved = b.transpose(x, vec![0, 2, 1, 3], TensorType::Unresolved);
        assert!(is_head_seq_swap(&block, good));
        assert!(!is_head_seq_swap(&block, wrong_perm));
        assert!(!is_head_seq_swap(&block, unresolved));
        assert!(!is_head_seq_swap(&block, x));
    }

    #[test]
    fn test_masking_matches_either_operand_order() {
        for fill_first in [true, false] {
            let mut block = BasicBlock::new();
            let mut b = BlockBuilder::new(&mut block);
            let mask_in = b.input(f32s(vec![2, 1, 1, 8]));
            let one = b.scalar(1.0);
            let fill = b.scalar(-10000.0);
            let sub = b.sub(one, mask_in, f32s(vec![2, 1, 1, 8]));
            let term = if fill_first {
                b.mul(fill, sub, f32s(vec![2, 1, 1, 8]))
            } else {
                b.mul(sub, fill, f32s(vec![2, 1, 1, 8]))
            };
            let mut matcher = AttentionMatcher::new(&block);
            assert!(matcher.match_masking(term));
            assert_eq!(matcher.ctx.mask_value, -10000.0);
            assert_eq!(matcher.ctx.mask, mask_in);
        }
    }

    #[test]
    fn test_masking_requires_one_minus_shape() {
        let mut block = BasicBlock::new();
        let mut b = BlockBuilder::new(&mut block);
        let mask_in = b.input(f32s(vec![2, 1, 1, 8]));
        let half = b.scalar(0.5);
        let fill = b.scalar(-10000.0);
        // 0.5 - mask is not the 1 - mask idiom.
        let sub = b.sub(half, mask_in, f32s(vec![2, 1, 1, 8]));
        let term = b.mul(fill, sub, f32s(vec![2, 1, 1, 8]));
        let mut matcher = AttentionMatcher::new(&block);
        assert!(!matcher.match_masking(term));
    }

    #[test]
    fn test_masking_rejects_two_scalars_without_sub() {
        let mut block = BasicBlock::new();
        let mut b = BlockBuilder::new(&mut block);
        let fill = b.scalar(-10000.0);
        let one = b.scalar(1.0);
        let term = b.mul(fill, one, f32s(vec![1]));
        let mut matcher = AttentionMatcher::new(&block);
        assert!(!matcher.match_masking(term));
    }
}
