//! Node construction with an explicit insertion point.
//!
//! The builder is how passes splice nodes into an existing block: anchored
//! with [`BlockBuilder::insert_after`], each emitted node lands directly
//! after the previous one. The free-standing constructors double as the
//! graph-construction surface for tests and earlier pipeline stages.
//! Result types are always supplied by the caller — the builder performs no
//! shape inference.

use crate::graph::block::BasicBlock;
use crate::graph::node::{BatchMatMul, Def, Gemm, NodeId, Op, Softmax, Transpose};
use crate::graph::types::{TensorData, TensorType};

pub struct BlockBuilder<'a> {
    block: &'a mut BasicBlock,
    cursor: Option<NodeId>,
}

impl<'a> BlockBuilder<'a> {
    /// A builder that appends at the end of the block.
    pub fn new(block: &'a mut BasicBlock) -> Self {
        BlockBuilder {
            block,
            cursor: None,
        }
    }

    /// A builder that splices nodes immediately after `node`, advancing the
    /// insertion point past each emitted node.
    pub fn insert_after(block: &'a mut BasicBlock, node: NodeId) -> Self {
        BlockBuilder {
            block,
            cursor: Some(node),
        }
    }

    fn emit(&mut self, op: Op, operands: Vec<Def>, results: Vec<TensorType>) -> NodeId {
        let id = match self.cursor {
            Some(after) => self.block.insert_after(after, op, operands, results),
            None => self.block.push(op, operands, results),
        };
        if self.cursor.is_some() {
            self.cursor = Some(id);
        }
        id
    }

    pub fn input(&mut self, ty: TensorType) -> Def {
        let id = self.emit(Op::Input, vec![], vec![ty]);
        Def::new(id, 0)
    }

    pub fn constant(&mut self, data: TensorData) -> Def {
        let ty = data.ty().clone();
        let id = self.emit(Op::Constant(data), vec![], vec![ty]);
        Def::new(id, 0)
    }

    /// A single-element `F32` constant.
    pub fn scalar(&mut self, value: f32) -> Def {
        self.constant(TensorData::scalar(value))
    }

    pub fn transpose(&mut self, src: Def, perm: Vec<usize>, ty: TensorType) -> Def {
        let id = self.emit(Op::Transpose(Transpose { perm }), vec![src], vec![ty]);
        Def::new(id, 0)
    }

    pub fn reshape(&mut self, src: Def, ty: TensorType) -> Def {
        let id = self.emit(Op::Reshape, vec![src], vec![ty]);
        Def::new(id, 0)
    }

    pub fn gemm(
        &mut self,
        a: Def,
        b: Def,
        bias: Option<Def>,
        attrs: Gemm,
        ty: TensorType,
    ) -> Def {
        let mut operands = vec![a, b];
        if let Some(bias) = bias {
            operands.push(bias);
        }
        let id = self.emit(Op::Gemm(attrs), operands, vec![ty]);
        Def::new(id, 0)
    }

    pub fn batch_matmul(&mut self, a: Def, b: Def, attrs: BatchMatMul, ty: TensorType) -> Def {
        let id = self.emit(Op::BatchMatMul(attrs), vec![a, b], vec![ty]);
        Def::new(id, 0)
    }

    pub fn softmax(&mut self, src: Def, axis: i64, ty: TensorType) -> Def {
        let id = self.emit(Op::Softmax(Softmax { axis }), vec![src], vec![ty]);
        Def::new(id, 0)
    }

    pub fn mul(&mut self, lhs: Def, rhs: Def, ty: TensorType) -> Def {
        let id = self.emit(Op::Mul, vec![lhs, rhs], vec![ty]);
        Def::new(id, 0)
    }

    pub fn sub(&mut self, lhs: Def, rhs: Def, ty: TensorType) -> Def {
        let id = self.emit(Op::Sub, vec![lhs, rhs], vec![ty]);
        Def::new(id, 0)
    }

    pub fn add(&mut self, lhs: Def, rhs: Def, ty: TensorType) -> Def {
        let id = self.emit(Op::Add, vec![lhs, rhs], vec![ty]);
        Def::new(id, 0)
    }

    /// A `Custom`-tagged node with `num_results` results, all initially
    /// unresolved; the caller assigns result types afterwards. Operands may
    /// include undefined placeholders.
    pub fn custom(&mut self, tag: &str, operands: Vec<Def>, num_results: usize) -> NodeId {
        assert!(num_results > 0, "a custom node needs at least one result");
        self.emit(
            Op::Custom {
                tag: tag.to_string(),
            },
            operands,
            vec![TensorType::Unresolved; num_results],
        )
    }
}
