//! The block-local IR consumed by the fusion pass: tensor types, operation
//! nodes, operand references, and the basic block that owns them.

mod block;
mod builder;
mod node;
mod types;

pub use block::{BasicBlock, GraphError};
pub use builder::BlockBuilder;
pub use node::{BatchMatMul, Def, Gemm, Node, NodeId, Op, OpKind, Softmax, Transpose, Use};
pub use types::{DType, TensorData, TensorType};
