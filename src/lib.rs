//! Lyra: graph-level operator fusion for a neural-network compiler.
//!
//! Lyra scans a branch-free, topologically ordered basic block of tensor
//! operations and replaces recognizable multi-node idioms with a single
//! opaque fused operation that downstream code generation consumes as a
//! unit.
//!
//! # Architecture
//!
//! - **graph**: the block-local IR the pass operates on — operation nodes,
//!   operand references, result types, use-lists, and the insertion builder
//! - **opt**: the rewrite machinery — a declarative table of simple
//!   fixed-arity rules, and the hand-written multi-head-attention matcher
//!
//! The pass never deletes nodes: a successful rewrite splices in the fused
//! node and redirects every use of the matched root, leaving the old
//! subgraph unreferenced for a separate dead-code pass to collect.

// ============================================================================
// Core Modules
// ============================================================================

pub mod graph;
pub mod opt;

// ============================================================================
// Re-exports
// ============================================================================

pub use graph::{BasicBlock, Def, NodeId};
pub use opt::{Fusion, FusionOptions, Pass};

// ============================================================================
// Prelude
// ============================================================================

/// Prelude module with commonly used types and traits.
pub mod prelude {
    pub use crate::graph::{
        BasicBlock, BatchMatMul, BlockBuilder, DType, Def, Gemm, NodeId, Op, OpKind, TensorData,
        TensorType,
    };
    pub use crate::opt::{Fusion, FusionOptions, Pass};
}
