//! Rewrite passes over basic blocks.

pub mod fusion;
pub mod rules;

pub use fusion::{Fusion, FusionOptions};
pub use rules::RewriteRule;

use crate::graph::BasicBlock;

/// A block-local transform. `run` mutates the block in place and reports
/// whether anything changed.
pub trait Pass {
    fn name(&self) -> &'static str;
    fn run(&self, block: &mut BasicBlock) -> bool;
}
