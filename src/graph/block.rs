//! The basic block: an ordered, mutable sequence of operation nodes.
//!
//! The block is the single owner of its nodes and of every use-list. All
//! operand rebinding goes through [`BasicBlock::set_operand`] so the
//! reverse index from producers to consumers stays exact; passes never
//! touch a use-list directly.

use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::graph::node::{Def, Node, NodeId, Op, Use};
use crate::graph::types::TensorType;

/// Structural invariant violations reported by [`BasicBlock::verify`].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum GraphError {
    #[error("operand {slot} of node {node} references a node outside the block")]
    DanglingOperand { node: usize, slot: usize },
    #[error("operand {slot} of node {node} references result {index} of a node with {available} results")]
    BadResultIndex {
        node: usize,
        slot: usize,
        index: usize,
        available: usize,
    },
    #[error("use-list of node {node} does not match its actual consumers")]
    UseListMismatch { node: usize },
    #[error("execution order does not cover the node arena exactly")]
    CorruptOrder,
}

/// A branch-free, topologically ordered sequence of operation nodes.
///
/// Nodes live in an arena indexed by [`NodeId`]; `order` holds the
/// execution sequence. Nodes are only ever added — rewrites redirect uses
/// and leave the dead subgraph in place for an external dead-code pass.
#[derive(Debug, Default)]
pub struct BasicBlock {
    nodes: Vec<Node>,
    order: Vec<NodeId>,
}

impl BasicBlock {
    pub fn new() -> Self {
        BasicBlock::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The current execution order.
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// The node producing `def`, or `None` for undefined defs.
    pub fn producer(&self, def: Def) -> Option<&Node> {
        if !def.is_defined() {
            return None;
        }
        self.nodes.get(def.node().0)
    }

    /// Iterate nodes in execution order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.order.iter().map(move |&id| (id, &self.nodes[id.0]))
    }

    /// Appends a node at the end of the block.
    pub fn push(&mut self, op: Op, operands: Vec<Def>, results: Vec<TensorType>) -> NodeId {
        let id = self.add_node(op, operands, results);
        self.order.push(id);
        id
    }

    /// Splices a node into the order immediately after `after`.
    ///
    /// # Panics
    ///
    /// Panics if `after` is not part of this block's order.
    pub fn insert_after(
        &mut self,
        after: NodeId,
        op: Op,
        operands: Vec<Def>,
        results: Vec<TensorType>,
    ) -> NodeId {
        let pos = self
            .order
            .iter()
            .position(|&n| n == after)
            .unwrap_or_else(|| panic!("insert_after: node {} is not in the block", after.0));
        let id = self.add_node(op, operands, results);
        self.order.insert(pos + 1, id);
        id
    }

    fn add_node(&mut self, op: Op, operands: Vec<Def>, results: Vec<TensorType>) -> NodeId {
        assert!(!results.is_empty(), "a node must have at least one result");
        let id = NodeId(self.nodes.len());
        for (slot, def) in operands.iter().enumerate() {
            if def.is_defined() {
                self.nodes[def.node().0].uses.push(Use { consumer: id, slot });
            }
        }
        self.nodes.push(Node {
            op,
            operands,
            results,
            uses: Vec::new(),
        });
        id
    }

    /// Rebinds one operand slot, keeping both affected use-lists exact.
    pub fn set_operand(&mut self, consumer: NodeId, slot: usize, def: Def) {
        let old = self.nodes[consumer.0].operands[slot];
        if old == def {
            return;
        }
        if old.is_defined() {
            let uses = &mut self.nodes[old.node().0].uses;
            let pos = uses
                .iter()
                .position(|u| u.consumer == consumer && u.slot == slot)
                .expect("use-list out of sync with operand");
            uses.swap_remove(pos);
        }
        self.nodes[consumer.0].operands[slot] = def;
        if def.is_defined() {
            self.nodes[def.node().0].uses.push(Use {
                consumer,
                slot,
            });
        }
    }

    pub fn set_result_type(&mut self, id: NodeId, index: usize, ty: TensorType) {
        self.nodes[id.0].results[index] = ty;
    }

    /// Redirects every consumer slot currently referencing `from` to `to`.
    /// Afterwards no operand in the block references `from`.
    pub fn replace_all_uses(&mut self, from: Def, to: Def) {
        assert!(from.is_defined(), "cannot replace uses of an undefined def");
        if from == to {
            return;
        }
        let consumers: Vec<Use> = self.nodes[from.node().0]
            .uses
            .iter()
            .copied()
            .filter(|u| self.nodes[u.consumer.0].operands[u.slot] == from)
            .collect();
        for u in consumers {
            self.set_operand(u.consumer, u.slot, to);
        }
    }

    /// Checks the block's structural invariants: the order covers the arena
    /// exactly, every defined operand resolves to a live result, and each
    /// use-list equals the set of (consumer, slot) pairs referencing the
    /// node.
    pub fn verify(&self) -> Result<(), GraphError> {
        if self.order.len() != self.nodes.len() {
            return Err(GraphError::CorruptOrder);
        }
        let mut seen = FxHashSet::default();
        for &id in &self.order {
            if id.0 >= self.nodes.len() || !seen.insert(id) {
                return Err(GraphError::CorruptOrder);
            }
        }

        let mut expected: FxHashMap<NodeId, Vec<Use>> = FxHashMap::default();
        for (idx, node) in self.nodes.iter().enumerate() {
            for (slot, def) in node.operands.iter().enumerate() {
                if !def.is_defined() {
                    continue;
                }
                if def.node().0 >= self.nodes.len() {
                    return Err(GraphError::DanglingOperand { node: idx, slot });
                }
                let available = self.nodes[def.node().0].results.len();
                if def.index() >= available {
                    return Err(GraphError::BadResultIndex {
                        node: idx,
                        slot,
                        index: def.index(),
                        available,
                    });
                }
                expected.entry(def.node()).or_default().push(Use {
                    consumer: NodeId(idx),
                    slot,
                });
            }
        }
        for (idx, node) in self.nodes.iter().enumerate() {
            let mut actual = node.uses.clone();
            let mut want = expected.remove(&NodeId(idx)).unwrap_or_default();
            actual.sort_unstable();
            want.sort_unstable();
            if actual != want {
                return Err(GraphError::UseListMismatch { node: idx });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::types::{DType, TensorType};

    fn ty() -> TensorType {
        TensorType::ranked(DType::F32, vec![4])
    }

    fn input(block: &mut BasicBlock) -> NodeId {
        block.push(Op::Input, vec![], vec![ty()])
    }

    #[test]
    fn test_push_registers_uses() {
        let mut block = BasicBlock::new();
        let a = input(&mut block);
        let b = input(&mut block);
        let add = block.push(
            Op::Add,
            vec![Def::new(a, 0), Def::new(b, 0)],
            vec![ty()],
        );
        assert_eq!(block.node(a).num_uses(), 1);
        assert_eq!(block.node(b).uses(), &[Use { consumer: add, slot: 1 }]);
        assert_eq!(block.node(add).num_uses(), 0);
        block.verify().unwrap();
    }

    #[test]
    fn test_insert_after_splices_order() {
        let mut block = BasicBlock::new();
        let a = input(&mut block);
        let b = input(&mut block);
        let c = block.insert_after(a, Op::Reshape, vec![Def::new(a, 0)], vec![ty()]);
        assert_eq!(block.order(), &[a, c, b]);
        block.verify().unwrap();
    }

    #[test]
    #[should_panic(expected = "is not in the block")]
    fn test_insert_after_unknown_node_panics() {
        let mut block = BasicBlock::new();
        block.insert_after(NodeId(7), Op::Input, vec![], vec![ty()]);
    }

    #[test]
    fn test_set_operand_moves_use_entries() {
        let mut block = BasicBlock::new();
        let a = input(&mut block);
        let b = input(&mut block);
        let consumer = block.push(Op::Reshape, vec![Def::new(a, 0)], vec![ty()]);
        block.set_operand(consumer, 0, Def::new(b, 0));
        assert_eq!(block.node(a).num_uses(), 0);
        assert_eq!(block.node(b).num_uses(), 1);
        assert_eq!(block.node(consumer).operand(0), Def::new(b, 0));
        block.verify().unwrap();
    }

    #[test]
    fn test_set_operand_to_undefined() {
        let mut block = BasicBlock::new();
        let a = input(&mut block);
        let consumer = block.push(Op::Reshape, vec![Def::new(a, 0)], vec![ty()]);
        block.set_operand(consumer, 0, Def::undefined());
        assert_eq!(block.node(a).num_uses(), 0);
        assert!(!block.node(consumer).operand(0).is_defined());
        block.verify().unwrap();
    }

    #[test]
    fn test_replace_all_uses_covers_every_slot() {
        let mut block = BasicBlock::new();
        let a = input(&mut block);
        let b = input(&mut block);
        // a used twice by the same consumer and once by another.
        let mul = block.push(
            Op::Mul,
            vec![Def::new(a, 0), Def::new(a, 0)],
            vec![ty()],
        );
        let reshape = block.push(Op::Reshape, vec![Def::new(a, 0)], vec![ty()]);
        block.replace_all_uses(Def::new(a, 0), Def::new(b, 0));
        assert_eq!(block.node(a).num_uses(), 0);
        assert_eq!(block.node(b).num_uses(), 3);
        assert_eq!(block.node(mul).operand(0), Def::new(b, 0));
        assert_eq!(block.node(mul).operand(1), Def::new(b, 0));
        assert_eq!(block.node(reshape).operand(0), Def::new(b, 0));
        block.verify().unwrap();
    }

    #[test]
    fn test_verify_detects_corrupted_use_list() {
        let mut block = BasicBlock::new();
        let a = input(&mut block);
        let _consumer = block.push(Op::Reshape, vec![Def::new(a, 0)], vec![ty()]);
        block.nodes[a.0].uses.clear();
        assert_eq!(
            block.verify(),
            Err(GraphError::UseListMismatch { node: a.0 })
        );
    }
}
