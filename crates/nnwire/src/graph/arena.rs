//! Index-addressed storage for the operators and operands of one graph builder.
//!
//! Operators live in a flat vector and are referred to by [`NodeId`]; operands
//! are `{builder, operand index}` pairs so that an operand can never be mistaken
//! for one created by a different builder.
//!
//! ```text
//! GraphBuilder
//!      |
//!      +-- GraphArena
//!            |
//!            +-- nodes:    [OperatorNode]  (operator, inputs, outputs, validation state)
//!            |
//!            +-- operands: [OperandRecord] (producer, output index, descriptor)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use smallvec::SmallVec;

use crate::backend::spec::{NodeBinding, OperandDescriptor, ValueId, ValueInfo};

use super::ops::Operator;
use super::topology::{DependencyGraph, NodeId};

static BUILDER_ID_COUNTER: AtomicUsize = AtomicUsize::new(1);

/// Identifies the graph builder an operand belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BuilderId(usize);

impl BuilderId {
    pub(crate) fn next() -> Self {
        BuilderId(BUILDER_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

/// A value produced by an operator inside one graph builder.
///
/// Operands are plain identifiers; the builder that created them owns their
/// descriptors and validation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operand {
    pub(crate) builder: BuilderId,
    pub(crate) index: u32,
}

impl Operand {
    pub fn builder_id(&self) -> BuilderId {
        self.builder
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "operand#{}.{}", self.builder.0, self.index)
    }
}

/// Validation outcome of an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationState {
    Unvalidated,
    Valid,
    Error(String),
}

impl ValidationState {
    pub fn is_error(&self) -> bool {
        matches!(self, ValidationState::Error(_))
    }
}

pub(super) struct OperatorNode {
    pub(super) op: Operator,
    pub(super) inputs: SmallVec<[u32; 4]>,
    pub(super) outputs: SmallVec<[u32; 2]>,
    pub(super) state: ValidationState,
}

pub(super) struct OperandRecord {
    pub(super) producer: NodeId,
    /// `None` while the producer is unvalidated or in error.
    pub(super) desc: Option<OperandDescriptor>,
}

#[derive(Default)]
pub(super) struct GraphArena {
    nodes: Vec<OperatorNode>,
    operands: Vec<OperandRecord>,
}

impl GraphArena {
    /// Appends an unvalidated node with `output_count` fresh operands.
    ///
    /// Returns `None`, leaving the arena untouched, when the node or operand
    /// indices would no longer fit in a `u32`.
    pub(super) fn push(
        &mut self,
        op: Operator,
        inputs: SmallVec<[u32; 4]>,
        output_count: usize,
    ) -> Option<NodeId> {
        let node = NodeId(u32::try_from(self.nodes.len()).ok()?);
        let first = u32::try_from(self.operands.len()).ok()?;
        let end = first.checked_add(u32::try_from(output_count).ok()?)?;
        let outputs: SmallVec<[u32; 2]> = (first..end).collect();
        self.operands
            .extend(outputs.iter().map(|_| OperandRecord {
                producer: node,
                desc: None,
            }));
        self.nodes.push(OperatorNode {
            op,
            inputs,
            outputs,
            state: ValidationState::Unvalidated,
        });
        Some(node)
    }

    pub(super) fn node(&self, id: NodeId) -> &OperatorNode {
        &self.nodes[id.0 as usize]
    }

    pub(super) fn node_mut(&mut self, id: NodeId) -> &mut OperatorNode {
        &mut self.nodes[id.0 as usize]
    }

    pub(super) fn operand(&self, index: u32) -> Option<&OperandRecord> {
        self.operands.get(index as usize)
    }

    pub(super) fn operand_mut(&mut self, index: u32) -> &mut OperandRecord {
        &mut self.operands[index as usize]
    }

    pub(super) fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Error message of the node producing `index`, if that node is in error.
    pub(super) fn operand_error(&self, index: u32) -> Option<&str> {
        let record = self.operand(index)?;
        match &self.node(record.producer).state {
            ValidationState::Error(message) => Some(message),
            _ => None,
        }
    }

    fn value_info(&self, index: u32) -> ValueInfo {
        let desc = self
            .operand(index)
            .and_then(|record| record.desc.clone())
            .expect("value info requested for an unvalidated operand");
        ValueInfo {
            id: ValueId(index),
            desc,
        }
    }

    /// Backend-facing view of a valid node.
    pub(super) fn binding(&self, id: NodeId) -> NodeBinding {
        let node = self.node(id);
        NodeBinding {
            inputs: node.inputs.iter().map(|&i| self.value_info(i)).collect(),
            outputs: node.outputs.iter().map(|&i| self.value_info(i)).collect(),
        }
    }

    pub(super) fn output_value(&self, index: u32) -> ValueInfo {
        self.value_info(index)
    }
}

impl DependencyGraph for GraphArena {
    fn dependency_count(&self, node: NodeId) -> usize {
        self.node(node).inputs.len()
    }

    fn dependency(&self, node: NodeId, index: usize) -> NodeId {
        let operand = self.node(node).inputs[index];
        self.operands[operand as usize].producer
    }

    fn is_error(&self, node: NodeId) -> bool {
        self.node(node).state.is_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_refuses_output_counts_beyond_u32() {
        let mut arena = GraphArena::default();
        let op = Operator::Concat { axis: 0 };
        let node = arena.push(op.clone(), SmallVec::new(), 2).unwrap();
        assert_eq!(arena.node(node).outputs.as_slice(), &[0, 1]);

        assert!(arena.push(op.clone(), SmallVec::new(), usize::MAX).is_none());
        assert!(arena.push(op, SmallVec::new(), u32::MAX as usize).is_none());
        assert_eq!(arena.node_count(), 1);
        assert!(arena.operand(2).is_none());
    }
}
