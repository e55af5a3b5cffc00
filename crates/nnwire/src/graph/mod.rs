//! Graph construction: operands, operators, validation, and compilation.

mod arena;
mod builder;
pub mod ops;
pub mod options;
pub mod topology;
mod validate;

use smallvec::SmallVec;

use crate::backend::spec::{CompiledGraph, OperandDescriptor, ValueInfo};
use crate::context::Context;
use crate::error::ComputeError;
use crate::tensor::{NamedInputs, NamedOutputs};

pub use arena::{BuilderId, Operand, ValidationState};
pub use builder::GraphBuilder;
pub use ops::{BinaryOp, Operator, OperatorKind, Pool2dKind, ReduceOp, UnaryOp};

/// Ordered results of a multi-output operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperandArray {
    operands: SmallVec<[Operand; 2]>,
}

impl OperandArray {
    pub(crate) fn new(operands: SmallVec<[Operand; 2]>) -> Self {
        Self { operands }
    }

    pub fn len(&self) -> usize {
        self.operands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operands.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Operand> {
        self.operands.get(index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = Operand> + '_ {
        self.operands.iter().copied()
    }
}

/// Named graph outputs passed to [`GraphBuilder::build`].
///
/// Names are unique; setting an existing name replaces its operand. Iteration
/// follows insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamedOperands {
    records: Vec<(String, Operand)>,
}

impl NamedOperands {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, operand: Operand) {
        let name = name.into();
        match self.records.iter_mut().find(|(existing, _)| *existing == name) {
            Some(record) => record.1 = operand,
            None => self.records.push((name, operand)),
        }
    }

    pub fn get(&self, name: &str) -> Option<Operand> {
        self.records
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, operand)| *operand)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Operand)> {
        self.records.iter().map(|(name, operand)| (name.as_str(), *operand))
    }
}

/// A compiled, executable graph.
pub struct Graph {
    context: Context,
    compiled: Box<dyn CompiledGraph>,
    inputs: Vec<(String, OperandDescriptor)>,
    outputs: Vec<(String, ValueInfo)>,
}

impl Graph {
    pub(crate) fn new(
        context: Context,
        compiled: Box<dyn CompiledGraph>,
        inputs: Vec<(String, OperandDescriptor)>,
        outputs: Vec<(String, ValueInfo)>,
    ) -> Self {
        Self {
            context,
            compiled,
            inputs,
            outputs,
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Named inputs the graph reads, in dependency order.
    pub fn inputs(&self) -> impl Iterator<Item = (&str, &OperandDescriptor)> {
        self.inputs.iter().map(|(name, desc)| (name.as_str(), desc))
    }

    pub fn outputs(&self) -> impl Iterator<Item = (&str, &OperandDescriptor)> {
        self.outputs.iter().map(|(name, value)| (name.as_str(), &value.desc))
    }

    /// Runs the graph after checking every declared input is bound with a
    /// matching descriptor and byte length.
    #[tracing::instrument(skip_all, fields(backend = %self.context.backend_name()))]
    pub fn compute(&self, inputs: &NamedInputs) -> Result<NamedOutputs, ComputeError> {
        let result = self.check_inputs(inputs).and_then(|()| {
            self.compiled.compute(inputs).map_err(ComputeError::from)
        });
        if let Err(err) = &result {
            self.context.report_error(err.error_type(), err.to_string());
        }
        result
    }

    fn check_inputs(&self, inputs: &NamedInputs) -> Result<(), ComputeError> {
        for (name, desc) in &self.inputs {
            let Some(tensor) = inputs.get(name) else {
                return Err(ComputeError::MissingInput(name.clone()));
            };
            if tensor.desc != *desc || !tensor.is_consistent() {
                return Err(ComputeError::InputMismatch {
                    name: name.clone(),
                    expected: format!("{desc} ({} bytes)", desc.byte_len().unwrap_or(0)),
                    found: format!("{} ({} bytes)", tensor.desc, tensor.data.len()),
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("context", &self.context)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}
