use std::fmt;

use serde::{Deserialize, Serialize};

use crate::graph::ops::{BinaryOp, Pool2dKind, ReduceOp, UnaryOp};
use crate::graph::options::{
    BatchNormOptions, ClampOptions, Conv2dOptions, ConvTranspose2dOptions, GemmOptions,
    GruOptions, InputSlot, InstanceNormOptions, LeakyReluOptions, PadOptions, Pool2dOptions,
    ReduceOptions, Resample2dOptions, SliceOptions, SplitOptions, SqueezeOptions,
    TransposeOptions,
};
use crate::tensor::{NamedInputs, NamedOutputs};

/// Element types an operand may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperandType {
    Float32,
    Float16,
    Int32,
    Uint32,
    Int8,
    Uint8,
}

impl OperandType {
    /// Returns the storage size of one element in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            OperandType::Float32 | OperandType::Int32 | OperandType::Uint32 => 4,
            OperandType::Float16 => 2,
            OperandType::Int8 | OperandType::Uint8 => 1,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, OperandType::Float32 | OperandType::Float16)
    }
}

/// Element type plus dimensions of an operand.
///
/// Dimensions are signed so that `-1` can travel through reshape requests; a
/// validated operand never carries a negative dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperandDescriptor {
    pub ty: OperandType,
    pub dimensions: Vec<i32>,
}

impl OperandDescriptor {
    pub fn new(ty: OperandType, dimensions: impl Into<Vec<i32>>) -> Self {
        Self {
            ty,
            dimensions: dimensions.into(),
        }
    }

    pub fn float32(dimensions: impl Into<Vec<i32>>) -> Self {
        Self::new(OperandType::Float32, dimensions)
    }

    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }

    /// Number of elements, or `None` if a dimension is negative or the product overflows.
    pub fn element_count(&self) -> Option<usize> {
        self.dimensions.iter().try_fold(1usize, |acc, &dim| {
            usize::try_from(dim).ok().and_then(|d| acc.checked_mul(d))
        })
    }

    pub fn byte_len(&self) -> Option<usize> {
        self.element_count()
            .and_then(|count| count.checked_mul(self.ty.size_in_bytes()))
    }

    pub fn dims_usize(&self) -> Vec<usize> {
        self.dimensions.iter().map(|&d| d.max(0) as usize).collect()
    }
}

impl fmt::Display for OperandDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}{:?}", self.ty, self.dimensions)
    }
}

/// Identifies a value flowing between backend nodes. Unique within one compiled graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueInfo {
    pub id: ValueId,
    pub desc: OperandDescriptor,
}

/// Values consumed and produced by one operator, in operator order.
///
/// Option fields typed as [`InputSlot`] index into `inputs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeBinding {
    pub inputs: Vec<ValueInfo>,
    pub outputs: Vec<ValueInfo>,
}

impl NodeBinding {
    pub fn input(&self, slot: InputSlot) -> BackendResult<&ValueInfo> {
        self.inputs.get(slot).ok_or_else(|| {
            BackendError::compile(format!(
                "input slot {slot} out of range ({} inputs)",
                self.inputs.len()
            ))
        })
    }

    pub fn output(&self, index: usize) -> BackendResult<&ValueInfo> {
        self.outputs.get(index).ok_or_else(|| {
            BackendError::compile(format!(
                "output {index} out of range ({} outputs)",
                self.outputs.len()
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendError {
    Unimplemented { op: &'static str, reason: String },
    Compile { message: String },
    Execution { message: String },
    Unavailable { backend: String },
}

impl BackendError {
    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn compile(message: impl Into<String>) -> Self {
        BackendError::Compile {
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }

    pub fn unavailable(backend: impl Into<String>) -> Self {
        BackendError::Unavailable {
            backend: backend.into(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Unimplemented { op, reason } => {
                write!(f, "{op} is not implemented: {reason}")
            }
            BackendError::Compile { message } => write!(f, "backend compile failure: {message}"),
            BackendError::Execution { message } => {
                write!(f, "backend execution failure: {message}")
            }
            BackendError::Unavailable { backend } => {
                write!(f, "backend `{backend}` is not registered")
            }
        }
    }
}

impl std::error::Error for BackendError {}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

/// Entry point a context uses to obtain fresh graph compilers.
pub trait Backend: Send + Sync {
    /// Returns a human-readable backend identifier (e.g., `"cpu"`).
    fn backend_name(&self) -> &str;

    /// Starts a new, empty backend graph.
    fn create_graph(&self) -> BackendResult<Box<dyn GraphCompiler>>;
}

macro_rules! unimplemented_op {
    ($name:literal) => {
        Err(BackendError::unimplemented(
            $name,
            "operator not supported by this backend",
        ))
    };
}

/// Receives validated operators in dependency order.
///
/// Every `add_*` hook defaults to [`BackendError::Unimplemented`], so a backend
/// only overrides what it supports. A graph builder calls the hooks for each
/// reachable operator, then `add_output` per named output, then `finish`, and
/// finally `compile`.
pub trait GraphCompiler {
    fn add_input(&mut self, node: &NodeBinding, name: &str) -> BackendResult<()> {
        let _ = (node, name);
        unimplemented_op!("input")
    }

    /// `data` holds exactly `byte_len()` bytes of the output descriptor.
    fn add_constant(&mut self, node: &NodeBinding, data: &[u8]) -> BackendResult<()> {
        let _ = (node, data);
        unimplemented_op!("constant")
    }

    fn add_binary(&mut self, node: &NodeBinding, op: BinaryOp) -> BackendResult<()> {
        let _ = (node, op);
        unimplemented_op!("binary")
    }

    fn add_unary(&mut self, node: &NodeBinding, op: UnaryOp) -> BackendResult<()> {
        let _ = (node, op);
        unimplemented_op!("unary")
    }

    fn add_leaky_relu(
        &mut self,
        node: &NodeBinding,
        options: &LeakyReluOptions,
    ) -> BackendResult<()> {
        let _ = (node, options);
        unimplemented_op!("leakyRelu")
    }

    fn add_clamp(&mut self, node: &NodeBinding, options: &ClampOptions) -> BackendResult<()> {
        let _ = (node, options);
        unimplemented_op!("clamp")
    }

    fn add_conv2d(
        &mut self,
        node: &NodeBinding,
        options: &Conv2dOptions<InputSlot>,
    ) -> BackendResult<()> {
        let _ = (node, options);
        unimplemented_op!("conv2d")
    }

    fn add_conv_transpose2d(
        &mut self,
        node: &NodeBinding,
        options: &ConvTranspose2dOptions<InputSlot>,
    ) -> BackendResult<()> {
        let _ = (node, options);
        unimplemented_op!("convTranspose2d")
    }

    fn add_pool2d(
        &mut self,
        node: &NodeBinding,
        kind: Pool2dKind,
        options: &Pool2dOptions,
    ) -> BackendResult<()> {
        let _ = (node, kind, options);
        unimplemented_op!("pool2d")
    }

    fn add_batch_norm(
        &mut self,
        node: &NodeBinding,
        options: &BatchNormOptions<InputSlot>,
    ) -> BackendResult<()> {
        let _ = (node, options);
        unimplemented_op!("batchNorm")
    }

    fn add_instance_norm(
        &mut self,
        node: &NodeBinding,
        options: &InstanceNormOptions<InputSlot>,
    ) -> BackendResult<()> {
        let _ = (node, options);
        unimplemented_op!("instanceNorm")
    }

    fn add_gemm(&mut self, node: &NodeBinding, options: &GemmOptions<InputSlot>) -> BackendResult<()> {
        let _ = (node, options);
        unimplemented_op!("gemm")
    }

    fn add_gru(
        &mut self,
        node: &NodeBinding,
        steps: u32,
        hidden_size: u32,
        options: &GruOptions<InputSlot>,
    ) -> BackendResult<()> {
        let _ = (node, steps, hidden_size, options);
        unimplemented_op!("gru")
    }

    fn add_pad(&mut self, node: &NodeBinding, padding: &[u32], options: &PadOptions) -> BackendResult<()> {
        let _ = (node, padding, options);
        unimplemented_op!("pad")
    }

    fn add_reduce(
        &mut self,
        node: &NodeBinding,
        op: ReduceOp,
        options: &ReduceOptions,
    ) -> BackendResult<()> {
        let _ = (node, op, options);
        unimplemented_op!("reduce")
    }

    fn add_resample2d(
        &mut self,
        node: &NodeBinding,
        options: &Resample2dOptions,
    ) -> BackendResult<()> {
        let _ = (node, options);
        unimplemented_op!("resample2d")
    }

    /// `new_shape` is the fully inferred output shape.
    fn add_reshape(&mut self, node: &NodeBinding, new_shape: &[i32]) -> BackendResult<()> {
        let _ = (node, new_shape);
        unimplemented_op!("reshape")
    }

    fn add_slice(
        &mut self,
        node: &NodeBinding,
        starts: &[i32],
        sizes: &[i32],
        options: &SliceOptions,
    ) -> BackendResult<()> {
        let _ = (node, starts, sizes, options);
        unimplemented_op!("slice")
    }

    fn add_split(
        &mut self,
        node: &NodeBinding,
        splits: &[u32],
        options: &SplitOptions,
    ) -> BackendResult<()> {
        let _ = (node, splits, options);
        unimplemented_op!("split")
    }

    fn add_squeeze(&mut self, node: &NodeBinding, options: &SqueezeOptions) -> BackendResult<()> {
        let _ = (node, options);
        unimplemented_op!("squeeze")
    }

    fn add_transpose(
        &mut self,
        node: &NodeBinding,
        options: &TransposeOptions,
    ) -> BackendResult<()> {
        let _ = (node, options);
        unimplemented_op!("transpose")
    }

    fn add_concat(&mut self, node: &NodeBinding, axis: u32) -> BackendResult<()> {
        let _ = (node, axis);
        unimplemented_op!("concat")
    }

    /// Marks `value` as a graph result exposed under `name`.
    fn add_output(&mut self, name: &str, value: &ValueInfo) -> BackendResult<()>;

    /// Called once after all operators and outputs have been added.
    fn finish(&mut self) -> BackendResult<()> {
        Ok(())
    }

    fn compile(self: Box<Self>) -> BackendResult<Box<dyn CompiledGraph>>;
}

/// An executable graph produced by [`GraphCompiler::compile`].
pub trait CompiledGraph: Send {
    /// Runs the graph. Inputs have already been checked against the graph's
    /// input descriptors by the caller.
    fn compute(&self, inputs: &NamedInputs) -> BackendResult<NamedOutputs>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_counts_elements_and_bytes() {
        let desc = OperandDescriptor::new(OperandType::Float16, vec![2, 3, 4]);
        assert_eq!(desc.rank(), 3);
        assert_eq!(desc.element_count(), Some(24));
        assert_eq!(desc.byte_len(), Some(48));
        assert_eq!(OperandDescriptor::float32(vec![2, -1]).element_count(), None);
    }

    #[test]
    fn backend_error_messages_name_the_operator() {
        let err = BackendError::unimplemented("gru", "float16 only");
        assert_eq!(err.to_string(), "gru is not implemented: float16 only");
    }
}
