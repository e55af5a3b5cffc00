//! The closed set of operators a graph may contain.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::spec::{BackendResult, GraphCompiler, NodeBinding, OperandDescriptor};

use super::options::{
    split_output_count, BatchNormOptions, ClampOptions, Conv2dOptions, ConvTranspose2dOptions,
    GemmOptions, GruOptions, InputSlot, InstanceNormOptions, LeakyReluOptions, PadOptions,
    Pool2dOptions, ReduceOptions, Resample2dOptions, SliceOptions, SplitOptions, SqueezeOptions,
    TransposeOptions,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
    Pow,
    MatMul,
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Max => "max",
            BinaryOp::Min => "min",
            BinaryOp::Pow => "pow",
            BinaryOp::MatMul => "matmul",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Abs,
    Ceil,
    Cos,
    Exp,
    Floor,
    HardSwish,
    Log,
    Neg,
    Relu,
    Sigmoid,
    Sin,
    Softmax,
    Tan,
    Tanh,
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Abs => "abs",
            UnaryOp::Ceil => "ceil",
            UnaryOp::Cos => "cos",
            UnaryOp::Exp => "exp",
            UnaryOp::Floor => "floor",
            UnaryOp::HardSwish => "hardSwish",
            UnaryOp::Log => "log",
            UnaryOp::Neg => "neg",
            UnaryOp::Relu => "relu",
            UnaryOp::Sigmoid => "sigmoid",
            UnaryOp::Sin => "sin",
            UnaryOp::Softmax => "softmax",
            UnaryOp::Tan => "tan",
            UnaryOp::Tanh => "tanh",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Pool2dKind {
    Average,
    L2,
    Max,
}

impl Pool2dKind {
    pub fn name(self) -> &'static str {
        match self {
            Pool2dKind::Average => "averagePool2d",
            Pool2dKind::L2 => "l2Pool2d",
            Pool2dKind::Max => "maxPool2d",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceOp {
    ArgMax,
    ArgMin,
    L1,
    L2,
    Max,
    Mean,
    Min,
    Product,
    Sum,
}

impl ReduceOp {
    pub fn name(self) -> &'static str {
        match self {
            ReduceOp::ArgMax => "reduceArgMax",
            ReduceOp::ArgMin => "reduceArgMin",
            ReduceOp::L1 => "reduceL1",
            ReduceOp::L2 => "reduceL2",
            ReduceOp::Max => "reduceMax",
            ReduceOp::Mean => "reduceMean",
            ReduceOp::Min => "reduceMin",
            ReduceOp::Product => "reduceProduct",
            ReduceOp::Sum => "reduceSum",
        }
    }

    pub fn is_arg(self) -> bool {
        matches!(self, ReduceOp::ArgMax | ReduceOp::ArgMin)
    }
}

/// Operator family, without attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorKind {
    Input,
    Constant,
    Binary,
    Unary,
    LeakyRelu,
    Clamp,
    Conv2d,
    ConvTranspose2d,
    Pool2d,
    BatchNorm,
    InstanceNorm,
    Gemm,
    Gru,
    Pad,
    Reduce,
    Resample2d,
    Reshape,
    Slice,
    Split,
    Squeeze,
    Transpose,
    Concat,
}

impl OperatorKind {
    pub fn name(self) -> &'static str {
        match self {
            OperatorKind::Input => "input",
            OperatorKind::Constant => "constant",
            OperatorKind::Binary => "binary",
            OperatorKind::Unary => "unary",
            OperatorKind::LeakyRelu => "leakyRelu",
            OperatorKind::Clamp => "clamp",
            OperatorKind::Conv2d => "conv2d",
            OperatorKind::ConvTranspose2d => "convTranspose2d",
            OperatorKind::Pool2d => "pool2d",
            OperatorKind::BatchNorm => "batchNorm",
            OperatorKind::InstanceNorm => "instanceNorm",
            OperatorKind::Gemm => "gemm",
            OperatorKind::Gru => "gru",
            OperatorKind::Pad => "pad",
            OperatorKind::Reduce => "reduce",
            OperatorKind::Resample2d => "resample2d",
            OperatorKind::Reshape => "reshape",
            OperatorKind::Slice => "slice",
            OperatorKind::Split => "split",
            OperatorKind::Squeeze => "squeeze",
            OperatorKind::Transpose => "transpose",
            OperatorKind::Concat => "concat",
        }
    }
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An operator together with its attributes.
///
/// Operand-valued options are stored as [`InputSlot`]s into the owning node's inputs.
#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    Input {
        name: String,
        desc: OperandDescriptor,
    },
    Constant {
        desc: OperandDescriptor,
        data: Arc<[u8]>,
    },
    Binary(BinaryOp),
    Unary(UnaryOp),
    LeakyRelu(LeakyReluOptions),
    Clamp(ClampOptions),
    Conv2d(Conv2dOptions<InputSlot>),
    ConvTranspose2d(ConvTranspose2dOptions<InputSlot>),
    Pool2d(Pool2dKind, Pool2dOptions),
    BatchNorm(BatchNormOptions<InputSlot>),
    InstanceNorm(InstanceNormOptions<InputSlot>),
    Gemm(GemmOptions<InputSlot>),
    Gru {
        steps: u32,
        hidden_size: u32,
        options: GruOptions<InputSlot>,
    },
    Pad {
        padding: Vec<u32>,
        options: PadOptions,
    },
    Reduce(ReduceOp, ReduceOptions),
    Resample2d(Resample2dOptions),
    Reshape {
        new_shape: Vec<i32>,
    },
    Slice {
        starts: Vec<i32>,
        sizes: Vec<i32>,
        options: SliceOptions,
    },
    Split {
        splits: Vec<u32>,
        options: SplitOptions,
    },
    Squeeze(SqueezeOptions),
    Transpose(TransposeOptions),
    Concat {
        axis: u32,
    },
}

impl Operator {
    pub fn kind(&self) -> OperatorKind {
        match self {
            Operator::Input { .. } => OperatorKind::Input,
            Operator::Constant { .. } => OperatorKind::Constant,
            Operator::Binary(_) => OperatorKind::Binary,
            Operator::Unary(_) => OperatorKind::Unary,
            Operator::LeakyRelu(_) => OperatorKind::LeakyRelu,
            Operator::Clamp(_) => OperatorKind::Clamp,
            Operator::Conv2d(_) => OperatorKind::Conv2d,
            Operator::ConvTranspose2d(_) => OperatorKind::ConvTranspose2d,
            Operator::Pool2d(..) => OperatorKind::Pool2d,
            Operator::BatchNorm(_) => OperatorKind::BatchNorm,
            Operator::InstanceNorm(_) => OperatorKind::InstanceNorm,
            Operator::Gemm(_) => OperatorKind::Gemm,
            Operator::Gru { .. } => OperatorKind::Gru,
            Operator::Pad { .. } => OperatorKind::Pad,
            Operator::Reduce(..) => OperatorKind::Reduce,
            Operator::Resample2d(_) => OperatorKind::Resample2d,
            Operator::Reshape { .. } => OperatorKind::Reshape,
            Operator::Slice { .. } => OperatorKind::Slice,
            Operator::Split { .. } => OperatorKind::Split,
            Operator::Squeeze(_) => OperatorKind::Squeeze,
            Operator::Transpose(_) => OperatorKind::Transpose,
            Operator::Concat { .. } => OperatorKind::Concat,
        }
    }

    /// Number of results the call declares, known before validation.
    pub fn output_count(&self) -> usize {
        match self {
            Operator::Split { splits, .. } => split_output_count(splits),
            Operator::Gru { options, .. } => options.output_count(),
            _ => 1,
        }
    }

    /// The most specific name for this operator (e.g. `"add"` rather than `"binary"`).
    pub fn name(&self) -> &'static str {
        match self {
            Operator::Binary(op) => op.name(),
            Operator::Unary(op) => op.name(),
            Operator::Pool2d(kind, _) => kind.name(),
            Operator::Reduce(op, _) => op.name(),
            other => other.kind().name(),
        }
    }

    /// Hands this operator to a backend graph.
    pub(crate) fn add_to_graph(
        &self,
        graph: &mut dyn GraphCompiler,
        node: &NodeBinding,
    ) -> BackendResult<()> {
        match self {
            Operator::Input { name, .. } => graph.add_input(node, name),
            Operator::Constant { data, .. } => graph.add_constant(node, data),
            Operator::Binary(op) => graph.add_binary(node, *op),
            Operator::Unary(op) => graph.add_unary(node, *op),
            Operator::LeakyRelu(options) => graph.add_leaky_relu(node, options),
            Operator::Clamp(options) => graph.add_clamp(node, options),
            Operator::Conv2d(options) => graph.add_conv2d(node, options),
            Operator::ConvTranspose2d(options) => graph.add_conv_transpose2d(node, options),
            Operator::Pool2d(kind, options) => graph.add_pool2d(node, *kind, options),
            Operator::BatchNorm(options) => graph.add_batch_norm(node, options),
            Operator::InstanceNorm(options) => graph.add_instance_norm(node, options),
            Operator::Gemm(options) => graph.add_gemm(node, options),
            Operator::Gru {
                steps,
                hidden_size,
                options,
            } => graph.add_gru(node, *steps, *hidden_size, options),
            Operator::Pad { padding, options } => graph.add_pad(node, padding, options),
            Operator::Reduce(op, options) => graph.add_reduce(node, *op, options),
            Operator::Resample2d(options) => graph.add_resample2d(node, options),
            Operator::Reshape { new_shape } => graph.add_reshape(node, new_shape),
            Operator::Slice {
                starts,
                sizes,
                options,
            } => graph.add_slice(node, starts, sizes, options),
            Operator::Split { splits, options } => graph.add_split(node, splits, options),
            Operator::Squeeze(options) => graph.add_squeeze(node, options),
            Operator::Transpose(options) => graph.add_transpose(node, options),
            Operator::Concat { axis } => graph.add_concat(node, *axis),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_prefer_the_specific_operation() {
        assert_eq!(Operator::Binary(BinaryOp::MatMul).name(), "matmul");
        assert_eq!(
            Operator::Pool2d(Pool2dKind::Max, Pool2dOptions::default()).name(),
            "maxPool2d"
        );
        assert_eq!(
            Operator::Reshape { new_shape: vec![-1] }.name(),
            "reshape"
        );
        assert_eq!(Operator::Concat { axis: 0 }.kind(), OperatorKind::Concat);
    }
}
