use std::collections::HashMap;
use std::sync::Arc;

use nnwire::backend::spec::{
    Backend, BackendError, BackendResult, CompiledGraph, GraphCompiler, NodeBinding,
    OperandDescriptor, OperandType, ValueId, ValueInfo,
};
use nnwire::graph::ops::{BinaryOp, Pool2dKind, ReduceOp, UnaryOp};
use nnwire::graph::options::{
    BatchNormOptions, ClampOptions, Conv2dOptions, FilterOperandLayout, FusedActivation,
    GemmOptions, InputOperandLayout, InputSlot, InstanceNormOptions, LeakyReluOptions,
    PadOptions, PaddingMode, Pool2dOptions, ReduceOptions, SliceOptions, SplitOptions,
    SqueezeOptions, TransposeOptions,
};
use nnwire::tensor::{NamedInputs, NamedOutputs, Tensor};

#[derive(Debug, Clone, PartialEq)]
pub struct CpuTensor {
    pub dims: Vec<usize>,
    pub data: TensorData,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Arc<[f32]>),
    I32(Arc<[i32]>),
}

impl CpuTensor {
    pub fn f32(dims: Vec<usize>, values: Vec<f32>) -> Self {
        Self {
            dims,
            data: TensorData::F32(Arc::from(values)),
        }
    }

    pub fn i32(dims: Vec<usize>, values: Vec<i32>) -> Self {
        Self {
            dims,
            data: TensorData::I32(Arc::from(values)),
        }
    }

    fn from_bytes(desc: &OperandDescriptor, bytes: &[u8]) -> BackendResult<Self> {
        let dims = desc.dims_usize();
        let expected = desc.byte_len().ok_or_else(|| {
            BackendError::execution(format!("tensor {desc} has no element count"))
        })?;
        if bytes.len() != expected {
            return Err(BackendError::execution(format!(
                "tensor {desc} needs {expected} bytes, got {}",
                bytes.len()
            )));
        }
        match desc.ty {
            OperandType::Float32 => Ok(Self::f32(dims, bytemuck::pod_collect_to_vec(bytes))),
            OperandType::Int32 => Ok(Self::i32(dims, bytemuck::pod_collect_to_vec(bytes))),
            other => Err(BackendError::execution(format!(
                "cpu backend cannot hold {other:?} tensors"
            ))),
        }
    }

    fn to_tensor(&self, desc: &OperandDescriptor) -> Tensor {
        let bytes = match &self.data {
            TensorData::F32(values) => bytemuck::cast_slice(values.as_ref()).to_vec(),
            TensorData::I32(values) => bytemuck::cast_slice(values.as_ref()).to_vec(),
        };
        Tensor::new(desc.clone(), bytes)
    }

    fn values_f32(&self) -> BackendResult<&[f32]> {
        match &self.data {
            TensorData::F32(values) => Ok(values.as_ref()),
            TensorData::I32(_) => Err(BackendError::execution("expected a float32 tensor")),
        }
    }
}

/// Reference backend that interprets validated graphs on the host in `f32`.
#[derive(Debug, Clone, Default)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for CpuBackend {
    fn backend_name(&self) -> &str {
        "cpu"
    }

    fn create_graph(&self) -> BackendResult<Box<dyn GraphCompiler>> {
        Ok(Box::new(CpuGraphCompiler::default()))
    }
}

#[derive(Debug, Clone)]
enum Kernel {
    Binary(BinaryOp),
    Unary(UnaryOp),
    LeakyRelu(f32),
    Clamp { min_value: f32, max_value: f32 },
    /// Reshape and squeeze keep the element order.
    Copy,
    Transpose(Vec<usize>),
    Concat(usize),
    Gemm(GemmOptions<InputSlot>),
    Slice { starts: Vec<usize>, axes: Vec<usize> },
    Split(usize),
    Pad { padding: Vec<usize>, options: PadOptions },
    Reduce { op: ReduceOp, axes: Vec<usize> },
    Conv2d(Conv2dOptions<InputSlot>),
    Pool2d(Pool2dKind, Pool2dOptions),
    BatchNorm(BatchNormOptions<InputSlot>),
    InstanceNorm(InstanceNormOptions<InputSlot>),
}

#[derive(Debug, Clone)]
enum Step {
    Input {
        name: String,
        output: ValueInfo,
    },
    Constant {
        output: ValueId,
        tensor: CpuTensor,
    },
    Kernel {
        label: &'static str,
        inputs: Vec<ValueId>,
        outputs: Vec<ValueInfo>,
        kernel: Kernel,
    },
}

#[derive(Debug, Default)]
pub struct CpuGraphCompiler {
    steps: Vec<Step>,
    outputs: Vec<(String, ValueInfo)>,
}

impl CpuGraphCompiler {
    fn push_kernel(&mut self, label: &'static str, node: &NodeBinding, kernel: Kernel) {
        self.steps.push(Step::Kernel {
            label,
            inputs: node.inputs.iter().map(|value| value.id).collect(),
            outputs: node.outputs.clone(),
            kernel,
        });
    }

    /// Pushes a kernel that reads and writes float32 only.
    fn push_float_kernel(
        &mut self,
        label: &'static str,
        node: &NodeBinding,
        kernel: Kernel,
    ) -> BackendResult<()> {
        require_types(label, node, &[OperandType::Float32])?;
        self.push_kernel(label, node, kernel);
        Ok(())
    }

    /// Pushes a kernel that only moves elements around.
    fn push_layout_kernel(
        &mut self,
        label: &'static str,
        node: &NodeBinding,
        kernel: Kernel,
    ) -> BackendResult<()> {
        require_types(label, node, &[OperandType::Float32, OperandType::Int32])?;
        self.push_kernel(label, node, kernel);
        Ok(())
    }
}

fn require_types(
    label: &'static str,
    node: &NodeBinding,
    supported: &[OperandType],
) -> BackendResult<()> {
    match node
        .inputs
        .iter()
        .find(|value| !supported.contains(&value.desc.ty))
    {
        Some(value) => Err(BackendError::unimplemented(
            label,
            format!("cpu backend does not compute {:?} operands", value.desc.ty),
        )),
        None => Ok(()),
    }
}

fn to_axes(values: &Option<Vec<i32>>, label: &'static str) -> BackendResult<Vec<usize>> {
    values
        .as_ref()
        .map(|axes| axes.iter().map(|&axis| axis as usize).collect())
        .ok_or_else(|| BackendError::compile(format!("{label} axes were not resolved")))
}

impl GraphCompiler for CpuGraphCompiler {
    fn add_input(&mut self, node: &NodeBinding, name: &str) -> BackendResult<()> {
        let output = node.output(0)?;
        if !matches!(output.desc.ty, OperandType::Float32 | OperandType::Int32) {
            return Err(BackendError::unimplemented(
                "input",
                format!("cpu backend does not accept {:?} inputs", output.desc.ty),
            ));
        }
        self.steps.push(Step::Input {
            name: name.to_string(),
            output: output.clone(),
        });
        Ok(())
    }

    fn add_constant(&mut self, node: &NodeBinding, data: &[u8]) -> BackendResult<()> {
        let output = node.output(0)?;
        if !matches!(output.desc.ty, OperandType::Float32 | OperandType::Int32) {
            return Err(BackendError::unimplemented(
                "constant",
                format!("cpu backend does not accept {:?} constants", output.desc.ty),
            ));
        }
        let tensor = CpuTensor::from_bytes(&output.desc, data)
            .map_err(|err| BackendError::compile(err.to_string()))?;
        self.steps.push(Step::Constant {
            output: output.id,
            tensor,
        });
        Ok(())
    }

    fn add_binary(&mut self, node: &NodeBinding, op: BinaryOp) -> BackendResult<()> {
        self.push_float_kernel(op.name(), node, Kernel::Binary(op))
    }

    fn add_unary(&mut self, node: &NodeBinding, op: UnaryOp) -> BackendResult<()> {
        self.push_float_kernel(op.name(), node, Kernel::Unary(op))
    }

    fn add_leaky_relu(
        &mut self,
        node: &NodeBinding,
        options: &LeakyReluOptions,
    ) -> BackendResult<()> {
        self.push_float_kernel("leakyRelu", node, Kernel::LeakyRelu(options.alpha))
    }

    fn add_clamp(&mut self, node: &NodeBinding, options: &ClampOptions) -> BackendResult<()> {
        let kernel = Kernel::Clamp {
            min_value: options.min_value,
            max_value: options.max_value,
        };
        self.push_float_kernel("clamp", node, kernel)
    }

    fn add_conv2d(
        &mut self,
        node: &NodeBinding,
        options: &Conv2dOptions<InputSlot>,
    ) -> BackendResult<()> {
        self.push_float_kernel("conv2d", node, Kernel::Conv2d(options.clone()))
    }

    fn add_pool2d(
        &mut self,
        node: &NodeBinding,
        kind: Pool2dKind,
        options: &Pool2dOptions,
    ) -> BackendResult<()> {
        self.push_float_kernel(kind.name(), node, Kernel::Pool2d(kind, options.clone()))
    }

    fn add_batch_norm(
        &mut self,
        node: &NodeBinding,
        options: &BatchNormOptions<InputSlot>,
    ) -> BackendResult<()> {
        self.push_float_kernel("batchNorm", node, Kernel::BatchNorm(options.clone()))
    }

    fn add_instance_norm(
        &mut self,
        node: &NodeBinding,
        options: &InstanceNormOptions<InputSlot>,
    ) -> BackendResult<()> {
        self.push_float_kernel("instanceNorm", node, Kernel::InstanceNorm(options.clone()))
    }

    fn add_gemm(&mut self, node: &NodeBinding, options: &GemmOptions<InputSlot>) -> BackendResult<()> {
        self.push_float_kernel("gemm", node, Kernel::Gemm(options.clone()))
    }

    fn add_pad(&mut self, node: &NodeBinding, padding: &[u32], options: &PadOptions) -> BackendResult<()> {
        let kernel = Kernel::Pad {
            padding: padding.iter().map(|&amount| amount as usize).collect(),
            options: *options,
        };
        self.push_float_kernel("pad", node, kernel)
    }

    fn add_reduce(
        &mut self,
        node: &NodeBinding,
        op: ReduceOp,
        options: &ReduceOptions,
    ) -> BackendResult<()> {
        let axes = to_axes(&options.axes, op.name())?;
        self.push_float_kernel(op.name(), node, Kernel::Reduce { op, axes })
    }

    fn add_reshape(&mut self, node: &NodeBinding, _new_shape: &[i32]) -> BackendResult<()> {
        self.push_layout_kernel("reshape", node, Kernel::Copy)
    }

    fn add_slice(
        &mut self,
        node: &NodeBinding,
        starts: &[i32],
        _sizes: &[i32],
        options: &SliceOptions,
    ) -> BackendResult<()> {
        let kernel = Kernel::Slice {
            starts: starts.iter().map(|&start| start as usize).collect(),
            axes: to_axes(&options.axes, "slice")?,
        };
        self.push_layout_kernel("slice", node, kernel)
    }

    fn add_split(
        &mut self,
        node: &NodeBinding,
        _splits: &[u32],
        options: &SplitOptions,
    ) -> BackendResult<()> {
        self.push_layout_kernel("split", node, Kernel::Split(options.axis as usize))
    }

    fn add_squeeze(&mut self, node: &NodeBinding, _options: &SqueezeOptions) -> BackendResult<()> {
        self.push_layout_kernel("squeeze", node, Kernel::Copy)
    }

    fn add_transpose(
        &mut self,
        node: &NodeBinding,
        options: &TransposeOptions,
    ) -> BackendResult<()> {
        let permutation = options
            .permutation
            .as_ref()
            .map(|perm| perm.iter().map(|&axis| axis as usize).collect())
            .ok_or_else(|| BackendError::compile("transpose permutation was not resolved"))?;
        self.push_layout_kernel("transpose", node, Kernel::Transpose(permutation))
    }

    fn add_concat(&mut self, node: &NodeBinding, axis: u32) -> BackendResult<()> {
        self.push_layout_kernel("concat", node, Kernel::Concat(axis as usize))
    }

    fn add_output(&mut self, name: &str, value: &ValueInfo) -> BackendResult<()> {
        self.outputs.push((name.to_string(), value.clone()));
        Ok(())
    }

    fn compile(self: Box<Self>) -> BackendResult<Box<dyn CompiledGraph>> {
        let this = *self;
        tracing::debug!(
            steps = this.steps.len(),
            outputs = this.outputs.len(),
            "compiled cpu program"
        );
        Ok(Box::new(CpuProgram {
            steps: this.steps,
            outputs: this.outputs,
        }))
    }
}

/// A compiled graph: steps in dependency order plus the named results.
#[derive(Debug)]
pub struct CpuProgram {
    steps: Vec<Step>,
    outputs: Vec<(String, ValueInfo)>,
}

impl CompiledGraph for CpuProgram {
    fn compute(&self, inputs: &NamedInputs) -> BackendResult<NamedOutputs> {
        let mut values: HashMap<ValueId, CpuTensor> = HashMap::new();
        for step in &self.steps {
            match step {
                Step::Input { name, output } => {
                    let tensor = inputs.get(name).ok_or_else(|| {
                        BackendError::execution(format!("input `{name}` was not provided"))
                    })?;
                    values.insert(output.id, CpuTensor::from_bytes(&output.desc, &tensor.data)?);
                }
                Step::Constant { output, tensor } => {
                    values.insert(*output, tensor.clone());
                }
                Step::Kernel {
                    label,
                    inputs: arg_ids,
                    outputs,
                    kernel,
                } => {
                    let _span = tracing::trace_span!("cpu_kernel", op = *label).entered();
                    let mut args = Vec::with_capacity(arg_ids.len());
                    for id in arg_ids {
                        let tensor = values.get(id).cloned().ok_or_else(|| {
                            BackendError::execution(format!("{label}: operand value {id} missing"))
                        })?;
                        args.push(tensor);
                    }
                    let results = execute_kernel(kernel, &args, outputs)
                        .map_err(|err| augment_backend_error(err, label))?;
                    if results.len() != outputs.len() {
                        return Err(BackendError::execution(format!(
                            "{label} produced {} results for {} outputs",
                            results.len(),
                            outputs.len()
                        )));
                    }
                    for (info, tensor) in outputs.iter().zip(results) {
                        values.insert(info.id, tensor);
                    }
                }
            }
        }

        let mut results = NamedOutputs::new();
        for (name, info) in &self.outputs {
            let tensor = values.get(&info.id).ok_or_else(|| {
                BackendError::execution(format!("output `{name}` was never computed"))
            })?;
            results.insert(name.clone(), tensor.to_tensor(&info.desc));
        }
        Ok(results)
    }
}

fn augment_backend_error(err: BackendError, label: &str) -> BackendError {
    match err {
        BackendError::Execution { message } => {
            BackendError::execution(format!("{label}: {message}"))
        }
        other => other,
    }
}

fn execute_kernel(
    kernel: &Kernel,
    inputs: &[CpuTensor],
    outputs: &[ValueInfo],
) -> BackendResult<Vec<CpuTensor>> {
    let output_dims = |index: usize| -> BackendResult<Vec<usize>> {
        outputs
            .get(index)
            .map(|info| info.desc.dims_usize())
            .ok_or_else(|| BackendError::execution("missing output descriptor"))
    };
    let result = match kernel {
        Kernel::Binary(BinaryOp::MatMul) => op_matmul(inputs, output_dims(0)?)?,
        Kernel::Binary(op) => op_elementwise_binary(inputs, output_dims(0)?, *op)?,
        Kernel::Unary(op) => op_elementwise_unary(inputs, *op)?,
        Kernel::LeakyRelu(alpha) => {
            let activation = FusedActivation::LeakyRelu { alpha: *alpha };
            map_f32(expect_single(inputs)?, |x| activation.apply(x))?
        }
        Kernel::Clamp {
            min_value,
            max_value,
        } => map_f32(expect_single(inputs)?, |x| x.clamp(*min_value, *max_value))?,
        Kernel::Copy => {
            let input = expect_single(inputs)?;
            CpuTensor {
                dims: output_dims(0)?,
                data: input.data.clone(),
            }
        }
        Kernel::Transpose(perm) => op_transpose(inputs, perm)?,
        Kernel::Concat(axis) => op_concat(inputs, output_dims(0)?, *axis)?,
        Kernel::Gemm(options) => op_gemm(inputs, output_dims(0)?, options)?,
        Kernel::Slice { starts, axes } => op_slice(inputs, output_dims(0)?, starts, axes)?,
        Kernel::Split(axis) => {
            let dims = (0..outputs.len())
                .map(output_dims)
                .collect::<BackendResult<Vec<_>>>()?;
            return op_split(inputs, &dims, *axis);
        }
        Kernel::Pad { padding, options } => op_pad(inputs, output_dims(0)?, padding, options)?,
        Kernel::Reduce { op, axes } => op_reduce(inputs, output_dims(0)?, *op, axes)?,
        Kernel::Conv2d(options) => op_conv2d(inputs, output_dims(0)?, options)?,
        Kernel::Pool2d(kind, options) => op_pool2d(inputs, output_dims(0)?, *kind, options)?,
        Kernel::BatchNorm(options) => op_batch_norm(inputs, options)?,
        Kernel::InstanceNorm(options) => op_instance_norm(inputs, options)?,
    };
    Ok(vec![result])
}

fn map_f32(input: &CpuTensor, f: impl Fn(f32) -> f32) -> BackendResult<CpuTensor> {
    let values = input.values_f32()?;
    Ok(CpuTensor::f32(
        input.dims.clone(),
        values.iter().map(|&x| f(x)).collect(),
    ))
}

fn op_elementwise_binary(
    inputs: &[CpuTensor],
    out_dims: Vec<usize>,
    op: BinaryOp,
) -> BackendResult<CpuTensor> {
    if inputs.len() != 2 {
        return Err(BackendError::execution(
            "elementwise binary expects 2 inputs",
        ));
    }
    let (lhs, rhs) = (&inputs[0], &inputs[1]);
    let (a, b) = (lhs.values_f32()?, rhs.values_f32()?);
    let a_strides = broadcast_strides(&lhs.dims, &out_dims)?;
    let b_strides = broadcast_strides(&rhs.dims, &out_dims)?;
    let mut result = Vec::with_capacity(out_dims.iter().product());
    for coord in MultiIndex::new(&out_dims) {
        let x = a[dot(&coord, &a_strides)];
        let y = b[dot(&coord, &b_strides)];
        let value = match op {
            BinaryOp::Add => x + y,
            BinaryOp::Sub => x - y,
            BinaryOp::Mul => x * y,
            BinaryOp::Div => x / y,
            BinaryOp::Max => x.max(y),
            BinaryOp::Min => x.min(y),
            BinaryOp::Pow => x.powf(y),
            BinaryOp::MatMul => unreachable!("matmul has its own kernel"),
        };
        result.push(value);
    }
    Ok(CpuTensor::f32(out_dims, result))
}

fn op_matmul(inputs: &[CpuTensor], out_dims: Vec<usize>) -> BackendResult<CpuTensor> {
    if inputs.len() != 2 {
        return Err(BackendError::execution("matmul expects 2 inputs"));
    }
    let (a, b) = (inputs[0].values_f32()?, inputs[1].values_f32()?);
    let mut lhs = inputs[0].dims.clone();
    let mut rhs = inputs[1].dims.clone();
    if lhs.len() == 1 {
        lhs.insert(0, 1);
    }
    if rhs.len() == 1 {
        rhs.push(1);
    }
    let (m, k) = (lhs[lhs.len() - 2], lhs[lhs.len() - 1]);
    let (k2, n) = (rhs[rhs.len() - 2], rhs[rhs.len() - 1]);
    if k != k2 {
        return Err(BackendError::execution(format!(
            "matmul inner dimensions differ: {k} vs {k2}"
        )));
    }
    let lhs_batch = &lhs[..lhs.len() - 2];
    let rhs_batch = &rhs[..rhs.len() - 2];
    let batch_dims = broadcast_dims(lhs_batch, rhs_batch)?;
    let lhs_strides = broadcast_strides(lhs_batch, &batch_dims)?;
    let rhs_strides = broadcast_strides(rhs_batch, &batch_dims)?;

    let mut result = vec![0.0f32; batch_dims.iter().product::<usize>() * m * n];
    for (batch, coord) in MultiIndex::new(&batch_dims).enumerate() {
        let a_base = dot(&coord, &lhs_strides) * m * k;
        let b_base = dot(&coord, &rhs_strides) * k * n;
        let out = &mut result[batch * m * n..(batch + 1) * m * n];
        for i in 0..m {
            for p in 0..k {
                let lhs_value = a[a_base + i * k + p];
                for j in 0..n {
                    out[i * n + j] += lhs_value * b[b_base + p * n + j];
                }
            }
        }
    }
    Ok(CpuTensor::f32(out_dims, result))
}

fn op_elementwise_unary(inputs: &[CpuTensor], op: UnaryOp) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let values = input.values_f32()?;

    let result: Vec<f32> = match op {
        UnaryOp::Abs => values.iter().map(|&x| x.abs()).collect(),
        UnaryOp::Ceil => values.iter().map(|&x| x.ceil()).collect(),
        UnaryOp::Cos => values.iter().map(|&x| x.cos()).collect(),
        UnaryOp::Exp => values.iter().map(|&x| x.exp()).collect(),
        UnaryOp::Floor => values.iter().map(|&x| x.floor()).collect(),
        UnaryOp::HardSwish => values
            .iter()
            .map(|&x| FusedActivation::HardSwish.apply(x))
            .collect(),
        UnaryOp::Log => values.iter().map(|&x| x.ln()).collect(),
        UnaryOp::Neg => values.iter().map(|&x| -x).collect(),
        UnaryOp::Relu => values.iter().map(|&x| x.max(0.0)).collect(),
        UnaryOp::Sigmoid => values
            .iter()
            .map(|&x| FusedActivation::Sigmoid.apply(x))
            .collect(),
        UnaryOp::Sin => values.iter().map(|&x| x.sin()).collect(),
        UnaryOp::Tan => values.iter().map(|&x| x.tan()).collect(),
        UnaryOp::Tanh => values.iter().map(|&x| x.tanh()).collect(),
        UnaryOp::Softmax => {
            let row = input.dims.last().copied().unwrap_or(1).max(1);
            let mut out = Vec::with_capacity(values.len());
            for chunk in values.chunks(row) {
                let max = chunk.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let exps: Vec<f32> = chunk.iter().map(|&x| (x - max).exp()).collect();
                let sum: f32 = exps.iter().sum();
                out.extend(exps.into_iter().map(|e| e / sum));
            }
            out
        }
    };

    Ok(CpuTensor::f32(input.dims.clone(), result))
}

/// Copies `source` elements selected by `indices` into a new tensor.
fn gather(input: &CpuTensor, dims: Vec<usize>, indices: &[usize]) -> CpuTensor {
    match &input.data {
        TensorData::F32(values) => {
            CpuTensor::f32(dims, indices.iter().map(|&i| values[i]).collect())
        }
        TensorData::I32(values) => {
            CpuTensor::i32(dims, indices.iter().map(|&i| values[i]).collect())
        }
    }
}

fn op_transpose(inputs: &[CpuTensor], perm: &[usize]) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    if perm.len() != input.dims.len() {
        return Err(BackendError::execution("transpose rank mismatch"));
    }
    let out_dims: Vec<usize> = perm.iter().map(|&axis| input.dims[axis]).collect();
    let input_strides = compute_strides(&input.dims);
    let indices: Vec<usize> = MultiIndex::new(&out_dims)
        .map(|out_coord| {
            out_coord
                .iter()
                .enumerate()
                .map(|(out_axis, &c)| c * input_strides[perm[out_axis]])
                .sum()
        })
        .collect();
    Ok(gather(input, out_dims, &indices))
}

fn op_slice(
    inputs: &[CpuTensor],
    out_dims: Vec<usize>,
    starts: &[usize],
    axes: &[usize],
) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    if out_dims.len() != input.dims.len() {
        return Err(BackendError::execution("slice rank mismatch"));
    }
    let mut offsets = vec![0usize; input.dims.len()];
    for (&axis, &start) in axes.iter().zip(starts) {
        offsets[axis] = start;
    }
    let strides = compute_strides(&input.dims);
    let indices: Vec<usize> = MultiIndex::new(&out_dims)
        .map(|coord| {
            coord
                .iter()
                .zip(&offsets)
                .zip(&strides)
                .map(|((&c, &offset), &stride)| (c + offset) * stride)
                .sum()
        })
        .collect();
    Ok(gather(input, out_dims, &indices))
}

fn op_split(
    inputs: &[CpuTensor],
    out_dims: &[Vec<usize>],
    axis: usize,
) -> BackendResult<Vec<CpuTensor>> {
    let input = expect_single(inputs)?;
    let mut starts = vec![0usize];
    let mut offset = 0usize;
    let mut results = Vec::with_capacity(out_dims.len());
    for dims in out_dims {
        let extent = dims.get(axis).copied().ok_or_else(|| {
            BackendError::execution(format!("split axis {axis} out of range"))
        })?;
        starts[0] = offset;
        results.push(op_slice(inputs, dims.clone(), &starts, &[axis])?);
        offset += extent;
    }
    if offset != input.dims[axis] {
        return Err(BackendError::execution(format!(
            "split outputs cover {offset} of {} elements along axis {axis}",
            input.dims[axis]
        )));
    }
    Ok(results)
}

fn op_concat(inputs: &[CpuTensor], out_dims: Vec<usize>, axis: usize) -> BackendResult<CpuTensor> {
    let Some(first) = inputs.first() else {
        return Err(BackendError::execution("concat expects at least one input"));
    };
    let outer: usize = out_dims[..axis].iter().product();
    let inner: usize = out_dims[axis + 1..].iter().product();
    let chunks: Vec<usize> = inputs.iter().map(|t| t.dims[axis] * inner).collect();

    fn interleave<T: Copy>(parts: &[&[T]], chunks: &[usize], outer: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(chunks.iter().sum::<usize>() * outer);
        for o in 0..outer {
            for (part, &chunk) in parts.iter().zip(chunks) {
                out.extend_from_slice(&part[o * chunk..(o + 1) * chunk]);
            }
        }
        out
    }

    match &first.data {
        TensorData::F32(_) => {
            let parts = inputs
                .iter()
                .map(CpuTensor::values_f32)
                .collect::<BackendResult<Vec<_>>>()?;
            Ok(CpuTensor::f32(out_dims, interleave(&parts, &chunks, outer)))
        }
        TensorData::I32(_) => {
            let parts = inputs
                .iter()
                .map(|t| match &t.data {
                    TensorData::I32(values) => Ok(values.as_ref()),
                    TensorData::F32(_) => Err(BackendError::execution(
                        "concat inputs mix element types",
                    )),
                })
                .collect::<BackendResult<Vec<_>>>()?;
            Ok(CpuTensor::i32(out_dims, interleave(&parts, &chunks, outer)))
        }
    }
}

fn op_gemm(
    inputs: &[CpuTensor],
    out_dims: Vec<usize>,
    options: &GemmOptions<InputSlot>,
) -> BackendResult<CpuTensor> {
    let (a, b) = (input_at(inputs, 0)?, input_at(inputs, 1)?);
    let (av, bv) = (a.values_f32()?, b.values_f32()?);
    let (m, n) = (out_dims[0], out_dims[1]);
    let k = if options.a_transpose { a.dims[0] } else { a.dims[1] };
    let a_at = |i: usize, p: usize| {
        if options.a_transpose {
            av[p * m + i]
        } else {
            av[i * k + p]
        }
    };
    let b_at = |p: usize, j: usize| {
        if options.b_transpose {
            bv[j * k + p]
        } else {
            bv[p * n + j]
        }
    };
    let c = match options.c {
        Some(slot) => {
            let c = input_at(inputs, slot)?;
            Some((c.values_f32()?, broadcast_strides(&c.dims, &out_dims)?))
        }
        None => None,
    };

    let mut result = vec![0.0f32; m * n];
    for i in 0..m {
        for j in 0..n {
            let mut acc = 0.0f32;
            for p in 0..k {
                acc += a_at(i, p) * b_at(p, j);
            }
            let mut value = options.alpha * acc;
            if let Some((cv, strides)) = &c {
                value += options.beta * cv[i * strides[0] + j * strides[1]];
            }
            result[i * n + j] = value;
        }
    }
    Ok(CpuTensor::f32(out_dims, result))
}

/// Maps an output coordinate on one padded axis back into the input.
fn pad_source(index: isize, extent: isize, mode: PaddingMode) -> Option<usize> {
    if (0..extent).contains(&index) {
        return Some(index as usize);
    }
    let mapped = match mode {
        PaddingMode::Constant => return None,
        PaddingMode::Edge => index.clamp(0, extent - 1),
        PaddingMode::Reflection if index < 0 => -index,
        PaddingMode::Reflection => 2 * (extent - 1) - index,
        PaddingMode::Symmetric if index < 0 => -index - 1,
        PaddingMode::Symmetric => 2 * extent - 1 - index,
    };
    Some(mapped as usize)
}

fn op_pad(
    inputs: &[CpuTensor],
    out_dims: Vec<usize>,
    padding: &[usize],
    options: &PadOptions,
) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let values = input.values_f32()?;
    if padding.len() != 2 * input.dims.len() {
        return Err(BackendError::execution("pad amounts mismatch input rank"));
    }
    let strides = compute_strides(&input.dims);
    let mut result = Vec::with_capacity(out_dims.iter().product());
    'outer: for coord in MultiIndex::new(&out_dims) {
        let mut index = 0usize;
        for (axis, &c) in coord.iter().enumerate() {
            let source = c as isize - padding[2 * axis] as isize;
            match pad_source(source, input.dims[axis] as isize, options.mode) {
                Some(i) => index += i * strides[axis],
                None => {
                    result.push(options.value);
                    continue 'outer;
                }
            }
        }
        result.push(values[index]);
    }
    Ok(CpuTensor::f32(out_dims, result))
}

fn op_reduce(
    inputs: &[CpuTensor],
    out_dims: Vec<usize>,
    op: ReduceOp,
    axes: &[usize],
) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let values = input.values_f32()?;
    let rank = input.dims.len();
    if axes.iter().any(|&axis| axis >= rank) {
        return Err(BackendError::execution("reduce axis out of range"));
    }

    let kept_dims: Vec<usize> = (0..rank)
        .map(|axis| if axes.contains(&axis) { 1 } else { input.dims[axis] })
        .collect();
    let kept_strides = compute_strides(&kept_dims);
    let reduced_dims: Vec<usize> = axes.iter().map(|&axis| input.dims[axis]).collect();
    let reduced_strides = compute_strides(&reduced_dims);
    let out_len: usize = kept_dims.iter().product();
    let group: usize = reduced_dims.iter().product();

    let init = match op {
        ReduceOp::Max | ReduceOp::ArgMax => f32::NEG_INFINITY,
        ReduceOp::Min | ReduceOp::ArgMin => f32::INFINITY,
        ReduceOp::Product => 1.0,
        _ => 0.0,
    };
    let mut acc = vec![init; out_len];
    let mut arg = vec![0i32; out_len];
    for (flat, coord) in MultiIndex::new(&input.dims).enumerate() {
        let out = coord
            .iter()
            .zip(&kept_strides)
            .enumerate()
            .filter(|(axis, _)| !axes.contains(axis))
            .map(|(_, (&c, &stride))| c * stride)
            .sum::<usize>();
        let x = values[flat];
        match op {
            ReduceOp::Sum | ReduceOp::Mean => acc[out] += x,
            ReduceOp::L1 => acc[out] += x.abs(),
            ReduceOp::L2 => acc[out] += x * x,
            ReduceOp::Product => acc[out] *= x,
            ReduceOp::Max => acc[out] = acc[out].max(x),
            ReduceOp::Min => acc[out] = acc[out].min(x),
            ReduceOp::ArgMax | ReduceOp::ArgMin => {
                let better = if op == ReduceOp::ArgMax {
                    x > acc[out]
                } else {
                    x < acc[out]
                };
                if better {
                    acc[out] = x;
                    arg[out] = axes
                        .iter()
                        .zip(&reduced_strides)
                        .map(|(&axis, &stride)| coord[axis] * stride)
                        .sum::<usize>() as i32;
                }
            }
        }
    }

    match op {
        ReduceOp::ArgMax | ReduceOp::ArgMin => Ok(CpuTensor::i32(out_dims, arg)),
        ReduceOp::Mean => {
            let count = group.max(1) as f32;
            Ok(CpuTensor::f32(out_dims, acc.into_iter().map(|v| v / count).collect()))
        }
        ReduceOp::L2 => Ok(CpuTensor::f32(out_dims, acc.into_iter().map(f32::sqrt).collect())),
        _ => Ok(CpuTensor::f32(out_dims, acc)),
    }
}

/// Addresses a 4-D activation by `(n, c, y, x)` regardless of its layout.
#[derive(Debug, Clone, Copy)]
struct Image {
    n: usize,
    c: usize,
    h: usize,
    w: usize,
    layout: InputOperandLayout,
}

impl Image {
    fn new(dims: &[usize], layout: InputOperandLayout) -> BackendResult<Self> {
        let &[d0, d1, d2, d3] = dims else {
            return Err(BackendError::execution(format!(
                "expected a 4-D tensor, got {dims:?}"
            )));
        };
        Ok(match layout {
            InputOperandLayout::Nchw => Self { n: d0, c: d1, h: d2, w: d3, layout },
            InputOperandLayout::Nhwc => Self { n: d0, c: d3, h: d1, w: d2, layout },
        })
    }

    fn offset(&self, n: usize, c: usize, y: usize, x: usize) -> usize {
        match self.layout {
            InputOperandLayout::Nchw => ((n * self.c + c) * self.h + y) * self.w + x,
            InputOperandLayout::Nhwc => ((n * self.h + y) * self.w + x) * self.c + c,
        }
    }
}

/// Addresses a conv filter by `(out_channel, in_channel, ky, kx)`.
struct Filter {
    strides: [usize; 4],
    out_channels: usize,
    in_channels: usize,
    kh: usize,
    kw: usize,
}

impl Filter {
    fn new(dims: &[usize], layout: FilterOperandLayout) -> BackendResult<Self> {
        if dims.len() != 4 {
            return Err(BackendError::execution("conv2d filter must be 4-D"));
        }
        let s = compute_strides(dims);
        // Each entry is (dimension index of o, i, h, w).
        let [o, i, h, w] = match layout {
            FilterOperandLayout::Oihw => [0, 1, 2, 3],
            FilterOperandLayout::Hwio => [3, 2, 0, 1],
            FilterOperandLayout::Ohwi => [0, 3, 1, 2],
            FilterOperandLayout::Ihwo => [3, 0, 1, 2],
        };
        Ok(Self {
            strides: [s[o], s[i], s[h], s[w]],
            out_channels: dims[o],
            in_channels: dims[i],
            kh: dims[h],
            kw: dims[w],
        })
    }

    fn offset(&self, o: usize, i: usize, y: usize, x: usize) -> usize {
        o * self.strides[0] + i * self.strides[1] + y * self.strides[2] + x * self.strides[3]
    }
}

fn pair(values: &Option<Vec<i32>>, default: usize) -> [usize; 2] {
    match values.as_deref() {
        Some([a, b]) => [*a as usize, *b as usize],
        _ => [default; 2],
    }
}

fn quad(values: &Option<Vec<i32>>) -> [usize; 4] {
    match values.as_deref() {
        Some([a, b, c, d]) => [*a as usize, *b as usize, *c as usize, *d as usize],
        _ => [0; 4],
    }
}

/// Input coordinate for output position `out` and window tap `tap`, if inside the input.
fn window_source(out: usize, tap: usize, stride: usize, dilation: usize, pad_begin: usize, extent: usize) -> Option<usize> {
    (out * stride + tap * dilation)
        .checked_sub(pad_begin)
        .filter(|&i| i < extent)
}

fn op_conv2d(
    inputs: &[CpuTensor],
    out_dims: Vec<usize>,
    options: &Conv2dOptions<InputSlot>,
) -> BackendResult<CpuTensor> {
    let (input, filter) = (input_at(inputs, 0)?, input_at(inputs, 1)?);
    let (x, w) = (input.values_f32()?, filter.values_f32()?);
    let src = Image::new(&input.dims, options.input_layout)?;
    let dst = Image::new(&out_dims, options.input_layout)?;
    let kernel = Filter::new(&filter.dims, options.filter_layout)?;
    let groups = options.groups.max(1) as usize;
    let out_per_group = kernel.out_channels / groups;
    let bias = match options.bias {
        Some(slot) => Some(input_at(inputs, slot)?.values_f32()?),
        None => None,
    };
    let [stride_h, stride_w] = pair(&options.strides, 1);
    let [dilation_h, dilation_w] = pair(&options.dilations, 1);
    let [pad_top, _, pad_left, _] = quad(&options.padding);

    let mut result = vec![0.0f32; out_dims.iter().product()];
    for n in 0..dst.n {
        for oc in 0..dst.c {
            let group = oc / out_per_group.max(1);
            for oy in 0..dst.h {
                for ox in 0..dst.w {
                    let mut acc = bias.map_or(0.0, |b| b[oc]);
                    for ic in 0..kernel.in_channels {
                        let channel = group * kernel.in_channels + ic;
                        for ky in 0..kernel.kh {
                            let Some(iy) = window_source(oy, ky, stride_h, dilation_h, pad_top, src.h) else {
                                continue;
                            };
                            for kx in 0..kernel.kw {
                                let Some(ix) = window_source(ox, kx, stride_w, dilation_w, pad_left, src.w) else {
                                    continue;
                                };
                                acc += x[src.offset(n, channel, iy, ix)]
                                    * w[kernel.offset(oc, ic, ky, kx)];
                            }
                        }
                    }
                    if let Some(activation) = &options.activation {
                        acc = activation.apply(acc);
                    }
                    result[dst.offset(n, oc, oy, ox)] = acc;
                }
            }
        }
    }
    Ok(CpuTensor::f32(out_dims, result))
}

fn op_pool2d(
    inputs: &[CpuTensor],
    out_dims: Vec<usize>,
    kind: Pool2dKind,
    options: &Pool2dOptions,
) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let x = input.values_f32()?;
    let src = Image::new(&input.dims, options.layout)?;
    let dst = Image::new(&out_dims, options.layout)?;
    let [window_h, window_w] = pair(&options.window_dimensions, 1);
    let [stride_h, stride_w] = pair(&options.strides, 1);
    let [dilation_h, dilation_w] = pair(&options.dilations, 1);
    let [pad_top, _, pad_left, _] = quad(&options.padding);

    let mut result = vec![0.0f32; out_dims.iter().product()];
    for n in 0..dst.n {
        for c in 0..dst.c {
            for oy in 0..dst.h {
                for ox in 0..dst.w {
                    let mut acc = match kind {
                        Pool2dKind::Max => f32::NEG_INFINITY,
                        _ => 0.0,
                    };
                    let mut count = 0usize;
                    for ky in 0..window_h {
                        let Some(iy) = window_source(oy, ky, stride_h, dilation_h, pad_top, src.h) else {
                            continue;
                        };
                        for kx in 0..window_w {
                            let Some(ix) = window_source(ox, kx, stride_w, dilation_w, pad_left, src.w) else {
                                continue;
                            };
                            let value = x[src.offset(n, c, iy, ix)];
                            match kind {
                                Pool2dKind::Average => acc += value,
                                Pool2dKind::L2 => acc += value * value,
                                Pool2dKind::Max => acc = acc.max(value),
                            }
                            count += 1;
                        }
                    }
                    let value = match kind {
                        _ if count == 0 => 0.0,
                        Pool2dKind::Average => acc / count as f32,
                        Pool2dKind::L2 => acc.sqrt(),
                        Pool2dKind::Max => acc,
                    };
                    result[dst.offset(n, c, oy, ox)] = value;
                }
            }
        }
    }
    Ok(CpuTensor::f32(out_dims, result))
}

fn op_batch_norm(
    inputs: &[CpuTensor],
    options: &BatchNormOptions<InputSlot>,
) -> BackendResult<CpuTensor> {
    let input = input_at(inputs, 0)?;
    let x = input.values_f32()?;
    let mean = input_at(inputs, 1)?.values_f32()?;
    let variance = input_at(inputs, 2)?.values_f32()?;
    let scale = options
        .scale
        .map(|slot| input_at(inputs, slot).and_then(CpuTensor::values_f32))
        .transpose()?;
    let bias = options
        .bias
        .map(|slot| input_at(inputs, slot).and_then(CpuTensor::values_f32))
        .transpose()?;
    let layout = if options.axis == 3 {
        InputOperandLayout::Nhwc
    } else {
        InputOperandLayout::Nchw
    };
    let image = Image::new(&input.dims, layout)?;

    let mut result = vec![0.0f32; x.len()];
    for n in 0..image.n {
        for c in 0..image.c {
            let inv_std = 1.0 / (variance[c] + options.epsilon).sqrt();
            let gamma = scale.map_or(1.0, |s| s[c]);
            let beta = bias.map_or(0.0, |b| b[c]);
            for y in 0..image.h {
                for xx in 0..image.w {
                    let offset = image.offset(n, c, y, xx);
                    let mut value = gamma * (x[offset] - mean[c]) * inv_std + beta;
                    if let Some(activation) = &options.activation {
                        value = activation.apply(value);
                    }
                    result[offset] = value;
                }
            }
        }
    }
    Ok(CpuTensor::f32(input.dims.clone(), result))
}

fn op_instance_norm(
    inputs: &[CpuTensor],
    options: &InstanceNormOptions<InputSlot>,
) -> BackendResult<CpuTensor> {
    let input = input_at(inputs, 0)?;
    let x = input.values_f32()?;
    let scale = options
        .scale
        .map(|slot| input_at(inputs, slot).and_then(CpuTensor::values_f32))
        .transpose()?;
    let bias = options
        .bias
        .map(|slot| input_at(inputs, slot).and_then(CpuTensor::values_f32))
        .transpose()?;
    let image = Image::new(&input.dims, options.layout)?;
    let plane = (image.h * image.w).max(1) as f32;

    let mut result = vec![0.0f32; x.len()];
    for n in 0..image.n {
        for c in 0..image.c {
            let offsets: Vec<usize> = (0..image.h)
                .flat_map(|y| (0..image.w).map(move |xx| (y, xx)))
                .map(|(y, xx)| image.offset(n, c, y, xx))
                .collect();
            let mean = offsets.iter().map(|&o| x[o]).sum::<f32>() / plane;
            let variance = offsets.iter().map(|&o| (x[o] - mean).powi(2)).sum::<f32>() / plane;
            let inv_std = 1.0 / (variance + options.epsilon).sqrt();
            let gamma = scale.map_or(1.0, |s| s[c]);
            let beta = bias.map_or(0.0, |b| b[c]);
            for &offset in &offsets {
                result[offset] = gamma * (x[offset] - mean) * inv_std + beta;
            }
        }
    }
    Ok(CpuTensor::f32(input.dims.clone(), result))
}

fn expect_single(inputs: &[CpuTensor]) -> BackendResult<&CpuTensor> {
    if inputs.len() != 1 {
        Err(BackendError::execution("operation expects single input"))
    } else {
        Ok(&inputs[0])
    }
}

fn input_at(inputs: &[CpuTensor], slot: usize) -> BackendResult<&CpuTensor> {
    inputs.get(slot).ok_or_else(|| {
        BackendError::execution(format!(
            "input slot {slot} out of range ({} inputs)",
            inputs.len()
        ))
    })
}

fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

fn broadcast_dims(a: &[usize], b: &[usize]) -> BackendResult<Vec<usize>> {
    let rank = a.len().max(b.len());
    let at = |dims: &[usize], i: usize| {
        if i < rank - dims.len() {
            1
        } else {
            dims[i - (rank - dims.len())]
        }
    };
    (0..rank)
        .map(|i| match (at(a, i), at(b, i)) {
            (x, y) if x == y => Ok(x),
            (1, y) => Ok(y),
            (x, 1) => Ok(x),
            _ => Err(BackendError::execution(format!(
                "shapes {a:?} and {b:?} are not broadcastable"
            ))),
        })
        .collect()
}

/// Strides that read `dims` as if broadcast to `target` (right-aligned, size-1 axes repeat).
fn broadcast_strides(dims: &[usize], target: &[usize]) -> BackendResult<Vec<usize>> {
    if dims.len() > target.len() {
        return Err(BackendError::execution(format!(
            "cannot broadcast {dims:?} to {target:?}"
        )));
    }
    let own = compute_strides(dims);
    let offset = target.len() - dims.len();
    let mut strides = vec![0usize; target.len()];
    for (i, &dim) in dims.iter().enumerate() {
        if dim == target[offset + i] {
            strides[offset + i] = own[i];
        } else if dim != 1 {
            return Err(BackendError::execution(format!(
                "cannot broadcast {dims:?} to {target:?}"
            )));
        }
    }
    Ok(strides)
}

fn dot(coord: &[usize], strides: &[usize]) -> usize {
    coord.iter().zip(strides).map(|(c, s)| c * s).sum()
}

struct MultiIndex {
    shape: Vec<usize>,
    current: Vec<usize>,
    first: bool,
}

impl MultiIndex {
    fn new(shape: &[usize]) -> Self {
        Self {
            shape: shape.to_vec(),
            current: vec![0; shape.len()],
            first: true,
        }
    }
}

impl Iterator for MultiIndex {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.first {
            self.first = false;
            if self.shape.contains(&0) {
                return None;
            }
            return Some(self.current.clone());
        }
        for i in (0..self.current.len()).rev() {
            self.current[i] += 1;
            if self.current[i] < self.shape[i] {
                return Some(self.current.clone());
            }
            self.current[i] = 0;
        }
        None
    }
}
