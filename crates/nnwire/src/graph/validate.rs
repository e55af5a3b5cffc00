//! Shape inference and attribute validation.
//!
//! [`infer`] checks an operator against its input descriptors, fills every
//! defaulted attribute with its resolved value, and returns the descriptors of
//! the operator's outputs. It never looks at tensor contents.

use std::collections::HashSet;

use crate::backend::spec::{OperandDescriptor, OperandType};
use crate::error::{invalid, ValidationError};

use super::ops::{BinaryOp, Operator, ReduceOp, UnaryOp};
use super::options::{
    AutoPad, BatchNormOptions, Conv2dOptions, ConvTranspose2dFilterOperandLayout,
    ConvTranspose2dOptions, FilterOperandLayout, FusedActivation, GemmOptions, GruOptions,
    InputOperandLayout, InputSlot, InstanceNormOptions, PadOptions, PaddingMode, Pool2dOptions,
    ReduceOptions, Resample2dOptions, RoundingType, SliceOptions, SplitOptions, SqueezeOptions,
    TransposeOptions,
};

type Result<T> = std::result::Result<T, ValidationError>;

/// Validates `op` against `inputs` and returns its output descriptors.
///
/// Defaulted attributes of `op` are rewritten to their resolved values on success.
pub(crate) fn infer(op: &mut Operator, inputs: &[OperandDescriptor]) -> Result<Vec<OperandDescriptor>> {
    let name = op.name();
    match op {
        Operator::Input { name, desc } => {
            if name.is_empty() {
                invalid!("input name must not be empty");
            }
            check_concrete(desc, "input")?;
            Ok(vec![desc.clone()])
        }
        Operator::Constant { desc, data } => {
            check_concrete(desc, "constant")?;
            match desc.byte_len() {
                Some(expected) if expected == data.len() => Ok(vec![desc.clone()]),
                Some(expected) => invalid!(
                    "constant buffer holds {} bytes but {} requires {}",
                    data.len(),
                    desc,
                    expected
                ),
                None => invalid!("constant {} is too large", desc),
            }
        }
        Operator::Binary(BinaryOp::MatMul) => matmul(&inputs[0], &inputs[1]).map(|d| vec![d]),
        Operator::Binary(_) => {
            let (a, b) = (&inputs[0], &inputs[1]);
            same_type(a, b, name)?;
            match broadcast_shapes(&a.dimensions, &b.dimensions) {
                Some(dims) => Ok(vec![OperandDescriptor::new(a.ty, dims)]),
                None => invalid!(
                    "{name}: shapes {:?} and {:?} are not broadcastable",
                    a.dimensions,
                    b.dimensions
                ),
            }
        }
        Operator::Unary(UnaryOp::Softmax) => {
            require_rank(&inputs[0], 2, "softmax input")?;
            Ok(vec![inputs[0].clone()])
        }
        Operator::Unary(_) | Operator::LeakyRelu(_) => Ok(vec![inputs[0].clone()]),
        Operator::Clamp(options) => {
            check_min_max(options.min_value, options.max_value, "clamp")?;
            Ok(vec![inputs[0].clone()])
        }
        Operator::Conv2d(options) => conv2d(options, inputs).map(|d| vec![d]),
        Operator::ConvTranspose2d(options) => conv_transpose2d(options, inputs).map(|d| vec![d]),
        Operator::Pool2d(_, options) => pool2d(options, &inputs[0], name).map(|d| vec![d]),
        Operator::BatchNorm(options) => batch_norm(options, inputs).map(|d| vec![d]),
        Operator::InstanceNorm(options) => instance_norm(options, inputs).map(|d| vec![d]),
        Operator::Gemm(options) => gemm(options, inputs).map(|d| vec![d]),
        Operator::Gru {
            steps,
            hidden_size,
            options,
        } => gru(*steps, *hidden_size, options, inputs),
        Operator::Pad { padding, options } => pad(padding, options, &inputs[0]).map(|d| vec![d]),
        Operator::Reduce(op, options) => reduce(*op, options, &inputs[0]).map(|d| vec![d]),
        Operator::Resample2d(options) => resample2d(options, &inputs[0]).map(|d| vec![d]),
        Operator::Reshape { new_shape } => reshape(new_shape, &inputs[0]).map(|d| vec![d]),
        Operator::Slice {
            starts,
            sizes,
            options,
        } => slice(starts, sizes, options, &inputs[0]).map(|d| vec![d]),
        Operator::Split { splits, options } => split(splits, options, &inputs[0]),
        Operator::Squeeze(options) => squeeze(options, &inputs[0]).map(|d| vec![d]),
        Operator::Transpose(options) => transpose(options, &inputs[0]).map(|d| vec![d]),
        Operator::Concat { axis } => concat(*axis, inputs).map(|d| vec![d]),
    }
}

fn check_concrete(desc: &OperandDescriptor, what: &str) -> Result<()> {
    if let Some(dim) = desc.dimensions.iter().find(|&&d| d < 0) {
        invalid!("{what} dimension {dim} must not be negative");
    }
    Ok(())
}

fn require_rank(desc: &OperandDescriptor, rank: usize, what: &str) -> Result<()> {
    if desc.rank() != rank {
        invalid!("{what} must be {rank}-D, got {:?}", desc.dimensions);
    }
    Ok(())
}

fn same_type(a: &OperandDescriptor, b: &OperandDescriptor, what: &str) -> Result<()> {
    if a.ty != b.ty {
        invalid!("{what}: operand types {:?} and {:?} differ", a.ty, b.ty);
    }
    Ok(())
}

fn check_min_max(min_value: f32, max_value: f32, what: &str) -> Result<()> {
    // Written so that NaN bounds are rejected too.
    if !(min_value <= max_value) {
        invalid!("{what}: min value {min_value} exceeds max value {max_value}");
    }
    Ok(())
}

fn check_activation(activation: &Option<FusedActivation>, what: &str) -> Result<()> {
    if let Some(FusedActivation::Clamp {
        min_value,
        max_value,
    }) = activation
    {
        check_min_max(*min_value, *max_value, what)?;
    }
    Ok(())
}

fn check_len<T>(values: &Option<Vec<T>>, len: usize, what: &str) -> Result<()> {
    match values {
        Some(values) if values.len() != len => {
            invalid!("{what} must have {len} values, got {}", values.len())
        }
        _ => Ok(()),
    }
}

fn check_positive(values: &[i32], what: &str) -> Result<()> {
    if values.iter().any(|&v| v <= 0) {
        invalid!("{what} must be positive, got {values:?}");
    }
    Ok(())
}

fn check_non_negative(values: &[i32], what: &str) -> Result<()> {
    if values.iter().any(|&v| v < 0) {
        invalid!("{what} must not be negative, got {values:?}");
    }
    Ok(())
}

/// Resolves a possibly negative axis against `rank`.
fn wrap_axis(axis: i32, rank: usize) -> Option<usize> {
    let rank = rank as i64;
    let axis = axis as i64;
    let resolved = if axis < 0 { axis + rank } else { axis };
    (0..rank).contains(&resolved).then_some(resolved as usize)
}

fn to_dim(value: i64, what: &str) -> Result<i32> {
    match i32::try_from(value) {
        Ok(v) if v > 0 => Ok(v),
        _ => invalid!("{what} evaluates to {value}, which is not a valid dimension"),
    }
}

/// Numpy-style broadcast of two shapes, aligned from the trailing dimension.
pub(crate) fn broadcast_shapes(a: &[i32], b: &[i32]) -> Option<Vec<i32>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(out)
}

fn matmul(a: &OperandDescriptor, b: &OperandDescriptor) -> Result<OperandDescriptor> {
    same_type(a, b, "matmul")?;
    if a.rank() == 0 || b.rank() == 0 {
        invalid!("matmul operands must have rank >= 1");
    }
    let mut lhs = a.dimensions.clone();
    let mut rhs = b.dimensions.clone();
    let lhs_vector = lhs.len() == 1;
    let rhs_vector = rhs.len() == 1;
    if lhs_vector {
        lhs.insert(0, 1);
    }
    if rhs_vector {
        rhs.push(1);
    }
    let (m, k) = (lhs[lhs.len() - 2], lhs[lhs.len() - 1]);
    let (k2, n) = (rhs[rhs.len() - 2], rhs[rhs.len() - 1]);
    if k != k2 {
        invalid!(
            "matmul inner dimensions differ: {:?} x {:?}",
            a.dimensions,
            b.dimensions
        );
    }
    let Some(mut dims) = broadcast_shapes(&lhs[..lhs.len() - 2], &rhs[..rhs.len() - 2]) else {
        invalid!(
            "matmul batch dimensions of {:?} and {:?} are not broadcastable",
            a.dimensions,
            b.dimensions
        );
    };
    if !lhs_vector {
        dims.push(m);
    }
    if !rhs_vector {
        dims.push(n);
    }
    if dims.is_empty() {
        dims.push(1);
    }
    Ok(OperandDescriptor::new(a.ty, dims))
}

/// `(batch, channels, height, width)` of a 4-D activation.
fn split_layout(dims: &[i32], layout: InputOperandLayout) -> (i32, i32, i32, i32) {
    match layout {
        InputOperandLayout::Nchw => (dims[0], dims[1], dims[2], dims[3]),
        InputOperandLayout::Nhwc => (dims[0], dims[3], dims[1], dims[2]),
    }
}

fn join_layout(layout: InputOperandLayout, n: i32, c: i32, h: i32, w: i32) -> Vec<i32> {
    match layout {
        InputOperandLayout::Nchw => vec![n, c, h, w],
        InputOperandLayout::Nhwc => vec![n, h, w, c],
    }
}

/// Implicit `(begin, end)` padding so the output extent is `ceil(input / stride)`.
fn same_padding(input: i32, window: i32, stride: i32, dilation: i32, auto_pad: AutoPad) -> (i32, i32) {
    let (input, window, stride, dilation) = (input as i64, window as i64, stride as i64, dilation as i64);
    let output = (input + stride - 1) / stride;
    let dilated = (window - 1) * dilation + 1;
    let total = ((output - 1) * stride + dilated - input).max(0);
    let half = total / 2;
    let (begin, end) = match auto_pad {
        AutoPad::SameLower => (total - half, half),
        AutoPad::SameUpper | AutoPad::Explicit => (half, total - half),
    };
    (begin as i32, end as i32)
}

fn transposed_same_padding(
    input: i32,
    window: i32,
    stride: i32,
    dilation: i32,
    output_padding: i32,
    auto_pad: AutoPad,
) -> (i32, i32) {
    let (input, window, stride, dilation) = (input as i64, window as i64, stride as i64, dilation as i64);
    let dilated = (window - 1) * dilation + 1;
    let total = ((input - 1) * stride + dilated + output_padding as i64 - input * stride).max(0);
    let half = total / 2;
    let (begin, end) = match auto_pad {
        AutoPad::SameLower => (total - half, half),
        AutoPad::SameUpper | AutoPad::Explicit => (half, total - half),
    };
    (begin as i32, end as i32)
}

#[allow(clippy::too_many_arguments)]
fn window_output_size(
    input: i32,
    window: i32,
    begin: i32,
    end: i32,
    stride: i32,
    dilation: i32,
    rounding: RoundingType,
    what: &str,
) -> Result<i32> {
    let dilated = (window as i64 - 1) * dilation as i64 + 1;
    let padded = input as i64 + begin as i64 + end as i64;
    if dilated > padded {
        invalid!("{what}: window of extent {dilated} exceeds padded input extent {padded}");
    }
    let span = padded - dilated;
    let stride = stride as i64;
    let steps = match rounding {
        RoundingType::Floor => span / stride,
        RoundingType::Ceil => (span + stride - 1) / stride,
    };
    to_dim(steps + 1, what)
}

/// Checks the array lengths and signs shared by conv and pool windows.
fn check_window_attrs(
    padding: &Option<Vec<i32>>,
    strides: &Option<Vec<i32>>,
    dilations: &Option<Vec<i32>>,
    what: &str,
) -> Result<()> {
    check_len(padding, 4, &format!("{what} padding"))?;
    check_len(strides, 2, &format!("{what} strides"))?;
    check_len(dilations, 2, &format!("{what} dilations"))?;
    if let Some(padding) = padding {
        check_non_negative(padding, &format!("{what} padding"))?;
    }
    if let Some(strides) = strides {
        check_positive(strides, &format!("{what} strides"))?;
    }
    if let Some(dilations) = dilations {
        check_positive(dilations, &format!("{what} dilations"))?;
    }
    Ok(())
}

fn check_channel_vector(
    desc: &OperandDescriptor,
    input: &OperandDescriptor,
    channels: i32,
    what: &str,
) -> Result<()> {
    same_type(input, desc, what)?;
    if desc.dimensions != [channels] {
        invalid!("{what} must have shape [{channels}], got {:?}", desc.dimensions);
    }
    Ok(())
}

fn conv2d(options: &mut Conv2dOptions<InputSlot>, inputs: &[OperandDescriptor]) -> Result<OperandDescriptor> {
    let (input, filter) = (&inputs[0], &inputs[1]);
    require_rank(input, 4, "conv2d input")?;
    require_rank(filter, 4, "conv2d filter")?;
    same_type(input, filter, "conv2d filter")?;
    check_window_attrs(&options.padding, &options.strides, &options.dilations, "conv2d")?;
    check_activation(&options.activation, "conv2d activation")?;
    if options.groups < 1 {
        invalid!("conv2d groups must be at least 1, got {}", options.groups);
    }

    let (batch, in_c, in_h, in_w) = split_layout(&input.dimensions, options.input_layout);
    let f = &filter.dimensions;
    let (out_c, depth_in, k_h, k_w) = match options.filter_layout {
        FilterOperandLayout::Oihw => (f[0], f[1], f[2], f[3]),
        FilterOperandLayout::Hwio => (f[3], f[2], f[0], f[1]),
        FilterOperandLayout::Ohwi => (f[0], f[3], f[1], f[2]),
        FilterOperandLayout::Ihwo => (f[3], f[0], f[1], f[2]),
    };
    if depth_in as i64 * options.groups as i64 != in_c as i64 {
        invalid!(
            "conv2d filter input depth {depth_in} times groups {} must equal input channels {in_c}",
            options.groups
        );
    }
    if out_c % options.groups != 0 {
        invalid!(
            "conv2d output channels {out_c} are not divisible by groups {}",
            options.groups
        );
    }
    if let Some(slot) = options.bias {
        check_channel_vector(&inputs[slot], input, out_c, "conv2d bias")?;
    }

    let strides = options.strides();
    let dilations = options.dilations();
    let padding = match options.auto_pad {
        AutoPad::Explicit => options.padding(),
        auto_pad => {
            let (top, bottom) = same_padding(in_h, k_h, strides[0], dilations[0], auto_pad);
            let (left, right) = same_padding(in_w, k_w, strides[1], dilations[1], auto_pad);
            [top, bottom, left, right]
        }
    };
    let out_h = window_output_size(in_h, k_h, padding[0], padding[1], strides[0], dilations[0], RoundingType::Floor, "conv2d output height")?;
    let out_w = window_output_size(in_w, k_w, padding[2], padding[3], strides[1], dilations[1], RoundingType::Floor, "conv2d output width")?;

    options.padding = Some(padding.to_vec());
    options.strides = Some(strides.to_vec());
    options.dilations = Some(dilations.to_vec());
    options.auto_pad = AutoPad::Explicit;
    Ok(OperandDescriptor::new(
        input.ty,
        join_layout(options.input_layout, batch, out_c, out_h, out_w),
    ))
}

fn conv_transpose2d(
    options: &mut ConvTranspose2dOptions<InputSlot>,
    inputs: &[OperandDescriptor],
) -> Result<OperandDescriptor> {
    let (input, filter) = (&inputs[0], &inputs[1]);
    require_rank(input, 4, "convTranspose2d input")?;
    require_rank(filter, 4, "convTranspose2d filter")?;
    same_type(input, filter, "convTranspose2d filter")?;
    check_window_attrs(&options.padding, &options.strides, &options.dilations, "convTranspose2d")?;
    check_len(&options.output_padding, 2, "convTranspose2d output padding")?;
    check_len(&options.output_sizes, 2, "convTranspose2d output sizes")?;
    check_activation(&options.activation, "convTranspose2d activation")?;
    if options.groups < 1 {
        invalid!("convTranspose2d groups must be at least 1, got {}", options.groups);
    }

    let (batch, in_c, in_h, in_w) = split_layout(&input.dimensions, options.input_layout);
    let f = &filter.dimensions;
    let (depth_in, out_per_group, k_h, k_w) = match options.filter_layout {
        ConvTranspose2dFilterOperandLayout::Iohw => (f[0], f[1], f[2], f[3]),
        ConvTranspose2dFilterOperandLayout::Hwoi => (f[3], f[2], f[0], f[1]),
        ConvTranspose2dFilterOperandLayout::Ohwi => (f[3], f[0], f[1], f[2]),
    };
    if depth_in != in_c {
        invalid!("convTranspose2d filter input depth {depth_in} must equal input channels {in_c}");
    }
    let out_c = to_dim(out_per_group as i64 * options.groups as i64, "convTranspose2d output channels")?;
    if let Some(slot) = options.bias {
        check_channel_vector(&inputs[slot], input, out_c, "convTranspose2d bias")?;
    }

    let strides = options.strides();
    let dilations = options.dilations();
    let output_padding = options.output_padding();
    check_non_negative(&output_padding, "convTranspose2d output padding")?;
    if output_padding[0] >= strides[0] || output_padding[1] >= strides[1] {
        invalid!(
            "convTranspose2d output padding {output_padding:?} must be smaller than strides {strides:?}"
        );
    }
    let padding = match options.auto_pad {
        AutoPad::Explicit => options.padding(),
        auto_pad => {
            let (top, bottom) = transposed_same_padding(in_h, k_h, strides[0], dilations[0], output_padding[0], auto_pad);
            let (left, right) = transposed_same_padding(in_w, k_w, strides[1], dilations[1], output_padding[1], auto_pad);
            [top, bottom, left, right]
        }
    };

    let (out_h, out_w) = match &options.output_sizes {
        Some(sizes) => {
            check_positive(sizes, "convTranspose2d output sizes")?;
            (sizes[0], sizes[1])
        }
        None => {
            let extent = |input: i32, kernel: i32, begin: i32, end: i32, axis: usize, what: &str| {
                let dilated = (kernel as i64 - 1) * dilations[axis] as i64 + 1;
                to_dim(
                    (input as i64 - 1) * strides[axis] as i64 + dilated - begin as i64 - end as i64
                        + output_padding[axis] as i64,
                    what,
                )
            };
            (
                extent(in_h, k_h, padding[0], padding[1], 0, "convTranspose2d output height")?,
                extent(in_w, k_w, padding[2], padding[3], 1, "convTranspose2d output width")?,
            )
        }
    };

    options.padding = Some(padding.to_vec());
    options.strides = Some(strides.to_vec());
    options.dilations = Some(dilations.to_vec());
    options.output_padding = Some(output_padding.to_vec());
    options.auto_pad = AutoPad::Explicit;
    Ok(OperandDescriptor::new(
        input.ty,
        join_layout(options.input_layout, batch, out_c, out_h, out_w),
    ))
}

fn pool2d(options: &mut Pool2dOptions, input: &OperandDescriptor, what: &str) -> Result<OperandDescriptor> {
    require_rank(input, 4, &format!("{what} input"))?;
    check_window_attrs(&options.padding, &options.strides, &options.dilations, what)?;
    check_len(&options.window_dimensions, 2, &format!("{what} window dimensions"))?;
    check_len(&options.output_sizes, 2, &format!("{what} output sizes"))?;

    let (batch, channels, in_h, in_w) = split_layout(&input.dimensions, options.layout);
    let window = match &options.window_dimensions {
        Some(window) => {
            check_positive(window, &format!("{what} window dimensions"))?;
            [window[0], window[1]]
        }
        None => [in_h, in_w],
    };
    let strides = options.strides();
    let dilations = options.dilations();
    let padding = match options.auto_pad {
        AutoPad::Explicit => options.padding(),
        auto_pad => {
            let (top, bottom) = same_padding(in_h, window[0], strides[0], dilations[0], auto_pad);
            let (left, right) = same_padding(in_w, window[1], strides[1], dilations[1], auto_pad);
            [top, bottom, left, right]
        }
    };

    let (out_h, out_w) = match &options.output_sizes {
        Some(sizes) => {
            check_positive(sizes, &format!("{what} output sizes"))?;
            (sizes[0], sizes[1])
        }
        None => (
            window_output_size(in_h, window[0], padding[0], padding[1], strides[0], dilations[0], options.rounding_type, &format!("{what} output height"))?,
            window_output_size(in_w, window[1], padding[2], padding[3], strides[1], dilations[1], options.rounding_type, &format!("{what} output width"))?,
        ),
    };

    options.window_dimensions = Some(window.to_vec());
    options.padding = Some(padding.to_vec());
    options.strides = Some(strides.to_vec());
    options.dilations = Some(dilations.to_vec());
    options.auto_pad = AutoPad::Explicit;
    Ok(OperandDescriptor::new(
        input.ty,
        join_layout(options.layout, batch, channels, out_h, out_w),
    ))
}

fn batch_norm(options: &mut BatchNormOptions<InputSlot>, inputs: &[OperandDescriptor]) -> Result<OperandDescriptor> {
    let input = &inputs[0];
    require_rank(input, 4, "batchNorm input")?;
    check_activation(&options.activation, "batchNorm activation")?;
    if options.axis != 1 && options.axis != 3 {
        invalid!("batchNorm axis must be 1 or 3, got {}", options.axis);
    }
    let channels = input.dimensions[options.axis as usize];
    check_channel_vector(&inputs[1], input, channels, "batchNorm mean")?;
    check_channel_vector(&inputs[2], input, channels, "batchNorm variance")?;
    if let Some(slot) = options.scale {
        check_channel_vector(&inputs[slot], input, channels, "batchNorm scale")?;
    }
    if let Some(slot) = options.bias {
        check_channel_vector(&inputs[slot], input, channels, "batchNorm bias")?;
    }
    Ok(input.clone())
}

fn instance_norm(options: &mut InstanceNormOptions<InputSlot>, inputs: &[OperandDescriptor]) -> Result<OperandDescriptor> {
    let input = &inputs[0];
    require_rank(input, 4, "instanceNorm input")?;
    let (_, channels, _, _) = split_layout(&input.dimensions, options.layout);
    if let Some(slot) = options.scale {
        check_channel_vector(&inputs[slot], input, channels, "instanceNorm scale")?;
    }
    if let Some(slot) = options.bias {
        check_channel_vector(&inputs[slot], input, channels, "instanceNorm bias")?;
    }
    Ok(input.clone())
}

fn gemm(options: &mut GemmOptions<InputSlot>, inputs: &[OperandDescriptor]) -> Result<OperandDescriptor> {
    let (a, b) = (&inputs[0], &inputs[1]);
    require_rank(a, 2, "gemm a")?;
    require_rank(b, 2, "gemm b")?;
    same_type(a, b, "gemm")?;
    let (m, k) = if options.a_transpose {
        (a.dimensions[1], a.dimensions[0])
    } else {
        (a.dimensions[0], a.dimensions[1])
    };
    let (k2, n) = if options.b_transpose {
        (b.dimensions[1], b.dimensions[0])
    } else {
        (b.dimensions[0], b.dimensions[1])
    };
    if k != k2 {
        invalid!(
            "gemm inner dimensions differ: {:?} x {:?}",
            a.dimensions,
            b.dimensions
        );
    }
    if let Some(slot) = options.c {
        let c = &inputs[slot];
        same_type(a, c, "gemm c")?;
        if c.rank() > 2 {
            invalid!("gemm c must have rank <= 2, got {:?}", c.dimensions);
        }
        let target = [m, n];
        let offset = 2 - c.rank();
        for (i, &dim) in c.dimensions.iter().enumerate() {
            if dim != 1 && dim != target[offset + i] {
                invalid!(
                    "gemm c {:?} is not broadcastable to [{m}, {n}]",
                    c.dimensions
                );
            }
        }
    }
    Ok(OperandDescriptor::new(a.ty, vec![m, n]))
}

fn gru(
    steps: u32,
    hidden_size: u32,
    options: &mut GruOptions<InputSlot>,
    inputs: &[OperandDescriptor],
) -> Result<Vec<OperandDescriptor>> {
    let (input, weight, recurrent_weight) = (&inputs[0], &inputs[1], &inputs[2]);
    require_rank(input, 3, "gru input")?;
    require_rank(weight, 3, "gru weight")?;
    require_rank(recurrent_weight, 3, "gru recurrent weight")?;
    same_type(input, weight, "gru weight")?;
    same_type(input, recurrent_weight, "gru recurrent weight")?;
    if steps == 0 || hidden_size == 0 {
        invalid!("gru steps and hidden size must be positive");
    }
    let (Ok(steps), Ok(hidden)) = (i32::try_from(steps), i32::try_from(hidden_size)) else {
        invalid!("gru steps {steps} or hidden size {hidden_size} is out of range");
    };
    if input.dimensions[0] != steps {
        invalid!(
            "gru input has {} steps but {steps} were requested",
            input.dimensions[0]
        );
    }
    let batch = input.dimensions[1];
    let input_size = input.dimensions[2];
    let dirs = options.direction.num_directions();
    let gates = to_dim(3 * hidden as i64, "gru gate size")?;

    let expect_shape = |desc: &OperandDescriptor, shape: &[i32], what: &str| -> Result<()> {
        same_type(input, desc, what)?;
        if desc.dimensions != shape {
            invalid!("{what} must have shape {shape:?}, got {:?}", desc.dimensions);
        }
        Ok(())
    };
    expect_shape(weight, &[dirs, gates, input_size], "gru weight")?;
    expect_shape(recurrent_weight, &[dirs, gates, hidden], "gru recurrent weight")?;
    if let Some(slot) = options.bias {
        expect_shape(&inputs[slot], &[dirs, gates], "gru bias")?;
    }
    if let Some(slot) = options.recurrent_bias {
        expect_shape(&inputs[slot], &[dirs, gates], "gru recurrent bias")?;
    }
    if let Some(slot) = options.initial_hidden_state {
        expect_shape(&inputs[slot], &[dirs, batch, hidden], "gru initial hidden state")?;
    }
    match &options.activations {
        Some(activations) if activations.len() != 2 => {
            invalid!("gru takes exactly 2 activations, got {}", activations.len())
        }
        Some(activations) => {
            for activation in activations {
                check_activation(&Some(*activation), "gru activation")?;
            }
        }
        None => options.activations = Some(vec![FusedActivation::Sigmoid, FusedActivation::Tanh]),
    }

    let mut outputs = vec![OperandDescriptor::new(input.ty, vec![dirs, batch, hidden])];
    if options.return_sequence {
        outputs.push(OperandDescriptor::new(
            input.ty,
            vec![steps, dirs, batch, hidden],
        ));
    }
    Ok(outputs)
}

fn pad(padding: &[u32], options: &PadOptions, input: &OperandDescriptor) -> Result<OperandDescriptor> {
    if padding.len() != 2 * input.rank() {
        invalid!(
            "pad needs {} padding values for a {}-D input, got {}",
            2 * input.rank(),
            input.rank(),
            padding.len()
        );
    }
    let mut dims = Vec::with_capacity(input.rank());
    for (axis, &dim) in input.dimensions.iter().enumerate() {
        let (begin, end) = (padding[2 * axis] as i64, padding[2 * axis + 1] as i64);
        let limit = match options.mode {
            PaddingMode::Constant => i64::MAX,
            PaddingMode::Edge if dim == 0 => 0,
            PaddingMode::Edge => i64::MAX,
            PaddingMode::Reflection => dim as i64 - 1,
            PaddingMode::Symmetric => dim as i64,
        };
        if begin > limit || end > limit {
            invalid!(
                "pad {:?}: padding ({begin}, {end}) is too large for axis {axis} of extent {dim}",
                options.mode
            );
        }
        dims.push(to_dim(dim as i64 + begin + end, "pad output dimension")?);
    }
    Ok(OperandDescriptor::new(input.ty, dims))
}

fn resolve_axes(axes: &[i32], rank: usize, what: &str) -> Result<Vec<usize>> {
    let mut seen = HashSet::new();
    let mut resolved = Vec::with_capacity(axes.len());
    for &axis in axes {
        let Some(index) = wrap_axis(axis, rank) else {
            invalid!("{what} axis {axis} is out of range for rank {rank}");
        };
        if !seen.insert(index) {
            invalid!("{what} axis {axis} is repeated");
        }
        resolved.push(index);
    }
    Ok(resolved)
}

fn reduce(op: ReduceOp, options: &mut ReduceOptions, input: &OperandDescriptor) -> Result<OperandDescriptor> {
    let rank = input.rank();
    let axes = match &options.axes {
        Some(axes) => resolve_axes(axes, rank, op.name())?,
        None => (0..rank).collect(),
    };
    let mut dims = Vec::with_capacity(rank);
    for (axis, &dim) in input.dimensions.iter().enumerate() {
        if !axes.contains(&axis) {
            dims.push(dim);
        } else if options.keep_dimensions {
            dims.push(1);
        }
    }
    if dims.is_empty() {
        dims.push(1);
    }
    options.axes = Some(axes.iter().map(|&a| a as i32).collect());
    let ty = if op.is_arg() { OperandType::Int32 } else { input.ty };
    Ok(OperandDescriptor::new(ty, dims))
}

fn resample2d(options: &mut Resample2dOptions, input: &OperandDescriptor) -> Result<OperandDescriptor> {
    require_rank(input, 4, "resample2d input")?;
    check_len(&options.scales, 2, "resample2d scales")?;
    check_len(&options.sizes, 2, "resample2d sizes")?;
    check_len(&options.axes, 2, "resample2d axes")?;
    let axes = options.axes.clone().unwrap_or_else(|| vec![2, 3]);
    if !matches!(axes.as_slice(), [0, 1] | [1, 2] | [2, 3]) {
        invalid!("resample2d axes must be [0, 1], [1, 2] or [2, 3], got {axes:?}");
    }
    let scales = options.scales.clone().unwrap_or_else(|| vec![1.0, 1.0]);
    if scales.iter().any(|&s| !(s > 0.0)) {
        invalid!("resample2d scales must be positive, got {scales:?}");
    }
    let mut dims = input.dimensions.clone();
    for i in 0..2 {
        let axis = axes[i] as usize;
        dims[axis] = match &options.sizes {
            Some(sizes) => {
                check_positive(sizes, "resample2d sizes")?;
                sizes[i]
            }
            None => to_dim(
                (input.dimensions[axis] as f64 * scales[i] as f64).floor() as i64,
                "resample2d output dimension",
            )?,
        };
    }
    options.axes = Some(axes);
    options.scales = Some(scales);
    Ok(OperandDescriptor::new(input.ty, dims))
}

fn reshape(new_shape: &mut Vec<i32>, input: &OperandDescriptor) -> Result<OperandDescriptor> {
    let Some(capacity) = input.element_count() else {
        invalid!("reshape input {} has no element count", input);
    };
    let mut inferred = None;
    let mut known: usize = 1;
    for (index, &dim) in new_shape.iter().enumerate() {
        match dim {
            -1 => {
                if inferred.replace(index).is_some() {
                    invalid!("reshape new shape {new_shape:?} has more than one -1");
                }
            }
            d if d <= 0 => invalid!("reshape new shape {new_shape:?} contains {d}"),
            d => match known.checked_mul(d as usize) {
                Some(product) => known = product,
                None => invalid!("reshape new shape {new_shape:?} overflows"),
            },
        }
    }
    match inferred {
        Some(index) => {
            if capacity % known != 0 {
                invalid!(
                    "reshape cannot infer -1 in {new_shape:?}: {capacity} elements are not divisible by {known}"
                );
            }
            new_shape[index] = to_dim((capacity / known) as i64, "reshape inferred dimension")?;
        }
        None if known != capacity => invalid!(
            "reshape new shape {new_shape:?} holds {known} elements but the input holds {capacity}"
        ),
        None => {}
    }
    Ok(OperandDescriptor::new(input.ty, new_shape.clone()))
}

fn slice(
    starts: &mut [i32],
    sizes: &mut [i32],
    options: &mut SliceOptions,
    input: &OperandDescriptor,
) -> Result<OperandDescriptor> {
    let rank = input.rank();
    if starts.len() != sizes.len() {
        invalid!(
            "slice starts ({}) and sizes ({}) differ in length",
            starts.len(),
            sizes.len()
        );
    }
    let axes = match &options.axes {
        Some(axes) => {
            if axes.len() != starts.len() {
                invalid!("slice axes ({}) and starts ({}) differ in length", axes.len(), starts.len());
            }
            resolve_axes(axes, rank, "slice")?
        }
        None => {
            if starts.len() > rank {
                invalid!("slice has {} starts for a {rank}-D input", starts.len());
            }
            (0..starts.len()).collect()
        }
    };
    let mut dims = input.dimensions.clone();
    for (i, &axis) in axes.iter().enumerate() {
        let extent = input.dimensions[axis];
        let start = if starts[i] < 0 { starts[i] as i64 + extent as i64 } else { starts[i] as i64 };
        if start < 0 || start >= extent as i64 {
            invalid!("slice start {} is out of range for axis {axis} of extent {extent}", starts[i]);
        }
        let size = match sizes[i] {
            -1 => extent as i64 - start,
            s if s <= 0 => invalid!("slice size {s} must be positive or -1"),
            s => s as i64,
        };
        if start + size > extent as i64 {
            invalid!("slice [{start}, {}) exceeds axis {axis} of extent {extent}", start + size);
        }
        starts[i] = start as i32;
        sizes[i] = size as i32;
        dims[axis] = size as i32;
    }
    options.axes = Some(axes.iter().map(|&a| a as i32).collect());
    Ok(OperandDescriptor::new(input.ty, dims))
}

fn split(splits: &[u32], options: &mut SplitOptions, input: &OperandDescriptor) -> Result<Vec<OperandDescriptor>> {
    let Some(axis) = wrap_axis(options.axis, input.rank()) else {
        invalid!("split axis {} is out of range for rank {}", options.axis, input.rank());
    };
    let extent = input.dimensions[axis] as i64;
    let sizes: Vec<i64> = match splits {
        [] => invalid!("split needs at least one split value"),
        [count] => {
            let count = *count as i64;
            if extent == 0 || count > extent {
                invalid!("split count {count} needs a non-empty axis of at least that extent, got {extent}");
            }
            if count == 0 || extent % count != 0 {
                invalid!("split count {count} does not evenly divide axis extent {extent}");
            }
            vec![extent / count; count as usize]
        }
        many => {
            if many.contains(&0) {
                invalid!("split sizes {many:?} must be positive");
            }
            let total: i64 = many.iter().map(|&s| s as i64).sum();
            if total != extent {
                invalid!("split sizes {many:?} sum to {total}, not the axis extent {extent}");
            }
            many.iter().map(|&s| s as i64).collect()
        }
    };
    options.axis = axis as i32;
    Ok(sizes
        .into_iter()
        .map(|size| {
            let mut dims = input.dimensions.clone();
            dims[axis] = size as i32;
            OperandDescriptor::new(input.ty, dims)
        })
        .collect())
}

fn squeeze(options: &mut SqueezeOptions, input: &OperandDescriptor) -> Result<OperandDescriptor> {
    let rank = input.rank();
    let axes = match &options.axes {
        Some(axes) => {
            let axes = resolve_axes(axes, rank, "squeeze")?;
            if let Some(&axis) = axes.iter().find(|&&a| input.dimensions[a] != 1) {
                invalid!(
                    "squeeze axis {axis} has extent {}, not 1",
                    input.dimensions[axis]
                );
            }
            axes
        }
        None => (0..rank).filter(|&a| input.dimensions[a] == 1).collect(),
    };
    let mut dims: Vec<i32> = input
        .dimensions
        .iter()
        .enumerate()
        .filter(|(axis, _)| !axes.contains(axis))
        .map(|(_, &d)| d)
        .collect();
    if dims.is_empty() {
        dims.push(1);
    }
    options.axes = Some(axes.iter().map(|&a| a as i32).collect());
    Ok(OperandDescriptor::new(input.ty, dims))
}

fn transpose(options: &mut TransposeOptions, input: &OperandDescriptor) -> Result<OperandDescriptor> {
    let rank = input.rank();
    let permutation = match &options.permutation {
        Some(permutation) => permutation.clone(),
        None => (0..rank as i32).rev().collect(),
    };
    if permutation.len() != rank {
        invalid!(
            "transpose permutation {permutation:?} has length {}, input rank is {rank}",
            permutation.len()
        );
    }
    let mut seen = vec![false; rank];
    for &axis in &permutation {
        if axis < 0 || axis as usize >= rank || std::mem::replace(&mut seen[axis as usize], true) {
            invalid!("transpose permutation {permutation:?} is not a permutation of 0..{rank}");
        }
    }
    let dims = permutation
        .iter()
        .map(|&axis| input.dimensions[axis as usize])
        .collect::<Vec<i32>>();
    options.permutation = Some(permutation);
    Ok(OperandDescriptor::new(input.ty, dims))
}

fn concat(axis: u32, inputs: &[OperandDescriptor]) -> Result<OperandDescriptor> {
    let Some(first) = inputs.first() else {
        invalid!("concat needs at least one input");
    };
    let axis = axis as usize;
    if axis >= first.rank() {
        invalid!("concat axis {axis} is out of range for rank {}", first.rank());
    }
    let mut dims = first.dimensions.clone();
    for other in &inputs[1..] {
        same_type(first, other, "concat")?;
        if other.rank() != first.rank() {
            invalid!("concat inputs must share rank {}, got {:?}", first.rank(), other.dimensions);
        }
        for (i, (&a, &b)) in first.dimensions.iter().zip(&other.dimensions).enumerate() {
            if i != axis && a != b {
                invalid!(
                    "concat inputs {:?} and {:?} differ outside axis {axis}",
                    first.dimensions,
                    other.dimensions
                );
            }
        }
        dims[axis] = to_dim(dims[axis] as i64 + other.dimensions[axis] as i64, "concat axis extent")?;
    }
    Ok(OperandDescriptor::new(first.ty, dims))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ops::Pool2dKind;

    fn f32(dims: &[i32]) -> OperandDescriptor {
        OperandDescriptor::float32(dims.to_vec())
    }

    fn infer_one(mut op: Operator, inputs: &[OperandDescriptor]) -> Result<Vec<i32>> {
        infer(&mut op, inputs).map(|outs| outs[0].dimensions.clone())
    }

    #[test]
    fn binary_broadcasts_trailing_dimensions() {
        let out = infer_one(Operator::Binary(BinaryOp::Add), &[f32(&[2, 3, 4]), f32(&[3, 1])]);
        assert_eq!(out.unwrap(), vec![2, 3, 4]);
        assert!(infer_one(Operator::Binary(BinaryOp::Mul), &[f32(&[2, 3]), f32(&[4])]).is_err());
    }

    #[test]
    fn binary_rejects_mixed_types() {
        let int = OperandDescriptor::new(OperandType::Int32, vec![2]);
        assert!(infer_one(Operator::Binary(BinaryOp::Add), &[f32(&[2]), int]).is_err());
    }

    #[test]
    fn matmul_promotes_vectors_and_broadcasts_batches() {
        let op = || Operator::Binary(BinaryOp::MatMul);
        assert_eq!(infer_one(op(), &[f32(&[2, 3]), f32(&[3, 4])]).unwrap(), vec![2, 4]);
        assert_eq!(infer_one(op(), &[f32(&[3]), f32(&[3, 4])]).unwrap(), vec![4]);
        assert_eq!(infer_one(op(), &[f32(&[5, 2, 3]), f32(&[3])]).unwrap(), vec![5, 2]);
        assert_eq!(infer_one(op(), &[f32(&[3]), f32(&[3])]).unwrap(), vec![1]);
        assert_eq!(
            infer_one(op(), &[f32(&[1, 2, 3]), f32(&[6, 3, 4])]).unwrap(),
            vec![6, 2, 4]
        );
        assert!(infer_one(op(), &[f32(&[2, 3]), f32(&[4, 5])]).is_err());
    }

    #[test]
    fn conv2d_output_follows_window_formula() {
        let mut options = Conv2dOptions::<InputSlot> {
            padding: Some(vec![1, 1, 1, 1]),
            strides: Some(vec![2, 2]),
            ..Conv2dOptions::default()
        };
        let out = conv2d(&mut options, &[f32(&[1, 3, 7, 7]), f32(&[8, 3, 3, 3])]).unwrap();
        assert_eq!(out.dimensions, vec![1, 8, 4, 4]);
        assert_eq!(options.dilations, Some(vec![1, 1]));
    }

    #[test]
    fn conv2d_same_upper_keeps_spatial_extent() {
        let mut options = Conv2dOptions::<InputSlot> {
            auto_pad: AutoPad::SameUpper,
            input_layout: InputOperandLayout::Nhwc,
            filter_layout: FilterOperandLayout::Hwio,
            ..Conv2dOptions::default()
        };
        let out = conv2d(&mut options, &[f32(&[1, 5, 5, 2]), f32(&[3, 3, 2, 4])]).unwrap();
        assert_eq!(out.dimensions, vec![1, 5, 5, 4]);
        assert_eq!(options.padding, Some(vec![1, 1, 1, 1]));
        assert_eq!(options.auto_pad, AutoPad::Explicit);
    }

    #[test]
    fn conv2d_checks_groups_and_bias() {
        let mut grouped = Conv2dOptions::<InputSlot> {
            groups: 2,
            ..Conv2dOptions::default()
        };
        assert!(conv2d(&mut grouped, &[f32(&[1, 4, 5, 5]), f32(&[6, 2, 3, 3])]).is_ok());
        let mut bad_groups = Conv2dOptions::<InputSlot>::default();
        assert!(conv2d(&mut bad_groups, &[f32(&[1, 4, 5, 5]), f32(&[6, 2, 3, 3])]).is_err());
        let mut bad_bias = Conv2dOptions::<InputSlot> {
            bias: Some(2),
            ..Conv2dOptions::default()
        };
        let inputs = [f32(&[1, 2, 5, 5]), f32(&[6, 2, 3, 3]), f32(&[5])];
        assert!(conv2d(&mut bad_bias, &inputs).is_err());
    }

    #[test]
    fn conv2d_rejects_windows_larger_than_input() {
        let mut options = Conv2dOptions::<InputSlot>::default();
        assert!(conv2d(&mut options, &[f32(&[1, 1, 2, 2]), f32(&[1, 1, 3, 3])]).is_err());
    }

    #[test]
    fn conv_transpose2d_grows_the_input() {
        let mut options = ConvTranspose2dOptions::<InputSlot> {
            strides: Some(vec![2, 2]),
            output_padding: Some(vec![1, 1]),
            ..ConvTranspose2dOptions::default()
        };
        let out = conv_transpose2d(&mut options, &[f32(&[1, 3, 4, 4]), f32(&[3, 2, 3, 3])]).unwrap();
        // (4 - 1) * 2 + 3 + 1
        assert_eq!(out.dimensions, vec![1, 2, 10, 10]);

        let mut sized = ConvTranspose2dOptions::<InputSlot> {
            output_sizes: Some(vec![9, 9]),
            strides: Some(vec![2, 2]),
            ..ConvTranspose2dOptions::default()
        };
        let out = conv_transpose2d(&mut sized, &[f32(&[1, 3, 4, 4]), f32(&[3, 2, 3, 3])]).unwrap();
        assert_eq!(out.dimensions, vec![1, 2, 9, 9]);
    }

    #[test]
    fn pool2d_defaults_to_global_window() {
        let out = infer_one(
            Operator::Pool2d(Pool2dKind::Average, Pool2dOptions::default()),
            &[f32(&[1, 3, 7, 5])],
        );
        assert_eq!(out.unwrap(), vec![1, 3, 1, 1]);
    }

    #[test]
    fn pool2d_ceil_rounding_adds_partial_window() {
        let options = Pool2dOptions {
            window_dimensions: Some(vec![2, 2]),
            strides: Some(vec![2, 2]),
            rounding_type: RoundingType::Ceil,
            ..Pool2dOptions::default()
        };
        let out = infer_one(Operator::Pool2d(Pool2dKind::Max, options), &[f32(&[1, 1, 5, 5])]);
        assert_eq!(out.unwrap(), vec![1, 1, 3, 3]);
    }

    #[test]
    fn gru_reports_sequence_output_when_requested() {
        let mut op = Operator::Gru {
            steps: 4,
            hidden_size: 5,
            options: GruOptions {
                return_sequence: true,
                direction: super::super::options::RecurrentNetworkDirection::Both,
                ..GruOptions::default()
            },
        };
        let outs = infer(
            &mut op,
            &[f32(&[4, 2, 3]), f32(&[2, 15, 3]), f32(&[2, 15, 5])],
        )
        .unwrap();
        assert_eq!(outs.len(), 2);
        assert_eq!(outs[0].dimensions, vec![2, 2, 5]);
        assert_eq!(outs[1].dimensions, vec![4, 2, 2, 5]);
    }

    #[test]
    fn gru_rejects_step_mismatch() {
        let op = Operator::Gru {
            steps: 3,
            hidden_size: 5,
            options: GruOptions::default(),
        };
        assert!(infer_one(op, &[f32(&[4, 2, 3]), f32(&[1, 15, 3]), f32(&[1, 15, 5])]).is_err());
    }

    #[test]
    fn reshape_infers_a_single_wildcard() {
        let op = |shape: Vec<i32>| Operator::Reshape { new_shape: shape };
        assert_eq!(infer_one(op(vec![3, -1]), &[f32(&[2, 3, 4])]).unwrap(), vec![3, 8]);
        assert!(infer_one(op(vec![-1, -1]), &[f32(&[2, 3])]).is_err());
        assert!(infer_one(op(vec![0, 6]), &[f32(&[2, 3])]).is_err());
        assert!(infer_one(op(vec![4, -1]), &[f32(&[2, 3])]).is_err());
        assert!(infer_one(op(vec![5]), &[f32(&[2, 3])]).is_err());
    }

    #[test]
    fn transpose_requires_a_full_permutation() {
        let op = |perm: Option<Vec<i32>>| Operator::Transpose(TransposeOptions { permutation: perm });
        assert_eq!(infer_one(op(None), &[f32(&[2, 3, 4])]).unwrap(), vec![4, 3, 2]);
        assert_eq!(
            infer_one(op(Some(vec![1, 2, 0])), &[f32(&[2, 3, 4])]).unwrap(),
            vec![3, 4, 2]
        );
        assert!(infer_one(op(Some(vec![2, 0, 1, 3])), &[f32(&[2, 3, 4])]).is_err());
        assert!(infer_one(op(Some(vec![0, 0, 1])), &[f32(&[2, 3, 4])]).is_err());
    }

    #[test]
    fn split_even_and_explicit() {
        let mut even = Operator::Split {
            splits: vec![3],
            options: SplitOptions { axis: -1 },
        };
        let outs = infer(&mut even, &[f32(&[2, 6])]).unwrap();
        assert_eq!(outs.len(), 3);
        assert!(outs.iter().all(|d| d.dimensions == vec![2, 2]));

        let mut explicit = Operator::Split {
            splits: vec![1, 5],
            options: SplitOptions { axis: 1 },
        };
        let outs = infer(&mut explicit, &[f32(&[2, 6])]).unwrap();
        assert_eq!(outs[1].dimensions, vec![2, 5]);

        let mut uneven = Operator::Split {
            splits: vec![4],
            options: SplitOptions { axis: 1 },
        };
        assert!(infer(&mut uneven, &[f32(&[2, 6])]).is_err());
    }

    #[test]
    fn split_count_is_bounded_by_the_axis() {
        let split = |count: u32| Operator::Split {
            splits: vec![count],
            options: SplitOptions { axis: 0 },
        };
        assert!(infer(&mut split(u32::MAX), &[f32(&[4])]).is_err());
        assert!(infer(&mut split(8), &[f32(&[4])]).is_err());
        assert!(infer(&mut split(1), &[f32(&[0, 3])]).is_err());
        assert_eq!(infer(&mut split(4), &[f32(&[4])]).unwrap().len(), 4);
    }

    #[test]
    fn squeeze_removes_unit_dimensions() {
        let op = |axes: Option<Vec<i32>>| Operator::Squeeze(SqueezeOptions { axes });
        assert_eq!(infer_one(op(None), &[f32(&[1, 3, 1, 2])]).unwrap(), vec![3, 2]);
        assert_eq!(infer_one(op(Some(vec![-2])), &[f32(&[1, 3, 1, 2])]).unwrap(), vec![1, 3, 2]);
        assert_eq!(infer_one(op(None), &[f32(&[1, 1])]).unwrap(), vec![1]);
        assert!(infer_one(op(Some(vec![1])), &[f32(&[1, 3])]).is_err());
    }

    #[test]
    fn slice_wraps_starts_and_expands_sizes() {
        let mut op = Operator::Slice {
            starts: vec![-2, 1],
            sizes: vec![-1, 2],
            options: SliceOptions::default(),
        };
        let outs = infer(&mut op, &[f32(&[5, 4])]).unwrap();
        assert_eq!(outs[0].dimensions, vec![2, 2]);
        let Operator::Slice { starts, sizes, .. } = op else { unreachable!() };
        assert_eq!(starts, vec![3, 1]);
        assert_eq!(sizes, vec![2, 2]);
    }

    #[test]
    fn reduce_handles_axes_and_arg_types() {
        let op = |reduce: ReduceOp, axes: Option<Vec<i32>>, keep: bool| {
            Operator::Reduce(reduce, ReduceOptions { axes, keep_dimensions: keep })
        };
        assert_eq!(infer_one(op(ReduceOp::Sum, None, false), &[f32(&[2, 3])]).unwrap(), vec![1]);
        assert_eq!(
            infer_one(op(ReduceOp::Mean, Some(vec![-1]), true), &[f32(&[2, 3])]).unwrap(),
            vec![2, 1]
        );
        assert!(infer_one(op(ReduceOp::Max, Some(vec![0, 0]), false), &[f32(&[2, 3])]).is_err());
        let mut arg = op(ReduceOp::ArgMax, Some(vec![1]), false);
        let outs = infer(&mut arg, &[f32(&[2, 3])]).unwrap();
        assert_eq!(outs[0].ty, OperandType::Int32);
    }

    #[test]
    fn pad_bounds_depend_on_mode() {
        let op = |mode: PaddingMode, padding: Vec<u32>| Operator::Pad {
            padding,
            options: PadOptions { mode, value: 0.0 },
        };
        assert_eq!(
            infer_one(op(PaddingMode::Constant, vec![1, 2, 0, 3]), &[f32(&[2, 2])]).unwrap(),
            vec![5, 5]
        );
        assert!(infer_one(op(PaddingMode::Reflection, vec![2, 0, 0, 0]), &[f32(&[2, 2])]).is_err());
        assert!(infer_one(op(PaddingMode::Symmetric, vec![2, 0, 0, 0]), &[f32(&[2, 2])]).is_ok());
        assert!(infer_one(op(PaddingMode::Constant, vec![1, 1]), &[f32(&[2, 2])]).is_err());
    }

    #[test]
    fn resample2d_prefers_sizes_over_scales() {
        let options = Resample2dOptions {
            scales: Some(vec![2.0, 2.0]),
            sizes: Some(vec![3, 5]),
            ..Resample2dOptions::default()
        };
        assert_eq!(
            infer_one(Operator::Resample2d(options), &[f32(&[1, 1, 2, 2])]).unwrap(),
            vec![1, 1, 3, 5]
        );
        let scaled = Resample2dOptions {
            scales: Some(vec![2.0, 0.5]),
            ..Resample2dOptions::default()
        };
        assert_eq!(
            infer_one(Operator::Resample2d(scaled), &[f32(&[1, 1, 2, 4])]).unwrap(),
            vec![1, 1, 4, 2]
        );
        let bad_axes = Resample2dOptions {
            axes: Some(vec![0, 2]),
            ..Resample2dOptions::default()
        };
        assert!(infer_one(Operator::Resample2d(bad_axes), &[f32(&[1, 1, 2, 2])]).is_err());
    }

    #[test]
    fn gemm_checks_c_broadcast() {
        let op = |c: Option<InputSlot>| {
            Operator::Gemm(GemmOptions {
                c,
                b_transpose: true,
                ..GemmOptions::default()
            })
        };
        let inputs = [f32(&[2, 3]), f32(&[4, 3]), f32(&[4])];
        assert_eq!(infer_one(op(Some(2)), &inputs).unwrap(), vec![2, 4]);
        let bad = [f32(&[2, 3]), f32(&[4, 3]), f32(&[3])];
        assert!(infer_one(op(Some(2)), &bad).is_err());
    }

    #[test]
    fn concat_sums_the_axis() {
        let op = |axis| Operator::Concat { axis };
        assert_eq!(
            infer_one(op(1), &[f32(&[2, 3]), f32(&[2, 5])]).unwrap(),
            vec![2, 8]
        );
        assert!(infer_one(op(2), &[f32(&[2, 3]), f32(&[2, 5])]).is_err());
        assert!(infer_one(op(0), &[f32(&[2, 3]), f32(&[2, 5])]).is_err());
        assert!(infer_one(op(0), &[]).is_err());
    }

    #[test]
    fn constant_and_input_check_descriptors() {
        let desc = f32(&[2, 2]);
        let good = Operator::Constant {
            desc: desc.clone(),
            data: vec![0u8; 16].into(),
        };
        assert!(infer_one(good, &[]).is_ok());
        let short = Operator::Constant {
            desc,
            data: vec![0u8; 12].into(),
        };
        assert!(infer_one(short, &[]).is_err());
        let unnamed = Operator::Input {
            name: String::new(),
            desc: f32(&[1]),
        };
        assert!(infer_one(unnamed, &[]).is_err());
        let negative = Operator::Input {
            name: "x".into(),
            desc: f32(&[-1, 2]),
        };
        assert!(infer_one(negative, &[]).is_err());
    }

    #[test]
    fn clamp_rejects_inverted_bounds() {
        let op = Operator::Clamp(super::super::options::ClampOptions {
            min_value: 1.0,
            max_value: -1.0,
        });
        assert!(infer_one(op, &[f32(&[2])]).is_err());
    }
}
