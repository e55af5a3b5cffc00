//! Operator option records.
//!
//! Options that reference operands are generic over the operand reference `T`:
//! callers pass [`Operand`]s, the wire carries object handles, and validated
//! operators store [`InputSlot`] indices into their node's input list.
//! After validation every optional array is populated with its resolved value.

use serde::{Deserialize, Serialize};

use super::arena::Operand;

/// Index into a node's input list.
pub type InputSlot = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AutoPad {
    #[default]
    Explicit,
    SameUpper,
    SameLower,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InputOperandLayout {
    #[default]
    Nchw,
    Nhwc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FilterOperandLayout {
    #[default]
    Oihw,
    Hwio,
    Ohwi,
    Ihwo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConvTranspose2dFilterOperandLayout {
    #[default]
    Iohw,
    Hwoi,
    Ohwi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RoundingType {
    #[default]
    Floor,
    Ceil,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PaddingMode {
    #[default]
    Constant,
    Edge,
    Reflection,
    Symmetric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InterpolationMode {
    #[default]
    NearestNeighbor,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RecurrentNetworkDirection {
    #[default]
    Forward,
    Backward,
    Both,
}

impl RecurrentNetworkDirection {
    pub fn num_directions(self) -> i32 {
        match self {
            RecurrentNetworkDirection::Both => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RecurrentNetworkWeightLayout {
    #[default]
    Zrn,
    Rzn,
}

/// Element-wise activation fused into the operator that produces a value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FusedActivation {
    Relu,
    Sigmoid,
    Tanh,
    HardSwish,
    Clamp { min_value: f32, max_value: f32 },
    LeakyRelu { alpha: f32 },
}

impl FusedActivation {
    pub fn name(&self) -> &'static str {
        match self {
            FusedActivation::Relu => "relu",
            FusedActivation::Sigmoid => "sigmoid",
            FusedActivation::Tanh => "tanh",
            FusedActivation::HardSwish => "hardSwish",
            FusedActivation::Clamp { .. } => "clamp",
            FusedActivation::LeakyRelu { .. } => "leakyRelu",
        }
    }

    pub fn apply(&self, x: f32) -> f32 {
        match *self {
            FusedActivation::Relu => x.max(0.0),
            FusedActivation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            FusedActivation::Tanh => x.tanh(),
            FusedActivation::HardSwish => x * (x + 3.0).clamp(0.0, 6.0) / 6.0,
            FusedActivation::Clamp {
                min_value,
                max_value,
            } => x.clamp(min_value, max_value),
            FusedActivation::LeakyRelu { alpha } => {
                if x < 0.0 {
                    alpha * x
                } else {
                    x
                }
            }
        }
    }
}

fn array_or<const N: usize>(values: &Option<Vec<i32>>, default: [i32; N]) -> [i32; N] {
    match values.as_deref() {
        Some(values) if values.len() == N => {
            let mut out = default;
            out.copy_from_slice(values);
            out
        }
        _ => default,
    }
}

/// Generates operand accessors and reference mapping for a generic option record.
macro_rules! operand_fields {
    ($ty:ident { operands: [$($op:ident),+ $(,)?], plain: [$($plain:ident),* $(,)?] $(,)? }) => {
        impl<T> $ty<T> {
            /// Operand references present in this record, in declaration order.
            pub fn operands(&self) -> impl Iterator<Item = &T> + '_ {
                std::iter::empty()$(.chain(self.$op.iter()))+
            }

            pub fn try_map_operands<U, E>(
                &self,
                mut f: impl FnMut(&T) -> Result<U, E>,
            ) -> Result<$ty<U>, E> {
                Ok($ty {
                    $($op: self.$op.as_ref().map(&mut f).transpose()?,)+
                    $($plain: self.$plain.clone(),)*
                })
            }

            pub fn map_operands<U>(&self, mut f: impl FnMut(&T) -> U) -> $ty<U> {
                match self.try_map_operands(|operand| {
                    Ok::<U, std::convert::Infallible>(f(operand))
                }) {
                    Ok(mapped) => mapped,
                    Err(never) => match never {},
                }
            }
        }
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conv2dOptions<T = Operand> {
    /// `[begin_height, end_height, begin_width, end_width]`, default zeros.
    pub padding: Option<Vec<i32>>,
    /// `[height, width]`, default ones.
    pub strides: Option<Vec<i32>>,
    pub dilations: Option<Vec<i32>>,
    pub auto_pad: AutoPad,
    pub groups: i32,
    pub input_layout: InputOperandLayout,
    pub filter_layout: FilterOperandLayout,
    pub bias: Option<T>,
    pub activation: Option<FusedActivation>,
}

impl<T> Default for Conv2dOptions<T> {
    fn default() -> Self {
        Self {
            padding: None,
            strides: None,
            dilations: None,
            auto_pad: AutoPad::Explicit,
            groups: 1,
            input_layout: InputOperandLayout::Nchw,
            filter_layout: FilterOperandLayout::Oihw,
            bias: None,
            activation: None,
        }
    }
}

operand_fields!(Conv2dOptions {
    operands: [bias],
    plain: [padding, strides, dilations, auto_pad, groups, input_layout, filter_layout, activation],
});

impl<T> Conv2dOptions<T> {
    pub fn padding(&self) -> [i32; 4] {
        array_or(&self.padding, [0; 4])
    }

    pub fn strides(&self) -> [i32; 2] {
        array_or(&self.strides, [1; 2])
    }

    pub fn dilations(&self) -> [i32; 2] {
        array_or(&self.dilations, [1; 2])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvTranspose2dOptions<T = Operand> {
    pub padding: Option<Vec<i32>>,
    pub strides: Option<Vec<i32>>,
    pub dilations: Option<Vec<i32>>,
    pub output_padding: Option<Vec<i32>>,
    /// Explicit `[height, width]` of the result; takes precedence over `output_padding`.
    pub output_sizes: Option<Vec<i32>>,
    pub auto_pad: AutoPad,
    pub groups: i32,
    pub input_layout: InputOperandLayout,
    pub filter_layout: ConvTranspose2dFilterOperandLayout,
    pub bias: Option<T>,
    pub activation: Option<FusedActivation>,
}

impl<T> Default for ConvTranspose2dOptions<T> {
    fn default() -> Self {
        Self {
            padding: None,
            strides: None,
            dilations: None,
            output_padding: None,
            output_sizes: None,
            auto_pad: AutoPad::Explicit,
            groups: 1,
            input_layout: InputOperandLayout::Nchw,
            filter_layout: ConvTranspose2dFilterOperandLayout::Iohw,
            bias: None,
            activation: None,
        }
    }
}

operand_fields!(ConvTranspose2dOptions {
    operands: [bias],
    plain: [
        padding,
        strides,
        dilations,
        output_padding,
        output_sizes,
        auto_pad,
        groups,
        input_layout,
        filter_layout,
        activation,
    ],
});

impl<T> ConvTranspose2dOptions<T> {
    pub fn padding(&self) -> [i32; 4] {
        array_or(&self.padding, [0; 4])
    }

    pub fn strides(&self) -> [i32; 2] {
        array_or(&self.strides, [1; 2])
    }

    pub fn dilations(&self) -> [i32; 2] {
        array_or(&self.dilations, [1; 2])
    }

    pub fn output_padding(&self) -> [i32; 2] {
        array_or(&self.output_padding, [0; 2])
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pool2dOptions {
    /// `[height, width]`; defaults to the full spatial extent of the input.
    pub window_dimensions: Option<Vec<i32>>,
    pub padding: Option<Vec<i32>>,
    pub strides: Option<Vec<i32>>,
    pub dilations: Option<Vec<i32>>,
    pub auto_pad: AutoPad,
    pub layout: InputOperandLayout,
    pub rounding_type: RoundingType,
    pub output_sizes: Option<Vec<i32>>,
}

impl Pool2dOptions {
    /// Window size; only meaningful after validation has filled the default.
    pub fn window_dimensions(&self) -> [i32; 2] {
        array_or(&self.window_dimensions, [1; 2])
    }

    pub fn padding(&self) -> [i32; 4] {
        array_or(&self.padding, [0; 4])
    }

    pub fn strides(&self) -> [i32; 2] {
        array_or(&self.strides, [1; 2])
    }

    pub fn dilations(&self) -> [i32; 2] {
        array_or(&self.dilations, [1; 2])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchNormOptions<T = Operand> {
    pub scale: Option<T>,
    pub bias: Option<T>,
    /// Channel axis, `1` for NCHW data or `3` for NHWC data.
    pub axis: i32,
    pub epsilon: f32,
    pub activation: Option<FusedActivation>,
}

impl<T> Default for BatchNormOptions<T> {
    fn default() -> Self {
        Self {
            scale: None,
            bias: None,
            axis: 1,
            epsilon: 1e-5,
            activation: None,
        }
    }
}

operand_fields!(BatchNormOptions {
    operands: [scale, bias],
    plain: [axis, epsilon, activation],
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceNormOptions<T = Operand> {
    pub scale: Option<T>,
    pub bias: Option<T>,
    pub epsilon: f32,
    pub layout: InputOperandLayout,
}

impl<T> Default for InstanceNormOptions<T> {
    fn default() -> Self {
        Self {
            scale: None,
            bias: None,
            epsilon: 1e-5,
            layout: InputOperandLayout::Nchw,
        }
    }
}

operand_fields!(InstanceNormOptions {
    operands: [scale, bias],
    plain: [epsilon, layout],
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GemmOptions<T = Operand> {
    pub c: Option<T>,
    pub alpha: f32,
    pub beta: f32,
    pub a_transpose: bool,
    pub b_transpose: bool,
}

impl<T> Default for GemmOptions<T> {
    fn default() -> Self {
        Self {
            c: None,
            alpha: 1.0,
            beta: 1.0,
            a_transpose: false,
            b_transpose: false,
        }
    }
}

operand_fields!(GemmOptions {
    operands: [c],
    plain: [alpha, beta, a_transpose, b_transpose],
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GruOptions<T = Operand> {
    pub bias: Option<T>,
    pub recurrent_bias: Option<T>,
    pub initial_hidden_state: Option<T>,
    pub reset_after: bool,
    pub return_sequence: bool,
    pub direction: RecurrentNetworkDirection,
    pub layout: RecurrentNetworkWeightLayout,
    /// Update/reset gate activation followed by the new-gate activation.
    pub activations: Option<Vec<FusedActivation>>,
}

impl<T> Default for GruOptions<T> {
    fn default() -> Self {
        Self {
            bias: None,
            recurrent_bias: None,
            initial_hidden_state: None,
            reset_after: true,
            return_sequence: false,
            direction: RecurrentNetworkDirection::Forward,
            layout: RecurrentNetworkWeightLayout::Zrn,
            activations: None,
        }
    }
}

operand_fields!(GruOptions {
    operands: [bias, recurrent_bias, initial_hidden_state],
    plain: [reset_after, return_sequence, direction, layout, activations],
});

impl<T> GruOptions<T> {
    /// Number of results a gru with these options produces.
    pub fn output_count(&self) -> usize {
        if self.return_sequence {
            2
        } else {
            1
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LeakyReluOptions {
    pub alpha: f32,
}

impl Default for LeakyReluOptions {
    fn default() -> Self {
        Self { alpha: 0.01 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClampOptions {
    pub min_value: f32,
    pub max_value: f32,
}

impl Default for ClampOptions {
    fn default() -> Self {
        Self {
            min_value: f32::MIN,
            max_value: f32::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PadOptions {
    pub mode: PaddingMode,
    pub value: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReduceOptions {
    /// Axes to reduce; negative values count from the back. Defaults to all axes.
    pub axes: Option<Vec<i32>>,
    pub keep_dimensions: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resample2dOptions {
    pub mode: InterpolationMode,
    pub scales: Option<Vec<f32>>,
    /// Target extents; take precedence over `scales`.
    pub sizes: Option<Vec<i32>>,
    /// Two consecutive axes, default `[2, 3]`.
    pub axes: Option<Vec<i32>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceOptions {
    pub axes: Option<Vec<i32>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitOptions {
    pub axis: i32,
}

/// Number of results a split with these `splits` produces.
pub fn split_output_count(splits: &[u32]) -> usize {
    match splits {
        [count] => *count as usize,
        _ => splits.len(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqueezeOptions {
    pub axes: Option<Vec<i32>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransposeOptions {
    pub permutation: Option<Vec<i32>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_operand_fields_and_keeps_attributes() {
        let options: BatchNormOptions<u32> = BatchNormOptions {
            scale: Some(7),
            bias: None,
            axis: 3,
            epsilon: 1e-3,
            activation: Some(FusedActivation::Relu),
        };
        let mapped = options.map_operands(|id| format!("operand-{id}"));
        assert_eq!(mapped.scale.as_deref(), Some("operand-7"));
        assert_eq!(mapped.bias, None);
        assert_eq!(mapped.axis, 3);
        assert_eq!(mapped.activation, Some(FusedActivation::Relu));
        assert_eq!(options.operands().collect::<Vec<_>>(), vec![&7]);
    }

    #[test]
    fn failed_mapping_short_circuits() {
        let options: GruOptions<u32> = GruOptions {
            bias: Some(1),
            recurrent_bias: Some(2),
            ..GruOptions::default()
        };
        let result = options.try_map_operands(|id| if *id == 2 { Err(*id) } else { Ok(*id) });
        assert_eq!(result.unwrap_err(), 2);
    }

    #[test]
    fn resolved_arrays_fall_back_to_defaults() {
        let conv: Conv2dOptions<u32> = Conv2dOptions {
            strides: Some(vec![2, 3]),
            ..Conv2dOptions::default()
        };
        assert_eq!(conv.strides(), [2, 3]);
        assert_eq!(conv.dilations(), [1, 1]);
        assert_eq!(conv.padding(), [0, 0, 0, 0]);
    }

    #[test]
    fn fused_activations_match_their_scalar_definitions() {
        assert_eq!(FusedActivation::Relu.apply(-2.0), 0.0);
        assert_eq!(FusedActivation::LeakyRelu { alpha: 0.5 }.apply(-2.0), -1.0);
        assert_eq!(FusedActivation::HardSwish.apply(3.0), 3.0);
        let clamp = FusedActivation::Clamp {
            min_value: -1.0,
            max_value: 1.0,
        };
        assert_eq!(clamp.apply(5.0), 1.0);
    }

    #[test]
    fn split_count_handles_even_and_explicit_forms() {
        assert_eq!(split_output_count(&[3]), 3);
        assert_eq!(split_output_count(&[1, 2, 3, 4]), 4);
        assert_eq!(split_output_count(&[]), 0);
    }
}
