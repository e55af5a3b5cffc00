use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use nnwire::graph::options::{Conv2dOptions, FusedActivation, ReduceOptions, SplitOptions};
use nnwire::{
    Backend, Context, GraphBuilder, NamedInputs, NamedOperands, Operand, OperandDescriptor,
    Tensor,
};

fn context_for<B: Backend + 'static>(backend: &Arc<B>) -> Context {
    Context::new(Arc::clone(backend) as Arc<dyn Backend>)
}

fn constant(builder: &mut GraphBuilder, dims: &[i32], values: &[f32]) -> Operand {
    builder.constant(
        &OperandDescriptor::float32(dims.to_vec()),
        bytemuck::cast_slice(values),
    )
}

/// Builds `outputs` into a graph, runs it once, and returns output `name` as `f32`s.
fn compute_f32(
    builder: &GraphBuilder,
    outputs: &NamedOperands,
    inputs: &NamedInputs,
    name: &str,
) -> anyhow::Result<Vec<f32>> {
    let graph = builder.build(outputs).context("building graph")?;
    let results = graph.compute(inputs).context("computing graph")?;
    let tensor = results
        .get(name)
        .ok_or_else(|| anyhow!("output `{name}` missing"))?;
    tensor
        .to_f32()
        .ok_or_else(|| anyhow!("output `{name}` is not float32"))
}

pub fn relu_clears_negative_values<B: Backend + 'static>(backend: &Arc<B>) -> anyhow::Result<()> {
    let context = context_for(backend);
    let mut builder = context.create_graph_builder();
    let x = builder.input("x", &OperandDescriptor::float32(vec![4]));
    let y = builder.relu(x);

    let mut outputs = NamedOperands::new();
    outputs.set("y", y);
    let mut inputs = NamedInputs::new();
    inputs.set("x", Tensor::from_f32(vec![4], &[-1.0, 0.0, 2.0, -3.0]));

    let values = compute_f32(&builder, &outputs, &inputs, "y")?;
    assert_eq!(values, vec![0.0, 0.0, 2.0, 0.0]);
    Ok(())
}

pub fn matmul_matches_expected<B: Backend + 'static>(backend: &Arc<B>) -> anyhow::Result<()> {
    let context = context_for(backend);
    let mut builder = context.create_graph_builder();
    let a = builder.input("a", &OperandDescriptor::float32(vec![2, 2]));
    let b = constant(&mut builder, &[2, 2], &[5.0, 6.0, 7.0, 8.0]);
    let c = builder.matmul(a, b);

    let mut outputs = NamedOperands::new();
    outputs.set("c", c);
    let mut inputs = NamedInputs::new();
    inputs.set("a", Tensor::from_f32(vec![2, 2], &[1.0, 2.0, 3.0, 4.0]));

    let values = compute_f32(&builder, &outputs, &inputs, "c")?;
    assert_eq!(values, vec![19.0, 22.0, 43.0, 50.0]);
    Ok(())
}

pub fn conv2d_applies_bias_and_relu<B: Backend + 'static>(backend: &Arc<B>) -> anyhow::Result<()> {
    let context = context_for(backend);
    let mut builder = context.create_graph_builder();
    let input = builder.input("image", &OperandDescriptor::float32(vec![1, 1, 3, 3]));
    let filter = constant(&mut builder, &[1, 1, 2, 2], &[1.0; 4]);
    let bias = constant(&mut builder, &[1], &[-20.0]);
    let options = Conv2dOptions {
        bias: Some(bias),
        activation: Some(FusedActivation::Relu),
        ..Conv2dOptions::default()
    };
    let output = builder.conv2d(input, filter, &options);

    let mut outputs = NamedOperands::new();
    outputs.set("features", output);
    let mut inputs = NamedInputs::new();
    let pixels: Vec<f32> = (1..=9).map(|v| v as f32).collect();
    inputs.set("image", Tensor::from_f32(vec![1, 1, 3, 3], &pixels));

    let values = compute_f32(&builder, &outputs, &inputs, "features")?;
    assert_eq!(values, vec![0.0, 0.0, 4.0, 8.0]);
    Ok(())
}

pub fn split_then_concat_reorders_halves<B: Backend + 'static>(
    backend: &Arc<B>,
) -> anyhow::Result<()> {
    let context = context_for(backend);
    let mut builder = context.create_graph_builder();
    let x = builder.input("x", &OperandDescriptor::float32(vec![2, 2]));
    let halves = builder.split(x, &[2], &SplitOptions { axis: -1 });
    assert_eq!(halves.len(), 2);
    let left = halves.get(0).ok_or_else(|| anyhow!("missing left half"))?;
    let right = halves.get(1).ok_or_else(|| anyhow!("missing right half"))?;
    let swapped = builder.concat(&[right, left], 1);

    let mut outputs = NamedOperands::new();
    outputs.set("swapped", swapped);
    let mut inputs = NamedInputs::new();
    inputs.set("x", Tensor::from_f32(vec![2, 2], &[1.0, 2.0, 3.0, 4.0]));

    let values = compute_f32(&builder, &outputs, &inputs, "swapped")?;
    assert_eq!(values, vec![2.0, 1.0, 4.0, 3.0]);
    Ok(())
}

pub fn reduce_mean_keeps_dimensions<B: Backend + 'static>(backend: &Arc<B>) -> anyhow::Result<()> {
    let context = context_for(backend);
    let mut builder = context.create_graph_builder();
    let x = builder.input("x", &OperandDescriptor::float32(vec![2, 3]));
    let options = ReduceOptions {
        axes: Some(vec![-1]),
        keep_dimensions: true,
    };
    let mean = builder.reduce_mean(x, &options);
    assert_eq!(
        builder.descriptor(mean).map(|desc| desc.dimensions.clone()),
        Some(vec![2, 1])
    );

    let mut outputs = NamedOperands::new();
    outputs.set("mean", mean);
    let mut inputs = NamedInputs::new();
    inputs.set("x", Tensor::from_f32(vec![2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]));

    let values = compute_f32(&builder, &outputs, &inputs, "mean")?;
    assert_eq!(values, vec![2.0, 5.0]);
    Ok(())
}

/// Operators that no output depends on must not reach the backend, so an
/// unsupported operator on a dead branch does not fail the build.
pub fn unused_branches_are_not_compiled<B: Backend + 'static>(
    backend: &Arc<B>,
) -> anyhow::Result<()> {
    let context = context_for(backend);
    let mut builder = context.create_graph_builder();
    let x = builder.input("x", &OperandDescriptor::float32(vec![1, 1, 2, 2]));
    let _dead = builder.resample2d(x, &Default::default());
    let y = builder.neg(x);

    let mut outputs = NamedOperands::new();
    outputs.set("y", y);
    let mut inputs = NamedInputs::new();
    inputs.set("x", Tensor::from_f32(vec![1, 1, 2, 2], &[1.0, -2.0, 3.0, -4.0]));

    let values = compute_f32(&builder, &outputs, &inputs, "y")?;
    assert_eq!(values, vec![-1.0, 2.0, -3.0, 4.0]);
    Ok(())
}
