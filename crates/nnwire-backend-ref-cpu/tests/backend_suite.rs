use std::sync::Arc;

use nnwire::backend::registry;
use nnwire::backend::spec::OperandType;
use nnwire::graph::options::{BatchNormOptions, Pool2dOptions, TransposeOptions};
use nnwire::{
    BackendError, BuildError, Context, NamedInputs, NamedOperands, OperandDescriptor, Tensor,
};
use nnwire_backend_ref_cpu::{register_cpu_backend, CpuBackend};

nnwire_backend_tests::define_backend_tests!(cpu, || Arc::new(CpuBackend::new()));

fn cpu_context() -> Context {
    Context::new(Arc::new(CpuBackend::new()))
}

#[test]
fn registers_under_cpu() {
    register_cpu_backend();
    assert!(registry::has_backend("cpu"));
    let backend = registry::create_backend("cpu").expect("cpu backend registered");
    assert_eq!(backend.backend_name(), "cpu");
}

#[test]
fn float16_inputs_are_unimplemented() {
    let context = cpu_context();
    let mut builder = context.create_graph_builder();
    let x = builder.input("x", &OperandDescriptor::new(OperandType::Float16, vec![2]));
    let y = builder.abs(x);
    let mut outputs = NamedOperands::new();
    outputs.set("y", y);

    let err = builder.build(&outputs).unwrap_err();
    assert!(matches!(
        err,
        BuildError::Backend(BackendError::Unimplemented { op: "input", .. })
    ));
}

#[test]
fn transposed_int32_constant_round_trips_through_compute() -> anyhow::Result<()> {
    let context = cpu_context();
    let mut builder = context.create_graph_builder();
    let desc = OperandDescriptor::new(OperandType::Int32, vec![2, 3]);
    let data = Tensor::from_i32(vec![2, 3], &[0, 1, 2, 3, 4, 5]).data;
    let c = builder.constant(&desc, &data);
    let t = builder.transpose(c, &TransposeOptions::default());
    let mut outputs = NamedOperands::new();
    outputs.set("t", t);

    let graph = builder.build(&outputs)?;
    let results = graph.compute(&NamedInputs::new())?;
    let tensor = results.get("t").expect("output present");
    assert_eq!(tensor.desc.dimensions, vec![3, 2]);
    assert_eq!(tensor.to_i32(), Some(vec![0, 3, 1, 4, 2, 5]));
    Ok(())
}

#[test]
fn global_max_pool_and_batch_norm_chain() -> anyhow::Result<()> {
    let context = cpu_context();
    let mut builder = context.create_graph_builder();
    let x = builder.input("x", &OperandDescriptor::float32(vec![1, 2, 2, 2]));
    let mean = builder.constant(
        &OperandDescriptor::float32(vec![2]),
        &Tensor::from_f32(vec![2], &[1.0, 2.0]).data,
    );
    let variance = builder.constant(
        &OperandDescriptor::float32(vec![2]),
        &Tensor::from_f32(vec![2], &[1.0, 1.0]).data,
    );
    let normalized = builder.batch_norm(
        x,
        mean,
        variance,
        &BatchNormOptions {
            epsilon: 0.0,
            ..BatchNormOptions::default()
        },
    );
    let pooled = builder.max_pool2d(normalized, &Pool2dOptions::default());
    assert_eq!(
        builder.descriptor(pooled).map(|d| d.dimensions.clone()),
        Some(vec![1, 2, 1, 1])
    );
    let mut outputs = NamedOperands::new();
    outputs.set("pooled", pooled);

    let mut inputs = NamedInputs::new();
    inputs.set(
        "x",
        Tensor::from_f32(vec![1, 2, 2, 2], &[1.0, 4.0, 2.0, 3.0, 5.0, 2.0, 9.0, 0.0]),
    );
    let graph = builder.build(&outputs)?;
    let results = graph.compute(&inputs)?;
    let pooled = results.get("pooled").and_then(Tensor::to_f32);
    assert_eq!(pooled, Some(vec![3.0, 7.0]));
    Ok(())
}
