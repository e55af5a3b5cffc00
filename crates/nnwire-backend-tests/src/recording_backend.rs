use std::sync::{Arc, Mutex};

use nnwire::backend::spec::{
    Backend, BackendResult, CompiledGraph, GraphCompiler, NodeBinding, ValueId, ValueInfo,
};
use nnwire::graph::ops::{BinaryOp, OperatorKind, Pool2dKind, ReduceOp, UnaryOp};
use nnwire::graph::options::{
    BatchNormOptions, ClampOptions, Conv2dOptions, ConvTranspose2dOptions, GemmOptions,
    GruOptions, InputSlot, InstanceNormOptions, LeakyReluOptions, PadOptions, Pool2dOptions,
    ReduceOptions, Resample2dOptions, SliceOptions, SplitOptions, SqueezeOptions,
    TransposeOptions,
};
use nnwire::{NamedInputs, NamedOutputs};

/// One operator as the backend received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedNode {
    pub kind: OperatorKind,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
}

#[derive(Debug, Default)]
struct Recording {
    nodes: Vec<RecordedNode>,
    outputs: Vec<(String, ValueId)>,
}

/// Test-only backend that records the latest graph handed to it and computes nothing.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    recording: Arc<Mutex<Recording>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Operators of the latest graph, in the order they were added.
    pub fn recorded_nodes(&self) -> Vec<RecordedNode> {
        self.recording
            .lock()
            .expect("backend mutex poisoned")
            .nodes
            .clone()
    }

    pub fn recorded_outputs(&self) -> Vec<(String, ValueId)> {
        self.recording
            .lock()
            .expect("backend mutex poisoned")
            .outputs
            .clone()
    }

    pub fn recorded_kinds(&self) -> Vec<OperatorKind> {
        self.recorded_nodes().iter().map(|node| node.kind).collect()
    }
}

impl Backend for RecordingBackend {
    fn backend_name(&self) -> &str {
        "recording"
    }

    fn create_graph(&self) -> BackendResult<Box<dyn GraphCompiler>> {
        let mut recording = self.recording.lock().expect("backend mutex poisoned");
        recording.nodes.clear();
        recording.outputs.clear();
        Ok(Box::new(RecordingCompiler {
            recording: Arc::clone(&self.recording),
        }))
    }
}

struct RecordingCompiler {
    recording: Arc<Mutex<Recording>>,
}

impl RecordingCompiler {
    fn record(&mut self, kind: OperatorKind, node: &NodeBinding) -> BackendResult<()> {
        let ids = |values: &[ValueInfo]| -> Vec<ValueId> {
            values.iter().map(|value| value.id).collect()
        };
        self.recording
            .lock()
            .expect("backend mutex poisoned")
            .nodes
            .push(RecordedNode {
                kind,
                inputs: ids(&node.inputs),
                outputs: ids(&node.outputs),
            });
        Ok(())
    }
}

macro_rules! record_operators {
    ($($method:ident($($arg:ident: $ty:ty),*) => $kind:ident;)+) => {
        $(
            fn $method(&mut self, node: &NodeBinding $(, $arg: $ty)*) -> BackendResult<()> {
                let _ = ($($arg,)*);
                self.record(OperatorKind::$kind, node)
            }
        )+
    };
}

impl GraphCompiler for RecordingCompiler {
    record_operators! {
        add_input(name: &str) => Input;
        add_constant(data: &[u8]) => Constant;
        add_binary(op: BinaryOp) => Binary;
        add_unary(op: UnaryOp) => Unary;
        add_leaky_relu(options: &LeakyReluOptions) => LeakyRelu;
        add_clamp(options: &ClampOptions) => Clamp;
        add_conv2d(options: &Conv2dOptions<InputSlot>) => Conv2d;
        add_conv_transpose2d(options: &ConvTranspose2dOptions<InputSlot>) => ConvTranspose2d;
        add_pool2d(kind: Pool2dKind, options: &Pool2dOptions) => Pool2d;
        add_batch_norm(options: &BatchNormOptions<InputSlot>) => BatchNorm;
        add_instance_norm(options: &InstanceNormOptions<InputSlot>) => InstanceNorm;
        add_gemm(options: &GemmOptions<InputSlot>) => Gemm;
        add_gru(steps: u32, hidden_size: u32, options: &GruOptions<InputSlot>) => Gru;
        add_pad(padding: &[u32], options: &PadOptions) => Pad;
        add_reduce(op: ReduceOp, options: &ReduceOptions) => Reduce;
        add_resample2d(options: &Resample2dOptions) => Resample2d;
        add_reshape(new_shape: &[i32]) => Reshape;
        add_slice(starts: &[i32], sizes: &[i32], options: &SliceOptions) => Slice;
        add_split(splits: &[u32], options: &SplitOptions) => Split;
        add_squeeze(options: &SqueezeOptions) => Squeeze;
        add_transpose(options: &TransposeOptions) => Transpose;
        add_concat(axis: u32) => Concat;
    }

    fn add_output(&mut self, name: &str, value: &ValueInfo) -> BackendResult<()> {
        self.recording
            .lock()
            .expect("backend mutex poisoned")
            .outputs
            .push((name.to_string(), value.id));
        Ok(())
    }

    fn compile(self: Box<Self>) -> BackendResult<Box<dyn CompiledGraph>> {
        Ok(Box::new(RecordedGraph))
    }
}

struct RecordedGraph;

impl CompiledGraph for RecordedGraph {
    fn compute(&self, _inputs: &NamedInputs) -> BackendResult<NamedOutputs> {
        Ok(NamedOutputs::new())
    }
}
