use std::sync::Arc;

use smallvec::SmallVec;

use crate::backend::spec::{OperandDescriptor, ValueInfo};
use crate::context::{Context, ErrorType};
use crate::error::BuildError;

use super::arena::{BuilderId, GraphArena, Operand, ValidationState};
use super::ops::{BinaryOp, Operator, Pool2dKind, ReduceOp, UnaryOp};
use super::options::{
    BatchNormOptions, ClampOptions, Conv2dOptions, ConvTranspose2dOptions, GemmOptions,
    GruOptions, InputSlot, InstanceNormOptions, LeakyReluOptions, PadOptions, Pool2dOptions,
    ReduceOptions, Resample2dOptions, SliceOptions, SplitOptions, SqueezeOptions,
    TransposeOptions,
};
use super::topology::{topological_sort, NodeId, TopologyError};
use super::validate;
use super::{Graph, NamedOperands, OperandArray};

/// Collects operand references for an operator: the fixed inputs first, then
/// any operand-valued options, which are rewritten to [`InputSlot`]s.
struct InputList {
    operands: SmallVec<[Operand; 4]>,
}

impl InputList {
    fn new(fixed: &[Operand]) -> Self {
        Self {
            operands: fixed.iter().copied().collect(),
        }
    }

    fn slot(&mut self, operand: &Operand) -> InputSlot {
        self.operands.push(*operand);
        self.operands.len() - 1
    }
}

/// Records operators, validating each one as it is added, and compiles the
/// reachable subgraph into a [`Graph`].
///
/// Invalid operators do not abort construction: they produce error operands
/// whose failure is reported to the context and that poison every operator
/// consuming them.
pub struct GraphBuilder {
    id: BuilderId,
    context: Context,
    arena: GraphArena,
    error: Option<String>,
    max_outputs: usize,
}

macro_rules! binary_methods {
    ($($method:ident => $op:ident),+ $(,)?) => {
        $(
            pub fn $method(&mut self, a: Operand, b: Operand) -> Operand {
                self.binary(BinaryOp::$op, a, b)
            }
        )+
    };
}

macro_rules! unary_methods {
    ($($method:ident => $op:ident),+ $(,)?) => {
        $(
            pub fn $method(&mut self, input: Operand) -> Operand {
                self.unary(UnaryOp::$op, input)
            }
        )+
    };
}

macro_rules! reduce_methods {
    ($($method:ident => $op:ident),+ $(,)?) => {
        $(
            pub fn $method(&mut self, input: Operand, options: &ReduceOptions) -> Operand {
                self.reduce(ReduceOp::$op, input, options)
            }
        )+
    };
}

impl GraphBuilder {
    pub(crate) fn new(context: Context) -> Self {
        Self {
            id: BuilderId::next(),
            context,
            arena: GraphArena::default(),
            error: None,
            max_outputs: crate::env::max_operator_outputs(),
        }
    }

    pub(crate) fn new_error(context: Context, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::new(context)
        }
    }

    pub fn id(&self) -> BuilderId {
        self.id
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Caps the results a single operator may declare. Operators above the
    /// limit become error nodes with one output.
    pub fn set_max_operator_outputs(&mut self, limit: usize) {
        self.max_outputs = limit.max(1);
    }

    pub fn max_operator_outputs(&self) -> usize {
        self.max_outputs
    }

    pub fn operator_count(&self) -> usize {
        self.arena.node_count()
    }

    /// Descriptor of a valid operand owned by this builder.
    pub fn descriptor(&self, operand: Operand) -> Option<&OperandDescriptor> {
        if operand.builder != self.id {
            return None;
        }
        self.arena.operand(operand.index)?.desc.as_ref()
    }

    /// Why `operand` is an error object, or `None` if it is valid.
    pub fn operand_error(&self, operand: Operand) -> Option<&str> {
        if operand.builder != self.id {
            return Some("operand belongs to a different graph builder");
        }
        self.arena.operand_error(operand.index)
    }

    pub fn is_error_operand(&self, operand: Operand) -> bool {
        self.operand_error(operand).is_some()
    }

    /// Adds an operator and returns its outputs.
    ///
    /// Error and foreign inputs poison the node without running validation. A
    /// failed node keeps the number of outputs its call declares, unless that
    /// number is over the per-operator limit.
    fn push(&mut self, mut op: Operator, inputs: InputList) -> SmallVec<[Operand; 2]> {
        let mut poisoned = None;
        let mut descs = Vec::with_capacity(inputs.operands.len());
        for operand in &inputs.operands {
            if operand.builder != self.id {
                poisoned = Some(format!(
                    "{}: input {operand} belongs to a different graph builder",
                    op.name()
                ));
                break;
            }
            match self.arena.operand(operand.index) {
                Some(record) => match &record.desc {
                    Some(desc) => descs.push(desc.clone()),
                    None => {
                        poisoned = Some(format!("{}: input {operand} is an error object", op.name()));
                        break;
                    }
                },
                None => {
                    poisoned = Some(format!("{}: input {operand} does not exist", op.name()));
                    break;
                }
            }
        }

        let indices = inputs
            .operands
            .iter()
            .map(|operand| operand.index)
            .collect::<SmallVec<[u32; 4]>>();
        let declared = op.output_count();
        if poisoned.is_none() && declared > self.max_outputs {
            let message = format!(
                "{}: {declared} outputs exceed the limit of {} per operator",
                op.name(),
                self.max_outputs
            );
            tracing::debug!(op = op.name(), declared, "too many outputs");
            self.context.report_error(ErrorType::Validation, message.clone());
            poisoned = Some(message);
        }
        let (state, outputs) = match poisoned {
            Some(message) => {
                tracing::debug!(op = op.name(), "{message}");
                (ValidationState::Error(message), Vec::new())
            }
            None => match validate::infer(&mut op, &descs) {
                Ok(outputs) => (ValidationState::Valid, outputs),
                Err(err) => {
                    let message = format!("{}: {err}", op.name());
                    tracing::debug!(op = op.name(), "validation failed: {err}");
                    self.context.report_error(ErrorType::Validation, message.clone());
                    (ValidationState::Error(message), Vec::new())
                }
            },
        };

        // Foreign inputs are not recorded as dependencies.
        let indices = if state.is_error() { SmallVec::new() } else { indices };
        let output_count = match &state {
            ValidationState::Valid => outputs.len(),
            _ if declared <= self.max_outputs => declared,
            _ => 1,
        }
        .max(1);
        let node = self
            .arena
            .push(op, indices, output_count)
            .expect("graph arena ran out of operand ids");
        let output_ids = self.arena.node(node).outputs.clone();
        for (index, desc) in output_ids.iter().zip(outputs) {
            self.arena.operand_mut(*index).desc = Some(desc);
        }
        self.arena.node_mut(node).state = state;
        output_ids
            .into_iter()
            .map(|index| Operand {
                builder: self.id,
                index,
            })
            .collect()
    }

    fn push_single(&mut self, op: Operator, inputs: InputList) -> Operand {
        self.push(op, inputs)[0]
    }

    /// An error operand standing in for output `index` of `array`, which the
    /// producing operator does not have. Returns `None` if `array` is not from
    /// this builder. Nothing is reported when the producer already failed.
    pub(crate) fn missing_output(&mut self, array: &OperandArray, index: usize) -> Option<Operand> {
        let first = array.iter().next().filter(|operand| operand.builder == self.id)?;
        let producer = self.arena.operand(first.index)?.producer;
        let producer = self.arena.node(producer);
        let op = producer.op.clone();
        let message = match &producer.state {
            ValidationState::Error(message) => message.clone(),
            _ => {
                let message = format!(
                    "{}: output {index} out of range ({} outputs)",
                    op.name(),
                    array.len()
                );
                self.context.report_error(ErrorType::Validation, message.clone());
                message
            }
        };
        let node = self
            .arena
            .push(op, SmallVec::new(), 1)
            .expect("graph arena ran out of operand ids");
        self.arena.node_mut(node).state = ValidationState::Error(message);
        Some(Operand {
            builder: self.id,
            index: self.arena.node(node).outputs[0],
        })
    }

    pub fn input(&mut self, name: impl Into<String>, desc: &OperandDescriptor) -> Operand {
        let op = Operator::Input {
            name: name.into(),
            desc: desc.clone(),
        };
        self.push_single(op, InputList::new(&[]))
    }

    pub fn constant(&mut self, desc: &OperandDescriptor, data: &[u8]) -> Operand {
        let op = Operator::Constant {
            desc: desc.clone(),
            data: Arc::from(data),
        };
        self.push_single(op, InputList::new(&[]))
    }

    pub fn binary(&mut self, op: BinaryOp, a: Operand, b: Operand) -> Operand {
        self.push_single(Operator::Binary(op), InputList::new(&[a, b]))
    }

    binary_methods! {
        add => Add,
        sub => Sub,
        mul => Mul,
        div => Div,
        max => Max,
        min => Min,
        pow => Pow,
        matmul => MatMul,
    }

    pub fn unary(&mut self, op: UnaryOp, input: Operand) -> Operand {
        self.push_single(Operator::Unary(op), InputList::new(&[input]))
    }

    unary_methods! {
        abs => Abs,
        ceil => Ceil,
        cos => Cos,
        exp => Exp,
        floor => Floor,
        hard_swish => HardSwish,
        log => Log,
        neg => Neg,
        relu => Relu,
        sigmoid => Sigmoid,
        sin => Sin,
        softmax => Softmax,
        tan => Tan,
        tanh => Tanh,
    }

    pub fn leaky_relu(&mut self, input: Operand, options: &LeakyReluOptions) -> Operand {
        self.push_single(Operator::LeakyRelu(*options), InputList::new(&[input]))
    }

    pub fn clamp(&mut self, input: Operand, options: &ClampOptions) -> Operand {
        self.push_single(Operator::Clamp(*options), InputList::new(&[input]))
    }

    pub fn conv2d(&mut self, input: Operand, filter: Operand, options: &Conv2dOptions) -> Operand {
        let mut inputs = InputList::new(&[input, filter]);
        let options = options.map_operands(|operand| inputs.slot(operand));
        self.push_single(Operator::Conv2d(options), inputs)
    }

    pub fn conv_transpose2d(
        &mut self,
        input: Operand,
        filter: Operand,
        options: &ConvTranspose2dOptions,
    ) -> Operand {
        let mut inputs = InputList::new(&[input, filter]);
        let options = options.map_operands(|operand| inputs.slot(operand));
        self.push_single(Operator::ConvTranspose2d(options), inputs)
    }

    pub fn pool2d(&mut self, kind: Pool2dKind, input: Operand, options: &Pool2dOptions) -> Operand {
        self.push_single(Operator::Pool2d(kind, options.clone()), InputList::new(&[input]))
    }

    pub fn average_pool2d(&mut self, input: Operand, options: &Pool2dOptions) -> Operand {
        self.pool2d(Pool2dKind::Average, input, options)
    }

    pub fn l2_pool2d(&mut self, input: Operand, options: &Pool2dOptions) -> Operand {
        self.pool2d(Pool2dKind::L2, input, options)
    }

    pub fn max_pool2d(&mut self, input: Operand, options: &Pool2dOptions) -> Operand {
        self.pool2d(Pool2dKind::Max, input, options)
    }

    pub fn batch_norm(
        &mut self,
        input: Operand,
        mean: Operand,
        variance: Operand,
        options: &BatchNormOptions,
    ) -> Operand {
        let mut inputs = InputList::new(&[input, mean, variance]);
        let options = options.map_operands(|operand| inputs.slot(operand));
        self.push_single(Operator::BatchNorm(options), inputs)
    }

    pub fn instance_norm(&mut self, input: Operand, options: &InstanceNormOptions) -> Operand {
        let mut inputs = InputList::new(&[input]);
        let options = options.map_operands(|operand| inputs.slot(operand));
        self.push_single(Operator::InstanceNorm(options), inputs)
    }

    pub fn gemm(&mut self, a: Operand, b: Operand, options: &GemmOptions) -> Operand {
        let mut inputs = InputList::new(&[a, b]);
        let options = options.map_operands(|operand| inputs.slot(operand));
        self.push_single(Operator::Gemm(options), inputs)
    }

    /// Returns the final hidden state and, with `return_sequence`, the per-step sequence.
    pub fn gru(
        &mut self,
        input: Operand,
        weight: Operand,
        recurrent_weight: Operand,
        steps: u32,
        hidden_size: u32,
        options: &GruOptions,
    ) -> OperandArray {
        let mut inputs = InputList::new(&[input, weight, recurrent_weight]);
        let options = options.map_operands(|operand| inputs.slot(operand));
        let op = Operator::Gru {
            steps,
            hidden_size,
            options,
        };
        OperandArray::new(self.push(op, inputs))
    }

    pub fn pad(&mut self, input: Operand, padding: &[u32], options: &PadOptions) -> Operand {
        let op = Operator::Pad {
            padding: padding.to_vec(),
            options: *options,
        };
        self.push_single(op, InputList::new(&[input]))
    }

    pub fn reduce(&mut self, op: ReduceOp, input: Operand, options: &ReduceOptions) -> Operand {
        self.push_single(Operator::Reduce(op, options.clone()), InputList::new(&[input]))
    }

    reduce_methods! {
        reduce_arg_max => ArgMax,
        reduce_arg_min => ArgMin,
        reduce_l1 => L1,
        reduce_l2 => L2,
        reduce_max => Max,
        reduce_mean => Mean,
        reduce_min => Min,
        reduce_product => Product,
        reduce_sum => Sum,
    }

    pub fn resample2d(&mut self, input: Operand, options: &Resample2dOptions) -> Operand {
        self.push_single(Operator::Resample2d(options.clone()), InputList::new(&[input]))
    }

    pub fn reshape(&mut self, input: Operand, new_shape: &[i32]) -> Operand {
        let op = Operator::Reshape {
            new_shape: new_shape.to_vec(),
        };
        self.push_single(op, InputList::new(&[input]))
    }

    pub fn slice(
        &mut self,
        input: Operand,
        starts: &[i32],
        sizes: &[i32],
        options: &SliceOptions,
    ) -> Operand {
        let op = Operator::Slice {
            starts: starts.to_vec(),
            sizes: sizes.to_vec(),
            options: options.clone(),
        };
        self.push_single(op, InputList::new(&[input]))
    }

    pub fn split(&mut self, input: Operand, splits: &[u32], options: &SplitOptions) -> OperandArray {
        let op = Operator::Split {
            splits: splits.to_vec(),
            options: *options,
        };
        OperandArray::new(self.push(op, InputList::new(&[input])))
    }

    pub fn squeeze(&mut self, input: Operand, options: &SqueezeOptions) -> Operand {
        self.push_single(Operator::Squeeze(options.clone()), InputList::new(&[input]))
    }

    pub fn transpose(&mut self, input: Operand, options: &TransposeOptions) -> Operand {
        self.push_single(Operator::Transpose(options.clone()), InputList::new(&[input]))
    }

    pub fn concat(&mut self, inputs: &[Operand], axis: u32) -> Operand {
        self.push_single(Operator::Concat { axis }, InputList::new(inputs))
    }

    /// Compiles the operators reachable from `outputs` into an executable graph.
    ///
    /// Failures are also reported to the context's error scopes.
    #[tracing::instrument(skip_all, fields(backend = %self.context.backend_name(), outputs = outputs.len()))]
    pub fn build(&self, outputs: &NamedOperands) -> Result<Graph, BuildError> {
        let result = self.build_graph(outputs);
        if let Err(err) = &result {
            tracing::debug!("build failed: {err}");
            self.context.report_error(err.error_type(), err.to_string());
        }
        result
    }

    fn build_graph(&self, outputs: &NamedOperands) -> Result<Graph, BuildError> {
        if let Some(message) = &self.error {
            return Err(BuildError::BuilderError(message.clone()));
        }
        if outputs.is_empty() {
            return Err(BuildError::EmptyGraph);
        }

        let mut roots = Vec::with_capacity(outputs.len());
        for (name, operand) in outputs.iter() {
            let record = (operand.builder == self.id)
                .then(|| self.arena.operand(operand.index))
                .flatten();
            let Some(record) = record else {
                return Err(BuildError::UnknownOperand {
                    name: name.to_string(),
                });
            };
            roots.push(record.producer);
        }

        let order = topological_sort(&self.arena, &roots).map_err(|err| match err {
            TopologyError::ErrorNode(node) => BuildError::ErrorObject(self.node_error(node)),
            TopologyError::Cycle(_) => BuildError::CyclicGraph,
        })?;

        let backend = self
            .context
            .backend()
            .ok_or_else(|| BuildError::BuilderError("context has no backend".to_string()))?;
        let mut graph = backend.create_graph()?;
        let mut inputs = Vec::new();
        for &node in &order {
            let binding = self.arena.binding(node);
            let operator = &self.arena.node(node).op;
            if let Operator::Input { name, desc } = operator {
                inputs.push((name.clone(), desc.clone()));
            }
            tracing::trace!(op = operator.name(), node = node.0, "adding operator");
            operator.add_to_graph(graph.as_mut(), &binding)?;
        }

        let mut output_values: Vec<(String, ValueInfo)> = Vec::with_capacity(outputs.len());
        for (name, operand) in outputs.iter() {
            let value = self.arena.output_value(operand.index);
            graph.add_output(name, &value)?;
            output_values.push((name.to_string(), value));
        }
        graph.finish()?;
        let compiled = graph.compile()?;
        tracing::debug!(operators = order.len(), "graph compiled");
        Ok(Graph::new(self.context.clone(), compiled, inputs, output_values))
    }

    fn node_error(&self, node: NodeId) -> String {
        match &self.arena.node(node).state {
            ValidationState::Error(message) => message.clone(),
            _ => format!("node {} is not valid", node.0),
        }
    }
}
