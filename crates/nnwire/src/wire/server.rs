//! Server half of a connection: decodes commands and replays them against
//! local [`Context`]s, builders and graphs.

use std::sync::{Arc, Mutex};

use crate::context::{Context, ErrorReport, ErrorType};
use crate::env::WireConfig;
use crate::graph::{Graph, GraphBuilder, NamedOperands, Operand, OperandArray};
use crate::tensor::NamedInputs;

use super::command::{decode_payload, encode_frame, Command, FrameReader, ReturnCommand};
use super::handle::{ObjectHandle, ObjectType};
use super::registry::ObjectRegistry;
use super::serializer::CommandSerializer;
use super::WireError;

/// Maps a backend name from `CreateContext` to a context.
pub type BackendResolver = Box<dyn Fn(&str) -> Context>;

fn resolve_from_registry(name: &str) -> Context {
    Context::from_registry(name).unwrap_or_else(|| {
        tracing::debug!(backend = name, "backend not registered");
        Context::unavailable(name)
    })
}

struct ServerArray {
    builder: ObjectHandle,
    operands: OperandArray,
}

/// Server end of one connection.
///
/// Any error returned by [`Server::handle_commands`] terminates the connection.
pub struct Server {
    config: WireConfig,
    resolver: BackendResolver,
    returns: Box<dyn CommandSerializer>,
    pending: Arc<Mutex<Vec<ReturnCommand>>>,
    terminated: bool,
    contexts: ObjectRegistry<Context>,
    builders: ObjectRegistry<GraphBuilder>,
    operands: ObjectRegistry<Operand>,
    arrays: ObjectRegistry<ServerArray>,
    named_operands: ObjectRegistry<NamedOperands>,
    named_inputs: ObjectRegistry<NamedInputs>,
    // `None` marks a graph whose build failed.
    graphs: ObjectRegistry<Option<Graph>>,
}

impl Server {
    /// Creates a server that writes return commands to `returns` and resolves
    /// backends through the global backend registry.
    pub fn new(returns: impl CommandSerializer + 'static) -> Self {
        Self::with_config(returns, WireConfig::from_env())
    }

    pub fn with_config(returns: impl CommandSerializer + 'static, config: WireConfig) -> Self {
        Self {
            config,
            resolver: Box::new(resolve_from_registry),
            returns: Box::new(returns),
            pending: Arc::new(Mutex::new(Vec::new())),
            terminated: false,
            contexts: ObjectRegistry::new(),
            builders: ObjectRegistry::new(),
            operands: ObjectRegistry::new(),
            arrays: ObjectRegistry::new(),
            named_operands: ObjectRegistry::new(),
            named_inputs: ObjectRegistry::new(),
            graphs: ObjectRegistry::new(),
        }
    }

    pub fn with_backend_resolver<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&str) -> Context + 'static,
    {
        self.resolver = Box::new(resolver);
        self
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn live_objects(&self, object_type: ObjectType) -> usize {
        match object_type {
            ObjectType::Context => self.contexts.len(),
            ObjectType::GraphBuilder => self.builders.len(),
            ObjectType::Operand => self.operands.len(),
            ObjectType::OperandArray => self.arrays.len(),
            ObjectType::NamedOperands => self.named_operands.len(),
            ObjectType::NamedInputs => self.named_inputs.len(),
            ObjectType::Graph => self.graphs.len(),
        }
    }

    /// Decodes and executes every frame in `bytes`, strictly in order.
    ///
    /// The first malformed frame or unresolvable handle stops processing and
    /// terminates the connection; later calls fail with [`WireError::Terminated`].
    pub fn handle_commands(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        if self.terminated {
            return Err(WireError::Terminated);
        }
        let result = self.process(bytes);
        self.flush_returns();
        if let Err(err) = &result {
            tracing::error!("terminating connection: {err}");
            self.terminated = true;
        }
        result
    }

    fn process(&mut self, bytes: &[u8]) -> Result<(), WireError> {
        for payload in FrameReader::new(bytes, self.config.max_command_bytes) {
            let command = decode_payload::<Command>(payload?)?;
            if self.config.trace_commands {
                tracing::trace!(opcode = ?command.opcode(), "dispatch");
            }
            self.execute(command)?;
            self.flush_returns();
        }
        Ok(())
    }

    fn flush_returns(&mut self) {
        let pending = std::mem::take(&mut *self.pending.lock().expect("return queue poisoned"));
        if pending.is_empty() {
            return;
        }
        for command in &pending {
            match encode_frame(command, self.config.max_command_bytes) {
                Ok(frame) => {
                    if !self.returns.serialize(&frame) {
                        tracing::warn!("return channel closed; dropping notification");
                    }
                }
                Err(err) => tracing::warn!("dropping return command: {err}"),
            }
        }
        self.returns.flush();
    }

    fn queue_return(&self, command: ReturnCommand) {
        self.pending
            .lock()
            .expect("return queue poisoned")
            .push(command);
    }

    fn context(&self, handle: ObjectHandle) -> Result<&Context, WireError> {
        self.contexts
            .resolve(handle)
            .map_err(WireError::registry(ObjectType::Context))
    }

    fn builder(&mut self, handle: ObjectHandle) -> Result<&mut GraphBuilder, WireError> {
        self.builders
            .resolve_mut(handle)
            .map_err(WireError::registry(ObjectType::GraphBuilder))
    }

    fn operand(&self, handle: ObjectHandle) -> Result<Operand, WireError> {
        self.operands
            .resolve(handle)
            .copied()
            .map_err(WireError::registry(ObjectType::Operand))
    }

    fn add_operand(&mut self, result: ObjectHandle, operand: Operand) -> Result<(), WireError> {
        self.operands
            .insert(result, operand)
            .map_err(WireError::registry(ObjectType::Operand))
    }

    fn add_array(
        &mut self,
        result: ObjectHandle,
        builder: ObjectHandle,
        operands: OperandArray,
    ) -> Result<(), WireError> {
        self.arrays
            .insert(result, ServerArray { builder, operands })
            .map_err(WireError::registry(ObjectType::OperandArray))
    }

    fn destroy(&mut self, object_type: ObjectType, id: u32) -> Result<(), WireError> {
        let freed = match object_type {
            ObjectType::Context => self.contexts.free_id(id).map(drop),
            ObjectType::GraphBuilder => self.builders.free_id(id).map(drop),
            ObjectType::Operand => self.operands.free_id(id).map(drop),
            ObjectType::OperandArray => self.arrays.free_id(id).map(drop),
            ObjectType::NamedOperands => self.named_operands.free_id(id).map(drop),
            ObjectType::NamedInputs => self.named_inputs.free_id(id).map(drop),
            ObjectType::Graph => self.graphs.free_id(id).map(drop),
        };
        freed.map_err(WireError::registry(object_type))
    }

    #[tracing::instrument(skip_all, fields(opcode = ?command.opcode()))]
    fn execute(&mut self, command: Command) -> Result<(), WireError> {
        match command {
            Command::DestroyObject { object_type, id } => self.destroy(object_type, id),
            Command::CreateContext { backend, result } => {
                let context = (self.resolver)(&backend);
                let pending = Arc::clone(&self.pending);
                context.set_uncaptured_error_callback(move |report| {
                    pending
                        .lock()
                        .expect("return queue poisoned")
                        .push(ReturnCommand::UncapturedError {
                            report: report.clone(),
                        });
                });
                self.contexts
                    .insert(result, context)
                    .map_err(WireError::registry(ObjectType::Context))
            }
            Command::ContextPushErrorScope { filter, context } => {
                self.context(context)?.push_error_scope(filter);
                Ok(())
            }
            Command::ContextPopErrorScope {
                request_serial,
                context,
            } => {
                let report = self.context(context)?.pop_error_scope().unwrap_or_else(|| {
                    ErrorReport::new(ErrorType::Validation, "no error scope to pop")
                });
                self.queue_return(ReturnCommand::ErrorScopePopped {
                    request_serial,
                    report,
                });
                Ok(())
            }
            Command::ContextCreateGraphBuilder { context, result } => {
                let mut builder = self.context(context)?.create_graph_builder();
                builder.set_max_operator_outputs(self.config.max_operator_outputs);
                self.builders
                    .insert(result, builder)
                    .map_err(WireError::registry(ObjectType::GraphBuilder))
            }
            Command::CreateNamedOperands { result } => self
                .named_operands
                .insert(result, NamedOperands::new())
                .map_err(WireError::registry(ObjectType::NamedOperands)),
            Command::NamedOperandsSet {
                name,
                named_operands,
                operand,
            } => {
                let operand = self.operand(operand)?;
                self.named_operands
                    .resolve_mut(named_operands)
                    .map_err(WireError::registry(ObjectType::NamedOperands))?
                    .set(name, operand);
                Ok(())
            }
            Command::CreateNamedInputs { result } => self
                .named_inputs
                .insert(result, NamedInputs::new())
                .map_err(WireError::registry(ObjectType::NamedInputs)),
            Command::NamedInputsSet {
                name,
                input,
                named_inputs,
            } => {
                self.named_inputs
                    .resolve_mut(named_inputs)
                    .map_err(WireError::registry(ObjectType::NamedInputs))?
                    .set(name, input);
                Ok(())
            }
            Command::BuilderInput {
                name,
                desc,
                builder,
                result,
            } => {
                let operand = self.builder(builder)?.input(name, &desc);
                self.add_operand(result, operand)
            }
            Command::BuilderConstant {
                desc,
                data,
                builder,
                result,
            } => {
                let operand = self.builder(builder)?.constant(&desc, &data);
                self.add_operand(result, operand)
            }
            Command::BuilderBinary {
                op,
                builder,
                a,
                b,
                result,
            } => {
                let a = self.operand(a)?;
                let b = self.operand(b)?;
                let operand = self.builder(builder)?.binary(op, a, b);
                self.add_operand(result, operand)
            }
            Command::BuilderUnary {
                op,
                builder,
                input,
                result,
            } => {
                let input = self.operand(input)?;
                let operand = self.builder(builder)?.unary(op, input);
                self.add_operand(result, operand)
            }
            Command::BuilderLeakyRelu {
                options,
                builder,
                input,
                result,
            } => {
                let input = self.operand(input)?;
                let operand = self.builder(builder)?.leaky_relu(input, &options);
                self.add_operand(result, operand)
            }
            Command::BuilderClamp {
                options,
                builder,
                input,
                result,
            } => {
                let input = self.operand(input)?;
                let operand = self.builder(builder)?.clamp(input, &options);
                self.add_operand(result, operand)
            }
            Command::BuilderConv2d {
                options,
                builder,
                input,
                filter,
                result,
            } => {
                let input = self.operand(input)?;
                let filter = self.operand(filter)?;
                let options = options.try_map_operands(|handle| self.operand(*handle))?;
                let operand = self.builder(builder)?.conv2d(input, filter, &options);
                self.add_operand(result, operand)
            }
            Command::BuilderConvTranspose2d {
                options,
                builder,
                input,
                filter,
                result,
            } => {
                let input = self.operand(input)?;
                let filter = self.operand(filter)?;
                let options = options.try_map_operands(|handle| self.operand(*handle))?;
                let operand = self
                    .builder(builder)?
                    .conv_transpose2d(input, filter, &options);
                self.add_operand(result, operand)
            }
            Command::BuilderPool2d {
                kind,
                options,
                builder,
                input,
                result,
            } => {
                let input = self.operand(input)?;
                let operand = self.builder(builder)?.pool2d(kind, input, &options);
                self.add_operand(result, operand)
            }
            Command::BuilderBatchNorm {
                options,
                builder,
                input,
                mean,
                variance,
                result,
            } => {
                let input = self.operand(input)?;
                let mean = self.operand(mean)?;
                let variance = self.operand(variance)?;
                let options = options.try_map_operands(|handle| self.operand(*handle))?;
                let operand = self
                    .builder(builder)?
                    .batch_norm(input, mean, variance, &options);
                self.add_operand(result, operand)
            }
            Command::BuilderInstanceNorm {
                options,
                builder,
                input,
                result,
            } => {
                let input = self.operand(input)?;
                let options = options.try_map_operands(|handle| self.operand(*handle))?;
                let operand = self.builder(builder)?.instance_norm(input, &options);
                self.add_operand(result, operand)
            }
            Command::BuilderGemm {
                options,
                builder,
                a,
                b,
                result,
            } => {
                let a = self.operand(a)?;
                let b = self.operand(b)?;
                let options = options.try_map_operands(|handle| self.operand(*handle))?;
                let operand = self.builder(builder)?.gemm(a, b, &options);
                self.add_operand(result, operand)
            }
            Command::BuilderGru {
                steps,
                hidden_size,
                options,
                builder,
                input,
                weight,
                recurrent_weight,
                result,
            } => {
                let input = self.operand(input)?;
                let weight = self.operand(weight)?;
                let recurrent_weight = self.operand(recurrent_weight)?;
                let options = options.try_map_operands(|handle| self.operand(*handle))?;
                let operands = self.builder(builder)?.gru(
                    input,
                    weight,
                    recurrent_weight,
                    steps,
                    hidden_size,
                    &options,
                );
                self.add_array(result, builder, operands)
            }
            Command::BuilderPad {
                options,
                padding,
                builder,
                input,
                result,
            } => {
                let input = self.operand(input)?;
                let operand = self.builder(builder)?.pad(input, &padding, &options);
                self.add_operand(result, operand)
            }
            Command::BuilderReduce {
                op,
                options,
                builder,
                input,
                result,
            } => {
                let input = self.operand(input)?;
                let operand = self.builder(builder)?.reduce(op, input, &options);
                self.add_operand(result, operand)
            }
            Command::BuilderResample2d {
                options,
                builder,
                input,
                result,
            } => {
                let input = self.operand(input)?;
                let operand = self.builder(builder)?.resample2d(input, &options);
                self.add_operand(result, operand)
            }
            Command::BuilderReshape {
                new_shape,
                builder,
                input,
                result,
            } => {
                let input = self.operand(input)?;
                let operand = self.builder(builder)?.reshape(input, &new_shape);
                self.add_operand(result, operand)
            }
            Command::BuilderSlice {
                starts,
                sizes,
                options,
                builder,
                input,
                result,
            } => {
                let input = self.operand(input)?;
                let operand = self
                    .builder(builder)?
                    .slice(input, &starts, &sizes, &options);
                self.add_operand(result, operand)
            }
            Command::BuilderSplit {
                options,
                splits,
                builder,
                input,
                result,
            } => {
                let input = self.operand(input)?;
                let operands = self.builder(builder)?.split(input, &splits, &options);
                self.add_array(result, builder, operands)
            }
            Command::BuilderSqueeze {
                options,
                builder,
                input,
                result,
            } => {
                let input = self.operand(input)?;
                let operand = self.builder(builder)?.squeeze(input, &options);
                self.add_operand(result, operand)
            }
            Command::BuilderTranspose {
                options,
                builder,
                input,
                result,
            } => {
                let input = self.operand(input)?;
                let operand = self.builder(builder)?.transpose(input, &options);
                self.add_operand(result, operand)
            }
            Command::BuilderConcat {
                axis,
                inputs,
                builder,
                result,
            } => {
                let inputs = inputs
                    .iter()
                    .map(|handle| self.operand(*handle))
                    .collect::<Result<Vec<_>, _>>()?;
                let operand = self.builder(builder)?.concat(&inputs, axis);
                self.add_operand(result, operand)
            }
            Command::BuilderBuild {
                builder,
                named_operands,
                result,
            } => {
                let outputs = self
                    .named_operands
                    .resolve(named_operands)
                    .map_err(WireError::registry(ObjectType::NamedOperands))?;
                let builder = self
                    .builders
                    .resolve(builder)
                    .map_err(WireError::registry(ObjectType::GraphBuilder))?;
                // Failures were already reported to the builder's context.
                let graph = builder.build(outputs).ok();
                self.graphs
                    .insert(result, graph)
                    .map_err(WireError::registry(ObjectType::Graph))
            }
            Command::OperandArrayGet {
                index,
                array,
                result,
            } => {
                let entry = self
                    .arrays
                    .resolve(array)
                    .map_err(WireError::registry(ObjectType::OperandArray))?;
                let operand = match entry.operands.get(index as usize) {
                    Some(operand) => operand,
                    None => {
                        let builder_handle = entry.builder;
                        let operands = entry.operands.clone();
                        self.builder(builder_handle)?
                            .missing_output(&operands, index as usize)
                            .ok_or_else(|| {
                                WireError::InvalidCommand(format!(
                                    "operand array {array} has no producer in builder {builder_handle}"
                                ))
                            })?
                    }
                };
                self.add_operand(result, operand)
            }
            Command::GraphComputeAsync {
                request_serial,
                graph,
                inputs,
            } => {
                let inputs = self
                    .named_inputs
                    .resolve(inputs)
                    .map_err(WireError::registry(ObjectType::NamedInputs))?;
                let graph = self
                    .graphs
                    .resolve(graph)
                    .map_err(WireError::registry(ObjectType::Graph))?;
                let result = match graph {
                    Some(graph) => graph
                        .compute(inputs)
                        .map_err(|err| ErrorReport::new(err.error_type(), err.to_string())),
                    None => Err(ErrorReport::new(
                        ErrorType::Validation,
                        "graph is an error object: its build failed",
                    )),
                };
                self.queue_return(ReturnCommand::ComputeDone {
                    request_serial,
                    result,
                });
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("terminated", &self.terminated)
            .field("contexts", &self.contexts.len())
            .field("builders", &self.builders.len())
            .field("graphs", &self.graphs.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::OperandDescriptor;
    use crate::wire::serializer::CommandBuffer;

    fn frames(commands: &[Command]) -> Vec<u8> {
        commands
            .iter()
            .flat_map(|command| encode_frame(command, usize::MAX).unwrap())
            .collect()
    }

    fn server() -> (Server, CommandBuffer) {
        let returns = CommandBuffer::new();
        let server = Server::with_config(returns.clone(), WireConfig::default())
            .with_backend_resolver(|name| Context::unavailable(name));
        (server, returns)
    }

    #[test]
    fn creation_commands_mirror_client_handles() {
        let (mut server, _) = server();
        let h = |id| ObjectHandle::new(id, 0);
        server
            .handle_commands(&frames(&[
                Command::CreateContext {
                    backend: "missing".into(),
                    result: h(1),
                },
                Command::ContextCreateGraphBuilder {
                    context: h(1),
                    result: h(1),
                },
                Command::BuilderInput {
                    name: "x".into(),
                    desc: OperandDescriptor::float32(vec![2]),
                    builder: h(1),
                    result: h(7),
                },
            ]))
            .unwrap();
        assert_eq!(server.live_objects(ObjectType::Operand), 1);
        assert!(server.operands.contains(h(7)));
    }

    #[test]
    fn builders_take_the_configured_output_limit() {
        let returns = CommandBuffer::new();
        let config = WireConfig::default().with_max_operator_outputs(3);
        let mut server = Server::with_config(returns, config)
            .with_backend_resolver(|name| Context::unavailable(name));
        let h = |id| ObjectHandle::new(id, 0);
        server
            .handle_commands(&frames(&[
                Command::CreateContext {
                    backend: "missing".into(),
                    result: h(1),
                },
                Command::ContextCreateGraphBuilder {
                    context: h(1),
                    result: h(2),
                },
            ]))
            .unwrap();
        let builder = server.builders.resolve(h(2)).unwrap();
        assert_eq!(builder.max_operator_outputs(), 3);
    }

    #[test]
    fn unknown_handles_terminate_the_connection() {
        let (mut server, _) = server();
        let bytes = frames(&[Command::ContextPushErrorScope {
            filter: crate::context::ErrorFilter::Validation,
            context: ObjectHandle::new(3, 0),
        }]);
        assert!(matches!(
            server.handle_commands(&bytes),
            Err(WireError::Registry {
                object_type: ObjectType::Context,
                ..
            })
        ));
        assert!(server.is_terminated());
        assert!(matches!(server.handle_commands(&[]), Err(WireError::Terminated)));
    }

    #[test]
    fn pop_without_scope_is_answered() {
        let (mut server, returns) = server();
        let context = ObjectHandle::new(1, 0);
        server
            .handle_commands(&frames(&[
                Command::CreateContext {
                    backend: "missing".into(),
                    result: context,
                },
                Command::ContextPopErrorScope {
                    request_serial: 9,
                    context,
                },
            ]))
            .unwrap();
        let bytes = returns.take();
        let replies: Vec<ReturnCommand> = FrameReader::new(&bytes, usize::MAX)
            .map(|payload| decode_payload(payload.unwrap()).unwrap())
            .collect();
        assert!(matches!(
            replies.as_slice(),
            [ReturnCommand::ErrorScopePopped { request_serial: 9, report }]
                if report.ty == ErrorType::Validation
        ));
    }
}
