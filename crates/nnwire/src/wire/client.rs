//! Client half of a connection.
//!
//! Every client object is a counted reference to a handle in the connection's
//! registry. Cloning adds a reference; dropping the last one frees the handle
//! and sends `DestroyObject`. Object-creating calls allocate the result handle
//! locally and return immediately; the server registers the object under the
//! same handle when it replays the command.
//!
//! The client is single-threaded: objects are `!Send` and share the
//! connection state through `Rc<RefCell<_>>`.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::backend::spec::OperandDescriptor;
use crate::context::{ErrorFilter, ErrorReport, ErrorType};
use crate::env::WireConfig;
use crate::graph::ops::{BinaryOp, Pool2dKind, ReduceOp, UnaryOp};
use crate::graph::options::{
    split_output_count, BatchNormOptions, ClampOptions, Conv2dOptions, ConvTranspose2dOptions,
    GemmOptions, GruOptions, InstanceNormOptions, LeakyReluOptions, PadOptions, Pool2dOptions,
    ReduceOptions, Resample2dOptions, SliceOptions, SplitOptions, SqueezeOptions,
    TransposeOptions,
};
use crate::tensor::{NamedOutputs, Tensor};

use super::command::{decode_payload, encode_frame, Command, FrameReader, ReturnCommand};
use super::guard::{ConnectionGuard, ConnectionId, WireObject};
use super::handle::{ObjectHandle, ObjectType};
use super::registry::ObjectRegistry;
use super::serializer::CommandSerializer;
use super::WireError;

type PopCallback = Box<dyn FnOnce(ErrorReport)>;
type ComputeCallback = Box<dyn FnOnce(Result<NamedOutputs, ErrorReport>)>;
type UncapturedCallback = Box<dyn FnMut(&ErrorReport)>;

fn connection_lost() -> ErrorReport {
    ErrorReport::new(ErrorType::ContextLost, "connection is disconnected")
}

struct ClientState {
    serializer: Box<dyn CommandSerializer>,
    registries: [ObjectRegistry<()>; ObjectType::COUNT],
    disconnected: bool,
    next_serial: u64,
    pending_pops: HashMap<u64, PopCallback>,
    pending_computes: HashMap<u64, ComputeCallback>,
    uncaptured: Option<UncapturedCallback>,
    last_error: Option<WireError>,
}

struct ClientShared {
    connection: ConnectionId,
    config: WireConfig,
    state: RefCell<ClientState>,
}

impl ClientShared {
    fn send(&self, command: &Command) -> bool {
        let mut state = self.state.borrow_mut();
        if state.disconnected {
            return false;
        }
        let frame = match encode_frame(command, self.config.max_command_bytes) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(opcode = ?command.opcode(), "dropping command: {err}");
                state.last_error = Some(err);
                return false;
            }
        };
        if self.config.trace_commands {
            tracing::trace!(opcode = ?command.opcode(), bytes = frame.len(), "send");
        }
        if !state.serializer.serialize(&frame) {
            state.last_error = Some(WireError::Serializer(frame.len()));
            return false;
        }
        true
    }

    /// Sends `command` unless the guard rejected one of its arguments.
    fn send_checked(&self, guard: ConnectionGuard, command: impl FnOnce() -> Command) -> bool {
        match guard.finish() {
            Ok(()) => self.send(&command()),
            Err(err) => {
                self.reject(err);
                false
            }
        }
    }

    fn reject(&self, err: WireError) {
        tracing::warn!("call rejected locally: {err}");
        self.state.borrow_mut().last_error = Some(err);
    }

    fn allocate(&self, object_type: ObjectType) -> ObjectHandle {
        self.state.borrow_mut().registries[object_type.index()].allocate(())
    }

    fn create(
        self: &Rc<Self>,
        object_type: ObjectType,
        command: impl FnOnce(ObjectHandle) -> Command,
    ) -> ObjectRef {
        let handle = self.allocate(object_type);
        let registered = self.send(&command(handle));
        ObjectRef {
            shared: Rc::clone(self),
            object_type,
            handle,
            registered,
        }
    }

    fn create_checked(
        self: &Rc<Self>,
        object_type: ObjectType,
        guard: ConnectionGuard,
        command: impl FnOnce(ObjectHandle) -> Command,
    ) -> ObjectRef {
        match guard.finish() {
            Ok(()) => self.create(object_type, command),
            Err(err) => self.poisoned(object_type, err),
        }
    }

    /// An object whose handle is allocated but never announced to the server.
    fn poisoned(self: &Rc<Self>, object_type: ObjectType, err: WireError) -> ObjectRef {
        self.reject(err);
        ObjectRef {
            shared: Rc::clone(self),
            object_type,
            handle: self.allocate(object_type),
            registered: false,
        }
    }

    fn next_serial(&self) -> u64 {
        let mut state = self.state.borrow_mut();
        state.next_serial += 1;
        state.next_serial
    }

    fn is_disconnected(&self) -> bool {
        self.state.borrow().disconnected
    }
}

/// One counted reference to a wire object.
struct ObjectRef {
    shared: Rc<ClientShared>,
    object_type: ObjectType,
    handle: ObjectHandle,
    registered: bool,
}

impl Clone for ObjectRef {
    fn clone(&self) -> Self {
        self.shared.state.borrow_mut().registries[self.object_type.index()]
            .reference(self.handle)
            .expect("cloned object is live");
        Self {
            shared: Rc::clone(&self.shared),
            object_type: self.object_type,
            handle: self.handle,
            registered: self.registered,
        }
    }
}

impl Drop for ObjectRef {
    fn drop(&mut self) {
        let released = self.shared.state.borrow_mut().registries[self.object_type.index()]
            .release(self.handle);
        match released {
            Ok(Some(())) if self.registered => {
                self.shared.send(&Command::DestroyObject {
                    object_type: self.object_type,
                    id: self.handle.id,
                });
            }
            Ok(_) => {}
            Err(err) => tracing::error!(object_type = ?self.object_type, "release failed: {err}"),
        }
    }
}

impl WireObject for ObjectRef {
    fn connection(&self) -> ConnectionId {
        self.shared.connection
    }

    fn object_type(&self) -> ObjectType {
        self.object_type
    }

    fn handle(&self) -> ObjectHandle {
        self.handle
    }

    fn is_registered(&self) -> bool {
        self.registered
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRef")
            .field("type", &self.object_type)
            .field("handle", &self.handle)
            .field("registered", &self.registered)
            .finish()
    }
}

macro_rules! wire_object {
    ($($ty:ident),+ $(,)?) => {
        $(
            impl $ty {
                pub fn handle(&self) -> ObjectHandle {
                    self.object.handle
                }

                /// `false` if the call that created this object was rejected
                /// before reaching the server.
                pub fn is_registered(&self) -> bool {
                    self.object.registered
                }
            }
        )+
    };
}

wire_object!(Context, GraphBuilder, Operand, OperandArray, NamedOperands, NamedInputs, Graph);

/// Client end of one connection.
pub struct Client {
    shared: Rc<ClientShared>,
}

impl Client {
    pub fn new(serializer: impl CommandSerializer + 'static) -> Self {
        Self::with_config(serializer, WireConfig::from_env())
    }

    pub fn with_config(serializer: impl CommandSerializer + 'static, config: WireConfig) -> Self {
        let state = ClientState {
            serializer: Box::new(serializer),
            registries: ObjectType::ALL.map(|_| ObjectRegistry::new()),
            disconnected: false,
            next_serial: 0,
            pending_pops: HashMap::new(),
            pending_computes: HashMap::new(),
            uncaptured: None,
            last_error: None,
        };
        Self {
            shared: Rc::new(ClientShared {
                connection: ConnectionId::next(),
                config,
                state: RefCell::new(state),
            }),
        }
    }

    /// Asks the server for a context on the backend registered as `backend`.
    /// An unknown backend yields a context whose graph builders are error objects.
    pub fn create_context(&self, backend: &str) -> Context {
        let object = self.shared.create(ObjectType::Context, |result| Command::CreateContext {
            backend: backend.to_string(),
            result,
        });
        Context {
            object,
            scope_depth: Rc::new(Cell::new(0)),
        }
    }

    pub fn create_named_operands(&self) -> NamedOperands {
        let object = self
            .shared
            .create(ObjectType::NamedOperands, |result| Command::CreateNamedOperands { result });
        NamedOperands { object }
    }

    pub fn create_named_inputs(&self) -> NamedInputs {
        let object = self
            .shared
            .create(ObjectType::NamedInputs, |result| Command::CreateNamedInputs { result });
        NamedInputs { object }
    }

    /// Receives `UncapturedError` notifications from every context on this connection.
    pub fn set_uncaptured_error_callback<F>(&self, callback: F)
    where
        F: FnMut(&ErrorReport) + 'static,
    {
        let previous = self.shared.state.borrow_mut().uncaptured.replace(Box::new(callback));
        drop(previous);
    }

    /// Decodes return frames from the server and runs the matching callbacks.
    /// Ignored once the client is disconnected.
    pub fn handle_return_commands(&self, bytes: &[u8]) -> Result<(), WireError> {
        if self.shared.is_disconnected() {
            return Ok(());
        }
        for payload in FrameReader::new(bytes, self.shared.config.max_command_bytes) {
            let command = decode_payload::<ReturnCommand>(payload?)?;
            self.dispatch(command);
        }
        Ok(())
    }

    fn dispatch(&self, command: ReturnCommand) {
        match command {
            ReturnCommand::ErrorScopePopped {
                request_serial,
                report,
            } => {
                let callback = self.shared.state.borrow_mut().pending_pops.remove(&request_serial);
                match callback {
                    Some(callback) => callback(report),
                    None => tracing::warn!(request_serial, "no pending error scope pop"),
                }
            }
            ReturnCommand::ComputeDone {
                request_serial,
                result,
            } => {
                let callback = self
                    .shared
                    .state
                    .borrow_mut()
                    .pending_computes
                    .remove(&request_serial);
                match callback {
                    Some(callback) => callback(result),
                    None => tracing::warn!(request_serial, "no pending compute"),
                }
            }
            ReturnCommand::UncapturedError { report } => {
                let callback = self.shared.state.borrow_mut().uncaptured.take();
                let Some(mut callback) = callback else {
                    tracing::warn!(error_type = ?report.ty, "uncaptured error: {}", report.message);
                    return;
                };
                callback(&report);
                let mut state = self.shared.state.borrow_mut();
                if state.uncaptured.is_none() {
                    state.uncaptured = Some(callback);
                }
            }
        }
    }

    pub fn flush(&self) -> bool {
        let mut state = self.shared.state.borrow_mut();
        !state.disconnected && state.serializer.flush()
    }

    /// Stops all further sends. Pending callbacks, and any registered later,
    /// receive a `ContextLost` report.
    pub fn disconnect(&self) {
        let (mut pops, mut computes) = {
            let mut state = self.shared.state.borrow_mut();
            if state.disconnected {
                return;
            }
            state.disconnected = true;
            (
                state.pending_pops.drain().collect::<Vec<_>>(),
                state.pending_computes.drain().collect::<Vec<_>>(),
            )
        };
        tracing::debug!(
            pending = pops.len() + computes.len(),
            "client disconnected"
        );
        pops.sort_by_key(|(serial, _)| *serial);
        computes.sort_by_key(|(serial, _)| *serial);
        for (_, callback) in pops {
            callback(connection_lost());
        }
        for (_, callback) in computes {
            callback(Err(connection_lost()));
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.shared.is_disconnected()
    }

    /// The most recent call that was rejected locally or failed to serialize.
    pub fn take_last_error(&self) -> Option<WireError> {
        self.shared.state.borrow_mut().last_error.take()
    }

    /// Live handles of `object_type`, including locally poisoned ones.
    pub fn live_objects(&self, object_type: ObjectType) -> usize {
        self.shared.state.borrow().registries[object_type.index()].len()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("connection", &self.shared.connection)
            .field("disconnected", &self.shared.is_disconnected())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct Context {
    object: ObjectRef,
    scope_depth: Rc<Cell<usize>>,
}

impl Context {
    pub fn create_graph_builder(&self) -> GraphBuilder {
        let guard = ConnectionGuard::new(&self.object);
        let context = self.object.handle;
        let object = self.object.shared.create_checked(ObjectType::GraphBuilder, guard, |result| {
            Command::ContextCreateGraphBuilder { context, result }
        });
        GraphBuilder { object }
    }

    pub fn push_error_scope(&self, filter: ErrorFilter) {
        let guard = ConnectionGuard::new(&self.object);
        let context = self.object.handle;
        if self
            .object
            .shared
            .send_checked(guard, || Command::ContextPushErrorScope { filter, context })
        {
            self.scope_depth.set(self.scope_depth.get() + 1);
        }
    }

    /// Pops the innermost error scope; `callback` receives what it captured once
    /// the server answers.
    pub fn pop_error_scope<F>(&self, callback: F)
    where
        F: FnOnce(ErrorReport) + 'static,
    {
        let shared = &self.object.shared;
        if shared.is_disconnected() {
            callback(connection_lost());
            return;
        }
        let depth = self.scope_depth.get();
        if depth == 0 {
            callback(ErrorReport::new(ErrorType::Validation, "no error scope to pop"));
            return;
        }
        self.scope_depth.set(depth - 1);
        let request_serial = shared.next_serial();
        shared
            .state
            .borrow_mut()
            .pending_pops
            .insert(request_serial, Box::new(callback));
        let sent = shared.send(&Command::ContextPopErrorScope {
            request_serial,
            context: self.object.handle,
        });
        if !sent {
            let callback = shared.state.borrow_mut().pending_pops.remove(&request_serial);
            if let Some(callback) = callback {
                callback(connection_lost());
            }
        }
    }

    /// Scopes pushed through this context and not yet popped.
    pub fn error_scope_depth(&self) -> usize {
        self.scope_depth.get()
    }
}

macro_rules! binary_methods {
    ($($method:ident => $op:ident),+ $(,)?) => {
        $(
            pub fn $method(&self, a: &Operand, b: &Operand) -> Operand {
                self.binary(BinaryOp::$op, a, b)
            }
        )+
    };
}

macro_rules! unary_methods {
    ($($method:ident => $op:ident),+ $(,)?) => {
        $(
            pub fn $method(&self, input: &Operand) -> Operand {
                self.unary(UnaryOp::$op, input)
            }
        )+
    };
}

macro_rules! reduce_methods {
    ($($method:ident => $op:ident),+ $(,)?) => {
        $(
            pub fn $method(&self, input: &Operand, options: &ReduceOptions) -> Operand {
                self.reduce(ReduceOp::$op, input, options)
            }
        )+
    };
}

/// Remote graph builder. Mirrors [`crate::GraphBuilder`]; validation happens
/// on the server, and failures reach the context's error scopes there.
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    object: ObjectRef,
}

impl GraphBuilder {
    fn guard(&self) -> ConnectionGuard {
        ConnectionGuard::new(&self.object)
    }

    fn operand(
        &self,
        guard: ConnectionGuard,
        command: impl FnOnce(ObjectHandle) -> Command,
    ) -> Operand {
        let object = self
            .object
            .shared
            .create_checked(ObjectType::Operand, guard, command);
        Operand {
            object,
            _builder: self.object.clone(),
        }
    }

    fn operand_array(
        &self,
        guard: ConnectionGuard,
        len: usize,
        command: impl FnOnce(ObjectHandle) -> Command,
    ) -> OperandArray {
        let object = self
            .object
            .shared
            .create_checked(ObjectType::OperandArray, guard, command);
        OperandArray {
            object,
            builder: self.object.clone(),
            len,
        }
    }

    pub fn input(&self, name: &str, desc: &OperandDescriptor) -> Operand {
        let builder = self.object.handle;
        self.operand(self.guard(), |result| Command::BuilderInput {
            name: name.to_string(),
            desc: desc.clone(),
            builder,
            result,
        })
    }

    pub fn constant(&self, desc: &OperandDescriptor, data: &[u8]) -> Operand {
        let builder = self.object.handle;
        self.operand(self.guard(), |result| Command::BuilderConstant {
            desc: desc.clone(),
            data: data.to_vec(),
            builder,
            result,
        })
    }

    pub fn binary(&self, op: BinaryOp, a: &Operand, b: &Operand) -> Operand {
        let mut guard = self.guard();
        let a = guard.check(&a.object);
        let b = guard.check(&b.object);
        let builder = self.object.handle;
        self.operand(guard, |result| Command::BuilderBinary {
            op,
            builder,
            a,
            b,
            result,
        })
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

    pub fn unary(&self, op: UnaryOp, input: &Operand) -> Operand {
        let mut guard = self.guard();
        let input = guard.check(&input.object);
        let builder = self.object.handle;
        self.operand(guard, |result| Command::BuilderUnary {
            op,
            builder,
            input,
            result,
        })
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

    pub fn leaky_relu(&self, input: &Operand, options: &LeakyReluOptions) -> Operand {
        let mut guard = self.guard();
        let input = guard.check(&input.object);
        let builder = self.object.handle;
        self.operand(guard, |result| Command::BuilderLeakyRelu {
            options: *options,
            builder,
            input,
            result,
        })
    }

    pub fn clamp(&self, input: &Operand, options: &ClampOptions) -> Operand {
        let mut guard = self.guard();
        let input = guard.check(&input.object);
        let builder = self.object.handle;
        self.operand(guard, |result| Command::BuilderClamp {
            options: *options,
            builder,
            input,
            result,
        })
    }

    pub fn conv2d(
        &self,
        input: &Operand,
        filter: &Operand,
        options: &Conv2dOptions<Operand>,
    ) -> Operand {
        let mut guard = self.guard();
        let input = guard.check(&input.object);
        let filter = guard.check(&filter.object);
        let options = options.map_operands(|operand| guard.check(&operand.object));
        let builder = self.object.handle;
        self.operand(guard, |result| Command::BuilderConv2d {
            options,
            builder,
            input,
            filter,
            result,
        })
    }

    pub fn conv_transpose2d(
        &self,
        input: &Operand,
        filter: &Operand,
        options: &ConvTranspose2dOptions<Operand>,
    ) -> Operand {
        let mut guard = self.guard();
        let input = guard.check(&input.object);
        let filter = guard.check(&filter.object);
        let options = options.map_operands(|operand| guard.check(&operand.object));
        let builder = self.object.handle;
        self.operand(guard, |result| Command::BuilderConvTranspose2d {
            options,
            builder,
            input,
            filter,
            result,
        })
    }

    pub fn pool2d(&self, kind: Pool2dKind, input: &Operand, options: &Pool2dOptions) -> Operand {
        let mut guard = self.guard();
        let input = guard.check(&input.object);
        let builder = self.object.handle;
        self.operand(guard, |result| Command::BuilderPool2d {
            kind,
            options: options.clone(),
            builder,
            input,
            result,
        })
    }

    pub fn average_pool2d(&self, input: &Operand, options: &Pool2dOptions) -> Operand {
        self.pool2d(Pool2dKind::Average, input, options)
    }

    pub fn l2_pool2d(&self, input: &Operand, options: &Pool2dOptions) -> Operand {
        self.pool2d(Pool2dKind::L2, input, options)
    }

    pub fn max_pool2d(&self, input: &Operand, options: &Pool2dOptions) -> Operand {
        self.pool2d(Pool2dKind::Max, input, options)
    }

    pub fn batch_norm(
        &self,
        input: &Operand,
        mean: &Operand,
        variance: &Operand,
        options: &BatchNormOptions<Operand>,
    ) -> Operand {
        let mut guard = self.guard();
        let input = guard.check(&input.object);
        let mean = guard.check(&mean.object);
        let variance = guard.check(&variance.object);
        let options = options.map_operands(|operand| guard.check(&operand.object));
        let builder = self.object.handle;
        self.operand(guard, |result| Command::BuilderBatchNorm {
            options,
            builder,
            input,
            mean,
            variance,
            result,
        })
    }

    pub fn instance_norm(&self, input: &Operand, options: &InstanceNormOptions<Operand>) -> Operand {
        let mut guard = self.guard();
        let input = guard.check(&input.object);
        let options = options.map_operands(|operand| guard.check(&operand.object));
        let builder = self.object.handle;
        self.operand(guard, |result| Command::BuilderInstanceNorm {
            options,
            builder,
            input,
            result,
        })
    }

    pub fn gemm(&self, a: &Operand, b: &Operand, options: &GemmOptions<Operand>) -> Operand {
        let mut guard = self.guard();
        let a = guard.check(&a.object);
        let b = guard.check(&b.object);
        let options = options.map_operands(|operand| guard.check(&operand.object));
        let builder = self.object.handle;
        self.operand(guard, |result| Command::BuilderGemm {
            options,
            builder,
            a,
            b,
            result,
        })
    }

    pub fn gru(
        &self,
        input: &Operand,
        weight: &Operand,
        recurrent_weight: &Operand,
        steps: u32,
        hidden_size: u32,
        options: &GruOptions<Operand>,
    ) -> OperandArray {
        let mut guard = self.guard();
        let input = guard.check(&input.object);
        let weight = guard.check(&weight.object);
        let recurrent_weight = guard.check(&recurrent_weight.object);
        let options = options.map_operands(|operand| guard.check(&operand.object));
        let len = options.output_count();
        let builder = self.object.handle;
        self.operand_array(guard, len, |result| Command::BuilderGru {
            steps,
            hidden_size,
            options,
            builder,
            input,
            weight,
            recurrent_weight,
            result,
        })
    }

    pub fn pad(&self, input: &Operand, padding: &[u32], options: &PadOptions) -> Operand {
        let mut guard = self.guard();
        let input = guard.check(&input.object);
        let builder = self.object.handle;
        self.operand(guard, |result| Command::BuilderPad {
            options: *options,
            padding: padding.to_vec(),
            builder,
            input,
            result,
        })
    }

    pub fn reduce(&self, op: ReduceOp, input: &Operand, options: &ReduceOptions) -> Operand {
        let mut guard = self.guard();
        let input = guard.check(&input.object);
        let builder = self.object.handle;
        self.operand(guard, |result| Command::BuilderReduce {
            op,
            options: options.clone(),
            builder,
            input,
            result,
        })
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

    pub fn resample2d(&self, input: &Operand, options: &Resample2dOptions) -> Operand {
        let mut guard = self.guard();
        let input = guard.check(&input.object);
        let builder = self.object.handle;
        self.operand(guard, |result| Command::BuilderResample2d {
            options: options.clone(),
            builder,
            input,
            result,
        })
    }

    pub fn reshape(&self, input: &Operand, new_shape: &[i32]) -> Operand {
        let mut guard = self.guard();
        let input = guard.check(&input.object);
        let builder = self.object.handle;
        self.operand(guard, |result| Command::BuilderReshape {
            new_shape: new_shape.to_vec(),
            builder,
            input,
            result,
        })
    }

    pub fn slice(
        &self,
        input: &Operand,
        starts: &[i32],
        sizes: &[i32],
        options: &SliceOptions,
    ) -> Operand {
        let mut guard = self.guard();
        let input = guard.check(&input.object);
        let builder = self.object.handle;
        self.operand(guard, |result| Command::BuilderSlice {
            starts: starts.to_vec(),
            sizes: sizes.to_vec(),
            options: options.clone(),
            builder,
            input,
            result,
        })
    }

    pub fn split(&self, input: &Operand, splits: &[u32], options: &SplitOptions) -> OperandArray {
        let mut guard = self.guard();
        let input = guard.check(&input.object);
        let builder = self.object.handle;
        self.operand_array(guard, split_output_count(splits), |result| Command::BuilderSplit {
            options: *options,
            splits: splits.to_vec(),
            builder,
            input,
            result,
        })
    }

    pub fn squeeze(&self, input: &Operand, options: &SqueezeOptions) -> Operand {
        let mut guard = self.guard();
        let input = guard.check(&input.object);
        let builder = self.object.handle;
        self.operand(guard, |result| Command::BuilderSqueeze {
            options: options.clone(),
            builder,
            input,
            result,
        })
    }

    pub fn transpose(&self, input: &Operand, options: &TransposeOptions) -> Operand {
        let mut guard = self.guard();
        let input = guard.check(&input.object);
        let builder = self.object.handle;
        self.operand(guard, |result| Command::BuilderTranspose {
            options: options.clone(),
            builder,
            input,
            result,
        })
    }

    pub fn concat(&self, inputs: &[&Operand], axis: u32) -> Operand {
        let mut guard = self.guard();
        let inputs: Vec<ObjectHandle> = inputs
            .iter()
            .map(|operand| guard.check(&operand.object))
            .collect();
        let builder = self.object.handle;
        self.operand(guard, |result| Command::BuilderConcat {
            axis,
            inputs,
            builder,
            result,
        })
    }

    /// Requests compilation. The returned graph is usable immediately; if the
    /// build fails on the server its computations report an error.
    pub fn build(&self, outputs: &NamedOperands) -> Graph {
        let mut guard = self.guard();
        let named_operands = guard.check(&outputs.object);
        let builder = self.object.handle;
        let object = self
            .object
            .shared
            .create_checked(ObjectType::Graph, guard, |result| Command::BuilderBuild {
                builder,
                named_operands,
                result,
            });
        Graph { object }
    }
}

/// A remote operand. Keeps its builder alive.
#[derive(Debug, Clone)]
pub struct Operand {
    object: ObjectRef,
    _builder: ObjectRef,
}

/// Results of a remote multi-output operator. The length is known locally
/// from the call's arguments.
#[derive(Debug, Clone)]
pub struct OperandArray {
    object: ObjectRef,
    builder: ObjectRef,
    len: usize,
}

impl OperandArray {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Operand `index`; out-of-range indices yield a locally poisoned operand.
    pub fn get(&self, index: usize) -> Operand {
        let shared = &self.object.shared;
        let object = if index >= self.len {
            shared.poisoned(
                ObjectType::Operand,
                WireError::InvalidCommand(format!(
                    "operand array index {index} out of range ({} operands)",
                    self.len
                )),
            )
        } else {
            let guard = ConnectionGuard::new(&self.object);
            let array = self.object.handle;
            shared.create_checked(ObjectType::Operand, guard, |result| Command::OperandArrayGet {
                index: index as u32,
                array,
                result,
            })
        };
        Operand {
            object,
            _builder: self.builder.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NamedOperands {
    object: ObjectRef,
}

impl NamedOperands {
    pub fn set(&self, name: &str, operand: &Operand) {
        let mut guard = ConnectionGuard::new(&self.object);
        let operand = guard.check(&operand.object);
        let named_operands = self.object.handle;
        self.object.shared.send_checked(guard, || Command::NamedOperandsSet {
            name: name.to_string(),
            named_operands,
            operand,
        });
    }
}

#[derive(Debug, Clone)]
pub struct NamedInputs {
    object: ObjectRef,
}

impl NamedInputs {
    pub fn set(&self, name: &str, input: Tensor) {
        let guard = ConnectionGuard::new(&self.object);
        let named_inputs = self.object.handle;
        self.object.shared.send_checked(guard, || Command::NamedInputsSet {
            name: name.to_string(),
            input,
            named_inputs,
        });
    }
}

#[derive(Debug, Clone)]
pub struct Graph {
    object: ObjectRef,
}

impl Graph {
    /// Runs the graph on the server; `callback` receives the outputs once the
    /// server answers, or immediately if the call cannot be sent.
    pub fn compute_async<F>(&self, inputs: &NamedInputs, callback: F)
    where
        F: FnOnce(Result<NamedOutputs, ErrorReport>) + 'static,
    {
        let shared = &self.object.shared;
        if shared.is_disconnected() {
            callback(Err(connection_lost()));
            return;
        }
        let mut guard = ConnectionGuard::new(&self.object);
        let inputs = guard.check(&inputs.object);
        if let Err(err) = guard.finish() {
            let report = ErrorReport::new(ErrorType::Validation, err.to_string());
            shared.reject(err);
            callback(Err(report));
            return;
        }
        let request_serial = shared.next_serial();
        shared
            .state
            .borrow_mut()
            .pending_computes
            .insert(request_serial, Box::new(callback));
        let sent = shared.send(&Command::GraphComputeAsync {
            request_serial,
            graph: self.object.handle,
            inputs,
        });
        if !sent {
            let callback = shared.state.borrow_mut().pending_computes.remove(&request_serial);
            if let Some(callback) = callback {
                callback(Err(connection_lost()));
            }
        }
    }
}
