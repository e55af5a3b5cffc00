use std::cell::RefCell;
use std::rc::Rc;

use nnwire::graph::options::{SplitOptions, TransposeOptions};
use nnwire::wire::{Client, CommandBuffer, ObjectType, Server, WireError};
use nnwire::{
    ErrorFilter, ErrorReport, ErrorType, NamedOutputs, OperandDescriptor, Tensor, WireConfig,
};
use nnwire_backend_ref_cpu::register_cpu_backend;

type ComputeResult = Result<NamedOutputs, ErrorReport>;

/// A client and server joined by two in-memory buffers.
struct Session {
    client: Client,
    server: Server,
    commands: CommandBuffer,
    returns: CommandBuffer,
}

impl Session {
    fn new() -> Self {
        let _ = nnwire::logging::init_tracing();
        register_cpu_backend();
        let commands = CommandBuffer::new();
        let returns = CommandBuffer::new();
        Self {
            client: Client::with_config(commands.clone(), WireConfig::default()),
            server: Server::with_config(returns.clone(), WireConfig::default()),
            commands,
            returns,
        }
    }

    /// Delivers everything queued in both directions.
    fn pump(&mut self) {
        let commands = self.commands.take();
        self.server
            .handle_commands(&commands)
            .expect("server rejected commands");
        let returns = self.returns.take();
        self.client
            .handle_return_commands(&returns)
            .expect("client rejected returns");
    }
}

fn slot<T: 'static>() -> (Rc<RefCell<Option<T>>>, impl FnOnce(T) + 'static) {
    let slot = Rc::new(RefCell::new(None));
    let writer = Rc::clone(&slot);
    (slot, move |value| *writer.borrow_mut() = Some(value))
}

fn output_f32(result: &ComputeResult, name: &str) -> Vec<f32> {
    let outputs = result.as_ref().expect("compute failed");
    outputs
        .get(name)
        .and_then(Tensor::to_f32)
        .expect("float output")
}

#[test]
fn relu_computes_end_to_end() {
    let mut session = Session::new();
    let context = session.client.create_context("cpu");
    let builder = context.create_graph_builder();
    let x = builder.input("x", &OperandDescriptor::float32(vec![4]));
    let y = builder.relu(&x);
    let outputs = session.client.create_named_operands();
    outputs.set("y", &y);
    let graph = builder.build(&outputs);
    let inputs = session.client.create_named_inputs();
    inputs.set("x", Tensor::from_f32(vec![4], &[-1.0, 0.0, 2.0, -3.0]));

    let (result, callback) = slot::<ComputeResult>();
    graph.compute_async(&inputs, callback);
    assert!(result.borrow().is_none());
    session.pump();

    let result = result.borrow_mut().take().expect("compute answered");
    assert_eq!(output_f32(&result, "y"), vec![0.0, 0.0, 2.0, 0.0]);
    assert_eq!(session.server.live_objects(ObjectType::Graph), 1);
}

#[test]
fn split_results_are_fetched_by_index() {
    let mut session = Session::new();
    let context = session.client.create_context("cpu");
    let builder = context.create_graph_builder();
    let x = builder.input("x", &OperandDescriptor::float32(vec![4]));
    let halves = builder.split(&x, &[2], &SplitOptions::default());
    assert_eq!(halves.len(), 2);
    let swapped = builder.concat(&[&halves.get(1), &halves.get(0)], 0);
    let outputs = session.client.create_named_operands();
    outputs.set("swapped", &swapped);
    let graph = builder.build(&outputs);
    let inputs = session.client.create_named_inputs();
    inputs.set("x", Tensor::from_f32(vec![4], &[1.0, 2.0, 3.0, 4.0]));

    let (result, callback) = slot::<ComputeResult>();
    graph.compute_async(&inputs, callback);
    session.pump();
    let result = result.borrow_mut().take().expect("compute answered");
    assert_eq!(output_f32(&result, "swapped"), vec![3.0, 4.0, 1.0, 2.0]);
}

#[test]
fn out_of_range_array_index_never_reaches_the_server() {
    let mut session = Session::new();
    let context = session.client.create_context("cpu");
    let builder = context.create_graph_builder();
    let x = builder.input("x", &OperandDescriptor::float32(vec![4]));
    let halves = builder.split(&x, &[2], &SplitOptions::default());
    session.pump();

    let missing = halves.get(5);
    assert!(!missing.is_registered());
    assert!(session.commands.is_empty());
    assert!(matches!(
        session.client.take_last_error(),
        Some(WireError::InvalidCommand(_))
    ));

    let downstream = builder.relu(&missing);
    assert!(!downstream.is_registered());
    assert!(matches!(
        session.client.take_last_error(),
        Some(WireError::Poisoned {
            object_type: ObjectType::Operand
        })
    ));
    assert!(session.commands.is_empty());
}

#[test]
fn objects_from_another_connection_are_rejected_locally() {
    let session = Session::new();
    let other = Client::with_config(CommandBuffer::new(), WireConfig::default());
    let foreign_builder = other.create_context("cpu").create_graph_builder();
    let foreign = foreign_builder.input("x", &OperandDescriptor::float32(vec![2]));

    let builder = session.client.create_context("cpu").create_graph_builder();
    let sent = session.commands.len();
    let result = builder.relu(&foreign);
    assert!(!result.is_registered());
    assert_eq!(session.commands.len(), sent);
    assert!(matches!(
        session.client.take_last_error(),
        Some(WireError::CrossConnection {
            object_type: ObjectType::Operand
        })
    ));

    // A graph from this connection cannot compute with another connection's inputs.
    let outputs = session.client.create_named_operands();
    let local = builder.input("x", &OperandDescriptor::float32(vec![2]));
    outputs.set("x", &local);
    let graph = builder.build(&outputs);
    let sent = session.commands.len();
    let (result, callback) = slot::<ComputeResult>();
    graph.compute_async(&other.create_named_inputs(), callback);
    let result = result.borrow_mut().take().expect("answered without a round trip");
    assert_eq!(result.unwrap_err().ty, ErrorType::Validation);
    assert_eq!(session.commands.len(), sent);
}

#[test]
fn dropping_the_last_reference_destroys_the_remote_object() {
    let mut session = Session::new();
    let context = session.client.create_context("cpu");
    let builder = context.create_graph_builder();
    let x = builder.input("x", &OperandDescriptor::float32(vec![2]));
    let y = builder.neg(&x);
    let y_again = y.clone();
    session.pump();
    assert_eq!(session.server.live_objects(ObjectType::Operand), 2);

    drop(y);
    assert!(session.commands.is_empty());
    drop(y_again);
    assert!(!session.commands.is_empty());
    session.pump();
    assert_eq!(session.server.live_objects(ObjectType::Operand), 1);
    assert_eq!(session.client.live_objects(ObjectType::Operand), 1);

    // Operands keep their builder alive.
    drop(builder);
    drop(context);
    session.pump();
    assert_eq!(session.server.live_objects(ObjectType::GraphBuilder), 1);
    drop(x);
    session.pump();
    assert_eq!(session.server.live_objects(ObjectType::Operand), 0);
    assert_eq!(session.server.live_objects(ObjectType::GraphBuilder), 0);
    assert_eq!(session.server.live_objects(ObjectType::Context), 0);
}

#[test]
fn error_scopes_round_trip() {
    let mut session = Session::new();
    let uncaptured = Rc::new(RefCell::new(Vec::<ErrorReport>::new()));
    let seen = Rc::clone(&uncaptured);
    session
        .client
        .set_uncaptured_error_callback(move |report| seen.borrow_mut().push(report.clone()));

    let context = session.client.create_context("cpu");
    context.push_error_scope(ErrorFilter::OutOfMemory);
    context.push_error_scope(ErrorFilter::Validation);
    assert_eq!(context.error_scope_depth(), 2);
    let builder = context.create_graph_builder();
    let x = builder.input("x", &OperandDescriptor::float32(vec![3]));
    let _bad = builder.transpose(
        &x,
        &TransposeOptions {
            permutation: Some(vec![1, 0]),
        },
    );

    let (inner, inner_callback) = slot::<ErrorReport>();
    let (outer, outer_callback) = slot::<ErrorReport>();
    context.pop_error_scope(inner_callback);
    context.pop_error_scope(outer_callback);
    assert_eq!(context.error_scope_depth(), 0);
    assert!(inner.borrow().is_none());
    session.pump();

    let inner = inner.borrow_mut().take().expect("inner scope answered");
    assert_eq!(inner.ty, ErrorType::Validation);
    assert!(inner.message.starts_with("transpose"), "{}", inner.message);
    let outer = outer.borrow_mut().take().expect("outer scope answered");
    assert!(!outer.is_error());
    assert!(uncaptured.borrow().is_empty());
}

#[test]
fn popping_without_a_scope_answers_immediately() {
    let session = Session::new();
    let context = session.client.create_context("cpu");
    let sent = session.commands.len();
    let (report, callback) = slot::<ErrorReport>();
    context.pop_error_scope(callback);
    let report = report.borrow_mut().take().expect("answered locally");
    assert_eq!(report.ty, ErrorType::Validation);
    assert_eq!(session.commands.len(), sent);
}

#[test]
fn uncaptured_errors_reach_the_client_callback() {
    let mut session = Session::new();
    let uncaptured = Rc::new(RefCell::new(Vec::<ErrorReport>::new()));
    let seen = Rc::clone(&uncaptured);
    session
        .client
        .set_uncaptured_error_callback(move |report| seen.borrow_mut().push(report.clone()));

    let context = session.client.create_context("cpu");
    let builder = context.create_graph_builder();
    let a = builder.input("a", &OperandDescriptor::float32(vec![2, 3]));
    let b = builder.input("b", &OperandDescriptor::float32(vec![4, 5]));
    let product = builder.matmul(&a, &b);
    // Only the first failure is reported; the poisoned result stays silent.
    let _ = builder.relu(&product);
    session.pump();

    let reports = uncaptured.borrow();
    assert_eq!(reports.len(), 1, "{reports:?}");
    assert_eq!(reports[0].ty, ErrorType::Validation);
}

#[test]
fn failed_splits_report_once_whatever_the_client_fetches() {
    let mut session = Session::new();
    let uncaptured = Rc::new(RefCell::new(Vec::<ErrorReport>::new()));
    let seen = Rc::clone(&uncaptured);
    session
        .client
        .set_uncaptured_error_callback(move |report| seen.borrow_mut().push(report.clone()));

    let context = session.client.create_context("cpu");
    let builder = context.create_graph_builder();
    let x = builder.input("x", &OperandDescriptor::float32(vec![4]));
    let bad = builder.transpose(
        &x,
        &TransposeOptions {
            permutation: Some(vec![1, 0]),
        },
    );
    let poisoned = builder.split(&bad, &[2], &SplitOptions::default());
    let _ = builder.relu(&poisoned.get(1));

    // The client counts every declared output; the server keeps one.
    let huge = builder.split(&x, &[u32::MAX], &SplitOptions::default());
    assert_eq!(huge.len(), u32::MAX as usize);
    let _ = builder.relu(&huge.get(3));
    session.pump();

    assert!(!session.server.is_terminated());
    let reports = uncaptured.borrow();
    assert_eq!(reports.len(), 2, "{reports:?}");
    assert!(reports[0].message.starts_with("transpose"), "{}", reports[0].message);
    assert!(reports[1].message.contains("limit"), "{}", reports[1].message);
}

#[test]
fn unknown_backend_yields_a_failing_graph() {
    let mut session = Session::new();
    let uncaptured = Rc::new(RefCell::new(Vec::<ErrorReport>::new()));
    let seen = Rc::clone(&uncaptured);
    session
        .client
        .set_uncaptured_error_callback(move |report| seen.borrow_mut().push(report.clone()));

    let context = session.client.create_context("no-such-backend");
    let builder = context.create_graph_builder();
    let x = builder.input("x", &OperandDescriptor::float32(vec![1]));
    let outputs = session.client.create_named_operands();
    outputs.set("x", &x);
    let graph = builder.build(&outputs);
    let (result, callback) = slot::<ComputeResult>();
    graph.compute_async(&session.client.create_named_inputs(), callback);
    session.pump();

    assert!(!session.server.is_terminated());
    assert!(uncaptured
        .borrow()
        .iter()
        .any(|report| report.ty == ErrorType::ContextLost));
    let result = result.borrow_mut().take().expect("compute answered");
    assert!(result.is_err());
}

#[test]
fn disconnect_fails_pending_and_later_callbacks() {
    let mut session = Session::new();
    let context = session.client.create_context("cpu");
    let builder = context.create_graph_builder();
    let x = builder.input("x", &OperandDescriptor::float32(vec![1]));
    let outputs = session.client.create_named_operands();
    outputs.set("x", &x);
    let graph = builder.build(&outputs);
    let inputs = session.client.create_named_inputs();
    inputs.set("x", Tensor::from_f32(vec![1], &[1.0]));
    context.push_error_scope(ErrorFilter::Validation);

    let (pending, callback) = slot::<ComputeResult>();
    graph.compute_async(&inputs, callback);
    let (popped, pop_callback) = slot::<ErrorReport>();
    context.pop_error_scope(pop_callback);

    session.client.disconnect();
    assert!(session.client.is_disconnected());
    let pending = pending.borrow_mut().take().expect("failed on disconnect");
    assert_eq!(pending.unwrap_err().ty, ErrorType::ContextLost);
    assert_eq!(
        popped.borrow_mut().take().expect("failed on disconnect").ty,
        ErrorType::ContextLost
    );

    let sent = session.commands.len();
    let (later, callback) = slot::<ComputeResult>();
    graph.compute_async(&inputs, callback);
    let later = later.borrow_mut().take().expect("answered locally");
    assert_eq!(later.unwrap_err().ty, ErrorType::ContextLost);
    let _ = session.client.create_named_operands();
    assert_eq!(session.commands.len(), sent);
    assert!(!session.client.flush());

    // Answers that were already in flight are ignored.
    session.pump();
}
