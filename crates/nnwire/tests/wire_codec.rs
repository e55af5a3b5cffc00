use nnwire::graph::options::{
    BatchNormOptions, ClampOptions, Conv2dOptions, ConvTranspose2dOptions, GemmOptions,
    GruOptions, InstanceNormOptions, LeakyReluOptions, PadOptions, Pool2dOptions, ReduceOptions,
    Resample2dOptions, SliceOptions, SplitOptions, SqueezeOptions, TransposeOptions,
};
use nnwire::graph::{BinaryOp, Pool2dKind, ReduceOp, UnaryOp};
use nnwire::wire::command::{decode_payload, encode_frame, FrameReader};
use nnwire::wire::{
    Command, CommandBuffer, ObjectHandle, ObjectType, Opcode, RegistryError, ReturnCommand,
    Server, WireError,
};
use nnwire::{
    Context, ErrorFilter, ErrorReport, ErrorType, NamedOutputs, OperandDescriptor, Tensor,
    WireConfig,
};
use proptest::prelude::*;

const LIMIT: usize = 1 << 20;

fn h(id: u32) -> ObjectHandle {
    ObjectHandle::new(id, 0)
}

fn frames(commands: &[Command]) -> Vec<u8> {
    commands
        .iter()
        .flat_map(|command| encode_frame(command, LIMIT).unwrap())
        .collect()
}

fn offline_server() -> (Server, CommandBuffer) {
    let returns = CommandBuffer::new();
    let config = WireConfig::default().with_max_command_bytes(LIMIT);
    let server = Server::with_config(returns.clone(), config)
        .with_backend_resolver(|name| Context::unavailable(name));
    (server, returns)
}

#[test]
fn opcodes_follow_declaration_order() {
    assert_eq!(Opcode::DestroyObject as u32, 0);
    assert_eq!(Opcode::CreateContext as u32, 1);
    assert_eq!(Opcode::CreateNamedOperands as u32, 5);
    assert_eq!(Opcode::GraphComputeAsync as u32, Opcode::ALL.len() as u32 - 1);
    for (index, opcode) in Opcode::ALL.iter().enumerate() {
        assert_eq!(*opcode as usize, index);
        assert_eq!(Opcode::try_from(index as u32).unwrap(), *opcode);
    }
    assert!(matches!(
        Opcode::try_from(Opcode::ALL.len() as u32),
        Err(WireError::UnknownOpcode(_))
    ));
}

/// One command of every kind, in opcode order.
fn one_of_each_command() -> Vec<Command> {
    vec![
        Command::DestroyObject {
            object_type: ObjectType::Graph,
            id: 9,
        },
        Command::CreateContext {
            backend: "cpu".into(),
            result: h(1),
        },
        Command::ContextPushErrorScope {
            filter: ErrorFilter::OutOfMemory,
            context: h(1),
        },
        Command::ContextPopErrorScope {
            request_serial: u64::MAX,
            context: h(1),
        },
        Command::ContextCreateGraphBuilder {
            context: h(1),
            result: ObjectHandle::new(2, 7),
        },
        Command::CreateNamedOperands { result: h(1) },
        Command::NamedOperandsSet {
            name: "out".into(),
            named_operands: h(1),
            operand: h(6),
        },
        Command::CreateNamedInputs { result: h(3) },
        Command::NamedInputsSet {
            name: "x".into(),
            input: Tensor::from_f32(vec![2], &[1.5, -2.0]),
            named_inputs: h(3),
        },
        Command::BuilderInput {
            name: "x".into(),
            desc: OperandDescriptor::float32(vec![1, 3, 8, 8]),
            builder: h(2),
            result: h(1),
        },
        Command::BuilderConstant {
            desc: OperandDescriptor::float32(vec![1]),
            data: 0.5f32.to_le_bytes().to_vec(),
            builder: h(2),
            result: h(2),
        },
        Command::BuilderBinary {
            op: BinaryOp::Pow,
            builder: h(2),
            a: h(1),
            b: h(2),
            result: h(3),
        },
        Command::BuilderUnary {
            op: UnaryOp::Softmax,
            builder: h(2),
            input: h(3),
            result: h(4),
        },
        Command::BuilderLeakyRelu {
            options: LeakyReluOptions { alpha: 0.1 },
            builder: h(2),
            input: h(4),
            result: h(5),
        },
        Command::BuilderClamp {
            options: ClampOptions {
                min_value: -1.0,
                max_value: 6.0,
            },
            builder: h(2),
            input: h(5),
            result: h(6),
        },
        Command::BuilderConv2d {
            options: Conv2dOptions {
                padding: Some(vec![1, 1, 1, 1]),
                groups: 2,
                bias: Some(h(2)),
                ..Default::default()
            },
            builder: h(2),
            input: h(1),
            filter: h(3),
            result: h(7),
        },
        Command::BuilderConvTranspose2d {
            options: ConvTranspose2dOptions {
                output_padding: Some(vec![1, 0]),
                ..Default::default()
            },
            builder: h(2),
            input: h(1),
            filter: h(3),
            result: h(8),
        },
        Command::BuilderPool2d {
            kind: Pool2dKind::L2,
            options: Pool2dOptions {
                window_dimensions: Some(vec![2, 2]),
                ..Default::default()
            },
            builder: h(2),
            input: h(1),
            result: h(9),
        },
        Command::BuilderBatchNorm {
            options: BatchNormOptions {
                scale: Some(h(4)),
                epsilon: 1e-3,
                ..Default::default()
            },
            builder: h(2),
            input: h(1),
            mean: h(2),
            variance: h(3),
            result: h(10),
        },
        Command::BuilderInstanceNorm {
            options: InstanceNormOptions {
                bias: Some(h(5)),
                ..Default::default()
            },
            builder: h(2),
            input: h(1),
            result: h(11),
        },
        Command::BuilderGemm {
            options: GemmOptions {
                c: Some(h(2)),
                b_transpose: true,
                ..Default::default()
            },
            builder: h(2),
            a: h(3),
            b: h(4),
            result: h(12),
        },
        Command::BuilderGru {
            steps: 3,
            hidden_size: 2,
            options: GruOptions {
                initial_hidden_state: Some(h(5)),
                return_sequence: true,
                ..Default::default()
            },
            builder: h(2),
            input: h(1),
            weight: h(3),
            recurrent_weight: h(4),
            result: h(1),
        },
        Command::BuilderPad {
            options: PadOptions {
                value: 2.5,
                ..Default::default()
            },
            padding: vec![0, 0, 1, 1, 1, 1, 0, 0],
            builder: h(2),
            input: h(1),
            result: h(13),
        },
        Command::BuilderReduce {
            op: ReduceOp::ArgMax,
            options: ReduceOptions {
                axes: Some(vec![-1]),
                keep_dimensions: true,
            },
            builder: h(2),
            input: h(1),
            result: h(14),
        },
        Command::BuilderResample2d {
            options: Resample2dOptions {
                scales: Some(vec![2.0, 2.0]),
                ..Default::default()
            },
            builder: h(2),
            input: h(1),
            result: h(15),
        },
        Command::BuilderReshape {
            new_shape: vec![1, -1],
            builder: h(2),
            input: h(1),
            result: h(16),
        },
        Command::BuilderSlice {
            starts: vec![-1, 0],
            sizes: vec![1, -1],
            options: SliceOptions {
                axes: Some(vec![0, 1]),
            },
            builder: h(2),
            input: h(1),
            result: h(17),
        },
        Command::BuilderSplit {
            options: SplitOptions { axis: -1 },
            splits: vec![2, 6],
            builder: h(2),
            input: h(1),
            result: h(2),
        },
        Command::BuilderSqueeze {
            options: SqueezeOptions { axes: None },
            builder: h(2),
            input: h(1),
            result: h(18),
        },
        Command::BuilderTranspose {
            options: TransposeOptions {
                permutation: Some(vec![0, 2, 3, 1]),
            },
            builder: h(2),
            input: h(1),
            result: h(19),
        },
        Command::BuilderConcat {
            axis: 1,
            inputs: vec![h(18), h(19), ObjectHandle::new(20, 3)],
            builder: h(2),
            result: h(21),
        },
        Command::BuilderBuild {
            builder: h(2),
            named_operands: h(1),
            result: h(1),
        },
        Command::OperandArrayGet {
            index: 1,
            array: h(2),
            result: h(22),
        },
        Command::GraphComputeAsync {
            request_serial: 42,
            graph: h(1),
            inputs: h(3),
        },
    ]
}

#[test]
fn every_command_survives_the_frame_codec() {
    let commands = one_of_each_command();
    let opcodes: Vec<Opcode> = commands.iter().map(Command::opcode).collect();
    assert_eq!(opcodes, Opcode::ALL);

    let bytes = frames(&commands);
    let decoded: Vec<Command> = FrameReader::new(&bytes, LIMIT)
        .map(|payload| decode_payload(payload.unwrap()).unwrap())
        .collect();
    assert_eq!(decoded, commands);

    for (payload, command) in FrameReader::new(&bytes, LIMIT).zip(&commands) {
        let payload = payload.unwrap();
        let opcode = u32::from_le_bytes(payload[..4].try_into().unwrap());
        assert_eq!(opcode, command.opcode() as u32);
    }
}

#[test]
fn every_return_command_carries_tensors_and_reports() {
    let mut outputs = NamedOutputs::new();
    outputs.insert("y", Tensor::from_i32(vec![3], &[1, 2, 3]));
    let replies = vec![
        ReturnCommand::ErrorScopePopped {
            request_serial: 5,
            report: ErrorReport::new(ErrorType::OutOfMemory, "too big"),
        },
        ReturnCommand::ComputeDone {
            request_serial: 4,
            result: Ok(outputs),
        },
        ReturnCommand::ComputeDone {
            request_serial: 6,
            result: Err(ErrorReport::new(ErrorType::Validation, "missing input `x`")),
        },
        ReturnCommand::UncapturedError {
            report: ErrorReport::no_error(),
        },
    ];
    let bytes: Vec<u8> = replies
        .iter()
        .flat_map(|reply| encode_frame(reply, LIMIT).unwrap())
        .collect();
    let decoded: Vec<ReturnCommand> = FrameReader::new(&bytes, LIMIT)
        .map(|payload| decode_payload(payload.unwrap()).unwrap())
        .collect();
    assert_eq!(decoded, replies);

    let opcodes: Vec<u32> = FrameReader::new(&bytes, LIMIT)
        .map(|payload| u32::from_le_bytes(payload.unwrap()[..4].try_into().unwrap()))
        .collect();
    assert_eq!(opcodes, vec![0, 1, 1, 2]);
    assert_eq!(ReturnCommand::OPCODE_COUNT, 3);

    let unknown = ReturnCommand::OPCODE_COUNT.to_le_bytes();
    assert!(matches!(
        decode_payload::<ReturnCommand>(&unknown),
        Err(WireError::UnknownOpcode(3))
    ));
}

#[test]
fn truncated_frame_terminates_the_server() {
    let (mut server, _) = offline_server();
    let mut bytes = frames(&[
        Command::CreateNamedOperands { result: h(1) },
        Command::CreateNamedInputs { result: h(1) },
    ]);
    bytes.pop();
    let err = server.handle_commands(&bytes).unwrap_err();
    assert!(matches!(err, WireError::Truncated { .. }), "{err:?}");
    // Frames before the damaged one were executed.
    assert_eq!(server.live_objects(ObjectType::NamedOperands), 1);
    assert_eq!(server.live_objects(ObjectType::NamedInputs), 0);
    assert!(server.is_terminated());
    assert!(matches!(
        server.handle_commands(&frames(&[Command::CreateNamedInputs { result: h(2) }])),
        Err(WireError::Terminated)
    ));
}

#[test]
fn unknown_opcode_terminates_the_server() {
    let (mut server, _) = offline_server();
    let mut bytes = 4u32.to_le_bytes().to_vec();
    bytes.extend_from_slice(&(Opcode::ALL.len() as u32).to_le_bytes());
    let err = server.handle_commands(&bytes).unwrap_err();
    assert!(matches!(err, WireError::UnknownOpcode(_)), "{err:?}");
    assert!(server.is_terminated());
}

#[test]
fn oversized_frames_are_refused_on_both_ends() {
    let command = Command::CreateContext {
        backend: "x".repeat(64),
        result: h(1),
    };
    assert!(matches!(
        encode_frame(&command, 16),
        Err(WireError::FrameTooLarge { limit: 16, .. })
    ));

    let returns = CommandBuffer::new();
    let mut server = Server::with_config(returns, WireConfig::default().with_max_command_bytes(16))
        .with_backend_resolver(|name| Context::unavailable(name));
    let err = server.handle_commands(&frames(&[command])).unwrap_err();
    assert!(matches!(err, WireError::FrameTooLarge { limit: 16, .. }), "{err:?}");
    assert_eq!(server.live_objects(ObjectType::Context), 0);
}

#[test]
fn reused_and_stale_handles_are_fatal() {
    let (mut server, _) = offline_server();
    let err = server
        .handle_commands(&frames(&[
            Command::CreateNamedOperands { result: h(2) },
            Command::CreateNamedOperands { result: h(2) },
        ]))
        .unwrap_err();
    assert!(matches!(
        err,
        WireError::Registry {
            object_type: ObjectType::NamedOperands,
            source: RegistryError::IdInUse(2),
        }
    ));

    let (mut server, _) = offline_server();
    let err = server
        .handle_commands(&frames(&[
            Command::CreateContext {
                backend: "none".into(),
                result: h(1),
            },
            Command::DestroyObject {
                object_type: ObjectType::Context,
                id: 1,
            },
            Command::CreateContext {
                backend: "none".into(),
                result: ObjectHandle::new(1, 1),
            },
            Command::ContextPushErrorScope {
                filter: ErrorFilter::Validation,
                context: h(1),
            },
        ]))
        .unwrap_err();
    assert!(matches!(
        err,
        WireError::Registry {
            object_type: ObjectType::Context,
            source: RegistryError::StaleHandle {
                live_generation: 1,
                ..
            },
        }
    ));
}

#[test]
fn destroying_an_unknown_id_is_fatal() {
    let (mut server, _) = offline_server();
    let err = server
        .handle_commands(&frames(&[Command::DestroyObject {
            object_type: ObjectType::Graph,
            id: 9,
        }]))
        .unwrap_err();
    assert!(matches!(
        err,
        WireError::Registry {
            object_type: ObjectType::Graph,
            source: RegistryError::UnknownHandle(_),
        }
    ));
    assert!(server.is_terminated());
}

#[test]
fn builder_commands_replay_against_the_named_builder() {
    let (mut server, returns) = offline_server();
    server
        .handle_commands(&frames(&[
            Command::CreateContext {
                backend: "none".into(),
                result: h(1),
            },
            Command::ContextPushErrorScope {
                filter: ErrorFilter::Validation,
                context: h(1),
            },
            Command::ContextCreateGraphBuilder {
                context: h(1),
                result: h(1),
            },
            Command::BuilderInput {
                name: "x".into(),
                desc: OperandDescriptor::float32(vec![2]),
                builder: h(1),
                result: h(1),
            },
            Command::ContextPopErrorScope {
                request_serial: 1,
                context: h(1),
            },
        ]))
        .unwrap();
    assert_eq!(server.live_objects(ObjectType::GraphBuilder), 1);
    assert_eq!(server.live_objects(ObjectType::Operand), 1);

    let bytes = returns.take();
    let replies: Vec<ReturnCommand> = FrameReader::new(&bytes, LIMIT)
        .map(|payload| decode_payload(payload.unwrap()).unwrap())
        .collect();
    // The lost backend is reported to the scope and to the root.
    assert!(replies.iter().any(|reply| matches!(
        reply,
        ReturnCommand::ErrorScopePopped { request_serial: 1, report }
            if report.ty == ErrorType::ContextLost
    )));
    assert!(replies.iter().any(|reply| matches!(
        reply,
        ReturnCommand::UncapturedError { report } if report.ty == ErrorType::ContextLost
    )));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn arbitrary_bytes_never_panic_the_server(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
        let (mut server, _) = offline_server();
        match server.handle_commands(&bytes) {
            Ok(()) => prop_assert!(!server.is_terminated()),
            Err(_) => prop_assert!(server.is_terminated()),
        }
    }
}
