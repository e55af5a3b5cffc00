//! Command definitions and their frame encoding.
//!
//! A frame is `[u32 payload length][payload]`, little endian. The payload is the
//! `bincode` encoding of a [`Command`] (client → server) or [`ReturnCommand`]
//! (server → client): a `u32` opcode (the variant index), then the variant's
//! fields in declaration order. Fields are declared scalars first, then
//! strings and arrays (each `u64`-length-prefixed), then object handles, with
//! the handle of the created object, if any, last.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::backend::spec::OperandDescriptor;
use crate::context::{ErrorFilter, ErrorReport};
use crate::graph::ops::{BinaryOp, Pool2dKind, ReduceOp, UnaryOp};
use crate::graph::options::{
    BatchNormOptions, ClampOptions, Conv2dOptions, ConvTranspose2dOptions, GemmOptions,
    GruOptions, InstanceNormOptions, LeakyReluOptions, PadOptions, Pool2dOptions, ReduceOptions,
    Resample2dOptions, SliceOptions, SplitOptions, SqueezeOptions, TransposeOptions,
};
use crate::tensor::{NamedOutputs, Tensor};

use super::handle::{ObjectHandle, ObjectId, ObjectType};
use super::WireError;

const FRAME_HEADER: usize = 4;

/// Client → server commands. The variant index is the opcode; see [`Opcode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    DestroyObject {
        object_type: ObjectType,
        id: ObjectId,
    },
    CreateContext {
        backend: String,
        result: ObjectHandle,
    },
    ContextPushErrorScope {
        filter: ErrorFilter,
        context: ObjectHandle,
    },
    ContextPopErrorScope {
        request_serial: u64,
        context: ObjectHandle,
    },
    ContextCreateGraphBuilder {
        context: ObjectHandle,
        result: ObjectHandle,
    },
    CreateNamedOperands {
        result: ObjectHandle,
    },
    NamedOperandsSet {
        name: String,
        named_operands: ObjectHandle,
        operand: ObjectHandle,
    },
    CreateNamedInputs {
        result: ObjectHandle,
    },
    NamedInputsSet {
        name: String,
        input: Tensor,
        named_inputs: ObjectHandle,
    },
    BuilderInput {
        name: String,
        desc: OperandDescriptor,
        builder: ObjectHandle,
        result: ObjectHandle,
    },
    BuilderConstant {
        desc: OperandDescriptor,
        data: Vec<u8>,
        builder: ObjectHandle,
        result: ObjectHandle,
    },
    BuilderBinary {
        op: BinaryOp,
        builder: ObjectHandle,
        a: ObjectHandle,
        b: ObjectHandle,
        result: ObjectHandle,
    },
    BuilderUnary {
        op: UnaryOp,
        builder: ObjectHandle,
        input: ObjectHandle,
        result: ObjectHandle,
    },
    BuilderLeakyRelu {
        options: LeakyReluOptions,
        builder: ObjectHandle,
        input: ObjectHandle,
        result: ObjectHandle,
    },
    BuilderClamp {
        options: ClampOptions,
        builder: ObjectHandle,
        input: ObjectHandle,
        result: ObjectHandle,
    },
    BuilderConv2d {
        options: Conv2dOptions<ObjectHandle>,
        builder: ObjectHandle,
        input: ObjectHandle,
        filter: ObjectHandle,
        result: ObjectHandle,
    },
    BuilderConvTranspose2d {
        options: ConvTranspose2dOptions<ObjectHandle>,
        builder: ObjectHandle,
        input: ObjectHandle,
        filter: ObjectHandle,
        result: ObjectHandle,
    },
    BuilderPool2d {
        kind: Pool2dKind,
        options: Pool2dOptions,
        builder: ObjectHandle,
        input: ObjectHandle,
        result: ObjectHandle,
    },
    BuilderBatchNorm {
        options: BatchNormOptions<ObjectHandle>,
        builder: ObjectHandle,
        input: ObjectHandle,
        mean: ObjectHandle,
        variance: ObjectHandle,
        result: ObjectHandle,
    },
    BuilderInstanceNorm {
        options: InstanceNormOptions<ObjectHandle>,
        builder: ObjectHandle,
        input: ObjectHandle,
        result: ObjectHandle,
    },
    BuilderGemm {
        options: GemmOptions<ObjectHandle>,
        builder: ObjectHandle,
        a: ObjectHandle,
        b: ObjectHandle,
        result: ObjectHandle,
    },
    BuilderGru {
        steps: u32,
        hidden_size: u32,
        options: GruOptions<ObjectHandle>,
        builder: ObjectHandle,
        input: ObjectHandle,
        weight: ObjectHandle,
        recurrent_weight: ObjectHandle,
        result: ObjectHandle,
    },
    BuilderPad {
        options: PadOptions,
        padding: Vec<u32>,
        builder: ObjectHandle,
        input: ObjectHandle,
        result: ObjectHandle,
    },
    BuilderReduce {
        op: ReduceOp,
        options: ReduceOptions,
        builder: ObjectHandle,
        input: ObjectHandle,
        result: ObjectHandle,
    },
    BuilderResample2d {
        options: Resample2dOptions,
        builder: ObjectHandle,
        input: ObjectHandle,
        result: ObjectHandle,
    },
    BuilderReshape {
        new_shape: Vec<i32>,
        builder: ObjectHandle,
        input: ObjectHandle,
        result: ObjectHandle,
    },
    BuilderSlice {
        starts: Vec<i32>,
        sizes: Vec<i32>,
        options: SliceOptions,
        builder: ObjectHandle,
        input: ObjectHandle,
        result: ObjectHandle,
    },
    BuilderSplit {
        options: SplitOptions,
        splits: Vec<u32>,
        builder: ObjectHandle,
        input: ObjectHandle,
        result: ObjectHandle,
    },
    BuilderSqueeze {
        options: SqueezeOptions,
        builder: ObjectHandle,
        input: ObjectHandle,
        result: ObjectHandle,
    },
    BuilderTranspose {
        options: TransposeOptions,
        builder: ObjectHandle,
        input: ObjectHandle,
        result: ObjectHandle,
    },
    BuilderConcat {
        axis: u32,
        inputs: Vec<ObjectHandle>,
        builder: ObjectHandle,
        result: ObjectHandle,
    },
    BuilderBuild {
        builder: ObjectHandle,
        named_operands: ObjectHandle,
        result: ObjectHandle,
    },
    OperandArrayGet {
        index: u32,
        array: ObjectHandle,
        result: ObjectHandle,
    },
    GraphComputeAsync {
        request_serial: u64,
        graph: ObjectHandle,
        inputs: ObjectHandle,
    },
}

/// Declares [`Opcode`] with one variant per [`Command`] variant, in the same
/// order, so that `opcode as u32` equals the encoded variant index.
macro_rules! opcodes {
    ($($name:ident),+ $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum Opcode {
            $($name),+
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name),+];
        }

        impl Command {
            pub fn opcode(&self) -> Opcode {
                match self {
                    $(Command::$name { .. } => Opcode::$name),+
                }
            }
        }
    };
}

opcodes! {
    DestroyObject,
    CreateContext,
    ContextPushErrorScope,
    ContextPopErrorScope,
    ContextCreateGraphBuilder,
    CreateNamedOperands,
    NamedOperandsSet,
    CreateNamedInputs,
    NamedInputsSet,
    BuilderInput,
    BuilderConstant,
    BuilderBinary,
    BuilderUnary,
    BuilderLeakyRelu,
    BuilderClamp,
    BuilderConv2d,
    BuilderConvTranspose2d,
    BuilderPool2d,
    BuilderBatchNorm,
    BuilderInstanceNorm,
    BuilderGemm,
    BuilderGru,
    BuilderPad,
    BuilderReduce,
    BuilderResample2d,
    BuilderReshape,
    BuilderSlice,
    BuilderSplit,
    BuilderSqueeze,
    BuilderTranspose,
    BuilderConcat,
    BuilderBuild,
    OperandArrayGet,
    GraphComputeAsync,
}

impl TryFrom<u32> for Opcode {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Opcode::ALL
            .get(value as usize)
            .copied()
            .ok_or(WireError::UnknownOpcode(value))
    }
}

/// Server → client notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReturnCommand {
    ErrorScopePopped {
        request_serial: u64,
        report: ErrorReport,
    },
    ComputeDone {
        request_serial: u64,
        result: Result<NamedOutputs, ErrorReport>,
    },
    UncapturedError {
        report: ErrorReport,
    },
}

impl ReturnCommand {
    pub const OPCODE_COUNT: u32 = 3;
}

/// A message that can travel in a frame.
pub trait WireMessage: Serialize + DeserializeOwned {
    /// Number of valid opcodes; anything at or above is rejected before decoding.
    fn opcode_count() -> u32;
}

impl WireMessage for Command {
    fn opcode_count() -> u32 {
        Opcode::ALL.len() as u32
    }
}

impl WireMessage for ReturnCommand {
    fn opcode_count() -> u32 {
        ReturnCommand::OPCODE_COUNT
    }
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

/// Serializes `message` into a length-prefixed frame.
pub fn encode_frame<M: WireMessage>(message: &M, max_payload: usize) -> Result<Vec<u8>, WireError> {
    let size = codec().serialized_size(message)? as usize;
    if size > max_payload || size > u32::MAX as usize {
        return Err(WireError::FrameTooLarge {
            size,
            limit: max_payload.min(u32::MAX as usize),
        });
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER + size);
    frame.extend_from_slice(&(size as u32).to_le_bytes());
    codec().serialize_into(&mut frame, message)?;
    Ok(frame)
}

/// Decodes one frame payload, rejecting unknown opcodes before touching the fields.
pub fn decode_payload<M: WireMessage>(payload: &[u8]) -> Result<M, WireError> {
    let Some(opcode) = payload.get(..4) else {
        return Err(WireError::Truncated {
            what: "opcode",
            available: payload.len(),
        });
    };
    let opcode = u32::from_le_bytes([opcode[0], opcode[1], opcode[2], opcode[3]]);
    if opcode >= M::opcode_count() {
        return Err(WireError::UnknownOpcode(opcode));
    }
    codec().deserialize(payload).map_err(|err| match *err {
        bincode::ErrorKind::Io(ref io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
            WireError::Truncated {
                what: "command fields",
                available: payload.len(),
            }
        }
        _ => WireError::Decode(err),
    })
}

/// Splits a byte stream into frame payloads.
///
/// After the first error the reader yields nothing further.
pub struct FrameReader<'a> {
    bytes: &'a [u8],
    max_payload: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(bytes: &'a [u8], max_payload: usize) -> Self {
        Self { bytes, max_payload }
    }

    fn fail(&mut self, err: WireError) -> Option<Result<&'a [u8], WireError>> {
        self.bytes = &[];
        Some(Err(err))
    }
}

impl<'a> Iterator for FrameReader<'a> {
    type Item = Result<&'a [u8], WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.bytes.is_empty() {
            return None;
        }
        let Some(header) = self.bytes.get(..FRAME_HEADER) else {
            let available = self.bytes.len();
            return self.fail(WireError::Truncated {
                what: "frame header",
                available,
            });
        };
        let size = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if size > self.max_payload {
            return self.fail(WireError::FrameTooLarge {
                size,
                limit: self.max_payload,
            });
        }
        let rest = &self.bytes[FRAME_HEADER..];
        if rest.len() < size {
            let available = rest.len();
            return self.fail(WireError::Truncated {
                what: "frame payload",
                available,
            });
        }
        let (payload, remaining) = rest.split_at(size);
        self.bytes = remaining;
        Some(Ok(payload))
    }
}
