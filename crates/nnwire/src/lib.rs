//! Neural-network graph construction with eager shape validation, plus a
//! handle-based wire protocol that replays the builder API on a remote server.
//!
//! The local API lives in [`graph`] and [`context`]; [`wire`] mirrors it across
//! a byte stream. Backends plug in through the traits in [`backend::spec`].

extern crate self as nnwire;

pub mod backend;
pub mod context;
mod env;
pub mod error;
pub mod graph;
pub mod logging;
pub mod tensor;
pub mod wire;

pub use backend::spec::{Backend, BackendError, BackendResult, OperandDescriptor, OperandType};
pub use context::{Context, ErrorFilter, ErrorReport, ErrorType};
pub use env::WireConfig;
pub use error::{BuildError, ComputeError, ValidationError};
pub use graph::{Graph, GraphBuilder, NamedOperands, Operand, OperandArray};
pub use tensor::{NamedInputs, NamedOutputs, Tensor};
