//! Handle-based wire protocol.
//!
//! A [`client::Client`] mirrors the graph API: every call allocates handles for
//! the objects it creates and serializes one [`command::Command`]. A
//! [`server::Server`] decodes the same byte stream and replays the calls
//! against real [`crate::Context`]s, keyed by the client-chosen handles.
//! Results that need a round trip come back as [`command::ReturnCommand`]s.
//!
//! ```text
//! Client --(frames)--> CommandSerializer --> Server --> Context/GraphBuilder/Graph
//!    ^                                          |
//!    +--------------(return frames)-------------+
//! ```

pub mod client;
pub mod command;
mod guard;
pub mod handle;
pub mod registry;
pub mod serializer;
pub mod server;

use thiserror::Error;

pub use client::Client;
pub use command::{Command, Opcode, ReturnCommand};
pub use handle::{ObjectHandle, ObjectId, ObjectType};
pub use registry::{ObjectRegistry, RegistryError};
pub use serializer::{CommandBuffer, CommandSerializer};
pub use server::Server;

/// Failures detected while encoding, decoding, or dispatching commands.
///
/// Every variant returned by [`Server::handle_commands`] is fatal for the connection.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("truncated {what}: only {available} bytes available")]
    Truncated { what: &'static str, available: usize },
    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),
    #[error("command frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("malformed command payload: {0}")]
    Decode(#[from] bincode::Error),
    #[error("{object_type:?}: {source}")]
    Registry {
        object_type: ObjectType,
        #[source]
        source: RegistryError,
    },
    #[error("{0}")]
    InvalidCommand(String),
    #[error("{object_type:?} argument belongs to a different connection")]
    CrossConnection { object_type: ObjectType },
    #[error("{object_type:?} argument is an error object that never reached the server")]
    Poisoned { object_type: ObjectType },
    #[error("connection is disconnected")]
    Disconnected,
    #[error("connection was terminated by an earlier fatal error")]
    Terminated,
    #[error("command serializer rejected a {0} byte frame")]
    Serializer(usize),
}

impl WireError {
    pub(crate) fn registry(object_type: ObjectType) -> impl FnOnce(RegistryError) -> WireError {
        move |source| WireError::Registry {
            object_type,
            source,
        }
    }
}
