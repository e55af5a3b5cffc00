use std::fmt;

use serde::{Deserialize, Serialize};

/// Numeric part of a handle. `0` is reserved and never names an object.
pub type ObjectId = u32;

/// Names an object on both ends of a connection.
///
/// The generation distinguishes successive occupants of a recycled id, so a
/// handle to a freed object can never resolve to its replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectHandle {
    pub id: ObjectId,
    pub generation: u32,
}

impl ObjectHandle {
    pub const fn new(id: ObjectId, generation: u32) -> Self {
        Self { id, generation }
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.generation)
    }
}

/// Kinds of object that travel over the wire. Each kind has its own id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectType {
    Context,
    GraphBuilder,
    Operand,
    OperandArray,
    NamedOperands,
    NamedInputs,
    Graph,
}

impl ObjectType {
    pub const COUNT: usize = 7;

    pub const ALL: [ObjectType; Self::COUNT] = [
        ObjectType::Context,
        ObjectType::GraphBuilder,
        ObjectType::Operand,
        ObjectType::OperandArray,
        ObjectType::NamedOperands,
        ObjectType::NamedInputs,
        ObjectType::Graph,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}
