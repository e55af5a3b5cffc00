//! Ownership check run before a client call is serialized.

use std::sync::atomic::{AtomicU64, Ordering};

use super::handle::{ObjectHandle, ObjectType};
use super::WireError;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
    }
}

/// A client-side object as seen by the guard.
pub(crate) trait WireObject {
    fn connection(&self) -> ConnectionId;
    fn object_type(&self) -> ObjectType;
    fn handle(&self) -> ObjectHandle;
    /// Whether the server was told about this object.
    fn is_registered(&self) -> bool;
}

/// Collects the handles of one call's object arguments and remembers the first
/// argument that must not be sent: one owned by another connection, or one
/// that was poisoned locally and never registered on the server.
pub(crate) struct ConnectionGuard {
    connection: ConnectionId,
    rejected: Option<WireError>,
}

impl ConnectionGuard {
    /// Starts a check for a call on `target`.
    pub(crate) fn new(target: &impl WireObject) -> Self {
        let mut guard = Self {
            connection: target.connection(),
            rejected: None,
        };
        guard.check(target);
        guard
    }

    pub(crate) fn check(&mut self, object: &impl WireObject) -> ObjectHandle {
        if self.rejected.is_none() {
            if object.connection() != self.connection {
                self.rejected = Some(WireError::CrossConnection {
                    object_type: object.object_type(),
                });
            } else if !object.is_registered() {
                self.rejected = Some(WireError::Poisoned {
                    object_type: object.object_type(),
                });
            }
        }
        object.handle()
    }

    pub(crate) fn finish(self) -> Result<(), WireError> {
        match self.rejected {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fake {
        connection: ConnectionId,
        registered: bool,
    }

    impl WireObject for Fake {
        fn connection(&self) -> ConnectionId {
            self.connection
        }

        fn object_type(&self) -> ObjectType {
            ObjectType::Operand
        }

        fn handle(&self) -> ObjectHandle {
            ObjectHandle::new(1, 0)
        }

        fn is_registered(&self) -> bool {
            self.registered
        }
    }

    #[test]
    fn foreign_arguments_are_rejected() {
        let here = ConnectionId::next();
        let there = ConnectionId::next();
        let target = Fake { connection: here, registered: true };

        let mut guard = ConnectionGuard::new(&target);
        guard.check(&Fake { connection: here, registered: true });
        assert!(guard.finish().is_ok());

        let mut guard = ConnectionGuard::new(&target);
        guard.check(&Fake { connection: there, registered: true });
        guard.check(&Fake { connection: here, registered: false });
        assert!(matches!(
            guard.finish(),
            Err(WireError::CrossConnection { object_type: ObjectType::Operand })
        ));
    }

    #[test]
    fn unregistered_arguments_are_rejected() {
        let here = ConnectionId::next();
        let target = Fake { connection: here, registered: false };
        assert!(matches!(
            ConnectionGuard::new(&target).finish(),
            Err(WireError::Poisoned { .. })
        ));
    }
}
