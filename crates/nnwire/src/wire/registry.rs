//! Generation-checked id → object table, one per object type per connection.
//!
//! The client allocates ids (reusing freed ones with a bumped generation); the
//! server mirrors them by inserting at the ids the client chose. Resolving a
//! handle checks its generation against the slot, so stale handles are
//! detected rather than silently aliasing a newer object.

use thiserror::Error;

use super::handle::{ObjectHandle, ObjectId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("handle {handle} is stale (live generation is {live_generation})")]
    StaleHandle {
        handle: ObjectHandle,
        live_generation: u32,
    },
    #[error("handle {0} does not name a live object")]
    UnknownHandle(ObjectHandle),
    #[error("object id {0} is already live")]
    IdInUse(ObjectId),
}

struct Slot<T> {
    generation: u32,
    refcount: u32,
    object: Option<T>,
}

impl<T> Slot<T> {
    fn vacant() -> Self {
        Self {
            generation: 0,
            refcount: 0,
            object: None,
        }
    }
}

pub struct ObjectRegistry<T> {
    slots: Vec<Slot<T>>,
    free_ids: Vec<ObjectId>,
    live: usize,
}

impl<T> Default for ObjectRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ObjectRegistry<T> {
    pub fn new() -> Self {
        Self {
            // Slot 0 backs the reserved id and is never handed out.
            slots: vec![Slot::vacant()],
            free_ids: Vec::new(),
            live: 0,
        }
    }

    /// Stores `object` under a fresh or recycled id with a reference count of one.
    pub fn allocate(&mut self, object: T) -> ObjectHandle {
        let id = match self.free_ids.pop() {
            Some(id) => id,
            None => {
                self.slots.push(Slot::vacant());
                (self.slots.len() - 1) as ObjectId
            }
        };
        let slot = &mut self.slots[id as usize];
        slot.object = Some(object);
        slot.refcount = 1;
        self.live += 1;
        ObjectHandle::new(id, slot.generation)
    }

    /// Stores `object` at exactly `handle`, as chosen by the peer.
    ///
    /// Fails with `IdInUse` if the id is live and with `StaleHandle` if the
    /// generation is older than one already seen for that id.
    pub fn insert(&mut self, handle: ObjectHandle, object: T) -> Result<(), RegistryError> {
        if handle.id == 0 {
            return Err(RegistryError::UnknownHandle(handle));
        }
        let index = handle.id as usize;
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, Slot::vacant);
        }
        let slot = &mut self.slots[index];
        if slot.object.is_some() {
            return Err(RegistryError::IdInUse(handle.id));
        }
        if handle.generation < slot.generation {
            return Err(RegistryError::StaleHandle {
                handle,
                live_generation: slot.generation,
            });
        }
        slot.generation = handle.generation;
        slot.object = Some(object);
        slot.refcount = 1;
        self.live += 1;
        self.free_ids.retain(|&id| id != handle.id);
        Ok(())
    }

    fn slot(&self, handle: ObjectHandle) -> Result<&Slot<T>, RegistryError> {
        let slot = self
            .slots
            .get(handle.id as usize)
            .filter(|_| handle.id != 0)
            .ok_or(RegistryError::UnknownHandle(handle))?;
        // A vacant slot still recognizes the generations it has retired.
        if slot.object.is_none() && handle.generation >= slot.generation {
            return Err(RegistryError::UnknownHandle(handle));
        }
        if slot.generation != handle.generation {
            return Err(RegistryError::StaleHandle {
                handle,
                live_generation: slot.generation,
            });
        }
        Ok(slot)
    }

    fn slot_mut(&mut self, handle: ObjectHandle) -> Result<&mut Slot<T>, RegistryError> {
        self.slot(handle)?;
        Ok(&mut self.slots[handle.id as usize])
    }

    pub fn resolve(&self, handle: ObjectHandle) -> Result<&T, RegistryError> {
        let slot = self.slot(handle)?;
        Ok(slot.object.as_ref().expect("slot checked live"))
    }

    pub fn resolve_mut(&mut self, handle: ObjectHandle) -> Result<&mut T, RegistryError> {
        let slot = self.slot_mut(handle)?;
        Ok(slot.object.as_mut().expect("slot checked live"))
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.slot(handle).is_ok()
    }

    /// Adds a reference and returns the new count.
    pub fn reference(&mut self, handle: ObjectHandle) -> Result<u32, RegistryError> {
        let slot = self.slot_mut(handle)?;
        slot.refcount += 1;
        Ok(slot.refcount)
    }

    /// Drops a reference. Returns the object when this was the last one, after
    /// freeing its slot.
    pub fn release(&mut self, handle: ObjectHandle) -> Result<Option<T>, RegistryError> {
        let slot = self.slot_mut(handle)?;
        slot.refcount -= 1;
        if slot.refcount > 0 {
            return Ok(None);
        }
        self.free(handle).map(Some)
    }

    /// Removes the object regardless of its reference count and bumps the
    /// slot's generation so that `handle` becomes stale.
    pub fn free(&mut self, handle: ObjectHandle) -> Result<T, RegistryError> {
        let slot = self.slot_mut(handle)?;
        let object = slot.object.take().expect("slot checked live");
        slot.refcount = 0;
        slot.generation = slot.generation.wrapping_add(1);
        self.live -= 1;
        self.free_ids.push(handle.id);
        Ok(object)
    }

    /// Frees whatever currently lives at `id`.
    pub fn free_id(&mut self, id: ObjectId) -> Result<T, RegistryError> {
        let generation = self
            .slots
            .get(id as usize)
            .map(|slot| slot.generation)
            .unwrap_or(0);
        self.free(ObjectHandle::new(id, generation))
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Handles of every live object, in id order.
    pub fn handles(&self) -> impl Iterator<Item = ObjectHandle> + '_ {
        self.slots
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, slot)| slot.object.is_some())
            .map(|(id, slot)| ObjectHandle::new(id as ObjectId, slot.generation))
    }
}
