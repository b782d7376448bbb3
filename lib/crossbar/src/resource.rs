//! Generic descriptor state shared by every connector family: a small flag
//! set and a fixed-size pool with a pluggable allocation policy.
//!
//! The pool is not synchronized; callers hold the process-wide table lock
//! while allocating, flipping flags or releasing.

use crate::shared::{IpcError, IpcResult};

const FLAG_USED: u8 = 1 << 0;
const FLAG_BUSY: u8 = 1 << 1;
const FLAG_WRITE: u8 = 1 << 2;
const FLAG_READ: u8 = 1 << 3;
const FLAG_ASYNC: u8 = 1 << 4;

/// Generic descriptor flags.
#[derive(Debug, Default, Copy, Clone)]
pub struct Resource {
    flags: u8,
}

impl Resource {
    #[inline]
    pub fn set_used(&mut self) {
        self.flags |= FLAG_USED;
    }

    #[inline]
    pub fn set_unused(&mut self) {
        self.flags &= !FLAG_USED;
    }

    #[inline]
    pub fn set_busy(&mut self) {
        self.flags |= FLAG_BUSY;
    }

    #[inline]
    pub fn set_notbusy(&mut self) {
        self.flags &= !FLAG_BUSY;
    }

    /// Marks the descriptor write-only. Readable and writable are exclusive.
    #[inline]
    pub fn set_wronly(&mut self) {
        self.flags |= FLAG_WRITE;
        self.flags &= !FLAG_READ;
    }

    /// Marks the descriptor read-only. Readable and writable are exclusive.
    #[inline]
    pub fn set_rdonly(&mut self) {
        self.flags |= FLAG_READ;
        self.flags &= !FLAG_WRITE;
    }

    #[inline]
    pub fn set_async(&mut self) {
        self.flags |= FLAG_ASYNC;
    }

    #[inline]
    pub fn set_sync(&mut self) {
        self.flags &= !FLAG_ASYNC;
    }

    #[inline]
    pub fn is_used(&self) -> bool {
        self.flags & FLAG_USED != 0
    }

    #[inline]
    pub fn is_busy(&self) -> bool {
        self.flags & FLAG_BUSY != 0
    }

    #[inline]
    pub fn is_wronly(&self) -> bool {
        self.flags & FLAG_WRITE != 0
    }

    #[inline]
    pub fn is_rdonly(&self) -> bool {
        self.flags & FLAG_READ != 0
    }

    #[inline]
    pub fn is_async(&self) -> bool {
        self.flags & FLAG_ASYNC != 0
    }
}

/// Implemented by every connector descriptor stored in a pool.
pub trait PoolEntry: Default {
    fn resource(&self) -> &Resource;
    fn resource_mut(&mut self) -> &mut Resource;
}

/// Slot selection policy. Receives the slot table and returns a free index.
pub type Allocator<T> = fn(&[T]) -> Option<usize>;

/// Fixed-size table of descriptors plus an allocator.
pub struct ResourcePool<T> {
    slots: Vec<T>,
    allocator: Allocator<T>,
}

impl<T: PoolEntry> ResourcePool<T> {
    /// Creates a pool of `capacity` free slots with the first-fit allocator.
    pub fn new(capacity: usize) -> ResourcePool<T> {
        Self::with_allocator(capacity, Self::first_fit)
    }

    /// Creates a pool with a custom slot selection policy.
    pub fn with_allocator(capacity: usize, allocator: Allocator<T>) -> ResourcePool<T> {
        ResourcePool {
            slots: (0..capacity).map(|_| T::default()).collect(),
            allocator,
        }
    }

    fn first_fit(slots: &[T]) -> Option<usize> {
        slots.iter().position(|slot| !slot.resource().is_used())
    }

    /// Allocates a slot, marking it used.
    pub fn alloc(&mut self) -> IpcResult<usize> {
        let index = (self.allocator)(&self.slots).ok_or(IpcError::NoEnt)?;

        self.slots[index].resource_mut().set_used();

        Ok(index)
    }

    /// Releases a slot, resetting it to its pristine state.
    pub fn release(&mut self, index: usize) {
        assert!(index < self.slots.len(), "released index out of bounds");
        assert!(
            self.slots[index].resource().is_used(),
            "released an unused slot"
        );

        self.slots[index] = T::default();
    }

    /// Borrows a used slot, or `None` for out-of-range and unused indices.
    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots
            .get(index)
            .filter(|slot| slot.resource().is_used())
    }

    /// Mutably borrows a used slot.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots
            .get_mut(index)
            .filter(|slot| slot.resource().is_used())
    }

    /// Number of slots currently in use.
    pub fn active(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.resource().is_used())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct TestSlot {
        resource: Resource,
        payload: u32,
    }

    impl PoolEntry for TestSlot {
        fn resource(&self) -> &Resource {
            &self.resource
        }

        fn resource_mut(&mut self) -> &mut Resource {
            &mut self.resource
        }
    }

    #[test]
    fn test_flag_transitions() {
        let mut resource = Resource::default();

        resource.set_used();
        resource.set_rdonly();
        assert!(resource.is_used());
        assert!(resource.is_rdonly());
        assert!(!resource.is_wronly());

        resource.set_wronly();
        assert!(resource.is_wronly());
        assert!(!resource.is_rdonly());

        resource.set_busy();
        resource.set_async();
        assert!(resource.is_busy());
        assert!(resource.is_async());

        resource.set_notbusy();
        resource.set_sync();
        resource.set_unused();
        assert!(!resource.is_busy());
        assert!(!resource.is_async());
        assert!(!resource.is_used());
    }

    #[test]
    fn test_first_fit_order() {
        let mut pool: ResourcePool<TestSlot> = ResourcePool::new(4);

        assert_eq!(pool.alloc().unwrap(), 0);
        assert_eq!(pool.alloc().unwrap(), 1);
        assert_eq!(pool.alloc().unwrap(), 2);

        pool.release(1);
        assert_eq!(pool.alloc().unwrap(), 1);
    }

    #[test]
    fn test_exhaustion() {
        let mut pool: ResourcePool<TestSlot> = ResourcePool::new(2);

        pool.alloc().unwrap();
        pool.alloc().unwrap();
        assert_eq!(pool.alloc().unwrap_err(), IpcError::NoEnt);
        assert_eq!(pool.active(), 2);
    }

    #[test]
    fn test_release_resets_slot() {
        let mut pool: ResourcePool<TestSlot> = ResourcePool::new(1);

        let id = pool.alloc().unwrap();
        pool.get_mut(id).unwrap().payload = 99;
        pool.release(id);

        assert_eq!(pool.active(), 0);
        assert!(pool.get(id).is_none());

        let id = pool.alloc().unwrap();
        assert_eq!(pool.get(id).unwrap().payload, 0);
    }

    #[test]
    fn test_allocator_override() {
        fn last_fit(slots: &[TestSlot]) -> Option<usize> {
            slots.iter().rposition(|slot| !slot.resource().is_used())
        }

        let mut pool: ResourcePool<TestSlot> = ResourcePool::with_allocator(3, last_fit);

        assert_eq!(pool.alloc().unwrap(), 2);
        assert_eq!(pool.alloc().unwrap(), 1);
    }

    #[test]
    fn test_get_rejects_unused() {
        let pool: ResourcePool<TestSlot> = ResourcePool::new(2);

        assert!(pool.get(0).is_none());
        assert!(pool.get(17).is_none());
    }
}
