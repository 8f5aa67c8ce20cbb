use std::fmt::{Debug, Formatter};
use std::marker::PhantomData;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};

use super::{Allocator, TryCloneIn};
use crate::errors::{ErrorKind, MemoryError, MemoryResult};

const MIN_NON_ZERO_CAP: usize = 4;

/// A growable array whose buffer comes from an [`Allocator`].
///
/// Unlike `std::vec::Vec`, every operation that may allocate returns a
/// [`MemoryResult`] so that budget refusals surface to the caller instead of
/// aborting. An empty vector owns no buffer.
pub struct Vec<T> {
    ptr: NonNull<T>,
    cap: usize,
    len: usize,
    alloc: Allocator,
    _marker: PhantomData<T>,
}

// SAFETY: `Vec<T>` owns its elements; the allocator handle is `Send + Sync`.
unsafe impl<T: Send> Send for Vec<T> {}
// SAFETY: shared access only hands out `&T`.
unsafe impl<T: Sync> Sync for Vec<T> {}

impl<T> Vec<T> {
    const IS_ZST: bool = mem::size_of::<T>() == 0;

    /// Creates an empty vector without allocating.
    pub fn new_in(alloc: Allocator) -> Self {
        Vec {
            ptr: NonNull::dangling(),
            cap: if Self::IS_ZST { usize::MAX } else { 0 },
            len: 0,
            alloc,
            _marker: PhantomData,
        }
    }

    pub fn with_capacity_in(capacity: usize, alloc: Allocator) -> MemoryResult<Self> {
        let mut vec = Vec::new_in(alloc);
        vec.try_reserve(capacity)?;
        Ok(vec)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn allocator(&self) -> &Allocator {
        &self.alloc
    }

    pub fn as_slice(&self) -> &[T] {
        // SAFETY: the first `len` slots are initialized and `ptr` is non-null
        // and aligned even when nothing is allocated.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: as above, and `&mut self` guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Ensures room for at least `additional` more elements.
    pub fn try_reserve(&mut self, additional: usize) -> MemoryResult<()> {
        let required = self.len.checked_add(additional).ok_or_else(|| {
            MemoryError::new("Capacity overflow", ErrorKind::AllocationFailed)
        })?;
        if required <= self.cap {
            return Ok(());
        }

        let doubled = self.cap.saturating_mul(2);
        let new_cap = required.max(doubled).max(MIN_NON_ZERO_CAP);
        self.grow_to(new_cap)
    }

    fn grow_to(&mut self, new_cap: usize) -> MemoryResult<()> {
        let new_ptr = self.alloc.allocate::<T>(new_cap)?;
        if self.cap > 0 {
            // SAFETY: both buffers hold at least `len` slots and are distinct
            // allocations; the old buffer was allocated with `self.cap`.
            unsafe {
                ptr::copy_nonoverlapping(self.ptr.as_ptr(), new_ptr.as_ptr(), self.len);
                self.alloc.deallocate(self.ptr, self.cap);
            }
        }
        self.ptr = new_ptr;
        self.cap = new_cap;
        Ok(())
    }

    pub fn push(&mut self, value: T) -> MemoryResult<()> {
        if self.len == self.cap {
            self.try_reserve(1)?;
        }
        // SAFETY: `len < cap` after the reserve above.
        unsafe { ptr::write(self.ptr.as_ptr().add(self.len), value) };
        self.len += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        // SAFETY: slot `len` was initialized and is now logically removed.
        Some(unsafe { ptr::read(self.ptr.as_ptr().add(self.len)) })
    }

    /// Drops every element past `len`. The buffer is kept.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.len {
            return;
        }
        let tail = self.len - len;
        self.len = len;
        // SAFETY: the tail slots were initialized and are no longer reachable.
        unsafe {
            let tail = ptr::slice_from_raw_parts_mut(self.ptr.as_ptr().add(len), tail);
            ptr::drop_in_place(tail);
        }
    }

    pub fn clear(&mut self) {
        self.truncate(0);
    }

    /// Drops every element and returns the buffer to the allocator.
    pub fn release(&mut self) {
        self.clear();
        if !Self::IS_ZST && self.cap > 0 {
            // SAFETY: the buffer came from `self.alloc` with `self.cap` slots.
            unsafe { self.alloc.deallocate(self.ptr, self.cap) };
            self.ptr = NonNull::dangling();
            self.cap = 0;
        }
    }

    pub fn resize_with<F>(&mut self, new_len: usize, mut f: F) -> MemoryResult<()>
    where
        F: FnMut() -> T,
    {
        if new_len <= self.len {
            self.truncate(new_len);
            return Ok(());
        }
        self.try_reserve(new_len - self.len)?;
        while self.len < new_len {
            self.push(f())?;
        }
        Ok(())
    }

    /// Bytes of buffer currently held from the allocator.
    pub fn allocated_bytes(&self) -> usize {
        if Self::IS_ZST {
            0
        } else {
            self.cap * mem::size_of::<T>()
        }
    }
}

impl<T: Clone> Vec<T> {
    pub fn extend_from_slice(&mut self, other: &[T]) -> MemoryResult<()> {
        self.try_reserve(other.len())?;
        for item in other {
            self.push(item.clone())?;
        }
        Ok(())
    }

    pub fn from_slice_in(items: &[T], alloc: Allocator) -> MemoryResult<Self> {
        let mut vec = Vec::with_capacity_in(items.len(), alloc)?;
        vec.extend_from_slice(items)?;
        Ok(vec)
    }
}

impl<T: TryCloneIn> Vec<T> {
    /// Clones into this vector's own allocator.
    pub fn try_clone(&self) -> MemoryResult<Self> {
        self.try_clone_in(&self.alloc)
    }
}

impl<T: TryCloneIn> TryCloneIn for Vec<T> {
    fn try_clone_in(&self, alloc: &Allocator) -> MemoryResult<Self> {
        let mut vec = Vec::with_capacity_in(self.len, alloc.clone())?;
        for item in self.iter() {
            vec.push(item.try_clone_in(alloc)?)?;
        }
        Ok(vec)
    }
}

impl<T> Drop for Vec<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T> Deref for Vec<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T> DerefMut for Vec<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

impl<'a, T> IntoIterator for &'a Vec<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.as_slice().iter()
    }
}

impl<T: PartialEq> PartialEq for Vec<T> {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl<T: Debug> Debug for Vec<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_type::MemoryType;
    use crate::tracker::MemoryTracker;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::sync::Arc;

    fn tracker_with_budget(budget: u64) -> MemoryTracker {
        MemoryTracker::new(budget, Arc::new(|| {}))
    }

    #[test]
    fn empty_vec_does_not_allocate() {
        let vec: Vec<u32> = Vec::new_in(Allocator::default());
        assert!(vec.is_empty());
        assert_eq!(vec.capacity(), 0);
        assert_eq!(vec.allocated_bytes(), 0);
    }

    #[test]
    fn push_pop_and_grow() {
        let mut vec = Vec::new_in(Allocator::default());
        for i in 0..100u64 {
            vec.push(i).unwrap();
        }
        assert_eq!(vec.len(), 100);
        assert!(vec.capacity() >= 100);
        assert_eq!(vec[42], 42);
        assert_eq!(vec.pop(), Some(99));
        assert_eq!(vec.len(), 99);
    }

    #[test]
    fn truncate_drops_tail_elements() {
        struct Counted(Rc<Cell<usize>>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.set(self.0.get() + 1);
            }
        }

        let drops = Rc::new(Cell::new(0));
        let mut vec = Vec::new_in(Allocator::default());
        for _ in 0..5 {
            vec.push(Counted(drops.clone())).unwrap();
        }
        vec.truncate(2);
        assert_eq!(drops.get(), 3);
        drop(vec);
        assert_eq!(drops.get(), 5);
    }

    #[test]
    fn resize_with_fills_and_shrinks() {
        let mut vec = Vec::new_in(Allocator::default());
        vec.resize_with(3, || 9u8).unwrap();
        assert_eq!(vec.as_slice(), &[9, 9, 9]);
        vec.resize_with(1, || 0u8).unwrap();
        assert_eq!(vec.as_slice(), &[9]);
    }

    #[test]
    fn zero_sized_elements_never_allocate() {
        let mut vec = Vec::new_in(Allocator::default());
        for _ in 0..1000 {
            vec.push(()).unwrap();
        }
        assert_eq!(vec.len(), 1000);
        assert_eq!(vec.allocated_bytes(), 0);
    }

    #[test]
    fn buffer_is_charged_to_tracker() {
        let tracker = tracker_with_budget(u64::MAX);
        let alloc = tracker.get_allocator(MemoryType::TileOffsets);
        let resource = tracker.get_resource(MemoryType::TileOffsets);

        let mut vec = Vec::with_capacity_in(16, alloc).unwrap();
        vec.extend_from_slice(&[1u64, 2, 3]).unwrap();
        assert_eq!(resource.get_count(), 16 * 8);

        vec.release();
        assert_eq!(resource.get_count(), 0);
        assert_eq!(tracker.get_counts().0, 0);
    }

    #[test]
    fn growth_failure_keeps_existing_contents() {
        let tracker = tracker_with_budget(64);
        let mut vec = Vec::with_capacity_in(4, tracker.get_allocator(MemoryType::RTree)).unwrap();
        vec.extend_from_slice(&[1u64, 2, 3, 4]).unwrap();

        let err = vec.push(5).unwrap_err();
        assert!(err.is_budget_exceeded());
        assert_eq!(vec.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn nested_clone_propagates_allocator() {
        let tracker = tracker_with_budget(u64::MAX);
        let source = tracker.get_allocator(MemoryType::RTree);
        let target = tracker.get_allocator(MemoryType::TileData);

        let mut outer: Vec<Vec<u32>> = Vec::new_in(source.clone());
        let inner = Vec::from_slice_in(&[1, 2, 3], source).unwrap();
        outer.push(inner).unwrap();

        let copy = outer.try_clone_in(&target).unwrap();
        assert_eq!(copy, outer);
        assert!(copy[0].allocator() == &target);
        assert!(tracker.get_resource(MemoryType::TileData).get_count() > 0);
    }
}
