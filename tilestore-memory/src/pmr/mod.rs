//! Resource-aware containers.
//!
//! An [`Allocator`] is a cheap handle on a [`MemoryResource`]. Containers in
//! this module take one at construction and route every buffer they own
//! through it, so memory held by a container is charged to whichever tracker
//! resource the allocator wraps. Cloning a container with [`TryCloneIn`]
//! propagates the allocator to every nested element.

mod vec;

pub use vec::Vec;

use std::alloc::Layout;
use std::fmt::{Debug, Formatter};
use std::ptr::NonNull;
use std::sync::Arc;

use crate::errors::MemoryResult;
use crate::resource::{system_resource, MemoryResource};

/// Handle on the resource a container allocates from.
#[derive(Clone)]
pub struct Allocator {
    resource: Arc<dyn MemoryResource>,
}

impl Allocator {
    pub fn new(resource: Arc<dyn MemoryResource>) -> Self {
        Allocator { resource }
    }

    pub fn resource(&self) -> &Arc<dyn MemoryResource> {
        &self.resource
    }

    /// Allocates room for `count` values of `T`.
    pub fn allocate<T>(&self, count: usize) -> MemoryResult<NonNull<T>> {
        let layout = Layout::array::<T>(count)?;
        let ptr = self.resource.allocate(layout.size(), layout.align())?;
        Ok(ptr.cast::<T>())
    }

    /// Releases a buffer obtained from [`Allocator::allocate`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate::<T>(count)` on an allocator equal to
    /// this one and must not be released twice.
    pub unsafe fn deallocate<T>(&self, ptr: NonNull<T>, count: usize) {
        let size = std::mem::size_of::<T>() * count;
        let align = std::mem::align_of::<T>();
        self.resource.deallocate(ptr.cast::<u8>(), size, align);
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Allocator::new(system_resource())
    }
}

impl PartialEq for Allocator {
    fn eq(&self, other: &Self) -> bool {
        self.resource.is_equal(other.resource.as_ref())
    }
}

impl Debug for Allocator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator").finish_non_exhaustive()
    }
}

/// Fallible clone into a given allocator.
///
/// Implementations must allocate every owned buffer, including those of
/// nested elements, from `alloc`.
pub trait TryCloneIn: Sized {
    fn try_clone_in(&self, alloc: &Allocator) -> MemoryResult<Self>;
}

macro_rules! impl_try_clone_in_for_copy {
    ($($ty:ty),* $(,)?) => {
        $(
            impl TryCloneIn for $ty {
                #[inline]
                fn try_clone_in(&self, _alloc: &Allocator) -> MemoryResult<Self> {
                    Ok(*self)
                }
            }
        )*
    };
}

impl_try_clone_in_for_copy!(u8, i8, u16, i16, u32, i32, u64, i64, usize, isize, f32, f64, bool, char);

impl<A: TryCloneIn, B: TryCloneIn> TryCloneIn for (A, B) {
    fn try_clone_in(&self, alloc: &Allocator) -> MemoryResult<Self> {
        Ok((self.0.try_clone_in(alloc)?, self.1.try_clone_in(alloc)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::SystemResource;

    #[test]
    fn default_allocator_uses_system_resource() {
        let alloc = Allocator::default();
        assert!(alloc.resource().as_any().is::<SystemResource>());
        assert_eq!(alloc, Allocator::new(Arc::new(SystemResource)));
    }

    #[test]
    fn allocate_and_deallocate_typed_buffer() {
        let alloc = Allocator::default();
        let ptr = alloc.allocate::<u64>(16).unwrap();
        assert_eq!(ptr.as_ptr() as usize % std::mem::align_of::<u64>(), 0);
        unsafe { alloc.deallocate(ptr, 16) };
    }

    #[test]
    fn scalars_clone_by_value() {
        let alloc = Allocator::default();
        assert_eq!(7u32.try_clone_in(&alloc).unwrap(), 7);
        assert_eq!((1u8, 2.5f64).try_clone_in(&alloc).unwrap(), (1, 2.5));
    }
}
