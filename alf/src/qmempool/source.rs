//! The backing allocator behind a pool.

use std::marker::PhantomData;
use std::sync::Arc;

/// Backing allocator that manufactures and reclaims pooled objects.
///
/// A [`Pool`](super::Pool) calls into its source only when both cache tiers
/// miss (allocation) or overflow (deallocation), and always in bursts. The
/// source may fail under memory pressure by returning `None`.
pub trait ObjectSource: Send + Sync {
    /// Handle to one pooled object.
    type Object: Send;

    /// Produces a new object, or `None` if the source is exhausted.
    fn alloc(&self) -> Option<Self::Object>;

    /// Reclaims an object for good.
    fn free(&self, object: Self::Object);
}

impl<S: ObjectSource + ?Sized> ObjectSource for Arc<S> {
    type Object = S::Object;

    #[inline]
    fn alloc(&self) -> Option<Self::Object> {
        (**self).alloc()
    }

    #[inline]
    fn free(&self, object: Self::Object) {
        (**self).free(object);
    }
}

/// Heap source producing `Box<T>` from `T::default()`.
pub struct BoxSource<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BoxSource<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BoxSource<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Default + Send> ObjectSource for BoxSource<T> {
    type Object = Box<T>;

    #[inline]
    fn alloc(&self) -> Option<Box<T>> {
        Some(Box::default())
    }

    #[inline]
    fn free(&self, object: Box<T>) {
        drop(object);
    }
}
