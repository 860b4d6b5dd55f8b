use super::stack::Stack;
use super::{RecycleError, own_thread_id};
use std::{
    cell::UnsafeCell,
    fmt,
    marker::PhantomData,
    mem::ManuallyDrop,
    ops::{Deref, DerefMut},
    ptr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};
use tracing::debug;

// A handle's recycle ids encode where it last re-entered the pool:
//
//   (0, 0)        held by user code, freshly acquired
//   (own, own)    idle on its owner stack, recycled by the owner thread
//   (0, queue)    staged in a foreign intake queue
//   (queue, queue) idle on its owner stack, arrived via transfer
//
// Both ids are reset to zero on acquisition. Plain stores suffice: ids
// written by a foreign thread are published by the queue's release store and
// read by the owner after the matching acquire load.
pub(crate) struct HandleInner<T> {
    recycle_id: AtomicU32,
    last_recycle_id: AtomicU32,
    has_been_recycled: AtomicBool,
    sink: bool,
    stack: Mutex<Option<Arc<Stack<T>>>>,
    value: UnsafeCell<Option<T>>,
}

// SAFETY: the value cell is written once before the handle is shared (the
// factory path) and afterwards only through the unique live guard. A handle
// with both ids zero has exactly one guard; in every other state nothing
// touches the value.
unsafe impl<T: Send> Send for HandleInner<T> {}
unsafe impl<T: Send> Sync for HandleInner<T> {}

/// The durable identity of one pooled value.
///
/// A handle stays with its value through every acquire/recycle cycle.
/// Clones compare equal by identity via [`same_handle`](Handle::same_handle).
pub struct Handle<T> {
    inner: Arc<HandleInner<T>>,
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Handle { inner: Arc::clone(&self.inner) }
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (recycle_id, last_recycle_id) = self.ids();
        f.debug_struct("Handle")
            .field("addr", &Arc::as_ptr(&self.inner))
            .field("recycle_id", &recycle_id)
            .field("last_recycle_id", &last_recycle_id)
            .finish()
    }
}

impl<T> Handle<T> {
    fn with_stack(stack: Option<Arc<Stack<T>>>, sink: bool) -> Self {
        Handle {
            inner: Arc::new(HandleInner {
                recycle_id: AtomicU32::new(0),
                last_recycle_id: AtomicU32::new(0),
                has_been_recycled: AtomicBool::new(false),
                sink,
                stack: Mutex::new(stack),
                value: UnsafeCell::new(None),
            }),
        }
    }

    pub(crate) fn fresh(stack: Arc<Stack<T>>) -> Self {
        Self::with_stack(Some(stack), false)
    }

    /// A handle whose recycle is a silent drop, used when pooling is off.
    pub(crate) fn sink() -> Self {
        Self::with_stack(None, true)
    }

    /// True when both handles wrap the same pooled value.
    pub fn same_handle(&self, other: &Handle<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn ids(&self) -> (u32, u32) {
        (
            self.inner.recycle_id.load(Ordering::Relaxed),
            self.inner.last_recycle_id.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn set_recycled(&self, id: u32) {
        self.inner.recycle_id.store(id, Ordering::Relaxed);
        self.inner.last_recycle_id.store(id, Ordering::Relaxed);
    }

    pub(crate) fn clear_ids(&self) {
        self.inner.recycle_id.store(0, Ordering::Relaxed);
        self.inner.last_recycle_id.store(0, Ordering::Relaxed);
    }

    pub(crate) fn mark_queued(&self, queue_id: u32) {
        self.inner.last_recycle_id.store(queue_id, Ordering::Relaxed);
    }

    /// A queued handle becomes owned: the recycle id catches up with the
    /// queue id stamped at staging time.
    pub(crate) fn promote_queued(&self) {
        let last = self.inner.last_recycle_id.load(Ordering::Relaxed);
        self.inner.recycle_id.store(last, Ordering::Relaxed);
    }

    pub(crate) fn has_been_recycled(&self) -> bool {
        self.inner.has_been_recycled.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_drop_tested(&self) {
        self.inner.has_been_recycled.store(true, Ordering::Relaxed);
    }

    pub(crate) fn stack(&self) -> Option<Arc<Stack<T>>> {
        self.inner.stack.lock().unwrap().clone()
    }

    pub(crate) fn set_stack(&self, stack: Option<Arc<Stack<T>>>) {
        *self.inner.stack.lock().unwrap() = stack;
    }

    // Only called on a handle that is not yet shared.
    pub(crate) fn set_value(&self, value: T) {
        unsafe { *self.inner.value.get() = Some(value) }
    }
}

impl<T: Send + 'static> Handle<T> {
    /// Return the value behind this handle to its pool.
    ///
    /// Callers must not hold a live [`Recycled`] guard for the handle; the
    /// guard's own drop and [`Recycled::recycle`] are the public paths here.
    pub(crate) fn recycle(&self) -> Result<(), RecycleError> {
        if self.inner.sink {
            return Ok(());
        }
        let (recycle_id, last_recycle_id) = self.ids();
        if recycle_id != last_recycle_id {
            return Err(RecycleError::DoubleRecycle);
        }
        match self.stack() {
            Some(stack) => stack.push(self.clone()),
            // detached from its pool
            None if recycle_id != 0 => Err(RecycleError::DoubleRecycle),
            None => Ok(()),
        }
    }
}

/// An acquired value. Dropping the guard returns the value to its pool.
///
/// The guard is the unique accessor of the value; it cannot be cloned, so a
/// value handed out by [`acquire`](super::Recycler::acquire) is never
/// aliased. Use [`recycle`](Recycled::recycle) instead of dropping when you
/// want misuse surfaced as an error instead of absorbed.
pub struct Recycled<T: Send + 'static> {
    handle: Handle<T>,
    // the guard exposes &T and &mut T, so it inherits T's thread affinity
    _value: PhantomData<T>,
}

impl<T: Send + 'static> Recycled<T> {
    pub(crate) fn new(handle: Handle<T>) -> Self {
        Recycled { handle, _value: PhantomData }
    }

    /// The durable identity of this value, stable across recycle cycles.
    pub fn handle(&self) -> Handle<T> {
        self.handle.clone()
    }

    // Consume the guard without running its drop.
    fn into_handle(self) -> Handle<T> {
        let this = ManuallyDrop::new(self);
        // SAFETY: the guard is forgotten, so the handle moves out exactly once
        unsafe { ptr::read(&this.handle) }
    }

    /// Return the value to its pool, surfacing errors that a plain drop
    /// would absorb.
    pub fn recycle(self) -> Result<(), RecycleError> {
        self.into_handle().recycle()
    }

    /// Permanently remove the value from pool management.
    pub fn detach(self) -> T {
        let handle = self.into_handle();
        handle.set_recycled(own_thread_id());
        handle.set_stack(None);
        // SAFETY: the unique guard is consumed, nothing else reaches the value
        unsafe { (*handle.inner.value.get()).take() }.unwrap()
    }
}

impl<T: Send + 'static> Deref for Recycled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: a live guard is the unique accessor of the value
        unsafe { (*self.handle.inner.value.get()).as_ref() }.unwrap()
    }
}

impl<T: Send + 'static> DerefMut for Recycled<T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: a live guard is the unique accessor of the value
        unsafe { (*self.handle.inner.value.get()).as_mut() }.unwrap()
    }
}

impl<T: Send + 'static> AsRef<T> for Recycled<T> {
    fn as_ref(&self) -> &T {
        self
    }
}

impl<T: Send + fmt::Debug + 'static> fmt::Debug for Recycled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

impl<T: Send + fmt::Display + 'static> fmt::Display for Recycled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}

impl<T: Send + 'static> Drop for Recycled<T> {
    fn drop(&mut self) {
        if let Err(err) = self.handle.recycle() {
            debug!(%err, "recycle on drop failed, value dropped instead");
        }
    }
}
