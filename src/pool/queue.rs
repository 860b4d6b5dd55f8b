use super::handle::Handle;
use super::stack::{LocalState, Stack};
use super::{RecycleError, ThreadAlive, current_alive_weak, next_id};
use crate::cleaner;
use std::{
    cell::UnsafeCell,
    sync::{
        Arc, Mutex, OnceLock, Weak,
        atomic::{AtomicIsize, AtomicUsize, Ordering},
    },
};

/// Counter bounding the total data all foreign threads may stage for one
/// stack. Reserved in link-sized chunks by CAS, released when links are
/// drained or their queue dies.
pub(crate) struct SharedCapacity {
    available: AtomicIsize,
    initial: usize,
}

impl SharedCapacity {
    pub(crate) fn new(initial: usize) -> Self {
        SharedCapacity { available: AtomicIsize::new(initial as isize), initial }
    }

    fn reserve(&self, space: usize) -> bool {
        let space = space as isize;
        let mut available = self.available.load(Ordering::Relaxed);
        loop {
            if available < space {
                return false;
            }
            match self.available.compare_exchange_weak(
                available,
                available - space,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => available = current,
            }
        }
    }

    fn release(&self, space: usize) {
        self.available.fetch_add(space as isize, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> usize {
        self.available.load(Ordering::Relaxed).max(0) as usize
    }

    #[cfg(test)]
    pub(crate) fn initial(&self) -> usize {
        self.initial
    }
}

// The slice of shared capacity one intake queue holds. Releasing everything
// is idempotent, so the deterministic drop path and the unreachability
// callback can both run without double counting.
pub(crate) struct ReservedSpace {
    shared: Arc<SharedCapacity>,
    reserved: AtomicUsize,
}

impl ReservedSpace {
    fn new(shared: Arc<SharedCapacity>) -> Self {
        ReservedSpace { shared, reserved: AtomicUsize::new(0) }
    }

    fn reserve_link(&self, link_capacity: usize) -> bool {
        if self.shared.reserve(link_capacity) {
            self.reserved.fetch_add(link_capacity, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    fn release_link(&self, link_capacity: usize) {
        self.reserved.fetch_sub(link_capacity, Ordering::Relaxed);
        self.shared.release(link_capacity);
    }

    fn release_all(&self) {
        let reserved = self.reserved.swap(0, Ordering::Relaxed);
        if reserved > 0 {
            self.shared.release(reserved);
        }
    }
}

impl Drop for ReservedSpace {
    fn drop(&mut self) {
        self.release_all();
    }
}

struct SlotCell<T>(UnsafeCell<Option<Handle<T>>>);

// SAFETY: a slot is written by the queue's single producing thread before
// the link's write index is published with a release store, and read by the
// owning thread only after the matching acquire load.
unsafe impl<T: Send> Sync for SlotCell<T> {}

struct Link<T> {
    slots: Box<[SlotCell<T>]>,
    write: AtomicUsize,
    read: AtomicUsize,
    next: OnceLock<Arc<Link<T>>>,
}

impl<T> Link<T> {
    fn new(capacity: usize) -> Self {
        Link {
            slots: (0..capacity).map(|_| SlotCell(UnsafeCell::new(None))).collect(),
            write: AtomicUsize::new(0),
            read: AtomicUsize::new(0),
            next: OnceLock::new(),
        }
    }
}

/// Staging buffer for handles released off their owner thread.
///
/// One queue exists per (target stack, releasing thread) pair; the releasing
/// thread is the only producer and the stack's owner the only consumer, so
/// the link chain is a single-producer single-consumer structure published
/// through the per-link write index.
pub(crate) struct IntakeQueue<T> {
    id: u32,
    owner: Weak<ThreadAlive>,
    link_capacity: usize,
    space: Arc<ReservedSpace>,
    head: Mutex<Arc<Link<T>>>,
    tail: Mutex<Arc<Link<T>>>,
    next: Mutex<Option<Arc<IntakeQueue<T>>>>,
}

impl<T: Send + 'static> IntakeQueue<T> {
    /// Reserve space for a first link and splice a new queue onto the
    /// stack's intake list. `None` when the stack's shared budget is spent.
    pub(crate) fn allocate(stack: &Arc<Stack<T>>) -> Option<Arc<Self>> {
        let link_capacity = stack.link_capacity();
        let space = Arc::new(ReservedSpace::new(stack.shared_capacity()));
        if !space.reserve_link(link_capacity) {
            return None;
        }
        let first = Arc::new(Link::new(link_capacity));
        let queue = Arc::new(IntakeQueue {
            id: next_id(),
            owner: current_alive_weak(),
            link_capacity,
            space: space.clone(),
            head: Mutex::new(first.clone()),
            tail: Mutex::new(first),
            next: Mutex::new(None),
        });
        // a queue orphaned by its thread's death still returns its reserved
        // space once nothing references it anymore
        cleaner::register(&queue, move || space.release_all());
        stack.install_queue(&queue);
        Some(queue)
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn owner_alive(&self) -> bool {
        self.owner.strong_count() > 0
    }

    pub(crate) fn next(&self) -> Option<Arc<IntakeQueue<T>>> {
        self.next.lock().unwrap().clone()
    }

    pub(crate) fn set_next(&self, next: Option<Arc<IntakeQueue<T>>>) {
        *self.next.lock().unwrap() = next;
    }

    /// Stage a handle released off the owner thread. Drops the handle
    /// silently when no link space can be reserved.
    pub(crate) fn append(&self, handle: Handle<T>) {
        handle.mark_queued(self.id);
        let mut tail = self.tail.lock().unwrap();
        let mut write = tail.write.load(Ordering::Relaxed);
        if write == self.link_capacity {
            if !self.space.reserve_link(self.link_capacity) {
                return;
            }
            let next = Arc::new(Link::new(self.link_capacity));
            let _ = tail.next.set(next.clone());
            *tail = next;
            write = 0;
        }
        // a queued handle must not keep its owner stack alive
        handle.set_stack(None);
        // SAFETY: this thread is the queue's only producer and the slot is
        // not yet published
        unsafe { *tail.slots[write].0.get() = Some(handle) };
        tail.write.store(write + 1, Ordering::Release);
    }

    /// True while the newest link still holds unread handles.
    pub(crate) fn has_final_data(&self) -> bool {
        let tail = self.tail.lock().unwrap();
        tail.read.load(Ordering::Relaxed) != tail.write.load(Ordering::Acquire)
    }

    /// Move up to one link's worth of staged handles into the owner's
    /// reservoir. Owner thread only.
    pub(crate) fn transfer(
        &self,
        dst: &Arc<Stack<T>>,
        local: &mut LocalState<T>,
    ) -> Result<bool, RecycleError> {
        let mut head = self.head.lock().unwrap();
        let mut link: Arc<Link<T>> = head.clone();
        if link.read.load(Ordering::Relaxed) == self.link_capacity {
            let successor = match link.next.get() {
                Some(successor) => successor.clone(),
                None => return Ok(false),
            };
            link = successor;
            *head = link.clone();
            self.space.release_link(self.link_capacity);
        }
        let src_start = link.read.load(Ordering::Relaxed);
        let mut src_end = link.write.load(Ordering::Acquire);
        if src_start == src_end {
            return Ok(false);
        }
        let expected = local.len() + (src_end - src_start);
        if expected > local.capacity() {
            let actual = local.increase_capacity(expected);
            src_end = src_end.min(src_start + actual - local.len());
            if src_start == src_end {
                return Ok(false);
            }
        }
        let before = local.len();
        for i in src_start..src_end {
            // SAFETY: the acquire load of the write index published this slot
            let staged = unsafe { (*link.slots[i].0.get()).take() };
            let Some(handle) = staged else {
                return Err(RecycleError::InconsistentHandle);
            };
            let (recycle_id, last_recycle_id) = handle.ids();
            if recycle_id == 0 {
                handle.promote_queued();
            } else if recycle_id != last_recycle_id {
                return Err(RecycleError::InconsistentHandle);
            }
            if dst.drop_handle(local, &handle) {
                continue;
            }
            // the stack reference stays cleared while the handle rests in
            // the destination; pop restores it
            local.push_transferred(handle);
        }
        if src_end == self.link_capacity {
            if let Some(successor) = link.next.get() {
                *head = successor.clone();
                self.space.release_link(self.link_capacity);
            }
        }
        link.read.store(src_end, Ordering::Relaxed);
        Ok(local.len() > before)
    }

    #[cfg(test)]
    pub(crate) fn reserved(&self) -> usize {
        self.space.reserved.load(Ordering::Relaxed)
    }
}
