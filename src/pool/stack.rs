use super::handle::Handle;
use super::queue::{IntakeQueue, SharedCapacity};
use super::{Config, Lookup, RecycleError, ThreadAlive, current_alive, delayed_map, own_thread_id};
use std::{
    cell::UnsafeCell,
    ptr,
    sync::{Arc, Mutex, Weak},
};
use tracing::trace;

const INITIAL_CAPACITY: usize = 256;

// State only ever touched by the stack's owning thread, so none of it needs
// synchronization.
pub(crate) struct LocalState<T> {
    elements: Vec<Handle<T>>,
    capacity: usize,
    max_capacity: usize,
    handle_recycle_count: usize,
    cursor: Option<Arc<IntakeQueue<T>>>,
    prev: Option<Arc<IntakeQueue<T>>>,
}

impl<T> LocalState<T> {
    fn new(max_capacity: usize) -> Self {
        let capacity = INITIAL_CAPACITY.min(max_capacity);
        LocalState {
            elements: Vec::with_capacity(capacity),
            capacity,
            max_capacity,
            // the first admission check observes a count of zero
            handle_recycle_count: usize::MAX,
            cursor: None,
            prev: None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.elements.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn push_transferred(&mut self, handle: Handle<T>) {
        self.elements.push(handle);
    }

    /// Grow the element bound toward `expected` by doubling, clipped to the
    /// per-thread maximum. Returns the bound now in effect.
    pub(crate) fn increase_capacity(&mut self, expected: usize) -> usize {
        let mut capacity = self.capacity;
        while capacity < expected && capacity < self.max_capacity {
            capacity <<= 1;
        }
        capacity = capacity.min(self.max_capacity);
        if capacity != self.capacity {
            self.elements.reserve(capacity - self.elements.len());
            self.capacity = capacity;
        }
        capacity
    }
}

/// Per-(pool, thread) reservoir of idle handles.
///
/// The owning thread pops and pushes without synchronization. Foreign
/// threads interact only through the intake queue list hanging off `head`
/// and through the shared capacity counter.
pub(crate) struct Stack<T> {
    owner: Weak<ThreadAlive>,
    owner_ptr: *const ThreadAlive,
    max_capacity: usize,
    link_capacity: usize,
    ratio_mask: usize,
    max_delayed_queues: usize,
    shared_capacity: Arc<SharedCapacity>,
    head: Mutex<Option<Arc<IntakeQueue<T>>>>,
    local: UnsafeCell<LocalState<T>>,
}

// SAFETY: `local` is only reached from the owning thread, checked against
// the thread liveness token address. Everything else is atomic, weak, or
// mutex protected.
unsafe impl<T: Send> Send for Stack<T> {}
unsafe impl<T: Send> Sync for Stack<T> {}

impl<T: Send + 'static> Stack<T> {
    pub(crate) fn new(config: &Config) -> Self {
        let (owner, owner_ptr) = match current_alive() {
            Some(alive) => (Arc::downgrade(&alive), Arc::as_ptr(&alive)),
            None => (Weak::new(), ptr::null()),
        };
        let shared = (config.max_capacity_per_thread / config.shared_capacity_factor)
            .max(config.link_capacity);
        Stack {
            owner,
            owner_ptr,
            max_capacity: config.max_capacity_per_thread,
            link_capacity: config.link_capacity,
            ratio_mask: config.ratio - 1,
            max_delayed_queues: config.max_delayed_queues_per_thread,
            shared_capacity: Arc::new(SharedCapacity::new(shared)),
            head: Mutex::new(None),
            local: UnsafeCell::new(LocalState::new(config.max_capacity_per_thread)),
        }
    }

    fn is_owner_thread(&self) -> bool {
        current_alive().is_some_and(|alive| ptr::eq(Arc::as_ptr(&alive), self.owner_ptr))
    }

    // SAFETY: caller must be on the owning thread.
    #[allow(clippy::mut_from_ref)]
    unsafe fn local(&self) -> &mut LocalState<T> {
        debug_assert!(self.is_owner_thread());
        unsafe { &mut *self.local.get() }
    }

    pub(crate) fn link_capacity(&self) -> usize {
        self.link_capacity
    }

    pub(crate) fn shared_capacity(&self) -> Arc<SharedCapacity> {
        self.shared_capacity.clone()
    }

    /// Handles currently idle here. Owner thread only.
    pub(crate) fn len(&self) -> usize {
        // SAFETY: stacks are reached through their owner thread's slot
        unsafe { self.local() }.len()
    }

    pub(crate) fn push(self: &Arc<Self>, handle: Handle<T>) -> Result<(), RecycleError> {
        if self.is_owner_thread() {
            // SAFETY: just verified we are on the owning thread
            let local = unsafe { self.local() };
            self.push_now(local, handle)
        } else {
            self.push_foreign(handle);
            Ok(())
        }
    }

    fn push_now(&self, local: &mut LocalState<T>, handle: Handle<T>) -> Result<(), RecycleError> {
        let (recycle_id, last_recycle_id) = handle.ids();
        if (recycle_id | last_recycle_id) != 0 {
            return Err(RecycleError::DoubleRecycle);
        }
        handle.set_recycled(own_thread_id());
        if local.len() >= self.max_capacity || self.drop_handle(local, &handle) {
            return Ok(());
        }
        if local.len() == local.capacity {
            local.capacity = (local.capacity << 1).min(self.max_capacity);
        }
        // while it rests here the handle must not keep the stack alive, or
        // the two would keep each other alive forever
        handle.set_stack(None);
        local.elements.push(handle);
        Ok(())
    }

    /// Admission filter: of the releases of never-before-pooled handles,
    /// one in `ratio` is kept and the rest are dropped.
    pub(crate) fn drop_handle(&self, local: &mut LocalState<T>, handle: &Handle<T>) -> bool {
        if !handle.has_been_recycled() {
            local.handle_recycle_count = local.handle_recycle_count.wrapping_add(1);
            if local.handle_recycle_count & self.ratio_mask != 0 {
                return true;
            }
            handle.mark_drop_tested();
        }
        false
    }

    /// Pop an idle handle, scavenging staged foreign releases when the
    /// reservoir is empty. Owner thread only.
    pub(crate) fn pop(self: &Arc<Self>) -> Result<Option<Handle<T>>, RecycleError> {
        // SAFETY: stacks are reached through their owner thread's slot
        let local = unsafe { self.local() };
        if local.elements.is_empty() && !self.scavenge(local)? {
            return Ok(None);
        }
        match local.elements.pop() {
            None => Ok(None),
            Some(handle) => {
                let (recycle_id, last_recycle_id) = handle.ids();
                if last_recycle_id != recycle_id {
                    return Err(RecycleError::InconsistentHandle);
                }
                handle.clear_ids();
                // back in user hands: the handle keeps its stack reachable
                handle.set_stack(Some(self.clone()));
                Ok(Some(handle))
            }
        }
    }

    fn scavenge(self: &Arc<Self>, local: &mut LocalState<T>) -> Result<bool, RecycleError> {
        if self.scavenge_some(local)? {
            return Ok(true);
        }
        // nothing anywhere; restart the next pass from the list head
        local.prev = None;
        local.cursor = self.head.lock().unwrap().clone();
        Ok(false)
    }

    fn scavenge_some(self: &Arc<Self>, local: &mut LocalState<T>) -> Result<bool, RecycleError> {
        let (mut prev, mut cursor) = match local.cursor.clone() {
            Some(cursor) => (local.prev.clone(), Some(cursor)),
            None => (None, self.head.lock().unwrap().clone()),
        };
        let mut success = false;
        loop {
            let Some(queue) = cursor.clone() else { break };
            if queue.transfer(self, local)? {
                success = true;
                break;
            }
            let next = queue.next();
            if !queue.owner_alive() {
                // the releasing thread died; drain what it left behind, then
                // unlink so later passes skip the dead queue
                if queue.has_final_data() {
                    while queue.transfer(self, local)? {
                        success = true;
                    }
                }
                trace!(queue = queue.id(), "unlinking intake queue of a dead thread");
                if let Some(prev) = &prev {
                    prev.set_next(next.clone());
                }
            } else {
                prev = Some(queue);
            }
            cursor = next;
            if success {
                break;
            }
        }
        local.prev = prev;
        local.cursor = cursor;
        Ok(success)
    }

    /// Splice a freshly allocated intake queue in front of the list.
    pub(crate) fn install_queue(&self, queue: &Arc<IntakeQueue<T>>) {
        let mut head = self.head.lock().unwrap();
        queue.set_next(head.take());
        *head = Some(queue.clone());
    }

    fn push_foreign(self: &Arc<Self>, handle: Handle<T>) {
        let Some(map) = delayed_map() else { return };
        let mut map = map.lock().unwrap();
        let key = Arc::as_ptr(self) as *const () as usize;
        match map.lookup::<T>(key) {
            Lookup::Queue(queue) => queue.append(handle),
            Lookup::Dummy => {}
            Lookup::Missing => {
                map.sweep();
                if map.len() >= self.max_delayed_queues {
                    // over quota for this thread: drop, and remember to keep
                    // dropping for this stack
                    map.insert_dummy(key, self.clone());
                    return;
                }
                match IntakeQueue::allocate(self) {
                    Some(queue) => {
                        map.insert(key, self.clone(), queue.clone());
                        queue.append(handle);
                    }
                    // no shared capacity left for a first link
                    None => {}
                }
            }
        }
    }
}

#[cfg(test)]
impl<T: Send + 'static> Stack<T> {
    pub(crate) fn shared_available(&self) -> usize {
        self.shared_capacity.available()
    }

    pub(crate) fn shared_initial(&self) -> usize {
        self.shared_capacity.initial()
    }

    pub(crate) fn reserved_in_queues(&self) -> usize {
        let mut total = 0;
        let mut cursor = self.head.lock().unwrap().clone();
        while let Some(queue) = cursor {
            total += queue.reserved();
            cursor = queue.next();
        }
        total
    }
}
