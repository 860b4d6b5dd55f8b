//! Indexed per-thread slot storage.
//!
//! A process-wide counter mints slot indices; each thread lazily grows a
//! dense array indexed by them. Looking a slot up on the hot path is a
//! thread-local access plus an array index, with no hashing. The pool uses
//! one slot per [`Recycler`](crate::Recycler) to find the calling thread's
//! stack, and one shared slot for the per-thread map of foreign intake
//! queues.
//!
//! Values are stored type erased (`Arc<dyn Any + Send + Sync>`); the typed
//! [`LocalSlot`] wrapper does the downcasting. An empty cell is a distinct
//! unset state, not a user value.
//!
//! Indices are never reused. A slot minted for a short-lived purpose stays
//! allocated for the life of the process, so mint slots for long-lived
//! objects only.

use fxhash::FxHashMap;
use std::{
    any::Any,
    cell::RefCell,
    sync::{
        Arc, LazyLock, Mutex,
        atomic::{AtomicIsize, Ordering},
    },
};
use thiserror::Error;

/// The process-wide slot index counter overflowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("thread local slot indices exhausted")]
pub struct SlotsExhausted;

type Value = Arc<dyn Any + Send + Sync>;
type RemovalHook = Arc<dyn Fn(Value) + Send + Sync>;

static NEXT_INDEX: AtomicIsize = AtomicIsize::new(0);

static REMOVAL_HOOKS: LazyLock<Mutex<FxHashMap<usize, RemovalHook>>> =
    LazyLock::new(|| Mutex::new(FxHashMap::default()));

const MIN_TABLE_LEN: usize = 32;

/// Mint a fresh slot index. Indices are globally unique and never reused.
pub fn next_index() -> Result<usize, SlotsExhausted> {
    let index = NEXT_INDEX.fetch_add(1, Ordering::Relaxed);
    if index < 0 {
        NEXT_INDEX.fetch_sub(1, Ordering::Relaxed);
        return Err(SlotsExhausted);
    }
    Ok(index as usize)
}

struct SlotTable {
    slots: Vec<Option<Value>>,
}

impl SlotTable {
    fn get(&self, index: usize) -> Option<Value> {
        self.slots.get(index).and_then(|slot| slot.clone())
    }

    fn set(&mut self, index: usize, value: Value) -> Option<Value> {
        if index >= self.slots.len() {
            let len = (index + 1).next_power_of_two().max(MIN_TABLE_LEN);
            self.slots.resize_with(len, || None);
        }
        self.slots[index].replace(value)
    }

    fn remove(&mut self, index: usize) -> Option<Value> {
        self.slots.get_mut(index).and_then(|slot| slot.take())
    }

    fn drain(&mut self) -> Vec<(usize, Value)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.take().map(|v| (i, v)))
            .collect()
    }
}

impl Drop for SlotTable {
    // Thread exit. Fire on-removed hooks for whatever is still set. Hooks
    // that touch thread local state at this point degrade to no-ops.
    fn drop(&mut self) {
        for (index, value) in self.drain() {
            fire_removal_hook(index, value);
        }
    }
}

thread_local! {
    static TABLE: RefCell<SlotTable> = RefCell::new(SlotTable { slots: Vec::new() });
}

// A removal hook (or a pooled value's destructor) may re-enter the table, and
// the table may already be tearing down with the thread, so both the TLS
// access and the borrow are fallible.
fn with_table<R>(f: impl FnOnce(&mut SlotTable) -> R) -> Option<R> {
    TABLE
        .try_with(|table| table.try_borrow_mut().ok().map(|mut table| f(&mut table)))
        .ok()
        .flatten()
}

fn fire_removal_hook(index: usize, value: Value) {
    let hook = REMOVAL_HOOKS.lock().unwrap().get(&index).cloned();
    if let Some(hook) = hook {
        hook(value);
    }
}

/// Remove every value stored by the calling thread, firing on-removed hooks.
///
/// This also happens automatically when the thread exits.
pub fn clear() {
    let drained = with_table(|table| table.drain()).unwrap_or_default();
    for (index, value) in drained {
        fire_removal_hook(index, value);
    }
}

/// A typed handle to one slot of every thread's table.
///
/// The slot itself is global; the value stored under it is per thread.
/// Reading a slot from two threads observes two independent values.
pub struct LocalSlot<V> {
    index: usize,
    initial: Option<Box<dyn Fn() -> V + Send + Sync>>,
}

impl<V: Send + Sync + 'static> LocalSlot<V> {
    /// Mint a slot with no initializer. [`get_or_init`](Self::get_or_init)
    /// on an unset cell returns `None` for such slots.
    pub fn new() -> Result<Self, SlotsExhausted> {
        Ok(LocalSlot { index: next_index()?, initial: None })
    }

    /// Mint a slot whose per-thread value is created on first access.
    pub fn with_initial(
        f: impl Fn() -> V + Send + Sync + 'static,
    ) -> Result<Self, SlotsExhausted> {
        Ok(LocalSlot { index: next_index()?, initial: Some(Box::new(f)) })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// The calling thread's value, if one has been set.
    pub fn get(&self) -> Option<Arc<V>> {
        with_table(|table| table.get(self.index))
            .flatten()
            .and_then(|value| value.downcast::<V>().ok())
    }

    /// The calling thread's value, creating it with the initializer when the
    /// cell is unset. Returns `None` when there is no initializer or the
    /// thread is tearing down.
    pub fn get_or_init(&self) -> Option<Arc<V>> {
        if let Some(value) = self.get() {
            return Some(value);
        }
        let initial = self.initial.as_ref()?;
        let value = Arc::new(initial());
        self.set_arc(value.clone())?;
        Some(value)
    }

    /// Store a value for the calling thread, returning the previous one.
    ///
    /// Overwriting does not fire the on-removed hook.
    pub fn set(&self, value: V) -> Option<Arc<V>> {
        let prev = self.set_arc(Arc::new(value))??;
        prev.downcast::<V>().ok()
    }

    fn set_arc(&self, value: Arc<V>) -> Option<Option<Value>> {
        with_table(|table| table.set(self.index, value as Value))
    }

    /// Clear the calling thread's cell, firing the on-removed hook.
    pub fn remove(&self) -> Option<Arc<V>> {
        let prev = with_table(|table| table.remove(self.index)).flatten()?;
        fire_removal_hook(self.index, prev.clone());
        prev.downcast::<V>().ok()
    }

    /// Register a callback invoked with the value whenever this slot's cell
    /// is removed, including thread-exit teardown. At most one hook per
    /// slot; registering again replaces it.
    pub fn on_removed(&self, hook: impl Fn(Arc<V>) + Send + Sync + 'static) {
        let erased: RemovalHook = Arc::new(move |value: Value| {
            if let Ok(value) = value.downcast::<V>() {
                hook(value)
            }
        });
        REMOVAL_HOOKS.lock().unwrap().insert(self.index, erased);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn indices_are_unique_and_ascending() {
        let a = next_index().unwrap();
        let b = next_index().unwrap();
        let c = next_index().unwrap();
        assert!(a < b && b < c);
    }

    #[test]
    fn set_get_remove_roundtrip() {
        let slot: LocalSlot<String> = LocalSlot::new().unwrap();
        assert!(slot.get().is_none());
        assert!(slot.set("first".to_string()).is_none());
        assert_eq!(&*slot.get().unwrap(), "first");
        let prev = slot.set("second".to_string()).unwrap();
        assert_eq!(&*prev, "first");
        let removed = slot.remove().unwrap();
        assert_eq!(&*removed, "second");
        assert!(slot.get().is_none());
    }

    #[test]
    fn sparse_index_growth() {
        // burn through enough indices that the table must grow past the
        // minimum length
        let slots: Vec<LocalSlot<usize>> =
            (0..100).map(|_| LocalSlot::new().unwrap()).collect();
        for (i, slot) in slots.iter().enumerate() {
            slot.set(i);
        }
        for (i, slot) in slots.iter().enumerate() {
            assert_eq!(*slot.get().unwrap(), i);
        }
    }

    #[test]
    fn values_are_per_thread() {
        let slot: LocalSlot<usize> = LocalSlot::new().unwrap();
        slot.set(1);
        let slot = Arc::new(slot);
        let other = {
            let slot = slot.clone();
            thread::spawn(move || {
                assert!(slot.get().is_none());
                slot.set(2);
                *slot.get().unwrap()
            })
            .join()
            .unwrap()
        };
        assert_eq!(other, 2);
        assert_eq!(*slot.get().unwrap(), 1);
    }

    #[test]
    fn initial_value_runs_once_per_thread() {
        static CREATED: AtomicUsize = AtomicUsize::new(0);
        let slot: LocalSlot<usize> = LocalSlot::with_initial(|| {
            CREATED.fetch_add(1, Ordering::Relaxed);
            7
        })
        .unwrap();
        assert_eq!(*slot.get_or_init().unwrap(), 7);
        assert_eq!(*slot.get_or_init().unwrap(), 7);
        assert_eq!(CREATED.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn on_removed_fires_on_remove_and_thread_exit() {
        let fired = Arc::new(AtomicUsize::new(0));
        let slot: Arc<LocalSlot<usize>> = Arc::new(LocalSlot::new().unwrap());
        let counter = fired.clone();
        slot.on_removed(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        slot.set(1);
        slot.remove();
        assert_eq!(fired.load(Ordering::Relaxed), 1);

        let slot2 = slot.clone();
        thread::spawn(move || {
            slot2.set(2);
        })
        .join()
        .unwrap();
        assert_eq!(fired.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn clear_empties_every_slot_on_this_thread() {
        let a: LocalSlot<usize> = LocalSlot::new().unwrap();
        let b: LocalSlot<usize> = LocalSlot::new().unwrap();
        a.set(1);
        b.set(2);
        clear();
        assert!(a.get().is_none());
        assert!(b.get().is_none());
    }
}
