//! The recycling pool.
//!
//! A [`Recycler`] is a per-type factory of reusable values. Each thread that
//! acquires from it gets its own stack of idle handles, found through an
//! indexed [`localmap`](crate::localmap) slot. Releases on the owning thread
//! push straight onto that stack. Releases on any other thread are staged in
//! a per-(owner, releaser) intake queue and pulled back in bulk by the owner
//! the next time its stack runs dry.

mod handle;
mod queue;
mod stack;

pub use handle::{Handle, Recycled};

use crate::localmap::{LocalSlot, SlotsExhausted};
use fxhash::FxHashMap;
use queue::IntakeQueue;
use stack::Stack;
use std::{
    any::Any,
    fmt,
    sync::{
        Arc, LazyLock, Mutex, OnceLock, Weak,
        atomic::{AtomicU32, Ordering},
    },
};
use thiserror::Error;

/// Errors raised by pool operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecycleError {
    /// A handle re-entered the pool without an intervening acquire.
    #[error("handle was recycled more than once")]
    DoubleRecycle,
    /// A handle's recycle ids disagree: misuse or a racing release.
    #[error("handle recycle ids are inconsistent")]
    InconsistentHandle,
    /// The process-wide slot index space is exhausted.
    #[error(transparent)]
    SlotsExhausted(#[from] SlotsExhausted),
}

// Recycle ids tag how a handle last re-entered the pool. Zero is reserved
// for freshly acquired handles.
static ID_GEN: AtomicU32 = AtomicU32::new(1);

pub(crate) fn next_id() -> u32 {
    ID_GEN.fetch_add(1, Ordering::Relaxed)
}

static OWN_THREAD_ID: LazyLock<u32> = LazyLock::new(next_id);

/// The id stamped on handles recycled by their owning thread.
pub(crate) fn own_thread_id() -> u32 {
    *OWN_THREAD_ID
}

/// Liveness token minted per thread; weak references observe its death.
pub(crate) struct ThreadAlive(());

thread_local! {
    static ALIVE: Arc<ThreadAlive> = Arc::new(ThreadAlive(()));
}

pub(crate) fn current_alive() -> Option<Arc<ThreadAlive>> {
    ALIVE.try_with(|alive| alive.clone()).ok()
}

pub(crate) fn current_alive_weak() -> Weak<ThreadAlive> {
    ALIVE.try_with(Arc::downgrade).unwrap_or_default()
}

/// Pool tuning knobs, fixed at construction.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Upper bound on handles pooled per thread. Zero disables pooling
    /// entirely and every acquired value becomes a plain allocation.
    pub max_capacity_per_thread: usize,
    /// Divisor applied to `max_capacity_per_thread` to budget the data all
    /// other threads together may stage for one stack.
    pub shared_capacity_factor: usize,
    /// How many distinct foreign stacks a single thread may stage releases
    /// for. Further targets have their releases dropped.
    pub max_delayed_queues_per_thread: usize,
    /// Handles per staging link. Rounded up to a power of two.
    pub link_capacity: usize,
    /// One of every `ratio` first-time releases is admitted to a stack, the
    /// rest are dropped. Rounded up to a power of two.
    pub ratio: usize,
}

pub(crate) const DEFAULT_MAX_CAPACITY: usize = 4096;
pub(crate) const DEFAULT_LINK_CAPACITY: usize = 16;
pub(crate) const DEFAULT_RATIO: usize = 8;

impl Default for Config {
    fn default() -> Self {
        Config {
            max_capacity_per_thread: DEFAULT_MAX_CAPACITY,
            shared_capacity_factor: 2,
            max_delayed_queues_per_thread: 2 * num_cpus::get(),
            link_capacity: DEFAULT_LINK_CAPACITY,
            ratio: DEFAULT_RATIO,
        }
    }
}

impl Config {
    fn normalized(self) -> Config {
        Config {
            max_capacity_per_thread: self.max_capacity_per_thread,
            shared_capacity_factor: self.shared_capacity_factor.max(1),
            max_delayed_queues_per_thread: self.max_delayed_queues_per_thread,
            link_capacity: round_pow2(self.link_capacity.max(1)),
            ratio: round_pow2(self.ratio.max(1)),
        }
    }
}

fn round_pow2(v: usize) -> usize {
    v.checked_next_power_of_two().unwrap_or(1 << (usize::BITS - 1))
}

// Each thread keeps one map from target stack to the intake queue it stages
// releases on. An entry without a queue marks a stack this thread exceeded
// its quota for; those releases are dropped outright. The key is the stack's
// address and the weak reference guards against address reuse.
struct DelayedEntry {
    stack: Weak<dyn Any + Send + Sync>,
    queue: Option<Arc<dyn Any + Send + Sync>>,
}

#[derive(Default)]
pub(crate) struct DelayedMap {
    entries: FxHashMap<usize, DelayedEntry>,
}

pub(crate) enum Lookup<T: Send + 'static> {
    Missing,
    Dummy,
    Queue(Arc<IntakeQueue<T>>),
}

impl DelayedMap {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Forget stacks that no longer exist, freeing quota.
    pub(crate) fn sweep(&mut self) {
        self.entries.retain(|_, entry| entry.stack.strong_count() > 0);
    }

    pub(crate) fn lookup<T: Send + 'static>(&self, key: usize) -> Lookup<T> {
        match self.entries.get(&key) {
            None => Lookup::Missing,
            Some(entry) if entry.stack.strong_count() == 0 => Lookup::Missing,
            Some(entry) => match &entry.queue {
                None => Lookup::Dummy,
                Some(queue) => match queue.clone().downcast::<IntakeQueue<T>>() {
                    Ok(queue) => Lookup::Queue(queue),
                    Err(_) => Lookup::Missing,
                },
            },
        }
    }

    pub(crate) fn insert<T: Send + 'static>(
        &mut self,
        key: usize,
        stack: Arc<Stack<T>>,
        queue: Arc<IntakeQueue<T>>,
    ) {
        let stack: Arc<dyn Any + Send + Sync> = stack;
        let queue: Arc<dyn Any + Send + Sync> = queue;
        self.entries
            .insert(key, DelayedEntry { stack: Arc::downgrade(&stack), queue: Some(queue) });
    }

    pub(crate) fn insert_dummy<T: Send + 'static>(&mut self, key: usize, stack: Arc<Stack<T>>) {
        let stack: Arc<dyn Any + Send + Sync> = stack;
        self.entries.insert(key, DelayedEntry { stack: Arc::downgrade(&stack), queue: None });
    }

    pub(crate) fn remove(&mut self, key: usize) {
        self.entries.remove(&key);
    }
}

static DELAYED: OnceLock<LocalSlot<Mutex<DelayedMap>>> = OnceLock::new();

fn delayed_slot() -> Result<&'static LocalSlot<Mutex<DelayedMap>>, SlotsExhausted> {
    if let Some(slot) = DELAYED.get() {
        return Ok(slot);
    }
    let slot = LocalSlot::with_initial(|| Mutex::new(DelayedMap::default()))?;
    Ok(DELAYED.get_or_init(|| slot))
}

/// The calling thread's delayed-queue map, unless the thread is tearing down.
pub(crate) fn delayed_map() -> Option<Arc<Mutex<DelayedMap>>> {
    delayed_slot().ok()?.get_or_init()
}

struct RecyclerInner<T: Send + 'static> {
    config: Config,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    slot: LocalSlot<Stack<T>>,
}

/// A per-type pool of reusable values.
///
/// Cloning a `Recycler` yields another handle to the same pool. Values are
/// created by the factory passed at construction and live inside their
/// handles across any number of acquire/recycle cycles.
///
/// # Example
///
/// ```
/// use rebound::Recycler;
///
/// let pool = Recycler::new(String::new).unwrap();
/// let mut s = pool.acquire().unwrap();
/// s.push_str("scratch space");
/// s.clear();
/// drop(s); // recycled onto this thread's stack
/// ```
pub struct Recycler<T: Send + 'static> {
    inner: Arc<RecyclerInner<T>>,
}

impl<T: Send + 'static> Clone for Recycler<T> {
    fn clone(&self) -> Self {
        Recycler { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Send + 'static> fmt::Debug for Recycler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recycler").field("config", &self.inner.config).finish()
    }
}

impl<T: Send + 'static> Recycler<T> {
    /// Build a pool with the default [`Config`].
    pub fn new(factory: impl Fn() -> T + Send + Sync + 'static) -> Result<Self, RecycleError> {
        Self::with_config(Config::default(), factory)
    }

    /// Build a pool with an explicit [`Config`]. The factory is the only
    /// place values are created.
    pub fn with_config(
        config: Config,
        factory: impl Fn() -> T + Send + Sync + 'static,
    ) -> Result<Self, RecycleError> {
        let config = config.normalized();
        // mint both slot indices up front so exhaustion fails construction
        delayed_slot()?;
        let slot = LocalSlot::with_initial(move || Stack::new(&config))?;
        slot.on_removed(|stack: Arc<Stack<T>>| {
            // a dying thread forgets its own stack in its delayed map
            if let Some(map) = delayed_map() {
                map.lock().unwrap().remove(Arc::as_ptr(&stack) as *const () as usize);
            }
        });
        Ok(Recycler {
            inner: Arc::new(RecyclerInner { config, factory: Box::new(factory), slot }),
        })
    }

    fn stack(&self) -> Option<Arc<Stack<T>>> {
        self.inner.slot.get_or_init()
    }

    /// Take a value from the calling thread's reservoir, scavenging staged
    /// foreign releases if the reservoir is empty, and building a fresh
    /// value if there is nothing to reuse.
    pub fn acquire(&self) -> Result<Recycled<T>, RecycleError> {
        if self.inner.config.max_capacity_per_thread == 0 {
            return Ok(self.unpooled());
        }
        let Some(stack) = self.stack() else {
            // thread is tearing down
            return Ok(self.unpooled());
        };
        match stack.pop()? {
            Some(handle) => Ok(Recycled::new(handle)),
            None => {
                let handle = Handle::fresh(stack);
                handle.set_value((self.inner.factory)());
                Ok(Recycled::new(handle))
            }
        }
    }

    fn unpooled(&self) -> Recycled<T> {
        let handle = Handle::sink();
        handle.set_value((self.inner.factory)());
        Recycled::new(handle)
    }

    /// Handles currently idle on the calling thread's stack.
    pub fn thread_local_size(&self) -> usize {
        self.inner.slot.get().map(|stack| stack.len()).unwrap_or(0)
    }

    /// The configuration this pool runs with, after normalization.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    #[cfg(test)]
    pub(crate) fn stack_for_test(&self) -> Option<Arc<Stack<T>>> {
        self.stack()
    }
}
