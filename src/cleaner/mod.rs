//! Runs a callback after a watched allocation becomes unreachable.
//!
//! [`register`] downgrades the referent and parks the watch on a lock-free
//! intake queue. A single background sweeper thread is spawned on demand,
//! polls the watches, runs each callback exactly once after its referent's
//! last strong reference is gone, and exits when it has nothing left to
//! watch.
//!
//! Guarantees: the callback runs exactly once, never before the referent is
//! unreachable, and with no bound on how long after. Callers that need
//! prompt reclamation should pair this with a deterministic `Drop` path and
//! make the callback idempotent.

use crossbeam_queue::SegQueue;
use std::{
    any::Any,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, LazyLock, Weak,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};
use tracing::{debug, warn};

const SWEEP_INTERVAL: Duration = Duration::from_millis(50);

struct Watch {
    referent: Weak<dyn Any + Send + Sync>,
    cleanup: Option<Box<dyn FnOnce() + Send>>,
}

static PENDING: LazyLock<SegQueue<Watch>> = LazyLock::new(SegQueue::new);
static SWEEPER_RUNNING: AtomicBool = AtomicBool::new(false);

/// Watch `referent` and run `cleanup` once after it becomes unreachable.
///
/// Only the weak count is held here, so registration does not keep the
/// referent alive.
pub fn register<R>(referent: &Arc<R>, cleanup: impl FnOnce() + Send + 'static)
where
    R: Send + Sync + 'static,
{
    let referent: Arc<dyn Any + Send + Sync> = referent.clone();
    let referent: Weak<dyn Any + Send + Sync> = Arc::downgrade(&referent);
    PENDING.push(Watch { referent, cleanup: Some(Box::new(cleanup)) });
    ensure_sweeper();
}

fn ensure_sweeper() {
    if SWEEPER_RUNNING
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        let spawned = thread::Builder::new()
            .name("rebound-cleaner".into())
            .spawn(sweep);
        if spawned.is_err() {
            SWEEPER_RUNNING.store(false, Ordering::Release);
        }
    }
}

fn run_cleanup(watch: &mut Watch) {
    if let Some(cleanup) = watch.cleanup.take() {
        if catch_unwind(AssertUnwindSafe(cleanup)).is_err() {
            warn!("unreachability cleanup callback panicked");
        }
    }
}

fn sweep() {
    debug!("cleanup sweeper started");
    let mut watches: Vec<Watch> = Vec::new();
    loop {
        while let Some(watch) = PENDING.pop() {
            watches.push(watch);
        }
        watches.retain_mut(|watch| {
            if watch.referent.strong_count() == 0 {
                run_cleanup(watch);
                false
            } else {
                true
            }
        });
        if watches.is_empty() {
            // Stand down, then re-arm if a registration raced the handoff.
            // Losing the re-arm race means another sweeper took over.
            SWEEPER_RUNNING.store(false, Ordering::Release);
            if PENDING.is_empty()
                || SWEEPER_RUNNING
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
            {
                break;
            }
            continue;
        }
        thread::sleep(SWEEP_INTERVAL);
    }
    debug!("cleanup sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        done()
    }

    #[test]
    fn callback_fires_after_last_reference_drops() {
        let fired = Arc::new(AtomicUsize::new(0));
        let referent = Arc::new(42usize);
        let counter = fired.clone();
        register(&referent, move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        // still reachable, must not fire
        thread::sleep(SWEEP_INTERVAL * 3);
        assert_eq!(fired.load(Ordering::Relaxed), 0);

        drop(referent);
        assert!(wait_for(Duration::from_secs(5), || {
            fired.load(Ordering::Relaxed) == 1
        }));

        // exactly once
        thread::sleep(SWEEP_INTERVAL * 3);
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn sweeper_rearms_after_going_idle() {
        let fired = Arc::new(AtomicUsize::new(0));
        for round in 0..3 {
            let referent = Arc::new(round);
            let counter = fired.clone();
            register(&referent, move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
            drop(referent);
            assert!(wait_for(Duration::from_secs(5), || {
                fired.load(Ordering::Relaxed) == round + 1
            }));
            // give the sweeper a chance to stand down before the next round
            thread::sleep(SWEEP_INTERVAL * 2);
        }
    }

    #[test]
    fn many_watches_resolve_independently() {
        let fired = Arc::new(AtomicUsize::new(0));
        let keep: Vec<Arc<usize>> = (0..8).map(Arc::new).collect();
        let dead: Vec<Arc<usize>> = (0..8).map(Arc::new).collect();
        for referent in keep.iter().chain(dead.iter()) {
            let counter = fired.clone();
            register(referent, move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        drop(dead);
        assert!(wait_for(Duration::from_secs(5), || {
            fired.load(Ordering::Relaxed) == 8
        }));
        thread::sleep(SWEEP_INTERVAL * 2);
        assert_eq!(fired.load(Ordering::Relaxed), 8);
        drop(keep);
        assert!(wait_for(Duration::from_secs(5), || {
            fired.load(Ordering::Relaxed) == 16
        }));
    }
}
