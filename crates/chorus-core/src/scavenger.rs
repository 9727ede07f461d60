//! Deferred reclamation for state retired from the real-time path
//!
//! Ring buffer sets and stretcher banks that the real-time reader has
//! finished with must not be freed on the real-time thread, and must not be
//! freed under any lock it shares. Retired objects are parked on a
//! `basedrop` collector queue and destroyed later by [`Scavenger::scavenge`]
//! from a non-real-time context (the fill loop, and teardown).
//!
//! Retirement itself also only happens on non-real-time threads: the
//! real-time reader hands superseded state back over an `rtrb` channel, so
//! anything that reaches the collector is already unreachable from the
//! real-time side and can be freed as soon as `scavenge` runs.

use basedrop::{Collector, Handle, Owned};

/// Owns the collector queue. Not `Sync`; lives with the fill thread.
pub struct Scavenger {
    collector: Collector,
}

impl Scavenger {
    pub fn new() -> Self {
        Self {
            collector: Collector::new(),
        }
    }

    /// A cheap, cloneable, `Send` handle for retiring objects.
    pub fn handle(&self) -> ScavengerHandle {
        ScavengerHandle {
            handle: self.collector.handle(),
        }
    }

    /// Free everything retired so far. Call periodically from a
    /// non-real-time context.
    pub fn scavenge(&mut self) {
        self.collector.collect();
    }

    /// Number of allocations still tracked (retired but not yet freed,
    /// plus live `retire` handles' in-flight objects).
    pub fn tracked(&self) -> usize {
        self.collector.alloc_count()
    }
}

impl Default for Scavenger {
    fn default() -> Self {
        Self::new()
    }
}

/// Retirement endpoint of a [`Scavenger`].
#[derive(Clone)]
pub struct ScavengerHandle {
    handle: Handle,
}

impl ScavengerHandle {
    /// Transfer ownership of `object` into the pending list. The object's
    /// destructor runs on the next `scavenge`, never here.
    pub fn retire<T: Send + 'static>(&self, object: T) {
        drop(Owned::new(&self.handle, object));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct DropProbe(Arc<AtomicUsize>);

    impl Drop for DropProbe {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_retired_objects_freed_only_on_scavenge() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut scavenger = Scavenger::new();
        let handle = scavenger.handle();

        handle.retire(DropProbe(Arc::clone(&drops)));
        handle.retire(DropProbe(Arc::clone(&drops)));
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        scavenger.scavenge();
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_retire_from_another_thread() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut scavenger = Scavenger::new();
        let handle = scavenger.handle();

        let probe_drops = Arc::clone(&drops);
        std::thread::spawn(move || {
            handle.retire(DropProbe(probe_drops));
        })
        .join()
        .unwrap();

        scavenger.scavenge();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
