//! Registries of in-flight blocking operations.
//!
//! # How cancellation works (for beginners)
//!
//! A blocking call (a timed condition wait, a socket read running on a
//! background task) cannot be "killed" from the outside.  Instead it is
//! wrapped in a [`CancellableOperation`] whose target knows how to wake it
//! up early: notify a condition variable, abort a task, close a queue.
//!
//! The operation registers itself at every [`CancellationRegistry`] whose
//! owner it depends on.  When the owner goes away (an outlet is dropped, an
//! inlet's connection is lost) the registry calls `cancel()` on every
//! registered operation, which makes each blocked call return promptly.
//!
//! Neither side holds a strong reference to the other's bookkeeping:
//!
//! - a registry stores operations in a table keyed by a registration index;
//! - an operation stores, per registry id, a weak handle plus its index.
//!
//! Dropping either side removes its entries from the other, so no stale
//! reference survives.  Ids come from one process-wide counter and are never
//! reused.
//!
//! Lock order is always *operation links → registry table*.  A registry
//! never calls `cancel()` while holding its own table lock, so a target is
//! free to unregister itself from inside `cancel()`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, error};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Locks `mutex`, recovering the data if a panicking thread poisoned it.
///
/// Registry bookkeeping runs inside destructors, where a second panic would
/// abort the process; the poisoning is logged instead.
pub(crate) fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        error!("{what} lock was poisoned; continuing with recovered state");
        poisoned.into_inner()
    })
}

// ── Cancellable ───────────────────────────────────────────────────────────────

/// Something that can wake up a blocked call early.
///
/// `cancel` may be called from any thread, any number of times, and must
/// not block for long.
pub trait Cancellable: Send + Sync {
    fn cancel(&self);
}

struct FnCanceller<F>(F);

impl<F> Cancellable for FnCanceller<F>
where
    F: Fn() + Send + Sync,
{
    fn cancel(&self) {
        (self.0)()
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

struct RegistryTable {
    closed: bool,
    entries: HashMap<u64, Arc<OperationShared>>,
}

struct RegistryShared {
    id: u64,
    table: Mutex<RegistryTable>,
}

impl RegistryShared {
    fn remove(&self, registration: u64) {
        lock_or_recover(&self.table, "cancellation registry").entries.remove(&registration);
    }
}

/// The owner side: cancels every registered operation when dropped.
pub struct CancellationRegistry {
    shared: Arc<RegistryShared>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                id: next_id(),
                table: Mutex::new(RegistryTable {
                    closed: false,
                    entries: HashMap::new(),
                }),
            }),
        }
    }

    /// A weak handle operations can register through without keeping the
    /// registry alive.
    pub fn handle(&self) -> RegistryRef {
        RegistryRef {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Number of operations currently registered.
    pub fn len(&self) -> usize {
        lock_or_recover(&self.shared.table, "cancellation registry").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancels every registered operation without closing the registry.
    ///
    /// The operations stay registered; later registrations are accepted.
    pub fn cancel_all(&self) {
        let snapshot: Vec<Arc<OperationShared>> = {
            let table = lock_or_recover(&self.shared.table, "cancellation registry");
            table.entries.values().cloned().collect()
        };
        for op in snapshot {
            op.fire();
        }
    }
}

impl Default for CancellationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancellationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationRegistry")
            .field("id", &self.shared.id)
            .field("registered", &self.len())
            .finish()
    }
}

impl Drop for CancellationRegistry {
    fn drop(&mut self) {
        let entries = {
            let mut table = lock_or_recover(&self.shared.table, "cancellation registry");
            table.closed = true;
            std::mem::take(&mut table.entries)
        };
        if !entries.is_empty() {
            debug!(
                "cancellation registry {} closing with {} operation(s) in flight",
                self.shared.id,
                entries.len()
            );
        }
        for op in entries.into_values() {
            op.fire();
            lock_or_recover(&op.links, "cancellable operation").remove(&self.shared.id);
        }
    }
}

/// Weak, cloneable handle to a [`CancellationRegistry`].
#[derive(Clone)]
pub struct RegistryRef {
    shared: Weak<RegistryShared>,
}

impl RegistryRef {
    /// `true` once the registry has been dropped or closed.
    pub fn is_closed(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => lock_or_recover(&shared.table, "cancellation registry").closed,
            None => true,
        }
    }
}

// ── Operation ─────────────────────────────────────────────────────────────────

struct Link {
    registry: Weak<RegistryShared>,
    registration: u64,
}

struct OperationShared {
    target: Arc<dyn Cancellable>,
    cancelled: AtomicBool,
    links: Mutex<HashMap<u64, Link>>,
}

impl OperationShared {
    fn fire(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.target.cancel();
    }
}

/// The operation side: a cancel target plus its registrations.
///
/// Dropping the operation unregisters it everywhere.
pub struct CancellableOperation {
    shared: Arc<OperationShared>,
}

impl CancellableOperation {
    pub fn new(target: Arc<dyn Cancellable>) -> Self {
        Self {
            shared: Arc::new(OperationShared {
                target,
                cancelled: AtomicBool::new(false),
                links: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Wraps a closure as the cancel target.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::new(Arc::new(FnCanceller(f)))
    }

    /// Registers at `registry`.  Registering twice is a no-op.
    ///
    /// Returns `false` if the registry is already closed, in which case the
    /// operation is cancelled immediately.
    pub fn register_at(&self, registry: &CancellationRegistry) -> bool {
        self.register_shared(&registry.shared)
    }

    /// Like [`register_at`](Self::register_at) through a weak handle.
    ///
    /// A registry that no longer exists counts as closed.
    pub fn register_at_ref(&self, registry: &RegistryRef) -> bool {
        match registry.shared.upgrade() {
            Some(shared) => self.register_shared(&shared),
            None => {
                self.shared.fire();
                false
            }
        }
    }

    fn register_shared(&self, registry: &Arc<RegistryShared>) -> bool {
        let mut links = lock_or_recover(&self.shared.links, "cancellable operation");
        if links.contains_key(&registry.id) {
            return true;
        }
        let mut table = lock_or_recover(&registry.table, "cancellation registry");
        if table.closed {
            drop(table);
            drop(links);
            self.shared.fire();
            return false;
        }
        let registration = next_id();
        table.entries.insert(registration, Arc::clone(&self.shared));
        links.insert(
            registry.id,
            Link {
                registry: Arc::downgrade(registry),
                registration,
            },
        );
        true
    }

    /// Removes the registration at `registry`, if any.  Idempotent.
    pub fn unregister_from(&self, registry: &CancellationRegistry) {
        let link = lock_or_recover(&self.shared.links, "cancellable operation")
            .remove(&registry.shared.id);
        if let Some(link) = link {
            registry.shared.remove(link.registration);
        }
    }

    /// Removes every registration of this operation.
    pub fn unregister_from_all(&self) {
        let links: Vec<Link> = lock_or_recover(&self.shared.links, "cancellable operation")
            .drain()
            .map(|(_, link)| link)
            .collect();
        for link in links {
            if let Some(registry) = link.registry.upgrade() {
                registry.remove(link.registration);
            }
        }
    }

    /// Number of registries this operation is registered at.
    pub fn registration_count(&self) -> usize {
        lock_or_recover(&self.shared.links, "cancellable operation").len()
    }

    /// `true` once any registry has cancelled this operation.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }
}

impl Drop for CancellableOperation {
    fn drop(&mut self) {
        self.unregister_from_all();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Condvar;
    use std::thread;
    use std::time::{Duration, Instant};

    fn counting_op() -> (CancellableOperation, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let op = CancellableOperation::from_fn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (op, hits)
    }

    #[test]
    fn test_dropping_registry_cancels_registered_operations() {
        // Arrange
        let registry = CancellationRegistry::new();
        let (op, hits) = counting_op();
        assert!(op.register_at(&registry));

        // Act
        drop(registry);

        // Assert
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(op.is_cancelled());
        assert_eq!(op.registration_count(), 0, "back-link must be removed");
    }

    #[test]
    fn test_registration_is_idempotent() {
        // Arrange
        let registry = CancellationRegistry::new();
        let (op, hits) = counting_op();

        // Act
        op.register_at(&registry);
        op.register_at(&registry);
        drop(registry);

        // Assert
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropping_operation_unregisters_everywhere() {
        // Arrange
        let a = CancellationRegistry::new();
        let b = CancellationRegistry::new();
        let (op, hits) = counting_op();
        op.register_at(&a);
        op.register_at(&b);
        assert_eq!((a.len(), b.len()), (1, 1));

        // Act
        drop(op);

        // Assert
        assert!(a.is_empty());
        assert!(b.is_empty());
        drop(a);
        drop(b);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = CancellationRegistry::new();
        let (op, _) = counting_op();
        op.register_at(&registry);

        op.unregister_from(&registry);
        op.unregister_from(&registry);

        assert!(registry.is_empty());
        assert_eq!(op.registration_count(), 0);
    }

    #[test]
    fn test_cancel_all_keeps_registrations() {
        // Arrange
        let registry = CancellationRegistry::new();
        let (op, hits) = counting_op();
        op.register_at(&registry);

        // Act
        registry.cancel_all();
        registry.cancel_all();

        // Assert
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registering_at_dropped_registry_cancels_immediately() {
        // Arrange
        let registry = CancellationRegistry::new();
        let handle = registry.handle();
        drop(registry);
        let (op, hits) = counting_op();

        // Act
        let registered = op.register_at_ref(&handle);

        // Assert
        assert!(!registered);
        assert!(handle.is_closed());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_target_may_unregister_itself_during_cancel() {
        // Arrange – the cancel target drops its own registration
        let registry = Arc::new(CancellationRegistry::new());
        let slot: Arc<Mutex<Option<CancellableOperation>>> = Arc::new(Mutex::new(None));
        let inner_slot = Arc::clone(&slot);
        let op = CancellableOperation::from_fn(move || {
            if let Ok(mut guard) = inner_slot.try_lock() {
                guard.take();
            }
        });
        op.register_at(&registry);
        *slot.lock().expect("lock") = Some(op);

        // Act – must not deadlock
        registry.cancel_all();

        // Assert
        assert!(slot.lock().expect("lock").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_drop_from_other_thread_wakes_blocked_waiter() {
        // Arrange – a waiter blocked on a condition variable for up to 10 s
        struct Gate {
            open: Mutex<bool>,
            cond: Condvar,
        }
        impl Cancellable for Gate {
            fn cancel(&self) {
                *self.open.lock().expect("lock") = true;
                self.cond.notify_all();
            }
        }
        let gate = Arc::new(Gate {
            open: Mutex::new(false),
            cond: Condvar::new(),
        });
        let registry = CancellationRegistry::new();
        let op = CancellableOperation::new(Arc::clone(&gate) as Arc<dyn Cancellable>);
        op.register_at(&registry);

        let waiter_gate = Arc::clone(&gate);
        let waiter = thread::spawn(move || {
            let start = Instant::now();
            let guard = waiter_gate.open.lock().expect("lock");
            let _guard = waiter_gate
                .cond
                .wait_timeout_while(guard, Duration::from_secs(10), |open| !*open)
                .expect("wait");
            start.elapsed()
        });

        // Act
        thread::sleep(Duration::from_millis(50));
        drop(registry);

        // Assert
        let waited = waiter.join().expect("waiter panicked");
        assert!(waited < Duration::from_secs(5));
        assert!(op.is_cancelled());
    }
}
