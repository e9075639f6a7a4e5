//! LightEpoch - Lightweight epoch-based memory reclamation
//!
//! Threads enter a protected region before touching overflow buckets or a
//! table generation, and leave it afterwards. Memory unlinked at epoch `e` is
//! handed to [`LightEpoch::bump_current_epoch_with_action`] and released once
//! every thread has moved past `e`.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::thread;

use parking_lot::Mutex;

use crate::constants::{CACHE_LINE_BYTES, MAX_THREADS};

// ============ Thread ID Allocation ============

/// Ids released by exited threads, reused before minting new ones
static FREE_THREAD_IDS: Mutex<Vec<usize>> = Mutex::new(Vec::new());

/// Next never-used id
static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(0);

struct ThreadIdSlot(usize);

impl ThreadIdSlot {
    fn acquire() -> Self {
        if let Some(id) = FREE_THREAD_IDS.lock().pop() {
            return Self(id);
        }
        let id = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
        assert!(
            id < MAX_THREADS,
            "more than {MAX_THREADS} threads are using epoch protection concurrently"
        );
        Self(id)
    }
}

impl Drop for ThreadIdSlot {
    fn drop(&mut self) {
        FREE_THREAD_IDS.lock().push(self.0);
    }
}

thread_local! {
    static THREAD_ID: ThreadIdSlot = ThreadIdSlot::acquire();
}

/// Get the current thread's ID for epoch protection
///
/// The ID is allocated on first call, stays constant for the thread's
/// lifetime and is recycled when the thread exits.
///
/// # Panics
///
/// Panics if more than `MAX_THREADS` threads hold an ID at the same time.
#[inline]
pub fn get_thread_id() -> usize {
    THREAD_ID.with(|slot| slot.0)
}

/// Special epoch value indicating the thread is not protected
pub const UNPROTECTED: u64 = 0;

/// Size of the drain list for deferred actions
const DRAIN_LIST_SIZE: usize = 256;

/// Entry in the epoch table (one per thread)
#[repr(C, align(64))]
struct Entry {
    /// Local epoch value seen by this thread
    local_current_epoch: AtomicU64,
    /// Reentrant protection counter
    reentrant: AtomicU32,
    /// Padding to fill cache line
    _padding: [u8; CACHE_LINE_BYTES - 12],
}

impl Entry {
    const fn new() -> Self {
        Self {
            local_current_epoch: AtomicU64::new(UNPROTECTED),
            reentrant: AtomicU32::new(0),
            _padding: [0; CACHE_LINE_BYTES - 12],
        }
    }
}

type DeferredAction = Box<dyn FnOnce() + Send + 'static>;

/// Action to be performed when an epoch becomes safe to reclaim
pub struct EpochAction {
    /// The epoch when this action was registered
    epoch: AtomicU64,
    /// The callback to invoke
    callback: UnsafeCell<Option<DeferredAction>>,
}

impl EpochAction {
    /// Epoch value indicating this slot is free
    const FREE: u64 = u64::MAX;
    /// Epoch value indicating this slot is locked
    const LOCKED: u64 = u64::MAX - 1;

    const fn new() -> Self {
        Self {
            epoch: AtomicU64::new(Self::FREE),
            callback: UnsafeCell::new(None),
        }
    }

    /// Try to pop the action if the epoch has been reached
    fn try_pop(&self, expected_epoch: u64) -> bool {
        match self.epoch.compare_exchange(
            expected_epoch,
            Self::LOCKED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // SAFETY: the LOCKED state gives this thread exclusive access to the callback.
                let callback = unsafe { (*self.callback.get()).take() };
                self.epoch.store(Self::FREE, Ordering::Release);
                if let Some(cb) = callback {
                    cb();
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Try to push a new action
    ///
    /// Returns `Err(callback)` if the slot was taken, so the caller can retry elsewhere.
    fn try_push(&self, prior_epoch: u64, callback: DeferredAction) -> Result<(), DeferredAction> {
        match self.epoch.compare_exchange(
            Self::FREE,
            Self::LOCKED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // SAFETY: the LOCKED state gives this thread exclusive access to the callback.
                unsafe {
                    *self.callback.get() = Some(callback);
                }
                self.epoch.store(prior_epoch, Ordering::Release);
                Ok(())
            }
            Err(_) => Err(callback),
        }
    }

    /// Try to run an existing, already-safe action and install a new one in its place
    fn try_swap(
        &self,
        expected_epoch: u64,
        prior_epoch: u64,
        new_callback: DeferredAction,
    ) -> Result<(), DeferredAction> {
        match self.epoch.compare_exchange(
            expected_epoch,
            Self::LOCKED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // SAFETY: the LOCKED state gives this thread exclusive access to the callback.
                let existing_callback = unsafe { (*self.callback.get()).replace(new_callback) };
                self.epoch.store(prior_epoch, Ordering::Release);
                if let Some(cb) = existing_callback {
                    cb();
                }
                Ok(())
            }
            Err(_) => Err(new_callback),
        }
    }
}

// Safety: the callback cell is only touched while the slot is LOCKED by one thread
unsafe impl Send for EpochAction {}
unsafe impl Sync for EpochAction {}

/// Lightweight epoch protection framework
///
/// Tracks which threads are inside a protected region and defers cleanup
/// until all threads have moved past a safe point.
pub struct LightEpoch {
    /// Per-thread epoch table
    table: Box<[Entry]>,
    /// List of deferred actions
    drain_list: Box<[EpochAction]>,
    /// Number of pending drain actions
    drain_count: AtomicU32,
    /// Current global epoch
    current_epoch: AtomicU64,
    /// Cached safe-to-reclaim epoch
    safe_to_reclaim_epoch: AtomicU64,
}

impl LightEpoch {
    /// Create a new LightEpoch instance
    pub fn new() -> Self {
        let table: Vec<Entry> = (0..MAX_THREADS).map(|_| Entry::new()).collect();
        let drain_list: Vec<EpochAction> =
            (0..DRAIN_LIST_SIZE).map(|_| EpochAction::new()).collect();

        Self {
            table: table.into_boxed_slice(),
            drain_list: drain_list.into_boxed_slice(),
            drain_count: AtomicU32::new(0),
            current_epoch: AtomicU64::new(1),
            safe_to_reclaim_epoch: AtomicU64::new(0),
        }
    }

    /// Current global epoch
    #[inline]
    pub fn current_epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::Acquire)
    }

    /// Last computed safe-to-reclaim epoch
    #[inline]
    pub fn safe_to_reclaim_epoch(&self) -> u64 {
        self.safe_to_reclaim_epoch.load(Ordering::Acquire)
    }

    /// Number of deferred actions not yet executed
    #[inline]
    pub fn pending_actions(&self) -> u32 {
        self.drain_count.load(Ordering::Acquire)
    }

    /// Enter the protected region
    ///
    /// Returns the epoch this thread is now protected at.
    #[inline]
    pub fn protect(&self, thread_id: usize) -> u64 {
        debug_assert!(thread_id < MAX_THREADS);
        let slot = &self.table[thread_id].local_current_epoch;
        let mut epoch = self.current_epoch.load(Ordering::SeqCst);
        loop {
            // SeqCst: the publication must be ordered before any later load of
            // shared index state (store-load against the resize coordinator).
            slot.store(epoch, Ordering::SeqCst);
            // A bump between the load and the store may have scanned the table
            // before this slot was published. Once the epoch reads back
            // unchanged, every later bump's scan sees the slot.
            let current = self.current_epoch.load(Ordering::SeqCst);
            if current == epoch {
                return epoch;
            }
            epoch = current;
        }
    }

    /// Reentrant protection - supports nested protection calls
    ///
    /// Only the outermost call publishes an epoch; nested calls return it.
    #[inline]
    pub fn reentrant_protect(&self, thread_id: usize) -> u64 {
        debug_assert!(thread_id < MAX_THREADS);
        let entry = &self.table[thread_id];

        if entry.reentrant.fetch_add(1, Ordering::AcqRel) == 0 {
            let epoch = self.protect(thread_id);
            if self.drain_count.load(Ordering::Acquire) > 0 {
                self.drain(epoch);
            }
            epoch
        } else {
            entry.local_current_epoch.load(Ordering::Acquire)
        }
    }

    /// Check if the thread is currently protected
    #[inline]
    pub fn is_protected(&self, thread_id: usize) -> bool {
        debug_assert!(thread_id < MAX_THREADS);
        self.table[thread_id]
            .local_current_epoch
            .load(Ordering::Acquire)
            != UNPROTECTED
    }

    /// Exit the protected region
    #[inline]
    pub fn unprotect(&self, thread_id: usize) {
        debug_assert!(thread_id < MAX_THREADS);
        self.table[thread_id]
            .local_current_epoch
            .store(UNPROTECTED, Ordering::Release);
    }

    /// Exit reentrant protection
    #[inline]
    pub fn reentrant_unprotect(&self, thread_id: usize) {
        debug_assert!(thread_id < MAX_THREADS);
        let entry = &self.table[thread_id];

        if entry.reentrant.fetch_sub(1, Ordering::AcqRel) == 1 {
            entry
                .local_current_epoch
                .store(UNPROTECTED, Ordering::Release);
        }
    }

    /// Drain pending actions that are now safe to execute
    fn drain(&self, next_epoch: u64) {
        let safe_epoch = self.compute_new_safe_to_reclaim_epoch(next_epoch);

        for action in self.drain_list.iter() {
            let trigger_epoch = action.epoch.load(Ordering::Acquire);
            if trigger_epoch <= safe_epoch
                && trigger_epoch != EpochAction::FREE
                && trigger_epoch != EpochAction::LOCKED
                && action.try_pop(trigger_epoch)
                && self.drain_count.fetch_sub(1, Ordering::AcqRel) == 1
            {
                break;
            }
        }
    }

    /// Run every deferred action whose epoch is already safe.
    ///
    /// This is the caller-driven "try advance" step; it never blocks.
    pub fn try_drain(&self) {
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.drain(self.current_epoch.load(Ordering::Acquire));
        }
    }

    /// Increment the current epoch
    pub fn bump_current_epoch(&self) -> u64 {
        let next_epoch = self.current_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.drain(next_epoch);
        }
        next_epoch
    }

    /// Increment the epoch and register a callback for when the old epoch is safe
    ///
    /// Returns the new current epoch.
    pub fn bump_current_epoch_with_action<F>(&self, callback: F) -> u64
    where
        F: FnOnce() + Send + 'static,
    {
        let prior_epoch = self.bump_current_epoch() - 1;

        let mut callback: DeferredAction = Box::new(callback);
        let mut i = 0;
        let mut warned = false;
        loop {
            let trigger_epoch = self.drain_list[i].epoch.load(Ordering::Acquire);

            if trigger_epoch == EpochAction::FREE {
                match self.drain_list[i].try_push(prior_epoch, callback) {
                    Ok(()) => {
                        self.drain_count.fetch_add(1, Ordering::AcqRel);
                        return prior_epoch + 1;
                    }
                    Err(returned) => callback = returned,
                }
            } else if trigger_epoch <= self.safe_to_reclaim_epoch.load(Ordering::Acquire) {
                match self.drain_list[i].try_swap(trigger_epoch, prior_epoch, callback) {
                    Ok(()) => return prior_epoch + 1,
                    Err(returned) => callback = returned,
                }
            }

            i = (i + 1) % DRAIN_LIST_SIZE;
            if i == 0 {
                if !warned && tracing::enabled!(tracing::Level::WARN) {
                    tracing::warn!(
                        prior_epoch,
                        pending = self.drain_count.load(Ordering::Relaxed),
                        "epoch drain list is full; waiting for a free slot"
                    );
                }
                warned = true;
                self.compute_new_safe_to_reclaim_epoch(self.current_epoch.load(Ordering::Acquire));
                thread::yield_now();
            }
        }
    }

    /// Compute the new safe-to-reclaim epoch by scanning all threads
    pub fn compute_new_safe_to_reclaim_epoch(&self, current_epoch: u64) -> u64 {
        let mut oldest_ongoing = current_epoch;

        for entry in self.table.iter() {
            let entry_epoch = entry.local_current_epoch.load(Ordering::SeqCst);
            if entry_epoch != UNPROTECTED && entry_epoch < oldest_ongoing {
                oldest_ongoing = entry_epoch;
            }
        }

        let safe = oldest_ongoing.saturating_sub(1);
        self.safe_to_reclaim_epoch.fetch_max(safe, Ordering::AcqRel);
        self.safe_to_reclaim_epoch.load(Ordering::Acquire)
    }

    /// Spin wait until the specified epoch is safe to reclaim
    ///
    /// The calling thread must not itself be protected at or below `target_safe_epoch`.
    pub fn spin_wait_for_safe_to_reclaim(&self, target_safe_epoch: u64) {
        loop {
            let current = self.current_epoch.load(Ordering::Acquire);
            if self.compute_new_safe_to_reclaim_epoch(current) >= target_safe_epoch {
                break;
            }
            thread::yield_now();
        }
    }

    /// Check if an epoch is safe to reclaim
    #[inline]
    pub fn is_safe_to_reclaim(&self, epoch: u64) -> bool {
        epoch <= self.safe_to_reclaim_epoch.load(Ordering::Acquire)
    }
}

impl Default for LightEpoch {
    fn default() -> Self {
        Self::new()
    }
}

// Safety: LightEpoch uses only atomic operations for thread-safe access
unsafe impl Send for LightEpoch {}
unsafe impl Sync for LightEpoch {}

/// RAII guard for reentrant epoch protection
///
/// Bound to the thread that created it.
pub struct EpochGuard<'a> {
    epoch: &'a LightEpoch,
    thread_id: usize,
    protected_at: u64,
    _not_send: PhantomData<*const ()>,
}

impl<'a> EpochGuard<'a> {
    /// Protect the current thread
    pub fn new(epoch: &'a LightEpoch) -> Self {
        Self::with_thread_id(epoch, get_thread_id())
    }

    /// Protect using an explicit thread ID
    pub fn with_thread_id(epoch: &'a LightEpoch, thread_id: usize) -> Self {
        let protected_at = epoch.reentrant_protect(thread_id);
        Self {
            epoch,
            thread_id,
            protected_at,
            _not_send: PhantomData,
        }
    }

    /// Get the thread ID
    pub fn thread_id(&self) -> usize {
        self.thread_id
    }

    /// Epoch the thread is protected at (the outermost guard's epoch)
    pub fn protected_at(&self) -> u64 {
        self.protected_at
    }
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        self.epoch.reentrant_unprotect(self.thread_id);
    }
}
