//! Concurrent container of pool entries
//!
//! Borrowing favours, in order: the calling thread's own recently returned
//! entries, a scan of the shared list, and finally a blocking hand-off from a
//! thread that returns or adds an entry while we wait. Entries stay in the
//! shared list for their whole life; ownership is expressed purely through
//! their [`EntryState`], changed by compare-and-swap.

use std::cell::RefCell;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use tracing::{info, warn};

use crate::errors::{PoolError, PoolResult};

/// Per-thread free lists are capped; past this, returns go only to the shared list.
const THREAD_LIST_CAP: usize = 50;

/// Remaining waits shorter than this are treated as exhausted.
const MIN_WAIT: Duration = Duration::from_micros(10);

/// Lifecycle state of an entry held by a [`ResourceBag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntryState {
    Free = 0,
    Using = 1,
    Removed = 2,
    Reserved = 3,
}

impl EntryState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => EntryState::Free,
            1 => EntryState::Using,
            3 => EntryState::Reserved,
            _ => EntryState::Removed,
        }
    }
}

/// An item that can live in a [`ResourceBag`].
pub trait BagEntry: Debug + Send + Sync + 'static {
    fn state(&self) -> EntryState;

    /// Atomically move from `expect` to `update`; `false` if the state was different.
    fn compare_and_set(&self, expect: EntryState, update: EntryState) -> bool;
}

/// Receives growth requests from a bag whose borrowers found nothing free.
pub trait BagStateListener: Send + Sync {
    fn add_bag_item(&self, waiting: usize);
}

/// Counts of entries per state, as seen by a single pass over the shared list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub free: usize,
    pub using: usize,
    pub reserved: usize,
    pub removed: usize,
}

type ThreadLists<E> = DashMap<ThreadId, Vec<Arc<E>>>;

pub struct ResourceBag<E: BagEntry> {
    shared: ArcSwap<Vec<Arc<E>>>,
    thread_lists: Arc<ThreadLists<E>>,
    waiters: AtomicUsize,
    closed: AtomicBool,
    handoff_tx: Sender<Arc<E>>,
    handoff_rx: Receiver<Arc<E>>,
    listener: Weak<dyn BagStateListener>,
}

impl<E: BagEntry> ResourceBag<E> {
    pub fn new(listener: Weak<dyn BagStateListener>) -> Self {
        let (handoff_tx, handoff_rx) = channel::bounded(0);
        Self {
            shared: ArcSwap::from_pointee(Vec::new()),
            thread_lists: Arc::new(DashMap::new()),
            waiters: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            handoff_tx,
            handoff_rx,
            listener,
        }
    }

    /// Borrow a free entry, waiting up to `timeout` for one to be handed over.
    ///
    /// Returns `None` only when the wait budget is exhausted (or the bag is closed).
    pub fn borrow(&self, timeout: Duration) -> Option<Arc<E>> {
        if let Some(entry) = self.borrow_thread_local() {
            return Some(entry);
        }

        let waiting = self.waiters.fetch_add(1, Ordering::AcqRel) + 1;
        let _waiter = WaiterGuard(&self.waiters);

        for entry in self.shared.load().iter() {
            if entry.compare_and_set(EntryState::Free, EntryState::Using) {
                // We may have taken an entry another waiter was about to receive.
                if waiting > 1 {
                    self.request_growth(waiting - 1);
                }
                return Some(Arc::clone(entry));
            }
        }

        self.request_growth(waiting);

        // No representable deadline means wait without bound.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => timeout,
            };
            if remaining < MIN_WAIT {
                return None;
            }
            match self.handoff_rx.recv_timeout(remaining) {
                Ok(entry) => {
                    if entry.compare_and_set(EntryState::Free, EntryState::Using) {
                        return Some(entry);
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return None;
                }
            }
        }
    }

    fn borrow_thread_local(&self) -> Option<Arc<E>> {
        let mut list = self.thread_lists.get_mut(&thread::current().id())?;
        while let Some(entry) = list.pop() {
            if entry.compare_and_set(EntryState::Free, EntryState::Using) {
                return Some(entry);
            }
        }
        None
    }

    /// Return a borrowed entry. Fails if the entry was removed while borrowed.
    pub fn requite(&self, entry: Arc<E>) -> PoolResult<()> {
        if !entry.compare_and_set(EntryState::Using, EntryState::Free) {
            return Err(PoolError::UsageContract {
                operation: "requite",
                found: entry.state(),
            });
        }

        let mut spins: u32 = 0;
        while self.waiters.load(Ordering::Acquire) > 0 {
            if entry.state() != EntryState::Free || self.offer(&entry) {
                return Ok(());
            }
            spins = spins.wrapping_add(1);
            if spins & 0xff == 0xff {
                thread::sleep(MIN_WAIT);
            } else {
                thread::yield_now();
            }
        }

        if !self.closed.load(Ordering::Acquire) {
            self.cache_for_current_thread(entry);
        }
        Ok(())
    }

    fn cache_for_current_thread(&self, entry: Arc<E>) {
        let id = thread::current().id();
        if let Some(mut list) = self.thread_lists.get_mut(&id) {
            if list.len() < THREAD_LIST_CAP {
                list.push(entry);
            }
            return;
        }

        // First return from this thread: the list goes away when the thread exits.
        let lists = Arc::downgrade(&self.thread_lists);
        let registered = THREAD_EXIT.try_with(|hooks| {
            hooks.register(Box::new(ForgetThread { lists, id }));
        });
        if registered.is_ok() {
            self.thread_lists.entry(id).or_default().push(entry);
        }
    }

    /// Add a new entry; it is handed straight to a waiter when one exists.
    pub fn add(&self, entry: Arc<E>) -> PoolResult<()> {
        if self.closed.load(Ordering::Acquire) {
            info!("ResourceBag has been closed, ignoring add()");
            return Err(PoolError::UsageContract {
                operation: "add",
                found: entry.state(),
            });
        }

        self.shared.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&entry));
            next
        });

        while self.waiters.load(Ordering::Acquire) > 0
            && entry.state() == EntryState::Free
            && !self.offer(&entry)
        {
            thread::yield_now();
        }
        Ok(())
    }

    /// Remove a borrowed or reserved entry from the bag for good.
    pub fn remove(&self, entry: &Arc<E>) -> PoolResult<()> {
        if !entry.compare_and_set(EntryState::Using, EntryState::Removed)
            && !entry.compare_and_set(EntryState::Reserved, EntryState::Removed)
            && !self.closed.load(Ordering::Acquire)
        {
            let found = entry.state();
            warn!(
                "Attempt to remove an entry from the bag that was not borrowed or reserved: {:?}",
                entry
            );
            return Err(PoolError::UsageContract {
                operation: "remove",
                found,
            });
        }

        let mut removed = false;
        self.shared.rcu(|current| {
            removed = false;
            let mut next = Vec::with_capacity(current.len());
            for candidate in current.iter() {
                if !removed && Arc::ptr_eq(candidate, entry) {
                    removed = true;
                } else {
                    next.push(Arc::clone(candidate));
                }
            }
            next
        });

        for mut list in self.thread_lists.iter_mut() {
            list.retain(|cached| !Arc::ptr_eq(cached, entry));
        }

        if !removed && !self.closed.load(Ordering::Acquire) {
            warn!(
                "Attempt to remove an entry from the bag that does not exist: {:?}",
                entry
            );
            return Err(PoolError::UsageContract {
                operation: "remove",
                found: entry.state(),
            });
        }
        Ok(())
    }

    /// Soft-lock a free entry so it can be inspected without racing a borrower.
    pub fn reserve(&self, entry: &E) -> bool {
        entry.compare_and_set(EntryState::Free, EntryState::Reserved)
    }

    /// Release a reservation made by [`reserve`](Self::reserve).
    pub fn unreserve(&self, entry: &Arc<E>) -> PoolResult<()> {
        if entry.compare_and_set(EntryState::Reserved, EntryState::Free) {
            while self.waiters.load(Ordering::Acquire) > 0 && !self.offer(entry) {
                thread::yield_now();
            }
            Ok(())
        } else {
            let found = entry.state();
            warn!(
                "Attempt to relinquish an entry to the bag that was not reserved: {:?}",
                entry
            );
            Err(PoolError::UsageContract {
                operation: "unreserve",
                found,
            })
        }
    }

    /// Stop accepting new entries and release any thread-local caches.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.thread_lists.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Snapshot of every entry in the bag, whatever its state.
    pub fn values(&self) -> Vec<Arc<E>> {
        self.shared.load().iter().cloned().collect()
    }

    /// Snapshot of the entries currently in `state`.
    pub fn values_in(&self, state: EntryState) -> Vec<Arc<E>> {
        self.shared
            .load()
            .iter()
            .filter(|entry| entry.state() == state)
            .cloned()
            .collect()
    }

    pub fn count(&self, state: EntryState) -> usize {
        self.shared
            .load()
            .iter()
            .filter(|entry| entry.state() == state)
            .count()
    }

    pub fn state_counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for entry in self.shared.load().iter() {
            match entry.state() {
                EntryState::Free => counts.free += 1,
                EntryState::Using => counts.using += 1,
                EntryState::Reserved => counts.reserved += 1,
                EntryState::Removed => counts.removed += 1,
            }
        }
        counts
    }

    pub fn size(&self) -> usize {
        self.shared.load().len()
    }

    pub fn waiting(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }

    fn offer(&self, entry: &Arc<E>) -> bool {
        self.handoff_tx.try_send(Arc::clone(entry)).is_ok()
    }

    fn request_growth(&self, waiting: usize) {
        if let Some(listener) = self.listener.upgrade() {
            listener.add_bag_item(waiting);
        }
    }
}

/// Cleanup run when a thread that cached entries exits.
trait ThreadExitHook {
    /// `false` once the owning bag is gone.
    fn is_live(&self) -> bool;

    fn run(&self);
}

struct ForgetThread<E: BagEntry> {
    lists: Weak<ThreadLists<E>>,
    id: ThreadId,
}

impl<E: BagEntry> ThreadExitHook for ForgetThread<E> {
    fn is_live(&self) -> bool {
        self.lists.strong_count() > 0
    }

    fn run(&self) {
        if let Some(lists) = self.lists.upgrade() {
            lists.remove(&self.id);
        }
    }
}

#[derive(Default)]
struct ThreadExitHooks(RefCell<Vec<Box<dyn ThreadExitHook>>>);

impl ThreadExitHooks {
    fn register(&self, hook: Box<dyn ThreadExitHook>) {
        let mut hooks = self.0.borrow_mut();
        hooks.retain(|hook| hook.is_live());
        hooks.push(hook);
    }
}

impl Drop for ThreadExitHooks {
    fn drop(&mut self) {
        for hook in self.0.get_mut().drain(..) {
            hook.run();
        }
    }
}

thread_local! {
    static THREAD_EXIT: ThreadExitHooks = ThreadExitHooks::default();
}

struct WaiterGuard<'a>(&'a AtomicUsize);

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
