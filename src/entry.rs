//! Pool entries: one live resource plus its bookkeeping

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::bag::{BagEntry, EntryState};
use crate::scheduler::ScheduledTask;

pub(crate) struct PoolEntry<R> {
    id: u64,
    state: AtomicU8,
    resource: Mutex<Option<R>>,
    created_at: u64,
    last_accessed: AtomicU64,
    last_borrowed: AtomicU64,
    evicted: AtomicBool,
    aborted: AtomicBool,
    end_of_life: Mutex<Option<ScheduledTask>>,
}

impl<R> PoolEntry<R> {
    pub fn new(id: u64, resource: R, now: u64) -> Self {
        Self {
            id,
            state: AtomicU8::new(EntryState::Free as u8),
            resource: Mutex::new(Some(resource)),
            created_at: now,
            last_accessed: AtomicU64::new(now),
            last_borrowed: AtomicU64::new(0),
            evicted: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            end_of_life: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn last_accessed(&self) -> u64 {
        self.last_accessed.load(Ordering::Acquire)
    }

    pub fn set_last_accessed(&self, now: u64) {
        self.last_accessed.store(now, Ordering::Release);
    }

    pub fn last_borrowed(&self) -> u64 {
        self.last_borrowed.load(Ordering::Acquire)
    }

    pub fn set_last_borrowed(&self, now: u64) {
        self.last_borrowed.store(now, Ordering::Release);
    }

    pub fn mark_evicted(&self) {
        self.evicted.store(true, Ordering::Release);
    }

    pub fn is_marked_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    /// Flag an in-use entry whose resource must be closed by its holder on return.
    pub fn mark_aborted(&self) {
        self.aborted.store(true, Ordering::Release);
        self.mark_evicted();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn set_end_of_life(&self, task: ScheduledTask) {
        *self.end_of_life.lock() = Some(task);
    }

    /// Move the resource out to a borrower.
    pub fn take_resource(&self) -> Option<R> {
        self.resource.lock().take()
    }

    /// Put a returned resource back into the entry.
    pub fn restore_resource(&self, resource: R) {
        *self.resource.lock() = Some(resource);
    }

    /// Detach the resource for closing and cancel the end-of-life timer.
    pub fn close(&self) -> Option<R> {
        if let Some(task) = self.end_of_life.lock().take() {
            task.cancel();
        }
        self.take_resource()
    }
}

impl<R: Send + 'static> BagEntry for PoolEntry<R> {
    fn state(&self) -> EntryState {
        EntryState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn compare_and_set(&self, expect: EntryState, update: EntryState) -> bool {
        self.state
            .compare_exchange(expect as u8, update as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl<R> fmt::Debug for PoolEntry<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolEntry")
            .field("id", &self.id)
            .field("state", &EntryState::from_u8(self.state.load(Ordering::Acquire)))
            .field("last_accessed", &self.last_accessed())
            .field("evicted", &self.is_marked_evicted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Scheduler;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn state_transitions_are_single_step() {
        let entry = PoolEntry::new(1, "conn", 100);
        assert_eq!(entry.state(), EntryState::Free);

        assert!(entry.compare_and_set(EntryState::Free, EntryState::Using));
        assert!(!entry.compare_and_set(EntryState::Free, EntryState::Reserved));
        assert!(entry.compare_and_set(EntryState::Using, EntryState::Removed));
        assert!(!entry.compare_and_set(EntryState::Removed, EntryState::Free));
        assert_eq!(entry.state(), EntryState::Removed);
    }

    #[test]
    fn resource_moves_out_and_back() {
        let entry = PoolEntry::new(1, String::from("conn"), 100);
        let resource = entry.take_resource().unwrap();
        assert!(entry.take_resource().is_none());

        entry.restore_resource(resource);
        assert_eq!(entry.close().as_deref(), Some("conn"));
        assert!(entry.close().is_none());
    }

    #[test]
    fn close_cancels_end_of_life_timer() {
        let scheduler = Scheduler::new("eol".to_string()).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let entry = PoolEntry::new(1, 5u32, 0);
        entry.set_end_of_life(scheduler.schedule(Duration::from_millis(50), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(entry.close(), Some(5));
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        scheduler.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn abort_implies_eviction() {
        let entry = PoolEntry::new(3, (), 0);
        assert!(!entry.is_marked_evicted());
        entry.mark_aborted();
        assert!(entry.is_aborted());
        assert!(entry.is_marked_evicted());
        assert_eq!(entry.last_borrowed(), 0);
        entry.set_last_borrowed(42);
        assert_eq!(entry.last_borrowed(), 42);
    }
}
