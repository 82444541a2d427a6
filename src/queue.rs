use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::catalog::EntryId;
use crate::error::QueueAborted;

// ---------------------------------------------------------------------------
// Work items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Jumps to the head of the queue.
    High,
    Normal,
}

/// One pending decode, keyed by the token of the catalog entry that owns it.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub token: EntryId,
    pub path: PathBuf,
    pub priority: Priority,
    /// Fit inside this box, preserving aspect ratio. Expressed in the
    /// displayed (rotated) frame; the decoder swaps it for quarter turns.
    pub target_size: Option<(u32, u32)>,
    pub rotation: u16,
    pub no_smooth_scale: bool,
}

impl WorkItem {
    pub fn new(
        token: EntryId,
        path: PathBuf,
        priority: Priority,
        target_size: Option<(u32, u32)>,
        rotation: u16,
        no_smooth_scale: bool,
    ) -> Self {
        Self {
            token,
            path,
            priority,
            target_size,
            rotation: rotation % 360,
            no_smooth_scale,
        }
    }
}

// ---------------------------------------------------------------------------
// Queue (shared between the owner and the loader workers via Mutex + Condvar)
// ---------------------------------------------------------------------------

struct QueueState {
    pending: VecDeque<WorkItem>,
    aborted: bool,
}

/// Priority FIFO of load requests. The only structure both the owner and
/// the workers mutate.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                aborted: false,
            }),
            available: Condvar::new(),
        }
    }

    // The deque is always left consistent, so a panic elsewhere while the
    // lock was held does not invalidate it.
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// High priority items become the new head, Normal ones go to the tail.
    /// Wakes one blocked worker.
    pub fn push(&self, item: WorkItem) -> Result<(), QueueAborted> {
        let mut state = self.lock();
        if state.aborted {
            return Err(QueueAborted);
        }
        match item.priority {
            Priority::High => state.pending.push_front(item),
            Priority::Normal => state.pending.push_back(item),
        }
        self.available.notify_one();
        Ok(())
    }

    /// Blocks until an item is available. Returns `None` once the queue is
    /// aborted, even if items are still pending.
    pub fn pop(&self) -> Option<WorkItem> {
        let mut state = self.lock();
        loop {
            if state.aborted {
                return None;
            }
            if let Some(item) = state.pending.pop_front() {
                return Some(item);
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn try_pop(&self) -> Option<WorkItem> {
        let mut state = self.lock();
        if state.aborted {
            return None;
        }
        state.pending.pop_front()
    }

    /// Removes the queued item for `token`. Items already handed to a
    /// worker are out of reach; the caller has to discard their result.
    pub fn cancel(&self, token: EntryId) -> bool {
        let mut state = self.lock();
        match state.pending.iter().position(|item| item.token == token) {
            Some(pos) => {
                state.pending.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, token: EntryId) -> bool {
        self.lock().pending.iter().any(|item| item.token == token)
    }

    /// Drops every queued item and returns how many there were.
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let n = state.pending.len();
        state.pending.clear();
        n
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Rejects further pushes and wakes every blocked worker so it can exit.
    pub fn abort(&self) {
        let mut state = self.lock();
        state.aborted = true;
        self.available.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn item(id: u64, priority: Priority) -> WorkItem {
        WorkItem::new(
            EntryId(id),
            PathBuf::from(format!("{id}.png")),
            priority,
            None,
            0,
            false,
        )
    }

    fn drain(queue: &WorkQueue) -> Vec<u64> {
        std::iter::from_fn(|| queue.try_pop()).map(|i| i.token.0).collect()
    }

    #[test]
    fn high_priority_goes_to_head() {
        let q = WorkQueue::new();
        q.push(item(1, Priority::Normal)).unwrap();
        q.push(item(2, Priority::Normal)).unwrap();
        q.push(item(3, Priority::High)).unwrap();
        q.push(item(4, Priority::High)).unwrap();
        q.push(item(5, Priority::Normal)).unwrap();
        assert_eq!(drain(&q), vec![4, 3, 1, 2, 5]);
    }

    #[test]
    fn cancel_removes_only_the_matching_token() {
        let q = WorkQueue::new();
        for id in 1..=4 {
            q.push(item(id, Priority::Normal)).unwrap();
        }
        assert!(q.cancel(EntryId(3)));
        assert!(!q.cancel(EntryId(3)));
        assert!(!q.cancel(EntryId(42)));
        assert_eq!(q.pending(), 3);
        assert_eq!(drain(&q), vec![1, 2, 4]);
    }

    #[test]
    fn push_after_abort_is_rejected() {
        let q = WorkQueue::new();
        q.push(item(1, Priority::Normal)).unwrap();
        q.abort();
        assert_eq!(q.push(item(2, Priority::High)), Err(QueueAborted));
        assert!(q.pop().is_none());
        assert_eq!(q.clear(), 1);
    }

    #[test]
    fn rotation_is_normalized() {
        let it = WorkItem::new(
            EntryId(1),
            PathBuf::from("a.png"),
            Priority::Normal,
            Some((800, 600)),
            450,
            false,
        );
        assert_eq!(it.rotation, 90);
        assert_eq!(it.target_size, Some((800, 600)));
    }

    #[test]
    fn abort_wakes_every_blocked_worker() {
        let q = Arc::new(WorkQueue::new());
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let q = Arc::clone(&q);
                thread::spawn(move || q.pop().is_none())
            })
            .collect();
        thread::sleep(Duration::from_millis(50));
        q.abort();
        for h in handles {
            assert!(h.join().unwrap());
        }
    }

    #[test]
    fn blocked_pop_receives_pushed_item() {
        let q = Arc::new(WorkQueue::new());
        let worker = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop().map(|i| i.token))
        };
        thread::sleep(Duration::from_millis(20));
        q.push(item(9, Priority::Normal)).unwrap();
        assert_eq!(worker.join().unwrap(), Some(EntryId(9)));
    }
}
