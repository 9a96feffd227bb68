use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

/// Controls how an enqueue treats an item whose key is already pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueMode {
    /// Refuse the item when another item with the same key is queued.
    EnforceUnique,
    /// Accept the item regardless of pending keys.
    AllowDuplicate,
}

/// Outcome of a batched enqueue performed in a single critical section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub accepted: usize,
    pub skipped: usize,
}

struct Entry<T, K> {
    key: K,
    item: T,
}

struct Inner<T, K> {
    items: VecDeque<Entry<T, K>>,
    counts: HashMap<K, usize>,
    disposed: bool,
}

impl<T, K: Eq + Hash + Clone> Inner<T, K> {
    fn push(&mut self, key: K, item: T) {
        *self.counts.entry(key.clone()).or_insert(0) += 1;
        self.items.push_back(Entry { key, item });
    }

    fn forget_key(&mut self, key: &K) {
        if let Some(count) = self.counts.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                self.counts.remove(key);
            }
        }
    }

    fn pop(&mut self) -> Option<T> {
        let entry = self.items.pop_front()?;
        self.forget_key(&entry.key);
        Some(entry.item)
    }
}

/// A FIFO queue enforcing per-key uniqueness on demand. All operations are
/// serialized by a single mutex; the paired condition variable implements
/// the blocking drain. The key of every item is computed once, by the
/// selector fixed at construction, when the item enters the queue.
///
/// Ordering guarantee: items leave in enqueue order, and mid-queue removals
/// preserve the relative order of the survivors.
pub struct KeyedQueue<T, K, S>
where
    K: Eq + Hash + Clone,
    S: Fn(&T) -> K,
{
    inner: Mutex<Inner<T, K>>,
    ready: Condvar,
    selector: S,
}

impl<T, K, S> KeyedQueue<T, K, S>
where
    K: Eq + Hash + Clone,
    S: Fn(&T) -> K,
{
    pub fn new(selector: S) -> KeyedQueue<T, K, S> {
        KeyedQueue {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                counts: HashMap::new(),
                disposed: false,
            }),
            ready: Condvar::new(),
            selector,
        }
    }

    /// Appends `item` unless the queue is disposed or `mode` refuses its
    /// key. Wakes one blocked drainer on success.
    pub fn try_enqueue(&self, item: T, mode: EnqueueMode) -> bool {
        let mut inner = self.inner.lock();

        if inner.disposed {
            return false;
        }

        let key = (self.selector)(&item);
        if mode == EnqueueMode::EnforceUnique && inner.counts.contains_key(&key) {
            return false;
        }

        inner.push(key, item);
        self.ready.notify_one();
        true
    }

    /// Appends a batch in one critical section so no other producer can
    /// interleave between the blocks of a split request.
    pub fn try_enqueue_range<I>(&self, items: I, mode: EnqueueMode) -> EnqueueOutcome
    where
        I: IntoIterator<Item = T>,
    {
        let mut inner = self.inner.lock();
        let mut outcome = EnqueueOutcome { accepted: 0, skipped: 0 };

        for item in items {
            if inner.disposed {
                outcome.skipped += 1;
                continue;
            }

            let key = (self.selector)(&item);
            if mode == EnqueueMode::EnforceUnique && inner.counts.contains_key(&key) {
                outcome.skipped += 1;
                continue;
            }

            inner.push(key, item);
            outcome.accepted += 1;
        }

        if outcome.accepted > 0 {
            self.ready.notify_all();
        }

        outcome
    }

    /// Removes and returns the head, if any.
    #[inline]
    pub fn try_dequeue(&self) -> Option<T> {
        self.inner.lock().pop()
    }

    /// Blocks until an item is available, the deadline passes, the `cancel`
    /// flag is observed set, or the queue is disposed. The flag is checked
    /// on every wake-up.
    pub fn dequeue_timeout(&self, timeout: Duration, cancel: &AtomicBool) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();

        loop {
            if inner.disposed || cancel.load(Ordering::Relaxed) {
                return None;
            }
            if let Some(item) = inner.pop() {
                return Some(item);
            }
            if self.ready.wait_until(&mut inner, deadline).timed_out() {
                return inner.pop();
            }
        }
    }

    /// Returns a copy of the head without removing it.
    #[inline]
    pub fn try_peek(&self) -> Option<T>
    where
        T: Clone,
    {
        self.inner.lock().items.front().map(|entry| entry.item.clone())
    }

    /// Blocking variant of `try_peek` with the same wake-up conditions as
    /// the blocking drain.
    pub fn peek_timeout(&self, timeout: Duration, cancel: &AtomicBool) -> Option<T>
    where
        T: Clone,
    {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();

        loop {
            if inner.disposed || cancel.load(Ordering::Relaxed) {
                return None;
            }
            if let Some(entry) = inner.items.front() {
                return Some(entry.item.clone());
            }
            if self.ready.wait_until(&mut inner, deadline).timed_out() {
                return inner.items.front().map(|entry| entry.item.clone());
            }
        }
    }

    /// Runs `visit` on the head in place. The closure must stay short; the
    /// queue lock is held for its duration.
    pub fn with_head<R>(&self, visit: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        inner.items.front_mut().map(|entry| visit(&mut entry.item))
    }

    /// Dequeues the head only when `decide` approves it, in one critical
    /// section. Used where a check-then-dequeue race against another thread
    /// would remove the wrong item.
    pub fn dequeue_if(&self, decide: impl FnOnce(&mut T) -> bool) -> Option<T> {
        let mut inner = self.inner.lock();

        let approved = match inner.items.front_mut() {
            Some(entry) => decide(&mut entry.item),
            None => false,
        };
        if approved { inner.pop() } else { None }
    }

    #[inline]
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.lock().counts.contains_key(key)
    }

    /// Number of queued items carrying `key`.
    #[inline]
    pub fn pending_count_by_key(&self, key: &K) -> usize {
        self.inner.lock().counts.get(key).copied().unwrap_or(0)
    }

    /// Removes the first item with `key`, keeping the order of the rest.
    pub fn try_remove_by_key(&self, key: &K) -> Option<T> {
        let mut inner = self.inner.lock();

        let position = inner.items.iter().position(|entry| entry.key == *key)?;
        let entry = inner.items.remove(position)?;
        inner.forget_key(&entry.key);
        Some(entry.item)
    }

    /// Removes every item with `key`; returns how many were dropped.
    pub fn remove_all_by_key(&self, key: &K) -> usize {
        let mut inner = self.inner.lock();

        let before = inner.items.len();
        inner.items.retain(|entry| entry.key != *key);
        let removed = before - inner.items.len();

        if removed > 0 {
            inner.counts.remove(key);
        }
        removed
    }

    /// Copies out the queued items in FIFO order.
    pub fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.inner.lock().items.iter().map(|entry| entry.item.clone()).collect()
    }

    /// Copies out the pending count per key.
    pub fn key_snapshot(&self) -> HashMap<K, usize> {
        self.inner.lock().counts.clone()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Drops all queued items and wakes blocked drainers.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.items.clear();
        inner.counts.clear();
        self.ready.notify_all();
    }

    /// Releases spare capacity held by the underlying storage.
    pub fn trim_excess(&self) {
        let mut inner = self.inner.lock();
        inner.items.shrink_to_fit();
        inner.counts.shrink_to_fit();
    }

    /// Permanently disables the queue and wakes every waiter.
    pub fn dispose(&self) {
        let mut inner = self.inner.lock();
        inner.disposed = true;
        inner.items.clear();
        inner.counts.clear();
        self.ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn queue() -> KeyedQueue<(u8, u16), (u8, u16), fn(&(u8, u16)) -> (u8, u16)> {
        KeyedQueue::new(|item: &(u8, u16)| *item)
    }

    #[test]
    fn test_enforce_unique_refuses_pending_key() {
        let q = queue();

        assert!(q.try_enqueue((3, 0), EnqueueMode::EnforceUnique));
        assert!(!q.try_enqueue((3, 0), EnqueueMode::EnforceUnique));
        assert!(q.try_enqueue((3, 1), EnqueueMode::EnforceUnique));

        assert_eq!(q.len(), 2);
        assert_eq!(q.pending_count_by_key(&(3, 0)), 1);

        // Draining the key frees it for a new enqueue.
        assert_eq!(q.try_dequeue(), Some((3, 0)));
        assert!(q.try_enqueue((3, 0), EnqueueMode::EnforceUnique));
    }

    #[test]
    fn test_allow_duplicate_counts_exactly() {
        let q = queue();

        for _ in 0..4 {
            assert!(q.try_enqueue((6, 9), EnqueueMode::AllowDuplicate));
        }

        assert_eq!(q.pending_count_by_key(&(6, 9)), 4);
        q.try_dequeue();
        assert_eq!(q.pending_count_by_key(&(6, 9)), 3);
        assert_eq!(q.remove_all_by_key(&(6, 9)), 3);
        assert_eq!(q.pending_count_by_key(&(6, 9)), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn test_fifo_order_preserved() {
        let q = queue();
        for address in 0..5 {
            q.try_enqueue((3, address), EnqueueMode::EnforceUnique);
        }

        for address in 0..5 {
            assert_eq!(q.try_dequeue(), Some((3, address)));
        }
    }

    #[test]
    fn test_remove_by_key_keeps_survivor_order() {
        let q = queue();
        for address in 0..5 {
            q.try_enqueue((3, address), EnqueueMode::EnforceUnique);
        }

        assert_eq!(q.try_remove_by_key(&(3, 2)), Some((3, 2)));
        assert_eq!(q.try_remove_by_key(&(3, 2)), None);

        assert_eq!(q.snapshot(), vec![(3, 0), (3, 1), (3, 3), (3, 4)]);
        assert_eq!(q.len(), 4);
    }

    #[test]
    fn test_range_enqueue_reports_outcome() {
        let q = queue();
        q.try_enqueue((3, 1), EnqueueMode::EnforceUnique);

        let outcome = q.try_enqueue_range(
            vec![(3, 0), (3, 1), (3, 2)],
            EnqueueMode::EnforceUnique,
        );

        assert_eq!(outcome, EnqueueOutcome { accepted: 2, skipped: 1 });
        assert_eq!(q.snapshot(), vec![(3, 1), (3, 0), (3, 2)]);
    }

    #[test]
    fn test_key_snapshot_matches_contents() {
        let q = queue();
        q.try_enqueue((3, 0), EnqueueMode::AllowDuplicate);
        q.try_enqueue((3, 0), EnqueueMode::AllowDuplicate);
        q.try_enqueue((4, 0), EnqueueMode::AllowDuplicate);

        let keys = q.key_snapshot();
        assert_eq!(keys.get(&(3, 0)), Some(&2));
        assert_eq!(keys.get(&(4, 0)), Some(&1));
        assert_eq!(keys.values().sum::<usize>(), q.len());
    }

    #[test]
    fn test_blocking_dequeue_woken_by_enqueue() {
        let q = Arc::new(queue());
        let cancel = Arc::new(AtomicBool::new(false));

        let drainer = {
            let q = Arc::clone(&q);
            let cancel = Arc::clone(&cancel);
            thread::spawn(move || q.dequeue_timeout(Duration::from_secs(5), &cancel))
        };

        thread::sleep(Duration::from_millis(50));
        q.try_enqueue((3, 7), EnqueueMode::EnforceUnique);

        assert_eq!(drainer.join().unwrap(), Some((3, 7)));
    }

    #[test]
    fn test_blocking_peek_leaves_item_queued() {
        let q = Arc::new(queue());
        let cancel = Arc::new(AtomicBool::new(false));

        let peeker = {
            let q = Arc::clone(&q);
            let cancel = Arc::clone(&cancel);
            thread::spawn(move || q.peek_timeout(Duration::from_secs(5), &cancel))
        };

        thread::sleep(Duration::from_millis(50));
        q.try_enqueue((3, 7), EnqueueMode::EnforceUnique);

        assert_eq!(peeker.join().unwrap(), Some((3, 7)));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_blocking_dequeue_times_out() {
        let q = queue();
        let cancel = AtomicBool::new(false);

        let start = Instant::now();
        assert_eq!(q.dequeue_timeout(Duration::from_millis(50), &cancel), None);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_dispose_wakes_waiters_and_disables() {
        let q = Arc::new(queue());
        let cancel = Arc::new(AtomicBool::new(false));

        let drainer = {
            let q = Arc::clone(&q);
            let cancel = Arc::clone(&cancel);
            thread::spawn(move || q.dequeue_timeout(Duration::from_secs(5), &cancel))
        };

        thread::sleep(Duration::from_millis(50));
        q.dispose();

        assert_eq!(drainer.join().unwrap(), None);
        assert!(!q.try_enqueue((3, 0), EnqueueMode::AllowDuplicate));
        assert_eq!(q.try_dequeue(), None);
    }

    #[test]
    fn test_dequeue_if_only_removes_approved_head() {
        let q = queue();
        q.try_enqueue((3, 0), EnqueueMode::EnforceUnique);
        q.try_enqueue((3, 1), EnqueueMode::EnforceUnique);

        assert_eq!(q.dequeue_if(|item| item.1 == 9), None);
        assert_eq!(q.len(), 2);
        assert_eq!(q.dequeue_if(|item| item.1 == 0), Some((3, 0)));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_with_head_mutates_in_place() {
        let q = queue();
        q.try_enqueue((3, 0), EnqueueMode::EnforceUnique);

        assert_eq!(q.with_head(|item| { item.1 = 42; item.1 }), Some(42));
        assert_eq!(q.try_peek(), Some((3, 42)));
    }

    #[test]
    fn test_clear_and_trim() {
        let q = queue();
        for address in 0..32 {
            q.try_enqueue((3, address), EnqueueMode::EnforceUnique);
        }

        q.clear();
        assert!(q.is_empty());
        assert!(q.key_snapshot().is_empty());
        q.trim_excess();

        // Still usable after a clear.
        assert!(q.try_enqueue((3, 0), EnqueueMode::EnforceUnique));
    }
}
