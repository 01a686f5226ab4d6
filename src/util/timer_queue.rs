use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::trace;

#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
pub enum TimerError {
    #[error("entry is already scheduled")]
    AlreadyScheduled,
    #[error("timer queue is shut down")]
    ShutDown,
}

type Callback = Box<dyn FnOnce() + Send>;

struct TimerEntry<K> {
    key: K,
    fire_at: Instant,
    callback: Callback,
}

struct TimerQueueInner<K> {
    /// sorted ascending by `fire_at`, entries with equal `fire_at` in insertion order
    entries: VecDeque<TimerEntry<K>>,
    is_shut_down: bool,
    /// bumped on every change that may shorten the runner's sleep
    generation: u64,
    /// `generation` as of the runner's last look at the queue
    seen_generation: u64,
}

/// A queue of one-shot callbacks, each identified by a key that can be scheduled at most once at a
///  time. Callbacks are invoked without holding the queue's lock, so they may re-schedule
///  themselves or other entries.
///
/// The queue itself has no thread: some runner calls [TimerQueue::run_due] and
///  [TimerQueue::wait] in a loop until [TimerQueue::is_running] turns false.
pub struct TimerQueue<K> {
    inner: Mutex<TimerQueueInner<K>>,
    condvar: Condvar,
}

impl<K: Eq + Debug> Default for TimerQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Debug> TimerQueue<K> {
    pub fn new() -> TimerQueue<K> {
        TimerQueue {
            inner: Mutex::new(TimerQueueInner {
                entries: VecDeque::new(),
                is_shut_down: false,
                generation: 0,
                seen_generation: 0,
            }),
            condvar: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TimerQueueInner<K>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn schedule(&self, key: K, delay: Duration, callback: impl FnOnce() + Send + 'static) -> Result<(), TimerError> {
        self.schedule_at(key, Instant::now() + delay, callback)
    }

    pub fn schedule_at(&self, key: K, fire_at: Instant, callback: impl FnOnce() + Send + 'static) -> Result<(), TimerError> {
        let mut inner = self.lock();
        if inner.is_shut_down {
            return Err(TimerError::ShutDown);
        }
        if inner.entries.iter().any(|e| e.key == key) {
            return Err(TimerError::AlreadyScheduled);
        }

        trace!("scheduling {:?}", key);

        // after all entries that fire at the same time or earlier
        let idx = inner.entries.partition_point(|e| e.fire_at <= fire_at);
        inner.entries.insert(idx, TimerEntry {
            key,
            fire_at,
            callback: Box::new(callback),
        });
        inner.generation += 1;
        drop(inner);

        self.condvar.notify_all();
        Ok(())
    }

    /// returns `true` if an entry was removed
    pub fn cancel(&self, key: &K) -> bool {
        let mut inner = self.lock();
        match inner.entries.iter().position(|e| &e.key == key) {
            Some(idx) => {
                trace!("cancelling {:?}", key);
                inner.entries.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn is_scheduled(&self, key: &K) -> bool {
        self.lock().entries.iter()
            .any(|e| &e.key == key)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn run_due(&self) -> Option<Duration> {
        self.run_due_at(Instant::now())
    }

    /// Fires all entries with `fire_at <= now` in order and returns the time until the next entry
    ///  is due, or `None` if the queue is empty or shut down.
    pub fn run_due_at(&self, now: Instant) -> Option<Duration> {
        let mut inner = self.lock();
        loop {
            inner.seen_generation = inner.generation;
            if inner.is_shut_down {
                return None;
            }

            match inner.entries.front() {
                Some(entry) if entry.fire_at <= now => {}
                Some(entry) => return Some(entry.fire_at - now),
                None => return None,
            }

            if let Some(entry) = inner.entries.pop_front() {
                drop(inner);
                trace!("firing {:?}", entry.key);
                (entry.callback)();
                inner = self.lock();
            }
        }
    }

    /// Blocks for at most `timeout`, returning early when the queue is shut down or an entry was
    ///  scheduled since the last [TimerQueue::run_due], including before this call.
    pub fn wait(&self, timeout: Duration) {
        let inner = self.lock();
        let (mut inner, _) = self.condvar.wait_timeout_while(inner, timeout, |inner| {
            !inner.is_shut_down && inner.generation == inner.seen_generation
        }).unwrap_or_else(PoisonError::into_inner);
        inner.seen_generation = inner.generation;
    }

    pub fn is_running(&self) -> bool {
        !self.lock().is_shut_down
    }

    /// Stops the queue: pending entries are dropped without firing, further scheduling fails and
    ///  a runner blocked in [TimerQueue::wait] returns immediately.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        inner.is_shut_down = true;
        inner.entries.clear();
        inner.generation += 1;
        drop(inner);

        self.condvar.notify_all();
    }

    /// Makes a shut down queue usable again, e.g. when a session is restarted.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.is_shut_down = false;
        inner.entries.clear();
        inner.generation += 1;
        inner.seen_generation = inner.generation;
    }
}
