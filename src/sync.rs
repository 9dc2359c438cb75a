//! Kernel synchronisation primitives.
//!
//! A thin, uniform facade over [`parking_lot`]: mutexes in a normal and a
//! recursive flavour, counting semaphores, bounded blocking queues and the
//! monotonic tick. The rest of the kernel depends only on the semantics
//! exposed here, not on the primitives underneath, so the backing could be
//! swapped for a cooperative scheduler without touching the callers.
//!
//! Mutex acquisition takes a timeout in milliseconds and expiry is a
//! recoverable [`Errno::TimedOut`], not a fatal error. [`KMutex::force_lock`]
//! retries with a short timeout until it succeeds; it is reserved for paths
//! where giving up would leak an invariant (unmount bookkeeping, close).

use std::cell::{RefCell, RefMut};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard, ReentrantMutex, ReentrantMutexGuard};

use crate::errno::{Errno, KResult};

/// Sentinel delay meaning "wait forever".
pub const MAX_DELAY_MS: u32 = u32::MAX;

/// Probe interval used by the force-lock retry loop.
const FORCE_LOCK_PROBE_MS: u64 = 10;

/// A non-recursive kernel mutex with timeout-based acquisition.
#[derive(Debug, Default)]
pub struct KMutex<T> {
    inner: Mutex<T>,
}

impl<T> KMutex<T> {
    /// Create a mutex owning `value`.
    pub const fn new(value: T) -> Self {
        KMutex {
            inner: Mutex::new(value),
        }
    }

    /// Acquire the mutex, waiting at most `timeout_ms` milliseconds.
    pub fn lock(&self, timeout_ms: u32) -> KResult<MutexGuard<'_, T>> {
        if timeout_ms == MAX_DELAY_MS {
            return Ok(self.inner.lock());
        }
        self.inner
            .try_lock_for(Duration::from_millis(u64::from(timeout_ms)))
            .ok_or(Errno::TimedOut)
    }

    /// Acquire the mutex, retrying until it succeeds.
    pub fn force_lock(&self) -> MutexGuard<'_, T> {
        loop {
            if let Some(guard) = self
                .inner
                .try_lock_for(Duration::from_millis(FORCE_LOCK_PROBE_MS))
            {
                return guard;
            }
        }
    }
}

/// A recursive kernel mutex.
///
/// Re-acquisition by the owning task succeeds immediately. The guarded value
/// sits behind a [`RefCell`]; holders take short-lived borrows through
/// [`RecursiveGuard::borrow_mut`] rather than keeping a `&mut` across a
/// reentrant call.
#[derive(Debug, Default)]
pub struct KRecursiveMutex<T> {
    inner: ReentrantMutex<RefCell<T>>,
}

/// Guard returned by [`KRecursiveMutex::lock`].
#[derive(Debug)]
pub struct RecursiveGuard<'a, T> {
    guard: ReentrantMutexGuard<'a, RefCell<T>>,
}

impl<T> KRecursiveMutex<T> {
    /// Create a recursive mutex owning `value`.
    pub const fn new(value: T) -> Self {
        KRecursiveMutex {
            inner: ReentrantMutex::new(RefCell::new(value)),
        }
    }

    /// Acquire the mutex, waiting at most `timeout_ms` milliseconds.
    pub fn lock(&self, timeout_ms: u32) -> KResult<RecursiveGuard<'_, T>> {
        if timeout_ms == MAX_DELAY_MS {
            return Ok(RecursiveGuard {
                guard: self.inner.lock(),
            });
        }
        self.inner
            .try_lock_for(Duration::from_millis(u64::from(timeout_ms)))
            .map(|guard| RecursiveGuard { guard })
            .ok_or(Errno::TimedOut)
    }

    /// Acquire the mutex, retrying until it succeeds.
    pub fn force_lock(&self) -> RecursiveGuard<'_, T> {
        loop {
            if let Some(guard) = self
                .inner
                .try_lock_for(Duration::from_millis(FORCE_LOCK_PROBE_MS))
            {
                return RecursiveGuard { guard };
            }
        }
    }
}

impl<T> RecursiveGuard<'_, T> {
    /// Borrow the guarded value mutably.
    ///
    /// The borrow must be released before calling back into code that takes
    /// the same lock and borrows again.
    pub fn borrow_mut(&self) -> RefMut<'_, T> {
        self.guard.borrow_mut()
    }
}

/// A counting semaphore.
#[derive(Debug)]
pub struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    /// Create a semaphore with `initial` permits.
    pub fn new(initial: u32) -> Self {
        Semaphore {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Take one permit, waiting at most `timeout_ms` milliseconds.
    pub fn wait(&self, timeout_ms: u32) -> KResult<()> {
        let mut count = self.count.lock();
        let deadline = deadline_after(timeout_ms);
        while *count == 0 {
            wait_until(&self.cond, &mut count, deadline)?;
        }
        *count -= 1;
        Ok(())
    }

    /// Release one permit.
    pub fn signal(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
    }
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    capacity: usize,
    poisoned: bool,
}

/// A bounded blocking queue.
///
/// `send` blocks while the queue is full and `receive` while it is empty,
/// each up to a max-delay where [`MAX_DELAY_MS`] means wait forever. A
/// poisoned queue rejects senders immediately and lets receivers drain the
/// remaining items before failing, which is exactly the shutdown shape pipes
/// need.
#[derive(Debug)]
pub struct Queue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> Queue<T> {
    /// Create a queue holding at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        Queue {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                capacity,
                poisoned: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Enqueue `item`, waiting at most `timeout_ms` for space.
    pub fn send(&self, item: T, timeout_ms: u32) -> KResult<()> {
        let mut state = self.state.lock();
        let deadline = deadline_after(timeout_ms);
        loop {
            if state.poisoned {
                return Err(Errno::Pipe);
            }
            if state.items.len() < state.capacity {
                state.items.push_back(item);
                self.not_empty.notify_one();
                return Ok(());
            }
            wait_until(&self.not_full, &mut state, deadline)?;
        }
    }

    /// Dequeue one item, waiting at most `timeout_ms` for one to arrive.
    ///
    /// Draining a poisoned queue still yields the items already enqueued;
    /// only an empty poisoned queue fails with [`Errno::Pipe`].
    pub fn receive(&self, timeout_ms: u32) -> KResult<T> {
        let mut state = self.state.lock();
        let deadline = deadline_after(timeout_ms);
        loop {
            if let Some(item) = state.items.pop_front() {
                self.not_full.notify_one();
                return Ok(item);
            }
            if state.poisoned {
                return Err(Errno::Pipe);
            }
            wait_until(&self.not_empty, &mut state, deadline)?;
        }
    }

    /// Enqueue without blocking; [`Errno::Again`] if full.
    pub fn try_send(&self, item: T) -> KResult<()> {
        let mut state = self.state.lock();
        if state.poisoned {
            return Err(Errno::Pipe);
        }
        if state.items.len() >= state.capacity {
            return Err(Errno::Again);
        }
        state.items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Dequeue without blocking; [`Errno::Again`] if empty.
    pub fn try_receive(&self) -> KResult<T> {
        let mut state = self.state.lock();
        match state.items.pop_front() {
            Some(item) => {
                self.not_full.notify_one();
                Ok(item)
            }
            None if state.poisoned => Err(Errno::Pipe),
            None => Err(Errno::Again),
        }
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether the queue holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Poison the queue: fail senders, wake every waiter.
    pub fn poison(&self) {
        let mut state = self.state.lock();
        state.poisoned = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Whether the queue has been poisoned.
    pub fn is_poisoned(&self) -> bool {
        self.state.lock().poisoned
    }
}

fn deadline_after(timeout_ms: u32) -> Option<Instant> {
    if timeout_ms == MAX_DELAY_MS {
        None
    } else {
        Some(Instant::now() + Duration::from_millis(u64::from(timeout_ms)))
    }
}

fn wait_until<T>(
    cond: &Condvar,
    guard: &mut MutexGuard<'_, T>,
    deadline: Option<Instant>,
) -> KResult<()> {
    match deadline {
        None => {
            cond.wait(guard);
            Ok(())
        }
        Some(deadline) => {
            if cond.wait_until(guard, deadline).timed_out() {
                Err(Errno::TimedOut)
            } else {
                Ok(())
            }
        }
    }
}

/// Monotonic millisecond clock anchored at kernel boot.
#[derive(Debug, Clone, Copy)]
pub struct KClock {
    origin: Instant,
}

impl KClock {
    /// Start the clock at the current instant.
    pub fn start() -> Self {
        KClock {
            origin: Instant::now(),
        }
    }

    /// Milliseconds elapsed since boot.
    pub fn ticks_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    /// Whole seconds elapsed since boot; backends use this for timestamps.
    pub fn seconds(&self) -> u64 {
        self.origin.elapsed().as_secs()
    }
}

/// Block the calling task for `ms` milliseconds.
pub fn sleep_ms(ms: u32) {
    std::thread::sleep(Duration::from_millis(u64::from(ms)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn mutex_lock_times_out() {
        let m = Arc::new(KMutex::new(0u32));
        let guard = m.lock(MAX_DELAY_MS).unwrap();
        let m2 = m.clone();
        let handle = thread::spawn(move || m2.lock(20).err());
        assert_eq!(handle.join().unwrap(), Some(Errno::TimedOut));
        drop(guard);
        assert!(m.lock(20).is_ok());
    }

    #[test]
    fn recursive_mutex_reenters() {
        let m = KRecursiveMutex::new(1u32);
        let outer = m.lock(MAX_DELAY_MS).unwrap();
        let inner = m.lock(10).unwrap();
        *inner.borrow_mut() += 1;
        drop(inner);
        assert_eq!(*outer.borrow_mut(), 2);
    }

    #[test]
    fn queue_blocks_and_drains() {
        let q = Arc::new(Queue::new(2));
        q.send(1u8, MAX_DELAY_MS).unwrap();
        q.send(2u8, MAX_DELAY_MS).unwrap();
        assert_eq!(q.send(3u8, 10).unwrap_err(), Errno::TimedOut);

        let q2 = q.clone();
        let handle = thread::spawn(move || q2.receive(MAX_DELAY_MS).unwrap());
        assert_eq!(handle.join().unwrap(), 1);

        q.poison();
        assert_eq!(q.receive(MAX_DELAY_MS).unwrap(), 2);
        assert_eq!(q.receive(MAX_DELAY_MS).unwrap_err(), Errno::Pipe);
        assert_eq!(q.send(4u8, MAX_DELAY_MS).unwrap_err(), Errno::Pipe);
    }

    #[test]
    fn semaphore_counts() {
        let sem = Semaphore::new(1);
        sem.wait(MAX_DELAY_MS).unwrap();
        assert_eq!(sem.wait(10).unwrap_err(), Errno::TimedOut);
        sem.signal();
        sem.wait(10).unwrap();
    }
}
