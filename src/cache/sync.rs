use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// One-shot signal. Pulsed exactly once with a value; any number of
/// threads may wait for it before or after the pulse.
pub struct OneShot<T> {
    state: Mutex<Option<T>>,
    cond: Condvar,
}

impl<T: Clone> OneShot<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    pub fn pulse(&self, value: T) {
        let mut state = self.state.lock();
        assert!(state.is_none(), "one-shot signal pulsed twice");
        *state = Some(value);
        self.cond.notify_all();
    }

    pub fn pulse_if_unpulsed(&self, value: T) {
        let mut state = self.state.lock();
        if state.is_none() {
            *state = Some(value);
            self.cond.notify_all();
        }
    }

    pub fn is_pulsed(&self) -> bool {
        self.state.lock().is_some()
    }

    pub fn wait(&self) -> T {
        let mut state = self.state.lock();
        loop {
            if let Some(value) = state.as_ref() {
                return value.clone();
            }
            self.cond.wait(&mut state);
        }
    }
}

/// Counting semaphore with an overshoot exemption: a sole holder may
/// grow past capacity, so one oversized transaction always makes
/// progress instead of deadlocking against its own permit.
pub struct Semaphore {
    capacity: u64,
    current: Mutex<u64>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(capacity: u64) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            current: Mutex::new(0),
            cond: Condvar::new(),
        })
    }

    pub fn acquire(self: &Arc<Self>, count: u64) -> SemaphoreAcq {
        let mut current = self.current.lock();
        while *current > 0 && *current + count > self.capacity {
            self.cond.wait(&mut current);
        }
        *current += count;
        SemaphoreAcq {
            sem: Arc::clone(self),
            count,
        }
    }
}

/// Permits held by one transaction. Resizing never blocks; the holder
/// already made it past admission.
pub struct SemaphoreAcq {
    sem: Arc<Semaphore>,
    count: u64,
}

impl SemaphoreAcq {
    pub fn change_count(&mut self, new_count: u64) {
        let mut current = self.sem.current.lock();
        *current = *current - self.count + new_count;
        if new_count < self.count {
            self.sem.cond.notify_all();
        }
        self.count = new_count;
    }
}

impl Drop for SemaphoreAcq {
    fn drop(&mut self) {
        let mut current = self.sem.current.lock();
        *current -= self.count;
        self.sem.cond.notify_all();
    }
}
