//! Token bucket rate gate
//!
//! A gate admits at most `occurrences` operations per `time_unit`. The bucket
//! is refilled by a background thread, or by hand with [`RateGate::refill`]
//! for gates created with [`RateGate::manual`].

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

struct Bucket {
    available: u32,
    stopped: bool,
}

struct GateState {
    capacity: u32,
    bucket: Mutex<Bucket>,
    cond: Condvar,
}

impl GateState {
    fn refill(&self) {
        let mut bucket = self.bucket.lock();
        bucket.available = self.capacity;
        self.cond.notify_all();
    }
}

pub struct RateGate {
    state: Arc<GateState>,
    refiller: Option<JoinHandle<()>>,
}

impl RateGate {
    /// Gate refilled to `occurrences` tokens every `time_unit`
    pub fn new(occurrences: u32, time_unit: Duration) -> std::io::Result<Self> {
        let state = Self::state(occurrences);
        let thread_state = Arc::clone(&state);
        let refiller = thread::Builder::new()
            .name("aerostore-rate-gate".to_string())
            .spawn(move || loop {
                thread::park_timeout(time_unit);
                if thread_state.bucket.lock().stopped {
                    return;
                }
                thread_state.refill();
            })?;

        Ok(Self {
            state,
            refiller: Some(refiller),
        })
    }

    /// Gate holding `capacity` tokens, refilled only by [`refill`](Self::refill)
    pub fn manual(capacity: u32) -> Self {
        Self {
            state: Self::state(capacity),
            refiller: None,
        }
    }

    fn state(capacity: u32) -> Arc<GateState> {
        Arc::new(GateState {
            capacity,
            bucket: Mutex::new(Bucket {
                available: capacity,
                stopped: false,
            }),
            cond: Condvar::new(),
        })
    }

    pub fn refill(&self) {
        self.state.refill();
    }

    pub fn capacity(&self) -> u32 {
        self.state.capacity
    }

    pub fn available(&self) -> u32 {
        self.state.bucket.lock().available
    }

    /// Take a token, waiting up to `timeout` for one. A zero timeout never waits.
    pub fn wait_to_proceed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut bucket = self.state.bucket.lock();
        loop {
            if bucket.available > 0 {
                bucket.available -= 1;
                return true;
            }
            if bucket.stopped || timeout.is_zero() {
                return false;
            }
            if self.state.cond.wait_until(&mut bucket, deadline).timed_out() {
                if bucket.available > 0 {
                    bucket.available -= 1;
                    return true;
                }
                return false;
            }
        }
    }
}

impl Drop for RateGate {
    fn drop(&mut self) {
        {
            let mut bucket = self.state.bucket.lock();
            bucket.stopped = true;
            self.state.cond.notify_all();
        }
        if let Some(refiller) = self.refiller.take() {
            refiller.thread().unpark();
            let _ = refiller.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_gate_admits_capacity() {
        let gate = RateGate::manual(3);
        for _ in 0..3 {
            assert!(gate.wait_to_proceed(Duration::ZERO));
        }
        assert!(!gate.wait_to_proceed(Duration::ZERO));

        gate.refill();
        assert_eq!(gate.available(), 3);
    }

    #[test]
    fn test_wait_times_out() {
        let gate = RateGate::manual(0);
        let started = Instant::now();
        assert!(!gate.wait_to_proceed(Duration::from_millis(20)));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_waiter_woken_by_refill() {
        let gate = Arc::new(RateGate::manual(1));
        assert!(gate.wait_to_proceed(Duration::ZERO));

        let refiller = Arc::clone(&gate);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            refiller.refill();
        });
        assert!(gate.wait_to_proceed(Duration::from_secs(5)));
        handle.join().unwrap();
    }

    #[test]
    fn test_timer_refills() {
        let gate = RateGate::new(2, Duration::from_millis(10)).unwrap();
        assert!(gate.wait_to_proceed(Duration::ZERO));
        assert!(gate.wait_to_proceed(Duration::ZERO));
        assert!(gate.wait_to_proceed(Duration::from_secs(5)));
    }
}
