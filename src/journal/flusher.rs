//! Background flusher thread
//!
//! The flusher periodically asks a [`FlushJob`] to apply journaled pages to
//! the data file. It wakes on `notify()` (sent after commits) or after the
//! flush interval. A failed pass is logged and retried after a jittered
//! exponential backoff; failures never reach committed transactions.
//!
//! The thread holds only a weak reference to its job, so dropping the owner
//! of the job ends the loop.

use std::fmt::Display;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rand::Rng;

use crate::observability::{Event, Logger};

/// Result of one flush pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Last transaction durable in the data file after this pass
    pub flushed_upto: u64,
    pub pages_written: u64,
    pub journals_retired: usize,
}

/// One flush pass, implemented by the storage environment
pub trait FlushJob: Send + Sync + 'static {
    type Error: Display;

    fn flush(&self) -> Result<FlushOutcome, Self::Error>;
}

/// Timing of the flusher thread
#[derive(Debug, Clone, Copy)]
pub struct FlushSettings {
    pub interval: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for FlushSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            backoff_initial: Duration::from_millis(50),
            backoff_max: Duration::from_secs(5),
        }
    }
}

#[derive(Default)]
struct SignalState {
    pending: bool,
    stop: bool,
}

struct FlushSignal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

/// Handle to the running flusher thread; stops and joins it on drop
pub struct FlusherHandle {
    signal: Arc<FlushSignal>,
    thread: Option<JoinHandle<()>>,
    thread_id: Option<ThreadId>,
}

impl FlusherHandle {
    /// Start the flusher thread for `job`
    pub fn spawn<J: FlushJob>(job: Weak<J>, settings: FlushSettings) -> std::io::Result<Self> {
        let signal = Arc::new(FlushSignal {
            state: Mutex::new(SignalState::default()),
            cond: Condvar::new(),
        });
        let thread_signal = Arc::clone(&signal);
        let thread = thread::Builder::new()
            .name("aerostore-flusher".to_string())
            .spawn(move || run(job, thread_signal, settings))?;
        let thread_id = Some(thread.thread().id());

        Ok(Self {
            signal,
            thread: Some(thread),
            thread_id,
        })
    }

    /// Ask for a flush pass as soon as possible
    pub fn notify(&self) {
        let mut state = self.signal.state.lock();
        state.pending = true;
        self.signal.cond.notify_one();
    }

    /// Stop the thread and wait for the pass in progress to finish
    pub fn stop(&mut self) {
        {
            let mut state = self.signal.state.lock();
            state.stop = true;
            self.signal.cond.notify_one();
        }
        // The job's owner may be dropped on the flusher thread itself.
        if self.thread_id == Some(thread::current().id()) {
            return;
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for FlusherHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run<J: FlushJob>(job: Weak<J>, signal: Arc<FlushSignal>, settings: FlushSettings) {
    let mut backoff = Backoff::new(settings.backoff_initial, settings.backoff_max);
    let mut retry_delay: Option<Duration> = None;

    loop {
        {
            let mut state = signal.state.lock();
            let deadline = Instant::now() + retry_delay.unwrap_or(settings.interval);
            loop {
                if state.stop {
                    return;
                }
                // While backing off, notifications do not shorten the wait.
                if state.pending && retry_delay.is_none() {
                    break;
                }
                if signal.cond.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
            state.pending = false;
        }

        let Some(job) = job.upgrade() else { return };
        match job.flush() {
            Ok(_) => {
                backoff.reset();
                retry_delay = None;
            }
            Err(e) => {
                let delay = backoff.next_delay();
                Logger::warn(
                    Event::FlushFailed.as_str(),
                    &[
                        ("error", &e.to_string()),
                        ("retry_in_ms", &delay.as_millis().to_string()),
                    ],
                );
                retry_delay = Some(delay);
            }
        }
    }
}

/// Jittered exponential backoff
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    /// Delay before the next attempt, between half and all of the current step
    pub fn next_delay(&mut self) -> Duration {
        let step = self.current;
        self.current = (self.current * 2).min(self.max);
        let millis = step.as_millis().max(1) as u64;
        let jittered = rand::thread_rng().gen_range(millis / 2..=millis);
        Duration::from_millis(jittered.max(1))
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
