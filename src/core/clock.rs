//! Time source and one-shot timers for retry scheduling.
//!
//! The broker never reads the system clock directly: everything that needs
//! "now" or a delayed callback goes through the [`Clock`] port so tests can
//! drive virtual time deterministically.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Callback invoked when a timer fires. Runs on a scheduling unit that may
/// block, so it must not hold long locks; spawn real work onto the runtime.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Handle to an armed timer. Dropping the handle does **not** cancel the
/// timer; call [`TimerHandle::cancel`], which is idempotent and safe from
/// any context.
#[derive(Debug)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    abort: Option<tokio::task::AbortHandle>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(abort) = &self.abort {
            abort.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch (virtual for test clocks).
    fn now_ms(&self) -> u64;

    /// Arms a one-shot timer. The callback fires once after `delay_ms`
    /// unless the returned handle is cancelled first.
    fn after(&self, delay_ms: u64, callback: TimerCallback) -> TimerHandle;
}

/// Production clock: wall time plus timers backed by spawned tokio sleeps.
///
/// `after` must be called from within a tokio runtime.
#[derive(Debug, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn after(&self, delay_ms: u64, callback: TimerCallback) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if !flag.load(Ordering::SeqCst) {
                callback();
            }
        });
        TimerHandle {
            cancelled,
            abort: Some(task.abort_handle()),
        }
    }
}

struct FakeTimer {
    deadline: u64,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    callback: TimerCallback,
}

// BinaryHeap is a max-heap; invert the ordering so the earliest deadline
// (FIFO within a deadline) pops first.
impl PartialEq for FakeTimer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for FakeTimer {}
impl PartialOrd for FakeTimer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for FakeTimer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

/// Virtual-time clock for tests.
///
/// Timers fire inline from [`FakeClock::advance`], in deadline order and in
/// insertion order among equal deadlines.
pub struct FakeClock {
    now: AtomicU64,
    next_seq: AtomicU64,
    timers: Mutex<BinaryHeap<FakeTimer>>,
}

impl FakeClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
            next_seq: AtomicU64::new(0),
            timers: Mutex::new(BinaryHeap::new()),
        }
    }

    /// Moves virtual time forward and fires every due, uncancelled timer.
    pub fn advance(&self, delta_ms: u64) {
        let target = self.now.load(Ordering::SeqCst) + delta_ms;
        loop {
            let due = {
                let mut timers = self.timers.lock();
                match timers.peek() {
                    Some(t) if t.deadline <= target => timers.pop(),
                    _ => None,
                }
            };
            match due {
                Some(timer) => {
                    // Time observed by the callback is the timer's own deadline.
                    self.now.store(timer.deadline, Ordering::SeqCst);
                    if !timer.cancelled.load(Ordering::SeqCst) {
                        (timer.callback)();
                    }
                }
                None => break,
            }
        }
        self.now.store(target, Ordering::SeqCst);
    }

    pub fn pending_timers(&self) -> usize {
        self.timers
            .lock()
            .iter()
            .filter(|t| !t.cancelled.load(Ordering::SeqCst))
            .count()
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn after(&self, delay_ms: u64, callback: TimerCallback) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let timer = FakeTimer {
            deadline: self.now.load(Ordering::SeqCst) + delay_ms,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            cancelled: Arc::clone(&cancelled),
            callback,
        };
        self.timers.lock().push(timer);
        TimerHandle {
            cancelled,
            abort: None,
        }
    }
}
