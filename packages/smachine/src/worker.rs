//! Worker driver: repeatedly runs scan passes and sleeps between them.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::trace;

/// Identifier of a worker, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub u32);

/// Versioned wake-up signal shared by a worker and the queues feeding it.
///
/// Every `signal()` bumps the version and stores a notify permit, so a
/// signal raised while the worker is mid-pass is not lost.
#[derive(Clone, Default)]
pub struct WorkerSignal {
    inner: Arc<SignalInner>,
}

#[derive(Default)]
struct SignalInner {
    version: AtomicU64,
    notify: Notify,
}

impl WorkerSignal {
    /// Create a fresh signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current version.
    pub fn mark(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    /// True when a signal was raised after `mark` was taken.
    pub fn has_changed(&self, mark: u64) -> bool {
        self.mark() != mark
    }

    /// Raise the signal.
    pub fn signal(&self) {
        self.inner.version.fetch_add(1, Ordering::AcqRel);
        self.inner.notify.notify_one();
    }

    /// Wait until the signal is raised.
    pub async fn notified(&self) {
        self.inner.notify.notified().await
    }
}

impl std::fmt::Debug for WorkerSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSignal")
            .field("version", &self.mark())
            .finish()
    }
}

/// The worker passed to each scan pass.
#[derive(Debug, Clone)]
pub struct SlotWorker {
    id: WorkerId,
    signal: WorkerSignal,
}

impl SlotWorker {
    /// Create a worker listening on `signal`.
    pub fn new(id: WorkerId, signal: WorkerSignal) -> Self {
        Self { id, signal }
    }

    /// Worker id.
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// The signal this worker sleeps on.
    pub fn signal(&self) -> &WorkerSignal {
        &self.signal
    }
}

/// Result of one scan pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    /// More slots are ready; the caller should scan again without sleeping.
    pub repeat_now: bool,

    /// Earliest wake-up deadline of a polling or timed slot.
    pub next_poll_time: Option<Instant>,

    /// Number of slots advanced by the pass.
    pub advanced: usize,
}

impl ScanReport {
    /// Merge the reports of several machines scanned in one pass.
    pub fn merge(self, other: ScanReport) -> ScanReport {
        let next_poll_time = match (self.next_poll_time, other.next_poll_time) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        ScanReport {
            repeat_now: self.repeat_now || other.repeat_now,
            next_poll_time,
            advanced: self.advanced + other.advanced,
        }
    }

    /// Report of a pass that found nothing to do.
    pub fn idle() -> ScanReport {
        ScanReport {
            repeat_now: false,
            next_poll_time: None,
            advanced: 0,
        }
    }
}

/// Anything a worker can drive with scan passes.
pub trait Scannable {
    /// Run one scan pass.
    fn scan_once(&mut self, worker: &SlotWorker) -> ScanReport;
}

/// Drive `target` until `shutdown` resolves.
///
/// After each pass the driver either loops immediately (ready work remains),
/// sleeps until the next poll deadline, or sleeps for `idle_period` when no
/// deadline is known. A raised worker signal cuts any sleep short.
pub async fn run_worker<S, F>(
    mut target: S,
    worker: SlotWorker,
    idle_period: Duration,
    shutdown: F,
) -> S
where
    S: Scannable,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        let report = target.scan_once(&worker);
        trace!(
            worker = worker.id().0,
            advanced = report.advanced,
            repeat = report.repeat_now,
            "scan pass"
        );
        if report.repeat_now {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::task::yield_now() => continue,
            }
        }

        let sleep = match report.next_poll_time {
            Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)),
            None => tokio::time::sleep(idle_period),
        };
        tokio::select! {
            _ = &mut shutdown => break,
            _ = worker.signal().notified() => {}
            _ = sleep => {}
        }
    }
    target
}
