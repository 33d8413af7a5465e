//! Build scheduling with bounded retry.
//!
//! The CI system refuses to schedule a job that is already queued. When that
//! happens the request is retried with exponential backoff, on a worker pool
//! so the thread delivering XMPP events is never put to sleep.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::cause::TriggerCause;
use crate::subscription::JobName;

/// The CI system's scheduling primitive.
pub trait BuildScheduler: Send + Sync {
    /// Returns false when the build was not accepted.
    fn schedule_build(&self, job: &JobName, quiet_period: Duration, cause: &TriggerCause) -> bool;

    fn is_queued(&self, job: &JobName) -> bool;
}

/// Where the dispatcher hands off builds. Must not block.
pub trait BuildSubmitter: Send + Sync {
    /// Returns false when the request was dropped.
    fn submit(&self, job: &JobName, cause: TriggerCause) -> bool;
}

/// Blocking sleep, replaceable in tests.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Exponential backoff bounded by both a retry count and a total delay.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub multiplier: u32,
    pub max_retries: u32,
    pub max_total: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            multiplier: 2,
            max_retries: 4,
            max_total: Duration::from_secs(16),
        }
    }
}

impl BackoffPolicy {
    /// The delays slept before each retry. Stops before the cumulative delay
    /// would exceed `max_total`.
    #[must_use]
    pub fn delays(&self) -> Vec<Duration> {
        let mut delays = Vec::new();
        let mut total = Duration::ZERO;
        let mut next = self.initial_delay;
        for _ in 0..self.max_retries {
            let Some(cumulative) = total.checked_add(next) else {
                break;
            };
            if cumulative > self.max_total {
                break;
            }
            delays.push(next);
            total = cumulative;
            next = next.saturating_mul(self.multiplier.max(1));
        }
        delays
    }
}

/// Result of [`schedule_with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Scheduled { attempts: u32 },
    /// Refused while the job was not queued; retrying would not help.
    Rejected,
    Cancelled,
    /// Still refused after every retry.
    Exhausted { attempts: u32 },
}

/// Schedules `job` with zero quiet period, retrying while it is queued.
pub fn schedule_with_retry(
    scheduler: &dyn BuildScheduler,
    sleeper: &dyn Sleeper,
    policy: &BackoffPolicy,
    job: &JobName,
    cause: &TriggerCause,
    cancelled: &AtomicBool,
) -> ScheduleOutcome {
    if cancelled.load(Ordering::SeqCst) {
        return ScheduleOutcome::Cancelled;
    }
    let mut attempts = 1;
    if scheduler.schedule_build(job, Duration::ZERO, cause) {
        return ScheduleOutcome::Scheduled { attempts };
    }

    for delay in policy.delays() {
        if !scheduler.is_queued(job) {
            warn!(job = %job, "build rejected");
            return ScheduleOutcome::Rejected;
        }
        debug!(job = %job, delay_ms = delay.as_millis(), "job already queued, retrying");
        sleeper.sleep(delay);
        if cancelled.load(Ordering::SeqCst) {
            debug!(job = %job, "retry cancelled");
            return ScheduleOutcome::Cancelled;
        }
        attempts += 1;
        if scheduler.schedule_build(job, Duration::ZERO, cause) {
            return ScheduleOutcome::Scheduled { attempts };
        }
    }

    if attempts == 1 && !scheduler.is_queued(job) {
        warn!(job = %job, "build rejected");
        return ScheduleOutcome::Rejected;
    }
    warn!(job = %job, attempts, "giving up scheduling build");
    ScheduleOutcome::Exhausted { attempts }
}

#[derive(Debug)]
struct BuildRequest {
    job: JobName,
    cause: TriggerCause,
    cancelled: Arc<AtomicBool>,
}

/// Outcome counters of a [`BuildQueue`].
#[derive(Debug, Default)]
pub struct QueueStats {
    pub scheduled: AtomicU64,
    pub rejected: AtomicU64,
    pub cancelled: AtomicU64,
    pub exhausted: AtomicU64,
}

#[allow(missing_docs)]
#[derive(Debug, Clone)]
pub struct BuildQueueConfig {
    pub workers: usize,
    pub capacity: usize,
    pub backoff: BackoffPolicy,
}

impl Default for BuildQueueConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            capacity: 1024,
            backoff: BackoffPolicy::default(),
        }
    }
}

type CancelTable = HashMap<JobName, Arc<AtomicBool>>;

/// Bounded queue of build requests served by named worker threads.
pub struct BuildQueue {
    tx: Mutex<Option<Sender<BuildRequest>>>,
    cancel_flags: Mutex<CancelTable>,
    dropped_requests: AtomicU64,
    stats: Arc<QueueStats>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for BuildQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildQueue")
            .field("dropped_requests", &self.dropped_requests)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl BuildQueue {
    /// Starts the worker pool.
    pub fn new(cfg: BuildQueueConfig, scheduler: Arc<dyn BuildScheduler>, sleeper: Arc<dyn Sleeper>) -> Self {
        let (tx, rx) = bounded::<BuildRequest>(cfg.capacity.max(1));
        let stats = Arc::new(QueueStats::default());

        let workers = (0..cfg.workers.max(1))
            .map(|idx| {
                let rx = rx.clone();
                let scheduler = Arc::clone(&scheduler);
                let sleeper = Arc::clone(&sleeper);
                let stats = Arc::clone(&stats);
                let backoff = cfg.backoff.clone();
                thread::Builder::new()
                    .name(format!("eloyente-build-{idx}"))
                    .spawn(move || worker_loop(&rx, scheduler.as_ref(), sleeper.as_ref(), &backoff, &stats))
                    .expect("failed to spawn eloyente build worker")
            })
            .collect();

        Self {
            tx: Mutex::new(Some(tx)),
            cancel_flags: Mutex::new(HashMap::new()),
            dropped_requests: AtomicU64::new(0),
            stats,
            workers: Mutex::new(workers),
        }
    }

    fn flag_for(&self, job: &JobName) -> Arc<AtomicBool> {
        Arc::clone(
            lock(&self.cancel_flags)
                .entry(job.clone())
                .or_insert_with(|| Arc::new(AtomicBool::new(false))),
        )
    }

    /// Stops pending and in-flight retries for `job`.
    pub fn cancel(&self, job: &JobName) {
        if let Some(flag) = lock(&self.cancel_flags).remove(job) {
            flag.store(true, Ordering::SeqCst);
            debug!(job = %job, "cancelled pending builds");
        }
    }

    /// Accepts new requests for `job` again. Requests cancelled earlier stay
    /// cancelled.
    pub fn resume(&self, job: &JobName) {
        let mut flags = lock(&self.cancel_flags);
        let stale = flags.get(job).is_some_and(|f| f.load(Ordering::SeqCst));
        if stale {
            flags.remove(job);
        }
    }

    #[must_use]
    pub fn dropped_requests(&self) -> u64 {
        self.dropped_requests.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn stats(&self) -> &QueueStats {
        &self.stats
    }

    /// Cancels outstanding retries, lets workers drain the queue and joins
    /// them. Later submissions are dropped.
    pub fn shutdown(&self) {
        let Some(tx) = lock(&self.tx).take() else {
            return;
        };
        drop(tx);
        for (_, flag) in lock(&self.cancel_flags).drain() {
            flag.store(true, Ordering::SeqCst);
        }
        let workers: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                warn!("build worker panicked");
            }
        }
        info!("build queue stopped");
    }
}

impl BuildSubmitter for BuildQueue {
    fn submit(&self, job: &JobName, cause: TriggerCause) -> bool {
        let request = BuildRequest {
            job: job.clone(),
            cause,
            cancelled: self.flag_for(job),
        };
        let guard = lock(&self.tx);
        let Some(tx) = guard.as_ref() else {
            self.dropped_requests.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        match tx.try_send(request) {
            Ok(()) => true,
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.dropped_requests.fetch_add(1, Ordering::Relaxed);
                warn!(job = %job, "build queue full, dropping request");
                false
            }
        }
    }
}

impl Drop for BuildQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    rx: &Receiver<BuildRequest>,
    scheduler: &dyn BuildScheduler,
    sleeper: &dyn Sleeper,
    backoff: &BackoffPolicy,
    stats: &QueueStats,
) {
    while let Ok(request) = rx.recv() {
        let outcome = schedule_with_retry(
            scheduler,
            sleeper,
            backoff,
            &request.job,
            &request.cause,
            &request.cancelled,
        );
        let counter = match outcome {
            ScheduleOutcome::Scheduled { attempts } => {
                info!(job = %request.job, node = %request.cause.node, attempts, "build scheduled");
                &stats.scheduled
            }
            ScheduleOutcome::Rejected => &stats.rejected,
            ScheduleOutcome::Cancelled => &stats.cancelled,
            ScheduleOutcome::Exhausted { .. } => &stats.exhausted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[derive(Default)]
    struct RecordingSleeper {
        slept: Mutex<Vec<Duration>>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            lock(&self.slept).push(duration);
        }
    }

    /// Refuses the first `refusals` attempts while reporting the job queued.
    struct BusyScheduler {
        refusals: usize,
        queued: bool,
        attempts: AtomicUsize,
    }

    impl BusyScheduler {
        fn new(refusals: usize, queued: bool) -> Self {
            Self {
                refusals,
                queued,
                attempts: AtomicUsize::new(0),
            }
        }
    }

    impl BuildScheduler for BusyScheduler {
        fn schedule_build(&self, _job: &JobName, quiet_period: Duration, _cause: &TriggerCause) -> bool {
            assert_eq!(quiet_period, Duration::ZERO);
            self.attempts.fetch_add(1, Ordering::SeqCst) >= self.refusals
        }

        fn is_queued(&self, _job: &JobName) -> bool {
            self.queued
        }
    }

    fn cause() -> TriggerCause {
        TriggerCause::new("builds", "1")
    }

    #[test]
    fn default_delays_are_bounded() {
        let delays = BackoffPolicy::default().delays();
        let secs: Vec<u64> = delays.iter().map(Duration::as_secs).collect();
        assert_eq!(secs, vec![1, 2, 4, 8]);
        assert!(delays.iter().sum::<Duration>() <= Duration::from_secs(16));
    }

    #[test]
    fn delays_stop_at_total_budget() {
        let policy = BackoffPolicy {
            max_retries: 10,
            max_total: Duration::from_secs(7),
            ..BackoffPolicy::default()
        };
        let secs: Vec<u64> = policy.delays().iter().map(Duration::as_secs).collect();
        assert_eq!(secs, vec![1, 2, 4]);
    }

    #[test]
    fn accepted_on_first_attempt() {
        let scheduler = BusyScheduler::new(0, false);
        let sleeper = RecordingSleeper::default();
        let outcome = schedule_with_retry(
            &scheduler,
            &sleeper,
            &BackoffPolicy::default(),
            &JobName::from("j"),
            &cause(),
            &AtomicBool::new(false),
        );
        assert_eq!(outcome, ScheduleOutcome::Scheduled { attempts: 1 });
        assert!(lock(&sleeper.slept).is_empty());
    }

    #[test]
    fn persistently_queued_job_gives_up_after_bounded_retries() {
        let scheduler = BusyScheduler::new(usize::MAX, true);
        let sleeper = RecordingSleeper::default();
        let outcome = schedule_with_retry(
            &scheduler,
            &sleeper,
            &BackoffPolicy::default(),
            &JobName::from("j"),
            &cause(),
            &AtomicBool::new(false),
        );
        assert_eq!(outcome, ScheduleOutcome::Exhausted { attempts: 5 });
        assert_eq!(scheduler.attempts.load(Ordering::SeqCst), 5);
        assert_eq!(lock(&sleeper.slept).iter().sum::<Duration>(), Duration::from_secs(15));
    }

    #[test]
    fn queued_job_scheduled_after_retry() {
        let scheduler = BusyScheduler::new(2, true);
        let sleeper = RecordingSleeper::default();
        let outcome = schedule_with_retry(
            &scheduler,
            &sleeper,
            &BackoffPolicy::default(),
            &JobName::from("j"),
            &cause(),
            &AtomicBool::new(false),
        );
        assert_eq!(outcome, ScheduleOutcome::Scheduled { attempts: 3 });
        assert_eq!(*lock(&sleeper.slept), vec![Duration::from_secs(1), Duration::from_secs(2)]);
    }

    #[test]
    fn refusal_of_unqueued_job_is_not_retried() {
        let scheduler = BusyScheduler::new(usize::MAX, false);
        let sleeper = RecordingSleeper::default();
        let outcome = schedule_with_retry(
            &scheduler,
            &sleeper,
            &BackoffPolicy::default(),
            &JobName::from("j"),
            &cause(),
            &AtomicBool::new(false),
        );
        assert_eq!(outcome, ScheduleOutcome::Rejected);
        assert_eq!(scheduler.attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_before_start() {
        let scheduler = BusyScheduler::new(0, false);
        let outcome = schedule_with_retry(
            &scheduler,
            &ThreadSleeper,
            &BackoffPolicy::default(),
            &JobName::from("j"),
            &cause(),
            &AtomicBool::new(true),
        );
        assert_eq!(outcome, ScheduleOutcome::Cancelled);
        assert_eq!(scheduler.attempts.load(Ordering::SeqCst), 0);
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn queue_schedules_on_workers() {
        let scheduler = Arc::new(BusyScheduler::new(0, false));
        let queue = BuildQueue::new(
            BuildQueueConfig::default(),
            Arc::clone(&scheduler) as Arc<dyn BuildScheduler>,
            Arc::new(RecordingSleeper::default()),
        );
        for _ in 0..3 {
            assert!(queue.submit(&JobName::from("j"), cause()));
        }
        assert!(wait_until(Duration::from_secs(5), || queue.stats().scheduled.load(Ordering::Relaxed) == 3));
        queue.shutdown();
        assert!(!queue.submit(&JobName::from("j"), cause()));
        assert_eq!(queue.dropped_requests(), 1);
    }

    /// Sleeper that blocks until released.
    struct GateSleeper {
        release: Receiver<()>,
        entered: Sender<()>,
    }

    impl Sleeper for GateSleeper {
        fn sleep(&self, _duration: Duration) {
            let _ = self.entered.send(());
            let _ = self.release.recv();
        }
    }

    #[test]
    fn cancel_stops_retries_between_attempts() {
        let (release_tx, release_rx) = bounded(16);
        let (entered_tx, entered_rx) = bounded(16);
        let scheduler = Arc::new(BusyScheduler::new(usize::MAX, true));
        let queue = BuildQueue::new(
            BuildQueueConfig {
                workers: 1,
                ..BuildQueueConfig::default()
            },
            Arc::clone(&scheduler) as Arc<dyn BuildScheduler>,
            Arc::new(GateSleeper {
                release: release_rx,
                entered: entered_tx,
            }),
        );
        let job = JobName::from("j");
        assert!(queue.submit(&job, cause()));
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        queue.cancel(&job);
        release_tx.send(()).unwrap();

        assert!(wait_until(Duration::from_secs(5), || queue.stats().cancelled.load(Ordering::Relaxed) == 1));
        assert_eq!(scheduler.attempts.load(Ordering::SeqCst), 1);

        queue.resume(&job);
        drop(release_tx);
        queue.shutdown();
    }

    #[test]
    fn full_queue_drops_requests() {
        let (release_tx, release_rx) = bounded::<()>(16);
        let (entered_tx, entered_rx) = bounded(16);
        let queue = BuildQueue::new(
            BuildQueueConfig {
                workers: 1,
                capacity: 1,
                backoff: BackoffPolicy::default(),
            },
            Arc::new(BusyScheduler::new(usize::MAX, true)),
            Arc::new(GateSleeper {
                release: release_rx,
                entered: entered_tx,
            }),
        );
        let job = JobName::from("j");
        assert!(queue.submit(&job, cause()));
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(queue.submit(&job, cause()));
        assert!(!queue.submit(&job, cause()));
        assert_eq!(queue.dropped_requests(), 1);
        drop(release_tx);
        queue.shutdown();
    }
}
