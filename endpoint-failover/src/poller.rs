//! Periodic execution of the check cycle.

use std::{
    fmt,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use futures_util::{future::BoxFuture, select, FutureExt};
use stop_token::{StopSource, StopToken};
use tracing::{error, info, trace};

use crate::FailoverError;

const POLLER: &str = "Poller";

/// How the period between two cycles is measured.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Hash)]
pub enum TimingMode {
    /// Wait a full period after each cycle completes.
    #[default]
    FixedDelay,
    /// Start cycles a period apart: the time spent in a cycle is subtracted from the wait.
    FixedRate,
}

impl TimingMode {
    /// Returns how long to wait after a cycle that took `elapsed`.
    pub fn wait_after(self, period: Duration, elapsed: Duration) -> Duration {
        match self {
            TimingMode::FixedDelay => period,
            TimingMode::FixedRate => period.saturating_sub(elapsed),
        }
    }
}

/// A cycle run by the [`Poller`]. Errors are logged, never fatal.
pub type CycleTask = Arc<dyn Fn() -> BoxFuture<'static, Result<(), FailoverError>> + Send + Sync>;

#[derive(Clone, Copy, Debug)]
struct Schedule {
    period: Duration,
    timing_mode: TimingMode,
}

/// Runs a task repeatedly in a background tokio task until stopped.
///
/// The first cycle starts immediately. Stopping is cooperative: a cycle in flight completes,
/// and no new cycle begins. A restarted poller waits for that cycle to finish, so cycles never
/// overlap.
pub struct Poller {
    task: CycleTask,
    schedule: Arc<Mutex<Schedule>>,
    // Held for the duration of every cycle, shared by all loops this poller ever started.
    cycle_lock: Arc<async_lock::Mutex<()>>,
    stop: Mutex<Option<StopSource>>,
}

impl fmt::Debug for Poller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("schedule", &*lock(&self.schedule))
            .field("running", &self.is_running())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn is_stopped(token: &StopToken) -> bool {
    token.clone().now_or_never().is_some()
}

impl Poller {
    /// Creates a new, idle `Poller`.
    pub fn new(task: CycleTask, period: Duration, timing_mode: TimingMode) -> Self {
        Self {
            task,
            schedule: Arc::new(Mutex::new(Schedule {
                period,
                timing_mode,
            })),
            cycle_lock: Arc::new(async_lock::Mutex::new(())),
            stop: Mutex::new(None),
        }
    }

    /// Starts polling. Returns `false` without doing anything if already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut stop = lock(&self.stop);
        if stop.is_some() {
            return false;
        }
        let source = StopSource::new();
        crate::util::spawn(poll_loop(
            Arc::clone(&self.task),
            Arc::clone(&self.schedule),
            Arc::clone(&self.cycle_lock),
            source.token(),
        ));
        *stop = Some(source);
        info!("{POLLER}: started with {:?}", *lock(&self.schedule));
        true
    }

    /// Stops polling. Returns `false` if it wasn't running.
    pub fn stop(&self) -> bool {
        // Dropping the source cancels every token handed out by it.
        let stopped = lock(&self.stop).take().is_some();
        if stopped {
            info!("{POLLER}: stopping");
        }
        stopped
    }

    /// Checks if the poller is running.
    pub fn is_running(&self) -> bool {
        lock(&self.stop).is_some()
    }

    /// Returns the period between cycles.
    pub fn period(&self) -> Duration {
        lock(&self.schedule).period
    }

    /// Changes the period, effective from the next wait.
    pub fn set_period(&self, period: Duration) {
        lock(&self.schedule).period = period;
    }

    /// Returns the timing mode.
    pub fn timing_mode(&self) -> TimingMode {
        lock(&self.schedule).timing_mode
    }

    /// Changes the timing mode, effective from the next wait.
    pub fn set_timing_mode(&self, timing_mode: TimingMode) {
        lock(&self.schedule).timing_mode = timing_mode;
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll_loop(
    task: CycleTask,
    schedule: Arc<Mutex<Schedule>>,
    cycle_lock: Arc<async_lock::Mutex<()>>,
    token: StopToken,
) {
    loop {
        let started = Instant::now();
        {
            let _cycle = cycle_lock.lock().await;
            // Stopped while waiting for a previous loop's cycle.
            if is_stopped(&token) {
                break;
            }
            match AssertUnwindSafe(task()).catch_unwind().await {
                Ok(Ok(())) => trace!("{POLLER}: cycle finished in {:?}", started.elapsed()),
                Ok(Err(err)) => error!("{POLLER}: cycle failed: {err}"),
                Err(_) => error!("{POLLER}: cycle panicked"),
            }
        }
        let Schedule {
            period,
            timing_mode,
        } = *lock(&schedule);
        let wait = timing_mode.wait_after(period, started.elapsed());
        select! {
            _ = crate::util::sleep(wait).fuse() => {}
            _ = token.clone().fuse() => {
                info!("{POLLER}: was gracefully cancelled");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use futures_util::FutureExt;

    use crate::{
        poller::{CycleTask, Poller, TimingMode},
        test_utils::setup_tracing,
        FailoverError,
    };

    #[derive(Default)]
    struct Counters {
        cycles: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    fn counting_task(counters: Arc<Counters>, cycle: Duration) -> CycleTask {
        Arc::new(move || {
            let counters = Arc::clone(&counters);
            async move {
                let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                counters.max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(cycle).await;
                counters.in_flight.fetch_sub(1, Ordering::SeqCst);
                counters.cycles.fetch_add(1, Ordering::SeqCst);
                Ok::<(), FailoverError>(())
            }
            .boxed()
        })
    }

    #[test]
    fn test_wait_after() {
        let period = Duration::from_millis(100);
        assert_eq!(
            TimingMode::FixedDelay.wait_after(period, Duration::from_millis(30)),
            period
        );
        assert_eq!(
            TimingMode::FixedRate.wait_after(period, Duration::from_millis(30)),
            Duration::from_millis(70)
        );
        assert_eq!(
            TimingMode::FixedRate.wait_after(period, Duration::from_millis(300)),
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn test_first_cycle_runs_immediately() {
        setup_tracing();
        let counters = Arc::new(Counters::default());
        let poller = Poller::new(
            counting_task(Arc::clone(&counters), Duration::ZERO),
            Duration::from_secs(60),
            TimingMode::FixedDelay,
        );
        assert!(poller.start());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counters.cycles.load(Ordering::SeqCst), 1);
        assert!(poller.stop());
        assert!(!poller.stop());
    }

    #[tokio::test]
    async fn test_double_start_runs_a_single_loop() {
        setup_tracing();
        let counters = Arc::new(Counters::default());
        let poller = Poller::new(
            counting_task(Arc::clone(&counters), Duration::from_millis(5)),
            Duration::from_secs(60),
            TimingMode::FixedDelay,
        );
        assert!(poller.start());
        assert!(!poller.start());
        assert!(poller.is_running());
        tokio::time::sleep(Duration::from_millis(100)).await;
        // One loop ran its first cycle and is now waiting a minute.
        assert_eq!(counters.cycles.load(Ordering::SeqCst), 1);
        poller.stop();
        assert!(!poller.is_running());
    }

    #[tokio::test]
    async fn test_restart_never_interleaves_cycles() {
        setup_tracing();
        let counters = Arc::new(Counters::default());
        let poller = Poller::new(
            counting_task(Arc::clone(&counters), Duration::from_millis(50)),
            Duration::from_millis(1),
            TimingMode::FixedRate,
        );
        for _ in 0..5 {
            assert!(poller.start());
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(poller.stop());
        }
        assert!(poller.start());
        tokio::time::sleep(Duration::from_millis(300)).await;
        poller.stop();
        assert!(counters.cycles.load(Ordering::SeqCst) >= 2);
        assert_eq!(counters.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_and_panicking_cycles_keep_the_loop_alive() {
        setup_tracing();
        let calls = Arc::new(AtomicUsize::new(0));
        let task_calls = Arc::clone(&calls);
        let task: CycleTask = Arc::new(move || {
            let calls = Arc::clone(&task_calls);
            async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(FailoverError::NotSupported("scripted".to_string())),
                    1 => panic!("scripted panic"),
                    _ => Ok(()),
                }
            }
            .boxed()
        });
        let poller = Poller::new(task, Duration::from_millis(10), TimingMode::FixedDelay);
        poller.start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        poller.stop();
        assert!(calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn test_stop_cancels_the_wait() {
        setup_tracing();
        let counters = Arc::new(Counters::default());
        let poller = Poller::new(
            counting_task(Arc::clone(&counters), Duration::ZERO),
            Duration::from_millis(50),
            TimingMode::FixedDelay,
        );
        poller.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        poller.stop();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(counters.cycles.load(Ordering::SeqCst), 1);
        poller.set_period(Duration::from_secs(1));
        assert_eq!(poller.period(), Duration::from_secs(1));
    }
}
