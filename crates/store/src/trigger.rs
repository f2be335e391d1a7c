//! Per-target debounce trigger.
//!
//! `Idle -> Scheduled -> Running -> (Scheduled | Idle)`. Starts of the wrapped function are at
//! least `min_interval` apart, only one run is in flight, fires during `Scheduled` fold into the
//! pending run and any number of fires during `Running` buy exactly one rerun.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use metrics::counter;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, trace};

/// The function a trigger runs. Called once per execution.
pub type TriggerFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Scheduled,
    Running,
}

#[derive(Debug, Clone)]
pub struct TriggerParams {
    /// Used in logs only.
    pub name: String,
    pub min_interval: Duration,
}

/// Cheap to clone; clones share the same state machine.
#[derive(Clone)]
pub struct Trigger {
    inner: Arc<Inner>,
}

struct Inner {
    params: TriggerParams,
    func: TriggerFn,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    state: Mutex<State>,
}

struct State {
    phase: Phase,
    rerun: bool,
    last_start: Option<Instant>,
    runs: u64,
}

impl Trigger {
    /// Runs are spawned on `tracker` so shutdown can wait for the one in flight.
    pub fn new(params: TriggerParams, shutdown: CancellationToken, tracker: TaskTracker, func: TriggerFn) -> Self {
        Self {
            inner: Arc::new(Inner {
                params,
                func,
                shutdown,
                tracker,
                state: Mutex::new(State { phase: Phase::Idle, rerun: false, last_start: None, runs: 0 }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.params.name
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.lock().phase
    }

    /// Number of executions started so far.
    pub fn runs(&self) -> u64 {
        self.inner.state.lock().runs
    }

    /// Request a run. Never blocks; the wait for the interval happens on the trigger's own task.
    pub fn fire(&self) {
        if self.inner.shutdown.is_cancelled() {
            trace!(trigger = %self.name(), "fire after shutdown ignored");
            return;
        }
        let mut st = self.inner.state.lock();
        let phase = st.phase;
        match phase {
            Phase::Idle => {
                st.phase = Phase::Scheduled;
                drop(st);
                let inner = Arc::clone(&self.inner);
                self.inner.tracker.spawn(inner.drive());
            }
            Phase::Scheduled => trace!(trigger = %self.name(), "fire folded into scheduled run"),
            Phase::Running => {
                st.rerun = true;
                trace!(trigger = %self.name(), "rerun requested");
            }
        }
    }

    pub fn same_as(&self, other: &Trigger) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trigger")
            .field("name", &self.inner.params.name)
            .field("min_interval", &self.inner.params.min_interval)
            .field("phase", &self.phase())
            .finish()
    }
}

impl Inner {
    async fn drive(self: Arc<Self>) {
        loop {
            let wait = {
                let st = self.state.lock();
                st.last_start
                    .map(|t| self.params.min_interval.saturating_sub(t.elapsed()))
                    .unwrap_or(Duration::ZERO)
            };
            if !wait.is_zero() {
                trace!(trigger = %self.params.name, wait_ms = wait.as_millis() as u64, "waiting for interval");
                tokio::select! {
                    _ = self.shutdown.cancelled() => {}
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            {
                let mut st = self.state.lock();
                if self.shutdown.is_cancelled() {
                    debug!(trigger = %self.params.name, "shutdown; dropping scheduled run");
                    st.phase = Phase::Idle;
                    st.rerun = false;
                    return;
                }
                st.phase = Phase::Running;
                st.rerun = false;
                st.last_start = Some(Instant::now());
                st.runs += 1;
            }
            counter!("kmerge_trigger_runs_total", 1u64);

            // the call itself may panic before a future exists
            let func = Arc::clone(&self.func);
            if AssertUnwindSafe(async move { func().await }).catch_unwind().await.is_err() {
                error!(trigger = %self.params.name, "trigger function panicked");
            }

            let mut st = self.state.lock();
            if st.rerun && !self.shutdown.is_cancelled() {
                st.phase = Phase::Scheduled;
                st.rerun = false;
                continue;
            }
            st.phase = Phase::Idle;
            st.rerun = false;
            return;
        }
    }
}
