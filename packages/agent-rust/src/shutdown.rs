//! Graceful shutdown controller with in-flight message tracking.
//!
//! Consumers pop a message, take an in-flight guard, and only then process
//! it. On shutdown the workers stop popping but finish the message they
//! hold (including any in-flight delivery retries), so `wait_for_drain`
//! bounds how long a slow retry chain can delay process exit. Messages not
//! yet popped stay in the broker for the next run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Agent lifecycle state, transitioned by the shutdown controller.
///
/// State machine: Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// Connecting to the broker and recovering processing lists.
    Starting,
    /// Workers running, messages flowing.
    Ready,
    /// Shutdown signalled; workers are finishing their current message.
    Draining,
    /// All in-flight messages finished.
    Stopped,
}

impl AgentState {
    /// Lowercase name used in health responses and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

/// Coordinates graceful shutdown across the worker set.
///
/// 1. Readiness probes check `state()` to report readiness
/// 2. Workers select on `shutdown_receiver()` alongside their pop loop
/// 3. `trigger_shutdown()` moves to Draining and signals every worker
/// 4. `wait_for_drain()` blocks until held messages are finished
#[derive(Debug)]
pub struct ShutdownController {
    shutdown_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
    state: Arc<ArcSwap<AgentState>>,
}

impl ShutdownController {
    /// Creates a new controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shutdown_signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
            state: Arc::new(ArcSwap::from_pointee(AgentState::Starting)),
        }
    }

    /// Transitions to `Ready` once startup recovery finishes and workers
    /// are spawned.
    pub fn set_ready(&self) {
        self.state.store(Arc::new(AgentState::Ready));
    }

    /// Returns a receiver that flips to `true` when shutdown is triggered.
    ///
    /// Workers select on this alongside the blocking pop so a signal
    /// interrupts the wait instead of racing the pop timeout.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Initiates graceful shutdown.
    ///
    /// Transitions to `Draining` and signals all shutdown receivers. After
    /// this no worker pops another message.
    pub fn trigger_shutdown(&self) {
        self.state.store(Arc::new(AgentState::Draining));
        // Ignore send errors -- receivers may have been dropped
        let _ = self.shutdown_signal.send(true);
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> AgentState {
        **self.state.load()
    }

    /// Creates an RAII guard tracking one in-flight message.
    ///
    /// The counter is incremented on creation and decremented when the
    /// guard drops, even if processing panics.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Returns the number of messages currently being processed.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Waits for held messages to finish, up to the grace deadline.
    ///
    /// Returns `true` if everything drained (state becomes `Stopped`),
    /// `false` if the deadline expired (state remains `Draining`; the
    /// unfinished messages sit in processing lists and are recovered at
    /// next startup).
    pub async fn wait_for_drain(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;

        loop {
            if self.in_flight.load(Ordering::Relaxed) == 0 {
                self.state.store(Arc::new(AgentState::Stopped));
                return true;
            }

            if tokio::time::Instant::now() >= deadline {
                return false;
            }

            // Poll at 10ms intervals to avoid busy-waiting
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
