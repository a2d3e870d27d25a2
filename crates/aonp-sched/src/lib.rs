//! Worker scheduling loops
//!
//! Two long-lived tasks live here, both owning their handles and both
//! stoppable through a shared shutdown watch (no process-wide state):
//!
//! - [`WorkerLoop`]: claim the oldest ready run, hand it to the
//!   supervisor, repeat; idle polls back off exponentially from one
//!   second up to ten.
//! - [`Reaper`]: periodically re-queue running runs whose lease expired,
//!   so a crashed worker's run is recoverable instead of lost.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;

use aonp_events::EventBus;
use aonp_store::RunStore;
use aonp_supervisor::Supervisor;

/// First idle-poll delay.
pub const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
/// Idle-poll delay cap.
pub const BACKOFF_CAP: Duration = Duration::from_secs(10);
/// Default reaper sweep cadence.
pub const REAPER_INTERVAL: Duration = Duration::from_secs(30);

/// Shared cooperative shutdown signal for the scheduling tasks.
///
/// Send `true` to stop every loop holding the receiver.
#[must_use]
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Bounded exponential backoff: 1s, 2s, 4s, ... capped at 10s.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    /// Backoff with explicit bounds.
    #[must_use]
    pub const fn new(initial: Duration, cap: Duration) -> Self {
        Self { initial, cap, current: initial }
    }

    /// The next delay to sleep; doubles up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    /// Reset after productive work.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BACKOFF_INITIAL, BACKOFF_CAP)
    }
}

/// One worker's claim-and-supervise loop.
pub struct WorkerLoop {
    store: Arc<dyn RunStore>,
    bus: EventBus,
    supervisor: Arc<Supervisor>,
    worker_id: String,
    lease_ttl: Duration,
    shutdown: watch::Receiver<bool>,
    backoff: Backoff,
}

impl WorkerLoop {
    /// Build a worker loop around an existing supervisor.
    #[must_use]
    pub fn new(
        store: Arc<dyn RunStore>,
        bus: EventBus,
        supervisor: Arc<Supervisor>,
        worker_id: impl Into<String>,
        lease_ttl: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            bus,
            supervisor,
            worker_id: worker_id.into(),
            lease_ttl,
            shutdown,
            backoff: Backoff::default(),
        }
    }

    /// Claim and supervise at most one run.
    ///
    /// Returns `true` when a run was claimed (regardless of its outcome),
    /// `false` when the queue was empty.
    pub async fn poll_once(&mut self) -> bool {
        match self.store.claim_next(&self.worker_id, self.lease_ttl).await {
            Ok(Some((run, event))) => {
                self.bus.publish(&event);
                let run_id = run.run_id.clone();
                tracing::info!(
                    worker_id = %self.worker_id,
                    run_id = %run_id,
                    attempt = run.attempt,
                    "claimed run"
                );
                let outcome = self.supervisor.supervise(run, &self.worker_id).await;
                tracing::info!(worker_id = %self.worker_id, run_id = %run_id, ?outcome, "run finished");
                true
            }
            Ok(None) => false,
            Err(e) => {
                // Adapter retries are already exhausted here; treat like an
                // empty poll and let the backoff pace the retry.
                tracing::error!(worker_id = %self.worker_id, error = %e, "claim failed");
                false
            }
        }
    }

    /// Run until shutdown is signalled.
    pub async fn run(mut self) {
        tracing::info!(worker_id = %self.worker_id, "worker loop started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            if self.poll_once().await {
                self.backoff.reset();
                continue;
            }
            let delay = self.backoff.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = self.shutdown.changed() => {
                    // A dropped sender means the owner is gone; stop too.
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!(worker_id = %self.worker_id, "worker loop stopped");
    }
}

/// Background task that recovers expired leases.
pub struct Reaper {
    store: Arc<dyn RunStore>,
    bus: EventBus,
    sweep_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Reaper {
    /// Reaper with the default sweep cadence.
    #[must_use]
    pub fn new(store: Arc<dyn RunStore>, bus: EventBus, shutdown: watch::Receiver<bool>) -> Self {
        Self::with_interval(store, bus, REAPER_INTERVAL, shutdown)
    }

    /// Reaper with an explicit sweep cadence (tests tighten this).
    #[must_use]
    pub fn with_interval(
        store: Arc<dyn RunStore>,
        bus: EventBus,
        sweep_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self { store, bus, sweep_interval, shutdown }
    }

    /// One sweep: re-queue every expired running run.
    ///
    /// Returns how many runs were recovered.
    pub async fn sweep_once(&self) -> usize {
        match self.store.expire_leases().await {
            Ok(expired) => {
                for (run, event) in &expired {
                    tracing::warn!(
                        run_id = %run.run_id,
                        attempt = run.attempt,
                        "lease expired, run re-queued"
                    );
                    self.bus.publish(event);
                }
                expired.len()
            }
            Err(e) => {
                tracing::error!(error = %e, "lease sweep failed");
                0
            }
        }
    }

    /// Run sweeps until shutdown is signalled.
    pub async fn run(mut self) {
        let mut ticker = interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = self.sweep_interval.as_secs(), "reaper started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("reaper stopped");
    }
}
