use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::status::DeliveryStatus;
use crate::storage::BookingStore;

/// Presentation state for the tracking card. A view concern layered over
/// the polled status, not a second source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingView {
    Compact,
    Expanded,
}

impl TrackingView {
    pub fn toggled(self) -> Self {
        match self {
            Self::Compact => Self::Expanded,
            Self::Expanded => Self::Compact,
        }
    }
}

/// What the tracking UI renders. On fetch failure the last known status is
/// kept and `last_error` is set, so the loop never crashes the screen.
#[derive(Debug, Clone, Serialize)]
pub struct TrackingSnapshot {
    pub booking_id: Uuid,
    pub status: DeliveryStatus,
    pub view: TrackingView,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub stopped: bool,
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    /// Consecutive fetch failures after which the loop gives up.
    pub failure_threshold: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            failure_threshold: 5,
        }
    }
}

enum PollerCommand {
    RefreshNow,
    ToggleView,
    Stop,
}

/// Handle to a running poll loop. Dropping every handle closes the command
/// channel, which stops the loop, so a dismissed tracking screen cannot
/// leak a repeating timer.
#[derive(Clone)]
pub struct TrackingHandle {
    commands: mpsc::Sender<PollerCommand>,
    snapshot: watch::Receiver<TrackingSnapshot>,
}

impl TrackingHandle {
    pub fn snapshot(&self) -> TrackingSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver for awaiting snapshot changes.
    pub fn watch(&self) -> watch::Receiver<TrackingSnapshot> {
        self.snapshot.clone()
    }

    /// Retry-on-demand after a fetch failure (or just an eager refresh).
    /// Returns `false` when the loop has already stopped and the request
    /// cannot be delivered.
    pub async fn refresh_now(&self) -> bool {
        self.commands.send(PollerCommand::RefreshNow).await.is_ok()
    }

    pub async fn toggle_view(&self) {
        let _ = self.commands.send(PollerCommand::ToggleView).await;
    }

    pub async fn stop(&self) {
        let _ = self.commands.send(PollerCommand::Stop).await;
    }
}

enum Observation {
    Stale,
    Advanced,
    Terminal,
}

enum TickOutcome {
    Continue,
    Stop,
}

struct PollerTask {
    store: Arc<dyn BookingStore>,
    booking_id: Uuid,
    failure_threshold: u32,
    snapshot: watch::Sender<TrackingSnapshot>,
    highest_index: u8,
    on_complete: Option<Box<dyn FnOnce(Uuid) + Send>>,
}

impl PollerTask {
    /// Monotonicity guard: a fetched status with a lower index than the
    /// highest already observed is a stale read and is ignored.
    fn observe(&mut self, status: DeliveryStatus) -> Observation {
        if status.index() < self.highest_index {
            debug!(
                booking_id = %self.booking_id,
                stale = ?status,
                highest = self.highest_index,
                "ignoring stale status read"
            );
            return Observation::Stale;
        }
        self.highest_index = status.index();
        self.snapshot.send_modify(|snap| {
            snap.status = status;
            snap.consecutive_failures = 0;
            snap.last_error = None;
        });
        if status.is_terminal() {
            Observation::Terminal
        } else {
            Observation::Advanced
        }
    }

    async fn poll_once(&mut self) -> TickOutcome {
        let fetched = match self.store.get(self.booking_id).await {
            Ok(Some(booking)) => Ok(booking.status),
            Ok(None) => Err(format!("booking {} not found", self.booking_id)),
            Err(e) => Err(e.to_string()),
        };

        match fetched {
            Ok(status) => match self.observe(status) {
                Observation::Stale | Observation::Advanced => TickOutcome::Continue,
                Observation::Terminal => {
                    if status == DeliveryStatus::Completed {
                        // Exactly once: the callback is consumed here and the
                        // loop stops, so later ticks cannot re-fire it.
                        if let Some(callback) = self.on_complete.take() {
                            info!(booking_id = %self.booking_id, "delivery completed");
                            callback(self.booking_id);
                        }
                    }
                    TickOutcome::Stop
                }
            },
            Err(message) => {
                let failures = {
                    let mut failures = 0;
                    self.snapshot.send_modify(|snap| {
                        snap.consecutive_failures += 1;
                        snap.last_error = Some(message.clone());
                        failures = snap.consecutive_failures;
                    });
                    failures
                };
                warn!(
                    booking_id = %self.booking_id,
                    failures,
                    %message,
                    "status fetch failed, keeping last known status"
                );
                if failures >= self.failure_threshold {
                    warn!(booking_id = %self.booking_id, "failure threshold reached, stopping poll loop");
                    TickOutcome::Stop
                } else {
                    TickOutcome::Continue
                }
            }
        }
    }

    async fn run(mut self, interval: Duration, mut commands: mpsc::Receiver<PollerCommand>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if matches!(self.poll_once().await, TickOutcome::Stop) {
                        break;
                    }
                }
                command = commands.recv() => match command {
                    Some(PollerCommand::RefreshNow) => {
                        if matches!(self.poll_once().await, TickOutcome::Stop) {
                            break;
                        }
                    }
                    Some(PollerCommand::ToggleView) => {
                        self.snapshot.send_modify(|snap| snap.view = snap.view.toggled());
                    }
                    // Channel closed: every handle was dropped, i.e. the
                    // owning screen went away.
                    Some(PollerCommand::Stop) | None => break,
                },
            }
        }

        self.snapshot.send_modify(|snap| snap.stopped = true);
        info!(booking_id = %self.booking_id, "poll loop stopped");
    }
}

/// Periodic fetch-by-id loop over an assembled booking. Must only be
/// started once the booking has an identifier; fires `on_complete` exactly
/// once when `Completed` is first observed.
pub struct DeliveryStatusPoller;

impl DeliveryStatusPoller {
    pub fn spawn<F>(
        store: Arc<dyn BookingStore>,
        booking_id: Uuid,
        initial_status: DeliveryStatus,
        config: PollerConfig,
        on_complete: F,
    ) -> TrackingHandle
    where
        F: FnOnce(Uuid) + Send + 'static,
    {
        let (snapshot_tx, snapshot_rx) = watch::channel(TrackingSnapshot {
            booking_id,
            status: initial_status,
            view: TrackingView::Compact,
            consecutive_failures: 0,
            last_error: None,
            stopped: false,
        });
        let (command_tx, command_rx) = mpsc::channel(8);

        let task = PollerTask {
            store,
            booking_id,
            failure_threshold: config.failure_threshold,
            snapshot: snapshot_tx,
            highest_index: initial_status.index(),
            on_complete: Some(Box::new(on_complete)),
        };
        tokio::spawn(task.run(config.interval, command_rx));

        TrackingHandle {
            commands: command_tx,
            snapshot: snapshot_rx,
        }
    }
}
