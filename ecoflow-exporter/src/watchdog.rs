//! MQTT liveness watchdog
//!
//! The subscription can stall silently (broker keeps the socket, no quota messages arrive).
//! Every `check_interval` the watchdog compares the last-message timestamp against
//! `idle_timeout`; once stale it reconnects through a spawned task limited to
//! `reconnect_budget`. A task that overruns is aborted and a new one spawned, without limit,
//! since DNS, TLS handshakes or a misbehaving broker can hang a connect forever.

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info};

use crate::health::HealthTracker;
use crate::mqtt::ConnectError;
use crate::queue::Shared;

pub const CHECK_INTERVAL: Duration = Duration::from_secs(10);
pub const RECONNECT_BUDGET: Duration = Duration::from_secs(60);

/// Shared between the MQTT event task (writer of the timestamp) and the watchdog.
#[derive(Debug, Default)]
pub struct ConnectionState {
    last_message: Shared<Option<Instant>>,
    reconnecting: AtomicBool,
}

impl ConnectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn touch(&self) {
        *self.last_message.lock() = Some(Instant::now());
    }

    pub fn clear_last_message(&self) {
        *self.last_message.lock() = None;
    }

    pub fn last_message(&self) -> Option<Instant> {
        *self.last_message.lock()
    }

    pub fn idle_for(&self) -> Option<Duration> {
        self.last_message().map(|at| at.elapsed())
    }

    /// `false` while no timestamp is set.
    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.idle_for().is_some_and(|idle| idle > timeout)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::Acquire)
    }

    fn set_reconnecting(&self, value: bool) {
        self.reconnecting.store(value, Ordering::Release);
    }
}

/// Something able to (re)establish the MQTT session from scratch.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'_, Result<(), ConnectError>>;
}

#[derive(Debug, Clone, Copy)]
pub struct WatchdogSettings {
    pub check_interval: Duration,
    pub idle_timeout: Duration,
    pub reconnect_budget: Duration,
}

impl WatchdogSettings {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            check_interval: CHECK_INTERVAL,
            idle_timeout,
            reconnect_budget: RECONNECT_BUDGET,
        }
    }
}

pub struct Watchdog<C: Connector> {
    connector: Arc<C>,
    state: Arc<ConnectionState>,
    health: HealthTracker,
    settings: WatchdogSettings,
}

impl<C: Connector> Watchdog<C> {
    pub fn new(
        connector: Arc<C>,
        state: Arc<ConnectionState>,
        health: HealthTracker,
        settings: WatchdogSettings,
    ) -> Self {
        Self { connector, state, health, settings }
    }

    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.settings.check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick fires immediately
        interval.tick().await;

        loop {
            interval.tick().await;
            self.check().await;
        }
    }

    /// One watchdog pass. Returns the number of reconnect attempts made (0 when healthy).
    pub async fn check(&self) -> u32 {
        if !self.state.is_stale(self.settings.idle_timeout) {
            return 0;
        }

        error!(
            "No messages received for {} seconds. Reconnecting to MQTT",
            self.settings.idle_timeout.as_secs()
        );
        self.recover().await
    }

    async fn recover(&self) -> u32 {
        self.state.set_reconnecting(true);
        let mut attempts = 0;

        loop {
            attempts += 1;
            self.health.increment_reconnects();

            let connector = self.connector.clone();
            let mut task = tokio::spawn(async move { connector.connect().await });

            match tokio::time::timeout(self.settings.reconnect_budget, &mut task).await {
                Ok(Ok(Ok(()))) => {
                    info!("Reconnection successful, continuing");
                    // Unset rather than now: the next message stamps it, the watchdog
                    // must not fire again before that
                    self.state.clear_last_message();
                    self.health.mark_reconnected();
                    break;
                }
                Ok(Ok(Err(e))) => {
                    error!("Reconnection errored out ({}), attempting to reconnect...", e);
                }
                Ok(Err(join_error)) => {
                    error!("Reconnection task failed ({}), attempting to reconnect...", join_error);
                }
                Err(_) => {
                    task.abort();
                    error!(
                        "Reconnection timed out after {} seconds, attempting to reconnect...",
                        self.settings.reconnect_budget.as_secs()
                    );
                }
            }
        }

        self.state.set_reconnecting(false);
        attempts
    }
}
