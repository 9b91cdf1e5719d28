//! Connection supervisor.
//!
//! A state machine (`connecting → connected ⇄ offline`) fed by the
//! adapter's connectivity bit, application-lifecycle signals, and a
//! staleness watchdog. It decides *when* to reconnect and how hard;
//! the engine loop owns all the I/O and executes the decisions:
//!
//! 1. **Soft reconnect**: cycle the transport, settle, re-subscribe.
//!    Debounced so repeated triggers collapse into one attempt.
//! 2. **Stale watchdog**: no data for the stale threshold while
//!    claiming connected forces one soft reconnect past the debounce.
//! 3. **Nuclear reconnect**: destroy and rebuild the client, bounded
//!    wait for connectivity, re-establish everything. Re-entrancy
//!    guarded, with a bounded attempt budget; exhausting it fires the
//!    terminal escalation (full process reload by the host).

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

/// Connection state surfaced to the presentation layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Offline,
}

/// Application-lifecycle signals that hint the transport may have died
/// silently while we were suspended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleSignal {
    /// Tab/window became visible again.
    Visible,
    /// Window regained focus.
    Focused,
    /// Page restored from a suspended/bfcache state.
    Resumed,
    /// OS reports network connectivity regained.
    NetworkOnline,
}

/// Outcome of a completed nuclear reconnect attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NuclearOutcome {
    /// Connectivity restored; attempt counter reset.
    Recovered,
    /// Attempt failed but budget remains.
    Failed,
    /// Attempt budget exhausted. Terminal transition: the host must
    /// perform a full reload. No further nuclear cycles are attempted.
    Escalate,
}

/// The supervisor state machine. Pure decisions; no I/O.
pub struct ConnectionSupervisor {
    config: SyncConfig,
    status: ConnectionStatus,
    status_tx: watch::Sender<ConnectionStatus>,
    /// When data last arrived through the subscription.
    last_data: Instant,
    last_soft_attempt: Option<Instant>,
    last_manual_attempt: Option<Instant>,
    nuclear_attempts: u32,
    nuclear_in_flight: bool,
}

impl ConnectionSupervisor {
    pub fn new(config: SyncConfig) -> (Self, watch::Receiver<ConnectionStatus>) {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        (
            Self {
                config,
                status: ConnectionStatus::Connecting,
                status_tx,
                last_data: Instant::now(),
                last_soft_attempt: None,
                last_manual_attempt: None,
                nuclear_attempts: 0,
                nuclear_in_flight: false,
            },
            status_rx,
        )
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Feeds the adapter's connectivity bit.
    pub fn on_connectivity(&mut self, live: bool) {
        let next = if live {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Offline
        };
        self.transition(next);
    }

    /// Notes that a snapshot arrived; resets the staleness clock.
    pub fn record_data(&mut self) {
        self.last_data = Instant::now();
    }

    /// A lifecycle signal requests a (debounced) soft reconnect.
    /// Returns true when the engine should actually perform one.
    pub fn on_lifecycle(&mut self, signal: LifecycleSignal) -> bool {
        let granted = self.request_soft(false);
        if granted {
            info!("soft reconnect triggered by lifecycle signal {signal:?}");
        }
        granted
    }

    /// Watchdog check: connection claims `connected` but no data has
    /// arrived for the stale threshold. Fires at most once per stale
    /// period; the data clock is reset on fire, so it re-arms only
    /// after another full threshold without data.
    pub fn check_stale(&mut self) -> bool {
        if self.status != ConnectionStatus::Connected {
            return false;
        }
        if self.last_data.elapsed() < self.config.stale_threshold {
            return false;
        }
        warn!(
            "no data for {:?} while connected, forcing soft reconnect",
            self.last_data.elapsed()
        );
        self.last_data = Instant::now();
        self.request_soft(true)
    }

    /// Debounced soft-reconnect gate. `bypass_debounce` is reserved for
    /// the stale watchdog.
    fn request_soft(&mut self, bypass_debounce: bool) -> bool {
        let now = Instant::now();
        if !bypass_debounce {
            if let Some(last) = self.last_soft_attempt {
                if now.duration_since(last) < self.config.soft_debounce {
                    return false;
                }
            }
        }
        self.last_soft_attempt = Some(now);
        true
    }

    /// Rate-limits manual reconnect requests so a user (or an automated
    /// trigger) cannot starve an in-progress attempt.
    pub fn manual_reconnect_allowed(&mut self) -> SyncResult<()> {
        let now = Instant::now();
        if let Some(last) = self.last_manual_attempt {
            if now.duration_since(last) < self.config.manual_reconnect_cooldown {
                return Err(SyncError::ReconnectCooldown);
            }
        }
        self.last_manual_attempt = Some(now);
        Ok(())
    }

    /// Marks a nuclear reconnect as started. A second request while one
    /// is in flight is rejected, not queued.
    pub fn begin_nuclear(&mut self) -> SyncResult<()> {
        if self.nuclear_in_flight {
            return Err(SyncError::ReconnectInFlight);
        }
        self.nuclear_in_flight = true;
        self.transition(ConnectionStatus::Connecting);
        info!(
            "nuclear reconnect starting (attempt {}/{})",
            self.nuclear_attempts + 1,
            self.config.max_nuclear_attempts
        );
        Ok(())
    }

    /// Records the result of a nuclear attempt and decides what's next.
    pub fn finish_nuclear(&mut self, success: bool) -> NuclearOutcome {
        self.nuclear_in_flight = false;
        if success {
            self.nuclear_attempts = 0;
            self.record_data();
            self.transition(ConnectionStatus::Connected);
            info!("nuclear reconnect succeeded");
            return NuclearOutcome::Recovered;
        }

        self.nuclear_attempts += 1;
        self.transition(ConnectionStatus::Offline);
        if self.nuclear_attempts >= self.config.max_nuclear_attempts {
            warn!(
                "nuclear reconnect failed {} times, escalating to full reload",
                self.nuclear_attempts
            );
            return NuclearOutcome::Escalate;
        }
        warn!("nuclear reconnect failed (attempt {})", self.nuclear_attempts);
        NuclearOutcome::Failed
    }

    pub fn nuclear_in_flight(&self) -> bool {
        self.nuclear_in_flight
    }

    fn transition(&mut self, next: ConnectionStatus) {
        if self.status == next {
            return;
        }
        info!("connection {:?} -> {:?}", self.status, next);
        self.status = next;
        // Receivers may all be gone during teardown.
        let _ = self.status_tx.send(next);
    }
}
