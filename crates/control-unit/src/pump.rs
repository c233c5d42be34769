//! Pump controller: confirmed ON/OFF transitions against the remote actuator,
//! duration-bounded auto-shutoff, and per-session water accounting.
//!
//! ```text
//! OFF ──[actuator OFF, command ON ok]──▶ ON ──[timer fires | stop(), command OFF ok]──▶ OFF
//! ```
//!
//! Transitions are serialized by the controller's own lock, which also owns
//! the water ledger and the shutoff timer. The shared controller state is only
//! locked briefly inside a transition, so the bus can keep delivering flow
//! readings while an actuator request is in flight.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::actuator::PumpActuator;
use crate::catalog::{CommandHistory, CommandRecord};
use crate::ledger::WaterLedger;
use crate::mqtt::Bus;
use crate::state::{IrrigationSession, PumpState, SharedState};

/// Result of one closed irrigation session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub duration: Duration,
    pub water_used_liters: f64,
    pub average_flow_l_min: f64,
    /// Ledger total after folding this session in.
    pub total_liters: f64,
}

#[derive(Debug)]
pub enum StartOutcome {
    /// Pump confirmed ON; the receiver resolves when the session closes.
    Started(oneshot::Receiver<SessionSummary>),
    /// Actuator already reported ON (or a session is open); nothing sent.
    AlreadyOn,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    /// Session closed. `commanded` is false when the actuator was already OFF
    /// and the local session was only reconciled.
    Stopped {
        summary: SessionSummary,
        commanded: bool,
    },
    /// No session open; nothing to stop.
    NoSession,
    Failed,
}

struct ShutoffTimer {
    id: u64,
    handle: JoinHandle<()>,
}

struct PumpInner {
    ledger: WaterLedger,
    timer: Option<ShutoffTimer>,
    next_timer_id: u64,
    done: Option<oneshot::Sender<SessionSummary>>,
}

impl PumpInner {
    /// Abort a pending shutoff. Safe to call repeatedly or after it fired.
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
            debug!(timer = timer.id, "shutoff timer cancelled");
        }
    }
}

pub struct PumpController {
    actuator: Arc<dyn PumpActuator>,
    history: Arc<dyn CommandHistory>,
    bus: Bus,
    shared: SharedState,
    device_id: String,
    duration: Duration,
    inner: Mutex<PumpInner>,
}

impl PumpController {
    pub fn new(
        actuator: Arc<dyn PumpActuator>,
        history: Arc<dyn CommandHistory>,
        bus: Bus,
        shared: SharedState,
        ledger: WaterLedger,
        device_id: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            actuator,
            history,
            bus,
            shared,
            device_id: device_id.into(),
            duration,
            inner: Mutex::new(PumpInner {
                ledger,
                timer: None,
                next_timer_id: 0,
                done: None,
            }),
        }
    }

    pub async fn total_liters(&self) -> f64 {
        self.inner.lock().await.ledger.total_liters()
    }

    pub async fn session_active(&self) -> bool {
        self.shared.lock().await.session.is_some()
    }

    // -----------------------------------------------------------------------
    // Turn on
    // -----------------------------------------------------------------------

    /// Switch the pump on and open a session with an auto-shutoff timer.
    pub async fn start(self: &Arc<Self>) -> StartOutcome {
        let mut inner = self.inner.lock().await;

        if self.shared.lock().await.session.is_some() {
            warn!("irrigation session already open, not starting another");
            return StartOutcome::AlreadyOn;
        }

        match self.actuator.state().await {
            Ok(PumpState::On) => {
                info!("water pump is already ON");
                self.shared.lock().await.pump = PumpState::On;
                return StartOutcome::AlreadyOn;
            }
            Ok(PumpState::Off) => {}
            Err(e) => {
                error!("error checking water pump status: {e}");
                return StartOutcome::Failed;
            }
        }

        if let Err(e) = self.actuator.command(PumpState::On).await {
            error!("failed to start the water pump: {e}");
            return StartOutcome::Failed;
        }

        let led_cleared = {
            let mut st = self.shared.lock().await;
            st.pump = PumpState::On;
            st.session = Some(IrrigationSession::new(Instant::now()));
            st.set_led_warning(false)
        };

        let (tx, rx) = oneshot::channel();
        inner.done = Some(tx);
        self.arm_timer(&mut inner);
        drop(inner);

        info!(
            duration_secs = self.duration.as_secs(),
            "irrigation started"
        );
        if led_cleared {
            if let Err(e) = self.bus.publish_led(false).await {
                warn!("failed to publish LED state: {e}");
            }
        }
        self.announce(PumpState::On).await;

        StartOutcome::Started(rx)
    }

    fn arm_timer(self: &Arc<Self>, inner: &mut PumpInner) {
        inner.cancel_timer();
        inner.next_timer_id += 1;
        let id = inner.next_timer_id;
        let delay = self.duration;
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.expire(id).await;
        });
        inner.timer = Some(ShutoffTimer { id, handle });
    }

    /// Timer callback. A timer that was cancelled or replaced is ignored.
    async fn expire(&self, id: u64) {
        let mut inner = self.inner.lock().await;
        if inner.timer.as_ref().map(|t| t.id) != Some(id) {
            debug!(timer = id, "stale shutoff timer ignored");
            return;
        }
        // Fired: forget the handle without aborting ourselves.
        inner.timer = None;
        info!("irrigation duration elapsed, stopping pump");
        self.stop_locked(&mut inner).await;
    }

    // -----------------------------------------------------------------------
    // Turn off
    // -----------------------------------------------------------------------

    /// Manual stop. The shutoff timer is cancelled before anything else.
    pub async fn stop(&self) -> StopOutcome {
        let mut inner = self.inner.lock().await;
        inner.cancel_timer();
        self.stop_locked(&mut inner).await
    }

    async fn stop_locked(&self, inner: &mut PumpInner) -> StopOutcome {
        if self.shared.lock().await.session.is_none() {
            debug!("no irrigation session open");
            return StopOutcome::NoSession;
        }

        match self.actuator.state().await {
            Ok(PumpState::Off) => {
                warn!("water pump already reported OFF, closing session without a command");
                let summary = self.close_session(inner).await;
                return StopOutcome::Stopped {
                    summary,
                    commanded: false,
                };
            }
            Ok(PumpState::On) => {}
            Err(e) => {
                error!("error checking water pump status: {e}");
                return StopOutcome::Failed;
            }
        }

        if let Err(e) = self.actuator.command(PumpState::Off).await {
            error!("failed to stop the water pump, session stays open: {e}");
            return StopOutcome::Failed;
        }

        let summary = self.close_session(inner).await;
        self.announce(PumpState::Off).await;
        StopOutcome::Stopped {
            summary,
            commanded: true,
        }
    }

    async fn close_session(&self, inner: &mut PumpInner) -> SessionSummary {
        let now = Instant::now();
        let session = {
            let mut st = self.shared.lock().await;
            st.pump = PumpState::Off;
            let session = st.session.take();
            if session.is_some() {
                st.daily.irrigated_today = true;
            }
            session
        };
        let (duration, water_used) = session
            .map(|s| (now.saturating_duration_since(s.started_at), s.water_used_liters))
            .unwrap_or_default();

        let minutes = duration.as_secs_f64() / 60.0;
        let average_flow = if minutes > 0.0 {
            water_used / minutes
        } else {
            0.0
        };

        let total_liters = match inner.ledger.record_session(water_used) {
            Ok(total) => total,
            Err(e) => {
                error!(
                    path = %inner.ledger.path().display(),
                    "failed to persist water ledger, total kept in memory only: {e}"
                );
                inner.ledger.total_liters()
            }
        };

        info!(
            duration_secs = format!("{:.2}", duration.as_secs_f64()),
            average_flow_l_min = format!("{average_flow:.4}"),
            liters = format!("{water_used:.4}"),
            total_liters = format!("{total_liters:.4}"),
            "irrigation finished"
        );

        let summary = SessionSummary {
            duration,
            water_used_liters: water_used,
            average_flow_l_min: average_flow,
            total_liters,
        };
        if let Some(tx) = inner.done.take() {
            let _ = tx.send(summary.clone());
        }
        summary
    }

    /// Status echo and command history after a confirmed transition.
    async fn announce(&self, state: PumpState) {
        let on = state == PumpState::On;
        if let Err(e) = self.bus.publish_pump_echo(on).await {
            warn!("failed to publish pump status: {e}");
        }

        let command_type = if on { "turn_on" } else { "turn_off" };
        let record = CommandRecord::completed(&self.device_id, command_type);
        match self.history.record(&record).await {
            Ok(()) => debug!(command_type, "command history updated"),
            Err(e) => warn!(command_type, "failed to update command history: {e}"),
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Cancel the timer and, if a session is open, try once to switch off.
    pub async fn shutdown(&self) {
        if self.session_active().await {
            warn!("shutting down during irrigation, stopping pump");
            if let StopOutcome::Failed = self.stop().await {
                error!("pump may still be running after shutdown");
            }
        }
        self.inner.lock().await.cancel_timer();
        info!(
            total_liters = format!("{:.4}", self.total_liters().await),
            "pump controller stopped"
        );
    }

    #[cfg(test)]
    async fn timer_armed(&self) -> bool {
        self.inner.lock().await.timer.is_some()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
