//! Control loop: collect one round of readings, decide, maybe irrigate, sleep.
//!
//! The loop never drives the pump directly; it asks the [`PumpController`]
//! and waits (bounded) for the session to resolve.
//!
//! ## Cycle state machine
//!
//! ```text
//! Idle ──▶ Collecting ──[round complete]──▶ Deciding ──[irrigate]──▶ Irrigating
//!  ▲           │                               │                        │
//!  │           └──[deadline, data missing]─────┤                        │
//!  │                                           └──[hold]────────────────┤
//!  └────────────────────[sleep interval]────────────────────────────────┘
//! ```

use std::sync::Arc;

use time::{Date, OffsetDateTime};
use tracing::{info, warn};

use crate::config::Config;
use crate::mqtt::Bus;
use crate::policy::{self, BlockReason, Decision};
use crate::pump::{PumpController, SessionSummary, StartOutcome, StopOutcome};
use crate::state::SharedState;

/// How one cycle ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Round deadline hit or required data missing; no decision made.
    Incomplete(Vec<String>),
    Held(Vec<BlockReason>),
    Irrigated(SessionSummary),
    /// Policy said water, but the pump could not be switched on.
    PumpUnavailable,
    /// Session did not close in time and a manual stop failed too.
    IrrigationUnresolved,
}

pub struct ControlLoop {
    cfg: Config,
    shared: SharedState,
    pump: Arc<PumpController>,
    bus: Bus,
}

impl ControlLoop {
    pub fn new(cfg: Config, shared: SharedState, pump: Arc<PumpController>, bus: Bus) -> Self {
        Self {
            cfg,
            shared,
            pump,
            bus,
        }
    }

    /// Run cycles forever. Intended to be raced against a shutdown signal.
    pub async fn run(&self) {
        info!(
            probes = self.cfg.round.soil_probes,
            round_timeout_sec = self.cfg.round.timeout_secs,
            interval_sec = self.cfg.round.interval_secs,
            "control loop started"
        );
        loop {
            match self.run_cycle(self.today()).await {
                CycleOutcome::Irrigated(s) => info!(
                    duration_secs = s.duration.as_secs(),
                    liters = format!("{:.4}", s.water_used_liters),
                    average_flow_l_min = format!("{:.4}", s.average_flow_l_min),
                    total_liters = format!("{:.4}", s.total_liters),
                    "cycle ended with irrigation"
                ),
                CycleOutcome::Held(reasons) => {
                    info!(reasons = %policy::describe(&reasons), "cycle ended without irrigation")
                }
                CycleOutcome::Incomplete(missing) => {
                    warn!(missing = %missing.join(", "), "cycle ended without a decision")
                }
                other => warn!(outcome = ?other, "cycle ended with pump trouble"),
            }
            tokio::time::sleep(self.cfg.round.interval()).await;
        }
    }

    fn today(&self) -> Date {
        OffsetDateTime::now_utc()
            .to_offset(self.cfg.round.utc_offset())
            .date()
    }

    /// One full cycle for calendar day `today`.
    pub async fn run_cycle(&self, today: Date) -> CycleOutcome {
        // An earlier OFF may have failed; get back to a clean pump first.
        // Must run before the rollover: yesterday's session counts for yesterday.
        if self.pump.session_active().await {
            warn!("irrigation session still open from an earlier cycle, stopping pump");
            match self.pump.stop().await {
                StopOutcome::Failed => warn!("pump still unreachable, continuing with collection"),
                StopOutcome::Stopped { commanded: false, .. } => {
                    info!("pump was already off, session reconciled")
                }
                StopOutcome::Stopped { .. } | StopOutcome::NoSession => {}
            }
        }

        if self.shared.lock().await.roll_day(today) {
            info!(%today, "daily reset complete, ready for a new day of irrigation");
        }

        let outcome = self.collect_and_decide().await;
        self.log_cycle_end().await;
        outcome
    }

    async fn collect_and_decide(&self) -> CycleOutcome {
        let done = self
            .shared
            .lock()
            .await
            .open_round(self.cfg.round.soil_probes);
        info!("new round of data collection started");

        // Completeness is read from the round itself: the last reading may
        // land between the deadline and taking the round.
        let _ = tokio::time::timeout(self.cfg.round.timeout(), done).await;

        let (inputs, humidity, water_flow) = {
            let mut st = self.shared.lock().await;
            let Some(round) = st.take_round() else {
                return CycleOutcome::Incomplete(Vec::new());
            };
            if !round.is_complete() {
                let missing = round.missing();
                warn!(
                    missing = %missing.join(", "),
                    received = round.received(),
                    expected = round.expected(),
                    "round deadline reached, not all sensor data received"
                );
                return CycleOutcome::Incomplete(missing);
            }
            let inputs = policy::inputs_from_round(
                &round,
                st.sunrise.counter(),
                st.sunrise.buffer(),
                st.daily.irrigated_today,
            );
            (inputs, round.humidity(), round.water_flow())
        };

        let inputs = match inputs {
            Ok(i) => i,
            Err(missing) => {
                warn!(missing = %missing.join(", "), "not all necessary sensor data received");
                return CycleOutcome::Incomplete(missing);
            }
        };

        info!(
            average_moisture = format!("{:.2}", inputs.average_moisture),
            threshold = self.cfg.policy.moisture_threshold,
            temperature = inputs.temperature,
            humidity = ?humidity,
            rain = inputs.rain,
            water_flow = ?water_flow,
            "round evaluated"
        );

        match policy::evaluate(&inputs, &self.cfg.policy) {
            Decision::Irrigate => self.irrigate().await,
            Decision::Hold(reasons) => {
                let warning = !reasons.is_empty();
                if warning {
                    info!(reasons = %policy::describe(&reasons), "no irrigation");
                }
                self.set_led(warning).await;
                CycleOutcome::Held(reasons)
            }
        }
    }

    async fn irrigate(&self) -> CycleOutcome {
        let mut done = match self.pump.start().await {
            StartOutcome::Started(done) => done,
            StartOutcome::AlreadyOn | StartOutcome::Failed => {
                return CycleOutcome::PumpUnavailable;
            }
        };

        let deadline = self.cfg.pump.completion_deadline();
        match tokio::time::timeout(deadline, &mut done).await {
            Ok(Ok(summary)) => CycleOutcome::Irrigated(summary),
            _ => {
                warn!(
                    deadline_sec = deadline.as_secs(),
                    "irrigation did not finish in time, stopping pump"
                );
                match self.pump.stop().await {
                    StopOutcome::Stopped { summary, .. } => CycleOutcome::Irrigated(summary),
                    StopOutcome::NoSession | StopOutcome::Failed => {
                        CycleOutcome::IrrigationUnresolved
                    }
                }
            }
        }
    }

    async fn set_led(&self, on: bool) {
        let changed = self.shared.lock().await.set_led_warning(on);
        if !changed {
            return;
        }
        match self.bus.publish_led(on).await {
            Ok(()) => info!(on, "LED warning updated"),
            Err(e) => warn!("failed to publish LED state: {e}"),
        }
    }

    async fn log_cycle_end(&self) {
        let st = self.shared.lock().await;
        info!(
            sunrise_counter = format!("{:.2}", st.sunrise.counter()),
            pre_sunrise_window = st.sunrise.is_pre_sunrise_window(),
            irrigated_today = st.daily.irrigated_today,
            light_level = ?st.light_level,
            pump = %st.pump,
            "cycle finished"
        );
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pump::tests::{history, rig, Rig, Service};
    use crate::round::{Reading, SensorKind};
    use crate::state::{ControlState, PumpState};
    use std::time::Duration;
    use time::macros::date;
    use tokio::time::Instant;

    const TODAY: Date = date!(2026 - 10 - 19);

    fn control(rig: &Rig) -> ControlLoop {
        ControlLoop::new(
            Config::default(),
            rig.shared.clone(),
            rig.pump.clone(),
            rig.bus.clone(),
        )
    }

    async fn wait_for_round(shared: &SharedState) {
        loop {
            if shared.lock().await.is_collecting() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn record_all(st: &mut ControlState, moisture: f64, temperature: f64, light: f64) {
        for i in 0..9 {
            st.record(Reading::soil(format!("p{i}"), moisture));
        }
        st.record(Reading::new(SensorKind::Temperature, temperature));
        st.record(Reading::new(SensorKind::Humidity, 50.0));
        st.record(Reading::new(SensorKind::Light, light));
        st.record(Reading::new(SensorKind::Rain, 1.0));
        st.record(Reading::new(SensorKind::WaterFlow, 0.0));
    }

    /// Wait for the round to open, then deliver a full set of readings.
    async fn feed(shared: &SharedState, moisture: f64, temperature: f64, light: f64) {
        wait_for_round(shared).await;
        record_all(&mut *shared.lock().await, moisture, temperature, light);
    }

    /// Put the sunrise counter at 30 minutes for `TODAY`.
    async fn mid_window(shared: &SharedState) {
        let mut st = shared.lock().await;
        st.roll_day(TODAY);
        let t0 = Instant::now();
        st.sunrise.update(500.0, t0);
        st.sunrise.update(500.0, t0 + Duration::from_secs(30 * 60));
    }

    // -- Hold -------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn wet_soil_holds_and_raises_led() {
        let svc = Service::new(PumpState::Off);
        let rig = rig("ctl-hold", svc.actuator(0, 0), history(0, 0), Duration::from_secs(30));
        let ctl = control(&rig);

        let (outcome, _) = tokio::join!(ctl.run_cycle(TODAY), feed(&rig.shared, 80.0, 20.0, 10.0));

        assert_eq!(
            outcome,
            CycleOutcome::Held(vec![
                BlockReason::OutsideWindow,
                BlockReason::MoistureSufficient
            ])
        );
        assert!(rig.shared.lock().await.led_warning);
    }

    // -- Incomplete -------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn silent_sensors_release_loop_at_deadline() {
        let svc = Service::new(PumpState::Off);
        let rig = rig("ctl-timeout", svc.actuator(0, 0), history(0, 0), Duration::from_secs(30));
        let ctl = control(&rig);

        let started = Instant::now();
        let outcome = ctl.run_cycle(TODAY).await;

        let CycleOutcome::Incomplete(missing) = outcome else {
            panic!("expected Incomplete, got {outcome:?}");
        };
        assert!(started.elapsed() >= Duration::from_secs(600));
        assert_eq!(missing[0], "soil_moisture (0/9)");
        assert!(!rig.shared.lock().await.is_collecting());
        assert!(!rig.shared.lock().await.led_warning);
    }

    #[tokio::test(start_paused = true)]
    async fn last_reading_at_deadline_still_counts() {
        let svc = Service::new(PumpState::Off);
        let rig = rig("ctl-deadline", svc.actuator(0, 0), history(0, 0), Duration::from_secs(30));
        let ctl = control(&rig);

        // Hold the state lock across the deadline, then complete the round
        // before the loop gets to take it.
        let late_feed = async {
            wait_for_round(&rig.shared).await;
            tokio::time::sleep(Duration::from_secs(599)).await;
            let mut st = rig.shared.lock().await;
            tokio::time::sleep(Duration::from_secs(2)).await;
            record_all(&mut st, 80.0, 20.0, 10.0);
        };
        let (outcome, _) = tokio::join!(ctl.run_cycle(TODAY), late_feed);

        assert_eq!(
            outcome,
            CycleOutcome::Held(vec![
                BlockReason::OutsideWindow,
                BlockReason::MoistureSufficient
            ])
        );
    }

    // -- Irrigate ---------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn dry_soil_in_window_irrigates_once_per_day() {
        let svc = Service::new(PumpState::Off);
        let rig = rig("ctl-irrigate", svc.actuator(1, 1), history(1, 1), Duration::from_secs(30));
        let ctl = control(&rig);
        mid_window(&rig.shared).await;

        let (outcome, _) = tokio::join!(ctl.run_cycle(TODAY), feed(&rig.shared, 25.0, 20.0, 500.0));
        assert!(matches!(outcome, CycleOutcome::Irrigated(_)), "{outcome:?}");
        assert!(rig.shared.lock().await.daily.irrigated_today);
        assert_eq!(rig.shared.lock().await.pump, PumpState::Off);

        // Same day, same conditions: blocked, and no second ON goes out.
        tokio::time::sleep(Config::default().round.interval()).await;
        let (outcome, _) = tokio::join!(ctl.run_cycle(TODAY), feed(&rig.shared, 25.0, 20.0, 500.0));
        let CycleOutcome::Held(reasons) = outcome else {
            panic!("expected Held, got {outcome:?}");
        };
        assert!(reasons.contains(&BlockReason::IrrigatedToday));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_pump_does_not_stall_cycle() {
        let svc = Service::new(PumpState::Off);
        svc.set_down(true);
        let rig = rig("ctl-unreachable", svc.actuator(0, 0), history(0, 0), Duration::from_secs(30));
        let ctl = control(&rig);
        mid_window(&rig.shared).await;

        let (outcome, _) = tokio::join!(ctl.run_cycle(TODAY), feed(&rig.shared, 25.0, 20.0, 500.0));
        assert_eq!(outcome, CycleOutcome::PumpUnavailable);
        assert!(!rig.shared.lock().await.daily.irrigated_today);
    }

    // -- Daily rollover ---------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn rollover_resets_day_but_keeps_ledger() {
        let svc = Service::new(PumpState::Off);
        let rig = rig("ctl-rollover", svc.actuator(1, 1), history(1, 1), Duration::from_secs(60));
        let ctl = control(&rig);
        mid_window(&rig.shared).await;

        // A finished session worth 1 liter today.
        let _ = rig.pump.start().await;
        tokio::time::advance(Duration::from_secs(15)).await;
        rig.shared.lock().await.record_flow(4.0, Instant::now());
        let _ = rig.pump.stop().await;
        assert!(rig.shared.lock().await.daily.irrigated_today);
        assert!((rig.pump.total_liters().await - 1.0).abs() < 1e-9);

        let tomorrow = TODAY.next_day().unwrap();
        let (outcome, _) = tokio::join!(ctl.run_cycle(tomorrow), feed(&rig.shared, 80.0, 20.0, 10.0));
        assert!(matches!(outcome, CycleOutcome::Held(_)));

        let st = rig.shared.lock().await;
        assert!(!st.daily.irrigated_today);
        assert_eq!(st.daily.date, Some(tomorrow));
        assert_eq!(st.sunrise.counter(), 0.0);
        assert!(!st.sunrise.is_pre_sunrise_window());
        drop(st);
        assert!((rig.pump.total_liters().await - 1.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn yesterdays_session_does_not_mark_new_day() {
        let svc = Service::new(PumpState::Off);
        let rig = rig("ctl-overnight", svc.actuator(1, 1), history(1, 1), Duration::from_secs(30));
        let ctl = control(&rig);
        mid_window(&rig.shared).await;

        // OFF fails today; the session is still open when tomorrow starts.
        let _ = rig.pump.start().await;
        svc.set_down(true);
        assert_eq!(rig.pump.stop().await, StopOutcome::Failed);
        svc.set_down(false);

        let tomorrow = TODAY.next_day().unwrap();
        let (outcome, _) = tokio::join!(ctl.run_cycle(tomorrow), feed(&rig.shared, 25.0, 20.0, 500.0));

        assert_eq!(outcome, CycleOutcome::Held(vec![BlockReason::OutsideWindow]));
        let st = rig.shared.lock().await;
        assert!(st.session.is_none());
        assert!(!st.daily.irrigated_today);
        assert_eq!(st.daily.date, Some(tomorrow));
    }

    // -- Recovery ---------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn leftover_session_is_stopped_before_collecting() {
        let svc = Service::new(PumpState::Off);
        let rig = rig("ctl-leftover", svc.actuator(1, 1), history(1, 1), Duration::from_secs(3600));
        let ctl = control(&rig);
        let _ = rig.pump.start().await;
        assert!(rig.pump.session_active().await);

        let outcome = ctl.run_cycle(TODAY).await;
        assert!(matches!(outcome, CycleOutcome::Incomplete(_)));
        assert!(!rig.pump.session_active().await);
        assert_eq!(rig.shared.lock().await.pump, PumpState::Off);
    }
}
