use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::Date;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::round::{Reading, Recorded, Round, SensorKind};
use crate::sunrise::{SunriseDetector, WindowChange};

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

/// All round, sunrise, pump and session state lives behind this one lock.
pub type SharedState = Arc<Mutex<ControlState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PumpState {
    On,
    Off,
}

impl fmt::Display for PumpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::On => "ON",
            Self::Off => "OFF",
        })
    }
}

/// Water accounting for the interval the pump is confirmed ON.
#[derive(Debug, Clone)]
pub struct IrrigationSession {
    pub started_at: Instant,
    pub water_used_liters: f64,
    pub last_flow_at: Instant,
}

impl IrrigationSession {
    pub fn new(started_at: Instant) -> Self {
        Self {
            started_at,
            water_used_liters: 0.0,
            last_flow_at: started_at,
        }
    }

    /// Integrate a flow sample (L/min) over the time since the previous one.
    pub fn record_flow(&mut self, liters_per_min: f64, at: Instant) -> f64 {
        let secs = at.saturating_duration_since(self.last_flow_at).as_secs_f64();
        let used = liters_per_min * secs / 60.0;
        self.water_used_liters += used;
        if at > self.last_flow_at {
            self.last_flow_at = at;
        }
        used
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyFlags {
    pub date: Option<Date>,
    pub irrigated_today: bool,
}

pub struct ControlState {
    pub round: Option<Round>,
    round_done: Option<oneshot::Sender<()>>,
    /// Latest light level, carried across rounds.
    pub light_level: Option<f64>,
    pub sunrise: SunriseDetector,
    pub pump: PumpState,
    pub session: Option<IrrigationSession>,
    pub daily: DailyFlags,
    pub led_warning: bool,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl ControlState {
    pub fn new(cfg: &Config) -> Self {
        Self {
            round: None,
            round_done: None,
            light_level: None,
            sunrise: SunriseDetector::new(cfg.sunrise.lux_threshold, cfg.sunrise.buffer_minutes),
            pump: PumpState::Off,
            session: None,
            daily: DailyFlags {
                date: None,
                irrigated_today: false,
            },
            led_warning: false,
        }
    }

    pub fn shared(cfg: &Config) -> SharedState {
        Arc::new(Mutex::new(Self::new(cfg)))
    }

    /// Start a fresh round, discarding any previous one. The receiver fires
    /// once when the round fills every expected slot.
    pub fn open_round(&mut self, expected_probes: usize) -> oneshot::Receiver<()> {
        if self.is_collecting() {
            warn!("previous round still open, discarding its readings");
        }
        let (tx, rx) = oneshot::channel();
        self.round = Some(Round::new(expected_probes));
        self.round_done = Some(tx);
        rx
    }

    /// Close and hand over the current round.
    pub fn take_round(&mut self) -> Option<Round> {
        self.round_done = None;
        let mut round = self.round.take()?;
        round.close();
        Some(round)
    }

    pub fn is_collecting(&self) -> bool {
        self.round.as_ref().is_some_and(Round::is_open)
    }

    /// Apply one inbound reading: sunrise and session bookkeeping first, then
    /// the open round (if any). Returns true when the round just completed.
    pub fn record(&mut self, reading: Reading) -> bool {
        match reading.kind {
            SensorKind::Light => self.record_light(reading.value, reading.received_at),
            SensorKind::WaterFlow => {
                if !(reading.value.is_finite() && reading.value >= 0.0) {
                    warn!(value = reading.value, "dropping invalid water flow reading");
                    return false;
                }
                self.record_flow(reading.value, reading.received_at);
            }
            _ => {}
        }

        let Some(round) = self.round.as_mut() else {
            debug!(kind = %reading.kind, "no round open, reading not aggregated");
            return false;
        };

        match round.record(&reading) {
            Recorded::Counted => {
                debug!(
                    kind = %reading.kind,
                    id = reading.source_id.as_deref().unwrap_or("-"),
                    value = reading.value,
                    received = round.received(),
                    expected = round.expected(),
                    "reading recorded"
                );
                false
            }
            Recorded::Overwritten => {
                debug!(kind = %reading.kind, value = reading.value, "reading overwrote earlier value");
                false
            }
            Recorded::Completed => {
                info!(received = round.received(), "round complete");
                if let Some(tx) = self.round_done.take() {
                    let _ = tx.send(());
                }
                true
            }
            Recorded::Closed => {
                debug!(kind = %reading.kind, "round closed, reading ignored");
                false
            }
            Recorded::TooManyProbes => {
                warn!(
                    id = reading.source_id.as_deref().unwrap_or("-"),
                    "unexpected soil moisture probe, all probe slots already filled"
                );
                false
            }
            Recorded::MissingProbeId => {
                warn!("soil moisture reading without probe id");
                false
            }
        }
    }

    fn record_light(&mut self, lux: f64, at: Instant) {
        self.light_level = Some(lux);
        match self.sunrise.update(lux, at) {
            Some(WindowChange::Opened) => info!(
                counter = self.sunrise.counter(),
                "sunrise buffer reached, pre-sunrise window open"
            ),
            Some(WindowChange::Closed) => info!("sunrise counter drained, window closed"),
            None => {}
        }
        debug!(lux, counter = format!("{:.2}", self.sunrise.counter()), "light sample");
    }

    /// Feed the active session, if any. Flow outside a session is ignored.
    pub fn record_flow(&mut self, liters_per_min: f64, at: Instant) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let used = session.record_flow(liters_per_min, at);
        debug!(
            flow_l_min = liters_per_min,
            liters = format!("{used:.4}"),
            session_liters = format!("{:.4}", session.water_used_liters),
            "irrigation flow"
        );
    }

    /// Reset per-day flags when the calendar date moves on. Returns true when
    /// a reset happened (including the very first call).
    pub fn roll_day(&mut self, today: Date) -> bool {
        if self.daily.date == Some(today) {
            return false;
        }
        self.daily = DailyFlags {
            date: Some(today),
            irrigated_today: false,
        };
        self.sunrise.reset();
        true
    }

    /// Record the LED warning state; true when it changed.
    pub fn set_led_warning(&mut self, on: bool) -> bool {
        let changed = self.led_warning != on;
        self.led_warning = on;
        changed
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use time::macros::date;

    fn state() -> ControlState {
        ControlState::new(&Config::default())
    }

    fn fill_round(st: &mut ControlState) -> usize {
        let mut completed = 0;
        for i in 0..9 {
            completed += st.record(Reading::soil(format!("p{i}"), 20.0)) as usize;
        }
        for kind in [
            SensorKind::Temperature,
            SensorKind::Humidity,
            SensorKind::Light,
            SensorKind::Rain,
            SensorKind::WaterFlow,
        ] {
            completed += st.record(Reading::new(kind, 1.0)) as usize;
        }
        completed
    }

    // -- Rounds -----------------------------------------------------------

    #[tokio::test]
    async fn completion_signal_fires_once() {
        let mut st = state();
        let rx = st.open_round(9);
        assert!(st.is_collecting());
        assert_eq!(fill_round(&mut st), 1);
        rx.await.unwrap();
        assert!(!st.is_collecting());

        // Late duplicates change nothing.
        assert!(!st.record(Reading::new(SensorKind::Rain, 9.0)));
        assert_eq!(st.round.as_ref().unwrap().rain(), Some(1.0));
    }

    #[test]
    fn readings_without_round_are_not_aggregated() {
        let mut st = state();
        assert!(!st.record(Reading::new(SensorKind::Temperature, 12.0)));
        assert!(st.round.is_none());
    }

    #[test]
    fn new_round_discards_previous_values_but_keeps_light() {
        let mut st = state();
        let _rx = st.open_round(9);
        st.record(Reading::new(SensorKind::Temperature, 12.0));
        st.record(Reading::new(SensorKind::Light, 250.0));

        let _rx = st.open_round(9);
        let round = st.round.as_ref().unwrap();
        assert_eq!(round.temperature(), None);
        assert_eq!(round.received(), 0);
        assert_eq!(st.light_level, Some(250.0));
    }

    #[tokio::test]
    async fn take_round_drops_signal() {
        let mut st = state();
        let rx = st.open_round(9);
        let round = st.take_round().unwrap();
        assert!(!round.is_open());
        assert!(rx.await.is_err());
        assert!(st.take_round().is_none());
    }

    // -- Sunrise ----------------------------------------------------------

    #[test]
    fn light_updates_sunrise_even_without_round() {
        let mut st = state();
        let t0 = Instant::now();
        let mut r = Reading::new(SensorKind::Light, 500.0);
        r.received_at = t0;
        st.record(r.clone());
        r.received_at = t0 + Duration::from_secs(20 * 60);
        st.record(r);
        assert!((st.sunrise.counter() - 20.0).abs() < 1e-9);
    }

    // -- Flow accounting --------------------------------------------------

    #[test]
    fn flow_before_session_is_ignored() {
        let mut st = state();
        st.record(Reading::new(SensorKind::WaterFlow, 2.0));
        assert!(st.session.is_none());
    }

    #[test]
    fn flow_integrates_over_elapsed_time() {
        let mut st = state();
        let t0 = Instant::now();
        st.session = Some(IrrigationSession::new(t0));
        st.record_flow(2.0, t0 + Duration::from_secs(30));
        st.record_flow(3.0, t0 + Duration::from_secs(50));
        let used = st.session.as_ref().unwrap().water_used_liters;
        assert!((used - 2.0).abs() < 1e-9, "used {used}");
    }

    #[test]
    fn negative_flow_dropped() {
        let mut st = state();
        let t0 = Instant::now();
        st.session = Some(IrrigationSession::new(t0));
        let mut r = Reading::new(SensorKind::WaterFlow, -5.0);
        r.received_at = t0 + Duration::from_secs(60);
        st.record(r);
        assert_eq!(st.session.as_ref().unwrap().water_used_liters, 0.0);
    }

    // -- Daily rollover ---------------------------------------------------

    #[test]
    fn roll_day_resets_flags_and_sunrise() {
        let mut st = state();
        assert!(st.roll_day(date!(2026 - 10 - 18)));
        st.daily.irrigated_today = true;

        let t0 = Instant::now();
        st.sunrise.update(500.0, t0);
        st.sunrise.update(500.0, t0 + Duration::from_secs(30 * 60));
        assert!(st.sunrise.counter() > 0.0);

        assert!(!st.roll_day(date!(2026 - 10 - 18)));
        assert!(st.daily.irrigated_today);

        assert!(st.roll_day(date!(2026 - 10 - 19)));
        assert!(!st.daily.irrigated_today);
        assert_eq!(st.sunrise.counter(), 0.0);
        assert!(!st.sunrise.is_pre_sunrise_window());
    }

    // -- LED --------------------------------------------------------------

    #[test]
    fn led_change_detection() {
        let mut st = state();
        assert!(!st.set_led_warning(false));
        assert!(st.set_led_warning(true));
        assert!(!st.set_led_warning(true));
        assert!(st.set_led_warning(false));
    }

    #[test]
    fn pump_state_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&PumpState::On).unwrap(), "\"ON\"");
        let off: PumpState = serde_json::from_str("\"OFF\"").unwrap();
        assert_eq!(off, PumpState::Off);
    }
}
