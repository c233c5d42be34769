//! Light-driven hysteresis counter marking the pre-sunrise irrigation window.
//!
//! ```text
//!   lux >= threshold: counter += elapsed minutes (capped at buffer)
//!   lux <  threshold: counter -= elapsed minutes (floored at 0)
//!
//!   window: false ──[counter reaches buffer]──▶ true
//!           true  ──[counter reaches 0]───────▶ false
//! ```
//!
//! Between the two bounds the window flag keeps its previous value, so noisy
//! light readings around the threshold cannot make it flap.

use tokio::time::Instant;

/// Window flag transitions reported by [`SunriseDetector::update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowChange {
    Opened,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SunriseDetector {
    lux_threshold: f64,
    buffer: f64,
    counter: f64,
    in_window: bool,
    last_sample: Option<Instant>,
}

impl SunriseDetector {
    pub fn new(lux_threshold: f64, buffer_minutes: f64) -> Self {
        Self {
            lux_threshold,
            buffer: buffer_minutes,
            counter: 0.0,
            in_window: false,
            last_sample: None,
        }
    }

    /// Counter value in minutes, always within `[0, buffer]`.
    pub fn counter(&self) -> f64 {
        self.counter
    }

    pub fn buffer(&self) -> f64 {
        self.buffer
    }

    pub fn is_pre_sunrise_window(&self) -> bool {
        self.in_window
    }

    /// Feed one light sample taken at `at`.
    pub fn update(&mut self, lux: f64, at: Instant) -> Option<WindowChange> {
        // First sample ever is its own reference point.
        let reference = self.last_sample.unwrap_or(at);
        let elapsed_min = at.saturating_duration_since(reference).as_secs_f64() / 60.0;
        if self.last_sample.map_or(true, |last| at > last) {
            self.last_sample = Some(at);
        }

        if lux < self.lux_threshold {
            self.counter = (self.counter - elapsed_min).max(0.0);
        } else {
            self.counter = (self.counter + elapsed_min).min(self.buffer);
        }

        if self.counter <= 0.0 && self.in_window {
            self.in_window = false;
            Some(WindowChange::Closed)
        } else if self.counter >= self.buffer && !self.in_window {
            self.in_window = true;
            Some(WindowChange::Opened)
        } else {
            None
        }
    }

    /// Daily reset: counter and window cleared. The last sample time is kept
    /// so the next reading measures elapsed time from the real previous one.
    pub fn reset(&mut self) {
        self.counter = 0.0;
        self.in_window = false;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn mins(m: u64) -> Duration {
        Duration::from_secs(m * 60)
    }

    /// Feed `(lux, minutes since start)` samples, returning the detector.
    fn feed(samples: &[(f64, u64)]) -> (SunriseDetector, Vec<Option<WindowChange>>) {
        let start = Instant::now();
        let mut det = SunriseDetector::new(100.0, 60.0);
        let changes = samples
            .iter()
            .map(|&(lux, m)| det.update(lux, start + mins(m)))
            .collect();
        (det, changes)
    }

    // -- Counter arithmetic -----------------------------------------------

    #[test]
    fn first_sample_has_zero_elapsed() {
        let (det, _) = feed(&[(500.0, 0)]);
        assert_eq!(det.counter(), 0.0);
        assert!(!det.is_pre_sunrise_window());
    }

    #[test]
    fn bright_samples_accumulate_minutes() {
        let (det, _) = feed(&[(500.0, 0), (500.0, 10), (500.0, 25)]);
        assert!((det.counter() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn fractional_minutes_count() {
        let start = Instant::now();
        let mut det = SunriseDetector::new(100.0, 60.0);
        det.update(200.0, start);
        det.update(200.0, start + Duration::from_secs(90));
        assert!((det.counter() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn counter_capped_at_buffer() {
        let (det, _) = feed(&[(500.0, 0), (500.0, 200)]);
        assert_eq!(det.counter(), 60.0);
    }

    #[test]
    fn counter_floored_at_zero() {
        let (det, _) = feed(&[(500.0, 0), (500.0, 10), (5.0, 100)]);
        assert_eq!(det.counter(), 0.0);
    }

    #[test]
    fn threshold_value_counts_as_bright() {
        let (det, _) = feed(&[(100.0, 0), (100.0, 5)]);
        assert!((det.counter() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn out_of_order_sample_adds_nothing() {
        let start = Instant::now();
        let mut det = SunriseDetector::new(100.0, 60.0);
        det.update(500.0, start + mins(10));
        det.update(500.0, start);
        assert_eq!(det.counter(), 0.0);
    }

    // -- Hysteresis -------------------------------------------------------

    #[test]
    fn window_opens_only_at_buffer() {
        let (det, changes) = feed(&[(500.0, 0), (500.0, 30), (500.0, 59)]);
        assert!(!det.is_pre_sunrise_window());
        assert!(changes.iter().all(Option::is_none));

        let (det, changes) = feed(&[(500.0, 0), (500.0, 30), (500.0, 60)]);
        assert!(det.is_pre_sunrise_window());
        assert_eq!(changes.last().copied().flatten(), Some(WindowChange::Opened));
    }

    #[test]
    fn window_stays_open_through_intermediate_values() {
        // Reach the buffer, then dip down and back up without touching 0.
        let (det, changes) = feed(&[
            (500.0, 0),
            (500.0, 60),
            (10.0, 90),
            (500.0, 100),
            (10.0, 130),
        ]);
        assert!((det.counter() - 10.0).abs() < 1e-9);
        assert!(det.is_pre_sunrise_window());
        assert_eq!(
            changes,
            vec![None, Some(WindowChange::Opened), None, None, None]
        );
    }

    #[test]
    fn window_closes_only_at_zero() {
        let (det, changes) = feed(&[(500.0, 0), (500.0, 60), (10.0, 119)]);
        assert!(det.is_pre_sunrise_window());
        assert!(det.counter() > 0.0);
        assert_eq!(changes[2], None);

        let (det, changes) = feed(&[(500.0, 0), (500.0, 60), (10.0, 120)]);
        assert!(!det.is_pre_sunrise_window());
        assert_eq!(changes[2], Some(WindowChange::Closed));
    }

    #[test]
    fn rising_counter_below_buffer_keeps_window_closed() {
        // Counter oscillates between 0 and buffer without reaching it.
        let (det, _) = feed(&[(500.0, 0), (500.0, 40), (10.0, 60), (500.0, 90)]);
        assert!(!det.is_pre_sunrise_window());
        assert!(det.counter() > 0.0 && det.counter() < 60.0);
    }

    // -- Reset ------------------------------------------------------------

    #[test]
    fn reset_clears_counter_and_window_but_keeps_reference() {
        let start = Instant::now();
        let mut det = SunriseDetector::new(100.0, 60.0);
        det.update(500.0, start);
        det.update(500.0, start + mins(60));
        assert!(det.is_pre_sunrise_window());

        det.reset();
        assert_eq!(det.counter(), 0.0);
        assert!(!det.is_pre_sunrise_window());

        det.update(500.0, start + mins(70));
        assert!((det.counter() - 10.0).abs() < 1e-9);
    }
}
