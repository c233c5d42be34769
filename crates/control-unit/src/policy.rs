//! Irrigation decision over one completed round.
//!
//! Pure functions only: the caller snapshots the round, the sunrise counter
//! and the daily flag, and acts on the returned [`Decision`].

use std::fmt;

use crate::config::PolicyConfig;
use crate::round::Round;

/// Everything the policy looks at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyInputs {
    pub average_moisture: f64,
    pub temperature: f64,
    pub rain: f64,
    /// Sunrise counter in minutes.
    pub sunrise_counter: f64,
    pub sunrise_buffer: f64,
    pub irrigated_today: bool,
}

/// Why the policy held off, in reporting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    IrrigatedToday,
    OutsideWindow,
    MoistureSufficient,
    TooCold,
    TooHot,
    RainDetected,
    BelowDoNotWaterFloor,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::IrrigatedToday => "Irrigated today",
            Self::OutsideWindow => "Not within the irrigation window before sunrise",
            Self::MoistureSufficient => "Soil moisture is sufficient",
            Self::TooCold => "Temperature is too low",
            Self::TooHot => "Temperature is too high",
            Self::RainDetected => "Rain is detected",
            Self::BelowDoNotWaterFloor => "Temperature is too low, not suitable for irrigation",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Irrigate,
    Hold(Vec<BlockReason>),
}


/// Join reasons the way they are logged and reported.
pub fn describe(reasons: &[BlockReason]) -> String {
    reasons
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Build policy inputs from a round. Returns the missing categories when the
/// round lacks data the policy needs.
pub fn inputs_from_round(
    round: &Round,
    sunrise_counter: f64,
    sunrise_buffer: f64,
    irrigated_today: bool,
) -> Result<PolicyInputs, Vec<String>> {
    match (round.average_moisture(), round.temperature(), round.rain()) {
        (Some(average_moisture), Some(temperature), Some(rain)) if round.light().is_some() => {
            Ok(PolicyInputs {
                average_moisture,
                temperature,
                rain,
                sunrise_counter,
                sunrise_buffer,
                irrigated_today,
            })
        }
        _ => Err(round.missing()),
    }
}

/// Decide whether to water.
///
/// Temperature must be inside `[temperature_min, temperature_max]` *and*
/// strictly above `do_not_water_temp`; with the stock thresholds exactly 4 °C
/// is therefore blocked.
pub fn evaluate(inputs: &PolicyInputs, th: &PolicyConfig) -> Decision {
    let in_window = inputs.sunrise_counter > 0.0 && inputs.sunrise_counter < inputs.sunrise_buffer;
    let t = inputs.temperature;

    let irrigate = !inputs.irrigated_today
        && in_window
        && inputs.average_moisture < th.moisture_threshold
        && (th.temperature_min..=th.temperature_max).contains(&t)
        && inputs.rain < th.rain_threshold
        && t > th.do_not_water_temp;

    if irrigate {
        return Decision::Irrigate;
    }

    let mut reasons = Vec::new();
    if inputs.irrigated_today {
        reasons.push(BlockReason::IrrigatedToday);
    }
    if !in_window {
        reasons.push(BlockReason::OutsideWindow);
    }
    if inputs.average_moisture >= th.moisture_threshold {
        reasons.push(BlockReason::MoistureSufficient);
    }
    if t < th.temperature_min {
        reasons.push(BlockReason::TooCold);
    } else if t > th.temperature_max {
        reasons.push(BlockReason::TooHot);
    }
    if inputs.rain >= th.rain_threshold {
        reasons.push(BlockReason::RainDetected);
    }
    if t <= th.do_not_water_temp {
        reasons.push(BlockReason::BelowDoNotWaterFloor);
    }
    Decision::Hold(reasons)
}

// ===========================================================================
// Tests
// ===========================================================================
