//! Reading aggregation for one collection round.
//!
//! A round waits for one value per expected slot: every soil-moisture probe
//! (keyed by probe ID) plus a single temperature, humidity, light, rain and
//! water-flow reading. Repeated readings for a filled slot overwrite the value
//! without advancing the completion count.

use std::collections::HashMap;
use std::fmt;

use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Readings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    SoilMoisture,
    Temperature,
    Humidity,
    Light,
    Rain,
    WaterFlow,
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SoilMoisture => "soil_moisture",
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Light => "light",
            Self::Rain => "rain",
            Self::WaterFlow => "water_flow",
        };
        f.write_str(s)
    }
}

/// One sensor value as delivered by the bus.
#[derive(Debug, Clone)]
pub struct Reading {
    pub kind: SensorKind,
    /// Probe ID for soil-moisture readings; `None` for the single-valued kinds.
    pub source_id: Option<String>,
    pub value: f64,
    pub received_at: Instant,
}

#[cfg(test)]
impl Reading {
    pub fn new(kind: SensorKind, value: f64) -> Self {
        Self {
            kind,
            source_id: None,
            value,
            received_at: Instant::now(),
        }
    }

    pub fn soil(probe_id: impl Into<String>, value: f64) -> Self {
        Self {
            kind: SensorKind::SoilMoisture,
            source_id: Some(probe_id.into()),
            value,
            received_at: Instant::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Round
// ---------------------------------------------------------------------------

/// What happened to a reading offered to [`Round::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// Filled a new slot; the round is still waiting for more.
    Counted,
    /// Filled the last slot; the round is now closed.
    Completed,
    /// Overwrote an already-filled slot.
    Overwritten,
    /// The round already closed; nothing changed.
    Closed,
    /// A soil probe ID beyond the expected probe count.
    TooManyProbes,
    /// Soil-moisture reading without a probe ID.
    MissingProbeId,
}

#[derive(Debug)]
pub struct Round {
    expected_probes: usize,
    soil_moisture: HashMap<String, f64>,
    temperature: Option<f64>,
    humidity: Option<f64>,
    light: Option<f64>,
    rain: Option<f64>,
    water_flow: Option<f64>,
    open: bool,
}

impl Round {
    pub fn new(expected_probes: usize) -> Self {
        Self {
            expected_probes,
            soil_moisture: HashMap::with_capacity(expected_probes),
            temperature: None,
            humidity: None,
            light: None,
            rain: None,
            water_flow: None,
            open: true,
        }
    }

    /// Total number of readings that complete the round.
    pub fn expected(&self) -> usize {
        self.expected_probes + 5
    }

    /// Number of distinct slots filled so far.
    pub fn received(&self) -> usize {
        self.soil_moisture.len()
            + [
                self.temperature,
                self.humidity,
                self.light,
                self.rain,
                self.water_flow,
            ]
            .iter()
            .filter(|v| v.is_some())
            .count()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_complete(&self) -> bool {
        self.received() == self.expected()
    }

    /// Stop accepting readings (deadline reached or result consumed).
    pub fn close(&mut self) {
        self.open = false;
    }

    /// Route a reading into its slot.
    pub fn record(&mut self, reading: &Reading) -> Recorded {
        if !self.open {
            return Recorded::Closed;
        }

        let fresh = match reading.kind {
            SensorKind::SoilMoisture => {
                let Some(id) = reading.source_id.as_deref() else {
                    return Recorded::MissingProbeId;
                };
                if !self.soil_moisture.contains_key(id)
                    && self.soil_moisture.len() >= self.expected_probes
                {
                    return Recorded::TooManyProbes;
                }
                self.soil_moisture
                    .insert(id.to_string(), reading.value)
                    .is_none()
            }
            SensorKind::Temperature => self.temperature.replace(reading.value).is_none(),
            SensorKind::Humidity => self.humidity.replace(reading.value).is_none(),
            SensorKind::Light => self.light.replace(reading.value).is_none(),
            SensorKind::Rain => self.rain.replace(reading.value).is_none(),
            SensorKind::WaterFlow => self.water_flow.replace(reading.value).is_none(),
        };

        if !fresh {
            Recorded::Overwritten
        } else if self.is_complete() {
            self.open = false;
            Recorded::Completed
        } else {
            Recorded::Counted
        }
    }

    /// Mean of all probe values, `None` until every expected probe reported.
    pub fn average_moisture(&self) -> Option<f64> {
        if self.soil_moisture.len() < self.expected_probes || self.soil_moisture.is_empty() {
            return None;
        }
        let sum: f64 = self.soil_moisture.values().sum();
        Some(sum / self.soil_moisture.len() as f64)
    }

    pub fn temperature(&self) -> Option<f64> {
        self.temperature
    }

    pub fn humidity(&self) -> Option<f64> {
        self.humidity
    }

    pub fn light(&self) -> Option<f64> {
        self.light
    }

    pub fn rain(&self) -> Option<f64> {
        self.rain
    }

    pub fn water_flow(&self) -> Option<f64> {
        self.water_flow
    }

    /// Human-readable list of categories still missing, for logging.
    pub fn missing(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.soil_moisture.len() < self.expected_probes {
            out.push(format!(
                "{} ({}/{})",
                SensorKind::SoilMoisture,
                self.soil_moisture.len(),
                self.expected_probes
            ));
        }
        let singles = [
            (SensorKind::Temperature, self.temperature),
            (SensorKind::Humidity, self.humidity),
            (SensorKind::Light, self.light),
            (SensorKind::Rain, self.rain),
            (SensorKind::WaterFlow, self.water_flow),
        ];
        for (kind, value) in singles {
            if value.is_none() {
                out.push(kind.to_string());
            }
        }
        out
    }
}

// ===========================================================================
// Tests
// ===========================================================================
