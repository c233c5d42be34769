//! TOML config file loading and validation for the control unit.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! runnable configuration matching the stock garden deployment.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;
use time::UtcOffset;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub actuator: ActuatorConfig,
    pub catalog: CatalogConfig,
    pub policy: PolicyConfig,
    pub sunrise: SunriseConfig,
    pub round: RoundConfig,
    pub pump: PumpConfig,
    pub ledger: LedgerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topic_prefix: String,
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ActuatorConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub base_url: String,
    pub pump_device_id: String,
    pub timeout_secs: u64,
}

/// Thresholds consumed by [`crate::policy::evaluate`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Average soil moisture (%) below which the plot needs water.
    pub moisture_threshold: f64,
    pub temperature_min: f64,
    pub temperature_max: f64,
    /// Rain sensor level at or above which rain is considered detected.
    pub rain_threshold: f64,
    /// Never water at or below this temperature (°C).
    pub do_not_water_temp: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SunriseConfig {
    pub lux_threshold: f64,
    pub buffer_minutes: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoundConfig {
    pub soil_probes: usize,
    pub timeout_secs: u64,
    pub interval_secs: u64,
    pub utc_offset_hours: i8,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    pub duration_secs: u64,
    pub completion_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub path: String,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "mqtt.eclipseprojects.io".into(),
            port: 1883,
            client_id: "CentralControlUnit".into(),
            topic_prefix: "Garden".into(),
            keep_alive_secs: 30,
        }
    }
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/garden/actuators".into(),
            timeout_secs: 10,
        }
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/garden".into(),
            pump_device_id: "waterpump".into(),
            timeout_secs: 10,
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            moisture_threshold: 30.0,
            temperature_min: 4.0,
            temperature_max: 30.0,
            rain_threshold: 4.0,
            do_not_water_temp: 4.0,
        }
    }
}

impl Default for SunriseConfig {
    fn default() -> Self {
        Self {
            lux_threshold: 100.0,
            buffer_minutes: 60.0,
        }
    }
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            soil_probes: 9,
            timeout_secs: 600,
            interval_secs: 600,
            utc_offset_hours: 0,
        }
    }
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            duration_secs: 30,
            completion_grace_secs: 30,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: "water_usage.json".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Derived values
// ---------------------------------------------------------------------------

impl RoundConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Offset of the calendar used for the daily rollover.
    pub fn utc_offset(&self) -> UtcOffset {
        UtcOffset::from_hms(self.utc_offset_hours, 0, 0).unwrap_or(UtcOffset::UTC)
    }
}

impl PumpConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    /// Upper bound on how long the control loop waits for a session to close.
    pub fn completion_deadline(&self) -> Duration {
        Duration::from_secs(self.duration_secs + self.completion_grace_secs)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all sections. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_endpoints(&mut errors);
        self.validate_thresholds(&mut errors);
        self.validate_timing(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_endpoints(&self, errors: &mut Vec<String>) {
        let prefix = self.mqtt.topic_prefix.trim();
        if prefix.is_empty() {
            errors.push("mqtt.topic_prefix is empty".into());
        } else if prefix.contains(['#', '+']) {
            errors.push(format!(
                "mqtt.topic_prefix '{prefix}' must not contain MQTT wildcards"
            ));
        }
        if self.mqtt.host.trim().is_empty() {
            errors.push("mqtt.host is empty".into());
        }
        if self.mqtt.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".into());
        }
        if self.actuator.base_url.trim().is_empty() {
            errors.push("actuator.base_url is empty".into());
        }
        if self.catalog.base_url.trim().is_empty() {
            errors.push("catalog.base_url is empty".into());
        }
        if self.catalog.pump_device_id.trim().is_empty() {
            errors.push("catalog.pump_device_id is empty".into());
        }
        if self.ledger.path.trim().is_empty() {
            errors.push("ledger.path is empty".into());
        }
    }

    fn validate_thresholds(&self, errors: &mut Vec<String>) {
        let p = &self.policy;
        for (name, value) in [
            ("policy.moisture_threshold", p.moisture_threshold),
            ("policy.temperature_min", p.temperature_min),
            ("policy.temperature_max", p.temperature_max),
            ("policy.rain_threshold", p.rain_threshold),
            ("policy.do_not_water_temp", p.do_not_water_temp),
            ("sunrise.lux_threshold", self.sunrise.lux_threshold),
            ("sunrise.buffer_minutes", self.sunrise.buffer_minutes),
        ] {
            if !value.is_finite() {
                errors.push(format!("{name} must be a finite number, got {value}"));
            }
        }
        if !(0.0..=100.0).contains(&p.moisture_threshold) {
            errors.push(format!(
                "policy.moisture_threshold {} out of range [0, 100]",
                p.moisture_threshold
            ));
        }
        if p.temperature_min > p.temperature_max {
            errors.push(format!(
                "policy.temperature_min ({}) exceeds temperature_max ({})",
                p.temperature_min, p.temperature_max
            ));
        }
        if p.rain_threshold < 0.0 {
            errors.push(format!(
                "policy.rain_threshold must not be negative, got {}",
                p.rain_threshold
            ));
        }

        if self.sunrise.lux_threshold <= 0.0 {
            errors.push(format!(
                "sunrise.lux_threshold must be positive, got {}",
                self.sunrise.lux_threshold
            ));
        }
        if self.sunrise.buffer_minutes <= 0.0 {
            errors.push(format!(
                "sunrise.buffer_minutes must be positive, got {}",
                self.sunrise.buffer_minutes
            ));
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        if self.round.soil_probes == 0 {
            errors.push("round.soil_probes must be at least 1".into());
        }
        if self.round.timeout_secs == 0 {
            errors.push("round.timeout_secs must be positive".into());
        }
        if self.round.interval_secs == 0 {
            errors.push("round.interval_secs must be positive".into());
        }
        if !(-23..=23).contains(&self.round.utc_offset_hours) {
            errors.push(format!(
                "round.utc_offset_hours {} out of range [-23, 23]",
                self.round.utc_offset_hours
            ));
        }
        if self.pump.duration_secs == 0 {
            errors.push("pump.duration_secs must be positive".into());
        }
        if self.mqtt.keep_alive_secs == 0 {
            errors.push("mqtt.keep_alive_secs must be positive".into());
        }
        if self.actuator.timeout_secs == 0 || self.catalog.timeout_secs == 0 {
            errors.push("http timeouts must be positive".into());
        }
    }

    /// Apply `MQTT_HOST` / `MQTT_PORT` style overrides on top of the file.
    pub fn apply_overrides(&mut self, host: Option<String>, port: Option<u16>) {
        if let Some(host) = host.filter(|h| !h.trim().is_empty()) {
            self.mqtt.host = host;
        }
        if let Some(port) = port {
            self.mqtt.port = port;
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    parse(&contents).with_context(|| format!("invalid config: {path}"))
}

/// Parse and validate config text.
pub fn parse(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.validate()?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
