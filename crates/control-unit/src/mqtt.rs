use rumqttc::{AsyncClient, ClientError, QoS};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::round::{Reading, SensorKind};
use crate::state::SharedState;

// ---------------------------------------------------------------------------
// MQTT message types (SenML-style envelope)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SenmlMsg {
    pub(crate) bn: String,
    pub(crate) e: Vec<SenmlEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SenmlEntry {
    pub(crate) n: String,
    #[serde(default)]
    pub(crate) v: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) u: Option<String>,
    #[serde(default)]
    pub(crate) t: Option<serde_json::Value>,
}

#[derive(Debug, Error, PartialEq)]
pub(crate) enum PayloadError {
    #[error("bad sensor json: {0}")]
    Json(String),
    #[error("envelope has no entries")]
    Empty,
    #[error("entry '{0}' has no numeric value")]
    MissingValue(String),
    #[error("soil moisture topic '{0}' has no probe id")]
    MissingProbeId(String),
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Wildcard subscription covering every sensor topic.
pub(crate) fn sensors_filter(prefix: &str) -> String {
    format!("{prefix}/sensors/#")
}

pub(crate) fn led_topic(prefix: &str) -> String {
    format!("{prefix}/actuators/LED")
}

pub(crate) fn pump_echo_topic(prefix: &str) -> String {
    format!("{prefix}/actuators/commands/waterpump")
}

/// Classify "<prefix>/sensors/..." by the sensor name it contains.
///
/// Soil-moisture topics carry the probe ID as their final segment.
pub(crate) fn classify_topic<'a>(
    prefix: &str,
    topic: &'a str,
) -> Option<(SensorKind, Option<&'a str>)> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix("/sensors/")?;

    if rest.contains("soil_moisture") {
        let id = topic.rsplit('/').next().filter(|s| !s.is_empty());
        Some((SensorKind::SoilMoisture, id))
    } else if rest.contains("temperature") {
        Some((SensorKind::Temperature, None))
    } else if rest.contains("humidity") {
        Some((SensorKind::Humidity, None))
    } else if rest.contains("light") {
        Some((SensorKind::Light, None))
    } else if rest.contains("rain") {
        Some((SensorKind::Rain, None))
    } else if rest.contains("water_flow") {
        Some((SensorKind::WaterFlow, None))
    } else {
        None
    }
}

/// Extract the first entry's value from a sensor payload.
pub(crate) fn parse_sensor_value(payload: &[u8]) -> Result<f64, PayloadError> {
    let msg: SenmlMsg =
        serde_json::from_slice(payload).map_err(|e| PayloadError::Json(e.to_string()))?;
    let entry = msg.e.first().ok_or(PayloadError::Empty)?;
    entry
        .v
        .ok_or_else(|| PayloadError::MissingValue(entry.n.clone()))
}

/// Build a [`Reading`] from one inbound publish, or `Ok(None)` for topics
/// that are not sensors we track.
pub(crate) fn parse_reading(
    prefix: &str,
    topic: &str,
    payload: &[u8],
    received_at: Instant,
) -> Result<Option<Reading>, PayloadError> {
    let Some((kind, id)) = classify_topic(prefix, topic) else {
        return Ok(None);
    };
    if kind == SensorKind::SoilMoisture && id.is_none() {
        return Err(PayloadError::MissingProbeId(topic.to_string()));
    }
    let value = parse_sensor_value(payload)?;
    Ok(Some(Reading {
        kind,
        source_id: id.map(str::to_string),
        value,
        received_at,
    }))
}

/// SenML `t` stamp in the site's local time.
fn local_timestamp(at: OffsetDateTime, offset: UtcOffset) -> String {
    let fmt = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    at.to_offset(offset).format(&fmt).unwrap_or_default()
}

/// LED warning command: `v` is 1 for warning on, 0 for off.
pub(crate) fn led_payload(prefix: &str, on: bool, offset: UtcOffset) -> Vec<u8> {
    let msg = SenmlMsg {
        bn: format!("{prefix}/commands/"),
        e: vec![SenmlEntry {
            n: "LED".into(),
            v: Some(if on { 1.0 } else { 0.0 }),
            u: None,
            t: Some(serde_json::Value::String(local_timestamp(
                OffsetDateTime::now_utc(),
                offset,
            ))),
        }],
    };
    serde_json::to_vec(&msg).unwrap_or_default()
}

/// Pump status echo published after a confirmed transition.
pub(crate) fn pump_echo_payload(prefix: &str, on: bool, offset: UtcOffset) -> Vec<u8> {
    let msg = SenmlMsg {
        bn: format!("{prefix}/commands/waterpump"),
        e: vec![SenmlEntry {
            n: "waterpump".into(),
            v: Some(if on { 1.0 } else { 0.0 }),
            u: Some("binary".into()),
            t: Some(serde_json::Value::String(local_timestamp(
                OffsetDateTime::now_utc(),
                offset,
            ))),
        }],
    };
    serde_json::to_vec(&msg).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Bus handle
// ---------------------------------------------------------------------------

/// Publishing side of the bus, cloned into whoever needs to publish.
#[derive(Clone)]
pub struct Bus {
    client: AsyncClient,
    prefix: String,
    utc_offset: UtcOffset,
}

impl Bus {
    pub fn new(client: AsyncClient, prefix: impl Into<String>, utc_offset: UtcOffset) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            utc_offset,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Queue the sensor subscription without awaiting the request channel, so
    /// it is safe to call from the task that polls the event loop.
    pub fn try_subscribe_sensors(&self) -> Result<(), ClientError> {
        self.client
            .try_subscribe(sensors_filter(&self.prefix), QoS::AtLeastOnce)
    }

    pub async fn publish_led(&self, on: bool) -> Result<(), ClientError> {
        self.client
            .publish(
                led_topic(&self.prefix),
                QoS::AtLeastOnce,
                false,
                led_payload(&self.prefix, on, self.utc_offset),
            )
            .await
    }

    pub async fn publish_pump_echo(&self, on: bool) -> Result<(), ClientError> {
        self.client
            .publish(
                pump_echo_topic(&self.prefix),
                QoS::AtLeastOnce,
                false,
                pump_echo_payload(&self.prefix, on, self.utc_offset),
            )
            .await
    }

    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.client.disconnect().await
    }
}

// ---------------------------------------------------------------------------
// Inbound dispatch
// ---------------------------------------------------------------------------

/// Handle one inbound publish from the bus event loop.
pub async fn handle_publish(shared: &SharedState, prefix: &str, topic: &str, payload: &[u8]) {
    match parse_reading(prefix, topic, payload, Instant::now()) {
        Ok(Some(reading)) => {
            let mut st = shared.lock().await;
            st.record(reading);
        }
        Ok(None) => debug!(%topic, "ignoring unrelated topic"),
        Err(e) => warn!(%topic, "dropping sensor message: {e}"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
