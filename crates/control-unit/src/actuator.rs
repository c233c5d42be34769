//! Remote water-pump actuator. The controller only sees the [`PumpActuator`]
//! trait; [`HttpPumpActuator`] talks to the actuator service over REST.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ActuatorConfig;
use crate::state::PumpState;

#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("actuator request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("actuator rejected {command}: {message}")]
    Rejected { command: PumpState, message: String },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PumpActuator: Send + Sync {
    /// State the actuator currently reports.
    async fn state(&self) -> Result<PumpState, ActuatorError>;
    /// Ask the actuator to switch the pump.
    async fn command(&self, target: PumpState) -> Result<(), ActuatorError>;
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct StatusReply {
    #[serde(alias = "waterpump_state")]
    pub(crate) water_pump_state: PumpState,
}

#[derive(Debug, Serialize)]
pub(crate) struct CommandRequest {
    pub(crate) command: PumpState,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CommandReply {
    pub(crate) status: String,
    #[serde(default)]
    pub(crate) message: Option<String>,
}

impl CommandReply {
    fn into_result(self, command: PumpState) -> Result<(), ActuatorError> {
        if self.status.eq_ignore_ascii_case("success") {
            Ok(())
        } else {
            Err(ActuatorError::Rejected {
                command,
                message: self.message.unwrap_or(self.status),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// REST implementation
// ---------------------------------------------------------------------------

pub struct HttpPumpActuator {
    client: reqwest::Client,
    url: String,
}

impl HttpPumpActuator {
    pub fn new(cfg: &ActuatorConfig) -> Result<Self, ActuatorError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: format!("{}/water_pump", cfg.base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl PumpActuator for HttpPumpActuator {
    async fn state(&self) -> Result<PumpState, ActuatorError> {
        let reply: StatusReply = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(reply.water_pump_state)
    }

    async fn command(&self, target: PumpState) -> Result<(), ActuatorError> {
        let reply: CommandReply = self
            .client
            .post(&self.url)
            .json(&CommandRequest { command: target })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        reply.into_result(target)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
