//! Command history reporting to the catalog service. Purely observational:
//! callers log failures and carry on.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::config::CatalogConfig;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("catalog answered with status {0}")]
    Status(u16),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandRecord {
    #[serde(rename = "targetDeviceID")]
    pub target_device_id: String,
    #[serde(rename = "commandType")]
    pub command_type: String,
    pub parameters: Option<serde_json::Value>,
    pub status: String,
    pub timestamp: String,
}

impl CommandRecord {
    /// A completed command issued just now.
    pub fn completed(device_id: &str, command_type: &str) -> Self {
        Self {
            target_device_id: device_id.to_string(),
            command_type: command_type.to_string(),
            parameters: None,
            status: "completed".into(),
            timestamp: OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_default(),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandHistory: Send + Sync {
    async fn record(&self, record: &CommandRecord) -> Result<(), CatalogError>;
}

pub struct HttpCommandHistory {
    client: reqwest::Client,
    url: String,
}

impl HttpCommandHistory {
    pub fn new(cfg: &CatalogConfig) -> Result<Self, CatalogError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: format!("{}/commands", cfg.base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl CommandHistory for HttpCommandHistory {
    async fn record(&self, record: &CommandRecord) -> Result<(), CatalogError> {
        let status = self.client.post(&self.url).json(record).send().await?.status();
        if !status.is_success() {
            return Err(CatalogError::Status(status.as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_uses_catalog_field_names() {
        let rec = CommandRecord::completed("waterpump", "turn_on");
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["targetDeviceID"], "waterpump");
        assert_eq!(json["commandType"], "turn_on");
        assert!(json["parameters"].is_null());
        assert_eq!(json["status"], "completed");
        assert!(OffsetDateTime::parse(json["timestamp"].as_str().unwrap(), &Rfc3339).is_ok());
    }

    #[test]
    fn status_error_names_code() {
        assert_eq!(
            CatalogError::Status(503).to_string(),
            "catalog answered with status 503"
        );
    }

    #[test]
    fn url_targets_commands_endpoint() {
        let h = HttpCommandHistory::new(&CatalogConfig::default()).unwrap();
        assert_eq!(h.url, "http://127.0.0.1:8080/garden/commands");
    }
}
