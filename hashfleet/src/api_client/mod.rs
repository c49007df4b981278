//! HTTP client for the status API.

pub mod types;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

use types::{AuditState, DeviceState, FleetState, RuleState, TransitionState};

/// Default daemon address.
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:7790";

#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}/api/v0{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url}"))?;
        response
            .json()
            .await
            .with_context(|| format!("decoding {url}"))
    }

    pub async fn get_fleet(&self) -> Result<FleetState> {
        self.get("/fleet").await
    }

    pub async fn get_devices(&self) -> Result<Vec<DeviceState>> {
        self.get("/devices").await
    }

    pub async fn get_device(&self, id: &str) -> Result<DeviceState> {
        self.get(&format!("/devices/{id}")).await
    }

    pub async fn get_transitions(&self) -> Result<Vec<TransitionState>> {
        self.get("/strategy/transitions").await
    }

    pub async fn get_rules(&self) -> Result<Vec<RuleState>> {
        self.get("/rules").await
    }

    pub async fn get_audit(&self) -> Result<Vec<AuditState>> {
        self.get("/audit").await
    }
}
