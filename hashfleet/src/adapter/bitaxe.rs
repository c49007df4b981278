//! AxeOS REST API (Bitaxe, NerdQAxe and other ESP-Miner boards).
//!
//! `GET /api/system/info` returns one flat JSON object with everything we
//! need. Settings are written with `PATCH /api/system` and take effect
//! immediately; `POST /api/system/restart` reboots the board.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;

use super::{AdapterError, AdapterResult, Delivery, DeviceAdapter};
use crate::device::{BitaxeMode, Device, DeviceFamily, DeviceId, Mode, Pool};
use crate::telemetry::TelemetrySnapshot;
use crate::tracing::prelude::*;
use crate::types::{Difficulty, HashRate, HashUnit};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Subset of `/api/system/info` that we read.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    /// GH/s
    pub hash_rate: Option<f64>,
    pub temp: Option<f32>,
    /// W
    pub power: Option<f32>,
    pub frequency: Option<f32>,
    /// Requested core voltage, mV
    pub core_voltage: Option<f32>,
    #[serde(default)]
    pub shares_accepted: u64,
    #[serde(default)]
    pub shares_rejected: u64,
    /// Formatted, e.g. `"4.29G"`
    pub best_diff: Option<String>,
    pub uptime_seconds: Option<u64>,
    #[serde(rename = "wifiRSSI")]
    pub wifi_rssi: Option<i32>,
    pub version: Option<String>,
    #[serde(rename = "stratumURL")]
    pub stratum_url: Option<String>,
    pub stratum_port: Option<u16>,
}

impl SystemInfo {
    pub fn into_snapshot(self, device_id: DeviceId, captured_at: OffsetDateTime) -> TelemetrySnapshot {
        let mut snapshot = TelemetrySnapshot::new(device_id, captured_at);
        snapshot.hashrate = self.hash_rate.map(HashRate::from_gigahashes);
        snapshot.reported_unit = self.hash_rate.map(|_| HashUnit::Giga);
        snapshot.temperature_c = self.temp;
        snapshot.power_w = self.power;
        snapshot.shares_accepted = self.shares_accepted;
        snapshot.shares_rejected = self.shares_rejected;

        let extras = &mut snapshot.extras;
        extras.frequency_mhz = self.frequency;
        extras.core_voltage_mv = self.core_voltage;
        extras.mode = match (self.frequency, self.core_voltage) {
            (Some(f), Some(v)) => {
                BitaxeMode::from_settings(f.round() as u32, v.round() as u32).map(Mode::Bitaxe)
            }
            _ => None,
        };
        extras.firmware = self.version;
        extras.best_difficulty = self.best_diff.and_then(|d| d.parse::<Difficulty>().ok());
        extras.uptime_secs = self.uptime_seconds;
        extras.wifi_rssi = self.wifi_rssi;
        extras.pool_url = match (self.stratum_url, self.stratum_port) {
            (Some(host), Some(port)) => Some(format!("stratum+tcp://{host}:{port}")),
            (Some(host), None) => Some(host),
            _ => None,
        };
        snapshot
    }
}

#[derive(Debug, Clone)]
pub struct BitaxeAdapter {
    client: Client,
}

impl BitaxeAdapter {
    pub fn new(timeout: Duration) -> crate::error::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| crate::error::Error::Other(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    fn url(device: &Device, path: &str) -> String {
        match device.port() {
            Some(80) | None => format!("http://{}{path}", device.address),
            Some(port) => format!("http://{}:{port}{path}", device.address),
        }
    }

    async fn patch_system(&self, device: &Device, body: serde_json::Value) -> AdapterResult<()> {
        let response = self
            .client
            .patch(Self::url(device, "/api/system"))
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest)?;
        check_status(response).await
    }
}

fn map_reqwest(e: reqwest::Error) -> AdapterError {
    if e.is_timeout() {
        AdapterError::Timeout
    } else if e.is_decode() {
        AdapterError::Protocol(e.to_string())
    } else {
        AdapterError::Io(e.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> AdapterResult<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AdapterError::Auth),
        s if s.is_client_error() => Err(AdapterError::Rejected(format!("{s}: {body}"))),
        s => Err(AdapterError::Protocol(format!("{s}: {body}"))),
    }
}

#[async_trait]
impl DeviceAdapter for BitaxeAdapter {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::Bitaxe
    }

    async fn fetch_telemetry(&self, device: &Device) -> AdapterResult<TelemetrySnapshot> {
        let response = self
            .client
            .get(Self::url(device, "/api/system/info"))
            .send()
            .await
            .map_err(map_reqwest)?;

        if !response.status().is_success() {
            return Err(AdapterError::Protocol(format!(
                "system info returned {}",
                response.status()
            )));
        }

        let info: SystemInfo = response.json().await.map_err(map_reqwest)?;
        Ok(info.into_snapshot(device.id.clone(), OffsetDateTime::now_utc()))
    }

    async fn set_mode(&self, device: &Device, mode: Mode) -> AdapterResult<()> {
        let Mode::Bitaxe(mode) = mode else {
            return Err(AdapterError::Unsupported(device.family));
        };
        let (frequency, core_voltage) = mode.preset();
        self.patch_system(
            device,
            json!({ "frequency": frequency, "coreVoltage": core_voltage }),
        )
        .await?;
        debug!(device = %device.id, mode = %mode, frequency, core_voltage, "Preset applied");
        Ok(())
    }

    async fn switch_pool(&self, device: &Device, pool: &Pool) -> AdapterResult<Delivery> {
        let (host, port) = pool
            .host_port()
            .ok_or_else(|| AdapterError::Rejected(format!("pool URL without port: {}", pool.url)))?;
        self.patch_system(
            device,
            json!({
                "stratumURL": host,
                "stratumPort": port,
                "stratumUser": pool.user,
                "stratumPassword": pool.password,
            }),
        )
        .await?;
        Ok(Delivery::Confirmed)
    }

    async fn restart(&self, device: &Device) -> AdapterResult<()> {
        let response = self
            .client
            .post(Self::url(device, "/api/system/restart"))
            .send()
            .await
            .map_err(map_reqwest)?;
        check_status(response).await
    }
}

#[cfg(test)]
mod tests {
    use mockito::{Matcher, Server, ServerGuard};

    use super::*;
    use crate::device::{Coin, PoolId};

    fn device_for(server: &ServerGuard) -> Device {
        let addr = server.socket_address();
        let mut device = Device::new("gamma", DeviceFamily::Bitaxe, addr.ip().to_string());
        device.port = Some(addr.port());
        device
    }

    fn adapter() -> BitaxeAdapter {
        BitaxeAdapter::new(Duration::from_secs(2)).unwrap()
    }

    const INFO: &str = r#"{
        "power": 14.9, "voltage": 5087, "current": 2937, "temp": 58.25,
        "hashRate": 1190.4, "bestDiff": "4.29G", "coreVoltage": 1166,
        "frequency": 490, "sharesAccepted": 5120, "sharesRejected": 7,
        "uptimeSeconds": 86400, "wifiRSSI": -57, "version": "v2.4.1",
        "stratumURL": "public-pool.io", "stratumPort": 21496,
        "stratumUser": "bc1q.gamma"
    }"#;

    #[tokio::test]
    async fn fetch_normalizes_gigahashes() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/system/info")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(INFO)
            .create_async()
            .await;

        let snap = adapter().fetch_telemetry(&device_for(&server)).await.unwrap();

        assert_eq!(snap.hashrate, Some(HashRate::from_gigahashes(1190.4)));
        assert_eq!(snap.reported_unit, Some(HashUnit::Giga));
        assert_eq!(snap.power_w, Some(14.9));
        assert_eq!(snap.temperature_c, Some(58.25));
        assert_eq!(snap.shares_accepted, 5120);
        assert_eq!(snap.extras.core_voltage_mv, Some(1166.0));
        assert_eq!(snap.extras.mode, Some(Mode::Bitaxe(BitaxeMode::Standard)));
        assert_eq!(snap.extras.wifi_rssi, Some(-57));
        assert_eq!(
            snap.extras.pool_url.as_deref(),
            Some("stratum+tcp://public-pool.io:21496")
        );
        assert!(snap.extras.best_difficulty.is_some());
        mock.assert_async().await;
    }

    #[test]
    fn custom_settings_map_to_no_mode() {
        let mut info: SystemInfo = serde_json::from_str(INFO).unwrap();
        info.frequency = Some(510.0);
        let snap = info.into_snapshot(DeviceId::new("gamma"), OffsetDateTime::UNIX_EPOCH);
        assert_eq!(snap.extras.mode, None);
        assert_eq!(snap.extras.frequency_mhz, Some(510.0));
    }

    #[tokio::test]
    async fn garbage_body_is_protocol_error() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/system/info")
            .with_status(200)
            .with_body("<html>captive portal</html>")
            .create_async()
            .await;

        let err = adapter().fetch_telemetry(&device_for(&server)).await.unwrap_err();
        assert!(matches!(err, AdapterError::Protocol(_)), "{err:?}");
    }

    #[tokio::test]
    async fn mode_patches_frequency_and_voltage() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PATCH", "/api/system")
            .match_body(Matcher::Json(json!({"frequency": 525, "coreVoltage": 1200})))
            .with_status(200)
            .create_async()
            .await;

        adapter()
            .set_mode(&device_for(&server), Mode::Bitaxe(BitaxeMode::Turbo))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn pool_switch_patches_stratum_fields() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PATCH", "/api/system")
            .match_body(Matcher::Json(json!({
                "stratumURL": "dgb.example",
                "stratumPort": 3333,
                "stratumUser": "wallet.gamma",
                "stratumPassword": "x",
            })))
            .with_status(200)
            .create_async()
            .await;

        let pool = Pool {
            id: PoolId::new("dgb"),
            name: "DGB".into(),
            url: "stratum+tcp://dgb.example:3333".into(),
            user: "wallet.gamma".into(),
            password: "x".into(),
            coin: Coin::ticker("DGB"),
        };
        let delivery = adapter()
            .switch_pool(&device_for(&server), &pool)
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::Confirmed);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn bad_request_is_rejected() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/api/system/restart")
            .with_status(400)
            .with_body("busy")
            .create_async()
            .await;

        let err = adapter().restart(&device_for(&server)).await.unwrap_err();
        assert!(matches!(err, AdapterError::Rejected(_)));
        assert!(!err.is_transient());
    }
}
