//! cgminer-style JSON API over TCP, as spoken by Avalon home miners.
//!
//! Each command opens a fresh connection to port 4028, writes one JSON
//! object and reads one JSON object back. The firmware terminates the
//! response with a NUL byte (some builds use a newline instead) and then
//! closes the socket.
//!
//! Telemetry needs two commands. `summary` carries hashrate, shares and
//! uptime. `estats` carries everything hardware-related packed into a
//! single `MM ID0` string of `Key[value]` pairs:
//!
//! ```text
//! Ver[Nano3s-25021401_56abae7] ... Freq[478] TAvg[61] TMax[70] WORKMODE[1] PS[0 12000 ...]
//! ```
//!
//! Power is not reported directly; it is derived from the `PS[...]`
//! field as `raw_power_code / (millivolts / 1000)`.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};
use time::OffsetDateTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{AdapterError, AdapterResult, Delivery, DeviceAdapter};
use crate::device::{AvalonMode, Device, DeviceFamily, DeviceId, Mode, Pool};
use crate::telemetry::TelemetrySnapshot;
use crate::tracing::prelude::*;
use crate::types::{HashRate, HashUnit};

pub const API_PORT: u16 = 4028;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Responses larger than this are treated as malformed.
const MAX_RESPONSE_BYTES: usize = 64 * 1024;

/// Index of the millivolt reading inside `PS[...]`.
const PS_MILLIVOLTS: usize = 1;

/// Index of the raw power code inside `PS[...]`.
const PS_RAW_POWER: usize = 4;

/// User name the firmware expects alongside the admin password.
const ADMIN_USER: &str = "root";

static MM_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z][A-Za-z0-9_]*)\[([^\]]*)\]").expect("static regex")
});

#[derive(Debug, Clone)]
pub struct AvalonAdapter {
    timeout: Duration,
}

impl Default for AvalonAdapter {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl AvalonAdapter {
    /// `timeout` bounds connect, write and read of one command together.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn command(&self, device: &Device, command: &str, parameter: &str) -> AdapterResult<Value> {
        let port = device.port().unwrap_or(API_PORT);
        let addr = format!("{}:{}", device.address, port);

        trace!(device = %device.id, command, "Sending cgminer command");
        let raw = tokio::time::timeout(self.timeout, exchange(&addr, command, parameter))
            .await
            .map_err(|_| AdapterError::Timeout)??;

        let value = parse_response(&raw)?;
        check_status(&value)?;
        Ok(value)
    }

    fn admin_password<'a>(&self, device: &'a Device) -> AdapterResult<&'a str> {
        device.admin_password.as_deref().ok_or(AdapterError::Auth)
    }
}

async fn exchange(addr: &str, command: &str, parameter: &str) -> AdapterResult<Vec<u8>> {
    let mut stream = TcpStream::connect(addr).await?;

    let mut request = serde_json::to_vec(&json!({
        "command": command,
        "parameter": parameter,
    }))?;
    request.push(b'\n');
    stream.write_all(&request).await?;

    let mut response = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        response.extend_from_slice(&chunk[..n]);
        if let Some(end) = response.iter().position(|&b| b == 0 || b == b'\n') {
            response.truncate(end);
            break;
        }
        if response.len() > MAX_RESPONSE_BYTES {
            return Err(AdapterError::Protocol("response too large".into()));
        }
    }

    if response.is_empty() {
        return Err(AdapterError::Protocol("empty response".into()));
    }
    Ok(response)
}

fn parse_response(raw: &[u8]) -> AdapterResult<Value> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| AdapterError::Protocol(format!("non-UTF-8 response: {e}")))?
        .trim_end_matches(['\0', '\n', '\r', ' ']);

    // Some firmware emits adjacent objects inside STATS without a comma.
    let text = text.replace("}{", "},{");
    Ok(serde_json::from_str(&text)?)
}

/// Map the cgminer `STATUS` block to an error when it is not a success.
fn check_status(value: &Value) -> AdapterResult<()> {
    let status = value
        .get("STATUS")
        .and_then(|s| s.get(0))
        .ok_or_else(|| AdapterError::Protocol("missing STATUS".into()))?;

    let code = status.get("STATUS").and_then(Value::as_str).unwrap_or("");
    let msg = status.get("Msg").and_then(Value::as_str).unwrap_or("");

    match code {
        "S" | "I" => Ok(()),
        _ if msg.to_ascii_lowercase().contains("password") => Err(AdapterError::Auth),
        _ => Err(AdapterError::Rejected(msg.to_owned())),
    }
}

/// Split the `MM ID0` string into its `Key[value]` pairs.
pub fn parse_mm_fields(mm: &str) -> HashMap<&str, &str> {
    MM_FIELD
        .captures_iter(mm)
        .filter_map(|c| Some((c.get(1)?.as_str(), c.get(2)?.as_str())))
        .collect()
}

/// Derive watts from the space-separated `PS[...]` values.
pub fn power_from_ps(ps: &str) -> Option<f32> {
    let values: Vec<f32> = ps
        .split_whitespace()
        .map(str::parse)
        .collect::<Result<_, _>>()
        .ok()?;
    let millivolts = *values.get(PS_MILLIVOLTS)?;
    let raw = *values.get(PS_RAW_POWER)?;
    if millivolts <= 0.0 {
        return None;
    }
    Some(raw / (millivolts / 1000.0))
}

fn number<T: std::str::FromStr>(s: &str) -> Option<T> {
    s.split_whitespace().next()?.parse().ok()
}

/// Build a snapshot from `summary` and `estats` responses.
pub fn parse_telemetry(
    device_id: DeviceId,
    captured_at: OffsetDateTime,
    summary: &Value,
    estats: &Value,
) -> AdapterResult<TelemetrySnapshot> {
    let summary = summary
        .get("SUMMARY")
        .and_then(|s| s.get(0))
        .ok_or_else(|| AdapterError::Protocol("missing SUMMARY".into()))?;

    let mm = estats
        .get("STATS")
        .and_then(Value::as_array)
        .and_then(|stats| stats.iter().find_map(|s| s.get("MM ID0")))
        .and_then(Value::as_str)
        .ok_or_else(|| AdapterError::Protocol("missing MM ID0".into()))?;
    let fields = parse_mm_fields(mm);

    let mut snapshot = TelemetrySnapshot::new(device_id, captured_at);

    snapshot.hashrate = summary
        .get("MHS av")
        .and_then(Value::as_f64)
        .map(HashRate::from_megahashes);
    snapshot.reported_unit = snapshot.hashrate.map(|_| HashUnit::Mega);
    snapshot.shares_accepted = summary.get("Accepted").and_then(Value::as_u64).unwrap_or(0);
    snapshot.shares_rejected = summary.get("Rejected").and_then(Value::as_u64).unwrap_or(0);
    snapshot.extras.uptime_secs = summary.get("Elapsed").and_then(Value::as_u64);

    snapshot.temperature_c = ["TAvg", "TMax", "OTemp"]
        .iter()
        .find_map(|k| fields.get(k).and_then(|v| number(v)));
    snapshot.power_w = fields.get("PS").and_then(|ps| power_from_ps(ps));
    snapshot.extras.frequency_mhz = fields.get("Freq").and_then(|v| number(v));
    snapshot.extras.firmware = fields.get("Ver").map(|v| (*v).to_owned());
    snapshot.extras.mode = AvalonMode::from_estats(estats).map(Mode::Avalon);

    Ok(snapshot)
}

#[async_trait]
impl DeviceAdapter for AvalonAdapter {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::Avalon
    }

    async fn fetch_telemetry(&self, device: &Device) -> AdapterResult<TelemetrySnapshot> {
        let summary = self.command(device, "summary", "").await?;
        let estats = self.command(device, "estats", "").await?;
        parse_telemetry(
            device.id.clone(),
            OffsetDateTime::now_utc(),
            &summary,
            &estats,
        )
    }

    async fn set_mode(&self, device: &Device, mode: Mode) -> AdapterResult<()> {
        let Mode::Avalon(mode) = mode else {
            return Err(AdapterError::Unsupported(device.family));
        };
        let parameter = format!("0,workmode,set,{}", mode.workmode());
        self.command(device, "ascset", &parameter).await?;
        debug!(device = %device.id, mode = %mode, "Work mode set");
        Ok(())
    }

    async fn switch_pool(&self, device: &Device, pool: &Pool) -> AdapterResult<Delivery> {
        let password = self.admin_password(device)?;
        let parameter = format!(
            "{ADMIN_USER},{password},0,{},{},{}",
            pool.url, pool.user, pool.password
        );
        self.command(device, "setpool", &parameter).await?;
        Ok(Delivery::Confirmed)
    }

    async fn restart(&self, device: &Device) -> AdapterResult<()> {
        self.command(device, "ascset", "0,reboot,0").await?;
        Ok(())
    }
}

impl AvalonMode {
    /// Read the active work mode back out of an `estats` response.
    pub fn from_estats(estats: &Value) -> Option<Self> {
        let mm = estats
            .get("STATS")?
            .as_array()?
            .iter()
            .find_map(|s| s.get("MM ID0"))?
            .as_str()?;
        parse_mm_fields(mm)
            .get("WORKMODE")
            .and_then(|v| number(v))
            .and_then(AvalonMode::from_workmode)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use time::macros::datetime;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    use super::*;
    use crate::device::{Coin, PoolId};

    const MM: &str = "Ver[Nano3s-25021401_56abae7] LVer[25021401] Freq[478] \
        TAvg[61] TMax[70] WORKMODE[2] PS[0 12000 12480 64 1680 12470 1690]";

    fn summary() -> Value {
        json!({
            "STATUS": [{"STATUS": "S", "Msg": "Summary"}],
            "SUMMARY": [{"Elapsed": 3600, "MHS av": 6_000_000.0, "Accepted": 120, "Rejected": 2}]
        })
    }

    fn estats() -> Value {
        json!({
            "STATUS": [{"STATUS": "S", "Msg": "CGMiner stats"}],
            "STATS": [{"STATS": 0, "ID": "AVALON0", "MM ID0": MM}]
        })
    }

    #[test]
    fn power_formula() {
        // 1680 / (12000 / 1000) = 140 W
        assert_eq!(power_from_ps("0 12000 12480 64 1680 12470 1690"), Some(140.0));
    }

    #[test]
    fn power_missing_or_zero_voltage() {
        assert_eq!(power_from_ps("0 0 0 0 1680"), None);
        assert_eq!(power_from_ps("0 12000"), None);
        assert_eq!(power_from_ps("garbage"), None);
    }

    #[test]
    fn mm_fields_are_split() {
        let fields = parse_mm_fields(MM);
        assert_eq!(fields.get("Freq"), Some(&"478"));
        assert_eq!(fields.get("WORKMODE"), Some(&"2"));
        assert_eq!(fields.get("PS"), Some(&"0 12000 12480 64 1680 12470 1690"));
    }

    #[test]
    fn telemetry_is_normalized() {
        let at = datetime!(2025-01-10 12:00 UTC);
        let snap = parse_telemetry(DeviceId::new("nano"), at, &summary(), &estats()).unwrap();

        assert_eq!(snap.hashrate, Some(HashRate::from_terahashes(6.0)));
        assert_eq!(snap.reported_unit, Some(HashUnit::Mega));
        assert_eq!(snap.temperature_c, Some(61.0));
        assert_eq!(snap.power_w, Some(140.0));
        assert_eq!(snap.shares_accepted, 120);
        assert_eq!(snap.shares_rejected, 2);
        assert_eq!(snap.extras.frequency_mhz, Some(478.0));
        assert_eq!(snap.extras.uptime_secs, Some(3600));
        assert_eq!(snap.extras.mode, Some(Mode::Avalon(AvalonMode::High)));
    }

    #[test]
    fn missing_mm_is_protocol_error() {
        let at = datetime!(2025-01-10 12:00 UTC);
        let estats = json!({"STATUS": [{"STATUS": "S"}], "STATS": [{}]});
        let err = parse_telemetry(DeviceId::new("nano"), at, &summary(), &estats).unwrap_err();
        assert!(matches!(err, AdapterError::Protocol(_)));
    }

    #[test]
    fn concatenated_objects_are_repaired() {
        let raw = br#"{"STATUS":[{"STATUS":"S"}],"STATS":[{"a":1}{"b":2}]}"#;
        let value = parse_response(raw).unwrap();
        assert_eq!(value["STATS"].as_array().unwrap().len(), 2);
    }

    /// Fake cgminer: answers each connection from `respond` and records
    /// every request it receives.
    async fn serve(
        respond: fn(&Value) -> Value,
    ) -> (Device, Arc<Mutex<Vec<Value>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = seen.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let (read, mut write) = stream.into_split();
                let mut line = String::new();
                BufReader::new(read).read_line(&mut line).await.unwrap();
                let request: Value = serde_json::from_str(&line).unwrap();
                let mut reply = serde_json::to_vec(&respond(&request)).unwrap();
                log.lock().push(request);
                reply.push(0);
                write.write_all(&reply).await.unwrap();
            }
        });

        let mut device = Device::new("nano", DeviceFamily::Avalon, "127.0.0.1");
        device.port = Some(port);
        device.admin_password = Some("secret".into());
        (device, seen)
    }

    fn cgminer(request: &Value) -> Value {
        match request["command"].as_str().unwrap() {
            "summary" => summary(),
            "estats" => estats(),
            "setpool" if !request["parameter"].as_str().unwrap().contains(",secret,") => {
                json!({"STATUS": [{"STATUS": "E", "Msg": "Wrong password"}]})
            }
            _ => json!({"STATUS": [{"STATUS": "I", "Msg": "ASC 0 set info"}]}),
        }
    }

    fn pool() -> Pool {
        Pool {
            id: PoolId::new("dgb"),
            name: "DGB".into(),
            url: "stratum+tcp://dgb.example:3333".into(),
            user: "wallet.nano".into(),
            password: "x".into(),
            coin: Coin::ticker("DGB"),
        }
    }

    #[tokio::test]
    async fn fetch_over_tcp() {
        let (device, seen) = serve(cgminer).await;
        let snap = AvalonAdapter::default().fetch_telemetry(&device).await.unwrap();
        assert_eq!(snap.power_w, Some(140.0));

        let commands: Vec<_> = seen.lock().iter().map(|r| r["command"].clone()).collect();
        assert_eq!(commands, vec![json!("summary"), json!("estats")]);
    }

    #[tokio::test]
    async fn set_mode_sends_workmode() {
        let (device, seen) = serve(cgminer).await;
        AvalonAdapter::default()
            .set_mode(&device, Mode::Avalon(AvalonMode::Low))
            .await
            .unwrap();
        let request = seen.lock()[0].clone();
        assert_eq!(request, json!({"command": "ascset", "parameter": "0,workmode,set,0"}));
    }

    #[tokio::test]
    async fn pool_switch_with_wrong_password_is_auth() {
        let (mut device, _) = serve(cgminer).await;
        let adapter = AvalonAdapter::default();
        assert_eq!(
            adapter.switch_pool(&device, &pool()).await,
            Ok(Delivery::Confirmed)
        );

        device.admin_password = Some("wrong".into());
        assert_eq!(
            adapter.switch_pool(&device, &pool()).await,
            Err(AdapterError::Auth)
        );
    }

    #[tokio::test]
    async fn silent_device_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });

        let mut device = Device::new("nano", DeviceFamily::Avalon, "127.0.0.1");
        device.port = Some(port);
        let adapter = AvalonAdapter::new(Duration::from_millis(100));
        assert_eq!(
            adapter.fetch_telemetry(&device).await.unwrap_err(),
            AdapterError::Timeout
        );
    }

    #[tokio::test]
    async fn refused_connection_is_io() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut device = Device::new("nano", DeviceFamily::Avalon, "127.0.0.1");
        device.port = Some(port);
        let err = AvalonAdapter::default().restart(&device).await.unwrap_err();
        assert!(matches!(err, AdapterError::Io(_)));
    }
}
