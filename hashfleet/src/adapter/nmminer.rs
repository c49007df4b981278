//! NMMiner UDP status broadcasts.
//!
//! NMMiner boards cannot be polled. Each one broadcasts a JSON status
//! datagram to UDP 12345 every few seconds, and accepts configuration
//! pushes as JSON datagrams on UDP 12347. A single [`UdpListener`] task
//! receives every broadcast and keeps the freshest packet per source IP
//! in a [`PacketCache`]; [`NmMinerAdapter::fetch_telemetry`] reads from
//! that cache instead of talking to the device.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize};
use time::OffsetDateTime;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::{AdapterError, AdapterResult, Delivery, DeviceAdapter};
use crate::device::{Device, DeviceFamily, DeviceId, Pool};
use crate::telemetry::{TelemetrySnapshot, TelemetryStore};
use crate::tracing::prelude::*;
use crate::types::{Difficulty, HashRate};

pub const TELEMETRY_PORT: u16 = 12345;
pub const CONFIG_PORT: u16 = 12347;

/// Packets older than this are no evidence the device is alive.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(90);

const MAX_DATAGRAM: usize = 2048;

/// One status broadcast. Field names follow the firmware; numeric fields
/// arrive as strings on some versions and as numbers on others.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StatusPacket {
    #[serde(rename = "HashRate", default)]
    pub hashrate: Option<String>,
    #[serde(rename = "Temp", default, deserialize_with = "lenient_f32")]
    pub temperature: Option<f32>,
    /// `"accepted/rejected[/...]"`
    #[serde(rename = "Share", default)]
    pub share: Option<String>,
    #[serde(rename = "BestDiff", default)]
    pub best_diff: Option<String>,
    #[serde(rename = "RSSI", default, deserialize_with = "lenient_f32")]
    pub rssi: Option<f32>,
    #[serde(rename = "Version", default)]
    pub version: Option<String>,
    #[serde(rename = "PoolInUse", default)]
    pub pool_in_use: Option<String>,
}

fn lenient_f32<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f32>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Lenient {
        Number(f32),
        Text(String),
    }
    Ok(match Option::<Lenient>::deserialize(d)? {
        Some(Lenient::Number(n)) => Some(n),
        Some(Lenient::Text(s)) => s.trim().trim_end_matches(['C', '°']).trim().parse().ok(),
        None => None,
    })
}

impl StatusPacket {
    pub fn to_snapshot(&self, device_id: DeviceId, captured_at: OffsetDateTime) -> TelemetrySnapshot {
        let mut snapshot = TelemetrySnapshot::new(device_id, captured_at);

        if let Some(Ok((rate, unit))) = self.hashrate.as_deref().map(HashRate::parse_reported) {
            snapshot.hashrate = Some(rate);
            snapshot.reported_unit = Some(unit);
        }
        snapshot.temperature_c = self.temperature;

        if let Some(share) = &self.share {
            let mut parts = share.split('/').map(|p| p.trim().parse::<u64>().ok());
            snapshot.shares_accepted = parts.next().flatten().unwrap_or(0);
            snapshot.shares_rejected = parts.next().flatten().unwrap_or(0);
        }

        snapshot.extras.best_difficulty = self
            .best_diff
            .as_deref()
            .and_then(|d| d.parse::<Difficulty>().ok());
        snapshot.extras.wifi_rssi = self.rssi.map(|r| r as i32);
        snapshot.extras.firmware = self.version.clone();
        snapshot.extras.pool_url = self.pool_in_use.clone();
        snapshot
    }
}

#[derive(Debug, Clone)]
pub struct Received {
    pub at: OffsetDateTime,
    pub packet: StatusPacket,
}

/// Freshest packet per source address, shared by listener and adapter.
#[derive(Debug, Clone, Default)]
pub struct PacketCache {
    inner: Arc<RwLock<HashMap<IpAddr, Received>>>,
}

impl PacketCache {
    pub fn insert(&self, source: IpAddr, at: OffsetDateTime, packet: StatusPacket) {
        let mut inner = self.inner.write();
        let newer = inner.get(&source).is_none_or(|r| at >= r.at);
        if newer {
            inner.insert(source, Received { at, packet });
        }
    }

    pub fn get(&self, source: &IpAddr) -> Option<Received> {
        self.inner.read().get(source).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Devices whose broadcasts are also written straight into the store.
struct PassiveSink {
    store: Arc<TelemetryStore>,
    devices: HashMap<IpAddr, DeviceId>,
}

/// Background receiver for status broadcasts.
pub struct UdpListener {
    socket: UdpSocket,
    cache: PacketCache,
    sink: Option<PassiveSink>,
}

impl UdpListener {
    pub async fn bind(addr: SocketAddr, cache: PacketCache) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            cache,
            sink: None,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Also record packets from known devices into `store` as they arrive.
    pub fn with_store(mut self, store: Arc<TelemetryStore>, devices: HashMap<IpAddr, DeviceId>) -> Self {
        self.sink = Some(PassiveSink { store, devices });
        self
    }

    pub async fn run(self, cancellation: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        info!(addr = ?self.socket.local_addr().ok(), "UDP status listener started");

        loop {
            let (len, from) = tokio::select! {
                _ = cancellation.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "UDP receive failed");
                        continue;
                    }
                },
            };

            let packet: StatusPacket = match serde_json::from_slice(&buf[..len]) {
                Ok(p) => p,
                Err(e) => {
                    debug!(source = %from, error = %e, "Ignoring malformed status datagram");
                    continue;
                }
            };

            let now = OffsetDateTime::now_utc();
            trace!(source = %from, hashrate = ?packet.hashrate, "Status datagram");

            if let Some(sink) = &self.sink {
                if let Some(id) = sink.devices.get(&from.ip()) {
                    sink.store.record_passive(packet.to_snapshot(id.clone(), now));
                }
            }
            self.cache.insert(from.ip(), now, packet);
        }

        debug!("UDP status listener stopped");
    }
}

/// Pool configuration datagram sent to port 12347.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolPush {
    /// Target device IP, or `"all"` for a broadcast.
    pub ip: String,
    #[serde(rename = "PrimaryPool")]
    pub url: String,
    #[serde(rename = "PrimaryAddress")]
    pub user: String,
    #[serde(rename = "PrimaryPassword")]
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct NmMinerAdapter {
    cache: PacketCache,
    max_age: Duration,
    config_port: u16,
    broadcast_addr: IpAddr,
}

impl NmMinerAdapter {
    pub fn new(cache: PacketCache) -> Self {
        Self {
            cache,
            max_age: DEFAULT_MAX_AGE,
            config_port: CONFIG_PORT,
            broadcast_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    /// Send family-wide pushes to `addr:port` instead of the limited
    /// broadcast address on 12347. `addr` may be a subnet broadcast such
    /// as `192.168.1.255`. Unicast pushes still go to the device IP on
    /// `port`.
    pub fn with_config_target(mut self, addr: IpAddr, port: u16) -> Self {
        self.broadcast_addr = addr;
        self.config_port = port;
        self
    }

    fn device_ip(device: &Device) -> AdapterResult<IpAddr> {
        device
            .address
            .parse()
            .map_err(|_| AdapterError::Rejected(format!("not an IP address: {}", device.address)))
    }

    /// `broadcast` enables `SO_BROADCAST`, needed for limited and subnet
    /// broadcast targets alike.
    async fn push(&self, target: IpAddr, message: &PoolPush, broadcast: bool) -> AdapterResult<()> {
        let bind: SocketAddr = match target {
            IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            IpAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind).await?;
        if broadcast {
            socket.set_broadcast(true)?;
        }
        let payload = serde_json::to_vec(message)?;
        socket.send_to(&payload, (target, self.config_port)).await?;
        Ok(())
    }
}

#[async_trait]
impl DeviceAdapter for NmMinerAdapter {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::NmMiner
    }

    async fn fetch_telemetry(&self, device: &Device) -> AdapterResult<TelemetrySnapshot> {
        let ip = Self::device_ip(device)?;
        let received = self.cache.get(&ip).ok_or(AdapterError::NoData)?;

        let age = OffsetDateTime::now_utc() - received.at;
        if age > self.max_age {
            return Err(AdapterError::NoData);
        }
        Ok(received.packet.to_snapshot(device.id.clone(), received.at))
    }

    async fn switch_pool(&self, device: &Device, pool: &Pool) -> AdapterResult<Delivery> {
        let ip = Self::device_ip(device)?;
        let message = PoolPush {
            ip: ip.to_string(),
            url: pool.url.clone(),
            user: pool.user.clone(),
            password: pool.password.clone(),
        };
        self.push(ip, &message, false).await?;
        Ok(Delivery::Sent)
    }

    /// Reconfigure every NMMiner on the segment with one datagram.
    async fn broadcast_pool(&self, pool: &Pool) -> AdapterResult<Delivery> {
        let message = PoolPush {
            ip: "all".to_owned(),
            url: pool.url.clone(),
            user: pool.user.clone(),
            password: pool.password.clone(),
        };
        self.push(self.broadcast_addr, &message, true).await?;
        info!(pool = %pool.id, "Pool broadcast to all NMMiner devices");
        Ok(Delivery::Sent)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use serde_json::json;
    use time::macros::datetime;

    use super::*;
    use crate::device::{AvalonMode, Coin, Mode, PoolId};
    use crate::types::HashUnit;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn packet_json() -> serde_json::Value {
        json!({
            "ip": "127.0.0.1",
            "HashRate": "1.01MH/s",
            "Temp": "45.5",
            "Share": "1085/3/99.7%",
            "BestDiff": "2.45M",
            "RSSI": -61,
            "Version": "v1.8.2",
            "PoolInUse": "stratum+tcp://public-pool.io:21496"
        })
    }

    fn pool() -> Pool {
        Pool {
            id: PoolId::new("dgb"),
            name: "DGB".into(),
            url: "stratum+tcp://dgb.example:3333".into(),
            user: "wallet.nm".into(),
            password: "x".into(),
            coin: Coin::ticker("DGB"),
        }
    }

    #[test]
    fn packet_to_snapshot() {
        let packet: StatusPacket = serde_json::from_value(packet_json()).unwrap();
        let at = datetime!(2025-01-10 12:00 UTC);
        let snap = packet.to_snapshot(DeviceId::new("nm"), at);

        assert_eq!(snap.reported_unit, Some(HashUnit::Mega));
        assert_eq!(snap.hashrate, Some(HashRate::new(1.01, HashUnit::Mega)));
        assert_eq!(snap.temperature_c, Some(45.5));
        assert_eq!(snap.shares_accepted, 1085);
        assert_eq!(snap.shares_rejected, 3);
        assert_eq!(snap.extras.wifi_rssi, Some(-61));
        assert_eq!(snap.captured_at, at);
        assert_eq!(snap.power_w, None);
    }

    #[test]
    fn numeric_temperature_accepted() {
        let packet: StatusPacket = serde_json::from_value(json!({"Temp": 51.0})).unwrap();
        assert_eq!(packet.temperature, Some(51.0));
    }

    #[tokio::test]
    async fn no_packet_is_no_data() {
        let adapter = NmMinerAdapter::new(PacketCache::default());
        let device = Device::new("nm", DeviceFamily::NmMiner, "10.0.0.44");
        assert_eq!(
            adapter.fetch_telemetry(&device).await.unwrap_err(),
            AdapterError::NoData
        );
    }

    #[tokio::test]
    async fn old_packet_is_no_data() {
        let cache = PacketCache::default();
        let ip: IpAddr = "10.0.0.44".parse().unwrap();
        let old = OffsetDateTime::now_utc() - time::Duration::minutes(10);
        cache.insert(ip, old, StatusPacket::default());

        let adapter = NmMinerAdapter::new(cache).with_max_age(Duration::from_secs(60));
        let device = Device::new("nm", DeviceFamily::NmMiner, "10.0.0.44");
        assert_eq!(
            adapter.fetch_telemetry(&device).await.unwrap_err(),
            AdapterError::NoData
        );
    }

    #[tokio::test]
    async fn listener_caches_by_source_and_feeds_store() {
        let cache = PacketCache::default();
        let store = Arc::new(TelemetryStore::new(3, Duration::from_secs(90)));
        let devices = HashMap::from([(LOCALHOST, DeviceId::new("nm"))]);
        let listener = UdpListener::bind((LOCALHOST, 0).into(), cache.clone())
            .await
            .unwrap()
            .with_store(store.clone(), devices);
        let addr = listener.local_addr().unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(listener.run(cancel.clone()));

        let sender = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
        sender.send_to(b"not json", addr).await.unwrap();
        let payload = serde_json::to_vec(&packet_json()).unwrap();
        sender.send_to(&payload, addr).await.unwrap();

        for _ in 0..100 {
            if !cache.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let adapter = NmMinerAdapter::new(cache);
        let device = Device::new("nm", DeviceFamily::NmMiner, "127.0.0.1");
        let snap = adapter.fetch_telemetry(&device).await.unwrap();
        assert_eq!(snap.shares_accepted, 1085);
        assert!(store.latest(&DeviceId::new("nm")).is_some());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn pool_push_is_sent_not_confirmed() {
        let receiver = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
        let port = receiver.local_addr().unwrap().port();
        let adapter =
            NmMinerAdapter::new(PacketCache::default()).with_config_target(LOCALHOST, port);
        let device = Device::new("nm", DeviceFamily::NmMiner, "127.0.0.1");

        assert_eq!(
            adapter.switch_pool(&device, &pool()).await,
            Ok(Delivery::Sent)
        );

        let mut buf = [0u8; 512];
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        let push: PoolPush = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(push.ip, "127.0.0.1");
        assert_eq!(push.url, "stratum+tcp://dgb.example:3333");
    }

    #[tokio::test]
    async fn broadcast_targets_all() {
        let receiver = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
        let port = receiver.local_addr().unwrap().port();
        let adapter =
            NmMinerAdapter::new(PacketCache::default()).with_config_target(LOCALHOST, port);

        assert_eq!(adapter.broadcast_pool(&pool()).await, Ok(Delivery::Sent));

        let mut buf = [0u8; 512];
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        let push: PoolPush = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(push.ip, "all");
    }

    #[tokio::test]
    async fn subnet_broadcast_target_is_allowed() {
        let receiver = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.unwrap();
        let port = receiver.local_addr().unwrap().port();
        let subnet = IpAddr::V4(Ipv4Addr::new(127, 255, 255, 255));
        let adapter = NmMinerAdapter::new(PacketCache::default()).with_config_target(subnet, port);

        assert_eq!(adapter.broadcast_pool(&pool()).await, Ok(Delivery::Sent));
    }

    #[tokio::test]
    async fn tuning_and_restart_unsupported() {
        let adapter = NmMinerAdapter::new(PacketCache::default());
        let device = Device::new("nm", DeviceFamily::NmMiner, "127.0.0.1");
        assert_eq!(
            adapter.set_mode(&device, Mode::Avalon(AvalonMode::Low)).await,
            Err(AdapterError::Unsupported(DeviceFamily::NmMiner))
        );
        assert_eq!(
            adapter.restart(&device).await,
            Err(AdapterError::Unsupported(DeviceFamily::NmMiner))
        );
    }
}
