//! Fleet configuration model: devices, pools, coins and power modes.
//!
//! These types are owned by the management surface and read-only to the
//! controller core; they arrive through [`crate::persistence`].

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Stable device identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Device families, one per management protocol.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    EnumString,
    EnumIter,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeviceFamily {
    /// cgminer-style JSON over TCP (Avalon Nano and friends).
    Avalon,
    /// AxeOS REST API (Bitaxe, NerdQAxe).
    Bitaxe,
    /// NMMiner UDP status broadcasts.
    NmMiner,
}

impl DeviceFamily {
    /// What the protocol can do at all. Individual devices may narrow this.
    pub fn capabilities(self) -> Capabilities {
        match self {
            DeviceFamily::Avalon => {
                Capabilities::POOL_SWITCH | Capabilities::TUNING | Capabilities::RESTART
            }
            DeviceFamily::Bitaxe => {
                Capabilities::POOL_SWITCH | Capabilities::TUNING | Capabilities::RESTART
            }
            DeviceFamily::NmMiner => Capabilities::POOL_SWITCH | Capabilities::POOL_BROADCAST,
        }
    }

    pub fn default_port(self) -> Option<u16> {
        match self {
            DeviceFamily::Avalon => Some(crate::adapter::avalon::API_PORT),
            DeviceFamily::Bitaxe => Some(80),
            DeviceFamily::NmMiner => None,
        }
    }
}

bitflags! {
    /// Optional operations a device supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Capabilities: u8 {
        const POOL_SWITCH = 1 << 0;
        const TUNING = 1 << 1;
        const RESTART = 1 << 2;
        /// One datagram reconfigures every device of the family.
        const POOL_BROADCAST = 1 << 3;
    }
}

/// A managed mining device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    #[serde(default)]
    pub name: String,
    pub family: DeviceFamily,
    /// Hostname or IP address.
    pub address: String,
    /// Overrides the family's default port.
    #[serde(default)]
    pub port: Option<u16>,
    /// Admin password for families that guard configuration writes.
    #[serde(default)]
    pub admin_password: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Narrows the family capabilities; cannot widen them.
    #[serde(default)]
    pub capabilities: Option<Capabilities>,
}

fn default_enabled() -> bool {
    true
}

impl Device {
    pub fn new(id: impl Into<String>, family: DeviceFamily, address: impl Into<String>) -> Self {
        Self {
            id: DeviceId::new(id),
            name: String::new(),
            family,
            address: address.into(),
            port: None,
            admin_password: None,
            enabled: true,
            capabilities: None,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        let family = self.family.capabilities();
        match self.capabilities {
            Some(narrowed) => family & narrowed,
            None => family,
        }
    }

    pub fn supports(&self, capability: Capabilities) -> bool {
        self.capabilities().contains(capability)
    }

    pub fn port(&self) -> Option<u16> {
        self.port.or(self.family.default_port())
    }

    /// Name for logs: the friendly name when set, else the id.
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            self.id.as_str()
        } else {
            &self.name
        }
    }
}

/// Coin a band mines, or the `OFF` sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Coin {
    Off,
    Ticker(String),
}

impl Coin {
    pub fn ticker(t: &str) -> Self {
        Coin::from(t.to_owned())
    }

    pub fn is_off(&self) -> bool {
        matches!(self, Coin::Off)
    }
}

impl From<String> for Coin {
    fn from(s: String) -> Self {
        let upper = s.trim().to_ascii_uppercase();
        if upper == "OFF" {
            Coin::Off
        } else {
            Coin::Ticker(upper)
        }
    }
}

impl From<Coin> for String {
    fn from(coin: Coin) -> Self {
        coin.to_string()
    }
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Coin::Off => f.write_str("OFF"),
            Coin::Ticker(t) => f.write_str(t),
        }
    }
}

/// Stable pool identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PoolId(String);

impl PoolId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A mining pool endpoint with the credentials used on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub id: PoolId,
    pub name: String,
    /// `stratum+tcp://host:port`
    pub url: String,
    /// Worker name or wallet address.
    pub user: String,
    #[serde(default = "default_pool_password")]
    pub password: String,
    pub coin: Coin,
}

fn default_pool_password() -> String {
    "x".to_owned()
}

impl Pool {
    /// Host and port split out of the stratum URL.
    pub fn host_port(&self) -> Option<(&str, u16)> {
        let rest = self
            .url
            .strip_prefix("stratum+tcp://")
            .or_else(|| self.url.strip_prefix("stratum://"))
            .or_else(|| self.url.strip_prefix("tcp://"))
            .unwrap_or(&self.url);
        let (host, port) = rest.rsplit_once(':')?;
        Some((host, port.trim_end_matches('/').parse().ok()?))
    }
}

/// Work modes of the Avalon family (`ascset|0,workmode,set,N`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AvalonMode {
    Low,
    Mid,
    High,
}

impl AvalonMode {
    pub fn workmode(self) -> u8 {
        match self {
            AvalonMode::Low => 0,
            AvalonMode::Mid => 1,
            AvalonMode::High => 2,
        }
    }

    pub fn from_workmode(n: u8) -> Option<Self> {
        match n {
            0 => Some(AvalonMode::Low),
            1 => Some(AvalonMode::Mid),
            2 => Some(AvalonMode::High),
            _ => None,
        }
    }
}

/// Frequency/voltage presets for the Bitaxe family.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BitaxeMode {
    Eco,
    Standard,
    Turbo,
    Oc,
}

impl BitaxeMode {
    /// (ASIC frequency MHz, core voltage mV)
    pub fn preset(self) -> (u32, u32) {
        match self {
            BitaxeMode::Eco => (400, 1100),
            BitaxeMode::Standard => (490, 1166),
            BitaxeMode::Turbo => (525, 1200),
            BitaxeMode::Oc => (575, 1250),
        }
    }

    /// Match reported settings back to a preset.
    pub fn from_settings(frequency_mhz: u32, core_voltage_mv: u32) -> Option<Self> {
        [
            BitaxeMode::Eco,
            BitaxeMode::Standard,
            BitaxeMode::Turbo,
            BitaxeMode::Oc,
        ]
        .into_iter()
        .find(|m| m.preset() == (frequency_mhz, core_voltage_mv))
    }
}

/// A power mode addressed to a specific family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "family", content = "mode", rename_all = "snake_case")]
pub enum Mode {
    Avalon(AvalonMode),
    Bitaxe(BitaxeMode),
}

impl Mode {
    pub fn family(self) -> DeviceFamily {
        match self {
            Mode::Avalon(_) => DeviceFamily::Avalon,
            Mode::Bitaxe(_) => DeviceFamily::Bitaxe,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Avalon(m) => write!(f, "avalon/{m}"),
            Mode::Bitaxe(m) => write!(f, "bitaxe/{m}"),
        }
    }
}

/// One mode per tunable family. Families left `None` are not retuned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyModes {
    #[serde(default)]
    pub avalon: Option<AvalonMode>,
    #[serde(default)]
    pub bitaxe: Option<BitaxeMode>,
}

impl FamilyModes {
    pub fn for_family(&self, family: DeviceFamily) -> Option<Mode> {
        match family {
            DeviceFamily::Avalon => self.avalon.map(Mode::Avalon),
            DeviceFamily::Bitaxe => self.bitaxe.map(Mode::Bitaxe),
            DeviceFamily::NmMiner => None,
        }
    }
}

/// Which devices an action addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DeviceSelector {
    All,
    Device(DeviceId),
    Family(DeviceFamily),
}

impl DeviceSelector {
    pub fn matches(&self, device: &Device) -> bool {
        match self {
            DeviceSelector::All => true,
            DeviceSelector::Device(id) => &device.id == id,
            DeviceSelector::Family(family) => device.family == *family,
        }
    }
}
