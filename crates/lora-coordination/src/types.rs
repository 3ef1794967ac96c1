//! Device identifiers and the records cached on their behalf.

use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use lora_cache::CachedRecord;
use serde::Deserialize;
use serde::Serialize;
use snafu::Snafu;

/// Failure to parse an identifier from its hex form.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(display("invalid {kind} '{input}': {reason}"))]
pub struct ParseIdentifierError {
    kind: &'static str,
    input: String,
    reason: &'static str,
}

fn parse_hex(kind: &'static str, input: &str, max_digits: usize) -> Result<u64, ParseIdentifierError> {
    let digits: String = input.chars().filter(|c| *c != '-' && *c != ':').collect();
    let fail = |reason| ParseIdentifierError {
        kind,
        input: input.to_string(),
        reason,
    };
    if digits.is_empty() {
        return Err(fail("empty"));
    }
    if digits.len() > max_digits {
        return Err(fail("too many digits"));
    }
    u64::from_str_radix(&digits, 16).map_err(|_| fail("not hexadecimal"))
}

/// Globally unique 64-bit device identity (DevEUI).
///
/// Displayed as 16 upper-case hex digits, which is also its cache-key form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DevEui(pub u64);

impl fmt::Display for DevEui {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

impl FromStr for DevEui {
    type Err = ParseIdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex("DevEUI", s, 16).map(DevEui)
    }
}

impl TryFrom<String> for DevEui {
    type Error = ParseIdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DevEui> for String {
    fn from(value: DevEui) -> Self {
        value.to_string()
    }
}

/// 32-bit session address assigned after join (DevAddr).
///
/// Not unique over time. The top 7 bits are the network id, the low 25 bits
/// the network address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DevAddr(pub u32);

impl DevAddr {
    const NETWORK_ADDRESS_MASK: u32 = 0x01FF_FFFF;

    /// Network id (NwkID), bits 31..25.
    pub fn network_id(self) -> u8 {
        (self.0 >> 25) as u8
    }

    /// Network address (NwkAddr), bits 24..0.
    pub fn network_address(self) -> u32 {
        self.0 & Self::NETWORK_ADDRESS_MASK
    }
}

impl fmt::Display for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

impl FromStr for DevAddr {
    type Err = ParseIdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex("DevAddr", s, 8).map(|v| DevAddr(v as u32))
    }
}

impl TryFrom<String> for DevAddr {
    type Error = ParseIdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DevAddr> for String {
    fn from(value: DevAddr) -> Self {
        value.to_string()
    }
}

/// Join nonce chosen by the device (DevNonce).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DevNonce(pub u16);

impl fmt::Display for DevNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session counters for one device, guarded by the device lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFrameCounterState {
    /// Last accepted uplink counter.
    pub fcnt_up: u32,
    /// Last issued downlink counter.
    pub fcnt_down: u32,
    /// Gateway that produced the last accepted uplink.
    pub gateway_id: String,
}

impl CachedRecord for DeviceFrameCounterState {
    const KIND: &'static str = "device_state";
}

/// Join eligibility cached per device. Only cached once a credential exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinInfo {
    /// Device primary credential.
    pub primary_credential: String,
    /// Gateway the device is pinned to, if any.
    pub desired_gateway: Option<String>,
}

impl CachedRecord for JoinInfo {
    const KIND: &'static str = "join_info";
}

/// One device known to use an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevAddrCacheEntry {
    /// The address.
    pub dev_addr: DevAddr,
    /// Device using it.
    pub dev_eui: DevEui,
    /// Filled lazily from the registry.
    pub primary_credential: Option<String>,
    /// Gateway the device is homed on.
    pub gateway_id: Option<String>,
    /// Network session key, as reported by the registry or the join.
    pub network_session_key: Option<String>,
    /// Registry modification time this entry was built from (Unix ms).
    pub last_updated_ms: u64,
}

/// The cached contents of one address bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DevAddrBucket {
    /// No device in the registry uses this address.
    KnownEmpty,
    /// Devices using this address, in insertion order.
    Devices {
        /// Entries, at most one per device.
        entries: Vec<DevAddrCacheEntry>,
    },
}

impl DevAddrBucket {
    /// Entries for real devices. Empty for the sentinel.
    pub fn entries(&self) -> &[DevAddrCacheEntry] {
        match self {
            DevAddrBucket::KnownEmpty => &[],
            DevAddrBucket::Devices { entries } => entries,
        }
    }
}

impl CachedRecord for DevAddrBucket {
    const KIND: &'static str = "devaddr_bucket";
}

/// A gateway that received an uplink, with its signal strength.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayCandidate {
    /// Reporting gateway.
    pub gateway_id: String,
    /// Received signal strength (dBm).
    pub rssi: f64,
}

/// Gateways that reported one uplink, in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreferredGatewayCandidates {
    /// Candidates, at most one per gateway.
    pub entries: Vec<GatewayCandidate>,
}

impl CachedRecord for PreferredGatewayCandidates {
    const KIND: &'static str = "preferred_gateway_candidates";
}

/// Current wall-clock time in Unix milliseconds.
pub fn now_unix_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}
