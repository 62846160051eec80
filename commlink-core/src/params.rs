//! Transport parameter value objects
//!
//! Each transport owns one of these and persists it through a
//! [`ParameterStore`](crate::store::ParameterStore). Nothing here is shared
//! between instances: two clients built in the same process keep fully
//! separate settings.

use crate::error::{CommError, CommResult};
use crate::validate::{parse_ip_address, parse_serial_port, parse_tcp_port};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

/// A persisted parameter section
///
/// Every section is stored in its own file under the configuration root, as a
/// JSON object holding one top-level key named [`SECTION`](Self::SECTION).
pub trait ParameterSection: Serialize + DeserializeOwned + Default + Clone {
    /// Top-level key of the section inside its file
    const SECTION: &'static str;
    /// File name under the configuration root
    const FILE_NAME: &'static str;

    /// Reject values that can never drive a transport
    fn validate(&self) -> CommResult<()>;
}

/// Durations are persisted as whole milliseconds
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Retry policy for re-establishing connectivity
///
/// # Fields
/// - `enabled`: whether the retry engine may run at all
/// - `count`: maximum number of attempts per retry run
/// - `timeout`: maximum wall-clock duration of one retry run
/// - `interval`: pause after each failed attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RetryPolicy {
    pub enabled: bool,
    pub count: u32,
    #[serde(rename = "TimeOut", with = "millis")]
    pub timeout: Duration,
    #[serde(with = "millis")]
    pub interval: Duration,
}

impl RetryPolicy {
    pub const DEFAULT_COUNT: u32 = 10;
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

    /// Enabled policy with the given attempt limit and timeout
    pub fn new(count: u32, timeout: Duration) -> Self {
        Self {
            enabled: true,
            count,
            timeout,
            interval: Self::DEFAULT_INTERVAL,
        }
    }

    /// Policy that never retries
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Set the pause after each failed attempt
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_COUNT, Self::DEFAULT_TIMEOUT)
    }
}

/// Outbound TCP client parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientParams {
    #[serde(rename = "IP")]
    pub address: IpAddr,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Retry")]
    pub retry: RetryPolicy,
}

impl ClientParams {
    pub const DEFAULT_PORT: u16 = 1234;

    /// Parameters for `address:port` with the default retry policy
    ///
    /// # Errors
    /// Returns a configuration error if either value is malformed.
    pub fn new(address: &str, port: &str) -> CommResult<Self> {
        Ok(Self {
            address: parse_ip_address(address)?,
            port: parse_tcp_port(port)?,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Remote endpoint to connect to
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl Default for ClientParams {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: Self::DEFAULT_PORT,
            retry: RetryPolicy::default(),
        }
    }
}

impl ParameterSection for ClientParams {
    const SECTION: &'static str = "Client";
    const FILE_NAME: &'static str = "client.json";

    fn validate(&self) -> CommResult<()> {
        if self.port == 0 {
            return Err(CommError::InvalidPort("0".to_string()));
        }
        Ok(())
    }
}

/// Listening TCP server parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerParams {
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Backlog")]
    pub backlog: u32,
    #[serde(rename = "Retry")]
    pub retry: RetryPolicy,
}

impl ServerParams {
    pub const DEFAULT_PORT: u16 = 1234;
    pub const DEFAULT_BACKLOG: u32 = 5;

    /// Parameters listening on `port` with the default backlog and retry policy
    ///
    /// # Errors
    /// Returns `CommError::InvalidPort` if `port` is malformed.
    pub fn new(port: &str) -> CommResult<Self> {
        Ok(Self {
            port: parse_tcp_port(port)?,
            ..Self::default()
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Local address the listener binds to (all IPv4 interfaces)
    pub fn bind_address(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port)
    }
}

impl Default for ServerParams {
    fn default() -> Self {
        Self {
            port: Self::DEFAULT_PORT,
            backlog: Self::DEFAULT_BACKLOG,
            retry: RetryPolicy::default(),
        }
    }
}

impl ParameterSection for ServerParams {
    const SECTION: &'static str = "Server";
    const FILE_NAME: &'static str = "server.json";

    fn validate(&self) -> CommResult<()> {
        if self.port == 0 {
            return Err(CommError::InvalidPort("0".to_string()));
        }
        if self.backlog == 0 {
            return Err(CommError::InvalidParameter("backlog must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Serial parity setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Parity::None => "None",
            Parity::Odd => "Odd",
            Parity::Even => "Even",
        };
        f.write_str(name)
    }
}

impl FromStr for Parity {
    type Err = CommError;

    fn from_str(s: &str) -> CommResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Parity::None),
            "odd" => Ok(Parity::Odd),
            "even" => Ok(Parity::Even),
            _ => Err(CommError::InvalidParameter(format!("Unknown parity: {}", s))),
        }
    }
}

/// Serial stop bit setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    One,
    Two,
}

impl fmt::Display for StopBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StopBits::One => "One",
            StopBits::Two => "Two",
        };
        f.write_str(name)
    }
}

impl FromStr for StopBits {
    type Err = CommError;

    fn from_str(s: &str) -> CommResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "one" | "1" => Ok(StopBits::One),
            "two" | "2" => Ok(StopBits::Two),
            _ => Err(CommError::InvalidParameter(format!("Unknown stop bits: {}", s))),
        }
    }
}

/// Serial line parameters
///
/// Retry is disabled by default for serial lines; set `retry.enabled` to opt in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct SerialParams {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
    #[serde(with = "millis")]
    pub read_timeout: Duration,
    #[serde(with = "millis")]
    pub write_timeout: Duration,
    pub retry: RetryPolicy,
}

impl SerialParams {
    pub const DEFAULT_PORT: &'static str = "COM1";
    pub const DEFAULT_BAUD_RATE: u32 = 115_200;
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);

    /// Default line settings on the given device
    ///
    /// # Errors
    /// Returns `CommError::InvalidPort` if `port` is not a serial device name.
    pub fn new(port: &str, baud_rate: u32) -> CommResult<Self> {
        let params = Self {
            port: parse_serial_port(port)?,
            baud_rate,
            ..Self::default()
        };
        params.validate()?;
        Ok(params)
    }
}

impl Default for SerialParams {
    fn default() -> Self {
        Self {
            port: Self::DEFAULT_PORT.to_string(),
            baud_rate: Self::DEFAULT_BAUD_RATE,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
            read_timeout: Self::DEFAULT_TIMEOUT,
            write_timeout: Self::DEFAULT_TIMEOUT,
            retry: RetryPolicy::disabled(),
        }
    }
}

impl ParameterSection for SerialParams {
    const SECTION: &'static str = "Serial";
    const FILE_NAME: &'static str = "serial.json";

    fn validate(&self) -> CommResult<()> {
        parse_serial_port(&self.port)?;
        if self.baud_rate == 0 {
            return Err(CommError::InvalidParameter("baud rate must be positive".to_string()));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(CommError::InvalidParameter(format!(
                "data bits must be 5-8, got {}",
                self.data_bits
            )));
        }
        Ok(())
    }
}
