//! Configuration properties
//!
//! Settings are supplied as string properties (`Rpc.ConnectTimeout=500`) and
//! parsed once into a typed [`Config`] when the communicator is built. All
//! timeouts are in milliseconds; `-1` means "no timeout".

use crate::error::{Result, RpcError};
use crate::retry::RetrySchedule;
use crate::timeout::TimeoutSettings;
use std::collections::HashMap;
use std::time::Duration;

pub const PROP_RETRY_INTERVALS: &str = "Rpc.RetryIntervals";
pub const PROP_CONNECT_TIMEOUT: &str = "Rpc.ConnectTimeout";
pub const PROP_CLOSE_TIMEOUT: &str = "Rpc.CloseTimeout";
pub const PROP_INVOCATION_TIMEOUT: &str = "Rpc.InvocationTimeout";
pub const PROP_OVERRIDE_CONNECT_TIMEOUT: &str = "Rpc.Override.ConnectTimeout";
pub const PROP_OVERRIDE_CLOSE_TIMEOUT: &str = "Rpc.Override.CloseTimeout";
pub const PROP_OVERRIDE_INVOCATION_TIMEOUT: &str = "Rpc.Override.InvocationTimeout";
pub const PROP_MESSAGE_SIZE_MAX: &str = "Rpc.MessageSizeMax";

/// Default connect timeout (10 s)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default close timeout (10 s)
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default maximum frame size (1 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Default worker count for concurrent adapters
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Default incoming connection limit per listener
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// String key/value properties
#[derive(Debug, Clone, Default)]
pub struct Properties {
    values: HashMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `key=value` lines. Blank lines and `#` comments are skipped.
    pub fn parse_str(text: &str) -> Result<Self> {
        let mut props = Self::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                RpcError::Config(format!("line {}: expected key=value", lineno + 1))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(RpcError::Config(format!("line {}: empty key", lineno + 1)));
            }
            props.set(key, value.trim());
        }
        Ok(props)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn get_int(&self, key: &str) -> Result<Option<i64>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .map(Some)
                .map_err(|_| RpcError::Config(format!("{}: not an integer: {:?}", key, raw))),
        }
    }

    pub fn get_int_or(&self, key: &str, default: i64) -> Result<i64> {
        Ok(self.get_int(key)?.unwrap_or(default))
    }

    pub fn get_bool_or(&self, key: &str, default: bool) -> Result<bool> {
        Ok(self.get_int_or(key, default as i64)? != 0)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Properties
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut props = Self::new();
        for (key, value) in iter {
            props.set(key, value);
        }
        props
    }
}

/// Communicator configuration, immutable once the communicator is built
#[derive(Debug, Clone)]
pub struct Config {
    pub retry: RetrySchedule,
    pub timeouts: TimeoutSettings,
    pub max_frame_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry: RetrySchedule::default(),
            timeouts: TimeoutSettings::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl Config {
    pub fn from_properties(props: &Properties) -> Result<Self> {
        let retry = match props.get(PROP_RETRY_INTERVALS) {
            Some(raw) => RetrySchedule::parse(raw)?,
            None => RetrySchedule::default(),
        };

        let defaults = TimeoutSettings::default();
        let timeouts = TimeoutSettings {
            connect: timeout_property(props, PROP_CONNECT_TIMEOUT)?.unwrap_or(defaults.connect),
            close: timeout_property(props, PROP_CLOSE_TIMEOUT)?.unwrap_or(defaults.close),
            invocation: timeout_property(props, PROP_INVOCATION_TIMEOUT)?
                .unwrap_or(defaults.invocation),
            override_connect: timeout_property(props, PROP_OVERRIDE_CONNECT_TIMEOUT)?,
            override_close: timeout_property(props, PROP_OVERRIDE_CLOSE_TIMEOUT)?,
            override_invocation: timeout_property(props, PROP_OVERRIDE_INVOCATION_TIMEOUT)?,
        };

        let size_kb = props.get_int_or(PROP_MESSAGE_SIZE_MAX, (DEFAULT_MAX_FRAME_SIZE / 1024) as i64)?;
        if size_kb <= 0 {
            return Err(RpcError::Config(format!(
                "{}: must be positive, got {}",
                PROP_MESSAGE_SIZE_MAX, size_kb
            )));
        }
        let max_frame_size = usize::try_from(size_kb)
            .ok()
            .and_then(|kb| kb.checked_mul(1024))
            .ok_or_else(|| {
                RpcError::Config(format!("{}: {} KiB is too large", PROP_MESSAGE_SIZE_MAX, size_kb))
            })?;

        Ok(Self {
            retry,
            timeouts,
            max_frame_size,
        })
    }
}

/// Per-adapter configuration
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Dispatch one request at a time, in admission order
    pub serialize: bool,
    /// Worker count when not serialized
    pub pool_size: usize,
    /// Incoming connection limit per TCP listener
    pub max_connections: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            serialize: false,
            pool_size: DEFAULT_POOL_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl AdapterConfig {
    pub fn serialized() -> Self {
        Self {
            serialize: true,
            ..Self::default()
        }
    }

    /// Read `<name>.ThreadPool.Serialize`, `<name>.ThreadPool.Size` and
    /// `<name>.MaxConnections`
    pub fn from_properties(name: &str, props: &Properties) -> Result<Self> {
        let serialize = props.get_bool_or(&format!("{}.ThreadPool.Serialize", name), false)?;

        let size_key = format!("{}.ThreadPool.Size", name);
        let pool_size = props.get_int_or(&size_key, DEFAULT_POOL_SIZE as i64)?;
        if pool_size <= 0 {
            return Err(RpcError::Config(format!(
                "{}: must be positive, got {}",
                size_key, pool_size
            )));
        }

        let conn_key = format!("{}.MaxConnections", name);
        let max_connections = props.get_int_or(&conn_key, DEFAULT_MAX_CONNECTIONS as i64)?;
        if max_connections <= 0 {
            return Err(RpcError::Config(format!(
                "{}: must be positive, got {}",
                conn_key, max_connections
            )));
        }

        Ok(Self {
            serialize,
            pool_size: pool_size as usize,
            max_connections: max_connections as usize,
        })
    }
}

/// Parse a millisecond timeout property.
///
/// Returns `None` when the key is absent, `Some(None)` for `-1` (no timeout).
fn timeout_property(props: &Properties, key: &str) -> Result<Option<Option<Duration>>> {
    match props.get_int(key)? {
        None => Ok(None),
        Some(-1) => Ok(Some(None)),
        Some(ms) if ms > 0 => Ok(Some(Some(Duration::from_millis(ms as u64)))),
        Some(ms) => Err(RpcError::Config(format!(
            "{}: expected -1 or a positive number of milliseconds, got {}",
            key, ms
        ))),
    }
}
