//! Ambient configuration layer (§6): browser address, tab cap, timeouts.
//!
//! Timeouts are accepted as duration strings (`"30s"`, `"500ms"`) the way a
//! user would write them in a config file; [`parse_duration`] turns them into
//! [`Duration`] at construction time.

use std::time::Duration;

use crate::error::CdpError;

/// Coordinates that govern a [`crate::manager::Manager`] instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// `host:port` of the browser's remote-debugging endpoint.
    pub address: String,
    /// Maximum number of concurrently open tabs. `0` disables the cap.
    pub max_tabs: usize,
    /// Timeout for the initial HTTP discovery + WebSocket handshake.
    pub connect_timeout: Duration,
    /// Timeout applied to individual blocking reads off the wire.
    pub read_timeout: Duration,
    /// Default timeout for a `Connection::send` control-plane call.
    pub default_timeout: Duration,
    /// Interval between `Browser.getVersion` health checks.
    pub health_interval: Duration,
    /// Default timeout applied to a tab-handle command when the caller
    /// doesn't specify one.
    pub default_command_timeout: Duration,
    /// Default timeout applied to a navigation wait.
    pub default_navigation_timeout: Duration,
    /// Capacity of a tab's per-session event bus.
    pub event_bus_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: "localhost:9222".to_string(),
            max_tabs: 0,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            default_timeout: Duration::from_secs(30),
            health_interval: Duration::from_secs(30),
            default_command_timeout: Duration::from_secs(30),
            default_navigation_timeout: Duration::from_secs(30),
            event_bus_capacity: 64,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }
}

/// Builder that accepts duration strings for the timeout fields, matching
/// how these values typically arrive from a config file or CLI flag.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    inner: PartialConfig,
}

#[derive(Debug, Default)]
struct PartialConfig {
    address: Option<String>,
    max_tabs: Option<usize>,
    connect_timeout: Option<String>,
    read_timeout: Option<String>,
    default_timeout: Option<String>,
    health_interval: Option<String>,
    default_command_timeout: Option<String>,
    default_navigation_timeout: Option<String>,
    event_bus_capacity: Option<usize>,
}

impl ConfigBuilder {
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.inner.address = Some(address.into());
        self
    }

    pub fn max_tabs(mut self, max_tabs: usize) -> Self {
        self.inner.max_tabs = Some(max_tabs);
        self
    }

    pub fn connect_timeout(mut self, duration: impl Into<String>) -> Self {
        self.inner.connect_timeout = Some(duration.into());
        self
    }

    pub fn read_timeout(mut self, duration: impl Into<String>) -> Self {
        self.inner.read_timeout = Some(duration.into());
        self
    }

    pub fn default_timeout(mut self, duration: impl Into<String>) -> Self {
        self.inner.default_timeout = Some(duration.into());
        self
    }

    pub fn health_interval(mut self, duration: impl Into<String>) -> Self {
        self.inner.health_interval = Some(duration.into());
        self
    }

    pub fn default_command_timeout(mut self, duration: impl Into<String>) -> Self {
        self.inner.default_command_timeout = Some(duration.into());
        self
    }

    pub fn default_navigation_timeout(mut self, duration: impl Into<String>) -> Self {
        self.inner.default_navigation_timeout = Some(duration.into());
        self
    }

    pub fn event_bus_capacity(mut self, capacity: usize) -> Self {
        self.inner.event_bus_capacity = Some(capacity);
        self
    }

    pub fn build(self) -> Result<Config, CdpError> {
        let defaults = Config::default();
        let p = self.inner;
        Ok(Config {
            address: p.address.unwrap_or(defaults.address),
            max_tabs: p.max_tabs.unwrap_or(defaults.max_tabs),
            connect_timeout: parse_or(p.connect_timeout, defaults.connect_timeout)?,
            read_timeout: parse_or(p.read_timeout, defaults.read_timeout)?,
            default_timeout: parse_or(p.default_timeout, defaults.default_timeout)?,
            health_interval: parse_or(p.health_interval, defaults.health_interval)?,
            default_command_timeout: parse_or(
                p.default_command_timeout,
                defaults.default_command_timeout,
            )?,
            default_navigation_timeout: parse_or(
                p.default_navigation_timeout,
                defaults.default_navigation_timeout,
            )?,
            event_bus_capacity: p.event_bus_capacity.unwrap_or(defaults.event_bus_capacity),
        })
    }
}

fn parse_or(raw: Option<String>, default: Duration) -> Result<Duration, CdpError> {
    match raw {
        Some(s) => parse_duration(&s),
        None => Ok(default),
    }
}

/// Parses a duration string of the form `"30s"`, `"500ms"`, `"2m"`, `"1h"`.
///
/// A bare number with no suffix is rejected: every duration in `Config` must
/// carry an explicit unit so a misconfigured file fails loudly at startup
/// rather than silently meaning nanoseconds.
pub fn parse_duration(raw: &str) -> Result<Duration, CdpError> {
    let raw = raw.trim();
    let split_at = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(|| CdpError::Invalid(format!("duration '{raw}' is missing a unit")))?;
    let (number, unit) = raw.split_at(split_at);
    let value: f64 = number
        .parse()
        .map_err(|_| CdpError::Invalid(format!("duration '{raw}' has an invalid number")))?;

    let millis = match unit {
        "ms" => value,
        "s" => value * 1_000.0,
        "m" => value * 60_000.0,
        "h" => value * 3_600_000.0,
        other => {
            return Err(CdpError::Invalid(format!(
                "duration '{raw}' has an unknown unit '{other}'"
            )))
        }
    };
    Ok(Duration::from_secs_f64(millis / 1_000.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn rejects_missing_or_unknown_unit() {
        assert!(parse_duration("30").is_err());
        assert!(parse_duration("30x").is_err());
    }

    #[test]
    fn builder_falls_back_to_defaults() {
        let cfg = Config::builder().max_tabs(4).build().unwrap();
        assert_eq!(cfg.max_tabs, 4);
        assert_eq!(cfg.address, "localhost:9222");
        assert_eq!(cfg.health_interval, Duration::from_secs(30));
    }
}
