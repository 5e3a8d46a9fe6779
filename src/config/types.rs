//! Configuration data types.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// Forwarding rules, in file order
    #[serde(default, rename = "forward")]
    pub forwards: Vec<ForwardRule>,
}

impl Config {
    /// Build a configuration holding exactly one enabled rule.
    ///
    /// Used for ad-hoc forwarding from command-line parameters.
    pub fn single(rule: ForwardRule) -> Self {
        Self {
            global: GlobalConfig::default(),
            forwards: vec![rule],
        }
    }

    /// Rules that should get a listener.
    pub fn enabled_rules(&self) -> impl Iterator<Item = &ForwardRule> {
        self.forwards.iter().filter(|r| r.enabled)
    }

    /// Give every unnamed rule a positional name (`forward-1`, `forward-2`, ...).
    pub fn assign_default_names(&mut self) {
        for (index, rule) in self.forwards.iter_mut().enumerate() {
            if rule.name.as_deref().is_none_or(str::is_empty) {
                rule.name = Some(format!("forward-{}", index + 1));
            }
        }
    }
}

/// Global configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: pretty or json
    #[serde(default)]
    pub log_format: LogFormat,

    /// Timeout for establishing the remote leg
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            connect_timeout: default_connect_timeout(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Metrics endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether the metrics endpoint is served
    #[serde(default)]
    pub enabled: bool,

    /// Address to bind metrics server
    #[serde(default = "default_metrics_address")]
    pub address: SocketAddr,

    /// Path for metrics endpoint
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
            path: default_metrics_path(),
        }
    }
}

/// One forwarding path: a local port relayed to a remote `host:port`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ForwardRule {
    /// Name used as the log prefix and metrics label
    #[serde(default)]
    pub name: Option<String>,

    /// Local port, or `host:port` to bind a specific interface
    #[serde(rename = "local", deserialize_with = "string_or_number::deserialize")]
    pub local_port: String,

    /// Remote host name or address
    #[serde(rename = "remote")]
    pub remote_host: String,

    /// Remote port
    #[serde(rename = "rport", deserialize_with = "string_or_number::deserialize")]
    pub remote_port: String,

    /// HTTP CONNECT proxy URL, e.g. `http://proxy.local:3128`
    #[serde(default)]
    pub proxy: Option<String>,

    /// Whether a listener is started for this rule
    #[serde(default, rename = "status", alias = "enabled")]
    pub enabled: bool,

    /// Upper bound on concurrent sessions; unbounded when absent
    #[serde(default)]
    pub max_connections: Option<usize>,

    /// Override of the global connect timeout
    #[serde(default, with = "option_humantime_serde")]
    pub connect_timeout: Option<Duration>,
}

impl ForwardRule {
    /// Create an enabled rule with no proxy and no limits.
    pub fn new(
        local_port: impl Into<String>,
        remote_host: impl Into<String>,
        remote_port: impl Into<String>,
    ) -> Self {
        Self {
            name: None,
            local_port: local_port.into(),
            remote_host: remote_host.into(),
            remote_port: remote_port.into(),
            proxy: None,
            enabled: true,
            max_connections: None,
            connect_timeout: None,
        }
    }

    /// Set the rule name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Route the remote leg through an HTTP CONNECT proxy.
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Display name of the rule.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("forward")
    }

    /// Address to bind the local listener on.
    ///
    /// A bare port listens on the IPv6 wildcard, which also accepts IPv4
    /// where the host allows dual-stack sockets.
    pub fn listen_address(&self) -> String {
        let local = self.local_port.trim();
        if local.contains(':') {
            local.to_string()
        } else {
            format!("[::]:{local}")
        }
    }

    /// IPv4 wildcard to bind when the host has no IPv6; bare ports only.
    pub fn fallback_listen_address(&self) -> Option<String> {
        let local = self.local_port.trim();
        (!local.contains(':')).then(|| format!("0.0.0.0:{local}"))
    }

    /// Final destination in `host:port` form.
    pub fn remote_address(&self) -> String {
        let host = self.remote_host.trim();
        let port = self.remote_port.trim();
        if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        }
    }

    /// Proxy URL, treating an empty string as "no proxy".
    pub fn proxy_url(&self) -> Option<&str> {
        self.proxy
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_metrics_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9100))
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

/// Ports may be written as `"8080"` or `8080`.
mod string_or_number {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Number(u64),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match StringOrNumber::deserialize(deserializer)? {
            StringOrNumber::String(s) => s,
            StringOrNumber::Number(n) => n.to_string(),
        })
    }
}

/// Custom serde module for humantime durations.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Custom serde module for optional humantime durations.
mod option_humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => {
                let s = humantime::format_duration(*d).to_string();
                serializer.serialize_some(&s)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        match opt {
            Some(s) => {
                let d = humantime::parse_duration(&s).map_err(serde::de::Error::custom)?;
                Ok(Some(d))
            }
            None => Ok(None),
        }
    }
}
