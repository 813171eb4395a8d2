//! Runtime configuration, read once from `HOLDFAST_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("{name} has invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Gateway credentials. The key secret is the payment secret, which the
/// gateway also uses to sign checkout results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub url: String,
    pub key_id: String,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub hold_duration: Duration,
    pub sweep_interval: Duration,
    pub compact_threshold: u64,
    pub min_duration_minutes: u32,
    pub metrics_port: Option<u16>,
    pub payment_secret: String,
    pub webhook_secret: String,
    /// `None` runs against the in-memory gateway.
    pub gateway: Option<GatewayConfig>,
    pub directory: Option<PathBuf>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind", &self.bind)
            .field("port", &self.port)
            .field("data_dir", &self.data_dir)
            .field("hold_duration", &self.hold_duration)
            .field("sweep_interval", &self.sweep_interval)
            .field("compact_threshold", &self.compact_threshold)
            .field("min_duration_minutes", &self.min_duration_minutes)
            .field("metrics_port", &self.metrics_port)
            .field("gateway", &self.gateway)
            .field("directory", &self.directory)
            .finish_non_exhaustive()
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}

/// Holds longer than a day are a misconfiguration.
const MAX_HOLD_SECS: u64 = 24 * 60 * 60;

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any key/value source. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let lookup = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let payment_secret =
            lookup("HOLDFAST_PAYMENT_SECRET").ok_or(ConfigError::Missing("HOLDFAST_PAYMENT_SECRET"))?;
        let webhook_secret = lookup("HOLDFAST_WEBHOOK_SECRET").unwrap_or_else(|| payment_secret.clone());

        let hold_secs: u64 = parse_or(&lookup, "HOLDFAST_HOLD_SECS", 300)?;
        if hold_secs == 0 || hold_secs > MAX_HOLD_SECS {
            return Err(ConfigError::Invalid {
                name: "HOLDFAST_HOLD_SECS",
                value: hold_secs.to_string(),
            });
        }
        let sweep_secs: u64 = parse_or(&lookup, "HOLDFAST_SWEEP_INTERVAL_SECS", 60)?;
        if sweep_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "HOLDFAST_SWEEP_INTERVAL_SECS",
                value: "0".into(),
            });
        }

        let metrics_port = match lookup("HOLDFAST_METRICS_PORT") {
            None => None,
            Some(raw) => Some(raw.trim().parse().map_err(|_| ConfigError::Invalid {
                name: "HOLDFAST_METRICS_PORT",
                value: raw,
            })?),
        };

        let gateway = match (lookup("HOLDFAST_GATEWAY_URL"), lookup("HOLDFAST_GATEWAY_KEY_ID")) {
            (Some(url), Some(key_id)) => Some(GatewayConfig { url, key_id }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing("HOLDFAST_GATEWAY_KEY_ID")),
            (None, Some(_)) => return Err(ConfigError::Missing("HOLDFAST_GATEWAY_URL")),
        };

        Ok(Self {
            bind: lookup("HOLDFAST_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&lookup, "HOLDFAST_PORT", 8080)?,
            data_dir: lookup("HOLDFAST_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            hold_duration: Duration::from_secs(hold_secs),
            sweep_interval: Duration::from_secs(sweep_secs),
            compact_threshold: parse_or(&lookup, "HOLDFAST_COMPACT_THRESHOLD", 1000)?,
            min_duration_minutes: parse_or(&lookup, "HOLDFAST_MIN_DURATION_MINUTES", 15)?,
            metrics_port,
            payment_secret,
            webhook_secret,
            gateway,
            directory: lookup("HOLDFAST_DIRECTORY").map(PathBuf::from),
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("holdfast.wal")
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
