use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Process settings, read once from `COURTSIDE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    pub sweep_interval: Duration,
    /// Age after which an unpaid booking is reclaimed.
    pub payment_grace: Duration,
    pub unit_minutes: u32,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "courtside".into(),
            max_connections: 256,
            compact_threshold: 1000,
            sweep_interval: Duration::from_secs(60),
            payment_grace: Duration::from_secs(300),
            unit_minutes: 30,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid value for {var}: {value:?}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source. Unset variables keep their defaults;
    /// set but unparsable ones are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let unit_minutes = parsed(&lookup, "COURTSIDE_UNIT_MINUTES")?.unwrap_or(defaults.unit_minutes);
        if unit_minutes == 0 || 60 % unit_minutes != 0 {
            return Err(ConfigError {
                var: "COURTSIDE_UNIT_MINUTES",
                value: unit_minutes.to_string(),
            });
        }
        Ok(Self {
            bind: lookup("COURTSIDE_BIND").unwrap_or(defaults.bind),
            port: parsed(&lookup, "COURTSIDE_PORT")?.unwrap_or(defaults.port),
            data_dir: lookup("COURTSIDE_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: lookup("COURTSIDE_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&lookup, "COURTSIDE_MAX_CONNECTIONS")?
                .unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&lookup, "COURTSIDE_COMPACT_THRESHOLD")?
                .unwrap_or(defaults.compact_threshold),
            sweep_interval: parsed(&lookup, "COURTSIDE_SWEEP_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            payment_grace: parsed(&lookup, "COURTSIDE_PAYMENT_GRACE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.payment_grace),
            unit_minutes,
            tls_cert: lookup("COURTSIDE_TLS_CERT"),
            tls_key: lookup("COURTSIDE_TLS_KEY"),
            metrics_port: parsed(&lookup, "COURTSIDE_METRICS_PORT")?,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError { var, value }),
    }
}
