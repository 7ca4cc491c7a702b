use anyhow::{bail, Context};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::domain::{validate_filter, QosLevel, Subscription};

/// Read when neither `--config` nor `MQTT_LOGGER_CONFIG` names a file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/mqtt-logger/mqtt_logger.yaml";

#[derive(Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub tls: Option<TlsConfig>,
}

// Hand-written so the password never lands in logs.
impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("client_id", &self.client_id)
            .field("keep_alive", &self.keep_alive)
            .field("clean_session", &self.clean_session)
            .field("tls", &self.tls)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfig {
    /// `None` means the platform trust store.
    pub ca_cert: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    File(PathBuf),
    Postgres(String),
}

impl OutputTarget {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            bail!("output target must not be empty");
        }
        if raw.starts_with("postgres://") || raw.starts_with("postgresql://") {
            Ok(OutputTarget::Postgres(raw.to_string()))
        } else {
            Ok(OutputTarget::File(PathBuf::from(raw)))
        }
    }
}

/// Credentials in a database URL are never printed.
impl fmt::Display for OutputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputTarget::File(path) => write!(f, "file {}", path.display()),
            OutputTarget::Postgres(url) => match (url.find("://"), url.rfind('@')) {
                (Some(scheme), Some(at)) if at > scheme => write!(f, "{}://***@{}", &url[..scheme], &url[at + 1..]),
                _ => write!(f, "{}", url),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Jsonl,
    Plain,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jsonl" | "json" => Ok(OutputFormat::Jsonl),
            "plain" | "text" => Ok(OutputFormat::Plain),
            other => Err(format!("unknown output format {:?} (expected jsonl or plain)", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// 0 retries forever.
    pub max_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub subscriptions: Vec<Subscription>,
    pub output_target: OutputTarget,
    pub output_format: OutputFormat,
    pub reconnect: ReconnectPolicy,
    pub connect_timeout: Duration,
    pub persist_max_retries: u32,
    pub persist_retry_delay: Duration,
    pub batch_size: usize,
    pub batch_window: Duration,
    pub channel_capacity: usize,
    pub metrics_addr: Option<SocketAddr>,
    pub otlp_endpoint: Option<String>,
    pub log_level: String,
}

/// Optional on-disk configuration. Every key may be overridden from the environment.
///
/// The upper-case keys of the legacy `mqtt_logger.yaml` are accepted as aliases; keys it
/// carries for other tools (`TSDB_*`) are ignored.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    #[serde(alias = "MQTT_URL", alias = "mqtt_url")]
    pub broker_host: Option<String>,
    #[serde(alias = "MQTT_PORT", alias = "mqtt_port")]
    pub broker_port: Option<u16>,
    #[serde(alias = "CLIENT_USERNAME", alias = "client_username")]
    pub username: Option<String>,
    #[serde(alias = "CLIENT_PASSWORD", alias = "client_password")]
    pub password: Option<String>,
    #[serde(alias = "CLIENT_ID")]
    pub client_id: Option<String>,
    pub keep_alive_secs: Option<u64>,
    pub clean_session: Option<bool>,
    pub tls: Option<bool>,
    pub ca_cert: Option<PathBuf>,
    /// Directory holding `ca.cert.pem`.
    #[serde(alias = "CERT_PATH")]
    pub cert_path: Option<PathBuf>,
    pub topics: Option<Vec<String>>,
    pub qos: Option<u8>,
    #[serde(alias = "LOG_FILE_PATH", alias = "log_file_path")]
    pub output_target: Option<String>,
    pub output_format: Option<String>,
    pub reconnect_min_ms: Option<u64>,
    pub reconnect_max_ms: Option<u64>,
    pub reconnect_max_attempts: Option<u32>,
    pub connect_timeout_secs: Option<u64>,
    pub persist_max_retries: Option<u32>,
    pub persist_retry_delay_ms: Option<u64>,
    pub batch_size: Option<usize>,
    pub batch_window_ms: Option<u64>,
    pub channel_capacity: Option<usize>,
    pub metrics_addr: Option<String>,
    pub otlp_endpoint: Option<String>,
    #[serde(alias = "LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl FileConfig {
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .and_then(|c| c.try_deserialize())
            .with_context(|| format!("failed to read config file {}", path.display()))
    }

    /// Explicit path first, then `MQTT_LOGGER_CONFIG`, then the default location if it exists.
    pub fn discover(explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit {
            return Self::read(path);
        }
        if let Ok(path) = env::var("MQTT_LOGGER_CONFIG") {
            return Self::read(Path::new(&path));
        }
        let default = Path::new(DEFAULT_CONFIG_PATH);
        if default.exists() {
            return Self::read(default);
        }
        Ok(Self::default())
    }
}

impl AppConfig {
    pub fn load(config_file: Option<&Path>) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if it exists, ignore if not

        let file = FileConfig::discover(config_file)?;
        Self::from_sources(file, |key| env::var(key).ok())
    }

    /// Resolves every setting from `lookup` (environment) first, then `file`, then defaults.
    pub fn from_sources<F>(file: FileConfig, lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |keys: &[&str]| -> Option<String> {
            keys.iter()
                .filter_map(|k| lookup(*k))
                .map(|v| v.trim().to_string())
                .find(|v| !v.is_empty())
        };

        let host = get(&["MQTT_HOST", "MQTT_URL"])
            .or(file.broker_host)
            .unwrap_or_else(|| "localhost".to_string());
        let port = parse_or(get(&["MQTT_PORT"]), file.broker_port, 1883, "MQTT_PORT")?;
        let username = get(&["MQTT_USERNAME", "CLIENT_USERNAME"]).or(file.username);
        let password = get(&["MQTT_PASSWORD", "CLIENT_PASSWORD"]).or(file.password);
        let keep_alive_secs = parse_or(get(&["MQTT_KEEP_ALIVE_SECS"]), file.keep_alive_secs, 30, "MQTT_KEEP_ALIVE_SECS")?;
        let clean_session = match get(&["MQTT_CLEAN_SESSION"]) {
            Some(raw) => parse_bool(&raw).context("MQTT_CLEAN_SESSION must be a boolean")?,
            None => file.clean_session.unwrap_or(true),
        };

        let client_id = match get(&["MQTT_CLIENT_ID", "CLIENT_ID"]).or(file.client_id) {
            Some(id) => id,
            None if !clean_session => {
                bail!("MQTT_CLIENT_ID must be set when MQTT_CLEAN_SESSION=false (persistent sessions need a stable id)")
            }
            None => format!("mqtt_logger_{}", uuid::Uuid::new_v4().simple()),
        };

        let ca_cert = get(&["MQTT_CA_CERT"])
            .map(PathBuf::from)
            .or_else(|| get(&["CERT_PATH"]).map(|dir| Path::new(&dir).join("ca.cert.pem")))
            .or(file.ca_cert)
            .or_else(|| file.cert_path.map(|dir| dir.join("ca.cert.pem")));
        let tls_enabled = match get(&["MQTT_TLS"]) {
            Some(raw) => parse_bool(&raw).context("MQTT_TLS must be a boolean")?,
            None => file.tls.unwrap_or(false),
        } || ca_cert.is_some();
        let tls = tls_enabled.then(|| TlsConfig { ca_cert });

        let qos_raw: u8 = parse_or(get(&["MQTT_QOS"]), file.qos, 2, "MQTT_QOS")?;
        let qos = QosLevel::try_from(qos_raw).map_err(anyhow::Error::msg)?;
        let filters: Vec<String> = match get(&["MQTT_TOPICS"]) {
            Some(raw) => raw.split(',').map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect(),
            None => file.topics.unwrap_or_else(|| vec!["#".to_string()]),
        };
        if filters.is_empty() {
            bail!("at least one topic filter is required");
        }
        for filter in &filters {
            validate_filter(filter).map_err(anyhow::Error::msg)?;
        }
        let subscriptions = filters.into_iter().map(|f| Subscription::new(f, qos)).collect();

        let output_target = get(&["OUTPUT_TARGET", "LOG_FILE_PATH"])
            .or(file.output_target)
            .context("OUTPUT_TARGET must be set (file path or postgres:// URL)")?;
        let output_target = OutputTarget::parse(&output_target)?;
        let output_format = match get(&["OUTPUT_FORMAT"]).or(file.output_format) {
            Some(raw) => raw.parse().map_err(anyhow::Error::msg)?,
            None => OutputFormat::default(),
        };

        let reconnect = ReconnectPolicy {
            min_delay: Duration::from_millis(parse_or(get(&["RECONNECT_MIN_MS"]), file.reconnect_min_ms, 500, "RECONNECT_MIN_MS")?),
            max_delay: Duration::from_millis(parse_or(get(&["RECONNECT_MAX_MS"]), file.reconnect_max_ms, 30_000, "RECONNECT_MAX_MS")?),
            max_attempts: parse_or(get(&["RECONNECT_MAX_ATTEMPTS"]), file.reconnect_max_attempts, 20, "RECONNECT_MAX_ATTEMPTS")?,
        };
        if reconnect.min_delay.is_zero() {
            bail!("RECONNECT_MIN_MS must be greater than zero");
        }
        if reconnect.min_delay > reconnect.max_delay {
            bail!("RECONNECT_MIN_MS must not exceed RECONNECT_MAX_MS");
        }

        let connect_timeout = Duration::from_secs(parse_or(get(&["CONNECT_TIMEOUT_SECS"]), file.connect_timeout_secs, 10, "CONNECT_TIMEOUT_SECS")?);
        let persist_max_retries = parse_or(get(&["PERSIST_MAX_RETRIES"]), file.persist_max_retries, 3, "PERSIST_MAX_RETRIES")?;
        let persist_retry_delay = Duration::from_millis(parse_or(get(&["PERSIST_RETRY_DELAY_MS"]), file.persist_retry_delay_ms, 200, "PERSIST_RETRY_DELAY_MS")?);
        let batch_size = parse_or(get(&["BATCH_SIZE"]), file.batch_size, 100, "BATCH_SIZE")?;
        let batch_window = Duration::from_millis(parse_or(get(&["BATCH_WINDOW_MS"]), file.batch_window_ms, 50, "BATCH_WINDOW_MS")?);
        let channel_capacity = parse_or(get(&["CHANNEL_CAPACITY"]), file.channel_capacity, 1000, "CHANNEL_CAPACITY")?;
        if batch_size == 0 || channel_capacity == 0 {
            bail!("BATCH_SIZE and CHANNEL_CAPACITY must be at least 1");
        }

        let metrics_addr: Option<SocketAddr> = match get(&["METRICS_ADDR"]).or(file.metrics_addr) {
            Some(raw) => Some(raw.parse().with_context(|| format!("METRICS_ADDR {:?} is not a socket address", raw))?),
            None => None,
        };
        let otlp_endpoint = get(&["OTEL_EXPORTER_OTLP_ENDPOINT"]).or(file.otlp_endpoint);
        let log_level = get(&["LOG_LEVEL"])
            .or(file.log_level)
            .map(|l| normalize_log_level(&l))
            .unwrap_or_else(|| "info".to_string());
        if !LOG_LEVELS.contains(&log_level.as_str()) {
            bail!("LOG_LEVEL {:?} is not one of {}", log_level, LOG_LEVELS.join(", "));
        }

        Ok(AppConfig {
            broker: BrokerConfig {
                host,
                port,
                username,
                password,
                client_id,
                keep_alive: Duration::from_secs(keep_alive_secs),
                clean_session,
                tls,
            },
            subscriptions,
            output_target,
            output_format,
            reconnect,
            connect_timeout,
            persist_max_retries,
            persist_retry_delay,
            batch_size,
            batch_window,
            channel_capacity,
            metrics_addr,
            otlp_endpoint,
            log_level,
        })
    }
}

fn parse_or<T>(raw: Option<String>, file: Option<T>, default: T, key: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match raw {
        Some(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{} has invalid value {:?}: {}", key, raw, e)),
        None => Ok(file.unwrap_or(default)),
    }
}

fn parse_bool(raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("{:?} is not a boolean", other),
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

// Python-style level names (WARNING) map onto tracing's.
fn normalize_log_level(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "warning" => "warn".to_string(),
        "critical" => "error".to_string(),
        other => other.to_string(),
    }
}
