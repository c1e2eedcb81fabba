use crate::framer::DEFAULT_MAX_MESSAGE_BYTES;
use crate::transport::ConnectPolicy;
use serde::Deserialize;
use tokio::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub link: LinkConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Framed,
    Call,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Framed => "framed",
            TransportKind::Call => "call",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LinkConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_transport")]
    pub transport: TransportKind,
    #[serde(default = "default_orchestrator_name")]
    pub orchestrator_name: String,
    #[serde(default = "default_orchestrator_version")]
    pub orchestrator_version: String,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: u32,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_late_window_ms")]
    pub late_window_ms: u64,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    #[serde(default = "default_connect_max_retries")]
    pub connect_max_retries: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_transport() -> TransportKind {
    TransportKind::Framed
}

fn default_orchestrator_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

fn default_orchestrator_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_max_message_bytes() -> u32 {
    DEFAULT_MAX_MESSAGE_BYTES
}

fn default_handshake_timeout_ms() -> u64 {
    5000
}

fn default_sweep_interval_ms() -> u64 {
    50
}

fn default_late_window_ms() -> u64 {
    5000
}

fn default_event_buffer() -> usize {
    256
}

fn default_connect_max_retries() -> u32 {
    10
}

fn default_connect_timeout_ms() -> u64 {
    1000
}

impl LinkConfig {
    /// `host:port` for the framed socket.
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// URI for the call-based transport.
    pub fn get_endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn connect_policy(&self) -> ConnectPolicy {
        ConnectPolicy {
            max_retries: self.connect_max_retries,
            attempt_timeout: Duration::from_millis(self.connect_timeout_ms),
            ..ConnectPolicy::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("link.host must not be empty".to_string());
        }
        let non_zero = [
            ("link.max_message_bytes", self.max_message_bytes as u64),
            ("link.handshake_timeout_ms", self.handshake_timeout_ms),
            ("link.sweep_interval_ms", self.sweep_interval_ms),
            ("link.late_window_ms", self.late_window_ms),
            ("link.event_buffer", self.event_buffer as u64),
            ("link.connect_timeout_ms", self.connect_timeout_ms),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(format!("{} must be greater than zero", name));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("current directory: {}", e)))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("ML")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;
    if let Err(e) = config.link.validate() {
        tracing::error!("Configuration validation failed: {}", e);
        return Err(config::ConfigError::Message(e));
    }

    Ok(config)
}
