//! ---
//! morse_section: "01-core-functionality"
//! morse_subsection: "module"
//! morse_type: "source"
//! morse_scope: "code"
//! morse_description: "Shared primitives for every pipeline stage."
//! morse_version: "v0.1.0"
//! morse_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

/// Smallest keep-alive the MQTT client accepts.
pub const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

fn default_broker_host() -> String {
    "localhost".to_owned()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(5)
}

fn default_reconnect_delay() -> Duration {
    Duration::from_millis(1000)
}

fn default_channel_capacity() -> usize {
    64
}

fn default_source_event() -> String {
    "E/KeyboardEvent".to_owned()
}

fn default_source_status() -> String {
    "S/KeyboardEvent".to_owned()
}

fn default_encoded_event() -> String {
    "E/textInMorse".to_owned()
}

fn default_encoded_status() -> String {
    "S/textInMorse".to_owned()
}

fn default_unit() -> Duration {
    Duration::from_millis(100)
}

fn default_producer_client_id() -> String {
    "KeyboardEntry".to_owned()
}

fn default_quit_command() -> String {
    "quit".to_owned()
}

fn default_transformer_client_id() -> String {
    "textToMorse".to_owned()
}

fn default_display_client_id() -> String {
    "morseDisplay".to_owned()
}

fn default_true() -> bool {
    true
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9899))
}

/// Primary configuration object shared by all three stages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub topics: TopicConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub transformer: TransformerConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    /// `None` when no file was found and built-in defaults are in effect.
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "MORSE_CONFIG";

    /// Load configuration from the first existing candidate, respecting the
    /// `MORSE_CONFIG` override. Falls back to defaults when nothing exists.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path.to_path_buf()),
                });
            }
        }

        debug!(
            inspected = %candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            "no configuration file found; using defaults"
        );
        Ok(LoadedAppConfig {
            config: AppConfig::default(),
            source: None,
        })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<AppConfig>()
            .with_context(|| format!("failed to load config file {}", path.display()))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.broker.validate()?;
        self.topics.validate()?;
        self.timing.validate()?;

        let ids = [
            self.producer.client_id.as_str(),
            self.transformer.client_id.as_str(),
            self.display.client_id.as_str(),
        ];
        for (index, id) in ids.iter().enumerate() {
            if id.trim().is_empty() {
                return Err(anyhow!("stage client ids must not be empty"));
            }
            if ids[..index].contains(id) {
                return Err(anyhow!("client id '{}' is used by more than one stage", id));
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Envelope framing used on event topics.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// `msg: <payload> id: <token>` text frames.
    #[default]
    Marker,
    /// `{"payload": "...", "id": "..."}` frames.
    Json,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default = "default_keep_alive")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub keep_alive: Duration,
    #[serde(default = "default_reconnect_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub reconnect_delay: Duration,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default)]
    pub wire_format: WireFormat,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            keep_alive: default_keep_alive(),
            reconnect_delay: default_reconnect_delay(),
            channel_capacity: default_channel_capacity(),
            wire_format: WireFormat::default(),
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(anyhow!("broker host must not be empty"));
        }
        if self.port == 0 {
            return Err(anyhow!("broker port must be non-zero"));
        }
        if self.keep_alive < MIN_KEEP_ALIVE {
            return Err(anyhow!(
                "broker keep_alive must be at least {}s",
                MIN_KEEP_ALIVE.as_secs()
            ));
        }
        if self.channel_capacity == 0 {
            return Err(anyhow!("broker channel_capacity must be greater than zero"));
        }
        Ok(())
    }
}

/// Physical topic names for the four logical pipeline topics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicConfig {
    #[serde(default = "default_source_event")]
    pub source_event: String,
    #[serde(default = "default_source_status")]
    pub source_status: String,
    #[serde(default = "default_encoded_event")]
    pub encoded_event: String,
    #[serde(default = "default_encoded_status")]
    pub encoded_status: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            source_event: default_source_event(),
            source_status: default_source_status(),
            encoded_event: default_encoded_event(),
            encoded_status: default_encoded_status(),
        }
    }
}

impl TopicConfig {
    pub fn all(&self) -> [&str; 4] {
        [
            self.source_event.as_str(),
            self.source_status.as_str(),
            self.encoded_event.as_str(),
            self.encoded_status.as_str(),
        ]
    }

    pub fn validate(&self) -> Result<()> {
        let topics = self.all();
        for (index, topic) in topics.iter().enumerate() {
            if topic.trim().is_empty() {
                return Err(anyhow!("topic names must not be empty"));
            }
            if topic.contains('+') || topic.contains('#') {
                return Err(anyhow!("topic '{}' must not contain wildcards", topic));
            }
            if topics[..index].contains(topic) {
                return Err(anyhow!("topic '{}' is configured more than once", topic));
            }
        }
        Ok(())
    }
}

/// Base timing unit for signal playback.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimingConfig {
    /// Duration of one dot.
    #[serde(default = "default_unit")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub unit: Duration,
    /// Words per minute (PARIS). Overrides `unit` when present.
    #[serde(default)]
    pub wpm: Option<u32>,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            unit: default_unit(),
            wpm: None,
        }
    }
}

impl TimingConfig {
    /// PARIS dot duration for `wpm` words per minute: 1.2 s divided by the
    /// speed, kept to the microsecond. Zero for a zero speed.
    pub fn unit_for_wpm(wpm: u32) -> Duration {
        match wpm {
            0 => Duration::ZERO,
            wpm => Duration::from_micros(1_200_000 / u64::from(wpm)),
        }
    }

    /// Dot duration after applying the optional `wpm` override.
    pub fn effective_unit(&self) -> Duration {
        match self.wpm {
            Some(wpm) if wpm > 0 => Self::unit_for_wpm(wpm),
            _ => self.unit,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.wpm == Some(0) {
            return Err(anyhow!("timing wpm must be greater than zero"));
        }
        if self.effective_unit().is_zero() {
            return Err(anyhow!("timing unit must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerConfig {
    #[serde(default = "default_producer_client_id")]
    pub client_id: String,
    /// Input line that ends the producer session.
    #[serde(default = "default_quit_command")]
    pub quit_command: String,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            client_id: default_producer_client_id(),
            quit_command: default_quit_command(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformerConfig {
    #[serde(default = "default_transformer_client_id")]
    pub client_id: String,
    /// Publish Offline on the encoded status topic while the producer is offline.
    #[serde(default = "default_true")]
    pub mirror_upstream_offline: bool,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            client_id: default_transformer_client_id(),
            mirror_upstream_offline: true,
        }
    }
}

/// Rendering surface used by the display stage.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IndicatorKind {
    #[default]
    Console,
    Log,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_display_client_id")]
    pub client_id: String,
    /// Also watch the producer status topic for richer diagnostics.
    #[serde(default = "default_true")]
    pub watch_source_status: bool,
    #[serde(default)]
    pub indicator: IndicatorKind,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            client_id: default_display_client_id(),
            watch_source_status: true,
            indicator: IndicatorKind::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}
