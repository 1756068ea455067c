//! Configuration system using Figment.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults ([`Settings::default`])
//! 2. A TOML file (`config/seatrack.toml` unless another path is given)
//! 3. Environment variables prefixed with `SEATRACK_`, nested with `__`
//!    (e.g. `SEATRACK_AGGREGATOR__INTERVAL=2`)
//!
//! # Example
//! ```no_run
//! use seatrack::config::Settings;
//!
//! let settings = Settings::load()?;
//! println!("Aggregating every {}s", settings.aggregator.interval);
//! # Ok::<(), seatrack::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use crate::sample::Address;
use crate::track::SaveMode;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/seatrack.toml";

/// Longest accepted period or timeout, in seconds (one week).
pub const MAX_PERIOD_SECS: f64 = 7.0 * 86_400.0;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Serial transport readers, keyed by a short name.
    pub serial: BTreeMap<String, SerialSettings>,
    /// Publish/subscribe transport reader.
    pub mqtt: Option<MqttSettings>,
    /// Raw buffer bounds and ingest preprocessing.
    pub communicator: CommunicatorSettings,
    /// Aggregation cadence.
    pub aggregator: AggregatorSettings,
    /// Track bounds and checkpointing.
    pub track: TrackSettings,
    /// Default save mode for new tracks.
    pub saving: SavingSettings,
    /// Storage locations.
    pub files: FileSettings,
    /// Liveness thresholds.
    pub status: StatusSettings,
    /// Remote unit id to display name.
    pub units: BTreeMap<String, String>,
    /// Fields used for position projections.
    pub gps: GpsSettings,
    /// Logging output.
    pub logging: LoggingSettings,
    /// Reconnect policy shared by transport readers.
    pub transport: TransportSettings,
}

/// One serial port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// System name of the port, e.g. `/dev/ttyACM0`.
    pub port: String,
    /// Baud rate.
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    /// Addresses expected on this port.
    #[serde(default, deserialize_with = "one_or_many")]
    pub topics: Vec<String>,
    /// Whether a reader is started for this port.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// MQTT broker connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttSettings {
    /// Broker host name or IP.
    pub hostname: String,
    /// Broker port.
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Keep-alive in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Topics to subscribe to.
    #[serde(default, deserialize_with = "one_or_many")]
    pub topics: Vec<String>,
    /// Client identifier presented to the broker.
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Whether a reader is started for the broker.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Raw buffer bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunicatorSettings {
    /// Maximum samples kept per address.
    pub max_values: usize,
    /// Fraction of the oldest samples dropped on overflow.
    pub trim_fraction: f64,
    /// Linear conversions applied at ingest.
    pub conversions: Vec<ConversionRule>,
}

/// `target = topic * scale + offset`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionRule {
    /// Source address.
    pub topic: String,
    /// Destination address; equal to `topic` for in-place conversion.
    #[serde(default)]
    pub target: Option<String>,
    /// Multiplier.
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Additive term.
    #[serde(default)]
    pub offset: f64,
}

/// Aggregation cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorSettings {
    /// Tick period in seconds.
    pub interval: f64,
}

/// Track bounds and checkpointing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackSettings {
    /// Seconds between checkpoints.
    pub checkpoint_interval: f64,
    /// Checkpoint files retained per track.
    pub max_checkpoint_files: usize,
    /// Fraction of the oldest records dropped on overflow.
    pub trim_fraction: f64,
    /// Maximum records kept in memory.
    pub max_datapoints: usize,
}

/// Save-mode defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SavingSettings {
    /// Mode new tracks start in.
    pub default_mode: SaveMode,
}

/// Storage locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileSettings {
    /// Root for archived tracks and the `chk/` checkpoint directory.
    pub output_dir: PathBuf,
    /// Optional log file; logs go to stdout when unset.
    pub log_file: Option<PathBuf>,
}

/// Liveness thresholds in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusSettings {
    /// Silence after which a unit is `noncomm`.
    pub timeout_noncomm: f64,
    /// Silence after which a unit is `offline`.
    pub timeout_offline: f64,
}

/// Fields carrying the position of the GPS unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpsSettings {
    /// Latitude address.
    pub latitude: String,
    /// Longitude address.
    pub longitude: String,
}

/// Logging output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// trace, debug, info, warn or error.
    pub level: String,
    /// pretty, compact or json.
    pub format: String,
}

/// Reconnect backoff for transport readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// First delay after a failure.
    pub backoff_initial_ms: u64,
    /// Upper bound for the delay.
    pub backoff_max_ms: u64,
}

// Default value functions
fn default_baudrate() -> u32 {
    9600
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    120
}

fn default_client_id() -> String {
    "seatrack".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_scale() -> f64 {
    1.0
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

impl Default for Settings {
    /// Transport-free defaults: readers and unit names only come from the
    /// configuration file or the environment.
    fn default() -> Self {
        Self {
            serial: BTreeMap::new(),
            mqtt: None,
            communicator: CommunicatorSettings::default(),
            aggregator: AggregatorSettings::default(),
            track: TrackSettings::default(),
            saving: SavingSettings::default(),
            files: FileSettings::default(),
            status: StatusSettings::default(),
            units: BTreeMap::new(),
            gps: GpsSettings::default(),
            logging: LoggingSettings::default(),
            transport: TransportSettings::default(),
        }
    }
}

impl Default for CommunicatorSettings {
    fn default() -> Self {
        Self {
            max_values: 1000,
            trim_fraction: 0.5,
            conversions: Vec::new(),
        }
    }
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self { interval: 1.0 }
    }
}

impl Default for TrackSettings {
    fn default() -> Self {
        Self {
            checkpoint_interval: 30.0,
            max_checkpoint_files: 3,
            trim_fraction: 0.5,
            max_datapoints: 100_000,
        }
    }
}

impl Default for SavingSettings {
    fn default() -> Self {
        Self {
            default_mode: SaveMode::Continuous,
        }
    }
}

impl Default for FileSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            log_file: None,
        }
    }
}

impl Default for StatusSettings {
    fn default() -> Self {
        Self {
            timeout_noncomm: 30.0,
            timeout_offline: 60.0,
        }
    }
}

impl Default for GpsSettings {
    fn default() -> Self {
        Self {
            latitude: "rm1/gps/lat".to_string(),
            longitude: "rm1/gps/long".to_string(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

impl AggregatorSettings {
    /// Tick period as a [`Duration`].
    pub fn interval(&self) -> Duration {
        period(self.interval)
    }
}

impl TrackSettings {
    /// Checkpoint period as a [`Duration`].
    pub fn checkpoint_interval(&self) -> Duration {
        period(self.checkpoint_interval)
    }
}

impl StatusSettings {
    /// `noncomm` threshold as a [`chrono::Duration`].
    pub fn noncomm(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.timeout_noncomm * 1000.0) as i64)
    }

    /// `offline` threshold as a [`chrono::Duration`].
    pub fn offline(&self) -> chrono::Duration {
        chrono::Duration::milliseconds((self.timeout_offline * 1000.0) as i64)
    }
}

impl Settings {
    /// Load configuration from the default path and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file and the environment, then validate.
    ///
    /// A missing file is not an error: defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!(path = %path.display(), "configuration file not found, using defaults");
        }
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("SEATRACK_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse configuration from a TOML string layered over the defaults.
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::string(toml))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> AppResult<()> {
        let fail = |msg: String| Err(DaqError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return fail(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }
        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return fail(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            ));
        }

        if self.communicator.max_values == 0 {
            return fail("communicator.max_values must be greater than 0".into());
        }
        check_fraction("communicator.trim_fraction", self.communicator.trim_fraction)?;
        if self.track.max_datapoints == 0 {
            return fail("track.max_datapoints must be greater than 0".into());
        }
        check_fraction("track.trim_fraction", self.track.trim_fraction)?;
        if self.track.max_checkpoint_files == 0 {
            return fail("track.max_checkpoint_files must be at least 1".into());
        }
        check_period("aggregator.interval", self.aggregator.interval)?;
        check_period("track.checkpoint_interval", self.track.checkpoint_interval)?;
        check_period("status.timeout_noncomm", self.status.timeout_noncomm)?;
        check_period("status.timeout_offline", self.status.timeout_offline)?;
        if self.status.timeout_noncomm >= self.status.timeout_offline {
            return fail(format!(
                "status.timeout_noncomm ({}) must be lower than status.timeout_offline ({})",
                self.status.timeout_noncomm, self.status.timeout_offline
            ));
        }
        if self.transport.backoff_initial_ms == 0
            || self.transport.backoff_initial_ms > self.transport.backoff_max_ms
        {
            return fail("transport backoff must satisfy 0 < initial <= max".into());
        }

        for (name, port) in &self.serial {
            if port.port.is_empty() {
                return fail(format!("serial.{name}.port cannot be empty"));
            }
            if port.baudrate == 0 {
                return fail(format!("serial.{name}.baudrate must be greater than 0"));
            }
            check_topics(&format!("serial.{name}.topics"), &port.topics)?;
        }
        if let Some(mqtt) = &self.mqtt {
            if mqtt.hostname.is_empty() {
                return fail("mqtt.hostname cannot be empty".into());
            }
            check_topics("mqtt.topics", &mqtt.topics)?;
        }
        for rule in &self.communicator.conversions {
            Address::parse(&rule.topic)
                .map_err(|e| DaqError::Configuration(format!("communicator.conversions: {e}")))?;
            if let Some(target) = &rule.target {
                Address::parse(target).map_err(|e| {
                    DaqError::Configuration(format!("communicator.conversions: {e}"))
                })?;
            }
        }

        Ok(())
    }

    /// Every address named by a transport reader, in configuration order.
    pub fn configured_addresses(&self) -> Vec<Address> {
        let mut out: Vec<Address> = Vec::new();
        let serial = self
            .serial
            .values()
            .filter(|s| s.enabled)
            .flat_map(|s| s.topics.iter());
        let mqtt = self
            .mqtt
            .iter()
            .filter(|m| m.enabled)
            .flat_map(|m| m.topics.iter());
        for topic in serial.chain(mqtt) {
            if let Ok(addr) = Address::parse(topic) {
                if !out.contains(&addr) {
                    out.push(addr);
                }
            }
        }
        out
    }

    /// Display name for a unit, falling back to the id itself.
    pub fn unit_name<'a>(&'a self, unit_id: &'a str) -> &'a str {
        self.units.get(unit_id).map_or(unit_id, String::as_str)
    }
}

fn check_fraction(name: &str, value: f64) -> AppResult<()> {
    if !(0.0..1.0).contains(&value) {
        return Err(DaqError::Configuration(format!(
            "{name} must be within [0, 1), got {value}"
        )));
    }
    Ok(())
}

fn check_period(name: &str, value: f64) -> AppResult<()> {
    let representable = Duration::try_from_secs_f64(value).is_ok();
    if !representable || value <= 0.0 || value > MAX_PERIOD_SECS {
        return Err(DaqError::Configuration(format!(
            "{name} must be a number of seconds within (0, {MAX_PERIOD_SECS}], got {value}"
        )));
    }
    Ok(())
}

/// Seconds to [`Duration`], saturating at [`MAX_PERIOD_SECS`] for values
/// `validate` would reject.
fn period(secs: f64) -> Duration {
    let max = Duration::from_secs_f64(MAX_PERIOD_SECS);
    Duration::try_from_secs_f64(secs).map_or(max, |d| d.min(max))
}

fn check_topics(name: &str, topics: &[String]) -> AppResult<()> {
    for topic in topics {
        Address::parse(topic).map_err(|e| DaqError::Configuration(format!("{name}: {e}")))?;
    }
    Ok(())
}
