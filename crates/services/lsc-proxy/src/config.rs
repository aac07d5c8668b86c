//! Configuration for the LSC proxy
//!
//! Loaded from `settings.yaml`. The credential sections are required; every
//! other section falls back to the defaults the camera setup ships with.
//! A few secrets can be overridden from the environment.

use lsc_tutk::{ClientStartParams, Credentials, SessionParams, StatusCodes};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sink::RecoveryPolicy;

/// Main configuration for the proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Home Assistant MQTT connection
    pub homeassistant_credentials: HomeAssistantCredentials,

    /// AV login on the camera
    pub tutk_credentials: TutkCredentials,

    /// Filesystem locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// Ingestion tuning
    #[serde(default)]
    pub stream: StreamConfig,

    /// External process supervision
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// MQTT discovery and publishing
    #[serde(default)]
    pub bus: BusConfig,

    /// Device SDK session parameters
    #[serde(default)]
    pub session: SessionConfig,
}

/// Home Assistant MQTT credentials
///
/// The broker fields are only required when `enabled` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomeAssistantCredentials {
    pub enabled: bool,

    #[serde(default)]
    pub mqtt_username: Option<String>,

    #[serde(default)]
    pub mqtt_password: Option<String>,

    #[serde(default)]
    pub mqtt_hostname: Option<String>,

    #[serde(default)]
    pub mqtt_port: Option<u16>,
}

/// Resolved broker connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttSettings {
    pub username: String,
    pub password: String,
    pub hostname: String,
    pub port: u16,
}

/// AV login on the camera
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TutkCredentials {
    pub av_username: String,
    pub av_password: String,
}

/// Filesystem locations, relative to the working directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory holding both FIFOs
    #[serde(default = "default_fifos_dir")]
    pub fifos_dir: PathBuf,

    /// Raw PCM FIFO read by ffmpeg
    #[serde(default = "default_audio_fifo")]
    pub audio_fifo: PathBuf,

    /// Raw H.264 FIFO read by ffmpeg
    #[serde(default = "default_video_fifo")]
    pub video_fifo: PathBuf,

    /// One file per toggle with its last state
    #[serde(default = "default_states_dir")]
    pub states_dir: PathBuf,

    /// Vendor SDK shared object
    #[serde(default = "default_sdk_library")]
    pub sdk_library: PathBuf,

    /// Transcoder executable
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: PathBuf,

    /// Restreaming server executable
    #[serde(default = "default_mediamtx")]
    pub mediamtx: PathBuf,

    /// Restreaming server configuration file
    #[serde(default = "default_mediamtx_config")]
    pub mediamtx_config: PathBuf,
}

fn default_fifos_dir() -> PathBuf {
    PathBuf::from("fifos")
}

fn default_audio_fifo() -> PathBuf {
    PathBuf::from("fifos/audio_fifo")
}

fn default_video_fifo() -> PathBuf {
    PathBuf::from("fifos/video_fifo")
}

fn default_states_dir() -> PathBuf {
    PathBuf::from("states")
}

fn default_sdk_library() -> PathBuf {
    PathBuf::from("libs/x64/libIOTCAPIs_ALL.so")
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_mediamtx() -> PathBuf {
    PathBuf::from("rtsp/mediamtx")
}

fn default_mediamtx_config() -> PathBuf {
    PathBuf::from("rtsp/mediamtx.yml")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            fifos_dir: default_fifos_dir(),
            audio_fifo: default_audio_fifo(),
            video_fifo: default_video_fifo(),
            states_dir: default_states_dir(),
            sdk_library: default_sdk_library(),
            ffmpeg: default_ffmpeg(),
            mediamtx: default_mediamtx(),
            mediamtx_config: default_mediamtx_config(),
        }
    }
}

/// Ingestion tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Bytes per audio pull
    #[serde(default = "default_audio_buf_size")]
    pub audio_buf_size: usize,

    /// Bytes per video pull
    #[serde(default = "default_video_buf_size")]
    pub video_buf_size: usize,

    /// Minimum buffered audio frames before pulling
    #[serde(default = "default_audio_low_watermark")]
    pub audio_low_watermark: usize,

    /// Sleep between retries of a not-ready pull or a failed write
    #[serde(default = "default_ingest_backoff_ms")]
    pub ingest_backoff_ms: u64,

    /// Sleep between device buffer reclamations
    #[serde(default = "default_reclaim_interval_secs")]
    pub reclaim_interval_secs: u64,

    /// What the video sink does after a failed write
    #[serde(default)]
    pub video_recovery: RecoveryPolicy,

    /// What the audio sink does after a failed write
    #[serde(default)]
    pub audio_recovery: RecoveryPolicy,

    /// RTSP endpoint the transcoder pushes to
    #[serde(default = "default_rtsp_url")]
    pub rtsp_url: String,

    /// Time given to the restreamer before ingestion starts
    #[serde(default = "default_restream_warmup_secs")]
    pub restream_warmup_secs: u64,

    /// Delay between starting audio and the background services
    #[serde(default = "default_audio_start_delay_secs")]
    pub audio_start_delay_secs: u64,
}

fn default_audio_buf_size() -> usize {
    512
}

fn default_video_buf_size() -> usize {
    64000
}

fn default_audio_low_watermark() -> usize {
    50
}

fn default_ingest_backoff_ms() -> u64 {
    10
}

fn default_reclaim_interval_secs() -> u64 {
    5
}

fn default_rtsp_url() -> String {
    "rtsp://localhost:8554/stream".to_string()
}

fn default_restream_warmup_secs() -> u64 {
    2
}

fn default_audio_start_delay_secs() -> u64 {
    1
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            audio_buf_size: default_audio_buf_size(),
            video_buf_size: default_video_buf_size(),
            audio_low_watermark: default_audio_low_watermark(),
            ingest_backoff_ms: default_ingest_backoff_ms(),
            reclaim_interval_secs: default_reclaim_interval_secs(),
            video_recovery: RecoveryPolicy::default(),
            audio_recovery: RecoveryPolicy::default(),
            rtsp_url: default_rtsp_url(),
            restream_warmup_secs: default_restream_warmup_secs(),
            audio_start_delay_secs: default_audio_start_delay_secs(),
        }
    }
}

impl StreamConfig {
    pub fn ingest_backoff(&self) -> Duration {
        Duration::from_millis(self.ingest_backoff_ms)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs)
    }
}

/// External process supervision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Exit codes that end supervision instead of relaunching
    #[serde(default = "default_clean_exit_codes")]
    pub clean_exit_codes: Vec<i32>,

    /// Pause before relaunching a crashed process (0 relaunches at once)
    #[serde(default = "default_relaunch_delay_ms")]
    pub relaunch_delay_ms: u64,

    /// Time allowed between SIGTERM and SIGKILL
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

fn default_clean_exit_codes() -> Vec<i32> {
    // 255 is what ffmpeg reports after SIGINT/SIGTERM
    vec![0, 255]
}

fn default_relaunch_delay_ms() -> u64 {
    0
}

fn default_stop_grace_ms() -> u64 {
    3000
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            clean_exit_codes: default_clean_exit_codes(),
            relaunch_delay_ms: default_relaunch_delay_ms(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

/// MQTT discovery and publishing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_client_id")]
    pub client_id: String,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// How many times each discovery payload is sent per connect
    #[serde(default = "default_discovery_repeats")]
    pub discovery_repeats: u32,

    #[serde(default = "default_discovery_interval_ms")]
    pub discovery_interval_ms: u64,

    /// Period of the background state republish
    #[serde(default = "default_state_publish_interval_ms")]
    pub state_publish_interval_ms: u64,

    /// Home Assistant device metadata
    #[serde(default)]
    pub device: DeviceInfo,
}

fn default_client_id() -> String {
    "ha-client".to_string()
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_discovery_repeats() -> u32 {
    3
}

fn default_discovery_interval_ms() -> u64 {
    1000
}

fn default_state_publish_interval_ms() -> u64 {
    1000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            keep_alive_secs: default_keep_alive_secs(),
            discovery_repeats: default_discovery_repeats(),
            discovery_interval_ms: default_discovery_interval_ms(),
            state_publish_interval_ms: default_state_publish_interval_ms(),
            device: DeviceInfo::default(),
        }
    }
}

/// Device block of the discovery payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(default = "default_device_identifier")]
    pub identifier: String,

    #[serde(default = "default_device_manufacturer")]
    pub manufacturer: String,

    #[serde(default = "default_device_model")]
    pub model: String,

    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_identifier() -> String {
    "02LSC02".to_string()
}

fn default_device_manufacturer() -> String {
    "LSC".to_string()
}

fn default_device_model() -> String {
    "LSC Smart Connect Indoor Camera".to_string()
}

fn default_device_name() -> String {
    "LSC Indoor Camera".to_string()
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            identifier: default_device_identifier(),
            manufacturer: default_device_manufacturer(),
            model: default_device_model(),
            name: default_device_name(),
        }
    }
}

/// Device SDK session parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub udp_port: u16,

    #[serde(default = "default_max_av_channels")]
    pub max_av_channels: i32,

    #[serde(default = "default_client_start_timeout_secs")]
    pub client_start_timeout_secs: u32,

    #[serde(default)]
    pub channel: u8,

    /// Vendor status codes the ingestion loops distinguish
    #[serde(default)]
    pub status_codes: StatusCodes,
}

fn default_max_av_channels() -> i32 {
    2
}

fn default_client_start_timeout_secs() -> u32 {
    20
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            udp_port: 0,
            max_av_channels: default_max_av_channels(),
            client_start_timeout_secs: default_client_start_timeout_secs(),
            channel: 0,
            status_codes: StatusCodes::default(),
        }
    }
}

impl Config {
    /// Load, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML file without overrides or validation
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply `LSC_*` environment overrides
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let ha = &mut self.homeassistant_credentials;
        if let Some(password) = lookup("LSC_MQTT_PASSWORD") {
            ha.mqtt_password = Some(password);
        }
        if let Some(hostname) = lookup("LSC_MQTT_HOSTNAME") {
            ha.mqtt_hostname = Some(hostname);
        }
        if let Some(port) = lookup("LSC_MQTT_PORT") {
            match port.parse() {
                Ok(p) => ha.mqtt_port = Some(p),
                Err(_) => tracing::warn!("Ignoring invalid LSC_MQTT_PORT '{}'", port),
            }
        }
        if let Some(password) = lookup("LSC_AV_PASSWORD") {
            self.tutk_credentials.av_password = password;
        }
    }

    /// Check cross-field requirements serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mqtt()?;
        if self.stream.audio_buf_size == 0 || self.stream.video_buf_size == 0 {
            return Err(ConfigError::Invalid(
                "stream buffer sizes must be non-zero".to_string(),
            ));
        }

        let intervals = [
            ("stream.reclaim_interval_secs", self.stream.reclaim_interval_secs),
            ("bus.discovery_interval_ms", self.bus.discovery_interval_ms),
            ("bus.state_publish_interval_ms", self.bus.state_publish_interval_ms),
        ];
        if let Some((key, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{} must be non-zero", key)));
        }
        if self.bus.discovery_repeats == 0 {
            return Err(ConfigError::Invalid(
                "bus.discovery_repeats must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Broker settings, or `None` when Home Assistant integration is disabled
    pub fn mqtt(&self) -> Result<Option<MqttSettings>, ConfigError> {
        let ha = &self.homeassistant_credentials;
        if !ha.enabled {
            return Ok(None);
        }

        fn required<T: Clone>(value: &Option<T>, key: &'static str) -> Result<T, ConfigError> {
            value.clone().ok_or(ConfigError::MissingKey(key))
        }

        Ok(Some(MqttSettings {
            username: required(&ha.mqtt_username, "homeassistant_credentials.mqtt_username")?,
            password: required(&ha.mqtt_password, "homeassistant_credentials.mqtt_password")?,
            hostname: required(&ha.mqtt_hostname, "homeassistant_credentials.mqtt_hostname")?,
            port: required(&ha.mqtt_port, "homeassistant_credentials.mqtt_port")?,
        }))
    }

    /// SDK session parameters for the camera `uid`
    pub fn session_params(&self, uid: &str) -> SessionParams {
        SessionParams {
            uid: uid.to_string(),
            udp_port: self.session.udp_port,
            max_av_channels: self.session.max_av_channels,
            client: ClientStartParams {
                credentials: Credentials {
                    username: self.tutk_credentials.av_username.clone(),
                    password: self.tutk_credentials.av_password.clone(),
                },
                timeout_secs: self.session.client_start_timeout_secs,
                channel: self.session.channel,
            },
            codes: self.session.status_codes,
        }
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Required key not found: {0}")]
    MissingKey(&'static str),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
