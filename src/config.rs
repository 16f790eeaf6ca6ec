use std::{
    collections::BTreeMap,
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::mode::{Mode, ModeDefaults};

pub const DEFAULT_MODE_ENV: &str = "TRAFFIC_REPLAY_MODE";
pub const DEFAULT_LOG_DIR: &str = "traffic-logs";
const DEFAULT_MAX_NAME_LEN: usize = 100;
const DEFAULT_LOCK_ATTEMPTS: u32 = 20;
const DEFAULT_LOCK_INITIAL_BACKOFF_MS: u64 = 25;
const DEFAULT_LOCK_MAX_BACKOFF_MS: u64 = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-instance override of the mode flag.
    #[serde(rename = "mode", skip_serializing_if = "Option::is_none")]
    pub force_mode: Option<Mode>,
    /// Environment variable holding the mode flag.
    pub mode_env: String,
    pub auto_record_fallback: bool,
    pub logs: LogNamingConfig,
    pub lock: LockConfig,
    pub record: RecordConfig,
    pub playback: PlaybackConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            force_mode: None,
            mode_env: DEFAULT_MODE_ENV.to_owned(),
            auto_record_fallback: true,
            logs: LogNamingConfig::default(),
            lock: LockConfig::default(),
            record: RecordConfig::default(),
            playback: PlaybackConfig::default(),
            proxy: None,
            logging: None,
        }
    }
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    /// Resolves unset options against the defaults of `mode`.
    pub fn effective(&self, mode: Mode) -> EffectiveConfig {
        let defaults = ModeDefaults::for_mode(mode);
        EffectiveConfig {
            mode,
            auto_record_fallback: self.auto_record_fallback,
            log_dir: self.logs.dir.clone(),
            record_url_filter: self.record.url_filter.clone(),
            embed_bodies: self.record.embed_bodies.unwrap_or(defaults.embed_bodies),
            body_capture: self.record.body_capture,
            playback_url_filter: self.playback.url_filter.clone(),
            playback_fallback: self.playback.fallback.unwrap_or(defaults.playback_fallback),
            match_query: self.playback.match_query,
            stateful_mock: self.playback.stateful_mock,
        }
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogNamingConfig {
    pub dir: PathBuf,
    /// Nest logs under a directory named after the source test file.
    pub organize_by_file: bool,
    pub max_name_len: usize,
    /// Append a short hash of the test id so equal titles do not collide.
    pub include_test_id: bool,
}

impl Default for LogNamingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_LOG_DIR),
            organize_by_file: true,
            max_name_len: DEFAULT_MAX_NAME_LEN,
            include_test_id: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_LOCK_ATTEMPTS,
            initial_backoff_ms: DEFAULT_LOCK_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_LOCK_MAX_BACKOFF_MS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordConfig {
    /// Regex over the full request URL; unset records everything.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embed_bodies: Option<bool>,
    pub body_capture: BodyCapture,
}

impl RecordConfig {
    pub(crate) fn is_customized(&self) -> bool {
        self != &Self::default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyCapture {
    /// Text for UTF-8 bodies with a textual MIME type, base64 otherwise.
    #[default]
    Auto,
    Base64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Let unmatched requests reach the network instead of aborting them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_filter: Option<String>,
    pub match_query: QueryMatchMode,
    pub stateful_mock: StatefulMockMode,
    pub remap: RemapConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMatchMode {
    #[default]
    Exact,
    Normalized,
    Ignore,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatefulMockMode {
    #[default]
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemapConfig {
    /// Recorded hostname -> replay hostname.
    pub hosts: BTreeMap<String, String>,
    pub rules: Vec<RemapRuleConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemapRuleConfig {
    pub pattern: String,
    pub replacement: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    /// Origin every proxied request is forwarded to, e.g. `https://api.example.com`.
    pub upstream: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Read-only snapshot of the options in force for one engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveConfig {
    pub mode: Mode,
    pub auto_record_fallback: bool,
    pub log_dir: PathBuf,
    pub record_url_filter: Option<String>,
    pub embed_bodies: bool,
    pub body_capture: BodyCapture,
    pub playback_url_filter: Option<String>,
    pub playback_fallback: bool,
    pub match_query: QueryMatchMode,
    pub stateful_mock: StatefulMockMode,
}
