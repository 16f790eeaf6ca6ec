use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::config::Config;

pub const ACCEPTED_MODES: [&str; 3] = ["record", "playback", "disabled"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Record,
    Playback,
    Disabled,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Record => "record",
            Self::Playback => "playback",
            Self::Disabled => "disabled",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = InvalidModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "record" => Ok(Self::Record),
            "playback" => Ok(Self::Playback),
            "disabled" => Ok(Self::Disabled),
            _ => Err(InvalidModeError {
                value: s.to_owned(),
            }),
        }
    }
}

impl<'de> Deserialize<'de> for Mode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid mode `{value}`; expected one of record, playback, disabled")]
pub struct InvalidModeError {
    value: String,
}

impl InvalidModeError {
    pub fn value(&self) -> &str {
        &self.value
    }
}

/// Resolves the active mode. An explicit override always wins; otherwise the
/// flag is parsed case-insensitively and an unset or blank flag means
/// [`Mode::Disabled`].
pub fn resolve_mode(force_mode: Option<Mode>, flag: Option<&str>) -> Result<Mode, InvalidModeError> {
    if let Some(mode) = force_mode {
        return Ok(mode);
    }

    match flag.map(str::trim).filter(|value| !value.is_empty()) {
        Some(raw) => raw.parse(),
        None => Ok(Mode::Disabled),
    }
}

pub fn read_mode_flag(var_name: &str) -> Option<String> {
    std::env::var(var_name).ok()
}

pub fn resolve_mode_from_env(
    force_mode: Option<Mode>,
    var_name: &str,
) -> Result<Mode, InvalidModeError> {
    resolve_mode(force_mode, read_mode_flag(var_name).as_deref())
}

/// Values used for options the configuration leaves unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeDefaults {
    pub playback_fallback: bool,
    pub embed_bodies: bool,
}

impl ModeDefaults {
    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            // Playback may auto-fall back into recording, so it embeds too.
            Mode::Record | Mode::Playback => Self {
                playback_fallback: false,
                embed_bodies: true,
            },
            Mode::Disabled => Self {
                playback_fallback: false,
                embed_bodies: false,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    ForceModeOverridesDisabledFlag { force_mode: Mode },
    ForceModeOverridesFlag { force_mode: Mode, flag_mode: Mode },
    LiveFallbackShadowedByAutoRecord,
    RecordOptionsUnreachable,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ForceModeOverridesDisabledFlag { force_mode } => write!(
                f,
                "mode flag is `disabled` but force mode `{force_mode}` is configured; force mode wins"
            ),
            Self::ForceModeOverridesFlag {
                force_mode,
                flag_mode,
            } => write!(
                f,
                "mode flag `{flag_mode}` is ignored because force mode `{force_mode}` is configured"
            ),
            Self::LiveFallbackShadowedByAutoRecord => f.write_str(
                "`playback.fallback` never applies to a missing log while `auto_record_fallback` is enabled",
            ),
            Self::RecordOptionsUnreachable => f.write_str(
                "`[record]` options are set but playback runs with `auto_record_fallback = false`; they cannot apply",
            ),
        }
    }
}

/// Flags contradictory combinations. These are advisory; none of them stop
/// the engine.
pub fn check_consistency(config: &Config, flag: Option<&str>, resolved: Mode) -> Vec<ConfigWarning> {
    let mut warnings = Vec::new();
    let flag_mode = flag
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse::<Mode>().ok());

    if let Some(force_mode) = config.force_mode {
        match flag_mode {
            Some(Mode::Disabled) if force_mode != Mode::Disabled => {
                warnings.push(ConfigWarning::ForceModeOverridesDisabledFlag { force_mode });
            }
            Some(flag_mode) if flag_mode != force_mode => {
                warnings.push(ConfigWarning::ForceModeOverridesFlag {
                    force_mode,
                    flag_mode,
                });
            }
            _ => {}
        }
    }

    if resolved == Mode::Playback {
        if config.playback.fallback == Some(true) && config.auto_record_fallback {
            warnings.push(ConfigWarning::LiveFallbackShadowedByAutoRecord);
        }
        if !config.auto_record_fallback && config.record.is_customized() {
            warnings.push(ConfigWarning::RecordOptionsUnreachable);
        }
    }

    warnings
}
