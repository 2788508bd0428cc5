//! Runtime and sensor configuration
//!
//! Runtime knobs come from environment variables with defaults; the derived
//! sensors themselves come from a JSON definitions file. Each definition is
//! validated independently at load, so one bad entry never takes down the
//! others.

use {
    crate::scheduler::ResetPolicy,
    crate::tracker::Mode,
    chrono::NaiveTime,
    serde::Deserialize,
    std::collections::HashSet,
    std::env,
    std::fs,
    std::path::{Path, PathBuf},
};

#[derive(Debug)]
pub enum ConfigError {
    Unreadable(String),
    Parse(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Unreadable(msg) => write!(f, "Cannot read definitions file: {}", msg),
            ConfigError::Parse(msg) => write!(f, "Cannot parse definitions file: {}", msg),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Process-level configuration from environment variables
///
/// Environment variables:
/// - `EXTREMA_CONFIG_PATH` (default: extrema.json)
/// - `EXTREMA_STATE_PATH` (default: extrema_state.json)
/// - `EXTREMA_AUTOSAVE_SECS` (default: 60)
/// - `EXTREMA_CHANNEL_BUFFER` (default: 64)
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub config_path: PathBuf,
    pub state_path: PathBuf,
    pub autosave_secs: u64,
    pub channel_buffer: usize,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self {
            config_path: env::var("EXTREMA_CONFIG_PATH")
                .unwrap_or_else(|_| "extrema.json".to_string())
                .into(),

            state_path: env::var("EXTREMA_STATE_PATH")
                .unwrap_or_else(|_| "extrema_state.json".to_string())
                .into(),

            autosave_secs: env::var("EXTREMA_AUTOSAVE_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(60),

            channel_buffer: env::var("EXTREMA_CHANNEL_BUFFER")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(64),
        }
    }
}

/// One entry of the definitions file, as written by the operator
#[derive(Debug, Clone, Deserialize)]
pub struct SensorDefinition {
    pub name: Option<String>,
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    pub entity_ids: Vec<String>,
    #[serde(default = "default_time")]
    pub time: String,
    #[serde(default)]
    pub manual_reset_only: bool,
    #[serde(default = "default_round_digits")]
    pub round_digits: i32,
}

fn default_kind() -> String {
    "max".to_string()
}

fn default_time() -> String {
    "00:00:00".to_string()
}

fn default_round_digits() -> i32 {
    2
}

/// A validated definition, ready to build an instance from
#[derive(Debug, Clone)]
pub struct ResolvedSensor {
    pub name: String,
    pub mode: Mode,
    pub entity_ids: HashSet<String>,
    pub reset_policy: ResetPolicy,
    pub round_digits: i32,
}

impl SensorDefinition {
    pub fn resolve(&self) -> Result<ResolvedSensor, ConfigError> {
        let mode = Mode::from_str(&self.kind).ok_or_else(|| {
            ConfigError::InvalidValue(format!(
                "unknown sensor type '{}' (expected 'min' or 'max')",
                self.kind
            ))
        })?;

        if self.entity_ids.is_empty() {
            return Err(ConfigError::InvalidValue(
                "entity_ids must not be empty".to_string(),
            ));
        }

        // time is ignored for manual-only sensors
        let reset_policy = if self.manual_reset_only {
            ResetPolicy::ManualOnly
        } else {
            let time = NaiveTime::parse_from_str(&self.time, "%H:%M:%S").map_err(|_| {
                ConfigError::InvalidValue(format!(
                    "invalid reset time '{}' (expected HH:MM:SS)",
                    self.time
                ))
            })?;
            ResetPolicy::DailyAt(time)
        };

        let name = self
            .name
            .clone()
            .unwrap_or_else(|| format!("{} sensor", capitalize(mode.as_str())));

        Ok(ResolvedSensor {
            name,
            mode,
            entity_ids: self.entity_ids.iter().cloned().collect(),
            reset_policy,
            round_digits: self.round_digits,
        })
    }
}

/// Read the definitions file (a JSON array of entries)
pub fn load_definitions(path: &Path) -> Result<Vec<SensorDefinition>, ConfigError> {
    let json = fs::read_to_string(path)
        .map_err(|e| ConfigError::Unreadable(format!("{}: {}", path.display(), e)))?;
    serde_json::from_str(&json).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Resolve every definition, skipping (and reporting) the invalid ones and
/// any duplicate names. Only entries returned here become instances.
pub fn resolve_all(definitions: &[SensorDefinition]) -> Vec<ResolvedSensor> {
    let mut seen_names = HashSet::new();
    let mut resolved = Vec::new();

    for definition in definitions {
        match definition.resolve() {
            Ok(sensor) => {
                if !seen_names.insert(sensor.name.clone()) {
                    log::error!("Duplicate sensor name '{}', entry skipped", sensor.name);
                    continue;
                }
                resolved.push(sensor);
            }
            Err(e) => {
                let label = definition.name.as_deref().unwrap_or("<unnamed>");
                log::error!("Sensor definition '{}' rejected: {}", label, e);
            }
        }
    }

    resolved
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
