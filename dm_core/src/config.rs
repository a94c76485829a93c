//! Persisted configuration
//!
//! Buses, known motors (with their per-motor scale limits) and watchdog
//! timing are stored together in a single YAML document. TOML is accepted
//! when the file extension says so.
//!
//! # Example YAML
//!
//! ```yaml
//! buses:
//!   - channel: canB
//!     bitrate: 1000000
//! motors:
//!   - esc_id: 1
//!     mst_id: 17
//!     name: shoulder
//!     group: arm
//!     metadata:
//!       p_max: 12.5
//!       v_max: 30.0
//!       t_max: 10.0
//! watchdog:
//!   threshold_ms: 500
//!   cooldown_ms: 2000
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::driver::BackendKind;
use crate::error::{DmError, DmResult};

/// Default position scale [rad]
pub const DEFAULT_P_MAX: f64 = 12.0;
/// Default velocity scale [rad/s]
pub const DEFAULT_V_MAX: f64 = 30.0;
/// Default torque scale [Nm]
pub const DEFAULT_T_MAX: f64 = 20.0;

const DEFAULT_CHANNEL: &str = "canB";
const DEFAULT_BITRATE: u32 = 1_000_000;

/// Per-motor feedback scale limits
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleLimits {
    pub p_max: f64,
    pub v_max: f64,
    pub t_max: f64,
}

impl Default for ScaleLimits {
    fn default() -> Self {
        Self {
            p_max: DEFAULT_P_MAX,
            v_max: DEFAULT_V_MAX,
            t_max: DEFAULT_T_MAX,
        }
    }
}

/// Configuration describing a CAN interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Interface name (e.g., "can0", "vcan0")
    pub channel: String,

    #[serde(default = "default_bitrate")]
    pub bitrate: u32,

    #[serde(default)]
    pub backend: BackendKind,
}

fn default_bitrate() -> u32 {
    DEFAULT_BITRATE
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            channel: DEFAULT_CHANNEL.to_string(),
            bitrate: DEFAULT_BITRATE,
            backend: BackendKind::SocketCan,
        }
    }
}

/// Persisted metadata for a discovered/configured motor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorRecord {
    pub esc_id: u8,
    pub mst_id: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    /// Free-form metadata; `p_max`, `v_max` and `t_max` are read back as scale limits
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_yaml::Value>,
}

impl MotorRecord {
    pub fn new(esc_id: u8, mst_id: u16) -> Self {
        Self {
            esc_id,
            mst_id,
            name: None,
            group: None,
            metadata: BTreeMap::new(),
        }
    }

    fn metadata_f64(&self, key: &str) -> Option<f64> {
        self.metadata
            .get(key)
            .and_then(|v| v.as_f64())
            .filter(|v| v.is_finite() && *v > 0.0)
    }

    /// Scale limits for this motor, falling back to defaults per field
    pub fn scale_limits(&self) -> ScaleLimits {
        let defaults = ScaleLimits::default();
        ScaleLimits {
            p_max: self.metadata_f64("p_max").unwrap_or(defaults.p_max),
            v_max: self.metadata_f64("v_max").unwrap_or(defaults.v_max),
            t_max: self.metadata_f64("t_max").unwrap_or(defaults.t_max),
        }
    }

    pub fn set_scale_limits(&mut self, limits: ScaleLimits) {
        self.metadata.insert("p_max".into(), limits.p_max.into());
        self.metadata.insert("v_max".into(), limits.v_max.into());
        self.metadata.insert("t_max".into(), limits.t_max.into());
    }

    /// Display label: name if set, otherwise the ESC id in hex
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("ESC 0x{:02X}", self.esc_id),
        }
    }
}

/// Watchdog timing
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Telemetry age at which a motor is considered stale
    pub threshold_ms: u64,
    /// Minimum spacing between two disables of the same motor
    pub cooldown_ms: u64,
    /// Tick period
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

fn default_interval_ms() -> u64 {
    100
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            threshold_ms: 500,
            cooldown_ms: 2_000,
            interval_ms: default_interval_ms(),
        }
    }
}

impl WatchdogConfig {
    /// Build a validated config
    pub fn new(threshold: Duration, cooldown: Duration, interval: Duration) -> DmResult<Self> {
        let config = Self {
            threshold_ms: threshold.as_millis() as u64,
            cooldown_ms: cooldown.as_millis() as u64,
            interval_ms: interval.as_millis() as u64,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DmResult<()> {
        if self.threshold_ms == 0 {
            return Err(DmError::config("watchdog threshold must be positive"));
        }
        if self.interval_ms == 0 {
            return Err(DmError::config("watchdog interval must be positive"));
        }
        if self.cooldown_ms < self.threshold_ms {
            return Err(DmError::config(format!(
                "watchdog cooldown ({} ms) must not be shorter than the threshold ({} ms)",
                self.cooldown_ms, self.threshold_ms
            )));
        }
        Ok(())
    }

    pub fn threshold(&self) -> Duration {
        Duration::from_millis(self.threshold_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Top-level configuration persisted between sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub buses: Vec<BusConfig>,

    #[serde(default)]
    pub motors: Vec<MotorRecord>,

    #[serde(default)]
    pub watchdog: WatchdogConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            buses: vec![BusConfig::default()],
            motors: Vec::new(),
            watchdog: WatchdogConfig::default(),
        }
    }
}

impl AppConfig {
    /// Parse config from YAML string
    pub fn from_yaml(contents: &str) -> DmResult<Self> {
        let config: Self = serde_yaml::from_str(contents)
            .map_err(|e| DmError::config(format!("Failed to parse config YAML: {}", e)))?;
        config.normalized()
    }

    /// Parse config from TOML string
    pub fn from_toml(contents: &str) -> DmResult<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| DmError::config(format!("Failed to parse config TOML: {}", e)))?;
        config.normalized()
    }

    fn normalized(mut self) -> DmResult<Self> {
        if self.buses.is_empty() {
            self.buses.push(BusConfig::default());
        }
        self.watchdog.validate()?;
        Ok(self)
    }

    /// Look up a motor by ESC id
    pub fn motor(&self, esc_id: u8) -> Option<&MotorRecord> {
        self.motors.iter().find(|m| m.esc_id == esc_id)
    }

    /// Look up the motor whose feedback arrives on `mst_id`
    pub fn motor_by_mst(&self, mst_id: u16) -> Option<&MotorRecord> {
        self.motors.iter().find(|m| m.mst_id == mst_id)
    }

    /// Scale limits for `esc_id`, defaults if the motor is unknown
    pub fn scale_limits(&self, esc_id: u8) -> ScaleLimits {
        self.motor(esc_id)
            .map(MotorRecord::scale_limits)
            .unwrap_or_default()
    }

    /// Motors belonging to `group`, in configuration order
    pub fn group(&self, group: &str) -> Vec<&MotorRecord> {
        self.motors
            .iter()
            .filter(|m| m.group.as_deref() == Some(group))
            .collect()
    }

    /// Add `channel` if not already present
    pub fn ensure_bus(&mut self, channel: &str, bitrate: u32) -> &mut Self {
        if !self.buses.iter().any(|b| b.channel == channel) {
            self.buses.push(BusConfig {
                channel: channel.to_string(),
                bitrate,
                backend: BackendKind::SocketCan,
            });
        }
        self
    }

    /// Record a discovered `(esc_id, mst_id)` pair, keeping names and metadata
    pub fn upsert_motor(&mut self, esc_id: u8, mst_id: u16) -> &mut MotorRecord {
        let index = match self.motors.iter().position(|m| m.esc_id == esc_id) {
            Some(index) => {
                self.motors[index].mst_id = mst_id;
                index
            }
            None => {
                self.motors.push(MotorRecord::new(esc_id, mst_id));
                self.motors.len() - 1
            }
        };
        &mut self.motors[index]
    }

    /// Store fetched scale parameters for a known motor
    pub fn set_scale_limits(&mut self, esc_id: u8, limits: ScaleLimits) -> DmResult<()> {
        let motor = self
            .motors
            .iter_mut()
            .find(|m| m.esc_id == esc_id)
            .ok_or_else(|| DmError::config(format!("ESC 0x{:02X} is not configured", esc_id)))?;
        motor.set_scale_limits(limits);
        Ok(())
    }
}

/// Default configuration directory (`~/.config/dm_tui` on Linux)
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dm_tui")
}

/// Default configuration file
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.yaml")
}

fn is_toml(path: &Path) -> bool {
    path.extension().and_then(|s| s.to_str()) == Some("toml")
}

/// Load configuration from `path` or the default location
///
/// A missing file yields the default config; its parent directory is
/// created so a later save succeeds.
pub fn load_config(path: Option<&Path>) -> DmResult<AppConfig> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        log::debug!("No config at {}, using defaults", path.display());
        return Ok(AppConfig::default());
    }

    let contents = std::fs::read_to_string(&path)
        .map_err(|e| DmError::config(format!("Failed to read config: {}", e)))?;
    if contents.trim().is_empty() {
        return Ok(AppConfig::default());
    }
    if is_toml(&path) {
        AppConfig::from_toml(&contents)
    } else {
        AppConfig::from_yaml(&contents)
    }
}

/// Persist `config` to `path` or the default location
pub fn save_config(config: &AppConfig, path: Option<&Path>) -> DmResult<()> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let contents = if is_toml(&path) {
        toml::to_string_pretty(config)?
    } else {
        serde_yaml::to_string(config)?
    };

    std::fs::write(&path, contents)
        .map_err(|e| DmError::config(format!("Failed to write config: {}", e)))?;
    log::info!("Saved config to {}", path.display());
    Ok(())
}

/// Configuration files present in `dir` (defaults to the config directory)
pub fn list_config_files(dir: Option<&Path>) -> DmResult<Vec<PathBuf>> {
    let dir = dir.map(Path::to_path_buf).unwrap_or_else(default_config_dir);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            matches!(
                p.extension().and_then(|s| s.to_str()),
                Some("yaml") | Some("yml") | Some("toml")
            )
        })
        .collect();
    files.sort();
    Ok(files)
}
