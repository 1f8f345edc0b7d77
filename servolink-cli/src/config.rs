//! Configuration file support for servolink.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (SERVOLINK_*)
//! 3. Explicit `--config PATH`, or else the local config file (./servolink.toml)
//! 4. Global config file (~/.config/servolink/config.toml)

use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use servolink::ActuatorProfile;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Local configuration file name.
pub const LOCAL_CONFIG: &str = "servolink.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Paired controller port (e.g., "/dev/rfcomm0" or "COM7").
    pub port: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
    /// Command acknowledgement timeout in milliseconds.
    pub ack_timeout_ms: Option<u64>,
}

/// Actuator settings pushed by `servolink sync`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileConfig {
    /// Actuator model (6600 or 6700).
    pub actuator_type: Option<u16>,
    /// Extension offset in degrees.
    pub extend_offset: Option<i16>,
    /// Retraction offset in degrees.
    pub retract_offset: Option<i16>,
    /// Dwell at the extended end in milliseconds.
    pub extend_dwell_ms: Option<u32>,
    /// Dwell at the retracted end in milliseconds.
    pub retract_dwell_ms: Option<u32>,
    /// Speed in percent.
    pub speed: Option<u8>,
    /// Device-driven cycle target (0 = infinite).
    pub cycles: Option<u32>,
}

impl ProfileConfig {
    /// Resolve against the controller defaults.
    pub fn to_profile(&self) -> ActuatorProfile {
        let d = ActuatorProfile::default();
        ActuatorProfile {
            actuator_type: self.actuator_type.unwrap_or(d.actuator_type),
            extend_offset: self.extend_offset.unwrap_or(d.extend_offset),
            retract_offset: self.retract_offset.unwrap_or(d.retract_offset),
            extend_dwell_ms: self.extend_dwell_ms.unwrap_or(d.extend_dwell_ms),
            retract_dwell_ms: self.retract_dwell_ms.unwrap_or(d.retract_dwell_ms),
            speed: self.speed.unwrap_or(d.speed),
            cycles: self.cycles.unwrap_or(d.cycles),
        }
    }

    fn merge(&mut self, other: Self) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field;
                })*
            };
        }
        take!(
            actuator_type,
            extend_offset,
            retract_offset,
            extend_dwell_ms,
            retract_dwell_ms,
            speed,
            cycles
        );
    }
}

/// Firmware update configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateConfig {
    /// Block payload size in bytes.
    pub block_size: Option<u16>,
    /// Attempts per block before aborting.
    pub block_attempts: Option<u32>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Actuator profile.
    #[serde(default)]
    pub profile: ProfileConfig,
    /// Firmware update settings.
    #[serde(default)]
    pub update: UpdateConfig,
}

impl Config {
    /// Load configuration from the global and local files.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "servolink").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.connection.port.is_some() {
            self.connection.port = other.connection.port;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }
        if other.connection.ack_timeout_ms.is_some() {
            self.connection.ack_timeout_ms = other.connection.ack_timeout_ms;
        }

        self.profile.merge(other.profile);

        if other.update.block_size.is_some() {
            self.update.block_size = other.update.block_size;
        }
        if other.update.block_attempts.is_some() {
            self.update.block_attempts = other.update.block_attempts;
        }
    }

    /// Apply the configured timeouts and retry bounds.
    pub fn apply_session(&self, session: &mut servolink::SessionConfig) {
        if let Some(ms) = self.connection.ack_timeout_ms {
            session.ack_timeout = Duration::from_millis(ms);
        }
        if let Some(size) = self.update.block_size {
            session.block_size = size;
        }
        if let Some(attempts) = self.update.block_attempts {
            session.block_attempts = attempts;
        }
    }

    /// Remember the paired port for future runs.
    ///
    /// Written to the local config if one exists, else to the global one.
    pub fn remember_port(&mut self, port: &str) -> anyhow::Result<PathBuf> {
        let path = if Path::new(LOCAL_CONFIG).exists() {
            PathBuf::from(LOCAL_CONFIG)
        } else if let Some(global_dir) = Self::global_config_dir() {
            fs::create_dir_all(&global_dir)?;
            global_dir.join("config.toml")
        } else {
            PathBuf::from(LOCAL_CONFIG)
        };

        Self::store_port(&path, Some(port))?;
        self.connection.port = Some(port.to_string());
        info!("Saved paired port to {}", path.display());
        Ok(path)
    }

    /// Forget the paired port in the local and global config files.
    ///
    /// Returns the files that were changed.
    pub fn forget_port(&mut self) -> anyhow::Result<Vec<PathBuf>> {
        let mut candidates = vec![PathBuf::from(LOCAL_CONFIG)];
        candidates.extend(Self::global_config_path());

        let mut changed = Vec::new();
        for path in candidates {
            if Self::clear_port_in(&path)? {
                info!("Removed paired port from {}", path.display());
                changed.push(path);
            }
        }
        self.connection.port = None;
        Ok(changed)
    }

    /// Drop `[connection].port` from `path`; false if it held none.
    fn clear_port_in(path: &Path) -> anyhow::Result<bool> {
        match Self::load_from_file(path) {
            Some(stored) if stored.connection.port.is_some() => {
                Self::store_port(path, None)?;
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    fn store_port(path: &Path, port: Option<&str>) -> anyhow::Result<()> {
        let mut stored = Self::load_from_file(path).unwrap_or_default();
        stored.connection.port = port.map(str::to_string);
        fs::write(path, toml::to_string_pretty(&stored)?)?;
        Ok(())
    }
}
