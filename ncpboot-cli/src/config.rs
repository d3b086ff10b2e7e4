//! Configuration file support for ncpboot.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (NCPBOOT_*)
//! 3. Local config file (./ncpboot.toml)
//! 4. Global config file (~/.config/ncpboot/config.toml)

use anyhow::Context;
use directories::ProjectDirs;
use log::{debug, warn};
use ncpboot::TransferProtocol;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::CliError;

/// Name of the per-directory config file.
pub(crate) const LOCAL_CONFIG_FILE: &str = "ncpboot.toml";

/// Flow control as written in config files.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub(crate) enum FlowControlSetting {
    /// No flow control.
    None,
    /// RTS/CTS.
    Hardware,
    /// XON/XOFF.
    Software,
}

impl From<FlowControlSetting> for ncpboot::FlowControl {
    fn from(setting: FlowControlSetting) -> Self {
        match setting {
            FlowControlSetting::None => Self::None,
            FlowControlSetting::Hardware => Self::Hardware,
            FlowControlSetting::Software => Self::Software,
        }
    }
}

/// Serial connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub serial: Option<String>,
    /// Baud rate.
    pub baud: Option<u32>,
    /// Flow control.
    pub flow_control: Option<FlowControlSetting>,
}

/// Bootload defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct BootloadConfig {
    /// Transfer protocol.
    pub protocol: Option<TransferProtocol>,
    /// Skip the Xmodem handshake wait.
    #[serde(default)]
    pub start_immediately: bool,
    /// Drive the standalone bootloader menu.
    #[serde(default)]
    pub menu: bool,
    /// Xmodem retransmissions per block.
    pub retries: Option<u32>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Config {
    /// Connection configuration.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Bootload configuration.
    #[serde(default)]
    pub bootload: BootloadConfig,
}

impl Config {
    /// Load configuration from the global and local files.
    ///
    /// Unreadable or malformed files are reported and skipped.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_lenient(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        let local_path = Path::new(LOCAL_CONFIG_FILE);
        if let Some(local_config) = Self::load_lenient(local_path) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    ///
    /// Unlike [`Config::load`], a missing or malformed file is an error.
    pub fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| CliError::Config(format!("Cannot read {}: {e}", path.display())))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn parse(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).map_err(|e| CliError::Config(format!("TOML error: {e}")).into())
    }

    fn load_lenient(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: TOML error: {e}", path.display());
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {e}", path.display());
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "ncpboot").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; values set in `other` win.
    fn merge(&mut self, other: Self) {
        if other.connection.serial.is_some() {
            self.connection.serial = other.connection.serial;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }
        if other.connection.flow_control.is_some() {
            self.connection.flow_control = other.connection.flow_control;
        }

        if other.bootload.protocol.is_some() {
            self.bootload.protocol = other.bootload.protocol;
        }
        if other.bootload.start_immediately {
            self.bootload.start_immediately = true;
        }
        if other.bootload.menu {
            self.bootload.menu = true;
        }
        if other.bootload.retries.is_some() {
            self.bootload.retries = other.bootload.retries;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.connection.serial.is_none());
        assert!(config.connection.baud.is_none());
        assert!(config.connection.flow_control.is_none());
        assert!(config.bootload.protocol.is_none());
        assert!(!config.bootload.start_immediately);
        assert!(!config.bootload.menu);
        assert!(config.bootload.retries.is_none());
    }

    #[test]
    fn test_config_merge_overrides_set_values() {
        let mut base = Config::default();
        base.connection.serial = Some("/dev/ttyUSB0".to_string());
        base.connection.baud = Some(57600);

        let mut other = Config::default();
        other.connection.serial = Some("/dev/ttyACM0".to_string());
        other.bootload.protocol = Some(TransferProtocol::Bgapi);
        base.merge(other);

        assert_eq!(base.connection.serial.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(base.connection.baud, Some(57600));
        assert_eq!(base.bootload.protocol, Some(TransferProtocol::Bgapi));
    }

    #[test]
    fn test_config_merge_does_not_clear_flags() {
        let mut base = Config::default();
        base.bootload.menu = true;
        base.merge(Config::default());
        assert!(base.bootload.menu);
    }

    #[test]
    fn test_config_from_toml() {
        let config = Config::parse(
            r#"
[connection]
serial = "/dev/ttyACM0"
baud = 230400
flow_control = "hardware"

[bootload]
protocol = "bgapi"
menu = true
retries = 3
"#,
        )
        .unwrap();
        assert_eq!(config.connection.serial.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.connection.baud, Some(230400));
        assert_eq!(
            config.connection.flow_control,
            Some(FlowControlSetting::Hardware)
        );
        assert_eq!(config.bootload.protocol, Some(TransferProtocol::Bgapi));
        assert!(config.bootload.menu);
        assert!(!config.bootload.start_immediately);
        assert_eq!(config.bootload.retries, Some(3));
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config = Config::parse("").unwrap();
        assert!(config.connection.serial.is_none());
        assert!(config.bootload.protocol.is_none());
    }

    #[test]
    fn test_config_invalid_toml_is_config_error() {
        let err = Config::parse("invalid toml [[[").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Config(_))
        ));
    }

    #[test]
    fn test_load_from_path_valid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[connection]\nbaud = 921600").unwrap();
        let config = Config::load_from_path(file.path()).unwrap();
        assert_eq!(config.connection.baud, Some(921600));
    }

    #[test]
    fn test_load_from_path_nonexistent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load_from_path(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_load_lenient_skips_bad_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "baud = ").unwrap();
        assert!(Config::load_lenient(file.path()).is_none());
    }

    #[test]
    fn test_global_config_path_file_name() {
        if let Some(path) = Config::global_config_path() {
            assert!(path.ends_with("config.toml"));
        }
    }
}
