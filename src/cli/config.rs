//! Command-line interface configuration
//!
//! Settings are read from `esploader.toml` in the working directory, falling
//! back to the same file in the platform configuration directory.

use std::{
    fs::read_to_string,
    io,
    path::{Path, PathBuf},
};

use directories::ProjectDirs;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::Error;

const CONFIG_FILE_NAME: &str = "esploader.toml";

/// Tool configuration, every field optional
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Name of the serial port used for communication
    pub serial: Option<String>,
    /// Baud rate to switch to once connected
    pub baudrate: Option<u32>,
    /// Directory holding the flasher stub images
    pub stub_dir: Option<PathBuf>,
    /// Stay with the ROM loader
    pub no_stub: bool,
}

impl Config {
    /// Load the first configuration file found, or the defaults if there is
    /// none
    pub fn load() -> Result<Self, Error> {
        let candidates = [Some(PathBuf::from(CONFIG_FILE_NAME)), Self::user_config_path()];

        for path in candidates.into_iter().flatten() {
            if let Some(config) = Self::load_from(&path)? {
                debug!("Config: {:#?}", &config);
                return Ok(config);
            }
        }

        Ok(Config::default())
    }

    /// Parse the configuration at `path`, `None` if it does not exist
    pub fn load_from(path: &Path) -> Result<Option<Self>, Error> {
        let raw = match read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Error::FileOpenError(path.display().to_string(), err)),
        };

        toml::from_str(&raw)
            .map(Some)
            .map_err(|err| Error::InvalidConfig(path.display().to_string(), err))
    }

    fn user_config_path() -> Option<PathBuf> {
        ProjectDirs::from("rs", "esp", "esploader")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn write_config(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("esploader-{}-{name}.toml", std::process::id()));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let path = Path::new("/nonexistent/esploader.toml");
        assert_eq!(Config::load_from(path).unwrap(), None);
    }

    #[test]
    fn partial_config() {
        let path = write_config("partial", "serial = \"/dev/ttyUSB0\"\nbaudrate = 921600\n");
        let config = Config::load_from(&path).unwrap().unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(config.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.baudrate, Some(921_600));
        assert_eq!(config.stub_dir, None);
        assert!(!config.no_stub);
    }

    #[test]
    fn malformed_config() {
        let path = write_config("malformed", "baudrate = \"fast\"\n");
        let result = Config::load_from(&path);
        fs::remove_file(&path).unwrap();

        assert!(matches!(result, Err(Error::InvalidConfig(..))));
    }
}
