//! Configuration using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults
//! 2. A TOML file (`gpib.toml` by default)
//! 3. Environment variables prefixed with `GPIB_`
//!
//! Nested keys in environment variables are separated by a double underscore:
//!
//! ```text
//! GPIB_APPLICATION__LOG_LEVEL=debug
//! GPIB_CONTROLLER__PRIMARY_ADDRESS=10
//! GPIB_DEFAULTS__READ_TIMEOUT=2s
//! ```
//!
//! # Example file
//!
//! ```toml
//! [controller]
//! primary_address = 0
//! reply_timeout = "100ms"
//!
//! [defaults]
//! eos_char = "\\n"
//! read_timeout = "500ms"
//!
//! [[instruments]]
//! name = "dmm"
//! primary_address = 22
//! end_read_on_eos = true
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::adapters::Agilent82357AOptions;
use crate::bus::{format_eos_char, parse_eos_char, BusConfig, PrimaryAddress, MAX_PRIMARY_ADDRESS};
use crate::error::{GpibError, GpibResult};

/// File looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "gpib.toml";

/// Prefix of environment variable overrides.
pub const ENV_PREFIX: &str = "GPIB_";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpibConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Controller and adapter settings
    #[serde(default)]
    pub controller: ControllerConfig,
    /// Bus settings for instruments without their own
    #[serde(default)]
    pub defaults: BusSettings,
    /// Named instruments
    #[serde(default)]
    pub instruments: Vec<InstrumentConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

/// Controller-in-charge configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Primary address the adapter takes on the bus
    pub primary_address: u8,
    /// Which adapter to use when several are attached
    pub adapter_index: usize,
    /// Largest message requested in one read
    pub read_chunk_len: u32,
    /// How long a write waits for the adapter's completion interrupt
    #[serde(with = "humantime_serde")]
    pub write_complete_timeout: Duration,
    /// Timeout for adapter command replies
    #[serde(with = "humantime_serde")]
    pub reply_timeout: Duration,
}

/// Message termination settings as written in the configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusSettings {
    /// Assert EOI with the last byte of every write
    pub send_eoi: bool,
    /// Stop reading on EOI
    pub end_read_on_eoi: bool,
    /// Stop reading on the EOS character
    pub end_read_on_eos: bool,
    /// End-of-string character: one character or `\n`, `\r`, `\0`
    pub eos_char: String,
    /// Read timeout (e.g. "500ms", "2s")
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
}

/// A named instrument with optional overrides of [`BusSettings`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Unique name, used by `gpib-ctl --instrument`
    pub name: String,
    /// Primary address of the instrument
    pub primary_address: u8,
    /// Override for [`BusSettings::send_eoi`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_eoi: Option<bool>,
    /// Override for [`BusSettings::end_read_on_eoi`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_read_on_eoi: Option<bool>,
    /// Override for [`BusSettings::end_read_on_eos`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_read_on_eos: Option<bool>,
    /// Override for [`BusSettings::eos_char`]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eos_char: Option<String>,
    /// Override for [`BusSettings::read_timeout`]
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub read_timeout: Option<Duration>,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        let options = Agilent82357AOptions::default();
        Self {
            primary_address: 0,
            adapter_index: 0,
            read_chunk_len: options.read_chunk_len,
            write_complete_timeout: options.write_complete_timeout,
            reply_timeout: options.reply_timeout,
        }
    }
}

impl Default for BusSettings {
    fn default() -> Self {
        BusConfig::default().into()
    }
}

impl From<BusConfig> for BusSettings {
    fn from(config: BusConfig) -> Self {
        Self {
            send_eoi: config.send_eoi,
            end_read_on_eoi: config.end_read_on_eoi,
            end_read_on_eos: config.end_read_on_eos,
            eos_char: format_eos_char(config.eos_char),
            read_timeout: config.read_timeout,
        }
    }
}

impl BusSettings {
    /// Convert to the runtime representation, validating the EOS character.
    pub fn to_bus_config(&self) -> GpibResult<BusConfig> {
        let config = BusConfig {
            send_eoi: self.send_eoi,
            end_read_on_eoi: self.end_read_on_eoi,
            end_read_on_eos: self.end_read_on_eos,
            eos_char: parse_eos_char(&self.eos_char)?,
            read_timeout: self.read_timeout,
        };
        config.validate()?;
        Ok(config)
    }
}

impl InstrumentConfig {
    /// Settings for this instrument: `defaults` with the overrides applied.
    pub fn bus_config(&self, defaults: &BusSettings) -> GpibResult<BusConfig> {
        let mut settings = defaults.clone();
        if let Some(send_eoi) = self.send_eoi {
            settings.send_eoi = send_eoi;
        }
        if let Some(end_read_on_eoi) = self.end_read_on_eoi {
            settings.end_read_on_eoi = end_read_on_eoi;
        }
        if let Some(end_read_on_eos) = self.end_read_on_eos {
            settings.end_read_on_eos = end_read_on_eos;
        }
        if let Some(eos_char) = &self.eos_char {
            settings.eos_char = eos_char.clone();
        }
        if let Some(read_timeout) = self.read_timeout {
            settings.read_timeout = read_timeout;
        }
        settings.to_bus_config()
    }
}

impl Default for GpibConfig {
    fn default() -> Self {
        Self {
            application: ApplicationConfig::default(),
            controller: ControllerConfig::default(),
            defaults: BusSettings::default(),
            instruments: Vec::new(),
        }
    }
}

impl GpibConfig {
    fn base() -> Figment {
        Figment::from(Serialized::defaults(GpibConfig::default()))
    }

    fn finish(figment: Figment) -> GpibResult<Self> {
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load defaults, then `gpib.toml` if it exists in the working directory,
    /// then the environment.
    pub fn load() -> GpibResult<Self> {
        let mut figment = Self::base();
        if Path::new(DEFAULT_CONFIG_FILE).exists() {
            figment = figment.merge(Toml::file(DEFAULT_CONFIG_FILE));
        }
        Self::finish(figment)
    }

    /// Load defaults, then the TOML file at `path`, then the environment.
    ///
    /// # Errors
    ///
    /// Fails if the file does not exist, does not parse, or the result does
    /// not pass [`validate`](Self::validate).
    pub fn load_from<P: AsRef<Path>>(path: P) -> GpibResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(GpibError::Configuration(format!(
                "Configuration file '{}' not found",
                path.display()
            )));
        }
        Self::finish(Self::base().merge(Toml::file(path)))
    }

    /// Check the loaded configuration.
    ///
    /// Checks:
    /// - Log level is valid
    /// - Addresses are in range 0-30
    /// - Instrument names are unique and non-empty
    /// - EOS characters are single characters
    /// - Timeouts and the read chunk length are non-zero
    pub fn validate(&self) -> GpibResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(GpibError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let controller = &self.controller;
        if controller.primary_address > MAX_PRIMARY_ADDRESS {
            return Err(GpibError::Configuration(format!(
                "controller.primary_address {} is out of range 0-{}",
                controller.primary_address, MAX_PRIMARY_ADDRESS
            )));
        }
        if controller.read_chunk_len == 0 {
            return Err(GpibError::Configuration(
                "controller.read_chunk_len must be greater than zero".to_string(),
            ));
        }
        if controller.write_complete_timeout.is_zero() || controller.reply_timeout.is_zero() {
            return Err(GpibError::Configuration(
                "controller timeouts must be greater than zero".to_string(),
            ));
        }

        self.defaults
            .to_bus_config()
            .map_err(|e| GpibError::Configuration(format!("defaults: {}", e)))?;

        let mut names = HashSet::new();
        for instrument in &self.instruments {
            if instrument.name.is_empty() {
                return Err(GpibError::Configuration(
                    "Instrument name cannot be empty".to_string(),
                ));
            }
            if !names.insert(instrument.name.as_str()) {
                return Err(GpibError::Configuration(format!(
                    "Duplicate instrument name: '{}'",
                    instrument.name
                )));
            }
            if instrument.primary_address > MAX_PRIMARY_ADDRESS {
                return Err(GpibError::Configuration(format!(
                    "Instrument '{}': primary_address {} is out of range 0-{}",
                    instrument.name, instrument.primary_address, MAX_PRIMARY_ADDRESS
                )));
            }
            instrument
                .bus_config(&self.defaults)
                .map_err(|e| GpibError::Configuration(format!("Instrument '{}': {}", instrument.name, e)))?;
        }

        Ok(())
    }

    /// Look up a named instrument.
    pub fn instrument(&self, name: &str) -> Option<&InstrumentConfig> {
        self.instruments.iter().find(|i| i.name == name)
    }

    /// The configured controller address.
    pub fn controller_address(&self) -> GpibResult<PrimaryAddress> {
        PrimaryAddress::new(self.controller.primary_address)
    }

    /// Bus settings for instruments not listed in `[[instruments]]`.
    pub fn default_bus_config(&self) -> GpibResult<BusConfig> {
        self.defaults.to_bus_config()
    }

    /// Driver options derived from the `[controller]` section.
    pub fn adapter_options(&self) -> Agilent82357AOptions {
        Agilent82357AOptions {
            read_chunk_len: self.controller.read_chunk_len,
            reply_timeout: self.controller.reply_timeout,
            write_complete_timeout: self.controller.write_complete_timeout,
            ..Agilent82357AOptions::default()
        }
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> GpibResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| GpibError::Configuration(format!("Cannot serialize configuration: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn instrument(name: &str, primary_address: u8) -> InstrumentConfig {
        InstrumentConfig {
            name: name.to_string(),
            primary_address,
            send_eoi: None,
            end_read_on_eoi: None,
            end_read_on_eos: None,
            eos_char: None,
            read_timeout: None,
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = GpibConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_bus_config().unwrap(), BusConfig::default());
        assert_eq!(config.adapter_options(), Agilent82357AOptions::default());
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let file = write_config(
            r#"
[controller]
primary_address = 10
reply_timeout = "250ms"

[defaults]
eos_char = "\\r"
read_timeout = "2s"

[[instruments]]
name = "dmm"
primary_address = 22
end_read_on_eos = true
"#,
        );

        let config = GpibConfig::load_from(file.path()).unwrap();
        assert_eq!(config.controller.primary_address, 10);
        assert_eq!(config.controller.reply_timeout, Duration::from_millis(250));
        assert_eq!(config.controller.read_chunk_len, 1024);

        let dmm = config.instrument("dmm").unwrap();
        let bus = dmm.bus_config(&config.defaults).unwrap();
        assert_eq!(bus.eos_char, b'\r');
        assert!(bus.end_read_on_eos);
        assert_eq!(bus.read_timeout, Duration::from_secs(2));
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = write_config("[controller]\nprimary_address = 10\n");
        std::env::set_var("GPIB_CONTROLLER__PRIMARY_ADDRESS", "12");
        std::env::set_var("GPIB_DEFAULTS__READ_TIMEOUT", "750ms");

        let result = GpibConfig::load_from(file.path());
        std::env::remove_var("GPIB_CONTROLLER__PRIMARY_ADDRESS");
        std::env::remove_var("GPIB_DEFAULTS__READ_TIMEOUT");

        let config = result.unwrap();
        assert_eq!(config.controller.primary_address, 12);
        assert_eq!(config.defaults.read_timeout, Duration::from_millis(750));
    }

    #[test]
    #[serial]
    fn test_missing_file_is_an_error() {
        let result = GpibConfig::load_from("/nonexistent/gpib.toml");
        assert!(matches!(result, Err(GpibError::Configuration(_))));
    }

    #[test]
    #[serial]
    fn test_malformed_duration_is_a_load_error() {
        let file = write_config("[defaults]\nread_timeout = \"soon\"\n");
        assert!(matches!(
            GpibConfig::load_from(file.path()),
            Err(GpibError::Config(_))
        ));
    }

    #[test]
    fn test_duplicate_instrument_names() {
        let mut config = GpibConfig::default();
        config.instruments = vec![instrument("dmm", 22), instrument("dmm", 23)];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate instrument name"));
    }

    #[test]
    fn test_out_of_range_addresses() {
        let mut config = GpibConfig::default();
        config.controller.primary_address = 31;
        assert!(config.validate().is_err());

        let mut config = GpibConfig::default();
        config.instruments = vec![instrument("scope", 40)];
        assert!(config.validate().unwrap_err().to_string().contains("scope"));
    }

    #[test]
    fn test_invalid_eos_and_zero_values() {
        let mut config = GpibConfig::default();
        config.defaults.eos_char = "CRLF".to_string();
        assert!(config.validate().is_err());

        let mut config = GpibConfig::default();
        config.controller.read_chunk_len = 0;
        assert!(config.validate().is_err());

        let mut config = GpibConfig::default();
        config.defaults.read_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = GpibConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(config.validate().unwrap_err().to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_toml_dump_loads_back() {
        let mut config = GpibConfig::default();
        let mut dmm = instrument("dmm", 22);
        dmm.read_timeout = Some(Duration::from_secs(1));
        config.instruments.push(dmm);

        let text = config.to_toml().unwrap();
        assert!(text.contains("read_timeout = \"1s\""));

        let parsed: GpibConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
