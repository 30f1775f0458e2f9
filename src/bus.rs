//! GPIB bus domain types
//!
//! Addresses, per-instrument termination settings and a decoded view of the
//! controller chip's status registers.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GpibError, GpibResult};

/// Highest primary address a device may use (31 is reserved as "untalk"/"unlisten").
pub const MAX_PRIMARY_ADDRESS: u8 = 30;

/// A GPIB primary address in the range 0-30.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct PrimaryAddress(u8);

impl PrimaryAddress {
    /// Validate and wrap a raw address.
    pub fn new(address: u8) -> GpibResult<Self> {
        if address > MAX_PRIMARY_ADDRESS {
            return Err(GpibError::InvalidAddress(address));
        }
        Ok(Self(address))
    }

    /// Raw address value.
    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for PrimaryAddress {
    type Error = GpibError;

    fn try_from(address: u8) -> GpibResult<Self> {
        Self::new(address)
    }
}

impl From<PrimaryAddress> for u8 {
    fn from(address: PrimaryAddress) -> u8 {
        address.0
    }
}

impl fmt::Display for PrimaryAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message termination settings for one instrument.
///
/// Controls how writes are terminated (EOI asserted on the last byte) and
/// what ends a read (EOI, the EOS character, or both).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusConfig {
    /// Assert EOI with the last byte of every write.
    pub send_eoi: bool,
    /// Stop reading when the talker asserts EOI.
    pub end_read_on_eoi: bool,
    /// Stop reading when `eos_char` is received.
    pub end_read_on_eos: bool,
    /// End-of-string character.
    pub eos_char: u8,
    /// How long to wait for the instrument to answer.
    pub read_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            send_eoi: true,
            end_read_on_eoi: true,
            end_read_on_eos: false,
            eos_char: b'\n',
            read_timeout: Duration::from_millis(500),
        }
    }
}

impl BusConfig {
    /// Toggle EOI on writes.
    pub fn with_send_eoi(mut self, send_eoi: bool) -> Self {
        self.send_eoi = send_eoi;
        self
    }

    /// Toggle ending reads on EOI.
    pub fn with_end_read_on_eoi(mut self, end_read_on_eoi: bool) -> Self {
        self.end_read_on_eoi = end_read_on_eoi;
        self
    }

    /// End reads on the given EOS character.
    pub fn with_eos(mut self, eos_char: u8) -> Self {
        self.end_read_on_eos = true;
        self.eos_char = eos_char;
        self
    }

    /// Toggle ending reads on the EOS character without changing it.
    pub fn with_end_read_on_eos(mut self, end_read_on_eos: bool) -> Self {
        self.end_read_on_eos = end_read_on_eos;
        self
    }

    /// Set the read timeout.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Check invariants that the adapter relies on.
    pub fn validate(&self) -> GpibResult<()> {
        if self.read_timeout.is_zero() {
            return Err(GpibError::InvalidConfig(
                "read_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse an EOS character given as text.
///
/// Accepts exactly one ASCII character, or one of the escapes `\n`, `\r`, `\0`.
pub fn parse_eos_char(text: &str) -> GpibResult<u8> {
    match text {
        "\\n" => return Ok(b'\n'),
        "\\r" => return Ok(b'\r'),
        "\\0" => return Ok(0),
        _ => {}
    }
    let bytes = text.as_bytes();
    if bytes.len() != 1 || !bytes[0].is_ascii() {
        return Err(GpibError::InvalidConfig(format!(
            "EOS must be a single ASCII character, got {:?}",
            text
        )));
    }
    Ok(bytes[0])
}

/// Render an EOS byte in the form accepted by [`parse_eos_char`].
pub fn format_eos_char(eos: u8) -> String {
    match eos {
        b'\n' => "\\n".to_string(),
        b'\r' => "\\r".to_string(),
        0 => "\\0".to_string(),
        other => (other as char).to_string(),
    }
}

const BUS_LINES: [(u8, &str); 8] = [
    (0x80, "ATN"),
    (0x40, "DAV"),
    (0x20, "NDAC"),
    (0x10, "NRFD"),
    (0x08, "EOI"),
    (0x04, "SRQ"),
    (0x02, "IFC"),
    (0x01, "REN"),
];

const ADDRESS_STATES: [(u8, &str); 8] = [
    (0x80, "REM"),
    (0x40, "LLO"),
    (0x20, "ATN"),
    (0x10, "LPAS"),
    (0x08, "TPAS"),
    (0x04, "LADS"),
    (0x02, "TADS"),
    (0x01, "ULPA"),
];

/// Snapshot of the controller chip's address and bus status registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LineStatus {
    /// Raw address status register.
    pub address_status: u8,
    /// Raw bus status register (one bit per bus management/handshake line).
    pub bus_status: u8,
}

impl LineStatus {
    /// Names of the bus lines currently asserted.
    pub fn asserted_lines(&self) -> Vec<&'static str> {
        BUS_LINES
            .iter()
            .filter(|(mask, _)| self.bus_status & mask != 0)
            .map(|(_, name)| *name)
            .collect()
    }

    /// Names of the address state flags currently set.
    pub fn address_flags(&self) -> Vec<&'static str> {
        ADDRESS_STATES
            .iter()
            .filter(|(mask, _)| self.address_status & mask != 0)
            .map(|(_, name)| *name)
            .collect()
    }

    /// True while a device is requesting service.
    pub fn srq(&self) -> bool {
        self.bus_status & 0x04 != 0
    }
}

impl fmt::Display for LineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "addr={:02x} [{}] bus={:02x} [{}]",
            self.address_status,
            self.address_flags().join(" "),
            self.bus_status,
            self.asserted_lines().join(" ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_address_range() {
        assert_eq!(PrimaryAddress::new(0).unwrap().value(), 0);
        assert_eq!(PrimaryAddress::new(30).unwrap().value(), 30);
        assert!(matches!(
            PrimaryAddress::new(31),
            Err(GpibError::InvalidAddress(31))
        ));
        assert!(PrimaryAddress::try_from(200u8).is_err());
    }

    #[test]
    fn test_bus_config_defaults() {
        let config = BusConfig::default();
        assert!(config.send_eoi);
        assert!(config.end_read_on_eoi);
        assert!(!config.end_read_on_eos);
        assert_eq!(config.eos_char, b'\n');
        assert_eq!(config.read_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_bus_config_builder() {
        let config = BusConfig::default()
            .with_eos(b'\r')
            .with_send_eoi(false)
            .with_read_timeout(Duration::from_secs(2));
        assert!(config.end_read_on_eos);
        assert_eq!(config.eos_char, b'\r');
        assert!(!config.send_eoi);
        assert_eq!(config.read_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = BusConfig::default().with_read_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_eos_char() {
        assert_eq!(parse_eos_char("\n").unwrap(), b'\n');
        assert_eq!(parse_eos_char("\\n").unwrap(), b'\n');
        assert_eq!(parse_eos_char("\\r").unwrap(), b'\r');
        assert_eq!(parse_eos_char(";").unwrap(), b';');
        assert!(parse_eos_char("").is_err());
        assert!(parse_eos_char("ab").is_err());
        assert!(parse_eos_char("é").is_err());
        assert_eq!(parse_eos_char(&format_eos_char(b'\r')).unwrap(), b'\r');
    }

    #[test]
    fn test_line_status_decoding() {
        let status = LineStatus {
            address_status: 0x02,
            bus_status: 0x84,
        };
        assert_eq!(status.asserted_lines(), vec!["ATN", "SRQ"]);
        assert_eq!(status.address_flags(), vec!["TADS"]);
        assert!(status.srq());
        assert_eq!(status.to_string(), "addr=02 [TADS] bus=84 [ATN SRQ]");
    }
}
