//! Error types for VME bus operations.
//!
//! Errors fall into three categories:
//!
//! 1. **Configuration errors** ([`ConfigError`]) - raised while resolving
//!    settings; always carry the offending key and both searched paths.
//! 2. **Bus errors** ([`BusError`]) - raised at the backend boundary and
//!    carry the controller name, link index and board index.
//! 3. **Protocol errors** - invariant violations such as decoding a digitizer
//!    buffer before it was calibrated.
//!
//! Every error exposes a stable tag through [`VmeError::kind`] for
//! programmatic handling next to its human readable message.

use std::fmt;

use thiserror::Error;

use crate::spec::{AddressingMode, TransferMode};

/// Result type alias for VME operations.
pub type Result<T> = std::result::Result<T, VmeError>;

/// Errors raised while resolving configuration settings.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// The requested settings subtree does not exist.
    #[error("Invalid configuration path {path}")]
    Path { path: String },

    /// The settings subtree has no `model` key.
    #[error("key 'model' has to be set in {path}")]
    MissingModel { path: String },

    /// A required key is absent from settings and defaults.
    #[error("Cannot find {key} (in {settings_path} or {defaults_path})")]
    KeyNotFound {
        key: String,
        settings_path: String,
        defaults_path: String,
    },

    /// A value was found but is out of range or of the wrong type.
    #[error("Invalid value {value} for key {key} (in {settings_path} or {defaults_path})")]
    Value {
        key: String,
        value: String,
        settings_path: String,
        defaults_path: String,
    },

    /// A value is not one of the entries of a translation table.
    #[error(
        "Unable to translate value {value} for key {key} (in {settings_path} or {defaults_path}); allowed values: {allowed}"
    )]
    Translation {
        key: String,
        value: String,
        allowed: String,
        settings_path: String,
        defaults_path: String,
    },

    /// The configuration source could not be read or parsed.
    #[error("Unable to load configuration from {source_name}: {message}")]
    Load { source_name: String, message: String },
}

impl ConfigError {
    /// Stable tag for programmatic handling.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Path { .. } => "configuration_path_error",
            Self::MissingModel { .. } | Self::KeyNotFound { .. } => "configuration_key_error",
            Self::Value { .. } => "configuration_value_error",
            Self::Translation { .. } => "configuration_translation_error",
            Self::Load { .. } => "configuration_load_error",
        }
    }

    /// Key the error refers to, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::KeyNotFound { key, .. } | Self::Value { key, .. } | Self::Translation { key, .. } => {
                Some(key)
            }
            _ => None,
        }
    }
}

/// Fault classes reported by a bus controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusErrorKind {
    /// VME bus error (BERR).
    Bus,
    /// Link between host and controller failed.
    Communication,
    /// The controller rejected a parameter.
    InvalidParameter,
    /// Operation timed out.
    Timeout,
    /// Unclassified controller error.
    Generic,
}

impl BusErrorKind {
    /// Stable tag of this fault class.
    pub const fn label(self) -> &'static str {
        match self {
            BusErrorKind::Bus => "controller_bus_error",
            BusErrorKind::Communication => "controller_comm_error",
            BusErrorKind::InvalidParameter => "controller_invalid_parameter",
            BusErrorKind::Timeout => "controller_timeout_error",
            BusErrorKind::Generic => "controller_error",
        }
    }
}

impl fmt::Display for BusErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Error raised by a bus controller, tagged with its identity.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (for {device}, link: {link_index}, board: {board_index})")]
pub struct BusError {
    /// Fault class.
    pub kind: BusErrorKind,
    /// Controller name.
    pub device: String,
    /// Link index of the controller session.
    pub link_index: u16,
    /// Board index of the controller session.
    pub board_index: u16,
    /// Description of the failed operation.
    pub message: String,
}

impl BusError {
    /// Create a new bus error.
    pub fn new(
        kind: BusErrorKind,
        device: impl Into<String>,
        link_index: u16,
        board_index: u16,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            device: device.into(),
            link_index,
            board_index,
            message: message.into(),
        }
    }
}

/// Primary error type of the VME layer.
#[derive(Error, Debug)]
pub enum VmeError {
    /// Settings could not be resolved.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The bus controller reported a fault.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Addressing/transfer mode combination is not defined by VME64.
    #[error("Transfer mode {mode} is not supported in {addressing}: {reason}")]
    UnsupportedMode {
        addressing: AddressingMode,
        mode: TransferMode,
        reason: &'static str,
    },

    /// Address does not fit the addressing mode or overflowed.
    #[error("Address 0x{address:X} is out of range for {addressing} (device {device})")]
    AddressOutOfRange {
        device: String,
        addressing: AddressingMode,
        address: u64,
    },

    /// A digitizer buffer was accessed before it was decoded.
    #[error("Buffer has not been calibrated; call calibrate() before reading samples")]
    NotCalibrated,

    /// Calibration data is inconsistent with the board geometry.
    #[error("Invalid calibration: {message}")]
    InvalidCalibration { message: String },

    /// Channel index beyond the number of board channels.
    #[error("Invalid channel {channel}: board has {max} channels")]
    ChannelOutOfRange { channel: usize, max: usize },

    /// Sample index beyond the channel length.
    #[error("Invalid sample index {index}: channel has {len} samples")]
    IndexOutOfRange { index: usize, len: usize },

    /// Device protocol invariant was violated.
    #[error("{message} (for {device})")]
    Protocol { device: String, message: String },

    /// I/O error from the operating system
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VmeError {
    /// Protocol error for `device`.
    pub fn protocol(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Stable tag for programmatic handling.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(err) => err.kind(),
            Self::Bus(err) => err.kind.label(),
            Self::UnsupportedMode { .. } => "unsupported_mode",
            Self::AddressOutOfRange { .. } => "address_out_of_range",
            Self::NotCalibrated => "not_calibrated",
            Self::InvalidCalibration { .. } => "invalid_calibration",
            Self::ChannelOutOfRange { .. } => "channel_out_of_range",
            Self::IndexOutOfRange { .. } => "index_out_of_range",
            Self::Protocol { .. } => "protocol_error",
            Self::Io(_) => "io_error",
        }
    }

    /// Check if this is a controller timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Bus(BusError { kind: BusErrorKind::Timeout, .. }))
    }

    /// Check if this is a controller fault of any kind.
    pub fn is_bus_fault(&self) -> bool {
        matches!(self, Self::Bus(_))
    }

    /// Check if this came from settings resolution.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_error_display() {
        let err = BusError::new(BusErrorKind::Timeout, "bridge", 0, 1, "IRQ wait timed out");
        assert_eq!(
            err.to_string(),
            "IRQ wait timed out (for bridge, link: 0, board: 1)"
        );
        let err = VmeError::from(err);
        assert!(err.is_timeout());
        assert_eq!(err.kind(), "controller_timeout_error");
    }

    #[test]
    fn test_key_not_found_display() {
        let err = ConfigError::KeyNotFound {
            key: "threshold.CH03".into(),
            settings_path: "discriminator".into(),
            defaults_path: "defaults.V895".into(),
        };
        assert_eq!(
            err.to_string(),
            "Cannot find threshold.CH03 (in discriminator or defaults.V895)"
        );
        assert_eq!(err.key(), Some("threshold.CH03"));
        assert_eq!(VmeError::from(err).kind(), "configuration_key_error");
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(BusErrorKind::Communication.to_string(), "controller_comm_error");
        assert_eq!(VmeError::NotCalibrated.kind(), "not_calibrated");
    }
}
