//! Error taxonomy
//!
//! Each layer has its own error enum; every error maps to exactly one
//! [`ErrorKind`], which is what recovery boundaries match on.

use thiserror::Error;

use crate::config::ConfigError;
use crate::firmware::FirmwareError;
use crate::hal::HalError;
use crate::ocpp::OcppError;

/// Failure class, decides how a recovery boundary reacts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Handshake, read or write failure; the connection is retried
    ConnectionFailure,
    /// A request exceeded its time budget
    ProtocolTimeout,
    /// Malformed message, rejected boot or an error reply
    ProtocolViolation,
    /// A hardware driver or other collaborator failed
    CollaboratorFault,
    /// Startup configuration could not be used
    Configuration,
}

/// Error of a charging session iteration or of the station as a whole
#[derive(Debug, Error)]
pub enum ChargerError {
    #[error(transparent)]
    Ocpp(#[from] OcppError),

    #[error(transparent)]
    Hal(#[from] HalError),

    #[error(transparent)]
    Firmware(#[from] FirmwareError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ChargerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChargerError::Ocpp(e) => e.kind(),
            ChargerError::Hal(e) => e.kind(),
            ChargerError::Firmware(e) => e.kind(),
            ChargerError::Config(_) => ErrorKind::Configuration,
        }
    }
}
