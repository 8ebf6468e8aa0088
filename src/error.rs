use std::fmt;

use serde::Serialize;
use ts_rs::TS;

/// Structured error type for the engine. Compile diagnostics and script
/// faults are not errors; they are reported through the transcript. These
/// are failures of the engine itself, or of its configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, TS)]
#[serde(tag = "code", content = "detail")]
#[ts(export)]
pub enum EngineError {
    /// An earlier fatal error left the session unusable.
    SessionPoisoned { reason: String },
    /// A clean compile produced a unit whose entry routine cannot be found.
    EntryPointMissing { submission: u32 },
    /// The state store has no slot where one must exist.
    StateSlotMissing { submission: u32 },
    /// A submission tried to install a slot that was already assigned.
    StateSlotOccupied { submission: u32 },
    /// A unit was committed out of order.
    ChainOutOfOrder { expected: u32, found: u32 },
    /// The blocking pool failed or the execution panicked.
    HostFailure { message: String },
    IoError { message: String },
    SettingsError { message: String },
    SettingsSaveError { message: String },
}

impl EngineError {
    /// Errors that leave the session in an unknown state.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            EngineError::IoError { .. }
                | EngineError::SettingsError { .. }
                | EngineError::SettingsSaveError { .. }
        )
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::SessionPoisoned { reason } => {
                write!(f, "Session is no longer usable: {reason}")
            }
            EngineError::EntryPointMissing { submission } => {
                write!(f, "Entry point of Submission#{submission} not found")
            }
            EngineError::StateSlotMissing { submission } => {
                write!(f, "State slot for Submission#{submission} is missing")
            }
            EngineError::StateSlotOccupied { submission } => {
                write!(f, "State slot for Submission#{submission} is already assigned")
            }
            EngineError::ChainOutOfOrder { expected, found } => {
                write!(f, "Expected Submission#{expected} but got Submission#{found}")
            }
            EngineError::HostFailure { message } => write!(f, "Execution host failure: {message}"),
            EngineError::IoError { message } => write!(f, "I/O error: {message}"),
            EngineError::SettingsError { message } => write!(f, "Invalid settings: {message}"),
            EngineError::SettingsSaveError { message } => {
                write!(f, "Failed to save settings: {message}")
            }
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::IoError {
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::SettingsError {
            message: e.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(e: tokio::task::JoinError) -> Self {
        EngineError::HostFailure {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_code_and_detail() {
        let json = serde_json::to_value(EngineError::StateSlotMissing { submission: 4 }).unwrap();
        assert_eq!(json["code"], "StateSlotMissing");
        assert_eq!(json["detail"]["submission"], 4);
    }

    #[test]
    fn fatality() {
        assert!(EngineError::EntryPointMissing { submission: 0 }.is_fatal());
        assert!(!EngineError::IoError { message: "x".into() }.is_fatal());
    }

    #[test]
    fn io_errors_convert() {
        let err: EngineError = std::io::Error::other("disk").into();
        assert_eq!(err.to_string(), "I/O error: disk");
    }
}
