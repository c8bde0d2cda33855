// growerd: Error types

use thiserror::Error;

/// Control-plane result type
pub type ControlResult<T> = Result<T, ControlError>;

/// Control-plane error taxonomy
#[derive(Debug, Clone, Error)]
pub enum ControlError {
    #[error("Driver fault on GPIO{pin}: {message}")]
    DriverFault { pin: u8, message: String },

    #[error("Driver fault: {0}")]
    DriverInit(String),

    #[error("Document store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Invalid document entry: {0}")]
    ProtocolInvalid(String),

    #[error("Command timed out: {0}")]
    CommandTimeout(String),

    #[error("Fatal initialisation error: {0}")]
    FatalInit(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ControlError {
    pub fn driver_fault(pin: u8, err: impl std::fmt::Display) -> Self {
        ControlError::DriverFault {
            pin,
            message: err.to_string(),
        }
    }
}

/// Check if error is retryable (transient)
pub fn is_transient_error(err: &ControlError) -> bool {
    matches!(
        err,
        ControlError::StoreUnavailable(_) | ControlError::CommandTimeout(_)
    )
}
