use thiserror::Error;

pub type Result<T> = std::result::Result<T, UndervoltError>;

// The main error type shared by the hardware port and the daemon
#[derive(Debug, Error)]
pub enum UndervoltError {
    // A read from the GPU failed, the tick carries no data
    #[error("GPU hardware unavailable: {reason}")]
    HardwareUnavailable { reason: String },
    // A write to the GPU was rejected
    #[error("GPU rejected setting: {reason}")]
    ApplyFailed { reason: String },
    // Clock offsets can't be applied in this environment
    #[error("GPU clock offsets unavailable: {reason}")]
    OffsetUnavailable { reason: String },
    // The policy violates its invariants, only raised at startup
    #[error("Invalid configuration: {reason}")]
    ConfigInvalid { reason: String },
}

impl UndervoltError {
    pub fn hardware(reason: impl Into<String>) -> Self {
        Self::HardwareUnavailable {
            reason: reason.into(),
        }
    }

    pub fn apply(reason: impl Into<String>) -> Self {
        Self::ApplyFailed {
            reason: reason.into(),
        }
    }

    pub fn offset(reason: impl Into<String>) -> Self {
        Self::OffsetUnavailable {
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            reason: reason.into(),
        }
    }
}
