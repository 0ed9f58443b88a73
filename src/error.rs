use thiserror::Error;

/// Errors that can occur when working with a cable trainer
#[derive(Error, Debug)]
pub enum TrainerError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Trainer not found during scanning
    #[error("cable trainer not found")]
    DeviceNotFound,

    /// Device connection failed
    #[error("failed to connect to trainer: {0}")]
    ConnectionFailed(String),

    /// Device disconnected unexpectedly
    #[error("trainer disconnected")]
    Disconnected,

    /// A device link write failed
    ///
    /// Surfaced by the session as a transition to `Idle` with the error flag
    /// set; the write itself is never retried by the core.
    #[error("device link write failed: {0}")]
    Link(String),

    /// An operation was called from a workout state that does not permit it
    #[error("invalid transition: {operation} not allowed in state {state}")]
    InvalidTransition {
        /// The rejected operation
        operation: &'static str,
        /// Description of the state the session was in
        state: String,
    },

    /// A set or exercise index fell outside the loaded routine
    #[error("invalid index: exercise {exercise_index}, set {set_index}")]
    InvalidIndex {
        /// Exercise index that was requested
        exercise_index: usize,
        /// Set index that was requested
        set_index: usize,
    },

    /// A field value violates its documented protocol range
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Inbound bytes could not be parsed
    ///
    /// Decode failures are logged and dropped by the telemetry pipeline,
    /// never propagated as fatal.
    #[error("decoding error: {0}")]
    Decode(String),

    /// An inbound frame carried an opcode this library does not recognize
    #[error("unknown opcode: {opcode:02X}")]
    UnknownOpcode {
        /// First payload byte of the offending frame
        opcode: u8,
    },

    /// Command timeout
    #[error("command timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// The session event queue has shut down
    #[error("session closed")]
    SessionClosed,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("other error: {0}")]
    Other(String),
}

/// Result type for trainer operations
pub type Result<T> = std::result::Result<T, TrainerError>;

impl TrainerError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectionFailed(_)
                | Self::Disconnected
                | Self::DeviceNotFound
                | Self::Link(_)
        )
    }

    /// Check if this error was a synchronous validation rejection
    ///
    /// Validation rejections leave the session state untouched and are safe
    /// to retry from a corrected caller.
    #[must_use]
    pub const fn is_validation_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidTransition { .. } | Self::InvalidIndex { .. } | Self::Encoding(_)
        )
    }

    /// Check if this error is recoverable in place
    ///
    /// Recoverable errors are logged and swallowed by the telemetry pipeline
    /// rather than tearing the session down.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Decode(_) | Self::UnknownOpcode { .. } | Self::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let link_error = TrainerError::Link("write failed".to_string());
        assert!(link_error.is_connection_error());
        assert!(!link_error.is_validation_error());
        assert!(!link_error.is_recoverable());

        let transition_error = TrainerError::InvalidTransition {
            operation: "start_workout",
            state: "Active".to_string(),
        };
        assert!(transition_error.is_validation_error());
        assert!(!transition_error.is_connection_error());

        let decode_error = TrainerError::UnknownOpcode { opcode: 0x7F };
        assert!(decode_error.is_recoverable());
        assert!(!decode_error.is_connection_error());
    }

    #[test]
    fn test_error_display() {
        let error = TrainerError::InvalidIndex {
            exercise_index: 4,
            set_index: 0,
        };
        let error_string = format!("{error}");
        assert!(error_string.contains("invalid index"));
        assert!(error_string.contains("exercise 4"));

        let error = TrainerError::UnknownOpcode { opcode: 0xAB };
        assert!(format!("{error}").contains("AB"));
    }
}
