//! Status codes and the shared error type.
//!
//! The wire carries errno-style codes: 0 for success, a negated errno
//! otherwise. The numeric values follow the Linux errno table so a C peer
//! would agree on them.

/// Wire status codes.
pub mod code {
    pub const OK: i32 = 0;
    /// Refused by a validator.
    pub const EPERM: i32 = -1;
    /// Compare-and-swap mismatch.
    pub const EBUSY: i32 = -16;
    /// Malformed path or argument.
    pub const EINVAL: i32 = -22;
    /// Typed getter failed to parse the stored value.
    pub const ERANGE: i32 = -34;
    /// A callback (or its transport) did not answer in time.
    pub const ETIMEDOUT: i32 = -110;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AptError {
    #[error("refused by validator")]
    Refused,
    #[error("timestamp mismatch")]
    Busy,
    #[error("invalid path or argument")]
    Invalid,
    #[error("value out of range")]
    Range,
    #[error("callback timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl AptError {
    /// The status code this error travels as.
    ///
    /// Transport failures surface as timeouts to the caller; the connection
    /// detail only exists for local logging.
    pub fn code(&self) -> i32 {
        match self {
            AptError::Refused => code::EPERM,
            AptError::Busy => code::EBUSY,
            AptError::Invalid => code::EINVAL,
            AptError::Range => code::ERANGE,
            AptError::Timeout | AptError::Connection(_) => code::ETIMEDOUT,
            AptError::Protocol(_) => code::EINVAL,
        }
    }

    /// Rebuild an error from a wire status. `None` for success.
    pub fn from_code(status: i32) -> Option<AptError> {
        match status {
            code::OK => None,
            code::EPERM => Some(AptError::Refused),
            code::EBUSY => Some(AptError::Busy),
            code::ERANGE => Some(AptError::Range),
            code::ETIMEDOUT => Some(AptError::Timeout),
            _ => Some(AptError::Invalid),
        }
    }
}

impl From<std::io::Error> for AptError {
    fn from(e: std::io::Error) -> Self {
        AptError::Connection(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_roundtrip() {
        for err in [
            AptError::Refused,
            AptError::Busy,
            AptError::Invalid,
            AptError::Range,
            AptError::Timeout,
        ] {
            assert_eq!(AptError::from_code(err.code()), Some(err));
        }
        assert_eq!(AptError::from_code(code::OK), None);
    }

    #[test]
    fn transport_failure_is_a_timeout_on_the_wire() {
        let err = AptError::Connection("connection refused".into());
        assert_eq!(err.code(), code::ETIMEDOUT);
    }
}
