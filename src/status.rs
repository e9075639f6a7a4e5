//! Status codes returned by index operations
//!
//! Every fallible operation returns `Result<T, Status>`. Lost CAS races are
//! never reported here; they are retried inside the operation.

use std::fmt;

/// Status code returned by index operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Status {
    /// Operation completed successfully
    #[default]
    Ok = 0,
    /// Tag or expected address was not found
    NotFound = 1,
    /// Backing memory for buckets could not be obtained
    OutOfMemory = 2,
    /// Operation was aborted (e.g. a resize is already running)
    Aborted = 3,
    /// Invalid argument provided (size not a power of two, too large, ...)
    InvalidArgument = 4,
    /// Invalid operation in current state (e.g. index not initialized)
    InvalidOperation = 5,
}

impl Status {
    /// Check if the status indicates success
    #[inline]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// Check if the tag was not found
    #[inline]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Status::NotFound)
    }

    /// Check if the status indicates an error
    #[inline]
    pub const fn is_error(&self) -> bool {
        matches!(
            self,
            Status::OutOfMemory
                | Status::Aborted
                | Status::InvalidArgument
                | Status::InvalidOperation
        )
    }

    /// Get the status as a string
    pub const fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "Ok",
            Status::NotFound => "NotFound",
            Status::OutOfMemory => "OutOfMemory",
            Status::Aborted => "Aborted",
            Status::InvalidArgument => "InvalidArgument",
            Status::InvalidOperation => "InvalidOperation",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::error::Error for Status {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(Status::Ok.is_ok());
        assert!(!Status::Ok.is_error());
        assert!(!Status::NotFound.is_error());
        assert!(Status::NotFound.is_not_found());
        assert!(Status::OutOfMemory.is_error());
        assert!(Status::InvalidArgument.is_error());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::OutOfMemory.to_string(), "OutOfMemory");
        assert_eq!(format!("{}", Status::Aborted), "Aborted");
        assert_eq!(Status::default(), Status::Ok);
    }
}
