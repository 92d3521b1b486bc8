//! Status codes returned by engine operations
//!
//! This module defines the status codes that can be returned by sorted
//! collection and recovery operations.

use std::fmt;

/// Status code returned by engine operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Status {
    /// Operation completed successfully
    #[default]
    Ok = 0,
    /// Key was not found
    NotFound = 1,
    /// DRAM allocation failed
    MemoryOverflow = 2,
    /// Persistent-memory allocation failed
    PmemOverflow = 3,
    /// A recorded configuration refers to something not registered
    InvalidConfiguration = 4,
    /// Integrity violation detected; the operation was aborted
    Abort = 5,
}

impl Status {
    /// Check if the status indicates success
    #[inline]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// Check if the key was not found
    #[inline]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Status::NotFound)
    }

    /// Check if the status indicates an error
    #[inline]
    pub const fn is_error(&self) -> bool {
        matches!(
            self,
            Status::MemoryOverflow
                | Status::PmemOverflow
                | Status::InvalidConfiguration
                | Status::Abort
        )
    }

    /// Get the status as a string
    pub const fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "Ok",
            Status::NotFound => "NotFound",
            Status::MemoryOverflow => "MemoryOverflow",
            Status::PmemOverflow => "PmemOverflow",
            Status::InvalidConfiguration => "InvalidConfiguration",
            Status::Abort => "Abort",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
