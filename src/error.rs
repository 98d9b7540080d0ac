//! Error types for the control plane.
//!
//! Every host-facing operation returns [`Result`]. Errors fall into a small
//! closed taxonomy ([`ErrorKind`]) so callers (and the C ABI) can branch on
//! the category without matching on messages.
//!
//! Hardware primitives report a [`DriverStatus`] bit-set. A logical
//! operation issues several primitives, ORs their statuses together and
//! converts once at the end:
//!
//! ```
//! use xdna_ctrl::error::DriverStatus;
//!
//! let mut status = DriverStatus::OK;
//! status |= DriverStatus::OK;
//! status |= DriverStatus::LOCK_TIMEOUT;
//! assert!(status.check("rtp update").is_err());
//! ```

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CtrlError>;

/// Error category, stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid argument (wrong size, wrong port direction, unknown name).
    User,
    /// Operation not valid in the current lifecycle state or access mode.
    StateConflict,
    /// Counter, event port or broadcast channel could not be reserved.
    ResourceUnavailable,
    /// A deadline or poll bound elapsed.
    Timeout,
    /// A wait was aborted through its cancellation token.
    Cancelled,
    /// The tile control interface reported a failure status.
    Driver,
    /// Configuration or metadata could not be used.
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::User => "user error",
            ErrorKind::StateConflict => "state conflict",
            ErrorKind::ResourceUnavailable => "resource unavailable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Driver => "driver error",
            ErrorKind::Config => "configuration error",
        };
        f.write_str(name)
    }
}

/// Accumulated status of one or more tile-control primitives.
///
/// Zero means success. Bits are ORed together as a logical operation
/// progresses, so the final value reports every class of failure seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct DriverStatus(pub u32);

impl DriverStatus {
    pub const OK: Self = Self(0);
    /// Generic primitive failure.
    pub const ERR: Self = Self(1 << 0);
    /// Tile coordinate outside the partition.
    pub const INVALID_TILE: Self = Self(1 << 1);
    /// Address or length outside the tile's memory.
    pub const INVALID_ADDRESS: Self = Self(1 << 2);
    /// Lock id out of range or lock value rejected.
    pub const INVALID_LOCK: Self = Self(1 << 3);
    /// Lock acquire did not succeed within its timeout.
    pub const LOCK_TIMEOUT: Self = Self(1 << 4);
    /// DMA descriptor or channel argument out of range.
    pub const INVALID_DMA: Self = Self(1 << 5);
    /// DMA start queue full.
    pub const QUEUE_FULL: Self = Self(1 << 6);
    /// DMA channel did not go idle within its timeout.
    pub const DMA_TIMEOUT: Self = Self(1 << 7);
    /// Resource id not owned by the caller.
    pub const INVALID_RESOURCE: Self = Self(1 << 8);

    #[inline]
    pub fn is_ok(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// Convert an accumulated status into a result.
    pub fn check(self, context: impl Into<String>) -> Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(CtrlError::Driver {
                status: self,
                context: context.into(),
            })
        }
    }

    /// Fold a primitive result into this status, discarding the value.
    #[inline]
    pub fn absorb<T>(&mut self, result: std::result::Result<T, DriverStatus>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(s) => {
                *self |= s;
                None
            }
        }
    }
}

impl BitOr for DriverStatus {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for DriverStatus {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Control-plane error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CtrlError {
    /// Invalid argument supplied by the caller.
    #[error("{0}")]
    User(String),

    /// A named graph, port or buffer does not exist.
    #[error("{what} '{name}' not found")]
    NotFound {
        /// Kind of object looked up ("graph", "port", ...).
        what: &'static str,
        /// Name used for the lookup.
        name: String,
    },

    /// Lifecycle guard failed.
    #[error("graph '{graph}': cannot {op} {reason}")]
    StateConflict {
        /// Graph name.
        graph: String,
        /// Operation attempted.
        op: &'static str,
        /// Why the guard rejected it.
        reason: String,
    },

    /// Hardware resource could not be reserved.
    #[error("no free {0}")]
    ResourceUnavailable(String),

    /// Deadline or poll bound elapsed.
    #[error("timed out {0}")]
    Timeout(String),

    /// Wait aborted through a cancellation token.
    #[error("cancelled while {0}")]
    Cancelled(String),

    /// Tile control interface failure.
    #[error("{context} failed with driver status {status}")]
    Driver {
        /// Accumulated status bits.
        status: DriverStatus,
        /// Logical operation that failed.
        context: String,
    },

    /// Configuration or metadata inconsistency.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CtrlError {
    /// Error category.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CtrlError::User(_) | CtrlError::NotFound { .. } => ErrorKind::User,
            CtrlError::StateConflict { .. } => ErrorKind::StateConflict,
            CtrlError::ResourceUnavailable(_) => ErrorKind::ResourceUnavailable,
            CtrlError::Timeout(_) => ErrorKind::Timeout,
            CtrlError::Cancelled(_) => ErrorKind::Cancelled,
            CtrlError::Driver { .. } => ErrorKind::Driver,
            CtrlError::Config(_) => ErrorKind::Config,
        }
    }

    /// True for explicit timeouts and for driver failures caused by a lock
    /// or DMA timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            CtrlError::Timeout(_) => true,
            CtrlError::Driver { status, .. } => {
                status.contains(DriverStatus::LOCK_TIMEOUT)
                    || status.contains(DriverStatus::DMA_TIMEOUT)
            }
            _ => false,
        }
    }

    pub(crate) fn user(msg: impl Into<String>) -> Self {
        CtrlError::User(msg.into())
    }

    pub(crate) fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        CtrlError::NotFound { what, name: name.into() }
    }

    pub(crate) fn driver(status: DriverStatus, context: impl Into<String>) -> Self {
        CtrlError::Driver { status, context: context.into() }
    }
}
