// src/error.rs

use std::fmt;

/// Error kinds surfaced at the engine boundary.
///
/// Every fallible engine operation reports one of these; the command
/// transport maps them onto whatever numeric space it speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Error {
    /// Malformed fields, missing required items, duplicates, bad alignment.
    InvalidArgument,
    /// Name or connection absent. Also returned instead of
    /// `PermissionDenied` on custom endpoints to avoid leaking existence.
    NotFound,
    /// Policy denial at a default endpoint or the bus database.
    PermissionDenied,
    /// Duplicate bus, name or endpoint where exclusive creation was asked.
    AlreadyExists,
    /// Disconnect requested while the receive queue is non-empty.
    Busy,
    /// Destination id and destination name refer to different connections.
    IdNameMismatch,
    /// A message with `NO_AUTO_START` hit an activator-held name.
    AddressNotAvailable,
    /// The receiver refuses handle transfers.
    Communication,
    /// The receiver's pool has no free range of the required size.
    OutOfSpace,
    /// A quota was hit: pending replies, queued messages, messages per
    /// user, connections per user or buses per user.
    Full,
    /// The destination became inactive.
    ConnectionReset,
    /// A synchronous waiter's peer died.
    BrokenPipe,
    /// The synchronous reply deadline expired.
    TimedOut,
    /// Explicit cancel, or shutdown before completion.
    Cancelled,
    /// External interrupt of a synchronous wait. The reply tracker is left
    /// in place so a restarted call can resume it.
    Interrupted,
    /// Redundant disconnect.
    AlreadyDone,
    /// Operation on a disconnected container.
    Shutdown,
    /// Receive on an empty queue; try again once the receiver is woken.
    Empty,
}

impl Error {
    /// Human-readable description, stable across releases.
    pub fn description(self) -> &'static str {
        match self {
            Error::InvalidArgument => "invalid argument",
            Error::NotFound => "not found",
            Error::PermissionDenied => "permission denied",
            Error::AlreadyExists => "already exists",
            Error::Busy => "resource busy",
            Error::IdNameMismatch => "destination id does not own destination name",
            Error::AddressNotAvailable => "name is held by an activator",
            Error::Communication => "receiver does not accept handles",
            Error::OutOfSpace => "no space left in pool",
            Error::Full => "quota exceeded",
            Error::ConnectionReset => "connection reset",
            Error::BrokenPipe => "broken pipe",
            Error::TimedOut => "timed out",
            Error::Cancelled => "cancelled",
            Error::Interrupted => "interrupted",
            Error::AlreadyDone => "already done",
            Error::Shutdown => "shut down",
            Error::Empty => "queue is empty",
        }
    }

    /// True for errors that report back-pressure rather than corruption.
    ///
    /// Callers can retry these once the receiver drains or releases
    /// resources.
    pub fn is_backpressure(self) -> bool {
        matches!(self, Error::OutOfSpace | Error::Full | Error::Busy)
    }

    /// True for errors that indicate the peer or container is gone and the
    /// operation can never succeed again on the same object.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            Error::ConnectionReset | Error::BrokenPipe | Error::Shutdown
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl std::error::Error for Error {}

/// Engine result alias.
pub type Result<T> = std::result::Result<T, Error>;
