//! Non-throwing error model for the engine.
//!
//! Every fallible core operation returns `Result<T, Error>`. The same
//! `Error` value is also what gets stashed in a process's last-error slot,
//! so callers can re-read it without the operation that produced it still
//! being on the stack (`int_process::getLastError` / `getLastErrorMsg`).

use std::fmt;

/// Coarse classification of what went wrong, matching spec §7 verbatim.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    NotAttached,
    AlreadyAttached,
    NotStopped,
    PermissionDenied,
    UnsupportedPlatformOp,
    BadAddress,
    BadParameter,
    NoSuchThread,
    Interrupted,
    IoFailure,
    InternalInvariantViolated,
    /// A handle (process/thread/breakpoint/response) pointed at an arena
    /// slot that has since been recycled. Not in the original source's
    /// err_t enum since C++ pointers don't carry generation checks; this
    /// is the price (and the benefit) of the arena redesign in spec §9.
    StaleHandle,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotAttached => "not-attached",
            ErrorKind::AlreadyAttached => "already-attached",
            ErrorKind::NotStopped => "not-stopped",
            ErrorKind::PermissionDenied => "permission-denied",
            ErrorKind::UnsupportedPlatformOp => "unsupported-platform-op",
            ErrorKind::BadAddress => "bad-address",
            ErrorKind::BadParameter => "bad-parameter",
            ErrorKind::NoSuchThread => "no-such-thread",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::IoFailure => "io-failure",
            ErrorKind::InternalInvariantViolated => "internal-invariant-violated",
            ErrorKind::StaleHandle => "stale-handle",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully-formed error: a kind plus a human-readable message, exactly the
/// `{kind, human-readable message}` pair the source calls `err_t` /
/// `setLastError`.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Error {
        Error {
            kind,
            message: message.into(),
        }
    }
}

macro_rules! err_ctor {
    ($name:ident, $kind:ident) => {
        impl Error {
            pub fn $name(message: impl Into<String>) -> Error {
                Error::new(ErrorKind::$kind, message)
            }
        }
    };
}

err_ctor!(not_attached, NotAttached);
err_ctor!(already_attached, AlreadyAttached);
err_ctor!(not_stopped, NotStopped);
err_ctor!(permission_denied, PermissionDenied);
err_ctor!(unsupported_platform_op, UnsupportedPlatformOp);
err_ctor!(bad_address, BadAddress);
err_ctor!(bad_parameter, BadParameter);
err_ctor!(no_such_thread, NoSuchThread);
err_ctor!(interrupted, Interrupted);
err_ctor!(io_failure, IoFailure);
err_ctor!(internal_invariant_violated, InternalInvariantViolated);
err_ctor!(stale_handle, StaleHandle);

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let e = Error::bad_address("0xdead is unmapped");
        let s = format!("{}", e);
        assert!(s.contains("bad-address"));
        assert!(s.contains("0xdead is unmapped"));
    }
}
