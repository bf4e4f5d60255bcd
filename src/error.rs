//! Crate-wide error type.
//!
//! Four kinds: allocation, transport (a wrapped libfabric errno),
//! protocol, and logic errors. Logic errors are precondition violations
//! (wrong connection state, misaligned offsets, a `commit` with no prior
//! write) and are returned as an ordinary `Result` like everything else
//! here, not asserted.

use std::fmt;

use failure::Fail;

/// Stable numeric identifiers, matching the C source's `enum rpma_error`.
#[repr(i32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    Ok = 0,
    Errno = 1,
    NegativeTimeout = 2,
    InvalidMsg = 3,
    UnhandledEvent = 4,
    EqRead = 5,
    EqEvent = 6,
    EqEventData = 7,
}

/// The crate-wide error type.
#[derive(Debug, Fail)]
pub enum Error {
    /// A local allocation or memory-registration call failed.
    #[fail(display = "allocation failed: {}", _0)]
    Alloc(#[cause] std::io::Error),

    /// A libfabric provider call returned a negative errno.
    #[fail(display = "transport error in {}: {}", call, errno)]
    Transport { call: &'static str, errno: i32 },

    /// An EQ/CQ event was unexpected or otherwise violated protocol.
    #[fail(display = "protocol error: {}", _0)]
    Protocol(ProtocolError),

    /// A precondition was violated (wrong connection state, a misaligned
    /// offset, `commit` called with nothing outstanding). Returned like
    /// any other error rather than asserted, so a caller driving the
    /// state machine incorrectly gets a `Result` to handle instead of a
    /// panic.
    #[fail(display = "logic error: {}", _0)]
    Logic(&'static str),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Fail)]
pub enum ProtocolError {
    #[fail(display = "negative timeout registered")]
    NegativeTimeout,
    #[fail(display = "invalid message size")]
    InvalidMsg,
    #[fail(display = "unhandled EQ event")]
    UnhandledEvent,
    #[fail(display = "EQ read failed")]
    EqRead,
    #[fail(display = "unexpected EQ event")]
    EqEvent,
    #[fail(display = "EQ event carried unexpected data")]
    EqEventData,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Error {
    pub fn transport(call: &'static str, errno: i32) -> Self {
        Error::Transport { call, errno }
    }

    pub fn alloc() -> Self {
        Error::Alloc(std::io::Error::last_os_error())
    }

    /// The wrapped libfabric errno, if this is a transport error.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Transport { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Alloc(_) => ErrorCode::Errno,
            Error::Transport { .. } => ErrorCode::Errno,
            Error::Protocol(ProtocolError::NegativeTimeout) => ErrorCode::NegativeTimeout,
            Error::Protocol(ProtocolError::InvalidMsg) => ErrorCode::InvalidMsg,
            Error::Protocol(ProtocolError::UnhandledEvent) => ErrorCode::UnhandledEvent,
            Error::Protocol(ProtocolError::EqRead) => ErrorCode::EqRead,
            Error::Protocol(ProtocolError::EqEvent) => ErrorCode::EqEvent,
            Error::Protocol(ProtocolError::EqEventData) => ErrorCode::EqEventData,
            Error::Logic(_) => ErrorCode::Errno,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Checks a libfabric `int` return value (`0` on success, `-errno` on
/// failure) and logs the failure the way the C source's `ERR_FI` macro
/// does, before turning it into an `Error::Transport`.
pub(crate) fn check_fi(call: &'static str, ret: i32) -> Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        log::error!("{} failed: {}", call, ret);
        Err(Error::transport(call, -ret))
    }
}

/// Checks a libfabric `ssize_t` return value from a fast-path data-plane
/// call (`fi_cq_sread`, `fi_sendmsg`, ...).
pub(crate) fn check_fi_ssize(call: &'static str, ret: isize) -> Result<isize> {
    if ret >= 0 {
        Ok(ret)
    } else {
        log::error!("{} failed: {}", call, ret);
        Err(Error::transport(call, -ret as i32))
    }
}
