//! Error types propagated to the RPC boundary
//!
//! Every fallible operation in the daemon core returns [`Error`]: a closed
//! set of error kinds plus the underlying `errno` (0 for synthetic errors)
//! and a human readable message.

use std::fmt;
use std::io;

use thiserror::Error;

/// Result type for daemon operations
pub type Result<T> = std::result::Result<T, Error>;

/// Closed set of error kinds understood by the RPC boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorKind {
    Success = 0,
    Unknown = 1,
    InvalidMethod = 2,
    ContainerAlreadyExists = 3,
    ContainerDoesNotExist = 4,
    InvalidProperty = 5,
    InvalidData = 6,
    InvalidValue = 7,
    InvalidState = 8,
    NotSupported = 9,
    ResourceNotAvailable = 10,
    Permission = 11,
    Busy = 12,
    NoSpace = 13,
    Queued = 14,
}

impl ErrorKind {
    /// Wire code for the control-socket error payload
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Decode a wire code; unknown codes collapse to `Unknown`
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => ErrorKind::Success,
            1 => ErrorKind::Unknown,
            2 => ErrorKind::InvalidMethod,
            3 => ErrorKind::ContainerAlreadyExists,
            4 => ErrorKind::ContainerDoesNotExist,
            5 => ErrorKind::InvalidProperty,
            6 => ErrorKind::InvalidData,
            7 => ErrorKind::InvalidValue,
            8 => ErrorKind::InvalidState,
            9 => ErrorKind::NotSupported,
            10 => ErrorKind::ResourceNotAvailable,
            11 => ErrorKind::Permission,
            12 => ErrorKind::Busy,
            13 => ErrorKind::NoSpace,
            14 => ErrorKind::Queued,
            _ => ErrorKind::Unknown,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Error carrying a kind, the kernel errno (0 if synthetic) and a message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {text}")]
pub struct Error {
    pub kind: ErrorKind,
    pub errno: i32,
    pub text: String,
}

impl Error {
    /// Synthetic error without an underlying errno
    pub fn new(kind: ErrorKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            errno: 0,
            text: text.into(),
        }
    }

    /// Error wrapping a kernel errno; the message gains the OS description
    pub fn from_errno(kind: ErrorKind, errno: i32, text: impl Into<String>) -> Self {
        let text = text.into();
        let text = if errno != 0 {
            format!("{}: {}", text, io::Error::from_raw_os_error(errno))
        } else {
            text
        };
        Self { kind, errno, text }
    }

    /// Error from the calling thread's `errno`
    pub fn os(kind: ErrorKind, text: impl Into<String>) -> Self {
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
        Self::from_errno(kind, errno, text)
    }

    /// Success placeholder used by the control-socket protocol
    pub fn success() -> Self {
        Self {
            kind: ErrorKind::Success,
            errno: 0,
            text: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind == ErrorKind::Success
    }

    /// Whether the underlying errno means "object does not exist"
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.errno,
            libc::ENOENT | libc::ENODEV | libc::ESRCH | libc::ENXIO
        )
    }

    pub fn is_busy(&self) -> bool {
        self.errno == libc::EBUSY
    }

    pub fn is_exists(&self) -> bool {
        self.errno == libc::EEXIST
    }
}

/// Pick an error kind for a kernel errno reported by netlink or a syscall
pub fn kind_for_errno(errno: i32) -> ErrorKind {
    match errno {
        libc::EPERM | libc::EACCES => ErrorKind::Permission,
        libc::EBUSY => ErrorKind::Busy,
        libc::EINVAL => ErrorKind::InvalidValue,
        libc::ENOSPC | libc::ENOBUFS => ErrorKind::NoSpace,
        libc::ENOMEM => ErrorKind::ResourceNotAvailable,
        _ => ErrorKind::Unknown,
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let errno = err.raw_os_error().unwrap_or(0);
        Self {
            kind: kind_for_errno(errno),
            errno,
            text: err.to_string(),
        }
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(err: nix::errno::Errno) -> Self {
        let errno = err as i32;
        Self::from_errno(kind_for_errno(errno), errno, err.desc())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_text() {
        let err = Error::new(ErrorKind::InvalidValue, "bad macvlan type foo");
        assert_eq!(err.to_string(), "InvalidValue: bad macvlan type foo");
    }

    #[test]
    fn from_errno_appends_os_description() {
        let err = Error::from_errno(ErrorKind::Unknown, libc::ESRCH, "setns(net)");
        assert!(err.text.starts_with("setns(net): "));
        assert_eq!(err.errno, libc::ESRCH);
        assert!(err.is_not_found());
    }

    #[test]
    fn kind_codes_roundtrip() {
        for code in 0..15 {
            let kind = ErrorKind::from_code(code);
            assert_eq!(kind.code(), code);
        }
        assert_eq!(ErrorKind::from_code(999), ErrorKind::Unknown);
    }

    #[test]
    fn errno_classification() {
        assert_eq!(kind_for_errno(libc::EPERM), ErrorKind::Permission);
        assert_eq!(kind_for_errno(libc::EBUSY), ErrorKind::Busy);
        assert_eq!(kind_for_errno(libc::ENOMEM), ErrorKind::ResourceNotAvailable);
        assert_eq!(kind_for_errno(libc::EIO), ErrorKind::Unknown);
    }

    #[test]
    fn busy_and_exists_helpers() {
        assert!(Error::from_errno(ErrorKind::Busy, libc::EBUSY, "class del").is_busy());
        assert!(Error::from_errno(ErrorKind::Unknown, libc::EEXIST, "qdisc add").is_exists());
        assert!(!Error::new(ErrorKind::Unknown, "synthetic").is_busy());
    }
}
