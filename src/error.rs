//! Error handling stuff
use displaydoc::Display;
use nix::errno::Errno;
use std::io;
use thiserror::Error;

/// Direction of an attribute access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl std::fmt::Display for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Access::Read => write!(f, "read"),
            Access::Write => write!(f, "write"),
        }
    }
}

/// Error type for attribute dispatch and the state behind it
#[derive(Debug, Display, Error)]
pub enum Error {
    /// Attribute `{0}` not found
    NotFound(String),

    /// Attribute `{0}` does not allow {1}
    PermissionDenied(String, Access),

    /// Invalid argument: {0}
    InvalidArgument(String),

    /// Attribute `{0}` is already registered
    DuplicateName(String),

    /// Attribute `{0}` is invalid: {1}
    InvalidDescriptor(String, &'static str),

    /// Device unavailable: {0}
    DeviceUnavailable(#[source] io::Error),

    /// `{0}` is not supported by the firmware
    Unsupported(&'static str),

    /// Copy to caller buffer failed: {0}
    IoFault(#[source] io::Error),
}

impl Error {
    /// Kernel errno equivalent of this error.
    ///
    /// Hosts bridging to a real virtual filesystem return the negated value
    /// from their show/store callbacks.
    pub fn errno(&self) -> Errno {
        match self {
            Error::NotFound(_) => Errno::ENOENT,
            Error::PermissionDenied(..) => Errno::EACCES,
            Error::InvalidArgument(_) => Errno::EINVAL,
            Error::DuplicateName(_) => Errno::EEXIST,
            Error::InvalidDescriptor(..) => Errno::EINVAL,
            Error::DeviceUnavailable(_) => Errno::ENODEV,
            Error::Unsupported(_) => Errno::EOPNOTSUPP,
            Error::IoFault(_) => Errno::EFAULT,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error text.
pub(crate) mod text {
    pub const NOT_A_NUMBER: &str = "expected a decimal number";

    pub const NOT_BOOL: &str = "expected 0 or 1";

    pub const EMPTY: &str = "empty input";

    pub const TOO_LONG: &str = "input too long";

    pub const NO_HANDLERS: &str = "neither show nor store handler";

    pub const WORLD_WRITABLE: &str = "attributes cannot be world-writable";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::NotFound("x".into()).errno(), Errno::ENOENT);
        assert_eq!(
            Error::PermissionDenied("x".into(), Access::Write).errno(),
            Errno::EACCES
        );
        assert_eq!(Error::invalid("x").errno(), Errno::EINVAL);
        assert_eq!(
            Error::IoFault(io::ErrorKind::WriteZero.into()).errno(),
            Errno::EFAULT
        );
    }

    #[test]
    fn display() {
        let e = Error::PermissionDenied("power_stats".into(), Access::Write);
        assert_eq!(e.to_string(), "Attribute `power_stats` does not allow write");
    }
}
