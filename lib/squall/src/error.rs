use std::io;

/// Errors surfaced by the library, either as return values or through an
/// endpoint's `on_error` hook. Success is `Ok(())`; the numeric identities
/// start at 1 and are stable.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Error {
    OutOfMemory,
    Socket(io::ErrorKind),
    Io(io::ErrorKind),
    Address,
    InvalidArgument,
}

impl Error {
    /// Stable numeric identity of the error.
    #[inline]
    pub fn code(self) -> u32 {
        match self {
            Error::OutOfMemory => 1,
            Error::Socket(_) => 2,
            Error::Io(_) => 3,
            Error::Address => 4,
            Error::InvalidArgument => 5,
        }
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        Error::Socket(io_error.kind())
    }
}

pub type Result<T> = ::std::result::Result<T, Error>;
