use failure::Fail;

/// Error taxonomy shared by all ascii-chat crates.
///
/// Callers dispatch on the variant for recovery: a failed codec
/// intersection (`NotFound`) downgrades to monochrome, an exhausted render
/// destination (`ResourceExhausted`) is retried with a larger buffer, and
/// `MitmDetected` aborts the session.
#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "invalid parameter: {}", _0)]
    InvalidParam(String),

    #[fail(display = "not found: {}", _0)]
    NotFound(String),

    #[fail(display = "resource exhausted: {}", _0)]
    ResourceExhausted(String),

    #[fail(display = "I/O error: {}", _0)]
    Io(#[fail(cause)] std::io::Error),

    #[fail(display = "corrupt data: {}", _0)]
    Corrupt(String),

    #[fail(display = "host key mismatch for {}; possible man-in-the-middle", _0)]
    MitmDetected(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}
