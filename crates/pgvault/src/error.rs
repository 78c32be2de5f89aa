use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// pg_dump exited non-zero, timed out, or could not be spawned.
    DumpTool(String),
    /// pg_restore (or a pre-restore step) failed.
    RestoreTool(String),
    /// A checksum did not match the value recorded in metadata.
    Integrity(String),
    /// Malformed metadata, registry, or report JSON.
    Parse(String),
    /// Filesystem or subprocess I/O failure.
    Io(String),
    /// Remote transport failure; retryable up to the configured ceiling.
    Transfer(String),
    /// A local or remote object that was expected to exist is absent.
    NotFound(String),
    /// A required setting is missing or out of range.
    Config(String),
}

impl Error {
    pub fn dump_tool<M: Into<String>>(msg: M) -> Self {
        Self::DumpTool(msg.into())
    }

    pub fn restore_tool<M: Into<String>>(msg: M) -> Self {
        Self::RestoreTool(msg.into())
    }

    pub fn integrity<M: Into<String>>(msg: M) -> Self {
        Self::Integrity(msg.into())
    }

    pub fn parse<M: Into<String>>(msg: M) -> Self {
        Self::Parse(msg.into())
    }

    pub fn io<M: Into<String>>(msg: M) -> Self {
        Self::Io(msg.into())
    }

    pub fn transfer<M: Into<String>>(msg: M) -> Self {
        Self::Transfer(msg.into())
    }

    pub fn not_found<M: Into<String>>(msg: M) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::Config(msg.into())
    }

    pub fn class(&self) -> &'static str {
        match self {
            Error::DumpTool(_) => "DumpToolError",
            Error::RestoreTool(_) => "RestoreToolError",
            Error::Integrity(_) => "IntegrityError",
            Error::Parse(_) => "ParseError",
            Error::Io(_) => "IOError",
            Error::Transfer(_) => "TransferError",
            Error::NotFound(_) => "NotFoundError",
            Error::Config(_) => "ConfigError",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Error::DumpTool(m)
            | Error::RestoreTool(m)
            | Error::Integrity(m)
            | Error::Parse(m)
            | Error::Io(m)
            | Error::Transfer(m)
            | Error::NotFound(m)
            | Error::Config(m) => m,
        }
    }

    // Only transfer errors are safe to retry blindly; everything else means a
    // corrupted artifact, a tool-level failure, or a bad configuration.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transfer(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class(), self.message())
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
