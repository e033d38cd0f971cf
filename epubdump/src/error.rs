/// Coarse classification of every [`Error`].
#[derive(Clone, Copy, PartialEq, Eq, Debug, strum::Display)]
pub enum ErrorKind {
    NotOpen,
    OpenFailed,
    ReadFailed,
    SizeMismatch,
    Unsupported,
}

#[derive(thiserror::Error)]
pub enum Error {
    // dependency errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("xml error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("expect 128 bit AES key as base64 or hex string")]
    KeyFormat,

    // lifecycle errors
    #[error("no archive is open")]
    NotOpen,

    #[error("an archive is already open")]
    AlreadyOpen,

    #[error("a dump is already running or was already started")]
    Busy,

    #[error("failed to spawn dump worker: {0}")]
    Spawn(std::io::Error),

    // container errors
    #[error("failed to open input archive: {0}")]
    OpenArchive(zip::result::ZipError),

    #[error("failed to read container descriptor: {0}")]
    ContainerDescriptor(Box<Error>),

    #[error("container descriptor has no root file path")]
    MissingRootFile,

    #[error("failed to create output archive \"{path}\": {source}")]
    CreateOutput {
        path: String,
        source: std::io::Error,
    },

    #[error("encryption test failed for \"{path}\", maybe invalid key: {source}")]
    WrongKey { path: String, source: Box<Error> },

    // entry errors
    #[error("no entry found at {0}")]
    MissingEntry(String),

    #[error("expect 128 bit AES key, got {0} bytes")]
    KeyLength(usize),

    #[error("encrypted data too small ({0} bytes)")]
    Truncated(usize),

    #[error("encrypted data length {0} is not a multiple of the block size")]
    Unaligned(usize),

    #[error("inflate failed: {0}")]
    Inflate(std::io::Error),

    #[error("decompressed size mismatch ({actual}/{expected})")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("dump incomplete, {decrypted} of {expected} encrypted members written")]
    Incomplete { decrypted: usize, expected: usize },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotOpen => ErrorKind::NotOpen,
            Error::AlreadyOpen
            | Error::Busy
            | Error::Spawn(_)
            | Error::OpenArchive(_)
            | Error::ContainerDescriptor(_)
            | Error::MissingRootFile
            | Error::CreateOutput { .. }
            | Error::WrongKey { .. } => ErrorKind::OpenFailed,
            Error::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            Error::KeyLength(_) | Error::KeyFormat => ErrorKind::Unsupported,
            Error::Io(_)
            | Error::Zip(_)
            | Error::Xml(_)
            | Error::MissingEntry(_)
            | Error::Truncated(_)
            | Error::Unaligned(_)
            | Error::Inflate(_)
            | Error::Incomplete { .. } => ErrorKind::ReadFailed,
        }
    }

    /// Negative status code reported for a failed open or dump.
    pub fn code(&self) -> i32 {
        match self {
            Error::OpenArchive(_) => -2,
            Error::WrongKey { .. } => -3,
            Error::ContainerDescriptor(_) => -4,
            Error::MissingRootFile => -5,
            Error::CreateOutput { .. } => -6,
            _ => -1,
        }
    }

    pub fn is_wrong_key(&self) -> bool {
        matches!(self, Error::WrongKey { .. })
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}
