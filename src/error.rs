use std::fmt::Display;

/// Data layer errors. Variants map one-to-one onto the return codes exposed
/// to the upper layers; `Ok(_)` stands in for `Success`.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The requested key is absent. Surfaced to the caller, never logged.
    NotFound,
    /// A stored value or key failed validation against the schema or the
    /// on-disk layout. Indicates corruption at the application layer.
    BadEncoding(String),
    /// The embedded store reported structural corruption.
    Corruption(String),
    /// The underlying I/O is unusable.
    Io(String),
    /// Any other store error we don't know how to handle.
    Db(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotFound => write!(f, "not found"),
            Error::BadEncoding(msg) => write!(f, "bad encoding: {msg}"),
            Error::Corruption(msg) => write!(f, "corruption at the disk layer: {msg}"),
            Error::Io(msg) => write!(f, "io error at the disk layer: {msg}"),
            Error::Db(msg) => write!(f, "db error: {msg}"),
        }
    }
}

/// Constructs an Error::BadEncoding for the given format string.
#[macro_export]
macro_rules! errenc {
    ($($args:tt)*) => { $crate::error::Error::BadEncoding(format!($($args)*)) };
}

/// A stratadb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Db(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::BadEncoding(err.to_string())
    }
}

// The redb error family. StorageError carries the corruption/IO distinction
// the upper layers care about; everything else is classified as Db.

impl From<redb::StorageError> for Error {
    fn from(err: redb::StorageError) -> Self {
        match err {
            redb::StorageError::Corrupted(msg) => Error::Corruption(msg),
            redb::StorageError::Io(e) => Error::Io(e.to_string()),
            other => Error::Db(other.to_string()),
        }
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(err: redb::DatabaseError) -> Self {
        match err {
            redb::DatabaseError::Storage(e) => e.into(),
            other => Error::Db(other.to_string()),
        }
    }
}

impl From<redb::TransactionError> for Error {
    fn from(err: redb::TransactionError) -> Self {
        match err {
            redb::TransactionError::Storage(e) => e.into(),
            other => Error::Db(other.to_string()),
        }
    }
}

impl From<redb::TableError> for Error {
    fn from(err: redb::TableError) -> Self {
        match err {
            redb::TableError::Storage(e) => e.into(),
            other => Error::Db(other.to_string()),
        }
    }
}

impl From<redb::CommitError> for Error {
    fn from(err: redb::CommitError) -> Self {
        match err {
            redb::CommitError::Storage(e) => e.into(),
            other => Error::Db(other.to_string()),
        }
    }
}
