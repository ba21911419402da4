use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FsError>;

/// Errors surfaced by the filesystem backends.
///
/// The unit variants are stable sentinels: callers compare them with
/// `matches!` the way the backends do internally. Backend failures are
/// wrapped, keeping the object-store error code available for
/// [`FileSystem::is_not_exist`](crate::fs::FileSystem::is_not_exist)
/// classification.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("can't open S3 directory")]
    CantOpenS3Directory,

    #[error("directory not empty")]
    DirectoryNotEmpty,

    #[error("destination path is not directory while source is")]
    DestinationPathIsNotDirectory,

    #[error("can't use rename with stub object")]
    CantUseRenameWithStubObject,

    #[error("can't rename non-existent directory")]
    RenamingNonExistentDirectory,

    #[error("given path is not a directory")]
    NotADirectory,

    #[error("directory not exists")]
    DirectoryNotExists,

    #[error("unknown file mode")]
    UnknownFileMode,

    #[error("file already opened")]
    FileAlreadyOpened,

    #[error("file already closed")]
    FileAlreadyClosed,

    /// Returned from a walk callback to skip the directory's children.
    #[error("skip this directory")]
    SkipDir,

    #[error("operation aborted by callback: {0}")]
    Callback(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("object store error: {message}")]
    ObjectStore {
        /// Service error code, e.g. `NoSuchKey`, `NoSuchBucket`, `NotFound`.
        code: Option<String>,
        message: String,
    },
}

impl FsError {
    pub fn is_skip_dir(&self) -> bool {
        matches!(self, FsError::SkipDir)
    }

    pub(crate) fn object_store(code: Option<String>, message: impl Into<String>) -> Self {
        FsError::ObjectStore {
            code,
            message: message.into(),
        }
    }
}
