//! objfs — a filesystem abstraction over local disk and S3-compatible
//! object stores.
//!
//! The [`fs::FileSystem`] contract is implemented by two backends:
//! [`local::LocalFs`], a thin delegation to the host filesystem, and
//! [`s3::S3Fs`], which makes a flat object store behave like a
//! hierarchical filesystem. The S3 adapter emulates directories with
//! stub objects, stages opened objects to local files with seekable
//! read/write handles, serializes concurrent opens of the same object,
//! and auto-closes handles past a configurable TTL.
//! [`cleaner::remove_empty_dirs`] prunes empty directory subtrees
//! through either backend.

pub mod cleaner;
pub mod error;
pub mod fs;
pub mod local;
pub mod s3;

pub use cleaner::{remove_empty_dirs, Algo};
pub use error::{FsError, Result};
pub use fs::callbacks::{
    after_operation_cb, before_operation_cb, set_after_operation_cb, set_before_operation_cb,
    OpContext, OperationCb,
};
pub use fs::path::{DIR_STUB_FILE_CONTENT, DIR_STUB_FILE_NAME};
pub use fs::{full_names, DirEntry, File, FileInfo, FileNameData, FileSystem, WalkDirFunc};
pub use local::LocalFs;
pub use s3::{S3Config, S3Fs, TEMP_DIR};
