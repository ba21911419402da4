//! Common filesystem contracts implemented by the local backend and the
//! S3 adapter.

pub mod callbacks;
pub mod path;

use std::io::SeekFrom;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::{FsError, Result};

pub use callbacks::OpContext;

/// Information about a file, a directory, or a synthetic directory entry.
#[derive(Clone, Debug)]
pub struct FileInfo {
    full_name: String,
    size: u64,
    modified: Option<SystemTime>,
    is_dir: bool,
}

impl FileInfo {
    pub fn new(
        full_name: impl Into<String>,
        size: u64,
        modified: Option<SystemTime>,
        is_dir: bool,
    ) -> Self {
        Self {
            full_name: full_name.into(),
            size,
            modified,
            is_dir,
        }
    }

    /// Full path of the entry (for S3 this is the rooted object key).
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// Base name of the entry.
    pub fn name(&self) -> String {
        path::base(&self.full_name)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Modification time, when the backend can provide one.
    pub fn modified(&self) -> Option<SystemTime> {
        self.modified
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }
}

/// Full names of a slice of [`FileInfo`]s, in order.
pub fn full_names(infos: &[FileInfo]) -> Vec<String> {
    infos.iter().map(|fi| fi.full_name.clone()).collect()
}

/// A directory entry handed to [`FileSystem::walk_dir`] callbacks.
#[derive(Clone, Debug)]
pub struct DirEntry {
    info: FileInfo,
}

impl DirEntry {
    pub fn new(info: FileInfo) -> Self {
        Self { info }
    }

    pub fn name(&self) -> String {
        self.info.name()
    }

    pub fn full_name(&self) -> &str {
        self.info.full_name()
    }

    pub fn is_dir(&self) -> bool {
        self.info.is_dir()
    }

    pub fn info(&self) -> &FileInfo {
        &self.info
    }
}

/// A file name paired with its contents, for bulk writes.
#[derive(Clone, Debug)]
pub struct FileNameData {
    pub name: String,
    pub data: Vec<u8>,
}

/// Callback for [`FileSystem::walk_dir`].
///
/// Invoked with the entry's name, the entry, and the error that reading
/// the directory produced, if any. Returning [`FsError::SkipDir`] for a
/// directory skips its children.
pub type WalkDirFunc<'a> = dyn FnMut(&str, &DirEntry, Option<FsError>) -> Result<()> + Send + 'a;

/// A seekable read/write file handle.
///
/// `close` is terminal: it flushes state back to the backing store and
/// releases associated resources; a second call fails with
/// [`FsError::FileAlreadyClosed`].
#[async_trait]
pub trait File: Send {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Reads at the given offset without disturbing the cursor.
    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize>;

    async fn write(&mut self, data: &[u8]) -> Result<usize>;

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64>;

    async fn truncate(&mut self, size: u64) -> Result<()>;

    /// Pushes the current contents to the backing store without closing.
    async fn sync(&mut self) -> Result<()>;

    async fn stat(&self) -> Result<FileInfo>;

    async fn close(&mut self) -> Result<()>;

    /// The file's name in its filesystem (the object key for S3 files).
    fn name(&self) -> String;

    /// The local path backing this handle (the staging file for S3
    /// files; equals `name` for local files).
    fn local_name(&self) -> String;
}

/// The filesystem contract implemented by [`LocalFs`](crate::local::LocalFs)
/// and [`S3Fs`](crate::s3::S3Fs).
///
/// Every operation takes an [`OpContext`] and runs between the
/// process-wide operation callbacks (see [`callbacks`]).
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Creates (truncating) a file and returns a handle to it.
    async fn create(&self, ctx: &OpContext, name: &str) -> Result<Box<dyn File>>;

    /// Opens a file for reading.
    async fn open(&self, ctx: &OpContext, name: &str) -> Result<Box<dyn File>>;

    /// Opens a file for writing.
    async fn open_w(&self, ctx: &OpContext, name: &str) -> Result<Box<dyn File>>;

    async fn read_file(&self, ctx: &OpContext, name: &str) -> Result<Vec<u8>>;

    async fn write_file(&self, ctx: &OpContext, name: &str, data: &[u8]) -> Result<()>;

    /// Writes a batch of files; the first failure wins.
    async fn write_files(&self, ctx: &OpContext, files: Vec<FileNameData>) -> Result<()>;

    /// A streaming reader over the file's contents.
    async fn reader(
        &self,
        ctx: &OpContext,
        name: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>>;

    async fn exists(&self, ctx: &OpContext, name: &str) -> Result<bool>;

    /// Recursively creates the path (on S3: stub objects at every level,
    /// a no-op when empty-directory emulation is off).
    async fn make_path_all(&self, ctx: &OpContext, name: &str) -> Result<()>;

    /// Removes an object or an empty directory. Removing a missing
    /// object is not an error on S3.
    async fn remove(&self, ctx: &OpContext, name: &str) -> Result<()>;

    /// Removes a batch of files, returning the names that failed.
    async fn remove_files(&self, ctx: &OpContext, names: &[String]) -> Result<Vec<String>>;

    /// Removes everything under the given path.
    async fn remove_all(&self, ctx: &OpContext, name: &str) -> Result<()>;

    /// Whether the error denotes a missing file, object, or bucket.
    fn is_not_exist(&self, err: &FsError) -> bool;

    /// Whether the directory contains nothing (on S3 with emulation: at
    /// most its own stub object).
    async fn is_empty_path(&self, ctx: &OpContext, name: &str) -> Result<bool>;

    /// Normalizes the path and creates it when missing; returns the
    /// prepared path.
    async fn prepare_path(&self, ctx: &OpContext, name: &str) -> Result<String>;

    async fn rename(&self, ctx: &OpContext, from: &str, to: &str) -> Result<()>;

    async fn stat(&self, ctx: &OpContext, name: &str) -> Result<FileInfo>;

    async fn read_dir(&self, ctx: &OpContext, name: &str) -> Result<Vec<FileInfo>>;

    /// Walks the tree rooted at `root`, calling `walk_fn` for the root
    /// first and then every entry below it.
    async fn walk_dir(
        &self,
        ctx: &OpContext,
        root: &str,
        walk_fn: &mut WalkDirFunc<'_>,
    ) -> Result<()>;

    fn join(&self, parts: &[&str]) -> String;

    fn dir(&self, name: &str) -> String;

    fn ext(&self, name: &str) -> String;

    fn base(&self, name: &str) -> String;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_info_accessors() {
        let fi = FileInfo::new("/a/b/c.txt", 12, None, false);
        assert_eq!(fi.full_name(), "/a/b/c.txt");
        assert_eq!(fi.name(), "c.txt");
        assert_eq!(fi.size(), 12);
        assert!(!fi.is_dir());

        let dir = FileInfo::new("/a/b/", 0, None, true);
        assert_eq!(dir.name(), "b");
        assert!(dir.is_dir());
    }

    #[test]
    fn full_names_preserves_order() {
        let infos = vec![
            FileInfo::new("/b", 0, None, false),
            FileInfo::new("/a", 0, None, false),
        ];
        assert_eq!(full_names(&infos), vec!["/b".to_string(), "/a".to_string()]);
    }
}
