//! Object metadata read back from the store, and its conversion into the
//! common [`FileInfo`] shape.

use std::time::SystemTime;

use crate::fs::{path, FileInfo};

/// A single listed object or common prefix.
///
/// `key` is the raw store key, without a leading `/`. Common prefixes
/// carry a trailing `/` and no modification time.
#[derive(Clone, Debug)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub modified: Option<SystemTime>,
}

impl ObjectInfo {
    /// The rooted name used by the path predicates.
    pub fn full_name(&self) -> String {
        with_leading_slash(&self.key)
    }
}

pub(crate) fn with_leading_slash(key: &str) -> String {
    if key.starts_with('/') {
        key.to_string()
    } else {
        format!("/{key}")
    }
}

pub(crate) fn object_file_info(oi: &ObjectInfo) -> FileInfo {
    let full = oi.full_name();
    let is_dir = path::is_dir_path(&full);
    FileInfo::new(full, oi.size, oi.modified, is_dir)
}

/// Synthetic entry for a directory that exists only as a key prefix
/// (or via its stub object, which supplies the modification time).
pub(crate) fn synthetic_dir_info(name: &str, modified: Option<SystemTime>) -> FileInfo {
    FileInfo::new(name, 0, modified, true)
}
