//! Configuration for the S3 filesystem adapter.

use std::time::Duration;

const DEFAULT_OPENED_FILES_TTL: Duration = Duration::from_secs(10 * 60);

/// Parameters for [`S3Fs`](super::S3Fs).
#[derive(Clone, Debug)]
pub struct S3Config {
    /// Object store endpoint as `host:port`.
    pub endpoint: String,
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    /// Enables TLS towards the endpoint.
    pub use_ssl: bool,
    pub bucket_name: String,

    /// Opened staging files older than this are closed automatically.
    pub opened_files_ttl: Duration,
    /// Directory under which staging files are kept.
    pub opened_files_temp_dir: String,

    /// Emulate empty directories with stub objects. Without this,
    /// directory modification times are not available.
    pub emulate_empty_dirs: bool,
    /// Synthesize sub-directory entries in `read_dir` output.
    pub list_directory_entries: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            region: String::new(),
            access_key: String::new(),
            secret_key: String::new(),
            use_ssl: false,
            bucket_name: String::new(),
            opened_files_ttl: Duration::ZERO,
            opened_files_temp_dir: String::new(),
            emulate_empty_dirs: false,
            list_directory_entries: false,
        }
    }
}

impl S3Config {
    pub(crate) fn apply_defaults(&mut self) {
        if self.opened_files_ttl == Duration::ZERO {
            self.opened_files_ttl = DEFAULT_OPENED_FILES_TTL;
        }
        if self.opened_files_temp_dir.is_empty() {
            self.opened_files_temp_dir = "./".to_string();
        }
    }
}
