//! S3 filesystem adapter.
//!
//! Presents an S3-compatible object store as a hierarchical filesystem.
//! Directory structure is virtual: a directory exists while some key
//! carries its prefix, and empty directories can be materialized by stub
//! objects (see [`crate::fs::path::DIR_STUB_FILE_NAME`]). Opening a file
//! downloads the object to a local staging file; closing the handle
//! writes changes back and removes the staging copy. A background task
//! auto-closes handles that outlive the configured TTL.

pub mod config;
pub mod file_info;
pub mod opened_file;
pub mod opened_files;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::get_object::GetObjectOutput;
use aws_sdk_s3::operation::head_object::HeadObjectOutput;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use futures::future::BoxFuture;
use log::error;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{FsError, Result};
use crate::fs::callbacks::{run_op, OpContext};
use crate::fs::path::{self, DIR_STUB_FILE_CONTENT};
use crate::fs::{DirEntry, File, FileInfo, FileNameData, FileSystem, WalkDirFunc};
use crate::local::LocalFs;

pub use config::S3Config;
pub use file_info::ObjectInfo;
use file_info::{object_file_info, synthetic_dir_info, with_leading_slash};
pub use opened_file::S3OpenedFile;
pub use opened_files::{S3OpenedFilesList, S3OpenedFilesListEntry};

/// Subdirectory of the configured temp dir holding staging files.
pub const TEMP_DIR: &str = "tmp";

/// Concurrent uploads performed by `write_files`.
const BULK_UPLOAD_CONCURRENCY: usize = 8;

/// Keys per bulk `DeleteObjects` request.
const BULK_REMOVE_BATCH: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OpenMode {
    Open,
    Create,
    Write,
}

struct S3Inner {
    client: Client,
    bucket_name: String,

    // Staging store for opened files.
    local: LocalFs,
    opened_files: S3OpenedFilesList,
    opened_files_ttl: Duration,
    opened_files_temp_dir: String,

    emulate_empty_dirs: bool,
    list_directory_entries: AtomicBool,

    cleaner_cancel: CancellationToken,
    cleaner_handle: Mutex<Option<JoinHandle<()>>>,
}

/// S3 implementation of [`FileSystem`]. Cheap to clone; clones share the
/// client, the opened-files registry, and the TTL cleaner.
#[derive(Clone)]
pub struct S3Fs {
    inner: Arc<S3Inner>,
}

fn object_key(name: &str) -> &str {
    name.strip_prefix('/').unwrap_or(name)
}

fn sdk_err<E, R>(err: SdkError<E, R>) -> FsError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let code = ProvideErrorMetadata::code(&err).map(str::to_string);
    FsError::object_store(code, format!("{}", DisplayErrorContext(&err)))
}

/// Forces the given error code into the wrapped error when `condition`
/// holds and the service response carried none (HEAD responses have no
/// body to parse a code from).
fn sdk_err_coded<E, R>(err: SdkError<E, R>, condition: bool, code: &str) -> FsError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug + Send + Sync + 'static,
{
    let mut mapped = sdk_err(err);
    if condition {
        if let FsError::ObjectStore { code: c, .. } = &mut mapped {
            c.get_or_insert_with(|| code.to_string());
        }
    }
    mapped
}

fn build_client(cfg: &S3Config) -> Client {
    let scheme = if cfg.use_ssl { "https" } else { "http" };
    let region = if cfg.region.is_empty() {
        "us-east-1".to_string()
    } else {
        cfg.region.clone()
    };
    let creds = Credentials::new(
        cfg.access_key.clone(),
        cfg.secret_key.clone(),
        None,
        None,
        "objfs",
    );
    let conf = aws_sdk_s3::Config::builder()
        .behavior_version(BehaviorVersion::latest())
        .endpoint_url(format!("{scheme}://{}", cfg.endpoint))
        .region(Region::new(region))
        .credentials_provider(creds)
        .force_path_style(true)
        .build();
    Client::from_conf(conf)
}

/// Content type by body sniffing; text when the bytes are valid UTF-8,
/// octet-stream otherwise.
fn detect_content_type(data: &[u8]) -> &'static str {
    match infer::get(data) {
        Some(kind) => kind.mime_type(),
        None if std::str::from_utf8(data).is_ok() => "text/plain",
        None => "application/octet-stream",
    }
}

impl S3Fs {
    /// Connects to the object store: validates the bucket (creating it
    /// when missing), writes the root stub under empty-dir emulation,
    /// and starts the TTL cleaner.
    pub async fn new(mut cfg: S3Config) -> Result<S3Fs> {
        cfg.apply_defaults();
        let emulate = cfg.emulate_empty_dirs;
        let s3 = Self::assemble(cfg);
        s3.ensure_bucket().await?;
        if emulate {
            s3.put_stub_object("").await?;
        }
        let handle = s3.spawn_cleaner();
        *s3.inner.cleaner_handle.lock().unwrap() = Some(handle);
        Ok(s3)
    }

    fn assemble(cfg: S3Config) -> S3Fs {
        let client = build_client(&cfg);
        S3Fs {
            inner: Arc::new(S3Inner {
                client,
                bucket_name: cfg.bucket_name,
                local: LocalFs::new(),
                opened_files: S3OpenedFilesList::new(),
                opened_files_ttl: cfg.opened_files_ttl,
                opened_files_temp_dir: cfg.opened_files_temp_dir,
                emulate_empty_dirs: cfg.emulate_empty_dirs,
                list_directory_entries: AtomicBool::new(cfg.list_directory_entries),
                cleaner_cancel: CancellationToken::new(),
                cleaner_handle: Mutex::new(None),
            }),
        }
    }

    /// Stops the TTL cleaner after one final sweep that closes every
    /// registered handle.
    pub async fn shutdown(&self) {
        self.inner.cleaner_cancel.cancel();
        let handle = self.inner.cleaner_handle.lock().unwrap().take();
        if let Some(h) = handle {
            let _ = h.await;
        }
    }

    /// The underlying SDK client, mainly for tests.
    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    pub fn bucket_name(&self) -> &str {
        &self.inner.bucket_name
    }

    /// The opened files registry, mainly for tests.
    pub fn opened_files(&self) -> &S3OpenedFilesList {
        &self.inner.opened_files
    }

    /// Toggles synthetic directory entries in `read_dir` output.
    pub fn set_list_directory_entries(&self, v: bool) {
        self.inner.list_directory_entries.store(v, Ordering::SeqCst);
    }

    fn list_directory_entries(&self) -> bool {
        self.inner.list_directory_entries.load(Ordering::SeqCst)
    }

    pub(crate) fn local(&self) -> &LocalFs {
        &self.inner.local
    }

    /// The staging file path for the given object name.
    ///
    /// Replaces `/` with `__`; names like `/a_/b` and `/a/_b` therefore
    /// alias to the same staging file. Aliased opens serialize on the
    /// registry entry, so the collision degrades to mutual exclusion.
    pub fn temp_file_name(&self, name: &str) -> String {
        Path::new(&self.inner.opened_files_temp_dir)
            .join(TEMP_DIR)
            .join(name.replace('/', "__"))
            .to_string_lossy()
            .into_owned()
    }

    async fn ensure_bucket(&self) -> Result<()> {
        let head = self
            .inner
            .client
            .head_bucket()
            .bucket(&self.inner.bucket_name)
            .send()
            .await;
        match head {
            Ok(_) => Ok(()),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => {
                self.inner
                    .client
                    .create_bucket()
                    .bucket(&self.inner.bucket_name)
                    .send()
                    .await
                    .map_err(sdk_err)?;
                Ok(())
            }
            Err(e) => Err(sdk_err(e)),
        }
    }

    async fn head_object(&self, name: &str) -> Result<HeadObjectOutput> {
        self.inner
            .client
            .head_object()
            .bucket(&self.inner.bucket_name)
            .key(object_key(name))
            .send()
            .await
            .map_err(|e| {
                let not_found = e.as_service_error().is_some_and(|se| se.is_not_found());
                sdk_err_coded(e, not_found, "NotFound")
            })
    }

    async fn get_object(&self, name: &str) -> Result<GetObjectOutput> {
        self.inner
            .client
            .get_object()
            .bucket(&self.inner.bucket_name)
            .key(object_key(name))
            .send()
            .await
            .map_err(|e| {
                let missing = e.as_service_error().is_some_and(|se| se.is_no_such_key());
                sdk_err_coded(e, missing, "NoSuchKey")
            })
    }

    async fn put_object(&self, name: &str, data: &[u8], content_type: &str) -> Result<()> {
        self.inner
            .client
            .put_object()
            .bucket(&self.inner.bucket_name)
            .key(object_key(name))
            .body(ByteStream::from(data.to_vec()))
            .content_type(content_type)
            .send()
            .await
            .map_err(sdk_err)?;
        Ok(())
    }

    async fn copy_object(&self, from: &str, to: &str) -> Result<()> {
        self.inner
            .client
            .copy_object()
            .bucket(&self.inner.bucket_name)
            .copy_source(format!(
                "{}/{}",
                self.inner.bucket_name,
                object_key(from)
            ))
            .key(object_key(to))
            .send()
            .await
            .map_err(sdk_err)?;
        Ok(())
    }

    /// Removing a missing object is not an error.
    async fn remove_object(&self, name: &str) -> Result<()> {
        self.inner
            .client
            .delete_object()
            .bucket(&self.inner.bucket_name)
            .key(object_key(name))
            .send()
            .await
            .map_err(sdk_err)?;
        Ok(())
    }

    async fn put_stub_object(&self, name: &str) -> Result<()> {
        let stub = path::name_to_stub(name);
        self.put_object(&stub, DIR_STUB_FILE_CONTENT, "text/plain")
            .await
    }

    /// Iterates objects under the prefix, one page of `ListObjectsV2` at
    /// a time. Non-recursive listings report common prefixes as
    /// directory entries (trailing `/`). The callback returns whether to
    /// continue.
    async fn for_each_object<F>(
        &self,
        ctx: &OpContext,
        name: &str,
        recursive: bool,
        mut f: F,
    ) -> Result<()>
    where
        F: FnMut(ObjectInfo) -> Result<bool>,
    {
        let prefix = object_key(name).to_string();
        let mut token: Option<String> = None;
        'pages: loop {
            ctx.ensure_live()?;
            let mut req = self
                .inner
                .client
                .list_objects_v2()
                .bucket(&self.inner.bucket_name)
                .prefix(&prefix);
            if !recursive {
                req = req.delimiter("/");
            }
            if let Some(t) = &token {
                req = req.continuation_token(t);
            }
            let resp = req.send().await.map_err(sdk_err)?;

            for cp in resp.common_prefixes() {
                let Some(p) = cp.prefix() else { continue };
                let oi = ObjectInfo {
                    key: p.to_string(),
                    size: 0,
                    modified: None,
                };
                if !f(oi)? {
                    break 'pages;
                }
            }
            for obj in resp.contents() {
                let Some(k) = obj.key() else { continue };
                let oi = ObjectInfo {
                    key: k.to_string(),
                    size: obj.size().unwrap_or(0).max(0) as u64,
                    modified: obj
                        .last_modified()
                        .and_then(|d| SystemTime::try_from(*d).ok()),
                };
                if !f(oi)? {
                    break 'pages;
                }
            }

            if resp.is_truncated() == Some(true) {
                match resp.next_continuation_token() {
                    Some(t) => token = Some(t.to_string()),
                    None => break,
                }
            } else {
                break;
            }
        }
        Ok(())
    }

    async fn list_objects(
        &self,
        ctx: &OpContext,
        name: &str,
        recursive: bool,
    ) -> Result<Vec<ObjectInfo>> {
        let mut out = Vec::new();
        self.for_each_object(ctx, name, recursive, |oi| {
            out.push(oi);
            Ok(true)
        })
        .await?;
        Ok(out)
    }

    /// Counts items under a folder, optionally recursing. The callback,
    /// when given, receives each entry with the running count; returning
    /// `Ok(false)` stops the count, an error aborts it.
    pub async fn count(
        &self,
        ctx: &OpContext,
        name: &str,
        recursive: bool,
        mut count_fn: Option<&mut (dyn FnMut(&ObjectInfo, i64) -> Result<bool> + Send)>,
    ) -> Result<i64> {
        let name = path::normalize(name);
        let mut c = 0i64;
        self.for_each_object(ctx, &name, recursive, |oi| {
            c += 1;
            if let Some(f) = count_fn.as_mut() {
                if !f(&oi, c)? {
                    return Ok(false);
                }
            }
            Ok(true)
        })
        .await?;
        Ok(c)
    }

    async fn exists_inner(&self, ctx: &OpContext, name: &str) -> Result<bool> {
        let name = path::normalize(name);
        if !path::is_dir_path(&name) {
            return match self.head_object(&name).await {
                Ok(_) => Ok(true),
                Err(e) if self.is_not_exist(&e) => Ok(false),
                Err(e) => Err(e),
            };
        }
        // A directory virtually exists while some key carries its
        // prefix; checking only the stub would miss dirs created by
        // plain object writes.
        let count = self.count(ctx, &name, true, None).await?;
        Ok(count > 0)
    }

    async fn make_path_all_inner(&self, name: &str) -> Result<()> {
        if !self.inner.emulate_empty_dirs {
            return Ok(());
        }
        let mut name = path::normalize(name);
        while name != "/" {
            self.put_stub_object(&name).await?;
            name = path::dir(&name);
        }
        Ok(())
    }

    async fn is_empty_path_inner(&self, ctx: &OpContext, name: &str) -> Result<bool> {
        let name = path::name_to_dir(&path::normalize(name));

        if !self.exists_inner(ctx, &name).await? {
            return Ok(true);
        }

        let emulate = self.inner.emulate_empty_dirs;
        let own_stub = path::name_to_stub(&name);
        let mut i = 0i64;
        let mut non_empty = false;
        self.for_each_object(ctx, &name, true, |oi| {
            i += 1;
            let violates = if emulate {
                i > 1 || oi.full_name() != own_stub
            } else {
                i > 0
            };
            if violates {
                non_empty = true;
                return Ok(false);
            }
            Ok(true)
        })
        .await?;
        if non_empty {
            return Ok(false);
        }
        Ok(if emulate { i == 1 } else { i == 0 })
    }

    async fn remove_inner(&self, ctx: &OpContext, name: &str) -> Result<()> {
        let name = path::stub_to_dir(&path::normalize(name));
        if !path::is_dir_path(&name) {
            return self.remove_object(&name).await;
        }

        if !self.is_empty_path_inner(ctx, &name).await? {
            return Err(FsError::DirectoryNotEmpty);
        }
        if !self.inner.emulate_empty_dirs {
            return Ok(());
        }
        self.remove_object(&path::name_to_stub(&name)).await
    }

    async fn delete_objects_batched(&self, names: &[String]) -> Result<Vec<String>> {
        let mut failed = Vec::new();
        for chunk in names.chunks(BULK_REMOVE_BATCH) {
            let mut ids = Vec::with_capacity(chunk.len());
            for n in chunk {
                let id = ObjectIdentifier::builder()
                    .key(object_key(n))
                    .build()
                    .map_err(|e| FsError::object_store(None, e.to_string()))?;
                ids.push(id);
            }
            if ids.is_empty() {
                continue;
            }
            let delete = Delete::builder()
                .set_objects(Some(ids))
                .build()
                .map_err(|e| FsError::object_store(None, e.to_string()))?;
            let resp = self
                .inner
                .client
                .delete_objects()
                .bucket(&self.inner.bucket_name)
                .delete(delete)
                .send()
                .await
                .map_err(sdk_err)?;
            for de in resp.errors() {
                let Some(key) = de.key() else { continue };
                error!(
                    "bulk remove: failed to remove object {key:?}: {} {}",
                    de.code().unwrap_or_default(),
                    de.message().unwrap_or_default()
                );
                failed.push(with_leading_slash(key));
            }
        }
        Ok(failed)
    }

    async fn remove_files_inner(
        &self,
        ctx: &OpContext,
        names: &[String],
    ) -> Result<Vec<String>> {
        let names: Vec<String> = names
            .iter()
            .map(|n| path::stub_to_dir(&path::normalize(n)))
            .collect();

        // Refuse the whole batch before removing anything.
        for n in &names {
            if path::is_dir_path(n) && !self.is_empty_path_inner(ctx, n).await? {
                return Err(FsError::DirectoryNotEmpty);
            }
        }

        let mut keys = Vec::new();
        for n in &names {
            if path::is_dir_path(n) {
                if self.inner.emulate_empty_dirs {
                    keys.push(path::name_to_stub(n));
                }
            } else {
                keys.push(n.clone());
            }
        }
        self.delete_objects_batched(&keys).await
    }

    async fn remove_all_inner(&self, ctx: &OpContext, name: &str) -> Result<()> {
        let name = path::normalize(name);
        let keys: Vec<String> = self
            .list_objects(ctx, &name, path::is_dir(&name))
            .await?
            .into_iter()
            .map(|oi| oi.full_name())
            .filter(|k| !path::is_dir_path(k))
            .collect();
        let failed = self.delete_objects_batched(&keys).await?;
        if let Some(first) = failed.first() {
            return Err(FsError::object_store(
                None,
                format!("failed to remove object {first:?}"),
            ));
        }
        Ok(())
    }

    async fn rename_inner(&self, ctx: &OpContext, from: &str, to: &str) -> Result<()> {
        let from = path::normalize(from);
        let to = path::normalize(to);
        if from == to {
            return Ok(());
        }

        // Renaming a stub would silently destroy the directory marker.
        if path::is_stub(&from) || path::is_stub(&to) {
            return Err(FsError::CantUseRenameWithStubObject);
        }

        if !path::is_dir(&from) {
            self.make_path_all_inner(&path::dir(&to)).await?;
            self.copy_object(&from, &to).await?;
            return self.remove_object(&from).await;
        }

        if !path::is_dir_path(&to) {
            return Err(FsError::DestinationPathIsNotDirectory);
        }
        if !self.exists_inner(ctx, &from).await? {
            return Err(FsError::RenamingNonExistentDirectory);
        }

        let objects = self.list_objects(ctx, &from, true).await?;
        for oi in objects {
            let obj_from = oi.full_name();
            let suffix = obj_from.strip_prefix(&from).unwrap_or(&obj_from);
            let obj_to = format!("{to}{suffix}");
            self.make_path_all_inner(&path::dir(&obj_to)).await?;
            self.copy_object(&obj_from, &obj_to).await?;
            if let Err(e) = self.remove_object(&obj_from).await {
                error!("rename: failed to remove object {obj_from:?} while batch moving: {e}");
            }
        }
        Ok(())
    }

    async fn stat_inner(&self, ctx: &OpContext, name: &str) -> Result<FileInfo> {
        let name = path::normalize(name);
        if path::is_dir_path(&name) && self.inner.emulate_empty_dirs {
            let head = self.head_object(&path::name_to_stub(&name)).await?;
            let modified = head
                .last_modified()
                .and_then(|d| SystemTime::try_from(*d).ok());
            return Ok(synthetic_dir_info(&name, modified));
        }

        if path::is_dir_path(&name) {
            let c = self.count(ctx, &name, true, None).await?;
            if c > 0 {
                // Modification time is unavailable without emulation.
                return Ok(synthetic_dir_info(&name, None));
            }
            return Err(FsError::DirectoryNotExists);
        }

        let head = self.head_object(&name).await?;
        let modified = head
            .last_modified()
            .and_then(|d| SystemTime::try_from(*d).ok());
        let size = head.content_length().unwrap_or(0).max(0) as u64;
        Ok(FileInfo::new(&name, size, modified, false))
    }

    async fn read_dir_inner(&self, ctx: &OpContext, name: &str) -> Result<Vec<FileInfo>> {
        let name = path::normalize(name);
        if !path::is_dir(&name) {
            return Err(FsError::NotADirectory);
        }
        let name = path::stub_to_dir(&name);

        let mut fi = Vec::new();
        self.for_each_object(ctx, &name, false, |oi| {
            let full = oi.full_name();
            // Common prefixes and stub objects are not file entries.
            if path::is_dir(&full) {
                return Ok(true);
            }
            fi.push(object_file_info(&oi));
            Ok(true)
        })
        .await?;

        if !self.list_directory_entries() {
            return Ok(fi);
        }

        // Collect every directory exactly one level below `name` from
        // the ancestor chains of all keys under the prefix.
        let mut dirs = std::collections::BTreeSet::new();
        self.for_each_object(ctx, &name, true, |oi| {
            let mut key = parent_dir_path(&oi.full_name());
            while !key.trim_end_matches('/').is_empty() {
                if key.starts_with(&name)
                    && key != name
                    && key[name.len()..].matches('/').count() <= 1
                {
                    dirs.insert(key.clone());
                }
                key = parent_dir_path(key.trim_end_matches('/'));
            }
            Ok(true)
        })
        .await?;

        for dir_name in dirs {
            let modified = if self.inner.emulate_empty_dirs {
                self.stat_inner(ctx, &path::name_to_stub(&dir_name))
                    .await?
                    .modified()
            } else {
                None
            };
            fi.push(synthetic_dir_info(&dir_name, modified));
        }
        Ok(fi)
    }

    fn walk_dir_inner<'a>(
        &'a self,
        ctx: &'a OpContext,
        name: String,
        entry: DirEntry,
        walk_fn: &'a mut WalkDirFunc<'a>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let name = path::normalize(&name);
            if let Err(e) = walk_fn(&name, &entry, None) {
                if e.is_skip_dir() && entry.is_dir() {
                    return Ok(());
                }
                return Err(e);
            }
            if !entry.is_dir() {
                return Ok(());
            }

            let fsi = match self.read_dir_inner(ctx, &name).await {
                Ok(v) => v,
                Err(e) => {
                    // Second invocation reports the read error; its
                    // result decides the walk's outcome.
                    walk_fn(&name, &entry, Some(e))?;
                    Vec::new()
                }
            };
            for info in fsi {
                if path::is_stub(info.full_name()) {
                    continue;
                }
                let child_name = info.full_name().to_string();
                match self
                    .walk_dir_inner(ctx, child_name, DirEntry::new(info), walk_fn)
                    .await
                {
                    Err(e) if e.is_skip_dir() => break,
                    Err(e) => return Err(e),
                    Ok(()) => {}
                }
            }
            Ok(())
        })
    }

    async fn open_file(
        &self,
        ctx: &OpContext,
        name: &str,
        mode: OpenMode,
    ) -> Result<Box<dyn File>> {
        let name = path::normalize(name);
        if path::is_dir(&name) {
            return Err(FsError::CantOpenS3Directory);
        }

        let local_name = self.temp_file_name(&name);
        let existing = self.inner.opened_files.peek(&local_name);

        let staging_parent = self.inner.local.dir(&local_name);
        self.inner.local.make_path_all(ctx, &staging_parent).await?;

        // Reusing the existing entry makes a concurrent opener park on
        // the same per-file lock until the holder closes.
        let entry = existing.unwrap_or_else(|| {
            S3OpenedFilesListEntry::new(
                SystemTime::now(),
                S3OpenedFile::new(self.clone(), ctx.clone(), local_name.clone(), name.clone()),
            )
        });
        let handle = entry.file.clone();
        self.inner.opened_files.add_and_lock(&local_name, entry).await;

        let prepared: Result<Box<dyn File>> = async {
            if mode != OpenMode::Create {
                let object = self.get_object(&name).await?;
                let mut reader = object.body.into_async_read();
                let mut staging = self.inner.local.create(ctx, &local_name).await?;
                let mut chunk = [0u8; 64 * 1024];
                loop {
                    let n = reader.read(&mut chunk).await?;
                    if n == 0 {
                        break;
                    }
                    let mut written = 0;
                    while written < n {
                        written += staging.write(&chunk[written..n]).await?;
                    }
                }
                staging.close().await?;
            }
            let file = match mode {
                OpenMode::Open => self.inner.local.open(ctx, &local_name).await?,
                OpenMode::Create => self.inner.local.create(ctx, &local_name).await?,
                OpenMode::Write => self.inner.local.open_w(ctx, &local_name).await?,
            };
            Ok(file)
        }
        .await;

        match prepared {
            Ok(file) => {
                handle.set_underlying(file).await;
                Ok(Box::new(handle))
            }
            Err(e) => {
                // Roll back the partially prepared open.
                self.inner.opened_files.delete_and_unlock(&local_name);
                if let Ok(true) = self.inner.local.exists(ctx, &local_name).await {
                    let _ = self.inner.local.remove(ctx, &local_name).await;
                }
                Err(e)
            }
        }
    }

    /// Non-blocking variant of [`FileSystem::open`]: fails with
    /// [`FsError::FileAlreadyOpened`] when the staging path is already
    /// held instead of waiting for the holder to close.
    pub async fn try_open(&self, ctx: &OpContext, name: &str) -> Result<Box<dyn File>> {
        run_op(ctx, |ctx| async move {
            let normalized = path::normalize(name);
            if path::is_dir(&normalized) {
                return Err(FsError::CantOpenS3Directory);
            }
            if self
                .inner
                .opened_files
                .exists(&self.temp_file_name(&normalized))
            {
                return Err(FsError::FileAlreadyOpened);
            }
            self.open_file(&ctx, name, OpenMode::Open).await
        })
        .await
    }

    fn spawn_cleaner(&self) -> JoinHandle<()> {
        let s3 = self.clone();
        let token = self.inner.cleaner_cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(s3.inner.opened_files_ttl);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        s3.sweep_opened_files(false).await;
                    }
                    _ = token.cancelled() => {
                        s3.sweep_opened_files(true).await;
                        break;
                    }
                }
            }
        })
    }

    async fn sweep_opened_files(&self, close_all: bool) {
        let now = SystemTime::now();
        let ttl = self.inner.opened_files_ttl;
        let to_close: Vec<S3OpenedFile> = self
            .inner
            .opened_files
            .snapshot()
            .into_iter()
            .filter(|(_, added, _)| close_all || *added + ttl <= now)
            .map(|(_, _, file)| file)
            .collect();
        for file in to_close {
            file.log_autoclose();
            if let Err(e) = file.close_impl().await {
                error!(
                    "opened files cleaning: failed to close {:?}: {e}",
                    file.local_name()
                );
            }
        }
    }
}

/// Parent directory of the name, with a trailing `/` re-attached.
fn parent_dir_path(name: &str) -> String {
    let d = path::dir(name);
    if d.ends_with('/') {
        d
    } else {
        format!("{d}/")
    }
}

#[async_trait]
impl FileSystem for S3Fs {
    async fn create(&self, ctx: &OpContext, name: &str) -> Result<Box<dyn File>> {
        run_op(ctx, |ctx| async move {
            let normalized = path::normalize(name);
            self.make_path_all_inner(&path::dir(&normalized)).await?;
            self.open_file(&ctx, name, OpenMode::Create).await
        })
        .await
    }

    async fn open(&self, ctx: &OpContext, name: &str) -> Result<Box<dyn File>> {
        run_op(ctx, |ctx| async move {
            self.open_file(&ctx, name, OpenMode::Open).await
        })
        .await
    }

    async fn open_w(&self, ctx: &OpContext, name: &str) -> Result<Box<dyn File>> {
        run_op(ctx, |ctx| async move {
            let normalized = path::normalize(name);
            self.make_path_all_inner(&path::dir(&normalized)).await?;
            self.open_file(&ctx, name, OpenMode::Write).await
        })
        .await
    }

    async fn read_file(&self, ctx: &OpContext, name: &str) -> Result<Vec<u8>> {
        run_op(ctx, |_| async move {
            let name = path::normalize(name);
            let object = self.get_object(&name).await?;
            let data = object
                .body
                .collect()
                .await
                .map_err(|e| FsError::object_store(None, e.to_string()))?;
            Ok(data.into_bytes().to_vec())
        })
        .await
    }

    async fn write_file(&self, ctx: &OpContext, name: &str, data: &[u8]) -> Result<()> {
        run_op(ctx, |_| async move {
            let name = path::normalize(name);
            self.make_path_all_inner(&path::dir(&name)).await?;
            self.put_object(&name, data, detect_content_type(data)).await
        })
        .await
    }

    async fn write_files(&self, ctx: &OpContext, files: Vec<FileNameData>) -> Result<()> {
        run_op(ctx, |ctx| async move {
            let mut prepared = Vec::with_capacity(files.len());
            for f in files {
                ctx.ensure_live()?;
                let name = path::normalize(&f.name);
                self.make_path_all_inner(&path::dir(&name)).await?;
                prepared.push((name, f.data));
            }
            let semaphore = Arc::new(Semaphore::new(BULK_UPLOAD_CONCURRENCY));
            let uploads = prepared.into_iter().map(|(name, data)| {
                let semaphore = semaphore.clone();
                async move {
                    let _permit = semaphore.acquire().await.expect("semaphore closed");
                    self.put_object(&name, &data, detect_content_type(&data))
                        .await
                }
            });
            futures::future::try_join_all(uploads).await?;
            Ok(())
        })
        .await
    }

    async fn reader(
        &self,
        ctx: &OpContext,
        name: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        run_op(ctx, |_| async move {
            let name = path::normalize(name);
            let object = self.get_object(&name).await?;
            Ok(Box::new(object.body.into_async_read()) as Box<dyn AsyncRead + Send + Unpin>)
        })
        .await
    }

    async fn exists(&self, ctx: &OpContext, name: &str) -> Result<bool> {
        run_op(ctx, |ctx| async move { self.exists_inner(&ctx, name).await }).await
    }

    async fn make_path_all(&self, ctx: &OpContext, name: &str) -> Result<()> {
        run_op(ctx, |_| async move { self.make_path_all_inner(name).await }).await
    }

    async fn remove(&self, ctx: &OpContext, name: &str) -> Result<()> {
        run_op(ctx, |ctx| async move { self.remove_inner(&ctx, name).await }).await
    }

    async fn remove_files(&self, ctx: &OpContext, names: &[String]) -> Result<Vec<String>> {
        run_op(ctx, |ctx| async move {
            self.remove_files_inner(&ctx, names).await
        })
        .await
    }

    async fn remove_all(&self, ctx: &OpContext, name: &str) -> Result<()> {
        run_op(ctx, |ctx| async move { self.remove_all_inner(&ctx, name).await }).await
    }

    fn is_not_exist(&self, err: &FsError) -> bool {
        matches!(
            err,
            FsError::ObjectStore { code: Some(code), .. }
                if code == "NoSuchKey" || code == "NoSuchBucket" || code == "NotFound"
        )
    }

    async fn is_empty_path(&self, ctx: &OpContext, name: &str) -> Result<bool> {
        run_op(ctx, |ctx| async move {
            self.is_empty_path_inner(&ctx, name).await
        })
        .await
    }

    async fn prepare_path(&self, ctx: &OpContext, name: &str) -> Result<String> {
        run_op(ctx, |ctx| async move {
            let name = path::normalize(name);
            if let Ok(false) = self.exists_inner(&ctx, &name).await {
                self.make_path_all_inner(&name).await?;
            }
            Ok(name)
        })
        .await
    }

    async fn rename(&self, ctx: &OpContext, from: &str, to: &str) -> Result<()> {
        run_op(ctx, |ctx| async move {
            self.rename_inner(&ctx, from, to).await
        })
        .await
    }

    async fn stat(&self, ctx: &OpContext, name: &str) -> Result<FileInfo> {
        run_op(ctx, |ctx| async move { self.stat_inner(&ctx, name).await }).await
    }

    async fn read_dir(&self, ctx: &OpContext, name: &str) -> Result<Vec<FileInfo>> {
        run_op(ctx, |ctx| async move { self.read_dir_inner(&ctx, name).await }).await
    }

    async fn walk_dir(
        &self,
        ctx: &OpContext,
        root: &str,
        walk_fn: &mut WalkDirFunc<'_>,
    ) -> Result<()> {
        let res = run_op(ctx, |ctx| async move {
            let name = path::normalize(root);
            let info = self.stat_inner(&ctx, &name).await?;
            self.walk_dir_inner(&ctx, name, DirEntry::new(info), walk_fn)
                .await
        })
        .await;
        match res {
            Err(e) if e.is_skip_dir() => Ok(()),
            res => res,
        }
    }

    fn join(&self, parts: &[&str]) -> String {
        path::join(parts)
    }

    fn dir(&self, name: &str) -> String {
        path::dir(name)
    }

    fn ext(&self, name: &str) -> String {
        path::ext(name)
    }

    fn base(&self, name: &str) -> String {
        path::base(name)
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    fn test_cfg() -> S3Config {
        let mut cfg = S3Config {
            endpoint: "localhost:9000".to_string(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            bucket_name: "test-bucket".to_string(),
            opened_files_ttl: Duration::from_secs(1),
            ..S3Config::default()
        };
        cfg.apply_defaults();
        cfg
    }

    #[test]
    fn temp_file_name_flattens_slashes() {
        let s3 = S3Fs::assemble(test_cfg());
        let name = s3.temp_file_name("/a/b/c_d/1.txt");
        assert!(name.ends_with("tmp/__a__b__c_d__1.txt"), "{name}");
    }

    #[test]
    fn content_type_detection() {
        assert_eq!(detect_content_type(b"plain text body"), "text/plain");
        assert_eq!(
            detect_content_type(&[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a]),
            "image/png"
        );
        assert_eq!(
            detect_content_type(&[0x00, 0x9f, 0x92, 0x96]),
            "application/octet-stream"
        );
    }

    #[test]
    fn not_exist_classification() {
        let s3 = S3Fs::assemble(test_cfg());
        for code in ["NoSuchKey", "NoSuchBucket", "NotFound"] {
            let err = FsError::object_store(Some(code.to_string()), "x");
            assert!(s3.is_not_exist(&err), "{code}");
        }
        assert!(!s3.is_not_exist(&FsError::object_store(Some("AccessDenied".into()), "x")));
        assert!(!s3.is_not_exist(&FsError::DirectoryNotEmpty));
    }

    #[test]
    fn parent_dir_paths() {
        assert_eq!(parent_dir_path("/a/b/1.txt"), "/a/b/");
        assert_eq!(parent_dir_path("/a"), "/");
        assert_eq!(parent_dir_path("/a/b"), "/a/");
    }

    #[tokio::test]
    #[serial]
    async fn add_and_lock_blocks_second_opener_until_unlock() {
        let s3 = S3Fs::assemble(test_cfg());
        let file = S3OpenedFile::new(
            s3.clone(),
            OpContext::new(),
            "stage-path".to_string(),
            "/obj".to_string(),
        );
        let entry = S3OpenedFilesListEntry::new(SystemTime::now(), file);

        s3.opened_files().add_and_lock("stage-path", entry.clone()).await;
        assert_eq!(s3.opened_files().len(), 1);
        assert!(s3.opened_files().exists("stage-path"));

        let acquired = Arc::new(AtomicBool::new(false));
        let flag = acquired.clone();
        let s3_clone = s3.clone();
        let waiter = tokio::spawn(async move {
            s3_clone
                .opened_files()
                .add_and_lock("stage-path", entry)
                .await;
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(
            !acquired.load(Ordering::SeqCst),
            "second opener must park on the entry lock"
        );

        assert!(s3.opened_files().delete_and_unlock("stage-path"));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should acquire after unlock")
            .unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert_eq!(s3.opened_files().len(), 1);

        assert!(s3.opened_files().delete_and_unlock("stage-path"));
        assert!(!s3.opened_files().delete_and_unlock("stage-path"));
    }

    #[tokio::test]
    #[serial]
    async fn try_open_fails_fast_when_staging_path_is_held() {
        let s3 = S3Fs::assemble(test_cfg());
        let local_name = s3.temp_file_name("/a/1.txt");
        let file = S3OpenedFile::new(
            s3.clone(),
            OpContext::new(),
            local_name.clone(),
            "/a/1.txt".to_string(),
        );
        let entry = S3OpenedFilesListEntry::new(SystemTime::now(), file);
        s3.opened_files().add_and_lock(&local_name, entry).await;

        let err = match s3.try_open(&OpContext::new(), "/a/1.txt").await {
            Ok(_) => panic!("expected try_open to fail"),
            Err(e) => e,
        };
        assert!(matches!(err, FsError::FileAlreadyOpened));

        let err = match s3.try_open(&OpContext::new(), "/a/").await {
            Ok(_) => panic!("expected try_open to fail"),
            Err(e) => e,
        };
        assert!(matches!(err, FsError::CantOpenS3Directory));

        s3.opened_files().delete_and_unlock(&local_name);
    }
}
