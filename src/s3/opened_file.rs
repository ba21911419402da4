//! Handle over an object staged to a local file.
//!
//! The handle wraps a staging file opened through the local backend;
//! writes and truncations mark it dirty, and `close` writes dirty
//! contents back to the object store, removes the staging file, and
//! releases the registry entry. Clones share the underlying file and the
//! dirty flag, so the TTL cleaner and the caller observe a single state.

use std::io::SeekFrom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{FsError, Result};
use crate::fs::callbacks::OpContext;
use crate::fs::{File, FileInfo, FileSystem};

use super::S3Fs;

type Underlying = Arc<AsyncMutex<Option<Box<dyn File>>>>;

/// An opened S3 object backed by a local staging file.
#[derive(Clone)]
pub struct S3OpenedFile {
    s3: S3Fs,
    ctx: OpContext,
    // Set only after registry admission, hence the mutex.
    underlying: Underlying,
    local_name: String,
    object_name: String,
    changed: Arc<AtomicBool>,
}

impl S3OpenedFile {
    pub(crate) fn new(s3: S3Fs, ctx: OpContext, local_name: String, object_name: String) -> Self {
        Self {
            s3,
            ctx,
            underlying: Arc::new(AsyncMutex::new(None)),
            local_name,
            object_name,
            changed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The associated filesystem.
    pub fn fs(&self) -> &S3Fs {
        &self.s3
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    pub(crate) async fn set_underlying(&self, file: Box<dyn File>) {
        *self.underlying.lock().await = Some(file);
    }

    pub(crate) async fn close_impl(&self) -> Result<()> {
        let taken = self.underlying.lock().await.take();
        let Some(mut file) = taken else {
            // Already closed (possibly by the TTL cleaner); this handle
            // no longer owns a registry entry.
            return Err(FsError::FileAlreadyClosed);
        };

        let result = async {
            if let Err(e) = file.close().await {
                error!(
                    "failed to close staging file {:?}: {e}",
                    self.local_name
                );
                return Err(e);
            }

            let local = self.s3.local();
            let b = local.read_file(&self.ctx, &self.local_name).await?;

            if self.changed.load(Ordering::SeqCst) {
                self.s3
                    .write_file(&self.ctx, &self.object_name, &b)
                    .await?;
                self.changed.store(false, Ordering::SeqCst);
            }

            match local.exists(&self.ctx, &self.local_name).await {
                Ok(true) => {
                    if let Err(e) = local.remove(&self.ctx, &self.local_name).await {
                        error!(
                            "failed to remove staging file {:?}: {e}",
                            self.local_name
                        );
                        return Err(e);
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    error!(
                        "failed to check staging file {:?}: {e}",
                        self.local_name
                    );
                    return Err(e);
                }
            }
            Ok(())
        }
        .await;

        // Release the registry entry on every exit path of a first close.
        self.s3.opened_files().delete_and_unlock(&self.local_name);
        result
    }

    pub(crate) fn log_autoclose(&self) {
        info!(
            "opened files cleaning: autoclosing file {:?}",
            self.local_name
        );
    }
}

#[async_trait]
impl File for S3OpenedFile {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut g = self.underlying.lock().await;
        g.as_mut().ok_or(FsError::FileAlreadyClosed)?.read(buf).await
    }

    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut g = self.underlying.lock().await;
        g.as_mut()
            .ok_or(FsError::FileAlreadyClosed)?
            .read_at(buf, offset)
            .await
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut g = self.underlying.lock().await;
        let file = g.as_mut().ok_or(FsError::FileAlreadyClosed)?;
        self.changed.store(true, Ordering::SeqCst);
        file.write(data).await
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let mut g = self.underlying.lock().await;
        g.as_mut().ok_or(FsError::FileAlreadyClosed)?.seek(pos).await
    }

    async fn truncate(&mut self, size: u64) -> Result<()> {
        let mut g = self.underlying.lock().await;
        let file = g.as_mut().ok_or(FsError::FileAlreadyClosed)?;
        self.changed.store(true, Ordering::SeqCst);
        file.truncate(size).await
    }

    async fn sync(&mut self) -> Result<()> {
        let buf = {
            let mut g = self.underlying.lock().await;
            let file = g.as_mut().ok_or(FsError::FileAlreadyClosed)?;
            file.sync().await?;
            let pos = file.seek(SeekFrom::Current(0)).await?;
            file.seek(SeekFrom::Start(0)).await?;
            let mut buf = Vec::new();
            let mut chunk = [0u8; 8192];
            loop {
                let n = file.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            file.seek(SeekFrom::Start(pos)).await?;
            buf
        };
        self.s3
            .write_file(&self.ctx, &self.object_name, &buf)
            .await?;
        self.changed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn stat(&self) -> Result<FileInfo> {
        let g = self.underlying.lock().await;
        match g.as_ref() {
            Some(file) => file.stat().await,
            None => Err(FsError::FileAlreadyClosed),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.close_impl().await
    }

    fn name(&self) -> String {
        self.object_name.clone()
    }

    fn local_name(&self) -> String {
        self.local_name.clone()
    }
}
