//! Local filesystem backend: direct delegation to the host OS through
//! `tokio::fs`. Also serves as the staging store for the S3 adapter.

use std::io::{self, SeekFrom};
use std::path::Path;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::{FsError, Result};
use crate::fs::callbacks::{run_op, OpContext};
use crate::fs::{DirEntry, File, FileInfo, FileNameData, FileSystem, WalkDirFunc};

/// Local filesystem implementation of [`FileSystem`].
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalFs;

impl LocalFs {
    pub fn new() -> Self {
        LocalFs
    }

    async fn stat_path(name: &str) -> Result<FileInfo> {
        let meta = fs::metadata(name).await?;
        Ok(file_info_from_metadata(name, &meta))
    }

    async fn read_dir_inner(&self, name: &str) -> Result<Vec<FileInfo>> {
        let root = Self::stat_path(name).await?;
        if !root.is_dir() {
            return Err(FsError::NotADirectory);
        }
        let mut out = Vec::new();
        let mut rd = fs::read_dir(name).await?;
        while let Some(entry) = rd.next_entry().await? {
            let full = self.join(&[name, &entry.file_name().to_string_lossy()]);
            let meta = entry.metadata().await?;
            out.push(file_info_from_metadata(&full, &meta));
        }
        Ok(out)
    }

    fn walk_inner<'a>(
        &'a self,
        name: String,
        entry: DirEntry,
        walk_fn: &'a mut WalkDirFunc<'a>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if let Err(e) = walk_fn(&name, &entry, None) {
                if e.is_skip_dir() && entry.is_dir() {
                    return Ok(());
                }
                return Err(e);
            }
            if !entry.is_dir() {
                return Ok(());
            }

            let children = match self.list_for_walk(&name).await {
                Ok(children) => children,
                Err(e) => {
                    walk_fn(&name, &entry, Some(e))?;
                    Vec::new()
                }
            };
            for info in children {
                let child_name = info.full_name().to_string();
                match self
                    .walk_inner(child_name, DirEntry::new(info), walk_fn)
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

    /// Like `read_dir_inner`, but entries that vanish or become
    /// unreadable mid-walk are skipped instead of failing the walk.
    async fn list_for_walk(&self, name: &str) -> Result<Vec<FileInfo>> {
        let mut out = Vec::new();
        let mut rd = fs::read_dir(name).await?;
        loop {
            let entry = match rd.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) if walk_skippable(&e) => continue,
                Err(e) => return Err(e.into()),
            };
            let full = self.join(&[name, &entry.file_name().to_string_lossy()]);
            match entry.metadata().await {
                Ok(meta) => out.push(file_info_from_metadata(&full, &meta)),
                Err(e) if walk_skippable(&e) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(out)
    }
}

fn walk_skippable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
    )
}

fn file_info_from_metadata(full_name: &str, meta: &std::fs::Metadata) -> FileInfo {
    FileInfo::new(
        full_name,
        meta.len(),
        meta.modified().ok(),
        meta.is_dir(),
    )
}

async fn ensure_parent_dir(name: &str) -> Result<()> {
    if let Some(parent) = Path::new(name).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    Ok(())
}

#[async_trait]
impl FileSystem for LocalFs {
    async fn create(&self, ctx: &OpContext, name: &str) -> Result<Box<dyn File>> {
        run_op(ctx, |_| async move {
            ensure_parent_dir(name).await?;
            let file = fs::File::create(name).await?;
            Ok(Box::new(LocalFile::new(file, name)) as Box<dyn File>)
        })
        .await
    }

    async fn open(&self, ctx: &OpContext, name: &str) -> Result<Box<dyn File>> {
        run_op(ctx, |_| async move {
            let file = fs::File::open(name).await?;
            Ok(Box::new(LocalFile::new(file, name)) as Box<dyn File>)
        })
        .await
    }

    async fn open_w(&self, ctx: &OpContext, name: &str) -> Result<Box<dyn File>> {
        run_op(ctx, |_| async move {
            ensure_parent_dir(name).await?;
            let file = fs::OpenOptions::new().write(true).open(name).await?;
            Ok(Box::new(LocalFile::new(file, name)) as Box<dyn File>)
        })
        .await
    }

    async fn read_file(&self, ctx: &OpContext, name: &str) -> Result<Vec<u8>> {
        run_op(ctx, |_| async move { Ok(fs::read(name).await?) }).await
    }

    async fn write_file(&self, ctx: &OpContext, name: &str, data: &[u8]) -> Result<()> {
        run_op(ctx, |_| async move {
            ensure_parent_dir(name).await?;
            Ok(fs::write(name, data).await?)
        })
        .await
    }

    async fn write_files(&self, ctx: &OpContext, files: Vec<FileNameData>) -> Result<()> {
        run_op(ctx, |_| async move {
            for f in &files {
                ensure_parent_dir(&f.name).await?;
                fs::write(&f.name, &f.data).await?;
            }
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
            let file = fs::File::open(name).await?;
            Ok(Box::new(file) as Box<dyn AsyncRead + Send + Unpin>)
        })
        .await
    }

    async fn exists(&self, ctx: &OpContext, name: &str) -> Result<bool> {
        run_op(ctx, |_| async move {
            match fs::metadata(name).await {
                Ok(_) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    async fn make_path_all(&self, ctx: &OpContext, name: &str) -> Result<()> {
        run_op(ctx, |_| async move { Ok(fs::create_dir_all(name).await?) }).await
    }

    async fn remove(&self, ctx: &OpContext, name: &str) -> Result<()> {
        run_op(ctx, |_| async move {
            // Removes files and empty directories.
            match fs::remove_file(name).await {
                Ok(()) => Ok(()),
                Err(first) => match fs::remove_dir(name).await {
                    Ok(()) => Ok(()),
                    Err(_) => Err(first.into()),
                },
            }
        })
        .await
    }

    async fn remove_files(&self, ctx: &OpContext, names: &[String]) -> Result<Vec<String>> {
        run_op(ctx, |_| async move {
            let mut failed = Vec::new();
            for name in names {
                if fs::remove_file(name).await.is_err() {
                    failed.push(name.clone());
                }
            }
            Ok(failed)
        })
        .await
    }

    async fn remove_all(&self, ctx: &OpContext, name: &str) -> Result<()> {
        run_op(ctx, |_| async move {
            match fs::metadata(name).await {
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
                Ok(meta) if meta.is_dir() => Ok(fs::remove_dir_all(name).await?),
                Ok(_) => Ok(fs::remove_file(name).await?),
            }
        })
        .await
    }

    fn is_not_exist(&self, err: &FsError) -> bool {
        matches!(err, FsError::Io(e) if e.kind() == io::ErrorKind::NotFound)
    }

    async fn is_empty_path(&self, ctx: &OpContext, name: &str) -> Result<bool> {
        run_op(ctx, |_| async move {
            let mut rd = fs::read_dir(name).await?;
            Ok(rd.next_entry().await?.is_none())
        })
        .await
    }

    async fn prepare_path(&self, ctx: &OpContext, name: &str) -> Result<String> {
        run_op(ctx, |_| async move {
            let absolute = std::path::absolute(name)?;
            let absolute = absolute.to_string_lossy().into_owned();
            match fs::metadata(&absolute).await {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    fs::create_dir_all(&absolute).await?;
                }
                Err(e) => return Err(e.into()),
            }
            Ok(absolute)
        })
        .await
    }

    async fn rename(&self, ctx: &OpContext, from: &str, to: &str) -> Result<()> {
        run_op(ctx, |_| async move {
            if Path::new(from).components().eq(Path::new(to).components()) {
                return Ok(());
            }
            Ok(fs::rename(from, to).await?)
        })
        .await
    }

    async fn stat(&self, ctx: &OpContext, name: &str) -> Result<FileInfo> {
        run_op(ctx, |_| async move { Self::stat_path(name).await }).await
    }

    async fn read_dir(&self, ctx: &OpContext, name: &str) -> Result<Vec<FileInfo>> {
        run_op(ctx, |_| async move { self.read_dir_inner(name).await }).await
    }

    async fn walk_dir(
        &self,
        ctx: &OpContext,
        root: &str,
        walk_fn: &mut WalkDirFunc<'_>,
    ) -> Result<()> {
        let res = run_op(ctx, |_| async {
            let root_info = Self::stat_path(root).await?;
            self.walk_inner(root.to_string(), DirEntry::new(root_info), walk_fn)
                .await
        })
        .await;
        match res {
            Err(e) if e.is_skip_dir() => Ok(()),
            res => res,
        }
    }

    fn join(&self, parts: &[&str]) -> String {
        let mut buf = std::path::PathBuf::new();
        for p in parts {
            if !p.is_empty() {
                buf.push(p);
            }
        }
        buf.to_string_lossy().into_owned()
    }

    fn dir(&self, name: &str) -> String {
        Path::new(name)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| ".".to_string())
    }

    fn ext(&self, name: &str) -> String {
        Path::new(name)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default()
    }

    fn base(&self, name: &str) -> String {
        Path::new(name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string())
    }
}

/// Handle over a local file.
pub struct LocalFile {
    file: Option<fs::File>,
    path: String,
    local: LocalFs,
}

impl LocalFile {
    fn new(file: fs::File, path: &str) -> Self {
        Self {
            file: Some(file),
            path: path.to_string(),
            local: LocalFs,
        }
    }

    /// The associated filesystem.
    pub fn fs(&self) -> &LocalFs {
        &self.local
    }

    fn file_mut(&mut self) -> Result<&mut fs::File> {
        self.file.as_mut().ok_or(FsError::FileAlreadyClosed)
    }
}

#[async_trait]
impl File for LocalFile {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file_mut()?.read(buf).await?)
    }

    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let file = self.file_mut()?;
        let pos = file.stream_position().await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let n = file.read(buf).await;
        file.seek(SeekFrom::Start(pos)).await?;
        Ok(n?)
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        Ok(self.file_mut()?.write(data).await?)
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        Ok(self.file_mut()?.seek(pos).await?)
    }

    async fn truncate(&mut self, size: u64) -> Result<()> {
        Ok(self.file_mut()?.set_len(size).await?)
    }

    async fn sync(&mut self) -> Result<()> {
        Ok(self.file_mut()?.sync_all().await?)
    }

    async fn stat(&self) -> Result<FileInfo> {
        let file = self.file.as_ref().ok_or(FsError::FileAlreadyClosed)?;
        let meta = file.metadata().await?;
        Ok(file_info_from_metadata(&self.path, &meta))
    }

    async fn close(&mut self) -> Result<()> {
        let mut file = self.file.take().ok_or(FsError::FileAlreadyClosed)?;
        file.flush().await?;
        Ok(())
    }

    fn name(&self) -> String {
        self.path.clone()
    }

    fn local_name(&self) -> String {
        self.path.clone()
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    fn ctx() -> OpContext {
        OpContext::new()
    }

    #[tokio::test]
    #[serial]
    async fn write_read_exists_remove_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let l = LocalFs::new();
        let name = l.join(&[&tmp.path().to_string_lossy(), "a", "b", "1.txt"]);

        l.write_file(&ctx(), &name, b"content 1").await.unwrap();
        assert!(l.exists(&ctx(), &name).await.unwrap());
        assert_eq!(l.read_file(&ctx(), &name).await.unwrap(), b"content 1");

        l.remove(&ctx(), &name).await.unwrap();
        assert!(!l.exists(&ctx(), &name).await.unwrap());

        let err = l.remove(&ctx(), &name).await.unwrap_err();
        assert!(l.is_not_exist(&err));
    }

    #[tokio::test]
    #[serial]
    async fn create_makes_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let l = LocalFs::new();
        let name = l.join(&[&tmp.path().to_string_lossy(), "x", "y", "new.txt"]);

        let mut f = l.create(&ctx(), &name).await.unwrap();
        assert_eq!(f.write(b"abc").await.unwrap(), 3);
        f.close().await.unwrap();
        assert!(matches!(
            f.close().await,
            Err(FsError::FileAlreadyClosed)
        ));

        assert_eq!(l.read_file(&ctx(), &name).await.unwrap(), b"abc");
    }

    #[tokio::test]
    #[serial]
    async fn handle_seek_read_at_truncate() {
        let tmp = tempfile::tempdir().unwrap();
        let l = LocalFs::new();
        let name = l.join(&[&tmp.path().to_string_lossy(), "f.bin"]);
        l.write_file(&ctx(), &name, b"0123456789").await.unwrap();

        let mut f = l.open(&ctx(), &name).await.unwrap();
        let end = f.seek(SeekFrom::End(0)).await.unwrap();
        assert_eq!(end, 10);
        f.seek(SeekFrom::Start(2)).await.unwrap();

        let mut buf = [0u8; 3];
        let n = f.read_at(&mut buf, 5).await.unwrap();
        assert_eq!(&buf[..n], b"567");
        // read_at must not move the cursor
        let mut buf2 = [0u8; 2];
        f.read(&mut buf2).await.unwrap();
        assert_eq!(&buf2, b"23");
        f.close().await.unwrap();

        let mut w = l.open_w(&ctx(), &name).await.unwrap();
        w.truncate(4).await.unwrap();
        w.close().await.unwrap();
        assert_eq!(l.read_file(&ctx(), &name).await.unwrap(), b"0123");
    }

    #[tokio::test]
    #[serial]
    async fn read_dir_rejects_files() {
        let tmp = tempfile::tempdir().unwrap();
        let l = LocalFs::new();
        let name = l.join(&[&tmp.path().to_string_lossy(), "file.txt"]);
        l.write_file(&ctx(), &name, b"x").await.unwrap();

        let err = l.read_dir(&ctx(), &name).await.unwrap_err();
        assert!(matches!(err, FsError::NotADirectory));

        let infos = l
            .read_dir(&ctx(), &tmp.path().to_string_lossy())
            .await
            .unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name(), "file.txt");
    }

    #[tokio::test]
    #[serial]
    async fn rename_same_path_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let l = LocalFs::new();
        let name = l.join(&[&tmp.path().to_string_lossy(), "a.txt"]);
        l.write_file(&ctx(), &name, b"x").await.unwrap();

        l.rename(&ctx(), &name, &name).await.unwrap();
        assert!(l.exists(&ctx(), &name).await.unwrap());

        let other = l.join(&[&tmp.path().to_string_lossy(), "b.txt"]);
        l.rename(&ctx(), &name, &other).await.unwrap();
        assert!(!l.exists(&ctx(), &name).await.unwrap());
        assert!(l.exists(&ctx(), &other).await.unwrap());
    }

    #[tokio::test]
    #[serial]
    async fn is_empty_path_and_remove_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let l = LocalFs::new();
        let dir = l.join(&[&tmp.path().to_string_lossy(), "sub"]);
        l.make_path_all(&ctx(), &dir).await.unwrap();
        assert!(l.is_empty_path(&ctx(), &dir).await.unwrap());

        let file = l.join(&[&dir, "f.txt"]);
        l.write_file(&ctx(), &file, b"x").await.unwrap();
        assert!(!l.is_empty_path(&ctx(), &dir).await.unwrap());

        // remove refuses a non-empty directory, works once emptied
        assert!(l.remove(&ctx(), &dir).await.is_err());
        l.remove(&ctx(), &file).await.unwrap();
        l.remove(&ctx(), &dir).await.unwrap();
        assert!(!l.exists(&ctx(), &dir).await.unwrap());
    }

    #[tokio::test]
    #[serial]
    async fn walk_dir_visits_everything_and_honors_skip_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let l = LocalFs::new();
        let root = tmp.path().to_string_lossy().into_owned();
        l.write_file(&ctx(), &l.join(&[&root, "a", "1.txt"]), b"1")
            .await
            .unwrap();
        l.write_file(&ctx(), &l.join(&[&root, "a", "b", "2.txt"]), b"2")
            .await
            .unwrap();
        l.write_file(&ctx(), &l.join(&[&root, "c", "3.txt"]), b"3")
            .await
            .unwrap();

        let mut seen = Vec::new();
        l.walk_dir(&ctx(), &root, &mut |name, _, _| {
            seen.push(name.to_string());
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(seen.len(), 7); // root, a, 1.txt, b, 2.txt, c, 3.txt

        // skipping "a" prunes its subtree
        let mut seen = Vec::new();
        let skip = l.join(&[&root, "a"]);
        l.walk_dir(&ctx(), &root, &mut |name, entry, _| {
            seen.push(name.to_string());
            if entry.is_dir() && name == skip {
                return Err(FsError::SkipDir);
            }
            Ok(())
        })
        .await
        .unwrap();
        assert!(seen.iter().any(|n| n.ends_with("3.txt")));
        assert!(!seen.iter().any(|n| n.ends_with("1.txt")));
        assert!(!seen.iter().any(|n| n.ends_with("2.txt")));
    }

    #[tokio::test]
    #[serial]
    async fn remove_files_collects_failures() {
        let tmp = tempfile::tempdir().unwrap();
        let l = LocalFs::new();
        let a = l.join(&[&tmp.path().to_string_lossy(), "a.txt"]);
        let missing = l.join(&[&tmp.path().to_string_lossy(), "missing.txt"]);
        l.write_file(&ctx(), &a, b"x").await.unwrap();

        let failed = l
            .remove_files(&ctx(), &[a.clone(), missing.clone()])
            .await
            .unwrap();
        assert_eq!(failed, vec![missing]);
        assert!(!l.exists(&ctx(), &a).await.unwrap());
    }
}
