//! Recursive removal of empty directory subtrees.
//!
//! Works against any [`FileSystem`] through the common contract. Two
//! strategies produce identical results: building the directory tree
//! breadth-first and deleting in post-order, or deleting inline during a
//! depth-first descent. A directory is removable when
//! [`FileSystem::is_empty_path`] holds for it; non-directories are
//! skipped. The operation is idempotent.

use std::collections::VecDeque;

use futures::future::BoxFuture;
use log::info;

use crate::error::Result;
use crate::fs::callbacks::OpContext;
use crate::fs::FileSystem;

/// Cleaning strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Algo {
    /// Build the tree breadth-first, then delete in post-order.
    Bfs,
    /// Delete inline while unwinding a depth-first descent.
    #[default]
    Dfs,
}

// Assumed maximum directory depth; sizes the BFS queue and DFS stack.
const MAX_DEPTH: usize = 500;

struct Node {
    path: String,
    children: Vec<usize>,
    is_dir: bool,
}

struct EmptySubtreeCleaner<'a> {
    fs: &'a dyn FileSystem,
    count: usize,
}

/// Whether the given name is a directory on the filesystem.
pub async fn is_dir(ctx: &OpContext, fs: &dyn FileSystem, name: &str) -> Result<bool> {
    Ok(fs.stat(ctx, name).await?.is_dir())
}

impl<'a> EmptySubtreeCleaner<'a> {
    fn new(fs: &'a dyn FileSystem) -> Self {
        Self { fs, count: 0 }
    }

    /// Builds the directory tree below `base_path` breadth-first,
    /// returning an arena of nodes rooted at index 0.
    async fn bfs(&self, ctx: &OpContext, base_path: &str) -> Result<Vec<Node>> {
        // Existence probe; a missing base path fails here.
        self.fs.read_dir(ctx, base_path).await?;

        let mut arena = vec![Node {
            path: base_path.to_string(),
            children: Vec::new(),
            is_dir: true,
        }];
        let mut queue = VecDeque::with_capacity(MAX_DEPTH);
        queue.push_back(0usize);

        while let Some(idx) = queue.pop_front() {
            let dir_path = arena[idx].path.clone();
            let contents = self.fs.read_dir(ctx, &dir_path).await?;
            for content in contents {
                // The entry's full name keeps backend path conventions
                // intact (S3 directory entries carry a trailing slash).
                let child = Node {
                    path: content.full_name().to_string(),
                    children: Vec::new(),
                    is_dir: content.is_dir(),
                };
                let child_idx = arena.len();
                arena.push(child);
                arena[idx].children.push(child_idx);
                if content.is_dir() {
                    queue.push_back(child_idx);
                }
            }
        }
        Ok(arena)
    }

    /// Post-order deletion over the BFS arena: children first, then the
    /// node itself when it is an empty directory.
    async fn recursive_empty_delete(&mut self, ctx: &OpContext, arena: &[Node]) -> Result<()> {
        let mut order = Vec::with_capacity(arena.len());
        let mut stack = vec![(0usize, false)];
        while let Some((idx, visited)) = stack.pop() {
            if visited {
                order.push(idx);
                continue;
            }
            stack.push((idx, true));
            for &child in &arena[idx].children {
                stack.push((child, false));
            }
        }

        for idx in order {
            let node = &arena[idx];
            if !node.is_dir {
                continue;
            }
            if !self.fs.is_empty_path(ctx, &node.path).await? {
                continue;
            }
            self.count += 1;
            self.fs.remove(ctx, &node.path).await?;
        }
        Ok(())
    }

    /// Depth-first descent; each directory is tested and removed while
    /// unwinding, so children go before their parents.
    fn dfs<'b>(&'b mut self, ctx: &'b OpContext, p: String) -> BoxFuture<'b, Result<()>> {
        Box::pin(async move {
            let contents = self.fs.read_dir(ctx, &p).await?;
            for item in contents {
                if !item.is_dir() {
                    continue;
                }
                self.dfs(ctx, item.full_name().to_string()).await?;
            }
            if self.fs.is_empty_path(ctx, &p).await? {
                self.count += 1;
                self.fs.remove(ctx, &p).await?;
            }
            Ok(())
        })
    }
}

/// Removes every subtree below `base_path` that consists only of empty
/// directories, recursively; `base_path` itself is removed too when it
/// ends up empty. Returns the number of removed directories.
pub async fn remove_empty_dirs(
    ctx: &OpContext,
    fs: &dyn FileSystem,
    base_path: &str,
    algo: Algo,
) -> Result<usize> {
    let mut esc = EmptySubtreeCleaner::new(fs);
    match algo {
        Algo::Bfs => {
            info!("cleaner: building directory tree (BFS)...");
            let arena = esc.bfs(ctx, base_path).await?;
            info!("cleaner: removing directories...");
            esc.recursive_empty_delete(ctx, &arena).await?;
        }
        Algo::Dfs => {
            info!("cleaner: removing directories (DFS)...");
            esc.dfs(ctx, base_path.to_string()).await?;
        }
    }
    Ok(esc.count)
}
