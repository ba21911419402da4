//! Operation context and process-wide operation callbacks.
//!
//! Every public filesystem operation runs between two optional hooks: the
//! *before* callback may enrich the [`OpContext`] (or abort the
//! operation), and the *after* callback observes the final context on
//! every exit path. Both are process-wide, registered through explicit
//! setters and guarded by a single mutex.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::error::{FsError, Result};

/// Context carried through a filesystem operation.
///
/// Carries caller-supplied string values (the before callback may add
/// more) and a cancellation token honored by long-running listing loops.
#[derive(Clone, Debug, Default)]
pub struct OpContext {
    values: HashMap<String, String>,
    cancel: CancellationToken,
}

impl OpContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn set_value(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fails with an interrupted I/O error once the context is cancelled.
    pub(crate) fn ensure_live(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(FsError::Io(io::Error::new(
                io::ErrorKind::Interrupted,
                "operation cancelled",
            )));
        }
        Ok(())
    }
}

/// Callback invoked around filesystem operations. The returned context
/// replaces the current one.
pub type OperationCb = Arc<dyn Fn(OpContext) -> Result<OpContext> + Send + Sync>;

struct Callbacks {
    before: Option<OperationCb>,
    after: Option<OperationCb>,
}

static CALLBACKS: Mutex<Callbacks> = Mutex::new(Callbacks {
    before: None,
    after: None,
});

/// Returns the callback invoked before each operation.
pub fn before_operation_cb() -> Option<OperationCb> {
    CALLBACKS.lock().unwrap().before.clone()
}

/// Sets (or clears, with `None`) the callback invoked before each
/// operation.
pub fn set_before_operation_cb(cb: Option<OperationCb>) {
    CALLBACKS.lock().unwrap().before = cb;
}

/// Returns the callback invoked after each operation.
pub fn after_operation_cb() -> Option<OperationCb> {
    CALLBACKS.lock().unwrap().after.clone()
}

/// Sets (or clears, with `None`) the callback invoked after each
/// operation.
pub fn set_after_operation_cb(cb: Option<OperationCb>) {
    CALLBACKS.lock().unwrap().after = cb;
}

fn invoke_before_operation_cb(ctx: OpContext) -> Result<OpContext> {
    match before_operation_cb() {
        Some(cb) => cb(ctx),
        None => Ok(ctx),
    }
}

fn invoke_after_operation_cb(ctx: OpContext) -> Result<()> {
    match after_operation_cb() {
        Some(cb) => cb(ctx).map(|_| ()),
        None => Ok(()),
    }
}

/// Runs `f` between the before and after callbacks.
///
/// The before callback's context is what `f` and the after callback see.
/// The after callback runs on every exit path; its error surfaces only
/// when the primary operation succeeded.
pub(crate) async fn run_op<T, F, Fut>(ctx: &OpContext, f: F) -> Result<T>
where
    F: FnOnce(OpContext) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let ctx = invoke_before_operation_cb(ctx.clone())?;
    let res = f(ctx.clone()).await;
    let after = invoke_after_operation_cb(ctx);
    match (res, after) {
        (Ok(_), Err(e)) => Err(e),
        (res, _) => res,
    }
}
