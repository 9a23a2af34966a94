//! Operation Handle
//!
//! Cancelable, awaitable handle to one in-flight operation. A handle settles
//! exactly once; whatever arrives afterwards is ignored.

use futures::future::BoxFuture;
use log::debug;
use parking_lot::Mutex;
use std::future::IntoFuture;
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::OperationError;

/// Terminal state of an operation
///
/// When a cancellation request races with a real completion, either outcome
/// may be observed: whichever terminal signal reaches the session first wins.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    Done(T),
    Error(OperationError),
    Canceled,
}

impl<T> Outcome<T> {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Value of a successful outcome
    pub fn done(self) -> Option<T> {
        match self {
            Self::Done(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&OperationError> {
        match self {
            Self::Error(err) => Some(err),
            _ => None,
        }
    }
}

type DoneFn<T> = Box<dyn FnOnce(&T) + Send>;
type ErrorFn = Box<dyn FnOnce(&OperationError) + Send>;
type Hook = Box<dyn FnOnce() + Send>;

struct Continuations<T> {
    on_done: Vec<DoneFn<T>>,
    on_error: Vec<ErrorFn>,
    on_cancel: Vec<Hook>,
}

impl<T> Default for Continuations<T> {
    fn default() -> Self {
        Self {
            on_done: Vec::new(),
            on_error: Vec::new(),
            on_cancel: Vec::new(),
        }
    }
}

impl<T> Continuations<T> {
    /// Fire the continuations matching `outcome`; the rest are dropped
    fn fire(self, outcome: &Outcome<T>) {
        match outcome {
            Outcome::Done(value) => self.on_done.into_iter().for_each(|f| f(value)),
            Outcome::Error(err) => self.on_error.into_iter().for_each(|f| f(err)),
            Outcome::Canceled => self.on_cancel.into_iter().for_each(|f| f()),
        }
    }
}

struct Inner<T> {
    outcome: Option<Outcome<T>>,
    cancel_requested: bool,
    cancel_hooks: Vec<Hook>,
    continuations: Continuations<T>,
}

struct Shared<T> {
    id: Uuid,
    alias: String,
    inner: Mutex<Inner<T>>,
    settled: Notify,
}

/// Handle to one operation; clones share the same state
pub struct OperationHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for OperationHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> std::fmt::Debug for OperationHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationHandle")
            .field("id", &self.shared.id)
            .field("alias", &self.shared.alias)
            .finish()
    }
}

impl<T: Clone + Send + 'static> OperationHandle<T> {
    pub(crate) fn new(id: Uuid, alias: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                alias: alias.into(),
                inner: Mutex::new(Inner {
                    outcome: None,
                    cancel_requested: false,
                    cancel_hooks: Vec::new(),
                    continuations: Continuations::default(),
                }),
                settled: Notify::new(),
            }),
        }
    }

    /// Handle already settled with an error
    pub(crate) fn rejected(id: Uuid, alias: impl Into<String>, err: OperationError) -> Self {
        let handle = Self::new(id, alias);
        handle.reject(err);
        handle
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn alias(&self) -> &str {
        &self.shared.alias
    }

    pub fn is_settled(&self) -> bool {
        self.shared.inner.lock().outcome.is_some()
    }

    /// Whether cancel() was called before settlement
    pub fn is_cancel_requested(&self) -> bool {
        self.shared.inner.lock().cancel_requested
    }

    /// Current outcome, if settled
    pub fn outcome(&self) -> Option<Outcome<T>> {
        self.shared.inner.lock().outcome.clone()
    }

    /// Request cancellation. Only the first call before settlement has an
    /// effect; the handle settles as canceled once the engine confirms.
    pub fn cancel(&self) {
        let hooks = {
            let mut inner = self.shared.inner.lock();
            if inner.outcome.is_some() || inner.cancel_requested {
                debug!(
                    "Cancel of \"{}\" ({}) ignored: already settled or requested",
                    self.shared.alias, self.shared.id
                );
                return;
            }
            inner.cancel_requested = true;
            std::mem::take(&mut inner.cancel_hooks)
        };
        for hook in hooks {
            hook();
        }
    }

    /// Run `hook` when cancellation is requested
    pub(crate) fn on_cancel_requested(&self, hook: impl FnOnce() + Send + 'static) {
        {
            let mut inner = self.shared.inner.lock();
            if inner.outcome.is_some() {
                return;
            }
            if !inner.cancel_requested {
                inner.cancel_hooks.push(Box::new(hook));
                return;
            }
        }
        hook();
    }

    /// Continuation fired once if the operation is done
    pub fn on_done(&self, f: impl FnOnce(&T) + Send + 'static) -> &Self {
        let settled = {
            let mut inner = self.shared.inner.lock();
            match &inner.outcome {
                None => {
                    inner.continuations.on_done.push(Box::new(f));
                    return self;
                }
                Some(outcome) => outcome.clone(),
            }
        };
        if let Outcome::Done(value) = &settled {
            f(value);
        }
        self
    }

    /// Continuation fired once if the operation fails
    pub fn on_error(&self, f: impl FnOnce(&OperationError) + Send + 'static) -> &Self {
        let settled = {
            let mut inner = self.shared.inner.lock();
            match &inner.outcome {
                None => {
                    inner.continuations.on_error.push(Box::new(f));
                    return self;
                }
                Some(outcome) => outcome.clone(),
            }
        };
        if let Outcome::Error(err) = &settled {
            f(err);
        }
        self
    }

    /// Continuation fired once if the operation is canceled
    pub fn on_cancel(&self, f: impl FnOnce() + Send + 'static) -> &Self {
        let canceled = {
            let mut inner = self.shared.inner.lock();
            match &inner.outcome {
                None => {
                    inner.continuations.on_cancel.push(Box::new(f));
                    return self;
                }
                Some(outcome) => outcome.is_canceled(),
            }
        };
        if canceled {
            f();
        }
        self
    }

    /// Wait for settlement
    pub async fn wait(&self) -> Outcome<T> {
        loop {
            let notified = self.shared.settled.notified();
            let current = self.shared.inner.lock().outcome.clone();
            if let Some(outcome) = current {
                return outcome;
            }
            notified.await;
        }
    }

    pub(crate) fn reject(&self, err: OperationError) -> bool {
        self.settle(Outcome::Error(err))
    }

    /// Settle with `outcome` unless already settled
    pub(crate) fn settle(&self, outcome: Outcome<T>) -> bool {
        let continuations = {
            let mut inner = self.shared.inner.lock();
            if inner.outcome.is_some() {
                debug!(
                    "Operation \"{}\" ({}) is already settled; input ignored",
                    self.shared.alias, self.shared.id
                );
                return false;
            }
            inner.outcome = Some(outcome.clone());
            inner.cancel_hooks.clear();
            std::mem::take(&mut inner.continuations)
        };
        self.shared.settled.notify_waiters();
        continuations.fire(&outcome);
        true
    }
}

impl<T: Clone + Send + 'static> IntoFuture for OperationHandle<T> {
    type Output = Outcome<T>;
    type IntoFuture = BoxFuture<'static, Outcome<T>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}
