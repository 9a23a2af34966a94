//! Operation Executor
//!
//! Turns one native call into an [`OperationHandle`]: registers the
//! operation, waits for its terminal event and validates the payload.
//! Cancellation is translated into a native abort carrying its own
//! identity.

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::handle::{OperationHandle, Outcome};
use super::registry::OperationRegistry;
use super::types::OperationOptions;
use crate::error::OperationError;
use crate::native::{NativeEngine, NativeError};
use crate::session::provider::{Completion, EventProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Native call not confirmed yet
    Submitting { abort_requested: bool },
    Accepted,
    /// Abort sent with the given identity
    Aborting(Uuid),
    Finished,
}

/// Abort bookkeeping of one operation
struct Control {
    id: Uuid,
    alias: String,
    engine: Arc<dyn NativeEngine>,
    provider: Arc<EventProvider>,
    completions: mpsc::UnboundedSender<Completion>,
    stage: Mutex<Stage>,
}

impl Control {
    fn request_abort(&self) {
        let abort_id = {
            let mut stage = self.stage.lock();
            match *stage {
                Stage::Submitting {
                    ref mut abort_requested,
                } => {
                    debug!(
                        "Abort of \"{}\" ({}) is deferred until the call is accepted",
                        self.alias, self.id
                    );
                    *abort_requested = true;
                    return;
                }
                Stage::Accepted => {
                    let abort_id = Uuid::new_v4();
                    *stage = Stage::Aborting(abort_id);
                    abort_id
                }
                Stage::Aborting(_) | Stage::Finished => return,
            }
        };
        self.provider.watch(abort_id, self.completions.clone());
        debug!(
            "Aborting \"{}\" ({}) with operation {}",
            self.alias, self.id, abort_id
        );
        if let Err(err) = self.engine.abort(abort_id, self.id) {
            warn!("Fail to abort \"{}\" ({}): {}", self.alias, self.id, err);
            self.provider.unwatch(abort_id);
            if self.completions.send(Completion::AbortRejected(err)).is_err() {
                debug!("Operation {} is already finished", self.id);
            }
        }
    }

    fn accepted(&self) {
        let pending = {
            let mut stage = self.stage.lock();
            let pending = matches!(
                *stage,
                Stage::Submitting {
                    abort_requested: true
                }
            );
            *stage = Stage::Accepted;
            pending
        };
        if pending {
            self.request_abort();
        }
    }

    /// Close the control; returns the abort identity if one was issued
    fn finish(&self) -> Option<Uuid> {
        let mut stage = self.stage.lock();
        let abort_id = match *stage {
            Stage::Aborting(abort_id) => Some(abort_id),
            _ => None,
        };
        *stage = Stage::Finished;
        abort_id
    }
}

/// Runs native calls as cancelable operations of one session
#[derive(Clone)]
pub struct OperationExecutor {
    engine: Arc<dyn NativeEngine>,
    provider: Arc<EventProvider>,
    registry: Arc<OperationRegistry>,
}

impl OperationExecutor {
    pub fn new(
        engine: Arc<dyn NativeEngine>,
        provider: Arc<EventProvider>,
        registry: Arc<OperationRegistry>,
    ) -> Self {
        Self {
            engine,
            provider,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    /// Submit an operation.
    ///
    /// `call` forwards the request to the engine with the operation
    /// identity; its result only confirms acceptance. `validator` converts
    /// the payload of the OperationDone event into the handle's value.
    pub fn submit<T, F, Fut, V>(
        &self,
        options: OperationOptions,
        call: F,
        validator: V,
    ) -> OperationHandle<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(Arc<dyn NativeEngine>, Uuid) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), NativeError>> + Send + 'static,
        V: FnOnce(Option<String>) -> Result<T, OperationError> + Send + 'static,
    {
        let id = options.id.unwrap_or_else(Uuid::new_v4);
        let alias = options.alias;

        if self.provider.is_closed() {
            return OperationHandle::rejected(id, alias, OperationError::SessionUnavailable);
        }

        let handle = OperationHandle::new(id, alias.clone());
        let canceler = {
            let handle = handle.clone();
            Arc::new(move || handle.cancel())
        };
        if let Err(err) = self.registry.register(id, &alias, options.sequence, canceler) {
            handle.reject(err);
            return handle;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.provider.watch(id, tx.clone());
        let control = Arc::new(Control {
            id,
            alias,
            engine: self.engine.clone(),
            provider: self.provider.clone(),
            completions: tx,
            stage: Mutex::new(Stage::Submitting {
                abort_requested: false,
            }),
        });
        {
            let control = control.clone();
            handle.on_cancel_requested(move || control.request_abort());
        }

        let executor = self.clone();
        let driven = handle.clone();
        tokio::spawn(async move {
            executor.drive(driven, control, rx, call, validator).await;
        });
        handle
    }

    async fn drive<T, F, Fut, V>(
        self,
        handle: OperationHandle<T>,
        control: Arc<Control>,
        mut rx: mpsc::UnboundedReceiver<Completion>,
        call: F,
        validator: V,
    ) where
        T: Clone + Send + 'static,
        F: FnOnce(Arc<dyn NativeEngine>, Uuid) -> Fut,
        Fut: Future<Output = Result<(), NativeError>>,
        V: FnOnce(Option<String>) -> Result<T, OperationError>,
    {
        let id = handle.id();
        debug!("Operation \"{}\" ({}) is submitted", handle.alias(), id);
        let outcome = match call(self.engine.clone(), id).await {
            Err(err) => {
                warn!(
                    "Operation \"{}\" ({}) isn't accepted: {}",
                    handle.alias(),
                    id,
                    err
                );
                Outcome::Error(OperationError::NativeAcceptance(err))
            }
            Ok(()) => {
                control.accepted();
                self.await_completion(&handle, &mut rx, validator).await
            }
        };

        // Released before settling so a settled sequence is free for reuse
        if let Some(abort_id) = control.finish() {
            self.provider.unwatch(abort_id);
        }
        self.provider.unwatch(id);
        self.registry.unregister(id);
        handle.settle(outcome);
    }

    async fn await_completion<T, V>(
        &self,
        handle: &OperationHandle<T>,
        rx: &mut mpsc::UnboundedReceiver<Completion>,
        validator: V,
    ) -> Outcome<T>
    where
        T: Clone + Send + 'static,
        V: FnOnce(Option<String>) -> Result<T, OperationError>,
    {
        let id = handle.id();
        loop {
            let completion = tokio::select! {
                biased;
                completion = rx.recv() => completion,
                _ = self.provider.closed() => None,
            };
            match completion {
                Some(Completion::Done { uuid, result }) if uuid == id => {
                    return match validator(result) {
                        Ok(value) => {
                            info!("Operation \"{}\" ({}) is done", handle.alias(), id);
                            Outcome::Done(value)
                        }
                        Err(err) => {
                            warn!(
                                "Operation \"{}\" ({}) delivered invalid result: {}",
                                handle.alias(),
                                id,
                                err
                            );
                            Outcome::Error(err)
                        }
                    };
                }
                Some(Completion::Failed { uuid, error }) if uuid == id => {
                    warn!(
                        "Operation \"{}\" ({}) failed: {}",
                        handle.alias(),
                        id,
                        error
                    );
                    return Outcome::Error(OperationError::NativeTerminal(error));
                }
                Some(Completion::Done { .. }) => {
                    info!("Operation \"{}\" ({}) is canceled", handle.alias(), id);
                    return Outcome::Canceled;
                }
                Some(Completion::Failed { uuid, error }) => {
                    // The target may still finish on its own
                    warn!(
                        "Abort {} of \"{}\" ({}) failed: {}",
                        uuid,
                        handle.alias(),
                        id,
                        error
                    );
                }
                Some(Completion::AbortRejected(err)) => {
                    return Outcome::Error(OperationError::Cancelation(err));
                }
                None => {
                    if handle.is_cancel_requested() {
                        return Outcome::Canceled;
                    }
                    debug!(
                        "Session closed before \"{}\" ({}) settled",
                        handle.alias(),
                        id
                    );
                    return Outcome::Error(OperationError::SessionClosed(id));
                }
            }
        }
    }
}
