//! Event Provider
//!
//! Single entry point for the raw native event stream of one session.
//! Payloads are classified and dispatched by one loop; completions are
//! routed to the operation waiting for them, every event is also fanned
//! out to the per-kind subscribers.

use dashmap::DashMap;
use log::{debug, error, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use super::events::{IngressEvent, NativeEvent, SessionEvents};
use crate::native::{EventSink, NativeError};

/// Terminal signal delivered to a waiting operation
#[derive(Debug, Clone)]
pub(crate) enum Completion {
    Done { uuid: Uuid, result: Option<String> },
    Failed { uuid: Uuid, error: NativeError },
    /// Abort request refused synchronously by the engine
    AbortRejected(NativeError),
}

pub struct EventProvider {
    session: Uuid,
    events: SessionEvents,
    waiters: DashMap<Uuid, mpsc::UnboundedSender<Completion>>,
    destroyed: AtomicBool,
    closed: CancellationToken,
    shutdown: CancellationToken,
}

impl EventProvider {
    /// Create a provider with its ingress sink. The sink is handed to the
    /// engine exactly once; the dispatch loop runs until the stream ends or
    /// [`EventProvider::shutdown`] is called.
    pub fn new(session: Uuid, capacity: usize) -> (Arc<Self>, EventSink) {
        let (tx, rx) = mpsc::unbounded_channel();
        let provider = Arc::new(Self {
            session,
            events: SessionEvents::new(capacity),
            waiters: DashMap::new(),
            destroyed: AtomicBool::new(false),
            closed: CancellationToken::new(),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(provider.clone().dispatch_loop(rx));
        (provider, tx)
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    pub fn events(&self) -> &SessionEvents {
        &self.events
    }

    /// Whether the stream is over
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the stream is over
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    /// Route completions of `operation` to `tx`
    pub(crate) fn watch(&self, operation: Uuid, tx: mpsc::UnboundedSender<Completion>) {
        self.waiters.insert(operation, tx);
    }

    pub(crate) fn unwatch(&self, operation: Uuid) {
        self.waiters.remove(&operation);
    }

    /// Number of identities awaiting a completion
    pub fn watching(&self) -> usize {
        self.waiters.len()
    }

    /// Stop dispatching. Subscribers still get one SessionDestroyed
    /// notification if the engine didn't send it.
    pub fn shutdown(&self) {
        self.close();
        self.shutdown.cancel();
    }

    async fn dispatch_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<serde_json::Value>) {
        debug!("Event dispatching for session {} is started", self.session);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                payload = rx.recv() => match payload {
                    Some(payload) => self.dispatch(payload),
                    None => {
                        debug!("Event stream of session {} is ended", self.session);
                        self.close();
                        break;
                    }
                },
            }
        }
        debug!("Event dispatching for session {} is finished", self.session);
    }

    fn dispatch(&self, payload: serde_json::Value) {
        match IngressEvent::parse(payload) {
            IngressEvent::Unrecognized { payload, reason } => {
                warn!(
                    "Session {}: dropping unrecognized event {} ({})",
                    self.session, payload, reason
                );
            }
            IngressEvent::Known(event) => {
                trace!("Session {}: {} event", self.session, event.kind());
                let completion = match &event {
                    NativeEvent::SessionError(err) => {
                        error!("Session {} error: {}", self.session, err);
                        None
                    }
                    NativeEvent::OperationDone(done) => Some(Completion::Done {
                        uuid: done.uuid,
                        result: done.result.clone(),
                    }),
                    NativeEvent::OperationError { uuid, error } => Some(Completion::Failed {
                        uuid: *uuid,
                        error: error.clone(),
                    }),
                    NativeEvent::SessionDestroyed => {
                        self.close();
                        return;
                    }
                    NativeEvent::OperationStarted(_) | NativeEvent::OperationProcessing(_) => None,
                };
                let operation = event.operation();
                // Subscribers see the event before the waiting handle settles
                self.events.publish(event);
                if let (Some(operation), Some(completion)) = (operation, completion) {
                    self.complete(operation, completion);
                }
            }
        }
    }

    fn complete(&self, operation: Uuid, completion: Completion) {
        if let Some((_, tx)) = self.waiters.remove(&operation) {
            if tx.send(completion).is_err() {
                debug!("Operation {} isn't waited anymore", operation);
            }
        }
    }

    fn close(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.events.publish(NativeEvent::SessionDestroyed);
        self.waiters.clear();
        self.closed.cancel();
        debug!("Session {} event stream is closed", self.session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::NativeErrorKind;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_routes_completion_to_waiter() {
        let (provider, sink) = EventProvider::new(Uuid::new_v4(), 16);
        let mut done = provider.events().operation_done();
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        provider.watch(id, tx);

        sink.send(json!({ "OperationDone": { "uuid": id, "result": "7" } }))
            .unwrap();

        match timeout(Duration::from_secs(1), rx.recv()).await.unwrap() {
            Some(Completion::Done { uuid, result }) => {
                assert_eq!(uuid, id);
                assert_eq!(result.as_deref(), Some("7"));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(done.recv().await.unwrap().uuid, id);
        assert_eq!(provider.watching(), 0);
    }

    #[tokio::test]
    async fn test_unrecognized_payload_is_dropped() {
        let (provider, sink) = EventProvider::new(Uuid::new_v4(), 16);
        let mut started = provider.events().operation_started();
        let id = Uuid::new_v4();

        sink.send(json!({ "Garbage": true })).unwrap();
        sink.send(json!("nonsense")).unwrap();
        sink.send(json!({ "OperationStarted": id })).unwrap();

        let got = timeout(Duration::from_secs(1), started.recv()).await.unwrap();
        assert_eq!(got.unwrap(), id);
        assert!(!provider.is_closed());
    }

    #[tokio::test]
    async fn test_error_routed_and_published() {
        let (provider, sink) = EventProvider::new(Uuid::new_v4(), 16);
        let mut errors = provider.events().operation_error();
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();
        provider.watch(id, tx);

        let error = NativeError::error(NativeErrorKind::ComputationFailed, "nope");
        sink.send(json!({ "OperationError": { "uuid": id, "error": error } }))
            .unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(Completion::Failed { uuid, .. }) if uuid == id
        ));
        assert_eq!(errors.recv().await.unwrap().error.kind, NativeErrorKind::ComputationFailed);
    }

    #[tokio::test]
    async fn test_session_destroyed_closes_once() {
        let (provider, sink) = EventProvider::new(Uuid::new_v4(), 16);
        let mut destroyed = provider.events().session_destroyed();
        let (tx, _rx) = mpsc::unbounded_channel();
        provider.watch(Uuid::new_v4(), tx);

        sink.send(json!("SessionDestroyed")).unwrap();
        timeout(Duration::from_secs(1), provider.closed()).await.unwrap();
        assert_eq!(provider.watching(), 0);

        provider.shutdown();
        destroyed.recv().await.unwrap();
        assert!(destroyed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropped_sink_closes_stream() {
        let (provider, sink) = EventProvider::new(Uuid::new_v4(), 16);
        drop(sink);
        timeout(Duration::from_secs(1), provider.closed()).await.unwrap();
        assert!(provider.is_closed());
    }
}
