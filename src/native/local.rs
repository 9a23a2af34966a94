//! Local Engine
//!
//! In-process engine. Requests are queued to one operations loop which
//! spawns a task per operation; every task can be interrupted through its
//! cancellation token. Events are forwarded as JSON to the session sink.

use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::library::LibraryResolver;
use super::{EventSink, NativeEngine, NativeError, NativeErrorKind};
use crate::operations::types::OperationStat;
use crate::session::events::{NativeEvent, OperationDone};

/// Delay before delayedSum reports its result
pub const DELAYED_SUM_DELAY: Duration = Duration::from_millis(100);

/// Needle searched by externalCallLib
const FIND_TARGET: &str = "tw";

#[derive(Debug, Clone, Copy)]
enum Fault {
    State,
    Tracker,
}

#[derive(Debug)]
enum OperationKind {
    Sleep(u64),
    DelayedSum(i64, i64),
    ExternalCallLib {
        path: String,
        a: u64,
        b: u64,
        lines: Vec<String>,
    },
    Cancel { target: Uuid },
    Fault(Fault),
    End,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sleep(_) => write!(f, "Sleeping"),
            Self::DelayedSum(_, _) => write!(f, "DelayedSum"),
            Self::ExternalCallLib { .. } => write!(f, "ExternalCallLib"),
            Self::Cancel { .. } => write!(f, "Canceling"),
            Self::Fault(Fault::State) => write!(f, "TriggerStateError"),
            Self::Fault(Fault::Tracker) => write!(f, "TriggerTrackerError"),
            Self::End => write!(f, "End"),
        }
    }
}

#[derive(Debug)]
struct Operation {
    id: Uuid,
    kind: OperationKind,
}

struct Tracked {
    cancel: CancellationToken,
    done: CancellationToken,
    stat: OperationStat,
}

/// Running operations plus statistics of finished ones
#[derive(Default)]
struct Tracker {
    operations: DashMap<Uuid, Tracked>,
    finished: Mutex<Vec<OperationStat>>,
}

impl Tracker {
    fn add(&self, id: Uuid, alias: &str, cancel: CancellationToken, done: CancellationToken) -> bool {
        if self.operations.contains_key(&id) {
            return false;
        }
        self.operations.insert(
            id,
            Tracked {
                cancel,
                done,
                stat: OperationStat::new(id.to_string(), alias),
            },
        );
        true
    }

    fn remove(&self, id: Uuid) {
        if let Some((_, mut tracked)) = self.operations.remove(&id) {
            tracked.stat.done();
            self.finished.lock().push(tracked.stat);
        }
    }

    /// Cancel `target` and wait until its task is over
    async fn cancel(&self, target: Uuid) -> bool {
        let tokens = self
            .operations
            .get(&target)
            .map(|tracked| (tracked.cancel.clone(), tracked.done.clone()));
        match tokens {
            Some((cancel, done)) => {
                cancel.cancel();
                done.cancelled().await;
                true
            }
            None => false,
        }
    }

    fn cancel_all(&self) {
        for tracked in self.operations.iter() {
            tracked.cancel.cancel();
        }
    }

    fn stats(&self) -> Vec<OperationStat> {
        let mut stats = self.finished.lock().clone();
        stats.extend(self.operations.iter().map(|tracked| tracked.stat.clone()));
        stats
    }
}

/// State shared by the operations loop and its tasks
#[derive(Clone)]
struct Context {
    tracker: Arc<Tracker>,
    libraries: Arc<dyn LibraryResolver>,
    events: mpsc::UnboundedSender<NativeEvent>,
    debug: Arc<AtomicBool>,
}

impl Context {
    fn emit(&self, event: NativeEvent) {
        if self.events.send(event).is_err() {
            debug!("Event forwarder is gone");
        }
    }

    fn execute(&self, id: Uuid, kind: OperationKind) {
        let alias = kind.to_string();
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        if !self.tracker.add(id, &alias, cancel.clone(), done.clone()) {
            self.emit(NativeEvent::OperationError {
                uuid: id,
                error: NativeError::error(
                    NativeErrorKind::ComputationFailed,
                    format!("Operation {} already exists", id),
                ),
            });
            return;
        }
        if self.debug.load(Ordering::Relaxed) {
            info!("Operation \"{}\" ({}) is started", alias, id);
        }
        self.emit(NativeEvent::OperationStarted(id));

        let ctx = self.clone();
        tokio::spawn(async move {
            match kind {
                OperationKind::Sleep(ms) => {
                    let result = ctx.sleep(ms, &cancel).await;
                    ctx.finish(id, &alias, result, &cancel);
                }
                OperationKind::DelayedSum(a, b) => {
                    ctx.emit(NativeEvent::OperationProcessing(id));
                    let result = ctx.delayed_sum(a, b, &cancel).await;
                    ctx.finish(id, &alias, result, &cancel);
                }
                OperationKind::ExternalCallLib { path, a, b, lines } => {
                    ctx.emit(NativeEvent::OperationProcessing(id));
                    let result = ctx.external_call_lib(&path, a, b, &lines, &cancel).await;
                    ctx.finish(id, &alias, result, &cancel);
                }
                OperationKind::Cancel { target } => {
                    let result = if ctx.tracker.cancel(target).await {
                        Ok(None::<()>)
                    } else {
                        Err(NativeError::warning(
                            NativeErrorKind::OperationSearch,
                            format!("Fail to cancel operation {}; operation isn't found", target),
                        ))
                    };
                    ctx.finish(id, &alias, result, &cancel);
                }
                OperationKind::Fault(_) | OperationKind::End => {}
            }
            done.cancel();
        });
    }

    async fn sleep(&self, ms: u64, cancel: &CancellationToken) -> Result<Option<()>, NativeError> {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
        }
        Ok(None)
    }

    async fn delayed_sum(
        &self,
        a: i64,
        b: i64,
        cancel: &CancellationToken,
    ) -> Result<Option<i64>, NativeError> {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            _ = tokio::time::sleep(DELAYED_SUM_DELAY) => {}
        }
        a.checked_add(b).map(Some).ok_or_else(|| {
            NativeError::error(
                NativeErrorKind::ComputationFailed,
                format!("{} + {} overflows", a, b),
            )
        })
    }

    async fn external_call_lib(
        &self,
        path: &str,
        a: u64,
        b: u64,
        lines: &[String],
        cancel: &CancellationToken,
    ) -> Result<Option<(u64, Option<String>)>, NativeError> {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let library = self.libraries.resolve(path)?;
        let sum = library.sum(a, b);
        let found = library.find(lines, FIND_TARGET);
        debug!("External library {}: sum = {}, found = {:?}", path, sum, found);
        Ok(Some((sum, found)))
    }

    /// Report the result unless the operation was interrupted
    fn finish<T: Serialize>(
        &self,
        id: Uuid,
        alias: &str,
        result: Result<Option<T>, NativeError>,
        cancel: &CancellationToken,
    ) {
        if cancel.is_cancelled() {
            debug!("Operation \"{}\" ({}) was interrupted", alias, id);
            self.tracker.remove(id);
            return;
        }
        let event = match result {
            Ok(Some(value)) => match serde_json::to_string(&value) {
                Ok(result) => NativeEvent::OperationDone(OperationDone {
                    uuid: id,
                    result: Some(result),
                }),
                Err(err) => NativeEvent::OperationError {
                    uuid: id,
                    error: NativeError::error(
                        NativeErrorKind::ComputationFailed,
                        format!("Fail to serialize result: {}", err),
                    ),
                },
            },
            Ok(None) => NativeEvent::OperationDone(OperationDone {
                uuid: id,
                result: None,
            }),
            Err(error) => {
                warn!("Operation \"{}\" ({}) failed: {}", alias, id, error);
                NativeEvent::OperationError { uuid: id, error }
            }
        };
        self.emit(event);
        self.tracker.remove(id);
        if self.debug.load(Ordering::Relaxed) {
            info!("Operation \"{}\" ({}) is finished", alias, id);
        }
    }

    async fn run(self, mut rx: mpsc::UnboundedReceiver<Operation>) {
        debug!("Operations loop is started");
        while let Some(operation) = rx.recv().await {
            match operation.kind {
                OperationKind::End => {
                    debug!("Session closing is requested");
                    break;
                }
                OperationKind::Fault(fault) => {
                    let message = match fault {
                        Fault::State => "Shutdown state loop with error for testing",
                        Fault::Tracker => "Shutdown tracker loop with error for testing",
                    };
                    error!("{}", message);
                    self.emit(NativeEvent::SessionError(NativeError::error(
                        NativeErrorKind::Io,
                        message,
                    )));
                    self.emit(NativeEvent::OperationDone(OperationDone {
                        uuid: operation.id,
                        result: None,
                    }));
                    break;
                }
                kind => self.execute(operation.id, kind),
            }
        }
        self.tracker.cancel_all();
        debug!("Operations loop is finished");
    }
}

struct Runtime {
    operations: mpsc::UnboundedSender<Operation>,
    destroyed: CancellationToken,
}

/// Engine running every operation on the tokio runtime
pub struct LocalEngine {
    uuid: Uuid,
    libraries: Arc<dyn LibraryResolver>,
    tracker: Arc<Tracker>,
    debug: Arc<AtomicBool>,
    runtime: Mutex<Option<Runtime>>,
}

impl LocalEngine {
    pub fn new(libraries: Arc<dyn LibraryResolver>) -> Self {
        Self::with_uuid(Uuid::new_v4(), libraries)
    }

    pub fn with_uuid(uuid: Uuid, libraries: Arc<dyn LibraryResolver>) -> Self {
        Self {
            uuid,
            libraries,
            tracker: Arc::new(Tracker::default()),
            debug: Arc::new(AtomicBool::new(false)),
            runtime: Mutex::new(None),
        }
    }

    fn send(&self, id: Uuid, kind: OperationKind) -> Result<(), NativeError> {
        let runtime = self.runtime.lock();
        let runtime = runtime.as_ref().ok_or_else(|| {
            NativeError::error(
                NativeErrorKind::Configuration,
                "Session is destroyed or not inited yet",
            )
        })?;
        runtime
            .operations
            .send(Operation { id, kind })
            .map_err(|_| NativeError::channel("Fail to send operation; session is closed"))
    }
}

fn forward(sink: &EventSink, event: &NativeEvent) {
    match serde_json::to_value(event) {
        Ok(payload) => {
            if sink.send(payload).is_err() {
                debug!("Event sink is closed");
            }
        }
        Err(err) => error!("Fail to serialize event: {}", err),
    }
}

#[async_trait]
impl NativeEngine for LocalEngine {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn init(&self, sink: EventSink) -> Result<(), NativeError> {
        let mut runtime = self.runtime.lock();
        if runtime.is_some() {
            return Err(NativeError::error(
                NativeErrorKind::Configuration,
                "Session is already inited",
            ));
        }
        let (tx_operations, rx_operations) = mpsc::unbounded_channel();
        let (tx_events, mut rx_events) = mpsc::unbounded_channel::<NativeEvent>();
        let destroyed = CancellationToken::new();
        *runtime = Some(Runtime {
            operations: tx_operations,
            destroyed: destroyed.clone(),
        });

        let ctx = Context {
            tracker: self.tracker.clone(),
            libraries: self.libraries.clone(),
            events: tx_events,
            debug: self.debug.clone(),
        };
        tokio::spawn(async move {
            ctx.run(rx_operations).await;
            destroyed.cancel();
        });
        tokio::spawn(async move {
            while let Some(event) = rx_events.recv().await {
                forward(&sink, &event);
            }
            forward(&sink, &NativeEvent::SessionDestroyed);
        });
        info!("Local engine {} is started", self.uuid);
        Ok(())
    }

    fn abort(&self, operation: Uuid, target: Uuid) -> Result<(), NativeError> {
        self.send(operation, OperationKind::Cancel { target })
    }

    async fn stop(&self, operation: Uuid) -> Result<(), NativeError> {
        let (operations, destroyed) = {
            let runtime = self.runtime.lock();
            let runtime = runtime.as_ref().ok_or_else(|| {
                NativeError::error(
                    NativeErrorKind::Configuration,
                    "Session is destroyed or not inited yet",
                )
            })?;
            (runtime.operations.clone(), runtime.destroyed.clone())
        };
        if operations
            .send(Operation {
                id: operation,
                kind: OperationKind::End,
            })
            .is_err()
        {
            debug!("Operations loop is already finished");
        }
        destroyed.cancelled().await;
        info!("Local engine {} is stopped", self.uuid);
        Ok(())
    }

    async fn set_debug(&self, debug: bool) -> Result<(), NativeError> {
        self.debug.store(debug, Ordering::Relaxed);
        Ok(())
    }

    async fn operations_stat(&self) -> Result<String, NativeError> {
        serde_json::to_string(&self.tracker.stats()).map_err(|err| {
            NativeError::error(NativeErrorKind::ComputationFailed, err.to_string())
        })
    }

    async fn sleep(&self, operation: Uuid, ms: u64) -> Result<(), NativeError> {
        self.send(operation, OperationKind::Sleep(ms))
    }

    async fn delayed_sum(&self, operation: Uuid, a: i64, b: i64) -> Result<(), NativeError> {
        self.send(operation, OperationKind::DelayedSum(a, b))
    }

    async fn external_call_lib(
        &self,
        operation: Uuid,
        path: String,
        a: u64,
        b: u64,
        lines: Vec<String>,
    ) -> Result<(), NativeError> {
        self.send(operation, OperationKind::ExternalCallLib { path, a, b, lines })
    }

    async fn trigger_state_error(&self, operation: Uuid) -> Result<(), NativeError> {
        self.send(operation, OperationKind::Fault(Fault::State))
    }

    async fn trigger_tracker_error(&self, operation: Uuid) -> Result<(), NativeError> {
        self.send(operation, OperationKind::Fault(Fault::Tracker))
    }

    fn engine_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::LibraryRegistry;
    use crate::session::events::IngressEvent;
    use tokio::time::timeout;

    async fn started() -> (LocalEngine, mpsc::UnboundedReceiver<serde_json::Value>) {
        let engine = LocalEngine::new(Arc::new(LibraryRegistry::with_bundled("plugin")));
        let (tx, rx) = mpsc::unbounded_channel();
        engine.init(tx).await.unwrap();
        (engine, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<serde_json::Value>) -> NativeEvent {
        let payload = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match IngressEvent::parse(payload) {
            IngressEvent::Known(event) => event,
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    /// Skip events until the terminal one of `id`
    async fn terminal(rx: &mut mpsc::UnboundedReceiver<serde_json::Value>, id: Uuid) -> NativeEvent {
        loop {
            let event = next(rx).await;
            match &event {
                NativeEvent::OperationDone(done) if done.uuid == id => return event,
                NativeEvent::OperationError { uuid, .. } if *uuid == id => return event,
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_init_once() {
        let (engine, _rx) = started().await;
        let (tx, _) = mpsc::unbounded_channel();
        let err = engine.init(tx).await.unwrap_err();
        assert_eq!(err.kind, NativeErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_calls_before_init_are_rejected() {
        let engine = LocalEngine::new(Arc::new(LibraryRegistry::new()));
        assert!(engine.sleep(Uuid::new_v4(), 1).await.is_err());
        assert!(engine.abort(Uuid::new_v4(), Uuid::new_v4()).is_err());
    }

    #[tokio::test]
    async fn test_delayed_sum() {
        let (engine, mut rx) = started().await;
        let id = Uuid::new_v4();
        engine.delayed_sum(id, 50, 50).await.unwrap();

        assert_eq!(next(&mut rx).await, NativeEvent::OperationStarted(id));
        match terminal(&mut rx, id).await {
            NativeEvent::OperationDone(done) => assert_eq!(done.result.as_deref(), Some("100")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_abort_interrupts_silently() {
        let (engine, mut rx) = started().await;
        let id = Uuid::new_v4();
        let abort_id = Uuid::new_v4();
        engine.sleep(id, 10_000).await.unwrap();
        engine.abort(abort_id, id).unwrap();

        match terminal(&mut rx, abort_id).await {
            NativeEvent::OperationDone(done) => assert!(done.result.is_none()),
            other => panic!("unexpected: {:?}", other),
        }
        engine.stop(Uuid::new_v4()).await.unwrap();
        // Nothing terminal was reported for the interrupted operation
        while let Some(payload) = rx.recv().await {
            if let IngressEvent::Known(event) = IngressEvent::parse(payload) {
                assert!(!matches!(&event, NativeEvent::OperationDone(d) if d.uuid == id));
            }
        }
    }

    #[tokio::test]
    async fn test_abort_unknown_operation() {
        let (engine, mut rx) = started().await;
        let abort_id = Uuid::new_v4();
        engine.abort(abort_id, Uuid::new_v4()).unwrap();
        match terminal(&mut rx, abort_id).await {
            NativeEvent::OperationError { error, .. } => {
                assert_eq!(error.kind, NativeErrorKind::OperationSearch);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_external_call_lib() {
        let (engine, mut rx) = started().await;
        let id = Uuid::new_v4();
        let lines = vec!["one".to_string(), "two".to_string(), "three".to_string()];
        engine
            .external_call_lib(id, "plugin".to_string(), 2, 6, lines.clone())
            .await
            .unwrap();
        match terminal(&mut rx, id).await {
            NativeEvent::OperationDone(done) => {
                assert_eq!(done.result.as_deref(), Some("[8,\"two\"]"));
            }
            other => panic!("unexpected: {:?}", other),
        }

        let missing = Uuid::new_v4();
        engine
            .external_call_lib(missing, "missing".to_string(), 2, 6, lines)
            .await
            .unwrap();
        match terminal(&mut rx, missing).await {
            NativeEvent::OperationError { error, .. } => {
                assert_eq!(error.kind, NativeErrorKind::FileNotFound);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_ends_stream() {
        let (engine, mut rx) = started().await;
        engine.sleep(Uuid::new_v4(), 10_000).await.unwrap();
        timeout(Duration::from_secs(2), engine.stop(Uuid::new_v4()))
            .await
            .unwrap()
            .unwrap();

        let mut last = None;
        while let Some(payload) = timeout(Duration::from_secs(2), rx.recv()).await.unwrap() {
            last = Some(payload);
        }
        assert_eq!(last, Some(serde_json::json!("SessionDestroyed")));
        assert!(engine.sleep(Uuid::new_v4(), 1).await.is_err());
    }

    #[tokio::test]
    async fn test_state_error_tears_down() {
        let (engine, mut rx) = started().await;
        let id = Uuid::new_v4();
        engine.trigger_state_error(id).await.unwrap();

        assert!(matches!(next(&mut rx).await, NativeEvent::SessionError(_)));
        assert!(matches!(terminal(&mut rx, id).await, NativeEvent::OperationDone(_)));
        assert_eq!(next(&mut rx).await, NativeEvent::SessionDestroyed);
    }

    #[tokio::test]
    async fn test_operations_stat() {
        let (engine, mut rx) = started().await;
        let id = Uuid::new_v4();
        engine.sleep(id, 1).await.unwrap();
        terminal(&mut rx, id).await;

        let stats: Vec<OperationStat> =
            serde_json::from_str(&engine.operations_stat().await.unwrap()).unwrap();
        assert!(stats
            .iter()
            .any(|stat| stat.uuid == id.to_string() && stat.name == "Sleeping"));
    }
}
