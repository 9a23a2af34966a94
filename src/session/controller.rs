//! Session Controller
//!
//! Owns one native session: its event provider, its operation registry and
//! the lifecycle Uninitialized -> Initializing -> Ready -> Destroying ->
//! Destroyed (or Failed when init is rejected).

use log::{debug, error, info, warn};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::events::SessionEvents;
use super::provider::EventProvider;
use super::results::{self, ExternalCallResult};
use super::state::{SessionInfo, SessionState, SessionStatus};
use crate::config::SessionConfig;
use crate::error::{OperationError, SessionError, SessionResult};
use crate::native::NativeEngine;
use crate::operations::types::{OperationInfo, OperationOptions, OperationStat};
use crate::operations::{OperationExecutor, OperationHandle, OperationRegistry};

pub struct Session {
    id: Uuid,
    engine: Arc<dyn NativeEngine>,
    provider: Arc<EventProvider>,
    registry: Arc<OperationRegistry>,
    executor: OperationExecutor,
    config: SessionConfig,
    state: Arc<RwLock<SessionState>>,
    /// Set once local teardown is complete
    torn_down: CancellationToken,
}

impl Session {
    /// Init the engine and wire its event stream to a new provider
    pub async fn create(engine: Arc<dyn NativeEngine>, config: SessionConfig) -> SessionResult<Self> {
        let id = engine.uuid();
        let state = Arc::new(RwLock::new(SessionState::new(id, engine.engine_type())));
        state.write().set_status(SessionStatus::Initializing);

        let (provider, sink) = EventProvider::new(id, config.event_capacity);
        if let Err(err) = engine.init(sink).await {
            error!("Fail to init session {}: {}", id, err);
            state.write().set_failed(err.to_string());
            provider.shutdown();
            return Err(SessionError::Init(err));
        }
        if config.debug {
            match engine.set_debug(true).await {
                Ok(()) => state.write().debug = true,
                Err(err) => warn!("Fail to enable debug for session {}: {}", id, err),
            }
        }

        let registry = Arc::new(OperationRegistry::new());
        let executor = OperationExecutor::new(engine.clone(), provider.clone(), registry.clone());
        state.write().set_status(SessionStatus::Ready);
        info!("Session {} is created ({})", id, engine.engine_type());

        let session = Self {
            id,
            engine,
            provider,
            registry,
            executor,
            config,
            state,
            torn_down: CancellationToken::new(),
        };
        session.watch_destruction();
        Ok(session)
    }

    /// Move to Destroyed when the engine ends the stream on its own
    fn watch_destruction(&self) {
        let provider = self.provider.clone();
        let state = self.state.clone();
        let torn_down = self.torn_down.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = provider.closed() => {
                    let mut state = state.write();
                    if state.status == SessionStatus::Ready {
                        warn!("Session {} was destroyed by the engine", state.id);
                        state.set_status(SessionStatus::Destroyed);
                    }
                }
                _ = torn_down.cancelled() => {}
            }
        });
    }

    pub fn uuid(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> SessionStatus {
        self.state.read().status
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo::new(&self.state.read(), self.registry.len())
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Typed notification streams
    pub fn events(&self) -> &SessionEvents {
        self.provider.events()
    }

    /// In-flight operations
    pub fn operations(&self) -> Vec<OperationInfo> {
        self.registry.list()
    }

    pub fn next_sequence(&self) -> u64 {
        self.registry.next_sequence()
    }

    /// Request cancellation of an in-flight operation by identity
    pub fn cancel(&self, operation: Uuid) -> bool {
        self.registry.cancel(operation)
    }

    /// Resolves once the event stream of the session is over
    pub async fn destroyed(&self) {
        self.provider.closed().await
    }

    fn submit<T, F, Fut, V>(&self, options: OperationOptions, call: F, validator: V) -> OperationHandle<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(Arc<dyn NativeEngine>, Uuid) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), crate::native::NativeError>> + Send + 'static,
        V: FnOnce(Option<String>) -> Result<T, OperationError> + Send + 'static,
    {
        if !self.status().is_active() {
            debug!(
                "Session {} is {}; \"{}\" is rejected",
                self.id,
                self.status(),
                options.alias
            );
            return OperationHandle::rejected(
                options.id.unwrap_or_else(Uuid::new_v4),
                options.alias,
                OperationError::SessionUnavailable,
            );
        }
        self.state.write().touch();
        self.executor.submit(options, call, validator)
    }

    pub fn sleep(&self, ms: u64) -> OperationHandle<()> {
        self.submit(
            OperationOptions::new("sleep"),
            move |engine, id| async move { engine.sleep(id, ms).await },
            results::ignore_result,
        )
    }

    /// `a + b` computed by the engine after a short delay. Without an
    /// explicit sequence the next session sequence is taken.
    pub fn delayed_sum(&self, a: i64, b: i64, sequence: Option<u64>) -> OperationHandle<i64> {
        let sequence = sequence.unwrap_or_else(|| self.next_sequence());
        self.submit(
            OperationOptions::new("delayedSum").with_sequence(Some(sequence)),
            move |engine, id| async move { engine.delayed_sum(id, a, b).await },
            results::parse_number,
        )
    }

    pub fn external_call_lib(
        &self,
        path: impl Into<String>,
        a: u64,
        b: u64,
        lines: Vec<String>,
    ) -> OperationHandle<ExternalCallResult> {
        let path = path.into();
        self.submit(
            OperationOptions::new("externalCallLib"),
            move |engine, id| async move { engine.external_call_lib(id, path, a, b, lines).await },
            results::parse_external_call_result,
        )
    }

    /// externalCallLib with the configured library
    pub fn external_call_lib_default(
        &self,
        a: u64,
        b: u64,
        lines: Vec<String>,
    ) -> OperationHandle<ExternalCallResult> {
        match self.config.external_lib_path.clone() {
            Some(path) => self.external_call_lib(path, a, b, lines),
            None => OperationHandle::rejected(
                Uuid::new_v4(),
                "externalCallLib",
                OperationError::Configuration("external library path isn't set".to_string()),
            ),
        }
    }

    pub fn trigger_state_error(&self) -> OperationHandle<()> {
        self.submit(
            OperationOptions::new("triggerStateError"),
            |engine, id| async move { engine.trigger_state_error(id).await },
            results::ignore_result,
        )
    }

    pub fn trigger_tracker_error(&self) -> OperationHandle<()> {
        self.submit(
            OperationOptions::new("triggerTrackerError"),
            |engine, id| async move { engine.trigger_tracker_error(id).await },
            results::ignore_result,
        )
    }

    pub async fn set_debug(&self, debug: bool) -> SessionResult<()> {
        if !self.status().is_active() {
            return Err(SessionError::Unavailable);
        }
        self.engine
            .set_debug(debug)
            .await
            .map_err(|err| SessionError::Operation(OperationError::NativeAcceptance(err)))?;
        self.state.write().debug = debug;
        Ok(())
    }

    pub async fn operations_stat(&self) -> SessionResult<Vec<OperationStat>> {
        if !self.status().is_active() {
            return Err(SessionError::Unavailable);
        }
        let raw = self
            .engine
            .operations_stat()
            .await
            .map_err(|err| SessionError::Operation(OperationError::NativeAcceptance(err)))?;
        serde_json::from_str(&raw).map_err(|err| {
            SessionError::Operation(OperationError::Parse {
                alias: "operationsStat".to_string(),
                message: err.to_string(),
            })
        })
    }

    /// Tear the session down.
    ///
    /// Outstanding operations get a cancel request, then the engine is
    /// stopped within the configured bound. Local state is released even if
    /// the engine fails or never answers; in that case the error is returned.
    pub async fn destroy(&self) -> SessionResult<()> {
        let previous = {
            let mut state = self.state.write();
            let previous = state.status;
            if !matches!(previous, SessionStatus::Destroying) && !previous.is_terminal() {
                state.set_status(SessionStatus::Destroying);
            }
            previous
        };
        match previous {
            SessionStatus::Destroyed | SessionStatus::Failed => {
                self.teardown();
                self.torn_down.cancel();
                return Ok(());
            }
            SessionStatus::Destroying => {
                self.torn_down.cancelled().await;
                return Ok(());
            }
            _ => {}
        }

        let canceled = self.registry.cancel_all();
        if canceled > 0 {
            debug!("Session {}: {} operation(s) canceled before stop", self.id, canceled);
        }

        // Stop and release run detached so dropping this future can't leave
        // the session stuck in Destroying
        let bound = self.config.destroy_timeout();
        let engine = self.engine.clone();
        let provider = self.provider.clone();
        let registry = self.registry.clone();
        let state = self.state.clone();
        let torn_down = self.torn_down.clone();
        let id = self.id;
        let stopping = tokio::spawn(async move {
            let result = match tokio::time::timeout(bound, engine.stop(Uuid::new_v4())).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => {
                    error!("Fail to stop session {}: {}", id, err);
                    Err(SessionError::Stop(err))
                }
                Err(_) => {
                    error!("Session {} wasn't closed in {:?}", id, bound);
                    Err(SessionError::TeardownTimeout(bound))
                }
            };
            release(id, &provider, &registry);
            state.write().set_status(SessionStatus::Destroyed);
            torn_down.cancel();
            info!("Session {} is destroyed", id);
            result
        });

        match stopping.await {
            Ok(result) => result,
            Err(err) => {
                error!("Teardown of session {} is aborted: {}", self.id, err);
                self.teardown();
                self.state.write().set_status(SessionStatus::Destroyed);
                self.torn_down.cancel();
                Err(SessionError::Unavailable)
            }
        }
    }

    fn teardown(&self) {
        release(self.id, &self.provider, &self.registry);
    }
}

/// Drop local session state: close the event stream and forget operations
fn release(id: Uuid, provider: &EventProvider, registry: &OperationRegistry) {
    provider.shutdown();
    let dropped = registry.clear();
    if dropped > 0 {
        debug!("Session {}: {} registry entries dropped", id, dropped);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.torn_down.is_cancelled() {
            self.teardown();
            self.torn_down.cancel();
        }
    }
}
