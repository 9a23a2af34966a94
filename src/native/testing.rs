//! Scripted engine for tests: records calls and lets the test drive the
//! event stream by hand.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

use super::{EventSink, NativeEngine, NativeError};
use crate::session::events::{NativeEvent, OperationDone};

#[derive(Debug, Clone)]
enum StopBehavior {
    Graceful,
    Hang,
    Fail(NativeError),
}

pub(crate) struct ScriptedEngine {
    uuid: Uuid,
    sink: Mutex<Option<EventSink>>,
    calls: Mutex<Vec<(&'static str, Uuid)>>,
    aborts: Mutex<Vec<(Uuid, Uuid)>>,
    init_error: Option<NativeError>,
    accept_error: Option<NativeError>,
    accept_delay: Option<Duration>,
    abort_error: Option<NativeError>,
    ack_aborts: bool,
    stop: StopBehavior,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            uuid: Uuid::new_v4(),
            sink: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            aborts: Mutex::new(Vec::new()),
            init_error: None,
            accept_error: None,
            accept_delay: None,
            abort_error: None,
            ack_aborts: false,
            stop: StopBehavior::Graceful,
        }
    }

    pub fn with_init_error(mut self, err: NativeError) -> Self {
        self.init_error = Some(err);
        self
    }

    pub fn with_accept_error(mut self, err: NativeError) -> Self {
        self.accept_error = Some(err);
        self
    }

    pub fn with_accept_delay(mut self, delay: Duration) -> Self {
        self.accept_delay = Some(delay);
        self
    }

    pub fn with_abort_error(mut self, err: NativeError) -> Self {
        self.abort_error = Some(err);
        self
    }

    /// Confirm every abort right away with OperationDone
    pub fn acking_aborts(mut self) -> Self {
        self.ack_aborts = true;
        self
    }

    pub fn with_hanging_stop(mut self) -> Self {
        self.stop = StopBehavior::Hang;
        self
    }

    pub fn with_stop_error(mut self, err: NativeError) -> Self {
        self.stop = StopBehavior::Fail(err);
        self
    }

    /// Push a raw payload into the session
    pub fn emit(&self, payload: serde_json::Value) -> bool {
        match self.sink.lock().as_ref() {
            Some(sink) => sink.send(payload).is_ok(),
            None => false,
        }
    }

    fn emit_event(&self, event: NativeEvent) -> bool {
        match serde_json::to_value(event) {
            Ok(payload) => self.emit(payload),
            Err(_) => false,
        }
    }

    pub fn done(&self, operation: Uuid, result: Option<&str>) -> bool {
        self.emit_event(NativeEvent::OperationDone(OperationDone {
            uuid: operation,
            result: result.map(str::to_string),
        }))
    }

    pub fn fail(&self, operation: Uuid, error: NativeError) -> bool {
        self.emit_event(NativeEvent::OperationError {
            uuid: operation,
            error,
        })
    }

    pub fn session_error(&self, error: NativeError) -> bool {
        self.emit_event(NativeEvent::SessionError(error))
    }

    /// Send SessionDestroyed and release the sink
    pub fn destroy(&self) {
        let _ = self.emit(json!("SessionDestroyed"));
        self.sink.lock().take();
    }

    pub fn aborts(&self) -> Vec<(Uuid, Uuid)> {
        self.aborts.lock().clone()
    }

    pub fn calls(&self, name: &str) -> Vec<Uuid> {
        self.calls
            .lock()
            .iter()
            .filter(|(call, _)| *call == name)
            .map(|(_, id)| *id)
            .collect()
    }

    /// Wait for the first accepted call named `name`
    pub async fn wait_for_call(&self, name: &str) -> Uuid {
        self.wait_for_calls(name, 1).await[0]
    }

    pub async fn wait_for_calls(&self, name: &str, count: usize) -> Vec<Uuid> {
        for _ in 0..200 {
            let calls = self.calls(name);
            if calls.len() >= count {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{} call(s) of {} never arrived", count, name);
    }

    pub async fn wait_for_abort(&self) -> (Uuid, Uuid) {
        for _ in 0..200 {
            if let Some(abort) = self.aborts().first() {
                return *abort;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("abort never arrived");
    }

    async fn accept(&self, name: &'static str, operation: Uuid) -> Result<(), NativeError> {
        if let Some(delay) = self.accept_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = &self.accept_error {
            return Err(err.clone());
        }
        self.calls.lock().push((name, operation));
        Ok(())
    }
}

#[async_trait]
impl NativeEngine for ScriptedEngine {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn init(&self, sink: EventSink) -> Result<(), NativeError> {
        if let Some(err) = &self.init_error {
            return Err(err.clone());
        }
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    fn abort(&self, operation: Uuid, target: Uuid) -> Result<(), NativeError> {
        if let Some(err) = &self.abort_error {
            return Err(err.clone());
        }
        self.aborts.lock().push((operation, target));
        if self.ack_aborts {
            self.done(operation, None);
        }
        Ok(())
    }

    async fn stop(&self, _operation: Uuid) -> Result<(), NativeError> {
        match &self.stop {
            StopBehavior::Graceful => {
                self.destroy();
                Ok(())
            }
            StopBehavior::Hang => {
                futures::future::pending::<()>().await;
                Ok(())
            }
            StopBehavior::Fail(err) => Err(err.clone()),
        }
    }

    async fn set_debug(&self, _debug: bool) -> Result<(), NativeError> {
        Ok(())
    }

    async fn operations_stat(&self) -> Result<String, NativeError> {
        Ok("[]".to_string())
    }

    async fn sleep(&self, operation: Uuid, _ms: u64) -> Result<(), NativeError> {
        self.accept("sleep", operation).await
    }

    async fn delayed_sum(&self, operation: Uuid, _a: i64, _b: i64) -> Result<(), NativeError> {
        self.accept("delayed_sum", operation).await
    }

    async fn external_call_lib(
        &self,
        operation: Uuid,
        _path: String,
        _a: u64,
        _b: u64,
        _lines: Vec<String>,
    ) -> Result<(), NativeError> {
        self.accept("external_call_lib", operation).await
    }

    async fn trigger_state_error(&self, operation: Uuid) -> Result<(), NativeError> {
        self.accept("trigger_state_error", operation).await
    }

    async fn trigger_tracker_error(&self, operation: Uuid) -> Result<(), NativeError> {
        self.accept("trigger_tracker_error", operation).await
    }

    fn engine_type(&self) -> &'static str {
        "scripted"
    }
}
