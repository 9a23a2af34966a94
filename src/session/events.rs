//! Session Events
//!
//! Event types exchanged between the native engine and a session, plus the
//! per-kind broadcast channels subscribers attach to.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::native::NativeError;

/// Payload of a successful completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationDone {
    pub uuid: Uuid,
    #[serde(default)]
    pub result: Option<String>,
}

/// Payload of a failed operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationErrorEvent {
    pub uuid: Uuid,
    pub error: NativeError,
}

/// Events emitted by the native engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NativeEvent {
    /// Session-wide error; the session may keep running
    SessionError(NativeError),
    OperationError { uuid: Uuid, error: NativeError },
    OperationStarted(Uuid),
    OperationProcessing(Uuid),
    OperationDone(OperationDone),
    /// Terminal event of the stream
    SessionDestroyed,
}

impl NativeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::SessionError(_) => EventKind::SessionError,
            Self::OperationError { .. } => EventKind::OperationError,
            Self::OperationStarted(_) => EventKind::OperationStarted,
            Self::OperationProcessing(_) => EventKind::OperationProcessing,
            Self::OperationDone(_) => EventKind::OperationDone,
            Self::SessionDestroyed => EventKind::SessionDestroyed,
        }
    }

    /// Operation the event refers to, if any
    pub fn operation(&self) -> Option<Uuid> {
        match self {
            Self::OperationError { uuid, .. } => Some(*uuid),
            Self::OperationStarted(uuid) | Self::OperationProcessing(uuid) => Some(*uuid),
            Self::OperationDone(done) => Some(done.uuid),
            Self::SessionError(_) | Self::SessionDestroyed => None,
        }
    }
}

/// Notification kinds a subscriber can attach to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SessionError,
    OperationError,
    SessionDestroyed,
    OperationStarted,
    OperationProcessing,
    OperationDone,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionError => "session-error",
            Self::OperationError => "operation-error",
            Self::SessionDestroyed => "session-destroyed",
            Self::OperationStarted => "operation-started",
            Self::OperationProcessing => "operation-processing",
            Self::OperationDone => "operation-done",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Raw payload classified on arrival
#[derive(Debug, Clone)]
pub enum IngressEvent {
    Known(NativeEvent),
    Unrecognized {
        payload: serde_json::Value,
        reason: String,
    },
}

impl IngressEvent {
    pub fn parse(payload: serde_json::Value) -> Self {
        match serde_json::from_value::<NativeEvent>(payload.clone()) {
            Ok(event) => Self::Known(event),
            Err(err) => Self::Unrecognized {
                payload,
                reason: err.to_string(),
            },
        }
    }
}

/// Broadcast channels, one per notification kind
///
/// Every subscriber receives each event of its kind as long as it stays
/// within `capacity` events of the sender. A subscriber that falls further
/// behind gets `RecvError::Lagged` with the number of skipped events and
/// resumes from the oldest retained one.
#[derive(Debug, Clone)]
pub struct SessionEvents {
    session_error: broadcast::Sender<NativeError>,
    operation_error: broadcast::Sender<OperationErrorEvent>,
    session_destroyed: broadcast::Sender<()>,
    operation_started: broadcast::Sender<Uuid>,
    operation_processing: broadcast::Sender<Uuid>,
    operation_done: broadcast::Sender<OperationDone>,
}

impl SessionEvents {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            session_error: broadcast::channel(capacity).0,
            operation_error: broadcast::channel(capacity).0,
            session_destroyed: broadcast::channel(capacity).0,
            operation_started: broadcast::channel(capacity).0,
            operation_processing: broadcast::channel(capacity).0,
            operation_done: broadcast::channel(capacity).0,
        }
    }

    pub fn session_error(&self) -> broadcast::Receiver<NativeError> {
        self.session_error.subscribe()
    }

    pub fn operation_error(&self) -> broadcast::Receiver<OperationErrorEvent> {
        self.operation_error.subscribe()
    }

    pub fn session_destroyed(&self) -> broadcast::Receiver<()> {
        self.session_destroyed.subscribe()
    }

    pub fn operation_started(&self) -> broadcast::Receiver<Uuid> {
        self.operation_started.subscribe()
    }

    pub fn operation_processing(&self) -> broadcast::Receiver<Uuid> {
        self.operation_processing.subscribe()
    }

    pub fn operation_done(&self) -> broadcast::Receiver<OperationDone> {
        self.operation_done.subscribe()
    }

    /// Fan an event out to the subscribers of its kind.
    /// Returns the number of receivers reached.
    /// No receivers is not an error.
    pub(crate) fn publish(&self, event: NativeEvent) -> usize {
        match event {
            NativeEvent::SessionError(err) => self.session_error.send(err).unwrap_or(0),
            NativeEvent::OperationError { uuid, error } => self
                .operation_error
                .send(OperationErrorEvent { uuid, error })
                .unwrap_or(0),
            NativeEvent::OperationStarted(uuid) => self.operation_started.send(uuid).unwrap_or(0),
            NativeEvent::OperationProcessing(uuid) => {
                self.operation_processing.send(uuid).unwrap_or(0)
            }
            NativeEvent::OperationDone(done) => self.operation_done.send(done).unwrap_or(0),
            NativeEvent::SessionDestroyed => self.session_destroyed.send(()).unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::NativeErrorKind;
    use serde_json::json;

    #[test]
    fn test_wire_format() {
        let id = Uuid::new_v4();
        let event = NativeEvent::OperationDone(OperationDone {
            uuid: id,
            result: Some("100".to_string()),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["OperationDone"]["uuid"], id.to_string());
        assert_eq!(json["OperationDone"]["result"], "100");

        let destroyed = serde_json::to_value(NativeEvent::SessionDestroyed).unwrap();
        assert_eq!(destroyed, json!("SessionDestroyed"));
    }

    #[test]
    fn test_parse_known_events() {
        let id = Uuid::new_v4();
        match IngressEvent::parse(json!({ "OperationStarted": id })) {
            IngressEvent::Known(event) => {
                assert_eq!(event.kind(), EventKind::OperationStarted);
                assert_eq!(event.operation(), Some(id));
            }
            other => panic!("unexpected: {:?}", other),
        }

        let payload = json!({
            "OperationError": {
                "uuid": id,
                "error": { "severity": "WARNING", "kind": "Interrupted" }
            }
        });
        match IngressEvent::parse(payload) {
            IngressEvent::Known(NativeEvent::OperationError { uuid, error }) => {
                assert_eq!(uuid, id);
                assert_eq!(error.kind, NativeErrorKind::Interrupted);
            }
            other => panic!("unexpected: {:?}", other),
        }

        // result is optional
        match IngressEvent::parse(json!({ "OperationDone": { "uuid": id } })) {
            IngressEvent::Known(NativeEvent::OperationDone(done)) => assert!(done.result.is_none()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_unrecognized() {
        for payload in [
            json!({ "Unknown": 1 }),
            json!(42),
            json!({ "OperationDone": { "uuid": "not-a-uuid" } }),
        ] {
            assert!(matches!(
                IngressEvent::parse(payload),
                IngressEvent::Unrecognized { .. }
            ));
        }
    }

    #[tokio::test]
    async fn test_publish_by_kind() {
        let events = SessionEvents::new(16);
        let mut started = events.operation_started();
        let mut done = events.operation_done();
        let id = Uuid::new_v4();

        assert_eq!(events.publish(NativeEvent::OperationStarted(id)), 1);
        assert_eq!(started.recv().await.unwrap(), id);
        assert!(done.try_recv().is_err());

        drop(started);
        assert_eq!(events.publish(NativeEvent::OperationStarted(id)), 0);
    }

    #[tokio::test]
    async fn test_publish_every_kind() {
        let events = SessionEvents::new(4);
        let mut errors = events.session_error();
        let mut failed = events.operation_error();
        let mut destroyed = events.session_destroyed();
        let mut processing = events.operation_processing();
        let mut done = events.operation_done();
        let id = Uuid::new_v4();
        let err = NativeError::error(NativeErrorKind::Io, "io");

        assert_eq!(events.publish(NativeEvent::SessionError(err.clone())), 1);
        assert_eq!(
            events.publish(NativeEvent::OperationError {
                uuid: id,
                error: err.clone(),
            }),
            1
        );
        assert_eq!(events.publish(NativeEvent::OperationProcessing(id)), 1);
        assert_eq!(
            events.publish(NativeEvent::OperationDone(OperationDone {
                uuid: id,
                result: None,
            })),
            1
        );
        assert_eq!(events.publish(NativeEvent::SessionDestroyed), 1);
        // no subscribers for started
        assert_eq!(events.publish(NativeEvent::OperationStarted(id)), 0);

        assert_eq!(errors.recv().await.unwrap(), err);
        assert_eq!(failed.recv().await.unwrap().uuid, id);
        assert_eq!(processing.recv().await.unwrap(), id);
        assert_eq!(done.recv().await.unwrap().uuid, id);
        destroyed.recv().await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_past_capacity() {
        let events = SessionEvents::new(2);
        let mut started = events.operation_started();
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            events.publish(NativeEvent::OperationStarted(*id));
        }

        assert!(matches!(
            started.recv().await,
            Err(broadcast::error::RecvError::Lagged(1))
        ));
        assert_eq!(started.recv().await.unwrap(), ids[1]);
        assert_eq!(started.recv().await.unwrap(), ids[2]);
    }
}
