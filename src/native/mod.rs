//! Native Engine Contract
//!
//! The processing engine is an opaque collaborator. Calls are accepted
//! asynchronously and their completion is reported through the single
//! event sink registered with [`NativeEngine::init`].

pub mod library;
pub mod local;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

pub use library::{BundledPlugin, ExternalLibrary, LibraryRegistry, LibraryResolver};
pub use local::LocalEngine;

/// Ingress channel for raw, loosely-typed native payloads
pub type EventSink = mpsc::UnboundedSender<serde_json::Value>;

/// Severity of a native error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Warning,
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Warning => write!(f, "WARNING"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NativeErrorKind {
    /// The file in question does not exist
    FileNotFound,
    /// The file type is not currently supported
    UnsupportedFileType,
    ComputationFailed,
    Configuration,
    Interrupted,
    OperationSearch,
    NotYetImplemented,
    ChannelError,
    Io,
    Grabber,
}

/// Error shape shared by every native call and error event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeError {
    pub severity: Severity,
    pub kind: NativeErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl NativeError {
    pub fn new(severity: Severity, kind: NativeErrorKind, message: Option<String>) -> Self {
        Self {
            severity,
            kind,
            message,
        }
    }

    /// Error-level failure with a message
    pub fn error(kind: NativeErrorKind, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, kind, Some(message.into()))
    }

    /// Warning-level failure with a message
    pub fn warning(kind: NativeErrorKind, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, kind, Some(message.into()))
    }

    pub fn channel(message: impl Into<String>) -> Self {
        Self::error(NativeErrorKind::ChannelError, message)
    }
}

impl std::fmt::Display for NativeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{} {:?}: {}", self.severity, self.kind, message),
            None => write!(f, "{} {:?}", self.severity, self.kind),
        }
    }
}

impl std::error::Error for NativeError {}

/// Native engine trait - defines the calls a session can forward to the engine
///
/// Every operation call only confirms that the engine accepted the work.
/// The outcome arrives later through the event sink, correlated by the
/// operation uuid passed in.
#[async_trait]
pub trait NativeEngine: Send + Sync {
    /// Identity of the session this engine instance serves
    fn uuid(&self) -> Uuid;

    /// Register the event sink; called exactly once per engine
    async fn init(&self, sink: EventSink) -> Result<(), NativeError>;

    /// Best-effort request to abort `target`. Acknowledged with an
    /// OperationDone event for `operation`.
    fn abort(&self, operation: Uuid, target: Uuid) -> Result<(), NativeError>;

    /// Tear the session down
    async fn stop(&self, operation: Uuid) -> Result<(), NativeError>;

    async fn set_debug(&self, debug: bool) -> Result<(), NativeError>;

    /// JSON encoded statistics of finished operations
    async fn operations_stat(&self) -> Result<String, NativeError>;

    async fn sleep(&self, operation: Uuid, ms: u64) -> Result<(), NativeError>;

    /// Cancellable computation resolving with `a + b` after a short delay
    async fn delayed_sum(&self, operation: Uuid, a: i64, b: i64) -> Result<(), NativeError>;

    async fn external_call_lib(
        &self,
        operation: Uuid,
        path: String,
        a: u64,
        b: u64,
        lines: Vec<String>,
    ) -> Result<(), NativeError>;

    /// Fails the engine's state loop; used for diagnostics only.
    /// `operation` is reported done before the session goes down.
    async fn trigger_state_error(&self, operation: Uuid) -> Result<(), NativeError>;

    /// Fails the engine's tracker loop; used for diagnostics only
    async fn trigger_tracker_error(&self, operation: Uuid) -> Result<(), NativeError>;

    /// Engine type name for logs
    fn engine_type(&self) -> &'static str;
}
