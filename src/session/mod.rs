//! Session Management Module
//!
//! One session per native engine instance:
//! - Per-session event stream with typed broadcast notifications
//! - Bounded, idempotent teardown
//! - Lock-free concurrent session handling (DashMap)

pub mod controller;
pub mod events;
pub mod manager;
pub mod provider;
pub mod results;
pub mod state;

pub use controller::Session;
pub use events::{EventKind, IngressEvent, NativeEvent, OperationDone, OperationErrorEvent, SessionEvents};
pub use manager::SessionManager;
pub use provider::EventProvider;
pub use results::ExternalCallResult;
pub use state::{SessionInfo, SessionState, SessionStatus};
