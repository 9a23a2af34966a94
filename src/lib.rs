// logbridge - cancelable operations bridged to a native log-processing engine

// Declare modules
pub mod cli;
pub mod config;
pub mod error;
pub mod native;
pub mod operations;
pub mod session;

pub use config::SessionConfig;
pub use error::{ConfigError, OperationError, SessionError};
pub use native::{NativeEngine, NativeError};
pub use operations::{OperationHandle, Outcome};
pub use session::{Session, SessionManager};

/// Command line entry point
pub fn run() -> anyhow::Result<()> {
    cli::run()
}
