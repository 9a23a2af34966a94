//! Operations Module
//!
//! Cancelable operations bridged to the native engine:
//! - `OperationHandle` settles exactly once (done, error or canceled)
//! - `OperationExecutor` adapts an accept-only native call into a handle
//! - `OperationRegistry` tracks in-flight identities and sequences

pub mod executor;
pub mod handle;
pub mod registry;
pub mod types;

pub use executor::OperationExecutor;
pub use handle::{OperationHandle, Outcome};
pub use registry::{Canceler, OperationRegistry};
pub use types::{OperationInfo, OperationOptions, OperationStat};
