//! Non-blocking HTTP client engine pumped from a host tick.
//!
//! Requests run on per-client worker pools and reuse pooled sessions per host. Their
//! completions are only delivered from [`ClientManager::run_frame`] (or
//! [`RequestEngine::run_frame`] when an engine is used directly), so callbacks always
//! run on the host thread.

pub mod arena;
pub mod clock;
pub mod config;
pub mod control;
pub mod engine;
pub mod errors;
pub mod logger;
pub mod manager;
pub mod options;
mod pool;
pub mod response;
pub mod session_cache;
#[cfg(test)]
mod testing;
pub mod transport;

pub use arena::{ClientId, OptionsId, RequestId};
pub use config::{Config, EngineConfig};
pub use control::{RequestControl, RequestProgress};
pub use engine::RequestEngine;
pub use errors::ManagerError;
pub use manager::ClientManager;
pub use options::{EndOfLifePolicy, OptionsBuilder, RequestMethod, RequestOptions};
pub use response::{ErrorCode, Response, TransferError};
