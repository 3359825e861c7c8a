//! NDJSON control plane: quotes, snapshot discovery, fundamentals and
//! arbitration of the single IBKR TWS session.

pub mod arbitration;
mod error;
mod handlers;
pub mod lines;
pub mod protocol;
pub mod server;

pub use arbitration::{ConnId, Ownership};
pub use error::ServerError;
pub use protocol::{ErrorCode, PROTOCOL_VERSION};
pub use server::{ArbitrationListener, Server, ServerHandle, ServerSettings, Services};
