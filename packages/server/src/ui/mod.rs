//! UI layer: TCP listener, per-connection sessions and the HTTP status API.

mod handler;
mod server;
mod signal;
pub mod state;

pub use handler::HandshakeError;
pub use server::{RunningServer, Server, ServerError};
