//! Connection and HTTP handlers.

mod http;
mod session;

pub use http::{health_check, online_users};
pub use session::{HandshakeError, handle_connection};
