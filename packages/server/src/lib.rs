//! Line-oriented TCP chat server.
//!
//! Every connection identifies itself with one handshake line, receives the
//! public history followed by `HISTORY_END`, and then exchanges public and
//! `/pm` private messages with everyone else who is online.

// layers
pub mod domain;
pub mod infrastructure;
pub mod ui;
pub mod usecase;

pub mod config;
pub mod protocol;

#[cfg(test)]
mod test_support;
