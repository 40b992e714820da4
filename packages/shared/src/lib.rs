//! Utilities shared by the Hiroba server binary and its library crate.

pub mod logger;
pub mod time;
