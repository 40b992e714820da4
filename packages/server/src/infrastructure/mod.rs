//! Infrastructure 層：プレゼンスレジストリ、MessageStore 実装、行区切りの通信路

pub mod registry;
pub mod store;
pub mod transport;
