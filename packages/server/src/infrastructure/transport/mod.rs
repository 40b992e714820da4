//! 任意の `AsyncRead`/`AsyncWrite` 上の行指向の通信路
//!
//! ## 実装
//!
//! - `framed`: `tokio_util::codec::LinesCodec` を使った実装

pub mod framed;

pub use framed::{FramedLineSink, LineReader};
