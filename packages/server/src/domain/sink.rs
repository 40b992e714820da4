//! 接続の送信側

use async_trait::async_trait;

use super::TransportError;

/// 1 つの接続に改行区切りのテキスト行を書き込む
///
/// レジストリとブロードキャストは共有参照を持つだけで、
/// 閉じるのは sink を作ったセッションの責務。
#[async_trait]
pub trait LineSink: Send + Sync {
    /// 1 行書き込んで flush する
    async fn send_line(&self, line: &str) -> Result<(), TransportError>;

    /// 複数行を 1 ブロックとして書き込む。途中に他の行は割り込まない
    async fn send_block(&self, lines: &[String]) -> Result<(), TransportError>;

    /// flush して接続の書き込み側を閉じる
    async fn close(&self) -> Result<(), TransportError>;
}
