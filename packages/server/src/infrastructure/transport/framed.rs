//! `LinesCodec` で行単位に区切った読み込み側・書き込み側

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::Mutex,
};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::domain::{LineSink, TransportError};

/// 接続の書き込み側（UTF-8 の行単位）
///
/// 書き込みは内部の Mutex で直列化され、並行するブロードキャストの行が混ざらない。
pub struct FramedLineSink<W> {
    writer: Mutex<FramedWrite<W, LinesCodec>>,
}

impl<W> FramedLineSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W, max_line_length: usize) -> Self {
        Self {
            writer: Mutex::new(FramedWrite::new(
                writer,
                LinesCodec::new_with_max_length(max_line_length),
            )),
        }
    }
}

#[async_trait]
impl<W> LineSink for FramedLineSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send_line(&self, line: &str) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer.send(line).await?;
        Ok(())
    }

    async fn send_block(&self, lines: &[String]) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        for line in lines {
            writer.feed(line.as_str()).await?;
        }
        SinkExt::<&str>::flush(&mut *writer).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        SinkExt::<&str>::close(&mut *writer).await?;
        Ok(())
    }
}

/// 接続の読み込み側（1 フレーム 1 行）
pub struct LineReader<R> {
    lines: FramedRead<R, LinesCodec>,
    idle_timeout: Option<Duration>,
}

impl<R> LineReader<R>
where
    R: AsyncRead + Unpin,
{
    /// `idle_timeout` は 1 回の読み込みの待ち時間の上限。`None` なら無制限
    pub fn new(reader: R, max_line_length: usize, idle_timeout: Option<Duration>) -> Self {
        Self {
            lines: FramedRead::new(reader, LinesCodec::new_with_max_length(max_line_length)),
            idle_timeout,
        }
    }

    /// 次の行を読み込む。`Ok(None)` は相手が接続を閉じたことを表す
    pub async fn next_line(&mut self) -> Result<Option<String>, TransportError> {
        let next = match self.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, self.lines.next())
                .await
                .map_err(|_| TransportError::Idle(limit))?,
            None => self.lines.next().await,
        };

        next.transpose().map_err(TransportError::from)
    }
}
