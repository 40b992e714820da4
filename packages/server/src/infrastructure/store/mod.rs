//! MessageStore 実装
//!
//! - `inmemory`: プロセス内のみのストア。テストと `--in-memory` で使う
//! - `sqlite`: `rusqlite` による永続ストア

pub mod inmemory;
pub mod sqlite;

pub use inmemory::InMemoryMessageStore;
pub use sqlite::SqliteMessageStore;

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};

/// 書き込み時刻を払い出す
///
/// 時刻はマイクロ秒に切り詰められ、時計が止まっていても巻き戻っても
/// 書き込み順に狭義単調増加する。
#[derive(Debug, Default)]
pub(crate) struct TimestampSequencer {
    last: Option<DateTime<Utc>>,
}

impl TimestampSequencer {
    pub(crate) fn starting_at(last: Option<DateTime<Utc>>) -> Self {
        Self { last }
    }

    pub(crate) fn next(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let now = now.trunc_subsecs(6);
        let stamp = match self.last {
            Some(last) if last >= now => last + TimeDelta::microseconds(1),
            _ => now,
        };
        self.last = Some(stamp);
        stamp
    }
}
