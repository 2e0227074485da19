/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Result as RusqliteResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Typesafe way to manage timestamps: milliseconds since the unix epoch.
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize, Default,
)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn now() -> Self {
        SystemTime::now().into()
    }

    #[inline]
    pub fn as_millis(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn as_millis_i64(self) -> i64 {
        self.0 as i64
    }
}

impl From<SystemTime> for Timestamp {
    #[inline]
    fn from(st: SystemTime) -> Self {
        let d = st.duration_since(UNIX_EPOCH).unwrap_or_default();
        Timestamp(d.as_secs() * 1000 + u64::from(d.subsec_millis()))
    }
}

impl From<u64> for Timestamp {
    #[inline]
    fn from(ts: u64) -> Self {
        Timestamp(ts)
    }
}

impl From<Timestamp> for u64 {
    #[inline]
    fn from(ts: Timestamp) -> Self {
        ts.0
    }
}

impl fmt::Display for Timestamp {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ToSql for Timestamp {
    fn to_sql(&self) -> RusqliteResult<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0 as i64))
    }
}

impl FromSql for Timestamp {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_i64().map(|v| Timestamp(v.max(0) as u64))
    }
}

/// Hands out envelope timestamps that never go backwards within one kernel
/// lifetime, even if the wall clock does.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: u64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the clock no earlier than `floor` (the newest persisted
    /// envelope), so a restart can't mint timestamps that sort before it.
    pub fn starting_at(floor: Timestamp) -> Self {
        MonotonicClock { last: floor.0 }
    }

    pub fn next(&mut self) -> Timestamp {
        let now = Timestamp::now().0;
        self.last = self.last.max(now);
        Timestamp(self.last)
    }
}

/// A point-in-time view of the scheduler, published on the fan-out bus and
/// returned by `get_sync_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub namespace: String,
    pub is_syncing: bool,
    pub pending_count: u32,
    pub failed_count: u32,
    pub is_online: bool,
    #[serde(default)]
    pub last_sync_at: Option<Timestamp>,
}
