/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::guid::Guid;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // Validation errors. These are the only failures surfaced to API
    // callers; they mean the operation was rejected and no envelope was
    // appended.
    #[error("Invalid argument: {0}")]
    BadArgument(String),

    #[error("No node with id {0}")]
    NodeMissing(Guid),

    #[error("Node {0} is not a folder")]
    NotAFolder(Guid),

    #[error("Moving {0} into {1} would create a cycle")]
    CycleForbidden(Guid, Guid),

    #[error("An envelope with id {0} already exists")]
    DuplicateId(Guid),

    // Storage errors. The in-memory tree stays authoritative; these are
    // logged and retried on the next write.
    #[error("Error executing SQL: {0}")]
    SqlError(#[from] rusqlite::Error),

    #[error("Database version {0} is newer than this client supports")]
    VersionMismatch(u32),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    // Transport errors. Handled by the stream state machine or the retry
    // table; only `sync_operation_immediately` lets callers observe them,
    // and then only as `false`.
    #[error("Network error: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("Request timed out")]
    OutboundTimeout,

    #[error("Unexpected HTTP status {0} from {1}")]
    UnexpectedStatus(u16, String),

    #[error("Event stream closed: {0}")]
    StreamError(String),

    // Protocol and serialization errors; malformed inbound events are
    // logged and dropped before they can surface here.
    #[error("Error parsing JSON data: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Error parsing URL: {0}")]
    UrlParseError(#[from] url::ParseError),

    #[error("Invalid order key: {0}")]
    OrderKeyError(#[from] fracdex::Error),
}

impl Error {
    /// True for errors of the validation class, which callers may match on;
    /// everything else is reconciled internally.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::BadArgument(_)
                | Error::NodeMissing(_)
                | Error::NotAFolder(_)
                | Error::CycleForbidden(_, _)
                | Error::DuplicateId(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
