/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use rand::Rng;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The stable opaque id of a node or an operation envelope.
///
/// Freshly minted ids are 12 base64url characters, which is plenty of
/// entropy for collision resistance within one namespace; ids handed to us
/// by the service are accepted as-is as long as they're printable ASCII.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Guid(String);

const BASE64URL_CHARS: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Ids longer than this are rejected outright.
pub const MAX_GUID_LEN: usize = 64;

impl Guid {
    /// Mints a fresh random id.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let bytes: Vec<u8> = (0..12)
            .map(|_| BASE64URL_CHARS[rng.gen_range(0..BASE64URL_CHARS.len())])
            .collect();
        Guid(String::from_utf8(bytes).expect("alphabet is ascii"))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn into_string(self) -> String {
        self.0
    }

    /// Whether this id is acceptable on the wire: non-empty, bounded,
    /// printable ASCII.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= MAX_GUID_LEN
            && self.0.bytes().all(|b| (b' '..=b'~').contains(&b))
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({:?})", self.0)
    }
}

impl From<&str> for Guid {
    fn from(s: &str) -> Self {
        Guid(s.into())
    }
}

impl From<String> for Guid {
    fn from(s: String) -> Self {
        Guid(s)
    }
}

impl From<Guid> for String {
    fn from(g: Guid) -> Self {
        g.0
    }
}

impl AsRef<str> for Guid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for Guid {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for Guid {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for Guid {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl ToSql for Guid {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Guid {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()
            .map(Guid::from)
            .map_err(|_| FromSqlError::InvalidType)
    }
}
