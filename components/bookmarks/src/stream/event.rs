/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Validation and translation of inbound server events into log
//! operations. Unrecognized event types are tolerated (the protocol grows
//! without breaking old clients); malformed events of known types are
//! reported as errors so the caller can log and drop them.

use crate::error::{Error, Result};
use crate::guid::Guid;
use crate::oplog::Operation;
use crate::tree::NodeKind;
use serde_json::Value;

/// One parsed inbound event: the stream's event name plus its JSON
/// payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerEvent {
    pub kind: String,
    pub id: Option<String>,
    pub payload: Value,
}

/// A field-level update to one node; the kernel merges it with the node's
/// current state and children before applying (the wire only carries the
/// node's own fields).
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct NodeUpdate {
    pub id: Guid,
    pub kind: NodeKind,
    pub parent_id: Option<Guid>,
    pub title: Option<String>,
    pub url: Option<String>,
    pub is_open: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Translated {
    Op(Operation),
    Update(NodeUpdate),
}

fn required_str(payload: &Value, field: &str) -> Result<String> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| Error::BadArgument(format!("event is missing {:?}", field)))
}

fn optional_str(payload: &Value, field: &str) -> Option<String> {
    payload.get(field).and_then(Value::as_str).map(String::from)
}

fn optional_bool(payload: &Value, field: &str) -> Option<bool> {
    payload.get(field).and_then(Value::as_bool)
}

fn optional_index(payload: &Value, field: &str) -> Option<usize> {
    payload.get(field).and_then(Value::as_u64).map(|v| v as usize)
}

/// Converts a validated event into something applicable. `Ok(None)` means
/// the type is unknown and should be silently tolerated.
pub(crate) fn translate(event: &ServerEvent) -> Result<Option<Translated>> {
    let p = &event.payload;
    let translated = match event.kind.as_str() {
        "bookmark_created" => Translated::Op(Operation::CreateBookmark {
            id: required_str(p, "id")?.into(),
            parent_id: optional_str(p, "parentId").map(Guid::from),
            title: required_str(p, "title")?,
            url: required_str(p, "url")?,
            index: optional_index(p, "index"),
        }),
        "folder_created" => Translated::Op(Operation::CreateFolder {
            id: required_str(p, "id")?.into(),
            parent_id: optional_str(p, "parentId").map(Guid::from),
            title: required_str(p, "title")?,
            is_open: optional_bool(p, "isOpen").unwrap_or(false),
            // Children of a server-created folder arrive separately.
            is_loaded: false,
            index: optional_index(p, "index"),
        }),
        "bookmark_updated" => Translated::Update(NodeUpdate {
            id: required_str(p, "id")?.into(),
            kind: NodeKind::Bookmark,
            parent_id: optional_str(p, "parentId").map(Guid::from),
            title: optional_str(p, "title"),
            url: optional_str(p, "url"),
            is_open: None,
        }),
        "folder_updated" => Translated::Update(NodeUpdate {
            id: required_str(p, "id")?.into(),
            kind: NodeKind::Folder,
            parent_id: optional_str(p, "parentId").map(Guid::from),
            title: optional_str(p, "title"),
            url: None,
            is_open: optional_bool(p, "isOpen"),
        }),
        "bookmark_deleted" | "folder_deleted" => Translated::Op(Operation::RemoveNode {
            node_id: required_str(p, "id")?.into(),
        }),
        "item_moved" => Translated::Op(Operation::MoveNode {
            node_id: required_str(p, "id")?.into(),
            to_folder_id: required_str(p, "parentId")?.into(),
            index: optional_index(p, "index"),
        }),
        "folder_toggled" => Translated::Op(Operation::ToggleFolder {
            folder_id: required_str(p, "id")?.into(),
            open: Some(
                optional_bool(p, "isOpen")
                    .ok_or_else(|| Error::BadArgument("event is missing \"isOpen\"".into()))?,
            ),
        }),
        other => {
            log::debug!("ignoring unrecognized event type {:?}", other);
            return Ok(None);
        }
    };
    Ok(Some(translated))
}
