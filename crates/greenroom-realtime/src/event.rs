//! Row-level change events and the feed scoping that selects them.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RealtimeError, RealtimeResult};

/// Column-equality filter narrowing a change feed to a slice of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedFilter {
    pub column: String,
    pub value: String,
}

/// Identifies one change-feed subscription: a table, optionally filtered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedScope {
    pub table: String,
    pub filter: Option<FeedFilter>,
}

impl FeedScope {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: None,
        }
    }

    pub fn filtered(
        table: impl Into<String>,
        column: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            filter: Some(FeedFilter {
                column: column.into(),
                value: value.into(),
            }),
        }
    }

    /// Bus topic this scope subscribes to.
    pub fn topic(&self) -> String {
        feed_bus::topic::changes(
            &self.table,
            self.filter
                .as_ref()
                .map(|f| (f.column.as_str(), f.value.as_str())),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

/// One delivered change: the full new row for inserts and updates, the old
/// row (or at least its id) for deletes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_row: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_row: Option<Value>,
}

impl ChangeEvent {
    pub fn insert(new_row: Value) -> Self {
        Self {
            kind: ChangeKind::Insert,
            new_row: Some(new_row),
            old_row: None,
        }
    }

    pub fn update(new_row: Value) -> Self {
        Self {
            kind: ChangeKind::Update,
            new_row: Some(new_row),
            old_row: None,
        }
    }

    pub fn delete(old_row: Value) -> Self {
        Self {
            kind: ChangeKind::Delete,
            new_row: None,
            old_row: Some(old_row),
        }
    }

    /// Row snapshot carrying the entity for this event kind.
    pub fn row(&self) -> Option<&Value> {
        match self.kind {
            ChangeKind::Insert | ChangeKind::Update => self.new_row.as_ref(),
            ChangeKind::Delete => self.old_row.as_ref(),
        }
    }

    /// The affected entity id, if the payload carries one. String ids pass
    /// through; numeric ids are rendered in decimal, matching how row
    /// filters coerce non-string columns.
    pub fn entity_id(&self) -> Option<String> {
        self.row()
            .and_then(|row| row.get("id"))
            .and_then(|id| match id {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    }

    pub fn encode(&self) -> RealtimeResult<Bytes> {
        let envelope = serde_json::json!({
            "type": self.kind.as_str(),
            "payload": {
                "new": self.new_row,
                "old": self.old_row,
            }
        });
        serde_json::to_vec(&envelope)
            .map(Bytes::from)
            .map_err(|err| RealtimeError::Transport(format!("serialize change failed: {err}")))
    }

    pub fn decode(payload: &[u8]) -> RealtimeResult<Self> {
        let envelope: Envelope = serde_json::from_slice(payload)
            .map_err(|err| RealtimeError::Transport(format!("invalid change envelope: {err}")))?;
        let kind = match envelope.kind.as_str() {
            "insert" => ChangeKind::Insert,
            "update" => ChangeKind::Update,
            "delete" => ChangeKind::Delete,
            other => {
                return Err(RealtimeError::Transport(format!(
                    "unexpected change type {other}"
                )))
            }
        };
        Ok(Self {
            kind,
            new_row: envelope.payload.new,
            old_row: envelope.payload.old,
        })
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    payload: EnvelopePayload,
}

#[derive(Debug, Deserialize)]
struct EnvelopePayload {
    #[serde(default)]
    new: Option<Value>,
    #[serde(default)]
    old: Option<Value>,
}
