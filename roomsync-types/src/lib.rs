//! Shared data model for RoomSync.
//!
//! A **session** is one day's worth of tracked records (one replicated
//! unit on the remote store); an **entity** is a single record within a
//! session (e.g. one guest). Entity fields are independently-writable
//! JSON values so the presentation layer can add field kinds (status
//! enums, notes, counters, nested note lists) without a schema change
//! here.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Globally unique, device-stable session identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

/// Entity identifier, unique within its session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

/// Identifier of one connected device (one engine instance).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            /// Generates a fresh random id.
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// Wraps an existing id (e.g. parsed off the wire).
            pub fn from_string(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(SessionId);
string_id!(EntityId);
string_id!(DeviceId);

/// A field-level patch: field name to new JSON value.
pub type EntityPatch = BTreeMap<String, Value>;

/// One tracked record within a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    /// Independently-writable fields, keyed by field name.
    #[serde(default)]
    pub fields: BTreeMap<String, Value>,
    /// Raw source text this entity was ingested from, used to corroborate
    /// enrichment refinements. Absent for hand-created entities.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_text: Option<String>,
    /// Last-writer metadata (audit only, never consulted by the merge).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<DeviceId>,
}

impl Entity {
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            fields: BTreeMap::new(),
            source_text: None,
            updated_at: None,
            updated_by: None,
        }
    }

    /// Applies a patch in place, returning the previous value of every
    /// field that actually changed (for the audit trail).
    pub fn apply_patch(&mut self, patch: &EntityPatch) -> Vec<(String, Option<Value>)> {
        let mut changed = Vec::new();
        for (field, value) in patch {
            let old = self.fields.get(field).cloned();
            if old.as_ref() == Some(value) {
                continue;
            }
            self.fields.insert(field.clone(), value.clone());
            changed.push((field.clone(), old));
        }
        changed
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// One day's worth of entities, the top-level replicated unit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub label: String,
    pub date: NaiveDate,
    /// Ordered entity list. Order is part of the replicated state; the
    /// remote copy's order wins on merge.
    #[serde(default)]
    pub entities: Vec<Entity>,
    /// Epoch milliseconds of the last mutation, used by the full-replace
    /// last-write-wins guard.
    pub last_modified: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<DeviceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified_by: Option<DeviceId>,
}

impl Session {
    pub fn new(label: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            id: SessionId::new(),
            label: label.into(),
            date,
            entities: Vec::new(),
            last_modified: now_ms(),
            locked_at: None,
            locked_by: None,
            verified_at: None,
            verified_by: None,
        }
    }

    pub fn entity(&self, id: &EntityId) -> Option<&Entity> {
        self.entities.iter().find(|e| &e.id == id)
    }

    pub fn entity_mut(&mut self, id: &EntityId) -> Option<&mut Entity> {
        self.entities.iter_mut().find(|e| &e.id == id)
    }

    /// Replaces the entity with the same id, or appends it.
    pub fn upsert_entity(&mut self, entity: Entity) {
        match self.entity_mut(&entity.id) {
            Some(slot) => *slot = entity,
            None => self.entities.push(entity),
        }
    }

    pub fn remove_entity(&mut self, id: &EntityId) -> Option<Entity> {
        let idx = self.entities.iter().position(|e| &e.id == id)?;
        Some(self.entities.remove(idx))
    }

    /// Bumps `last_modified`.
    pub fn touch(&mut self, now_ms: i64) {
        self.last_modified = now_ms;
    }

    pub fn is_locked(&self) -> bool {
        self.locked_at.is_some()
    }
}

/// One audit-trail record: who changed what, when.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub session_id: SessionId,
    pub entity_id: EntityId,
    pub field: String,
    pub old_value: Option<Value>,
    pub new_value: Value,
    pub actor: DeviceId,
    pub at: i64,
}

/// Per-device presence record, stored under `sessionId/deviceId` on the
/// remote store and auto-removed on ungraceful disconnect.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub session_id: SessionId,
    pub device_id: DeviceId,
    pub joined_at: i64,
    pub last_seen: i64,
}

/// Wall-clock epoch milliseconds.
pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
