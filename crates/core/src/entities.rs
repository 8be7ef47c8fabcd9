//! Entity records mirrored between the remote store and the local store.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::errors::{Error, Result};

/// Prefix carried by every client-generated identifier.
pub const TEMP_ID_PREFIX: &str = "tmp_";

/// Field holding the identifier in every record.
pub const ID_FIELD: &str = "id";

/// Column values of a record, without its identifier.
pub type Payload = Map<String, Value>;

/// Which identifier scheme an [`EntityId`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdScheme {
    Server,
    Temporary,
}

/// Identifier of an entity: either issued by the remote store or a temporary
/// placeholder minted while offline.
///
/// Temporary ids are `tmp_` followed by a UUIDv7, so sorting them lexically
/// recovers creation order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Mint a fresh temporary identifier.
    pub fn temporary() -> Self {
        Self(format!("{}{}", TEMP_ID_PREFIX, Uuid::now_v7()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn scheme(&self) -> IdScheme {
        if self.0.starts_with(TEMP_ID_PREFIX) {
            IdScheme::Temporary
        } else {
            IdScheme::Server
        }
    }

    pub fn is_temporary(&self) -> bool {
        self.scheme() == IdScheme::Temporary
    }

    /// Unix milliseconds at which a temporary id was minted.
    pub fn created_at_millis(&self) -> Option<u64> {
        let raw = self.0.strip_prefix(TEMP_ID_PREFIX)?;
        let (secs, nanos) = Uuid::parse_str(raw).ok()?.get_timestamp()?.to_unix();
        Some(secs * 1_000 + u64::from(nanos) / 1_000_000)
    }

    /// Parse an id from a JSON value. Remote stores may hand out numeric keys.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Collections that participate in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Transaction,
    Category,
    PaymentMethod,
    BudgetEntry,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Category,
        EntityKind::PaymentMethod,
        EntityKind::Transaction,
        EntityKind::BudgetEntry,
    ];

    /// Table name used both remotely and as the local store key.
    pub fn collection(&self) -> &'static str {
        match self {
            Self::Transaction => "transactions",
            Self::Category => "categories",
            Self::PaymentMethod => "payment_methods",
            Self::BudgetEntry => "budget_entries",
        }
    }

    pub fn from_collection(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.collection() == name)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.collection())
    }
}

/// A domain record: an identifier plus arbitrary columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    #[serde(flatten)]
    pub fields: Payload,
}

impl Entity {
    pub fn new(id: EntityId, mut fields: Payload) -> Self {
        fields.remove(ID_FIELD);
        Self { id, fields }
    }

    /// Build an entity from a row returned by a store.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut fields) = value else {
            return Err(Error::invalid_entity("record is not a JSON object"));
        };
        let id = fields
            .remove(ID_FIELD)
            .as_ref()
            .and_then(EntityId::from_value)
            .ok_or_else(|| Error::invalid_entity("record has no usable id"))?;
        Ok(Self { id, fields })
    }

    pub fn to_value(&self) -> Value {
        let mut row = self.fields.clone();
        row.insert(ID_FIELD.to_string(), Value::String(self.id.to_string()));
        Value::Object(row)
    }

    /// Serialize a typed model carrying an `id` field.
    pub fn from_model<T: Serialize>(model: &T) -> Result<Self> {
        Self::from_value(serde_json::to_value(model)?)
    }

    pub fn to_model<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.to_value())?)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        if field == ID_FIELD {
            return None;
        }
        self.fields.get(field)
    }

    /// Merge a partial payload into this entity. The id is never patched.
    pub fn apply_patch(&mut self, patch: &Payload) {
        for (key, value) in patch {
            if key != ID_FIELD {
                self.fields.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Serialize a typed model into a payload, dropping its identifier.
pub fn payload_from_model<T: Serialize>(model: &T) -> Result<Payload> {
    match serde_json::to_value(model)? {
        Value::Object(mut fields) => {
            fields.remove(ID_FIELD);
            Ok(fields)
        }
        _ => Err(Error::invalid_entity("model does not serialize to an object")),
    }
}
