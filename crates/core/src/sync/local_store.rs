//! Persisted mirror of the remote collections.
//!
//! The store only exposes whole-collection reads and writes. Callers compute the
//! next collection with the helpers below and replace it in one `put`.

use std::sync::Arc;

use serde_json::Value;

use crate::entities::{Entity, EntityId, EntityKind, Payload};
use crate::errors::{Error, Result};

use super::persistence::KeyValueStore;
use super::query::Query;

const COLLECTION_KEY_PREFIX: &str = "collection:";

#[derive(Clone)]
pub struct LocalStore {
    kv: Arc<dyn KeyValueStore>,
}

impl LocalStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    fn key(kind: EntityKind) -> String {
        format!("{}{}", COLLECTION_KEY_PREFIX, kind.collection())
    }

    pub async fn get(&self, kind: EntityKind) -> Result<Vec<Entity>> {
        match self.kv.get(&Self::key(kind)).await? {
            None => Ok(Vec::new()),
            Some(value) => serde_json::from_value(value).map_err(|e| {
                Error::local(format!("Corrupt local collection '{}': {}", kind, e))
            }),
        }
    }

    /// Replace a whole collection.
    pub async fn put(&self, kind: EntityKind, entities: &[Entity]) -> Result<()> {
        let value = serde_json::to_value(entities)?;
        self.kv.set(&Self::key(kind), value).await
    }

    pub async fn find(&self, kind: EntityKind, id: &EntityId) -> Result<Option<Entity>> {
        Ok(self.get(kind).await?.into_iter().find(|e| &e.id == id))
    }
}

/// Replace the entity with the same id in place, or append it.
pub fn upsert(entities: &mut Vec<Entity>, entity: Entity) {
    match entities.iter_mut().find(|e| e.id == entity.id) {
        Some(existing) => *existing = entity,
        None => entities.push(entity),
    }
}

pub fn remove(entities: &mut Vec<Entity>, id: &EntityId) -> Option<Entity> {
    let position = entities.iter().position(|e| &e.id == id)?;
    Some(entities.remove(position))
}

/// Swap the entity carrying `temp_id` for its server copy.
///
/// The server copy takes the temporary entity's position. If the server id is
/// already present (a read mirrored it in earlier) that copy is updated and the
/// temporary one dropped, so the entity never appears twice. Returns false when
/// no entity carries `temp_id`.
pub fn replace_id(entities: &mut Vec<Entity>, temp_id: &EntityId, server: Entity) -> bool {
    let Some(position) = entities.iter().position(|e| &e.id == temp_id) else {
        return false;
    };
    if let Some(existing) = entities.iter_mut().find(|e| e.id == server.id) {
        *existing = server;
        entities.retain(|e| &e.id != temp_id);
    } else {
        entities[position] = server;
    }
    true
}

/// Merge a partial payload into the entity with `id`.
pub fn patch(entities: &mut [Entity], id: &EntityId, patch: &Payload) -> Option<Entity> {
    let entity = entities.iter_mut().find(|e| &e.id == id)?;
    entity.apply_patch(patch);
    Some(entity.clone())
}

/// Set `field` to `new_value` on every entity where it equals `old_value`.
pub fn rename_field(
    entities: &mut [Entity],
    field: &str,
    old_value: &Value,
    new_value: &Value,
) -> usize {
    let mut renamed = 0;
    for entity in entities.iter_mut() {
        if entity.fields.get(field) == Some(old_value) {
            entity.fields.insert(field.to_string(), new_value.clone());
            renamed += 1;
        }
    }
    renamed
}

/// Fold the rows of a remote select into the local collection.
///
/// An unlimited filtered select is authoritative for every row matching its
/// filters, so local rows that match but were not returned are dropped. Limited
/// selects only upsert what they returned.
pub fn merge_selection(entities: &mut Vec<Entity>, query: &Query, rows: &[Entity]) {
    if query.limit.is_none() {
        entities.retain(|e| !query.matches(e) || rows.iter().any(|row| row.id == e.id));
    }
    for row in rows {
        upsert(entities, row.clone());
    }
}
