//! Boundary to the authoritative relational store.

use async_trait::async_trait;

use crate::entities::{Entity, Payload};
use crate::errors::Result;

use super::query::{Query, Target};

/// Remote store adapter.
///
/// Implementations must report transport failures as
/// [`Error::Connectivity`](crate::Error::Connectivity) and refusals by the store as
/// [`Error::RemoteRejected`](crate::Error::RemoteRejected); the engine relies on
/// that split to decide whether to fall back to offline mode.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn select(&self, collection: &str, query: &Query) -> Result<Vec<Entity>>;

    /// Insert a row (without id) and return it as stored, with its server id.
    async fn insert(&self, collection: &str, row: Payload) -> Result<Entity>;

    /// Apply a partial row to every targeted record and return the updated rows.
    async fn update(&self, collection: &str, target: &Target, patch: Payload)
        -> Result<Vec<Entity>>;

    async fn delete(&self, collection: &str, target: &Target) -> Result<()>;
}
