mod model;
mod repository;

pub use model::LocalKvDB;
pub use repository::SqliteKeyValueStore;
