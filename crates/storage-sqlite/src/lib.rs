//! SQLite persistence for the Ledgerly local store and mutation queue.

pub mod db;
pub mod errors;
pub mod kv;
pub mod schema;

pub use db::{create_pool, get_connection, init, run_migrations, spawn_writer, DbPool, WriteHandle};
pub use errors::StorageError;
pub use kv::SqliteKeyValueStore;

use ledgerly_core::Result;

/// Create (or open) the database under `app_data_dir`, bring its schema up to
/// date and return a key/value store backed by it.
pub fn open_key_value_store(app_data_dir: &str) -> Result<SqliteKeyValueStore> {
    let db_path = init(app_data_dir)?;
    run_migrations(&db_path)?;
    let pool = create_pool(&db_path)?;
    let writer = spawn_writer(pool.as_ref().clone());
    Ok(SqliteKeyValueStore::new(pool, writer))
}
