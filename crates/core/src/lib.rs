//! Ledgerly core: finance entities, the offline/online sync engine and the typed
//! ledger facade used by UI collaborators.

pub mod config;
pub mod entities;
pub mod errors;
pub mod ledger;
pub mod sync;

pub use config::{DrainMode, SyncConfig};
pub use errors::{Error, Result};
