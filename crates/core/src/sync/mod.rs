//! Offline-first sync: local mirror, mutation queue, connectivity tracking and
//! queue replay against the remote store.

mod connectivity;
mod engine;
mod local_store;
mod model;
mod mutation_queue;
mod persistence;
mod query;
mod reconciler;
mod remote;
mod scheduler;

pub use connectivity::*;
pub use engine::*;
pub use local_store::*;
pub use model::*;
pub use mutation_queue::*;
pub use persistence::*;
pub use query::*;
pub use reconciler::*;
pub use remote::*;
pub use scheduler::*;

#[cfg(test)]
pub(crate) mod testing;
