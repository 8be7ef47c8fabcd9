//! HTTP adapter for a PostgREST-style relational backend.
//!
//! Provides [`RestStoreClient`], the [`RemoteStore`](ledgerly_core::sync::RemoteStore)
//! implementation used in production, and [`HttpReachabilityProbe`] for the
//! connectivity monitor.

mod client;
mod config;
mod error;
mod probe;

pub use client::RestStoreClient;
pub use config::{RemoteConfig, ENV_REMOTE_ACCESS_TOKEN, ENV_REMOTE_API_KEY, ENV_REMOTE_URL};
pub use error::{ApiRetryClass, RemoteError, Result};
pub use probe::HttpReachabilityProbe;
