//! Finance ledger: typed transactions, categories, payment methods and budgets.

mod ledger_model;
mod ledger_service;

pub use ledger_model::*;
pub use ledger_service::*;
