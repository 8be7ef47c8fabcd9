use std::sync::Arc;

use chrono::{Months, NaiveDate};
use log::debug;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::entities::{payload_from_model, Entity, EntityId, EntityKind, Payload};
use crate::errors::{Error, Result};
use crate::sync::{Filter, FilterOp, Order, Query, SyncEngine, WriteOperation, WriteOutcome};

use super::ledger_model::{
    BudgetEntry, Category, CategoryKind, NewTransaction, PaymentMethod, Transaction,
    TransactionUpdate,
};

/// Parse `YYYY-MM` into the first day of that month and of the next one.
fn month_bounds(month: &str) -> Result<(NaiveDate, NaiveDate)> {
    let invalid = || Error::InvalidOperation(format!("Invalid month '{}', expected YYYY-MM", month));
    if month.len() != 7 {
        return Err(invalid());
    }
    let start =
        NaiveDate::parse_from_str(&format!("{}-01", month), "%Y-%m-%d").map_err(|_| invalid())?;
    let end = start
        .checked_add_months(Months::new(1))
        .ok_or_else(invalid)?;
    Ok((start, end))
}

fn object(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

fn to_models<T: DeserializeOwned>(rows: Vec<Entity>) -> Result<Vec<T>> {
    rows.iter().map(Entity::to_model::<T>).collect()
}

fn written<T: DeserializeOwned>(outcome: WriteOutcome, kind: EntityKind) -> Result<T> {
    outcome
        .entity
        .ok_or_else(|| Error::InvalidOperation(format!("Write to {} returned no record", kind)))?
        .to_model()
}

fn require_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidOperation("Name must not be empty".to_string()));
    }
    Ok(trimmed.to_string())
}

/// Typed finance operations on top of the sync engine.
///
/// Every call goes through [`SyncEngine`], so the same code path works online and
/// offline; offline results carry temporary ids until the queue is replayed.
pub struct LedgerService {
    engine: Arc<SyncEngine>,
}

impl LedgerService {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    // Transactions

    /// Transactions dated within `month` (`YYYY-MM`), newest first.
    pub async fn transactions(&self, month: &str) -> Result<Vec<Transaction>> {
        let (start, end) = month_bounds(month)?;
        let query = Query::new()
            .filter(Filter::new("date", FilterOp::Gte, start.to_string()))
            .filter(Filter::new("date", FilterOp::Lt, end.to_string()))
            .order_by(Order::desc("date"));
        let rows = self.engine.read(EntityKind::Transaction, &query).await?;
        to_models(rows)
    }

    pub async fn add_transaction(&self, transaction: NewTransaction) -> Result<Transaction> {
        let outcome = self
            .engine
            .write(WriteOperation::Add {
                kind: EntityKind::Transaction,
                payload: payload_from_model(&transaction)?,
            })
            .await?;
        written(outcome, EntityKind::Transaction)
    }

    pub async fn update_transaction(
        &self,
        id: &EntityId,
        update: TransactionUpdate,
    ) -> Result<Transaction> {
        let patch = payload_from_model(&update)?;
        if patch.is_empty() {
            return Err(Error::InvalidOperation("Nothing to update".to_string()));
        }
        let outcome = self
            .engine
            .write(WriteOperation::Update {
                kind: EntityKind::Transaction,
                id: id.clone(),
                patch,
            })
            .await?;
        written(outcome, EntityKind::Transaction)
    }

    pub async fn delete_transaction(&self, id: &EntityId) -> Result<()> {
        self.engine
            .write(WriteOperation::Delete {
                kind: EntityKind::Transaction,
                id: id.clone(),
            })
            .await?;
        Ok(())
    }

    // Categories

    pub async fn categories(&self) -> Result<Vec<Category>> {
        let query = Query::new()
            .order_by(Order::asc("position"))
            .order_by(Order::asc("name"));
        to_models(self.engine.read(EntityKind::Category, &query).await?)
    }

    pub async fn add_category(&self, name: &str, kind: CategoryKind) -> Result<Category> {
        let name = require_name(name)?;
        let position = self
            .categories()
            .await?
            .iter()
            .map(|c| c.position + 1)
            .max()
            .unwrap_or(0);
        let outcome = self
            .engine
            .write(WriteOperation::Add {
                kind: EntityKind::Category,
                payload: object(json!({"name": name, "kind": kind, "position": position})),
            })
            .await?;
        written(outcome, EntityKind::Category)
    }

    /// Rename a category and carry the new name into every transaction and budget
    /// entry that referenced the old one.
    pub async fn rename_category(&self, id: &EntityId, new_name: &str) -> Result<Category> {
        let new_name = require_name(new_name)?;
        let current = self
            .categories()
            .await?
            .into_iter()
            .find(|c| &c.id == id)
            .ok_or_else(|| Error::not_found(EntityKind::Category.collection(), id.as_str()))?;
        if current.name == new_name {
            return Ok(current);
        }

        let outcome = self
            .engine
            .write(WriteOperation::Update {
                kind: EntityKind::Category,
                id: id.clone(),
                patch: object(json!({"name": new_name})),
            })
            .await?;
        for kind in [EntityKind::Transaction, EntityKind::BudgetEntry] {
            let renamed = self
                .engine
                .write(WriteOperation::BulkRename {
                    kind,
                    field: "category".to_string(),
                    old_value: Value::String(current.name.clone()),
                    new_value: Value::String(new_name.clone()),
                })
                .await?;
            debug!(
                "Renamed category '{}' -> '{}' on {} {}",
                current.name, new_name, renamed.affected, kind
            );
        }
        written(outcome, EntityKind::Category)
    }

    pub async fn delete_category(&self, id: &EntityId) -> Result<()> {
        self.engine
            .write(WriteOperation::Delete {
                kind: EntityKind::Category,
                id: id.clone(),
            })
            .await?;
        Ok(())
    }

    /// Give each category in `ids` its index as position. Returns how many
    /// categories actually moved.
    pub async fn reorder_categories(&self, ids: &[EntityId]) -> Result<usize> {
        let categories = self.categories().await?;
        let mut moved = 0;
        for (index, id) in ids.iter().enumerate() {
            let position = i32::try_from(index)
                .map_err(|_| Error::InvalidOperation("Too many categories".to_string()))?;
            let category = categories
                .iter()
                .find(|c| &c.id == id)
                .ok_or_else(|| Error::not_found(EntityKind::Category.collection(), id.as_str()))?;
            if category.position == position {
                continue;
            }
            self.engine
                .write(WriteOperation::Update {
                    kind: EntityKind::Category,
                    id: id.clone(),
                    patch: object(json!({"position": position})),
                })
                .await?;
            moved += 1;
        }
        Ok(moved)
    }

    // Payment methods

    pub async fn payment_methods(&self) -> Result<Vec<PaymentMethod>> {
        let query = Query::new()
            .order_by(Order::asc("position"))
            .order_by(Order::asc("name"));
        to_models(self.engine.read(EntityKind::PaymentMethod, &query).await?)
    }

    pub async fn add_payment_method(&self, name: &str) -> Result<PaymentMethod> {
        let name = require_name(name)?;
        let position = self
            .payment_methods()
            .await?
            .iter()
            .map(|m| m.position + 1)
            .max()
            .unwrap_or(0);
        let outcome = self
            .engine
            .write(WriteOperation::Add {
                kind: EntityKind::PaymentMethod,
                payload: object(json!({"name": name, "position": position})),
            })
            .await?;
        written(outcome, EntityKind::PaymentMethod)
    }

    pub async fn rename_payment_method(
        &self,
        id: &EntityId,
        new_name: &str,
    ) -> Result<PaymentMethod> {
        let new_name = require_name(new_name)?;
        let current = self
            .payment_methods()
            .await?
            .into_iter()
            .find(|m| &m.id == id)
            .ok_or_else(|| {
                Error::not_found(EntityKind::PaymentMethod.collection(), id.as_str())
            })?;
        if current.name == new_name {
            return Ok(current);
        }

        let outcome = self
            .engine
            .write(WriteOperation::Update {
                kind: EntityKind::PaymentMethod,
                id: id.clone(),
                patch: object(json!({"name": new_name})),
            })
            .await?;
        self.engine
            .write(WriteOperation::BulkRename {
                kind: EntityKind::Transaction,
                field: "payment_method".to_string(),
                old_value: Value::String(current.name),
                new_value: Value::String(new_name),
            })
            .await?;
        written(outcome, EntityKind::PaymentMethod)
    }

    // Budget

    pub async fn budget_entries(&self, month: &str) -> Result<Vec<BudgetEntry>> {
        month_bounds(month)?;
        let query = Query::new()
            .filter(Filter::eq("month", month))
            .order_by(Order::asc("category"));
        to_models(self.engine.read(EntityKind::BudgetEntry, &query).await?)
    }

    /// Set the budget for a category in a month, updating the existing entry if
    /// there is one.
    pub async fn set_budget(
        &self,
        category: &str,
        month: &str,
        amount: Decimal,
    ) -> Result<BudgetEntry> {
        let existing = self
            .budget_entries(month)
            .await?
            .into_iter()
            .find(|entry| entry.category == category);

        let operation = match existing {
            Some(entry) if entry.amount == amount => return Ok(entry),
            Some(entry) => WriteOperation::Update {
                kind: EntityKind::BudgetEntry,
                id: entry.id,
                patch: object(json!({"amount": amount})),
            },
            None => WriteOperation::Add {
                kind: EntityKind::BudgetEntry,
                payload: object(json!({
                    "category": category,
                    "month": month,
                    "amount": amount,
                })),
            },
        };
        let outcome = self.engine.write(operation).await?;
        written(outcome, EntityKind::BudgetEntry)
    }
}
