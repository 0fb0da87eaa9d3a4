//! Keyed value storage for `(account, period)` cells.
//!
//! A `ValueSet` holds at most one cell per key. Passes never grow it in place on the
//! caller's snapshot: they clone, insert-or-overwrite, and hand back the new set.

use crate::error::{ModelError, Result};
use crate::schema::{AccountId, PeriodId, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellValue {
    pub value: f64,
    /// Derived by the engine (true) or entered manually/imported (false).
    pub is_calculated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Value>", into = "Vec<Value>")]
pub struct ValueSet {
    cells: BTreeMap<AccountId, BTreeMap<PeriodId, CellValue>>,
}

impl ValueSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a set from a flat collection, rejecting a second value for the same key.
    pub fn try_from_values(values: impl IntoIterator<Item = Value>) -> Result<Self> {
        let mut set = Self::new();
        for v in values {
            if set.get(&v.account_id, &v.period_id).is_some() {
                return Err(ModelError::DuplicateValue {
                    account_id: v.account_id,
                    period_id: v.period_id,
                });
            }
            set.insert(v.account_id, v.period_id, v.value, v.is_calculated);
        }
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.cells.values().map(|periods| periods.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, account_id: &AccountId, period_id: &PeriodId) -> Option<&CellValue> {
        self.cells.get(account_id)?.get(period_id)
    }

    pub fn value(&self, account_id: &AccountId, period_id: &PeriodId) -> Option<f64> {
        self.get(account_id, period_id).map(|cell| cell.value)
    }

    /// Lenient lookup: missing cells read as zero so sparse models still compute.
    pub fn value_or_zero(&self, account_id: &AccountId, period_id: &PeriodId) -> f64 {
        self.value(account_id, period_id).unwrap_or(0.0)
    }

    pub fn is_manual(&self, account_id: &AccountId, period_id: &PeriodId) -> bool {
        self.get(account_id, period_id)
            .map(|cell| !cell.is_calculated)
            .unwrap_or(false)
    }

    /// Insert-or-overwrite.
    pub fn insert(
        &mut self,
        account_id: AccountId,
        period_id: PeriodId,
        value: f64,
        is_calculated: bool,
    ) {
        self.cells.entry(account_id).or_default().insert(
            period_id,
            CellValue {
                value,
                is_calculated,
            },
        );
    }

    /// Consuming variant of [`ValueSet::insert`] for building sets fluently.
    pub fn with(
        mut self,
        account_id: &AccountId,
        period_id: &PeriodId,
        value: f64,
        is_calculated: bool,
    ) -> Self {
        self.insert(account_id.clone(), period_id.clone(), value, is_calculated);
        self
    }

    pub fn remove(&mut self, account_id: &AccountId, period_id: &PeriodId) -> Option<CellValue> {
        let periods = self.cells.get_mut(account_id)?;
        let removed = periods.remove(period_id);
        if periods.is_empty() {
            self.cells.remove(account_id);
        }
        removed
    }

    pub fn remove_account(&mut self, account_id: &AccountId) {
        self.cells.remove(account_id);
    }

    /// Returns a new set with every cell of `updates` written over `self`.
    pub fn merged(&self, updates: &ValueSet) -> ValueSet {
        let mut merged = self.clone();
        for (account_id, period_id, cell) in updates.iter() {
            merged.insert(
                account_id.clone(),
                period_id.clone(),
                cell.value,
                cell.is_calculated,
            );
        }
        merged
    }

    pub fn iter(&self) -> impl Iterator<Item = (&AccountId, &PeriodId, &CellValue)> {
        self.cells.iter().flat_map(|(account_id, periods)| {
            periods
                .iter()
                .map(move |(period_id, cell)| (account_id, period_id, cell))
        })
    }

    pub fn period_cells<'a>(
        &'a self,
        period_id: &'a PeriodId,
    ) -> impl Iterator<Item = (&'a AccountId, &'a CellValue)> + 'a {
        self.cells
            .iter()
            .filter_map(move |(account_id, periods)| periods.get(period_id).map(|c| (account_id, c)))
    }

    pub fn to_values(&self) -> Vec<Value> {
        self.iter()
            .map(|(account_id, period_id, cell)| Value {
                account_id: account_id.clone(),
                period_id: period_id.clone(),
                value: cell.value,
                is_calculated: cell.is_calculated,
            })
            .collect()
    }
}

impl TryFrom<Vec<Value>> for ValueSet {
    type Error = ModelError;

    fn try_from(values: Vec<Value>) -> Result<Self> {
        Self::try_from_values(values)
    }
}

impl From<ValueSet> for Vec<Value> {
    fn from(set: ValueSet) -> Self {
        set.to_values()
    }
}
