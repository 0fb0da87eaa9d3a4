//! Builds a `FinancialModel` from name-keyed import records.
//!
//! Import layers identify accounts by their display names. Names are resolved
//! to ids exactly once here; nothing downstream matches on names.

use crate::error::{ModelError, Result};
use crate::schema::{
    Account, AccountBehavior, AccountId, AccountRelation, Aggregation, CfAdjustment, CfCategory,
    EngineSettings, FinancialModel, FormulaTerm, KeyAccount, Operation, Parameter,
    ParameterReference, ParameterType, Period, PeriodId, Value,
};
use crate::utils::parse_period_string;
use crate::validation::validate_model;
use crate::values::ValueSet;
use log::{debug, info};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReferenceRecord {
    pub account: String,
    #[serde(default)]
    #[schemars(description = "ADD, SUB, MUL or DIV (also + - * /). Defaults to ADD.")]
    pub operation: Option<String>,
    #[serde(default)]
    pub lag: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CfAdjustmentRecord {
    pub target: String,
    pub operation: String,
    pub category: CfCategory,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AccountRecord {
    pub name: String,

    #[serde(default)]
    #[schemars(description = "Stable id. Derived from the name when omitted.")]
    pub id: Option<String>,

    pub behavior: AccountBehavior,

    #[serde(default)]
    pub parent: Option<String>,

    #[serde(default)]
    pub children_sum: bool,

    #[serde(default)]
    #[schemars(description = "Cross-category total, e.g. Revenue Total ADD, Cost of Sales Total SUB")]
    pub formula: Vec<ReferenceRecord>,

    #[serde(default)]
    pub key: Option<KeyAccount>,

    #[serde(default = "default_parameter_tag")]
    pub parameter_type: String,

    #[serde(default)]
    pub parameter_value: Option<f64>,

    #[serde(default)]
    pub references: Vec<ReferenceRecord>,

    #[serde(default)]
    pub is_credit: Option<bool>,

    #[serde(default)]
    pub is_cf_item: bool,

    #[serde(default)]
    pub cf_adjustment: Option<CfAdjustmentRecord>,

    #[serde(default)]
    pub base_profit: bool,

    #[serde(default)]
    pub generates_cf_item: bool,
}

fn default_parameter_tag() -> String {
    ParameterType::None.as_str().to_string()
}

impl AccountRecord {
    pub fn new(name: impl Into<String>, behavior: AccountBehavior) -> Self {
        Self {
            name: name.into(),
            id: None,
            behavior,
            parent: None,
            children_sum: false,
            formula: Vec::new(),
            key: None,
            parameter_type: default_parameter_tag(),
            parameter_value: None,
            references: Vec::new(),
            is_credit: None,
            is_cf_item: false,
            cf_adjustment: None,
            base_profit: false,
            generates_cf_item: false,
        }
    }

    pub fn flow(name: impl Into<String>) -> Self {
        Self::new(name, AccountBehavior::Flow)
    }

    pub fn stock(name: impl Into<String>, is_credit: bool) -> Self {
        let mut record = Self::new(name, AccountBehavior::Stock);
        record.is_credit = Some(is_credit);
        record
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PeriodRecord {
    #[schemars(description = "Month label in YYYY-MM format; also used as the period id")]
    pub label: String,
    #[serde(default)]
    pub is_actual: bool,
    #[serde(default)]
    pub is_from_excel: bool,
}

impl PeriodRecord {
    pub fn imported(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            is_actual: true,
            is_from_excel: true,
        }
    }

    pub fn forecast(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            is_actual: false,
            is_from_excel: false,
        }
    }
}

/// An imported or manually entered cell.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ValueRecord {
    pub account: String,
    pub period: String,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelationRecord {
    Ppe {
        asset: String,
        investment: String,
        depreciation: String,
    },
    RetainedEarnings {
        account: String,
        profit: String,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ModelBuilder {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub accounts: Vec<AccountRecord>,
    #[serde(default)]
    pub periods: Vec<PeriodRecord>,
    #[serde(default)]
    pub values: Vec<ValueRecord>,
    #[serde(default)]
    pub relations: Vec<RelationRecord>,
    #[serde(default)]
    pub settings: EngineSettings,
}

impl ModelBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn account(mut self, record: AccountRecord) -> Self {
        self.accounts.push(record);
        self
    }

    pub fn period(mut self, record: PeriodRecord) -> Self {
        self.periods.push(record);
        self
    }

    pub fn value(mut self, account: impl Into<String>, period: impl Into<String>, value: f64) -> Self {
        self.values.push(ValueRecord {
            account: account.into(),
            period: period.into(),
            value,
        });
        self
    }

    pub fn relation(mut self, record: RelationRecord) -> Self {
        self.relations.push(record);
        self
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Resolves names, parses tags and validates the result.
    pub fn build(&self) -> Result<FinancialModel> {
        let names = self.resolve_names()?;

        let mut accounts = self
            .accounts
            .iter()
            .map(|record| convert_account(record, &names))
            .collect::<Result<Vec<_>>>()?;

        for relation in &self.relations {
            attach_relation(&mut accounts, relation, &names)?;
        }

        let periods = self.convert_periods()?;
        let values = self.convert_values(&names, &periods)?;

        let model = FinancialModel {
            name: self.name.clone(),
            accounts,
            periods,
            values,
            settings: self.settings.clone(),
        };

        validate_model(&model)?;
        info!(
            "Built model '{}': {} accounts, {} periods, {} values",
            model.name,
            model.accounts.len(),
            model.periods.len(),
            model.values.len()
        );
        Ok(model)
    }

    fn resolve_names(&self) -> Result<HashMap<&str, AccountId>> {
        let mut names = HashMap::with_capacity(self.accounts.len());
        for record in &self.accounts {
            let id = record
                .id
                .clone()
                .map(AccountId::from)
                .unwrap_or_else(|| AccountId::from(slugify(&record.name)));
            if names.insert(record.name.trim(), id.clone()).is_some() {
                return Err(ModelError::inconsistent(
                    &id,
                    format!("account name '{}' is imported twice", record.name),
                ));
            }
        }
        debug!("Resolved {} account names", names.len());
        Ok(names)
    }

    fn convert_periods(&self) -> Result<Vec<Period>> {
        self.periods
            .iter()
            .enumerate()
            .map(|(order, record)| -> Result<Period> {
                let (_, end_date) = parse_period_string(&record.label)?;
                Ok(Period {
                    id: PeriodId::from(record.label.trim()),
                    label: record.label.trim().to_string(),
                    order: order as i64,
                    end_date: Some(end_date),
                    is_actual: record.is_actual,
                    is_from_excel: record.is_from_excel,
                })
            })
            .collect()
    }

    fn convert_values(&self, names: &HashMap<&str, AccountId>, periods: &[Period]) -> Result<ValueSet> {
        let values = self
            .values
            .iter()
            .map(|record| -> Result<Value> {
                let period = periods
                    .iter()
                    .find(|p| p.label == record.period.trim())
                    .ok_or_else(|| ModelError::UnknownPeriod(record.period.clone()))?;
                Ok(Value {
                    account_id: resolve(names, &record.account)?,
                    period_id: period.id.clone(),
                    value: record.value,
                    is_calculated: false,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        ValueSet::try_from_values(values)
    }
}

fn convert_account(record: &AccountRecord, names: &HashMap<&str, AccountId>) -> Result<Account> {
    let id = resolve(names, &record.name)?;

    let parameter_type =
        ParameterType::parse(&record.parameter_type).ok_or_else(|| ModelError::UnknownParameterType {
            account_id: id.clone(),
            parameter_type: record.parameter_type.clone(),
        })?;

    let references = record
        .references
        .iter()
        .map(|r| convert_reference(&id, r, names))
        .collect::<Result<Vec<_>>>()?;

    let aggregation = if record.children_sum {
        Some(Aggregation::ChildrenSum)
    } else if !record.formula.is_empty() {
        let terms = record
            .formula
            .iter()
            .map(|r| -> Result<FormulaTerm> {
                let reference = convert_reference(&id, r, names)?;
                Ok(FormulaTerm {
                    account_id: reference.account_id,
                    operation: reference.operation,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Some(Aggregation::Formula { terms })
    } else {
        None
    };

    let cf_adjustment = record
        .cf_adjustment
        .as_ref()
        .map(|adj| -> Result<CfAdjustment> {
            Ok(CfAdjustment {
                target_account_id: resolve(names, &adj.target)?,
                operation: parse_operation(&id, &adj.operation)?,
                cf_category: adj.category,
            })
        })
        .transpose()?;

    Ok(Account {
        id,
        name: record.name.clone(),
        behavior: record.behavior,
        parent_id: record.parent.as_deref().map(|p| resolve(names, p)).transpose()?,
        aggregation,
        key: record.key,
        parameter: Parameter {
            parameter_type,
            value: record.parameter_value,
            references,
        },
        is_credit: record.is_credit,
        is_cf_item: record.is_cf_item,
        cf_adjustment,
        base_profit: record.base_profit,
        generates_cf_item: record.generates_cf_item,
        relation: None,
    })
}

fn convert_reference(
    owner: &AccountId,
    record: &ReferenceRecord,
    names: &HashMap<&str, AccountId>,
) -> Result<ParameterReference> {
    let operation = match &record.operation {
        Some(tag) => parse_operation(owner, tag)?,
        None => Operation::Add,
    };
    Ok(ParameterReference {
        account_id: resolve(names, &record.account)?,
        operation,
        lag: record.lag,
    })
}

fn attach_relation(
    accounts: &mut [Account],
    relation: &RelationRecord,
    names: &HashMap<&str, AccountId>,
) -> Result<()> {
    let (owner, resolved) = match relation {
        RelationRecord::Ppe {
            asset,
            investment,
            depreciation,
        } => (
            resolve(names, asset)?,
            AccountRelation::Ppe {
                investment_account_id: resolve(names, investment)?,
                depreciation_account_id: resolve(names, depreciation)?,
            },
        ),
        RelationRecord::RetainedEarnings { account, profit } => (
            resolve(names, account)?,
            AccountRelation::RetainedEarnings {
                profit_account_id: resolve(names, profit)?,
            },
        ),
    };

    let account = accounts
        .iter_mut()
        .find(|a| a.id == owner)
        .ok_or_else(|| ModelError::UnknownAccount(owner.to_string()))?;
    if account.relation.is_some() {
        return Err(ModelError::inconsistent(&owner, "account already carries a relation"));
    }
    account.relation = Some(resolved);
    Ok(())
}

fn resolve(names: &HashMap<&str, AccountId>, name: &str) -> Result<AccountId> {
    names
        .get(name.trim())
        .cloned()
        .ok_or_else(|| ModelError::UnknownAccount(name.to_string()))
}

fn parse_operation(owner: &AccountId, tag: &str) -> Result<Operation> {
    Operation::parse(tag)
        .ok_or_else(|| ModelError::inconsistent(owner, format!("unknown operation '{}'", tag)))
}

/// `"Cost of Sales (Total)"` -> `"cost-of-sales-total"`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}
