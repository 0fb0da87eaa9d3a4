use crate::schema::{AccountId, KeyAccount, ParameterType, PeriodId};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Circular dependency detected at account '{account_id}'")]
    CircularDependency { account_id: AccountId },

    #[error("Division by zero while evaluating {node}")]
    DivisionByZero { node: String },

    #[error("Account '{account_id}' uses {parameter_type} but has no reference account configured")]
    MissingReference {
        account_id: AccountId,
        parameter_type: ParameterType,
    },

    #[error("Account '{account_id}' has unknown parameter type '{parameter_type}'")]
    UnknownParameterType {
        account_id: AccountId,
        parameter_type: String,
    },

    #[error("Account '{account_id}' uses {parameter_type} but has no parameter value")]
    MissingParameterValue {
        account_id: AccountId,
        parameter_type: ParameterType,
    },

    #[error("Inconsistent model structure{}: {details}", fmt_account(.account_id))]
    InconsistentStructure {
        account_id: Option<AccountId>,
        details: String,
    },

    #[error("No account is classified as {0:?}")]
    MissingKeyAccount(KeyAccount),

    #[error("Unknown account: {0}")]
    UnknownAccount(String),

    #[error("Unknown period: {0}")]
    UnknownPeriod(String),

    #[error("Duplicate value for account '{account_id}' in period '{period_id}'")]
    DuplicateValue {
        account_id: AccountId,
        period_id: PeriodId,
    },

    #[error("Balance sheet does not balance in period {period_id}: Assets ({assets}) != Liabilities + Equity ({liabilities_and_equity}), difference {difference}")]
    BalanceSheetMismatch {
        period_id: PeriodId,
        assets: f64,
        liabilities_and_equity: f64,
        difference: f64,
    },

    #[error("Date calculation error: {0}")]
    DateError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl ModelError {
    /// Per-account evaluation failures that a recompute pass isolates to the
    /// failing account instead of aborting.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ModelError::DivisionByZero { .. }
                | ModelError::MissingReference { .. }
                | ModelError::MissingParameterValue { .. }
        )
    }

    pub(crate) fn inconsistent(account_id: &AccountId, details: impl Into<String>) -> Self {
        ModelError::InconsistentStructure {
            account_id: Some(account_id.clone()),
            details: details.into(),
        }
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(err: serde_json::Error) -> Self {
        ModelError::SerializationError(err.to_string())
    }
}

fn fmt_account(account_id: &Option<AccountId>) -> String {
    match account_id {
        Some(id) => format!(" at account '{}'", id),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;
