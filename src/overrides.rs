use crate::error::{ModelError, Result};
use crate::schema::{Account, AccountId, FinancialModel, Parameter, PeriodId};
use crate::validation::validate_model;
use log::debug;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A batch of user edits to a model.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
pub struct ModelOverrides {
    #[schemars(
        description = "Accounts to add before the edits run, so edits may target them (e.g. a new expense line)."
    )]
    #[serde(default)]
    pub new_accounts: Vec<Account>,

    #[schemars(description = "Ordered list of edits, applied after new accounts are added.")]
    #[serde(default)]
    pub edits: Vec<ModelEdit>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ModelEdit {
    /// Replace the account's parameter (e.g. switch revenue to GROWTH_RATE 5%).
    SetParameter {
        account_id: AccountId,
        parameter: Parameter,
    },

    /// Move the account under another summary account, or to the top level.
    ReassignParent {
        account_id: AccountId,
        #[schemars(description = "New parent id, or null to detach.")]
        parent_id: Option<AccountId>,
    },

    /// Manually enter a value. Manual values survive recomputes.
    SetValue {
        account_id: AccountId,
        period_id: PeriodId,
        value: f64,
    },

    /// Drop a value so the next recompute derives it again.
    ClearValue {
        account_id: AccountId,
        period_id: PeriodId,
    },

    RenameAccount {
        account_id: AccountId,
        new_name: String,
    },

    /// Delete an account and its values. Its children move to the top level.
    RemoveAccount { account_id: AccountId },
}

impl ModelOverrides {
    /// Applies the overrides to a base model, returning a new, validated model.
    /// The base model is left untouched.
    pub fn apply(&self, base: &FinancialModel) -> Result<FinancialModel> {
        let mut model = base.clone();
        model.accounts.extend(self.new_accounts.iter().cloned());

        for edit in &self.edits {
            apply_single_edit(&mut model, edit)?;
        }

        validate_model(&model)?;
        Ok(model)
    }
}

pub fn apply_edit(base: &FinancialModel, edit: &ModelEdit) -> Result<FinancialModel> {
    ModelOverrides {
        new_accounts: Vec::new(),
        edits: vec![edit.clone()],
    }
    .apply(base)
}

fn apply_single_edit(model: &mut FinancialModel, edit: &ModelEdit) -> Result<()> {
    debug!("Applying edit {:?}", edit);

    match edit {
        ModelEdit::SetParameter {
            account_id,
            parameter,
        } => {
            find_account_mut(model, account_id)?.parameter = parameter.clone();
        }

        ModelEdit::ReassignParent {
            account_id,
            parent_id,
        } => {
            if let Some(parent_id) = parent_id {
                if model.account(parent_id).is_none() {
                    return Err(ModelError::UnknownAccount(parent_id.to_string()));
                }
            }
            find_account_mut(model, account_id)?.parent_id = parent_id.clone();
        }

        ModelEdit::SetValue {
            account_id,
            period_id,
            value,
        } => {
            find_account_mut(model, account_id)?;
            if model.period(period_id).is_none() {
                return Err(ModelError::UnknownPeriod(period_id.to_string()));
            }
            model
                .values
                .insert(account_id.clone(), period_id.clone(), *value, false);
        }

        ModelEdit::ClearValue {
            account_id,
            period_id,
        } => {
            model.values.remove(account_id, period_id);
        }

        ModelEdit::RenameAccount {
            account_id,
            new_name,
        } => {
            find_account_mut(model, account_id)?.name = new_name.clone();
        }

        ModelEdit::RemoveAccount { account_id } => {
            find_account_mut(model, account_id)?;
            model.accounts.retain(|a| &a.id != account_id);
            for account in &mut model.accounts {
                if account.parent_id.as_ref() == Some(account_id) {
                    account.parent_id = None;
                }
            }
            model.values.remove_account(account_id);
        }
    }

    Ok(())
}

fn find_account_mut<'a>(model: &'a mut FinancialModel, id: &AccountId) -> Result<&'a mut Account> {
    model
        .accounts
        .iter_mut()
        .find(|a| &a.id == id)
        .ok_or_else(|| ModelError::UnknownAccount(id.to_string()))
}
