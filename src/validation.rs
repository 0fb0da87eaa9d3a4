//! Eager structural checks run when a model is loaded or edited.
//!
//! These are configuration errors: they point at bad input upstream, so they
//! abort the load instead of being recovered during a recompute.

use crate::chart_of_accounts::ChartOfAccounts;
use crate::error::{ModelError, Result};
use crate::schema::{Account, AccountId, AccountRelation, Aggregation, FinancialModel, KeyAccount, ParameterType};
use std::collections::{HashMap, HashSet};

pub struct Validator<'a> {
    model: &'a FinancialModel,
    chart: ChartOfAccounts<'a>,
}

impl<'a> Validator<'a> {
    pub fn new(model: &'a FinancialModel) -> Self {
        Self {
            model,
            chart: ChartOfAccounts::new(&model.accounts),
        }
    }

    /// Fails with the first problem found.
    pub fn validate(&self) -> Result<()> {
        match self.collect_errors().into_iter().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Every problem in the model, accounts first, then periods, then values.
    pub fn collect_errors(&self) -> Vec<ModelError> {
        let mut errors = Vec::new();

        self.check_unique_accounts(&mut errors);
        self.check_key_accounts(&mut errors);
        for account in &self.model.accounts {
            self.check_account(account, &mut errors);
        }
        self.check_periods(&mut errors);
        self.check_values(&mut errors);

        errors
    }

    fn check_unique_accounts(&self, errors: &mut Vec<ModelError>) {
        let mut seen = HashSet::new();
        for account in &self.model.accounts {
            if !seen.insert(&account.id) {
                errors.push(ModelError::inconsistent(&account.id, "duplicate account id"));
            }
        }
    }

    fn check_key_accounts(&self, errors: &mut Vec<ModelError>) {
        let mut seen: HashMap<KeyAccount, &AccountId> = HashMap::new();
        for account in &self.model.accounts {
            let Some(key) = account.key else {
                continue;
            };
            if let Some(first) = seen.insert(key, &account.id) {
                errors.push(ModelError::inconsistent(
                    &account.id,
                    format!("{:?} is already classified on '{}'", key, first),
                ));
            }
        }
    }

    fn check_account(&self, account: &Account, errors: &mut Vec<ModelError>) {
        let id = &account.id;
        let parameter_type = account.parameter.parameter_type;

        if let Some(parent_id) = &account.parent_id {
            self.check_known(parent_id, errors);
            if self.parent_chain_loops(account) {
                errors.push(ModelError::inconsistent(id, "parent chain loops back to itself"));
            }
        }

        for reference in &account.parameter.references {
            self.check_known(&reference.account_id, errors);
        }

        if let Some(Aggregation::Formula { terms }) = &account.aggregation {
            for term in terms {
                self.check_known(&term.account_id, errors);
            }
        }
        if account.aggregation.is_some() && parameter_type != ParameterType::None {
            errors.push(ModelError::inconsistent(
                id,
                format!("summary account also carries a {} parameter", parameter_type),
            ));
        }

        if parameter_type.requires_reference() && account.parameter.references.is_empty() {
            errors.push(ModelError::MissingReference {
                account_id: id.clone(),
                parameter_type,
            });
        }
        if parameter_type == ParameterType::CashBeginningBalance
            && account.parameter.references.is_empty()
            && self.chart.key_account(KeyAccount::CashTotal).is_none()
        {
            errors.push(ModelError::MissingReference {
                account_id: id.clone(),
                parameter_type,
            });
        }
        if parameter_type.requires_value() && account.parameter.value.is_none() {
            errors.push(ModelError::MissingParameterValue {
                account_id: id.clone(),
                parameter_type,
            });
        }

        if account.is_cf_item {
            self.check_cf_item(account, errors);
        } else if parameter_type.is_cash_flow_only() {
            errors.push(ModelError::inconsistent(
                id,
                format!("{} is reserved for cash-flow items", parameter_type),
            ));
        }

        if let Some(adjustment) = &account.cf_adjustment {
            match self.chart.account(&adjustment.target_account_id) {
                None => errors.push(ModelError::UnknownAccount(
                    adjustment.target_account_id.to_string(),
                )),
                Some(target) if !target.is_stock() || target.is_credit.is_none() => {
                    errors.push(ModelError::inconsistent(
                        id,
                        format!(
                            "CF adjustment target '{}' must be a balance-sheet stock account",
                            target.id
                        ),
                    ))
                }
                Some(_) => {}
            }
        }

        if account.generates_cf_item && (!account.is_stock() || account.is_credit.is_none()) {
            errors.push(ModelError::inconsistent(
                id,
                "only balance-sheet stock accounts can generate cash-flow items",
            ));
        }

        match &account.relation {
            Some(AccountRelation::Ppe {
                investment_account_id,
                depreciation_account_id,
            }) => {
                self.check_known(investment_account_id, errors);
                self.check_known(depreciation_account_id, errors);
            }
            Some(AccountRelation::RetainedEarnings { profit_account_id }) => {
                self.check_known(profit_account_id, errors);
            }
            None => {}
        }
        if account.relation.is_some() && !account.is_stock() {
            errors.push(ModelError::inconsistent(id, "relations are carried by stock accounts"));
        }
    }

    /// CF items are derived lines: no user parameter, no adjustment, no profit flag.
    fn check_cf_item(&self, account: &Account, errors: &mut Vec<ModelError>) {
        let id = &account.id;
        let parameter_type = account.parameter.parameter_type;

        if parameter_type == ParameterType::None && account.aggregation.is_none() {
            errors.push(ModelError::inconsistent(
                id,
                "CF item has neither a cash-flow parameter nor an aggregation",
            ));
        } else if parameter_type != ParameterType::None && !parameter_type.is_cash_flow_only() {
            errors.push(ModelError::inconsistent(
                id,
                format!("CF item carries a {} parameter", parameter_type),
            ));
        }
        if account.cf_adjustment.is_some() {
            errors.push(ModelError::inconsistent(id, "CF item carries a CF adjustment"));
        }
        if account.base_profit {
            errors.push(ModelError::inconsistent(id, "CF item is flagged as base profit"));
        }
        if account.generates_cf_item {
            errors.push(ModelError::inconsistent(id, "CF item cannot generate another CF item"));
        }
    }

    fn check_periods(&self, errors: &mut Vec<ModelError>) {
        let mut ids = HashSet::new();
        for period in &self.model.periods {
            if !ids.insert(&period.id) {
                errors.push(ModelError::InconsistentStructure {
                    account_id: None,
                    details: format!("duplicate period id '{}'", period.id),
                });
            }
        }

        let ordered = self.model.ordered_periods();
        for pair in ordered.windows(2) {
            if pair[0].order == pair[1].order {
                errors.push(ModelError::InconsistentStructure {
                    account_id: None,
                    details: format!(
                        "periods '{}' and '{}' share order {}",
                        pair[0].id, pair[1].id, pair[1].order
                    ),
                });
            }
        }
    }

    fn check_values(&self, errors: &mut Vec<ModelError>) {
        let periods: HashSet<_> = self.model.periods.iter().map(|p| &p.id).collect();
        for (account_id, period_id, _) in self.model.values.iter() {
            if self.chart.account(account_id).is_none() {
                errors.push(ModelError::UnknownAccount(account_id.to_string()));
            } else if !periods.contains(period_id) {
                errors.push(ModelError::UnknownPeriod(period_id.to_string()));
            }
        }
    }

    fn check_known(&self, id: &AccountId, errors: &mut Vec<ModelError>) {
        if self.chart.account(id).is_none() {
            errors.push(ModelError::UnknownAccount(id.to_string()));
        }
    }

    fn parent_chain_loops(&self, account: &Account) -> bool {
        let mut current = account.parent_id.as_ref();
        for _ in 0..self.model.accounts.len() {
            match current {
                Some(id) if id == &account.id => return true,
                Some(id) => current = self.chart.account(id).and_then(|a| a.parent_id.as_ref()),
                None => return false,
            }
        }
        false
    }
}

pub fn validate_model(model: &FinancialModel) -> Result<()> {
    Validator::new(model).validate()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CfCategory, Operation, Parameter, Period, PeriodId};
    use crate::values::ValueSet;

    fn valid_model() -> FinancialModel {
        FinancialModel::new(
            vec![
                Account::stock("cash", "Cash", false).with_key(KeyAccount::CashTotal),
                Account::stock("ar", "Receivables", false).generating_cf_item(),
                Account::stock("ppe", "PPE", false),
                Account::flow("rev-total", "Revenue Total").with_aggregation(Aggregation::ChildrenSum),
                Account::flow("rev", "Revenue")
                    .with_parent("rev-total")
                    .with_parameter(Parameter::growth_rate(0.05)),
                Account::flow("dep", "Depreciation").with_cf_adjustment(
                    "ppe",
                    Operation::Sub,
                    CfCategory::Operating,
                ),
                Account::cf_item("cf-ar", "Change in Receivables", Parameter::bs_change("ar", Operation::Sub)),
                Account::cf_item("cf-begin", "Opening Cash", Parameter::cash_beginning(None)),
            ],
            vec![Period::imported("2023", 0), Period::new("2024", 1)],
            ValueSet::new().with(&AccountId::from("rev"), &PeriodId::from("2023"), 10.0, false),
        )
    }

    fn first_error(model: &FinancialModel) -> ModelError {
        validate_model(model).unwrap_err()
    }

    #[test]
    fn test_valid_model_passes() {
        let model = valid_model();
        assert!(validate_model(&model).is_ok());
        assert!(Validator::new(&model).collect_errors().is_empty());
    }

    #[test]
    fn test_missing_reference_and_value() {
        let mut model = valid_model();
        model.accounts.push(Account::flow("cogs", "COGS").with_parameter(Parameter {
            parameter_type: ParameterType::Percentage,
            value: None,
            references: Vec::new(),
        }));

        let errors = Validator::new(&model).collect_errors();
        assert_eq!(errors.len(), 2);
        assert!(matches!(errors[0], ModelError::MissingReference { .. }));
        assert!(matches!(errors[1], ModelError::MissingParameterValue { .. }));
    }

    #[test]
    fn test_cf_only_parameter_on_regular_account() {
        let mut model = valid_model();
        model.accounts.push(
            Account::flow("odd", "Odd").with_parameter(Parameter::bs_change("ar", Operation::Sub)),
        );
        assert!(first_error(&model).to_string().contains("reserved for cash-flow items"));
    }

    #[test]
    fn test_cf_item_with_user_parameter() {
        let mut model = valid_model();
        model
            .accounts
            .push(Account::cf_item("cf-x", "CF X", Parameter::growth_rate(0.1)));
        assert_eq!(
            first_error(&model),
            ModelError::inconsistent(&AccountId::from("cf-x"), "CF item carries a GROWTH_RATE parameter")
        );
    }

    #[test]
    fn test_adjustment_target_must_be_balance_sheet_stock() {
        let mut model = valid_model();
        model.accounts.push(Account::flow("amort", "Amortisation").with_cf_adjustment(
            "rev",
            Operation::Sub,
            CfCategory::Operating,
        ));
        assert!(first_error(&model).to_string().contains("CF adjustment target 'rev'"));
    }

    #[test]
    fn test_unknown_ids() {
        let mut model = valid_model();
        model.accounts.push(Account::flow("x", "X").with_parent("nowhere"));
        assert_eq!(first_error(&model), ModelError::UnknownAccount("nowhere".to_string()));

        let mut model = valid_model();
        model
            .values
            .insert(AccountId::from("rev"), PeriodId::from("1999"), 1.0, false);
        assert_eq!(first_error(&model), ModelError::UnknownPeriod("1999".to_string()));
    }

    #[test]
    fn test_duplicates() {
        let mut model = valid_model();
        model.accounts.push(Account::flow("rev", "Revenue again"));
        assert!(first_error(&model).to_string().contains("duplicate account id"));

        let mut model = valid_model();
        model.accounts.push(Account::stock("cash2", "Cash 2", false).with_key(KeyAccount::CashTotal));
        assert!(first_error(&model).to_string().contains("already classified"));

        let mut model = valid_model();
        model.periods.push(Period::new("2025", 1));
        assert!(first_error(&model).to_string().contains("share order 1"));
    }

    #[test]
    fn test_parent_loop() {
        let mut model = valid_model();
        model.accounts.push(Account::flow("a", "A").with_parent("b"));
        model.accounts.push(Account::flow("b", "B").with_parent("a"));
        assert!(first_error(&model).to_string().contains("parent chain loops"));
    }
}
