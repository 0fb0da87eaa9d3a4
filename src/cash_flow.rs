//! Indirect-method cash reconciliation for a single period.
//!
//! change = operating profit
//!        + CF adjustments (signed by the target balance's side and the declared operation)
//!        + balance deltas of CF-generating stock accounts (signed by their own side)

use crate::chart_of_accounts::ChartOfAccounts;
use crate::error::{ModelError, Result};
use crate::schema::{AccountId, CfCategory, FinancialModel, KeyAccount, PeriodId};
use crate::values::ValueSet;
use log::{debug, info};

/// One line feeding the cash change.
#[derive(Debug, Clone, PartialEq)]
pub struct CashContribution {
    pub account_id: AccountId,
    /// `None` for profit lines and balance deltas, which have no declared category.
    pub cf_category: Option<CfCategory>,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CashFlowReconciliation {
    pub period_id: PeriodId,
    pub beginning_balance: f64,
    pub change: f64,
    pub ending_balance: f64,
    pub contributions: Vec<CashContribution>,
    /// The model's values with the three cash-flow lines and the cash total written.
    pub values: ValueSet,
}

impl CashFlowReconciliation {
    pub fn total_for(&self, category: CfCategory) -> f64 {
        self.contributions
            .iter()
            .filter(|c| c.cf_category == Some(category))
            .map(|c| c.amount)
            .sum()
    }
}

pub fn reconcile_cash_flow(model: &FinancialModel, period_id: &PeriodId) -> Result<CashFlowReconciliation> {
    let period = model
        .period(period_id)
        .ok_or_else(|| ModelError::UnknownPeriod(period_id.to_string()))?;
    let previous = model.previous_period(period_id);

    let chart = ChartOfAccounts::new(&model.accounts);
    let cash_total = chart.require_key_account(KeyAccount::CashTotal)?;
    let values = &model.values;
    let current = |id: &AccountId| values.value_or_zero(id, &period.id);

    let beginning_balance = previous
        .map(|p| values.value_or_zero(&cash_total.id, &p.id))
        .unwrap_or(0.0);

    let mut contributions = Vec::new();

    match chart.key_account(KeyAccount::OperatingProfit) {
        Some(profit) => contributions.push(CashContribution {
            account_id: profit.id.clone(),
            cf_category: None,
            amount: current(&profit.id),
        }),
        None => {
            debug!("No operating profit classified; using base profit accounts");
            for account in chart.base_profit_accounts() {
                contributions.push(CashContribution {
                    account_id: account.id.clone(),
                    cf_category: None,
                    amount: current(&account.id),
                });
            }
        }
    }

    for account in chart.cf_adjustment_accounts() {
        let Some(adjustment) = &account.cf_adjustment else {
            continue;
        };
        let Some(sign) = chart
            .account(&adjustment.target_account_id)
            .and_then(|target| target.cash_sign())
        else {
            continue;
        };
        contributions.push(CashContribution {
            account_id: account.id.clone(),
            cf_category: Some(adjustment.cf_category),
            amount: sign * adjustment.operation.sign() * current(&account.id),
        });
    }

    if let Some(previous) = previous {
        for account in chart.cf_delta_accounts() {
            let Some(sign) = account.cash_sign() else {
                continue;
            };
            let delta = current(&account.id) - values.value_or_zero(&account.id, &previous.id);
            contributions.push(CashContribution {
                account_id: account.id.clone(),
                cf_category: None,
                amount: sign * delta,
            });
        }
    }

    let change: f64 = contributions.iter().map(|c| c.amount).sum();
    let ending_balance = beginning_balance + change;

    let mut updated = values.clone();
    for (key, amount) in [
        (KeyAccount::CashBeginningBalance, beginning_balance),
        (KeyAccount::CashChange, change),
        (KeyAccount::CashEndingBalance, ending_balance),
    ] {
        if let Some(account) = chart.key_account(key) {
            updated.insert(account.id.clone(), period.id.clone(), amount, true);
        }
    }
    updated.insert(cash_total.id.clone(), period.id.clone(), ending_balance, true);

    info!(
        "Cash reconciled for '{}': {:.2} + {:.2} = {:.2}",
        period.id, beginning_balance, change, ending_balance
    );

    Ok(CashFlowReconciliation {
        period_id: period.id.clone(),
        beginning_balance,
        change,
        ending_balance,
        contributions,
        values: updated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Account, Aggregation, Operation, Period};

    fn cash_model() -> FinancialModel {
        let accounts = vec![
            Account::stock("cash", "Cash", false).with_key(KeyAccount::CashTotal),
            Account::stock("ar", "Accounts Receivable", false).generating_cf_item(),
            Account::stock("ap", "Accounts Payable", true).generating_cf_item(),
            Account::stock("ppe", "PPE", false),
            Account::flow("op", "Operating Profit").with_key(KeyAccount::OperatingProfit),
            Account::flow("dep", "Depreciation").with_cf_adjustment(
                "ppe",
                Operation::Sub,
                CfCategory::Operating,
            ),
            Account::flow("capex", "Capital Expenditure").with_cf_adjustment(
                "ppe",
                Operation::Add,
                CfCategory::Investing,
            ),
            Account::flow("cf-begin", "Cash at Beginning").with_key(KeyAccount::CashBeginningBalance),
            Account::flow("cf-change", "Net Cash Change").with_key(KeyAccount::CashChange),
            Account::flow("cf-end", "Cash at End").with_key(KeyAccount::CashEndingBalance),
        ];
        let periods = vec![Period::imported("M1", 0), Period::new("M2", 1)];

        let m1 = PeriodId::from("M1");
        let m2 = PeriodId::from("M2");
        let cell = |a: &str| AccountId::from(a);
        let values = ValueSet::new()
            .with(&cell("cash"), &m1, 30_000.0, false)
            .with(&cell("ar"), &m1, 100_000.0, false)
            .with(&cell("ar"), &m2, 150_000.0, true)
            .with(&cell("ap"), &m1, 40_000.0, false)
            .with(&cell("ap"), &m2, 45_000.0, true)
            .with(&cell("op"), &m2, 100_000.0, true)
            .with(&cell("dep"), &m2, 20_000.0, true)
            .with(&cell("capex"), &m2, 50_000.0, true);

        FinancialModel::new(accounts, periods, values)
    }

    fn contribution(rec: &CashFlowReconciliation, id: &str) -> f64 {
        rec.contributions
            .iter()
            .find(|c| c.account_id.as_str() == id)
            .map(|c| c.amount)
            .unwrap()
    }

    #[test]
    fn test_indirect_method_reconciliation() {
        let model = cash_model();
        let rec = reconcile_cash_flow(&model, &PeriodId::from("M2")).unwrap();

        assert_eq!(contribution(&rec, "ar"), -50_000.0);
        assert_eq!(contribution(&rec, "ap"), 5_000.0);
        assert_eq!(contribution(&rec, "dep"), 20_000.0);
        assert_eq!(contribution(&rec, "capex"), -50_000.0);

        assert_eq!(rec.beginning_balance, 30_000.0);
        assert!((rec.change - 25_000.0).abs() < 1e-9);
        assert!((rec.ending_balance - 55_000.0).abs() < 1e-9);
        assert!((rec.total_for(CfCategory::Investing) + 50_000.0).abs() < 1e-9);

        let m2 = PeriodId::from("M2");
        assert_eq!(rec.values.value(&AccountId::from("cash"), &m2), Some(rec.ending_balance));
        assert_eq!(rec.values.value(&AccountId::from("cf-begin"), &m2), Some(30_000.0));
        assert_eq!(rec.values.value(&AccountId::from("cf-change"), &m2), Some(rec.change));
        assert_eq!(rec.values.value(&AccountId::from("cf-end"), &m2), Some(rec.ending_balance));
        // Input snapshot untouched.
        assert_eq!(model.values.value(&AccountId::from("cash"), &m2), None);
    }

    #[test]
    fn test_first_period_has_no_deltas() {
        let model = cash_model();
        let rec = reconcile_cash_flow(&model, &PeriodId::from("M1")).unwrap();

        assert_eq!(rec.beginning_balance, 0.0);
        assert!(rec
            .contributions
            .iter()
            .all(|c| c.account_id.as_str() != "ar" && c.account_id.as_str() != "ap"));
        // The cash total is overwritten even where it was imported.
        assert!(!rec.values.is_manual(&AccountId::from("cash"), &PeriodId::from("M1")));
    }

    #[test]
    fn test_base_profit_fallback() {
        let mut model = cash_model();
        model.accounts.retain(|a| a.id.as_str() != "op");
        model.accounts.push(Account::flow("np", "Net Profit").as_base_profit());
        model.accounts.push(Account::flow("other", "Other Income").as_base_profit());
        let m2 = PeriodId::from("M2");
        model.values.insert(AccountId::from("np"), m2.clone(), 60_000.0, true);
        model.values.insert(AccountId::from("other"), m2.clone(), 1_000.0, true);

        let rec = reconcile_cash_flow(&model, &m2).unwrap();
        assert!((rec.change - (61_000.0 - 50_000.0 + 5_000.0 + 20_000.0 - 50_000.0)).abs() < 1e-9);
    }

    #[test]
    fn test_cash_children_excluded_from_deltas() {
        let mut model = cash_model();
        model.accounts[0] = Account::stock("cash", "Cash", false)
            .with_key(KeyAccount::CashTotal)
            .with_aggregation(Aggregation::ChildrenSum);
        model
            .accounts
            .push(Account::stock("bank", "Bank", false).with_parent("cash").generating_cf_item());

        let rec = reconcile_cash_flow(&model, &PeriodId::from("M2")).unwrap();
        assert!(rec.contributions.iter().all(|c| c.account_id.as_str() != "bank"));
    }

    #[test]
    fn test_errors() {
        let model = cash_model();
        assert!(matches!(
            reconcile_cash_flow(&model, &PeriodId::from("M9")),
            Err(ModelError::UnknownPeriod(_))
        ));

        let mut no_cash = cash_model();
        no_cash.accounts.remove(0);
        assert_eq!(
            reconcile_cash_flow(&no_cash, &PeriodId::from("M2")).unwrap_err(),
            ModelError::MissingKeyAccount(KeyAccount::CashTotal)
        );
    }
}
