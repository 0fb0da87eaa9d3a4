use crate::chart_of_accounts::ChartOfAccounts;
use crate::error::{ModelError, Result};
use crate::schema::{FinancialModel, KeyAccount, PeriodId};
use crate::utils::approx_eq;
use log::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct BalanceSheetTotals {
    pub period_id: PeriodId,
    pub assets: f64,
    pub liabilities_and_equity: f64,
}

impl BalanceSheetTotals {
    pub fn difference(&self) -> f64 {
        self.assets - self.liabilities_and_equity
    }
}

/// Checks the accounting equation on the classified balance-sheet totals.
pub struct BalanceSheetCheck<'a> {
    model: &'a FinancialModel,
    chart: ChartOfAccounts<'a>,
}

impl<'a> BalanceSheetCheck<'a> {
    pub fn new(model: &'a FinancialModel) -> Self {
        Self {
            model,
            chart: ChartOfAccounts::new(&model.accounts),
        }
    }

    /// Asset total against the liabilities-and-equity total, falling back to
    /// liability total + equity total when no combined line is classified.
    pub fn totals(&self, period_id: &PeriodId) -> Result<BalanceSheetTotals> {
        if self.model.period(period_id).is_none() {
            return Err(ModelError::UnknownPeriod(period_id.to_string()));
        }

        let value_of = |key: KeyAccount| -> Result<f64> {
            let account = self.chart.require_key_account(key)?;
            Ok(self.model.values.value_or_zero(&account.id, period_id))
        };

        let assets = value_of(KeyAccount::AssetTotal)?;
        let liabilities_and_equity = match self.chart.key_account(KeyAccount::LiabilitiesAndEquityTotal) {
            Some(account) => self.model.values.value_or_zero(&account.id, period_id),
            None => value_of(KeyAccount::LiabilityTotal)? + value_of(KeyAccount::EquityTotal)?,
        };

        Ok(BalanceSheetTotals {
            period_id: period_id.clone(),
            assets,
            liabilities_and_equity,
        })
    }

    pub fn verify_period(&self, period_id: &PeriodId) -> Result<BalanceSheetTotals> {
        let totals = self.totals(period_id)?;
        let tolerance = self.model.settings.balance_tolerance;

        if !approx_eq(totals.assets, totals.liabilities_and_equity, tolerance) {
            return Err(ModelError::BalanceSheetMismatch {
                period_id: totals.period_id.clone(),
                assets: totals.assets,
                liabilities_and_equity: totals.liabilities_and_equity,
                difference: totals.difference(),
            });
        }

        debug!("Balance sheet balances in '{}'", period_id);
        Ok(totals)
    }

    pub fn verify_all(&self) -> Result<()> {
        for period in self.model.ordered_periods() {
            self.verify_period(&period.id)?;
        }
        Ok(())
    }
}

pub fn verify_balance_sheet(model: &FinancialModel, period_id: &PeriodId) -> Result<BalanceSheetTotals> {
    BalanceSheetCheck::new(model).verify_period(period_id)
}

pub fn verify_all_periods(model: &FinancialModel) -> Result<()> {
    BalanceSheetCheck::new(model).verify_all()
}
