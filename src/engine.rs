//! Synchronous recompute passes over a model snapshot.
//!
//! Every pass reads the caller's `FinancialModel`, builds a fresh [`ValueSet`]
//! and returns it. The input is never modified, and the memo table used while
//! evaluating lives only for the duration of one call.

use crate::chart_of_accounts::ChartOfAccounts;
use crate::dependency::get_calculation_order;
use crate::error::{ModelError, Result};
use crate::evaluator::{evaluate, try_evaluate, EvalContext, PeriodIndex};
use crate::formula::{FormulaCompiler, PeriodContext};
use crate::schema::{Account, AccountId, EngineSettings, FinancialModel, Period, PeriodId};
use crate::utils::{advance_month_end, months_between, period_label};
use crate::validation::validate_model;
use crate::values::ValueSet;
use log::{debug, info, warn};
use std::collections::HashSet;

pub struct ModelEngine<'m> {
    chart: ChartOfAccounts<'m>,
    periods: Vec<&'m Period>,
    settings: &'m EngineSettings,
    order: Vec<AccountId>,
}

impl<'m> ModelEngine<'m> {
    /// Orders the accounts once up front. A dependency cycle makes the whole
    /// model uncomputable and is returned here.
    pub fn new(model: &'m FinancialModel) -> Result<Self> {
        let order = get_calculation_order(&model.accounts)?;
        debug!("Calculation order: {:?}", order);

        Ok(Self {
            chart: ChartOfAccounts::new(&model.accounts),
            periods: model.ordered_periods(),
            settings: &model.settings,
            order,
        })
    }

    pub fn calculation_order(&self) -> &[AccountId] {
        &self.order
    }

    /// Recomputes every account in every period that was not imported, in
    /// period order. Manually entered values stay as they are.
    pub fn recompute_parameter_driven(&self, values: &ValueSet) -> Result<ValueSet> {
        let mut values = values.clone();
        let mut ctx = EvalContext::new();

        for (idx, period) in self.periods.iter().enumerate() {
            if period.is_from_excel {
                continue;
            }
            self.compute_period(idx as PeriodIndex, &mut ctx, &mut values)?;
        }

        debug!("Parameter pass resolved {} cells", ctx.len());
        Ok(values)
    }

    /// Brings summary totals and cash-flow items in line with their inputs,
    /// sweeping until nothing changes.
    pub fn recompute_summaries(&self, values: &ValueSet) -> Result<ValueSet> {
        let indices: Vec<PeriodIndex> = (0..self.periods.len() as PeriodIndex).collect();
        self.stabilize(values.clone(), &indices)
    }

    fn compute_period(
        &self,
        idx: PeriodIndex,
        ctx: &mut EvalContext,
        values: &mut ValueSet,
    ) -> Result<()> {
        let Some(period) = self.period_at(idx) else {
            return Ok(());
        };

        for account_id in &self.order {
            if values.is_manual(account_id, &period.id) {
                continue;
            }
            let value = self.resolve_cell(account_id, idx, ctx, values)?;
            values.insert(account_id.clone(), period.id.clone(), value, true);
        }

        Ok(())
    }

    fn resolve_cell(
        &self,
        account_id: &AccountId,
        idx: PeriodIndex,
        ctx: &mut EvalContext,
        values: &ValueSet,
    ) -> Result<f64> {
        ctx.resolve(account_id, idx, |ctx| {
            match self.compute_cell(account_id, idx, ctx, values) {
                Ok(value) => Ok(value),
                Err(err) if err.is_recoverable() && self.settings.carry_forward_on_error => {
                    let fallback = self.carried_value(account_id, idx, values);
                    warn!(
                        "Account '{}' failed in period '{}': {}. Carrying {} forward",
                        account_id,
                        self.period_id_at(idx),
                        err,
                        fallback
                    );
                    Ok(fallback)
                }
                Err(err) => Err(err),
            }
        })
    }

    fn compute_cell(
        &self,
        account_id: &AccountId,
        idx: PeriodIndex,
        ctx: &mut EvalContext,
        values: &ValueSet,
    ) -> Result<f64> {
        let Some(period) = self.period_at(idx) else {
            return Ok(0.0);
        };
        // Dangling references read as zero; the validator reports them.
        let Some(account) = self.chart.account(account_id) else {
            return Ok(values.value_or_zero(account_id, &period.id));
        };

        if values.is_manual(account_id, &period.id) {
            return Ok(values.value_or_zero(account_id, &period.id));
        }

        let compiler = FormulaCompiler::new(&self.chart);
        let period_ctx = PeriodContext::new(period, idx > 0);

        match compiler.compile(account, &period_ctx)? {
            Some(node) => try_evaluate(&node, idx, &mut |ref_id: &AccountId, p: PeriodIndex| {
                self.lookup(ref_id, p, idx, ctx, values)
            }),
            // Childless totals keep what they hold; other cells without a
            // formula roll the previous period forward.
            None if idx == 0 || account.aggregation.is_some() => Ok(values
                .value(account_id, &period.id)
                .unwrap_or_else(|| self.carried_value(account_id, idx, values))),
            None => Ok(self.carried_value(account_id, idx, values)),
        }
    }

    /// Same-period references are resolved recursively through the memo table;
    /// earlier periods are read from the values already settled.
    fn lookup(
        &self,
        account_id: &AccountId,
        period: PeriodIndex,
        current: PeriodIndex,
        ctx: &mut EvalContext,
        values: &ValueSet,
    ) -> Result<f64> {
        if period == current {
            return self.resolve_cell(account_id, period, ctx, values);
        }
        Ok(self.stored_value(account_id, period, values))
    }

    fn stored_value(&self, account_id: &AccountId, idx: PeriodIndex, values: &ValueSet) -> f64 {
        self.period_at(idx)
            .map(|p| values.value_or_zero(account_id, &p.id))
            .unwrap_or(0.0)
    }

    fn carried_value(&self, account_id: &AccountId, idx: PeriodIndex, values: &ValueSet) -> f64 {
        self.stored_value(account_id, idx - 1, values)
    }

    fn stabilize(&self, mut values: ValueSet, indices: &[PeriodIndex]) -> Result<ValueSet> {
        let derived: Vec<&Account> = self
            .order
            .iter()
            .filter_map(|id| self.chart.account(id))
            .filter(|a| a.is_derived_total())
            .collect();

        let compiler = FormulaCompiler::new(&self.chart);

        for pass in 1..=self.settings.max_summary_passes {
            let mut changed = 0usize;

            for &idx in indices {
                let Some(period) = self.period_at(idx) else {
                    continue;
                };
                let period_ctx = PeriodContext::new(period, idx > 0);

                for account in &derived {
                    let result = match compiler.compile(account, &period_ctx) {
                        Ok(Some(node)) => {
                            evaluate(&node, idx, |ref_id, p| self.stored_value(ref_id, p, &values))
                        }
                        Ok(None) => continue,
                        Err(err) => Err(err),
                    };
                    let value = match result {
                        Ok(value) => value,
                        Err(err) if err.is_recoverable() && self.settings.carry_forward_on_error => {
                            warn!(
                                "Summary '{}' failed in period '{}': {}",
                                account.id, period.id, err
                            );
                            continue;
                        }
                        Err(err) => return Err(err),
                    };

                    let current = values.get(&account.id, &period.id);
                    let unchanged = current
                        .map(|cell| cell.value == value && cell.is_calculated)
                        .unwrap_or(false);
                    if !unchanged {
                        values.insert(account.id.clone(), period.id.clone(), value, true);
                        changed += 1;
                    }
                }
            }

            debug!("Summary pass {} updated {} cells", pass, changed);
            if changed == 0 {
                return Ok(values);
            }
        }

        warn!(
            "Summary totals still changing after {} passes",
            self.settings.max_summary_passes
        );
        Ok(values)
    }

    fn period_at(&self, idx: PeriodIndex) -> Option<&'m Period> {
        usize::try_from(idx).ok().and_then(|i| self.periods.get(i).copied())
    }

    fn period_id_at(&self, idx: PeriodIndex) -> &str {
        self.period_at(idx).map(|p| p.id.as_str()).unwrap_or("?")
    }
}

/// Recomputes all parameter-driven values and returns the full value set.
pub fn recompute_parameter_driven_values(model: &FinancialModel) -> Result<ValueSet> {
    validate_model(model)?;
    let engine = ModelEngine::new(model)?;
    let values = engine.recompute_parameter_driven(&model.values)?;
    info!(
        "Recomputed {} accounts over {} periods",
        model.accounts.len(),
        model.periods.len()
    );
    Ok(values)
}

pub fn recompute_summary_values(model: &FinancialModel) -> Result<ValueSet> {
    validate_model(model)?;
    let engine = ModelEngine::new(model)?;
    engine.recompute_summaries(&model.values)
}

/// Appends one forecast period, computes it for every account and stabilizes
/// its summary totals. Returns the extended model.
pub fn extend_model_by_one_period(model: &FinancialModel) -> Result<FinancialModel> {
    validate_model(model)?;
    let period = next_period(model)?;
    let period_id = period.id.clone();

    let mut extended = model.clone();
    extended.periods.push(period);

    // Leftover placeholders for the new key are replaced, even manual ones.
    let mut values = extended.values.clone();
    for account in &extended.accounts {
        values.remove(&account.id, &period_id);
    }

    let engine = ModelEngine::new(&extended)?;
    let idx = engine
        .periods
        .iter()
        .position(|p| p.id == period_id)
        .map(|i| i as PeriodIndex)
        .ok_or_else(|| ModelError::UnknownPeriod(period_id.to_string()))?;

    let mut ctx = EvalContext::new();
    engine.compute_period(idx, &mut ctx, &mut values)?;
    let values = engine.stabilize(values, &[idx])?;

    info!(
        "Added period '{}' ({} accounts computed)",
        period_id,
        extended.accounts.len()
    );

    extended.values = values;
    Ok(extended)
}

/// The period that follows the model's last one: next order, a fresh id, and
/// an end date stepped by the spacing of the last two periods.
pub fn next_period(model: &FinancialModel) -> Result<Period> {
    let ordered = model.ordered_periods();
    let order = ordered.last().map(|p| p.order + 1).unwrap_or(0);

    let used: HashSet<&str> = model.periods.iter().map(|p| p.id.as_str()).collect();
    let base = format!("P{}", order);
    let mut candidate = base.clone();
    let mut counter = 1;
    while used.contains(candidate.as_str()) {
        candidate = format!("{}_{}", base, counter);
        counter += 1;
    }

    let mut period = Period::new(PeriodId::from(candidate), order);

    let last_end = ordered.last().and_then(|p| p.end_date);
    if let Some(last_end) = last_end {
        let step = match ordered.len().checked_sub(2).and_then(|i| ordered[i].end_date) {
            Some(prev_end) => months_between(prev_end, last_end).max(1),
            None => 1,
        };
        let end_date = advance_month_end(last_end, step)
            .ok_or_else(|| ModelError::DateError(format!("Cannot advance {} by {} months", last_end, step)))?;
        period.label = period_label(end_date);
        period.end_date = Some(end_date);
    }

    Ok(period)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Aggregation, KeyAccount, Parameter, ParameterReference};
    use chrono::NaiveDate;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn value(values: &ValueSet, account: &str, period: &str) -> f64 {
        values
            .value(&AccountId::from(account), &PeriodId::from(period))
            .unwrap_or_else(|| panic!("missing {}@{}", account, period))
    }

    fn revenue_model() -> FinancialModel {
        let accounts = vec![
            Account::flow("rev-total", "Revenue Total")
                .with_aggregation(Aggregation::ChildrenSum)
                .with_key(KeyAccount::RevenueTotal),
            Account::flow("rev", "Revenue")
                .with_parent("rev-total")
                .with_parameter(Parameter::growth_rate(0.1)),
            Account::flow("cogs", "Cost of Sales").with_parameter(Parameter::percentage(0.6, "rev")),
            Account::flow("gp", "Gross Profit").with_parameter(Parameter::calculation(vec![
                ParameterReference::new("rev"),
                ParameterReference::new("cogs").with_operation(crate::schema::Operation::Sub),
            ])),
        ];
        let periods = vec![
            Period::imported("2023-12", 0).with_end_date(ymd(2023, 12, 31)),
            Period::new("2024-01", 1).with_end_date(ymd(2024, 1, 31)),
        ];
        let values = ValueSet::new()
            .with(&AccountId::from("rev"), &PeriodId::from("2023-12"), 1_000_000.0, false)
            .with(&AccountId::from("cogs"), &PeriodId::from("2023-12"), 600_000.0, false)
            .with(&AccountId::from("rev-total"), &PeriodId::from("2023-12"), 1_000_000.0, false);
        FinancialModel::new(accounts, periods, values)
    }

    #[test]
    fn test_recompute_forecast_period() {
        let model = revenue_model();
        let values = recompute_parameter_driven_values(&model).unwrap();

        assert!((value(&values, "rev", "2024-01") - 1_100_000.0).abs() < 1e-6);
        assert!((value(&values, "cogs", "2024-01") - 660_000.0).abs() < 1e-6);
        assert!((value(&values, "gp", "2024-01") - 440_000.0).abs() < 1e-6);
        assert!((value(&values, "rev-total", "2024-01") - 1_100_000.0).abs() < 1e-6);
        // Imported period untouched.
        assert_eq!(value(&values, "rev", "2023-12"), 1_000_000.0);
        assert_eq!(model.values.len(), 3);
    }

    #[test]
    fn test_manual_values_survive_recompute() {
        let mut model = revenue_model();
        model.values.insert(
            AccountId::from("rev"),
            PeriodId::from("2024-01"),
            1_500_000.0,
            false,
        );

        let values = recompute_parameter_driven_values(&model).unwrap();
        assert_eq!(value(&values, "rev", "2024-01"), 1_500_000.0);
        assert!((value(&values, "cogs", "2024-01") - 900_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_division_by_zero_is_isolated() {
        let mut model = revenue_model();
        model.accounts.push(Account::flow("units", "Units"));
        model.accounts.push(
            Account::flow("margin", "Margin").with_parameter(Parameter::calculation(vec![
                ParameterReference::new("gp"),
                ParameterReference::new("units").with_operation(crate::schema::Operation::Div),
            ])),
        );
        model
            .values
            .insert(AccountId::from("margin"), PeriodId::from("2023-12"), 0.4, false);

        let values = recompute_parameter_driven_values(&model).unwrap();
        assert_eq!(value(&values, "margin", "2024-01"), 0.4);
        assert!((value(&values, "rev", "2024-01") - 1_100_000.0).abs() < 1e-6);

        model.settings.carry_forward_on_error = false;
        let err = recompute_parameter_driven_values(&model).unwrap_err();
        assert!(matches!(err, ModelError::DivisionByZero { .. }));
    }

    #[test]
    fn test_edit_upstream_rolls_into_later_periods() {
        let mut model = revenue_model();
        model.accounts.push(Account::flow("opex", "Operating Expenses"));
        model.periods.push(Period::new("2024-02", 2));
        model
            .values
            .insert(AccountId::from("opex"), PeriodId::from("2023-12"), 100.0, false);

        let first = model.with_values(recompute_parameter_driven_values(&model).unwrap());
        assert_eq!(value(&first.values, "opex", "2024-02"), 100.0);

        let mut edited = first.clone();
        edited
            .values
            .insert(AccountId::from("opex"), PeriodId::from("2024-01"), 200.0, false);
        let values = recompute_parameter_driven_values(&edited).unwrap();

        assert_eq!(value(&values, "opex", "2024-01"), 200.0);
        assert_eq!(value(&values, "opex", "2024-02"), 200.0);
        let cell = values
            .get(&AccountId::from("opex"), &PeriodId::from("2024-02"))
            .unwrap();
        assert!(cell.is_calculated);
    }

    #[test]
    fn test_cycle_is_fatal() {
        let mut model = revenue_model();
        model.accounts.push(Account::flow("a", "A").with_parameter(Parameter::reference("b")));
        model.accounts.push(Account::flow("b", "B").with_parameter(Parameter::reference("a")));

        let err = recompute_parameter_driven_values(&model).unwrap_err();
        assert_eq!(
            err,
            ModelError::CircularDependency {
                account_id: AccountId::from("a")
            }
        );
    }

    #[test]
    fn test_summary_pass_is_idempotent() {
        let model = revenue_model();
        let values = recompute_parameter_driven_values(&model).unwrap();
        let once = recompute_summary_values(&model.with_values(values)).unwrap();
        let twice = recompute_summary_values(&model.with_values(once.clone())).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_invalid_model_is_not_computed() {
        let mut model = revenue_model();
        model
            .accounts
            .push(Account::flow("bad", "Bad").with_parameter(Parameter::cash_change()));

        for err in [
            extend_model_by_one_period(&model).unwrap_err(),
            recompute_parameter_driven_values(&model).unwrap_err(),
            recompute_summary_values(&model).unwrap_err(),
        ] {
            assert!(matches!(
                err,
                ModelError::InconsistentStructure {
                    account_id: Some(_),
                    ..
                }
            ));
        }
    }

    #[test]
    fn test_summary_pass_fixes_stale_total() {
        let mut model = revenue_model();
        model.values.insert(
            AccountId::from("rev-total"),
            PeriodId::from("2023-12"),
            5.0,
            true,
        );
        let values = recompute_summary_values(&model).unwrap();
        assert_eq!(value(&values, "rev-total", "2023-12"), 1_000_000.0);
    }

    #[test]
    fn test_extend_by_one_period() {
        let model = revenue_model();
        let first = model.with_values(recompute_parameter_driven_values(&model).unwrap());
        let extended = extend_model_by_one_period(&first).unwrap();

        assert_eq!(extended.periods.len(), 3);
        let added = extended.last_period().unwrap();
        assert_eq!(added.id, PeriodId::from("P2"));
        assert_eq!(added.order, 2);
        assert_eq!(added.label, "2024-02");
        assert_eq!(added.end_date, Some(ymd(2024, 2, 29)));
        assert!(!added.is_from_excel && !added.is_actual);

        assert!((value(&extended.values, "rev", "P2") - 1_210_000.0).abs() < 1e-6);
        assert!((value(&extended.values, "rev-total", "P2") - 1_210_000.0).abs() < 1e-6);
        assert_eq!(first.periods.len(), 2);
    }

    #[test]
    fn test_next_period_id_and_step() {
        let model = FinancialModel::new(
            Vec::new(),
            vec![
                Period::new("P1", 0).with_end_date(ymd(2023, 3, 31)),
                Period::new("2023-Q2", 1).with_end_date(ymd(2023, 6, 30)),
            ],
            ValueSet::new(),
        );
        let next = next_period(&model).unwrap();
        assert_eq!(next.order, 2);
        assert_eq!(next.id, PeriodId::from("P2"));
        assert_eq!(next.end_date, Some(ymd(2023, 9, 30)));

        let model = FinancialModel::new(
            Vec::new(),
            vec![Period::new("P0", 0), Period::new("P1", 1), Period::new("P2", 3)],
            ValueSet::new(),
        );
        let next = next_period(&model).unwrap();
        assert_eq!(next.id, PeriodId::from("P4"));
        assert_eq!(next.end_date, None);

        let model = FinancialModel::new(Vec::new(), vec![Period::new("P1", 0)], ValueSet::new());
        assert_eq!(next_period(&model).unwrap().id, PeriodId::from("P1_1"));
    }
}
