//! # Financial Model Engine
//!
//! A calculation engine for driver-based financial forecasts: account values in
//! forecast periods are derived from declarative parameters (growth rates,
//! percentages of other accounts, multi-account formulas, balance-sheet deltas)
//! and reconciled into an indirect-method cash flow.
//!
//! ## Core Concepts
//!
//! - **Accounts**: Stock (balance) or flow (activity) lines, organised in a parent/child hierarchy
//! - **Parameters**: How a forecast value is derived; compiled into an expression tree per period
//! - **Calculation Order**: Same-period dependencies sorted topologically; lagged references never form cycles
//! - **Imported Periods**: Historical fact, never recomputed from parameters
//! - **Cash Reconciliation**: Profit + non-cash add-backs + working-capital deltas = cash change
//!
//! ## Example
//!
//! ```rust,ignore
//! use financial_model_engine::*;
//!
//! let model = ModelBuilder::new("ACME Corp")
//!     .account(AccountRecord {
//!         parameter_type: "GROWTH_RATE".to_string(),
//!         parameter_value: Some(0.10),
//!         ..AccountRecord::flow("Revenue")
//!     })
//!     .account(AccountRecord {
//!         parameter_type: "PERCENTAGE".to_string(),
//!         parameter_value: Some(0.60),
//!         references: vec![ReferenceRecord {
//!             account: "Revenue".to_string(),
//!             operation: None,
//!             lag: 0,
//!         }],
//!         ..AccountRecord::flow("Cost of Sales")
//!     })
//!     .period(PeriodRecord::imported("2023-12"))
//!     .value("Revenue", "2023-12", 1_000_000.0)
//!     .build()?;
//!
//! let forecast = extend_model_by_one_period(&model)?;
//! ```

pub mod ast;
pub mod balancer;
pub mod cash_flow;
pub mod chart_of_accounts;
pub mod dependency;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod formula;
pub mod ingestion;
pub mod overrides;
pub mod schema;
pub mod utils;
pub mod validation;
pub mod values;

pub use ast::Node;
pub use balancer::{verify_all_periods, verify_balance_sheet, BalanceSheetCheck, BalanceSheetTotals};
pub use cash_flow::{reconcile_cash_flow, CashContribution, CashFlowReconciliation};
pub use chart_of_accounts::ChartOfAccounts;
pub use dependency::{get_calculation_order, DependencyGraph};
pub use engine::{
    extend_model_by_one_period, next_period, recompute_parameter_driven_values,
    recompute_summary_values, ModelEngine,
};
pub use error::{ModelError, Result};
pub use evaluator::{evaluate, try_evaluate, EvalContext, PeriodIndex};
pub use formula::{compile_formula, FormulaCompiler, PeriodContext};
pub use ingestion::*;
pub use overrides::*;
pub use schema::*;
pub use utils::*;
pub use validation::{validate_model, Validator};
pub use values::{CellValue, ValueSet};

use log::{debug, info};

pub struct ForecastProcessor;

impl ForecastProcessor {
    /// Validates the model, recomputes every forecast period and settles the
    /// summary totals. Returns a new model; the input is left as it was.
    pub fn process(model: &FinancialModel) -> Result<FinancialModel> {
        validate_model(model)?;

        info!("Processing financial model: {}", model.name);
        debug!(
            "Model contains {} accounts, {} periods and {} values",
            model.accounts.len(),
            model.periods.len(),
            model.values.len()
        );

        let engine = ModelEngine::new(model)?;
        let values = engine.recompute_parameter_driven(&model.values)?;
        let values = engine.recompute_summaries(&values)?;

        Ok(model.with_values(values))
    }

    /// Like [`ForecastProcessor::process`], then checks that every period balances.
    pub fn process_with_verification(model: &FinancialModel) -> Result<FinancialModel> {
        let processed = Self::process(model)?;
        verify_all_periods(&processed)?;
        Ok(processed)
    }

    /// Brings existing forecast periods up to date, then appends `periods`
    /// more, one at a time.
    pub fn forecast(model: &FinancialModel, periods: usize) -> Result<FinancialModel> {
        let mut current = Self::process(model)?;
        for _ in 0..periods {
            current = extend_model_by_one_period(&current)?;
        }
        Ok(current)
    }
}

pub fn process_model(model: &FinancialModel) -> Result<FinancialModel> {
    ForecastProcessor::process(model)
}

pub fn process_with_verification(model: &FinancialModel) -> Result<FinancialModel> {
    ForecastProcessor::process_with_verification(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balance_sheet_model() -> FinancialModel {
        let accounts = vec![
            Account::stock("assets", "Total Assets", false)
                .with_aggregation(Aggregation::ChildrenSum)
                .with_key(KeyAccount::AssetTotal),
            Account::stock("cash", "Cash", false)
                .with_parent("assets")
                .with_parameter(Parameter::fixed_value()),
            Account::stock("ar", "Receivables", false)
                .with_parent("assets")
                .with_parameter(Parameter::percentage(0.5, "sales")),
            Account::stock("le", "Total Liabilities & Equity", true)
                .with_aggregation(Aggregation::ChildrenSum)
                .with_key(KeyAccount::LiabilitiesAndEquityTotal),
            Account::stock("loan", "Loan", true)
                .with_parent("le")
                .with_parameter(Parameter::fixed_value()),
            Account::stock("equity", "Equity", true)
                .with_parent("le")
                .with_parameter(Parameter::calculation(vec![
                    ParameterReference::new("cash"),
                    ParameterReference::new("ar"),
                    ParameterReference::new("loan").with_operation(Operation::Sub),
                ])),
            Account::flow("sales", "Sales").with_parameter(Parameter::growth_rate(0.2)),
        ];
        let p0 = PeriodId::from("2023-12");
        let values = ValueSet::new()
            .with(&AccountId::from("cash"), &p0, 500.0, false)
            .with(&AccountId::from("ar"), &p0, 500.0, false)
            .with(&AccountId::from("loan"), &p0, 400.0, false)
            .with(&AccountId::from("equity"), &p0, 600.0, false)
            .with(&AccountId::from("sales"), &p0, 1000.0, false);

        FinancialModel::new(
            accounts,
            vec![Period::imported("2023-12", 0), Period::new("2024-01", 1)],
            values,
        )
    }

    #[test]
    fn test_end_to_end_processing() {
        let model = balance_sheet_model();
        let processed = process_with_verification(&model).unwrap();

        let p1 = PeriodId::from("2024-01");
        let ar = processed.values.value(&AccountId::from("ar"), &p1).unwrap();
        assert!((ar - 600.0).abs() < 1e-9);
        let assets = processed.values.value(&AccountId::from("assets"), &p1).unwrap();
        assert!((assets - 1100.0).abs() < 1e-9);
    }

    #[test]
    fn test_forecast_several_periods() {
        let model = balance_sheet_model();
        let forecast = ForecastProcessor::forecast(&model, 3).unwrap();

        assert_eq!(forecast.periods.len(), 5);
        let last = forecast.last_period().unwrap();
        assert_eq!(last.order, 4);

        let sales = forecast.values.value(&AccountId::from("sales"), &last.id).unwrap();
        assert!((sales - 1000.0 * 1.2_f64.powi(4)).abs() < 1e-6, "got {}", sales);
    }

    #[test]
    fn test_invalid_model_is_rejected() {
        let mut model = balance_sheet_model();
        model.accounts.push(Account::flow("bad", "Bad").with_parameter(Parameter {
            parameter_type: ParameterType::Reference,
            value: None,
            references: Vec::new(),
        }));
        assert!(matches!(
            process_model(&model),
            Err(ModelError::MissingReference { .. })
        ));
    }
}
