use crate::error::ModelError;
use crate::values::ValueSet;
use chrono::NaiveDate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for AccountId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct PeriodId(pub String);

impl PeriodId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeriodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeriodId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeriodId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub enum AccountBehavior {
    #[schemars(
        description = "Flow accounts represent activity over a period (e.g., Revenue, Depreciation)."
    )]
    Flow,

    #[schemars(
        description = "Stock accounts carry a period-end balance (e.g., Cash, Accounts Receivable, Retained Earnings)."
    )]
    Stock,
}

/// Declares how an account's forecast value is derived.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParameterType {
    None,
    GrowthRate,
    Percentage,
    Proportionate,
    Calculation,
    Reference,
    FixedValue,
    BsChange,
    CfAdjustmentCalc,
    CashChangeCalculation,
    CashEndingBalance,
    CashBeginningBalance,
}

impl ParameterType {
    pub const ALL: [ParameterType; 12] = [
        ParameterType::None,
        ParameterType::GrowthRate,
        ParameterType::Percentage,
        ParameterType::Proportionate,
        ParameterType::Calculation,
        ParameterType::Reference,
        ParameterType::FixedValue,
        ParameterType::BsChange,
        ParameterType::CfAdjustmentCalc,
        ParameterType::CashChangeCalculation,
        ParameterType::CashEndingBalance,
        ParameterType::CashBeginningBalance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterType::None => "NONE",
            ParameterType::GrowthRate => "GROWTH_RATE",
            ParameterType::Percentage => "PERCENTAGE",
            ParameterType::Proportionate => "PROPORTIONATE",
            ParameterType::Calculation => "CALCULATION",
            ParameterType::Reference => "REFERENCE",
            ParameterType::FixedValue => "FIXED_VALUE",
            ParameterType::BsChange => "BS_CHANGE",
            ParameterType::CfAdjustmentCalc => "CF_ADJUSTMENT_CALC",
            ParameterType::CashChangeCalculation => "CASH_CHANGE_CALCULATION",
            ParameterType::CashEndingBalance => "CASH_ENDING_BALANCE",
            ParameterType::CashBeginningBalance => "CASH_BEGINNING_BALANCE",
        }
    }

    /// Parses an import tag such as `GROWTH_RATE`, `growth-rate` or `growth rate`.
    pub fn parse(tag: &str) -> Option<Self> {
        let normalized: String = tag
            .trim()
            .chars()
            .map(|c| match c {
                '-' | ' ' => '_',
                other => other.to_ascii_uppercase(),
            })
            .collect();

        Self::ALL.into_iter().find(|t| t.as_str() == normalized)
    }

    /// Parameter types that cannot compile without at least one reference account.
    /// `CASH_BEGINNING_BALANCE` is absent because it may fall back to the classified cash total.
    pub fn requires_reference(&self) -> bool {
        matches!(
            self,
            ParameterType::Percentage
                | ParameterType::Proportionate
                | ParameterType::Calculation
                | ParameterType::Reference
                | ParameterType::BsChange
                | ParameterType::CfAdjustmentCalc
                | ParameterType::CashEndingBalance
        )
    }

    pub fn requires_value(&self) -> bool {
        matches!(self, ParameterType::GrowthRate | ParameterType::Percentage)
    }

    /// Parameter types that only cash-flow items may carry.
    pub fn is_cash_flow_only(&self) -> bool {
        matches!(
            self,
            ParameterType::BsChange
                | ParameterType::CfAdjustmentCalc
                | ParameterType::CashChangeCalculation
                | ParameterType::CashEndingBalance
                | ParameterType::CashBeginningBalance
        )
    }
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for ParameterType {
    fn default() -> Self {
        Self::None
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Add,
    Sub,
    Mul,
    Div,
}

impl Operation {
    /// +1 for ADD, -1 for SUB. Multiplicative operations carry no sign.
    pub fn sign(&self) -> f64 {
        match self {
            Operation::Sub => -1.0,
            _ => 1.0,
        }
    }

    pub fn parse(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_uppercase().as_str() {
            "ADD" | "+" => Some(Operation::Add),
            "SUB" | "-" => Some(Operation::Sub),
            "MUL" | "*" => Some(Operation::Mul),
            "DIV" | "/" => Some(Operation::Div),
            _ => None,
        }
    }
}

impl Default for Operation {
    fn default() -> Self {
        Self::Add
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CfCategory {
    Operating,
    Investing,
    Financing,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct ParameterReference {
    pub account_id: AccountId,

    #[serde(default)]
    pub operation: Operation,

    #[serde(default)]
    #[schemars(description = "Number of periods to look back when resolving the reference")]
    pub lag: u32,
}

impl ParameterReference {
    pub fn new(account_id: impl Into<AccountId>) -> Self {
        Self {
            account_id: account_id.into(),
            operation: Operation::Add,
            lag: 0,
        }
    }

    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operation = operation;
        self
    }

    pub fn with_lag(mut self, lag: u32) -> Self {
        self.lag = lag;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, JsonSchema)]
pub struct Parameter {
    #[serde(default)]
    pub parameter_type: ParameterType,

    #[serde(default)]
    #[schemars(
        description = "Rate or percentage expressed as a fraction (0.10 = 10%). Used by GROWTH_RATE and PERCENTAGE."
    )]
    pub value: Option<f64>,

    #[serde(default)]
    pub references: Vec<ParameterReference>,
}

impl Parameter {
    pub fn none() -> Self {
        Self::default()
    }

    fn of(parameter_type: ParameterType, value: Option<f64>, references: Vec<ParameterReference>) -> Self {
        Self {
            parameter_type,
            value,
            references,
        }
    }

    pub fn growth_rate(rate: f64) -> Self {
        Self::of(ParameterType::GrowthRate, Some(rate), Vec::new())
    }

    pub fn percentage(pct: f64, reference: impl Into<AccountId>) -> Self {
        Self::of(
            ParameterType::Percentage,
            Some(pct),
            vec![ParameterReference::new(reference)],
        )
    }

    pub fn proportionate(reference: impl Into<AccountId>) -> Self {
        Self::of(
            ParameterType::Proportionate,
            None,
            vec![ParameterReference::new(reference)],
        )
    }

    pub fn calculation(references: Vec<ParameterReference>) -> Self {
        Self::of(ParameterType::Calculation, None, references)
    }

    pub fn reference(reference: impl Into<AccountId>) -> Self {
        Self::of(
            ParameterType::Reference,
            None,
            vec![ParameterReference::new(reference)],
        )
    }

    pub fn fixed_value() -> Self {
        Self::of(ParameterType::FixedValue, None, Vec::new())
    }

    pub fn bs_change(reference: impl Into<AccountId>, operation: Operation) -> Self {
        Self::of(
            ParameterType::BsChange,
            None,
            vec![ParameterReference::new(reference).with_operation(operation)],
        )
    }

    pub fn cf_adjustment_calc(reference: impl Into<AccountId>, operation: Operation) -> Self {
        Self::of(
            ParameterType::CfAdjustmentCalc,
            None,
            vec![ParameterReference::new(reference).with_operation(operation)],
        )
    }

    pub fn cash_change() -> Self {
        Self::of(ParameterType::CashChangeCalculation, None, Vec::new())
    }

    pub fn cash_ending(references: Vec<ParameterReference>) -> Self {
        Self::of(ParameterType::CashEndingBalance, None, references)
    }

    pub fn cash_beginning(cash_total: Option<AccountId>) -> Self {
        Self::of(
            ParameterType::CashBeginningBalance,
            None,
            cash_total.map(ParameterReference::new).into_iter().collect(),
        )
    }

    pub fn first_reference(&self) -> Option<&ParameterReference> {
        self.references.first()
    }
}

/// A flow account's declared effect on a target stock account's movement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct CfAdjustment {
    pub target_account_id: AccountId,
    pub operation: Operation,
    pub cf_category: CfCategory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct FormulaTerm {
    pub account_id: AccountId,
    #[serde(default)]
    pub operation: Operation,
}

impl FormulaTerm {
    pub fn add(account_id: impl Into<AccountId>) -> Self {
        Self {
            account_id: account_id.into(),
            operation: Operation::Add,
        }
    }

    pub fn sub(account_id: impl Into<AccountId>) -> Self {
        Self {
            account_id: account_id.into(),
            operation: Operation::Sub,
        }
    }
}

/// How a summary account is derived from other accounts in the same period.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Aggregation {
    #[schemars(description = "Sum of all accounts whose parent is this account")]
    ChildrenSum,

    #[schemars(
        description = "Cross-category formula total, e.g. Gross Profit = Revenue Total - Cost of Sales Total"
    )]
    Formula { terms: Vec<FormulaTerm> },
}

/// Summary lines that downstream logic looks up by classification rather than by id.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, JsonSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyAccount {
    RevenueTotal,
    CostOfSalesTotal,
    GrossProfit,
    OperatingProfit,
    AssetTotal,
    LiabilityTotal,
    EquityTotal,
    LiabilitiesAndEquityTotal,
    CashTotal,
    CashBeginningBalance,
    CashChange,
    CashEndingBalance,
}

/// Relation links, resolved to ids when the model is built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountRelation {
    /// Carried by a PPE asset: rolls forward with investment and depreciation.
    Ppe {
        investment_account_id: AccountId,
        depreciation_account_id: AccountId,
    },
    /// Carried by a retained-earnings account: rolls forward with the profit line.
    RetainedEarnings { profit_account_id: AccountId },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct Account {
    pub id: AccountId,

    #[schemars(description = "Display name as it appears in the imported statements")]
    pub name: String,

    pub behavior: AccountBehavior,

    #[serde(default)]
    pub parent_id: Option<AccountId>,

    #[serde(default)]
    pub aggregation: Option<Aggregation>,

    #[serde(default)]
    pub key: Option<KeyAccount>,

    #[serde(default)]
    pub parameter: Parameter,

    #[serde(default)]
    #[schemars(
        description = "true = liability/equity (increase is cash in), false = asset (increase is cash out), null = not balance-sheet relevant"
    )]
    pub is_credit: Option<bool>,

    #[serde(default)]
    pub is_cf_item: bool,

    #[serde(default)]
    pub cf_adjustment: Option<CfAdjustment>,

    #[serde(default)]
    pub base_profit: bool,

    #[serde(default)]
    #[schemars(description = "Stock account whose period-over-period delta feeds the cash change")]
    pub generates_cf_item: bool,

    #[serde(default)]
    pub relation: Option<AccountRelation>,
}

impl Account {
    pub fn new(id: impl Into<AccountId>, name: impl Into<String>, behavior: AccountBehavior) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            behavior,
            parent_id: None,
            aggregation: None,
            key: None,
            parameter: Parameter::none(),
            is_credit: None,
            is_cf_item: false,
            cf_adjustment: None,
            base_profit: false,
            generates_cf_item: false,
            relation: None,
        }
    }

    pub fn flow(id: impl Into<AccountId>, name: impl Into<String>) -> Self {
        Self::new(id, name, AccountBehavior::Flow)
    }

    pub fn stock(id: impl Into<AccountId>, name: impl Into<String>, is_credit: bool) -> Self {
        let mut account = Self::new(id, name, AccountBehavior::Stock);
        account.is_credit = Some(is_credit);
        account
    }

    pub fn cf_item(id: impl Into<AccountId>, name: impl Into<String>, parameter: Parameter) -> Self {
        let mut account = Self::new(id, name, AccountBehavior::Flow);
        account.is_cf_item = true;
        account.parameter = parameter;
        account
    }

    pub fn with_parameter(mut self, parameter: Parameter) -> Self {
        self.parameter = parameter;
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<AccountId>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = Some(aggregation);
        self
    }

    pub fn with_key(mut self, key: KeyAccount) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_credit(mut self, is_credit: Option<bool>) -> Self {
        self.is_credit = is_credit;
        self
    }

    pub fn with_cf_adjustment(
        mut self,
        target_account_id: impl Into<AccountId>,
        operation: Operation,
        cf_category: CfCategory,
    ) -> Self {
        self.cf_adjustment = Some(CfAdjustment {
            target_account_id: target_account_id.into(),
            operation,
            cf_category,
        });
        self
    }

    pub fn with_relation(mut self, relation: AccountRelation) -> Self {
        self.relation = Some(relation);
        self
    }

    pub fn as_base_profit(mut self) -> Self {
        self.base_profit = true;
        self
    }

    pub fn generating_cf_item(mut self) -> Self {
        self.generates_cf_item = true;
        self
    }

    pub fn is_stock(&self) -> bool {
        self.behavior == AccountBehavior::Stock
    }

    pub fn is_children_sum(&self) -> bool {
        matches!(self.aggregation, Some(Aggregation::ChildrenSum))
    }

    /// Summary totals and CF items are fully derived; they never hold manual input.
    pub fn is_derived_total(&self) -> bool {
        self.aggregation.is_some() || self.is_cf_item
    }

    /// Sign that turns an increase of this balance into its cash effect:
    /// +1 for liabilities/equity, -1 for assets, `None` when not balance-sheet relevant.
    pub fn cash_sign(&self) -> Option<f64> {
        self.is_credit.map(|credit| if credit { 1.0 } else { -1.0 })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct Period {
    pub id: PeriodId,

    #[serde(default)]
    #[schemars(description = "Display label such as 2024-03")]
    pub label: String,

    #[schemars(description = "Dense, strictly increasing position of the period")]
    pub order: i64,

    #[serde(default)]
    pub end_date: Option<NaiveDate>,

    #[serde(default)]
    pub is_actual: bool,

    #[serde(default)]
    #[schemars(
        description = "Imported periods are fixed historical fact and never recomputed from parameters"
    )]
    pub is_from_excel: bool,
}

impl Period {
    pub fn new(id: impl Into<PeriodId>, order: i64) -> Self {
        let id = id.into();
        Self {
            label: id.to_string(),
            id,
            order,
            end_date: None,
            is_actual: false,
            is_from_excel: false,
        }
    }

    /// An imported actual period.
    pub fn imported(id: impl Into<PeriodId>, order: i64) -> Self {
        let mut period = Self::new(id, order);
        period.is_actual = true;
        period.is_from_excel = true;
        period
    }

    pub fn with_end_date(mut self, end_date: NaiveDate) -> Self {
        self.end_date = Some(end_date);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct Value {
    pub account_id: AccountId,
    pub period_id: PeriodId,
    pub value: f64,
    #[serde(default)]
    pub is_calculated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct EngineSettings {
    #[serde(default = "default_max_summary_passes")]
    #[schemars(description = "Upper bound on stabilizing sweeps over summary totals")]
    pub max_summary_passes: usize,

    #[serde(default = "default_balance_tolerance")]
    pub balance_tolerance: f64,

    #[serde(default = "default_carry_forward_on_error")]
    #[schemars(
        description = "When true, an account that fails to evaluate carries its previous value forward instead of aborting the pass"
    )]
    pub carry_forward_on_error: bool,
}

fn default_max_summary_passes() -> usize {
    16
}

fn default_balance_tolerance() -> f64 {
    1e-6
}

fn default_carry_forward_on_error() -> bool {
    true
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_summary_passes: default_max_summary_passes(),
            balance_tolerance: default_balance_tolerance(),
            carry_forward_on_error: default_carry_forward_on_error(),
        }
    }
}

/// An immutable snapshot of the model handed to the engine by the host application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct FinancialModel {
    #[serde(default)]
    pub name: String,

    pub accounts: Vec<Account>,

    pub periods: Vec<Period>,

    #[serde(default)]
    #[schemars(with = "Vec<Value>")]
    pub values: ValueSet,

    #[serde(default)]
    pub settings: EngineSettings,
}

impl FinancialModel {
    pub fn new(accounts: Vec<Account>, periods: Vec<Period>, values: ValueSet) -> Self {
        Self {
            name: String::new(),
            accounts,
            periods,
            values,
            settings: EngineSettings::default(),
        }
    }

    pub fn account(&self, id: &AccountId) -> Option<&Account> {
        self.accounts.iter().find(|a| &a.id == id)
    }

    pub fn period(&self, id: &PeriodId) -> Option<&Period> {
        self.periods.iter().find(|p| &p.id == id)
    }

    /// Periods sorted by `order`.
    pub fn ordered_periods(&self) -> Vec<&Period> {
        let mut periods: Vec<&Period> = self.periods.iter().collect();
        periods.sort_by_key(|p| p.order);
        periods
    }

    pub fn previous_period(&self, id: &PeriodId) -> Option<&Period> {
        let current = self.period(id)?;
        self.periods
            .iter()
            .filter(|p| p.order < current.order)
            .max_by_key(|p| p.order)
    }

    pub fn last_period(&self) -> Option<&Period> {
        self.periods.iter().max_by_key(|p| p.order)
    }

    pub fn with_values(&self, values: ValueSet) -> Self {
        let mut model = self.clone();
        model.values = values;
        model
    }

    /// Loads and validates a model snapshot. Parameter type tags are read the
    /// same way the import records read them; an unknown tag is reported
    /// against its account.
    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        let mut raw: serde_json::Value = serde_json::from_str(json)?;
        normalize_parameter_tags(&mut raw)?;

        let model: FinancialModel = serde_json::from_value(raw)?;
        crate::validation::validate_model(&model)?;
        Ok(model)
    }

    pub fn to_json_pretty(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(FinancialModel)
    }

    pub fn schema_as_json() -> Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }
}

fn normalize_parameter_tags(raw: &mut serde_json::Value) -> crate::error::Result<()> {
    let Some(accounts) = raw.get_mut("accounts").and_then(|a| a.as_array_mut()) else {
        return Ok(());
    };

    for account in accounts {
        let account_id = account
            .get("id")
            .and_then(|id| id.as_str())
            .unwrap_or_default()
            .to_string();
        let Some(tag) = account.pointer_mut("/parameter/parameter_type") else {
            continue;
        };
        let Some(text) = tag.as_str() else {
            continue;
        };

        let parameter_type =
            ParameterType::parse(text).ok_or_else(|| ModelError::UnknownParameterType {
                account_id: AccountId::from(account_id.as_str()),
                parameter_type: text.to_string(),
            })?;
        *tag = serde_json::Value::String(parameter_type.as_str().to_string());
    }

    Ok(())
}
