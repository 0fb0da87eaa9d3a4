//! Turns an account's declared parameter into a formula tree.
//!
//! `Ok(None)` means "no formula": the caller keeps or carries forward the value.

use crate::ast::Node;
use crate::chart_of_accounts::ChartOfAccounts;
use crate::error::{ModelError, Result};
use crate::schema::{
    Account, AccountRelation, Aggregation, KeyAccount, Operation, ParameterReference,
    ParameterType, Period,
};

/// The period a formula is compiled for.
#[derive(Debug, Clone, Copy)]
pub struct PeriodContext<'a> {
    pub period: Option<&'a Period>,
    /// Whether a period precedes this one. Roll-forward formulas need one.
    pub has_previous: bool,
}

impl<'a> PeriodContext<'a> {
    pub fn new(period: &'a Period, has_previous: bool) -> Self {
        Self {
            period: Some(period),
            has_previous,
        }
    }

    /// A period with history and no import lock; used to read a formula's full shape.
    pub fn steady_state() -> Self {
        Self {
            period: None,
            has_previous: true,
        }
    }

    fn is_imported(&self) -> bool {
        self.period.map(|p| p.is_from_excel).unwrap_or(false)
    }
}

/// Compiles the formula of `account` for the given period.
///
/// Summary aggregations take precedence over the parameter. Parameter-driven
/// accounts never get a formula in imported periods.
pub fn compile_formula(
    account: &Account,
    period: &PeriodContext<'_>,
    accounts: &[Account],
) -> Result<Option<Node>> {
    let chart = ChartOfAccounts::new(accounts);
    FormulaCompiler::new(&chart).compile(account, period)
}

pub struct FormulaCompiler<'c, 'a> {
    chart: &'c ChartOfAccounts<'a>,
}

impl<'c, 'a> FormulaCompiler<'c, 'a> {
    pub fn new(chart: &'c ChartOfAccounts<'a>) -> Self {
        Self { chart }
    }

    pub fn compile(&self, account: &Account, period: &PeriodContext<'_>) -> Result<Option<Node>> {
        if let Some(aggregation) = &account.aggregation {
            return Ok(self.compile_aggregation(account, aggregation));
        }

        if !account.is_cf_item && period.is_imported() {
            return Ok(None);
        }

        let parameter = &account.parameter;
        let self_ref = || Node::reference(&account.id, 1);

        let node = match parameter.parameter_type {
            ParameterType::None => {
                if account.is_stock() && !account.is_cf_item {
                    self.synthesize_stock(account, period)
                } else {
                    None
                }
            }
            ParameterType::GrowthRate => {
                let rate = required_value(account)?;
                period
                    .has_previous
                    .then(|| Node::mul(self_ref(), Node::constant(1.0 + rate)))
            }
            ParameterType::Percentage => {
                let reference = required_reference(account)?;
                let pct = required_value(account)?;
                Some(Node::mul(ref_node(reference), Node::constant(pct)))
            }
            ParameterType::Proportionate => {
                let reference = required_reference(account)?;
                period.has_previous.then(|| {
                    let current = Node::reference(&reference.account_id, 0);
                    let previous = Node::reference(&reference.account_id, 1);
                    let growth = Node::sub(Node::div(current, previous), Node::constant(1.0));
                    Node::mul(self_ref(), Node::add(vec![Node::constant(1.0), growth]))
                })
            }
            ParameterType::Calculation => {
                if parameter.references.is_empty() {
                    return Err(missing_reference(account));
                }
                fold_terms(
                    parameter
                        .references
                        .iter()
                        .map(|r| (ref_node(r), r.operation)),
                )
            }
            ParameterType::Reference => Some(ref_node(required_reference(account)?)),
            ParameterType::FixedValue => period.has_previous.then(self_ref),
            ParameterType::BsChange => {
                let reference = required_reference(account)?;
                period.has_previous.then(|| {
                    let delta = Node::sub(
                        Node::reference(&reference.account_id, 0),
                        Node::reference(&reference.account_id, 1),
                    );
                    Node::signed(reference.operation, delta)
                })
            }
            ParameterType::CfAdjustmentCalc => {
                let reference = required_reference(account)?;
                Some(Node::signed(
                    reference.operation,
                    Node::reference(&reference.account_id, 0),
                ))
            }
            ParameterType::CashChangeCalculation => {
                period.has_previous.then(|| self.cash_change_node())
            }
            ParameterType::CashEndingBalance => {
                if parameter.references.is_empty() {
                    return Err(missing_reference(account));
                }
                Some(Node::add(
                    parameter
                        .references
                        .iter()
                        .map(|r| Node::signed(r.operation, ref_node(r)))
                        .collect(),
                ))
            }
            ParameterType::CashBeginningBalance => {
                let cash_total = match parameter.first_reference() {
                    Some(reference) => &reference.account_id,
                    None => match self.chart.key_account(KeyAccount::CashTotal) {
                        Some(cash) => &cash.id,
                        None => return Err(missing_reference(account)),
                    },
                };
                Some(Node::reference(cash_total, 1))
            }
        };

        Ok(node)
    }

    /// CHILDREN_SUM adds the direct children; formula totals fold their terms.
    /// Either yields no formula when it has nothing to combine.
    pub fn compile_aggregation(&self, account: &Account, aggregation: &Aggregation) -> Option<Node> {
        match aggregation {
            Aggregation::ChildrenSum => {
                let children = self.chart.children_of(&account.id);
                if children.is_empty() {
                    return None;
                }
                Some(Node::add(
                    children
                        .iter()
                        .map(|child| Node::reference(&child.id, 0))
                        .collect(),
                ))
            }
            Aggregation::Formula { terms } => fold_terms(
                terms
                    .iter()
                    .map(|t| (Node::reference(&t.account_id, 0), t.operation)),
            ),
        }
    }

    /// Indirect method: base profit, plus CF adjustments signed by their target's
    /// side of the balance sheet, plus working-capital deltas signed by their own side.
    fn cash_change_node(&self) -> Node {
        let mut terms = Vec::new();

        for account in self.chart.base_profit_accounts() {
            terms.push(Node::reference(&account.id, 0));
        }

        for account in self.chart.cf_adjustment_accounts() {
            let Some(adjustment) = &account.cf_adjustment else {
                continue;
            };
            let Some(sign) = self
                .chart
                .account(&adjustment.target_account_id)
                .and_then(Account::cash_sign)
            else {
                continue;
            };
            terms.push(scaled(
                sign * adjustment.operation.sign(),
                Node::reference(&account.id, 0),
            ));
        }

        for account in self.chart.cf_delta_accounts() {
            let Some(sign) = account.cash_sign() else {
                continue;
            };
            let delta = Node::sub(
                Node::reference(&account.id, 0),
                Node::reference(&account.id, 1),
            );
            terms.push(scaled(sign, delta));
        }

        Node::add(terms)
    }

    /// A stock account without a parameter rolls its previous balance forward,
    /// plus the flows declared against it.
    fn synthesize_stock(&self, account: &Account, period: &PeriodContext<'_>) -> Option<Node> {
        if !period.has_previous {
            return None;
        }

        let mut flows: Vec<(Node, &crate::schema::AccountId)> = Vec::new();

        for adjuster in self.chart.adjustments_targeting(&account.id) {
            if let Some(adjustment) = &adjuster.cf_adjustment {
                flows.push((
                    Node::signed(adjustment.operation, Node::reference(&adjuster.id, 0)),
                    &adjuster.id,
                ));
            }
        }

        match &account.relation {
            Some(AccountRelation::Ppe {
                investment_account_id,
                depreciation_account_id,
            }) => {
                for (id, operation) in [
                    (investment_account_id, Operation::Add),
                    (depreciation_account_id, Operation::Sub),
                ] {
                    if !flows.iter().any(|(_, existing)| *existing == id) {
                        flows.push((Node::signed(operation, Node::reference(id, 0)), id));
                    }
                }
            }
            Some(AccountRelation::RetainedEarnings { profit_account_id }) => {
                if !flows.iter().any(|(_, existing)| *existing == profit_account_id) {
                    flows.push((Node::reference(profit_account_id, 0), profit_account_id));
                }
            }
            None => {}
        }

        let previous = Node::reference(&account.id, 1);
        if flows.is_empty() {
            return Some(previous);
        }

        let mut args = Vec::with_capacity(flows.len() + 1);
        args.push(previous);
        args.extend(flows.into_iter().map(|(node, _)| node));
        Some(Node::add(args))
    }
}

fn ref_node(reference: &ParameterReference) -> Node {
    Node::reference(&reference.account_id, reference.lag)
}

fn scaled(factor: f64, node: Node) -> Node {
    if factor == 1.0 {
        node
    } else if factor == -1.0 {
        Node::negate(node)
    } else {
        Node::mul(Node::constant(factor), node)
    }
}

/// Left fold: the first term seeds the accumulator (negated when SUB), each
/// following term is combined with its own operation.
fn fold_terms(terms: impl Iterator<Item = (Node, Operation)>) -> Option<Node> {
    let mut acc: Option<Node> = None;
    for (node, operation) in terms {
        acc = Some(match acc {
            None => Node::signed(operation, node),
            Some(lhs) => Node::binary(operation, lhs, node),
        });
    }
    acc
}

fn missing_reference(account: &Account) -> ModelError {
    ModelError::MissingReference {
        account_id: account.id.clone(),
        parameter_type: account.parameter.parameter_type,
    }
}

fn required_reference(account: &Account) -> Result<&ParameterReference> {
    account
        .parameter
        .first_reference()
        .ok_or_else(|| missing_reference(account))
}

fn required_value(account: &Account) -> Result<f64> {
    account
        .parameter
        .value
        .ok_or_else(|| ModelError::MissingParameterValue {
            account_id: account.id.clone(),
            parameter_type: account.parameter.parameter_type,
        })
}
