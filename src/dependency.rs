//! Same-period dependency graph between accounts and its topological order.
//!
//! An edge `a -> b` means `b` must be computed before `a` within one period.
//! References to earlier periods (lag > 0) are temporal and never become edges,
//! so an account rolling its own balance forward is not a cycle.

use crate::chart_of_accounts::ChartOfAccounts;
use crate::error::{ModelError, Result};
use crate::formula::{FormulaCompiler, PeriodContext};
use crate::schema::{Account, AccountId, AccountRelation, Aggregation};
use log::debug;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<AccountId>,
    edges: HashMap<AccountId, Vec<AccountId>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Visiting,
    Visited,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collects edges from aggregation structure, parameter references, relation
    /// links, and the same-period references of each account's compiled formula.
    pub fn build(accounts: &[Account]) -> Self {
        let chart = ChartOfAccounts::new(accounts);
        let compiler = FormulaCompiler::new(&chart);
        let mut graph = Self::new();

        for account in accounts {
            graph.add_node(&account.id);
        }

        for account in accounts {
            let from = &account.id;

            match &account.aggregation {
                Some(Aggregation::ChildrenSum) => {
                    for child in chart.children_of(from) {
                        graph.add_edge(from, &child.id);
                    }
                }
                Some(Aggregation::Formula { terms }) => {
                    for term in terms {
                        graph.add_edge(from, &term.account_id);
                    }
                }
                None => {}
            }

            for reference in &account.parameter.references {
                if reference.lag == 0 {
                    graph.add_edge(from, &reference.account_id);
                }
            }

            match &account.relation {
                Some(AccountRelation::Ppe {
                    investment_account_id,
                    depreciation_account_id,
                }) => {
                    graph.add_edge(from, investment_account_id);
                    graph.add_edge(from, depreciation_account_id);
                }
                Some(AccountRelation::RetainedEarnings { profit_account_id }) => {
                    graph.add_edge(from, profit_account_id);
                }
                None => {}
            }

            match compiler.compile(account, &PeriodContext::steady_state()) {
                Ok(Some(node)) => {
                    for dependency in node.same_period_refs() {
                        graph.add_edge(from, dependency);
                    }
                }
                Ok(None) => {}
                Err(err) => debug!("No formula edges for account '{}': {}", from, err),
            }
        }

        graph
    }

    pub fn add_node(&mut self, id: &AccountId) {
        if !self.edges.contains_key(id) {
            self.nodes.push(id.clone());
            self.edges.insert(id.clone(), Vec::new());
        }
    }

    /// Adds `from -> to`, ignoring duplicates. Only same-period links are added,
    /// so a self edge is a one-account cycle.
    pub fn add_edge(&mut self, from: &AccountId, to: &AccountId) {
        self.add_node(from);
        if let Some(dependencies) = self.edges.get_mut(from) {
            if !dependencies.contains(to) {
                dependencies.push(to.clone());
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(Vec::len).sum()
    }

    pub fn dependencies_of(&self, id: &AccountId) -> &[AccountId] {
        self.edges.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn edges(&self) -> impl Iterator<Item = (&AccountId, &AccountId)> {
        self.nodes.iter().flat_map(move |from| {
            self.dependencies_of(from).iter().map(move |to| (from, to))
        })
    }

    /// Depth-first post-order: every dependency precedes its dependents.
    ///
    /// Roots are visited in insertion order, so identical input always yields the
    /// same order. Edges to accounts outside the graph are skipped.
    pub fn topological_order(&self) -> Result<Vec<AccountId>> {
        let mut state: HashMap<&AccountId, VisitState> = HashMap::with_capacity(self.nodes.len());
        let mut order = Vec::with_capacity(self.nodes.len());

        for node in &self.nodes {
            self.visit(node, &mut state, &mut order)?;
        }

        Ok(order)
    }

    fn visit<'g>(
        &'g self,
        node: &'g AccountId,
        state: &mut HashMap<&'g AccountId, VisitState>,
        order: &mut Vec<AccountId>,
    ) -> Result<()> {
        match state.get(node) {
            Some(VisitState::Visited) => return Ok(()),
            Some(VisitState::Visiting) => {
                return Err(ModelError::CircularDependency {
                    account_id: node.clone(),
                })
            }
            None => {}
        }

        state.insert(node, VisitState::Visiting);

        for dependency in self.dependencies_of(node) {
            if self.edges.contains_key(dependency) {
                self.visit(dependency, state, order)?;
            }
        }

        state.insert(node, VisitState::Visited);
        order.push(node.clone());
        Ok(())
    }
}

/// Safe computation order for `accounts`, or the account at which a cycle closes.
pub fn get_calculation_order(accounts: &[Account]) -> Result<Vec<AccountId>> {
    let graph = DependencyGraph::build(accounts);
    debug!(
        "Dependency graph has {} accounts and {} same-period edges",
        graph.node_count(),
        graph.edge_count()
    );
    graph.topological_order()
}
