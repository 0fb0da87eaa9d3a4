//! Reduces formula trees to numbers.

use crate::ast::Node;
use crate::error::{ModelError, Result};
use crate::schema::AccountId;
use std::collections::{HashMap, HashSet};

/// Position of a period in the model's ordered period list.
/// Lagged references may step before the first period; lookups treat those as missing.
pub type PeriodIndex = i64;

/// Evaluates `node` for `period`, reading referenced cells through `get_value`.
///
/// `get_value` is expected to return `0.0` for missing cells instead of failing.
pub fn evaluate<F>(node: &Node, period: PeriodIndex, mut get_value: F) -> Result<f64>
where
    F: FnMut(&AccountId, PeriodIndex) -> f64,
{
    try_evaluate(node, period, &mut |account_id, p| Ok(get_value(account_id, p)))
}

/// Like [`evaluate`], but lets the lookup itself fail (e.g. when it recursively
/// computes the referenced cell and detects a cycle).
pub fn try_evaluate<F>(node: &Node, period: PeriodIndex, get_value: &mut F) -> Result<f64>
where
    F: FnMut(&AccountId, PeriodIndex) -> Result<f64>,
{
    match node {
        Node::Const(value) => Ok(*value),
        Node::Ref { account_id, lag } => get_value(account_id, period - PeriodIndex::from(*lag)),
        Node::Add(args) => {
            let mut sum = 0.0;
            for arg in args {
                sum += try_evaluate(arg, period, get_value)?;
            }
            Ok(sum)
        }
        Node::Mul(args) => {
            let mut product = 1.0;
            for arg in args {
                product *= try_evaluate(arg, period, get_value)?;
            }
            Ok(product)
        }
        Node::Sub(args) => {
            let Some((first, rest)) = args.split_first() else {
                return Ok(0.0);
            };
            let mut result = try_evaluate(first, period, get_value)?;
            for arg in rest {
                result -= try_evaluate(arg, period, get_value)?;
            }
            Ok(result)
        }
        Node::Div(args) => {
            let Some((numerator, divisors)) = args.split_first() else {
                return Err(ModelError::InconsistentStructure {
                    account_id: None,
                    details: "Div node without arguments".to_string(),
                });
            };
            let mut result = try_evaluate(numerator, period, get_value)?;
            for divisor in divisors {
                let d = try_evaluate(divisor, period, get_value)?;
                if d == 0.0 {
                    return Err(ModelError::DivisionByZero {
                        node: node.to_string(),
                    });
                }
                result /= d;
            }
            Ok(result)
        }
    }
}

/// Memo table and recursion stack for one evaluation call.
///
/// Created at the start of a recompute and dropped when it returns; it is never
/// stored between calls, so a later recompute cannot observe stale entries.
#[derive(Debug, Default)]
pub struct EvalContext {
    cache: HashMap<(AccountId, PeriodIndex), f64>,
    in_progress: HashSet<(AccountId, PeriodIndex)>,
}

impl EvalContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn cached(&self, account_id: &AccountId, period: PeriodIndex) -> Option<f64> {
        self.cache.get(&(account_id.clone(), period)).copied()
    }

    fn is_in_progress(&self, account_id: &AccountId, period: PeriodIndex) -> bool {
        self.in_progress.contains(&(account_id.clone(), period))
    }

    /// Returns the memoized value of the cell or computes it with `compute`.
    ///
    /// Re-entering a cell that is still being computed fails with
    /// `CircularDependency` naming that account.
    pub fn resolve<F>(&mut self, account_id: &AccountId, period: PeriodIndex, compute: F) -> Result<f64>
    where
        F: FnOnce(&mut EvalContext) -> Result<f64>,
    {
        if let Some(value) = self.cached(account_id, period) {
            return Ok(value);
        }

        if self.is_in_progress(account_id, period) {
            return Err(ModelError::CircularDependency {
                account_id: account_id.clone(),
            });
        }
        let key = (account_id.clone(), period);
        self.in_progress.insert(key.clone());

        let result = compute(self);
        self.in_progress.remove(&key);

        let value = result?;
        self.cache.insert(key, value);
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::AccountId;

    fn lookup(account_id: &AccountId, period: PeriodIndex) -> f64 {
        match (account_id.as_str(), period) {
            ("rev", 0) => 1000.0,
            ("rev", 1) => 1100.0,
            ("cost", 1) => 400.0,
            ("zero", _) => 0.0,
            _ => 0.0,
        }
    }

    #[test]
    fn test_const_and_ref() {
        let rev = AccountId::from("rev");
        assert_eq!(evaluate(&Node::Const(3.5), 1, lookup).unwrap(), 3.5);
        assert_eq!(evaluate(&Node::reference(&rev, 0), 1, lookup).unwrap(), 1100.0);
        assert_eq!(evaluate(&Node::reference(&rev, 1), 1, lookup).unwrap(), 1000.0);
        // Before the first period: lenient lookup yields zero.
        assert_eq!(evaluate(&Node::reference(&rev, 3), 1, lookup).unwrap(), 0.0);
    }

    #[test]
    fn test_fold_identities() {
        assert_eq!(evaluate(&Node::Add(vec![]), 0, lookup).unwrap(), 0.0);
        assert_eq!(evaluate(&Node::Mul(vec![]), 0, lookup).unwrap(), 1.0);
        assert_eq!(
            evaluate(
                &Node::Add(vec![Node::Const(1.0), Node::Const(2.0), Node::Const(3.0)]),
                0,
                lookup
            )
            .unwrap(),
            6.0
        );
    }

    #[test]
    fn test_sub_subtracts_sum_of_rest() {
        let rev = AccountId::from("rev");
        let cost = AccountId::from("cost");
        let node = Node::Sub(vec![
            Node::reference(&rev, 0),
            Node::reference(&cost, 0),
            Node::Const(100.0),
        ]);
        assert_eq!(evaluate(&node, 1, lookup).unwrap(), 600.0);
    }

    #[test]
    fn test_division_by_zero() {
        let rev = AccountId::from("rev");
        let zero = AccountId::from("zero");
        let node = Node::div(Node::reference(&rev, 0), Node::reference(&zero, 0));

        let err = evaluate(&node, 1, lookup).unwrap_err();
        assert_eq!(
            err,
            ModelError::DivisionByZero {
                node: "Div(Ref(rev, 0), Ref(zero, 0))".to_string()
            }
        );
    }

    #[test]
    fn test_lookup_error_propagates() {
        let rev = AccountId::from("rev");
        let node = Node::add(vec![Node::Const(1.0), Node::reference(&rev, 0)]);
        let result = try_evaluate(&node, 0, &mut |account_id, _| {
            Err(ModelError::CircularDependency {
                account_id: account_id.clone(),
            })
        });
        assert!(matches!(result, Err(ModelError::CircularDependency { .. })));
    }

    #[test]
    fn test_context_memoizes_and_detects_reentry() {
        let a = AccountId::from("a");
        let mut ctx = EvalContext::new();
        let mut calls = 0;

        let first = ctx
            .resolve(&a, 2, |_| {
                calls += 1;
                Ok(42.0)
            })
            .unwrap();
        let second = ctx.resolve(&a, 2, |_| Ok(0.0)).unwrap();
        assert_eq!((first, second, calls), (42.0, 42.0, 1));

        let b = AccountId::from("b");
        let err = ctx
            .resolve(&b, 0, |inner| inner.resolve(&b, 0, |_| Ok(1.0)))
            .unwrap_err();
        assert_eq!(err, ModelError::CircularDependency { account_id: b.clone() });
        assert!(!ctx.is_in_progress(&b, 0));
        assert_eq!(ctx.len(), 1);
    }
}
