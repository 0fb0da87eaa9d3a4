//! Expression trees for account formulas.
//!
//! Trees are built programmatically by the formula compiler and are always finite.
//! Cycles between accounts are ruled out by the dependency graph, not here.

use crate::schema::{AccountId, Operation};
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Const(f64),
    /// Value of `account_id` looked up `lag` periods before the evaluated period.
    Ref { account_id: AccountId, lag: u32 },
    Add(Vec<Node>),
    Sub(Vec<Node>),
    Mul(Vec<Node>),
    Div(Vec<Node>),
}

impl Node {
    pub fn constant(value: f64) -> Self {
        Node::Const(value)
    }

    pub fn reference(account_id: &AccountId, lag: u32) -> Self {
        Node::Ref {
            account_id: account_id.clone(),
            lag,
        }
    }

    pub fn add(args: Vec<Node>) -> Self {
        Node::Add(args)
    }

    pub fn sub(minuend: Node, subtrahend: Node) -> Self {
        Node::Sub(vec![minuend, subtrahend])
    }

    pub fn mul(lhs: Node, rhs: Node) -> Self {
        Node::Mul(vec![lhs, rhs])
    }

    pub fn div(numerator: Node, denominator: Node) -> Self {
        Node::Div(vec![numerator, denominator])
    }

    pub fn negate(node: Node) -> Self {
        Node::mul(Node::Const(-1.0), node)
    }

    /// Combines two nodes with a declared account operation.
    pub fn binary(operation: Operation, lhs: Node, rhs: Node) -> Self {
        match operation {
            Operation::Add => Node::Add(vec![lhs, rhs]),
            Operation::Sub => Node::Sub(vec![lhs, rhs]),
            Operation::Mul => Node::Mul(vec![lhs, rhs]),
            Operation::Div => Node::Div(vec![lhs, rhs]),
        }
    }

    /// Multiplies by -1 when `operation` is SUB; otherwise returns the node unchanged.
    pub fn signed(operation: Operation, node: Node) -> Self {
        match operation {
            Operation::Sub => Node::negate(node),
            _ => node,
        }
    }

    pub fn children(&self) -> &[Node] {
        match self {
            Node::Const(_) | Node::Ref { .. } => &[],
            Node::Add(args) | Node::Sub(args) | Node::Mul(args) | Node::Div(args) => args,
        }
    }

    /// Visits every `Ref` in the tree, depth first, left to right.
    pub fn for_each_ref<'a>(&'a self, visit: &mut impl FnMut(&'a AccountId, u32)) {
        match self {
            Node::Ref { account_id, lag } => visit(account_id, *lag),
            _ => {
                for child in self.children() {
                    child.for_each_ref(visit);
                }
            }
        }
    }

    /// Accounts referenced within the same period (lag 0).
    pub fn same_period_refs(&self) -> Vec<&AccountId> {
        let mut refs = Vec::new();
        self.for_each_ref(&mut |account_id, lag| {
            if lag == 0 && !refs.contains(&account_id) {
                refs.push(account_id);
            }
        });
        refs
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (name, args) = match self {
            Node::Const(value) => return write!(f, "{}", value),
            Node::Ref { account_id, lag } => return write!(f, "Ref({}, {})", account_id, lag),
            Node::Add(args) => ("Add", args),
            Node::Sub(args) => ("Sub", args),
            Node::Mul(args) => ("Mul", args),
            Node::Div(args) => ("Div", args),
        };

        write!(f, "{}(", name)?;
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", arg)?;
        }
        write!(f, ")")
    }
}
