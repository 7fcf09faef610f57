// Copyright 2025 The Tensile Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use std::fmt;

use ordered_float::OrderedFloat;

use crate::common::{is_valid_name, Result};
use crate::format::Format;
use crate::lower_err;

/// A symbolic iteration index.  Whether it is free or a reduction variable
/// is a property of the assignment it appears in, not of the variable.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexVar {
    name: String,
}

impl IndexVar {
    pub fn new(name: &str) -> Self {
        IndexVar {
            name: name.to_owned(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for IndexVar {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A named tensor operand or result.  Elements are `f64`; the order and the
/// storage format are fixed for the duration of lowering.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TensorVar {
    name: String,
    order: usize,
    format: Format,
}

impl TensorVar {
    pub fn new(name: &str, format: Format) -> Result<Self> {
        if !is_valid_name(name) {
            return lower_err!(BadName, name);
        }
        Ok(TensorVar {
            name: name.to_owned(),
            order: format.order(),
            format,
        })
    }

    /// A 0-order tensor; the single value lives at position 0 of its
    /// values array.
    pub fn scalar(name: &str) -> Self {
        TensorVar {
            name: name.to_owned(),
            order: 0,
            format: Format::scalar(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn format(&self) -> &Format {
        &self.format
    }

    pub fn is_scalar(&self) -> bool {
        self.order == 0
    }
}

/// One read or write of a tensor at a list of index variables.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Access {
    pub tensor: TensorVar,
    pub indices: Vec<IndexVar>,
}

impl Access {
    pub fn new(tensor: TensorVar, indices: Vec<IndexVar>) -> Self {
        Access { tensor, indices }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.indices.is_empty() {
            return write!(f, "{}", self.tensor.name());
        }
        let ivars: Vec<&str> = self.indices.iter().map(|iv| iv.name()).collect();
        write!(f, "{}({})", self.tensor.name(), ivars.join(","))
    }
}

/// Index notation expressions.  `Reduction` may appear in notation built by
/// a front end, but must be rewritten away before lowering; `is_lowerable`
/// rejects it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum IndexExpr {
    Access(Access),
    Literal(OrderedFloat<f64>),
    Neg(Box<IndexExpr>),
    Sqrt(Box<IndexExpr>),
    Add(Box<IndexExpr>, Box<IndexExpr>),
    Sub(Box<IndexExpr>, Box<IndexExpr>),
    Mul(Box<IndexExpr>, Box<IndexExpr>),
    Div(Box<IndexExpr>, Box<IndexExpr>),
    Reduction(IndexVar, Box<IndexExpr>),
}

impl IndexExpr {
    pub fn access(tensor: &TensorVar, indices: &[IndexVar]) -> Self {
        IndexExpr::Access(Access::new(tensor.clone(), indices.to_vec()))
    }

    pub fn literal(value: f64) -> Self {
        IndexExpr::Literal(OrderedFloat(value))
    }

    pub fn add(a: IndexExpr, b: IndexExpr) -> Self {
        IndexExpr::Add(Box::new(a), Box::new(b))
    }

    pub fn sub(a: IndexExpr, b: IndexExpr) -> Self {
        IndexExpr::Sub(Box::new(a), Box::new(b))
    }

    pub fn mul(a: IndexExpr, b: IndexExpr) -> Self {
        IndexExpr::Mul(Box::new(a), Box::new(b))
    }

    pub fn div(a: IndexExpr, b: IndexExpr) -> Self {
        IndexExpr::Div(Box::new(a), Box::new(b))
    }

    pub fn neg(a: IndexExpr) -> Self {
        IndexExpr::Neg(Box::new(a))
    }

    pub fn sqrt(a: IndexExpr) -> Self {
        IndexExpr::Sqrt(Box::new(a))
    }

    /// All accesses in the expression, left to right.
    pub fn accesses(&self) -> Vec<&Access> {
        let mut out = vec![];
        self.visit(&mut |e| {
            if let IndexExpr::Access(a) = e {
                out.push(a);
            }
        });
        out
    }

    /// The index variables used by the expression, in order of first use,
    /// without duplicates.
    pub fn index_vars(&self) -> Vec<IndexVar> {
        let mut out: Vec<IndexVar> = vec![];
        self.visit(&mut |e| {
            if let IndexExpr::Access(a) = e {
                for iv in &a.indices {
                    if !out.contains(iv) {
                        out.push(iv.clone());
                    }
                }
            }
        });
        out
    }

    pub fn contains_reduction(&self) -> bool {
        let mut found = false;
        self.visit(&mut |e| {
            if matches!(e, IndexExpr::Reduction(..)) {
                found = true;
            }
        });
        found
    }

    fn visit<'a, F: FnMut(&'a IndexExpr)>(&'a self, f: &mut F) {
        f(self);
        match self {
            IndexExpr::Access(_) | IndexExpr::Literal(_) => {}
            IndexExpr::Neg(a) | IndexExpr::Sqrt(a) | IndexExpr::Reduction(_, a) => a.visit(f),
            IndexExpr::Add(a, b)
            | IndexExpr::Sub(a, b)
            | IndexExpr::Mul(a, b)
            | IndexExpr::Div(a, b) => {
                a.visit(f);
                b.visit(f);
            }
        }
    }
}

impl fmt::Display for IndexExpr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IndexExpr::Access(a) => write!(f, "{}", a),
            IndexExpr::Literal(v) => write!(f, "{}", v),
            IndexExpr::Neg(a) => write!(f, "-({})", a),
            IndexExpr::Sqrt(a) => write!(f, "sqrt({})", a),
            IndexExpr::Add(a, b) => write!(f, "({} + {})", a, b),
            IndexExpr::Sub(a, b) => write!(f, "({} - {})", a, b),
            IndexExpr::Mul(a, b) => write!(f, "({} * {})", a, b),
            IndexExpr::Div(a, b) => write!(f, "({} / {})", a, b),
            IndexExpr::Reduction(iv, a) => write!(f, "sum({}, {})", iv, a),
        }
    }
}

/// The top-level operator of an assignment: plain `=`, or `+=` which makes
/// the lowered compute accumulate into the existing result values.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    AddAssign,
}

/// A concrete index notation statement: `lhs op rhs`.
#[derive(Clone, Debug, PartialEq)]
pub struct Assignment {
    pub lhs: Access,
    pub op: AssignOp,
    pub rhs: IndexExpr,
}

impl Assignment {
    pub fn new(lhs: Access, rhs: IndexExpr) -> Self {
        Assignment {
            lhs,
            op: AssignOp::Assign,
            rhs,
        }
    }

    pub fn accumulate(lhs: Access, rhs: IndexExpr) -> Self {
        Assignment {
            lhs,
            op: AssignOp::AddAssign,
            rhs,
        }
    }

    /// Free index variables: those appearing on the left-hand side.
    pub fn free_vars(&self) -> Vec<IndexVar> {
        self.lhs.indices.clone()
    }

    /// Reduction variables: right-hand side variables not on the left.
    pub fn reduction_vars(&self) -> Vec<IndexVar> {
        self.rhs
            .index_vars()
            .into_iter()
            .filter(|iv| !self.lhs.indices.contains(iv))
            .collect()
    }
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let op = match self.op {
            AssignOp::Assign => "=",
            AssignOp::AddAssign => "+=",
        };
        write!(f, "{} {} {}", self.lhs, op, self.rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;

    fn ivar(name: &str) -> IndexVar {
        IndexVar::new(name)
    }

    #[test]
    fn test_index_vars_in_order() {
        let b = TensorVar::new("B", Format::csr()).unwrap();
        let c = TensorVar::new("c", Format::dense(1)).unwrap();
        let (i, j) = (ivar("i"), ivar("j"));

        let expr = IndexExpr::mul(
            IndexExpr::access(&b, &[i.clone(), j.clone()]),
            IndexExpr::access(&c, &[j.clone()]),
        );
        assert_eq!(expr.index_vars(), vec![i, j]);
        assert_eq!(expr.accesses().len(), 2);
    }

    #[test]
    fn test_reduction_vars() {
        let a = TensorVar::new("a", Format::dense(1)).unwrap();
        let b = TensorVar::new("B", Format::csr()).unwrap();
        let (i, j) = (ivar("i"), ivar("j"));

        let assign = Assignment::new(
            Access::new(a, vec![i.clone()]),
            IndexExpr::access(&b, &[i.clone(), j.clone()]),
        );
        assert_eq!(assign.free_vars(), vec![i]);
        assert_eq!(assign.reduction_vars(), vec![j]);
    }

    #[test]
    fn test_rejects_bad_tensor_name() {
        assert!(TensorVar::new("2bad", Format::dense(1)).is_err());
    }

    #[test]
    fn test_contains_reduction() {
        let b = TensorVar::new("b", Format::dense(1)).unwrap();
        let i = ivar("i");
        let expr = IndexExpr::Reduction(i.clone(), Box::new(IndexExpr::access(&b, &[i])));
        assert!(expr.contains_reduction());
    }
}
