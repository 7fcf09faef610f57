// Copyright 2025 The Tensile Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The imperative IR emitted by lowering.
//!
//! A small statement/expression tree: rich enough to express sparse
//! co-iteration loop nests, result assembly and value computation, and
//! simple enough to pretty-print and evaluate directly.  Back ends that
//! compile it further are out of scope.

use std::fmt;

// ============================================================================
// Expressions
// ============================================================================

/// A scalar IR variable, identified by name.  Lowering derives every name
/// deterministically from tensor, level and index variable names.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Var {
    pub name: String,
}

impl Var {
    pub fn new(name: impl Into<String>) -> Self {
        Var { name: name.into() }
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A component of a tensor's storage: the `pos`/`idx` array of a level, the
/// values array, the value count, or a level's dimension size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Component {
    Pos(usize),
    Idx(usize),
    Vals,
    ValsSize,
    Dim(usize),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Prop {
    pub tensor: String,
    pub component: Component,
}

impl fmt::Display for Prop {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.component {
            Component::Pos(l) => write!(f, "{}{}_pos_arr", self.tensor, l + 1),
            Component::Idx(l) => write!(f, "{}{}_idx_arr", self.tensor, l + 1),
            Component::Vals => write!(f, "{}_vals", self.tensor),
            Component::ValsSize => write!(f, "{}_vals_size", self.tensor),
            Component::Dim(l) => write!(f, "{}{}_size", self.tensor, l + 1),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl CmpOp {
    fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Neq => "!=",
            CmpOp::Lt => "<",
            CmpOp::Lte => "<=",
            CmpOp::Gt => ">",
            CmpOp::Gte => ">=",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Int(i64),
    Float(f64),
    Bool(bool),
    Var(Var),
    Prop(Prop),
    /// Read `arr[index]`.
    Load(Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
    Sqrt(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    /// Minimum over two or more operands.
    Min(Vec<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    BitAnd(Box<Expr>, Box<Expr>),
    /// Boolean to 0/1 integer.
    Cast(Box<Expr>),
    /// Position of `key` in the sorted segment `arr[lo..hi)`.  The storage
    /// boundary's segment lookup primitive; undefined if `key` is absent.
    Search {
        arr: Box<Expr>,
        lo: Box<Expr>,
        hi: Box<Expr>,
        key: Box<Expr>,
    },
}

impl Expr {
    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var(Var::new(name))
    }

    pub fn prop(tensor: &str, component: Component) -> Self {
        Expr::Prop(Prop {
            tensor: tensor.to_owned(),
            component,
        })
    }

    pub fn load(arr: Expr, index: Expr) -> Self {
        Expr::Load(Box::new(arr), Box::new(index))
    }

    pub fn add(a: Expr, b: Expr) -> Self {
        Expr::Add(Box::new(a), Box::new(b))
    }

    pub fn sub(a: Expr, b: Expr) -> Self {
        Expr::Sub(Box::new(a), Box::new(b))
    }

    pub fn mul(a: Expr, b: Expr) -> Self {
        Expr::Mul(Box::new(a), Box::new(b))
    }

    pub fn div(a: Expr, b: Expr) -> Self {
        Expr::Div(Box::new(a), Box::new(b))
    }

    pub fn cmp(op: CmpOp, a: Expr, b: Expr) -> Self {
        Expr::Cmp(op, Box::new(a), Box::new(b))
    }

    pub fn and(a: Expr, b: Expr) -> Self {
        Expr::And(Box::new(a), Box::new(b))
    }

    pub fn bit_and(a: Expr, b: Expr) -> Self {
        Expr::BitAnd(Box::new(a), Box::new(b))
    }

    pub fn cast(a: Expr) -> Self {
        Expr::Cast(Box::new(a))
    }

    pub fn search(arr: Expr, lo: Expr, hi: Expr, key: Expr) -> Self {
        Expr::Search {
            arr: Box::new(arr),
            lo: Box::new(lo),
            hi: Box::new(hi),
            key: Box::new(key),
        }
    }

    pub fn is_true_literal(&self) -> bool {
        matches!(self, Expr::Bool(true))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Expr::Int(v) => write!(f, "{}", v),
            Expr::Float(v) => write!(f, "{:?}", v),
            Expr::Bool(v) => write!(f, "{}", v),
            Expr::Var(v) => write!(f, "{}", v),
            Expr::Prop(p) => write!(f, "{}", p),
            Expr::Load(arr, i) => write!(f, "{}[{}]", arr, i),
            Expr::Neg(a) => write!(f, "-({})", a),
            Expr::Sqrt(a) => write!(f, "sqrt({})", a),
            Expr::Add(a, b) => write!(f, "({} + {})", a, b),
            Expr::Sub(a, b) => write!(f, "({} - {})", a, b),
            Expr::Mul(a, b) => write!(f, "({} * {})", a, b),
            Expr::Div(a, b) => write!(f, "({} / {})", a, b),
            Expr::Min(args) => {
                let parts: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                write!(f, "min({})", parts.join(", "))
            }
            Expr::Cmp(op, a, b) => write!(f, "({} {} {})", a, op.symbol(), b),
            Expr::And(a, b) => write!(f, "({} && {})", a, b),
            Expr::BitAnd(a, b) => write!(f, "({} & {})", a, b),
            Expr::Cast(a) => write!(f, "(int){}", a),
            Expr::Search { arr, lo, hi, key } => {
                write!(f, "search({}, {}, {}, {})", arr, lo, hi, key)
            }
        }
    }
}

// ============================================================================
// Statements
// ============================================================================

/// How a for loop may be scheduled by a parallelizing back end.  While
/// loops (merged co-iteration) are always serial.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopKind {
    Serial,
    Static,
    Dynamic,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    Block(Vec<Stmt>),
    /// Introduce a variable; its scope is the enclosing emitted block.
    Decl { var: Var, init: Expr },
    Assign {
        var: Var,
        rhs: Expr,
        compound: bool,
    },
    Store {
        arr: Expr,
        index: Expr,
        value: Expr,
        compound: bool,
    },
    /// Guarded cases evaluated in order; when `covered` is set the final
    /// case is the else branch and its condition is not evaluated.
    If {
        cases: Vec<(Expr, Stmt)>,
        covered: bool,
    },
    /// Dispatch on an indicator mask; cases match exactly.
    Switch {
        control: Expr,
        cases: Vec<(Expr, Stmt)>,
    },
    While {
        cond: Expr,
        body: Box<Stmt>,
    },
    For {
        var: Var,
        begin: Expr,
        end: Expr,
        kind: LoopKind,
        body: Box<Stmt>,
    },
    /// Size (or resize, preserving contents) an array to `capacity`
    /// elements; `zero` clears newly visible elements.
    Allocate {
        arr: Expr,
        capacity: Expr,
        resize: bool,
        zero: bool,
    },
    /// Canonicalize an appended level: repair the monotonicity of `pos`
    /// over `segments` parent positions, and when `coalesce` is set sort
    /// each segment of `idx`, combine duplicate coordinates (summing their
    /// values when `vals` participates) and compact.
    AppendFinalize {
        pos: Expr,
        idx: Expr,
        vals: Option<Expr>,
        segments: Expr,
        coalesce: bool,
    },
}

impl Stmt {
    pub fn decl(var: Var, init: Expr) -> Self {
        Stmt::Decl { var, init }
    }

    pub fn assign(var: Var, rhs: Expr) -> Self {
        Stmt::Assign {
            var,
            rhs,
            compound: false,
        }
    }

    pub fn store(arr: Expr, index: Expr, value: Expr) -> Self {
        Stmt::Store {
            arr,
            index,
            value,
            compound: false,
        }
    }

    pub fn block(stmts: Vec<Stmt>) -> Self {
        Stmt::Block(stmts)
    }
}

/// The single function produced by one lowering invocation.  Parameters
/// and results are tensor names; each name stands for the tensor's
/// component arrays.
#[derive(Clone, Debug, PartialEq)]
pub struct Function {
    pub name: String,
    pub params: Vec<String>,
    pub results: Vec<String>,
    pub body: Stmt,
}

// ============================================================================
// Pure helpers
// ============================================================================

/// Conjunction of boolean expressions; the empty conjunction is `true`.
/// Idempotent: literal-true operands are dropped.
pub fn conjunction(exprs: Vec<Expr>) -> Expr {
    let mut terms: Vec<Expr> = exprs
        .into_iter()
        .filter(|e| !e.is_true_literal())
        .collect();
    match terms.len() {
        0 => Expr::Bool(true),
        1 => terms.remove(0),
        _ => {
            let first = terms.remove(0);
            terms.into_iter().fold(first, Expr::and)
        }
    }
}

/// Constant-fold an expression.  Idempotent; only rewrites that preserve
/// evaluation order are applied.
pub fn simplify(expr: Expr) -> Expr {
    use Expr::*;
    match expr {
        Add(a, b) => match (simplify(*a), simplify(*b)) {
            (Int(x), Int(y)) => Int(x + y),
            (Int(0), e) | (e, Int(0)) => e,
            (x, y) => Expr::add(x, y),
        },
        Sub(a, b) => match (simplify(*a), simplify(*b)) {
            (Int(x), Int(y)) => Int(x - y),
            (e, Int(0)) => e,
            (x, y) => Expr::sub(x, y),
        },
        Mul(a, b) => match (simplify(*a), simplify(*b)) {
            (Int(x), Int(y)) => Int(x * y),
            (Int(0), _) | (_, Int(0)) => Int(0),
            (Int(1), e) | (e, Int(1)) => e,
            (x, y) => Expr::mul(x, y),
        },
        And(a, b) => match (simplify(*a), simplify(*b)) {
            (Bool(true), e) | (e, Bool(true)) => e,
            (Bool(false), _) | (_, Bool(false)) => Bool(false),
            (x, y) => Expr::and(x, y),
        },
        Load(arr, i) => Expr::load(simplify(*arr), simplify(*i)),
        other => other,
    }
}

// ============================================================================
// Pretty printing
// ============================================================================

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "func {}({}) -> ({}) {{",
            self.name,
            self.params.join(", "),
            self.results.join(", ")
        )?;
        fmt_stmt(&self.body, f, 1)?;
        writeln!(f, "}}")
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt_stmt(self, f, 0)
    }
}

fn fmt_stmt(stmt: &Stmt, f: &mut fmt::Formatter, depth: usize) -> fmt::Result {
    let pad = "  ".repeat(depth);
    match stmt {
        Stmt::Block(stmts) => {
            for s in stmts {
                fmt_stmt(s, f, depth)?;
            }
            Ok(())
        }
        Stmt::Decl { var, init } => writeln!(f, "{}var {} = {};", pad, var, init),
        Stmt::Assign {
            var,
            rhs,
            compound,
        } => {
            let op = if *compound { "+=" } else { "=" };
            writeln!(f, "{}{} {} {};", pad, var, op, rhs)
        }
        Stmt::Store {
            arr,
            index,
            value,
            compound,
        } => {
            let op = if *compound { "+=" } else { "=" };
            writeln!(f, "{}{}[{}] {} {};", pad, arr, index, op, value)
        }
        Stmt::If { cases, covered } => {
            for (n, (cond, body)) in cases.iter().enumerate() {
                if n == 0 {
                    writeln!(f, "{}if {} {{", pad, cond)?;
                } else if *covered && n == cases.len() - 1 {
                    writeln!(f, "{}}} else {{", pad)?;
                } else {
                    writeln!(f, "{}}} else if {} {{", pad, cond)?;
                }
                fmt_stmt(body, f, depth + 1)?;
            }
            writeln!(f, "{}}}", pad)
        }
        Stmt::Switch { control, cases } => {
            writeln!(f, "{}switch {} {{", pad, control)?;
            for (value, body) in cases {
                writeln!(f, "{}case {}: {{", "  ".repeat(depth + 1), value)?;
                fmt_stmt(body, f, depth + 2)?;
                writeln!(f, "{}}}", "  ".repeat(depth + 1))?;
            }
            writeln!(f, "{}}}", pad)
        }
        Stmt::While { cond, body } => {
            writeln!(f, "{}while {} {{", pad, cond)?;
            fmt_stmt(body, f, depth + 1)?;
            writeln!(f, "{}}}", pad)
        }
        Stmt::For {
            var,
            begin,
            end,
            kind,
            body,
        } => {
            let sched = match kind {
                LoopKind::Serial => "",
                LoopKind::Static => " /* static */",
                LoopKind::Dynamic => " /* dynamic */",
            };
            writeln!(f, "{}for {} in {}..{} {{{}", pad, var, begin, end, sched)?;
            fmt_stmt(body, f, depth + 1)?;
            writeln!(f, "{}}}", pad)
        }
        Stmt::Allocate {
            arr,
            capacity,
            resize,
            zero,
        } => {
            let verb = if *resize { "resize" } else { "alloc" };
            let clear = if *zero { ", zero" } else { "" };
            writeln!(f, "{}{} {}[{}{}];", pad, verb, arr, capacity, clear)
        }
        Stmt::AppendFinalize {
            pos,
            idx,
            vals,
            segments,
            coalesce,
        } => {
            let vals = match vals {
                Some(v) => format!(", {}", v),
                None => String::new(),
            };
            let mode = if *coalesce { "coalesce" } else { "repair" };
            writeln!(
                f,
                "{}finalize_segments({}, {}{}, {}, {});",
                pad, pos, idx, vals, segments, mode
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conjunction_empty_is_true() {
        assert_eq!(conjunction(vec![]), Expr::Bool(true));
    }

    #[test]
    fn test_conjunction_drops_true_literals() {
        let cond = Expr::cmp(CmpOp::Eq, Expr::var("kB"), Expr::var("k"));
        assert_eq!(
            conjunction(vec![Expr::Bool(true), cond.clone()]),
            cond
        );
    }

    #[test]
    fn test_conjunction_idempotent() {
        let a = Expr::cmp(CmpOp::Eq, Expr::var("a"), Expr::var("k"));
        let b = Expr::cmp(CmpOp::Eq, Expr::var("b"), Expr::var("k"));
        let once = conjunction(vec![a.clone(), b.clone()]);
        assert_eq!(conjunction(vec![once.clone()]), once);
    }

    #[test]
    fn test_simplify_folds_constants() {
        let e = Expr::mul(Expr::add(Expr::Int(2), Expr::Int(3)), Expr::Int(1));
        assert_eq!(simplify(e), Expr::Int(5));
    }

    #[test]
    fn test_simplify_identities() {
        let x = Expr::var("x");
        assert_eq!(simplify(Expr::add(x.clone(), Expr::Int(0))), x);
        assert_eq!(simplify(Expr::mul(Expr::Int(0), x.clone())), Expr::Int(0));
        assert_eq!(simplify(Expr::mul(x.clone(), Expr::Int(1))), x);
    }

    #[test]
    fn test_simplify_idempotent() {
        let e = Expr::add(
            Expr::mul(Expr::var("p"), Expr::Int(3)),
            Expr::add(Expr::Int(1), Expr::Int(1)),
        );
        let once = simplify(e);
        assert_eq!(simplify(once.clone()), once);
    }

    #[test]
    fn test_print_loop_nest() {
        let body = Stmt::store(
            Expr::prop("a", Component::Vals),
            Expr::var("i"),
            Expr::Float(0.0),
        );
        let stmt = Stmt::For {
            var: Var::new("i"),
            begin: Expr::Int(0),
            end: Expr::prop("a", Component::Dim(0)),
            kind: LoopKind::Static,
            body: Box::new(body),
        };
        let text = stmt.to_string();
        assert!(text.contains("for i in 0..a1_size { /* static */"));
        assert!(text.contains("a_vals[i] = 0.0;"));
    }
}
