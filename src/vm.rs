// Copyright 2025 The Tensile Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! A tree-walking evaluator for emitted IR functions.
//!
//! This stands in for a compiling back end: it runs an `ir::Function`
//! directly against tensor storage, which is all the tests and the kernel
//! driver need.  Execution is deterministic and serial; loop scheduling
//! annotations are contracts for a real back end and are ignored here.

use std::collections::HashMap;

use float_cmp::approx_eq;

use crate::common::{Error, ErrorCode, ErrorKind, Result};
use crate::exec_err;
use crate::ir::{CmpOp, Component, Expr, Function, Prop, Stmt};
use crate::storage::{LevelStorage, TensorStorage};

#[derive(Copy, Clone, Debug, PartialEq)]
enum Scalar {
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Scalar {
    fn as_int(self) -> Result<i64> {
        match self {
            Scalar::Int(v) => Ok(v),
            Scalar::Bool(b) => Ok(b as i64),
            Scalar::Float(v) => exec_err!(format!("expected an integer, got {}", v)),
        }
    }

    fn as_float(self) -> Result<f64> {
        match self {
            Scalar::Int(v) => Ok(v as f64),
            Scalar::Float(v) => Ok(v),
            Scalar::Bool(_) => exec_err!("expected a number, got a boolean"),
        }
    }

    fn as_bool(self) -> Result<bool> {
        match self {
            Scalar::Bool(b) => Ok(b),
            Scalar::Int(v) => Ok(v != 0),
            Scalar::Float(_) => exec_err!("expected a condition, got a float"),
        }
    }
}

/// Execute a lowered function against the given tensors.  The map must
/// hold an entry for every parameter and result.
pub fn execute(func: &Function, tensors: &mut HashMap<String, TensorStorage>) -> Result<()> {
    for name in func.params.iter().chain(func.results.iter()) {
        if !tensors.contains_key(name) {
            return Err(Error::new(
                ErrorKind::Execution,
                ErrorCode::UndefinedTensor,
                Some(name.clone()),
            ));
        }
    }
    let mut vm = Vm {
        frame: HashMap::new(),
        tensors,
    };
    vm.exec(&func.body)
}

struct Vm<'a> {
    frame: HashMap<String, Scalar>,
    tensors: &'a mut HashMap<String, TensorStorage>,
}

impl Vm<'_> {
    fn tensor(&self, name: &str) -> Result<&TensorStorage> {
        match self.tensors.get(name) {
            Some(t) => Ok(t),
            None => Err(Error::new(
                ErrorKind::Execution,
                ErrorCode::UndefinedTensor,
                Some(name.to_owned()),
            )),
        }
    }

    fn eval(&self, expr: &Expr) -> Result<Scalar> {
        match expr {
            Expr::Int(v) => Ok(Scalar::Int(*v)),
            Expr::Float(v) => Ok(Scalar::Float(*v)),
            Expr::Bool(v) => Ok(Scalar::Bool(*v)),
            Expr::Var(var) => match self.frame.get(&var.name) {
                Some(v) => Ok(*v),
                None => exec_err!(format!("read of unassigned variable {}", var.name)),
            },
            Expr::Prop(prop) => {
                let tensor = self.tensor(&prop.tensor)?;
                match prop.component {
                    Component::Dim(l) => {
                        Ok(Scalar::Int(tensor.dims[tensor.format.dimension_of(l)] as i64))
                    }
                    Component::ValsSize => Ok(Scalar::Int(tensor.vals.len() as i64)),
                    _ => exec_err!(format!("array {} used as a scalar", prop)),
                }
            }
            Expr::Load(arr, index) => {
                let index = self.eval(index)?.as_int()?;
                self.load(arr, index)
            }
            Expr::Neg(a) => match self.eval(a)? {
                Scalar::Int(v) => Ok(Scalar::Int(-v)),
                Scalar::Float(v) => Ok(Scalar::Float(-v)),
                Scalar::Bool(_) => exec_err!("cannot negate a boolean"),
            },
            Expr::Sqrt(a) => Ok(Scalar::Float(self.eval(a)?.as_float()?.sqrt())),
            Expr::Add(a, b) => self.arith(a, b, |x, y| x + y, |x, y| x.checked_add(y)),
            Expr::Sub(a, b) => self.arith(a, b, |x, y| x - y, |x, y| x.checked_sub(y)),
            Expr::Mul(a, b) => self.arith(a, b, |x, y| x * y, |x, y| x.checked_mul(y)),
            Expr::Div(a, b) => {
                let x = self.eval(a)?.as_float()?;
                let y = self.eval(b)?.as_float()?;
                Ok(Scalar::Float(x / y))
            }
            Expr::Min(args) => {
                let mut best: Option<i64> = None;
                for arg in args {
                    let v = self.eval(arg)?.as_int()?;
                    best = Some(best.map_or(v, |b| b.min(v)));
                }
                match best {
                    Some(v) => Ok(Scalar::Int(v)),
                    None => exec_err!("min of no operands"),
                }
            }
            Expr::Cmp(op, a, b) => {
                let x = self.eval(a)?;
                let y = self.eval(b)?;
                let ordering = match (x, y) {
                    (Scalar::Int(x), Scalar::Int(y)) => x.partial_cmp(&y),
                    _ => {
                        let (x, y) = (x.as_float()?, y.as_float()?);
                        if approx_eq!(f64, x, y) {
                            Some(std::cmp::Ordering::Equal)
                        } else {
                            x.partial_cmp(&y)
                        }
                    }
                };
                let ordering = match ordering {
                    Some(o) => o,
                    None => return exec_err!("incomparable values"),
                };
                use std::cmp::Ordering::*;
                let result = match op {
                    CmpOp::Eq => ordering == Equal,
                    CmpOp::Neq => ordering != Equal,
                    CmpOp::Lt => ordering == Less,
                    CmpOp::Lte => ordering != Greater,
                    CmpOp::Gt => ordering == Greater,
                    CmpOp::Gte => ordering != Less,
                };
                Ok(Scalar::Bool(result))
            }
            Expr::And(a, b) => {
                if !self.eval(a)?.as_bool()? {
                    return Ok(Scalar::Bool(false));
                }
                Ok(Scalar::Bool(self.eval(b)?.as_bool()?))
            }
            Expr::BitAnd(a, b) => {
                let x = self.eval(a)?.as_int()?;
                let y = self.eval(b)?.as_int()?;
                Ok(Scalar::Int(x & y))
            }
            Expr::Cast(a) => Ok(Scalar::Int(self.eval(a)?.as_bool()? as i64)),
            Expr::Search { arr, lo, hi, key } => {
                let lo = self.eval(lo)?.as_int()?.max(0) as usize;
                let hi = self.eval(hi)?.as_int()?.max(0) as usize;
                let key = self.eval(key)?.as_int()?;
                let ints = self.int_array(arr)?;
                let hi = hi.min(ints.len());
                if lo > hi {
                    return exec_err!("inverted search segment");
                }
                match ints[lo..hi].binary_search(&key) {
                    Ok(offset) => Ok(Scalar::Int((lo + offset) as i64)),
                    Err(_) => exec_err!(format!("coordinate {} is not assembled", key)),
                }
            }
        }
    }

    fn arith(
        &self,
        a: &Expr,
        b: &Expr,
        float_op: fn(f64, f64) -> f64,
        int_op: fn(i64, i64) -> Option<i64>,
    ) -> Result<Scalar> {
        let x = self.eval(a)?;
        let y = self.eval(b)?;
        match (x, y) {
            (Scalar::Int(x), Scalar::Int(y)) => match int_op(x, y) {
                Some(v) => Ok(Scalar::Int(v)),
                None => exec_err!("integer overflow"),
            },
            _ => Ok(Scalar::Float(float_op(x.as_float()?, y.as_float()?))),
        }
    }

    fn int_array(&self, arr: &Expr) -> Result<&[i64]> {
        let prop = match arr {
            Expr::Prop(p) => p,
            other => return exec_err!(format!("not an array: {}", other)),
        };
        let tensor = self.tensor(&prop.tensor)?;
        match prop.component {
            Component::Pos(l) => match &tensor.levels[l] {
                LevelStorage::Compressed { pos, .. } => Ok(pos),
                _ => exec_err!(format!("{} has no position array", prop)),
            },
            Component::Idx(l) => match &tensor.levels[l] {
                LevelStorage::Compressed { idx, .. } => Ok(idx),
                LevelStorage::Fixed { idx, .. } => Ok(idx),
                _ => exec_err!(format!("{} has no coordinate array", prop)),
            },
            _ => exec_err!(format!("{} is not an integer array", prop)),
        }
    }

    fn load(&self, arr: &Expr, index: i64) -> Result<Scalar> {
        let prop = match arr {
            Expr::Prop(p) => p,
            other => return exec_err!(format!("not an array: {}", other)),
        };
        if index < 0 {
            return exec_err!(format!("negative index into {}", prop));
        }
        let index = index as usize;
        if prop.component == Component::Vals {
            let tensor = self.tensor(&prop.tensor)?;
            return match tensor.vals.get(index) {
                Some(v) => Ok(Scalar::Float(*v)),
                None => exec_err!(format!("index {} out of bounds of {}", index, prop)),
            };
        }
        let ints = self.int_array(arr)?;
        match ints.get(index) {
            Some(v) => Ok(Scalar::Int(*v)),
            None => exec_err!(format!("index {} out of bounds of {}", index, prop)),
        }
    }

    fn store(&mut self, prop: &Prop, index: i64, value: Scalar, compound: bool) -> Result<()> {
        if index < 0 {
            return exec_err!(format!("negative index into {}", prop));
        }
        let index = index as usize;
        let tensor = match self.tensors.get_mut(&prop.tensor) {
            Some(t) => t,
            None => {
                return Err(Error::new(
                    ErrorKind::Execution,
                    ErrorCode::UndefinedTensor,
                    Some(prop.tensor.clone()),
                ))
            }
        };
        match prop.component {
            Component::Vals => {
                let value = value.as_float()?;
                match tensor.vals.get_mut(index) {
                    Some(slot) => {
                        if compound {
                            *slot += value;
                        } else {
                            *slot = value;
                        }
                        Ok(())
                    }
                    None => exec_err!(format!("index {} out of bounds of {}", index, prop)),
                }
            }
            Component::Pos(l) | Component::Idx(l) => {
                let value = value.as_int()?;
                let slot = match (&mut tensor.levels[l], prop.component) {
                    (LevelStorage::Compressed { pos, .. }, Component::Pos(_)) => {
                        pos.get_mut(index)
                    }
                    (LevelStorage::Compressed { idx, .. }, Component::Idx(_)) => {
                        idx.get_mut(index)
                    }
                    (LevelStorage::Fixed { idx, .. }, Component::Idx(_)) => idx.get_mut(index),
                    _ => return exec_err!(format!("{} is not writable", prop)),
                };
                match slot {
                    Some(slot) => {
                        if compound {
                            *slot += value;
                        } else {
                            *slot = value;
                        }
                        Ok(())
                    }
                    None => exec_err!(format!("index {} out of bounds of {}", index, prop)),
                }
            }
            _ => exec_err!(format!("{} is not writable", prop)),
        }
    }

    fn allocate(&mut self, arr: &Expr, capacity: usize, resize: bool, zero: bool) -> Result<()> {
        let prop = match arr {
            Expr::Prop(p) => p,
            other => return exec_err!(format!("not an array: {}", other)),
        };
        let tensor = match self.tensors.get_mut(&prop.tensor) {
            Some(t) => t,
            None => {
                return Err(Error::new(
                    ErrorKind::Execution,
                    ErrorCode::UndefinedTensor,
                    Some(prop.tensor.clone()),
                ))
            }
        };
        match prop.component {
            Component::Vals => {
                if resize {
                    tensor.vals.resize(capacity, 0.0);
                } else if zero || tensor.vals.len() != capacity {
                    tensor.vals = vec![0.0; capacity];
                }
                Ok(())
            }
            Component::Pos(l) | Component::Idx(l) => {
                let vec = match (&mut tensor.levels[l], prop.component) {
                    (LevelStorage::Compressed { pos, .. }, Component::Pos(_)) => pos,
                    (LevelStorage::Compressed { idx, .. }, Component::Idx(_)) => idx,
                    (LevelStorage::Fixed { idx, .. }, Component::Idx(_)) => idx,
                    _ => return exec_err!(format!("{} cannot be allocated", prop)),
                };
                if resize {
                    vec.resize(capacity, 0);
                } else {
                    *vec = vec![0; capacity];
                }
                Ok(())
            }
            _ => exec_err!(format!("{} cannot be allocated", prop)),
        }
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<()> {
        match stmt {
            Stmt::Block(stmts) => {
                for s in stmts {
                    self.exec(s)?;
                }
                Ok(())
            }
            Stmt::Decl { var, init } => {
                let value = self.eval(init)?;
                self.frame.insert(var.name.clone(), value);
                Ok(())
            }
            Stmt::Assign {
                var,
                rhs,
                compound,
            } => {
                let value = self.eval(rhs)?;
                if *compound {
                    let current = match self.frame.get(&var.name) {
                        Some(v) => *v,
                        None => {
                            return exec_err!(format!(
                                "compound assignment to unassigned {}",
                                var.name
                            ))
                        }
                    };
                    let combined = match (current, value) {
                        (Scalar::Int(x), y) => Scalar::Int(x + y.as_int()?),
                        (Scalar::Float(x), y) => Scalar::Float(x + y.as_float()?),
                        (Scalar::Bool(_), _) => {
                            return exec_err!("compound assignment to a boolean")
                        }
                    };
                    self.frame.insert(var.name.clone(), combined);
                } else {
                    self.frame.insert(var.name.clone(), value);
                }
                Ok(())
            }
            Stmt::Store {
                arr,
                index,
                value,
                compound,
            } => {
                let prop = match arr {
                    Expr::Prop(p) => p.clone(),
                    other => return exec_err!(format!("not an array: {}", other)),
                };
                let index = self.eval(index)?.as_int()?;
                let value = self.eval(value)?;
                self.store(&prop, index, value, *compound)
            }
            Stmt::If { cases, covered } => {
                for (n, (cond, body)) in cases.iter().enumerate() {
                    let fire = (*covered && n + 1 == cases.len()) || self.eval(cond)?.as_bool()?;
                    if fire {
                        return self.exec(body);
                    }
                }
                Ok(())
            }
            Stmt::Switch { control, cases } => {
                let control = self.eval(control)?.as_int()?;
                for (value, body) in cases {
                    if self.eval(value)?.as_int()? == control {
                        return self.exec(body);
                    }
                }
                Ok(())
            }
            Stmt::While { cond, body } => {
                while self.eval(cond)?.as_bool()? {
                    self.exec(body)?;
                }
                Ok(())
            }
            Stmt::For {
                var,
                begin,
                end,
                body,
                ..
            } => {
                let begin = self.eval(begin)?.as_int()?;
                let end = self.eval(end)?.as_int()?;
                for v in begin..end {
                    self.frame.insert(var.name.clone(), Scalar::Int(v));
                    self.exec(body)?;
                }
                Ok(())
            }
            Stmt::Allocate {
                arr,
                capacity,
                resize,
                zero,
            } => {
                let capacity = self.eval(capacity)?.as_int()?.max(0) as usize;
                self.allocate(arr, capacity, *resize, *zero)
            }
            Stmt::AppendFinalize {
                pos,
                idx,
                vals,
                segments,
                coalesce,
            } => {
                let segments = self.eval(segments)?.as_int()?.max(0) as usize;
                let (pos_prop, idx_prop) = match (pos, idx) {
                    (Expr::Prop(p), Expr::Prop(i)) => (p.clone(), i.clone()),
                    _ => return exec_err!("finalize of something that is not a level"),
                };
                let level = match (pos_prop.component, idx_prop.component) {
                    (Component::Pos(l), Component::Idx(m)) if l == m => l,
                    _ => return exec_err!("finalize of mismatched level components"),
                };
                let with_vals = vals.is_some();
                let tensor = match self.tensors.get_mut(&pos_prop.tensor) {
                    Some(t) => t,
                    None => {
                        return Err(Error::new(
                            ErrorKind::Execution,
                            ErrorCode::UndefinedTensor,
                            Some(pos_prop.tensor.clone()),
                        ))
                    }
                };
                finalize_append(tensor, level, segments, with_vals, *coalesce)
            }
        }
    }
}

/// Canonicalize an appended level: repair skipped segments, and when
/// coalescing sort each segment and combine duplicate coordinates (summing
/// their values when this is the innermost level).
fn finalize_append(
    tensor: &mut TensorStorage,
    level: usize,
    segments: usize,
    with_vals: bool,
    coalesce: bool,
) -> Result<()> {
    let TensorStorage { levels, vals, .. } = tensor;
    let (pos, idx) = match &mut levels[level] {
        LevelStorage::Compressed { pos, idx } => (pos, idx),
        _ => return exec_err!("finalize of a level that does not append"),
    };

    if pos.len() < segments + 1 {
        pos.resize(segments + 1, 0);
    }
    for p in 1..=segments {
        if pos[p] < pos[p - 1] {
            pos[p] = pos[p - 1];
        }
    }

    if coalesce {
        let old_pos = pos.clone();
        let mut new_idx: Vec<i64> = Vec::with_capacity(idx.len());
        let mut new_vals: Vec<f64> = Vec::with_capacity(vals.len());
        for p in 0..segments {
            let start = old_pos[p] as usize;
            let end = (old_pos[p + 1] as usize).min(idx.len());
            let mut segment: Vec<(i64, f64)> = (start..end)
                .map(|q| {
                    let v = if with_vals {
                        vals.get(q).copied().unwrap_or(0.0)
                    } else {
                        0.0
                    };
                    (idx[q], v)
                })
                .collect();
            segment.sort_by_key(|entry| entry.0);

            let segment_start = new_idx.len();
            for (coord, v) in segment {
                if new_idx.len() > segment_start && *new_idx.last().unwrap() == coord {
                    *new_vals.last_mut().unwrap() += v;
                } else {
                    new_idx.push(coord);
                    new_vals.push(v);
                }
            }
            pos[p + 1] = new_idx.len() as i64;
        }
        *idx = new_idx;
        if with_vals {
            *vals = new_vals;
        }
    } else {
        let count = pos[segments].max(0) as usize;
        if idx.len() > count {
            idx.truncate(count);
        }
    }
    pos.truncate(segments + 1);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Format;
    use crate::ir::{LoopKind, Var};

    fn run(func: &Function, tensors: &mut HashMap<String, TensorStorage>) {
        execute(func, tensors).unwrap();
    }

    #[test]
    fn test_for_loop_sums() {
        // a_vals[0] = sum of b_vals
        let body = Stmt::Block(vec![
            Stmt::store(
                Expr::prop("a", Component::Vals),
                Expr::Int(0),
                Expr::Float(0.0),
            ),
            Stmt::For {
                var: Var::new("p"),
                begin: Expr::Int(0),
                end: Expr::Int(3),
                kind: LoopKind::Serial,
                body: Box::new(Stmt::Store {
                    arr: Expr::prop("a", Component::Vals),
                    index: Expr::Int(0),
                    value: Expr::load(Expr::prop("b", Component::Vals), Expr::var("p")),
                    compound: true,
                }),
            },
        ]);
        let func = Function {
            name: "sum".to_string(),
            params: vec!["b".to_string()],
            results: vec!["a".to_string()],
            body,
        };
        let mut tensors = HashMap::new();
        tensors.insert("b".to_string(), TensorStorage::dense(&[3], vec![1.0, 2.0, 4.0]));
        tensors.insert("a".to_string(), TensorStorage::scalar(0.0));
        run(&func, &mut tensors);
        assert_eq!(tensors["a"].vals, vec![7.0]);
    }

    #[test]
    fn test_missing_tensor_is_reported() {
        let func = Function {
            name: "f".to_string(),
            params: vec!["missing".to_string()],
            results: vec![],
            body: Stmt::Block(vec![]),
        };
        let mut tensors = HashMap::new();
        let err = execute(&func, &mut tensors).unwrap_err();
        assert_eq!(err.code, ErrorCode::UndefinedTensor);
    }

    #[test]
    fn test_search_finds_position() {
        let mut tensors = HashMap::new();
        let b = TensorStorage::from_entries(
            &[5],
            Format::sparse_vector(),
            &[(vec![1], 1.0), (vec![3], 2.0), (vec![4], 3.0)],
        )
        .unwrap();
        tensors.insert("b".to_string(), b);
        let vm = Vm {
            frame: HashMap::new(),
            tensors: &mut tensors,
        };
        let search = Expr::search(
            Expr::prop("b", Component::Idx(0)),
            Expr::Int(0),
            Expr::Int(3),
            Expr::Int(3),
        );
        assert_eq!(vm.eval(&search).unwrap(), Scalar::Int(1));
        let miss = Expr::search(
            Expr::prop("b", Component::Idx(0)),
            Expr::Int(0),
            Expr::Int(3),
            Expr::Int(2),
        );
        assert!(vm.eval(&miss).is_err());
    }

    #[test]
    fn test_finalize_coalesces_and_repairs() {
        // two segments with unsorted duplicates: [3, 1, 3 | 0]
        let mut t = TensorStorage::empty(&[2, 4], Format::csr());
        t.levels[1] = LevelStorage::Compressed {
            pos: vec![0, 3, 4],
            idx: vec![3, 1, 3, 0],
        };
        t.vals = vec![1.0, 2.0, 4.0, 8.0];
        finalize_append(&mut t, 1, 2, true, true).unwrap();
        match &t.levels[1] {
            LevelStorage::Compressed { pos, idx } => {
                assert_eq!(pos, &vec![0, 2, 3]);
                assert_eq!(idx, &vec![1, 3, 0]);
            }
            other => panic!("expected compressed level, got {:?}", other),
        }
        assert_eq!(t.vals, vec![2.0, 5.0, 8.0]);
    }

    #[test]
    fn test_finalize_repairs_skipped_segments() {
        let mut t = TensorStorage::empty(&[3, 4], Format::csr());
        t.levels[1] = LevelStorage::Compressed {
            pos: vec![0, 2, 0, 3],
            idx: vec![0, 2, 1, 99, 99],
        };
        finalize_append(&mut t, 1, 3, false, false).unwrap();
        match &t.levels[1] {
            LevelStorage::Compressed { pos, idx } => {
                assert_eq!(pos, &vec![0, 2, 2, 3]);
                assert_eq!(idx, &vec![0, 2, 1]);
            }
            other => panic!("expected compressed level, got {:?}", other),
        }
    }

    #[test]
    fn test_switch_dispatches_exact_mask() {
        let body = Stmt::Block(vec![
            Stmt::decl(Var::new("mask"), Expr::Int(2)),
            Stmt::Switch {
                control: Expr::var("mask"),
                cases: vec![
                    (
                        Expr::Int(1),
                        Stmt::store(
                            Expr::prop("a", Component::Vals),
                            Expr::Int(0),
                            Expr::Float(1.0),
                        ),
                    ),
                    (
                        Expr::Int(2),
                        Stmt::store(
                            Expr::prop("a", Component::Vals),
                            Expr::Int(0),
                            Expr::Float(2.0),
                        ),
                    ),
                ],
            },
        ]);
        let func = Function {
            name: "f".to_string(),
            params: vec![],
            results: vec!["a".to_string()],
            body,
        };
        let mut tensors = HashMap::new();
        tensors.insert("a".to_string(), TensorStorage::scalar(0.0));
        run(&func, &mut tensors);
        assert_eq!(tensors["a"].vals, vec![2.0]);
    }
}
