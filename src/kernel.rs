// Copyright 2025 The Tensile Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! Compiled kernels: the user-facing driver that lowers an assignment
//! into assemble, compute and evaluate functions and runs them against
//! tensor storage.

use std::collections::{BTreeSet, HashMap};

use crate::ast::Assignment;
use crate::common::Result;
use crate::ir;
use crate::lower::{lower, Property, DEFAULT_ALLOC_SIZE};
use crate::storage::TensorStorage;
use crate::vm;

/// The three functions lowered from one assignment.  `assemble` builds
/// the result's index structure, `compute` fills its values, and
/// `evaluate` does both in a single pass.
#[derive(Clone, Debug)]
pub struct Kernel {
    pub assignment: Assignment,
    pub assemble_func: ir::Function,
    pub compute_func: ir::Function,
    pub evaluate_func: ir::Function,
}

impl Kernel {
    pub fn compile(assignment: &Assignment) -> Result<Kernel> {
        Kernel::compile_with(assignment, &BTreeSet::new())
    }

    /// Compile with extra properties (e.g. `Accumulate` or `Print`)
    /// applied to every lowered function.
    pub fn compile_with(
        assignment: &Assignment,
        extra: &BTreeSet<Property>,
    ) -> Result<Kernel> {
        let with = |props: &[Property]| -> BTreeSet<Property> {
            extra.iter().copied().chain(props.iter().copied()).collect()
        };
        let assemble_func = lower(
            assignment,
            "assemble",
            &with(&[Property::Assemble]),
            DEFAULT_ALLOC_SIZE,
        )?;
        let compute_func = lower(
            assignment,
            "compute",
            &with(&[Property::Compute]),
            DEFAULT_ALLOC_SIZE,
        )?;
        let evaluate_func = lower(
            assignment,
            "evaluate",
            &with(&[Property::Assemble, Property::Compute]),
            DEFAULT_ALLOC_SIZE,
        )?;
        log::debug!("compiled kernel for `{}`", assignment);
        Ok(Kernel {
            assignment: assignment.clone(),
            assemble_func,
            compute_func,
            evaluate_func,
        })
    }

    /// Assemble the result's index structure.
    pub fn assemble(&self, tensors: &mut HashMap<String, TensorStorage>) -> Result<()> {
        vm::execute(&self.assemble_func, tensors)
    }

    /// Compute the result's values into an assembled structure.
    pub fn compute(&self, tensors: &mut HashMap<String, TensorStorage>) -> Result<()> {
        vm::execute(&self.compute_func, tensors)
    }

    /// Assemble and compute in one pass.
    pub fn evaluate(&self, tensors: &mut HashMap<String, TensorStorage>) -> Result<()> {
        vm::execute(&self.evaluate_func, tensors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Access, IndexExpr, IndexVar, TensorVar};
    use crate::format::Format;

    #[test]
    fn test_compile_produces_three_functions() {
        let a = TensorVar::new("a", Format::dense(1)).unwrap();
        let b = TensorVar::new("b", Format::dense(1)).unwrap();
        let i = IndexVar::new("i");
        let assign = Assignment::new(
            Access::new(a, vec![i.clone()]),
            IndexExpr::access(&b, &[i]),
        );
        let kernel = Kernel::compile(&assign).unwrap();
        assert_eq!(kernel.assemble_func.name, "assemble");
        assert_eq!(kernel.compute_func.name, "compute");
        assert_eq!(kernel.evaluate_func.name, "evaluate");
        assert_eq!(kernel.compute_func.params, vec!["b".to_string()]);
        assert_eq!(kernel.compute_func.results, vec!["a".to_string()]);
    }

    #[test]
    fn test_print_property_is_accepted() {
        let a = TensorVar::new("a", Format::dense(1)).unwrap();
        let b = TensorVar::new("b", Format::sparse_vector()).unwrap();
        let i = IndexVar::new("i");
        let assign = Assignment::new(
            Access::new(a, vec![i.clone()]),
            IndexExpr::access(&b, &[i]),
        );
        let extra: BTreeSet<Property> = [Property::Print].into_iter().collect();
        let kernel = Kernel::compile_with(&assign, &extra).unwrap();
        assert!(!kernel.evaluate_func.to_string().is_empty());
    }
}
