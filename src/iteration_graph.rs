// Copyright 2025 The Tensile Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The iteration graph: a forest over index variables giving the loop
//! nesting order, and the tensor paths that thread each access through it.

use std::collections::{HashMap, HashSet};

use crate::ast::{Access, Assignment, IndexVar};
use crate::common::Result;
use crate::lower_err;

/// Identifies one tensor path: either the i-th input access or the result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathRef {
    Input(usize),
    Result,
}

/// One level of one tensor path.  Iterators are keyed by step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorPathStep {
    pub path: PathRef,
    pub level: usize,
}

/// The ordered sequence of index variables used to access one tensor,
/// following the storage order of its format.
#[derive(Clone, Debug, PartialEq)]
pub struct TensorPath {
    pub access: Access,
    pub variables: Vec<IndexVar>,
}

impl TensorPath {
    fn new(access: &Access) -> Self {
        let format = access.tensor.format();
        let variables = (0..format.order())
            .map(|l| access.indices[format.dimension_of(l)].clone())
            .collect();
        TensorPath {
            access: access.clone(),
            variables,
        }
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// The level at which this path ranges over `ivar`.
    pub fn level_of(&self, ivar: &IndexVar) -> Option<usize> {
        self.variables.iter().position(|v| v == ivar)
    }
}

/// Partial order of index variables, realized as a forest.  Immutable
/// during lowering.
#[derive(Clone, Debug)]
pub struct IterationGraph {
    order: Vec<IndexVar>,
    roots: Vec<IndexVar>,
    parent: HashMap<IndexVar, Option<IndexVar>>,
    children: HashMap<IndexVar, Vec<IndexVar>>,
    free: HashSet<IndexVar>,
    paths: Vec<TensorPath>,
    result_path: TensorPath,
}

impl IterationGraph {
    /// Build the graph for an assignment.  Each path contributes precedence
    /// edges between successive path variables; a precedence cycle means
    /// the expression needs a transposition the storage orders do not
    /// support.
    pub fn make(assignment: &Assignment) -> Result<IterationGraph> {
        let result_path = TensorPath::new(&assignment.lhs);

        let mut paths: Vec<TensorPath> = vec![];
        for access in assignment.rhs.accesses() {
            if !paths.iter().any(|p| &p.access == access) {
                paths.push(TensorPath::new(access));
            }
        }

        // Stable variable ordering: left-hand side first, then first use.
        let mut appearance: Vec<IndexVar> = vec![];
        for iv in assignment
            .lhs
            .indices
            .iter()
            .cloned()
            .chain(assignment.rhs.index_vars())
        {
            if !appearance.contains(&iv) {
                appearance.push(iv);
            }
        }

        let mut edges: Vec<(IndexVar, IndexVar)> = vec![];
        for path in paths.iter().chain(std::iter::once(&result_path)) {
            for w in path.variables.windows(2) {
                let edge = (w[0].clone(), w[1].clone());
                if !edges.contains(&edge) {
                    edges.push(edge);
                }
            }
        }

        // Topological order with a first-appearance tie break, so the
        // emitted loop order is deterministic.
        let mut order: Vec<IndexVar> = vec![];
        let mut placed: HashSet<IndexVar> = HashSet::new();
        while order.len() < appearance.len() {
            let next = appearance.iter().find(|iv| {
                !placed.contains(*iv)
                    && edges
                        .iter()
                        .filter(|(_, dst)| dst == *iv)
                        .all(|(src, _)| placed.contains(src))
            });
            match next {
                Some(iv) => {
                    placed.insert(iv.clone());
                    order.push(iv.clone());
                }
                None => {
                    return lower_err!(
                        Transposition,
                        "the access order of the operands cannot be realized by one loop nest"
                    );
                }
            }
        }

        let position: HashMap<&IndexVar, usize> =
            order.iter().enumerate().map(|(n, iv)| (iv, n)).collect();

        // Parent: the latest-ordered direct predecessor.
        let mut parent: HashMap<IndexVar, Option<IndexVar>> = HashMap::new();
        for iv in &order {
            let p = edges
                .iter()
                .filter(|(_, dst)| dst == iv)
                .map(|(src, _)| src)
                .max_by_key(|src| position[*src])
                .cloned();
            parent.insert(iv.clone(), p);
        }

        let mut children: HashMap<IndexVar, Vec<IndexVar>> =
            order.iter().map(|iv| (iv.clone(), vec![])).collect();
        let mut roots = vec![];
        for iv in &order {
            match &parent[iv] {
                Some(p) => children.get_mut(p).unwrap().push(iv.clone()),
                None => roots.push(iv.clone()),
            }
        }

        let free: HashSet<IndexVar> = assignment.lhs.indices.iter().cloned().collect();

        Ok(IterationGraph {
            order,
            roots,
            parent,
            children,
            free,
            paths,
            result_path,
        })
    }

    pub fn roots(&self) -> &[IndexVar] {
        &self.roots
    }

    pub fn children(&self, ivar: &IndexVar) -> &[IndexVar] {
        &self.children[ivar]
    }

    /// The chain from the root down to `ivar`, inclusive.
    pub fn ancestors(&self, ivar: &IndexVar) -> Vec<IndexVar> {
        let mut chain = vec![ivar.clone()];
        let mut cur = ivar;
        while let Some(p) = self.parent[cur].as_ref() {
            chain.push(p.clone());
            cur = p;
        }
        chain.reverse();
        chain
    }

    /// The subtree rooted at `ivar`, in preorder, inclusive.
    pub fn descendants(&self, ivar: &IndexVar) -> Vec<IndexVar> {
        let mut out = vec![ivar.clone()];
        for child in self.children(ivar) {
            out.extend(self.descendants(child));
        }
        out
    }

    pub fn is_free(&self, ivar: &IndexVar) -> bool {
        self.free.contains(ivar)
    }

    pub fn is_reduction(&self, ivar: &IndexVar) -> bool {
        !self.free.contains(ivar)
    }

    pub fn is_root(&self, ivar: &IndexVar) -> bool {
        self.parent[ivar].is_none()
    }

    /// True iff `ivar` is free and no free variable is nested below it.
    pub fn is_last_free_variable(&self, ivar: &IndexVar) -> bool {
        self.is_free(ivar) && !self.has_free_variable_descendant(ivar)
    }

    pub fn has_free_variable_descendant(&self, ivar: &IndexVar) -> bool {
        self.descendants(ivar)
            .iter()
            .any(|d| d != ivar && self.is_free(d))
    }

    /// True iff `ivar` or a variable it is nested under is summed over.
    pub fn has_reduction_variable_ancestor(&self, ivar: &IndexVar) -> bool {
        self.ancestors(ivar).iter().any(|a| self.is_reduction(a))
    }

    pub fn tensor_paths(&self) -> &[TensorPath] {
        &self.paths
    }

    pub fn result_tensor_path(&self) -> &TensorPath {
        &self.result_path
    }

    pub fn path(&self, path: PathRef) -> &TensorPath {
        match path {
            PathRef::Input(n) => &self.paths[n],
            PathRef::Result => &self.result_path,
        }
    }

    /// The path of an input access, if it has one.
    pub fn path_of(&self, access: &Access) -> Option<(PathRef, &TensorPath)> {
        self.paths
            .iter()
            .enumerate()
            .find(|(_, p)| &p.access == access)
            .map(|(n, p)| (PathRef::Input(n), p))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{IndexExpr, TensorVar};
    use crate::format::Format;

    fn ivar(name: &str) -> IndexVar {
        IndexVar::new(name)
    }

    fn spmv() -> Assignment {
        let a = TensorVar::new("a", Format::dense(1)).unwrap();
        let b = TensorVar::new("B", Format::csr()).unwrap();
        let c = TensorVar::new("c", Format::dense(1)).unwrap();
        let (i, j) = (ivar("i"), ivar("j"));
        Assignment::new(
            Access::new(a, vec![i.clone()]),
            IndexExpr::mul(
                IndexExpr::access(&b, &[i, j.clone()]),
                IndexExpr::access(&c, &[j]),
            ),
        )
    }

    fn spgemm() -> Assignment {
        let a = TensorVar::new("A", Format::csr()).unwrap();
        let b = TensorVar::new("B", Format::csr()).unwrap();
        let c = TensorVar::new("C", Format::csr()).unwrap();
        let (i, j, k) = (ivar("i"), ivar("j"), ivar("k"));
        Assignment::new(
            Access::new(a, vec![i.clone(), j.clone()]),
            IndexExpr::mul(
                IndexExpr::access(&b, &[i, k.clone()]),
                IndexExpr::access(&c, &[k, j]),
            ),
        )
    }

    #[test]
    fn test_spmv_graph() {
        let graph = IterationGraph::make(&spmv()).unwrap();
        let (i, j) = (ivar("i"), ivar("j"));

        assert_eq!(graph.roots(), &[i.clone()]);
        assert_eq!(graph.children(&i), &[j.clone()]);
        assert!(graph.is_free(&i));
        assert!(graph.is_reduction(&j));
        assert!(graph.is_last_free_variable(&i));
        assert!(!graph.has_free_variable_descendant(&i));
        assert!(graph.has_reduction_variable_ancestor(&j));
        assert!(!graph.has_reduction_variable_ancestor(&i));
    }

    #[test]
    fn test_spgemm_nests_j_under_k() {
        let graph = IterationGraph::make(&spgemm()).unwrap();
        let (i, j, k) = (ivar("i"), ivar("j"), ivar("k"));

        assert_eq!(graph.roots(), &[i.clone()]);
        assert_eq!(graph.children(&i), &[k.clone()]);
        assert_eq!(graph.children(&k), &[j.clone()]);
        assert!(graph.is_last_free_variable(&j));
        assert!(graph.has_free_variable_descendant(&i));
        assert!(graph.has_free_variable_descendant(&k));
        assert!(graph.has_reduction_variable_ancestor(&j));
        assert_eq!(graph.ancestors(&j), vec![i, k, j.clone()]);
    }

    #[test]
    fn test_transposed_access_is_rejected() {
        let a = TensorVar::new("A", Format::dense(2)).unwrap();
        let b = TensorVar::new("B", Format::dense(2)).unwrap();
        let (i, j) = (ivar("i"), ivar("j"));
        let assign = Assignment::new(
            Access::new(a, vec![i.clone(), j.clone()]),
            IndexExpr::access(&b, &[j, i]),
        );
        let err = IterationGraph::make(&assign).unwrap_err();
        assert_eq!(err.code, crate::common::ErrorCode::Transposition);
    }

    #[test]
    fn test_multiple_children() {
        // a(i) = B(i,j) * C(i,k): both j and k hang off i
        let a = TensorVar::new("a", Format::dense(1)).unwrap();
        let b = TensorVar::new("B", Format::csr()).unwrap();
        let c = TensorVar::new("C", Format::csr()).unwrap();
        let (i, j, k) = (ivar("i"), ivar("j"), ivar("k"));
        let assign = Assignment::new(
            Access::new(a, vec![i.clone()]),
            IndexExpr::mul(
                IndexExpr::access(&b, &[i.clone(), j.clone()]),
                IndexExpr::access(&c, &[i.clone(), k.clone()]),
            ),
        );
        let graph = IterationGraph::make(&assign).unwrap();
        assert_eq!(graph.children(&i), &[j, k]);
    }

    #[test]
    fn test_scalar_expression_has_no_roots() {
        let alpha = TensorVar::scalar("alpha");
        let beta = TensorVar::scalar("beta");
        let assign = Assignment::new(
            Access::new(alpha, vec![]),
            IndexExpr::access(&beta, &[]),
        );
        let graph = IterationGraph::make(&assign).unwrap();
        assert!(graph.roots().is_empty());
    }
}
