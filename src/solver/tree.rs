//! Tree matrix elimination.
//!
//! The cable matrix of a tree-ordered node set has one off-diagonal pair per
//! non-root node, so Gaussian elimination from the leaves toward the roots
//! needs no fill-in and runs in O(n).

use std::fmt;

use crate::model::NodeArrays;

/// Linear-algebra collaborator for the implicit solve.
///
/// Operates in place on `d`, `rhs`, `a`, `b` of the node arrays; the solution
/// is left in `rhs`. The split into two halves lets roots shared between
/// partitions be summed in between.
pub trait TreeSolver: Send + Sync + fmt::Debug {
    /// Eliminate every non-root row into its parent.
    fn triangularize(&self, nodes: &mut NodeArrays);

    /// Solve the roots, then substitute down the tree.
    fn back_substitute(&self, nodes: &mut NodeArrays);

    fn solve(&self, nodes: &mut NodeArrays) {
        self.triangularize(nodes);
        self.back_substitute(nodes);
    }
}

/// Hines elimination for tree-ordered matrices.
#[derive(Debug, Clone, Copy, Default)]
pub struct HinesSolver;

impl TreeSolver for HinesSolver {
    fn triangularize(&self, nodes: &mut NodeArrays) {
        for i in (nodes.root_end..nodes.len()).rev() {
            let Some(p) = nodes.parent[i] else {
                continue;
            };
            if nodes.d[i] == 0.0 {
                continue;
            }
            let ppp = nodes.a[i] / nodes.d[i];
            nodes.d[p] -= ppp * nodes.b[i];
            nodes.rhs[p] -= ppp * nodes.rhs[i];
        }
    }

    fn back_substitute(&self, nodes: &mut NodeArrays) {
        for i in 0..nodes.root_end {
            if nodes.d[i] != 0.0 {
                nodes.rhs[i] /= nodes.d[i];
            }
        }
        for i in nodes.root_end..nodes.len() {
            let Some(p) = nodes.parent[i] else {
                continue;
            };
            nodes.rhs[i] -= nodes.b[i] * nodes.rhs[p];
            if nodes.d[i] != 0.0 {
                nodes.rhs[i] /= nodes.d[i];
            }
        }
    }
}
