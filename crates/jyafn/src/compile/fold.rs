//! Constant folding.
//!
//! The first compiler pass walks the closed graph once, in node order, and
//! resolves every node to one of: keep (lower as-is), a constant, an alias
//! of an earlier node (`choose` with a constant condition), or elision
//! (`assert` known to hold). A constant-false assertion fails the build.
//!
//! The graph itself is never mutated; lowering consults the resolution
//! table instead. Alias targets are pre-resolved, so chains are flat.

use crate::error::CompilationError;
use crate::graph::{Graph, NodeId};
use crate::op::{Const, Op};

#[derive(Copy, Clone, Debug)]
pub(crate) enum Resolution {
    Keep,
    Const(Const),
    Alias(NodeId),
    Elide,
}

impl Resolution {
    fn as_const(self) -> Option<Const> {
        match self {
            Resolution::Const(c) => Some(c),
            _ => None,
        }
    }
}

/// Resolve `id` through at most one alias hop (targets are pre-resolved).
pub(crate) fn resolve(resolution: &[Resolution], id: NodeId) -> NodeId {
    match resolution[id.index()] {
        Resolution::Alias(target) => target,
        _ => id,
    }
}

pub(crate) fn fold(graph: &Graph) -> Result<Vec<Resolution>, CompilationError> {
    let nodes = graph.nodes();
    let mut resolution: Vec<Resolution> = Vec::with_capacity(nodes.len());
    let mut folded = 0usize;

    for node in nodes {
        let const_of = |id: NodeId| -> Option<Const> {
            resolution[resolve(&resolution, id).index()].as_const()
        };
        let entry = match &node.op {
            Op::Const(c) => Resolution::Const(*c),
            Op::Choose => match const_of(node.args[0]) {
                Some(Const::Bool(cond)) => {
                    folded += 1;
                    let taken = node.args[if cond { 1 } else { 2 }];
                    let taken = resolve(&resolution, taken);
                    match resolution[taken.index()] {
                        Resolution::Const(c) => Resolution::Const(c),
                        _ => Resolution::Alias(taken),
                    }
                }
                _ => Resolution::Keep,
            },
            Op::Assert { message } => match const_of(node.args[0]) {
                Some(Const::Bool(true)) => {
                    folded += 1;
                    Resolution::Elide
                }
                Some(Const::Bool(false)) => {
                    return Err(CompilationError::ConstantAssertionFailure(
                        graph.asserts[*message as usize].clone(),
                    ));
                }
                _ => Resolution::Keep,
            },
            op => {
                let args: Option<Vec<Const>> = node.args.iter().map(|a| const_of(*a)).collect();
                match args.and_then(|args| op.fold(&args)) {
                    Some(c) => {
                        folded += 1;
                        Resolution::Const(c)
                    }
                    None => Resolution::Keep,
                }
            }
        };
        resolution.push(entry);
    }

    if folded > 0 {
        log::debug!(
            "folded {folded} of {} nodes in `{}`",
            nodes.len(),
            graph.name()
        );
    }
    Ok(resolution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::op::{Comparison, ScalarBinary};

    #[test]
    fn pure_constant_chains_collapse() {
        let mut g = Graph::new("fold");
        let a = g.push_const(Const::Scalar(2.0)).unwrap();
        let b = g.push_const(Const::Scalar(3.0)).unwrap();
        // Node 2: 2.0 + 3.0, node 3: (2.0 + 3.0) > 2.0.
        let sum = g.push(Op::ScalarBinary(ScalarBinary::Add), &[a, b]).unwrap();
        g.push(Op::Compare(Comparison::Gt), &[sum, a]).unwrap();
        g.close();
        let resolution = fold(&g).unwrap();
        assert!(matches!(resolution[2], Resolution::Const(Const::Scalar(x)) if x == 5.0));
        assert!(matches!(resolution[3], Resolution::Const(Const::Bool(true))));
    }

    #[test]
    fn choose_with_constant_condition_collapses_to_the_branch() {
        let mut g = Graph::new("fold");
        let input = g.declare_input("x", crate::layout::Layout::Scalar).unwrap()[0];
        let cond = g.push_const(Const::Bool(true)).unwrap();
        let then = g.push_const(Const::Scalar(1.0)).unwrap();
        // Node 3: choose(true, 1.0, x) — constant branch taken.
        g.push(Op::Choose, &[cond, then, input]).unwrap();
        // Node 4: choose(true, x, 1.0) — non-constant branch taken.
        g.push(Op::Choose, &[cond, input, then]).unwrap();
        g.close();
        let resolution = fold(&g).unwrap();
        assert!(matches!(resolution[3], Resolution::Const(Const::Scalar(x)) if x == 1.0));
        match resolution[4] {
            Resolution::Alias(target) => assert_eq!(target.index(), 0),
            other => panic!("expected alias, got {other:?}"),
        }
    }

    #[test]
    fn constant_false_assertions_fail_the_build() {
        let mut g = Graph::new("fold");
        let f = g.push_const(Const::Bool(false)).unwrap();
        g.push_assert(f, "x must be positive").unwrap();
        g.close();
        let err = fold(&g).unwrap_err();
        assert!(err.to_string().contains("x must be positive"));
    }
}
