//! The computation graph.
//!
//! A [`Graph`] owns an append-only vector of typed nodes, its input and
//! return declarations, and every constant the compiled function will need:
//! the symbol table, mapping tables, resource blobs and embedded sub-graphs.
//! Nodes are identified by dense indices; every operand of a node is a
//! strictly earlier node, so a graph is a DAG in topological order by
//! construction.
//!
//! Graphs are *open* while under construction on the thread-local builder
//! stack and *closed* once finished. Only open graphs accept nodes; only
//! closed graphs can be hashed, serialized, embedded or compiled.

use core::fmt;
use std::collections::HashMap;

use indexmap::IndexMap;
use serde_derive::Serialize;
use sha2::{Digest, Sha256};
use smallvec::SmallVec;

use crate::error::{BuildError, Error};
use crate::layout::Layout;
use crate::mapping::MappingSpec;
use crate::op::{Const, Op};
use crate::resource::ResourceSpec;
use crate::symbols::{DYNAMIC_SYMBOL_BIT, SymbolTable};
use crate::types::Type;

/// Reserved metadata prefix.
pub const METADATA_PREFIX: &str = "jyafn.";

fn fresh_graph_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// A dense index into a graph's node vector.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, serde_derive::Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    pub(crate) fn new(index: usize) -> Self {
        NodeId(u32::try_from(index).expect("graph node count fits in u32"))
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// One node: an operation, its operands, and the cached result type.
#[derive(Clone, Debug, Serialize)]
pub struct Node {
    pub(crate) op: Op,
    pub(crate) args: SmallVec<[NodeId; 4]>,
    pub(crate) ty: Type,
}

/// An opaque handle to a node of the graph that produced it.
///
/// References are only meaningful inside their own graph; using one in
/// another graph is a [`BuildError::CrossGraphReference`].
#[derive(Copy, Clone, Debug)]
pub struct Ref {
    pub(crate) graph: u64,
    pub(crate) node: NodeId,
    pub(crate) ty: Type,
}

impl Ref {
    /// The primitive type of the value behind this reference.
    pub fn ty(&self) -> Type {
        self.ty
    }
}

/// A typed computation DAG plus everything its compiled form embeds.
#[derive(Clone, Debug, Serialize)]
pub struct Graph {
    name: String,
    #[serde(skip)]
    pub(crate) id: u64,
    nodes: Vec<Node>,
    inputs: Vec<(String, Layout)>,
    input_width: usize,
    ret: Option<(Vec<NodeId>, Layout)>,
    pub(crate) symbols: SymbolTable,
    pub(crate) mappings: Vec<MappingSpec>,
    pub(crate) resources: Vec<ResourceSpec>,
    pub(crate) subgraphs: Vec<Graph>,
    pub(crate) asserts: Vec<String>,
    metadata: IndexMap<String, String>,
    #[serde(skip)]
    open: bool,
    #[serde(skip)]
    mapping_handles: HashMap<u64, u32>,
    #[serde(skip)]
    resource_handles: HashMap<u64, u32>,
    #[serde(skip)]
    subgraph_handles: HashMap<u64, u32>,
}

impl Graph {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Graph {
            name: name.into(),
            id: fresh_graph_id(),
            nodes: Vec::new(),
            inputs: Vec::new(),
            input_width: 0,
            ret: None,
            symbols: SymbolTable::new(),
            mappings: Vec::new(),
            resources: Vec::new(),
            subgraphs: Vec::new(),
            asserts: Vec::new(),
            metadata: IndexMap::new(),
            open: true,
            mapping_handles: HashMap::new(),
            resource_handles: HashMap::new(),
            subgraph_handles: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub(crate) fn close(&mut self) {
        self.open = false;
    }

    /// The declared inputs, in declaration order.
    pub fn input_decls(&self) -> &[(String, Layout)] {
        &self.inputs
    }

    /// The input layout seen by callers: a struct of the declared inputs.
    pub fn input_layout(&self) -> Layout {
        Layout::struct_of(self.inputs.iter().cloned())
    }

    /// The declared output layout, if a return was declared.
    pub fn output_layout(&self) -> Option<&Layout> {
        self.ret.as_ref().map(|(_, layout)| layout)
    }

    pub fn metadata(&self) -> &IndexMap<String, String> {
        &self.metadata
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub(crate) fn input_width(&self) -> usize {
        self.input_width
    }

    pub(crate) fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub(crate) fn ret(&self) -> Option<&(Vec<NodeId>, Layout)> {
        self.ret.as_ref()
    }

    /// Number of nodes appended so far.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn check_ref(&self, r: Ref) -> Result<NodeId, BuildError> {
        if r.graph != self.id {
            return Err(BuildError::CrossGraphReference {
                ref_graph: format!("#{}", r.graph),
                current_graph: self.name.clone(),
            });
        }
        Ok(r.node)
    }

    /// Append a node, checking the operand types against the operation's
    /// signature. This is the single entry point for node creation.
    pub(crate) fn push(&mut self, op: Op, args: &[Ref]) -> Result<Ref, BuildError> {
        if !self.open {
            return Err(BuildError::GraphClosed(self.name.clone()));
        }
        let mut ids = SmallVec::with_capacity(args.len());
        let mut types = SmallVec::<[Type; 4]>::with_capacity(args.len());
        for r in args {
            ids.push(self.check_ref(*r)?);
            types.push(r.ty);
        }
        let ty = op.result_type(&types)?;
        let node = NodeId::new(self.nodes.len());
        self.nodes.push(Node { op, args: ids, ty });
        Ok(Ref {
            graph: self.id,
            node,
            ty,
        })
    }

    pub(crate) fn push_const(&mut self, c: Const) -> Result<Ref, BuildError> {
        self.push(Op::Const(c), &[])
    }

    /// Intern a symbol into this graph's table.
    pub(crate) fn intern_symbol(&mut self, text: &str) -> u64 {
        self.symbols.intern(text)
    }

    /// Declare a typed input. Appends one `Input` node per word of `layout`
    /// and returns the leaf references in encoding order.
    pub(crate) fn declare_input(
        &mut self,
        name: &str,
        layout: Layout,
    ) -> Result<Vec<Ref>, BuildError> {
        if !self.open {
            return Err(BuildError::GraphClosed(self.name.clone()));
        }
        if self.inputs.iter().any(|(n, _)| n == name) {
            return Err(BuildError::DuplicateInput(name.to_string()));
        }
        let base = self.input_width;
        let leaves = layout.leaf_types();
        let mut refs = Vec::with_capacity(leaves.len());
        for (i, ty) in leaves.into_iter().enumerate() {
            let slot = u32::try_from(base + i).expect("input width fits in u32");
            refs.push(self.push(Op::Input { slot, ty }, &[])?);
        }
        self.input_width = base + refs.len();
        self.inputs.push((name.to_string(), layout));
        Ok(refs)
    }

    /// Declare the return value: `outputs` are the flattened leaf references
    /// in the encoding order of `layout`. Their types must match the
    /// layout's leaves exactly.
    pub(crate) fn declare_ret(
        &mut self,
        outputs: Vec<Ref>,
        layout: Layout,
    ) -> Result<(), BuildError> {
        if self.ret.is_some() {
            return Err(BuildError::ReturnAlreadyDeclared(self.name.clone()));
        }
        let leaves = layout.leaf_types();
        if leaves.len() != outputs.len() {
            return Err(BuildError::LayoutMismatch {
                path: ".".into(),
                expected: format!("{} words", leaves.len()),
                got: format!("{} references", outputs.len()),
            });
        }
        let mut ids = Vec::with_capacity(outputs.len());
        for (i, (r, expected)) in outputs.iter().zip(leaves).enumerate() {
            let id = self.check_ref(*r)?;
            if r.ty != expected {
                return Err(BuildError::LayoutMismatch {
                    path: format!("[{i}]"),
                    expected: expected.to_string(),
                    got: r.ty.to_string(),
                });
            }
            ids.push(id);
        }
        self.ret = Some((ids, layout));
        Ok(())
    }

    pub(crate) fn push_assert(&mut self, cond: Ref, message: &str) -> Result<(), BuildError> {
        let index = u32::try_from(self.asserts.len()).expect("assert count fits in u32");
        self.push(Op::Assert { message: index }, &[cond])?;
        self.asserts.push(message.to_string());
        Ok(())
    }

    pub(crate) fn lookup_mapping(&self, handle_id: u64) -> Option<u32> {
        self.mapping_handles.get(&handle_id).copied()
    }

    pub(crate) fn lookup_resource(&self, handle_id: u64) -> Option<u32> {
        self.resource_handles.get(&handle_id).copied()
    }

    /// Register a mapping constant, deduplicating by handle identity.
    pub(crate) fn register_mapping(&mut self, handle_id: u64, spec: MappingSpec) -> u32 {
        if let Some(&index) = self.mapping_handles.get(&handle_id) {
            return index;
        }
        let index = u32::try_from(self.mappings.len()).expect("mapping count fits in u32");
        self.mappings.push(spec);
        self.mapping_handles.insert(handle_id, index);
        index
    }

    /// Register a resource constant, deduplicating by handle identity.
    pub(crate) fn register_resource(&mut self, handle_id: u64, spec: ResourceSpec) -> u32 {
        if let Some(&index) = self.resource_handles.get(&handle_id) {
            return index;
        }
        let index = u32::try_from(self.resources.len()).expect("resource count fits in u32");
        self.resources.push(spec);
        self.resource_handles.insert(handle_id, index);
        index
    }

    pub(crate) fn resource_spec_mut(&mut self, index: u32) -> &mut ResourceSpec {
        &mut self.resources[index as usize]
    }

    /// Embed a closed graph as a callable constant of this graph.
    ///
    /// The callee is cloned and its symbol space is merged into this
    /// graph's, so symbol values flow across the call unchanged. Mappings
    /// and resources stay callee-local.
    pub(crate) fn embed(&mut self, sub: &Graph) -> Result<u32, BuildError> {
        if sub.open || sub.ret.is_none() {
            return Err(BuildError::BadSubgraph {
                caller: self.name.clone(),
                callee: sub.name.clone(),
                reason: "callee is not a closed graph".into(),
            });
        }
        if sub.id == self.id || sub.contains_graph(self.id) {
            return Err(BuildError::BadSubgraph {
                caller: self.name.clone(),
                callee: sub.name.clone(),
                reason: "embedding would be recursive".into(),
            });
        }
        if let Some(&index) = self.subgraph_handles.get(&sub.id) {
            return Ok(index);
        }
        let mut clone = sub.clone();
        clone.remap_symbols_into(&mut self.symbols);
        let index = u32::try_from(self.subgraphs.len()).expect("subgraph count fits in u32");
        self.subgraphs.push(clone);
        self.subgraph_handles.insert(sub.id, index);
        Ok(index)
    }

    fn contains_graph(&self, id: u64) -> bool {
        self.subgraphs
            .iter()
            .any(|g| g.id == id || g.contains_graph(id))
    }

    /// Rewrite every symbol id in this graph (and, recursively, its
    /// sub-graphs) into `target`'s id space, then adopt a frozen copy of the
    /// merged table.
    fn remap_symbols_into(&mut self, target: &mut SymbolTable) {
        let map: Vec<u64> = self.symbols.iter().map(|s| target.intern(s)).collect();
        let remap = |id: u64| -> u64 {
            if id & DYNAMIC_SYMBOL_BIT != 0 {
                id
            } else {
                map[id as usize]
            }
        };
        for node in &mut self.nodes {
            match &mut node.op {
                Op::Const(Const::Symbol(id)) => *id = remap(*id),
                Op::ParseDateTime { format } | Op::FormatDateTime { format } => {
                    *format = remap(*format)
                }
                _ => {}
            }
        }
        for mapping in &mut self.mappings {
            mapping.remap_symbols(&remap);
        }
        for sub in &mut self.subgraphs {
            sub.remap_symbols_into(target);
        }
        self.symbols = target.clone();
    }

    /// Check the universal operand-index invariant: every operand of node
    /// `i` is strictly less than `i`.
    pub fn validate(&self) -> Result<(), BuildError> {
        for (i, node) in self.nodes.iter().enumerate() {
            for &arg in &node.args {
                if arg.index() >= i {
                    return Err(BuildError::NonTopological {
                        node: i as u32,
                        operand: arg.raw(),
                    });
                }
            }
        }
        Ok(())
    }

    /// SHA-256 over the canonical binary encoding of this (closed) graph.
    pub fn content_hash(&self) -> [u8; 32] {
        let bytes = postcard::to_allocvec(self).expect("graph serialization is infallible");
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hasher.finalize().into()
    }

    /// JSON rendering of the graph structure. Debugging only; never a
    /// loader input.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("graph serialization is infallible")
    }

    /// Rough in-memory footprint, recorded as `jyafn.mem_size_estimate`.
    pub fn size_estimate(&self) -> usize {
        let nodes = self.nodes.len() * std::mem::size_of::<Node>();
        let symbols = self.symbols.size_estimate();
        let mappings: usize = self.mappings.iter().map(MappingSpec::size_estimate).sum();
        let resources: usize = self.resources.iter().map(|r| r.payload.len()).sum();
        let subgraphs: usize = self.subgraphs.iter().map(Graph::size_estimate).sum();
        nodes + symbols + mappings + resources + subgraphs
    }

    /// Compile this closed graph into a callable [`crate::Function`].
    pub fn compile(&self) -> Result<crate::Function, Error> {
        crate::compile::compile(self)
    }

    /// The textual IR of the lowered function. Debug artifact.
    pub fn render(&self) -> Result<String, Error> {
        crate::compile::render(self)
    }

    /// The back-end's disassembly of the lowered function. Debug artifact.
    pub fn render_assembly(&self) -> Result<String, Error> {
        crate::compile::render_assembly(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::ScalarBinary;

    #[test]
    fn operand_indices_precede_nodes() {
        let mut g = Graph::new("test");
        let a = g.push_const(Const::Scalar(1.0)).unwrap();
        let b = g.push_const(Const::Scalar(2.0)).unwrap();
        let c = g.push(Op::ScalarBinary(ScalarBinary::Add), &[a, b]).unwrap();
        assert_eq!(c.ty(), Type::Float);
        g.validate().unwrap();
        for (i, node) in g.nodes().iter().enumerate() {
            for arg in &node.args {
                assert!(arg.index() < i);
            }
        }
    }

    #[test]
    fn cross_graph_references_are_rejected() {
        let mut g1 = Graph::new("one");
        let mut g2 = Graph::new("two");
        let a = g1.push_const(Const::Scalar(1.0)).unwrap();
        let b = g2.push_const(Const::Scalar(2.0)).unwrap();
        let err = g2
            .push(Op::ScalarBinary(ScalarBinary::Add), &[a, b])
            .unwrap_err();
        assert!(matches!(err, BuildError::CrossGraphReference { .. }));
    }

    #[test]
    fn closed_graphs_reject_nodes() {
        let mut g = Graph::new("done");
        g.close();
        assert!(matches!(
            g.push_const(Const::Bool(true)),
            Err(BuildError::GraphClosed(_))
        ));
    }

    #[test]
    fn content_hash_is_stable() {
        let build = || {
            let mut g = Graph::new("h");
            let a = g.push_const(Const::Scalar(1.0)).unwrap();
            let b = g.push_const(Const::Scalar(2.0)).unwrap();
            g.push(Op::ScalarBinary(ScalarBinary::Mul), &[a, b]).unwrap();
            g.close();
            g
        };
        assert_eq!(build().content_hash(), build().content_hash());
    }
}
