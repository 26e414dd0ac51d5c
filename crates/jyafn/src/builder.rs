//! The imperative graph-building surface.
//!
//! Construction targets a thread-local stack of open graphs: [`Graph::begin`]
//! pushes a fresh graph and returns a guard, every builder call below
//! appends to the top of the stack, and [`GraphGuard::finish`] pops and
//! closes it. Dropping the guard without finishing discards the graph, so a
//! failed build leaves the stack clean on every exit path.
//!
//! The canonical operation surface is the fallible named methods on [`Ref`]
//! (`try_add`, `eq`, `lt`, `choose`, ...). The operator overloads (`a + b`,
//! `2.0 * a`) are sugar over those methods and panic on builder misuse —
//! the same contract as cranelift's instruction builders.

use std::cell::RefCell;
use std::marker::PhantomData;

use crate::error::{BuildError, Error};
use crate::graph::{Graph, Ref};
use crate::layout::Layout;
use crate::op::{BoolBinary, Comparison, Const, Op, ScalarBinary, ScalarTest, ScalarUnary};
use crate::types::Type;
use crate::value::DateTimeField;

/// Scalar datetime arithmetic helpers: one second, in seconds.
pub const SECOND: f64 = 1.0;
pub const MINUTE: f64 = 60.0 * SECOND;
pub const HOUR: f64 = 60.0 * MINUTE;
pub const DAY: f64 = 24.0 * HOUR;

thread_local! {
    static STACK: RefCell<Vec<Graph>> = const { RefCell::new(Vec::new()) };
}

/// Run `f` against the graph on top of the thread-local stack.
pub(crate) fn with_current<R>(
    f: impl FnOnce(&mut Graph) -> Result<R, BuildError>,
) -> Result<R, BuildError> {
    STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        let graph = stack.last_mut().ok_or(BuildError::NoCurrentGraph)?;
        f(graph)
    })
}

/// Scope guard for a graph under construction. Not `Send`: a graph belongs
/// to the thread that opened it.
pub struct GraphGuard {
    id: u64,
    _single_thread: PhantomData<*mut ()>,
}

impl Graph {
    /// Push a fresh open graph onto this thread's builder stack.
    pub fn begin(name: impl Into<String>) -> GraphGuard {
        let graph = Graph::new(name);
        let id = graph.id;
        STACK.with(|stack| stack.borrow_mut().push(graph));
        GraphGuard {
            id,
            _single_thread: PhantomData,
        }
    }
}

impl GraphGuard {
    /// Pop the graph and close it. Fails if no return was declared.
    pub fn finish(self) -> Result<Graph, Error> {
        let id = self.id;
        std::mem::forget(self);
        let mut graph = take_graph(id).ok_or(BuildError::NoCurrentGraph)?;
        if graph.output_layout().is_none() {
            let name = graph.name().to_string();
            return Err(BuildError::MissingReturn(name).into());
        }
        graph.close();
        Ok(graph)
    }
}

impl Drop for GraphGuard {
    fn drop(&mut self) {
        // The partially built graph is discarded; the rest of the stack is
        // left as it was.
        take_graph(self.id);
    }
}

fn take_graph(id: u64) -> Option<Graph> {
    STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        let position = stack.iter().rposition(|g| g.id == id)?;
        Some(stack.remove(position))
    })
}

/// A closed snapshot of the graph currently under construction.
pub fn current_graph() -> Result<Graph, Error> {
    with_current(|g| {
        let mut snapshot = g.clone();
        snapshot.close();
        Ok(snapshot)
    })
    .map_err(Error::from)
}

// ---------------------------------------------------------------------------
// Host-side construction trees.

/// A short-lived host-side tree whose leaves are graph references. This is
/// what `input` returns and what `ret` consumes.
#[derive(Clone, Debug)]
pub enum RefValue {
    Unit,
    Ref(Ref),
    List(Vec<RefValue>),
    Struct(Vec<(String, RefValue)>),
    Tuple(Vec<RefValue>),
}

impl RefValue {
    /// A struct tree from named fields, preserving order.
    pub fn struct_of<N: Into<String>>(fields: impl IntoIterator<Item = (N, RefValue)>) -> Self {
        RefValue::Struct(fields.into_iter().map(|(n, v)| (n.into(), v)).collect())
    }

    /// The single reference behind a primitive tree.
    pub fn single(&self) -> Result<Ref, Error> {
        match self {
            RefValue::Ref(r) => Ok(*r),
            other => Err(BuildError::PutativeLayout(format!(
                "expected a primitive reference, got {}",
                other.kind()
            ))
            .into()),
        }
    }

    /// Access a struct field by name.
    pub fn field(&self, name: &str) -> Result<&RefValue, Error> {
        match self {
            RefValue::Struct(fields) => fields
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v)
                .ok_or_else(|| {
                    BuildError::PutativeLayout(format!("no field `{name}` in struct")).into()
                }),
            other => {
                Err(BuildError::PutativeLayout(format!("`{}` has no fields", other.kind())).into())
            }
        }
    }

    /// Access a list or tuple element by position.
    pub fn at(&self, index: usize) -> Result<&RefValue, Error> {
        match self {
            RefValue::List(items) | RefValue::Tuple(items) => {
                items.get(index).ok_or_else(|| {
                    BuildError::PutativeLayout(format!(
                        "index {index} out of range for {} elements",
                        items.len()
                    ))
                    .into()
                })
            }
            other => Err(BuildError::PutativeLayout(format!(
                "`{}` cannot be indexed",
                other.kind()
            ))
            .into()),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            RefValue::Unit => "unit",
            RefValue::Ref(_) => "ref",
            RefValue::List(_) => "list",
            RefValue::Struct(_) => "struct",
            RefValue::Tuple(_) => "tuple",
        }
    }
}

impl From<Ref> for RefValue {
    fn from(r: Ref) -> Self {
        RefValue::Ref(r)
    }
}

impl From<Vec<RefValue>> for RefValue {
    fn from(items: Vec<RefValue>) -> Self {
        RefValue::List(items)
    }
}

/// Anything that can be lifted into a single reference in the current
/// graph: an existing [`Ref`], or a literal that becomes a constant node.
pub trait IntoRef {
    fn into_ref(self, g: &mut Graph) -> Result<Ref, BuildError>;
}

impl IntoRef for Ref {
    fn into_ref(self, _g: &mut Graph) -> Result<Ref, BuildError> {
        Ok(self)
    }
}

impl IntoRef for f64 {
    fn into_ref(self, g: &mut Graph) -> Result<Ref, BuildError> {
        g.push_const(Const::Scalar(self))
    }
}

impl IntoRef for bool {
    fn into_ref(self, g: &mut Graph) -> Result<Ref, BuildError> {
        g.push_const(Const::Bool(self))
    }
}

impl IntoRef for &str {
    fn into_ref(self, g: &mut Graph) -> Result<Ref, BuildError> {
        let id = g.intern_symbol(self);
        g.push_const(Const::Symbol(id))
    }
}

/// Anything that can be lifted into a [`RefValue`] in the current graph.
pub trait IntoRefValue {
    fn into_ref_value(self, g: &mut Graph) -> Result<RefValue, BuildError>;
}

impl IntoRefValue for RefValue {
    fn into_ref_value(self, _g: &mut Graph) -> Result<RefValue, BuildError> {
        Ok(self)
    }
}

impl IntoRefValue for &RefValue {
    fn into_ref_value(self, _g: &mut Graph) -> Result<RefValue, BuildError> {
        Ok(self.clone())
    }
}

macro_rules! into_ref_value_via_ref {
    ($($ty:ty),*) => {
        $(impl IntoRefValue for $ty {
            fn into_ref_value(self, g: &mut Graph) -> Result<RefValue, BuildError> {
                Ok(RefValue::Ref(self.into_ref(g)?))
            }
        })*
    };
}

into_ref_value_via_ref!(Ref, f64, bool, &str);

/// Infer the layout of a construction tree by structural inspection.
pub fn putative_layout(value: &RefValue) -> Result<Layout, BuildError> {
    match value {
        RefValue::Unit => Ok(Layout::Unit),
        RefValue::Ref(r) => match r.ty() {
            Type::Float => Ok(Layout::Scalar),
            Type::Bool => Ok(Layout::Bool),
            Type::Symbol => Ok(Layout::Symbol),
            Type::DateTime => Ok(Layout::datetime()),
            Type::Ptr => Err(BuildError::PutativeLayout(
                "a pointer reference has no layout".into(),
            )),
        },
        RefValue::List(items) => {
            let Some(first) = items.first() else {
                return Ok(Layout::list_of(Layout::Scalar, 0));
            };
            let element = putative_layout(first)?;
            for item in &items[1..] {
                let other = putative_layout(item)?;
                if !element.same_shape(&other) {
                    return Err(BuildError::HeterogeneousList {
                        first: element.to_string(),
                        other: other.to_string(),
                    });
                }
            }
            Ok(Layout::list_of(element, items.len()))
        }
        RefValue::Struct(fields) => {
            let mut out = Vec::with_capacity(fields.len());
            for (name, value) in fields {
                out.push((name.clone(), putative_layout(value)?));
            }
            Ok(Layout::Struct { fields: out })
        }
        RefValue::Tuple(items) => Ok(Layout::Tuple {
            elements: items
                .iter()
                .map(putative_layout)
                .collect::<Result<_, _>>()?,
        }),
    }
}

/// Walk `value` and `layout` in lockstep, flattening the references in
/// encoding order. Any shape or type mismatch fails with the layout path.
pub(crate) fn flatten_ref_value(
    g: &Graph,
    value: &RefValue,
    layout: &Layout,
) -> Result<Vec<Ref>, BuildError> {
    let mut out = Vec::with_capacity(layout.width());
    let mut path = String::new();
    flatten_inner(g, value, layout, &mut out, &mut path)?;
    Ok(out)
}

fn flatten_inner(
    g: &Graph,
    value: &RefValue,
    layout: &Layout,
    out: &mut Vec<Ref>,
    path: &mut String,
) -> Result<(), BuildError> {
    let mismatch = |expected: &dyn std::fmt::Display, got: &dyn std::fmt::Display, path: &str| {
        BuildError::LayoutMismatch {
            path: if path.is_empty() {
                ".".into()
            } else {
                path.into()
            },
            expected: expected.to_string(),
            got: got.to_string(),
        }
    };
    match (layout, value) {
        (Layout::Unit, RefValue::Unit) => Ok(()),
        (
            Layout::Scalar | Layout::Bool | Layout::Symbol | Layout::DateTime { .. },
            RefValue::Ref(r),
        ) => {
            g.check_ref(*r)?;
            let expected = match layout {
                Layout::Scalar => Type::Float,
                Layout::Bool => Type::Bool,
                Layout::Symbol => Type::Symbol,
                _ => Type::DateTime,
            };
            if r.ty() != expected {
                return Err(mismatch(&expected, &r.ty(), path));
            }
            out.push(*r);
            Ok(())
        }
        (Layout::Struct { fields }, RefValue::Struct(values)) => {
            for (name, field_layout) in fields {
                let value = values
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, v)| v)
                    .ok_or_else(|| mismatch(&format!("field `{name}`"), &"nothing", path))?;
                let len = path.len();
                path.push('.');
                path.push_str(name);
                flatten_inner(g, value, field_layout, out, path)?;
                path.truncate(len);
            }
            Ok(())
        }
        (Layout::Tuple { elements }, RefValue::Tuple(values)) if elements.len() == values.len() => {
            for (i, (element, value)) in elements.iter().zip(values).enumerate() {
                let len = path.len();
                path.push_str(&format!("[{i}]"));
                flatten_inner(g, value, element, out, path)?;
                path.truncate(len);
            }
            Ok(())
        }
        (Layout::List { element, size }, RefValue::List(values)) => {
            if values.len() != *size {
                return Err(mismatch(
                    &format!("{size} elements"),
                    &format!("{}", values.len()),
                    path,
                ));
            }
            for (i, value) in values.iter().enumerate() {
                let len = path.len();
                path.push_str(&format!("[{i}]"));
                flatten_inner(g, value, element, out, path)?;
                path.truncate(len);
            }
            Ok(())
        }
        (layout, value) => Err(mismatch(layout, &value.kind(), path)),
    }
}

/// Rebuild a construction tree shaped like `layout` from leaves in encoding
/// order.
pub(crate) fn assemble(layout: &Layout, leaves: &mut impl Iterator<Item = Ref>) -> RefValue {
    match layout {
        Layout::Unit => RefValue::Unit,
        Layout::Scalar | Layout::Bool | Layout::Symbol | Layout::DateTime { .. } => {
            RefValue::Ref(leaves.next().expect("leaf count matches layout width"))
        }
        Layout::Struct { fields } => RefValue::Struct(
            fields
                .iter()
                .map(|(n, l)| (n.clone(), assemble(l, leaves)))
                .collect(),
        ),
        Layout::Tuple { elements } => {
            RefValue::Tuple(elements.iter().map(|l| assemble(l, leaves)).collect())
        }
        Layout::List { element, size } => {
            RefValue::List((0..*size).map(|_| assemble(element, leaves)).collect())
        }
    }
}

/// Read `layout.width()` typed words behind a pointer-typed node, shaping
/// them like `layout`.
pub(crate) fn load_slots(g: &mut Graph, ptr: Ref, layout: &Layout) -> Result<RefValue, BuildError> {
    let mut leaves = Vec::with_capacity(layout.width());
    for (offset, ty) in layout.leaf_types().into_iter().enumerate() {
        leaves.push(g.push(
            Op::LoadSlot {
                offset: offset as u32,
                ty,
            },
            &[ptr],
        )?);
    }
    Ok(assemble(layout, &mut leaves.into_iter()))
}

// ---------------------------------------------------------------------------
// Free builder functions.

/// Declare a typed input on the current graph.
pub fn input(name: &str, layout: Layout) -> Result<RefValue, Error> {
    with_current(|g| {
        let leaves = g.declare_input(name, layout.clone())?;
        Ok(assemble(&layout, &mut leaves.into_iter()))
    })
    .map_err(Error::from)
}

/// Declare a scalar input on the current graph.
pub fn scalar_input(name: &str) -> Result<Ref, Error> {
    input(name, Layout::Scalar)?.single()
}

/// Declare the return value, inferring the layout structurally.
pub fn ret(value: impl IntoRefValue) -> Result<(), Error> {
    with_current(|g| {
        let value = value.into_ref_value(g)?;
        let layout = putative_layout(&value)?;
        let flat = flatten_ref_value(g, &value, &layout)?;
        g.declare_ret(flat, layout)
    })
    .map_err(Error::from)
}

/// Declare the return value against an explicit layout.
pub fn ret_with(value: impl IntoRefValue, layout: Layout) -> Result<(), Error> {
    with_current(|g| {
        let value = value.into_ref_value(g)?;
        let flat = flatten_ref_value(g, &value, &layout)?;
        g.declare_ret(flat, layout)
    })
    .map_err(Error::from)
}

/// A scalar constant node.
pub fn constant(x: f64) -> Result<Ref, Error> {
    with_current(|g| g.push_const(Const::Scalar(x))).map_err(Error::from)
}

/// A boolean constant node.
pub fn const_bool(b: bool) -> Result<Ref, Error> {
    with_current(|g| g.push_const(Const::Bool(b))).map_err(Error::from)
}

/// A symbol constant node, interning the text into the graph's table.
pub fn const_symbol(text: &str) -> Result<Ref, Error> {
    with_current(|g| text.into_ref(g)).map_err(Error::from)
}

/// A datetime constant node from microseconds since the Unix epoch.
pub fn const_datetime(micros: i64) -> Result<Ref, Error> {
    with_current(|g| g.push_const(Const::DateTime(micros))).map_err(Error::from)
}

/// A datetime constant node from a host datetime.
pub fn make_datetime(t: chrono::DateTime<chrono::Utc>) -> Result<Ref, Error> {
    const_datetime(t.timestamp_micros())
}

/// Convert a seconds-since-epoch scalar into a datetime.
pub fn fromtimestamp(t: impl IntoRef) -> Result<Ref, Error> {
    with_current(|g| {
        let t = t.into_ref(g)?;
        g.push(Op::FromTimestamp, &[t])
    })
    .map_err(Error::from)
}

/// Parse a symbol into a datetime with a `chrono` format string. Fails the
/// call at run time when the text does not match.
pub fn parse_datetime(text: impl IntoRef, format: &str) -> Result<Ref, Error> {
    with_current(|g| {
        let text = text.into_ref(g)?;
        let format = g.intern_symbol(format);
        g.push(Op::ParseDateTime { format }, &[text])
    })
    .map_err(Error::from)
}

/// Assert that `cond` holds at run time; a failed assertion aborts the call
/// and surfaces `message` to the caller. Constant-false assertions fail at
/// compile time instead.
pub fn assert_(cond: Ref, message: &str) -> Result<(), Error> {
    with_current(|g| g.push_assert(cond, message)).map_err(Error::from)
}

/// Fold `min` over references, mirroring the reduction order of a host
/// `min` over an iterable.
pub fn min(items: impl IntoIterator<Item = Ref>) -> Result<Ref, Error> {
    fold_refs(items, "min", |el, item| el.gt(item)?.choose(item, el))
}

/// Fold `max` over references.
pub fn max(items: impl IntoIterator<Item = Ref>) -> Result<Ref, Error> {
    fold_refs(items, "max", |el, item| el.gt(item)?.choose(el, item))
}

/// Fold `and` over boolean references.
pub fn all(items: impl IntoIterator<Item = Ref>) -> Result<Ref, Error> {
    fold_refs(items, "all", |el, item| el.try_and(item))
}

/// Fold `or` over boolean references.
pub fn any(items: impl IntoIterator<Item = Ref>) -> Result<Ref, Error> {
    fold_refs(items, "any", |el, item| el.try_or(item))
}

fn fold_refs(
    items: impl IntoIterator<Item = Ref>,
    op: &'static str,
    step: impl Fn(Ref, Ref) -> Result<Ref, Error>,
) -> Result<Ref, Error> {
    let mut acc: Option<Ref> = None;
    for item in items {
        acc = Some(match acc {
            None => item,
            Some(el) => step(el, item)?,
        });
    }
    acc.ok_or_else(|| BuildError::EmptyFold { op }.into())
}

/// An indexable list of same-shaped construction trees. `get` selects one
/// element by a scalar index at run time, with a bounds check.
#[derive(Debug)]
pub struct RefList {
    items: Vec<RefValue>,
    element: Layout,
}

/// Make a runtime-indexable list out of same-shaped trees.
pub fn index(items: &[RefValue]) -> Result<RefList, Error> {
    let first = items
        .first()
        .ok_or(BuildError::EmptyFold { op: "index" })?;
    let element = putative_layout(first)?;
    for item in &items[1..] {
        let other = putative_layout(item)?;
        if !element.same_shape(&other) {
            return Err(BuildError::HeterogeneousList {
                first: element.to_string(),
                other: other.to_string(),
            }
            .into());
        }
    }
    Ok(RefList {
        items: items.to_vec(),
        element,
    })
}

impl RefList {
    /// Select element `trunc(index)`; an out-of-range index aborts the call.
    pub fn get(&self, index: impl IntoRef) -> Result<RefValue, Error> {
        with_current(|g| {
            let index = index.into_ref(g)?;
            let flat: Vec<Vec<Ref>> = self
                .items
                .iter()
                .map(|item| flatten_ref_value(g, item, &self.element))
                .collect::<Result<_, _>>()?;
            let len = self.items.len() as u32;
            let mut leaves = Vec::with_capacity(self.element.width());
            for slot in 0..self.element.width() {
                let mut operands = Vec::with_capacity(self.items.len() + 1);
                operands.push(index);
                operands.extend(flat.iter().map(|row| row[slot]));
                leaves.push(g.push(Op::ListGet { len }, &operands)?);
            }
            Ok(assemble(&self.element, &mut leaves.into_iter()))
        })
        .map_err(Error::from)
    }
}

/// Invoke a closed graph as a node of the current graph. Arguments match
/// the callee's declared inputs positionally.
pub fn call_graph(callee: &Graph, args: &[RefValue]) -> Result<RefValue, Error> {
    with_current(|g| {
        let decls = callee.input_decls().to_vec();
        if decls.len() != args.len() {
            return Err(BuildError::BadSubgraph {
                caller: g.name().to_string(),
                callee: callee.name().to_string(),
                reason: format!("takes {} arguments, got {}", decls.len(), args.len()),
            });
        }
        let output_layout = callee
            .output_layout()
            .cloned()
            .ok_or_else(|| BuildError::BadSubgraph {
                caller: g.name().to_string(),
                callee: callee.name().to_string(),
                reason: "callee has no return declaration".into(),
            })?;
        let subgraph = g.embed(callee)?;
        let mut operands = Vec::new();
        for ((_, layout), arg) in decls.iter().zip(args) {
            operands.extend(flatten_ref_value(g, arg, layout)?);
        }
        let ptr = g.push(
            Op::CallGraph {
                subgraph,
                input_width: operands.len() as u32,
                output_width: output_layout.width() as u32,
            },
            &operands,
        )?;
        load_slots(g, ptr, &output_layout)
    })
    .map_err(Error::from)
}

/// Build a closed graph from named typed parameters and a body closure.
/// The return layout is inferred from the body's value.
pub fn graph<F>(name: &str, params: &[(&str, Layout)], body: F) -> Result<Graph, Error>
where
    F: FnOnce(&[RefValue]) -> Result<RefValue, Error>,
{
    build_graph(name, params, None, body)
}

/// Like [`graph`], with an explicit return layout.
pub fn graph_with_ret<F>(
    name: &str,
    params: &[(&str, Layout)],
    output: Layout,
    body: F,
) -> Result<Graph, Error>
where
    F: FnOnce(&[RefValue]) -> Result<RefValue, Error>,
{
    build_graph(name, params, Some(output), body)
}

/// Build and compile in one step: the Rust analog of the original
/// decorator.
pub fn func<F>(name: &str, params: &[(&str, Layout)], body: F) -> Result<crate::Function, Error>
where
    F: FnOnce(&[RefValue]) -> Result<RefValue, Error>,
{
    graph(name, params, body)?.compile()
}

/// Like [`func`], with an explicit return layout.
pub fn func_with_ret<F>(
    name: &str,
    params: &[(&str, Layout)],
    output: Layout,
    body: F,
) -> Result<crate::Function, Error>
where
    F: FnOnce(&[RefValue]) -> Result<RefValue, Error>,
{
    graph_with_ret(name, params, output, body)?.compile()
}

fn build_graph<F>(
    name: &str,
    params: &[(&str, Layout)],
    output: Option<Layout>,
    body: F,
) -> Result<Graph, Error>
where
    F: FnOnce(&[RefValue]) -> Result<RefValue, Error>,
{
    let guard = Graph::begin(name);
    let mut inputs = Vec::with_capacity(params.len());
    for (param, layout) in params {
        inputs.push(input(param, layout.clone())?);
    }
    let out = body(&inputs)?;
    match output {
        Some(layout) => ret_with(out, layout)?,
        None => ret(out)?,
    }
    guard.finish()
}

// ---------------------------------------------------------------------------
// The canonical named-method surface on references.

impl Ref {
    fn unary(self, op: ScalarUnary) -> Result<Ref, Error> {
        with_current(|g| g.push(Op::ScalarUnary(op), &[self])).map_err(Error::from)
    }

    fn binary(self, op: ScalarBinary, other: impl IntoRef) -> Result<Ref, Error> {
        with_current(|g| {
            let other = other.into_ref(g)?;
            g.push(Op::ScalarBinary(op), &[self, other])
        })
        .map_err(Error::from)
    }

    fn compare(self, op: Comparison, other: impl IntoRef) -> Result<Ref, Error> {
        with_current(|g| {
            let other = other.into_ref(g)?;
            g.push(Op::Compare(op), &[self, other])
        })
        .map_err(Error::from)
    }

    fn test(self, op: ScalarTest) -> Result<Ref, Error> {
        with_current(|g| g.push(Op::ScalarTest(op), &[self])).map_err(Error::from)
    }

    fn bool_binary(self, op: BoolBinary, other: impl IntoRef) -> Result<Ref, Error> {
        with_current(|g| {
            let other = other.into_ref(g)?;
            g.push(Op::BoolBinary(op), &[self, other])
        })
        .map_err(Error::from)
    }

    fn extract(self, field: DateTimeField) -> Result<Ref, Error> {
        with_current(|g| g.push(Op::Extract(field), &[self])).map_err(Error::from)
    }

    pub fn try_add(self, other: impl IntoRef) -> Result<Ref, Error> {
        self.binary(ScalarBinary::Add, other)
    }

    pub fn try_sub(self, other: impl IntoRef) -> Result<Ref, Error> {
        self.binary(ScalarBinary::Sub, other)
    }

    pub fn try_mul(self, other: impl IntoRef) -> Result<Ref, Error> {
        self.binary(ScalarBinary::Mul, other)
    }

    pub fn try_div(self, other: impl IntoRef) -> Result<Ref, Error> {
        self.binary(ScalarBinary::Div, other)
    }

    pub fn try_rem(self, other: impl IntoRef) -> Result<Ref, Error> {
        self.binary(ScalarBinary::Rem, other)
    }

    pub fn try_neg(self) -> Result<Ref, Error> {
        self.unary(ScalarUnary::Neg)
    }

    pub fn try_and(self, other: impl IntoRef) -> Result<Ref, Error> {
        self.bool_binary(BoolBinary::And, other)
    }

    pub fn try_or(self, other: impl IntoRef) -> Result<Ref, Error> {
        self.bool_binary(BoolBinary::Or, other)
    }

    pub fn try_xor(self, other: impl IntoRef) -> Result<Ref, Error> {
        self.bool_binary(BoolBinary::Xor, other)
    }

    pub fn try_not(self) -> Result<Ref, Error> {
        with_current(|g| g.push(Op::Not, &[self])).map_err(Error::from)
    }

    /// Equality. Works over scalars and over symbols.
    pub fn eq(self, other: impl IntoRef) -> Result<Ref, Error> {
        with_current(|g| {
            let other = other.into_ref(g)?;
            match self.ty() {
                Type::Symbol => g.push(Op::SymbolEq, &[self, other]),
                _ => g.push(Op::Compare(Comparison::Eq), &[self, other]),
            }
        })
        .map_err(Error::from)
    }

    /// Inequality. Works over scalars and over symbols.
    pub fn ne(self, other: impl IntoRef) -> Result<Ref, Error> {
        with_current(|g| {
            let other = other.into_ref(g)?;
            match self.ty() {
                Type::Symbol => g.push(Op::SymbolNe, &[self, other]),
                _ => g.push(Op::Compare(Comparison::Ne), &[self, other]),
            }
        })
        .map_err(Error::from)
    }

    pub fn lt(self, other: impl IntoRef) -> Result<Ref, Error> {
        self.compare(Comparison::Lt, other)
    }

    pub fn le(self, other: impl IntoRef) -> Result<Ref, Error> {
        self.compare(Comparison::Le, other)
    }

    pub fn gt(self, other: impl IntoRef) -> Result<Ref, Error> {
        self.compare(Comparison::Gt, other)
    }

    pub fn ge(self, other: impl IntoRef) -> Result<Ref, Error> {
        self.compare(Comparison::Ge, other)
    }

    /// The graph-level ternary: this reference (a boolean) selects between
    /// `then` and `else_`, which must share a type.
    pub fn choose(self, then: impl IntoRef, else_: impl IntoRef) -> Result<Ref, Error> {
        with_current(|g| {
            let then = then.into_ref(g)?;
            let else_ = else_.into_ref(g)?;
            g.push(Op::Choose, &[self, then, else_])
        })
        .map_err(Error::from)
    }

    pub fn abs(self) -> Result<Ref, Error> {
        self.unary(ScalarUnary::Abs)
    }

    pub fn sqrt(self) -> Result<Ref, Error> {
        self.unary(ScalarUnary::Sqrt)
    }

    pub fn exp(self) -> Result<Ref, Error> {
        self.unary(ScalarUnary::Exp)
    }

    /// Natural logarithm.
    pub fn ln(self) -> Result<Ref, Error> {
        self.unary(ScalarUnary::Ln)
    }

    /// Base-10 logarithm.
    pub fn log(self) -> Result<Ref, Error> {
        self.unary(ScalarUnary::Log)
    }

    pub fn sin(self) -> Result<Ref, Error> {
        self.unary(ScalarUnary::Sin)
    }

    pub fn cos(self) -> Result<Ref, Error> {
        self.unary(ScalarUnary::Cos)
    }

    pub fn tan(self) -> Result<Ref, Error> {
        self.unary(ScalarUnary::Tan)
    }

    pub fn asin(self) -> Result<Ref, Error> {
        self.unary(ScalarUnary::Asin)
    }

    pub fn acos(self) -> Result<Ref, Error> {
        self.unary(ScalarUnary::Acos)
    }

    pub fn atan(self) -> Result<Ref, Error> {
        self.unary(ScalarUnary::Atan)
    }

    pub fn atan2(self, other: impl IntoRef) -> Result<Ref, Error> {
        self.binary(ScalarBinary::Atan2, other)
    }

    pub fn floor(self) -> Result<Ref, Error> {
        self.unary(ScalarUnary::Floor)
    }

    pub fn ceil(self) -> Result<Ref, Error> {
        self.unary(ScalarUnary::Ceil)
    }

    /// Round half away from zero.
    pub fn round(self) -> Result<Ref, Error> {
        self.unary(ScalarUnary::Round)
    }

    pub fn pow(self, other: impl IntoRef) -> Result<Ref, Error> {
        self.binary(ScalarBinary::Pow, other)
    }

    /// IEEE-754 minNum: a one-sided NaN yields the other operand.
    pub fn min(self, other: impl IntoRef) -> Result<Ref, Error> {
        self.binary(ScalarBinary::Min, other)
    }

    /// IEEE-754 maxNum: a one-sided NaN yields the other operand.
    pub fn max(self, other: impl IntoRef) -> Result<Ref, Error> {
        self.binary(ScalarBinary::Max, other)
    }

    pub fn is_nan(self) -> Result<Ref, Error> {
        self.test(ScalarTest::IsNan)
    }

    pub fn is_finite(self) -> Result<Ref, Error> {
        self.test(ScalarTest::IsFinite)
    }

    pub fn is_infinite(self) -> Result<Ref, Error> {
        self.test(ScalarTest::IsInfinite)
    }

    /// Datetime to seconds-since-epoch scalar.
    pub fn timestamp(self) -> Result<Ref, Error> {
        with_current(|g| g.push(Op::Timestamp, &[self])).map_err(Error::from)
    }

    pub fn year(self) -> Result<Ref, Error> {
        self.extract(DateTimeField::Year)
    }

    pub fn month(self) -> Result<Ref, Error> {
        self.extract(DateTimeField::Month)
    }

    pub fn day(self) -> Result<Ref, Error> {
        self.extract(DateTimeField::Day)
    }

    pub fn hour(self) -> Result<Ref, Error> {
        self.extract(DateTimeField::Hour)
    }

    pub fn minute(self) -> Result<Ref, Error> {
        self.extract(DateTimeField::Minute)
    }

    pub fn second(self) -> Result<Ref, Error> {
        self.extract(DateTimeField::Second)
    }

    pub fn microsecond(self) -> Result<Ref, Error> {
        self.extract(DateTimeField::Microsecond)
    }

    /// Render a datetime with a `chrono` format string, producing a symbol.
    pub fn format(self, format: &str) -> Result<Ref, Error> {
        with_current(|g| {
            let format = g.intern_symbol(format);
            g.push(Op::FormatDateTime { format }, &[self])
        })
        .map_err(Error::from)
    }
}

// ---------------------------------------------------------------------------
// Operator sugar. Panics on builder misuse, like cranelift's instruction
// builders; the `try_*` methods are the fallible canonical form.

macro_rules! ref_binop {
    ($trait:ident, $method:ident, $try_method:ident) => {
        impl std::ops::$trait<Ref> for Ref {
            type Output = Ref;
            fn $method(self, rhs: Ref) -> Ref {
                self.$try_method(rhs).unwrap_or_else(|e| panic!("{e}"))
            }
        }

        impl std::ops::$trait<f64> for Ref {
            type Output = Ref;
            fn $method(self, rhs: f64) -> Ref {
                self.$try_method(rhs).unwrap_or_else(|e| panic!("{e}"))
            }
        }

        impl std::ops::$trait<Ref> for f64 {
            type Output = Ref;
            fn $method(self, rhs: Ref) -> Ref {
                with_current(|g| {
                    let lhs = self.into_ref(g)?;
                    Ok(lhs)
                })
                .map_err(Error::from)
                .and_then(|lhs| lhs.$try_method(rhs))
                .unwrap_or_else(|e| panic!("{e}"))
            }
        }
    };
}

ref_binop!(Add, add, try_add);
ref_binop!(Sub, sub, try_sub);
ref_binop!(Mul, mul, try_mul);
ref_binop!(Div, div, try_div);
ref_binop!(Rem, rem, try_rem);

macro_rules! ref_boolop {
    ($trait:ident, $method:ident, $try_method:ident) => {
        impl std::ops::$trait<Ref> for Ref {
            type Output = Ref;
            fn $method(self, rhs: Ref) -> Ref {
                self.$try_method(rhs).unwrap_or_else(|e| panic!("{e}"))
            }
        }
    };
}

ref_boolop!(BitAnd, bitand, try_and);
ref_boolop!(BitOr, bitor, try_or);
ref_boolop!(BitXor, bitxor, try_xor);

impl std::ops::Neg for Ref {
    type Output = Ref;
    fn neg(self) -> Ref {
        self.try_neg().unwrap_or_else(|e| panic!("{e}"))
    }
}

impl std::ops::Not for Ref {
    type Output = Ref;
    fn not(self) -> Ref {
        self.try_not().unwrap_or_else(|e| panic!("{e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_current_graph_is_an_error() {
        assert!(matches!(
            constant(1.0),
            Err(Error::Build(BuildError::NoCurrentGraph))
        ));
    }

    #[test]
    fn guard_drop_discards_the_graph() {
        {
            let _guard = Graph::begin("discarded");
            constant(1.0).unwrap();
        }
        assert!(matches!(
            constant(1.0),
            Err(Error::Build(BuildError::NoCurrentGraph))
        ));
    }

    #[test]
    fn finish_requires_a_return() {
        let guard = Graph::begin("no_ret");
        let _ = constant(1.0).unwrap();
        let err = guard.finish().unwrap_err();
        assert!(err.to_string().contains("no return declaration"));
        // The failed graph is gone from the stack.
        assert!(constant(1.0).is_err());
    }

    #[test]
    fn putative_layouts_infer_structures() {
        let guard = Graph::begin("shapes");
        let a = scalar_input("a").unwrap();
        let b = input("b", Layout::Bool).unwrap().single().unwrap();
        let layout = putative_layout(&RefValue::struct_of([
            ("x", RefValue::from(a)),
            ("y", RefValue::Tuple(vec![b.into(), a.into()])),
        ]))
        .unwrap();
        assert_eq!(
            layout,
            Layout::struct_of([
                ("x", Layout::Scalar),
                ("y", Layout::tuple_of([Layout::Bool, Layout::Scalar])),
            ])
        );
        let err = putative_layout(&RefValue::List(vec![a.into(), b.into()])).unwrap_err();
        assert!(matches!(err, BuildError::HeterogeneousList { .. }));
        drop(guard);
    }

    #[test]
    fn operators_build_nodes() {
        let guard = Graph::begin("ops");
        let a = scalar_input("a").unwrap();
        let b = scalar_input("b").unwrap();
        let r = 2.0 * a + b + 1.0;
        ret(r).unwrap();
        let g = guard.finish().unwrap();
        g.validate().unwrap();
        assert_eq!(g.output_layout(), Some(&Layout::Scalar));
    }

    #[test]
    #[should_panic(expected = "type mismatch")]
    fn operator_sugar_panics_on_type_errors() {
        let _guard = Graph::begin("bad");
        let a = scalar_input("a").unwrap();
        let b = input("b", Layout::Bool).unwrap().single().unwrap();
        let _ = a + b;
    }

    #[test]
    fn symbols_compare_and_choose() {
        let guard = Graph::begin("logic_with_symbols");
        let color = input("favorite_color", Layout::Symbol)
            .unwrap()
            .single()
            .unwrap();
        let out = color
            .eq("blue")
            .unwrap()
            .choose("off you go", "aaaaaah!")
            .unwrap();
        ret(out).unwrap();
        let g = guard.finish().unwrap();
        assert_eq!(g.output_layout(), Some(&Layout::Symbol));
    }
}
