//! jyafn: typed computation graphs compiled to native code.
//!
//! A host program describes a pure numerical computation as a strongly
//! typed DAG over scalars, booleans, symbols and datetimes, built
//! imperatively against a thread-local current graph:
//!
//! ```no_run
//! use jyafn::Graph;
//!
//! let guard = Graph::begin("a_fun");
//! let a = jyafn::scalar_input("a")?;
//! let b = jyafn::scalar_input("b")?;
//! jyafn::ret(2.0 * a + b + 1.0)?;
//! let graph = guard.finish()?;
//!
//! let fun = graph.compile()?;
//! assert_eq!(
//!     fun.eval(r#"{"a": 5, "b": 6}"#)?,
//!     "17.0",
//! );
//!
//! // The compiled function round-trips as a self-describing artifact.
//! let bytes = fun.dump()?;
//! let again = jyafn::Function::load(&bytes)?;
//! # let _ = again;
//! # Ok::<(), jyafn::Error>(())
//! ```
//!
//! The compiler folds constants, lowers the graph to Cranelift IR and
//! produces a relocatable native code object. The [`Function`] artifact
//! packs the code with its input/output [`Layout`]s, symbol table, mapping
//! and resource constants, and embedded sub-graphs; it loads on any machine
//! of the same target and is callable concurrently from any number of
//! threads.

mod artifact;
mod builder;
mod compile;
mod dataset;
mod error;
mod extension;
mod function;
mod graph;
mod layout;
mod mapping;
mod op;
mod resource;
mod symbols;
mod types;
mod value;

pub use builder::{
    DAY, GraphGuard, HOUR, IntoRef, IntoRefValue, MINUTE, RefList, RefValue, SECOND, all, any,
    assert_, call_graph, const_bool, const_datetime, const_symbol, constant, current_graph,
    fromtimestamp, func, func_with_ret, graph, graph_with_ret, index, input, make_datetime, max,
    min, parse_datetime, putative_layout, ret, ret_with, scalar_input,
};
pub use dataset::Dataset;
pub use error::{
    BuildError, CompilationError, Error, InvocationError, LinkError, ResourceError,
    SerializationError,
};
pub use extension::{EXTENSION_ABI_VERSION, search_path as extension_search_path};
pub use function::Function;
pub use graph::{Graph, NodeId, Ref};
pub use layout::{DEFAULT_DATETIME_FORMAT, Layout};
pub use mapping::Mapping;
pub use resource::{MethodDecl, Resource, ResourceImpl, ResourceType};
pub use symbols::SymbolTable;
pub use types::Type;
pub use value::{DateTimeField, Value};
