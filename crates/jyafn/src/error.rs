//! The closed error set of the crate.
//!
//! Each stage of the pipeline has its own error enum; `Error` is the umbrella
//! the public API surfaces. Build-time errors abort construction of the
//! current graph and leave the thread-local builder stack otherwise untouched.
//! Invocation errors are returned to the caller as plain values.

use crate::types::Type;

/// Any error the crate can produce.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Graph construction failed.
    #[error(transparent)]
    Build(#[from] BuildError),
    /// An artifact could not be encoded or decoded.
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    /// The back-end could not lower the graph to native code.
    #[error(transparent)]
    Compilation(#[from] CompilationError),
    /// Artifact loading could not resolve code or extension references.
    #[error(transparent)]
    Link(#[from] LinkError),
    /// A call into a compiled function failed.
    #[error(transparent)]
    Invocation(#[from] InvocationError),
    /// A resource rejected a payload or a method call. Propagates unchanged.
    #[error(transparent)]
    Resource(#[from] ResourceError),
}

/// Errors raised while a graph is under construction.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no current graph")]
    NoCurrentGraph,
    #[error("type mismatch in `{op}`: operand {position} is {got}, expected {expected}")]
    TypeMismatch {
        op: &'static str,
        position: usize,
        expected: Type,
        got: Type,
    },
    #[error("`{op}` takes {expected} operands, got {got}")]
    ArityMismatch {
        op: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("unknown symbol `{0}`")]
    UnknownSymbol(String),
    #[error("reference created by graph `{ref_graph}` used in graph `{current_graph}`")]
    CrossGraphReference {
        ref_graph: String,
        current_graph: String,
    },
    #[error("node {node} references operand {operand}, which is not an earlier node")]
    NonTopological { node: u32, operand: u32 },
    #[error("graph `{0}` has no return declaration")]
    MissingReturn(String),
    #[error("input `{0}` is already declared")]
    DuplicateInput(String),
    #[error("graph `{0}` already has a return declaration")]
    ReturnAlreadyDeclared(String),
    #[error("graph `{0}` is closed and accepts no new nodes")]
    GraphClosed(String),
    #[error("at {path}: expected {expected}, got {got}")]
    LayoutMismatch {
        path: String,
        expected: String,
        got: String,
    },
    #[error("cannot infer a layout: {0}")]
    PutativeLayout(String),
    #[error("list elements disagree on layout: `{first}` vs `{other}`")]
    HeterogeneousList { first: String, other: String },
    #[error("mapping `{name}` entry {index}: {message}")]
    BadMappingEntry {
        name: String,
        index: usize,
        message: String,
    },
    #[error("resource `{resource}` has no method `{method}`")]
    UnknownResourceMethod { resource: String, method: String },
    #[error("invalid resource type descriptor: {0}")]
    BadResourceType(String),
    #[error("graph `{caller}` cannot embed `{callee}`: {reason}")]
    BadSubgraph {
        caller: String,
        callee: String,
        reason: String,
    },
    #[error("`{op}` expects at least one operand")]
    EmptyFold { op: &'static str },
}

/// Errors raised while reading or writing the artifact container.
#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("bad magic: not a jyafn artifact")]
    BadMagic,
    #[error("unsupported artifact format version {0}")]
    UnsupportedVersion(u32),
    #[error("unknown section tag {0:#x}")]
    UnknownSection(u32),
    #[error("missing required section {0}")]
    MissingSection(&'static str),
    #[error("incompatible artifact: {0}")]
    IncompatibleArtifact(String),
    #[error("truncated artifact")]
    Truncated,
    #[error("section encoding: {0}")]
    Encoding(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while lowering a graph to native code.
#[derive(Debug, thiserror::Error)]
pub enum CompilationError {
    #[error("no native back-end for this platform: {0}")]
    UnsupportedPlatform(String),
    #[error("back-end failure: {0}")]
    Backend(String),
    #[error("assertion `{0}` is false at compile time")]
    ConstantAssertionFailure(String),
}

/// Errors raised while binding a loaded artifact to the running process.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("extension `{0}` unavailable")]
    ExtensionUnavailable(String),
    #[error("resource `{resource}` has no method `{method}` in this process")]
    MissingMethod { resource: String, method: String },
    #[error("cannot resolve symbol `{0}`")]
    SymbolResolution(String),
    #[error("executable memory: {0}")]
    Memory(String),
}

/// Errors raised by a call into a compiled function.
#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error("encoding input at {path}: {message}")]
    InputEncoding { path: String, message: String },
    #[error("decoding output at {path}: {message}")]
    OutputDecoding { path: String, message: String },
    #[error("{0}")]
    AssertionFailed(String),
    #[error("index out of bounds")]
    IndexOutOfBounds,
    #[error("{0}")]
    Fault(String),
    #[error("call failed with unknown status {0:#x}")]
    UnknownStatus(u64),
    #[error("input is not valid JSON: {0}")]
    BadJson(String),
}

/// An error produced by a resource, at load or at call time.
#[derive(Debug, thiserror::Error)]
#[error("resource `{resource}`: {message}")]
pub struct ResourceError {
    pub resource: String,
    pub message: String,
}

impl ResourceError {
    pub fn new(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            message: message.into(),
        }
    }
}
