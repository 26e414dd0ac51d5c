#![allow(dead_code)]

use jyafn::{CompilationError, Error, Function, Graph, Value};

/// Compile, skipping the test when the host has no native back-end (the
/// same escape hatch cranelift's own JIT tests use).
pub fn compile(graph: &Graph) -> Option<Function> {
    let _ = env_logger::builder().is_test(true).try_init();
    match graph.compile() {
        Ok(function) => Some(function),
        Err(Error::Compilation(CompilationError::UnsupportedPlatform(message))) => {
            eprintln!("skipping: no native back-end for this host ({message})");
            None
        }
        Err(e) => panic!("compilation failed: {e}"),
    }
}

pub fn scalar(value: &Value) -> f64 {
    value.as_f64().unwrap_or_else(|| panic!("expected a scalar, got {value:?}"))
}
