//! The runtime invoker.
//!
//! A [`Function`] is a loaded artifact: immutable constant pools, resolved
//! resources, recursively loaded sub-functions, and a patched, executable
//! code object. It is `Send + Sync` and callable from any number of threads
//! concurrently; all per-call state lives in the caller's buffers and a
//! per-call [`CallContext`].
//!
//! The native entry has signature
//! `fn(env: *const FunctionEnv, input: *const u64, output: *mut u64,
//! ctx: *mut CallContext)`; the call context's status word sits at offset 0
//! and is the only field generated code touches.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::artifact::{ArtifactData, ENTRY_ABI_VERSION};
use crate::compile::linker::{self, CodeMemory};
use crate::error::{Error, InvocationError, LinkError, ResourceError, SerializationError};
use crate::layout::Layout;
use crate::resource::{self, ResourceImpl, ResourceSpec};
use crate::symbols::{DYNAMIC_SYMBOL_BIT, SymbolTable};
use crate::value::{Value, decode_value, encode_value};

/// Status word values outside the assertion-code range.
pub(crate) const STATUS_FAULT: u64 = u64::MAX;
pub(crate) const STATUS_INDEX_OOB: u64 = u64::MAX - 1;

/// A fault recorded by a helper before it aborts the call.
pub(crate) enum Fault {
    Invocation(String),
    Resource { resource: String, message: String },
}

/// Per-call scratch and status area. The status word must stay the first
/// field: generated code stores to it through the raw context pointer.
#[repr(C)]
pub(crate) struct CallContext {
    pub(crate) status: u64,
    pub(crate) fault: Option<Fault>,
    pub(crate) dynamic_symbols: Vec<String>,
}

impl CallContext {
    pub(crate) fn new() -> Self {
        CallContext {
            status: 0,
            fault: None,
            dynamic_symbols: Vec::new(),
        }
    }

    /// Resolve a symbol id against the static table or this call's dynamic
    /// symbols.
    pub(crate) fn symbol_text<'a>(&'a self, symbols: &'a SymbolTable, id: u64) -> Option<&'a str> {
        if id & DYNAMIC_SYMBOL_BIT != 0 {
            self.dynamic_symbols
                .get((id & !DYNAMIC_SYMBOL_BIT) as usize)
                .map(String::as_str)
        } else {
            symbols.text(id)
        }
    }

    /// Intern a string produced at call time, returning its dynamic id.
    pub(crate) fn push_dynamic(&mut self, text: String) -> u64 {
        if let Some(existing) = self.dynamic_symbols.iter().position(|s| *s == text) {
            return DYNAMIC_SYMBOL_BIT | existing as u64;
        }
        self.dynamic_symbols.push(text);
        DYNAMIC_SYMBOL_BIT | (self.dynamic_symbols.len() - 1) as u64
    }
}

pub(crate) struct LoadedMapping {
    pub name: String,
    pub key_width: usize,
    pub value_width: usize,
    pub table: HashMap<Box<[u64]>, Box<[u64]>>,
}

pub(crate) struct LoadedMethod {
    pub impl_index: usize,
    pub input_width: usize,
    pub output_width: usize,
}

pub(crate) struct LoadedResource {
    pub name: String,
    pub implementation: Arc<dyn ResourceImpl>,
    pub methods: Vec<LoadedMethod>,
}

/// Everything the generated code and its helpers read at call time.
/// Immutable once built.
pub(crate) struct FunctionEnv {
    pub symbols: SymbolTable,
    pub mappings: Vec<LoadedMapping>,
    pub resources: Vec<LoadedResource>,
    pub subfunctions: Vec<Function>,
    pub asserts: Vec<String>,
}

pub(crate) type Entry =
    unsafe extern "C" fn(*const FunctionEnv, *const u64, *mut u64, *mut CallContext);

struct FunctionInner {
    artifact: ArtifactData,
    env: FunctionEnv,
    entry: Entry,
    input_width: usize,
    output_width: usize,
    // Owns the executable pages `entry` points into; freed with the
    // function.
    _code: CodeMemory,
}

/// A compiled, loaded, callable function artifact.
#[derive(Clone)]
pub struct Function {
    inner: Arc<FunctionInner>,
}

fn bind_resource(spec: &ResourceSpec) -> Result<LoadedResource, Error> {
    let implementation = resource::instantiate(&spec.type_json, &spec.name, &spec.payload)?;
    let decls = implementation.methods();
    let mut methods = Vec::with_capacity(spec.methods.len());
    for used in &spec.methods {
        let impl_index = decls
            .iter()
            .position(|d| d.name == used.name)
            .ok_or_else(|| LinkError::MissingMethod {
                resource: spec.name.clone(),
                method: used.name.clone(),
            })?;
        let decl = &decls[impl_index];
        if !decl.input_layout.same_shape(&used.input_layout)
            || !decl.output_layout.same_shape(&used.output_layout)
        {
            return Err(LinkError::SymbolResolution(format!(
                "resource `{}` method `{}` no longer matches the artifact's signature",
                spec.name, used.name
            ))
            .into());
        }
        methods.push(LoadedMethod {
            impl_index,
            input_width: used.input_layout.width(),
            output_width: used.output_layout.width(),
        });
    }
    Ok(LoadedResource {
        name: spec.name.clone(),
        implementation,
        methods,
    })
}

/// Bind an artifact to the running process: check compatibility, resolve
/// constants and resources, load sub-functions, map and patch the code.
pub(crate) fn instantiate(artifact: ArtifactData) -> Result<Function, Error> {
    let host = target_lexicon::Triple::host().to_string();
    if artifact.code.abi_version != ENTRY_ABI_VERSION {
        return Err(SerializationError::IncompatibleArtifact(format!(
            "entry ABI v{}, loader supports v{ENTRY_ABI_VERSION}",
            artifact.code.abi_version
        ))
        .into());
    }
    if artifact.code.target != host {
        return Err(SerializationError::IncompatibleArtifact(format!(
            "built for {}, host is {host}",
            artifact.code.target
        ))
        .into());
    }

    let subfunctions = artifact
        .subgraphs
        .iter()
        .cloned()
        .map(instantiate)
        .collect::<Result<Vec<_>, _>>()?;
    let resources = artifact
        .resources
        .iter()
        .map(bind_resource)
        .collect::<Result<Vec<_>, _>>()?;
    let mappings = artifact
        .mappings
        .iter()
        .map(|spec| LoadedMapping {
            name: spec.name.clone(),
            key_width: spec.key_layout.width(),
            value_width: spec.value_layout.width(),
            table: spec.build_table(),
        })
        .collect();

    let code = linker::link(&artifact.code.code, &artifact.relocs)?;
    log::debug!(
        "loaded `{}`: {} bytes of code, {} relocations",
        artifact.name,
        artifact.code.code.len(),
        artifact.relocs.len()
    );
    // SAFETY: the code object was produced for this target and ABI (checked
    // above) and every relocation was just patched.
    let entry = unsafe { std::mem::transmute::<*const u8, Entry>(code.ptr()) };

    let env = FunctionEnv {
        symbols: artifact.symbols.clone(),
        mappings,
        resources,
        subfunctions,
        asserts: artifact.asserts.clone(),
    };
    Ok(Function {
        inner: Arc::new(FunctionInner {
            input_width: artifact.input_layout.width(),
            output_width: artifact.output_layout.width(),
            env,
            entry,
            _code: code,
            artifact,
        }),
    })
}

impl Function {
    pub fn name(&self) -> &str {
        &self.inner.artifact.name
    }

    pub fn metadata(&self) -> &IndexMap<String, String> {
        &self.inner.artifact.metadata
    }

    pub fn input_layout(&self) -> &Layout {
        &self.inner.artifact.input_layout
    }

    pub fn output_layout(&self) -> &Layout {
        &self.inner.artifact.output_layout
    }

    /// Size of the embedded code and constants, in bytes.
    pub fn size_estimate(&self) -> usize {
        self.inner.artifact.code.code.len()
            + self
                .inner
                .artifact
                .mappings
                .iter()
                .map(|m| m.size_estimate())
                .sum::<usize>()
            + self
                .inner
                .artifact
                .subgraphs
                .iter()
                .map(|a| a.code.code.len())
                .sum::<usize>()
    }

    pub(crate) fn raw_call(&self, input: &[u64], output: &mut [u64], ctx: &mut CallContext) {
        debug_assert_eq!(input.len(), self.inner.input_width);
        debug_assert_eq!(output.len(), self.inner.output_width);
        // SAFETY: buffers are sized to the input/output layouts and the
        // context outlives the call.
        unsafe {
            (self.inner.entry)(&self.inner.env, input.as_ptr(), output.as_mut_ptr(), ctx)
        };
    }

    pub(crate) fn env(&self) -> &FunctionEnv {
        &self.inner.env
    }

    fn translate_status(&self, ctx: &mut CallContext) -> Result<(), Error> {
        match ctx.status {
            0 => Ok(()),
            STATUS_FAULT => match ctx.fault.take() {
                Some(Fault::Invocation(message)) => {
                    Err(InvocationError::Fault(message).into())
                }
                Some(Fault::Resource { resource, message }) => {
                    Err(ResourceError::new(resource, message).into())
                }
                None => Err(InvocationError::UnknownStatus(STATUS_FAULT).into()),
            },
            STATUS_INDEX_OOB => Err(InvocationError::IndexOutOfBounds.into()),
            code if (code as usize) <= self.inner.env.asserts.len() => {
                Err(InvocationError::AssertionFailed(
                    self.inner.env.asserts[code as usize - 1].clone(),
                )
                .into())
            }
            code => Err(InvocationError::UnknownStatus(code).into()),
        }
    }

    /// Call with a host value matching the input layout (a struct keyed by
    /// the declared argument names).
    pub fn call(&self, input: &Value) -> Result<Value, Error> {
        let inner = &*self.inner;
        let mut ctx = CallContext::new();
        let mut words = Vec::with_capacity(inner.input_width);
        let mut path = String::new();
        encode_value(
            input,
            &inner.artifact.input_layout,
            &mut words,
            &inner.env.symbols,
            &mut ctx.dynamic_symbols,
            &mut path,
        )?;
        let mut output = vec![0u64; inner.output_width];
        self.raw_call(&words, &mut output, &mut ctx);
        self.translate_status(&mut ctx)?;
        let mut slice = output.as_slice();
        let mut path = String::new();
        Ok(decode_value(
            &mut slice,
            &inner.artifact.output_layout,
            &inner.env.symbols,
            &ctx.dynamic_symbols,
            &mut path,
        )?)
    }

    /// Call with positional arguments matched against the declared inputs.
    pub fn call_args(&self, args: &[Value]) -> Result<Value, Error> {
        let Layout::Struct { fields } = &self.inner.artifact.input_layout else {
            return Err(InvocationError::InputEncoding {
                path: ".".into(),
                message: "function input is not a struct of arguments".into(),
            }
            .into());
        };
        if fields.len() != args.len() {
            return Err(InvocationError::InputEncoding {
                path: ".".into(),
                message: format!("expected {} arguments, got {}", fields.len(), args.len()),
            }
            .into());
        }
        let input = Value::Struct(
            fields
                .iter()
                .zip(args)
                .map(|((name, _), value)| (name.clone(), value.clone()))
                .collect(),
        );
        self.call(&input)
    }

    /// Call with a JSON argument string, returning the JSON result.
    pub fn eval(&self, json: &str) -> Result<String, Error> {
        let parsed: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| InvocationError::BadJson(e.to_string()))?;
        let input = Value::from_json(&parsed, &self.inner.artifact.input_layout)?;
        let output = self.call(&input)?;
        let rendered = output.to_json(&self.inner.artifact.output_layout)?;
        Ok(rendered.to_string())
    }

    /// Serialize to the `.jyafn` container format.
    pub fn dump(&self) -> Result<Vec<u8>, Error> {
        Ok(self.inner.artifact.encode()?)
    }

    /// Load from the `.jyafn` container format.
    pub fn load(bytes: &[u8]) -> Result<Function, Error> {
        instantiate(ArtifactData::decode(bytes)?)
    }

    /// Write the artifact to a file.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        std::fs::write(path, self.dump()?).map_err(SerializationError::Io)?;
        Ok(())
    }

    /// Read an artifact file.
    pub fn read(path: impl AsRef<Path>) -> Result<Function, Error> {
        let bytes = std::fs::read(path).map_err(SerializationError::Io)?;
        Function::load(&bytes)
    }

    /// The JSON debug description of the artifact. Not a loader input.
    pub fn to_json(&self) -> String {
        self.inner.artifact.describe().to_string()
    }
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name())
            .field("input_layout", self.input_layout())
            .field("output_layout", self.output_layout())
            .finish_non_exhaustive()
    }
}
