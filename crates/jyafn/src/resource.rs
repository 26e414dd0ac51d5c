//! Resource constants: opaque typed objects with named methods.
//!
//! A resource is identified by a JSON type descriptor — either an in-process
//! built-in (`{"type":"SquareMatrix"}`) or an externally loaded extension
//! (`{"type":"External","extension":"...","resource":"..."}`) — plus an
//! opaque payload blob. Loading validates the payload eagerly; invoking a
//! method appends a `ResourceCall` node. Only the method signatures matter
//! to the compiler.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_derive::{Deserialize, Serialize};

use crate::builder::{self, IntoRefValue, RefValue};
use crate::error::{BuildError, Error, ResourceError};
use crate::extension;
use crate::layout::Layout;
use crate::op::Op;

mod dummy;
mod square_matrix;

pub(crate) use dummy::Dummy;
pub(crate) use square_matrix::SquareMatrix;

fn fresh_handle_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// A method exposed by a resource.
#[derive(Clone, Debug)]
pub struct MethodDecl {
    pub name: String,
    pub input_layout: Layout,
    pub output_layout: Layout,
    /// Non-reentrant methods are serialized through a per-resource lock at
    /// call time.
    pub reentrant: bool,
}

/// The in-process behavior behind a resource. Implementations must be safe
/// to call from any thread; non-reentrant methods declare themselves so and
/// the invoker serializes them.
pub trait ResourceImpl: Send + Sync + 'static {
    /// The methods this resource exposes, in a stable order.
    fn methods(&self) -> Vec<MethodDecl>;

    /// Invoke method `method` (an index into [`ResourceImpl::methods`])
    /// over flat input words, writing flat output words.
    fn call(&self, method: usize, input: &[u64], output: &mut [u64]) -> Result<(), ResourceError>;
}

/// The serialized form of a resource constant: its type, payload, and the
/// methods the graph actually calls.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct ResourceSpec {
    pub name: String,
    pub type_json: String,
    pub payload: Vec<u8>,
    pub methods: Vec<MethodUse>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct MethodUse {
    pub name: String,
    pub input_layout: Layout,
    pub output_layout: Layout,
}

impl ResourceSpec {
    fn method_index(&mut self, decl: &MethodDecl) -> u32 {
        if let Some(index) = self.methods.iter().position(|m| m.name == decl.name) {
            return index as u32;
        }
        self.methods.push(MethodUse {
            name: decl.name.clone(),
            input_layout: decl.input_layout.clone(),
            output_layout: decl.output_layout.clone(),
        });
        (self.methods.len() - 1) as u32
    }
}

/// A resource type descriptor.
#[derive(Clone, Debug)]
pub struct ResourceType {
    json: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum TypeDescriptor {
    SquareMatrix,
    Dummy,
    External { extension: String, resource: String },
}

impl ResourceType {
    /// Parse a type descriptor from its JSON form.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let value: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| BuildError::BadResourceType(e.to_string()))?;
        // Validate the descriptor shape up front; the value itself is kept
        // verbatim so the artifact round-trips byte-for-byte.
        let _: TypeDescriptor = serde_json::from_value(value.clone())
            .map_err(|e| BuildError::BadResourceType(e.to_string()))?;
        Ok(ResourceType { json: value })
    }

    /// Instantiate a resource from its payload. The payload is validated
    /// now; a bad payload is a build-time [`ResourceError`].
    pub fn load(&self, name: &str, payload: &[u8]) -> Result<Resource, Error> {
        let type_json = self.json.to_string();
        let implementation = instantiate(&type_json, name, payload)?;
        let decls = implementation.methods();
        Ok(Resource {
            id: fresh_handle_id(),
            name: name.to_string(),
            type_json,
            payload: payload.to_vec(),
            implementation,
            decls,
        })
    }
}

/// Build the in-process implementation for a type descriptor and payload.
/// Shared between build time and artifact load.
pub(crate) fn instantiate(
    type_json: &str,
    name: &str,
    payload: &[u8],
) -> Result<Arc<dyn ResourceImpl>, Error> {
    let descriptor: TypeDescriptor = serde_json::from_str(type_json)
        .map_err(|e| BuildError::BadResourceType(e.to_string()))?;
    match descriptor {
        TypeDescriptor::SquareMatrix => Ok(Arc::new(SquareMatrix::load(name, payload)?)),
        TypeDescriptor::Dummy => Ok(Arc::new(Dummy::load(name, payload)?)),
        TypeDescriptor::External {
            extension,
            resource,
        } => extension::load_resource(&extension, &resource, name, payload),
    }
}

/// A loaded resource, usable from any graph. The first method call inside a
/// graph registers the resource with that graph.
#[derive(Clone)]
pub struct Resource {
    id: u64,
    name: String,
    type_json: String,
    payload: Vec<u8>,
    implementation: Arc<dyn ResourceImpl>,
    decls: Vec<MethodDecl>,
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("type_json", &self.type_json)
            .field("payload", &self.payload)
            .field("decls", &self.decls)
            .finish()
    }
}

impl Resource {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declared methods of this resource.
    pub fn methods(&self) -> &[MethodDecl] {
        &self.decls
    }

    /// Invoke `method` on the current graph. `args` must match the method's
    /// input layout; the result is shaped like its output layout.
    pub fn call(&self, method: &str, args: impl IntoRefValue) -> Result<RefValue, Error> {
        let decl = self
            .decls
            .iter()
            .find(|decl| decl.name == method)
            .ok_or_else(|| BuildError::UnknownResourceMethod {
                resource: self.name.clone(),
                method: method.to_string(),
            })?;
        builder::with_current(|g| {
            let resource = match g.lookup_resource(self.id) {
                Some(index) => index,
                None => g.register_resource(
                    self.id,
                    ResourceSpec {
                        name: self.name.clone(),
                        type_json: self.type_json.clone(),
                        payload: self.payload.clone(),
                        methods: Vec::new(),
                    },
                ),
            };
            let method = g.resource_spec_mut(resource).method_index(decl);
            let args = args.into_ref_value(g)?;
            let operands = builder::flatten_ref_value(g, &args, &decl.input_layout)?;
            let ptr = g.push(
                Op::ResourceCall {
                    resource,
                    method,
                    input_width: operands.len() as u32,
                    output_width: decl.output_layout.width() as u32,
                },
                &operands,
            )?;
            builder::load_slots(g, ptr, &decl.output_layout)
        })
        .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_descriptors_parse() {
        assert!(ResourceType::from_json(r#"{"type":"Dummy"}"#).is_ok());
        assert!(ResourceType::from_json(r#"{"type":"SquareMatrix"}"#).is_ok());
        assert!(
            ResourceType::from_json(
                r#"{"type":"External","extension":"dummy","resource":"Dummy"}"#
            )
            .is_ok()
        );
        assert!(ResourceType::from_json(r#"{"type":"NoSuchThing"}"#).is_err());
        assert!(ResourceType::from_json("not json").is_err());
    }
}
