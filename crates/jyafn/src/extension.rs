//! Dynamically loaded extensions.
//!
//! An extension is a dynamic library installed on the search path (the
//! `JYAFN_PATH` environment variable, comma- or colon-separated; default
//! `~/.jyafn/extensions`) as `<name>-<version>.<dylib-ext>`. Extension names
//! match `[a-z][a-z0-9_]*` and versions are semver; when several versions of
//! one extension are installed, the highest wins.
//!
//! The library must export `extension_init() -> *const c_char` returning a
//! JSON manifest describing its resources and their raw method symbols.
//! Extensions are reference-counted per process: the registry holds weak
//! handles, every loaded resource holds a strong one, and the library is
//! unloaded when the last referencing artifact is dropped.

use std::collections::HashMap;
use std::ffi::{CStr, c_char, c_void};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use indexmap::IndexMap;
use serde_derive::Deserialize;

use crate::error::{Error, LinkError, ResourceError};
use crate::layout::{JsonLayout, Layout};
use crate::resource::{MethodDecl, ResourceImpl};

/// Capacity of the error buffer handed to raw extension calls.
const ERR_CAP: usize = 512;

/// Version of the raw symbol ABI described below.
pub const EXTENSION_ABI_VERSION: u32 = 1;

type InitFn = unsafe extern "C" fn() -> *const c_char;
type LoadFn = unsafe extern "C" fn(*const u8, u64, *mut c_char, u64) -> *mut c_void;
type DropFn = unsafe extern "C" fn(*mut c_void);
type MethodFn =
    unsafe extern "C" fn(*const c_void, *const u64, u64, *mut u64, u64, *mut c_char, u64) -> i64;

#[derive(Debug, Deserialize)]
struct Manifest {
    metadata: Metadata,
    resources: IndexMap<String, ResourceManifest>,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    name: String,
    version: String,
}

#[derive(Debug, Deserialize)]
struct ResourceManifest {
    load: String,
    #[serde(default)]
    drop: Option<String>,
    methods: IndexMap<String, MethodManifest>,
}

#[derive(Debug, Deserialize)]
struct MethodManifest {
    symbol: String,
    input_layout: JsonLayout,
    output_layout: JsonLayout,
    #[serde(default = "default_reentrant")]
    reentrant: bool,
}

fn default_reentrant() -> bool {
    true
}

#[derive(Debug)]
struct Extension {
    manifest: Manifest,
    library: libloading::Library,
}

fn registry() -> &'static Mutex<HashMap<String, Weak<Extension>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Weak<Extension>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Is `name` a well-formed extension name (`[a-z][a-z0-9_]*`)?
pub(crate) fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

fn dylib_extension() -> &'static str {
    if cfg!(target_os = "macos") {
        "dylib"
    } else if cfg!(target_os = "windows") {
        "dll"
    } else {
        "so"
    }
}

/// The extension search path, honoring `JYAFN_PATH`.
pub fn search_path() -> Vec<PathBuf> {
    let configured = std::env::var("JYAFN_PATH").unwrap_or_default();
    if configured.is_empty() {
        let home = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(PathBuf::from)
            .unwrap_or_default();
        return vec![home.join(".jyafn").join("extensions")];
    }
    configured
        .split([',', ':'])
        .filter(|part| !part.is_empty())
        .map(PathBuf::from)
        .collect()
}

/// Find the best installed library for `name`: the highest semver among
/// files named `<name>-<version>.<dylib-ext>` anywhere on the search path.
fn locate(name: &str) -> Option<PathBuf> {
    let extension = dylib_extension();
    let mut best: Option<(semver::Version, PathBuf)> = None;
    for dir in search_path() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(extension) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some((file_name, file_version)) = stem.rsplit_once('-') else {
                continue;
            };
            if file_name != name {
                continue;
            }
            let Ok(version) = semver::Version::parse(file_version) else {
                log::warn!("ignoring {}: `{file_version}` is not semver", path.display());
                continue;
            };
            if best.as_ref().is_none_or(|(v, _)| version > *v) {
                best = Some((version, path));
            }
        }
    }
    best.map(|(_, path)| path)
}

fn get_extension(name: &str) -> Result<Arc<Extension>, Error> {
    if !valid_name(name) {
        return Err(LinkError::ExtensionUnavailable(name.to_string()).into());
    }
    let mut registry = registry().lock().expect("extension registry lock");
    if let Some(existing) = registry.get(name).and_then(Weak::upgrade) {
        return Ok(existing);
    }
    let path = locate(name).ok_or_else(|| LinkError::ExtensionUnavailable(name.to_string()))?;
    let extension = Arc::new(open_extension(name, &path)?);
    registry.insert(name.to_string(), Arc::downgrade(&extension));
    Ok(extension)
}

fn open_extension(name: &str, path: &Path) -> Result<Extension, Error> {
    log::debug!("loading extension `{name}` from {}", path.display());
    // SAFETY: loading a library runs its initializers; that is the entire
    // point of an extension, and the path came from the configured search
    // path.
    let library = unsafe { libloading::Library::new(path) }
        .map_err(|e| LinkError::SymbolResolution(format!("{}: {e}", path.display())))?;
    // SAFETY: `extension_init` is the documented entry point; the returned
    // pointer must be a NUL-terminated string with static lifetime.
    let manifest_json = unsafe {
        let init: libloading::Symbol<InitFn> = library
            .get(b"extension_init\0")
            .map_err(|_| LinkError::SymbolResolution(format!("{name}: missing `extension_init`")))?;
        let raw = init();
        if raw.is_null() {
            return Err(
                LinkError::SymbolResolution(format!("{name}: `extension_init` returned null"))
                    .into(),
            );
        }
        CStr::from_ptr(raw).to_string_lossy().into_owned()
    };
    let manifest: Manifest = serde_json::from_str(&manifest_json)
        .map_err(|e| LinkError::SymbolResolution(format!("{name}: bad manifest: {e}")))?;
    if manifest.metadata.name != name || !valid_name(&manifest.metadata.name) {
        return Err(LinkError::SymbolResolution(format!(
            "{name}: manifest names `{}`",
            manifest.metadata.name
        ))
        .into());
    }
    if semver::Version::parse(&manifest.metadata.version).is_err() {
        return Err(LinkError::SymbolResolution(format!(
            "{name}: version `{}` is not semver",
            manifest.metadata.version
        ))
        .into());
    }
    Ok(Extension { manifest, library })
}

/// A handle into a foreign library. The extension contract requires methods
/// to be callable from any thread; non-reentrant methods are serialized
/// through the resource lock.
struct RawMethod {
    decl: MethodDecl,
    f: MethodFn,
}

pub(crate) struct ExternalResource {
    name: String,
    handle: *mut c_void,
    methods: Vec<RawMethod>,
    drop_fn: Option<DropFn>,
    lock: Mutex<()>,
    // Keeps the library mapped for as long as any artifact references it.
    _extension: Arc<Extension>,
}

// SAFETY: the handle is owned by this resource, the extension ABI requires
// methods to tolerate concurrent callers, and the ones that declare
// otherwise are serialized through `lock`.
unsafe impl Send for ExternalResource {}
unsafe impl Sync for ExternalResource {}

impl Drop for ExternalResource {
    fn drop(&mut self) {
        if let Some(drop_fn) = self.drop_fn {
            // SAFETY: the handle came from this resource's `load` symbol and
            // is dropped exactly once.
            unsafe { drop_fn(self.handle) };
        }
    }
}

fn buffer_message(buffer: &[u8]) -> String {
    let len = buffer.iter().position(|&b| b == 0).unwrap_or(0);
    String::from_utf8_lossy(&buffer[..len]).into_owned()
}

impl ResourceImpl for ExternalResource {
    fn methods(&self) -> Vec<MethodDecl> {
        self.methods.iter().map(|m| m.decl.clone()).collect()
    }

    fn call(&self, method: usize, input: &[u64], output: &mut [u64]) -> Result<(), ResourceError> {
        let raw = self
            .methods
            .get(method)
            .ok_or_else(|| ResourceError::new(&self.name, format!("no method index {method}")))?;
        let _serialized = (!raw.decl.reentrant).then(|| self.lock.lock());
        let mut err = [0u8; ERR_CAP];
        // SAFETY: buffers match the declared widths (checked at build and at
        // link time) and the error buffer is writable for ERR_CAP bytes.
        let status = unsafe {
            (raw.f)(
                self.handle,
                input.as_ptr(),
                input.len() as u64,
                output.as_mut_ptr(),
                output.len() as u64,
                err.as_mut_ptr().cast(),
                ERR_CAP as u64,
            )
        };
        if status != 0 {
            let message = buffer_message(&err);
            let message = if message.is_empty() {
                format!("method `{}` failed with status {status}", raw.decl.name)
            } else {
                message
            };
            return Err(ResourceError::new(&self.name, message));
        }
        Ok(())
    }
}

/// Instantiate an external resource. This is the only site that can fail
/// with `extension unavailable`; it runs at build time and again at
/// artifact load.
pub(crate) fn load_resource(
    extension: &str,
    resource: &str,
    name: &str,
    payload: &[u8],
) -> Result<Arc<dyn ResourceImpl>, Error> {
    let ext = get_extension(extension)?;
    let manifest =
        ext.manifest
            .resources
            .get(resource)
            .ok_or_else(|| LinkError::MissingMethod {
                resource: format!("{extension}/{resource}"),
                method: "<any>".into(),
            })?;

    let symbol = |name: &str| -> Result<Vec<u8>, Error> {
        let mut bytes = name.as_bytes().to_vec();
        bytes.push(0);
        Ok(bytes)
    };

    // SAFETY: symbol names come from the manifest the extension itself
    // produced, and the library stays mapped through the Arc held below.
    let (handle, methods, drop_fn) = unsafe {
        let load: libloading::Symbol<LoadFn> =
            ext.library
                .get(&symbol(&manifest.load)?)
                .map_err(|_| LinkError::MissingMethod {
                    resource: format!("{extension}/{resource}"),
                    method: manifest.load.clone(),
                })?;
        let mut err = [0u8; ERR_CAP];
        let handle = load(
            payload.as_ptr(),
            payload.len() as u64,
            err.as_mut_ptr().cast(),
            ERR_CAP as u64,
        );
        if handle.is_null() {
            let message = buffer_message(&err);
            return Err(ResourceError::new(
                name,
                if message.is_empty() {
                    "resource load failed".to_string()
                } else {
                    message
                },
            )
            .into());
        }
        let mut methods = Vec::with_capacity(manifest.methods.len());
        for (method_name, method) in &manifest.methods {
            let f: libloading::Symbol<MethodFn> = ext
                .library
                .get(&symbol(&method.symbol)?)
                .map_err(|_| LinkError::MissingMethod {
                    resource: format!("{extension}/{resource}"),
                    method: method_name.clone(),
                })?;
            methods.push(RawMethod {
                decl: MethodDecl {
                    name: method_name.clone(),
                    input_layout: Layout::from(method.input_layout.clone()),
                    output_layout: Layout::from(method.output_layout.clone()),
                    reentrant: method.reentrant,
                },
                f: *f,
            });
        }
        let drop_fn = match &manifest.drop {
            Some(drop_name) => Some(
                *ext.library
                    .get::<DropFn>(&symbol(drop_name)?)
                    .map_err(|_| LinkError::MissingMethod {
                        resource: format!("{extension}/{resource}"),
                        method: drop_name.clone(),
                    })?,
            ),
            None => None,
        };
        (handle, methods, drop_fn)
    };

    Ok(Arc::new(ExternalResource {
        name: name.to_string(),
        handle,
        methods,
        drop_fn,
        lock: Mutex::new(()),
        _extension: ext,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(valid_name("dummy"));
        assert!(valid_name("a2_b"));
        assert!(!valid_name("Dummy"));
        assert!(!valid_name("2abc"));
        assert!(!valid_name(""));
        assert!(!valid_name("has-dash"));
    }

    #[test]
    fn missing_extensions_are_unavailable() {
        let err = get_extension("definitely_not_installed").unwrap_err();
        assert!(err.to_string().contains("unavailable"));
    }
}
