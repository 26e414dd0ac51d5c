//! In-process helpers callable from generated code.
//!
//! Generated code references these by name (a [`HostCall`]) through the
//! relocation table; the linker patches in the addresses at artifact load.
//! Pure math helpers take and return raw floats. Fallible helpers take the
//! environment and call-context pointers, return a status code, and record
//! a fault in the context before reporting failure.

use serde_derive::{Deserialize, Serialize};

use crate::function::{
    CallContext, Fault, FunctionEnv, STATUS_FAULT, STATUS_INDEX_OOB,
};
use crate::value::{self, DateTimeField};

/// The closed set of helper entry points.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub(crate) enum HostCall {
    Exp,
    Ln,
    Log10,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Round,
    Pow,
    Fmod,
    Atan2,
    FMin,
    FMax,
    DtField,
    DtParse,
    DtFormat,
    MapGet,
    MapGetOr,
    ResourceCall,
    CallGraph,
}

const ALL: [HostCall; 22] = [
    HostCall::Exp,
    HostCall::Ln,
    HostCall::Log10,
    HostCall::Sin,
    HostCall::Cos,
    HostCall::Tan,
    HostCall::Asin,
    HostCall::Acos,
    HostCall::Atan,
    HostCall::Round,
    HostCall::Pow,
    HostCall::Fmod,
    HostCall::Atan2,
    HostCall::FMin,
    HostCall::FMax,
    HostCall::DtField,
    HostCall::DtParse,
    HostCall::DtFormat,
    HostCall::MapGet,
    HostCall::MapGetOr,
    HostCall::ResourceCall,
    HostCall::CallGraph,
];

type UnaryFn = extern "C" fn(f64) -> f64;
type BinaryFn = extern "C" fn(f64, f64) -> f64;

impl HostCall {
    /// Index used as the user-external-name of the imported function in the
    /// generated IR.
    pub fn index(self) -> u32 {
        ALL.iter().position(|c| *c == self).expect("listed in ALL") as u32
    }

    pub fn from_index(index: u32) -> Option<Self> {
        ALL.get(index as usize).copied()
    }

    /// The in-process address the linker patches in.
    pub fn address(self) -> *const u8 {
        match self {
            HostCall::Exp => jyafn_exp as UnaryFn as *const u8,
            HostCall::Ln => jyafn_ln as UnaryFn as *const u8,
            HostCall::Log10 => jyafn_log10 as UnaryFn as *const u8,
            HostCall::Sin => jyafn_sin as UnaryFn as *const u8,
            HostCall::Cos => jyafn_cos as UnaryFn as *const u8,
            HostCall::Tan => jyafn_tan as UnaryFn as *const u8,
            HostCall::Asin => jyafn_asin as UnaryFn as *const u8,
            HostCall::Acos => jyafn_acos as UnaryFn as *const u8,
            HostCall::Atan => jyafn_atan as UnaryFn as *const u8,
            HostCall::Round => jyafn_round as UnaryFn as *const u8,
            HostCall::Pow => jyafn_pow as BinaryFn as *const u8,
            HostCall::Fmod => jyafn_fmod as BinaryFn as *const u8,
            HostCall::Atan2 => jyafn_atan2 as BinaryFn as *const u8,
            HostCall::FMin => jyafn_fmin as BinaryFn as *const u8,
            HostCall::FMax => jyafn_fmax as BinaryFn as *const u8,
            HostCall::DtField => {
                jyafn_dt_field as extern "C" fn(i64, i64) -> f64 as *const u8
            }
            HostCall::DtParse => {
                jyafn_dt_parse
                    as extern "C" fn(
                        *const FunctionEnv,
                        *mut CallContext,
                        u64,
                        u64,
                        *mut i64,
                    ) -> i64 as *const u8
            }
            HostCall::DtFormat => {
                jyafn_dt_format
                    as extern "C" fn(
                        *const FunctionEnv,
                        *mut CallContext,
                        i64,
                        u64,
                        *mut u64,
                    ) -> i64 as *const u8
            }
            HostCall::MapGet => {
                jyafn_map_get
                    as extern "C" fn(
                        *const FunctionEnv,
                        *mut CallContext,
                        u64,
                        *const u64,
                        *mut u64,
                    ) -> i64 as *const u8
            }
            HostCall::MapGetOr => {
                jyafn_map_get_or
                    as extern "C" fn(
                        *const FunctionEnv,
                        *mut CallContext,
                        u64,
                        *const u64,
                        *const u64,
                        *mut u64,
                    ) -> i64 as *const u8
            }
            HostCall::ResourceCall => {
                jyafn_resource_call
                    as extern "C" fn(
                        *const FunctionEnv,
                        *mut CallContext,
                        u64,
                        u64,
                        *const u64,
                        *mut u64,
                    ) -> i64 as *const u8
            }
            HostCall::CallGraph => {
                jyafn_call_graph
                    as extern "C" fn(
                        *const FunctionEnv,
                        *mut CallContext,
                        u64,
                        *const u64,
                        *mut u64,
                    ) -> i64 as *const u8
            }
        }
    }
}

/// Resolve a cranelift libcall by its debug name. The back-end only emits
/// these for float rounding on hosts without native instructions.
pub(crate) fn libcall_address(name: &str) -> Option<*const u8> {
    Some(match name {
        "FloorF64" => jyafn_lc_floor as UnaryFn as *const u8,
        "CeilF64" => jyafn_lc_ceil as UnaryFn as *const u8,
        "TruncF64" => jyafn_lc_trunc as UnaryFn as *const u8,
        "NearestF64" => jyafn_lc_nearest as UnaryFn as *const u8,
        "FmaF64" => jyafn_lc_fma as extern "C" fn(f64, f64, f64) -> f64 as *const u8,
        _ => return None,
    })
}

// --- pure math ------------------------------------------------------------

extern "C" fn jyafn_exp(x: f64) -> f64 {
    x.exp()
}

extern "C" fn jyafn_ln(x: f64) -> f64 {
    x.ln()
}

extern "C" fn jyafn_log10(x: f64) -> f64 {
    x.log10()
}

extern "C" fn jyafn_sin(x: f64) -> f64 {
    x.sin()
}

extern "C" fn jyafn_cos(x: f64) -> f64 {
    x.cos()
}

extern "C" fn jyafn_tan(x: f64) -> f64 {
    x.tan()
}

extern "C" fn jyafn_asin(x: f64) -> f64 {
    x.asin()
}

extern "C" fn jyafn_acos(x: f64) -> f64 {
    x.acos()
}

extern "C" fn jyafn_atan(x: f64) -> f64 {
    x.atan()
}

extern "C" fn jyafn_round(x: f64) -> f64 {
    x.round()
}

extern "C" fn jyafn_pow(a: f64, b: f64) -> f64 {
    a.powf(b)
}

extern "C" fn jyafn_fmod(a: f64, b: f64) -> f64 {
    a % b
}

extern "C" fn jyafn_atan2(a: f64, b: f64) -> f64 {
    a.atan2(b)
}

extern "C" fn jyafn_fmin(a: f64, b: f64) -> f64 {
    a.min(b)
}

extern "C" fn jyafn_fmax(a: f64, b: f64) -> f64 {
    a.max(b)
}

extern "C" fn jyafn_lc_floor(x: f64) -> f64 {
    x.floor()
}

extern "C" fn jyafn_lc_ceil(x: f64) -> f64 {
    x.ceil()
}

extern "C" fn jyafn_lc_trunc(x: f64) -> f64 {
    x.trunc()
}

extern "C" fn jyafn_lc_nearest(x: f64) -> f64 {
    // Round half to even, matching the `nearest` instruction.
    let r = x.round();
    if (x - x.trunc()).abs() == 0.5 && r % 2.0 != 0.0 {
        r - (r - x).signum()
    } else {
        r
    }
}

extern "C" fn jyafn_lc_fma(a: f64, b: f64, c: f64) -> f64 {
    a.mul_add(b, c)
}

// --- datetime -------------------------------------------------------------

extern "C" fn jyafn_dt_field(micros: i64, field: i64) -> f64 {
    match DateTimeField::from_code(field as u64) {
        Some(field) => value::datetime_field(micros, field),
        None => f64::NAN,
    }
}

fn fault(ctx: &mut CallContext, fault: Fault) -> i64 {
    ctx.fault = Some(fault);
    STATUS_FAULT as i64
}

extern "C" fn jyafn_dt_parse(
    env: *const FunctionEnv,
    ctx: *mut CallContext,
    text: u64,
    format: u64,
    out: *mut i64,
) -> i64 {
    // SAFETY: the invoker passes a live environment and context; `out` is a
    // one-word stack slot in the generated frame.
    let (env, ctx) = unsafe { (&*env, &mut *ctx) };
    let mut resolve = |id: u64, what: &str| -> Result<String, i64> {
        match ctx.symbol_text(&env.symbols, id) {
            Some(text) => Ok(text.to_string()),
            None => Err(fault(
                ctx,
                Fault::Invocation(format!("unknown symbol id {id:#x} as {what}")),
            )),
        }
    };
    let text = match resolve(text, "datetime text") {
        Ok(text) => text,
        Err(status) => return status,
    };
    let format = match resolve(format, "datetime format") {
        Ok(format) => format,
        Err(status) => return status,
    };
    match value::parse_datetime(&text, &format) {
        Ok(micros) => {
            // SAFETY: see above.
            unsafe { *out = micros };
            0
        }
        Err(message) => fault(ctx, Fault::Invocation(message)),
    }
}

extern "C" fn jyafn_dt_format(
    env: *const FunctionEnv,
    ctx: *mut CallContext,
    micros: i64,
    format: u64,
    out: *mut u64,
) -> i64 {
    // SAFETY: as in `jyafn_dt_parse`.
    let (env, ctx) = unsafe { (&*env, &mut *ctx) };
    let Some(format) = ctx.symbol_text(&env.symbols, format).map(str::to_string) else {
        return fault(
            ctx,
            Fault::Invocation(format!("unknown symbol id {format:#x} as datetime format")),
        );
    };
    match value::format_datetime(micros, &format) {
        Ok(text) => {
            let id = ctx.push_dynamic(text);
            // SAFETY: `out` is a one-word stack slot in the generated frame.
            unsafe { *out = id };
            0
        }
        Err(message) => fault(ctx, Fault::Invocation(message)),
    }
}

// --- constant-pool lookups ------------------------------------------------

extern "C" fn jyafn_map_get(
    env: *const FunctionEnv,
    ctx: *mut CallContext,
    mapping: u64,
    key: *const u64,
    out: *mut u64,
) -> i64 {
    // SAFETY: key and out are stack slots sized to the mapping's key and
    // value widths by the lowering.
    let (env, ctx) = unsafe { (&*env, &mut *ctx) };
    let mapping = &env.mappings[mapping as usize];
    let key = unsafe { std::slice::from_raw_parts(key, mapping.key_width) };
    match mapping.table.get(key) {
        Some(value) => {
            let out = unsafe { std::slice::from_raw_parts_mut(out, mapping.value_width) };
            out.copy_from_slice(value);
            0
        }
        None => fault(
            ctx,
            Fault::Invocation(format!("key not found in mapping `{}`", mapping.name)),
        ),
    }
}

extern "C" fn jyafn_map_get_or(
    env: *const FunctionEnv,
    _ctx: *mut CallContext,
    mapping: u64,
    key: *const u64,
    default: *const u64,
    out: *mut u64,
) -> i64 {
    // SAFETY: as in `jyafn_map_get`; `default` has the value width.
    let env = unsafe { &*env };
    let mapping = &env.mappings[mapping as usize];
    let key = unsafe { std::slice::from_raw_parts(key, mapping.key_width) };
    let out = unsafe { std::slice::from_raw_parts_mut(out, mapping.value_width) };
    match mapping.table.get(key) {
        Some(value) => out.copy_from_slice(value),
        None => {
            let default = unsafe { std::slice::from_raw_parts(default, mapping.value_width) };
            out.copy_from_slice(default);
        }
    }
    0
}

extern "C" fn jyafn_resource_call(
    env: *const FunctionEnv,
    ctx: *mut CallContext,
    resource: u64,
    method: u64,
    input: *const u64,
    output: *mut u64,
) -> i64 {
    // SAFETY: buffers are stack slots sized to the method's declared
    // layouts by the lowering.
    let (env, ctx) = unsafe { (&*env, &mut *ctx) };
    let resource = &env.resources[resource as usize];
    let method = &resource.methods[method as usize];
    let input = unsafe { std::slice::from_raw_parts(input, method.input_width) };
    let output = unsafe { std::slice::from_raw_parts_mut(output, method.output_width) };
    match resource
        .implementation
        .call(method.impl_index, input, output)
    {
        Ok(()) => 0,
        Err(e) => fault(
            ctx,
            Fault::Resource {
                resource: e.resource,
                message: e.message,
            },
        ),
    }
}

extern "C" fn jyafn_call_graph(
    env: *const FunctionEnv,
    ctx: *mut CallContext,
    subgraph: u64,
    input: *const u64,
    output: *mut u64,
) -> i64 {
    // SAFETY: buffers are stack slots sized to the callee's layouts by the
    // lowering; the context is shared so dynamic symbols flow through.
    let (env, ctx) = unsafe { (&*env, &mut *ctx) };
    let callee = &env.subfunctions[subgraph as usize];
    let callee_env = callee.env();
    let input =
        unsafe { std::slice::from_raw_parts(input, callee.input_layout().width()) };
    let output =
        unsafe { std::slice::from_raw_parts_mut(output, callee.output_layout().width()) };
    callee.raw_call(input, output, ctx);
    let status = ctx.status;
    if status == 0 {
        return 0;
    }
    // Translate the callee's status into a fault the caller's tables can
    // surface, then reset the shared word so the caller records it itself.
    ctx.status = 0;
    if ctx.fault.is_none() {
        let message = if status == STATUS_INDEX_OOB {
            "index out of bounds".to_string()
        } else {
            callee_env
                .asserts
                .get(status as usize - 1)
                .cloned()
                .unwrap_or_else(|| format!("sub-graph failed with status {status:#x}"))
        };
        ctx.fault = Some(Fault::Invocation(message));
    }
    STATUS_FAULT as i64
}
