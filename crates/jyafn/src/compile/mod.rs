//! The compiler pipeline: constant folding, lowering to Cranelift IR, and
//! native code generation, producing a self-contained artifact.

use cranelift_codegen::binemit::Reloc;
use cranelift_codegen::control::ControlPlane;
use cranelift_codegen::ir::ExternalName;
use cranelift_codegen::isa::OwnedTargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::{Context, FinalizedMachReloc, FinalizedRelocTarget};

use crate::artifact::{ArtifactData, CodeObject, ENTRY_ABI_VERSION, RelocEntry, RelocKind,
    RelocTarget};
use crate::error::{BuildError, CompilationError, Error};
use crate::function::{self, Function};
use crate::graph::Graph;

pub(crate) mod fold;
pub(crate) mod helpers;
pub(crate) mod linker;
mod lower;

use helpers::HostCall;

/// Build the ISA for the machine we are running on. Fails cleanly when
/// cranelift has no back-end for it.
fn host_isa() -> Result<OwnedTargetIsa, CompilationError> {
    let mut flags = settings::builder();
    let configure = |r: Result<(), settings::SetError>| {
        r.map_err(|e| CompilationError::Backend(e.to_string()))
    };
    configure(flags.set("opt_level", "speed"))?;
    // Helper addresses are patched in as absolute addresses by the linker.
    configure(flags.set("is_pic", "false"))?;
    configure(flags.set("use_colocated_libcalls", "false"))?;
    let isa_builder = cranelift_native::builder()
        .map_err(|message| CompilationError::UnsupportedPlatform(message.to_string()))?;
    isa_builder
        .finish(settings::Flags::new(flags))
        .map_err(|e| CompilationError::Backend(e.to_string()))
}

struct Codegen {
    code: CodeObject,
    relocs: Vec<RelocEntry>,
    vcode: Option<String>,
}

fn translate_relocs(
    finalized: &[FinalizedMachReloc],
    func: &cranelift_codegen::ir::Function,
) -> Result<Vec<RelocEntry>, CompilationError> {
    let mut relocs = Vec::with_capacity(finalized.len());
    for reloc in finalized {
        let kind = match reloc.kind {
            Reloc::Abs4 => RelocKind::Abs4,
            Reloc::Abs8 => RelocKind::Abs8,
            Reloc::X86PCRel4 => RelocKind::X86PCRel4,
            Reloc::X86CallPCRel4 => RelocKind::X86CallPCRel4,
            Reloc::Arm64Call => RelocKind::Arm64Call,
            other => {
                return Err(CompilationError::Backend(format!(
                    "unsupported relocation kind {other}"
                )));
            }
        };
        let target = match &reloc.target {
            FinalizedRelocTarget::ExternalName(ExternalName::User(name_ref)) => {
                let name = &func.params.user_named_funcs()[*name_ref];
                let call = HostCall::from_index(name.index).ok_or_else(|| {
                    CompilationError::Backend(format!("unknown helper index {}", name.index))
                })?;
                RelocTarget::Helper(call)
            }
            FinalizedRelocTarget::ExternalName(ExternalName::LibCall(libcall)) => {
                RelocTarget::LibCall(format!("{libcall:?}"))
            }
            other => {
                return Err(CompilationError::Backend(format!(
                    "unsupported relocation target {other:?}"
                )));
            }
        };
        relocs.push(RelocEntry {
            offset: reloc.offset,
            kind,
            addend: reloc.addend,
            target,
        });
    }
    Ok(relocs)
}

fn codegen(graph: &Graph, want_disasm: bool) -> Result<Codegen, Error> {
    if graph.ret().is_none() {
        return Err(BuildError::MissingReturn(graph.name().to_string()).into());
    }
    graph.validate()?;
    let resolution = fold::fold(graph)?;
    let isa = host_isa()?;
    let clif = lower::lower(graph, &resolution, isa.as_ref())?;

    let mut ctx = Context::for_function(clif);
    ctx.set_disasm(want_disasm);
    let compiled = ctx
        .compile(isa.as_ref(), &mut ControlPlane::default())
        .map_err(|e| CompilationError::Backend(e.inner.to_string()))?;
    let code = compiled.code_buffer().to_vec();
    let finalized: Vec<FinalizedMachReloc> = compiled.buffer.relocs().to_vec();
    let vcode = compiled.vcode.clone();
    log::debug!(
        "compiled `{}`: {} nodes, {} bytes, {} relocations",
        graph.name(),
        graph.len(),
        code.len(),
        finalized.len()
    );

    let relocs = translate_relocs(&finalized, &ctx.func)?;
    Ok(Codegen {
        code: CodeObject {
            abi_version: ENTRY_ABI_VERSION,
            target: isa.triple().to_string(),
            code,
        },
        relocs,
        vcode,
    })
}

/// Produce the serializable artifact for a closed graph, compiling its
/// sub-graphs recursively.
pub(crate) fn build_artifact(graph: &Graph) -> Result<ArtifactData, Error> {
    let output_layout = graph
        .output_layout()
        .cloned()
        .ok_or_else(|| BuildError::MissingReturn(graph.name().to_string()))?;
    let generated = codegen(graph, false)?;
    let subgraphs = graph
        .subgraphs
        .iter()
        .map(build_artifact)
        .collect::<Result<Vec<_>, _>>()?;

    let mut metadata = graph.metadata().clone();
    metadata
        .entry("jyafn.created_at".to_string())
        .or_insert_with(|| chrono::Utc::now().to_rfc3339());
    metadata.insert(
        "jyafn.mem_size_estimate".to_string(),
        graph.size_estimate().to_string(),
    );

    Ok(ArtifactData {
        name: graph.name().to_string(),
        metadata,
        input_layout: graph.input_layout(),
        output_layout,
        symbols: graph.symbols.clone(),
        mappings: graph.mappings.clone(),
        resources: graph.resources.clone(),
        subgraphs,
        code: generated.code,
        relocs: generated.relocs,
        asserts: graph.asserts.clone(),
    })
}

/// Compile a closed graph into a callable function.
pub(crate) fn compile(graph: &Graph) -> Result<Function, Error> {
    function::instantiate(build_artifact(graph)?)
}

/// The textual IR of the lowered function.
pub(crate) fn render(graph: &Graph) -> Result<String, Error> {
    if graph.ret().is_none() {
        return Err(BuildError::MissingReturn(graph.name().to_string()).into());
    }
    let resolution = fold::fold(graph)?;
    let isa = host_isa()?;
    let clif = lower::lower(graph, &resolution, isa.as_ref())?;
    Ok(clif.display().to_string())
}

/// The back-end's disassembly of the generated code.
pub(crate) fn render_assembly(graph: &Graph) -> Result<String, Error> {
    let generated = codegen(graph, true)?;
    generated
        .vcode
        .ok_or_else(|| CompilationError::Backend("back-end produced no disassembly".into()).into())
}
