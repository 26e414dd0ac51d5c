//! Executable memory and relocation patching.
//!
//! The artifact carries a relocatable code object; at load time the code is
//! copied into fresh pages, every relocation is patched in place with the
//! address of its in-process helper, and the pages are flipped to
//! read-execute. The memory is written exactly once and is immutable (and
//! shareable across threads) from then on.

use std::ffi::c_void;

use crate::artifact::{RelocEntry, RelocKind, RelocTarget};
use crate::compile::helpers;
use crate::error::LinkError;

/// An owned read-execute mapping. Freed with the owning function.
pub(crate) struct CodeMemory {
    allocation: region::Allocation,
}

// SAFETY: the mapping is written once during `link` and is read/execute
// only afterwards.
unsafe impl Send for CodeMemory {}
unsafe impl Sync for CodeMemory {}

impl CodeMemory {
    pub fn ptr(&self) -> *const u8 {
        self.allocation.as_ptr::<u8>()
    }
}

fn resolve(target: &RelocTarget) -> Result<*const u8, LinkError> {
    match target {
        RelocTarget::Helper(call) => Ok(call.address()),
        RelocTarget::LibCall(name) => helpers::libcall_address(name)
            .ok_or_else(|| LinkError::SymbolResolution(format!("libcall `{name}`"))),
    }
}

/// Map `code` into executable memory, patching `relocs` in place.
pub(crate) fn link(code: &[u8], relocs: &[RelocEntry]) -> Result<CodeMemory, LinkError> {
    let mut allocation = region::alloc(code.len().max(1), region::Protection::READ_WRITE)
        .map_err(|e| LinkError::Memory(e.to_string()))?;
    let base = allocation.as_mut_ptr::<u8>();
    // SAFETY: the allocation is at least `code.len()` bytes and writable.
    unsafe {
        std::ptr::copy_nonoverlapping(code.as_ptr(), base, code.len());
    }

    for reloc in relocs {
        let offset = reloc.offset as usize;
        let address = resolve(&reloc.target)?;
        let at_range = match reloc.kind {
            RelocKind::Abs8 => 8,
            RelocKind::Abs4 | RelocKind::X86PCRel4 | RelocKind::X86CallPCRel4 => 4,
            RelocKind::Arm64Call => 4,
        };
        if offset + at_range > code.len() {
            return Err(LinkError::SymbolResolution(format!(
                "relocation at {offset:#x} is outside the code object"
            )));
        }
        // SAFETY: bounds checked above; the writes are unaligned-tolerant.
        unsafe {
            let at = base.add(offset);
            match reloc.kind {
                RelocKind::Abs8 => {
                    let value = (address as i64).wrapping_add(reloc.addend) as u64;
                    at.cast::<u64>().write_unaligned(value.to_le());
                }
                RelocKind::Abs4 => {
                    let value = (address as i64).wrapping_add(reloc.addend);
                    let narrow = u32::try_from(value as u64).map_err(|_| {
                        LinkError::SymbolResolution(format!(
                            "abs4 relocation target {value:#x} does not fit in 32 bits"
                        ))
                    })?;
                    at.cast::<u32>().write_unaligned(narrow.to_le());
                }
                RelocKind::X86PCRel4 | RelocKind::X86CallPCRel4 => {
                    let displacement = (address as i64)
                        .wrapping_sub(at as i64)
                        .wrapping_add(reloc.addend);
                    let narrow = i32::try_from(displacement).map_err(|_| {
                        LinkError::SymbolResolution(format!(
                            "pc-relative target is {displacement:#x} bytes away"
                        ))
                    })?;
                    at.cast::<i32>().write_unaligned(narrow.to_le());
                }
                RelocKind::Arm64Call => {
                    let displacement = (address as i64)
                        .wrapping_sub(at as i64)
                        .wrapping_add(reloc.addend);
                    if !(-(1 << 27)..(1 << 27)).contains(&displacement) {
                        return Err(LinkError::SymbolResolution(format!(
                            "aarch64 call target is {displacement:#x} bytes away"
                        )));
                    }
                    let instruction = at.cast::<u32>().read_unaligned();
                    let patched =
                        instruction | (((displacement >> 2) as u32) & 0x03ff_ffff);
                    at.cast::<u32>().write_unaligned(patched);
                }
            }
        }
    }

    let len = allocation.len();
    // SAFETY: flipping our own fresh mapping; nothing executes it yet.
    unsafe {
        region::protect(base, len, region::Protection::READ_EXECUTE)
            .map_err(|e| LinkError::Memory(e.to_string()))?;
    }
    unsafe {
        wasmtime_jit_icache_coherence::clear_cache(base as *const c_void, len)
            .map_err(|e| LinkError::Memory(e.to_string()))?;
        wasmtime_jit_icache_coherence::pipeline_flush_mt()
            .map_err(|e| LinkError::Memory(e.to_string()))?;
    }

    Ok(CodeMemory { allocation })
}
