//! The `.jyafn` artifact container.
//!
//! Binary, little-endian, self-describing:
//!
//! ```text
//! magic "jyfn" | version u32 | section_count u32
//! ( section_tag u32 | section_len u64 | bytes )*
//! ```
//!
//! Section payloads are postcard-encoded serde structs, except `CODE`,
//! whose payload embeds the raw native code object alongside the entry ABI
//! version and target triple. `SUBGRAPHS` holds recursively encoded child
//! artifacts. A parallel JSON description exists for debugging and is never
//! a loader input.

use indexmap::IndexMap;
use serde_derive::{Deserialize, Serialize};

use crate::compile::helpers::HostCall;
use crate::error::SerializationError;
use crate::layout::Layout;
use crate::mapping::MappingSpec;
use crate::resource::ResourceSpec;
use crate::symbols::SymbolTable;

pub(crate) const MAGIC: [u8; 4] = *b"jyfn";
pub(crate) const FORMAT_VERSION: u32 = 1;

/// Version of the native entry's calling convention
/// `(env, input, output, call-context)`.
pub(crate) const ENTRY_ABI_VERSION: u32 = 1;

mod tag {
    pub const META: u32 = 1;
    pub const INPUT_LAYOUT: u32 = 2;
    pub const OUTPUT_LAYOUT: u32 = 3;
    pub const SYMBOLS: u32 = 4;
    pub const MAPPINGS: u32 = 5;
    pub const RESOURCES: u32 = 6;
    pub const SUBGRAPHS: u32 = 7;
    pub const CODE: u32 = 8;
    pub const RELOCS: u32 = 9;
    pub const ASSERTS: u32 = 10;

    pub const ALL: [u32; 10] = [
        META,
        INPUT_LAYOUT,
        OUTPUT_LAYOUT,
        SYMBOLS,
        MAPPINGS,
        RESOURCES,
        SUBGRAPHS,
        CODE,
        RELOCS,
        ASSERTS,
    ];
}

/// Relocation kinds the in-crate linker knows how to patch.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum RelocKind {
    /// Absolute 64-bit address.
    Abs8,
    /// Absolute 32-bit address.
    Abs4,
    /// x86-64 PC-relative 32-bit.
    X86PCRel4,
    /// x86-64 call-site PC-relative 32-bit.
    X86CallPCRel4,
    /// aarch64 `bl`/`b` 26-bit branch.
    Arm64Call,
}

/// What a relocation resolves to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) enum RelocTarget {
    /// One of the in-process helper functions.
    Helper(HostCall),
    /// A cranelift libcall, identified by its debug name.
    LibCall(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct RelocEntry {
    pub offset: u32,
    pub kind: RelocKind,
    pub addend: i64,
    pub target: RelocTarget,
}

/// The native code object.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct CodeObject {
    pub abi_version: u32,
    /// Target triple the code was produced for.
    pub target: String,
    pub code: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct MetaSection {
    name: String,
    metadata: IndexMap<String, String>,
}

/// Everything a loaded function needs, in serializable form. Produced by
/// the compiler, encoded by [`ArtifactData::encode`], and instantiated into
/// a callable [`crate::Function`] by the runtime.
#[derive(Clone, Debug)]
pub(crate) struct ArtifactData {
    pub name: String,
    pub metadata: IndexMap<String, String>,
    pub input_layout: Layout,
    pub output_layout: Layout,
    pub symbols: SymbolTable,
    pub mappings: Vec<MappingSpec>,
    pub resources: Vec<ResourceSpec>,
    pub subgraphs: Vec<ArtifactData>,
    pub code: CodeObject,
    pub relocs: Vec<RelocEntry>,
    pub asserts: Vec<String>,
}

fn section<T: serde::Serialize>(
    out: &mut Vec<u8>,
    tag: u32,
    payload: &T,
) -> Result<(), SerializationError> {
    let bytes =
        postcard::to_allocvec(payload).map_err(|e| SerializationError::Encoding(e.to_string()))?;
    out.extend_from_slice(&tag.to_le_bytes());
    out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    out.extend_from_slice(&bytes);
    Ok(())
}

struct Cursor<'a> {
    bytes: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], SerializationError> {
        if self.bytes.len() < n {
            return Err(SerializationError::Truncated);
        }
        let (head, rest) = self.bytes.split_at(n);
        self.bytes = rest;
        Ok(head)
    }

    fn u32(&mut self) -> Result<u32, SerializationError> {
        Ok(u32::from_le_bytes(
            self.take(4)?.try_into().expect("4 bytes"),
        ))
    }

    fn u64(&mut self) -> Result<u64, SerializationError> {
        Ok(u64::from_le_bytes(
            self.take(8)?.try_into().expect("8 bytes"),
        ))
    }
}

fn parse<T: serde::de::DeserializeOwned>(
    payload: Option<&[u8]>,
    name: &'static str,
) -> Result<T, SerializationError> {
    let payload = payload.ok_or(SerializationError::MissingSection(name))?;
    postcard::from_bytes(payload).map_err(|e| SerializationError::Encoding(e.to_string()))
}

impl ArtifactData {
    /// Encode into the framed byte stream.
    pub fn encode(&self) -> Result<Vec<u8>, SerializationError> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.extend_from_slice(&(tag::ALL.len() as u32).to_le_bytes());
        section(
            &mut out,
            tag::META,
            &MetaSection {
                name: self.name.clone(),
                metadata: self.metadata.clone(),
            },
        )?;
        section(&mut out, tag::INPUT_LAYOUT, &self.input_layout)?;
        section(&mut out, tag::OUTPUT_LAYOUT, &self.output_layout)?;
        section(&mut out, tag::SYMBOLS, &self.symbols)?;
        section(&mut out, tag::MAPPINGS, &self.mappings)?;
        section(&mut out, tag::RESOURCES, &self.resources)?;
        let subgraphs: Vec<Vec<u8>> = self
            .subgraphs
            .iter()
            .map(ArtifactData::encode)
            .collect::<Result<_, _>>()?;
        section(&mut out, tag::SUBGRAPHS, &subgraphs)?;
        section(&mut out, tag::CODE, &self.code)?;
        section(&mut out, tag::RELOCS, &self.relocs)?;
        section(&mut out, tag::ASSERTS, &self.asserts)?;
        Ok(out)
    }

    /// Decode the framed byte stream. Compatibility of the code object with
    /// the running process is checked at instantiation, not here, so
    /// foreign artifacts can still be described.
    pub fn decode(bytes: &[u8]) -> Result<Self, SerializationError> {
        let mut cursor = Cursor { bytes };
        if cursor.take(4)? != MAGIC {
            return Err(SerializationError::BadMagic);
        }
        let version = cursor.u32()?;
        if version != FORMAT_VERSION {
            return Err(SerializationError::UnsupportedVersion(version));
        }
        let section_count = cursor.u32()?;
        let mut sections: [Option<&[u8]>; tag::ALL.len() + 1] = [None; tag::ALL.len() + 1];
        for _ in 0..section_count {
            let tag = cursor.u32()?;
            let len = cursor.u64()?;
            let len = usize::try_from(len).map_err(|_| SerializationError::Truncated)?;
            let payload = cursor.take(len)?;
            if !(1..=tag::ALL.len() as u32).contains(&tag) {
                return Err(SerializationError::UnknownSection(tag));
            }
            sections[tag as usize] = Some(payload);
        }

        let meta: MetaSection = parse(sections[tag::META as usize], "META")?;
        let subgraph_bytes: Vec<Vec<u8>> = parse(sections[tag::SUBGRAPHS as usize], "SUBGRAPHS")?;
        Ok(ArtifactData {
            name: meta.name,
            metadata: meta.metadata,
            input_layout: parse(sections[tag::INPUT_LAYOUT as usize], "INPUT_LAYOUT")?,
            output_layout: parse(sections[tag::OUTPUT_LAYOUT as usize], "OUTPUT_LAYOUT")?,
            symbols: parse(sections[tag::SYMBOLS as usize], "SYMBOLS")?,
            mappings: parse(sections[tag::MAPPINGS as usize], "MAPPINGS")?,
            resources: parse(sections[tag::RESOURCES as usize], "RESOURCES")?,
            subgraphs: subgraph_bytes
                .iter()
                .map(|b| ArtifactData::decode(b))
                .collect::<Result<_, _>>()?,
            code: parse(sections[tag::CODE as usize], "CODE")?,
            relocs: parse(sections[tag::RELOCS as usize], "RELOCS")?,
            asserts: parse(sections[tag::ASSERTS as usize], "ASSERTS")?,
        })
    }

    /// The JSON debug description: metadata, layouts and constant summaries.
    pub fn describe(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "metadata": self.metadata,
            "input_layout": self.input_layout.to_json_value(),
            "output_layout": self.output_layout.to_json_value(),
            "symbols": self.symbols.iter().collect::<Vec<_>>(),
            "mappings": self.mappings.iter().map(|m| serde_json::json!({
                "name": m.name,
                "key_layout": m.key_layout.to_json_value(),
                "value_layout": m.value_layout.to_json_value(),
                "entries": m.rows.len(),
            })).collect::<Vec<_>>(),
            "resources": self.resources.iter().map(|r| serde_json::json!({
                "name": r.name,
                "type": serde_json::from_str::<serde_json::Value>(&r.type_json)
                    .unwrap_or(serde_json::Value::Null),
                "methods": r.methods.iter().map(|m| m.name.clone()).collect::<Vec<_>>(),
            })).collect::<Vec<_>>(),
            "subgraphs": self.subgraphs.iter().map(ArtifactData::describe).collect::<Vec<_>>(),
            "code": {
                "abi_version": self.code.abi_version,
                "target": self.code.target,
                "size": self.code.code.len(),
            },
            "asserts": self.asserts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ArtifactData {
        let mut symbols = SymbolTable::new();
        symbols.intern("a");
        ArtifactData {
            name: "sample".into(),
            metadata: IndexMap::from_iter([("k".to_string(), "v".to_string())]),
            input_layout: Layout::struct_of([("a", Layout::Scalar)]),
            output_layout: Layout::Scalar,
            symbols,
            mappings: Vec::new(),
            resources: Vec::new(),
            subgraphs: Vec::new(),
            code: CodeObject {
                abi_version: ENTRY_ABI_VERSION,
                target: "x86_64-unknown-linux-gnu".into(),
                code: vec![0xc3],
            },
            relocs: vec![RelocEntry {
                offset: 0,
                kind: RelocKind::Abs8,
                addend: 0,
                target: RelocTarget::Helper(HostCall::Exp),
            }],
            asserts: vec!["x must be positive".into()],
        }
    }

    #[test]
    fn container_round_trips() {
        let artifact = sample();
        let bytes = artifact.encode().unwrap();
        assert_eq!(&bytes[..4], b"jyfn");
        let round = ArtifactData::decode(&bytes).unwrap();
        assert_eq!(round.name, artifact.name);
        assert_eq!(round.input_layout, artifact.input_layout);
        assert_eq!(round.code.code, artifact.code.code);
        assert_eq!(round.relocs.len(), 1);
        assert_eq!(round.asserts, artifact.asserts);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = sample().encode().unwrap();
        bytes[0] = b'x';
        assert!(matches!(
            ArtifactData::decode(&bytes),
            Err(SerializationError::BadMagic)
        ));
    }

    #[test]
    fn truncation_is_detected() {
        let bytes = sample().encode().unwrap();
        for cut in [2, 8, 13, bytes.len() - 1] {
            assert!(matches!(
                ArtifactData::decode(&bytes[..cut]),
                Err(SerializationError::Truncated)
            ));
        }
    }

    #[test]
    fn unknown_sections_are_rejected() {
        let artifact = sample();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&99u32.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        assert!(matches!(
            ArtifactData::decode(&bytes),
            Err(SerializationError::UnknownSection(99))
        ));
        drop(artifact);
    }

    #[test]
    fn unsupported_versions_are_rejected() {
        let mut bytes = sample().encode().unwrap();
        bytes[4..8].copy_from_slice(&7u32.to_le_bytes());
        assert!(matches!(
            ArtifactData::decode(&bytes),
            Err(SerializationError::UnsupportedVersion(7))
        ));
    }
}
