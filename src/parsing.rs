//! Turns raw input bytes into per-file state: classified sections, interned global symbols,
//! COMDAT groups and mergeable-string pieces. Reading and hashing happens on multiple threads;
//! assigning IDs (symbols, output sections) is a single-threaded pass over the per-file results,
//! which keeps every ID a deterministic function of input order.

use crate::args::Args;
use crate::chunks::ChunkId;
use crate::chunks::ChunkKind;
use crate::chunks::Out;
use crate::elf;
use crate::error::Result;
use crate::file_kind::FileKind;
use crate::input_data::FileId;
use crate::input_data::InputBytes;
use crate::input_data::InputRef;
use crate::input_data::INTERNAL_FILE_ID;
use crate::merge::MergeableSection;
use crate::merge::PieceArena;
use crate::symbol_db::claim_key;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use crate::symbol_db::SymbolName;
use crate::symbol_db::INTERNAL_PRIORITY;
use anyhow::Context;
use object::Object;
use object::ObjectSection;
use object::ObjectSymbol;
use object::ObjectComdat;
use rayon::prelude::IndexedParallelIterator;
use rayon::prelude::IntoParallelIterator;
use rayon::prelude::IntoParallelRefMutIterator;
use rayon::prelude::ParallelIterator;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

pub(crate) enum LinkFile<'data> {
    Internal(InternalFile),
    Object(Box<ObjectFile<'data>>),
}

/// The pseudo-file that owns linker-synthesized symbols like `_end` and `__start_FOO`. It claims
/// them with the worst possible priority, so a definition in user code always wins the election.
pub(crate) struct InternalFile {
    pub(crate) defined: Vec<SymbolId>,
    /// `__start_X` / `__stop_X` references together with the section they resolve to.
    pub(crate) start_stop: Vec<(SymbolId, ChunkId, bool)>,
    pub(crate) global_symtab_size: u64,
    pub(crate) global_strtab_size: u64,
}

pub(crate) struct ObjectFile<'data> {
    pub(crate) input: InputRef<'data>,
    pub(crate) file_id: FileId,
    pub(crate) priority: u32,
    pub(crate) is_alive: AtomicBool,
    pub(crate) is_dso: bool,
    pub(crate) is_in_archive: bool,
    pub(crate) soname: Option<&'data [u8]>,
    pub(crate) object: Box<elf::File<'data>>,
    pub(crate) sections: Vec<SectionSlot>,
    pub(crate) merge_sections: Vec<MergeableSection<'data>>,
    /// Global symbol IDs, indexed by the file's own symbol table index. None for locals.
    pub(crate) symbols: Vec<Option<SymbolId>>,
    /// For shared objects: the dynamic symbols this file defines, with their weak bit.
    pub(crate) dso_defs: Vec<(SymbolId, bool)>,
    pub(crate) comdat_groups: Vec<ComdatGroup<'data>>,
    pub(crate) common: Option<CommonChunk>,

    // Synthetic-section slots, filled in while scanning relocations.
    pub(crate) num_got: u32,
    pub(crate) num_plt: u32,
    pub(crate) num_gotplt: u32,
    pub(crate) num_relplt: u32,
    pub(crate) num_reldyn: u32,
    pub(crate) got_offset: u64,
    pub(crate) gotplt_offset: u64,
    pub(crate) plt_offset: u64,
    pub(crate) relplt_offset: u64,
    pub(crate) reldyn_offset: u64,
    pub(crate) dynsyms: Vec<SymbolId>,
    pub(crate) soname_offset: u64,

    pub(crate) local_symtab_size: u64,
    pub(crate) local_strtab_size: u64,
    pub(crate) global_symtab_size: u64,
    pub(crate) global_strtab_size: u64,
}

/// A section, but where we may or may not have decided to load it.
pub(crate) enum SectionSlot {
    Discard,
    Loaded(InputChunk),
    MergeStrings(usize),
}

pub(crate) struct InputChunk {
    pub(crate) osec: ChunkId,
    pub(crate) sh_type: u32,
    pub(crate) sh_flags: u64,
    pub(crate) sh_size: u64,
    pub(crate) sh_addralign: u64,
    /// Offset within the output section. Written by the offset-assignment phase, which fans out
    /// over output sections, so it has to be atomic even though each chunk has a single writer.
    pub(crate) offset: AtomicU64,
}

pub(crate) struct ComdatGroup<'data> {
    pub(crate) signature: &'data [u8],
    pub(crate) sections: Vec<usize>,
}

/// Common symbols a file owns, converted into a synthesized .bss chunk after resolution.
pub(crate) struct CommonChunk {
    pub(crate) slot: usize,
    pub(crate) symbols: Vec<(SymbolId, u64)>,
}

const SYNTHETIC_SYMBOLS: &[&str] = &[
    "__bss_start",
    "__ehdr_start",
    "__rela_iplt_start",
    "__rela_iplt_end",
    "__init_array_start",
    "__init_array_end",
    "__fini_array_start",
    "__fini_array_end",
    "_end",
    "end",
    "_etext",
    "etext",
    "_edata",
    "edata",
    "_GLOBAL_OFFSET_TABLE_",
];

struct ParsedInput<'data> {
    input: InputRef<'data>,
    object: Box<elf::File<'data>>,
    is_dso: bool,
    is_in_archive: bool,
    priority: u32,
    sections: Vec<ParsedSection<'data>>,
    /// (symbol table index, name) of each global, in symbol table order.
    pending_globals: Vec<(usize, SymbolName<'data>)>,
    dso_defs: Vec<(SymbolName<'data>, bool)>,
    comdats: Vec<ComdatGroup<'data>>,
    soname: Option<&'data [u8]>,
    num_symbols: usize,
}

enum ParsedSection<'data> {
    Discard,
    Regular {
        name: &'data [u8],
        sh_type: u32,
        sh_flags: u64,
        size: u64,
        align: u64,
    },
    Merge {
        name: &'data [u8],
        sh_flags: u64,
        align: u64,
        /// (input offset, bytes, hash) for each null-terminated piece.
        pieces: Vec<(u64, &'data [u8], u64)>,
    },
}

#[tracing::instrument(skip_all, name = "Parse input files")]
pub(crate) fn parse_input_files<'data>(
    inputs: &'data [InputBytes<'data>],
    args: &'data Args,
    arena: &'data PieceArena<'data>,
    out: &mut Out<'data>,
) -> Result<(SymbolDb<'data>, Vec<LinkFile<'data>>)> {
    // Priorities decide every resolver tie-break: non-archive files in command-line order come
    // first, archive members in discovery order after them.
    let mut priorities = vec![0u32; inputs.len()];
    let mut next = 1;
    for (priority, input) in priorities.iter_mut().zip(inputs) {
        if !input.is_in_archive {
            *priority = next;
            next += 1;
        }
    }
    for (priority, input) in priorities.iter_mut().zip(inputs) {
        if input.is_in_archive {
            *priority = next;
            next += 1;
        }
    }

    let parsed = inputs
        .into_par_iter()
        .zip(priorities)
        .map(|(input, priority)| {
            parse_object(input, priority)
                .with_context(|| format!("Failed to parse {}", input.input))
        })
        .collect::<Result<Vec<ParsedInput>>>()?;

    let mut db = SymbolDb::new();
    let mut files = Vec::with_capacity(parsed.len() + 1);
    files.push(LinkFile::Internal(create_internal_file(&mut db, args)?));
    let mut merge_serial = 0;
    let mut start_stop_refs = Vec::new();
    for p in parsed {
        let file_id = FileId::new(files.len() as u32);
        let file = assemble_file(
            p,
            file_id,
            &mut db,
            out,
            &mut merge_serial,
            &mut start_stop_refs,
        )?;
        files.push(LinkFile::Object(Box::new(file)));
    }
    db.mark_traced(&args.trace_symbols)?;
    register_pieces(&mut files, out, arena);
    resolve_start_stop_refs(start_stop_refs, &mut files, &db, out);
    Ok((db, files))
}

fn parse_object<'data>(input: &'data InputBytes<'data>, priority: u32) -> Result<ParsedInput<'data>> {
    let object = Box::new(elf::File::parse(input.data)?);
    let is_dso = input.kind == FileKind::ElfDynamic;

    let mut num_sections = 0;
    for section in object.sections() {
        num_sections = num_sections.max(section.index().0 + 1);
    }
    let mut sections = Vec::new();
    sections.resize_with(num_sections, || ParsedSection::Discard);
    if !is_dso {
        for section in object.sections() {
            sections[section.index().0] = classify_section(&section)?;
        }
    }

    let mut num_symbols = 0;
    let mut pending_globals = Vec::new();
    let mut dso_defs = Vec::new();
    if is_dso {
        for symbol in object.dynamic_symbols() {
            if symbol.is_undefined() || symbol.is_local() {
                continue;
            }
            let name = symbol.name_bytes()?;
            dso_defs.push((SymbolName::new(name), symbol.is_weak()));
        }
    } else {
        for symbol in object.symbols() {
            num_symbols = num_symbols.max(symbol.index().0 + 1);
            if symbol.is_local() {
                continue;
            }
            let name = symbol.name_bytes()?;
            if name.is_empty() {
                continue;
            }
            pending_globals.push((symbol.index().0, SymbolName::new(name)));
        }
    }

    let mut comdats = Vec::new();
    if !is_dso {
        for comdat in object.comdats() {
            comdats.push(ComdatGroup {
                signature: comdat.name_bytes()?,
                sections: comdat.sections().map(|index| index.0).collect(),
            });
        }
    }

    let soname = is_dso
        .then(|| dso_soname(&object, input))
        .flatten();

    Ok(ParsedInput {
        input: input.input,
        object,
        is_dso,
        is_in_archive: input.is_in_archive,
        priority,
        sections,
        pending_globals,
        dso_defs,
        comdats,
        soname,
        num_symbols,
    })
}

fn classify_section<'data>(section: &elf::Section<'data, '_>) -> Result<ParsedSection<'data>> {
    let name = section.name_bytes().unwrap_or_default();
    let object::SectionFlags::Elf { sh_flags } = section.flags() else {
        unreachable!();
    };
    if sh_flags & elf::shf::EXCLUDE != 0 || sh_flags & elf::shf::ALLOC == 0 {
        return Ok(ParsedSection::Discard);
    }
    let nobits = matches!(
        section.kind(),
        object::SectionKind::UninitializedData | object::SectionKind::UninitializedTls
    );
    let is_merge_strings = sh_flags & elf::shf::MERGE != 0
        && sh_flags & elf::shf::STRINGS != 0
        && sh_flags & elf::shf::WRITE == 0;
    if is_merge_strings && !nobits {
        let mut pieces = Vec::new();
        let mut offset = 0u64;
        let mut remaining = section.data()?;
        while !remaining.is_empty() {
            let len = memchr::memchr(0, remaining)
                .map(|i| i + 1)
                .with_context(|| {
                    format!(
                        "String in section `{}` is not null-terminated",
                        String::from_utf8_lossy(name)
                    )
                })?;
            let (bytes, rest) = remaining.split_at(len);
            pieces.push((offset, bytes, crate::hash::hash_bytes(bytes)));
            offset += len as u64;
            remaining = rest;
        }
        return Ok(ParsedSection::Merge {
            name,
            sh_flags: sh_flags & (elf::shf::ALLOC | elf::shf::MERGE | elf::shf::STRINGS),
            align: section.align().max(1),
            pieces,
        });
    }
    let sh_type = if nobits {
        elf::sht::NOBITS
    } else if name.starts_with(b".init_array") {
        elf::sht::INIT_ARRAY
    } else if name.starts_with(b".fini_array") {
        elf::sht::FINI_ARRAY
    } else {
        elf::sht::PROGBITS
    };
    Ok(ParsedSection::Regular {
        name: output_section_name(name),
        sh_type,
        sh_flags: sh_flags
            & (elf::shf::WRITE | elf::shf::ALLOC | elf::shf::EXECINSTR | elf::shf::TLS),
        size: section.size(),
        align: section.align().max(1),
    })
}

/// Maps an input section name to the output section it lands in: well-known prefixes collapse
/// (`.text.foo` goes into `.text`), anything else keeps its own name.
fn output_section_name(name: &[u8]) -> &[u8] {
    const PREFIXES: &[&[u8]] = &[
        b".text",
        b".data.rel.ro",
        b".data",
        b".rodata",
        b".bss",
        b".init_array",
        b".fini_array",
        b".tbss",
        b".tdata",
    ];
    for prefix in PREFIXES {
        if name == *prefix
            || (name.starts_with(prefix) && name.get(prefix.len()) == Some(&b'.'))
        {
            return prefix;
        }
    }
    name
}

fn dso_soname<'data>(object: &elf::File<'data>, input: &'data InputBytes<'data>) -> Option<&'data [u8]> {
    const DT_SONAME: u64 = 14;
    let dynamic = object.section_by_name(".dynamic")?;
    let dynstr = object.section_by_name(".dynstr")?;
    let strings = dynstr.data().ok()?;
    for entry in dynamic.data().ok()?.chunks_exact(16) {
        let tag = u64::from_le_bytes(entry[..8].try_into().unwrap());
        let value = u64::from_le_bytes(entry[8..].try_into().unwrap()) as usize;
        if tag == DT_SONAME && value < strings.len() {
            let rest = &strings[value..];
            let end = memchr::memchr(0, rest).unwrap_or(rest.len());
            return Some(&rest[..end]);
        }
    }
    // No SONAME; fall back to the file name, which is what DT_NEEDED will record.
    input
        .input
        .file
        .filename
        .file_name()
        .map(|n| n.as_encoded_bytes())
}

fn assemble_file<'data>(
    parsed: ParsedInput<'data>,
    file_id: FileId,
    db: &mut SymbolDb<'data>,
    out: &mut Out<'data>,
    merge_serial: &mut u32,
    start_stop_refs: &mut Vec<SymbolId>,
) -> Result<ObjectFile<'data>> {
    let mut merge_sections = Vec::new();
    let sections = parsed
        .sections
        .into_iter()
        .map(|section| match section {
            ParsedSection::Discard => SectionSlot::Discard,
            ParsedSection::Regular {
                name,
                sh_type,
                sh_flags,
                size,
                align,
            } => SectionSlot::Loaded(InputChunk {
                osec: out.add_regular_section(name, sh_type, sh_flags),
                sh_type,
                sh_flags,
                sh_size: size,
                sh_addralign: align,
                offset: AtomicU64::new(0),
            }),
            ParsedSection::Merge {
                name,
                sh_flags,
                align,
                pieces,
            } => {
                let parent = out.add_merged_section(name, elf::sht::PROGBITS, sh_flags, 1);
                let mut isec =
                    MergeableSection::new(parent, *merge_serial, parsed.priority, align);
                *merge_serial += 1;
                isec.piece_offsets = pieces.iter().map(|(offset, _, _)| *offset).collect();
                isec.pending = pieces
                    .into_iter()
                    .map(|(_, bytes, hash)| (bytes, hash))
                    .collect();
                merge_sections.push(isec);
                SectionSlot::MergeStrings(merge_sections.len() - 1)
            }
        })
        .collect();

    let mut symbols = vec![None; parsed.num_symbols];
    for (index, name) in parsed.pending_globals {
        let id = db.add_symbol(name)?;
        if name.bytes().starts_with(b"__start_") || name.bytes().starts_with(b"__stop_") {
            start_stop_refs.push(id);
        }
        symbols[index] = Some(id);
    }
    let dso_defs = parsed
        .dso_defs
        .into_iter()
        .map(|(name, weak)| Ok((db.add_symbol(name)?, weak)))
        .collect::<Result<Vec<_>>>()?;

    Ok(ObjectFile {
        input: parsed.input,
        file_id,
        priority: parsed.priority,
        is_alive: AtomicBool::new(!parsed.is_in_archive),
        is_dso: parsed.is_dso,
        is_in_archive: parsed.is_in_archive,
        soname: parsed.soname,
        object: parsed.object,
        sections,
        merge_sections,
        symbols,
        dso_defs,
        comdat_groups: parsed.comdats,
        common: None,
        num_got: 0,
        num_plt: 0,
        num_gotplt: 0,
        num_relplt: 0,
        num_reldyn: 0,
        got_offset: 0,
        gotplt_offset: 0,
        plt_offset: 0,
        relplt_offset: 0,
        reldyn_offset: 0,
        dynsyms: Vec::new(),
        soname_offset: 0,
        local_symtab_size: 0,
        local_strtab_size: 0,
        global_symtab_size: 0,
        global_strtab_size: 0,
    })
}

fn create_internal_file<'data>(db: &mut SymbolDb<'data>, args: &Args) -> Result<InternalFile> {
    let mut defined = Vec::new();
    let mut add = |db: &mut SymbolDb<'data>, name: &'static str| -> Result<()> {
        let id = db.add_symbol(SymbolName::new(name.as_bytes()))?;
        db.symbol(id)
            .try_claim(claim_key(true, INTERNAL_PRIORITY, INTERNAL_FILE_ID));
        defined.push(id);
        Ok(())
    };
    for name in SYNTHETIC_SYMBOLS {
        add(db, name)?;
    }
    if !args.is_static {
        add(db, "_DYNAMIC")?;
    }
    Ok(InternalFile {
        defined,
        start_stop: Vec::new(),
        global_symtab_size: 0,
        global_strtab_size: 0,
    })
}

/// Interns every mergeable section's pieces into its parent's concurrent map. Dead archive members
/// participate too: a piece first seen in a dead file is still deduplicated correctly when a live
/// file contains the same bytes, and pieces only dead files contain are never elected an owner.
fn register_pieces<'data>(
    files: &mut [LinkFile<'data>],
    out: &Out<'data>,
    arena: &'data PieceArena<'data>,
) {
    files.par_iter_mut().for_each(|file| {
        let LinkFile::Object(obj) = file else { return };
        for isec in &mut obj.merge_sections {
            let ChunkKind::Merged(merged) = &out.chunk(isec.parent).kind else {
                unreachable!();
            };
            isec.pieces = isec
                .pending
                .drain(..)
                .map(|(bytes, hash)| merged.intern_piece(arena, bytes, hash))
                .collect();
        }
    });
}

/// Binds `__start_X` / `__stop_X` references to the output section named `X`, if there is one.
/// References that don't match a section are left unclaimed: weak ones become absolute zero later,
/// strong ones surface as undefined-symbol errors.
fn resolve_start_stop_refs<'data>(
    mut refs: Vec<SymbolId>,
    files: &mut [LinkFile<'data>],
    db: &SymbolDb<'data>,
    out: &Out<'data>,
) {
    refs.sort_unstable();
    refs.dedup();
    let LinkFile::Internal(internal) = &mut files[0] else {
        unreachable!();
    };
    for sym_id in refs {
        let name = db.symbol_name(sym_id);
        let (section_name, is_start) = if let Some(s) = name.bytes().strip_prefix(b"__start_") {
            (s, true)
        } else if let Some(s) = name.bytes().strip_prefix(b"__stop_") {
            (s, false)
        } else {
            continue;
        };
        let found = out
            .regular_ids
            .iter()
            .chain(&out.merged_ids)
            .find(|id| out.chunk(**id).name == section_name);
        if let Some(&chunk_id) = found {
            db.symbol(sym_id)
                .try_claim(claim_key(true, INTERNAL_PRIORITY, INTERNAL_FILE_ID));
            internal.defined.push(sym_id);
            internal.start_stop.push((sym_id, chunk_id, is_start));
        }
    }
}

impl<'data> LinkFile<'data> {
    pub(crate) fn as_object(&self) -> Option<&ObjectFile<'data>> {
        match self {
            LinkFile::Object(obj) => Some(obj),
            LinkFile::Internal(_) => None,
        }
    }

    pub(crate) fn as_object_mut(&mut self) -> Option<&mut ObjectFile<'data>> {
        match self {
            LinkFile::Object(obj) => Some(obj),
            LinkFile::Internal(_) => None,
        }
    }
}

impl<'data> ObjectFile<'data> {
    pub(crate) fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::Acquire)
    }

    pub(crate) fn elf_symbol(&self, index: usize) -> Result<elf::Symbol<'data, '_>> {
        Ok(self.object.symbol_by_index(object::SymbolIndex(index))?)
    }

    /// Iterates over (symbol table index, symbol ID) for this file's global symbols.
    pub(crate) fn global_symbols(&self) -> impl Iterator<Item = (usize, SymbolId)> + '_ {
        self.symbols
            .iter()
            .enumerate()
            .filter_map(|(index, id)| id.map(|id| (index, id)))
    }

    /// The globals this file won the ownership election for, including any a shared object
    /// defines, in symbol table order.
    pub(crate) fn owned_symbols(&self, db: &SymbolDb) -> Vec<SymbolId> {
        self.global_symbols()
            .map(|(_, id)| id)
            .chain(self.dso_defs.iter().map(|&(id, _)| id))
            .filter(|&id| db.symbol(id).is_owned_by(self.file_id))
            .collect()
    }

    pub(crate) fn section_chunk(&self, slot: usize) -> Option<&InputChunk> {
        match self.sections.get(slot) {
            Some(SectionSlot::Loaded(chunk)) => Some(chunk),
            _ => None,
        }
    }

    /// Address of a symbol defined in this file, resolved through its section slot. Doesn't handle
    /// common symbols; those are converted to .bss chunks before addresses are needed.
    pub(crate) fn input_symbol_address(
        &self,
        esym: &elf::Symbol<'data, '_>,
        out: &Out<'data>,
    ) -> Result<u64> {
        match esym.section() {
            object::SymbolSection::Absolute => Ok(esym.address()),
            object::SymbolSection::Section(section_index) => {
                match self.sections.get(section_index.0) {
                    Some(SectionSlot::Loaded(chunk)) => Ok(out.chunk(chunk.osec).hdr.sh_addr
                        + chunk.offset.load(Ordering::Relaxed)
                        + esym.address()),
                    Some(SectionSlot::MergeStrings(merge_index)) => {
                        let isec = &self.merge_sections[*merge_index];
                        let (piece, delta) =
                            isec.resolve_offset(esym.address()).with_context(|| {
                                format!(
                                    "Symbol in merged section points outside any piece in {}",
                                    self.input
                                )
                            })?;
                        Ok(out.chunk(isec.parent).hdr.sh_addr + piece.final_offset() + delta)
                    }
                    _ => Ok(0),
                }
            }
            _ => Ok(0),
        }
    }

    /// Section header index the symbol should carry in the output symbol table.
    pub(crate) fn input_symbol_shndx(&self, esym: &elf::Symbol<'data, '_>, out: &Out<'data>) -> u16 {
        match esym.section() {
            object::SymbolSection::Absolute => elf::SHN_ABS,
            object::SymbolSection::Section(section_index) => match self.sections.get(section_index.0)
            {
                Some(SectionSlot::Loaded(chunk)) => out.chunk(chunk.osec).shndx as u16,
                Some(SectionSlot::MergeStrings(merge_index)) => {
                    out.chunk(self.merge_sections[*merge_index].parent).shndx as u16
                }
                _ => elf::SHN_UNDEF,
            },
            _ => elf::SHN_UNDEF,
        }
    }

    /// Whether an input local symbol gets an entry in the output .symtab.
    pub(crate) fn should_emit_local(&self, esym: &elf::Symbol<'data, '_>) -> bool {
        if !esym.is_local() {
            return false;
        }
        let Ok(name) = esym.name_bytes() else {
            return false;
        };
        if name.is_empty() {
            return false;
        }
        let st_type = match esym.flags() {
            object::SymbolFlags::Elf { st_info, .. } => st_info & 0xf,
            _ => 0,
        };
        if st_type == elf::stt::SECTION || st_type == elf::stt::FILE {
            return false;
        }
        match esym.section() {
            object::SymbolSection::Absolute => true,
            object::SymbolSection::Section(section_index) => matches!(
                self.sections.get(section_index.0),
                Some(SectionSlot::Loaded(_) | SectionSlot::MergeStrings(_))
            ),
            _ => false,
        }
    }
}

impl<'data> std::fmt::Display for ObjectFile<'data> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.input, f)
    }
}

pub(crate) fn st_type(esym: &elf::Symbol) -> u8 {
    match esym.flags() {
        object::SymbolFlags::Elf { st_info, .. } => st_info & 0xf,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_section_name() {
        assert_eq!(output_section_name(b".text"), b".text");
        assert_eq!(output_section_name(b".text._Z3fooi"), b".text");
        assert_eq!(output_section_name(b".textual"), b".textual");
        assert_eq!(output_section_name(b".data.rel.ro.local"), b".data.rel.ro");
        assert_eq!(output_section_name(b".bss.foo"), b".bss");
        assert_eq!(output_section_name(b"my_custom"), b"my_custom");
    }
}
