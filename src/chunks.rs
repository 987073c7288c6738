//! The model of the output file: a flat list of output chunks, each of which is either a header,
//! a section assembled from input sections, a merged-strings section or one of the synthetic
//! tables we generate ourselves. Phases dispatch on the chunk kind rather than via virtual calls,
//! so each phase can pattern-match just the chunks it cares about.

use crate::args::Args;
use crate::elf;
use crate::input_data::FileId;
use crate::merge::MergedSection;
use crate::symbol_db::SymbolId;
use ahash::AHashMap;

/// Index of a chunk within `Out::chunks`. Stable for the whole link; ordering decisions live in
/// `Out::order` instead of reshuffling the chunk list itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct ChunkId(u32);

impl ChunkId {
    pub(crate) fn from_usize(value: usize) -> ChunkId {
        ChunkId(value as u32)
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Our working copy of an output section header. Field meanings follow the ELF section header of
/// the same name.
#[derive(Default, Clone, Copy, Debug)]
pub(crate) struct SecHeader {
    pub(crate) sh_type: u32,
    pub(crate) sh_flags: u64,
    pub(crate) sh_addr: u64,
    pub(crate) sh_offset: u64,
    pub(crate) sh_size: u64,
    pub(crate) sh_addralign: u64,
    pub(crate) sh_entsize: u64,
    pub(crate) sh_link: u32,
    pub(crate) sh_info: u32,
}

pub(crate) struct OutputChunk<'data> {
    pub(crate) name: &'data [u8],
    pub(crate) hdr: SecHeader,
    /// Output section header index. Zero for chunks that don't get a section header (the file
    /// header, program header table and section header table).
    pub(crate) shndx: u32,
    /// Offset of this chunk's name within .shstrtab.
    pub(crate) name_offset: u32,
    /// Whether this chunk is the first of a PT_LOAD segment.
    pub(crate) starts_load: bool,
    pub(crate) kind: ChunkKind<'data>,
}

pub(crate) enum ChunkKind<'data> {
    Ehdr,
    Phdr,
    Shdr,
    Regular(RegularSection),
    Merged(MergedSection<'data>),
    Got,
    GotPlt,
    Plt,
    RelPlt,
    RelDyn,
    Dynsym(DynsymSection),
    Dynstr(DynstrSection),
    Interp,
    Dynamic,
    Hash,
    Symtab,
    Strtab,
    Shstrtab(ShstrtabSection),
}

/// Reference to an input chunk: a slot within a particular file.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Member {
    pub(crate) file: FileId,
    pub(crate) slot: usize,
}

#[derive(Default)]
pub(crate) struct RegularSection {
    pub(crate) members: Vec<Member>,
}

#[derive(Default)]
pub(crate) struct DynsymSection {
    /// Per-file batches appended in input order during relocation scanning.
    pub(crate) syms: Vec<SymbolId>,
    /// Offset of each symbol's name within .dynstr, parallel to `syms`.
    pub(crate) name_offsets: Vec<u32>,
}

#[derive(Default)]
pub(crate) struct DynstrSection {
    /// Dynamic symbol names. SONAMEs precede this blob and are written separately at each file's
    /// precomputed offset.
    pub(crate) names: Vec<u8>,
    /// Where `names` starts within the section.
    pub(crate) names_offset: u64,
}

#[derive(Default)]
pub(crate) struct ShstrtabSection {
    pub(crate) bytes: Vec<u8>,
}

#[derive(Hash, PartialEq, Eq, Clone, Copy)]
struct SectionKey<'data> {
    name: &'data [u8],
    sh_type: u32,
    sh_flags: u64,
}

/// A loadable segment: its program-header type and flags plus the chunks it spans, in output
/// order.
pub(crate) struct Segment {
    pub(crate) p_type: elf::SegmentType,
    pub(crate) p_flags: u32,
    pub(crate) chunks: Vec<ChunkId>,
}

/// Everything we know about the output file. One of these is threaded by reference through all
/// phases of the link.
pub(crate) struct Out<'data> {
    pub(crate) chunks: Vec<OutputChunk<'data>>,
    /// Chunk IDs in output order. Computed by the layout phase.
    pub(crate) order: Vec<ChunkId>,
    pub(crate) segments: Vec<Segment>,

    pub(crate) ehdr: ChunkId,
    pub(crate) phdr: ChunkId,
    pub(crate) shdr: ChunkId,
    pub(crate) got: ChunkId,
    pub(crate) gotplt: ChunkId,
    pub(crate) plt: ChunkId,
    pub(crate) relplt: ChunkId,
    pub(crate) symtab: ChunkId,
    pub(crate) strtab: ChunkId,
    pub(crate) shstrtab: ChunkId,

    pub(crate) interp: Option<ChunkId>,
    pub(crate) dynamic: Option<ChunkId>,
    pub(crate) reldyn: Option<ChunkId>,
    pub(crate) dynsym: Option<ChunkId>,
    pub(crate) dynstr: Option<ChunkId>,
    pub(crate) hash: Option<ChunkId>,

    pub(crate) regular_ids: Vec<ChunkId>,
    pub(crate) merged_ids: Vec<ChunkId>,
    by_key: AHashMap<SectionKey<'data>, ChunkId>,

    /// One byte past the end of the TLS image, to which TP-relative offsets are anchored.
    pub(crate) tls_end: u64,
    pub(crate) filesize: u64,
    pub(crate) entry_address: u64,
}

impl<'data> Out<'data> {
    pub(crate) fn new(args: &Args) -> Out<'data> {
        let mut chunks = Vec::new();
        let mut add = |name: &'data [u8], hdr: SecHeader, kind: ChunkKind<'data>| {
            let id = ChunkId(chunks.len() as u32);
            chunks.push(OutputChunk {
                name,
                hdr,
                shndx: 0,
                name_offset: 0,
                starts_load: false,
                kind,
            });
            id
        };
        let header = |sh_type, sh_flags, sh_addralign, sh_entsize| SecHeader {
            sh_type,
            sh_flags,
            sh_addralign,
            sh_entsize,
            ..Default::default()
        };

        let ehdr = add(
            b"",
            SecHeader {
                sh_flags: elf::shf::ALLOC,
                sh_size: u64::from(elf::FILE_HEADER_SIZE),
                sh_addralign: 8,
                ..Default::default()
            },
            ChunkKind::Ehdr,
        );
        let phdr = add(
            b"",
            SecHeader {
                sh_flags: elf::shf::ALLOC,
                sh_addralign: 8,
                ..Default::default()
            },
            ChunkKind::Phdr,
        );
        let shdr = add(b"", header(elf::sht::NULL, 0, 8, 0), ChunkKind::Shdr);
        let got = add(
            b".got",
            header(
                elf::sht::PROGBITS,
                elf::shf::ALLOC | elf::shf::WRITE,
                elf::GOT_ENTRY_SIZE,
                0,
            ),
            ChunkKind::Got,
        );
        let gotplt = add(
            b".got.plt",
            header(
                elf::sht::PROGBITS,
                elf::shf::ALLOC | elf::shf::WRITE,
                elf::GOT_ENTRY_SIZE,
                0,
            ),
            ChunkKind::GotPlt,
        );
        let plt = add(
            b".plt",
            header(
                elf::sht::PROGBITS,
                elf::shf::ALLOC | elf::shf::EXECINSTR,
                16,
                elf::PLT_ENTRY_SIZE,
            ),
            ChunkKind::Plt,
        );
        let relplt = add(
            b".rela.plt",
            header(
                elf::sht::RELA,
                elf::shf::ALLOC,
                8,
                elf::RELA_ENTRY_SIZE,
            ),
            ChunkKind::RelPlt,
        );
        let symtab = add(
            b".symtab",
            header(elf::sht::SYMTAB, 0, 8, elf::SYMTAB_ENTRY_SIZE),
            ChunkKind::Symtab,
        );
        let strtab = add(
            b".strtab",
            header(elf::sht::STRTAB, 0, 1, 0),
            ChunkKind::Strtab,
        );
        let shstrtab = add(
            b".shstrtab",
            header(elf::sht::STRTAB, 0, 1, 0),
            ChunkKind::Shstrtab(ShstrtabSection::default()),
        );

        let mut interp = None;
        let mut dynamic = None;
        let mut reldyn = None;
        let mut dynsym = None;
        let mut dynstr = None;
        let mut hash = None;
        if !args.is_static {
            interp = Some(add(
                b".interp",
                SecHeader {
                    sh_type: elf::sht::PROGBITS,
                    sh_flags: elf::shf::ALLOC,
                    sh_size: elf::DEFAULT_INTERPRETER.len() as u64,
                    sh_addralign: 1,
                    ..Default::default()
                },
                ChunkKind::Interp,
            ));
            dynamic = Some(add(
                b".dynamic",
                header(
                    elf::sht::DYNAMIC,
                    elf::shf::ALLOC | elf::shf::WRITE,
                    8,
                    core::mem::size_of::<elf::DynamicEntry>() as u64,
                ),
                ChunkKind::Dynamic,
            ));
            reldyn = Some(add(
                b".rela.dyn",
                header(elf::sht::RELA, elf::shf::ALLOC, 8, elf::RELA_ENTRY_SIZE),
                ChunkKind::RelDyn,
            ));
            dynsym = Some(add(
                b".dynsym",
                header(
                    elf::sht::DYNSYM,
                    elf::shf::ALLOC,
                    8,
                    elf::SYMTAB_ENTRY_SIZE,
                ),
                ChunkKind::Dynsym(DynsymSection::default()),
            ));
            dynstr = Some(add(
                b".dynstr",
                header(elf::sht::STRTAB, elf::shf::ALLOC, 1, 0),
                ChunkKind::Dynstr(DynstrSection::default()),
            ));
            hash = Some(add(
                b".hash",
                header(elf::sht::HASH, elf::shf::ALLOC, 4, 4),
                ChunkKind::Hash,
            ));
        }

        Out {
            chunks,
            order: Vec::new(),
            segments: Vec::new(),
            ehdr,
            phdr,
            shdr,
            got,
            gotplt,
            plt,
            relplt,
            symtab,
            strtab,
            shstrtab,
            interp,
            dynamic,
            reldyn,
            dynsym,
            dynstr,
            hash,
            regular_ids: Vec::new(),
            merged_ids: Vec::new(),
            by_key: AHashMap::new(),
            tls_end: 0,
            filesize: 0,
            entry_address: 0,
        }
    }

    pub(crate) fn chunk(&self, id: ChunkId) -> &OutputChunk<'data> {
        &self.chunks[id.as_usize()]
    }

    pub(crate) fn chunk_mut(&mut self, id: ChunkId) -> &mut OutputChunk<'data> {
        &mut self.chunks[id.as_usize()]
    }

    /// An output section's identity is its (name, type, flags) tuple. Two input sections with the
    /// same tuple land in the same output section.
    pub(crate) fn add_regular_section(
        &mut self,
        name: &'data [u8],
        sh_type: u32,
        sh_flags: u64,
    ) -> ChunkId {
        let key = SectionKey {
            name,
            sh_type,
            sh_flags,
        };
        if let Some(&id) = self.by_key.get(&key) {
            return id;
        }
        let id = ChunkId(self.chunks.len() as u32);
        self.chunks.push(OutputChunk {
            name,
            hdr: SecHeader {
                sh_type,
                sh_flags,
                ..Default::default()
            },
            shndx: 0,
            name_offset: 0,
            starts_load: false,
            kind: ChunkKind::Regular(RegularSection::default()),
        });
        self.by_key.insert(key, id);
        self.regular_ids.push(id);
        id
    }

    pub(crate) fn add_merged_section(
        &mut self,
        name: &'data [u8],
        sh_type: u32,
        sh_flags: u64,
        sh_entsize: u64,
    ) -> ChunkId {
        let key = SectionKey {
            name,
            sh_type,
            sh_flags,
        };
        if let Some(&id) = self.by_key.get(&key) {
            return id;
        }
        let id = ChunkId(self.chunks.len() as u32);
        self.chunks.push(OutputChunk {
            name,
            hdr: SecHeader {
                sh_type,
                sh_flags,
                sh_entsize,
                sh_addralign: 1,
                ..Default::default()
            },
            shndx: 0,
            name_offset: 0,
            starts_load: false,
            kind: ChunkKind::Merged(MergedSection::new()),
        });
        self.by_key.insert(key, id);
        self.merged_ids.push(id);
        id
    }

    /// How many entries the .dynamic section will contain. Must agree with the entries that
    /// `write` emits; debug-asserted there.
    pub(crate) fn dynamic_entry_count(&self, num_needed: usize) -> usize {
        let mut count = num_needed + 5 + 1; // HASH, STRTAB, SYMTAB, SYMENT, STRSZ and NULL
        if self
            .reldyn
            .is_some_and(|id| self.chunk(id).hdr.sh_size > 0)
        {
            count += 3; // RELA, RELASZ, RELAENT
        }
        if self.chunk(self.relplt).hdr.sh_size > 0 {
            count += 4; // JMPREL, PLTRELSZ, PLTREL, PLTGOT
        }
        count
    }

    pub(crate) fn merged_piece_count(&self) -> usize {
        self.merged_ids
            .iter()
            .map(|id| match &self.chunk(*id).kind {
                ChunkKind::Merged(m) => m.piece_count(),
                _ => 0,
            })
            .sum()
    }
}

impl<'data> OutputChunk<'data> {
    pub(crate) fn is_header(&self) -> bool {
        matches!(
            self.kind,
            ChunkKind::Ehdr | ChunkKind::Phdr | ChunkKind::Shdr
        )
    }

    pub(crate) fn is_nobits(&self) -> bool {
        self.hdr.sh_type == elf::sht::NOBITS
    }

    /// Bytes this chunk occupies in the file, as opposed to in memory.
    pub(crate) fn file_size(&self) -> u64 {
        if self.is_nobits() {
            0
        } else {
            self.hdr.sh_size
        }
    }
}
