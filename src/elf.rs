use crate::error::Result;
use anyhow::bail;
use bytemuck::Pod;
use bytemuck::Zeroable;
use object::LittleEndian;

pub(crate) type File<'data> = object::read::elf::ElfFile64<'data, LittleEndian, &'data [u8]>;
pub(crate) type Section<'data, 'file> =
    object::read::elf::ElfSection64<'data, 'file, LittleEndian, &'data [u8]>;
pub(crate) type Symbol<'data, 'file> =
    object::read::elf::ElfSymbol64<'data, 'file, LittleEndian, &'data [u8]>;

/// Virtual address of the first loadable segment. Like the linkers we aim to be compatible with, we
/// start a fair way above zero so that mixed-up file offsets and addresses are easy to spot.
pub(crate) const START_VADDR: u64 = 0x200000;

/// Where the dynamic loader lives on the systems we target.
pub(crate) const DEFAULT_INTERPRETER: &[u8] = b"/lib64/ld-linux-x86-64.so.2\0";

#[derive(Zeroable, Pod, Clone, Copy)]
#[repr(C)]
pub(crate) struct FileHeader {
    pub(crate) magic: [u8; 4],
    pub(crate) class: u8,
    pub(crate) data: u8,
    pub(crate) ei_version: u8,
    pub(crate) os_abi: u8,
    pub(crate) abi_version: u8,
    pub(crate) padding: [u8; 7],
    pub(crate) ty: u16,
    pub(crate) machine: u16,
    pub(crate) e_version: u32,
    pub(crate) entry_point: u64,
    pub(crate) program_header_offset: u64,
    pub(crate) section_header_offset: u64,
    pub(crate) flags: u32,
    pub(crate) ehsize: u16,
    pub(crate) program_header_entry_size: u16,
    pub(crate) program_header_num: u16,
    pub(crate) section_header_entry_size: u16,
    pub(crate) section_header_num: u16,
    pub(crate) section_names_index: u16,
}

#[derive(Zeroable, Pod, Clone, Copy)]
#[repr(C)]
pub(crate) struct ProgramHeader {
    pub(crate) segment_type: u32,
    pub(crate) flags: u32,
    pub(crate) offset: u64,
    pub(crate) virtual_addr: u64,
    pub(crate) physical_addr: u64,
    pub(crate) file_size: u64,
    pub(crate) mem_size: u64,
    pub(crate) alignment: u64,
}

#[derive(Zeroable, Pod, Clone, Copy)]
#[repr(C)]
pub(crate) struct SectionHeader {
    pub(crate) name: u32,
    pub(crate) ty: u32,
    pub(crate) flags: u64,
    pub(crate) address: u64,
    pub(crate) offset: u64,
    pub(crate) size: u64,
    pub(crate) link: u32,
    pub(crate) info: u32,
    pub(crate) alignment: u64,
    pub(crate) entsize: u64,
}

#[derive(Zeroable, Pod, Clone, Copy)]
#[repr(C)]
pub(crate) struct SymtabEntry {
    pub(crate) name: u32,
    pub(crate) info: u8,
    pub(crate) other: u8,
    pub(crate) shndx: u16,
    pub(crate) value: u64,
    pub(crate) size: u64,
}

#[derive(Zeroable, Pod, Clone, Copy)]
#[repr(C)]
pub(crate) struct Rela {
    pub(crate) address: u64,
    pub(crate) info: u64,
    pub(crate) addend: u64,
}

impl Rela {
    pub(crate) fn new(address: u64, r_type: u32, dynsym_idx: u32, addend: u64) -> Rela {
        Rela {
            address,
            info: (u64::from(dynsym_idx) << 32) | u64::from(r_type),
            addend,
        }
    }
}

#[derive(Zeroable, Pod, Clone, Copy)]
#[repr(C)]
pub(crate) struct DynamicEntry {
    pub(crate) tag: u64,
    pub(crate) value: u64,
}

/// Section flag bit values.
#[allow(unused)]
pub(crate) mod shf {
    pub(crate) const WRITE: u64 = 0x1;
    pub(crate) const ALLOC: u64 = 0x2;
    pub(crate) const EXECINSTR: u64 = 0x4;
    pub(crate) const MERGE: u64 = 0x10;
    pub(crate) const STRINGS: u64 = 0x20;
    pub(crate) const TLS: u64 = 0x400;
    pub(crate) const EXCLUDE: u64 = 0x8000_0000;
}

/// Section types.
#[allow(unused)]
pub(crate) mod sht {
    pub(crate) const NULL: u32 = 0x0;
    pub(crate) const PROGBITS: u32 = 0x1;
    pub(crate) const SYMTAB: u32 = 0x2;
    pub(crate) const STRTAB: u32 = 0x3;
    pub(crate) const RELA: u32 = 0x4;
    pub(crate) const HASH: u32 = 0x5;
    pub(crate) const DYNAMIC: u32 = 0x6;
    pub(crate) const NOBITS: u32 = 0x8;
    pub(crate) const REL: u32 = 0x9;
    pub(crate) const DYNSYM: u32 = 0xb;
    pub(crate) const INIT_ARRAY: u32 = 0xe;
    pub(crate) const FINI_ARRAY: u32 = 0xf;
    pub(crate) const GROUP: u32 = 0x11;
    pub(crate) const SYMTAB_SHNDX: u32 = 0x12;
}

#[allow(unused)]
#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
#[repr(u32)]
pub(crate) enum SegmentType {
    #[default]
    Null = 0,
    Load = 1,
    Dynamic = 2,
    Interp = 3,
    Phdr = 6,
    Tls = 7,
}

pub(crate) mod pf {
    pub(crate) const X: u32 = 1;
    pub(crate) const W: u32 = 2;
    pub(crate) const R: u32 = 4;
}

#[derive(Clone, Copy)]
#[repr(u64)]
pub(crate) enum DynamicTag {
    Null = 0,
    Needed = 1,
    PltRelSize = 2,
    PltGot = 3,
    Hash = 4,
    StrTab = 5,
    SymTab = 6,
    Rela = 7,
    RelaSize = 8,
    RelaEnt = 9,
    StrSize = 10,
    SymEnt = 11,
    JmpRel = 23,
    PltRel = 20,
}

/// Symbol bindings (high nibble of st_info).
#[allow(unused)]
pub(crate) mod stb {
    pub(crate) const LOCAL: u8 = 0;
    pub(crate) const GLOBAL: u8 = 1;
    pub(crate) const WEAK: u8 = 2;
}

/// Symbol types (low nibble of st_info).
#[allow(unused)]
pub(crate) mod stt {
    pub(crate) const NOTYPE: u8 = 0;
    pub(crate) const SECTION: u8 = 3;
    pub(crate) const FILE: u8 = 4;
    pub(crate) const TLS: u8 = 6;
    pub(crate) const GNU_IFUNC: u8 = 10;
}

pub(crate) const SHN_UNDEF: u16 = 0;
pub(crate) const SHN_ABS: u16 = 0xfff1;

pub(crate) const FILE_HEADER_SIZE: u16 = 0x40;
pub(crate) const PROGRAM_HEADER_SIZE: u16 = 0x38;
pub(crate) const SECTION_HEADER_SIZE: u16 = 0x40;

pub(crate) const GOT_ENTRY_SIZE: u64 = 0x8;
pub(crate) const PLT_ENTRY_SIZE: u64 = 0x10;
pub(crate) const RELA_ENTRY_SIZE: u64 = 0x18;
pub(crate) const SYMTAB_ENTRY_SIZE: u64 = core::mem::size_of::<SymtabEntry>() as u64;

/// Offset of the instruction that follows a PLT entry's indirect jump. The address written into a
/// .got.plt slot points here, which is what makes the push/jump tail reachable for lazy binding.
pub(crate) const PLT_JUMP_SIZE: u64 = 6;

pub(crate) const EM_X86_64: u16 = 62;
pub(crate) const ET_EXEC: u16 = 2;

const _ASSERTS: () = {
    assert!(FILE_HEADER_SIZE as usize == std::mem::size_of::<FileHeader>());
    assert!(PROGRAM_HEADER_SIZE as usize == std::mem::size_of::<ProgramHeader>());
    assert!(SECTION_HEADER_SIZE as usize == std::mem::size_of::<SectionHeader>());
    assert!(RELA_ENTRY_SIZE as usize == std::mem::size_of::<Rela>());
    assert!(SYMTAB_ENTRY_SIZE as usize == std::mem::size_of::<SymtabEntry>());
};

/// The relocation classes we know how to process. Anything else in an input file is a hard error
/// when we encounter it while copying sections.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RelocationKind {
    Absolute,
    Relative,
    Got,
    PltRelative,
    GotRelative,
    TlsGd,
    TlsLd,
    DtpOff,
    GotTpOff,
    TpOff,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct RelocationKindInfo {
    pub(crate) kind: RelocationKind,
    pub(crate) byte_size: usize,
}

impl RelocationKindInfo {
    pub(crate) fn from_raw(r_type: u32) -> Result<Self> {
        let (kind, size) = match r_type {
            rel::R_X86_64_64 => (RelocationKind::Absolute, 8),
            rel::R_X86_64_PC32 => (RelocationKind::Relative, 4),
            rel::R_X86_64_GOT32 => (RelocationKind::Got, 4),
            rel::R_X86_64_PLT32 => (RelocationKind::PltRelative, 4),
            rel::R_X86_64_GOTPCREL => (RelocationKind::GotRelative, 4),
            rel::R_X86_64_32 | rel::R_X86_64_32S => (RelocationKind::Absolute, 4),
            rel::R_X86_64_16 => (RelocationKind::Absolute, 2),
            rel::R_X86_64_PC16 => (RelocationKind::Relative, 2),
            rel::R_X86_64_8 => (RelocationKind::Absolute, 1),
            rel::R_X86_64_PC8 => (RelocationKind::Relative, 1),
            rel::R_X86_64_TLSGD => (RelocationKind::TlsGd, 4),
            rel::R_X86_64_TLSLD => (RelocationKind::TlsLd, 4),
            rel::R_X86_64_DTPOFF32 => (RelocationKind::DtpOff, 4),
            rel::R_X86_64_GOTTPOFF => (RelocationKind::GotTpOff, 4),
            rel::R_X86_64_GOTPCRELX | rel::R_X86_64_REX_GOTPCRELX => {
                (RelocationKind::GotRelative, 4)
            }
            rel::R_X86_64_TPOFF32 => (RelocationKind::TpOff, 4),
            _ => bail!("Unsupported relocation type {r_type}"),
        };
        Ok(Self {
            kind,
            byte_size: size,
        })
    }
}

#[allow(dead_code)]
pub(crate) mod rel {
    pub(crate) const R_X86_64_64: u32 = 1;
    pub(crate) const R_X86_64_PC32: u32 = 2;
    pub(crate) const R_X86_64_GOT32: u32 = 3;
    pub(crate) const R_X86_64_PLT32: u32 = 4;
    pub(crate) const R_X86_64_GLOB_DAT: u32 = 6;
    pub(crate) const R_X86_64_JUMP_SLOT: u32 = 7;
    pub(crate) const R_X86_64_GOTPCREL: u32 = 9;
    pub(crate) const R_X86_64_32: u32 = 10;
    pub(crate) const R_X86_64_32S: u32 = 11;
    pub(crate) const R_X86_64_16: u32 = 12;
    pub(crate) const R_X86_64_PC16: u32 = 13;
    pub(crate) const R_X86_64_8: u32 = 14;
    pub(crate) const R_X86_64_PC8: u32 = 15;
    pub(crate) const R_X86_64_TLSGD: u32 = 19;
    pub(crate) const R_X86_64_TLSLD: u32 = 20;
    pub(crate) const R_X86_64_DTPOFF32: u32 = 21;
    pub(crate) const R_X86_64_GOTTPOFF: u32 = 22;
    pub(crate) const R_X86_64_TPOFF32: u32 = 23;
    pub(crate) const R_X86_64_IRELATIVE: u32 = 37;
    pub(crate) const R_X86_64_GOTPCRELX: u32 = 41;
    pub(crate) const R_X86_64_REX_GOTPCRELX: u32 = 42;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relocation_classification() {
        let info = RelocationKindInfo::from_raw(rel::R_X86_64_PLT32).unwrap();
        assert_eq!(info.kind, RelocationKind::PltRelative);
        assert_eq!(info.byte_size, 4);
        let info = RelocationKindInfo::from_raw(rel::R_X86_64_64).unwrap();
        assert_eq!(info.kind, RelocationKind::Absolute);
        assert_eq!(info.byte_size, 8);
        assert!(RelocationKindInfo::from_raw(999).is_err());
    }
}
