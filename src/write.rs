//! Writes the output file. The buffer is a shared read-write mapping of the created file; each
//! phase carves it into disjoint mutable slices (one per chunk, or one per file's portion of a
//! synthetic table), which lets the copies fan out with no synchronization.

use crate::args::Args;
use crate::bin_sections::input_chunk;
use crate::chunks::ChunkId;
use crate::chunks::ChunkKind;
use crate::chunks::DynsymSection;
use crate::chunks::Out;
use crate::chunks::RegularSection;
use crate::elf;
use crate::elf::RelocationKind;
use crate::elf::RelocationKindInfo;
use crate::error::Result;
use crate::input_data::FileId;
use crate::parsing::LinkFile;
use crate::parsing::ObjectFile;
use crate::symbol_db::Symbol;
use crate::symbol_db::SymbolDb;
use anyhow::bail;
use anyhow::Context;
use bytemuck::Zeroable;
use memmap2::MmapOptions;
use object::Object;
use object::ObjectSection;
use object::ObjectSymbol;
use rayon::prelude::IntoParallelIterator;
use rayon::prelude::ParallelIterator;
use std::path::Path;
use std::sync::atomic::Ordering;

pub(crate) struct Output {
    file: std::fs::File,
    mmap: memmap2::MmapMut,
}

impl Output {
    pub(crate) fn create(path: &Path, file_size: u64) -> Result<Output> {
        let _ = std::fs::remove_file(path);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("cannot open {}", path.display()))?;
        file.set_len(file_size)
            .with_context(|| format!("{}: failed to set file size", path.display()))?;
        let mmap = unsafe { MmapOptions::new().map_mut(&file) }
            .with_context(|| format!("{}: mmap failed", path.display()))?;
        Ok(Output { file, mmap })
    }
}

#[tracing::instrument(skip_all, name = "Write output file")]
pub(crate) fn write_output<'data>(
    files: &[LinkFile<'data>],
    db: &SymbolDb<'data>,
    out: &Out<'data>,
    args: &Args,
) -> Result {
    let mut output = Output::create(&args.output, out.filesize)?;
    if let Some(byte) = args.filler {
        output.mmap.fill(byte);
    }
    initialize_chunks(&mut output.mmap, files, out)?;
    copy_chunks(&mut output.mmap, files, db, out)?;
    write_got_plt(&mut output.mmap, files, db, out, args)?;
    write_dso_paths(&mut output.mmap, files, out);
    write_merged_strings(&mut output.mmap, files, out);
    write_symtab(&mut output.mmap, files, db, out)?;
    clear_padding(&mut output.mmap, out);
    make_executable(&output.file)?;
    // Dropping the mapping unmaps it; the kernel commits the written pages to the file.
    drop(output);
    Ok(())
}

/// Detaches the first `len` bytes from the front of `remaining` as an independent mutable slice.
/// Every writer phase uses this to hand workers non-overlapping regions of the output mapping.
fn take_prefix<'out>(remaining: &mut &'out mut [u8], len: usize) -> &'out mut [u8] {
    let buffer = core::mem::take(remaining);
    assert!(
        len <= buffer.len(),
        "output region needs {len} bytes but only {} are left",
        buffer.len()
    );
    let (region, rest) = buffer.split_at_mut(len);
    *remaining = rest;
    region
}

/// Everyone who can read the linked image gets to execute it: r bits shifted into the
/// corresponding x positions.
fn make_executable(file: &std::fs::File) -> Result {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = file.metadata()?.permissions();
    let mode = permissions.mode();
    let exec_bits = (mode & 0o444) >> 2;
    permissions.set_mode(mode | exec_bits);
    file.set_permissions(permissions)?;
    Ok(())
}

/// Splits the buffer into one mutable slice per chunk, in output order. NOBITS chunks get an empty
/// slice since they occupy no file bytes.
fn split_chunk_buffers<'out>(
    mut data: &'out mut [u8],
    out: &Out,
) -> Vec<(ChunkId, &'out mut [u8])> {
    let mut result = Vec::with_capacity(out.order.len());
    let mut pos = 0u64;
    for &id in &out.order {
        let chunk = out.chunk(id);
        let size = chunk.file_size();
        let padding = chunk.hdr.sh_offset.checked_sub(pos).expect("chunk offsets went backwards");
        take_prefix(&mut data, padding as usize);
        result.push((id, take_prefix(&mut data, size as usize)));
        pos = chunk.hdr.sh_offset + size;
    }
    result
}

/// Phase one of writing: fixed content whose bytes depend only on the layout (headers, the
/// interpreter path, the dynamic table).
fn initialize_chunks<'data>(buf: &mut [u8], files: &[LinkFile<'data>], out: &Out<'data>) -> Result {
    split_chunk_buffers(buf, out)
        .into_par_iter()
        .try_for_each(|(id, buffer)| -> Result {
            match &out.chunk(id).kind {
                ChunkKind::Ehdr => write_file_header(buffer, out),
                ChunkKind::Phdr => write_program_headers(buffer, out),
                ChunkKind::Interp => {
                    buffer.copy_from_slice(elf::DEFAULT_INTERPRETER);
                    Ok(())
                }
                ChunkKind::Dynamic => write_dynamic(buffer, files, out),
                _ => Ok(()),
            }
        })
}

/// Phase two: chunk payloads. Input sections copy their bytes and apply their relocations in
/// place.
fn copy_chunks<'data>(
    buf: &mut [u8],
    files: &[LinkFile<'data>],
    db: &SymbolDb<'data>,
    out: &Out<'data>,
) -> Result {
    split_chunk_buffers(buf, out)
        .into_par_iter()
        .try_for_each(|(id, buffer)| -> Result {
            let chunk = out.chunk(id);
            match &chunk.kind {
                ChunkKind::Regular(section) => {
                    copy_regular_section(section, chunk.hdr.sh_addr, chunk.is_nobits(), buffer, files, db, out)
                }
                ChunkKind::Shdr => write_section_headers(buffer, out),
                ChunkKind::Shstrtab(shstrtab) => {
                    buffer.copy_from_slice(&shstrtab.bytes);
                    Ok(())
                }
                ChunkKind::Dynsym(dynsym) => write_dynsym(buffer, dynsym, db),
                ChunkKind::Dynstr(dynstr) => {
                    buffer[..dynstr.names_offset as usize].fill(0);
                    buffer[dynstr.names_offset as usize..].copy_from_slice(&dynstr.names);
                    Ok(())
                }
                ChunkKind::Hash => write_hash(buffer, db, out),
                ChunkKind::Symtab | ChunkKind::Strtab => {
                    // Null entry / leading NUL; the per-file halves are written later.
                    let prefix = if matches!(chunk.kind, ChunkKind::Symtab) {
                        elf::SYMTAB_ENTRY_SIZE as usize
                    } else {
                        1
                    };
                    let prefix = prefix.min(buffer.len());
                    buffer[..prefix].fill(0);
                    Ok(())
                }
                _ => Ok(()),
            }
        })
}

fn copy_regular_section<'data>(
    section: &RegularSection,
    base_addr: u64,
    nobits: bool,
    mut buffer: &mut [u8],
    files: &[LinkFile<'data>],
    db: &SymbolDb<'data>,
    out: &Out<'data>,
) -> Result {
    if nobits {
        return Ok(());
    }
    let mut parts = Vec::with_capacity(section.members.len());
    let mut pos = 0u64;
    for member in &section.members {
        let input = input_chunk(files, member);
        let offset = input.offset.load(Ordering::Relaxed);
        take_prefix(&mut buffer, (offset - pos) as usize);
        parts.push((member, take_prefix(&mut buffer, input.sh_size as usize)));
        pos = offset + input.sh_size;
    }
    parts.into_par_iter().try_for_each(|(member, part)| {
        let obj = files[member.file.as_usize()].as_object().unwrap();
        copy_member(obj, member.slot, base_addr, part, files, db, out)
            .with_context(|| format!("Failed to copy section from {}", obj.input))
    })
}

fn copy_member<'data>(
    obj: &ObjectFile<'data>,
    slot: usize,
    section_base: u64,
    part: &mut [u8],
    files: &[LinkFile<'data>],
    db: &SymbolDb<'data>,
    out: &Out<'data>,
) -> Result {
    let input = obj.section_chunk(slot).unwrap();
    let section = obj.object.section_by_index(object::SectionIndex(slot))?;
    part.copy_from_slice(section.data()?);
    let base_addr = section_base + input.offset.load(Ordering::Relaxed);
    apply_relocations(obj, &section, base_addr, part, files, db, out)
}

fn apply_relocations<'data>(
    obj: &ObjectFile<'data>,
    section: &elf::Section<'data, '_>,
    base_addr: u64,
    part: &mut [u8],
    files: &[LinkFile<'data>],
    db: &SymbolDb<'data>,
    out: &Out<'data>,
) -> Result {
    for (offset, rel) in section.relocations() {
        let object::RelocationFlags::Elf { r_type } = rel.flags() else {
            unreachable!();
        };
        let info = RelocationKindInfo::from_raw(r_type)?;
        let object::RelocationTarget::Symbol(symbol_index) = rel.target() else {
            bail!("Unsupported relocation target for type {r_type}");
        };
        let addend = rel.addend();
        let place = base_addr + offset;
        let global = obj
            .symbols
            .get(symbol_index.0)
            .copied()
            .flatten()
            .map(|id| db.symbol(id));
        let value = match &global {
            Some(sym) => sym.address(),
            None => obj.input_symbol_address(&obj.elf_symbol(symbol_index.0)?, out)?,
        };
        let relocated = match info.kind {
            RelocationKind::Absolute => value.wrapping_add_signed(addend),
            RelocationKind::Relative => value.wrapping_add_signed(addend).wrapping_sub(place),
            RelocationKind::PltRelative => {
                let target = match &global {
                    Some(sym) if sym.plt_idx.load(Ordering::Relaxed) >= 0 => {
                        plt_entry_addr(sym, files, out)?
                    }
                    _ => value,
                };
                target.wrapping_add_signed(addend).wrapping_sub(place)
            }
            RelocationKind::Got => {
                let sym = global
                    .as_ref()
                    .context("GOT relocation against local symbol")?;
                got_slot_offset(sym, files)?.wrapping_add_signed(addend)
            }
            RelocationKind::GotRelative => {
                let sym = global
                    .as_ref()
                    .context("GOT relocation against local symbol")?;
                got_slot_addr(sym, files, out)?
                    .wrapping_add_signed(addend)
                    .wrapping_sub(place)
            }
            RelocationKind::GotTpOff => {
                let sym = global
                    .as_ref()
                    .context("GOTTPOFF relocation against local symbol")?;
                gottp_slot_addr(sym, files, out)?
                    .wrapping_add_signed(addend)
                    .wrapping_sub(place)
            }
            RelocationKind::TpOff => value.wrapping_add_signed(addend).wrapping_sub(out.tls_end),
            RelocationKind::TlsGd | RelocationKind::TlsLd | RelocationKind::DtpOff => {
                bail!("not implemented: relocation type {r_type}")
            }
        };
        write_relocated_value(part, offset as usize, info.byte_size, relocated)?;
    }
    Ok(())
}

fn write_relocated_value(part: &mut [u8], offset: usize, size: usize, value: u64) -> Result {
    let bytes = value.to_le_bytes();
    let target = part
        .get_mut(offset..offset + size)
        .context("relocation outside its section")?;
    target.copy_from_slice(&bytes[..size]);
    Ok(())
}

fn owner_object<'a, 'data>(
    sym: &Symbol,
    files: &'a [LinkFile<'data>],
) -> Result<&'a ObjectFile<'data>> {
    let owner = sym.owner_file().context("symbol has no owner")?;
    files[owner.as_usize()]
        .as_object()
        .context("synthetic symbol has no table slots")
}

fn got_slot_offset(sym: &Symbol, files: &[LinkFile]) -> Result<u64> {
    let idx = sym.got_idx.load(Ordering::Relaxed);
    if idx < 0 {
        bail!("symbol has no GOT slot");
    }
    Ok(owner_object(sym, files)?.got_offset + idx as u64 * elf::GOT_ENTRY_SIZE)
}

fn got_slot_addr(sym: &Symbol, files: &[LinkFile], out: &Out) -> Result<u64> {
    Ok(out.chunk(out.got).hdr.sh_addr + got_slot_offset(sym, files)?)
}

fn gottp_slot_addr(sym: &Symbol, files: &[LinkFile], out: &Out) -> Result<u64> {
    let idx = sym.gottp_idx.load(Ordering::Relaxed);
    if idx < 0 {
        bail!("symbol has no TP-offset GOT slot");
    }
    Ok(out.chunk(out.got).hdr.sh_addr
        + owner_object(sym, files)?.got_offset
        + idx as u64 * elf::GOT_ENTRY_SIZE)
}

fn gotplt_slot_addr(sym: &Symbol, files: &[LinkFile], out: &Out) -> Result<u64> {
    let idx = sym.gotplt_idx.load(Ordering::Relaxed);
    if idx < 0 {
        bail!("symbol has no .got.plt slot");
    }
    Ok(out.chunk(out.gotplt).hdr.sh_addr
        + owner_object(sym, files)?.gotplt_offset
        + idx as u64 * elf::GOT_ENTRY_SIZE)
}

fn plt_entry_addr(sym: &Symbol, files: &[LinkFile], out: &Out) -> Result<u64> {
    let idx = sym.plt_idx.load(Ordering::Relaxed);
    if idx < 0 {
        bail!("symbol has no PLT entry");
    }
    Ok(out.chunk(out.plt).hdr.sh_addr
        + owner_object(sym, files)?.plt_offset
        + idx as u64 * elf::PLT_ENTRY_SIZE)
}

fn write_file_header(buffer: &mut [u8], out: &Out) -> Result {
    let shdr = &out.chunk(out.shdr).hdr;
    let header = elf::FileHeader {
        magic: *b"\x7fELF",
        class: 2,
        data: 1,
        ei_version: 1,
        os_abi: 0,
        abi_version: 0,
        padding: [0; 7],
        ty: elf::ET_EXEC,
        machine: elf::EM_X86_64,
        e_version: 1,
        entry_point: out.entry_address,
        program_header_offset: u64::from(elf::FILE_HEADER_SIZE),
        section_header_offset: shdr.sh_offset,
        flags: 0,
        ehsize: elf::FILE_HEADER_SIZE,
        program_header_entry_size: elf::PROGRAM_HEADER_SIZE,
        program_header_num: out.segments.len() as u16,
        section_header_entry_size: elf::SECTION_HEADER_SIZE,
        section_header_num: (shdr.sh_size / u64::from(elf::SECTION_HEADER_SIZE)) as u16,
        section_names_index: out.chunk(out.shstrtab).shndx as u16,
    };
    buffer.copy_from_slice(bytemuck::bytes_of(&header));
    Ok(())
}

fn write_program_headers(buffer: &mut [u8], out: &Out) -> Result {
    let mut entries = Vec::with_capacity(out.segments.len());
    for segment in &out.segments {
        let first = out.chunk(segment.chunks[0]);
        let offset = first.hdr.sh_offset;
        let vaddr = first.hdr.sh_addr;
        let mut file_end = offset;
        let mut mem_end = vaddr;
        let mut max_align = 1;
        for &id in &segment.chunks {
            let chunk = out.chunk(id);
            if !chunk.is_nobits() {
                file_end = file_end.max(chunk.hdr.sh_offset + chunk.hdr.sh_size);
            }
            mem_end = mem_end.max(chunk.hdr.sh_addr + chunk.hdr.sh_size);
            max_align = max_align.max(chunk.hdr.sh_addralign);
        }
        let alignment = match segment.p_type {
            elf::SegmentType::Load => crate::alignment::PAGE_SIZE,
            elf::SegmentType::Tls => max_align,
            elf::SegmentType::Interp => 1,
            _ => 8,
        };
        entries.push(elf::ProgramHeader {
            segment_type: segment.p_type as u32,
            flags: segment.p_flags,
            offset,
            virtual_addr: vaddr,
            physical_addr: vaddr,
            file_size: file_end - offset,
            mem_size: mem_end - vaddr,
            alignment,
        });
    }
    buffer.copy_from_slice(bytemuck::cast_slice(&entries));
    Ok(())
}

fn write_section_headers(buffer: &mut [u8], out: &Out) -> Result {
    let count = buffer.len() / elf::SECTION_HEADER_SIZE as usize;
    let mut entries = vec![elf::SectionHeader::zeroed(); count];
    for &id in &out.order {
        let chunk = out.chunk(id);
        if chunk.shndx == 0 {
            continue;
        }
        entries[chunk.shndx as usize] = elf::SectionHeader {
            name: chunk.name_offset,
            ty: chunk.hdr.sh_type,
            flags: chunk.hdr.sh_flags,
            address: chunk.hdr.sh_addr,
            offset: chunk.hdr.sh_offset,
            size: chunk.hdr.sh_size,
            link: chunk.hdr.sh_link,
            info: chunk.hdr.sh_info,
            alignment: chunk.hdr.sh_addralign,
            entsize: chunk.hdr.sh_entsize,
        };
    }
    buffer.copy_from_slice(bytemuck::cast_slice(&entries));
    Ok(())
}

fn write_dynamic<'data>(buffer: &mut [u8], files: &[LinkFile<'data>], out: &Out<'data>) -> Result {
    use elf::DynamicTag as Tag;
    let mut entries: Vec<elf::DynamicEntry> = Vec::new();
    let mut push = |tag: Tag, value: u64| {
        entries.push(elf::DynamicEntry {
            tag: tag as u64,
            value,
        });
    };
    for file in files {
        let Some(obj) = file.as_object() else { continue };
        if obj.is_dso && obj.is_alive() && obj.soname.is_some() {
            push(Tag::Needed, obj.soname_offset);
        }
    }
    let chunk_addr = |id: Option<ChunkId>| id.map(|id| out.chunk(id).hdr.sh_addr).unwrap_or(0);
    push(Tag::Hash, chunk_addr(out.hash));
    push(Tag::StrTab, chunk_addr(out.dynstr));
    push(Tag::SymTab, chunk_addr(out.dynsym));
    push(Tag::SymEnt, elf::SYMTAB_ENTRY_SIZE);
    push(
        Tag::StrSize,
        out.dynstr.map(|id| out.chunk(id).hdr.sh_size).unwrap_or(0),
    );
    if let Some(reldyn) = out.reldyn {
        let hdr = &out.chunk(reldyn).hdr;
        if hdr.sh_size > 0 {
            push(Tag::Rela, hdr.sh_addr);
            push(Tag::RelaSize, hdr.sh_size);
            push(Tag::RelaEnt, elf::RELA_ENTRY_SIZE);
        }
    }
    let relplt = &out.chunk(out.relplt).hdr;
    if relplt.sh_size > 0 {
        push(Tag::JmpRel, relplt.sh_addr);
        push(Tag::PltRelSize, relplt.sh_size);
        push(Tag::PltRel, Tag::Rela as u64);
        push(Tag::PltGot, out.chunk(out.gotplt).hdr.sh_addr);
    }
    push(Tag::Null, 0);
    debug_assert_eq!(
        entries.len() * core::mem::size_of::<elf::DynamicEntry>(),
        buffer.len()
    );
    buffer.copy_from_slice(bytemuck::cast_slice(&entries));
    Ok(())
}

fn write_dynsym(buffer: &mut [u8], dynsym: &DynsymSection, db: &SymbolDb) -> Result {
    let mut entries = vec![elf::SymtabEntry::zeroed(); dynsym.syms.len() + 1];
    for (i, &symbol_id) in dynsym.syms.iter().enumerate() {
        let sym = db.symbol(symbol_id);
        let st_type = if sym.has_flag(crate::symbol_db::sym_flags::IFUNC) {
            elf::stt::GNU_IFUNC
        } else if sym.has_flag(crate::symbol_db::sym_flags::TLS) {
            elf::stt::TLS
        } else {
            elf::stt::NOTYPE
        };
        entries[i + 1] = elf::SymtabEntry {
            name: dynsym.name_offsets[i],
            info: (elf::stb::GLOBAL << 4) | st_type,
            other: 0,
            shndx: sym.shndx.load(Ordering::Relaxed) as u16,
            value: sym.address(),
            size: 0,
        };
    }
    buffer.copy_from_slice(bytemuck::cast_slice(&entries));
    Ok(())
}

fn elf_hash(name: &[u8]) -> u32 {
    let mut h = 0u32;
    for &byte in name {
        h = (h << 4).wrapping_add(u32::from(byte));
        let g = h & 0xf000_0000;
        if g != 0 {
            h ^= g >> 24;
        }
        h &= !g;
    }
    h
}

fn write_hash(buffer: &mut [u8], db: &SymbolDb, out: &Out) -> Result {
    let Some(dynsym_id) = out.dynsym else {
        return Ok(());
    };
    let ChunkKind::Dynsym(dynsym) = &out.chunk(dynsym_id).kind else {
        unreachable!();
    };
    let nbucket = dynsym.syms.len().max(1);
    let nchain = dynsym.syms.len() + 1;
    let mut table = vec![0u32; 2 + nbucket + nchain];
    table[0] = nbucket as u32;
    table[1] = nchain as u32;
    let (buckets, chains) = table[2..].split_at_mut(nbucket);
    for (i, &symbol_id) in dynsym.syms.iter().enumerate() {
        let idx = i + 1;
        let hash = elf_hash(db.symbol_name(symbol_id).bytes()) as usize % nbucket;
        chains[idx] = buckets[hash];
        buckets[hash] = idx as u32;
    }
    buffer.copy_from_slice(bytemuck::cast_slice(&table));
    Ok(())
}

struct FileTableBufs<'out> {
    got: &'out mut [u8],
    gotplt: &'out mut [u8],
    plt: &'out mut [u8],
    relplt: &'out mut [u8],
    reldyn: &'out mut [u8],
}

/// Fills each file's portion of .got, .got.plt, .plt, .rela.plt and .rela.dyn. Files own disjoint
/// ranges of each table, so this fans out with one task per file.
fn write_got_plt<'data>(
    buf: &mut [u8],
    files: &[LinkFile<'data>],
    db: &SymbolDb<'data>,
    out: &Out<'data>,
    args: &Args,
) -> Result {
    let mut got_buf: &mut [u8] = &mut [];
    let mut gotplt_buf: &mut [u8] = &mut [];
    let mut plt_buf: &mut [u8] = &mut [];
    let mut relplt_buf: &mut [u8] = &mut [];
    let mut reldyn_buf: &mut [u8] = &mut [];
    for (id, buffer) in split_chunk_buffers(buf, out) {
        if id == out.got {
            got_buf = buffer;
        } else if id == out.gotplt {
            gotplt_buf = buffer;
        } else if id == out.plt {
            plt_buf = buffer;
        } else if id == out.relplt {
            relplt_buf = buffer;
        } else if Some(id) == out.reldyn {
            reldyn_buf = buffer;
        }
    }

    let mut work = Vec::new();
    for file in files {
        let Some(obj) = file.as_object() else { continue };
        if !obj.is_alive() {
            continue;
        }
        work.push((
            obj,
            FileTableBufs {
                got: take_prefix(
                    &mut got_buf,
                    obj.num_got as usize * elf::GOT_ENTRY_SIZE as usize,
                ),
                gotplt: take_prefix(
                    &mut gotplt_buf,
                    obj.num_gotplt as usize * elf::GOT_ENTRY_SIZE as usize,
                ),
                plt: take_prefix(
                    &mut plt_buf,
                    obj.num_plt as usize * elf::PLT_ENTRY_SIZE as usize,
                ),
                relplt: take_prefix(
                    &mut relplt_buf,
                    obj.num_relplt as usize * elf::RELA_ENTRY_SIZE as usize,
                ),
                reldyn: take_prefix(
                    &mut reldyn_buf,
                    obj.num_reldyn as usize * elf::RELA_ENTRY_SIZE as usize,
                ),
            },
        ));
    }

    work.into_par_iter()
        .try_for_each(|(obj, bufs)| write_file_table_entries(obj, bufs, files, db, out, args))
}

fn write_file_table_entries<'data>(
    obj: &ObjectFile<'data>,
    bufs: FileTableBufs,
    files: &[LinkFile<'data>],
    db: &SymbolDb<'data>,
    out: &Out<'data>,
    args: &Args,
) -> Result {
    let mut reldyn_idx = 0usize;
    for symbol_id in obj.owned_symbols(db) {
        let sym = db.symbol(symbol_id);

        let got_idx = sym.got_idx.load(Ordering::Relaxed);
        if got_idx >= 0 {
            if args.is_static {
                let start = got_idx as usize * elf::GOT_ENTRY_SIZE as usize;
                bufs.got[start..start + 8].copy_from_slice(&sym.address().to_le_bytes());
            } else {
                let rela = elf::Rela::new(
                    got_slot_addr(sym, files, out)?,
                    elf::rel::R_X86_64_GLOB_DAT,
                    sym.dynsym_idx.load(Ordering::Relaxed).max(0) as u32,
                    0,
                );
                let start = reldyn_idx * elf::RELA_ENTRY_SIZE as usize;
                bufs.reldyn[start..start + elf::RELA_ENTRY_SIZE as usize]
                    .copy_from_slice(bytemuck::bytes_of(&rela));
                reldyn_idx += 1;
            }
        }

        let gottp_idx = sym.gottp_idx.load(Ordering::Relaxed);
        if gottp_idx >= 0 {
            let start = gottp_idx as usize * elf::GOT_ENTRY_SIZE as usize;
            bufs.got[start..start + 8]
                .copy_from_slice(&sym.address().wrapping_sub(out.tls_end).to_le_bytes());
        }

        if sym.gotgd_idx.load(Ordering::Relaxed) >= 0
            || sym.gotld_idx.load(Ordering::Relaxed) >= 0
        {
            bail!(
                "not implemented: TLS general/local-dynamic GOT entries for `{}`",
                db.symbol_name(symbol_id)
            );
        }

        let plt_idx = sym.plt_idx.load(Ordering::Relaxed);
        if plt_idx >= 0 {
            let entry_addr = plt_entry_addr(sym, files, out)?;
            let slot_addr = if sym.gotplt_idx.load(Ordering::Relaxed) >= 0 {
                gotplt_slot_addr(sym, files, out)?
            } else {
                got_slot_addr(sym, files, out)?
            };
            let start = plt_idx as usize * elf::PLT_ENTRY_SIZE as usize;
            write_plt_entry(
                &mut bufs.plt[start..start + elf::PLT_ENTRY_SIZE as usize],
                entry_addr,
                slot_addr,
                sym.relplt_idx.load(Ordering::Relaxed).max(0) as u32,
                out.chunk(out.plt).hdr.sh_addr,
            );
        }

        let relplt_idx = sym.relplt_idx.load(Ordering::Relaxed);
        if relplt_idx >= 0 {
            let start = relplt_idx as usize * elf::RELA_ENTRY_SIZE as usize;
            let target = &mut bufs.relplt[start..start + elf::RELA_ENTRY_SIZE as usize];
            if sym.has_flag(crate::symbol_db::sym_flags::IFUNC) {
                let rela = elf::Rela::new(
                    gotplt_slot_addr(sym, files, out)?,
                    elf::rel::R_X86_64_IRELATIVE,
                    0,
                    sym.address(),
                );
                target.copy_from_slice(bytemuck::bytes_of(&rela));
            } else {
                let rela = elf::Rela::new(
                    gotplt_slot_addr(sym, files, out)?,
                    elf::rel::R_X86_64_JUMP_SLOT,
                    sym.dynsym_idx.load(Ordering::Relaxed).max(0) as u32,
                    0,
                );
                target.copy_from_slice(bytemuck::bytes_of(&rela));
                // Standard x86-64 lazy PLT: the slot initially points at the entry's push, one
                // jump past the start.
                let gotplt_idx = sym.gotplt_idx.load(Ordering::Relaxed);
                let slot = gotplt_idx as usize * elf::GOT_ENTRY_SIZE as usize;
                bufs.gotplt[slot..slot + 8].copy_from_slice(
                    &(plt_entry_addr(sym, files, out)? + elf::PLT_JUMP_SIZE).to_le_bytes(),
                );
            }
        }
    }
    Ok(())
}

fn write_plt_entry(buffer: &mut [u8], entry_addr: u64, slot_addr: u64, relplt_idx: u32, plt_base: u64) {
    // jmp *slot(%rip); push relplt_idx; jmp plt_base
    buffer[0] = 0xff;
    buffer[1] = 0x25;
    let disp = slot_addr.wrapping_sub(entry_addr + 6) as u32;
    buffer[2..6].copy_from_slice(&disp.to_le_bytes());
    buffer[6] = 0x68;
    buffer[7..11].copy_from_slice(&relplt_idx.to_le_bytes());
    buffer[11] = 0xe9;
    let disp = plt_base.wrapping_sub(entry_addr + 16) as u32;
    buffer[12..16].copy_from_slice(&disp.to_le_bytes());
}

/// SONAMEs land in .dynstr at the offsets precomputed during scanning. Serial; there are few.
fn write_dso_paths<'data>(buf: &mut [u8], files: &[LinkFile<'data>], out: &Out<'data>) {
    let Some(dynstr_id) = out.dynstr else { return };
    let base = out.chunk(dynstr_id).hdr.sh_offset as usize;
    for file in files {
        let Some(obj) = file.as_object() else { continue };
        if !(obj.is_dso && obj.is_alive()) {
            continue;
        }
        if let Some(soname) = obj.soname {
            let start = base + obj.soname_offset as usize;
            buf[start..start + soname.len()].copy_from_slice(soname);
            buf[start + soname.len()] = 0;
        }
    }
}

/// Writes merged string bytes: every owning input section copies the pieces it owns into its
/// range of the parent. Ranges are disjoint per (file, section), so the work fans out freely.
fn write_merged_strings<'data>(buf: &mut [u8], files: &[LinkFile<'data>], out: &Out<'data>) {
    let mut regions: Vec<(u64, u64, FileId, usize)> = Vec::new();
    for file in files {
        let Some(obj) = file.as_object() else { continue };
        if !obj.is_alive() {
            continue;
        }
        for (index, isec) in obj.merge_sections.iter().enumerate() {
            if isec.size > 0 {
                regions.push((
                    out.chunk(isec.parent).hdr.sh_offset + isec.offset,
                    isec.size,
                    obj.file_id,
                    index,
                ));
            }
        }
    }
    regions.sort_unstable_by_key(|&(offset, ..)| offset);

    let mut rest = buf;
    let mut pos = 0u64;
    let mut work = Vec::with_capacity(regions.len());
    for (offset, size, file_id, index) in regions {
        take_prefix(&mut rest, (offset - pos) as usize);
        work.push((
            take_prefix(&mut rest, size as usize),
            file_id,
            index,
        ));
        pos = offset + size;
    }
    work.into_par_iter().for_each(|(part, file_id, index)| {
        let obj = files[file_id.as_usize()].as_object().unwrap();
        let isec = &obj.merge_sections[index];
        for piece in &isec.pieces {
            if isec.owns(piece) {
                let start = isec.piece_output_offset(piece) as usize;
                part[start..start + piece.data.len()].copy_from_slice(piece.data);
            }
        }
    });
}

/// .symtab and .strtab are written in per-file halves: all files' local symbols first, then all
/// files' globals, each at offsets pre-summed from the sizes computed during layout.
fn write_symtab<'data>(
    buf: &mut [u8],
    files: &[LinkFile<'data>],
    db: &SymbolDb<'data>,
    out: &Out<'data>,
) -> Result {
    let mut symtab_buf: &mut [u8] = &mut [];
    let mut strtab_buf: &mut [u8] = &mut [];
    for (id, buffer) in split_chunk_buffers(buf, out) {
        if id == out.symtab {
            symtab_buf = buffer;
        } else if id == out.strtab {
            strtab_buf = buffer;
        }
    }
    // Skip the null entry and leading NUL.
    take_prefix(&mut symtab_buf, elf::SYMTAB_ENTRY_SIZE as usize);
    take_prefix(&mut strtab_buf, 1);
    let mut strtab_pos = 1u64;

    struct FileSymtabBufs<'out, 'a, 'data> {
        file: &'a LinkFile<'data>,
        local_symtab: &'out mut [u8],
        local_strtab: &'out mut [u8],
        local_strtab_start: u64,
        global_symtab: &'out mut [u8],
        global_strtab: &'out mut [u8],
        global_strtab_start: u64,
    }

    let mut work = Vec::new();
    for file in files {
        let (local_symtab_size, local_strtab_size) = match file {
            LinkFile::Internal(_) => (0, 0),
            LinkFile::Object(obj) => {
                if obj.is_dso || !obj.is_alive() {
                    (0, 0)
                } else {
                    (obj.local_symtab_size, obj.local_strtab_size)
                }
            }
        };
        let local_symtab = take_prefix(&mut symtab_buf, local_symtab_size as usize);
        let local_strtab = take_prefix(&mut strtab_buf, local_strtab_size as usize);
        work.push(FileSymtabBufs {
            file,
            local_symtab,
            local_strtab,
            local_strtab_start: strtab_pos,
            global_symtab: &mut [],
            global_strtab: &mut [],
            global_strtab_start: 0,
        });
        strtab_pos += local_strtab_size;
    }
    for bufs in &mut work {
        let (global_symtab_size, global_strtab_size) = match bufs.file {
            LinkFile::Internal(internal) => {
                (internal.global_symtab_size, internal.global_strtab_size)
            }
            LinkFile::Object(obj) => {
                if obj.is_dso || !obj.is_alive() {
                    (0, 0)
                } else {
                    (obj.global_symtab_size, obj.global_strtab_size)
                }
            }
        };
        bufs.global_symtab = take_prefix(&mut symtab_buf, global_symtab_size as usize);
        bufs.global_strtab = take_prefix(&mut strtab_buf, global_strtab_size as usize);
        bufs.global_strtab_start = strtab_pos;
        strtab_pos += global_strtab_size;
    }

    work.into_par_iter().try_for_each(|bufs| -> Result {
        let mut entries: Vec<elf::SymtabEntry> = Vec::new();
        let mut names: Vec<u8> = Vec::new();
        match bufs.file {
            LinkFile::Internal(internal) => {
                for &symbol_id in &internal.defined {
                    let sym = db.symbol(symbol_id);
                    if sym.owner_file() != Some(crate::input_data::INTERNAL_FILE_ID) {
                        continue;
                    }
                    entries.push(elf::SymtabEntry {
                        name: (bufs.global_strtab_start + names.len() as u64) as u32,
                        info: (elf::stb::GLOBAL << 4) | elf::stt::NOTYPE,
                        other: 0,
                        shndx: sym.shndx.load(Ordering::Relaxed) as u16,
                        value: sym.address(),
                        size: 0,
                    });
                    names.extend_from_slice(db.symbol_name(symbol_id).bytes());
                    names.push(0);
                }
                bufs.global_symtab
                    .copy_from_slice(bytemuck::cast_slice(&entries));
                bufs.global_strtab.copy_from_slice(&names);
            }
            LinkFile::Object(obj) => {
                if obj.is_dso || !obj.is_alive() {
                    return Ok(());
                }
                for esym in obj.object.symbols() {
                    if !obj.should_emit_local(&esym) {
                        continue;
                    }
                    entries.push(elf::SymtabEntry {
                        name: (bufs.local_strtab_start + names.len() as u64) as u32,
                        info: crate::parsing::st_type(&esym),
                        other: 0,
                        shndx: obj.input_symbol_shndx(&esym, out),
                        value: obj.input_symbol_address(&esym, out)?,
                        size: esym.size(),
                    });
                    names.extend_from_slice(esym.name_bytes()?);
                    names.push(0);
                }
                bufs.local_symtab
                    .copy_from_slice(bytemuck::cast_slice(&entries));
                bufs.local_strtab.copy_from_slice(&names);

                entries.clear();
                names.clear();
                for symbol_id in obj.owned_symbols(db) {
                    let sym = db.symbol(symbol_id);
                    let esym = obj.elf_symbol(sym.local_index())?;
                    let binding = if esym.is_weak() {
                        elf::stb::WEAK
                    } else {
                        elf::stb::GLOBAL
                    };
                    entries.push(elf::SymtabEntry {
                        name: (bufs.global_strtab_start + names.len() as u64) as u32,
                        info: (binding << 4) | crate::parsing::st_type(&esym),
                        other: 0,
                        shndx: sym.shndx.load(Ordering::Relaxed) as u16,
                        value: sym.address(),
                        size: esym.size(),
                    });
                    names.extend_from_slice(db.symbol_name(symbol_id).bytes());
                    names.push(0);
                }
                bufs.global_symtab
                    .copy_from_slice(bytemuck::cast_slice(&entries));
                bufs.global_strtab.copy_from_slice(&names);
            }
        }
        Ok(())
    })
}

/// Zeroes the gaps between chunks and anything after the last one. Needed when a filler byte was
/// configured; harmless otherwise.
fn clear_padding(buf: &mut [u8], out: &Out) {
    let mut pos = 0u64;
    for &id in &out.order {
        let chunk = out.chunk(id);
        buf[pos as usize..chunk.hdr.sh_offset as usize].fill(0);
        pos = chunk.hdr.sh_offset + chunk.file_size();
    }
    buf[pos as usize..].fill(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_prefix() {
        let mut backing = [1u8, 2, 3, 4, 5];
        let mut remaining: &mut [u8] = &mut backing;
        assert_eq!(take_prefix(&mut remaining, 2), &[1, 2]);
        assert_eq!(take_prefix(&mut remaining, 0), &[] as &[u8]);
        assert_eq!(take_prefix(&mut remaining, 3), &[3, 4, 5]);
    }

    #[test]
    #[should_panic(expected = "output region")]
    fn test_take_prefix_overrun() {
        let mut backing = [0u8; 4];
        let mut remaining: &mut [u8] = &mut backing;
        take_prefix(&mut remaining, 5);
    }

    #[test]
    fn test_elf_hash() {
        // Reference values for the SysV hash function.
        assert_eq!(elf_hash(b""), 0);
        assert_eq!(elf_hash(b"printf"), 0x077905a6);
        assert_eq!(elf_hash(b"exit"), 0x0006cf04);
    }

    #[test]
    fn test_plt_entry_shape() {
        let mut entry = [0u8; 16];
        write_plt_entry(&mut entry, 0x201000, 0x202000, 3, 0x201000);
        // jmp *slot(%rip) with the displacement taken from the instruction's end.
        assert_eq!(&entry[..2], &[0xff, 0x25]);
        assert_eq!(i32::from_le_bytes(entry[2..6].try_into().unwrap()), 0xffa);
        // push of the .rela.plt index, then a jump back to the PLT base.
        assert_eq!(entry[6], 0x68);
        assert_eq!(u32::from_le_bytes(entry[7..11].try_into().unwrap()), 3);
        assert_eq!(entry[11], 0xe9);
        assert_eq!(i32::from_le_bytes(entry[12..16].try_into().unwrap()), -16);
    }
}
