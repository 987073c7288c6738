//! Decides where everything goes: orders the output chunks by section rank, groups them into
//! loadable segments, walks the chunk list assigning file offsets and virtual addresses that stay
//! congruent modulo the page size, then pins down the addresses of linker-synthesized symbols and
//! of every defined global.

use crate::alignment::align_to;
use crate::alignment::PAGE_SIZE;
use crate::args::Args;
use crate::chunks::ChunkId;
use crate::chunks::ChunkKind;
use crate::chunks::Out;
use crate::chunks::Segment;
use crate::elf;
use crate::error::Result;
use crate::input_data::INTERNAL_FILE_ID;
use crate::parsing::LinkFile;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolName;
use object::Object;
use object::ObjectSymbol;
use rayon::prelude::IntoParallelRefIterator;
use rayon::prelude::IntoParallelRefMutIterator;
use rayon::prelude::ParallelIterator;
use std::cmp::Reverse;
use std::sync::atomic::Ordering;

#[tracing::instrument(skip_all, name = "Layout")]
pub(crate) fn compute_layout<'data>(
    files: &mut [LinkFile<'data>],
    db: &SymbolDb<'data>,
    out: &mut Out<'data>,
    args: &Args,
) -> Result {
    compute_symtab_sizes(files, db, out)?;
    build_chunk_order(out, args);
    assign_section_indexes(out);
    assemble_shstrtab(out);
    build_segments(out);
    set_header_sizes_and_links(out);
    out.filesize = assign_offsets(out);
    compute_tls_end(out);
    fix_synthetic_symbols(files, db, out);
    materialize_symbol_addresses(files, db, out)?;
    out.entry_address = db
        .get(&SymbolName::new(b"_start"))
        .map(|id| db.symbol(id).address())
        .unwrap_or(0);
    Ok(())
}

/// The ordering the output wants: alloc read-only data, alloc read-only code, tdata, tbss,
/// writable data, bss, then the non-alloc tail.
pub(crate) fn section_rank(hdr: &crate::chunks::SecHeader) -> u32 {
    let alloc = u32::from(hdr.sh_flags & elf::shf::ALLOC != 0);
    let writable = u32::from(hdr.sh_flags & elf::shf::WRITE != 0);
    let exec = u32::from(hdr.sh_flags & elf::shf::EXECINSTR != 0);
    let tls = u32::from(hdr.sh_flags & elf::shf::TLS != 0);
    let nobits = u32::from(hdr.sh_type == elf::sht::NOBITS);
    (alloc << 5) | ((1 - writable) << 4) | ((1 - exec) << 3) | (tls << 2) | (1 - nobits)
}

#[tracing::instrument(skip_all, name = "Compute symbol table sizes")]
fn compute_symtab_sizes<'data>(
    files: &mut [LinkFile<'data>],
    db: &SymbolDb<'data>,
    out: &mut Out<'data>,
) -> Result {
    files.par_iter_mut().try_for_each(|file| -> Result {
        match file {
            LinkFile::Internal(internal) => {
                let mut count = 0u64;
                let mut names = 0u64;
                for &symbol_id in &internal.defined {
                    if db.symbol(symbol_id).owner_file() == Some(INTERNAL_FILE_ID) {
                        count += 1;
                        names += db.symbol_name(symbol_id).bytes().len() as u64 + 1;
                    }
                }
                internal.global_symtab_size = count * elf::SYMTAB_ENTRY_SIZE;
                internal.global_strtab_size = names;
            }
            LinkFile::Object(obj) => {
                if obj.is_dso || !obj.is_alive() {
                    return Ok(());
                }
                let mut local_count = 0u64;
                let mut local_names = 0u64;
                for esym in obj.object.symbols() {
                    if obj.should_emit_local(&esym) {
                        local_count += 1;
                        local_names += esym.name_bytes()?.len() as u64 + 1;
                    }
                }
                obj.local_symtab_size = local_count * elf::SYMTAB_ENTRY_SIZE;
                obj.local_strtab_size = local_names;
                let mut global_count = 0u64;
                let mut global_names = 0u64;
                for symbol_id in obj.owned_symbols(db) {
                    global_count += 1;
                    global_names += db.symbol_name(symbol_id).bytes().len() as u64 + 1;
                }
                obj.global_symtab_size = global_count * elf::SYMTAB_ENTRY_SIZE;
                obj.global_strtab_size = global_names;
            }
        }
        Ok(())
    })?;

    let mut symtab_size = elf::SYMTAB_ENTRY_SIZE; // the null entry
    let mut strtab_size = 1u64;
    let mut local_entries = 1u64;
    for file in files.iter() {
        match file {
            LinkFile::Internal(internal) => {
                symtab_size += internal.global_symtab_size;
                strtab_size += internal.global_strtab_size;
            }
            LinkFile::Object(obj) => {
                if obj.is_dso || !obj.is_alive() {
                    continue;
                }
                symtab_size += obj.local_symtab_size + obj.global_symtab_size;
                strtab_size += obj.local_strtab_size + obj.global_strtab_size;
                local_entries += obj.local_symtab_size / elf::SYMTAB_ENTRY_SIZE;
            }
        }
    }
    let symtab = out.chunk_mut(out.symtab);
    symtab.hdr.sh_size = symtab_size;
    symtab.hdr.sh_info = local_entries as u32;
    out.chunk_mut(out.strtab).hdr.sh_size = strtab_size;
    Ok(())
}

fn build_chunk_order(out: &mut Out, _args: &Args) {
    // Sections get created in whatever order the files mention them; sort by (name, type, flags)
    // so the output doesn't depend on that.
    let section_sort = |out: &Out, ids: &mut Vec<ChunkId>| {
        ids.sort_by(|a, b| {
            let ka = out.chunk(*a);
            let kb = out.chunk(*b);
            (ka.name, ka.hdr.sh_type, ka.hdr.sh_flags).cmp(&(
                kb.name,
                kb.hdr.sh_type,
                kb.hdr.sh_flags,
            ))
        });
    };
    let mut regular: Vec<ChunkId> = out
        .regular_ids
        .iter()
        .copied()
        .filter(|id| out.chunk(*id).hdr.sh_size > 0)
        .collect();
    section_sort(out, &mut regular);
    let mut merged: Vec<ChunkId> = out
        .merged_ids
        .iter()
        .copied()
        .filter(|id| out.chunk(*id).hdr.sh_size > 0)
        .collect();
    section_sort(out, &mut merged);

    let mut order = regular;
    order.append(&mut merged);
    order.push(out.got);
    order.push(out.plt);
    order.push(out.gotplt);
    order.push(out.relplt);
    order.extend(out.reldyn);
    order.extend(out.dynamic);
    order.extend(out.dynsym);
    order.extend(out.dynstr);
    order.push(out.shstrtab);
    order.push(out.symtab);
    order.push(out.strtab);
    order.extend(out.hash);

    // Sort by section flags so that we create as few segments as possible. The sort is stable, so
    // ties keep the name order established above.
    order.sort_by_key(|id| Reverse(section_rank(&out.chunk(*id).hdr)));

    order.insert(0, out.ehdr);
    order.insert(1, out.phdr);
    if let Some(interp) = out.interp {
        order.insert(2, interp);
    }
    order.push(out.shdr);
    out.order = order;
}

fn assign_section_indexes(out: &mut Out) {
    let mut shndx = 1;
    for i in 0..out.order.len() {
        let id = out.order[i];
        let chunk = out.chunk_mut(id);
        if !chunk.is_header() {
            chunk.shndx = shndx;
            shndx += 1;
        }
    }
}

fn assemble_shstrtab(out: &mut Out) {
    let mut bytes = vec![0u8];
    for i in 0..out.order.len() {
        let id = out.order[i];
        let chunk = out.chunk_mut(id);
        if chunk.shndx != 0 && !chunk.name.is_empty() {
            chunk.name_offset = bytes.len() as u32;
            bytes.extend_from_slice(chunk.name);
            bytes.push(0);
        }
    }
    let chunk = out.chunk_mut(out.shstrtab);
    chunk.hdr.sh_size = bytes.len() as u64;
    let ChunkKind::Shstrtab(shstrtab) = &mut chunk.kind else {
        unreachable!();
    };
    shstrtab.bytes = bytes;
}

fn build_segments(out: &mut Out) {
    let mut segments = Vec::new();
    segments.push(Segment {
        p_type: elf::SegmentType::Phdr,
        p_flags: elf::pf::R,
        chunks: vec![out.phdr],
    });
    if let Some(interp) = out.interp {
        segments.push(Segment {
            p_type: elf::SegmentType::Interp,
            p_flags: elf::pf::R,
            chunks: vec![interp],
        });
    }

    let mut load: Option<(u32, Vec<ChunkId>)> = None;
    let mut flush = |load: &mut Option<(u32, Vec<ChunkId>)>, segments: &mut Vec<Segment>| {
        if let Some((p_flags, chunks)) = load.take() {
            segments.push(Segment {
                p_type: elf::SegmentType::Load,
                p_flags,
                chunks,
            });
        }
    };
    for &id in &out.order {
        let chunk = out.chunk(id);
        if chunk.hdr.sh_flags & elf::shf::ALLOC == 0 {
            flush(&mut load, &mut segments);
            continue;
        }
        let mut p_flags = elf::pf::R;
        if chunk.hdr.sh_flags & elf::shf::WRITE != 0 {
            p_flags |= elf::pf::W;
        }
        if chunk.hdr.sh_flags & elf::shf::EXECINSTR != 0 {
            p_flags |= elf::pf::X;
        }
        match &mut load {
            Some((flags, chunks)) if *flags == p_flags => chunks.push(id),
            _ => {
                flush(&mut load, &mut segments);
                load = Some((p_flags, vec![id]));
            }
        }
    }
    flush(&mut load, &mut segments);

    let tls_chunks: Vec<ChunkId> = out
        .order
        .iter()
        .copied()
        .filter(|id| out.chunk(*id).hdr.sh_flags & elf::shf::TLS != 0)
        .collect();
    if !tls_chunks.is_empty() {
        segments.push(Segment {
            p_type: elf::SegmentType::Tls,
            p_flags: elf::pf::R,
            chunks: tls_chunks,
        });
    }
    if let Some(dynamic) = out.dynamic {
        segments.push(Segment {
            p_type: elf::SegmentType::Dynamic,
            p_flags: elf::pf::R | elf::pf::W,
            chunks: vec![dynamic],
        });
    }

    for segment in &segments {
        if segment.p_type == elf::SegmentType::Load {
            out.chunk_mut(segment.chunks[0]).starts_load = true;
        }
    }
    out.segments = segments;
}

fn set_header_sizes_and_links(out: &mut Out) {
    let phdr_size = out.segments.len() as u64 * u64::from(elf::PROGRAM_HEADER_SIZE);
    out.chunk_mut(out.phdr).hdr.sh_size = phdr_size;
    let num_sections = out
        .order
        .iter()
        .map(|id| out.chunk(*id).shndx)
        .max()
        .unwrap_or(0) as u64;
    out.chunk_mut(out.shdr).hdr.sh_size =
        (num_sections + 1) * u64::from(elf::SECTION_HEADER_SIZE);

    let strtab_shndx = out.chunk(out.strtab).shndx;
    out.chunk_mut(out.symtab).hdr.sh_link = strtab_shndx;
    if let Some(dynsym_id) = out.dynsym {
        let dynsym_shndx = out.chunk(dynsym_id).shndx;
        out.chunk_mut(out.relplt).hdr.sh_link = dynsym_shndx;
        if let Some(reldyn) = out.reldyn {
            out.chunk_mut(reldyn).hdr.sh_link = dynsym_shndx;
        }
        if let Some(hash) = out.hash {
            out.chunk_mut(hash).hdr.sh_link = dynsym_shndx;
        }
        if let Some(dynstr_id) = out.dynstr {
            let dynstr_shndx = out.chunk(dynstr_id).shndx;
            out.chunk_mut(dynsym_id).hdr.sh_link = dynstr_shndx;
            if let Some(dynamic) = out.dynamic {
                out.chunk_mut(dynamic).hdr.sh_link = dynstr_shndx;
            }
        }
    }
}

/// Walks the chunks in output order maintaining a file offset and a virtual address. The two are
/// kept congruent modulo the page size for anything that occupies file bytes, so a PT_LOAD can map
/// the file directly.
fn assign_offsets(out: &mut Out) -> u64 {
    let mut fileoff = 0u64;
    let mut vaddr = elf::START_VADDR;
    for i in 0..out.order.len() {
        let id = out.order[i];
        let chunk = out.chunk_mut(id);
        if chunk.starts_load {
            vaddr = align_to(vaddr, PAGE_SIZE);
        }
        let is_bss = chunk.is_nobits();
        if !is_bss {
            if vaddr % PAGE_SIZE > fileoff % PAGE_SIZE {
                fileoff += vaddr % PAGE_SIZE - fileoff % PAGE_SIZE;
            } else if vaddr % PAGE_SIZE < fileoff % PAGE_SIZE {
                fileoff = align_to(fileoff, PAGE_SIZE) + vaddr % PAGE_SIZE;
            }
        }
        fileoff = align_to(fileoff, chunk.hdr.sh_addralign.max(1));
        vaddr = align_to(vaddr, chunk.hdr.sh_addralign.max(1));
        chunk.hdr.sh_offset = fileoff;
        if chunk.hdr.sh_flags & elf::shf::ALLOC != 0 {
            chunk.hdr.sh_addr = vaddr;
        }
        if !is_bss {
            fileoff += chunk.hdr.sh_size;
        }
        let is_tbss = is_bss && chunk.hdr.sh_flags & elf::shf::TLS != 0;
        if !is_tbss {
            vaddr += chunk.hdr.sh_size;
        }
    }
    fileoff
}

/// TP-relative offsets are anchored at the end of the TLS image.
fn compute_tls_end(out: &mut Out) {
    for &id in &out.order {
        let hdr = &out.chunk(id).hdr;
        if hdr.sh_flags & elf::shf::TLS != 0 {
            out.tls_end = align_to(hdr.sh_addr + hdr.sh_size, hdr.sh_addralign.max(1));
        }
    }
}

fn set_synthetic(db: &SymbolDb, name: &[u8], addr: u64, shndx: u32) {
    let Some(id) = db.get(&SymbolName::new(name)) else {
        return;
    };
    let sym = db.symbol(id);
    // A definition in user code has won the election; leave it alone.
    if sym.owner_file() != Some(INTERNAL_FILE_ID) {
        return;
    }
    sym.addr.store(addr, Ordering::Relaxed);
    sym.shndx.store(shndx, Ordering::Relaxed);
}

fn fix_synthetic_symbols<'data>(files: &[LinkFile<'data>], db: &SymbolDb<'data>, out: &Out<'data>) {
    let start = |name: &[u8], id: ChunkId| {
        let chunk = out.chunk(id);
        set_synthetic(db, name, chunk.hdr.sh_addr, chunk.shndx);
    };
    let stop = |name: &[u8], id: ChunkId| {
        let chunk = out.chunk(id);
        set_synthetic(db, name, chunk.hdr.sh_addr + chunk.hdr.sh_size, chunk.shndx);
    };

    for &id in &out.order {
        let chunk = out.chunk(id);
        if matches!(chunk.kind, ChunkKind::Regular(_)) && chunk.name == b".bss" {
            start(b"__bss_start", id);
            break;
        }
    }

    set_synthetic(db, b"__ehdr_start", out.chunk(out.ehdr).hdr.sh_addr, 1);

    start(b"__rela_iplt_start", out.relplt);
    stop(b"__rela_iplt_end", out.relplt);

    for &id in &out.order {
        match out.chunk(id).hdr.sh_type {
            elf::sht::INIT_ARRAY => {
                start(b"__init_array_start", id);
                stop(b"__init_array_end", id);
            }
            elf::sht::FINI_ARRAY => {
                start(b"__fini_array_start", id);
                stop(b"__fini_array_end", id);
            }
            _ => {}
        }
    }

    for &id in &out.order {
        let chunk = out.chunk(id);
        if chunk.is_header() {
            continue;
        }
        if chunk.hdr.sh_flags & elf::shf::ALLOC != 0 {
            stop(b"_end", id);
            stop(b"end", id);
        }
        if chunk.hdr.sh_flags & elf::shf::EXECINSTR != 0 {
            stop(b"_etext", id);
            stop(b"etext", id);
        }
        if chunk.hdr.sh_flags & elf::shf::ALLOC != 0 && !chunk.is_nobits() {
            stop(b"_edata", id);
            stop(b"edata", id);
        }
    }

    if let Some(dynamic) = out.dynamic {
        start(b"_DYNAMIC", dynamic);
    }
    start(b"_GLOBAL_OFFSET_TABLE_", out.gotplt);

    if let LinkFile::Internal(internal) = &files[0] {
        for &(symbol_id, chunk_id, is_start) in &internal.start_stop {
            let sym = db.symbol(symbol_id);
            if sym.owner_file() != Some(INTERNAL_FILE_ID) {
                continue;
            }
            let chunk = out.chunk(chunk_id);
            let addr = if is_start {
                chunk.hdr.sh_addr
            } else {
                chunk.hdr.sh_addr + chunk.hdr.sh_size
            };
            sym.addr.store(addr, Ordering::Relaxed);
            sym.shndx.store(chunk.shndx, Ordering::Relaxed);
        }
    }
}

/// Computes the final address and output section index of every global a live file owns. Each
/// symbol is written only by its owning file's thread.
#[tracing::instrument(skip_all, name = "Materialize symbol addresses")]
fn materialize_symbol_addresses<'data>(
    files: &[LinkFile<'data>],
    db: &SymbolDb<'data>,
    out: &Out<'data>,
) -> Result {
    files.par_iter().try_for_each(|file| -> Result {
        let Some(obj) = file.as_object() else {
            return Ok(());
        };
        if obj.is_dso || !obj.is_alive() {
            return Ok(());
        }
        for symbol_id in obj.owned_symbols(db) {
            let sym = db.symbol(symbol_id);
            let esym = obj.elf_symbol(sym.local_index())?;
            let (addr, shndx) = if esym.is_common() {
                let common = obj
                    .common
                    .as_ref()
                    .expect("owned common symbol without a common chunk");
                let offset = common
                    .symbols
                    .iter()
                    .find(|(id, _)| *id == symbol_id)
                    .map(|(_, offset)| *offset)
                    .unwrap_or(0);
                let chunk = obj.section_chunk(common.slot).unwrap();
                let osec = out.chunk(chunk.osec);
                (
                    osec.hdr.sh_addr + chunk.offset.load(Ordering::Relaxed) + offset,
                    osec.shndx as u16,
                )
            } else {
                (
                    obj.input_symbol_address(&esym, out)?,
                    obj.input_symbol_shndx(&esym, out),
                )
            };
            sym.addr.store(addr, Ordering::Relaxed);
            sym.shndx.store(u32::from(shndx), Ordering::Relaxed);
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunks::SecHeader;

    fn header(sh_flags: u64, sh_type: u32) -> SecHeader {
        SecHeader {
            sh_flags,
            sh_type,
            ..Default::default()
        }
    }

    #[test]
    fn test_section_rank_ordering() {
        use elf::shf;
        // alloc ro data > alloc ro code > tdata > tbss > rw data > bss > nonalloc.
        let ro_data = section_rank(&header(shf::ALLOC, elf::sht::PROGBITS));
        let ro_code = section_rank(&header(shf::ALLOC | shf::EXECINSTR, elf::sht::PROGBITS));
        let tdata = section_rank(&header(
            shf::ALLOC | shf::WRITE | shf::TLS,
            elf::sht::PROGBITS,
        ));
        let tbss = section_rank(&header(shf::ALLOC | shf::WRITE | shf::TLS, elf::sht::NOBITS));
        let rw_data = section_rank(&header(shf::ALLOC | shf::WRITE, elf::sht::PROGBITS));
        let bss = section_rank(&header(shf::ALLOC | shf::WRITE, elf::sht::NOBITS));
        let nonalloc = section_rank(&header(0, elf::sht::PROGBITS));
        assert!(ro_data > ro_code);
        assert!(ro_code > tdata);
        assert!(tdata > tbss);
        assert!(tbss > rw_data);
        assert!(rw_data > bss);
        assert!(bss > nonalloc);
    }

    #[test]
    fn test_offset_vaddr_congruence() {
        // The reconciliation rule in assign_offsets keeps file offset and vaddr congruent mod the
        // page size whichever side is ahead.
        let cases = [(0u64, 0x200000u64), (0x340, 0x201000), (0xfff, 0x200010)];
        for (mut fileoff, vaddr) in cases {
            if vaddr % PAGE_SIZE > fileoff % PAGE_SIZE {
                fileoff += vaddr % PAGE_SIZE - fileoff % PAGE_SIZE;
            } else if vaddr % PAGE_SIZE < fileoff % PAGE_SIZE {
                fileoff = align_to(fileoff, PAGE_SIZE) + vaddr % PAGE_SIZE;
            }
            assert_eq!(fileoff % PAGE_SIZE, vaddr % PAGE_SIZE);
        }
    }
}
