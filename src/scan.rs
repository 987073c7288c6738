//! Relocation scanning. A first pass walks every live section's relocations and ORs demand bits
//! into the referenced symbols' atomic bitsets; only the union matters, so relaxed ordering is
//! fine. A second pass has each file allocate GOT/PLT/TLS slots for the symbols it owns, touching
//! only its own counters. A short sequential roll-up then turns per-file counts into base offsets
//! and the synthetic sections' final sizes.

use crate::args::Args;
use crate::chunks::ChunkKind;
use crate::chunks::Out;
use crate::elf;
use crate::elf::RelocationKind;
use crate::elf::RelocationKindInfo;
use crate::error::Result;
use crate::parsing::LinkFile;
use crate::parsing::SectionSlot;
use crate::symbol_db::rels;
use crate::symbol_db::sym_flags;
use crate::symbol_db::SymbolDb;
use anyhow::bail;
use object::Object;
use object::ObjectSection;
use rayon::prelude::IntoParallelRefIterator;
use rayon::prelude::IntoParallelRefMutIterator;
use rayon::prelude::ParallelIterator;
use std::sync::atomic::Ordering;

#[tracing::instrument(skip_all, name = "Scan relocations")]
pub(crate) fn scan_relocations<'data>(
    files: &mut [LinkFile<'data>],
    db: &SymbolDb<'data>,
    out: &mut Out<'data>,
    args: &Args,
) -> Result {
    scan_section_relocations(files, db)?;
    allocate_slots(files, db, args)?;
    roll_up(files, db, out, args);
    Ok(())
}

fn scan_section_relocations<'data>(files: &[LinkFile<'data>], db: &SymbolDb<'data>) -> Result {
    files.par_iter().try_for_each(|file| -> Result {
        let Some(obj) = file.as_object() else {
            return Ok(());
        };
        if obj.is_dso || !obj.is_alive() {
            return Ok(());
        }
        for (slot, section) in obj.sections.iter().enumerate() {
            let SectionSlot::Loaded(chunk) = section else {
                continue;
            };
            // NOBITS sections carry no relocations, and the synthesized common-symbol chunk has
            // no input section to read them from.
            if chunk.sh_type == elf::sht::NOBITS {
                continue;
            }
            let input_section = obj.object.section_by_index(object::SectionIndex(slot))?;
            for (_, rel) in input_section.relocations() {
                let object::RelocationFlags::Elf { r_type } = rel.flags() else {
                    unreachable!();
                };
                let bits = match RelocationKindInfo::from_raw(r_type)?.kind {
                    RelocationKind::Got | RelocationKind::GotRelative => rels::HAS_GOT_REL,
                    RelocationKind::PltRelative => rels::HAS_PLT_REL,
                    RelocationKind::TlsGd => rels::HAS_TLSGD_REL,
                    RelocationKind::TlsLd => rels::HAS_TLSLD_REL,
                    RelocationKind::GotTpOff => rels::HAS_GOTTP_REL,
                    _ => continue,
                };
                let object::RelocationTarget::Symbol(symbol_index) = rel.target() else {
                    continue;
                };
                if let Some(Some(symbol_id)) = obj.symbols.get(symbol_index.0) {
                    db.symbol(*symbol_id).rels.fetch_or(bits, Ordering::Relaxed);
                }
            }
        }
        Ok(())
    })
}

fn allocate_slots<'data>(
    files: &mut [LinkFile<'data>],
    db: &SymbolDb<'data>,
    args: &Args,
) -> Result {
    files.par_iter_mut().try_for_each(|file| -> Result {
        let Some(obj) = file.as_object_mut() else {
            return Ok(());
        };
        if !obj.is_alive() {
            return Ok(());
        }
        for symbol_id in obj.owned_symbols(db) {
            let sym = db.symbol(symbol_id);
            let demand = sym.rels.load(Ordering::Relaxed);
            if demand == 0 {
                continue;
            }
            if args.is_static {
                if demand & rels::HAS_GOT_REL != 0 {
                    sym.got_idx.store(obj.num_got as i32, Ordering::Relaxed);
                    obj.num_got += 1;
                }
                if demand & rels::HAS_PLT_REL != 0 && sym.has_flag(sym_flags::IFUNC) {
                    sym.plt_idx.store(obj.num_plt as i32, Ordering::Relaxed);
                    obj.num_plt += 1;
                    sym.gotplt_idx
                        .store(obj.num_gotplt as i32, Ordering::Relaxed);
                    obj.num_gotplt += 1;
                    sym.relplt_idx
                        .store(obj.num_relplt as i32, Ordering::Relaxed);
                    obj.num_relplt += 1;
                }
                if demand & (rels::HAS_TLSGD_REL | rels::HAS_TLSLD_REL) != 0 {
                    bail!(
                        "not implemented: TLS general/local-dynamic for `{}` in static mode",
                        db.symbol_name(symbol_id)
                    );
                }
                if demand & rels::HAS_GOTTP_REL != 0 {
                    sym.gottp_idx.store(obj.num_got as i32, Ordering::Relaxed);
                    obj.num_got += 1;
                }
            } else {
                let mut needs_dynsym = false;
                if demand & rels::HAS_GOT_REL != 0 {
                    sym.got_idx.store(obj.num_got as i32, Ordering::Relaxed);
                    obj.num_got += 1;
                    obj.num_reldyn += 1;
                    needs_dynsym = true;
                }
                if demand & rels::HAS_PLT_REL != 0 {
                    sym.plt_idx.store(obj.num_plt as i32, Ordering::Relaxed);
                    obj.num_plt += 1;
                    needs_dynsym = true;
                    if sym.got_idx.load(Ordering::Relaxed) == -1 {
                        sym.gotplt_idx
                            .store(obj.num_gotplt as i32, Ordering::Relaxed);
                        obj.num_gotplt += 1;
                        sym.relplt_idx
                            .store(obj.num_relplt as i32, Ordering::Relaxed);
                        obj.num_relplt += 1;
                    }
                }
                if demand & rels::HAS_TLSGD_REL != 0 {
                    sym.gotgd_idx.store(obj.num_got as i32, Ordering::Relaxed);
                    obj.num_got += 2;
                    obj.num_reldyn += 2;
                    needs_dynsym = true;
                }
                if demand & rels::HAS_TLSLD_REL != 0 {
                    sym.gotgd_idx.store(obj.num_got as i32, Ordering::Relaxed);
                    obj.num_got += 1;
                    obj.num_reldyn += 1;
                    needs_dynsym = true;
                }
                if demand & rels::HAS_GOTTP_REL != 0 {
                    sym.gottp_idx.store(obj.num_got as i32, Ordering::Relaxed);
                    obj.num_got += 1;
                }
                if needs_dynsym {
                    obj.dynsyms.push(symbol_id);
                }
            }
        }
        Ok(())
    })
}

/// Converts per-file slot counts into base offsets, in input order, and fixes the synthetic
/// sections' sizes. This is the only sequential part of scanning and is trivially cheap.
fn roll_up<'data>(
    files: &mut [LinkFile<'data>],
    db: &SymbolDb<'data>,
    out: &mut Out<'data>,
    args: &Args,
) {
    for file in files.iter_mut() {
        let Some(obj) = file.as_object_mut() else {
            continue;
        };
        if !obj.is_alive() {
            continue;
        }
        let got = &mut out.chunks[out.got.as_usize()].hdr;
        obj.got_offset = got.sh_size;
        got.sh_size += u64::from(obj.num_got) * elf::GOT_ENTRY_SIZE;

        let gotplt = &mut out.chunks[out.gotplt.as_usize()].hdr;
        obj.gotplt_offset = gotplt.sh_size;
        gotplt.sh_size += u64::from(obj.num_gotplt) * elf::GOT_ENTRY_SIZE;

        let plt = &mut out.chunks[out.plt.as_usize()].hdr;
        obj.plt_offset = plt.sh_size;
        plt.sh_size += u64::from(obj.num_plt) * elf::PLT_ENTRY_SIZE;

        let relplt = &mut out.chunks[out.relplt.as_usize()].hdr;
        obj.relplt_offset = relplt.sh_size;
        relplt.sh_size += u64::from(obj.num_relplt) * elf::RELA_ENTRY_SIZE;

        if let Some(reldyn_id) = out.reldyn {
            let reldyn = &mut out.chunks[reldyn_id.as_usize()].hdr;
            obj.reldyn_offset = reldyn.sh_size;
            reldyn.sh_size += u64::from(obj.num_reldyn) * elf::RELA_ENTRY_SIZE;
        }
    }

    if args.is_static {
        return;
    }

    // Dynamic symbol batches are appended per file, in input order, after index 0 which stays the
    // null entry. Names go into .dynstr after the SONAME block.
    let mut soname_bytes = 0u64;
    for file in files.iter_mut() {
        let Some(obj) = file.as_object_mut() else {
            continue;
        };
        if obj.is_dso && obj.is_alive() {
            if let Some(soname) = obj.soname {
                obj.soname_offset = 1 + soname_bytes;
                soname_bytes += soname.len() as u64 + 1;
            }
        }
    }

    let mut dynsyms = Vec::new();
    let mut name_offsets = Vec::new();
    let mut names = Vec::new();
    let names_offset = 1 + soname_bytes;
    for file in files.iter() {
        let Some(obj) = file.as_object() else {
            continue;
        };
        if !obj.is_alive() {
            continue;
        }
        for &symbol_id in &obj.dynsyms {
            db.symbol(symbol_id)
                .dynsym_idx
                .store(dynsyms.len() as i32 + 1, Ordering::Relaxed);
            name_offsets.push((names_offset + names.len() as u64) as u32);
            names.extend_from_slice(db.symbol_name(symbol_id).bytes());
            names.push(0);
            dynsyms.push(symbol_id);
        }
    }
    let num_dynsyms = dynsyms.len();

    if let Some(dynsym_id) = out.dynsym {
        let chunk = out.chunk_mut(dynsym_id);
        chunk.hdr.sh_size = (num_dynsyms as u64 + 1) * elf::SYMTAB_ENTRY_SIZE;
        chunk.hdr.sh_info = 1;
        let ChunkKind::Dynsym(dynsym) = &mut chunk.kind else {
            unreachable!();
        };
        dynsym.syms = dynsyms;
        dynsym.name_offsets = name_offsets;
    }
    if let Some(dynstr_id) = out.dynstr {
        let chunk = out.chunk_mut(dynstr_id);
        chunk.hdr.sh_size = names_offset + names.len() as u64;
        let ChunkKind::Dynstr(dynstr) = &mut chunk.kind else {
            unreachable!();
        };
        dynstr.names = names;
        dynstr.names_offset = names_offset;
    }
    if let Some(hash_id) = out.hash {
        // Classic SysV hash: nbucket, nchain, then one u32 per bucket and chain entry.
        let nbucket = (num_dynsyms as u64).max(1);
        let nchain = num_dynsyms as u64 + 1;
        out.chunk_mut(hash_id).hdr.sh_size = (2 + nbucket + nchain) * 4;
    }
    if let Some(dynamic_id) = out.dynamic {
        let count = out.dynamic_entry_count(count_needed(files));
        out.chunk_mut(dynamic_id).hdr.sh_size =
            count as u64 * core::mem::size_of::<elf::DynamicEntry>() as u64;
    }
}

pub(crate) fn count_needed(files: &[LinkFile]) -> usize {
    files
        .iter()
        .filter_map(LinkFile::as_object)
        .filter(|obj| obj.is_dso && obj.is_alive() && obj.soname.is_some())
        .count()
}
