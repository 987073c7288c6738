//! Symbol resolution. Three phases, each a global barrier: every file offers its defined globals
//! to an atomic ownership election, then the set of live files is grown by walking undefined
//! references into archive members with a work-stealing traversal, and finally undefined weak
//! references are rewritten to absolute zero. A strong reference that still has no live owner at
//! the end is a link error, reported once per symbol.

use crate::args::Args;
use crate::chunks::Out;
use crate::error::Result;
use crate::input_data::FileId;
use crate::parsing::InputChunk;
use crate::parsing::CommonChunk;
use crate::parsing::LinkFile;
use crate::parsing::ObjectFile;
use crate::parsing::SectionSlot;
use crate::symbol_db::claim_key;
use crate::symbol_db::sym_flags;
use crate::symbol_db::SymbolDb;
use crate::symbol_db::SymbolId;
use anyhow::bail;
use crossbeam_queue::SegQueue;
use object::ObjectSymbol;
use rayon::prelude::IntoParallelRefIterator;
use rayon::prelude::IntoParallelRefMutIterator;
use rayon::prelude::ParallelIterator;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

#[tracing::instrument(skip_all, name = "Symbol resolution")]
pub(crate) fn resolve_symbols<'data>(
    files: &mut [LinkFile<'data>],
    db: &SymbolDb<'data>,
    args: &Args,
) -> Result {
    register_defined_symbols(files, db)?;
    commit_symbol_ownership(files, db)?;
    mark_live_archive_members(files, db)?;
    convert_undefined_weak(files, db)?;
    report_undefined(files, db)?;
    if args.trace {
        for file in files.iter() {
            if let Some(obj) = file.as_object() {
                if obj.is_alive() {
                    println!("{obj}");
                }
            }
        }
    }
    report_traced_symbols(files, db);
    Ok(())
}

/// Phase 1: every file, live or not, offers each of its defined globals to the ownership
/// election. Weak definitions lose to strong ones, then the lower priority number wins; priorities
/// are unique so there are no ties.
fn register_defined_symbols(files: &[LinkFile], db: &SymbolDb) -> Result {
    files.par_iter().try_for_each(|file| -> Result {
        let Some(obj) = file.as_object() else {
            return Ok(());
        };
        if obj.is_dso {
            for &(symbol_id, weak) in &obj.dso_defs {
                db.symbol(symbol_id)
                    .try_claim(claim_key(weak, obj.priority, obj.file_id));
            }
            return Ok(());
        }
        for (index, symbol_id) in obj.global_symbols() {
            let esym = obj.elf_symbol(index)?;
            if esym.is_undefined() {
                continue;
            }
            db.symbol(symbol_id)
                .try_claim(claim_key(esym.is_weak(), obj.priority, obj.file_id));
        }
        Ok(())
    })
}

/// After the election barrier, each winner records the local index and type of its definition on
/// the symbol node. Only the owning file's thread writes, per the shared-resource rules.
fn commit_symbol_ownership(files: &[LinkFile], db: &SymbolDb) -> Result {
    files.par_iter().try_for_each(|file| -> Result {
        let Some(obj) = file.as_object() else {
            return Ok(());
        };
        if obj.is_dso {
            return Ok(());
        }
        for (index, symbol_id) in obj.global_symbols() {
            let sym = db.symbol(symbol_id);
            if !sym.is_owned_by(obj.file_id) {
                continue;
            }
            sym.set_local_index(index);
            match crate::parsing::st_type(&obj.elf_symbol(index)?) {
                crate::elf::stt::GNU_IFUNC => sym.set_flag(sym_flags::IFUNC),
                crate::elf::stt::TLS => sym.set_flag(sym_flags::TLS),
                _ => {}
            }
        }
        Ok(())
    })
}

/// Phase 2: grows the live set. Starting from the files that are live by construction, walk each
/// live file's strong undefined references; a not-yet-live file that owns such a symbol becomes
/// live and is fed back to the pool as new work.
#[tracing::instrument(skip_all, name = "Archive pull-in")]
fn mark_live_archive_members<'data>(files: &[LinkFile<'data>], db: &SymbolDb<'data>) -> Result {
    let errors = SegQueue::new();
    rayon::scope(|scope| {
        for file in files {
            let Some(obj) = file.as_object() else {
                continue;
            };
            if obj.is_alive() && !obj.is_dso {
                let errors = &errors;
                scope.spawn(move |scope| walk_undefined_refs(obj, files, db, scope, errors));
            }
        }
    });
    match errors.pop() {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

fn walk_undefined_refs<'scope, 'data: 'scope>(
    obj: &'scope ObjectFile<'data>,
    files: &'scope [LinkFile<'data>],
    db: &'scope SymbolDb<'data>,
    scope: &rayon::Scope<'scope>,
    errors: &'scope SegQueue<crate::error::Error>,
) {
    for (index, symbol_id) in obj.global_symbols() {
        let esym = match obj.elf_symbol(index) {
            Ok(esym) => esym,
            Err(error) => {
                errors.push(error);
                return;
            }
        };
        if !esym.is_undefined() || esym.is_weak() {
            continue;
        }
        let Some(owner) = db.symbol(symbol_id).owner_file() else {
            continue;
        };
        let Some(other) = files[owner.as_usize()].as_object() else {
            continue;
        };
        if !other.is_alive.swap(true, Ordering::AcqRel) {
            // Newly activated; its own references may pull in more members.
            scope.spawn(move |scope| walk_undefined_refs(other, files, db, scope, errors));
        }
    }
}

fn owner_is_alive(symbol_id: SymbolId, files: &[LinkFile], db: &SymbolDb) -> bool {
    match db.symbol(symbol_id).owner_file() {
        Some(owner) => match &files[owner.as_usize()] {
            LinkFile::Internal(_) => true,
            LinkFile::Object(obj) => obj.is_alive(),
        },
        None => false,
    }
}

/// Phase 3: remaining undefined weak references become absolute symbols with value 0.
fn convert_undefined_weak(files: &[LinkFile], db: &SymbolDb) -> Result {
    files.par_iter().try_for_each(|file| -> Result {
        let Some(obj) = file.as_object() else {
            return Ok(());
        };
        if obj.is_dso || !obj.is_alive() {
            return Ok(());
        }
        for (index, symbol_id) in obj.global_symbols() {
            let esym = obj.elf_symbol(index)?;
            if esym.is_undefined() && esym.is_weak() && !owner_is_alive(symbol_id, files, db) {
                db.symbol(symbol_id).set_flag(sym_flags::ABSOLUTE_ZERO);
            }
        }
        Ok(())
    })
}

/// A strong reference that survives all three phases without a live owner is fatal. Each symbol is
/// reported once, with the best-priority file that referenced it.
fn report_undefined(files: &[LinkFile], db: &SymbolDb) -> Result {
    let undefined = SegQueue::new();
    files.par_iter().try_for_each(|file| -> Result {
        let Some(obj) = file.as_object() else {
            return Ok(());
        };
        if obj.is_dso || !obj.is_alive() {
            return Ok(());
        }
        for (index, symbol_id) in obj.global_symbols() {
            let esym = obj.elf_symbol(index)?;
            if esym.is_undefined() && !esym.is_weak() && !owner_is_alive(symbol_id, files, db) {
                undefined.push((symbol_id, obj.priority, obj.file_id));
            }
        }
        Ok(())
    })?;
    if undefined.is_empty() {
        return Ok(());
    }
    let mut list: Vec<(SymbolId, u32, FileId)> = std::iter::from_fn(|| undefined.pop()).collect();
    list.sort_unstable();
    list.dedup_by_key(|(symbol_id, _, _)| *symbol_id);
    let mut message = String::from("undefined symbols:");
    for (symbol_id, _, file_id) in list {
        let Some(obj) = files[file_id.as_usize()].as_object() else {
            continue;
        };
        message.push_str(&format!(
            "\n  {}: referenced by {}",
            db.symbol_name(symbol_id),
            obj
        ));
    }
    bail!(message)
}

fn report_traced_symbols(files: &[LinkFile], db: &SymbolDb) {
    for &symbol_id in &db.traced {
        let name = db.symbol_name(symbol_id);
        let sym = db.symbol(symbol_id);
        match sym.owner_file() {
            Some(owner) if owner_is_alive(symbol_id, files, db) => {
                match &files[owner.as_usize()] {
                    LinkFile::Internal(_) => println!("trace-symbol: {name}: linker synthesized"),
                    LinkFile::Object(obj) => println!("trace-symbol: {name}: defined in {obj}"),
                }
            }
            _ if sym.has_flag(sym_flags::ABSOLUTE_ZERO) => {
                println!("trace-symbol: {name}: weak reference converted to absolute zero");
            }
            _ => println!("trace-symbol: {name}: not defined"),
        }
    }
}

/// Converts each live file's owned common symbols into a synthesized chunk in .bss, giving each
/// symbol an offset within it. The chunk then flows through binning and layout like any other
/// input section.
#[tracing::instrument(skip_all, name = "Convert common symbols")]
pub(crate) fn convert_common_symbols<'data>(
    files: &mut [LinkFile<'data>],
    db: &SymbolDb<'data>,
    out: &mut Out<'data>,
) -> Result {
    let bss = out.add_regular_section(
        b".bss",
        crate::elf::sht::NOBITS,
        crate::elf::shf::ALLOC | crate::elf::shf::WRITE,
    );
    files.par_iter_mut().try_for_each(|file| -> Result {
        let Some(obj) = file.as_object_mut() else {
            return Ok(());
        };
        if obj.is_dso || !obj.is_alive() {
            return Ok(());
        }
        let mut symbols = Vec::new();
        let mut size = 0u64;
        let mut max_align = 1u64;
        for (index, symbol_id) in obj.global_symbols() {
            let esym = obj.elf_symbol(index)?;
            if !esym.is_common() || !db.symbol(symbol_id).is_owned_by(obj.file_id) {
                continue;
            }
            // For a common symbol st_value holds the required alignment.
            let align = esym.address().max(1);
            size = crate::alignment::align_to(size, align);
            symbols.push((symbol_id, size));
            size += esym.size();
            max_align = max_align.max(align);
        }
        if symbols.is_empty() {
            return Ok(());
        }
        let slot = obj.sections.len();
        obj.sections.push(SectionSlot::Loaded(InputChunk {
            osec: bss,
            sh_type: crate::elf::sht::NOBITS,
            sh_flags: crate::elf::shf::ALLOC | crate::elf::shf::WRITE,
            sh_size: size,
            sh_addralign: max_align,
            offset: AtomicU64::new(0),
        }));
        obj.common = Some(CommonChunk { slot, symbols });
        Ok(())
    })
}
