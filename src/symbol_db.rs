//! The process-wide symbol directory. Every global symbol name from every input file is interned
//! here exactly once, producing a stable `Symbol` node that all later phases share. The node's
//! mutable state is entirely atomic: ownership is decided by a compare-and-swap style election on
//! a packed word, relocation demand accumulates in a byte-wide bitset and the various table
//! indices are written only by the owning file's thread between phase barriers.

use crate::error::Result;
use crate::hash::PassThroughHashMap;
use crate::input_data::FileId;
use anyhow::Context;
use std::collections::hash_map;
use std::fmt::Display;
use std::hash::Hasher;
use std::num::NonZeroU32;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

/// Relocation-kind demand bits, OR'd into `Symbol::rels` while scanning.
pub(crate) mod rels {
    pub(crate) const HAS_GOT_REL: u8 = 1 << 0;
    pub(crate) const HAS_PLT_REL: u8 = 1 << 1;
    pub(crate) const HAS_TLSGD_REL: u8 = 1 << 2;
    pub(crate) const HAS_TLSLD_REL: u8 = 1 << 3;
    pub(crate) const HAS_GOTTP_REL: u8 = 1 << 4;
}

pub(crate) mod sym_flags {
    /// The owning definition is an STT_GNU_IFUNC.
    pub(crate) const IFUNC: u8 = 1 << 0;
    /// The owning definition is thread-local.
    pub(crate) const TLS: u8 = 1 << 1;
    /// An undefined weak reference that was rewritten to absolute zero.
    pub(crate) const ABSOLUTE_ZERO: u8 = 1 << 2;
    /// Resolution events for this symbol are reported (-trace-symbol).
    pub(crate) const TRACED: u8 = 1 << 3;
}

/// Files with this priority lose an ownership contest against any real input. Used by the internal
/// file so that user code can override linker-synthesized symbols.
pub(crate) const INTERNAL_PRIORITY: u32 = 0x7fff_ffff;

const UNCLAIMED: u64 = u64::MAX;

/// An index into the symbol directory. This is as opposed to a symbol index within an object file,
/// which is only meaningful together with that file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct SymbolId(NonZeroU32);

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct SymbolName<'data> {
    /// Precomputed so that hashing can happen on multiple threads while the directory itself is
    /// built single threaded.
    hash: u64,
    bytes: &'data [u8],
}

pub(crate) struct Symbol {
    /// Packed ownership word: weak bit, then priority, then file ID, so that a numerically smaller
    /// word is a strictly better claim. `fetch_min` is the whole election.
    owner: AtomicU64,
    pub(crate) rels: AtomicU8,
    flags: AtomicU8,
    local_index: AtomicU32,
    /// Output section header index for the symbol table, with SHN_ABS etc. in the low 16 bits.
    pub(crate) shndx: AtomicU32,
    /// Final virtual address, valid once layout has run.
    pub(crate) addr: AtomicU64,
    pub(crate) got_idx: AtomicI32,
    pub(crate) plt_idx: AtomicI32,
    pub(crate) gotplt_idx: AtomicI32,
    pub(crate) relplt_idx: AtomicI32,
    pub(crate) gottp_idx: AtomicI32,
    pub(crate) gotgd_idx: AtomicI32,
    pub(crate) gotld_idx: AtomicI32,
    pub(crate) dynsym_idx: AtomicI32,
}

pub(crate) struct SymbolDb<'data> {
    symbol_ids: PassThroughHashMap<SymbolName<'data>, SymbolId>,
    symbols: Vec<Symbol>,
    symbol_names: Vec<SymbolName<'data>>,
    pub(crate) traced: Vec<SymbolId>,
}

pub(crate) fn claim_key(weak: bool, priority: u32, file_id: FileId) -> u64 {
    (u64::from(weak) << 63) | (u64::from(priority) << 32) | u64::from(file_id.as_u32())
}

impl Symbol {
    fn new() -> Symbol {
        Symbol {
            owner: AtomicU64::new(UNCLAIMED),
            rels: AtomicU8::new(0),
            flags: AtomicU8::new(0),
            local_index: AtomicU32::new(0),
            shndx: AtomicU32::new(0),
            addr: AtomicU64::new(0),
            got_idx: AtomicI32::new(-1),
            plt_idx: AtomicI32::new(-1),
            gotplt_idx: AtomicI32::new(-1),
            relplt_idx: AtomicI32::new(-1),
            gottp_idx: AtomicI32::new(-1),
            gotgd_idx: AtomicI32::new(-1),
            gotld_idx: AtomicI32::new(-1),
            dynsym_idx: AtomicI32::new(-1),
        }
    }

    /// Offers `key` as a new owner. The claim with the numerically smallest key wins, no matter
    /// how the contending threads interleave.
    pub(crate) fn try_claim(&self, key: u64) {
        self.owner.fetch_min(key, Ordering::AcqRel);
    }

    pub(crate) fn owner_file(&self) -> Option<FileId> {
        let word = self.owner.load(Ordering::Acquire);
        (word != UNCLAIMED).then(|| FileId::new(word as u32))
    }

    pub(crate) fn is_owned_by(&self, file_id: FileId) -> bool {
        self.owner_file() == Some(file_id)
    }

    pub(crate) fn set_flag(&self, flag: u8) {
        self.flags.fetch_or(flag, Ordering::Relaxed);
    }

    pub(crate) fn has_flag(&self, flag: u8) -> bool {
        self.flags.load(Ordering::Relaxed) & flag != 0
    }

    /// The symbol index within the owning file. Only meaningful after resolution has committed
    /// owned symbols.
    pub(crate) fn local_index(&self) -> usize {
        self.local_index.load(Ordering::Relaxed) as usize
    }

    pub(crate) fn set_local_index(&self, index: usize) {
        self.local_index.store(index as u32, Ordering::Relaxed);
    }

    pub(crate) fn address(&self) -> u64 {
        self.addr.load(Ordering::Relaxed)
    }
}

impl<'data> SymbolDb<'data> {
    pub(crate) fn new() -> SymbolDb<'data> {
        // Symbol 0 is never used, which lets us represent IDs with a NonZeroU32.
        SymbolDb {
            symbol_ids: Default::default(),
            symbols: vec![Symbol::new()],
            symbol_names: vec![SymbolName::placeholder()],
            traced: Vec::new(),
        }
    }

    /// Interns `name`, creating a fresh symbol node the first time it's seen.
    pub(crate) fn add_symbol(&mut self, name: SymbolName<'data>) -> Result<SymbolId> {
        match self.symbol_ids.entry(name) {
            hash_map::Entry::Occupied(entry) => Ok(*entry.get()),
            hash_map::Entry::Vacant(entry) => {
                let symbol_id = self.symbols.len().try_into()?;
                entry.insert(symbol_id);
                self.symbols.push(Symbol::new());
                self.symbol_names.push(name);
                Ok(symbol_id)
            }
        }
    }

    pub(crate) fn get(&self, name: &SymbolName) -> Option<SymbolId> {
        self.symbol_ids.get(name).copied()
    }

    pub(crate) fn symbol(&self, symbol_id: SymbolId) -> &Symbol {
        &self.symbols[symbol_id.as_usize()]
    }

    pub(crate) fn symbol_name(&self, symbol_id: SymbolId) -> SymbolName<'data> {
        self.symbol_names[symbol_id.as_usize()]
    }

    pub(crate) fn num_symbols(&self) -> usize {
        self.symbols.len()
    }

    pub(crate) fn mark_traced(&mut self, names: &'data [String]) -> Result {
        for name in names {
            let id = self.add_symbol(SymbolName::new(name.as_bytes()))?;
            self.symbol(id).set_flag(sym_flags::TRACED);
            self.traced.push(id);
        }
        Ok(())
    }
}

impl<'data> SymbolName<'data> {
    pub(crate) fn placeholder() -> SymbolName<'static> {
        SymbolName::new(&[])
    }

    pub(crate) fn new(bytes: &'data [u8]) -> SymbolName<'data> {
        Self {
            bytes,
            hash: crate::hash::hash_bytes(bytes),
        }
    }

    pub(crate) fn bytes(&self) -> &'data [u8] {
        self.bytes
    }
}

impl<'data> std::hash::Hash for SymbolName<'data> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // The stored hash is already a hash of the bytes.
        state.write_u64(self.hash);
    }
}

impl SymbolId {
    pub(crate) fn as_usize(self) -> usize {
        self.0.get() as usize
    }
}

impl TryFrom<usize> for SymbolId {
    type Error = crate::error::Error;

    fn try_from(value: usize) -> std::result::Result<Self, Self::Error> {
        Ok(SymbolId(
            NonZeroU32::new(u32::try_from(value).context("Too many symbols")?)
                .context("Attempt to create SymbolId with ID 0")?,
        ))
    }
}

impl<'data> Display for SymbolName<'data> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        String::from_utf8_lossy(self.bytes).fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_ordering() {
        // A strong claim from a worse-priority file still beats a weak claim from a better one,
        // and among strong claims the lower priority number wins.
        let weak_early = claim_key(true, 1, FileId::new(1));
        let strong_late = claim_key(false, 9, FileId::new(9));
        let strong_early = claim_key(false, 2, FileId::new(2));
        assert!(strong_late < weak_early);
        assert!(strong_early < strong_late);

        let sym = Symbol::new();
        assert_eq!(sym.owner_file(), None);
        sym.try_claim(weak_early);
        assert_eq!(sym.owner_file(), Some(FileId::new(1)));
        sym.try_claim(strong_late);
        assert_eq!(sym.owner_file(), Some(FileId::new(9)));
        sym.try_claim(strong_early);
        assert_eq!(sym.owner_file(), Some(FileId::new(2)));
        // A worse claim never displaces a better one.
        sym.try_claim(strong_late);
        assert_eq!(sym.owner_file(), Some(FileId::new(2)));
    }

    #[test]
    fn test_intern_dedups() {
        let mut db = SymbolDb::new();
        let a = db.add_symbol(SymbolName::new(b"foo")).unwrap();
        let b = db.add_symbol(SymbolName::new(b"foo")).unwrap();
        let c = db.add_symbol(SymbolName::new(b"bar")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(db.num_symbols(), 3);
    }
}
