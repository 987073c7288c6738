//! Deduplication of SHF_MERGE|SHF_STRINGS sections. Each mergeable input section is split into
//! null-terminated pieces at parse time and the pieces are interned by content into the parent
//! merged output section, so identical strings from different files share one `StringPiece` node.
//! Which input section gets to emit a shared piece is decided by a lock-free election: every
//! section CASes itself into the piece's owner word and the best (lowest) priority wins. Offsets
//! are then assigned by the owners in parallel, and a final sequential pass over files gives each
//! input section its base offset within the parent, which makes the layout independent of how the
//! parallel election interleaved.

use crate::chunks::ChunkId;
use crate::chunks::Out;
use crate::error::Result;
use crate::hash::PassThroughHashMap;
use crate::parsing::LinkFile;
use colosseum::sync::Arena;
use crossbeam_utils::atomic::AtomicCell;
use rayon::prelude::IntoParallelRefMutIterator;
use rayon::prelude::ParallelIterator;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Mutex;

const MERGE_SHARDS: usize = 16;

const UNOWNED: u64 = u64::MAX;
const UNASSIGNED: u32 = u32::MAX;

pub(crate) type PieceArena<'data> = Arena<StringPiece<'data>>;

/// A deduplicated slice of a mergeable section, including its null terminator. Shared by every
/// input section that contains the same bytes.
pub(crate) struct StringPiece<'data> {
    pub(crate) data: &'data [u8],
    /// Packed (priority, section serial) of the currently-elected owner.
    owner: AtomicCell<u64>,
    /// Offset within the owning input section's run of owned pieces.
    output_offset: AtomicCell<u32>,
    /// Offset within the parent merged output section. Valid after roll-up.
    final_offset: AtomicCell<u64>,
}

impl<'data> StringPiece<'data> {
    fn new(data: &'data [u8]) -> StringPiece<'data> {
        StringPiece {
            data,
            owner: AtomicCell::new(UNOWNED),
            output_offset: AtomicCell::new(UNASSIGNED),
            final_offset: AtomicCell::new(0),
        }
    }

    pub(crate) fn final_offset(&self) -> u64 {
        self.final_offset.load()
    }
}

/// Per-file view of one mergeable input section: the pieces it contains, in input order.
pub(crate) struct MergeableSection<'data> {
    pub(crate) parent: ChunkId,
    /// Unique across the whole link; tie-breaks elections between sections of equal priority.
    pub(crate) serial: u32,
    pub(crate) priority: u32,
    pub(crate) align: u64,
    pub(crate) pieces: Vec<&'data StringPiece<'data>>,
    /// (bytes, hash) pairs held between parsing and piece registration.
    pub(crate) pending: Vec<(&'data [u8], u64)>,
    /// Input offset at which each piece starts, parallel to `pieces`.
    pub(crate) piece_offsets: Vec<u64>,
    /// Total bytes of the pieces this section owns.
    pub(crate) size: u64,
    /// Base of this section's owned pieces within the parent. Valid after roll-up.
    pub(crate) offset: u64,
}

impl<'data> MergeableSection<'data> {
    pub(crate) fn new(
        parent: ChunkId,
        serial: u32,
        priority: u32,
        align: u64,
    ) -> MergeableSection<'data> {
        MergeableSection {
            parent,
            serial,
            priority,
            align,
            pieces: Vec::new(),
            pending: Vec::new(),
            piece_offsets: Vec::new(),
            size: 0,
            offset: 0,
        }
    }

    fn election_key(&self) -> u64 {
        (u64::from(self.priority) << 32) | u64::from(self.serial)
    }

    pub(crate) fn owns(&self, piece: &StringPiece) -> bool {
        piece.owner.load() == self.election_key()
    }

    pub(crate) fn piece_output_offset(&self, piece: &StringPiece) -> u64 {
        u64::from(piece.output_offset.load())
    }

    /// Maps an offset within the input section to the piece containing it and the offset of the
    /// byte within that piece.
    pub(crate) fn resolve_offset(&self, input_offset: u64) -> Option<(&'data StringPiece<'data>, u64)> {
        let idx = self
            .piece_offsets
            .partition_point(|&start| start <= input_offset)
            .checked_sub(1)?;
        let piece = self.pieces[idx];
        let delta = input_offset - self.piece_offsets[idx];
        (delta < piece.data.len() as u64).then_some((piece, delta))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct PieceKey<'data> {
    hash: u64,
    bytes: &'data [u8],
}

impl<'data> Hash for PieceKey<'data> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

/// An output section holding deduplicated constants. The map from content to piece is sharded by
/// hash so that parse-time interning from many threads doesn't serialize on one lock.
pub(crate) struct MergedSection<'data> {
    shards: Vec<Mutex<PassThroughHashMap<PieceKey<'data>, &'data StringPiece<'data>>>>,
}

impl<'data> MergedSection<'data> {
    pub(crate) fn new() -> MergedSection<'data> {
        assert!(AtomicCell::<u64>::is_lock_free());
        MergedSection {
            shards: (0..MERGE_SHARDS).map(|_| Mutex::new(Default::default())).collect(),
        }
    }

    /// Returns the canonical piece for `bytes`, creating it if this content hasn't been seen.
    pub(crate) fn intern_piece(
        &self,
        arena: &'data PieceArena<'data>,
        bytes: &'data [u8],
        hash: u64,
    ) -> &'data StringPiece<'data> {
        let shard = &self.shards[(hash >> 60) as usize % MERGE_SHARDS];
        let mut map = shard.lock().unwrap();
        *map.entry(PieceKey { hash, bytes })
            .or_insert_with(|| &*arena.alloc(StringPiece::new(bytes)))
    }

    pub(crate) fn piece_count(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }
}

#[tracing::instrument(skip_all, name = "Merge strings")]
pub(crate) fn merge_strings<'data>(files: &mut [LinkFile<'data>], out: &mut Out<'data>) -> Result {
    elect_piece_owners(files);
    assign_piece_offsets(files);
    roll_up(files, out);
    Ok(())
}

/// Every mergeable section tries to install itself as each of its pieces' owner. The loop retries
/// until either our CAS lands or the installed owner has a better (lower) key than ours, so the
/// winner is the same no matter how threads interleave.
fn elect_piece_owners(files: &mut [LinkFile]) {
    files.par_iter_mut().for_each(|file| {
        let LinkFile::Object(obj) = file else { return };
        if !obj.is_alive() {
            return;
        }
        for isec in &obj.merge_sections {
            let key = isec.election_key();
            for piece in &isec.pieces {
                let mut cur = piece.owner.load();
                while cur == UNOWNED || cur > key {
                    match piece.owner.compare_exchange(cur, key) {
                        Ok(_) => break,
                        Err(actual) => cur = actual,
                    }
                }
            }
        }
    });
}

/// Each winning section walks its pieces in input order and hands out offsets to the ones it owns.
/// The offset check guards against a piece appearing twice in the same section.
fn assign_piece_offsets(files: &mut [LinkFile]) {
    files.par_iter_mut().for_each(|file| {
        let LinkFile::Object(obj) = file else { return };
        if !obj.is_alive() {
            return;
        }
        for isec in &mut obj.merge_sections {
            let key = isec.election_key();
            let mut offset = 0u64;
            for piece in &isec.pieces {
                if piece.owner.load() == key && piece.output_offset.load() == UNASSIGNED {
                    piece.output_offset.store(offset as u32);
                    offset += piece.data.len() as u64;
                }
            }
            isec.size = offset;
        }
    });
}

/// Sequentially accumulates each section's owned bytes into the parent's size. This pass is what
/// pins down the final layout: it only depends on file and section order, not on which thread won
/// which election first.
fn roll_up<'data>(files: &mut [LinkFile<'data>], out: &mut Out<'data>) {
    for file in files.iter_mut() {
        let LinkFile::Object(obj) = file else { continue };
        if !obj.is_alive() {
            continue;
        }
        for isec in &mut obj.merge_sections {
            let parent = out.chunk_mut(isec.parent);
            parent.hdr.sh_size = crate::alignment::align_to(parent.hdr.sh_size, isec.align);
            parent.hdr.sh_addralign = parent.hdr.sh_addralign.max(isec.align);
            isec.offset = parent.hdr.sh_size;
            parent.hdr.sh_size += isec.size;
        }
    }
    // Owned pieces get their offset within the parent, which is what symbol and relocation
    // resolution against merged sections uses.
    files.par_iter_mut().for_each(|file| {
        let LinkFile::Object(obj) = file else { return };
        if !obj.is_alive() {
            return;
        }
        for isec in &obj.merge_sections {
            let key = isec.election_key();
            for piece in &isec.pieces {
                if piece.owner.load() == key {
                    piece.final_offset.store(isec.offset + u64::from(piece.output_offset.load()));
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_piece_election_prefers_lower_priority() {
        let piece = StringPiece::new(b"hello\0");
        let better = MergeableSection::new(ChunkId::from_usize(0), 7, 1, 1);
        let worse = MergeableSection::new(ChunkId::from_usize(0), 3, 9, 1);
        piece.owner.store(worse.election_key());
        // A better-priority section takes over; a worse one backs off.
        let key = better.election_key();
        let mut cur = piece.owner.load();
        while cur == UNOWNED || cur > key {
            match piece.owner.compare_exchange(cur, key) {
                Ok(_) => break,
                Err(actual) => cur = actual,
            }
        }
        assert_eq!(piece.owner.load(), better.election_key());
    }

    #[test]
    fn test_resolve_offset() {
        let a = StringPiece::new(b"hello\0");
        let b = StringPiece::new(b"world\0");
        let mut isec = MergeableSection::new(ChunkId::from_usize(0), 0, 1, 1);
        isec.pieces = vec![&a, &b];
        isec.piece_offsets = vec![0, 6];
        let (piece, delta) = isec.resolve_offset(0).unwrap();
        assert!(std::ptr::eq(piece, &a));
        assert_eq!(delta, 0);
        let (piece, delta) = isec.resolve_offset(8).unwrap();
        assert!(std::ptr::eq(piece, &b));
        assert_eq!(delta, 2);
        assert!(isec.resolve_offset(12).is_none());
    }
}
