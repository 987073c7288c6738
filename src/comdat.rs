//! COMDAT group deduplication. Groups with the same signature across files must contribute
//! exactly one copy of their sections to the output. Election mirrors symbol resolution: the
//! lexicographically smallest (priority, file ID) pair wins, decided by `fetch_min` on a packed
//! word, then every losing instance nullifies its member sections in place.

use crate::error::Result;
use crate::parsing::LinkFile;
use crate::parsing::SectionSlot;
use ahash::AHashMap;
use rayon::prelude::IntoParallelRefIterator;
use rayon::prelude::IntoParallelRefMutIterator;
use rayon::prelude::ParallelIterator;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

#[tracing::instrument(skip_all, name = "Eliminate duplicate COMDAT groups")]
pub(crate) fn eliminate_duplicate_groups(files: &mut [LinkFile]) -> Result {
    let mut keepers: AHashMap<&[u8], AtomicU64> = AHashMap::new();
    for file in files.iter() {
        let Some(obj) = file.as_object() else {
            continue;
        };
        if !obj.is_alive() {
            continue;
        }
        for group in &obj.comdat_groups {
            keepers
                .entry(group.signature)
                .or_insert_with(|| AtomicU64::new(u64::MAX));
        }
    }

    files.par_iter().for_each(|file| {
        let Some(obj) = file.as_object() else { return };
        if !obj.is_alive() {
            return;
        }
        let key = election_key(obj.priority, obj.file_id.as_u32());
        for group in &obj.comdat_groups {
            keepers[group.signature].fetch_min(key, Ordering::AcqRel);
        }
    });

    files.par_iter_mut().for_each(|file| {
        let Some(obj) = file.as_object_mut() else { return };
        if !obj.is_alive() {
            return;
        }
        let key = election_key(obj.priority, obj.file_id.as_u32());
        for group_index in 0..obj.comdat_groups.len() {
            let signature = obj.comdat_groups[group_index].signature;
            if keepers[signature].load(Ordering::Acquire) == key {
                continue;
            }
            // This instance lost; later phases skip nullified slots.
            for section_index in obj.comdat_groups[group_index].sections.clone() {
                if let Some(slot) = obj.sections.get_mut(section_index) {
                    *slot = SectionSlot::Discard;
                }
            }
        }
    });
    Ok(())
}

fn election_key(priority: u32, file_id: u32) -> u64 {
    (u64::from(priority) << 32) | u64::from(file_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_election_key_orders_by_priority_then_file() {
        assert!(election_key(1, 9) < election_key(2, 0));
        assert!(election_key(3, 1) < election_key(3, 2));
    }
}
