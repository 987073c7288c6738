//! Builds the reverse edge from output sections to their member input chunks, then assigns each
//! member its offset within the section. Both steps are sliced so that an output section with
//! millions of members still spreads across the pool: binning slices the file list, offset
//! assignment slices each member list, with a short sequential prefix-sum stitching the slices
//! together.

use crate::alignment::align_to;
use crate::chunks::ChunkKind;
use crate::chunks::Member;
use crate::chunks::Out;
use crate::input_data::FileId;
use crate::parsing::InputChunk;
use crate::parsing::LinkFile;
use crate::parsing::SectionSlot;
use rayon::prelude::IndexedParallelIterator;
use rayon::prelude::IntoParallelIterator;
use rayon::prelude::IntoParallelRefIterator;
use rayon::prelude::IntoParallelRefMutIterator;
use rayon::prelude::ParallelIterator;
use std::sync::atomic::Ordering;

/// Target number of file slices for binning.
const BIN_SLICES: usize = 128;

/// Members per slice when assigning intra-section offsets.
const OFFSET_SLICE: usize = 100_000;

#[tracing::instrument(skip_all, name = "Bin sections")]
pub(crate) fn bin_sections(files: &[LinkFile], out: &mut Out) {
    let alive: Vec<FileId> = files
        .iter()
        .filter_map(|file| {
            let obj = file.as_object()?;
            (obj.is_alive() && !obj.is_dso).then_some(obj.file_id)
        })
        .collect();
    if alive.is_empty() {
        return;
    }
    let num_osec = out.chunks.len();
    let unit = alive.len().div_ceil(BIN_SLICES);
    let slices: Vec<&[FileId]> = alive.chunks(unit).collect();

    // Each slice builds its own per-output-section member lists, so no two threads ever touch the
    // same list. Insertion order is (slice, file within slice, section within file).
    let groups: Vec<Vec<Vec<Member>>> = slices
        .par_iter()
        .map(|slice| {
            let mut group = vec![Vec::new(); num_osec];
            for &file_id in *slice {
                let obj = files[file_id.as_usize()].as_object().unwrap();
                for (slot, section) in obj.sections.iter().enumerate() {
                    if let SectionSlot::Loaded(chunk) = section {
                        group[chunk.osec.as_usize()].push(Member { file: file_id, slot });
                    }
                }
            }
            group
        })
        .collect();

    let mut sizes = vec![0usize; num_osec];
    for group in &groups {
        for (size, members) in sizes.iter_mut().zip(group) {
            *size += members.len();
        }
    }

    out.chunks
        .par_iter_mut()
        .enumerate()
        .for_each(|(osec_index, chunk)| {
            let ChunkKind::Regular(section) = &mut chunk.kind else {
                return;
            };
            section.members.reserve(sizes[osec_index]);
            for group in &groups {
                section.members.extend_from_slice(&group[osec_index]);
            }
        });
}

#[tracing::instrument(skip_all, name = "Assign section offsets")]
pub(crate) fn assign_section_offsets(files: &[LinkFile], out: &mut Out) {
    out.chunks.par_iter_mut().for_each(|chunk| {
        let ChunkKind::Regular(section) = &chunk.kind else {
            return;
        };
        if section.members.is_empty() {
            return;
        }
        let slices: Vec<&[Member]> = section.members.chunks(OFFSET_SLICE).collect();

        // Per-slice local offsets plus the alignment each slice needs.
        let results: Vec<(u64, u64)> = slices
            .par_iter()
            .map(|slice| {
                let mut offset = 0u64;
                let mut align = 1u64;
                for member in *slice {
                    let input = input_chunk(files, member);
                    offset = align_to(offset, input.sh_addralign);
                    input.offset.store(offset, Ordering::Relaxed);
                    offset += input.sh_size;
                    align = align.max(input.sh_addralign);
                }
                (offset, align)
            })
            .collect();

        let align = results.iter().map(|(_, align)| *align).max().unwrap_or(1);
        let mut starts = vec![0u64; slices.len()];
        for i in 1..slices.len() {
            starts[i] = align_to(starts[i - 1] + results[i - 1].0, align);
        }
        (1..slices.len()).into_par_iter().for_each(|i| {
            for member in slices[i] {
                input_chunk(files, member)
                    .offset
                    .fetch_add(starts[i], Ordering::Relaxed);
            }
        });

        chunk.hdr.sh_size = starts[slices.len() - 1] + results[slices.len() - 1].0;
        chunk.hdr.sh_addralign = align;
    });
}

pub(crate) fn input_chunk<'a>(files: &'a [LinkFile], member: &Member) -> &'a InputChunk {
    files[member.file.as_usize()]
        .as_object()
        .and_then(|obj| obj.section_chunk(member.slot))
        .expect("member refers to a loaded section")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_math() {
        // 300 files over 128 slices gives slices of 3 with the tail shorter.
        let unit = 300usize.div_ceil(BIN_SLICES);
        assert_eq!(unit, 3);
        let slices: Vec<_> = (0..300).collect::<Vec<_>>();
        assert_eq!(slices.chunks(unit).count(), 100);
    }
}
