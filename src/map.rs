//! The -print-map report: every output chunk with its address, offsets and size, and for sections
//! assembled from input files, one line per member.

use crate::chunks::ChunkKind;
use crate::chunks::Out;
use crate::parsing::LinkFile;
use object::Object;
use object::ObjectSection;
use std::sync::atomic::Ordering;

pub(crate) fn print_map<'data>(files: &[LinkFile<'data>], out: &Out<'data>) {
    println!(
        "{:>16} {:>10} {:>10} {:>6} section",
        "address", "offset", "size", "align"
    );
    for &id in &out.order {
        let chunk = out.chunk(id);
        let name = match chunk.kind {
            ChunkKind::Ehdr => "<ehdr>".to_owned(),
            ChunkKind::Phdr => "<phdr>".to_owned(),
            ChunkKind::Shdr => "<shdr>".to_owned(),
            _ => String::from_utf8_lossy(chunk.name).into_owned(),
        };
        println!(
            "{:>16x} {:>10x} {:>10x} {:>6} {}",
            chunk.hdr.sh_addr, chunk.hdr.sh_offset, chunk.hdr.sh_size, chunk.hdr.sh_addralign, name
        );
        let ChunkKind::Regular(section) = &chunk.kind else {
            continue;
        };
        for member in &section.members {
            let Some(obj) = files[member.file.as_usize()].as_object() else {
                continue;
            };
            let Some(input) = obj.section_chunk(member.slot) else {
                continue;
            };
            let section_name = obj
                .object
                .section_by_index(object::SectionIndex(member.slot))
                .ok()
                .and_then(|s| s.name_bytes().ok().map(|n| String::from_utf8_lossy(n).into_owned()))
                .unwrap_or_else(|| "<common>".to_owned());
            println!(
                "{:>16x} {:>10x} {:>10x} {:>6}     {} ({})",
                chunk.hdr.sh_addr + input.offset.load(Ordering::Relaxed),
                chunk.hdr.sh_offset + input.offset.load(Ordering::Relaxed),
                input.sh_size,
                input.sh_addralign,
                obj.input,
                section_name,
            );
        }
    }
}
