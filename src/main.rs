mod alignment;
mod archive;
mod args;
mod bin_sections;
mod chunks;
mod comdat;
mod elf;
mod error;
mod file_kind;
mod hash;
mod input_data;
mod layout;
mod map;
mod merge;
mod parsing;
mod resolve;
mod scan;
mod symbol_db;
mod write;

use crate::error::Result;

fn main() -> Result {
    let args = args::Args::from_env()?;
    args::init_tracing();
    link(&args)
}

#[tracing::instrument(skip_all, name = "Link")]
fn link(args: &args::Args) -> Result {
    args.setup_thread_pool()?;
    let input_data = input_data::InputData::from_args(args)?;
    let inputs = input_data::expand_archives(&input_data)?;
    let piece_arena = merge::PieceArena::new();
    let mut out = chunks::Out::new(args);
    let (db, mut files) = parsing::parse_input_files(&inputs, args, &piece_arena, &mut out)?;
    resolve::resolve_symbols(&mut files, &db, args)?;
    comdat::eliminate_duplicate_groups(&mut files)?;
    merge::merge_strings(&mut files, &mut out)?;
    resolve::convert_common_symbols(&mut files, &db, &mut out)?;
    bin_sections::bin_sections(&files, &mut out);
    bin_sections::assign_section_offsets(&files, &mut out);
    scan::scan_relocations(&mut files, &db, &mut out, args)?;
    layout::compute_layout(&mut files, &db, &mut out, args)?;
    write::write_output(&files, &db, &out, args)?;
    if args.print_map {
        map::print_map(&files, &out);
    }
    if args.stat {
        print_stats(&files, &out);
    }
    Ok(())
}

fn print_stats(files: &[parsing::LinkFile], out: &chunks::Out) {
    let num_alive = files
        .iter()
        .filter_map(parsing::LinkFile::as_object)
        .filter(|obj| obj.is_alive())
        .count();
    let num_input_sections: usize = files
        .iter()
        .filter_map(parsing::LinkFile::as_object)
        .map(|obj| obj.sections.len())
        .sum();
    println!("files={}", files.len() - 1);
    println!("alive_files={num_alive}");
    println!("input_sections={num_input_sections}");
    println!("output_chunks={}", out.order.len());
    println!("merged_strings={}", out.merged_piece_count());
    println!("filesize={}", out.filesize);
}
