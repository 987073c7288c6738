//! End-to-end tests. Each test assembles real relocatable objects in memory with the object
//! crate's writer, links them with the weld binary, then parses the output image back and checks
//! what the linker produced.

use object::Object as _;
use object::ObjectSection as _;
use object::ObjectSymbol as _;
use std::path::Path;
use std::path::PathBuf;

const SHF_ALLOC: u64 = 0x2;
const SHF_MERGE: u64 = 0x10;
const SHF_STRINGS: u64 = 0x20;
const PAGE_SIZE: u64 = 4096;

fn test_dir(test: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("weld-test-{}-{test}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn new_object() -> object::write::Object<'static> {
    object::write::Object::new(
        object::BinaryFormat::Elf,
        object::Architecture::X86_64,
        object::Endianness::Little,
    )
}

fn global_symbol(
    obj: &mut object::write::Object,
    name: &str,
    section: object::write::SectionId,
    value: u64,
    size: u64,
    kind: object::SymbolKind,
) -> object::write::SymbolId {
    obj.add_symbol(object::write::Symbol {
        name: name.as_bytes().to_vec(),
        value,
        size,
        kind,
        scope: object::SymbolScope::Dynamic,
        weak: false,
        section: object::write::SymbolSection::Section(section),
        flags: object::SymbolFlags::None,
    })
}

fn undefined_symbol(
    obj: &mut object::write::Object,
    name: &str,
    weak: bool,
) -> object::write::SymbolId {
    obj.add_symbol(object::write::Symbol {
        name: name.as_bytes().to_vec(),
        value: 0,
        size: 0,
        kind: object::SymbolKind::Unknown,
        scope: object::SymbolScope::Dynamic,
        weak,
        section: object::write::SymbolSection::Undefined,
        flags: object::SymbolFlags::None,
    })
}

fn reloc(
    obj: &mut object::write::Object,
    section: object::write::SectionId,
    offset: u64,
    symbol: object::write::SymbolId,
    r_type: u32,
    addend: i64,
) {
    obj.add_relocation(
        section,
        object::write::Relocation {
            offset,
            symbol,
            addend,
            flags: object::RelocationFlags::Elf { r_type },
        },
    )
    .unwrap();
}

/// An object whose `_start` calls a helper then performs the exit syscall with status 0.
fn start_object() -> Vec<u8> {
    let mut obj = new_object();
    let text = obj.add_section(Vec::new(), b".text".to_vec(), object::SectionKind::Text);
    let code = [
        0xe8, 0x00, 0x00, 0x00, 0x00, // call helper
        0xb8, 0x3c, 0x00, 0x00, 0x00, // mov eax, 60
        0x31, 0xff, // xor edi, edi
        0x0f, 0x05, // syscall
        0x90, 0x90, // padding
        0xc3, // helper: ret
    ];
    obj.set_section_data(text, &code[..], 16);
    global_symbol(&mut obj, "_start", text, 0, 14, object::SymbolKind::Text);
    let helper = global_symbol(&mut obj, "helper", text, 16, 1, object::SymbolKind::Text);
    reloc(&mut obj, text, 1, helper, object::elf::R_X86_64_PLT32, -4);
    obj.write().unwrap()
}

/// An object defining `name` as `payload` bytes in .data, optionally with an absolute relocation
/// to `reference` in the middle of the payload.
fn data_object(name: &str, payload_len: u64, reference: Option<&str>) -> Vec<u8> {
    let mut obj = new_object();
    let data = obj.add_section(Vec::new(), b".data".to_vec(), object::SectionKind::Data);
    obj.set_section_data(data, vec![0u8; payload_len as usize], 8);
    global_symbol(&mut obj, name, data, 0, payload_len, object::SymbolKind::Data);
    if let Some(reference) = reference {
        let target = undefined_symbol(&mut obj, reference, false);
        reloc(&mut obj, data, 0, target, object::elf::R_X86_64_64, 0);
    }
    obj.write().unwrap()
}

fn write_archive(path: &Path, members: &[(&str, &[u8])]) {
    let identifiers = members
        .iter()
        .map(|(name, _)| name.as_bytes().to_vec())
        .collect();
    let mut builder = ar::GnuBuilder::new(Vec::new(), identifiers);
    for (name, data) in members {
        let header = ar::Header::new(name.as_bytes().to_vec(), data.len() as u64);
        builder.append(&header, *data).unwrap();
    }
    std::fs::write(path, builder.into_inner().unwrap()).unwrap();
}

fn link(dir: &Path, output_name: &str, flags: &[&str], inputs: &[&Path]) -> PathBuf {
    let output = try_link(dir, output_name, flags, inputs);
    assert!(
        output.0.status.success(),
        "link failed: {}",
        String::from_utf8_lossy(&output.0.stderr)
    );
    output.1
}

fn try_link(
    dir: &Path,
    output_name: &str,
    flags: &[&str],
    inputs: &[&Path],
) -> (std::process::Output, PathBuf) {
    let out_path = dir.join(output_name);
    let mut cmd = std::process::Command::new(env!("CARGO_BIN_EXE_weld"));
    cmd.arg("-o").arg(&out_path);
    cmd.args(flags);
    for input in inputs {
        cmd.arg(input);
    }
    (cmd.output().unwrap(), out_path)
}

fn section_rank(sh_flags: u64, is_nobits: bool) -> u32 {
    let alloc = u32::from(sh_flags & 0x2 != 0);
    let writable = u32::from(sh_flags & 0x1 != 0);
    let exec = u32::from(sh_flags & 0x4 != 0);
    let tls = u32::from(sh_flags & 0x400 != 0);
    (alloc << 5) | ((1 - writable) << 4) | ((1 - exec) << 3) | (tls << 2) | u32::from(!is_nobits)
}

#[test]
fn static_hello() {
    let dir = test_dir("static-hello");
    let obj_path = dir.join("start.o");
    std::fs::write(&obj_path, start_object()).unwrap();
    let exe = link(&dir, "hello", &["-static"], &[&obj_path]);

    let bytes = std::fs::read(&exe).unwrap();
    let parsed = object::read::File::parse(&*bytes).unwrap();
    let start = parsed
        .symbols()
        .find(|s| s.name() == Ok("_start"))
        .expect("_start in symtab");
    assert_eq!(parsed.entry(), start.address());
    assert!(start.address() >= 0x200000);
    let etext = parsed
        .symbols()
        .find(|s| s.name() == Ok("_etext"))
        .expect("_etext in symtab");
    assert!(etext.address() >= start.address() + 14);

    // The loadable .text bytes match the input section.
    let text = parsed.section_by_name(".text").unwrap();
    let data = text.data().unwrap();
    assert_eq!(&data[5..14], &[0xb8, 0x3c, 0, 0, 0, 0x31, 0xff, 0x0f, 0x05]);

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    {
        let status = std::process::Command::new(&exe).status().unwrap();
        assert_eq!(status.code(), Some(0));
    }
}

#[test]
fn layout_invariants() {
    let dir = test_dir("layout-invariants");
    let obj_path = dir.join("start.o");
    std::fs::write(&obj_path, start_object()).unwrap();
    let exe = link(&dir, "out", &["-static"], &[&obj_path]);

    let bytes = std::fs::read(&exe).unwrap();
    let parsed = object::read::File::parse(&*bytes).unwrap();
    let mut last_rank = None;
    for section in parsed.sections() {
        let object::SectionFlags::Elf { sh_flags } = section.flags() else {
            panic!("not elf");
        };
        let is_nobits = section.kind() == object::SectionKind::UninitializedData;
        if let Some((offset, size)) = section.file_range() {
            assert!(offset + size <= bytes.len() as u64);
            let align = section.align().max(1);
            assert_eq!(offset % align, 0, "{:?} misaligned", section.name());
            if sh_flags & SHF_ALLOC != 0 {
                assert_eq!(
                    section.address() % PAGE_SIZE,
                    offset % PAGE_SIZE,
                    "{:?} not congruent",
                    section.name()
                );
            }
        }
        let rank = section_rank(sh_flags, is_nobits);
        if let Some(last) = last_rank {
            assert!(rank <= last, "sections out of rank order at {:?}", section.name());
        }
        last_rank = Some(rank);
    }
}

#[test]
fn archive_pull_in() {
    let dir = test_dir("archive-pull-in");
    let a_path = dir.join("a.o");
    std::fs::write(&a_path, data_object("root", 8, Some("foo"))).unwrap();
    let b1 = data_object("foo", 16, Some("bar"));
    let b2 = data_object("bar", 8, None);
    let b3 = data_object("baz", 8, None);
    let lib_path = dir.join("libb.a");
    write_archive(&lib_path, &[("b1.o", &b1), ("b2.o", &b2), ("b3.o", &b3)]);

    let exe = link(&dir, "out", &["-static"], &[&a_path, &lib_path]);
    let bytes = std::fs::read(&exe).unwrap();
    let parsed = object::read::File::parse(&*bytes).unwrap();
    let names: Vec<&str> = parsed.symbols().filter_map(|s| s.name().ok()).collect();
    assert!(names.contains(&"foo"));
    assert!(names.contains(&"bar"));
    assert!(!names.contains(&"baz"), "unused member was pulled in");

    // The relocation in a.o's data resolved to foo's final address.
    let foo = parsed.symbols().find(|s| s.name() == Ok("foo")).unwrap();
    let data = parsed.section_by_name(".data").unwrap();
    let payload = data.data().unwrap();
    let value = u64::from_le_bytes(payload[..8].try_into().unwrap());
    assert_eq!(value, foo.address());
}

#[test]
fn relink_is_deterministic() {
    let dir = test_dir("determinism");
    let a_path = dir.join("a.o");
    std::fs::write(&a_path, data_object("root", 8, Some("foo"))).unwrap();
    let b1 = data_object("foo", 16, Some("bar"));
    let b2 = data_object("bar", 8, None);
    let lib_path = dir.join("libb.a");
    write_archive(&lib_path, &[("b1.o", &b1), ("b2.o", &b2)]);

    let first = link(&dir, "out1", &["-static"], &[&a_path, &lib_path]);
    let second = link(&dir, "out2", &["-static"], &[&a_path, &lib_path]);
    assert_eq!(
        std::fs::read(&first).unwrap(),
        std::fs::read(&second).unwrap()
    );
}

#[test]
fn weak_undef_resolves_to_zero() {
    let dir = test_dir("weak-undef");
    let mut obj = new_object();
    let data = obj.add_section(Vec::new(), b".data".to_vec(), object::SectionKind::Data);
    obj.set_section_data(data, vec![0xffu8; 8], 8);
    global_symbol(&mut obj, "slot", data, 0, 8, object::SymbolKind::Data);
    let hook = undefined_symbol(&mut obj, "opt_hook", true);
    reloc(&mut obj, data, 0, hook, object::elf::R_X86_64_64, 0);
    let obj_path = dir.join("weak.o");
    std::fs::write(&obj_path, obj.write().unwrap()).unwrap();

    let exe = link(&dir, "out", &["-static"], &[&obj_path]);
    let bytes = std::fs::read(&exe).unwrap();
    let parsed = object::read::File::parse(&*bytes).unwrap();
    let data = parsed.section_by_name(".data").unwrap();
    assert_eq!(data.data().unwrap(), &[0u8; 8]);
}

#[test]
fn strong_undef_is_an_error() {
    let dir = test_dir("strong-undef");
    let obj_path = dir.join("undef.o");
    std::fs::write(&obj_path, data_object("root", 8, Some("missing"))).unwrap();
    let (output, _) = try_link(&dir, "out", &["-static"], &[&obj_path]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("missing"), "stderr was: {stderr}");
}

fn comdat_object() -> Vec<u8> {
    let mut obj = new_object();
    let text = obj.add_section(
        Vec::new(),
        b".text._Z3fooi".to_vec(),
        object::SectionKind::Text,
    );
    obj.set_section_data(text, vec![0xc3u8; 16], 16);
    let foo = global_symbol(&mut obj, "_Z3fooi", text, 0, 16, object::SymbolKind::Text);
    obj.add_comdat(object::write::Comdat {
        kind: object::ComdatKind::Any,
        symbol: foo,
        sections: vec![text],
    });
    let data = obj.add_section(Vec::new(), b".data".to_vec(), object::SectionKind::Data);
    obj.set_section_data(data, vec![0u8; 8], 8);
    reloc(&mut obj, data, 0, foo, object::elf::R_X86_64_64, 0);
    obj.write().unwrap()
}

#[test]
fn comdat_dedup() {
    let dir = test_dir("comdat");
    // The two objects can't both define _Z3fooi globally unless COMDAT deduplication elects a
    // single keeper.
    let one = dir.join("one.o");
    let two = dir.join("two.o");
    std::fs::write(&one, comdat_object()).unwrap();
    std::fs::write(&two, comdat_object()).unwrap();

    let single = link(&dir, "single", &["-static"], &[&one]);
    let double = link(&dir, "double", &["-static"], &[&one, &two]);

    let single_bytes = std::fs::read(&single).unwrap();
    let double_bytes = std::fs::read(&double).unwrap();
    let single_text = object::read::File::parse(&*single_bytes)
        .unwrap()
        .section_by_name(".text")
        .unwrap()
        .size();
    let parsed = object::read::File::parse(&*double_bytes).unwrap();
    let double_text = parsed.section_by_name(".text").unwrap().size();
    assert_eq!(single_text, double_text, "loser's section wasn't dropped");

    // Both .data references resolve to the kept copy.
    let data = parsed.section_by_name(".data").unwrap().data().unwrap();
    let first = u64::from_le_bytes(data[..8].try_into().unwrap());
    let second = u64::from_le_bytes(data[8..16].try_into().unwrap());
    assert_eq!(first, second);
    let foo = parsed.symbols().find(|s| s.name() == Ok("_Z3fooi")).unwrap();
    assert_eq!(first, foo.address());
}

fn string_object(strings: &[u8], symbol: Option<(&str, u64)>) -> Vec<u8> {
    let mut obj = new_object();
    let rodata = obj.add_section(
        Vec::new(),
        b".rodata.str1.1".to_vec(),
        object::SectionKind::ReadOnlyString,
    );
    obj.set_section_data(rodata, strings.to_vec(), 1);
    obj.section_mut(rodata).flags = object::SectionFlags::Elf {
        sh_flags: SHF_ALLOC | SHF_MERGE | SHF_STRINGS,
    };
    if let Some((name, value)) = symbol {
        global_symbol(&mut obj, name, rodata, value, 0, object::SymbolKind::Data);
    }
    obj.write().unwrap()
}

#[test]
fn merged_strings() {
    let dir = test_dir("merged-strings");
    let one = dir.join("one.o");
    let two = dir.join("two.o");
    let three = dir.join("three.o");
    std::fs::write(&one, string_object(b"hello\0", None)).unwrap();
    std::fs::write(&two, string_object(b"world\0", Some(("world_str", 0)))).unwrap();
    std::fs::write(&three, string_object(b"hello\0", Some(("hello_str", 0)))).unwrap();
    // A data slot holding the address of each string.
    let mut refs = new_object();
    let data = refs.add_section(Vec::new(), b".data".to_vec(), object::SectionKind::Data);
    refs.set_section_data(data, vec![0u8; 16], 8);
    let hello = undefined_symbol(&mut refs, "hello_str", false);
    let world = undefined_symbol(&mut refs, "world_str", false);
    reloc(&mut refs, data, 0, hello, object::elf::R_X86_64_64, 0);
    reloc(&mut refs, data, 8, world, object::elf::R_X86_64_64, 0);
    let refs_path = dir.join("refs.o");
    std::fs::write(&refs_path, refs.write().unwrap()).unwrap();

    let exe = link(
        &dir,
        "out",
        &["-static"],
        &[&one, &two, &three, &refs_path],
    );
    let bytes = std::fs::read(&exe).unwrap();
    let parsed = object::read::File::parse(&*bytes).unwrap();
    let rodata = parsed.section_by_name(".rodata.str1.1").unwrap();
    let content = rodata.data().unwrap();
    // Each distinct string appears exactly once.
    assert_eq!(content.len(), 12);
    let occurrences = |needle: &[u8]| {
        (0..content.len())
            .filter(|&i| content[i..].starts_with(needle))
            .count()
    };
    assert_eq!(occurrences(b"hello\0"), 1);
    assert_eq!(occurrences(b"world\0"), 1);

    // References relocated to the surviving copies.
    let data = parsed.section_by_name(".data").unwrap().data().unwrap();
    let hello_addr = u64::from_le_bytes(data[..8].try_into().unwrap());
    let world_addr = u64::from_le_bytes(data[8..16].try_into().unwrap());
    let base = rodata.address();
    let at = |addr: u64| &content[(addr - base) as usize..(addr - base) as usize + 6];
    assert_eq!(at(hello_addr), b"hello\0");
    assert_eq!(at(world_addr), b"world\0");
}

#[test]
fn dynamic_ifunc() {
    let dir = test_dir("dynamic-ifunc");
    let mut obj = new_object();
    let text = obj.add_section(Vec::new(), b".text".to_vec(), object::SectionKind::Text);
    let code = [
        0xe8, 0x00, 0x00, 0x00, 0x00, // call foo
        0xc3, // ret
        0x90, 0x90, // padding
        0xc3, // foo's resolver body
    ];
    obj.set_section_data(text, &code[..], 16);
    global_symbol(&mut obj, "_start", text, 0, 6, object::SymbolKind::Text);
    // STT_GNU_IFUNC, global binding.
    let foo = obj.add_symbol(object::write::Symbol {
        name: b"foo".to_vec(),
        value: 8,
        size: 1,
        kind: object::SymbolKind::Text,
        scope: object::SymbolScope::Dynamic,
        weak: false,
        section: object::write::SymbolSection::Section(text),
        flags: object::SymbolFlags::Elf {
            st_info: (1 << 4) | 10,
            st_other: 0,
        },
    });
    reloc(&mut obj, text, 1, foo, object::elf::R_X86_64_PLT32, -4);
    let obj_path = dir.join("ifunc.o");
    std::fs::write(&obj_path, obj.write().unwrap()).unwrap();

    let exe = link(&dir, "out", &[], &[&obj_path]);
    let bytes = std::fs::read(&exe).unwrap();
    let parsed = object::read::File::parse(&*bytes).unwrap();

    assert!(parsed.section_by_name(".interp").is_some());
    assert!(parsed.section_by_name(".dynamic").is_some());

    let foo_sym = parsed.symbols().find(|s| s.name() == Ok("foo")).unwrap();
    let relplt = parsed.section_by_name(".rela.plt").unwrap();
    let gotplt = parsed.section_by_name(".got.plt").unwrap();
    let entries: Vec<&[u8]> = relplt.data().unwrap().chunks_exact(24).collect();
    assert_eq!(entries.len(), 1);
    let entry = entries[0];
    let offset = u64::from_le_bytes(entry[..8].try_into().unwrap());
    let info = u64::from_le_bytes(entry[8..16].try_into().unwrap());
    let addend = u64::from_le_bytes(entry[16..24].try_into().unwrap());
    const R_X86_64_IRELATIVE: u64 = 37;
    assert_eq!(info & 0xffff_ffff, R_X86_64_IRELATIVE);
    assert_eq!(addend, foo_sym.address(), "addend should be the resolver");
    assert!(offset >= gotplt.address());
    assert!(offset < gotplt.address() + gotplt.size().max(8));

    // A PLT entry for foo exists and the caller was relocated into the PLT.
    let plt = parsed.section_by_name(".plt").unwrap();
    assert_eq!(plt.size(), 16);
    let text = parsed.section_by_name(".text").unwrap();
    let text_data = text.data().unwrap();
    let disp = i32::from_le_bytes(text_data[1..5].try_into().unwrap());
    let call_target = (text.address() + 5).wrapping_add_signed(disp.into());
    assert_eq!(call_target, plt.address());
}

#[test]
fn filler_applies_to_padding_only() {
    let dir = test_dir("filler");
    let obj_path = dir.join("start.o");
    std::fs::write(&obj_path, start_object()).unwrap();
    let plain = link(&dir, "plain", &["-static"], &[&obj_path]);
    let filled = link(&dir, "filled", &["-static", "-filler", "0xcc"], &[&obj_path]);
    // Padding is explicitly zeroed after the filler is applied, so the two images match.
    assert_eq!(
        std::fs::read(&plain).unwrap(),
        std::fs::read(&filled).unwrap()
    );
}
