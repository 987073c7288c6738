//! Figures out what input files we need to read, maps them into memory and expands archives into
//! their member objects.

use crate::archive::ArchiveEntry;
use crate::archive::ArchiveIterator;
use crate::args::Args;
use crate::error::Result;
use crate::file_kind::FileKind;
use anyhow::Context;
use memmap2::Mmap;
use std::fmt::Display;
use std::path::Path;
use std::path::PathBuf;

/// Identifies an input file. IDs start from 0, which is reserved for the internal file that holds
/// linker-synthesized symbols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct FileId(u32);

pub(crate) const INTERNAL_FILE_ID: FileId = FileId(0);

impl FileId {
    pub(crate) fn new(value: u32) -> FileId {
        FileId(value)
    }

    pub(crate) fn as_usize(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn as_u32(self) -> u32 {
        self.0
    }
}

pub(crate) struct InputData {
    pub(crate) files: Vec<InputFile>,
}

pub(crate) struct InputFile {
    pub(crate) filename: PathBuf,
    pub(crate) kind: FileKind,
    bytes: Mmap,
}

/// Identifies an input object, which may be an entry in an archive.
#[derive(Clone, Copy)]
pub(crate) struct InputRef<'data> {
    pub(crate) file: &'data InputFile,
    pub(crate) entry_filename: Option<&'data [u8]>,
}

/// The bytes of a single relocatable object or shared object, together with where they came from.
pub(crate) struct InputBytes<'data> {
    pub(crate) input: InputRef<'data>,
    pub(crate) kind: FileKind,
    pub(crate) data: &'data [u8],
    pub(crate) is_in_archive: bool,
}

impl InputData {
    #[tracing::instrument(skip_all, name = "Open input files")]
    pub(crate) fn from_args(args: &Args) -> Result<InputData> {
        let files = args
            .inputs
            .iter()
            .map(|path| InputFile::new(path))
            .collect::<Result<Vec<_>>>()?;
        Ok(InputData { files })
    }
}

impl InputFile {
    fn new(path: &Path) -> Result<InputFile> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("cannot open {}", path.display()))?;
        let bytes = unsafe { Mmap::map(&file) }
            .with_context(|| format!("{}: mmap failed", path.display()))?;
        let kind = FileKind::identify_bytes(&bytes)
            .with_context(|| format!("{}", path.display()))?;
        Ok(InputFile {
            filename: path.to_owned(),
            kind,
            bytes,
        })
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.bytes
    }
}

/// Expands each archive into its members. Non-archive inputs pass through unchanged. The returned
/// ordering is what determines file priorities: it preserves command-line order, which combined
/// with archive-discovery order for members gives the resolver its deterministic tie-break.
#[tracing::instrument(skip_all, name = "Expand archives")]
pub(crate) fn expand_archives(input_data: &InputData) -> Result<Vec<InputBytes>> {
    let mut inputs = Vec::new();
    for file in &input_data.files {
        match file.kind {
            FileKind::Archive => {
                let mut extended_filenames = None;
                for entry in ArchiveIterator::from_archive_bytes(file.data())? {
                    let entry = entry.with_context(|| {
                        format!("{}: malformed archive child", file.filename.display())
                    })?;
                    match entry {
                        ArchiveEntry::Symbols => {}
                        ArchiveEntry::Filenames(t) => extended_filenames = Some(t),
                        ArchiveEntry::Regular(content) => {
                            inputs.push(InputBytes {
                                input: InputRef {
                                    file,
                                    entry_filename: Some(content.identifier(extended_filenames)),
                                },
                                kind: FileKind::ElfObject,
                                data: content.entry_data,
                                is_in_archive: true,
                            });
                        }
                    }
                }
            }
            kind => {
                inputs.push(InputBytes {
                    input: InputRef {
                        file,
                        entry_filename: None,
                    },
                    kind,
                    data: file.data(),
                    is_in_archive: false,
                });
            }
        }
    }
    Ok(inputs)
}

impl<'data> Display for InputRef<'data> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.file.filename.display().fmt(f)?;
        if let Some(entry) = self.entry_filename {
            write!(f, "({})", String::from_utf8_lossy(entry))?;
        }
        Ok(())
    }
}
