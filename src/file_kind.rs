//! Identifies what sort of input we're dealing with based on the first few bytes of the file.

use crate::error::Result;
use anyhow::bail;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum FileKind {
    ElfObject,
    ElfDynamic,
    Archive,
}

const ELF_MAGIC: &[u8] = b"\x7fELF";
const ARCHIVE_MAGIC: &[u8] = b"!<arch>\n";

const ET_REL: u16 = 1;
const ET_DYN: u16 = 3;

impl FileKind {
    pub(crate) fn identify_bytes(bytes: &[u8]) -> Result<FileKind> {
        if bytes.starts_with(ARCHIVE_MAGIC) {
            return Ok(FileKind::Archive);
        }
        if bytes.starts_with(ELF_MAGIC) {
            if bytes.len() < 0x14 {
                bail!("Invalid ELF file");
            }
            if bytes[4] != 2 {
                bail!("Only 64 bit ELF is currently supported");
            }
            if bytes[5] != 1 {
                bail!("Only little endian is currently supported");
            }
            return match u16::from_le_bytes([bytes[16], bytes[17]]) {
                ET_REL => Ok(FileKind::ElfObject),
                ET_DYN => Ok(FileKind::ElfDynamic),
                t => bail!("Unsupported ELF kind {t}"),
            };
        }
        bail!("unknown file type");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elf_header(ty: u16) -> Vec<u8> {
        let mut bytes = vec![0u8; 0x40];
        bytes[..4].copy_from_slice(ELF_MAGIC);
        bytes[4] = 2;
        bytes[5] = 1;
        bytes[16..18].copy_from_slice(&ty.to_le_bytes());
        bytes
    }

    #[test]
    fn test_identify() {
        assert_eq!(
            FileKind::identify_bytes(b"!<arch>\nrest").unwrap(),
            FileKind::Archive
        );
        assert_eq!(
            FileKind::identify_bytes(&elf_header(ET_REL)).unwrap(),
            FileKind::ElfObject
        );
        assert_eq!(
            FileKind::identify_bytes(&elf_header(ET_DYN)).unwrap(),
            FileKind::ElfDynamic
        );
        assert!(FileKind::identify_bytes(b"not an object").is_err());
        // Executables aren't valid linker inputs.
        assert!(FileKind::identify_bytes(&elf_header(2)).is_err());
    }
}
