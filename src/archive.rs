//! Code to read ar files. We don't use the ar crate because it provides access to data only via the
//! Read trait and we want to borrow the data of each entry. We do however use the ar crate as a dev
//! dependency in our tests so that we can verify consistency.

use crate::error::Result;
use anyhow::bail;
use anyhow::Context;
use bytemuck::Pod;
use bytemuck::Zeroable;

pub(crate) enum ArchiveEntry<'data> {
    Regular(ArchiveContent<'data>),
    Symbols,
    Filenames(ExtendedFilenames<'data>),
}

#[derive(Clone, Copy)]
pub(crate) struct ExtendedFilenames<'data> {
    data: &'data [u8],
}

pub(crate) struct ArchiveContent<'data> {
    ident: &'data str,
    pub(crate) entry_data: &'data [u8],
}

pub(crate) struct ArchiveIterator<'data> {
    data: &'data [u8],
}

#[derive(Zeroable, Pod, Clone, Copy)]
#[repr(C)]
struct EntryHeader {
    ident: [u8; 16],
    _timestamp: [u8; 12],
    _owner_id: [u8; 6],
    _group_id: [u8; 6],
    _mode: [u8; 8],
    size: [u8; 10],
    end: [u8; 2],
}

const HEADER_SIZE: usize = core::mem::size_of::<EntryHeader>();

const _ASSERTS: () = {
    assert!(HEADER_SIZE == 60);
};

impl<'data> ArchiveIterator<'data> {
    /// Create an iterator from the bytes of the whole archive, including the magic.
    pub(crate) fn from_archive_bytes(data: &'data [u8]) -> Result<Self> {
        let Some(data) = data.strip_prefix(b"!<arch>\n") else {
            bail!("Missing archive header");
        };
        Ok(Self { data })
    }

    fn next_result(&mut self) -> Result<Option<ArchiveEntry<'data>>> {
        if self.data.is_empty() {
            return Ok(None);
        }
        if self.data.len() < HEADER_SIZE {
            bail!("Short entry header");
        }
        let (header, rest) = self.data.split_at(HEADER_SIZE);
        let header: &EntryHeader = bytemuck::from_bytes(header);
        let size = parse_decimal_int(&header.size);
        self.data = rest;
        if self.data.len() < size {
            bail!(
                "Entry size is {size}, but only {} bytes left",
                self.data.len()
            );
        }
        let ident = std::str::from_utf8(&header.ident).context("archive ident is invalid UTF-8")?;
        let ident = ident.trim_end();
        let entry_data = &self.data[..size];
        let entry = match ident {
            "/" => ArchiveEntry::Symbols,
            "//" => ArchiveEntry::Filenames(ExtendedFilenames { data: entry_data }),
            _ => ArchiveEntry::Regular(ArchiveContent { ident, entry_data }),
        };
        let size_with_padding = size.next_multiple_of(2).min(self.data.len());
        self.data = &self.data[size_with_padding..];
        Ok(Some(entry))
    }
}

fn parse_decimal_int(bytes: &[u8]) -> usize {
    let mut value = 0;
    for &byte in bytes {
        if !byte.is_ascii_digit() {
            break;
        }
        value = value * 10 + ((byte - b'0') as usize);
    }
    value
}

impl<'data> ArchiveContent<'data> {
    /// Returns the name that identifies this entry. Short names are stored in the entry header
    /// itself, longer names as an offset into the extended filenames entry.
    pub(crate) fn identifier(
        &self,
        extended_filenames: Option<ExtendedFilenames<'data>>,
    ) -> &'data [u8] {
        if let Some(filenames) = extended_filenames {
            if let Some(rest) = self.ident.strip_prefix('/') {
                if let Ok(offset) = rest.parse::<usize>() {
                    if offset < filenames.data.len() {
                        let data = &filenames.data[offset..];
                        let end = memchr::memchr2(b'/', b'\n', data).unwrap_or(data.len());
                        return &data[..end];
                    }
                }
            }
        }
        let data = self.ident.as_bytes();
        let end = memchr::memchr(b'/', data).unwrap_or(data.len());
        &data[..end]
    }
}

impl<'data> Iterator for ArchiveIterator<'data> {
    type Item = Result<ArchiveEntry<'data>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_result().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds an archive with the ar crate, then reads it back with our iterator and checks that
    /// both agree on member names and contents.
    #[test]
    fn test_ar_consistency() {
        let members: &[(&str, &[u8])] = &[
            ("short.o", b"member one data"),
            ("a-very-long-member-name.o", b"second member"),
            ("odd.o", b"odd size"),
        ];
        let identifiers = members
            .iter()
            .map(|(name, _)| name.as_bytes().to_vec())
            .collect();
        let mut builder = ar::GnuBuilder::new(Vec::new(), identifiers);
        for (name, data) in members {
            let header = ar::Header::new(name.as_bytes().to_vec(), data.len() as u64);
            builder.append(&header, *data).unwrap();
        }
        let bytes = builder.into_inner().unwrap();

        let mut filenames = None;
        let mut found = Vec::new();
        for entry in ArchiveIterator::from_archive_bytes(&bytes).unwrap() {
            match entry.unwrap() {
                ArchiveEntry::Regular(content) => {
                    let name = content.identifier(filenames).to_vec();
                    found.push((name, content.entry_data.to_vec()));
                }
                ArchiveEntry::Symbols => {}
                ArchiveEntry::Filenames(table) => filenames = Some(table),
            }
        }
        assert_eq!(found.len(), members.len());
        for ((name, data), (exp_name, exp_data)) in found.iter().zip(members) {
            assert_eq!(String::from_utf8_lossy(name), *exp_name);
            assert_eq!(data.as_slice(), *exp_data);
        }
    }

    #[test]
    fn test_parse_decimal_int() {
        assert_eq!(parse_decimal_int("123   ".as_bytes()), 123);
        assert_eq!(parse_decimal_int("0   ".as_bytes()), 0);
    }

    #[test]
    fn test_truncated_archive() {
        assert!(ArchiveIterator::from_archive_bytes(b"not an archive").is_err());
        let mut iter = ArchiveIterator::from_archive_bytes(b"!<arch>\nshort").unwrap();
        assert!(iter.next().unwrap().is_err());
    }
}
