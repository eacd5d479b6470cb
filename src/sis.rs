//! SIS reader (`spec.md` §4.7): a read-only, random-access view over an
//! already-open input file, with multiple logical handles sharing one
//! physical file by reference count — grounded on
//! `original_source/src/sis.h`'s `sis_open`/`sis_clone`/`sis_close`
//! discipline ("should be called the same number of times").

use crate::crc16::Crc16;
use crate::error::{Error, Result};
use crate::wire::{read_u16, read_u32};
use std::cell::RefCell;
use std::io::{Read, Seek, SeekFrom};
use std::rc::Rc;

/// Header fields parsed from the first bytes of a SIS file. Table
/// offsets are absolute byte offsets into the physical file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SisHeader {
    pub uid1: u32,
    pub uid2: u32,
    pub uid3: u32,
    /// Checksum over `uid1..uid3`, not the header CRC.
    pub uid4: u32,
    pub header_crc: u16,
    pub num_languages: u16,
    pub num_files: u16,
    pub num_requisites: u16,
    pub language_table_offset: u32,
    pub file_table_offset: u32,
    pub requisite_table_offset: u32,
    pub component_name_offset: u32,
    pub install_language: u16,
    pub install_drive: u8,
    pub install_file_count: u16,
}

pub const HEADER_LEN: usize = 4 + 4 + 4 + 4 + 2 + 2 + 2 + 2 + 4 + 4 + 4 + 4 + 2 + 1 + 2;

impl SisHeader {
    pub fn parse(bytes: &[u8]) -> Result<SisHeader> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::BadHeader);
        }
        let mut cur = std::io::Cursor::new(bytes);
        let uid1 = read_u32(&mut cur)?;
        let uid2 = read_u32(&mut cur)?;
        let uid3 = read_u32(&mut cur)?;
        let uid4 = read_u32(&mut cur)?;

        let expected_uid4 = uid1.wrapping_add(uid2).wrapping_add(uid3);
        if uid4 != expected_uid4 {
            return Err(Error::ChecksumMismatch);
        }

        let header_crc = read_u16(&mut cur)?;
        let num_languages = read_u16(&mut cur)?;
        let num_files = read_u16(&mut cur)?;
        let num_requisites = read_u16(&mut cur)?;
        let language_table_offset = read_u32(&mut cur)?;
        let file_table_offset = read_u32(&mut cur)?;
        let requisite_table_offset = read_u32(&mut cur)?;
        let component_name_offset = read_u32(&mut cur)?;
        let install_language = read_u16(&mut cur)?;
        let install_drive = {
            let mut b = [0u8; 1];
            cur.read_exact(&mut b).map_err(|_| Error::BadHeader)?;
            b[0]
        };
        let install_file_count = read_u16(&mut cur)?;

        let mut crc = Crc16::new();
        crc.update_all(&bytes[0..16]);
        crc.update_all(&bytes[18..HEADER_LEN]);
        if crc.value() != header_crc {
            return Err(Error::ChecksumMismatch);
        }

        Ok(SisHeader {
            uid1,
            uid2,
            uid3,
            uid4,
            header_crc,
            num_languages,
            num_files,
            num_requisites,
            language_table_offset,
            file_table_offset,
            requisite_table_offset,
            component_name_offset,
            install_language,
            install_drive,
            install_file_count,
        })
    }
}

/// Per-language offset/length into the physical file for one file
/// descriptor; "multilingual" files have one of these per language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SisFileRecord {
    pub offsets: Vec<(u32, u32)>,
}

struct Shared<R> {
    reader: RefCell<R>,
    refcount: RefCell<u32>,
}

/// A logical handle onto a SIS file. Cloning bumps the shared physical
/// file's reference count instead of reopening it.
pub struct SisFile<R> {
    shared: Rc<Shared<R>>,
    pub header: SisHeader,
}

impl<R: Read + Seek> SisFile<R> {
    pub fn open(mut reader: R) -> Result<Self> {
        reader.seek(SeekFrom::Start(0)).map_err(|_| Error::BadHeader)?;
        let mut buf = vec![0u8; HEADER_LEN];
        reader.read_exact(&mut buf).map_err(|_| Error::BadHeader)?;
        let header = SisHeader::parse(&buf)?;
        Ok(SisFile { shared: Rc::new(Shared { reader: RefCell::new(reader), refcount: RefCell::new(1) }), header })
    }

    pub fn clone_handle(&self) -> Self {
        *self.shared.refcount.borrow_mut() += 1;
        SisFile { shared: Rc::clone(&self.shared), header: self.header.clone() }
    }

    pub fn refcount(&self) -> u32 {
        *self.shared.refcount.borrow()
    }

    pub fn read_at(&self, offset: u32, len: u32) -> Result<Vec<u8>> {
        let mut reader = self.shared.reader.borrow_mut();
        reader.seek(SeekFrom::Start(offset as u64)).map_err(|_| Error::BadParams)?;
        let mut buf = vec![0u8; len as usize];
        reader.read_exact(&mut buf).map_err(|_| Error::BadParams)?;
        Ok(buf)
    }

    pub fn read_language_table(&self) -> Result<Vec<u16>> {
        let bytes = self.read_at(self.header.language_table_offset, self.header.num_languages as u32 * 2)?;
        let mut cur = std::io::Cursor::new(bytes);
        (0..self.header.num_languages).map(|_| read_u16(&mut cur)).collect()
    }

    /// Parses `header.num_files` file records starting at
    /// `header.file_table_offset`, analogous to `read_language_table`.
    /// Grounded on `original_source/src/sis.c`'s `SIS_FILE_*` field
    /// offsets (flags, type, details, then one (length, offset) source
    /// pair per record): a multilingual entry repeats that source pair
    /// once per language, so each record is `8 + 4 + num_languages * 8`
    /// bytes — flags (4) + type (4), details (4), then the per-language
    /// (length, offset) pairs.
    pub fn read_file_table(&self) -> Result<Vec<SisFileRecord>> {
        let record_len = 8 + 4 + self.header.num_languages as u32 * 8;
        let mut records = Vec::with_capacity(self.header.num_files as usize);
        for i in 0..self.header.num_files as u32 {
            let record_offset = self.header.file_table_offset + i * record_len;
            let bytes = self.read_at(record_offset + 12, self.header.num_languages as u32 * 8)?;
            let mut cur = std::io::Cursor::new(bytes);
            let mut offsets = Vec::with_capacity(self.header.num_languages as usize);
            for _ in 0..self.header.num_languages {
                let length = read_u32(&mut cur)?;
                let offset = read_u32(&mut cur)?;
                offsets.push((offset, length));
            }
            records.push(SisFileRecord { offsets });
        }
        Ok(records)
    }

    pub fn read_component_name(&self) -> Result<String> {
        let mut reader = self.shared.reader.borrow_mut();
        reader.seek(SeekFrom::Start(self.header.component_name_offset as u64)).map_err(|_| Error::BadParams)?;
        let len = {
            let mut len_buf = [0u8; 2];
            reader.read_exact(&mut len_buf).map_err(|_| Error::BadParams)?;
            u16::from_le_bytes(len_buf) as usize
        };
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).map_err(|_| Error::BadParams)?;
        String::from_utf8(buf).map_err(|_| Error::BadName)
    }
}

impl<R> Drop for SisFile<R> {
    fn drop(&mut self) {
        *self.shared.refcount.borrow_mut() -= 1;
    }
}

/// Produces a truncated copy of the SIS file containing only the header
/// and tables (no file payload data), with the install-language,
/// install-drive and install-file-count fields patched to the chosen
/// values.
pub fn write_residual(
    full_header_and_tables: &[u8],
    install_language: u16,
    install_drive: u8,
    install_file_count: u16,
) -> Vec<u8> {
    let mut out = full_header_and_tables.to_vec();
    if out.len() >= HEADER_LEN {
        out[34..36].copy_from_slice(&install_language.to_le_bytes());
        out[36] = install_drive;
        out[37..39].copy_from_slice(&install_file_count.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{write_u16, write_u32};
    use std::io::Cursor;

    fn sample_header_bytes() -> Vec<u8> {
        let mut buf = Vec::new();
        let uid1 = 0x1000_0001u32;
        let uid2 = 0x1000_0002u32;
        let uid3 = 0x1000_0003u32;
        let uid4 = uid1.wrapping_add(uid2).wrapping_add(uid3);
        write_u32(&mut buf, uid1).unwrap();
        write_u32(&mut buf, uid2).unwrap();
        write_u32(&mut buf, uid3).unwrap();
        write_u32(&mut buf, uid4).unwrap();
        write_u16(&mut buf, 0).unwrap(); // crc placeholder
        write_u16(&mut buf, 1).unwrap(); // num_languages
        write_u16(&mut buf, 2).unwrap(); // num_files
        write_u16(&mut buf, 0).unwrap(); // num_requisites
        write_u32(&mut buf, 100).unwrap();
        write_u32(&mut buf, 200).unwrap();
        write_u32(&mut buf, 0).unwrap();
        write_u32(&mut buf, 300).unwrap();
        write_u16(&mut buf, 1).unwrap(); // install_language
        buf.push(b'C'); // install_drive
        write_u16(&mut buf, 2).unwrap(); // install_file_count

        let mut crc = Crc16::new();
        crc.update_all(&buf[0..16]);
        crc.update_all(&buf[18..HEADER_LEN]);
        let crc_val = crc.value();
        buf[16..18].copy_from_slice(&crc_val.to_le_bytes());
        buf
    }

    #[test]
    fn header_parses_with_matching_crc_and_uid4() {
        let bytes = sample_header_bytes();
        let header = SisHeader::parse(&bytes).unwrap();
        assert_eq!(header.num_files, 2);
        assert_eq!(header.install_drive, b'C');
    }

    #[test]
    fn bad_crc_is_rejected() {
        let mut bytes = sample_header_bytes();
        bytes[16] ^= 0xff;
        assert_eq!(SisHeader::parse(&bytes), Err(Error::ChecksumMismatch));
    }

    #[test]
    fn clone_shares_refcount_and_drop_decrements() {
        let bytes = sample_header_bytes();
        let file = SisFile::open(Cursor::new(bytes)).unwrap();
        assert_eq!(file.refcount(), 1);
        {
            let cloned = file.clone_handle();
            assert_eq!(file.refcount(), 2);
            assert_eq!(cloned.refcount(), 2);
        }
        assert_eq!(file.refcount(), 1);
    }

    #[test]
    fn file_table_reads_one_offset_pair_per_language() {
        // One language, two files: each record is flags(4) + type(4) +
        // details(4) + one (length, offset) pair (8 bytes) = 20 bytes.
        let mut bytes = sample_header_bytes();
        let table_offset = bytes.len() as u32;
        for (length, offset) in [(10u32, 1000u32), (20u32, 2000u32)] {
            write_u32(&mut bytes, 0).unwrap(); // flags
            write_u32(&mut bytes, 0).unwrap(); // type
            write_u32(&mut bytes, 0).unwrap(); // details
            write_u32(&mut bytes, length).unwrap();
            write_u32(&mut bytes, offset).unwrap();
        }
        // Patch file_table_offset (header field at byte 28) to point here.
        bytes[28..32].copy_from_slice(&table_offset.to_le_bytes());
        let mut crc = Crc16::new();
        crc.update_all(&bytes[0..16]);
        crc.update_all(&bytes[18..HEADER_LEN]);
        let crc_val = crc.value();
        bytes[16..18].copy_from_slice(&crc_val.to_le_bytes());

        let file = SisFile::open(Cursor::new(bytes)).unwrap();
        let records = file.read_file_table().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].offsets, vec![(1000, 10)]);
        assert_eq!(records[1].offsets, vec![(2000, 20)]);
    }

    #[test]
    fn residual_patches_install_fields() {
        let bytes = sample_header_bytes();
        let residual = write_residual(&bytes, 9, b'D', 42);
        let header = SisHeader::parse(&residual).unwrap();
        assert_eq!(header.install_language, 9);
        assert_eq!(header.install_drive, b'D');
        assert_eq!(header.install_file_count, 42);
    }
}
