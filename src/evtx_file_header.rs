use crate::err::{EvtxError, Result};

use bitflags::bitflags;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom};

pub const EVTX_FILE_HEADER_SIZE: usize = 128;
pub const EVTX_HEADER_BLOCK_SIZE: usize = 4096;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u32 {
        /// The file was not closed cleanly; header fields may lag the chunks.
        const DIRTY = 0x1;
        /// The file reached its maximum size.
        const FULL = 0x2;
        /// CRC32 fields are not maintained.
        const NO_CRC32 = 0x4;
    }
}

/// The 128-byte file header at offset 0.
///
/// The declared chunk count is advisory only: the field is 16-bit, so files
/// with more than 65535 chunks under-report. The driver derives the real
/// count from the file size.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct EvtxFileHeader {
    pub first_chunk_number: u64,
    pub last_chunk_number: u64,
    pub next_record_id: u64,
    pub header_size: u32,
    pub minor_version: u16,
    pub major_version: u16,
    pub header_block_size: u16,
    pub chunk_count: u16,
    pub flags: HeaderFlags,
    /// CRC32 of the header's first 120 bytes, as declared on disk.
    pub checksum: u32,
}

impl EvtxFileHeader {
    pub fn from_reader(stream: &mut Cursor<&[u8]>) -> Result<EvtxFileHeader> {
        if stream.get_ref().len() < EVTX_FILE_HEADER_SIZE {
            return Err(EvtxError::IncompleteFileHeader {
                have: stream.get_ref().len(),
            });
        }

        let mut magic = [0_u8; 8];
        stream.read_exact(&mut magic)?;
        if &magic != b"ElfFile\x00" {
            return Err(EvtxError::InvalidEvtxFileHeaderMagic { magic });
        }

        let first_chunk_number = stream.read_u64::<LittleEndian>()?;
        let last_chunk_number = stream.read_u64::<LittleEndian>()?;
        let next_record_id = stream.read_u64::<LittleEndian>()?;
        let header_size = stream.read_u32::<LittleEndian>()?;
        let minor_version = stream.read_u16::<LittleEndian>()?;
        let major_version = stream.read_u16::<LittleEndian>()?;
        let header_block_size = stream.read_u16::<LittleEndian>()?;
        let chunk_count = stream.read_u16::<LittleEndian>()?;

        // Unused
        stream.seek(SeekFrom::Current(76))?;
        let flags = HeaderFlags::from_bits_truncate(stream.read_u32::<LittleEndian>()?);
        let checksum = stream.read_u32::<LittleEndian>()?;

        Ok(EvtxFileHeader {
            first_chunk_number,
            last_chunk_number,
            next_record_id,
            header_size,
            minor_version,
            major_version,
            header_block_size,
            chunk_count,
            flags,
            checksum,
        })
    }
}
