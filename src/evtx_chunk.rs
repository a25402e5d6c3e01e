use crate::binxml::deserializer::{RenderContext, render_record_body};
use crate::err::DeserializationResult;
use crate::evtx_record::{
    EVTX_RECORD_HEADER_SIZE, EvtxRecordHeader, RenderedData, RenderedEvent,
};
use crate::settings::{OutputFormat, ParserSettings};
use crate::string_cache::StringCache;
use crate::template_cache::{CompiledTemplateCache, LocalTemplateCache, TemplateTable};
use crate::utils::sink::TextSink;

use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, warn};
use memchr::memmem;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::sync::Arc;
use thiserror::Error;

pub const EVTX_CHUNK_SIZE: usize = 65_536;
pub const EVTX_CHUNK_HEADER_SIZE: usize = 512;

/// Why a chunk was refused its normal parse and routed to recovery.
///
/// These never surface to the consumer as errors; they are logged and the
/// slot is handed to the headerless scan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkFault {
    #[error("wrong chunk header magic, expected `ElfChnk\\0`")]
    WrongHeaderMagic,

    #[error("chunk header size is {header_size}, expected 128")]
    WrongHeaderSize { header_size: u32 },

    #[error("free space offset {free_space_offset} is outside [512, 65536]")]
    FreeSpaceOffsetOutOfRange { free_space_offset: u32 },

    #[error("chunk header CRC32 mismatch (declared {declared:#010x}, computed {computed:#010x})")]
    HeaderChecksumMismatch { declared: u32, computed: u32 },

    #[error("chunk records CRC32 mismatch (declared {declared:#010x}, computed {computed:#010x})")]
    RecordsChecksumMismatch { declared: u32, computed: u32 },

    #[error("chunk template table is corrupt")]
    CorruptTemplateTable,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct EvtxChunkHeader {
    pub first_event_record_number: u64,
    pub last_event_record_number: u64,
    pub first_event_record_id: u64,
    pub last_event_record_id: u64,
    pub header_size: u32,
    pub last_event_record_data_offset: u32,
    pub free_space_offset: u32,
    pub events_checksum: u32,
    pub header_chunk_checksum: u32,
}

impl EvtxChunkHeader {
    pub fn from_reader(input: &mut Cursor<&[u8]>) -> Result<EvtxChunkHeader, ChunkFault> {
        let mut magic = [0_u8; 8];
        input
            .read_exact(&mut magic)
            .map_err(|_| ChunkFault::WrongHeaderMagic)?;
        if &magic != b"ElfChnk\x00" {
            return Err(ChunkFault::WrongHeaderMagic);
        }

        let read_err = |_| ChunkFault::WrongHeaderMagic;
        let first_event_record_number = input.read_u64::<LittleEndian>().map_err(read_err)?;
        let last_event_record_number = input.read_u64::<LittleEndian>().map_err(read_err)?;
        let first_event_record_id = input.read_u64::<LittleEndian>().map_err(read_err)?;
        let last_event_record_id = input.read_u64::<LittleEndian>().map_err(read_err)?;

        let header_size = input.read_u32::<LittleEndian>().map_err(read_err)?;
        let last_event_record_data_offset = input.read_u32::<LittleEndian>().map_err(read_err)?;
        let free_space_offset = input.read_u32::<LittleEndian>().map_err(read_err)?;
        let events_checksum = input.read_u32::<LittleEndian>().map_err(read_err)?;

        // Reserved
        input.seek(SeekFrom::Current(64)).map_err(read_err)?;
        // Flags
        input.seek(SeekFrom::Current(4)).map_err(read_err)?;

        let header_chunk_checksum = input.read_u32::<LittleEndian>().map_err(read_err)?;

        Ok(EvtxChunkHeader {
            first_event_record_number,
            last_event_record_number,
            first_event_record_id,
            last_event_record_id,
            header_size,
            last_event_record_data_offset,
            free_space_offset,
            events_checksum,
            header_chunk_checksum,
        })
    }
}

/// CRC32 of the chunk header: bytes `[0..120]` followed by `[128..512]`.
pub(crate) fn chunk_header_checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&data[..120]);
    hasher.update(&data[128..EVTX_CHUNK_HEADER_SIZE]);
    hasher.finalize()
}

/// A healthy 64 KiB chunk, borrowing the file image, with its preloaded
/// name table and template-definition table.
pub struct EvtxChunk<'a> {
    pub data: &'a [u8],
    pub header: EvtxChunkHeader,
    string_cache: StringCache,
    template_table: TemplateTable,
}

impl<'a> std::fmt::Debug for EvtxChunk<'a> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("EvtxChunk")
            .field("header", &self.header)
            .field("common_strings", &self.string_cache.len())
            .field("templates", &self.template_table.len())
            .finish()
    }
}

impl<'a> EvtxChunk<'a> {
    /// Validate the chunk header (and optionally both CRC32s), then preload
    /// the name table and the template-definition table.
    pub fn new(data: &'a [u8], validate_checksums: bool) -> Result<EvtxChunk<'a>, ChunkFault> {
        if data.len() < EVTX_CHUNK_HEADER_SIZE {
            return Err(ChunkFault::WrongHeaderMagic);
        }

        let mut cursor = Cursor::new(data);
        let header = EvtxChunkHeader::from_reader(&mut cursor)?;

        if header.header_size != 128 {
            return Err(ChunkFault::WrongHeaderSize {
                header_size: header.header_size,
            });
        }
        let free_space_offset = header.free_space_offset;
        if !(EVTX_CHUNK_HEADER_SIZE as u32..=EVTX_CHUNK_SIZE as u32).contains(&free_space_offset) {
            return Err(ChunkFault::FreeSpaceOffsetOutOfRange { free_space_offset });
        }

        if validate_checksums {
            let computed = chunk_header_checksum(data);
            if computed != header.header_chunk_checksum {
                return Err(ChunkFault::HeaderChecksumMismatch {
                    declared: header.header_chunk_checksum,
                    computed,
                });
            }

            let records_end = (free_space_offset as usize).min(data.len());
            let computed = crc32fast::hash(&data[EVTX_CHUNK_HEADER_SIZE..records_end]);
            if computed != header.events_checksum {
                return Err(ChunkFault::RecordsChecksumMismatch {
                    declared: header.events_checksum,
                    computed,
                });
            }
        }

        let string_cache = StringCache::populate(data);
        let template_table =
            TemplateTable::populate(data).map_err(|_| ChunkFault::CorruptTemplateTable)?;

        Ok(EvtxChunk {
            data,
            header,
            string_cache,
            template_table,
        })
    }

    /// Parse and render every record between offset 512 and the free-space
    /// offset, in file order.
    pub(crate) fn parse_records(
        &mut self,
        settings: &ParserSettings,
        compiled: &mut LocalTemplateCache,
    ) -> Vec<RenderedEvent> {
        let scan_end = (self.header.free_space_offset as usize).min(self.data.len());
        scan_and_render(
            self.data,
            scan_end,
            &mut self.string_cache,
            Some(&self.template_table),
            settings,
            compiled,
        )
    }

    /// Standalone parse of a single chunk buffer with its own one-shot
    /// compiled cache (seeded from the settings).
    pub fn parse(&mut self, settings: &ParserSettings) -> Vec<RenderedEvent> {
        let shared = Arc::new(CompiledTemplateCache::new());
        shared.seed(settings.get_template_cache_seed());
        let mut compiled = LocalTemplateCache::new(shared, false);
        self.parse_records(settings, &mut compiled)
    }
}

/// Recovery scan for a slot whose header is unusable: no trusted free-space
/// offset, no preloaded tables. The whole 64 KiB region is scanned for
/// record magic, and whatever parses is rendered with empty caches.
pub(crate) fn parse_headerless(
    data: &[u8],
    settings: &ParserSettings,
    compiled: &mut LocalTemplateCache,
) -> Vec<RenderedEvent> {
    let mut string_cache = StringCache::empty();
    scan_and_render(
        data,
        data.len(),
        &mut string_cache,
        None,
        settings,
        compiled,
    )
}

/// The shared scan loop: hunt for record magic, validate candidate headers,
/// render hits, and step over anything that fails validation.
fn scan_and_render(
    data: &[u8],
    scan_end: usize,
    names: &mut StringCache,
    templates: Option<&TemplateTable>,
    settings: &ParserSettings,
    compiled: &mut LocalTemplateCache,
) -> Vec<RenderedEvent> {
    let mut events = Vec::new();
    let mut offset = EVTX_CHUNK_HEADER_SIZE.min(scan_end);

    while offset + EVTX_RECORD_HEADER_SIZE + 4 <= scan_end {
        let Some(found) =
            memmem::find(&data[offset..scan_end], &crate::evtx_record::EVTX_RECORD_MAGIC)
        else {
            break;
        };
        let record_start = offset + found;

        match validate_record_at(data, record_start, scan_end) {
            Ok(header) => {
                let body_start = record_start + EVTX_RECORD_HEADER_SIZE;
                let body_end = record_start + header.data_size as usize - 4;
                events.push(render_record(
                    data, &header, body_start, body_end, names, templates, settings, compiled,
                ));
                offset = record_start + header.data_size as usize;
            }
            Err(e) => {
                debug!("skipping record candidate at {record_start}: {e}");
                offset = record_start + 4;
            }
        }
    }

    events
}

/// Parse and validate a candidate record header: magic, plausible size,
/// containment before `scan_end`, and the trailing size copy.
fn validate_record_at(
    data: &[u8],
    record_start: usize,
    scan_end: usize,
) -> DeserializationResult<EvtxRecordHeader> {
    let mut cursor = Cursor::new(data);
    cursor.set_position(record_start as u64);
    let header = EvtxRecordHeader::from_reader(&mut cursor)?;

    let total_size = header.data_size as usize;
    let truncated = crate::err::DeserializationError::Truncated {
        what: "record",
        offset: record_start as u64,
        need: total_size,
        have: scan_end.saturating_sub(record_start),
    };

    if header.body_size().is_none() {
        return Err(truncated);
    }
    let Some(record_end) = record_start.checked_add(total_size) else {
        return Err(truncated);
    };
    if record_end > scan_end {
        return Err(truncated);
    }

    // In bounds: record_end <= scan_end <= data.len() and total_size >= 28.
    let trailing = crate::utils::bytes::read_u32_le(data, record_end - 4).unwrap_or_default();
    if trailing != header.data_size {
        return Err(crate::err::DeserializationError::UnexpectedToken {
            value: 0,
            expected: "trailing size copy to match the record header",
            offset: (record_end - 4) as u64,
        });
    }

    Ok(header)
}

#[allow(clippy::too_many_arguments)]
fn render_record(
    data: &[u8],
    header: &EvtxRecordHeader,
    body_start: usize,
    body_end: usize,
    names: &mut StringCache,
    templates: Option<&TemplateTable>,
    settings: &ParserSettings,
    compiled: &mut LocalTemplateCache,
) -> RenderedEvent {
    let format = settings.get_output_format();
    let mut sink = TextSink::new();
    let mut ctx = RenderContext::new(data, names, templates, compiled, settings.get_ansi_codec());

    let walked = render_record_body(&mut ctx, format, body_start, body_end, &mut sink);
    let mut diagnostic = ctx.take_diagnostic();
    if let Err(e) = walked {
        warn!("record {} rendered partially: {e}", header.event_record_id);
        diagnostic.get_or_insert_with(|| e.to_string());
    }

    let rendered = match format {
        OutputFormat::Xml => RenderedData::Xml(sink.into_string()),
        OutputFormat::Json => RenderedData::Json(sink.into_string()),
    };

    RenderedEvent::new(header, rendered, diagnostic)
}
