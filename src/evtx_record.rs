use crate::err::{DeserializationError, DeserializationResult, Result};
use crate::utils::format_filetime;

use byteorder::{LittleEndian, ReadBytesExt};
use serde::Serialize;
use std::io::{Cursor, Read};

pub const EVTX_RECORD_HEADER_SIZE: usize = 24;
pub const EVTX_RECORD_MAGIC: [u8; 4] = [0x2a, 0x2a, 0x00, 0x00];

/// The fixed 24-byte record header: magic, total size, record id, and the
/// written-time FILETIME. The BinXml body follows, then a trailing copy of
/// the size.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct EvtxRecordHeader {
    pub data_size: u32,
    pub event_record_id: u64,
    pub timestamp_ticks: u64,
}

impl EvtxRecordHeader {
    pub(crate) fn from_reader(
        input: &mut Cursor<&[u8]>,
    ) -> DeserializationResult<EvtxRecordHeader> {
        let offset = input.position();
        let mut magic = [0_u8; 4];
        input
            .read_exact(&mut magic)
            .map_err(|_| DeserializationError::Truncated {
                what: "record header",
                offset,
                need: EVTX_RECORD_HEADER_SIZE,
                have: 0,
            })?;

        if magic != EVTX_RECORD_MAGIC {
            return Err(DeserializationError::UnexpectedToken {
                value: magic[0],
                expected: "record magic `2a2a0000`",
                offset,
            });
        }

        let read_err = |_| DeserializationError::Truncated {
            what: "record header",
            offset,
            need: EVTX_RECORD_HEADER_SIZE,
            have: 4,
        };
        let data_size = input.read_u32::<LittleEndian>().map_err(read_err)?;
        let event_record_id = input.read_u64::<LittleEndian>().map_err(read_err)?;
        let timestamp_ticks = input.read_u64::<LittleEndian>().map_err(read_err)?;

        Ok(EvtxRecordHeader {
            data_size,
            event_record_id,
            timestamp_ticks,
        })
    }

    /// Length of the BinXml body between the header and the trailing size
    /// copy, when the declared size is plausible at all.
    pub fn body_size(&self) -> Option<usize> {
        (self.data_size as usize).checked_sub(EVTX_RECORD_HEADER_SIZE + 4)
    }
}

/// The rendered form of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RenderedData {
    Xml(String),
    Json(String),
}

impl RenderedData {
    pub fn as_str(&self) -> &str {
        match self {
            RenderedData::Xml(text) | RenderedData::Json(text) => text,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.as_str().as_bytes()
    }

    pub fn into_string(self) -> String {
        match self {
            RenderedData::Xml(text) | RenderedData::Json(text) => text,
        }
    }
}

/// The user-visible output for a single record.
///
/// `diagnostic` is set only when rendering degraded (truncated body,
/// unresolvable template back-reference, recursion cap); the data may then
/// be partial or empty, but the record is still emitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedEvent {
    pub event_record_id: u64,
    /// The record's written time, ISO-8601; empty for a zero FILETIME.
    pub timestamp: String,
    pub data: RenderedData,
    pub diagnostic: Option<String>,
}

impl RenderedEvent {
    pub(crate) fn new(
        header: &EvtxRecordHeader,
        data: RenderedData,
        diagnostic: Option<String>,
    ) -> Self {
        RenderedEvent {
            event_record_id: header.event_record_id,
            timestamp: format_filetime(header.timestamp_ticks),
            data,
            diagnostic,
        }
    }

    /// Parse JSON output into a `serde_json::Value` tree.
    ///
    /// Fails for XML-rendered events.
    pub fn json_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(self.data.as_str())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_header(data_size: u32, id: u64, ticks: u64) -> Vec<u8> {
        let mut out = EVTX_RECORD_MAGIC.to_vec();
        out.extend_from_slice(&data_size.to_le_bytes());
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&ticks.to_le_bytes());
        out
    }

    #[test]
    fn parses_record_header() {
        let bytes = encode_header(96, 17, 116_444_736_000_000_000);
        let mut cursor = Cursor::new(bytes.as_slice());
        let header = EvtxRecordHeader::from_reader(&mut cursor).unwrap();

        assert_eq!(header.data_size, 96);
        assert_eq!(header.event_record_id, 17);
        assert_eq!(header.body_size(), Some(96 - 28));
        assert_eq!(cursor.position() as usize, EVTX_RECORD_HEADER_SIZE);
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut bytes = encode_header(96, 17, 0);
        bytes[0] = 0x2b;
        let mut cursor = Cursor::new(bytes.as_slice());
        assert!(EvtxRecordHeader::from_reader(&mut cursor).is_err());
    }

    #[test]
    fn implausible_size_has_no_body() {
        let bytes = encode_header(8, 1, 0);
        let mut cursor = Cursor::new(bytes.as_slice());
        let header = EvtxRecordHeader::from_reader(&mut cursor).unwrap();
        assert_eq!(header.body_size(), None);
    }
}
