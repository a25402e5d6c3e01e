//! A fast parser for the Windows XML Event Log (EVTX) format.
//!
//! The parser ingests a complete file image and yields, per record, either
//! reconstructed XML or a structural JSON document. Chunks are parsed on a
//! worker pool; template bodies are compiled once per GUID into static
//! fragments with substitution slots and then zipper-rendered per record.
//! Corrupt chunks are re-scanned headerless rather than failing the parse.
//!
//! ```no_run
//! use evtxscan::{EvtxParser, OutputFormat, ParserSettings};
//!
//! # fn main() -> evtxscan::err::Result<()> {
//! let parser = EvtxParser::from_path("System.evtx")?
//!     .with_configuration(ParserSettings::new().output_format(OutputFormat::Json));
//!
//! for record in parser.records() {
//!     println!("{}", record.data.as_str());
//! }
//! # Ok(())
//! # }
//! ```

pub mod err;

mod binxml;
mod evtx_chunk;
mod evtx_file_header;
mod evtx_parser;
mod evtx_record;
mod guid;
mod ntsid;
mod settings;
mod string_cache;
mod template_cache;
mod utils;

/// A 32-bit offset relative to the start of a chunk.
pub type ChunkOffset = u32;

pub use binxml::compiled::{CommaRule, CompiledTemplate, SlotContext, TemplateSlot};
pub use evtx_chunk::{
    ChunkFault, EVTX_CHUNK_HEADER_SIZE, EVTX_CHUNK_SIZE, EvtxChunk, EvtxChunkHeader,
};
pub use evtx_file_header::{
    EVTX_FILE_HEADER_SIZE, EVTX_HEADER_BLOCK_SIZE, EvtxFileHeader, HeaderFlags,
};
pub use evtx_parser::EvtxParser;
pub use evtx_record::{
    EVTX_RECORD_HEADER_SIZE, EvtxRecordHeader, RenderedData, RenderedEvent,
};
pub use guid::Guid;
pub use ntsid::Sid;
pub use settings::{OutputFormat, ParserSettings};
pub use template_cache::{CompiledTemplateCache, TemplateGuid};

// For tests, we only initialize logging once.
#[cfg(test)]
use std::sync::Once;

#[cfg(test)]
static LOGGER_INIT: Once = Once::new();

/// Tests run concurrently; initializing the logger more than once panics.
#[cfg(test)]
pub(crate) fn ensure_env_logger_initialized() {
    LOGGER_INIT.call_once(env_logger::init);
}
