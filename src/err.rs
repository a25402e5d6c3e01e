use thiserror::Error;

pub type Result<T> = std::result::Result<T, EvtxError>;

pub(crate) type DeserializationResult<T> = std::result::Result<T, DeserializationError>;

/// Errors that cross the public boundary.
///
/// Only "this buffer is not an EVTX file" conditions terminate a parse.
/// Chunk- and record-level corruption never surfaces here: damaged chunks
/// are routed to recovery, damaged records are skipped, and degraded
/// renderings carry a per-record diagnostic instead.
#[derive(Debug, Error)]
pub enum EvtxError {
    #[error("The buffer is too small to hold an EVTX file header ({have} bytes, need 128)")]
    IncompleteFileHeader { have: usize },

    #[error("Invalid EVTX file header magic, expected `ElfFile\\0`, found `{magic:02X?}`")]
    InvalidEvtxFileHeaderMagic { magic: [u8; 8] },

    #[error("Failed to open file {}", path.display())]
    FailedToOpenFile {
        source: std::io::Error,
        path: std::path::PathBuf,
    },

    #[error("An I/O error has occurred")]
    IO {
        #[from]
        source: std::io::Error,
    },

    #[error("`serde_json` failed")]
    JsonError {
        #[from]
        source: serde_json::Error,
    },
}

/// Internal structural errors, always carrying the offset of the failure.
///
/// These drive the recovery policy: a preload failure rejects the chunk, a
/// record-header failure skips the record, and a failure inside rendering
/// becomes the record's diagnostic.
#[derive(Debug, Error)]
pub(crate) enum DeserializationError {
    #[error("Offset {offset}: truncated {what} (need {need} bytes, have {have})")]
    Truncated {
        what: &'static str,
        offset: u64,
        need: usize,
        have: usize,
    },

    #[error("Offset {offset}: invalid byte `{value:#04x}` as a binxml token")]
    InvalidToken { value: u8, offset: u64 },

    #[error("Offset {offset}: invalid byte `{value:#04x}` as a binxml value type")]
    InvalidValueVariant { value: u8, offset: u64 },

    #[error("Offset {offset}: unexpected token `{value:#04x}`, expected {expected}")]
    UnexpectedToken {
        value: u8,
        expected: &'static str,
        offset: u64,
    },

    #[error("Offset {offset}: template definition could not be resolved")]
    UnresolvedTemplate { offset: u64 },

    #[error("Offset {offset}: {what} points outside the chunk")]
    OutOfChunkBounds { what: &'static str, offset: u64 },

    #[error("Template table bucket forms a cycle at offset {offset}")]
    CyclicTemplateTable { offset: u64 },
}
