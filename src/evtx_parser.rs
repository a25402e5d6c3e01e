use crate::err::Result;
use crate::evtx_chunk::{EVTX_CHUNK_SIZE, EvtxChunk, parse_headerless};
use crate::evtx_file_header::{EVTX_HEADER_BLOCK_SIZE, EvtxFileHeader};
use crate::evtx_record::RenderedEvent;
use crate::settings::ParserSettings;
use crate::template_cache::{CompiledTemplateCache, LocalTemplateCache};

use log::{debug, warn};
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

/// The file driver.
///
/// Owns the complete file image; everything below it borrows. A parse runs
/// in phases: validate the file header, classify every 64 KiB slot, parse
/// the healthy slots on a worker pool (each worker merging its compiled
/// templates into the shared cache when its chunk completes), then re-scan
/// the unhealthy slots headerless against the now-warm cache.
pub struct EvtxParser {
    data: Vec<u8>,
    header: EvtxFileHeader,
    settings: Arc<ParserSettings>,
}

/// One 64 KiB chunk slot. The final slot of a truncated file is padded out
/// to the full chunk size; every other slot borrows the image.
enum ChunkSlot<'a> {
    Full(&'a [u8]),
    Padded(Vec<u8>),
}

impl<'a> ChunkSlot<'a> {
    fn bytes(&self) -> &[u8] {
        match self {
            ChunkSlot::Full(data) => data,
            ChunkSlot::Padded(data) => data,
        }
    }
}

/// What phase one learned about a slot.
enum SlotOutcome {
    Healthy(Vec<RenderedEvent>),
    Unhealthy,
}

impl EvtxParser {
    /// Read the file at `path` into memory and attach to it.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| crate::err::EvtxError::FailedToOpenFile {
            source: e,
            path: path.to_path_buf(),
        })?;
        Self::from_buffer(data)
    }

    /// Attach to a complete file image.
    ///
    /// Fails only when the buffer is not recognizable as EVTX (short header
    /// or wrong magic); all other corruption is recovered during parsing.
    pub fn from_buffer(data: Vec<u8>) -> Result<Self> {
        let header = EvtxFileHeader::from_reader(&mut Cursor::new(data.as_slice()))?;
        Ok(EvtxParser {
            data,
            header,
            settings: Arc::new(ParserSettings::default()),
        })
    }

    pub fn with_configuration(mut self, settings: ParserSettings) -> Self {
        self.settings = Arc::new(settings);
        self
    }

    pub fn header(&self) -> &EvtxFileHeader {
        &self.header
    }

    /// The physical chunk count, derived from the file size. The declared
    /// 16-bit count in the header is advisory and may under-report.
    pub fn chunk_count(&self) -> usize {
        let region = self.data.len().saturating_sub(EVTX_HEADER_BLOCK_SIZE);
        region.div_ceil(EVTX_CHUNK_SIZE)
    }

    fn chunk_slots(&self) -> Vec<ChunkSlot<'_>> {
        let region = match self.data.get(EVTX_HEADER_BLOCK_SIZE..) {
            Some(region) => region,
            None => return Vec::new(),
        };

        let mut slots = Vec::with_capacity(region.len().div_ceil(EVTX_CHUNK_SIZE));
        for chunk in region.chunks(EVTX_CHUNK_SIZE) {
            if chunk.len() == EVTX_CHUNK_SIZE {
                slots.push(ChunkSlot::Full(chunk));
            } else {
                // Zero-pad a truncated trailing slot to the full chunk size.
                let mut padded = vec![0_u8; EVTX_CHUNK_SIZE];
                padded[..chunk.len()].copy_from_slice(chunk);
                slots.push(ChunkSlot::Padded(padded));
            }
        }
        slots
    }

    /// Parse the whole image and return every rendered record, ordered by
    /// `(chunk_index, record_index_in_chunk)`.
    pub fn parse(&self) -> Vec<RenderedEvent> {
        let settings = Arc::clone(&self.settings);
        let shared = Arc::new(CompiledTemplateCache::new());
        shared.seed(settings.get_template_cache_seed());

        let slots = self.chunk_slots();
        debug!("parsing {} chunk slots", slots.len());

        // Phase one: classify and parse healthy slots. Workers publish
        // their compiled templates when their chunk completes.
        let outcomes: Vec<SlotOutcome> = map_indexed(&settings, &slots, |index, slot| {
            let data = slot.bytes();
            match EvtxChunk::new(data, settings.should_validate_checksums()) {
                Ok(mut chunk) => {
                    let mut compiled = LocalTemplateCache::new(Arc::clone(&shared), true);
                    let events = chunk.parse_records(&settings, &mut compiled);
                    compiled.finish();
                    SlotOutcome::Healthy(events)
                }
                Err(fault) => {
                    warn!("chunk {index} routed to recovery: {fault}");
                    SlotOutcome::Unhealthy
                }
            }
        });

        // Phase two: recover the unhealthy slots headerless, reading the
        // shared cache but never publishing into it.
        let unhealthy: Vec<(usize, &ChunkSlot<'_>)> = outcomes
            .iter()
            .enumerate()
            .filter(|(_, outcome)| matches!(outcome, SlotOutcome::Unhealthy))
            .map(|(index, _)| (index, &slots[index]))
            .collect();

        let mut recovered: Vec<(usize, Vec<RenderedEvent>)> =
            map_indexed(&settings, &unhealthy, |_, (index, slot)| {
                let mut compiled = LocalTemplateCache::new(Arc::clone(&shared), false);
                let events = parse_headerless(slot.bytes(), &settings, &mut compiled);
                debug!("recovered {} records from chunk {index}", events.len());
                (*index, events)
            });

        // Stitch results back into chunk-index order.
        let mut recovered_by_index = recovered.drain(..).collect::<hashbrown::HashMap<_, _>>();
        let mut events = Vec::new();
        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                SlotOutcome::Healthy(chunk_events) => events.extend(chunk_events),
                SlotOutcome::Unhealthy => {
                    if let Some(chunk_events) = recovered_by_index.remove(&index) {
                        events.extend(chunk_events);
                    }
                }
            }
        }
        events
    }

    /// Iterate the parse results serially.
    pub fn records(&self) -> impl Iterator<Item = RenderedEvent> {
        self.parse().into_iter()
    }

    /// Parse and decode every record's JSON output into `serde_json::Value`.
    ///
    /// Only meaningful with `OutputFormat::Json`.
    pub fn records_json_value(&self) -> Result<Vec<serde_json::Value>> {
        self.parse().iter().map(RenderedEvent::json_value).collect()
    }
}

/// Apply `work` to every item, in parallel when the build and the settings
/// allow it, preserving input order in the output.
fn map_indexed<T, R, F>(settings: &ParserSettings, items: &[T], work: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(usize, &T) -> R + Sync,
{
    #[cfg(not(feature = "multithreading"))]
    let _ = settings;

    #[cfg(feature = "multithreading")]
    {
        use rayon::prelude::*;

        if settings.get_num_threads() != 1 && items.len() > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(settings.get_num_threads())
                .build();
            match pool {
                Ok(pool) => {
                    return pool.install(|| {
                        items
                            .par_iter()
                            .enumerate()
                            .map(|(index, item)| work(index, item))
                            .collect()
                    });
                }
                Err(e) => warn!("failed to build worker pool, falling back to serial: {e}"),
            }
        }
    }

    items
        .iter()
        .enumerate()
        .map(|(index, item)| work(index, item))
        .collect()
}
