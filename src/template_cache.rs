use crate::ChunkOffset;
use crate::binxml::compiled::CompiledTemplate;
use crate::err::{DeserializationError, DeserializationResult};
use crate::utils::bytes;

use hashbrown::HashMap;
use log::trace;
use std::sync::{Arc, Mutex};

pub type TemplateGuid = [u8; 16];

/// Offset of the 32-bucket template pointer table inside a chunk.
const TEMPLATE_TABLE_OFFSET: usize = 384;
const TEMPLATE_TABLE_BUCKETS: usize = 32;

/// Size of the header preceding a template body: next pointer (4),
/// GUID (16), body size (4).
pub(crate) const TEMPLATE_DEFINITION_HEADER_SIZE: usize = 24;

/// A template definition available for back-reference inside one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TemplateDescriptor {
    pub guid: TemplateGuid,
    pub data_size: u32,
}

/// Decode the 24-byte definition header at `offset`.
pub(crate) fn read_template_definition_header(
    data: &[u8],
    offset: usize,
) -> DeserializationResult<(u32, TemplateDescriptor)> {
    let next_offset = bytes::read_u32_le_r(data, offset, "template next pointer")?;
    let guid = bytes::read_array_r::<16>(data, offset + 4, "template guid")?;
    let data_size = bytes::read_u32_le_r(data, offset + 20, "template data size")?;
    Ok((next_offset, TemplateDescriptor { guid, data_size }))
}

/// The per-chunk table of template definitions, keyed by chunk-relative
/// offset.
///
/// Built by chasing the 32 bucket chains at chunk offset 384. Besides
/// answering back-references, the recorded `data_size` bounds template body
/// reads so the walker never runs past a definition's declared extent.
#[derive(Debug, Default)]
pub struct TemplateTable(HashMap<ChunkOffset, TemplateDescriptor, ahash::RandomState>);

impl TemplateTable {
    pub(crate) fn empty() -> Self {
        TemplateTable(HashMap::default())
    }

    /// Walk every bucket chain of `data` (a full chunk).
    ///
    /// A chain entry pointing outside the chunk ends its chain; a chain
    /// revisiting an offset (or longer than the bucket cap) is corrupt
    /// enough that the whole chunk is rejected.
    pub(crate) fn populate(data: &[u8]) -> DeserializationResult<Self> {
        let mut table = TemplateTable::empty();

        for bucket in 0..TEMPLATE_TABLE_BUCKETS {
            let slot = TEMPLATE_TABLE_OFFSET + bucket * 4;
            let mut offset = bytes::read_u32_le_r(data, slot, "template table bucket")?;

            let mut chain_len = 0_usize;
            while offset != 0 {
                if offset as usize >= data.len() {
                    trace!("template chain leaves the chunk at {offset}, stopping");
                    break;
                }
                if table.0.contains_key(&offset) || chain_len >= TEMPLATE_TABLE_BUCKETS {
                    return Err(DeserializationError::CyclicTemplateTable {
                        offset: u64::from(offset),
                    });
                }

                let (next_offset, descriptor) =
                    read_template_definition_header(data, offset as usize)?;
                table.0.insert(offset, descriptor);

                chain_len += 1;
                offset = next_offset;
            }
        }

        Ok(table)
    }

    pub(crate) fn get(&self, offset: ChunkOffset) -> Option<&TemplateDescriptor> {
        self.0.get(&offset)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The shared compiled-template cache for one parse call.
///
/// Keyed by template GUID. `None` marks a GUID whose compilation was
/// attempted and rejected, so later lookups take the fallback path without
/// retrying. Entries are immutable once installed and never evicted; the
/// first installed result wins.
#[derive(Debug, Default)]
pub struct CompiledTemplateCache {
    inner: Mutex<HashMap<TemplateGuid, Option<Arc<CompiledTemplate>>, ahash::RandomState>>,
}

impl CompiledTemplateCache {
    pub fn new() -> Self {
        Default::default()
    }

    /// Seed authoritative entries (e.g. from an external WEVT extraction).
    pub fn seed(&self, entries: &HashMap<TemplateGuid, Arc<CompiledTemplate>>) {
        let mut inner = self.inner.lock().expect("compiled cache poisoned");
        for (guid, template) in entries {
            inner.insert(*guid, Some(Arc::clone(template)));
        }
    }

    fn get(&self, guid: &TemplateGuid) -> Option<Option<Arc<CompiledTemplate>>> {
        self.inner
            .lock()
            .expect("compiled cache poisoned")
            .get(guid)
            .cloned()
    }

    /// Install every local entry whose GUID is not already present.
    fn merge(&self, local: HashMap<TemplateGuid, Option<Arc<CompiledTemplate>>>) {
        let mut inner = self.inner.lock().expect("compiled cache poisoned");
        for (guid, template) in local {
            inner.entry(guid).or_insert(template);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("compiled cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A worker's view of the compiled cache.
///
/// Lookups go local-first, then shared (copying the hit down). New results
/// land in the local map and are published in one `merge` when the worker
/// finishes its chunk; recovery workers read the shared cache but never
/// publish.
#[derive(Debug)]
pub(crate) struct LocalTemplateCache {
    shared: Arc<CompiledTemplateCache>,
    local: HashMap<TemplateGuid, Option<Arc<CompiledTemplate>>>,
    publish: bool,
}

impl LocalTemplateCache {
    pub(crate) fn new(shared: Arc<CompiledTemplateCache>, publish: bool) -> Self {
        LocalTemplateCache {
            shared,
            local: HashMap::new(),
            publish,
        }
    }

    pub(crate) fn lookup(&mut self, guid: &TemplateGuid) -> Option<Option<Arc<CompiledTemplate>>> {
        if let Some(hit) = self.local.get(guid) {
            return Some(hit.clone());
        }
        if let Some(hit) = self.shared.get(guid) {
            self.local.insert(*guid, hit.clone());
            return Some(hit);
        }
        None
    }

    pub(crate) fn insert(&mut self, guid: TemplateGuid, template: Option<Arc<CompiledTemplate>>) {
        self.local.entry(guid).or_insert(template);
    }

    /// Publish local results into the shared cache, consuming the overlay.
    pub(crate) fn finish(self) {
        if self.publish && !self.local.is_empty() {
            self.shared.merge(self.local);
        }
    }
}
