use crate::ChunkOffset;
use crate::binxml::name::read_name_struct;

use hashbrown::HashMap;
use log::trace;
use std::rc::Rc;

/// Offset of the 64-entry common-string table inside a chunk.
const COMMON_STRING_TABLE_OFFSET: usize = 128;
const COMMON_STRING_BUCKETS: usize = 64;

/// Per-chunk cache of element/attribute names, keyed by chunk-relative
/// offset.
///
/// Construction pre-scans the common-string table; the token walker inserts
/// inline names and decoded back-references lazily as it meets them.
#[derive(Debug, Default)]
pub struct StringCache(HashMap<ChunkOffset, Rc<str>, ahash::RandomState>);

impl StringCache {
    /// An empty cache, used for headerless recovery where the common-string
    /// table cannot be trusted.
    pub(crate) fn empty() -> Self {
        StringCache(HashMap::default())
    }

    /// Pre-scan the 64 common-string buckets of `data` (a full chunk).
    ///
    /// Unusable bucket entries are skipped; a chunk whose string table is
    /// damaged still parses, it just decodes names on demand.
    pub(crate) fn populate(data: &[u8]) -> Self {
        let mut cache = StringCache::empty();

        for bucket in 0..COMMON_STRING_BUCKETS {
            let slot = COMMON_STRING_TABLE_OFFSET + bucket * 4;
            let offset = match crate::utils::bytes::read_u32_le(data, slot) {
                Some(offset) => offset,
                None => break,
            };
            if offset == 0 {
                continue;
            }
            match read_name_struct(data, offset as usize) {
                Ok((name, _)) => {
                    cache.0.insert(offset, name);
                }
                Err(e) => trace!("skipping common-string bucket {bucket}: {e}"),
            }
        }

        cache
    }

    pub(crate) fn insert(&mut self, offset: ChunkOffset, name: Rc<str>) {
        self.0.entry(offset).or_insert(name);
    }

    /// Look up `offset`, decoding and caching on a miss.
    ///
    /// An offset that does not decode (out of bounds, truncated structure)
    /// yields the empty string; the walker treats missing names as empty
    /// rather than abandoning the record.
    pub(crate) fn get_or_decode(&mut self, data: &[u8], offset: ChunkOffset) -> Rc<str> {
        if let Some(name) = self.0.get(&offset) {
            return Rc::clone(name);
        }

        let name = match read_name_struct(data, offset as usize) {
            Ok((name, _)) => name,
            Err(e) => {
                trace!("name at offset {offset} is unreadable: {e}");
                Rc::from("")
            }
        };
        self.0.insert(offset, Rc::clone(&name));
        name
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_name_struct(name: &str) -> Vec<u8> {
        let mut out = vec![0_u8; 6];
        let units: Vec<u16> = name.encode_utf16().collect();
        out.extend_from_slice(&(units.len() as u16).to_le_bytes());
        for unit in units {
            out.extend_from_slice(&unit.to_le_bytes());
        }
        out.extend_from_slice(&[0, 0]);
        out
    }

    #[test]
    fn populates_from_common_string_table() {
        let mut chunk = vec![0_u8; 512];
        let name_offset = 512_u32;
        chunk.extend_from_slice(&encode_name_struct("Provider"));
        chunk[128..132].copy_from_slice(&name_offset.to_le_bytes());

        let mut cache = StringCache::populate(&chunk);
        assert_eq!(cache.len(), 1);
        assert_eq!(&*cache.get_or_decode(&chunk, name_offset), "Provider");
    }

    #[test]
    fn lazy_decode_caches_misses() {
        let mut chunk = vec![0_u8; 512];
        chunk.extend_from_slice(&encode_name_struct("Level"));

        let mut cache = StringCache::empty();
        assert_eq!(&*cache.get_or_decode(&chunk, 512), "Level");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn bad_offset_yields_empty_string() {
        let chunk = vec![0_u8; 512];
        let mut cache = StringCache::empty();
        assert_eq!(&*cache.get_or_decode(&chunk, 1_000_000), "");
    }
}
