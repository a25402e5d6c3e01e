use crate::binxml::compiled::CompiledTemplate;
use crate::template_cache::TemplateGuid;

use encoding::EncodingRef;
use encoding::all::ISO_8859_1;
use hashbrown::HashMap;
use std::fmt;
use std::sync::Arc;

/// The renderer a parse produces output in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Xml,
    Json,
}

#[derive(Clone)]
pub struct ParserSettings {
    num_threads: usize,
    output_format: OutputFormat,
    validate_checksums: bool,
    ansi_codec: EncodingRef,
    template_cache_seed: HashMap<TemplateGuid, Arc<CompiledTemplate>>,
}

impl Default for ParserSettings {
    fn default() -> Self {
        ParserSettings {
            num_threads: 0,
            output_format: OutputFormat::Xml,
            validate_checksums: false,
            ansi_codec: ISO_8859_1,
            template_cache_seed: HashMap::new(),
        }
    }
}

impl fmt::Debug for ParserSettings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ParserSettings")
            .field("num_threads", &self.num_threads)
            .field("output_format", &self.output_format)
            .field("validate_checksums", &self.validate_checksums)
            .field("ansi_codec", &self.ansi_codec.name())
            .field("template_cache_seed", &self.template_cache_seed.len())
            .finish()
    }
}

impl ParserSettings {
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets the maximum degree of parallelism.
    ///
    /// `0` means "one worker per core". `1` forces the serial path, which is
    /// also what a build without the `multithreading` feature gets.
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    /// When set, chunks whose header or records CRC32 does not match are
    /// rejected and routed to the recovery scan.
    pub fn validate_checksums(mut self, validate_checksums: bool) -> Self {
        self.validate_checksums = validate_checksums;
        self
    }

    /// Sets the codec used to decode `ansi_string` values.
    ///
    /// Defaults to ISO-8859-1; logs written by programs using other OEM code
    /// pages can override this.
    pub fn ansi_codec(mut self, ansi_codec: EncodingRef) -> Self {
        self.ansi_codec = ansi_codec;
        self
    }

    /// Seeds the compiled-template cache.
    ///
    /// Seeded entries are authoritative: they are never recompiled, and a
    /// record referencing a seeded GUID renders through the seed even when
    /// its chunk carries its own definition.
    pub fn template_cache_seed(
        mut self,
        seed: HashMap<TemplateGuid, Arc<CompiledTemplate>>,
    ) -> Self {
        self.template_cache_seed = seed;
        self
    }

    pub fn get_num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn get_output_format(&self) -> OutputFormat {
        self.output_format
    }

    pub fn should_validate_checksums(&self) -> bool {
        self.validate_checksums
    }

    pub fn get_ansi_codec(&self) -> EncodingRef {
        self.ansi_codec
    }

    pub(crate) fn get_template_cache_seed(
        &self,
    ) -> &HashMap<TemplateGuid, Arc<CompiledTemplate>> {
        &self.template_cache_seed
    }
}
