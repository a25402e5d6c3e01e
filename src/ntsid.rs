use crate::utils::TextSink;
use std::fmt::{self, Debug, Display};

/// A Windows security identifier.
///
/// On disk: revision (1 byte), sub-authority count (1 byte), a 6-byte
/// big-endian identifier authority, then the sub-authorities as
/// little-endian u32s.
#[derive(PartialOrd, PartialEq, Eq, Clone)]
pub struct Sid {
    revision: u8,
    authority: u64,
    sub_authorities: Vec<u32>,
}

impl Sid {
    /// Decode a SID from `bytes`, which must hold the whole structure.
    pub fn from_bytes(bytes: &[u8]) -> Option<Sid> {
        if bytes.len() < 8 {
            return None;
        }

        let revision = bytes[0];
        let count = bytes[1] as usize;
        if bytes.len() < 8 + count * 4 {
            return None;
        }

        let mut authority = 0_u64;
        for &b in &bytes[2..8] {
            authority = (authority << 8) | u64::from(b);
        }

        let sub_authorities = bytes[8..8 + count * 4]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Some(Sid {
            revision,
            authority,
            sub_authorities,
        })
    }

    /// Append the `S-R-A-S1-S2-...` form.
    pub(crate) fn push_to(&self, out: &mut TextSink) {
        out.push_str("S-");
        out.push_u64(u64::from(self.revision));
        out.push('-');
        out.push_u64(self.authority);
        for sub in &self.sub_authorities {
            out.push('-');
            out.push_u64(u64::from(*sub));
        }
    }
}

impl Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut sink = TextSink::new();
        self.push_to(&mut sink);
        f.write_str(sink.as_str())
    }
}

impl Debug for Sid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(self, f)
    }
}
