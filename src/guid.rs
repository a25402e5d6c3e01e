use crate::utils::TextSink;
use std::fmt::{self, Debug, Display};

/// A Windows GUID.
///
/// The first three groups are stored little-endian on disk; the trailing
/// eight bytes are stored in display order.
#[derive(PartialOrd, PartialEq, Eq, Clone, Copy)]
pub struct Guid {
    data1: u32,
    data2: u16,
    data3: u16,
    data4: [u8; 8],
}

impl Guid {
    pub fn from_bytes(bytes: &[u8; 16]) -> Guid {
        let mut data4 = [0_u8; 8];
        data4.copy_from_slice(&bytes[8..16]);

        Guid {
            data1: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            data2: u16::from_le_bytes([bytes[4], bytes[5]]),
            data3: u16::from_le_bytes([bytes[6], bytes[7]]),
            data4,
        }
    }

    /// Append the canonical `XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX` form,
    /// uppercase, no braces.
    pub(crate) fn push_to(&self, out: &mut TextSink) {
        out.push_hex_u64(u64::from(self.data1), 8, true);
        out.push('-');
        out.push_hex_u64(u64::from(self.data2), 4, true);
        out.push('-');
        out.push_hex_u64(u64::from(self.data3), 4, true);
        out.push('-');
        out.push_hex_bytes(&self.data4[..2], true);
        out.push('-');
        out.push_hex_bytes(&self.data4[2..], true);
    }
}

impl Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut sink = TextSink::new();
        self.push_to(&mut sink);
        f.write_str(sink.as_str())
    }
}

impl Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_endian_formatting() {
        let bytes: [u8; 16] = [
            0x33, 0x22, 0x11, 0x00, 0x55, 0x44, 0x77, 0x66, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD,
            0xEE, 0xFF,
        ];
        assert_eq!(
            Guid::from_bytes(&bytes).to_string(),
            "00112233-4455-6677-8899-AABBCCDDEEFF"
        );
    }
}
