//! Stack-first growable text buffer for record rendering.
//!
//! A `TextSink` starts as a fixed inline buffer and spills into a pooled heap
//! buffer once a record outgrows it. Typical records render without touching
//! the heap at all; the spill buffers are recycled through a thread-local
//! pool, so a worker that hits a handful of oversized records reuses the same
//! allocation for the rest of its chunk. The pool hand-back happens in `Drop`,
//! so every exit path releases the buffer.

use std::cell::RefCell;

const INLINE_CAPACITY: usize = 1024;
const POOL_LIMIT: usize = 8;

thread_local! {
    static SPILL_POOL: RefCell<Vec<Vec<u8>>> = const { RefCell::new(Vec::new()) };
}

fn pool_take(min_capacity: usize) -> Vec<u8> {
    SPILL_POOL.with(|pool| {
        let mut pool = pool.borrow_mut();
        match pool.pop() {
            Some(mut buf) => {
                buf.clear();
                buf.reserve(min_capacity);
                buf
            }
            None => Vec::with_capacity(min_capacity.max(INLINE_CAPACITY * 4)),
        }
    })
}

fn pool_return(buf: Vec<u8>) {
    SPILL_POOL.with(|pool| {
        let mut pool = pool.borrow_mut();
        if pool.len() < POOL_LIMIT {
            pool.push(buf);
        }
    })
}

/// An append-only UTF-8 text buffer.
///
/// Invariant: the contents are always valid UTF-8. Every public append
/// method takes `char`, `&str`, or formats a number, so partial sequences
/// can never be written.
pub struct TextSink {
    inline: [u8; INLINE_CAPACITY],
    inline_len: usize,
    spill: Option<Vec<u8>>,
}

impl TextSink {
    pub fn new() -> Self {
        TextSink {
            inline: [0_u8; INLINE_CAPACITY],
            inline_len: 0,
            spill: None,
        }
    }

    pub fn len(&self) -> usize {
        match &self.spill {
            Some(buf) => buf.len(),
            None => self.inline_len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        match &mut self.spill {
            Some(buf) => buf.clear(),
            None => self.inline_len = 0,
        }
    }

    fn push_raw(&mut self, bytes: &[u8]) {
        if let Some(buf) = &mut self.spill {
            buf.extend_from_slice(bytes);
            return;
        }

        if self.inline_len + bytes.len() <= INLINE_CAPACITY {
            self.inline[self.inline_len..self.inline_len + bytes.len()].copy_from_slice(bytes);
            self.inline_len += bytes.len();
            return;
        }

        let mut buf = pool_take(self.inline_len + bytes.len());
        buf.extend_from_slice(&self.inline[..self.inline_len]);
        buf.extend_from_slice(bytes);
        self.inline_len = 0;
        self.spill = Some(buf);
    }

    pub fn push(&mut self, ch: char) {
        let mut utf8 = [0_u8; 4];
        self.push_raw(ch.encode_utf8(&mut utf8).as_bytes());
    }

    pub fn push_str(&mut self, s: &str) {
        self.push_raw(s.as_bytes());
    }

    pub fn push_u64(&mut self, value: u64) {
        let mut buf = itoa::Buffer::new();
        self.push_str(buf.format(value));
    }

    pub fn push_i64(&mut self, value: i64) {
        let mut buf = itoa::Buffer::new();
        self.push_str(buf.format(value));
    }

    pub fn push_f32(&mut self, value: f32) {
        let mut buf = ryu::Buffer::new();
        self.push_str(buf.format(value));
    }

    pub fn push_f64(&mut self, value: f64) {
        let mut buf = ryu::Buffer::new();
        self.push_str(buf.format(value));
    }

    /// Append `value` as zero-padded hex, `width` digits, no prefix.
    pub fn push_hex_u64(&mut self, value: u64, width: usize, upper: bool) {
        const LOWER: &[u8; 16] = b"0123456789abcdef";
        const UPPER: &[u8; 16] = b"0123456789ABCDEF";
        let digits = if upper { UPPER } else { LOWER };

        // 16 digits cover a full u64; wider paddings are not used by any type code.
        let width = width.clamp(1, 16);
        let mut out = [0_u8; 16];
        for (i, slot) in out[..width].iter_mut().enumerate() {
            let shift = 4 * (width - 1 - i);
            *slot = digits[((value >> shift) & 0xF) as usize];
        }
        self.push_raw(&out[..width]);
    }

    /// Append every byte as two hex digits.
    pub fn push_hex_bytes(&mut self, bytes: &[u8], upper: bool) {
        for &b in bytes {
            self.push_hex_u64(u64::from(b), 2, upper);
        }
    }

    /// Append `value` as decimal, zero-padded to `width` digits.
    pub fn push_decimal_padded(&mut self, value: u64, width: usize) {
        let mut buf = itoa::Buffer::new();
        let formatted = buf.format(value);
        for _ in formatted.len()..width {
            self.push_raw(b"0");
        }
        self.push_str(formatted);
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.spill {
            Some(buf) => buf,
            None => &self.inline[..self.inline_len],
        }
    }

    pub fn as_str(&self) -> &str {
        // SAFETY: every append path writes whole `char`s, `&str`s, or ASCII
        // digits, so the buffer is valid UTF-8 by construction.
        unsafe { std::str::from_utf8_unchecked(self.as_bytes()) }
    }

    pub fn into_string(self) -> String {
        self.as_str().to_owned()
    }
}

impl Default for TextSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TextSink {
    fn drop(&mut self) {
        if let Some(buf) = self.spill.take() {
            pool_return(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_inline_for_small_appends() {
        let mut sink = TextSink::new();
        sink.push_str("hello");
        sink.push(' ');
        sink.push_u64(42);
        assert_eq!(sink.as_str(), "hello 42");
        assert!(sink.spill.is_none());
    }

    #[test]
    fn spills_and_preserves_contents() {
        let mut sink = TextSink::new();
        let chunk = "0123456789abcdef";
        for _ in 0..100 {
            sink.push_str(chunk);
        }
        assert_eq!(sink.len(), 1600);
        assert!(sink.spill.is_some());
        assert!(sink.as_str().starts_with(chunk));
        assert!(sink.as_str().ends_with(chunk));
    }

    #[test]
    fn hex_padding() {
        let mut sink = TextSink::new();
        sink.push_hex_u64(0x2a, 8, false);
        sink.push(' ');
        sink.push_hex_u64(0xDEAD, 16, false);
        sink.push(' ');
        sink.push_hex_bytes(&[0xAB, 0x01], true);
        assert_eq!(sink.as_str(), "0000002a 000000000000dead AB01");
    }

    #[test]
    fn decimal_padding() {
        let mut sink = TextSink::new();
        sink.push_decimal_padded(7, 2);
        sink.push(':');
        sink.push_decimal_padded(123, 7);
        assert_eq!(sink.as_str(), "07:0000123");
    }

    #[test]
    fn float_round_trip_formatting() {
        let mut sink = TextSink::new();
        sink.push_f64(0.1);
        sink.push(' ');
        sink.push_f32(1.5);
        assert_eq!(sink.as_str(), "0.1 1.5");
    }
}
