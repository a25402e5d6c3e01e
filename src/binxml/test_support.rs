//! Minimal BinXml encoder for unit tests.
//!
//! Writes token streams into a plain buffer; inline name offsets are
//! relative to the buffer start, so a stream encoded at offset 0 can be
//! walked with the buffer standing in for a chunk.

pub(crate) struct TestBinXml {
    pub buf: Vec<u8>,
    element_sizes: Vec<usize>,
    attr_lists: Vec<usize>,
}

impl TestBinXml {
    pub(crate) fn new() -> Self {
        TestBinXml {
            buf: Vec::new(),
            element_sizes: Vec::new(),
            attr_lists: Vec::new(),
        }
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn patch_u32(&mut self, at: usize, v: u32) {
        self.buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn inline_name(&mut self, name: &str) {
        let offset = self.buf.len() as u32 + 4;
        self.u32(offset);
        self.buf.extend_from_slice(&[0_u8; 4]);
        self.u16(0);
        let units: Vec<u16> = name.encode_utf16().collect();
        self.u16(units.len() as u16);
        for unit in units {
            self.u16(unit);
        }
        self.u16(0);
    }

    pub(crate) fn fragment_header(&mut self) {
        self.buf.push(0x0f);
        self.buf.extend_from_slice(&[1, 1, 0]);
    }

    pub(crate) fn start_element(&mut self, name: &str, has_attributes: bool) {
        self.buf.push(if has_attributes { 0x41 } else { 0x01 });
        self.u16(0);
        self.element_sizes.push(self.buf.len());
        self.u32(0);
        self.inline_name(name);
        if has_attributes {
            self.attr_lists.push(self.buf.len());
            self.u32(0);
        }
    }

    fn patch_attr_list(&mut self) {
        if let Some(at) = self.attr_lists.pop() {
            let size = (self.buf.len() - (at + 4)) as u32;
            self.patch_u32(at, size);
        }
    }

    pub(crate) fn close_start_element(&mut self) {
        self.patch_attr_list();
        self.buf.push(0x02);
    }

    pub(crate) fn close_empty_element(&mut self) {
        self.patch_attr_list();
        self.buf.push(0x03);
        let at = self.element_sizes.pop().expect("unbalanced element");
        let size = (self.buf.len() - (at + 4)) as u32;
        self.patch_u32(at, size);
    }

    pub(crate) fn end_element(&mut self) {
        self.buf.push(0x04);
        let at = self.element_sizes.pop().expect("unbalanced element");
        let size = (self.buf.len() - (at + 4)) as u32;
        self.patch_u32(at, size);
    }

    pub(crate) fn attribute_start(&mut self, name: &str) {
        self.buf.push(0x46);
        self.inline_name(name);
    }

    pub(crate) fn value_string(&mut self, value: &str) {
        self.buf.push(0x05);
        self.buf.push(0x01);
        let units: Vec<u16> = value.encode_utf16().collect();
        self.u16(units.len() as u16);
        for unit in units {
            self.u16(unit);
        }
    }

    pub(crate) fn substitution(&mut self, index: u16, type_code: u8, optional: bool) {
        self.buf.push(if optional { 0x0e } else { 0x0d });
        self.u16(index);
        self.buf.push(type_code);
    }

    pub(crate) fn eof(&mut self) {
        self.buf.push(0x00);
    }
}
