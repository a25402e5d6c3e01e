//! The raw BinXml token byte set.
//!
//! Tokens are one byte; 0x40 is the "more data" flag and marks an element
//! that carries an attribute list or a continued value.

#[derive(Debug, Clone, Copy, PartialOrd, PartialEq, Eq)]
pub(crate) enum BinXmlRawToken {
    EndOfStream,
    OpenStartElement { has_attributes: bool },
    CloseStartElement,
    CloseEmptyElement,
    CloseElement,
    Value,
    Attribute { more_attributes_expected: bool },
    CDataSection,
    CharReference,
    EntityReference,
    PITarget,
    PIData,
    TemplateInstance,
    NormalSubstitution,
    OptionalSubstitution,
    FragmentHeader,
}

impl BinXmlRawToken {
    pub(crate) fn from_u8(byte: u8) -> Option<BinXmlRawToken> {
        match byte {
            0x00 => Some(BinXmlRawToken::EndOfStream),
            // <Event>
            0x01 => Some(BinXmlRawToken::OpenStartElement {
                has_attributes: false,
            }),
            0x41 => Some(BinXmlRawToken::OpenStartElement {
                has_attributes: true,
            }),
            // Indicates end of the start tag; children follow.
            0x02 => Some(BinXmlRawToken::CloseStartElement),
            0x03 => Some(BinXmlRawToken::CloseEmptyElement),
            // </Event>
            0x04 => Some(BinXmlRawToken::CloseElement),
            0x05 | 0x45 => Some(BinXmlRawToken::Value),
            0x06 => Some(BinXmlRawToken::Attribute {
                more_attributes_expected: false,
            }),
            0x46 => Some(BinXmlRawToken::Attribute {
                more_attributes_expected: true,
            }),
            0x07 | 0x47 => Some(BinXmlRawToken::CDataSection),
            0x08 | 0x48 => Some(BinXmlRawToken::CharReference),
            0x09 | 0x49 => Some(BinXmlRawToken::EntityReference),
            0x0a => Some(BinXmlRawToken::PITarget),
            0x0b => Some(BinXmlRawToken::PIData),
            0x0c => Some(BinXmlRawToken::TemplateInstance),
            0x0d => Some(BinXmlRawToken::NormalSubstitution),
            0x0e => Some(BinXmlRawToken::OptionalSubstitution),
            0x0f => Some(BinXmlRawToken::FragmentHeader),
            _ => None,
        }
    }

    /// True for the tokens that terminate attribute or element content.
    pub(crate) fn is_break(self) -> bool {
        matches!(
            self,
            BinXmlRawToken::EndOfStream
                | BinXmlRawToken::CloseStartElement
                | BinXmlRawToken::CloseEmptyElement
                | BinXmlRawToken::CloseElement
                | BinXmlRawToken::Attribute { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn more_data_flag_variants() {
        assert_eq!(
            BinXmlRawToken::from_u8(0x41),
            Some(BinXmlRawToken::OpenStartElement {
                has_attributes: true
            })
        );
        assert_eq!(
            BinXmlRawToken::from_u8(0x46),
            Some(BinXmlRawToken::Attribute {
                more_attributes_expected: true
            })
        );
        assert_eq!(BinXmlRawToken::from_u8(0x45), Some(BinXmlRawToken::Value));
        assert_eq!(BinXmlRawToken::from_u8(0x10), None);
    }
}
