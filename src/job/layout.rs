//! Typed block header layouts
//!
//! A [`HeaderLayout`] names every field of a family's fixed-size header and
//! its byte span. Layouts are validated once when the family is selected;
//! afterwards patching a header copy is a bounds-checked slice copy.

use crate::{Error, Result};
use std::fmt;

/// Header fields that jobs fill in or shares patch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeaderField {
    Version,
    PrevHash,
    MerkleRoot,
    /// Extra commitment root (Equihash family), fixed at template time
    CommitmentRoot,
    Time,
    Bits,
    Nonce,
}

impl fmt::Display for HeaderField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HeaderField::Version => "version",
            HeaderField::PrevHash => "prev_hash",
            HeaderField::MerkleRoot => "merkle_root",
            HeaderField::CommitmentRoot => "commitment_root",
            HeaderField::Time => "time",
            HeaderField::Bits => "bits",
            HeaderField::Nonce => "nonce",
        };
        f.write_str(name)
    }
}

/// Byte span of one field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpan {
    pub offset: usize,
    pub len: usize,
}

impl FieldSpan {
    pub const fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Field table for one header format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLayout {
    pub len: usize,
    pub fields: &'static [(HeaderField, FieldSpan)],
}

/// 80-byte Bitcoin header
pub const BITCOIN_HEADER: HeaderLayout = HeaderLayout {
    len: 80,
    fields: &[
        (HeaderField::Version, FieldSpan::new(0, 4)),
        (HeaderField::PrevHash, FieldSpan::new(4, 32)),
        (HeaderField::MerkleRoot, FieldSpan::new(36, 32)),
        (HeaderField::Time, FieldSpan::new(68, 4)),
        (HeaderField::Bits, FieldSpan::new(72, 4)),
        (HeaderField::Nonce, FieldSpan::new(76, 4)),
    ],
};

/// 140-byte Equihash header (solution follows separately)
pub const EQUIHASH_HEADER: HeaderLayout = HeaderLayout {
    len: 140,
    fields: &[
        (HeaderField::Version, FieldSpan::new(0, 4)),
        (HeaderField::PrevHash, FieldSpan::new(4, 32)),
        (HeaderField::MerkleRoot, FieldSpan::new(36, 32)),
        (HeaderField::CommitmentRoot, FieldSpan::new(68, 32)),
        (HeaderField::Time, FieldSpan::new(100, 4)),
        (HeaderField::Bits, FieldSpan::new(104, 4)),
        (HeaderField::Nonce, FieldSpan::new(108, 32)),
    ],
};

impl HeaderLayout {
    /// Check every span is in bounds and no two overlap
    pub fn validate(&self) -> Result<()> {
        let mut spans: Vec<(HeaderField, FieldSpan)> = self.fields.to_vec();
        spans.sort_by_key(|(_, span)| span.offset);

        let mut cursor = 0;
        for (field, span) in spans {
            if span.len == 0 {
                return Err(Error::encoding(format!("header field {} is empty", field)));
            }
            if span.offset < cursor {
                return Err(Error::encoding(format!(
                    "header field {} overlaps the previous field",
                    field
                )));
            }
            if span.end() > self.len {
                return Err(Error::encoding(format!(
                    "header field {} ends at {} past header length {}",
                    field,
                    span.end(),
                    self.len
                )));
            }
            cursor = span.end();
        }

        for (i, (field, _)) in self.fields.iter().enumerate() {
            if self.fields[..i].iter().any(|(other, _)| other == field) {
                return Err(Error::encoding(format!("header field {} listed twice", field)));
            }
        }
        Ok(())
    }

    pub fn span(&self, field: HeaderField) -> Option<FieldSpan> {
        self.fields
            .iter()
            .find(|(f, _)| *f == field)
            .map(|(_, span)| *span)
    }

    /// A zeroed header of this layout
    pub fn blank(&self) -> Vec<u8> {
        vec![0u8; self.len]
    }

    /// Overwrite `field` in `header` with `value`
    pub fn patch(&self, header: &mut [u8], field: HeaderField, value: &[u8]) -> Result<()> {
        if header.len() != self.len {
            return Err(Error::encoding(format!(
                "header is {} bytes, layout expects {}",
                header.len(),
                self.len
            )));
        }
        let span = self
            .span(field)
            .ok_or_else(|| Error::encoding(format!("layout has no {} field", field)))?;
        if value.len() != span.len {
            return Err(Error::encoding(format!(
                "{} takes {} bytes, got {}",
                field,
                span.len,
                value.len()
            )));
        }
        header[span.offset..span.end()].copy_from_slice(value);
        Ok(())
    }

    /// Borrow `field` out of `header`
    pub fn read<'a>(&self, header: &'a [u8], field: HeaderField) -> Result<&'a [u8]> {
        let span = self
            .span(field)
            .ok_or_else(|| Error::encoding(format!("layout has no {} field", field)))?;
        header
            .get(span.offset..span.end())
            .ok_or_else(|| Error::encoding(format!("header too short for {}", field)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_layouts_are_valid() {
        BITCOIN_HEADER.validate().unwrap();
        EQUIHASH_HEADER.validate().unwrap();
    }

    #[test]
    fn test_overlap_detected() {
        const BROKEN: HeaderLayout = HeaderLayout {
            len: 8,
            fields: &[
                (HeaderField::Version, FieldSpan::new(0, 4)),
                (HeaderField::Time, FieldSpan::new(2, 4)),
            ],
        };
        assert!(BROKEN.validate().is_err());

        const TOO_LONG: HeaderLayout = HeaderLayout {
            len: 4,
            fields: &[(HeaderField::Nonce, FieldSpan::new(0, 8))],
        };
        assert!(TOO_LONG.validate().is_err());

        const TWICE: HeaderLayout = HeaderLayout {
            len: 8,
            fields: &[
                (HeaderField::Nonce, FieldSpan::new(0, 4)),
                (HeaderField::Nonce, FieldSpan::new(4, 4)),
            ],
        };
        assert!(TWICE.validate().is_err());
    }

    #[test]
    fn test_patch_and_read() {
        let mut header = BITCOIN_HEADER.blank();
        BITCOIN_HEADER
            .patch(&mut header, HeaderField::Nonce, &[1, 2, 3, 4])
            .unwrap();
        assert_eq!(&header[76..80], &[1, 2, 3, 4]);
        assert_eq!(
            BITCOIN_HEADER.read(&header, HeaderField::Nonce).unwrap(),
            &[1, 2, 3, 4]
        );
    }

    #[test]
    fn test_patch_rejects_bad_input() {
        let mut header = BITCOIN_HEADER.blank();
        assert!(BITCOIN_HEADER
            .patch(&mut header, HeaderField::Nonce, &[1, 2, 3])
            .is_err());
        assert!(BITCOIN_HEADER
            .patch(&mut header, HeaderField::CommitmentRoot, &[0; 32])
            .is_err());
        let mut short = vec![0u8; 10];
        assert!(BITCOIN_HEADER
            .patch(&mut short, HeaderField::Version, &[0; 4])
            .is_err());
    }
}
