//! Heap strings
//!
//! Strings are interned byte sequences in an extended UTF-8 encoding. The
//! lead byte classifies symbols: `0x80..=0xbf` marks a symbol and `0xff` a
//! hidden symbol, neither of which can start valid UTF-8.

use std::hash::Hasher;

use rustc_hash::FxHasher;

use crate::header::string_flags;

/// Largest valid array index (`2^32 - 2`)
pub const MAX_ARRAY_INDEX: u32 = 0xffff_fffe;

/// Interned string body
#[derive(Debug, Clone)]
pub struct HString {
    bytes: Box<[u8]>,
    hash: u32,
    clen: u32,
    arridx: Option<u32>,
}

impl HString {
    /// Build a string body; the hash must come from [`hash_bytes`]
    pub fn new(bytes: &[u8], hash: u32) -> Self {
        Self {
            bytes: bytes.into(),
            hash,
            clen: char_length(bytes),
            arridx: parse_array_index(bytes),
        }
    }

    /// Raw bytes
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Byte length
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    /// Character length (continuation bytes excluded)
    #[inline]
    pub fn char_len(&self) -> u32 {
        self.clen
    }

    /// Seeded hash
    #[inline]
    pub fn hash(&self) -> u32 {
        self.hash
    }

    /// Array index value if the string is a canonical array index
    #[inline]
    pub fn array_index(&self) -> Option<u32> {
        self.arridx
    }

    /// True if every byte is ASCII
    #[inline]
    pub fn is_ascii(&self) -> bool {
        self.bytes.is_ascii()
    }

    /// Text view for strings that are valid UTF-8
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    /// Header user flags derived from the contents
    pub fn derived_flags(&self) -> u32 {
        let mut flags = 0;
        if self.is_ascii() {
            flags |= string_flags::ASCII;
        }
        if self.arridx.is_some() {
            flags |= string_flags::ARRIDX;
        }
        match self.bytes.first() {
            Some(0xff) => flags |= string_flags::SYMBOL | string_flags::HIDDEN,
            Some(0x80..=0xbf) => flags |= string_flags::SYMBOL,
            _ => {}
        }
        flags
    }
}

/// Seeded string hash used by the string table and property hash parts
pub fn hash_bytes(seed: u32, bytes: &[u8]) -> u32 {
    let mut h = FxHasher::default();
    h.write_u32(seed);
    h.write(bytes);
    h.write_usize(bytes.len());
    let v = h.finish();
    (v ^ (v >> 32)) as u32
}

/// Count characters: every byte that is not a continuation byte
pub fn char_length(bytes: &[u8]) -> u32 {
    bytes.iter().filter(|&&b| b & 0xc0 != 0x80).count() as u32
}

/// Parse a canonical array index (`"0"`, `"17"`; no leading zeros, no sign)
pub fn parse_array_index(bytes: &[u8]) -> Option<u32> {
    if bytes.is_empty() || bytes.len() > 10 {
        return None;
    }
    if bytes.len() > 1 && bytes[0] == b'0' {
        return None;
    }
    let mut v: u64 = 0;
    for &b in bytes {
        if !b.is_ascii_digit() {
            return None;
        }
        v = v * 10 + u64::from(b - b'0');
    }
    (v <= u64::from(MAX_ARRAY_INDEX)).then_some(v as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_index_parsing() {
        assert_eq!(parse_array_index(b"0"), Some(0));
        assert_eq!(parse_array_index(b"123"), Some(123));
        assert_eq!(parse_array_index(b"4294967294"), Some(MAX_ARRAY_INDEX));
        assert_eq!(parse_array_index(b"4294967295"), None);
        assert_eq!(parse_array_index(b"01"), None);
        assert_eq!(parse_array_index(b"-1"), None);
        assert_eq!(parse_array_index(b""), None);
        assert_eq!(parse_array_index(b"1e3"), None);
    }

    #[test]
    fn test_char_length() {
        assert_eq!(char_length(b"abc"), 3);
        assert_eq!(char_length("héllo".as_bytes()), 5);
        assert_eq!(char_length("日本".as_bytes()), 2);
    }

    #[test]
    fn test_symbol_flags() {
        let s = HString::new(b"\xffFinalizer", 0);
        assert!(s.derived_flags() & string_flags::HIDDEN != 0);
        assert!(s.derived_flags() & string_flags::SYMBOL != 0);

        let s = HString::new(b"\x81sym", 0);
        assert!(s.derived_flags() & string_flags::SYMBOL != 0);
        assert!(s.derived_flags() & string_flags::HIDDEN == 0);

        let s = HString::new(b"42", 0);
        assert!(s.derived_flags() & string_flags::ARRIDX != 0);
        assert!(s.derived_flags() & string_flags::ASCII != 0);
    }

    #[test]
    fn test_hash_is_seeded() {
        assert_eq!(hash_bytes(1, b"key"), hash_bytes(1, b"key"));
        assert_ne!(hash_bytes(1, b"key"), hash_bytes(2, b"key"));
    }
}
