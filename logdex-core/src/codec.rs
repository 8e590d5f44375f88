//! Logical key spaces.
//!
//! Every store in this crate is opened as `heed::Database<Bytes, Bytes>` —
//! the cursor engine deals in raw bytes and leaves decoding to the
//! per-store callbacks it is handed. The functions here are the
//! encode/decode half of that boundary, expressed as plain functions
//! rather than `BytesEncode`/`BytesDecode` impls since the engine's
//! decode callbacks are closures, not heed codecs.

use crate::error::{Error, Result};

/// A 64-bit unsigned document identifier.
pub type DocId = u64;

/// Encodes a `DocId` as the canonical 16-hex-digit lowercase key, whose
/// lexicographic order equals numeric order.
pub fn encode_did(did: DocId) -> [u8; 16] {
    let mut buf = [0u8; 16];
    const HEX: &[u8; 16] = b"0123456789abcdef";
    for i in 0..16 {
        let shift = (15 - i) * 4;
        let nibble = ((did >> shift) & 0xf) as usize;
        buf[i] = HEX[nibble];
    }
    buf
}

pub fn decode_did(bytes: &[u8]) -> Result<DocId> {
    if bytes.len() != 16 {
        return Err(Error::msg(format!("invalid did key length {}", bytes.len())));
    }
    let s = std::str::from_utf8(bytes).map_err(|e| Error::wrap("did key is not utf8", e))?;
    u64::from_str_radix(s, 16).map_err(|e| Error::wrap("did key is not hex", e))
}

/// Encodes a word-space key `(field, term, did)` as a length-prefixed
/// concatenation: `u16 field_len | field | u16 term_len | term |
/// did(16 hex)`. Length-prefixing (rather than a separator byte) means
/// field/term bytes may contain any byte value, including the bytes that
/// would otherwise need escaping.
pub fn encode_word_key(field: &str, term: &[u8], did: DocId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + field.len() + 2 + term.len() + 16);
    buf.extend_from_slice(&(field.len() as u16).to_be_bytes());
    buf.extend_from_slice(field.as_bytes());
    buf.extend_from_slice(&(term.len() as u16).to_be_bytes());
    buf.extend_from_slice(term);
    buf.extend_from_slice(&encode_did(did));
    buf
}

pub struct WordKey<'a> {
    pub field: &'a str,
    pub term: &'a [u8],
    pub did: DocId,
}

pub fn decode_word_key(bytes: &[u8]) -> Result<WordKey<'_>> {
    let (field, term, rest) = decode_word_meta_key_parts(bytes)?;
    let did = decode_did(rest)?;
    Ok(WordKey { field, term, did })
}

/// Encodes a word-metadata key `(field, term)` — the same prefix as
/// [`encode_word_key`] without the trailing `did`, so that a `RANGE` scan
/// over `(field, term_prefix)` on the word store and a `Range` lookup on
/// the word-metadata store share a common prefix shape.
pub fn encode_word_meta_key(field: &str, term: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + field.len() + 2 + term.len());
    buf.extend_from_slice(&(field.len() as u16).to_be_bytes());
    buf.extend_from_slice(field.as_bytes());
    buf.extend_from_slice(&(term.len() as u16).to_be_bytes());
    buf.extend_from_slice(term);
    buf
}

/// The length-prefixed `field` component alone — the common prefix of every
/// word and word-metadata key under that field, used to scan a whole field.
pub fn encode_field_prefix(field: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + field.len());
    buf.extend_from_slice(&(field.len() as u16).to_be_bytes());
    buf.extend_from_slice(field.as_bytes());
    buf
}

pub struct WordMetaKey<'a> {
    pub field: &'a str,
    pub term: &'a [u8],
}

pub fn decode_word_meta_key(bytes: &[u8]) -> Result<WordMetaKey<'_>> {
    let (field, term, rest) = decode_word_meta_key_parts(bytes)?;
    if !rest.is_empty() {
        return Err(Error::msg("trailing bytes after word-metadata key"));
    }
    Ok(WordMetaKey { field, term })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn did_encoding_preserves_numeric_order() {
        let low = encode_did(1);
        let high = encode_did(2);
        assert!(low.as_slice() < high.as_slice());
        assert_eq!(decode_did(&low).unwrap(), 1);

        let boundary_low = encode_did(0xffff);
        let boundary_high = encode_did(0x10000);
        assert!(boundary_low.as_slice() < boundary_high.as_slice());
    }

    #[test]
    fn decode_did_rejects_wrong_length() {
        assert!(decode_did(b"abc").is_err());
    }

    #[test]
    fn word_key_roundtrips_and_sorts_by_field_then_term() {
        let a = encode_word_key("body", b"fail", 7);
        let decoded = decode_word_key(&a).unwrap();
        assert_eq!(decoded.field, "body");
        assert_eq!(decoded.term, b"fail");
        assert_eq!(decoded.did, 7);

        let b = encode_word_key("body", b"failover", 1);
        assert!(a < b, "shorter term with same prefix must sort first");
    }

    #[test]
    fn word_meta_key_rejects_trailing_bytes() {
        let key = encode_word_key("host", b"up", 3);
        assert!(decode_word_meta_key(&key).is_err());
    }
}

fn decode_word_meta_key_parts(bytes: &[u8]) -> Result<(&str, &[u8], &[u8])> {
    if bytes.len() < 2 {
        return Err(Error::msg("word key too short"));
    }
    let field_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    let mut rest = &bytes[2..];
    if rest.len() < field_len {
        return Err(Error::msg("word key truncated in field"));
    }
    let field_bytes = &rest[..field_len];
    rest = &rest[field_len..];
    let field = std::str::from_utf8(field_bytes).map_err(|e| Error::wrap("field name is not utf8", e))?;

    if rest.len() < 2 {
        return Err(Error::msg("word key too short for term length"));
    }
    let term_len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
    rest = &rest[2..];
    if rest.len() < term_len {
        return Err(Error::msg("word key truncated in term"));
    }
    let term = &rest[..term_len];
    rest = &rest[term_len..];
    Ok((field, term, rest))
}
