//! Segment codec: segments to DNS names and back
//!
//! Upstream segments ride in the query name, downstream segments in the
//! CNAME target. Both use the same layout:
//!
//! ```text
//! <base32hex labels, 63 chars max each>.<proxy-prefix>.<suffix-domain>
//! ```
//!
//! The binary segment is encoded with lowercase base32hex without padding,
//! which survives resolvers that randomize or fold the case of names.

use crate::segment::{Segment, SEGMENT_HEADER_LEN};
use data_encoding::BASE32HEX_NOPAD;
use thiserror::Error;

/// Maximum DNS label length (RFC 1035)
pub const MAX_DNS_LABEL_LEN: usize = 63;

/// Maximum DNS name length in presentation form (RFC 1035)
pub const MAX_DNS_NAME_LEN: usize = 253;

/// Characters of a name left after reserving room for separators and the prefix label
const SEG_LEN_HEADROOM: usize = 250;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Encoded name too long: {0} characters (max: {1})")]
    NameTooLong(usize, usize),

    #[error("Invalid suffix domain: {0}")]
    InvalidDomain(String),

    #[error("Invalid proxy prefix: {0:?}")]
    InvalidPrefix(char),
}

/// Maximum binary segment bytes carried by one DNS name under `suffix_domain`
///
/// `floor(max(0, (250 - len) * 0.60))`; zero means the domain is too long to
/// carry a tunnel at all.
pub fn optimal_seg_len(suffix_domain: &str) -> usize {
    let headroom = SEG_LEN_HEADROOM.saturating_sub(suffix_domain.len());
    headroom * 3 / 5
}

/// Decode a segment from a DNS name whose last `expected_label_count`
/// labels are the proxy prefix and suffix domain
///
/// Never fails: anything that does not decode cleanly comes back as a
/// segment with `MALFORMED` set.
pub fn decode_segment(expected_label_count: usize, name: &str) -> Segment {
    let Some(encoded) = data_text(expected_label_count, name) else {
        return Segment::malformed();
    };

    match BASE32HEX_NOPAD.decode(encoded.as_bytes()) {
        Ok(bytes) => Segment::from_bytes(&bytes),
        Err(_) => Segment::malformed(),
    }
}

/// Uppercased base32 text of the data labels, if they are well formed
fn data_text(expected_label_count: usize, name: &str) -> Option<String> {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() || name.len() > MAX_DNS_NAME_LEN {
        return None;
    }

    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() <= expected_label_count {
        return None;
    }

    let data_labels = &labels[..labels.len() - expected_label_count];
    let mut encoded = String::with_capacity(name.len());
    for label in data_labels {
        if label.is_empty()
            || label.len() > MAX_DNS_LABEL_LEN
            || !label.bytes().all(|b| b.is_ascii_alphanumeric())
        {
            return None;
        }
        encoded.push_str(&label.to_ascii_uppercase());
    }
    Some(encoded)
}

/// Encoder/decoder bound to one proxy prefix and suffix domain
#[derive(Debug, Clone)]
pub struct SegmentCodec {
    prefix: String,
    suffix: String,
    trailing_labels: usize,
}

impl SegmentCodec {
    /// Create a codec for `<data>.<prefix>.<suffix_domain>` names
    pub fn new(prefix: char, suffix_domain: &str) -> Result<Self, CodecError> {
        if !prefix.is_ascii_alphanumeric() {
            return Err(CodecError::InvalidPrefix(prefix));
        }

        let suffix = suffix_domain
            .trim_start_matches('.')
            .trim_end_matches('.')
            .to_ascii_lowercase();
        if suffix.is_empty() {
            return Err(CodecError::InvalidDomain("empty".into()));
        }
        for label in suffix.split('.') {
            if label.is_empty() || label.len() > MAX_DNS_LABEL_LEN {
                return Err(CodecError::InvalidDomain(suffix_domain.to_string()));
            }
            if !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
                return Err(CodecError::InvalidDomain(suffix_domain.to_string()));
            }
        }

        let trailing_labels = suffix.split('.').count() + 1;
        Ok(Self {
            prefix: prefix.to_ascii_lowercase().to_string(),
            suffix,
            trailing_labels,
        })
    }

    pub fn suffix_domain(&self) -> &str {
        &self.suffix
    }

    pub fn proxy_prefix(&self) -> &str {
        &self.prefix
    }

    /// Labels that follow the encoded data: the prefix plus the suffix domain
    pub fn expected_label_count(&self) -> usize {
        self.trailing_labels
    }

    /// Binary segment budget for this suffix domain
    pub fn optimal_seg_len(&self) -> usize {
        optimal_seg_len(&self.suffix)
    }

    /// Largest payload a single segment may carry
    pub fn payload_capacity(&self) -> usize {
        self.optimal_seg_len().saturating_sub(SEGMENT_HEADER_LEN)
    }

    /// Encode a segment into a DNS name (no trailing dot)
    pub fn encode(&self, segment: &Segment) -> Result<String, CodecError> {
        let text = BASE32HEX_NOPAD
            .encode(&segment.to_bytes())
            .to_ascii_lowercase();

        let labels: Vec<&str> = text
            .as_bytes()
            .chunks(MAX_DNS_LABEL_LEN)
            .filter_map(|chunk| std::str::from_utf8(chunk).ok())
            .collect();

        let name = format!("{}.{}.{}", labels.join("."), self.prefix, self.suffix);
        if name.len() > MAX_DNS_NAME_LEN {
            return Err(CodecError::NameTooLong(name.len(), MAX_DNS_NAME_LEN));
        }
        Ok(name)
    }

    /// Decode a query name or CNAME target produced by [`SegmentCodec::encode`]
    pub fn decode(&self, name: &str) -> Segment {
        if !self.owns(name) {
            return Segment::malformed();
        }
        decode_segment(self.trailing_labels, name)
    }

    /// Connection id a name claims to belong to, without checking integrity
    ///
    /// Lets a responder answer a corrupted query on the right connection.
    pub fn peek_id(&self, name: &str) -> Option<u16> {
        if !self.owns(name) {
            return None;
        }
        let encoded = data_text(self.trailing_labels, name)?;
        let head = BASE32HEX_NOPAD.decode(encoded.get(..4)?.as_bytes()).ok()?;
        Some(u16::from_be_bytes([*head.first()?, *head.get(1)?]))
    }

    /// Whether `name` lives under `<prefix>.<suffix>` with at least one data label
    pub fn owns(&self, name: &str) -> bool {
        let name = name.strip_suffix('.').unwrap_or(name);
        let tail_len = self.prefix.len() + 1 + self.suffix.len();
        if name.len() < tail_len + 2 {
            return false;
        }

        let split = name.len() - tail_len;
        let (Some(head), Some(tail)) = (name.get(..split), name.get(split..)) else {
            return false;
        };
        let Some((prefix, suffix)) = tail.split_once('.') else {
            return false;
        };
        head.ends_with('.')
            && prefix.eq_ignore_ascii_case(&self.prefix)
            && suffix.eq_ignore_ascii_case(&self.suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Flags;
    use bytes::Bytes;

    fn codec() -> SegmentCodec {
        SegmentCodec::new('t', "example.com").unwrap()
    }

    #[test]
    fn test_optimal_seg_len_known_values() {
        assert_eq!(optimal_seg_len("example.com"), 143);
        assert_eq!(optimal_seg_len(""), 150);
        assert_eq!(optimal_seg_len(&"a".repeat(245)), 3);
        assert_eq!(optimal_seg_len(&"a".repeat(250)), 0);
        assert_eq!(optimal_seg_len(&"a".repeat(300)), 0);
    }

    #[test]
    fn test_optimal_seg_len_matches_formula() {
        for len in 0..=250usize {
            let domain = "d".repeat(len);
            let expected = (((250 - len) as f64) * 0.60 + 1e-9).floor() as usize;
            assert_eq!(optimal_seg_len(&domain), expected, "len {}", len);
        }
    }

    #[test]
    fn test_encode_decode_query() {
        let codec = codec();
        let seg = Segment::new(9, Flags::ACK, 100, 200, Bytes::from_static(b"Hello, tunnel!"));

        let name = codec.encode(&seg).unwrap();
        assert!(name.ends_with(".t.example.com"));
        assert!(name.len() <= MAX_DNS_NAME_LEN);

        assert_eq!(codec.decode(&name), seg);
        assert_eq!(codec.decode(&format!("{}.", name)), seg);
    }

    #[test]
    fn test_decode_is_case_insensitive() {
        let codec = codec();
        let seg = Segment::new(1, Flags::SYN, 0, 0, Bytes::new());
        let name = codec.encode(&seg).unwrap().to_ascii_uppercase();
        assert_eq!(codec.decode(&name), seg);
    }

    #[test]
    fn test_full_capacity_segment_fits() {
        for len in [1usize, 11, 40, 100, 180, 220] {
            let labels: Vec<String> = (0..len.div_ceil(20))
                .map(|_| "a".repeat(19))
                .collect();
            let mut domain = labels.join(".");
            domain.truncate(len);
            let domain = domain.trim_end_matches('.').to_string();
            let Ok(codec) = SegmentCodec::new('p', &domain) else {
                continue;
            };
            let capacity = codec.payload_capacity();
            let seg = Segment::new(
                u16::MAX,
                Flags::ACK | Flags::FIN,
                u32::MAX,
                u32::MAX,
                Bytes::from(vec![0xff; capacity]),
            );
            let name = codec.encode(&seg).unwrap();
            assert!(name.len() <= MAX_DNS_NAME_LEN, "domain len {}", domain.len());
            assert_eq!(codec.decode(&name), seg);
        }
    }

    #[test]
    fn test_example_com_capacity() {
        let codec = codec();
        assert_eq!(codec.optimal_seg_len(), 143);
        assert_eq!(codec.payload_capacity(), 143 - SEGMENT_HEADER_LEN);
        assert_eq!(codec.expected_label_count(), 3);
    }

    #[test]
    fn test_decode_garbage_is_malformed() {
        let inputs = [
            "",
            ".",
            "t.example.com",
            "example.com",
            "!!!.t.example.com",
            "zzzzzzzz.t.example.com",
            "a..b.t.example.com",
            "00.t.example.com",
            "ünïcødé.t.example.com",
            "abc.x.example.com",
        ];
        let codec = codec();
        for input in inputs {
            assert!(codec.decode(input).is_malformed(), "input {:?}", input);
            assert!(decode_segment(3, input).is_malformed(), "input {:?}", input);
        }
    }

    #[test]
    fn test_decode_flipped_character_is_malformed() {
        let codec = codec();
        let seg = Segment::new(5, Flags::ACK, 1, 2, Bytes::from_static(b"payload"));
        let name = codec.encode(&seg).unwrap();

        let mut bytes = name.into_bytes();
        bytes[4] = if bytes[4] == b'0' { b'1' } else { b'0' };
        let corrupted = String::from_utf8(bytes).unwrap();
        assert!(codec.decode(&corrupted).is_malformed());
    }

    #[test]
    fn test_wrong_label_count_is_malformed() {
        let codec = codec();
        let seg = Segment::new(5, Flags::ACK, 1, 2, Bytes::new());
        let name = codec.encode(&seg).unwrap();
        assert!(decode_segment(2, &name).is_malformed());
        assert!(decode_segment(10, &name).is_malformed());
    }

    #[test]
    fn test_peek_id_survives_corruption() {
        let codec = codec();
        let seg = Segment::new(0xbeef, Flags::ACK, 1, 2, Bytes::from_static(b"payload"));
        let name = codec.encode(&seg).unwrap();
        assert_eq!(codec.peek_id(&name), Some(0xbeef));

        let mut bytes = name.into_bytes();
        let last = bytes.iter().position(|&b| b == b'.').unwrap() - 1;
        bytes[last] = if bytes[last] == b'0' { b'1' } else { b'0' };
        let corrupted = String::from_utf8(bytes).unwrap();
        assert!(codec.decode(&corrupted).is_malformed());
        assert_eq!(codec.peek_id(&corrupted), Some(0xbeef));

        assert_eq!(codec.peek_id("a.t.example.com"), None);
        assert_eq!(codec.peek_id("abcd.x.example.com"), None);
    }

    #[test]
    fn test_owns() {
        let codec = codec();
        assert!(codec.owns("abc.t.example.com"));
        assert!(codec.owns("ABC.T.EXAMPLE.COM."));
        assert!(!codec.owns("t.example.com"));
        assert!(!codec.owns("abc.u.example.com"));
        assert!(!codec.owns("abc.t.example.org"));
        assert!(!codec.owns("abct.example.com"));
    }

    #[test]
    fn test_invalid_construction() {
        assert_eq!(
            SegmentCodec::new('.', "example.com").unwrap_err(),
            CodecError::InvalidPrefix('.')
        );
        assert!(SegmentCodec::new('t', "").is_err());
        assert!(SegmentCodec::new('t', "bad..domain").is_err());
        assert!(SegmentCodec::new('t', &"a".repeat(64)).is_err());
        assert!(SegmentCodec::new('t', ".example.com.").is_ok());
    }
}
