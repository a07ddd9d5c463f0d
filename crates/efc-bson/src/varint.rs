//! Variable-length unsigned integers
//!
//! Up to eight 7-bit groups, least significant first, each with the high
//! bit set when another byte follows. A ninth byte, when present, holds
//! the top eight bits whole, so every `u64` fits in at most nine bytes.

/// Longest encoding.
pub const MAX_LEN: usize = 9;

/// Append the encoding of `value` to `out`.
pub fn encode(mut value: u64, out: &mut Vec<u8>) {
    for _ in 0..MAX_LEN - 1 {
        if value < 0x80 {
            out.push(value as u8);
            return;
        }
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Encoded length of `value`.
pub fn encoded_len(value: u64) -> usize {
    let mut v = value;
    for n in 1..MAX_LEN {
        if v < 0x80 {
            return n;
        }
        v >>= 7;
    }
    MAX_LEN
}

/// Decode from the front of `bytes`: `(value, bytes used)`, or `None`
/// if `bytes` ends before the encoding does.
pub fn decode(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for i in 0..MAX_LEN - 1 {
        let b = *bytes.get(i)?;
        value |= u64::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    let last = *bytes.get(MAX_LEN - 1)?;
    Some((value | u64::from(last) << 56, MAX_LEN))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(v: u64) -> Vec<u8> {
        let mut out = Vec::new();
        encode(v, &mut out);
        out
    }

    #[test]
    fn test_known_encodings() {
        assert_eq!(enc(0), [0x00]);
        assert_eq!(enc(127), [0x7f]);
        assert_eq!(enc(128), [0x80, 0x01]);
        assert_eq!(enc(300), [0xac, 0x02]);
        assert_eq!(enc(u64::MAX).len(), MAX_LEN);
        assert_eq!(*enc(u64::MAX).last().unwrap(), 0xff);
    }

    #[test]
    fn test_boundaries() {
        for v in [0, 1, 127, 128, (1 << 56) - 1, 1 << 56, u64::MAX - 1, u64::MAX] {
            let bytes = enc(v);
            assert_eq!(bytes.len(), encoded_len(v), "len of {}", v);
            assert_eq!(decode(&bytes), Some((v, bytes.len())), "value {}", v);
        }
    }

    #[test]
    fn test_incomplete() {
        assert_eq!(decode(&[]), None);
        assert_eq!(decode(&[0x80]), None);
        assert_eq!(decode(&[0xff; 8]), None);
        // Trailing bytes are left alone
        assert_eq!(decode(&[0x05, 0xaa]), Some((5, 1)));
    }
}
