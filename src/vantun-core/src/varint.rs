//! HTTP/3 variable-length integers (RFC 9000 §16).
//!
//! The top two bits of the first byte select the encoded length (00→1, 01→2,
//! 10→4, 11→8 bytes); the remaining bits carry the value big-endian. The
//! encoder always emits the shortest legal form.

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

/// Largest encodable value (2^62 - 1).
pub const MAX_VARINT: u64 = (1 << 62) - 1;

/// Append the shortest varint encoding of `value` to `buf`.
///
/// Fails with a codec error for values of 2^62 and above.
pub fn write_varint<B: BufMut>(buf: &mut B, value: u64) -> Result<()> {
    if value <= 0x3f {
        buf.put_u8(value as u8);
    } else if value <= 0x3fff {
        buf.put_u16(0x4000 | value as u16);
    } else if value <= 0x3fff_ffff {
        buf.put_u32(0x8000_0000 | value as u32);
    } else if value <= MAX_VARINT {
        buf.put_u64(0xc000_0000_0000_0000 | value);
    } else {
        return Err(Error::Codec(format!(
            "value too large for varint encoding: {value}"
        )));
    }
    Ok(())
}

/// Decode one varint from the front of `buf`, consuming its bytes.
///
/// Fails with a codec error when the buffer ends before the form completes.
pub fn read_varint<B: Buf>(buf: &mut B) -> Result<u64> {
    if buf.remaining() == 0 {
        return Err(Error::Codec("truncated varint: empty input".into()));
    }
    let first = buf.get_u8();
    let len = 1usize << (first >> 6);
    let mut value = u64::from(first & 0x3f);
    if buf.remaining() < len - 1 {
        return Err(Error::Codec(format!(
            "truncated varint: need {} more bytes, have {}",
            len - 1,
            buf.remaining()
        )));
    }
    for _ in 1..len {
        value = (value << 8) | u64::from(buf.get_u8());
    }
    Ok(value)
}

/// Number of bytes the varint encoding of `value` occupies.
pub fn varint_len(value: u64) -> usize {
    match value {
        0..=0x3f => 1,
        0x40..=0x3fff => 2,
        0x4000..=0x3fff_ffff => 4,
        _ => 8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_boundaries() {
        // Each form's low and high boundary plus the values the original
        // implementation exercised.
        let values = [
            0u64,
            1,
            14,
            63,
            64,
            16383,
            16384,
            1024,
            0x2000_0000,
            1073741823,
            1073741824,
            MAX_VARINT,
        ];
        for &v in &values {
            let mut buf = Vec::new();
            write_varint(&mut buf, v).unwrap();
            assert_eq!(buf.len(), varint_len(v), "length for {v}");
            let mut slice = &buf[..];
            assert_eq!(read_varint(&mut slice).unwrap(), v);
            assert!(slice.is_empty(), "all bytes consumed for {v}");
        }
    }

    #[test]
    fn minimal_form_lengths() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 63).unwrap();
        assert_eq!(buf.len(), 1);
        buf.clear();
        write_varint(&mut buf, 64).unwrap();
        assert_eq!(buf.len(), 2);
        buf.clear();
        write_varint(&mut buf, 16384).unwrap();
        assert_eq!(buf.len(), 4);
        buf.clear();
        write_varint(&mut buf, 0x4000_0000).unwrap();
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn rejects_out_of_range() {
        let mut buf = Vec::new();
        assert!(write_varint(&mut buf, 1 << 62).is_err());
        assert!(write_varint(&mut buf, u64::MAX).is_err());
    }

    #[test]
    fn truncated_input_fails() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 16384).unwrap();
        for cut in 0..buf.len() {
            let mut slice = &buf[..cut];
            assert!(read_varint(&mut slice).is_err(), "cut at {cut}");
        }
    }
}
