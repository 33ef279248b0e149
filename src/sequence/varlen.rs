//! 7-bit variable-length integers
//!
//! Wait times, program numbers and note lengths are stored as MSB-first
//! groups of 7 bits; the high bit of each byte marks a continuation. The
//! format caps encodings at 4 bytes (28 value bits).

use super::wire::{WireReader, WireWriter};
use crate::Result;

/// Maximum number of bytes in an encoded value
pub const VARLEN_MAX_BYTES: usize = 4;

/// Read a variable-length value, consuming at most [`VARLEN_MAX_BYTES`]
pub fn read_varlen(r: &mut WireReader) -> Result<u32> {
    let mut temp = r.read_u8()? as u32;
    let mut val = temp & 0x7F;
    let mut bytes_read = 1;
    while (temp & 0x80) != 0 && bytes_read < VARLEN_MAX_BYTES {
        val <<= 7;
        temp = r.read_u8()? as u32;
        bytes_read += 1;
        val |= temp & 0x7F;
    }
    Ok(val)
}

/// Write `val` as a variable-length value; zero encodes as a single byte
pub fn write_varlen(w: &mut WireWriter, val: u32) {
    let mut groups = [0u8; VARLEN_MAX_BYTES + 1];
    let mut count = 0;
    let mut v = val;
    while v > 0 {
        groups[count] = (v & 0x7F) as u8;
        v >>= 7;
        count += 1;
    }
    if count == 0 {
        count = 1;
    }
    // Groups were collected least-significant first; emit them MSB-first
    // with continuation bits on everything but the last.
    for i in (0..count).rev() {
        let mut b = groups[i];
        if i != 0 {
            b |= 0x80;
        }
        w.write_u8(b);
    }
}

/// Size in bytes of the encoding of `val`
pub fn varlen_size(val: u32) -> usize {
    let mut count = 1;
    let mut v = val >> 7;
    while v > 0 {
        count += 1;
        v >>= 7;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::wire::ByteOrder;

    fn round_trip(val: u32) -> (u32, usize) {
        let mut w = WireWriter::new(ByteOrder::LittleEndian);
        write_varlen(&mut w, val);
        let bytes = w.into_bytes();
        let len = bytes.len();
        let mut r = WireReader::new(&bytes, ByteOrder::LittleEndian);
        (read_varlen(&mut r).unwrap(), len)
    }

    #[test]
    fn test_round_trip_boundaries() {
        for val in [0u32, 127, 128, 16383, 0x0FFF_FFFF] {
            let (decoded, len) = round_trip(val);
            assert_eq!(decoded, val, "round trip of {}", val);
            assert_eq!(len, varlen_size(val), "size of {}", val);
        }
    }

    #[test]
    fn test_zero_is_single_byte() {
        let mut w = WireWriter::new(ByteOrder::LittleEndian);
        write_varlen(&mut w, 0);
        assert_eq!(w.into_bytes(), vec![0x00]);
    }

    #[test]
    fn test_known_encodings() {
        let mut w = WireWriter::new(ByteOrder::LittleEndian);
        write_varlen(&mut w, 128);
        assert_eq!(w.into_bytes(), vec![0x81, 0x00]);

        let mut w = WireWriter::new(ByteOrder::LittleEndian);
        write_varlen(&mut w, 16383);
        assert_eq!(w.into_bytes(), vec![0xFF, 0x7F]);
    }

    #[test]
    fn test_read_caps_at_four_bytes() {
        // A fifth continuation byte is left unread.
        let bytes = [0xFF, 0xFF, 0xFF, 0x7F, 0x05];
        let mut r = WireReader::new(&bytes, ByteOrder::LittleEndian);
        assert_eq!(read_varlen(&mut r).unwrap(), 0x0FFF_FFFF);
        assert_eq!(r.position(), 4);
    }
}
