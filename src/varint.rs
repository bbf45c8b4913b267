//! Mumble's variable-length integer encoding.
//!
//! The voice channel stores session ids, frame counters and the Opus frame
//! header in this format. The prefix byte selects the width:
//!
//! | Prefix     | Encoding                                |
//! |------------|-----------------------------------------|
//! | `0xxxxxxx` | 7-bit value                             |
//! | `10xxxxxx` | 14-bit value, one extra byte            |
//! | `110xxxxx` | 21-bit value, two extra bytes           |
//! | `1110xxxx` | 28-bit value, three extra bytes         |
//! | `111100__` | 32-bit value in the next four bytes     |
//! | `111101__` | 64-bit value in the next eight bytes    |
//! | `111110__` | negated value follows as another varint |
//! | `111111xx` | inverted 2-bit value (-1 to -4)         |

use byteorder::BigEndian;
use byteorder::ReadBytesExt;
use bytes::BufMut;
use std::io;
use std::io::Read;

/// Extends [Read] with a method to read Mumble varints.
pub trait ReadExt: Read {
    /// Reads one varint, interpreting negative values as their 64-bit
    /// two's complement bit pattern.
    fn read_varint(&mut self) -> io::Result<u64> {
        let b0 = self.read_u8()?;
        Ok(match b0 {
            0x00..=0x7f => u64::from(b0),
            0x80..=0xbf => (u64::from(b0 & 0x3f) << 8) | u64::from(self.read_u8()?),
            0xc0..=0xdf => (u64::from(b0 & 0x1f) << 16) | u64::from(self.read_u16::<BigEndian>()?),
            0xe0..=0xef => {
                (u64::from(b0 & 0x0f) << 24)
                    | (u64::from(self.read_u8()?) << 16)
                    | u64::from(self.read_u16::<BigEndian>()?)
            }
            0xf0..=0xf3 => u64::from(self.read_u32::<BigEndian>()?),
            0xf4..=0xf7 => self.read_u64::<BigEndian>()?,
            0xf8..=0xfb => self.read_varint()?.wrapping_neg(),
            _ => !u64::from(b0 & 0x03),
        })
    }
}

impl<R: Read + ?Sized> ReadExt for R {}

/// Extends [BufMut] with a method to write Mumble varints.
pub trait BufMutExt: BufMut {
    /// Writes one varint using the shortest available encoding.
    fn put_varint(&mut self, value: u64)
    where
        Self: Sized,
    {
        if value >= !0x03 {
            // -1 to -4, inverted 2-bit form
            self.put_u8(0xfc | (!value as u8 & 0x03));
        } else if value > 0xffffffff_ffffff00 {
            // small negative, negated recursive form
            self.put_u8(0xf8);
            self.put_varint(value.wrapping_neg());
        } else if value < 0x80 {
            self.put_u8(value as u8);
        } else if value < 0x4000 {
            self.put_u8(0x80 | (value >> 8) as u8);
            self.put_u8(value as u8);
        } else if value < 0x20_0000 {
            self.put_u8(0xc0 | (value >> 16) as u8);
            self.put_u16((value & 0xffff) as u16);
        } else if value < 0x1000_0000 {
            self.put_u8(0xe0 | (value >> 24) as u8);
            self.put_u8((value >> 16) as u8);
            self.put_u16((value & 0xffff) as u16);
        } else if value <= 0xffff_ffff {
            self.put_u8(0xf0);
            self.put_u32(value as u32);
        } else {
            self.put_u8(0xf4);
            self.put_u64(value);
        }
    }
}

impl<B: BufMut> BufMutExt for B {}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::BytesMut;
    use std::io::Cursor;

    fn roundtrip(value: u64) -> usize {
        let mut buf = BytesMut::new();
        buf.put_varint(value);
        let len = buf.len();
        let read = Cursor::new(&buf[..]).read_varint().unwrap();
        assert_eq!(value, read, "value 0x{:x}", value);
        len
    }

    #[test]
    fn shortest_encoding_is_used() {
        assert_eq!(roundtrip(0), 1);
        assert_eq!(roundtrip(0x7f), 1);
        assert_eq!(roundtrip(0x80), 2);
        assert_eq!(roundtrip(0x3fff), 2);
        assert_eq!(roundtrip(0x4000), 3);
        assert_eq!(roundtrip(0x1f_ffff), 3);
        assert_eq!(roundtrip(0x20_0000), 4);
        assert_eq!(roundtrip(0xfff_ffff), 4);
        assert_eq!(roundtrip(0x1000_0000), 5);
        assert_eq!(roundtrip(0xffff_ffff), 5);
        assert_eq!(roundtrip(0x1_0000_0000), 9);
        assert_eq!(roundtrip(u64::MAX / 2), 9);
    }

    #[test]
    fn negative_values() {
        // -1 to -4 fit in a single byte
        assert_eq!(roundtrip((-1i64) as u64), 1);
        assert_eq!(roundtrip((-4i64) as u64), 1);
        // small negatives use the recursive form
        assert_eq!(roundtrip((-5i64) as u64), 2);
        assert_eq!(roundtrip((-200i64) as u64), 3);
    }

    #[test]
    fn truncated_input_is_an_error() {
        for src in [&[0x80u8][..], &[0xc0, 0x01][..], &[0xf0, 0, 0, 0][..]] {
            assert!(Cursor::new(src).read_varint().is_err());
        }
    }

    #[test]
    fn known_encodings() {
        let mut buf = BytesMut::new();
        buf.put_varint(0x1234);
        assert_eq!(&buf[..], &[0x80 | 0x12, 0x34]);

        buf.clear();
        buf.put_varint(0xabcd_1234);
        assert_eq!(&buf[..], &[0xf0, 0xab, 0xcd, 0x12, 0x34]);
    }
}
