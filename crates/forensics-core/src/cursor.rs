//! Bounds-checked little/big-endian reads over a borrowed byte slice.
//!
//! Every read checks the remaining length before touching the buffer and
//! advances the position only on success. Nothing wraps or clamps.

use serde::{Deserialize, Serialize};

use crate::error::CursorError;

/// Byte order of a multi-byte field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endian {
    #[serde(rename = "LE")]
    Little,
    #[serde(rename = "BE")]
    Big,
}

impl Endian {
    pub fn tag(self) -> &'static str {
        match self {
            Self::Little => "LE",
            Self::Big => "BE",
        }
    }
}

impl std::fmt::Display for Endian {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Width of the length prefix in front of a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthWidth {
    U32,
    U64,
}

#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn at(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    /// Take `n` bytes. The length check happens before any offset arithmetic.
    pub fn read_bytes(&mut self, n: u64) -> Result<&'a [u8], CursorError> {
        let oob = || CursorError::OutOfBounds {
            offset: self.pos,
            requested: n,
            available: self.buf.len(),
        };
        if n > self.remaining() as u64 {
            return Err(oob());
        }
        // n <= remaining <= usize::MAX, so the cast and the add cannot overflow.
        let n = n as usize;
        let out = self.buf.get(self.pos..self.pos + n).ok_or_else(oob)?;
        self.pos += n;
        Ok(out)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CursorError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N as u64)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, CursorError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u32(&mut self, endian: Endian) -> Result<u32, CursorError> {
        let b = self.read_array::<4>()?;
        Ok(match endian {
            Endian::Little => u32::from_le_bytes(b),
            Endian::Big => u32::from_be_bytes(b),
        })
    }

    pub fn read_i32(&mut self, endian: Endian) -> Result<i32, CursorError> {
        let b = self.read_array::<4>()?;
        Ok(match endian {
            Endian::Little => i32::from_le_bytes(b),
            Endian::Big => i32::from_be_bytes(b),
        })
    }

    pub fn read_u64(&mut self, endian: Endian) -> Result<u64, CursorError> {
        let b = self.read_array::<8>()?;
        Ok(match endian {
            Endian::Little => u64::from_le_bytes(b),
            Endian::Big => u64::from_be_bytes(b),
        })
    }

    pub fn read_i64(&mut self, endian: Endian) -> Result<i64, CursorError> {
        let b = self.read_array::<8>()?;
        Ok(match endian {
            Endian::Little => i64::from_le_bytes(b),
            Endian::Big => i64::from_be_bytes(b),
        })
    }

    /// Read a count/length of the given width, widened to `u64`.
    pub fn read_len(&mut self, width: LengthWidth, endian: Endian) -> Result<u64, CursorError> {
        match width {
            LengthWidth::U32 => self.read_u32(endian).map(u64::from),
            LengthWidth::U64 => self.read_u64(endian),
        }
    }

    /// Read a length-prefixed byte string. UTF-8 validation is left to the caller.
    pub fn read_length_prefixed(
        &mut self,
        width: LengthWidth,
        endian: Endian,
    ) -> Result<&'a [u8], CursorError> {
        let start = self.pos;
        let len = self.read_len(width, endian)?;
        match self.read_bytes(len) {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                self.pos = start;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_both_endians() {
        let data = [0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01];
        let mut c = ByteCursor::new(&data);
        assert_eq!(c.read_u32(Endian::Little).unwrap(), 1);
        assert_eq!(c.read_u32(Endian::Big).unwrap(), 1);
        assert_eq!(c.remaining(), 0);
    }

    #[test]
    fn out_of_bounds_does_not_advance() {
        let data = [1u8, 2, 3];
        let mut c = ByteCursor::new(&data);
        let err = c.read_u32(Endian::Little).unwrap_err();
        assert_eq!(
            err,
            CursorError::OutOfBounds {
                offset: 0,
                requested: 4,
                available: 3
            }
        );
        assert_eq!(c.position(), 0);
        assert_eq!(c.read_u8().unwrap(), 1);
    }

    #[test]
    fn huge_length_prefix_is_rejected() {
        let mut data = u64::MAX.to_le_bytes().to_vec();
        data.extend_from_slice(b"abc");
        let mut c = ByteCursor::new(&data);
        assert!(c.read_length_prefixed(LengthWidth::U64, Endian::Little).is_err());
        assert_eq!(c.position(), 0);
    }

    #[test]
    fn u32_prefixed_string() {
        let mut data = 3u32.to_be_bytes().to_vec();
        data.extend_from_slice(b"abcz");
        let mut c = ByteCursor::new(&data);
        let s = c.read_length_prefixed(LengthWidth::U32, Endian::Big).unwrap();
        assert_eq!(s, b"abc");
        assert_eq!(c.position(), 7);
    }

    #[test]
    fn cursor_at_past_end_reports_oob() {
        let data = [0u8; 4];
        let mut c = ByteCursor::at(&data, 10);
        assert_eq!(c.remaining(), 0);
        assert!(c.read_u8().is_err());
        assert!(c.read_bytes(0).is_err());
    }

    proptest::proptest! {
        #[test]
        fn reads_never_panic(data in proptest::collection::vec(0u8..=255, 0..64), n in 0u64..u64::MAX) {
            let mut c = ByteCursor::new(&data);
            let _ = c.read_bytes(n);
            let _ = c.read_length_prefixed(LengthWidth::U64, Endian::Big);
            let _ = c.read_i64(Endian::Little);
            proptest::prop_assert!(c.position() <= data.len());
        }
    }
}
