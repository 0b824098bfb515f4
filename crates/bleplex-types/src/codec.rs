//! Fixed-width numeric extraction from raw attribute values.
//!
//! GATT values are little-endian on the wire. Every conversion checks the
//! buffer length first and reports [`ParseError::InsufficientBytes`] instead
//! of panicking on short input. Extra trailing bytes are ignored.
//!
//! ```
//! use bleplex_types::codec::{FromLeBytes, to_f32};
//!
//! assert_eq!(to_f32(&[0x00, 0x00, 0x48, 0x41]), Ok(12.5));
//! assert_eq!(u16::from_le_slice(&[0x34, 0x12]), Ok(0x1234));
//! assert!(u32::from_le_slice(&[0x01]).is_err());
//! ```

use bytes::Buf;

use crate::error::{ParseError, ParseResult};

/// A value that can be decoded from the start of a little-endian byte buffer.
pub trait FromLeBytes: Sized {
    /// Number of bytes the value occupies.
    const WIDTH: usize;

    /// Decode from `buf`, which is known to hold at least [`Self::WIDTH`] bytes.
    fn get_le(buf: &mut &[u8]) -> Self;

    /// Decode the value at the start of `data`.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InsufficientBytes`] when `data` is shorter than
    /// [`Self::WIDTH`].
    fn from_le_slice(data: &[u8]) -> ParseResult<Self> {
        if data.len() < Self::WIDTH {
            return Err(ParseError::insufficient(Self::WIDTH, data.len()));
        }
        let mut buf = data;
        Ok(Self::get_le(&mut buf))
    }
}

macro_rules! impl_from_le_bytes {
    ($($ty:ty => $get:ident),* $(,)?) => {
        $(
            impl FromLeBytes for $ty {
                const WIDTH: usize = std::mem::size_of::<$ty>();

                fn get_le(buf: &mut &[u8]) -> Self {
                    buf.$get()
                }
            }
        )*
    };
}

impl_from_le_bytes! {
    u8 => get_u8,
    i8 => get_i8,
    u16 => get_u16_le,
    i16 => get_i16_le,
    u32 => get_u32_le,
    i32 => get_i32_le,
    u64 => get_u64_le,
    i64 => get_i64_le,
    f32 => get_f32_le,
    f64 => get_f64_le,
}

impl FromLeBytes for bool {
    const WIDTH: usize = 1;

    fn get_le(buf: &mut &[u8]) -> Self {
        buf.get_u8() != 0
    }
}

/// Decode a `u8`.
pub fn to_u8(data: &[u8]) -> ParseResult<u8> {
    u8::from_le_slice(data)
}

/// Decode a little-endian `u16`.
pub fn to_u16(data: &[u8]) -> ParseResult<u16> {
    u16::from_le_slice(data)
}

/// Decode a little-endian `i16`.
pub fn to_i16(data: &[u8]) -> ParseResult<i16> {
    i16::from_le_slice(data)
}

/// Decode a little-endian `u32`.
pub fn to_u32(data: &[u8]) -> ParseResult<u32> {
    u32::from_le_slice(data)
}

/// Decode a little-endian `i32`.
pub fn to_i32(data: &[u8]) -> ParseResult<i32> {
    i32::from_le_slice(data)
}

/// Decode a little-endian `u64`.
pub fn to_u64(data: &[u8]) -> ParseResult<u64> {
    u64::from_le_slice(data)
}

/// Decode a little-endian IEEE-754 `f32`.
pub fn to_f32(data: &[u8]) -> ParseResult<f32> {
    f32::from_le_slice(data)
}

/// Decode a little-endian IEEE-754 `f64`.
pub fn to_f64(data: &[u8]) -> ParseResult<f64> {
    f64::from_le_slice(data)
}

/// Decode a UTF-8 string value, dropping trailing NUL padding.
///
/// Device name and revision characteristics are often padded with zeros.
pub fn to_utf8(data: &[u8]) -> ParseResult<String> {
    let end = data.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    std::str::from_utf8(&data[..end])
        .map(str::to_owned)
        .map_err(|e| ParseError::InvalidValue(format!("not valid UTF-8: {}", e)))
}

/// Sequential reader over a value holding several packed fields.
///
/// ```
/// use bleplex_types::codec::ValueReader;
///
/// let mut reader = ValueReader::new(&[0x2C, 0x01, 0x55]);
/// assert_eq!(reader.read::<u16>(), Ok(300));
/// assert_eq!(reader.read::<u8>(), Ok(0x55));
/// assert!(reader.read::<u8>().is_err());
/// ```
#[derive(Debug, Clone)]
pub struct ValueReader<'a> {
    buf: &'a [u8],
}

impl<'a> ValueReader<'a> {
    /// Create a reader positioned at the first byte.
    pub fn new(data: &'a [u8]) -> Self {
        Self { buf: data }
    }

    /// Decode the next field and advance past it.
    ///
    /// On error the reader does not advance.
    pub fn read<T: FromLeBytes>(&mut self) -> ParseResult<T> {
        if self.buf.remaining() < T::WIDTH {
            return Err(ParseError::insufficient(T::WIDTH, self.buf.remaining()));
        }
        Ok(T::get_le(&mut self.buf))
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }
}
