//! Binary codec shared by every persistent structure of the vault: file
//! header, registry directory, free map and log records.
//!
//! Integers are fixed-width little-endian. Byte strings and UTF-8 strings
//! carry a `u32` length prefix; fixed arrays (magics, digests) do not.
//! Word vectors carry a `u32` element count. Decoders cap every length they
//! read, so a damaged prefix fails with [`EncodingError::LengthOverflow`]
//! instead of allocating.


use thiserror::Error;

/// Longest byte string or `String` a decoder accepts (256 MiB).
pub const MAX_BYTE_LEN: u32 = 256 * 1024 * 1024;

/// Largest element count [`decode_vec`] accepts.
pub const MAX_VEC_ELEMENTS: u32 = 16 * 1024 * 1024;

/// Codec failures.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// Input ended inside a value.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof { needed: usize, available: usize },

    /// Unknown discriminant, magic or version.
    #[error("invalid tag {tag} for {type_name}")]
    InvalidTag { tag: u32, type_name: &'static str },

    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// Length prefix above its cap, or a length too long for `u32`.
    #[error("length overflow: {0}")]
    LengthOverflow(String),
}

/// Appends a deterministic byte form of `self`. Checksums are taken over
/// these bytes, so equal values must encode identically.
pub trait Encode {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError>;
}

/// Reads one value from the front of `buf`, returning it with the number of
/// bytes consumed.
pub trait Decode: Sized {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError>;
}

/// Narrows a length to its `u32` prefix.
pub(crate) fn len_to_u32(len: usize) -> Result<u32, EncodingError> {
    u32::try_from(len)
        .map_err(|_| EncodingError::LengthOverflow(format!("{len} does not fit a u32")))
}

fn head<const N: usize>(buf: &[u8]) -> Result<[u8; N], EncodingError> {
    buf.get(..N)
        .and_then(|bytes| <[u8; N]>::try_from(bytes).ok())
        .ok_or(EncodingError::UnexpectedEof {
            needed: N,
            available: buf.len(),
        })
}

fn capped_len(buf: &[u8], cap: u32, what: &str) -> Result<usize, EncodingError> {
    let len = u32::from_le_bytes(head::<4>(buf)?);
    if len > cap {
        return Err(EncodingError::LengthOverflow(format!("{what} {len} above limit {cap}")));
    }
    Ok(len as usize)
}

macro_rules! le_int {
    ($($ty:ty),*) => {$(
        impl Encode for $ty {
            fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
                buf.extend_from_slice(&self.to_le_bytes());
                Ok(())
            }
        }

        impl Decode for $ty {
            fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
                const N: usize = std::mem::size_of::<$ty>();
                Ok((<$ty>::from_le_bytes(head::<N>(buf)?), N))
            }
        }
    )*};
}

le_int!(u8, u32, u64);

impl<const N: usize> Encode for [u8; N] {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl<const N: usize> Decode for [u8; N] {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        Ok((head::<N>(buf)?, N))
    }
}

impl Encode for [u8] {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        len_to_u32(self.len())?.encode_to(buf)?;
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl Decode for Vec<u8> {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let len = capped_len(buf, MAX_BYTE_LEN, "byte string")?;
        let body = &buf[4..];
        let bytes = body.get(..len).ok_or(EncodingError::UnexpectedEof {
            needed: len,
            available: body.len(),
        })?;
        Ok((bytes.to_vec(), 4 + len))
    }
}

impl Encode for str {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.as_bytes().encode_to(buf)
    }
}

impl Decode for String {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (raw, consumed) = Vec::<u8>::decode_from(buf)?;
        Ok((String::from_utf8(raw)?, consumed))
    }
}

/// Writes `[u32 count][item]...`.
pub fn encode_vec<T: Encode>(items: &[T], buf: &mut Vec<u8>) -> Result<(), EncodingError> {
    len_to_u32(items.len())?.encode_to(buf)?;
    items.iter().try_for_each(|item| item.encode_to(buf))
}

/// Reads `[u32 count][item]...`, refusing counts above [`MAX_VEC_ELEMENTS`].
pub fn decode_vec<T: Decode>(buf: &[u8]) -> Result<(Vec<T>, usize), EncodingError> {
    let count = capped_len(buf, MAX_VEC_ELEMENTS, "element count")?;
    let mut offset = 4;
    let mut items = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        let (item, n) = T::decode_from(&buf[offset..])?;
        offset += n;
        items.push(item);
    }
    Ok((items, offset))
}
