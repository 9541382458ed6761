//! Deterministic binary body encoding.
//!
//! Layout rules:
//! - integers are little-endian, fixed width
//! - `bool` is one byte, `0` or `1`
//! - `Vec<T>` and `String` carry a `u32` element/byte count, then the elements
//! - `[u8; N]` is written raw, without a count
//! - structs are their fields in declaration order (see [`wire_struct!`])
//!
//! Every type reports its exact `encode_size` so frame buffers are sized once.

use crate::crypto::{Sha256, HASH_SIZE};
use crate::wire::{WireError, WireResult};
use bytes::{Buf, BufMut, BytesMut};

/// A type with a fixed, deterministic binary layout.
pub trait WireEncode: Sized {
    /// Exact number of bytes `encode` writes.
    fn encode_size(&self) -> usize;

    /// Append the encoding to `buf`.
    fn encode<B: BufMut>(&self, buf: &mut B);

    /// Read one value from the front of `buf`.
    fn decode<B: Buf>(buf: &mut B) -> WireResult<Self>;
}

/// Fail with `BufferUnderflow` unless `needed` bytes remain.
pub fn ensure_remaining<B: Buf>(buf: &B, needed: usize) -> WireResult<()> {
    let remaining = buf.remaining();
    if remaining < needed {
        return Err(WireError::BufferUnderflow { needed, remaining });
    }
    Ok(())
}

/// Encode a value into a buffer sized exactly for it.
pub fn encode_to_bytes<T: WireEncode>(value: &T) -> BytesMut {
    let mut buf = BytesMut::with_capacity(value.encode_size());
    value.encode(&mut buf);
    buf
}

/// Decode a value that must consume all of `body`.
pub fn decode_exact<T: WireEncode>(body: &[u8]) -> WireResult<T> {
    let mut buf = body;
    let value = T::decode(&mut buf)?;
    if !buf.is_empty() {
        return Err(WireError::Malformed(format!(
            "{} trailing bytes after body",
            buf.len()
        )));
    }
    Ok(value)
}

macro_rules! impl_wire_int {
    ($($ty:ty => $put:ident, $get:ident;)*) => {
        $(
            impl WireEncode for $ty {
                fn encode_size(&self) -> usize {
                    std::mem::size_of::<$ty>()
                }

                fn encode<B: BufMut>(&self, buf: &mut B) {
                    buf.$put(*self);
                }

                fn decode<B: Buf>(buf: &mut B) -> WireResult<Self> {
                    ensure_remaining(buf, std::mem::size_of::<$ty>())?;
                    Ok(buf.$get())
                }
            }
        )*
    };
}

impl_wire_int! {
    u8 => put_u8, get_u8;
    u16 => put_u16_le, get_u16_le;
    u32 => put_u32_le, get_u32_le;
    u64 => put_u64_le, get_u64_le;
    i32 => put_i32_le, get_i32_le;
    i64 => put_i64_le, get_i64_le;
}

impl WireEncode for bool {
    fn encode_size(&self) -> usize {
        1
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(u8::from(*self));
    }

    fn decode<B: Buf>(buf: &mut B) -> WireResult<Self> {
        match u8::decode(buf)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(WireError::Malformed(format!("invalid bool byte {}", other))),
        }
    }
}

impl<const N: usize> WireEncode for [u8; N] {
    fn encode_size(&self) -> usize {
        N
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(self);
    }

    fn decode<B: Buf>(buf: &mut B) -> WireResult<Self> {
        ensure_remaining(buf, N)?;
        let mut out = [0u8; N];
        buf.copy_to_slice(&mut out);
        Ok(out)
    }
}

// Elements are never zero-sized, so a count larger than the remaining bytes
// is an underflow and is rejected before allocating.
impl<T: WireEncode> WireEncode for Vec<T> {
    fn encode_size(&self) -> usize {
        4 + self.iter().map(WireEncode::encode_size).sum::<usize>()
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.len() as u32);
        for item in self {
            item.encode(buf);
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> WireResult<Self> {
        let count = u32::decode(buf)? as usize;
        ensure_remaining(buf, count)?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(T::decode(buf)?);
        }
        Ok(items)
    }
}

impl WireEncode for String {
    fn encode_size(&self) -> usize {
        4 + self.len()
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.len() as u32);
        buf.put_slice(self.as_bytes());
    }

    fn decode<B: Buf>(buf: &mut B) -> WireResult<Self> {
        let len = u32::decode(buf)? as usize;
        ensure_remaining(buf, len)?;
        let mut raw = vec![0u8; len];
        buf.copy_to_slice(&mut raw);
        String::from_utf8(raw).map_err(|e| WireError::Malformed(format!("invalid utf-8: {}", e)))
    }
}

impl WireEncode for Sha256 {
    fn encode_size(&self) -> usize {
        HASH_SIZE
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.0.encode(buf);
    }

    fn decode<B: Buf>(buf: &mut B) -> WireResult<Self> {
        Ok(Sha256(<[u8; HASH_SIZE]>::decode(buf)?))
    }
}

/// Implement [`WireEncode`] for a struct by encoding the listed fields in order.
///
/// ```ignore
/// wire_struct!(Ping { nonce });
/// ```
#[macro_export]
macro_rules! wire_struct {
    ($ty:ident { $($field:ident),* $(,)? }) => {
        impl $crate::wire::WireEncode for $ty {
            fn encode_size(&self) -> usize {
                0 $(+ $crate::wire::WireEncode::encode_size(&self.$field))*
            }

            #[allow(unused_variables)]
            fn encode<B: ::bytes::BufMut>(&self, buf: &mut B) {
                $($crate::wire::WireEncode::encode(&self.$field, buf);)*
            }

            #[allow(unused_variables)]
            fn decode<B: ::bytes::Buf>(buf: &mut B) -> $crate::wire::WireResult<Self> {
                Ok(Self {
                    $($field: $crate::wire::WireEncode::decode(buf)?,)*
                })
            }
        }
    };
}
