//! # Value Codec
//!
//! Fixed-size value encoding shared by [`NetworkWriter`] and [`NetworkReader`].
//!
//! Two paths exist:
//! - [`Wire`]: the closed set of primitives (`bool`, 8/16/32/64-bit integers,
//!   `f32`, `f64`), always little-endian on the wire.
//! - [`Blittable`]: any type with a fixed, padding-free layout, copied as raw
//!   bytes. The bound is checked by the compiler through the `zerocopy`
//!   derives, so a struct with padding, references or an unspecified layout
//!   cannot be used as a message or a replicated element.
//!
//! Blittable structs are copied in host byte order. Use the
//! `zerocopy::byteorder` integer types for fields that must stay
//! little-endian across hosts of different endianness.
//!
//! ## Example
//! ```rust
//! use blitnet::core::codec::Blittable;
//! use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};
//!
//! #[derive(Debug, Clone, Copy, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout)]
//! #[repr(C)]
//! struct Position {
//!     x: f32,
//!     y: f32,
//! }
//!
//! fn size_of_blittable<T: Blittable>() -> usize {
//!     T::SIZE
//! }
//!
//! assert_eq!(size_of_blittable::<Position>(), 8);
//! ```

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::core::reader::NetworkReader;
use crate::core::writer::NetworkWriter;
use crate::error::Result;

/// Length value written in place of a count when a string or sequence is absent.
pub const NULL_LENGTH: i32 = -1;

/// A value with a fixed, padding-free memory layout.
///
/// Implemented automatically for every type deriving the `zerocopy` traits
/// `FromBytes`, `IntoBytes`, `Immutable` and `KnownLayout`.
pub trait Blittable: FromBytes + IntoBytes + Immutable + KnownLayout + Copy + Send + Sync + 'static {
    /// Encoded size in bytes.
    const SIZE: usize = std::mem::size_of::<Self>();
}

impl<T> Blittable for T where
    T: FromBytes + IntoBytes + Immutable + KnownLayout + Copy + Send + Sync + 'static
{
}

/// Primitive values with an explicit little-endian encoding.
pub trait Wire: Sized {
    /// Encoded size in bytes.
    const SIZE: usize;

    fn write_to(&self, writer: &mut NetworkWriter);

    fn read_from(reader: &mut NetworkReader) -> Result<Self>;
}

macro_rules! impl_wire_le {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Wire for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                #[inline]
                fn write_to(&self, writer: &mut NetworkWriter) {
                    writer.write_bytes(&self.to_le_bytes());
                }

                #[inline]
                fn read_from(reader: &mut NetworkReader) -> Result<Self> {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    reader.read_into(&mut buf)?;
                    Ok(<$ty>::from_le_bytes(buf))
                }
            }
        )*
    };
}

impl_wire_le!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

impl Wire for bool {
    const SIZE: usize = 1;

    #[inline]
    fn write_to(&self, writer: &mut NetworkWriter) {
        writer.write(u8::from(*self));
    }

    #[inline]
    fn read_from(reader: &mut NetworkReader) -> Result<Self> {
        Ok(reader.read::<u8>()? != 0)
    }
}
