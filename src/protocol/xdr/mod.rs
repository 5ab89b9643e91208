//! XDR (RFC 4506) encoding used by the client for RPC headers and the
//! handful of NFSv4 operations the session layer issues or answers itself.
//!
//! The encoding of ordinary file operations is not done here: callers hand
//! the [`Request`](crate::client::Request) an opaque argument buffer and get
//! an opaque result buffer back. Only the bootstrap operations
//! (SETCLIENTID, SETCLIENTID_CONFIRM, RENEW) and the callback program
//! (CB_GETATTR, CB_RECALL) are modelled as Rust types.
//!
//! Where appropriate, XDR types map onto Rust types: `unsigned int` is
//! `u32`, `unsigned hyper` is `u64`, `opaque<>` is `Vec<u8>`, fixed
//! `opaque[n]` is `[u8; n]`.

use std::io::{Read, Write};

use byteorder::BigEndian;
use byteorder::{ReadBytesExt, WriteBytesExt};
use num_traits::ToPrimitive;

pub mod nfs4;
pub mod rpc;
mod utils;

pub use utils::invalid_data;

/// XDR assumes big endian encoding.
pub type XDREndian = BigEndian;

pub trait Serialize {
    /// Serializes the implementing type to the provided writer.
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()>;
}

pub trait Deserialize {
    /// Deserializes data from the provided reader into `self`.
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()>;
}

/// Deserialization based on the [Default] trait of the type T.
pub fn deserialize<T>(src: &mut impl Read) -> std::io::Result<T>
where
    T: Deserialize + Default,
{
    let mut val = T::default();
    val.deserialize(src)?;

    Ok(val)
}

/// Serializes `value` into a freshly allocated buffer.
pub fn to_bytes<T: Serialize + ?Sized>(value: &T) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    value.serialize(&mut buf)?;
    Ok(buf)
}

/// XDR `bool` is an enum `{ FALSE = 0, TRUE = 1 }`, i.e. an `i32` on the wire.
impl Serialize for bool {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        dest.write_i32::<XDREndian>(if *self { 1 } else { 0 })
    }
}

impl Deserialize for bool {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        match src.read_i32::<XDREndian>()? {
            0 => *self = false,
            1 => *self = true,
            _ => return Err(invalid_data("Invalid value for bool enum")),
        }
        Ok(())
    }
}

impl Serialize for i32 {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        dest.write_i32::<XDREndian>(*self)
    }
}

impl Deserialize for i32 {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        *self = src.read_i32::<XDREndian>()?;
        Ok(())
    }
}

impl Serialize for u32 {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        dest.write_u32::<XDREndian>(*self)
    }
}

impl Deserialize for u32 {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        *self = src.read_u32::<XDREndian>()?;
        Ok(())
    }
}

impl Serialize for u64 {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        dest.write_u64::<XDREndian>(*self)
    }
}

impl Deserialize for u64 {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        *self = src.read_u64::<XDREndian>()?;
        Ok(())
    }
}

/// Fixed-length opaque data, `opaque identifier[n]`.
impl<const N: usize> Serialize for [u8; N] {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        dest.write_all(self)?;
        utils::write_padding(N, dest)
    }
}

impl<const N: usize> Deserialize for [u8; N] {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        src.read_exact(self)?;
        utils::read_padding(N, src)
    }
}

/// Lengths are `u32` on the wire; a `usize` that does not fit is refused.
fn write_len<W: Write>(len: usize, dest: &mut W) -> std::io::Result<()> {
    let Some(len) = len.to_u32() else {
        return Err(invalid_data("cannot cast `usize` to `u32`"));
    };
    len.serialize(dest)
}

/// Variable-length opaque data, `opaque identifier<>`.
impl Serialize for [u8] {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        write_len(self.len(), dest)?;
        dest.write_all(self)?;
        utils::write_padding(self.len(), dest)
    }
}

impl Serialize for Vec<u8> {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        self.as_slice().serialize(dest)
    }
}

impl Deserialize for Vec<u8> {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        let length = deserialize::<u32>(src)? as usize;
        self.clear();
        // Read through `take` so a bogus length cannot force a huge allocation.
        let read = (&mut *src).take(length as u64).read_to_end(self)?;
        if read != length {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "opaque data shorter than its length",
            ));
        }
        utils::read_padding(length, src)
    }
}

impl Serialize for str {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        self.as_bytes().serialize(dest)
    }
}

impl Serialize for String {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        self.as_str().serialize(dest)
    }
}

impl Deserialize for String {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        let bytes = deserialize::<Vec<u8>>(src)?;
        *self = String::from_utf8(bytes).map_err(|_| invalid_data("Not UTF-8 string"))?;
        Ok(())
    }
}

/// Variable-length arrays of 32-bit words (bitmaps, gid lists).
impl Serialize for Vec<u32> {
    fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        write_len(self.len(), dest)?;
        for word in self {
            word.serialize(dest)?;
        }
        Ok(())
    }
}

impl Deserialize for Vec<u32> {
    fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
        let length = deserialize::<u32>(src)? as usize;
        self.clear();
        for _ in 0..length {
            self.push(deserialize::<u32>(src)?);
        }
        Ok(())
    }
}

/// Implements [`Serialize`] for a struct by serializing each field in order.
#[macro_export]
macro_rules! SerializeStruct {
    (
        $t:ident,
        $($element:ident),*
    ) => {
        impl Serialize for $t {
            fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
                $(self.$element.serialize(dest)?;)*
                Ok(())
            }
        }
    };
}

/// Implements [`Deserialize`] for a struct by deserializing each field in order.
#[macro_export]
macro_rules! DeserializeStruct {
    (
        $t:ident,
        $($element:ident),*
    ) => {
        impl Deserialize for $t {
            fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
                $(self.$element.deserialize(src)?;)*
                Ok(())
            }
        }
    };
}

/// Implements [`Serialize`] for a C-like enum deriving `ToPrimitive`.
/// Enumerations have the same representation as signed integers.
#[macro_export]
macro_rules! SerializeEnum {
    ($t:ident) => {
        impl Serialize for $t {
            fn serialize<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
                match num_traits::ToPrimitive::to_i32(self) {
                    Some(val) => val.serialize(dest),
                    None => Err($crate::protocol::xdr::invalid_data("Invalid enum value")),
                }
            }
        }
    };
}

/// Implements [`Deserialize`] for a C-like enum deriving `FromPrimitive`.
#[macro_export]
macro_rules! DeserializeEnum {
    ($t:ident) => {
        impl Deserialize for $t {
            fn deserialize<R: Read>(&mut self, src: &mut R) -> std::io::Result<()> {
                let val = $crate::protocol::xdr::deserialize::<i32>(src)?;
                match num_traits::FromPrimitive::from_i32(val) {
                    Some(val) => {
                        *self = val;
                        Ok(())
                    }
                    None => Err($crate::protocol::xdr::invalid_data("Invalid enum value")),
                }
            }
        }
    };
}

// Re-export the macros next to the traits they implement.
pub use crate::DeserializeEnum;
pub use crate::DeserializeStruct;
pub use crate::SerializeEnum;
pub use crate::SerializeStruct;
