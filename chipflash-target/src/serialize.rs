//! Serde helpers that render addresses and ranges as hex strings in
//! human-readable formats (YAML), and as raw integers otherwise.

use serde::{self, ser::SerializeStruct, Serialize, Serializer};
use std::ops::Range;

/// Constrains hex serialization to unsigned integers, generically.
pub trait SerializeUnsignedInt {
    /// Serializes the value as an integer, not a hex string.
    fn serialize_int<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer;
}

impl SerializeUnsignedInt for u8 {
    fn serialize_int<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(*self)
    }
}

impl SerializeUnsignedInt for u32 {
    fn serialize_int<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u32(*self)
    }
}

impl SerializeUnsignedInt for u64 {
    fn serialize_int<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(*self)
    }
}

pub(crate) fn hex_u_int<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: std::fmt::LowerHex + SerializeUnsignedInt,
{
    if serializer.is_human_readable() {
        serializer.serialize_str(format!("{value:#x}").as_str())
    } else {
        value.serialize_int(serializer)
    }
}

pub(crate) fn hex_option<T, S>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
    T: Serialize + std::fmt::LowerHex + SerializeUnsignedInt,
{
    match value {
        Some(value) => {
            if serializer.is_human_readable() {
                serializer.serialize_some(format!("{value:#x}").as_str())
            } else {
                serializer.serialize_some(value)
            }
        }
        None => serializer.serialize_none(),
    }
}

pub(crate) fn hex_range<S>(range: &Range<u64>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let human_readable = serializer.is_human_readable();
    let mut state = serializer.serialize_struct("Range", 2)?;
    if human_readable {
        state.serialize_field("start", format!("{:#x}", range.start).as_str())?;
        state.serialize_field("end", format!("{:#x}", range.end).as_str())?;
    } else {
        state.serialize_field("start", &range.start)?;
        state.serialize_field("end", &range.end)?;
    }
    state.end()
}
