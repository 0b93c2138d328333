use std::{ffi::OsStr, fmt, mem, os::unix::prelude::*};
use zerocopy::FromBytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DecodeError {
    UnexpectedEof,
    MissingNulCharacter,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => f.write_str("request argument is truncated"),
            Self::MissingNulCharacter => f.write_str("name is not NUL-terminated"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// A cursor over the argument part of a kernel request.
pub(crate) struct Decoder<'a> {
    bytes: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub(crate) fn remaining(&self) -> &'a [u8] {
        self.bytes
    }

    pub(crate) fn fetch_bytes(&mut self, count: usize) -> Result<&'a [u8], DecodeError> {
        if self.bytes.len() < count {
            return Err(DecodeError::UnexpectedEof);
        }

        let (bytes, remaining) = self.bytes.split_at(count);
        self.bytes = remaining;

        Ok(bytes)
    }

    /// Fetch a value of Plain-Old-Data (POD) type.
    ///
    /// The argument buffer has no alignment guarantee past the header, so
    /// the value is copied out rather than borrowed.
    pub(crate) fn fetch<T>(&mut self) -> Result<T, DecodeError>
    where
        T: FromBytes,
    {
        let bytes = self.fetch_bytes(mem::size_of::<T>())?;
        T::read_from_bytes(bytes).map_err(|_| DecodeError::UnexpectedEof)
    }

    /// Fetch a zero-terminated OS string by reference, without the terminator.
    pub(crate) fn fetch_str(&mut self) -> Result<&'a OsStr, DecodeError> {
        let len = self
            .bytes
            .iter()
            .position(|&b| b == b'\0')
            .ok_or(DecodeError::MissingNulCharacter)?;
        let bytes = self.fetch_bytes(len + 1)?;
        Ok(OsStr::from_bytes(&bytes[..len]))
    }
}
