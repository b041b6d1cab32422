//! Cursors used to encode and decode control PDU fields in sequence.

use crate::codec::{Decode, Encode, Error};

/// Tracks the write position in a PDU buffer.
pub struct WriteCursor<'d> {
    pos: usize,
    data: &'d mut [u8],
}

impl<'d> WriteCursor<'d> {
    pub fn new(data: &'d mut [u8]) -> Self {
        Self { pos: 0, data }
    }

    pub fn write<E: Encode>(&mut self, field: E) -> Result<(), Error> {
        self.write_ref(&field)
    }

    pub fn write_ref<E: Encode>(&mut self, field: &E) -> Result<(), Error> {
        let end = self.pos + field.size();
        let dest = self.data.get_mut(self.pos..end).ok_or(Error::InsufficientSpace)?;
        field.encode(dest)?;
        self.pos = end;
        Ok(())
    }

    /// Bytes left in the buffer.
    pub fn available(&self) -> usize {
        self.data.len() - self.pos
    }
}

/// Tracks the read position in a received PDU.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReadCursor<'d> {
    pos: usize,
    data: &'d [u8],
}

impl<'d> ReadCursor<'d> {
    pub fn new(data: &'d [u8]) -> Self {
        Self { pos: 0, data }
    }

    pub fn read<T: Decode<'d>>(&mut self) -> Result<T, Error> {
        let field = T::decode(&self.data[self.pos..])?;
        self.pos += field.size();
        Ok(field)
    }

    /// Bytes not read yet.
    pub fn available(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Fails unless every byte has been consumed.
    pub fn finish(self) -> Result<(), Error> {
        if self.available() == 0 {
            Ok(())
        } else {
            Err(Error::InvalidValue)
        }
    }
}
