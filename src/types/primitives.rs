use crate::codec::{Decode, Encode, Error, FixedSize};

//
// Implementations for primitives
//
impl FixedSize for u8 {
    const SIZE: usize = 1;
}

impl FixedSize for i8 {
    const SIZE: usize = 1;
}

impl FixedSize for u16 {
    const SIZE: usize = 2;
}

impl FixedSize for u32 {
    const SIZE: usize = 4;
}

impl<const N: usize> FixedSize for [u8; N] {
    const SIZE: usize = N;
}

impl Decode<'_> for u8 {
    fn decode(src: &[u8]) -> Result<Self, Error> {
        src.first().copied().ok_or(Error::InsufficientSpace)
    }
}

impl Decode<'_> for i8 {
    fn decode(src: &[u8]) -> Result<Self, Error> {
        u8::decode(src).map(|v| v as i8)
    }
}

impl Decode<'_> for u16 {
    fn decode(src: &[u8]) -> Result<Self, Error> {
        <[u8; 2]>::decode(src).map(u16::from_le_bytes)
    }
}

impl Decode<'_> for u32 {
    fn decode(src: &[u8]) -> Result<Self, Error> {
        <[u8; 4]>::decode(src).map(u32::from_le_bytes)
    }
}

impl<const N: usize> Decode<'_> for [u8; N] {
    fn decode(src: &[u8]) -> Result<Self, Error> {
        src.get(..N)
            .and_then(|s| <[u8; N]>::try_from(s).ok())
            .ok_or(Error::InsufficientSpace)
    }
}

impl Encode for u8 {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        *dest.first_mut().ok_or(Error::InsufficientSpace)? = *self;
        Ok(())
    }
}

impl Encode for i8 {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        (*self as u8).encode(dest)
    }
}

impl Encode for u16 {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        self.to_le_bytes().encode(dest)
    }
}

impl Encode for u32 {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        self.to_le_bytes().encode(dest)
    }
}

impl<const N: usize> Encode for [u8; N] {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        dest.get_mut(..N)
            .ok_or(Error::InsufficientSpace)?
            .copy_from_slice(&self[..]);
        Ok(())
    }
}
