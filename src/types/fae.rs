use crate::codec::{Decode, Encode, Error, FixedSize};

/// Frequency actuation error table.
///
/// One signed entry per CS channel, in units of 0.5 ppm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FaeTable([i8; FaeTable::LEN]);

impl FaeTable {
    pub const LEN: usize = 72;

    pub const ZERO: FaeTable = FaeTable([0; Self::LEN]);

    pub const fn new(entries: [i8; Self::LEN]) -> Self {
        Self(entries)
    }

    pub fn entries(&self) -> &[i8; Self::LEN] {
        &self.0
    }

    /// Entry for a CS channel index.
    pub fn get(&self, channel: usize) -> Option<i8> {
        self.0.get(channel).copied()
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|e| *e == 0)
    }
}

impl Default for FaeTable {
    fn default() -> Self {
        Self::ZERO
    }
}

impl FixedSize for FaeTable {
    const SIZE: usize = Self::LEN;
}

impl Encode for FaeTable {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        let dest = dest.get_mut(..Self::LEN).ok_or(Error::InsufficientSpace)?;
        for (d, e) in dest.iter_mut().zip(self.0.iter()) {
            *d = *e as u8;
        }
        Ok(())
    }
}

impl Decode<'_> for FaeTable {
    fn decode(src: &[u8]) -> Result<Self, Error> {
        let src = src.get(..Self::LEN).ok_or(Error::InsufficientSpace)?;
        let mut entries = [0; Self::LEN];
        for (e, s) in entries.iter_mut().zip(src.iter()) {
            *e = *s as i8;
        }
        Ok(Self(entries))
    }
}
