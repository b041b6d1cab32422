use bt_hci::param::ConnHandle;

use crate::codec::{Decode, Encode, Error, FixedSize};
use crate::cursor::{ReadCursor, WriteCursor};

/// Security vectors contributed by one side of a CS security start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SecurityVectors {
    /// Initialization vector half.
    pub iv: [u8; 8],
    /// Instantiation nonce half.
    pub nonce: [u8; 4],
    /// Personalization vector half.
    pub personalization: [u8; 8],
}

impl FixedSize for SecurityVectors {
    const SIZE: usize = 20;
}

impl Encode for SecurityVectors {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        let mut w = WriteCursor::new(dest);
        w.write(self.iv)?;
        w.write(self.nonce)?;
        w.write(self.personalization)?;
        Ok(())
    }
}

impl Decode<'_> for SecurityVectors {
    fn decode(src: &[u8]) -> Result<Self, Error> {
        let mut r = ReadCursor::new(src);
        Ok(Self {
            iv: r.read()?,
            nonce: r.read()?,
            personalization: r.read()?,
        })
    }
}

/// Security context of a connection once CS security is enabled.
///
/// The central contribution occupies the least significant half of every vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SecurityContext {
    pub cs_iv: [u8; 16],
    pub cs_in: [u8; 8],
    pub cs_pv: [u8; 16],
}

impl SecurityContext {
    pub fn combine(central: &SecurityVectors, peripheral: &SecurityVectors) -> Self {
        fn join<const H: usize, const N: usize>(low: &[u8; H], high: &[u8; H]) -> [u8; N] {
            let mut out = [0; N];
            out[..H].copy_from_slice(low);
            out[H..].copy_from_slice(high);
            out
        }
        Self {
            cs_iv: join(&central.iv, &peripheral.iv),
            cs_in: join(&central.nonce, &peripheral.nonce),
            cs_pv: join(&central.personalization, &peripheral.personalization),
        }
    }
}

/// Source of the random security vectors used to start CS security.
pub trait SecurityModule {
    /// Generate this side's contribution for the given connection.
    fn generate_security_vectors(&self, handle: ConnHandle) -> Result<SecurityVectors, crate::Error>;
}

impl<T: SecurityModule + ?Sized> SecurityModule for &T {
    fn generate_security_vectors(&self, handle: ConnHandle) -> Result<SecurityVectors, crate::Error> {
        T::generate_security_vectors(self, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_orders_central_first() {
        let central = SecurityVectors {
            iv: [1; 8],
            nonce: [2; 4],
            personalization: [3; 8],
        };
        let peripheral = SecurityVectors {
            iv: [4; 8],
            nonce: [5; 4],
            personalization: [6; 8],
        };
        let ctx = SecurityContext::combine(&central, &peripheral);
        assert_eq!(&ctx.cs_iv[..8], &[1; 8]);
        assert_eq!(&ctx.cs_iv[8..], &[4; 8]);
        assert_eq!(ctx.cs_in, [2, 2, 2, 2, 5, 5, 5, 5]);
        assert_eq!(&ctx.cs_pv[8..], &[6; 8]);
    }
}
