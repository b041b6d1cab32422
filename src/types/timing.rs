//! Inter-step timing negotiation.
//!
//! Capability bitmaps select from the optional values below; bit `n` enables entry `n`.

use super::capabilities::CsCapabilities;
use crate::codec::{Decode, Encode, Error, FixedSize};
use crate::cursor::{ReadCursor, WriteCursor};

/// Optional T_IP1 and T_IP2 values in microseconds.
pub const T_IP_VALUES: [u8; 7] = [10, 20, 30, 40, 50, 60, 80];
pub const T_IP_MANDATORY: u8 = 145;

/// Optional T_FCS values in microseconds.
pub const T_FCS_VALUES: [u8; 9] = [15, 20, 30, 40, 50, 60, 80, 100, 120];
pub const T_FCS_MANDATORY: u8 = 150;

/// Optional T_PM values in microseconds.
pub const T_PM_VALUES: [u8; 2] = [10, 20];
pub const T_PM_MANDATORY: u8 = 40;

/// Allowed antenna switch times in microseconds.
pub const T_SW_VALUES: [u8; 5] = [0, 1, 2, 4, 10];

/// Timing agreed for a configuration, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timing {
    pub t_ip1: u8,
    pub t_ip2: u8,
    pub t_fcs: u8,
    pub t_pm: u8,
    pub t_sw: u8,
}

impl Timing {
    /// Timing using only mandatory values.
    pub const MANDATORY: Timing = Timing {
        t_ip1: T_IP_MANDATORY,
        t_ip2: T_IP_MANDATORY,
        t_fcs: T_FCS_MANDATORY,
        t_pm: T_PM_MANDATORY,
        t_sw: 10,
    };

    /// Pick the shortest values both sides support.
    ///
    /// Without remote capabilities only the local bitmaps are considered.
    pub fn negotiate(local: &CsCapabilities, remote: Option<&CsCapabilities>) -> Timing {
        let common = |mask: fn(&CsCapabilities) -> u16| mask(local) & remote.map(mask).unwrap_or(u16::MAX);
        Timing {
            t_ip1: shortest(common(|c| c.t_ip1), &T_IP_VALUES, T_IP_MANDATORY),
            t_ip2: shortest(common(|c| c.t_ip2), &T_IP_VALUES, T_IP_MANDATORY),
            t_fcs: shortest(common(|c| c.t_fcs), &T_FCS_VALUES, T_FCS_MANDATORY),
            t_pm: shortest(common(|c| c.t_pm), &T_PM_VALUES, T_PM_MANDATORY),
            t_sw: remote.map(|r| r.t_sw).unwrap_or(0).max(local.t_sw),
        }
    }
}

fn shortest(bitmap: u16, values: &[u8], mandatory: u8) -> u8 {
    values
        .iter()
        .enumerate()
        .find(|(bit, _)| bitmap & (1 << bit) != 0)
        .map(|(_, v)| *v)
        .unwrap_or(mandatory)
}

/// Whether `value` is one of `values` or the mandatory value.
pub(crate) fn is_allowed(value: u8, values: &[u8], mandatory: u8) -> bool {
    value == mandatory || values.contains(&value)
}

impl FixedSize for Timing {
    const SIZE: usize = 5;
}

impl Encode for Timing {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        let mut w = WriteCursor::new(dest);
        w.write(self.t_ip1)?;
        w.write(self.t_ip2)?;
        w.write(self.t_fcs)?;
        w.write(self.t_pm)?;
        w.write(self.t_sw)?;
        Ok(())
    }
}

impl Decode<'_> for Timing {
    fn decode(src: &[u8]) -> Result<Self, Error> {
        let mut r = ReadCursor::new(src);
        let timing = Timing {
            t_ip1: r.read()?,
            t_ip2: r.read()?,
            t_fcs: r.read()?,
            t_pm: r.read()?,
            t_sw: r.read()?,
        };
        if !is_allowed(timing.t_ip1, &T_IP_VALUES, T_IP_MANDATORY)
            || !is_allowed(timing.t_ip2, &T_IP_VALUES, T_IP_MANDATORY)
            || !is_allowed(timing.t_fcs, &T_FCS_VALUES, T_FCS_MANDATORY)
            || !is_allowed(timing.t_pm, &T_PM_VALUES, T_PM_MANDATORY)
            || !T_SW_VALUES.contains(&timing.t_sw)
        {
            return Err(Error::InvalidValue);
        }
        Ok(timing)
    }
}
