//! Channel Sounding capabilities and per-connection default settings.

use crate::codec::{Decode, Encode, Error, FixedSize};
use crate::cursor::{ReadCursor, WriteCursor};

/// Set of Channel Sounding roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RoleSet(u8);

impl RoleSet {
    pub const NONE: RoleSet = RoleSet(0);
    pub const INITIATOR: RoleSet = RoleSet(0x01);
    pub const REFLECTOR: RoleSet = RoleSet(0x02);
    pub const BOTH: RoleSet = RoleSet(0x03);

    pub const fn from_bits(bits: u8) -> Option<RoleSet> {
        if bits & !Self::BOTH.0 == 0 {
            Some(RoleSet(bits))
        } else {
            None
        }
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: RoleSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Role a device plays in a Channel Sounding configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CsRole {
    Initiator,
    Reflector,
}

impl CsRole {
    /// The role the peer plays when we play `self`.
    pub fn peer(self) -> CsRole {
        match self {
            CsRole::Initiator => CsRole::Reflector,
            CsRole::Reflector => CsRole::Initiator,
        }
    }
}

impl From<CsRole> for RoleSet {
    fn from(role: CsRole) -> RoleSet {
        match role {
            CsRole::Initiator => RoleSet::INITIATOR,
            CsRole::Reflector => RoleSet::REFLECTOR,
        }
    }
}

impl TryFrom<u8> for CsRole {
    type Error = Error;
    fn try_from(val: u8) -> Result<Self, Error> {
        match val {
            0x00 => Ok(CsRole::Initiator),
            0x01 => Ok(CsRole::Reflector),
            _ => Err(Error::InvalidValue),
        }
    }
}

impl From<CsRole> for u8 {
    fn from(role: CsRole) -> u8 {
        match role {
            CsRole::Initiator => 0x00,
            CsRole::Reflector => 0x01,
        }
    }
}

/// Channel Sounding capabilities of one controller.
///
/// The timing fields are bitmaps over the optional values in [`timing`](super::timing); a
/// cleared bitmap means only the mandatory value is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CsCapabilities {
    /// Number of configurations supported per connection.
    pub num_config_supported: u8,
    /// Maximum number of consecutive procedures, 0 if unbounded.
    pub max_consecutive_procedures: u16,
    pub num_antennas: u8,
    pub max_antenna_paths: u8,
    pub roles: RoleSet,
    pub mode3: bool,
    pub rtt_capability: u8,
    pub rtt_aa_only_n: u8,
    pub rtt_sounding_n: u8,
    pub rtt_random_payload_n: u8,
    pub nadm_sounding: u16,
    pub nadm_random: u16,
    pub sync_phy_2m: bool,
    pub sync_phy_2m_2bt: bool,
    /// The local controller has no frequency actuation error (its FAE table is all zeros).
    pub no_fae: bool,
    pub channel_selection_3c: bool,
    pub pbr_from_rtt_sounding: bool,
    pub t_ip1: u16,
    pub t_ip2: u16,
    pub t_fcs: u16,
    pub t_pm: u16,
    /// Antenna switch time in microseconds.
    pub t_sw: u8,
    pub tx_snr: u8,
}

impl CsCapabilities {
    const MODE3: u8 = 0x01;
    const SYNC_PHY_2M: u8 = 0x02;
    const SYNC_PHY_2M_2BT: u8 = 0x04;
    const NO_FAE: u16 = 0x0002;
    const CHANNEL_SELECTION_3C: u16 = 0x0004;
    const PBR_FROM_RTT_SOUNDING: u16 = 0x0008;

    fn modes(&self) -> u8 {
        if self.mode3 {
            Self::MODE3
        } else {
            0
        }
    }

    fn sync_phys(&self) -> u8 {
        let mut phys = 0;
        if self.sync_phy_2m {
            phys |= Self::SYNC_PHY_2M;
        }
        if self.sync_phy_2m_2bt {
            phys |= Self::SYNC_PHY_2M_2BT;
        }
        phys
    }

    fn subfeatures(&self) -> u16 {
        let mut bits = 0;
        if self.no_fae {
            bits |= Self::NO_FAE;
        }
        if self.channel_selection_3c {
            bits |= Self::CHANNEL_SELECTION_3C;
        }
        if self.pbr_from_rtt_sounding {
            bits |= Self::PBR_FROM_RTT_SOUNDING;
        }
        bits
    }
}

impl Default for CsCapabilities {
    /// A single-antenna controller supporting both roles and mode 3.
    fn default() -> Self {
        Self {
            num_config_supported: 4,
            max_consecutive_procedures: 0,
            num_antennas: 1,
            max_antenna_paths: 1,
            roles: RoleSet::BOTH,
            mode3: true,
            rtt_capability: 0,
            rtt_aa_only_n: 1,
            rtt_sounding_n: 0,
            rtt_random_payload_n: 0,
            nadm_sounding: 0,
            nadm_random: 0,
            sync_phy_2m: false,
            sync_phy_2m_2bt: false,
            no_fae: false,
            channel_selection_3c: false,
            pbr_from_rtt_sounding: false,
            t_ip1: 0x0040,
            t_ip2: 0x0040,
            t_fcs: 0x0180,
            t_pm: 0x0003,
            t_sw: 4,
            tx_snr: 0,
        }
    }
}

impl FixedSize for CsCapabilities {
    const SIZE: usize = 28;
}

impl Encode for CsCapabilities {
    fn encode(&self, dest: &mut [u8]) -> Result<(), Error> {
        let mut w = WriteCursor::new(dest);
        w.write(self.num_config_supported)?;
        w.write(self.max_consecutive_procedures)?;
        w.write(self.num_antennas)?;
        w.write(self.max_antenna_paths)?;
        w.write(self.roles.bits())?;
        w.write(self.modes())?;
        w.write(self.rtt_capability)?;
        w.write(self.rtt_aa_only_n)?;
        w.write(self.rtt_sounding_n)?;
        w.write(self.rtt_random_payload_n)?;
        w.write(self.nadm_sounding)?;
        w.write(self.nadm_random)?;
        w.write(self.sync_phys())?;
        w.write(self.subfeatures())?;
        w.write(self.t_ip1)?;
        w.write(self.t_ip2)?;
        w.write(self.t_fcs)?;
        w.write(self.t_pm)?;
        w.write(self.t_sw)?;
        w.write(self.tx_snr)?;
        Ok(())
    }
}

impl Decode<'_> for CsCapabilities {
    fn decode(src: &[u8]) -> Result<Self, Error> {
        let mut r = ReadCursor::new(src);
        let num_config_supported = r.read()?;
        let max_consecutive_procedures = r.read()?;
        let num_antennas = r.read()?;
        let max_antenna_paths = r.read()?;
        let roles = RoleSet::from_bits(r.read()?).ok_or(Error::InvalidValue)?;
        let modes: u8 = r.read()?;
        let rtt_capability = r.read()?;
        let rtt_aa_only_n = r.read()?;
        let rtt_sounding_n = r.read()?;
        let rtt_random_payload_n = r.read()?;
        let nadm_sounding = r.read()?;
        let nadm_random = r.read()?;
        let sync_phys: u8 = r.read()?;
        let subfeatures: u16 = r.read()?;
        Ok(Self {
            num_config_supported,
            max_consecutive_procedures,
            num_antennas,
            max_antenna_paths,
            roles,
            mode3: modes & Self::MODE3 != 0,
            rtt_capability,
            rtt_aa_only_n,
            rtt_sounding_n,
            rtt_random_payload_n,
            nadm_sounding,
            nadm_random,
            sync_phy_2m: sync_phys & Self::SYNC_PHY_2M != 0,
            sync_phy_2m_2bt: sync_phys & Self::SYNC_PHY_2M_2BT != 0,
            no_fae: subfeatures & Self::NO_FAE != 0,
            channel_selection_3c: subfeatures & Self::CHANNEL_SELECTION_3C != 0,
            pbr_from_rtt_sounding: subfeatures & Self::PBR_FROM_RTT_SOUNDING != 0,
            t_ip1: r.read()?,
            t_ip2: r.read()?,
            t_fcs: r.read()?,
            t_pm: r.read()?,
            t_sw: r.read()?,
            tx_snr: r.read()?,
        })
    }
}

/// CS sync antenna selection: use antennas in repetitive order.
pub const SYNC_ANTENNA_REPETITIVE: u8 = 0xFE;
/// CS sync antenna selection: no recommendation.
pub const SYNC_ANTENNA_ANY: u8 = 0xFF;

/// Host-provided default settings for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DefaultSettings {
    /// Roles the host allows on this connection.
    pub roles: RoleSet,
    /// Antenna identifier used for CS sync packets, or one of the `SYNC_ANTENNA_*` values.
    pub sync_antenna: u8,
    /// Maximum transmit power in dBm.
    pub max_tx_power: i8,
}

impl DefaultSettings {
    pub const MAX_TX_POWER_MIN: i8 = -127;
    pub const MAX_TX_POWER_MAX: i8 = 20;

    pub const fn new(roles: RoleSet) -> Self {
        Self {
            roles,
            sync_antenna: SYNC_ANTENNA_ANY,
            max_tx_power: Self::MAX_TX_POWER_MAX,
        }
    }

    /// Check these settings against the local capabilities.
    pub(crate) fn check(&self, local: &CsCapabilities) -> Result<(), crate::Error> {
        if !local.roles.contains(self.roles) {
            return Err(crate::Error::FeatureNotSupported);
        }
        match self.sync_antenna {
            SYNC_ANTENNA_REPETITIVE | SYNC_ANTENNA_ANY => {}
            1..=4 if self.sync_antenna <= local.num_antennas => {}
            _ => return Err(crate::Error::UnexpectedParameter),
        }
        if !(Self::MAX_TX_POWER_MIN..=Self::MAX_TX_POWER_MAX).contains(&self.max_tx_power) {
            return Err(crate::Error::UnexpectedParameter);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Type;

    #[test]
    fn capabilities_wire_layout() {
        let caps = CsCapabilities {
            no_fae: true,
            sync_phy_2m: true,
            ..Default::default()
        };
        let mut buf = [0; CsCapabilities::SIZE];
        unwrap!(caps.encode(&mut buf[..]));
        assert_eq!(buf[0], 4);
        assert_eq!(buf[5], 0x03);
        assert_eq!(buf[6], 0x01);
        assert_eq!(buf[15], 0x02);
        assert_eq!(&buf[16..18], &[0x02, 0x00]);
        assert_eq!(&buf[22..24], &[0x80, 0x01]);
        assert_eq!(buf[26], 4);

        let decoded = unwrap!(CsCapabilities::decode(&buf[..]));
        assert_eq!(decoded, caps);
        assert_eq!(decoded.size(), 28);
    }

    #[test]
    fn capabilities_reject_unknown_roles() {
        let mut buf = [0; CsCapabilities::SIZE];
        unwrap!(CsCapabilities::default().encode(&mut buf[..]));
        let valid = buf;
        buf[5] = 0x04;
        assert_eq!(CsCapabilities::decode(&buf[..]), Err(Error::InvalidValue));
        assert_eq!(CsCapabilities::decode(&valid[..10]), Err(Error::InsufficientSpace));
        assert!(CsCapabilities::decode(&valid[..]).is_ok());
    }

    #[test]
    fn default_settings_bounds() {
        let local = CsCapabilities {
            roles: RoleSet::INITIATOR,
            num_antennas: 2,
            ..Default::default()
        };
        assert!(DefaultSettings::new(RoleSet::INITIATOR).check(&local).is_ok());
        assert_eq!(
            DefaultSettings::new(RoleSet::BOTH).check(&local),
            Err(crate::Error::FeatureNotSupported)
        );

        let mut settings = DefaultSettings::new(RoleSet::INITIATOR);
        settings.sync_antenna = 2;
        assert!(settings.check(&local).is_ok());
        settings.sync_antenna = 3;
        assert_eq!(settings.check(&local), Err(crate::Error::UnexpectedParameter));
        settings.sync_antenna = SYNC_ANTENNA_REPETITIVE;
        settings.max_tx_power = 21;
        assert_eq!(settings.check(&local), Err(crate::Error::UnexpectedParameter));
        settings.max_tx_power = -127;
        assert!(settings.check(&local).is_ok());
    }
}
