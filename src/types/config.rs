//! Channel Sounding configurations.

use super::capabilities::{CsCapabilities, CsRole, DefaultSettings};
use super::timing::Timing;
use crate::codec::{Decode, Encode, Error as CodecError, FixedSize};
use crate::cursor::{ReadCursor, WriteCursor};
use crate::Error;

/// Channel map over the 80 possible CS channels, bit `n` enabling channel `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelMap([u8; ChannelMap::LEN]);

impl ChannelMap {
    pub const LEN: usize = 10;

    /// Minimum number of channels that must remain in use.
    pub const MIN_USED_CHANNELS: u32 = 15;

    /// Channels that can never be used for Channel Sounding.
    pub const RESERVED_CHANNELS: [u8; 8] = [0, 1, 23, 24, 25, 77, 78, 79];

    /// Every channel allowed for Channel Sounding.
    pub const ALL: ChannelMap = ChannelMap([0xFC, 0xFF, 0x7F, 0xFC, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x1F]);

    pub const fn new(bits: [u8; Self::LEN]) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    pub fn is_used(&self, channel: u8) -> bool {
        let (byte, bit) = ((channel / 8) as usize, channel % 8);
        self.0.get(byte).map(|b| b & (1 << bit) != 0).unwrap_or(false)
    }

    pub fn used_channels(&self) -> u32 {
        self.0.iter().map(|b| b.count_ones()).sum()
    }

    /// Reserved channels are clear and enough channels remain.
    pub fn is_valid(&self) -> bool {
        Self::RESERVED_CHANNELS.iter().all(|c| !self.is_used(*c)) && self.used_channels() >= Self::MIN_USED_CHANNELS
    }
}

impl FixedSize for ChannelMap {
    const SIZE: usize = Self::LEN;
}

impl Encode for ChannelMap {
    fn encode(&self, dest: &mut [u8]) -> Result<(), CodecError> {
        self.0.encode(dest)
    }
}

impl Decode<'_> for ChannelMap {
    fn decode(src: &[u8]) -> Result<Self, CodecError> {
        Ok(Self(<[u8; Self::LEN]>::decode(src)?))
    }
}

/// CS step mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    /// Round-trip time.
    Rtt = 1,
    /// Phase-based ranging.
    Pbr = 2,
    /// Round-trip time and phase-based ranging.
    RttPbr = 3,
}

impl TryFrom<u8> for Mode {
    type Error = CodecError;
    fn try_from(val: u8) -> Result<Self, CodecError> {
        Ok(match val {
            1 => Self::Rtt,
            2 => Self::Pbr,
            3 => Self::RttPbr,
            _ => return Err(CodecError::InvalidValue),
        })
    }
}

/// Encoding of an absent sub mode.
const SUB_MODE_UNUSED: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RttType {
    AaOnly = 0,
    Sounding32 = 1,
    Sounding96 = 2,
    RandomPayload32 = 3,
    RandomPayload64 = 4,
    RandomPayload96 = 5,
    RandomPayload128 = 6,
}

impl RttType {
    pub fn is_sounding(self) -> bool {
        matches!(self, RttType::Sounding32 | RttType::Sounding96)
    }

    pub fn is_random(self) -> bool {
        matches!(
            self,
            RttType::RandomPayload32 | RttType::RandomPayload64 | RttType::RandomPayload96 | RttType::RandomPayload128
        )
    }
}

impl TryFrom<u8> for RttType {
    type Error = CodecError;
    fn try_from(val: u8) -> Result<Self, CodecError> {
        Ok(match val {
            0 => Self::AaOnly,
            1 => Self::Sounding32,
            2 => Self::Sounding96,
            3 => Self::RandomPayload32,
            4 => Self::RandomPayload64,
            5 => Self::RandomPayload96,
            6 => Self::RandomPayload128,
            _ => return Err(CodecError::InvalidValue),
        })
    }
}

/// PHY used for CS sync exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SyncPhy {
    Le1M = 1,
    Le2M = 2,
    Le2M2Bt = 3,
}

impl SyncPhy {
    pub(crate) fn is_supported(self, caps: &CsCapabilities) -> bool {
        match self {
            SyncPhy::Le1M => true,
            SyncPhy::Le2M => caps.sync_phy_2m,
            SyncPhy::Le2M2Bt => caps.sync_phy_2m_2bt,
        }
    }
}

impl TryFrom<u8> for SyncPhy {
    type Error = CodecError;
    fn try_from(val: u8) -> Result<Self, CodecError> {
        Ok(match val {
            1 => Self::Le1M,
            2 => Self::Le2M,
            3 => Self::Le2M2Bt,
            _ => return Err(CodecError::InvalidValue),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChannelSelection {
    Algorithm3b = 0,
    Algorithm3c = 1,
}

impl TryFrom<u8> for ChannelSelection {
    type Error = CodecError;
    fn try_from(val: u8) -> Result<Self, CodecError> {
        Ok(match val {
            0 => Self::Algorithm3b,
            1 => Self::Algorithm3c,
            _ => return Err(CodecError::InvalidValue),
        })
    }
}

/// Parameters of a CS configuration as requested by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigParams {
    /// Role of the device that owns this configuration.
    pub role: CsRole,
    pub main_mode: Mode,
    pub sub_mode: Option<Mode>,
    pub main_mode_min_steps: u8,
    pub main_mode_max_steps: u8,
    pub main_mode_repetition: u8,
    pub mode0_steps: u8,
    pub rtt_type: RttType,
    pub sync_phy: SyncPhy,
    pub channel_map: ChannelMap,
    pub channel_map_repetition: u8,
    pub channel_selection: ChannelSelection,
    pub ch3c_shape: u8,
    pub ch3c_jump: u8,
}

impl ConfigParams {
    /// These parameters as seen from the peer.
    pub fn for_peer(&self) -> Self {
        Self {
            role: self.role.peer(),
            ..*self
        }
    }

    /// Check the parameters against the capabilities of both sides.
    pub(crate) fn check(
        &self,
        local: &CsCapabilities,
        remote: Option<&CsCapabilities>,
        defaults: &DefaultSettings,
    ) -> Result<(), Error> {
        // Mode combinations
        match (self.main_mode, self.sub_mode) {
            (Mode::Rtt, None) | (Mode::Pbr, None | Some(Mode::Rtt) | Some(Mode::RttPbr)) => {}
            (Mode::RttPbr, None | Some(Mode::Pbr)) => {}
            _ => return Err(Error::UnexpectedParameter),
        }
        let uses_mode3 = self.main_mode == Mode::RttPbr || self.sub_mode == Some(Mode::RttPbr);
        if uses_mode3 && !(local.mode3 && remote.map(|r| r.mode3).unwrap_or(true)) {
            return Err(Error::FeatureNotSupported);
        }
        if self.sub_mode.is_some()
            && (self.main_mode_min_steps < 2 || self.main_mode_min_steps > self.main_mode_max_steps)
        {
            return Err(Error::UnexpectedParameter);
        }
        if self.main_mode_repetition > 3 || !(1..=3).contains(&self.mode0_steps) {
            return Err(Error::UnexpectedParameter);
        }

        // Roles
        if !local.roles.contains(self.role.into()) {
            return Err(Error::FeatureNotSupported);
        }
        if !defaults.roles.contains(self.role.into()) {
            return Err(Error::UnexpectedParameter);
        }
        if let Some(remote) = remote {
            if !remote.roles.contains(self.role.peer().into()) {
                return Err(Error::FeatureNotSupported);
            }
        }

        // RTT
        let sounding = |c: &CsCapabilities| c.rtt_sounding_n != 0;
        let random = |c: &CsCapabilities| c.rtt_random_payload_n != 0;
        if self.rtt_type.is_sounding() && !(sounding(local) && remote.map(sounding).unwrap_or(true)) {
            return Err(Error::FeatureNotSupported);
        }
        if self.rtt_type.is_random() && !(random(local) && remote.map(random).unwrap_or(true)) {
            return Err(Error::FeatureNotSupported);
        }

        if !self.sync_phy.is_supported(local) || !remote.map(|r| self.sync_phy.is_supported(r)).unwrap_or(true) {
            return Err(Error::FeatureNotSupported);
        }

        // Channel selection
        if !self.channel_map.is_valid() || !(1..=3).contains(&self.channel_map_repetition) {
            return Err(Error::UnexpectedParameter);
        }
        if self.channel_selection == ChannelSelection::Algorithm3c {
            if !(local.channel_selection_3c && remote.map(|r| r.channel_selection_3c).unwrap_or(true)) {
                return Err(Error::FeatureNotSupported);
            }
            if self.ch3c_shape > 1 || !(2..=8).contains(&self.ch3c_jump) {
                return Err(Error::UnexpectedParameter);
            }
        }
        Ok(())
    }
}

impl FixedSize for ConfigParams {
    const SIZE: usize = 23;
}

impl Encode for ConfigParams {
    fn encode(&self, dest: &mut [u8]) -> Result<(), CodecError> {
        let mut w = WriteCursor::new(dest);
        w.write(u8::from(self.role))?;
        w.write(self.main_mode as u8)?;
        w.write(self.sub_mode.map(|m| m as u8).unwrap_or(SUB_MODE_UNUSED))?;
        w.write(self.main_mode_min_steps)?;
        w.write(self.main_mode_max_steps)?;
        w.write(self.main_mode_repetition)?;
        w.write(self.mode0_steps)?;
        w.write(self.rtt_type as u8)?;
        w.write(self.sync_phy as u8)?;
        w.write_ref(&self.channel_map)?;
        w.write(self.channel_map_repetition)?;
        w.write(self.channel_selection as u8)?;
        w.write(self.ch3c_shape)?;
        w.write(self.ch3c_jump)?;
        Ok(())
    }
}

impl Decode<'_> for ConfigParams {
    fn decode(src: &[u8]) -> Result<Self, CodecError> {
        let mut r = ReadCursor::new(src);
        Ok(Self {
            role: r.read::<u8>()?.try_into()?,
            main_mode: r.read::<u8>()?.try_into()?,
            sub_mode: match r.read::<u8>()? {
                SUB_MODE_UNUSED => None,
                m => Some(m.try_into()?),
            },
            main_mode_min_steps: r.read()?,
            main_mode_max_steps: r.read()?,
            main_mode_repetition: r.read()?,
            mode0_steps: r.read()?,
            rtt_type: r.read::<u8>()?.try_into()?,
            sync_phy: r.read::<u8>()?.try_into()?,
            channel_map: r.read()?,
            channel_map_repetition: r.read()?,
            channel_selection: r.read::<u8>()?.try_into()?,
            ch3c_shape: r.read()?,
            ch3c_jump: r.read()?,
        })
    }
}

/// A created CS configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CsConfiguration {
    pub id: u8,
    pub params: ConfigParams,
    pub timing: Timing,
}

impl CsConfiguration {
    /// Largest identifier representable on the wire.
    pub const MAX_ID: u8 = 0x3F;
}

impl FixedSize for CsConfiguration {
    const SIZE: usize = 1 + ConfigParams::SIZE + Timing::SIZE;
}

impl Encode for CsConfiguration {
    fn encode(&self, dest: &mut [u8]) -> Result<(), CodecError> {
        let mut w = WriteCursor::new(dest);
        w.write(self.id)?;
        w.write_ref(&self.params)?;
        w.write_ref(&self.timing)?;
        Ok(())
    }
}

impl Decode<'_> for CsConfiguration {
    fn decode(src: &[u8]) -> Result<Self, CodecError> {
        let mut r = ReadCursor::new(src);
        let id: u8 = r.read()?;
        if id > Self::MAX_ID {
            return Err(CodecError::InvalidValue);
        }
        Ok(Self {
            id,
            params: r.read()?,
            timing: r.read()?,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::capabilities::RoleSet;

    pub(crate) fn params(role: CsRole) -> ConfigParams {
        ConfigParams {
            role,
            main_mode: Mode::Pbr,
            sub_mode: None,
            main_mode_min_steps: 2,
            main_mode_max_steps: 5,
            main_mode_repetition: 1,
            mode0_steps: 3,
            rtt_type: RttType::AaOnly,
            sync_phy: SyncPhy::Le1M,
            channel_map: ChannelMap::ALL,
            channel_map_repetition: 1,
            channel_selection: ChannelSelection::Algorithm3b,
            ch3c_shape: 0,
            ch3c_jump: 2,
        }
    }

    #[test]
    fn channel_map_validity() {
        assert!(ChannelMap::ALL.is_valid());
        assert_eq!(ChannelMap::ALL.used_channels(), 72);

        let mut bits = *ChannelMap::ALL.bits();
        bits[0] |= 0x01;
        assert!(!ChannelMap::new(bits).is_valid());

        let sparse = ChannelMap::new([0xFC, 0xFF, 0x1F, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(sparse.used_channels(), 19);
        assert!(sparse.is_valid());
        let too_sparse = ChannelMap::new([0xFC, 0x3F, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(!too_sparse.is_valid());
    }

    #[test]
    fn check_mode_combinations() {
        let local = CsCapabilities::default();
        let defaults = DefaultSettings::new(RoleSet::BOTH);

        let mut p = params(CsRole::Initiator);
        assert!(p.check(&local, None, &defaults).is_ok());

        p.sub_mode = Some(Mode::Rtt);
        assert!(p.check(&local, None, &defaults).is_ok());
        p.main_mode_min_steps = 1;
        assert_eq!(p.check(&local, None, &defaults), Err(Error::UnexpectedParameter));

        p = params(CsRole::Initiator);
        p.main_mode = Mode::Rtt;
        p.sub_mode = Some(Mode::Pbr);
        assert_eq!(p.check(&local, None, &defaults), Err(Error::UnexpectedParameter));

        p.main_mode = Mode::RttPbr;
        let no_mode3 = CsCapabilities {
            mode3: false,
            ..Default::default()
        };
        assert!(p.check(&local, None, &defaults).is_ok());
        assert_eq!(p.check(&local, Some(&no_mode3), &defaults), Err(Error::FeatureNotSupported));
    }

    #[test]
    fn check_roles() {
        let local = CsCapabilities::default();
        let remote = CsCapabilities {
            roles: RoleSet::INITIATOR,
            ..Default::default()
        };
        let p = params(CsRole::Initiator);
        assert_eq!(
            p.check(&local, Some(&remote), &DefaultSettings::new(RoleSet::BOTH)),
            Err(Error::FeatureNotSupported)
        );
        assert!(p
            .for_peer()
            .check(&local, Some(&remote), &DefaultSettings::new(RoleSet::BOTH))
            .is_ok());
        assert_eq!(
            p.check(&local, None, &DefaultSettings::new(RoleSet::REFLECTOR)),
            Err(Error::UnexpectedParameter)
        );
    }

    #[test]
    fn check_optional_features() {
        let local = CsCapabilities::default();
        let defaults = DefaultSettings::new(RoleSet::BOTH);

        let mut p = params(CsRole::Reflector);
        p.rtt_type = RttType::Sounding32;
        assert_eq!(p.check(&local, None, &defaults), Err(Error::FeatureNotSupported));

        p = params(CsRole::Reflector);
        p.sync_phy = SyncPhy::Le2M;
        assert_eq!(p.check(&local, None, &defaults), Err(Error::FeatureNotSupported));

        p = params(CsRole::Reflector);
        p.channel_map_repetition = 0;
        assert_eq!(p.check(&local, None, &defaults), Err(Error::UnexpectedParameter));

        p = params(CsRole::Reflector);
        p.channel_selection = ChannelSelection::Algorithm3c;
        assert_eq!(p.check(&local, None, &defaults), Err(Error::FeatureNotSupported));
        let csa3c = CsCapabilities {
            channel_selection_3c: true,
            ..Default::default()
        };
        assert!(p.check(&csa3c, None, &defaults).is_ok());
        p.ch3c_jump = 9;
        assert_eq!(p.check(&csa3c, None, &defaults), Err(Error::UnexpectedParameter));
    }

    #[test]
    fn configuration_wire_layout() {
        let config = CsConfiguration {
            id: 2,
            params: params(CsRole::Initiator),
            timing: Timing::MANDATORY,
        };
        let mut buf = [0; CsConfiguration::SIZE];
        unwrap!(config.encode(&mut buf[..]));
        assert_eq!(&buf[..4], &[2, 0, 2, 0xFF]);
        assert_eq!(unwrap!(CsConfiguration::decode(&buf[..])), config);

        buf[0] = 0x40;
        assert_eq!(CsConfiguration::decode(&buf[..]), Err(CodecError::InvalidValue));
    }
}
