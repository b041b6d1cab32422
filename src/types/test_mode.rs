//! Parameters of a CS loop-back test.

use super::capabilities::{CsCapabilities, CsRole};
use super::config::{ChannelMap, Mode, RttType, SyncPhy};
use super::procedure::{is_valid_snr_control, Aci, SUBEVENT_LEN_MAX, SUBEVENT_LEN_MIN};
use super::timing::{
    is_allowed, T_FCS_MANDATORY, T_FCS_VALUES, T_IP_MANDATORY, T_IP_VALUES, T_PM_MANDATORY, T_PM_VALUES, T_SW_VALUES,
};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TestParams {
    pub main_mode: Mode,
    pub sub_mode: Option<Mode>,
    pub main_mode_repetition: u8,
    pub mode0_steps: u8,
    pub role: CsRole,
    pub rtt_type: RttType,
    pub sync_phy: SyncPhy,
    pub sync_antenna: u8,
    /// Subevent length in microseconds.
    pub subevent_len: u32,
    /// Subevent interval in 0.625 ms units, 0 for a single subevent per event.
    pub subevent_interval: u16,
    pub max_num_subevents: u8,
    pub transmit_power_level: i8,
    pub t_ip1: u8,
    pub t_ip2: u8,
    pub t_fcs: u8,
    pub t_pm: u8,
    pub t_sw: u8,
    pub tone_antenna_config: Aci,
    pub snr_control_initiator: u8,
    pub snr_control_reflector: u8,
    pub drbg_nonce: u16,
    pub channel_map: ChannelMap,
    pub channel_map_repetition: u8,
}

impl TestParams {
    /// Check the parameters against the local capabilities.
    pub(crate) fn check(&self, local: &CsCapabilities) -> Result<(), Error> {
        match (self.main_mode, self.sub_mode) {
            (Mode::Rtt, None) | (Mode::Pbr, None | Some(Mode::Rtt) | Some(Mode::RttPbr)) => {}
            (Mode::RttPbr, None | Some(Mode::Pbr)) => {}
            _ => return Err(Error::UnexpectedParameter),
        }
        if (self.main_mode == Mode::RttPbr || self.sub_mode == Some(Mode::RttPbr)) && !local.mode3 {
            return Err(Error::FeatureNotSupported);
        }
        if self.main_mode_repetition > 3 || !(1..=3).contains(&self.mode0_steps) {
            return Err(Error::UnexpectedParameter);
        }
        if !local.roles.contains(self.role.into()) || !self.sync_phy.is_supported(local) {
            return Err(Error::FeatureNotSupported);
        }
        if !(SUBEVENT_LEN_MIN..=SUBEVENT_LEN_MAX).contains(&self.subevent_len) || self.max_num_subevents == 0 {
            return Err(Error::UnexpectedParameter);
        }
        if !is_allowed(self.t_ip1, &T_IP_VALUES, T_IP_MANDATORY)
            || !is_allowed(self.t_ip2, &T_IP_VALUES, T_IP_MANDATORY)
            || !is_allowed(self.t_fcs, &T_FCS_VALUES, T_FCS_MANDATORY)
            || !is_allowed(self.t_pm, &T_PM_VALUES, T_PM_MANDATORY)
            || !T_SW_VALUES.contains(&self.t_sw)
        {
            return Err(Error::UnexpectedParameter);
        }
        if self.tone_antenna_config.antennas_for(self.role).0 > local.num_antennas {
            return Err(Error::InsufficientResources);
        }
        if !is_valid_snr_control(self.snr_control_initiator) || !is_valid_snr_control(self.snr_control_reflector) {
            return Err(Error::UnexpectedParameter);
        }
        if !self.channel_map.is_valid() || !(1..=3).contains(&self.channel_map_repetition) {
            return Err(Error::UnexpectedParameter);
        }
        Ok(())
    }
}
