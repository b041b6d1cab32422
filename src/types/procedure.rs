//! Procedure parameters applied to an existing configuration.

use super::capabilities::{CsCapabilities, CsRole};
use crate::codec::{Decode, Encode, Error as CodecError, FixedSize};
use crate::cursor::{ReadCursor, WriteCursor};
use crate::Error;

/// Antenna configuration index, `A` antennas on the initiator and `B` on the reflector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Aci {
    A1B1 = 0,
    A2B1 = 1,
    A3B1 = 2,
    A4B1 = 3,
    A1B2 = 4,
    A1B3 = 5,
    A1B4 = 6,
    A2B2 = 7,
}

impl Aci {
    /// Antennas needed by the initiator and the reflector.
    pub fn antennas(self) -> (u8, u8) {
        match self {
            Aci::A1B1 => (1, 1),
            Aci::A2B1 => (2, 1),
            Aci::A3B1 => (3, 1),
            Aci::A4B1 => (4, 1),
            Aci::A1B2 => (1, 2),
            Aci::A1B3 => (1, 3),
            Aci::A1B4 => (1, 4),
            Aci::A2B2 => (2, 2),
        }
    }

    /// Antennas needed locally and by the peer when playing `role`.
    pub fn antennas_for(self, role: CsRole) -> (u8, u8) {
        let (initiator, reflector) = self.antennas();
        match role {
            CsRole::Initiator => (initiator, reflector),
            CsRole::Reflector => (reflector, initiator),
        }
    }
}

impl TryFrom<u8> for Aci {
    type Error = CodecError;
    fn try_from(val: u8) -> Result<Self, CodecError> {
        Ok(match val {
            0 => Self::A1B1,
            1 => Self::A2B1,
            2 => Self::A3B1,
            3 => Self::A4B1,
            4 => Self::A1B2,
            5 => Self::A1B3,
            6 => Self::A1B4,
            7 => Self::A2B2,
            _ => return Err(CodecError::InvalidValue),
        })
    }
}

/// PHY used for CS procedure packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CsPhy {
    Le1M = 1,
    Le2M = 2,
    LeCodedS8 = 3,
    LeCodedS2 = 4,
}

impl TryFrom<u8> for CsPhy {
    type Error = CodecError;
    fn try_from(val: u8) -> Result<Self, CodecError> {
        Ok(match val {
            1 => Self::Le1M,
            2 => Self::Le2M,
            3 => Self::LeCodedS8,
            4 => Self::LeCodedS2,
            _ => return Err(CodecError::InvalidValue),
        })
    }
}

/// SNR control adjustment is not applied.
pub const SNR_CONTROL_NOT_APPLIED: u8 = 0xFF;

pub(crate) fn is_valid_snr_control(val: u8) -> bool {
    val <= 4 || val == SNR_CONTROL_NOT_APPLIED
}

pub const SUBEVENT_LEN_MIN: u32 = 1250;
pub const SUBEVENT_LEN_MAX: u32 = 4_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ProcedureParameters {
    /// Maximum procedure duration in 0.625 ms units.
    pub max_procedure_len: u16,
    /// Procedure interval bounds in connection events.
    pub min_procedure_interval: u16,
    pub max_procedure_interval: u16,
    /// Number of procedures to run, 0 to run until disabled.
    pub max_procedure_count: u16,
    /// Subevent length bounds in microseconds.
    pub min_subevent_len: u32,
    pub max_subevent_len: u32,
    pub tone_antenna_config: Aci,
    pub phy: CsPhy,
    pub tx_power_delta: i8,
    /// Bitmap of preferred peer antennas.
    pub preferred_peer_antenna: u8,
    pub snr_control_initiator: u8,
    pub snr_control_reflector: u8,
}

impl ProcedureParameters {
    /// Check the parameters for a configuration where we play `role`.
    pub(crate) fn check(&self, role: CsRole, local: &CsCapabilities, remote: Option<&CsCapabilities>) -> Result<(), Error> {
        if self.max_procedure_len == 0
            || self.min_procedure_interval == 0
            || self.min_procedure_interval > self.max_procedure_interval
        {
            return Err(Error::UnexpectedParameter);
        }
        if self.min_subevent_len < SUBEVENT_LEN_MIN
            || self.max_subevent_len > SUBEVENT_LEN_MAX
            || self.min_subevent_len > self.max_subevent_len
        {
            return Err(Error::UnexpectedParameter);
        }
        if !(0x01..=0x0F).contains(&self.preferred_peer_antenna)
            || !is_valid_snr_control(self.snr_control_initiator)
            || !is_valid_snr_control(self.snr_control_reflector)
        {
            return Err(Error::UnexpectedParameter);
        }

        let (local_antennas, remote_antennas) = self.tone_antenna_config.antennas_for(role);
        if local_antennas > local.num_antennas {
            return Err(Error::InsufficientResources);
        }
        if let Some(remote) = remote {
            if remote_antennas > remote.num_antennas {
                return Err(Error::InsufficientResources);
            }
        }
        Ok(())
    }
}

impl FixedSize for ProcedureParameters {
    const SIZE: usize = 22;
}

impl Encode for ProcedureParameters {
    fn encode(&self, dest: &mut [u8]) -> Result<(), CodecError> {
        let mut w = WriteCursor::new(dest);
        w.write(self.max_procedure_len)?;
        w.write(self.min_procedure_interval)?;
        w.write(self.max_procedure_interval)?;
        w.write(self.max_procedure_count)?;
        w.write(self.min_subevent_len)?;
        w.write(self.max_subevent_len)?;
        w.write(self.tone_antenna_config as u8)?;
        w.write(self.phy as u8)?;
        w.write(self.tx_power_delta)?;
        w.write(self.preferred_peer_antenna)?;
        w.write(self.snr_control_initiator)?;
        w.write(self.snr_control_reflector)?;
        Ok(())
    }
}

impl Decode<'_> for ProcedureParameters {
    fn decode(src: &[u8]) -> Result<Self, CodecError> {
        let mut r = ReadCursor::new(src);
        Ok(Self {
            max_procedure_len: r.read()?,
            min_procedure_interval: r.read()?,
            max_procedure_interval: r.read()?,
            max_procedure_count: r.read()?,
            min_subevent_len: r.read()?,
            max_subevent_len: r.read()?,
            tone_antenna_config: r.read::<u8>()?.try_into()?,
            phy: r.read::<u8>()?.try_into()?,
            tx_power_delta: r.read()?,
            preferred_peer_antenna: r.read()?,
            snr_control_initiator: r.read()?,
            snr_control_reflector: r.read()?,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn params() -> ProcedureParameters {
        ProcedureParameters {
            max_procedure_len: 0x0100,
            min_procedure_interval: 10,
            max_procedure_interval: 20,
            max_procedure_count: 0,
            min_subevent_len: 1250,
            max_subevent_len: 5000,
            tone_antenna_config: Aci::A1B1,
            phy: CsPhy::Le1M,
            tx_power_delta: 0,
            preferred_peer_antenna: 0x01,
            snr_control_initiator: SNR_CONTROL_NOT_APPLIED,
            snr_control_reflector: SNR_CONTROL_NOT_APPLIED,
        }
    }

    #[test]
    fn check_bounds() {
        let local = CsCapabilities::default();
        assert!(params().check(CsRole::Initiator, &local, None).is_ok());

        let mut p = params();
        p.min_procedure_interval = 30;
        assert_eq!(p.check(CsRole::Initiator, &local, None), Err(Error::UnexpectedParameter));

        p = params();
        p.min_subevent_len = 1249;
        assert_eq!(p.check(CsRole::Initiator, &local, None), Err(Error::UnexpectedParameter));

        p = params();
        p.max_subevent_len = 4_000_001;
        assert_eq!(p.check(CsRole::Initiator, &local, None), Err(Error::UnexpectedParameter));

        p = params();
        p.snr_control_reflector = 5;
        assert_eq!(p.check(CsRole::Initiator, &local, None), Err(Error::UnexpectedParameter));
    }

    #[test]
    fn check_antennas_follow_role() {
        let local = CsCapabilities {
            num_antennas: 2,
            ..Default::default()
        };
        let remote = CsCapabilities::default();

        let mut p = params();
        p.tone_antenna_config = Aci::A2B1;
        assert!(p.check(CsRole::Initiator, &local, Some(&remote)).is_ok());
        assert_eq!(
            p.check(CsRole::Reflector, &local, Some(&remote)),
            Err(Error::InsufficientResources)
        );

        p.tone_antenna_config = Aci::A3B1;
        assert_eq!(p.check(CsRole::Initiator, &local, None), Err(Error::InsufficientResources));
    }

    #[test]
    fn procedure_parameters_wire_layout() {
        let mut p = params();
        p.tx_power_delta = -3;
        let mut buf = [0; ProcedureParameters::SIZE];
        unwrap!(p.encode(&mut buf[..]));
        assert_eq!(&buf[..2], &[0x00, 0x01]);
        assert_eq!(&buf[8..12], &[0xE2, 0x04, 0x00, 0x00]);
        assert_eq!(buf[18], 0xFD);
        assert_eq!(unwrap!(ProcedureParameters::decode(&buf[..])), p);

        buf[16] = 8;
        assert_eq!(ProcedureParameters::decode(&buf[..]), Err(CodecError::InvalidValue));
    }
}
