//! Channel Sounding link-layer control procedures.
//!
//! Encodes and decodes the CS control PDUs exchanged between two controllers, tracks the single
//! outstanding control procedure of every connection and matches responses against it.

use core::fmt::{Display, Formatter};

use bt_hci::param::{ConnHandle, LeConnRole};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::Channel;

use crate::codec::{Decode, Encode, Error as CodecError, FixedSize, Type};
use crate::config::CONTROL_TX_QUEUE_SIZE;
use crate::cursor::{ReadCursor, WriteCursor};
use crate::database::CsDatabase;
use crate::types::capabilities::CsCapabilities;
use crate::types::config::{ChannelMap, CsConfiguration};
use crate::types::fae::FaeTable;
use crate::types::procedure::ProcedureParameters;
use crate::types::security::SecurityVectors;
use crate::Error;

/// Control procedure outstanding on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlProcedure {
    CapabilitiesExchange,
    SecurityStart,
    FaeTableUpdate,
    ConfigCreate(u8),
    ProcedureStart(u8),
    ProcedureTerminate(u8),
}

impl ControlProcedure {
    /// Opcode of the PDU starting this procedure.
    pub fn request_opcode(&self) -> Opcode {
        match self {
            Self::CapabilitiesExchange => Opcode::CapabilitiesReq,
            Self::SecurityStart => Opcode::SecurityReq,
            Self::FaeTableUpdate => Opcode::FaeReq,
            Self::ConfigCreate(_) => Opcode::ConfigReq,
            Self::ProcedureStart(_) => Opcode::CsReq,
            Self::ProcedureTerminate(_) => Opcode::TerminateReq,
        }
    }

    /// Same procedure, ignoring the configuration identifier.
    pub fn same_kind(&self, other: &ControlProcedure) -> bool {
        core::mem::discriminant(self) == core::mem::discriminant(other)
    }
}

/// Control PDU opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Opcode {
    RejectExtInd,
    SecurityRsp,
    CapabilitiesReq,
    CapabilitiesRsp,
    ConfigReq,
    ConfigRsp,
    CsReq,
    CsRsp,
    TerminateReq,
    FaeReq,
    FaeRsp,
    ChannelMapInd,
    SecurityReq,
    TerminateRsp,
}

impl TryFrom<u8> for Opcode {
    type Error = CodecError;
    fn try_from(val: u8) -> Result<Self, CodecError> {
        Ok(match val {
            0x11 => Self::RejectExtInd,
            0x2D => Self::SecurityRsp,
            0x2E => Self::CapabilitiesReq,
            0x2F => Self::CapabilitiesRsp,
            0x30 => Self::ConfigReq,
            0x31 => Self::ConfigRsp,
            0x32 => Self::CsReq,
            0x33 => Self::CsRsp,
            0x35 => Self::TerminateReq,
            0x36 => Self::FaeReq,
            0x37 => Self::FaeRsp,
            0x38 => Self::ChannelMapInd,
            0x39 => Self::SecurityReq,
            0x3A => Self::TerminateRsp,
            _ => return Err(CodecError::InvalidValue),
        })
    }
}

impl From<Opcode> for u8 {
    fn from(opcode: Opcode) -> u8 {
        match opcode {
            Opcode::RejectExtInd => 0x11,
            Opcode::SecurityRsp => 0x2D,
            Opcode::CapabilitiesReq => 0x2E,
            Opcode::CapabilitiesRsp => 0x2F,
            Opcode::ConfigReq => 0x30,
            Opcode::ConfigRsp => 0x31,
            Opcode::CsReq => 0x32,
            Opcode::CsRsp => 0x33,
            Opcode::TerminateReq => 0x35,
            Opcode::FaeReq => 0x36,
            Opcode::FaeRsp => 0x37,
            Opcode::ChannelMapInd => 0x38,
            Opcode::SecurityReq => 0x39,
            Opcode::TerminateRsp => 0x3A,
        }
    }
}

impl AsRef<str> for Opcode {
    fn as_ref(&self) -> &str {
        match self {
            Opcode::RejectExtInd => "LL_REJECT_EXT_IND",
            Opcode::SecurityRsp => "LL_CS_SEC_RSP",
            Opcode::CapabilitiesReq => "LL_CS_CAPABILITIES_REQ",
            Opcode::CapabilitiesRsp => "LL_CS_CAPABILITIES_RSP",
            Opcode::ConfigReq => "LL_CS_CONFIG_REQ",
            Opcode::ConfigRsp => "LL_CS_CONFIG_RSP",
            Opcode::CsReq => "LL_CS_REQ",
            Opcode::CsRsp => "LL_CS_RSP",
            Opcode::TerminateReq => "LL_CS_TERMINATE_REQ",
            Opcode::FaeReq => "LL_CS_FAE_REQ",
            Opcode::FaeRsp => "LL_CS_FAE_RSP",
            Opcode::ChannelMapInd => "LL_CS_CHANNEL_MAP_IND",
            Opcode::SecurityReq => "LL_CS_SEC_REQ",
            Opcode::TerminateRsp => "LL_CS_TERMINATE_RSP",
        }
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

/// Channel Sounding control PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlPdu {
    RejectExtInd {
        opcode: u8,
        error: u8,
    },
    SecurityReq(SecurityVectors),
    SecurityRsp(SecurityVectors),
    CapabilitiesReq(CsCapabilities),
    CapabilitiesRsp(CsCapabilities),
    /// Configuration with the role of the sender.
    ConfigReq(CsConfiguration),
    ConfigRsp {
        config_id: u8,
    },
    CsReq {
        config_id: u8,
        params: ProcedureParameters,
    },
    CsRsp {
        config_id: u8,
    },
    TerminateReq {
        config_id: u8,
        procedure_count: u16,
        error: u8,
    },
    TerminateRsp {
        config_id: u8,
        procedure_count: u16,
        error: u8,
    },
    FaeReq,
    FaeRsp(FaeTable),
    ChannelMapInd(ChannelMap),
}

/// Largest encoded control PDU.
pub const MAX_PDU_SIZE: usize = 1 + FaeTable::SIZE;

impl ControlPdu {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::RejectExtInd { .. } => Opcode::RejectExtInd,
            Self::SecurityReq(_) => Opcode::SecurityReq,
            Self::SecurityRsp(_) => Opcode::SecurityRsp,
            Self::CapabilitiesReq(_) => Opcode::CapabilitiesReq,
            Self::CapabilitiesRsp(_) => Opcode::CapabilitiesRsp,
            Self::ConfigReq(_) => Opcode::ConfigReq,
            Self::ConfigRsp { .. } => Opcode::ConfigRsp,
            Self::CsReq { .. } => Opcode::CsReq,
            Self::CsRsp { .. } => Opcode::CsRsp,
            Self::TerminateReq { .. } => Opcode::TerminateReq,
            Self::TerminateRsp { .. } => Opcode::TerminateRsp,
            Self::FaeReq => Opcode::FaeReq,
            Self::FaeRsp(_) => Opcode::FaeRsp,
            Self::ChannelMapInd(_) => Opcode::ChannelMapInd,
        }
    }

    /// Procedure a peer request starts on its side.
    pub fn requested(&self) -> Option<ControlProcedure> {
        match self {
            Self::CapabilitiesReq(_) => Some(ControlProcedure::CapabilitiesExchange),
            Self::SecurityReq(_) => Some(ControlProcedure::SecurityStart),
            Self::FaeReq => Some(ControlProcedure::FaeTableUpdate),
            Self::ConfigReq(config) => Some(ControlProcedure::ConfigCreate(config.id)),
            Self::CsReq { config_id, .. } => Some(ControlProcedure::ProcedureStart(*config_id)),
            Self::TerminateReq { config_id, .. } => Some(ControlProcedure::ProcedureTerminate(*config_id)),
            _ => None,
        }
    }

    /// Procedure completed by this response.
    pub fn completes(&self) -> Option<ControlProcedure> {
        match self {
            Self::CapabilitiesRsp(_) => Some(ControlProcedure::CapabilitiesExchange),
            Self::SecurityRsp(_) => Some(ControlProcedure::SecurityStart),
            Self::FaeRsp(_) => Some(ControlProcedure::FaeTableUpdate),
            Self::ConfigRsp { config_id } => Some(ControlProcedure::ConfigCreate(*config_id)),
            Self::CsRsp { config_id } => Some(ControlProcedure::ProcedureStart(*config_id)),
            Self::TerminateRsp { config_id, .. } => Some(ControlProcedure::ProcedureTerminate(*config_id)),
            _ => None,
        }
    }

    fn payload_size(&self) -> usize {
        match self {
            Self::RejectExtInd { .. } => 2,
            Self::SecurityReq(v) | Self::SecurityRsp(v) => v.size(),
            Self::CapabilitiesReq(c) | Self::CapabilitiesRsp(c) => c.size(),
            Self::ConfigReq(c) => c.size(),
            Self::ConfigRsp { .. } | Self::CsRsp { .. } => 1,
            Self::CsReq { params, .. } => 1 + params.size(),
            Self::TerminateReq { .. } | Self::TerminateRsp { .. } => 4,
            Self::FaeReq => 0,
            Self::FaeRsp(t) => t.size(),
            Self::ChannelMapInd(m) => m.size(),
        }
    }
}

impl Type for ControlPdu {
    fn size(&self) -> usize {
        1 + self.payload_size()
    }
}

impl Encode for ControlPdu {
    fn encode(&self, dest: &mut [u8]) -> Result<(), CodecError> {
        let mut w = WriteCursor::new(dest);
        w.write(u8::from(self.opcode()))?;
        match self {
            Self::RejectExtInd { opcode, error } => {
                w.write(*opcode)?;
                w.write(*error)?;
            }
            Self::SecurityReq(v) | Self::SecurityRsp(v) => w.write_ref(v)?,
            Self::CapabilitiesReq(c) | Self::CapabilitiesRsp(c) => w.write_ref(c)?,
            Self::ConfigReq(c) => w.write_ref(c)?,
            Self::ConfigRsp { config_id } | Self::CsRsp { config_id } => w.write(*config_id)?,
            Self::CsReq { config_id, params } => {
                w.write(*config_id)?;
                w.write_ref(params)?;
            }
            Self::TerminateReq {
                config_id,
                procedure_count,
                error,
            }
            | Self::TerminateRsp {
                config_id,
                procedure_count,
                error,
            } => {
                w.write(*config_id)?;
                w.write(*procedure_count)?;
                w.write(*error)?;
            }
            Self::FaeReq => {}
            Self::FaeRsp(t) => w.write_ref(t)?,
            Self::ChannelMapInd(m) => w.write_ref(m)?,
        }
        Ok(())
    }
}

impl Decode<'_> for ControlPdu {
    fn decode(src: &[u8]) -> Result<Self, CodecError> {
        let mut r = ReadCursor::new(src);
        let opcode: Opcode = r.read::<u8>()?.try_into()?;
        let pdu = match opcode {
            Opcode::RejectExtInd => Self::RejectExtInd {
                opcode: r.read()?,
                error: r.read()?,
            },
            Opcode::SecurityReq => Self::SecurityReq(r.read()?),
            Opcode::SecurityRsp => Self::SecurityRsp(r.read()?),
            Opcode::CapabilitiesReq => Self::CapabilitiesReq(r.read()?),
            Opcode::CapabilitiesRsp => Self::CapabilitiesRsp(r.read()?),
            Opcode::ConfigReq => Self::ConfigReq(r.read()?),
            Opcode::ConfigRsp => Self::ConfigRsp { config_id: r.read()? },
            Opcode::CsReq => Self::CsReq {
                config_id: r.read()?,
                params: r.read()?,
            },
            Opcode::CsRsp => Self::CsRsp { config_id: r.read()? },
            Opcode::TerminateReq => Self::TerminateReq {
                config_id: r.read()?,
                procedure_count: r.read()?,
                error: r.read()?,
            },
            Opcode::TerminateRsp => Self::TerminateRsp {
                config_id: r.read()?,
                procedure_count: r.read()?,
                error: r.read()?,
            },
            Opcode::FaeReq => Self::FaeReq,
            Opcode::FaeRsp => Self::FaeRsp(r.read()?),
            Opcode::ChannelMapInd => Self::ChannelMapInd(r.read()?),
        };
        r.finish()?;
        Ok(pdu)
    }
}

/// Encoded control PDU waiting to be transmitted on a connection.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ControlPacket {
    handle: ConnHandle,
    data: heapless::Vec<u8, MAX_PDU_SIZE>,
}

impl ControlPacket {
    pub(crate) fn new(handle: ConnHandle, pdu: &ControlPdu) -> Result<Self, Error> {
        let mut data = heapless::Vec::new();
        data.resize_default(pdu.size()).map_err(|_| CodecError::InsufficientSpace)?;
        pdu.encode(&mut data[..])?;
        Ok(Self { handle, data })
    }

    /// Connection the packet is sent on.
    pub fn handle(&self) -> ConnHandle {
        self.handle
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..]
    }

    pub fn pdu(&self) -> Result<ControlPdu, Error> {
        Ok(ControlPdu::decode(self.as_bytes())?)
    }
}

/// Outcome of a received control PDU.
#[derive(Debug)]
pub(crate) enum Received {
    /// The outstanding procedure finished, with the response or the peer's rejection.
    Completed {
        procedure: ControlProcedure,
        result: Result<ControlPdu, Error>,
    },
    /// The peer started a procedure or sent an indication.
    Request(ControlPdu),
    /// As peripheral, the peer's request collided with the outstanding procedure of the same kind.
    /// The token has been released and `procedure` ends with the outcome of serving `request`.
    Preempted {
        procedure: ControlProcedure,
        request: ControlPdu,
    },
}

/// Dispatcher for Channel Sounding control PDUs.
pub(crate) struct ControlPacketManager {
    outbound: Channel<NoopRawMutex, ControlPacket, CONTROL_TX_QUEUE_SIZE>,
}

impl ControlPacketManager {
    pub(crate) fn new() -> Self {
        Self {
            outbound: Channel::new(),
        }
    }

    /// Queue a PDU that does not start a procedure.
    pub(crate) fn send(&self, handle: ConnHandle, pdu: &ControlPdu) -> Result<(), Error> {
        let packet = ControlPacket::new(handle, pdu)?;
        self.outbound.try_send(packet).map_err(|_| {
            warn!("[cs][ctrl] tx queue full, dropping {} on {:?}", pdu.opcode(), handle);
            Error::InsufficientResources
        })?;
        trace!("[cs][ctrl] queued {} on {:?}", pdu.opcode(), handle);
        Ok(())
    }

    /// Queue the PDU starting `procedure`, which must hold the connection's token.
    pub(crate) fn send_request(
        &self,
        db: &CsDatabase<'_>,
        handle: ConnHandle,
        procedure: ControlProcedure,
        pdu: &ControlPdu,
    ) -> Result<(), Error> {
        if db.in_progress(handle)? != Some(procedure) || pdu.requested() != Some(procedure) {
            return Err(Error::CommandDisallowed);
        }
        self.send(handle, pdu)
    }

    /// Reject a PDU received from the peer.
    pub(crate) fn reject(&self, handle: ConnHandle, opcode: Opcode, error: Error) {
        let pdu = ControlPdu::RejectExtInd {
            opcode: opcode.into(),
            error: error.into(),
        };
        if let Err(e) = self.send(handle, &pdu) {
            warn!("[cs][ctrl] unable to reject {} on {:?}: {:?}", opcode, handle, e);
        }
    }

    /// Decode a received PDU and match it against the outstanding procedure.
    ///
    /// Payloads of matched responses are stored before the token is released. PDUs that are
    /// malformed or do not match anything are dropped.
    pub(crate) fn receive(&self, db: &mut CsDatabase<'_>, handle: ConnHandle, data: &[u8]) -> Option<Received> {
        let outstanding = match db.in_progress(handle) {
            Ok(outstanding) => outstanding,
            Err(_) => {
                warn!("[cs][ctrl] PDU for unknown connection {:?}", handle);
                return None;
            }
        };
        let pdu = match ControlPdu::decode(data) {
            Ok(pdu) => pdu,
            Err(e) => {
                warn!("[cs][ctrl] dropping malformed PDU on {:?}: {:?}", handle, e);
                return None;
            }
        };
        trace!("[cs][ctrl] received {} on {:?}", pdu.opcode(), handle);

        if let ControlPdu::RejectExtInd { opcode, error } = pdu {
            return match outstanding {
                Some(procedure) if u8::from(procedure.request_opcode()) == opcode => {
                    db.clear_in_progress(handle);
                    debug!("[cs][ctrl] {:?} rejected by peer on {:?}: {:#x}", procedure, handle, error);
                    Some(Received::Completed {
                        procedure,
                        result: Err(Error::from_status(error)),
                    })
                }
                _ => {
                    warn!("[cs][ctrl] unexpected reject of {:#x} on {:?}", opcode, handle);
                    None
                }
            };
        }

        if let Some(completes) = pdu.completes() {
            if outstanding != Some(completes) {
                error!(
                    "[cs][ctrl] unsolicited {} on {:?}, outstanding {:?}",
                    pdu.opcode(),
                    handle,
                    outstanding
                );
                return None;
            }
            let stored = match &pdu {
                ControlPdu::CapabilitiesRsp(caps) => db.set_remote_capabilities(handle, *caps),
                ControlPdu::FaeRsp(table) => db.set_remote_fae_table(handle, *table),
                _ => Ok(()),
            };
            if let Err(e) = stored {
                warn!("[cs][ctrl] keeping previous peer data on {:?}: {:?}", handle, e);
            }
            db.clear_in_progress(handle);
            return Some(Received::Completed {
                procedure: completes,
                result: Ok(pdu),
            });
        }

        if let (Some(requested), Some(current)) = (pdu.requested(), outstanding) {
            if requested.same_kind(&current) {
                debug!("[cs][ctrl] {} collides with {:?} on {:?}", pdu.opcode(), current, handle);
                if db.role(handle).ok() == Some(LeConnRole::Central) {
                    self.reject(handle, pdu.opcode(), Error::CommandDisallowed);
                    return None;
                }
                db.clear_in_progress(handle);
                return Some(Received::Preempted {
                    procedure: current,
                    request: pdu,
                });
            }
        }
        Some(Received::Request(pdu))
    }

    /// Release the token of a connection going away.
    pub(crate) fn abort(&self, db: &mut CsDatabase<'_>, handle: ConnHandle) -> Option<ControlProcedure> {
        let aborted = db.clear_in_progress(handle);
        if let Some(procedure) = aborted {
            debug!("[cs][ctrl] aborted {:?} on {:?}", procedure, handle);
        }
        aborted
    }

    pub(crate) async fn next(&self) -> ControlPacket {
        self.outbound.receive().await
    }

    pub(crate) fn try_next(&self) -> Option<ControlPacket> {
        self.outbound.try_receive().ok()
    }

    /// Drop every queued packet.
    pub(crate) fn clear(&self) {
        while self.outbound.try_receive().is_ok() {}
    }

    /// Drop queued packets of one connection.
    pub(crate) fn purge(&self, handle: ConnHandle) {
        for _ in 0..CONTROL_TX_QUEUE_SIZE {
            match self.outbound.try_receive() {
                Ok(packet) if packet.handle == handle => {}
                Ok(packet) => {
                    let _ = self.outbound.try_send(packet);
                }
                Err(_) => break,
            }
        }
    }
}
