#![allow(dead_code)]

use std::cell::{Cell, RefCell};

use bt_hci::param::{ConnHandle, LeConnRole};
use embassy_time::Instant;
use trouble_cs::types::capabilities::CsRole;
use trouble_cs::types::config::{ChannelMap, ChannelSelection, ConfigParams, CsConfiguration, Mode, RttType, SyncPhy};
use trouble_cs::types::procedure::{Aci, CsPhy, ProcedureParameters, SNR_CONTROL_NOT_APPLIED};
use trouble_cs::types::security::SecurityVectors;
use trouble_cs::types::test_mode::TestParams;
use trouble_cs::{CsEvent, CsManager, CsResources, CsSettings, RadioScheduler, SchedulerHandle, SecurityModule, Timer};

pub const CONNECTIONS_MAX: usize = 2;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Radio scheduler recording every request it gets.
#[derive(Default)]
pub struct MockScheduler {
    next: Cell<u32>,
    pub fail: Cell<bool>,
    pub scheduled: RefCell<Vec<(ConnHandle, u8, SchedulerHandle)>>,
    pub cancelled: RefCell<Vec<SchedulerHandle>>,
    pub tests: RefCell<Vec<SchedulerHandle>>,
    pub tests_cancelled: RefCell<Vec<SchedulerHandle>>,
}

impl MockScheduler {
    fn allocate(&self) -> SchedulerHandle {
        let next = self.next.get() + 1;
        self.next.set(next);
        SchedulerHandle::new(next)
    }

    /// Procedures scheduled and not cancelled.
    pub fn running(&self) -> usize {
        let cancelled = self.cancelled.borrow();
        self.scheduled
            .borrow()
            .iter()
            .filter(|(_, _, h)| !cancelled.contains(h))
            .count()
    }
}

impl RadioScheduler for MockScheduler {
    fn schedule_procedure(
        &self,
        handle: ConnHandle,
        config: &CsConfiguration,
        _params: &ProcedureParameters,
    ) -> Result<SchedulerHandle, trouble_cs::Error> {
        if self.fail.get() {
            return Err(trouble_cs::Error::InsufficientResources);
        }
        let scheduled = self.allocate();
        self.scheduled.borrow_mut().push((handle, config.id, scheduled));
        Ok(scheduled)
    }

    fn cancel_procedure(&self, handle: SchedulerHandle) {
        self.cancelled.borrow_mut().push(handle);
    }

    fn schedule_test(&self, _params: &TestParams) -> Result<SchedulerHandle, trouble_cs::Error> {
        if self.fail.get() {
            return Err(trouble_cs::Error::InsufficientResources);
        }
        let scheduled = self.allocate();
        self.tests.borrow_mut().push(scheduled);
        Ok(scheduled)
    }

    fn cancel_test(&self, handle: SchedulerHandle) {
        self.tests_cancelled.borrow_mut().push(handle);
    }
}

/// Security module producing vectors filled with a fixed byte.
pub struct MockSecurity(pub u8);

impl SecurityModule for MockSecurity {
    fn generate_security_vectors(&self, _handle: ConnHandle) -> Result<SecurityVectors, trouble_cs::Error> {
        Ok(SecurityVectors {
            iv: [self.0; 8],
            nonce: [self.0; 4],
            personalization: [self.0; 8],
        })
    }
}

#[derive(Default)]
pub struct MockTimer(Cell<u64>);

impl MockTimer {
    pub fn advance_ms(&self, ms: u64) {
        self.0.set(self.0.get() + ms * 1000);
    }
}

impl Timer for MockTimer {
    fn now(&self) -> Instant {
        Instant::from_micros(self.0.get())
    }
}

pub struct Mocks {
    pub scheduler: MockScheduler,
    pub security: MockSecurity,
    pub timer: MockTimer,
}

impl Mocks {
    pub fn new(seed: u8) -> Self {
        Self {
            scheduler: MockScheduler::default(),
            security: MockSecurity(seed),
            timer: MockTimer::default(),
        }
    }
}

pub type Manager<'a> = CsManager<'a, &'a MockScheduler, &'a MockSecurity, &'a MockTimer>;

pub fn manager<'a>(
    resources: &'a mut CsResources<CONNECTIONS_MAX>,
    mocks: &'a Mocks,
    settings: CsSettings,
) -> Manager<'a> {
    CsManager::new(resources, settings, &mocks.scheduler, &mocks.security, &mocks.timer)
}

/// Bring up an encrypted link between two CS capable managers.
pub fn connect<'a>(central: &Manager<'a>, peripheral: &Manager<'a>, handle: ConnHandle) {
    central.connection_established(handle, LeConnRole::Central).unwrap();
    peripheral.connection_established(handle, LeConnRole::Peripheral).unwrap();
    for m in [central, peripheral] {
        m.remote_features_received(handle, true).unwrap();
        m.encryption_changed(handle, true).unwrap();
    }
}

/// Deliver control packets in both directions until both queues are empty.
pub fn pump(a: &Manager<'_>, b: &Manager<'_>) -> usize {
    let mut delivered = 0;
    loop {
        let mut moved = false;
        while let Some(packet) = a.try_next_control_packet() {
            b.on_control_pdu(packet.handle(), packet.as_bytes());
            moved = true;
            delivered += 1;
        }
        while let Some(packet) = b.try_next_control_packet() {
            a.on_control_pdu(packet.handle(), packet.as_bytes());
            moved = true;
            delivered += 1;
        }
        if !moved {
            return delivered;
        }
    }
}

pub fn events(m: &Manager<'_>) -> Vec<CsEvent> {
    std::iter::from_fn(|| m.try_next_event()).collect()
}

pub fn config_params(role: CsRole) -> ConfigParams {
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

pub fn procedure_params() -> ProcedureParameters {
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
        preferred_peer_antenna: 1,
        snr_control_initiator: SNR_CONTROL_NOT_APPLIED,
        snr_control_reflector: SNR_CONTROL_NOT_APPLIED,
    }
}

pub fn test_params() -> TestParams {
    TestParams {
        main_mode: Mode::Rtt,
        sub_mode: None,
        main_mode_repetition: 0,
        mode0_steps: 2,
        role: CsRole::Initiator,
        rtt_type: RttType::AaOnly,
        sync_phy: SyncPhy::Le1M,
        sync_antenna: 1,
        subevent_len: 10_000,
        subevent_interval: 0,
        max_num_subevents: 1,
        transmit_power_level: 0,
        t_ip1: 145,
        t_ip2: 145,
        t_fcs: 150,
        t_pm: 40,
        t_sw: 0,
        tone_antenna_config: Aci::A1B1,
        snr_control_initiator: SNR_CONTROL_NOT_APPLIED,
        snr_control_reflector: SNR_CONTROL_NOT_APPLIED,
        drbg_nonce: 0x1234,
        channel_map: ChannelMap::ALL,
        channel_map_repetition: 1,
    }
}
