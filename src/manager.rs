//! Channel Sounding manager.
//!
//! Validates host requests, drives the control procedures through the control packet manager and
//! reports completions on an event queue. Peer-initiated procedures are answered here as well.

use core::cell::{Cell, RefCell};
use core::task::Poll;

use bt_hci::param::{ConnHandle, DisconnectReason, LeConnRole};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::channel::{Channel, TrySendError};
use embassy_time::{Duration, Instant};

use crate::config::{CONFIG_SLOTS, EVENT_QUEUE_SIZE, SUBEVENT_DATA_MAX};
use crate::control::{ControlPacket, ControlPacketManager, ControlPdu, ControlProcedure, Received};
use crate::database::{ConnectionStorage, CsDatabase};
use crate::scheduler::{RadioScheduler, SchedulerHandle};
use crate::time::Timer;
use crate::types::capabilities::{CsCapabilities, DefaultSettings};
use crate::types::config::{ChannelMap, ConfigParams, CsConfiguration};
use crate::types::fae::FaeTable;
use crate::types::procedure::ProcedureParameters;
use crate::types::security::{SecurityContext, SecurityModule, SecurityVectors};
use crate::types::test_mode::TestParams;
use crate::types::timing::Timing;
use crate::Error;

/// Reason carried by a terminate request issued on behalf of the host.
const TERMINATED_BY_HOST: u8 = 0x13;

/// Minimum interval the host is expected to leave between channel classification updates.
const CLASSIFICATION_MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Run-time Channel Sounding configuration of the controller.
#[derive(Debug, Clone)]
pub struct CsSettings {
    /// Whether the controller supports Channel Sounding at all.
    pub supported: bool,
    pub capabilities: CsCapabilities,
    pub fae_table: FaeTable,
}

impl CsSettings {
    /// A controller without Channel Sounding.
    pub fn unsupported() -> Self {
        Self {
            supported: false,
            ..Default::default()
        }
    }
}

impl Default for CsSettings {
    fn default() -> Self {
        Self {
            supported: true,
            capabilities: CsCapabilities::default(),
            fae_table: FaeTable::ZERO,
        }
    }
}

/// Connection storage for the Channel Sounding manager.
pub struct CsResources<const CONNS: usize> {
    connections: [ConnectionStorage; CONNS],
}

impl<const CONNS: usize> CsResources<CONNS> {
    pub fn new() -> Self {
        Self {
            connections: [ConnectionStorage::DISCONNECTED; CONNS],
        }
    }
}

impl<const CONNS: usize> Default for CsResources<CONNS> {
    fn default() -> Self {
        Self::new()
    }
}

/// Most recent channel classification supplied by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelClassification {
    pub map: ChannelMap,
    pub updated: Instant,
}

/// Completion and data events reported to the host-facing layer.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CsEvent {
    ReadRemoteCapabilitiesComplete {
        handle: ConnHandle,
        result: Result<CsCapabilities, Error>,
    },
    ReadRemoteFaeTableComplete {
        handle: ConnHandle,
        result: Result<FaeTable, Error>,
    },
    SecurityEnableComplete {
        handle: ConnHandle,
        result: Result<(), Error>,
    },
    ConfigComplete {
        handle: ConnHandle,
        config_id: u8,
        result: Result<CsConfiguration, Error>,
    },
    /// A procedure enable (`enabled = true`) or disable finished.
    ProcedureEnableComplete {
        handle: ConnHandle,
        config_id: u8,
        enabled: bool,
        result: Result<(), Error>,
    },
    SubeventResult {
        handle: ConnHandle,
        config_id: u8,
        data: heapless::Vec<u8, SUBEVENT_DATA_MAX>,
    },
    TestSubeventResult {
        data: heapless::Vec<u8, SUBEVENT_DATA_MAX>,
    },
    TestEndComplete {
        result: Result<(), Error>,
    },
}

/// Channel Sounding manager for all connections of a controller.
pub struct CsManager<'d, R, S, T> {
    settings: CsSettings,
    db: RefCell<CsDatabase<'d>>,
    control: ControlPacketManager,
    events: Channel<NoopRawMutex, CsEvent, EVENT_QUEUE_SIZE>,
    classification: Cell<Option<ChannelClassification>>,
    test: Cell<Option<SchedulerHandle>>,
    scheduler: R,
    security: S,
    timer: T,
}

impl<'d, R: RadioScheduler, S: SecurityModule, T: Timer> CsManager<'d, R, S, T> {
    pub fn new<const CONNS: usize>(
        resources: &'d mut CsResources<CONNS>,
        settings: CsSettings,
        scheduler: R,
        security: S,
        timer: T,
    ) -> Self {
        if settings.capabilities.num_config_supported as usize > CONFIG_SLOTS {
            warn!(
                "[cs][mgr] {} configurations advertised, only {} can be stored",
                settings.capabilities.num_config_supported,
                CONFIG_SLOTS
            );
        }
        let slots = settings.capabilities.num_config_supported;
        Self {
            settings,
            db: RefCell::new(CsDatabase::new(&mut resources.connections[..], slots)),
            control: ControlPacketManager::new(),
            events: Channel::new(),
            classification: Cell::new(None),
            test: Cell::new(None),
            scheduler,
            security,
            timer,
        }
    }

    pub fn settings(&self) -> &CsSettings {
        &self.settings
    }

    /// Wait for the next event for the host.
    pub async fn next_event(&self) -> CsEvent {
        self.events.receive().await
    }

    pub fn try_next_event(&self) -> Option<CsEvent> {
        self.events.try_receive().ok()
    }

    /// Wait for the next control PDU to transmit.
    pub async fn next_control_packet(&self) -> ControlPacket {
        self.control.next().await
    }

    pub fn try_next_control_packet(&self) -> Option<ControlPacket> {
        self.control.try_next()
    }

    fn post(&self, event: CsEvent) {
        trace!("[cs][mgr] event {:?}", event);
        if let Err(TrySendError::Full(event)) = self.events.try_send(event) {
            error!("[cs][mgr] event queue full, dropping {:?}", event);
        }
    }

    /// Validate that Channel Sounding can be used on a connection.
    fn cs_connection(&self, db: &CsDatabase<'_>, handle: ConnHandle) -> Result<LeConnRole, Error> {
        let role = db.role(handle)?;
        if !self.settings.supported || !db.remote_cs_supported(handle)? {
            return Err(Error::FeatureNotSupported);
        }
        Ok(role)
    }

    /// Take the connection's token and send the request starting `procedure`.
    fn begin(
        &self,
        db: &mut CsDatabase<'_>,
        handle: ConnHandle,
        procedure: ControlProcedure,
        pdu: &ControlPdu,
    ) -> Result<(), Error> {
        db.set_in_progress(handle, procedure)?;
        if let Err(e) = self.control.send_request(db, handle, procedure, pdu) {
            db.clear_in_progress(handle);
            return Err(e);
        }
        debug!("[cs][mgr] {:?} started on {:?}", procedure, handle);
        Ok(())
    }

    fn take_scheduled(&self, handle: Option<ConnHandle>) -> Option<SchedulerHandle> {
        self.db.borrow_mut().take_scheduled(handle)
    }

    //
    // Link events
    //

    /// A connection was established.
    pub fn connection_established(&self, handle: ConnHandle, role: LeConnRole) -> Result<(), Error> {
        let defaults = DefaultSettings::new(self.settings.capabilities.roles);
        self.db.borrow_mut().connect(handle, role, defaults)
    }

    /// The peer's feature set is known.
    pub fn remote_features_received(&self, handle: ConnHandle, cs_supported: bool) -> Result<(), Error> {
        self.db.borrow_mut().set_remote_cs_supported(handle, cs_supported)
    }

    pub fn encryption_changed(&self, handle: ConnHandle, encrypted: bool) -> Result<(), Error> {
        self.db.borrow_mut().set_encrypted(handle, encrypted)
    }

    /// The link went away. Completes any outstanding procedure with
    /// [`Error::ConnectionTerminated`] and releases all state of the connection.
    pub fn on_disconnect(&self, handle: ConnHandle, reason: DisconnectReason) {
        let aborted = {
            let mut db = self.db.borrow_mut();
            if !db.is_active(handle) {
                trace!("[cs][mgr] disconnect of unknown connection {:?}", handle);
                return;
            }
            self.control.abort(&mut db, handle)
        };
        if let Some(procedure) = aborted {
            self.fail(handle, procedure, Error::ConnectionTerminated);
        }
        while let Some(scheduled) = self.take_scheduled(Some(handle)) {
            self.scheduler.cancel_procedure(scheduled);
        }
        self.control.purge(handle);
        if let Err(e) = self.db.borrow_mut().disconnect(handle) {
            warn!("[cs][mgr] releasing {:?}: {:?}", handle, e);
        }
        info!("[cs][mgr] connection {:?} closed: {:?}", handle, reason);
    }

    /// Tear down all state, as part of a controller reset.
    pub fn reset(&self) {
        if let Some(test) = self.test.take() {
            self.scheduler.cancel_test(test);
        }
        while let Some(scheduled) = self.take_scheduled(None) {
            self.scheduler.cancel_procedure(scheduled);
        }
        self.db.borrow_mut().clear();
        self.control.clear();
        self.classification.set(None);
        while self.events.try_receive().is_ok() {}
        info!("[cs][mgr] reset");
    }

    //
    // Host operations
    //

    pub fn read_local_supported_capabilities(&self) -> CsCapabilities {
        self.settings.capabilities
    }

    /// Read the capabilities of the peer.
    ///
    /// Returns the cached capabilities if known. Otherwise a capabilities exchange is started and
    /// [`CsEvent::ReadRemoteCapabilitiesComplete`] is posted once it finishes.
    pub fn read_remote_supported_capabilities(&self, handle: ConnHandle) -> Result<Poll<CsCapabilities>, Error> {
        let mut db = self.db.borrow_mut();
        self.cs_connection(&db, handle)?;
        if let Some(caps) = db.remote_capabilities(handle)? {
            return Ok(Poll::Ready(caps));
        }
        self.begin(
            &mut db,
            handle,
            ControlProcedure::CapabilitiesExchange,
            &ControlPdu::CapabilitiesReq(self.settings.capabilities),
        )?;
        Ok(Poll::Pending)
    }

    pub fn set_default_settings(&self, handle: ConnHandle, settings: DefaultSettings) -> Result<(), Error> {
        let mut db = self.db.borrow_mut();
        self.cs_connection(&db, handle)?;
        settings.check(&self.settings.capabilities)?;
        for slot in db.configs(handle)? {
            if !settings.roles.contains(slot.config.params.role.into()) {
                return Err(Error::UnexpectedParameter);
            }
        }
        db.set_default_settings(handle, settings)
    }

    /// Start CS security. Only the central of an encrypted connection may do so.
    pub fn security_enable(&self, handle: ConnHandle) -> Result<(), Error> {
        let mut db = self.db.borrow_mut();
        if self.cs_connection(&db, handle)? != LeConnRole::Central || !db.is_encrypted(handle)? {
            return Err(Error::CommandDisallowed);
        }
        if db.in_progress(handle)?.is_some() {
            return Err(Error::CommandDisallowed);
        }
        let vectors = self.security.generate_security_vectors(handle)?;
        self.begin(
            &mut db,
            handle,
            ControlProcedure::SecurityStart,
            &ControlPdu::SecurityReq(vectors),
        )?;
        db.set_pending_security(handle, vectors)
    }

    pub fn read_local_fae_table(&self) -> Result<FaeTable, Error> {
        if !self.settings.supported || self.settings.capabilities.no_fae {
            return Err(Error::FeatureNotSupported);
        }
        Ok(self.settings.fae_table)
    }

    /// Read the FAE table of the peer, from cache or through an FAE exchange.
    pub fn read_remote_fae_table(&self, handle: ConnHandle) -> Result<Poll<FaeTable>, Error> {
        let mut db = self.db.borrow_mut();
        self.cs_connection(&db, handle)?;
        if let Some(table) = db.remote_fae_table(handle)? {
            return Ok(Poll::Ready(table));
        }
        if db.remote_capabilities(handle)?.map(|c| c.no_fae).unwrap_or(false) {
            return Err(Error::FeatureNotSupported);
        }
        self.begin(&mut db, handle, ControlProcedure::FaeTableUpdate, &ControlPdu::FaeReq)?;
        Ok(Poll::Pending)
    }

    /// Store a peer FAE table obtained out of band.
    pub fn write_remote_fae_table(&self, handle: ConnHandle, table: FaeTable) -> Result<(), Error> {
        self.db.borrow_mut().set_remote_fae_table(handle, table)
    }

    /// Create a configuration.
    ///
    /// With `create_context` the peer is configured through a config exchange and the result is
    /// reported with [`CsEvent::ConfigComplete`]. Otherwise the configuration is only stored locally.
    pub fn create_config(
        &self,
        handle: ConnHandle,
        config_id: u8,
        params: ConfigParams,
        create_context: bool,
    ) -> Result<Poll<CsConfiguration>, Error> {
        let mut db = self.db.borrow_mut();
        self.cs_connection(&db, handle)?;
        if config_id >= db.config_slots() {
            return Err(Error::UnexpectedParameter);
        }
        if db.config(handle, config_id).is_ok()
            || db.in_progress(handle)? == Some(ControlProcedure::ConfigCreate(config_id))
        {
            return Err(Error::CommandDisallowed);
        }

        let local = &self.settings.capabilities;
        let remote = db.remote_capabilities(handle)?;
        params.check(local, remote.as_ref(), &db.default_settings(handle)?)?;
        if create_context && remote.is_none() {
            return Err(Error::CommandDisallowed);
        }

        let config = CsConfiguration {
            id: config_id,
            params,
            timing: Timing::negotiate(local, remote.as_ref()),
        };
        if create_context {
            self.begin(
                &mut db,
                handle,
                ControlProcedure::ConfigCreate(config_id),
                &ControlPdu::ConfigReq(config),
            )?;
            db.set_pending_config(handle, config)?;
            Ok(Poll::Pending)
        } else {
            db.create_config(handle, config)?;
            Ok(Poll::Ready(config))
        }
    }

    pub fn remove_config(&self, handle: ConnHandle, config_id: u8) -> Result<(), Error> {
        let mut db = self.db.borrow_mut();
        if Self::enable_pending(&db, handle, config_id)? {
            return Err(Error::CommandDisallowed);
        }
        db.remove_config(handle, config_id).map(|_| ())
    }

    /// Whether procedures of the configuration are being started or stopped.
    fn enable_pending(db: &CsDatabase<'_>, handle: ConnHandle, config_id: u8) -> Result<bool, Error> {
        Ok(matches!(
            db.in_progress(handle)?,
            Some(ControlProcedure::ProcedureStart(id) | ControlProcedure::ProcedureTerminate(id)) if id == config_id
        ))
    }

    /// Record the host's channel classification.
    ///
    /// As central, the map is forwarded to every idle peer that supports Channel Sounding. The host
    /// is expected to update at most once per second; this is logged, not enforced.
    pub fn set_channel_classification(&self, map: ChannelMap) -> Result<(), Error> {
        if !self.settings.supported {
            return Err(Error::FeatureNotSupported);
        }
        if !map.is_valid() {
            return Err(Error::UnexpectedParameter);
        }
        let now = self.timer.now();
        if let Some(elapsed) = self
            .classification
            .get()
            .and_then(|previous| now.checked_duration_since(previous.updated))
        {
            if elapsed < CLASSIFICATION_MIN_INTERVAL {
                warn!(
                    "[cs][mgr] channel classification updated after {} ms",
                    elapsed.as_millis()
                );
            }
        }
        self.classification.set(Some(ChannelClassification { map, updated: now }));

        let db = self.db.borrow();
        for handle in db.handles() {
            let idle_peer = db.role(handle) == Ok(LeConnRole::Central)
                && db.remote_cs_supported(handle) == Ok(true)
                && matches!(db.remote_capabilities(handle), Ok(Some(_)))
                && db.in_progress(handle) == Ok(None);
            if idle_peer {
                if let Err(e) = self.control.send(handle, &ControlPdu::ChannelMapInd(map)) {
                    warn!("[cs][mgr] channel map not sent on {:?}: {:?}", handle, e);
                }
            }
        }
        Ok(())
    }

    /// Replace the procedure parameters of a disabled configuration.
    pub fn set_procedure_parameters(
        &self,
        handle: ConnHandle,
        config_id: u8,
        params: ProcedureParameters,
    ) -> Result<(), Error> {
        let mut db = self.db.borrow_mut();
        self.cs_connection(&db, handle)?;
        let (role, enabled) = {
            let slot = db.config(handle, config_id)?;
            (slot.config.params.role, slot.is_enabled())
        };
        if enabled || Self::enable_pending(&db, handle, config_id)? {
            return Err(Error::CommandDisallowed);
        }
        params.check(role, &self.settings.capabilities, db.remote_capabilities(handle)?.as_ref())?;
        db.set_procedure_parameters(handle, config_id, params)
    }

    /// Enable or disable procedures for a configuration.
    ///
    /// The outcome is reported with [`CsEvent::ProcedureEnableComplete`].
    pub fn procedure_enable(&self, handle: ConnHandle, config_id: u8, enable: bool) -> Result<(), Error> {
        let mut db = self.db.borrow_mut();
        self.cs_connection(&db, handle)?;
        if db.in_progress(handle)?.is_some() {
            return Err(Error::CommandDisallowed);
        }
        let (enabled, params) = {
            let slot = db.config(handle, config_id)?;
            (slot.is_enabled(), slot.params)
        };

        if enable {
            if enabled || db.enabled_config(handle)?.is_some() || db.security_context(handle)?.is_none() {
                return Err(Error::CommandDisallowed);
            }
            let params = params.ok_or(Error::CommandDisallowed)?;
            if self.test.get().is_some() {
                return Err(Error::CommandDisallowed);
            }
            self.begin(
                &mut db,
                handle,
                ControlProcedure::ProcedureStart(config_id),
                &ControlPdu::CsReq { config_id, params },
            )
        } else {
            if !enabled {
                return Err(Error::CommandDisallowed);
            }
            self.begin(
                &mut db,
                handle,
                ControlProcedure::ProcedureTerminate(config_id),
                &ControlPdu::TerminateReq {
                    config_id,
                    procedure_count: 0,
                    error: TERMINATED_BY_HOST,
                },
            )
        }
    }

    /// Start a loop-back test on the radio.
    pub fn test(&self, params: &TestParams) -> Result<(), Error> {
        if !self.settings.supported {
            return Err(Error::FeatureNotSupported);
        }
        if self.test.get().is_some() || self.db.borrow().any_enabled() {
            return Err(Error::CommandDisallowed);
        }
        params.check(&self.settings.capabilities)?;
        let scheduled = self.scheduler.schedule_test(params)?;
        self.test.set(Some(scheduled));
        info!("[cs][mgr] test started");
        Ok(())
    }

    /// Stop the running test. Completion is reported with [`CsEvent::TestEndComplete`].
    pub fn test_end(&self) -> Result<(), Error> {
        if !self.settings.supported {
            return Err(Error::FeatureNotSupported);
        }
        let scheduled = self.test.take().ok_or(Error::CommandDisallowed)?;
        self.scheduler.cancel_test(scheduled);
        self.post(CsEvent::TestEndComplete { result: Ok(()) });
        Ok(())
    }

    //
    // Scheduler callbacks
    //

    /// Forward subevent results of an enabled configuration.
    pub fn on_subevent_result(&self, handle: ConnHandle, config_id: u8, data: &[u8]) {
        let enabled = self
            .db
            .borrow()
            .config(handle, config_id)
            .map(|s| s.is_enabled())
            .unwrap_or(false);
        if !enabled {
            warn!("[cs][mgr] dropping subevent result for {:?} config {}", handle, config_id);
            return;
        }
        match heapless::Vec::from_slice(data) {
            Ok(data) => self.post(CsEvent::SubeventResult {
                handle,
                config_id,
                data,
            }),
            Err(_) => error!("[cs][mgr] subevent result of {} bytes too large", data.len()),
        }
    }

    pub fn on_test_subevent_result(&self, data: &[u8]) {
        if self.test.get().is_none() {
            warn!("[cs][mgr] dropping test subevent result, no test running");
            return;
        }
        match heapless::Vec::from_slice(data) {
            Ok(data) => self.post(CsEvent::TestSubeventResult { data }),
            Err(_) => error!("[cs][mgr] test subevent result of {} bytes too large", data.len()),
        }
    }

    //
    // Control procedures
    //

    /// Handle a control PDU received from the peer.
    pub fn on_control_pdu(&self, handle: ConnHandle, data: &[u8]) {
        let received = {
            let mut db = self.db.borrow_mut();
            self.control.receive(&mut db, handle, data)
        };
        match received {
            None => {}
            Some(Received::Completed {
                procedure,
                result: Err(e),
            }) => self.fail(handle, procedure, e),
            Some(Received::Completed {
                procedure,
                result: Ok(pdu),
            }) => self.complete(handle, procedure, pdu),
            Some(Received::Request(pdu)) => {
                let opcode = pdu.opcode();
                if let Err(e) = self.respond(handle, pdu) {
                    warn!("[cs][mgr] rejecting {} on {:?}: {:?}", opcode, handle, e);
                    self.control.reject(handle, opcode, e);
                }
            }
            Some(Received::Preempted { procedure, request }) => self.preempted(handle, procedure, request),
        }
    }

    /// Serve the central's request in place of our own procedure of the same kind.
    ///
    /// Serving posts the completion when both name the same procedure. Otherwise our procedure
    /// is reported as disallowed.
    fn preempted(&self, handle: ConnHandle, procedure: ControlProcedure, request: ControlPdu) {
        {
            let mut db = self.db.borrow_mut();
            db.take_pending_config(handle);
            db.take_pending_security(handle);
        }
        let served = request.requested();
        let opcode = request.opcode();
        debug!("[cs][mgr] {:?} on {:?} preempted by central", procedure, handle);
        match self.respond(handle, request) {
            Ok(()) if served == Some(procedure) => {}
            Ok(()) => self.fail(handle, procedure, Error::CommandDisallowed),
            Err(e) => {
                warn!("[cs][mgr] rejecting {} on {:?}: {:?}", opcode, handle, e);
                self.control.reject(handle, opcode, e);
                self.fail(handle, procedure, e);
            }
        }
    }

    /// Report a procedure that ended without success.
    fn fail(&self, handle: ConnHandle, procedure: ControlProcedure, error: Error) {
        let event = match procedure {
            ControlProcedure::CapabilitiesExchange => CsEvent::ReadRemoteCapabilitiesComplete {
                handle,
                result: Err(error),
            },
            ControlProcedure::SecurityStart => {
                self.db.borrow_mut().take_pending_security(handle);
                CsEvent::SecurityEnableComplete {
                    handle,
                    result: Err(error),
                }
            }
            ControlProcedure::FaeTableUpdate => CsEvent::ReadRemoteFaeTableComplete {
                handle,
                result: Err(error),
            },
            ControlProcedure::ConfigCreate(config_id) => {
                self.db.borrow_mut().take_pending_config(handle);
                CsEvent::ConfigComplete {
                    handle,
                    config_id,
                    result: Err(error),
                }
            }
            ControlProcedure::ProcedureStart(config_id) => CsEvent::ProcedureEnableComplete {
                handle,
                config_id,
                enabled: true,
                result: Err(error),
            },
            ControlProcedure::ProcedureTerminate(config_id) => {
                let enabled = self
                    .db
                    .borrow()
                    .config(handle, config_id)
                    .map(|s| s.is_enabled())
                    .unwrap_or(false);
                if !enabled {
                    warn!("[cs][mgr] peer config {} on {:?} not stopped: {:?}", config_id, handle, error);
                    return;
                }
                CsEvent::ProcedureEnableComplete {
                    handle,
                    config_id,
                    enabled: false,
                    result: Err(error),
                }
            }
        };
        debug!("[cs][mgr] {:?} failed on {:?}: {:?}", procedure, handle, error);
        self.post(event);
    }

    /// Finish a procedure after the peer's response.
    fn complete(&self, handle: ConnHandle, procedure: ControlProcedure, pdu: ControlPdu) {
        debug!("[cs][mgr] {:?} completed on {:?}", procedure, handle);
        let event = match pdu {
            ControlPdu::CapabilitiesRsp(caps) => {
                let stored = self.db.borrow().remote_capabilities(handle).ok().flatten();
                CsEvent::ReadRemoteCapabilitiesComplete {
                    handle,
                    result: Ok(stored.unwrap_or(caps)),
                }
            }
            ControlPdu::SecurityRsp(peripheral) => {
                let mut db = self.db.borrow_mut();
                let result = match db.take_pending_security(handle) {
                    Some(central) => db.set_security_context(handle, SecurityContext::combine(&central, &peripheral)),
                    None => Err(Error::CommandDisallowed),
                };
                CsEvent::SecurityEnableComplete { handle, result }
            }
            ControlPdu::FaeRsp(table) => CsEvent::ReadRemoteFaeTableComplete {
                handle,
                result: Ok(table),
            },
            ControlPdu::ConfigRsp { config_id } => {
                let mut db = self.db.borrow_mut();
                let result = match db.take_pending_config(handle) {
                    Some(config) if config.id == config_id => db.create_config(handle, config).map(|_| config),
                    _ => Err(Error::UnexpectedParameter),
                };
                CsEvent::ConfigComplete {
                    handle,
                    config_id,
                    result,
                }
            }
            ControlPdu::CsRsp { config_id } => {
                let result = self.start_procedure(handle, config_id, None);
                if let Err(e) = result {
                    self.terminate_peer(handle, config_id, e);
                }
                CsEvent::ProcedureEnableComplete {
                    handle,
                    config_id,
                    enabled: true,
                    result,
                }
            }
            ControlPdu::TerminateRsp { config_id, .. } => {
                if !self.stop_procedure(handle, config_id) {
                    debug!("[cs][mgr] peer stopped config {} on {:?}", config_id, handle);
                    return;
                }
                CsEvent::ProcedureEnableComplete {
                    handle,
                    config_id,
                    enabled: false,
                    result: Ok(()),
                }
            }
            other => {
                warn!("[cs][mgr] {} does not complete a procedure", other.opcode());
                return;
            }
        };
        self.post(event);
    }

    /// Hand an enabled configuration to the radio scheduler.
    ///
    /// With `params` the configuration's procedure parameters are replaced once scheduling succeeds.
    fn start_procedure(
        &self,
        handle: ConnHandle,
        config_id: u8,
        params: Option<ProcedureParameters>,
    ) -> Result<(), Error> {
        let (config, params) = {
            let db = self.db.borrow();
            let slot = db.config(handle, config_id)?;
            if slot.is_enabled() {
                return Err(Error::CommandDisallowed);
            }
            (slot.config, params.or(slot.params).ok_or(Error::CommandDisallowed)?)
        };
        let scheduled = self.scheduler.schedule_procedure(handle, &config, &params)?;
        let stored = {
            let mut db = self.db.borrow_mut();
            db.set_procedure_parameters(handle, config_id, params)
                .and_then(|_| db.set_enabled(handle, config_id, Some(scheduled)))
        };
        if let Err(e) = stored {
            self.scheduler.cancel_procedure(scheduled);
            return Err(e);
        }
        info!("[cs][mgr] procedures enabled on {:?} config {}", handle, config_id);
        Ok(())
    }

    /// Stop the peer's procedures after they could not be scheduled locally.
    ///
    /// The host already got the enable failure, so the terminate completes silently.
    fn terminate_peer(&self, handle: ConnHandle, config_id: u8, error: Error) {
        let mut db = self.db.borrow_mut();
        let terminate = ControlPdu::TerminateReq {
            config_id,
            procedure_count: 0,
            error: error.into(),
        };
        if let Err(e) = self.begin(&mut db, handle, ControlProcedure::ProcedureTerminate(config_id), &terminate) {
            error!("[cs][mgr] unable to stop peer config {} on {:?}: {:?}", config_id, handle, e);
        }
    }

    /// Stop scheduling a configuration, returning whether it was enabled.
    fn stop_procedure(&self, handle: ConnHandle, config_id: u8) -> bool {
        let scheduled = {
            let mut db = self.db.borrow_mut();
            let scheduled = db.config(handle, config_id).ok().and_then(|s| s.enabled);
            if scheduled.is_some() {
                unwrap!(db.set_enabled(handle, config_id, None));
            }
            scheduled
        };
        match scheduled {
            Some(scheduled) => {
                self.scheduler.cancel_procedure(scheduled);
                info!("[cs][mgr] procedures disabled on {:?} config {}", handle, config_id);
                true
            }
            None => false,
        }
    }

    /// Serve a procedure started by the peer.
    fn respond(&self, handle: ConnHandle, pdu: ControlPdu) -> Result<(), Error> {
        if !self.settings.supported {
            return Err(Error::FeatureNotSupported);
        }
        match pdu {
            ControlPdu::CapabilitiesReq(caps) => self.respond_capabilities(handle, caps),
            ControlPdu::SecurityReq(central) => self.respond_security(handle, central),
            ControlPdu::FaeReq => {
                if self.settings.capabilities.no_fae {
                    return Err(Error::FeatureNotSupported);
                }
                self.control.send(handle, &ControlPdu::FaeRsp(self.settings.fae_table))
            }
            ControlPdu::ConfigReq(config) => self.respond_config(handle, config),
            ControlPdu::CsReq { config_id, params } => self.respond_procedure_start(handle, config_id, params),
            ControlPdu::TerminateReq {
                config_id,
                procedure_count,
                ..
            } => self.respond_terminate(handle, config_id, procedure_count),
            ControlPdu::ChannelMapInd(map) => {
                self.on_channel_map(handle, map);
                Ok(())
            }
            other => {
                warn!("[cs][mgr] ignoring {} on {:?}", other.opcode(), handle);
                Ok(())
            }
        }
    }

    fn respond_capabilities(&self, handle: ConnHandle, caps: CsCapabilities) -> Result<(), Error> {
        self.control
            .send(handle, &ControlPdu::CapabilitiesRsp(self.settings.capabilities))?;
        if let Err(e) = self.db.borrow_mut().set_remote_capabilities(handle, caps) {
            debug!("[cs][mgr] peer capabilities already known on {:?}: {:?}", handle, e);
        }
        self.post(CsEvent::ReadRemoteCapabilitiesComplete {
            handle,
            result: Ok(caps),
        });
        Ok(())
    }

    fn respond_security(&self, handle: ConnHandle, central: SecurityVectors) -> Result<(), Error> {
        {
            let db = self.db.borrow();
            if db.role(handle)? != LeConnRole::Peripheral || !db.is_encrypted(handle)? {
                return Err(Error::CommandDisallowed);
            }
        }
        let peripheral = self.security.generate_security_vectors(handle)?;
        self.control.send(handle, &ControlPdu::SecurityRsp(peripheral))?;
        self.db
            .borrow_mut()
            .set_security_context(handle, SecurityContext::combine(&central, &peripheral))?;
        self.post(CsEvent::SecurityEnableComplete { handle, result: Ok(()) });
        Ok(())
    }

    fn respond_config(&self, handle: ConnHandle, config: CsConfiguration) -> Result<(), Error> {
        let config = CsConfiguration {
            params: config.params.for_peer(),
            ..config
        };
        {
            let mut db = self.db.borrow_mut();
            if config.id >= db.config_slots() {
                return Err(Error::UnexpectedParameter);
            }
            let existing = match db.config(handle, config.id) {
                Ok(slot) if slot.is_enabled() => return Err(Error::CommandDisallowed),
                Ok(_) => true,
                Err(_) => false,
            };
            let remote = db.remote_capabilities(handle)?;
            config
                .params
                .check(&self.settings.capabilities, remote.as_ref(), &db.default_settings(handle)?)?;

            self.control.send(handle, &ControlPdu::ConfigRsp { config_id: config.id })?;
            if existing {
                db.remove_config(handle, config.id)?;
            }
            db.create_config(handle, config)?;
        }
        self.post(CsEvent::ConfigComplete {
            handle,
            config_id: config.id,
            result: Ok(config),
        });
        Ok(())
    }

    fn respond_procedure_start(
        &self,
        handle: ConnHandle,
        config_id: u8,
        params: ProcedureParameters,
    ) -> Result<(), Error> {
        {
            let db = self.db.borrow();
            if db.security_context(handle)?.is_none() {
                return Err(Error::CommandDisallowed);
            }
            let slot = db.config(handle, config_id)?;
            if db.enabled_config(handle)?.is_some() || self.test.get().is_some() {
                return Err(Error::CommandDisallowed);
            }
            params.check(
                slot.config.params.role,
                &self.settings.capabilities,
                db.remote_capabilities(handle)?.as_ref(),
            )?;
        }
        self.start_procedure(handle, config_id, Some(params))?;
        if let Err(e) = self.control.send(handle, &ControlPdu::CsRsp { config_id }) {
            self.stop_procedure(handle, config_id);
            return Err(e);
        }
        self.post(CsEvent::ProcedureEnableComplete {
            handle,
            config_id,
            enabled: true,
            result: Ok(()),
        });
        Ok(())
    }

    fn respond_terminate(&self, handle: ConnHandle, config_id: u8, procedure_count: u16) -> Result<(), Error> {
        if !self.db.borrow().config(handle, config_id)?.is_enabled() {
            return Err(Error::CommandDisallowed);
        }
        self.control.send(
            handle,
            &ControlPdu::TerminateRsp {
                config_id,
                procedure_count,
                error: 0,
            },
        )?;
        self.stop_procedure(handle, config_id);
        self.post(CsEvent::ProcedureEnableComplete {
            handle,
            config_id,
            enabled: false,
            result: Ok(()),
        });
        Ok(())
    }

    fn on_channel_map(&self, handle: ConnHandle, map: ChannelMap) {
        let mut db = self.db.borrow_mut();
        if db.role(handle) != Ok(LeConnRole::Peripheral) {
            warn!("[cs][mgr] channel map on {:?} ignored, not peripheral", handle);
            return;
        }
        if !map.is_valid() {
            warn!("[cs][mgr] invalid channel map from {:?} ignored", handle);
            return;
        }
        unwrap!(db.set_channel_map(handle, map));
    }

    //
    // State inspection
    //

    pub fn is_connected(&self, handle: ConnHandle) -> bool {
        self.db.borrow().is_active(handle)
    }

    pub fn in_progress(&self, handle: ConnHandle) -> Result<Option<ControlProcedure>, Error> {
        self.db.borrow().in_progress(handle)
    }

    pub fn config(&self, handle: ConnHandle, config_id: u8) -> Result<CsConfiguration, Error> {
        self.db.borrow().config(handle, config_id).map(|s| s.config)
    }

    pub fn procedure_parameters(
        &self,
        handle: ConnHandle,
        config_id: u8,
    ) -> Result<Option<ProcedureParameters>, Error> {
        self.db.borrow().config(handle, config_id).map(|s| s.params)
    }

    pub fn is_procedure_enabled(&self, handle: ConnHandle, config_id: u8) -> Result<bool, Error> {
        self.db.borrow().config(handle, config_id).map(|s| s.is_enabled())
    }

    pub fn default_settings(&self, handle: ConnHandle) -> Result<DefaultSettings, Error> {
        self.db.borrow().default_settings(handle)
    }

    pub fn security_context(&self, handle: ConnHandle) -> Result<Option<SecurityContext>, Error> {
        self.db.borrow().security_context(handle)
    }

    /// Channel map last indicated by the central of this connection.
    pub fn remote_channel_map(&self, handle: ConnHandle) -> Result<Option<ChannelMap>, Error> {
        self.db.borrow().channel_map(handle)
    }

    pub fn channel_classification(&self) -> Option<ChannelClassification> {
        self.classification.get()
    }

    pub fn is_test_running(&self) -> bool {
        self.test.get().is_some()
    }
}
