//! Per-connection Channel Sounding state.

use bt_hci::param::{ConnHandle, LeConnRole};

use crate::config::CONFIG_SLOTS;
use crate::control::ControlProcedure;
use crate::scheduler::SchedulerHandle;
use crate::types::capabilities::{CsCapabilities, DefaultSettings, RoleSet};
use crate::types::config::{ChannelMap, CsConfiguration};
use crate::types::fae::FaeTable;
use crate::types::procedure::ProcedureParameters;
use crate::types::security::{SecurityContext, SecurityVectors};
use crate::Error;

/// A created configuration and its procedure state.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct ConfigSlot {
    pub(crate) config: CsConfiguration,
    pub(crate) params: Option<ProcedureParameters>,
    pub(crate) enabled: Option<SchedulerHandle>,
}

impl ConfigSlot {
    fn new(config: CsConfiguration) -> Self {
        Self {
            config,
            params: None,
            enabled: None,
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.is_some()
    }
}

/// Storage for the Channel Sounding state of one connection.
#[derive(Debug)]
pub struct ConnectionStorage {
    pub(crate) handle: Option<ConnHandle>,
    pub(crate) role: Option<LeConnRole>,
    pub(crate) remote_cs_supported: bool,
    pub(crate) encrypted: bool,
    pub(crate) remote_capabilities: Option<CsCapabilities>,
    pub(crate) remote_fae: Option<FaeTable>,
    pub(crate) default_settings: DefaultSettings,
    pub(crate) security: Option<SecurityContext>,
    pub(crate) pending_security: Option<SecurityVectors>,
    pub(crate) pending_config: Option<CsConfiguration>,
    pub(crate) channel_map: Option<ChannelMap>,
    pub(crate) configs: [Option<ConfigSlot>; CONFIG_SLOTS],
    pub(crate) in_progress: Option<ControlProcedure>,
}

const EMPTY_SLOT: Option<ConfigSlot> = None;

impl ConnectionStorage {
    pub(crate) const DISCONNECTED: ConnectionStorage = ConnectionStorage {
        handle: None,
        role: None,
        remote_cs_supported: false,
        encrypted: false,
        remote_capabilities: None,
        remote_fae: None,
        default_settings: DefaultSettings::new(RoleSet::NONE),
        security: None,
        pending_security: None,
        pending_config: None,
        channel_map: None,
        configs: [EMPTY_SLOT; CONFIG_SLOTS],
        in_progress: None,
    };
}

#[cfg(feature = "defmt")]
impl defmt::Format for ConnectionStorage {
    fn format(&self, f: defmt::Formatter<'_>) {
        defmt::write!(
            f,
            "conn = {}, role = {:?}, remote cs = {}, encrypted = {}, security = {}, in progress = {:?}",
            self.handle,
            self.role,
            self.remote_cs_supported,
            self.encrypted,
            self.security.is_some(),
            self.in_progress,
        );
    }
}

pub(crate) struct CsDatabase<'d> {
    connections: &'d mut [ConnectionStorage],
    config_slots: u8,
}

impl<'d> CsDatabase<'d> {
    /// Create a database advertising `config_slots` configurations per connection.
    pub(crate) fn new(connections: &'d mut [ConnectionStorage], config_slots: u8) -> Self {
        Self {
            connections,
            config_slots: config_slots.min(CONFIG_SLOTS as u8),
        }
    }

    pub(crate) fn config_slots(&self) -> u8 {
        self.config_slots
    }

    fn print(&self) {
        for (idx, storage) in self.connections.iter().enumerate() {
            if storage.handle.is_some() {
                trace!("[cs][db][idx = {}] {:?}", idx, storage);
            }
        }
    }

    fn find(&self, handle: ConnHandle) -> Result<&ConnectionStorage, Error> {
        self.connections
            .iter()
            .find(|c| c.handle == Some(handle))
            .ok_or(Error::InactiveConnection)
    }

    fn find_mut(&mut self, handle: ConnHandle) -> Result<&mut ConnectionStorage, Error> {
        self.connections
            .iter_mut()
            .find(|c| c.handle == Some(handle))
            .ok_or(Error::InactiveConnection)
    }

    /// Allocate a partition for a new connection.
    pub(crate) fn connect(&mut self, handle: ConnHandle, role: LeConnRole, defaults: DefaultSettings) -> Result<(), Error> {
        if self.find(handle).is_ok() {
            return Err(Error::CommandDisallowed);
        }
        let storage = self
            .connections
            .iter_mut()
            .find(|c| c.handle.is_none())
            .ok_or(Error::InsufficientResources)?;
        *storage = ConnectionStorage::DISCONNECTED;
        storage.handle = Some(handle);
        storage.role = Some(role);
        storage.default_settings = defaults;
        debug!("[cs][db] connection {:?} added as {:?}", handle, role);
        self.print();
        Ok(())
    }

    /// Release every piece of state held for a connection.
    pub(crate) fn disconnect(&mut self, handle: ConnHandle) -> Result<(), Error> {
        let storage = self.find_mut(handle)?;
        *storage = ConnectionStorage::DISCONNECTED;
        debug!("[cs][db] connection {:?} released", handle);
        Ok(())
    }

    pub(crate) fn clear(&mut self) {
        for storage in self.connections.iter_mut() {
            *storage = ConnectionStorage::DISCONNECTED;
        }
    }

    pub(crate) fn is_active(&self, handle: ConnHandle) -> bool {
        self.find(handle).is_ok()
    }

    pub(crate) fn handles(&self) -> impl Iterator<Item = ConnHandle> + '_ {
        self.connections.iter().filter_map(|c| c.handle)
    }

    pub(crate) fn role(&self, handle: ConnHandle) -> Result<LeConnRole, Error> {
        self.find(handle)?.role.ok_or(Error::InactiveConnection)
    }

    pub(crate) fn remote_cs_supported(&self, handle: ConnHandle) -> Result<bool, Error> {
        Ok(self.find(handle)?.remote_cs_supported)
    }

    pub(crate) fn set_remote_cs_supported(&mut self, handle: ConnHandle, supported: bool) -> Result<(), Error> {
        self.find_mut(handle)?.remote_cs_supported = supported;
        Ok(())
    }

    pub(crate) fn is_encrypted(&self, handle: ConnHandle) -> Result<bool, Error> {
        Ok(self.find(handle)?.encrypted)
    }

    pub(crate) fn set_encrypted(&mut self, handle: ConnHandle, encrypted: bool) -> Result<(), Error> {
        self.find_mut(handle)?.encrypted = encrypted;
        Ok(())
    }

    pub(crate) fn security_context(&self, handle: ConnHandle) -> Result<Option<SecurityContext>, Error> {
        Ok(self.find(handle)?.security)
    }

    pub(crate) fn set_security_context(&mut self, handle: ConnHandle, context: SecurityContext) -> Result<(), Error> {
        self.find_mut(handle)?.security = Some(context);
        Ok(())
    }

    pub(crate) fn remote_capabilities(&self, handle: ConnHandle) -> Result<Option<CsCapabilities>, Error> {
        Ok(self.find(handle)?.remote_capabilities)
    }

    /// Remote capabilities are written once per connection.
    pub(crate) fn set_remote_capabilities(&mut self, handle: ConnHandle, caps: CsCapabilities) -> Result<(), Error> {
        let storage = self.find_mut(handle)?;
        if storage.remote_capabilities.is_some() {
            return Err(Error::CommandDisallowed);
        }
        storage.remote_capabilities = Some(caps);
        Ok(())
    }

    pub(crate) fn remote_fae_table(&self, handle: ConnHandle) -> Result<Option<FaeTable>, Error> {
        Ok(self.find(handle)?.remote_fae)
    }

    pub(crate) fn set_remote_fae_table(&mut self, handle: ConnHandle, table: FaeTable) -> Result<(), Error> {
        self.find_mut(handle)?.remote_fae = Some(table);
        Ok(())
    }

    pub(crate) fn default_settings(&self, handle: ConnHandle) -> Result<DefaultSettings, Error> {
        Ok(self.find(handle)?.default_settings)
    }

    pub(crate) fn set_default_settings(&mut self, handle: ConnHandle, settings: DefaultSettings) -> Result<(), Error> {
        self.find_mut(handle)?.default_settings = settings;
        Ok(())
    }

    pub(crate) fn channel_map(&self, handle: ConnHandle) -> Result<Option<ChannelMap>, Error> {
        Ok(self.find(handle)?.channel_map)
    }

    pub(crate) fn set_channel_map(&mut self, handle: ConnHandle, map: ChannelMap) -> Result<(), Error> {
        self.find_mut(handle)?.channel_map = Some(map);
        Ok(())
    }

    pub(crate) fn set_pending_config(&mut self, handle: ConnHandle, config: CsConfiguration) -> Result<(), Error> {
        self.find_mut(handle)?.pending_config = Some(config);
        Ok(())
    }

    pub(crate) fn take_pending_config(&mut self, handle: ConnHandle) -> Option<CsConfiguration> {
        self.find_mut(handle).ok().and_then(|s| s.pending_config.take())
    }

    pub(crate) fn set_pending_security(&mut self, handle: ConnHandle, vectors: SecurityVectors) -> Result<(), Error> {
        self.find_mut(handle)?.pending_security = Some(vectors);
        Ok(())
    }

    pub(crate) fn take_pending_security(&mut self, handle: ConnHandle) -> Option<SecurityVectors> {
        self.find_mut(handle).ok().and_then(|s| s.pending_security.take())
    }

    pub(crate) fn in_progress(&self, handle: ConnHandle) -> Result<Option<ControlProcedure>, Error> {
        Ok(self.find(handle)?.in_progress)
    }

    /// Take the control procedure token of a connection.
    pub(crate) fn set_in_progress(&mut self, handle: ConnHandle, procedure: ControlProcedure) -> Result<(), Error> {
        let storage = self.find_mut(handle)?;
        if let Some(current) = storage.in_progress {
            debug!("[cs][db] connection {:?} busy with {:?}", handle, current);
            return Err(Error::CommandDisallowed);
        }
        storage.in_progress = Some(procedure);
        Ok(())
    }

    pub(crate) fn clear_in_progress(&mut self, handle: ConnHandle) -> Option<ControlProcedure> {
        self.find_mut(handle).ok().and_then(|s| s.in_progress.take())
    }

    fn slot_mut(&mut self, handle: ConnHandle, config_id: u8) -> Result<&mut Option<ConfigSlot>, Error> {
        let config_slots = self.config_slots;
        let storage = self.find_mut(handle)?;
        if config_id >= config_slots {
            return Err(Error::UnexpectedParameter);
        }
        storage
            .configs
            .get_mut(config_id as usize)
            .ok_or(Error::UnexpectedParameter)
    }

    pub(crate) fn config(&self, handle: ConnHandle, config_id: u8) -> Result<&ConfigSlot, Error> {
        self.find(handle)?
            .configs
            .get(config_id as usize)
            .and_then(|s| s.as_ref())
            .ok_or(Error::UnexpectedParameter)
    }

    pub(crate) fn configs(&self, handle: ConnHandle) -> Result<impl Iterator<Item = &ConfigSlot>, Error> {
        Ok(self.find(handle)?.configs.iter().flatten())
    }

    pub(crate) fn create_config(&mut self, handle: ConnHandle, config: CsConfiguration) -> Result<(), Error> {
        let slot = self.slot_mut(handle, config.id)?;
        if slot.is_some() {
            return Err(Error::CommandDisallowed);
        }
        *slot = Some(ConfigSlot::new(config));
        debug!("[cs][db] connection {:?} config {} created", handle, config.id);
        Ok(())
    }

    pub(crate) fn remove_config(&mut self, handle: ConnHandle, config_id: u8) -> Result<CsConfiguration, Error> {
        let slot = self.slot_mut(handle, config_id)?;
        if slot.as_ref().ok_or(Error::UnexpectedParameter)?.is_enabled() {
            return Err(Error::CommandDisallowed);
        }
        let removed = slot.take().map(|s| s.config).ok_or(Error::UnexpectedParameter)?;
        debug!("[cs][db] connection {:?} config {} removed", handle, config_id);
        Ok(removed)
    }

    /// Replace the procedure parameters of a disabled configuration.
    pub(crate) fn set_procedure_parameters(
        &mut self,
        handle: ConnHandle,
        config_id: u8,
        params: ProcedureParameters,
    ) -> Result<(), Error> {
        let slot = self
            .slot_mut(handle, config_id)?
            .as_mut()
            .ok_or(Error::UnexpectedParameter)?;
        if slot.is_enabled() {
            return Err(Error::CommandDisallowed);
        }
        slot.params = Some(params);
        Ok(())
    }

    /// Mark a configuration enabled while `scheduled` is set.
    pub(crate) fn set_enabled(
        &mut self,
        handle: ConnHandle,
        config_id: u8,
        scheduled: Option<SchedulerHandle>,
    ) -> Result<(), Error> {
        let slot = self
            .slot_mut(handle, config_id)?
            .as_mut()
            .ok_or(Error::UnexpectedParameter)?;
        slot.enabled = scheduled;
        Ok(())
    }

    pub(crate) fn enabled_config(&self, handle: ConnHandle) -> Result<Option<u8>, Error> {
        Ok(self.configs(handle)?.find(|s| s.is_enabled()).map(|s| s.config.id))
    }

    pub(crate) fn any_enabled(&self) -> bool {
        self.connections
            .iter()
            .flat_map(|c| c.configs.iter().flatten())
            .any(|s| s.is_enabled())
    }

    /// Disable one enabled configuration, of `handle` or of any connection, returning its scheduler handle.
    pub(crate) fn take_scheduled(&mut self, handle: Option<ConnHandle>) -> Option<SchedulerHandle> {
        self.connections
            .iter_mut()
            .filter(|c| c.handle.is_some() && (handle.is_none() || c.handle == handle))
            .flat_map(|c| c.configs.iter_mut().flatten())
            .find_map(|s| s.enabled.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::config::tests::params as config_params;
    use crate::types::capabilities::CsRole;
    use crate::types::procedure::tests::params as procedure_params;
    use crate::types::timing::Timing;

    fn config(id: u8) -> CsConfiguration {
        CsConfiguration {
            id,
            params: config_params(CsRole::Initiator),
            timing: Timing::MANDATORY,
        }
    }

    fn defaults() -> DefaultSettings {
        DefaultSettings::new(RoleSet::BOTH)
    }

    #[test]
    fn unknown_connection_is_inactive() {
        let mut storage = [ConnectionStorage::DISCONNECTED, ConnectionStorage::DISCONNECTED];
        let mut db = CsDatabase::new(&mut storage[..], 4);
        let handle = ConnHandle::new(1);

        assert_eq!(db.role(handle), Err(Error::InactiveConnection));
        assert_eq!(db.create_config(handle, config(0)), Err(Error::InactiveConnection));
        assert_eq!(db.set_in_progress(handle, ControlProcedure::CapabilitiesExchange), Err(Error::InactiveConnection));
        assert_eq!(db.clear_in_progress(handle), None);
    }

    #[test]
    fn partitions_are_allocated_and_released() {
        let mut storage = [ConnectionStorage::DISCONNECTED];
        let mut db = CsDatabase::new(&mut storage[..], 4);
        let a = ConnHandle::new(1);
        let b = ConnHandle::new(2);

        unwrap!(db.connect(a, LeConnRole::Central, defaults()));
        assert_eq!(db.connect(a, LeConnRole::Central, defaults()), Err(Error::CommandDisallowed));
        assert_eq!(db.connect(b, LeConnRole::Central, defaults()), Err(Error::InsufficientResources));

        unwrap!(db.create_config(a, config(1)));
        unwrap!(db.set_in_progress(a, ControlProcedure::FaeTableUpdate));
        unwrap!(db.set_remote_fae_table(a, FaeTable::ZERO));

        unwrap!(db.disconnect(a));
        assert!(!db.is_active(a));
        assert_eq!(db.disconnect(a), Err(Error::InactiveConnection));

        unwrap!(db.connect(b, LeConnRole::Peripheral, defaults()));
        assert_eq!(unwrap!(db.in_progress(b)), None);
        assert_eq!(unwrap!(db.remote_fae_table(b)), None);
        assert_eq!(db.configs(b).map(|c| c.count()), Ok(0));
    }

    #[test]
    fn single_token_per_connection() {
        let mut storage = [ConnectionStorage::DISCONNECTED, ConnectionStorage::DISCONNECTED];
        let mut db = CsDatabase::new(&mut storage[..], 4);
        let a = ConnHandle::new(1);
        let b = ConnHandle::new(2);
        unwrap!(db.connect(a, LeConnRole::Central, defaults()));
        unwrap!(db.connect(b, LeConnRole::Central, defaults()));

        unwrap!(db.set_in_progress(a, ControlProcedure::CapabilitiesExchange));
        assert_eq!(
            db.set_in_progress(a, ControlProcedure::ConfigCreate(0)),
            Err(Error::CommandDisallowed)
        );
        assert_eq!(unwrap!(db.in_progress(a)), Some(ControlProcedure::CapabilitiesExchange));

        // Other connections are independent
        unwrap!(db.set_in_progress(b, ControlProcedure::ConfigCreate(0)));

        assert_eq!(db.clear_in_progress(a), Some(ControlProcedure::CapabilitiesExchange));
        assert_eq!(db.clear_in_progress(a), None);
        unwrap!(db.set_in_progress(a, ControlProcedure::SecurityStart));
    }

    #[test]
    fn config_slot_bounds() {
        let mut storage = [ConnectionStorage::DISCONNECTED];
        let mut db = CsDatabase::new(&mut storage[..], 2);
        let a = ConnHandle::new(1);
        unwrap!(db.connect(a, LeConnRole::Central, defaults()));

        assert_eq!(db.config_slots(), 2);
        assert_eq!(db.create_config(a, config(2)), Err(Error::UnexpectedParameter));
        unwrap!(db.create_config(a, config(1)));
        assert_eq!(db.create_config(a, config(1)), Err(Error::CommandDisallowed));
        assert_eq!(db.remove_config(a, 0), Err(Error::UnexpectedParameter));
        assert_eq!(db.remove_config(a, 1), Ok(config(1)));
        assert_eq!(db.config(a, 1).map(|s| s.config), Err(Error::UnexpectedParameter));
    }

    #[test]
    fn enabled_config_is_locked() {
        let mut storage = [ConnectionStorage::DISCONNECTED];
        let mut db = CsDatabase::new(&mut storage[..], 4);
        let a = ConnHandle::new(1);
        unwrap!(db.connect(a, LeConnRole::Central, defaults()));
        unwrap!(db.create_config(a, config(0)));

        let mut first = procedure_params();
        first.max_procedure_count = 5;
        unwrap!(db.set_procedure_parameters(a, 0, first));
        let mut second = procedure_params();
        second.max_procedure_len = 0x0200;
        unwrap!(db.set_procedure_parameters(a, 0, second));
        assert_eq!(unwrap!(db.config(a, 0)).params, Some(second));

        unwrap!(db.set_enabled(a, 0, Some(SchedulerHandle::new(7))));
        assert_eq!(unwrap!(db.enabled_config(a)), Some(0));
        assert!(db.any_enabled());
        assert_eq!(db.remove_config(a, 0), Err(Error::CommandDisallowed));
        assert_eq!(db.set_procedure_parameters(a, 0, first), Err(Error::CommandDisallowed));
        assert_eq!(unwrap!(db.config(a, 0)).params, Some(second));

        assert_eq!(db.take_scheduled(Some(ConnHandle::new(2))), None);
        assert_eq!(db.take_scheduled(Some(a)), Some(SchedulerHandle::new(7)));
        assert!(!db.any_enabled());
        unwrap!(db.remove_config(a, 0));
    }

    #[test]
    fn remote_capabilities_are_written_once() {
        let mut storage = [ConnectionStorage::DISCONNECTED];
        let mut db = CsDatabase::new(&mut storage[..], 4);
        let a = ConnHandle::new(1);
        unwrap!(db.connect(a, LeConnRole::Peripheral, defaults()));

        let first = CsCapabilities::default();
        let second = CsCapabilities {
            num_antennas: 4,
            ..Default::default()
        };
        unwrap!(db.set_remote_capabilities(a, first));
        assert_eq!(db.set_remote_capabilities(a, second), Err(Error::CommandDisallowed));
        assert_eq!(unwrap!(db.remote_capabilities(a)), Some(first));
    }
}
