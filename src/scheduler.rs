//! Radio scheduling service interface.

use bt_hci::param::ConnHandle;

use crate::types::config::CsConfiguration;
use crate::types::procedure::ProcedureParameters;
use crate::types::test_mode::TestParams;
use crate::Error;

/// Handle to work scheduled on the radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SchedulerHandle(u32);

impl SchedulerHandle {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Radio scheduling service running CS procedures.
///
/// Subevent results are reported back through
/// [`CsManager::on_subevent_result`](crate::CsManager::on_subevent_result) and
/// [`CsManager::on_test_subevent_result`](crate::CsManager::on_test_subevent_result).
pub trait RadioScheduler {
    /// Start running procedures for an enabled configuration.
    fn schedule_procedure(
        &self,
        handle: ConnHandle,
        config: &CsConfiguration,
        params: &ProcedureParameters,
    ) -> Result<SchedulerHandle, Error>;

    /// Stop running procedures.
    fn cancel_procedure(&self, handle: SchedulerHandle);

    /// Start a loop-back test.
    fn schedule_test(&self, params: &TestParams) -> Result<SchedulerHandle, Error>;

    /// Stop a loop-back test.
    fn cancel_test(&self, handle: SchedulerHandle);
}

impl<T: RadioScheduler + ?Sized> RadioScheduler for &T {
    fn schedule_procedure(
        &self,
        handle: ConnHandle,
        config: &CsConfiguration,
        params: &ProcedureParameters,
    ) -> Result<SchedulerHandle, Error> {
        T::schedule_procedure(self, handle, config, params)
    }

    fn cancel_procedure(&self, handle: SchedulerHandle) {
        T::cancel_procedure(self, handle)
    }

    fn schedule_test(&self, params: &TestParams) -> Result<SchedulerHandle, Error> {
        T::schedule_test(self, params)
    }

    fn cancel_test(&self, handle: SchedulerHandle) {
        T::cancel_test(self, handle)
    }
}
