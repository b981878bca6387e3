//! Core service model: IUT readiness and registered services.

use core::cell::RefCell;
use core::time::Duration;
use std::collections::BTreeSet;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::debug;

use super::queue::EventQueue;
use crate::btp::Error;
use crate::btp::protocol::core::CoreEvent;
use crate::btp::types::ServiceId;

pub struct CoreState {
    iut_ready: EventQueue<()>,
    registered: Mutex<CriticalSectionRawMutex, RefCell<BTreeSet<ServiceId>>>,
}

impl Default for CoreState {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreState {
    pub fn new() -> Self {
        Self {
            iut_ready: EventQueue::new("core.iut_ready"),
            registered: Mutex::new(RefCell::new(BTreeSet::new())),
        }
    }

    pub(crate) fn apply(&self, evt: CoreEvent) {
        match evt {
            CoreEvent::IutReady => {
                debug!("IUT ready");
                self.iut_ready.push(());
            }
        }
    }

    /// Consume one IUT_READY event. Returns `false` on timeout.
    pub async fn wait_iut_ready(&self, timeout: Duration) -> Result<bool, Error> {
        Ok(self.iut_ready.take(timeout).await?.is_some())
    }

    pub fn iut_ready(&self) -> &EventQueue<()> {
        &self.iut_ready
    }

    pub(crate) fn mark_registered(&self, service: ServiceId) {
        self.registered.lock(|r| r.borrow_mut().insert(service));
    }

    pub(crate) fn mark_unregistered(&self, service: ServiceId) {
        self.registered.lock(|r| r.borrow_mut().remove(&service));
    }

    pub fn is_registered(&self, service: ServiceId) -> bool {
        self.registered.lock(|r| r.borrow().contains(&service))
    }

    /// Services registered on the IUT since the last reset, in id order.
    pub fn registered(&self) -> Vec<ServiceId> {
        self.registered.lock(|r| r.borrow().iter().copied().collect())
    }

    pub(crate) fn reset(&self) {
        self.iut_ready.clear();
        self.registered.lock(|r| r.borrow_mut().clear());
    }

    pub(crate) fn close(&self) {
        self.iut_ready.close();
    }

    pub(crate) fn reopen(&self) {
        self.iut_ready.reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ready_is_consumed_once() {
        let core = CoreState::new();
        core.apply(CoreEvent::IutReady);
        assert_eq!(core.wait_iut_ready(Duration::from_millis(10)).await, Ok(true));
        assert_eq!(core.wait_iut_ready(Duration::from_millis(10)).await, Ok(false));
    }

    #[test]
    fn registration_bookkeeping() {
        let core = CoreState::new();
        core.mark_registered(ServiceId::MESH);
        core.mark_registered(ServiceId::GAP);
        assert_eq!(core.registered(), vec![ServiceId::GAP, ServiceId::MESH]);
        core.mark_unregistered(ServiceId::MESH);
        assert!(!core.is_registered(ServiceId::MESH));
        core.reset();
        assert!(core.registered().is_empty());
    }
}
