//! GATT model: notifications, local attribute writes, discovered services.

use core::cell::RefCell;
use core::time::Duration;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::debug;

use super::queue::EventQueue;
use crate::btp::protocol::gatt::{
    parse_services, parse_write_response, AttrValueChangedEvent, GattCommand, GattEvent, NotificationReceivedEvent,
    ReadDataResponse, ServiceInfo,
};
use crate::btp::{Address, BtpClient, Error};

pub struct GattState {
    notifications: EventQueue<NotificationReceivedEvent>,
    attr_changed: EventQueue<AttrValueChangedEvent>,
    services: Mutex<CriticalSectionRawMutex, RefCell<Vec<(Address, ServiceInfo)>>>,
}

impl Default for GattState {
    fn default() -> Self {
        Self::new()
    }
}

impl GattState {
    pub fn new() -> Self {
        Self {
            notifications: EventQueue::new("gatt.notifications"),
            attr_changed: EventQueue::new("gatt.attr_changed"),
            services: Mutex::new(RefCell::new(Vec::new())),
        }
    }

    pub(crate) fn apply(&self, evt: GattEvent) {
        match evt {
            GattEvent::NotificationReceived(n) => self.notifications.push(n),
            GattEvent::AttrValueChanged(c) => self.attr_changed.push(c),
        }
    }

    pub fn notifications(&self) -> &EventQueue<NotificationReceivedEvent> {
        &self.notifications
    }

    pub fn attr_changed(&self) -> &EventQueue<AttrValueChangedEvent> {
        &self.attr_changed
    }

    /// Take the next notification or indication for `handle` from `address`.
    pub async fn wait_notification(
        &self,
        address: Address,
        handle: u16,
        timeout: Duration,
    ) -> Result<Option<NotificationReceivedEvent>, Error> {
        self.notifications
            .take_matching(timeout, |n| n.address == address && n.handle == handle)
            .await
    }

    /// Take the next remote write to local attribute `attr_id`.
    pub async fn wait_attr_changed(&self, attr_id: u16, timeout: Duration) -> Result<Option<Vec<u8>>, Error> {
        Ok(self
            .attr_changed
            .take_matching(timeout, |c| c.attr_id == attr_id)
            .await?
            .map(|c| c.data))
    }

    /// Services found by the last discovery against `address`.
    pub fn services(&self, address: &Address) -> Vec<ServiceInfo> {
        self.services.lock(|s| {
            s.borrow()
                .iter()
                .filter(|(a, _)| a == address)
                .map(|(_, svc)| svc.clone())
                .collect()
        })
    }

    /// Discover all primary services on `address` and remember them.
    pub async fn discover_all_primary(&self, client: &BtpClient, address: Address) -> Result<Vec<ServiceInfo>, Error> {
        let rsp = client.send(&GattCommand::DiscoverAllPrimary(address)).await?;
        let found = parse_services(&rsp)?;
        debug!("{} primary service(s) on {}", found.len(), address);
        self.services.lock(|s| {
            let mut s = s.borrow_mut();
            s.retain(|(a, _)| *a != address);
            s.extend(found.iter().cloned().map(|svc| (address, svc)));
        });
        Ok(found)
    }

    pub async fn read(&self, client: &BtpClient, address: Address, handle: u16) -> Result<ReadDataResponse, Error> {
        let rsp = client.send(&GattCommand::Read { address, handle }).await?;
        ReadDataResponse::parse(&rsp)
    }

    /// Write with response; returns the ATT status byte.
    pub async fn write(&self, client: &BtpClient, address: Address, handle: u16, data: Vec<u8>) -> Result<u8, Error> {
        let rsp = client.send(&GattCommand::Write { address, handle, data }).await?;
        parse_write_response(&rsp)
    }

    pub(crate) fn reset(&self) {
        self.notifications.clear();
        self.attr_changed.clear();
        self.services.lock(|s| s.borrow_mut().clear());
    }

    pub(crate) fn close(&self) {
        self.notifications.close();
        self.attr_changed.close();
    }

    pub(crate) fn reopen(&self) {
        self.notifications.reopen();
        self.attr_changed.reopen();
    }
}
