//! GAP model: controller settings, connections, and pairing events.

use core::cell::RefCell;
use core::time::Duration;

use bt_hci::param::AddrKind;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::{debug, info};

use super::queue::EventQueue;
use crate::btp::protocol::gap::{
    parse_current_settings, ControllerInfo, DeviceConnectedEvent, DeviceFoundEvent, DiscoverableMode, GapCommand,
    GapEvent, GapSettings, PairingFailedEvent, PasskeyEvent, SecLevelChangedEvent,
};
use crate::btp::{Address, BtpClient, Error};

#[derive(Default)]
struct GapInner {
    info: Option<ControllerInfo>,
    settings: GapSettings,
    connections: Vec<DeviceConnectedEvent>,
}

/// What the IUT's GAP layer is believed to be doing.
///
/// Each event kind has its own queue. `connected` and `disconnected` are
/// also reflected in the live connection list so handlers can ask "is this
/// peer connected" without consuming anything.
pub struct GapState {
    inner: Mutex<CriticalSectionRawMutex, RefCell<GapInner>>,
    device_found: EventQueue<DeviceFoundEvent>,
    connected: EventQueue<DeviceConnectedEvent>,
    disconnected: EventQueue<Address>,
    passkey_display: EventQueue<PasskeyEvent>,
    passkey_entry: EventQueue<Address>,
    passkey_confirm: EventQueue<PasskeyEvent>,
    conn_param_update: EventQueue<DeviceConnectedEvent>,
    sec_level: EventQueue<SecLevelChangedEvent>,
    pairing_failed: EventQueue<PairingFailedEvent>,
}

macro_rules! for_each_queue {
    ($s:expr, $op:ident) => {{
        $s.device_found.$op();
        $s.connected.$op();
        $s.disconnected.$op();
        $s.passkey_display.$op();
        $s.passkey_entry.$op();
        $s.passkey_confirm.$op();
        $s.conn_param_update.$op();
        $s.sec_level.$op();
        $s.pairing_failed.$op();
    }};
}

impl Default for GapState {
    fn default() -> Self {
        Self::new()
    }
}

impl GapState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(GapInner::default())),
            device_found: EventQueue::new("gap.device_found"),
            connected: EventQueue::new("gap.connected"),
            disconnected: EventQueue::new("gap.disconnected"),
            passkey_display: EventQueue::new("gap.passkey_display"),
            passkey_entry: EventQueue::new("gap.passkey_entry"),
            passkey_confirm: EventQueue::new("gap.passkey_confirm"),
            conn_param_update: EventQueue::new("gap.conn_param_update"),
            sec_level: EventQueue::new("gap.sec_level"),
            pairing_failed: EventQueue::new("gap.pairing_failed"),
        }
    }

    pub(crate) fn apply(&self, evt: GapEvent) {
        match evt {
            GapEvent::NewSettings(settings) => {
                debug!("GAP settings now {:?}", settings);
                self.inner.lock(|i| i.borrow_mut().settings = settings);
            }
            GapEvent::DeviceFound(found) => self.device_found.push(found),
            GapEvent::DeviceConnected(conn) => {
                info!("Connected to {}", conn.address);
                self.inner.lock(|i| {
                    let mut i = i.borrow_mut();
                    i.connections.retain(|c| c.address != conn.address);
                    i.connections.push(conn);
                });
                self.connected.push(conn);
            }
            GapEvent::DeviceDisconnected(address) => {
                info!("Disconnected from {}", address);
                self.inner
                    .lock(|i| i.borrow_mut().connections.retain(|c| c.address != address));
                self.disconnected.push(address);
            }
            GapEvent::PasskeyDisplay(evt) => self.passkey_display.push(evt),
            GapEvent::PasskeyEntryRequest(address) => self.passkey_entry.push(address),
            GapEvent::PasskeyConfirmRequest(evt) => self.passkey_confirm.push(evt),
            GapEvent::ConnParamUpdate(update) => {
                self.inner.lock(|i| {
                    if let Some(conn) = i
                        .borrow_mut()
                        .connections
                        .iter_mut()
                        .find(|c| c.address == update.address)
                    {
                        *conn = update;
                    }
                });
                self.conn_param_update.push(update);
            }
            GapEvent::SecLevelChanged(evt) => self.sec_level.push(evt),
            GapEvent::PairingFailed(evt) => self.pairing_failed.push(evt),
        }
    }

    /// Last known current settings.
    pub fn settings(&self) -> GapSettings {
        self.inner.lock(|i| i.borrow().settings)
    }

    /// Controller info from the last [`read_controller_info`](Self::read_controller_info).
    pub fn controller_info(&self) -> Option<ControllerInfo> {
        self.inner.lock(|i| i.borrow().info.clone())
    }

    /// Currently connected peers.
    pub fn connections(&self) -> Vec<DeviceConnectedEvent> {
        self.inner.lock(|i| i.borrow().connections.clone())
    }

    pub fn is_connected(&self, address: &Address) -> bool {
        self.inner
            .lock(|i| i.borrow().connections.iter().any(|c| c.address == *address))
    }

    pub fn device_found(&self) -> &EventQueue<DeviceFoundEvent> {
        &self.device_found
    }

    pub fn connected(&self) -> &EventQueue<DeviceConnectedEvent> {
        &self.connected
    }

    pub fn disconnected(&self) -> &EventQueue<Address> {
        &self.disconnected
    }

    pub fn passkey_display(&self) -> &EventQueue<PasskeyEvent> {
        &self.passkey_display
    }

    pub fn passkey_entry(&self) -> &EventQueue<Address> {
        &self.passkey_entry
    }

    pub fn passkey_confirm(&self) -> &EventQueue<PasskeyEvent> {
        &self.passkey_confirm
    }

    pub fn conn_param_update(&self) -> &EventQueue<DeviceConnectedEvent> {
        &self.conn_param_update
    }

    pub fn sec_level(&self) -> &EventQueue<SecLevelChangedEvent> {
        &self.sec_level
    }

    pub fn pairing_failed(&self) -> &EventQueue<PairingFailedEvent> {
        &self.pairing_failed
    }

    /// Wait for a connection, optionally from a specific peer.
    ///
    /// A peer that is already connected satisfies the wait immediately.
    pub async fn wait_connected(
        &self,
        address: Option<Address>,
        timeout: Duration,
    ) -> Result<Option<DeviceConnectedEvent>, Error> {
        if let Some(addr) = address {
            if let Some(conn) = self
                .inner
                .lock(|i| i.borrow().connections.iter().find(|c| c.address == addr).copied())
            {
                self.connected.try_take_matching(|c| c.address == addr);
                return Ok(Some(conn));
            }
        }
        self.connected
            .take_matching(timeout, |c| address.map_or(true, |a| c.address == a))
            .await
    }

    /// Wait for a disconnection, optionally of a specific peer.
    pub async fn wait_disconnected(&self, address: Option<Address>, timeout: Duration) -> Result<Option<Address>, Error> {
        self.disconnected
            .take_matching(timeout, |a| address.map_or(true, |want| *a == want))
            .await
    }

    /// Passkey the IUT displayed for `address`, if any within `timeout`.
    pub async fn wait_passkey_display(&self, address: Address, timeout: Duration) -> Result<Option<u32>, Error> {
        Ok(self
            .passkey_display
            .take_matching(timeout, |e| e.address == address)
            .await?
            .map(|e| e.passkey))
    }

    /// Wait for a device whose advertising data contains `needle`, leaving
    /// the report queued.
    pub async fn find_device(&self, needle: &[u8], timeout: Duration) -> Result<Option<DeviceFoundEvent>, Error> {
        self.device_found
            .peek_matching(timeout, |d| {
                needle.is_empty() || d.adv_data.windows(needle.len()).any(|w| w == needle)
            })
            .await
    }

    /// Read and cache the controller info.
    pub async fn read_controller_info(&self, client: &BtpClient) -> Result<ControllerInfo, Error> {
        let rsp = client.send(&GapCommand::ReadControllerInfo).await?;
        let info = ControllerInfo::parse(&rsp)?;
        self.inner.lock(|i| {
            let mut i = i.borrow_mut();
            i.settings = info.current_settings;
            i.info = Some(info.clone());
        });
        Ok(info)
    }

    /// IUT's own address as reported by the controller info.
    pub fn iut_address(&self) -> Option<Address> {
        self.inner.lock(|i| {
            i.borrow().info.as_ref().map(|info| Address {
                kind: if info.current_settings.contains(GapSettings::PRIVACY) {
                    AddrKind::RANDOM
                } else {
                    AddrKind::PUBLIC
                },
                addr: info.address,
            })
        })
    }

    pub async fn set_connectable(&self, client: &BtpClient, on: bool) -> Result<GapSettings, Error> {
        self.send_settings_command(client, &GapCommand::SetConnectable(on)).await
    }

    pub async fn set_discoverable(&self, client: &BtpClient, mode: DiscoverableMode) -> Result<GapSettings, Error> {
        self.send_settings_command(client, &GapCommand::SetDiscoverable(mode)).await
    }

    pub async fn set_bondable(&self, client: &BtpClient, on: bool) -> Result<GapSettings, Error> {
        self.send_settings_command(client, &GapCommand::SetBondable(on)).await
    }

    async fn send_settings_command(&self, client: &BtpClient, cmd: &GapCommand) -> Result<GapSettings, Error> {
        let rsp = client.send(cmd).await?;
        let settings = parse_current_settings(&rsp)?;
        self.inner.lock(|i| i.borrow_mut().settings = settings);
        Ok(settings)
    }

    pub(crate) fn reset(&self) {
        self.inner.lock(|i| *i.borrow_mut() = GapInner::default());
        for_each_queue!(self, clear);
    }

    pub(crate) fn close(&self) {
        self.inner.lock(|i| i.borrow_mut().connections.clear());
        for_each_queue!(self, close);
    }

    pub(crate) fn reopen(&self) {
        for_each_queue!(self, reopen);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(addr: Address) -> DeviceConnectedEvent {
        DeviceConnectedEvent {
            address: addr,
            interval: 0x28,
            latency: 0,
            timeout: 0x1f4,
        }
    }

    #[tokio::test]
    async fn connection_list_tracks_events() {
        let gap = GapState::new();
        let a = Address::public([1, 2, 3, 4, 5, 6]);
        let b = Address::random([6, 5, 4, 3, 2, 0xc1]);

        gap.apply(GapEvent::DeviceConnected(conn(a)));
        gap.apply(GapEvent::DeviceConnected(conn(b)));
        assert!(gap.is_connected(&a));
        assert_eq!(gap.connections().len(), 2);

        gap.apply(GapEvent::DeviceDisconnected(a));
        assert!(!gap.is_connected(&a));
        assert!(gap.is_connected(&b));

        let t = Duration::from_millis(10);
        assert_eq!(gap.wait_disconnected(Some(a), t).await, Ok(Some(a)));
        assert_eq!(gap.wait_disconnected(Some(a), t).await, Ok(None));
    }

    #[tokio::test]
    async fn already_connected_peer_satisfies_wait() {
        let gap = GapState::new();
        let a = Address::public([1, 2, 3, 4, 5, 6]);
        gap.apply(GapEvent::DeviceConnected(conn(a)));

        let t = Duration::from_millis(10);
        assert_eq!(gap.wait_connected(Some(a), t).await, Ok(Some(conn(a))));
        // The queued event was consumed along with it.
        assert!(gap.connected().is_empty());
        assert_eq!(gap.wait_connected(Some(a), t).await, Ok(Some(conn(a))));
    }

    #[tokio::test]
    async fn param_update_rewrites_connection() {
        let gap = GapState::new();
        let a = Address::public([1, 2, 3, 4, 5, 6]);
        gap.apply(GapEvent::DeviceConnected(conn(a)));
        let updated = DeviceConnectedEvent { interval: 0x50, ..conn(a) };
        gap.apply(GapEvent::ConnParamUpdate(updated));
        assert_eq!(gap.connections(), vec![updated]);
        assert_eq!(gap.conn_param_update().len(), 1);
    }

    #[tokio::test]
    async fn find_device_by_adv_data() {
        let gap = GapState::new();
        let report = DeviceFoundEvent {
            address: Address::public([9; 6]),
            rssi: -40,
            flags: Default::default(),
            adv_data: vec![0x02, 0x01, 0x06, 0x05, 0x09, b't', b'e', b's', b't'],
        };
        gap.apply(GapEvent::DeviceFound(report.clone()));

        let t = Duration::from_millis(10);
        assert_eq!(gap.find_device(b"test", t).await, Ok(Some(report)));
        assert_eq!(gap.find_device(b"nope", t).await, Ok(None));
        assert_eq!(gap.device_found().len(), 1);
    }

    #[test]
    fn reset_forgets_everything() {
        let gap = GapState::new();
        let a = Address::public([1, 2, 3, 4, 5, 6]);
        gap.apply(GapEvent::NewSettings(GapSettings::POWERED | GapSettings::LE));
        gap.apply(GapEvent::DeviceConnected(conn(a)));
        gap.apply(GapEvent::PasskeyEntryRequest(a));
        gap.reset();
        assert_eq!(gap.settings(), GapSettings::empty());
        assert!(gap.connections().is_empty());
        assert!(gap.connected().is_empty());
        assert!(gap.passkey_entry().is_empty());
    }
}
