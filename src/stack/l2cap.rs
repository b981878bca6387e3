//! L2CAP model: open credit based channels and their traffic.

use core::cell::RefCell;
use core::time::Duration;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::{debug, info};

use super::queue::EventQueue;
use crate::btp::protocol::l2cap::{
    parse_connected_response, ConnectOptions, ConnectedEvent, ConnectionRequestEvent, DataReceivedEvent,
    DisconnectedEvent, L2capCommand, L2capEvent, ReconfiguredEvent,
};
use crate::btp::{Address, BtpClient, Error};

/// One open channel as last reported by the IUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    pub chan_id: u8,
    pub psm: u16,
    pub peer_mtu: u16,
    pub peer_mps: u16,
    pub our_mtu: u16,
    pub our_mps: u16,
    pub address: Address,
}

impl From<&ConnectedEvent> for Channel {
    fn from(e: &ConnectedEvent) -> Self {
        Self {
            chan_id: e.chan_id,
            psm: e.psm,
            peer_mtu: e.peer_mtu,
            peer_mps: e.peer_mps,
            our_mtu: e.our_mtu,
            our_mps: e.our_mps,
            address: e.address,
        }
    }
}

pub struct L2capState {
    channels: Mutex<CriticalSectionRawMutex, RefCell<Vec<Channel>>>,
    connection_requests: EventQueue<ConnectionRequestEvent>,
    connected: EventQueue<ConnectedEvent>,
    disconnected: EventQueue<DisconnectedEvent>,
    data: EventQueue<DataReceivedEvent>,
    reconfigured: EventQueue<ReconfiguredEvent>,
}

impl Default for L2capState {
    fn default() -> Self {
        Self::new()
    }
}

impl L2capState {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(RefCell::new(Vec::new())),
            connection_requests: EventQueue::new("l2cap.connection_requests"),
            connected: EventQueue::new("l2cap.connected"),
            disconnected: EventQueue::new("l2cap.disconnected"),
            data: EventQueue::new("l2cap.data"),
            reconfigured: EventQueue::new("l2cap.reconfigured"),
        }
    }

    pub(crate) fn apply(&self, evt: L2capEvent) {
        match evt {
            L2capEvent::ConnectionRequest(req) => self.connection_requests.push(req),
            L2capEvent::Connected(conn) => {
                info!("L2CAP channel {} open on PSM 0x{:04x}", conn.chan_id, conn.psm);
                self.channels.lock(|c| {
                    let mut c = c.borrow_mut();
                    c.retain(|ch| ch.chan_id != conn.chan_id);
                    c.push(Channel::from(&conn));
                });
                self.connected.push(conn);
            }
            L2capEvent::Disconnected(disc) => {
                info!("L2CAP channel {} closed, result 0x{:04x}", disc.chan_id, disc.result);
                self.channels
                    .lock(|c| c.borrow_mut().retain(|ch| ch.chan_id != disc.chan_id));
                self.disconnected.push(disc);
            }
            L2capEvent::DataReceived(data) => self.data.push(data),
            L2capEvent::Reconfigured(r) => {
                debug!("L2CAP channel {} reconfigured, mtu {}", r.chan_id, r.our_mtu);
                self.channels.lock(|c| {
                    if let Some(ch) = c.borrow_mut().iter_mut().find(|ch| ch.chan_id == r.chan_id) {
                        ch.peer_mtu = r.peer_mtu;
                        ch.peer_mps = r.peer_mps;
                        ch.our_mtu = r.our_mtu;
                        ch.our_mps = r.our_mps;
                    }
                });
                self.reconfigured.push(r);
            }
        }
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.channels.lock(|c| c.borrow().clone())
    }

    pub fn channel(&self, chan_id: u8) -> Option<Channel> {
        self.channels
            .lock(|c| c.borrow().iter().find(|ch| ch.chan_id == chan_id).copied())
    }

    pub fn connection_requests(&self) -> &EventQueue<ConnectionRequestEvent> {
        &self.connection_requests
    }

    pub fn connected(&self) -> &EventQueue<ConnectedEvent> {
        &self.connected
    }

    pub fn disconnected(&self) -> &EventQueue<DisconnectedEvent> {
        &self.disconnected
    }

    pub fn data(&self) -> &EventQueue<DataReceivedEvent> {
        &self.data
    }

    pub fn reconfigured(&self) -> &EventQueue<ReconfiguredEvent> {
        &self.reconfigured
    }

    /// Take the next connected event, optionally for a given PSM.
    pub async fn wait_connected(&self, psm: Option<u16>, timeout: Duration) -> Result<Option<ConnectedEvent>, Error> {
        self.connected
            .take_matching(timeout, |c| psm.map_or(true, |p| c.psm == p))
            .await
    }

    pub async fn wait_disconnected(&self, chan_id: u8, timeout: Duration) -> Result<Option<DisconnectedEvent>, Error> {
        self.disconnected
            .take_matching(timeout, |d| d.chan_id == chan_id)
            .await
    }

    /// Take the next SDU received on `chan_id`.
    pub async fn wait_data(&self, chan_id: u8, timeout: Duration) -> Result<Option<Vec<u8>>, Error> {
        Ok(self
            .data
            .take_matching(timeout, |d| d.chan_id == chan_id)
            .await?
            .map(|d| d.data))
    }

    /// Request `num` channels to `address` and return the allocated ids.
    pub async fn connect(
        &self,
        client: &BtpClient,
        address: Address,
        psm: u16,
        mtu: u16,
        num: u8,
        options: ConnectOptions,
    ) -> Result<Vec<u8>, Error> {
        let rsp = client
            .send(&L2capCommand::Connect {
                address,
                psm,
                mtu,
                num,
                options,
            })
            .await?;
        parse_connected_response(&rsp)
    }

    pub async fn send_data(&self, client: &BtpClient, chan_id: u8, data: Vec<u8>) -> Result<(), Error> {
        client.send(&L2capCommand::SendData { chan_id, data }).await?;
        Ok(())
    }

    pub(crate) fn reset(&self) {
        self.channels.lock(|c| c.borrow_mut().clear());
        self.connection_requests.clear();
        self.connected.clear();
        self.disconnected.clear();
        self.data.clear();
        self.reconfigured.clear();
    }

    pub(crate) fn close(&self) {
        self.channels.lock(|c| c.borrow_mut().clear());
        self.connection_requests.close();
        self.connected.close();
        self.disconnected.close();
        self.data.close();
        self.reconfigured.close();
    }

    pub(crate) fn reopen(&self) {
        self.connection_requests.reopen();
        self.connected.reopen();
        self.disconnected.reopen();
        self.data.reopen();
        self.reconfigured.reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected(chan_id: u8, psm: u16) -> L2capEvent {
        L2capEvent::Connected(ConnectedEvent {
            chan_id,
            psm,
            peer_mtu: 64,
            peer_mps: 64,
            our_mtu: 128,
            our_mps: 128,
            address: Address::public([3; 6]),
        })
    }

    #[tokio::test]
    async fn channel_lifecycle() {
        let l2cap = L2capState::new();
        l2cap.apply(connected(0, 0x80));
        l2cap.apply(connected(1, 0x80));
        l2cap.apply(L2capEvent::Reconfigured(ReconfiguredEvent {
            chan_id: 1,
            peer_mtu: 256,
            peer_mps: 64,
            our_mtu: 512,
            our_mps: 128,
        }));
        assert_eq!(l2cap.channel(1).map(|c| c.our_mtu), Some(512));

        l2cap.apply(L2capEvent::Disconnected(DisconnectedEvent {
            result: 0,
            chan_id: 0,
            psm: 0x80,
            address: Address::public([3; 6]),
        }));
        assert_eq!(l2cap.channels().len(), 1);
        assert!(l2cap.channel(0).is_none());

        let t = Duration::from_millis(10);
        assert_eq!(l2cap.wait_connected(Some(0x80), t).await.unwrap().map(|c| c.chan_id), Some(0));
        assert!(l2cap.wait_disconnected(0, t).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn data_is_per_channel() {
        let l2cap = L2capState::new();
        l2cap.apply(L2capEvent::DataReceived(DataReceivedEvent {
            chan_id: 2,
            data: vec![1, 2, 3],
        }));
        let t = Duration::from_millis(10);
        assert_eq!(l2cap.wait_data(1, t).await, Ok(None));
        assert_eq!(l2cap.wait_data(2, t).await, Ok(Some(vec![1, 2, 3])));
    }
}
