//! Mesh node model.
//!
//! Node flags (provisioned, link, IV update, LPN) are plain state that
//! handlers read without consuming anything. OOB prompts, network PDUs and
//! friendship changes are queued.

use core::cell::RefCell;
use core::time::Duration;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::{debug, info, warn};

use super::queue::EventQueue;
use crate::btp::protocol::mesh::{Bearer, MeshCommand, MeshEvent, NetRecvEvent};
use crate::btp::{BtpClient, Error};

/// Snapshot of node level flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeshNode {
    pub provisioned: bool,
    /// Bearer of the currently open provisioning link.
    pub link: Option<Bearer>,
    /// Bearer of the most recently closed provisioning link.
    pub last_closed_link: Option<Bearer>,
    pub iv_update_test_mode: bool,
    pub lpn_enabled: bool,
    /// Friend address while this node is an established LPN.
    pub friend: Option<u16>,
    pub incomp_timer_expired: bool,
    pub invalid_bearer: Option<u8>,
}

/// Out of band interaction requested by the IUT during provisioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OobAction {
    OutputNumber { action: u16, number: u32 },
    OutputString(String),
    Input { action: u16, size: u8 },
}

/// Friendship lifecycle, from either side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FriendshipEvent {
    FriendEstablished { net_idx: u16, lpn_addr: u16 },
    FriendTerminated { net_idx: u16, lpn_addr: u16 },
    LpnEstablished { net_idx: u16, friend_addr: u16 },
    LpnTerminated { net_idx: u16, friend_addr: u16 },
    LpnPolled { net_idx: u16, friend_addr: u16, retry: u8 },
}

pub struct MeshState {
    node: Mutex<CriticalSectionRawMutex, RefCell<MeshNode>>,
    oob: EventQueue<OobAction>,
    net_recv: EventQueue<NetRecvEvent>,
    friendship: EventQueue<FriendshipEvent>,
    links: EventQueue<(bool, Bearer)>,
}

impl Default for MeshState {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshState {
    pub fn new() -> Self {
        Self {
            node: Mutex::new(RefCell::new(MeshNode::default())),
            oob: EventQueue::new("mesh.oob"),
            net_recv: EventQueue::new("mesh.net_recv"),
            friendship: EventQueue::new("mesh.friendship"),
            links: EventQueue::new("mesh.links"),
        }
    }

    fn update(&self, f: impl FnOnce(&mut MeshNode)) {
        self.node.lock(|n| f(&mut n.borrow_mut()));
    }

    pub(crate) fn apply(&self, evt: MeshEvent) {
        match evt {
            MeshEvent::OutNumberAction { action, number } => self.oob.push(OobAction::OutputNumber { action, number }),
            MeshEvent::OutStringAction(s) => self.oob.push(OobAction::OutputString(s)),
            MeshEvent::InAction { action, size } => self.oob.push(OobAction::Input { action, size }),
            MeshEvent::Provisioned => {
                info!("Mesh node provisioned");
                self.update(|n| n.provisioned = true);
            }
            MeshEvent::ProvLinkOpen(bearer) => {
                debug!("Provisioning link open on {:?}", bearer);
                self.update(|n| n.link = Some(bearer));
                self.links.push((true, bearer));
            }
            MeshEvent::ProvLinkClosed(bearer) => {
                debug!("Provisioning link closed on {:?}", bearer);
                self.update(|n| {
                    n.link = None;
                    n.last_closed_link = Some(bearer);
                });
                self.links.push((false, bearer));
            }
            MeshEvent::NetRecv(pdu) => self.net_recv.push(pdu),
            MeshEvent::InvalidBearer(opcode) => {
                warn!("Mesh invalid bearer, opcode 0x{:02x}", opcode);
                self.update(|n| n.invalid_bearer = Some(opcode));
            }
            MeshEvent::IncompTimerExpired => self.update(|n| n.incomp_timer_expired = true),
            MeshEvent::FriendEstablished(e) => self.friendship.push(FriendshipEvent::FriendEstablished {
                net_idx: e.net_idx,
                lpn_addr: e.lpn_addr,
            }),
            MeshEvent::FriendTerminated { net_idx, lpn_addr } => {
                self.friendship
                    .push(FriendshipEvent::FriendTerminated { net_idx, lpn_addr })
            }
            MeshEvent::LpnEstablished(e) => {
                self.update(|n| n.friend = Some(e.friend_addr));
                self.friendship.push(FriendshipEvent::LpnEstablished {
                    net_idx: e.net_idx,
                    friend_addr: e.friend_addr,
                });
            }
            MeshEvent::LpnTerminated { net_idx, friend_addr } => {
                self.update(|n| n.friend = None);
                self.friendship
                    .push(FriendshipEvent::LpnTerminated { net_idx, friend_addr });
            }
            MeshEvent::LpnPolled {
                net_idx,
                friend_addr,
                retry,
            } => self.friendship.push(FriendshipEvent::LpnPolled {
                net_idx,
                friend_addr,
                retry,
            }),
        }
    }

    pub fn node(&self) -> MeshNode {
        self.node.lock(|n| *n.borrow())
    }

    pub fn is_provisioned(&self) -> bool {
        self.node().provisioned
    }

    pub fn oob(&self) -> &EventQueue<OobAction> {
        &self.oob
    }

    pub fn net_recv(&self) -> &EventQueue<NetRecvEvent> {
        &self.net_recv
    }

    pub fn friendship(&self) -> &EventQueue<FriendshipEvent> {
        &self.friendship
    }

    /// Provisioning link transitions as `(opened, bearer)`.
    pub fn links(&self) -> &EventQueue<(bool, Bearer)> {
        &self.links
    }

    /// Take the next OOB prompt.
    pub async fn wait_oob(&self, timeout: Duration) -> Result<Option<OobAction>, Error> {
        self.oob.take(timeout).await
    }

    /// Take the next network PDU addressed to `dst`.
    pub async fn wait_net_recv(&self, dst: u16, timeout: Duration) -> Result<Option<NetRecvEvent>, Error> {
        self.net_recv.take_matching(timeout, |p| p.dst == dst).await
    }

    /// Poll node flags until `pred` holds or `timeout` passes.
    ///
    /// Node flags are state, not events, so this re-checks every 100 ms.
    pub async fn wait_node(&self, timeout: Duration, pred: impl Fn(&MeshNode) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if pred(&self.node()) {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep((deadline - now).min(Duration::from_millis(100))).await;
        }
    }

    pub async fn init(&self, client: &BtpClient) -> Result<(), Error> {
        client.send(&MeshCommand::Init).await?;
        Ok(())
    }

    pub async fn set_iv_update_test_mode(&self, client: &BtpClient, enable: bool) -> Result<(), Error> {
        client.send(&MeshCommand::IvUpdateTestMode(enable)).await?;
        self.update(|n| n.iv_update_test_mode = enable);
        Ok(())
    }

    pub async fn set_lpn(&self, client: &BtpClient, enable: bool) -> Result<(), Error> {
        client.send(&MeshCommand::Lpn(enable)).await?;
        self.update(|n| n.lpn_enabled = enable);
        Ok(())
    }

    /// Answer an input OOB prompt with a number.
    pub async fn input_number(&self, client: &BtpClient, number: u32) -> Result<(), Error> {
        client.send(&MeshCommand::InputNumber(number)).await?;
        Ok(())
    }

    pub(crate) fn reset(&self) {
        self.update(|n| *n = MeshNode::default());
        self.oob.clear();
        self.net_recv.clear();
        self.friendship.clear();
        self.links.clear();
    }

    pub(crate) fn close(&self) {
        self.oob.close();
        self.net_recv.close();
        self.friendship.close();
        self.links.close();
    }

    pub(crate) fn reopen(&self) {
        self.oob.reopen();
        self.net_recv.reopen();
        self.friendship.reopen();
        self.links.reopen();
    }
}
