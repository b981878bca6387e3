//! Host side model of the IUT, fed by BTP events.
//!
//! [`Stack`] is the [`EventSink`] of a [`BtpClient`]: every event frame is
//! parsed and applied to the sub-model of its service. Events of services
//! without a sub-model, and events a sub-model does not know, land in the
//! raw queue keyed by `(service, opcode)`.

use std::time::Duration;

use log::{debug, info, warn};

use crate::btp::protocol::core::{opcodes as core_opcodes, CoreCommand};
use crate::btp::protocol::BtpEvent;
use crate::btp::{BtpClient, BtpHeader, Error, EventSink, Opcode, ServiceId};

pub mod core;
pub mod gap;
pub mod gatt;
pub mod l2cap;
pub mod mesh;
pub mod queue;

pub use self::core::CoreState;
pub use self::gap::GapState;
pub use self::gatt::GattState;
pub use self::l2cap::L2capState;
pub use self::mesh::MeshState;
pub use self::queue::EventQueue;

/// An event kept as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub service: ServiceId,
    pub opcode: Opcode,
    pub data: Vec<u8>,
}

/// Per-tester model of what the IUT is doing.
pub struct Stack {
    core: CoreState,
    gap: GapState,
    gatt: GattState,
    l2cap: L2capState,
    mesh: MeshState,
    raw: EventQueue<RawEvent>,
}

impl Default for Stack {
    fn default() -> Self {
        Self::new()
    }
}

impl Stack {
    pub fn new() -> Self {
        Self {
            core: CoreState::new(),
            gap: GapState::new(),
            gatt: GattState::new(),
            l2cap: L2capState::new(),
            mesh: MeshState::new(),
            raw: EventQueue::new("raw"),
        }
    }

    pub fn core(&self) -> &CoreState {
        &self.core
    }

    pub fn gap(&self) -> &GapState {
        &self.gap
    }

    pub fn gatt(&self) -> &GattState {
        &self.gatt
    }

    pub fn l2cap(&self) -> &L2capState {
        &self.l2cap
    }

    pub fn mesh(&self) -> &MeshState {
        &self.mesh
    }

    pub fn raw(&self) -> &EventQueue<RawEvent> {
        &self.raw
    }

    /// Take the next raw event with the given service and opcode.
    pub async fn take_raw(&self, service: ServiceId, opcode: Opcode, timeout: Duration) -> Result<Option<Vec<u8>>, Error> {
        Ok(self
            .raw
            .take_matching(timeout, |e| e.service == service && e.opcode == opcode)
            .await?
            .map(|e| e.data))
    }

    /// Like [`take_raw`](Self::take_raw) but leaves the event queued.
    pub async fn peek_raw(&self, service: ServiceId, opcode: Opcode, timeout: Duration) -> Result<Option<Vec<u8>>, Error> {
        Ok(self
            .raw
            .peek_matching(timeout, |e| e.service == service && e.opcode == opcode)
            .await?
            .map(|e| e.data))
    }

    /// Clear every sub-model. Called at each test case boundary.
    pub fn reset(&self) {
        debug!("Stack reset");
        self.core.reset();
        self.gap.reset();
        self.gatt.reset();
        self.l2cap.reset();
        self.mesh.reset();
        self.raw.clear();
    }

    /// Clear the sub-model that belongs to `service`.
    pub fn reset_service(&self, service: ServiceId) {
        match service {
            ServiceId::CORE => self.core.reset(),
            ServiceId::GAP => self.gap.reset(),
            ServiceId::GATT | ServiceId::GATT_CLIENT => self.gatt.reset(),
            ServiceId::L2CAP => self.l2cap.reset(),
            ServiceId::MESH => self.mesh.reset(),
            _ => {}
        }
        self.raw.retain(|e| e.service != service);
    }

    /// Make the model usable again for a fresh link: queues are reopened
    /// and anything left over from the old link is dropped.
    pub fn reopen(&self) {
        self.reset();
        self.core.reopen();
        self.gap.reopen();
        self.gatt.reopen();
        self.l2cap.reopen();
        self.mesh.reopen();
        self.raw.reopen();
    }

    /// Wait for the IUT_READY event that follows a fresh connection.
    pub async fn wait_iut_ready(&self, timeout: Duration) -> Result<(), Error> {
        if self.core.wait_iut_ready(timeout).await? {
            Ok(())
        } else {
            Err(Error::Timeout {
                service: ServiceId::CORE,
                opcode: core_opcodes::EVENT_IUT_READY,
            })
        }
    }

    /// Reset the model of `service` and register it on the IUT.
    pub async fn register_service(&self, client: &BtpClient, service: ServiceId) -> Result<(), Error> {
        self.reset_service(service);
        client.send(&CoreCommand::RegisterService(service)).await?;
        self.core.mark_registered(service);
        info!("Registered {}", service);
        Ok(())
    }

    pub async fn unregister_service(&self, client: &BtpClient, service: ServiceId) -> Result<(), Error> {
        client.send(&CoreCommand::UnregisterService(service)).await?;
        self.core.mark_unregistered(service);
        self.reset_service(service);
        Ok(())
    }

    fn apply(&self, evt: BtpEvent) {
        match evt {
            BtpEvent::Core(e) => self.core.apply(e),
            BtpEvent::Gap(e) => self.gap.apply(e),
            BtpEvent::Gatt(e) => self.gatt.apply(e),
            BtpEvent::L2cap(e) => self.l2cap.apply(e),
            BtpEvent::Mesh(e) => self.mesh.apply(e),
        }
    }
}

impl EventSink for Stack {
    fn on_event(&self, header: &BtpHeader, data: &[u8]) {
        match BtpEvent::parse(header, data) {
            Ok(evt) => self.apply(evt),
            Err(Error::UnknownService(_)) | Err(Error::UnexpectedEvent { .. }) => self.raw.push(RawEvent {
                service: header.service_id,
                opcode: header.opcode,
                data: data.to_vec(),
            }),
            Err(e) => warn!(
                "Dropping malformed event {} {} ({} bytes): {}",
                header.service_id,
                header.opcode,
                data.len(),
                e
            ),
        }
    }

    fn on_disconnect(&self) {
        debug!("Closing event queues");
        self.core.close();
        self.gap.close();
        self.gatt.close();
        self.l2cap.close();
        self.mesh.close();
        self.raw.close();
    }
}
