use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use trouble_autopts::btp::protocol::core::opcodes as core_opcodes;
use trouble_autopts::btp::protocol::header::HEADER_SIZE;
use trouble_autopts::btp::{BtpHeader, BtpIo, Frame, Opcode, ServiceId};
use trouble_autopts::session::Connector;

/// The IUT end of an in-memory BTP link.
pub struct SyntheticIut {
    io: DuplexStream,
}

/// A connected pair: the host side for `BtpClient::open` and the IUT side.
#[allow(unused)]
pub fn link() -> (DuplexStream, SyntheticIut) {
    let (host, iut) = tokio::io::duplex(4096);
    (host, SyntheticIut { io: iut })
}

#[allow(unused)]
impl SyntheticIut {
    /// Read the next command frame from the host. `None` once the host is gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        let mut buf = vec![0u8; HEADER_SIZE];
        self.io.read_exact(&mut buf).await.ok()?;
        let header = BtpHeader::decode(&buf).ok()?;
        let mut payload = vec![0u8; header.data_len as usize];
        self.io.read_exact(&mut payload).await.ok()?;
        Some(Frame {
            header,
            payload,
        })
    }

    pub async fn send(&mut self, service: ServiceId, opcode: Opcode, index: Option<u8>, payload: &[u8]) {
        let frame = Frame::new(service, opcode, index, payload.to_vec()).unwrap();
        self.io.write_all(&frame.encode()).await.unwrap();
    }

    /// Answer `cmd` with a success response carrying `payload`.
    pub async fn respond(&mut self, cmd: &Frame, payload: &[u8]) {
        let h = cmd.header;
        self.send(h.service_id, h.opcode, h.controller_index, payload).await;
    }

    /// Answer `cmd` with an error response.
    pub async fn fail(&mut self, cmd: &Frame, status: u8) {
        let h = cmd.header;
        self.send(h.service_id, Opcode::ERROR, h.controller_index, &[status]).await;
    }

    pub async fn event(&mut self, service: ServiceId, opcode: Opcode, payload: &[u8]) {
        self.send(service, opcode, Some(0), payload).await;
    }

    pub async fn iut_ready(&mut self) {
        self.send(ServiceId::CORE, core_opcodes::EVENT_IUT_READY, None, &[]).await;
    }

    /// Say ready, then answer every command with an empty success response
    /// until the host goes away or `hang_up` matches a command.
    pub async fn serve(mut self, hang_up: Option<(ServiceId, Opcode)>) {
        self.iut_ready().await;
        while let Some(cmd) = self.recv().await {
            if hang_up == Some((cmd.header.service_id, cmd.header.opcode)) {
                return;
            }
            let payload = if cmd.header.service_id == ServiceId::GAP {
                // Current settings for the GAP settings commands.
                vec![0u8; 4]
            } else {
                Vec::new()
            };
            self.respond(&cmd, &payload).await;
        }
    }
}

/// Log of every link a [`serving_connector`] handed out.
#[derive(Default)]
#[allow(unused)]
pub struct Links {
    pub opened: AtomicUsize,
    pub hang_up: StdMutex<Option<(ServiceId, Opcode)>>,
}

#[allow(unused)]
impl Links {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

/// A connector whose every link is served by [`SyntheticIut::serve`].
#[allow(unused)]
pub fn serving_connector(links: Arc<Links>) -> Connector {
    Box::new(move || {
        let links = links.clone();
        async move {
            let (host, iut) = link();
            links.opened.fetch_add(1, Ordering::SeqCst);
            let hang_up = *links.hang_up.lock().unwrap();
            tokio::spawn(iut.serve(hang_up));
            Ok(Box::new(host) as Box<dyn BtpIo>)
        }
        .boxed()
    })
}
