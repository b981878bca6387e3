//! BTP transport client.
//!
//! One [`BtpClient`] owns the stream to one IUT. Commands are strictly
//! lock-step: the writer lock is held from the moment a command frame is
//! written until its response arrives or the wait times out. A background
//! task reads every incoming frame, completes the pending command when the
//! frame answers it and hands everything with an event opcode to an
//! [`EventSink`].

use core::cell::RefCell;
use core::time::Duration;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embedded_io_adapters::tokio_1::FromTokio;
use log::{debug, error, trace, warn};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::endpoint::Endpoint;
use super::error::Error;
use super::protocol::{BtpHeader, BtpStatus, Command, Frame};
use super::types::{Opcode, ServiceId};
use crate::config::ClientConfig;

/// Byte stream the client can run over.
pub trait BtpIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> BtpIo for T {}

type Reader = FromTokio<ReadHalf<Box<dyn BtpIo>>>;
type Writer = FromTokio<WriteHalf<Box<dyn BtpIo>>>;

/// Receiver of event frames and link loss.
///
/// Called from the receive task; implementations must not block.
pub trait EventSink: Send + Sync + 'static {
    /// An event frame (opcode 0x80..=0xFF) arrived.
    fn on_event(&self, header: &BtpHeader, data: &[u8]);

    /// The link to the IUT is gone. No further events will be delivered.
    fn on_disconnect(&self) {}
}

struct PendingCommand {
    service: ServiceId,
    opcode: Opcode,
    sent: Instant,
    reply: oneshot::Sender<Result<Vec<u8>, Error>>,
}

impl PendingCommand {
    fn answered_by(&self, header: &BtpHeader) -> bool {
        header.service_id == self.service && (header.opcode == self.opcode || header.opcode == Opcode::ERROR)
    }
}

struct Shared {
    pending: Mutex<CriticalSectionRawMutex, RefCell<Option<PendingCommand>>>,
    connected: AtomicBool,
    shutdown: Notify,
}

impl Shared {
    fn take_pending(&self) -> Option<PendingCommand> {
        self.pending.lock(|p| p.borrow_mut().take())
    }

    fn route(&self, frame: Frame, sink: &dyn EventSink) {
        let header = frame.header;
        if header.opcode.is_event() {
            trace!("< event {} {} len {}", header.service_id, header.opcode, header.data_len);
            sink.on_event(&header, &frame.payload);
            return;
        }

        let pending = self.pending.lock(|p| {
            let mut p = p.borrow_mut();
            match p.as_ref() {
                Some(cmd) if cmd.answered_by(&header) => p.take(),
                _ => None,
            }
        });

        let Some(cmd) = pending else {
            warn!(
                "Dropping unexpected response {} {} len {}",
                header.service_id, header.opcode, header.data_len
            );
            return;
        };

        trace!(
            "< rsp {} {} len {} after {:?}",
            header.service_id,
            header.opcode,
            header.data_len,
            cmd.sent.elapsed()
        );
        let result = if header.opcode == Opcode::ERROR {
            BtpStatus::from_error_payload(&frame.payload).and_then(|status| {
                Err(Error::Status {
                    service: cmd.service,
                    opcode: cmd.opcode,
                    status,
                })
            })
        } else {
            Ok(frame.payload)
        };
        // The waiter may have timed out in the meantime.
        let _ = cmd.reply.send(result);
    }
}

/// Tears down a client's link from another task.
#[derive(Clone)]
pub struct DisconnectHandle {
    shared: Arc<Shared>,
}

impl DisconnectHandle {
    /// Close the link. Blocked commands and event waits fail with
    /// [`Error::Disconnected`].
    pub fn disconnect(&self) {
        if self.shared.connected.swap(false, Ordering::SeqCst) {
            debug!("Disconnect requested");
        }
        self.shared.shutdown.notify_one();
    }
}

/// Client side of one BTP link.
pub struct BtpClient {
    writer: tokio::sync::Mutex<Writer>,
    shared: Arc<Shared>,
    rx_task: JoinHandle<()>,
    config: ClientConfig,
}

impl BtpClient {
    /// Start a client over an already opened stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open<T: BtpIo>(io: T, sink: Arc<dyn EventSink>, config: ClientConfig) -> Self {
        let io: Box<dyn BtpIo> = Box::new(io);
        let (reader, writer) = tokio::io::split(io);
        let shared = Arc::new(Shared {
            pending: Mutex::new(RefCell::new(None)),
            connected: AtomicBool::new(true),
            shutdown: Notify::new(),
        });
        let rx_task = tokio::spawn(rx_loop(FromTokio::new(reader), shared.clone(), sink));
        Self {
            writer: tokio::sync::Mutex::new(FromTokio::new(writer)),
            shared,
            rx_task,
            config,
        }
    }

    /// Open `endpoint` and start a client on it.
    pub async fn connect(endpoint: &Endpoint, sink: Arc<dyn EventSink>, config: ClientConfig) -> Result<Self, Error> {
        let io = endpoint.open().await?;
        debug!("Connected to {}", endpoint);
        Ok(Self::open(io, sink, config))
    }

    /// The configuration this client was opened with.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Whether the link is still up.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Handle that can close this link from elsewhere.
    pub fn disconnect_handle(&self) -> DisconnectHandle {
        DisconnectHandle {
            shared: self.shared.clone(),
        }
    }

    /// Send a typed command with the configured command timeout.
    pub async fn send<C: Command>(&self, cmd: &C) -> Result<Vec<u8>, Error> {
        let frame = cmd.to_frame()?;
        self.send_frame(frame, self.config.command_timeout).await
    }

    /// Send a raw command and wait for its response payload.
    pub async fn send_command(
        &self,
        service: ServiceId,
        opcode: Opcode,
        index: Option<u8>,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, Error> {
        let frame = Frame::new(service, opcode, index, payload)?;
        self.send_frame(frame, timeout).await
    }

    async fn send_frame(&self, frame: Frame, timeout: Duration) -> Result<Vec<u8>, Error> {
        let service = frame.header.service_id;
        let opcode = frame.header.opcode;
        if !opcode.is_command() {
            return Err(Error::InvalidPacket);
        }
        if !self.is_connected() {
            return Err(Error::Disconnected);
        }

        let mut writer = self.writer.lock().await;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock(|p| {
            p.replace(Some(PendingCommand {
                service,
                opcode,
                sent: Instant::now(),
                reply: tx,
            }))
        });
        // The receive task clears `connected` before failing the pending slot,
        // so either it sees our command or we see the flag.
        if !self.is_connected() {
            self.shared.take_pending();
            return Err(Error::Disconnected);
        }

        trace!("> cmd {} {} len {}", service, opcode, frame.header.data_len);
        if let Err(e) = frame.write(&mut *writer).await {
            self.shared.take_pending();
            return Err(e.into());
        }

        let result = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Disconnected),
            Err(_) => {
                self.shared.take_pending();
                warn!("Timeout waiting for response to {} {}", service, opcode);
                Err(Error::Timeout { service, opcode })
            }
        };
        drop(writer);
        result
    }
}

impl Drop for BtpClient {
    fn drop(&mut self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        self.rx_task.abort();
    }
}

async fn rx_loop(mut reader: Reader, shared: Arc<Shared>, sink: Arc<dyn EventSink>) {
    let reason = loop {
        let frame = tokio::select! {
            res = Frame::read(&mut reader) => res,
            _ = shared.shutdown.notified() => Err(Error::Disconnected),
        };
        match frame {
            Ok(frame) => shared.route(frame, &*sink),
            Err(e) => break e,
        }
    };

    if shared.connected.swap(false, Ordering::SeqCst) {
        error!("BTP link lost: {}", reason);
    } else {
        debug!("BTP link closed");
    }
    if let Some(cmd) = shared.take_pending() {
        let err = if reason.is_fatal() { reason } else { Error::Disconnected };
        let _ = cmd.reply.send(Err(err));
    }
    sink.on_disconnect();
}
