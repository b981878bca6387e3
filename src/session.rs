//! One tester's run of test cases against its IUT.
//!
//! [`Tester`] brings the IUT and the BTP link up before a test case, routes
//! WIDs through its [`Dispatcher`] and turns a lost link into an inconclusive
//! test case instead of an aborted batch.

use core::future::Future;
use core::time::Duration;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use log::{error, info, warn};

use crate::btp::{BtpClient, BtpIo, DisconnectHandle, Error, EventSink, ServiceId};
use crate::config::SessionConfig;
use crate::stack::Stack;
use crate::wid::{Dispatcher, WidAnswer, WidRequest};

/// Lifecycle of the IUT process or board.
pub trait IutControl: Send {
    fn start(&mut self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Wait until the IUT accepts BTP connections.
    fn wait_ready(&mut self, timeout: Duration) -> impl Future<Output = Result<(), Error>> + Send;

    fn stop(&mut self) -> impl Future<Output = Result<(), Error>> + Send;
}

/// An IUT that is started and supervised by someone else.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExternalIut;

impl IutControl for ExternalIut {
    async fn start(&mut self) -> Result<(), Error> {
        Ok(())
    }

    async fn wait_ready(&mut self, _timeout: Duration) -> Result<(), Error> {
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Every WID got an answer over a working link.
    Completed,
    /// The IUT link died during the test case.
    Inconclusive,
}

/// What happened during one test case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCaseReport {
    pub name: String,
    /// WIDs in the order they were raised, with the answer given.
    pub wids: Vec<(u16, WidAnswer)>,
    pub link_error: Option<Error>,
}

impl TestCaseReport {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            wids: Vec::new(),
            link_error: None,
        }
    }

    pub fn verdict(&self) -> Verdict {
        if self.link_error.is_some() {
            Verdict::Inconclusive
        } else {
            Verdict::Completed
        }
    }
}

/// Opens the byte stream to the IUT.
pub type Connector = Box<dyn Fn() -> BoxFuture<'static, Result<Box<dyn BtpIo>, Error>> + Send + Sync>;

pub struct Tester<I> {
    config: SessionConfig,
    iut: I,
    iut_running: bool,
    needs_restart: bool,
    connector: Connector,
    link: Option<Arc<BtpClient>>,
    stack: Arc<Stack>,
    dispatcher: Dispatcher,
    current: Option<TestCaseReport>,
}

impl<I: IutControl> Tester<I> {
    pub fn new(config: SessionConfig, iut: I, dispatcher: Dispatcher) -> Self {
        let endpoint = config.endpoint.clone();
        let connector: Connector = Box::new(move || {
            let endpoint = endpoint.clone();
            async move { endpoint.open().await }.boxed()
        });
        Self {
            config,
            iut,
            iut_running: false,
            needs_restart: false,
            connector,
            link: None,
            stack: Arc::new(Stack::new()),
            dispatcher,
            current: None,
        }
    }

    /// Open links with `connector` instead of the configured endpoint.
    pub fn with_connector(mut self, connector: Connector) -> Self {
        self.connector = connector;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn stack(&self) -> &Arc<Stack> {
        &self.stack
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The live link, if any.
    pub fn client(&self) -> Option<&Arc<BtpClient>> {
        self.link.as_ref().filter(|c| c.is_connected())
    }

    /// Handle the runner can use to cancel the current test case.
    pub fn disconnect_handle(&self) -> Option<DisconnectHandle> {
        self.link.as_ref().map(|c| c.disconnect_handle())
    }

    async fn ensure_link(&mut self) -> Result<Arc<BtpClient>, Error> {
        if let Some(client) = self.client() {
            return Ok(client.clone());
        }
        if self.link.take().is_some() {
            warn!("IUT link is down, reconnecting");
        }

        if self.needs_restart && self.iut_running {
            info!("Restarting IUT");
            self.iut.stop().await?;
            self.iut_running = false;
        }
        if !self.iut_running {
            self.iut.start().await?;
            self.iut.wait_ready(self.config.iut_start_timeout).await?;
            self.iut_running = true;
            self.needs_restart = false;
        }

        self.stack.reopen();
        let io = (self.connector)().await?;
        let sink: Arc<dyn EventSink> = self.stack.clone();
        let client = Arc::new(BtpClient::open(io, sink, self.config.client.clone()));
        if self.config.wait_iut_ready {
            if let Err(e) = self.stack.wait_iut_ready(self.config.client.iut_ready_timeout).await {
                self.needs_restart = true;
                return Err(e);
            }
        }
        info!("BTP link to {} up", self.config.endpoint);
        self.link = Some(client.clone());
        Ok(client)
    }

    /// Prepare for `name`: bring the link up, reset the model and the
    /// scratch, then register `services` on the IUT.
    pub async fn begin_test_case(&mut self, name: &str, services: &[ServiceId]) -> Result<(), Error> {
        if self.current.is_some() {
            warn!("Test case {} started before the previous one ended", name);
            self.end_test_case();
        }
        let client = self.ensure_link().await?;
        self.stack.reset();
        self.dispatcher.begin_test_case(name);
        self.current = Some(TestCaseReport::new(name));
        for service in services {
            if let Err(e) = self.stack.register_service(&client, *service).await {
                if e.is_fatal() {
                    self.record_link_error(&e);
                }
                return Err(e);
            }
        }
        info!("Test case {} started", name);
        Ok(())
    }

    /// Answer a WID raised by the PTS for the current test case.
    ///
    /// Never fails: a lost link answers `false` and marks the test case
    /// inconclusive.
    pub async fn on_wid(&mut self, wid: u16, description: &str) -> WidAnswer {
        let Some(name) = self.current.as_ref().map(|r| r.name.clone()) else {
            warn!("WID {} outside of a test case", wid);
            return WidAnswer::Bool(false);
        };

        let answer = match self.client().cloned() {
            None => {
                warn!("WID {} in {} with no IUT link", wid, name);
                self.record_link_error(&Error::Disconnected);
                WidAnswer::Bool(false)
            }
            Some(client) => {
                let request = WidRequest::new(wid, description, name.as_str());
                match self.dispatcher.dispatch(&client, &self.stack, request).await {
                    Ok(answer) => answer,
                    Err(e) => {
                        self.record_link_error(&e);
                        WidAnswer::Bool(false)
                    }
                }
            }
        };

        if let Some(report) = self.current.as_mut() {
            report.wids.push((wid, answer.clone()));
        }
        answer
    }

    fn record_link_error(&mut self, e: &Error) {
        if let Some(report) = self.current.as_mut() {
            if report.link_error.is_none() {
                error!("IUT link lost during {}: {}", report.name, e);
                report.link_error = Some(e.clone());
            }
        }
        if let Some(client) = self.link.take() {
            client.disconnect_handle().disconnect();
        }
        self.needs_restart = true;
    }

    /// Take an answer a sync group left for this tester.
    pub fn take_pending_answer(&self) -> Option<(u16, WidAnswer)> {
        let name = self.current.as_ref()?.name.as_str();
        self.dispatcher.synchronizer()?.response_slot(name).take()
    }

    /// Wait up to `timeout` for an answer from a sync group.
    pub async fn wait_pending_answer(&self, timeout: Duration) -> Option<(u16, WidAnswer)> {
        let name = self.current.as_ref()?.name.clone();
        let slot = self.dispatcher.synchronizer()?.response_slot(&name);
        slot.wait(timeout).await
    }

    /// Finish the current test case and report on it.
    pub fn end_test_case(&mut self) -> Option<TestCaseReport> {
        let report = self.current.take()?;
        self.dispatcher.end_test_case();
        info!("Test case {} done: {:?}", report.name, report.verdict());
        Some(report)
    }

    /// Close the link and stop the IUT.
    pub async fn shutdown(mut self) -> Result<(), Error> {
        self.end_test_case();
        if let Some(client) = self.link.take() {
            client.disconnect_handle().disconnect();
        }
        if self.iut_running {
            self.iut.stop().await?;
        }
        Ok(())
    }
}
