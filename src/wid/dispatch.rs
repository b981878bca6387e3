//! Resolve and run WID handlers.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use log::{error, info, warn};

use super::registry::{Resolved, Routes};
use super::synch::{Arrival, SyncJob, Synchronizer};
use super::{Scratch, WidAnswer, WidContext, WidRequest};
use crate::btp::{BtpClient, Error};
use crate::stack::Stack;

/// Routes WIDs of one tester to their handlers.
///
/// Owns the tester's test-case [`Scratch`]. Unknown WIDs and failing
/// handlers answer `false`; only errors that mean the IUT link is gone are
/// returned to the caller.
pub struct Dispatcher {
    routes: Arc<Routes>,
    synch: Option<Arc<Synchronizer>>,
    scratch: Arc<Scratch>,
    test_case: Option<String>,
}

impl Dispatcher {
    pub fn new(routes: impl Into<Arc<Routes>>) -> Self {
        Self {
            routes: routes.into(),
            synch: None,
            scratch: Arc::new(Scratch::new()),
            test_case: None,
        }
    }

    /// Coordinate synchronized WIDs through `synch`.
    pub fn with_synchronizer(mut self, synch: Arc<Synchronizer>) -> Self {
        self.synch = Some(synch);
        self
    }

    /// A dispatcher over the same routes and synchronizer with its own scratch.
    pub fn fork(&self) -> Self {
        Self {
            routes: self.routes.clone(),
            synch: self.synch.clone(),
            scratch: Arc::new(Scratch::new()),
            test_case: None,
        }
    }

    pub fn routes(&self) -> &Routes {
        &self.routes
    }

    pub fn synchronizer(&self) -> Option<&Arc<Synchronizer>> {
        self.synch.as_ref()
    }

    pub fn scratch(&self) -> &Scratch {
        &self.scratch
    }

    pub fn test_case(&self) -> Option<&str> {
        self.test_case.as_deref()
    }

    /// Start a test case with an empty scratch and no pending sync answer.
    pub fn begin_test_case(&mut self, name: &str) {
        self.end_test_case();
        if let Some(synch) = &self.synch {
            synch.begin_test_case(name);
        }
        self.scratch = Arc::new(Scratch::new());
        self.test_case = Some(name.to_string());
    }

    /// Drop the scratch, cancel the test case's sync groups and discard any
    /// answer it never collected.
    pub fn end_test_case(&mut self) {
        self.scratch.clear();
        if let (Some(synch), Some(name)) = (&self.synch, self.test_case.take()) {
            synch.end_test_case(&name);
        }
    }

    pub fn resolve(&self, request: &WidRequest) -> Option<Resolved> {
        self.routes.resolve(request.wid, &request.test_case)
    }

    /// Answer one WID.
    ///
    /// Returns `Err` only for fatal transport errors.
    pub async fn dispatch(&self, btp: &Arc<BtpClient>, stack: &Arc<Stack>, request: WidRequest) -> Result<WidAnswer, Error> {
        if let Some(synch) = &self.synch {
            if let Some(answer) = synch.response_slot(&request.test_case).take_for(request.wid) {
                info!("WID {} answered by sync group: {}", request.wid, answer);
                return Ok(answer);
            }
            if synch.is_synchronized(&request.test_case, request.wid) {
                return self.dispatch_synchronized(synch, btp, stack, request).await;
            }
        }

        let Some(resolved) = self.resolve(&request) else {
            return Ok(unresolved(&request));
        };
        info!(
            "WID {} in {} -> {}",
            request.wid, request.test_case, resolved.registry
        );
        let ctx = WidContext {
            btp,
            stack,
            request: &request,
            scratch: &self.scratch,
        };
        guarded(&request, resolved.handler.call(ctx)).await
    }

    async fn dispatch_synchronized(
        &self,
        synch: &Synchronizer,
        btp: &Arc<BtpClient>,
        stack: &Arc<Stack>,
        request: WidRequest,
    ) -> Result<WidAnswer, Error> {
        let wid = request.wid;
        let test_case = request.test_case.clone();
        let job = self.deferred(btp.clone(), stack.clone(), request);

        match synch.arrive(&test_case, wid, job) {
            Arrival::Unmatched(job) => (job.0)().await,
            Arrival::Wait => Ok(WidAnswer::Wait),
            Arrival::Ready(group, actions) => {
                synch.begin_dispatch(group);
                for action in actions {
                    let answer = match (action.job)().await {
                        Ok(answer) => answer,
                        Err(e) if action.point.test_case == test_case => {
                            synch.cancel(group);
                            return Err(e);
                        }
                        // Another tester's link died; it will find out on its own.
                        Err(_) => WidAnswer::Bool(false),
                    };
                    synch.prepare_pending_response(group, action.point, answer);
                }
                synch.set_pending_responses_if_any(group).await;
                // Our own answer is in our slot like everyone else's.
                Ok(synch
                    .response_slot(&test_case)
                    .take_for(wid)
                    .unwrap_or(WidAnswer::Wait))
            }
        }
    }

    /// Package the handler call so another tester's task can run it.
    fn deferred(&self, btp: Arc<BtpClient>, stack: Arc<Stack>, request: WidRequest) -> SyncJob {
        let resolved = self.resolve(&request);
        let scratch = self.scratch.clone();
        Box::new(move || {
            async move {
                let Some(resolved) = resolved else {
                    return Ok(unresolved(&request));
                };
                let ctx = WidContext {
                    btp: &btp,
                    stack: &stack,
                    request: &request,
                    scratch: &scratch,
                };
                guarded(&request, resolved.handler.call(ctx)).await
            }
            .boxed()
        })
    }
}

fn unresolved(request: &WidRequest) -> WidAnswer {
    warn!(
        "No handler for WID {} in {}: {}",
        request.wid, request.test_case, request.description
    );
    WidAnswer::Bool(false)
}

/// Run a handler, turning its failures and panics into `false`, except
/// fatal transport errors which are passed up.
async fn guarded(request: &WidRequest, fut: BoxFuture<'_, Result<WidAnswer, Error>>) -> Result<WidAnswer, Error> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(answer)) => Ok(answer),
        Ok(Err(e)) if e.is_fatal() => {
            error!(
                "WID {} in {} aborted, IUT link lost: {}",
                request.wid, request.test_case, e
            );
            Err(e)
        }
        Ok(Err(e)) => {
            error!(
                "WID {} in {} failed: {} (description: {})",
                request.wid, request.test_case, e, request.description
            );
            Ok(WidAnswer::Bool(false))
        }
        Err(panic) => {
            error!(
                "WID {} in {} panicked: {} (description: {})",
                request.wid,
                request.test_case,
                panic_message(&*panic),
                request.description
            );
            Ok(WidAnswer::Bool(false))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
