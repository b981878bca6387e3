//! Host side of an auto-pts style qualification run.
//!
//! The PTS drives test cases and raises WIDs (dialogs). This crate answers
//! them by talking to the implementation under test (IUT) over the
//! Bluetooth Test Protocol (BTP).
//!
//! # Architecture
//!
//! - `btp` - BTP wire format, typed commands and events, and [`BtpClient`],
//!   the lock-step command transport with out-of-band event delivery
//! - `stack` - [`Stack`], the host side model of the IUT fed by BTP events,
//!   with one queue per event kind
//! - `wid` - WID registries, resolution by test case name, dispatch, and the
//!   [`Synchronizer`] that coordinates WIDs across testers
//! - `session` - [`Tester`], one tester's test case lifecycle including IUT
//!   restart after link loss
//! - `config` - timeouts and endpoints
//!
//! # Example
//!
//! ```no_run
//! use futures::FutureExt;
//! use trouble_autopts::btp::Endpoint;
//! use trouble_autopts::config::SessionConfig;
//! use trouble_autopts::session::{ExternalIut, Tester};
//! use trouble_autopts::wid::{Dispatcher, Route, Routes, WidAnswer, WidRegistry};
//!
//! # async fn run() -> Result<(), trouble_autopts::btp::Error> {
//! let gap = WidRegistry::new("gap").handler(108, |ctx| {
//!     async move {
//!         ctx.stack.gap().set_connectable(ctx.btp, true).await?;
//!         Ok(WidAnswer::Bool(true))
//!     }
//!     .boxed()
//! });
//! let routes = Routes::new().route(Route::new("GAP").generic(gap));
//!
//! let endpoint: Endpoint = "tcp:127.0.0.1:65000".parse()?;
//! let mut tester = Tester::new(SessionConfig::new(endpoint), ExternalIut, Dispatcher::new(routes));
//! tester.begin_test_case("GAP/CONN/UCON/BV-01-C", &[trouble_autopts::btp::ServiceId::GAP]).await?;
//! let answer = tester.on_wid(108, "Please make the IUT connectable").await;
//! println!("{}", answer.as_wire());
//! let _report = tester.end_test_case();
//! # Ok(())
//! # }
//! ```

pub mod btp;
pub mod config;
pub mod session;
pub mod stack;
pub mod wid;

pub use btp::{BtpClient, Endpoint, Error};
pub use session::{ExternalIut, IutControl, TestCaseReport, Tester, Verdict};
pub use stack::Stack;
pub use wid::{Dispatcher, Synchronizer, WidAnswer, WidRequest};
