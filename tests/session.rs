use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::time::Duration;
use trouble_autopts::btp::protocol::gap::opcodes as gap_opcodes;
use trouble_autopts::btp::{Endpoint, Error, ServiceId};
use trouble_autopts::config::SessionConfig;
use trouble_autopts::session::{IutControl, Tester, Verdict};
use trouble_autopts::wid::{Dispatcher, Route, Routes, WidAnswer, WidRegistry};

mod common;

const TC: &str = "GAP/CONN/UCON/BV-01-C";

#[derive(Clone, Default)]
struct CountingIut {
    starts: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
}

impl IutControl for CountingIut {
    async fn start(&mut self) -> Result<(), Error> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_ready(&mut self, _timeout: Duration) -> Result<(), Error> {
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), Error> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn dispatcher() -> Dispatcher {
    let gap = WidRegistry::new("gap")
        .answer(1, true)
        .handler(108, |ctx| {
            async move {
                ctx.stack.gap().set_connectable(ctx.btp, true).await?;
                Ok(WidAnswer::Bool(true))
            }
            .boxed()
        })
        .handler(2, |_ctx| async move { Err(Error::Handler("bad description".into())) }.boxed());
    Dispatcher::new(Routes::new().route(Route::new("GAP").generic(gap)))
}

fn tester(iut: CountingIut, links: Arc<common::Links>) -> Tester<CountingIut> {
    Tester::new(SessionConfig::new(Endpoint::default()), iut, dispatcher())
        .with_connector(common::serving_connector(links))
}

#[tokio::test]
async fn completed_test_case_report() {
    let _ = env_logger::try_init();
    let links = Arc::new(common::Links::default());
    let mut tester = tester(CountingIut::default(), links.clone());

    tester.begin_test_case(TC, &[ServiceId::GAP]).await.unwrap();
    assert!(tester.stack().core().is_registered(ServiceId::GAP));

    assert_eq!(tester.on_wid(1, "Is the IUT ready?").await, WidAnswer::Bool(true));
    assert_eq!(tester.on_wid(108, "Make the IUT connectable").await, WidAnswer::Bool(true));
    // A handler error is a failed WID, not a lost link.
    assert_eq!(tester.on_wid(2, "garbled").await, WidAnswer::Bool(false));

    let report = tester.end_test_case().unwrap();
    assert_eq!(report.name, TC);
    assert_eq!(report.verdict(), Verdict::Completed);
    assert_eq!(
        report.wids,
        vec![
            (1, WidAnswer::Bool(true)),
            (108, WidAnswer::Bool(true)),
            (2, WidAnswer::Bool(false)),
        ]
    );

    // The link is reused for the next test case.
    tester.begin_test_case(TC, &[ServiceId::GAP]).await.unwrap();
    assert_eq!(links.opened(), 1);
    tester.shutdown().await.unwrap();
}

#[tokio::test]
async fn lost_link_is_inconclusive_and_recovers() {
    let iut = CountingIut::default();
    let links = Arc::new(common::Links::default());
    *links.hang_up.lock().unwrap() = Some((ServiceId::GAP, gap_opcodes::SET_CONNECTABLE));
    let mut tester = tester(iut.clone(), links.clone());

    tester.begin_test_case(TC, &[ServiceId::GAP]).await.unwrap();
    assert_eq!(iut.starts.load(Ordering::SeqCst), 1);

    assert_eq!(tester.on_wid(108, "Make the IUT connectable").await, WidAnswer::Bool(false));
    assert!(tester.client().is_none());
    // Later WIDs of the same test case still get an answer.
    assert_eq!(tester.on_wid(1, "Is the IUT ready?").await, WidAnswer::Bool(false));

    let report = tester.end_test_case().unwrap();
    assert_eq!(report.verdict(), Verdict::Inconclusive);
    assert!(report.link_error.as_ref().is_some_and(Error::is_fatal));
    assert_eq!(report.wids.len(), 2);

    *links.hang_up.lock().unwrap() = None;
    tester.begin_test_case(TC, &[ServiceId::GAP]).await.unwrap();
    assert_eq!(links.opened(), 2);
    assert_eq!(iut.stops.load(Ordering::SeqCst), 1);
    assert_eq!(iut.starts.load(Ordering::SeqCst), 2);

    assert_eq!(tester.on_wid(108, "Make the IUT connectable").await, WidAnswer::Bool(true));
    let report = tester.end_test_case().unwrap();
    assert_eq!(report.verdict(), Verdict::Completed);

    tester.shutdown().await.unwrap();
    assert_eq!(iut.stops.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn wid_outside_test_case_answers_false() {
    let links = Arc::new(common::Links::default());
    let mut tester = tester(CountingIut::default(), links.clone());

    assert_eq!(tester.on_wid(1, "Is the IUT ready?").await, WidAnswer::Bool(false));
    assert!(tester.end_test_case().is_none());
    assert_eq!(links.opened(), 0);
}
