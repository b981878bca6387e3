use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::time::{Duration, Instant};
use trouble_autopts::btp::{BtpClient, Error};
use trouble_autopts::config::ClientConfig;
use trouble_autopts::stack::Stack;
use trouble_autopts::wid::{
    Dispatcher, Route, Routes, SyncPoint, SyncState, Synchronizer, WidAnswer, WidRegistry, WidRequest,
};

mod common;

const LT1: &str = "GAP/CONN/DCON/BV-01-C";
const LT2: &str = "GAP/CONN/DCON/BV-01-C-LT2";

struct Link {
    btp: Arc<BtpClient>,
    stack: Arc<Stack>,
    _iut: common::SyntheticIut,
}

fn link() -> Link {
    let (host, iut) = common::link();
    let stack = Arc::new(Stack::new());
    let btp = Arc::new(BtpClient::open(host, stack.clone(), ClientConfig::default()));
    Link { btp, stack, _iut: iut }
}

impl Link {
    async fn dispatch(&self, dispatcher: &Dispatcher, wid: u16, test_case: &str) -> Result<WidAnswer, Error> {
        dispatcher
            .dispatch(&self.btp, &self.stack, WidRequest::new(wid, "desc", test_case))
            .await
    }
}

/// A registry whose handler for `wid` counts its calls and answers `answer`.
fn counting(name: &str, wid: u16, answer: &'static str, calls: Arc<AtomicUsize>) -> WidRegistry {
    WidRegistry::new(name).handler(wid, move |_ctx| {
        calls.fetch_add(1, Ordering::SeqCst);
        async move { Ok(WidAnswer::from(answer)) }.boxed()
    })
}

#[tokio::test]
async fn variant_handler_wins() {
    let variant_calls = Arc::new(AtomicUsize::new(0));
    let generic_calls = Arc::new(AtomicUsize::new(0));
    let routes = Routes::new().route(
        Route::new("GATT")
            .variant("GATT/CL", counting("gatt_cl", 7, "variant", variant_calls.clone()))
            .generic(counting("gatt", 7, "generic", generic_calls.clone())),
    );
    let dispatcher = Dispatcher::new(routes);
    let link = link();

    let answer = link.dispatch(&dispatcher, 7, "GATT/CL/GAR/BV-01-C").await.unwrap();
    assert_eq!(answer, WidAnswer::Text("variant".into()));
    assert_eq!(variant_calls.load(Ordering::SeqCst), 1);
    assert_eq!(generic_calls.load(Ordering::SeqCst), 0);

    let answer = link.dispatch(&dispatcher, 7, "GATT/SR/GAR/BV-01-C").await.unwrap();
    assert_eq!(answer, WidAnswer::Text("generic".into()));
}

#[tokio::test]
async fn unresolvable_wid_answers_false() {
    let dispatcher = Dispatcher::new(Routes::new().route(Route::new("GAP").generic(WidRegistry::new("gap"))));
    let link = link();

    assert_eq!(
        link.dispatch(&dispatcher, 9999, "GAP/CONN/NCON/BV-01-C").await,
        Ok(WidAnswer::Bool(false))
    );
    assert_eq!(
        link.dispatch(&dispatcher, 1, "NOPROFILE/X").await,
        Ok(WidAnswer::Bool(false))
    );
}

#[tokio::test]
async fn failing_handlers_answer_false() {
    let gap = WidRegistry::new("gap")
        .handler(1, |_ctx| async move { Err(Error::Handler("no peer".into())) }.boxed())
        .handler(2, |_ctx| {
            async move {
                if true {
                    panic!("handler bug");
                }
                Ok(WidAnswer::Bool(true))
            }
            .boxed()
        })
        .handler(3, |_ctx| async move { Err(Error::Disconnected) }.boxed());
    let dispatcher = Dispatcher::new(Routes::new().route(Route::new("GAP").generic(gap)));
    let link = link();

    assert_eq!(link.dispatch(&dispatcher, 1, LT1).await, Ok(WidAnswer::Bool(false)));
    assert_eq!(link.dispatch(&dispatcher, 2, LT1).await, Ok(WidAnswer::Bool(false)));
    assert_eq!(link.dispatch(&dispatcher, 3, LT1).await, Err(Error::Disconnected));
}

#[tokio::test]
async fn scratch_lives_for_one_test_case() {
    #[derive(Default)]
    struct Seen(u32);

    let gap = WidRegistry::new("gap").handler(5, |ctx| {
        let n = ctx.scratch.update(|s: &mut Seen| {
            s.0 += 1;
            s.0
        });
        async move { Ok(WidAnswer::Text(n.to_string())) }.boxed()
    });
    let mut dispatcher = Dispatcher::new(Routes::new().route(Route::new("GAP").generic(gap)));
    let link = link();

    dispatcher.begin_test_case(LT1);
    assert_eq!(link.dispatch(&dispatcher, 5, LT1).await, Ok(WidAnswer::Text("1".into())));
    assert_eq!(link.dispatch(&dispatcher, 5, LT1).await, Ok(WidAnswer::Text("2".into())));
    dispatcher.end_test_case();

    dispatcher.begin_test_case(LT1);
    assert_eq!(link.dispatch(&dispatcher, 5, LT1).await, Ok(WidAnswer::Text("1".into())));
}

#[tokio::test(start_paused = true)]
async fn two_testers_rendezvous() {
    let calls_lt1 = Arc::new(AtomicUsize::new(0));
    let calls_lt2 = Arc::new(AtomicUsize::new(0));
    let routes = Routes::new().route(
        Route::new("GAP")
            .variant("-LT2", counting("gap_lt2", 20, "lt2", calls_lt2.clone()))
            .generic(counting("gap", 10, "lt1", calls_lt1.clone())),
    );

    let synch = Arc::new(Synchronizer::new());
    let group = synch.add_group(vec![
        SyncPoint::new(LT1, 10).with_delay(Duration::from_millis(100)),
        SyncPoint::new(LT2, 20).with_delay(Duration::from_millis(300)),
    ]);

    let mut first = Dispatcher::new(routes).with_synchronizer(synch.clone());
    let mut second = first.fork();
    first.begin_test_case(LT1);
    second.begin_test_case(LT2);
    let (link1, link2) = (link(), link());

    // First arrival: told to wait, nothing runs.
    assert_eq!(link1.dispatch(&first, 10, LT1).await, Ok(WidAnswer::Wait));
    assert_eq!(calls_lt1.load(Ordering::SeqCst), 0);
    assert_eq!(synch.state(group), Some(SyncState::Collecting));

    // Second arrival runs both handlers exactly once and waits out the delays.
    let start = Instant::now();
    assert_eq!(
        link2.dispatch(&second, 20, LT2).await,
        Ok(WidAnswer::Text("lt2".into()))
    );
    assert!(start.elapsed() >= Duration::from_millis(300));
    assert_eq!(calls_lt1.load(Ordering::SeqCst), 1);
    assert_eq!(calls_lt2.load(Ordering::SeqCst), 1);
    assert_eq!(synch.state(group), Some(SyncState::Done));

    // The first tester picks its answer up when it asks again.
    assert_eq!(
        link1.dispatch(&first, 10, LT1).await,
        Ok(WidAnswer::Text("lt1".into()))
    );
    assert_eq!(calls_lt1.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn waiting_tester_gets_answer_after_its_delay() {
    let routes = Routes::new().common(WidRegistry::new("common").answer(10, true).answer(20, true));
    let synch = Arc::new(Synchronizer::new());
    synch.add_group(vec![
        SyncPoint::new(LT1, 10).with_delay(Duration::from_millis(200)),
        SyncPoint::new(LT2, 20),
    ]);

    let first = Dispatcher::new(routes).with_synchronizer(synch.clone());
    let second = first.fork();
    let (link1, link2) = (link(), link());

    assert_eq!(link1.dispatch(&first, 10, LT1).await, Ok(WidAnswer::Wait));
    let slot = synch.response_slot(LT1);

    let start = Instant::now();
    let waiter = tokio::spawn(async move { slot.wait(Duration::from_secs(5)).await });
    assert_eq!(link2.dispatch(&second, 20, LT2).await, Ok(WidAnswer::Bool(true)));

    let answer = waiter.await.unwrap();
    assert_eq!(answer, Some((10, WidAnswer::Bool(true))));
    assert!(start.elapsed() >= Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn sync_answer_does_not_outlive_its_test_case() {
    let calls_lt1 = Arc::new(AtomicUsize::new(0));
    let routes = Routes::new().route(
        Route::new("GAP")
            .variant("-LT2", WidRegistry::new("gap_lt2").answer(20, true))
            .generic(counting("gap", 10, "fresh", calls_lt1.clone())),
    );
    let synch = Arc::new(Synchronizer::new());
    synch.add_group(vec![SyncPoint::new(LT1, 10), SyncPoint::new(LT2, 20)]);

    let mut first = Dispatcher::new(routes).with_synchronizer(synch.clone());
    let mut second = first.fork();
    first.begin_test_case(LT1);
    second.begin_test_case(LT2);
    let (link1, link2) = (link(), link());

    assert_eq!(link1.dispatch(&first, 10, LT1).await, Ok(WidAnswer::Wait));
    assert_eq!(link2.dispatch(&second, 20, LT2).await, Ok(WidAnswer::Bool(true)));
    assert_eq!(calls_lt1.load(Ordering::SeqCst), 1);
    assert!(synch.response_slot(LT1).is_set());

    // LT1 never collected its answer; the rerun must not see it.
    first.end_test_case();
    first.begin_test_case(LT1);
    assert_eq!(
        link1.dispatch(&first, 10, LT1).await,
        Ok(WidAnswer::Text("fresh".into()))
    );
    assert_eq!(calls_lt1.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn ending_test_case_cancels_its_groups() {
    let calls = Arc::new(AtomicUsize::new(0));
    let routes = Routes::new().route(Route::new("GAP").generic(counting("gap", 10, "solo", calls.clone())));
    let synch = Arc::new(Synchronizer::new());
    let group = synch.add_group(vec![SyncPoint::new(LT1, 10), SyncPoint::new(LT2, 20)]);

    let mut first = Dispatcher::new(routes).with_synchronizer(synch.clone());
    first.begin_test_case(LT1);
    let link1 = link();

    assert_eq!(link1.dispatch(&first, 10, LT1).await, Ok(WidAnswer::Wait));
    assert_eq!(synch.state(group), Some(SyncState::Collecting));

    first.end_test_case();
    assert_eq!(synch.state(group), Some(SyncState::Done));
    assert_eq!(synch.live_groups(), 0);
    assert!(!synch.is_synchronized(LT1, 10));
    // The deferred job was dropped unrun.
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    // The link it held is released.
    assert_eq!(Arc::strong_count(&link1.btp), 1);
}
