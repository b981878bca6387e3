//! Multi-tester rendezvous for synchronized WIDs.
//!
//! A group lists the `(test case, wid)` points that must all be reached
//! before any of them is answered. Each tester arriving at a point leaves a
//! deferred job and gets [`WidAnswer::Wait`] back. The tester that completes
//! the group receives every job, runs them, and the answers are delivered to
//! each tester's [`ResponseSlot`] after that tester's delay.
//!
//! ```text
//! Collecting --last arrival--> Ready --begin_dispatch--> Dispatching --flush--> Done
//! ```
//!
//! A group whose testers never all arrive stays `Collecting`; the test case
//! timeout of the runner is the only bound.

use core::cell::RefCell;
use core::fmt;
use core::time::Duration;
use std::collections::BTreeMap;
use std::sync::Arc;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use futures::future::{join_all, BoxFuture};
use log::{debug, info, warn};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{WidAnswer, WidResult};

/// One tester's place in a synchronized group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPoint {
    pub test_case: String,
    pub wid: u16,
    /// Wait this long before handing the answer to the tester.
    pub delay: Duration,
}

impl SyncPoint {
    pub fn new(test_case: impl Into<String>, wid: u16) -> Self {
        Self {
            test_case: test_case.into(),
            wid,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn is(&self, test_case: &str, wid: u16) -> bool {
        self.wid == wid && self.test_case == test_case
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Collecting,
    Ready,
    Dispatching,
    Done,
}

/// Stable index of a group in the synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId(usize);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Deferred handler invocation left by an arriving tester.
pub type SyncJob = Box<dyn FnOnce() -> BoxFuture<'static, WidResult> + Send>;

/// Work handed to the tester that completed a group, one per point.
pub struct SyncAction {
    pub point: SyncPoint,
    pub job: SyncJob,
}

impl fmt::Debug for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncAction").field("point", &self.point).finish_non_exhaustive()
    }
}

/// Outcome of [`Synchronizer::arrive`].
#[derive(Debug)]
pub enum Arrival {
    /// The point does not belong to any live group; run the job directly.
    Unmatched(SyncJobBox),
    /// Other testers have not arrived yet, or the answer is being prepared.
    Wait,
    /// This arrival completed the group.
    Ready(GroupId, Vec<SyncAction>),
}

/// Debug-printable wrapper around a [`SyncJob`].
pub struct SyncJobBox(pub SyncJob);

impl fmt::Debug for SyncJobBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SyncJob")
    }
}

struct Group {
    points: Vec<SyncPoint>,
    jobs: Vec<Option<SyncJob>>,
    prepared: Vec<(SyncPoint, WidAnswer)>,
    state: SyncState,
}

/// Pending answer of one tester.
pub struct ResponseSlot {
    value: Mutex<CriticalSectionRawMutex, RefCell<Option<(u16, WidAnswer)>>>,
    notify: Notify,
}

impl Default for ResponseSlot {
    fn default() -> Self {
        Self {
            value: Mutex::new(RefCell::new(None)),
            notify: Notify::new(),
        }
    }
}

impl ResponseSlot {
    pub fn set(&self, wid: u16, answer: WidAnswer) {
        let replaced = self.value.lock(|v| v.borrow_mut().replace((wid, answer)));
        if let Some((old, _)) = replaced {
            warn!("Unclaimed answer for WID {} overwritten", old);
        }
        self.notify.notify_waiters();
    }

    pub fn take(&self) -> Option<(u16, WidAnswer)> {
        self.value.lock(|v| v.borrow_mut().take())
    }

    /// Take the answer only if it is for `wid`.
    pub fn take_for(&self, wid: u16) -> Option<WidAnswer> {
        self.value.lock(|v| {
            let mut v = v.borrow_mut();
            match v.as_ref() {
                Some((w, _)) if *w == wid => v.take().map(|(_, a)| a),
                _ => None,
            }
        })
    }

    pub fn is_set(&self) -> bool {
        self.value.lock(|v| v.borrow().is_some())
    }

    /// Wait up to `timeout` for an answer and take it.
    pub async fn wait(&self, timeout: Duration) -> Option<(u16, WidAnswer)> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(v) = self.take() {
                return Some(v);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }
}

/// Live groups by id; retired groups are dropped from the map.
struct Table {
    groups: BTreeMap<usize, Group>,
    next_group: usize,
    slots: BTreeMap<String, Arc<ResponseSlot>>,
}

impl Table {
    fn live(&self, test_case: &str, wid: u16) -> Option<usize> {
        self.groups
            .iter()
            .find(|(_, g)| g.points.iter().any(|p| p.is(test_case, wid)))
            .map(|(id, _)| *id)
    }
}

/// Coordinator shared by all testers of a run.
///
/// One lock guards the whole group table, so "last tester to arrive" is
/// decided atomically. No lock is held while jobs run or delays elapse.
pub struct Synchronizer {
    table: Mutex<CriticalSectionRawMutex, RefCell<Table>>,
}

impl Default for Synchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Synchronizer {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(RefCell::new(Table {
                groups: BTreeMap::new(),
                next_group: 0,
                slots: BTreeMap::new(),
            })),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Table) -> R) -> R {
        self.table.lock(|t| f(&mut t.borrow_mut()))
    }

    /// Register a group of points that must be reached together.
    pub fn add_group(&self, points: Vec<SyncPoint>) -> GroupId {
        self.with(|t| {
            let id = GroupId(t.next_group);
            t.next_group += 1;
            debug!("Sync group {} over {:?}", id, points);
            t.groups.insert(
                id.0,
                Group {
                    jobs: points.iter().map(|_| None).collect(),
                    points,
                    prepared: Vec::new(),
                    state: SyncState::Collecting,
                },
            );
            id
        })
    }

    /// Whether `(test_case, wid)` belongs to a group that is not retired.
    pub fn is_synchronized(&self, test_case: &str, wid: u16) -> bool {
        self.with(|t| t.live(test_case, wid).is_some())
    }

    pub fn state(&self, group: GroupId) -> Option<SyncState> {
        self.with(|t| match t.groups.get(&group.0) {
            Some(g) => Some(g.state),
            None if group.0 < t.next_group => Some(SyncState::Done),
            None => None,
        })
    }

    /// Answer slot of the tester running `test_case`.
    pub fn response_slot(&self, test_case: &str) -> Arc<ResponseSlot> {
        self.with(|t| t.slots.entry(test_case.to_string()).or_default().clone())
    }

    /// Record that the tester running `test_case` reached `wid`.
    ///
    /// Never blocks. A tester that arrives twice keeps its first job.
    pub fn arrive(&self, test_case: &str, wid: u16, job: SyncJob) -> Arrival {
        self.with(|t| {
            let Some(gid) = t.live(test_case, wid) else {
                return Arrival::Unmatched(SyncJobBox(job));
            };
            let Some(group) = t.groups.get_mut(&gid) else {
                return Arrival::Unmatched(SyncJobBox(job));
            };
            if group.state != SyncState::Collecting {
                return Arrival::Wait;
            }

            for (point, slot) in group.points.iter().zip(group.jobs.iter_mut()) {
                if point.is(test_case, wid) && slot.is_none() {
                    *slot = Some(job);
                    break;
                }
            }

            if group.jobs.iter().any(Option::is_none) {
                let arrived = group.jobs.iter().filter(|j| j.is_some()).count();
                info!(
                    "{} reached WID {} ({}/{} testers)",
                    test_case,
                    wid,
                    arrived,
                    group.points.len()
                );
                return Arrival::Wait;
            }

            group.state = SyncState::Ready;
            let actions = group
                .points
                .iter()
                .cloned()
                .zip(group.jobs.iter_mut().filter_map(Option::take))
                .map(|(point, job)| SyncAction { point, job })
                .collect();
            info!("Sync group {} ready", GroupId(gid));
            Arrival::Ready(GroupId(gid), actions)
        })
    }

    /// Mark a ready group as being dispatched.
    pub fn begin_dispatch(&self, group: GroupId) {
        self.with(|t| {
            if let Some(g) = t.groups.get_mut(&group.0) {
                if g.state == SyncState::Ready {
                    g.state = SyncState::Dispatching;
                }
            }
        });
    }

    /// Stage the answer for one point of a dispatching group.
    pub fn prepare_pending_response(&self, group: GroupId, point: SyncPoint, answer: WidAnswer) {
        self.with(|t| {
            if let Some(g) = t.groups.get_mut(&group.0) {
                if g.state == SyncState::Dispatching {
                    g.prepared.push((point, answer));
                }
            }
        });
    }

    /// Deliver every staged answer to its tester's slot, each after its own
    /// delay, then retire the group.
    pub async fn set_pending_responses_if_any(&self, group: GroupId) {
        let prepared = self.with(|t| match t.groups.get_mut(&group.0) {
            Some(g) if g.state == SyncState::Dispatching => core::mem::take(&mut g.prepared),
            _ => Vec::new(),
        });

        let deliveries = prepared.into_iter().map(|(point, answer)| {
            let slot = self.response_slot(&point.test_case);
            async move {
                if !point.delay.is_zero() {
                    tokio::time::sleep(point.delay).await;
                }
                debug!("{} WID {} -> {}", point.test_case, point.wid, answer);
                slot.set(point.wid, answer);
            }
        });
        join_all(deliveries).await;

        self.with(|t| t.groups.remove(&group.0));
    }

    /// Retire a group without answering it.
    pub fn cancel(&self, group: GroupId) {
        if let Some(g) = self.with(|t| t.groups.remove(&group.0)) {
            warn!("Sync group {} cancelled in state {:?}", group, g.state);
        }
    }

    /// Retire every live group `test_case` takes part in.
    pub fn cancel_test_case(&self, test_case: &str) {
        let ids: Vec<GroupId> = self.with(|t| {
            t.groups
                .iter()
                .filter(|(_, g)| g.points.iter().any(|p| p.test_case == test_case))
                .map(|(id, _)| GroupId(*id))
                .collect()
        });
        for id in ids {
            self.cancel(id);
        }
    }

    /// Start `test_case` with an empty answer slot.
    pub fn begin_test_case(&self, test_case: &str) {
        if let Some((wid, answer)) = self.response_slot(test_case).take() {
            warn!("{}: dropping stale answer {} for WID {}", test_case, answer, wid);
        }
    }

    /// Retire `test_case`: cancel its live groups and drop its answer slot.
    pub fn end_test_case(&self, test_case: &str) {
        self.cancel_test_case(test_case);
        let slot = self.with(|t| t.slots.remove(test_case));
        if let Some((wid, answer)) = slot.and_then(|s| s.take()) {
            warn!("{}: answer {} for WID {} never collected", test_case, answer, wid);
        }
    }

    /// Number of groups not yet retired.
    pub fn live_groups(&self) -> usize {
        self.with(|t| t.groups.len())
    }
}
