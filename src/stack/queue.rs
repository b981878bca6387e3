//! Timed FIFO of decoded events.

use core::cell::RefCell;
use core::time::Duration;
use std::collections::VecDeque;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::btp::Error;

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
    taker: bool,
}

/// Unbounded, insertion-ordered queue filled by the receive task and drained
/// by WID handlers.
///
/// Consumption is explicit: [`peek_matching`](Self::peek_matching) never
/// removes anything, [`take_matching`](Self::take_matching) removes the first
/// match and admits a single waiting consumer at a time.
pub struct EventQueue<T> {
    name: &'static str,
    inner: Mutex<CriticalSectionRawMutex, RefCell<Inner<T>>>,
    notify: Notify,
}

struct TakerGuard<'a, T> {
    queue: &'a EventQueue<T>,
}

impl<T> Drop for TakerGuard<'_, T> {
    fn drop(&mut self) {
        self.queue.inner.lock(|i| i.borrow_mut().taker = false);
    }
}

impl<T> EventQueue<T> {
    /// Create an empty, open queue.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(RefCell::new(Inner {
                items: VecDeque::new(),
                closed: false,
                taker: false,
            })),
            notify: Notify::new(),
        }
    }

    /// Queue name used in logs and errors.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Append an event and wake every waiter.
    pub fn push(&self, item: T) {
        self.inner.lock(|i| i.borrow_mut().items.push_back(item));
        self.notify.notify_waiters();
    }

    /// Drop every queued event.
    pub fn clear(&self) {
        self.inner.lock(|i| i.borrow_mut().items.clear());
    }

    /// Keep only the events for which `keep` returns true.
    pub fn retain(&self, keep: impl FnMut(&T) -> bool) {
        self.inner.lock(|i| i.borrow_mut().items.retain(keep));
    }

    /// Mark the queue as closed. Waiters that find no match fail with
    /// [`Error::Disconnected`]; queued events can still be drained.
    pub fn close(&self) {
        self.inner.lock(|i| i.borrow_mut().closed = true);
        self.notify.notify_waiters();
    }

    /// Accept waiters again after [`close`](Self::close).
    pub fn reopen(&self) {
        self.inner.lock(|i| i.borrow_mut().closed = false);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock(|i| i.borrow().closed)
    }

    pub fn len(&self) -> usize {
        self.inner.lock(|i| i.borrow().items.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return the first matching event without waiting.
    pub fn try_take_matching(&self, pred: impl Fn(&T) -> bool) -> Option<T> {
        self.inner.lock(|i| take_first(&mut i.borrow_mut().items, &pred))
    }

    /// Wait up to `timeout` for a matching event and remove it.
    ///
    /// Returns `Ok(None)` on timeout. Fails with [`Error::QueueBusy`] if
    /// another consumer is already waiting on this queue.
    pub async fn take_matching(&self, timeout: Duration, pred: impl Fn(&T) -> bool) -> Result<Option<T>, Error> {
        let acquired = self.inner.lock(|i| {
            let mut i = i.borrow_mut();
            if i.taker {
                false
            } else {
                i.taker = true;
                true
            }
        });
        if !acquired {
            return Err(Error::QueueBusy(self.name));
        }
        let _guard = TakerGuard { queue: self };
        self.wait_for(timeout, |items| take_first(items, &pred)).await
    }

    /// Wait up to `timeout` for the oldest event.
    pub async fn take(&self, timeout: Duration) -> Result<Option<T>, Error> {
        self.take_matching(timeout, |_| true).await
    }

    async fn wait_for<R>(
        &self,
        timeout: Duration,
        mut probe: impl FnMut(&mut VecDeque<T>) -> Option<R>,
    ) -> Result<Option<R>, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before looking so a push between the check and the
            // await is not missed.
            notified.as_mut().enable();

            let (found, closed) = self.inner.lock(|i| {
                let mut i = i.borrow_mut();
                let found = probe(&mut i.items);
                (found, i.closed)
            });
            if found.is_some() {
                return Ok(found);
            }
            if closed {
                return Err(Error::Disconnected);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }
}

impl<T: Clone> EventQueue<T> {
    /// Wait up to `timeout` for a matching event and return a copy, leaving
    /// it queued for others.
    pub async fn peek_matching(&self, timeout: Duration, pred: impl Fn(&T) -> bool) -> Result<Option<T>, Error> {
        self.wait_for(timeout, |items| items.iter().find(|item| pred(item)).cloned())
            .await
    }

    /// Copy of everything queued right now.
    pub fn snapshot(&self) -> Vec<T> {
        self.inner.lock(|i| i.borrow().items.iter().cloned().collect())
    }
}

fn take_first<T>(items: &mut VecDeque<T>, pred: &impl Fn(&T) -> bool) -> Option<T> {
    let pos = items.iter().position(pred)?;
    items.remove(pos)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fifo_then_timeout() {
        let q = EventQueue::new("test");
        q.push(1);
        q.push(2);

        let t = Duration::from_secs(1);
        assert_eq!(q.take(t).await, Ok(Some(1)));
        assert_eq!(q.take(t).await, Ok(Some(2)));

        let start = Instant::now();
        assert_eq!(q.take(t).await, Ok(None));
        let waited = start.elapsed();
        assert!(waited >= t && waited < t + Duration::from_millis(50), "{waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn take_wakes_on_push() {
        let q = Arc::new(EventQueue::new("test"));
        let producer = q.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            producer.push("late");
        });
        assert_eq!(q.take(Duration::from_secs(5)).await, Ok(Some("late")));
    }

    #[tokio::test]
    async fn peek_leaves_event_queued() {
        let q = EventQueue::new("test");
        q.push((1u8, "a"));
        q.push((2u8, "b"));

        let t = Duration::from_millis(10);
        assert_eq!(q.peek_matching(t, |e| e.0 == 2).await, Ok(Some((2, "b"))));
        assert_eq!(q.len(), 2);
        assert_eq!(q.take_matching(t, |e| e.0 == 2).await, Ok(Some((2, "b"))));
        assert_eq!(q.snapshot(), vec![(1, "a")]);
    }

    #[tokio::test(start_paused = true)]
    async fn second_taker_is_busy() {
        let q = Arc::new(EventQueue::<u8>::new("gap.connected"));
        let first = {
            let q = q.clone();
            tokio::spawn(async move { q.take(Duration::from_secs(10)).await })
        };
        tokio::task::yield_now().await;

        assert_eq!(
            q.take(Duration::from_secs(1)).await,
            Err(Error::QueueBusy("gap.connected"))
        );
        // Peeking is always allowed.
        assert_eq!(q.peek_matching(Duration::from_millis(1), |_| true).await, Ok(None));

        q.push(7);
        assert_eq!(first.await.unwrap(), Ok(Some(7)));

        // The slot is free again once the first consumer is done.
        q.push(8);
        assert_eq!(q.take(Duration::from_secs(1)).await, Ok(Some(8)));
    }

    #[tokio::test]
    async fn close_fails_waiters_but_keeps_items() {
        let q = Arc::new(EventQueue::<u8>::new("test"));
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.take_matching(Duration::from_secs(30), |v| *v == 9).await })
        };
        tokio::task::yield_now().await;

        q.push(1);
        q.close();
        assert_eq!(waiter.await.unwrap(), Err(Error::Disconnected));

        assert_eq!(q.take(Duration::from_secs(1)).await, Ok(Some(1)));
        assert_eq!(q.take(Duration::from_secs(1)).await, Err(Error::Disconnected));

        q.reopen();
        q.push(2);
        assert_eq!(q.try_take_matching(|_| true), Some(2));
    }

    #[test]
    fn clear_empties() {
        let q = EventQueue::new("test");
        q.push(1);
        q.push(2);
        q.clear();
        assert!(q.is_empty());
        assert_eq!(q.try_take_matching(|_| true), None);
    }
}
