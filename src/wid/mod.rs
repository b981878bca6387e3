//! WID handling: request/answer types, the handler trait and the
//! per-test-case scratch store.
//!
//! A WID is a numbered dialog the PTS raises during a test case. Handlers are
//! registered in a [`WidRegistry`](registry::WidRegistry), resolved by the
//! [`Dispatcher`](dispatch::Dispatcher) and answer with a [`WidAnswer`].

use core::any::{Any, TypeId};
use core::cell::RefCell;
use core::fmt;
use std::collections::HashMap;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use futures::future::BoxFuture;

use crate::btp::{BtpClient, Error};
use crate::stack::Stack;

pub mod dispatch;
pub mod registry;
pub mod synch;
pub mod text;

pub use self::dispatch::Dispatcher;
pub use self::registry::{Route, Routes, WidRegistry};
pub use self::synch::{GroupId, ResponseSlot, SyncPoint, SyncState, Synchronizer};

/// One dialog raised by the PTS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidRequest {
    pub wid: u16,
    pub description: String,
    pub test_case: String,
}

impl WidRequest {
    pub fn new(wid: u16, description: impl Into<String>, test_case: impl Into<String>) -> Self {
        Self {
            wid,
            description: description.into(),
            test_case: test_case.into(),
        }
    }

    /// Profile part of the test case name, e.g. `GATT` for `GATT/CL/GAR/BV-01-C`.
    pub fn profile(&self) -> &str {
        profile_of(&self.test_case)
    }
}

pub(crate) fn profile_of(test_case: &str) -> &str {
    test_case.split('/').next().unwrap_or(test_case)
}

/// Answer returned to the PTS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WidAnswer {
    Bool(bool),
    Text(String),
    /// The answer is deferred until the other testers of a synchronized
    /// group have reached the same WID.
    Wait,
}

impl WidAnswer {
    pub fn is_wait(&self) -> bool {
        matches!(self, WidAnswer::Wait)
    }

    /// Textual form the PTS side expects.
    pub fn as_wire(&self) -> &str {
        match self {
            WidAnswer::Bool(true) => "True",
            WidAnswer::Bool(false) => "False",
            WidAnswer::Text(s) => s,
            WidAnswer::Wait => "WAIT",
        }
    }
}

impl fmt::Display for WidAnswer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

impl From<bool> for WidAnswer {
    fn from(value: bool) -> Self {
        WidAnswer::Bool(value)
    }
}

impl From<String> for WidAnswer {
    fn from(value: String) -> Self {
        WidAnswer::Text(value)
    }
}

impl From<&str> for WidAnswer {
    fn from(value: &str) -> Self {
        WidAnswer::Text(value.to_string())
    }
}

pub type WidResult = Result<WidAnswer, Error>;

/// State handlers of one test case share with each other.
///
/// Values are keyed by type; handlers that need to pass something to a later
/// WID define a small newtype for it. The store lives from
/// `begin_test_case` to `end_test_case`.
pub struct Scratch {
    values: Mutex<CriticalSectionRawMutex, RefCell<HashMap<TypeId, Box<dyn Any + Send>>>>,
}

impl Default for Scratch {
    fn default() -> Self {
        Self {
            values: Mutex::new(RefCell::new(HashMap::new())),
        }
    }
}

impl Scratch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value`, returning the previous value of the same type.
    pub fn insert<T: Any + Send>(&self, value: T) -> Option<T> {
        let prev = self
            .values
            .lock(|v| v.borrow_mut().insert(TypeId::of::<T>(), Box::new(value)));
        prev.and_then(|b| b.downcast::<T>().ok()).map(|b| *b)
    }

    pub fn get<T: Any + Send + Clone>(&self) -> Option<T> {
        self.values.lock(|v| {
            v.borrow()
                .get(&TypeId::of::<T>())
                .and_then(|b| b.downcast_ref::<T>())
                .cloned()
        })
    }

    pub fn take<T: Any + Send>(&self) -> Option<T> {
        let value = self.values.lock(|v| v.borrow_mut().remove(&TypeId::of::<T>()));
        value.and_then(|b| b.downcast::<T>().ok()).map(|b| *b)
    }

    /// Run `f` on the stored `T`, creating it with `Default` first if absent.
    pub fn update<T: Any + Send + Default, R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.values.lock(|v| {
            let mut v = v.borrow_mut();
            let mut value = v
                .remove(&TypeId::of::<T>())
                .and_then(|b| b.downcast::<T>().ok())
                .map(|b| *b)
                .unwrap_or_default();
            let r = f(&mut value);
            v.insert(TypeId::of::<T>(), Box::new(value));
            r
        })
    }

    pub fn clear(&self) {
        self.values.lock(|v| v.borrow_mut().clear());
    }

    pub fn is_empty(&self) -> bool {
        self.values.lock(|v| v.borrow().is_empty())
    }
}

/// Everything a handler may touch while answering one WID.
#[derive(Clone, Copy)]
pub struct WidContext<'a> {
    pub btp: &'a BtpClient,
    pub stack: &'a Stack,
    pub request: &'a WidRequest,
    pub scratch: &'a Scratch,
}

/// A WID handler.
///
/// Closures of the shape `|ctx| async move { .. }.boxed()` implement this.
pub trait WidHandler: Send + Sync {
    fn call<'a>(&'a self, ctx: WidContext<'a>) -> BoxFuture<'a, WidResult>;
}

impl<F> WidHandler for F
where
    F: for<'a> Fn(WidContext<'a>) -> BoxFuture<'a, WidResult> + Send + Sync,
{
    fn call<'a>(&'a self, ctx: WidContext<'a>) -> BoxFuture<'a, WidResult> {
        self(ctx)
    }
}

/// Handler that always gives the same answer.
#[derive(Debug, Clone)]
pub struct Fixed(pub WidAnswer);

impl WidHandler for Fixed {
    fn call<'a>(&'a self, _ctx: WidContext<'a>) -> BoxFuture<'a, WidResult> {
        let answer = self.0.clone();
        Box::pin(async move { Ok(answer) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_text() {
        assert_eq!(WidAnswer::Bool(true).as_wire(), "True");
        assert_eq!(WidAnswer::Bool(false).to_string(), "False");
        assert_eq!(WidAnswer::from("1234").as_wire(), "1234");
        assert_eq!(WidAnswer::Wait.as_wire(), "WAIT");
    }

    #[test]
    fn profile_prefix() {
        assert_eq!(WidRequest::new(1, "", "GATT/CL/GAR/BV-01-C").profile(), "GATT");
        assert_eq!(WidRequest::new(1, "", "MESH").profile(), "MESH");
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    struct DiscoveredHandle(u16);

    #[derive(Default)]
    struct Counter(u32);

    #[test]
    fn scratch_is_typed() {
        let scratch = Scratch::default();
        assert!(scratch.is_empty());
        assert_eq!(scratch.insert(DiscoveredHandle(3)), None);
        assert_eq!(scratch.insert(DiscoveredHandle(5)), Some(DiscoveredHandle(3)));
        assert_eq!(scratch.get::<DiscoveredHandle>(), Some(DiscoveredHandle(5)));

        assert_eq!(scratch.update(|c: &mut Counter| { c.0 += 1; c.0 }), 1);
        assert_eq!(scratch.update(|c: &mut Counter| { c.0 += 1; c.0 }), 2);

        assert_eq!(scratch.take::<DiscoveredHandle>(), Some(DiscoveredHandle(5)));
        assert_eq!(scratch.get::<DiscoveredHandle>(), None);
        scratch.clear();
        assert!(scratch.is_empty());
    }
}
