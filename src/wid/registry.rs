//! Explicit WID handler tables and the order they are probed in.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use super::{profile_of, Fixed, WidAnswer, WidContext, WidHandler, WidResult};

/// Handlers of one module, keyed by WID number.
#[derive(Clone)]
pub struct WidRegistry {
    name: String,
    handlers: BTreeMap<u16, Arc<dyn WidHandler>>,
}

impl WidRegistry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a closure handler for `wid`.
    pub fn handler<F>(mut self, wid: u16, f: F) -> Self
    where
        F: for<'a> Fn(WidContext<'a>) -> BoxFuture<'a, WidResult> + Send + Sync + 'static,
    {
        self.insert(wid, Arc::new(f));
        self
    }

    /// Register a handler that always answers `answer`.
    pub fn answer(mut self, wid: u16, answer: impl Into<WidAnswer>) -> Self {
        self.insert(wid, Arc::new(Fixed(answer.into())));
        self
    }

    /// Register `handler` for `wid`, replacing any earlier one.
    pub fn insert(&mut self, wid: u16, handler: Arc<dyn WidHandler>) {
        if self.handlers.insert(wid, handler).is_some() {
            log::warn!("{}: handler for WID {} replaced", self.name, wid);
        }
    }

    pub fn get(&self, wid: u16) -> Option<&Arc<dyn WidHandler>> {
        self.handlers.get(&wid)
    }

    pub fn contains(&self, wid: u16) -> bool {
        self.handlers.contains_key(&wid)
    }

    pub fn wids(&self) -> impl Iterator<Item = u16> + '_ {
        self.handlers.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// A resolved handler and the registry it came from.
#[derive(Clone)]
pub struct Resolved {
    pub registry: String,
    pub handler: Arc<dyn WidHandler>,
}

/// Lookup chain of one profile.
///
/// Probed in this order: every variant whose namespace occurs in the test
/// case name (in declaration order), the profile's generic registry, then
/// the fallbacks in declaration order.
#[derive(Clone)]
pub struct Route {
    profile: String,
    variants: Vec<(String, Arc<WidRegistry>)>,
    generic: Option<Arc<WidRegistry>>,
    fallbacks: Vec<Arc<WidRegistry>>,
}

impl Route {
    pub fn new(profile: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            variants: Vec::new(),
            generic: None,
            fallbacks: Vec::new(),
        }
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    /// Add a registry used for test cases containing `namespace`, e.g. `GATT/CL`.
    pub fn variant(mut self, namespace: impl Into<String>, registry: impl Into<Arc<WidRegistry>>) -> Self {
        self.variants.push((namespace.into(), registry.into()));
        self
    }

    pub fn generic(mut self, registry: impl Into<Arc<WidRegistry>>) -> Self {
        self.generic = Some(registry.into());
        self
    }

    pub fn fallback(mut self, registry: impl Into<Arc<WidRegistry>>) -> Self {
        self.fallbacks.push(registry.into());
        self
    }

    /// Registries to probe for `test_case`, in order.
    pub fn chain<'a>(&'a self, test_case: &'a str) -> impl Iterator<Item = &'a Arc<WidRegistry>> + 'a {
        self.variants
            .iter()
            .filter(move |(ns, _)| test_case.contains(ns.as_str()))
            .map(|(_, reg)| reg)
            .chain(self.generic.iter())
            .chain(self.fallbacks.iter())
    }

    pub fn resolve(&self, wid: u16, test_case: &str) -> Option<Resolved> {
        self.chain(test_case).find_map(|reg| {
            reg.get(wid).map(|h| Resolved {
                registry: reg.name().to_string(),
                handler: h.clone(),
            })
        })
    }
}

/// All routes known to a run, plus registries shared by every profile.
#[derive(Clone, Default)]
pub struct Routes {
    routes: BTreeMap<String, Route>,
    common: Vec<Arc<WidRegistry>>,
}

impl Routes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, route: Route) -> Self {
        self.routes.insert(route.profile.clone(), route);
        self
    }

    /// Registry probed after every profile's own chain.
    pub fn common(mut self, registry: impl Into<Arc<WidRegistry>>) -> Self {
        self.common.push(registry.into());
        self
    }

    pub fn get(&self, profile: &str) -> Option<&Route> {
        self.routes.get(profile)
    }

    /// Find the handler for `wid` in `test_case`.
    pub fn resolve(&self, wid: u16, test_case: &str) -> Option<Resolved> {
        self.routes
            .get(profile_of(test_case))
            .and_then(|route| route.resolve(wid, test_case))
            .or_else(|| {
                self.common.iter().find_map(|reg| {
                    reg.get(wid).map(|h| Resolved {
                        registry: reg.name().to_string(),
                        handler: h.clone(),
                    })
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routes() -> Routes {
        let gatt_cl = WidRegistry::new("gatt_cl").answer(7, "client").answer(8, "client");
        let gatt = WidRegistry::new("gatt").answer(7, "generic").answer(9, "generic");
        let gen = Arc::new(WidRegistry::new("gen").answer(10, "shared").answer(7, "shared"));
        Routes::new()
            .route(
                Route::new("GATT")
                    .variant("GATT/CL", gatt_cl)
                    .generic(gatt)
                    .fallback(gen.clone()),
            )
            .common(WidRegistry::new("common").answer(11, "common"))
    }

    fn resolved_in(routes: &Routes, wid: u16, tc: &str) -> Option<String> {
        routes.resolve(wid, tc).map(|r| r.registry)
    }

    #[test]
    fn variant_wins_over_generic() {
        let routes = routes();
        assert_eq!(resolved_in(&routes, 7, "GATT/CL/GAR/BV-01-C").as_deref(), Some("gatt_cl"));
        assert_eq!(resolved_in(&routes, 7, "GATT/SR/GAR/BV-01-C").as_deref(), Some("gatt"));
    }

    #[test]
    fn falls_through_in_order() {
        let routes = routes();
        assert_eq!(resolved_in(&routes, 9, "GATT/CL/GAR/BV-01-C").as_deref(), Some("gatt"));
        assert_eq!(resolved_in(&routes, 10, "GATT/CL/GAR/BV-01-C").as_deref(), Some("gen"));
        assert_eq!(resolved_in(&routes, 11, "GATT/CL/GAR/BV-01-C").as_deref(), Some("common"));
        assert_eq!(resolved_in(&routes, 11, "L2CAP/COS/CED/BV-01-C").as_deref(), Some("common"));
        assert_eq!(resolved_in(&routes, 8, "GATT/SR/GAR/BV-01-C"), None);
        assert_eq!(resolved_in(&routes, 99, "GATT/CL/GAR/BV-01-C"), None);
    }

    #[test]
    fn registry_bookkeeping() {
        let reg = WidRegistry::new("x").answer(3, true).answer(1, false);
        assert_eq!(reg.wids().collect::<Vec<_>>(), vec![1, 3]);
        assert!(reg.contains(3));
        assert_eq!(reg.len(), 2);
    }
}
