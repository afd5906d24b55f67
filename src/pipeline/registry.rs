//! Process-local middleware registry and chain computation.
//!
//! # Responsibilities
//! - Hold global and per-route descriptor lists
//! - Apply enable/disable and removal by name
//! - Merge and sort the chain for a (phase, route) pair
//!
//! # Design Decisions
//! - A name identifies one registration; registering it again replaces it
//! - Route-scoped descriptors are stored once per route key
//! - Chains are cached per snapshot; mutation starts a fresh cache

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::pipeline::{
    Middleware, MiddlewareDescriptor, MiddlewareState, Phase, PipelineError,
};

/// One step of a computed chain.
#[derive(Clone)]
pub struct ChainEntry {
    pub name: Arc<str>,
    pub priority: i32,
    pub handler: Arc<dyn Middleware>,
}

impl std::fmt::Debug for ChainEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainEntry")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Ordered handlers for one phase and route.
pub type Chain = Arc<[ChainEntry]>;

/// Read-only view of a registration, for the admin API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MiddlewareInfo {
    pub name: String,
    pub priority: i32,
    pub phases: Vec<Phase>,
    pub state: MiddlewareState,
    pub routes: Vec<String>,
}

#[derive(Clone)]
struct Registered {
    /// Registration order, used to break priority ties.
    seq: u64,
    descriptor: MiddlewareDescriptor,
}

type ChainKey = (Phase, Option<String>);

#[derive(Clone, Default)]
pub struct MiddlewareRegistry {
    global: Vec<Registered>,
    routes: HashMap<String, Vec<Registered>>,
    next_seq: u64,
    cache: Arc<DashMap<ChainKey, Chain>>,
}

impl MiddlewareRegistry {
    pub fn register(&mut self, descriptor: MiddlewareDescriptor) -> Result<(), PipelineError> {
        descriptor.validate()?;

        if self.remove(&descriptor.name) {
            tracing::warn!(
                middleware = %descriptor.name,
                "Middleware registered twice, replacing earlier registration"
            );
        }

        let registered = Registered {
            seq: self.next_seq,
            descriptor,
        };
        self.next_seq += 1;

        tracing::debug!(
            middleware = %registered.descriptor.name,
            priority = registered.descriptor.priority,
            phases = ?registered.descriptor.phases,
            routes = ?registered.descriptor.routes,
            state = %registered.descriptor.state,
            "Middleware registered"
        );

        if registered.descriptor.is_global() {
            self.global.push(registered);
        } else {
            for route in &registered.descriptor.routes {
                self.routes
                    .entry(route.clone())
                    .or_default()
                    .push(registered.clone());
            }
        }
        self.invalidate_cache();
        Ok(())
    }

    /// Remove every entry for `name`. Returns whether anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.len_entries();
        self.global.retain(|r| r.descriptor.name != name);
        for list in self.routes.values_mut() {
            list.retain(|r| r.descriptor.name != name);
        }
        self.routes.retain(|_, list| !list.is_empty());

        let removed = self.len_entries() != before;
        if removed {
            self.invalidate_cache();
        }
        removed
    }

    pub fn set_state(&mut self, name: &str, state: MiddlewareState) -> Result<(), PipelineError> {
        let mut found = false;
        for registered in self.entries_mut().filter(|r| r.descriptor.name == name) {
            registered.descriptor.state = state;
            found = true;
        }

        if !found {
            return Err(PipelineError::Configuration(format!(
                "unknown middleware `{name}`"
            )));
        }
        self.invalidate_cache();
        tracing::info!(middleware = %name, state = %state, "Middleware state changed");
        Ok(())
    }

    /// ACTIVE global entries then ACTIVE entries scoped to `route`, each by priority.
    pub fn get_chain(&self, phase: Phase, route: Option<&str>) -> Chain {
        let key = (phase, route.map(str::to_owned));
        if let Some(chain) = self.cache.get(&key) {
            return chain.clone();
        }

        let mut chain = Self::ordered(&self.global, phase);
        if let Some(list) = route.and_then(|route| self.routes.get(route)) {
            chain.extend(Self::ordered(list, phase));
        }

        let chain: Chain = chain.into();
        self.cache.insert(key, chain.clone());
        chain
    }

    /// One entry per registered name, sorted by priority.
    pub fn describe(&self) -> Vec<MiddlewareInfo> {
        let mut by_name = BTreeMap::new();
        for registered in self.entries() {
            let d = &registered.descriptor;
            by_name.entry(d.name.clone()).or_insert_with(|| MiddlewareInfo {
                name: d.name.clone(),
                priority: d.priority,
                phases: d.phases.iter().copied().collect(),
                state: d.state,
                routes: d.routes.iter().cloned().collect(),
            });
        }

        let mut infos: Vec<_> = by_name.into_values().collect();
        infos.sort_by_key(|info| info.priority);
        infos
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries().any(|r| r.descriptor.name == name)
    }

    /// Detach from the cache shared with earlier snapshots.
    fn invalidate_cache(&mut self) {
        self.cache = Arc::new(DashMap::new());
    }

    fn ordered(list: &[Registered], phase: Phase) -> Vec<ChainEntry> {
        let mut selected: Vec<&Registered> = list
            .iter()
            .filter(|r| {
                r.descriptor.state == MiddlewareState::Active
                    && r.descriptor.phases.contains(&phase)
            })
            .collect();
        selected.sort_by_key(|r| (r.descriptor.priority, r.seq));

        selected
            .into_iter()
            .map(|r| ChainEntry {
                name: Arc::from(r.descriptor.name.as_str()),
                priority: r.descriptor.priority,
                handler: r.descriptor.handler.clone(),
            })
            .collect()
    }

    fn entries(&self) -> impl Iterator<Item = &Registered> {
        self.global.iter().chain(self.routes.values().flatten())
    }

    fn entries_mut(&mut self) -> impl Iterator<Item = &mut Registered> {
        self.global
            .iter_mut()
            .chain(self.routes.values_mut().flatten())
    }

    fn len_entries(&self) -> usize {
        self.entries().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{from_fn, Flow};

    fn descriptor(name: &str, priority: i32) -> MiddlewareDescriptor {
        MiddlewareDescriptor::new(name, from_fn(|_, _| Ok(Flow::Continue)))
            .priority(priority)
            .phase(Phase::Access)
            .state(MiddlewareState::Active)
    }

    fn names(chain: &Chain) -> Vec<&str> {
        chain.iter().map(|entry| &*entry.name).collect()
    }

    #[test]
    fn test_global_entries_precede_route_entries() {
        let mut registry = MiddlewareRegistry::default();
        registry.register(descriptor("global_late", 90)).unwrap();
        registry.register(descriptor("scoped_early", 1).route("api")).unwrap();
        registry.register(descriptor("global_early", 10)).unwrap();

        let chain = registry.get_chain(Phase::Access, Some("api"));
        assert_eq!(names(&chain), vec!["global_early", "global_late", "scoped_early"]);

        let other = registry.get_chain(Phase::Access, Some("static"));
        assert_eq!(names(&other), vec!["global_early", "global_late"]);
    }

    #[test]
    fn test_equal_priority_keeps_registration_order() {
        let mut registry = MiddlewareRegistry::default();
        for name in ["one", "two", "three"] {
            registry.register(descriptor(name, 50)).unwrap();
        }
        let chain = registry.get_chain(Phase::Access, None);
        assert_eq!(names(&chain), vec!["one", "two", "three"]);
    }

    #[test]
    fn test_phase_filtering() {
        let mut registry = MiddlewareRegistry::default();
        registry.register(descriptor("access_only", 1)).unwrap();
        registry
            .register(descriptor("both", 2).phase(Phase::Log))
            .unwrap();

        assert_eq!(names(&registry.get_chain(Phase::Log, None)), vec!["both"]);
        assert!(registry.get_chain(Phase::Content, None).is_empty());
    }

    #[test]
    fn test_reregistration_replaces() {
        let mut registry = MiddlewareRegistry::default();
        registry.register(descriptor("dup", 10)).unwrap();
        registry.register(descriptor("other", 20)).unwrap();
        registry.register(descriptor("dup", 30)).unwrap();

        let chain = registry.get_chain(Phase::Access, None);
        assert_eq!(names(&chain), vec!["other", "dup"]);
        assert_eq!(registry.describe().len(), 2);
    }

    #[test]
    fn test_route_scoped_stored_per_route() {
        let mut registry = MiddlewareRegistry::default();
        registry
            .register(descriptor("scoped", 5).routes(["a", "b"]))
            .unwrap();

        assert_eq!(names(&registry.get_chain(Phase::Access, Some("a"))), vec!["scoped"]);
        assert_eq!(names(&registry.get_chain(Phase::Access, Some("b"))), vec!["scoped"]);
        assert!(registry.get_chain(Phase::Access, None).is_empty());

        registry.set_state("scoped", MiddlewareState::Disabled).unwrap();
        assert!(registry.get_chain(Phase::Access, Some("a")).is_empty());
        assert!(registry.get_chain(Phase::Access, Some("b")).is_empty());

        assert!(registry.remove("scoped"));
        assert!(!registry.contains("scoped"));
    }

    #[test]
    fn test_mutation_drops_cached_chains() {
        let mut registry = MiddlewareRegistry::default();
        registry.register(descriptor("m", 10)).unwrap();
        assert_eq!(names(&registry.get_chain(Phase::Access, None)), vec!["m"]);

        registry.set_state("m", MiddlewareState::Disabled).unwrap();
        assert!(registry.get_chain(Phase::Access, None).is_empty());

        registry.set_state("m", MiddlewareState::Active).unwrap();
        assert_eq!(names(&registry.get_chain(Phase::Access, None)), vec!["m"]);

        assert!(registry.remove("m"));
        assert!(registry.get_chain(Phase::Access, None).is_empty());

        registry.register(descriptor("n", 5)).unwrap();
        let pipeline = crate::pipeline::Pipeline::from_registry(registry);
        assert_eq!(names(&pipeline.get_chain(Phase::Access, None)), vec!["n"]);
    }

    #[test]
    fn test_mutating_a_clone_leaves_original_cache_alone() {
        let mut original = MiddlewareRegistry::default();
        original.register(descriptor("m", 10)).unwrap();
        assert_eq!(names(&original.get_chain(Phase::Access, None)), vec!["m"]);

        let mut next = original.clone();
        next.set_state("m", MiddlewareState::Disabled).unwrap();

        assert!(next.get_chain(Phase::Access, None).is_empty());
        assert_eq!(names(&original.get_chain(Phase::Access, None)), vec!["m"]);
    }

    #[test]
    fn test_describe_is_sorted_by_priority() {
        let mut registry = MiddlewareRegistry::default();
        registry.register(descriptor("z", 1)).unwrap();
        registry.register(descriptor("a", 2).route("api")).unwrap();

        let infos = registry.describe();
        assert_eq!(infos[0].name, "z");
        assert_eq!(infos[1].routes, vec!["api".to_string()]);
    }
}
