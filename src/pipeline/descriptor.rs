//! Middleware registration descriptors.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;

use crate::pipeline::{Middleware, Phase, PipelineError};

/// Priority applied when a descriptor does not set one.
pub const DEFAULT_PRIORITY: i32 = 100;

/// Registered state of a middleware. There is no error state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MiddlewareState {
    Active,
    #[default]
    Disabled,
}

impl fmt::Display for MiddlewareState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MiddlewareState::Active => f.write_str("active"),
            MiddlewareState::Disabled => f.write_str("disabled"),
        }
    }
}

impl FromStr for MiddlewareState {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(MiddlewareState::Active),
            "disabled" => Ok(MiddlewareState::Disabled),
            other => Err(PipelineError::Configuration(format!(
                "invalid middleware state `{other}` (expected `active` or `disabled`)"
            ))),
        }
    }
}

/// Everything the registry needs to place a handler in a chain.
#[derive(Clone)]
pub struct MiddlewareDescriptor {
    pub name: String,
    pub priority: i32,
    pub phases: BTreeSet<Phase>,
    pub state: MiddlewareState,
    /// Empty means global.
    pub routes: BTreeSet<String>,
    pub handler: Arc<dyn Middleware>,
}

impl MiddlewareDescriptor {
    /// New descriptor with default priority, disabled, global, no phases yet.
    pub fn new(name: impl Into<String>, handler: Arc<dyn Middleware>) -> Self {
        Self {
            name: name.into(),
            priority: DEFAULT_PRIORITY,
            phases: BTreeSet::new(),
            state: MiddlewareState::default(),
            routes: BTreeSet::new(),
            handler,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phases.insert(phase);
        self
    }

    pub fn phases(mut self, phases: impl IntoIterator<Item = Phase>) -> Self {
        self.phases.extend(phases);
        self
    }

    pub fn state(mut self, state: MiddlewareState) -> Self {
        self.state = state;
        self
    }

    pub fn route(mut self, route: impl Into<String>) -> Self {
        self.routes.insert(route.into());
        self
    }

    pub fn routes<I, S>(mut self, routes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routes.extend(routes.into_iter().map(Into::into));
        self
    }

    pub fn is_global(&self) -> bool {
        self.routes.is_empty()
    }

    pub(crate) fn validate(&self) -> Result<(), PipelineError> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::Configuration(
                "middleware name must not be empty".to_string(),
            ));
        }
        if self.phases.is_empty() {
            return Err(PipelineError::Configuration(format!(
                "middleware `{}` does not participate in any phase",
                self.name
            )));
        }
        if self.routes.iter().any(|route| route.trim().is_empty()) {
            return Err(PipelineError::Configuration(format!(
                "middleware `{}` has an empty route key",
                self.name
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for MiddlewareDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareDescriptor")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("phases", &self.phases)
            .field("state", &self.state)
            .field("routes", &self.routes)
            .finish_non_exhaustive()
    }
}
