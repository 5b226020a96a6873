//! Workflow router — pure rule evaluation over an atomically-swapped
//! snapshot.
//!
//! `route()` takes a cheap `Arc` clone of the current snapshot, so an
//! in-flight call always sees one consistent rule set even while a reload
//! replaces it. No in-place mutation, ever.

use std::sync::{Arc, RwLock};

use tracing::info;

use crate::inbox::message::InboundMessage;
use crate::router::rules::{RoutingConfig, RuleSet};

/// Maps a message to a workflow path via ordered rules.
pub struct WorkflowRouter {
    snapshot: RwLock<Arc<RuleSet>>,
}

impl WorkflowRouter {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(rules)),
        }
    }

    /// Current snapshot; callers holding it are unaffected by reloads.
    pub fn rules(&self) -> Arc<RuleSet> {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Resolve a message to a workflow path. Pure and deterministic:
    /// identical message and rule set always yield the identical path.
    pub fn route(&self, message: &InboundMessage) -> String {
        self.rules().route(message).to_string()
    }

    /// Hot-reload: compile and atomically swap in a new snapshot.
    pub fn reload(&self, config: RoutingConfig) {
        let rules = Arc::new(RuleSet::compile(config));
        let count = rules.rules().len();
        *self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = rules;
        info!(rules = count, "Routing rules reloaded");
    }
}
