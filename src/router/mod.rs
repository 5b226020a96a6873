//! Rule-based routing of inbound messages to workflow paths.

pub mod router;
pub mod rules;

pub use router::WorkflowRouter;
pub use rules::{CompiledRule, RoutingConfig, RuleConfig, RuleSet};
