//! Routing rules: declarative predicates mapping messages to workflows.
//!
//! Rules are loaded from a TOML document and compiled into an immutable
//! snapshot. A malformed `subject_regex` degrades to an always-false
//! predicate (logged) rather than failing the load — one bad rule must not
//! take down routing.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::RouterError;
use crate::inbox::message::InboundMessage;

fn default_true() -> bool {
    true
}

/// Routing configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Directory workflow paths are resolved against.
    pub workflows_dir: PathBuf,
    /// Workflow used when no rule matches.
    pub default_workflow: String,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl RoutingConfig {
    pub fn from_toml(text: &str) -> Result<Self, RouterError> {
        toml::from_str(text).map_err(|e| RouterError::Parse(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self, RouterError> {
        let text = std::fs::read_to_string(path).map_err(|e| RouterError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&text)
    }
}

/// One declarative routing rule.
///
/// Unset predicate categories are vacuously true under `all_conditions` and
/// simply absent under ANY. Within a category, any single listed value
/// matching is enough.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    pub workflow_path: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub from_domain: Vec<String>,
    #[serde(default)]
    pub from_email: Vec<String>,
    #[serde(default)]
    pub subject_contains: Vec<String>,
    #[serde(default)]
    pub subject_regex: Option<String>,
    #[serde(default)]
    pub has_attachment: Option<bool>,
    #[serde(default)]
    pub attachment_type: Vec<String>,
    /// true = ALL specified categories must hold, false = ANY.
    #[serde(default = "default_true")]
    pub all_conditions: bool,
}

/// Compiled subject regex; broken patterns never match.
#[derive(Debug, Clone)]
enum SubjectRegex {
    Valid(Regex),
    Broken,
}

/// A rule with its regex compiled.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub config: RuleConfig,
    subject_regex: Option<SubjectRegex>,
}

impl CompiledRule {
    fn compile(config: RuleConfig) -> Self {
        let subject_regex = config.subject_regex.as_deref().map(|pattern| {
            match Regex::new(pattern) {
                Ok(re) => SubjectRegex::Valid(re),
                Err(e) => {
                    warn!(
                        rule = %config.name,
                        pattern = %pattern,
                        error = %e,
                        "Malformed subject_regex, rule predicate will never match"
                    );
                    SubjectRegex::Broken
                }
            }
        });
        Self {
            config,
            subject_regex,
        }
    }

    /// Evaluate this rule's specified categories under its combinator.
    pub fn matches(&self, message: &InboundMessage) -> bool {
        let mut specified = 0_usize;
        let mut satisfied = 0_usize;
        let mut check = |is_specified: bool, holds: bool| {
            if is_specified {
                specified += 1;
                if holds {
                    satisfied += 1;
                }
            }
        };

        check(
            !self.config.from_domain.is_empty(),
            self.domain_matches(message),
        );
        check(
            !self.config.from_email.is_empty(),
            self.email_matches(message),
        );
        check(
            !self.config.subject_contains.is_empty(),
            self.subject_contains_matches(message),
        );
        check(
            self.subject_regex.is_some(),
            self.subject_regex_matches(message),
        );
        check(
            self.config.has_attachment.is_some(),
            self.attachment_presence_matches(message),
        );
        check(
            !self.config.attachment_type.is_empty(),
            self.attachment_type_matches(message),
        );

        if self.config.all_conditions {
            satisfied == specified
        } else {
            satisfied > 0
        }
    }

    fn domain_matches(&self, message: &InboundMessage) -> bool {
        let Some(domain) = message.sender_domain() else {
            return false;
        };
        self.config
            .from_domain
            .iter()
            .any(|d| d.trim_start_matches('@').eq_ignore_ascii_case(&domain))
    }

    fn email_matches(&self, message: &InboundMessage) -> bool {
        self.config
            .from_email
            .iter()
            .any(|e| e.eq_ignore_ascii_case(&message.sender))
    }

    fn subject_contains_matches(&self, message: &InboundMessage) -> bool {
        let Some(subject) = &message.subject else {
            return false;
        };
        let subject = subject.to_lowercase();
        self.config
            .subject_contains
            .iter()
            .any(|term| subject.contains(&term.to_lowercase()))
    }

    fn subject_regex_matches(&self, message: &InboundMessage) -> bool {
        let Some(subject) = &message.subject else {
            return false;
        };
        match &self.subject_regex {
            Some(SubjectRegex::Valid(re)) => re.is_match(subject),
            Some(SubjectRegex::Broken) => false,
            None => false,
        }
    }

    fn attachment_presence_matches(&self, message: &InboundMessage) -> bool {
        match self.config.has_attachment {
            Some(wanted) => message.has_attachments() == wanted,
            None => false,
        }
    }

    fn attachment_type_matches(&self, message: &InboundMessage) -> bool {
        message.attachments.iter().any(|att| {
            let mime = att.mime_type.to_lowercase();
            let name = att.name.to_lowercase();
            self.config.attachment_type.iter().any(|t| {
                let t = t.to_lowercase();
                mime == t || mime.ends_with(&format!("/{t}")) || name.ends_with(&format!(".{t}"))
            })
        })
    }
}

/// Immutable compiled rule snapshot. Swapped whole on reload.
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub workflows_dir: PathBuf,
    pub default_workflow: String,
    /// Enabled rules, descending priority, declaration order breaking ties.
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    pub fn compile(config: RoutingConfig) -> Self {
        let mut rules: Vec<CompiledRule> = config
            .rules
            .into_iter()
            .filter(|r| {
                if !r.enabled {
                    debug!(rule = %r.name, "Skipping disabled rule");
                }
                r.enabled
            })
            .map(CompiledRule::compile)
            .collect();
        // Stable sort keeps declaration order within equal priorities.
        rules.sort_by_key(|r| std::cmp::Reverse(r.config.priority));

        Self {
            workflows_dir: config.workflows_dir,
            default_workflow: config.default_workflow,
            rules,
        }
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }

    /// First matching rule's workflow path, or the default.
    pub fn route(&self, message: &InboundMessage) -> &str {
        for rule in &self.rules {
            if rule.matches(message) {
                debug!(
                    rule = %rule.config.name,
                    workflow = %rule.config.workflow_path,
                    message = %message.id,
                    "Rule matched"
                );
                return &rule.config.workflow_path;
            }
        }
        &self.default_workflow
    }
}
