//! Delegate agents the Game Master can consult.
//!
//! Agent names used by the model are resolved through a [`DelegateRegistry`]
//! whose routes (exact names and prefixes such as `npc_`) are fixed when the
//! registry is built. Each route points at one of a closed set of kinds, and
//! each kind has one agent instance.

mod lore;
mod npc;
mod rule;

pub use lore::LoreDelegate;
pub use npc::NpcAgent;
pub use rule::RuleAgent;

use crate::context::ContextSlice;
use crate::llm::ModelProvider;
use crate::lore::LoreService;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// The closed set of delegate types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegateKind {
    Npc,
    Rule,
    Lore,
}

impl fmt::Display for DelegateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DelegateKind::Npc => "npc",
            DelegateKind::Rule => "rule",
            DelegateKind::Lore => "lore",
        };
        f.write_str(name)
    }
}

/// A resolved agent name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegateTarget {
    /// The name the model used.
    pub name: String,
    pub kind: DelegateKind,
    /// What the name refers to within its kind, e.g. the NPC id.
    pub subject: Option<String>,
}

impl DelegateTarget {
    /// Target an NPC by agent name, e.g. `npc_guard`.
    pub fn npc(name: impl Into<String>) -> Self {
        let name = name.into();
        let subject = name.strip_prefix("npc_").unwrap_or(&name).to_string();
        Self {
            name,
            kind: DelegateKind::Npc,
            subject: Some(subject),
        }
    }

    pub fn rule(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DelegateKind::Rule,
            subject: None,
        }
    }

    pub fn lore(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DelegateKind::Lore,
            subject: None,
        }
    }
}

/// Annotations a delegate may attach to its reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation_change: Option<i32>,
}

/// Outcome of a delegate call. Business-level failures are `success: false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegateReply {
    pub content: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: ReplyMetadata,
}

impl DelegateReply {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: true,
            error: None,
            metadata: ReplyMetadata::default(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            content: String::new(),
            success: false,
            error: Some(error.into()),
            metadata: ReplyMetadata::default(),
        }
    }

    pub fn with_emotion(mut self, emotion: impl Into<String>) -> Self {
        self.metadata.emotion = Some(emotion.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.metadata.action = Some(action.into());
        self
    }

    pub fn with_relation_change(mut self, delta: i32) -> Self {
        self.metadata.relation_change = Some(delta);
        self
    }
}

/// Transport or provider failure inside a delegate.
#[derive(Debug, Error)]
pub enum DelegateError {
    #[error("model call failed: {0}")]
    Model(#[from] claude::Error),

    #[error("{agent} delegate cannot handle a {got} context")]
    WrongContext { agent: DelegateKind, got: DelegateKind },
}

/// A delegate agent.
#[async_trait]
pub trait DelegateAgent: Send + Sync {
    fn kind(&self) -> DelegateKind;

    async fn process(&self, context: &ContextSlice) -> Result<DelegateReply, DelegateError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Exact(String),
    Prefix(String),
}

/// Routes agent names to delegate kinds and kinds to agents.
#[derive(Clone, Default)]
pub struct DelegateRegistry {
    routes: Vec<(Route, DelegateKind)>,
    agents: HashMap<DelegateKind, Arc<dyn DelegateAgent>>,
}

impl DelegateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The usual wiring: `npc_*` names, `rules` and `lore`.
    pub fn standard(
        model: Arc<dyn ModelProvider>,
        lore: Option<Arc<dyn LoreService>>,
        delegate_model: Option<String>,
        max_tokens: usize,
    ) -> Self {
        let mut registry = Self::new()
            .with_prefix("npc_", DelegateKind::Npc)
            .with_name("rules", DelegateKind::Rule)
            .with_name("rule_agent", DelegateKind::Rule)
            .with_name("lore", DelegateKind::Lore)
            .with_name("lore_agent", DelegateKind::Lore)
            .with_agent(Arc::new(
                NpcAgent::new(model.clone())
                    .with_model(delegate_model.clone())
                    .with_max_tokens(max_tokens),
            ))
            .with_agent(Arc::new(
                RuleAgent::new(model)
                    .with_model(delegate_model)
                    .with_max_tokens(max_tokens),
            ));
        if let Some(lore) = lore {
            registry = registry.with_agent(Arc::new(LoreDelegate::new(lore)));
        }
        registry
    }

    /// Route every name starting with `prefix` to `kind`.
    pub fn with_prefix(mut self, prefix: impl Into<String>, kind: DelegateKind) -> Self {
        self.routes.push((Route::Prefix(prefix.into()), kind));
        self
    }

    /// Route one exact name to `kind`.
    pub fn with_name(mut self, name: impl Into<String>, kind: DelegateKind) -> Self {
        self.routes.push((Route::Exact(name.into()), kind));
        self
    }

    /// Register the agent serving its kind, replacing any previous one.
    pub fn with_agent(mut self, agent: Arc<dyn DelegateAgent>) -> Self {
        self.agents.insert(agent.kind(), agent);
        self
    }

    /// Resolve an agent name. Exact routes win over prefixes; among
    /// prefixes the longest match wins.
    pub fn resolve(&self, name: &str) -> Option<DelegateTarget> {
        let name = name.trim();
        if let Some((_, kind)) = self
            .routes
            .iter()
            .find(|(route, _)| matches!(route, Route::Exact(exact) if exact == name))
        {
            return Some(DelegateTarget {
                name: name.to_string(),
                kind: *kind,
                subject: None,
            });
        }

        self.routes
            .iter()
            .filter_map(|(route, kind)| match route {
                Route::Prefix(prefix) => name
                    .strip_prefix(prefix.as_str())
                    .filter(|rest| !rest.is_empty())
                    .map(|rest| (prefix.len(), *kind, rest)),
                Route::Exact(_) => None,
            })
            .max_by_key(|(len, _, _)| *len)
            .map(|(_, kind, rest)| DelegateTarget {
                name: name.to_string(),
                kind,
                subject: Some(rest.to_string()),
            })
    }

    pub fn agent(&self, kind: DelegateKind) -> Option<Arc<dyn DelegateAgent>> {
        self.agents.get(&kind).cloned()
    }

    /// Human-readable route list for the system prompt.
    pub fn describe_routes(&self) -> Vec<String> {
        self.routes
            .iter()
            .filter(|(_, kind)| self.agents.contains_key(kind))
            .map(|(route, kind)| match route {
                Route::Exact(name) => format!("{name} ({kind})"),
                Route::Prefix(prefix) => format!("{prefix}<id> ({kind})"),
            })
            .collect()
    }
}

impl fmt::Debug for DelegateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegateRegistry")
            .field("routes", &self.routes)
            .field("agents", &self.agents.keys().collect::<Vec<_>>())
            .finish()
    }
}
