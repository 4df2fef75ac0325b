//! Tools the Game Master can call.
//!
//! Tools never mutate the session. A call either produces text for the model
//! together with effects for the orchestrator to apply at commit, or asks the
//! orchestrator to suspend the turn on a dice check.

use crate::context::{build_slice, ContextError, ContextSlice, SliceRequest};
use crate::delegate::{DelegateKind, DelegateRegistry, DelegateReply, DelegateTarget};
use crate::lang::Language;
use crate::lore::{LoreError, LoreQuery, LoreService};
use crate::session::{DiceCheckRequest, Session};
use claude::{ToolResult, ToolUse};
use gm_macros::Tool;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

/// Look up established facts about the world: places, factions, history,
/// creatures, customs. Use it before narrating details you are unsure of.
#[derive(Debug, Clone, Deserialize, Tool)]
#[tool(name = "search_lore")]
pub struct SearchLore {
    /// What to look up, phrased as a short search query
    pub query: String,
    /// Why this lookup is needed for the current scene
    #[serde(default)]
    pub reasoning: Option<String>,
}

/// Consult a delegate agent. Use 'npc_<id>' to let an NPC speak or react in
/// character, 'rules' for an adjudication question, 'lore' for a lore lookup.
#[derive(Debug, Clone, Deserialize, Tool)]
#[tool(name = "call_agent")]
pub struct CallAgent {
    /// Agent to call, e.g. 'npc_guard' or 'rules'
    pub agent_name: String,
    /// What the agent should do or answer
    #[serde(default)]
    pub instruction: Option<String>,
    /// Why the agent is being consulted
    #[serde(default)]
    pub reasoning: Option<String>,
}

lazy_static::lazy_static! {
    static ref GM_TOOLS: Vec<claude::Tool> = vec![
        SearchLore::as_tool(),
        CallAgent::as_tool(),
        DiceCheckRequest::as_tool(),
    ];
}

/// The Game Master's tool set.
pub struct GmTools;

impl GmTools {
    /// Get all tool definitions for the model.
    pub fn all() -> Vec<claude::Tool> {
        GM_TOOLS.clone()
    }

    pub fn is_dice_check(name: &str) -> bool {
        name == DiceCheckRequest::tool_name()
    }
}

/// A failed tool call. Rendered as text for the model, never returned to callers.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("agent {agent} failed: {reason}")]
    AgentFailed { agent: String, reason: String },

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("lore service unavailable")]
    LoreUnavailable,

    #[error(transparent)]
    Lore(#[from] LoreError),
}

impl ToolError {
    /// Short localized text fed back to the model.
    pub fn render(&self, lang: Language) -> String {
        match self {
            ToolError::InvalidArguments { tool, reason } => lang.invalid_arguments(tool, reason),
            ToolError::UnknownTool(tool) => lang.unknown_tool(tool),
            ToolError::UnknownAgent(agent) => lang.unknown_agent(agent),
            ToolError::Context(ContextError::UnknownNpc(agent)) => lang.unknown_agent(agent),
            ToolError::AgentFailed { agent, reason } => lang.agent_failed(agent, reason),
            ToolError::LoreUnavailable => lang.lore_unavailable().to_string(),
            ToolError::Lore(e) => lang.lore_failed(&e.to_string()),
        }
    }
}

/// A state change requested by a tool, applied when the turn commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolEffect {
    AgentCalled(String),
    RelationChange { npc_id: String, delta: i32 },
    LoreQueried(String),
}

/// What a single tool call produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Completed {
        result: ToolResult,
        effects: Vec<ToolEffect>,
    },
    SuspendForDice(DiceCheckRequest),
}

impl ToolOutcome {
    fn failed(error: ToolError, lang: Language) -> Self {
        warn!(error = %error, "Tool call failed");
        ToolOutcome::Completed {
            result: ToolResult::error(error.render(lang)),
            effects: Vec::new(),
        }
    }
}

/// Executes tool calls against a read-only view of the session.
pub struct ToolDispatcher<'a> {
    pub session: &'a Session,
    pub registry: &'a DelegateRegistry,
    pub lore: Option<&'a dyn LoreService>,
    pub language: Language,
    pub player_input: &'a str,
    /// Tool result texts already produced this turn.
    pub prior_results: &'a [String],
}

impl ToolDispatcher<'_> {
    pub async fn dispatch(&self, tool_use: &ToolUse) -> ToolOutcome {
        debug!(tool = %tool_use.name, "Dispatching tool call");

        let result = match tool_use.name.as_str() {
            "search_lore" => match SearchLore::from_input(&tool_use.input) {
                Ok(args) => self.search_lore(args).await,
                Err(e) => Err(invalid(&tool_use.name, e)),
            },
            "call_agent" => match CallAgent::from_input(&tool_use.input) {
                Ok(args) => self.call_agent(args).await,
                Err(e) => Err(invalid(&tool_use.name, e)),
            },
            name if GmTools::is_dice_check(name) => {
                return match self.dice_check(&tool_use.input) {
                    Ok(request) => ToolOutcome::SuspendForDice(request),
                    Err(e) => ToolOutcome::failed(e, self.language),
                };
            }
            other => Err(ToolError::UnknownTool(other.to_string())),
        };

        match result {
            Ok((text, effects)) => ToolOutcome::Completed {
                result: ToolResult::success(text),
                effects,
            },
            Err(e) => ToolOutcome::failed(e, self.language),
        }
    }

    async fn search_lore(&self, args: SearchLore) -> Result<(String, Vec<ToolEffect>), ToolError> {
        let query_text = args.query.trim();
        if query_text.is_empty() {
            return Err(ToolError::InvalidArguments {
                tool: SearchLore::tool_name().to_string(),
                reason: "query is empty".to_string(),
            });
        }
        let lore = self.lore.ok_or(ToolError::LoreUnavailable)?;

        let query = LoreQuery {
            query: query_text.to_string(),
            context: Some(self.player_input.to_string()),
            world_pack_id: self.session.world_pack_id.clone(),
            current_location: self.session.current_location.clone(),
            current_region: self.session.current_region().map(str::to_string),
            language: self.language,
        };

        let text = lore.search(&query).await?;
        let text = if text.trim().is_empty() {
            self.language.lore_empty().to_string()
        } else {
            text
        };
        Ok((text, vec![ToolEffect::LoreQueried(query.query)]))
    }

    async fn call_agent(&self, args: CallAgent) -> Result<(String, Vec<ToolEffect>), ToolError> {
        let target = self
            .registry
            .resolve(&args.agent_name)
            .ok_or_else(|| ToolError::UnknownAgent(args.agent_name.clone()))?;
        let agent = self
            .registry
            .agent(target.kind)
            .ok_or_else(|| ToolError::UnknownAgent(args.agent_name.clone()))?;

        let instruction = args.instruction.unwrap_or_default();
        let slice = build_slice(
            &target,
            self.session,
            SliceRequest {
                player_input: self.player_input,
                instruction: &instruction,
                language: self.language,
                prior_results: self.prior_results,
            },
        )?;

        debug!(agent = %target.name, kind = %target.kind, "Calling delegate");
        let reply = agent
            .process(&slice)
            .await
            .map_err(|e| ToolError::AgentFailed {
                agent: target.name.clone(),
                reason: e.to_string(),
            })?;

        if !reply.success {
            return Err(ToolError::AgentFailed {
                agent: target.name.clone(),
                reason: reply.error.unwrap_or_default(),
            });
        }

        let mut effects = vec![ToolEffect::AgentCalled(target.name.clone())];
        if let (DelegateKind::Npc, Some(delta)) = (target.kind, reply.metadata.relation_change) {
            if let Some(npc_id) = npc_id(&target, &slice) {
                effects.push(ToolEffect::RelationChange { npc_id, delta });
            }
        }

        Ok((summarize(&slice, &reply), effects))
    }

    fn dice_check(&self, input: &serde_json::Value) -> Result<DiceCheckRequest, ToolError> {
        let request =
            DiceCheckRequest::from_input(input).map_err(|e| invalid(DiceCheckRequest::tool_name(), e))?;
        if request.intention.trim().is_empty() {
            return Err(ToolError::InvalidArguments {
                tool: DiceCheckRequest::tool_name().to_string(),
                reason: "intention is empty".to_string(),
            });
        }
        Ok(request.normalized(self.language))
    }
}

fn invalid(tool: &str, error: serde_json::Error) -> ToolError {
    ToolError::InvalidArguments {
        tool: tool.to_string(),
        reason: error.to_string(),
    }
}

fn npc_id(target: &DelegateTarget, slice: &ContextSlice) -> Option<String> {
    slice
        .as_npc()
        .map(|npc| npc.npc_id.clone())
        .or_else(|| target.subject.clone())
}

/// Compact text for the model: NPC dialogue with its annotations, or the
/// delegate's content as is.
fn summarize(slice: &ContextSlice, reply: &DelegateReply) -> String {
    let Some(npc) = slice.as_npc() else {
        return reply.content.clone();
    };

    let mut text = if reply.content.is_empty() {
        npc.sheet.name.clone()
    } else {
        format!("{}: \"{}\"", npc.sheet.name, reply.content)
    };
    if let Some(emotion) = &reply.metadata.emotion {
        text.push_str(&format!(" [emotion: {emotion}]"));
    }
    if let Some(action) = &reply.metadata.action {
        text.push_str(&format!(" [action: {action}]"));
    }
    text
}
