//! The Game Master agent and its tools.

mod orchestrator;
mod tools;

pub use orchestrator::{GameMaster, TurnMetadata, TurnResponse};
pub use tools::{
    CallAgent, GmTools, SearchLore, ToolDispatcher, ToolEffect, ToolError, ToolOutcome,
};
