//! Session language and the engine's own localized strings.
//!
//! Only text the engine itself produces lives here (status notices,
//! soft-fail tool results, fallbacks). Narrative text comes from the model.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Language a session is played in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Language {
    #[default]
    #[serde(rename = "en")]
    En,
    #[serde(rename = "zh")]
    Zh,
}

impl Language {
    /// Parse a client language code. Unknown codes fall back to English.
    pub fn from_code(code: &str) -> Self {
        let code = code.trim().to_ascii_lowercase();
        if code == "zh" || code.starts_with("zh-") || code.starts_with("zh_") || code == "cn" {
            Language::Zh
        } else {
            Language::En
        }
    }

    /// Resolve an optional code against a fallback.
    pub fn resolve(code: Option<&str>, fallback: Language) -> Self {
        match code {
            Some(code) if !code.trim().is_empty() => Self::from_code(code),
            _ => fallback,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Language::En => "en",
            Language::Zh => "zh",
        }
    }

    /// Instruction appended to model prompts so replies match the session.
    pub fn reply_instruction(&self) -> &'static str {
        match self {
            Language::En => "Respond in English.",
            Language::Zh => "请使用简体中文回答。",
        }
    }

    pub fn status_thinking(&self) -> &'static str {
        match self {
            Language::En => "The Game Master is considering your action...",
            Language::Zh => "主持人正在思考你的行动……",
        }
    }

    pub fn status_narrating(&self) -> &'static str {
        match self {
            Language::En => "The Game Master is narrating...",
            Language::Zh => "主持人正在讲述……",
        }
    }

    pub fn status_dice_check(&self) -> &'static str {
        match self {
            Language::En => "A dice check is required.",
            Language::Zh => "需要进行一次骰子检定。",
        }
    }

    pub fn status_resuming(&self) -> &'static str {
        match self {
            Language::En => "The dice have spoken. The story continues...",
            Language::Zh => "骰子已经落定，故事继续……",
        }
    }

    /// Narrative used when the tool loop ends without any text.
    pub fn fallback_narrative(&self) -> &'static str {
        match self {
            Language::En => {
                "The world holds its breath for a moment. Nothing decisive happens yet. What do you do?"
            }
            Language::Zh => "世界仿佛屏住了呼吸，暂时没有发生什么决定性的事。你要怎么做？",
        }
    }

    pub fn lore_unavailable(&self) -> &'static str {
        match self {
            Language::En => "Lore service unavailable. Continue from what is already known.",
            Language::Zh => "世界资料服务不可用，请依据已知信息继续。",
        }
    }

    pub fn lore_empty(&self) -> &'static str {
        match self {
            Language::En => "No lore entries matched this query.",
            Language::Zh => "没有找到与此查询相关的资料。",
        }
    }

    pub fn lore_failed(&self, reason: &str) -> String {
        match self {
            Language::En => format!("Lore search failed: {reason}"),
            Language::Zh => format!("资料检索失败：{reason}"),
        }
    }

    pub fn unknown_agent(&self, name: &str) -> String {
        match self {
            Language::En => format!("No agent named '{name}' is available."),
            Language::Zh => format!("没有名为“{name}”的代理。"),
        }
    }

    pub fn agent_failed(&self, name: &str, reason: &str) -> String {
        match self {
            Language::En => format!("Agent '{name}' could not respond: {reason}"),
            Language::Zh => format!("代理“{name}”无法回应：{reason}"),
        }
    }

    pub fn invalid_arguments(&self, tool: &str, reason: &str) -> String {
        match self {
            Language::En => format!("Invalid arguments for {tool}: {reason}"),
            Language::Zh => format!("{tool} 的参数无效：{reason}"),
        }
    }

    pub fn unknown_tool(&self, tool: &str) -> String {
        match self {
            Language::En => format!("Unknown tool: {tool}"),
            Language::Zh => format!("未知工具：{tool}"),
        }
    }

    pub fn duplicate_dice_check(&self) -> &'static str {
        match self {
            Language::En => "Only one dice check can be pending at a time; this request was ignored.",
            Language::Zh => "同一时间只能有一个待定的骰子检定，此请求已被忽略。",
        }
    }

    pub fn dice_check_recorded(&self) -> &'static str {
        match self {
            Language::En => "Dice check recorded. Waiting for the player's roll.",
            Language::Zh => "已记录骰子检定，等待玩家掷骰。",
        }
    }

    /// Default stakes text when the model leaves `instructions` empty.
    pub fn default_dice_instructions(&self, intention: &str, formula: &str) -> String {
        match self {
            Language::En => format!("Roll {formula} to see whether you succeed: {intention}"),
            Language::Zh => format!("掷 {formula} 来决定你是否成功：{intention}"),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}
