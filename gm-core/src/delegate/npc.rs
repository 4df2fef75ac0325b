//! NPC dialogue delegate.

use super::{DelegateAgent, DelegateError, DelegateKind, DelegateReply};
use crate::context::ContextSlice;
use crate::llm::{extract_json, ModelProvider};
use async_trait::async_trait;
use claude::{Message, Request};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Largest relationship shift a single exchange may cause.
const MAX_RELATION_STEP: i32 = 10;

#[derive(Debug, Deserialize)]
struct NpcJson {
    #[serde(default)]
    dialogue: String,
    #[serde(default)]
    emotion: Option<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    relation_change: Option<i32>,
}

/// Voices one NPC at a time from its context slice.
pub struct NpcAgent {
    model: Arc<dyn ModelProvider>,
    model_name: Option<String>,
    max_tokens: usize,
}

impl NpcAgent {
    pub fn new(model: Arc<dyn ModelProvider>) -> Self {
        Self {
            model,
            model_name: None,
            max_tokens: 1024,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model_name = model;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn parse_reply(text: &str) -> DelegateReply {
        match serde_json::from_str::<NpcJson>(extract_json(text)) {
            Ok(parsed) if !parsed.dialogue.trim().is_empty() || parsed.action.is_some() => {
                let mut reply = DelegateReply::success(parsed.dialogue.trim());
                if let Some(emotion) = parsed.emotion.filter(|e| !e.trim().is_empty()) {
                    reply = reply.with_emotion(emotion);
                }
                if let Some(action) = parsed.action.filter(|a| !a.trim().is_empty()) {
                    reply = reply.with_action(action);
                }
                if let Some(delta) = parsed.relation_change.filter(|d| *d != 0) {
                    reply = reply.with_relation_change(delta.clamp(-MAX_RELATION_STEP, MAX_RELATION_STEP));
                }
                reply
            }
            Ok(_) => DelegateReply::failure("the character had nothing to say"),
            Err(e) => {
                // Models sometimes answer in plain prose; treat it as dialogue.
                warn!(error = %e, "NPC reply was not JSON, using raw text");
                if text.trim().is_empty() {
                    DelegateReply::failure("empty reply")
                } else {
                    DelegateReply::success(text.trim())
                }
            }
        }
    }
}

#[async_trait]
impl DelegateAgent for NpcAgent {
    fn kind(&self) -> DelegateKind {
        DelegateKind::Npc
    }

    async fn process(&self, context: &ContextSlice) -> Result<DelegateReply, DelegateError> {
        let ContextSlice::Npc(slice) = context else {
            return Err(DelegateError::WrongContext {
                agent: DelegateKind::Npc,
                got: context.kind(),
            });
        };

        let payload = serde_json::to_string_pretty(slice).unwrap_or_default();
        let system = format!(
            "{}\n\n{}",
            include_str!("prompts/npc.txt"),
            slice.language.reply_instruction()
        );

        let mut request = Request::new(vec![Message::user(payload)])
            .with_system(system)
            .with_max_tokens(self.max_tokens)
            .with_temperature(0.9);
        if let Some(model) = &self.model_name {
            request = request.with_model(model.clone());
        }

        debug!(npc = %slice.npc_id, "Calling NPC delegate");
        let response = self.model.complete(request).await?;
        Ok(Self::parse_reply(&response.text()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_reply() {
        let reply = NpcAgent::parse_reply(
            r#"```json
{"dialogue": "Halt! State your business.", "emotion": "suspicious", "action": "lowers halberd", "relation_change": -25}
```"#,
        );
        assert!(reply.success);
        assert_eq!(reply.content, "Halt! State your business.");
        assert_eq!(reply.metadata.emotion.as_deref(), Some("suspicious"));
        assert_eq!(reply.metadata.action.as_deref(), Some("lowers halberd"));
        assert_eq!(reply.metadata.relation_change, Some(-10));
    }

    #[test]
    fn test_parse_prose_reply() {
        let reply = NpcAgent::parse_reply("Move along, traveler.");
        assert!(reply.success);
        assert_eq!(reply.content, "Move along, traveler.");
        assert_eq!(reply.metadata, Default::default());
    }

    #[test]
    fn test_parse_empty_reply() {
        assert!(!NpcAgent::parse_reply("   ").success);
        assert!(!NpcAgent::parse_reply(r#"{"dialogue": ""}"#).success);
    }
}
