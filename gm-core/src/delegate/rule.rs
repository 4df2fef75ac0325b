//! Rules adjudication delegate.

use super::{DelegateAgent, DelegateError, DelegateKind, DelegateReply};
use crate::context::ContextSlice;
use crate::llm::ModelProvider;
use async_trait::async_trait;
use claude::{Message, Request};
use std::sync::Arc;
use tracing::debug;

pub struct RuleAgent {
    model: Arc<dyn ModelProvider>,
    model_name: Option<String>,
    max_tokens: usize,
}

impl RuleAgent {
    pub fn new(model: Arc<dyn ModelProvider>) -> Self {
        Self {
            model,
            model_name: None,
            max_tokens: 512,
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
}

#[async_trait]
impl DelegateAgent for RuleAgent {
    fn kind(&self) -> DelegateKind {
        DelegateKind::Rule
    }

    async fn process(&self, context: &ContextSlice) -> Result<DelegateReply, DelegateError> {
        let ContextSlice::Rule(slice) = context else {
            return Err(DelegateError::WrongContext {
                agent: DelegateKind::Rule,
                got: context.kind(),
            });
        };

        let payload = serde_json::to_string_pretty(slice).unwrap_or_default();
        let system = format!(
            "{}\n\n{}",
            include_str!("prompts/rule.txt"),
            slice.language.reply_instruction()
        );

        let mut request = Request::new(vec![Message::user(payload)])
            .with_system(system)
            .with_max_tokens(self.max_tokens)
            .with_temperature(0.0);
        if let Some(model) = &self.model_name {
            request = request.with_model(model.clone());
        }

        debug!("Calling rule delegate");
        let response = self.model.complete(request).await?;
        let text = response.text();
        if text.trim().is_empty() {
            Ok(DelegateReply::failure("empty ruling"))
        } else {
            Ok(DelegateReply::success(text.trim()))
        }
    }
}
