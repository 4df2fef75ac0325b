//! Model provider seam.

use async_trait::async_trait;
use claude::{Claude, Request, Response};

/// Anything that can answer a completion request.
///
/// The Game Master and the LLM-backed delegates only depend on this trait,
/// so tests can drive them with scripted responses.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn complete(&self, request: Request) -> Result<Response, claude::Error>;

    /// Model name used for logging.
    fn model_name(&self) -> &str;
}

#[async_trait]
impl ModelProvider for Claude {
    async fn complete(&self, request: Request) -> Result<Response, claude::Error> {
        Claude::complete(self, request).await
    }

    fn model_name(&self) -> &str {
        self.model()
    }
}

/// Pull a JSON payload out of a reply that may wrap it in a code fence
/// or surround it with prose.
pub fn extract_json(text: &str) -> &str {
    let text = text.trim();

    if let Some(start) = text.find("```json") {
        let content_start = start + 7;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    if let Some(start) = text.find("```") {
        let content_start = start + 3;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_plain() {
        let text = r#"{"dialogue": "Halt."}"#;
        assert_eq!(extract_json(text), text);
    }

    #[test]
    fn test_extract_json_fenced() {
        let text = "Here you go:\n```json\n{\"dialogue\": \"Halt.\"}\n```";
        assert_eq!(extract_json(text), r#"{"dialogue": "Halt."}"#);
    }

    #[test]
    fn test_extract_json_with_prose() {
        let text = r#"Sure! {"dialogue": "Halt."} Hope that helps."#;
        assert_eq!(extract_json(text), r#"{"dialogue": "Halt."}"#);
    }
}
