//! Lore delegate: exposes the lore service as an agent.

use super::{DelegateAgent, DelegateError, DelegateKind, DelegateReply};
use crate::context::ContextSlice;
use crate::lore::{LoreQuery, LoreService};
use async_trait::async_trait;
use std::sync::Arc;

pub struct LoreDelegate {
    lore: Arc<dyn LoreService>,
}

impl LoreDelegate {
    pub fn new(lore: Arc<dyn LoreService>) -> Self {
        Self { lore }
    }
}

#[async_trait]
impl DelegateAgent for LoreDelegate {
    fn kind(&self) -> DelegateKind {
        DelegateKind::Lore
    }

    async fn process(&self, context: &ContextSlice) -> Result<DelegateReply, DelegateError> {
        let ContextSlice::Lore(slice) = context else {
            return Err(DelegateError::WrongContext {
                agent: DelegateKind::Lore,
                got: context.kind(),
            });
        };

        let query = LoreQuery {
            query: slice.query.clone(),
            context: None,
            world_pack_id: slice.world_pack_id.clone(),
            current_location: slice.location.clone(),
            current_region: slice.region.clone(),
            language: slice.language,
        };

        Ok(match self.lore.search(&query).await {
            Ok(text) if text.trim().is_empty() => DelegateReply::success(slice.language.lore_empty()),
            Ok(text) => DelegateReply::success(text),
            Err(e) => DelegateReply::failure(e.to_string()),
        })
    }
}
