//! Filter stage: classify each paper against the reader's preferences.

use crate::config::{FilterConfig, ProviderConfig};
use crate::error::StageError;
use crate::paper::{Paper, ProcessingState, Stage, Verdict};
use crate::pipeline::category::CategoryResolver;
use crate::pipeline::executor::{Route, StageOperation};
use crate::pipeline::llm::{parse_json_reply, ChatRequest, LanguageModel, RequestKind};
use crate::prompts::{classification_prompt, CLASSIFY_SYSTEM_PROMPT};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

/// Classifier reply. Everything but `interested` is optional.
#[derive(Debug, Deserialize)]
struct RawVerdict {
    #[serde(alias = "accept", alias = "accepted")]
    interested: bool,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    tricks: String,
}

pub struct FilterStage {
    model: Arc<dyn LanguageModel>,
    provider: ProviderConfig,
    interest: String,
    ignore: String,
    resolver: Arc<CategoryResolver>,
}

impl FilterStage {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        provider: &ProviderConfig,
        filter: &FilterConfig,
        resolver: Arc<CategoryResolver>,
    ) -> Self {
        Self {
            model,
            provider: provider.clone(),
            interest: filter.interest.clone(),
            ignore: filter.ignore.clone(),
            resolver,
        }
    }
}

#[async_trait]
impl StageOperation for FilterStage {
    type Output = Verdict;

    fn stage(&self) -> Stage {
        Stage::Filter
    }

    async fn process(&self, paper: &Paper) -> Result<Verdict, StageError> {
        let prompt = classification_prompt(&paper.meta, &self.interest, &self.ignore, &self.resolver.known());
        let request = ChatRequest::new(RequestKind::Classify, prompt)
            .system(CLASSIFY_SYSTEM_PROMPT)
            .json()
            .tuned(&self.provider);
        let reply = self.model.chat(&request).await?;
        let raw: RawVerdict = parse_json_reply(&reply.content)?;

        let category = raw.interested.then(|| self.resolver.resolve(&raw.category));
        debug!(
            "{}: interested={} category={:?} ({})",
            paper.id(),
            raw.interested,
            category,
            raw.reason
        );
        Ok(Verdict {
            accepted: raw.interested,
            category,
            reason: raw.reason,
            tags: raw.tags,
            summary: raw.summary,
            tricks: raw.tricks,
        })
    }

    fn apply(&self, paper: &mut Paper, verdict: Verdict) -> Result<Route, StageError> {
        let accepted = verdict.accepted;
        paper
            .advance(ProcessingState::Filtered { accepted })
            .map_err(|e| StageError::InvalidTransition(e.to_string()))?;
        paper.verdict = Some(verdict);
        Ok(if accepted { Route::Forward } else { Route::Retire })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::PaperMeta;
    use crate::pipeline::llm::ChatReply;

    struct Canned(&'static str);

    #[async_trait]
    impl LanguageModel for Canned {
        fn name(&self) -> &str {
            "canned"
        }

        async fn chat(&self, _request: &ChatRequest) -> Result<ChatReply, StageError> {
            Ok(ChatReply {
                content: self.0.to_string(),
                ..ChatReply::default()
            })
        }
    }

    fn stage(reply: &'static str) -> FilterStage {
        let filter = FilterConfig {
            known_categories: vec!["Robotics".into()],
            ..FilterConfig::default()
        };
        let resolver = Arc::new(CategoryResolver::new(&filter));
        FilterStage::new(Arc::new(Canned(reply)), &ProviderConfig::default(), &filter, resolver)
    }

    #[tokio::test]
    async fn accepted_paper_gets_resolved_category() {
        let s = stage(r#"{"interested": true, "reason": "fits", "category": "robotics", "tags": ["rl"], "summary": "s", "tricks": "t"}"#);
        let mut paper = Paper::new(PaperMeta::new("1", "T"));
        let verdict = s.process(&paper).await.unwrap();
        assert_eq!(verdict.category.as_deref(), Some("Robotics"));
        assert_eq!(s.apply(&mut paper, verdict).unwrap(), Route::Forward);
        assert_eq!(paper.state(), ProcessingState::Filtered { accepted: true });
        assert_eq!(paper.category(), Some("Robotics"));
    }

    #[tokio::test]
    async fn rejected_paper_is_retired_without_category() {
        let s = stage(r#"{"interested": false, "reason": "off topic", "category": "Biology"}"#);
        let mut paper = Paper::new(PaperMeta::new("2", "T"));
        let verdict = s.process(&paper).await.unwrap();
        assert!(verdict.category.is_none());
        assert_eq!(s.apply(&mut paper, verdict).unwrap(), Route::Retire);
        assert!(paper.state().is_terminal());
    }

    #[tokio::test]
    async fn malformed_reply_is_terminal() {
        let s = stage("not json at all");
        let paper = Paper::new(PaperMeta::new("3", "T"));
        let err = s.process(&paper).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
