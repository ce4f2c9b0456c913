//! Analysis stage: turn recognized text into a structured reading note.

use crate::config::ProviderConfig;
use crate::error::StageError;
use crate::note::render_note;
use crate::paper::{Figure, Paper, PaperAnalysis, ProcessingState, Stage};
use crate::pipeline::executor::{Route, StageOperation};
use crate::pipeline::figures::select_key_figures;
use crate::pipeline::llm::{parse_json_reply, ChatRequest, LanguageModel, RequestKind};
use crate::prompts::{analysis_prompt, ANALYSIS_SYSTEM_PROMPT};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
pub struct Analyzed {
    pub analysis: PaperAnalysis,
    pub figures: Vec<Figure>,
    pub note: String,
}

pub struct AnalyzeStage {
    model: Arc<dyn LanguageModel>,
    provider: ProviderConfig,
    language: String,
    max_figures: usize,
}

impl AnalyzeStage {
    pub fn new(model: Arc<dyn LanguageModel>, provider: &ProviderConfig, language: &str, max_figures: usize) -> Self {
        Self {
            model,
            provider: provider.clone(),
            language: language.to_string(),
            max_figures,
        }
    }
}

#[async_trait]
impl StageOperation for AnalyzeStage {
    type Output = Analyzed;

    fn stage(&self) -> Stage {
        Stage::Analyze
    }

    async fn process(&self, paper: &Paper) -> Result<Analyzed, StageError> {
        let ocr = paper
            .ocr
            .as_ref()
            .ok_or_else(|| StageError::Internal(format!("paper {} reached analysis without OCR text", paper.id())))?;

        let candidates = &paper.artifacts.figures;
        let prompt = analysis_prompt(&paper.meta, &ocr.text, candidates, &self.language);
        let request = ChatRequest::new(RequestKind::Analyze, prompt)
            .system(ANALYSIS_SYSTEM_PROMPT)
            .json()
            .tuned(&self.provider);
        let reply = self.model.chat(&request).await?;
        let analysis: PaperAnalysis = parse_json_reply(&reply.content)?;
        debug!(
            "{}: analysis received ({} in / {} out tokens)",
            paper.id(),
            reply.input_tokens,
            reply.output_tokens
        );

        // Descriptions come back in candidate order.
        let described: Vec<Figure> = candidates
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, mut f)| {
                f.description = analysis
                    .figure_descriptions
                    .get(i)
                    .map(|d| d.trim().to_string())
                    .filter(|d| !d.is_empty());
                f
            })
            .collect();
        let figures = select_key_figures(&described, self.max_figures);
        let note = render_note(paper, &analysis, &figures);

        Ok(Analyzed {
            analysis,
            figures,
            note,
        })
    }

    fn apply(&self, paper: &mut Paper, out: Analyzed) -> Result<Route, StageError> {
        paper
            .advance(ProcessingState::Analyzed)
            .map_err(|e| StageError::InvalidTransition(e.to_string()))?;
        paper.analysis = Some(out.analysis);
        paper.artifacts.figures = out.figures;
        paper.note = Some(out.note);
        Ok(Route::Forward)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::{FigureKind, OcrText, PaperMeta};
    use crate::pipeline::llm::ChatReply;
    use std::sync::Mutex;

    struct Recorder {
        reply: &'static str,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LanguageModel for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        async fn chat(&self, request: &ChatRequest) -> Result<ChatReply, StageError> {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            Ok(ChatReply {
                content: self.reply.to_string(),
                ..ChatReply::default()
            })
        }
    }

    fn recognized() -> Paper {
        let mut p = Paper::new(PaperMeta::new("2503.00004", "A Paper"));
        for s in [
            ProcessingState::Filtered { accepted: true },
            ProcessingState::Downloaded,
            ProcessingState::Recognized,
        ] {
            p.advance(s).unwrap();
        }
        p.ocr = Some(OcrText {
            text: "RECOGNIZED BODY".into(),
            pages_total: 1,
            pages_recognized: 1,
            ..OcrText::default()
        });
        p.artifacts.figures = vec![Figure {
            kind: FigureKind::Figure,
            page: 1,
            label: "image".into(),
            caption: "Figure 1: Model architecture".into(),
            bbox: [0, 0, 10, 10],
            path: None,
            description: None,
        }];
        p
    }

    #[tokio::test]
    async fn analysis_attaches_descriptions_and_renders_note() {
        let model = Arc::new(Recorder {
            reply: r#"```json
{"title": "A Paper", "core_problem": "P", "core_contributions": "only one",
 "figure_descriptions": ["the encoder-decoder stack"], "key_results": "+3 BLEU"}
```"#,
            prompts: Mutex::new(Vec::new()),
        });
        let stage = AnalyzeStage::new(model.clone(), &ProviderConfig::default(), "English", 4);
        let mut paper = recognized();
        let out = stage.process(&paper).await.unwrap();

        let prompt = model.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("RECOGNIZED BODY"));
        assert!(prompt.contains("Figure 1: Model architecture"));
        assert_eq!(out.analysis.core_contributions, vec!["only one".to_string()]);
        assert_eq!(out.figures[0].description.as_deref(), Some("the encoder-decoder stack"));
        assert!(out.note.contains("the encoder-decoder stack"));

        stage.apply(&mut paper, out).unwrap();
        assert_eq!(paper.state(), ProcessingState::Analyzed);
        assert!(paper.note.is_some());
    }

    #[tokio::test]
    async fn missing_ocr_is_an_internal_error() {
        let model = Arc::new(Recorder {
            reply: "{}",
            prompts: Mutex::new(Vec::new()),
        });
        let stage = AnalyzeStage::new(model, &ProviderConfig::default(), "English", 4);
        let paper = Paper::new(PaperMeta::new("x", "y"));
        assert!(matches!(stage.process(&paper).await, Err(StageError::Internal(_))));
    }
}
