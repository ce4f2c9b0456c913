//! Publisher: local note files plus the reference library.
//!
//! Per paper the publisher writes `note.md` and `analysis.json` into the
//! paper directory, then uploads the item and its note into the collection
//! named after the paper's category. Per run it writes the daily report and
//! uploads it as one standalone note.
//!
//! Publishing is idempotent within a run. Library keys are remembered by
//! paper id: a second publish of the same id rewrites the local files and
//! updates the existing note instead of creating another item. A retry after
//! a half-finished upload resumes from the last key that was created.

use crate::error::{DigestError, StageError};
use crate::layout::{persist_atomic, write_atomic_async, StorageLayout, ANALYSIS_FILE_NAME, NOTE_FILE_NAME};
use crate::library::{note_html, CollectionKey, CollectionRegistry, ItemKey, LibraryClient, LibraryItem, NoteKey};
use crate::note::render_brief_note;
use crate::paper::{ErrorRecord, Figure, Paper, PaperAnalysis, PaperMeta, ProcessingState, Stage, Verdict};
use crate::pipeline::executor::{retry, RetryPolicy, Route, StageOperation};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Library keys created for one paper so far.
#[derive(Debug, Clone, Default)]
struct LibraryEntry {
    item: Option<ItemKey>,
    pdf_linked: bool,
    note: Option<NoteKey>,
}

/// Everything known about a paper, as written to `analysis.json`.
#[derive(Serialize)]
struct PaperRecord<'a> {
    #[serde(flatten)]
    meta: &'a PaperMeta,
    category: Option<&'a str>,
    verdict: Option<&'a Verdict>,
    analysis: Option<&'a PaperAnalysis>,
    figures: &'a [Figure],
    ocr: Option<OcrSummary>,
    errors: &'a [ErrorRecord],
}

#[derive(Serialize)]
struct OcrSummary {
    pages_total: usize,
    pages_recognized: usize,
    truncated: bool,
    chars: usize,
}

#[derive(Debug)]
pub struct PublishedPaper {
    pub note_path: PathBuf,
    pub paper_dir: PathBuf,
    pub note: String,
}

/// Where the daily report ended up.
#[derive(Debug, Clone)]
pub struct ReportPublication {
    pub path: PathBuf,
    /// Set when the library upload failed; the local file is still written.
    pub upload_error: Option<String>,
}

pub struct Publisher {
    layout: Arc<StorageLayout>,
    library: Arc<dyn LibraryClient>,
    collections: CollectionRegistry,
    report_collection: Option<CollectionKey>,
    policy: RetryPolicy,
    entries: Mutex<HashMap<String, LibraryEntry>>,
    report_note: tokio::sync::Mutex<Option<NoteKey>>,
}

impl Publisher {
    pub fn new(
        layout: Arc<StorageLayout>,
        library: Arc<dyn LibraryClient>,
        parent_collection: Option<CollectionKey>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            layout,
            collections: CollectionRegistry::new(Arc::clone(&library), parent_collection.clone()),
            library,
            report_collection: parent_collection,
            policy,
            entries: Mutex::new(HashMap::new()),
            report_note: tokio::sync::Mutex::new(None),
        }
    }

    /// Probe the library before any worker starts and cache its collections.
    /// Returns the existing collection names.
    ///
    /// Rejected credentials abort the run; any other failure only means
    /// collections are looked up lazily.
    pub async fn prepare(&self) -> Result<Vec<String>, DigestError> {
        if !self.library.enabled() {
            return Ok(Vec::new());
        }
        match self.library.list_collections().await {
            Ok(existing) => {
                debug!("{}: {} collections cached", self.library.name(), existing.len());
                let names = existing.iter().map(|(name, _)| name.clone()).collect();
                self.collections.seed(existing);
                Ok(names)
            }
            Err(StageError::Auth { provider, detail }) => Err(DigestError::LibraryAuth { provider, detail }),
            Err(e) => {
                warn!("Could not list library collections, continuing: {}", e);
                Ok(Vec::new())
            }
        }
    }

    fn entry(&self, id: &str) -> LibraryEntry {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    fn remember(&self, id: &str, update: impl FnOnce(&mut LibraryEntry)) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        update(entries.entry(id.to_string()).or_default());
    }

    fn tags(&self, paper: &Paper, category: &str) -> Vec<String> {
        let mut tags: Vec<String> = paper.verdict.as_ref().map(|v| v.tags.clone()).unwrap_or_default();
        tags.push(category.to_string());
        tags.push(self.layout.date().format("%Y-%m-%d").to_string());
        tags
    }

    async fn upload(&self, paper: &Paper, category: &str, html: &str) -> Result<(), StageError> {
        let id = paper.id();
        let existing = self.entry(id);

        if let Some(note) = &existing.note {
            self.library.update_note(note, html).await?;
            debug!("{}: library note {} updated", id, note);
            return Ok(());
        }

        let item = match existing.item {
            Some(item) => item,
            None => {
                let collection = self.collections.find_or_create(category).await?;
                let record = LibraryItem::from_paper(paper, self.tags(paper, category));
                let item = self.library.upload_item(&record, Some(&collection)).await?;
                self.remember(id, |e| e.item = Some(item.clone()));
                item
            }
        };
        if !existing.pdf_linked {
            if let Some(pdf) = &paper.artifacts.pdf_path {
                self.library.link_pdf(&item, pdf).await?;
            }
            self.remember(id, |e| e.pdf_linked = true);
        }
        let note = self.library.attach_note(&item, html).await?;
        info!("{}: uploaded to {} as {}", id, self.library.name(), item);
        self.remember(id, |e| e.note = Some(note));
        Ok(())
    }

    /// Write the daily report and upload it as a standalone note.
    pub async fn publish_report(&self, markdown: &str) -> Result<ReportPublication, DigestError> {
        let path = self.layout.report_path();
        let bytes = markdown.as_bytes().to_vec();
        let target = path.clone();
        tokio::task::spawn_blocking(move || persist_atomic(&target, &bytes))
            .await
            .map_err(|e| DigestError::Internal(format!("report write task failed: {e}")))?
            .map_err(|source| DigestError::OutputWriteFailed {
                path: path.clone(),
                source,
            })?;
        info!("Daily report written to {}", path.display());

        if !self.library.enabled() {
            return Ok(ReportPublication {
                path,
                upload_error: None,
            });
        }

        let title = format!("Daily Paper Digest {}", self.layout.date().format("%Y-%m-%d"));
        let html = note_html(&title, markdown);
        let mut report_note = self.report_note.lock().await;
        let uploaded = retry(&self.policy, "report upload", |_| {
            let existing = report_note.clone();
            let html = html.as_str();
            async move {
                match existing {
                    Some(note) => {
                        self.library.update_note(&note, html).await?;
                        Ok(note)
                    }
                    None => {
                        self.library
                            .create_standalone_note(html, self.report_collection.as_ref())
                            .await
                    }
                }
            }
        })
        .await;

        let upload_error = match uploaded {
            Ok((note, _)) => {
                *report_note = Some(note);
                None
            }
            Err(e) => {
                warn!("Daily report upload failed after {} attempt(s): {}", e.attempts, e.error);
                Some(e.error.to_string())
            }
        };
        Ok(ReportPublication { path, upload_error })
    }
}

#[async_trait]
impl StageOperation for Publisher {
    type Output = PublishedPaper;

    fn stage(&self) -> Stage {
        Stage::Publish
    }

    async fn process(&self, paper: &Paper) -> Result<PublishedPaper, StageError> {
        let category = paper
            .category()
            .ok_or_else(|| StageError::Internal(format!("paper {} reached publish without a category", paper.id())))?;
        let paper_dir = paper
            .artifacts
            .paper_dir
            .clone()
            .unwrap_or_else(|| self.layout.paper_dir(category, &paper.meta));

        let note = paper.note.clone().unwrap_or_else(|| render_brief_note(paper));
        let note_path = paper_dir.join(NOTE_FILE_NAME);
        write_atomic_async(note_path.clone(), note.clone().into_bytes()).await?;

        let record = PaperRecord {
            meta: &paper.meta,
            category: Some(category),
            verdict: paper.verdict.as_ref(),
            analysis: paper.analysis.as_ref(),
            figures: &paper.artifacts.figures,
            ocr: paper.ocr.as_ref().map(|o| OcrSummary {
                pages_total: o.pages_total,
                pages_recognized: o.pages_recognized,
                truncated: o.truncated,
                chars: o.text.chars().count(),
            }),
            errors: &paper.errors,
        };
        let json = serde_json::to_vec_pretty(&record).map_err(|e| StageError::Internal(format!("analysis.json: {e}")))?;
        write_atomic_async(paper_dir.join(ANALYSIS_FILE_NAME), json).await?;

        if self.library.enabled() {
            self.upload(paper, category, &note_html(paper.title(), &note)).await?;
        }

        Ok(PublishedPaper {
            note_path,
            paper_dir,
            note,
        })
    }

    fn apply(&self, paper: &mut Paper, out: PublishedPaper) -> Result<Route, StageError> {
        paper
            .advance(ProcessingState::Published)
            .map_err(|e| StageError::InvalidTransition(e.to_string()))?;
        paper.artifacts.paper_dir = Some(out.paper_dir);
        paper.artifacts.note_path = Some(out.note_path);
        paper.note = Some(out.note);
        Ok(Route::Forward)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::PaperMeta;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingLibrary {
        items: AtomicUsize,
        notes: AtomicUsize,
        updates: AtomicUsize,
        standalone: AtomicUsize,
        links: AtomicUsize,
        /// Link attempts that fail before one succeeds.
        link_failures: usize,
        auth_fail: bool,
    }

    #[async_trait]
    impl LibraryClient for RecordingLibrary {
        fn name(&self) -> &str {
            "recording"
        }

        async fn list_collections(&self) -> Result<Vec<(String, CollectionKey)>, StageError> {
            if self.auth_fail {
                return Err(StageError::Auth {
                    provider: "recording".into(),
                    detail: "403".into(),
                });
            }
            Ok(vec![("Robotics".into(), CollectionKey("R".into()))])
        }

        async fn create_collection(&self, name: &str, _: Option<&CollectionKey>) -> Result<CollectionKey, StageError> {
            Ok(CollectionKey(name.to_string()))
        }

        async fn upload_item(&self, item: &LibraryItem, _: Option<&CollectionKey>) -> Result<ItemKey, StageError> {
            self.items.fetch_add(1, Ordering::SeqCst);
            assert!(item.tags.contains(&"2025-03-07".to_string()));
            Ok(ItemKey(format!("item-{}", item.id)))
        }

        async fn link_pdf(&self, _: &ItemKey, _: &std::path::Path) -> Result<(), StageError> {
            let attempt = self.links.fetch_add(1, Ordering::SeqCst);
            if attempt < self.link_failures {
                return Err(StageError::Transient {
                    provider: "recording".into(),
                    detail: "HTTP 503".into(),
                });
            }
            Ok(())
        }

        async fn attach_note(&self, item: &ItemKey, _: &str) -> Result<NoteKey, StageError> {
            self.notes.fetch_add(1, Ordering::SeqCst);
            Ok(NoteKey(format!("{item}-note")))
        }

        async fn update_note(&self, _: &NoteKey, _: &str) -> Result<(), StageError> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn create_standalone_note(&self, _: &str, _: Option<&CollectionKey>) -> Result<NoteKey, StageError> {
            self.standalone.fetch_add(1, Ordering::SeqCst);
            Ok(NoteKey("report".into()))
        }
    }

    fn publisher(dir: &std::path::Path, library: Arc<RecordingLibrary>) -> Publisher {
        let layout = Arc::new(StorageLayout::new(dir, NaiveDate::from_ymd_opt(2025, 3, 7).unwrap()));
        Publisher::new(layout, library, None, RetryPolicy::once())
    }

    fn ready(note: &str) -> Paper {
        let mut p = Paper::new(PaperMeta::new("2503.00006", "Same Paper").with_authors(["Ann Lee"]));
        p.advance(ProcessingState::Filtered { accepted: true }).unwrap();
        p.verdict = Some(Verdict {
            accepted: true,
            category: Some("Robotics".into()),
            ..Verdict::default()
        });
        p.note = Some(note.into());
        p
    }

    #[tokio::test]
    async fn republishing_overwrites_files_and_updates_note() {
        let dir = tempfile::tempdir().unwrap();
        let library = Arc::new(RecordingLibrary::default());
        let publisher = publisher(dir.path(), library.clone());
        publisher.prepare().await.unwrap();

        let mut first = ready("first version");
        let out = publisher.process(&first).await.unwrap();
        publisher.apply(&mut first, out).unwrap();
        assert_eq!(first.state(), ProcessingState::Published);

        let second = ready("second version");
        let out = publisher.process(&second).await.unwrap();
        let note_path = out.note_path.clone();
        assert!(note_path.ends_with("2025-03-07/Robotics/Ann_Lee_Same_Paper/note.md"));
        assert_eq!(std::fs::read_to_string(&note_path).unwrap(), "second version");
        assert!(note_path.with_file_name("analysis.json").exists());

        assert_eq!(library.items.load(Ordering::SeqCst), 1);
        assert_eq!(library.notes.load(Ordering::SeqCst), 1);
        assert_eq!(library.updates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_pdf_link_is_returned_and_retry_resumes_from_the_item() {
        let dir = tempfile::tempdir().unwrap();
        let library = Arc::new(RecordingLibrary {
            link_failures: 1,
            ..RecordingLibrary::default()
        });
        let publisher = publisher(dir.path(), library.clone());
        let mut paper = ready("note");
        paper.artifacts.pdf_path = Some(dir.path().join("paper.pdf"));

        let err = publisher.process(&paper).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(library.notes.load(Ordering::SeqCst), 0);

        publisher.process(&paper).await.unwrap();
        assert_eq!(library.items.load(Ordering::SeqCst), 1);
        assert_eq!(library.links.load(Ordering::SeqCst), 2);
        assert_eq!(library.notes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn brief_note_when_analysis_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let publisher = publisher(dir.path(), Arc::new(RecordingLibrary::default()));
        let mut paper = ready("unused");
        paper.note = None;
        let out = publisher.process(&paper).await.unwrap();
        assert!(out.note.starts_with("# Same Paper"));
        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(out.paper_dir.join("analysis.json")).unwrap()).unwrap();
        assert_eq!(json["id"], "2503.00006");
        assert_eq!(json["category"], "Robotics");
        assert!(json["analysis"].is_null());
    }

    #[tokio::test]
    async fn report_is_written_then_updated() {
        let dir = tempfile::tempdir().unwrap();
        let library = Arc::new(RecordingLibrary::default());
        let publisher = publisher(dir.path(), library.clone());
        let first = publisher.publish_report("# report v1").await.unwrap();
        assert!(first.upload_error.is_none());
        assert!(first.path.ends_with("2025-03-07/00_Daily_Report.md"));
        publisher.publish_report("# report v2").await.unwrap();
        assert_eq!(std::fs::read_to_string(&first.path).unwrap(), "# report v2");
        assert_eq!(library.standalone.load(Ordering::SeqCst), 1);
        assert_eq!(library.updates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_credentials_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let library = Arc::new(RecordingLibrary {
            auth_fail: true,
            ..RecordingLibrary::default()
        });
        let err = publisher(dir.path(), library).prepare().await.unwrap_err();
        assert!(matches!(err, DigestError::LibraryAuth { .. }));
    }
}
