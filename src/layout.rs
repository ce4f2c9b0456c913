//! Local output tree for one run.
//!
//! ```text
//! <base_dir>/<YYYY-MM-DD>/
//!   00_Daily_Report.md
//!   <Category>/<FirstAuthor_Title>/
//!     paper.pdf  note.md  analysis.json  figures/  ocr/
//! ```

use crate::error::StageError;
use crate::paper::{sanitize_filename, PaperMeta};
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const REPORT_FILE_NAME: &str = "00_Daily_Report.md";
pub const PDF_FILE_NAME: &str = "paper.pdf";
pub const NOTE_FILE_NAME: &str = "note.md";
pub const ANALYSIS_FILE_NAME: &str = "analysis.json";
pub const FIGURES_DIR: &str = "figures";
pub const OCR_DIR: &str = "ocr";

#[derive(Debug, Clone)]
pub struct StorageLayout {
    base_dir: PathBuf,
    date: NaiveDate,
    /// Paper id → folder name, claimed once per run.
    folders: HashMap<String, String>,
}

impl StorageLayout {
    pub fn new(base_dir: impl Into<PathBuf>, date: NaiveDate) -> Self {
        Self {
            base_dir: base_dir.into(),
            date,
            folders: HashMap::new(),
        }
    }

    /// Claim a folder name for every paper in listing order.
    ///
    /// The first paper keeps its plain `FirstAuthor_Title`; a later paper
    /// whose name is already taken gets `_<id>` appended. Names are claimed
    /// across categories, so the outcome depends only on the listing order.
    pub fn with_papers<'a>(mut self, papers: impl IntoIterator<Item = &'a PaperMeta>) -> Self {
        let mut taken = HashSet::new();
        for meta in papers {
            if self.folders.contains_key(&meta.id) {
                continue;
            }
            let mut name = meta.folder_name();
            if !taken.insert(name.clone()) {
                name = format!("{}_{}", name, sanitize_filename(&meta.id));
                taken.insert(name.clone());
            }
            self.folders.insert(meta.id.clone(), name);
        }
        self
    }

    /// Folder name claimed for `meta`, or its plain name when unclaimed.
    pub fn folder_name(&self, meta: &PaperMeta) -> String {
        self.folders.get(&meta.id).cloned().unwrap_or_else(|| meta.folder_name())
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn run_dir(&self) -> PathBuf {
        self.base_dir.join(self.date.format("%Y-%m-%d").to_string())
    }

    pub fn report_path(&self) -> PathBuf {
        self.run_dir().join(REPORT_FILE_NAME)
    }

    pub fn paper_dir(&self, category: &str, meta: &PaperMeta) -> PathBuf {
        let category = sanitize_filename(category);
        let category = if category.is_empty() { "Other".to_string() } else { category };
        self.run_dir().join(category).join(self.folder_name(meta))
    }

    /// `path` relative to the run directory, `/`-separated, for report links.
    pub fn relative_link(&self, path: &Path) -> String {
        let run_dir = self.run_dir();
        let rel = path.strip_prefix(&run_dir).unwrap_or(path);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Write `bytes` to `path` via a temp file in the same directory and a rename,
/// so readers never observe a half-written file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StageError> {
    persist_atomic(path, bytes).map_err(|e| StageError::io(path, &e))
}

pub(crate) fn persist_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// [`write_atomic`] on the blocking pool.
pub async fn write_atomic_async(path: PathBuf, bytes: Vec<u8>) -> Result<(), StageError> {
    tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
        .await
        .map_err(|e| StageError::Internal(format!("write task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> StorageLayout {
        StorageLayout::new("papers", NaiveDate::from_ymd_opt(2025, 3, 7).unwrap())
    }

    #[test]
    fn paths_follow_date_category_paper() {
        let meta = PaperMeta::new("2503.00001", "Tiny Title").with_authors(["Ann Lee"]);
        let l = layout();
        assert_eq!(l.report_path(), PathBuf::from("papers/2025-03-07/00_Daily_Report.md"));
        assert_eq!(
            l.paper_dir("Computer Vision", &meta),
            PathBuf::from("papers/2025-03-07/Computer_Vision/Ann_Lee_Tiny_Title")
        );
    }

    #[test]
    fn colliding_folder_names_get_the_id_appended() {
        let one = PaperMeta::new("2503.00011", "Robot Learning Benchmarks for Manipulation Part One")
            .with_authors(["Ann Lee"]);
        let two = PaperMeta::new("2503.00012", "Robot Learning Benchmarks for Manipulation Part Two")
            .with_authors(["Ann Lee"]);
        assert_eq!(one.folder_name(), two.folder_name());

        let l = layout().with_papers([&one, &two]);
        let first = l.paper_dir("Robotics", &one);
        let second = l.paper_dir("Robotics", &two);
        assert_ne!(first, second);
        assert_eq!(first.file_name().unwrap(), one.folder_name().as_str());
        assert_eq!(
            second.file_name().unwrap().to_string_lossy(),
            format!("{}_2503.00012", two.folder_name())
        );

        // Same listing, same names.
        let again = layout().with_papers([&one, &two]);
        assert_eq!(again.paper_dir("Robotics", &two), second);
    }

    #[test]
    fn relative_link_strips_run_dir() {
        let l = layout();
        let p = l.run_dir().join("Cat").join("A_B").join("note.md");
        assert_eq!(l.relative_link(&p), "Cat/A_B/note.md");
    }

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub").join("note.md");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }
}
