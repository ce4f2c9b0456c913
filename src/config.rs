//! Configuration types for a digest run.
//!
//! Everything a run needs is carried by [`DigestConfig`]: one
//! [`ProviderConfig`] per remote model (classification/analysis LLM and the
//! OCR model), per-stage worker counts, analysis limits, batching, filter
//! preferences, the local storage root and the reference-library account.
//!
//! Configs are loaded from YAML ([`DigestConfig::from_yaml_file`]) with every
//! field defaulted, or assembled in code through [`DigestConfigBuilder`].
//! Secrets may be left out of the file and supplied by the environment
//! ([`DigestConfig::apply_env`]).

use crate::error::{DigestError, StageError};
use crate::pipeline::executor::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable consulted for `llm.api_key` when the file omits it.
pub const LLM_API_KEY_ENV: &str = "DIGEST_LLM_API_KEY";
/// Environment variable consulted for `ocr.api_key` when the file omits it.
pub const OCR_API_KEY_ENV: &str = "DIGEST_OCR_API_KEY";
/// Environment variable consulted for `library.api_key` when the file omits it.
pub const LIBRARY_API_KEY_ENV: &str = "ZOTERO_API_KEY";

/// Configuration for a full digest run.
///
/// # Example
/// ```rust
/// use paper_digest::DigestConfig;
///
/// let config = DigestConfig::builder()
///     .paper_workers(4)
///     .batch_size(3)
///     .interest("diffusion models, robot learning")
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DigestConfig {
    /// Classification, analysis and batch-synthesis model.
    pub llm: ProviderConfig,

    /// Page-recognition model. Configured independently from `llm` because
    /// grounding OCR models are usually served from a different endpoint.
    pub ocr: ProviderConfig,

    pub download: DownloadConfig,
    pub concurrency: ConcurrencyConfig,
    pub analysis: AnalysisConfig,
    pub batch: BatchConfig,
    pub filter: FilterConfig,
    pub storage: StorageConfig,
    pub library: LibraryConfig,

    /// Publish straight after download: no OCR, analysis or batch tasks are
    /// spawned. Default: false.
    pub skip_deep_analysis: bool,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            llm: ProviderConfig::default(),
            ocr: ProviderConfig::ocr_defaults(),
            download: DownloadConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            analysis: AnalysisConfig::default(),
            batch: BatchConfig::default(),
            filter: FilterConfig::default(),
            storage: StorageConfig::default(),
            library: LibraryConfig::default(),
            skip_deep_analysis: false,
        }
    }
}

/// Connection and retry settings for one model endpoint.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// `edgequake-llm` provider name ("openai", "anthropic", "ollama", …).
    /// Ignored when `base_url` is set. If both are None the provider is
    /// auto-detected from the environment.
    pub provider: Option<String>,

    /// API key for `base_url`. Required whenever `base_url` is set.
    pub api_key: Option<String>,

    /// OpenAI-compatible endpoint root, e.g. `https://api.deepseek.com/v1`.
    pub base_url: Option<String>,

    /// Model identifier.
    pub model: String,

    /// Per-call timeout in seconds. Default: 60 (120 for OCR).
    pub timeout_secs: u64,

    /// Total attempts per call, the first included. Default: 3.
    pub max_retries: u32,

    /// Fixed delay between attempts in milliseconds. Default: 5000.
    pub retry_delay_ms: u64,

    /// Sampling temperature. Default: 0.3 (0.1 for OCR).
    pub temperature: f32,

    /// Completion budget per call. Default: 4096.
    pub max_tokens: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider: None,
            api_key: None,
            base_url: None,
            model: "gpt-4.1-mini".to_string(),
            timeout_secs: 60,
            max_retries: 3,
            retry_delay_ms: 5000,
            temperature: 0.3,
            max_tokens: 4096,
        }
    }
}

impl ProviderConfig {
    /// Defaults tuned for a grounding OCR model.
    pub fn ocr_defaults() -> Self {
        Self {
            model: "deepseek-ocr".to_string(),
            timeout_secs: 120,
            temperature: 0.1,
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Retry policy for calls against this provider: transient errors only.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_delay_ms))
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("provider", &self.provider)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("timeout_secs", &self.timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("retry_delay_ms", &self.retry_delay_ms)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

/// PDF fetch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Per-request timeout in seconds. Default: 60.
    pub timeout_secs: u64,
    /// Total attempts per paper. Default: 3.
    pub max_retries: u32,
    /// Delay between attempts in milliseconds. Default: 2000.
    pub retry_delay_ms: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            max_retries: 3,
            retry_delay_ms: 2000,
        }
    }
}

impl DownloadConfig {
    /// Transient network errors and non-PDF bodies are both retried.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_delay_ms))
            .retry_when(|e| e.is_transient() || matches!(e, StageError::InvalidContent(_)))
    }
}

/// Worker-pool sizes, one per stage.
///
/// Each limit bounds only its own stage, so a slow OCR pool never starves
/// the filter pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Concurrent classification calls. Default: 3.
    pub paper_workers: usize,
    /// Concurrent PDF downloads. Default: 3.
    pub pdf_workers: usize,
    /// Papers under OCR at once. Default: 2.
    pub ocr_workers: usize,
    /// Pages of one paper under OCR at once. Default: 3.
    ///
    /// Effective OCR fan-out is `ocr_workers × page_workers` calls.
    pub page_workers: usize,
    /// Concurrent analysis and batch-synthesis calls. Default: 3.
    pub llm_workers: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            paper_workers: 3,
            pdf_workers: 3,
            ocr_workers: 2,
            page_workers: 3,
            llm_workers: 3,
        }
    }
}

/// OCR and analysis limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Rasterisation DPI. Range: 72–400. Default: 200.
    pub pdf_dpi: u32,

    /// Longest rendered edge in pixels, applied after DPI scaling. Default: 2000.
    ///
    /// Keeps a large-format page from producing an image the OCR endpoint
    /// refuses or that exhausts memory.
    pub max_rendered_pixels: u32,

    /// Pages recognized per paper, from the first. Default: 15.
    pub max_pages: usize,

    /// OCR text handed to analysis is cut to this many characters. Default: 12000.
    pub max_ocr_text_length: usize,

    /// Figures cropped and shown per paper. Default: 4.
    pub max_figures_per_paper: usize,

    /// Write `ocr/page_NNN_vis.png` overlays. Default: false.
    pub save_visualization: bool,

    /// Write cropped figures under `figures/`. Default: true.
    pub save_cropped_figures: bool,

    /// What a local write failure does to the paper. Default: best effort.
    pub artifact_errors: ArtifactErrorPolicy,

    /// Language for translated titles and notes. Default: "English".
    pub note_language: String,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            pdf_dpi: 200,
            max_rendered_pixels: 2000,
            max_pages: 15,
            max_ocr_text_length: 12_000,
            max_figures_per_paper: 4,
            save_visualization: false,
            save_cropped_figures: true,
            artifact_errors: ArtifactErrorPolicy::default(),
            note_language: "English".to_string(),
        }
    }
}

/// Daily-report batching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// When false analyzed papers go straight to the publisher. Default: true.
    pub enabled: bool,
    /// Papers per synthesized section. Default: 5.
    pub batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 5,
        }
    }
}

/// Reader preferences and category reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Free text describing what to keep.
    pub interest: String,
    /// Free text describing what to drop.
    pub ignore: String,
    pub category_policy: CategoryPolicy,
    /// Where strict mode sends proposals with no close match. Default: "Other".
    pub fallback_category: String,
    /// Minimum normalized Levenshtein similarity for a strict match. Default: 0.8.
    pub category_similarity: f64,
    /// Alias → canonical category name.
    pub synonyms: BTreeMap<String, String>,
    /// Categories that exist before the run, in addition to library collections.
    pub known_categories: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            interest: String::new(),
            ignore: String::new(),
            category_policy: CategoryPolicy::default(),
            fallback_category: "Other".to_string(),
            category_similarity: 0.8,
            synonyms: BTreeMap::new(),
            known_categories: Vec::new(),
        }
    }
}

/// Local output tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the date-organized tree. Default: `papers`.
    pub base_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("papers"),
        }
    }
}

/// Reference-library (Zotero) account.
///
/// Publishing to the library is skipped entirely while `library_id` is None.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    pub library_id: Option<String>,
    pub library_type: LibraryType,
    pub api_key: Option<String>,
    /// Collection under which category collections are created.
    pub parent_collection: Option<String>,
    /// API root. Default: `https://api.zotero.org`.
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            library_id: None,
            library_type: LibraryType::default(),
            api_key: None,
            parent_collection: None,
            base_url: "https://api.zotero.org".to_string(),
            timeout_secs: 30,
            max_retries: 3,
            retry_delay_ms: 2000,
        }
    }
}

impl LibraryConfig {
    pub fn is_configured(&self) -> bool {
        self.library_id.is_some()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_delay_ms))
    }
}

impl fmt::Debug for LibraryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryConfig")
            .field("library_id", &self.library_id)
            .field("library_type", &self.library_type)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("parent_collection", &self.parent_collection)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl DigestConfig {
    /// Create a new builder starting from the defaults.
    pub fn builder() -> DigestConfigBuilder {
        DigestConfigBuilder {
            config: Self::default(),
        }
    }

    /// Parse a YAML document. Missing sections fall back to their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    /// Load, fill secrets from the environment and validate.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, DigestError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| DigestError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml_str(&text).map_err(|e| DigestError::ConfigParse {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Fill unset API keys from [`LLM_API_KEY_ENV`], [`OCR_API_KEY_ENV`] and
    /// [`LIBRARY_API_KEY_ENV`].
    pub fn apply_env(&mut self) {
        fill_from_env(&mut self.llm.api_key, LLM_API_KEY_ENV);
        fill_from_env(&mut self.ocr.api_key, OCR_API_KEY_ENV);
        fill_from_env(&mut self.library.api_key, LIBRARY_API_KEY_ENV);
    }

    /// Check everything that would otherwise surface mid-run.
    pub fn validate(&self) -> Result<(), DigestError> {
        let c = &self.concurrency;
        for (name, n) in [
            ("paper_workers", c.paper_workers),
            ("pdf_workers", c.pdf_workers),
            ("ocr_workers", c.ocr_workers),
            ("page_workers", c.page_workers),
            ("llm_workers", c.llm_workers),
        ] {
            if n == 0 {
                return Err(DigestError::InvalidConfig(format!("concurrency.{name} must be ≥ 1")));
            }
        }
        if self.batch.batch_size == 0 {
            return Err(DigestError::InvalidConfig("batch.batch_size must be ≥ 1".into()));
        }
        let a = &self.analysis;
        if !(72..=400).contains(&a.pdf_dpi) {
            return Err(DigestError::InvalidConfig(format!(
                "analysis.pdf_dpi must be 72–400, got {}",
                a.pdf_dpi
            )));
        }
        if a.max_pages == 0 || a.max_ocr_text_length == 0 {
            return Err(DigestError::InvalidConfig(
                "analysis.max_pages and analysis.max_ocr_text_length must be ≥ 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.filter.category_similarity) {
            return Err(DigestError::InvalidConfig(format!(
                "filter.category_similarity must be 0.0–1.0, got {}",
                self.filter.category_similarity
            )));
        }
        if self.filter.fallback_category.trim().is_empty() {
            return Err(DigestError::InvalidConfig("filter.fallback_category must not be empty".into()));
        }
        check_provider("llm", &self.llm, LLM_API_KEY_ENV)?;
        if !self.skip_deep_analysis {
            check_provider("ocr", &self.ocr, OCR_API_KEY_ENV)?;
        }
        if self.library.is_configured() && self.library.api_key.is_none() {
            return Err(DigestError::ProviderNotConfigured {
                provider: "library".into(),
                hint: format!("library.library_id is set but no API key was found.\nSet {LIBRARY_API_KEY_ENV} or library.api_key."),
            });
        }
        Ok(())
    }
}

fn fill_from_env(slot: &mut Option<String>, var: &str) {
    if slot.is_none() {
        *slot = std::env::var(var).ok().filter(|v| !v.trim().is_empty());
    }
}

fn check_provider(name: &str, p: &ProviderConfig, env: &str) -> Result<(), DigestError> {
    if p.base_url.is_some() && p.api_key.is_none() {
        return Err(DigestError::ProviderNotConfigured {
            provider: name.to_string(),
            hint: format!("{name}.base_url is set but no API key was found.\nSet {env} or {name}.api_key."),
        });
    }
    if p.model.trim().is_empty() {
        return Err(DigestError::InvalidConfig(format!("{name}.model must not be empty")));
    }
    if p.max_retries == 0 {
        return Err(DigestError::InvalidConfig(format!("{name}.max_retries must be ≥ 1")));
    }
    Ok(())
}

/// Builder for [`DigestConfig`].
#[derive(Debug)]
pub struct DigestConfigBuilder {
    config: DigestConfig,
}

impl DigestConfigBuilder {
    pub fn llm(mut self, provider: ProviderConfig) -> Self {
        self.config.llm = provider;
        self
    }

    pub fn ocr(mut self, provider: ProviderConfig) -> Self {
        self.config.ocr = provider;
        self
    }

    pub fn paper_workers(mut self, n: usize) -> Self {
        self.config.concurrency.paper_workers = n.max(1);
        self
    }

    pub fn pdf_workers(mut self, n: usize) -> Self {
        self.config.concurrency.pdf_workers = n.max(1);
        self
    }

    pub fn ocr_workers(mut self, n: usize) -> Self {
        self.config.concurrency.ocr_workers = n.max(1);
        self
    }

    pub fn page_workers(mut self, n: usize) -> Self {
        self.config.concurrency.page_workers = n.max(1);
        self
    }

    pub fn llm_workers(mut self, n: usize) -> Self {
        self.config.concurrency.llm_workers = n.max(1);
        self
    }

    pub fn pdf_dpi(mut self, dpi: u32) -> Self {
        self.config.analysis.pdf_dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.analysis.max_rendered_pixels = px.max(100);
        self
    }

    pub fn max_pages(mut self, n: usize) -> Self {
        self.config.analysis.max_pages = n.max(1);
        self
    }

    pub fn max_ocr_text_length(mut self, n: usize) -> Self {
        self.config.analysis.max_ocr_text_length = n.max(1);
        self
    }

    pub fn max_figures_per_paper(mut self, n: usize) -> Self {
        self.config.analysis.max_figures_per_paper = n;
        self
    }

    pub fn save_visualization(mut self, v: bool) -> Self {
        self.config.analysis.save_visualization = v;
        self
    }

    pub fn save_cropped_figures(mut self, v: bool) -> Self {
        self.config.analysis.save_cropped_figures = v;
        self
    }

    pub fn artifact_errors(mut self, policy: ArtifactErrorPolicy) -> Self {
        self.config.analysis.artifact_errors = policy;
        self
    }

    pub fn batching(mut self, enabled: bool) -> Self {
        self.config.batch.enabled = enabled;
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.config.batch.batch_size = n.max(1);
        self
    }

    pub fn interest(mut self, text: impl Into<String>) -> Self {
        self.config.filter.interest = text.into();
        self
    }

    pub fn ignore(mut self, text: impl Into<String>) -> Self {
        self.config.filter.ignore = text.into();
        self
    }

    pub fn category_policy(mut self, policy: CategoryPolicy) -> Self {
        self.config.filter.category_policy = policy;
        self
    }

    pub fn fallback_category(mut self, name: impl Into<String>) -> Self {
        self.config.filter.fallback_category = name.into();
        self
    }

    pub fn category_similarity(mut self, threshold: f64) -> Self {
        self.config.filter.category_similarity = threshold.clamp(0.0, 1.0);
        self
    }

    pub fn synonym(mut self, alias: impl Into<String>, canonical: impl Into<String>) -> Self {
        self.config.filter.synonyms.insert(alias.into(), canonical.into());
        self
    }

    pub fn known_categories<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.filter.known_categories = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.storage.base_dir = dir.into();
        self
    }

    pub fn library(mut self, library: LibraryConfig) -> Self {
        self.config.library = library;
        self
    }

    pub fn download(mut self, download: DownloadConfig) -> Self {
        self.config.download = download;
        self
    }

    pub fn skip_deep_analysis(mut self, v: bool) -> Self {
        self.config.skip_deep_analysis = v;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<DigestConfig, DigestError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// How the category resolver treats a proposal that matches nothing known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryPolicy {
    /// Map to the nearest known category, or the fallback. (default)
    #[default]
    Strict,
    /// Register the proposal as a new category.
    Permissive,
}

/// Consequence of a failed local write during a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactErrorPolicy {
    /// Overlay and figure writes are logged and skipped; required writes
    /// fail the paper without retry. (default)
    #[default]
    BestEffort,
    /// I/O errors are retried under the stage policy.
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LibraryType {
    #[default]
    User,
    Group,
}

impl LibraryType {
    /// URL path segment used by the Zotero API.
    pub fn path_segment(&self) -> &'static str {
        match self {
            LibraryType::User => "users",
            LibraryType::Group => "groups",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_yaml_gives_defaults() {
        let config = DigestConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config.concurrency.paper_workers, 3);
        assert_eq!(config.concurrency.ocr_workers, 2);
        assert_eq!(config.analysis.max_ocr_text_length, 12_000);
        assert_eq!(config.batch.batch_size, 5);
        assert_eq!(config.ocr.timeout_secs, 120);
        assert_eq!(config.llm.timeout_secs, 60);
        assert_eq!(config.storage.base_dir, PathBuf::from("papers"));
    }

    #[test]
    fn yaml_overrides_nested_fields() {
        let yaml = r#"
llm:
  model: deepseek-chat
  base_url: https://api.deepseek.com/v1
  api_key: sk-test
  max_retries: 5
batch:
  batch_size: 2
filter:
  interest: "world models"
  category_policy: permissive
  synonyms:
    RL: Reinforcement Learning
analysis:
  artifact_errors: retry
skip_deep_analysis: true
"#;
        let config = DigestConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.llm.model, "deepseek-chat");
        assert_eq!(config.llm.max_retries, 5);
        assert_eq!(config.llm.timeout_secs, 60);
        assert_eq!(config.batch.batch_size, 2);
        assert!(config.batch.enabled);
        assert_eq!(config.filter.category_policy, CategoryPolicy::Permissive);
        assert_eq!(config.filter.synonyms["RL"], "Reinforcement Learning");
        assert_eq!(config.analysis.artifact_errors, ArtifactErrorPolicy::Retry);
        assert!(config.skip_deep_analysis);
        assert_eq!(config.ocr.model, "deepseek-ocr");
        config.validate().unwrap();
    }

    #[test]
    fn base_url_without_key_is_fatal() {
        let mut config = DigestConfig::default();
        config.llm.base_url = Some("https://example.com/v1".into());
        config.llm.api_key = None;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, DigestError::ProviderNotConfigured { ref provider, .. } if provider == "llm"));
    }

    #[test]
    fn ocr_credentials_not_required_when_skipping_analysis() {
        let mut config = DigestConfig::default();
        config.ocr.base_url = Some("https://ocr.example.com/v1".into());
        config.skip_deep_analysis = true;
        config.validate().unwrap();
    }

    #[test]
    fn zero_batch_size_rejected() {
        let mut config = DigestConfig::default();
        config.batch.batch_size = 0;
        assert!(matches!(config.validate(), Err(DigestError::InvalidConfig(_))));
    }

    #[test]
    fn builder_clamps() {
        let config = DigestConfig::builder()
            .paper_workers(0)
            .pdf_dpi(1000)
            .category_similarity(7.0)
            .build()
            .unwrap();
        assert_eq!(config.concurrency.paper_workers, 1);
        assert_eq!(config.analysis.pdf_dpi, 400);
        assert_eq!(config.filter.category_similarity, 1.0);
    }

    #[test]
    fn debug_redacts_secrets() {
        let mut config = DigestConfig::default();
        config.llm.api_key = Some("sk-very-secret".into());
        config.library.api_key = Some("zot-secret".into());
        let dbg = format!("{config:?}");
        assert!(!dbg.contains("sk-very-secret"));
        assert!(!dbg.contains("zot-secret"));
        assert!(dbg.contains("<redacted>"));
    }

    #[test]
    fn missing_config_file_is_read_error() {
        let err = DigestConfig::from_yaml_file("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, DigestError::ConfigRead { .. }));
    }
}
